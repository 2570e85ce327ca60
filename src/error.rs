use thiserror::Error;

use crate::protocol::FrameError;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Controller API error: {0}")]
    Api(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Update protocol error: {0}")]
    Protocol(#[from] FrameError),

    #[error("Transcoder error: {0}")]
    Process(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("No UDP port available")]
    PortsExhausted,
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
