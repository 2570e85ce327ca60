//! Controller REST and livestream client

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ControllerConfig;
use crate::error::{BridgeError, Result};

use super::types::{LivestreamRequest, LivestreamSource};

/// Buffered livestream chunks between the socket task and the consumer
const LIVESTREAM_CHANNEL_CAPACITY: usize = 64;

/// Controller operations the core pipeline depends on
#[async_trait]
pub trait ControllerApi: Send + Sync {
    /// Open a push livestream for one camera channel
    async fn create_livestream(&self, req: &LivestreamRequest) -> Result<LivestreamSource>;

    /// Fetch a still image from the controller
    async fn snapshot(&self, camera_id: &str) -> Result<Bytes>;

    /// Whether the controller currently reports the camera as connected
    async fn is_camera_online(&self, camera_id: &str) -> bool;

    /// Patch device settings on the controller
    async fn set_camera(&self, camera_id: &str, patch: serde_json::Value) -> Result<()>;
}

/// Controller client over HTTPS and websockets
pub struct ProtectClient {
    http: reqwest::Client,
    address: String,
    api_key: String,
}

impl ProtectClient {
    pub fn new(config: &ControllerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            address: config.address.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("https://{}/proxy/protect/api/{}", self.address, path)
    }

    fn ws_url(&self, path: &str) -> String {
        format!("wss://{}/proxy/protect/ws/{}", self.address, path)
    }
}

#[async_trait]
impl ControllerApi for ProtectClient {
    async fn create_livestream(&self, req: &LivestreamRequest) -> Result<LivestreamSource> {
        let mut url = format!(
            "{}?camera={}&channel={}&fragmentDurationMillis={}",
            self.ws_url("livestream"),
            req.camera_id,
            req.channel_id,
            req.segment_length_ms
        );
        if let Some(lens) = req.lens {
            url.push_str(&format!("&lens={}", lens));
        }

        let mut request = url.as_str().into_client_request()?;
        if let Ok(value) = HeaderValue::from_str(&self.api_key) {
            request.headers_mut().insert("X-API-KEY", value);
        }
        let (mut ws, _) = connect_async(request).await?;

        let (tx, rx) = mpsc::channel(LIVESTREAM_CHANNEL_CAPACITY);
        let stop = CancellationToken::new();
        let task_stop = stop.clone();
        let camera_id = req.camera_id.clone();

        // Pump binary socket frames into the byte channel. Dropping the
        // sender on any exit path closes the stream for the consumer.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_stop.cancelled() => {
                        let _ = ws.close(None).await;
                        break;
                    }
                    msg = ws.next() => {
                        match msg {
                            Some(Ok(Message::Binary(chunk))) => {
                                if tx.send(Bytes::from(chunk)).await.is_err() {
                                    // Consumer went away
                                    let _ = ws.close(None).await;
                                    break;
                                }
                            }
                            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                            Some(Ok(Message::Text(_))) => {}
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Livestream socket for {} closed", camera_id);
                                break;
                            }
                            Some(Err(e)) => {
                                warn!("Livestream socket error for {}: {}", camera_id, e);
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(LivestreamSource { bytes: rx, stop })
    }

    async fn snapshot(&self, camera_id: &str) -> Result<Bytes> {
        let response = self
            .http
            .get(self.api_url(&format!("cameras/{}/snapshot", camera_id)))
            .header("X-API-KEY", &self.api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BridgeError::Api(format!(
                "snapshot for {} failed with status {}",
                camera_id,
                response.status()
            )));
        }
        Ok(response.bytes().await?)
    }

    async fn is_camera_online(&self, camera_id: &str) -> bool {
        let result = self
            .http
            .get(self.api_url(&format!("cameras/{}", camera_id)))
            .header("X-API-KEY", &self.api_key)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                match response.json::<serde_json::Value>().await {
                    Ok(body) => body["state"] == "CONNECTED",
                    Err(_) => false,
                }
            }
            _ => false,
        }
    }

    async fn set_camera(&self, camera_id: &str, patch: serde_json::Value) -> Result<()> {
        let response = self
            .http
            .patch(self.api_url(&format!("cameras/{}", camera_id)))
            .header("X-API-KEY", &self.api_key)
            .json(&patch)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BridgeError::Api(format!(
                "camera patch for {} failed with status {}",
                camera_id,
                response.status()
            )));
        }
        Ok(())
    }
}
