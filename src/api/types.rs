//! Controller-facing data types

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One selectable stream profile on a camera
///
/// Owned by the device abstraction; the core consumes it read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtspEntry {
    /// Camera the profile belongs to
    pub camera_id: String,
    /// Stream channel on the camera
    pub channel_id: u8,
    /// Lens selector for multi-lens devices
    pub lens: Option<u8>,
    /// Horizontal resolution
    pub width: u32,
    /// Vertical resolution
    pub height: u32,
    /// Frame rate
    pub fps: u32,
    /// RTSP url for pull-based consumers
    pub url: String,
}

/// Parameters for starting a controller livestream
#[derive(Debug, Clone)]
pub struct LivestreamRequest {
    pub camera_id: String,
    pub channel_id: u8,
    pub lens: Option<u8>,
    /// Requested fragment duration in milliseconds
    pub segment_length_ms: u64,
}

/// A live controller stream of raw fragmented-media bytes
///
/// The byte channel closes when the controller ends the stream or `stop`
/// is cancelled, whichever comes first.
pub struct LivestreamSource {
    /// Raw fMP4 bytes as pushed by the controller
    pub bytes: mpsc::Receiver<Bytes>,
    /// Cancels the underlying socket task
    pub stop: CancellationToken,
}

impl LivestreamSource {
    /// Build a source from a pre-filled channel, for tests and fakes
    pub fn from_channel(bytes: mpsc::Receiver<Bytes>) -> Self {
        Self {
            bytes,
            stop: CancellationToken::new(),
        }
    }
}
