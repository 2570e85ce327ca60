//! Controller fake for tests
//!
//! Hands out livestream sources backed by in-memory channels the test holds
//! the sending half of, so media can be injected without a controller.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{BridgeError, Result};

use super::client::ControllerApi;
use super::types::{LivestreamRequest, LivestreamSource};

pub struct FakeApi {
    pub streams_created: AtomicUsize,
    pub senders: Mutex<Vec<mpsc::Sender<Bytes>>>,
    pub online: AtomicBool,
    pub fail_create: AtomicBool,
    pub snapshot_response: Mutex<Option<Bytes>>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            streams_created: AtomicUsize::new(0),
            senders: Mutex::new(Vec::new()),
            online: AtomicBool::new(true),
            fail_create: AtomicBool::new(false),
            snapshot_response: Mutex::new(None),
        })
    }

    /// The sender feeding the most recently created livestream
    pub fn latest_sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.senders.lock().last().cloned()
    }
}

#[async_trait]
impl ControllerApi for FakeApi {
    async fn create_livestream(&self, _req: &LivestreamRequest) -> Result<LivestreamSource> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(BridgeError::Api("stream refused".to_string()));
        }
        self.streams_created.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(32);
        self.senders.lock().push(tx);
        Ok(LivestreamSource::from_channel(rx))
    }

    async fn snapshot(&self, _camera_id: &str) -> Result<Bytes> {
        self.snapshot_response
            .lock()
            .clone()
            .ok_or_else(|| BridgeError::Api("no snapshot".to_string()))
    }

    async fn is_camera_online(&self, _camera_id: &str) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn set_camera(&self, _camera_id: &str, _patch: serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// A stream profile fixture
pub fn test_entry() -> super::types::RtspEntry {
    super::types::RtspEntry {
        camera_id: "cam1".to_string(),
        channel_id: 0,
        lens: None,
        width: 1920,
        height: 1080,
        fps: 30,
        url: "rtsp://nvr.local/cam1".to_string(),
    }
}

/// Build one container box for media fixtures
pub fn test_box(box_type: &[u8; 4], payload: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&((8 + payload.len()) as u32).to_be_bytes());
    out.extend_from_slice(box_type);
    out.extend_from_slice(payload);
    Bytes::from(out)
}
