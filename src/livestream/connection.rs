//! Pooled livestream handles and the socket pump
//!
//! One `LivestreamHandle` exists per `(camera, channel, lens)` key. The
//! handle fans segments out over a broadcast channel and tracks the state
//! the restart logic needs: the current init segment, the subscriber count,
//! and the re-entrancy guard for restarts.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::api::{LivestreamSource, RtspEntry};
use crate::ffmpeg::{Fmp4Parser, SegmentAssembler};

/// Fan-out capacity per livestream
const SEGMENT_CHANNEL_CAPACITY: usize = 64;

/// Identity of one pooled livestream
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LivestreamKey {
    pub camera_id: String,
    pub channel_id: u8,
    pub lens: Option<u8>,
}

impl LivestreamKey {
    pub fn from_entry(entry: &RtspEntry) -> Self {
        Self {
            camera_id: entry.camera_id.clone(),
            channel_id: entry.channel_id,
            lens: entry.lens,
        }
    }
}

impl std::fmt::Display for LivestreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.lens {
            Some(lens) => write!(f, "{}:{}:{}", self.camera_id, self.channel_id, lens),
            None => write!(f, "{}:{}", self.camera_id, self.channel_id),
        }
    }
}

/// Segment fan-out event
#[derive(Debug, Clone)]
pub enum SegmentEvent {
    /// The stream's initialization segment (ftyp+moov)
    Init(Bytes),
    /// One media segment (moof+mdat)
    Media(Bytes),
    /// The stream is gone and will not be restarted
    Closed,
}

/// Why the pump for one connection attempt returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpEnd {
    /// The owner cancelled the stream
    Cancelled,
    /// The controller closed the socket
    Closed,
    /// No segment within the stale window
    Stale,
    /// A consumer forced a restart
    Forced,
}

/// Shared state for one pooled livestream
pub struct LivestreamHandle {
    pub(crate) key: LivestreamKey,
    subscribers: AtomicUsize,
    seg_tx: broadcast::Sender<SegmentEvent>,
    init_segment: Mutex<Option<Bytes>>,
    /// At most one restart may be in flight per key
    restarting: AtomicBool,
    restart_attempts: AtomicU32,
    force_restart: Notify,
    /// Cancels the running stream loop
    pub(crate) cancel: Mutex<Option<CancellationToken>>,
}

impl LivestreamHandle {
    pub(crate) fn new(key: LivestreamKey) -> Self {
        let (seg_tx, _) = broadcast::channel(SEGMENT_CHANNEL_CAPACITY);
        Self {
            key,
            subscribers: AtomicUsize::new(0),
            seg_tx,
            init_segment: Mutex::new(None),
            restarting: AtomicBool::new(false),
            restart_attempts: AtomicU32::new(0),
            force_restart: Notify::new(),
            cancel: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &LivestreamKey {
        &self.key
    }

    /// Subscribe to segment events
    pub fn subscribe(&self) -> broadcast::Receiver<SegmentEvent> {
        self.seg_tx.subscribe()
    }

    /// The most recent initialization segment, if one has arrived
    pub fn init_segment(&self) -> Option<Bytes> {
        self.init_segment.lock().clone()
    }

    /// Wait for an initialization segment, bounded by `timeout`
    pub async fn wait_init(&self, timeout: Duration) -> Option<Bytes> {
        let mut rx = self.subscribe();
        if let Some(init) = self.init_segment() {
            return Some(init);
        }
        tokio::time::timeout(timeout, async {
            loop {
                match rx.recv().await {
                    Ok(SegmentEvent::Init(init)) => return Some(init),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(init) = self.init_segment() {
                            return Some(init);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Whether a restart is currently in flight
    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    /// Ask the stream loop to tear down and reconnect
    ///
    /// A restart already in flight swallows the request.
    pub fn request_restart(&self) -> bool {
        if self.restarting.load(Ordering::SeqCst) {
            debug!("Restart already in flight for {}, swallowing", self.key);
            return false;
        }
        self.force_restart.notify_one();
        true
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    pub(crate) fn add_subscriber(&self) -> usize {
        self.subscribers.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn remove_subscriber(&self) -> usize {
        let previous = self.subscribers.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0);
        previous - 1
    }

    pub(crate) fn set_restarting(&self, value: bool) {
        self.restarting.store(value, Ordering::SeqCst);
        if value {
            self.restart_attempts.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn restart_attempts(&self) -> u32 {
        self.restart_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_stream_state(&self) {
        *self.init_segment.lock() = None;
    }

    pub(crate) fn emit_closed(&self) {
        let _ = self.seg_tx.send(SegmentEvent::Closed);
    }

    /// Pump one connection attempt until it ends
    ///
    /// Parses the raw byte stream into segments as they arrive and fans them
    /// out. The stale timer re-arms on every received chunk.
    pub(crate) async fn pump(
        &self,
        mut source: LivestreamSource,
        stale_timeout: Duration,
        cancel: &CancellationToken,
    ) -> PumpEnd {
        let mut parser = Fmp4Parser::new();
        let mut assembler = SegmentAssembler::new();

        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => break PumpEnd::Cancelled,
                _ = self.force_restart.notified() => break PumpEnd::Forced,
                chunk = tokio::time::timeout(stale_timeout, source.bytes.recv()) => {
                    match chunk {
                        Ok(Some(chunk)) => {
                            if !self.ingest(&mut parser, &mut assembler, &chunk) {
                                break PumpEnd::Closed;
                            }
                        }
                        Ok(None) => break PumpEnd::Closed,
                        Err(_) => break PumpEnd::Stale,
                    }
                }
            }
        };

        source.stop.cancel();
        end
    }

    /// Parse one chunk; returns false when the stream is unrecoverable
    fn ingest(
        &self,
        parser: &mut Fmp4Parser,
        assembler: &mut SegmentAssembler,
        chunk: &[u8],
    ) -> bool {
        let boxes = match parser.push(chunk) {
            Ok(boxes) => boxes,
            Err(e) => {
                debug!("Livestream {} sent an unparseable stream: {}", self.key, e);
                return false;
            }
        };
        for media_box in &boxes {
            let is_init = &media_box.box_type == b"moov";
            if let Some(segment) = assembler.push_box(media_box) {
                trace!(
                    "Livestream {} segment: {} bytes ({})",
                    self.key,
                    segment.len(),
                    media_box.type_str()
                );
                if is_init {
                    *self.init_segment.lock() = Some(segment.clone());
                    let _ = self.seg_tx.send(SegmentEvent::Init(segment));
                } else {
                    let _ = self.seg_tx.send(SegmentEvent::Media(segment));
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn make_box(box_type: &[u8; 4], payload: &[u8]) -> Bytes {
        let mut out = Vec::new();
        out.extend_from_slice(&((8 + payload.len()) as u32).to_be_bytes());
        out.extend_from_slice(box_type);
        out.extend_from_slice(payload);
        Bytes::from(out)
    }

    fn test_key() -> LivestreamKey {
        LivestreamKey {
            camera_id: "cam1".to_string(),
            channel_id: 0,
            lens: None,
        }
    }

    #[tokio::test]
    async fn test_pump_emits_init_then_media() {
        let handle = LivestreamHandle::new(test_key());
        let mut rx = handle.subscribe();
        let (tx, source_rx) = mpsc::channel(8);
        let source = LivestreamSource::from_channel(source_rx);
        let cancel = CancellationToken::new();

        tx.send(make_box(b"ftyp", b"isom")).await.unwrap();
        tx.send(make_box(b"moov", &[1u8; 16])).await.unwrap();
        tx.send(make_box(b"moof", &[2u8; 8])).await.unwrap();
        tx.send(make_box(b"mdat", &[3u8; 32])).await.unwrap();
        drop(tx);

        let end = handle.pump(source, Duration::from_secs(1), &cancel).await;
        assert_eq!(end, PumpEnd::Closed);

        assert!(matches!(rx.recv().await.unwrap(), SegmentEvent::Init(_)));
        assert!(matches!(rx.recv().await.unwrap(), SegmentEvent::Media(_)));
        assert!(handle.init_segment().is_some());
    }

    #[tokio::test]
    async fn test_pump_reports_stale_on_silence() {
        let handle = LivestreamHandle::new(test_key());
        let (_tx, source_rx) = mpsc::channel::<Bytes>(1);
        let source = LivestreamSource::from_channel(source_rx);
        let cancel = CancellationToken::new();

        let end = handle.pump(source, Duration::from_millis(50), &cancel).await;
        assert_eq!(end, PumpEnd::Stale);
    }

    #[tokio::test]
    async fn test_pump_honors_cancellation() {
        let handle = LivestreamHandle::new(test_key());
        let (_tx, source_rx) = mpsc::channel::<Bytes>(1);
        let source = LivestreamSource::from_channel(source_rx);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let end = handle.pump(source, Duration::from_secs(5), &cancel).await;
        assert_eq!(end, PumpEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_restart_guard_swallows_duplicates() {
        let handle = LivestreamHandle::new(test_key());
        assert!(handle.request_restart());
        handle.set_restarting(true);
        assert!(!handle.request_restart());
        handle.set_restarting(false);
        assert!(handle.request_restart());
    }

    #[tokio::test]
    async fn test_wait_init_times_out_without_stream() {
        let handle = LivestreamHandle::new(test_key());
        assert!(handle.wait_init(Duration::from_millis(50)).await.is_none());
    }
}
