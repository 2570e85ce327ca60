//! Timeshift ring buffer
//!
//! Keeps the last few seconds of a livestream in memory so an event
//! recording can start *before* the moment the motion event fired. The
//! buffer keeps maintaining itself while it is also streaming to a
//! consumer; transmission is a mode, not a different lifecycle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::RtspEntry;
use crate::config::TimeshiftConfig;
use crate::livestream::{LivestreamHandle, LivestreamManager, SegmentEvent};

/// Transmit channel capacity between the buffer and its consumer
const TRANSMIT_CHANNEL_CAPACITY: usize = 64;

/// Segment length floor in milliseconds
const MIN_SEGMENT_LENGTH_MS: u64 = 100;

/// Segment length ceiling in milliseconds
const MAX_SEGMENT_LENGTH_MS: u64 = 1500;

struct ActiveState {
    entry: RtspEntry,
    handle: Arc<LivestreamHandle>,
    ingest: JoinHandle<()>,
}

/// Bounded rewind window over one livestream
pub struct TimeshiftBuffer {
    manager: Arc<LivestreamManager>,
    init_wait: Duration,

    /// Effective livestream segment length, clamped at start
    segment_length_ms: AtomicU64,
    /// Requested rewind window
    configured_duration_ms: AtomicU64,
    /// Ring capacity derived from duration and segment length; shared with
    /// the ingest task
    segment_count: Arc<AtomicUsize>,

    state: Mutex<Option<ActiveState>>,
    /// Last profile this buffer was configured for, so transmit can lazily start
    configured: Mutex<Option<(RtspEntry, u64)>>,

    buffer: Arc<Mutex<VecDeque<Bytes>>>,
    init_segment: Arc<Mutex<Option<Bytes>>>,
    transmitting: Arc<AtomicBool>,
    consumer_tx: Arc<Mutex<Option<mpsc::Sender<Bytes>>>>,
}

impl TimeshiftBuffer {
    pub fn new(
        manager: Arc<LivestreamManager>,
        config: &TimeshiftConfig,
        init_wait: Duration,
    ) -> Arc<Self> {
        let buffer = Arc::new(Self {
            manager,
            init_wait,
            segment_length_ms: AtomicU64::new(config.segment_length_ms.max(1)),
            configured_duration_ms: AtomicU64::new(config.buffer_duration_ms),
            segment_count: Arc::new(AtomicUsize::new(1)),
            state: Mutex::new(None),
            configured: Mutex::new(None),
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            init_segment: Arc::new(Mutex::new(None)),
            transmitting: Arc::new(AtomicBool::new(false)),
            consumer_tx: Arc::new(Mutex::new(None)),
        });
        buffer.recompute_segment_count();
        buffer
    }

    /// Start buffering this stream profile
    ///
    /// `recording_fragment_ms` is the negotiated recording fragment length;
    /// the livestream segment length must stay at or below half of it so a
    /// recording fragment always spans whole buffered segments. Failure on
    /// any step cleans up fully and returns `false`.
    pub async fn start(&self, entry: &RtspEntry, recording_fragment_ms: u64) -> bool {
        self.stop().await;

        let mut segment_length = self.segment_length_ms.load(Ordering::SeqCst);
        if segment_length < MIN_SEGMENT_LENGTH_MS
            || segment_length > MAX_SEGMENT_LENGTH_MS
            || (recording_fragment_ms > 0 && segment_length > recording_fragment_ms / 2)
        {
            warn!(
                "Segment length {}ms is unusable with {}ms recording fragments, \
                 resetting to {}ms",
                segment_length, recording_fragment_ms, MIN_SEGMENT_LENGTH_MS
            );
            segment_length = MIN_SEGMENT_LENGTH_MS;
        }
        self.segment_length_ms.store(segment_length, Ordering::SeqCst);
        self.recompute_segment_count();
        *self.configured.lock() = Some((entry.clone(), recording_fragment_ms));

        let handle = self.manager.acquire(entry);
        // Subscribe before starting so no early segment is missed
        let events = handle.subscribe();

        if !self.manager.start(entry, segment_length).await {
            debug!("Timeshift start failed: livestream would not start");
            return false;
        }

        let Some(init) = handle.wait_init(self.init_wait).await else {
            warn!(
                "Timeshift start failed: no init segment within {:?}",
                self.init_wait
            );
            self.manager.stop(entry).await;
            return false;
        };
        *self.init_segment.lock() = Some(init);

        let ingest = self.spawn_ingest(events);
        *self.state.lock() = Some(ActiveState {
            entry: entry.clone(),
            handle,
            ingest,
        });
        info!(
            "Timeshift buffer running: {} segment(s) of {}ms",
            self.segment_count.load(Ordering::SeqCst),
            segment_length
        );
        true
    }

    /// Stop buffering and release the livestream subscription
    pub async fn stop(&self) {
        let state = self.state.lock().take();
        if let Some(state) = state {
            state.ingest.abort();
            self.manager.stop(&state.entry).await;
        }
        self.transmitting.store(false, Ordering::SeqCst);
        self.consumer_tx.lock().take();
        self.buffer.lock().clear();
        self.init_segment.lock().take();
    }

    /// Begin streaming to a consumer
    ///
    /// Starts the buffer first if needed. The first message on the returned
    /// channel is the init segment plus everything currently buffered,
    /// concatenated, to minimize the consumer's time to first frame. Live
    /// segments follow as they arrive.
    pub async fn transmit_start(&self) -> Option<mpsc::Receiver<Bytes>> {
        if self.state.lock().is_none() {
            let configured = self.configured.lock().clone();
            let Some((entry, fragment_ms)) = configured else {
                debug!("Transmit requested before the buffer was ever configured");
                return None;
            };
            if !self.start(&entry, fragment_ms).await {
                return None;
            }
        }

        let burst = self.assemble(None)?;
        let (tx, rx) = mpsc::channel(TRANSMIT_CHANNEL_CAPACITY);
        if tx.try_send(burst).is_err() {
            return None;
        }
        *self.consumer_tx.lock() = Some(tx);
        self.transmitting.store(true, Ordering::SeqCst);
        Some(rx)
    }

    /// Stop streaming; buffer maintenance continues uninterrupted
    pub fn transmit_stop(&self) {
        self.transmitting.store(false, Ordering::SeqCst);
        self.consumer_tx.lock().take();
    }

    /// Init segment plus roughly the last `duration_ms` of buffered media
    ///
    /// Returns the whole buffer when the request exceeds it, `None` when no
    /// init segment has arrived yet.
    pub fn get_last(&self, duration_ms: u64) -> Option<Bytes> {
        let segment_length = self.segment_length_ms.load(Ordering::SeqCst).max(1);
        let wanted = ((duration_ms + segment_length - 1) / segment_length).max(1) as usize;
        self.assemble(Some(wanted))
    }

    /// Drop the buffered window and force the livestream to reconnect
    ///
    /// Recovery itself is the manager's job; a restart already in flight
    /// swallows this request.
    pub fn restart(&self) {
        self.buffer.lock().clear();
        if let Some(state) = self.state.lock().as_ref() {
            state.handle.request_restart();
        }
    }

    /// Change the rewind window, recomputing the ring capacity
    pub fn set_configured_duration(&self, duration_ms: u64) {
        self.configured_duration_ms.store(duration_ms, Ordering::SeqCst);
        self.recompute_segment_count();
    }

    /// The effective rewind window
    pub fn configured_duration(&self) -> u64 {
        self.segment_count.load(Ordering::SeqCst) as u64
            * self.segment_length_ms.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().is_some()
    }

    pub fn is_transmitting(&self) -> bool {
        self.transmitting.load(Ordering::SeqCst)
    }

    /// Whether the underlying livestream is mid-restart
    pub fn is_restarting(&self) -> bool {
        self.state
            .lock()
            .as_ref()
            .map(|s| s.handle.is_restarting())
            .unwrap_or(false)
    }

    /// Number of buffered media segments
    pub fn buffered_segments(&self) -> usize {
        self.buffer.lock().len()
    }

    fn recompute_segment_count(&self) {
        let segment_length = self.segment_length_ms.load(Ordering::SeqCst).max(1);
        let duration = self.configured_duration_ms.load(Ordering::SeqCst);
        let count = ((duration / segment_length).max(1)) as usize;
        self.segment_count.store(count, Ordering::SeqCst);
        // Shrink immediately if the ring got smaller
        let mut buffer = self.buffer.lock();
        while buffer.len() > count {
            buffer.pop_front();
        }
    }

    /// Concatenate init plus the newest `limit` segments (all when `None`)
    fn assemble(&self, limit: Option<usize>) -> Option<Bytes> {
        let init = self.init_segment.lock().clone()?;
        let buffer = self.buffer.lock();
        let skip = match limit {
            Some(limit) if buffer.len() > limit => buffer.len() - limit,
            _ => 0,
        };
        let mut out = BytesMut::with_capacity(
            init.len() + buffer.iter().skip(skip).map(Bytes::len).sum::<usize>(),
        );
        out.extend_from_slice(&init);
        for segment in buffer.iter().skip(skip) {
            out.extend_from_slice(segment);
        }
        Some(out.freeze())
    }

    /// Consume livestream events: maintain the ring, forward when transmitting
    fn spawn_ingest(&self, mut events: broadcast::Receiver<SegmentEvent>) -> JoinHandle<()> {
        let buffer = self.buffer.clone();
        let init_segment = self.init_segment.clone();
        let transmitting = self.transmitting.clone();
        let consumer_tx = self.consumer_tx.clone();
        let segment_count = self.segment_count.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SegmentEvent::Init(init)) => {
                        // A restart produced a fresh stream; later media
                        // belongs to this init
                        *init_segment.lock() = Some(init);
                    }
                    Ok(SegmentEvent::Media(segment)) => {
                        {
                            let mut buffer = buffer.lock();
                            buffer.push_back(segment.clone());
                            let cap = segment_count.load(Ordering::SeqCst);
                            while buffer.len() > cap {
                                buffer.pop_front();
                            }
                        }
                        // The buffer never stops maintaining itself just
                        // because it is also streaming
                        if transmitting.load(Ordering::SeqCst) {
                            let tx = consumer_tx.lock().clone();
                            if let Some(tx) = tx {
                                match tx.try_send(segment) {
                                    Ok(()) => {}
                                    Err(mpsc::error::TrySendError::Full(_)) => {
                                        warn!(
                                            "Timeshift consumer is falling behind, dropping a segment"
                                        );
                                    }
                                    Err(mpsc::error::TrySendError::Closed(_)) => {
                                        transmitting.store(false, Ordering::SeqCst);
                                        consumer_tx.lock().take();
                                    }
                                }
                            }
                        }
                    }
                    Ok(SegmentEvent::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Timeshift ingest lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{test_box, test_entry, FakeApi};
    use crate::config::LivestreamConfig;

    fn test_config(segment_length_ms: u64, buffer_duration_ms: u64) -> TimeshiftConfig {
        TimeshiftConfig {
            segment_length_ms,
            buffer_duration_ms,
        }
    }

    async fn started_buffer(
        config: TimeshiftConfig,
    ) -> (Arc<TimeshiftBuffer>, tokio::sync::mpsc::Sender<Bytes>) {
        let api = FakeApi::new();
        let manager = LivestreamManager::new(api.clone(), LivestreamConfig::default());
        let buffer = TimeshiftBuffer::new(manager, &config, Duration::from_secs(2));

        let entry = test_entry();
        let start = buffer.start(&entry, 4000);

        // Feed the init pair while start is waiting for it
        let feed = async {
            let sender = loop {
                if let Some(sender) = api.latest_sender() {
                    break sender;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            };
            sender.send(test_box(b"ftyp", b"isom")).await.unwrap();
            sender.send(test_box(b"moov", &[1u8; 16])).await.unwrap();
            sender
        };

        let (started, sender) = tokio::join!(start, feed);
        assert!(started);
        (buffer, sender)
    }

    async fn push_media(sender: &tokio::sync::mpsc::Sender<Bytes>, marker: u8) {
        sender.send(test_box(b"moof", &[marker; 8])).await.unwrap();
        sender.send(test_box(b"mdat", &[marker; 24])).await.unwrap();
    }

    async fn wait_for_segments(buffer: &TimeshiftBuffer, at_least: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if buffer.buffered_segments() >= at_least {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("segments should arrive");
    }

    #[tokio::test]
    async fn test_ring_evicts_oldest_beyond_capacity() {
        // 3 segments of 100ms
        let (buffer, sender) = started_buffer(test_config(100, 300)).await;

        for marker in 1..=5u8 {
            push_media(&sender, marker).await;
        }
        // Eviction means we can only observe the steady state
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(buffer.buffered_segments(), 3);

        // FIFO preserved: the assembled tail ends with the newest marker
        let all = buffer.get_last(10_000).unwrap();
        assert_eq!(all[all.len() - 1], 5);
        buffer.stop().await;
    }

    #[tokio::test]
    async fn test_get_last_is_a_suffix_of_the_full_buffer() {
        let (buffer, sender) = started_buffer(test_config(100, 400)).await;
        for marker in 1..=4u8 {
            push_media(&sender, marker).await;
        }
        wait_for_segments(&buffer, 4).await;

        let full = buffer.get_last(10_000).unwrap();
        let tail = buffer.get_last(200).unwrap();
        let init = buffer.init_segment.lock().clone().unwrap();

        // Both start with the init segment
        assert_eq!(&full[..init.len()], &init[..]);
        assert_eq!(&tail[..init.len()], &init[..]);

        // The tail's media portion is a strict suffix of the full media
        let full_media = &full[init.len()..];
        let tail_media = &tail[init.len()..];
        assert!(tail_media.len() < full_media.len());
        assert_eq!(&full_media[full_media.len() - tail_media.len()..], tail_media);
        buffer.stop().await;
    }

    #[tokio::test]
    async fn test_get_last_requires_init_segment() {
        let api = FakeApi::new();
        let manager = LivestreamManager::new(api, LivestreamConfig::default());
        let buffer = TimeshiftBuffer::new(manager, &test_config(100, 400), Duration::from_millis(50));
        assert!(buffer.get_last(1000).is_none());
    }

    #[tokio::test]
    async fn test_transmit_burst_then_live_forwarding() {
        let (buffer, sender) = started_buffer(test_config(100, 400)).await;
        push_media(&sender, 1).await;
        push_media(&sender, 2).await;
        wait_for_segments(&buffer, 2).await;

        let mut rx = buffer.transmit_start().await.unwrap();
        assert!(buffer.is_transmitting());

        // First message: init + both buffered segments in one shot
        let burst = rx.recv().await.unwrap();
        let expected = buffer.get_last(10_000).unwrap();
        assert_eq!(burst, expected);

        // Live segments keep flowing while the buffer also retains them
        push_media(&sender, 3).await;
        let live = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(live[live.len() - 1], 3);
        wait_for_segments(&buffer, 3).await;

        buffer.transmit_stop();
        assert!(!buffer.is_transmitting());

        // Maintenance continues after transmit stops
        push_media(&sender, 4).await;
        wait_for_segments(&buffer, 4).await;
        buffer.stop().await;
    }

    #[tokio::test]
    async fn test_start_failure_cleans_up() {
        let api = FakeApi::new();
        api.fail_create.store(true, std::sync::atomic::Ordering::SeqCst);
        let manager = LivestreamManager::new(api, LivestreamConfig::default());
        let buffer =
            TimeshiftBuffer::new(manager, &test_config(100, 400), Duration::from_millis(100));
        assert!(!buffer.start(&test_entry(), 4000).await);
        assert!(!buffer.is_started());
        assert_eq!(buffer.buffered_segments(), 0);
    }

    #[tokio::test]
    async fn test_configured_duration_round_trip() {
        let api = FakeApi::new();
        let manager = LivestreamManager::new(api, LivestreamConfig::default());
        let buffer = TimeshiftBuffer::new(manager, &test_config(100, 400), Duration::from_secs(1));
        assert_eq!(buffer.configured_duration(), 400);
        buffer.set_configured_duration(250);
        // Capacity rounds down to whole segments
        assert_eq!(buffer.configured_duration(), 200);
        buffer.set_configured_duration(50);
        // Never below one segment
        assert_eq!(buffer.configured_duration(), 100);
    }
}
