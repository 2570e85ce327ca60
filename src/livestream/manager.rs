//! Livestream pool and restart supervision
//!
//! At most one controller connection exists per livestream key. Consumers
//! go through counted `start`/`stop`; only the first subscriber opens the
//! connection and only the last one closes it. A per-stream loop owns the
//! connection and handles staleness with jittered, capped backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ControllerApi, LivestreamRequest, LivestreamSource, RtspEntry};
use crate::config::LivestreamConfig;
use crate::events::{BridgeEvent, EventBus};

use super::connection::{LivestreamHandle, LivestreamKey, PumpEnd};

/// Pool of reference-counted livestream connections
pub struct LivestreamManager {
    api: Arc<dyn ControllerApi>,
    config: LivestreamConfig,
    pool: Mutex<HashMap<LivestreamKey, Arc<LivestreamHandle>>>,
    events: Mutex<Option<Arc<EventBus>>>,
    shutdown: CancellationToken,
}

impl LivestreamManager {
    pub fn new(api: Arc<dyn ControllerApi>, config: LivestreamConfig) -> Arc<Self> {
        Arc::new(Self {
            api,
            config,
            pool: Mutex::new(HashMap::new()),
            events: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Set event bus for notifications
    pub fn set_event_bus(&self, events: Arc<EventBus>) {
        *self.events.lock() = Some(events);
    }

    /// Get or create the pooled handle for this stream profile
    ///
    /// Idempotent per key; the returned handle is unstarted until the first
    /// `start`.
    pub fn acquire(&self, entry: &RtspEntry) -> Arc<LivestreamHandle> {
        let key = LivestreamKey::from_entry(entry);
        self.pool
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(LivestreamHandle::new(key)))
            .clone()
    }

    /// Look up an existing handle without creating one
    pub fn get(&self, entry: &RtspEntry) -> Option<Arc<LivestreamHandle>> {
        self.pool.lock().get(&LivestreamKey::from_entry(entry)).cloned()
    }

    /// Register one more consumer, opening the controller stream on the
    /// first subscription
    ///
    /// Returns `false` without side effects if the handle was never acquired
    /// or the initial start call fails.
    pub async fn start(&self, entry: &RtspEntry, segment_length_ms: u64) -> bool {
        let Some(handle) = self.get(entry) else {
            return false;
        };

        if handle.subscriber_count() == 0 {
            let request = LivestreamRequest {
                camera_id: entry.camera_id.clone(),
                channel_id: entry.channel_id,
                lens: entry.lens,
                segment_length_ms,
            };
            let source = match self.api.create_livestream(&request).await {
                Ok(source) => source,
                Err(e) => {
                    warn!("Failed to start livestream {}: {}", handle.key(), e);
                    return false;
                }
            };

            let cancel = CancellationToken::new();
            *handle.cancel.lock() = Some(cancel.clone());

            let api = self.api.clone();
            let config = self.config.clone();
            let events = self.events.lock().clone();
            let loop_handle = handle.clone();
            tokio::spawn(async move {
                run_stream_loop(api, config, events, loop_handle, request, source, cancel).await;
            });
            info!("Livestream {} started", handle.key());
        }

        let count = handle.add_subscriber();
        debug!("Livestream {} now has {} subscriber(s)", handle.key(), count);
        true
    }

    /// Release one consumer, closing the stream when the last one leaves
    pub async fn stop(&self, entry: &RtspEntry) {
        let Some(handle) = self.get(entry) else {
            return;
        };
        if handle.subscriber_count() == 0 {
            return;
        }
        let remaining = handle.remove_subscriber();
        if remaining > 0 {
            debug!(
                "Livestream {} still has {} subscriber(s)",
                handle.key(),
                remaining
            );
            return;
        }
        if let Some(cancel) = handle.cancel.lock().take() {
            cancel.cancel();
        }
        handle.clear_stream_state();
        info!("Livestream {} stopped", handle.key());
    }

    /// Stop every pooled connection; used at plugin teardown
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<Arc<LivestreamHandle>> = {
            let mut pool = self.pool.lock();
            pool.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            if let Some(cancel) = handle.cancel.lock().take() {
                cancel.cancel();
            }
            handle.clear_stream_state();
        }
        info!("Livestream manager shut down");
    }
}

/// Sleep unless the stream gets cancelled first; true if we slept fully
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Own one livestream connection until it is cancelled
///
/// Restarts after staleness or controller-side closes. Backoff grows by
/// half the base per failure, caps at three times the base, and resets to
/// base once a connection survives the reset window. A camera the
/// controller reports offline defers the restart instead of burning the
/// backoff.
async fn run_stream_loop(
    api: Arc<dyn ControllerApi>,
    config: LivestreamConfig,
    events: Option<Arc<EventBus>>,
    handle: Arc<LivestreamHandle>,
    request: LivestreamRequest,
    initial_source: LivestreamSource,
    cancel: CancellationToken,
) {
    let base = config.restart_base_secs;
    let stale_timeout = Duration::from_millis(config.stale_timeout_ms);
    let mut delay_secs = base;
    let mut pending_source = Some(initial_source);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let source = match pending_source.take() {
            Some(source) => Some(source),
            None => match api.create_livestream(&request).await {
                Ok(source) => Some(source),
                Err(e) => {
                    warn!("Livestream {} reconnect failed: {}", handle.key(), e);
                    None
                }
            },
        };

        if let Some(source) = source {
            handle.set_restarting(false);
            let connected_at = Instant::now();
            let end = handle.pump(source, stale_timeout, &cancel).await;
            match end {
                PumpEnd::Cancelled => break,
                PumpEnd::Closed => debug!("Livestream {} closed by controller", handle.key()),
                PumpEnd::Stale => warn!(
                    "Livestream {} went silent for {}ms",
                    handle.key(),
                    config.stale_timeout_ms
                ),
                PumpEnd::Forced => debug!("Livestream {} restart forced by consumer", handle.key()),
            }
            if connected_at.elapsed() > Duration::from_secs(config.backoff_reset_secs) {
                delay_secs = base;
            }
        }

        if cancel.is_cancelled() {
            break;
        }

        // Restart procedure; the guard flag stays up until the next
        // connection is pumping again
        handle.set_restarting(true);
        if let Some(events) = &events {
            events.publish(BridgeEvent::LivestreamRestarted {
                camera_id: request.camera_id.clone(),
                channel_id: request.channel_id,
                attempt: handle.restart_attempts(),
            });
        }

        if !api.is_camera_online(&request.camera_id).await {
            info!(
                "Camera {} is offline, deferring livestream restart {}s",
                request.camera_id, config.offline_retry_secs
            );
            if !sleep_or_cancel(Duration::from_secs(config.offline_retry_secs), &cancel).await {
                break;
            }
            continue;
        }

        let jitter: u64 = rand::thread_rng().gen_range(0..=config.restart_jitter_secs);
        let wait = Duration::from_secs(delay_secs + jitter);
        info!("Restarting livestream {} in {:?}", handle.key(), wait);
        if !sleep_or_cancel(wait, &cancel).await {
            break;
        }
        delay_secs = (delay_secs + config.backoff_step_secs()).min(config.backoff_cap_secs());
    }

    handle.set_restarting(false);
    handle.emit_closed();
    debug!("Livestream {} loop ended", handle.key());
}
