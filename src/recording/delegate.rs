//! Recording protocol state machine
//!
//! Drives the accessory platform's recording contract: activate and
//! configure timeshifting, then answer each stream request with a packet
//! sequence from the recording transcode. When nothing can be produced the
//! answer is exactly one terminal packet carrying a placeholder byte; that
//! empty response is part of the protocol, not an error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{ControllerApi, RtspEntry};
use crate::config::FfmpegConfig;
use crate::events::{BridgeEvent, EventBus};
use crate::ffmpeg::{FfmpegRecordingProcess, RecordingProcessOptions};
use crate::livestream::TimeshiftBuffer;

use super::types::{CloseReason, RecordingConfiguration, RecordingPacket};

/// Packet channel capacity toward the accessory platform
const PACKET_CHANNEL_CAPACITY: usize = 16;

/// Behavior knobs for the delegate
#[derive(Debug, Clone)]
pub struct RecordingDelegateOptions {
    pub ffmpeg: FfmpegConfig,
    /// Maximum transcoder stdout silence mid-stream before the session is
    /// declared stuck and the buffer restarted
    pub idle_timeout: Duration,
}

impl Default for RecordingDelegateOptions {
    fn default() -> Self {
        Self {
            ffmpeg: FfmpegConfig::default(),
            idle_timeout: Duration::from_secs(10),
        }
    }
}

/// Recording delegate for one camera
///
/// States: inactive -> active (not initialized) -> active (initialized,
/// idle) <-> transmitting. Activation without a stored recording
/// configuration or with the camera offline parks the delegate in "active,
/// not initialized"; initialization is retried on the next stream request.
pub struct RecordingDelegate {
    api: Arc<dyn ControllerApi>,
    buffer: Arc<TimeshiftBuffer>,
    entry: RtspEntry,
    options: RecordingDelegateOptions,
    events: Mutex<Option<Arc<EventBus>>>,

    active: AtomicBool,
    initialized: AtomicBool,
    configuration: Mutex<Option<RecordingConfiguration>>,
    /// The transcode serving the in-flight stream request, if any
    session: Mutex<Option<Arc<FfmpegRecordingProcess>>>,
    /// The one-time initialization summary has been logged
    init_logged: AtomicBool,
}

impl RecordingDelegate {
    pub fn new(
        api: Arc<dyn ControllerApi>,
        buffer: Arc<TimeshiftBuffer>,
        entry: RtspEntry,
        options: RecordingDelegateOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            buffer,
            entry,
            options,
            events: Mutex::new(None),
            active: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            configuration: Mutex::new(None),
            session: Mutex::new(None),
            init_logged: AtomicBool::new(false),
        })
    }

    /// Set event bus for notifications
    pub fn set_event_bus(&self, events: Arc<EventBus>) {
        *self.events.lock() = Some(events);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// The platform toggled recording on or off for this camera
    ///
    /// Idempotent in both directions.
    pub async fn update_recording_active(&self, active: bool) {
        if !active {
            self.buffer.stop().await;
            self.active.store(false, Ordering::SeqCst);
            self.initialized.store(false, Ordering::SeqCst);
            self.publish_state(false);
            return;
        }

        self.active.store(true, Ordering::SeqCst);
        self.publish_state(true);
        self.try_initialize().await;
    }

    /// The platform negotiated (or lost) recording parameters
    ///
    /// `None` means negotiation failed, for example after a device factory
    /// reset: stop buffering and wait for a fresh configuration.
    pub async fn update_recording_configuration(&self, config: Option<RecordingConfiguration>) {
        match config {
            None => {
                debug!(
                    "Recording configuration for {} withdrawn, stopping the buffer",
                    self.entry.camera_id
                );
                *self.configuration.lock() = None;
                self.initialized.store(false, Ordering::SeqCst);
                self.buffer.stop().await;
            }
            Some(config) => {
                self.buffer.set_configured_duration(config.prebuffer_duration_ms);
                *self.configuration.lock() = Some(config);
                // Re-run the activation transition so the new parameters
                // take effect immediately
                let active = self.active.load(Ordering::SeqCst);
                self.update_recording_active(active).await;
            }
        }
    }

    /// Produce the packet sequence for one recording stream request
    ///
    /// The returned channel yields media packets followed by exactly one
    /// terminal packet. Dropping the receiver cancels production at packet
    /// granularity.
    pub fn handle_recording_stream_request(self: &Arc<Self>) -> mpsc::Receiver<RecordingPacket> {
        let (tx, rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
        let this = self.clone();
        tokio::spawn(async move {
            this.produce_packets(tx).await;
        });
        rx
    }

    /// The platform acknowledged the stream; stop transmitting
    pub async fn acknowledge_stream(&self) {
        debug!("Recording stream for {} acknowledged", self.entry.camera_id);
        self.stop_transmission().await;
    }

    /// The platform closed the stream; the reason is logging-only
    pub async fn close_recording_stream(&self, reason: CloseReason) {
        match reason {
            CloseReason::Normal | CloseReason::Cancelled => {
                debug!(
                    "Recording stream for {} closed: {}",
                    self.entry.camera_id, reason
                );
            }
            CloseReason::Timeout | CloseReason::Unexpected => {
                warn!(
                    "Recording stream for {} closed: {}",
                    self.entry.camera_id, reason
                );
            }
        }
        self.stop_transmission().await;
    }

    /// Configure timeshifting if a configuration and a reachable camera allow
    ///
    /// Quietly stays uninitialized otherwise; the next stream request retries.
    async fn try_initialize(&self) {
        if self.initialized.load(Ordering::SeqCst) {
            return;
        }
        let config = self.configuration.lock().clone();
        let Some(config) = config else {
            debug!(
                "Recording for {} is active but has no configuration yet",
                self.entry.camera_id
            );
            return;
        };
        if !self.api.is_camera_online(&self.entry.camera_id).await {
            debug!(
                "Recording for {} deferred: camera is offline",
                self.entry.camera_id
            );
            return;
        }
        if !self.buffer.start(&self.entry, config.fragment_duration_ms).await {
            warn!(
                "Timeshift buffer for {} failed to start, will retry",
                self.entry.camera_id
            );
            return;
        }
        self.initialized.store(true, Ordering::SeqCst);
        if !self.init_logged.swap(true, Ordering::SeqCst) {
            info!(
                "Event recording enabled for {}: {}ms prebuffer, {}ms fragments",
                self.entry.camera_id,
                self.buffer.configured_duration(),
                config.fragment_duration_ms
            );
        }
    }

    async fn produce_packets(&self, tx: mpsc::Sender<RecordingPacket>) {
        // A late activation may still be waiting on its configuration or
        // camera; give initialization one more chance per request
        if self.active.load(Ordering::SeqCst) && !self.initialized.load(Ordering::SeqCst) {
            self.try_initialize().await;
        }

        if !self.active.load(Ordering::SeqCst)
            || !self.initialized.load(Ordering::SeqCst)
            || self.buffer.is_restarting()
        {
            debug!(
                "Recording request for {} answered empty (active={}, initialized={}, restarting={})",
                self.entry.camera_id,
                self.active.load(Ordering::SeqCst),
                self.initialized.load(Ordering::SeqCst),
                self.buffer.is_restarting()
            );
            let _ = tx.send(RecordingPacket::terminal()).await;
            return;
        }

        let config = self.configuration.lock().clone();
        let Some(config) = config else {
            let _ = tx.send(RecordingPacket::terminal()).await;
            return;
        };

        // Transmission setup: buffered history first, then live segments
        let Some(mut buffered) = self.buffer.transmit_start().await else {
            warn!(
                "Recording request for {} answered empty: transmit setup failed",
                self.entry.camera_id
            );
            let _ = tx.send(RecordingPacket::terminal()).await;
            return;
        };

        let process_options = RecordingProcessOptions {
            binary: self.options.ffmpeg.binary.clone(),
            verbose: self.options.ffmpeg.verbose,
            kill_timeout: Duration::from_millis(self.options.ffmpeg.kill_timeout_ms),
            idle_timeout: self.options.idle_timeout,
            video_codec: config.video_codec.clone(),
            fragment_duration_ms: config.fragment_duration_ms,
        };
        let process = match FfmpegRecordingProcess::start(&process_options) {
            Ok(process) => process,
            Err(e) => {
                warn!("Recording transcode for {} failed to start: {}", self.entry.camera_id, e);
                self.buffer.transmit_stop();
                let _ = tx.send(RecordingPacket::terminal()).await;
                return;
            }
        };
        let session_id = Uuid::new_v4();
        *self.session.lock() = Some(process.clone());
        debug!(
            "Recording session {} for {} started",
            session_id, self.entry.camera_id
        );

        let Some(mut segments) = process.take_segments().await else {
            self.buffer.transmit_stop();
            process.stop();
            let _ = tx.send(RecordingPacket::terminal()).await;
            return;
        };

        // Feed buffered+live timeshift output into the transcoder in order;
        // the feed queue is the backpressure point
        let feeder = {
            let process = process.clone();
            tokio::spawn(async move {
                while let Some(segment) = buffered.recv().await {
                    if !process.feed(segment).await {
                        break;
                    }
                }
                // Feed sender drops here; the transcoder sees EOF and
                // flushes its trailer
            })
        };

        let idle_timeout = process.idle_timeout();
        let mut timed_out = false;
        loop {
            match tokio::time::timeout(idle_timeout, segments.recv()).await {
                Ok(Some(segment)) => {
                    if tx.send(RecordingPacket::media(segment)).await.is_err() {
                        // Receiver dropped: cancellation at packet boundary
                        debug!(
                            "Recording session {} cancelled by consumer",
                            session_id
                        );
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Recording session {} stalled for {:?}, restarting the buffer",
                        session_id, idle_timeout
                    );
                    self.buffer.restart();
                    timed_out = true;
                    break;
                }
            }
        }

        feeder.abort();
        self.stop_transmission().await;
        let _ = tx.send(RecordingPacket::terminal()).await;
        if timed_out {
            debug!("Recording session {} closed after stall", session_id);
        } else {
            debug!("Recording session {} closed", session_id);
        }
    }

    /// Shared cleanup for every way a stream ends
    async fn stop_transmission(&self) {
        self.buffer.transmit_stop();
        let process = self.session.lock().take();
        if let Some(process) = process {
            process.stop();
        }
    }

    fn publish_state(&self, active: bool) {
        if let Some(events) = self.events.lock().as_ref() {
            events.publish(BridgeEvent::RecordingStateChanged {
                camera_id: self.entry.camera_id.clone(),
                active,
            });
        }
    }
}
