//! Best-effort snapshot acquisition
//!
//! Tries the cheapest live source first and falls through on every failure:
//! a frame from the timeshift buffer, a frame grabbed off the RTSP stream,
//! the controller's own snapshot endpoint, and finally an age-bounded
//! cache of the last good image. The whole chain runs under one hard
//! budget; a miss on everything is the only user-visible error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::api::{ControllerApi, RtspEntry};
use crate::config::{FfmpegConfig, SnapshotConfig};
use crate::error::{BridgeError, Result};
use crate::ffmpeg::{FfmpegExec, ProcessOptions};
use crate::livestream::TimeshiftBuffer;

/// How much buffered media to hand the frame grab
const TIMESHIFT_SAMPLE_MS: u64 = 1000;

struct CachedSnapshot {
    image: Bytes,
    taken_at: Instant,
}

/// Snapshot source chain for one camera
pub struct SnapshotService {
    api: Arc<dyn ControllerApi>,
    buffer: Arc<TimeshiftBuffer>,
    entry: RtspEntry,
    ffmpeg: FfmpegConfig,
    config: SnapshotConfig,
    cache: Mutex<Option<CachedSnapshot>>,
}

impl SnapshotService {
    pub fn new(
        api: Arc<dyn ControllerApi>,
        buffer: Arc<TimeshiftBuffer>,
        entry: RtspEntry,
        ffmpeg: FfmpegConfig,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            api,
            buffer,
            entry,
            ffmpeg,
            config,
            cache: Mutex::new(None),
        }
    }

    /// Produce a still image, or the freshest cached one, or fail
    pub async fn snapshot(&self) -> Result<Bytes> {
        let budget = Duration::from_secs(self.config.timeout_secs);

        let image = match tokio::time::timeout(budget, self.acquire()).await {
            Ok(Some(image)) => Some(image),
            Ok(None) => None,
            Err(_) => {
                debug!(
                    "Snapshot chain for {} exhausted its {:?} budget",
                    self.entry.camera_id, budget
                );
                None
            }
        };

        if let Some(image) = image {
            *self.cache.lock() = Some(CachedSnapshot {
                image: image.clone(),
                taken_at: Instant::now(),
            });
            return Ok(image);
        }

        // Every live source failed; the cache is the last resort
        let max_age = Duration::from_secs(self.config.cache_max_age_secs);
        if let Some(cached) = self.cache.lock().as_ref() {
            if cached.taken_at.elapsed() <= max_age {
                debug!(
                    "Serving cached snapshot for {} ({:?} old)",
                    self.entry.camera_id,
                    cached.taken_at.elapsed()
                );
                return Ok(cached.image.clone());
            }
        }

        warn!("No snapshot available for {}", self.entry.camera_id);
        Err(BridgeError::Stream(format!(
            "no snapshot source available for {}",
            self.entry.camera_id
        )))
    }

    async fn acquire(&self) -> Option<Bytes> {
        if let Some(image) = self.from_timeshift().await {
            debug!("Snapshot for {} from the timeshift buffer", self.entry.camera_id);
            return Some(image);
        }
        if let Some(image) = self.from_rtsp().await {
            debug!("Snapshot for {} from the RTSP stream", self.entry.camera_id);
            return Some(image);
        }
        if let Some(image) = self.from_controller().await {
            debug!("Snapshot for {} from the controller", self.entry.camera_id);
            return Some(image);
        }
        None
    }

    /// Decode one frame out of the buffered fMP4 window
    async fn from_timeshift(&self) -> Option<Bytes> {
        let media = self.buffer.get_last(TIMESHIFT_SAMPLE_MS)?;
        let args = [
            "-f", "mp4", "-i", "pipe:0", "-frames:v", "1", "-q:v", "2", "-f", "image2", "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        self.run_ffmpeg(args, Some(media)).await
    }

    /// Grab one frame straight off the camera's RTSP stream
    async fn from_rtsp(&self) -> Option<Bytes> {
        let args = [
            "-rtsp_transport",
            "tcp",
            "-i",
            self.entry.url.as_str(),
            "-frames:v",
            "1",
            "-q:v",
            "2",
            "-f",
            "image2",
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        self.run_ffmpeg(args, None).await
    }

    async fn from_controller(&self) -> Option<Bytes> {
        match self.api.snapshot(&self.entry.camera_id).await {
            Ok(image) => Some(image),
            Err(e) => {
                debug!("Controller snapshot for {} failed: {}", self.entry.camera_id, e);
                None
            }
        }
    }

    async fn run_ffmpeg(&self, args: Vec<String>, stdin: Option<Bytes>) -> Option<Bytes> {
        let mut options = ProcessOptions::new(self.ffmpeg.binary.clone(), args);
        options.verbose = self.ffmpeg.verbose;
        options.kill_timeout = Duration::from_millis(self.ffmpeg.kill_timeout_ms);
        FfmpegExec::run(
            options,
            stdin,
            Duration::from_secs(self.config.timeout_secs),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{test_entry, FakeApi};
    use crate::config::{LivestreamConfig, TimeshiftConfig};
    use crate::livestream::LivestreamManager;

    fn service_with(api: Arc<FakeApi>, config: SnapshotConfig) -> SnapshotService {
        let manager = LivestreamManager::new(api.clone(), LivestreamConfig::default());
        let buffer = TimeshiftBuffer::new(
            manager,
            &TimeshiftConfig::default(),
            Duration::from_millis(100),
        );
        let ffmpeg = FfmpegConfig {
            // A binary that cannot exist forces the transcoder rungs to miss
            binary: "/nonexistent/ffmpeg".to_string(),
            verbose: false,
            kill_timeout_ms: 500,
        };
        SnapshotService::new(api, buffer, test_entry(), ffmpeg, config)
    }

    #[tokio::test]
    async fn test_falls_through_to_controller() {
        let api = FakeApi::new();
        *api.snapshot_response.lock() = Some(Bytes::from_static(b"jpeg"));
        let service = service_with(api, SnapshotConfig::default());
        let image = service.snapshot().await.unwrap();
        assert_eq!(&image[..], b"jpeg");
    }

    #[tokio::test]
    async fn test_serves_fresh_cache_when_sources_fail() {
        let api = FakeApi::new();
        *api.snapshot_response.lock() = Some(Bytes::from_static(b"jpeg"));
        let service = service_with(api.clone(), SnapshotConfig::default());
        service.snapshot().await.unwrap();

        // All live sources now fail; the cache carries the request
        *api.snapshot_response.lock() = None;
        let image = service.snapshot().await.unwrap();
        assert_eq!(&image[..], b"jpeg");
    }

    #[tokio::test]
    async fn test_stale_cache_is_not_served() {
        let api = FakeApi::new();
        *api.snapshot_response.lock() = Some(Bytes::from_static(b"jpeg"));
        let service = service_with(
            api.clone(),
            SnapshotConfig {
                timeout_secs: 2,
                cache_max_age_secs: 0,
            },
        );
        service.snapshot().await.unwrap();

        *api.snapshot_response.lock() = None;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(service.snapshot().await.is_err());
    }

    #[tokio::test]
    async fn test_total_failure_is_an_error() {
        let api = FakeApi::new();
        let service = service_with(api, SnapshotConfig::default());
        assert!(service.snapshot().await.is_err());
    }
}
