use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Controller connection settings
    pub controller: ControllerConfig,
    /// External transcoder settings
    pub ffmpeg: FfmpegConfig,
    /// Livestream pooling and restart settings
    pub livestream: LivestreamConfig,
    /// Timeshift buffer settings
    pub timeshift: TimeshiftConfig,
    /// RTP transport settings
    pub rtp: RtpConfig,
    /// Snapshot acquisition settings
    pub snapshot: SnapshotConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            ffmpeg: FfmpegConfig::default(),
            livestream: LivestreamConfig::default(),
            timeshift: TimeshiftConfig::default(),
            rtp: RtpConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

/// Controller connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Controller host (address or address:port)
    pub address: String,
    /// API key used for REST and websocket authentication
    pub api_key: String,
    /// Accept self-signed controller certificates
    pub accept_invalid_certs: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            api_key: String::new(),
            // Controllers ship with self-signed certificates out of the box
            accept_invalid_certs: true,
        }
    }
}

/// External transcoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FfmpegConfig {
    /// Path to the ffmpeg binary
    pub binary: String,
    /// Echo transcoder stderr lines live at debug level
    pub verbose: bool,
    /// Grace period before a stopped process is force-killed, in milliseconds
    pub kill_timeout_ms: u64,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            verbose: false,
            kill_timeout_ms: 5000,
        }
    }
}

/// Livestream pooling and restart configuration
///
/// The numeric relationships matter more than the exact values: the backoff
/// step is half the base, the cap is three times the base, and a connection
/// that survives the reset window drops back to the base delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivestreamConfig {
    /// Segment silence before a stream is considered stale, in milliseconds
    pub stale_timeout_ms: u64,
    /// Base restart delay in seconds
    pub restart_base_secs: u64,
    /// Restart deferral while the camera is offline, in seconds
    pub offline_retry_secs: u64,
    /// Upper bound of the random jitter added to each restart, in seconds
    pub restart_jitter_secs: u64,
    /// Uptime after which the backoff resets to base, in seconds
    pub backoff_reset_secs: u64,
    /// Bounded wait for the stream initialization segment, in milliseconds
    pub init_segment_timeout_ms: u64,
}

impl Default for LivestreamConfig {
    fn default() -> Self {
        Self {
            stale_timeout_ms: 3500,
            restart_base_secs: 5,
            offline_retry_secs: 60,
            restart_jitter_secs: 3,
            backoff_reset_secs: 60,
            init_segment_timeout_ms: 5000,
        }
    }
}

impl LivestreamConfig {
    /// Backoff growth per consecutive failure, in seconds
    pub fn backoff_step_secs(&self) -> u64 {
        self.restart_base_secs / 2
    }

    /// Backoff ceiling, in seconds
    pub fn backoff_cap_secs(&self) -> u64 {
        self.restart_base_secs * 3
    }
}

/// Timeshift buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeshiftConfig {
    /// Livestream segment length in milliseconds
    pub segment_length_ms: u64,
    /// Buffered rewind window in milliseconds
    pub buffer_duration_ms: u64,
}

impl Default for TimeshiftConfig {
    fn default() -> Self {
        Self {
            segment_length_ms: 100,
            buffer_duration_ms: 4000,
        }
    }
}

/// RTP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtpConfig {
    /// Lowest UDP port the allocator will hand out
    pub port_range_start: u16,
    /// Highest UDP port the allocator will hand out
    pub port_range_end: u16,
    /// RTCP keepalive interval in milliseconds
    ///
    /// Must stay below the downstream transcoder's read timeout.
    pub heartbeat_interval_ms: u64,
}

impl Default for RtpConfig {
    fn default() -> Self {
        Self {
            port_range_start: 10000,
            port_range_end: 20000,
            heartbeat_interval_ms: 3500,
        }
    }
}

/// Snapshot acquisition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Hard budget for one snapshot attempt chain, in seconds
    pub timeout_secs: u64,
    /// Maximum age of a cached snapshot before it stops being served, in seconds
    pub cache_max_age_secs: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            cache_max_age_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.livestream.stale_timeout_ms, 3500);
        assert_eq!(back.ffmpeg.binary, "ffmpeg");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"controller":{"address":"nvr.local"}}"#).unwrap();
        assert_eq!(config.controller.address, "nvr.local");
        assert_eq!(config.timeshift.segment_length_ms, 100);
    }

    #[test]
    fn test_backoff_relationships() {
        let ls = LivestreamConfig::default();
        assert_eq!(ls.backoff_step_secs() * 2, ls.restart_base_secs);
        assert_eq!(ls.backoff_cap_secs(), ls.restart_base_secs * 3);
    }
}
