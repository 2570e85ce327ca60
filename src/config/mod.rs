//! Configuration management
//!
//! Defines the bridge configuration schema and the file-backed store with a
//! lock-free read cache.

pub mod schema;
pub mod store;

pub use schema::{
    AppConfig, ControllerConfig, FfmpegConfig, LivestreamConfig, RtpConfig, SnapshotConfig,
    TimeshiftConfig,
};
pub use store::{ConfigChange, ConfigStore};
