//! Event recording
//!
//! Implements the accessory platform's recording protocol on top of the
//! timeshift buffer and the recording transcode pipeline.

pub mod delegate;
pub mod types;

pub use delegate::{RecordingDelegate, RecordingDelegateOptions};
pub use types::{CloseReason, RecordingConfiguration, RecordingPacket};
