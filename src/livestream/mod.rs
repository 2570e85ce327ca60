//! Controller livestream acquisition
//!
//! Pools push-based livestream connections per camera channel, reference
//! counted across consumers, with stale detection and guarded restart. The
//! timeshift buffer sits on top and turns a connection into a bounded
//! rewind window for event recording.

pub mod connection;
pub mod manager;
pub mod timeshift;

pub use connection::{LivestreamHandle, LivestreamKey, SegmentEvent};
pub use manager::LivestreamManager;
pub use timeshift::TimeshiftBuffer;
