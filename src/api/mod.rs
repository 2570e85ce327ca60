//! Controller API client
//!
//! Thin boundary to the NVR controller: REST calls for snapshots and device
//! patches, and the websocket livestream endpoint that pushes raw fragmented
//! media bytes. The core pipeline consumes this module through the
//! `ControllerApi` trait so tests can substitute a fake controller.

pub mod client;
#[cfg(test)]
pub mod testing;
pub mod types;

pub use client::{ControllerApi, ProtectClient};
pub use types::{LivestreamRequest, LivestreamSource, RtspEntry};
