//! Bridge event types
//!
//! Defines all event types that can be broadcast through the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bridge event enumeration
///
/// All events are tagged with their event name for serialization.
/// The `serde(tag = "event", content = "data")` attribute creates a
/// JSON structure like:
/// ```json
/// {"event": "device_updated", "data": {"model_key": "camera", ...}}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// The update socket connected to the controller
    ControllerConnected { address: String },

    /// The update socket dropped; the listener will reconnect with backoff
    ControllerDisconnected { reason: String },

    /// A device state change decoded from the realtime update stream
    DeviceUpdated {
        /// Device model key (e.g. "camera", "sensor", "light")
        model_key: String,
        /// Device id the payload applies to
        id: String,
        /// Update sequence id assigned by the controller
        new_update_id: String,
        /// The changed state fields
        payload: serde_json::Value,
        /// When the bridge received the update
        received_at: DateTime<Utc>,
    },

    /// A pooled livestream went stale and was restarted
    LivestreamRestarted {
        camera_id: String,
        channel_id: u8,
        attempt: u32,
    },

    /// A recording stream was opened or closed by the accessory platform
    RecordingStateChanged { camera_id: String, active: bool },
}
