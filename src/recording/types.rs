//! Recording protocol types

use bytes::Bytes;

/// One unit of the recording packet protocol
///
/// The consumer expects a sequence of packets terminated by exactly one
/// `is_last` packet, which may carry a single placeholder byte when there is
/// no real data to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingPacket {
    pub data: Bytes,
    pub is_last: bool,
}

impl RecordingPacket {
    pub fn media(data: Bytes) -> Self {
        Self {
            data,
            is_last: false,
        }
    }

    /// The terminal packet sent when nothing (more) can be produced
    pub fn terminal() -> Self {
        Self {
            data: Bytes::from_static(&[0]),
            is_last: true,
        }
    }
}

/// Negotiated recording parameters from the accessory platform
#[derive(Debug, Clone)]
pub struct RecordingConfiguration {
    /// Requested recording fragment length in milliseconds
    pub fragment_duration_ms: u64,
    /// Requested prebuffer window in milliseconds
    pub prebuffer_duration_ms: u64,
    /// Output video codec for the transcode ("copy" passes through)
    pub video_codec: String,
}

/// Why a recording stream was closed
///
/// The reason only changes what gets logged; every close runs the same
/// cleanup path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    Cancelled,
    Timeout,
    Unexpected,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Normal => write!(f, "completed"),
            CloseReason::Cancelled => write!(f, "cancelled"),
            CloseReason::Timeout => write!(f, "timed out"),
            CloseReason::Unexpected => write!(f, "failed unexpectedly"),
        }
    }
}
