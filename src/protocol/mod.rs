//! Controller realtime update protocol
//!
//! The controller pushes device state changes over a binary websocket
//! protocol. Each message carries two frames (action + payload), each with an
//! 8-byte header. This module decodes and encodes those packets.

mod frame;

pub use frame::{
    decode_packet, encode_packet, ActionFrame, FrameError, FrameHeader, FrameType, PayloadFormat,
    UpdatePacket, UpdatePayload, HEADER_SIZE,
};
