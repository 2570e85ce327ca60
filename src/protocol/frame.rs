//! Update packet framing
//!
//! Wire layout of one update packet:
//!
//! ```text
//! +--------+----------------+--------+-----------------+
//! | header | action payload | header | data payload    |
//! | 8 B    | header.size B  | 8 B    | header.size B   |
//! +--------+----------------+--------+-----------------+
//! ```
//!
//! Header bytes: 0 frame type (1 action, 2 payload), 1 payload format
//! (1 JSON, 2 UTF-8, 3 raw), 2 deflate flag, 3 reserved, 4-7 payload size
//! as big-endian u32. Decode failures are per-packet: the caller drops the
//! packet and keeps reading the socket.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of one frame header in bytes
pub const HEADER_SIZE: usize = 8;

/// Frame decode error
///
/// All variants are non-fatal to the update connection.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Malformed packet: {0}")]
    Malformed(&'static str),

    #[error("Unknown frame type {0}")]
    UnknownFrameType(u8),

    #[error("Unknown payload format {0}")]
    UnknownPayloadFormat(u8),

    #[error("Expected {expected:?} frame, got {actual:?}")]
    UnexpectedFrameType {
        expected: FrameType,
        actual: FrameType,
    },

    #[error("Action frame payload must be JSON, got {0:?}")]
    NonJsonAction(PayloadFormat),

    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid UTF-8 payload: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Inflate failed: {0}")]
    Inflate(#[from] std::io::Error),
}

/// Frame type discriminator (header byte 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Action frame describing what changed
    Action,
    /// Payload frame carrying the change itself
    Payload,
}

impl FrameType {
    fn as_u8(self) -> u8 {
        match self {
            FrameType::Action => 1,
            FrameType::Payload => 2,
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(FrameType::Action),
            2 => Ok(FrameType::Payload),
            other => Err(FrameError::UnknownFrameType(other)),
        }
    }
}

/// Payload format discriminator (header byte 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Json,
    Utf8,
    Raw,
}

impl PayloadFormat {
    fn as_u8(self) -> u8 {
        match self {
            PayloadFormat::Json => 1,
            PayloadFormat::Utf8 => 2,
            PayloadFormat::Raw => 3,
        }
    }
}

impl TryFrom<u8> for PayloadFormat {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(PayloadFormat::Json),
            2 => Ok(PayloadFormat::Utf8),
            3 => Ok(PayloadFormat::Raw),
            other => Err(FrameError::UnknownPayloadFormat(other)),
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub payload_format: PayloadFormat,
    pub deflated: bool,
    pub payload_size: u32,
}

impl FrameHeader {
    /// Parse a header from the first 8 bytes of `buf`
    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::Malformed("short frame header"));
        }
        Ok(Self {
            frame_type: FrameType::try_from(buf[0])?,
            payload_format: PayloadFormat::try_from(buf[1])?,
            deflated: buf[2] != 0,
            payload_size: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    /// Write the 8-byte wire form of this header
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.frame_type.as_u8());
        out.push(self.payload_format.as_u8());
        out.push(u8::from(self.deflated));
        out.push(0);
        out.extend_from_slice(&self.payload_size.to_be_bytes());
    }
}

/// Action frame body
///
/// Tells us which device model and id the accompanying data payload applies
/// to, and the update sequence id the controller assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionFrame {
    pub action: String,
    pub id: String,
    pub model_key: String,
    pub new_update_id: String,
}

/// Data payload of an update packet
#[derive(Debug, Clone, PartialEq)]
pub enum UpdatePayload {
    Json(serde_json::Value),
    Text(String),
    Raw(Bytes),
}

impl UpdatePayload {
    fn format(&self) -> PayloadFormat {
        match self {
            UpdatePayload::Json(_) => PayloadFormat::Json,
            UpdatePayload::Text(_) => PayloadFormat::Utf8,
            UpdatePayload::Raw(_) => PayloadFormat::Raw,
        }
    }

    fn to_wire(&self) -> Vec<u8> {
        match self {
            UpdatePayload::Json(v) => serde_json::to_vec(v).unwrap_or_default(),
            UpdatePayload::Text(s) => s.as_bytes().to_vec(),
            UpdatePayload::Raw(b) => b.to_vec(),
        }
    }
}

/// One decoded realtime update
///
/// Constructed per inbound message and discarded after dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatePacket {
    pub action: ActionFrame,
    pub payload: UpdatePayload,
}

/// Decode one complete update packet
///
/// The packet length must exactly equal header + action + header + data.
/// Anything else is malformed and the packet is discarded as a unit; there
/// is no partial recovery.
pub fn decode_packet(buf: &[u8]) -> Result<UpdatePacket, FrameError> {
    if buf.len() < HEADER_SIZE {
        return Err(FrameError::Malformed("packet shorter than one header"));
    }
    let action_size =
        u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    let data_offset = HEADER_SIZE + action_size;
    if buf.len() < data_offset + HEADER_SIZE {
        return Err(FrameError::Malformed("packet truncated before data frame"));
    }
    let data_size = u32::from_be_bytes([
        buf[data_offset + 4],
        buf[data_offset + 5],
        buf[data_offset + 6],
        buf[data_offset + 7],
    ]) as usize;
    if buf.len() != data_offset + HEADER_SIZE + data_size {
        return Err(FrameError::Malformed("declared sizes do not match packet"));
    }

    let (action_format, action_bytes) =
        decode_frame(&buf[..data_offset], FrameType::Action)?;
    if action_format != PayloadFormat::Json {
        return Err(FrameError::NonJsonAction(action_format));
    }
    let action: ActionFrame = serde_json::from_slice(&action_bytes)?;

    let (data_format, data_bytes) =
        decode_frame(&buf[data_offset..], FrameType::Payload)?;
    let payload = match data_format {
        PayloadFormat::Json => UpdatePayload::Json(serde_json::from_slice(&data_bytes)?),
        PayloadFormat::Utf8 => UpdatePayload::Text(String::from_utf8(data_bytes)?),
        PayloadFormat::Raw => UpdatePayload::Raw(Bytes::from(data_bytes)),
    };

    Ok(UpdatePacket { action, payload })
}

/// Decode one frame (header + payload), checking it is of the expected type
///
/// Returns the payload format and the inflated payload bytes.
fn decode_frame(
    buf: &[u8],
    expected: FrameType,
) -> Result<(PayloadFormat, Vec<u8>), FrameError> {
    let header = FrameHeader::parse(buf)?;
    if header.frame_type != expected {
        return Err(FrameError::UnexpectedFrameType {
            expected,
            actual: header.frame_type,
        });
    }
    let body = &buf[HEADER_SIZE..];
    let payload = if header.deflated {
        let mut decoder = ZlibDecoder::new(body);
        let mut out = Vec::with_capacity(body.len() * 2);
        decoder.read_to_end(&mut out)?;
        out
    } else {
        body.to_vec()
    };
    Ok((header.payload_format, payload))
}

/// Encode one update packet to its wire form
///
/// The action frame is always JSON. `deflate` compresses both payloads with
/// zlib, matching what the controller does for larger updates.
pub fn encode_packet(packet: &UpdatePacket, deflate: bool) -> Result<Vec<u8>, FrameError> {
    let action_bytes = serde_json::to_vec(&packet.action)?;
    let data_bytes = packet.payload.to_wire();

    let mut out = Vec::with_capacity(
        2 * HEADER_SIZE + action_bytes.len() + data_bytes.len(),
    );
    encode_frame(
        &mut out,
        FrameType::Action,
        PayloadFormat::Json,
        &action_bytes,
        deflate,
    )?;
    encode_frame(
        &mut out,
        FrameType::Payload,
        packet.payload.format(),
        &data_bytes,
        deflate,
    )?;
    Ok(out)
}

fn encode_frame(
    out: &mut Vec<u8>,
    frame_type: FrameType,
    format: PayloadFormat,
    payload: &[u8],
    deflate: bool,
) -> Result<(), FrameError> {
    let body = if deflate {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload)?;
        encoder.finish()?
    } else {
        payload.to_vec()
    };
    let header = FrameHeader {
        frame_type,
        payload_format: format,
        deflated: deflate,
        payload_size: body.len() as u32,
    };
    header.write_to(out);
    out.extend_from_slice(&body);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_action() -> ActionFrame {
        ActionFrame {
            action: "update".to_string(),
            id: "x".to_string(),
            model_key: "camera".to_string(),
            new_update_id: "u".to_string(),
        }
    }

    #[test]
    fn test_round_trip_json_payload() {
        for deflate in [false, true] {
            let packet = UpdatePacket {
                action: sample_action(),
                payload: UpdatePayload::Json(serde_json::json!({"isLightOn": true})),
            };
            let wire = encode_packet(&packet, deflate).unwrap();
            let decoded = decode_packet(&wire).unwrap();
            assert_eq!(decoded, packet, "deflate={}", deflate);
        }
    }

    #[test]
    fn test_round_trip_text_payload() {
        for deflate in [false, true] {
            let packet = UpdatePacket {
                action: sample_action(),
                payload: UpdatePayload::Text("doorbell ring".to_string()),
            };
            let wire = encode_packet(&packet, deflate).unwrap();
            assert_eq!(decode_packet(&wire).unwrap(), packet);
        }
    }

    #[test]
    fn test_round_trip_raw_payload() {
        for deflate in [false, true] {
            let packet = UpdatePacket {
                action: sample_action(),
                payload: UpdatePayload::Raw(Bytes::from_static(&[0u8, 1, 2, 255])),
            };
            let wire = encode_packet(&packet, deflate).unwrap();
            assert_eq!(decode_packet(&wire).unwrap(), packet);
        }
    }

    #[test]
    fn test_length_mismatch_is_malformed() {
        let packet = UpdatePacket {
            action: sample_action(),
            payload: UpdatePayload::Json(serde_json::json!({"isLightOn": true})),
        };
        let mut wire = encode_packet(&packet, false).unwrap();

        // One trailing byte breaks the exact-length invariant
        wire.push(0);
        assert!(matches!(
            decode_packet(&wire),
            Err(FrameError::Malformed(_))
        ));

        // Truncation does too
        wire.truncate(wire.len() - 2);
        assert!(decode_packet(&wire).is_err());
    }

    #[test]
    fn test_short_packet_is_malformed() {
        assert!(matches!(
            decode_packet(&[1, 1, 0]),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn test_action_frame_must_be_json() {
        let action_json = br#"{"action":"update","id":"x","modelKey":"camera","newUpdateId":"u"}"#;
        let mut wire = Vec::new();
        // Action frame mislabeled as UTF-8
        encode_frame(
            &mut wire,
            FrameType::Action,
            PayloadFormat::Utf8,
            action_json,
            false,
        )
        .unwrap();
        encode_frame(&mut wire, FrameType::Payload, PayloadFormat::Json, b"{}", false).unwrap();
        assert!(matches!(
            decode_packet(&wire),
            Err(FrameError::NonJsonAction(PayloadFormat::Utf8))
        ));
    }

    #[test]
    fn test_swapped_frame_types_rejected() {
        let mut wire = Vec::new();
        encode_frame(&mut wire, FrameType::Payload, PayloadFormat::Json, b"{}", false).unwrap();
        encode_frame(&mut wire, FrameType::Action, PayloadFormat::Json, b"{}", false).unwrap();
        assert!(matches!(
            decode_packet(&wire),
            Err(FrameError::UnexpectedFrameType { .. })
        ));
    }

    #[test]
    fn test_unknown_payload_format_rejected() {
        let body = b"{}";
        let mut wire = vec![1, 9, 0, 0];
        wire.extend_from_slice(&(body.len() as u32).to_be_bytes());
        wire.extend_from_slice(body);
        let mut tail = Vec::new();
        encode_frame(&mut tail, FrameType::Payload, PayloadFormat::Json, b"{}", false).unwrap();
        wire.extend_from_slice(&tail);
        assert!(matches!(
            decode_packet(&wire),
            Err(FrameError::UnknownPayloadFormat(9))
        ));
    }

    #[test]
    fn test_wire_layout_end_to_end() {
        // Hand-built packet: plain headers, JSON action, JSON state payload
        let action_json = br#"{"action":"update","id":"x","modelKey":"camera","newUpdateId":"u"}"#;
        let state_json = br#"{"isLightOn":true}"#;

        let mut wire = vec![1, 1, 0, 0];
        wire.extend_from_slice(&(action_json.len() as u32).to_be_bytes());
        wire.extend_from_slice(action_json);
        wire.extend_from_slice(&[2, 1, 0, 0]);
        wire.extend_from_slice(&(state_json.len() as u32).to_be_bytes());
        wire.extend_from_slice(state_json);

        let packet = decode_packet(&wire).unwrap();
        assert_eq!(packet.action, sample_action());
        assert_eq!(
            packet.payload,
            UpdatePayload::Json(serde_json::json!({"isLightOn": true}))
        );
    }
}
