//! Fragmented-media stream segmentation
//!
//! The transcoder writes an unbounded fMP4 byte stream to stdout with no
//! regard for chunk boundaries. This module re-frames that stream into
//! complete container boxes and groups them into flush units ("segments"):
//! the leading `ftyp`+`moov` initialization pair, then `moof`+`mdat` media
//! pairs. A consumer never sees a truncated box.
//!
//! Flushing on either `moov` or `mdat` is one mechanism serving both
//! segment shapes; downstream logic relies on receiving exactly those two
//! shapes, in that order.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

/// Size of one box header: 4-byte big-endian length + 4-char type tag
pub const BOX_HEADER_SIZE: usize = 8;

/// Read buffer size for the stdout pump
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// One complete container box
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaBox {
    /// The raw 8-byte header
    pub header: [u8; BOX_HEADER_SIZE],
    /// Four-character type tag
    pub box_type: [u8; 4],
    /// Box payload, without the header
    pub data: Bytes,
}

impl MediaBox {
    /// Type tag as a string for logging
    pub fn type_str(&self) -> &str {
        std::str::from_utf8(&self.box_type).unwrap_or("????")
    }

    fn is_flush_boundary(&self) -> bool {
        &self.box_type == b"moov" || &self.box_type == b"mdat"
    }
}

/// Incremental box parser over a chunked byte stream
///
/// Carries partial input across `push` calls; a box is only produced once
/// all of its declared bytes have arrived.
#[derive(Default)]
pub struct Fmp4Parser {
    pending: BytesMut,
}

impl Fmp4Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every box completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<MediaBox>> {
        self.pending.extend_from_slice(chunk);
        let mut completed = Vec::new();

        while self.pending.len() >= BOX_HEADER_SIZE {
            let total = u32::from_be_bytes([
                self.pending[0],
                self.pending[1],
                self.pending[2],
                self.pending[3],
            ]) as usize;
            if total < BOX_HEADER_SIZE {
                return Err(BridgeError::Stream(format!(
                    "container box declares impossible length {}",
                    total
                )));
            }
            if self.pending.len() < total {
                // Wait for the rest of this box
                break;
            }

            let raw = self.pending.split_to(total).freeze();
            let mut header = [0u8; BOX_HEADER_SIZE];
            header.copy_from_slice(&raw[..BOX_HEADER_SIZE]);
            let mut box_type = [0u8; 4];
            box_type.copy_from_slice(&raw[4..8]);

            completed.push(MediaBox {
                header,
                box_type,
                data: raw.slice(BOX_HEADER_SIZE..),
            });
        }

        Ok(completed)
    }

    /// Bytes held back waiting for completion
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Groups boxes into flush units
///
/// Accumulates raw box bytes until a `moov` or `mdat` arrives, then emits
/// the accumulated run as one segment.
#[derive(Default)]
pub struct SegmentAssembler {
    accumulated: BytesMut,
}

impl SegmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one box; returns a completed segment on a flush boundary
    pub fn push_box(&mut self, media_box: &MediaBox) -> Option<Bytes> {
        self.accumulated.extend_from_slice(&media_box.header);
        self.accumulated.extend_from_slice(&media_box.data);
        if media_box.is_flush_boundary() {
            Some(self.accumulated.split().freeze())
        } else {
            None
        }
    }
}

/// Pump an fMP4 byte stream into a segment channel
///
/// Reads `reader` to EOF, parsing boxes and sending each completed segment
/// in arrival order. Sends apply backpressure. The channel closes when the
/// stream ends or errors, so a blocked consumer observes end-of-stream
/// instead of hanging.
pub fn spawn_segment_pump<R>(mut reader: R, tx: mpsc::Sender<Bytes>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut parser = Fmp4Parser::new();
        let mut assembler = SegmentAssembler::new();
        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Media stream read ended: {}", e);
                    break;
                }
            };

            let boxes = match parser.push(&buf[..n]) {
                Ok(boxes) => boxes,
                Err(e) => {
                    warn!("Aborting media stream: {}", e);
                    break;
                }
            };

            for media_box in &boxes {
                if let Some(segment) = assembler.push_box(media_box) {
                    if tx.send(segment).await.is_err() {
                        // Consumer is gone, stop pumping
                        return;
                    }
                }
            }
        }
        // Dropping tx closes the channel: end-of-stream for the consumer
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_box(box_type: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(BOX_HEADER_SIZE + payload.len());
        out.extend_from_slice(&((BOX_HEADER_SIZE + payload.len()) as u32).to_be_bytes());
        out.extend_from_slice(box_type);
        out.extend_from_slice(payload);
        out
    }

    fn sample_stream() -> Vec<u8> {
        let mut stream = Vec::new();
        stream.extend(make_box(b"ftyp", b"isom"));
        stream.extend(make_box(b"moov", &[1u8; 40]));
        stream.extend(make_box(b"moof", &[2u8; 24]));
        stream.extend(make_box(b"mdat", &[3u8; 100]));
        stream.extend(make_box(b"moof", &[4u8; 24]));
        stream.extend(make_box(b"mdat", &[5u8; 64]));
        stream
    }

    fn segments_for(chunks: &[&[u8]]) -> Vec<Bytes> {
        let mut parser = Fmp4Parser::new();
        let mut assembler = SegmentAssembler::new();
        let mut segments = Vec::new();
        for chunk in chunks {
            for media_box in parser.push(chunk).unwrap() {
                if let Some(segment) = assembler.push_box(&media_box) {
                    segments.push(segment);
                }
            }
        }
        segments
    }

    #[test]
    fn test_single_chunk_produces_three_segments() {
        let stream = sample_stream();
        let segments = segments_for(&[&stream]);
        // Init pair + two media pairs
        assert_eq!(segments.len(), 3);
        // Init segment starts with the ftyp box
        assert_eq!(&segments[0][4..8], b"ftyp");
        assert_eq!(&segments[1][4..8], b"moof");
    }

    #[test]
    fn test_arbitrary_splits_produce_identical_segments() {
        let stream = sample_stream();
        let reference = segments_for(&[&stream]);

        for split_size in [1usize, 3, 7, 8, 13, 64] {
            let chunks: Vec<&[u8]> = stream.chunks(split_size).collect();
            let segments = segments_for(&chunks);
            assert_eq!(segments, reference, "split_size={}", split_size);
        }
    }

    #[test]
    fn test_truncated_box_is_never_emitted() {
        let full = make_box(b"mdat", &[9u8; 50]);
        let mut parser = Fmp4Parser::new();

        let boxes = parser.push(&full[..full.len() - 1]).unwrap();
        assert!(boxes.is_empty());
        assert_eq!(parser.pending_len(), full.len() - 1);

        let boxes = parser.push(&full[full.len() - 1..]).unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].data.len(), 50);
    }

    #[test]
    fn test_impossible_box_length_is_an_error() {
        let mut parser = Fmp4Parser::new();
        let mut bad = vec![0, 0, 0, 3]; // declared length below the header size
        bad.extend_from_slice(b"ftyp");
        assert!(parser.push(&bad).is_err());
    }

    #[test]
    fn test_box_type_helpers() {
        let raw = make_box(b"moof", &[0u8; 4]);
        let mut parser = Fmp4Parser::new();
        let boxes = parser.push(&raw).unwrap();
        assert_eq!(boxes[0].type_str(), "moof");
        assert!(!boxes[0].is_flush_boundary());
    }

    #[tokio::test]
    async fn test_pump_closes_channel_on_eof() {
        let stream = sample_stream();
        let (tx, mut rx) = mpsc::channel(8);
        let reader = std::io::Cursor::new(stream);
        spawn_segment_pump(reader, tx);

        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        // Channel closed after the last segment: end-of-stream observed
        assert_eq!(count, 3);
    }
}
