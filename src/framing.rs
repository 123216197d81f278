//! Length-delimited topic frames over the bulk stream.
//!
//! Frame header (8 bytes, little-endian):
//! ```text
//! byte 0    bit 0: has_alignment_padding
//!           bit 1: packet_version_is_internal
//!           bit 2: version
//!           bits 3-7: reserved
//! byte 1    topic
//! bytes 2-3 reserved
//! bytes 4-5 num_words (total frame size / 4, header included; 0 = 0x10000)
//! bytes 6-7 sequence_num
//! ```
//! When `has_alignment_padding` is set the final payload byte holds the pad
//! length in [1,3]; intermediate pad bytes are 0xDE.

use log::warn;

use crate::error::{Error, Result};
use crate::topics::{TOPIC_FILLER, topic_name};

pub const HEADER_LEN: usize = 8;

/// Largest payload chunk carried by one frame. A maximal frame occupies
/// exactly 0x40000 bytes on the wire, which is where the `num_words = 0`
/// wrap case comes from.
pub const MAX_CHUNK: usize = 0x3FFF8;

/// Outgoing buffers are padded to this boundary with filler frames.
pub const BULK_BOUNDARY: usize = 1024;

/// Size of one bulk IN read.
pub const USB_READ_LEN: usize = 1024;

const FLAG_ALIGNMENT_PADDING: u8 = 0x01;
const FLAG_INTERNAL_VERSION: u8 = 0x02;
const FLAG_VERSION: u8 = 0x04;

const PAD_FILL: u8 = 0xDE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub topic: u8,
    pub has_alignment_padding: bool,
    pub internal_version: bool,
    pub version: u8,
    /// Total frame length in 4-byte words, header included.
    pub num_words: u32,
    pub sequence_num: u16,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Framing(format!(
                "header truncated: {} bytes",
                bytes.len()
            )));
        }
        let raw_words = u16::from_le_bytes([bytes[4], bytes[5]]);
        let num_words = if raw_words == 0 {
            0x10000
        } else {
            raw_words as u32
        };
        if num_words < 2 {
            return Err(Error::Framing(format!("bad num_words {num_words}")));
        }
        Ok(Self {
            topic: bytes[1],
            has_alignment_padding: bytes[0] & FLAG_ALIGNMENT_PADDING != 0,
            internal_version: bytes[0] & FLAG_INTERNAL_VERSION != 0,
            version: (bytes[0] & FLAG_VERSION) >> 2,
            num_words,
            sequence_num: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut flags = 0u8;
        if self.has_alignment_padding {
            flags |= FLAG_ALIGNMENT_PADDING;
        }
        if self.internal_version {
            flags |= FLAG_INTERNAL_VERSION;
        }
        if self.version != 0 {
            flags |= FLAG_VERSION;
        }
        let words = self.num_words;
        let raw_words = if words >= 0x10000 { 0 } else { words as u16 };
        let mut out = [0u8; HEADER_LEN];
        out[0] = flags;
        out[1] = self.topic;
        out[4..6].copy_from_slice(&raw_words.to_le_bytes());
        out[6..8].copy_from_slice(&self.sequence_num.to_le_bytes());
        out
    }

    /// Total on-wire frame length, header included.
    pub fn total_len(&self) -> usize {
        self.num_words as usize * 4
    }

    pub fn payload_len(&self) -> usize {
        self.total_len() - HEADER_LEN
    }
}

/// One decoded topic frame, alignment padding already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFrame {
    pub topic: u8,
    pub sequence_num: u16,
    pub payload: Vec<u8>,
}

/// Outbound framer. One data frame plus its optional filler share a sequence
/// number; the counter advances once per pair.
pub struct FrameEncoder {
    sequence: u16,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self { sequence: 0 }
    }

    /// Frame `data` onto `out`, slicing into [`MAX_CHUNK`]-sized frames and
    /// padding the buffer to the next 1024-byte boundary after each frame.
    pub fn encode_message(&mut self, out: &mut Vec<u8>, topic: u8, data: &[u8]) {
        if data.is_empty() {
            self.emit_frame(out, topic, &[]);
            return;
        }
        for chunk in data.chunks(MAX_CHUNK) {
            self.emit_frame(out, topic, chunk);
        }
    }

    fn emit_frame(&mut self, out: &mut Vec<u8>, topic: u8, data: &[u8]) {
        let align = (4 - data.len() % 4) % 4;
        let total = HEADER_LEN + data.len() + align;
        let header = FrameHeader {
            topic,
            has_alignment_padding: align != 0,
            internal_version: false,
            version: 0,
            num_words: (total / 4) as u32,
            sequence_num: self.sequence,
        };
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(data);
        if align != 0 {
            for _ in 0..align - 1 {
                out.push(PAD_FILL);
            }
            out.push(align as u8);
        }

        let gap = (BULK_BOUNDARY - out.len() % BULK_BOUNDARY) % BULK_BOUNDARY;
        if gap >= HEADER_LEN {
            let filler = FrameHeader {
                topic: TOPIC_FILLER,
                has_alignment_padding: false,
                internal_version: false,
                version: 0,
                num_words: (gap / 4) as u32,
                sequence_num: self.sequence,
            };
            out.extend_from_slice(&filler.to_bytes());
            out.resize(out.len() + gap - HEADER_LEN, 0);
        }

        self.sequence = self.sequence.wrapping_add(1);
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

struct WorkingPacket {
    header: FrameHeader,
    payload: Vec<u8>,
}

impl WorkingPacket {
    fn missing(&self) -> usize {
        self.header.payload_len() - self.payload.len()
    }
}

/// Inbound framer. Holds at most one in-flight packet across USB reads.
pub struct FrameDecoder {
    working: Option<WorkingPacket>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { working: None }
    }

    /// Consume one USB read. Completed frames are handed to `sink`; filler
    /// frames are dropped here. A framing error discards the working packet.
    pub fn push(&mut self, mut chunk: &[u8], sink: &mut dyn FnMut(TopicFrame)) -> Result<()> {
        while !chunk.is_empty() {
            let mut working = match self.working.take() {
                Some(working) => working,
                None => {
                    if chunk.len() < HEADER_LEN {
                        warn!(
                            "discarding {}-byte inter-frame remainder (desync)",
                            chunk.len()
                        );
                        return Ok(());
                    }
                    let header = FrameHeader::parse(chunk)?;
                    chunk = &chunk[HEADER_LEN..];
                    WorkingPacket {
                        payload: Vec::with_capacity(header.payload_len()),
                        header,
                    }
                }
            };

            let take = working.missing().min(chunk.len());
            working.payload.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];

            if working.missing() == 0 {
                self.finish(working, sink)?;
            } else {
                self.working = Some(working);
            }
        }
        Ok(())
    }

    fn finish(&mut self, working: WorkingPacket, sink: &mut dyn FnMut(TopicFrame)) -> Result<()> {
        let header = working.header;
        if header.topic == TOPIC_FILLER {
            return Ok(());
        }
        let mut payload = working.payload;
        if header.has_alignment_padding {
            let pad = *payload.last().ok_or_else(|| {
                Error::Framing("alignment padding flagged on empty payload".into())
            })? as usize;
            if !(1..=3).contains(&pad) || pad > payload.len() {
                return Err(Error::Framing(format!(
                    "bad alignment byte {pad} on topic {}",
                    topic_name(header.topic)
                )));
            }
            payload.truncate(payload.len() - pad);
        }
        sink(TopicFrame {
            topic: header.topic,
            sequence_num: header.sequence_num,
            payload,
        });
        Ok(())
    }

    /// Drop any in-flight packet (framing-error recovery).
    pub fn discard_working(&mut self) {
        self.working = None;
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<TopicFrame> {
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for chunk in bytes.chunks(USB_READ_LEN) {
            decoder.push(chunk, &mut |f| frames.push(f)).unwrap();
        }
        frames
    }

    #[test]
    fn round_trip_various_sizes() {
        for n in [0usize, 1, 2, 3, 4, 5, 7, 8, 1000, 4096] {
            let data: Vec<u8> = (0..n).map(|i| i as u8).collect();
            let mut encoder = FrameEncoder::new();
            let mut wire = Vec::new();
            encoder.encode_message(&mut wire, 7, &data);
            let frames = decode_all(&wire);
            assert_eq!(frames.len(), 1, "n={n}");
            assert_eq!(frames[0].topic, 7);
            assert_eq!(frames[0].payload, data, "n={n}");
        }
    }

    #[test]
    fn alignment_byte_in_range() {
        for n in [1usize, 2, 3, 5, 6, 7] {
            let mut encoder = FrameEncoder::new();
            let mut wire = Vec::new();
            encoder.encode_message(&mut wire, 3, &vec![0xAA; n]);
            let header = FrameHeader::parse(&wire).unwrap();
            assert!(header.has_alignment_padding);
            let payload = &wire[HEADER_LEN..header.total_len()];
            let pad = *payload.last().unwrap() as usize;
            assert!((1..=3).contains(&pad), "n={n} pad={pad}");
            assert_eq!(payload.len() - pad, n);
        }
    }

    #[test]
    fn output_is_bulk_aligned() {
        for n in [0usize, 1, 8, 100, 1016, 1017, 5000] {
            let mut encoder = FrameEncoder::new();
            let mut wire = Vec::new();
            encoder.encode_message(&mut wire, 5, &vec![1; n]);
            // A 4-byte gap cannot hold a filler header; everything else pads.
            if wire.len() % BULK_BOUNDARY != 0 {
                assert_eq!(BULK_BOUNDARY - wire.len() % BULK_BOUNDARY, 4, "n={n}");
            }
        }
    }

    #[test]
    fn filler_after_short_frame() {
        let mut encoder = FrameEncoder::new();
        let mut wire = Vec::new();
        encoder.encode_message(&mut wire, 9, &[0u8; 8]);
        assert_eq!(wire.len(), BULK_BOUNDARY);
        let filler = FrameHeader::parse(&wire[16..]).unwrap();
        assert_eq!(filler.topic, TOPIC_FILLER);
        assert_eq!(filler.num_words, (BULK_BOUNDARY - 16) as u32 / 4);
        // Receiver sees only the data frame.
        let frames = decode_all(&wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.len(), 8);
    }

    #[test]
    fn large_payload_chunking() {
        let data = vec![0x42u8; 0x80000];
        let mut encoder = FrameEncoder::new();
        let mut wire = Vec::new();
        encoder.encode_message(&mut wire, 11, &data);
        let frames = decode_all(&wire);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].payload.len(), MAX_CHUNK);
        assert_eq!(frames[1].payload.len(), MAX_CHUNK);
        assert_eq!(frames[2].payload.len(), 0x10);
        let joined: Vec<u8> = frames.into_iter().flat_map(|f| f.payload).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn max_chunk_wraps_num_words() {
        let mut encoder = FrameEncoder::new();
        let mut wire = Vec::new();
        encoder.encode_message(&mut wire, 2, &vec![0; MAX_CHUNK]);
        assert_eq!(u16::from_le_bytes([wire[4], wire[5]]), 0);
        let header = FrameHeader::parse(&wire).unwrap();
        assert_eq!(header.total_len(), MAX_CHUNK + HEADER_LEN);
    }

    #[test]
    fn sequence_shared_across_pair() {
        let mut encoder = FrameEncoder::new();
        let mut wire = Vec::new();
        encoder.encode_message(&mut wire, 4, &[0u8; 4]);
        encoder.encode_message(&mut wire, 4, &[0u8; 4]);
        let data0 = FrameHeader::parse(&wire).unwrap();
        let fill0 = FrameHeader::parse(&wire[12..]).unwrap();
        let data1 = FrameHeader::parse(&wire[BULK_BOUNDARY..]).unwrap();
        assert_eq!(data0.sequence_num, fill0.sequence_num);
        assert_eq!(data1.sequence_num, data0.sequence_num + 1);
    }

    #[test]
    fn short_remainder_discarded() {
        let mut encoder = FrameEncoder::new();
        let mut wire = Vec::new();
        encoder.emit_frame(&mut wire, 6, &[1, 2, 3, 4]);
        // A trailing sub-header fragment in the same read must not survive
        // into the next push.
        let mut stream = wire[..12].to_vec();
        stream.extend_from_slice(&[0xFF; 5]);
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        decoder.push(&stream, &mut |f| frames.push(f)).unwrap();
        assert_eq!(frames.len(), 1);
        let mut wire2 = Vec::new();
        encoder.emit_frame(&mut wire2, 6, &[9, 9, 9, 9]);
        decoder.push(&wire2, &mut |f| frames.push(f)).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].payload, vec![9, 9, 9, 9]);
    }

    #[test]
    fn bad_alignment_byte_is_error() {
        let header = FrameHeader {
            topic: 3,
            has_alignment_padding: true,
            internal_version: false,
            version: 0,
            num_words: 3,
            sequence_num: 0,
        };
        let mut wire = header.to_bytes().to_vec();
        wire.extend_from_slice(&[0, 0, 0, 0xDE]);
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(&wire, &mut |_| {}).is_err());
    }
}
