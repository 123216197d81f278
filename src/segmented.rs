//! Reassembly of schema-encoded messages split across consecutive topic
//! frames.
//!
//! A segmented packet is a preamble frame `{idx_u32, N x seg_len_u32}` (segment
//! lengths in 8-byte quadwords) followed by N data frames. One context serves
//! one topic; contexts on different topics are independent.

use crate::error::{Error, Result};

pub type SegmentHandler = Box<dyn FnMut(&mut [Vec<u8>]) + Send>;

pub struct SegmentedContext {
    num_segments: usize,
    expected: Vec<usize>,
    valid: Vec<usize>,
    segments: Vec<Vec<u8>>,
    /// 0 while awaiting the preamble, then 1..=N for the segment being read.
    reading_idx: usize,
    msg_idx: u32,
    handler: SegmentHandler,
}

impl SegmentedContext {
    pub fn new(num_segments: usize, handler: SegmentHandler) -> Self {
        Self {
            num_segments,
            expected: vec![0; num_segments],
            valid: vec![0; num_segments],
            segments: vec![Vec::new(); num_segments],
            reading_idx: 0,
            msg_idx: 0,
            handler,
        }
    }

    pub fn preamble_len(&self) -> usize {
        4 + 4 * self.num_segments
    }

    /// Feed one topic frame. Completion hands the segment buffers to the
    /// handler and resets; any shape mismatch resets and reports.
    pub fn consume(&mut self, frame: &[u8]) -> Result<()> {
        if self.reading_idx == 0 {
            if frame.len() != self.preamble_len() {
                return Err(Error::Framing(format!(
                    "expected {}-byte segment preamble, got {} bytes",
                    self.preamble_len(),
                    frame.len()
                )));
            }
            self.msg_idx = u32::from_le_bytes(frame[..4].try_into().unwrap());
            for seg in 0..self.num_segments {
                let off = 4 + seg * 4;
                let qwords = u32::from_le_bytes(frame[off..off + 4].try_into().unwrap());
                self.expected[seg] = qwords as usize * 8;
                self.valid[seg] = 0;
                self.segments[seg].clear();
            }
            self.reading_idx = 1;
            self.advance_complete()?;
            return Ok(());
        }

        let seg = self.reading_idx - 1;
        let missing = self.expected[seg] - self.valid[seg];
        if frame.len() > missing {
            let err = Error::Framing(format!(
                "segment {seg} overrun: {} bytes with {missing} missing",
                frame.len()
            ));
            self.reset();
            return Err(err);
        }
        self.segments[seg].extend_from_slice(frame);
        self.valid[seg] += frame.len();
        if self.valid[seg] == self.expected[seg] {
            self.reading_idx += 1;
            self.advance_complete()?;
        }
        Ok(())
    }

    /// Skip zero-length segments and fire the handler once all are complete.
    fn advance_complete(&mut self) -> Result<()> {
        while self.reading_idx <= self.num_segments && self.expected[self.reading_idx - 1] == 0 {
            self.reading_idx += 1;
        }
        if self.reading_idx > self.num_segments {
            (self.handler)(&mut self.segments);
            self.reset();
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.reading_idx = 0;
        for seg in 0..self.num_segments {
            self.expected[seg] = 0;
            self.valid[seg] = 0;
            self.segments[seg].clear();
        }
    }
}

/// Emit the preamble and data frames for `segments`, each padded to a
/// quadword boundary. Inverse of what [`SegmentedContext`] consumes.
pub fn emit_segments(msg_idx: u32, segments: &[&[u8]]) -> Vec<Vec<u8>> {
    let mut frames = Vec::with_capacity(1 + segments.len());
    let mut preamble = Vec::with_capacity(4 + 4 * segments.len());
    preamble.extend_from_slice(&msg_idx.to_le_bytes());
    for seg in segments {
        let qwords = seg.len().div_ceil(8) as u32;
        preamble.extend_from_slice(&qwords.to_le_bytes());
    }
    frames.push(preamble);
    for seg in segments {
        let mut data = seg.to_vec();
        data.resize(seg.len().div_ceil(8) * 8, 0);
        frames.push(data);
    }
    frames
}
