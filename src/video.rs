//! Triple-buffered, per-slice video pipeline.
//!
//! The encoder fills one slot per `(index, slice)` cell; the writer thread
//! drains the oldest fully-ready index and emits one schema-encoded slice
//! header plus the raw CSD/IDR bytes per slice. Slot locks are never taken in
//! pairs; slice 0's captured pose is authoritative for its whole row.

use std::sync::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use log::{debug, warn};

use crate::clock::Clock;
use crate::echo::EchoState;
use crate::error::{Error, Result};
use crate::hmd::{HmdSource, Pose};
use crate::schema::{self, SLICE_FLAG_CSD, SLICE_FLAG_LAST, SliceHeader};
use crate::session::Outbound;
use crate::topics::TOPIC_SLICE_0;

pub const SWAPCHAIN_DEPTH: usize = 3;
pub const MAX_SLICES: usize = 4;

/// Per-buffer arena bound; appends past this are an encoder contract
/// violation.
pub const MAX_SLOT_BYTES: usize = 16 * 1024 * 1024;

/// Consecutive encoder-contract violations before the whole pipeline resets.
const VIOLATION_LIMIT: u32 = 3;

/// Pushed into by the video encoder, one frame slice at a time, in strict
/// `start_encode -> send_csd* -> send_idr+ -> flush_stream` order.
///
/// `start_encode` blocks while the previous frame in the slot is still
/// awaiting transmission; that is the pipeline's backpressure.
pub trait EncoderSink: Send + Sync {
    fn start_encode(&self, index: usize, slice: usize, target_ns: i64) -> Result<()>;
    fn send_csd(&self, index: usize, slice: usize, bytes: &[u8]) -> Result<()>;
    fn send_idr(&self, index: usize, slice: usize, bytes: &[u8]) -> Result<()>;
    fn flush_stream(&self, index: usize, slice: usize, target_ns: i64) -> Result<()>;
}

#[derive(Default)]
struct VideoSlot {
    csd: Vec<u8>,
    idr: Vec<u8>,
    needs_flush: bool,
    encode_started_ns: i64,
    encode_done_ns: i64,
    tx_started_ns: i64,
    tx_done_ns: i64,
    pose: Pose,
    pose_ns: i64,
}

impl VideoSlot {
    fn clear(&mut self) {
        self.csd.clear();
        self.idr.clear();
        self.needs_flush = false;
    }
}

struct Slot {
    state: Mutex<VideoSlot>,
    drained: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(VideoSlot::default()),
            drained: Condvar::new(),
        }
    }
}

/// Everything the writer needs besides the pipeline itself.
pub(crate) struct WriterCtx<'a> {
    pub out: &'a Outbound,
    pub clock: &'a dyn Clock,
    pub echo: &'a Mutex<EchoState>,
    pub fps: u32,
    pub mesh_id: u32,
    pub encode_height: u32,
}

pub struct VideoPipeline {
    slots: Vec<Slot>,
    slice_count: usize,
    frame_counter: AtomicU64,
    sent_first_frame: AtomicBool,
    violations: AtomicU32,
}

impl VideoPipeline {
    pub fn new(slice_count: usize) -> Self {
        let slice_count = slice_count.clamp(1, MAX_SLICES);
        Self {
            slots: (0..slice_count * SWAPCHAIN_DEPTH)
                .map(|_| Slot::new())
                .collect(),
            slice_count,
            frame_counter: AtomicU64::new(0),
            sent_first_frame: AtomicBool::new(false),
            violations: AtomicU32::new(0),
        }
    }

    /// Record an encoder-contract violation. The offending frame is dropped
    /// by the caller; repeated violations reset the pipeline. Must not be
    /// called with a slot lock held.
    fn contract_violation(&self, msg: String) -> Error {
        let count = self.violations.fetch_add(1, Ordering::Relaxed) + 1;
        warn!("encoder contract violation ({count}/{VIOLATION_LIMIT}): {msg}");
        if count >= VIOLATION_LIMIT {
            warn!("repeated encoder contract violations, resetting pipeline");
            self.reset_stream();
        }
        Error::Pipeline(msg)
    }

    pub fn slice_count(&self) -> usize {
        self.slice_count
    }

    pub fn frames_sent(&self) -> u64 {
        self.frame_counter.load(Ordering::Relaxed)
    }

    fn slot(&self, slice: usize, index: usize) -> &Slot {
        &self.slots[slice * SWAPCHAIN_DEPTH + index]
    }

    fn check_cell(&self, index: usize, slice: usize) -> Result<()> {
        if index >= SWAPCHAIN_DEPTH || slice >= self.slice_count {
            return Err(self.contract_violation(format!(
                "slot ({index}, {slice}) out of range for depth {SWAPCHAIN_DEPTH} x {}",
                self.slice_count
            )));
        }
        Ok(())
    }

    /// Encoder entry: await the slot being drained, then arm it with the
    /// pose captured at `target_ns`.
    pub fn begin_encode(
        &self,
        index: usize,
        slice: usize,
        target_ns: i64,
        hmd: &dyn HmdSource,
        clock: &dyn Clock,
    ) -> Result<()> {
        self.check_cell(index, slice)?;
        let slot = self.slot(slice, index);
        let mut state = slot.state.lock().unwrap();
        while state.needs_flush {
            state = slot.drained.wait(state).unwrap();
        }
        state.encode_started_ns = clock.now_ns();
        state.pose = hmd.get_pose(target_ns);
        state.pose_ns = target_ns;
        state.csd.clear();
        state.idr.clear();
        Ok(())
    }

    pub fn append_csd(&self, index: usize, slice: usize, bytes: &[u8]) -> Result<()> {
        self.append(index, slice, bytes, true)
    }

    pub fn append_idr(&self, index: usize, slice: usize, bytes: &[u8]) -> Result<()> {
        self.append(index, slice, bytes, false)
    }

    fn append(&self, index: usize, slice: usize, bytes: &[u8], is_csd: bool) -> Result<()> {
        self.check_cell(index, slice)?;
        let mut state = self.slot(slice, index).state.lock().unwrap();
        if state.needs_flush {
            drop(state);
            return Err(self.contract_violation(format!(
                "append into undrained slot ({index}, {slice})"
            )));
        }
        let filled = if is_csd { state.csd.len() } else { state.idr.len() };
        if filled + bytes.len() > MAX_SLOT_BYTES {
            drop(state);
            return Err(self.contract_violation(format!(
                "slot ({index}, {slice}) overrun: {filled} + {} bytes",
                bytes.len()
            )));
        }
        let buf = if is_csd { &mut state.csd } else { &mut state.idr };
        buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Encoder exit: hand the slot to the writer.
    pub fn finish_encode(&self, index: usize, slice: usize, clock: &dyn Clock) -> Result<()> {
        self.check_cell(index, slice)?;
        let mut state = self.slot(slice, index).state.lock().unwrap();
        state.encode_done_ns = clock.now_ns();
        state.needs_flush = true;
        self.violations.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Emit the oldest fully-ready index, if any. Returns whether a frame was
    /// consumed (sent or suppressed).
    pub(crate) fn flush_ready(&self, ctx: &WriterCtx) -> Result<bool> {
        let mut best: Option<(usize, i64)> = None;
        for index in 0..SWAPCHAIN_DEPTH {
            let mut started_ns = 0;
            let mut ready = true;
            for slice in 0..self.slice_count {
                let state = self.slot(slice, index).state.lock().unwrap();
                if !state.needs_flush {
                    ready = false;
                    break;
                }
                if slice == 0 {
                    started_ns = state.encode_started_ns;
                }
            }
            if ready && best.is_none_or(|(_, best_ns)| started_ns < best_ns) {
                best = Some((index, started_ns));
            }
        }
        let Some((index, _)) = best else {
            return Ok(false);
        };

        // First frame of a (re)paired session must be a keyframe.
        let row_pose;
        let row_pose_ns;
        let row_started_ns;
        let pred_delta;
        let tx_started_ns;
        {
            let mut slot0 = self.slot(0, index).state.lock().unwrap();
            if slot0.csd.is_empty() && !self.sent_first_frame.load(Ordering::Relaxed) {
                drop(slot0);
                debug!("suppressing non-keyframe index {index} before first keyframe");
                self.drop_row(index);
                return Ok(true);
            }
            tx_started_ns = ctx.clock.now_ns();
            slot0.tx_started_ns = tx_started_ns;
            row_pose = slot0.pose;
            row_pose_ns = slot0.pose_ns;
            row_started_ns = slot0.encode_started_ns;
            pred_delta = slot0.encode_done_ns - slot0.encode_started_ns;
        }

        let (base, pose_timestamp, timestamp_09) = {
            let echo = ctx.echo.lock().unwrap();
            (
                echo.to_target(row_started_ns),
                echo.to_target(row_pose_ns),
                echo.to_target(tx_started_ns) - pred_delta,
            )
        };
        let duration_a = 1_000_000_000 / ctx.fps.max(1) as i64;
        let duration_b = duration_a + pred_delta;
        let frame_idx = self.frame_counter.load(Ordering::Relaxed);

        for slice in 0..self.slice_count {
            let slot = self.slot(slice, index);
            let mut state = slot.state.lock().unwrap();
            if slice != 0 {
                state.tx_started_ns = ctx.clock.now_ns();
            }
            let mut flags = 0;
            if !state.csd.is_empty() {
                flags |= SLICE_FLAG_CSD;
            }
            if slice == self.slice_count - 1 {
                flags |= SLICE_FLAG_LAST;
            }
            let header = SliceHeader {
                frame_idx,
                rectify_mesh_id: ctx.mesh_id,
                pose: row_pose,
                pose_timestamp,
                slice_num: slice as u32,
                flags,
                blit_y_pos: ctx.encode_height / self.slice_count as u32 * slice as u32,
                crop_blocks: ctx.encode_height / 16 / self.slice_count as u32,
                pipeline_pred_delta: pred_delta,
                timestamp_09,
                timestamp_0d: base + duration_a,
                timestamp_0c: base + duration_a + duration_b,
                timestamp_0b: base + duration_a + duration_b + pred_delta,
            };
            let topic = TOPIC_SLICE_0 + slice as u8;
            ctx.out.send_to_topic(topic, &schema::encode(&header)?)?;
            if !state.csd.is_empty() {
                ctx.out.send_to_topic(topic, &state.csd)?;
            }
            if !state.idr.is_empty() {
                ctx.out.send_to_topic(topic, &state.idr)?;
            }
            state.tx_done_ns = ctx.clock.now_ns();
            debug!(
                "frame {frame_idx} slice {slice}: {} csd + {} idr bytes in {} us",
                state.csd.len(),
                state.idr.len(),
                (state.tx_done_ns - state.tx_started_ns) / 1_000
            );
            state.clear();
            slot.drained.notify_all();
        }

        self.frame_counter.fetch_add(1, Ordering::Relaxed);
        self.sent_first_frame.store(true, Ordering::Relaxed);
        Ok(true)
    }

    fn drop_row(&self, index: usize) {
        for slice in 0..self.slice_count {
            let slot = self.slot(slice, index);
            let mut state = slot.state.lock().unwrap();
            state.clear();
            slot.drained.notify_all();
        }
    }

    /// Clear every slot; encoders blocked in `begin_encode` wake up.
    pub fn drain(&self) {
        for slot in &self.slots {
            let mut state = slot.state.lock().unwrap();
            state.clear();
            slot.drained.notify_all();
        }
    }

    /// Drain and restart the stream: the next emitted frame must again be a
    /// keyframe.
    pub fn reset_stream(&self) {
        self.drain();
        self.sent_first_frame.store(false, Ordering::Relaxed);
        self.frame_counter.store(0, Ordering::Relaxed);
        self.violations.store(0, Ordering::Relaxed);
    }

    /// True if `index` has every slice armed for transmission.
    pub fn index_ready(&self, index: usize) -> bool {
        (0..self.slice_count)
            .all(|slice| self.slot(slice, index).state.lock().unwrap().needs_flush)
    }

    pub fn any_needs_flush(&self) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.state.lock().unwrap().needs_flush)
    }
}

impl Drop for VideoPipeline {
    fn drop(&mut self) {
        self.drain();
    }
}
