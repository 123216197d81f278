//! Per-topic routing of decoded frames to their handlers.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::{debug, log, warn, Level};

use crate::error::{Error, Result};
use crate::framing::TopicFrame;
use crate::handshake::{self, PairingState};
use crate::schema::{self, LogRecord, PoseSample};
use crate::segmented::SegmentedContext;
use crate::session::{Handlers, Shared, TopicHandler};
use crate::topics::*;

pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    pose_ctx: SegmentedContext,
    ripc_ctx: SegmentedContext,
    hands: Option<TopicHandler>,
    skeleton: Option<TopicHandler>,
    body: Option<TopicHandler>,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<Shared>, handlers: Handlers) -> Self {
        let pose_shared = shared.clone();
        let mut pose_cb = handlers.pose;
        let pose_ctx = SegmentedContext::new(
            1,
            Box::new(move |segments: &mut [Vec<u8>]| {
                match schema::decode::<PoseSample>(&segments[0]) {
                    Ok(sample) => {
                        *pose_shared.latest_pose.lock().unwrap() = Some(sample);
                        if let Some(cb) = pose_cb.as_mut() {
                            cb(&sample);
                        }
                    }
                    Err(err) => warn!("undecodable pose sample: {err}"),
                }
            }),
        );

        let ripc_shared = shared.clone();
        let ripc_ctx = SegmentedContext::new(
            2,
            Box::new(move |segments: &mut [Vec<u8>]| {
                ripc_shared.ripc.on_reply(segments);
            }),
        );

        Self {
            shared,
            pose_ctx,
            ripc_ctx,
            hands: handlers.hands,
            skeleton: handlers.skeleton,
            body: handlers.body,
        }
    }

    pub(crate) fn dispatch(&mut self, frame: TopicFrame) -> Result<()> {
        match frame.topic {
            TOPIC_HOSTINFO_ADV => handshake::handle_hostinfo(&self.shared, &frame.payload),
            TOPIC_POSE => {
                self.require_paired(frame.topic)?;
                self.pose_ctx.consume(&frame.payload)
            }
            TOPIC_SKELETON => {
                self.require_paired(frame.topic)?;
                if let Some(cb) = self.skeleton.as_mut() {
                    cb(&frame.payload);
                }
                Ok(())
            }
            TOPIC_LOGGING => {
                self.require_paired(frame.topic)?;
                forward_log(&frame.payload)
            }
            TOPIC_HANDS => {
                if let Some(cb) = self.hands.as_mut() {
                    cb(&frame.payload);
                }
                Ok(())
            }
            TOPIC_BODY => {
                if let Some(cb) = self.body.as_mut() {
                    cb(&frame.payload);
                }
                Ok(())
            }
            TOPIC_RUNTIME_IPC => self.ripc_ctx.consume(&frame.payload),
            TOPIC_SLICE_0..=TOPIC_SLICE_3 => {
                debug!(
                    "slice status on {} ({} bytes)",
                    topic_name(frame.topic),
                    frame.payload.len()
                );
                Ok(())
            }
            other => {
                warn!(
                    "dropping frame on unhandled topic {} ({other})",
                    topic_name(other)
                );
                Ok(())
            }
        }
    }

    /// Streaming topics arriving before pairing completes tear the session
    /// down: BYE plus a USB reset.
    fn require_paired(&self, topic: u8) -> Result<()> {
        if *self.shared.pairing.lock().unwrap() == PairingState::Paired {
            return Ok(());
        }
        self.shared.bye_requested.store(true, Ordering::SeqCst);
        self.shared.reset_requested.store(true, Ordering::SeqCst);
        Err(Error::Protocol(format!(
            "{} frame before pairing completed",
            topic_name(topic)
        )))
    }
}

/// Headset-side log records interleave with host logs under their own target.
fn forward_log(payload: &[u8]) -> Result<()> {
    let record: LogRecord = schema::decode(payload)?;
    let level = match record.level {
        0 => Level::Error,
        1 => Level::Warn,
        2 => Level::Info,
        3 => Level::Debug,
        _ => Level::Trace,
    };
    log!(target: "headset", level, "{}", record.text);
    Ok(())
}
