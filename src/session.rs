//! The session-owning host engine: shared state, the outbound framing path,
//! and the reader/writer threads.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};

use crate::clock::Clock;
use crate::config::HostConfig;
use crate::control;
use crate::dispatch::Dispatcher;
use crate::echo::EchoState;
use crate::error::{Error, Result};
use crate::framing::{FrameDecoder, FrameEncoder, USB_READ_LEN};
use crate::handshake::PairingState;
use crate::hmd::{DeviceType, HmdSource};
use crate::ripc::RipcClient;
use crate::schema::{
    ControlMsg, HOSTINFO_BYE, HOSTINFO_ECHO, HapticEvent, HostInfoMsg, PoseSample,
};
use crate::topics::TOPIC_HOSTINFO_ADV;
use crate::usb::Transport;
use crate::video::{EncoderSink, VideoPipeline, WriterCtx};

/// How long without inbound bytes before the pairing stall policy kicks in.
const STALL_NS: i64 = 1_000_000_000;

const READ_DEADLINE: Duration = Duration::from_millis(1);
const WRITER_PERIOD: Duration = Duration::from_millis(1);

/// Outbound framing path. The frame encoder mutex doubles as the transport
/// lock: it is held across every chunk of one logical message and never
/// across anything else.
pub struct Outbound {
    transport: Arc<dyn Transport>,
    encoder: Mutex<FrameEncoder>,
}

impl Outbound {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            encoder: Mutex::new(FrameEncoder::new()),
        }
    }

    /// Frame `data` onto `topic` and push it out in one bulk write.
    pub fn send_to_topic(&self, topic: u8, data: &[u8]) -> Result<()> {
        let mut encoder = self.encoder.lock().unwrap();
        let mut buf = Vec::with_capacity(data.len() + 1024);
        encoder.encode_message(&mut buf, topic, data);
        self.transport.send(&buf)?;
        Ok(())
    }

    /// Send several payloads on one topic without another message
    /// interleaving between them (segmented packets need this).
    pub fn send_frames(&self, topic: u8, frames: &[Vec<u8>]) -> Result<()> {
        let mut encoder = self.encoder.lock().unwrap();
        let mut buf = Vec::new();
        for frame in frames {
            encoder.encode_message(&mut buf, topic, frame);
        }
        self.transport.send(&buf)?;
        Ok(())
    }
}

/// Negotiated display state, guarded by the pose lock during handshake.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DisplayState {
    pub device_type: DeviceType,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for DisplayState {
    fn default() -> Self {
        Self {
            device_type: DeviceType::Unknown(0),
            fps: 72,
            width: 0,
            height: 0,
        }
    }
}

pub type TopicHandler = Box<dyn FnMut(&[u8]) + Send>;

/// Consumer callbacks for the tracking topics.
#[derive(Default)]
pub struct Handlers {
    pub pose: Option<Box<dyn FnMut(&PoseSample) + Send>>,
    pub hands: Option<TopicHandler>,
    pub skeleton: Option<TopicHandler>,
    pub body: Option<TopicHandler>,
}

pub(crate) struct Shared {
    pub transport: Arc<dyn Transport>,
    pub out: Outbound,
    pub clock: Arc<dyn Clock>,
    pub hmd: Arc<dyn HmdSource>,
    pub config: HostConfig,
    pub pairing: Mutex<PairingState>,
    pub echo: Mutex<EchoState>,
    pub display: Mutex<DisplayState>,
    pub latest_pose: Mutex<Option<PoseSample>>,
    pub pipeline: VideoPipeline,
    pub ripc: RipcClient,
    pub mesh_id: u32,
    pub bye_requested: AtomicBool,
    pub reset_requested: AtomicBool,
}

struct SessionIo {
    decoder: FrameDecoder,
    dispatcher: Dispatcher,
}

/// One host session over one headset.
pub struct Session {
    shared: Arc<Shared>,
    io: Option<SessionIo>,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new(
        transport: Arc<dyn Transport>,
        hmd: Arc<dyn HmdSource>,
        clock: Arc<dyn Clock>,
        config: HostConfig,
        handlers: Handlers,
    ) -> Self {
        let mesh_id = hmd.rectify_mesh().id;
        let shared = Arc::new(Shared {
            out: Outbound::new(transport.clone()),
            transport,
            clock,
            hmd,
            pipeline: VideoPipeline::new(config.slice_count),
            config,
            pairing: Mutex::new(PairingState::WaitFirst),
            echo: Mutex::new(EchoState::new()),
            display: Mutex::new(DisplayState::default()),
            latest_pose: Mutex::new(None),
            ripc: RipcClient::new(),
            mesh_id,
            bye_requested: AtomicBool::new(false),
            reset_requested: AtomicBool::new(false),
        });
        let dispatcher = Dispatcher::new(shared.clone(), handlers);
        Self {
            shared,
            io: Some(SessionIo {
                decoder: FrameDecoder::new(),
                dispatcher,
            }),
            running: Arc::new(AtomicBool::new(false)),
            reader: None,
            writer: None,
        }
    }

    /// Spawn the reader and writer threads.
    pub fn start(&mut self) -> Result<()> {
        let io = self.io.take().ok_or_else(|| {
            Error::Protocol("session already started".into())
        })?;
        self.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let running = self.running.clone();
        self.reader = Some(
            thread::Builder::new()
                .name("xrsp-reader".into())
                .spawn(move || reader_loop(shared, io, running))
                .map_err(|e| Error::Transport(io::Error::other(e)))?,
        );

        let shared = self.shared.clone();
        let running = self.running.clone();
        self.writer = Some(
            thread::Builder::new()
                .name("xrsp-writer".into())
                .spawn(move || writer_loop(shared, running))
                .map_err(|e| Error::Transport(io::Error::other(e)))?,
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.shared.pipeline.drain();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }

    /// Feed raw USB bytes through the framer and dispatcher. Only available
    /// while the reader thread is not running (single-step mode).
    pub fn pump_inbound(&mut self, chunk: &[u8]) -> Result<()> {
        let io = self.io.as_mut().ok_or_else(|| {
            Error::Protocol("inbound pump is owned by the reader thread".into())
        })?;
        pump_io(io, chunk);
        Ok(())
    }

    /// One writer pass: BYE policy, periodic ping, at most one video frame.
    /// Returns whether a frame left the pipeline.
    pub fn tick_writer(&self) -> Result<bool> {
        writer_pass(&self.shared)
    }

    /// The sink handed to the video encoder.
    pub fn encoder_sink(&self) -> EncoderHandle {
        EncoderHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn pairing_state(&self) -> PairingState {
        *self.shared.pairing.lock().unwrap()
    }

    /// Current peer-minus-local clock estimate.
    pub fn clock_offset_ns(&self) -> i64 {
        self.shared.echo.lock().unwrap().offset_ns()
    }

    pub fn frames_sent(&self) -> u64 {
        self.shared.pipeline.frames_sent()
    }

    pub fn pipeline(&self) -> &VideoPipeline {
        &self.shared.pipeline
    }

    /// Negotiated render target, valid once an invite has been applied.
    pub fn render_size(&self) -> (u32, u32) {
        let display = self.shared.display.lock().unwrap();
        (display.width, display.height)
    }

    pub fn latest_pose(&self) -> Option<PoseSample> {
        *self.shared.latest_pose.lock().unwrap()
    }

    /// Raw access to the outbound framing path.
    pub fn outbound(&self) -> &Outbound {
        &self.shared.out
    }

    pub fn ripc(&self) -> &RipcClient {
        &self.shared.ripc
    }

    pub fn send_to_topic(&self, topic: u8, data: &[u8]) -> Result<()> {
        self.shared.out.send_to_topic(topic, data)
    }

    pub fn send_haptic(&self, event: &HapticEvent) -> Result<()> {
        control::send_haptic(&self.shared.out, event)
    }

    pub fn send_audio_control(&self, msg: &ControlMsg) -> Result<()> {
        control::send_audio_control(&self.shared.out, msg)
    }

    pub fn send_input_control(&self, msg: &ControlMsg) -> Result<()> {
        control::send_input_control(&self.shared.out, msg)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Clonable [`EncoderSink`] implementation backed by the session.
#[derive(Clone)]
pub struct EncoderHandle {
    shared: Arc<Shared>,
}

impl EncoderSink for EncoderHandle {
    fn start_encode(&self, index: usize, slice: usize, target_ns: i64) -> Result<()> {
        self.shared.pipeline.begin_encode(
            index,
            slice,
            target_ns,
            self.shared.hmd.as_ref(),
            self.shared.clock.as_ref(),
        )
    }

    fn send_csd(&self, index: usize, slice: usize, bytes: &[u8]) -> Result<()> {
        self.shared.pipeline.append_csd(index, slice, bytes)
    }

    fn send_idr(&self, index: usize, slice: usize, bytes: &[u8]) -> Result<()> {
        self.shared.pipeline.append_idr(index, slice, bytes)
    }

    fn flush_stream(&self, index: usize, slice: usize, _target_ns: i64) -> Result<()> {
        self.shared
            .pipeline
            .finish_encode(index, slice, self.shared.clock.as_ref())
    }
}

fn pump_io(io: &mut SessionIo, chunk: &[u8]) {
    let mut frames = Vec::new();
    if let Err(err) = io.decoder.push(chunk, &mut |frame| frames.push(frame)) {
        io.decoder.discard_working();
        warn!("framing error, resynchronizing: {err}");
    }
    for frame in frames {
        if let Err(err) = io.dispatcher.dispatch(frame) {
            match err {
                Error::Protocol(msg) => warn!("protocol: {msg}"),
                Error::Schema(msg) => warn!("schema: {msg}"),
                Error::Framing(msg) => warn!("framing: {msg}"),
                other => warn!("dispatch failed: {other}"),
            }
        }
    }
}

fn reader_loop(shared: Arc<Shared>, mut io: SessionIo, running: Arc<AtomicBool>) {
    let mut buf = [0u8; USB_READ_LEN];
    let mut last_rx_ns = shared.clock.now_ns();
    while running.load(Ordering::SeqCst) {
        match shared.transport.recv(&mut buf, READ_DEADLINE) {
            Ok(0) => {}
            Ok(n) => {
                last_rx_ns = shared.clock.now_ns();
                pump_io(&mut io, &buf[..n]);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) if err.kind() == io::ErrorKind::NotConnected => {
                warn!("headset disconnected: {err}");
                handle_disconnect(&shared);
                last_rx_ns = shared.clock.now_ns();
            }
            Err(err) => warn!("usb read failed: {err}"),
        }

        let now = shared.clock.now_ns();
        let paired = *shared.pairing.lock().unwrap() == PairingState::Paired;
        if !paired && now - last_rx_ns >= STALL_NS {
            if !shared.transport.is_valid() {
                warn!("pairing stalled on invalid transport, reopening device");
                handle_disconnect(&shared);
            } else {
                warn!("pairing stalled, requesting BYE");
                shared.bye_requested.store(true, Ordering::SeqCst);
            }
            last_rx_ns = now;
        }
    }
}

fn writer_loop(shared: Arc<Shared>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        if let Err(err) = writer_pass(&shared) {
            warn!("writer pass failed: {err}");
        }
        thread::sleep(WRITER_PERIOD);
    }
}

/// One writer pass with the transport-failure policy applied: an invalid
/// transport or a failed write resets the session and reopens the device,
/// whatever the pairing state.
fn writer_pass(shared: &Arc<Shared>) -> Result<bool> {
    if !shared.transport.is_valid() {
        warn!("transport invalid, reopening device");
        handle_disconnect(shared);
        return Ok(false);
    }
    match writer_pass_inner(shared) {
        Err(Error::Transport(err)) => {
            warn!("usb write failed ({err}), resetting session");
            handle_disconnect(shared);
            Ok(false)
        }
        other => other,
    }
}

fn writer_pass_inner(shared: &Arc<Shared>) -> Result<bool> {
    if shared.bye_requested.swap(false, Ordering::SeqCst) {
        let bye = HostInfoMsg::bare(HOSTINFO_BYE);
        if let Err(err) = shared.out.send_to_topic(TOPIC_HOSTINFO_ADV, &bye.to_bytes()) {
            warn!("BYE send failed: {err}");
        }
        if shared.reset_requested.swap(false, Ordering::SeqCst) {
            if let Err(err) = shared.transport.reset() {
                warn!("usb reset failed: {err}");
            }
        }
        fail_session(shared);
        return Ok(false);
    }

    let state = *shared.pairing.lock().unwrap();
    let ping = if state != PairingState::WaitFirst {
        let now = shared.clock.now_ns();
        let mut echo = shared.echo.lock().unwrap();
        if echo.ping_due(now) {
            Some(echo.make_ping(now))
        } else {
            None
        }
    } else {
        None
    };
    if let Some(ping) = ping {
        let msg = HostInfoMsg::new(HOSTINFO_ECHO, &ping)?;
        shared.out.send_to_topic(TOPIC_HOSTINFO_ADV, &msg.to_bytes())?;
    }

    if state != PairingState::Paired {
        return Ok(false);
    }
    // No video until the clock offset is established.
    if !shared.echo.lock().unwrap().established() {
        return Ok(false);
    }
    let fps = shared.display.lock().unwrap().fps;
    let ctx = WriterCtx {
        out: &shared.out,
        clock: shared.clock.as_ref(),
        echo: &shared.echo,
        fps,
        mesh_id: shared.mesh_id,
        encode_height: shared.hmd.encode_height(),
    };
    shared.pipeline.flush_ready(&ctx)
}

/// Regress to a cold session: pairing restarts, the clock estimate is
/// forgotten, the pipeline is drained, pending RPCs fail.
pub(crate) fn fail_session(shared: &Arc<Shared>) {
    info!("session reset, returning to WAIT_FIRST");
    *shared.pairing.lock().unwrap() = PairingState::WaitFirst;
    shared.echo.lock().unwrap().reset();
    shared.pipeline.reset_stream();
    shared.ripc.reset();
}

pub(crate) fn handle_disconnect(shared: &Arc<Shared>) {
    fail_session(shared);
    if let Err(err) = shared.transport.reset() {
        warn!("device reopen failed: {err}");
    }
}
