#![allow(dead_code)]

//! Shared fixtures: an in-memory transport, a scripted clock, and a stub HMD.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use xrsp_host::clock::Clock;
use xrsp_host::framing::{FrameDecoder, FrameEncoder, TopicFrame, USB_READ_LEN};
use xrsp_host::hmd::{DeviceType, EyeFov, HmdSource, Pose, RectifyMesh};
use xrsp_host::schema::{self, DeviceDescriptor, HostInfoMsg};
use xrsp_host::session::Session;
use xrsp_host::topics::TOPIC_HOSTINFO_ADV;
use xrsp_host::usb::Transport;

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Captures everything the host sends; inbound bytes are scripted.
pub struct Loopback {
    sent: Mutex<Vec<u8>>,
    inbound: Mutex<VecDeque<Vec<u8>>>,
    valid: AtomicBool,
    resets: AtomicUsize,
    fail_sends: AtomicBool,
    slow: bool,
}

impl Loopback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            inbound: Mutex::new(VecDeque::new()),
            valid: AtomicBool::new(true),
            resets: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
            slow: false,
        })
    }

    pub fn take_sent(&self) -> Vec<u8> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    /// Make every bulk write fail as if the device vanished; cleared by
    /// `reset()`.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

impl Transport for Loopback {
    fn send(&self, bytes: &[u8]) -> io::Result<usize> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device gone"));
        }
        self.sent.lock().unwrap().extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn recv(&self, buf: &mut [u8], deadline: Duration) -> io::Result<usize> {
        if let Some(chunk) = self.inbound.lock().unwrap().pop_front() {
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            return Ok(n);
        }
        thread::sleep(deadline);
        Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"))
    }

    fn reset(&self) -> io::Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.fail_sends.store(false, Ordering::SeqCst);
        self.valid.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    fn slow_link(&self) -> bool {
        self.slow
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }
}

/// Pops scripted instants first, then keeps advancing 1 ms per read.
pub struct FakeClock {
    script: Mutex<VecDeque<i64>>,
    last: AtomicI64,
}

impl FakeClock {
    pub fn new(script: &[i64]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
            last: AtomicI64::new(0),
        })
    }
}

impl Clock for FakeClock {
    fn now_ns(&self) -> i64 {
        if let Some(t) = self.script.lock().unwrap().pop_front() {
            self.last.store(t, Ordering::SeqCst);
            return t;
        }
        self.last.fetch_add(1_000_000, Ordering::SeqCst) + 1_000_000
    }
}

pub struct TestHmd;

impl HmdSource for TestHmd {
    fn get_pose(&self, _target_ns: i64) -> Pose {
        Pose {
            orientation: [0.0, 0.0, 0.0, 1.0],
            position: [0.0, 1.6, 0.0],
        }
    }

    fn set_fov(&self, _eye: usize, _fov: EyeFov) {}

    fn set_resolution(&self, _width: u32, _height: u32, _fps: u32) {}

    fn device_type(&self) -> DeviceType {
        DeviceType::Quest2
    }

    fn fps(&self) -> u32 {
        72
    }

    fn encode_width(&self) -> u32 {
        3584
    }

    fn encode_height(&self) -> u32 {
        1920
    }

    fn rectify_mesh(&self) -> RectifyMesh {
        RectifyMesh {
            id: 1,
            data: vec![0u8; 64],
        }
    }
}

pub fn invite_descriptor() -> DeviceDescriptor {
    DeviceDescriptor {
        device_type: DeviceType::Quest2.to_wire(),
        panel_width: 3664,
        panel_height: 1920,
        refresh_hz: 120,
        fov: [EyeFov {
            angle_left: -0.9,
            angle_right: 0.9,
            angle_up: 0.9,
            angle_down: -0.9,
        }; 2],
    }
}

/// Frame a hostinfo message the way the headset would and feed it in.
pub fn feed_hostinfo(session: &mut Session, encoder: &mut FrameEncoder, msg: &HostInfoMsg) {
    let mut wire = Vec::new();
    encoder.encode_message(&mut wire, TOPIC_HOSTINFO_ADV, &msg.to_bytes());
    for chunk in wire.chunks(USB_READ_LEN) {
        session.pump_inbound(chunk).unwrap();
    }
}

/// Run both handshake rounds; leaves the session paired.
pub fn run_handshake(session: &mut Session, encoder: &mut FrameEncoder) {
    use xrsp_host::schema::{
        HOSTINFO_ACK, HOSTINFO_CODEGEN_ACK, HOSTINFO_INVITE, HOSTINFO_PAIRING_ACK,
    };
    let invite = HostInfoMsg::new(HOSTINFO_INVITE, &invite_descriptor()).unwrap();
    for _ in 0..2 {
        feed_hostinfo(session, encoder, &invite);
        feed_hostinfo(session, encoder, &HostInfoMsg::bare(HOSTINFO_ACK));
        feed_hostinfo(session, encoder, &HostInfoMsg::bare(HOSTINFO_CODEGEN_ACK));
        feed_hostinfo(session, encoder, &HostInfoMsg::bare(HOSTINFO_PAIRING_ACK));
    }
}

/// Feed pre-framed payloads on an arbitrary topic.
pub fn feed_topic(session: &mut Session, encoder: &mut FrameEncoder, topic: u8, payloads: &[Vec<u8>]) {
    let mut wire = Vec::new();
    for payload in payloads {
        encoder.encode_message(&mut wire, topic, payload);
    }
    for chunk in wire.chunks(USB_READ_LEN) {
        session.pump_inbound(chunk).unwrap();
    }
}

/// Complete one ping/pong exchange so the clock offset is established and
/// the writer will emit video. Drains the transport's sent buffer.
pub fn establish_clock(session: &mut Session, transport: &Loopback, encoder: &mut FrameEncoder) {
    use xrsp_host::schema::{EchoPayload, HOSTINFO_ECHO};
    session.tick_writer().unwrap();
    let frames = decode_sent(&transport.take_sent());
    let ping = frames
        .iter()
        .rev()
        .find_map(|frame| {
            if frame.topic != TOPIC_HOSTINFO_ADV {
                return None;
            }
            let msg = HostInfoMsg::parse(&frame.payload).ok()?;
            if msg.msg_type != HOSTINFO_ECHO {
                return None;
            }
            let echo: EchoPayload = schema::decode(&msg.body).ok()?;
            (echo.reply == 0).then_some(echo)
        })
        .expect("writer emitted no ping");
    let pong = EchoPayload {
        reply: 1,
        org: ping.xmt,
        recv: ping.xmt,
        xmt: ping.xmt,
        offset: 0,
    };
    feed_hostinfo(
        session,
        encoder,
        &HostInfoMsg::new(HOSTINFO_ECHO, &pong).unwrap(),
    );
    transport.take_sent();
}

pub fn decode_sent(bytes: &[u8]) -> Vec<TopicFrame> {
    let mut decoder = FrameDecoder::new();
    let mut frames = Vec::new();
    for chunk in bytes.chunks(USB_READ_LEN) {
        decoder.push(chunk, &mut |f| frames.push(f)).unwrap();
    }
    frames
}

/// Human-readable label per outbound frame, for trace assertions.
pub fn label_frame(frame: &TopicFrame) -> String {
    use xrsp_host::schema::{
        CommandMsg, ControlMsg, EchoPayload, OkPayload, RoundPayload, HOSTINFO_CODEGEN,
        HOSTINFO_ECHO, HOSTINFO_OK, HOSTINFO_PAIRING, hostinfo_type_name,
    };
    use xrsp_host::topics::*;
    match frame.topic {
        TOPIC_HOSTINFO_ADV => {
            let msg = HostInfoMsg::parse(&frame.payload).unwrap();
            match msg.msg_type {
                HOSTINFO_OK => {
                    let ok: OkPayload = schema::decode(&msg.body).unwrap();
                    format!("OK({})", if ok.session_type == 3 { 2 } else { 1 })
                }
                HOSTINFO_CODEGEN | HOSTINFO_PAIRING => {
                    let round: RoundPayload = schema::decode(&msg.body).unwrap();
                    format!("{}({})", hostinfo_type_name(msg.msg_type), round.round)
                }
                HOSTINFO_ECHO => {
                    let echo: EchoPayload = schema::decode(&msg.body).unwrap();
                    if echo.reply == 0 { "PING".into() } else { "PONG".into() }
                }
                other => hostinfo_type_name(other).to_string(),
            }
        }
        TOPIC_COMMAND => {
            let cmd: CommandMsg = schema::decode(&frame.payload).unwrap();
            format!("COMMAND({})", cmd.command)
        }
        TOPIC_AUDIO_CONTROL => "AUDIO_CONTROL".into(),
        TOPIC_INPUT_CONTROL => {
            let msg: ControlMsg = schema::decode(&frame.payload).unwrap();
            format!("INPUT_CONTROL({})", msg.kind)
        }
        TOPIC_VIDEO => "VIDEO_PROBE".into(),
        TOPIC_MESH => "MESH".into(),
        TOPIC_RUNTIME_IPC => "RIPC".into(),
        other => format!("topic-{other}"),
    }
}
