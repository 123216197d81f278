//! Wire structs for the structured payloads carried inside topic frames.
//!
//! Everything here is encoded with the fixed-width little-endian bincode
//! configuration; field order is the wire order.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::hmd::{EyeFov, Pose};

fn wire_config() -> impl bincode::config::Config {
    bincode::config::legacy()
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(msg, wire_config()).map_err(|e| Error::Schema(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, wire_config())
        .map_err(|e| Error::Schema(e.to_string()))?;
    Ok(value)
}

// --- hostinfo-adv ---

pub const HOSTINFO_INVITE: u32 = 1;
pub const HOSTINFO_OK: u32 = 2;
pub const HOSTINFO_ACK: u32 = 3;
pub const HOSTINFO_CODEGEN: u32 = 4;
pub const HOSTINFO_CODEGEN_ACK: u32 = 5;
pub const HOSTINFO_PAIRING: u32 = 6;
pub const HOSTINFO_PAIRING_ACK: u32 = 7;
pub const HOSTINFO_ECHO: u32 = 8;
pub const HOSTINFO_BYE: u32 = 9;

/// Envelope on the hostinfo topic: 4-byte message type, then the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfoMsg {
    pub msg_type: u32,
    pub body: Vec<u8>,
}

impl HostInfoMsg {
    pub fn new<T: Serialize>(msg_type: u32, body: &T) -> Result<Self> {
        Ok(Self {
            msg_type,
            body: encode(body)?,
        })
    }

    pub fn bare(msg_type: u32) -> Self {
        Self {
            msg_type,
            body: Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.body.len());
        out.extend_from_slice(&self.msg_type.to_le_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::Schema(format!(
                "hostinfo message truncated: {} bytes",
                bytes.len()
            )));
        }
        Ok(Self {
            msg_type: u32::from_le_bytes(bytes[..4].try_into().unwrap()),
            body: bytes[4..].to_vec(),
        })
    }
}

pub fn hostinfo_type_name(msg_type: u32) -> &'static str {
    match msg_type {
        HOSTINFO_INVITE => "INVITE",
        HOSTINFO_OK => "OK",
        HOSTINFO_ACK => "ACK",
        HOSTINFO_CODEGEN => "CODEGEN",
        HOSTINFO_CODEGEN_ACK => "CODEGEN_ACK",
        HOSTINFO_PAIRING => "PAIRING",
        HOSTINFO_PAIRING_ACK => "PAIRING_ACK",
        HOSTINFO_ECHO => "ECHO",
        HOSTINFO_BYE => "BYE",
        _ => "unknown",
    }
}

/// Device descriptor carried in the invite body.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub device_type: u32,
    pub panel_width: u32,
    pub panel_height: u32,
    pub refresh_hz: u32,
    pub fov: [EyeFov; 2],
}

/// OK payload for both handshake rounds.
///
/// First round: `session_type = 1`, the rest zero. Second round:
/// `session_type = 3`, `error_code = 1`, slice count in the low nibble of
/// `stream_config`, codec in the next nibble, negotiated FPS alongside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OkPayload {
    pub session_type: u32,
    pub error_code: u32,
    pub stream_config: u32,
    pub fps: u32,
}

impl OkPayload {
    pub fn first() -> Self {
        Self {
            session_type: 1,
            error_code: 0,
            stream_config: 0,
            fps: 0,
        }
    }

    pub fn second(slice_count: u32, codec: u32, fps: u32) -> Self {
        Self {
            session_type: 3,
            error_code: 1,
            stream_config: (slice_count & 0xF) | (codec << 4),
            fps,
        }
    }

    pub fn slice_count(&self) -> u32 {
        self.stream_config & 0xF
    }

    pub fn codec(&self) -> u32 {
        (self.stream_config >> 4) & 0xF
    }
}

/// CODEGEN / PAIRING round marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundPayload {
    pub round: u32,
}

/// Ping/pong body on the hostinfo topic. `reply = 0` is a ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoPayload {
    pub reply: u32,
    pub org: i64,
    pub recv: i64,
    pub xmt: i64,
    pub offset: i64,
}

// --- command topic ---

pub const CMD_CHEMX_TOGGLE: u32 = 1;
pub const CMD_ASW_TOGGLE: u32 = 2;
pub const CMD_DROP_FRAME_STATE: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMsg {
    pub command: u32,
    pub value: u32,
}

// --- video topic ---

/// Capability probe sent once the first handshake round completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoProbe {
    pub slice_count: u32,
    pub codec: u32,
}

/// Per-slice header preceding the raw CSD/IDR bytes on a slice topic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SliceHeader {
    pub frame_idx: u64,
    pub rectify_mesh_id: u32,
    pub pose: Pose,
    /// Pose capture time, target clock.
    pub pose_timestamp: i64,
    pub slice_num: u32,
    /// bit 0: CSD present, bit 1: last slice of the frame.
    pub flags: u32,
    pub blit_y_pos: u32,
    pub crop_blocks: u32,
    pub pipeline_pred_delta: i64,
    /// Transmission start estimate, target clock.
    pub timestamp_09: i64,
    /// GPU-end estimate.
    pub timestamp_0d: i64,
    /// Decode deadline.
    pub timestamp_0c: i64,
    /// Decode deadline, late bound.
    pub timestamp_0b: i64,
}

pub const SLICE_FLAG_CSD: u32 = 0x1;
pub const SLICE_FLAG_LAST: u32 = 0x2;

// --- haptics / audio-control / input-control ---

pub const INPUT_LEFT: u32 = 0;
pub const INPUT_RIGHT: u32 = 1;
pub const INPUT_GAMEPAD: u32 = 2;

pub const HAPTIC_SIMPLE: u32 = 0;
pub const HAPTIC_BUFFERED: u32 = 1;

/// Buffered haptics carry at most this many waveform bytes.
pub const HAPTIC_MAX_DATA: usize = 25;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HapticEvent {
    pub timestamp: i64,
    pub input_type: u32,
    pub haptic_type: u32,
    pub amplitude: f32,
    pub pose_timestamp: i64,
    pub data: Vec<u8>,
}

/// Shared shape of the audio-control and input-control messages; the field
/// semantics live on the headset side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlMsg {
    pub kind: u16,
    pub enable: u16,
    pub param: u32,
    pub value_a: f32,
    pub value_b: f32,
}

pub const CONTROL_AUDIO_ROUTE: u16 = 0;
pub const CONTROL_HANDS: u16 = 1;
pub const CONTROL_BODY: u16 = 2;
pub const CONTROL_EYES: u16 = 3;

// --- runtime IPC ---

/// First segment of every RIPC message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RipcHeader {
    pub cmd_id: u32,
    pub next_size: u32,
    pub client_id: u32,
    pub unk: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsureServiceStarted {
    pub package: String,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectToRemoteServer {
    pub server_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcInvoke {
    pub method_id: u64,
    pub args: Vec<u8>,
}

// --- pose / logging ---

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseSample {
    pub timestamp: i64,
    pub pose: Pose,
    pub linear_velocity: [f32; 3],
    pub angular_velocity: [f32; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: u32,
    pub text: String,
}

// --- rectify mesh ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshUpload {
    pub mesh_id: u32,
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostinfo_envelope_round_trip() {
        let msg = HostInfoMsg::new(HOSTINFO_OK, &OkPayload::first()).unwrap();
        let parsed = HostInfoMsg::parse(&msg.to_bytes()).unwrap();
        assert_eq!(parsed.msg_type, HOSTINFO_OK);
        let ok: OkPayload = decode(&parsed.body).unwrap();
        assert_eq!(ok, OkPayload::first());
    }

    #[test]
    fn hostinfo_truncated() {
        assert!(HostInfoMsg::parse(&[1, 0]).is_err());
    }

    #[test]
    fn ok_second_packs_nibbles() {
        let ok = OkPayload::second(4, 1, 90);
        assert_eq!(ok.slice_count(), 4);
        assert_eq!(ok.codec(), 1);
        assert_eq!(ok.fps, 90);
        assert_eq!(ok.session_type, 3);
        assert_eq!(ok.error_code, 1);
    }

    #[test]
    fn echo_payload_is_fixed_width() {
        let echo = EchoPayload {
            reply: 1,
            org: -5,
            recv: 10,
            xmt: 20,
            offset: 0,
        };
        let bytes = encode(&echo).unwrap();
        assert_eq!(bytes.len(), 4 + 4 * 8);
        let back: EchoPayload = decode(&bytes).unwrap();
        assert_eq!(back, echo);
    }

    #[test]
    fn slice_header_round_trip() {
        let header = SliceHeader {
            frame_idx: 42,
            rectify_mesh_id: 7,
            pose: Pose {
                orientation: [0.0, 0.0, 0.0, 1.0],
                position: [0.1, 1.6, -0.2],
            },
            pose_timestamp: 123,
            slice_num: 2,
            flags: SLICE_FLAG_CSD | SLICE_FLAG_LAST,
            blit_y_pos: 640,
            crop_blocks: 40,
            pipeline_pred_delta: 2_000_000,
            timestamp_09: 1,
            timestamp_0d: 2,
            timestamp_0c: 3,
            timestamp_0b: 4,
        };
        let back: SliceHeader = decode(&encode(&header).unwrap()).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn decode_ignores_qword_padding() {
        let msg = RipcHeader {
            cmd_id: 1,
            next_size: 32,
            client_id: 9,
            unk: 0,
        };
        let mut bytes = encode(&msg).unwrap();
        bytes.extend_from_slice(&[0; 8]);
        let back: RipcHeader = decode(&bytes).unwrap();
        assert_eq!(back, msg);
    }
}
