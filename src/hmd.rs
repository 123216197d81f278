use serde::{Deserialize, Serialize};

/// Orientation quaternion (x, y, z, w) plus position in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub orientation: [f32; 4],
    pub position: [f32; 3],
}

/// Half-angle tangents of one eye's view frustum.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EyeFov {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

/// Headset hardware generation, as advertised in the invite descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Quest2,
    QuestPro,
    Quest3,
    Unknown(u32),
}

impl DeviceType {
    pub fn from_wire(raw: u32) -> Self {
        match raw {
            1 => DeviceType::Quest2,
            2 => DeviceType::QuestPro,
            3 => DeviceType::Quest3,
            other => DeviceType::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            DeviceType::Quest2 => 1,
            DeviceType::QuestPro => 2,
            DeviceType::Quest3 => 3,
            DeviceType::Unknown(raw) => raw,
        }
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            DeviceType::Quest2 => "Quest 2",
            DeviceType::QuestPro => "Quest Pro",
            DeviceType::Quest3 => "Quest 3",
            DeviceType::Unknown(_) => "unknown",
        }
    }
}

/// Per-eye distortion correction grid, uploaded once after pairing.
#[derive(Debug, Clone)]
pub struct RectifyMesh {
    pub id: u32,
    pub data: Vec<u8>,
}

/// The HMD device object consumed by the engine.
///
/// The engine queries poses at encode start, pushes the negotiated FOV and
/// render resolution during the handshake, and reads the encode geometry when
/// building slice headers. Implementations do their own synchronization.
pub trait HmdSource: Send + Sync {
    /// Predicted head pose at `target_ns` (engine-local clock).
    fn get_pose(&self, target_ns: i64) -> Pose;

    fn set_fov(&self, eye: usize, fov: EyeFov);

    fn set_resolution(&self, width: u32, height: u32, fps: u32);

    /// Fallback device type, used when the invite descriptor fails to decode.
    fn device_type(&self) -> DeviceType;

    fn fps(&self) -> u32;

    fn encode_width(&self) -> u32;

    fn encode_height(&self) -> u32;

    fn rectify_mesh(&self) -> RectifyMesh;
}
