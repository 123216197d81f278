use std::env;
use std::str::FromStr;

use log::warn;

use crate::hmd::DeviceType;

/// Video codec negotiated with the headset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    Hevc,
}

impl Codec {
    pub fn to_wire(self) -> u32 {
        match self {
            Codec::H264 => 0,
            Codec::Hevc => 1,
        }
    }
}

/// Host-side configuration, normally built from the environment.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Horizontal slice count per frame, 1..=4.
    pub slice_count: usize,
    pub codec: Codec,
    pub override_fps: Option<u32>,
    pub override_fb_w: Option<u32>,
    pub override_fb_h: Option<u32>,
    pub override_scale: Option<f32>,
}

impl HostConfig {
    pub fn new(slice_count: usize, codec: Codec) -> Self {
        Self {
            slice_count: slice_count.clamp(1, crate::video::MAX_SLICES),
            codec,
            override_fps: None,
            override_fb_w: None,
            override_fb_h: None,
            override_scale: None,
        }
    }

    /// Read the `OVERRIDE_*` environment variables on top of the defaults.
    pub fn from_env(slice_count: usize, codec: Codec) -> Self {
        let mut config = Self::new(slice_count, codec);
        config.override_fps = env_parse("OVERRIDE_FPS");
        config.override_fb_w = env_parse("OVERRIDE_FB_W");
        config.override_fb_h = env_parse("OVERRIDE_FB_H");
        config.override_scale = env_parse("OVERRIDE_SCALE");
        config
    }

    /// Target FPS for `device`, honoring the override and the slow-link cap.
    pub fn target_fps(&self, device: DeviceType, slow_link: bool) -> u32 {
        if let Some(fps) = self.override_fps {
            return fps;
        }
        match device {
            DeviceType::Quest2 => {
                if slow_link {
                    90
                } else {
                    120
                }
            }
            DeviceType::QuestPro => 90,
            DeviceType::Quest3 => 90,
            DeviceType::Unknown(_) => 72,
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::new(1, Codec::H264)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring unparsable {name}={raw:?}");
            None
        }
    }
}
