//! Topic-byte assignments for the multiplexed bulk stream.

/// Filler frames pad the output buffer to the next 1024-byte boundary and are
/// dropped by the receiver.
pub const TOPIC_FILLER: u8 = 0;
pub const TOPIC_HOSTINFO_ADV: u8 = 1;
pub const TOPIC_COMMAND: u8 = 2;
pub const TOPIC_AUDIO_CONTROL: u8 = 3;
pub const TOPIC_INPUT_CONTROL: u8 = 4;
pub const TOPIC_POSE: u8 = 5;
pub const TOPIC_HANDS: u8 = 6;
pub const TOPIC_SKELETON: u8 = 7;
pub const TOPIC_BODY: u8 = 8;
pub const TOPIC_LOGGING: u8 = 9;
pub const TOPIC_VIDEO: u8 = 10;
pub const TOPIC_HAPTIC: u8 = 11;
pub const TOPIC_MESH: u8 = 12;
pub const TOPIC_RUNTIME_IPC: u8 = 13;
pub const TOPIC_SLICE_0: u8 = 14;
pub const TOPIC_SLICE_1: u8 = 15;
pub const TOPIC_SLICE_2: u8 = 16;
pub const TOPIC_SLICE_3: u8 = 17;

pub fn topic_name(topic: u8) -> &'static str {
    match topic {
        TOPIC_FILLER => "filler",
        TOPIC_HOSTINFO_ADV => "hostinfo-adv",
        TOPIC_COMMAND => "command",
        TOPIC_AUDIO_CONTROL => "audio-control",
        TOPIC_INPUT_CONTROL => "input-control",
        TOPIC_POSE => "pose",
        TOPIC_HANDS => "hands",
        TOPIC_SKELETON => "skeleton",
        TOPIC_BODY => "body",
        TOPIC_LOGGING => "logging",
        TOPIC_VIDEO => "video",
        TOPIC_HAPTIC => "haptic",
        TOPIC_MESH => "mesh",
        TOPIC_RUNTIME_IPC => "runtime-ipc",
        TOPIC_SLICE_0 => "slice-0",
        TOPIC_SLICE_1 => "slice-1",
        TOPIC_SLICE_2 => "slice-2",
        TOPIC_SLICE_3 => "slice-3",
        _ => "unknown",
    }
}
