//! Haptics and the audio/input control side channels.

use crate::error::{Error, Result};
use crate::schema::{
    self, ControlMsg, HAPTIC_BUFFERED, HAPTIC_MAX_DATA, HAPTIC_SIMPLE, HapticEvent,
};
use crate::session::Outbound;
use crate::topics::{TOPIC_AUDIO_CONTROL, TOPIC_HAPTIC, TOPIC_INPUT_CONTROL};

pub(crate) fn send_haptic(out: &Outbound, event: &HapticEvent) -> Result<()> {
    match event.haptic_type {
        HAPTIC_SIMPLE => {
            if !event.data.is_empty() {
                return Err(Error::Protocol(
                    "simple haptic carries amplitude only".into(),
                ));
            }
        }
        HAPTIC_BUFFERED => {
            if event.data.len() > HAPTIC_MAX_DATA {
                return Err(Error::Protocol(format!(
                    "buffered haptic waveform too long: {} > {HAPTIC_MAX_DATA}",
                    event.data.len()
                )));
            }
        }
        other => {
            return Err(Error::Protocol(format!("unknown haptic type {other}")));
        }
    }
    out.send_to_topic(TOPIC_HAPTIC, &schema::encode(event)?)
}

pub(crate) fn send_audio_control(out: &Outbound, msg: &ControlMsg) -> Result<()> {
    out.send_to_topic(TOPIC_AUDIO_CONTROL, &schema::encode(msg)?)
}

pub(crate) fn send_input_control(out: &Outbound, msg: &ControlMsg) -> Result<()> {
    out.send_to_topic(TOPIC_INPUT_CONTROL, &schema::encode(msg)?)
}
