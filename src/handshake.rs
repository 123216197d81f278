//! Multi-round pairing state machine.
//!
//! All transitions are driven by received hostinfo messages. The state only
//! advances; the single regression path is a session reset on disconnect.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::Result;
use crate::hmd::DeviceType;
use crate::schema::{
    self, CMD_ASW_TOGGLE, CMD_CHEMX_TOGGLE, CMD_DROP_FRAME_STATE, CONTROL_AUDIO_ROUTE,
    CONTROL_BODY, CONTROL_HANDS, CommandMsg, ControlMsg, DeviceDescriptor, EchoPayload,
    HOSTINFO_ACK, HOSTINFO_BYE, HOSTINFO_CODEGEN, HOSTINFO_CODEGEN_ACK, HOSTINFO_ECHO,
    HOSTINFO_INVITE, HOSTINFO_OK, HOSTINFO_PAIRING, HOSTINFO_PAIRING_ACK, HostInfoMsg,
    MeshUpload, OkPayload, RoundPayload, VideoProbe, hostinfo_type_name,
};
use crate::session::{Shared, fail_session};
use crate::topics::{
    TOPIC_AUDIO_CONTROL, TOPIC_COMMAND, TOPIC_HOSTINFO_ADV, TOPIC_INPUT_CONTROL, TOPIC_MESH,
    TOPIC_VIDEO,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    WaitFirst,
    WaitSecond,
    Pairing,
    Paired,
}

pub(crate) fn handle_hostinfo(shared: &Arc<Shared>, payload: &[u8]) -> Result<()> {
    let msg = HostInfoMsg::parse(payload)?;
    let state = *shared.pairing.lock().unwrap();
    debug!(
        "hostinfo {} in {state:?}",
        hostinfo_type_name(msg.msg_type)
    );

    match msg.msg_type {
        HOSTINFO_ECHO => return handle_echo(shared, &msg.body),
        HOSTINFO_BYE => {
            warn!("peer ended the session");
            fail_session(shared);
            return Ok(());
        }
        _ => {}
    }

    match state {
        PairingState::WaitFirst => match msg.msg_type {
            HOSTINFO_INVITE => {
                apply_invite(shared, &msg.body);
                send_hostinfo(shared, HostInfoMsg::new(HOSTINFO_OK, &OkPayload::first())?)
            }
            HOSTINFO_ACK => send_round(shared, HOSTINFO_CODEGEN, 1),
            HOSTINFO_CODEGEN_ACK => send_round(shared, HOSTINFO_PAIRING, 1),
            HOSTINFO_PAIRING_ACK => {
                let probe = VideoProbe {
                    slice_count: shared.config.slice_count as u32,
                    codec: shared.config.codec.to_wire(),
                };
                shared
                    .out
                    .send_to_topic(TOPIC_VIDEO, &schema::encode(&probe)?)?;
                let ping = {
                    let now = shared.clock.now_ns();
                    shared.echo.lock().unwrap().make_ping(now)
                };
                send_hostinfo(shared, HostInfoMsg::new(HOSTINFO_ECHO, &ping)?)?;
                *shared.pairing.lock().unwrap() = PairingState::WaitSecond;
                Ok(())
            }
            _ => drop_unexpected(state, msg.msg_type),
        },

        PairingState::WaitSecond | PairingState::Pairing => match msg.msg_type {
            HOSTINFO_INVITE => {
                shared.echo.lock().unwrap().reset();
                apply_invite(shared, &msg.body);
                let (fps, slices, codec) = {
                    let display = shared.display.lock().unwrap();
                    (
                        display.fps,
                        shared.config.slice_count as u32,
                        shared.config.codec.to_wire(),
                    )
                };
                send_hostinfo(
                    shared,
                    HostInfoMsg::new(HOSTINFO_OK, &OkPayload::second(slices, codec, fps))?,
                )?;
                *shared.pairing.lock().unwrap() = PairingState::Pairing;
                Ok(())
            }
            HOSTINFO_ACK => send_round(shared, HOSTINFO_CODEGEN, 2),
            HOSTINFO_CODEGEN_ACK => send_round(shared, HOSTINFO_PAIRING, 2),
            HOSTINFO_PAIRING_ACK => {
                finish_pairing(shared)?;
                *shared.pairing.lock().unwrap() = PairingState::Paired;
                info!("session paired");
                Ok(())
            }
            _ => drop_unexpected(state, msg.msg_type),
        },

        PairingState::Paired => {
            // Duplicate handshake traffic after pairing is ignored.
            debug!(
                "duplicate {} while paired",
                hostinfo_type_name(msg.msg_type)
            );
            Ok(())
        }
    }
}

fn drop_unexpected(state: PairingState, msg_type: u32) -> Result<()> {
    warn!(
        "dropping {} in {state:?}",
        hostinfo_type_name(msg_type)
    );
    Ok(())
}

fn send_hostinfo(shared: &Arc<Shared>, msg: HostInfoMsg) -> Result<()> {
    shared
        .out
        .send_to_topic(TOPIC_HOSTINFO_ADV, &msg.to_bytes())
}

fn send_round(shared: &Arc<Shared>, msg_type: u32, round: u32) -> Result<()> {
    send_hostinfo(shared, HostInfoMsg::new(msg_type, &RoundPayload { round })?)
}

/// Apply the invite's device descriptor: FOV, render resolution and target
/// FPS, all under the pose lock. A broken descriptor falls back to the HMD's
/// own device type and leaves the display geometry alone.
fn apply_invite(shared: &Arc<Shared>, body: &[u8]) {
    let slow_link = shared.transport.slow_link();
    let mut display = shared.display.lock().unwrap();
    match schema::decode::<DeviceDescriptor>(body) {
        Ok(desc) => {
            let device_type = DeviceType::from_wire(desc.device_type);
            let fps = shared.config.target_fps(device_type, slow_link);
            let scale = shared.config.override_scale.unwrap_or(1.0);
            let mut width = (desc.panel_width as f32 * scale) as u32;
            let mut height = (desc.panel_height as f32 * scale) as u32;
            if slow_link {
                width /= 2;
                height /= 2;
            }
            if let Some(w) = shared.config.override_fb_w {
                width = w;
            }
            if let Some(h) = shared.config.override_fb_h {
                height = h;
            }
            info!(
                "invite from {} panel {}x{}@{} -> render {width}x{height}@{fps} (slow_link={slow_link})",
                device_type.label(),
                desc.panel_width,
                desc.panel_height,
                desc.refresh_hz
            );
            for (eye, fov) in desc.fov.iter().enumerate() {
                shared.hmd.set_fov(eye, *fov);
            }
            shared.hmd.set_resolution(width, height, fps);
            *display = crate::session::DisplayState {
                device_type,
                fps,
                width,
                height,
            };
        }
        Err(err) => {
            // Keep pairing alive; only the display update is skipped.
            warn!("undecodable invite descriptor ({err}), keeping current display config");
            let device_type = shared.hmd.device_type();
            display.device_type = device_type;
            display.fps = shared.config.target_fps(device_type, slow_link);
        }
    }
}

/// Second PAIRING_ACK: push the control-plane defaults, bring up the core
/// services, upload the rectify mesh, and restart the video stream.
fn finish_pairing(shared: &Arc<Shared>) -> Result<()> {
    shared.out.send_to_topic(
        TOPIC_AUDIO_CONTROL,
        &schema::encode(&ControlMsg {
            kind: CONTROL_AUDIO_ROUTE,
            enable: 1,
            param: 0,
            value_a: 1.0,
            value_b: 0.0,
        })?,
    )?;
    for (command, value) in [
        (CMD_CHEMX_TOGGLE, 1),
        (CMD_ASW_TOGGLE, 0),
        (CMD_DROP_FRAME_STATE, 0),
    ] {
        shared.out.send_to_topic(
            TOPIC_COMMAND,
            &schema::encode(&CommandMsg { command, value })?,
        )?;
    }
    for kind in [CONTROL_HANDS, CONTROL_BODY] {
        shared.out.send_to_topic(
            TOPIC_INPUT_CONTROL,
            &schema::encode(&ControlMsg {
                kind,
                enable: 1,
                param: 0,
                value_a: 0.0,
                value_b: 0.0,
            })?,
        )?;
    }

    shared.ripc.bring_up(&shared.out);

    let mesh = shared.hmd.rectify_mesh();
    shared.out.send_to_topic(
        TOPIC_MESH,
        &schema::encode(&MeshUpload {
            mesh_id: mesh.id,
            data: mesh.data,
        })?,
    )?;

    shared.pipeline.reset_stream();
    Ok(())
}

fn handle_echo(shared: &Arc<Shared>, body: &[u8]) -> Result<()> {
    let payload: EchoPayload = schema::decode(body)?;
    let recv_ns = shared.clock.now_ns();
    if payload.reply == 0 {
        let pong = {
            let now = shared.clock.now_ns();
            shared
                .echo
                .lock()
                .unwrap()
                .make_pong(&payload, recv_ns, now)
        };
        send_hostinfo(shared, HostInfoMsg::new(HOSTINFO_ECHO, &pong)?)
    } else {
        if !shared.echo.lock().unwrap().on_pong(&payload, recv_ns) {
            debug!("stale pong (org={})", payload.org);
        }
        Ok(())
    }
}
