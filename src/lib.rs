//! Host-side XRSP protocol engine.
//!
//! Brings a freshly enumerated headset through the multi-round pairing
//! handshake into a frame-streaming session: topic framing over the bulk
//! endpoints, segmented packet reassembly, ping/pong clock sync, per-topic
//! dispatch, runtime RPC, and the triple-buffered video-slice pipeline.

pub mod clock;
pub mod config;
mod control;
mod dispatch;
pub mod echo;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod hmd;
pub mod ripc;
pub mod schema;
pub mod segmented;
pub mod session;
pub mod topics;
pub mod usb;
pub mod video;

pub use clock::{Clock, MonotonicClock};
pub use config::{Codec, HostConfig};
pub use error::{Error, Result};
pub use handshake::PairingState;
pub use hmd::{DeviceType, EyeFov, HmdSource, Pose, RectifyMesh};
pub use session::{EncoderHandle, Handlers, Outbound, Session};
pub use usb::{Transport, UsbTransport};
pub use video::{EncoderSink, SWAPCHAIN_DEPTH, VideoPipeline};
