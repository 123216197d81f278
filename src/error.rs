use std::io;

use thiserror::Error;

/// Crate-wide error type.
///
/// `Transport` wraps the mapped USB error; the recovery policy in the session
/// keys off its [`io::ErrorKind`] (`WouldBlock` = timeout, `NotConnected` =
/// device gone, `BrokenPipe` = endpoint stall).
#[derive(Debug, Error)]
pub enum Error {
    #[error("usb transport: {0}")]
    Transport(#[from] io::Error),

    #[error("framing: {0}")]
    Framing(String),

    #[error("schema: {0}")]
    Schema(String),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("pipeline: {0}")]
    Pipeline(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Map a rusb error onto the io::ErrorKind vocabulary the session layer
/// understands. Mirrors the libusb result-code table.
pub(crate) fn map_usb_error(err: rusb::Error) -> io::Error {
    let kind = match err {
        rusb::Error::Timeout => io::ErrorKind::WouldBlock,
        rusb::Error::Pipe => io::ErrorKind::BrokenPipe,
        rusb::Error::NoDevice => io::ErrorKind::NotConnected,
        rusb::Error::NotFound => io::ErrorKind::NotFound,
        rusb::Error::Interrupted => io::ErrorKind::Interrupted,
        rusb::Error::Access => io::ErrorKind::PermissionDenied,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err)
}
