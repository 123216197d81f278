//! Bulk-endpoint USB transport to the headset.
mod device;
mod transport;

pub use transport::{Transport, UsbTransport};
