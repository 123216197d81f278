use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use log::{info, warn};
use rusb::{DeviceHandle, GlobalContext};

use super::device::{EndpointInfo, select_device};
use crate::error::map_usb_error;

const SEND_TIMEOUT: Duration = Duration::from_millis(100);
const RESET_RETRIES: usize = 10;
const RESET_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Consecutive send timeouts before the transport is marked invalid.
const TIMEOUT_LIMIT: u32 = 3;

/// Byte pipe to the headset.
///
/// Timeouts surface as `io::ErrorKind::WouldBlock`, a vanished device as
/// `NotConnected`; callers key recovery off those kinds.
pub trait Transport: Send + Sync {
    /// Write one outbound buffer to the bulk OUT endpoint, fully.
    fn send(&self, bytes: &[u8]) -> io::Result<usize>;

    /// Read from the bulk IN endpoint, waiting up to `deadline`.
    fn recv(&self, buf: &mut [u8], deadline: Duration) -> io::Result<usize>;

    /// Close, device-level reset, reopen with retries.
    fn reset(&self) -> io::Result<()>;

    fn close(&self);

    fn slow_link(&self) -> bool;

    fn is_valid(&self) -> bool;

    fn invalidate(&self);
}

struct OpenDevice {
    handle: DeviceHandle<GlobalContext>,
    in_ep: u8,
    out_ep: u8,
}

pub struct UsbTransport {
    vid: u16,
    pid: u16,
    interface: u8,
    state: Mutex<Option<OpenDevice>>,
    valid: AtomicBool,
    slow_link: AtomicBool,
    send_timeouts: AtomicU32,
}

impl UsbTransport {
    /// Open the headset identified by `(vid, pid, interface)` and claim its
    /// bulk interface.
    pub fn open(vid: u16, pid: u16, interface: u8) -> io::Result<Self> {
        let transport = Self {
            vid,
            pid,
            interface,
            state: Mutex::new(None),
            valid: AtomicBool::new(false),
            slow_link: AtomicBool::new(false),
            send_timeouts: AtomicU32::new(0),
        };
        let (device, slow) = transport.open_device()?;
        *transport.state.lock().unwrap() = Some(device);
        transport.slow_link.store(slow, Ordering::Relaxed);
        transport.valid.store(true, Ordering::Relaxed);
        Ok(transport)
    }

    fn open_device(&self) -> io::Result<(OpenDevice, bool)> {
        let (device, info) = select_device(self.vid, self.pid, self.interface)?;
        let mut handle = device.open().map_err(map_usb_error)?;
        let _ = handle.set_auto_detach_kernel_driver(true);
        handle
            .claim_interface(info.interface)
            .map_err(map_usb_error)?;
        let EndpointInfo {
            in_ep,
            out_ep,
            slow_link,
            ..
        } = info;
        Ok((
            OpenDevice {
                handle,
                in_ep,
                out_ep,
            },
            slow_link,
        ))
    }

    fn mark_failure(&self, err: &io::Error) {
        match err.kind() {
            io::ErrorKind::NotConnected => {
                self.valid.store(false, Ordering::Relaxed);
            }
            io::ErrorKind::WouldBlock => {
                if self.send_timeouts.fetch_add(1, Ordering::Relaxed) + 1 >= TIMEOUT_LIMIT {
                    warn!("{TIMEOUT_LIMIT} consecutive bulk-out timeouts, invalidating transport");
                    self.valid.store(false, Ordering::Relaxed);
                }
            }
            _ => {}
        }
    }
}

impl Transport for UsbTransport {
    fn send(&self, bytes: &[u8]) -> io::Result<usize> {
        let guard = self.state.lock().unwrap();
        let device = guard
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport closed"))?;
        let mut written = 0;
        while written < bytes.len() {
            match device
                .handle
                .write_bulk(device.out_ep, &bytes[written..], SEND_TIMEOUT)
            {
                Ok(n) => {
                    written += n;
                    self.send_timeouts.store(0, Ordering::Relaxed);
                }
                Err(err) => {
                    let err = map_usb_error(err);
                    self.mark_failure(&err);
                    return Err(err);
                }
            }
        }
        Ok(written)
    }

    fn recv(&self, buf: &mut [u8], deadline: Duration) -> io::Result<usize> {
        let guard = self.state.lock().unwrap();
        let device = guard
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport closed"))?;
        match device.handle.read_bulk(device.in_ep, buf, deadline) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                rusb::Error::Timeout,
            )),
            Err(err) => {
                let err = map_usb_error(err);
                if err.kind() == io::ErrorKind::NotConnected {
                    self.valid.store(false, Ordering::Relaxed);
                }
                Err(err)
            }
        }
    }

    fn reset(&self) -> io::Result<()> {
        {
            let mut guard = self.state.lock().unwrap();
            if let Some(mut device) = guard.take() {
                // A failed reset means the device re-enumerates; we reopen
                // either way.
                let _ = device.handle.reset();
            }
        }
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "device never reappeared");
        for attempt in 1..=RESET_RETRIES {
            match self.open_device() {
                Ok((device, slow)) => {
                    *self.state.lock().unwrap() = Some(device);
                    self.slow_link.store(slow, Ordering::Relaxed);
                    self.send_timeouts.store(0, Ordering::Relaxed);
                    self.valid.store(true, Ordering::Relaxed);
                    info!("transport reopened on attempt {attempt}");
                    return Ok(());
                }
                Err(err) => {
                    last_err = err;
                    thread::sleep(RESET_RETRY_DELAY);
                }
            }
        }
        Err(last_err)
    }

    fn close(&self) {
        self.valid.store(false, Ordering::Relaxed);
        *self.state.lock().unwrap() = None;
    }

    fn slow_link(&self) -> bool {
        self.slow_link.load(Ordering::Relaxed)
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Relaxed);
    }
}
