use std::io;

use log::info;
use rusb::{Device, GlobalContext, Speed, TransferType, Direction};

use crate::error::map_usb_error;

#[derive(Clone, Copy, Debug)]
pub(crate) struct EndpointInfo {
    pub(crate) interface: u8,
    pub(crate) in_ep: u8,
    pub(crate) out_ep: u8,
    /// True for links at high speed or below; consumers halve the render
    /// resolution and cap the refresh rate.
    pub(crate) slow_link: bool,
}

/// Locate the headset by VID/PID and resolve the first bulk IN and OUT
/// endpoints on the requested interface.
pub(crate) fn select_device(
    vid: u16,
    pid: u16,
    interface: u8,
) -> io::Result<(Device<GlobalContext>, EndpointInfo)> {
    let devices = rusb::devices().map_err(map_usb_error)?;
    for device in devices.iter() {
        let desc = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(_) => continue,
        };
        if desc.vendor_id() != vid || desc.product_id() != pid {
            continue;
        }
        let info = find_bulk_endpoints(&device, interface)?;
        info!(
            "selected headset {:04x}:{:04x} iface={} in_ep=0x{:02x} out_ep=0x{:02x} slow_link={}",
            vid, pid, info.interface, info.in_ep, info.out_ep, info.slow_link
        );
        return Ok((device, info));
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("no USB device {vid:04x}:{pid:04x}"),
    ))
}

fn find_bulk_endpoints(
    device: &Device<GlobalContext>,
    interface: u8,
) -> io::Result<EndpointInfo> {
    let config = device
        .active_config_descriptor()
        .or_else(|_| device.config_descriptor(0))
        .map_err(map_usb_error)?;

    for iface in config.interfaces() {
        if iface.number() != interface {
            continue;
        }
        for desc in iface.descriptors() {
            let mut in_ep = 0u8;
            let mut out_ep = 0u8;
            for endpoint in desc.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match endpoint.direction() {
                    Direction::In if in_ep == 0 => in_ep = endpoint.address(),
                    Direction::Out if out_ep == 0 => out_ep = endpoint.address(),
                    _ => {}
                }
            }
            if in_ep != 0 && out_ep != 0 {
                return Ok(EndpointInfo {
                    interface,
                    in_ep,
                    out_ep,
                    slow_link: is_slow(device.speed()),
                });
            }
        }
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("interface {interface} has no bulk IN/OUT endpoint pair"),
    ))
}

fn is_slow(speed: Speed) -> bool {
    !matches!(speed, Speed::Super | Speed::SuperPlus)
}
