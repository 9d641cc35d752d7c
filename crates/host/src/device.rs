//! Host USB device
//!
//! Wraps a `rusb::Device` with its optional open handle and the interfaces
//! claimed through it. Descriptors are converted to the protocol types
//! without opening the device.

use protocol::{
    ConfigDescriptor, DeviceDescriptor, DeviceHandle, Direction, EndpointDescriptor,
    InterfaceDescriptor, RawDevice, TransportError,
};
use rusb::{Context, Device, SyncType, TransferType, UsageType};
use tracing::{debug, warn};

use crate::transfers::map_rusb_error;

/// Vendor ID of the Linux Foundation root hubs
const ROOT_HUB_VENDOR_ID: u16 = 0x1d6b;

/// bDeviceClass of a hub
const HUB_CLASS: u8 = 0x09;

/// A physical device tracked by the worker
pub struct HostDevice {
    device: Device<Context>,
    handle: Option<rusb::DeviceHandle<Context>>,
    /// Claimed interface numbers, with whether we detached a kernel driver
    claimed: Vec<(u8, bool)>,
}

impl HostDevice {
    pub fn new(device: Device<Context>) -> Self {
        Self {
            device,
            handle: None,
            claimed: Vec::new(),
        }
    }

    pub fn device_handle(&self) -> DeviceHandle {
        device_handle(&self.device)
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// The open libusb handle, or `InvalidParam` when closed
    pub fn handle(&self) -> Result<&rusb::DeviceHandle<Context>, TransportError> {
        self.handle.as_ref().ok_or(TransportError::InvalidParam)
    }

    fn handle_mut(&mut self) -> Result<&mut rusb::DeviceHandle<Context>, TransportError> {
        self.handle.as_mut().ok_or(TransportError::InvalidParam)
    }

    pub fn open(&mut self) -> Result<(), TransportError> {
        if self.handle.is_some() {
            return Ok(());
        }

        let handle = self.device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", self.device_handle(), e);
            map_rusb_error(e)
        })?;

        debug!("Opened device {}", self.device_handle());
        self.handle = Some(handle);
        Ok(())
    }

    /// Release every claimed interface, hand interfaces back to their
    /// kernel drivers and drop the handle
    pub fn close(&mut self) {
        let id = self.device_handle();
        if let Some(mut handle) = self.handle.take() {
            for (interface, detached) in self.claimed.drain(..) {
                if let Err(e) = handle.release_interface(interface) {
                    warn!("Failed to release interface {} on {}: {}", interface, id, e);
                }
                if detached {
                    reattach_kernel_driver(&mut handle, interface, id);
                }
            }
            debug!("Closed device {}", id);
        }
    }

    pub fn reset(&mut self) -> Result<(), TransportError> {
        self.handle_mut()?.reset().map_err(map_rusb_error)?;
        debug!("Reset device {}", self.device_handle());
        Ok(())
    }

    pub fn set_configuration(&mut self, value: u8) -> Result<(), TransportError> {
        self.handle_mut()?
            .set_active_configuration(value)
            .map_err(map_rusb_error)?;
        debug!(
            "Selected configuration {} on {}",
            value,
            self.device_handle()
        );
        Ok(())
    }

    /// Claim an interface, detaching an active kernel driver first
    pub fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        let id = self.device_handle();
        let handle = self.handle.as_mut().ok_or(TransportError::InvalidParam)?;

        let detached = match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {} on {}", interface, id);
                match handle.detach_kernel_driver(interface) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(
                            "Failed to detach kernel driver from interface {}: {}",
                            interface, e
                        );
                        false
                    }
                }
            }
            Ok(false) => false,
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                );
                false
            }
        };

        if let Err(e) = handle.claim_interface(interface) {
            warn!("Failed to claim interface {} on {}: {}", interface, id, e);
            if detached {
                reattach_kernel_driver(handle, interface, id);
            }
            return Err(map_rusb_error(e));
        }

        debug!("Claimed interface {} on {}", interface, id);
        self.claimed.push((interface, detached));
        Ok(())
    }

    pub fn release_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        let id = self.device_handle();
        let handle = self.handle.as_mut().ok_or(TransportError::InvalidParam)?;
        handle.release_interface(interface).map_err(map_rusb_error)?;

        if let Some(pos) = self.claimed.iter().position(|(n, _)| *n == interface) {
            let (_, detached) = self.claimed.remove(pos);
            if detached {
                reattach_kernel_driver(handle, interface, id);
            }
        }
        debug!("Released interface {} on {}", interface, id);
        Ok(())
    }

    pub fn set_alternate_setting(
        &mut self,
        interface: u8,
        alternate_setting: u8,
    ) -> Result<(), TransportError> {
        self.handle_mut()?
            .set_alternate_setting(interface, alternate_setting)
            .map_err(map_rusb_error)
    }

    pub fn clear_halt(
        &mut self,
        direction: Direction,
        endpoint_number: u8,
    ) -> Result<(), TransportError> {
        let endpoint = direction.endpoint_address(endpoint_number);
        self.handle_mut()?
            .clear_halt(endpoint)
            .map_err(map_rusb_error)
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn reattach_kernel_driver(
    handle: &mut rusb::DeviceHandle<Context>,
    interface: u8,
    id: DeviceHandle,
) {
    match handle.attach_kernel_driver(interface) {
        Ok(()) => debug!("Reattached kernel driver to interface {} on {}", interface, id),
        Err(e) => debug!(
            "Could not reattach kernel driver to interface {} on {}: {}",
            interface, id, e
        ),
    }
}

/// Transport handle for a libusb device
pub fn device_handle<T: rusb::UsbContext>(device: &Device<T>) -> DeviceHandle {
    DeviceHandle::new(device.bus_number(), device.address())
}

/// Whether a device descriptor describes a root hub
pub fn is_root_hub(vendor_id: u16, class_code: u8) -> bool {
    vendor_id == ROOT_HUB_VENDOR_ID && class_code == HUB_CLASS
}

/// Convert libusb's cached descriptors into a [`RawDevice`]
pub fn raw_device<T: rusb::UsbContext>(device: &Device<T>) -> Result<RawDevice, TransportError> {
    let desc = device.device_descriptor().map_err(map_rusb_error)?;

    let mut configurations = Vec::with_capacity(desc.num_configurations() as usize);
    for index in 0..desc.num_configurations() {
        match device.config_descriptor(index) {
            Ok(config) => configurations.push(convert_config(&config)),
            Err(e) => warn!(
                "Skipping unreadable configuration {} of {}: {}",
                index,
                device_handle(device),
                e
            ),
        }
    }

    // NotFound means the device is unconfigured
    let active_configuration = device.active_config_descriptor().ok().map(|c| c.number());

    Ok(RawDevice {
        handle: device_handle(device),
        descriptor: DeviceDescriptor {
            usb_version: version_to_bcd(desc.usb_version()),
            device_class: desc.class_code(),
            device_subclass: desc.sub_class_code(),
            device_protocol: desc.protocol_code(),
            max_packet_size0: desc.max_packet_size(),
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            device_version: version_to_bcd(desc.device_version()),
            manufacturer_index: desc.manufacturer_string_index().unwrap_or(0),
            product_index: desc.product_string_index().unwrap_or(0),
            serial_number_index: desc.serial_number_string_index().unwrap_or(0),
            num_configurations: desc.num_configurations(),
        },
        configurations,
        active_configuration,
    })
}

fn convert_config(config: &rusb::ConfigDescriptor) -> ConfigDescriptor {
    let mut attributes = 0x80;
    if config.self_powered() {
        attributes |= 0x40;
    }
    if config.remote_wakeup() {
        attributes |= 0x20;
    }

    let interfaces = config
        .interfaces()
        .flat_map(|interface| interface.descriptors())
        .map(|alt| InterfaceDescriptor {
            interface_number: alt.interface_number(),
            alternate_setting: alt.setting_number(),
            interface_class: alt.class_code(),
            interface_subclass: alt.sub_class_code(),
            interface_protocol: alt.protocol_code(),
            interface_index: alt.description_string_index().unwrap_or(0),
            endpoints: alt
                .endpoint_descriptors()
                .map(|ep| EndpointDescriptor {
                    address: ep.address(),
                    attributes: endpoint_attributes(
                        ep.transfer_type(),
                        ep.sync_type(),
                        ep.usage_type(),
                    ),
                    max_packet_size: ep.max_packet_size(),
                    interval: ep.interval(),
                })
                .collect(),
        })
        .collect();

    ConfigDescriptor {
        configuration_value: config.number(),
        configuration_index: config.description_string_index().unwrap_or(0),
        attributes,
        // libusb reports milliamps; bMaxPower is in 2 mA units
        max_power: (config.max_power() / 2).min(u8::MAX as u16) as u8,
        interfaces,
    }
}

/// Rebuild bmAttributes from libusb's decoded fields
fn endpoint_attributes(transfer: TransferType, sync: SyncType, usage: UsageType) -> u8 {
    let transfer_bits = match transfer {
        TransferType::Control => 0x00,
        TransferType::Isochronous => 0x01,
        TransferType::Bulk => 0x02,
        TransferType::Interrupt => 0x03,
    };
    if transfer != TransferType::Isochronous {
        return transfer_bits;
    }

    let sync_bits = match sync {
        SyncType::NoSync => 0x00,
        SyncType::Asynchronous => 0x04,
        SyncType::Adaptive => 0x08,
        SyncType::Synchronous => 0x0c,
    };
    let usage_bits = match usage {
        UsageType::Data => 0x00,
        UsageType::Feedback => 0x10,
        UsageType::FeedbackData => 0x20,
        UsageType::Reserved => 0x30,
    };
    transfer_bits | sync_bits | usage_bits
}

/// Re-encode a decoded version as BCD
fn version_to_bcd(version: rusb::Version) -> u16 {
    let major = version.major() as u16;
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | ((version.minor() as u16 & 0x0f) << 4)
        | (version.sub_minor() as u16 & 0x0f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{EndpointType, decode_version};

    #[test]
    fn test_version_round_trip() {
        for bcd in [0x0100, 0x0110, 0x0200, 0x0201, 0x0210, 0x0300, 0x0320, 0x1234] {
            assert_eq!(version_to_bcd(rusb::Version::from_bcd(bcd)), bcd);
        }
        let version = decode_version(version_to_bcd(rusb::Version(2, 1, 0)));
        assert_eq!((version.major, version.minor, version.sub), (2, 1, 0));
    }

    #[test]
    fn test_endpoint_attributes() {
        let bulk = endpoint_attributes(TransferType::Bulk, SyncType::NoSync, UsageType::Data);
        assert_eq!(EndpointType::from_attributes(bulk), EndpointType::Bulk);

        let interrupt = endpoint_attributes(
            TransferType::Interrupt,
            SyncType::NoSync,
            UsageType::Data,
        );
        assert_eq!(interrupt, 0x03);

        let iso = endpoint_attributes(
            TransferType::Isochronous,
            SyncType::Asynchronous,
            UsageType::Feedback,
        );
        assert_eq!(iso, 0x15);
        assert_eq!(EndpointType::from_attributes(iso), EndpointType::Isochronous);
    }

    #[test]
    fn test_root_hub_detection() {
        assert!(is_root_hub(0x1d6b, 9));
        assert!(!is_root_hub(0x1d6b, 0));
        assert!(!is_root_hub(0x05e3, 9));
    }
}
