//! Immutable device model
//!
//! A snapshot of everything a device reported during discovery: identity,
//! decoded strings, landing page URL and the configuration tree. Values
//! are built in one step from the raw descriptors and never change.

use protocol::{
    ConfigDescriptor, Direction, EndpointDescriptor, EndpointType, InterfaceDescriptor, RawDevice,
    UsbVersion, decode_version,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Decoded string descriptors keyed by descriptor index
pub type StringTable = HashMap<u8, String>;

/// Look up a string by descriptor index
///
/// Index 0 means the device provides no string. An index that was never
/// read successfully yields the empty string.
fn lookup(strings: &StringTable, index: u8) -> Option<String> {
    if index == 0 {
        return None;
    }
    Some(strings.get(&index).cloned().unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// 1..=15
    pub endpoint_number: u8,
    pub direction: Direction,
    pub endpoint_type: EndpointType,
    pub packet_size: u16,
}

impl From<&EndpointDescriptor> for Endpoint {
    fn from(desc: &EndpointDescriptor) -> Self {
        Self {
            endpoint_number: desc.number(),
            direction: desc.direction(),
            endpoint_type: desc.transfer_type(),
            packet_size: desc.max_packet_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateInterface {
    pub alternate_setting: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub interface_name: Option<String>,
    pub endpoints: Vec<Endpoint>,
}

impl AlternateInterface {
    fn from_descriptor(desc: &InterfaceDescriptor, strings: &StringTable) -> Self {
        Self {
            alternate_setting: desc.alternate_setting,
            interface_class: desc.interface_class,
            interface_subclass: desc.interface_subclass,
            interface_protocol: desc.interface_protocol,
            interface_name: lookup(strings, desc.interface_index),
            endpoints: desc.endpoints.iter().map(Endpoint::from).collect(),
        }
    }

    /// Endpoint with this number and direction
    pub fn endpoint(&self, endpoint_number: u8, direction: Direction) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|e| e.endpoint_number == endpoint_number && e.direction == direction)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub interface_number: u8,
    /// One entry per alternate setting, in descriptor order
    pub alternates: Vec<AlternateInterface>,
}

impl Interface {
    pub fn alternate(&self, alternate_setting: u8) -> Option<&AlternateInterface> {
        self.alternates
            .iter()
            .find(|a| a.alternate_setting == alternate_setting)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub configuration_value: u8,
    pub configuration_name: Option<String>,
    pub interfaces: Vec<Interface>,
}

impl Configuration {
    /// Group the interface descriptors of a configuration by interface number
    pub fn from_descriptor(desc: &ConfigDescriptor, strings: &StringTable) -> Self {
        let interfaces = desc
            .interface_numbers()
            .into_iter()
            .map(|number| Interface {
                interface_number: number,
                alternates: desc
                    .interfaces
                    .iter()
                    .filter(|i| i.interface_number == number)
                    .map(|i| AlternateInterface::from_descriptor(i, strings))
                    .collect(),
            })
            .collect();

        Self {
            configuration_value: desc.configuration_value,
            configuration_name: lookup(strings, desc.configuration_index),
            interfaces,
        }
    }

    pub fn interface(&self, interface_number: u8) -> Option<&Interface> {
        self.interfaces
            .iter()
            .find(|i| i.interface_number == interface_number)
    }
}

/// Identity used for permission grants
///
/// A present-but-empty serial number is distinct from a missing one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
}

/// Everything known about a device after discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub usb_version: UsbVersion,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: UsbVersion,
    pub manufacturer_name: Option<String>,
    pub product_name: Option<String>,
    pub serial_number: Option<String>,
    /// WebUSB landing page
    pub url: Option<String>,
    pub configurations: Vec<Configuration>,
}

impl DeviceInfo {
    pub fn new(raw: &RawDevice, strings: &StringTable, url: Option<String>) -> Self {
        let desc = &raw.descriptor;
        Self {
            usb_version: decode_version(desc.usb_version),
            device_class: desc.device_class,
            device_subclass: desc.device_subclass,
            device_protocol: desc.device_protocol,
            vendor_id: desc.vendor_id,
            product_id: desc.product_id,
            device_version: decode_version(desc.device_version),
            manufacturer_name: lookup(strings, desc.manufacturer_index),
            product_name: lookup(strings, desc.product_index),
            serial_number: lookup(strings, desc.serial_number_index),
            url,
            configurations: raw
                .configurations
                .iter()
                .map(|c| Configuration::from_descriptor(c, strings))
                .collect(),
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            serial_number: self.serial_number.clone(),
        }
    }

    pub fn configuration(&self, configuration_value: u8) -> Option<&Configuration> {
        self.configurations
            .iter()
            .find(|c| c.configuration_value == configuration_value)
    }
}

/// String descriptor indices referenced by a device, in read order
///
/// Device strings come first (manufacturer, product, serial), then each
/// configuration name followed by its interface names. Index 0 and
/// repeated indices are skipped.
pub fn string_indices(raw: &RawDevice) -> Vec<u8> {
    let desc = &raw.descriptor;
    let mut indices = Vec::new();
    let mut push = |index: u8| {
        if index != 0 && !indices.contains(&index) {
            indices.push(index);
        }
    };

    push(desc.manufacturer_index);
    push(desc.product_index);
    push(desc.serial_number_index);
    for config in &raw.configurations {
        push(config.configuration_index);
        for interface in &config.interfaces {
            push(interface.interface_index);
        }
    }
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{
        BULK_IN_ENDPOINT, CONFIGURATION_NAME_INDEX, INTERFACE_NAME_INDEX, ISO_IN_ENDPOINT,
        PRODUCT_INDEX, SERIAL_INDEX, create_mock_raw_device,
    };

    #[test]
    fn test_string_indices_order() {
        let raw = create_mock_raw_device(1, 1, 0x1234, 0x5678);
        assert_eq!(
            string_indices(&raw),
            vec![1, 2, 3, CONFIGURATION_NAME_INDEX, INTERFACE_NAME_INDEX]
        );
    }

    #[test]
    fn test_device_info_from_raw() {
        let raw = create_mock_raw_device(1, 1, 0x1234, 0x5678);
        let mut strings = StringTable::new();
        strings.insert(PRODUCT_INDEX, "Widget".into());
        strings.insert(INTERFACE_NAME_INDEX, "Data".into());

        let info = DeviceInfo::new(&raw, &strings, Some("https://example.com".into()));
        assert_eq!(info.usb_version.to_string(), "2.1.0");
        assert_eq!(info.device_version.to_string(), "1.0.0");
        assert_eq!(info.product_name.as_deref(), Some("Widget"));
        // Index present but never read
        assert_eq!(info.manufacturer_name.as_deref(), Some(""));
        assert_eq!(info.url.as_deref(), Some("https://example.com"));

        let config = info.configuration(1).unwrap();
        assert_eq!(config.configuration_name.as_deref(), Some(""));
        assert_eq!(config.interfaces.len(), 2);

        let interface = config.interface(0).unwrap();
        assert_eq!(interface.alternates.len(), 2);
        let alt0 = interface.alternate(0).unwrap();
        assert_eq!(alt0.interface_name.as_deref(), Some("Data"));
        assert!(alt0.endpoint(BULK_IN_ENDPOINT, Direction::In).is_some());
        assert!(alt0.endpoint(BULK_IN_ENDPOINT, Direction::Out).is_none());

        let alt1 = interface.alternate(1).unwrap();
        assert_eq!(alt1.interface_name, None);
        assert_eq!(
            alt1.endpoint(ISO_IN_ENDPOINT, Direction::In)
                .map(|e| e.endpoint_type),
            Some(EndpointType::Isochronous)
        );
    }

    #[test]
    fn test_identity_distinguishes_empty_serial() {
        let raw = create_mock_raw_device(1, 1, 0x0d28, 0x0204);
        let mut strings = StringTable::new();
        strings.insert(SERIAL_INDEX, String::new());
        let with_empty = DeviceInfo::new(&raw, &strings, None).identity();

        let mut raw_no_serial = raw.clone();
        raw_no_serial.descriptor.serial_number_index = 0;
        let without = DeviceInfo::new(&raw_no_serial, &strings, None).identity();

        assert_eq!(with_empty.serial_number.as_deref(), Some(""));
        assert_eq!(without.serial_number, None);
        assert_ne!(with_empty, without);
    }
}
