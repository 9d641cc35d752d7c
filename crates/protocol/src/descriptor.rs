//! Standard USB descriptors
//!
//! Parsers for the device descriptor and the configuration descriptor set
//! (configuration, interface and endpoint descriptors). All multi-byte
//! fields are little-endian.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, Result};
use crate::types::{Direction, ENDPOINT_NUMBER_MASK, EndpointType};

/// bDescriptorType values
pub const DEVICE_DESCRIPTOR_TYPE: u8 = 0x01;
pub const CONFIG_DESCRIPTOR_TYPE: u8 = 0x02;
pub const STRING_DESCRIPTOR_TYPE: u8 = 0x03;
pub const INTERFACE_DESCRIPTOR_TYPE: u8 = 0x04;
pub const ENDPOINT_DESCRIPTOR_TYPE: u8 = 0x05;
pub const BOS_DESCRIPTOR_TYPE: u8 = 0x0f;

pub const DEVICE_DESCRIPTOR_SIZE: usize = 18;
pub const CONFIG_DESCRIPTOR_SIZE: usize = 9;
pub const INTERFACE_DESCRIPTOR_SIZE: usize = 9;
pub const ENDPOINT_DESCRIPTOR_SIZE: usize = 7;

/// Standard device descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// bcdUSB
    pub usb_version: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice
    pub device_version: u16,
    /// iManufacturer
    pub manufacturer_index: u8,
    /// iProduct
    pub product_index: u8,
    /// iSerialNumber
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    /// Parse an 18-byte device descriptor
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        check_header(bytes, DEVICE_DESCRIPTOR_TYPE, DEVICE_DESCRIPTOR_SIZE)?;

        Ok(Self {
            usb_version: LittleEndian::read_u16(&bytes[2..4]),
            device_class: bytes[4],
            device_subclass: bytes[5],
            device_protocol: bytes[6],
            max_packet_size0: bytes[7],
            vendor_id: LittleEndian::read_u16(&bytes[8..10]),
            product_id: LittleEndian::read_u16(&bytes[10..12]),
            device_version: LittleEndian::read_u16(&bytes[12..14]),
            manufacturer_index: bytes[14],
            product_index: bytes[15],
            serial_number_index: bytes[16],
            num_configurations: bytes[17],
        })
    }
}

/// Endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// bEndpointAddress (number plus direction bit)
    pub address: u8,
    /// bmAttributes
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        check_header(bytes, ENDPOINT_DESCRIPTOR_TYPE, ENDPOINT_DESCRIPTOR_SIZE)?;

        Ok(Self {
            address: bytes[2],
            attributes: bytes[3],
            max_packet_size: LittleEndian::read_u16(&bytes[4..6]),
            interval: bytes[6],
        })
    }

    pub fn number(&self) -> u8 {
        self.address & ENDPOINT_NUMBER_MASK
    }

    pub fn direction(&self) -> Direction {
        Direction::from_address(self.address)
    }

    pub fn transfer_type(&self) -> EndpointType {
        EndpointType::from_attributes(self.attributes)
    }
}

/// Interface descriptor, one per (interface number, alternate setting)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    /// iInterface
    pub interface_index: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl InterfaceDescriptor {
    /// Parse the fixed part of an interface descriptor (endpoints empty)
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        check_header(bytes, INTERFACE_DESCRIPTOR_TYPE, INTERFACE_DESCRIPTOR_SIZE)?;

        Ok(Self {
            interface_number: bytes[2],
            alternate_setting: bytes[3],
            interface_class: bytes[5],
            interface_subclass: bytes[6],
            interface_protocol: bytes[7],
            interface_index: bytes[8],
            endpoints: Vec::new(),
        })
    }
}

/// Configuration descriptor with its interface descriptors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDescriptor {
    pub configuration_value: u8,
    /// iConfiguration
    pub configuration_index: u8,
    pub attributes: u8,
    pub max_power: u8,
    /// Interface descriptors in descriptor order, one per alternate setting
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl ConfigDescriptor {
    /// Parse a full configuration descriptor set
    ///
    /// The walk follows each sub-descriptor's own bLength and stops at
    /// wTotalLength or the end of the buffer, whichever comes first. A
    /// sub-descriptor with bLength < 2 or one that overruns ends the walk
    /// with whatever was collected. Endpoint descriptors attach to the most
    /// recent interface descriptor; anything else is skipped.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        check_header(bytes, CONFIG_DESCRIPTOR_TYPE, CONFIG_DESCRIPTOR_SIZE)?;

        let total_length = LittleEndian::read_u16(&bytes[2..4]) as usize;
        let end = total_length.min(bytes.len());

        let mut config = Self {
            configuration_value: bytes[5],
            configuration_index: bytes[6],
            attributes: bytes[7],
            max_power: bytes[8],
            interfaces: Vec::new(),
        };

        let mut offset = bytes[0] as usize;
        while offset + 2 <= end {
            let length = bytes[offset] as usize;
            if length < 2 || offset + length > end {
                break;
            }
            let record = &bytes[offset..offset + length];

            match record[1] {
                INTERFACE_DESCRIPTOR_TYPE if length >= INTERFACE_DESCRIPTOR_SIZE => {
                    config.interfaces.push(InterfaceDescriptor::parse(record)?);
                }
                ENDPOINT_DESCRIPTOR_TYPE if length >= ENDPOINT_DESCRIPTOR_SIZE => {
                    if let Some(interface) = config.interfaces.last_mut() {
                        interface.endpoints.push(EndpointDescriptor::parse(record)?);
                    }
                }
                _ => {}
            }

            offset += length;
        }

        Ok(config)
    }

    /// Distinct interface numbers in first-seen order
    pub fn interface_numbers(&self) -> Vec<u8> {
        let mut numbers = Vec::new();
        for interface in &self.interfaces {
            if !numbers.contains(&interface.interface_number) {
                numbers.push(interface.interface_number);
            }
        }
        numbers
    }
}

fn check_header(bytes: &[u8], expected_type: u8, min_size: usize) -> Result<()> {
    if bytes.len() < min_size {
        return Err(DecodeError::Truncated {
            needed: min_size,
            available: bytes.len(),
        });
    }
    if (bytes[0] as usize) < min_size {
        return Err(DecodeError::InvalidLength { length: bytes[0] });
    }
    if bytes[1] != expected_type {
        return Err(DecodeError::UnexpectedType {
            expected: expected_type,
            actual: bytes[1],
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE: [u8; 18] = [
        18, 0x01, 0x10, 0x02, 0xef, 0x02, 0x01, 64, 0x28, 0x0d, 0x04, 0x02, 0x00, 0x10, 1, 2, 3,
        1,
    ];

    #[test]
    fn test_parse_device_descriptor() {
        let desc = DeviceDescriptor::parse(&DEVICE).unwrap();
        assert_eq!(desc.usb_version, 0x0210);
        assert_eq!(desc.device_class, 0xef);
        assert_eq!(desc.vendor_id, 0x0d28);
        assert_eq!(desc.product_id, 0x0204);
        assert_eq!(desc.device_version, 0x1000);
        assert_eq!(desc.serial_number_index, 3);
        assert_eq!(desc.num_configurations, 1);
    }

    #[test]
    fn test_parse_device_descriptor_errors() {
        assert!(matches!(
            DeviceDescriptor::parse(&DEVICE[..10]),
            Err(DecodeError::Truncated { needed: 18, .. })
        ));

        let mut wrong = DEVICE;
        wrong[1] = CONFIG_DESCRIPTOR_TYPE;
        assert!(matches!(
            DeviceDescriptor::parse(&wrong),
            Err(DecodeError::UnexpectedType { .. })
        ));
    }

    #[test]
    fn test_parse_config_descriptor() {
        let bytes = [
            // configuration
            9, 0x02, 46, 0, 2, 1, 4, 0x80, 50, //
            // interface 0 alt 0, one bulk IN endpoint
            9, 0x04, 0, 0, 1, 0xff, 0, 0, 5, //
            7, 0x05, 0x81, 0x02, 64, 0, 0, //
            // class-specific descriptor, skipped
            5, 0x24, 0, 0, 0, //
            // interface 1 alt 0, interrupt OUT endpoint
            9, 0x04, 1, 0, 1, 0x03, 0, 0, 0, //
            7, 0x05, 0x02, 0x03, 8, 0, 10, //
            // trailing junk beyond wTotalLength
            9, 0x04, 2, 0, 0, 0, 0, 0, 0,
        ];
        let config = ConfigDescriptor::parse(&bytes).unwrap();
        assert_eq!(config.configuration_value, 1);
        assert_eq!(config.configuration_index, 4);
        assert_eq!(config.interfaces.len(), 2);
        assert_eq!(config.interface_numbers(), vec![0, 1]);

        let ep = config.interfaces[0].endpoints[0];
        assert_eq!(ep.number(), 1);
        assert_eq!(ep.direction(), Direction::In);
        assert_eq!(ep.transfer_type(), EndpointType::Bulk);
        assert_eq!(ep.max_packet_size, 64);

        let ep = config.interfaces[1].endpoints[0];
        assert_eq!(ep.direction(), Direction::Out);
        assert_eq!(ep.transfer_type(), EndpointType::Interrupt);
    }

    #[test]
    fn test_parse_config_descriptor_zero_length_stops_walk() {
        let bytes = [
            9, 0x02, 27, 0, 1, 1, 0, 0x80, 50, //
            9, 0x04, 0, 0, 0, 0xff, 0, 0, 0, //
            0, 0x05, 0x81, 0x02, 64, 0, 0, 0, 0,
        ];
        let config = ConfigDescriptor::parse(&bytes).unwrap();
        assert_eq!(config.interfaces.len(), 1);
        assert!(config.interfaces[0].endpoints.is_empty());
    }

    #[test]
    fn test_parse_config_descriptor_overrun_stops_walk() {
        let bytes = [
            9, 0x02, 22, 0, 1, 1, 0, 0x80, 50, //
            9, 0x04, 0, 0, 0, 0xff, 0, 0, 0, //
            200, 0x05, 0x81, 0x02,
        ];
        let config = ConfigDescriptor::parse(&bytes).unwrap();
        assert_eq!(config.interfaces.len(), 1);
    }
}
