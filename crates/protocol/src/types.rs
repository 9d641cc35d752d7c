//! USB and transport type definitions
//!
//! This module defines the USB-level vocabulary shared by every transport
//! implementation and the WebUSB core: device handles, control transfer
//! parameters, transfer outcomes and the closed set of transport errors.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::descriptor::{ConfigDescriptor, DeviceDescriptor};

/// Endpoint address direction bit (IN)
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// Mask selecting the endpoint number from an endpoint address
pub const ENDPOINT_NUMBER_MASK: u8 = 0x0f;

/// Opaque device handle (transport-assigned)
///
/// Identifies a physical device by its bus position. The handle is stable
/// while the device stays plugged in; a reconnect yields a new handle for
/// the same device identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Bus number on the host
    pub bus: u8,
    /// Device address on the bus
    pub address: u8,
}

impl DeviceHandle {
    pub fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.bus, self.address)
    }
}

/// A device as reported by a transport before any string or capability
/// discovery has happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDevice {
    /// Transport handle
    pub handle: DeviceHandle,
    /// Standard device descriptor
    pub descriptor: DeviceDescriptor,
    /// Every configuration descriptor, in descriptor index order
    pub configurations: Vec<ConfigDescriptor>,
    /// bConfigurationValue of the active configuration, if any
    pub active_configuration: Option<u8>,
}

/// Hot-plug notification raised by a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HotplugEvent {
    /// Device plugged in
    Attached(RawDevice),
    /// Device unplugged
    Detached(DeviceHandle),
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address or bmRequestType
    pub fn from_address(address: u8) -> Self {
        if address & ENDPOINT_DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Endpoint address for `endpoint_number` in this direction
    pub fn endpoint_address(self, endpoint_number: u8) -> u8 {
        match self {
            Direction::In => (endpoint_number & ENDPOINT_NUMBER_MASK) | ENDPOINT_DIR_IN,
            Direction::Out => endpoint_number & ENDPOINT_NUMBER_MASK,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "in"),
            Direction::Out => write!(f, "out"),
        }
    }
}

/// Endpoint transfer type
///
/// Control endpoints never appear inside interface descriptors, so only the
/// three data transfer types are modelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    Bulk,
    Interrupt,
    Isochronous,
}

impl EndpointType {
    /// Decode bmAttributes bits 0..1
    ///
    /// Anything that is not bulk or interrupt is reported as isochronous.
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0x02 => EndpointType::Bulk,
            0x03 => EndpointType::Interrupt,
            _ => EndpointType::Isochronous,
        }
    }
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointType::Bulk => write!(f, "bulk"),
            EndpointType::Interrupt => write!(f, "interrupt"),
            EndpointType::Isochronous => write!(f, "isochronous"),
        }
    }
}

/// bmRequestType bits 5..6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
}

/// bmRequestType bits 0..4
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Setup parameters for a control transfer (wLength is supplied separately)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlTransferParameters {
    pub request_type: RequestType,
    pub recipient: Recipient,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
}

impl ControlTransferParameters {
    /// Build the bmRequestType byte for the given data stage direction
    pub fn request_type_byte(&self, direction: Direction) -> u8 {
        let direction = match direction {
            Direction::In => 0x80,
            Direction::Out => 0x00,
        };
        let request_type = match self.request_type {
            RequestType::Standard => 0x00,
            RequestType::Class => 0x20,
            RequestType::Vendor => 0x40,
        };
        let recipient = match self.recipient {
            Recipient::Device => 0x00,
            Recipient::Interface => 0x01,
            Recipient::Endpoint => 0x02,
            Recipient::Other => 0x03,
        };
        direction | request_type | recipient
    }
}

/// Outcome of a completed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Ok,
    /// Endpoint signalled STALL
    Stall,
    /// Device sent more data than requested
    Babble,
}

/// Result of an IN transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InTransferResult {
    /// Data received, empty unless status is `Ok`
    pub data: Vec<u8>,
    pub status: TransferStatus,
}

/// Result of an OUT transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutTransferResult {
    pub bytes_written: usize,
    pub status: TransferStatus,
}

/// One packet of an isochronous IN transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsochronousInPacket {
    pub data: Vec<u8>,
    pub status: TransferStatus,
}

/// Result of an isochronous IN transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsochronousInTransferResult {
    /// Concatenated packet payloads
    pub data: Vec<u8>,
    pub packets: Vec<IsochronousInPacket>,
}

/// One packet of an isochronous OUT transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsochronousOutPacket {
    pub bytes_written: usize,
    pub status: TransferStatus,
}

/// Result of an isochronous OUT transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsochronousOutTransferResult {
    pub packets: Vec<IsochronousOutPacket>,
}

/// Transport error vocabulary
///
/// Maps to libusb error codes. See rusb::Error for details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum TransportError {
    /// Transfer timed out
    #[error("transfer timed out")]
    Timeout,
    /// Endpoint stalled
    #[error("pipe error (endpoint stalled)")]
    Pipe,
    /// Device was disconnected
    #[error("no such device (it may have been disconnected)")]
    NoDevice,
    /// Device, interface or endpoint not found
    #[error("entity not found")]
    NotFound,
    /// Device or interface is busy
    #[error("resource busy")]
    Busy,
    /// Device sent more data than requested
    #[error("overflow")]
    Overflow,
    /// I/O error
    #[error("input/output error")]
    Io,
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParam,
    /// Access denied (permissions)
    #[error("access denied (insufficient permissions)")]
    Access,
    /// Operation not supported by this transport
    #[error("operation not supported or unimplemented on this platform")]
    NotSupported,
    /// Other error with message
    #[error("{message}")]
    Other { message: String },
}

impl TransportError {
    /// Whether opening a device that failed with this error is worth retrying
    ///
    /// Hosts commonly report these for a short while right after attach,
    /// before permissions or drivers have settled.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Busy
                | TransportError::Io
                | TransportError::Access
                | TransportError::Timeout
        )
    }

    /// Transfer status this error stands for on an IN transfer, if it is
    /// one of the outcomes reported as a result rather than a failure.
    pub fn in_transfer_status(&self) -> Option<TransferStatus> {
        match self {
            TransportError::Pipe => Some(TransferStatus::Stall),
            TransportError::Overflow => Some(TransferStatus::Babble),
            _ => None,
        }
    }
}
