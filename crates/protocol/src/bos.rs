//! Binary Object Store (BOS) capability decoding
//!
//! A BOS descriptor is a 5-byte header (bLength, bDescriptorType,
//! wTotalLength, bNumDeviceCaps) followed by device capability descriptors,
//! each starting with bLength, bDescriptorType and bDevCapabilityType.
//! WebUSB devices advertise themselves through a platform capability
//! (type 5) carrying a fixed UUID.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::version::BOS_MIN_USB_VERSION;

/// Size of the fixed BOS header
pub const BOS_HEADER_SIZE: usize = 5;

/// Platform device capability type
pub const PLATFORM_CAPABILITY_TYPE: u8 = 5;

/// WebUSB platform capability UUID in canonical form
pub const WEBUSB_PLATFORM_UUID: &str = "3408b638-09a9-47a0-8bfd-a0768815b665";

/// Supported WebUSB capability descriptor version (bcdVersion)
pub const WEBUSB_CAPABILITY_VERSION: u16 = 0x0100;

/// Minimum payload size holding bReserved, the UUID and bcdVersion
const PLATFORM_HEADER_SIZE: usize = 19;

const UUID_RANGE: std::ops::Range<usize> = 1..17;
const VERSION_OFFSET: usize = 17;
const VENDOR_CODE_OFFSET: usize = 19;
const LANDING_PAGE_OFFSET: usize = 20;

/// One device capability record from a BOS descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// bDevCapabilityType
    pub capability_type: u8,
    /// Bytes following the 3-byte capability header
    pub data: Vec<u8>,
}

/// wTotalLength from a BOS header, if the buffer holds one
pub fn bos_total_length(header: &[u8]) -> Option<u16> {
    if header.len() < BOS_HEADER_SIZE {
        return None;
    }
    Some(LittleEndian::read_u16(&header[2..4]))
}

/// Walk the capability records of a raw BOS descriptor
///
/// Devices older than USB 2.0.1 never carry a BOS descriptor, so an empty
/// list is returned for them. The walk stops at wTotalLength or the end of
/// the buffer, whichever is smaller. A record shorter than its own header
/// or one running past that bound ends the walk; records decoded so far
/// are returned.
pub fn decode_bos_capabilities(usb_version: u16, raw: &[u8]) -> Vec<Capability> {
    let mut capabilities = Vec::new();
    if usb_version < BOS_MIN_USB_VERSION {
        return capabilities;
    }
    let Some(total_length) = bos_total_length(raw) else {
        return capabilities;
    };
    let end = (total_length as usize).min(raw.len());

    let mut offset = BOS_HEADER_SIZE;
    while offset < end {
        let length = raw[offset] as usize;
        if length < 3 || offset + length > end {
            break;
        }
        capabilities.push(Capability {
            capability_type: raw[offset + 2],
            data: raw[offset + 3..offset + length].to_vec(),
        });
        offset += length;
    }

    capabilities
}

/// Render a 16-byte Microsoft-style GUID in canonical hyphenated form
///
/// The first three groups are little-endian, the last two are byte strings.
pub fn decode_uuid(bytes: &[u8; 16]) -> String {
    let data1 = LittleEndian::read_u32(&bytes[0..4]);
    let data2 = LittleEndian::read_u16(&bytes[4..6]);
    let data3 = LittleEndian::read_u16(&bytes[6..8]);
    let data4: String = bytes[8..10].iter().map(|b| format!("{b:02x}")).collect();
    let data5: String = bytes[10..16].iter().map(|b| format!("{b:02x}")).collect();

    format!("{data1:08x}-{data2:04x}-{data3:04x}-{data4}-{data5}")
}

/// Find the WebUSB platform capability among decoded capabilities
pub fn find_web_capability(capabilities: &[Capability]) -> Option<&Capability> {
    capabilities
        .iter()
        .filter(|c| c.capability_type == PLATFORM_CAPABILITY_TYPE)
        .find(|c| {
            if c.data.len() < PLATFORM_HEADER_SIZE {
                return false;
            }
            let mut uuid = [0u8; 16];
            uuid.copy_from_slice(&c.data[UUID_RANGE]);
            let version = LittleEndian::read_u16(&c.data[VERSION_OFFSET..VERSION_OFFSET + 2]);
            decode_uuid(&uuid) == WEBUSB_PLATFORM_UUID && version == WEBUSB_CAPABILITY_VERSION
        })
}

/// Vendor request code and landing page index of a WebUSB capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LandingPageRequest {
    /// bVendorCode, used as bRequest of the GET_URL control transfer
    pub vendor_code: u8,
    /// iLandingPage, used as wValue
    pub landing_page: u8,
}

impl LandingPageRequest {
    /// Extract the request parameters from a WebUSB capability payload
    ///
    /// Payloads shorter than 20 bytes carry no request. A payload of exactly
    /// 20 bytes lacks the landing page index and carries none either.
    pub fn from_capability(capability: &Capability) -> Option<Self> {
        let data = &capability.data;
        if data.len() <= LANDING_PAGE_OFFSET {
            return None;
        }
        Some(Self {
            vendor_code: data[VENDOR_CODE_OFFSET],
            landing_page: data[LANDING_PAGE_OFFSET],
        })
    }
}
