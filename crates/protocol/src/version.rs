//! BCD version decoding
//!
//! USB descriptors carry versions (bcdUSB, bcdDevice) as binary-coded
//! decimal: `0x0210` reads as "2.1.0".

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lowest bcdUSB that may carry a BOS descriptor
pub const BOS_MIN_USB_VERSION: u16 = 0x0201;

/// Decoded BCD version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UsbVersion {
    pub major: u8,
    pub minor: u8,
    pub sub: u8,
}

impl fmt::Display for UsbVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.sub)
    }
}

/// Decode a BCD-encoded 16-bit version field
///
/// The two high nibbles form a two-digit decimal major number, the third
/// nibble the minor and the lowest nibble the sub-minor. Digits outside
/// 0..=9 are not valid BCD; a major whose first digit is invalid decodes
/// as 0, a major whose second digit is invalid keeps only the first digit,
/// and an invalid minor or sub digit decodes as 0.
pub fn decode_version(value: u16) -> UsbVersion {
    let d0 = ((value >> 12) & 0x0f) as u8;
    let d1 = ((value >> 8) & 0x0f) as u8;
    let d2 = ((value >> 4) & 0x0f) as u8;
    let d3 = (value & 0x0f) as u8;

    let major = match (d0, d1) {
        (d0, _) if d0 > 9 => 0,
        (d0, d1) if d1 > 9 => d0,
        (d0, d1) => d0 * 10 + d1,
    };
    let digit = |d: u8| if d > 9 { 0 } else { d };

    UsbVersion {
        major,
        minor: digit(d2),
        sub: digit(d3),
    }
}
