//! USB protocol library for webusb-rs
//!
//! This crate defines the USB-level vocabulary shared by the WebUSB core and
//! every transport implementation: standard descriptor parsing, BOS
//! capability decoding, the WebUSB landing page handshake, BCD version
//! decoding, device filters, transfer results and the closed set of
//! transport errors.
//! Nothing in here performs I/O.
//!
//! # Example
//!
//! ```
//! use protocol::{decode_version, decode_url_descriptor};
//!
//! let version = decode_version(0x0210);
//! assert_eq!((version.major, version.minor, version.sub), (2, 1, 0));
//!
//! let url = decode_url_descriptor(&[14, 0x03, 1, b'e', b'x', b'a', b'm', b'p', b'l', b'e',
//!     b'.', b'c', b'o', b'm']);
//! assert_eq!(url.as_deref(), Some("https://example.com"));
//! ```

pub mod bos;
pub mod descriptor;
pub mod error;
pub mod filter;
pub mod types;
pub mod url;
pub mod version;

pub use bos::{
    BOS_HEADER_SIZE, Capability, LandingPageRequest, PLATFORM_CAPABILITY_TYPE,
    WEBUSB_CAPABILITY_VERSION, WEBUSB_PLATFORM_UUID, bos_total_length, decode_bos_capabilities,
    decode_uuid, find_web_capability,
};
pub use descriptor::{
    BOS_DESCRIPTOR_TYPE, ConfigDescriptor, DeviceDescriptor, EndpointDescriptor,
    InterfaceDescriptor, STRING_DESCRIPTOR_TYPE,
};
pub use error::{DecodeError, Result};
pub use filter::{DeviceFilter, pre_filter_admits};
pub use types::{
    ControlTransferParameters, DeviceHandle, Direction, EndpointType, HotplugEvent,
    InTransferResult, IsochronousInPacket, IsochronousInTransferResult, IsochronousOutPacket,
    IsochronousOutTransferResult, OutTransferResult, RawDevice, Recipient, RequestType,
    TransferStatus, TransportError,
};
pub use url::{GET_URL_REQUEST, URL_DESCRIPTOR_MAX_LENGTH, decode_url_descriptor};
pub use version::{BOS_MIN_USB_VERSION, UsbVersion, decode_version};
