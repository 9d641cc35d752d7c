//! WebUSB-style USB access for Rust
//!
//! The crate sits between an application and a USB [`Transport`]. It
//! decodes what devices report about themselves, enforces the call
//! sequencing every device operation requires (open, configure, claim,
//! transfer), and gates access behind a permission allow-list populated by
//! [`Usb::request_device`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use webusb::transport::mock::MockTransport;
//! use webusb::{DeviceFilter, RequestDeviceOptions, Usb, UsbOptions};
//! use common::test_utils::create_mock_raw_device;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let transport = MockTransport::new();
//! transport.add_device(create_mock_raw_device(1, 4, 0x0d28, 0x0204));
//!
//! let usb = Usb::new(Arc::new(transport), UsbOptions::default());
//! let device = usb
//!     .request_device(&RequestDeviceOptions::new(vec![DeviceFilter::vendor(0x0d28)]))
//!     .await
//!     .unwrap();
//!
//! device.open().await.unwrap();
//! device.select_configuration(1).await.unwrap();
//! device.claim_interface(0).await.unwrap();
//! let result = device.transfer_in(1, 8).await.unwrap();
//! assert_eq!(result.data.len(), 8);
//! # });
//! ```

pub mod allow_list;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod events;
pub mod filter;
pub mod model;
mod relay;
pub mod sequencing;
pub mod transport;
pub mod usb;

pub use config::UsbConfig;
pub use device::UsbDevice;
pub use discovery::DiscoveryOptions;
pub use error::{Error, ErrorKind, Result};
pub use events::{Event, EventDispatcher, ListenerId, UsbEvent, UsbEventKind};
pub use model::{
    AlternateInterface, Configuration, DeviceIdentity, DeviceInfo, Endpoint, Interface,
};
pub use protocol::{
    ControlTransferParameters, DeviceFilter, DeviceHandle, Direction, EndpointType,
    InTransferResult, IsochronousInTransferResult, IsochronousOutTransferResult,
    OutTransferResult, Recipient, RequestType, TransferStatus, TransportError, UsbVersion,
};
pub use sequencing::InterfaceState;
pub use transport::{HotplugSubscription, Transport};
pub use usb::{DeviceSelector, RequestDeviceOptions, Usb, UsbOptions};
