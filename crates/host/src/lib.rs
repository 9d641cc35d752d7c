//! Local-host USB transport for webusb-rs
//!
//! Runs libusb (through `rusb`) on a dedicated worker thread and exposes it
//! to the WebUSB core as a [`webusb::Transport`]. The worker keeps the
//! device table mapping [`protocol::DeviceHandle`]s to live libusb handles
//! and forwards libusb hot-plug callbacks to every watching subscription.
//!
//! ```no_run
//! use std::sync::Arc;
//! use webusb::{DeviceFilter, RequestDeviceOptions, Usb, UsbConfig, UsbOptions};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = UsbConfig::load_or_default();
//! config.init_logging()?;
//! let transport = host::HostTransport::start(&config.transport)?;
//! let usb = Usb::new(Arc::new(transport), UsbOptions::from_config(&config));
//!
//! let device = usb
//!     .request_device(&RequestDeviceOptions::new(vec![DeviceFilter::vendor(0x0d28)]))
//!     .await?;
//! device.open().await?;
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod manager;
pub mod transfers;
pub mod transport;
pub mod worker;

pub use manager::{DeviceManager, DeviceStatus, StatusMap};
pub use transfers::map_rusb_error;
pub use transport::HostTransport;
pub use worker::{UsbWorkerThread, spawn_usb_worker};
