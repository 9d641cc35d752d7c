//! Common utilities for webusb-rs
//!
//! This crate provides shared functionality between the WebUSB core and
//! its transports: error handling, logging setup, the async channel bridge
//! for USB thread communication and test helpers.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{DeviceOp, OpOutput, UsbBridge, UsbCommand, UsbWorker, create_usb_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
