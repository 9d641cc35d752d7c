//! Test utilities for webusb-rs
//!
//! Raw descriptor builders and mock device constructors shared by the test
//! suites of every crate. Mock devices are produced by parsing the raw
//! descriptor bytes, so they look exactly like what a transport reports.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_raw_device;
//!
//! let device = create_mock_raw_device(1, 4, 0x0d28, 0x0204);
//! assert_eq!(device.descriptor.vendor_id, 0x0d28);
//! assert_eq!(device.configurations.len(), 1);
//! ```

use protocol::{ConfigDescriptor, DeviceDescriptor, DeviceHandle, RawDevice};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// String descriptor indices used by [`create_mock_device_descriptor`]
pub const MANUFACTURER_INDEX: u8 = 1;
pub const PRODUCT_INDEX: u8 = 2;
pub const SERIAL_INDEX: u8 = 3;
/// iConfiguration of the mock configuration
pub const CONFIGURATION_NAME_INDEX: u8 = 4;
/// iInterface of interface 0 alternate 0
pub const INTERFACE_NAME_INDEX: u8 = 5;

/// Endpoints of the mock configuration
pub const BULK_IN_ENDPOINT: u8 = 1;
pub const BULK_OUT_ENDPOINT: u8 = 2;
/// Only present on interface 0 alternate setting 1
pub const ISO_IN_ENDPOINT: u8 = 3;
/// Interface 1
pub const INTERRUPT_IN_ENDPOINT: u8 = 4;

/// WebUSB platform UUID as it appears on the wire
pub const WEBUSB_UUID_BYTES: [u8; 16] = [
    0x38, 0xb6, 0x08, 0x34, 0xa9, 0x09, 0xa0, 0x47, 0x8b, 0xfd, 0xa0, 0x76, 0x88, 0x15, 0xb6, 0x65,
];

/// Create a standard 18-byte device descriptor
///
/// String indices are 1 (manufacturer), 2 (product) and 3 (serial).
pub fn create_mock_device_descriptor(vendor_id: u16, product_id: u16, usb_version: u16) -> Vec<u8> {
    create_mock_device_descriptor_with_class(vendor_id, product_id, usb_version, 0x00, 0x00, 0x00)
}

/// Create a device descriptor with a specific device class triad
pub fn create_mock_device_descriptor_with_class(
    vendor_id: u16,
    product_id: u16,
    usb_version: u16,
    class: u8,
    subclass: u8,
    protocol: u8,
) -> Vec<u8> {
    let usb = usb_version.to_le_bytes();
    let vid = vendor_id.to_le_bytes();
    let pid = product_id.to_le_bytes();
    vec![
        0x12, // bLength
        0x01, // bDescriptorType (Device)
        usb[0], usb[1], // bcdUSB
        class,    // bDeviceClass
        subclass, // bDeviceSubClass
        protocol, // bDeviceProtocol
        0x40,     // bMaxPacketSize0 (64 bytes)
        vid[0], vid[1], // idVendor
        pid[0], pid[1], // idProduct
        0x00, 0x01, // bcdDevice (1.00)
        MANUFACTURER_INDEX,
        PRODUCT_INDEX,
        SERIAL_INDEX,
        0x01, // bNumConfigurations
    ]
}

/// Create a configuration descriptor set
///
/// Configuration 1 has two interfaces:
/// - interface 0, vendor class: alternate 0 with bulk IN 1 / bulk OUT 2,
///   alternate 1 with isochronous IN 3
/// - interface 1, HID class: interrupt IN 4
pub fn create_mock_config_descriptor() -> Vec<u8> {
    let mut desc = vec![
        // Configuration descriptor
        0x09, // bLength
        0x02, // bDescriptorType (Configuration)
        0x00, 0x00, // wTotalLength (patched below)
        0x02, // bNumInterfaces
        0x01, // bConfigurationValue
        CONFIGURATION_NAME_INDEX,
        0x80, // bmAttributes (Bus-powered)
        0x32, // bMaxPower (100mA)
        // Interface 0, alternate 0
        0x09, 0x04, 0x00, 0x00, 0x02, 0xff, 0x00, 0x00, INTERFACE_NAME_INDEX,
        // Bulk IN 1
        0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00,
        // Bulk OUT 2
        0x07, 0x05, 0x02, 0x02, 0x40, 0x00, 0x00,
        // Interface 0, alternate 1
        0x09, 0x04, 0x00, 0x01, 0x01, 0xff, 0x00, 0x00, 0x00,
        // Isochronous IN 3
        0x07, 0x05, 0x83, 0x01, 0xc0, 0x00, 0x01,
        // Interface 1, alternate 0 (HID)
        0x09, 0x04, 0x01, 0x00, 0x01, 0x03, 0x01, 0x02, 0x00,
        // HID class descriptor (skipped by parsers)
        0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x3f, 0x00,
        // Interrupt IN 4
        0x07, 0x05, 0x84, 0x03, 0x08, 0x00, 0x0a,
    ];
    let total = (desc.len() as u16).to_le_bytes();
    desc[2] = total[0];
    desc[3] = total[1];
    desc
}

/// Create a BOS descriptor holding a WebUSB platform capability
pub fn create_mock_bos_descriptor(vendor_code: u8, landing_page: u8) -> Vec<u8> {
    let mut capability = vec![
        0x18, // bLength
        0x10, // bDescriptorType (Device Capability)
        0x05, // bDevCapabilityType (Platform)
        0x00, // bReserved
    ];
    capability.extend_from_slice(&WEBUSB_UUID_BYTES);
    capability.extend_from_slice(&0x0100u16.to_le_bytes());
    capability.push(vendor_code);
    capability.push(landing_page);

    // USB 2.0 extension capability in front
    let extension = [0x07, 0x10, 0x02, 0x02, 0x00, 0x00, 0x00];

    let total = (5 + extension.len() + capability.len()) as u16;
    let mut desc = vec![0x05, 0x0f];
    desc.extend_from_slice(&total.to_le_bytes());
    desc.push(0x02);
    desc.extend_from_slice(&extension);
    desc.extend(capability);
    desc
}

/// Create a WebUSB URL descriptor
pub fn create_mock_url_descriptor(scheme: u8, url: &str) -> Vec<u8> {
    let mut desc = vec![(url.len() + 3) as u8, 0x03, scheme];
    desc.extend_from_slice(url.as_bytes());
    desc
}

/// Create a mock handle
pub fn create_mock_handle(bus: u8, address: u8) -> DeviceHandle {
    DeviceHandle::new(bus, address)
}

/// Create a mock USB 2.1 device with the standard mock configuration
pub fn create_mock_raw_device(bus: u8, address: u8, vendor_id: u16, product_id: u16) -> RawDevice {
    create_mock_raw_device_from(
        create_mock_handle(bus, address),
        &create_mock_device_descriptor(vendor_id, product_id, 0x0210),
        &create_mock_config_descriptor(),
    )
}

/// Create a mock device with a specific device class triad
pub fn create_mock_raw_device_with_class(
    bus: u8,
    address: u8,
    vendor_id: u16,
    product_id: u16,
    class: u8,
    subclass: u8,
    protocol: u8,
) -> RawDevice {
    create_mock_raw_device_from(
        create_mock_handle(bus, address),
        &create_mock_device_descriptor_with_class(
            vendor_id, product_id, 0x0210, class, subclass, protocol,
        ),
        &create_mock_config_descriptor(),
    )
}

/// Create a mock device from raw descriptor bytes
///
/// # Panics
/// If the descriptors do not parse.
pub fn create_mock_raw_device_from(
    handle: DeviceHandle,
    device_descriptor: &[u8],
    config_descriptor: &[u8],
) -> RawDevice {
    let descriptor = DeviceDescriptor::parse(device_descriptor).expect("valid device descriptor");
    let config = ConfigDescriptor::parse(config_descriptor).expect("valid config descriptor");
    RawDevice {
        handle,
        descriptor,
        configurations: vec![config],
        active_configuration: None,
    }
}

/// Run a future with a timeout
///
/// # Example
/// ```no_run
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
