//! Device discovery
//!
//! Turns a [`RawDevice`] reported by the transport into a fully populated
//! [`UsbDevice`]: string descriptors, WebUSB landing page and the
//! configuration tree. Discovery never fails; anything the device refuses
//! to report is simply left empty.

use protocol::{
    BOS_DESCRIPTOR_TYPE, BOS_HEADER_SIZE, BOS_MIN_USB_VERSION, ControlTransferParameters,
    DeviceHandle, GET_URL_REQUEST, LandingPageRequest, RawDevice, Recipient, RequestType,
    TransportError, URL_DESCRIPTOR_MAX_LENGTH, bos_total_length, decode_bos_capabilities,
    decode_url_descriptor, find_web_capability,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::device::UsbDevice;
use crate::model::{DeviceInfo, StringTable, string_indices};
use crate::transport::{Transport, TransportResult};

/// GET_DESCRIPTOR standard request
const GET_DESCRIPTOR: u8 = 0x06;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Extra open attempts after a transient failure
    pub open_retries: u32,
    /// Delay between open attempts
    pub retry_delay: Duration,
    /// Probe for a WebUSB landing page
    pub fetch_landing_url: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            open_retries: 10,
            retry_delay: Duration::from_millis(200),
            fetch_landing_url: true,
        }
    }
}

impl DiscoveryOptions {
    /// Same options with a different retry count
    pub fn with_retries(&self, open_retries: u32) -> Self {
        Self {
            open_retries,
            ..self.clone()
        }
    }
}

/// Build a device from its raw descriptors and the strings it reports
///
/// Leaves the device closed unless it was already open on entry.
pub async fn discover(
    transport: &Arc<dyn Transport>,
    raw: &RawDevice,
    options: &DiscoveryOptions,
) -> UsbDevice {
    let handle = raw.handle;
    let mut strings = StringTable::new();
    let mut url = None;

    let was_opened = transport.is_opened(handle);
    let opened = was_opened || open_with_retry(transport.as_ref(), handle, options).await;

    if opened {
        strings = read_strings(transport.as_ref(), raw).await;
        if options.fetch_landing_url {
            url = fetch_landing_url(transport.as_ref(), raw).await;
        }
        if !was_opened && let Err(e) = transport.close(handle).await {
            debug!("Failed to close {} after discovery: {}", handle, e);
        }
    } else {
        warn!(
            "Could not open {} ({:04x}:{:04x}), device strings left empty",
            handle, raw.descriptor.vendor_id, raw.descriptor.product_id
        );
    }

    let info = DeviceInfo::new(raw, &strings, url);
    debug!(
        "Discovered {} {:04x}:{:04x} product={:?} url={:?}",
        handle, info.vendor_id, info.product_id, info.product_name, info.url
    );
    UsbDevice::new(
        Arc::clone(transport),
        handle,
        info,
        raw.active_configuration,
    )
}

/// Open with a bounded number of retries on transient failures
async fn open_with_retry(
    transport: &dyn Transport,
    handle: DeviceHandle,
    options: &DiscoveryOptions,
) -> bool {
    let attempts = options.open_retries.saturating_add(1);
    for attempt in 1..=attempts {
        match transport.open(handle).await {
            Ok(()) => return true,
            Err(e) if e.is_transient() && attempt < attempts => {
                debug!(
                    "Open of {} failed ({}), retry {}/{}",
                    handle, e, attempt, options.open_retries
                );
                tokio::time::sleep(options.retry_delay).await;
            }
            Err(e) => {
                debug!("Open of {} failed: {}", handle, e);
                return false;
            }
        }
    }
    false
}

/// Read every referenced string descriptor, one at a time, in index order
async fn read_strings(transport: &dyn Transport, raw: &RawDevice) -> StringTable {
    let mut strings = StringTable::new();
    for index in string_indices(raw) {
        let value = match transport.get_string_descriptor(raw.handle, index).await {
            Ok(value) => value,
            Err(e) => {
                debug!(
                    "String descriptor {} unreadable on {}: {}",
                    index, raw.handle, e
                );
                String::new()
            }
        };
        strings.insert(index, value);
    }
    strings
}

/// Probe the BOS descriptor for a WebUSB landing page
async fn fetch_landing_url(transport: &dyn Transport, raw: &RawDevice) -> Option<String> {
    let usb_version = raw.descriptor.usb_version;
    if usb_version < BOS_MIN_USB_VERSION {
        return None;
    }

    let bos = match read_bos(transport, raw.handle).await {
        Ok(bos) => bos,
        Err(e) => {
            debug!("No BOS descriptor on {}: {}", raw.handle, e);
            return None;
        }
    };
    let capabilities = decode_bos_capabilities(usb_version, &bos);
    let request = LandingPageRequest::from_capability(find_web_capability(&capabilities)?)?;

    let setup = ControlTransferParameters {
        request_type: RequestType::Vendor,
        recipient: Recipient::Device,
        request: request.vendor_code,
        value: request.landing_page as u16,
        index: GET_URL_REQUEST,
    };
    match transport
        .control_transfer_in(raw.handle, setup, URL_DESCRIPTOR_MAX_LENGTH)
        .await
    {
        Ok(buf) => decode_url_descriptor(&buf),
        Err(e) => {
            debug!("Landing page request failed on {}: {}", raw.handle, e);
            None
        }
    }
}

/// Read the header to learn wTotalLength, then the whole descriptor
async fn read_bos(transport: &dyn Transport, handle: DeviceHandle) -> TransportResult<Vec<u8>> {
    let setup = ControlTransferParameters {
        request_type: RequestType::Standard,
        recipient: Recipient::Device,
        request: GET_DESCRIPTOR,
        value: (BOS_DESCRIPTOR_TYPE as u16) << 8,
        index: 0,
    };

    let header = transport
        .control_transfer_in(handle, setup, BOS_HEADER_SIZE as u16)
        .await?;
    let total_length = bos_total_length(&header).ok_or(TransportError::Other {
        message: format!("short BOS header ({} bytes)", header.len()),
    })?;
    transport
        .control_transfer_in(handle, setup, total_length)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use common::test_utils::{
        INTERFACE_NAME_INDEX, create_mock_bos_descriptor, create_mock_config_descriptor,
        create_mock_device_descriptor, create_mock_handle, create_mock_raw_device,
        create_mock_raw_device_from, create_mock_url_descriptor,
    };

    fn options() -> DiscoveryOptions {
        DiscoveryOptions {
            open_retries: 2,
            retry_delay: Duration::from_millis(1),
            fetch_landing_url: true,
        }
    }

    fn transport(mock: &MockTransport) -> Arc<dyn Transport> {
        Arc::new(mock.clone())
    }

    #[tokio::test]
    async fn test_discover_full_device() {
        let mock = MockTransport::new();
        let raw = create_mock_raw_device(1, 4, 0x2fe3, 0x0100);
        let handle = mock.add_device(raw.clone());
        mock.set_device_strings(handle, "Acme", "Widget", "A1B2");
        mock.set_string(handle, INTERFACE_NAME_INDEX, "Data");
        mock.set_bos(handle, create_mock_bos_descriptor(0x01, 1));
        mock.set_url_descriptor(handle, create_mock_url_descriptor(1, "example.com"));

        let device = discover(&transport(&mock), &raw, &options()).await;
        let info = device.info();
        assert_eq!(info.manufacturer_name.as_deref(), Some("Acme"));
        assert_eq!(info.product_name.as_deref(), Some("Widget"));
        assert_eq!(info.serial_number.as_deref(), Some("A1B2"));
        // configuration name index set but never answered
        assert_eq!(info.configurations[0].configuration_name.as_deref(), Some(""));
        assert_eq!(info.url.as_deref(), Some("https://example.com"));

        // opened for discovery, then closed again
        assert!(!device.opened());
        assert_eq!(mock.call_count_of("open"), 1);
        assert_eq!(mock.call_count_of("close"), 1);
    }

    #[tokio::test]
    async fn test_old_device_skips_bos() {
        let mock = MockTransport::new();
        let handle = create_mock_handle(1, 2);
        let raw = create_mock_raw_device_from(
            handle,
            &create_mock_device_descriptor(0x1234, 0x0001, 0x0200),
            &create_mock_config_descriptor(),
        );
        mock.add_device(raw.clone());
        mock.set_bos(handle, create_mock_bos_descriptor(0x01, 1));

        let device = discover(&transport(&mock), &raw, &options()).await;
        assert_eq!(device.url(), None);
        assert_eq!(mock.call_count_of("control_transfer_in"), 0);
    }

    #[tokio::test]
    async fn test_missing_bos_and_url_yield_none() {
        let mock = MockTransport::new();
        let raw = create_mock_raw_device(1, 3, 0x1234, 0x0001);
        let handle = mock.add_device(raw.clone());

        let device = discover(&transport(&mock), &raw, &options()).await;
        assert_eq!(device.url(), None);

        // capability present but the URL request stalls
        mock.set_bos(handle, create_mock_bos_descriptor(0x01, 1));
        let device = discover(&transport(&mock), &raw, &options()).await;
        assert_eq!(device.url(), None);
        assert_eq!(mock.call_count_of("control_transfer_in"), 1 + 3);
    }

    #[tokio::test]
    async fn test_landing_url_fetch_disabled() {
        let mock = MockTransport::new();
        let raw = create_mock_raw_device(1, 3, 0x1234, 0x0001);
        let handle = mock.add_device(raw.clone());
        mock.set_bos(handle, create_mock_bos_descriptor(0x01, 1));
        mock.set_url_descriptor(handle, create_mock_url_descriptor(0, "example.com"));

        let options = DiscoveryOptions {
            fetch_landing_url: false,
            ..options()
        };
        let device = discover(&transport(&mock), &raw, &options).await;
        assert_eq!(device.url(), None);
        assert_eq!(mock.call_count_of("control_transfer_in"), 0);
    }

    #[tokio::test]
    async fn test_open_retry_on_transient_failure() {
        let mock = MockTransport::new();
        let raw = create_mock_raw_device(1, 5, 0x1234, 0x0001);
        let handle = mock.add_device(raw.clone());
        mock.set_device_strings(handle, "Acme", "Widget", "S");
        mock.fail_open(handle, 2, TransportError::Busy);

        let device = discover(&transport(&mock), &raw, &options()).await;
        assert_eq!(mock.call_count_of("open"), 3);
        assert_eq!(device.info().product_name.as_deref(), Some("Widget"));
    }

    #[tokio::test]
    async fn test_open_gives_up() {
        let mock = MockTransport::new();
        let raw = create_mock_raw_device(1, 5, 0x1234, 0x0001);
        let handle = mock.add_device(raw.clone());
        mock.set_device_strings(handle, "Acme", "Widget", "S");
        mock.fail_open(handle, 1, TransportError::Busy);

        let device = discover(&transport(&mock), &raw, &options().with_retries(0)).await;
        assert_eq!(mock.call_count_of("open"), 1);
        assert_eq!(mock.call_count_of("get_string_descriptor"), 0);
        assert_eq!(device.info().product_name.as_deref(), Some(""));
        assert_eq!(device.url(), None);

        // non-transient errors are not retried
        mock.fail_open(handle, 1, TransportError::NotSupported);
        mock.clear_calls();
        discover(&transport(&mock), &raw, &options()).await;
        assert_eq!(mock.call_count_of("open"), 1);
    }
}
