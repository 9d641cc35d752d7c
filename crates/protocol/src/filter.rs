//! Device filter criteria

use serde::{Deserialize, Serialize};

/// Device selection criteria
///
/// Every field is optional; a field left unset matches anything. Numeric
/// fields compare against the device and interface descriptors, the serial
/// number against the decoded serial number string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_code: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subclass_code: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_code: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

impl DeviceFilter {
    /// Filter on vendor ID only
    pub fn vendor(vendor_id: u16) -> Self {
        Self {
            vendor_id: Some(vendor_id),
            ..Default::default()
        }
    }

    /// Whether the vendor/product part of this filter admits the given IDs
    pub fn matches_ids(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|v| v == vendor_id)
            && self.product_id.is_none_or(|p| p == product_id)
    }
}

/// Whether a device with these IDs can match any pre-filter entry
///
/// An empty pre-filter admits every device.
pub fn pre_filter_admits(pre_filter: &[DeviceFilter], vendor_id: u16, product_id: u16) -> bool {
    pre_filter.is_empty() || pre_filter.iter().any(|f| f.matches_ids(vendor_id, product_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_ids() {
        let filter = DeviceFilter {
            vendor_id: Some(0x0d28),
            product_id: Some(0x0204),
            ..Default::default()
        };
        assert!(filter.matches_ids(0x0d28, 0x0204));
        assert!(!filter.matches_ids(0x0d28, 0x0205));
        assert!(DeviceFilter::vendor(0x0d28).matches_ids(0x0d28, 0xffff));
        assert!(DeviceFilter::default().matches_ids(1, 2));
    }

    #[test]
    fn test_pre_filter_admits() {
        assert!(pre_filter_admits(&[], 1, 2));
        let pre = [DeviceFilter::vendor(1), DeviceFilter::vendor(3)];
        assert!(pre_filter_admits(&pre, 3, 9));
        assert!(!pre_filter_admits(&pre, 2, 9));
    }
}
