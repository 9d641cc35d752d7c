//! Device filter validation and matching

use protocol::DeviceFilter;

use crate::error::{Error, Result};
use crate::model::DeviceInfo;

/// Check a filter list before any enumeration happens
///
/// The list must be non-empty, and every filter must respect the class
/// hierarchy: a protocol code needs a subclass code, a subclass code needs a
/// class code.
pub fn validate_filters(op: &'static str, filters: &[DeviceFilter]) -> Result<()> {
    if filters.is_empty() {
        return Err(Error::type_error(op, "filters must not be empty"));
    }
    for filter in filters {
        if filter.protocol_code.is_some() && filter.subclass_code.is_none() {
            return Err(Error::type_error(op, "protocolCode requires subclassCode"));
        }
        if filter.subclass_code.is_some() && filter.class_code.is_none() {
            return Err(Error::type_error(op, "subclassCode requires classCode"));
        }
    }
    Ok(())
}

/// Whether a device satisfies every field the filter specifies
pub fn matches(filter: &DeviceFilter, info: &DeviceInfo) -> bool {
    if !filter.matches_ids(info.vendor_id, info.product_id) {
        return false;
    }
    if let Some(serial) = &filter.serial_number
        && info.serial_number.as_ref() != Some(serial)
    {
        return false;
    }
    if filter.class_code.is_none() {
        return true;
    }

    let class_matches = |class: u8, subclass: u8, protocol: u8| {
        filter.class_code == Some(class)
            && filter.subclass_code.is_none_or(|s| s == subclass)
            && filter.protocol_code.is_none_or(|p| p == protocol)
    };

    class_matches(info.device_class, info.device_subclass, info.device_protocol)
        || info
            .configurations
            .iter()
            .flat_map(|c| &c.interfaces)
            .flat_map(|i| &i.alternates)
            .any(|a| class_matches(a.interface_class, a.interface_subclass, a.interface_protocol))
}

/// Whether a device satisfies at least one filter
pub fn matches_any(filters: &[DeviceFilter], info: &DeviceInfo) -> bool {
    filters.iter().any(|f| matches(f, info))
}
