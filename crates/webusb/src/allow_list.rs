//! Permission allow-list
//!
//! An entry is keyed by device identity (vendor ID, product ID, serial
//! number), never by transport handle. The grant outlives the physical
//! connection; the live device bound to it changes as the device is
//! unplugged and plugged back in.

use protocol::{DeviceFilter, DeviceHandle};
use std::sync::Arc;

use crate::device::UsbDevice;
use crate::model::DeviceIdentity;

#[derive(Debug)]
struct AllowListEntry {
    identity: DeviceIdentity,
    device: Option<Arc<UsbDevice>>,
}

/// Outcome of offering a live device to the allow-list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// The device is now the live device of its grant
    Bound,
    /// Granted identity, but another connected device already holds the grant
    Occupied,
    NotGranted,
}

#[derive(Debug, Default)]
pub struct AllowList {
    entries: Vec<AllowListEntry>,
}

impl AllowList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant access to a device, replacing the device of a matching grant
    pub fn grant(&mut self, device: Arc<UsbDevice>) {
        if !self.bind(Arc::clone(&device)) {
            self.entries.push(AllowListEntry {
                identity: device.identity(),
                device: Some(device),
            });
        }
    }

    /// Bind a live device to the grant with the same identity
    ///
    /// Returns `false` if no grant matches.
    pub fn bind(&mut self, device: Arc<UsbDevice>) -> bool {
        let identity = device.identity();
        match self.entries.iter_mut().find(|e| e.identity == identity) {
            Some(entry) => {
                entry.device = Some(device);
                true
            }
            None => false,
        }
    }

    /// Bind a live device only if its grant has no connected device
    ///
    /// Identical boards share an identity; the one already bound keeps its
    /// grant and its claim/configuration state.
    pub fn bind_vacant(&mut self, device: Arc<UsbDevice>) -> Binding {
        let identity = device.identity();
        let Some(entry) = self.entries.iter_mut().find(|e| e.identity == identity) else {
            return Binding::NotGranted;
        };
        match &entry.device {
            Some(bound) if bound.handle() == device.handle() => {
                entry.device = Some(device);
                Binding::Bound
            }
            Some(bound) if bound.connected() => Binding::Occupied,
            _ => {
                entry.device = Some(device);
                Binding::Bound
            }
        }
    }

    /// Unbind the live device with this handle, keeping its grant
    pub fn remove_by_handle(&mut self, handle: DeviceHandle) -> Option<Arc<UsbDevice>> {
        self.entries
            .iter_mut()
            .find(|e| e.device.as_ref().is_some_and(|d| d.handle() == handle))
            .and_then(|e| e.device.take())
    }

    /// Unbind every live device that is no longer connected
    pub fn prune_disconnected(&mut self) -> usize {
        let mut pruned = 0;
        for entry in &mut self.entries {
            if entry.device.as_ref().is_some_and(|d| !d.connected()) {
                entry.device = None;
                pruned += 1;
            }
        }
        pruned
    }

    pub fn find_by_handle(&self, handle: DeviceHandle) -> Option<Arc<UsbDevice>> {
        self.entries
            .iter()
            .filter_map(|e| e.device.as_ref())
            .find(|d| d.handle() == handle)
            .cloned()
    }

    pub fn is_granted(&self, identity: &DeviceIdentity) -> bool {
        self.entries.iter().any(|e| &e.identity == identity)
    }

    /// Whether any grant could belong to a device with these IDs
    pub fn may_match(&self, vendor_id: u16, product_id: u16) -> bool {
        self.entries
            .iter()
            .any(|e| e.identity.vendor_id == vendor_id && e.identity.product_id == product_id)
    }

    /// Live devices bound to a grant
    pub fn devices(&self) -> Vec<Arc<UsbDevice>> {
        self.entries
            .iter()
            .filter_map(|e| e.device.clone())
            .collect()
    }

    pub fn identities(&self) -> Vec<DeviceIdentity> {
        self.entries.iter().map(|e| e.identity.clone()).collect()
    }

    /// Vendor/product pre-filter covering every grant
    pub fn pre_filter(&self) -> Vec<DeviceFilter> {
        let mut filters: Vec<DeviceFilter> = Vec::new();
        for entry in &self.entries {
            let filter = DeviceFilter {
                vendor_id: Some(entry.identity.vendor_id),
                product_id: Some(entry.identity.product_id),
                ..Default::default()
            };
            if !filters.contains(&filter) {
                filters.push(filter);
            }
        }
        filters
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceInfo, StringTable};
    use crate::transport::mock::MockTransport;
    use common::test_utils::{SERIAL_INDEX, create_mock_raw_device};

    fn device(address: u8, serial: &str) -> Arc<UsbDevice> {
        let raw = create_mock_raw_device(1, address, 0x0d28, 0x0204);
        let mut strings = StringTable::new();
        strings.insert(SERIAL_INDEX, serial.to_string());
        let info = DeviceInfo::new(&raw, &strings, None);
        Arc::new(UsbDevice::new(
            Arc::new(MockTransport::new()),
            raw.handle,
            info,
            None,
        ))
    }

    #[test]
    fn test_grant_replaces_same_identity() {
        let mut list = AllowList::new();
        list.grant(device(1, ""));
        list.grant(device(2, ""));
        list.grant(device(3, "X"));

        assert_eq!(list.len(), 2);
        let handles: Vec<_> = list.devices().iter().map(|d| d.handle()).collect();
        assert_eq!(handles, vec![DeviceHandle::new(1, 2), DeviceHandle::new(1, 3)]);
        assert_eq!(list.pre_filter().len(), 1);
    }

    #[test]
    fn test_detach_keeps_grant() {
        let mut list = AllowList::new();
        list.grant(device(1, ""));

        assert!(list.remove_by_handle(DeviceHandle::new(1, 9)).is_none());
        let removed = list.remove_by_handle(DeviceHandle::new(1, 1)).unwrap();
        assert_eq!(removed.handle(), DeviceHandle::new(1, 1));
        assert!(list.devices().is_empty());
        assert!(list.find_by_handle(DeviceHandle::new(1, 1)).is_none());
        assert!(list.is_granted(&removed.identity()));

        // same identity on a new handle
        assert!(list.bind(device(7, "")));
        assert!(list.find_by_handle(DeviceHandle::new(1, 7)).is_some());
        // different serial: not granted
        assert!(!list.bind(device(8, "other")));
        assert!(list.may_match(0x0d28, 0x0204));
        assert!(!list.may_match(0x0d28, 0x0205));
    }

    #[test]
    fn test_twin_does_not_displace_connected_device() {
        let mock = MockTransport::new();
        let transport: Arc<dyn crate::transport::Transport> = Arc::new(mock.clone());
        let board = |address| {
            let raw = create_mock_raw_device(1, address, 0x0d28, 0x0204);
            let handle = mock.add_device(raw.clone());
            let info = DeviceInfo::new(&raw, &StringTable::new(), None);
            Arc::new(UsbDevice::new(Arc::clone(&transport), handle, info, None))
        };
        let granted = board(1);
        let twin = board(2);

        let mut list = AllowList::new();
        list.grant(Arc::clone(&granted));
        assert_eq!(list.bind_vacant(Arc::clone(&twin)), Binding::Occupied);
        assert_eq!(list.devices()[0].handle(), granted.handle());

        mock.detach(granted.handle());
        assert_eq!(list.bind_vacant(Arc::clone(&twin)), Binding::Bound);
        assert_eq!(list.devices()[0].handle(), twin.handle());
        assert_eq!(list.bind_vacant(device(3, "S")), Binding::NotGranted);
    }
}
