//! USB device manager
//!
//! Owns the libusb context and the device table, runs device operations
//! and turns libusb hot-plug callbacks into [`HotplugEvent`]s for every
//! watching subscription. Lives on the worker thread.

use common::{DeviceOp, OpOutput};
use protocol::{
    DeviceFilter, DeviceHandle, HotplugEvent, RawDevice, TransportError, pre_filter_admits,
};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::device::{HostDevice, device_handle, is_root_hub, raw_device};
use crate::transfers::{self, map_rusb_error};

/// Per-device flags readable without a round trip to the worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    pub opened: bool,
}

/// Status of every device in the table, shared with the async side
#[derive(Debug, Clone, Default)]
pub struct StatusMap {
    inner: Arc<RwLock<HashMap<DeviceHandle, DeviceStatus>>>,
}

impl StatusMap {
    pub fn get(&self, handle: DeviceHandle) -> Option<DeviceStatus> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .copied()
    }

    fn set(&self, handle: DeviceHandle, status: DeviceStatus) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, status);
    }

    fn remove(&self, handle: DeviceHandle) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle);
    }

    fn retain(&self, keep: impl Fn(&DeviceHandle) -> bool) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|handle, _| keep(handle));
    }
}

/// Manager settings taken from the transport configuration
#[derive(Debug, Clone, Copy)]
pub struct ManagerSettings {
    /// Timeout for every libusb call that takes one
    pub timeout: Duration,
    pub skip_root_hubs: bool,
}

/// Device table and hot-plug fan-out
pub struct DeviceManager {
    context: Context,
    settings: ManagerSettings,
    devices: HashMap<DeviceHandle, HostDevice>,
    status: StatusMap,
    /// Hot-plug subscriptions by ID
    sinks: HashMap<u64, async_channel::Sender<HotplugEvent>>,
    notices: async_channel::Receiver<Notice>,
    notice_tx: async_channel::Sender<Notice>,
    registration: Option<Registration<Context>>,
}

impl DeviceManager {
    pub fn new(context: Context, settings: ManagerSettings, status: StatusMap) -> Self {
        let (notice_tx, notices) = async_channel::unbounded();
        Self {
            context,
            settings,
            devices: HashMap::new(),
            status,
            sinks: HashMap::new(),
            notices,
            notice_tx,
            registration: None,
        }
    }

    /// Register the libusb hot-plug callback
    ///
    /// Hosts without hot-plug support still work; the table is then only
    /// refreshed by enumeration and failed operations.
    pub fn initialize(&mut self) {
        if !rusb::has_hotplug() {
            warn!("libusb has no hot-plug support on this platform");
            return;
        }

        let callback = HotplugCallback {
            notices: self.notice_tx.clone(),
        };
        match HotplugBuilder::new()
            .enumerate(false)
            .register(&self.context, Box::new(callback))
        {
            Ok(registration) => {
                self.registration = Some(registration);
                debug!("Hot-plug callbacks registered");
            }
            Err(e) => warn!("Failed to register hot-plug callbacks: {}", e),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Enumerate attached devices and refresh the table
    ///
    /// Devices whose IDs the pre-filter rejects stay in the table but are
    /// not reported.
    pub fn enumerate(
        &mut self,
        pre_filter: &[DeviceFilter],
    ) -> Result<Vec<RawDevice>, TransportError> {
        let list = self.context.devices().map_err(map_rusb_error)?;

        let mut present = Vec::with_capacity(list.len());
        let mut reported = Vec::new();
        for device in list.iter() {
            let Some(raw) = self.admit(&device) else {
                continue;
            };
            present.push(raw.handle);

            let descriptor = &raw.descriptor;
            if pre_filter_admits(pre_filter, descriptor.vendor_id, descriptor.product_id) {
                reported.push(raw);
            }
        }

        let gone: Vec<DeviceHandle> = self
            .devices
            .keys()
            .filter(|handle| !present.contains(handle))
            .copied()
            .collect();
        for handle in gone {
            debug!("Device {} no longer enumerated", handle);
            self.remove(handle);
        }
        self.status.retain(|handle| present.contains(handle));

        debug!(
            "Enumerated {} devices, reporting {}",
            present.len(),
            reported.len()
        );
        Ok(reported)
    }

    /// Add a device to the table unless it is a skipped root hub
    fn admit(&mut self, device: &Device<Context>) -> Option<RawDevice> {
        let handle = device_handle(device);
        let raw = match raw_device(device) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to read descriptors of {}: {}", handle, e);
                return None;
            }
        };

        if self.settings.skip_root_hubs
            && is_root_hub(raw.descriptor.vendor_id, raw.descriptor.device_class)
        {
            trace!("Skipping root hub {}", handle);
            return None;
        }

        if !self.devices.contains_key(&handle) {
            debug!(
                "Added device {}: vid={:#06x}, pid={:#06x}",
                handle, raw.descriptor.vendor_id, raw.descriptor.product_id
            );
            self.devices.insert(handle, HostDevice::new(device.clone()));
            self.status.set(handle, DeviceStatus::default());
        }
        Some(raw)
    }

    fn remove(&mut self, handle: DeviceHandle) -> bool {
        self.status.remove(handle);
        // dropping the entry closes its libusb handle
        let removed = self.devices.remove(&handle).is_some();
        if removed {
            debug!("Removed device {}", handle);
        }
        removed
    }

    /// Run one operation against a device in the table
    pub fn device_op(
        &mut self,
        handle: DeviceHandle,
        op: DeviceOp,
    ) -> Result<OpOutput, TransportError> {
        let timeout = self.settings.timeout;
        let device = self.devices.get_mut(&handle).ok_or(TransportError::NoDevice)?;

        let result = match op {
            DeviceOp::Open => device.open().map(|()| OpOutput::Unit),
            DeviceOp::Close => {
                device.close();
                Ok(OpOutput::Unit)
            }
            DeviceOp::Reset => device.reset().map(|()| OpOutput::Unit),
            DeviceOp::SetConfiguration(value) => {
                device.set_configuration(value).map(|()| OpOutput::Unit)
            }
            DeviceOp::ClaimInterface(interface) => {
                device.claim_interface(interface).map(|()| OpOutput::Unit)
            }
            DeviceOp::ReleaseInterface(interface) => {
                device.release_interface(interface).map(|()| OpOutput::Unit)
            }
            DeviceOp::SetAlternateSetting {
                interface_number,
                alternate_setting,
            } => device
                .set_alternate_setting(interface_number, alternate_setting)
                .map(|()| OpOutput::Unit),
            DeviceOp::ClearHalt {
                direction,
                endpoint_number,
            } => device
                .clear_halt(direction, endpoint_number)
                .map(|()| OpOutput::Unit),
            DeviceOp::ControlIn { setup, length } => device
                .handle()
                .and_then(|h| transfers::control_in(h, setup, length, timeout))
                .map(OpOutput::Bytes),
            DeviceOp::ControlOut { setup, data } => device
                .handle()
                .and_then(|h| transfers::control_out(h, setup, &data, timeout))
                .map(OpOutput::Written),
            DeviceOp::GetStringDescriptor(index) => device
                .handle()
                .and_then(|h| transfers::read_string(h, index, timeout))
                .map(OpOutput::Text),
            DeviceOp::TransferIn {
                endpoint_number,
                endpoint_type,
                length,
            } => device
                .handle()
                .and_then(|h| {
                    transfers::transfer_in(h, endpoint_number, endpoint_type, length, timeout)
                })
                .map(OpOutput::Bytes),
            DeviceOp::TransferOut {
                endpoint_number,
                endpoint_type,
                data,
            } => device
                .handle()
                .and_then(|h| {
                    transfers::transfer_out(h, endpoint_number, endpoint_type, &data, timeout)
                })
                .map(OpOutput::Written),
        };

        let opened = device.is_open();
        if matches!(result, Err(TransportError::NoDevice)) {
            // unplugged without a hot-plug notification reaching us
            self.remove(handle);
        } else {
            self.status.set(handle, DeviceStatus { opened });
        }
        result
    }

    /// Start forwarding hot-plug events to a subscription
    pub fn watch(&mut self, id: u64, sink: async_channel::Sender<HotplugEvent>) {
        info!("Hot-plug subscription {} started", id);
        self.sinks.insert(id, sink);
    }

    pub fn unwatch(&mut self, id: u64) {
        if self.sinks.remove(&id).is_some() {
            info!("Hot-plug subscription {} stopped", id);
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.sinks.len()
    }

    /// Apply queued hot-plug callbacks to the table and fan them out
    ///
    /// Called after each `handle_events` pass.
    pub fn process_hotplug(&mut self) {
        while let Ok(notice) = self.notices.try_recv() {
            let event = match notice {
                Notice::Arrived(device) => match self.admit(&device) {
                    Some(raw) => {
                        info!("Device arrived at {}", raw.handle);
                        HotplugEvent::Attached(raw)
                    }
                    None => continue,
                },
                Notice::Left(handle) => {
                    if !self.remove(handle) {
                        continue;
                    }
                    info!("Device left {}", handle);
                    HotplugEvent::Detached(handle)
                }
            };
            self.broadcast(event);
        }
    }

    fn broadcast(&mut self, event: HotplugEvent) {
        self.sinks.retain(|id, sink| match sink.try_send(event.clone()) {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropping hot-plug subscription {}: {}", id, e);
                false
            }
        });
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        // deregister before the table and context go away
        self.registration.take();
        let handles: Vec<DeviceHandle> = self.devices.keys().copied().collect();
        for handle in handles {
            self.remove(handle);
        }
    }
}

/// Hot-plug notification queued from the libusb callback
enum Notice {
    Arrived(Device<Context>),
    Left(DeviceHandle),
}

/// Hot-plug callback handler
///
/// libusb invokes it from `handle_events` on the worker thread; the
/// notices are drained by [`DeviceManager::process_hotplug`].
struct HotplugCallback {
    notices: async_channel::Sender<Notice>,
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.notices.try_send(Notice::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.notices.try_send(Notice::Left(device_handle(&device)));
    }
}
