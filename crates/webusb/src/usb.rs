//! Session and permission gate
//!
//! [`Usb`] is the entry point of the library. It enumerates devices through
//! a [`Transport`], lets a caller request access to devices matching a set
//! of filters, remembers the granted devices and raises `connect` /
//! `disconnect` events for them.

use async_trait::async_trait;
use protocol::{DeviceFilter, RawDevice};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info};

use crate::allow_list::{AllowList, Binding};
use crate::config::UsbConfig;
use crate::device::UsbDevice;
use crate::discovery::{DiscoveryOptions, discover};
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, ListenerId, UsbEvent, UsbEventKind};
use crate::filter::{matches_any, validate_filters};
use crate::relay::Relay;
use crate::transport::Transport;

const GET_DEVICES: &str = "get_devices";
const REQUEST_DEVICE: &str = "request_device";

/// Picks one device out of the candidates offered by `request_device`
///
/// Returning `None` cancels the request.
#[async_trait]
pub trait DeviceSelector: Send + Sync {
    async fn select(&self, candidates: Vec<Arc<UsbDevice>>) -> Option<Arc<UsbDevice>>;
}

#[async_trait]
impl<F> DeviceSelector for F
where
    F: Fn(Vec<Arc<UsbDevice>>) -> Option<Arc<UsbDevice>> + Send + Sync,
{
    async fn select(&self, candidates: Vec<Arc<UsbDevice>>) -> Option<Arc<UsbDevice>> {
        self(candidates)
    }
}

#[derive(Clone, Default)]
pub struct UsbOptions {
    pub discovery: DiscoveryOptions,
    /// Device chooser; without one the first matching device is picked
    pub devices_found: Option<Arc<dyn DeviceSelector>>,
}

impl UsbOptions {
    pub fn from_config(config: &UsbConfig) -> Self {
        Self {
            discovery: config.discovery_options(),
            devices_found: None,
        }
    }

    pub fn with_selector(mut self, selector: impl DeviceSelector + 'static) -> Self {
        self.devices_found = Some(Arc::new(selector));
        self
    }
}

impl fmt::Debug for UsbOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbOptions")
            .field("discovery", &self.discovery)
            .field("devices_found", &self.devices_found.is_some())
            .finish()
    }
}

/// Argument of [`Usb::request_device`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDeviceOptions {
    #[serde(default)]
    pub filters: Vec<DeviceFilter>,
}

impl RequestDeviceOptions {
    pub fn new(filters: Vec<DeviceFilter>) -> Self {
        Self { filters }
    }
}

pub(crate) struct UsbInner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) options: UsbOptions,
    allow_list: Mutex<AllowList>,
    pub(crate) events: EventDispatcher<UsbEvent>,
    relay: Mutex<Relay>,
    this: Weak<UsbInner>,
}

impl UsbInner {
    pub(crate) fn allow_list(&self) -> MutexGuard<'_, AllowList> {
        self.allow_list.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn relay(&self) -> MutexGuard<'_, Relay> {
        self.relay.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-read the count under the relay lock; concurrent add/remove calls
    /// may report their counts out of order
    fn listeners_changed(&self, kind: UsbEventKind) {
        let mut relay = self.relay();
        let count = self.events.listener_count(kind);
        relay.update(kind, count, &self.this);
    }
}

/// WebUSB session
#[derive(Clone)]
pub struct Usb {
    inner: Arc<UsbInner>,
}

impl fmt::Debug for Usb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Usb")
            .field("options", &self.inner.options)
            .field("allowed", &self.inner.allow_list().len())
            .field("events", &self.inner.events)
            .finish()
    }
}

impl Usb {
    pub fn new(transport: Arc<dyn Transport>, options: UsbOptions) -> Self {
        let inner = Arc::new_cyclic(|this: &Weak<UsbInner>| {
            let observer = this.clone();
            UsbInner {
                transport,
                options,
                allow_list: Mutex::new(AllowList::new()),
                events: EventDispatcher::with_observer(move |kind, _count| {
                    if let Some(inner) = observer.upgrade() {
                        inner.listeners_changed(kind);
                    }
                }),
                relay: Mutex::new(Relay::default()),
                this: this.clone(),
            }
        });
        Self { inner }
    }

    /// Devices the caller was granted access to that are still connected
    ///
    /// Re-enumerates only the vendor/product pairs found on the allow-list.
    pub async fn get_devices(&self) -> Result<Vec<Arc<UsbDevice>>> {
        let pre_filter = self.inner.allow_list().pre_filter();
        if pre_filter.is_empty() {
            debug!("No devices granted");
            return Ok(Vec::new());
        }

        let raw_devices = self
            .inner
            .transport
            .enumerate(&pre_filter)
            .await
            .map_err(Error::transport(GET_DEVICES))?;

        let mut devices = Vec::new();
        for raw in raw_devices {
            let device = self.resolve(&raw).await;
            let binding = self.inner.allow_list().bind_vacant(Arc::clone(&device));
            if binding != Binding::NotGranted && device.connected() {
                devices.push(device);
            }
        }

        let pruned = self.inner.allow_list().prune_disconnected();
        if pruned > 0 {
            debug!("Unbound {} disconnected device(s)", pruned);
        }
        debug!("{} permitted device(s) connected", devices.len());
        Ok(devices)
    }

    /// Ask for access to one device matching any of the filters
    pub async fn request_device(&self, options: &RequestDeviceOptions) -> Result<Arc<UsbDevice>> {
        validate_filters(REQUEST_DEVICE, &options.filters)?;

        let raw_devices = self
            .inner
            .transport
            .enumerate(&[])
            .await
            .map_err(Error::transport(REQUEST_DEVICE))?;

        let mut candidates = Vec::new();
        for raw in raw_devices {
            let device = self.resolve(&raw).await;
            if matches_any(&options.filters, device.info()) {
                candidates.push(device);
            }
        }
        if candidates.is_empty() {
            return Err(Error::not_found(REQUEST_DEVICE, "no devices found"));
        }
        debug!("{} candidate device(s) match", candidates.len());

        let chosen = match &self.inner.options.devices_found {
            Some(selector) => selector
                .select(candidates)
                .await
                .ok_or_else(|| Error::not_found(REQUEST_DEVICE, "no device selected"))?,
            None => candidates.swap_remove(0),
        };

        info!(
            "Access granted to {:04x}:{:04x} at {}",
            chosen.vendor_id(),
            chosen.product_id(),
            chosen.handle()
        );
        self.inner.allow_list().grant(Arc::clone(&chosen));
        Ok(chosen)
    }

    /// Live devices currently bound to a grant
    pub fn allowed_devices(&self) -> Vec<Arc<UsbDevice>> {
        self.inner.allow_list().devices()
    }

    /// Register a `connect` or `disconnect` listener
    ///
    /// The first listener registers with the transport before this returns,
    /// so no later hot-plug event is missed.
    pub fn add_listener(
        &self,
        kind: UsbEventKind,
        listener: impl Fn(&UsbEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.events.add_listener(kind, listener)
    }

    pub fn remove_listener(&self, kind: UsbEventKind, id: ListenerId) -> bool {
        self.inner.events.remove_listener(kind, id)
    }

    pub fn on_connect(
        &self,
        listener: impl Fn(&Arc<UsbDevice>) + Send + Sync + 'static,
    ) -> ListenerId {
        self.add_listener(UsbEventKind::Connect, move |event| listener(event.device()))
    }

    pub fn on_disconnect(
        &self,
        listener: impl Fn(&Arc<UsbDevice>) + Send + Sync + 'static,
    ) -> ListenerId {
        self.add_listener(UsbEventKind::Disconnect, move |event| listener(event.device()))
    }

    /// Whether listeners of this kind are registered
    pub fn is_subscribed(&self, kind: UsbEventKind) -> bool {
        self.inner.relay().is_subscribed(kind)
    }

    /// Whether a hot-plug registration with the transport is held
    pub fn is_relay_active(&self) -> bool {
        self.inner.relay().is_running()
    }

    /// Reuse the bound device for a handle, or discover it afresh
    async fn resolve(&self, raw: &RawDevice) -> Arc<UsbDevice> {
        let existing = self.inner.allow_list().find_by_handle(raw.handle);
        match existing {
            Some(device) => device,
            None => {
                let options = self.inner.options.discovery.with_retries(0);
                Arc::new(discover(&self.inner.transport, raw, &options).await)
            }
        }
    }
}
