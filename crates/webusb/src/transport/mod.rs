//! Transport provider contract
//!
//! A transport owns the physical side: enumeration, live device handles,
//! raw transfers and hot-plug notifications. The WebUSB core only ever
//! refers to devices through their [`DeviceHandle`] and calls into the
//! transport after its own sequencing checks pass.

pub mod mock;

use async_trait::async_trait;
use protocol::{
    ControlTransferParameters, DeviceFilter, DeviceHandle, Direction, EndpointType, HotplugEvent,
    RawDevice, TransportError,
};

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// USB transport provider
///
/// Implementations serialize physical bus access as they see fit. The core
/// issues at most one descriptor request per handle at a time.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Enumerate attached devices
    ///
    /// Devices whose vendor/product IDs match no pre-filter entry may be
    /// skipped; an empty pre-filter admits everything.
    async fn enumerate(&self, pre_filter: &[DeviceFilter]) -> TransportResult<Vec<RawDevice>>;

    /// Whether the device is still attached
    fn is_connected(&self, handle: DeviceHandle) -> bool;

    /// Whether the transport holds an open handle for the device
    fn is_opened(&self, handle: DeviceHandle) -> bool;

    async fn open(&self, handle: DeviceHandle) -> TransportResult<()>;

    async fn close(&self, handle: DeviceHandle) -> TransportResult<()>;

    async fn reset(&self, handle: DeviceHandle) -> TransportResult<()>;

    async fn set_configuration(&self, handle: DeviceHandle, value: u8) -> TransportResult<()>;

    async fn claim_interface(&self, handle: DeviceHandle, interface_number: u8)
    -> TransportResult<()>;

    async fn release_interface(
        &self,
        handle: DeviceHandle,
        interface_number: u8,
    ) -> TransportResult<()>;

    async fn set_alternate_setting(
        &self,
        handle: DeviceHandle,
        interface_number: u8,
        alternate_setting: u8,
    ) -> TransportResult<()>;

    async fn clear_halt(
        &self,
        handle: DeviceHandle,
        direction: Direction,
        endpoint_number: u8,
    ) -> TransportResult<()>;

    async fn control_transfer_in(
        &self,
        handle: DeviceHandle,
        setup: ControlTransferParameters,
        length: u16,
    ) -> TransportResult<Vec<u8>>;

    async fn control_transfer_out(
        &self,
        handle: DeviceHandle,
        setup: ControlTransferParameters,
        data: &[u8],
    ) -> TransportResult<usize>;

    /// Read a string descriptor in the device's first language
    async fn get_string_descriptor(&self, handle: DeviceHandle, index: u8)
    -> TransportResult<String>;

    async fn transfer_in(
        &self,
        handle: DeviceHandle,
        endpoint_number: u8,
        endpoint_type: EndpointType,
        length: usize,
    ) -> TransportResult<Vec<u8>>;

    async fn transfer_out(
        &self,
        handle: DeviceHandle,
        endpoint_number: u8,
        endpoint_type: EndpointType,
        data: &[u8],
    ) -> TransportResult<usize>;

    /// Isochronous IN transfer, one outcome per requested packet
    async fn isochronous_transfer_in(
        &self,
        handle: DeviceHandle,
        endpoint_number: u8,
        packet_lengths: &[usize],
    ) -> TransportResult<Vec<TransportResult<Vec<u8>>>>;

    /// Isochronous OUT transfer, one outcome per packet
    ///
    /// `data` is split according to `packet_lengths`.
    async fn isochronous_transfer_out(
        &self,
        handle: DeviceHandle,
        endpoint_number: u8,
        data: &[u8],
        packet_lengths: &[usize],
    ) -> TransportResult<Vec<TransportResult<usize>>>;

    /// Register for hot-plug notifications
    ///
    /// Synchronous so that every event after the call returns is delivered.
    /// The registration lasts until the returned subscription is dropped.
    fn watch_hotplug(&self) -> TransportResult<HotplugSubscription>;
}

/// Live hot-plug registration with a transport
pub struct HotplugSubscription {
    events: async_channel::Receiver<HotplugEvent>,
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl HotplugSubscription {
    /// Wrap an event stream; `on_drop` releases the transport-side registration
    pub fn new(
        events: async_channel::Receiver<HotplugEvent>,
        on_drop: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            events,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// Next event, or `None` once the transport has stopped sending
    pub async fn recv(&self) -> Option<HotplugEvent> {
        self.events.recv().await.ok()
    }
}

impl Drop for HotplugSubscription {
    fn drop(&mut self) {
        if let Some(release) = self.on_drop.take() {
            release();
        }
    }
}

impl std::fmt::Debug for HotplugSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotplugSubscription")
            .field("pending", &self.events.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_subscription_release_on_drop() {
        let (tx, rx) = async_channel::unbounded();
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();

        let subscription = HotplugSubscription::new(rx, move || flag.store(true, Ordering::SeqCst));
        tx.send(HotplugEvent::Detached(DeviceHandle::new(1, 1)))
            .await
            .unwrap();
        assert_eq!(
            subscription.recv().await,
            Some(HotplugEvent::Detached(DeviceHandle::new(1, 1)))
        );

        drop(tx);
        assert_eq!(subscription.recv().await, None);
        assert!(!released.load(Ordering::SeqCst));

        drop(subscription);
        assert!(released.load(Ordering::SeqCst));
    }
}
