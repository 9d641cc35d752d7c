//! In-memory transport for tests
//!
//! `MockTransport` keeps a table of simulated devices and records every
//! call made into it, so tests can assert both on outcomes and on which
//! transport calls a library operation issued (or did not issue).

use async_trait::async_trait;
use protocol::{
    BOS_DESCRIPTOR_TYPE, ControlTransferParameters, DeviceFilter, DeviceHandle, Direction,
    EndpointType, GET_URL_REQUEST, HotplugEvent, RawDevice, Recipient, RequestType,
    TransportError, pre_filter_admits,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{HotplugSubscription, Transport, TransportResult};

/// GET_DESCRIPTOR standard request
const GET_DESCRIPTOR: u8 = 0x06;

/// One recorded transport call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    /// Transport method name
    pub op: &'static str,
    /// Target device, if the call had one
    pub handle: Option<DeviceHandle>,
}

#[derive(Debug, Default)]
struct MockDevice {
    raw: Option<RawDevice>,
    strings: HashMap<u8, String>,
    bos: Option<Vec<u8>>,
    url_descriptor: Option<Vec<u8>>,
    in_results: VecDeque<TransportResult<Vec<u8>>>,
    iso_in_results: VecDeque<TransportResult<Vec<u8>>>,
    open_failures: VecDeque<TransportError>,
    opened: bool,
}

#[derive(Default)]
struct MockState {
    devices: BTreeMap<DeviceHandle, MockDevice>,
    calls: Vec<MockCall>,
    failures: HashMap<&'static str, VecDeque<TransportError>>,
    delays: HashMap<&'static str, Duration>,
    watchers: BTreeMap<u64, async_channel::Sender<HotplugEvent>>,
    watch_registrations: usize,
}

/// In-memory transport provider
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    next_watch_id: Arc<AtomicU64>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an attached device without raising a hot-plug event
    pub fn add_device(&self, raw: RawDevice) -> DeviceHandle {
        let handle = raw.handle;
        self.lock().devices.entry(handle).or_default().raw = Some(raw);
        handle
    }

    /// Set a string descriptor returned for `index`
    pub fn set_string(&self, handle: DeviceHandle, index: u8, value: &str) {
        self.lock()
            .devices
            .entry(handle)
            .or_default()
            .strings
            .insert(index, value.to_string());
    }

    /// Set manufacturer (1), product (2) and serial (3) strings
    pub fn set_device_strings(
        &self,
        handle: DeviceHandle,
        manufacturer: &str,
        product: &str,
        serial: &str,
    ) {
        self.set_string(handle, 1, manufacturer);
        self.set_string(handle, 2, product);
        self.set_string(handle, 3, serial);
    }

    /// Set the raw BOS descriptor
    pub fn set_bos(&self, handle: DeviceHandle, bos: Vec<u8>) {
        self.lock().devices.entry(handle).or_default().bos = Some(bos);
    }

    /// Set the reply to the WebUSB GET_URL request
    pub fn set_url_descriptor(&self, handle: DeviceHandle, descriptor: Vec<u8>) {
        self.lock().devices.entry(handle).or_default().url_descriptor = Some(descriptor);
    }

    /// Queue the outcome of the next IN transfer (control or data)
    pub fn push_in_result(&self, handle: DeviceHandle, result: TransportResult<Vec<u8>>) {
        self.lock()
            .devices
            .entry(handle)
            .or_default()
            .in_results
            .push_back(result);
    }

    /// Queue the outcome of the next isochronous IN packet
    pub fn push_iso_in_packet(&self, handle: DeviceHandle, result: TransportResult<Vec<u8>>) {
        self.lock()
            .devices
            .entry(handle)
            .or_default()
            .iso_in_results
            .push_back(result);
    }

    /// Make the next `times` open attempts fail with `error`
    pub fn fail_open(&self, handle: DeviceHandle, times: usize, error: TransportError) {
        let mut state = self.lock();
        let device = state.devices.entry(handle).or_default();
        device.open_failures.extend(std::iter::repeat_n(error, times));
    }

    /// Make the next call of transport method `op` fail with `error`
    pub fn fail_next(&self, op: &'static str, error: TransportError) {
        self.lock().failures.entry(op).or_default().push_back(error);
    }

    /// Stall every later `get_string_descriptor` or `control_transfer_in`
    /// call named by `op` for `delay`
    pub fn set_delay(&self, op: &'static str, delay: Duration) {
        self.lock().delays.insert(op, delay);
    }

    async fn pause(&self, op: &'static str) {
        let delay = self.lock().delays.get(op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Plug a device in and notify watchers
    pub fn attach(&self, raw: RawDevice) -> DeviceHandle {
        let handle = self.add_device(raw.clone());
        self.broadcast(HotplugEvent::Attached(raw));
        handle
    }

    /// Unplug a device and notify watchers
    pub fn detach(&self, handle: DeviceHandle) {
        self.lock().devices.remove(&handle);
        self.broadcast(HotplugEvent::Detached(handle));
    }

    fn broadcast(&self, event: HotplugEvent) {
        let watchers: Vec<_> = self.lock().watchers.values().cloned().collect();
        for sink in watchers {
            let _ = sink.try_send(event.clone());
        }
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Number of calls made so far
    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Number of calls made to transport method `op`
    pub fn call_count_of(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Hot-plug registrations currently alive
    pub fn active_watchers(&self) -> usize {
        self.lock().watchers.len()
    }

    /// Hot-plug registrations made over the transport's lifetime
    pub fn watch_registrations(&self) -> usize {
        self.lock().watch_registrations
    }

    /// Record a call and return any injected failure for it
    fn record(&self, op: &'static str, handle: Option<DeviceHandle>) -> TransportResult<()> {
        let mut state = self.lock();
        state.calls.push(MockCall { op, handle });
        if let Some(error) = state.failures.get_mut(op).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        if let Some(handle) = handle
            && !state.devices.get(&handle).is_some_and(|d| d.raw.is_some())
        {
            return Err(TransportError::NoDevice);
        }
        Ok(())
    }

    fn with_device<T>(
        &self,
        handle: DeviceHandle,
        f: impl FnOnce(&mut MockDevice) -> TransportResult<T>,
    ) -> TransportResult<T> {
        let mut state = self.lock();
        let device = state
            .devices
            .get_mut(&handle)
            .ok_or(TransportError::NoDevice)?;
        f(device)
    }

    fn simple(&self, op: &'static str, handle: DeviceHandle) -> TransportResult<()> {
        self.record(op, Some(handle))
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn enumerate(&self, pre_filter: &[DeviceFilter]) -> TransportResult<Vec<RawDevice>> {
        self.record("enumerate", None)?;
        let state = self.lock();
        Ok(state
            .devices
            .values()
            .filter_map(|d| d.raw.clone())
            .filter(|raw| {
                pre_filter_admits(
                    pre_filter,
                    raw.descriptor.vendor_id,
                    raw.descriptor.product_id,
                )
            })
            .collect())
    }

    fn is_connected(&self, handle: DeviceHandle) -> bool {
        self.lock()
            .devices
            .get(&handle)
            .is_some_and(|d| d.raw.is_some())
    }

    fn is_opened(&self, handle: DeviceHandle) -> bool {
        self.lock().devices.get(&handle).is_some_and(|d| d.opened)
    }

    async fn open(&self, handle: DeviceHandle) -> TransportResult<()> {
        self.record("open", Some(handle))?;
        self.with_device(handle, |device| {
            if let Some(error) = device.open_failures.pop_front() {
                return Err(error);
            }
            device.opened = true;
            Ok(())
        })
    }

    async fn close(&self, handle: DeviceHandle) -> TransportResult<()> {
        self.record("close", Some(handle))?;
        self.with_device(handle, |device| {
            device.opened = false;
            Ok(())
        })
    }

    async fn reset(&self, handle: DeviceHandle) -> TransportResult<()> {
        self.simple("reset", handle)
    }

    async fn set_configuration(&self, handle: DeviceHandle, _value: u8) -> TransportResult<()> {
        self.simple("set_configuration", handle)
    }

    async fn claim_interface(
        &self,
        handle: DeviceHandle,
        _interface_number: u8,
    ) -> TransportResult<()> {
        self.simple("claim_interface", handle)
    }

    async fn release_interface(
        &self,
        handle: DeviceHandle,
        _interface_number: u8,
    ) -> TransportResult<()> {
        self.simple("release_interface", handle)
    }

    async fn set_alternate_setting(
        &self,
        handle: DeviceHandle,
        _interface_number: u8,
        _alternate_setting: u8,
    ) -> TransportResult<()> {
        self.simple("set_alternate_setting", handle)
    }

    async fn clear_halt(
        &self,
        handle: DeviceHandle,
        _direction: Direction,
        _endpoint_number: u8,
    ) -> TransportResult<()> {
        self.simple("clear_halt", handle)
    }

    async fn control_transfer_in(
        &self,
        handle: DeviceHandle,
        setup: ControlTransferParameters,
        length: u16,
    ) -> TransportResult<Vec<u8>> {
        self.record("control_transfer_in", Some(handle))?;
        self.pause("control_transfer_in").await;
        self.with_device(handle, |device| {
            let is_bos_request = setup.request_type == RequestType::Standard
                && setup.recipient == Recipient::Device
                && setup.request == GET_DESCRIPTOR
                && (setup.value >> 8) as u8 == BOS_DESCRIPTOR_TYPE;
            let is_url_request =
                setup.request_type == RequestType::Vendor && setup.index == GET_URL_REQUEST;

            let reply = if is_bos_request {
                device.bos.clone().ok_or(TransportError::Pipe)?
            } else if is_url_request {
                device.url_descriptor.clone().ok_or(TransportError::Pipe)?
            } else {
                device
                    .in_results
                    .pop_front()
                    .unwrap_or_else(|| Ok(vec![0; length as usize]))?
            };
            Ok(reply.into_iter().take(length as usize).collect())
        })
    }

    async fn control_transfer_out(
        &self,
        handle: DeviceHandle,
        _setup: ControlTransferParameters,
        data: &[u8],
    ) -> TransportResult<usize> {
        self.record("control_transfer_out", Some(handle))?;
        Ok(data.len())
    }

    async fn get_string_descriptor(
        &self,
        handle: DeviceHandle,
        index: u8,
    ) -> TransportResult<String> {
        self.record("get_string_descriptor", Some(handle))?;
        self.pause("get_string_descriptor").await;
        self.with_device(handle, |device| {
            device
                .strings
                .get(&index)
                .cloned()
                .ok_or(TransportError::Pipe)
        })
    }

    async fn transfer_in(
        &self,
        handle: DeviceHandle,
        _endpoint_number: u8,
        _endpoint_type: EndpointType,
        length: usize,
    ) -> TransportResult<Vec<u8>> {
        self.record("transfer_in", Some(handle))?;
        self.with_device(handle, |device| {
            device
                .in_results
                .pop_front()
                .unwrap_or_else(|| Ok((0..length).map(|i| i as u8).collect()))
        })
    }

    async fn transfer_out(
        &self,
        handle: DeviceHandle,
        _endpoint_number: u8,
        _endpoint_type: EndpointType,
        data: &[u8],
    ) -> TransportResult<usize> {
        self.record("transfer_out", Some(handle))?;
        Ok(data.len())
    }

    async fn isochronous_transfer_in(
        &self,
        handle: DeviceHandle,
        _endpoint_number: u8,
        packet_lengths: &[usize],
    ) -> TransportResult<Vec<TransportResult<Vec<u8>>>> {
        self.record("isochronous_transfer_in", Some(handle))?;
        self.with_device(handle, |device| {
            Ok(packet_lengths
                .iter()
                .map(|&length| {
                    device
                        .iso_in_results
                        .pop_front()
                        .unwrap_or_else(|| Ok(vec![0xaa; length]))
                })
                .collect())
        })
    }

    async fn isochronous_transfer_out(
        &self,
        handle: DeviceHandle,
        _endpoint_number: u8,
        _data: &[u8],
        packet_lengths: &[usize],
    ) -> TransportResult<Vec<TransportResult<usize>>> {
        self.record("isochronous_transfer_out", Some(handle))?;
        Ok(packet_lengths.iter().map(|&length| Ok(length)).collect())
    }

    fn watch_hotplug(&self) -> TransportResult<HotplugSubscription> {
        self.record("watch_hotplug", None)?;
        let id = self.next_watch_id.fetch_add(1, Ordering::SeqCst);
        let (sink, events) = async_channel::unbounded();
        {
            let mut state = self.lock();
            state.watchers.insert(id, sink);
            state.watch_registrations += 1;
        }

        let state = Arc::downgrade(&self.state);
        Ok(HotplugSubscription::new(events, move || {
            if let Some(state) = state.upgrade() {
                state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .watchers
                    .remove(&id);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{create_mock_bos_descriptor, create_mock_raw_device};

    fn setup(value: u16) -> ControlTransferParameters {
        ControlTransferParameters {
            request_type: RequestType::Standard,
            recipient: Recipient::Device,
            request: GET_DESCRIPTOR,
            value,
            index: 0,
        }
    }

    #[tokio::test]
    async fn test_enumerate_with_pre_filter() {
        let mock = MockTransport::new();
        mock.add_device(create_mock_raw_device(1, 1, 0x1111, 0x0001));
        mock.add_device(create_mock_raw_device(1, 2, 0x2222, 0x0002));

        assert_eq!(mock.enumerate(&[]).await.unwrap().len(), 2);
        let only = mock
            .enumerate(&[DeviceFilter::vendor(0x2222)])
            .await
            .unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].handle, DeviceHandle::new(1, 2));
        assert_eq!(mock.call_count_of("enumerate"), 2);
    }

    #[tokio::test]
    async fn test_open_failures_and_state() {
        let mock = MockTransport::new();
        let handle = mock.add_device(create_mock_raw_device(1, 1, 0x1111, 0x0001));
        mock.fail_open(handle, 1, TransportError::Busy);

        assert_eq!(mock.open(handle).await, Err(TransportError::Busy));
        assert!(!mock.is_opened(handle));
        mock.open(handle).await.unwrap();
        assert!(mock.is_opened(handle));
        mock.close(handle).await.unwrap();
        assert!(!mock.is_opened(handle));
    }

    #[tokio::test]
    async fn test_bos_reads_are_truncated_to_length() {
        let mock = MockTransport::new();
        let handle = mock.add_device(create_mock_raw_device(1, 1, 0x1111, 0x0001));
        let bos = create_mock_bos_descriptor(1, 1);
        mock.set_bos(handle, bos.clone());

        let header = mock.control_transfer_in(handle, setup(0x0f00), 5).await.unwrap();
        assert_eq!(header, bos[..5].to_vec());
    }

    #[tokio::test]
    async fn test_injected_failure_and_missing_device() {
        let mock = MockTransport::new();
        let handle = mock.add_device(create_mock_raw_device(1, 1, 0x1111, 0x0001));
        mock.fail_next("reset", TransportError::Io);

        assert_eq!(mock.reset(handle).await, Err(TransportError::Io));
        assert!(mock.reset(handle).await.is_ok());

        mock.detach(handle);
        assert!(!mock.is_connected(handle));
        assert_eq!(mock.reset(handle).await, Err(TransportError::NoDevice));
    }

    #[tokio::test]
    async fn test_hotplug_registration_lifecycle() {
        let mock = MockTransport::new();
        let subscription = mock.watch_hotplug().unwrap();
        assert_eq!(mock.active_watchers(), 1);

        let raw = create_mock_raw_device(1, 5, 0x1111, 0x0001);
        mock.attach(raw.clone());
        assert_eq!(subscription.recv().await, Some(HotplugEvent::Attached(raw)));

        drop(subscription);
        assert_eq!(mock.active_watchers(), 0);
        assert_eq!(mock.watch_registrations(), 1);
    }
}
