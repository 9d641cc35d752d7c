//! Connection-event relay tests
//!
//! # Test Scenarios
//! - Disconnect and reconnect of a permitted device
//! - Devices outside the allow-list never raise events
//! - Lazy hot-plug registration driven by listener counts
//! - Stopping the relay while an attach is being discovered
//! - Concurrent listener churn from several tasks
//!
//! Run with: `cargo test -p webusb --test relay_tests`

use common::test_utils::{DEFAULT_TEST_TIMEOUT, create_mock_raw_device, with_timeout};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use webusb::transport::mock::MockTransport;
use webusb::{
    DeviceFilter, DeviceHandle, RequestDeviceOptions, Transport, Usb, UsbEvent, UsbEventKind,
    UsbOptions,
};

type EventLog = Arc<Mutex<Vec<(UsbEventKind, DeviceHandle)>>>;

async fn wait_for(condition: impl Fn() -> bool) {
    with_timeout(DEFAULT_TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn record(usb: &Usb, kind: UsbEventKind, log: &EventLog) {
    let log = log.clone();
    usb.add_listener(kind, move |event: &UsbEvent| {
        log.lock().unwrap().push((kind, event.device().handle()));
    });
}

fn log_len(log: &EventLog) -> usize {
    log.lock().unwrap().len()
}

async fn granted_session() -> (MockTransport, Usb, DeviceHandle) {
    let mock = MockTransport::new();
    let handle = mock.add_device(create_mock_raw_device(1, 1, 0x0d28, 0x0204));
    let usb = Usb::new(Arc::new(mock.clone()), UsbOptions::default());
    usb.request_device(&RequestDeviceOptions::new(vec![DeviceFilter::vendor(0x0d28)]))
        .await
        .unwrap();
    (mock, usb, handle)
}

#[tokio::test]
async fn test_disconnect_then_reconnect() {
    let (mock, usb, handle) = granted_session().await;
    let log = EventLog::default();
    record(&usb, UsbEventKind::Connect, &log);
    record(&usb, UsbEventKind::Disconnect, &log);
    wait_for(|| mock.active_watchers() == 1).await;

    mock.detach(handle);
    wait_for(|| log_len(&log) == 1).await;
    assert_eq!(log.lock().unwrap()[0], (UsbEventKind::Disconnect, handle));
    assert!(usb.allowed_devices().is_empty());
    assert!(usb.get_devices().await.unwrap().is_empty());

    let new_handle = mock.attach(create_mock_raw_device(1, 9, 0x0d28, 0x0204));
    wait_for(|| log_len(&log) == 2).await;
    assert_eq!(log.lock().unwrap()[1], (UsbEventKind::Connect, new_handle));

    let allowed = usb.allowed_devices();
    assert_eq!(allowed.len(), 1);
    assert_eq!(allowed[0].handle(), new_handle);
    assert_eq!(usb.get_devices().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_devices_raise_no_events() {
    let (mock, usb, handle) = granted_session().await;
    let log = EventLog::default();
    record(&usb, UsbEventKind::Connect, &log);
    record(&usb, UsbEventKind::Disconnect, &log);
    wait_for(|| mock.active_watchers() == 1).await;

    // different vendor, then same IDs but a different serial number
    let stranger = mock.attach(create_mock_raw_device(2, 1, 0x1234, 0x0001));
    let lookalike = create_mock_raw_device(2, 2, 0x0d28, 0x0204);
    mock.set_string(lookalike.handle, 3, "OTHER");
    let lookalike = mock.attach(lookalike);
    wait_for(|| {
        mock.calls()
            .iter()
            .any(|c| c.op == "close" && c.handle == Some(lookalike))
    })
    .await;
    mock.detach(stranger);
    mock.detach(lookalike);

    // events are handled in order; this one marks the end
    mock.detach(handle);
    wait_for(|| log_len(&log) == 1).await;
    assert_eq!(
        *log.lock().unwrap(),
        vec![(UsbEventKind::Disconnect, handle)]
    );
}

#[tokio::test]
async fn test_registration_follows_listener_count() {
    let (mock, usb, _handle) = granted_session().await;
    assert!(!usb.is_relay_active());
    assert_eq!(mock.watch_registrations(), 0);

    let connect = usb.on_connect(|_| {});
    let disconnect = usb.on_disconnect(|_| {});
    assert!(usb.is_subscribed(UsbEventKind::Connect));
    assert!(usb.is_subscribed(UsbEventKind::Disconnect));
    wait_for(|| mock.active_watchers() == 1).await;
    assert_eq!(mock.watch_registrations(), 1);

    assert!(usb.remove_listener(UsbEventKind::Connect, connect));
    assert!(!usb.is_subscribed(UsbEventKind::Connect));
    assert!(usb.is_relay_active());

    assert!(usb.remove_listener(UsbEventKind::Disconnect, disconnect));
    assert!(!usb.is_relay_active());
    wait_for(|| mock.active_watchers() == 0).await;

    usb.on_disconnect(|_| {});
    wait_for(|| mock.active_watchers() == 1).await;
    assert_eq!(mock.watch_registrations(), 2);
}

#[tokio::test]
async fn test_listener_churn_settles() {
    let (mock, usb, handle) = granted_session().await;

    for _ in 0..10 {
        let id = usb.on_disconnect(|_| {});
        usb.remove_listener(UsbEventKind::Disconnect, id);
    }
    assert!(!usb.is_relay_active());

    let log = EventLog::default();
    record(&usb, UsbEventKind::Disconnect, &log);
    wait_for(|| mock.active_watchers() == 1).await;

    mock.detach(handle);
    wait_for(|| log_len(&log) == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(log_len(&log), 1);
}

#[tokio::test]
async fn test_dropping_session_releases_registration() {
    let (mock, usb, _handle) = granted_session().await;
    usb.on_connect(|_| {});
    wait_for(|| mock.active_watchers() == 1).await;

    drop(usb);
    wait_for(|| mock.active_watchers() == 0).await;
}

#[tokio::test]
async fn test_events_right_after_first_listener_are_delivered() {
    let (mock, usb, handle) = granted_session().await;
    let log = EventLog::default();
    record(&usb, UsbEventKind::Disconnect, &log);

    // no wait for the relay task to get going
    mock.detach(handle);
    wait_for(|| log_len(&log) == 1).await;
    assert_eq!(log.lock().unwrap()[0], (UsbEventKind::Disconnect, handle));
}

#[tokio::test]
async fn test_stop_during_discovery_closes_device() {
    let (mock, usb, _handle) = granted_session().await;
    let id = usb.on_connect(|_| {});
    assert_eq!(mock.active_watchers(), 1);

    mock.set_delay("get_string_descriptor", Duration::from_millis(50));
    mock.clear_calls();
    let twin = mock.attach(create_mock_raw_device(1, 2, 0x0d28, 0x0204));
    wait_for(|| mock.call_count_of("get_string_descriptor") > 0).await;
    assert!(mock.is_opened(twin));

    assert!(usb.remove_listener(UsbEventKind::Connect, id));
    assert!(!usb.is_relay_active());
    wait_for(|| mock.active_watchers() == 0).await;

    assert!(!mock.is_opened(twin));
    assert_eq!(mock.call_count_of("open"), mock.call_count_of("close"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_listener_churn() {
    let (mock, usb, _handle) = granted_session().await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let usb = usb.clone();
        let kind = if i % 2 == 0 {
            UsbEventKind::Connect
        } else {
            UsbEventKind::Disconnect
        };
        tasks.push(tokio::spawn(async move {
            for _ in 0..50 {
                let id = usb.add_listener(kind, |_| {});
                tokio::task::yield_now().await;
                usb.remove_listener(kind, id);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(!usb.is_subscribed(UsbEventKind::Connect));
    assert!(!usb.is_subscribed(UsbEventKind::Disconnect));
    assert!(!usb.is_relay_active());
    wait_for(|| mock.active_watchers() == 0).await;

    // one listener left behind keeps exactly one registration
    usb.on_disconnect(|_| {});
    assert!(usb.is_relay_active());
    wait_for(|| mock.active_watchers() == 1).await;
}
