//! Connection-event relay
//!
//! Forwards transport hot-plug notifications to `connect`/`disconnect`
//! listeners, restricted to devices on the allow-list. The relay holds a
//! single transport registration while at least one listener of either
//! kind exists and releases it when the last one is removed.

use protocol::HotplugEvent;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::allow_list::Binding;
use crate::discovery::discover;
use crate::events::{UsbEvent, UsbEventKind};
use crate::transport::HotplugSubscription;
use crate::usb::UsbInner;

/// Subscription state, driven by live listener counts
#[derive(Debug, Default)]
pub(crate) struct Relay {
    counts: BTreeMap<UsbEventKind, usize>,
    pump: Option<JoinHandle<()>>,
    stop: Option<oneshot::Sender<()>>,
}

impl Relay {
    /// Whether listeners of this kind are registered
    pub(crate) fn is_subscribed(&self, kind: UsbEventKind) -> bool {
        self.counts.get(&kind).is_some_and(|&n| n > 0)
    }

    /// Whether a transport registration is held
    pub(crate) fn is_running(&self) -> bool {
        self.pump.as_ref().is_some_and(|p| !p.is_finished())
    }

    /// Apply the current listener count of a kind
    pub(crate) fn update(&mut self, kind: UsbEventKind, count: usize, usb: &Weak<UsbInner>) {
        self.counts.insert(kind, count);
        let wanted = self.counts.values().any(|&n| n > 0);

        if wanted && !self.is_running() {
            self.start(usb);
        } else if !wanted {
            self.stop();
        }
    }

    /// Register with the transport before returning, then pump in the background
    fn start(&mut self, usb: &Weak<UsbInner>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, connection events will not be delivered");
            return;
        };
        let Some(inner) = usb.upgrade() else {
            return;
        };
        let subscription = match inner.transport.watch_hotplug() {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!("Hot-plug registration failed: {}", e);
                return;
            }
        };
        debug!("Connection relay subscribed");

        let (stop, stopped) = oneshot::channel();
        self.stop = Some(stop);
        self.pump = Some(runtime.spawn(pump(usb.clone(), subscription, stopped)));
    }

    /// Ask the pump to exit once the event in hand is fully handled
    pub(crate) fn stop(&mut self) {
        if self.pump.take().is_some() {
            debug!("Stopping connection relay");
        }
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Receive hot-plug events until stopped or the session goes away
///
/// Stop requests are only honoured between events, so a device opened to
/// read its strings is always closed again.
async fn pump(
    usb: Weak<UsbInner>,
    subscription: HotplugSubscription,
    mut stopped: oneshot::Receiver<()>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = &mut stopped => break,
            event = subscription.recv() => event,
        };
        let Some(event) = event else {
            break;
        };
        let Some(inner) = usb.upgrade() else {
            break;
        };
        handle_event(&inner, event).await;
    }
    debug!("Connection relay finished");
}

/// Translate one hot-plug notification into at most one listener event
pub(crate) async fn handle_event(usb: &UsbInner, event: HotplugEvent) {
    match event {
        HotplugEvent::Attached(raw) => {
            let descriptor = &raw.descriptor;
            if !usb
                .allow_list()
                .may_match(descriptor.vendor_id, descriptor.product_id)
            {
                trace!("Ignoring attach of {}, no matching grant", raw.handle);
                return;
            }

            let device = Arc::new(discover(&usb.transport, &raw, &usb.options.discovery).await);
            if !device.connected() {
                trace!("{} went away during discovery", raw.handle);
                return;
            }
            let binding = usb.allow_list().bind_vacant(Arc::clone(&device));
            match binding {
                Binding::Bound => {
                    info!("Permitted device reconnected at {}", device.handle());
                    usb.events.emit(&UsbEvent::Connect(device));
                }
                Binding::Occupied => {
                    debug!("Ignoring attach of {}, grant held by a connected twin", raw.handle);
                }
                Binding::NotGranted => {
                    trace!("Ignoring attach of {}, identity not granted", raw.handle);
                }
            }
        }
        HotplugEvent::Detached(handle) => {
            let removed = usb.allow_list().remove_by_handle(handle);
            if let Some(device) = removed {
                info!("Permitted device {} disconnected", handle);
                usb.events.emit(&UsbEvent::Disconnect(device));
            }
        }
    }
}
