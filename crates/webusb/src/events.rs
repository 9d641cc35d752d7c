//! Typed event dispatch
//!
//! A dispatcher keeps one listener list per event kind. An optional
//! observer is told the live listener count of a kind every time it
//! changes, which is how the connection relay subscribes to the transport
//! lazily.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

use crate::device::UsbDevice;

/// An event with a kind used for listener registration
pub trait Event: Send + Sync {
    type Kind: Copy + Eq + Hash + fmt::Debug + Send + Sync;

    fn kind(&self) -> Self::Kind;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;
type Observer<K> = Box<dyn Fn(K, usize) + Send + Sync>;

pub struct EventDispatcher<E: Event> {
    listeners: Mutex<HashMap<E::Kind, Vec<(ListenerId, Listener<E>)>>>,
    next_id: AtomicU64,
    observer: Option<Observer<E::Kind>>,
}

impl<E: Event> Default for EventDispatcher<E> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            observer: None,
        }
    }
}

impl<E: Event> fmt::Debug for EventDispatcher<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<E::Kind, usize> =
            self.lock().iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("EventDispatcher")
            .field("listeners", &counts)
            .finish()
    }
}

impl<E: Event> EventDispatcher<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher reporting listener count changes to `observer`
    ///
    /// The observer runs after the listener table lock is released.
    pub fn with_observer(observer: impl Fn(E::Kind, usize) + Send + Sync + 'static) -> Self {
        Self {
            observer: Some(Box::new(observer)),
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<E::Kind, Vec<(ListenerId, Listener<E>)>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, kind: E::Kind, count: usize) {
        trace!("{:?} listeners: {}", kind, count);
        if let Some(observer) = &self.observer {
            observer(kind, count);
        }
    }

    pub fn add_listener(
        &self,
        kind: E::Kind,
        listener: impl Fn(&E) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let count = {
            let mut listeners = self.lock();
            let list = listeners.entry(kind).or_default();
            list.push((id, Arc::new(listener)));
            list.len()
        };
        self.notify(kind, count);
        id
    }

    /// Remove a listener; returns `false` if it was not registered
    pub fn remove_listener(&self, kind: E::Kind, id: ListenerId) -> bool {
        let count = {
            let mut listeners = self.lock();
            let Some(list) = listeners.get_mut(&kind) else {
                return false;
            };
            let before = list.len();
            list.retain(|(listener_id, _)| *listener_id != id);
            if list.len() == before {
                return false;
            }
            list.len()
        };
        self.notify(kind, count);
        true
    }

    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver an event to every listener of its kind, in registration order
    pub fn emit(&self, event: &E) {
        let listeners: Vec<Listener<E>> = self
            .lock()
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();
        for listener in listeners {
            listener(event);
        }
    }
}

/// Connection event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UsbEventKind {
    Connect,
    Disconnect,
}

/// A permitted device was plugged in or unplugged
#[derive(Debug, Clone)]
pub enum UsbEvent {
    Connect(Arc<UsbDevice>),
    Disconnect(Arc<UsbDevice>),
}

impl UsbEvent {
    pub fn device(&self) -> &Arc<UsbDevice> {
        match self {
            UsbEvent::Connect(device) | UsbEvent::Disconnect(device) => device,
        }
    }
}

impl Event for UsbEvent {
    type Kind = UsbEventKind;

    fn kind(&self) -> UsbEventKind {
        match self {
            UsbEvent::Connect(_) => UsbEventKind::Connect,
            UsbEvent::Disconnect(_) => UsbEventKind::Disconnect,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        Ping,
        Pong,
    }

    struct Message(Kind, u32);

    impl Event for Message {
        type Kind = Kind;

        fn kind(&self) -> Kind {
            self.0
        }
    }

    #[test]
    fn test_emit_by_kind() {
        let dispatcher = EventDispatcher::<Message>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let ping = dispatcher.add_listener(Kind::Ping, move |m| sink.lock().unwrap().push(m.1));
        let sink = seen.clone();
        dispatcher.add_listener(Kind::Pong, move |m| sink.lock().unwrap().push(m.1 * 10));

        dispatcher.emit(&Message(Kind::Ping, 1));
        dispatcher.emit(&Message(Kind::Pong, 2));
        assert_eq!(*seen.lock().unwrap(), vec![1, 20]);

        assert!(dispatcher.remove_listener(Kind::Ping, ping));
        assert!(!dispatcher.remove_listener(Kind::Ping, ping));
        dispatcher.emit(&Message(Kind::Ping, 3));
        assert_eq!(*seen.lock().unwrap(), vec![1, 20]);
    }

    #[test]
    fn test_observer_sees_counts() {
        let counts = Arc::new(Mutex::new(Vec::new()));
        let sink = counts.clone();
        let dispatcher = EventDispatcher::<Message>::with_observer(move |kind, count| {
            sink.lock().unwrap().push((kind, count));
        });

        let a = dispatcher.add_listener(Kind::Ping, |_| {});
        let b = dispatcher.add_listener(Kind::Ping, |_| {});
        dispatcher.remove_listener(Kind::Ping, a);
        // unknown id leaves the count alone
        dispatcher.remove_listener(Kind::Pong, b);
        dispatcher.remove_listener(Kind::Ping, b);

        assert_eq!(
            *counts.lock().unwrap(),
            vec![(Kind::Ping, 1), (Kind::Ping, 2), (Kind::Ping, 1), (Kind::Ping, 0)]
        );
        assert_eq!(dispatcher.listener_count(Kind::Ping), 0);
    }

    #[test]
    fn test_listener_may_reenter_dispatcher() {
        let dispatcher = Arc::new(EventDispatcher::<Message>::new());
        let inner = Arc::downgrade(&dispatcher);
        dispatcher.add_listener(Kind::Ping, move |_| {
            if let Some(d) = inner.upgrade() {
                d.add_listener(Kind::Pong, |_| {});
            }
        });

        dispatcher.emit(&Message(Kind::Ping, 0));
        assert_eq!(dispatcher.listener_count(Kind::Pong), 1);
    }
}
