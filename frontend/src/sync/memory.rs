//! In-memory stand-in for one browser origin.
//!
//! A [`MemoryHub`] holds named broadcast channels, window endpoints and a
//! single shared storage area. Every context built from the same hub can
//! reach the others, which is what the scenario tests and `timer-sim` need.
//! Failure knobs let tests break the primary channel or close a window.

use super::error::{StorageError, TransportError};
use super::storage::KeyValueStore;
use super::transport::{Transport, TransportKind};
use crate::dataflow::{drain_ready, relay, Relay};
use futures::channel::mpsc::UnboundedReceiver;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RefCell<BTreeMap<String, String>>,
    fail_writes: Cell<bool>,
}

impl MemoryStorage {
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Simulates a full quota: every `set` fails until switched back.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.set(fail);
    }
}

impl KeyValueStore for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if self.fail_writes.get() {
            return Err(StorageError::Write {
                key: key.to_string(),
                reason: "quota exceeded".to_string(),
            });
        }
        self.entries
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.borrow_mut().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries.borrow().keys().cloned().collect())
    }
}

struct ChannelEndpoint {
    id: u64,
    open: bool,
    inbox: Relay<String>,
}

struct WindowSlot {
    open: bool,
    inbox: Relay<String>,
}

#[derive(Default)]
struct HubInner {
    broadcast_unavailable: bool,
    next_endpoint: u64,
    channels: BTreeMap<String, Vec<ChannelEndpoint>>,
    windows: BTreeMap<String, WindowSlot>,
}

impl HubInner {
    fn endpoint_mut(&mut self, channel: &str, id: u64) -> Option<&mut ChannelEndpoint> {
        self.channels
            .get_mut(channel)?
            .iter_mut()
            .find(|endpoint| endpoint.id == id)
    }
}

#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Rc<RefCell<HubInner>>,
    storage: Rc<MemoryStorage>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn storage(&self) -> Rc<MemoryStorage> {
        self.storage.clone()
    }

    /// Like constructing a `BroadcastChannel`: fails when the host has none.
    pub fn open_broadcast(&self, name: &str) -> Result<MemoryBroadcast, TransportError> {
        let mut inner = self.inner.borrow_mut();
        if inner.broadcast_unavailable {
            return Err(TransportError::Unavailable(TransportKind::Broadcast));
        }
        let id = inner.next_endpoint;
        inner.next_endpoint += 1;
        let (inbox, receiver) = relay();
        inner
            .channels
            .entry(name.to_string())
            .or_default()
            .push(ChannelEndpoint {
                id,
                open: true,
                inbox,
            });
        Ok(MemoryBroadcast {
            hub: self.inner.clone(),
            name: name.to_string(),
            id,
            receiver,
        })
    }

    /// Toggle broadcast support for later opens and reopens.
    pub fn set_broadcast_available(&self, available: bool) {
        self.inner.borrow_mut().broadcast_unavailable = !available;
    }

    /// Close every endpoint on a channel, as if the channel errored.
    pub fn break_broadcast(&self, name: &str) {
        if let Some(endpoints) = self.inner.borrow_mut().channels.get_mut(name) {
            for endpoint in endpoints.iter_mut() {
                endpoint.open = false;
            }
        }
    }

    /// Register `own` as a window and return a handle that posts to `peer`.
    pub fn window_endpoint(&self, own: &str, peer: &str) -> MemoryWindow {
        let (inbox, receiver) = relay();
        self.inner
            .borrow_mut()
            .windows
            .insert(own.to_string(), WindowSlot { open: true, inbox });
        MemoryWindow {
            hub: self.inner.clone(),
            own: own.to_string(),
            peer: peer.to_string(),
            receiver,
        }
    }

    pub fn close_window(&self, name: &str) {
        if let Some(slot) = self.inner.borrow_mut().windows.get_mut(name) {
            slot.open = false;
        }
    }

    pub fn is_window_open(&self, name: &str) -> bool {
        self.inner
            .borrow()
            .windows
            .get(name)
            .is_some_and(|slot| slot.open)
    }
}

pub struct MemoryBroadcast {
    hub: Rc<RefCell<HubInner>>,
    name: String,
    id: u64,
    receiver: UnboundedReceiver<String>,
}

impl Transport for MemoryBroadcast {
    fn kind(&self) -> TransportKind {
        TransportKind::Broadcast
    }

    fn is_open(&self) -> bool {
        self.hub
            .borrow_mut()
            .endpoint_mut(&self.name, self.id)
            .is_some_and(|endpoint| endpoint.open)
    }

    fn publish(&mut self, raw: &str, _now_ms: i64) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed(TransportKind::Broadcast));
        }
        let inner = self.hub.borrow();
        if let Some(endpoints) = inner.channels.get(&self.name) {
            // A broadcast channel never delivers to the sending object.
            for endpoint in endpoints.iter().filter(|e| e.open && e.id != self.id) {
                endpoint.inbox.send(raw.to_string());
            }
        }
        Ok(())
    }

    /// Messages queued before the endpoint closed are still delivered.
    fn drain(&mut self, _now_ms: i64) -> Vec<String> {
        drain_ready(&mut self.receiver)
    }

    fn reopen(&mut self) -> Result<(), TransportError> {
        let mut inner = self.hub.borrow_mut();
        if inner.broadcast_unavailable {
            return Err(TransportError::Unavailable(TransportKind::Broadcast));
        }
        match inner.endpoint_mut(&self.name, self.id) {
            Some(endpoint) => {
                endpoint.open = true;
                Ok(())
            }
            None => Err(TransportError::Closed(TransportKind::Broadcast)),
        }
    }

    fn close(&mut self) {
        if let Some(endpoint) = self.hub.borrow_mut().endpoint_mut(&self.name, self.id) {
            endpoint.open = false;
        }
    }
}

/// Direct messaging to one held window handle.
pub struct MemoryWindow {
    hub: Rc<RefCell<HubInner>>,
    own: String,
    peer: String,
    receiver: UnboundedReceiver<String>,
}

impl MemoryWindow {
    fn slot_open(&self, name: &str) -> bool {
        self.hub
            .borrow()
            .windows
            .get(name)
            .is_some_and(|slot| slot.open)
    }
}

impl Transport for MemoryWindow {
    fn kind(&self) -> TransportKind {
        TransportKind::Window
    }

    /// The "is the handle closed" probe: false once either side is gone.
    fn is_open(&self) -> bool {
        self.slot_open(&self.own) && self.slot_open(&self.peer)
    }

    fn publish(&mut self, raw: &str, _now_ms: i64) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed(TransportKind::Window));
        }
        let inner = self.hub.borrow();
        match inner.windows.get(&self.peer) {
            Some(slot) => {
                slot.inbox.send(raw.to_string());
                Ok(())
            }
            None => Err(TransportError::Closed(TransportKind::Window)),
        }
    }

    fn drain(&mut self, _now_ms: i64) -> Vec<String> {
        drain_ready(&mut self.receiver)
    }

    fn close(&mut self) {
        if let Some(slot) = self.hub.borrow_mut().windows.get_mut(&self.own) {
            slot.open = false;
        }
    }
}
