//! Callback registry behind every `subscribe(listener) -> unsubscribe`.
//!
//! Contexts are single-threaded, so listeners are `Rc<dyn Fn>` and the
//! registry is a `RefCell`. Emission works on a copy of the slot list: a
//! listener may subscribe, unsubscribe or read state while being called.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

type Callback<T> = Rc<dyn Fn(&T)>;

struct Slots<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

pub struct Listeners<T: 'static> {
    slots: Rc<RefCell<Slots<T>>>,
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            slots: Rc::new(RefCell::new(Slots {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&T) + 'static) -> Subscription {
        let id = {
            let mut slots = self.slots.borrow_mut();
            let id = slots.next_id;
            slots.next_id += 1;
            slots.entries.push((id, Rc::new(listener)));
            id
        };

        let weak: Weak<RefCell<Slots<T>>> = Rc::downgrade(&self.slots);
        Subscription::new(move || {
            if let Some(slots) = weak.upgrade() {
                slots.borrow_mut().entries.retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    pub fn emit(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = self
            .slots
            .borrow()
            .entries
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(value);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.slots.borrow_mut().entries.clear();
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

/// Handle returned by `subscribe`. Dropping it unsubscribes; call
/// [`Subscription::detach`] to keep the listener for the registry's lifetime.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn emit_reaches_every_listener() {
        let listeners = Listeners::<u32>::new();
        let total = Rc::new(Cell::new(0));

        let first = {
            let total = total.clone();
            listeners.subscribe(move |value| total.set(total.get() + value))
        };
        let second = {
            let total = total.clone();
            listeners.subscribe(move |value| total.set(total.get() + value * 10))
        };

        listeners.emit(&2);
        assert_eq!(total.get(), 22);

        first.unsubscribe();
        listeners.emit(&1);
        assert_eq!(total.get(), 32);

        drop(second);
        assert!(listeners.is_empty());
    }

    #[test]
    fn detached_listener_survives_handle() {
        let listeners = Listeners::<()>::new();
        let calls = Rc::new(Cell::new(0));
        {
            let calls = calls.clone();
            listeners.subscribe(move |_| calls.set(calls.get() + 1)).detach();
        }
        listeners.emit(&());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn listener_may_unsubscribe_during_emit() {
        let listeners = Listeners::<()>::new();
        let slot: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));
        let calls = Rc::new(Cell::new(0));

        let subscription = {
            let slot = slot.clone();
            let calls = calls.clone();
            listeners.subscribe(move |_| {
                calls.set(calls.get() + 1);
                if let Some(own) = slot.borrow_mut().take() {
                    own.unsubscribe();
                }
            })
        };
        *slot.borrow_mut() = Some(subscription);

        listeners.emit(&());
        listeners.emit(&());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn subscription_outliving_registry_is_harmless() {
        let listeners = Listeners::<()>::new();
        let subscription = listeners.subscribe(|_| {});
        drop(listeners);
        subscription.unsubscribe();
    }
}
