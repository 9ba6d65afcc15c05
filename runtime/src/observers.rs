//! Ordered subscriber registries with isolated delivery
//!
//! Listeners are called synchronously, in subscription order. A listener
//! that panics is logged and skipped; the remaining listeners still run and
//! the registry stays usable.

use log::error;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Identifies one subscription within a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Listener<T> = Box<dyn FnMut(&T) + Send>;

pub struct Observers<T: ?Sized> {
    name: &'static str,
    next_id: u64,
    listeners: Vec<(SubscriptionId, Listener<T>)>,
}

impl<T: ?Sized> Observers<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: 1,
            listeners: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&T) + Send + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Returns false if the subscription was already gone
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    /// Delivers `value` to every listener, returning how many panicked
    pub fn notify(&mut self, value: &T) -> usize {
        let mut failures = 0;
        for (id, listener) in self.listeners.iter_mut() {
            if catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
                error!("{} listener {:?} panicked; continuing with the rest", self.name, id);
                failures += 1;
            }
        }
        failures
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }
}
