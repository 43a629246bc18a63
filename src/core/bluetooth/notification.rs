//! Event notification for scan results and connection-state changes
//! Subscribers are called synchronously, in registration order. A panicking
//! subscriber is logged and skipped; the others still receive the event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::error;

use crate::core::bluetooth::types::{BluetoothDevice, ConnectionStateChange};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback<E>)>>,
}

/// Observer list for one kind of event
pub struct Subscribers<E> {
    registry: Arc<Registry<E>>,
}

impl<E> Clone for Subscribers<E> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<E: 'static> Default for Subscribers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> Subscribers<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(0),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut callbacks) = self.registry.callbacks.lock() {
            callbacks.push((id, Arc::new(callback)));
        }

        let registry: Weak<Registry<E>> = Arc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                if let Ok(mut callbacks) = registry.callbacks.lock() {
                    callbacks.retain(|(existing, _)| *existing != id);
                }
            }
        })
    }

    /// Delivers `event` to every current subscriber.
    pub fn emit(&self, event: &E) {
        // Snapshot first so callbacks may (un)subscribe without deadlocking.
        let callbacks: Vec<Callback<E>> = match self.registry.callbacks.lock() {
            Ok(callbacks) => callbacks.iter().map(|(_, cb)| cb.clone()).collect(),
            Err(_) => return,
        };

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!("Event subscriber panicked; continuing with the remaining subscribers");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.registry
            .callbacks
            .lock()
            .map(|callbacks| callbacks.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by `subscribe`. `unsubscribe` may be called any number
/// of times; only the first call has an effect.
pub struct Subscription {
    done: AtomicBool,
    cancel: Box<dyn Fn() + Send + Sync>,
}

impl Subscription {
    fn new<F>(cancel: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            done: AtomicBool::new(false),
            cancel: Box::new(cancel),
        }
    }

    pub fn unsubscribe(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            (self.cancel)();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("done", &self.done.load(Ordering::Relaxed))
            .finish()
    }
}

/// Both event channels the control layer emits on
#[derive(Clone, Default)]
pub struct NotificationHub {
    pub scan_results: Subscribers<BluetoothDevice>,
    pub connection_changes: Subscribers<ConnectionStateChange>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_scan_result<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&BluetoothDevice) + Send + Sync + 'static,
    {
        self.scan_results.subscribe(callback)
    }

    pub fn on_connection_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConnectionStateChange) + Send + Sync + 'static,
    {
        self.connection_changes.subscribe(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_registration_order() {
        let subscribers = Subscribers::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _a = {
            let seen = seen.clone();
            subscribers.subscribe(move |v| seen.lock().unwrap().push(("a", *v)))
        };
        let _b = {
            let seen = seen.clone();
            subscribers.subscribe(move |v| seen.lock().unwrap().push(("b", *v)))
        };

        subscribers.emit(&7);
        assert_eq!(*seen.lock().unwrap(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let subscribers = Subscribers::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _bad = subscribers.subscribe(|_| panic!("subscriber bug"));
        let _good = {
            let seen = seen.clone();
            subscribers.subscribe(move |v| seen.lock().unwrap().push(*v))
        };

        subscribers.emit(&1);
        subscribers.emit(&2);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let subscribers = Subscribers::<u32>::new();
        let first = subscribers.subscribe(|_| {});
        let _second = subscribers.subscribe(|_| {});
        assert_eq!(subscribers.len(), 2);

        first.unsubscribe();
        first.unsubscribe();
        assert_eq!(subscribers.len(), 1);
    }

    #[test]
    fn unsubscribe_from_inside_callback() {
        let subscribers = Subscribers::<u32>::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicU64::new(0));

        let subscription = {
            let slot = slot.clone();
            let count = count.clone();
            subscribers.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                if let Some(sub) = slot.lock().unwrap().as_ref() {
                    sub.unsubscribe();
                }
            })
        };
        *slot.lock().unwrap() = Some(subscription);

        subscribers.emit(&1);
        subscribers.emit(&2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(subscribers.is_empty());
    }
}
