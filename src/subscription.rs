//! Subscriber fan-out
//!
//! A `HandlerRegistry` delivers every dispatched item to each registered
//! handler on that handler's own worker thread. Delivery to one handler is in
//! dispatch order; there is no ordering across handlers, and a slow or
//! panicking handler never delays the producer or the other handlers.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Opaque identity of a registered handler
pub type SubscriptionId = u64;

trait Detach: Send + Sync {
    fn detach(&self, id: SubscriptionId) -> bool;
}

struct Subscriber<T> {
    id: SubscriptionId,
    tx: Sender<T>,
}

struct Registry<T> {
    name: &'static str,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber<T>>>,
}

impl<T: Send + 'static> Detach for Registry<T> {
    fn detach(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        // Dropping the sender ends the worker thread once its backlog drains
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }
}

/// Fan-out point for one kind of notification
pub struct HandlerRegistry<T> {
    inner: Arc<Registry<T>>,
}

impl<T> Clone for HandlerRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> HandlerRegistry<T> {
    /// Create an empty registry; `name` labels worker threads and logs
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(Registry {
                name,
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a handler and return the handle that removes it
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded::<T>();
        // Never sent on; the worker drops its end once the backlog is handled
        let (done_tx, done_rx) = bounded::<()>(0);
        let name = self.inner.name;

        let spawned = thread::Builder::new()
            .name(format!("{}-handler-{}", name, id))
            .spawn(move || {
                let _done = done_tx;
                for item in rx.iter() {
                    if catch_unwind(AssertUnwindSafe(|| handler(item))).is_err() {
                        warn!("{} handler {} panicked; continuing", name, id);
                    }
                }
                debug!("{} handler {} stopped", name, id);
            });

        match spawned {
            Ok(_) => self.inner.subscribers.lock().push(Subscriber { id, tx }),
            Err(e) => warn!("Failed to start {} handler thread: {}", name, e),
        }

        let registry: Arc<dyn Detach> = self.inner.clone();
        Subscription {
            id,
            registry: Arc::downgrade(&registry),
            done: done_rx,
        }
    }

    /// Deliver `item` to every handler without waiting for any of them
    pub fn dispatch(&self, item: T) {
        let subscribers = self.inner.subscribers.lock();
        for subscriber in subscribers.iter() {
            let _ = subscriber.tx.send(item.clone());
        }
    }

    /// Remove a handler by id
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.detach(id)
    }

    pub fn len(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.subscribers.lock().is_empty()
    }

    /// Remove every handler
    pub fn clear(&self) {
        self.inner.subscribers.lock().clear();
    }
}

/// Handle returned by [`HandlerRegistry::subscribe`].
///
/// Dropping the handle leaves the handler registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Clone)]
pub struct Subscription {
    id: SubscriptionId,
    registry: Weak<dyn Detach>,
    done: Receiver<()>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove the handler; returns false if it was already removed
    pub fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.detach(self.id),
            None => false,
        }
    }

    /// Remove the handler, then block until it has handled every item
    /// dispatched before removal. Returns false if `timeout` passed first.
    pub fn unsubscribe_and_drain(self, timeout: Duration) -> bool {
        let done = self.done.clone();
        self.unsubscribe();
        match done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            _ => true,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn delivers_in_order_per_subscriber() {
        let registry = HandlerRegistry::<u32>::new("test");
        let (tx, rx) = crossbeam_channel::unbounded();
        let _sub = registry.subscribe(move |n| {
            let _ = tx.send(n);
        });

        for n in 0..50 {
            registry.dispatch(n);
        }

        let received: Vec<u32> = (0..50)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(received, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_handler_does_not_affect_others() {
        let registry = HandlerRegistry::<u32>::new("test");
        let _bad = registry.subscribe(|_| panic!("boom"));
        let (tx, rx) = crossbeam_channel::unbounded();
        let _good = registry.subscribe(move |n| {
            let _ = tx.send(n);
        });

        registry.dispatch(1);
        registry.dispatch(2);

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
    }

    #[test]
    fn unsubscribe_removes_only_that_handler() {
        let registry = HandlerRegistry::<u32>::new("test");
        let first = registry.subscribe(|_| {});
        let _second = registry.subscribe(|_| {});
        assert_eq!(registry.len(), 2);

        let again = first.clone();
        assert!(first.unsubscribe());
        assert!(!again.unsubscribe());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn drain_waits_for_backlog() {
        let registry = HandlerRegistry::<u32>::new("test");
        let handled = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&handled);
        let sub = registry.subscribe(move |_| {
            thread::sleep(Duration::from_millis(10));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for n in 0..20 {
            registry.dispatch(n);
        }

        assert!(sub.unsubscribe_and_drain(Duration::from_secs(5)));
        assert_eq!(handled.load(Ordering::SeqCst), 20);
        assert!(registry.is_empty());
    }
}
