//! Process-local publish/subscribe.
//!
//! Topic-keyed handler lists with `on`/`once`/`off` and disposable
//! [`Subscription`] handles. Dispatch is synchronous: handlers run on the
//! emitting task, in registration order, outside the registry lock so they
//! may re-enter the bus. Handler panics are isolated and logged — a
//! misbehaving callback cannot take down the dispatch loop.
//!
//! The transport uses the bus with [`crate::codec::Value`] payloads; the
//! beacon reuses it with `serde_json::Value` payloads.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    id: u64,
    handler: Handler<T>,
    once: bool,
}

struct BusInner<T> {
    topics: Mutex<HashMap<String, Vec<Entry<T>>>>,
    next_id: AtomicU64,
}

/// Topic-keyed event bus.
///
/// Cloning is cheap and shares the registry.
pub struct EventBus<T> {
    inner: Arc<BusInner<T>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl<T> EventBus<T> {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a handler for every emission on `topic`.
    ///
    /// The returned subscription detaches the handler on dispose or drop.
    pub fn on<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
        T: 'static,
    {
        self.register(topic, Arc::new(handler), false)
    }

    /// Register a handler that fires at most once, then detaches itself.
    pub fn once<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
        T: 'static,
    {
        self.register(topic, Arc::new(handler), true)
    }

    /// Remove every handler registered on `topic`.
    ///
    /// Outstanding [`Subscription`] handles for the topic become no-ops.
    pub fn off(&self, topic: &str) {
        self.inner.topics.lock().expect("bus lock poisoned").remove(topic);
    }

    /// Emit `payload` to every handler registered on `topic`.
    ///
    /// `once` handlers are detached before their callback runs, so a
    /// handler re-emitting the same topic cannot fire itself twice.
    pub fn emit(&self, topic: &str, payload: &T) {
        let handlers: Vec<Handler<T>> = {
            let mut topics = self.inner.topics.lock().expect("bus lock poisoned");
            let Some(entries) = topics.get_mut(topic) else {
                return;
            };
            let snapshot = entries.iter().map(|e| Arc::clone(&e.handler)).collect();
            entries.retain(|e| !e.once);
            if entries.is_empty() {
                topics.remove(topic);
            }
            snapshot
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                log::warn!("event handler for '{topic}' panicked; detaching is up to the owner");
            }
        }
    }

    /// Number of handlers currently registered on `topic`.
    #[must_use]
    pub fn handler_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .expect("bus lock poisoned")
            .get(topic)
            .map_or(0, Vec::len)
    }

    fn register(&self, topic: &str, handler: Handler<T>, once: bool) -> Subscription
    where
        T: 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut topics = self.inner.topics.lock().expect("bus lock poisoned");
            topics
                .entry(topic.to_string())
                .or_default()
                .push(Entry { id, handler, once });
        }

        let weak: Weak<BusInner<T>> = Arc::downgrade(&self.inner);
        let topic = topic.to_string();
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut topics = inner.topics.lock().expect("bus lock poisoned");
                if let Some(entries) = topics.get_mut(&topic) {
                    entries.retain(|e| e.id != id);
                    if entries.is_empty() {
                        topics.remove(&topic);
                    }
                }
            }
        })
    }
}

/// Handle to a registered event handler.
///
/// Disposing (or dropping) removes the registration. Dispose is
/// idempotent.
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self { detach: Some(Box::new(detach)) }
    }

    /// Remove the registration. Safe to call more than once.
    pub fn dispose(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.detach.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_on_receives_every_emission() {
        let bus: EventBus<String> = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let _sub = bus.on("topic.a", move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit("topic.a", &"one".to_string());
        bus.emit("topic.a", &"two".to_string());
        bus.emit("topic.b", &"other".to_string());

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_once_fires_exactly_once() {
        let bus: EventBus<i32> = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let _sub = bus.once("tick", move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit("tick", &1);
        bus.emit("tick", &2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count("tick"), 0);
    }

    #[test]
    fn test_dispose_detaches() {
        let bus: EventBus<i32> = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let mut sub = bus.on("tick", move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit("tick", &1);
        sub.dispose();
        sub.dispose(); // idempotent
        bus.emit("tick", &2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count("tick"), 0);
    }

    #[test]
    fn test_drop_detaches() {
        let bus: EventBus<i32> = EventBus::new();
        {
            let _sub = bus.on("tick", |_| {});
            assert_eq!(bus.handler_count("tick"), 1);
        }
        assert_eq!(bus.handler_count("tick"), 0);
    }

    #[test]
    fn test_off_clears_topic() {
        let bus: EventBus<i32> = EventBus::new();
        let _a = bus.on("tick", |_| {});
        let _b = bus.on("tick", |_| {});
        assert_eq!(bus.handler_count("tick"), 2);

        bus.off("tick");
        assert_eq!(bus.handler_count("tick"), 0);
        // Disposing the stale handles is a no-op.
        drop(_a);
        drop(_b);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_dispatch() {
        let bus: EventBus<i32> = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let _bad = bus.on("tick", |_| panic!("handler bug"));
        let _good = bus.on("tick", move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit("tick", &1);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_may_reenter_bus() {
        let bus: EventBus<i32> = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let bus2 = bus.clone();
        let count2 = Arc::clone(&count);
        let _outer = bus.on("outer", move |_| {
            // Registering from inside a handler must not deadlock.
            let count3 = Arc::clone(&count2);
            let mut inner = bus2.on("inner", move |_| {
                count3.fetch_add(1, Ordering::SeqCst);
            });
            bus2.emit("inner", &0);
            inner.dispose();
        });

        bus.emit("outer", &0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registration_order_preserved() {
        let bus: EventBus<i32> = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        let o2 = Arc::clone(&order);
        let _a = bus.on("tick", move |_| o1.lock().unwrap().push(1));
        let _b = bus.on("tick", move |_| o2.lock().unwrap().push(2));

        bus.emit("tick", &0);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }
}
