//! Fan-out subscriber lists.
//!
//! Handlers registered on one list are independent of each other: a single event is
//! delivered to all of them concurrently, in no particular order. Handlers must not rely
//! on invocation order or on side effects of sibling handlers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

/// Shared event handler.
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Token returned on registration, used to unregister later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

pub struct Subscribers<T> {
    handlers: RwLock<Vec<(SubscriptionId, Handler<T>)>>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Subscribers<T> {
    pub fn new() -> Self {
        Subscribers {
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, handler: Handler<T>) -> SubscriptionId {
        let id = SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed));
        self.write().push((id, handler));
        id
    }

    /// Returns false if `id` was not registered here.
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.write();
        let before = handlers.len();
        handlers.retain(|(sid, _)| *sid != id);
        handlers.len() != before
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<(SubscriptionId, Handler<T>)>> {
        self.handlers.write().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> Vec<Handler<T>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, h)| h.clone())
            .collect()
    }
}

impl<T: Sync> Subscribers<T> {
    /// Delivers `event` to every handler and returns once all of them have finished.
    ///
    /// The handler list is snapshotted first so handlers may (un)register without deadlocking.
    pub fn notify(&self, event: &T) {
        let handlers = self.snapshot();
        match handlers.len() {
            0 => {}
            1 => (handlers[0])(event),
            _ => thread::scope(|scope| {
                for handler in &handlers {
                    scope.spawn(move || handler(event));
                }
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_notify_reaches_every_handler() {
        let subs: Subscribers<u32> = Subscribers::new();
        let total = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let t = total.clone();
            subs.register(Arc::new(move |v: &u32| {
                t.fetch_add(*v as usize, Ordering::SeqCst);
            }));
        }
        subs.notify(&5);
        assert_eq!(total.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_unregister() {
        let subs: Subscribers<u32> = Subscribers::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = subs.register(Arc::new(move |_: &u32| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(subs.unregister(id));
        assert!(!subs.unregister(id));
        subs.notify(&1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(subs.is_empty());
    }

    #[test]
    fn test_clear() {
        let subs: Subscribers<u32> = Subscribers::new();
        subs.register(Arc::new(|_: &u32| {}));
        subs.register(Arc::new(|_: &u32| {}));
        assert_eq!(subs.len(), 2);
        subs.clear();
        assert!(subs.is_empty());
    }
}
