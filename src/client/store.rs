//! Observable single-value store
//!
//! A [`Store`] holds one value and a set of subscriber callbacks. Subscribing
//! immediately delivers the current value; every change is then delivered to
//! all subscribers in registration order. Setting a value equal to the
//! current one is a no-op.
//!
//! Notification works on a snapshot of the subscribers taken when the change
//! is made, and the value lock is not held while callbacks run, so callbacks
//! may freely subscribe, unsubscribe or even `set` again. A subscriber added
//! during a notification is not called for that notification; one removed
//! during a notification may still receive it.
//!
//! Notifications from different threads are serialized: a subscriber is
//! registered in the same critical section that reads its initial value, and
//! no `set` from another thread can deliver before that initial value.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};

type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    value: T,
    next_id: u64,
    subscribers: BTreeMap<u64, Subscriber<T>>,
}

/// A mutable observable value
///
/// Cloning a store yields another handle to the same value.
pub struct Store<T> {
    inner: Arc<Mutex<Inner<T>>>,
    // Held while delivering; reentrant so callbacks can set or subscribe
    notify: Arc<ReentrantMutex<()>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            notify: Arc::clone(&self.notify),
        }
    }
}

impl<T> Store<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    /// Create a store holding `initial`
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                value: initial,
                next_id: 0,
                subscribers: BTreeMap::new(),
            })),
            notify: Arc::new(ReentrantMutex::new(())),
        }
    }

    /// Get the current value
    pub fn get(&self) -> T {
        self.inner.lock().value.clone()
    }

    /// Replace the current value, notifying subscribers if it changed
    ///
    /// Returns whether the value changed.
    pub fn set(&self, value: T) -> bool {
        let _delivering = self.notify.lock();
        let subscribers: Vec<Subscriber<T>> = {
            let mut inner = self.inner.lock();
            if inner.value == value {
                return false;
            }
            inner.value = value.clone();
            inner.subscribers.values().cloned().collect()
        };

        for subscriber in subscribers {
            subscriber(&value);
        }
        true
    }

    /// Register `callback`, calling it right away with the current value
    pub fn subscribe<F>(&self, callback: F) -> Unsubscriber
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let callback: Subscriber<T> = Arc::new(callback);
        let _delivering = self.notify.lock();

        let (id, current) = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.subscribers.insert(id, Arc::clone(&callback));
            (id, inner.value.clone())
        };
        callback(&current);

        let weak = Arc::downgrade(&self.inner);
        Unsubscriber {
            remove: Box::new(move || match weak.upgrade() {
                Some(inner) => {
                    let removed = inner.lock().subscribers.remove(&id);
                    removed.is_some()
                }
                None => false,
            }),
        }
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// A read-only view of this store
    pub fn readable(&self) -> ReadableStore<T> {
        ReadableStore {
            store: self.clone(),
        }
    }
}

/// Read-only view of a [`Store`], handed to observers
pub struct ReadableStore<T> {
    store: Store<T>,
}

impl<T> Clone for ReadableStore<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<T> ReadableStore<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    /// Get the current value
    pub fn get(&self) -> T {
        self.store.get()
    }

    /// Register `callback`, calling it right away with the current value
    pub fn subscribe<F>(&self, callback: F) -> Unsubscriber
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.store.subscribe(callback)
    }
}

/// Handle returned by `subscribe`
///
/// Dropping the handle keeps the subscription alive; call
/// [`Unsubscriber::unsubscribe`] to remove it.
pub struct Unsubscriber {
    remove: Box<dyn FnOnce() -> bool + Send + Sync>,
}

impl Unsubscriber {
    /// Remove the subscription, returning whether it was still registered
    pub fn unsubscribe(self) -> bool {
        (self.remove)()
    }
}

impl std::fmt::Debug for Unsubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscriber").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |value: &T| sink.lock().push(value.clone()))
    }

    #[test]
    fn test_subscribe_delivers_current_value_once() {
        let store = Store::new(7);
        let (seen, callback) = recorder::<i32>();

        let _unsubscribe = store.subscribe(callback);
        assert_eq!(*seen.lock(), vec![7]);
    }

    #[test]
    fn test_set_equal_value_is_noop() {
        let store = Store::new(false);
        let (seen, callback) = recorder::<bool>();
        let _unsubscribe = store.subscribe(callback);

        assert!(!store.set(false));
        assert_eq!(*seen.lock(), vec![false]);
    }

    #[test]
    fn test_set_notifies_every_subscriber_once() {
        let store = Store::new(1);
        let (first, first_cb) = recorder::<i32>();
        let (second, second_cb) = recorder::<i32>();
        let _a = store.subscribe(first_cb);
        let _b = store.subscribe(second_cb);

        assert!(store.set(2));
        assert_eq!(store.get(), 2);
        assert_eq!(*first.lock(), vec![1, 2]);
        assert_eq!(*second.lock(), vec![1, 2]);
    }

    #[test]
    fn test_notification_in_registration_order() {
        let store = Store::new(0);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for n in 0..5 {
            let order = Arc::clone(&order);
            handles.push(store.subscribe(move |v: &i32| {
                if *v != 0 {
                    order.lock().push(n);
                }
            }));
        }

        store.set(1);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_unsubscribe() {
        let store = Store::new("a".to_string());
        let (seen, callback) = recorder::<String>();
        let unsubscribe = store.subscribe(callback);

        assert!(unsubscribe.unsubscribe());
        store.set("b".to_string());
        assert_eq!(*seen.lock(), vec!["a".to_string()]);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn test_unsubscribe_after_store_dropped() {
        let store = Store::new(0);
        let unsubscribe = store.subscribe(|_| {});
        drop(store);
        assert!(!unsubscribe.unsubscribe());
    }

    #[test]
    fn test_subscribe_during_notification() {
        let store = Store::new(0);
        let late_calls = Arc::new(Mutex::new(Vec::new()));

        let inner_store = store.clone();
        let late = Arc::clone(&late_calls);
        let _outer = store.subscribe(move |v: &i32| {
            if *v == 1 {
                let late = Arc::clone(&late);
                let _ = inner_store.subscribe(move |v: &i32| late.lock().push(*v));
            }
        });

        store.set(1);
        // Called once on subscribe with the new value, not by the running notification
        assert_eq!(*late_calls.lock(), vec![1]);

        store.set(2);
        assert_eq!(*late_calls.lock(), vec![1, 2]);
    }

    #[test]
    fn test_unsubscribe_during_notification() {
        let store = Store::new(0);
        let handle: Arc<Mutex<Option<Unsubscriber>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(Mutex::new(0));

        let slot = Arc::clone(&handle);
        let counter = Arc::clone(&calls);
        let unsubscribe = store.subscribe(move |v: &i32| {
            *counter.lock() += 1;
            if *v == 1 {
                if let Some(unsubscribe) = slot.lock().take() {
                    unsubscribe.unsubscribe();
                }
            }
        });
        *handle.lock() = Some(unsubscribe);

        store.set(1);
        store.set(2);
        assert_eq!(*calls.lock(), 2);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn test_set_during_initial_delivery_reaches_new_subscriber() {
        use std::sync::Barrier;
        use std::thread;
        use std::time::Duration;

        let store = Store::new(0);
        let barrier = Arc::new(Barrier::new(2));

        let setter = {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                store.set(1);
            })
        };

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let gate = Arc::clone(&barrier);
        let _unsubscribe = store.subscribe(move |v: &i32| {
            if *v == 0 {
                // Let the other thread race its set against this delivery
                gate.wait();
                thread::sleep(Duration::from_millis(50));
            }
            sink.lock().push(*v);
        });

        setter.join().unwrap();
        assert_eq!(store.get(), 1);
        assert_eq!(*seen.lock(), vec![0, 1]);
    }

    #[test]
    fn test_set_from_callback_on_same_thread() {
        let store = Store::new(0);
        let (seen, callback) = recorder::<i32>();
        let _recorder = store.subscribe(callback);

        let inner_store = store.clone();
        let _bump = store.subscribe(move |v: &i32| {
            if *v == 1 {
                inner_store.set(2);
            }
        });

        store.set(1);
        assert_eq!(store.get(), 2);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_readable_view() {
        let store = Store::new(3);
        let readable = store.readable();
        let (seen, callback) = recorder::<i32>();
        let _unsubscribe = readable.subscribe(callback);

        store.set(4);
        assert_eq!(readable.get(), 4);
        assert_eq!(*seen.lock(), vec![3, 4]);
    }
}
