//! Subscription and selector layer.
//!
//! A [`Store`] owns the current immutable snapshot of some state; consumers
//! hold [`StoreHandle`]s that can read it, subscribe to changes, and derive
//! filtered views that only notify when the derived value changes. Handles
//! never get mutable access.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

type Listener<T> = Arc<dyn Fn(&Arc<T>) + Send + Sync>;

struct Shared<T> {
    current: RwLock<(u64, Arc<T>)>,
    listeners: Mutex<BTreeMap<u64, Listener<T>>>,
    next_listener: AtomicU64,
}

impl<T> Shared<T> {
    fn snapshot(&self) -> (u64, Arc<T>) {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        (guard.0, guard.1.clone())
    }

    fn notify(&self, snapshot: &Arc<T>) {
        // Listeners run without any lock held so they may read or subscribe.
        let listeners: Vec<Listener<T>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(snapshot);
        }
    }
}

/// Writer side. Owned by exactly one component.
pub struct Store<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + Sync + 'static> Store<T> {
    pub fn new(initial: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                current: RwLock::new((0, Arc::new(initial))),
                listeners: Mutex::new(BTreeMap::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    /// Replace the snapshot and notify subscribers.
    pub fn set(&self, value: T) {
        let snapshot = Arc::new(value);
        {
            let mut guard = self.shared.current.write().unwrap_or_else(PoisonError::into_inner);
            guard.0 += 1;
            guard.1 = snapshot.clone();
        }
        self.shared.notify(&snapshot);
    }

    /// Replace the snapshot if `revision` is newer than the current one.
    ///
    /// Lets a producer compute snapshots under its own lock and publish them
    /// afterwards without an older snapshot overtaking a newer one.
    pub fn publish(&self, revision: u64, value: T) -> bool {
        let snapshot = Arc::new(value);
        {
            let mut guard = self.shared.current.write().unwrap_or_else(PoisonError::into_inner);
            if revision <= guard.0 {
                return false;
            }
            *guard = (revision, snapshot.clone());
        }
        self.shared.notify(&snapshot);
        true
    }

    pub fn get_snapshot(&self) -> Arc<T> {
        self.shared.snapshot().1
    }

    pub fn revision(&self) -> u64 {
        self.shared.snapshot().0
    }

    pub fn handle(&self) -> StoreHandle<T> {
        StoreHandle { shared: self.shared.clone() }
    }
}

/// Read-only consumer side.
pub struct StoreHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for StoreHandle<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<T: Send + Sync + 'static> StoreHandle<T> {
    pub fn get_snapshot(&self) -> Arc<T> {
        self.shared.snapshot().1
    }

    pub fn revision(&self) -> u64 {
        self.shared.snapshot().0
    }

    /// Derive a view of the current snapshot.
    pub fn get_selected_snapshot<S>(&self, selector: impl Fn(&T) -> S) -> S {
        selector(&self.get_snapshot())
    }

    /// Call `callback` after every change until the returned subscription is
    /// dropped.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Arc<T>) + Send + Sync + 'static,
    {
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(callback));

        let weak: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared
                        .listeners
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&id);
                }
            })),
        }
    }

    /// Like [`StoreHandle::subscribe`], but only fires when the selected value
    /// differs from the last one seen.
    pub fn subscribe_selected<S, Sel, F>(&self, selector: Sel, callback: F) -> Subscription
    where
        S: PartialEq + Clone + Send + 'static,
        Sel: Fn(&T) -> S + Send + Sync + 'static,
        F: Fn(&S) + Send + Sync + 'static,
    {
        let last = Mutex::new(selector(&self.get_snapshot()));
        self.subscribe(move |snapshot| {
            let next = selector(snapshot);
            {
                let mut last = last.lock().unwrap_or_else(PoisonError::into_inner);
                if *last == next {
                    return;
                }
                *last = next.clone();
            }
            callback(&next);
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Removes its listener when dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
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
        f.debug_struct("Subscription").field("active", &self.cancel.is_some()).finish()
    }
}
