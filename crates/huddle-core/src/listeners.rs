use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use crate::fanout::Fanout;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    next_id: AtomicU64,
    callbacks: RwLock<BTreeMap<u64, Callback<T>>>,
}

impl<T> Inner<T> {
    fn remove(&self, id: u64) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn get(&self, id: u64) -> Option<Callback<T>> {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}

/// Listener callbacks for one event category.
///
/// Each subscription gets a fresh integer key and a [`ListenerToken`] that
/// removes it again. Notifications snapshot the registered callbacks and
/// hand them to the [`Fanout`] worker, so registering or cancelling from
/// inside a callback is safe and only affects later notifications.
pub struct ListenerRegistry<T> {
    inner: Arc<Inner<T>>,
    fanout: Fanout,
}

impl<T: Send + 'static> ListenerRegistry<T> {
    pub fn new(fanout: Fanout) -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                callbacks: RwLock::new(BTreeMap::new()),
            }),
            fanout,
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ListenerToken {
        self.insert(Arc::new(callback)).1
    }

    /// Subscribe and queue `initial` for the new callback alone.
    ///
    /// The initial events go through the fanout like any notification. A
    /// caller that reads `initial` and later calls `notify` under the same
    /// lock therefore gets the initial events delivered before any newer
    /// change. Nothing is delivered if the token is cancelled first.
    pub fn subscribe_with(
        &self,
        callback: impl Fn(&T) + Send + Sync + 'static,
        initial: Vec<T>,
    ) -> ListenerToken {
        let (id, token) = self.insert(Arc::new(callback));
        if initial.is_empty() {
            return token;
        }
        let registry = Arc::downgrade(&self.inner);
        self.fanout.dispatch(move || {
            let Some(callback) = registry.upgrade().and_then(|inner| inner.get(id)) else {
                return;
            };
            for event in &initial {
                callback(event);
            }
        });
        token
    }

    fn insert(&self, callback: Callback<T>) -> (u64, ListenerToken) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, callback);

        let registry: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let token = ListenerToken::new(move || {
            if let Some(inner) = registry.upgrade() {
                inner.remove(id);
            }
        });
        (id, token)
    }

    /// Deliver `event` to every callback registered right now.
    pub fn notify(&self, event: T) {
        let callbacks: Vec<Callback<T>> = self
            .inner
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        if callbacks.is_empty() {
            return;
        }
        self.fanout.dispatch(move || {
            for callback in &callbacks {
                callback(&event);
            }
        });
    }

    pub fn clear(&self) {
        self.inner
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.inner
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cancels one listener subscription.
///
/// `cancel()` may be called from any thread, any number of times.
/// Dropping the token cancels the subscription too.
#[must_use = "dropping a ListenerToken unsubscribes its listener"]
pub struct ListenerToken {
    on_cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ListenerToken {
    fn new(on_cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_cancel: Mutex::new(Some(Box::new(on_cancel))),
        }
    }

    /// A token that is not attached to any registry.
    pub fn inert() -> Self {
        Self {
            on_cancel: Mutex::new(None),
        }
    }

    pub fn cancel(&self) {
        let on_cancel = self
            .on_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(on_cancel) = on_cancel {
            on_cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.on_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for ListenerToken {
    fn drop(&mut self) {
        self.cancel();
    }
}
