//! Key-change observer registry — lets callers watch individual cache keys
//! without polling.
//!
//! Observers register interest in a specific key and are notified after the
//! cache releases its internal lock, so an observer callback is free to call
//! back into the cache (e.g. `get`) without deadlocking. Each observer is
//! invoked inside its own `catch_unwind` so a misbehaving observer cannot
//! block delivery to the others or corrupt the registry.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Caller-chosen identity for a registered observer, used to tell two
/// registrations on the same key apart from a single re-registration of the
/// same observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl From<u64> for ObserverId {
    fn from(id: u64) -> Self {
        ObserverId(id)
    }
}

impl From<usize> for ObserverId {
    fn from(id: usize) -> Self {
        ObserverId(id as u64)
    }
}

/// What happened to an observed key. Carries the same value type the owning
/// cache stores, since the registry never inspects or transforms it.
#[derive(Debug, Clone)]
pub enum KeyChangeKind<V> {
    /// The key was set or overwritten; carries the new value.
    Updated(V),
    /// The key was removed individually.
    Deleted,
    /// The whole cache was cleared; every registered observer is notified
    /// with this variant regardless of the key it registered on.
    DeletedAll,
}

/// A single notification delivered to a key observer.
#[derive(Debug, Clone)]
pub struct KeyChangeNotification<V> {
    pub key: String,
    pub kind: KeyChangeKind<V>,
}

/// Opaque token returned by [`KeyObserverRegistry::add_observer`], used to
/// unregister later via [`KeyObserverRegistry::remove_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverToken(u64);

type ObserverFn<V> = Box<dyn Fn(&KeyChangeNotification<V>) + Send + 'static>;

struct Registration<V> {
    token: ObserverToken,
    observer: ObserverId,
    key: String,
    callback: ObserverFn<V>,
}

/// Registry of per-key observers, owned by a [`crate::cache::MemoryCache`].
pub struct KeyObserverRegistry<V> {
    registrations: Mutex<Vec<Registration<V>>>,
    next_token: AtomicU64,
}

impl<V> Default for KeyObserverRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> KeyObserverRegistry<V> {
    pub fn new() -> Self {
        Self {
            registrations: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Registers `callback` to run whenever `key` changes, under the given
    /// `observer` identity. Returns a token that can be used to remove this
    /// specific registration. The same key may have any number of distinct
    /// observers, but re-registering the same `(observer, key)` pair
    /// replaces the earlier registration (and its token) in place rather
    /// than adding a second one.
    pub fn add_observer<F>(
        &self,
        observer: impl Into<ObserverId>,
        key: impl Into<String>,
        callback: F,
    ) -> ObserverToken
    where
        F: Fn(&KeyChangeNotification<V>) + Send + 'static,
    {
        let observer = observer.into();
        let key = key.into();
        let mut registrations = self
            .registrations
            .lock()
            .expect("observer registry mutex poisoned");

        if let Some(existing) = registrations
            .iter_mut()
            .find(|r| r.observer == observer && r.key == key)
        {
            existing.callback = Box::new(callback);
            return existing.token;
        }

        let token = ObserverToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        registrations.push(Registration {
            token,
            observer,
            key,
            callback: Box::new(callback),
        });
        token
    }

    /// Removes a single observer by token. No-op if the token is unknown
    /// (already removed, or from a different registry).
    pub fn remove_observer(&self, token: ObserverToken) {
        let mut registrations = self
            .registrations
            .lock()
            .expect("observer registry mutex poisoned");
        registrations.retain(|r| r.token != token);
    }

    /// Removes the registration (if any) matching the `(observer, key)`
    /// pair.
    pub fn remove_observer_for(&self, observer: impl Into<ObserverId>, key: &str) {
        let observer = observer.into();
        let mut registrations = self
            .registrations
            .lock()
            .expect("observer registry mutex poisoned");
        registrations.retain(|r| !(r.observer == observer && r.key == key));
    }

    /// Removes every observer watching `key`.
    pub fn remove_all_observers_for_key(&self, key: &str) {
        let mut registrations = self
            .registrations
            .lock()
            .expect("observer registry mutex poisoned");
        registrations.retain(|r| r.key != key);
    }

    /// Delivers `notification` to every observer currently registered for
    /// its key (or, for `DeletedAll`, to every observer regardless of key).
    /// Must be called with the cache's internal lock already released (see
    /// module docs).
    pub fn notify(&self, notification: &KeyChangeNotification<V>) {
        let is_delete_all = matches!(notification.kind, KeyChangeKind::DeletedAll);
        let tokens: Vec<ObserverToken> = {
            let registrations = self
                .registrations
                .lock()
                .expect("observer registry mutex poisoned");
            registrations
                .iter()
                .filter(|r| is_delete_all || r.key == notification.key)
                .map(|r| r.token)
                .collect()
        };

        // Re-lock per callback rather than holding the guard across
        // invocation: an observer is documented as non-reentrant (it must
        // not call add_observer/remove_observer from within its own
        // callback), so a short per-call lock is enough and keeps a
        // misbehaving observer from holding the registry lock for the
        // whole notification.
        for token in tokens {
            let registrations = self
                .registrations
                .lock()
                .expect("observer registry mutex poisoned");
            let Some(reg) = registrations.iter().find(|r| r.token == token) else {
                continue; // removed between snapshot and delivery
            };
            let result = panic::catch_unwind(AssertUnwindSafe(|| (reg.callback)(notification)));
            drop(registrations);
            if let Err(panic) = result {
                tracing::warn!(key = %notification.key, "key observer panicked");
                drop(panic);
            }
        }
    }

    /// Number of currently registered observers (across all keys). Exposed
    /// for tests and diagnostics.
    pub fn len(&self) -> usize {
        self.registrations
            .lock()
            .expect("observer registry mutex poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
