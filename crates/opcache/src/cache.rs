//! Thread-safe in-process memory cache with cost/age/TTL eviction,
//! per-entry lifecycle callbacks, and key-change notifications.
//!
//! A single [`std::sync::Mutex`] (not an `RwLock`) guards all entry state:
//! nothing here needs concurrent readers to proceed in parallel, and a plain
//! mutex keeps the locking discipline (lifecycle callbacks run *with the
//! lock held*, host-event callbacks run *after it is released*)
//! straightforward to reason about.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use lru::LruCache;

use crate::config::{ConfigFlags, MemoryCacheConfig, NoopConfigFlags};
use crate::error::OpCacheError;
use crate::host::{BackgroundTask, NoopBackgroundTask};
use crate::observer::{
    KeyChangeKind, KeyChangeNotification, KeyObserverRegistry, ObserverId, ObserverToken,
};
use crate::scheduler::{OperationQueue, Priority};

/// Feature names this cache asks the injected [`ConfigFlags`] collaborator
/// about at construction. Experimental behaviors gated by these flags are
/// added here as they are introduced; an unrecognized flag simply reads as
/// whatever the collaborator returns and is otherwise inert.
const GATED_FEATURES: &[&str] = &["opcache.strict_ttl_on_enumerate"];

type Callback2<V> = Box<dyn Fn(&str, &V) + Send + Sync>;
type Callback0 = Box<dyn Fn() + Send + Sync>;
/// Host-event callbacks are stored behind `Arc` (not `Box`, unlike the
/// lifecycle callbacks above) so a clone can be taken while the lock is held
/// and then invoked after it is dropped.
type SharedCallback0 = Arc<dyn Fn() + Send + Sync>;

/// Background timer poll interval used while no age limit is armed, so a
/// newly-set age limit is picked up promptly without a dedicated wakeup
/// channel for every config mutation.
const TIMER_IDLE_POLL: Duration = Duration::from_millis(200);

#[derive(Clone)]
struct Entry<V> {
    value: V,
    cost: u64,
    created_at: Instant,
    last_access: Instant,
    age_limit: Option<Duration>,
}

impl<V> Entry<V> {
    fn effective_age_limit(&self, cache_wide: Option<Duration>) -> Option<Duration> {
        self.age_limit.or(cache_wide)
    }
}

struct Inner<V> {
    entries: IndexMap<String, Entry<V>>,
    /// Ordered by recency; in TTL mode only `set` ever touches it, so its
    /// order doubles as creation order there (`get` never promotes).
    access_index: LruCache<String, ()>,
    cost_index: BTreeSet<(u64, String)>,
    total_cost: u64,
    cost_limit: u64,
    age_limit: Option<Duration>,
    will_add: Option<Callback2<V>>,
    did_add: Option<Callback2<V>>,
    will_remove: Option<Callback2<V>>,
    did_remove: Option<Callback2<V>>,
    will_remove_all: Option<Callback0>,
    did_remove_all: Option<Callback0>,
    on_memory_pressure: Option<SharedCallback0>,
    on_host_suspend: Option<SharedCallback0>,
}

struct Shared<V> {
    inner: Mutex<Inner<V>>,
    queue: OperationQueue,
    observers: KeyObserverRegistry<V>,
    name: Option<String>,
    ttl_cache: bool,
    remove_all_on_memory_pressure: AtomicBool,
    remove_all_on_host_suspend: AtomicBool,
    background_task: Arc<dyn BackgroundTask>,
    timer_signal: Arc<(Mutex<()>, Condvar)>,
    feature_flags: HashMap<String, bool>,
}

/// A thread-safe, in-process key/value cache.
///
/// Cheap to clone: a clone shares the same underlying storage, worker pool,
/// and observer registry (it is a thin `Arc` wrapper), which is what lets
/// the async accessors capture `self.clone()` into a closure submitted to
/// the priority queue.
pub struct MemoryCache<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Clone for MemoryCache<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V> MemoryCache<V>
where
    V: Clone + Send + 'static,
{
    /// Builds a cache with the default (no-op) background-task and
    /// config-flag collaborators.
    pub fn new(config: MemoryCacheConfig) -> Result<Self, OpCacheError> {
        Self::with_collaborators(
            config,
            Arc::new(NoopBackgroundTask),
            Arc::new(NoopConfigFlags),
        )
    }

    /// Builds a cache, injecting a platform background-task collaborator
    /// used to extend process lifetime during host-suspend handling.
    pub fn with_background_task(
        config: MemoryCacheConfig,
        background_task: Arc<dyn BackgroundTask>,
    ) -> Result<Self, OpCacheError> {
        Self::with_collaborators(config, background_task, Arc::new(NoopConfigFlags))
    }

    /// Builds a cache, injecting both external collaborators: the platform
    /// background-task extender and the boolean config-flag lookup. The flag
    /// lookup is read once here and cached for the lifetime of the cache —
    /// it is never consulted again after construction.
    pub fn with_collaborators(
        config: MemoryCacheConfig,
        background_task: Arc<dyn BackgroundTask>,
        config_flags: Arc<dyn ConfigFlags>,
    ) -> Result<Self, OpCacheError> {
        let queue = OperationQueue::new(config.max_concurrent_operations)?;
        let feature_flags = config_flags.snapshot(GATED_FEATURES);

        let inner = Inner {
            entries: IndexMap::new(),
            access_index: LruCache::unbounded(),
            cost_index: BTreeSet::new(),
            total_cost: 0,
            cost_limit: config.cost_limit,
            age_limit: config.age_limit,
            will_add: None,
            did_add: None,
            will_remove: None,
            did_remove: None,
            will_remove_all: None,
            did_remove_all: None,
            on_memory_pressure: None,
            on_host_suspend: None,
        };

        let shared = Arc::new(Shared {
            inner: Mutex::new(inner),
            queue,
            observers: KeyObserverRegistry::new(),
            name: config.name.clone(),
            ttl_cache: config.ttl_cache,
            remove_all_on_memory_pressure: AtomicBool::new(config.remove_all_on_memory_pressure),
            remove_all_on_host_suspend: AtomicBool::new(config.remove_all_on_host_suspend),
            background_task,
            timer_signal: Arc::new((Mutex::new(()), Condvar::new())),
            feature_flags,
        });

        spawn_age_timer(Arc::downgrade(&shared));

        tracing::debug!(name = ?shared.name, "memory cache constructed");

        Ok(Self { shared })
    }

    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    pub fn total_cost(&self) -> u64 {
        self.lock().total_cost
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<V>> {
        self.shared
            .inner
            .lock()
            .expect("memory cache mutex poisoned")
    }

    // ---- configuration -------------------------------------------------

    pub fn set_cost_limit(&self, cost_limit: u64) {
        self.lock().cost_limit = cost_limit;
    }

    pub fn cost_limit(&self) -> u64 {
        self.lock().cost_limit
    }

    pub fn set_age_limit(&self, age_limit: Option<Duration>) {
        self.lock().age_limit = age_limit;
        let (_, wake) = &*self.shared.timer_signal;
        wake.notify_all();
    }

    pub fn age_limit(&self) -> Option<Duration> {
        self.lock().age_limit
    }

    pub fn set_remove_all_on_memory_pressure(&self, enabled: bool) {
        self.shared
            .remove_all_on_memory_pressure
            .store(enabled, Ordering::SeqCst);
    }

    pub fn set_remove_all_on_host_suspend(&self, enabled: bool) {
        self.shared
            .remove_all_on_host_suspend
            .store(enabled, Ordering::SeqCst);
    }

    pub fn set_will_add(&self, callback: impl Fn(&str, &V) + Send + Sync + 'static) {
        self.lock().will_add = Some(Box::new(callback));
    }

    pub fn set_did_add(&self, callback: impl Fn(&str, &V) + Send + Sync + 'static) {
        self.lock().did_add = Some(Box::new(callback));
    }

    pub fn set_will_remove(&self, callback: impl Fn(&str, &V) + Send + Sync + 'static) {
        self.lock().will_remove = Some(Box::new(callback));
    }

    pub fn set_did_remove(&self, callback: impl Fn(&str, &V) + Send + Sync + 'static) {
        self.lock().did_remove = Some(Box::new(callback));
    }

    pub fn set_will_remove_all(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.lock().will_remove_all = Some(Box::new(callback));
    }

    pub fn set_did_remove_all(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.lock().did_remove_all = Some(Box::new(callback));
    }

    pub fn set_on_memory_pressure(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.lock().on_memory_pressure = Some(Arc::new(callback));
    }

    pub fn set_on_host_suspend(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.lock().on_host_suspend = Some(Arc::new(callback));
    }

    // ---- observers -------------------------------------------------

    pub fn add_observer(
        &self,
        observer: impl Into<ObserverId>,
        key: impl Into<String>,
        callback: impl Fn(&KeyChangeNotification<V>) + Send + 'static,
    ) -> ObserverToken {
        self.shared.observers.add_observer(observer, key, callback)
    }

    pub fn remove_observer(&self, token: ObserverToken) {
        self.shared.observers.remove_observer(token);
    }

    pub fn remove_observer_for(&self, observer: impl Into<ObserverId>, key: &str) {
        self.shared.observers.remove_observer_for(observer, key);
    }

    // ---- synchronous accessors -----------------------------------------

    /// In TTL mode, an expired entry reads as absent and is evicted in the
    /// same call; it never has its lifetime extended by being read. In
    /// non-TTL mode, a successful read touches the recency index.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.lock();
        let entry = inner.entries.get(key)?;

        if self.shared.ttl_cache {
            let limit = entry.effective_age_limit(inner.age_limit);
            if limit.is_some_and(|l| entry.created_at.elapsed() > l) {
                remove_locked(&mut inner, key);
                drop(inner);
                self.notify_deleted(key);
                return None;
            }
            return Some(entry.value.clone());
        }

        let value = entry.value.clone();
        let now = Instant::now();
        inner.access_index.put(key.to_string(), ());
        inner
            .entries
            .get_mut(key)
            .expect("checked above")
            .last_access = now;
        Some(value)
    }

    pub fn contains(&self, key: &str) -> bool {
        let inner = self.lock();
        let Some(entry) = inner.entries.get(key) else {
            return false;
        };
        if self.shared.ttl_cache {
            let limit = entry.effective_age_limit(inner.age_limit);
            limit.is_none_or(|l| entry.created_at.elapsed() <= l)
        } else {
            true
        }
    }

    /// Inserts or overwrites `key`. `will_add` fires first; if an entry for
    /// `key` already exists it is then removed (firing `will_remove`/
    /// `did_remove`, all inside the same lock acquisition) before the new
    /// value is inserted and `did_add` fires. Schedules a background cost
    /// trim afterward if the cache is now over its limit.
    pub fn set(
        &self,
        key: impl Into<String>,
        value: V,
        cost: u64,
        age_limit: Option<Duration>,
    ) -> Result<(), OpCacheError> {
        if let Some(limit) = age_limit {
            if limit.is_zero() {
                return Err(OpCacheError::invalid_argument(
                    "per-entry age_limit must be > 0",
                ));
            }
        }

        let key = key.into();
        let now = Instant::now();
        let cost_limit = {
            let mut inner = self.lock();
            if let Some(cb) = inner.will_add.as_ref() {
                cb(&key, &value);
            }
            if inner.entries.contains_key(&key) {
                remove_locked(&mut inner, &key);
            }
            inner.entries.insert(
                key.clone(),
                Entry {
                    value: value.clone(),
                    cost,
                    created_at: now,
                    last_access: now,
                    age_limit,
                },
            );
            inner.access_index.put(key.clone(), ());
            inner.cost_index.insert((cost, key.clone()));
            inner.total_cost += cost;
            if let Some(cb) = inner.did_add.as_ref() {
                cb(&key, &value);
            }
            inner.cost_limit
        };

        self.shared.observers.notify(&KeyChangeNotification {
            key: key.clone(),
            kind: KeyChangeKind::Updated(value),
        });

        if cost_limit > 0 && self.total_cost() > cost_limit {
            let cache = self.clone();
            self.shared.queue.submit(Priority::Default, move || {
                cache.trim_to_cost_by_date(cost_limit)
            });
        }

        Ok(())
    }

    pub fn remove(&self, key: &str) {
        let removed = {
            let mut inner = self.lock();
            remove_locked(&mut inner, key)
        };
        if removed.is_some() {
            self.notify_deleted(key);
        }
    }

    pub fn remove_all(&self) {
        let removed_keys: Vec<String> = {
            let mut inner = self.lock();
            if let Some(cb) = inner.will_remove_all.as_ref() {
                cb();
            }
            let keys: Vec<String> = inner.entries.keys().cloned().collect();
            inner.entries.clear();
            inner.access_index.clear();
            inner.cost_index.clear();
            inner.total_cost = 0;
            if let Some(cb) = inner.did_remove_all.as_ref() {
                cb();
            }
            keys
        };

        tracing::debug!(count = removed_keys.len(), "removed all entries");
        self.shared.observers.notify(&KeyChangeNotification {
            key: String::new(),
            kind: KeyChangeKind::DeletedAll,
        });
    }

    /// Visits every entry currently in the cache. When the
    /// `opcache.strict_ttl_on_enumerate` flag is enabled (via the injected
    /// [`ConfigFlags`] collaborator) and the cache is in TTL mode, entries
    /// that are semantically expired are skipped even though they have not
    /// yet been physically evicted; otherwise every live entry is visited.
    pub fn enumerate(&self, mut visitor: impl FnMut(&str, &V)) {
        let strict_ttl = self.shared.ttl_cache
            && self
                .shared
                .feature_flags
                .get("opcache.strict_ttl_on_enumerate")
                .copied()
                .unwrap_or(false);

        let inner = self.lock();
        for (key, entry) in inner.entries.iter() {
            if strict_ttl {
                let limit = entry.effective_age_limit(inner.age_limit);
                if limit.is_some_and(|l| entry.created_at.elapsed() > l) {
                    continue;
                }
            }
            visitor(key, &entry.value);
        }
    }

    // ---- eviction --------------------------------------------------------

    /// Repeatedly removes the greatest-cost entry (ties broken by older
    /// last-access) until `total_cost <= target`.
    pub fn trim_to_cost(&self, target: u64) {
        let mut removed = Vec::new();
        {
            let mut inner = self.lock();
            while inner.total_cost > target {
                let Some(key) = pick_for_trim_to_cost(&inner) else {
                    break;
                };
                remove_locked(&mut inner, &key);
                removed.push(key);
            }
        }
        self.notify_all_deleted(&removed);
    }

    /// Repeatedly removes the oldest-last-access entry until
    /// `total_cost <= target`.
    pub fn trim_to_cost_by_date(&self, target: u64) {
        let mut removed = Vec::new();
        {
            let mut inner = self.lock();
            while inner.total_cost > target {
                let Some((key, _)) = inner.access_index.peek_lru() else {
                    break;
                };
                let key = key.clone();
                remove_locked(&mut inner, &key);
                removed.push(key);
            }
        }
        self.notify_all_deleted(&removed);
    }

    /// Removes every entry whose relevant timestamp (last-access in
    /// non-TTL mode, creation in TTL mode) is at or before `cutoff`.
    pub fn trim_to_date(&self, cutoff: Instant) {
        let ttl_cache = self.shared.ttl_cache;
        let mut removed = Vec::new();
        {
            let mut inner = self.lock();
            loop {
                let Some((key, _)) = inner.access_index.peek_lru() else {
                    break;
                };
                let key = key.clone();
                let Some(entry) = inner.entries.get(&key) else {
                    break;
                };
                let timestamp = if ttl_cache {
                    entry.created_at
                } else {
                    entry.last_access
                };
                if timestamp > cutoff {
                    break;
                }
                remove_locked(&mut inner, &key);
                removed.push(key);
            }
        }
        self.notify_all_deleted(&removed);
    }

    fn notify_deleted(&self, key: &str) {
        self.shared.observers.notify(&KeyChangeNotification {
            key: key.to_string(),
            kind: KeyChangeKind::Deleted,
        });
    }

    fn notify_all_deleted(&self, keys: &[String]) {
        for key in keys {
            self.notify_deleted(key);
        }
    }

    // ---- asynchronous accessors -----------------------------------------

    pub fn get_async(
        &self,
        key: impl Into<String>,
        priority: Priority,
        completion: impl FnOnce(Option<V>) + Send + 'static,
    ) {
        let cache = self.clone();
        let key = key.into();
        self.shared
            .queue
            .submit(priority, move || completion(cache.get(&key)));
    }

    pub fn set_async(
        &self,
        key: impl Into<String>,
        value: V,
        cost: u64,
        age_limit: Option<Duration>,
        priority: Priority,
        completion: impl FnOnce(Result<(), OpCacheError>) + Send + 'static,
    ) {
        let cache = self.clone();
        let key = key.into();
        self.shared.queue.submit(priority, move || {
            completion(cache.set(key, value, cost, age_limit))
        });
    }

    pub fn remove_async(
        &self,
        key: impl Into<String>,
        priority: Priority,
        completion: impl FnOnce() + Send + 'static,
    ) {
        let cache = self.clone();
        let key = key.into();
        self.shared.queue.submit(priority, move || {
            cache.remove(&key);
            completion();
        });
    }

    pub fn remove_all_async(&self, priority: Priority, completion: impl FnOnce() + Send + 'static) {
        let cache = self.clone();
        self.shared.queue.submit(priority, move || {
            cache.remove_all();
            completion();
        });
    }

    pub fn enumerate_async(
        &self,
        priority: Priority,
        mut visitor: impl FnMut(&str, &V) + Send + 'static,
        completion: impl FnOnce() + Send + 'static,
    ) {
        let cache = self.clone();
        self.shared.queue.submit(priority, move || {
            cache.enumerate(|k, v| visitor(k, v));
            completion();
        });
    }

    pub fn wait_until_all_finished(&self) {
        self.shared.queue.wait_until_all_finished();
    }

    // ---- host-event hooks ------------------------------------------------

    pub fn handle_memory_pressure(&self) {
        let callback = self.lock().on_memory_pressure.clone();
        if let Some(cb) = callback {
            cb();
        }
        if self
            .shared
            .remove_all_on_memory_pressure
            .load(Ordering::SeqCst)
        {
            tracing::debug!("memory pressure: clearing cache");
            self.remove_all();
        }
    }

    pub fn handle_host_suspend(&self) {
        let callback = self.lock().on_host_suspend.clone();
        if let Some(cb) = callback {
            cb();
        }
        if self
            .shared
            .remove_all_on_host_suspend
            .load(Ordering::SeqCst)
        {
            let handle = self.shared.background_task.start();
            tracing::debug!("host suspend: clearing cache");
            self.remove_all();
            self.shared.background_task.end(handle);
        }
    }
}

fn remove_locked<V: Clone>(inner: &mut Inner<V>, key: &str) -> Option<V> {
    let entry = inner.entries.get(key)?.clone();
    if let Some(cb) = inner.will_remove.as_ref() {
        cb(key, &entry.value);
    }
    inner.entries.shift_remove(key);
    inner.access_index.pop(key);
    inner.cost_index.remove(&(entry.cost, key.to_string()));
    inner.total_cost = inner.total_cost.saturating_sub(entry.cost);
    if let Some(cb) = inner.did_remove.as_ref() {
        cb(key, &entry.value);
    }
    Some(entry.value)
}

fn pick_for_trim_to_cost<V>(inner: &Inner<V>) -> Option<String> {
    let &(max_cost, _) = inner.cost_index.iter().next_back()?;
    let mut best: Option<(&str, Instant)> = None;
    for (cost, key) in inner.cost_index.range((max_cost, String::new())..) {
        if *cost != max_cost {
            break;
        }
        let last_access = inner.entries[key].last_access;
        if best.is_none_or(|(_, b)| last_access < b) {
            best = Some((key.as_str(), last_access));
        }
    }
    best.map(|(k, _)| k.to_string())
}

fn spawn_age_timer<V>(weak: Weak<Shared<V>>)
where
    V: Clone + Send + 'static,
{
    let signal = match weak.upgrade() {
        Some(shared) => Arc::clone(&shared.timer_signal),
        None => return,
    };

    std::thread::Builder::new()
        .name("opcache-age-timer".to_string())
        .spawn(move || loop {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let age_limit = shared
                .inner
                .lock()
                .expect("memory cache mutex poisoned")
                .age_limit;
            drop(shared);

            let wait_for = age_limit.unwrap_or(TIMER_IDLE_POLL);
            {
                let (mutex, condvar) = &*signal;
                let guard = mutex.lock().expect("timer signal mutex poisoned");
                let _ = condvar
                    .wait_timeout(guard, wait_for)
                    .expect("timer signal mutex poisoned");
            }

            let Some(shared) = weak.upgrade() else {
                return;
            };
            if let Some(limit) = age_limit {
                if let Some(cutoff) = Instant::now().checked_sub(limit) {
                    let cache = MemoryCache { shared };
                    cache.trim_to_date(cutoff);
                }
            }
        })
        .expect("failed to spawn age-limit timer thread");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::thread;

    fn cache_with(config: MemoryCacheConfig) -> MemoryCache<String> {
        MemoryCache::new(config).unwrap()
    }

    #[test]
    fn set_then_get_round_trips() {
        let cache = cache_with(MemoryCacheConfig::default());
        cache.set("a", "1".to_string(), 1, None).unwrap();
        assert_eq!(cache.get("a"), Some("1".to_string()));
    }

    #[test]
    fn overwrite_replaces_value_and_cost() {
        let cache = cache_with(MemoryCacheConfig::default());
        cache.set("a", "1".to_string(), 5, None).unwrap();
        cache.set("a", "2".to_string(), 7, None).unwrap();
        assert_eq!(cache.get("a"), Some("2".to_string()));
        assert_eq!(cache.total_cost(), 7);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let cache = cache_with(MemoryCacheConfig::default());
        cache.set("a", "1".to_string(), 1, None).unwrap();
        cache.remove("a");
        cache.remove("a"); // must not panic or misbehave
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn rejects_non_positive_per_entry_age_limit() {
        let cache = cache_with(MemoryCacheConfig::default());
        let err = cache
            .set("a", "1".to_string(), 1, Some(Duration::ZERO))
            .unwrap_err();
        assert!(matches!(err, OpCacheError::InvalidArgument { .. }));
    }

    #[test]
    fn set_over_cost_limit_trims_oldest_by_date() {
        let cache = cache_with(MemoryCacheConfig {
            cost_limit: 10,
            ..Default::default()
        });
        cache.set("a", "a".to_string(), 4, None).unwrap();
        cache.set("b", "b".to_string(), 4, None).unwrap();
        cache.set("c", "c".to_string(), 4, None).unwrap();
        cache.wait_until_all_finished();

        assert!(cache.total_cost() <= 10);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some("b".to_string()));
        assert_eq!(cache.get("c"), Some("c".to_string()));
    }

    #[test]
    fn ttl_mode_expires_entries_on_get() {
        let did_remove_count = Arc::new(StdMutex::new(0));
        let did_remove_count_clone = Arc::clone(&did_remove_count);
        let cache = cache_with(MemoryCacheConfig {
            ttl_cache: true,
            age_limit: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        cache.set_did_remove(move |_, _| {
            *did_remove_count_clone.lock().unwrap() += 1;
        });

        cache.set("x", "v".to_string(), 0, None).unwrap();
        thread::sleep(Duration::from_millis(60));

        assert_eq!(cache.get("x"), None);
        assert_eq!(*did_remove_count.lock().unwrap(), 1);
    }

    #[test]
    fn non_ttl_get_touches_recency_without_expiring() {
        let cache = cache_with(MemoryCacheConfig::default());
        cache.set("a", "1".to_string(), 1, None).unwrap();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.get("a"), Some("1".to_string()));
    }

    #[test]
    fn trim_to_cost_prefers_greatest_cost() {
        let cache = cache_with(MemoryCacheConfig::default());
        cache.set("small", "s".to_string(), 1, None).unwrap();
        cache.set("big", "b".to_string(), 9, None).unwrap();
        cache.trim_to_cost(5);

        assert_eq!(cache.get("big"), None);
        assert_eq!(cache.get("small"), Some("s".to_string()));
    }

    #[test]
    fn trim_to_date_removes_entries_older_than_cutoff() {
        let cache = cache_with(MemoryCacheConfig::default());
        cache.set("old", "o".to_string(), 1, None).unwrap();
        thread::sleep(Duration::from_millis(20));
        let cutoff = Instant::now();
        thread::sleep(Duration::from_millis(5));
        cache.set("new", "n".to_string(), 1, None).unwrap();

        cache.trim_to_date(cutoff);

        assert_eq!(cache.get("old"), None);
        assert_eq!(cache.get("new"), Some("n".to_string()));
    }

    #[test]
    fn observer_sees_update_then_delete_in_order() {
        let cache = cache_with(MemoryCacheConfig::default());
        let events = Arc::new(StdMutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        cache.add_observer(1u64, "k", move |n| {
            let label = match &n.kind {
                KeyChangeKind::Updated(_) => "updated",
                KeyChangeKind::Deleted => "deleted",
                KeyChangeKind::DeletedAll => "deleted_all",
            };
            events_clone.lock().unwrap().push(label.to_string());
        });

        cache.set("k", "v".to_string(), 0, None).unwrap();
        cache.remove("k");

        assert_eq!(
            *events.lock().unwrap(),
            vec!["updated".to_string(), "deleted".to_string()]
        );
    }

    #[test]
    fn zero_cost_limit_disables_trimming() {
        let cache = cache_with(MemoryCacheConfig::default());
        let mut expected_total = 0u64;
        for i in 0..200u64 {
            let cost = i % 17;
            cache
                .set(format!("k{i}"), i.to_string(), cost, None)
                .unwrap();
            expected_total += cost;
        }
        cache.wait_until_all_finished();
        assert_eq!(cache.len(), 200);
        assert_eq!(cache.total_cost(), expected_total);
    }

    #[test]
    fn remove_all_clears_everything_and_notifies_once_per_observer() {
        let cache = cache_with(MemoryCacheConfig::default());
        cache.set("a", "1".to_string(), 1, None).unwrap();
        cache.set("b", "2".to_string(), 1, None).unwrap();

        let saw_delete_all = Arc::new(StdMutex::new(false));
        let saw_delete_all_clone = Arc::clone(&saw_delete_all);
        cache.add_observer(1u64, "anything-unregistered-is-fine", move |n| {
            if matches!(n.kind, KeyChangeKind::DeletedAll) {
                *saw_delete_all_clone.lock().unwrap() = true;
            }
        });

        cache.remove_all();

        assert!(cache.is_empty());
        assert_eq!(cache.total_cost(), 0);
        assert!(*saw_delete_all.lock().unwrap());
    }

    #[test]
    fn enumerate_visits_every_live_entry() {
        let cache = cache_with(MemoryCacheConfig::default());
        cache.set("a", "1".to_string(), 1, None).unwrap();
        cache.set("b", "2".to_string(), 1, None).unwrap();

        let mut seen = Vec::new();
        cache.enumerate(|k, v| seen.push((k.to_string(), v.clone())));
        seen.sort();

        assert_eq!(
            seen,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
    }

    #[test]
    fn async_set_then_get_completes_via_callback() {
        let cache = cache_with(MemoryCacheConfig::default());
        let (tx, rx) = std::sync::mpsc::channel();
        cache.set_async(
            "a",
            "1".to_string(),
            1,
            None,
            Priority::Default,
            move |result| {
                tx.send(result).unwrap();
            },
        );
        rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(cache.get("a"), Some("1".to_string()));
    }

    #[test]
    fn handle_memory_pressure_clears_when_flag_enabled() {
        let cache = cache_with(MemoryCacheConfig::default());
        cache.set("a", "1".to_string(), 1, None).unwrap();
        cache.handle_memory_pressure();
        assert!(cache.is_empty());
    }

    #[test]
    fn handle_memory_pressure_preserves_entries_when_flag_disabled() {
        let cache = cache_with(MemoryCacheConfig {
            remove_all_on_memory_pressure: false,
            ..Default::default()
        });
        cache.set("a", "1".to_string(), 1, None).unwrap();
        cache.handle_memory_pressure();
        assert_eq!(cache.get("a"), Some("1".to_string()));
    }

    struct AllFlagsEnabled;
    impl ConfigFlags for AllFlagsEnabled {
        fn is_enabled(&self, _feature: &str) -> bool {
            true
        }
    }

    #[test]
    fn strict_ttl_flag_hides_expired_entries_from_enumerate() {
        let cache = MemoryCache::with_collaborators(
            MemoryCacheConfig {
                ttl_cache: true,
                age_limit: Some(Duration::from_millis(20)),
                ..Default::default()
            },
            Arc::new(NoopBackgroundTask),
            Arc::new(AllFlagsEnabled),
        )
        .unwrap();

        cache.set("a", "1".to_string(), 0, None).unwrap();
        thread::sleep(Duration::from_millis(60));

        let mut seen = Vec::new();
        cache.enumerate(|k, _| seen.push(k.to_string()));
        assert!(
            seen.is_empty(),
            "expired entry must be hidden under the strict flag"
        );
    }

    #[test]
    fn age_limit_background_timer_trims_without_explicit_call() {
        let cache = cache_with(MemoryCacheConfig {
            age_limit: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        cache.set("a", "1".to_string(), 1, None).unwrap();
        thread::sleep(Duration::from_millis(400));
        assert_eq!(cache.get("a"), None);
    }
}
