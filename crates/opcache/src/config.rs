//! Cache configuration and the configuration-flag collaborator.

use std::collections::HashMap;
use std::time::Duration;

/// Construction-time and mutable runtime options for a
/// [`crate::cache::MemoryCache`].
///
/// `cost_limit` and `age_limit` may be changed after construction through
/// [`crate::cache::MemoryCache::set_cost_limit`] /
/// [`crate::cache::MemoryCache::set_age_limit`]; `name` and `ttl_cache` are
/// fixed at construction.
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    /// Optional identifier, construction-time only.
    pub name: Option<String>,
    /// `0` disables cost-based trimming.
    pub cost_limit: u64,
    /// `None`/zero disables age-based trimming and the background timer.
    pub age_limit: Option<Duration>,
    /// Construction-time only: whether `get` treats expired entries as
    /// absent instead of extending their lifetime on touch.
    pub ttl_cache: bool,
    pub remove_all_on_memory_pressure: bool,
    pub remove_all_on_host_suspend: bool,
    /// Construction-time only: worker count for the priority operation
    /// queue backing the async accessors.
    pub max_concurrent_operations: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            name: None,
            cost_limit: 0,
            age_limit: None,
            ttl_cache: false,
            remove_all_on_memory_pressure: true,
            remove_all_on_host_suspend: true,
            max_concurrent_operations: 4,
        }
    }
}

/// Boolean feature-flag lookup, the injected configuration collaborator.
///
/// Read once at cache construction via [`ConfigFlags::snapshot`] and cached;
/// the cache never calls back into this trait after construction.
pub trait ConfigFlags: Send + Sync {
    fn is_enabled(&self, feature: &str) -> bool;

    /// Captures the flags this cache cares about into an owned snapshot.
    /// The default implementation asks `is_enabled` for each name in
    /// `features`; implementors backed by a cheap in-memory map may want to
    /// override this to snapshot everything at once instead.
    fn snapshot(&self, features: &[&str]) -> HashMap<String, bool> {
        features
            .iter()
            .map(|f| (f.to_string(), self.is_enabled(f)))
            .collect()
    }
}

/// Default configuration collaborator: every feature flag reads as `false`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopConfigFlags;

impl ConfigFlags for NoopConfigFlags {
    fn is_enabled(&self, _feature: &str) -> bool {
        false
    }
}
