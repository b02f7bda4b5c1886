//! Process-wide shared cache instance.
//!
//! A lazily-initialized, process-lifetime singleton built on `OnceLock`
//! rather than relying on implicit load-time initialization.
//!
//! The singleton stores type-erased values (`Arc<dyn Any + Send + Sync>`)
//! since a single process-wide cache cannot be generic over every caller's
//! value type; callers downcast on retrieval.

use std::any::Any;
use std::sync::{Arc, OnceLock};

use crate::cache::MemoryCache;
use crate::config::MemoryCacheConfig;

/// The value type stored in the process-wide [`shared`] cache.
pub type SharedValue = Arc<dyn Any + Send + Sync>;

static SHARED: OnceLock<MemoryCache<SharedValue>> = OnceLock::new();

/// Returns the process-wide cache, constructing it with default
/// configuration on first access.
pub fn shared() -> &'static MemoryCache<SharedValue> {
    SHARED.get_or_init(|| {
        MemoryCache::new(MemoryCacheConfig::default())
            .expect("default shared cache configuration is always valid")
    })
}
