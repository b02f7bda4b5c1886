// opcache: concurrent in-process key/value cache with a priority operation scheduler.

pub mod cache;
pub mod config;
pub mod error;
pub mod host;
pub mod observer;
pub mod scheduler;
pub mod shared;

pub use cache::MemoryCache;
pub use config::{ConfigFlags, MemoryCacheConfig, NoopConfigFlags};
pub use error::OpCacheError;
pub use host::{BackgroundTask, BackgroundTaskHandle, NoopBackgroundTask};
pub use observer::{
    KeyChangeKind, KeyChangeNotification, KeyObserverRegistry, ObserverId, ObserverToken,
};
pub use scheduler::{OperationHandle, OperationQueue, Priority};
pub use shared::{shared, SharedValue};
