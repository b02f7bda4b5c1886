//! Error taxonomy for construction and validation failures.
//!
//! Most runtime mistakes in this library (cancelling a handle twice, setting
//! the priority of a handle that already finished) are defined as silent
//! no-ops rather than errors — see the scheduler and cache module docs. The
//! variants here cover the cases treated as real failures: argument
//! validation at construction time, and resource exhaustion when spinning up
//! the worker pool.

/// Errors produced by [`crate::scheduler::OperationQueue`] and
/// [`crate::cache::MemoryCache`] construction and validation.
#[derive(Debug, thiserror::Error)]
pub enum OpCacheError {
    /// An argument failed validation (non-positive per-entry age limit, a
    /// worker pool size of zero, ...).
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Human-readable description of what was wrong.
        message: String,
    },

    /// The underlying execution substrate refused to provide a resource
    /// (typically: the OS refused to spawn a worker thread).
    #[error("resource exhausted: {message}")]
    ResourceExhausted {
        /// Human-readable description of the exhausted resource.
        message: String,
    },
}

impl OpCacheError {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: message.into(),
        }
    }
}
