//! Platform background-task collaborator.
//!
//! Host-suspend handling may need to outlive the instant the OS asks the
//! process to suspend, so `remove_all()` triggered from
//! [`crate::cache::MemoryCache::handle_host_suspend`] can finish. On real
//! platforms this wraps an OS-level "please don't suspend me yet" API; here
//! it is a two-method trait the cache treats as an opaque dependency, with
//! a no-op default when no platform integration is injected.

/// Opaque handle returned by [`BackgroundTask::start`] and later passed to
/// [`BackgroundTask::end`].
pub type BackgroundTaskHandle = u64;

/// Extends process lifetime across a bounded unit of work.
pub trait BackgroundTask: Send + Sync {
    /// Requests extra time and returns a handle identifying the request.
    fn start(&self) -> BackgroundTaskHandle;

    /// Signals that the work the matching `start()` was protecting has
    /// finished.
    fn end(&self, handle: BackgroundTaskHandle);
}

/// Default collaborator: grants no extra lifetime. Host-suspend handling
/// still runs synchronously, it just isn't protected from the host
/// terminating the process mid-removal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBackgroundTask;

impl BackgroundTask for NoopBackgroundTask {
    fn start(&self) -> BackgroundTaskHandle {
        0
    }

    fn end(&self, _handle: BackgroundTaskHandle) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_start_and_end_do_not_panic() {
        let task = NoopBackgroundTask;
        let handle = task.start();
        task.end(handle);
    }
}
