//! Priority operation queue — a bounded worker pool with three priority bands.
//!
//! ## Design
//!
//! `OperationQueue` spawns `max_concurrent_operations` dedicated OS threads
//! at construction. Each worker loops: lock the shared band state, pop the
//! highest-priority record available (High, then Default, then Low; FIFO
//! within a band), release the lock, run the closure, repeat. When no work
//! is available a worker parks on a `Condvar` until `submit` signals it.
//!
//! Workers are dedicated threads parked on `Mutex` + `Condvar` rather than
//! tasks on an async runtime, so submitted closures run on plain OS threads
//! with no executor to configure.
//!
//! ## Thread safety
//!
//! All state shared between `submit`/`cancel`/`set_priority` and the worker
//! threads lives behind one `Mutex<Inner>` plus one `Condvar`. No `unsafe`
//! code is used.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::OpCacheError;

/// Relative importance of a submitted work unit.
///
/// Ordered `Low < Default < High` — the derived `Ord` impl is used directly
/// to pick the highest-priority non-empty band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low,
    #[default]
    Default,
    High,
}

const BAND_COUNT: usize = 3;

fn band_index(priority: Priority) -> usize {
    match priority {
        Priority::High => 0,
        Priority::Default => 1,
        Priority::Low => 2,
    }
}

/// Opaque handle to a submitted work unit, returned by [`OperationQueue::submit`].
///
/// Handles are unique for the lifetime of the queue that issued them; using
/// a handle with a different queue instance is not meaningful (there is no
/// cross-queue handle validation — see [`OperationQueue::cancel`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationHandle(u64);

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;
type CancelFlag = Arc<AtomicBool>;

struct Record {
    handle: OperationHandle,
    priority: Priority,
    cancelled: CancelFlag,
    job: Job,
}

struct Inner {
    bands: [VecDeque<Record>; BAND_COUNT],
    /// Handles currently dequeued and owned by a worker (about to run, or
    /// running), mapped to their cancellation flag so a late `cancel` can
    /// still reach them before the worker's pre-invocation check.
    in_flight: HashMap<u64, CancelFlag>,
    shutdown: bool,
}

impl Inner {
    fn queued_and_in_flight_handles(&self) -> HashSet<u64> {
        let mut handles: HashSet<u64> = self.in_flight.keys().copied().collect();
        for band in &self.bands {
            handles.extend(band.iter().map(|r| r.handle.0));
        }
        handles
    }
}

/// A bounded-concurrency, three-priority-band work scheduler.
///
/// Construct with [`OperationQueue::new`]. Dropping the queue joins all
/// worker threads after letting already-dispatched work drain; queued work
/// that never started is silently discarded.
pub struct OperationQueue {
    inner: Arc<(Mutex<Inner>, Condvar)>,
    next_handle: Arc<AtomicU64>,
    workers: Vec<std::thread::JoinHandle<()>>,
    max_concurrent_operations: usize,
}

impl fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationQueue")
            .field("max_concurrent_operations", &self.max_concurrent_operations)
            .finish()
    }
}

impl OperationQueue {
    /// Creates a queue backed by `max_concurrent_operations` dedicated
    /// worker threads (minimum 1 — see [`OpCacheError::InvalidArgument`]
    /// for `0`).
    ///
    /// # Errors
    ///
    /// Returns [`OpCacheError::InvalidArgument`] if `max_concurrent_operations`
    /// is `0`, and [`OpCacheError::ResourceExhausted`] if the OS refuses to
    /// spawn one of the worker threads.
    pub fn new(max_concurrent_operations: usize) -> Result<Self, OpCacheError> {
        if max_concurrent_operations == 0 {
            return Err(OpCacheError::invalid_argument(
                "max_concurrent_operations must be >= 1",
            ));
        }

        let inner = Arc::new((
            Mutex::new(Inner {
                bands: Default::default(),
                in_flight: HashMap::new(),
                shutdown: false,
            }),
            Condvar::new(),
        ));

        let mut workers = Vec::with_capacity(max_concurrent_operations);
        for worker_id in 0..max_concurrent_operations {
            let shared = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("opcache-worker-{worker_id}"))
                .spawn(move || worker_loop(shared))
                .map_err(|e| {
                    OpCacheError::resource_exhausted(format!(
                        "failed to spawn worker thread {worker_id}: {e}"
                    ))
                })?;
            workers.push(handle);
        }

        tracing::debug!(
            workers = max_concurrent_operations,
            "operation queue started"
        );

        Ok(Self {
            inner,
            next_handle: Arc::new(AtomicU64::new(1)),
            workers,
            max_concurrent_operations,
        })
    }

    /// The configured worker count.
    pub fn max_concurrent_operations(&self) -> usize {
        self.max_concurrent_operations
    }

    /// Admits `job` into the band for `priority` and returns a handle that
    /// can later be passed to [`cancel`](Self::cancel) or
    /// [`set_priority`](Self::set_priority).
    pub fn submit<F>(&self, priority: Priority, job: F) -> OperationHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = OperationHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let record = Record {
            handle,
            priority,
            cancelled: Arc::new(AtomicBool::new(false)),
            job: Box::new(job),
        };

        let (lock, cvar) = &*self.inner;
        let mut inner = lock.lock().expect("operation queue mutex poisoned");
        inner.bands[band_index(priority)].push_back(record);
        cvar.notify_one();

        handle
    }

    /// Moves `handle`'s record to the tail of `new_priority`'s band if it is
    /// still queued. No-op if the handle is already running,
    /// already completed, or unknown to this queue.
    pub fn set_priority(&self, handle: OperationHandle, new_priority: Priority) {
        let (lock, _) = &*self.inner;
        let mut inner = lock.lock().expect("operation queue mutex poisoned");
        for band in inner.bands.iter_mut() {
            if let Some(pos) = band.iter().position(|r| r.handle == handle) {
                let mut record = band.remove(pos).expect("position just found");
                record.priority = new_priority;
                inner.bands[band_index(new_priority)].push_back(record);
                return;
            }
        }
        // Not queued: already running, already completed, or unknown handle.
        // All three are silent no-ops.
    }

    /// Marks `handle` cancelled. Idempotent. If still queued the record is
    /// removed immediately; if already dispatched to a worker, the worker
    /// checks the flag right before invoking the closure and drops the
    /// work instead of running it.
    pub fn cancel(&self, handle: OperationHandle) {
        let (lock, cvar) = &*self.inner;
        let mut inner = lock.lock().expect("operation queue mutex poisoned");
        for band in inner.bands.iter_mut() {
            if let Some(pos) = band.iter().position(|r| r.handle == handle) {
                let record = band.remove(pos).expect("position just found");
                record.cancelled.store(true, Ordering::SeqCst);
                cvar.notify_all();
                return;
            }
        }
        if let Some(flag) = inner.in_flight.get(&handle.0) {
            // Already dequeued by a worker: set the flag so the
            // pre-invocation check (if it hasn't run yet) skips the job.
            // A no-op if the job has already started (non-preemptive).
            flag.store(true, Ordering::SeqCst);
        }
        // Otherwise: already completed, or unknown handle — no-op.
    }

    /// Sets the cancellation flag on every currently queued record and
    /// empties all bands. Running work units are unaffected.
    pub fn cancel_all(&self) {
        let (lock, cvar) = &*self.inner;
        let mut inner = lock.lock().expect("operation queue mutex poisoned");
        for band in inner.bands.iter_mut() {
            for record in band.drain(..) {
                record.cancelled.store(true, Ordering::SeqCst);
            }
        }
        cvar.notify_all();
    }

    /// Blocks until every record queued or in-flight at the moment of the
    /// call has completed (cancellation counts as completion). Snapshot
    /// semantics: work submitted after this call begins is not waited on,
    /// even if it completes before some of the snapshotted work does.
    pub fn wait_until_all_finished(&self) {
        let (lock, cvar) = &*self.inner;
        let mut inner = lock.lock().expect("operation queue mutex poisoned");
        let target = inner.queued_and_in_flight_handles();
        if target.is_empty() {
            return;
        }
        loop {
            let still_pending = inner.in_flight.keys().any(|h| target.contains(h))
                || inner
                    .bands
                    .iter()
                    .any(|band| band.iter().any(|r| target.contains(&r.handle.0)));
            if !still_pending {
                return;
            }
            inner = cvar.wait(inner).expect("operation queue condvar poisoned");
        }
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        {
            let (lock, cvar) = &*self.inner;
            let mut inner = lock.lock().expect("operation queue mutex poisoned");
            inner.shutdown = true;
            cvar.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<(Mutex<Inner>, Condvar)>) {
    let (lock, cvar) = &*shared;
    loop {
        let record = {
            let mut inner = lock.lock().expect("operation queue mutex poisoned");
            loop {
                if let Some(record) = pop_highest_priority(&mut inner) {
                    inner
                        .in_flight
                        .insert(record.handle.0, Arc::clone(&record.cancelled));
                    break Some(record);
                }
                if inner.shutdown {
                    break None;
                }
                inner = cvar.wait(inner).expect("operation queue condvar poisoned");
            }
        };

        let Some(record) = record else {
            return;
        };

        if !record.cancelled.load(Ordering::SeqCst) {
            let handle = record.handle;
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(record.job)) {
                tracing::warn!(%handle, "operation panicked; treated as completed");
                drop(panic);
            }
        }

        let mut inner = lock.lock().expect("operation queue mutex poisoned");
        inner.in_flight.remove(&record.handle.0);
        cvar.notify_all();
    }
}

fn pop_highest_priority(inner: &mut Inner) -> Option<Record> {
    for band in inner.bands.iter_mut() {
        if let Some(record) = band.pop_front() {
            return Some(record);
        }
    }
    None
}
