//! Fixed-size pool of OS threads for blocking units of work.
//!
//! Inference calls may block for tens of milliseconds, so they run on
//! dedicated pool threads rather than the async runtime. Each submitted unit
//! of work executes at most once, on whichever worker becomes idle first; no
//! ordering is guaranteed across workers. Callers that need ordered results
//! track identity through the batch and channel ids carried in the work
//! itself, not through queue order.
//!
//! A panicking work item is caught and delivered through its handle as
//! [`WorkerError::Panicked`]; the worker thread survives and picks up the
//! next item.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, error, info};

/// Errors surfaced to callers of the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is shutting down")]
    ShuttingDown,
}

/// Failure of one unit of work, delivered through its handle.
#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    #[error("work item panicked: {0}")]
    Panicked(String),
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    queue: Mutex<VecDeque<Job>>,
    work_available: Condvar,
    shutting_down: AtomicBool,
    jobs_completed: AtomicU64,
    jobs_faulted: AtomicU64,
}

/// Completion handle for one submitted unit of work.
///
/// The result is delivered exactly once; both `wait` and `try_take` consume
/// it.
pub struct TaskHandle<T> {
    shared: Arc<TaskShared<T>>,
}

struct TaskShared<T> {
    slot: Mutex<TaskSlot<T>>,
    done: Condvar,
}

enum TaskSlot<T> {
    Pending,
    Ready(Result<T, WorkerError>),
    Taken,
}

impl<T> TaskHandle<T> {
    fn new() -> (Self, Arc<TaskShared<T>>) {
        let shared = Arc::new(TaskShared {
            slot: Mutex::new(TaskSlot::Pending),
            done: Condvar::new(),
        });
        (
            Self {
                shared: shared.clone(),
            },
            shared,
        )
    }

    /// Block until the work completes and take its result.
    pub fn wait(self) -> Result<T, WorkerError> {
        let mut slot = self.shared.slot.lock();
        loop {
            match std::mem::replace(&mut *slot, TaskSlot::Taken) {
                TaskSlot::Ready(result) => return result,
                TaskSlot::Pending => {
                    *slot = TaskSlot::Pending;
                    self.shared.done.wait(&mut slot);
                }
                TaskSlot::Taken => unreachable!("task result taken twice"),
            }
        }
    }

    /// Take the result if the work has completed, without blocking.
    pub fn try_take(&self) -> Option<Result<T, WorkerError>> {
        let mut slot = self.shared.slot.lock();
        match std::mem::replace(&mut *slot, TaskSlot::Taken) {
            TaskSlot::Ready(result) => Some(result),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Whether a result is ready (or already taken).
    pub fn is_finished(&self) -> bool {
        !matches!(*self.shared.slot.lock(), TaskSlot::Pending)
    }
}

impl<T> TaskShared<T> {
    fn complete(&self, result: Result<T, WorkerError>) {
        let mut slot = self.slot.lock();
        *slot = TaskSlot::Ready(result);
        self.done.notify_all();
    }
}

/// Pool of execution threads accepting arbitrary units of work.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `num_threads` workers (at least 1).
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            work_available: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            jobs_completed: AtomicU64::new(0),
            jobs_faulted: AtomicU64::new(0),
        });

        let mut threads = Vec::with_capacity(num_threads);
        for worker_id in 0..num_threads {
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("gridwatch-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, shared))
                .expect("failed to spawn worker thread");
            threads.push(handle);
        }

        info!(num_threads, "Worker pool started");

        Self {
            shared,
            threads: Mutex::new(threads),
        }
    }

    /// Enqueue a unit of work, returning a handle to its eventual result.
    ///
    /// Fails once shutdown has begun; already-queued work still drains.
    pub fn submit<F, T>(&self, work: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }

        let (handle, task) = TaskHandle::new();
        let shared = self.shared.clone();
        let job: Job = Box::new(move || {
            match catch_unwind(AssertUnwindSafe(work)) {
                Ok(value) => task.complete(Ok(value)),
                Err(panic) => {
                    let msg = panic_message(panic);
                    error!(error = %msg, "Work item panicked");
                    shared.jobs_faulted.fetch_add(1, Ordering::Relaxed);
                    task.complete(Err(WorkerError::Panicked(msg)));
                }
            }
        });

        {
            let mut queue = self.shared.queue.lock();
            // Re-check under the lock so no job lands after shutdown drained
            // the queue.
            if self.shared.shutting_down.load(Ordering::SeqCst) {
                return Err(PoolError::ShuttingDown);
            }
            queue.push_back(job);
        }
        self.shared.work_available.notify_one();

        Ok(handle)
    }

    /// Number of units of work waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Total units of work that ran to completion (including faulted ones).
    pub fn completed(&self) -> u64 {
        self.shared.jobs_completed.load(Ordering::Relaxed)
    }

    /// Total units of work that panicked while executing.
    pub fn faulted(&self) -> u64 {
        self.shared.jobs_faulted.load(Ordering::Relaxed)
    }

    /// Stop accepting new work, drain already-queued work, and join all
    /// worker threads. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.work_available.notify_all();

        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                // Worker loops catch job panics, so this indicates a bug in
                // the loop itself.
                error!("Worker thread exited abnormally");
            }
        }

        info!(
            completed = self.completed(),
            faulted = self.faulted(),
            "Worker pool shut down"
        );
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(worker_id: usize, shared: Arc<PoolShared>) {
    debug!(worker_id, "Worker started");
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                if shared.shutting_down.load(Ordering::SeqCst) {
                    debug!(worker_id, "Worker stopping");
                    return;
                }
                shared.work_available.wait(&mut queue);
            }
        };

        job();
        shared.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
