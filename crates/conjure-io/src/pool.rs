// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Worker threads that run blocking jobs for suspended conjuries.
//!
//! A conjury submits a job, then suspends with no predicate. The worker
//! runs the job and wakes the conjury through its `Waker`; the scheduler
//! picks it up on its next pass.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use conjure::{Conjurer, Waker};
use tracing::{debug, trace, warn};

use crate::error::{IoError, Result};
use crate::job::{Job, PrimJob};
use crate::queue::{SyncQueue, DEFAULT_CAPACITY};

/// Longest a worker sleeps before rechecking its queue.
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// State shared between one worker thread and the pool.
struct WorkerShared {
    queue: SyncQueue<PrimJob>,
    /// Set by `submit`, cleared by the worker before it sleeps.
    work_available: (Mutex<bool>, Condvar),
    stop: AtomicBool,
}

struct Worker {
    shared: Arc<WorkerShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn spawn(id: usize, capacity: usize) -> Self {
        let shared = Arc::new(WorkerShared {
            queue: SyncQueue::with_capacity(capacity),
            work_available: (Mutex::new(false), Condvar::new()),
            stop: AtomicBool::new(false),
        });
        let s = shared.clone();
        let thread = thread::Builder::new()
            .name(format!("conjure-io-{}", id))
            .spawn(move || worker_loop(id, &s))
            .expect("failed to spawn I/O worker thread");
        Self {
            shared,
            thread: Some(thread),
        }
    }

    fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    fn notify(&self) {
        let (lock, cvar) = &self.shared.work_available;
        *lock.lock().unwrap() = true;
        cvar.notify_one();
    }
}

fn worker_loop(id: usize, shared: &WorkerShared) {
    debug!(worker = id, "I/O worker started");
    loop {
        if let Some(job) = shared.queue.pop() {
            trace!(worker = id, "running job");
            if panic::catch_unwind(AssertUnwindSafe(|| job.call())).is_err() {
                warn!(worker = id, "job panicked");
            }
            continue;
        }

        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        let (lock, cvar) = &shared.work_available;
        let mut ready = lock.lock().unwrap();
        // Work may have arrived between the pop and taking the lock.
        if *ready || !shared.queue.is_empty() {
            *ready = false;
            continue;
        }
        let result = cvar.wait_timeout(ready, IDLE_WAIT).unwrap();
        ready = result.0;
        *ready = false;
    }
    debug!(worker = id, "I/O worker stopped");
}

/// Worker side of `WorkerPool::run`. Dropping it, whether the job finished
/// or unwound, releases the result slot and then wakes the waiting conjury.
struct Completion<J> {
    slot: Option<Arc<Mutex<Option<J>>>>,
    waker: Option<Waker>,
}

impl<J> Completion<J> {
    fn fill(&self, job: J) {
        if let Some(slot) = &self.slot {
            *slot.lock().unwrap() = Some(job);
        }
    }
}

impl<J> Drop for Completion<J> {
    fn drop(&mut self) {
        drop(self.slot.take());
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// Fixed set of worker threads, each with its own bounded queue.
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Start `n` workers. If `n` is 0, one per available CPU core.
    pub fn new(n: usize) -> Self {
        Self::with_capacity(n, DEFAULT_CAPACITY)
    }

    /// Like `new`, with `queue_capacity` slots per worker (rounded up to a
    /// power of two).
    pub fn with_capacity(n: usize, queue_capacity: usize) -> Self {
        let count = if n == 0 {
            thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4)
        } else {
            n
        };
        let workers = (0..count)
            .map(|id| Worker::spawn(id, queue_capacity))
            .collect();
        Self { workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue `job` on the worker with the fewest pending jobs.
    pub fn submit(&self, job: PrimJob) -> Result<()> {
        let mut order: Vec<&Worker> = self.workers.iter().collect();
        order.sort_by_key(|w| w.pending());
        let mut job = job;
        for worker in order {
            match worker.shared.queue.push(job) {
                Ok(()) => {
                    worker.notify();
                    return Ok(());
                }
                Err(rejected) => job = rejected,
            }
        }
        Err(IoError::QueueFull)
    }

    /// Run `job` on a worker while the active conjury is suspended, and
    /// return its output.
    pub fn run<J: Job>(&self, conjurer: &Conjurer, job: J) -> Result<J::Output> {
        let slot: Arc<Mutex<Option<J>>> = Arc::new(Mutex::new(None));
        let done = Completion {
            slot: Some(slot.clone()),
            waker: Some(conjurer.waker()),
        };
        self.submit(PrimJob::new(move || {
            let mut job = job;
            job.handle();
            done.fill(job);
        }))?;

        loop {
            // Sampled before the slot: the worker fills it before letting go.
            let orphaned = Arc::strong_count(&slot) == 1;
            if let Some(job) = slot.lock().unwrap().take() {
                return Ok(job.into_output());
            }
            if orphaned {
                return Err(IoError::Lost);
            }
            conjurer.suspend()?;
        }
    }

    /// Stop every worker after it drains its queue, and join them.
    pub fn shutdown(&mut self) {
        for worker in &self.workers {
            worker.shared.stop.store(true, Ordering::Release);
            worker.notify();
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.thread.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
