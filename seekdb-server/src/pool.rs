//! Worker pool.
//!
//! A fixed set of OS threads drains a blocking [`BoundedQueue`] of jobs.
//! Request handlers run here so they may block on the database or the
//! filesystem without stalling the event loops. Dispatch is FIFO.

use crate::queue::{BoundedQueue, Pop};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Bounded pool of handler threads.
pub struct WorkerPool {
    queue: Arc<BoundedQueue<Job>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Starts `threads` workers sharing one queue of `capacity` jobs.
    pub fn new(name: &str, threads: usize, capacity: usize) -> Self {
        let queue = Arc::new(BoundedQueue::blocking(capacity));
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let queue = queue.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || worker_loop(queue))
                .unwrap_or_else(|e| panic!("cannot spawn worker thread: {e}"));
            handles.push(handle);
        }
        Self {
            queue,
            threads: Mutex::new(handles),
        }
    }

    /// Enqueues a job. Returns false once the pool has been shut down;
    /// callers treat a refusal as fatal.
    pub fn spawn<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.push(Box::new(job))
    }

    /// Number of jobs waiting for a thread.
    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    /// Finishes the queue and, once the remaining jobs drain, joins every
    /// worker thread.
    pub fn shutdown(&self) {
        self.queue.finish();
        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(queue: Arc<BoundedQueue<Job>>) {
    loop {
        match queue.pop(None) {
            Pop::Item(job) => {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("worker job panicked");
                }
            }
            Pop::Finished => break,
            Pop::TimedOut => unreachable!("untimed pop cannot time out"),
        }
    }
}
