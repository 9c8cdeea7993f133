//! Bounded FIFO thread pool.
//!
//! Used for the prepare phase of tablet operations: jobs run in submission
//! order on a fixed set of worker threads, and submissions beyond the queue
//! capacity are rejected instead of blocking the caller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use granite_common::error::{GraniteError, GraniteResult};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueueState {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct Inner {
    name: String,
    capacity: usize,
    queue: Mutex<QueueState>,
    cond: Condvar,
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
}

/// Point-in-time counters of a [`ThreadPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPoolStats {
    pub queued: usize,
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
}

pub struct ThreadPool {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Start `threads` workers. `capacity` bounds the number of queued jobs
    /// (0 = unbounded).
    pub fn new(name: impl Into<String>, threads: usize, capacity: usize) -> GraniteResult<Arc<Self>> {
        if threads == 0 {
            return Err(GraniteError::InvalidArgument(
                "thread pool needs at least one thread".into(),
            ));
        }
        let inner = Arc::new(Inner {
            name: name.into(),
            capacity,
            queue: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        });
        let pool = Arc::new(Self {
            inner,
            threads: Mutex::new(Vec::with_capacity(threads)),
        });
        for i in 0..threads {
            let inner = Arc::clone(&pool.inner);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", pool.inner.name, i))
                .spawn(move || inner.worker_loop())
                .map_err(|e| {
                    tracing::error!(pool = %pool.inner.name, error = %e, "failed to spawn pool thread");
                    GraniteError::ServiceUnavailable(format!("cannot spawn thread: {e}"))
                })?;
            pool.threads.lock().push(handle);
        }
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queue a job. Fails with `ServiceUnavailable` when the queue is full and
    /// `ShutdownInProgress` after `shutdown`.
    pub fn submit(&self, job: Job) -> GraniteResult<()> {
        let mut queue = self.inner.queue.lock();
        if queue.shutdown {
            return Err(GraniteError::ShutdownInProgress(format!(
                "thread pool {} is shut down",
                self.inner.name
            )));
        }
        if self.inner.capacity > 0 && queue.jobs.len() >= self.inner.capacity {
            self.inner.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(GraniteError::ServiceUnavailable(format!(
                "thread pool {} queue is full ({} jobs)",
                self.inner.name, self.inner.capacity
            )));
        }
        queue.jobs.push_back(job);
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
        self.inner.cond.notify_one();
        Ok(())
    }

    pub fn stats(&self) -> ThreadPoolStats {
        ThreadPoolStats {
            queued: self.inner.queue.lock().jobs.len(),
            submitted: self.inner.submitted.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting jobs, run what is already queued, then join the workers.
    pub fn shutdown(&self) {
        {
            let mut queue = self.inner.queue.lock();
            if queue.shutdown {
                return;
            }
            queue.shutdown = true;
            self.inner.cond.notify_all();
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!(pool = %self.inner.name, "pool thread panicked");
            }
        }
        tracing::debug!(pool = %self.inner.name, "thread pool stopped");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn worker_loop(&self) {
        loop {
            let job = {
                let mut queue = self.queue.lock();
                loop {
                    if let Some(job) = queue.jobs.pop_front() {
                        break job;
                    }
                    if queue.shutdown {
                        return;
                    }
                    self.cond.wait(&mut queue);
                }
            };
            job();
            self.completed.fetch_add(1, Ordering::Relaxed);
        }
    }
}
