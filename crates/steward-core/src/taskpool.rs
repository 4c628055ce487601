//! Bounded worker pool with per-job cooperative cancellation.
//!
//! Jobs are keyed; submitting a key that is already queued or running is
//! refused so that redelivered messages never execute twice. Each job owns a
//! [`CancelFlag`] that carries two signals, cancel and shutdown. Consumers
//! poll the flag before each expensive step; nothing is aborted mid-step.
//!
//! Job start order is FIFO relative to submission. Completion order is
//! whatever the jobs make of it.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Observable state of a job's cancel flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    /// No signal raised.
    Running,
    /// The job was cancelled by a cancel command.
    Canceled,
    /// The pool is shutting down.
    ShutDown,
}

/// Cooperative cancellation handle shared between a job and the pool.
///
/// The flag is set at most once; a later signal does not downgrade an
/// earlier one back to running.
#[derive(Debug)]
pub struct CancelFlag {
    state: Mutex<CancelState>,
    signal: Condvar,
}

impl CancelFlag {
    /// Creates a flag in the running state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CancelState::Running),
            signal: Condvar::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CancelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the cancel signal has been raised.
    #[must_use]
    pub fn canceled(&self) -> bool {
        *self.lock_state() == CancelState::Canceled
    }

    /// Whether the shutdown signal has been raised.
    #[must_use]
    pub fn shut_down(&self) -> bool {
        *self.lock_state() == CancelState::ShutDown
    }

    /// Current state of the flag.
    #[must_use]
    pub fn state(&self) -> CancelState {
        *self.lock_state()
    }

    /// Raises `next` and wakes all waiters. Running flags only; a flag that
    /// is already cancelled or shutting down keeps its first signal.
    pub fn set(&self, next: CancelState) {
        let mut state = self.lock_state();
        if *state == CancelState::Running {
            *state = next;
            self.signal.notify_all();
        }
    }

    /// Blocks until a signal is raised, returning it.
    #[must_use]
    pub fn wait(&self) -> CancelState {
        let mut state = self.lock_state();
        while *state == CancelState::Running {
            state = self
                .signal
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *state
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The key is already queued or executing.
    #[error("job with id {key} is already queued or running in pool {pool}")]
    DuplicateJob {
        /// Offending job key.
        key: String,
        /// Pool name.
        pool: String,
    },

    /// The pool has been shut down and refuses new work.
    #[error("pool {0} is shut down")]
    PoolClosed(String),

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

type Job = Box<dyn FnOnce(&CancelFlag) + Send + 'static>;

struct QueuedJob {
    key: String,
    flag: Arc<CancelFlag>,
    work: Job,
}

/// Bounded set of concurrent job slots keyed by job id.
pub struct TaskPool {
    name: String,
    sender: Mutex<Option<Sender<QueuedJob>>>,
    active: Arc<Mutex<HashMap<String, Arc<CancelFlag>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskPool {
    /// Creates a pool with `size` worker threads.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Spawn`] when a worker thread cannot be started.
    pub fn new(name: &str, size: usize) -> Result<Self, PoolError> {
        let (sender, receiver) = mpsc::channel::<QueuedJob>();
        let receiver = Arc::new(Mutex::new(receiver));
        let active: Arc<Mutex<HashMap<String, Arc<CancelFlag>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = Arc::clone(&receiver);
            let active = Arc::clone(&active);
            let pool_name = name.to_string();
            let handle = thread::Builder::new()
                .name(format!("{name}-worker-{index}"))
                .spawn(move || worker_loop(&pool_name, &receiver, &active))
                .map_err(PoolError::Spawn)?;
            workers.push(handle);
        }

        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            active,
            workers: Mutex::new(workers),
        })
    }

    /// Pool name, used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues `work` under `key`.
    ///
    /// # Errors
    ///
    /// - [`PoolError::DuplicateJob`] when the key is already queued or
    ///   executing.
    /// - [`PoolError::PoolClosed`] after [`TaskPool::shutdown`].
    pub fn submit(
        &self,
        key: &str,
        work: impl FnOnce(&CancelFlag) + Send + 'static,
    ) -> Result<(), PoolError> {
        let flag = Arc::new(CancelFlag::new());
        {
            let mut active = lock(&self.active);
            if active.contains_key(key) {
                return Err(PoolError::DuplicateJob {
                    key: key.to_string(),
                    pool: self.name.clone(),
                });
            }
            active.insert(key.to_string(), Arc::clone(&flag));
        }

        let queued = QueuedJob {
            key: key.to_string(),
            flag,
            work: Box::new(work),
        };

        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sent = sender
            .as_ref()
            .ok_or_else(|| PoolError::PoolClosed(self.name.clone()))
            .and_then(|tx| {
                tx.send(queued)
                    .map_err(|_| PoolError::PoolClosed(self.name.clone()))
            });
        if sent.is_err() {
            lock(&self.active).remove(key);
        }
        sent
    }

    /// Raises the cancel signal on the job queued or running under `key`.
    ///
    /// Returns whether such a job was found. A job that has already
    /// returned is gone; cancelling it reports `false`.
    #[must_use]
    pub fn cancel(&self, key: &str) -> bool {
        match lock(&self.active).get(key) {
            Some(flag) => {
                debug!(pool = %self.name, key, "raising cancel signal");
                flag.set(CancelState::Canceled);
                true
            },
            None => false,
        }
    }

    /// Number of jobs currently queued or executing.
    #[must_use]
    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    /// Refuses new submits, raises shutdown on every live job, and waits up
    /// to `timeout` for the workers to drain.
    ///
    /// Returns whether all workers finished within the deadline; stragglers
    /// are detached.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        for flag in lock(&self.active).values() {
            flag.set(CancelState::ShutDown);
        }

        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let deadline = Instant::now() + timeout;
        while handles.iter().any(|h| !h.is_finished()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        let all_finished = handles.iter().all(JoinHandle::is_finished);
        if !all_finished {
            warn!(pool = %self.name, "shutdown deadline expired with jobs still running");
        }
        for handle in handles {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
        all_finished
    }
}

fn lock<'a>(
    active: &'a Mutex<HashMap<String, Arc<CancelFlag>>>,
) -> MutexGuard<'a, HashMap<String, Arc<CancelFlag>>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

fn worker_loop(
    pool_name: &str,
    receiver: &Mutex<Receiver<QueuedJob>>,
    active: &Mutex<HashMap<String, Arc<CancelFlag>>>,
) {
    loop {
        // Hold the receiver lock only while picking up the next job so the
        // other workers can keep draining the queue.
        let next = {
            let guard = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            guard.recv()
        };
        let Ok(job) = next else {
            break;
        };

        debug!(pool = pool_name, key = %job.key, "job starting");
        (job.work)(&job.flag);
        active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job.key);
        debug!(pool = pool_name, key = %job.key, "job finished");
    }
}
