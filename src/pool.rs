use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::job::{self, Job};
use crate::manager::TaskManager;
use crate::mempool::TaskHold;

/// A work-stealing thread pool.
///
/// Tasks go in through [`push`](Self::push) (fire-and-forget) or
/// [`spawn`](Self::spawn) (typed result); [`wait`](Self::wait) blocks until
/// everything submitted so far has run. A panic inside a pushed task is
/// captured on the worker and re-raised on the thread that constructed the
/// pool, at its next `push` or `wait`; by then the pool has been reset
/// and stays usable.
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicU64, Ordering};
/// use std::sync::Arc;
///
/// let pool = shardpool::ThreadPool::new();
/// let hits = Arc::new(AtomicU64::new(0));
/// for _ in 0..100 {
///     let hits = hits.clone();
///     pool.push(move || {
///         hits.fetch_add(1, Ordering::Relaxed);
///     });
/// }
/// pool.wait();
/// assert_eq!(hits.load(Ordering::Relaxed), 100);
/// ```
pub struct ThreadPool {
    manager: Arc<TaskManager>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Creates a pool with one worker per available hardware core.
    pub fn new() -> Self {
        Self::with_threads(num_cpus::get())
    }

    /// Creates a pool with `n` worker threads.
    ///
    /// With `n == 0` no threads are spawned and every submission runs
    /// synchronously on the caller.
    pub fn with_threads(n: usize) -> Self {
        let manager = Arc::new(TaskManager::new(n));
        log::debug!("spawning thread pool with {n} workers");
        let workers = (0..n)
            .map(|id| {
                let manager = manager.clone();
                thread::Builder::new()
                    .name(format!("shard-wkr-{id}"))
                    .spawn(move || worker_loop(&manager, id))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self { manager, workers }
    }

    /// Number of worker threads owned by the pool.
    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Number of workers currently receiving pushed work.
    pub fn active_threads(&self) -> usize {
        if self.workers.is_empty() {
            0
        } else {
            self.manager.active()
        }
    }

    /// Submits a fire-and-forget task.
    ///
    /// Re-raises here if an earlier task panicked and this is the owner
    /// thread (the pool resets itself first, so it remains usable).
    pub fn push<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.workers.is_empty() {
            return f();
        }
        self.manager.push(Box::new(f));
    }

    /// Submits a task and returns a [`Job`] carrying its typed result.
    ///
    /// A panic inside `f` is delivered through [`Job::get`], not through the
    /// pool's own error path.
    pub fn spawn<F, R>(&self, f: F) -> Job<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (job, promise) = job::pair();
        self.push(move || {
            promise.fulfill(catch_unwind(AssertUnwindSafe(f)));
        });
        job
    }

    /// Blocks until every task submitted so far has completed; re-raises the
    /// first captured panic when called from the owner thread.
    pub fn wait(&self) {
        self.manager.wait_for_finish(None);
    }

    /// Best-effort removal of tasks that no worker has started yet.
    pub fn clear(&self) {
        self.manager.clear();
    }

    /// Resizes the set of workers receiving new work to `n`, clamped to
    /// `[1, threads()]`; surplus workers simply stay parked.
    pub fn set_active_threads(&self, n: usize) {
        self.manager.set_active(n);
    }

    pub(crate) fn manager(&self) -> &TaskManager {
        &self.manager
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.manager.stop();
        for worker in self.workers.drain(..) {
            // a worker that died of a bug must not take the owner with it
            let _ = worker.join();
        }
    }
}

fn worker_loop(manager: &TaskManager, home: usize) {
    while !manager.is_stopped() {
        manager.wait_for_jobs(home);
        loop {
            // inner loop saves re-reading the todo counter per task
            while let Some(hold) = manager.try_pop(home) {
                execute_safely(hold, manager);
            }
            if manager.done() {
                break;
            }
        }
    }
}

/// Runs a claimed task, reporting the outcome to the manager. Only a task
/// that returns normally crosses the todo list; a panicking one trips the
/// error path, which stops the list instead.
pub(crate) fn execute_safely(hold: TaskHold, manager: &TaskManager) {
    match catch_unwind(AssertUnwindSafe(|| hold.run())) {
        Ok(()) => manager.report_success(),
        Err(payload) => manager.report_fail(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn zero_workers_run_inline() {
        let pool = ThreadPool::with_threads(0);
        let hits = Arc::new(AtomicU64::new(0));
        let current = thread::current().id();
        {
            let hits = hits.clone();
            pool.push(move || {
                assert_eq!(thread::current().id(), current);
                hits.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        // nothing outstanding, wait is a no-op
        pool.wait();
        assert_eq!(pool.threads(), 0);
        assert_eq!(pool.active_threads(), 0);
    }

    #[test]
    fn zero_worker_panics_propagate_synchronously() {
        let pool = ThreadPool::with_threads(0);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pool.push(|| panic!("inline failure"));
        }));
        let payload = result.unwrap_err();
        assert_eq!(*payload.downcast_ref::<&str>().unwrap(), "inline failure");
    }

    #[test]
    fn drop_joins_workers_with_tasks_in_flight() {
        let hits = Arc::new(AtomicU64::new(0));
        {
            let pool = ThreadPool::with_threads(2);
            for _ in 0..100 {
                let hits = hits.clone();
                pool.push(move || {
                    hits.fetch_add(1, Ordering::Relaxed);
                });
            }
            // dropped without wait: in-flight tasks finish, the rest may be
            // discarded, and the drop must not hang either way
        }
    }

    #[test]
    fn workers_are_named() {
        let pool = ThreadPool::with_threads(1);
        let job = pool.spawn(|| thread::current().name().map(str::to_owned));
        assert_eq!(job.get().as_deref(), Some("shard-wkr-0"));
    }
}
