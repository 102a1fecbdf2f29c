//! A sharded work-stealing thread pool for fine-grained task parallelism.
//!
//! `shardpool` executes short, heterogeneous closures across a fixed set of
//! worker threads with low per-task overhead. Every worker owns one *shard*,
//! a Chase-Lev-style deque whose pops are lock free, and submissions are
//! spread round-robin over the shards, so producers that collide on one
//! shard's lock simply move on to the next instead of blocking. Idle workers
//! park on their home shard and steal from their neighbours when woken.
//!
//! Task closures live in per-shard slab storage rather than individual heap
//! boxes per queue cell, which keeps the allocator out of the hot path, and
//! ring buffers grow by doubling without ever invalidating a concurrent
//! reader.
//!
//! # Panics travel back to you
//!
//! A panic inside a pushed task is caught on the worker and re-raised on the
//! thread that constructed the pool at its next [`push`](ThreadPool::push)
//! or [`wait`](ThreadPool::wait), with the exact payload the task raised.
//! The pool resets itself before re-raising, so it remains usable:
//!
//! ```
//! let pool = shardpool::ThreadPool::with_threads(2);
//! pool.push(|| panic!("worker trouble"));
//! let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| pool.wait()));
//! assert!(caught.is_err());
//! // the same pool keeps working
//! let job = pool.spawn(|| 1 + 1);
//! assert_eq!(job.get(), 2);
//! ```
//!
//! # The global pool
//!
//! Free functions ([`push`], [`spawn`], [`wait`], [`parallel_for`], …)
//! operate on a process-wide pool that is constructed on first use, with one
//! worker per hardware core unless the `THREADS` environment variable says
//! otherwise. The thread that first touches it becomes its owner thread,
//! the one panics surface on. The global pool is deliberately never torn
//! down; the OS reclaims its threads at process exit, which sidesteps the
//! usual shutdown races between thread-local and static destructors.
//!
//! ```
//! let job = shardpool::spawn(|| 21 * 2);
//! assert_eq!(job.get(), 42);
//! shardpool::wait();
//! ```
//!
//! # Synchronization primitives
//!
//! Two latches are exposed for callers that need to sequence their own work:
//! [`FinishLine`], a one-shot countdown barrier, and [`TodoList`], a
//! resettable counting latch that can be stopped (it then looks empty
//! forever) and reset in place. Both carry a panic payload slot so a failure
//! on one thread can be re-raised on a waiter.

use std::any::Any;

use once_cell::sync::Lazy;

mod finish_line;
mod job;
mod manager;
mod mempool;
mod parallel;
mod pool;
mod queue;
mod ring;
mod todo_list;

pub use finish_line::FinishLine;
pub use job::Job;
pub use pool::ThreadPool;
pub use todo_list::TodoList;

/// A boxed task closure as stored in the shards.
pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// What a panicking task leaves behind: the payload handed to
/// `std::panic::resume_unwind` when the failure is surfaced again.
pub type PanicPayload = Box<dyn Any + Send + 'static>;

static GLOBAL: Lazy<ThreadPool> = Lazy::new(|| {
    let threads = std::env::var("THREADS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(num_cpus::get);
    ThreadPool::with_threads(threads)
});

/// The process-wide pool behind the free functions, built on first use.
pub fn global() -> &'static ThreadPool {
    &GLOBAL
}

/// Submits a fire-and-forget task to the global pool.
pub fn push<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    GLOBAL.push(f)
}

/// Submits a task to the global pool and returns a [`Job`] carrying its
/// typed result.
pub fn spawn<F, R>(f: F) -> Job<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    GLOBAL.spawn(f)
}

/// Blocks until every task submitted to the global pool has completed.
pub fn wait() {
    GLOBAL.wait()
}

/// Best-effort removal of global-pool tasks that no worker has started yet.
pub fn clear() {
    GLOBAL.clear()
}

/// Splits `range` across global-pool tasks and returns once all of it ran.
pub fn parallel_for<F>(range: std::ops::Range<usize>, f: F)
where
    F: Fn(usize) + Send + Sync + 'static,
{
    GLOBAL.parallel_for(range, f)
}

/// [`parallel_for`] with an explicit chunk count (`0` picks one).
pub fn parallel_for_chunks<F>(range: std::ops::Range<usize>, chunks: usize, f: F)
where
    F: Fn(usize) + Send + Sync + 'static,
{
    GLOBAL.parallel_for_chunks(range, chunks, f)
}

/// Applies `f` to every item of `items` across global-pool tasks.
pub fn parallel_for_each<I, F>(items: I, f: F)
where
    I: IntoIterator,
    I::Item: Send + 'static,
    F: Fn(I::Item) + Send + Sync + 'static,
{
    GLOBAL.parallel_for_each(items, f)
}

/// Resizes the global pool's set of workers receiving new work.
pub fn set_active_threads(n: usize) {
    GLOBAL.set_active_threads(n)
}
