use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::PanicPayload;

/// A one-shot countdown barrier.
///
/// Lets some threads wait until others reach a control point: declare runners
/// up front or via [`start`](Self::start)/[`add`](Self::add), cross with
/// [`cross`](Self::cross), and block on [`wait`](Self::wait) until everyone
/// has crossed or the race was aborted with a panic payload.
///
/// A finish line is not reusable: once `wait` has returned, construct a fresh
/// one for the next round.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use shardpool::FinishLine;
///
/// let line = Arc::new(FinishLine::new(2));
/// for _ in 0..2 {
///     let line = line.clone();
///     std::thread::spawn(move || line.cross());
/// }
/// line.wait();
/// ```
pub struct FinishLine {
    runners: CachePadded<AtomicI64>,
    fault: Mutex<Option<PanicPayload>>,
    cv: Condvar,
}

impl FinishLine {
    /// Creates a finish line with `runners` initial runners.
    pub fn new(runners: usize) -> Self {
        Self {
            runners: CachePadded::new(AtomicI64::new(runners as i64)),
            fault: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    /// Adds `n` runners to the race.
    pub fn add(&self, n: usize) {
        self.runners.fetch_add(n as i64, Ordering::Release);
    }

    /// Adds a single runner.
    pub fn start(&self) {
        self.add(1);
    }

    /// Records that one runner has crossed; the last one wakes all waiters.
    pub fn cross(&self) {
        if self.runners.fetch_sub(1, Ordering::AcqRel) - 1 <= 0 {
            // the lock must be taken before signalling so a waiter between
            // its predicate check and its sleep cannot miss the wakeup
            drop(self.fault.lock());
            self.cv.notify_all();
        }
    }

    /// True once every runner has crossed.
    pub fn is_done(&self) -> bool {
        self.runners.load(Ordering::Acquire) <= 0
    }

    /// Blocks until all runners have crossed, re-raising the payload if the
    /// race was aborted.
    pub fn wait(&self) {
        let mut fault = self.fault.lock();
        self.cv
            .wait_while(&mut fault, |fault| !self.is_done() && fault.is_none());
        if let Some(payload) = fault.take() {
            drop(fault);
            std::panic::resume_unwind(payload);
        }
    }

    /// Bounded [`wait`](Self::wait): gives up after `timeout` without
    /// raising, leaving the race observable via [`is_done`](Self::is_done).
    pub fn wait_for(&self, timeout: Duration) {
        let deadline = std::time::Instant::now() + timeout;
        let mut fault = self.fault.lock();
        while !self.is_done() && fault.is_none() {
            if self.cv.wait_until(&mut fault, deadline).timed_out() {
                break;
            }
        }
        if let Some(payload) = fault.take() {
            drop(fault);
            std::panic::resume_unwind(payload);
        }
    }

    /// Aborts the race: zeroes the runner count and hands `payload` to a
    /// waiter, which re-raises it.
    pub fn abort(&self, payload: PanicPayload) {
        let mut fault = self.fault.lock();
        self.runners.store(0, Ordering::Release);
        *fault = Some(payload);
        drop(fault);
        self.cv.notify_all();
    }
}

impl std::fmt::Debug for FinishLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinishLine")
            .field("runners", &self.runners.load(Ordering::Relaxed))
            .finish()
    }
}
