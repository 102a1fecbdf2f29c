use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::PanicPayload;

// Forces the counter so far negative that concurrent `add`s cannot make it
// positive again before a reset.
const STOPPED: i64 = i64::MIN / 2;

/// A resettable counting latch.
///
/// Put work on the list with [`add`](Self::add), cross it off with
/// [`cross`](Self::cross), and block on [`wait`](Self::wait) until the list
/// is empty. Unlike [`FinishLine`](crate::FinishLine), adding is legal at any
/// time, including while waiters sleep, and the list can be
/// [`stop`](Self::stop)ped (it then looks empty forever) or
/// [`reset`](Self::reset) back to a clean slate without constructing a new
/// object.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use shardpool::TodoList;
///
/// let todo = Arc::new(TodoList::new(1));
/// let worker = {
///     let todo = todo.clone();
///     std::thread::spawn(move || todo.cross(1))
/// };
/// todo.wait();
/// worker.join().unwrap();
/// ```
pub struct TodoList {
    outstanding: CachePadded<AtomicI64>,
    fault: Mutex<Option<PanicPayload>>,
    cv: Condvar,
}

impl TodoList {
    /// Creates a list with `n` initial tasks.
    pub fn new(n: usize) -> Self {
        Self {
            outstanding: CachePadded::new(AtomicI64::new(n as i64)),
            fault: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    /// Puts `n` more tasks on the list.
    pub fn add(&self, n: usize) {
        self.outstanding.fetch_add(n as i64, Ordering::Release);
    }

    /// Crosses `n` tasks off the list; reaching zero (or below) wakes all
    /// waiters.
    pub fn cross(&self, n: usize) {
        self.outstanding.fetch_sub(n as i64, Ordering::Release);
        if self.outstanding.load(Ordering::Acquire) <= 0 {
            // lock before signalling so a waiter cannot sleep through this
            drop(self.fault.lock());
            self.cv.notify_all();
        }
    }

    /// True when nothing is outstanding (always true after
    /// [`stop`](Self::stop)).
    pub fn empty(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) <= 0
    }

    /// Blocks until the list is empty, re-raising the payload stored by
    /// [`stop`](Self::stop) if there is one.
    pub fn wait(&self) {
        std::thread::yield_now();
        let mut fault = self.fault.lock();
        self.cv
            .wait_while(&mut fault, |fault| !self.empty() && fault.is_none());
        if let Some(payload) = fault.take() {
            drop(fault);
            std::panic::resume_unwind(payload);
        }
    }

    /// Bounded [`wait`](Self::wait): returns after at most `timeout`
    /// regardless of completion, without raising on the timeout path.
    pub fn wait_for(&self, timeout: Duration) {
        std::thread::yield_now();
        let deadline = std::time::Instant::now() + timeout;
        let mut fault = self.fault.lock();
        while !self.empty() && fault.is_none() {
            if self.cv.wait_until(&mut fault, deadline).timed_out() {
                break;
            }
        }
        if let Some(payload) = fault.take() {
            drop(fault);
            std::panic::resume_unwind(payload);
        }
    }

    /// Stops the list: it reports empty forever, waiters wake, and `payload`
    /// (if any) is re-raised by the next waiter.
    pub fn stop(&self, payload: Option<PanicPayload>) {
        {
            let mut fault = self.fault.lock();
            self.outstanding.store(STOPPED, Ordering::SeqCst);
            *fault = payload;
        }
        self.cv.notify_all();
    }

    /// Restores the initial state: counter at zero, no stored payload.
    pub fn reset(&self) {
        let mut fault = self.fault.lock();
        *fault = None;
        self.outstanding.store(0, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for TodoList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TodoList")
            .field("outstanding", &self.outstanding.load(Ordering::Relaxed))
            .finish()
    }
}
