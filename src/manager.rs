use std::panic::resume_unwind;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use scopeguard::defer;

use crate::mempool::TaskHold;
use crate::queue::TaskQueue;
use crate::todo_list::TodoList;
use crate::{PanicPayload, Task};

const RUNNING: u8 = 0;
const ERRORED: u8 = 1;
const STOPPED: u8 = 2;

/// Dispatcher over a shard of task queues.
///
/// Pushes round-robin over the active shard prefix; pops work-steal across
/// every shard starting at the worker's home. Outstanding work is counted on
/// a [`TodoList`]; the first panic a worker reports flips the manager into
/// the errored state, which only the owner thread may leave again: it waits
/// for every worker to park, resets all shared state, and re-raises the
/// stored payload at its own next `push` or `wait`.
pub(crate) struct TaskManager {
    queues: Box<[TaskQueue]>,
    num_queues: usize,
    owner_id: ThreadId,

    push_idx: CachePadded<AtomicUsize>,
    num_active: CachePadded<AtomicUsize>,
    num_waiting: CachePadded<AtomicUsize>,
    todo_list: TodoList,

    status: AtomicU8,
    fault: Mutex<Option<PanicPayload>>,
    fault_cv: Condvar,
}

impl TaskManager {
    pub(crate) fn new(num_queues: usize) -> Self {
        let queues = (0..num_queues)
            .map(|_| TaskQueue::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            queues,
            num_queues,
            owner_id: thread::current().id(),
            push_idx: CachePadded::new(AtomicUsize::new(0)),
            num_active: CachePadded::new(AtomicUsize::new(num_queues)),
            num_waiting: CachePadded::new(AtomicUsize::new(0)),
            todo_list: TodoList::new(0),
            status: AtomicU8::new(RUNNING),
            fault: Mutex::new(None),
            fault_cv: Condvar::new(),
        }
    }

    /// Submits a task, spreading lock contention round-robin over the active
    /// shards. Drives owner recovery first, so an earlier failure surfaces
    /// here before new work is accepted.
    pub(crate) fn push(&self, task: Task) {
        debug_assert!(self.num_queues > 0);
        self.rethrow_panic();
        self.todo_list.add(1);
        let mut task = task;
        while self.is_running() {
            let idx = self.push_idx.fetch_add(1, Ordering::Relaxed) % self.active();
            match self.queues[idx].try_push(task) {
                Ok(()) => return,
                Err(back) => task = back,
            }
        }
        // not running: submissions on a stopped pool are a no-op, and during
        // an error drain the task would be discarded by the reset anyway
    }

    /// Steals a task for the worker at `home`, consulting the home shard
    /// first, then the neighbours mod N; the wrap consults home twice to
    /// absorb self-contention windows.
    pub(crate) fn try_pop(&self, home: usize) -> Option<TaskHold> {
        if !self.is_running() {
            return None;
        }
        for k in 0..=self.num_queues {
            if let Some(hold) = self.queues[(home + k) % self.num_queues].try_pop() {
                return Some(hold);
            }
        }
        None
    }

    /// Parks the calling worker on its home shard until work or stop
    /// arrives. The waiting count lets the owner's recovery detect that
    /// every worker is quiescent.
    pub(crate) fn wait_for_jobs(&self, home: usize) {
        {
            // count in under the fault lock: recovery sleeps until the last
            // worker parks, and that worker's notify must not slip between
            // the owner's check and its sleep
            let guard = self.fault.lock();
            if self.num_waiting.fetch_add(1, Ordering::SeqCst) + 1 == self.num_queues {
                self.fault_cv.notify_all();
            }
            drop(guard);
        }
        defer! {
            self.num_waiting.fetch_sub(1, Ordering::SeqCst);
        }
        self.queues[home].wait();
    }

    /// Blocks until the todo list drains (bounded by `timeout` if given),
    /// then surfaces any captured panic to the owner.
    pub(crate) fn wait_for_finish(&self, timeout: Option<Duration>) {
        if self.is_running() {
            match timeout {
                None => self.todo_list.wait(),
                Some(timeout) => self.todo_list.wait_for(timeout),
            }
        }
        self.rethrow_panic();
    }

    pub(crate) fn done(&self) -> bool {
        self.todo_list.empty()
    }

    pub(crate) fn report_success(&self) {
        self.todo_list.cross(1);
    }

    /// Records a task panic. The first payload wins; the manager flips to
    /// errored and stops the todo list so every waiter wakes up. A panic
    /// that lands on an already errored or stopped manager is dropped: only
    /// a running pool may enter the errored state, or a task failing during
    /// shutdown would resurrect workers that `stop` already released.
    pub(crate) fn report_fail(&self, payload: PanicPayload) {
        if !self.is_running() {
            return;
        }
        let mut fault = self.fault.lock();
        if !self.is_running() {
            // lost the race to an earlier failure or a shutdown
            return;
        }
        log::debug!("task panicked; pool entering errored state");
        *fault = Some(payload);
        self.status.store(ERRORED, Ordering::SeqCst);
        self.todo_list.stop(None);
    }

    /// Discards not-yet-claimed tasks on every shard and reconciles the todo
    /// list so waiters are not left hanging on discarded work.
    pub(crate) fn clear(&self) {
        let mut discarded = 0;
        for queue in self.queues.iter() {
            discarded += queue.clear();
        }
        if discarded > 0 {
            log::trace!("cleared {discarded} pending tasks");
            self.todo_list.cross(discarded as usize);
        }
    }

    pub(crate) fn stop(&self) {
        log::trace!("stopping task manager");
        {
            // serialized with `report_fail`'s double check: once stopped, a
            // late panic must not flip the status back to errored
            let _fault = self.fault.lock();
            self.status.store(STOPPED, Ordering::SeqCst);
        }
        self.todo_list.stop(None);
        // workers park on their shard condvars, so every shard gets notified
        for queue in self.queues.iter() {
            queue.stop();
        }
    }

    /// Owner-only recovery: once every worker is parked, resets the todo
    /// list and all shards, returns to the running state, and re-raises the
    /// stored payload. A no-op on any other thread or in any other state.
    pub(crate) fn rethrow_panic(&self) {
        if !self.called_from_owner_thread() || !self.is_errored() {
            return;
        }
        let mut fault = self.fault.lock();
        self.fault_cv.wait_while(&mut fault, |_| {
            self.num_waiting.load(Ordering::SeqCst) != self.num_queues
        });

        // restore defaults before raising so the pool stays usable
        self.todo_list.reset();
        for queue in self.queues.iter() {
            queue.reset();
        }
        self.status.store(RUNNING, Ordering::SeqCst);
        let payload = fault.take();
        drop(fault);
        if let Some(payload) = payload {
            resume_unwind(payload);
        }
    }

    /// Restricts pushes to the first `n` shards; `n` is clamped to
    /// `[1, N]`. Workers keep stealing from every shard, so a shrink drains
    /// whatever the deactivated shards still hold.
    pub(crate) fn set_active(&self, n: usize) {
        if self.num_queues == 0 {
            return;
        }
        let n = n.clamp(1, self.num_queues);
        log::trace!("active shards set to {n}");
        self.num_active.store(n, Ordering::SeqCst);
    }

    pub(crate) fn active(&self) -> usize {
        self.num_active.load(Ordering::SeqCst)
    }

    pub(crate) fn called_from_owner_thread(&self) -> bool {
        thread::current().id() == self.owner_id
    }

    pub(crate) fn is_running(&self) -> bool {
        self.status.load(Ordering::SeqCst) == RUNNING
    }

    pub(crate) fn is_errored(&self) -> bool {
        self.status.load(Ordering::SeqCst) == ERRORED
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.status.load(Ordering::SeqCst) == STOPPED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    fn counting_task(counter: &Arc<AtomicU64>) -> Task {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    }

    fn drain(manager: &TaskManager, home: usize) {
        while let Some(hold) = manager.try_pop(home) {
            hold.run();
            manager.report_success();
        }
    }

    #[test]
    fn round_robin_spreads_over_shards() {
        let manager = TaskManager::new(4);
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..4 {
            manager.push(counting_task(&counter));
        }
        for queue in manager.queues.iter() {
            assert!(!queue.empty());
        }
        drain(&manager, 0);
        assert!(manager.done());
        assert_eq!(counter.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn stealing_reaches_every_shard() {
        let manager = TaskManager::new(4);
        let counter = Arc::new(AtomicU64::new(0));
        // confine pushes to shard 0, then pop with a far-away home index
        manager.set_active(1);
        for _ in 0..8 {
            manager.push(counting_task(&counter));
        }
        drain(&manager, 3);
        assert!(manager.done());
        assert_eq!(counter.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn set_active_clamps_to_the_shard_count() {
        let manager = TaskManager::new(2);
        manager.set_active(0);
        assert_eq!(manager.active(), 1);
        manager.set_active(100);
        assert_eq!(manager.active(), 2);
    }

    #[test]
    fn clear_reconciles_the_todo_list() {
        let manager = TaskManager::new(2);
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..6 {
            manager.push(counting_task(&counter));
        }
        assert!(!manager.done());
        manager.clear();
        assert!(manager.done());
        // discarded tasks never ran
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        // the manager is still usable afterwards
        manager.push(counting_task(&counter));
        drain(&manager, 0);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn push_on_a_stopped_manager_is_a_no_op() {
        let manager = TaskManager::new(2);
        manager.stop();
        assert!(manager.is_stopped());
        let counter = Arc::new(AtomicU64::new(0));
        manager.push(counting_task(&counter));
        assert!(manager.try_pop(0).is_none());
        assert!(manager.done());
    }
}
