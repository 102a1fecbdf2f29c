use std::sync::atomic::{fence, AtomicI64, AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::mempool::{Mempool, TaskHold, BLOCK_SIZE};
use crate::ring::RingBuffer;
use crate::Task;

const INITIAL_CAPACITY: usize = 256;

/// One shard: a Chase-Lev deque of task slots.
///
/// Pops are lock free and may run concurrently on any thread. Pushes
/// serialize through `try_lock` on the shard mutex; a producer that loses the
/// lock gets its task back and moves on to the next shard, which is how
/// contention spreads across a manager's shards without blocking anyone.
///
/// When the ring fills up, the producer installs a doubled copy and retires
/// the old buffer into a graveyard rather than freeing it: a concurrent
/// popper may still be reading through the old pointer, and the graveyard
/// keeps that memory valid for the queue's whole lifetime.
pub(crate) struct TaskQueue {
    top: CachePadded<AtomicI64>,
    bottom: CachePadded<AtomicI64>,
    buffer: CachePadded<AtomicPtr<RingBuffer>>,
    shared: Mutex<Shared>,
    cv: Condvar,
}

struct Shared {
    graveyard: Vec<*mut RingBuffer>,
    pool: Mempool,
    stopped: bool,
}

// SAFETY: `graveyard` and `pool` are only touched while holding the shard
// mutex (or from `Drop`/quiescent reset); the raw pointers they carry never
// leave that protection except as the published current buffer, which is
// handed between threads through the atomics below.
unsafe impl Send for Shared {}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        let buffer = Box::into_raw(RingBuffer::new(INITIAL_CAPACITY));
        Self {
            top: CachePadded::new(AtomicI64::new(0)),
            bottom: CachePadded::new(AtomicI64::new(0)),
            buffer: CachePadded::new(AtomicPtr::new(buffer)),
            shared: Mutex::new(Shared {
                graveyard: Vec::new(),
                pool: Mempool::new(BLOCK_SIZE),
                stopped: false,
            }),
            cv: Condvar::new(),
        }
    }

    #[inline]
    pub(crate) fn empty(&self) -> bool {
        self.bottom.load(Ordering::Relaxed) <= self.top.load(Ordering::Relaxed)
    }

    /// Publishes a task at the bottom of the queue, growing the ring if it is
    /// full. Hands the task back instead of blocking when another producer
    /// holds the shard lock.
    pub(crate) fn try_push(&self, task: Task) -> Result<(), Task> {
        {
            let mut shared = match self.shared.try_lock() {
                Some(guard) => guard,
                None => return Err(task),
            };

            let b = self.bottom.load(Ordering::Relaxed);
            let t = self.top.load(Ordering::Acquire);
            let mut buf = self.buffer.load(Ordering::Relaxed);

            // SAFETY: the current buffer is owned by this queue and only
            // replaced under the lock we hold; graveyarded buffers outlive
            // every reader per the struct invariant
            unsafe {
                if ((*buf).capacity() as i64) < b - t + 1 {
                    let grown = Box::into_raw((*buf).enlarged_copy(b, t));
                    log::trace!(
                        "shard ring enlarged: {} -> {}",
                        (*buf).capacity(),
                        (*grown).capacity()
                    );
                    shared.graveyard.push(buf);
                    self.buffer.store(grown, Ordering::Release);
                    buf = grown;
                }
                let slot = shared.pool.allocate(task);
                (*buf).set_entry(b, slot);
            }

            fence(Ordering::Release);
            self.bottom.store(b + 1, Ordering::Release);
        }
        self.cv.notify_one();
        Ok(())
    }

    /// Claims the task at the top of the queue. Returns `None` when the queue
    /// is empty or the CAS race was lost to another consumer.
    pub(crate) fn try_pop(&self) -> Option<TaskHold> {
        let t = self.top.load(Ordering::Acquire);
        // orders this consumer's view of `bottom` against producers that
        // published with a release fence, and against racing consumers
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        if t < b {
            // the slot pointer must be read before the CAS: once another
            // consumer wins index `t`, the cell can be overwritten or the
            // slot reclaimed at any moment
            let buf = self.buffer.load(Ordering::Acquire);
            // SAFETY: `buf` is the current buffer or a graveyarded one, both
            // alive for the queue's lifetime
            let slot = unsafe { (*buf).get_entry(t) };

            if self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: winning the CAS makes us the slot's sole claimant
                return Some(unsafe { TaskHold::claim(slot) });
            }
        }
        None
    }

    /// Parks the caller until the queue is non-empty or stopped.
    pub(crate) fn wait(&self) {
        let mut shared = self.shared.lock();
        self.cv
            .wait_while(&mut shared, |shared| self.empty() && !shared.stopped);
    }

    pub(crate) fn stop(&self) {
        self.shared.lock().stopped = true;
        self.cv.notify_all();
    }

    /// Empties indices and slot storage. Callers must guarantee quiescence;
    /// the owner's error recovery does so by waiting for every worker to
    /// park.
    pub(crate) fn reset(&self) {
        let mut shared = self.shared.lock();
        shared.pool.reset();
        self.top.store(0, Ordering::SeqCst);
        self.bottom.store(0, Ordering::SeqCst);
    }

    /// Discards the pending window `[top, bottom)` and returns how many
    /// tasks were thrown away. A pop that wins an index concurrently fails
    /// our CAS, so no task is ever both executed and counted as discarded.
    pub(crate) fn clear(&self) -> i64 {
        let _shared = self.shared.lock();
        let b = self.bottom.load(Ordering::Relaxed);
        let mut t = self.top.load(Ordering::Acquire);
        while t < b {
            match self
                .top
                .compare_exchange(t, b, Ordering::SeqCst, Ordering::Acquire)
            {
                Ok(_) => return b - t,
                Err(current) => t = current,
            }
        }
        0
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        let shared = self.shared.get_mut();
        for &buf in &shared.graveyard {
            // SAFETY: graveyarded buffers are owned by this queue and no
            // reader can outlive it
            unsafe { drop(Box::from_raw(buf)) };
        }
        // SAFETY: same ownership argument for the current buffer
        unsafe { drop(Box::from_raw(self.buffer.load(Ordering::Relaxed))) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use std::thread;

    fn counting_task(counter: &Arc<AtomicU64>) -> Task {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test]
    fn push_pop_roundtrip() {
        let queue = TaskQueue::new();
        let counter = Arc::new(AtomicU64::new(0));
        assert!(queue.empty());
        queue.try_push(counting_task(&counter)).ok().unwrap();
        assert!(!queue.empty());
        queue.try_pop().unwrap().run();
        assert!(queue.empty());
        assert!(queue.try_pop().is_none());
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn fifo_within_a_shard() {
        let queue = TaskQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = order.clone();
            queue
                .try_push(Box::new(move || order.lock().push(i)))
                .ok()
                .unwrap();
        }
        while let Some(hold) = queue.try_pop() {
            hold.run();
        }
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn grows_past_initial_capacity() {
        let queue = TaskQueue::new();
        let counter = Arc::new(AtomicU64::new(0));
        let n = (INITIAL_CAPACITY * 4) as u64;
        for _ in 0..n {
            queue.try_push(counting_task(&counter)).ok().unwrap();
        }
        while let Some(hold) = queue.try_pop() {
            hold.run();
        }
        assert_eq!(counter.load(Ordering::Relaxed), n);
    }

    #[test]
    fn concurrent_pops_claim_each_index_once() {
        let queue = Arc::new(TaskQueue::new());
        let executed = Arc::new(AtomicU64::new(0));
        let n = 20_000u64;
        for _ in 0..n {
            queue.try_push(counting_task(&executed)).ok().unwrap();
        }

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut won = 0u64;
                    loop {
                        match queue.try_pop() {
                            Some(hold) => {
                                hold.run();
                                won += 1;
                            }
                            None if queue.empty() => break,
                            None => {}
                        }
                    }
                    won
                })
            })
            .collect();

        let total: u64 = consumers.into_iter().map(|t| t.join().unwrap()).sum();
        assert_eq!(total, n);
        assert_eq!(executed.load(Ordering::Relaxed), n);
    }

    #[test]
    fn producer_races_consumer_through_growth() {
        let queue = Arc::new(TaskQueue::new());
        let executed = Arc::new(AtomicU64::new(0));
        let n = (INITIAL_CAPACITY * 8) as u64;

        let consumer = {
            let queue = queue.clone();
            let executed = executed.clone();
            thread::spawn(move || {
                while executed.load(Ordering::Relaxed) < n {
                    if let Some(hold) = queue.try_pop() {
                        hold.run();
                    }
                }
            })
        };

        for _ in 0..n {
            let mut task = counting_task(&executed);
            // single producer: the lock is only contended by wait/stop
            while let Err(back) = queue.try_push(task) {
                task = back;
            }
        }
        consumer.join().unwrap();
        assert_eq!(executed.load(Ordering::Relaxed), n);
        assert!(queue.empty());
    }

    #[test]
    fn stop_wakes_a_parked_waiter() {
        let queue = Arc::new(TaskQueue::new());
        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.wait())
        };
        thread::sleep(std::time::Duration::from_millis(20));
        queue.stop();
        waiter.join().unwrap();
    }

    #[test]
    fn clear_discards_pending_window() {
        let queue = TaskQueue::new();
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..5 {
            queue.try_push(counting_task(&counter)).ok().unwrap();
        }
        queue.try_pop().unwrap().run();
        assert_eq!(queue.clear(), 4);
        assert!(queue.empty());
        assert_eq!(queue.clear(), 0);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }
}
