use std::cell::{Cell, UnsafeCell};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::Task;

/// Slots per block. Blocks are reclaimed whole, so this also bounds how long
/// a finished closure's storage can linger before the block cycles back.
pub(crate) const BLOCK_SIZE: usize = 1024;

/// Storage for one task closure.
///
/// A slot is handed out by `Mempool::allocate` under the shard's push lock,
/// published through the ring buffer, and claimed by exactly one consumer via
/// the queue's CAS on `top`. From claim until `run` returns, the claimant is
/// the sole accessor of `task`.
pub(crate) struct Slot {
    task: UnsafeCell<Option<Task>>,
    done: AtomicBool,
    // back-reference to the owning block, set once before publication
    block: Cell<*const Block>,
}

impl Slot {
    fn new() -> Self {
        Self {
            task: UnsafeCell::new(None),
            done: AtomicBool::new(false),
            block: Cell::new(ptr::null()),
        }
    }
}

/// Fixed-capacity array of slots, doubly linked within a [`Mempool`].
///
/// `alloc_idx`, `next` and `prev` are only touched under the owning shard's
/// push lock (or during quiescent reset); `free_count` is bumped by whichever
/// worker finishes a task.
pub(crate) struct Block {
    free_count: CachePadded<AtomicUsize>,
    alloc_idx: Cell<usize>,
    next: Cell<*mut Block>,
    prev: Cell<*mut Block>,
    slots: Box<[Slot]>,
}

impl Block {
    fn new(size: usize) -> Box<Self> {
        let slots = (0..size).map(|_| Slot::new()).collect::<Vec<_>>();
        let block = Box::new(Self {
            free_count: CachePadded::new(AtomicUsize::new(0)),
            alloc_idx: Cell::new(0),
            next: Cell::new(ptr::null_mut()),
            prev: Cell::new(ptr::null_mut()),
            slots: slots.into_boxed_slice(),
        });
        let ptr: *const Block = &*block;
        for slot in block.slots.iter() {
            slot.block.set(ptr);
        }
        block
    }

    fn next_free_slot(&self) -> Option<*mut Slot> {
        let i = self.alloc_idx.get();
        if i < self.slots.len() {
            self.alloc_idx.set(i + 1);
            Some(&self.slots[i] as *const Slot as *mut Slot)
        } else {
            None
        }
    }

    fn fully_freed(&self) -> bool {
        self.free_count.load(Ordering::Acquire) == self.slots.len()
    }

    // rewind a fully-freed block so it can hand out slots again
    fn recycle(&self) {
        self.alloc_idx.set(0);
        self.free_count.store(0, Ordering::Relaxed);
        for slot in self.slots.iter() {
            slot.done.store(false, Ordering::Relaxed);
        }
    }

    // drop whatever never ran and restore the freshly-allocated state
    fn clear(&self) {
        for slot in self.slots.iter() {
            if !slot.done.load(Ordering::Relaxed) {
                // SAFETY: only called while the pool is quiescent, so no
                // worker holds a claim on any slot of this block
                unsafe { (*slot.task.get()).take() };
            }
            slot.done.store(false, Ordering::Relaxed);
        }
        self.alloc_idx.set(0);
        self.free_count.store(0, Ordering::Relaxed);
    }
}

/// Slab allocator for task slots with coarse, whole-block reclamation.
///
/// Keeping reclamation at block granularity removes per-task frees from the
/// hot path and gives the queue stable slot pointers to embed in its ring
/// without any reference counting. All methods take `&mut self`: callers
/// reach the pool through the shard's push mutex.
pub(crate) struct Mempool {
    head: *mut Block,
    tail: *mut Block,
    block_size: usize,
}

impl Mempool {
    pub(crate) fn new(block_size: usize) -> Self {
        let head = Box::into_raw(Block::new(block_size));
        Self {
            head,
            tail: head,
            block_size,
        }
    }

    /// Moves `task` into a fresh slot and returns the slot's address.
    pub(crate) fn allocate(&mut self, task: Task) -> *mut Slot {
        let slot = self.get_slot();
        // SAFETY: the slot came from `get_slot`, which never hands out a slot
        // twice between recycles, so nothing else is accessing it yet
        unsafe {
            *(*slot).task.get() = Some(task);
            (*slot).done.store(false, Ordering::Relaxed);
        }
        slot
    }

    fn get_slot(&mut self) -> *mut Slot {
        unsafe {
            if let Some(slot) = (*self.head).next_free_slot() {
                return slot;
            }

            // a block linked ahead of head can only be there because it was
            // fully freed and re-linked by a previous collection
            let next = (*self.head).next.get();
            if !next.is_null() {
                (*next).recycle();
                self.head = next;
                return (*next).next_free_slot().expect("recycled block is empty");
            }

            // collect fully-freed blocks from the tail end of the list
            let old_tail = self.tail;
            while !(*self.tail).next.get().is_null() && (*self.tail).fully_freed() {
                self.tail = (*self.tail).next.get();
            }
            if !ptr::eq(self.tail, old_tail) {
                // detach [old_tail, tail) and re-link the chain after head
                (*(*self.tail).prev.get()).next.set(ptr::null_mut());
                (*self.tail).prev.set(ptr::null_mut());
                self.link_at_head(old_tail);
                (*self.head).recycle();
                return (*self.head)
                    .next_free_slot()
                    .expect("recycled block is empty");
            }

            // nothing reclaimable: grow the list
            self.link_at_head(Box::into_raw(Block::new(self.block_size)));
            (*self.head).next_free_slot().expect("fresh block is empty")
        }
    }

    unsafe fn link_at_head(&mut self, block: *mut Block) {
        (*block).prev.set(self.head);
        (*self.head).next.set(block);
        self.head = block;
    }

    /// Restores every block to the freshly-allocated state, dropping tasks
    /// that never ran. Callers must guarantee quiescence.
    pub(crate) fn reset(&mut self) {
        unsafe {
            let mut block = self.tail;
            while !block.is_null() {
                (*block).clear();
                block = (*block).next.get();
            }
        }
        self.head = self.tail;
    }
}

impl Drop for Mempool {
    fn drop(&mut self) {
        unsafe {
            let mut block = self.tail;
            while !block.is_null() {
                let next = (*block).next.get();
                drop(Box::from_raw(block));
                block = next;
            }
        }
    }
}

/// Exclusive claim on a popped slot, produced by a winning CAS on the
/// queue's `top`.
pub(crate) struct TaskHold {
    slot: *mut Slot,
}

impl TaskHold {
    /// # Safety
    ///
    /// `slot` must have been won via the queue's CAS protocol, making the
    /// caller its sole claimant.
    pub(crate) unsafe fn claim(slot: *mut Slot) -> Self {
        Self { slot }
    }

    /// Runs the task, then marks the slot done and releases it to the block.
    ///
    /// If the task panics, the slot is deliberately left not-done and
    /// unfreed; the queue's reset reclaims it once the pool is quiescent.
    pub(crate) fn run(self) {
        // SAFETY: claim invariant; the slot and its block stay allocated at
        // least until the block's free count reaches capacity, which cannot
        // happen before the `fetch_add` below
        unsafe {
            let task = (*(*self.slot).task.get())
                .take()
                .expect("claimed slot holds a task");
            task();
            (*self.slot).done.store(true, Ordering::Relaxed);
            let block = (*self.slot).block.get();
            (*block).free_count.fetch_add(1, Ordering::Release);
        }
    }
}
