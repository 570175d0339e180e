//! Lock-free bounded ring, counting semaphore, and the work queue built
//! from them.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

// =============================================================================
// Semaphore
// =============================================================================

/// A counting semaphore for worker wake-ups.
pub struct Semaphore {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    /// Release one permit, waking one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.condvar.notify_one();
    }

    /// Block until a permit is available, then take it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.condvar.wait(&mut count);
        }
        *count -= 1;
    }

    /// Wait with a timeout; returns whether a permit was taken.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            self.condvar.wait_for(&mut count, timeout);
        }
        if *count == 0 {
            false
        } else {
            *count -= 1;
            true
        }
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// RingQueue
// =============================================================================

/// One slot of the ring. The sequence number arbitrates which side may
/// touch the value: `seq == pos` means free for the producer at `pos`,
/// `seq == pos + 1` means filled for the consumer at `pos`.
struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<Option<T>>,
}

/// A fixed-capacity multi-producer multi-consumer FIFO.
///
/// Push fails when the ring is full (the caller cancels or retries);
/// pop returns `None` when it is empty. Neither operation blocks.
pub struct RingQueue<T> {
    buffer: Box<[Slot<T>]>,
    mask: usize,
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
}

// Safety: slot access is arbitrated by the per-slot sequence numbers; a
// value is only ever written by the producer that claimed the slot and only
// ever taken by the consumer that claimed it.
unsafe impl<T: Send> Send for RingQueue<T> {}
unsafe impl<T: Send> Sync for RingQueue<T> {}

impl<T> RingQueue<T> {
    /// Create a ring with at least `capacity` slots (rounded up to a power
    /// of two).
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = capacity.max(2).next_power_of_two();
        let buffer = (0..cap)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(None),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buffer,
            mask: cap - 1,
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
        }
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        let enq = self.enqueue_pos.load(Ordering::Relaxed);
        let deq = self.dequeue_pos.load(Ordering::Relaxed);
        enq.saturating_sub(deq)
    }

    /// Whether the ring is (approximately) empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Try to enqueue; gives the value back if the ring is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            if seq == pos {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Safety: the CAS gave this thread exclusive claim
                        // on the slot until the sequence store below.
                        unsafe { *slot.value.get() = Some(value) };
                        slot.sequence.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => pos = actual,
                }
            } else if seq < pos {
                // Slot still holds an unconsumed value one lap behind: full.
                return Err(value);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Try to dequeue.
    pub fn pop(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            if seq == pos + 1 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Safety: the CAS gave this thread exclusive claim
                        // on the slot until the sequence store below.
                        let value = unsafe { (*slot.value.get()).take() };
                        slot.sequence
                            .store(pos + self.mask + 1, Ordering::Release);
                        return value;
                    }
                    Err(actual) => pos = actual,
                }
            } else if seq <= pos {
                return None; // empty
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }
}

// =============================================================================
// WorkQueue
// =============================================================================

/// A bounded FIFO of `T` with progress counters and a wake-up semaphore.
///
/// Several queues may share one semaphore to form priority lanes: each
/// submit posts the shared semaphore, and a woken worker drains whichever
/// lane it prefers first.
pub struct WorkQueue<T> {
    ring: RingQueue<T>,
    semaphore: Arc<Semaphore>,
    completion_goal: AtomicU32,
    completion_count: AtomicU32,
    start_goal: AtomicU32,
    start_count: AtomicU32,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize, semaphore: Arc<Semaphore>) -> Self {
        Self {
            ring: RingQueue::with_capacity(capacity),
            semaphore,
            completion_goal: AtomicU32::new(0),
            completion_count: AtomicU32::new(0),
            start_goal: AtomicU32::new(0),
            start_count: AtomicU32::new(0),
        }
    }

    /// The semaphore shared by this queue's lane group.
    #[inline]
    pub fn semaphore(&self) -> &Arc<Semaphore> {
        &self.semaphore
    }

    /// Submit an item, or hand it back when the queue is full — the
    /// caller decides whether to retry or cancel.
    pub fn submit_or_return(&self, item: T) -> Result<(), T> {
        self.ring.push(item)?;
        self.completion_goal.fetch_add(1, Ordering::AcqRel);
        self.start_goal.fetch_add(1, Ordering::AcqRel);
        self.semaphore.post();
        Ok(())
    }

    /// Submit an item, dropping it when the queue is full. Returns whether
    /// the submit was admitted.
    pub fn submit(&self, item: T) -> bool {
        self.submit_or_return(item).is_ok()
    }

    /// Take the next item, counting it as started.
    pub fn try_pop(&self) -> Option<T> {
        let item = self.ring.pop()?;
        self.start_count.fetch_add(1, Ordering::AcqRel);
        Some(item)
    }

    /// Record that a previously popped item finished executing.
    pub fn mark_completed(&self) {
        self.completion_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of items submitted but not yet completed, excluding
    /// `exclude_call_depth` tasks currently executing on the calling
    /// thread's own stack.
    ///
    /// Pass [`crate::work::call_depth`] when asking about the queue whose
    /// tasks the current thread runs, so a task draining its own queue does
    /// not wait on itself.
    pub fn is_work_in_progress(&self, exclude_call_depth: u32) -> bool {
        let goal = self.completion_goal.load(Ordering::Acquire);
        let done = self.completion_count.load(Ordering::Acquire);
        goal.saturating_sub(exclude_call_depth) > done
    }

    /// Whether any submitted item has not yet been popped.
    pub fn is_work_waiting_to_start(&self) -> bool {
        self.start_goal.load(Ordering::Acquire) > self.start_count.load(Ordering::Acquire)
    }

    /// Number of completions recorded so far.
    pub fn completion_count(&self) -> u32 {
        self.completion_count.load(Ordering::Acquire)
    }

    /// Number of submissions recorded so far.
    pub fn completion_goal(&self) -> u32 {
        self.completion_goal.load(Ordering::Acquire)
    }

    /// Approximate queued-item count.
    pub fn task_count(&self) -> usize {
        self.ring.len()
    }
}
