//! Bounded work queues for the tile-loading pipeline.
//!
//! The design mirrors a classic game-engine job queue: a fixed-capacity
//! MPMC ring, a counting semaphore for worker wake-ups, and
//! completion-goal/completion-count counters so any thread can ask whether
//! work is still outstanding. Two rings share one semaphore to form a
//! normal and a high-priority lane; workers prefer the high lane.
//!
//! Tasks run to completion and may themselves submit tasks. A thread-local
//! call depth tracks nested execution so that a task draining the queue it
//! came from does not count itself as outstanding work.

pub mod queue;

pub use queue::{RingQueue, Semaphore, WorkQueue};

use std::cell::Cell;

thread_local! {
    static CALL_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// How many queue tasks are executing on the current thread's call stack.
#[inline]
pub fn call_depth() -> u32 {
    CALL_DEPTH.with(|d| d.get())
}

/// RAII guard bumping the thread-local call depth for the duration of one
/// task's execution.
pub struct CallDepthGuard(());

impl CallDepthGuard {
    pub fn enter() -> Self {
        CALL_DEPTH.with(|d| d.set(d.get() + 1));
        CallDepthGuard(())
    }
}

impl Drop for CallDepthGuard {
    fn drop(&mut self) {
        CALL_DEPTH.with(|d| d.set(d.get() - 1));
    }
}
