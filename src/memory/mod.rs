//! Arena and scratch memory for the worker threads.
//!
//! Each worker owns a [`ThreadMemory`] with a bump [`Arena`] used for
//! short-lived decode scratch (compressed tile bytes, intermediate
//! buffers). Tile pixel buffers are uniformly sized and come from the
//! shared [`BlockAllocator`] instead, so steady-state residency stays
//! bounded by the allocator cap.

pub mod arena;
pub mod blocks;

pub use arena::{Arena, ArenaSlice, ScopeToken};
pub use blocks::{BlockAllocator, TileBlock};

use std::cell::RefCell;

/// Default capacity of a worker thread's arena.
pub const THREAD_ARENA_SIZE: usize = 32 * 1024 * 1024;

/// Per-thread scratch memory.
///
/// Lazily created the first time a thread pumps the work queue, so the main
/// thread can also run tasks cooperatively.
pub struct ThreadMemory {
    pub arena: Arena,
}

impl ThreadMemory {
    pub fn new(arena_size: usize) -> Self {
        Self {
            arena: Arena::with_capacity(arena_size),
        }
    }
}

thread_local! {
    static THREAD_MEMORY: RefCell<Option<ThreadMemory>> = const { RefCell::new(None) };
}

/// Run `f` with this thread's scratch memory, creating it on first use.
pub fn with_thread_memory<R>(f: impl FnOnce(&mut ThreadMemory) -> R) -> R {
    THREAD_MEMORY.with(|tm| {
        let mut slot = tm.borrow_mut();
        let memory = slot.get_or_insert_with(|| ThreadMemory::new(THREAD_ARENA_SIZE));
        f(memory)
    })
}
