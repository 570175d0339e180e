//! Fixed-block allocator for tile pixel buffers.
//!
//! Every tile buffer in an engine has the same size
//! (`tile_width * tile_height * 4`), which makes a chunked block allocator a
//! better fit than the general heap: allocation is a free-list pop, release
//! is a push, and the configured chunk cap bounds total pixel residency.
//!
//! Chunks are grown lazily. Returned blocks are recorded on a free list of
//! `(chunk, block)` pairs, so a block handed back from any chunk is reusable
//! regardless of which chunk the next caller drains.

use std::ptr::NonNull;

use parking_lot::Mutex;

/// Identifies a block within the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockId {
    chunk: u32,
    block: u32,
}

/// One chunk of uniformly sized blocks.
///
/// The storage box never moves or shrinks once created, so pointers into it
/// stay valid for the allocator's lifetime.
struct Chunk {
    storage: Box<[u8]>,
    used_blocks: u32,
}

struct Inner {
    chunks: Vec<Chunk>,
    free_list: Vec<BlockId>,
    live_blocks: usize,
}

/// A pixel buffer leased from a [`BlockAllocator`].
///
/// The block is `Send` so a worker can decode into it and hand it to the
/// main thread through a completion queue. It must be returned to the same
/// allocator with [`BlockAllocator::free`]; dropping it without freeing
/// leaks the block until the allocator itself is dropped (the backing
/// memory is owned by the allocator, so this is a capacity leak, not a
/// memory-safety issue).
pub struct TileBlock {
    ptr: NonNull<u8>,
    len: usize,
    id: BlockId,
}

// Safety: a TileBlock is the unique lease on its block; the backing chunk
// storage is never moved or freed while the allocator is alive, and no two
// leases alias.
unsafe impl Send for TileBlock {}

impl std::fmt::Debug for TileBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileBlock")
            .field("len", &self.len)
            .field("chunk", &self.id.chunk)
            .field("block", &self.id.block)
            .finish()
    }
}

impl TileBlock {
    /// Length of the buffer in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty (never true for a real allocator).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the pixels.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // Safety: unique lease, stable storage (see struct invariant).
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// View the pixels mutably.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: unique lease, stable storage (see struct invariant).
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// Chunked allocator for uniformly sized pixel buffers.
pub struct BlockAllocator {
    block_size: usize,
    chunk_capacity_in_blocks: u32,
    max_chunks: u32,
    inner: Mutex<Inner>,
}

impl BlockAllocator {
    /// Create an allocator serving `block_size`-byte blocks, growing up to
    /// `max_chunks` chunks of `chunk_capacity_in_blocks` blocks each.
    pub fn new(block_size: usize, chunk_capacity_in_blocks: u32, max_chunks: u32) -> Self {
        assert!(block_size > 0 && chunk_capacity_in_blocks > 0 && max_chunks > 0);
        Self {
            block_size,
            chunk_capacity_in_blocks,
            max_chunks,
            inner: Mutex::new(Inner {
                chunks: Vec::new(),
                free_list: Vec::new(),
                live_blocks: 0,
            }),
        }
    }

    /// Size of each block in bytes.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Maximum number of blocks this allocator will ever serve at once.
    #[inline]
    pub fn capacity_in_blocks(&self) -> usize {
        self.chunk_capacity_in_blocks as usize * self.max_chunks as usize
    }

    /// Number of blocks currently leased out.
    pub fn live_blocks(&self) -> usize {
        self.inner.lock().live_blocks
    }

    /// Lease a block. Returns `None` when the allocator has hit its cap;
    /// callers treat that as a transient tile-load failure.
    pub fn alloc(&self) -> Option<TileBlock> {
        let mut inner = self.inner.lock();

        let id = if let Some(id) = inner.free_list.pop() {
            id
        } else {
            // Grow into the newest chunk, adding one if needed.
            let needs_chunk = match inner.chunks.last() {
                Some(chunk) => chunk.used_blocks >= self.chunk_capacity_in_blocks,
                None => true,
            };
            if needs_chunk {
                if inner.chunks.len() as u32 >= self.max_chunks {
                    return None;
                }
                let chunk_bytes = self.block_size * self.chunk_capacity_in_blocks as usize;
                inner.chunks.push(Chunk {
                    storage: vec![0u8; chunk_bytes].into_boxed_slice(),
                    used_blocks: 0,
                });
            }
            let chunk_index = inner.chunks.len() as u32 - 1;
            let chunk = inner.chunks.last_mut().expect("chunk just ensured");
            let block_index = chunk.used_blocks;
            chunk.used_blocks += 1;
            BlockId {
                chunk: chunk_index,
                block: block_index,
            }
        };

        inner.live_blocks += 1;
        let chunk = &mut inner.chunks[id.chunk as usize];
        let offset = id.block as usize * self.block_size;
        let ptr = NonNull::new(chunk.storage[offset..].as_mut_ptr()).expect("chunk storage");
        Some(TileBlock {
            ptr,
            len: self.block_size,
            id,
        })
    }

    /// Return a block to the free list.
    pub fn free(&self, block: TileBlock) {
        let mut inner = self.inner.lock();
        debug_assert!((block.id.chunk as usize) < inner.chunks.len());
        debug_assert!(!inner.free_list.contains(&block.id), "double free");
        inner.free_list.push(block.id);
        inner.live_blocks -= 1;
    }
}
