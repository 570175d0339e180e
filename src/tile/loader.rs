//! Tile load tasks and the per-tile state machine.
//!
//! States and transitions (all under the image lock unless noted):
//!
//! ```text
//! Never-loaded -> Submitted   request admitted; submitted_for_loading set
//! Never-loaded -> Empty       zero byte count observed at open time
//! Submitted    -> Decoding    worker pops the task (not under lock)
//! Decoding     -> Cached      pixels posted on a completion queue
//! Decoding     -> Failed      decode error; null completion posted
//! Decoding     -> Empty       stream was the bare-EOI sentinel
//! Cached       -> Evicted     no pin, no GPU need; pixels returned
//! ```
//!
//! Every admitted task holds one task-refcount on its image, released at
//! the end of the worker body whether or not decode succeeded. A task
//! that observes `deletion_pending` (or a stale resource id) frees
//! whatever it allocated and posts a null completion so waiters always
//! make progress.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::memory::{BlockAllocator, ThreadMemory, TileBlock};
use crate::slide::image::Image;
use crate::work::WorkQueue;

// =============================================================================
// Requests, tasks, completions
// =============================================================================

/// One entry of a tile wishlist handed to `request_tiles`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRequest {
    pub level: u32,
    pub tile_x: u32,
    pub tile_y: u32,
    pub need_gpu_residency: bool,
    pub need_keep_in_cache: bool,
}

/// A tile load task carried inline in the work queue.
pub struct LoadTileTask {
    /// Detects tasks outliving their image.
    pub resource_id: u64,
    pub image: Arc<Image>,
    pub level: u32,
    pub tile_x: u32,
    pub tile_y: u32,
    pub need_gpu_residency: bool,
    pub need_keep_in_cache: bool,
    /// Per-caller completion queue; the global queue is used when absent.
    pub completion: Option<Arc<WorkQueue<TileCompletion>>>,
    /// Task refcount released at the end of the worker body.
    pub refcount_to_decrement: u32,
}

/// A deferred level-indexing task.
pub struct IndexLevelTask {
    pub image: Arc<Image>,
    pub level: u32,
}

/// The bounded task payload of the engine work queues.
pub enum Task {
    LoadTile(LoadTileTask),
    IndexLevel(IndexLevelTask),
}

/// A tile-ready (or tile-failed) event posted by a worker.
pub struct TileCompletion {
    pub resource_id: u64,
    pub level: u32,
    pub tile_index: u32,
    pub tile_x: u32,
    pub tile_y: u32,
    /// `None` for failed, cancelled, or empty tiles.
    pub pixels: Option<TileBlock>,
    pub tile_width: u32,
    pub tile_height: u32,
    pub want_gpu_residency: bool,
}

// =============================================================================
// Admission
// =============================================================================

/// Filter a wishlist and enqueue load tasks for the admissible entries.
///
/// Under the image lock, entries are dropped when the tile is empty,
/// already cached, or already submitted, and when the level is absent or
/// not yet indexed (an indexing task is scheduled instead). Admitted
/// entries pin/flag the tile, take one image refcount each, and are
/// submitted to `queue`; a full queue rolls the tile back so the caller
/// can retry next frame.
///
/// Returns the number of tasks actually enqueued.
pub fn request_tiles(
    image: &Arc<Image>,
    wishlist: &[TileRequest],
    queue: &WorkQueue<Task>,
    completion: Option<&Arc<WorkQueue<TileCompletion>>>,
) -> usize {
    let mut submitted = 0usize;
    let mut state = image.lock();

    for request in wishlist {
        let Some(level) = state.levels.get_mut(request.level as usize) else {
            continue;
        };
        if !level.exists {
            continue;
        }
        if level.needs_indexing {
            submit_level_indexing(image, level, request.level, queue);
            continue;
        }
        if request.tile_x >= level.width_in_tiles || request.tile_y >= level.height_in_tiles {
            continue;
        }

        let tile = level.tile_at_mut(request.tile_x, request.tile_y);
        if tile.is_empty || tile.failed {
            continue;
        }
        if tile.is_cached || tile.submitted_for_loading {
            // Still record the caller's residency wishes on tiles that are
            // already present or in flight.
            tile.need_keep_in_cache |= request.need_keep_in_cache;
            tile.need_gpu_residency |= request.need_gpu_residency;
            continue;
        }

        tile.need_keep_in_cache |= request.need_keep_in_cache;
        tile.need_gpu_residency |= request.need_gpu_residency;
        tile.submitted_for_loading = true;
        image.retain();

        let task = Task::LoadTile(LoadTileTask {
            resource_id: image.resource_id,
            image: Arc::clone(image),
            level: request.level,
            tile_x: request.tile_x,
            tile_y: request.tile_y,
            need_gpu_residency: request.need_gpu_residency,
            need_keep_in_cache: request.need_keep_in_cache,
            completion: completion.cloned(),
            refcount_to_decrement: 1,
        });
        if queue.submit(task) {
            submitted += 1;
        } else {
            // Queue full: undo the admission; the caller may retry.
            warn!("work queue full, tile load cancelled");
            let tile = level.tile_at_mut(request.tile_x, request.tile_y);
            tile.submitted_for_loading = false;
            image.release(1);
        }
    }

    drop(state);
    submitted
}

/// Schedule the deferred indexing job for a level, once.
fn submit_level_indexing(
    image: &Arc<Image>,
    level: &mut crate::slide::image::Level,
    level_index: u32,
    queue: &WorkQueue<Task>,
) {
    if level.indexing_submitted {
        return;
    }
    level.indexing_submitted = true;
    image.retain();
    let task = Task::IndexLevel(IndexLevelTask {
        image: Arc::clone(image),
        level: level_index,
    });
    if !queue.submit(task) {
        level.indexing_submitted = false;
        image.release(1);
    }
}

// =============================================================================
// Worker bodies
// =============================================================================

/// Execute one task popped from a work queue. Runs on worker threads and,
/// cooperatively, on any thread draining the queue.
pub fn execute_task(
    task: Task,
    allocator: &BlockAllocator,
    global_completions: &WorkQueue<TileCompletion>,
    thread_memory: &mut ThreadMemory,
) {
    match task {
        Task::LoadTile(task) => execute_load_tile(task, allocator, global_completions, thread_memory),
        Task::IndexLevel(task) => execute_index_level(task),
    }
}

fn execute_load_tile(
    task: LoadTileTask,
    allocator: &BlockAllocator,
    global_completions: &WorkQueue<TileCompletion>,
    thread_memory: &mut ThreadMemory,
) {
    let image = Arc::clone(&task.image);

    let outcome = load_tile_pixels(&task, allocator, thread_memory);
    post_completion(&task, outcome, allocator, global_completions);

    image.release(task.refcount_to_decrement);
}

/// The decode half of the worker body: recover geometry, lease a buffer,
/// decode into it.
fn load_tile_pixels(
    task: &LoadTileTask,
    allocator: &BlockAllocator,
    thread_memory: &mut ThreadMemory,
) -> Option<TileBlock> {
    let image = &task.image;

    if image.resource_id != task.resource_id || image.is_deletion_pending() {
        return None;
    }

    // Snapshot the level geometry; it is immutable after open but lives
    // under the image lock.
    let (backing_index, tile_index, tile_bytes) = {
        let state = image.lock();
        let level = &state.levels[task.level as usize];
        (
            level.backing_index,
            level.tile_index(task.tile_x, task.tile_y) as u32,
            level.tile_size_in_bytes(),
        )
    };

    let Some(mut block) = allocator.alloc() else {
        // Treated as a transient failure: the tile is dropped this frame
        // and the viewport scheduler will ask again.
        warn!("tile buffer allocator at capacity, dropping tile load");
        mark_tile_dropped(task);
        return None;
    };
    if tile_bytes > block.len() {
        allocator.free(block);
        warn!(tile_bytes, "tile exceeds the configured block size");
        mark_tile_failed(task);
        return None;
    }

    // Re-check cancellation after the allocation; a deleted image frees
    // the buffer and still posts a null completion.
    if image.is_deletion_pending() {
        allocator.free(block);
        return None;
    }

    let decoded = image.decoder().decode_tile(
        backing_index,
        tile_index,
        &mut block.as_mut_slice()[..tile_bytes],
        &mut thread_memory.arena,
    );

    match decoded {
        Ok(true) => Some(block),
        Ok(false) => {
            // Discovered-empty tile (e.g. a bare-EOI JPEG stream): record
            // it so it is never fetched again.
            allocator.free(block);
            let mut state = image.lock();
            let level = &mut state.levels[task.level as usize];
            let tile = level.tile_at_mut(task.tile_x, task.tile_y);
            tile.is_empty = true;
            tile.submitted_for_loading = false;
            debug!(
                level = task.level,
                x = task.tile_x,
                y = task.tile_y,
                "tile is empty"
            );
            None
        }
        Err(e) => {
            allocator.free(block);
            warn!(
                level = task.level,
                x = task.tile_x,
                y = task.tile_y,
                error = %e,
                "tile decode failed"
            );
            mark_tile_failed(task);
            None
        }
    }
}

fn mark_tile_failed(task: &LoadTileTask) {
    let mut state = task.image.lock();
    let level = &mut state.levels[task.level as usize];
    let tile = level.tile_at_mut(task.tile_x, task.tile_y);
    tile.failed = true;
    tile.submitted_for_loading = false;
}

/// Allocator pressure: clear the in-flight flag without the sticky failed
/// flag, so the next frame retries.
fn mark_tile_dropped(task: &LoadTileTask) {
    let mut state = task.image.lock();
    let level = &mut state.levels[task.level as usize];
    let tile = level.tile_at_mut(task.tile_x, task.tile_y);
    tile.submitted_for_loading = false;
}

/// Publish the load outcome on the task's completion queue (or the global
/// one). A null pixel pointer signals failure/emptiness; waiters count
/// completions, so one is posted in every case.
fn post_completion(
    task: &LoadTileTask,
    pixels: Option<TileBlock>,
    allocator: &BlockAllocator,
    global_completions: &WorkQueue<TileCompletion>,
) {
    let (tile_index, tile_width, tile_height) = {
        let state = task.image.lock();
        let level = &state.levels[task.level as usize];
        (
            level.tile_index(task.tile_x, task.tile_y) as u32,
            level.tile_width,
            level.tile_height,
        )
    };
    let completion = TileCompletion {
        resource_id: task.resource_id,
        level: task.level,
        tile_index,
        tile_x: task.tile_x,
        tile_y: task.tile_y,
        pixels,
        tile_width,
        tile_height,
        want_gpu_residency: task.need_gpu_residency,
    };
    let queue = task.completion.as_deref().unwrap_or(global_completions);
    if let Err(completion) = queue.submit_or_return(completion) {
        // The completion queue should be sized for its wishlist; losing a
        // completion means losing the pixels too.
        warn!("completion queue overflow, dropping tile");
        if let Some(block) = completion.pixels {
            allocator.free(block);
        }
        mark_tile_failed(task);
    }
}

fn execute_index_level(task: IndexLevelTask) {
    let image = Arc::clone(&task.image);
    if !image.is_deletion_pending() {
        let backing_index = {
            let state = image.lock();
            state.levels[task.level as usize].backing_index
        };
        match image.decoder().index_level(backing_index) {
            Ok(()) => {
                let mut state = image.lock();
                state.levels[task.level as usize].needs_indexing = false;
                debug!(level = task.level, "level indexing complete");
            }
            Err(e) => {
                // Retryable: clear the in-flight flag, keep needs_indexing.
                let mut state = image.lock();
                state.levels[task.level as usize].indexing_submitted = false;
                warn!(level = task.level, error = %e, "level indexing failed");
            }
        }
    }
    image.release(1);
}

// =============================================================================
// Completion attachment and eviction
// =============================================================================

/// Attach a completion to its tile under the image lock. Returns the
/// pixels back when the tile cannot accept them (stale or double
/// delivery) so the caller can free the block.
pub fn attach_completion(
    image: &Image,
    completion: TileCompletion,
    mut upload_texture: Option<&mut dyn FnMut(u32, u32, &[u8]) -> u32>,
) -> Option<TileBlock> {
    let mut state = image.lock();
    let Some(level) = state.levels.get_mut(completion.level as usize) else {
        return completion.pixels;
    };
    if completion.tile_index as usize >= level.tile_count() {
        return completion.pixels;
    }

    let tile_bytes = level.tile_size_in_bytes();
    let tile = &mut level.tiles[completion.tile_index as usize];
    tile.submitted_for_loading = false;
    match completion.pixels {
        Some(block) => {
            if tile.pixels.is_some() {
                // Double delivery; keep the resident pixels.
                return Some(block);
            }
            if completion.want_gpu_residency {
                if let Some(upload) = upload_texture.as_mut() {
                    tile.texture = upload(
                        completion.tile_width,
                        completion.tile_height,
                        &block.as_slice()[..tile_bytes],
                    );
                }
            }
            tile.pixels = Some(block);
            tile.is_cached = true;
            None
        }
        None => None,
    }
}

/// Apply the Cached → Evicted transition across an image: free the pixels
/// of every tile that is neither pinned nor wanted on the GPU.
///
/// Must be called with the allocator that leased the blocks.
pub fn evict_unpinned_tiles(image: &Image, allocator: &BlockAllocator) {
    let mut state = image.lock();
    for level in &mut state.levels {
        for tile in &mut level.tiles {
            if !tile.need_keep_in_cache && !tile.need_gpu_residency {
                if let Some(block) = tile.pixels.take() {
                    allocator.free(block);
                    tile.is_cached = false;
                    tile.submitted_for_loading = false;
                }
            }
        }
    }
}
