//! The engine: worker pool, work queues, block allocator, and the open
//! image table.
//!
//! One engine owns everything the tile pipeline shares: a normal and a
//! high-priority task lane behind one semaphore, the global completion
//! queue drained by the embedder once per frame, the block allocator
//! bounding pixel residency, and the table of open images keyed by
//! resource id.
//!
//! Any thread may pump the queues cooperatively; the worker threads do so
//! whenever the semaphore signals. The main thread pumps from inside wait
//! loops, which is what keeps `destroy_image` and the region reader free
//! of deadlocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::SlideError;
use crate::memory::{with_thread_memory, BlockAllocator};
use crate::slide::image::Image;
use crate::slide::open;
use crate::tile::loader::{self, Task, TileCompletion, TileRequest};
use crate::tile::region::{self, PixelFormat};
use crate::work::{call_depth, CallDepthGuard, Semaphore, WorkQueue};

/// Upper bound on the worker pool, however many cores the host reports.
const MAX_WORKER_THREADS: usize = 128;

/// Shared engine internals, also held by the worker threads.
pub(crate) struct EngineCore {
    pub(crate) semaphore: Arc<Semaphore>,
    /// Normal task lane.
    pub(crate) queue: WorkQueue<Task>,
    /// High-priority lane sharing the semaphore; workers prefer it.
    pub(crate) queue_high: WorkQueue<Task>,
    /// Global completion queue, drained by `pump_completions`.
    pub(crate) completions: WorkQueue<TileCompletion>,
    pub(crate) allocator: Arc<BlockAllocator>,
    images: Mutex<Vec<Arc<Image>>>,
    shutdown: AtomicBool,
}

impl EngineCore {
    /// Run one queued task if any is available. High lane first.
    pub(crate) fn pump(&self) -> bool {
        let (task, high) = match self.queue_high.try_pop() {
            Some(task) => (task, true),
            None => match self.queue.try_pop() {
                Some(task) => (task, false),
                None => return false,
            },
        };

        {
            let _depth = CallDepthGuard::enter();
            with_thread_memory(|tm| {
                loader::execute_task(task, &self.allocator, &self.completions, tm)
            });
        }
        if high {
            self.queue_high.mark_completed();
        } else {
            self.queue.mark_completed();
        }
        true
    }

    /// Whether any submitted task has not completed, excluding tasks
    /// executing on the calling thread's own stack.
    pub(crate) fn is_work_in_progress(&self) -> bool {
        let goal = self.queue.completion_goal() + self.queue_high.completion_goal();
        let done = self.queue.completion_count() + self.queue_high.completion_count();
        goal.saturating_sub(call_depth()) > done
    }

    fn find_image(&self, resource_id: u64) -> Option<Arc<Image>> {
        self.images
            .lock()
            .iter()
            .find(|img| img.resource_id == resource_id)
            .cloned()
    }

    fn worker_loop(&self, worker_index: usize) {
        debug!(worker = worker_index, "worker thread started");
        loop {
            self.semaphore.wait();
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            while self.pump() {}
        }
        debug!(worker = worker_index, "worker thread exiting");
    }
}

/// The slide access engine.
pub struct Engine {
    core: Arc<EngineCore>,
    workers: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Create an engine with the given configuration, spawning its worker
    /// pool.
    pub fn new(config: EngineConfig) -> Self {
        let worker_count = if config.worker_threads > 0 {
            config.worker_threads.min(MAX_WORKER_THREADS)
        } else {
            (num_cpus::get().saturating_sub(1)).clamp(1, MAX_WORKER_THREADS)
        };

        let semaphore = Arc::new(Semaphore::new());
        let core = Arc::new(EngineCore {
            semaphore: Arc::clone(&semaphore),
            queue: WorkQueue::new(config.queue_capacity, Arc::clone(&semaphore)),
            queue_high: WorkQueue::new(config.queue_capacity, Arc::clone(&semaphore)),
            // Completions never wake workers; their semaphore is private.
            completions: WorkQueue::new(config.queue_capacity, Arc::new(Semaphore::new())),
            allocator: Arc::new(BlockAllocator::new(
                config.block_size,
                config.blocks_per_chunk,
                config.max_chunks,
            )),
            images: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let core = Arc::clone(&core);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("wsi-worker-{}", i))
                    .spawn(move || core.worker_loop(i))
                    .expect("spawning a worker thread"),
            );
        }
        info!(workers = worker_count, "engine started");

        Self { core, workers }
    }

    /// The block allocator bounding tile pixel residency.
    pub fn allocator(&self) -> &Arc<BlockAllocator> {
        &self.core.allocator
    }

    // =========================================================================
    // Opening and destroying images
    // =========================================================================

    /// Open a slide file and register it with the engine.
    pub fn open_image(&self, path: impl AsRef<std::path::Path>) -> Result<Arc<Image>, SlideError> {
        self.register(open::open_image(path, false, None)?)
    }

    /// Open a slide as an overlay on `parent`, inheriting its resolution.
    pub fn open_overlay(
        &self,
        path: impl AsRef<std::path::Path>,
        parent: &Image,
    ) -> Result<Arc<Image>, SlideError> {
        self.register(open::open_image(path, true, Some(parent))?)
    }

    fn register(&self, image: Image) -> Result<Arc<Image>, SlideError> {
        // Every level's tiles must fit the allocator's uniform block size.
        let max_tile_bytes = {
            let state = image.lock();
            state
                .levels
                .iter()
                .map(|l| l.tile_size_in_bytes())
                .max()
                .unwrap_or(0)
        };
        if max_tile_bytes > self.core.allocator.block_size() {
            return Err(SlideError::UnsupportedFormat {
                reason: format!(
                    "tile size {} bytes exceeds the configured block size {}",
                    max_tile_bytes,
                    self.core.allocator.block_size()
                ),
            });
        }

        let image = Arc::new(image);
        self.core.images.lock().push(Arc::clone(&image));
        Ok(image)
    }

    /// Destroy an image: begin cooperative cancellation, drain its
    /// outstanding tasks (running queue work on this thread), then release
    /// every resource it holds. GPU textures are released through
    /// `unload_texture`.
    pub fn destroy_image_with(&self, image: &Arc<Image>, mut unload_texture: impl FnMut(u32)) {
        image.mark_deletion_pending();

        // Tasks always post their completion before dropping the
        // refcount, so after this loop every completion is queued.
        while image.task_refcount() > 0 {
            if !self.core.pump() {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        // Unregister first so queued completions for this image are
        // recognized as stale and their blocks recycled.
        self.core
            .images
            .lock()
            .retain(|img| img.resource_id != image.resource_id);
        self.pump_completions_with(None);

        let mut state = image.lock();
        for level in &mut state.levels {
            for tile in &mut level.tiles {
                if let Some(block) = tile.pixels.take() {
                    self.core.allocator.free(block);
                }
                tile.is_cached = false;
                if tile.texture != 0 {
                    unload_texture(tile.texture);
                    tile.texture = 0;
                }
            }
            level.tiles.clear();
        }
        state.levels.clear();
        debug!(resource_id = image.resource_id, "image destroyed");
    }

    /// [`Engine::destroy_image_with`] for embedders without GPU state.
    pub fn destroy_image(&self, image: &Arc<Image>) {
        self.destroy_image_with(image, |_| {});
    }

    // =========================================================================
    // Tile requests and completions
    // =========================================================================

    /// Submit a tile wishlist on the normal lane. Returns the number of
    /// load tasks enqueued.
    pub fn request_tiles(&self, image: &Arc<Image>, wishlist: &[TileRequest]) -> usize {
        loader::request_tiles(image, wishlist, &self.core.queue, None)
    }

    /// Submit a tile wishlist on the high-priority lane.
    pub fn request_tiles_high_priority(
        &self,
        image: &Arc<Image>,
        wishlist: &[TileRequest],
    ) -> usize {
        loader::request_tiles(image, wishlist, &self.core.queue_high, None)
    }

    /// Drain the global completion queue, attaching pixels to their tiles.
    /// Call once per frame from the embedder's main loop.
    ///
    /// `upload_texture` is invoked for completions that asked for GPU
    /// residency; it returns the new texture handle.
    pub fn pump_completions_with(
        &self,
        mut upload_texture: Option<&mut dyn FnMut(u32, u32, &[u8]) -> u32>,
    ) -> usize {
        let mut handled = 0usize;
        while let Some(completion) = self.core.completions.try_pop() {
            self.core.completions.mark_completed();
            handled += 1;
            match self.core.find_image(completion.resource_id) {
                Some(image) => {
                    let reborrowed: Option<&mut dyn FnMut(u32, u32, &[u8]) -> u32> =
                        match upload_texture.as_mut() {
                            Some(f) => Some(&mut **f),
                            None => None,
                        };
                    if let Some(stale_block) =
                        loader::attach_completion(&image, completion, reborrowed)
                    {
                        self.core.allocator.free(stale_block);
                    }
                }
                None => {
                    // The image is already gone; recycle the pixels.
                    if let Some(block) = completion.pixels {
                        self.core.allocator.free(block);
                    }
                }
            }
        }
        handled
    }

    /// [`Engine::pump_completions_with`] without a GPU upload callback.
    pub fn pump_completions(&self) -> usize {
        self.pump_completions_with(None)
    }

    /// Free the pixels of every unpinned tile of an image.
    pub fn evict_unpinned_tiles(&self, image: &Image) {
        loader::evict_unpinned_tiles(image, &self.core.allocator);
    }

    /// Run queued tasks on the calling thread until both lanes are idle.
    pub fn drain(&self) {
        while self.core.is_work_in_progress() {
            if !self.core.pump() {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    // =========================================================================
    // Region reading
    // =========================================================================

    /// Reconstruct the pixel rectangle `(x, y, w, h)` of `level` into
    /// `dest`. See [`region::read_region`].
    #[allow(clippy::too_many_arguments)]
    pub fn read_region(
        &self,
        image: &Arc<Image>,
        level: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        dest: &mut [u8],
        format: PixelFormat,
    ) -> Result<(), SlideError> {
        region::read_region(&self.core, image, level, x, y, width, height, dest, format)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.core.shutdown.store(true, Ordering::Release);
        for _ in 0..self.workers.len() {
            self.core.semaphore.post();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
