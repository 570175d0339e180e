//! The backend-agnostic pyramid model: Image → Levels → Tiles.
//!
//! An [`Image`] is shared across threads behind an `Arc`. All Level and
//! Tile mutation happens under the image's mutex; the task refcount and
//! the deletion flag are atomics so the loader and teardown can consult
//! them without taking the lock.
//!
//! Memory lifetime and task lifetime are deliberately separate: `Arc`
//! keeps the struct alive, while `task_refcount` counts outstanding work
//! queue tasks borrowing the image. Destruction waits for the latter to
//! drain (cooperatively running tasks) before releasing backend
//! resources.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::error::SlideError;
use crate::format::BackendKind;
use crate::memory::{Arena, TileBlock};

/// Monotonic id source for open images. A task carrying a stale id is
/// dropped by the worker instead of touching a recycled image slot.
static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_resource_id() -> u64 {
    NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed)
}

// =============================================================================
// Tile
// =============================================================================

/// One tile slot of a level.
///
/// The coordinate triple is redundant with the slot position and kept for
/// introspection.
#[derive(Debug, Default)]
pub struct Tile {
    pub tile_index: u32,
    pub tile_x: u32,
    pub tile_y: u32,

    /// The container declared no bytes for this tile; it is never fetched
    /// and renders as background.
    pub is_empty: bool,

    /// CPU-resident pixels, leased from the block allocator.
    pub pixels: Option<TileBlock>,

    /// Pixels are resident. Holds exactly when `pixels` is `Some`.
    pub is_cached: bool,

    /// GPU texture handle; 0 when not resident. Written by the embedder's
    /// upload callback, never created by the engine.
    pub texture: u32,

    /// Pinned by an in-flight region read.
    pub need_keep_in_cache: bool,

    /// The viewport wants this tile on the GPU.
    pub need_gpu_residency: bool,

    /// A load task has been enqueued and has not finished.
    pub submitted_for_loading: bool,

    /// The last decode attempt failed.
    pub failed: bool,
}

/// A copy of one tile's flags for callers outside the image lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileStatus {
    pub is_empty: bool,
    pub is_cached: bool,
    pub submitted_for_loading: bool,
    pub failed: bool,
    pub texture: u32,
}

// =============================================================================
// Level
// =============================================================================

/// One downsample step of the pyramid.
#[derive(Debug, Default)]
pub struct Level {
    /// Backed by a real container level; placeholder levels synthesized
    /// for missing downsample steps have `exists == false` and no tiles.
    pub exists: bool,

    /// Which container-native image this level wraps (IFD index, MRXS
    /// zoom level, DICOM instance).
    pub backing_index: usize,

    pub width_in_pixels: u32,
    pub height_in_pixels: u32,
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
    pub tile_width: u32,
    pub tile_height: u32,

    pub downsample_factor: f32,
    pub um_per_pixel_x: f32,
    pub um_per_pixel_y: f32,
    pub x_tile_side_in_um: f32,
    pub y_tile_side_in_um: f32,

    /// Sub-pixel origin offset relative to the base level (MRXS cameras
    /// do not align level origins exactly).
    pub origin_offset_x: f32,
    pub origin_offset_y: f32,

    /// Row-major tile slots.
    pub tiles: Vec<Tile>,

    /// The per-tile index must be built by a background task before tiles
    /// can be requested.
    pub needs_indexing: bool,

    /// An indexing task is in flight; prevents duplicate jobs.
    pub indexing_submitted: bool,
}

impl Level {
    /// Number of tile slots.
    #[inline]
    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Flat index of tile (x, y).
    #[inline]
    pub fn tile_index(&self, tile_x: u32, tile_y: u32) -> usize {
        (tile_y * self.width_in_tiles + tile_x) as usize
    }

    /// Borrow tile (x, y).
    pub fn tile_at(&self, tile_x: u32, tile_y: u32) -> &Tile {
        &self.tiles[self.tile_index(tile_x, tile_y)]
    }

    /// Borrow tile (x, y) mutably.
    pub fn tile_at_mut(&mut self, tile_x: u32, tile_y: u32) -> &mut Tile {
        let index = self.tile_index(tile_x, tile_y);
        &mut self.tiles[index]
    }

    /// Bytes of one decoded tile of this level.
    #[inline]
    pub fn tile_size_in_bytes(&self) -> usize {
        self.tile_width as usize * self.tile_height as usize * 4
    }

    /// Allocate the tile slots with their coordinate triples.
    pub(crate) fn allocate_tiles(&mut self) {
        let count = (self.width_in_tiles * self.height_in_tiles) as usize;
        self.tiles = (0..count)
            .map(|i| Tile {
                tile_index: i as u32,
                tile_x: i as u32 % self.width_in_tiles.max(1),
                tile_y: i as u32 / self.width_in_tiles.max(1),
                ..Tile::default()
            })
            .collect();
    }
}

// =============================================================================
// Associated images
// =============================================================================

/// A small associated raster (macro overview or specimen label), decoded
/// to BGRA at open time.
pub struct AssociatedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

// =============================================================================
// Image
// =============================================================================

/// State guarded by the image lock.
pub struct ImageState {
    pub levels: Vec<Level>,
    pub mpp_x: f32,
    pub mpp_y: f32,
    pub is_mpp_known: bool,
    pub width_in_um: f32,
    pub height_in_um: f32,
}

/// Backend decode interface used by the tile loader.
///
/// Implementations are immutable after open (interior mutability only for
/// deferred indexes) so worker threads can decode concurrently.
pub trait TileDecoder: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Decode one tile of the backing image into `dest` (BGRA). Returns
    /// `Ok(false)` when the tile turned out to be logically empty.
    fn decode_tile(
        &self,
        backing_index: usize,
        tile_index: u32,
        dest: &mut [u8],
        scratch: &mut Arena,
    ) -> Result<bool, SlideError>;

    /// Build the deferred per-tile index of a backing image.
    fn index_level(&self, _backing_index: usize) -> Result<(), SlideError> {
        Err(SlideError::Parse {
            backend: "engine",
            detail: "backend does not defer level indexing".to_string(),
        })
    }

    /// Record a corrected resolution on the native backend state so
    /// derived quantities agree after `change_resolution`.
    fn rescale_mpp(&self, _mpp_x: f64, _mpp_y: f64) {}
}

/// One opened slide.
pub struct Image {
    pub backend: BackendKind,
    pub resource_id: u64,

    pub width_in_pixels: u32,
    pub height_in_pixels: u32,
    pub tile_width: u32,
    pub tile_height: u32,

    /// Overlays inherit their parent's resolution so slightly different
    /// source tags cannot cause visible mis-registration.
    pub is_overlay: bool,

    pub macro_image: Option<AssociatedImage>,
    pub label_image: Option<AssociatedImage>,

    state: Mutex<ImageState>,
    decoder: Box<dyn TileDecoder>,

    task_refcount: AtomicU32,
    deletion_pending: AtomicBool,
}

impl Image {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        backend: BackendKind,
        width_in_pixels: u32,
        height_in_pixels: u32,
        tile_width: u32,
        tile_height: u32,
        is_overlay: bool,
        macro_image: Option<AssociatedImage>,
        label_image: Option<AssociatedImage>,
        state: ImageState,
        decoder: Box<dyn TileDecoder>,
    ) -> Self {
        Self {
            backend,
            resource_id: next_resource_id(),
            width_in_pixels,
            height_in_pixels,
            tile_width,
            tile_height,
            is_overlay,
            macro_image,
            label_image,
            state: Mutex::new(state),
            decoder,
            task_refcount: AtomicU32::new(0),
            deletion_pending: AtomicBool::new(false),
        }
    }

    /// Take the image lock.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, ImageState> {
        self.state.lock()
    }

    /// The backend decode interface.
    #[inline]
    pub fn decoder(&self) -> &dyn TileDecoder {
        self.decoder.as_ref()
    }

    /// Number of downsample levels (including placeholders).
    pub fn level_count(&self) -> usize {
        self.lock().levels.len()
    }

    /// Whether a level's per-tile index is ready for tile requests.
    pub fn level_is_indexed(&self, level: usize) -> bool {
        let state = self.lock();
        state
            .levels
            .get(level)
            .map(|l| !l.needs_indexing)
            .unwrap_or(false)
    }

    /// Copy one tile's flags (for introspection and tests).
    pub fn tile_status(&self, level: usize, tile_x: u32, tile_y: u32) -> Option<TileStatus> {
        let state = self.lock();
        let level = state.levels.get(level)?;
        if tile_x >= level.width_in_tiles || tile_y >= level.height_in_tiles {
            return None;
        }
        Some(snapshot(level.tile_at(tile_x, tile_y)))
    }

    /// Like [`Image::tile_status`], addressing the tile by its row-major
    /// flat index.
    pub fn tile_status_from_flat_index(
        &self,
        level: usize,
        tile_index: usize,
    ) -> Option<TileStatus> {
        let state = self.lock();
        let level = state.levels.get(level)?;
        level.tiles.get(tile_index).map(snapshot)
    }

    /// Current microns-per-pixel (x, y) and whether it came from the file.
    pub fn mpp(&self) -> (f32, f32, bool) {
        let state = self.lock();
        (state.mpp_x, state.mpp_y, state.is_mpp_known)
    }

    /// Propagate a corrected resolution to every level and to the native
    /// backend, keeping derived quantities consistent.
    pub fn change_resolution(&self, mpp_x: f32, mpp_y: f32) {
        let mut state = self.lock();
        state.mpp_x = mpp_x;
        state.mpp_y = mpp_y;
        state.is_mpp_known = true;
        state.width_in_um = self.width_in_pixels as f32 * mpp_x;
        state.height_in_um = self.height_in_pixels as f32 * mpp_y;
        for level in &mut state.levels {
            level.um_per_pixel_x = mpp_x * level.downsample_factor;
            level.um_per_pixel_y = mpp_y * level.downsample_factor;
            level.x_tile_side_in_um = level.um_per_pixel_x * level.tile_width as f32;
            level.y_tile_side_in_um = level.um_per_pixel_y * level.tile_height as f32;
        }
        drop(state);
        self.decoder.rescale_mpp(mpp_x as f64, mpp_y as f64);
    }

    // =========================================================================
    // Task refcount and teardown flags
    // =========================================================================

    /// Count one more outstanding task borrowing this image.
    #[inline]
    pub(crate) fn retain(&self) {
        self.task_refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Release one outstanding task.
    #[inline]
    pub(crate) fn release(&self, count: u32) {
        self.task_refcount.fetch_sub(count, Ordering::AcqRel);
    }

    /// Outstanding task count.
    #[inline]
    pub fn task_refcount(&self) -> u32 {
        self.task_refcount.load(Ordering::Acquire)
    }

    /// Begin cooperative teardown: long-running tasks observe this at
    /// natural boundaries and exit early.
    #[inline]
    pub(crate) fn mark_deletion_pending(&self) {
        self.deletion_pending.store(true, Ordering::Release);
    }

    /// Whether teardown has begun.
    #[inline]
    pub fn is_deletion_pending(&self) -> bool {
        self.deletion_pending.load(Ordering::Acquire)
    }
}

fn snapshot(tile: &Tile) -> TileStatus {
    TileStatus {
        is_empty: tile.is_empty,
        is_cached: tile.is_cached,
        submitted_for_loading: tile.submitted_for_loading,
        failed: tile.failed,
        texture: tile.texture,
    }
}
