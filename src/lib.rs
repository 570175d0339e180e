//! # WSI Engine
//!
//! A slide access engine for digital pathology viewers. Whole-slide
//! images are gigapixel, tiled, multi-resolution pyramids in vendor
//! container formats; this crate parses those containers and delivers the
//! tiles covering a viewport at interactive rates, on slides that do not
//! fit in memory.
//!
//! ## Architecture
//!
//! - [`io`] - positional and sequential byte access, remote chunk framing
//! - [`memory`] - per-thread bump arenas and the tile pixel block allocator
//! - [`work`] - bounded MPMC work queues with priority lanes
//! - [`mod@format`] - container readers: TIFF/BigTIFF, MRXS, DICOM, simple
//!   rasters, iSyntax detection, optional OpenSlide shim
//! - [`slide`] - the backend-agnostic Image → Level → Tile model and the
//!   [`slide::Engine`] owning the pipeline
//! - [`tile`] - the concurrent tile loader and the region reader
//! - [`config`] - engine tuning and the CLI surface
//!
//! ## Example
//!
//! ```rust,no_run
//! use wsi_engine::{Engine, EngineConfig, PixelFormat};
//!
//! let engine = Engine::new(EngineConfig::default());
//! let image = engine.open_image("slide.svs").expect("open failed");
//!
//! // Read a 1024x1024 region of level 0 starting at (32768, 32768).
//! let mut pixels = vec![0u8; 1024 * 1024 * 4];
//! engine
//!     .read_region(&image, 0, 32768, 32768, 1024, 1024, &mut pixels, PixelFormat::Bgra8)
//!     .expect("read failed");
//!
//! engine.destroy_image(&image);
//! ```

pub mod config;
pub mod error;
pub mod format;
pub mod io;
pub mod memory;
pub mod slide;
pub mod tile;
pub mod work;

// Re-export commonly used types
pub use config::{Cli, EngineConfig};
pub use error::{DicomError, IoError, MrxsError, SlideError, TiffError};
pub use format::tiff::{
    validate_pyramid, ByteOrder, Compression, Ifd, TiffFile, TiffHeader, TiffTag,
};
pub use format::{detect_format, is_tiff_header, BackendKind};
pub use memory::{Arena, BlockAllocator, TileBlock};
pub use slide::{AssociatedImage, Engine, Image, Level, Tile, TileDecoder, TileStatus};
pub use tile::{plan_viewport, PixelFormat, TileRequest, Viewport, ViewportPlan};
pub use work::{RingQueue, Semaphore, WorkQueue};
