//! Engine configuration and the command-line interface.

use std::path::PathBuf;

use clap::Parser;

/// Default tile pixel buffer size: one 512x512 BGRA tile. Covers every
/// tile geometry produced by the supported containers.
pub const DEFAULT_BLOCK_SIZE: usize = 512 * 512 * 4;

/// Default blocks per allocator chunk.
pub const DEFAULT_BLOCKS_PER_CHUNK: u32 = 64;

/// Default maximum allocator chunks (512 MiB of tile pixels at the
/// default block size).
pub const DEFAULT_MAX_CHUNKS: u32 = 8;

/// Default work queue capacity per lane.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Tunables for [`crate::slide::Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker thread count; 0 means one less than the logical CPU count,
    /// capped at 128.
    pub worker_threads: usize,

    /// Capacity of each work queue lane.
    pub queue_capacity: usize,

    /// Size in bytes of one tile pixel buffer.
    pub block_size: usize,

    /// Blocks per allocator chunk (chunks grow lazily).
    pub blocks_per_chunk: u32,

    /// Maximum number of allocator chunks; the hard residency cap.
    pub max_chunks: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            block_size: DEFAULT_BLOCK_SIZE,
            blocks_per_chunk: DEFAULT_BLOCKS_PER_CHUNK,
            max_chunks: DEFAULT_MAX_CHUNKS,
        }
    }
}

impl EngineConfig {
    /// The residency cap in bytes implied by this configuration.
    pub fn cache_capacity_bytes(&self) -> usize {
        self.block_size * self.blocks_per_chunk as usize * self.max_chunks as usize
    }
}

/// Command-line interface: open a slide and report on it.
#[derive(Debug, Parser)]
#[command(name = "wsi-engine", about = "Open a whole-slide image and exercise its tile pipeline")]
pub struct Cli {
    /// Path to a slide (TIFF/BigTIFF/SVS, MRXS directory or .mrxs file,
    /// DICOM instance, or plain raster image)
    pub path: PathBuf,

    /// Worker thread count (default: logical CPUs minus one)
    #[arg(long, default_value_t = 0)]
    pub threads: usize,

    /// Tile pixel cache capacity in MiB
    #[arg(long, default_value_t = 512)]
    pub cache_mb: usize,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Translate CLI flags into an engine configuration.
    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig {
            worker_threads: self.threads,
            ..EngineConfig::default()
        };
        // Express the requested cache size as a chunk count.
        let chunk_bytes = config.block_size * config.blocks_per_chunk as usize;
        let chunks = (self.cache_mb * 1024 * 1024).div_ceil(chunk_bytes);
        config.max_chunks = chunks.clamp(1, 1024) as u32;
        config
    }
}
