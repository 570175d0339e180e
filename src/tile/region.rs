//! Region reconstruction: assemble an arbitrary pixel rectangle of one
//! level from its tiles.
//!
//! The read path is synchronous for the caller but concurrent inside: the
//! covering tiles are requested through the loader with a per-call
//! completion queue, and the calling thread pumps the global work queue
//! while it waits, so a region read issued from the main thread can never
//! deadlock on work it could run itself.
//!
//! Areas with no pixels (empty tiles, failed tiles, coordinates outside
//! the level grid) are filled with opaque white.

use std::sync::Arc;
use std::time::Duration;

use crate::error::SlideError;
use crate::slide::engine::EngineCore;
use crate::slide::image::Image;
use crate::tile::loader::{self, TileRequest};
use crate::work::{Semaphore, WorkQueue};

/// Background fill for uncovered areas: opaque white, one byte per
/// channel.
const BACKGROUND_BYTE: u8 = 0xFF;

/// Pixel formats a region can be delivered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit blue, green, red, alpha — the engine's native layout.
    Bgra8,
    /// 32-bit float luminance, `Y = (R + 2G + B) / 4`, normalized to 0..1.
    F32Luminance,
}

impl PixelFormat {
    /// Bytes per pixel (both formats happen to be 4).
    #[inline]
    pub const fn bytes_per_pixel(self) -> usize {
        4
    }
}

/// The covering tile range `[x0, x1) × [y0, y1)` of a pixel rectangle,
/// before clipping to the level grid.
pub(crate) fn covering_tiles(
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    tile_width: u32,
    tile_height: u32,
) -> (u32, u32, u32, u32) {
    let tile_x0 = x / tile_width;
    let tile_y0 = y / tile_height;
    let tile_x1 = (x + width - 1) / tile_width + 1;
    let tile_y1 = (y + height - 1) / tile_height + 1;
    (tile_x0, tile_y0, tile_x1, tile_y1)
}

/// Reconstruct the rectangle `(x, y, w, h)` (in `level`'s pixel
/// coordinates) into `dest`, which must hold `w * h * 4` bytes.
///
/// Reentrant: concurrent region reads on the same image are fine, each
/// with its own completion queue.
#[allow(clippy::too_many_arguments)]
pub(crate) fn read_region(
    core: &Arc<EngineCore>,
    image: &Arc<Image>,
    level: u32,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    dest: &mut [u8],
    format: PixelFormat,
) -> Result<(), SlideError> {
    if width == 0 || height == 0 {
        return Err(SlideError::Parse {
            backend: "region",
            detail: "region width and height must be positive".to_string(),
        });
    }
    let pixel_count = width as usize * height as usize;
    if dest.len() < pixel_count * format.bytes_per_pixel() {
        return Err(SlideError::Parse {
            backend: "region",
            detail: format!(
                "destination holds {} bytes, region needs {}",
                dest.len(),
                pixel_count * format.bytes_per_pixel()
            ),
        });
    }

    // Snapshot the level geometry.
    let (tile_width, tile_height, grid_w, grid_h, level_exists) = {
        let state = image.lock();
        let Some(level) = state.levels.get(level as usize) else {
            return Err(SlideError::Parse {
                backend: "region",
                detail: format!(
                    "level {} out of bounds (valid range 0-{})",
                    level,
                    state.levels.len().saturating_sub(1)
                ),
            });
        };
        (
            level.tile_width,
            level.tile_height,
            level.width_in_tiles,
            level.height_in_tiles,
            level.exists,
        )
    };

    let (tile_x0, tile_y0, tile_x1, tile_y1) =
        covering_tiles(x, y, width, height, tile_width, tile_height);
    let in_x0 = tile_x0.min(grid_w);
    let in_y0 = tile_y0.min(grid_h);
    let in_x1 = tile_x1.min(grid_w);
    let in_y1 = tile_y1.min(grid_h);

    // Request the in-bounds tiles, pinned, with a call-local completion
    // queue sized for the worst case.
    let mut submitted = 0usize;
    let max_tiles = ((in_x1.saturating_sub(in_x0)) * (in_y1.saturating_sub(in_y0))) as usize;
    let completion_queue = Arc::new(WorkQueue::new(max_tiles.max(1), Arc::new(Semaphore::new())));
    if level_exists && max_tiles > 0 {
        let mut wishlist = Vec::with_capacity(max_tiles);
        for tile_y in in_y0..in_y1 {
            for tile_x in in_x0..in_x1 {
                wishlist.push(TileRequest {
                    level,
                    tile_x,
                    tile_y,
                    need_gpu_residency: false,
                    need_keep_in_cache: true,
                });
            }
        }
        submitted = loader::request_tiles(image, &wishlist, &core.queue, Some(&completion_queue));
    }

    // Wait for every submitted tile, helping with queue work meanwhile.
    while (completion_queue.completion_count() as usize) < submitted {
        if let Some(completion) = completion_queue.try_pop() {
            completion_queue.mark_completed();
            if let Some(stale_block) = loader::attach_completion(image, completion, None) {
                core.allocator.free(stale_block);
            }
        } else if !core.pump() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    // Blit into the intermediate BGRA buffer; for the native format that
    // is the destination itself.
    match format {
        PixelFormat::Bgra8 => {
            blit_tiles(
                image,
                level,
                x,
                y,
                width,
                height,
                (tile_x0, tile_y0, tile_x1, tile_y1),
                &mut dest[..pixel_count * 4],
            );
        }
        PixelFormat::F32Luminance => {
            let mut converted = vec![0u8; pixel_count * 4];
            blit_tiles(
                image,
                level,
                x,
                y,
                width,
                height,
                (tile_x0, tile_y0, tile_x1, tile_y1),
                &mut converted,
            );
            convert_bgra_to_f32_luminance(&converted, dest);
        }
    }

    // Release the pins and reclaim anything now unneeded.
    {
        let mut state = image.lock();
        if let Some(level) = state.levels.get_mut(level as usize) {
            for tile_y in in_y0..in_y1 {
                for tile_x in in_x0..in_x1 {
                    level.tile_at_mut(tile_x, tile_y).need_keep_in_cache = false;
                }
            }
        }
    }
    loader::evict_unpinned_tiles(image, &core.allocator);

    Ok(())
}

/// Copy each covering tile's clipped sub-rectangle into the destination,
/// filling uncovered areas with white.
#[allow(clippy::too_many_arguments)]
fn blit_tiles(
    image: &Arc<Image>,
    level_index: u32,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    tiles: (u32, u32, u32, u32),
    dest: &mut [u8],
) {
    let (tile_x0, tile_y0, tile_x1, tile_y1) = tiles;
    let state = image.lock();
    let level = &state.levels[level_index as usize];
    let tile_w = level.tile_width as usize;
    let tile_h = level.tile_height as usize;
    let dest_stride = width as usize * 4;

    // Per-edge offsets of the region within its corner tiles.
    let x0_offset = (x as usize) % tile_w;
    let y0_offset = (y as usize) % tile_h;
    let x1_offset = ((x + width - 1) as usize) % tile_w + 1;
    let y1_offset = ((y + height - 1) as usize) % tile_h + 1;

    for tile_y in tile_y0..tile_y1 {
        let mut dest_y = ((tile_y - tile_y0) as usize) * tile_h;
        if tile_y > tile_y0 {
            dest_y -= y0_offset;
        }
        let copy_y0 = if tile_y == tile_y0 { y0_offset } else { 0 };
        let copy_y1 = if tile_y == tile_y1 - 1 { y1_offset } else { tile_h };

        for tile_x in tile_x0..tile_x1 {
            let mut dest_x = ((tile_x - tile_x0) as usize) * tile_w;
            if tile_x > tile_x0 {
                dest_x -= x0_offset;
            }
            let copy_x0 = if tile_x == tile_x0 { x0_offset } else { 0 };
            let copy_x1 = if tile_x == tile_x1 - 1 { x1_offset } else { tile_w };
            let copy_width = copy_x1 - copy_x0;

            let mut copied = false;
            if tile_x < level.width_in_tiles && tile_y < level.height_in_tiles {
                let tile = level.tile_at(tile_x, tile_y);
                if !tile.is_empty && tile.is_cached {
                    if let Some(block) = &tile.pixels {
                        let pixels = block.as_slice();
                        for src_y in copy_y0..copy_y1 {
                            let src_start = (src_y * tile_w + copy_x0) * 4;
                            let dst_start = (dest_y + (src_y - copy_y0)) * dest_stride + dest_x * 4;
                            dest[dst_start..dst_start + copy_width * 4]
                                .copy_from_slice(&pixels[src_start..src_start + copy_width * 4]);
                        }
                        copied = true;
                    }
                }
            }
            if !copied {
                for src_y in copy_y0..copy_y1 {
                    let dst_start = (dest_y + (src_y - copy_y0)) * dest_stride + dest_x * 4;
                    dest[dst_start..dst_start + copy_width * 4].fill(BACKGROUND_BYTE);
                }
            }
        }
    }
}

/// Convert a BGRA buffer to float luminance using the reversible YCoCg
/// transform's Y term: `Y = (R + 2G + B) / 4`.
fn convert_bgra_to_f32_luminance(bgra: &[u8], dest: &mut [u8]) {
    for (src, dst) in bgra.chunks_exact(4).zip(dest.chunks_exact_mut(4)) {
        let b = src[0] as f32 * (1.0 / 255.0);
        let g = src[1] as f32 * (1.0 / 255.0);
        let r = src[2] as f32 * (1.0 / 255.0);
        let luminance = (r + 2.0 * g + b) * 0.25;
        dst.copy_from_slice(&luminance.to_ne_bytes());
    }
}

/// Apply a black/white-level window to a BGRA buffer in place: values at
/// or below `black_level` clamp to 0, at or above `white_level` to 255,
/// with a linear ramp between. Alpha is untouched.
///
/// This is the only color adjustment the engine performs; anything beyond
/// it belongs to the renderer.
pub fn apply_level_window(bgra: &mut [u8], black_level: u8, white_level: u8) {
    if white_level <= black_level {
        return;
    }
    // Precompute the 256-entry ramp once; the buffers are tile-sized.
    let range = (white_level - black_level) as f32;
    let mut ramp = [0u8; 256];
    for (value, out) in ramp.iter_mut().enumerate() {
        let scaled = (value as f32 - black_level as f32) * (255.0 / range);
        *out = scaled.clamp(0.0, 255.0) as u8;
    }
    for pixel in bgra.chunks_exact_mut(4) {
        pixel[0] = ramp[pixel[0] as usize];
        pixel[1] = ramp[pixel[1] as usize];
        pixel[2] = ramp[pixel[2] as usize];
    }
}
