//! Viewport-driven tile scheduling.
//!
//! The embedder describes what the virtual microscope is looking at — a
//! rectangle in slide micron coordinates and a target resolution — and
//! this module turns that into the tile wishlist the loader consumes:
//! which pyramid level to draw, which tiles of it are visible, and in
//! what order to load them (center-out, so the middle of the screen
//! fills in first).
//!
//! Level choice biases toward higher resolution: the deepest level whose
//! microns-per-pixel does not exceed the target still looks crisp when
//! scaled down, while the next level up would have to be upscaled.

use crate::slide::image::Image;
use crate::tile::loader::TileRequest;

/// What the viewer is currently looking at.
#[derive(Debug, Clone, Copy, Default)]
pub struct Viewport {
    /// Left edge in slide micron coordinates.
    pub x_um: f32,
    /// Top edge in slide micron coordinates.
    pub y_um: f32,
    /// Width in microns.
    pub width_um: f32,
    /// Height in microns.
    pub height_um: f32,
    /// Target resolution on screen, in microns per displayed pixel.
    pub target_um_per_pixel: f32,
}

/// A planned wishlist for one frame.
#[derive(Debug, Clone)]
pub struct ViewportPlan {
    /// The level chosen for this zoom.
    pub level: u32,
    /// Visible tiles in load order (center-out), ready for
    /// `request_tiles`.
    pub wishlist: Vec<TileRequest>,
}

/// Pick the level to draw for a target resolution.
///
/// Returns the deepest existing, indexed level whose `um_per_pixel_x`
/// does not exceed the target; level 0 when even the base level is too
/// coarse. Levels awaiting deferred indexing are skipped (requesting
/// them would only schedule the indexing job).
pub fn level_for_target_resolution(image: &Image, target_um_per_pixel: f32) -> u32 {
    let state = image.lock();
    let mut best = 0u32;
    for (index, level) in state.levels.iter().enumerate() {
        if !level.exists || level.needs_indexing {
            continue;
        }
        if level.um_per_pixel_x <= target_um_per_pixel {
            best = index as u32;
        }
    }
    best
}

/// Build the wishlist covering a viewport.
///
/// Tiles are ordered by distance from the viewport center so the load
/// queue fills the middle of the screen first. Tiles flagged for GPU
/// residency; the cache pin is left to region reads.
pub fn plan_viewport(image: &Image, viewport: &Viewport) -> ViewportPlan {
    let level_index = level_for_target_resolution(image, viewport.target_um_per_pixel);

    let state = image.lock();
    let level = &state.levels[level_index as usize];
    if !level.exists
        || level.needs_indexing
        || level.x_tile_side_in_um <= 0.0
        || level.y_tile_side_in_um <= 0.0
    {
        return ViewportPlan {
            level: level_index,
            wishlist: Vec::new(),
        };
    }

    // Visible tile range in this level's grid.
    let tile_x0 = (viewport.x_um / level.x_tile_side_in_um).floor().max(0.0) as u32;
    let tile_y0 = (viewport.y_um / level.y_tile_side_in_um).floor().max(0.0) as u32;
    let tile_x1 = (((viewport.x_um + viewport.width_um) / level.x_tile_side_in_um).ceil() as u32)
        .min(level.width_in_tiles);
    let tile_y1 = (((viewport.y_um + viewport.height_um) / level.y_tile_side_in_um).ceil() as u32)
        .min(level.height_in_tiles);

    let center_x = (viewport.x_um + viewport.width_um * 0.5) / level.x_tile_side_in_um;
    let center_y = (viewport.y_um + viewport.height_um * 0.5) / level.y_tile_side_in_um;

    let mut tiles: Vec<(u32, u32)> = Vec::new();
    for tile_y in tile_y0..tile_y1 {
        for tile_x in tile_x0..tile_x1 {
            let tile = level.tile_at(tile_x, tile_y);
            if tile.is_empty || tile.failed || tile.texture != 0 {
                continue;
            }
            tiles.push((tile_x, tile_y));
        }
    }
    drop(state);

    // Center-out order: squared distance from the tile center to the
    // viewport center, in tile units.
    tiles.sort_by(|a, b| {
        let da = tile_center_distance_sq(*a, center_x, center_y);
        let db = tile_center_distance_sq(*b, center_x, center_y);
        da.total_cmp(&db)
    });

    ViewportPlan {
        level: level_index,
        wishlist: tiles
            .into_iter()
            .map(|(tile_x, tile_y)| TileRequest {
                level: level_index,
                tile_x,
                tile_y,
                need_gpu_residency: true,
                need_keep_in_cache: false,
            })
            .collect(),
    }
}

fn tile_center_distance_sq(tile: (u32, u32), center_x: f32, center_y: f32) -> f32 {
    let dx = tile.0 as f32 + 0.5 - center_x;
    let dy = tile.1 as f32 + 0.5 - center_y;
    dx * dx + dy * dy
}
