//! Engine-level tests: the concurrent loader, cache invariants, region
//! reconstruction, lazy indexing, and teardown.

use wsi_engine::{Engine, EngineConfig, PixelFormat, TileRequest};

use super::test_utils::{
    build_dicom_fixture, positional_rgb_tile, solid_jpeg, write_tiff_file, TestIfd,
};

fn small_engine() -> Engine {
    Engine::new(EngineConfig {
        worker_threads: 2,
        ..EngineConfig::default()
    })
}

/// An uncompressed RGB slide where every pixel is position-coded, for
/// byte-exact region assertions.
fn positional_slide() -> tempfile::NamedTempFile {
    let mut ifd = TestIfd::tiled(1024, 768, 256, 1, Vec::new());
    ifd.samples_per_pixel = 3;
    ifd.tile_data = (0..12)
        .map(|i| positional_rgb_tile(256, 256, (i % 4) as u8 * 10 + 1, (i / 4) as u8 * 10 + 1))
        .collect();
    write_tiff_file(true, false, &[ifd])
}

// =============================================================================
// Region reconstruction
// =============================================================================

#[test]
fn test_read_region_pixel_origin() {
    let tmp = positional_slide();
    let engine = small_engine();
    let image = engine.open_image(tmp.path()).unwrap();

    // Destination (0, 0) must come from source pixel (100, 100) of tile
    // (0, 0).
    let mut dest = vec![0u8; 300 * 300 * 4];
    engine
        .read_region(&image, 0, 100, 100, 300, 300, &mut dest, PixelFormat::Bgra8)
        .unwrap();

    // Tile (0,0) markers: R=1, G=1; pixel (100,100): B=(100+100)%256.
    assert_eq!(&dest[0..4], &[200, 1, 1, 255]);

    // Destination (200, 0) falls in tile (1, 0): source pixel (44, 100).
    let px = &dest[200 * 4..200 * 4 + 4];
    assert_eq!(px, &[(44 + 100) as u8, 1, 11, 255]);

    engine.destroy_image(&image);
}

#[test]
fn test_read_region_idempotent() {
    let tmp = positional_slide();
    let engine = small_engine();
    let image = engine.open_image(tmp.path()).unwrap();

    let mut first = vec![0u8; 300 * 300 * 4];
    engine
        .read_region(&image, 0, 100, 100, 300, 300, &mut first, PixelFormat::Bgra8)
        .unwrap();
    engine.drain();
    engine.pump_completions();

    let mut second = vec![0u8; 300 * 300 * 4];
    engine
        .read_region(&image, 0, 100, 100, 300, 300, &mut second, PixelFormat::Bgra8)
        .unwrap();

    assert_eq!(first, second);
    engine.destroy_image(&image);
}

#[test]
fn test_read_region_fills_empty_tiles_white() {
    let jpeg = solid_jpeg(256, 256, [0, 0, 0]);
    let mut ifd = TestIfd::tiled(1024, 768, 256, 7, jpeg);
    ifd.tile_data[7] = Vec::new(); // tile (3, 1) declared empty
    let tmp = write_tiff_file(true, false, &[ifd]);

    let engine = small_engine();
    let image = engine.open_image(tmp.path()).unwrap();
    assert!(image.tile_status(0, 3, 1).unwrap().is_empty);

    // Read exactly the empty tile's extent.
    let mut dest = vec![0u8; 256 * 256 * 4];
    engine
        .read_region(&image, 0, 768, 256, 256, 256, &mut dest, PixelFormat::Bgra8)
        .unwrap();
    assert!(dest.iter().all(|&b| b == 0xFF));

    engine.destroy_image(&image);
}

#[test]
fn test_read_region_beyond_level_bounds_is_white() {
    let tmp = positional_slide();
    let engine = small_engine();
    let image = engine.open_image(tmp.path()).unwrap();

    // A region hanging off the right edge: the out-of-grid half is white.
    let mut dest = vec![0u8; 128 * 64 * 4];
    engine
        .read_region(&image, 0, 1024 - 64, 0, 128, 64, &mut dest, PixelFormat::Bgra8)
        .unwrap();
    let stride = 128 * 4;
    for y in 0..64 {
        let row = &dest[y * stride..(y + 1) * stride];
        assert!(row[64 * 4..].iter().all(|&b| b == 0xFF), "row {}", y);
        // The in-bounds half carries tile (3, 0)'s marker channels:
        // BGRA with G = 1 and R = 31.
        assert_eq!(row[1], 1);
        assert_eq!(row[2], 31);
    }

    engine.destroy_image(&image);
}

#[test]
fn test_read_region_luminance_conversion() {
    let jpeg = solid_jpeg(256, 256, [255, 255, 255]);
    let tmp = write_tiff_file(true, false, &[TestIfd::tiled(256, 256, 256, 7, jpeg)]);
    let engine = small_engine();
    let image = engine.open_image(tmp.path()).unwrap();

    let mut dest = vec![0u8; 64 * 64 * 4];
    engine
        .read_region(&image, 0, 0, 0, 64, 64, &mut dest, PixelFormat::F32Luminance)
        .unwrap();
    let first = f32::from_ne_bytes([dest[0], dest[1], dest[2], dest[3]]);
    assert!((first - 1.0).abs() < 0.05, "luminance {}", first);

    engine.destroy_image(&image);
}

#[test]
fn test_read_region_rejects_bad_arguments() {
    let tmp = positional_slide();
    let engine = small_engine();
    let image = engine.open_image(tmp.path()).unwrap();

    let mut dest = vec![0u8; 16];
    assert!(engine
        .read_region(&image, 0, 0, 0, 0, 4, &mut dest, PixelFormat::Bgra8)
        .is_err());
    assert!(engine
        .read_region(&image, 9, 0, 0, 2, 2, &mut dest, PixelFormat::Bgra8)
        .is_err());

    engine.destroy_image(&image);
}

// =============================================================================
// Cache invariants
// =============================================================================

#[test]
fn test_tiles_evicted_after_region_read() {
    let tmp = positional_slide();
    let engine = small_engine();
    let image = engine.open_image(tmp.path()).unwrap();

    let mut dest = vec![0u8; 300 * 300 * 4];
    engine
        .read_region(&image, 0, 100, 100, 300, 300, &mut dest, PixelFormat::Bgra8)
        .unwrap();

    // Pins released and pixels reclaimed: nothing cached, nothing in
    // flight, every block back in the allocator.
    for tile_y in 0..3 {
        for tile_x in 0..4 {
            let status = image.tile_status(0, tile_x, tile_y).unwrap();
            assert!(!status.is_cached, "tile ({}, {})", tile_x, tile_y);
            assert!(!status.submitted_for_loading);
        }
    }
    engine.drain();
    engine.pump_completions();
    assert_eq!(engine.allocator().live_blocks(), 0);

    engine.destroy_image(&image);
}

#[test]
fn test_wishlist_respects_gpu_pin() {
    let tmp = positional_slide();
    let engine = small_engine();
    let image = engine.open_image(tmp.path()).unwrap();

    // Ask for one tile with GPU residency; its pixels must survive the
    // eviction pass until the flag clears.
    let submitted = engine.request_tiles(
        &image,
        &[TileRequest {
            level: 0,
            tile_x: 1,
            tile_y: 1,
            need_gpu_residency: true,
            need_keep_in_cache: false,
        }],
    );
    assert_eq!(submitted, 1);
    engine.drain();
    let uploaded = engine.pump_completions_with(Some(&mut |_w, _h, _pixels| 42u32));
    assert_eq!(uploaded, 1);

    let status = image.tile_status(0, 1, 1).unwrap();
    assert!(status.is_cached);
    assert_eq!(status.texture, 42);

    engine.evict_unpinned_tiles(&image);
    assert!(image.tile_status(0, 1, 1).unwrap().is_cached);

    engine.destroy_image(&image);
    assert_eq!(engine.allocator().live_blocks(), 0);
}

#[test]
fn test_high_priority_lane_loads_tiles() {
    let tmp = positional_slide();
    let engine = small_engine();
    let image = engine.open_image(tmp.path()).unwrap();

    let submitted = engine.request_tiles_high_priority(
        &image,
        &[TileRequest {
            level: 0,
            tile_x: 3,
            tile_y: 2,
            need_gpu_residency: false,
            need_keep_in_cache: true,
        }],
    );
    assert_eq!(submitted, 1);
    engine.drain();
    engine.pump_completions();
    assert!(image.tile_status(0, 3, 2).unwrap().is_cached);

    engine.destroy_image(&image);
}

#[test]
fn test_duplicate_requests_not_resubmitted() {
    let tmp = positional_slide();
    let engine = small_engine();
    let image = engine.open_image(tmp.path()).unwrap();

    let request = [TileRequest {
        level: 0,
        tile_x: 0,
        tile_y: 0,
        need_gpu_residency: false,
        need_keep_in_cache: true,
    }];
    let first = engine.request_tiles(&image, &request);
    assert_eq!(first, 1);
    // While in flight or cached, the same wishlist entry is filtered out.
    let second = engine.request_tiles(&image, &request);
    assert_eq!(second, 0);

    engine.drain();
    engine.pump_completions();
    assert!(image.tile_status(0, 0, 0).unwrap().is_cached);
    let third = engine.request_tiles(&image, &request);
    assert_eq!(third, 0);

    engine.destroy_image(&image);
}

#[test]
fn test_allocator_cap_drops_tiles_without_failing_region() {
    let tmp = positional_slide();
    // Two blocks total: most of the 12 tiles get dropped under pressure.
    let engine = Engine::new(EngineConfig {
        worker_threads: 2,
        block_size: 256 * 256 * 4,
        blocks_per_chunk: 1,
        max_chunks: 2,
        ..EngineConfig::default()
    });
    let image = engine.open_image(tmp.path()).unwrap();

    let mut dest = vec![0u8; 1024 * 768 * 4];
    engine
        .read_region(&image, 0, 0, 0, 1024, 768, &mut dest, PixelFormat::Bgra8)
        .unwrap();

    // The read completes; dropped tiles render white.
    engine.drain();
    engine.pump_completions();
    assert_eq!(engine.allocator().live_blocks(), 0);
    engine.destroy_image(&image);
}

// =============================================================================
// Failure isolation
// =============================================================================

#[test]
fn test_corrupt_tile_fails_locally() {
    let jpeg = solid_jpeg(256, 256, [90, 90, 90]);
    let mut ifd = TestIfd::tiled(512, 256, 256, 7, jpeg);
    ifd.tile_data[1] = b"not a jpeg at all".to_vec();
    let tmp = write_tiff_file(true, false, &[ifd]);

    let engine = small_engine();
    let image = engine.open_image(tmp.path()).unwrap();

    let mut dest = vec![0u8; 512 * 256 * 4];
    engine
        .read_region(&image, 0, 0, 0, 512, 256, &mut dest, PixelFormat::Bgra8)
        .unwrap();

    // The bad tile is failed and painted white; its neighbor decoded.
    assert!(image.tile_status(0, 1, 0).unwrap().failed);
    assert!(!image.tile_status(0, 0, 0).unwrap().failed);
    let stride = 512 * 4;
    assert!(dest[stride - 4..stride].iter().all(|&b| b == 0xFF));
    assert!((dest[0] as i32 - 90).abs() < 16);

    engine.destroy_image(&image);
}

// =============================================================================
// Lazy indexing (DICOM)
// =============================================================================

#[test]
fn test_dicom_lazy_indexing_through_engine() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    build_dicom_fixture(tmp.path(), 64, 2, 1);

    let engine = small_engine();
    let image = engine.open_image(tmp.path()).unwrap();
    assert!(!image.level_is_indexed(0));

    // The first wishlist schedules the indexing job instead of tiles.
    let submitted = engine.request_tiles(
        &image,
        &[TileRequest {
            level: 0,
            tile_x: 0,
            tile_y: 0,
            need_gpu_residency: false,
            need_keep_in_cache: true,
        }],
    );
    assert_eq!(submitted, 0);
    engine.drain();
    assert!(image.level_is_indexed(0));

    // Now the tiles decode normally.
    let mut dest = vec![0u8; 128 * 64 * 4];
    engine
        .read_region(&image, 0, 0, 0, 128, 64, &mut dest, PixelFormat::Bgra8)
        .unwrap();
    // Frame 0 is RGB(0, 100, 50): green channel close to 100.
    assert!((dest[1] as i32 - 100).abs() < 16);

    engine.destroy_image(&image);
}

// =============================================================================
// Teardown
// =============================================================================

#[test]
fn test_destroy_image_drains_refcount() {
    let tmp = positional_slide();
    let engine = small_engine();
    let image = engine.open_image(tmp.path()).unwrap();

    // Submit a full-pyramid wishlist, then destroy immediately while the
    // workers are busy.
    let mut wishlist = Vec::new();
    for tile_y in 0..3 {
        for tile_x in 0..4 {
            wishlist.push(TileRequest {
                level: 0,
                tile_x,
                tile_y,
                need_gpu_residency: false,
                need_keep_in_cache: true,
            });
        }
    }
    engine.request_tiles(&image, &wishlist);
    engine.destroy_image(&image);

    assert_eq!(image.task_refcount(), 0);
    assert!(image.is_deletion_pending());
    engine.drain();
    engine.pump_completions();
    assert_eq!(engine.allocator().live_blocks(), 0);
}

#[test]
fn test_destroy_unbinds_textures() {
    let tmp = positional_slide();
    let engine = small_engine();
    let image = engine.open_image(tmp.path()).unwrap();

    engine.request_tiles(
        &image,
        &[TileRequest {
            level: 0,
            tile_x: 2,
            tile_y: 2,
            need_gpu_residency: true,
            need_keep_in_cache: false,
        }],
    );
    engine.drain();
    engine.pump_completions_with(Some(&mut |_, _, _| 7u32));
    assert_eq!(image.tile_status(0, 2, 2).unwrap().texture, 7);

    let mut unbound = Vec::new();
    engine.destroy_image_with(&image, |texture| unbound.push(texture));
    assert_eq!(unbound, vec![7]);
}

// =============================================================================
// Overlays and resolution propagation
// =============================================================================

#[test]
fn test_overlay_inherits_parent_resolution() {
    let jpeg = solid_jpeg(256, 256, [10, 10, 10]);
    let mut parent_ifd = TestIfd::tiled(256, 256, 256, 7, jpeg.clone());
    parent_ifd.resolution = Some((40000, 1, 3)); // 0.25 um/px
    let parent_file = write_tiff_file(true, false, &[parent_ifd]);
    let overlay_file = write_tiff_file(true, false, &[TestIfd::tiled(256, 256, 256, 7, jpeg)]);

    let engine = small_engine();
    let parent = engine.open_image(parent_file.path()).unwrap();
    let overlay = engine.open_overlay(overlay_file.path(), &parent).unwrap();

    let (mpp_x, _, known) = overlay.mpp();
    assert!(known);
    assert!((mpp_x - 0.25).abs() < 1e-4);
    assert!(overlay.is_overlay);

    engine.destroy_image(&overlay);
    engine.destroy_image(&parent);
}
