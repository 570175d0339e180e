//! MRXS tests against a complete synthetic slide directory.

use wsi_engine::format::mrxs::MrxsFile;
use wsi_engine::{Engine, EngineConfig, PixelFormat};

use super::test_utils::build_mrxs_fixture;

fn small_engine() -> Engine {
    Engine::new(EngineConfig {
        worker_threads: 2,
        ..EngineConfig::default()
    })
}

#[test]
fn test_open_mrxs_directory() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = build_mrxs_fixture(dir.path());

    let mrxs = MrxsFile::open(dir.path()).unwrap();
    assert_eq!(mrxs.base_width_in_tiles, fixture.base_tiles_x);
    assert_eq!(mrxs.base_height_in_tiles, fixture.base_tiles_y);
    assert_eq!(mrxs.tile_width, fixture.tile);
    assert_eq!(mrxs.level_count(), 2);
    assert!(mrxs.is_mpp_known);
    assert!((mrxs.mpp_x - 0.25).abs() < 1e-9);
    assert_eq!(mrxs.index_version, "01.02");
    assert_eq!(mrxs.slide_id.len(), 32);
}

#[test]
fn test_index_paging_populates_all_entries() {
    // Six entries split across two pages: every one lands in its slot and
    // none is overwritten by the second page's traversal.
    let dir = tempfile::tempdir().unwrap();
    build_mrxs_fixture(dir.path());

    let mrxs = MrxsFile::open(dir.path()).unwrap();
    let level0 = &mrxs.levels[0];
    assert_eq!(level0.width_in_tiles, 4);
    assert_eq!(level0.height_in_tiles, 2);

    let present: Vec<bool> = level0.tiles.iter().map(|t| t.is_some()).collect();
    assert_eq!(present, vec![true, true, true, true, true, true, false, false]);

    // Offsets are distinct and increasing (tiles were laid out in order).
    let offsets: Vec<u32> = level0.tiles.iter().flatten().map(|e| e.offset).collect();
    for pair in offsets.windows(2) {
        assert!(pair[0] < pair[1]);
    }
}

#[test]
fn test_tile_mapping_within_level_bounds() {
    let dir = tempfile::tempdir().unwrap();
    build_mrxs_fixture(dir.path());
    let mrxs = MrxsFile::open(dir.path()).unwrap();

    // Every populated slot sits inside its level's grid; the mapping from
    // base-grid indices shifted right by the scale produced it.
    for (scale, level) in mrxs.levels.iter().enumerate() {
        for (i, entry) in level.tiles.iter().enumerate() {
            if let Some(entry) = entry {
                assert!(i < (level.width_in_tiles * level.height_in_tiles) as usize);
                let tile_x = (entry.image % mrxs.base_width_in_tiles) >> scale;
                let tile_y = (entry.image / mrxs.base_width_in_tiles) >> scale;
                assert!(tile_x < level.width_in_tiles);
                assert!(tile_y < level.height_in_tiles);
            }
        }
    }
}

#[test]
fn test_open_via_marker_file() {
    let parent = tempfile::tempdir().unwrap();
    let slide_dir = parent.path().join("case42");
    std::fs::create_dir(&slide_dir).unwrap();
    build_mrxs_fixture(&slide_dir);
    std::fs::write(parent.path().join("case42.mrxs"), b"").unwrap();

    let mrxs = MrxsFile::open(parent.path().join("case42.mrxs")).unwrap();
    assert_eq!(mrxs.level_count(), 2);
}

#[test]
fn test_missing_index_fails() {
    let dir = tempfile::tempdir().unwrap();
    build_mrxs_fixture(dir.path());
    std::fs::remove_file(dir.path().join("Index.dat")).unwrap();
    assert!(MrxsFile::open(dir.path()).is_err());
}

// =============================================================================
// Through the engine
// =============================================================================

#[test]
fn test_mrxs_region_read() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = build_mrxs_fixture(dir.path());

    let engine = small_engine();
    let image = engine.open_image(dir.path()).unwrap();
    assert_eq!(image.backend, wsi_engine::BackendKind::Mrxs);
    assert_eq!(image.width_in_pixels, fixture.base_tiles_x * fixture.tile);
    assert_eq!(image.level_count(), 2);

    // Tiles 6 and 7 are absent from the index and therefore empty.
    assert!(image.tile_status(0, 2, 1).unwrap().is_empty);
    assert!(image.tile_status(0, 3, 1).unwrap().is_empty);
    assert!(!image.tile_status(0, 0, 0).unwrap().is_empty);

    // A region spanning the present/absent boundary: left half decoded,
    // right half white.
    let tile = fixture.tile;
    let mut dest = vec![0u8; (tile * 2 * tile) as usize * 4];
    engine
        .read_region(
            &image,
            0,
            tile,     // x: start of tile (1, 1)
            tile,     // y: second tile row
            tile * 2, // spans tiles (1,1) and (2,1); the latter is empty
            tile,
            &mut dest,
            PixelFormat::Bgra8,
        )
        .unwrap();

    let stride = (tile * 2) as usize * 4;
    // Tile (1,1) is base grid index 5: solid RGB(150, 80, 160).
    assert!((dest[0] as i32 - 160).abs() < 16); // B
    assert!((dest[1] as i32 - 80).abs() < 16); // G
    assert!((dest[2] as i32 - 150).abs() < 16); // R
    // The empty half is background white.
    assert!(dest[stride - 4..stride].iter().all(|&b| b == 0xFF));

    engine.destroy_image(&image);
}

#[test]
fn test_mrxs_level_one_read() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = build_mrxs_fixture(dir.path());

    let engine = small_engine();
    let image = engine.open_image(dir.path()).unwrap();

    let tile = fixture.tile;
    let mut dest = vec![0u8; (tile * tile) as usize * 4];
    engine
        .read_region(&image, 1, 0, 0, tile, tile, &mut dest, PixelFormat::Bgra8)
        .unwrap();
    // Level 1 tile (0,0) is solid RGB(10, 200, 90).
    assert!((dest[0] as i32 - 90).abs() < 16);
    assert!((dest[1] as i32 - 200).abs() < 16);
    assert!((dest[2] as i32 - 10).abs() < 16);

    engine.destroy_image(&image);
}
