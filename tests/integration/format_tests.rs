//! Container parsing tests against byte-exact synthetic files.

use wsi_engine::{BackendKind, TiffFile};

use super::test_utils::{lzw_compress, solid_jpeg, write_tiff_file, TestIfd};

// =============================================================================
// TIFF structure
// =============================================================================

#[test]
fn test_open_little_endian_tiff() {
    let jpeg = solid_jpeg(256, 256, [120, 60, 30]);
    let tmp = write_tiff_file(true, false, &[TestIfd::tiled(1024, 768, 256, 7, jpeg)]);

    let tiff = TiffFile::open(tmp.path()).unwrap();
    assert!(!tiff.header.is_big_endian());
    assert!(!tiff.header.is_bigtiff);
    assert_eq!(tiff.header.bytesize_of_offsets, 4);
    assert_eq!(tiff.ifds.len(), 1);

    // Tile geometry: counts derive from the image and tile extents.
    let ifd = &tiff.ifds[0];
    assert_eq!(ifd.image_width, 1024);
    assert_eq!(ifd.image_height, 768);
    assert_eq!(ifd.width_in_tiles, 4);
    assert_eq!(ifd.height_in_tiles, 3);
    assert_eq!(ifd.tile_count(), 12);
}

#[test]
fn test_open_big_endian_tiff() {
    let jpeg = solid_jpeg(128, 128, [10, 20, 30]);
    let tmp = write_tiff_file(false, false, &[TestIfd::tiled(256, 256, 128, 7, jpeg)]);

    let tiff = TiffFile::open(tmp.path()).unwrap();
    assert!(tiff.header.is_big_endian());
    let ifd = &tiff.ifds[0];
    assert_eq!(ifd.image_width, 256);
    assert_eq!(ifd.tile_width, 128);
    assert_eq!(ifd.tile_count(), 4);
    assert!(ifd.tile_byte_counts.iter().all(|&c| c > 0));
}

#[test]
fn test_open_bigtiff() {
    let jpeg = solid_jpeg(128, 128, [99, 99, 99]);
    let tmp = write_tiff_file(true, true, &[TestIfd::tiled(512, 256, 128, 7, jpeg)]);

    let tiff = TiffFile::open(tmp.path()).unwrap();
    assert!(tiff.header.is_bigtiff);
    assert_eq!(tiff.header.bytesize_of_offsets, 8);
    assert_eq!(tiff.ifds[0].width_in_tiles, 4);
    assert_eq!(tiff.ifds[0].height_in_tiles, 2);
}

#[test]
fn test_short_typed_dimensions_accepted() {
    let jpeg = solid_jpeg(128, 128, [1, 2, 3]);
    let mut ifd = TestIfd::tiled(640, 384, 128, 7, jpeg);
    ifd.use_short_dims = true;
    let tmp = write_tiff_file(true, false, &[ifd]);

    let tiff = TiffFile::open(tmp.path()).unwrap();
    assert_eq!(tiff.ifds[0].image_width, 640);
    assert_eq!(tiff.ifds[0].image_height, 384);
}

#[test]
fn test_mpp_from_centimeter_resolution() {
    let jpeg = solid_jpeg(128, 128, [5, 5, 5]);
    let mut ifd = TestIfd::tiled(256, 256, 128, 7, jpeg);
    // 40000 pixels per centimeter = 0.25 um per pixel.
    ifd.resolution = Some((40000, 1, 3));
    let tmp = write_tiff_file(true, false, &[ifd]);

    let tiff = TiffFile::open(tmp.path()).unwrap();
    assert!(tiff.is_mpp_known);
    assert!((tiff.mpp_x - 0.25).abs() < 1e-4);
    assert!((tiff.mpp_y - 0.25).abs() < 1e-4);
}

#[test]
fn test_macro_and_label_classification() {
    let level_jpeg = solid_jpeg(128, 128, [50, 50, 50]);
    let macro_jpeg = solid_jpeg(64, 64, [200, 10, 10]);
    let label_jpeg = solid_jpeg(64, 64, [10, 200, 10]);

    let mut macro_ifd = TestIfd::tiled(64, 64, 64, 7, macro_jpeg);
    macro_ifd.description = Some("Macro image".to_string());
    let mut label_ifd = TestIfd::tiled(64, 64, 64, 7, label_jpeg);
    label_ifd.description = Some("Label image".to_string());

    let tmp = write_tiff_file(
        true,
        false,
        &[
            TestIfd::tiled(256, 256, 128, 7, level_jpeg),
            macro_ifd,
            label_ifd,
        ],
    );

    let tiff = TiffFile::open(tmp.path()).unwrap();
    assert_eq!(tiff.macro_image_index, Some(1));
    assert_eq!(tiff.label_image_index, Some(2));

    let (width, height, pixels) = tiff.decode_associated_image(1).unwrap();
    assert_eq!((width, height), (64, 64));
    // BGRA of RGB(200, 10, 10), within JPEG tolerance.
    assert!((pixels[2] as i32 - 200).abs() < 16);
}

#[test]
fn test_pyramid_level_assignment_and_monotonicity() {
    let jpeg = |n| solid_jpeg(128, 128, [n, n, n]);
    let mut level1 = TestIfd::tiled(512, 512, 128, 7, jpeg(1));
    level1.subfile_type = Some(1); // reduced-resolution image
    let mut level2 = TestIfd::tiled(256, 256, 128, 7, jpeg(2));
    level2.subfile_type = Some(1);

    let mut base = TestIfd::tiled(1024, 1024, 128, 7, jpeg(0));
    base.resolution = Some((40000, 1, 3));
    let tmp = write_tiff_file(true, false, &[base, level1, level2]);

    let tiff = TiffFile::open(tmp.path()).unwrap();
    assert_eq!(tiff.max_downsample_level, 2);
    let levels: Vec<_> = tiff.level_ifds().collect();
    assert_eq!(levels.len(), 3);
    for pair in levels.windows(2) {
        // Pyramid monotonicity: deeper levels shrink in pixels and grow
        // in microns per pixel.
        assert!(pair[1].image_width <= pair[0].image_width);
        assert!(pair[1].um_per_pixel_x >= pair[0].um_per_pixel_x);
    }
    assert_eq!(levels[1].downsample_level, 1);
    assert_eq!(levels[2].downsample_level, 2);
}

#[test]
fn test_padded_level_widths_disambiguated_by_tile_counts() {
    // Widths padded to a tile multiple: the raw log2 for the smallest
    // level is ambiguous, the tile-count interval picks the right one.
    let jpeg = |n| solid_jpeg(256, 256, [n, n, n]);
    let mut level3 = TestIfd::tiled(256, 256, 256, 7, jpeg(3));
    level3.subfile_type = Some(1);
    let mut level4 = TestIfd::tiled(256, 256, 256, 7, jpeg(4));
    level4.subfile_type = Some(1);

    let base = TestIfd::tiled(2048, 2048, 256, 7, jpeg(0));
    let mut level1 = TestIfd::tiled(1024, 1024, 256, 7, jpeg(1));
    level1.subfile_type = Some(1);
    let mut level2 = TestIfd::tiled(512, 512, 256, 7, jpeg(2));
    level2.subfile_type = Some(1);

    let tmp = write_tiff_file(true, false, &[base, level1, level2, level3, level4]);
    let tiff = TiffFile::open(tmp.path()).unwrap();

    let levels: Vec<_> = tiff.level_ifds().map(|ifd| ifd.downsample_level).collect();
    // Both 256px IFDs pad to one tile; the first resolves to level 3
    // directly, the second falls back to last_level + 1.
    assert_eq!(levels, vec![0, 1, 2, 3, 4]);
    assert_eq!(tiff.max_downsample_level, 4);
}

// =============================================================================
// Tile decoding
// =============================================================================

#[test]
fn test_decode_jpeg_tile() {
    let jpeg = solid_jpeg(128, 128, [180, 90, 45]);
    let tmp = write_tiff_file(true, false, &[TestIfd::tiled(256, 256, 128, 7, jpeg)]);
    let tiff = TiffFile::open(tmp.path()).unwrap();

    let mut arena = wsi_engine::Arena::with_capacity(1 << 20);
    let mut dest = vec![0u8; 128 * 128 * 4];
    assert!(tiff.decode_tile(0, 0, &mut dest, &mut arena).unwrap());
    assert!((dest[0] as i32 - 45).abs() < 16); // B
    assert!((dest[1] as i32 - 90).abs() < 16); // G
    assert!((dest[2] as i32 - 180).abs() < 16); // R
    assert_eq!(dest[3], 255);
}

#[test]
fn test_empty_tile_from_zero_byte_count() {
    let jpeg = solid_jpeg(128, 128, [1, 1, 1]);
    let mut ifd = TestIfd::tiled(512, 256, 128, 7, jpeg);
    ifd.tile_data[3] = Vec::new(); // declare tile 3 empty
    let tmp = write_tiff_file(true, false, &[ifd]);
    let tiff = TiffFile::open(tmp.path()).unwrap();

    assert_eq!(tiff.ifds[0].tile_byte_counts[3], 0);
    let mut arena = wsi_engine::Arena::with_capacity(1 << 20);
    let mut dest = vec![0u8; 128 * 128 * 4];
    assert!(!tiff.decode_tile(0, 3, &mut dest, &mut arena).unwrap());
}

#[test]
fn test_empty_jpeg_stream_sentinel() {
    let jpeg = solid_jpeg(128, 128, [1, 1, 1]);
    let mut ifd = TestIfd::tiled(256, 128, 128, 7, jpeg);
    ifd.tile_data[1] = vec![0xFF, 0xD9]; // bare EOI marker
    let tmp = write_tiff_file(true, false, &[ifd]);
    let tiff = TiffFile::open(tmp.path()).unwrap();

    let mut arena = wsi_engine::Arena::with_capacity(1 << 20);
    let mut dest = vec![0u8; 128 * 128 * 4];
    assert!(!tiff.decode_tile(0, 1, &mut dest, &mut arena).unwrap());
}

#[test]
fn test_decode_with_jpeg_tables() {
    // Split a complete JPEG into tables and an abbreviated stream the way
    // SVS files store them.
    let full = solid_jpeg(128, 128, [77, 150, 20]);
    let sos = full
        .windows(2)
        .position(|w| w == [0xFF, 0xDA])
        .expect("jpeg has a scan");
    let mut tables = full[..sos].to_vec();
    tables.extend_from_slice(&[0xFF, 0xD9]);
    let mut abbreviated = vec![0xFF, 0xD8];
    abbreviated.extend_from_slice(&full[sos..]);

    let mut ifd = TestIfd::tiled(128, 128, 128, 7, abbreviated);
    ifd.jpeg_tables = Some(tables);
    let tmp = write_tiff_file(true, false, &[ifd]);
    let tiff = TiffFile::open(tmp.path()).unwrap();

    let mut arena = wsi_engine::Arena::with_capacity(1 << 20);
    let mut dest = vec![0u8; 128 * 128 * 4];
    assert!(tiff.decode_tile(0, 0, &mut dest, &mut arena).unwrap());
    assert!((dest[1] as i32 - 150).abs() < 16); // G survived the merge
}

#[test]
fn test_decode_lzw_palettized_tile() {
    // Every decoded sample is class index 2; the fixed LUT maps it to
    // BGRA (50, 249, 0, 128).
    let raw = vec![2u8; 64 * 64];
    let compressed = lzw_compress(&raw);

    let mut ifd = TestIfd::tiled(64, 64, 64, 5, compressed);
    ifd.samples_per_pixel = 1;
    ifd.max_sample_value = Some(2);
    let tmp = write_tiff_file(true, false, &[ifd]);
    let tiff = TiffFile::open(tmp.path()).unwrap();

    let mut arena = wsi_engine::Arena::with_capacity(1 << 20);
    let mut dest = vec![0u8; 64 * 64 * 4];
    assert!(tiff.decode_tile(0, 0, &mut dest, &mut arena).unwrap());
    for pixel in dest.chunks_exact(4) {
        assert_eq!(pixel, &[50, 249, 0, 128]);
    }
}

#[test]
fn test_decode_lzw_rgb_with_predictor() {
    // A horizontal gradient survives differencing + LZW + reconstruction.
    let (w, h) = (64usize, 32usize);
    let mut raw = Vec::with_capacity(w * h * 3);
    for _y in 0..h {
        for x in 0..w {
            raw.extend_from_slice(&[(x * 3) as u8, (x * 2) as u8, x as u8]);
        }
    }
    // Apply forward horizontal differencing before compressing.
    let mut differenced = raw.clone();
    for y in 0..h {
        let row = &mut differenced[y * w * 3..(y + 1) * w * 3];
        for i in (3..w * 3).rev() {
            row[i] = row[i].wrapping_sub(row[i - 3]);
        }
    }
    let compressed = lzw_compress(&differenced);

    let mut ifd = TestIfd::tiled(64, 32, 64, 5, compressed);
    ifd.tile_height = 32;
    ifd.samples_per_pixel = 3;
    ifd.predictor = 2;
    let tmp = write_tiff_file(true, false, &[ifd]);
    let tiff = TiffFile::open(tmp.path()).unwrap();

    let mut arena = wsi_engine::Arena::with_capacity(1 << 20);
    let mut dest = vec![0u8; 64 * 32 * 4];
    assert!(tiff.decode_tile(0, 0, &mut dest, &mut arena).unwrap());
    // Pixel (10, 0): RGB (30, 20, 10) as BGRA, exact (lossless path).
    let px = &dest[10 * 4..10 * 4 + 4];
    assert_eq!(px, &[10, 20, 30, 255]);
}

#[test]
fn test_unsupported_compression_fails_tile_only() {
    let mut ifd = TestIfd::tiled(128, 128, 128, 8, vec![1, 2, 3, 4]); // Deflate
    ifd.samples_per_pixel = 3;
    let tmp = write_tiff_file(true, false, &[ifd]);
    // The open itself succeeds; only decoding the tile fails.
    let tiff = TiffFile::open(tmp.path()).unwrap();

    let mut arena = wsi_engine::Arena::with_capacity(1 << 20);
    let mut dest = vec![0u8; 128 * 128 * 4];
    assert!(tiff.decode_tile(0, 0, &mut dest, &mut arena).is_err());
}

#[test]
fn test_edge_tile_trimmed_to_zero() {
    // 192px wide image with 128px tiles: the right tile's last 64 columns
    // lie outside the image and must come back zeroed.
    let payload = super::test_utils::positional_rgb_tile(128, 128, 7, 9);
    let mut ifd = TestIfd::tiled(192, 128, 128, 1, payload);
    ifd.samples_per_pixel = 3;
    let tmp = write_tiff_file(true, false, &[ifd]);
    let tiff = TiffFile::open(tmp.path()).unwrap();

    let mut arena = wsi_engine::Arena::with_capacity(1 << 20);
    let mut dest = vec![0u8; 128 * 128 * 4];
    assert!(tiff.decode_tile(0, 1, &mut dest, &mut arena).unwrap());
    let pitch = 128 * 4;
    let valid = (192 - 128) * 4;
    for y in 0..128 {
        let row = &dest[y * pitch..(y + 1) * pitch];
        assert!(row[valid..].iter().all(|&b| b == 0), "row {} not trimmed", y);
        // First pixel, BGRA: G and R carry the tile markers.
        assert_eq!(row[1], 9);
        assert_eq!(row[2], 7);
    }
}

// =============================================================================
// Remote access
// =============================================================================

/// A fake transport serving byte ranges of an in-memory slide with HTTP
/// framing, the way the remote chunk protocol delivers them.
struct InMemoryFetcher {
    data: Vec<u8>,
}

impl wsi_engine::io::ChunkFetcher for InMemoryFetcher {
    fn fetch_chunk(
        &self,
        _hostname: &str,
        _port: u16,
        _path: &str,
        offset: u64,
        length: u64,
    ) -> Result<bytes::Bytes, wsi_engine::IoError> {
        let start = offset as usize;
        let end = (start + length as usize).min(self.data.len());
        let mut response = format!(
            "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\n\r\n",
            end - start
        )
        .into_bytes();
        response.extend_from_slice(&self.data[start..end]);
        Ok(bytes::Bytes::from(response))
    }
}

#[test]
fn test_open_remote_tiff_through_chunk_fetcher() {
    let jpeg = solid_jpeg(128, 128, [60, 120, 180]);
    let data = super::test_utils::build_tiff(
        true,
        false,
        &[TestIfd::tiled(256, 256, 128, 7, jpeg)],
    );
    let size = data.len() as u64;
    let fetcher = std::sync::Arc::new(InMemoryFetcher { data });

    let location = wsi_engine::io::RemoteLocation {
        hostname: "pathology.example.org".to_string(),
        port: 443,
        filename: "case.tiff".to_string(),
    };
    let tiff = TiffFile::open_remote(fetcher, location, size).unwrap();
    assert_eq!(tiff.ifds[0].image_width, 256);
    assert_eq!(tiff.ifds[0].tile_count(), 4);

    // Tiles decode through the same fetcher.
    let mut arena = wsi_engine::Arena::with_capacity(1 << 20);
    let mut dest = vec![0u8; 128 * 128 * 4];
    assert!(tiff.decode_tile(0, 2, &mut dest, &mut arena).unwrap());
    assert!((dest[0] as i32 - 180).abs() < 16); // B
    assert!((dest[2] as i32 - 60).abs() < 16); // R
}

// =============================================================================
// Detection
// =============================================================================

#[test]
fn test_detect_formats() {
    let jpeg = solid_jpeg(64, 64, [0, 0, 0]);
    let tiff = write_tiff_file(true, false, &[TestIfd::tiled(64, 64, 64, 7, jpeg)]);
    assert_eq!(
        wsi_engine::detect_format(tiff.path()).unwrap(),
        BackendKind::Tiff
    );

    let dir = tempfile::tempdir().unwrap();
    super::test_utils::build_mrxs_fixture(dir.path());
    assert_eq!(
        wsi_engine::detect_format(dir.path()).unwrap(),
        BackendKind::Mrxs
    );

    let dicom = tempfile::NamedTempFile::new().unwrap();
    super::test_utils::build_dicom_fixture(dicom.path(), 32, 2, 1);
    assert_eq!(
        wsi_engine::detect_format(dicom.path()).unwrap(),
        BackendKind::Dicom
    );
}
