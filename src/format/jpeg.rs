//! Shared JPEG tile handling.
//!
//! Slide containers store JPEG tiles in two flavors:
//!
//! - Complete streams that carry their own quantization/Huffman tables.
//! - Abbreviated streams whose tables live once in the TIFF `JPEGTables`
//!   tag and must be spliced in front of every tile before decoding.
//!
//! A third degenerate flavor exists in the wild: a stream that is nothing
//! but the EOI marker (`FF D9`). Such tiles are logically empty and must
//! never be decoded.
//!
//! Decoded output is BGRA, the engine-wide pixel layout.

use bytes::{Bytes, BytesMut};

use crate::error::SlideError;

/// Start Of Image marker
pub const SOI: [u8; 2] = [0xFF, 0xD8];

/// End Of Image marker
pub const EOI: [u8; 2] = [0xFF, 0xD9];

// =============================================================================
// Stream analysis
// =============================================================================

/// Whether a tile stream is the empty-JPEG sentinel (`FF D9` first).
///
/// Some scanners emit this for background tiles instead of omitting the
/// tile; the loader treats it exactly like a zero-byte-count tile.
#[inline]
pub fn is_empty_jpeg_stream(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0xFF && data[1] == 0xD9
}

// =============================================================================
// JPEGTables merging
// =============================================================================

/// Merge `JPEGTables` with an abbreviated tile stream into one decodable
/// JPEG.
///
/// Tables are `SOI + DQT/DHT segments + EOI`; the tile is
/// `SOI + scan data + EOI`. The merge strips the tables' trailing EOI and
/// the tile's leading SOI and concatenates, yielding
/// `SOI + tables + scan data + EOI`.
pub fn merge_jpeg_tables(tables: &[u8], tile_data: &[u8]) -> Bytes {
    if tables.is_empty() {
        return Bytes::copy_from_slice(tile_data);
    }
    if tile_data.is_empty() {
        return Bytes::new();
    }

    let tables_end = if tables.len() >= 2 && tables[tables.len() - 2..] == EOI {
        tables.len() - 2
    } else {
        tables.len()
    };
    let tile_start = if tile_data.len() >= 2 && tile_data[0..2] == SOI {
        2
    } else {
        0
    };

    let mut result = BytesMut::with_capacity(tables_end + (tile_data.len() - tile_start));
    result.extend_from_slice(&tables[..tables_end]);
    result.extend_from_slice(&tile_data[tile_start..]);
    result.freeze()
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode a complete JPEG stream into a BGRA destination buffer.
///
/// `dest` must be `expected_width * expected_height * 4` bytes. Grayscale
/// sources are broadcast to RGB by the decoder; the alpha channel is set to
/// opaque. A decoded image smaller than expected fills only its own extent
/// (callers zero the buffer beforehand when that matters); a larger one is
/// rejected.
pub fn decode_jpeg_to_bgra(
    data: &[u8],
    expected_width: u32,
    expected_height: u32,
    dest: &mut [u8],
) -> Result<(), SlideError> {
    debug_assert_eq!(
        dest.len(),
        expected_width as usize * expected_height as usize * 4
    );

    let decoded = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)
        .map_err(|e| SlideError::DecodeFailed {
            backend: "jpeg",
            detail: e.to_string(),
        })?;

    let (w, h) = (decoded.width(), decoded.height());
    if w > expected_width || h > expected_height {
        return Err(SlideError::DecodeFailed {
            backend: "jpeg",
            detail: format!(
                "decoded size {}x{} exceeds expected {}x{}",
                w, h, expected_width, expected_height
            ),
        });
    }

    let rgba = decoded.to_rgba8();
    let dest_stride = expected_width as usize * 4;
    for y in 0..h as usize {
        let src_row = &rgba.as_raw()[y * w as usize * 4..(y + 1) * w as usize * 4];
        let dst_row = &mut dest[y * dest_stride..y * dest_stride + w as usize * 4];
        for (src, dst) in src_row.chunks_exact(4).zip(dst_row.chunks_exact_mut(4)) {
            dst[0] = src[2]; // B
            dst[1] = src[1]; // G
            dst[2] = src[0]; // R
            dst[3] = src[3]; // A
        }
    }
    Ok(())
}
