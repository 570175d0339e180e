//! Index.dat parsing.
//!
//! Layout, all little-endian:
//!
//! ```text
//! version   (5 ASCII bytes)
//! slide_id  (32 ASCII bytes)
//! hier_root (4)   -> array of 4-byte record pointers, one per
//!                    HIER_i_VAL_j in flat declaration order
//! nonhier_root (4) -> same, for NONHIER_i_VAL_j
//! ```
//!
//! Each record pointer leads to a chain of pages:
//! `entry_count (4) | next_ptr (4) | entries[entry_count]`. Hier entries
//! are 16 bytes (`image | offset | length | file`); non-hier entries are
//! 20 bytes with two leading pad words (`pad | pad | offset | length |
//! file`).
//!
//! A zoom-level entry's `image` field indexes the *base* tile grid; the
//! tile coordinate at level `k` is the base coordinate shifted right by
//! `k`.

use bytes::Bytes;

use crate::error::MrxsError;
use crate::io::{read_i32_le, MemStream};

/// One tile record of a zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HierEntry {
    /// Index into the base-level tile grid.
    pub image: u32,
    /// Byte offset within the data file.
    pub offset: u32,
    /// Byte length within the data file.
    pub length: u32,
    /// Index into the data file table.
    pub file: u32,
}

/// One record of a non-hierarchical layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NonHierEntry {
    pub offset: u32,
    pub length: u32,
    pub file: u32,
}

/// One camera field-of-view position from the slide position record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidePosition {
    pub flag: u8,
    pub x: i32,
    pub y: i32,
}

/// Parsed header of Index.dat.
#[derive(Debug, Clone)]
pub struct IndexHeader {
    pub version: String,
    pub slide_id: String,
    pub hier_root: u32,
    pub nonhier_root: u32,
}

/// Read the fixed-size Index.dat header.
pub fn read_index_header(stream: &mut MemStream) -> Result<IndexHeader, MrxsError> {
    let version = String::from_utf8_lossy(stream.read(5)?).into_owned();
    let slide_id = String::from_utf8_lossy(stream.read(32)?).into_owned();
    let hier_root = stream.read_u32_le()?;
    let nonhier_root = stream.read_u32_le()?;
    Ok(IndexHeader {
        version,
        slide_id,
        hier_root,
        nonhier_root,
    })
}

/// Seek to the record pointer for flat record `record_index` under `root`
/// and position the stream at the start of the record's first page.
pub fn seek_to_record(
    stream: &mut MemStream,
    root: u32,
    record_index: usize,
) -> Result<(), MrxsError> {
    stream.seek(root as usize + record_index * 4)?;
    let record_ptr = stream.read_u32_le()?;
    stream.seek(record_ptr as usize)?;
    Ok(())
}

/// Walk the page chain of one zoom level, delivering each entry to `sink`.
///
/// Pages already visited are never revisited: traversal stops when the
/// next pointer is zero or out of bounds. The first page of a chain
/// typically has zero entries.
pub fn walk_zoom_level_pages(
    stream: &mut MemStream,
    mut sink: impl FnMut(HierEntry),
) -> Result<(), MrxsError> {
    loop {
        let entry_count = stream.read_u32_le()?;
        let next_ptr = stream.read_u32_le()?;
        for _ in 0..entry_count {
            let bytes = stream.read(16)?;
            sink(HierEntry {
                image: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                offset: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
                length: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
                file: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            });
        }
        if next_ptr != 0 && (next_ptr as usize) < stream.len() {
            stream.seek(next_ptr as usize)?;
        } else {
            return Ok(());
        }
    }
}

/// Walk a non-hier page chain and return the first entry, if any.
///
/// Only one relevant entry is expected in these chains (see the stitching
/// intensity layer); extras are ignored.
pub fn read_first_nonhier_entry(
    stream: &mut MemStream,
) -> Result<Option<NonHierEntry>, MrxsError> {
    loop {
        let entry_count = stream.read_u32_le()?;
        let next_ptr = stream.read_u32_le()?;
        if entry_count > 0 {
            let bytes = stream.read(20)?;
            // Two 4-byte pad words precede the payload.
            return Ok(Some(NonHierEntry {
                offset: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
                length: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
                file: u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
            }));
        }
        if next_ptr != 0 && (next_ptr as usize) < stream.len() {
            stream.seek(next_ptr as usize)?;
        } else {
            return Ok(None);
        }
    }
}

/// Record size of one slide position: `flag (1) | x (4) | y (4)`.
const SLIDE_POSITION_RECORD_SIZE: usize = 9;

/// Inflate and parse the zlib-compressed slide position record.
pub fn parse_slide_positions(compressed: &[u8]) -> Result<Vec<SlidePosition>, MrxsError> {
    use std::io::Read;

    let mut decoder = flate2::read::ZlibDecoder::new(compressed);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| MrxsError::InvalidIndex(format!("slide position inflate failed: {}", e)))?;

    if raw.len() % SLIDE_POSITION_RECORD_SIZE != 0 {
        return Err(MrxsError::InvalidIndex(format!(
            "slide position record length {} is not a multiple of {}",
            raw.len(),
            SLIDE_POSITION_RECORD_SIZE
        )));
    }
    Ok(raw
        .chunks_exact(SLIDE_POSITION_RECORD_SIZE)
        .map(|record| SlidePosition {
            flag: record[0],
            x: read_i32_le(&record[1..5]),
            y: read_i32_le(&record[5..9]),
        })
        .collect())
}

/// Convenience wrapper creating a stream over index bytes.
pub fn index_stream(data: Bytes) -> MemStream {
    MemStream::new(data)
}
