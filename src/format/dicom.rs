//! DICOM-WSI backend (single-instance, explicit VR little endian).
//!
//! A DICOM whole-slide instance stores its tiles as *frames* inside an
//! encapsulated PixelData element. Opening parses just enough of the
//! dataset to learn the tile and matrix geometry and the location of the
//! pixel-data item sequence; building the per-frame offset table requires
//! walking every item header, which on large slides is deferred to a
//! background indexing task (`needs_indexing` on the level).

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{DicomError, SlideError};
use crate::format::jpeg;
use crate::io::{read_u16_le, read_u32_le, SharedFile};
use crate::memory::Arena;

/// Offset of the "DICM" magic, after the 128-byte preamble.
const MAGIC_OFFSET: u64 = 128;

/// Item tag (FFFE,E000) in the encapsulated pixel-data sequence.
const TAG_ITEM: (u16, u16) = (0xFFFE, 0xE000);

/// Sequence delimitation tag (FFFE,E0DD).
const TAG_SEQUENCE_DELIMITER: (u16, u16) = (0xFFFE, 0xE0DD);

/// Location of one frame within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEntry {
    pub offset: u64,
    pub length: u32,
}

/// An opened DICOM-WSI instance.
pub struct DicomFile {
    file: Arc<SharedFile>,
    /// Tile width (Columns).
    pub tile_width: u32,
    /// Tile height (Rows).
    pub tile_height: u32,
    /// Total pixel matrix extent; falls back to the tile grid implied by
    /// NumberOfFrames when the total-matrix attributes are absent.
    pub matrix_width: u32,
    pub matrix_height: u32,
    pub number_of_frames: u32,
    /// Offset of the first byte after the PixelData element header.
    pixel_data_offset: u64,
    /// Per-frame locations, filled by [`DicomFile::index_pixel_data`].
    frames: RwLock<Vec<FrameEntry>>,
}

impl DicomFile {
    /// Quick magic check without a full parse.
    pub fn detect(header: &[u8]) -> bool {
        header.len() >= 132 && &header[128..132] == b"DICM"
    }

    /// Open a DICOM file and parse its dataset geometry. The frame offset
    /// table is *not* built here; see [`DicomFile::index_pixel_data`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DicomError> {
        let file = SharedFile::open(path.as_ref()).map_err(DicomError::Io)?;
        if file.size() < MAGIC_OFFSET + 4 {
            return Err(DicomError::NotDicom);
        }
        let magic = file.read_at(MAGIC_OFFSET, 4)?;
        if &magic[..] != b"DICM" {
            return Err(DicomError::NotDicom);
        }

        let mut parser = ElementParser {
            file: &file,
            pos: MAGIC_OFFSET + 4,
        };

        let mut tile_width = 0u32;
        let mut tile_height = 0u32;
        let mut matrix_width = 0u32;
        let mut matrix_height = 0u32;
        let mut number_of_frames = 0u32;
        let mut pixel_data_offset = None;

        while let Some(element) = parser.next_element()? {
            match (element.group, element.element) {
                (0x0028, 0x0008) => {
                    // NumberOfFrames is an IS (integer string).
                    let text = parser.read_string(&element)?;
                    number_of_frames = text.trim().parse().unwrap_or(0);
                }
                (0x0028, 0x0010) => tile_height = parser.read_u16(&element)? as u32,
                (0x0028, 0x0011) => tile_width = parser.read_u16(&element)? as u32,
                (0x0048, 0x0006) => matrix_width = parser.read_u32(&element)?,
                (0x0048, 0x0007) => matrix_height = parser.read_u32(&element)?,
                (0x7FE0, 0x0010) => {
                    if element.undefined_length {
                        pixel_data_offset = Some(element.value_offset);
                    }
                    break;
                }
                _ => {}
            }
            parser.skip_value(&element);
        }

        let pixel_data_offset = pixel_data_offset.ok_or_else(|| {
            DicomError::Parse("no encapsulated PixelData element found".to_string())
        })?;
        if tile_width == 0 || tile_height == 0 || number_of_frames == 0 {
            return Err(DicomError::Parse(format!(
                "incomplete geometry: tile {}x{}, {} frames",
                tile_width, tile_height, number_of_frames
            )));
        }
        if matrix_width == 0 || matrix_height == 0 {
            // Assume a square-ish frame grid when the total matrix is not
            // declared.
            let tiles_across = (number_of_frames as f64).sqrt().ceil() as u32;
            matrix_width = tiles_across * tile_width;
            matrix_height = number_of_frames.div_ceil(tiles_across) * tile_height;
        }

        Ok(Self {
            file: Arc::new(file),
            tile_width,
            tile_height,
            matrix_width,
            matrix_height,
            number_of_frames,
            pixel_data_offset,
            frames: RwLock::new(Vec::new()),
        })
    }

    /// Whether the frame offset table has been built.
    pub fn is_indexed(&self) -> bool {
        !self.frames.read().is_empty()
    }

    /// Scan the encapsulated item sequence and build the per-frame offset
    /// table. The first item is the Basic Offset Table (possibly empty);
    /// every following item is one frame. Safe to call from a background
    /// task; idempotent.
    pub fn index_pixel_data(&self) -> Result<(), DicomError> {
        if self.is_indexed() {
            return Ok(());
        }

        let mut entries = Vec::with_capacity(self.number_of_frames as usize);
        let mut pos = self.pixel_data_offset;
        let mut first = true;
        loop {
            let header = self.file.read_at(pos, 8)?;
            let group = read_u16_le(&header[0..2]);
            let element = read_u16_le(&header[2..4]);
            let length = read_u32_le(&header[4..8]);
            pos += 8;

            if (group, element) == TAG_SEQUENCE_DELIMITER {
                break;
            }
            if (group, element) != TAG_ITEM {
                return Err(DicomError::Parse(format!(
                    "unexpected tag ({:04X},{:04X}) in pixel data sequence",
                    group, element
                )));
            }
            if first {
                // Basic Offset Table: lengths are redundant with the walk,
                // so the content is skipped either way.
                first = false;
            } else {
                entries.push(FrameEntry {
                    offset: pos,
                    length,
                });
            }
            pos += length as u64;
            if entries.len() > self.number_of_frames as usize {
                return Err(DicomError::Parse(format!(
                    "more items than the declared {} frames",
                    self.number_of_frames
                )));
            }
        }

        debug!(frames = entries.len(), "indexed DICOM pixel data");
        *self.frames.write() = entries;
        Ok(())
    }

    /// Decode one frame into `dest` (BGRA). Requires
    /// [`DicomFile::index_pixel_data`] to have completed.
    ///
    /// Returns `Ok(false)` for frame indices past the stored frame count.
    pub fn decode_frame(
        &self,
        frame_index: usize,
        dest: &mut [u8],
        scratch: &mut Arena,
    ) -> Result<bool, SlideError> {
        let entry = {
            let frames = self.frames.read();
            match frames.get(frame_index) {
                Some(&entry) => entry,
                None => return Ok(false),
            }
        };

        let scope = scratch.begin_scope();
        let slice = scratch.alloc(entry.length as usize, 16);
        let read = self.file.read_into(scratch.get_mut(slice), entry.offset);
        let result = match read {
            Err(e) => Err(SlideError::Io(e)),
            Ok(()) => {
                // JPEG baseline is the transfer syntax of every WSI export
                // encountered so far.
                jpeg::decode_jpeg_to_bgra(
                    scratch.get(slice),
                    self.tile_width,
                    self.tile_height,
                    dest,
                )
                .map(|_| true)
            }
        };
        scratch.end_scope(scope);
        result
    }
}

// =============================================================================
// Explicit-VR element walking
// =============================================================================

struct DataElement {
    group: u16,
    element: u16,
    value_offset: u64,
    value_length: u64,
    undefined_length: bool,
}

struct ElementParser<'a> {
    file: &'a SharedFile,
    pos: u64,
}

impl<'a> ElementParser<'a> {
    /// Read the next element header, or `None` at end of file.
    fn next_element(&mut self) -> Result<Option<DataElement>, DicomError> {
        if self.pos + 8 > self.file.size() {
            return Ok(None);
        }
        let header = self.file.read_at(self.pos, 8)?;
        let group = read_u16_le(&header[0..2]);
        let element = read_u16_le(&header[2..4]);
        let vr = [header[4], header[5]];

        // Two explicit-VR layouts: short (2-byte length) and long (2-byte
        // pad + 4-byte length). OB/OW/SQ/UN/UT use the long form.
        let long_form = matches!(&vr, b"OB" | b"OW" | b"OF" | b"SQ" | b"UN" | b"UT");
        let (value_offset, value_length) = if long_form {
            if self.pos + 12 > self.file.size() {
                return Ok(None);
            }
            let extended = self.file.read_at(self.pos + 8, 4)?;
            (self.pos + 12, read_u32_le(&extended) as u64)
        } else {
            (self.pos + 8, read_u16_le(&header[6..8]) as u64)
        };

        let undefined_length = value_length == 0xFFFF_FFFF;
        Ok(Some(DataElement {
            group,
            element,
            value_offset,
            value_length: if undefined_length { 0 } else { value_length },
            undefined_length,
        }))
    }

    fn skip_value(&mut self, element: &DataElement) {
        self.pos = element.value_offset + element.value_length;
    }

    fn read_string(&self, element: &DataElement) -> Result<String, DicomError> {
        let bytes = self
            .file
            .read_at(element.value_offset, element.value_length as usize)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn read_u16(&self, element: &DataElement) -> Result<u16, DicomError> {
        let bytes = self.file.read_at(element.value_offset, 2)?;
        Ok(read_u16_le(&bytes))
    }

    fn read_u32(&self, element: &DataElement) -> Result<u32, DicomError> {
        let bytes = self.file.read_at(element.value_offset, 4)?;
        Ok(read_u32_le(&bytes))
    }
}
