//! IFD reading and tag interpretation.
//!
//! An IFD is a tag count, a run of fixed-size tag records, and a next-IFD
//! offset. Each record holds its value inline iff
//! `type_size * count <= value_slot_size`; otherwise the slot is an offset.
//! All multi-byte fields are swapped per element according to the file's
//! byte order; RATIONAL halves swap independently.
//!
//! Unknown tags are skipped. Unknown field types are tolerated and their
//! payload ignored.

use crate::error::TiffError;
use crate::io::ChunkFetcher;
use crate::io::{read_remote_chunk, RemoteLocation, SharedFile};
use bytes::Bytes;

use super::parser::{ByteOrder, TiffHeader};
use super::tags::{photometric, FieldType, TiffTag, SUBFILETYPE_REDUCED_IMAGE};

// =============================================================================
// TiffSource
// =============================================================================

/// Where the TIFF bytes come from: a local shared file handle or a remote
/// chunk fetcher returning HTTP-framed content.
pub enum TiffSource {
    Local(SharedFile),
    Remote {
        fetcher: std::sync::Arc<dyn ChunkFetcher>,
        location: RemoteLocation,
        size: u64,
    },
}

impl TiffSource {
    /// Total resource size in bytes.
    pub fn size(&self) -> u64 {
        match self {
            TiffSource::Local(file) => file.size(),
            TiffSource::Remote { size, .. } => *size,
        }
    }

    /// Read exactly `len` bytes at `offset`.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, crate::error::IoError> {
        match self {
            TiffSource::Local(file) => file.read_at(offset, len),
            TiffSource::Remote {
                fetcher, location, ..
            } => read_remote_chunk(fetcher.as_ref(), location, offset, len as u64),
        }
    }
}

// =============================================================================
// Rational
// =============================================================================

/// A TIFF RATIONAL: two unsigned 32-bit halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rational {
    pub numerator: u32,
    pub denominator: u32,
}

impl Rational {
    /// Convert to a float; zero when the denominator is zero.
    pub fn to_f64(self) -> f64 {
        if self.denominator == 0 {
            0.0
        } else {
            self.numerator as f64 / self.denominator as f64
        }
    }
}

// =============================================================================
// Raw tag records
// =============================================================================

/// One tag record with its value slot still raw.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub code: u16,
    pub field_type_raw: u16,
    pub field_type: Option<FieldType>,
    pub count: u64,
    /// The raw value-or-offset slot bytes (4 classic / 8 BigTIFF).
    slot: [u8; 8],
    slot_len: usize,
}

impl RawEntry {
    /// Whether the value is stored inline in the slot.
    pub fn is_inline(&self) -> bool {
        match self.field_type {
            Some(ft) => ft.size_in_bytes() as u64 * self.count <= self.slot_len as u64,
            None => false,
        }
    }

    /// The slot interpreted as an offset.
    pub fn offset(&self, bo: ByteOrder) -> u64 {
        bo.read_offset(&self.slot[..self.slot_len], self.slot_len)
    }

    fn slot_bytes(&self) -> &[u8] {
        &self.slot[..self.slot_len]
    }
}

// =============================================================================
// TagValueReader
// =============================================================================

/// Reads tag values, fetching out-of-line payloads from the source.
pub struct TagValueReader<'a> {
    source: &'a TiffSource,
    header: &'a TiffHeader,
}

impl<'a> TagValueReader<'a> {
    pub fn new(source: &'a TiffSource, header: &'a TiffHeader) -> Self {
        Self { source, header }
    }

    #[inline]
    fn bo(&self) -> ByteOrder {
        self.header.byte_order
    }

    /// Raw value bytes: the inline slot prefix, or the payload at the
    /// entry's offset.
    pub fn value_bytes(&self, entry: &RawEntry) -> Result<Bytes, TiffError> {
        let ft = match entry.field_type {
            Some(ft) => ft,
            // Unknown field type: treat the payload as absent.
            None => return Ok(Bytes::new()),
        };
        let total = ft.size_in_bytes() as u64 * entry.count;
        if entry.is_inline() {
            Ok(Bytes::copy_from_slice(&entry.slot_bytes()[..total as usize]))
        } else {
            if entry.offset(self.bo()).saturating_add(total) > self.source.size() {
                return Err(TiffError::InvalidTagValue {
                    tag: "unknown",
                    message: format!("payload of {} bytes extends past end of file", total),
                });
            }
            Ok(self.source.read_at(entry.offset(self.bo()), total as usize)?)
        }
    }

    /// First element of an integer tag as u64 (SHORT, LONG or LONG8).
    pub fn scalar(&self, entry: &RawEntry) -> Result<u64, TiffError> {
        let bytes = self.value_bytes(entry)?;
        let bo = self.bo();
        match entry.field_type {
            Some(FieldType::Byte) => Ok(bytes[0] as u64),
            Some(FieldType::Short) => Ok(bo.read_u16(&bytes) as u64),
            Some(FieldType::Long) => Ok(bo.read_u32(&bytes) as u64),
            Some(FieldType::Long8) => Ok(bo.read_u64(&bytes)),
            _ => Err(TiffError::InvalidTagValue {
                tag: "unknown",
                message: format!("expected integer type, got {:?}", entry.field_type),
            }),
        }
    }

    /// Array of integers widened to u64 (SHORT, LONG or LONG8 elements).
    pub fn u64_array(&self, entry: &RawEntry) -> Result<Vec<u64>, TiffError> {
        let bytes = self.value_bytes(entry)?;
        let bo = self.bo();
        let count = entry.count as usize;
        let mut values = Vec::with_capacity(count);
        match entry.field_type {
            Some(FieldType::Short) => {
                for i in 0..count {
                    values.push(bo.read_u16(&bytes[i * 2..]) as u64);
                }
            }
            Some(FieldType::Long) => {
                for i in 0..count {
                    values.push(bo.read_u32(&bytes[i * 4..]) as u64);
                }
            }
            Some(FieldType::Long8) => {
                for i in 0..count {
                    values.push(bo.read_u64(&bytes[i * 8..]));
                }
            }
            _ => {
                return Err(TiffError::InvalidTagValue {
                    tag: "unknown",
                    message: format!("expected integer array, got {:?}", entry.field_type),
                })
            }
        }
        Ok(values)
    }

    /// Array of u8 values (BYTE-typed tags such as SMaxSampleValue).
    pub fn u8_array(&self, entry: &RawEntry) -> Result<Vec<u8>, TiffError> {
        let bytes = self.value_bytes(entry)?;
        Ok(bytes.to_vec())
    }

    /// Array of RATIONALs; each 32-bit half is swapped independently.
    pub fn rationals(&self, entry: &RawEntry) -> Result<Vec<Rational>, TiffError> {
        let bytes = self.value_bytes(entry)?;
        let bo = self.bo();
        let count = entry.count as usize;
        let mut values = Vec::with_capacity(count);
        for i in 0..count {
            values.push(Rational {
                numerator: bo.read_u32(&bytes[i * 8..]),
                denominator: bo.read_u32(&bytes[i * 8 + 4..]),
            });
        }
        Ok(values)
    }

    /// Null-terminated ASCII string.
    pub fn string(&self, entry: &RawEntry) -> Result<String, TiffError> {
        let bytes = self.value_bytes(entry)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

// =============================================================================
// Ifd
// =============================================================================

/// Classification of an IFD within a slide file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubimageKind {
    Unknown,
    /// A pyramid level
    Level,
    /// The macro overview photo
    Macro,
    /// The specimen label photo
    Label,
}

/// One parsed IFD with every field the engine consumes.
#[derive(Debug, Clone)]
pub struct Ifd {
    pub index: usize,
    pub subfile_type: u32,
    pub image_width: u32,
    pub image_height: u32,
    pub compression: u16,
    pub photometric: u16,
    pub image_description: Option<String>,
    pub software: Option<String>,
    pub is_philips: bool,
    pub is_ndpi: bool,
    pub samples_per_pixel: u16,
    pub rows_per_strip: u32,
    pub strip_offsets: Vec<u64>,
    pub strip_byte_counts: Vec<u64>,
    pub x_resolution: Option<Rational>,
    pub y_resolution: Option<Rational>,
    pub resolution_unit: u16,
    pub predictor: u16,
    pub tile_width: u32,
    pub tile_height: u32,
    pub tile_offsets: Vec<u64>,
    pub tile_byte_counts: Vec<u64>,
    pub sample_format: u16,
    pub min_sample_value: u8,
    pub max_sample_value: u8,
    pub has_max_sample_value: bool,
    pub jpeg_tables: Option<Vec<u8>>,
    pub chroma_subsampling: (u16, u16),
    pub reference_black_white: Vec<Rational>,

    // Derived at read time
    pub is_tiled: bool,
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
    pub kind: SubimageKind,

    // Derived by pyramid post-init
    pub downsample_level: i32,
    pub downsample_factor: f32,
    pub um_per_pixel_x: f32,
    pub um_per_pixel_y: f32,
    pub x_tile_side_in_um: f32,
    pub y_tile_side_in_um: f32,
}

impl Default for Ifd {
    fn default() -> Self {
        Self {
            index: 0,
            subfile_type: 0,
            image_width: 0,
            image_height: 0,
            compression: 1,
            // TIFF requires PhotometricInterpretation, but enough files
            // omit it that RGB is assumed.
            photometric: photometric::RGB,
            image_description: None,
            software: None,
            is_philips: false,
            is_ndpi: false,
            samples_per_pixel: 1,
            rows_per_strip: 0,
            strip_offsets: Vec::new(),
            strip_byte_counts: Vec::new(),
            x_resolution: None,
            y_resolution: None,
            resolution_unit: 0,
            predictor: 1,
            tile_width: 0,
            tile_height: 0,
            tile_offsets: Vec::new(),
            tile_byte_counts: Vec::new(),
            sample_format: 1,
            min_sample_value: 0,
            max_sample_value: 0,
            has_max_sample_value: false,
            jpeg_tables: None,
            chroma_subsampling: (0, 0),
            reference_black_white: Vec::new(),
            is_tiled: false,
            width_in_tiles: 0,
            height_in_tiles: 0,
            kind: SubimageKind::Unknown,
            downsample_level: 0,
            downsample_factor: 1.0,
            um_per_pixel_x: 0.0,
            um_per_pixel_y: 0.0,
            x_tile_side_in_um: 0.0,
            y_tile_side_in_um: 0.0,
        }
    }
}

impl Ifd {
    /// Number of tile slots in this IFD.
    #[inline]
    pub fn tile_count(&self) -> usize {
        self.tile_offsets.len()
    }
}

/// Read one IFD at `offset`. Returns the parsed IFD and the offset of the
/// next IFD in the chain (zero terminates the chain).
pub fn read_ifd(
    source: &TiffSource,
    header: &TiffHeader,
    offset: u64,
    index: usize,
) -> Result<(Ifd, u64), TiffError> {
    let bo = header.byte_order;
    if offset >= source.size() {
        return Err(TiffError::InvalidIfdOffset(offset));
    }

    // Tag count
    let count_bytes = source.read_at(offset, header.ifd_count_size())?;
    let tag_count = if header.is_bigtiff {
        bo.read_u64(&count_bytes)
    } else {
        bo.read_u16(&count_bytes) as u64
    };

    let entry_size = header.ifd_entry_size();
    let body_size = tag_count * entry_size as u64 + header.bytesize_of_offsets as u64;
    if offset + header.ifd_count_size() as u64 + body_size > source.size() {
        return Err(TiffError::InvalidIfdOffset(offset));
    }
    let body = source.read_at(offset + header.ifd_count_size() as u64, body_size as usize)?;

    // Restructure the raw records so the interpretation below never has to
    // worry about layout or endianness again.
    let mut entries = Vec::with_capacity(tag_count as usize);
    for i in 0..tag_count as usize {
        let record = &body[i * entry_size..(i + 1) * entry_size];
        let code = bo.read_u16(&record[0..2]);
        let field_type_raw = bo.read_u16(&record[2..4]);
        let field_type = FieldType::from_u16(field_type_raw);
        let (count, slot_bytes) = if header.is_bigtiff {
            (bo.read_u64(&record[4..12]), &record[12..20])
        } else {
            (bo.read_u32(&record[4..8]) as u64, &record[8..12])
        };
        let mut slot = [0u8; 8];
        slot[..slot_bytes.len()].copy_from_slice(slot_bytes);
        entries.push(RawEntry {
            code,
            field_type_raw,
            field_type,
            count,
            slot,
            slot_len: slot_bytes.len(),
        });
    }

    let next_ifd_offset = bo.read_offset(
        &body[tag_count as usize * entry_size..],
        header.bytesize_of_offsets,
    );

    // Interpret the tags we consume; skip the rest.
    let values = TagValueReader::new(source, header);
    let mut ifd = Ifd {
        index,
        ..Ifd::default()
    };

    for entry in &entries {
        let tag = match TiffTag::from_u16(entry.code) {
            Some(tag) => tag,
            None => continue,
        };
        match tag {
            TiffTag::NewSubfileType => ifd.subfile_type = values.scalar(entry)? as u32,
            TiffTag::ImageWidth => ifd.image_width = values.scalar(entry)? as u32,
            TiffTag::ImageLength => ifd.image_height = values.scalar(entry)? as u32,
            TiffTag::BitsPerSample => {
                // Expected to be 8 per channel for WSI content; kept only
                // for diagnostics.
                if let Ok(bits) = values.u64_array(entry) {
                    tracing::trace!(ifd = index, ?bits, "BitsPerSample");
                }
            }
            TiffTag::Compression => ifd.compression = values.scalar(entry)? as u16,
            TiffTag::PhotometricInterpretation => ifd.photometric = values.scalar(entry)? as u16,
            TiffTag::ImageDescription => {
                ifd.image_description = Some(values.string(entry)?);
            }
            TiffTag::StripOffsets => ifd.strip_offsets = values.u64_array(entry)?,
            TiffTag::SamplesPerPixel => ifd.samples_per_pixel = values.scalar(entry)? as u16,
            TiffTag::RowsPerStrip => ifd.rows_per_strip = values.scalar(entry)? as u32,
            TiffTag::StripByteCounts => ifd.strip_byte_counts = values.u64_array(entry)?,
            TiffTag::XResolution => {
                ifd.x_resolution = values.rationals(entry)?.first().copied();
            }
            TiffTag::YResolution => {
                ifd.y_resolution = values.rationals(entry)?.first().copied();
            }
            TiffTag::PlanarConfiguration => {
                // Chunky (1) is the only layout produced by slide scanners.
                let planar = values.scalar(entry)?;
                if planar != 1 {
                    tracing::warn!(ifd = index, planar, "non-chunky PlanarConfiguration");
                }
            }
            TiffTag::ResolutionUnit => ifd.resolution_unit = values.scalar(entry)? as u16,
            TiffTag::Software => {
                let software = values.string(entry)?;
                if software.starts_with("Philips") {
                    ifd.is_philips = true;
                }
                ifd.software = Some(software);
            }
            TiffTag::Predictor => ifd.predictor = values.scalar(entry)? as u16,
            TiffTag::TileWidth => ifd.tile_width = values.scalar(entry)? as u32,
            TiffTag::TileLength => ifd.tile_height = values.scalar(entry)? as u32,
            TiffTag::TileOffsets => ifd.tile_offsets = values.u64_array(entry)?,
            TiffTag::TileByteCounts => ifd.tile_byte_counts = values.u64_array(entry)?,
            TiffTag::SampleFormat => {
                if let Ok(formats) = values.u64_array(entry) {
                    if let Some(&first) = formats.first() {
                        ifd.sample_format = first as u16;
                    }
                }
            }
            TiffTag::SMinSampleValue => {
                // Only meaningful for 8-bit integer samples.
                if ifd.sample_format <= 2 && entry.field_type == Some(FieldType::Byte) {
                    if let Some(&lowest) = values.u8_array(entry)?.iter().min() {
                        ifd.min_sample_value = lowest;
                    }
                }
            }
            TiffTag::SMaxSampleValue => {
                if ifd.sample_format <= 2 && entry.field_type == Some(FieldType::Byte) {
                    if let Some(&highest) = values.u8_array(entry)?.iter().max() {
                        ifd.max_sample_value = highest;
                        ifd.has_max_sample_value = true;
                    }
                }
            }
            TiffTag::JpegTables => {
                ifd.jpeg_tables = Some(values.value_bytes(entry)?.to_vec());
            }
            TiffTag::YCbCrSubSampling => {
                let factors = values.u64_array(entry)?;
                if factors.len() >= 2 {
                    ifd.chroma_subsampling = (factors[0] as u16, factors[1] as u16);
                }
            }
            TiffTag::ReferenceBlackWhite => {
                ifd.reference_black_white = values.rationals(entry)?;
            }
            TiffTag::NdpiMarker => ifd.is_ndpi = true,
        }
    }

    if ifd.tile_byte_counts.len() != ifd.tile_offsets.len() && !ifd.tile_byte_counts.is_empty() {
        return Err(TiffError::TileCountMismatch {
            offsets: ifd.tile_offsets.len() as u64,
            byte_counts: ifd.tile_byte_counts.len() as u64,
        });
    }

    ifd.is_tiled = !ifd.tile_offsets.is_empty();
    if ifd.tile_width > 0 {
        ifd.width_in_tiles = ifd.image_width.div_ceil(ifd.tile_width);
    }
    if ifd.tile_height > 0 {
        ifd.height_in_tiles = ifd.image_height.div_ceil(ifd.tile_height);
    }

    classify(&mut ifd);
    Ok((ifd, next_ifd_offset))
}

/// Deduce what kind of subimage an IFD is.
///
/// Slide files are not consistent here, so this is rule-based: the
/// ImageDescription prefix wins, then tiled IFDs that are the first image
/// or flagged reduced-resolution count as levels. Files that never set
/// NewSubfileType on their level subimages (e.g. ASAP-converted TIFFs) get
/// the lenient fallback.
fn classify(ifd: &mut Ifd) {
    if let Some(description) = &ifd.image_description {
        if description.starts_with("Macro") {
            ifd.kind = SubimageKind::Macro;
            return;
        } else if description.starts_with("Label") {
            ifd.kind = SubimageKind::Label;
            return;
        } else if description.starts_with("level") {
            ifd.kind = SubimageKind::Level;
            return;
        }
    }
    if ifd.kind == SubimageKind::Unknown && ifd.tile_width > 0 {
        if ifd.index == 0
            || (ifd.subfile_type & SUBFILETYPE_REDUCED_IMAGE) != 0
            || ifd.subfile_type == 0
        {
            ifd.kind = SubimageKind::Level;
        }
    }
}
