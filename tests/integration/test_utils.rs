//! Test utilities: synthetic TIFF, MRXS, and DICOM fixtures.
//!
//! The builders write byte-exact container structures so the parsers are
//! exercised against the real on-disk layouts, including inline vs.
//! offset tag values, endianness, BigTIFF offsets, MRXS index paging, and
//! DICOM encapsulated items.

use std::path::Path;

// =============================================================================
// Pixel helpers
// =============================================================================

/// Create a solid-color RGB JPEG.
pub fn solid_jpeg(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    use image::codecs::jpeg::JpegEncoder;
    use image::{Rgb, RgbImage};
    let img = RgbImage::from_pixel(width, height, Rgb(rgb));
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, 95)
        .encode_image(&img)
        .unwrap();
    buf
}

/// Uncompressed RGB tile bytes where every pixel encodes its position:
/// `R = marker_r`, `G = marker_g`, `B = (px + py) % 256`.
pub fn positional_rgb_tile(tile_w: u32, tile_h: u32, marker_r: u8, marker_g: u8) -> Vec<u8> {
    let mut data = Vec::with_capacity((tile_w * tile_h * 3) as usize);
    for py in 0..tile_h {
        for px in 0..tile_w {
            data.push(marker_r);
            data.push(marker_g);
            data.push(((px + py) % 256) as u8);
        }
    }
    data
}

// =============================================================================
// TIFF builder
// =============================================================================

/// One IFD of a synthetic TIFF.
pub struct TestIfd {
    pub width: u32,
    pub height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub compression: u16,
    pub photometric: u16,
    pub samples_per_pixel: u16,
    /// 0 omits the Predictor tag.
    pub predictor: u16,
    pub max_sample_value: Option<u8>,
    pub description: Option<String>,
    pub jpeg_tables: Option<Vec<u8>>,
    /// Per-tile payloads in row-major order; an empty vec means a zero
    /// byte count (empty tile).
    pub tile_data: Vec<Vec<u8>>,
    pub subfile_type: Option<u32>,
    /// Write ImageWidth/ImageLength as SHORT instead of LONG.
    pub use_short_dims: bool,
    /// X/YResolution as (numerator, denominator) plus ResolutionUnit.
    pub resolution: Option<(u32, u32, u16)>,
}

impl TestIfd {
    /// A tiled IFD with the same payload repeated for every tile.
    pub fn tiled(width: u32, height: u32, tile: u32, compression: u16, payload: Vec<u8>) -> Self {
        let tiles_x = width.div_ceil(tile);
        let tiles_y = height.div_ceil(tile);
        Self {
            width,
            height,
            tile_width: tile,
            tile_height: tile,
            compression,
            photometric: 2,
            samples_per_pixel: 3,
            predictor: 0,
            max_sample_value: None,
            description: None,
            jpeg_tables: None,
            tile_data: vec![payload; (tiles_x * tiles_y) as usize],
            subfile_type: None,
            use_short_dims: false,
            resolution: None,
        }
    }

    fn tile_count(&self) -> usize {
        self.tile_data.len()
    }
}

enum Payload {
    /// Raw element bytes, already in file byte order; stored inline when
    /// they fit the value slot.
    Elements(Vec<u8>),
}

struct Entry {
    tag: u16,
    typ: u16,
    count: u64,
    payload: Payload,
}

struct TiffWriter {
    little_endian: bool,
    bigtiff: bool,
}

impl TiffWriter {
    fn u16_bytes(&self, v: u16) -> [u8; 2] {
        if self.little_endian {
            v.to_le_bytes()
        } else {
            v.to_be_bytes()
        }
    }

    fn u32_bytes(&self, v: u32) -> [u8; 4] {
        if self.little_endian {
            v.to_le_bytes()
        } else {
            v.to_be_bytes()
        }
    }

    fn u64_bytes(&self, v: u64) -> [u8; 8] {
        if self.little_endian {
            v.to_le_bytes()
        } else {
            v.to_be_bytes()
        }
    }

    fn offset_bytes(&self, v: u64) -> Vec<u8> {
        if self.bigtiff {
            self.u64_bytes(v).to_vec()
        } else {
            self.u32_bytes(v as u32).to_vec()
        }
    }

    fn entry_size(&self) -> usize {
        if self.bigtiff {
            20
        } else {
            12
        }
    }

    fn count_size(&self) -> usize {
        if self.bigtiff {
            8
        } else {
            2
        }
    }

    fn slot_size(&self) -> usize {
        if self.bigtiff {
            8
        } else {
            4
        }
    }

    fn header_size(&self) -> usize {
        if self.bigtiff {
            16
        } else {
            8
        }
    }

    fn type_size(typ: u16) -> usize {
        match typ {
            1 | 2 | 6 | 7 => 1,
            3 | 8 => 2,
            4 | 9 | 11 => 4,
            5 | 10 | 12 | 16 | 17 | 18 => 8,
            _ => 1,
        }
    }

    fn scalar_entry(&self, tag: u16, typ: u16, value: u64) -> Entry {
        let bytes = match typ {
            3 => self.u16_bytes(value as u16).to_vec(),
            4 => self.u32_bytes(value as u32).to_vec(),
            16 => self.u64_bytes(value).to_vec(),
            1 => vec![value as u8],
            _ => panic!("unsupported scalar type {}", typ),
        };
        Entry {
            tag,
            typ,
            count: 1,
            payload: Payload::Elements(bytes),
        }
    }

    fn array_entry(&self, tag: u16, typ: u16, values: &[u64]) -> Entry {
        let mut bytes = Vec::new();
        for &v in values {
            match typ {
                3 => bytes.extend_from_slice(&self.u16_bytes(v as u16)),
                4 => bytes.extend_from_slice(&self.u32_bytes(v as u32)),
                16 => bytes.extend_from_slice(&self.u64_bytes(v)),
                _ => panic!("unsupported array type {}", typ),
            }
        }
        Entry {
            tag,
            typ,
            count: values.len() as u64,
            payload: Payload::Elements(bytes),
        }
    }

    fn rational_entry(&self, tag: u16, numerator: u32, denominator: u32) -> Entry {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&self.u32_bytes(numerator));
        bytes.extend_from_slice(&self.u32_bytes(denominator));
        Entry {
            tag,
            typ: 5,
            count: 1,
            payload: Payload::Elements(bytes),
        }
    }

    fn ascii_entry(&self, tag: u16, text: &str) -> Entry {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        Entry {
            tag,
            typ: 2,
            count: bytes.len() as u64,
            payload: Payload::Elements(bytes),
        }
    }

    fn undefined_entry(&self, tag: u16, data: &[u8]) -> Entry {
        Entry {
            tag,
            typ: 7,
            count: data.len() as u64,
            payload: Payload::Elements(data.to_vec()),
        }
    }
}

/// Serialize a TIFF (or BigTIFF) with the given IFD chain.
pub fn build_tiff(little_endian: bool, bigtiff: bool, ifds: &[TestIfd]) -> Vec<u8> {
    let w = TiffWriter {
        little_endian,
        bigtiff,
    };
    let offset_type: u16 = if bigtiff { 16 } else { 4 };

    // Pass 1: reserve the IFD blocks so external data can start after
    // them. Entry counts must be known first.
    let mut entry_lists: Vec<Vec<Entry>> = Vec::new();
    // Tile payload offsets are assigned before building the offset
    // arrays, into a blob that starts after all IFD blocks; the blob
    // base depends on entry counts, which depend only on the IFD
    // definitions, so count entries up front.
    let mut entry_counts = Vec::new();
    for ifd in ifds {
        let mut count = 8; // width, height, bits, compression, photometric, spp, tile w/h
        count += 2; // TileOffsets, TileByteCounts
        if ifd.description.is_some() {
            count += 1;
        }
        if ifd.jpeg_tables.is_some() {
            count += 1;
        }
        if ifd.predictor != 0 {
            count += 1;
        }
        if ifd.max_sample_value.is_some() {
            count += 1;
        }
        if ifd.subfile_type.is_some() {
            count += 1;
        }
        if ifd.resolution.is_some() {
            count += 3; // XResolution, YResolution, ResolutionUnit
        }
        entry_counts.push(count);
    }

    let header_size = w.header_size();
    let mut ifd_offsets = Vec::new();
    let mut cursor = header_size;
    for &count in &entry_counts {
        ifd_offsets.push(cursor as u64);
        cursor += w.count_size() + count * w.entry_size() + w.slot_size();
    }
    let blob_base = cursor as u64;
    let mut blob: Vec<u8> = Vec::new();

    // Pass 2: place tile payloads and build the entry lists.
    for ifd in ifds {
        let mut tile_offsets = Vec::with_capacity(ifd.tile_count());
        let mut tile_byte_counts = Vec::with_capacity(ifd.tile_count());
        for payload in &ifd.tile_data {
            if payload.is_empty() {
                tile_offsets.push(0u64);
                tile_byte_counts.push(0u64);
            } else {
                tile_offsets.push(blob_base + blob.len() as u64);
                tile_byte_counts.push(payload.len() as u64);
                blob.extend_from_slice(payload);
            }
        }

        let dim_type = if ifd.use_short_dims { 3 } else { 4 };
        let mut entries = vec![
            w.scalar_entry(256, dim_type, ifd.width as u64),
            w.scalar_entry(257, dim_type, ifd.height as u64),
            w.scalar_entry(258, 3, 8),
            w.scalar_entry(259, 3, ifd.compression as u64),
            w.scalar_entry(262, 3, ifd.photometric as u64),
            w.scalar_entry(277, 3, ifd.samples_per_pixel as u64),
            w.scalar_entry(322, 3, ifd.tile_width as u64),
            w.scalar_entry(323, 3, ifd.tile_height as u64),
            w.array_entry(324, offset_type, &tile_offsets),
            w.array_entry(325, offset_type, &tile_byte_counts),
        ];
        if let Some(subfile_type) = ifd.subfile_type {
            entries.push(w.scalar_entry(254, 4, subfile_type as u64));
        }
        if let Some(description) = &ifd.description {
            entries.push(w.ascii_entry(270, description));
        }
        if let Some(tables) = &ifd.jpeg_tables {
            entries.push(w.undefined_entry(347, tables));
        }
        if ifd.predictor != 0 {
            entries.push(w.scalar_entry(317, 3, ifd.predictor as u64));
        }
        if let Some(max_value) = ifd.max_sample_value {
            entries.push(w.scalar_entry(341, 1, max_value as u64));
        }
        if let Some((numerator, denominator, unit)) = ifd.resolution {
            entries.push(w.rational_entry(282, numerator, denominator));
            entries.push(w.rational_entry(283, numerator, denominator));
            entries.push(w.scalar_entry(296, 3, unit as u64));
        }
        entries.sort_by_key(|e| e.tag);
        assert_eq!(entries.len(), entry_counts[entry_lists.len()]);
        entry_lists.push(entries);
    }

    // Pass 3: emit. Externalize payloads that do not fit the value slot.
    let mut data = Vec::new();
    if little_endian {
        data.extend_from_slice(b"II");
    } else {
        data.extend_from_slice(b"MM");
    }
    if bigtiff {
        data.extend_from_slice(&w.u16_bytes(43));
        data.extend_from_slice(&w.u16_bytes(8));
        data.extend_from_slice(&w.u16_bytes(0));
        data.extend_from_slice(&w.u64_bytes(ifd_offsets[0]));
    } else {
        data.extend_from_slice(&w.u16_bytes(42));
        data.extend_from_slice(&w.u32_bytes(ifd_offsets[0] as u32));
    }

    for (i, entries) in entry_lists.iter().enumerate() {
        assert_eq!(data.len() as u64, ifd_offsets[i]);
        if bigtiff {
            data.extend_from_slice(&w.u64_bytes(entries.len() as u64));
        } else {
            data.extend_from_slice(&w.u16_bytes(entries.len() as u16));
        }
        for entry in entries {
            data.extend_from_slice(&w.u16_bytes(entry.tag));
            data.extend_from_slice(&w.u16_bytes(entry.typ));
            if bigtiff {
                data.extend_from_slice(&w.u64_bytes(entry.count));
            } else {
                data.extend_from_slice(&w.u32_bytes(entry.count as u32));
            }
            let Payload::Elements(bytes) = &entry.payload;
            let total = TiffWriter::type_size(entry.typ) * entry.count as usize;
            assert_eq!(total, bytes.len());
            if total <= w.slot_size() {
                let mut slot = bytes.clone();
                slot.resize(w.slot_size(), 0);
                data.extend_from_slice(&slot);
            } else {
                let offset = blob_base + blob.len() as u64;
                blob.extend_from_slice(bytes);
                data.extend_from_slice(&w.offset_bytes(offset));
            }
        }
        let next = ifd_offsets.get(i + 1).copied().unwrap_or(0);
        data.extend_from_slice(&w.offset_bytes(next));
    }

    data.extend_from_slice(&blob);
    data
}

/// Write a TIFF to a temp file and return the handle.
pub fn write_tiff_file(little_endian: bool, bigtiff: bool, ifds: &[TestIfd]) -> tempfile::NamedTempFile {
    use std::io::Write;
    let data = build_tiff(little_endian, bigtiff, ifds);
    let mut tmp = tempfile::Builder::new().suffix(".tiff").tempfile().unwrap();
    tmp.write_all(&data).unwrap();
    tmp.flush().unwrap();
    tmp
}

// =============================================================================
// LZW encoder (test vectors only)
// =============================================================================

/// Compress data with standard TIFF LZW (MSB-first, early change).
pub fn lzw_compress(data: &[u8]) -> Vec<u8> {
    use std::collections::HashMap;

    const CLEAR: u16 = 256;
    const EOI: u16 = 257;

    let mut out = Vec::new();
    let mut bit_buffer = 0u32;
    let mut bit_count = 0u32;
    let mut emit = |code: u16, width: u32, out: &mut Vec<u8>| {
        bit_buffer = (bit_buffer << width) | code as u32;
        bit_count += width;
        while bit_count >= 8 {
            bit_count -= 8;
            out.push((bit_buffer >> bit_count) as u8);
        }
    };

    let mut table: HashMap<(u16, u8), u16> = HashMap::new();
    let mut next_free = 258u16;
    let mut width = 9u32;

    emit(CLEAR, width, &mut out);
    let mut prefix: Option<u16> = None;
    for &byte in data {
        match prefix {
            None => prefix = Some(byte as u16),
            Some(p) => {
                if let Some(&code) = table.get(&(p, byte)) {
                    prefix = Some(code);
                } else {
                    emit(p, width, &mut out);
                    if next_free < 4096 {
                        table.insert((p, byte), next_free);
                        next_free += 1;
                        if u32::from(next_free) == (1 << width) && width < 12 {
                            width += 1;
                        }
                    }
                    prefix = Some(byte as u16);
                }
            }
        }
    }
    if let Some(p) = prefix {
        emit(p, width, &mut out);
    }
    emit(EOI, width, &mut out);
    if bit_count > 0 {
        out.push((bit_buffer << (8 - bit_count)) as u8);
    }
    out
}

// =============================================================================
// MRXS fixture
// =============================================================================

/// Parameters of the standard MRXS fixture written by
/// [`build_mrxs_fixture`].
pub struct MrxsFixture {
    pub tile: u32,
    pub base_tiles_x: u32,
    pub base_tiles_y: u32,
}

/// Write a complete MRXS slide directory:
///
/// - 4x2 base tile grid, 64px JPEG tiles, two zoom levels
/// - level 0 entries split across two index pages (3 + 3 entries)
/// - level 1 with a single entry
/// - base tiles at grid indices 6 and 7 absent (background)
pub fn build_mrxs_fixture(dir: &Path) -> MrxsFixture {
    let tile = 64u32;
    let (base_x, base_y) = (4u32, 2u32);

    std::fs::write(
        dir.join("Slidedat.ini"),
        "\
[GENERAL]\r\n\
CURRENT_SLIDE_VERSION = 2.2\r\n\
IMAGENUMBER_X = 4\r\n\
IMAGENUMBER_Y = 2\r\n\
[HIERARCHICAL]\r\n\
HIER_COUNT = 1\r\n\
NONHIER_COUNT = 0\r\n\
INDEXFILE = Index.dat\r\n\
HIER_0_NAME = Slide zoom level\r\n\
HIER_0_COUNT = 2\r\n\
HIER_0_VAL_0 = ZoomLevel_0\r\n\
HIER_0_VAL_0_SECTION = ZOOMLEVEL_0_SECTION\r\n\
HIER_0_VAL_1 = ZoomLevel_1\r\n\
HIER_0_VAL_1_SECTION = ZOOMLEVEL_1_SECTION\r\n\
[DATAFILE]\r\n\
FILE_COUNT = 1\r\n\
FILE_0 = Data0000.dat\r\n\
[ZOOMLEVEL_0_SECTION]\r\n\
DIGITIZER_WIDTH = 64\r\n\
DIGITIZER_HEIGHT = 64\r\n\
MICROMETER_PER_PIXEL_X = 0.25\r\n\
MICROMETER_PER_PIXEL_Y = 0.25\r\n\
IMAGE_FILL_COLOR_BGR = 16777215\r\n\
IMAGE_FORMAT = JPEG\r\n\
[ZOOMLEVEL_1_SECTION]\r\n\
DIGITIZER_WIDTH = 64\r\n\
DIGITIZER_HEIGHT = 64\r\n\
MICROMETER_PER_PIXEL_X = 0.5\r\n\
MICROMETER_PER_PIXEL_Y = 0.5\r\n\
IMAGE_FILL_COLOR_BGR = 16777215\r\n\
IMAGE_FORMAT = JPEG\r\n\
",
    )
    .unwrap();

    // Data file: one JPEG per present tile, colored by grid index.
    let mut dat = Vec::new();
    let mut level0_entries = Vec::new();
    for image_index in 0..6u32 {
        let jpeg = solid_jpeg(tile, tile, [(image_index * 30) as u8, 80, 160]);
        level0_entries.push((image_index, dat.len() as u32, jpeg.len() as u32));
        dat.extend_from_slice(&jpeg);
    }
    let level1_jpeg = solid_jpeg(tile, tile, [10, 200, 90]);
    let level1_entry = (0u32, dat.len() as u32, level1_jpeg.len() as u32);
    dat.extend_from_slice(&level1_jpeg);
    std::fs::write(dir.join("Data0000.dat"), &dat).unwrap();

    // Index.dat: header, 2 record pointers, then the page chains.
    // Level 0: two pages of three 16-byte entries. Level 1: one page.
    let header_size = 5 + 32 + 4 + 4;
    let hier_root = header_size as u32;
    let records = 2u32;
    let page0 = hier_root + records * 4;
    let page1 = page0 + 8 + 3 * 16;
    let level1_page = page1 + 8 + 3 * 16;

    let mut index = Vec::new();
    index.extend_from_slice(b"01.02");
    index.extend_from_slice(&[b'F'; 32]);
    index.extend_from_slice(&hier_root.to_le_bytes());
    index.extend_from_slice(&0u32.to_le_bytes());
    index.extend_from_slice(&page0.to_le_bytes()); // record 0: ZoomLevel_0
    index.extend_from_slice(&level1_page.to_le_bytes()); // record 1: ZoomLevel_1

    let write_page = |index: &mut Vec<u8>, entries: &[(u32, u32, u32)], next: u32| {
        index.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        index.extend_from_slice(&next.to_le_bytes());
        for &(image, offset, length) in entries {
            index.extend_from_slice(&image.to_le_bytes());
            index.extend_from_slice(&offset.to_le_bytes());
            index.extend_from_slice(&length.to_le_bytes());
            index.extend_from_slice(&0u32.to_le_bytes()); // file 0
        }
    };
    write_page(&mut index, &level0_entries[0..3], page1);
    write_page(&mut index, &level0_entries[3..6], 0);
    write_page(&mut index, &[level1_entry], 0);
    std::fs::write(dir.join("Index.dat"), &index).unwrap();

    MrxsFixture {
        tile,
        base_tiles_x: base_x,
        base_tiles_y: base_y,
    }
}

// =============================================================================
// DICOM fixture
// =============================================================================

/// Write a minimal DICOM-WSI instance with encapsulated JPEG frames.
pub fn build_dicom_fixture(path: &Path, tile: u32, tiles_x: u32, tiles_y: u32) {
    let frames: Vec<Vec<u8>> = (0..tiles_x * tiles_y)
        .map(|i| solid_jpeg(tile, tile, [(i * 40) as u8, 100, 50]))
        .collect();

    let mut data = vec![0u8; 128];
    data.extend_from_slice(b"DICM");

    let short_element = |data: &mut Vec<u8>, group: u16, element: u16, vr: &[u8; 2], value: &[u8]| {
        data.extend_from_slice(&group.to_le_bytes());
        data.extend_from_slice(&element.to_le_bytes());
        data.extend_from_slice(vr);
        data.extend_from_slice(&(value.len() as u16).to_le_bytes());
        data.extend_from_slice(value);
    };

    let frame_count = format!("{}", frames.len());
    short_element(&mut data, 0x0028, 0x0008, b"IS", frame_count.as_bytes());
    short_element(&mut data, 0x0028, 0x0010, b"US", &(tile as u16).to_le_bytes());
    short_element(&mut data, 0x0028, 0x0011, b"US", &(tile as u16).to_le_bytes());
    short_element(&mut data, 0x0048, 0x0006, b"UL", &(tiles_x * tile).to_le_bytes());
    short_element(&mut data, 0x0048, 0x0007, b"UL", &(tiles_y * tile).to_le_bytes());

    // Encapsulated PixelData with an empty Basic Offset Table.
    data.extend_from_slice(&0x7FE0u16.to_le_bytes());
    data.extend_from_slice(&0x0010u16.to_le_bytes());
    data.extend_from_slice(b"OB");
    data.extend_from_slice(&[0, 0]);
    data.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    data.extend_from_slice(&0xFFFEu16.to_le_bytes());
    data.extend_from_slice(&0xE000u16.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    for frame in &frames {
        data.extend_from_slice(&0xFFFEu16.to_le_bytes());
        data.extend_from_slice(&0xE000u16.to_le_bytes());
        data.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        data.extend_from_slice(frame);
    }
    data.extend_from_slice(&0xFFFEu16.to_le_bytes());
    data.extend_from_slice(&0xE0DDu16.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());

    std::fs::write(path, &data).unwrap();
}
