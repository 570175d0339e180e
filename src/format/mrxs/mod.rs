//! MRXS (3DHISTECH/MIRAX) container reader.
//!
//! An MRXS slide is a directory holding `Slidedat.ini` (the table of
//! contents), one `Index.dat` (tile records, paged), and a series of
//! `Data*.dat` files carrying the compressed tiles. Opening proceeds in
//! three phases: parse the INI, parse the index, then open positional
//! handles to every data file.
//!
//! Tiles missing from the index are background and marked empty. The
//! optional stitching-intensity record yields per-camera-FOV slide
//! positions, kept as a registration aid.

pub mod index;
pub mod ini;

pub use index::{HierEntry, NonHierEntry, SlidePosition};
pub use ini::{MrxsImageFormat, SlidedatIni};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{MrxsError, SlideError};
use crate::format::jpeg;
use crate::io::{stream::read_entire_file, MemStream, SharedFile};
use crate::memory::Arena;

use ini::HierName;

/// One pyramid level of an MRXS slide.
#[derive(Debug, Clone)]
pub struct MrxsLevel {
    pub tile_width: u32,
    pub tile_height: u32,
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
    pub um_per_pixel_x: f64,
    pub um_per_pixel_y: f64,
    pub fill_color_bgr: u32,
    pub format: MrxsImageFormat,
    /// Row-major tile records; `None` marks a background tile absent from
    /// the index.
    pub tiles: Vec<Option<HierEntry>>,
}

impl MrxsLevel {
    /// Pixel width of the level (the tile grid extent).
    #[inline]
    pub fn width_in_pixels(&self) -> u32 {
        self.width_in_tiles * self.tile_width
    }

    /// Pixel height of the level.
    #[inline]
    pub fn height_in_pixels(&self) -> u32 {
        self.height_in_tiles * self.tile_height
    }
}

/// An opened MRXS slide.
pub struct MrxsFile {
    pub directory: PathBuf,
    pub slide_id: String,
    pub index_version: String,
    pub base_width_in_tiles: u32,
    pub base_height_in_tiles: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub mpp_x: f64,
    pub mpp_y: f64,
    pub is_mpp_known: bool,
    pub camera_image_divisions_per_side: u32,
    pub levels: Vec<MrxsLevel>,
    pub slide_positions: Vec<SlidePosition>,
    dat_files: Vec<Arc<SharedFile>>,
}

impl MrxsFile {
    /// Open an MRXS slide from either its directory or its `.mrxs` marker
    /// file (which points to a sibling directory of the same stem).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MrxsError> {
        let path = path.as_ref();
        let directory = if path.is_dir() {
            path.to_path_buf()
        } else {
            path.with_extension("")
        };
        if !directory.is_dir() {
            return Err(MrxsError::MissingFile(directory.display().to_string()));
        }

        // Phase 1: Slidedat.ini
        let ini_bytes = read_entire_file(directory.join("Slidedat.ini"))
            .map_err(|_| MrxsError::MissingFile("Slidedat.ini".to_string()))?;
        let ini = ini::parse_slidedat_ini(&ini_bytes)?;

        if ini.base_width_in_tiles == 0 || ini.base_height_in_tiles == 0 {
            return Err(MrxsError::MissingKey("GENERAL/IMAGENUMBER_X and _Y"));
        }
        let level_count = ini.zoom_level_count();
        if level_count == 0 {
            return Err(MrxsError::MissingKey("a \"Slide zoom level\" hier"));
        }

        // Phase 2: Index.dat
        let index_bytes = read_entire_file(directory.join(&ini.index_dat_filename))
            .map_err(|_| MrxsError::MissingFile(ini.index_dat_filename.clone()))?;
        let mut stream = MemStream::new(index_bytes);
        let header = index::read_index_header(&mut stream)?;

        let mut levels: Vec<MrxsLevel> = (0..level_count)
            .map(|k| {
                let info = &ini.zoom_levels[k];
                let width_in_tiles = ini.base_width_in_tiles.div_ceil(1 << k);
                let height_in_tiles = ini.base_height_in_tiles.div_ceil(1 << k);
                MrxsLevel {
                    tile_width: info.tile_width,
                    tile_height: info.tile_height,
                    width_in_tiles,
                    height_in_tiles,
                    um_per_pixel_x: info.um_per_pixel_x,
                    um_per_pixel_y: info.um_per_pixel_y,
                    fill_color_bgr: info.fill_color_bgr,
                    format: info.format,
                    tiles: vec![None; (width_in_tiles * height_in_tiles) as usize],
                }
            })
            .collect();

        if header.hier_root == 0 || header.hier_root as usize >= stream.len() {
            return Err(MrxsError::InvalidIndex(format!(
                "hier root {} out of bounds",
                header.hier_root
            )));
        }

        // One record per HIER_i_VAL_j combination, flat, in declaration
        // order.
        let base_width_in_tiles = ini.base_width_in_tiles;
        let mut record_index = 0usize;
        for hier in &ini.hier_layers {
            for value in &hier.values {
                if hier.name == HierName::SlideZoomLevel {
                    if let Some(scale) = value.zoom_level_index {
                        if scale < levels.len() {
                            index::seek_to_record(&mut stream, header.hier_root, record_index)?;
                            let level = &mut levels[scale];
                            index::walk_zoom_level_pages(&mut stream, |entry| {
                                let tile_x = (entry.image % base_width_in_tiles) >> scale;
                                let tile_y = (entry.image / base_width_in_tiles) >> scale;
                                if tile_x < level.width_in_tiles && tile_y < level.height_in_tiles
                                {
                                    let index =
                                        (tile_y * level.width_in_tiles + tile_x) as usize;
                                    level.tiles[index] = Some(entry);
                                }
                            })?;
                        }
                    }
                }
                record_index += 1;
            }
        }

        // Non-hier records: only the stitching intensity entry matters.
        let mut stitching_entry: Option<NonHierEntry> = None;
        if header.nonhier_root != 0 && (header.nonhier_root as usize) < stream.len() {
            let mut record_index = 0usize;
            for nonhier in &ini.nonhier_layers {
                for value in &nonhier.values {
                    if value.is_stitching_intensity_level {
                        index::seek_to_record(&mut stream, header.nonhier_root, record_index)?;
                        stitching_entry = index::read_first_nonhier_entry(&mut stream)?;
                    }
                    record_index += 1;
                }
            }
        }

        // Phase 3: data files.
        let mut dat_files = Vec::with_capacity(ini.dat_filenames.len());
        for name in &ini.dat_filenames {
            let file = SharedFile::open(directory.join(name))
                .map_err(|_| MrxsError::MissingFile(name.clone()))?;
            dat_files.push(Arc::new(file));
        }

        let base = &ini.zoom_levels[0];
        let is_mpp_known = base.um_per_pixel_x > 0.0 && base.um_per_pixel_y > 0.0;
        let mut mrxs = Self {
            directory,
            slide_id: header.slide_id,
            index_version: header.version,
            base_width_in_tiles: ini.base_width_in_tiles,
            base_height_in_tiles: ini.base_height_in_tiles,
            tile_width: base.tile_width,
            tile_height: base.tile_height,
            mpp_x: if is_mpp_known { base.um_per_pixel_x } else { 1.0 },
            mpp_y: if is_mpp_known { base.um_per_pixel_y } else { 1.0 },
            is_mpp_known,
            camera_image_divisions_per_side: ini.camera_image_divisions_per_side,
            levels,
            slide_positions: Vec::new(),
            dat_files,
        };

        // Slide positions are an aid, not a requirement: failure to load
        // them never fails the open.
        if let Some(entry) = stitching_entry {
            match mrxs.load_slide_positions(entry) {
                Ok(positions) => {
                    debug!(count = positions.len(), "loaded camera slide positions");
                    mrxs.slide_positions = positions;
                }
                Err(e) => warn!(error = %e, "failed to load slide position record"),
            }
        }

        Ok(mrxs)
    }

    fn load_slide_positions(
        &self,
        entry: NonHierEntry,
    ) -> Result<Vec<SlidePosition>, MrxsError> {
        if entry.length == 0 {
            return Ok(Vec::new());
        }
        let file = self
            .dat_files
            .get(entry.file as usize)
            .ok_or_else(|| MrxsError::InvalidIndex(format!("data file {} out of range", entry.file)))?;
        let compressed = file.read_at(entry.offset as u64, entry.length as usize)?;
        index::parse_slide_positions(&compressed)
    }

    /// Number of pyramid levels.
    #[inline]
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Decode one tile into `dest` (BGRA, tile extent of the level).
    ///
    /// Returns `Ok(false)` for tiles with no index entry (background).
    pub fn decode_tile(
        &self,
        level_index: usize,
        tile_index: usize,
        dest: &mut [u8],
        scratch: &mut Arena,
    ) -> Result<bool, SlideError> {
        let level = &self.levels[level_index];
        let entry = match level.tiles.get(tile_index).copied().flatten() {
            Some(entry) if entry.length > 0 => entry,
            _ => return Ok(false),
        };
        let file = self.dat_files.get(entry.file as usize).ok_or_else(|| {
            SlideError::Parse {
                backend: "mrxs",
                detail: format!("tile references data file {} of {}", entry.file, self.dat_files.len()),
            }
        })?;

        let scope = scratch.begin_scope();
        let compressed_slice = scratch.alloc(entry.length as usize, 16);
        let read = file.read_into(scratch.get_mut(compressed_slice), entry.offset as u64);
        let result = match read {
            Err(e) => Err(SlideError::Io(e)),
            Ok(()) => decode_image_to_bgra(
                scratch.get(compressed_slice),
                level.format,
                level.tile_width,
                level.tile_height,
                dest,
            )
            .map(|_| true),
        };
        scratch.end_scope(scope);
        result
    }
}

/// Decode a compressed MRXS image (tile or associated raster) to BGRA.
pub fn decode_image_to_bgra(
    data: &[u8],
    format: MrxsImageFormat,
    expected_width: u32,
    expected_height: u32,
    dest: &mut [u8],
) -> Result<(), SlideError> {
    match format {
        MrxsImageFormat::Jpeg => {
            jpeg::decode_jpeg_to_bgra(data, expected_width, expected_height, dest)
        }
        MrxsImageFormat::Png | MrxsImageFormat::Bmp => {
            let format = if format == MrxsImageFormat::Png {
                image::ImageFormat::Png
            } else {
                image::ImageFormat::Bmp
            };
            let decoded = image::load_from_memory_with_format(data, format).map_err(|e| {
                SlideError::DecodeFailed {
                    backend: "mrxs",
                    detail: e.to_string(),
                }
            })?;
            if decoded.width() != expected_width || decoded.height() != expected_height {
                return Err(SlideError::DecodeFailed {
                    backend: "mrxs",
                    detail: format!(
                        "unexpected tile size: expected {}x{}, got {}x{}",
                        expected_width,
                        expected_height,
                        decoded.width(),
                        decoded.height()
                    ),
                });
            }
            let rgba = decoded.to_rgba8();
            for (src, dst) in rgba
                .as_raw()
                .chunks_exact(4)
                .zip(dest.chunks_exact_mut(4))
            {
                dst[0] = src[2];
                dst[1] = src[1];
                dst[2] = src[0];
                dst[3] = src[3];
            }
            Ok(())
        }
        MrxsImageFormat::Unknown => Err(SlideError::Mrxs(MrxsError::UnsupportedImageFormat(
            "unknown IMAGE_FORMAT".to_string(),
        ))),
    }
}
