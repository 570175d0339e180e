//! Opening slides: backend dispatch and pyramid construction.
//!
//! Each backend's container reader produces its own native structures;
//! the builders here translate those into the shared Image → Level → Tile
//! model. Missing downsample steps become placeholder levels
//! (`exists == false`) so the level array is always dense in powers of
//! two.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::SlideError;
use crate::format::mrxs::MrxsFile;
use crate::format::simple::SimpleImage;
use crate::format::tiff::TiffFile;
use crate::format::{dicom::DicomFile, detect_format, isyntax, BackendKind};
use crate::memory::Arena;
use crate::slide::image::{
    AssociatedImage, Image, ImageState, Level, TileDecoder,
};

/// Open a slide, dispatching on the detected container format.
///
/// `parent` is set when the slide is being opened as an overlay; the
/// overlay inherits the parent's microns-per-pixel so differing source
/// tags cannot mis-register the two images.
pub fn open_image(
    path: impl AsRef<Path>,
    is_overlay: bool,
    parent: Option<&Image>,
) -> Result<Image, SlideError> {
    let path = path.as_ref();
    let backend = detect_format(path)?;
    info!(backend = backend.name(), path = %path.display(), "opening slide");

    let mut image = match backend {
        BackendKind::Tiff => from_tiff(TiffFile::open(path)?, is_overlay)?,
        BackendKind::Mrxs => from_mrxs(MrxsFile::open(path)?, is_overlay)?,
        BackendKind::Dicom => from_dicom(DicomFile::open(path)?, is_overlay)?,
        BackendKind::Simple => from_simple(SimpleImage::open(path)?, is_overlay)?,
        BackendKind::Isyntax => return Err(isyntax::open(path)),
        BackendKind::OpenSlide => {
            return Err(SlideError::UnsupportedFormat {
                reason: "no OpenSlide binding registered".to_string(),
            })
        }
    };

    if let Some(parent) = parent {
        let (mpp_x, mpp_y, known) = parent.mpp();
        if known {
            image.change_resolution(mpp_x, mpp_y);
        }
    }
    Ok(image)
}

// =============================================================================
// TIFF
// =============================================================================

struct TiffDecoder {
    file: TiffFile,
    /// Resolution corrections recorded through `change_resolution`.
    corrected_mpp: parking_lot::Mutex<Option<(f64, f64)>>,
}

impl TileDecoder for TiffDecoder {
    fn backend(&self) -> BackendKind {
        BackendKind::Tiff
    }

    fn decode_tile(
        &self,
        backing_index: usize,
        tile_index: u32,
        dest: &mut [u8],
        scratch: &mut Arena,
    ) -> Result<bool, SlideError> {
        self.file
            .decode_tile(backing_index, tile_index as usize, dest, scratch)
    }

    fn rescale_mpp(&self, mpp_x: f64, mpp_y: f64) {
        *self.corrected_mpp.lock() = Some((mpp_x, mpp_y));
    }
}

fn from_tiff(tiff: TiffFile, is_overlay: bool) -> Result<Image, SlideError> {
    let validation = crate::format::tiff::validate_pyramid(&tiff);
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    validation.into_result().map_err(SlideError::Tiff)?;

    let main = &tiff.ifds[tiff.main_image_index];
    let (width, height) = (main.image_width, main.image_height);
    let (tile_width, tile_height) = (main.tile_width.max(1), main.tile_height.max(1));
    let (mpp_x, mpp_y, is_mpp_known) = (tiff.mpp_x, tiff.mpp_y, tiff.is_mpp_known);

    let level_count = (tiff.max_downsample_level + 1) as usize;
    let mut levels = Vec::with_capacity(level_count);
    for wanted in 0..level_count as i32 {
        let backing = tiff
            .level_ifds()
            .find(|ifd| ifd.downsample_level == wanted);
        match backing {
            Some(ifd) => {
                let mut level = Level {
                    exists: true,
                    backing_index: ifd.index,
                    width_in_pixels: ifd.image_width,
                    height_in_pixels: ifd.image_height,
                    width_in_tiles: ifd.width_in_tiles,
                    height_in_tiles: ifd.height_in_tiles,
                    tile_width: ifd.tile_width,
                    tile_height: ifd.tile_height,
                    downsample_factor: ifd.downsample_factor,
                    um_per_pixel_x: ifd.um_per_pixel_x,
                    um_per_pixel_y: ifd.um_per_pixel_y,
                    x_tile_side_in_um: ifd.x_tile_side_in_um,
                    y_tile_side_in_um: ifd.y_tile_side_in_um,
                    ..Level::default()
                };
                if ifd.tile_width != tile_width || ifd.tile_height != tile_height {
                    warn!(
                        level = wanted,
                        tile_width = ifd.tile_width,
                        tile_height = ifd.tile_height,
                        "level tile size differs from base level"
                    );
                }
                level.allocate_tiles();
                // Empty tiles are known from the byte counts up front.
                // Strip-organized images are a single pseudo-tile backed
                // by their first strip.
                for (i, tile) in level.tiles.iter_mut().enumerate() {
                    let (offset, byte_count) = if ifd.is_tiled {
                        (
                            ifd.tile_offsets.get(i).copied().unwrap_or(0),
                            ifd.tile_byte_counts.get(i).copied().unwrap_or(0),
                        )
                    } else {
                        (
                            ifd.strip_offsets.first().copied().unwrap_or(0),
                            ifd.strip_byte_counts.first().copied().unwrap_or(0),
                        )
                    };
                    if byte_count == 0 || offset == 0 {
                        tile.is_empty = true;
                    }
                }
                levels.push(level);
            }
            None => levels.push(placeholder_level(
                wanted,
                tile_width,
                tile_height,
                mpp_x,
                mpp_y,
            )),
        }
    }

    let macro_image = tiff
        .macro_image_index
        .and_then(|i| tiff.decode_associated_image(i))
        .map(|(width, height, pixels)| AssociatedImage {
            width,
            height,
            pixels,
        });
    let label_image = tiff
        .label_image_index
        .and_then(|i| tiff.decode_associated_image(i))
        .map(|(width, height, pixels)| AssociatedImage {
            width,
            height,
            pixels,
        });

    let state = ImageState {
        levels,
        mpp_x,
        mpp_y,
        is_mpp_known,
        width_in_um: width as f32 * mpp_x,
        height_in_um: height as f32 * mpp_y,
    };
    Ok(Image::new(
        BackendKind::Tiff,
        width,
        height,
        tile_width,
        tile_height,
        is_overlay,
        macro_image,
        label_image,
        state,
        Box::new(TiffDecoder {
            file: tiff,
            corrected_mpp: parking_lot::Mutex::new(None),
        }),
    ))
}

// =============================================================================
// MRXS
// =============================================================================

struct MrxsDecoder {
    file: MrxsFile,
}

impl TileDecoder for MrxsDecoder {
    fn backend(&self) -> BackendKind {
        BackendKind::Mrxs
    }

    fn decode_tile(
        &self,
        backing_index: usize,
        tile_index: u32,
        dest: &mut [u8],
        scratch: &mut Arena,
    ) -> Result<bool, SlideError> {
        self.file
            .decode_tile(backing_index, tile_index as usize, dest, scratch)
    }
}

fn from_mrxs(mrxs: MrxsFile, is_overlay: bool) -> Result<Image, SlideError> {
    let base = &mrxs.levels[0];
    let (width, height) = (base.width_in_pixels(), base.height_in_pixels());
    let (tile_width, tile_height) = (base.tile_width, base.tile_height);
    let (mpp_x, mpp_y, is_mpp_known) = (mrxs.mpp_x as f32, mrxs.mpp_y as f32, mrxs.is_mpp_known);

    let mut levels = Vec::with_capacity(mrxs.level_count());
    for (k, native) in mrxs.levels.iter().enumerate() {
        let mut level = Level {
            exists: true,
            backing_index: k,
            width_in_pixels: native.width_in_pixels(),
            height_in_pixels: native.height_in_pixels(),
            width_in_tiles: native.width_in_tiles,
            height_in_tiles: native.height_in_tiles,
            tile_width: native.tile_width,
            tile_height: native.tile_height,
            downsample_factor: (k as f32).exp2(),
            um_per_pixel_x: native.um_per_pixel_x as f32,
            um_per_pixel_y: native.um_per_pixel_y as f32,
            x_tile_side_in_um: (native.um_per_pixel_x * native.tile_width as f64) as f32,
            y_tile_side_in_um: (native.um_per_pixel_y * native.tile_height as f64) as f32,
            ..Level::default()
        };
        level.allocate_tiles();
        for (i, tile) in level.tiles.iter_mut().enumerate() {
            if native.tiles[i].is_none() {
                tile.is_empty = true;
            }
        }
        levels.push(level);
    }

    let state = ImageState {
        levels,
        mpp_x,
        mpp_y,
        is_mpp_known,
        width_in_um: width as f32 * mpp_x,
        height_in_um: height as f32 * mpp_y,
    };
    Ok(Image::new(
        BackendKind::Mrxs,
        width,
        height,
        tile_width,
        tile_height,
        is_overlay,
        None,
        None,
        state,
        Box::new(MrxsDecoder { file: mrxs }),
    ))
}

// =============================================================================
// DICOM
// =============================================================================

struct DicomDecoder {
    file: Arc<DicomFile>,
}

impl TileDecoder for DicomDecoder {
    fn backend(&self) -> BackendKind {
        BackendKind::Dicom
    }

    fn decode_tile(
        &self,
        _backing_index: usize,
        tile_index: u32,
        dest: &mut [u8],
        scratch: &mut Arena,
    ) -> Result<bool, SlideError> {
        if !self.file.is_indexed() {
            return Err(SlideError::DecodeFailed {
                backend: "dicom",
                detail: "pixel data has not been indexed yet".to_string(),
            });
        }
        self.file.decode_frame(tile_index as usize, dest, scratch)
    }

    fn index_level(&self, _backing_index: usize) -> Result<(), SlideError> {
        self.file.index_pixel_data().map_err(SlideError::Dicom)
    }
}

fn from_dicom(dicom: DicomFile, is_overlay: bool) -> Result<Image, SlideError> {
    let dicom = Arc::new(dicom);
    let (tile_width, tile_height) = (dicom.tile_width, dicom.tile_height);
    let (width, height) = (dicom.matrix_width, dicom.matrix_height);

    let mut level = Level {
        exists: true,
        backing_index: 0,
        width_in_pixels: width,
        height_in_pixels: height,
        width_in_tiles: width.div_ceil(tile_width),
        height_in_tiles: height.div_ceil(tile_height),
        tile_width,
        tile_height,
        downsample_factor: 1.0,
        // The per-frame offset table requires a full item walk, deferred
        // to a background task.
        needs_indexing: !dicom.is_indexed(),
        ..Level::default()
    };
    level.allocate_tiles();

    let state = ImageState {
        levels: vec![level],
        mpp_x: 1.0,
        mpp_y: 1.0,
        is_mpp_known: false,
        width_in_um: width as f32,
        height_in_um: height as f32,
    };
    Ok(Image::new(
        BackendKind::Dicom,
        width,
        height,
        tile_width,
        tile_height,
        is_overlay,
        None,
        None,
        state,
        Box::new(DicomDecoder { file: dicom }),
    ))
}

// =============================================================================
// Simple rasters
// =============================================================================

struct SimpleDecoder {
    image: SimpleImage,
}

impl TileDecoder for SimpleDecoder {
    fn backend(&self) -> BackendKind {
        BackendKind::Simple
    }

    fn decode_tile(
        &self,
        _backing_index: usize,
        _tile_index: u32,
        dest: &mut [u8],
        _scratch: &mut Arena,
    ) -> Result<bool, SlideError> {
        self.image.copy_pixels(dest);
        Ok(true)
    }
}

fn from_simple(simple: SimpleImage, is_overlay: bool) -> Result<Image, SlideError> {
    let (width, height) = (simple.width, simple.height);
    let mut level = Level {
        exists: true,
        backing_index: 0,
        width_in_pixels: width,
        height_in_pixels: height,
        width_in_tiles: 1,
        height_in_tiles: 1,
        tile_width: width,
        tile_height: height,
        downsample_factor: 1.0,
        ..Level::default()
    };
    level.allocate_tiles();

    let state = ImageState {
        levels: vec![level],
        mpp_x: 1.0,
        mpp_y: 1.0,
        is_mpp_known: false,
        width_in_um: width as f32,
        height_in_um: height as f32,
    };
    Ok(Image::new(
        BackendKind::Simple,
        width,
        height,
        width,
        height,
        is_overlay,
        None,
        None,
        state,
        Box::new(SimpleDecoder { image: simple }),
    ))
}

// =============================================================================
// Placeholders
// =============================================================================

/// A level synthesized for a downsample step with no container backing.
fn placeholder_level(
    wanted_level: i32,
    tile_width: u32,
    tile_height: u32,
    mpp_x: f32,
    mpp_y: f32,
) -> Level {
    let factor = (wanted_level as f32).exp2();
    Level {
        exists: false,
        tile_width,
        tile_height,
        downsample_factor: factor,
        um_per_pixel_x: mpp_x * factor,
        um_per_pixel_y: mpp_y * factor,
        x_tile_side_in_um: mpp_x * factor * tile_width as f32,
        y_tile_side_in_um: mpp_y * factor * tile_height as f32,
        ..Level::default()
    }
}
