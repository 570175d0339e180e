//! TIFF pyramid validation.
//!
//! An opened file can be structurally valid TIFF and still be a poor
//! slide: no tiled levels, tile arrays of mismatched length, compressions
//! the decode path cannot serve, or a pyramid whose levels do not shrink.
//! Validation separates the fatal problems (the image cannot be served at
//! all) from warnings (it can, with caveats worth logging).

use crate::error::TiffError;

use super::ifd::{Ifd, SubimageKind};
use super::tags::Compression;
use super::TiffFile;

// =============================================================================
// Validation Result
// =============================================================================

/// Outcome of validating a slide TIFF.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// Whether the file can be served as a slide
    pub is_valid: bool,

    /// Fatal problems (empty if valid)
    pub errors: Vec<ValidationError>,

    /// Non-fatal issues worth surfacing in logs
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn ok() -> Self {
        ValidationResult {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn add_error(&mut self, error: ValidationError) {
        self.is_valid = false;
        self.errors.push(error);
    }

    fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    /// Convert to a `TiffError`, taking the first error when invalid.
    pub fn into_result(self) -> Result<(), TiffError> {
        match self.errors.into_iter().next() {
            None => Ok(()),
            Some(error) => Err(error.into()),
        }
    }
}

/// A specific fatal validation finding.
#[derive(Debug, Clone)]
pub enum ValidationError {
    /// No IFD qualifies as a pyramid level
    NoPyramidLevels,

    /// A level IFD lacks its tile location tags
    MissingTileTags { ifd_index: usize },

    /// TileOffsets and TileByteCounts disagree in length
    TileCountMismatch {
        ifd_index: usize,
        offsets: usize,
        byte_counts: usize,
    },

    /// A level's declared tile grid does not cover its extent
    InvalidTileGrid {
        ifd_index: usize,
        expected_tiles: usize,
        actual_tiles: usize,
    },
}

impl From<ValidationError> for TiffError {
    fn from(error: ValidationError) -> Self {
        match error {
            ValidationError::NoPyramidLevels => TiffError::MissingTag("a tiled pyramid level"),
            ValidationError::MissingTileTags { .. } => TiffError::MissingTag("TileOffsets"),
            ValidationError::TileCountMismatch {
                offsets,
                byte_counts,
                ..
            } => TiffError::TileCountMismatch {
                offsets: offsets as u64,
                byte_counts: byte_counts as u64,
            },
            ValidationError::InvalidTileGrid {
                expected_tiles,
                actual_tiles,
                ..
            } => TiffError::InvalidTagValue {
                tag: "TileOffsets",
                message: format!(
                    "tile grid needs {} slots, file declares {}",
                    expected_tiles, actual_tiles
                ),
            },
        }
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Validate one level IFD.
pub fn validate_level_ifd(ifd: &Ifd, result: &mut ValidationResult) {
    if !ifd.is_tiled {
        // Strip-organized images pass through the single-pseudo-tile
        // path; only flag them when even that is impossible.
        if ifd.strip_offsets.len() != 1 {
            result.add_warning(format!(
                "IFD {}: {} strips; only single-strip images decode",
                ifd.index,
                ifd.strip_offsets.len()
            ));
        }
        return;
    }

    if ifd.tile_offsets.is_empty() {
        result.add_error(ValidationError::MissingTileTags {
            ifd_index: ifd.index,
        });
        return;
    }
    if ifd.tile_byte_counts.len() != ifd.tile_offsets.len() {
        result.add_error(ValidationError::TileCountMismatch {
            ifd_index: ifd.index,
            offsets: ifd.tile_offsets.len(),
            byte_counts: ifd.tile_byte_counts.len(),
        });
    }

    let expected = (ifd.width_in_tiles * ifd.height_in_tiles) as usize;
    if expected != ifd.tile_count() {
        result.add_error(ValidationError::InvalidTileGrid {
            ifd_index: ifd.index,
            expected_tiles: expected,
            actual_tiles: ifd.tile_count(),
        });
    }

    match Compression::from_u16(ifd.compression) {
        Some(compression) if compression.is_supported() => {}
        Some(compression) => result.add_warning(format!(
            "IFD {}: {} compression; its tiles will fail to decode",
            ifd.index,
            compression.name()
        )),
        None => result.add_warning(format!(
            "IFD {}: unknown compression {}; its tiles will fail to decode",
            ifd.index, ifd.compression
        )),
    }
}

/// Validate a whole opened file.
pub fn validate_pyramid(tiff: &TiffFile) -> ValidationResult {
    let mut result = ValidationResult::ok();

    let levels: Vec<&Ifd> = tiff
        .ifds
        .iter()
        .filter(|ifd| ifd.kind == SubimageKind::Level && ifd.width_in_tiles > 0)
        .collect();
    if levels.is_empty() {
        result.add_error(ValidationError::NoPyramidLevels);
        return result;
    }

    for ifd in &levels {
        validate_level_ifd(ifd, &mut result);
    }

    // Monotonicity: deeper levels must not grow.
    for pair in levels.windows(2) {
        if pair[1].downsample_level > pair[0].downsample_level
            && pair[1].image_width > pair[0].image_width
        {
            result.add_warning(format!(
                "IFD {}: level {} is wider than the shallower level before it",
                pair[1].index, pair[1].downsample_level
            ));
        }
    }

    let base = levels[0];
    for ifd in &levels[1..] {
        if ifd.tile_width != base.tile_width || ifd.tile_height != base.tile_height {
            result.add_warning(format!(
                "IFD {}: tile size {}x{} differs from the base level's {}x{}",
                ifd.index, ifd.tile_width, ifd.tile_height, base.tile_width, base.tile_height
            ));
        }
    }

    if !tiff.is_mpp_known {
        result.add_warning("resolution tags absent; physical scale unknown".to_string());
    }

    result
}
