//! Simple raster backend.
//!
//! Wraps an ordinary PNG/JPEG/BMP image as a one-level, one-tile pyramid
//! so small images travel through the same tile pipeline as real slides.
//! The raster is decoded to BGRA once at open time; "decoding" a tile is
//! a copy.

use std::path::Path;

use crate::error::SlideError;

/// An opened plain raster image.
pub struct SimpleImage {
    pub width: u32,
    pub height: u32,
    /// BGRA pixels, decoded eagerly.
    pixels: Vec<u8>,
}

impl SimpleImage {
    /// Open and fully decode a raster image. The format is sniffed from
    /// the content, not the extension.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SlideError> {
        let bytes = std::fs::read(path.as_ref())
            .map_err(|e| SlideError::Io(crate::error::IoError::Io(e.kind())))?;
        let decoded =
            image::load_from_memory(&bytes).map_err(|e| SlideError::UnsupportedFormat {
                reason: format!("not a decodable raster image: {}", e),
            })?;
        let (width, height) = (decoded.width(), decoded.height());
        let rgba = decoded.to_rgba8();
        let mut pixels = vec![0u8; width as usize * height as usize * 4];
        for (src, dst) in rgba.as_raw().chunks_exact(4).zip(pixels.chunks_exact_mut(4)) {
            dst[0] = src[2];
            dst[1] = src[1];
            dst[2] = src[0];
            dst[3] = src[3];
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Copy the raster into a tile buffer sized `width * height * 4`.
    pub fn copy_pixels(&self, dest: &mut [u8]) {
        dest.copy_from_slice(&self.pixels);
    }
}
