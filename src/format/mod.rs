//! Container readers.
//!
//! Every backend here turns a file (or directory) in a vendor container
//! format into the same backend-agnostic pyramid model consumed by the
//! tile loader. TIFF and MRXS carry the full read path; DICOM defers its
//! frame index to a background task; simple rasters wrap a decoded image
//! as a one-tile pyramid; iSyntax is recognized but needs the vendor SDK;
//! OpenSlide is an optional native shim.

pub mod dicom;
pub mod isyntax;
pub mod jpeg;
pub mod mrxs;
pub mod openslide;
pub mod simple;
pub mod tiff;

use std::path::Path;

use crate::error::SlideError;

/// Which container backend serves an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Tiff,
    Mrxs,
    Isyntax,
    Dicom,
    OpenSlide,
    Simple,
}

impl BackendKind {
    /// Human-readable backend name (for logs and errors).
    pub const fn name(&self) -> &'static str {
        match self {
            BackendKind::Tiff => "tiff",
            BackendKind::Mrxs => "mrxs",
            BackendKind::Isyntax => "isyntax",
            BackendKind::Dicom => "dicom",
            BackendKind::OpenSlide => "openslide",
            BackendKind::Simple => "simple",
        }
    }
}

/// Sniff the backend for a path from its shape and leading bytes.
pub fn detect_format(path: impl AsRef<Path>) -> Result<BackendKind, SlideError> {
    let path = path.as_ref();

    // MRXS slides are directories (or a .mrxs marker next to one).
    if path.is_dir() {
        if path.join("Slidedat.ini").is_file() {
            return Ok(BackendKind::Mrxs);
        }
        return Err(SlideError::UnsupportedFormat {
            reason: format!("directory without Slidedat.ini: {}", path.display()),
        });
    }
    if path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("mrxs"))
    {
        return Ok(BackendKind::Mrxs);
    }

    let file = crate::io::SharedFile::open(path).map_err(SlideError::Io)?;
    let len = (file.size() as usize).min(256);
    let header = file.read_at(0, len).map_err(SlideError::Io)?;

    if is_tiff_header(&header) {
        return Ok(BackendKind::Tiff);
    }
    if dicom::DicomFile::detect(&header) {
        return Ok(BackendKind::Dicom);
    }
    if isyntax::detect(&header) {
        return Ok(BackendKind::Isyntax);
    }
    if image::guess_format(&header).is_ok() {
        return Ok(BackendKind::Simple);
    }
    Err(SlideError::UnsupportedFormat {
        reason: format!("unrecognized container: {}", path.display()),
    })
}

/// Quick check for the TIFF/BigTIFF magic without a full header parse.
pub fn is_tiff_header(bytes: &[u8]) -> bool {
    if bytes.len() < 4 {
        return false;
    }
    let (le, be) = (bytes[0] == b'I' && bytes[1] == b'I', bytes[0] == b'M' && bytes[1] == b'M');
    if !le && !be {
        return false;
    }
    let version = if le {
        u16::from_le_bytes([bytes[2], bytes[3]])
    } else {
        u16::from_be_bytes([bytes[2], bytes[3]])
    };
    version == 42 || version == 43
}
