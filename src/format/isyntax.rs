//! Philips iSyntax detection.
//!
//! An iSyntax file starts with an XML header (`<DataObject
//! ObjectType="DPUfsImport" ...>`) followed by proprietary wavelet-coded
//! pixel data. Recognition keeps the backend tag meaningful and the error
//! message specific; the wavelet codec itself needs the vendor toolchain
//! and is not implemented here.

use std::path::Path;

use crate::error::SlideError;
use crate::io::SharedFile;

/// How many leading bytes to inspect for the XML header.
const DETECT_WINDOW: usize = 256;

/// Whether the leading bytes look like an iSyntax XML header.
pub fn detect(header: &[u8]) -> bool {
    let window = &header[..header.len().min(DETECT_WINDOW)];
    // Tolerate a BOM or whitespace before the root element.
    let start = window
        .iter()
        .position(|&b| b == b'<')
        .unwrap_or(window.len());
    window[start..].starts_with(b"<DataObject")
}

/// "Open" an iSyntax file: verify the signature and report why it cannot
/// be served. Always produces an error; the backend exists for
/// recognition only.
pub fn open(path: impl AsRef<Path>) -> SlideError {
    let header = SharedFile::open(path.as_ref()).and_then(|file| {
        let len = (file.size() as usize).min(DETECT_WINDOW);
        file.read_at(0, len)
    });
    match header {
        Err(e) => SlideError::Io(e),
        Ok(header) if detect(&header) => SlideError::UnsupportedFormat {
            reason: "iSyntax wavelet decoding requires the vendor SDK".to_string(),
        },
        Ok(_) => SlideError::UnsupportedFormat {
            reason: "not an iSyntax file".to_string(),
        },
    }
}
