//! Optional OpenSlide vendor shim.
//!
//! Formats whose vendor containers are opaque can be served through the
//! native OpenSlide library when it is installed. The API surface is a
//! trait with one method per entry point; a loader probes the usual
//! library names and yields `None` when none is present. Absence must
//! never affect the other backends.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::error::SlideError;

/// The OpenSlide entry points the engine consumes.
///
/// Mirrors the C API: an opaque slide handle, pyramid geometry queries,
/// and a BGRA region read.
pub trait OpenSlideApi: Send + Sync {
    /// Detect the vendor of a slide file; `None` when unrecognized.
    fn detect_vendor(&self, path: &Path) -> Option<String>;

    /// Open a slide, returning an opaque handle id.
    fn open(&self, path: &Path) -> Result<u64, SlideError>;

    /// Number of pyramid levels.
    fn level_count(&self, handle: u64) -> u32;

    /// Pixel dimensions of one level.
    fn level_dimensions(&self, handle: u64, level: u32) -> (u64, u64);

    /// Value of a named property (e.g. `openslide.mpp-x`).
    fn property(&self, handle: u64, name: &str) -> Option<String>;

    /// Read a BGRA region at the given level into `dest`.
    fn read_region(
        &self,
        handle: u64,
        dest: &mut [u8],
        x: i64,
        y: i64,
        level: u32,
        width: u32,
        height: u32,
    ) -> Result<(), SlideError>;

    /// Close a slide handle.
    fn close(&self, handle: u64);
}

/// Library names probed, most specific first.
const LIBRARY_NAMES: &[&str] = &[
    "libopenslide.so.1",
    "libopenslide.so.0",
    "libopenslide.1.dylib",
    "libopenslide-1.dll",
    "libopenslide-0.dll",
];

/// Directories searched for the native library.
#[cfg(unix)]
const LIBRARY_DIRS: &[&str] = &["/usr/lib", "/usr/local/lib", "/usr/lib/x86_64-linux-gnu"];

#[cfg(windows)]
const LIBRARY_DIRS: &[&str] = &["C:\\Windows\\System32"];

/// Locate the native OpenSlide library on this machine, if any.
pub fn find_native_library() -> Option<PathBuf> {
    for dir in LIBRARY_DIRS {
        for name in LIBRARY_NAMES {
            let candidate = Path::new(dir).join(name);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Try to load the OpenSlide shim.
///
/// Returns `None` when the native library is not installed; binding the
/// located library is left to an embedder-supplied implementation of
/// [`OpenSlideApi`] registered through the engine.
pub fn load() -> Option<Arc<dyn OpenSlideApi>> {
    match find_native_library() {
        Some(path) => {
            debug!(path = %path.display(), "native OpenSlide library present but no binding registered");
            None
        }
        None => {
            debug!("no native OpenSlide library found");
            None
        }
    }
}
