//! Shared file handles for concurrent positional reads.
//!
//! Worker threads decode tiles in parallel against the same slide file, so
//! the handle must support `read_at` without a shared cursor. On unix this
//! maps to `pread`; on Windows to `seek_read`. Handles are read-only after
//! open and therefore safe to share freely.

use std::fs::File;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::IoError;

/// A read-only file handle usable from any thread.
///
/// All reads are byte-accurate: if the platform primitive returns fewer
/// bytes than requested mid-file, the read is retried at the advanced
/// offset until the request is satisfied or EOF is hit.
pub struct SharedFile {
    file: File,
    size: u64,
    path: PathBuf,
}

impl SharedFile {
    /// Open a file for shared positional access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IoError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => IoError::NotFound(path.display().to_string()),
            kind => IoError::Io(kind),
        })?;
        let size = file.metadata()?.len();
        Ok(Self { file, size, path })
    }

    /// Total size of the file in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The path this handle was opened from (for logging).
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read exactly `dest.len()` bytes starting at `offset`.
    pub fn read_into(&self, dest: &mut [u8], offset: u64) -> Result<(), IoError> {
        let mut filled = 0usize;
        while filled < dest.len() {
            let n = self.read_at_raw(&mut dest[filled..], offset + filled as u64)?;
            if n == 0 {
                return Err(IoError::ShortRead {
                    offset,
                    requested: dest.len() as u64,
                    actual: filled as u64,
                });
            }
            filled += n;
        }
        Ok(())
    }

    /// Read exactly `len` bytes starting at `offset` into a fresh buffer.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        if offset.saturating_add(len as u64) > self.size {
            return Err(IoError::RangeOutOfBounds {
                offset,
                requested: len as u64,
                size: self.size,
            });
        }
        let mut buf = vec![0u8; len];
        self.read_into(&mut buf, offset)?;
        Ok(Bytes::from(buf))
    }

    #[cfg(unix)]
    fn read_at_raw(&self, dest: &mut [u8], offset: u64) -> Result<usize, IoError> {
        use std::os::unix::fs::FileExt;
        Ok(self.file.read_at(dest, offset)?)
    }

    #[cfg(windows)]
    fn read_at_raw(&self, dest: &mut [u8], offset: u64) -> Result<usize, IoError> {
        use std::os::windows::fs::FileExt;
        Ok(self.file.seek_read(dest, offset)?)
    }
}
