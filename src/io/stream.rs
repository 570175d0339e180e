//! Sequential streams for header and index parsing.
//!
//! Container readers open files once, walk the structure front to back, and
//! seek between linked records (TIFF IFD chains, MRXS index pages). The
//! streams here serve that pattern only; the concurrent decode path uses
//! [`super::SharedFile`] instead.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use bytes::Bytes;

use crate::error::IoError;

// =============================================================================
// FileStream
// =============================================================================

/// A seekable file stream for sequential parsing.
#[derive(Debug)]
pub struct FileStream {
    file: File,
    size: u64,
}

impl FileStream {
    /// Open a file for reading.
    pub fn open_read(path: impl AsRef<Path>) -> Result<Self, IoError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => IoError::NotFound(path.display().to_string()),
            kind => IoError::Io(kind),
        })?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }

    /// Create or truncate a file for writing.
    pub fn open_write(path: impl AsRef<Path>) -> Result<Self, IoError> {
        let file = File::create(path.as_ref())?;
        Ok(Self { file, size: 0 })
    }

    /// Total size of the file in bytes.
    #[inline]
    pub fn get_size(&self) -> u64 {
        self.size
    }

    /// Current stream position.
    pub fn get_pos(&mut self) -> Result<u64, IoError> {
        Ok(self.file.stream_position()?)
    }

    /// Seek to an absolute position.
    pub fn set_pos(&mut self, pos: u64) -> Result<(), IoError> {
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    /// Read exactly `dest.len()` bytes at the current position.
    pub fn read_exact(&mut self, dest: &mut [u8]) -> Result<(), IoError> {
        let offset = self.get_pos()?;
        self.file.read_exact(dest).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => IoError::ShortRead {
                offset,
                requested: dest.len() as u64,
                actual: 0,
            },
            kind => IoError::Io(kind),
        })
    }

    /// Write all of `src` at the current position.
    pub fn write_all(&mut self, src: &[u8]) -> Result<(), IoError> {
        self.file.write_all(src)?;
        self.size = self.size.max(self.get_pos()?);
        Ok(())
    }

    /// Read the whole remaining stream into memory.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>, IoError> {
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// Read an entire file into memory.
pub fn read_entire_file(path: impl AsRef<Path>) -> Result<Bytes, IoError> {
    let mut stream = FileStream::open_read(path)?;
    Ok(Bytes::from(stream.read_to_end()?))
}

// =============================================================================
// MemStream
// =============================================================================

/// A cursor over an in-memory buffer with the same read/seek surface as
/// [`FileStream`].
///
/// The MRXS index parser reads `Index.dat` fully into memory and then hops
/// between page chains, which this models directly.
pub struct MemStream {
    data: Bytes,
    pos: usize,
}

impl MemStream {
    /// Wrap a byte buffer.
    pub fn new(data: Bytes) -> Self {
        Self { data, pos: 0 }
    }

    /// Total size of the buffer in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current position.
    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Seek to an absolute position.
    pub fn seek(&mut self, pos: usize) -> Result<(), IoError> {
        if pos > self.data.len() {
            return Err(IoError::RangeOutOfBounds {
                offset: pos as u64,
                requested: 0,
                size: self.data.len() as u64,
            });
        }
        self.pos = pos;
        Ok(())
    }

    /// Read exactly `n` bytes, advancing the position.
    pub fn read(&mut self, n: usize) -> Result<&[u8], IoError> {
        let end = self.pos.checked_add(n).ok_or(IoError::RangeOutOfBounds {
            offset: self.pos as u64,
            requested: n as u64,
            size: self.data.len() as u64,
        })?;
        if end > self.data.len() {
            return Err(IoError::ShortRead {
                offset: self.pos as u64,
                requested: n as u64,
                actual: (self.data.len() - self.pos) as u64,
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Read a little-endian u32, advancing the position.
    pub fn read_u32_le(&mut self) -> Result<u32, IoError> {
        let bytes = self.read(4)?;
        Ok(super::read_u32_le(bytes))
    }

    /// Read a single byte, advancing the position.
    pub fn read_u8(&mut self) -> Result<u8, IoError> {
        Ok(self.read(1)?[0])
    }
}
