use thiserror::Error;

/// I/O errors from the byte substrate (local files and remote chunk fetches).
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// Error from the underlying read/write primitive
    #[error("I/O error: {0:?}")]
    Io(std::io::ErrorKind),

    /// Fewer bytes than requested were returned
    #[error("Short read at offset {offset}: requested {requested} bytes, got {actual}")]
    ShortRead {
        offset: u64,
        requested: u64,
        actual: u64,
    },

    /// Requested range exceeds resource bounds
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// File or resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Remote response was not framed as expected (missing CRLFCRLF, truncated body)
    #[error("Malformed remote response: {0}")]
    MalformedResponse(String),
}

impl From<std::io::Error> for IoError {
    fn from(e: std::io::Error) -> Self {
        IoError::Io(e.kind())
    }
}

/// Errors that can occur when parsing TIFF and BigTIFF files.
#[derive(Debug, Clone, Error)]
pub enum TiffError {
    /// I/O error while reading the file
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Invalid TIFF magic bytes (not II or MM)
    #[error("Invalid TIFF magic bytes: expected 0x4949 (II) or 0x4D4D (MM), got 0x{0:04X}")]
    InvalidMagic(u16),

    /// Invalid TIFF version number
    #[error("Invalid TIFF version: expected 42 (TIFF) or 43 (BigTIFF), got {0}")]
    InvalidVersion(u16),

    /// Invalid BigTIFF offset byte size (must be 8)
    #[error("Invalid BigTIFF offset byte size: expected 8, got {0}")]
    InvalidBigTiffOffsetSize(u16),

    /// File is too small to contain a valid TIFF header
    #[error("File too small: need at least {required} bytes, got {actual}")]
    FileTooSmall { required: u64, actual: u64 },

    /// Invalid IFD offset (points outside the file)
    #[error("Invalid IFD offset: {0}")]
    InvalidIfdOffset(u64),

    /// Required tag is missing from an IFD
    #[error("Missing required tag: {0}")]
    MissingTag(&'static str),

    /// Tag has unexpected type or count
    #[error("Invalid tag value for {tag}: {message}")]
    InvalidTagValue { tag: &'static str, message: String },

    /// TileByteCounts count does not match TileOffsets count
    #[error("Tile count mismatch: TileOffsets has {offsets}, TileByteCounts has {byte_counts}")]
    TileCountMismatch { offsets: u64, byte_counts: u64 },

    /// Unsupported compression scheme for tile decoding
    #[error("Unsupported compression: {0}")]
    UnsupportedCompression(u16),

    /// LZW stream is corrupt or truncated
    #[error("LZW decode error: {0}")]
    Lzw(String),

    /// Unsupported predictor operator
    #[error("Unsupported predictor: {0}")]
    UnsupportedPredictor(u16),
}

/// Errors that can occur when parsing an MRXS slide directory.
#[derive(Debug, Clone, Error)]
pub enum MrxsError {
    /// I/O error while reading a file from the slide directory
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// A required file is missing from the slide directory
    #[error("Missing file in slide directory: {0}")]
    MissingFile(String),

    /// Slidedat.ini lacks a required section or key
    #[error("Slidedat.ini is missing {0}")]
    MissingKey(&'static str),

    /// Index.dat is truncated or structurally invalid
    #[error("Invalid Index.dat: {0}")]
    InvalidIndex(String),

    /// Unrecognized per-level image format
    #[error("Unsupported tile image format: {0}")]
    UnsupportedImageFormat(String),
}

/// Errors that can occur when parsing a DICOM-WSI instance.
#[derive(Debug, Clone, Error)]
pub enum DicomError {
    /// I/O error while reading the file
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// File lacks the DICM preamble magic
    #[error("Not a DICOM file")]
    NotDicom,

    /// Dataset is structurally invalid or lacks required elements
    #[error("DICOM parse error: {0}")]
    Parse(String),
}

/// Top-level error type for the slide access engine.
///
/// Open-path failures are fatal to the image being opened. Tile decode
/// failures stay local to one tile (the tile transitions to failed and the
/// region reader paints its area white); they surface here only through the
/// decoder return value, never as a panic.
#[derive(Debug, Clone, Error)]
pub enum SlideError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// TIFF parsing error
    #[error("TIFF error: {0}")]
    Tiff(#[from] TiffError),

    /// MRXS parsing error
    #[error("MRXS error: {0}")]
    Mrxs(#[from] MrxsError),

    /// DICOM parsing error
    #[error("DICOM error: {0}")]
    Dicom(#[from] DicomError),

    /// Container-level parse failure not covered by a backend error
    #[error("Parse error in {backend} backend: {detail}")]
    Parse { backend: &'static str, detail: String },

    /// File format is not recognized or not supported
    #[error("Unsupported format: {reason}")]
    UnsupportedFormat { reason: String },

    /// The block allocator reached its configured cap
    #[error("Out of tile buffer memory")]
    OutOfMemory,

    /// A tile stream failed to decode
    #[error("Decode failed in {backend} backend: {detail}")]
    DecodeFailed { backend: &'static str, detail: String },

    /// The requested pixel format conversion is not implemented
    #[error("Unsupported pixel format conversion: {from} to {to}")]
    UnsupportedConversion {
        from: &'static str,
        to: &'static str,
    },

    /// The operation was cancelled because the image is being destroyed
    #[error("Cancelled")]
    Cancelled,
}
