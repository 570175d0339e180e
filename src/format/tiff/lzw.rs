//! LZW decompression for TIFF tiles.
//!
//! Two dialects exist in the wild:
//!
//! - The TIFF 6.0 dialect: codes packed MSB-first, with the "early change"
//!   quirk where the code width grows one code earlier than strictly
//!   necessary (the width bump the standard itself bakes in).
//! - The pre-6.0 "old" dialect: codes packed LSB-first, no early change.
//!   Detectable because a valid stream then begins with a zero byte whose
//!   successor has its low bit set (the LSB-packed clear code).
//!
//! Codes are 9 to 12 bits. Code 256 clears the table, 257 ends the stream,
//! table entries start at 258.
//!
//! The horizontal predictor (Predictor = 2) lives here too: each scanline
//! stores differences, accumulated left to right per sample channel.

use crate::error::TiffError;

const CODE_CLEAR: u16 = 256;
const CODE_EOI: u16 = 257;
const CODE_FIRST: u16 = 258;
const TABLE_SIZE: usize = 4096;
const MIN_BITS: u32 = 9;
const MAX_BITS: u32 = 12;

/// Whether a compressed stream uses the old bit-reversed dialect.
#[inline]
pub fn is_old_style_lzw(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0 && (data[1] & 0x1) != 0
}

// =============================================================================
// Bit readers
// =============================================================================

struct MsbReader<'a> {
    data: &'a [u8],
    pos: usize,
    bit_buffer: u32,
    bit_count: u32,
}

impl<'a> MsbReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            bit_buffer: 0,
            bit_count: 0,
        }
    }

    fn next_code(&mut self, width: u32) -> Option<u16> {
        while self.bit_count < width {
            let byte = *self.data.get(self.pos)?;
            self.pos += 1;
            self.bit_buffer = (self.bit_buffer << 8) | byte as u32;
            self.bit_count += 8;
        }
        self.bit_count -= width;
        let code = (self.bit_buffer >> self.bit_count) & ((1 << width) - 1);
        Some(code as u16)
    }
}

struct LsbReader<'a> {
    data: &'a [u8],
    pos: usize,
    bit_buffer: u32,
    bit_count: u32,
}

impl<'a> LsbReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            bit_buffer: 0,
            bit_count: 0,
        }
    }

    fn next_code(&mut self, width: u32) -> Option<u16> {
        while self.bit_count < width {
            let byte = *self.data.get(self.pos)?;
            self.pos += 1;
            self.bit_buffer |= (byte as u32) << self.bit_count;
            self.bit_count += 8;
        }
        let code = self.bit_buffer & ((1 << width) - 1);
        self.bit_buffer >>= width;
        self.bit_count -= width;
        Some(code as u16)
    }
}

// =============================================================================
// String table
// =============================================================================

/// Decoder string table stored as parent links: entry `i` is the string of
/// `prefix[i]` followed by `suffix[i]`.
struct StringTable {
    prefix: [u16; TABLE_SIZE],
    suffix: [u8; TABLE_SIZE],
    first_char: [u8; TABLE_SIZE],
    next_free: usize,
}

impl StringTable {
    fn new() -> Self {
        let mut table = Self {
            prefix: [0; TABLE_SIZE],
            suffix: [0; TABLE_SIZE],
            first_char: [0; TABLE_SIZE],
            next_free: CODE_FIRST as usize,
        };
        for i in 0..256 {
            table.suffix[i] = i as u8;
            table.first_char[i] = i as u8;
        }
        table
    }

    fn reset(&mut self) {
        self.next_free = CODE_FIRST as usize;
    }

    fn contains(&self, code: u16) -> bool {
        (code as usize) < self.next_free && code != CODE_CLEAR && code != CODE_EOI
    }

    fn add(&mut self, prefix: u16, suffix: u8) {
        if self.next_free < TABLE_SIZE {
            self.prefix[self.next_free] = prefix;
            self.suffix[self.next_free] = suffix;
            self.first_char[self.next_free] = self.first_char[prefix as usize];
            self.next_free += 1;
        }
    }

    /// Append the string for `code` to `out`. Returns how many bytes were
    /// written, or an error when the chain is corrupt or overflows `out`.
    fn write_string(&self, code: u16, out: &mut [u8], out_pos: usize) -> Result<usize, TiffError> {
        // Walk the parent chain, then reverse in place.
        let mut chain = code as usize;
        let mut len = 0usize;
        loop {
            len += 1;
            if len > TABLE_SIZE {
                return Err(TiffError::Lzw("cyclic string table chain".to_string()));
            }
            if chain < 256 {
                break;
            }
            chain = self.prefix[chain] as usize;
        }
        if out_pos + len > out.len() {
            return Err(TiffError::Lzw(format!(
                "output overflow: {} bytes expected, stream produces more",
                out.len()
            )));
        }
        let mut chain = code as usize;
        for i in (0..len).rev() {
            out[out_pos + i] = self.suffix[chain];
            chain = self.prefix[chain] as usize;
        }
        Ok(len)
    }
}

// =============================================================================
// Decoders
// =============================================================================

/// Dialect-specific knobs: bit packing order and where the width bump
/// lands relative to the table fill.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Dialect {
    /// MSB-first with early change: width grows when the next free entry
    /// is `(1 << width) - 1`.
    Standard,
    /// LSB-first, no early change: width grows when the next free entry is
    /// `1 << width`.
    OldBitReversed,
}

/// Decompress a TIFF LZW stream into `out`, which must be sized to the
/// exact expected output length. The dialect is chosen automatically from
/// the stream's first two bytes.
pub fn decode_lzw(data: &[u8], out: &mut [u8]) -> Result<(), TiffError> {
    if is_old_style_lzw(data) {
        decode_with_dialect(data, out, Dialect::OldBitReversed)
    } else {
        decode_with_dialect(data, out, Dialect::Standard)
    }
}

fn decode_with_dialect(data: &[u8], out: &mut [u8], dialect: Dialect) -> Result<(), TiffError> {
    let mut msb = MsbReader::new(data);
    let mut lsb = LsbReader::new(data);
    let mut next_code = |width: u32| -> Option<u16> {
        match dialect {
            Dialect::Standard => msb.next_code(width),
            Dialect::OldBitReversed => lsb.next_code(width),
        }
    };

    let mut table = StringTable::new();
    let mut width = MIN_BITS;
    let mut old_code: Option<u16> = None;
    let mut out_pos = 0usize;

    let width_bump_threshold = |width: u32| -> usize {
        match dialect {
            Dialect::Standard => (1usize << width) - 1,
            Dialect::OldBitReversed => 1usize << width,
        }
    };

    loop {
        if out_pos >= out.len() {
            // Expected output fully produced; trailing EOI is implied.
            return Ok(());
        }
        let code = match next_code(width) {
            Some(code) => code,
            None => {
                return Err(TiffError::Lzw(format!(
                    "stream ended with {} of {} bytes produced",
                    out_pos,
                    out.len()
                )))
            }
        };

        if code == CODE_EOI {
            return Err(TiffError::Lzw(format!(
                "EOI with {} of {} bytes produced",
                out_pos,
                out.len()
            )));
        }
        if code == CODE_CLEAR {
            table.reset();
            width = MIN_BITS;
            old_code = None;
            continue;
        }

        let old = match old_code {
            None => {
                // First code after a clear must be a literal.
                if code >= 256 {
                    return Err(TiffError::Lzw(format!(
                        "non-literal code {} directly after clear",
                        code
                    )));
                }
                out_pos += table.write_string(code, out, out_pos)?;
                old_code = Some(code);
                continue;
            }
            Some(old) => old,
        };

        if table.contains(code) {
            out_pos += table.write_string(code, out, out_pos)?;
            table.add(old, table.first_char[code as usize]);
        } else if code as usize == table.next_free {
            // The KwKwK case: the string is old + first_char(old).
            table.add(old, table.first_char[old as usize]);
            out_pos += table.write_string(code, out, out_pos)?;
        } else {
            return Err(TiffError::Lzw(format!("corrupt stream: code {}", code)));
        }

        if table.next_free == width_bump_threshold(width) && width < MAX_BITS {
            width += 1;
        }
        old_code = Some(code);
    }
}

// =============================================================================
// Horizontal predictor
// =============================================================================

/// Undo Predictor = 2 (horizontal differencing) in place.
///
/// Each scanline stores per-channel differences; decoding is a running sum
/// with stride `samples_per_pixel`.
pub fn apply_horizontal_predictor(
    buf: &mut [u8],
    width: usize,
    height: usize,
    samples_per_pixel: usize,
) {
    let stride = width * samples_per_pixel;
    for y in 0..height {
        let row = &mut buf[y * stride..(y + 1) * stride];
        for x in samples_per_pixel..stride {
            row[x] = row[x].wrapping_add(row[x - samples_per_pixel]);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
