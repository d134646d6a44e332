//! Byte-stream primitives shared by the opcode and trie decoders.
//!
//! This module provides:
//! - A bounds-checked [`ByteCursor`] over an untrusted byte slice
//! - Strict LEB128 decoding that tells a truncated stream from an overflowing one
//! - SIMD-accelerated NUL searches (via memchr)

use crate::error::{Error, Result};

// =============================================================================
// Byte Cursor
// =============================================================================

/// A forward-only reader over a byte slice.
///
/// Every read is bounds checked. Errors carry the absolute offset (within the
/// slice the cursor was created from) of the value that failed to decode.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    /// Creates a cursor positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Creates a cursor positioned at `pos`.
    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    /// Returns the current position.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Returns true if no bytes remain.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Returns the number of bytes left.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Returns the underlying slice.
    #[inline]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(Error::buffer_too_small(self.pos + 1, self.data.len()))?;
        self.pos += 1;
        Ok(byte)
    }

    /// Skips `count` bytes.
    pub fn skip(&mut self, count: usize) -> Result<()> {
        let end = self
            .pos
            .checked_add(count)
            .filter(|&end| end <= self.data.len())
            .ok_or(Error::buffer_too_small(
                self.pos.saturating_add(count),
                self.data.len(),
            ))?;
        self.pos = end;
        Ok(())
    }

    /// Reads `count` bytes.
    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        let start = self.pos;
        self.skip(count)?;
        Ok(&self.data[start..self.pos])
    }

    /// Reads an unsigned LEB128 value.
    ///
    /// Fails with [`Error::TruncatedLeb128`] if the slice ends while the
    /// continuation bit is still set, and with [`Error::Leb128Overflow`] if the
    /// encoded value does not fit in 64 bits. No byte past the end of the slice
    /// is ever read.
    pub fn read_uleb128(&mut self) -> Result<u64> {
        let start = self.pos;
        let mut result: u64 = 0;
        let mut shift = 0u32;

        loop {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or(Error::TruncatedLeb128 { offset: start })?;
            self.pos += 1;

            let slice = (byte & 0x7F) as u64;
            // The tenth byte may only contribute bit 63.
            if shift >= 64 || (shift == 63 && slice > 1) {
                return Err(Error::Leb128Overflow { offset: start });
            }
            result |= slice << shift;

            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Reads a signed LEB128 value.
    ///
    /// Same failure semantics as [`read_uleb128`](Self::read_uleb128); at bit
    /// 63 the remaining payload bits must be a pure sign extension.
    pub fn read_sleb128(&mut self) -> Result<i64> {
        let start = self.pos;
        let mut result: i64 = 0;
        let mut shift = 0u32;

        loop {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or(Error::TruncatedLeb128 { offset: start })?;
            self.pos += 1;

            let slice = byte & 0x7F;
            if shift >= 64 || (shift == 63 && slice != 0 && slice != 0x7F) {
                return Err(Error::Leb128Overflow { offset: start });
            }
            result |= (slice as i64) << shift;
            shift += 7;

            if byte & 0x80 == 0 {
                if shift < 64 && (byte & 0x40) != 0 {
                    result |= !0_i64 << shift;
                }
                return Ok(result);
            }
        }
    }

    /// Reads a NUL-terminated string and returns it without the terminator.
    pub fn read_cstr(&mut self) -> Result<&'a [u8]> {
        let rest = self.data.get(self.pos..).unwrap_or(&[]);
        let len = memchr::memchr(0, rest).ok_or(Error::UnterminatedString { offset: self.pos })?;
        let bytes = &rest[..len];
        self.pos += len + 1;
        Ok(bytes)
    }
}

// =============================================================================
// Free-standing LEB128 helpers
// =============================================================================

/// Reads an unsigned LEB128 value from the start of `data`.
///
/// Returns the decoded value and the number of bytes consumed.
pub fn read_uleb128(data: &[u8]) -> Result<(u64, usize)> {
    let mut cursor = ByteCursor::new(data);
    let value = cursor.read_uleb128()?;
    Ok((value, cursor.position()))
}

/// Reads a signed LEB128 value from the start of `data`.
pub fn read_sleb128(data: &[u8]) -> Result<(i64, usize)> {
    let mut cursor = ByteCursor::new(data);
    let value = cursor.read_sleb128()?;
    Ok((value, cursor.position()))
}

/// Writes an unsigned LEB128 value to a buffer.
pub fn write_uleb128(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Writes a signed LEB128 value to a buffer.
pub fn write_sleb128(mut value: i64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

// =============================================================================
// String Helpers
// =============================================================================

/// Finds the position of the first null byte in a slice.
///
/// Uses the `memchr` crate, which vectorises the search where the target
/// supports it. Returns `data.len()` when there is no NUL.
#[inline(always)]
pub fn memchr_null(data: &[u8]) -> usize {
    memchr::memchr(0, data).unwrap_or(data.len())
}

/// Decodes bytes up to the first NUL as a (lossy) UTF-8 string.
pub fn lossy_cstr(data: &[u8]) -> String {
    String::from_utf8_lossy(&data[..memchr_null(data)]).into_owned()
}

// =============================================================================
// Alignment Utilities
// =============================================================================

/// Aligns a value up to the given power-of-two alignment, or `None` on overflow.
#[inline]
pub fn checked_align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    value
        .checked_add(alignment - 1)
        .map(|v| v & !(alignment - 1))
}

/// Checks if a value is aligned to the given power-of-two alignment.
#[inline(always)]
pub const fn is_aligned(value: u64, alignment: u64) -> bool {
    debug_assert!(alignment.is_power_of_two());
    (value & (alignment - 1)) == 0
}
