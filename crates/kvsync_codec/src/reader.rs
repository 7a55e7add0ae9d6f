//! Parcel reader.

use crate::error::{CodecError, CodecResult};
use crate::writer::{align4, align8, U32_LEN};

/// Maximum blob or string length accepted from untrusted input.
const MAX_BLOB_LEN: usize = 64 * 1024 * 1024;

/// Maximum element count accepted for any repeated field.
///
/// Guards allocations sized from untrusted counts.
pub const MAX_ELEMENT_COUNT: usize = 1024 * 1024;

/// Reader over a parcel produced by [`crate::ParcelWriter`].
pub struct ParcelReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ParcelReader<'a> {
    /// Create a new reader for the given bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current read offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Check if all bytes have been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Get remaining bytes.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos.min(self.data.len())..]
    }

    #[inline]
    fn read_slice(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(CodecError::UnexpectedEof {
                offset: self.pos,
                needed: len,
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    #[inline]
    fn read_array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let slice = self.read_slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    /// Read a `u16`.
    pub fn read_u16(&mut self) -> CodecResult<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    /// Read a `u32`.
    pub fn read_u32(&mut self) -> CodecResult<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    /// Read an `i32`.
    pub fn read_i32(&mut self) -> CodecResult<i32> {
        self.read_array().map(i32::from_le_bytes)
    }

    /// Read a `u64`.
    pub fn read_u64(&mut self) -> CodecResult<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    /// Read an `i64`.
    pub fn read_i64(&mut self) -> CodecResult<i64> {
        self.read_array().map(i64::from_le_bytes)
    }

    /// Read a boolean stored as `u32`.
    pub fn read_bool(&mut self) -> CodecResult<bool> {
        match self.read_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::invalid_structure(format!(
                "boolean field holds {other}"
            ))),
        }
    }

    /// Read a length-prefixed blob.
    pub fn read_blob(&mut self) -> CodecResult<Vec<u8>> {
        let len = self.read_u32()? as usize;
        if len > MAX_BLOB_LEN {
            return Err(CodecError::LimitExceeded {
                what: "blob length",
                len,
                max: MAX_BLOB_LEN,
            });
        }
        let padded = align4(U32_LEN + len) - U32_LEN;
        let bytes = self.read_slice(padded)?;
        Ok(bytes[..len].to_vec())
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> CodecResult<String> {
        let bytes = self.read_blob()?;
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Read a count prefix for a repeated field, bounded by [`MAX_ELEMENT_COUNT`].
    pub fn read_count(&mut self, what: &'static str) -> CodecResult<usize> {
        let count = self.read_u32()? as usize;
        if count > MAX_ELEMENT_COUNT {
            return Err(CodecError::LimitExceeded {
                what,
                len: count,
                max: MAX_ELEMENT_COUNT,
            });
        }
        Ok(count)
    }

    /// Read a count-prefixed `u64` vector.
    pub fn read_u64_vec(&mut self) -> CodecResult<Vec<u64>> {
        let count = self.read_count("u64 vector")?;
        let mut values = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            values.push(self.read_u64()?);
        }
        Ok(values)
    }

    /// Skip the zero padding up to the next multiple of 8.
    pub fn align8(&mut self) -> CodecResult<()> {
        let target = align8(self.pos);
        self.read_slice(target - self.pos)?;
        Ok(())
    }
}
