//! Parcel writer.

use bytes::{BufMut, BytesMut};

/// Serialized width of a `u16`.
pub const U16_LEN: usize = 2;
/// Serialized width of a `u32` or `i32`.
pub const U32_LEN: usize = 4;
/// Serialized width of a `u64` or `i64`.
pub const U64_LEN: usize = 8;
/// Serialized width of a boolean (stored as `u32`).
pub const BOOL_LEN: usize = U32_LEN;

/// Rounds `len` up to the next multiple of 8.
pub const fn align8(len: usize) -> usize {
    (len + 7) & !7
}

/// Rounds `len` up to the next multiple of 4.
pub const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Serialized size of a length-prefixed blob holding `len` bytes.
///
/// A blob is a `u32` length followed by the bytes, padded to 4 bytes.
pub const fn blob_len(len: usize) -> usize {
    align4(U32_LEN + len)
}

/// Serialized size of a length-prefixed string.
pub fn string_len(s: &str) -> usize {
    blob_len(s.len())
}

/// Serialized size of a `u64` vector with `count` elements.
pub const fn u64_vec_len(count: usize) -> usize {
    U32_LEN + count * U64_LEN
}

/// Writer producing little-endian parcels.
///
/// Every multi-byte scalar is little-endian. Blobs and strings carry a `u32`
/// length prefix and are zero padded to 4 bytes. [`ParcelWriter::align8`]
/// pads the whole buffer to a multiple of 8, which closes every packet body.
#[derive(Debug, Default)]
pub struct ParcelWriter {
    buffer: BytesMut,
}

impl ParcelWriter {
    /// Create a new writer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    /// Create a new writer with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Get a reference to the written bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume this writer and return the written bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer.to_vec()
    }

    /// Write a `u16`.
    pub fn write_u16(&mut self, value: u16) {
        self.buffer.put_u16_le(value);
    }

    /// Write a `u32`.
    pub fn write_u32(&mut self, value: u32) {
        self.buffer.put_u32_le(value);
    }

    /// Write an `i32`.
    pub fn write_i32(&mut self, value: i32) {
        self.buffer.put_i32_le(value);
    }

    /// Write a `u64`.
    pub fn write_u64(&mut self, value: u64) {
        self.buffer.put_u64_le(value);
    }

    /// Write an `i64`.
    pub fn write_i64(&mut self, value: i64) {
        self.buffer.put_i64_le(value);
    }

    /// Write a boolean as a `u32` (0 or 1).
    pub fn write_bool(&mut self, value: bool) {
        self.write_u32(u32::from(value));
    }

    /// Write a length-prefixed blob.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_blob(&mut self, data: &[u8]) {
        self.write_u32(data.len() as u32);
        self.buffer.extend_from_slice(data);
        let padded = blob_len(data.len()) - U32_LEN;
        self.buffer.put_bytes(0, padded - data.len());
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, s: &str) {
        self.write_blob(s.as_bytes());
    }

    /// Write a count-prefixed `u64` vector.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_u64_vec(&mut self, values: &[u64]) {
        self.write_u32(values.len() as u32);
        for value in values {
            self.write_u64(*value);
        }
    }

    /// Pad the buffer with zeros to a multiple of 8 bytes.
    pub fn align8(&mut self) {
        let target = align8(self.buffer.len());
        let pad = target - self.buffer.len();
        self.buffer.put_bytes(0, pad);
    }
}
