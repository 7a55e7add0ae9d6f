//! # kvsync Codec
//!
//! Aligned binary parcel encoding/decoding for kvsync.
//!
//! A parcel is a flat little-endian byte sequence:
//! - Scalars are fixed width (`u16`, `u32`, `i32`, `u64`, `i64`)
//! - Booleans are stored as `u32`
//! - Blobs and strings are `u32` length prefixed and padded to 4 bytes
//! - Every packet body is padded to a multiple of 8 bytes
//!
//! The length helpers ([`blob_len`], [`u64_vec_len`], [`align8`]) let a
//! packet compute its serialized size without serializing, and decoders
//! compare that computed size against the bytes actually present.
//!
//! ## Usage
//!
//! ```
//! use kvsync_codec::{ParcelReader, ParcelWriter};
//!
//! let mut writer = ParcelWriter::new();
//! writer.write_u32(42);
//! writer.write_string("device-a");
//! writer.align8();
//! let bytes = writer.into_bytes();
//!
//! let mut reader = ParcelReader::new(&bytes);
//! assert_eq!(reader.read_u32().unwrap(), 42);
//! assert_eq!(reader.read_string().unwrap(), "device-a");
//! reader.align8().unwrap();
//! assert!(reader.is_empty());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod reader;
mod writer;

pub use error::{CodecError, CodecResult};
pub use reader::{ParcelReader, MAX_ELEMENT_COUNT};
pub use writer::{
    align4, align8, blob_len, string_len, u64_vec_len, ParcelWriter, BOOL_LEN, U16_LEN, U32_LEN,
    U64_LEN,
};
