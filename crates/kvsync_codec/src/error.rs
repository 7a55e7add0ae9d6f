//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur during encoding or decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended before a field could be read.
    #[error("unexpected end of input at offset {offset} (needed {needed} bytes)")]
    UnexpectedEof {
        /// Offset of the read that failed.
        offset: usize,
        /// Bytes the read required.
        needed: usize,
    },

    /// A declared length disagrees with the bytes present.
    #[error("length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch {
        /// Length announced by the header or computed from the fields.
        declared: usize,
        /// Length of the buffer.
        actual: usize,
    },

    /// The packet was produced by a newer protocol version.
    #[error("unsupported version {version} (newest understood {max})")]
    UnsupportedVersion {
        /// Version carried by the packet.
        version: u32,
        /// Newest version this build understands.
        max: u32,
    },

    /// Structurally invalid content.
    #[error("invalid structure: {message}")]
    InvalidStructure {
        /// Description of the structural error.
        message: String,
    },

    /// Invalid UTF-8 string.
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// A length or element count is above the decoder limit.
    #[error("{what} of {len} exceeds limit {max}")]
    LimitExceeded {
        /// What was being decoded.
        what: &'static str,
        /// Requested length or count.
        len: usize,
        /// Allowed maximum.
        max: usize,
    },
}

impl CodecError {
    /// Create an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            message: message.into(),
        }
    }

    /// Create a length mismatch error.
    pub fn length_mismatch(declared: usize, actual: usize) -> Self {
        Self::LengthMismatch { declared, actual }
    }
}
