//! Common packet behavior.

use kvsync_codec::{CodecResult, ParcelReader, ParcelWriter};

/// A kind-specific message body.
///
/// `calculate_len` must equal the number of bytes `serialize` appends,
/// including the trailing 8-byte alignment.
pub trait Packet: Sized {
    /// Serialized size of this body.
    fn calculate_len(&self) -> usize;

    /// Appends this body to `writer`.
    fn serialize(&self, writer: &mut ParcelWriter);

    /// Reads a body from `reader`.
    fn deserialize(reader: &mut ParcelReader<'_>) -> CodecResult<Self>;
}
