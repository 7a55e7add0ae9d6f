//! Time sync packet.

use crate::packet::Packet;
use kvsync_codec::{align8, CodecResult, ParcelReader, ParcelWriter, U64_LEN};

/// Four-timestamp tuple exchanged by a time sync round.
///
/// The source side fills `source_time_begin` before sending and
/// `source_time_end` when the reply arrives. The target side fills both
/// target fields while answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeSyncPacket {
    /// Local time when the request left the source.
    pub source_time_begin: u64,
    /// Local time when the reply reached the source.
    pub source_time_end: u64,
    /// Target time when the request arrived.
    pub target_time_begin: u64,
    /// Target time when the reply left.
    pub target_time_end: u64,
}

impl TimeSyncPacket {
    /// Creates a request stamped with the source send time.
    pub fn request(source_time_begin: u64) -> Self {
        Self {
            source_time_begin,
            ..Self::default()
        }
    }
}

impl Packet for TimeSyncPacket {
    fn calculate_len(&self) -> usize {
        align8(4 * U64_LEN)
    }

    fn serialize(&self, writer: &mut ParcelWriter) {
        writer.write_u64(self.source_time_begin);
        writer.write_u64(self.source_time_end);
        writer.write_u64(self.target_time_begin);
        writer.write_u64(self.target_time_end);
        writer.align8();
    }

    fn deserialize(reader: &mut ParcelReader<'_>) -> CodecResult<Self> {
        let packet = Self {
            source_time_begin: reader.read_u64()?,
            source_time_end: reader.read_u64()?,
            target_time_begin: reader.read_u64()?,
            target_time_end: reader.read_u64()?,
        };
        reader.align8()?;
        Ok(packet)
    }
}
