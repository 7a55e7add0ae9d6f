//! Single-version data sync packets.

use crate::codes::{StatusCode, SyncMode};
use crate::packet::Packet;
use kvsync_codec::{align8, blob_len, string_len, CodecResult, ParcelReader, ParcelWriter, U32_LEN, U64_LEN};

/// One replicated entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataItem {
    /// Entry key.
    pub key: Vec<u8>,
    /// Entry value (empty for deletions).
    pub value: Vec<u8>,
    /// Commit timestamp in the clock of the sending device.
    pub timestamp: u64,
    /// Timestamp of the original write, preserved across hops.
    pub write_timestamp: u64,
    /// Entry flags, see [`DataItem::DELETE_FLAG`].
    pub flag: u64,
    /// Device the entry was first written on (empty for the sender itself).
    pub origin_device: String,
}

impl DataItem {
    /// Marks a tombstone.
    pub const DELETE_FLAG: u64 = 0x01;

    /// Creates a live entry.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, timestamp: u64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            timestamp,
            write_timestamp: timestamp,
            flag: 0,
            origin_device: String::new(),
        }
    }

    /// Creates a tombstone.
    pub fn delete(key: impl Into<Vec<u8>>, timestamp: u64) -> Self {
        Self {
            flag: Self::DELETE_FLAG,
            ..Self::put(key, Vec::new(), timestamp)
        }
    }

    /// Returns true if this entry deletes its key.
    pub fn is_deleted(&self) -> bool {
        self.flag & Self::DELETE_FLAG != 0
    }

    /// Time of the original write, falling back to the commit timestamp
    /// for entries that never recorded one.
    pub fn write_time(&self) -> u64 {
        if self.write_timestamp != 0 {
            self.write_timestamp
        } else {
            self.timestamp
        }
    }

    /// Serialized size of this entry.
    pub fn calculate_len(&self) -> usize {
        blob_len(self.key.len())
            + blob_len(self.value.len())
            + U64_LEN * 3
            + string_len(&self.origin_device)
    }

    fn serialize(&self, writer: &mut ParcelWriter) {
        writer.write_blob(&self.key);
        writer.write_blob(&self.value);
        writer.write_u64(self.timestamp);
        writer.write_u64(self.write_timestamp);
        writer.write_u64(self.flag);
        writer.write_string(&self.origin_device);
    }

    fn deserialize(reader: &mut ParcelReader<'_>) -> CodecResult<Self> {
        Ok(Self {
            key: reader.read_blob()?,
            value: reader.read_blob()?,
            timestamp: reader.read_u64()?,
            write_timestamp: reader.read_u64()?,
            flag: reader.read_u64()?,
            origin_device: reader.read_string()?,
        })
    }
}

/// A batch of entries plus the sender's watermark view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRequestPacket {
    /// Entries in ascending timestamp order.
    pub data: Vec<DataItem>,
    /// Upper bound (inclusive) of the range this packet covers, which may
    /// exceed its highest entry when the sender skipped entries.
    pub end_watermark: u64,
    /// Exclusive lower bound of this batch (sender's local watermark).
    pub local_watermark: u64,
    /// Peer watermark the sender last applied.
    pub peer_watermark: u64,
    /// Status code, see [`StatusCode`].
    pub send_code: i32,
    /// Mode of the sending side.
    pub mode: SyncMode,
    /// Packet flags, see [`DataRequestPacket::LAST_SEQUENCE`].
    pub flag: u32,
}

impl DataRequestPacket {
    /// Set on the packet that completes the snapshot.
    pub const LAST_SEQUENCE: u32 = 0x01;

    /// Creates an empty request for `mode`.
    pub fn new(mode: SyncMode) -> Self {
        Self {
            data: Vec::new(),
            end_watermark: 0,
            local_watermark: 0,
            peer_watermark: 0,
            send_code: StatusCode::Ok.to_code(),
            mode,
            flag: 0,
        }
    }

    /// Returns true if this packet completes the snapshot.
    pub fn is_last_sequence(&self) -> bool {
        self.flag & Self::LAST_SEQUENCE != 0
    }

    /// Marks this packet as the last of its session.
    pub fn set_last_sequence(&mut self) {
        self.flag |= Self::LAST_SEQUENCE;
    }

    /// Decoded send code.
    pub fn status(&self) -> StatusCode {
        StatusCode::from_code(self.send_code)
    }

    /// Highest entry timestamp in the batch, if any.
    pub fn max_timestamp(&self) -> Option<u64> {
        self.data.iter().map(|item| item.timestamp).max()
    }

    /// Watermark a receiver reaches by applying this packet.
    pub fn covered_watermark(&self) -> u64 {
        self.max_timestamp().unwrap_or(0).max(self.end_watermark)
    }
}

impl Packet for DataRequestPacket {
    fn calculate_len(&self) -> usize {
        let items: usize = self.data.iter().map(DataItem::calculate_len).sum();
        align8(U32_LEN + items + U64_LEN * 3 + U32_LEN * 3)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn serialize(&self, writer: &mut ParcelWriter) {
        writer.write_u32(self.data.len() as u32);
        for item in &self.data {
            item.serialize(writer);
        }
        writer.write_u64(self.end_watermark);
        writer.write_u64(self.local_watermark);
        writer.write_u64(self.peer_watermark);
        writer.write_i32(self.send_code);
        writer.write_i32(self.mode.to_code());
        writer.write_u32(self.flag);
        writer.align8();
    }

    fn deserialize(reader: &mut ParcelReader<'_>) -> CodecResult<Self> {
        let count = reader.read_count("data items")?;
        let mut data = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            data.push(DataItem::deserialize(reader)?);
        }
        let end_watermark = reader.read_u64()?;
        let local_watermark = reader.read_u64()?;
        let peer_watermark = reader.read_u64()?;
        let send_code = reader.read_i32()?;
        let mode = SyncMode::decode(reader.read_i32()?)?;
        let flag = reader.read_u32()?;
        reader.align8()?;
        Ok(Self {
            data,
            end_watermark,
            local_watermark,
            peer_watermark,
            send_code,
            mode,
            flag,
        })
    }
}

/// Acknowledgement of a [`DataRequestPacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAckPacket {
    /// Meaning depends on `recv_code`: the applied watermark for `Ok`, the
    /// receiver's peer watermark for `LocalWatermarkNotInit`, the retry
    /// delay in milliseconds for `SaveDataNotify`.
    pub data: u64,
    /// Result code, see [`StatusCode`].
    pub recv_code: i32,
}

impl DataAckPacket {
    /// Creates an ack.
    pub fn new(recv_code: StatusCode, data: u64) -> Self {
        Self {
            data,
            recv_code: recv_code.to_code(),
        }
    }

    /// Decoded receive code.
    pub fn status(&self) -> StatusCode {
        StatusCode::from_code(self.recv_code)
    }
}

impl Packet for DataAckPacket {
    fn calculate_len(&self) -> usize {
        align8(U64_LEN + U32_LEN)
    }

    fn serialize(&self, writer: &mut ParcelWriter) {
        writer.write_u64(self.data);
        writer.write_i32(self.recv_code);
        writer.align8();
    }

    fn deserialize(reader: &mut ParcelReader<'_>) -> CodecResult<Self> {
        let data = reader.read_u64()?;
        let recv_code = reader.read_i32()?;
        reader.align8()?;
        Ok(Self { data, recv_code })
    }
}
