//! Multi-version sync packets: commit history, commit entries, value slices.

use crate::codes::StatusCode;
use crate::packet::Packet;
use kvsync_codec::{
    align8, blob_len, string_len, CodecError, CodecResult, ParcelReader, ParcelWriter, BOOL_LEN,
    U32_LEN, U64_LEN,
};
use std::collections::BTreeMap;

/// Content address of a value slice (SHA-256 digest).
pub type ValueSliceHash = [u8; 32];

fn read_hash(reader: &mut ParcelReader<'_>) -> CodecResult<ValueSliceHash> {
    let bytes = reader.read_blob()?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CodecError::invalid_structure(format!("slice hash of {} bytes", bytes.len())))
}

/// A node of the commit history tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitNode {
    /// Identifier of this commit.
    pub commit_id: Vec<u8>,
    /// First parent (empty for a root).
    pub left_parent: Vec<u8>,
    /// Second parent (empty unless this is a merge).
    pub right_parent: Vec<u8>,
    /// Commit timestamp.
    pub timestamp: u64,
    /// Store version at this commit.
    pub version: u64,
    /// Device that produced the commit.
    pub device_id: String,
}

impl CommitNode {
    /// Serialized size of this node.
    pub fn calculate_len(&self) -> usize {
        blob_len(self.commit_id.len())
            + blob_len(self.left_parent.len())
            + blob_len(self.right_parent.len())
            + U64_LEN * 2
            + string_len(&self.device_id)
    }

    fn serialize(&self, writer: &mut ParcelWriter) {
        writer.write_blob(&self.commit_id);
        writer.write_blob(&self.left_parent);
        writer.write_blob(&self.right_parent);
        writer.write_u64(self.timestamp);
        writer.write_u64(self.version);
        writer.write_string(&self.device_id);
    }

    fn deserialize(reader: &mut ParcelReader<'_>) -> CodecResult<Self> {
        Ok(Self {
            commit_id: reader.read_blob()?,
            left_parent: reader.read_blob()?,
            right_parent: reader.read_blob()?,
            timestamp: reader.read_u64()?,
            version: reader.read_u64()?,
            device_id: reader.read_string()?,
        })
    }
}

/// A key-level change inside a commit.
///
/// Values are referenced by slice hashes; slice content travels separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiVerEntry {
    /// Entry key.
    pub key: Vec<u8>,
    /// Ordered slices composing the value.
    pub slices: Vec<ValueSliceHash>,
    /// Whether this entry deletes its key.
    pub deleted: bool,
    /// Entry timestamp.
    pub timestamp: u64,
}

impl MultiVerEntry {
    /// Serialized size of this entry.
    pub fn calculate_len(&self) -> usize {
        blob_len(self.key.len())
            + U32_LEN
            + self.slices.len() * blob_len(32)
            + BOOL_LEN
            + U64_LEN
    }

    #[allow(clippy::cast_possible_truncation)]
    fn serialize(&self, writer: &mut ParcelWriter) {
        writer.write_blob(&self.key);
        writer.write_u32(self.slices.len() as u32);
        for hash in &self.slices {
            writer.write_blob(hash);
        }
        writer.write_bool(self.deleted);
        writer.write_u64(self.timestamp);
    }

    fn deserialize(reader: &mut ParcelReader<'_>) -> CodecResult<Self> {
        let key = reader.read_blob()?;
        let count = reader.read_count("value slices")?;
        let mut slices = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            slices.push(read_hash(reader)?);
        }
        Ok(Self {
            key,
            slices,
            deleted: reader.read_bool()?,
            timestamp: reader.read_u64()?,
        })
    }
}

/// Requester's latest commit per originating device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommitHistoryRequestPacket {
    /// Latest known commit keyed by device.
    pub latest_commits: BTreeMap<String, CommitNode>,
}

impl Packet for CommitHistoryRequestPacket {
    fn calculate_len(&self) -> usize {
        let entries: usize = self
            .latest_commits
            .iter()
            .map(|(device, node)| string_len(device) + node.calculate_len())
            .sum();
        align8(U32_LEN + entries)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn serialize(&self, writer: &mut ParcelWriter) {
        writer.write_u32(self.latest_commits.len() as u32);
        for (device, node) in &self.latest_commits {
            writer.write_string(device);
            node.serialize(writer);
        }
        writer.align8();
    }

    fn deserialize(reader: &mut ParcelReader<'_>) -> CodecResult<Self> {
        let count = reader.read_count("latest commits")?;
        let mut latest_commits = BTreeMap::new();
        for _ in 0..count {
            let device = reader.read_string()?;
            let node = CommitNode::deserialize(reader)?;
            if latest_commits.insert(device, node).is_some() {
                return Err(CodecError::invalid_structure("duplicate device in commit map"));
            }
        }
        reader.align8()?;
        Ok(Self { latest_commits })
    }
}

/// Commits the requester is missing, parents before children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitHistoryAckPacket {
    /// Result code, see [`StatusCode`].
    pub err_code: i32,
    /// Missing commits.
    pub commits: Vec<CommitNode>,
}

impl CommitHistoryAckPacket {
    /// Decoded result code.
    pub fn status(&self) -> StatusCode {
        StatusCode::from_code(self.err_code)
    }
}

impl Packet for CommitHistoryAckPacket {
    fn calculate_len(&self) -> usize {
        let nodes: usize = self.commits.iter().map(CommitNode::calculate_len).sum();
        align8(U32_LEN * 2 + nodes)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn serialize(&self, writer: &mut ParcelWriter) {
        writer.write_i32(self.err_code);
        writer.write_u32(self.commits.len() as u32);
        for node in &self.commits {
            node.serialize(writer);
        }
        writer.align8();
    }

    fn deserialize(reader: &mut ParcelReader<'_>) -> CodecResult<Self> {
        let err_code = reader.read_i32()?;
        let count = reader.read_count("commits")?;
        let mut commits = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            commits.push(CommitNode::deserialize(reader)?);
        }
        reader.align8()?;
        Ok(Self { err_code, commits })
    }
}

/// Request for the entries of one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiVerRequestPacket {
    /// Status code, see [`StatusCode`].
    pub err_code: i32,
    /// Commit whose entries are requested.
    pub commit: CommitNode,
}

impl Packet for MultiVerRequestPacket {
    fn calculate_len(&self) -> usize {
        align8(U32_LEN + self.commit.calculate_len())
    }

    fn serialize(&self, writer: &mut ParcelWriter) {
        writer.write_i32(self.err_code);
        self.commit.serialize(writer);
        writer.align8();
    }

    fn deserialize(reader: &mut ParcelReader<'_>) -> CodecResult<Self> {
        let err_code = reader.read_i32()?;
        let commit = CommitNode::deserialize(reader)?;
        reader.align8()?;
        Ok(Self { err_code, commit })
    }
}

/// Entries of one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiVerAckPacket {
    /// Result code, see [`StatusCode`].
    pub err_code: i32,
    /// Entries of the requested commit.
    pub entries: Vec<MultiVerEntry>,
}

impl MultiVerAckPacket {
    /// Decoded result code.
    pub fn status(&self) -> StatusCode {
        StatusCode::from_code(self.err_code)
    }
}

impl Packet for MultiVerAckPacket {
    fn calculate_len(&self) -> usize {
        let entries: usize = self.entries.iter().map(MultiVerEntry::calculate_len).sum();
        align8(U32_LEN * 2 + entries)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn serialize(&self, writer: &mut ParcelWriter) {
        writer.write_i32(self.err_code);
        writer.write_u32(self.entries.len() as u32);
        for entry in &self.entries {
            entry.serialize(writer);
        }
        writer.align8();
    }

    fn deserialize(reader: &mut ParcelReader<'_>) -> CodecResult<Self> {
        let err_code = reader.read_i32()?;
        let count = reader.read_count("entries")?;
        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            entries.push(MultiVerEntry::deserialize(reader)?);
        }
        reader.align8()?;
        Ok(Self { err_code, entries })
    }
}

/// Request for one value slice by hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueSliceHashPacket {
    /// Status code, see [`StatusCode`].
    pub err_code: i32,
    /// Requested slice.
    pub hash: ValueSliceHash,
}

impl Packet for ValueSliceHashPacket {
    fn calculate_len(&self) -> usize {
        align8(U32_LEN + blob_len(32))
    }

    fn serialize(&self, writer: &mut ParcelWriter) {
        writer.write_i32(self.err_code);
        writer.write_blob(&self.hash);
        writer.align8();
    }

    fn deserialize(reader: &mut ParcelReader<'_>) -> CodecResult<Self> {
        let err_code = reader.read_i32()?;
        let hash = read_hash(reader)?;
        reader.align8()?;
        Ok(Self { err_code, hash })
    }
}

/// Content of one value slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueSlicePacket {
    /// Result code, see [`StatusCode`].
    pub err_code: i32,
    /// Slice bytes (empty on error).
    pub slice: Vec<u8>,
}

impl ValueSlicePacket {
    /// Decoded result code.
    pub fn status(&self) -> StatusCode {
        StatusCode::from_code(self.err_code)
    }
}

impl Packet for ValueSlicePacket {
    fn calculate_len(&self) -> usize {
        align8(U32_LEN + blob_len(self.slice.len()))
    }

    fn serialize(&self, writer: &mut ParcelWriter) {
        writer.write_i32(self.err_code);
        writer.write_blob(&self.slice);
        writer.align8();
    }

    fn deserialize(reader: &mut ParcelReader<'_>) -> CodecResult<Self> {
        let err_code = reader.read_i32()?;
        let slice = reader.read_blob()?;
        reader.align8()?;
        Ok(Self { err_code, slice })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_hash_is_rejected() {
        let mut writer = ParcelWriter::new();
        writer.write_i32(0);
        writer.write_blob(&[1, 2, 3]);
        writer.align8();
        let bytes = writer.into_bytes();
        let mut reader = ParcelReader::new(&bytes);
        assert!(ValueSliceHashPacket::deserialize(&mut reader).is_err());
    }

    #[test]
    fn duplicate_device_is_rejected() {
        let node = CommitNode {
            commit_id: vec![1],
            left_parent: Vec::new(),
            right_parent: Vec::new(),
            timestamp: 1,
            version: 1,
            device_id: "a".into(),
        };
        let mut writer = ParcelWriter::new();
        writer.write_u32(2);
        for _ in 0..2 {
            writer.write_string("a");
            node.serialize(&mut writer);
        }
        writer.align8();
        let bytes = writer.into_bytes();
        let mut reader = ParcelReader::new(&bytes);
        assert!(CommitHistoryRequestPacket::deserialize(&mut reader).is_err());
    }
}
