//! # kvsync Protocol
//!
//! Message envelope and packet types exchanged by kvsync peers.
//!
//! This crate provides:
//! - The fixed message header and [`Message`] envelope
//! - Time sync, ability sync and data sync packets
//! - Multi-version commit history, commit entry and value slice packets
//! - Sync modes, status codes and security options
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Framing
//!
//! Every message is a 24-byte header followed by an 8-byte aligned body.
//! [`Message::calculate_len`] always equals the encoded length, and
//! [`Message::decode`] rejects buffers whose length disagrees with either
//! the header or the length recomputed from the decoded fields.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ability;
mod codes;
mod data;
mod message;
mod multi_ver;
mod packet;
mod time;

pub use ability::{AbilitySyncAckPacket, AbilitySyncRequestPacket};
pub use codes::{SecurityLabel, SecurityOption, StatusCode, SyncMode};
pub use data::{DataAckPacket, DataItem, DataRequestPacket};
pub use message::{
    Message, MessageHeader, MessageId, MessageType, Payload, HEADER_LEN, PROTOCOL_VERSION_CURRENT,
};
pub use multi_ver::{
    CommitHistoryAckPacket, CommitHistoryRequestPacket, CommitNode, MultiVerAckPacket,
    MultiVerEntry, MultiVerRequestPacket, ValueSliceHash, ValueSliceHashPacket, ValueSlicePacket,
};
pub use packet::Packet;
pub use time::TimeSyncPacket;

pub use kvsync_codec::{CodecError, CodecResult};
