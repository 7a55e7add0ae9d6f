//! Message envelope: fixed header plus a kind-specific body.

use crate::ability::{AbilitySyncAckPacket, AbilitySyncRequestPacket};
use crate::data::{DataAckPacket, DataRequestPacket};
use crate::multi_ver::{
    CommitHistoryAckPacket, CommitHistoryRequestPacket, MultiVerAckPacket, MultiVerRequestPacket,
    ValueSliceHashPacket, ValueSlicePacket,
};
use crate::packet::Packet;
use crate::time::TimeSyncPacket;
use kvsync_codec::{CodecError, CodecResult, ParcelReader, ParcelWriter};

/// Newest protocol version this build speaks.
pub const PROTOCOL_VERSION_CURRENT: u32 = 1;

/// Size of the fixed message header.
///
/// Layout: kind `u16`, type `u16`, body length `u32`, version `u32`,
/// session id `u32`, sequence id `u32`, error `i32`.
pub const HEADER_LEN: usize = 24;

/// Kind of message, selecting the body layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// Clock offset negotiation.
    TimeSync,
    /// Capability/security handshake.
    AbilitySync,
    /// Single-version entry transfer.
    DataSync,
    /// Multi-version commit tree exchange.
    CommitHistorySync,
    /// Multi-version entries of one commit.
    MultiVerDataSync,
    /// Multi-version value slice transfer.
    ValueSliceSync,
    /// Broadcast notification that local data changed.
    LocalDataChanged,
}

impl MessageId {
    /// Returns the message kind code.
    pub fn to_code(&self) -> u16 {
        match self {
            MessageId::TimeSync => 1,
            MessageId::AbilitySync => 2,
            MessageId::DataSync => 3,
            MessageId::CommitHistorySync => 4,
            MessageId::MultiVerDataSync => 5,
            MessageId::ValueSliceSync => 6,
            MessageId::LocalDataChanged => 7,
        }
    }

    /// Converts from a message kind code.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(MessageId::TimeSync),
            2 => Some(MessageId::AbilitySync),
            3 => Some(MessageId::DataSync),
            4 => Some(MessageId::CommitHistorySync),
            5 => Some(MessageId::MultiVerDataSync),
            6 => Some(MessageId::ValueSliceSync),
            7 => Some(MessageId::LocalDataChanged),
            _ => None,
        }
    }
}

/// Role of a message within an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Expects a response.
    Request,
    /// Answers a request.
    Response,
    /// One-way notification.
    Notify,
}

impl MessageType {
    /// Returns the type code.
    pub fn to_code(&self) -> u16 {
        match self {
            MessageType::Request => 1,
            MessageType::Response => 2,
            MessageType::Notify => 3,
        }
    }

    /// Converts from a type code.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(MessageType::Request),
            2 => Some(MessageType::Response),
            3 => Some(MessageType::Notify),
            _ => None,
        }
    }
}

/// Decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message kind.
    pub message_id: MessageId,
    /// Message role.
    pub message_type: MessageType,
    /// Length of the body following the header.
    pub body_len: u32,
    /// Protocol version of the sender.
    pub version: u32,
    /// Exchange the message belongs to.
    pub session_id: u32,
    /// Position of the message within its session.
    pub sequence_id: u32,
    /// Sender-side error code.
    pub error_no: i32,
}

impl MessageHeader {
    fn serialize(&self, writer: &mut ParcelWriter) {
        writer.write_u16(self.message_id.to_code());
        writer.write_u16(self.message_type.to_code());
        writer.write_u32(self.body_len);
        writer.write_u32(self.version);
        writer.write_u32(self.session_id);
        writer.write_u32(self.sequence_id);
        writer.write_i32(self.error_no);
    }

    /// Reads and validates a header from the front of `bytes`.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let mut reader = ParcelReader::new(bytes);
        Self::deserialize(&mut reader)
    }

    fn deserialize(reader: &mut ParcelReader<'_>) -> CodecResult<Self> {
        let id_code = reader.read_u16()?;
        let type_code = reader.read_u16()?;
        let message_id = MessageId::from_code(id_code)
            .ok_or_else(|| CodecError::invalid_structure(format!("unknown message kind {id_code}")))?;
        let message_type = MessageType::from_code(type_code)
            .ok_or_else(|| CodecError::invalid_structure(format!("unknown message type {type_code}")))?;
        Ok(Self {
            message_id,
            message_type,
            body_len: reader.read_u32()?,
            version: reader.read_u32()?,
            session_id: reader.read_u32()?,
            sequence_id: reader.read_u32()?,
            error_no: reader.read_i32()?,
        })
    }
}

/// Kind-specific message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Time sync request or response.
    TimeSync(TimeSyncPacket),
    /// Ability sync request.
    AbilityRequest(AbilitySyncRequestPacket),
    /// Ability sync response.
    AbilityAck(AbilitySyncAckPacket),
    /// Data sync request.
    DataRequest(DataRequestPacket),
    /// Data sync response.
    DataAck(DataAckPacket),
    /// Commit history request.
    CommitHistoryRequest(CommitHistoryRequestPacket),
    /// Commit history response.
    CommitHistoryAck(CommitHistoryAckPacket),
    /// Commit entries request.
    MultiVerRequest(MultiVerRequestPacket),
    /// Commit entries response.
    MultiVerAck(MultiVerAckPacket),
    /// Value slice request.
    ValueSliceRequest(ValueSliceHashPacket),
    /// Value slice response.
    ValueSliceAck(ValueSlicePacket),
    /// Local data changed notification (empty body).
    DataChanged,
}

impl Payload {
    /// Message kind carrying this body.
    pub fn message_id(&self) -> MessageId {
        match self {
            Payload::TimeSync(_) => MessageId::TimeSync,
            Payload::AbilityRequest(_) | Payload::AbilityAck(_) => MessageId::AbilitySync,
            Payload::DataRequest(_) | Payload::DataAck(_) => MessageId::DataSync,
            Payload::CommitHistoryRequest(_) | Payload::CommitHistoryAck(_) => {
                MessageId::CommitHistorySync
            }
            Payload::MultiVerRequest(_) | Payload::MultiVerAck(_) => MessageId::MultiVerDataSync,
            Payload::ValueSliceRequest(_) | Payload::ValueSliceAck(_) => MessageId::ValueSliceSync,
            Payload::DataChanged => MessageId::LocalDataChanged,
        }
    }

    /// Serialized size of the body.
    pub fn calculate_len(&self) -> usize {
        match self {
            Payload::TimeSync(p) => p.calculate_len(),
            Payload::AbilityRequest(p) => p.calculate_len(),
            Payload::AbilityAck(p) => p.calculate_len(),
            Payload::DataRequest(p) => p.calculate_len(),
            Payload::DataAck(p) => p.calculate_len(),
            Payload::CommitHistoryRequest(p) => p.calculate_len(),
            Payload::CommitHistoryAck(p) => p.calculate_len(),
            Payload::MultiVerRequest(p) => p.calculate_len(),
            Payload::MultiVerAck(p) => p.calculate_len(),
            Payload::ValueSliceRequest(p) => p.calculate_len(),
            Payload::ValueSliceAck(p) => p.calculate_len(),
            Payload::DataChanged => 0,
        }
    }

    fn serialize(&self, writer: &mut ParcelWriter) {
        match self {
            Payload::TimeSync(p) => p.serialize(writer),
            Payload::AbilityRequest(p) => p.serialize(writer),
            Payload::AbilityAck(p) => p.serialize(writer),
            Payload::DataRequest(p) => p.serialize(writer),
            Payload::DataAck(p) => p.serialize(writer),
            Payload::CommitHistoryRequest(p) => p.serialize(writer),
            Payload::CommitHistoryAck(p) => p.serialize(writer),
            Payload::MultiVerRequest(p) => p.serialize(writer),
            Payload::MultiVerAck(p) => p.serialize(writer),
            Payload::ValueSliceRequest(p) => p.serialize(writer),
            Payload::ValueSliceAck(p) => p.serialize(writer),
            Payload::DataChanged => {}
        }
    }

    fn deserialize(
        id: MessageId,
        message_type: MessageType,
        reader: &mut ParcelReader<'_>,
    ) -> CodecResult<Self> {
        use MessageType::{Notify, Request, Response};
        let payload = match (id, message_type) {
            (MessageId::TimeSync, Request | Response) => {
                Payload::TimeSync(TimeSyncPacket::deserialize(reader)?)
            }
            (MessageId::AbilitySync, Request) => {
                Payload::AbilityRequest(AbilitySyncRequestPacket::deserialize(reader)?)
            }
            (MessageId::AbilitySync, Response) => {
                Payload::AbilityAck(AbilitySyncAckPacket::deserialize(reader)?)
            }
            (MessageId::DataSync, Request) => {
                Payload::DataRequest(DataRequestPacket::deserialize(reader)?)
            }
            (MessageId::DataSync, Response) => Payload::DataAck(DataAckPacket::deserialize(reader)?),
            (MessageId::CommitHistorySync, Request) => {
                Payload::CommitHistoryRequest(CommitHistoryRequestPacket::deserialize(reader)?)
            }
            (MessageId::CommitHistorySync, Response) => {
                Payload::CommitHistoryAck(CommitHistoryAckPacket::deserialize(reader)?)
            }
            (MessageId::MultiVerDataSync, Request) => {
                Payload::MultiVerRequest(MultiVerRequestPacket::deserialize(reader)?)
            }
            (MessageId::MultiVerDataSync, Response) => {
                Payload::MultiVerAck(MultiVerAckPacket::deserialize(reader)?)
            }
            (MessageId::ValueSliceSync, Request) => {
                Payload::ValueSliceRequest(ValueSliceHashPacket::deserialize(reader)?)
            }
            (MessageId::ValueSliceSync, Response) => {
                Payload::ValueSliceAck(ValueSlicePacket::deserialize(reader)?)
            }
            (MessageId::LocalDataChanged, Notify) => Payload::DataChanged,
            (id, message_type) => {
                return Err(CodecError::invalid_structure(format!(
                    "{id:?} cannot be sent as {message_type:?}"
                )))
            }
        };
        Ok(payload)
    }

    fn expected_type(&self) -> &'static [MessageType] {
        match self {
            Payload::TimeSync(_) => &[MessageType::Request, MessageType::Response],
            Payload::AbilityRequest(_)
            | Payload::DataRequest(_)
            | Payload::CommitHistoryRequest(_)
            | Payload::MultiVerRequest(_)
            | Payload::ValueSliceRequest(_) => &[MessageType::Request],
            Payload::AbilityAck(_)
            | Payload::DataAck(_)
            | Payload::CommitHistoryAck(_)
            | Payload::MultiVerAck(_)
            | Payload::ValueSliceAck(_) => &[MessageType::Response],
            Payload::DataChanged => &[MessageType::Notify],
        }
    }
}

/// A typed, versioned message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message role.
    pub message_type: MessageType,
    /// Protocol version of the sender.
    pub version: u32,
    /// Exchange this message belongs to.
    pub session_id: u32,
    /// Position within the session.
    pub sequence_id: u32,
    /// Sender-side error code.
    pub error_no: i32,
    /// Body.
    pub payload: Payload,
}

impl Message {
    /// Creates a message at the current protocol version.
    pub fn new(message_type: MessageType, session_id: u32, sequence_id: u32, payload: Payload) -> Self {
        Self {
            message_type,
            version: PROTOCOL_VERSION_CURRENT,
            session_id,
            sequence_id,
            error_no: 0,
            payload,
        }
    }

    /// Creates a request.
    pub fn request(session_id: u32, sequence_id: u32, payload: Payload) -> Self {
        Self::new(MessageType::Request, session_id, sequence_id, payload)
    }

    /// Creates a response.
    pub fn response(session_id: u32, sequence_id: u32, payload: Payload) -> Self {
        Self::new(MessageType::Response, session_id, sequence_id, payload)
    }

    /// Creates a notification.
    pub fn notify(payload: Payload) -> Self {
        Self::new(MessageType::Notify, 0, 0, payload)
    }

    /// Message kind.
    pub fn message_id(&self) -> MessageId {
        self.payload.message_id()
    }

    /// Total serialized size, header included.
    pub fn calculate_len(&self) -> usize {
        HEADER_LEN + self.payload.calculate_len()
    }

    /// Encodes header and body.
    ///
    /// # Errors
    ///
    /// Fails if the body type does not fit the declared role or if the
    /// body's computed length disagrees with its serialization.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        if !self.payload.expected_type().contains(&self.message_type) {
            return Err(CodecError::invalid_structure(format!(
                "{:?} cannot be sent as {:?}",
                self.message_id(),
                self.message_type
            )));
        }
        let body_len = self.payload.calculate_len();
        let header = MessageHeader {
            message_id: self.message_id(),
            message_type: self.message_type,
            body_len: body_len as u32,
            version: self.version,
            session_id: self.session_id,
            sequence_id: self.sequence_id,
            error_no: self.error_no,
        };
        let mut writer = ParcelWriter::with_capacity(HEADER_LEN + body_len);
        header.serialize(&mut writer);
        self.payload.serialize(&mut writer);
        if writer.len() != HEADER_LEN + body_len {
            return Err(CodecError::length_mismatch(HEADER_LEN + body_len, writer.len()));
        }
        Ok(writer.into_bytes())
    }

    /// Decodes a message, rejecting any length disagreement.
    ///
    /// # Errors
    ///
    /// - `UnsupportedVersion` when the sender is newer than this build
    /// - `LengthMismatch` when the header length, the buffer length and the
    ///   recomputed body length do not all agree
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let mut reader = ParcelReader::new(bytes);
        let header = MessageHeader::deserialize(&mut reader)?;
        if header.version > PROTOCOL_VERSION_CURRENT {
            return Err(CodecError::UnsupportedVersion {
                version: header.version,
                max: PROTOCOL_VERSION_CURRENT,
            });
        }
        let declared = HEADER_LEN + header.body_len as usize;
        if declared != bytes.len() {
            return Err(CodecError::length_mismatch(declared, bytes.len()));
        }
        let payload = Payload::deserialize(header.message_id, header.message_type, &mut reader)?;
        if !reader.is_empty() {
            return Err(CodecError::length_mismatch(reader.position(), bytes.len()));
        }
        let computed = HEADER_LEN + payload.calculate_len();
        if computed != declared {
            return Err(CodecError::length_mismatch(declared, computed));
        }
        Ok(Self {
            message_type: header.message_type,
            version: header.version,
            session_id: header.session_id,
            sequence_id: header.sequence_id,
            error_no: header.error_no,
            payload,
        })
    }
}
