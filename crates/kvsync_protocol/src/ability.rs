//! Ability sync packets.

use crate::codes::{SecurityLabel, SecurityOption, StatusCode, SyncMode};
use crate::packet::Packet;
use kvsync_codec::{align8, string_len, CodecResult, ParcelReader, ParcelWriter, BOOL_LEN, U32_LEN};

/// Capability request sent before any data exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbilitySyncRequestPacket {
    /// Protocol version of the requester.
    pub protocol_version: u32,
    /// Status code (non-zero only for rejections sent as requests).
    pub send_code: i32,
    /// Software version of the requester.
    pub software_version: u32,
    /// Serialized schema of the requester's store.
    pub schema: String,
    /// Security option of the requester's store.
    pub security: SecurityOption,
    /// Schema encoding type.
    pub schema_type: u32,
    /// Mode the requester intends to run.
    pub mode: SyncMode,
}

impl Packet for AbilitySyncRequestPacket {
    fn calculate_len(&self) -> usize {
        align8(U32_LEN * 3 + string_len(&self.schema) + U32_LEN * 4)
    }

    fn serialize(&self, writer: &mut ParcelWriter) {
        writer.write_u32(self.protocol_version);
        writer.write_i32(self.send_code);
        writer.write_u32(self.software_version);
        writer.write_string(&self.schema);
        writer.write_i32(self.security.label.to_code());
        writer.write_i32(self.security.flag);
        writer.write_u32(self.schema_type);
        writer.write_i32(self.mode.to_code());
        writer.align8();
    }

    fn deserialize(reader: &mut ParcelReader<'_>) -> CodecResult<Self> {
        let protocol_version = reader.read_u32()?;
        let send_code = reader.read_i32()?;
        let software_version = reader.read_u32()?;
        let schema = reader.read_string()?;
        let label = SecurityLabel::decode(reader.read_i32()?)?;
        let flag = reader.read_i32()?;
        let schema_type = reader.read_u32()?;
        let mode = SyncMode::decode(reader.read_i32()?)?;
        reader.align8()?;
        Ok(Self {
            protocol_version,
            send_code,
            software_version,
            schema,
            security: SecurityOption::new(label, flag),
            schema_type,
            mode,
        })
    }
}

/// Answer to an [`AbilitySyncRequestPacket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbilitySyncAckPacket {
    /// Protocol version of the responder.
    pub protocol_version: u32,
    /// Software version of the responder.
    pub software_version: u32,
    /// Result code, see [`StatusCode`].
    pub ack_code: i32,
    /// Serialized schema of the responder's store.
    pub schema: String,
    /// Security option of the responder's store.
    pub security: SecurityOption,
    /// Schema encoding type.
    pub schema_type: u32,
    /// Whether the responder accepts the requester's data.
    pub permit_sync: bool,
    /// Whether the responder needs the requester to convert data.
    pub require_peer_convert: bool,
}

impl AbilitySyncAckPacket {
    /// Decoded ack code.
    pub fn status(&self) -> StatusCode {
        StatusCode::from_code(self.ack_code)
    }
}

impl Packet for AbilitySyncAckPacket {
    fn calculate_len(&self) -> usize {
        align8(U32_LEN * 3 + string_len(&self.schema) + U32_LEN * 3 + BOOL_LEN * 2)
    }

    fn serialize(&self, writer: &mut ParcelWriter) {
        writer.write_u32(self.protocol_version);
        writer.write_u32(self.software_version);
        writer.write_i32(self.ack_code);
        writer.write_string(&self.schema);
        writer.write_i32(self.security.label.to_code());
        writer.write_i32(self.security.flag);
        writer.write_u32(self.schema_type);
        writer.write_bool(self.permit_sync);
        writer.write_bool(self.require_peer_convert);
        writer.align8();
    }

    fn deserialize(reader: &mut ParcelReader<'_>) -> CodecResult<Self> {
        let protocol_version = reader.read_u32()?;
        let software_version = reader.read_u32()?;
        let ack_code = reader.read_i32()?;
        let schema = reader.read_string()?;
        let label = SecurityLabel::decode(reader.read_i32()?)?;
        let flag = reader.read_i32()?;
        let schema_type = reader.read_u32()?;
        let permit_sync = reader.read_bool()?;
        let require_peer_convert = reader.read_bool()?;
        reader.align8()?;
        Ok(Self {
            protocol_version,
            software_version,
            ack_code,
            schema,
            security: SecurityOption::new(label, flag),
            schema_type,
            permit_sync,
            require_peer_convert,
        })
    }
}
