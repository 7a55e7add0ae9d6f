//! Capability and security negotiation.
//!
//! One request/ack exchange decides whether data may flow. The requester
//! sends its versions, schema and security option; the responder checks its
//! permission gate, schema compatibility and the security direction, then
//! acks with its own values or a specific rejection code. Both sides cache
//! the outcome per device until the peer asks for a renegotiation or goes
//! offline.

use crate::context::{ContextInner, RemoteAbility, SyncTaskContext};
use crate::error::{SyncError, SyncResult};
use crate::permission::CheckFlag;
use crate::state_machine::{SyncEvent, SyncState};
use crate::storage::SyncInterface;
use kvsync_protocol::{
    AbilitySyncAckPacket, AbilitySyncRequestPacket, Message, Payload, SecurityOption, StatusCode,
    SyncMode, PROTOCOL_VERSION_CURRENT,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SCHEMA_TYPE_SINGLE_VER: u32 = 0;
const SCHEMA_TYPE_MULTI_VER: u32 = 1;

/// Checks whether `mode` may run against a peer with `remote` ability.
///
/// When local data flows out, the peer must accept our schema and our label
/// must not exceed the peer's. When peer data flows in, we must accept the
/// peer's schema and its label must not exceed ours.
pub(crate) fn evaluate_ability(
    mode: SyncMode,
    remote: &RemoteAbility,
    local: &dyn SyncInterface,
    device: &str,
) -> SyncResult<()> {
    let local_security = local.security_option();
    if mode.sends_data() {
        if !remote.permit_sync {
            return Err(SyncError::SchemaMismatch {
                device: device.to_string(),
            });
        }
        if !local_security.label.can_flow_to(remote.security.label) {
            return Err(SyncError::SecurityOptionCheck {
                device: device.to_string(),
            });
        }
    }
    if mode.receives_data() {
        if !local.check_schema_compatible(&remote.schema) {
            return Err(SyncError::SchemaMismatch {
                device: device.to_string(),
            });
        }
        if !remote.security.label.can_flow_to(local_security.label) {
            return Err(SyncError::SecurityOptionCheck {
                device: device.to_string(),
            });
        }
    }
    Ok(())
}

impl SyncTaskContext {
    fn schema_type(&self) -> u32 {
        if self.env.store.is_multi_ver() {
            SCHEMA_TYPE_MULTI_VER
        } else {
            SCHEMA_TYPE_SINGLE_VER
        }
    }

    /// Event that leaves ability sync once negotiation passed.
    fn route_after_ability(&self, mode: SyncMode) -> SyncEvent {
        if self.env.store.is_multi_ver() {
            SyncEvent::StartCommitHistory
        } else if mode.sends_data() {
            SyncEvent::StartDataSend
        } else {
            SyncEvent::StartDataReceive
        }
    }

    pub(crate) fn start_ability_sync(self: &Arc<Self>, inner: &mut ContextInner) -> SyncEvent {
        let Some(mode) = inner.mode() else {
            return SyncEvent::InnerError;
        };
        if let Some(remote) = &inner.ability {
            debug!(device = self.device(), "ability sync cached");
            return match evaluate_ability(mode, remote, self.env.store.base(), self.device()) {
                Ok(()) => self.route_after_ability(mode),
                Err(error) => self.reject(inner, error),
            };
        }
        let base = self.env.store.base();
        let packet = AbilitySyncRequestPacket {
            protocol_version: PROTOCOL_VERSION_CURRENT,
            send_code: StatusCode::Ok.to_code(),
            software_version: self.env.config.software_version,
            schema: base.schema(),
            security: base.security_option(),
            schema_type: self.schema_type(),
            mode,
        };
        match self.send_request(inner, Payload::AbilityRequest(packet)) {
            Ok(()) => SyncEvent::WaitAck,
            Err(error) => self.fail(inner, error),
        }
    }

    pub(crate) fn on_ability_ack(
        self: &Arc<Self>,
        inner: &mut ContextInner,
        message: &Message,
        packet: &AbilitySyncAckPacket,
    ) -> SyncEvent {
        if self.take_ack(inner, message, SyncState::AbilitySync).is_none() {
            return SyncEvent::WaitAck;
        }
        let Some(mode) = inner.mode() else {
            return SyncEvent::InnerError;
        };
        let status = packet.status();
        if status != StatusCode::Ok {
            warn!(device = self.device(), ?status, "ability sync rejected by peer");
            let error = match status {
                StatusCode::VersionNotSupport => SyncError::VersionNotSupported {
                    local: PROTOCOL_VERSION_CURRENT,
                    remote: packet.protocol_version,
                },
                code => SyncError::from_status(code, self.device()),
            };
            return self.reject(inner, error);
        }
        let remote = RemoteAbility {
            protocol_version: packet.protocol_version,
            software_version: packet.software_version,
            schema: packet.schema.clone(),
            security: packet.security,
            permit_sync: packet.permit_sync,
        };
        if let Err(error) = evaluate_ability(mode, &remote, self.env.store.base(), self.device()) {
            warn!(device = self.device(), %error, "ability check failed");
            return self.reject(inner, error);
        }
        info!(
            device = self.device(),
            protocol_version = remote.protocol_version,
            software_version = remote.software_version,
            peer_converts = packet.require_peer_convert,
            "ability sync finished"
        );
        inner.ability = Some(remote);
        self.route_after_ability(mode)
    }

    /// Answers a peer's ability request, in any state.
    pub(crate) fn respond_ability_sync(
        &self,
        inner: &mut ContextInner,
        message: &Message,
        request: &AbilitySyncRequestPacket,
    ) {
        let base = self.env.store.base();
        let local_security = base.security_option();
        let local_schema = base.schema();
        let permit_sync = base.check_schema_compatible(&request.schema);
        // a compatible but narrower schema means the requester's rows are widened on store
        let require_peer_convert = permit_sync && request.schema != local_schema;
        let code = self.check_ability_request(request, local_security, permit_sync);
        if code == StatusCode::Ok {
            inner.ability = Some(RemoteAbility {
                protocol_version: request.protocol_version,
                software_version: request.software_version,
                schema: request.schema.clone(),
                security: request.security,
                permit_sync: true,
            });
        } else {
            warn!(device = self.device(), ?code, mode = ?request.mode, "ability request refused");
        }
        let ack = AbilitySyncAckPacket {
            protocol_version: PROTOCOL_VERSION_CURRENT,
            software_version: self.env.config.software_version,
            ack_code: code.to_code(),
            schema: local_schema,
            security: local_security,
            schema_type: self.schema_type(),
            permit_sync,
            require_peer_convert,
        };
        let response = Message::response(
            message.session_id,
            message.sequence_id,
            Payload::AbilityAck(ack),
        );
        self.env.send_reply(self.device(), response);
    }

    fn check_ability_request(
        &self,
        request: &AbilitySyncRequestPacket,
        local_security: SecurityOption,
        permit_sync: bool,
    ) -> StatusCode {
        if !self
            .env
            .check_permission(self.device(), CheckFlag::for_remote_mode(request.mode))
        {
            return StatusCode::NotPermit;
        }
        if request.protocol_version < 1 {
            return StatusCode::VersionNotSupport;
        }
        if request.schema_type != self.schema_type() {
            return StatusCode::SchemaMismatch;
        }
        // the requester's data flows into this store
        if request.mode.sends_data() {
            if !permit_sync {
                return StatusCode::SchemaMismatch;
            }
            if !request.security.label.can_flow_to(local_security.label) {
                return StatusCode::SecurityOptionCheckError;
            }
        }
        if request.mode.receives_data() && !local_security.label.can_flow_to(request.security.label)
        {
            return StatusCode::SecurityOptionCheckError;
        }
        StatusCode::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::fixture;
    use crate::config::EngineConfig;
    use crate::memory::MemorySyncStore;
    use crate::storage::StoreInfo;
    use kvsync_protocol::SecurityLabel;
    use proptest::prelude::*;

    fn remote(label: SecurityLabel, schema: &str, permit_sync: bool) -> RemoteAbility {
        RemoteAbility {
            protocol_version: PROTOCOL_VERSION_CURRENT,
            software_version: 3,
            schema: schema.to_string(),
            security: SecurityOption::new(label, 0),
            permit_sync,
        }
    }

    fn local(label: SecurityLabel, schema: &str) -> MemorySyncStore {
        let store = MemorySyncStore::new(StoreInfo::new("u", "a", "s"));
        store.set_security_option(SecurityOption::new(label, 0));
        store.set_schema(schema);
        store
    }

    fn request(mode: SyncMode, label: SecurityLabel) -> AbilitySyncRequestPacket {
        AbilitySyncRequestPacket {
            protocol_version: PROTOCOL_VERSION_CURRENT,
            send_code: 0,
            software_version: 3,
            schema: String::new(),
            security: SecurityOption::new(label, 0),
            schema_type: SCHEMA_TYPE_SINGLE_VER,
            mode,
        }
    }

    #[test]
    fn schema_and_security_rejections_are_distinct() {
        let store = local(SecurityLabel::S2, "id;name");
        let wrong_schema = remote(SecurityLabel::S2, "id;email", true);
        assert!(matches!(
            evaluate_ability(SyncMode::Pull, &wrong_schema, &store, "d"),
            Err(SyncError::SchemaMismatch { .. })
        ));
        let higher = remote(SecurityLabel::S4, "id", true);
        assert!(matches!(
            evaluate_ability(SyncMode::Pull, &higher, &store, "d"),
            Err(SyncError::SecurityOptionCheck { .. })
        ));
        let refused = remote(SecurityLabel::S2, "id", false);
        assert!(matches!(
            evaluate_ability(SyncMode::Push, &refused, &store, "d"),
            Err(SyncError::SchemaMismatch { .. })
        ));
        assert!(evaluate_ability(SyncMode::PushAndPull, &remote(SecurityLabel::S2, "id", true), &store, "d").is_ok());
    }

    #[test]
    fn responder_caches_accepted_ability() {
        let fx = fixture(EngineConfig::default());
        let context = SyncTaskContext::new("peer", fx.env.clone());
        let message = Message::request(4, 2, Payload::AbilityRequest(request(SyncMode::Push, SecurityLabel::NotSet)));
        context.receive_message(message);
        let sent = fx.comm.take_sent();
        let Payload::AbilityAck(ack) = &sent[0].1.payload else {
            panic!("expected ability ack");
        };
        assert_eq!(ack.status(), StatusCode::Ok);
        assert!(ack.permit_sync);
        assert_eq!((sent[0].1.session_id, sent[0].1.sequence_id), (4, 2));
    }

    #[test]
    fn responder_flags_conversion_for_narrower_schema() {
        let fx = fixture(EngineConfig::default());
        fx.store.set_schema("id;name;email");
        let context = SyncTaskContext::new("peer", fx.env.clone());
        let mut narrower = request(SyncMode::Push, SecurityLabel::NotSet);
        narrower.schema = "id;name".to_string();
        context.receive_message(Message::request(1, 1, Payload::AbilityRequest(narrower)));
        let mut same = request(SyncMode::Push, SecurityLabel::NotSet);
        same.schema = "id;name;email".to_string();
        context.receive_message(Message::request(2, 1, Payload::AbilityRequest(same)));
        let flags: Vec<(StatusCode, bool, bool)> = fx
            .comm
            .take_sent()
            .iter()
            .map(|(_, message)| match &message.payload {
                Payload::AbilityAck(ack) => (ack.status(), ack.permit_sync, ack.require_peer_convert),
                other => panic!("unexpected payload {other:?}"),
            })
            .collect();
        assert_eq!(flags, vec![(StatusCode::Ok, true, true), (StatusCode::Ok, true, false)]);
    }

    #[test]
    fn responder_refuses_higher_label_push() {
        let fx = fixture(EngineConfig::default());
        fx.store.set_security_option(SecurityOption::new(SecurityLabel::S1, 0));
        let context = SyncTaskContext::new("peer", fx.env.clone());
        let message = Message::request(4, 1, Payload::AbilityRequest(request(SyncMode::Push, SecurityLabel::S3)));
        context.receive_message(message);
        let sent = fx.comm.take_sent();
        let Payload::AbilityAck(ack) = &sent[0].1.payload else {
            panic!("expected ability ack");
        };
        assert_eq!(ack.status(), StatusCode::SecurityOptionCheckError);
    }

    #[test]
    fn responder_refuses_old_protocol() {
        let fx = fixture(EngineConfig::default());
        let context = SyncTaskContext::new("peer", fx.env.clone());
        let mut packet = request(SyncMode::Pull, SecurityLabel::NotSet);
        packet.protocol_version = 0;
        context.receive_message(Message::request(1, 1, Payload::AbilityRequest(packet)));
        let sent = fx.comm.take_sent();
        let Payload::AbilityAck(ack) = &sent[0].1.payload else {
            panic!("expected ability ack");
        };
        assert_eq!(ack.status(), StatusCode::VersionNotSupport);
    }

    fn label() -> impl Strategy<Value = SecurityLabel> {
        prop::sample::select(SecurityLabel::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn lower_label_never_receives_from_higher(local_label in label(), remote_label in label()) {
            prop_assume!(local_label != SecurityLabel::NotSet && remote_label != SecurityLabel::NotSet);
            let store = local(local_label, "");
            let peer = remote(remote_label, "", true);
            let result = evaluate_ability(SyncMode::Pull, &peer, &store, "d");
            if local_label < remote_label {
                prop_assert!(
                    matches!(result, Err(SyncError::SecurityOptionCheck { .. })),
                    "expected security rejection, got {:?}",
                    result
                );
            } else {
                prop_assert!(result.is_ok());
            }
        }
    }
}
