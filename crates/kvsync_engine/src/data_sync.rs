//! Watermark-driven exchange of single-version entries.
//!
//! The sender reads entries above the peer's acknowledged local watermark
//! and at or below a snapshot bound, pages them under the transfer unit and
//! sends one packet at a time, waiting for each ack before the next. On a
//! missing ack the exact packet is resent, so a receiver can recognize it by
//! `(session, sequence)` and re-ack without applying twice.
//!
//! Pulls invert the roles: the puller sends an empty request carrying its
//! peer watermark and the responder queues a response pull target that
//! streams its entries back in the puller's session.

use crate::context::{ContextInner, SyncTarget, SyncTaskContext};
use crate::error::{SyncError, SyncResult};
use crate::permission::CheckFlag;
use crate::state_machine::{DataPhase, SyncEvent, SyncState};
use kvsync_protocol::{
    DataAckPacket, DataItem, DataRequestPacket, Message, Packet, Payload, StatusCode, SyncMode,
    HEADER_LEN,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

impl SyncTaskContext {
    pub(crate) fn start_data_send(self: &Arc<Self>, inner: &mut ContextInner) -> SyncEvent {
        let Some(active) = inner.active.as_ref() else {
            return SyncEvent::InnerError;
        };
        let begin = match active.target.mode {
            SyncMode::ResponsePull => Ok(active.target.begin_watermark),
            _ => self.env.metadata.local_watermark(self.device()),
        };
        let bounds = begin.and_then(|begin| Ok((begin, self.env.store.base().max_timestamp()?)));
        match bounds {
            Ok((begin, end)) => {
                debug!(device = self.device(), begin, end, "data send started");
                inner.send.begin = begin;
                inner.send.end = end;
                inner.send.watermark_resets = 0;
                self.send_next_batch(inner)
            }
            Err(error) => self.fail(inner, error),
        }
    }

    fn send_next_batch(self: &Arc<Self>, inner: &mut ContextInner) -> SyncEvent {
        match self.try_send_next_batch(inner) {
            Ok(()) => SyncEvent::WaitAck,
            Err(error) => self.fail(inner, error),
        }
    }

    fn try_send_next_batch(self: &Arc<Self>, inner: &mut ContextInner) -> SyncResult<()> {
        let mode = inner
            .mode()
            .ok_or_else(|| SyncError::Protocol("no running target".into()))?;
        let store = self
            .env
            .store
            .as_single_ver()
            .ok_or_else(|| SyncError::Protocol("data sync needs a single-version store".into()))?;
        let mut packet = DataRequestPacket::new(mode);
        let mtu = self
            .env
            .communicator
            .mtu_size(self.device())
            .min(self.env.config.max_packet_size);
        let budget = mtu.saturating_sub(HEADER_LEN + packet.calculate_len());
        let batch = store.get_sync_data(inner.send.begin, inner.send.end, budget)?;

        inner.send.last = !batch.has_more;
        inner.send.batch_max = if inner.send.last {
            inner.send.end.max(inner.send.begin)
        } else {
            batch
                .items
                .iter()
                .map(|item| item.timestamp)
                .max()
                .unwrap_or(inner.send.begin)
        };
        // entries the peer wrote itself never travel back to it
        let read = batch.items.len();
        packet.data = batch
            .items
            .into_iter()
            .filter(|item| item.origin_device != self.device())
            .collect();
        packet.end_watermark = inner.send.batch_max;
        packet.local_watermark = inner.send.begin;
        packet.peer_watermark = self.env.metadata.peer_watermark(self.device())?;
        if inner.send.last {
            packet.set_last_sequence();
        }
        debug!(
            device = self.device(),
            entries = packet.data.len(),
            skipped = read - packet.data.len(),
            begin = inner.send.begin,
            batch_max = inner.send.batch_max,
            last = inner.send.last,
            "sending data batch"
        );
        self.send_request(inner, Payload::DataRequest(packet))
    }

    pub(crate) fn start_data_receive(self: &Arc<Self>, inner: &mut ContextInner) -> SyncEvent {
        if inner.recv_finished {
            return SyncEvent::RecvFinished;
        }
        match inner.mode() {
            Some(mode @ (SyncMode::Pull | SyncMode::AutoPull)) => {
                let mut packet = DataRequestPacket::new(mode);
                packet.set_last_sequence();
                packet.peer_watermark = match self.env.metadata.peer_watermark(self.device()) {
                    Ok(watermark) => watermark,
                    Err(error) => return self.fail(inner, error),
                };
                match self.send_request(inner, Payload::DataRequest(packet)) {
                    Ok(()) => SyncEvent::WaitAck,
                    Err(error) => self.fail(inner, error),
                }
            }
            Some(_) => {
                // push and pull: the peer answers our last packet on its own
                inner.attempts = 1;
                self.arm_timer(inner, self.env.config.response_timeout);
                SyncEvent::WaitAck
            }
            None => SyncEvent::InnerError,
        }
    }

    pub(crate) fn on_data_ack(
        self: &Arc<Self>,
        inner: &mut ContextInner,
        message: &Message,
        ack: &DataAckPacket,
    ) -> SyncEvent {
        let expected = match inner.state {
            state @ SyncState::DataSync(_) => state,
            state => {
                debug!(device = self.device(), %state, "data ack outside data sync");
                return SyncEvent::WaitAck;
            }
        };
        let Some(outbound) = self.take_ack(inner, message, expected) else {
            return SyncEvent::WaitAck;
        };
        let status = ack.status();
        match status {
            StatusCode::Ok if expected == SyncState::DataSync(DataPhase::Receiving) => {
                // pull request accepted; wait for the entries
                inner.attempts = 1;
                self.arm_timer(inner, self.env.config.response_timeout);
                SyncEvent::WaitAck
            }
            StatusCode::Ok => {
                let saved = self
                    .env
                    .metadata
                    .save_local_watermark(self.device(), inner.send.batch_max);
                if let Err(error) = saved {
                    return self.fail(inner, error);
                }
                if !inner.send.last {
                    inner.send.begin = inner.send.batch_max;
                    return self.send_next_batch(inner);
                }
                match inner.mode() {
                    Some(SyncMode::PushAndPull) => SyncEvent::StartDataReceive,
                    _ => SyncEvent::SendFinished,
                }
            }
            StatusCode::LocalWatermarkNotInit => {
                inner.send.watermark_resets += 1;
                if inner.send.watermark_resets > self.env.config.retry.max_attempts {
                    return self.reject(inner, SyncError::Rejected { code: status });
                }
                info!(device = self.device(), watermark = ack.data, "peer lost watermark, resending");
                if let Err(error) = self.env.metadata.reset_local_watermark(self.device(), ack.data) {
                    return self.fail(inner, error);
                }
                inner.send.begin = ack.data;
                self.send_next_batch(inner)
            }
            StatusCode::SaveDataNotify => {
                let delay = Duration::from_millis(ack.data).min(self.env.config.max_save_notify_delay);
                debug!(device = self.device(), ?delay, "peer busy, resending later");
                inner.outbound = Some(outbound);
                self.arm_timer(inner, delay);
                SyncEvent::WaitAck
            }
            StatusCode::NeedAbilitySync => {
                info!(device = self.device(), "peer needs ability sync");
                inner.ability = None;
                SyncEvent::NeedAbilitySync
            }
            code => {
                warn!(device = self.device(), ?code, "data rejected by peer");
                self.reject(inner, SyncError::from_status(code, self.device()))
            }
        }
    }

    /// Handles an inbound data packet, in any state.
    pub(crate) fn on_data_request(
        self: &Arc<Self>,
        inner: &mut ContextInner,
        message: &Message,
        packet: &DataRequestPacket,
    ) -> SyncEvent {
        let (session_id, sequence_id) = (message.session_id, message.sequence_id);
        let flag = CheckFlag::for_remote_mode(packet.mode);
        if !self.env.check_permission(self.device(), flag) {
            warn!(device = self.device(), ?flag, "data request not permitted");
            self.reply_data_ack(message, DataAckPacket::new(StatusCode::NotPermit, 0));
            return SyncEvent::WaitAck;
        }
        if inner.ability.is_none() {
            self.reply_data_ack(message, DataAckPacket::new(StatusCode::NeedAbilitySync, 0));
            return SyncEvent::WaitAck;
        }
        if inner.recv.last_session == session_id && inner.recv.last_sequence == sequence_id {
            if let Some(ack) = inner.recv.last_ack {
                debug!(device = self.device(), session_id, sequence_id, "duplicate data packet");
                self.reply_data_ack(message, ack);
                return SyncEvent::WaitAck;
            }
        }

        let ack = self.apply_data_packet(packet);
        self.reply_data_ack(message, ack);
        if ack.status() != StatusCode::Ok {
            return SyncEvent::WaitAck;
        }
        inner.recv.last_session = session_id;
        inner.recv.last_sequence = sequence_id;
        inner.recv.last_ack = Some(ack);

        let own_session = inner.session_id() == Some(session_id)
            && inner.mode().is_some_and(|mode| mode.receives_data());
        if own_session {
            if packet.is_last_sequence() {
                inner.recv_finished = true;
            }
            if inner.state == SyncState::DataSync(DataPhase::Receiving) {
                if inner.recv_finished {
                    return SyncEvent::RecvFinished;
                }
                inner.attempts = 1;
                self.arm_timer(inner, self.env.config.response_timeout);
            }
        } else if matches!(packet.mode, SyncMode::Pull | SyncMode::AutoPull)
            || (packet.mode == SyncMode::PushAndPull && packet.is_last_sequence())
        {
            self.enqueue_response_pull(inner, session_id, packet.peer_watermark);
        }
        SyncEvent::WaitAck
    }

    /// Applies a packet's entries and builds the ack.
    fn apply_data_packet(&self, packet: &DataRequestPacket) -> DataAckPacket {
        match self.try_apply_data_packet(packet) {
            Ok(ack) => ack,
            Err(SyncError::Busy(reason)) => {
                debug!(device = self.device(), %reason, "store busy, asking sender to wait");
                let delay = self.env.config.save_notify_delay.as_millis() as u64;
                DataAckPacket::new(StatusCode::SaveDataNotify, delay)
            }
            Err(error) => {
                warn!(device = self.device(), %error, "failed to apply data");
                DataAckPacket::new(StatusCode::InternalError, 0)
            }
        }
    }

    fn try_apply_data_packet(&self, packet: &DataRequestPacket) -> SyncResult<DataAckPacket> {
        let device = self.device();
        let peer_watermark = self.env.metadata.peer_watermark(device)?;
        if packet.local_watermark > peer_watermark {
            info!(
                device,
                packet_watermark = packet.local_watermark,
                peer_watermark,
                "sender is ahead of our watermark"
            );
            return Ok(DataAckPacket::new(StatusCode::LocalWatermarkNotInit, peer_watermark));
        }
        let covered = packet.covered_watermark();
        if !packet.data.is_empty() {
            let store = self
                .env
                .store
                .as_single_ver()
                .ok_or_else(|| SyncError::Protocol("data sync needs a single-version store".into()))?;
            let offset = self.env.metadata.time_offset(device)?;
            let items: Vec<DataItem> = packet
                .data
                .iter()
                .map(|item| {
                    let mut item = item.clone();
                    // the write time stays in the writer's clock so every
                    // replica settles conflicts on the same value
                    item.timestamp = self.env.time.to_local(item.timestamp, offset);
                    if item.origin_device.is_empty() {
                        item.origin_device = device.to_string();
                    }
                    item
                })
                .collect();
            store.put_sync_data(&items, device)?;
            debug!(device, entries = items.len(), covered, "data applied");
        }
        self.env.metadata.save_peer_watermark(device, covered)?;
        Ok(DataAckPacket::new(
            StatusCode::Ok,
            self.env.metadata.peer_watermark(device)?,
        ))
    }

    fn reply_data_ack(&self, message: &Message, ack: DataAckPacket) {
        let response = Message::response(message.session_id, message.sequence_id, Payload::DataAck(ack));
        self.env.send_reply(self.device(), response);
    }

    fn enqueue_response_pull(self: &Arc<Self>, inner: &mut ContextInner, session_id: u32, begin: u64) {
        let duplicate = inner
            .active
            .as_ref()
            .is_some_and(|active| active.target.response_session == session_id)
            || inner
                .targets
                .iter()
                .any(|target| target.response_session == session_id);
        if duplicate {
            return;
        }
        debug!(device = self.device(), session_id, begin, "response pull queued");
        inner
            .targets
            .push_back(SyncTarget::response_pull(session_id, begin));
        self.schedule_exec();
    }
}

#[cfg(test)]
mod tests {
    use crate::context::tests::{fixture, wait_until, Fixture};
    use crate::context::SyncTaskContext;
    use crate::config::EngineConfig;
    use crate::storage::SingleVerStorage;
    use kvsync_protocol::{
        AbilitySyncRequestPacket, DataAckPacket, DataItem, DataRequestPacket, Message, Payload,
        SecurityOption, StatusCode, SyncMode, PROTOCOL_VERSION_CURRENT,
    };
    use std::sync::Arc;

    fn negotiated(fx: &Fixture) -> Arc<SyncTaskContext> {
        let context = SyncTaskContext::new("peer", fx.env.clone());
        let request = AbilitySyncRequestPacket {
            protocol_version: PROTOCOL_VERSION_CURRENT,
            send_code: 0,
            software_version: 3,
            schema: String::new(),
            security: SecurityOption::default(),
            schema_type: 0,
            mode: SyncMode::PushAndPull,
        };
        context.receive_message(Message::request(1, 1, Payload::AbilityRequest(request)));
        fx.comm.take_sent();
        context
    }

    fn push_packet(items: Vec<DataItem>, local_watermark: u64) -> DataRequestPacket {
        let mut packet = DataRequestPacket::new(SyncMode::Push);
        packet.data = items;
        packet.local_watermark = local_watermark;
        packet.set_last_sequence();
        packet
    }

    fn acks(fx: &Fixture) -> Vec<DataAckPacket> {
        fx.comm
            .take_sent()
            .into_iter()
            .filter_map(|(_, message)| match message.payload {
                Payload::DataAck(ack) => Some(ack),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn unknown_peer_must_negotiate_first() {
        let fx = fixture(EngineConfig::default());
        let context = SyncTaskContext::new("peer", fx.env.clone());
        let packet = push_packet(vec![DataItem::put(b"k".to_vec(), b"v".to_vec(), 10)], 0);
        context.receive_message(Message::request(5, 1, Payload::DataRequest(packet)));
        assert_eq!(acks(&fx)[0].status(), StatusCode::NeedAbilitySync);
        assert!(fx.store.is_empty());
    }

    #[test]
    fn applies_once_and_reacks_duplicates() {
        let fx = fixture(EngineConfig::default());
        let context = negotiated(&fx);
        let packet = push_packet(vec![DataItem::put(b"k".to_vec(), b"v".to_vec(), 10)], 0);
        let message = Message::request(5, 1, Payload::DataRequest(packet));
        context.receive_message(message.clone());
        context.receive_message(message);

        let acks = acks(&fx);
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[0], acks[1]);
        assert_eq!(acks[0].status(), StatusCode::Ok);
        assert_eq!(acks[0].data, 10);
        assert_eq!(fx.store.received_items(), 1);
        assert_eq!(fx.store.get(b"k"), Some(b"v".to_vec()));
        assert_eq!(fx.env.metadata.peer_watermark("peer").unwrap(), 10);
    }

    #[test]
    fn origin_defaults_to_sender() {
        let fx = fixture(EngineConfig::default());
        let context = negotiated(&fx);
        let packet = push_packet(vec![DataItem::put(b"k".to_vec(), b"v".to_vec(), 10)], 0);
        context.receive_message(Message::request(5, 1, Payload::DataRequest(packet)));
        fx.store.remove_device_data("peer").unwrap();
        assert!(fx.store.get(b"k").is_none());
    }

    #[test]
    fn sender_ahead_of_watermark_is_told_to_reset() {
        let fx = fixture(EngineConfig::default());
        let context = negotiated(&fx);
        let packet = push_packet(vec![DataItem::put(b"k".to_vec(), b"v".to_vec(), 90)], 50);
        context.receive_message(Message::request(5, 1, Payload::DataRequest(packet)));
        let ack = acks(&fx)[0];
        assert_eq!(ack.status(), StatusCode::LocalWatermarkNotInit);
        assert_eq!(ack.data, 0);
        assert!(fx.store.is_empty());
    }

    #[test]
    fn busy_store_asks_for_resend_without_caching() {
        let fx = fixture(EngineConfig::default());
        let context = negotiated(&fx);
        fx.store.fail_next_puts_busy(1);
        let packet = push_packet(vec![DataItem::put(b"k".to_vec(), b"v".to_vec(), 10)], 0);
        let message = Message::request(5, 1, Payload::DataRequest(packet));
        context.receive_message(message.clone());
        context.receive_message(message);
        let acks = acks(&fx);
        assert_eq!(acks[0].status(), StatusCode::SaveDataNotify);
        assert_eq!(acks[1].status(), StatusCode::Ok);
        assert!(fx.store.get(b"k").is_some());
    }

    #[test]
    fn pull_request_starts_a_response_in_the_pullers_session() {
        let fx = fixture(EngineConfig::default());
        fx.store.put(b"a".to_vec(), b"1".to_vec());
        let context = negotiated(&fx);
        let mut pull = DataRequestPacket::new(SyncMode::Pull);
        pull.set_last_sequence();
        context.receive_message(Message::request(77, 3, Payload::DataRequest(pull)));

        let mut response = None;
        wait_until(|| {
            for (_, message) in fx.comm.take_sent() {
                if let Payload::DataRequest(packet) = &message.payload {
                    response = Some((message.session_id, packet.clone()));
                }
            }
            response.is_some()
        });
        let (session_id, packet) = response.unwrap();
        assert_eq!(session_id, 77);
        assert_eq!(packet.mode, SyncMode::ResponsePull);
        assert!(packet.is_last_sequence());
        assert_eq!(packet.data.len(), 1);
        context.kill();
    }

    #[test]
    fn entries_from_the_puller_are_not_sent_back() {
        let fx = fixture(EngineConfig::default());
        let context = negotiated(&fx);
        let pushed = push_packet(vec![DataItem::put(b"theirs".to_vec(), b"1".to_vec(), 10)], 0);
        context.receive_message(Message::request(5, 1, Payload::DataRequest(pushed)));
        fx.store.put(b"ours".to_vec(), b"2".to_vec());
        fx.comm.take_sent();

        let mut pull = DataRequestPacket::new(SyncMode::Pull);
        pull.set_last_sequence();
        context.receive_message(Message::request(78, 1, Payload::DataRequest(pull)));
        let mut response = None;
        wait_until(|| {
            for (_, message) in fx.comm.take_sent() {
                if let Payload::DataRequest(packet) = message.payload {
                    response = Some(packet);
                }
            }
            response.is_some()
        });
        let packet = response.unwrap();
        let keys: Vec<&[u8]> = packet.data.iter().map(|item| item.key.as_slice()).collect();
        assert_eq!(keys, vec![b"ours".as_slice()]);
        context.kill();
    }

    #[test]
    fn empty_packet_still_advances_the_watermark() {
        let fx = fixture(EngineConfig::default());
        let context = negotiated(&fx);
        let mut skipped = DataRequestPacket::new(SyncMode::Push);
        skipped.end_watermark = 40;
        context.receive_message(Message::request(5, 1, Payload::DataRequest(skipped)));
        let next = push_packet(vec![DataItem::put(b"k".to_vec(), b"v".to_vec(), 55)], 40);
        context.receive_message(Message::request(5, 2, Payload::DataRequest(next)));

        let acks = acks(&fx);
        assert_eq!(acks.len(), 2);
        assert_eq!((acks[0].status(), acks[0].data), (StatusCode::Ok, 40));
        assert_eq!((acks[1].status(), acks[1].data), (StatusCode::Ok, 55));
        assert_eq!(fx.store.received_items(), 1);
    }
}
