//! Clock offset negotiation.
//!
//! The initiator stamps its send time, the responder stamps receipt and
//! reply, and the initiator stamps the reply's arrival. The four values give
//! the remote clock's offset with the round trip split evenly.

use crate::context::{ContextInner, SyncTaskContext};
use crate::error::SyncError;
use crate::state_machine::{SyncEvent, SyncState};
use crate::time_helper::{calculate_offset, TICKS_PER_MILLISECOND};
use kvsync_protocol::{Message, Payload, SyncMode, TimeSyncPacket};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// A stored offset further than this from a rough estimate is replaced.
const MAX_TIME_OFFSET_NOISE: i64 = 1000 * TICKS_PER_MILLISECOND as i64;

impl SyncTaskContext {
    pub(crate) fn start_time_sync(self: &Arc<Self>, inner: &mut ContextInner) -> SyncEvent {
        if inner.mode() == Some(SyncMode::ResponsePull) {
            return SyncEvent::TimeSyncFinished;
        }
        let fresh = inner.time_sync.synced_at.is_some_and(|at| {
            at.elapsed() < self.env.config.time_sync_interval
        });
        if fresh && !inner.time_sync.stale {
            return SyncEvent::TimeSyncFinished;
        }
        let packet = TimeSyncPacket::request(self.env.time.now());
        match self.send_request(inner, Payload::TimeSync(packet)) {
            Ok(()) => SyncEvent::WaitAck,
            Err(error) => self.fail(inner, error),
        }
    }

    pub(crate) fn on_time_sync_ack(
        self: &Arc<Self>,
        inner: &mut ContextInner,
        message: &Message,
        packet: &TimeSyncPacket,
    ) -> SyncEvent {
        if self.take_ack(inner, message, SyncState::TimeSync).is_none() {
            return SyncEvent::WaitAck;
        }
        let mut packet = *packet;
        packet.source_time_end = self.env.time.now();
        if packet.source_time_begin > packet.source_time_end
            || packet.target_time_begin > packet.target_time_end
        {
            warn!(device = self.device(), ?packet, "time sync reply out of order");
            return self.fail(inner, SyncError::Protocol("invalid time sync reply".into()));
        }
        let offset = calculate_offset(
            packet.source_time_begin,
            packet.source_time_end,
            packet.target_time_begin,
            packet.target_time_end,
        );
        if let Err(error) = self.env.metadata.save_time_offset(self.device(), offset) {
            return self.fail(inner, error);
        }
        debug!(device = self.device(), offset, "time offset measured");
        inner.time_sync.synced_at = Some(Instant::now());
        inner.time_sync.stale = false;
        SyncEvent::TimeSyncFinished
    }

    /// Answers a peer's time sync request, in any state.
    ///
    /// Also keeps a rough offset for peers we never measured ourselves, so
    /// data they push can be mapped onto the local clock.
    pub(crate) fn respond_time_sync(
        &self,
        inner: &mut ContextInner,
        message: &Message,
        packet: &TimeSyncPacket,
    ) {
        let mut reply = *packet;
        reply.target_time_begin = self.env.time.now();
        if inner.time_sync.synced_at.is_none() {
            let rough = (i128::from(packet.source_time_begin)
                - i128::from(reply.target_time_begin))
            .clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64;
            match self.env.metadata.time_offset(self.device()) {
                Ok(stored) if (i128::from(stored) - i128::from(rough)).abs()
                    > i128::from(MAX_TIME_OFFSET_NOISE) =>
                {
                    if let Err(error) = self.env.metadata.save_time_offset(self.device(), rough) {
                        warn!(device = self.device(), %error, "failed to save time offset");
                    }
                }
                Ok(_) => {}
                Err(error) => warn!(device = self.device(), %error, "failed to read time offset"),
            }
        }
        reply.target_time_end = self.env.time.now();
        let response = Message::response(message.session_id, message.sequence_id, Payload::TimeSync(reply));
        self.env.send_reply(self.device(), response);
    }
}
