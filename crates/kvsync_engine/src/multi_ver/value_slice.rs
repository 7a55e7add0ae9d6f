use crate::context::{ContextInner, SyncTaskContext};
use crate::error::SyncError;
use crate::state_machine::{SyncEvent, SyncState};
use kvsync_protocol::{Message, Payload, StatusCode, ValueSliceHashPacket, ValueSlicePacket};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

impl SyncTaskContext {
    /// Requests the next missing slice, or stores the commit once none is left.
    pub(crate) fn next_value_slice(self: &Arc<Self>, inner: &mut ContextInner) -> SyncEvent {
        let Some(hash) = inner.multi_ver.pending_slices.front().copied() else {
            return match self.store_current_commit(inner) {
                Ok(()) => SyncEvent::ValueSliceFinished,
                Err(error) => self.fail(inner, error),
            };
        };
        let packet = ValueSliceHashPacket {
            err_code: StatusCode::Ok.to_code(),
            hash,
        };
        match self.send_request(inner, Payload::ValueSliceRequest(packet)) {
            Ok(()) => SyncEvent::WaitAck,
            Err(error) => self.fail(inner, error),
        }
    }

    pub(crate) fn on_value_slice_ack(
        self: &Arc<Self>,
        inner: &mut ContextInner,
        message: &Message,
        packet: &ValueSlicePacket,
    ) -> SyncEvent {
        if self
            .take_ack(inner, message, SyncState::ValueSliceSync)
            .is_none()
        {
            return SyncEvent::WaitAck;
        }
        let status = packet.status();
        if status != StatusCode::Ok {
            return self.on_multi_ver_refusal(inner, status, "value slice");
        }
        let Some(hash) = inner.multi_ver.pending_slices.pop_front() else {
            return self.fail(inner, SyncError::Protocol("no slice in flight".into()));
        };
        let digest: [u8; 32] = Sha256::digest(&packet.slice).into();
        if digest != hash {
            warn!(device = self.device(), "value slice does not match its hash");
            return self.fail(inner, SyncError::Protocol("value slice hash mismatch".into()));
        }
        let stored = self
            .multi_ver_store()
            .and_then(|store| store.put_value_slice(&hash, &packet.slice));
        if let Err(error) = stored {
            return self.fail(inner, error);
        }
        debug!(
            device = self.device(),
            bytes = packet.slice.len(),
            remaining = inner.multi_ver.pending_slices.len(),
            "value slice stored"
        );
        self.next_value_slice(inner)
    }

    pub(crate) fn respond_value_slice(
        &self,
        inner: &ContextInner,
        message: &Message,
        packet: &ValueSliceHashPacket,
    ) {
        let (status, slice) = match self.check_serve(inner, "value slice") {
            Err(code) => (code, Vec::new()),
            Ok(store) => match store.get_value_slice(&packet.hash) {
                Ok(Some(slice)) => (StatusCode::Ok, slice),
                Ok(None) => (StatusCode::NotFound, Vec::new()),
                Err(error) => {
                    warn!(device = self.device(), %error, "failed to read value slice");
                    (error.to_status(), Vec::new())
                }
            },
        };
        let ack = ValueSlicePacket {
            err_code: status.to_code(),
            slice,
        };
        self.reply(message, Payload::ValueSliceAck(ack));
    }
}
