use super::missing_slices;
use crate::context::{ContextInner, SyncTaskContext};
use crate::error::{SyncError, SyncResult};
use crate::state_machine::{SyncEvent, SyncState};
use kvsync_protocol::{
    Message, MultiVerAckPacket, MultiVerEntry, MultiVerRequestPacket, Payload, StatusCode,
};
use std::sync::Arc;
use tracing::{debug, warn};

impl SyncTaskContext {
    /// Requests the entries of the next missing commit.
    pub(crate) fn next_commit(self: &Arc<Self>, inner: &mut ContextInner) -> SyncEvent {
        let Some(commit) = inner.multi_ver.pending_commits.pop_front() else {
            return SyncEvent::MultiVerFinished;
        };
        debug!(device = self.device(), version = commit.version, "fetching commit");
        inner.multi_ver.current = Some(commit.clone());
        inner.multi_ver.entries.clear();
        inner.multi_ver.pending_slices.clear();
        let packet = MultiVerRequestPacket {
            err_code: StatusCode::Ok.to_code(),
            commit,
        };
        match self.send_request(inner, Payload::MultiVerRequest(packet)) {
            Ok(()) => SyncEvent::WaitAck,
            Err(error) => self.fail(inner, error),
        }
    }

    pub(crate) fn on_multi_ver_ack(
        self: &Arc<Self>,
        inner: &mut ContextInner,
        message: &Message,
        packet: &MultiVerAckPacket,
    ) -> SyncEvent {
        if self
            .take_ack(inner, message, SyncState::MultiVerDataSync)
            .is_none()
        {
            return SyncEvent::WaitAck;
        }
        let status = packet.status();
        if status != StatusCode::Ok {
            return self.on_multi_ver_refusal(inner, status, "commit entries");
        }
        match self.stage_commit_entries(inner, packet) {
            Ok(true) => SyncEvent::CommitEntriesReceived,
            Ok(false) => match self.store_current_commit(inner) {
                Ok(()) => self.next_commit(inner),
                Err(error) => self.fail(inner, error),
            },
            Err(error) => self.fail(inner, error),
        }
    }

    /// Converts the entries to local time and records the slices to fetch.
    /// Returns true if any slice is missing.
    fn stage_commit_entries(
        &self,
        inner: &mut ContextInner,
        packet: &MultiVerAckPacket,
    ) -> SyncResult<bool> {
        let store = self.multi_ver_store()?;
        let offset = self.env.metadata.time_offset(self.device())?;
        let entries: Vec<MultiVerEntry> = packet
            .entries
            .iter()
            .map(|entry| MultiVerEntry {
                timestamp: self.env.time.to_local(entry.timestamp, offset),
                ..entry.clone()
            })
            .collect();
        let missing = missing_slices(&entries, |hash| store.is_value_slice_existed(hash))?;
        debug!(
            device = self.device(),
            entries = entries.len(),
            missing_slices = missing.len(),
            "commit entries received"
        );
        inner.multi_ver.entries = entries;
        inner.multi_ver.pending_slices = missing.into();
        Ok(!inner.multi_ver.pending_slices.is_empty())
    }

    pub(crate) fn store_current_commit(&self, inner: &mut ContextInner) -> SyncResult<()> {
        let commit = inner
            .multi_ver
            .current
            .take()
            .ok_or_else(|| SyncError::Protocol("no commit in flight".into()))?;
        let entries = std::mem::take(&mut inner.multi_ver.entries);
        self.multi_ver_store()?
            .put_commit_data(&commit, &entries, self.device())?;
        debug!(device = self.device(), version = commit.version, "commit stored");
        Ok(())
    }

    pub(crate) fn respond_multi_ver_data(
        &self,
        inner: &ContextInner,
        message: &Message,
        packet: &MultiVerRequestPacket,
    ) {
        let (status, entries) = match self.check_serve(inner, "commit entries") {
            Err(code) => (code, Vec::new()),
            Ok(store) => match store.commit_data(&packet.commit.commit_id) {
                Ok(entries) => (StatusCode::Ok, entries),
                Err(error) => {
                    warn!(device = self.device(), %error, "failed to read commit entries");
                    (error.to_status(), Vec::new())
                }
            },
        };
        let ack = MultiVerAckPacket {
            err_code: status.to_code(),
            entries,
        };
        self.reply(message, Payload::MultiVerAck(ack));
    }
}
