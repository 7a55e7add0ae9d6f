use crate::context::{ContextInner, MultiVerState, SyncTaskContext};
use crate::state_machine::{SyncEvent, SyncState};
use kvsync_protocol::{
    CommitHistoryAckPacket, CommitHistoryRequestPacket, Message, Payload, StatusCode,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

impl SyncTaskContext {
    pub(crate) fn start_commit_history(self: &Arc<Self>, inner: &mut ContextInner) -> SyncEvent {
        let latest = self
            .multi_ver_store()
            .and_then(|store| store.latest_commits());
        let latest_commits = match latest {
            Ok(latest) => latest,
            Err(error) => return self.fail(inner, error),
        };
        inner.multi_ver = MultiVerState::default();
        debug!(device = self.device(), heads = latest_commits.len(), "commit history sync started");
        let packet = CommitHistoryRequestPacket { latest_commits };
        match self.send_request(inner, Payload::CommitHistoryRequest(packet)) {
            Ok(()) => SyncEvent::WaitAck,
            Err(error) => self.fail(inner, error),
        }
    }

    /// Queues every reported commit that is not stored yet.
    pub(crate) fn on_commit_history_ack(
        self: &Arc<Self>,
        inner: &mut ContextInner,
        message: &Message,
        packet: &CommitHistoryAckPacket,
    ) -> SyncEvent {
        if self
            .take_ack(inner, message, SyncState::CommitHistorySync)
            .is_none()
        {
            return SyncEvent::WaitAck;
        }
        let status = packet.status();
        if status != StatusCode::Ok {
            return self.on_multi_ver_refusal(inner, status, "commit history");
        }
        let store = match self.multi_ver_store() {
            Ok(store) => store.clone(),
            Err(error) => return self.fail(inner, error),
        };
        for commit in &packet.commits {
            match store.is_commit_existed(&commit.commit_id) {
                Ok(true) => {}
                Ok(false) => inner.multi_ver.pending_commits.push_back(commit.clone()),
                Err(error) => return self.fail(inner, error),
            }
        }
        info!(
            device = self.device(),
            reported = packet.commits.len(),
            missing = inner.multi_ver.pending_commits.len(),
            "commit history compared"
        );
        SyncEvent::CommitHistoryFinished
    }

    pub(crate) fn respond_commit_history(
        &self,
        inner: &ContextInner,
        message: &Message,
        packet: &CommitHistoryRequestPacket,
    ) {
        let ack = match self.check_serve(inner, "commit history") {
            Err(code) => CommitHistoryAckPacket {
                err_code: code.to_code(),
                commits: Vec::new(),
            },
            Ok(store) => match store.commit_tree(&packet.latest_commits) {
                Ok(commits) => {
                    debug!(device = self.device(), commits = commits.len(), "serving commit history");
                    CommitHistoryAckPacket {
                        err_code: StatusCode::Ok.to_code(),
                        commits,
                    }
                }
                Err(error) => {
                    warn!(device = self.device(), %error, "failed to compute commit tree");
                    CommitHistoryAckPacket {
                        err_code: error.to_status().to_code(),
                        commits: Vec::new(),
                    }
                }
            },
        };
        self.reply(message, Payload::CommitHistoryAck(ack));
    }
}
