//! Multi-version sync: commit history, commit entries and value slices.
//!
//! The puller reports its latest commit per device; the responder answers
//! with the commits the puller is missing. Each missing commit's entries are
//! then fetched one request at a time and any value slice they reference
//! that is not stored yet is fetched by hash. A commit is written only once
//! every slice it references is present.

mod commit_data;
mod commit_history;
mod value_slice;

use crate::context::{ContextInner, SyncTaskContext};
use crate::error::{SyncError, SyncResult};
use crate::permission::CheckFlag;
use crate::state_machine::SyncEvent;
use crate::storage::MultiVerStorage;
use kvsync_protocol::{Message, MultiVerEntry, Payload, StatusCode, ValueSliceHash};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Unique slice hashes referenced by `entries`, in first-reference order,
/// that `is_stored` does not know.
pub(crate) fn missing_slices(
    entries: &[MultiVerEntry],
    mut is_stored: impl FnMut(&ValueSliceHash) -> SyncResult<bool>,
) -> SyncResult<Vec<ValueSliceHash>> {
    let mut seen = HashSet::new();
    let mut missing = Vec::new();
    for hash in entries.iter().flat_map(|entry| entry.slices.iter()) {
        if seen.insert(*hash) && !is_stored(hash)? {
            missing.push(*hash);
        }
    }
    Ok(missing)
}

impl SyncTaskContext {
    fn multi_ver_store(&self) -> SyncResult<&Arc<dyn MultiVerStorage>> {
        self.env
            .store
            .as_multi_ver()
            .ok_or_else(|| SyncError::Protocol("operation needs a multi-version store".into()))
    }

    /// Shared gate for the multi-version responders, which only serve data
    /// to devices that passed ability sync.
    fn check_serve(
        &self,
        inner: &ContextInner,
        kind: &str,
    ) -> Result<&Arc<dyn MultiVerStorage>, StatusCode> {
        if !self.env.check_permission(self.device(), CheckFlag::Send) {
            warn!(device = self.device(), kind, "multi-version request not permitted");
            return Err(StatusCode::NotPermit);
        }
        if inner.ability.is_none() {
            info!(device = self.device(), kind, "multi-version request before ability sync");
            return Err(StatusCode::NeedAbilitySync);
        }
        self.multi_ver_store().map_err(|error| {
            warn!(device = self.device(), kind, %error, "cannot serve multi-version request");
            StatusCode::InternalError
        })
    }

    /// Maps a peer's refusal of a multi-version request onto the next event.
    fn on_multi_ver_refusal(
        self: &Arc<Self>,
        inner: &mut ContextInner,
        status: StatusCode,
        kind: &str,
    ) -> SyncEvent {
        if status == StatusCode::NeedAbilitySync {
            info!(device = self.device(), kind, "peer needs ability sync");
            inner.ability = None;
            return SyncEvent::NeedAbilitySync;
        }
        warn!(device = self.device(), ?status, kind, "multi-version request rejected by peer");
        self.reject(inner, SyncError::from_status(status, self.device()))
    }

    fn reply(&self, request: &Message, payload: Payload) {
        let response = Message::response(request.session_id, request.sequence_id, payload);
        self.env.send_reply(self.device(), response);
    }
}
