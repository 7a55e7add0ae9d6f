//! Collaborators shared by every context of one engine.

use crate::communicator::Communicator;
use crate::config::EngineConfig;
use crate::error::SyncResult;
use crate::metadata::Metadata;
use crate::permission::{CheckFlag, PermissionChecker};
use crate::storage::{StoreInfo, SyncStore};
use crate::task_pool::TaskPool;
use crate::time_helper::TimeHelper;
use kvsync_protocol::Message;
use std::sync::Arc;
use tracing::warn;

pub(crate) struct SyncEnv {
    pub(crate) config: EngineConfig,
    pub(crate) store: SyncStore,
    pub(crate) store_info: StoreInfo,
    pub(crate) communicator: Arc<dyn Communicator>,
    pub(crate) permission: Arc<dyn PermissionChecker>,
    pub(crate) metadata: Arc<Metadata>,
    pub(crate) time: Arc<TimeHelper>,
    pub(crate) pool: TaskPool,
}

impl SyncEnv {
    pub(crate) fn new(
        config: EngineConfig,
        store: SyncStore,
        communicator: Arc<dyn Communicator>,
        permission: Arc<dyn PermissionChecker>,
        pool: TaskPool,
    ) -> SyncResult<Self> {
        let metadata = Arc::new(Metadata::new(store.clone())?);
        let time = Arc::new(TimeHelper::new(store.clone(), metadata.clone())?);
        Ok(Self {
            config,
            store_info: store.base().store_info(),
            store,
            communicator,
            permission,
            metadata,
            time,
            pool,
        })
    }

    pub(crate) fn check_permission(&self, device: &str, flag: CheckFlag) -> bool {
        self.permission.check(&self.store_info, device, flag)
    }

    pub(crate) fn send(&self, device: &str, message: Message) -> SyncResult<()> {
        self.communicator
            .send_message(device, message, self.config.send_timeout)
    }

    /// Sends a reply; failures are only logged since the peer resends.
    pub(crate) fn send_reply(&self, device: &str, message: Message) {
        let session_id = message.session_id;
        let sequence_id = message.sequence_id;
        if let Err(error) = self.send(device, message) {
            warn!(device, session_id, sequence_id, %error, "failed to send reply");
        }
    }
}
