//! Caller-facing sync API.

use crate::communicator::Communicator;
use crate::config::EngineConfig;
use crate::engine::{RemoteDataChangedCallback, SyncEngine};
use crate::error::{SyncError, SyncResult};
use crate::operation::{CompleteCallback, FinalizeCallback, StatusMap};
use crate::permission::PermissionChecker;
use crate::storage::SyncStore;
use crate::task_pool::TaskPool;
use kvsync_protocol::SyncMode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Parameters of one [`Syncer::sync`] call.
pub struct SyncRequest {
    devices: Vec<String>,
    mode: SyncMode,
    wait: bool,
    on_complete: Option<CompleteCallback>,
    on_finalize: Option<FinalizeCallback>,
}

impl SyncRequest {
    /// Creates a non-blocking request for `devices`.
    pub fn new(devices: Vec<String>, mode: SyncMode) -> Self {
        Self {
            devices,
            mode,
            wait: false,
            on_complete: None,
            on_finalize: None,
        }
    }

    /// Blocks [`Syncer::sync`] until every device reported.
    pub fn with_wait(mut self) -> Self {
        self.wait = true;
        self
    }

    /// Sets the callback that receives the final status map.
    pub fn with_on_complete(mut self, callback: impl FnOnce(&StatusMap) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Sets the callback run once the operation is released.
    pub fn with_on_finalize(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_finalize = Some(Box::new(callback));
        self
    }
}

impl std::fmt::Debug for SyncRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRequest")
            .field("devices", &self.devices)
            .field("mode", &self.mode)
            .field("wait", &self.wait)
            .finish()
    }
}

/// Synchronizes one local store with remote devices.
pub struct Syncer {
    engine: Arc<SyncEngine>,
    multi_ver: bool,
    queued: Arc<AtomicUsize>,
    queued_limit: AtomicUsize,
}

impl Syncer {
    /// Starts a sync engine for `store` on the runtime behind `pool`.
    pub fn new(
        config: EngineConfig,
        store: SyncStore,
        communicator: Arc<dyn Communicator>,
        permission: Arc<dyn PermissionChecker>,
        pool: TaskPool,
    ) -> SyncResult<Self> {
        let queued_limit = AtomicUsize::new(config.queued_sync_limit);
        let multi_ver = store.is_multi_ver();
        let engine = SyncEngine::new(config, store, communicator, permission, pool)?;
        Ok(Self {
            engine,
            multi_ver,
            queued: Arc::new(AtomicUsize::new(0)),
            queued_limit,
        })
    }

    /// Starts a sync and returns its id.
    ///
    /// Blocks until completion when the request waits. Non-blocking manual
    /// syncs count against the queued sync limit until they finish.
    pub fn sync(&self, request: SyncRequest) -> SyncResult<u32> {
        self.validate(&request)?;
        let SyncRequest {
            devices,
            mode,
            wait,
            on_complete,
            on_finalize,
        } = request;

        let counted = !wait && !mode.is_auto();
        if counted {
            let limit = self.queued_limit.load(Ordering::SeqCst);
            let admitted = self
                .queued
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                    (queued < limit).then_some(queued + 1)
                })
                .is_ok();
            if !admitted {
                return Err(SyncError::Busy(format!("{limit} syncs already queued")));
            }
        }

        let operation = Arc::new(self.engine.create_operation(devices, mode, wait));
        let queued = self.queued.clone();
        operation.set_on_complete(Box::new(move |statuses: &StatusMap| {
            if counted {
                queued.fetch_sub(1, Ordering::SeqCst);
            }
            if let Some(callback) = on_complete {
                callback(statuses);
            }
        }));
        if let Some(callback) = on_finalize {
            operation.set_on_finalize(callback);
        }

        let id = operation.id();
        if let Err(error) = self.engine.add_sync_operation(operation.clone()) {
            if counted {
                self.queued.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(error);
        }
        debug!(sync_id = id, ?mode, wait, "sync requested");
        if wait {
            operation.wait_finished(None);
        }
        Ok(id)
    }

    /// Runs a blocking sync and returns the per-device statuses.
    pub fn sync_and_wait(&self, devices: Vec<String>, mode: SyncMode) -> SyncResult<StatusMap> {
        let request = SyncRequest::new(devices, mode);
        self.validate(&request)?;
        let operation = Arc::new(self.engine.create_operation(request.devices, mode, true));
        self.engine.add_sync_operation(operation.clone())?;
        operation.wait_finished(None).ok_or(SyncError::Killed)
    }

    fn validate(&self, request: &SyncRequest) -> SyncResult<()> {
        if request.devices.is_empty() {
            return Err(SyncError::InvalidArgs("no target devices".into()));
        }
        if request.devices.iter().any(String::is_empty) {
            return Err(SyncError::InvalidArgs("empty device id".into()));
        }
        if !request.mode.is_caller_mode() {
            return Err(SyncError::InvalidArgs(format!(
                "{:?} cannot be requested",
                request.mode
            )));
        }
        if self.multi_ver && request.mode.sends_data() {
            return Err(SyncError::InvalidArgs(format!(
                "{:?} is not supported on a multi-version store",
                request.mode
            )));
        }
        Ok(())
    }

    /// Cancels a sync that has not finished yet.
    pub fn remove_sync_operation(&self, sync_id: u32) -> bool {
        self.engine.remove_sync_operation(sync_id)
    }

    /// Non-blocking manual syncs still running or queued.
    pub fn queued_sync_size(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Limit of non-blocking manual syncs.
    pub fn queued_sync_limit(&self) -> usize {
        self.queued_limit.load(Ordering::SeqCst)
    }

    /// Changes the limit of non-blocking manual syncs.
    pub fn set_queued_sync_limit(&self, limit: usize) {
        self.queued_limit.store(limit, Ordering::SeqCst);
    }

    /// Forgets sync progress with `device` and removes the entries it wrote.
    pub fn remove_device_data(&self, device: &str) -> SyncResult<()> {
        if device.is_empty() {
            return Err(SyncError::InvalidArgs("empty device id".into()));
        }
        self.engine.remove_device_data(device)
    }

    /// Online devices, sorted.
    pub fn online_devices(&self) -> Vec<String> {
        self.engine.online_devices()
    }

    /// Notifies online devices that local data changed.
    pub fn local_data_changed(&self) {
        self.engine.broadcast_data_changed();
    }

    /// Sets the callback run when a peer reports a change.
    pub fn set_remote_data_changed_callback(&self, callback: RemoteDataChangedCallback) {
        self.engine.set_remote_data_changed_callback(callback);
    }

    /// Applies a local wall-clock jump.
    pub fn on_local_time_changed(&self, delta_ms: i64) -> SyncResult<()> {
        self.engine.on_local_time_changed(delta_ms)
    }

    /// Underlying engine.
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Stops syncing; pending operations fail and waiters are released.
    pub fn close(&self) {
        info!("syncer closing");
        self.engine.close();
    }
}
