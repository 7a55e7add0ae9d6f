//! Caller-visible sync operations and per-device status.

use crate::error::SyncError;
use crate::task_pool::TaskPool;
use kvsync_protocol::SyncMode;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;
use tracing::debug;

/// Outcome of an operation for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    /// Queued behind other work for the device.
    Waiting,
    /// The device's pipeline is running this operation.
    Running,
    /// Completed successfully.
    Finished,
    /// Transport failure, timeout, negative ack or cancellation.
    Failed,
    /// The permission gate refused the device.
    PermissionCheckFailed,
    /// Schemas cannot exchange data.
    SchemaIncompatible,
    /// Security labels forbid this direction.
    SecurityOptionCheckFailure,
}

impl SyncStatus {
    /// Returns true once no further change is expected.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncStatus::Waiting | SyncStatus::Running)
    }

    /// Status reported for a pipeline that ended with `error`.
    pub fn from_error(error: &SyncError) -> Self {
        match error {
            SyncError::SchemaMismatch { .. } => SyncStatus::SchemaIncompatible,
            SyncError::SecurityOptionCheck { .. } => SyncStatus::SecurityOptionCheckFailure,
            SyncError::PermissionDenied { .. } => SyncStatus::PermissionCheckFailed,
            _ => SyncStatus::Failed,
        }
    }
}

/// Per-device status map handed to completion callbacks.
pub type StatusMap = BTreeMap<String, SyncStatus>;

/// Invoked once with the final status map.
pub type CompleteCallback = Box<dyn FnOnce(&StatusMap) + Send>;

/// Invoked once after completion.
pub type FinalizeCallback = Box<dyn FnOnce() + Send>;

/// A sync request spanning one or more devices.
///
/// Completes when every device reached a terminal status. Completion runs,
/// in order: the caller's complete callback, the internal finished hook,
/// release of a blocked waiter, then the caller's finalize callback.
pub struct SyncOperation {
    id: u32,
    devices: Vec<String>,
    mode: SyncMode,
    wait: bool,
    statuses: Mutex<StatusMap>,
    finished: AtomicBool,
    on_complete: Mutex<Option<CompleteCallback>>,
    on_finished: Mutex<Option<FinalizeCallback>>,
    on_finalize: Mutex<Option<FinalizeCallback>>,
    waiter_tx: Mutex<Option<mpsc::Sender<StatusMap>>>,
    waiter_rx: Mutex<Option<mpsc::Receiver<StatusMap>>>,
    pool: Option<TaskPool>,
}

impl SyncOperation {
    /// Creates an operation with every device waiting. Repeated device ids
    /// collapse into the first occurrence.
    pub fn new(id: u32, devices: Vec<String>, mode: SyncMode, wait: bool) -> Self {
        let mut seen = HashSet::new();
        let devices: Vec<String> = devices
            .into_iter()
            .filter(|device| seen.insert(device.clone()))
            .collect();
        let statuses = devices
            .iter()
            .map(|device| (device.clone(), SyncStatus::Waiting))
            .collect();
        let (tx, rx) = mpsc::channel();
        Self {
            id,
            devices,
            mode,
            wait,
            statuses: Mutex::new(statuses),
            finished: AtomicBool::new(false),
            on_complete: Mutex::new(None),
            on_finished: Mutex::new(None),
            on_finalize: Mutex::new(None),
            waiter_tx: Mutex::new(Some(tx)),
            waiter_rx: Mutex::new(Some(rx)),
            pool: None,
        }
    }

    /// Runs completion callbacks on `pool` instead of the finishing thread.
    pub fn with_pool(mut self, pool: TaskPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Sets the caller's completion callback.
    pub fn set_on_complete(&self, callback: CompleteCallback) {
        *self.on_complete.lock() = Some(callback);
    }

    /// Sets the internal hook run right after the completion callback.
    pub fn set_on_finished(&self, callback: FinalizeCallback) {
        *self.on_finished.lock() = Some(callback);
    }

    /// Sets the caller's finalize callback.
    pub fn set_on_finalize(&self, callback: FinalizeCallback) {
        *self.on_finalize.lock() = Some(callback);
    }

    /// Operation id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Target devices.
    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    /// Sync mode.
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Returns true if the caller blocks until completion.
    pub fn is_wait(&self) -> bool {
        self.wait
    }

    /// Returns true for best-effort automatic syncs.
    pub fn is_auto_sync(&self) -> bool {
        self.mode.is_auto()
    }

    /// Snapshot of every device's status.
    pub fn statuses(&self) -> StatusMap {
        self.statuses.lock().clone()
    }

    /// Status of one device.
    pub fn status(&self, device: &str) -> Option<SyncStatus> {
        self.statuses.lock().get(device).copied()
    }

    /// Returns true once completion started.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Records a device's status.
    ///
    /// Terminal statuses are final; later updates for that device are
    /// ignored. Completes the operation when every device is terminal.
    pub fn set_status(&self, device: &str, status: SyncStatus) {
        let all_terminal = {
            let mut statuses = self.statuses.lock();
            match statuses.get_mut(device) {
                Some(current) if !current.is_terminal() => *current = status,
                _ => return,
            }
            statuses.values().all(SyncStatus::is_terminal)
        };
        debug!(sync_id = self.id, device, ?status, "device status updated");
        if all_terminal {
            self.finish();
        }
    }

    /// Fails every device that has not reached a terminal status.
    pub fn set_unfinished_failed(&self) {
        {
            let mut statuses = self.statuses.lock();
            for status in statuses.values_mut() {
                if !status.is_terminal() {
                    *status = SyncStatus::Failed;
                }
            }
        }
        self.finish();
    }

    fn finish(&self) {
        if self
            .finished
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let statuses = self.statuses();
        let on_complete = self.on_complete.lock().take();
        let on_finished = self.on_finished.lock().take();
        let waiter = self.waiter_tx.lock().take();
        let on_finalize = self.on_finalize.lock().take();
        let work = move || {
            if let Some(callback) = on_complete {
                callback(&statuses);
            }
            if let Some(hook) = on_finished {
                hook();
            }
            if let Some(waiter) = waiter {
                let _ = waiter.send(statuses);
            }
            if let Some(callback) = on_finalize {
                callback();
            }
        };
        match &self.pool {
            Some(pool) => pool.spawn(work),
            None => work(),
        }
    }

    /// Blocks until the operation completes and returns the final statuses.
    ///
    /// Returns `None` on timeout. Only the first caller waits; later
    /// callers get the current snapshot.
    pub fn wait_finished(&self, timeout: Option<Duration>) -> Option<StatusMap> {
        let Some(rx) = self.waiter_rx.lock().take() else {
            return Some(self.statuses());
        };
        match timeout {
            Some(timeout) => rx.recv_timeout(timeout).ok(),
            None => rx.recv().ok(),
        }
    }
}

impl std::fmt::Debug for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOperation")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("wait", &self.wait)
            .field("statuses", &*self.statuses.lock())
            .finish()
    }
}
