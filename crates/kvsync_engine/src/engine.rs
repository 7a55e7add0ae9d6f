//! Entry point for sync operations and inbound messages of one store.

use crate::communicator::Communicator;
use crate::config::EngineConfig;
use crate::context::{SyncTarget, SyncTaskContext};
use crate::device_manager::DeviceManager;
use crate::env::SyncEnv;
use crate::error::{SyncError, SyncResult};
use crate::operation::{SyncOperation, SyncStatus};
use crate::permission::{CheckFlag, PermissionChecker};
use crate::queue::{Admission, MessageQueue, QueuedMessage};
use crate::storage::SyncStore;
use crate::task_pool::TaskPool;
use kvsync_protocol::{
    AbilitySyncAckPacket, CommitHistoryAckPacket, DataAckPacket, Message, MessageType,
    MultiVerAckPacket, Payload, SecurityOption, StatusCode, SyncMode, ValueSlicePacket,
    PROTOCOL_VERSION_CURRENT,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Invoked with the device id when an online peer reports a local change.
pub type RemoteDataChangedCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Routes operations to per-device contexts and dispatches inbound
/// messages through the budgeted queue.
pub struct SyncEngine {
    env: Arc<SyncEnv>,
    contexts: Mutex<HashMap<String, Arc<SyncTaskContext>>>,
    operations: Mutex<HashMap<u32, Arc<SyncOperation>>>,
    devices: DeviceManager,
    queue: MessageQueue,
    next_sync_id: AtomicU32,
    killed: AtomicBool,
    remote_data_changed: RwLock<Option<RemoteDataChangedCallback>>,
}

impl SyncEngine {
    /// Creates an engine and registers it with `communicator`.
    pub fn new(
        config: EngineConfig,
        store: SyncStore,
        communicator: Arc<dyn Communicator>,
        permission: Arc<dyn PermissionChecker>,
        pool: TaskPool,
    ) -> SyncResult<Arc<Self>> {
        let queue = MessageQueue::new(config.max_queue_cache_size, config.max_exec_tasks);
        let env = Arc::new(SyncEnv::new(config, store, communicator.clone(), permission, pool)?);
        let engine = Arc::new(Self {
            env,
            contexts: Mutex::new(HashMap::new()),
            operations: Mutex::new(HashMap::new()),
            devices: DeviceManager::new(),
            queue,
            next_sync_id: AtomicU32::new(1),
            killed: AtomicBool::new(false),
            remote_data_changed: RwLock::new(None),
        });

        let weak = Arc::downgrade(&engine);
        communicator.register_message_callback(Arc::new(move |device: &str, message: Message| {
            if let Some(engine) = weak.upgrade() {
                engine.message_received(device, message);
            }
        }));
        let weak = Arc::downgrade(&engine);
        communicator.register_connect_callback(Arc::new(move |device: &str, online: bool| {
            if let Some(engine) = weak.upgrade() {
                engine.presence_changed(device, online);
            }
        }));
        info!(
            local = %communicator.local_identity(),
            store = %engine.env.store_info.store_id,
            "sync engine started"
        );
        Ok(engine)
    }

    /// Allocates an operation id.
    pub fn next_sync_id(&self) -> u32 {
        loop {
            let id = self.next_sync_id.fetch_add(1, Ordering::SeqCst);
            if id != 0 {
                return id;
            }
        }
    }

    /// Builds an operation whose callbacks run on the engine's pool.
    pub fn create_operation(&self, devices: Vec<String>, mode: SyncMode, wait: bool) -> SyncOperation {
        SyncOperation::new(self.next_sync_id(), devices, mode, wait)
            .with_pool(self.env.pool.clone())
    }

    /// Routes `operation` to the context of every target device.
    ///
    /// Devices refused by the permission gate are marked failed right away;
    /// the rest report asynchronously.
    pub fn add_sync_operation(self: &Arc<Self>, operation: Arc<SyncOperation>) -> SyncResult<()> {
        if self.is_killed() {
            return Err(SyncError::Killed);
        }
        let id = operation.id();
        let weak: Weak<Self> = Arc::downgrade(self);
        operation.set_on_finished(Box::new(move || {
            if let Some(engine) = weak.upgrade() {
                engine.operations.lock().remove(&id);
            }
        }));
        self.operations.lock().insert(id, operation.clone());
        debug!(sync_id = id, mode = ?operation.mode(), devices = ?operation.devices(), "sync operation added");

        let flag = CheckFlag::for_mode(operation.mode());
        for device in operation.devices() {
            if !self.env.check_permission(device, flag) {
                warn!(sync_id = id, device = %device, ?flag, "permission check failed");
                operation.set_status(device, SyncStatus::PermissionCheckFailed);
                continue;
            }
            let context = self.context_for(device);
            if let Err(error) = context.add_sync_target(SyncTarget::for_operation(operation.clone())) {
                warn!(sync_id = id, device = %device, %error, "failed to queue sync target");
                operation.set_status(device, SyncStatus::Failed);
            }
        }
        Ok(())
    }

    /// Removes a not yet finished operation from every device queue and
    /// releases its waiter. Returns false if the id is unknown.
    pub fn remove_sync_operation(&self, sync_id: u32) -> bool {
        let Some(operation) = self.operations.lock().remove(&sync_id) else {
            return false;
        };
        let contexts: Vec<Arc<SyncTaskContext>> = self.contexts.lock().values().cloned().collect();
        for context in contexts {
            context.remove_sync_operation(sync_id);
        }
        info!(sync_id, "sync operation removed");
        operation.set_unfinished_failed();
        true
    }

    /// Number of operations that have not completed.
    pub fn operation_count(&self) -> usize {
        self.operations.lock().len()
    }

    fn context_for(&self, device: &str) -> Arc<SyncTaskContext> {
        self.contexts
            .lock()
            .entry(device.to_string())
            .or_insert_with(|| SyncTaskContext::new(device, self.env.clone()))
            .clone()
    }

    fn message_received(self: &Arc<Self>, device: &str, message: Message) {
        if self.is_killed() {
            return;
        }
        match self.queue.admit(device, message) {
            Admission::Dispatch(entry) => {
                let engine = self.clone();
                self.env.pool.spawn(move || engine.dispatch_loop(entry));
            }
            Admission::Queued => {}
            Admission::Coalesced => debug!(device, "data changed notice coalesced"),
            Admission::Discarded => warn!(
                device,
                cache_size = self.queue.cache_size(),
                discarded = self.queue.discarded(),
                "inbound queue over budget, message dropped"
            ),
        }
    }

    fn dispatch_loop(self: &Arc<Self>, entry: QueuedMessage) {
        let mut entry = entry;
        loop {
            let cost = entry.cost;
            self.dispatch(entry);
            match self.queue.complete(cost) {
                Some(next) => entry = next,
                None => return,
            }
        }
    }

    fn dispatch(&self, entry: QueuedMessage) {
        if self.is_killed() {
            return;
        }
        let QueuedMessage { device, message, .. } = entry;
        if !self.permits_traffic(&device) {
            self.refuse(&device, &message);
            return;
        }
        if matches!(message.payload, Payload::DataChanged) {
            if !self.devices.is_online(&device) {
                debug!(device = %device, "data changed notice from offline device");
                return;
            }
            let callback = self.remote_data_changed.read().clone();
            if let Some(callback) = callback {
                callback(&device);
            }
            return;
        }
        self.context_for(&device).receive_message(message);
    }

    /// A device refused in both directions never gets a context.
    fn permits_traffic(&self, device: &str) -> bool {
        self.env.check_permission(device, CheckFlag::Send)
            || self.env.check_permission(device, CheckFlag::Receive)
    }

    /// Answers requests from a refused device with `NotPermit` and drops
    /// everything else.
    fn refuse(&self, device: &str, message: &Message) {
        warn!(device, message_id = ?message.payload.message_id(), "message from refused device");
        if message.message_type != MessageType::Request {
            return;
        }
        let code = StatusCode::NotPermit.to_code();
        let payload = match &message.payload {
            Payload::AbilityRequest(_) => Payload::AbilityAck(AbilitySyncAckPacket {
                protocol_version: PROTOCOL_VERSION_CURRENT,
                software_version: self.env.config.software_version,
                ack_code: code,
                schema: String::new(),
                security: SecurityOption::default(),
                schema_type: 0,
                permit_sync: false,
                require_peer_convert: false,
            }),
            Payload::DataRequest(_) => Payload::DataAck(DataAckPacket::new(StatusCode::NotPermit, 0)),
            Payload::CommitHistoryRequest(_) => Payload::CommitHistoryAck(CommitHistoryAckPacket {
                err_code: code,
                commits: Vec::new(),
            }),
            Payload::MultiVerRequest(_) => Payload::MultiVerAck(MultiVerAckPacket {
                err_code: code,
                entries: Vec::new(),
            }),
            Payload::ValueSliceRequest(_) => Payload::ValueSliceAck(ValueSlicePacket {
                err_code: code,
                slice: Vec::new(),
            }),
            _ => return,
        };
        let response = Message::response(message.session_id, message.sequence_id, payload);
        self.env.send_reply(device, response);
    }

    fn presence_changed(&self, device: &str, online: bool) {
        if !self.devices.on_presence(device, online) {
            return;
        }
        info!(device, online, "device presence changed");
        if !online {
            let context = self.contexts.lock().get(device).cloned();
            if let Some(context) = context {
                context.on_device_offline();
            }
            let mut contexts = self.contexts.lock();
            if contexts.get(device).is_some_and(|context| context.is_idle()) {
                contexts.remove(device);
                debug!(device, "idle context released");
            }
        }
    }

    /// Number of devices with a live context.
    pub fn context_count(&self) -> usize {
        self.contexts.lock().len()
    }

    /// Sets the callback run when an online peer reports a local change.
    pub fn set_remote_data_changed_callback(&self, callback: RemoteDataChangedCallback) {
        *self.remote_data_changed.write() = Some(callback);
    }

    /// Notifies every online device that local data changed.
    pub fn broadcast_data_changed(&self) {
        for device in self.devices.online_devices() {
            if let Err(error) = self.env.send(&device, Message::notify(Payload::DataChanged)) {
                warn!(device = %device, %error, "failed to send data changed notice");
            }
        }
    }

    /// Applies a local wall-clock jump of `delta_ms` milliseconds.
    pub fn on_local_time_changed(&self, delta_ms: i64) -> SyncResult<()> {
        let offset = self.env.time.on_local_time_changed(delta_ms)?;
        info!(delta_ms, offset, "local clock changed");
        for context in self.contexts.lock().values() {
            context.mark_time_sync_stale();
        }
        Ok(())
    }

    /// Resets the watermarks of `device` and removes the entries it wrote.
    pub fn remove_device_data(&self, device: &str) -> SyncResult<()> {
        self.env.metadata.erase_device(device)?;
        self.env.store.remove_device_data(device)?;
        info!(device, "device data removed");
        Ok(())
    }

    /// Online devices, sorted.
    pub fn online_devices(&self) -> Vec<String> {
        self.devices.online_devices()
    }

    /// Bytes charged to the inbound queue.
    pub fn queue_cache_size(&self) -> usize {
        self.queue.cache_size()
    }

    /// Inbound messages dropped for exceeding the budget.
    pub fn discard_msg_num(&self) -> u64 {
        self.queue.discarded()
    }

    /// Inbound queue byte budget.
    pub fn max_queue_cache_size(&self) -> usize {
        self.queue.max_cache_size()
    }

    /// Changes the inbound queue byte budget.
    pub fn set_max_queue_cache_size(&self, size: usize) {
        self.queue.set_max_cache_size(size);
    }

    /// Dispatch tasks currently executing.
    pub fn exec_task_count(&self) -> usize {
        self.queue.exec_task_count()
    }

    /// Returns true once [`SyncEngine::close`] ran.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Stops every context, fails outstanding operations and drops queued
    /// messages. Later calls do nothing.
    pub fn close(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        let contexts: Vec<Arc<SyncTaskContext>> =
            self.contexts.lock().drain().map(|(_, context)| context).collect();
        for context in &contexts {
            context.kill();
        }
        let operations: Vec<Arc<SyncOperation>> =
            self.operations.lock().drain().map(|(_, operation)| operation).collect();
        for operation in &operations {
            operation.set_unfinished_failed();
        }
        let dropped = self.queue.clear();
        self.devices.clear();
        info!(
            contexts = contexts.len(),
            operations = operations.len(),
            dropped,
            "sync engine closed"
        );
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.close();
    }
}
