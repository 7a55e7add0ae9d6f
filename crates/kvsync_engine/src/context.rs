//! Per-device sync task context.
//!
//! A context owns everything one remote device needs: the queue of pending
//! targets, the running target with its session, the state machine, the
//! phase timer and the cached negotiation results. All of it sits behind one
//! lock; inbound messages, timers and exec requests each take that lock, so
//! a device's pipeline is driven by at most one thread at a time.

use crate::env::SyncEnv;
use crate::error::{SyncError, SyncResult};
use crate::operation::{SyncOperation, SyncStatus};
use crate::state_machine::{transition, DataPhase, SyncEvent, SyncState};
use crate::task_pool::TimerHandle;
use kvsync_protocol::{
    CommitNode, DataAckPacket, Message, MessageType, MultiVerEntry, Payload, SecurityOption, SyncMode,
    ValueSliceHash,
};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One unit of work queued on a context.
pub(crate) struct SyncTarget {
    pub(crate) operation: Option<Arc<SyncOperation>>,
    pub(crate) mode: SyncMode,
    /// Session of the pull request this target answers (0 otherwise).
    pub(crate) response_session: u32,
    /// Where a response pull starts reading.
    pub(crate) begin_watermark: u64,
}

impl SyncTarget {
    pub(crate) fn for_operation(operation: Arc<SyncOperation>) -> Self {
        Self {
            mode: operation.mode(),
            operation: Some(operation),
            response_session: 0,
            begin_watermark: 0,
        }
    }

    pub(crate) fn response_pull(session_id: u32, begin_watermark: u64) -> Self {
        Self {
            operation: None,
            mode: SyncMode::ResponsePull,
            response_session: session_id,
            begin_watermark,
        }
    }

    fn sync_id(&self) -> Option<u32> {
        self.operation.as_ref().map(|op| op.id())
    }

    fn set_status(&self, device: &str, status: SyncStatus) {
        if let Some(op) = &self.operation {
            op.set_status(device, status);
        }
    }
}

pub(crate) struct ActiveTarget {
    pub(crate) target: SyncTarget,
    pub(crate) session_id: u32,
    pub(crate) next_sequence: u32,
    pub(crate) error: Option<SyncError>,
}

/// What the peer told us during ability sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RemoteAbility {
    pub(crate) protocol_version: u32,
    pub(crate) software_version: u32,
    pub(crate) schema: String,
    pub(crate) security: SecurityOption,
    /// The peer can store data written under our schema.
    pub(crate) permit_sync: bool,
}

#[derive(Default)]
pub(crate) struct TimeSyncState {
    pub(crate) synced_at: Option<Instant>,
    pub(crate) stale: bool,
}

/// Sender progress through the current snapshot.
#[derive(Default)]
pub(crate) struct SendState {
    pub(crate) begin: u64,
    pub(crate) end: u64,
    /// Local watermark reached once the in-flight batch is acknowledged.
    pub(crate) batch_max: u64,
    pub(crate) last: bool,
    pub(crate) watermark_resets: u32,
}

/// Receiver dedupe record, kept across targets.
#[derive(Default)]
pub(crate) struct ReceiveState {
    pub(crate) last_session: u32,
    pub(crate) last_sequence: u32,
    pub(crate) last_ack: Option<DataAckPacket>,
}

#[derive(Default)]
pub(crate) struct MultiVerState {
    pub(crate) pending_commits: VecDeque<CommitNode>,
    pub(crate) current: Option<CommitNode>,
    pub(crate) entries: Vec<MultiVerEntry>,
    pub(crate) pending_slices: VecDeque<ValueSliceHash>,
}

pub(crate) struct ContextInner {
    pub(crate) state: SyncState,
    pub(crate) running: bool,
    pub(crate) targets: VecDeque<SyncTarget>,
    pub(crate) active: Option<ActiveTarget>,
    /// Request awaiting its ack, resent verbatim on timeout.
    pub(crate) outbound: Option<Message>,
    pub(crate) attempts: u32,
    timer: Option<TimerHandle>,
    timer_generation: u64,
    pub(crate) time_sync: TimeSyncState,
    pub(crate) ability: Option<RemoteAbility>,
    pub(crate) send: SendState,
    pub(crate) recv: ReceiveState,
    pub(crate) recv_finished: bool,
    pub(crate) multi_ver: MultiVerState,
}

impl ContextInner {
    fn new() -> Self {
        Self {
            state: SyncState::Idle,
            running: false,
            targets: VecDeque::new(),
            active: None,
            outbound: None,
            attempts: 0,
            timer: None,
            timer_generation: 0,
            time_sync: TimeSyncState::default(),
            ability: None,
            send: SendState::default(),
            recv: ReceiveState::default(),
            recv_finished: false,
            multi_ver: MultiVerState::default(),
        }
    }

    pub(crate) fn mode(&self) -> Option<SyncMode> {
        self.active.as_ref().map(|active| active.target.mode)
    }

    pub(crate) fn session_id(&self) -> Option<u32> {
        self.active.as_ref().map(|active| active.session_id)
    }
}

/// Sync state for one remote device.
pub(crate) struct SyncTaskContext {
    device: String,
    pub(crate) env: Arc<SyncEnv>,
    inner: Mutex<ContextInner>,
    killed: AtomicBool,
}

impl SyncTaskContext {
    pub(crate) fn new(device: impl Into<String>, env: Arc<SyncEnv>) -> Arc<Self> {
        Arc::new(Self {
            device: device.into(),
            env,
            inner: Mutex::new(ContextInner::new()),
            killed: AtomicBool::new(false),
        })
    }

    pub(crate) fn device(&self) -> &str {
        &self.device
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub(crate) fn state(&self) -> SyncState {
        self.inner.lock().state
    }

    pub(crate) fn pending_targets(&self) -> usize {
        self.inner.lock().targets.len()
    }

    /// Queues a target and requests a drive.
    ///
    /// An automatic target is coalesced into a pending one of the same mode
    /// and reported finished right away.
    pub(crate) fn add_sync_target(self: &Arc<Self>, target: SyncTarget) -> SyncResult<()> {
        if self.is_killed() {
            return Err(SyncError::Killed);
        }
        let coalesced = {
            let mut inner = self.inner.lock();
            let coalesce = target.mode.is_auto()
                && inner.targets.iter().any(|pending| pending.mode == target.mode);
            if coalesce {
                Some(target)
            } else {
                inner.targets.push_back(target);
                None
            }
        };
        match coalesced {
            Some(target) => {
                debug!(device = %self.device, sync_id = ?target.sync_id(), "auto sync coalesced");
                target.set_status(&self.device, SyncStatus::Finished);
            }
            None => self.schedule_exec(),
        }
        Ok(())
    }

    /// Drops queued targets of an operation; returns true if any was queued.
    pub(crate) fn remove_sync_operation(&self, sync_id: u32) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.targets.len();
        inner
            .targets
            .retain(|target| target.sync_id() != Some(sync_id));
        inner.targets.len() != before
    }

    pub(crate) fn schedule_exec(self: &Arc<Self>) {
        let context = self.clone();
        self.env.pool.spawn(move || context.exec_sync_task());
    }

    /// Starts the next queued target unless one is already running.
    pub(crate) fn exec_sync_task(self: &Arc<Self>) {
        if self.is_killed() {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.running {
            debug!(device = %self.device, state = %inner.state, "context already running");
            return;
        }
        let target = loop {
            match inner.targets.pop_front() {
                Some(target) if target.operation.as_ref().is_some_and(|op| op.is_finished()) => {
                    continue
                }
                Some(target) => break target,
                None => return,
            }
        };
        let session_id = match target.response_session {
            0 => rand::thread_rng().gen_range(1..=u32::MAX),
            session => session,
        };
        info!(
            device = %self.device,
            sync_id = ?target.sync_id(),
            mode = ?target.mode,
            session_id,
            "sync target started"
        );
        target.set_status(&self.device, SyncStatus::Running);
        inner.running = true;
        inner.active = Some(ActiveTarget {
            target,
            session_id,
            next_sequence: 1,
            error: None,
        });
        self.run(&mut inner, SyncEvent::Start);
    }

    /// Entry point for every message addressed to this device's context.
    pub(crate) fn receive_message(self: &Arc<Self>, message: Message) {
        if self.is_killed() {
            return;
        }
        let mut inner = self.inner.lock();
        let event = match &message.payload {
            Payload::TimeSync(packet) if message.message_type == MessageType::Request => {
                self.respond_time_sync(&mut inner, &message, packet);
                SyncEvent::WaitAck
            }
            Payload::TimeSync(packet) => self.on_time_sync_ack(&mut inner, &message, packet),
            Payload::AbilityRequest(packet) => {
                self.respond_ability_sync(&mut inner, &message, packet);
                SyncEvent::WaitAck
            }
            Payload::AbilityAck(packet) => self.on_ability_ack(&mut inner, &message, packet),
            Payload::DataRequest(packet) => self.on_data_request(&mut inner, &message, packet),
            Payload::DataAck(packet) => self.on_data_ack(&mut inner, &message, packet),
            Payload::CommitHistoryRequest(packet) => {
                self.respond_commit_history(&inner, &message, packet);
                SyncEvent::WaitAck
            }
            Payload::CommitHistoryAck(packet) => {
                self.on_commit_history_ack(&mut inner, &message, packet)
            }
            Payload::MultiVerRequest(packet) => {
                self.respond_multi_ver_data(&inner, &message, packet);
                SyncEvent::WaitAck
            }
            Payload::MultiVerAck(packet) => self.on_multi_ver_ack(&mut inner, &message, packet),
            Payload::ValueSliceRequest(packet) => {
                self.respond_value_slice(&inner, &message, packet);
                SyncEvent::WaitAck
            }
            Payload::ValueSliceAck(packet) => self.on_value_slice_ack(&mut inner, &message, packet),
            Payload::DataChanged => SyncEvent::WaitAck,
        };
        self.run(&mut inner, event);
    }

    /// Stops the context and fails everything queued on it.
    pub(crate) fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (pending, active) = {
            let mut inner = self.inner.lock();
            Self::cancel_timer(&mut inner);
            inner.outbound = None;
            inner.state = SyncState::Idle;
            inner.running = false;
            let pending: Vec<SyncTarget> = inner.targets.drain(..).collect();
            (pending, inner.active.take())
        };
        for target in pending.iter().chain(active.iter().map(|active| &active.target)) {
            target.set_status(&self.device, SyncStatus::Failed);
        }
        debug!(device = %self.device, "context killed");
    }

    /// Forgets negotiation state and fails the running target.
    pub(crate) fn on_device_offline(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        inner.ability = None;
        inner.time_sync = TimeSyncState::default();
        if inner.state.is_active() {
            let error = SyncError::PeerNotConnected(self.device.clone());
            let event = self.fail(&mut inner, error);
            self.run(&mut inner, event);
        }
    }

    /// Nothing is running or queued.
    pub(crate) fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == SyncState::Idle && !inner.running && inner.active.is_none() && inner.targets.is_empty()
    }

    pub(crate) fn mark_time_sync_stale(&self) {
        self.inner.lock().time_sync.stale = true;
    }

    /// Feeds `event` to the state machine until it has to wait.
    pub(crate) fn run(self: &Arc<Self>, inner: &mut ContextInner, event: SyncEvent) {
        let mut event = event;
        loop {
            if event == SyncEvent::WaitAck {
                return;
            }
            let from = inner.state;
            let Some(to) = transition(from, event) else {
                warn!(device = %self.device, state = %from, ?event, "event does not apply");
                return;
            };
            debug!(device = %self.device, %from, %to, ?event, "state transition");
            inner.state = to;
            event = match to {
                SyncState::Idle => {
                    self.on_idle(inner);
                    return;
                }
                SyncState::TimeSync => self.start_time_sync(inner),
                SyncState::AbilitySync => self.start_ability_sync(inner),
                SyncState::DataSync(DataPhase::Sending) => self.start_data_send(inner),
                SyncState::DataSync(DataPhase::Receiving) => self.start_data_receive(inner),
                SyncState::CommitHistorySync => self.start_commit_history(inner),
                SyncState::MultiVerDataSync => self.next_commit(inner),
                SyncState::ValueSliceSync => self.next_value_slice(inner),
                SyncState::Finished | SyncState::Timeout | SyncState::Error => {
                    self.report_target(inner)
                }
            };
        }
    }

    fn report_target(&self, inner: &mut ContextInner) -> SyncEvent {
        Self::cancel_timer(inner);
        inner.outbound = None;
        let Some(active) = inner.active.as_ref() else {
            return SyncEvent::TaskFinished;
        };
        let status = match inner.state {
            SyncState::Finished => SyncStatus::Finished,
            SyncState::Timeout => SyncStatus::Failed,
            _ => active
                .error
                .as_ref()
                .map_or(SyncStatus::Failed, SyncStatus::from_error),
        };
        if status == SyncStatus::Finished {
            info!(
                device = %self.device,
                sync_id = ?active.target.sync_id(),
                session_id = active.session_id,
                "sync target finished"
            );
        } else {
            warn!(
                device = %self.device,
                sync_id = ?active.target.sync_id(),
                session_id = active.session_id,
                ?status,
                error = ?active.error,
                "sync target failed"
            );
        }
        active.target.set_status(&self.device, status);
        SyncEvent::TaskFinished
    }

    fn on_idle(self: &Arc<Self>, inner: &mut ContextInner) {
        Self::cancel_timer(inner);
        inner.active = None;
        inner.running = false;
        inner.outbound = None;
        inner.attempts = 0;
        inner.send = SendState::default();
        inner.recv_finished = false;
        inner.multi_ver = MultiVerState::default();
        if !inner.targets.is_empty() && !self.is_killed() {
            self.schedule_exec();
        }
    }

    /// Records `error` on the running target and aborts it.
    pub(crate) fn fail(&self, inner: &mut ContextInner, error: SyncError) -> SyncEvent {
        if let Some(active) = inner.active.as_mut() {
            active.error = Some(error);
        }
        SyncEvent::InnerError
    }

    /// Records a refusal by the peer and aborts the target.
    pub(crate) fn reject(&self, inner: &mut ContextInner, error: SyncError) -> SyncEvent {
        if let Some(active) = inner.active.as_mut() {
            active.error = Some(error);
        }
        SyncEvent::Rejected
    }

    /// Sends a request in the running session and waits for its ack.
    ///
    /// A retryable transport failure leaves the request to the timeout
    /// path; any other failure is returned.
    pub(crate) fn send_request(
        self: &Arc<Self>,
        inner: &mut ContextInner,
        payload: Payload,
    ) -> SyncResult<()> {
        let active = inner
            .active
            .as_mut()
            .ok_or_else(|| SyncError::Protocol("no running target".into()))?;
        let sequence_id = active.next_sequence;
        active.next_sequence = active.next_sequence.wrapping_add(1);
        let message = Message::request(active.session_id, sequence_id, payload);
        if let Err(error) = self.env.send(&self.device, message.clone()) {
            if !error.is_retryable() {
                return Err(error);
            }
            warn!(device = %self.device, sequence_id, %error, "send failed, will retry");
        }
        inner.outbound = Some(message);
        inner.attempts = 1;
        self.arm_timer(inner, self.env.config.response_timeout);
        Ok(())
    }

    /// Sends the in-flight request again.
    pub(crate) fn resend(self: &Arc<Self>, inner: &mut ContextInner) -> SyncResult<()> {
        let Some(mut message) = inner.outbound.clone() else {
            return Ok(());
        };
        if let Payload::TimeSync(packet) = &mut message.payload {
            packet.source_time_begin = self.env.time.now();
        }
        inner.attempts += 1;
        debug!(
            device = %self.device,
            session_id = message.session_id,
            sequence_id = message.sequence_id,
            attempt = inner.attempts,
            "resending request"
        );
        if let Err(error) = self.env.send(&self.device, message.clone()) {
            if !error.is_retryable() {
                return Err(error);
            }
        }
        inner.outbound = Some(message);
        let delay = self.env.config.response_timeout
            + self.env.config.retry.delay_for_attempt(inner.attempts - 1);
        self.arm_timer(inner, delay);
        Ok(())
    }

    /// Takes the in-flight request if `message` acknowledges it.
    ///
    /// Acks from another session, for another sequence or arriving outside
    /// `expected` are stale and leave the state untouched.
    pub(crate) fn take_ack(
        &self,
        inner: &mut ContextInner,
        message: &Message,
        expected: SyncState,
    ) -> Option<Message> {
        let matches = inner.state == expected
            && inner.outbound.as_ref().is_some_and(|outbound| {
                outbound.session_id == message.session_id
                    && outbound.sequence_id == message.sequence_id
                    && outbound.message_id() == message.message_id()
            });
        if !matches {
            debug!(
                device = %self.device,
                state = %inner.state,
                kind = ?message.message_id(),
                session_id = message.session_id,
                sequence_id = message.sequence_id,
                "discarding stale ack"
            );
            return None;
        }
        Self::cancel_timer(inner);
        inner.outbound.take()
    }

    pub(crate) fn arm_timer(self: &Arc<Self>, inner: &mut ContextInner, delay: Duration) {
        inner.timer_generation += 1;
        let generation = inner.timer_generation;
        let context = Arc::downgrade(self);
        inner.timer = Some(self.env.pool.schedule_timer(delay, move || {
            if let Some(context) = context.upgrade() {
                context.on_timer(generation);
            }
        }));
    }

    pub(crate) fn cancel_timer(inner: &mut ContextInner) {
        inner.timer_generation += 1;
        inner.timer = None;
    }

    fn on_timer(self: &Arc<Self>, generation: u64) {
        if self.is_killed() {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.timer_generation != generation {
            return;
        }
        inner.timer = None;
        let event = self.handle_timeout(&mut inner);
        self.run(&mut inner, event);
    }

    fn handle_timeout(self: &Arc<Self>, inner: &mut ContextInner) -> SyncEvent {
        if !inner.state.is_active() {
            return SyncEvent::WaitAck;
        }
        if !self.env.config.retry.can_retry(inner.attempts) {
            warn!(
                device = %self.device,
                state = %inner.state,
                attempts = inner.attempts,
                "no reply, retries exhausted"
            );
            if let Some(active) = inner.active.as_mut() {
                active.error = Some(SyncError::Timeout);
            }
            return SyncEvent::Timeout;
        }
        if inner.outbound.is_some() {
            return match self.resend(inner) {
                Ok(()) => SyncEvent::WaitAck,
                Err(error) => self.fail(inner, error),
            };
        }
        // receiving with nothing in flight; keep waiting for the peer
        inner.attempts += 1;
        let delay = self.env.config.response_timeout
            + self.env.config.retry.delay_for_attempt(inner.attempts);
        self.arm_timer(inner, delay);
        SyncEvent::WaitAck
    }
}
