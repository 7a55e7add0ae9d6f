//! Per-device sync states, events and the transition table.

use std::fmt;

/// Direction of the data phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataPhase {
    /// Local entries are being sent.
    Sending,
    /// Entries from the peer are being received.
    Receiving,
}

/// State of one device's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// No target is running.
    Idle,
    /// Negotiating the clock offset.
    TimeSync,
    /// Negotiating schema and security.
    AbilitySync,
    /// Exchanging single-version entries.
    DataSync(DataPhase),
    /// Exchanging latest commits (multi-version).
    CommitHistorySync,
    /// Fetching the entries of one commit (multi-version).
    MultiVerDataSync,
    /// Fetching referenced value slices (multi-version).
    ValueSliceSync,
    /// The target completed.
    Finished,
    /// The target ran out of retries.
    Timeout,
    /// The target was aborted.
    Error,
}

impl SyncState {
    /// Returns true while a target is being worked on.
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            SyncState::Idle | SyncState::Finished | SyncState::Timeout | SyncState::Error
        )
    }

    /// Returns true for states that end a target.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncState::Finished | SyncState::Timeout | SyncState::Error)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Idle => f.write_str("idle"),
            SyncState::TimeSync => f.write_str("time_sync"),
            SyncState::AbilitySync => f.write_str("ability_sync"),
            SyncState::DataSync(DataPhase::Sending) => f.write_str("data_sync_send"),
            SyncState::DataSync(DataPhase::Receiving) => f.write_str("data_sync_receive"),
            SyncState::CommitHistorySync => f.write_str("commit_history_sync"),
            SyncState::MultiVerDataSync => f.write_str("multi_ver_data_sync"),
            SyncState::ValueSliceSync => f.write_str("value_slice_sync"),
            SyncState::Finished => f.write_str("finished"),
            SyncState::Timeout => f.write_str("timeout"),
            SyncState::Error => f.write_str("error"),
        }
    }
}

/// Inputs that move the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncEvent {
    /// A target was popped.
    Start,
    /// The clock offset is known.
    TimeSyncFinished,
    /// Negotiation passed; local entries go first.
    StartDataSend,
    /// Negotiation passed; only peer entries are expected.
    StartDataReceive,
    /// Negotiation passed on a multi-version store.
    StartCommitHistory,
    /// Every local entry was acknowledged.
    SendFinished,
    /// The peer's last entry arrived.
    RecvFinished,
    /// The peer lost its negotiation with us.
    NeedAbilitySync,
    /// The missing commits are known.
    CommitHistoryFinished,
    /// Entries of one commit arrived and reference missing slices.
    CommitEntriesReceived,
    /// No commit is left to fetch.
    MultiVerFinished,
    /// Every slice of the current commit is stored.
    ValueSliceFinished,
    /// A request is in flight; stay in the current state.
    WaitAck,
    /// Retries are exhausted.
    Timeout,
    /// A local failure aborted the target.
    InnerError,
    /// The peer refused the exchange.
    Rejected,
    /// The terminal state was reported.
    TaskFinished,
}

/// Next state for `event` in `state`, or `None` if the event does not
/// apply there.
pub fn transition(state: SyncState, event: SyncEvent) -> Option<SyncState> {
    use DataPhase::{Receiving, Sending};
    use SyncEvent as E;
    use SyncState as S;

    if state.is_active() {
        match event {
            E::Timeout => return Some(S::Timeout),
            E::InnerError | E::Rejected => return Some(S::Error),
            _ => {}
        }
    }

    match state {
        S::Idle => match event {
            E::Start => Some(S::TimeSync),
            _ => None,
        },
        S::TimeSync => match event {
            E::TimeSyncFinished => Some(S::AbilitySync),
            _ => None,
        },
        S::AbilitySync => match event {
            E::StartDataSend => Some(S::DataSync(Sending)),
            E::StartDataReceive => Some(S::DataSync(Receiving)),
            E::StartCommitHistory => Some(S::CommitHistorySync),
            _ => None,
        },
        S::DataSync(Sending) => match event {
            E::SendFinished => Some(S::Finished),
            E::StartDataReceive => Some(S::DataSync(Receiving)),
            E::NeedAbilitySync => Some(S::AbilitySync),
            _ => None,
        },
        S::DataSync(Receiving) => match event {
            E::RecvFinished => Some(S::Finished),
            E::NeedAbilitySync => Some(S::AbilitySync),
            _ => None,
        },
        S::CommitHistorySync => match event {
            E::CommitHistoryFinished => Some(S::MultiVerDataSync),
            E::NeedAbilitySync => Some(S::AbilitySync),
            _ => None,
        },
        S::MultiVerDataSync => match event {
            E::CommitEntriesReceived => Some(S::ValueSliceSync),
            E::MultiVerFinished => Some(S::Finished),
            E::NeedAbilitySync => Some(S::AbilitySync),
            _ => None,
        },
        S::ValueSliceSync => match event {
            E::ValueSliceFinished => Some(S::MultiVerDataSync),
            E::NeedAbilitySync => Some(S::AbilitySync),
            _ => None,
        },
        S::Finished | S::Timeout | S::Error => match event {
            E::TaskFinished => Some(S::Idle),
            _ => None,
        },
    }
}
