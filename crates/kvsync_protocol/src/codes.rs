//! Sync modes, status codes and security options.

use kvsync_codec::{CodecError, CodecResult};

/// Direction and trigger of a synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncMode {
    /// Send local changes to the peer.
    Push,
    /// Fetch the peer's changes.
    Pull,
    /// Both directions in one session.
    PushAndPull,
    /// Best-effort push triggered by a local write.
    AutoPush,
    /// Best-effort pull triggered by a peer notification.
    AutoPull,
    /// Internal: the responder side of a peer's pull.
    ResponsePull,
}

impl SyncMode {
    /// Converts to a numeric code.
    pub fn to_code(&self) -> i32 {
        match self {
            SyncMode::Push => 0,
            SyncMode::Pull => 1,
            SyncMode::PushAndPull => 2,
            SyncMode::AutoPush => 3,
            SyncMode::AutoPull => 4,
            SyncMode::ResponsePull => 5,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(SyncMode::Push),
            1 => Some(SyncMode::Pull),
            2 => Some(SyncMode::PushAndPull),
            3 => Some(SyncMode::AutoPush),
            4 => Some(SyncMode::AutoPull),
            5 => Some(SyncMode::ResponsePull),
            _ => None,
        }
    }

    /// Decodes a code, failing on unknown values.
    pub fn decode(code: i32) -> CodecResult<Self> {
        Self::from_code(code)
            .ok_or_else(|| CodecError::invalid_structure(format!("unknown sync mode {code}")))
    }

    /// Returns true if local entries flow to the peer.
    pub fn sends_data(&self) -> bool {
        matches!(
            self,
            SyncMode::Push | SyncMode::PushAndPull | SyncMode::AutoPush | SyncMode::ResponsePull
        )
    }

    /// Returns true if the peer's entries flow to this side.
    pub fn receives_data(&self) -> bool {
        matches!(
            self,
            SyncMode::Pull | SyncMode::PushAndPull | SyncMode::AutoPull
        )
    }

    /// Returns true for best-effort, coalescable modes.
    pub fn is_auto(&self) -> bool {
        matches!(self, SyncMode::AutoPush | SyncMode::AutoPull)
    }

    /// Returns true for modes a caller may request.
    pub fn is_caller_mode(&self) -> bool {
        !matches!(self, SyncMode::ResponsePull)
    }
}

/// Status carried by acknowledgements and negative responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Success.
    Ok,
    /// The receiver has not applied up to the sender's local watermark.
    LocalWatermarkNotInit,
    /// The receiver is busy saving; resend the segment after a delay.
    SaveDataNotify,
    /// The receiver has no ability negotiation with the sender.
    NeedAbilitySync,
    /// Permission check failed on the receiver.
    NotPermit,
    /// Schemas are incompatible.
    SchemaMismatch,
    /// Security labels forbid this direction.
    SecurityOptionCheckError,
    /// The protocol version is not supported.
    VersionNotSupport,
    /// A requested item does not exist.
    NotFound,
    /// Unclassified failure on the peer.
    InternalError,
}

impl StatusCode {
    /// Converts to a numeric code.
    pub fn to_code(&self) -> i32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::LocalWatermarkNotInit => 1,
            StatusCode::SaveDataNotify => 2,
            StatusCode::NeedAbilitySync => -1,
            StatusCode::NotPermit => -2,
            StatusCode::SchemaMismatch => -3,
            StatusCode::SecurityOptionCheckError => -4,
            StatusCode::VersionNotSupport => -5,
            StatusCode::NotFound => -6,
            StatusCode::InternalError => -7,
        }
    }

    /// Converts from a numeric code. Unknown codes map to
    /// [`StatusCode::InternalError`].
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => StatusCode::Ok,
            1 => StatusCode::LocalWatermarkNotInit,
            2 => StatusCode::SaveDataNotify,
            -1 => StatusCode::NeedAbilitySync,
            -2 => StatusCode::NotPermit,
            -3 => StatusCode::SchemaMismatch,
            -4 => StatusCode::SecurityOptionCheckError,
            -5 => StatusCode::VersionNotSupport,
            -6 => StatusCode::NotFound,
            _ => StatusCode::InternalError,
        }
    }

    /// Returns true for rejections.
    pub fn is_negative(&self) -> bool {
        self.to_code() < 0
    }
}

/// Security classification of a store.
///
/// Labels are ordered from least to most sensitive. `NotSet` disables
/// the check entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SecurityLabel {
    /// No label configured.
    #[default]
    NotSet,
    /// Public data.
    S0,
    /// Low sensitivity.
    S1,
    /// Medium sensitivity.
    S2,
    /// High sensitivity.
    S3,
    /// Critical sensitivity.
    S4,
}

impl SecurityLabel {
    /// All labels, least sensitive first.
    pub const ALL: [SecurityLabel; 6] = [
        SecurityLabel::NotSet,
        SecurityLabel::S0,
        SecurityLabel::S1,
        SecurityLabel::S2,
        SecurityLabel::S3,
        SecurityLabel::S4,
    ];

    /// Converts to a numeric code.
    pub fn to_code(&self) -> i32 {
        match self {
            SecurityLabel::NotSet => 0,
            SecurityLabel::S0 => 1,
            SecurityLabel::S1 => 2,
            SecurityLabel::S2 => 3,
            SecurityLabel::S3 => 4,
            SecurityLabel::S4 => 5,
        }
    }

    /// Decodes a code, failing on unknown values.
    pub fn decode(code: i32) -> CodecResult<Self> {
        Self::ALL
            .into_iter()
            .find(|label| label.to_code() == code)
            .ok_or_else(|| CodecError::invalid_structure(format!("unknown security label {code}")))
    }

    /// Returns true if data labelled `self` may be stored under `receiver`.
    ///
    /// Flowing from a higher label to a lower one is refused.
    pub fn can_flow_to(&self, receiver: SecurityLabel) -> bool {
        if *self == SecurityLabel::NotSet || receiver == SecurityLabel::NotSet {
            return true;
        }
        *self <= receiver
    }
}

/// Security label and flag of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecurityOption {
    /// Classification label.
    pub label: SecurityLabel,
    /// Protection flag (opaque to the sync layer).
    pub flag: i32,
}

impl SecurityOption {
    /// Creates a security option.
    pub fn new(label: SecurityLabel, flag: i32) -> Self {
        Self { label, flag }
    }
}
