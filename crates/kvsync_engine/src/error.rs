//! Error types for the sync engine.

use kvsync_codec::CodecError;
use kvsync_protocol::StatusCode;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Communicator failed to deliver a message.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The target device is not reachable.
    #[error("device {0} is not connected")]
    PeerNotConnected(String),

    /// No reply arrived in time.
    #[error("operation timed out")]
    Timeout,

    /// Capacity limit reached (queue budget, queued sync limit).
    #[error("busy: {0}")]
    Busy(String),

    /// Rejected at the API boundary.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// A looked-up item does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The authorization provider refused the exchange.
    #[error("permission check failed for device {device}")]
    PermissionDenied {
        /// Remote device.
        device: String,
    },

    /// Schemas cannot exchange data.
    #[error("schema mismatch with device {device}")]
    SchemaMismatch {
        /// Remote device.
        device: String,
    },

    /// Security labels forbid this direction.
    #[error("security option check failed with device {device}")]
    SecurityOptionCheck {
        /// Remote device.
        device: String,
    },

    /// Protocol versions are not compatible.
    #[error("protocol version not supported: local={local}, remote={remote}")]
    VersionNotSupported {
        /// Local protocol version.
        local: u32,
        /// Remote protocol version.
        remote: u32,
    },

    /// The peer lost its negotiation state.
    #[error("ability sync required")]
    NeedAbilitySync,

    /// The peer rejected the exchange with a status code.
    #[error("rejected by peer with code {code:?}")]
    Rejected {
        /// Status code carried by the negative ack.
        code: StatusCode,
    },

    /// The engine or context was killed.
    #[error("sync engine closed")]
    Killed,

    /// Storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Malformed or unexpected protocol content.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::Busy(_) => true,
            _ => false,
        }
    }

    /// Maps a negative status code received from `device` to an error.
    pub fn from_status(code: StatusCode, device: &str) -> Self {
        match code {
            StatusCode::NotPermit => SyncError::PermissionDenied {
                device: device.to_string(),
            },
            StatusCode::SchemaMismatch => SyncError::SchemaMismatch {
                device: device.to_string(),
            },
            StatusCode::SecurityOptionCheckError => SyncError::SecurityOptionCheck {
                device: device.to_string(),
            },
            StatusCode::NeedAbilitySync => SyncError::NeedAbilitySync,
            StatusCode::NotFound => SyncError::NotFound(format!("rejected by {device}")),
            code => SyncError::Rejected { code },
        }
    }

    /// Status code to report to a peer for this error.
    pub fn to_status(&self) -> StatusCode {
        match self {
            SyncError::PermissionDenied { .. } => StatusCode::NotPermit,
            SyncError::SchemaMismatch { .. } => StatusCode::SchemaMismatch,
            SyncError::SecurityOptionCheck { .. } => StatusCode::SecurityOptionCheckError,
            SyncError::VersionNotSupported { .. } => StatusCode::VersionNotSupport,
            SyncError::NeedAbilitySync => StatusCode::NeedAbilitySync,
            SyncError::NotFound(_) => StatusCode::NotFound,
            SyncError::Rejected { code } => *code,
            _ => StatusCode::InternalError,
        }
    }
}
