//! Error types for the sync engine.

use thiserror::Error;
use tidesync_protocol::{ProtocolError, SyncIssueType};
use tidesync_store::StoreError;
use uuid::Uuid;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Batch-level sync failures.
///
/// Per-object failures are reported as `SyncIssue`s instead and never
/// surface here.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Malformed request or response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The caller could not be authenticated.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The caller is authenticated but may not perform the request.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// The request is well-formed but not allowed in this state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The remote side failed.
    #[error("server error: {0}")]
    ServerError(String),

    /// Storage failure, including constraint violations at commit.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// JSON failure outside of a single object's payload.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// No session with this id is open.
    #[error("unknown sync session {0}")]
    UnknownSession(Uuid),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,
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

    /// Creates an invalid-operation error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::ServerError(_) => true,
            _ => false,
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

/// A converter's verdict on a single incoming object.
///
/// Returning this from an incoming converter turns into a `SyncIssue` of
/// the given type; the rest of the batch carries on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct SyncUpdateError {
    /// Issue category reported to the sender.
    pub issue_type: SyncIssueType,
    /// Diagnostic message.
    pub message: String,
}

impl SyncUpdateError {
    /// Creates an error of the given type.
    pub fn new(issue_type: SyncIssueType, message: impl Into<String>) -> Self {
        Self {
            issue_type,
            message: message.into(),
        }
    }

    /// The change was declined.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(SyncIssueType::Rejected, message)
    }

    /// The caller may not make this change.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(SyncIssueType::Unauthorized, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::ServerError("internal error".into()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::invalid("bad scope").is_retryable());
        assert!(!SyncError::NotAuthorized("no".into()).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::NotConnected;
        assert_eq!(err.to_string(), "not connected to server");

        let id = Uuid::nil();
        assert!(SyncError::UnknownSession(id).to_string().contains(&id.to_string()));

        let err: SyncError = ProtocolError::UnknownPath("/nope".into()).into();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn update_error_carries_type() {
        let err = SyncUpdateError::unauthorized("log events are append-only");
        assert_eq!(err.issue_type, SyncIssueType::Unauthorized);
        assert_eq!(err.to_string(), "log events are append-only");
        assert_eq!(SyncUpdateError::rejected("x").issue_type, SyncIssueType::Rejected);
    }
}
