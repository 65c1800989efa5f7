//! Error types for the sync server.

use thiserror::Error;
use tidesync_engine::{ErrorBody, HttpResponse, SyncError, UNKNOWN_SESSION_KIND};
use tidesync_protocol::ProtocolError;
use tidesync_store::StoreError;
use uuid::Uuid;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format or an operation not allowed in this state.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Authorization failed.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// No endpoint at this path.
    #[error("unknown path: {0}")]
    UnknownPath(String),

    /// No session with this id is open.
    #[error("unknown sync session {0}")]
    UnknownSession(Uuid),

    /// The request conflicts with the stored state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::AuthenticationFailed(_)
                | ServerError::NotAuthorized(_)
                | ServerError::UnknownPath(_)
                | ServerError::UnknownSession(_)
                | ServerError::Conflict(_)
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServerError::Database(_) | ServerError::Internal(_))
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) => 400,
            ServerError::AuthenticationFailed(_) => 401,
            ServerError::NotAuthorized(_) => 403,
            ServerError::UnknownPath(_) | ServerError::UnknownSession(_) => 404,
            ServerError::Conflict(_) => 409,
            ServerError::Database(_) | ServerError::Internal(_) => 500,
        }
    }

    /// Machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::InvalidRequest(_) => "invalidRequest",
            ServerError::AuthenticationFailed(_) => "authenticationFailed",
            ServerError::NotAuthorized(_) => "notAuthorized",
            ServerError::UnknownPath(_) => "unknownPath",
            ServerError::UnknownSession(_) => UNKNOWN_SESSION_KIND,
            ServerError::Conflict(_) => "conflict",
            ServerError::Database(_) => "database",
            ServerError::Internal(_) => "internal",
        }
    }

    /// Renders the error as an HTTP response.
    ///
    /// Server-side failures are reported without their details.
    pub fn to_response(&self) -> HttpResponse {
        let message = if self.is_server_error() {
            "the server could not complete the request".to_string()
        } else {
            self.to_string()
        };
        let mut body = ErrorBody::new(self.kind(), message);
        if let ServerError::UnknownSession(id) = self {
            body = body.with_session(*id);
        }
        HttpResponse::error(self.status_code(), &body)
    }
}

impl From<SyncError> for ServerError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::InvalidOperation(m) | SyncError::Protocol(m) => ServerError::InvalidRequest(m),
            SyncError::Json(e) => ServerError::InvalidRequest(e.to_string()),
            SyncError::AuthenticationFailed(m) => ServerError::AuthenticationFailed(m),
            SyncError::NotAuthorized(m) => ServerError::NotAuthorized(m),
            SyncError::UnknownSession(id) => ServerError::UnknownSession(id),
            e @ SyncError::InvalidStateTransition { .. } => ServerError::Conflict(e.to_string()),
            SyncError::Store(StoreError::Constraint { message }) => ServerError::Conflict(message),
            SyncError::Store(e) => ServerError::Database(e.to_string()),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnknownPath(path) => ServerError::UnknownPath(path),
            other => ServerError::InvalidRequest(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::Internal(format!("failed to encode response: {err}"))
    }
}
