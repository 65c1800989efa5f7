//! Error types for the sync protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol values.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The object's type name does not match the requested entity type.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Type name the caller asked for.
        expected: String,
        /// Type name carried by the object.
        actual: String,
    },

    /// The object carries no payload for its status.
    #[error("object {sync_id} of type {type_name} has no payload")]
    MissingPayload {
        /// Type name of the object.
        type_name: String,
        /// Sync id of the object.
        sync_id: uuid::Uuid,
    },

    /// The payload's sync id differs from the envelope's sync id.
    #[error("payload sync id {payload} does not match envelope sync id {envelope}")]
    SyncIdMismatch {
        /// Sync id on the envelope.
        envelope: uuid::Uuid,
        /// Sync id inside the payload.
        payload: uuid::Uuid,
    },

    /// A message could not be routed.
    #[error("unknown message path: {0}")]
    UnknownPath(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::TypeMismatch {
            expected: "Person".into(),
            actual: "Address".into(),
        };
        assert_eq!(err.to_string(), "type mismatch: expected Person, got Address");

        let err = ProtocolError::UnknownPath("/sync/bogus".into());
        assert!(err.to_string().contains("/sync/bogus"));
    }
}
