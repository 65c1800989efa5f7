//! Error types for repository operations.

use std::io;
use thiserror::Error;
use uuid::Uuid;

/// Result type for repository operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A row payload or snapshot could not be (de)serialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A protocol value could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] tidesync_protocol::ProtocolError),

    /// Committing would violate a storage constraint.
    ///
    /// The whole commit is rejected; nothing is written.
    #[error("constraint violation: {message}")]
    Constraint {
        /// Description of the violated constraint.
        message: String,
    },

    /// A row addressed by sync id does not exist.
    #[error("{type_name} {sync_id} not found")]
    NotFound {
        /// Type name of the row.
        type_name: String,
        /// Sync id of the row.
        sync_id: Uuid,
    },

    /// A row addressed by local key does not exist.
    #[error("{type_name} with key {key} not found")]
    KeyNotFound {
        /// Type name of the row.
        type_name: String,
        /// Local key.
        key: u64,
    },

    /// The transaction was already committed or rolled back.
    #[error("transaction is no longer active")]
    TransactionClosed,

    /// A snapshot file is unreadable.
    #[error("snapshot corrupted: {0}")]
    Corrupted(String),
}

impl StoreError {
    /// Creates a constraint violation.
    pub fn constraint(message: impl Into<String>) -> Self {
        Self::Constraint {
            message: message.into(),
        }
    }

    /// Creates a not-found error for a row addressed by sync id.
    pub fn not_found(type_name: impl Into<String>, sync_id: Uuid) -> Self {
        Self::NotFound {
            type_name: type_name.into(),
            sync_id,
        }
    }

    /// Returns true for constraint violations.
    pub fn is_constraint(&self) -> bool {
        matches!(self, StoreError::Constraint { .. })
    }
}
