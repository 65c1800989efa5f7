//! Per-object sync failures.

use crate::object::{ObjectKey, SyncObject};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Category of a [`SyncIssue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncIssueType {
    /// Unclassified failure.
    Unknown,
    /// A converter declined the change.
    Rejected,
    /// The caller may not touch this type or row.
    Unauthorized,
    /// The payload could not be decoded.
    Malformed,
    /// Applying the change would violate a storage constraint.
    ConstraintViolation,
}

impl SyncIssueType {
    /// Returns true if the issue means the sender's copy must be rolled back
    /// to the receiver's authoritative value.
    pub fn requires_correction(&self) -> bool {
        matches!(self, SyncIssueType::Rejected | SyncIssueType::Unauthorized)
    }
}

/// A per-object failure produced while applying a change.
///
/// Issues never abort a batch. They accumulate and are returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncIssue {
    /// Category.
    pub issue_type: SyncIssueType,
    /// Type name of the object that failed.
    pub type_name: String,
    /// Sync id of the object that failed.
    pub sync_id: Uuid,
    /// Diagnostic message.
    pub message: String,
}

impl SyncIssue {
    /// Creates an issue for an object.
    pub fn new(issue_type: SyncIssueType, object: &SyncObject, message: impl Into<String>) -> Self {
        Self {
            issue_type,
            type_name: object.type_name.clone(),
            sync_id: object.sync_id,
            message: message.into(),
        }
    }

    /// Returns the identity of the object the issue is about.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.type_name.clone(), self.sync_id)
    }

    /// Strips the diagnostic message, keeping only the category.
    ///
    /// Used when the caller is not entitled to issue details.
    pub fn redacted(mut self) -> Self {
        self.message = match self.issue_type {
            SyncIssueType::Unknown => "the change could not be applied",
            SyncIssueType::Rejected => "the change was rejected",
            SyncIssueType::Unauthorized => "the change is not permitted",
            SyncIssueType::Malformed => "the change could not be read",
            SyncIssueType::ConstraintViolation => "the change violates a constraint",
        }
        .to_string();
        self
    }
}
