//! The wire envelope for one entity change.

use crate::entity::SyncEntity;
use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Change status of a [`SyncObject`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Entity was created inside the change window.
    Added,
    /// Entity existed before the window and was changed inside it.
    Modified,
    /// Entity was deleted (soft delete or tombstone).
    Deleted,
    /// Entity is unchanged; used for corrections that restate a value.
    Unmodified,
}

impl SyncStatus {
    /// Returns true for [`SyncStatus::Deleted`].
    pub fn is_deleted(&self) -> bool {
        matches!(self, SyncStatus::Deleted)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStatus::Added => "added",
            SyncStatus::Modified => "modified",
            SyncStatus::Deleted => "deleted",
            SyncStatus::Unmodified => "unmodified",
        };
        f.write_str(name)
    }
}

/// Identity of an object across peers: its logical type and sync id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectKey {
    /// Logical type name.
    pub type_name: String,
    /// Sync id.
    pub sync_id: Uuid,
}

impl ObjectKey {
    /// Creates a new key.
    pub fn new(type_name: impl Into<String>, sync_id: Uuid) -> Self {
        Self {
            type_name: type_name.into(),
            sync_id,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_name, self.sync_id)
    }
}

/// A single entity change as it travels between peers.
///
/// # Fields
///
/// - `type_name`: logical type of the entity
/// - `sync_id`: peer-stable identity, immutable after first assignment
/// - `data`: JSON payload (the entity itself, or the tombstone for deletions)
/// - `status`: added, modified, deleted or unmodified
/// - `modified_on`: last-write timestamp of the change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncObject {
    /// Logical type name.
    pub type_name: String,
    /// Sync id.
    pub sync_id: Uuid,
    /// Serialized payload (JSON).
    pub data: String,
    /// Change status.
    pub status: SyncStatus,
    /// Last-write timestamp.
    pub modified_on: DateTime<Utc>,
}

impl SyncObject {
    /// Encodes an entity into an envelope with the given status.
    pub fn from_entity<T: SyncEntity>(entity: &T, status: SyncStatus) -> ProtocolResult<Self> {
        Ok(Self {
            type_name: T::TYPE_NAME.to_string(),
            sync_id: entity.sync_id(),
            data: serde_json::to_string(entity)?,
            status,
            modified_on: entity.modified_on(),
        })
    }

    /// Creates a deletion envelope. `data` is informational only.
    pub fn deleted(
        type_name: impl Into<String>,
        sync_id: Uuid,
        modified_on: DateTime<Utc>,
        data: String,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            sync_id,
            data,
            status: SyncStatus::Deleted,
            modified_on,
        }
    }

    /// Decodes the payload as `T`.
    ///
    /// The envelope's type name must equal `T::TYPE_NAME` and the payload's
    /// sync id must equal the envelope's. A payload without a sync id takes
    /// the envelope's.
    pub fn to_entity<T: SyncEntity>(&self) -> ProtocolResult<T> {
        if self.type_name != T::TYPE_NAME {
            return Err(ProtocolError::TypeMismatch {
                expected: T::TYPE_NAME.to_string(),
                actual: self.type_name.clone(),
            });
        }
        if self.data.trim().is_empty() {
            return Err(ProtocolError::MissingPayload {
                type_name: self.type_name.clone(),
                sync_id: self.sync_id,
            });
        }

        let mut entity: T = serde_json::from_str(&self.data)?;
        let payload_id = entity.sync_id();
        if payload_id.is_nil() {
            entity.meta_mut().sync_id = self.sync_id;
        } else if payload_id != self.sync_id {
            return Err(ProtocolError::SyncIdMismatch {
                envelope: self.sync_id,
                payload: payload_id,
            });
        }
        Ok(entity)
    }

    /// Returns the object's identity.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.type_name.clone(), self.sync_id)
    }
}
