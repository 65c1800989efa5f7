//! Stored rows and change windows.

use crate::error::StoreResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tidesync_protocol::{ObjectKey, SyncEntity, SyncMeta};
use uuid::Uuid;

/// One stored entity.
///
/// The sync columns (`sync_id`, `created_on`, `modified_on`) are
/// authoritative; the copies inside `data` are overwritten on decode.
///
/// `modified_on` is the entity's version and travels between peers
/// unchanged. `changed_on` is local: the repository stamps it on every
/// commit, and change windows are evaluated against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    /// Logical type name.
    pub type_name: String,
    /// Local storage key, unique per repository.
    pub key: u64,
    /// Peer-stable identity.
    pub sync_id: Uuid,
    /// Creation timestamp.
    pub created_on: DateTime<Utc>,
    /// Last-write timestamp (the entity's version).
    pub modified_on: DateTime<Utc>,
    /// When this repository last wrote the row.
    pub changed_on: DateTime<Utc>,
    /// Soft-delete flag.
    pub is_deleted: bool,
    /// The entity as JSON.
    pub data: serde_json::Value,
}

impl Row {
    /// Builds a row for `entity` under local key `key`.
    pub fn from_entity<T: SyncEntity>(key: u64, entity: &T) -> StoreResult<Self> {
        let meta = entity.meta();
        Ok(Self {
            type_name: T::TYPE_NAME.to_string(),
            key,
            sync_id: meta.sync_id,
            created_on: meta.created_on,
            modified_on: meta.modified_on,
            changed_on: meta.modified_on,
            is_deleted: false,
            data: serde_json::to_value(entity)?,
        })
    }

    /// Decodes the row as `T`, with the row's sync columns applied.
    pub fn to_entity<T: SyncEntity>(&self) -> StoreResult<T> {
        let mut entity: T = serde_json::from_value(self.data.clone())?;
        *entity.meta_mut() = self.meta();
        Ok(entity)
    }

    /// Replaces the payload with `entity`, keeping key and delete flag.
    pub fn set_entity<T: SyncEntity>(&mut self, entity: &T) -> StoreResult<()> {
        let meta = entity.meta();
        self.sync_id = meta.sync_id;
        self.created_on = meta.created_on;
        self.modified_on = meta.modified_on;
        self.data = serde_json::to_value(entity)?;
        Ok(())
    }

    /// Returns the sync columns.
    pub fn meta(&self) -> SyncMeta {
        SyncMeta {
            sync_id: self.sync_id,
            created_on: self.created_on,
            modified_on: self.modified_on,
        }
    }

    /// Returns the row's identity.
    pub fn object_key(&self) -> ObjectKey {
        ObjectKey::new(self.type_name.clone(), self.sync_id)
    }
}

/// A half-open time window `[since, until)` over local change time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeWindow {
    /// Inclusive lower bound.
    pub since: DateTime<Utc>,
    /// Exclusive upper bound.
    pub until: DateTime<Utc>,
}

impl ChangeWindow {
    /// Creates a window.
    pub fn new(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self { since, until }
    }

    /// A window covering all of time.
    pub fn all() -> Self {
        Self::new(DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC)
    }

    /// Returns true if `instant` lies in the window.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.since <= instant && instant < self.until
    }

    /// Returns true if the window is empty.
    pub fn is_empty(&self) -> bool {
        self.since >= self.until
    }
}
