//! The contract every syncable entity type implements.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sync bookkeeping carried by every syncable entity.
///
/// Entities embed this with `#[serde(flatten)]` so the payload of a
/// [`crate::SyncObject`] always carries its own identity and timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    /// Peer-stable identity. Assigned once, never reused.
    pub sync_id: Uuid,
    /// When the entity was first written on the peer that created it.
    pub created_on: DateTime<Utc>,
    /// Last-write timestamp used for ordering and staleness checks.
    pub modified_on: DateTime<Utc>,
}

impl SyncMeta {
    /// Creates metadata for a brand new entity.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            sync_id: Uuid::new_v4(),
            created_on: now,
            modified_on: now,
        }
    }

    /// Returns true if no sync id has been assigned yet.
    pub fn is_unassigned(&self) -> bool {
        self.sync_id.is_nil()
    }
}

impl Default for SyncMeta {
    fn default() -> Self {
        Self {
            sync_id: Uuid::nil(),
            created_on: crate::full_sync_watermark(),
            modified_on: crate::full_sync_watermark(),
        }
    }
}

/// A domain type that participates in sync.
///
/// Implementations copy fields explicitly in [`SyncEntity::update_from`];
/// the engine never relies on reflection to move data between values.
pub trait SyncEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Stable logical type name used on the wire.
    const TYPE_NAME: &'static str;

    /// Returns the sync metadata.
    fn meta(&self) -> &SyncMeta;

    /// Returns the sync metadata mutably.
    fn meta_mut(&mut self) -> &mut SyncMeta;

    /// Copies every non-identity field from `other` onto `self`.
    ///
    /// Must not touch `sync_id`; timestamps are managed by the caller.
    fn update_from(&mut self, other: &Self);

    /// Returns the sync id.
    fn sync_id(&self) -> Uuid {
        self.meta().sync_id
    }

    /// Returns the creation timestamp.
    fn created_on(&self) -> DateTime<Utc> {
        self.meta().created_on
    }

    /// Returns the last-write timestamp.
    fn modified_on(&self) -> DateTime<Utc> {
        self.meta().modified_on
    }
}
