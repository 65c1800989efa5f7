//! Durable deletion markers.

use crate::object::{ObjectKey, SyncObject};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Records that an entity was permanently removed.
///
/// A tombstone outlives the row it refers to, so a peer whose watermark
/// predates the deletion still learns about it. Tombstones are only pruned
/// by policy outside the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    /// Logical type of the deleted entity.
    pub type_name: String,
    /// Local storage key the entity had on the peer that deleted it.
    pub reference_id: String,
    /// Sync id of the deleted entity.
    pub sync_id: Uuid,
    /// When the deletion happened.
    pub created_on: DateTime<Utc>,
    /// When the tombstone was committed to the local store.
    ///
    /// Local to each repository, like a row's change stamp; change windows
    /// select tombstones by it. Snapshots written before the field existed
    /// load with the epoch and are backfilled from `created_on`.
    #[serde(default)]
    pub changed_on: DateTime<Utc>,
}

impl Tombstone {
    /// Creates a tombstone.
    pub fn new(
        type_name: impl Into<String>,
        reference_id: impl Into<String>,
        sync_id: Uuid,
        created_on: DateTime<Utc>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            reference_id: reference_id.into(),
            sync_id,
            created_on,
            changed_on: created_on,
        }
    }

    /// Returns the identity of the deleted entity.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.type_name.clone(), self.sync_id)
    }

    /// Converts to a deletion envelope for `wire_type`.
    ///
    /// `wire_type` differs from `type_name` when an outgoing converter maps
    /// the storage type to another wire type.
    pub fn to_sync_object(&self, wire_type: &str) -> SyncObject {
        let data = serde_json::to_string(self).unwrap_or_default();
        SyncObject::deleted(wire_type, self.sync_id, self.created_on, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::SyncStatus;

    #[test]
    fn tombstone_envelope() {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let tombstone = Tombstone::new("Person", "42", id, now);

        let object = tombstone.to_sync_object("Person");
        assert_eq!(object.status, SyncStatus::Deleted);
        assert_eq!(object.sync_id, id);
        assert_eq!(object.modified_on, now);

        let decoded: Tombstone = serde_json::from_str(&object.data).unwrap();
        assert_eq!(decoded, tombstone);
    }

    #[test]
    fn change_stamp_defaults_for_older_data() {
        let id = Uuid::new_v4();
        let data = format!(
            r#"{{"typeName":"Person","referenceId":"1","syncId":"{id}","createdOn":"2024-03-01T09:00:00Z"}}"#
        );
        let tombstone: Tombstone = serde_json::from_str(&data).unwrap();
        assert_eq!(tombstone.changed_on, DateTime::<Utc>::default());
        let fresh = Tombstone::new("P", "1", id, tombstone.created_on);
        assert_eq!(fresh.changed_on, tombstone.created_on);
    }

    #[test]
    fn wire_type_can_differ() {
        let tombstone = Tombstone::new("AccountEntity", "7", Uuid::new_v4(), Utc::now());
        let object = tombstone.to_sync_object("Account");
        assert_eq!(object.type_name, "Account");
        assert_eq!(tombstone.key().type_name, "AccountEntity");
    }
}
