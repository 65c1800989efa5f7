//! The repository contract consumed by sync clients.

use crate::error::StoreResult;
use crate::row::{ChangeWindow, Row};
use chrono::{DateTime, Utc};
use tidesync_protocol::Tombstone;
use uuid::Uuid;

/// A staged write, applied atomically by [`Repository::commit`].
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    /// Insert a new row. Removes any tombstone with the same sync id.
    Insert(Row),
    /// Replace the row with the same key.
    Update(Row),
    /// Remove the row permanently and record the tombstone.
    Delete {
        /// The row being removed.
        row: Row,
        /// Marker left behind for peers.
        tombstone: Tombstone,
    },
    /// Record a tombstone without touching any row.
    Tombstone(Tombstone),
}

impl PendingWrite {
    /// Returns the type name the write touches.
    pub fn type_name(&self) -> &str {
        match self {
            PendingWrite::Insert(row) | PendingWrite::Update(row) => &row.type_name,
            PendingWrite::Delete { row, .. } => &row.type_name,
            PendingWrite::Tombstone(tombstone) => &tombstone.type_name,
        }
    }
}

/// Resume point of a paged row read: the `(changed_on, key)` of the last
/// row returned.
pub type RowCursor = (DateTime<Utc>, u64);

/// Resume point of a paged tombstone read: the `(changed_on, sync_id)` of
/// the last tombstone returned.
pub type TombstoneCursor = (DateTime<Utc>, Uuid);

/// A keyed store of sync rows and tombstones.
///
/// # Invariants
///
/// - `commit` stamps `changed_on` with [`Repository::now`] on every inserted
///   or updated row and every recorded tombstone, taken after the commit
///   has excluded other writers
/// - `query_page` and `tombstones_page` return the same order as `query`
///   and `tombstones`, strictly after the cursor
/// - `query` returns rows whose `changed_on` lies in the window, ordered by
///   `(changed_on, key)`, soft-deleted rows included
/// - `commit` applies every write or none of them; a constraint violation
///   fails the whole commit
/// - a sync id names at most one row per type
///
/// Implementations must be `Send + Sync`; their internal locking is their
/// own concern.
pub trait Repository: Send + Sync {
    /// Returns the repository's notion of "now".
    fn now(&self) -> DateTime<Utc>;

    /// Reserves a fresh local key.
    fn allocate_key(&self) -> u64;

    /// Returns rows of `type_name` changed inside `window`.
    fn query(&self, type_name: &str, window: &ChangeWindow) -> StoreResult<Vec<Row>>;

    /// Returns at most `limit` rows of `type_name` changed inside `window`,
    /// in `query` order, starting strictly after `after`.
    fn query_page(
        &self,
        type_name: &str,
        window: &ChangeWindow,
        after: Option<RowCursor>,
        limit: usize,
    ) -> StoreResult<Vec<Row>>;

    /// Returns every row of `type_name`, ordered by key.
    fn rows(&self, type_name: &str) -> StoreResult<Vec<Row>>;

    /// Finds a row by sync id.
    fn find_by_sync_id(&self, type_name: &str, sync_id: Uuid) -> StoreResult<Option<Row>>;

    /// Finds a row by local key.
    fn find_by_key(&self, type_name: &str, key: u64) -> StoreResult<Option<Row>>;

    /// Returns tombstones of `type_name` committed inside `window`, ordered
    /// by `(changed_on, sync_id)`.
    fn tombstones(&self, type_name: &str, window: &ChangeWindow) -> StoreResult<Vec<Tombstone>>;

    /// Returns at most `limit` tombstones of `type_name` committed inside
    /// `window`, in `tombstones` order, starting strictly after `after`.
    fn tombstones_page(
        &self,
        type_name: &str,
        window: &ChangeWindow,
        after: Option<TombstoneCursor>,
        limit: usize,
    ) -> StoreResult<Vec<Tombstone>>;

    /// Finds the tombstone for a sync id.
    fn find_tombstone(&self, type_name: &str, sync_id: Uuid) -> StoreResult<Option<Tombstone>>;

    /// Applies `writes` atomically and returns the number applied.
    fn commit(&self, writes: Vec<PendingWrite>) -> StoreResult<usize>;

    /// Reads a metadata value.
    fn metadata(&self, key: &str) -> StoreResult<Option<String>>;

    /// Writes a metadata value.
    fn set_metadata(&self, key: &str, value: &str) -> StoreResult<()>;
}
