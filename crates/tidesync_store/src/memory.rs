//! In-memory repository with optional JSON snapshots.

use crate::clock::{Clock, SystemClock};
use crate::error::{StoreError, StoreResult};
use crate::repository::{PendingWrite, Repository, RowCursor, TombstoneCursor};
use crate::row::{ChangeWindow, Row};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tidesync_protocol::Tombstone;
use tracing::{debug, info};
use uuid::Uuid;

/// Snapshot format version.
pub const SNAPSHOT_FORMAT: u32 = 1;

/// A uniqueness constraint over payload fields of one type.
///
/// Soft-deleted rows and rows where any indexed field is missing or null
/// do not participate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueIndex {
    /// Type the index applies to.
    pub type_name: String,
    /// Top-level payload fields forming the key.
    pub fields: Vec<String>,
}

impl UniqueIndex {
    /// Declares an index.
    pub fn new(type_name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            type_name: type_name.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn key_of(&self, row: &Row) -> Option<String> {
        let mut parts = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            match row.data.get(field) {
                None | Some(serde_json::Value::Null) => return None,
                Some(value) => parts.push(value.to_string()),
            }
        }
        Some(parts.join("\u{1f}"))
    }

    fn check(&self, state: &State) -> StoreResult<()> {
        let Some(rows) = state.rows.get(&self.type_name) else {
            return Ok(());
        };

        let mut seen = HashSet::new();
        for row in rows.values().filter(|row| !row.is_deleted) {
            if let Some(key) = self.key_of(row) {
                if !seen.insert(key) {
                    return Err(StoreError::constraint(format!(
                        "unique index {}({}) violated by {}",
                        self.type_name,
                        self.fields.join(", "),
                        row.sync_id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct State {
    next_key: u64,
    rows: BTreeMap<String, BTreeMap<u64, Row>>,
    tombstones: BTreeMap<String, BTreeMap<Uuid, Tombstone>>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

impl State {
    fn apply(&mut self, write: PendingWrite, now: DateTime<Utc>) -> StoreResult<()> {
        match write {
            PendingWrite::Insert(mut row) => {
                row.changed_on = now;
                let rows = self.rows.entry(row.type_name.clone()).or_default();
                if rows.contains_key(&row.key) {
                    return Err(StoreError::constraint(format!(
                        "duplicate key {} for {}",
                        row.key, row.type_name
                    )));
                }
                if rows.values().any(|r| r.sync_id == row.sync_id) {
                    return Err(StoreError::constraint(format!(
                        "duplicate sync id {} for {}",
                        row.sync_id, row.type_name
                    )));
                }
                if let Some(tombstones) = self.tombstones.get_mut(&row.type_name) {
                    tombstones.remove(&row.sync_id);
                }
                self.next_key = self.next_key.max(row.key);
                rows.insert(row.key, row);
            }
            PendingWrite::Update(mut row) => {
                row.changed_on = now;
                let rows = self.rows.entry(row.type_name.clone()).or_default();
                let existing = rows.get(&row.key).ok_or_else(|| StoreError::KeyNotFound {
                    type_name: row.type_name.clone(),
                    key: row.key,
                })?;
                if existing.sync_id != row.sync_id {
                    if rows
                        .values()
                        .any(|r| r.key != row.key && r.sync_id == row.sync_id)
                    {
                        return Err(StoreError::constraint(format!(
                            "duplicate sync id {} for {}",
                            row.sync_id, row.type_name
                        )));
                    }
                    if let Some(tombstones) = self.tombstones.get_mut(&row.type_name) {
                        tombstones.remove(&row.sync_id);
                    }
                }
                rows.insert(row.key, row);
            }
            PendingWrite::Delete { row, mut tombstone } => {
                tombstone.changed_on = now;
                let removed = self
                    .rows
                    .get_mut(&row.type_name)
                    .and_then(|rows| rows.remove(&row.key));
                if removed.is_none() {
                    return Err(StoreError::KeyNotFound {
                        type_name: row.type_name,
                        key: row.key,
                    });
                }
                self.tombstones
                    .entry(tombstone.type_name.clone())
                    .or_default()
                    .insert(tombstone.sync_id, tombstone);
            }
            PendingWrite::Tombstone(mut tombstone) => {
                tombstone.changed_on = now;
                self.tombstones
                    .entry(tombstone.type_name.clone())
                    .or_default()
                    .insert(tombstone.sync_id, tombstone);
            }
        }
        Ok(())
    }

    fn backfill_tombstone_stamps(&mut self) -> usize {
        let mut filled = 0;
        for tombstone in self.tombstones.values_mut().flat_map(BTreeMap::values_mut) {
            if tombstone.changed_on == DateTime::<Utc>::default() {
                tombstone.changed_on = tombstone.created_on;
                filled += 1;
            }
        }
        filled
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    format: u32,
    state: State,
}

/// A repository held in memory.
///
/// Commits clone the current state, apply every write to the clone,
/// check constraints, then swap it in; a failed commit leaves the
/// repository untouched.
///
/// # Example
///
/// ```rust
/// use tidesync_store::{MemoryRepository, Repository, ChangeWindow};
///
/// let repo = MemoryRepository::new();
/// assert!(repo.query("Person", &ChangeWindow::all()).unwrap().is_empty());
/// ```
#[derive(Debug)]
pub struct MemoryRepository {
    state: RwLock<State>,
    indexes: Vec<UniqueIndex>,
    clock: Arc<dyn Clock>,
}

impl MemoryRepository {
    /// Creates an empty repository on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            indexes: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Adds a unique index.
    #[must_use]
    pub fn with_unique_index(mut self, index: UniqueIndex) -> Self {
        self.indexes.push(index);
        self
    }

    /// Loads a snapshot, or starts empty if `path` does not exist.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let repo = Self::new();
        if !path.exists() {
            debug!(path = %path.display(), "no snapshot, starting empty");
            return Ok(repo);
        }

        let data = fs::read(path)?;
        let snapshot: Snapshot = serde_json::from_slice(&data)?;
        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(StoreError::Corrupted(format!(
                "unsupported snapshot format {}",
                snapshot.format
            )));
        }
        let mut state = snapshot.state;
        let filled = state.backfill_tombstone_stamps();
        if filled > 0 {
            debug!(filled, "backfilled tombstone change stamps");
        }
        *repo.state.write() = state;
        Ok(repo)
    }

    /// Saves a snapshot.
    ///
    /// Writes to a sibling temp file, syncs it, then renames it over `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> StoreResult<()> {
        let path = path.as_ref();
        let snapshot = Snapshot {
            format: SNAPSHOT_FORMAT,
            state: self.state.read().clone(),
        };
        let data = serde_json::to_vec_pretty(&snapshot)?;

        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, path)?;
        debug!(path = %path.display(), bytes = data.len(), "snapshot saved");
        Ok(())
    }

    /// Returns the clock.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Removes tombstones created before `older_than`. Returns how many.
    pub fn prune_tombstones(&self, older_than: DateTime<Utc>) -> usize {
        let mut state = self.state.write();
        let mut pruned = 0;
        for tombstones in state.tombstones.values_mut() {
            let before = tombstones.len();
            tombstones.retain(|_, t| t.created_on >= older_than);
            pruned += before - tombstones.len();
        }
        info!(pruned, %older_than, "pruned tombstones");
        pruned
    }

    /// Returns every type name with rows or tombstones.
    pub fn type_names(&self) -> Vec<String> {
        let state = self.state.read();
        let names: BTreeSet<&String> = state
            .rows
            .keys()
            .chain(state.tombstones.keys())
            .collect();
        names.into_iter().cloned().collect()
    }

    /// Returns `(live, soft_deleted)` row counts for a type.
    pub fn row_counts(&self, type_name: &str) -> (usize, usize) {
        let state = self.state.read();
        state
            .rows
            .get(type_name)
            .map(|rows| {
                let deleted = rows.values().filter(|r| r.is_deleted).count();
                (rows.len() - deleted, deleted)
            })
            .unwrap_or((0, 0))
    }

    /// Returns the tombstone count for a type.
    pub fn tombstone_count(&self, type_name: &str) -> usize {
        self.state
            .read()
            .tombstones
            .get(type_name)
            .map_or(0, BTreeMap::len)
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl Repository for MemoryRepository {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn allocate_key(&self) -> u64 {
        let mut state = self.state.write();
        state.next_key += 1;
        state.next_key
    }

    fn query(&self, type_name: &str, window: &ChangeWindow) -> StoreResult<Vec<Row>> {
        let state = self.state.read();
        let mut rows: Vec<Row> = state
            .rows
            .get(type_name)
            .map(|rows| {
                rows.values()
                    .filter(|row| window.contains(row.changed_on))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| (a.changed_on, a.key).cmp(&(b.changed_on, b.key)));
        Ok(rows)
    }

    fn query_page(
        &self,
        type_name: &str,
        window: &ChangeWindow,
        after: Option<RowCursor>,
        limit: usize,
    ) -> StoreResult<Vec<Row>> {
        let state = self.state.read();
        let Some(rows) = state.rows.get(type_name) else {
            return Ok(Vec::new());
        };
        let mut page: Vec<&Row> = rows
            .values()
            .filter(|row| window.contains(row.changed_on))
            .filter(|row| after.map_or(true, |cursor| (row.changed_on, row.key) > cursor))
            .collect();
        page.sort_by_key(|row| (row.changed_on, row.key));
        Ok(page.into_iter().take(limit).cloned().collect())
    }

    fn rows(&self, type_name: &str) -> StoreResult<Vec<Row>> {
        let state = self.state.read();
        Ok(state
            .rows
            .get(type_name)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn find_by_sync_id(&self, type_name: &str, sync_id: Uuid) -> StoreResult<Option<Row>> {
        let state = self.state.read();
        Ok(state
            .rows
            .get(type_name)
            .and_then(|rows| rows.values().find(|row| row.sync_id == sync_id))
            .cloned())
    }

    fn find_by_key(&self, type_name: &str, key: u64) -> StoreResult<Option<Row>> {
        let state = self.state.read();
        Ok(state
            .rows
            .get(type_name)
            .and_then(|rows| rows.get(&key))
            .cloned())
    }

    fn tombstones(&self, type_name: &str, window: &ChangeWindow) -> StoreResult<Vec<Tombstone>> {
        let state = self.state.read();
        let mut tombstones: Vec<Tombstone> = state
            .tombstones
            .get(type_name)
            .map(|tombstones| {
                tombstones
                    .values()
                    .filter(|t| window.contains(t.changed_on))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        tombstones.sort_by(|a, b| (a.changed_on, a.sync_id).cmp(&(b.changed_on, b.sync_id)));
        Ok(tombstones)
    }

    fn tombstones_page(
        &self,
        type_name: &str,
        window: &ChangeWindow,
        after: Option<TombstoneCursor>,
        limit: usize,
    ) -> StoreResult<Vec<Tombstone>> {
        let state = self.state.read();
        let Some(tombstones) = state.tombstones.get(type_name) else {
            return Ok(Vec::new());
        };
        let mut page: Vec<&Tombstone> = tombstones
            .values()
            .filter(|t| window.contains(t.changed_on))
            .filter(|t| after.map_or(true, |cursor| (t.changed_on, t.sync_id) > cursor))
            .collect();
        page.sort_by_key(|t| (t.changed_on, t.sync_id));
        Ok(page.into_iter().take(limit).cloned().collect())
    }

    fn find_tombstone(&self, type_name: &str, sync_id: Uuid) -> StoreResult<Option<Tombstone>> {
        let state = self.state.read();
        Ok(state
            .tombstones
            .get(type_name)
            .and_then(|tombstones| tombstones.get(&sync_id))
            .cloned())
    }

    fn commit(&self, writes: Vec<PendingWrite>) -> StoreResult<usize> {
        if writes.is_empty() {
            return Ok(0);
        }

        let mut guard = self.state.write();
        // Stamped under the lock so commits are totally ordered by stamp.
        let now = self.clock.now();
        let mut next = guard.clone();
        let count = writes.len();
        let mut touched = BTreeSet::new();

        for write in writes {
            touched.insert(write.type_name().to_string());
            next.apply(write, now)?;
        }
        for index in self.indexes.iter().filter(|i| touched.contains(&i.type_name)) {
            index.check(&next)?;
        }

        *guard = next;
        debug!(count, "committed writes");
        Ok(count)
    }

    fn metadata(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.state.read().metadata.get(key).cloned())
    }

    fn set_metadata(&self, key: &str, value: &str) -> StoreResult<()> {
        self.state
            .write()
            .metadata
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
