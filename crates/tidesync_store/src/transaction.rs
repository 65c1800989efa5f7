//! Unit of work over a repository.

use crate::error::{StoreError, StoreResult};
use crate::repository::{PendingWrite, Repository};
use crate::row::Row;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tidesync_protocol::{SyncEntity, Tombstone};
use uuid::Uuid;

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Writes may be staged.
    Active,
    /// Writes were committed.
    Committed,
    /// Writes were discarded.
    Aborted,
}

/// Staged writes over a [`Repository`].
///
/// Reads see the transaction's own writes. Nothing reaches the repository
/// until [`Transaction::save_changes`]; dropping an unsaved transaction
/// discards its writes.
pub struct Transaction<'a> {
    repo: &'a dyn Repository,
    writes: Vec<PendingWrite>,
    /// (type_name, key) -> staged row, `None` once deleted.
    staged: HashMap<(String, u64), Option<Row>>,
    /// (type_name, sync_id) -> staged tombstone, `None` once resurrected.
    tombstones: HashMap<(String, Uuid), Option<Tombstone>>,
    state: TransactionState,
}

impl<'a> Transaction<'a> {
    /// Starts a transaction.
    pub fn new(repo: &'a dyn Repository) -> Self {
        Self {
            repo,
            writes: Vec::new(),
            staged: HashMap::new(),
            tombstones: HashMap::new(),
            state: TransactionState::Active,
        }
    }

    /// Returns the underlying repository.
    pub fn repository(&self) -> &'a dyn Repository {
        self.repo
    }

    /// Returns the repository's "now".
    pub fn now(&self) -> DateTime<Utc> {
        self.repo.now()
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Returns true while writes may be staged.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Returns the number of staged writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Finds a row by sync id, soft-deleted rows included.
    pub fn find_row(&self, type_name: &str, sync_id: Uuid) -> StoreResult<Option<Row>> {
        let staged = self.staged.iter().find_map(|((t, _), row)| match row {
            Some(row) if t == type_name && row.sync_id == sync_id => Some(row.clone()),
            _ => None,
        });
        if staged.is_some() {
            return Ok(staged);
        }

        // A committed row shadowed by a staged write no longer answers to
        // this sync id.
        match self.repo.find_by_sync_id(type_name, sync_id)? {
            Some(row) if self.staged.contains_key(&(type_name.to_string(), row.key)) => Ok(None),
            other => Ok(other),
        }
    }

    /// Finds a row by local key, soft-deleted rows included.
    pub fn find_row_by_key(&self, type_name: &str, key: u64) -> StoreResult<Option<Row>> {
        match self.staged.get(&(type_name.to_string(), key)) {
            Some(staged) => Ok(staged.clone()),
            None => self.repo.find_by_key(type_name, key),
        }
    }

    /// Returns every row of a type, soft-deleted rows included.
    pub fn rows(&self, type_name: &str) -> StoreResult<Vec<Row>> {
        let mut rows: BTreeMap<u64, Row> = self
            .repo
            .rows(type_name)?
            .into_iter()
            .map(|row| (row.key, row))
            .collect();

        for ((t, key), staged) in &self.staged {
            if t != type_name {
                continue;
            }
            match staged {
                Some(row) => {
                    rows.insert(*key, row.clone());
                }
                None => {
                    rows.remove(key);
                }
            }
        }
        Ok(rows.into_values().collect())
    }

    /// Finds a tombstone by sync id.
    pub fn find_tombstone(&self, type_name: &str, sync_id: Uuid) -> StoreResult<Option<Tombstone>> {
        match self.tombstones.get(&(type_name.to_string(), sync_id)) {
            Some(staged) => Ok(staged.clone()),
            None => self.repo.find_tombstone(type_name, sync_id),
        }
    }

    /// Stages a new row as-is.
    pub fn insert_row(&mut self, row: Row) -> StoreResult<()> {
        self.ensure_active()?;
        self.tombstones
            .insert((row.type_name.clone(), row.sync_id), None);
        self.staged
            .insert((row.type_name.clone(), row.key), Some(row.clone()));
        self.writes.push(PendingWrite::Insert(row));
        Ok(())
    }

    /// Stages a replacement row as-is.
    pub fn update_row(&mut self, row: Row) -> StoreResult<()> {
        self.ensure_active()?;
        self.staged
            .insert((row.type_name.clone(), row.key), Some(row.clone()));
        self.writes.push(PendingWrite::Update(row));
        Ok(())
    }

    /// Stages a permanent delete and returns the tombstone it leaves.
    pub fn delete_row(&mut self, row: Row, deleted_on: DateTime<Utc>) -> StoreResult<Tombstone> {
        self.ensure_active()?;
        let tombstone = Tombstone::new(
            row.type_name.clone(),
            row.key.to_string(),
            row.sync_id,
            deleted_on,
        );
        self.staged.insert((row.type_name.clone(), row.key), None);
        self.tombstones.insert(
            (tombstone.type_name.clone(), tombstone.sync_id),
            Some(tombstone.clone()),
        );
        self.writes.push(PendingWrite::Delete {
            row,
            tombstone: tombstone.clone(),
        });
        Ok(tombstone)
    }

    /// Stages a tombstone on its own.
    pub fn put_tombstone(&mut self, tombstone: Tombstone) -> StoreResult<()> {
        self.ensure_active()?;
        self.tombstones.insert(
            (tombstone.type_name.clone(), tombstone.sync_id),
            Some(tombstone.clone()),
        );
        self.writes.push(PendingWrite::Tombstone(tombstone));
        Ok(())
    }

    /// Adds a new entity, stamping its sync id (if unassigned) and
    /// timestamps. Returns the local key.
    pub fn add<T: SyncEntity>(&mut self, entity: &mut T) -> StoreResult<u64> {
        let now = self.repo.now();
        let meta = entity.meta_mut();
        if meta.is_unassigned() {
            meta.sync_id = Uuid::new_v4();
        }
        meta.created_on = now;
        meta.modified_on = now;

        let key = self.repo.allocate_key();
        self.insert_row(Row::from_entity(key, entity)?)?;
        Ok(key)
    }

    /// Writes an existing entity, bumping `modified_on`.
    pub fn update<T: SyncEntity>(&mut self, entity: &mut T) -> StoreResult<()> {
        let sync_id = entity.sync_id();
        let mut row = self
            .find_row(T::TYPE_NAME, sync_id)?
            .ok_or_else(|| StoreError::not_found(T::TYPE_NAME, sync_id))?;

        let now = self.repo.now();
        let meta = entity.meta_mut();
        meta.created_on = row.created_on;
        meta.modified_on = now;

        row.set_entity(entity)?;
        self.update_row(row)
    }

    /// Permanently removes an entity, leaving a tombstone.
    pub fn remove<T: SyncEntity>(&mut self, sync_id: Uuid) -> StoreResult<Tombstone> {
        let row = self
            .find_row(T::TYPE_NAME, sync_id)?
            .ok_or_else(|| StoreError::not_found(T::TYPE_NAME, sync_id))?;
        let now = self.repo.now();
        self.delete_row(row, now)
    }

    /// Marks an entity deleted while keeping its row.
    pub fn soft_delete<T: SyncEntity>(&mut self, sync_id: Uuid) -> StoreResult<()> {
        let mut row = self
            .find_row(T::TYPE_NAME, sync_id)?
            .ok_or_else(|| StoreError::not_found(T::TYPE_NAME, sync_id))?;
        row.is_deleted = true;
        row.modified_on = self.repo.now();
        self.update_row(row)
    }

    /// Finds a live (not soft-deleted) entity.
    pub fn find<T: SyncEntity>(&self, sync_id: Uuid) -> StoreResult<Option<T>> {
        match self.find_row(T::TYPE_NAME, sync_id)? {
            Some(row) if !row.is_deleted => Ok(Some(row.to_entity()?)),
            _ => Ok(None),
        }
    }

    /// Returns every live entity of a type.
    pub fn all<T: SyncEntity>(&self) -> StoreResult<Vec<T>> {
        self.rows(T::TYPE_NAME)?
            .iter()
            .filter(|row| !row.is_deleted)
            .map(Row::to_entity)
            .collect()
    }

    /// Commits the staged writes and returns the number applied.
    ///
    /// On failure nothing is written and the transaction is aborted.
    pub fn save_changes(&mut self) -> StoreResult<usize> {
        self.ensure_active()?;
        let writes = std::mem::take(&mut self.writes);
        self.staged.clear();
        self.tombstones.clear();

        match self.repo.commit(writes) {
            Ok(count) => {
                self.state = TransactionState::Committed;
                Ok(count)
            }
            Err(e) => {
                self.state = TransactionState::Aborted;
                Err(e)
            }
        }
    }

    /// Discards the staged writes.
    pub fn rollback(&mut self) {
        self.writes.clear();
        self.staged.clear();
        self.tombstones.clear();
        self.state = TransactionState::Aborted;
    }

    fn ensure_active(&self) -> StoreResult<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            _ => Err(StoreError::TransactionClosed),
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.is_active() && !self.writes.is_empty() {
            tracing::debug!(
                pending = self.writes.len(),
                "transaction dropped without saving; discarding writes"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRepository;
    use serde::{Deserialize, Serialize};
    use tidesync_protocol::SyncMeta;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Task {
        #[serde(flatten)]
        meta: SyncMeta,
        title: String,
    }

    impl SyncEntity for Task {
        const TYPE_NAME: &'static str = "Task";

        fn meta(&self) -> &SyncMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut SyncMeta {
            &mut self.meta
        }

        fn update_from(&mut self, other: &Self) {
            self.title = other.title.clone();
        }
    }

    fn task(title: &str) -> Task {
        Task {
            title: title.into(),
            ..Task::default()
        }
    }

    #[test]
    fn add_assigns_identity() {
        let repo = MemoryRepository::new();
        let mut txn = Transaction::new(&repo);

        let mut t = task("write docs");
        txn.add(&mut t).unwrap();
        assert!(!t.meta.is_unassigned());
        assert_eq!(t.meta.created_on, t.meta.modified_on);
        assert_eq!(txn.save_changes().unwrap(), 1);
        assert_eq!(txn.state(), TransactionState::Committed);
    }

    #[test]
    fn reads_see_own_writes() {
        let repo = MemoryRepository::new();
        let mut txn = Transaction::new(&repo);

        let mut t = task("a");
        txn.add(&mut t).unwrap();

        let found: Task = txn.find(t.sync_id()).unwrap().unwrap();
        assert_eq!(found.title, "a");
        assert_eq!(txn.all::<Task>().unwrap().len(), 1);

        // Not visible outside until saved.
        assert!(repo.find_by_sync_id("Task", t.sync_id()).unwrap().is_none());
    }

    #[test]
    fn drop_without_save_rolls_back() {
        let repo = MemoryRepository::new();
        {
            let mut txn = Transaction::new(&repo);
            txn.add(&mut task("lost")).unwrap();
        }
        assert!(repo.rows("Task").unwrap().is_empty());
    }

    #[test]
    fn closed_transaction_rejects_writes() {
        let repo = MemoryRepository::new();
        let mut txn = Transaction::new(&repo);
        txn.save_changes().unwrap();

        let result = txn.add(&mut task("late"));
        assert!(matches!(result, Err(StoreError::TransactionClosed)));
    }

    #[test]
    fn update_bumps_modified_on() {
        let repo = MemoryRepository::new();
        let mut t = task("a");
        let mut txn = Transaction::new(&repo);
        txn.add(&mut t).unwrap();
        txn.save_changes().unwrap();

        let created = t.meta.created_on;
        t.title = "b".into();
        let mut txn = Transaction::new(&repo);
        txn.update(&mut t).unwrap();
        txn.save_changes().unwrap();

        assert_eq!(t.meta.created_on, created);
        assert!(t.meta.modified_on >= created);
        let stored: Task = repo
            .find_by_sync_id("Task", t.sync_id())
            .unwrap()
            .unwrap()
            .to_entity()
            .unwrap();
        assert_eq!(stored.title, "b");
    }

    #[test]
    fn remove_leaves_tombstone() {
        let repo = MemoryRepository::new();
        let mut t = task("a");
        let mut txn = Transaction::new(&repo);
        txn.add(&mut t).unwrap();
        txn.save_changes().unwrap();

        let mut txn = Transaction::new(&repo);
        let tombstone = txn.remove::<Task>(t.sync_id()).unwrap();
        assert!(txn.find::<Task>(t.sync_id()).unwrap().is_none());
        assert!(txn.find_tombstone("Task", t.sync_id()).unwrap().is_some());
        txn.save_changes().unwrap();

        assert_eq!(tombstone.sync_id, t.sync_id());
        assert!(repo.find_by_sync_id("Task", t.sync_id()).unwrap().is_none());
        assert_eq!(repo.find_tombstone("Task", t.sync_id()).unwrap(), Some(tombstone));
    }

    #[test]
    fn soft_delete_keeps_row() {
        let repo = MemoryRepository::new();
        let mut t = task("a");
        let mut txn = Transaction::new(&repo);
        txn.add(&mut t).unwrap();
        txn.soft_delete::<Task>(t.sync_id()).unwrap();
        txn.save_changes().unwrap();

        let row = repo.find_by_sync_id("Task", t.sync_id()).unwrap().unwrap();
        assert!(row.is_deleted);
        let txn = Transaction::new(&repo);
        assert!(txn.find::<Task>(t.sync_id()).unwrap().is_none());
    }

    #[test]
    fn missing_row_is_not_found() {
        let repo = MemoryRepository::new();
        let mut txn = Transaction::new(&repo);
        let result = txn.remove::<Task>(Uuid::new_v4());
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }
}
