//! Repository-backed sync client.

use crate::client::SyncClient;
use crate::config::{DEFAULT_PRIMARY_KEY_CACHE_TIMEOUT, DEFAULT_SESSION_IDLE_TIMEOUT};
use crate::converter::IncomingHandler;
use crate::error::{SyncError, SyncResult, SyncUpdateError};
use crate::filter::SyncFilter;
use crate::policy::{LocalPolicy, SyncPolicy, SyncRegistry};
use crate::session::{ChangeScan, ScanPosition, SyncSession, SyncState};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tidesync_protocol::{
    BeginSyncResponse, ChangeRequest, ServiceResult, SyncIssue, SyncIssueType, SyncObject,
    SyncOptions, SyncStatus, Tombstone,
};
use tidesync_store::{ChangeWindow, Repository, Row, StoreError, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Rows or tombstones fetched from the repository per read while paging.
const SCAN_BATCH: usize = 256;

/// One change visible to a session.
enum Change {
    Row(Row),
    Tombstone(Tombstone),
}

/// Outcome of applying one object that did not simply succeed.
enum ApplyFailure {
    /// The object failed; the batch carries on.
    Issue(SyncIssue),
    /// The batch fails.
    Fatal(SyncError),
}

impl From<StoreError> for ApplyFailure {
    fn from(err: StoreError) -> Self {
        ApplyFailure::Fatal(err.into())
    }
}

impl From<SyncError> for ApplyFailure {
    fn from(err: SyncError) -> Self {
        ApplyFailure::Fatal(err)
    }
}

fn issue(issue_type: SyncIssueType, object: &SyncObject, message: impl Into<String>) -> ApplyFailure {
    ApplyFailure::Issue(SyncIssue::new(issue_type, object, message))
}

fn rejection(object: &SyncObject, error: Option<SyncUpdateError>) -> ApplyFailure {
    match error {
        Some(e) => issue(e.issue_type, object, e.message),
        None => issue(
            SyncIssueType::Rejected,
            object,
            format!("{} {} was rejected", object.type_name, object.sync_id),
        ),
    }
}

/// A local row matched to an incoming object.
struct LocalMatch {
    row: Row,
    by_lookup: bool,
}

/// A [`SyncClient`] over a local [`Repository`].
///
/// Each `apply_*` call is one transaction: per-object failures become
/// issues, anything else (including a constraint violation at commit)
/// fails the whole batch and leaves the repository untouched.
pub struct DatabaseSyncClient {
    repo: Arc<dyn Repository>,
    policy: Arc<dyn SyncPolicy>,
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<SyncSession>>>>,
    cache_timeout: Duration,
    session_timeout: Duration,
}

impl DatabaseSyncClient {
    /// Creates a client that opens sessions under `policy`.
    pub fn new(repo: Arc<dyn Repository>, policy: Arc<dyn SyncPolicy>) -> Self {
        Self {
            repo,
            policy,
            sessions: RwLock::new(HashMap::new()),
            cache_timeout: DEFAULT_PRIMARY_KEY_CACHE_TIMEOUT,
            session_timeout: DEFAULT_SESSION_IDLE_TIMEOUT,
        }
    }

    /// Creates a client for a peer's own repository.
    pub fn local(repo: Arc<dyn Repository>, registry: SyncRegistry) -> Self {
        Self::new(repo, Arc::new(LocalPolicy::new(registry)))
    }

    /// Sets the lifetime of each session's primary-key cache.
    pub fn with_cache_timeout(mut self, timeout: Duration) -> Self {
        self.cache_timeout = timeout;
        self
    }

    /// Sets how long a session may sit idle before it is evicted.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// The underlying repository.
    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Number of open sessions.
    pub fn active_sessions(&self) -> usize {
        self.sessions.read().len()
    }

    /// Drops sessions idle for at least the session timeout and returns how
    /// many were dropped. A session in use is never dropped.
    ///
    /// Runs whenever a session begins, so sessions abandoned without
    /// `end_sync` do not accumulate.
    pub fn evict_idle_sessions(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|id, handle| {
            let Some(session) = handle.try_lock() else {
                return true;
            };
            let idle = session.idle_for();
            if idle < self.session_timeout {
                return true;
            }
            warn!(
                session = %id,
                idle_secs = idle.as_secs(),
                state = ?session.state(),
                "evicting idle sync session"
            );
            false
        });
        before - sessions.len()
    }

    /// Returns the identity that opened a session.
    pub fn session_owner(&self, session_id: Uuid) -> SyncResult<Option<String>> {
        let handle = self.session(session_id)?;
        let session = handle.lock();
        Ok(session.owner().map(str::to_string))
    }

    /// Opens a session under an explicit policy, tagged with `owner`.
    pub fn begin_session(
        &self,
        session_id: Uuid,
        requested: &SyncOptions,
        policy: &dyn SyncPolicy,
        owner: Option<&str>,
    ) -> SyncResult<BeginSyncResponse> {
        let options = policy.derive_options(requested)?;
        let filters = policy.filters(&options)?;
        let converters = policy.converters(&options);
        let started_on = self.repo.now();

        let mut session = SyncSession::new(
            session_id,
            options.clone(),
            filters,
            converters,
            started_on,
            self.cache_timeout,
        );
        if let Some(owner) = owner {
            session = session.with_owner(owner);
        }

        let types = session.filters().type_names().join(",");
        self.evict_idle_sessions();
        {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&session_id) {
                return Err(SyncError::invalid(format!(
                    "session {session_id} is already open"
                )));
            }
            sessions.insert(session_id, Arc::new(Mutex::new(session)));
        }

        info!(
            session = %session_id,
            types = %types,
            full_sync = options.is_full_sync(),
            "sync session started"
        );
        Ok(BeginSyncResponse {
            session_id,
            options,
            started_on,
        })
    }

    fn session(&self, session_id: Uuid) -> SyncResult<Arc<Mutex<SyncSession>>> {
        self.sessions
            .read()
            .get(&session_id)
            .cloned()
            .ok_or(SyncError::UnknownSession(session_id))
    }

    /// Walks forward from `position` over the changes visible to the
    /// session in `window` (per type, rows then tombstones) and hands up to
    /// `limit` of them to `visit`. Returns how many were visited.
    ///
    /// Passing over a change costs a filter check, never an encode.
    fn scan_changes(
        &self,
        session: &SyncSession,
        window: &ChangeWindow,
        position: &mut ScanPosition,
        limit: u64,
        mut visit: impl FnMut(&dyn SyncFilter, Change) -> SyncResult<()>,
    ) -> SyncResult<u64> {
        let filters: Vec<Arc<dyn SyncFilter>> = session.filters().iter().cloned().collect();
        let mut seen = 0;
        while seen < limit {
            let Some(filter) = filters.get(position.filter) else {
                break;
            };
            let type_name = filter.type_name();

            if !position.tombstones {
                let rows =
                    self.repo.query_page(type_name, window, position.after_row, SCAN_BATCH)?;
                if rows.is_empty() {
                    position.tombstones = true;
                    continue;
                }
                for row in rows {
                    if seen == limit {
                        break;
                    }
                    position.after_row = Some((row.changed_on, row.key));
                    if filter.allows(&row)? {
                        seen += 1;
                        visit(filter.as_ref(), Change::Row(row))?;
                    }
                }
            } else {
                let tombstones = self.repo.tombstones_page(
                    type_name,
                    window,
                    position.after_tombstone,
                    SCAN_BATCH,
                )?;
                if tombstones.is_empty() {
                    position.next_filter();
                    continue;
                }
                for tombstone in tombstones {
                    if seen == limit {
                        break;
                    }
                    position.after_tombstone = Some((tombstone.changed_on, tombstone.sync_id));
                    if filter.allows_tombstone(&tombstone) {
                        seen += 1;
                        visit(filter.as_ref(), Change::Tombstone(tombstone))?;
                    }
                }
            }
        }
        Ok(seen)
    }

    fn count_changes(&self, session: &SyncSession, window: &ChangeWindow) -> SyncResult<u64> {
        let mut position = ScanPosition::default();
        self.scan_changes(session, window, &mut position, u64::MAX, |_, _| Ok(()))
    }

    fn encode_change(
        session: &SyncSession,
        filter: &dyn SyncFilter,
        window: &ChangeWindow,
        change: Change,
    ) -> SyncResult<SyncObject> {
        let outgoing = session.outgoing_for(filter);
        match change {
            Change::Row(row) => {
                let status = if row.is_deleted {
                    SyncStatus::Deleted
                } else if row.created_on >= window.since {
                    SyncStatus::Added
                } else {
                    SyncStatus::Modified
                };
                outgoing.encode(&row, status)
            }
            Change::Tombstone(tombstone) => Ok(tombstone.to_sync_object(outgoing.wire_type())),
        }
    }

    /// Serves `take` changes from offset `skip`, continuing `scan` when it
    /// already stands at or before `skip`.
    fn read_page(
        &self,
        session: &SyncSession,
        scan: &mut ChangeScan,
        skip: u64,
        take: u64,
    ) -> SyncResult<(Vec<SyncObject>, u64)> {
        let window = scan.window;
        let total = match scan.total {
            Some(total) => total,
            None => {
                let total = self.count_changes(session, &window)?;
                scan.total = Some(total);
                total
            }
        };

        if scan.served < skip {
            let gap = skip - scan.served;
            let skipped =
                self.scan_changes(session, &window, &mut scan.position, gap, |_, _| Ok(()))?;
            scan.served += skipped;
        }

        let mut items = Vec::new();
        let taken = self.scan_changes(session, &window, &mut scan.position, take, |filter, change| {
            items.push(Self::encode_change(session, filter, &window, change)?);
            Ok(())
        })?;
        scan.served += taken;
        Ok((items, total))
    }

    fn window_for(session: &SyncSession, request: &ChangeRequest) -> ChangeWindow {
        // Nothing written after the session began is served.
        ChangeWindow::new(request.since, request.until.min(session.started_on()))
    }

    fn apply_batch(
        &self,
        session_id: Uuid,
        objects: Vec<SyncObject>,
        correcting: bool,
    ) -> SyncResult<ServiceResult<SyncIssue>> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock();
        session.touch();
        session.transition(if correcting {
            SyncState::Correcting
        } else {
            SyncState::Pushing
        })?;

        let now = self.repo.now();
        let mut txn = Transaction::new(self.repo.as_ref());
        let mut issues = Vec::new();

        for object in &objects {
            match self.apply_one(&mut txn, &mut session, object, correcting, now) {
                Ok(()) => {}
                Err(ApplyFailure::Issue(issue)) => {
                    warn!(
                        session = %session_id,
                        type_name = %issue.type_name,
                        sync_id = %issue.sync_id,
                        kind = ?issue.issue_type,
                        message = %issue.message,
                        "sync issue"
                    );
                    issues.push(issue);
                }
                Err(ApplyFailure::Fatal(e)) => {
                    session.fail();
                    return Err(e);
                }
            }
        }

        if let Err(e) = txn.save_changes() {
            session.cache_mut().clear();
            session.fail();
            return Err(e.into());
        }

        debug!(
            session = %session_id,
            received = objects.len(),
            issues = issues.len(),
            correcting,
            "batch applied"
        );

        if !session.options().include_issue_details {
            issues = issues.into_iter().map(SyncIssue::redacted).collect();
        }
        Ok(ServiceResult::complete(issues))
    }

    fn apply_one(
        &self,
        txn: &mut Transaction<'_>,
        session: &mut SyncSession,
        object: &SyncObject,
        correcting: bool,
        now: DateTime<Utc>,
    ) -> Result<(), ApplyFailure> {
        let Some((handler, filter)) = session.incoming_for(&object.type_name) else {
            return Err(issue(
                SyncIssueType::Unauthorized,
                object,
                format!("type {} is not syncable in this session", object.type_name),
            ));
        };
        let local_type = handler.local_type();
        let deleting = object.status.is_deleted();

        let Some(LocalMatch { row: local, by_lookup }) =
            Self::find_local(txn, session, local_type, object, filter.as_ref())?
        else {
            if deleting {
                return Ok(());
            }
            if !correcting {
                if let Some(tombstone) = txn.find_tombstone(local_type, object.sync_id)? {
                    if tombstone.created_on >= object.modified_on {
                        return Ok(());
                    }
                }
            }
            return self.insert_new(txn, session, handler.as_ref(), filter.as_ref(), object, now);
        };

        if !correcting && !by_lookup && local.modified_on >= object.modified_on {
            return Ok(());
        }
        if !filter.allows(&local)? {
            return Err(issue(
                SyncIssueType::Unauthorized,
                object,
                format!("not permitted to change {} {}", local_type, local.sync_id),
            ));
        }

        let status = if deleting {
            SyncStatus::Deleted
        } else {
            SyncStatus::Modified
        };
        let outcome = handler
            .convert(object, status, Some(&local))
            .map_err(|message| issue(SyncIssueType::Malformed, object, message))?;

        if !outcome.accepted {
            if outcome.refresh {
                Self::refresh(txn, local, now)?;
            }
            return Err(rejection(object, outcome.error));
        }

        if !outcome.processed {
            if outcome.refresh {
                Self::refresh(txn, local, now)?;
            }
            return Ok(());
        }

        if deleting {
            if session.options().permanent_deletions {
                session.cache_mut().remove(local_type, local.sync_id);
                txn.delete_row(local, now)?;
            } else {
                let mut row = local;
                row.is_deleted = true;
                row.modified_on = if outcome.refresh { now } else { object.modified_on };
                txn.update_row(row)?;
            }
            return Ok(());
        }

        let mut row = local.clone();
        row.data = outcome.local;
        row.is_deleted = false;
        row.sync_id = object.sync_id;
        row.modified_on = if outcome.refresh { now } else { object.modified_on };
        if !filter.allows(&row)? {
            return Err(issue(
                SyncIssueType::Unauthorized,
                object,
                format!("the change would put {} {} out of reach", local_type, object.sync_id),
            ));
        }

        if local.sync_id != row.sync_id {
            debug!(
                type_name = local_type,
                from = %local.sync_id,
                to = %row.sync_id,
                "re-keyed by natural key"
            );
            session.cache_mut().remove(local_type, local.sync_id);
            txn.put_tombstone(Tombstone::new(
                local_type,
                local.key.to_string(),
                local.sync_id,
                now,
            ))?;
        }
        session.cache_mut().insert(local_type, row.sync_id, row.key);
        txn.update_row(row)?;
        Ok(())
    }

    fn insert_new(
        &self,
        txn: &mut Transaction<'_>,
        session: &mut SyncSession,
        handler: &dyn IncomingHandler,
        filter: &dyn SyncFilter,
        object: &SyncObject,
        now: DateTime<Utc>,
    ) -> Result<(), ApplyFailure> {
        let outcome = handler
            .convert(object, SyncStatus::Added, None)
            .map_err(|message| issue(SyncIssueType::Malformed, object, message))?;
        if !outcome.accepted {
            return Err(rejection(object, outcome.error));
        }
        if !outcome.processed {
            return Ok(());
        }

        let local_type = handler.local_type();
        let row = Row {
            type_name: local_type.to_string(),
            key: self.repo.allocate_key(),
            sync_id: object.sync_id,
            created_on: outcome
                .incoming_meta
                .map_or(object.modified_on, |meta| meta.created_on),
            modified_on: if outcome.refresh { now } else { object.modified_on },
            changed_on: now,
            is_deleted: false,
            data: outcome.local,
        };
        if !filter.allows(&row)? {
            return Err(issue(
                SyncIssueType::Unauthorized,
                object,
                format!("not permitted to add {} {}", local_type, object.sync_id),
            ));
        }

        session.cache_mut().insert(local_type, row.sync_id, row.key);
        txn.insert_row(row)?;
        Ok(())
    }

    fn find_local(
        txn: &Transaction<'_>,
        session: &mut SyncSession,
        local_type: &str,
        object: &SyncObject,
        filter: &dyn SyncFilter,
    ) -> Result<Option<LocalMatch>, ApplyFailure> {
        if let Some(key) = session.cache_mut().get(local_type, object.sync_id) {
            match txn.find_row_by_key(local_type, key)? {
                Some(row) if row.sync_id == object.sync_id => {
                    return Ok(Some(LocalMatch {
                        row,
                        by_lookup: false,
                    }))
                }
                _ => session.cache_mut().remove(local_type, object.sync_id),
            }
        }

        if let Some(row) = txn.find_row(local_type, object.sync_id)? {
            session.cache_mut().insert(local_type, row.sync_id, row.key);
            return Ok(Some(LocalMatch {
                row,
                by_lookup: false,
            }));
        }

        if object.status.is_deleted() || !filter.has_lookup() {
            return Ok(None);
        }
        let mut visible = Vec::new();
        for row in txn.rows(local_type)? {
            if filter.allows(&row)? {
                visible.push(row);
            }
        }
        Ok(filter.lookup(&visible, object).map(|row| LocalMatch {
            row,
            by_lookup: true,
        }))
    }

    fn refresh(txn: &mut Transaction<'_>, mut row: Row, now: DateTime<Utc>) -> Result<(), ApplyFailure> {
        row.modified_on = now;
        txn.update_row(row)?;
        Ok(())
    }

    fn correction_for(&self, session: &SyncSession, issue: &SyncIssue) -> SyncResult<SyncObject> {
        let local_type = session.converters().local_type_for(&issue.type_name);
        let Some(filter) = session.filters().get(local_type) else {
            return Ok(SyncObject::deleted(
                issue.type_name.clone(),
                issue.sync_id,
                self.repo.now(),
                String::new(),
            ));
        };
        let outgoing = session.outgoing_for(filter.as_ref());

        match self.repo.find_by_sync_id(local_type, issue.sync_id)? {
            Some(row) if !row.is_deleted && filter.allows(&row)? => {
                outgoing.encode(&row, SyncStatus::Modified)
            }
            Some(row) => Ok(SyncObject::deleted(
                outgoing.wire_type(),
                row.sync_id,
                row.modified_on,
                String::new(),
            )),
            None => {
                let deleted_on = self
                    .repo
                    .find_tombstone(local_type, issue.sync_id)?
                    .map_or_else(|| self.repo.now(), |t| t.created_on);
                Ok(SyncObject::deleted(
                    outgoing.wire_type(),
                    issue.sync_id,
                    deleted_on,
                    String::new(),
                ))
            }
        }
    }
}

impl SyncClient for DatabaseSyncClient {
    fn begin_sync(&self, session_id: Uuid, options: &SyncOptions) -> SyncResult<BeginSyncResponse> {
        let policy = Arc::clone(&self.policy);
        self.begin_session(session_id, options, policy.as_ref(), None)
    }

    fn get_change_count(&self, request: &ChangeRequest) -> SyncResult<u64> {
        let handle = self.session(request.session_id)?;
        let mut session = handle.lock();
        session.touch();
        session.transition(SyncState::Pulling)?;

        let window = Self::window_for(&session, request);
        let total = self.count_changes(&session, &window)?;
        let mut scan = ChangeScan::new(window);
        scan.total = Some(total);
        session.keep_scan(scan);
        Ok(total)
    }

    fn get_changes(&self, request: &ChangeRequest) -> SyncResult<ServiceResult<SyncObject>> {
        let handle = self.session(request.session_id)?;
        let mut session = handle.lock();
        session.touch();
        session.transition(SyncState::Pulling)?;

        let window = Self::window_for(&session, request);
        let take = u64::from(request.take.min(session.options().items_per_sync_request).max(1));
        let mut scan = session
            .take_scan()
            .filter(|scan| scan.resumes(&window, request.skip))
            .unwrap_or_else(|| ChangeScan::new(window));

        let (items, total) = match self.read_page(&session, &mut scan, request.skip, take) {
            Ok(page) => page,
            Err(e) => {
                session.fail();
                return Err(e);
            }
        };
        let has_more = items.len() as u64 == take && scan.served < total;
        session.keep_scan(scan);

        debug!(
            session = %request.session_id,
            skip = request.skip,
            returned = items.len(),
            total,
            "change page served"
        );
        Ok(ServiceResult::page(items, total, has_more))
    }

    fn apply_changes(
        &self,
        session_id: Uuid,
        changes: Vec<SyncObject>,
    ) -> SyncResult<ServiceResult<SyncIssue>> {
        self.apply_batch(session_id, changes, false)
    }

    fn apply_corrections(
        &self,
        session_id: Uuid,
        corrections: Vec<SyncObject>,
    ) -> SyncResult<ServiceResult<SyncIssue>> {
        self.apply_batch(session_id, corrections, true)
    }

    fn get_corrections(
        &self,
        session_id: Uuid,
        issues: &[SyncIssue],
    ) -> SyncResult<ServiceResult<SyncObject>> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock();
        session.touch();
        session.transition(SyncState::Correcting)?;

        let mut corrections = Vec::with_capacity(issues.len());
        for issue in issues {
            corrections.push(self.correction_for(&session, issue)?);
        }
        debug!(session = %session_id, corrections = corrections.len(), "corrections served");
        Ok(ServiceResult::complete(corrections))
    }

    fn end_sync(&self, session_id: Uuid) -> SyncResult<()> {
        let handle = self
            .sessions
            .write()
            .remove(&session_id)
            .ok_or(SyncError::UnknownSession(session_id))?;

        let mut session = handle.lock();
        let failed = session.state() == SyncState::Failed;
        if !failed {
            session.transition(SyncState::Completed)?;
        }
        let (hits, misses) = session.cache_mut().stats();
        session.cache_mut().clear();
        info!(
            session = %session_id,
            failed,
            cache_hits = hits,
            cache_misses = misses,
            "sync session ended"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::{IncomingConverter, OutgoingConverter};
    use crate::filter::RepositoryFilter;
    use chrono::Duration as ChronoDuration;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tidesync_protocol::{full_sync_watermark, SyncEntity, SyncMeta};
    use tidesync_store::{ManualClock, MemoryRepository};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Item {
        #[serde(flatten)]
        meta: SyncMeta,
        name: String,
        #[serde(default)]
        owner: u32,
    }

    impl SyncEntity for Item {
        const TYPE_NAME: &'static str = "Item";
        fn meta(&self) -> &SyncMeta {
            &self.meta
        }
        fn meta_mut(&mut self) -> &mut SyncMeta {
            &mut self.meta
        }
        fn update_from(&mut self, other: &Self) {
            self.name = other.name.clone();
            self.owner = other.owner;
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn setup(registry: SyncRegistry) -> (Arc<MemoryRepository>, DatabaseSyncClient) {
        let clock = Arc::new(ManualClock::with_step(t0(), ChronoDuration::seconds(1)));
        let repo = Arc::new(MemoryRepository::new().with_clock(clock));
        let client = DatabaseSyncClient::local(repo.clone(), registry);
        (repo, client)
    }

    fn items() -> SyncRegistry {
        SyncRegistry::new().register(RepositoryFilter::<Item>::new())
    }

    fn add(repo: &MemoryRepository, name: &str) -> Item {
        let mut item = Item {
            name: name.into(),
            ..Item::default()
        };
        let mut txn = Transaction::new(repo);
        txn.add(&mut item).unwrap();
        txn.save_changes().unwrap();
        item
    }

    fn incoming(name: &str, modified_on: DateTime<Utc>) -> Item {
        Item {
            meta: SyncMeta {
                sync_id: Uuid::new_v4(),
                created_on: modified_on,
                modified_on,
            },
            name: name.into(),
            owner: 0,
        }
    }

    fn all_window(session_id: Uuid) -> ChangeRequest {
        ChangeRequest::new(
            session_id,
            full_sync_watermark(),
            DateTime::<Utc>::MAX_UTC,
            100,
        )
    }

    #[test]
    fn unknown_session_is_an_error() {
        let (_, client) = setup(items());
        let id = Uuid::new_v4();
        assert!(matches!(
            client.apply_changes(id, vec![]),
            Err(SyncError::UnknownSession(_))
        ));
        assert!(matches!(client.end_sync(id), Err(SyncError::UnknownSession(_))));
    }

    #[test]
    fn duplicate_session_is_rejected() {
        let (_, client) = setup(items());
        let id = Uuid::new_v4();
        client.begin_sync(id, &SyncOptions::new()).unwrap();
        assert!(matches!(
            client.begin_sync(id, &SyncOptions::new()),
            Err(SyncError::InvalidOperation(_))
        ));
        client.end_sync(id).unwrap();
        assert_eq!(client.active_sessions(), 0);
    }

    #[test]
    fn changes_are_paged() {
        let (repo, client) = setup(items());
        for i in 0..5 {
            add(&repo, &format!("item {i}"));
        }

        let id = Uuid::new_v4();
        let begin = client
            .begin_sync(id, &SyncOptions::new().with_items_per_sync_request(2))
            .unwrap();
        assert_eq!(begin.options.items_per_sync_request, 2);

        let mut request = all_window(id);
        assert_eq!(client.get_change_count(&request).unwrap(), 5);

        let mut seen = Vec::new();
        loop {
            let page = client.get_changes(&request).unwrap();
            assert!(page.items.len() <= 2);
            assert_eq!(page.total_count, 5);
            seen.extend(page.items.iter().map(|o| o.sync_id));
            if !page.has_more {
                break;
            }
            request = request.next_page(page.items.len());
        }
        assert_eq!(seen.len(), 5);
        client.end_sync(id).unwrap();
    }

    #[test]
    fn only_the_served_page_is_encoded() {
        let encoded = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&encoded);
        let registry = items().with_outgoing(OutgoingConverter::<Item, Item>::new(move |item| {
            counter.fetch_add(1, Ordering::SeqCst);
            item.clone()
        }));
        let (repo, client) = setup(registry);
        for i in 0..40 {
            add(&repo, &format!("item {i}"));
        }

        let id = Uuid::new_v4();
        client
            .begin_sync(id, &SyncOptions::new().with_items_per_sync_request(5))
            .unwrap();
        let request = all_window(id);
        assert_eq!(client.get_change_count(&request).unwrap(), 40);
        assert_eq!(encoded.load(Ordering::SeqCst), 0);

        let first = client.get_changes(&request).unwrap();
        assert_eq!(first.items.len(), 5);
        assert_eq!(first.total_count, 40);
        assert_eq!(encoded.load(Ordering::SeqCst), 5);

        let second = client.get_changes(&request.next_page(5)).unwrap();
        assert!(second.has_more);
        assert_eq!(encoded.load(Ordering::SeqCst), 10);
        assert_ne!(first.items[0].sync_id, second.items[0].sync_id);
    }

    #[test]
    fn paging_skips_filtered_rows_and_can_rewind() {
        let registry = SyncRegistry::new()
            .register(RepositoryFilter::<Item>::new().with_predicate(|item| item.owner == 0));
        let (repo, client) = setup(registry);

        let mut expected = Vec::new();
        for i in 0..12 {
            let mut item = Item {
                name: format!("item {i}"),
                owner: i % 3,
                ..Item::default()
            };
            let mut txn = Transaction::new(repo.as_ref());
            txn.add(&mut item).unwrap();
            txn.save_changes().unwrap();
            if item.owner == 0 {
                expected.push(item.meta.sync_id);
            }
        }
        let gone = add(&repo, "gone");
        let mut txn = Transaction::new(repo.as_ref());
        txn.remove::<Item>(gone.meta.sync_id).unwrap();
        txn.save_changes().unwrap();
        // Tombstones follow the rows of their type.
        expected.push(gone.meta.sync_id);

        let id = Uuid::new_v4();
        client
            .begin_sync(id, &SyncOptions::new().with_items_per_sync_request(2))
            .unwrap();
        let mut request = all_window(id);
        assert_eq!(client.get_change_count(&request).unwrap(), 5);

        let mut seen = Vec::new();
        loop {
            let page = client.get_changes(&request).unwrap();
            seen.extend(page.items.iter().map(|o| o.sync_id));
            if !page.has_more {
                break;
            }
            request = request.next_page(page.items.len());
        }
        assert_eq!(seen, expected);

        // Asking for an earlier page starts the read over.
        let again = client.get_changes(&all_window(id)).unwrap();
        let ids: Vec<Uuid> = again.items.iter().map(|o| o.sync_id).collect();
        assert_eq!(ids, expected[..2]);

        let jump = client.get_changes(&all_window(id).next_page(4)).unwrap();
        assert_eq!(jump.items.len(), 1);
        assert_eq!(jump.items[0].status, SyncStatus::Deleted);
        assert!(!jump.has_more);
    }

    #[test]
    fn idle_sessions_are_evicted_when_another_begins() {
        let (_, client) = setup(items());
        let client = client.with_session_timeout(std::time::Duration::ZERO);
        let abandoned = Uuid::new_v4();
        client.begin_sync(abandoned, &SyncOptions::new()).unwrap();

        let next = Uuid::new_v4();
        client.begin_sync(next, &SyncOptions::new()).unwrap();
        assert_eq!(client.active_sessions(), 1);
        assert!(matches!(
            client.get_change_count(&all_window(abandoned)),
            Err(SyncError::UnknownSession(_))
        ));
        client.end_sync(next).unwrap();
    }

    #[test]
    fn busy_sessions_are_not_evicted() {
        let (_, client) = setup(items());
        let client = client.with_session_timeout(std::time::Duration::ZERO);
        let busy = Uuid::new_v4();
        client.begin_sync(busy, &SyncOptions::new()).unwrap();

        let handle = client.session(busy).unwrap();
        let _guard = handle.lock();
        assert_eq!(client.evict_idle_sessions(), 0);
        assert_eq!(client.active_sessions(), 1);
    }

    #[test]
    fn rows_written_after_begin_are_not_served() {
        let (repo, client) = setup(items());
        add(&repo, "before");

        let id = Uuid::new_v4();
        client.begin_sync(id, &SyncOptions::new()).unwrap();
        add(&repo, "after");

        let page = client.get_changes(&all_window(id)).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].status, SyncStatus::Added);
    }

    #[test]
    fn incoming_added_then_stale_update_is_ignored() {
        let (repo, client) = setup(items());
        let item = incoming("fresh", t0() + ChronoDuration::days(1));
        let id = Uuid::new_v4();
        client.begin_sync(id, &SyncOptions::new()).unwrap();

        let added = SyncObject::from_entity(&item, SyncStatus::Added).unwrap();
        assert!(client.apply_changes(id, vec![added]).unwrap().items.is_empty());

        let mut older = item.clone();
        older.name = "older".into();
        older.meta.modified_on = item.meta.modified_on - ChronoDuration::hours(1);
        let stale = SyncObject::from_entity(&older, SyncStatus::Modified).unwrap();
        assert!(client.apply_changes(id, vec![stale]).unwrap().items.is_empty());

        let row = repo.find_by_sync_id("Item", item.meta.sync_id).unwrap().unwrap();
        assert_eq!(row.data["name"], "fresh");
        assert_eq!(row.modified_on, item.meta.modified_on);
    }

    #[test]
    fn delete_of_unknown_row_is_a_no_op() {
        let (repo, client) = setup(items());
        let id = Uuid::new_v4();
        client.begin_sync(id, &SyncOptions::new()).unwrap();

        let object = SyncObject::deleted("Item", Uuid::new_v4(), t0(), String::new());
        assert!(client.apply_changes(id, vec![object]).unwrap().items.is_empty());
        assert!(repo.rows("Item").unwrap().is_empty());
    }

    #[test]
    fn soft_and_permanent_deletes() {
        let (repo, client) = setup(items());
        let soft = add(&repo, "soft");
        let hard = add(&repo, "hard");
        let later = t0() + ChronoDuration::days(1);

        let id = Uuid::new_v4();
        client.begin_sync(id, &SyncOptions::new()).unwrap();
        let object = SyncObject::deleted("Item", soft.meta.sync_id, later, String::new());
        client.apply_changes(id, vec![object]).unwrap();
        client.end_sync(id).unwrap();
        let row = repo.find_by_sync_id("Item", soft.meta.sync_id).unwrap().unwrap();
        assert!(row.is_deleted);

        let id = Uuid::new_v4();
        client
            .begin_sync(id, &SyncOptions::new().with_permanent_deletions(true))
            .unwrap();
        let object = SyncObject::deleted("Item", hard.meta.sync_id, later, String::new());
        client.apply_changes(id, vec![object]).unwrap();
        assert!(repo.find_by_sync_id("Item", hard.meta.sync_id).unwrap().is_none());
        assert!(repo.find_tombstone("Item", hard.meta.sync_id).unwrap().is_some());
    }

    #[test]
    fn out_of_scope_type_is_unauthorized() {
        let (_, client) = setup(items());
        let id = Uuid::new_v4();
        client
            .begin_sync(id, &SyncOptions::new().with_issue_details(true))
            .unwrap();

        let object = SyncObject {
            type_name: "Secret".into(),
            sync_id: Uuid::new_v4(),
            data: "{}".into(),
            status: SyncStatus::Added,
            modified_on: t0(),
        };
        let issues = client.apply_changes(id, vec![object]).unwrap().items;
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].issue_type, SyncIssueType::Unauthorized);
        assert!(issues[0].message.contains("Secret"));
    }

    #[test]
    fn issue_details_are_redacted_by_default() {
        let (_, client) = setup(items());
        let id = Uuid::new_v4();
        client.begin_sync(id, &SyncOptions::new()).unwrap();

        let object = SyncObject {
            type_name: "Item".into(),
            sync_id: Uuid::new_v4(),
            data: "not json".into(),
            status: SyncStatus::Added,
            modified_on: t0(),
        };
        let issues = client.apply_changes(id, vec![object]).unwrap().items;
        assert_eq!(issues[0].issue_type, SyncIssueType::Malformed);
        assert_eq!(issues[0].message, "the change could not be read");
    }

    #[test]
    fn rejection_with_refresh_bumps_local_version() {
        let registry = items().with_incoming(IncomingConverter::<Item, Item>::identity().with_policy(
            |update| {
                update.force_refresh();
                Err(SyncUpdateError::rejected("read only"))
            },
        ));
        let (repo, client) = setup(registry);
        let existing = add(&repo, "original");
        let before = repo.find_by_sync_id("Item", existing.meta.sync_id).unwrap().unwrap();

        let id = Uuid::new_v4();
        client.begin_sync(id, &SyncOptions::new()).unwrap();
        let mut edit = existing.clone();
        edit.name = "edited".into();
        edit.meta.modified_on = before.modified_on + ChronoDuration::hours(1);
        let object = SyncObject::from_entity(&edit, SyncStatus::Modified).unwrap();

        let issues = client.apply_changes(id, vec![object]).unwrap().items;
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].issue_type, SyncIssueType::Rejected);

        let after = repo.find_by_sync_id("Item", existing.meta.sync_id).unwrap().unwrap();
        assert_eq!(after.data["name"], "original");
        assert!(after.modified_on > before.modified_on);

        let corrections = client.get_corrections(id, &issues).unwrap().items;
        assert_eq!(corrections.len(), 1);
        assert_eq!(corrections[0].status, SyncStatus::Modified);
        assert_eq!(corrections[0].modified_on, after.modified_on);
    }

    #[test]
    fn corrections_for_missing_rows_are_deletions() {
        let (_, client) = setup(items());
        let id = Uuid::new_v4();
        client.begin_sync(id, &SyncOptions::new()).unwrap();

        let object = SyncObject::from_entity(&incoming("ghost", t0()), SyncStatus::Added).unwrap();
        let issue = SyncIssue::new(SyncIssueType::Unauthorized, &object, "no");
        let corrections = client.get_corrections(id, &[issue]).unwrap().items;
        assert_eq!(corrections[0].status, SyncStatus::Deleted);
        assert_eq!(corrections[0].sync_id, object.sync_id);
    }

    #[test]
    fn corrections_bypass_staleness() {
        let (repo, client) = setup(items());
        let existing = add(&repo, "local");
        let id = Uuid::new_v4();
        client.begin_sync(id, &SyncOptions::new()).unwrap();

        let mut authoritative = existing.clone();
        authoritative.name = "server".into();
        authoritative.meta.modified_on = full_sync_watermark();
        let object = SyncObject::from_entity(&authoritative, SyncStatus::Modified).unwrap();

        client.apply_changes(id, vec![object.clone()]).unwrap();
        let row = repo.find_by_sync_id("Item", existing.meta.sync_id).unwrap().unwrap();
        assert_eq!(row.data["name"], "local");

        client.apply_corrections(id, vec![object]).unwrap();
        let row = repo.find_by_sync_id("Item", existing.meta.sync_id).unwrap().unwrap();
        assert_eq!(row.data["name"], "server");
    }

    #[test]
    fn row_level_filter_applies_to_result() {
        let registry = SyncRegistry::new()
            .register(RepositoryFilter::<Item>::new().with_predicate(|item| item.owner == 1));
        let (repo, client) = setup(registry);
        let id = Uuid::new_v4();
        client.begin_sync(id, &SyncOptions::new()).unwrap();

        let mut foreign = incoming("foreign", t0());
        foreign.owner = 2;
        let object = SyncObject::from_entity(&foreign, SyncStatus::Added).unwrap();
        let issues = client.apply_changes(id, vec![object]).unwrap().items;
        assert_eq!(issues[0].issue_type, SyncIssueType::Unauthorized);
        assert!(repo.rows("Item").unwrap().is_empty());
    }

    #[test]
    fn natural_key_match_rekeys_local_row() {
        let registry = SyncRegistry::new().register(
            RepositoryFilter::<Item>::new().with_lookup(|local, incoming| local.name == incoming.name),
        );
        let (repo, client) = setup(registry);
        let local = add(&repo, "Berlin");

        let id = Uuid::new_v4();
        client.begin_sync(id, &SyncOptions::new()).unwrap();
        let remote = incoming("Berlin", t0());
        let object = SyncObject::from_entity(&remote, SyncStatus::Added).unwrap();
        assert!(client.apply_changes(id, vec![object]).unwrap().items.is_empty());

        let rows = repo.rows("Item").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sync_id, remote.meta.sync_id);
        assert!(repo.find_tombstone("Item", local.meta.sync_id).unwrap().is_some());
    }

    #[test]
    fn tombstone_newer_than_change_blocks_resurrection() {
        let (repo, client) = setup(items());
        let item = add(&repo, "gone");
        let mut txn = Transaction::new(repo.as_ref());
        let tombstone = txn.remove::<Item>(item.meta.sync_id).unwrap();
        txn.save_changes().unwrap();

        let id = Uuid::new_v4();
        client.begin_sync(id, &SyncOptions::new()).unwrap();
        let mut old_edit = item.clone();
        old_edit.meta.modified_on = tombstone.created_on - ChronoDuration::seconds(1);
        let object = SyncObject::from_entity(&old_edit, SyncStatus::Modified).unwrap();
        client.apply_changes(id, vec![object]).unwrap();
        assert!(repo.find_by_sync_id("Item", item.meta.sync_id).unwrap().is_none());

        let mut new_edit = item.clone();
        new_edit.meta.modified_on = tombstone.created_on + ChronoDuration::hours(1);
        let object = SyncObject::from_entity(&new_edit, SyncStatus::Modified).unwrap();
        client.apply_changes(id, vec![object]).unwrap();
        assert!(repo.find_by_sync_id("Item", item.meta.sync_id).unwrap().is_some());
    }
}
