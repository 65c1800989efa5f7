//! The sync client contract.

use crate::error::SyncResult;
use std::sync::Arc;
use tidesync_protocol::{
    BeginSyncResponse, ChangeRequest, ServiceResult, SyncIssue, SyncObject, SyncOptions,
};
use uuid::Uuid;

/// One side of a sync round.
///
/// Implemented over a local repository ([`crate::DatabaseSyncClient`]) and
/// over HTTP ([`crate::WebSyncClient`]). The engine drives two of these
/// without knowing which is which.
///
/// Calls other than `begin_sync` name a session opened by `begin_sync` and
/// fail with `UnknownSession` otherwise.
pub trait SyncClient: Send + Sync {
    /// Opens a session. `options` are untrusted; the response carries the
    /// options this side will honor and its own start time.
    fn begin_sync(&self, session_id: Uuid, options: &SyncOptions) -> SyncResult<BeginSyncResponse>;

    /// Counts the changes in the request's window.
    fn get_change_count(&self, request: &ChangeRequest) -> SyncResult<u64>;

    /// Returns one page of changes in the request's window.
    fn get_changes(&self, request: &ChangeRequest) -> SyncResult<ServiceResult<SyncObject>>;

    /// Applies a batch of changes, returning the objects that failed.
    fn apply_changes(
        &self,
        session_id: Uuid,
        changes: Vec<SyncObject>,
    ) -> SyncResult<ServiceResult<SyncIssue>>;

    /// Applies authoritative values, bypassing staleness checks.
    fn apply_corrections(
        &self,
        session_id: Uuid,
        corrections: Vec<SyncObject>,
    ) -> SyncResult<ServiceResult<SyncIssue>>;

    /// Returns this side's authoritative value for each issue: the current
    /// entity, or a deletion if it no longer exists here.
    fn get_corrections(
        &self,
        session_id: Uuid,
        issues: &[SyncIssue],
    ) -> SyncResult<ServiceResult<SyncObject>>;

    /// Closes a session.
    fn end_sync(&self, session_id: Uuid) -> SyncResult<()>;
}

impl<C: SyncClient + ?Sized> SyncClient for Arc<C> {
    fn begin_sync(&self, session_id: Uuid, options: &SyncOptions) -> SyncResult<BeginSyncResponse> {
        (**self).begin_sync(session_id, options)
    }

    fn get_change_count(&self, request: &ChangeRequest) -> SyncResult<u64> {
        (**self).get_change_count(request)
    }

    fn get_changes(&self, request: &ChangeRequest) -> SyncResult<ServiceResult<SyncObject>> {
        (**self).get_changes(request)
    }

    fn apply_changes(
        &self,
        session_id: Uuid,
        changes: Vec<SyncObject>,
    ) -> SyncResult<ServiceResult<SyncIssue>> {
        (**self).apply_changes(session_id, changes)
    }

    fn apply_corrections(
        &self,
        session_id: Uuid,
        corrections: Vec<SyncObject>,
    ) -> SyncResult<ServiceResult<SyncIssue>> {
        (**self).apply_corrections(session_id, corrections)
    }

    fn get_corrections(
        &self,
        session_id: Uuid,
        issues: &[SyncIssue],
    ) -> SyncResult<ServiceResult<SyncObject>> {
        (**self).get_corrections(session_id, issues)
    }

    fn end_sync(&self, session_id: Uuid) -> SyncResult<()> {
        (**self).end_sync(session_id)
    }
}
