//! Sync sessions and their state machine.

use crate::cache::PrimaryKeyCache;
use crate::converter::{ConverterSet, IncomingHandler, OutgoingHandler};
use crate::error::{SyncError, SyncResult};
use crate::filter::{FilterSet, SyncFilter};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tidesync_protocol::SyncOptions;
use tidesync_store::{ChangeWindow, RowCursor, TombstoneCursor};
use uuid::Uuid;

/// Phase of a sync session or of an engine cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// Nothing has happened yet.
    NotStarted,
    /// Changes are being read from this side.
    Pulling,
    /// Changes are being written to this side.
    Pushing,
    /// Rejected changes are being replaced by authoritative values.
    Correcting,
    /// Finished normally.
    Completed,
    /// Aborted by a batch-level error.
    Failed,
}

impl SyncState {
    /// Returns true while work is in progress.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Pulling | SyncState::Pushing | SyncState::Correcting
        )
    }

    /// Returns true once no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncState::Completed | SyncState::Failed)
    }

    /// Returns true if a new cycle may start from this state.
    pub fn can_start_sync(&self) -> bool {
        !self.is_active()
    }

    /// Returns true if `self -> to` is allowed.
    ///
    /// Pulling and pushing may alternate, since the two sides of a round
    /// are read and written in opposite order. Corrections come last.
    /// Terminal states are final.
    pub fn can_transition(&self, to: SyncState) -> bool {
        use SyncState::*;
        match (self, to) {
            (Completed | Failed, _) => false,
            (_, NotStarted) => false,
            (_, Failed | Completed) => true,
            (Correcting, Pulling | Pushing) => false,
            _ => true,
        }
    }
}

/// Where a paged read of a session's changes stands: the filter being read,
/// whether its rows are done, and the last row and tombstone passed.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ScanPosition {
    pub(crate) filter: usize,
    pub(crate) tombstones: bool,
    pub(crate) after_row: Option<RowCursor>,
    pub(crate) after_tombstone: Option<TombstoneCursor>,
}

impl ScanPosition {
    pub(crate) fn next_filter(&mut self) {
        *self = ScanPosition {
            filter: self.filter + 1,
            ..ScanPosition::default()
        };
    }
}

/// A change read in progress over one window, kept between page requests
/// so the next page resumes where the last one stopped.
#[derive(Debug, Clone)]
pub(crate) struct ChangeScan {
    pub(crate) window: ChangeWindow,
    /// Visible changes passed so far, served or skipped.
    pub(crate) served: u64,
    pub(crate) position: ScanPosition,
    pub(crate) total: Option<u64>,
}

impl ChangeScan {
    pub(crate) fn new(window: ChangeWindow) -> Self {
        Self {
            window,
            served: 0,
            position: ScanPosition::default(),
            total: None,
        }
    }

    /// Returns true if a request for `window` from offset `skip` can
    /// continue this scan instead of starting over.
    pub(crate) fn resumes(&self, window: &ChangeWindow, skip: u64) -> bool {
        self.window == *window && self.served <= skip
    }
}

/// Server- or client-side state of one sync session.
///
/// Holds the options the receiving side derived for itself, the filters and
/// converters in effect, and the per-session primary-key cache.
#[derive(Debug)]
pub struct SyncSession {
    id: Uuid,
    options: SyncOptions,
    started_on: DateTime<Utc>,
    state: SyncState,
    filters: FilterSet,
    converters: ConverterSet,
    cache: PrimaryKeyCache,
    owner: Option<String>,
    scan: Option<ChangeScan>,
    last_active: Instant,
}

impl SyncSession {
    /// Opens a session.
    pub fn new(
        id: Uuid,
        options: SyncOptions,
        filters: FilterSet,
        converters: ConverterSet,
        started_on: DateTime<Utc>,
        cache_timeout: Duration,
    ) -> Self {
        Self {
            id,
            options,
            started_on,
            state: SyncState::NotStarted,
            filters,
            converters,
            cache: PrimaryKeyCache::new(cache_timeout),
            owner: None,
            scan: None,
            last_active: Instant::now(),
        }
    }

    /// Tags the session with the identity that opened it.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Session id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Options in effect.
    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// When the session began, on this side's clock.
    pub fn started_on(&self) -> DateTime<Utc> {
        self.started_on
    }

    /// Current state.
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Identity that opened the session, if any.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Filters in effect.
    pub fn filters(&self) -> &FilterSet {
        &self.filters
    }

    /// Converters in effect.
    pub fn converters(&self) -> &ConverterSet {
        &self.converters
    }

    /// The primary-key cache.
    pub fn cache_mut(&mut self) -> &mut PrimaryKeyCache {
        &mut self.cache
    }

    /// Records activity, restarting the idle timer.
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Time since the session was opened or last touched.
    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }

    pub(crate) fn take_scan(&mut self) -> Option<ChangeScan> {
        self.scan.take()
    }

    pub(crate) fn keep_scan(&mut self, scan: ChangeScan) {
        self.scan = Some(scan);
    }

    /// Moves to `to`, failing on a disallowed transition.
    pub fn transition(&mut self, to: SyncState) -> SyncResult<()> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition(to) {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{:?}", self.state),
                to: format!("{to:?}"),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Marks the session failed.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = SyncState::Failed;
        }
    }

    /// Resolves the handler for an incoming wire type, with the filter of the
    /// local type it lands in. `None` if the type is out of scope.
    pub fn incoming_for(
        &self,
        wire_type: &str,
    ) -> Option<(Arc<dyn IncomingHandler>, Arc<dyn SyncFilter>)> {
        match self.converters.incoming(wire_type) {
            Some(handler) => {
                let filter = self.filters.get(handler.local_type())?;
                Some((handler, Arc::clone(filter)))
            }
            None => {
                let filter = self.filters.get(wire_type)?;
                Some((filter.identity_incoming(), Arc::clone(filter)))
            }
        }
    }

    /// Resolves the outgoing handler for a filter's local type.
    pub fn outgoing_for(&self, filter: &dyn SyncFilter) -> Arc<dyn OutgoingHandler> {
        self.converters
            .outgoing(filter.type_name())
            .unwrap_or_else(|| filter.identity_outgoing())
    }
}
