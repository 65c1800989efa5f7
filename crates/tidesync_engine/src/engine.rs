//! The sync orchestrator.

use crate::client::SyncClient;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::session::SyncState;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tidesync_protocol::{ChangeRequest, ObjectKey, SyncIssue, SyncObject, SyncOptions};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// An object version that has already crossed in one direction.
type EchoKey = (ObjectKey, DateTime<Utc>);

fn echo_key(object: &SyncObject) -> EchoKey {
    (object.key(), object.modified_on)
}

/// Cancels a running cycle from outside the engine.
///
/// Clones share one flag. The engine checks it before each round, each
/// page of changes and each batch of corrections.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Clears a pending cancellation.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Returns true if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total number of sync cycles completed.
    pub cycles_completed: u64,
    /// Total number of objects pulled and applied locally.
    pub objects_pulled: u64,
    /// Total number of objects pushed to the remote.
    pub objects_pushed: u64,
    /// Total number of corrections applied on either side.
    pub objects_corrected: u64,
    /// Total number of issues reported by either side.
    pub issues_reported: u64,
    /// Total number of objects skipped as echoes.
    pub echoes_suppressed: u64,
    /// Total number of retried cycles.
    pub retries: u64,
    /// Last successful sync time.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of a sync cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncCycleResult {
    /// Objects read from the remote and sent to the local side.
    pub pulled: u64,
    /// Objects read from the local side and sent to the remote.
    pub pushed: u64,
    /// Corrections applied on either side.
    pub corrected: u64,
    /// Objects not sent because they were echoes.
    pub suppressed: u64,
    /// Rounds run.
    pub rounds: u32,
    /// Issues left after the last round.
    pub issues: Vec<SyncIssue>,
    /// Whether the cycle ran to completion.
    pub success: bool,
    /// Duration of the cycle.
    pub duration: Duration,
}

impl SyncCycleResult {
    /// Returns true if the last round finished without issues.
    pub fn is_converged(&self) -> bool {
        self.success && self.issues.is_empty()
    }
}

/// Counts and issues of one round.
#[derive(Debug, Default)]
struct RoundResult {
    pulled: u64,
    pushed: u64,
    corrected: u64,
    suppressed: u64,
    issues: Vec<SyncIssue>,
}

/// What one direction of a round moved.
#[derive(Debug, Default)]
struct Transfer {
    sent: u64,
    suppressed: u64,
    issues: Vec<SyncIssue>,
}

/// Object versions applied during the previous and the current round.
#[derive(Debug, Default)]
struct EchoSet {
    previous: HashSet<EchoKey>,
    current: HashSet<EchoKey>,
}

impl EchoSet {
    fn rotate(&mut self) {
        self.previous = std::mem::take(&mut self.current);
    }

    fn contains(&self, key: &EchoKey) -> bool {
        self.current.contains(key) || self.previous.contains(key)
    }

    /// Records every object that was applied, i.e. did not produce an issue.
    fn record(&mut self, objects: &[SyncObject], issues: &[SyncIssue]) {
        let failed: HashSet<ObjectKey> = issues.iter().map(SyncIssue::key).collect();
        self.current.extend(
            objects
                .iter()
                .filter(|o| !failed.contains(&o.key()))
                .map(echo_key),
        );
    }
}

/// Drives reconciliation between a local and a remote [`SyncClient`].
///
/// A cycle runs up to `max_rounds` rounds. Each round opens a session on
/// both sides, pulls the remote backlog into the local side, pushes the
/// local backlog to the remote, then asks each side that reported issues
/// for authoritative values and applies them on the other. The cycle stops
/// once a round reports no issues or the issue count stops decreasing.
///
/// Watermarks only move after a round completes, and only to the
/// `started_on` times each side captured when its session began.
pub struct SyncEngine<L: SyncClient, R: SyncClient> {
    config: SyncConfig,
    local: L,
    remote: R,
    options: RwLock<SyncOptions>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    echoes: Mutex<EchoSet>,
    cancelled: CancelToken,
}

impl<L: SyncClient, R: SyncClient> SyncEngine<L, R> {
    /// Creates an engine that has never synced.
    pub fn new(config: SyncConfig, local: L, remote: R) -> Self {
        let options = config.to_options(
            tidesync_protocol::full_sync_watermark(),
            tidesync_protocol::full_sync_watermark(),
        );
        Self {
            config,
            local,
            remote,
            options: RwLock::new(options),
            state: RwLock::new(SyncState::NotStarted),
            stats: RwLock::new(SyncStats::default()),
            echoes: Mutex::new(EchoSet::default()),
            cancelled: CancelToken::default(),
        }
    }

    /// Resumes from previously saved watermarks.
    pub fn with_watermarks(self, client: DateTime<Utc>, server: DateTime<Utc>) -> Self {
        {
            let mut options = self.options.write();
            options.last_synced_on_client = client;
            options.last_synced_on_server = server;
        }
        self
    }

    /// The options the next round will request.
    pub fn options(&self) -> SyncOptions {
        self.options.read().clone()
    }

    /// Returns `(last_synced_on_client, last_synced_on_server)`.
    pub fn watermarks(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let options = self.options.read();
        (options.last_synced_on_client, options.last_synced_on_server)
    }

    /// The local client.
    pub fn local(&self) -> &L {
        &self.local
    }

    /// The remote client.
    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Cancels the running cycle at the next page boundary.
    pub fn cancel(&self) {
        self.cancelled.cancel();
    }

    /// Clears a pending cancellation.
    pub fn reset_cancel(&self) {
        self.cancelled.reset();
    }

    /// A token that cancels this engine's cycles.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancelled.clone()
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    /// Runs one sync cycle.
    ///
    /// A pending [`SyncEngine::cancel`] is honored; call
    /// [`SyncEngine::reset_cancel`] before reusing a cancelled engine.
    pub fn sync(&self) -> SyncResult<SyncCycleResult> {
        let start = Instant::now();
        let state = self.state();
        if !state.can_start_sync() {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{state:?}"),
                to: "sync".into(),
            });
        }

        let max_rounds = self.config.max_rounds.max(1);
        let mut result = SyncCycleResult::default();
        let mut previous_issues: Option<usize> = None;

        for round in 0..max_rounds {
            if round > 0 {
                std::thread::sleep(self.config.retry.delay_for_attempt(round));
            }

            let outcome = match self.round() {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.handle_error(&e);
                    return Err(e);
                }
            };

            result.rounds += 1;
            result.pulled += outcome.pulled;
            result.pushed += outcome.pushed;
            result.corrected += outcome.corrected;
            result.suppressed += outcome.suppressed;
            self.stats.write().issues_reported += outcome.issues.len() as u64;

            let count = outcome.issues.len();
            result.issues = outcome.issues;
            if count == 0 {
                break;
            }
            if previous_issues.is_some_and(|previous| count >= previous) {
                debug!(issues = count, "issue count stopped decreasing");
                break;
            }
            previous_issues = Some(count);
        }

        result.success = true;
        result.duration = start.elapsed();
        self.set_state(SyncState::Completed);

        {
            let mut stats = self.stats.write();
            stats.cycles_completed += 1;
            stats.objects_pulled += result.pulled;
            stats.objects_pushed += result.pushed;
            stats.objects_corrected += result.corrected;
            stats.echoes_suppressed += result.suppressed;
            stats.last_sync_time = Some(Instant::now());
            stats.last_error = None;
        }

        info!(
            rounds = result.rounds,
            pulled = result.pulled,
            pushed = result.pushed,
            corrected = result.corrected,
            issues = result.issues.len(),
            duration_ms = result.duration.as_millis() as u64,
            "sync cycle completed"
        );
        Ok(result)
    }

    /// Runs a cycle, retrying transient failures with backoff.
    pub fn sync_with_retry(&self) -> SyncResult<SyncCycleResult> {
        let retry = &self.config.retry;
        let attempts = retry.max_attempts.max(1);

        for attempt in 0..attempts {
            if attempt > 0 {
                std::thread::sleep(retry.delay_for_attempt(attempt));
                self.stats.write().retries += 1;
            }
            self.check_cancelled()?;

            match self.sync() {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    warn!(attempt, error = %e, "sync attempt failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(SyncError::Protocol("no sync attempts made".into()))
    }

    fn round(&self) -> SyncResult<RoundResult> {
        self.check_cancelled()?;
        self.echoes.lock().rotate();

        let session_id = Uuid::new_v4();
        let requested = self.options();

        let remote = self.remote.begin_sync(session_id, &requested)?;
        let local = match self.local.begin_sync(session_id, &requested) {
            Ok(local) => local,
            Err(e) => {
                self.end_quietly(&self.remote, session_id);
                return Err(e);
            }
        };

        let page_size = remote
            .options
            .items_per_sync_request
            .min(local.options.items_per_sync_request)
            .min(requested.items_per_sync_request)
            .max(1);
        debug!(
            session = %session_id,
            page_size,
            remote_started = %remote.started_on,
            local_started = %local.started_on,
            "sync round started"
        );

        let outcome = self.exchange(
            session_id,
            &requested,
            remote.started_on,
            local.started_on,
            page_size,
        );
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.set_state(SyncState::Failed);
                self.end_quietly(&self.local, session_id);
                self.end_quietly(&self.remote, session_id);
                return Err(e);
            }
        };

        self.local.end_sync(session_id)?;
        self.remote.end_sync(session_id)?;

        self.options
            .write()
            .advance(local.started_on, remote.started_on);
        Ok(outcome)
    }

    fn exchange(
        &self,
        session_id: Uuid,
        requested: &SyncOptions,
        remote_started: DateTime<Utc>,
        local_started: DateTime<Utc>,
        page_size: u32,
    ) -> SyncResult<RoundResult> {
        self.set_state(SyncState::Pulling);
        let pull = self.transfer(
            &self.remote,
            &self.local,
            ChangeRequest::new(
                session_id,
                requested.last_synced_on_server,
                remote_started,
                page_size,
            ),
        )?;

        self.set_state(SyncState::Pushing);
        let push = self.transfer(
            &self.local,
            &self.remote,
            ChangeRequest::new(
                session_id,
                requested.last_synced_on_client,
                local_started,
                page_size,
            ),
        )?;

        self.set_state(SyncState::Correcting);
        // The side that raised an issue holds the authoritative value.
        let (to_local, local_issues) =
            self.correct(session_id, &self.remote, &self.local, &push.issues, page_size)?;
        let (to_remote, remote_issues) =
            self.correct(session_id, &self.local, &self.remote, &pull.issues, page_size)?;

        let mut issues = pull.issues;
        issues.extend(push.issues);
        issues.extend(local_issues);
        issues.extend(remote_issues);

        Ok(RoundResult {
            pulled: pull.sent,
            pushed: push.sent,
            corrected: to_local + to_remote,
            suppressed: pull.suppressed + push.suppressed,
            issues,
        })
    }

    /// Pages changes out of `from` and applies them to `to`.
    fn transfer(
        &self,
        from: &dyn SyncClient,
        to: &dyn SyncClient,
        first: ChangeRequest,
    ) -> SyncResult<Transfer> {
        let mut transfer = Transfer::default();
        if first.since >= first.until {
            return Ok(transfer);
        }

        let expected = from.get_change_count(&first)?;
        if expected == 0 {
            return Ok(transfer);
        }
        debug!(session = %first.session_id, expected, "transferring changes");

        let page_size = first.take as usize;
        let mut request = first;
        loop {
            self.check_cancelled()?;
            let page = from.get_changes(&request)?;
            let returned = page.items.len();

            let (echoes, fresh): (Vec<SyncObject>, Vec<SyncObject>) = {
                let set = self.echoes.lock();
                page.items
                    .into_iter()
                    .partition(|object| set.contains(&echo_key(object)))
            };
            transfer.suppressed += echoes.len() as u64;

            if !fresh.is_empty() {
                let issues = to.apply_changes(request.session_id, fresh.clone())?.items;
                self.echoes.lock().record(&fresh, &issues);
                transfer.sent += fresh.len() as u64;
                transfer.issues.extend(issues);
            }

            if !page.has_more || returned < page_size {
                break;
            }
            request = request.next_page(returned);
        }
        Ok(transfer)
    }

    /// Fetches authoritative values from `authority` for its issues that
    /// require correction, and applies them to `target`, at most
    /// `page_size` at a time.
    fn correct(
        &self,
        session_id: Uuid,
        authority: &dyn SyncClient,
        target: &dyn SyncClient,
        issues: &[SyncIssue],
        page_size: u32,
    ) -> SyncResult<(u64, Vec<SyncIssue>)> {
        let wanted: Vec<SyncIssue> = issues
            .iter()
            .filter(|issue| issue.issue_type.requires_correction())
            .cloned()
            .collect();

        let mut applied = 0;
        let mut remaining = Vec::new();
        for batch in wanted.chunks(page_size.max(1) as usize) {
            self.check_cancelled()?;
            let corrections = authority.get_corrections(session_id, batch)?.items;
            if corrections.is_empty() {
                continue;
            }
            let failed = target
                .apply_corrections(session_id, corrections.clone())?
                .items;
            self.echoes.lock().record(&corrections, &failed);

            debug!(
                session = %session_id,
                corrections = corrections.len(),
                failed = failed.len(),
                "corrections applied"
            );
            applied += corrections.len() as u64;
            remaining.extend(failed);
        }
        Ok((applied, remaining))
    }

    fn end_quietly(&self, client: &dyn SyncClient, session_id: Uuid) {
        if let Err(e) = client.end_sync(session_id) {
            debug!(session = %session_id, error = %e, "failed to end session");
        }
    }

    fn handle_error(&self, error: &SyncError) {
        self.set_state(SyncState::Failed);
        self.stats.write().last_error = Some(error.to_string());
        warn!(error = %error, "sync cycle failed");
    }
}
