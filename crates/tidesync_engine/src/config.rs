//! Configuration for the sync engine.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;
use tidesync_protocol::{SyncOptions, SyncScope, SyncValues, DEFAULT_ITEMS_PER_SYNC_REQUEST};

/// Default number of rounds per sync cycle.
pub const DEFAULT_MAX_ROUNDS: u32 = 3;

/// Default lifetime of a session's primary-key cache.
pub const DEFAULT_PRIMARY_KEY_CACHE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default time a session may sit idle before it is evicted.
pub const DEFAULT_SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Page size requested from both sides.
    pub items_per_sync_request: u32,
    /// Upper bound on rounds per cycle.
    pub max_rounds: u32,
    /// Backoff between rounds and between retried cycles.
    pub retry: RetryConfig,
    /// Whether deletes are permanent (tombstoned) or soft.
    pub permanent_deletions: bool,
    /// Whether verbose issue messages are requested.
    pub include_issue_details: bool,
    /// Requested scope.
    pub scope: SyncScope,
    /// Side-channel values sent with every session.
    pub values: SyncValues,
    /// Lifetime of the primary-key cache of local sessions.
    pub primary_key_cache_timeout: Duration,
}

impl SyncConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self {
            items_per_sync_request: DEFAULT_ITEMS_PER_SYNC_REQUEST,
            max_rounds: DEFAULT_MAX_ROUNDS,
            retry: RetryConfig::default(),
            permanent_deletions: false,
            include_issue_details: false,
            scope: SyncScope::All,
            values: SyncValues::new(),
            primary_key_cache_timeout: DEFAULT_PRIMARY_KEY_CACHE_TIMEOUT,
        }
    }

    /// Sets the page size.
    pub fn with_items_per_sync_request(mut self, items: u32) -> Self {
        self.items_per_sync_request = items;
        self
    }

    /// Sets the round cap.
    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Requests permanent deletions.
    pub fn with_permanent_deletions(mut self, permanent: bool) -> Self {
        self.permanent_deletions = permanent;
        self
    }

    /// Requests verbose issue messages.
    pub fn with_issue_details(mut self, include: bool) -> Self {
        self.include_issue_details = include;
        self
    }

    /// Sets the scope.
    pub fn with_scope(mut self, scope: SyncScope) -> Self {
        self.scope = scope;
        self
    }

    /// Sets the side-channel values.
    pub fn with_values(mut self, values: SyncValues) -> Self {
        self.values = values;
        self
    }

    /// Sets the primary-key cache lifetime.
    pub fn with_primary_key_cache_timeout(mut self, timeout: Duration) -> Self {
        self.primary_key_cache_timeout = timeout;
        self
    }

    /// Builds session options carrying the given watermarks.
    pub fn to_options(&self, client: DateTime<Utc>, server: DateTime<Utc>) -> SyncOptions {
        SyncOptions {
            last_synced_on_client: client,
            last_synced_on_server: server,
            items_per_sync_request: self.items_per_sync_request.max(1),
            include_issue_details: self.include_issue_details,
            permanent_deletions: self.permanent_deletions,
            values: self.values.clone(),
            scope: self.scope.clone(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Backoff between sync rounds and between retried cycles.
///
/// The same schedule spaces out the correction rounds of one cycle and the
/// attempts of [`SyncEngine::sync_with_retry`](crate::SyncEngine::sync_with_retry).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per cycle when it fails with a retryable error.
    pub max_attempts: u32,
    /// Wait before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any wait.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub backoff_multiplier: f64,
    /// Adds up to 25% random extra wait.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Exponential backoff from 100ms, capped at 30s, with jitter.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// One attempt and no waiting. Tests use this.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets [`RetryConfig::initial_delay`].
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Sets [`RetryConfig::max_delay`].
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Sets [`RetryConfig::backoff_multiplier`].
    pub fn with_backoff_multiplier(mut self, factor: f64) -> Self {
        self.backoff_multiplier = factor;
        self
    }

    /// Sets [`RetryConfig::add_jitter`].
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Wait before attempt (or round) `attempt`; attempt 0 never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let wait = (self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent))
            .min(self.max_delay.as_secs_f64());
        if !self.add_jitter || wait <= 0.0 {
            return Duration::from_secs_f64(wait);
        }

        let extra = wait * 0.25 * rand::thread_rng().gen_range(0.0..1.0);
        Duration::from_secs_f64(wait + extra)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
