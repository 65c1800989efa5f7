//! Server configuration.

use crate::auth::DEFAULT_TOKEN_EXPIRY;
use std::time::Duration;
use tidesync_engine::{DEFAULT_PRIMARY_KEY_CACHE_TIMEOUT, DEFAULT_SESSION_IDLE_TIMEOUT};

/// Default upper bound on page sizes.
pub const DEFAULT_MAX_ITEMS_PER_SYNC_REQUEST: u32 = 500;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Upper bound on the page size a caller may request.
    pub max_items_per_sync_request: u32,
    /// Whether to require authentication.
    pub require_auth: bool,
    /// Secret key for token validation (if auth enabled).
    pub auth_secret: Option<Vec<u8>>,
    /// Token lifetime.
    pub token_expiry: Duration,
    /// Lifetime of each session's primary-key cache.
    pub primary_key_cache_timeout: Duration,
    /// How long a session may sit idle before the next `begin` evicts it.
    pub session_idle_timeout: Duration,
}

impl ServerConfig {
    /// Creates a configuration with default limits and no authentication.
    pub fn new() -> Self {
        Self {
            max_items_per_sync_request: DEFAULT_MAX_ITEMS_PER_SYNC_REQUEST,
            require_auth: false,
            auth_secret: None,
            token_expiry: DEFAULT_TOKEN_EXPIRY,
            primary_key_cache_timeout: DEFAULT_PRIMARY_KEY_CACHE_TIMEOUT,
            session_idle_timeout: DEFAULT_SESSION_IDLE_TIMEOUT,
        }
    }

    /// Sets the page size cap.
    pub fn with_max_items_per_sync_request(mut self, items: u32) -> Self {
        self.max_items_per_sync_request = items.max(1);
        self
    }

    /// Enables authentication with the given secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.require_auth = true;
        self.auth_secret = Some(secret);
        self
    }

    /// Sets the token lifetime.
    pub fn with_token_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }

    /// Sets the primary-key cache lifetime.
    pub fn with_primary_key_cache_timeout(mut self, timeout: Duration) -> Self {
        self.primary_key_cache_timeout = timeout;
        self
    }

    /// Sets the session idle timeout.
    pub fn with_session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.session_idle_timeout = timeout;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
