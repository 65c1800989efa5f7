//! # tidesync Engine
//!
//! Sync clients and the round orchestrator for tidesync.
//!
//! This crate provides:
//! - [`RepositoryFilter`], the per-type unit of sync scope, with row-level
//!   predicates and natural-key lookup
//! - Incoming and outgoing converters, the per-type conflict policy
//! - [`SyncClient`], implemented over a local repository
//!   ([`DatabaseSyncClient`]) and over HTTP ([`WebSyncClient`])
//! - [`SyncEngine`], which drives pull, push and correction rounds between
//!   two clients
//! - Retry with exponential backoff
//! - A time-boxed primary-key cache for bulk applies
//!
//! ## Architecture
//!
//! Every round opens a session on both sides. The remote backlog is pulled
//! first, then the local backlog is pushed. Objects a side cannot apply come
//! back as `SyncIssue`s; for those that need it, the side that raised the
//! issue supplies its authoritative value and the other side applies it as a
//! correction.
//!
//! ## Key Invariants
//!
//! - A per-object failure never aborts a batch; anything else aborts it
//!   and commits nothing
//! - Applying the same object twice changes nothing the second time
//! - Watermarks advance only after a round completes, to the `started_on`
//!   times captured when each session began
//! - The primary-key cache is never authoritative

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod client;
mod config;
mod converter;
mod database;
mod engine;
mod error;
mod filter;
mod http;
mod policy;
mod session;
mod watermark;

pub use cache::PrimaryKeyCache;
pub use client::SyncClient;
pub use config::{
    RetryConfig, SyncConfig, DEFAULT_MAX_ROUNDS, DEFAULT_PRIMARY_KEY_CACHE_TIMEOUT,
    DEFAULT_SESSION_IDLE_TIMEOUT,
};
pub use converter::{
    ConverterSet, IncomingConverter, IncomingHandler, IncomingOutcome, IncomingUpdate,
    OutgoingConverter, OutgoingHandler,
};
pub use database::DatabaseSyncClient;
pub use engine::{CancelToken, SyncCycleResult, SyncEngine, SyncStats};
pub use error::{SyncError, SyncResult, SyncUpdateError};
pub use filter::{FilterSet, RepositoryFilter, SyncFilter};
pub use http::{
    ErrorBody, HttpClient, HttpResponse, LoopbackClient, LoopbackServer, WebSyncClient,
    UNKNOWN_SESSION_KIND,
};
pub use policy::{LocalPolicy, SyncPolicy, SyncRegistry};
pub use session::{SyncSession, SyncState};
pub use watermark::{
    load_watermarks, save_watermarks, CLIENT_WATERMARK_KEY, SERVER_WATERMARK_KEY,
};
