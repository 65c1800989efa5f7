//! # tidesync Protocol
//!
//! Sync protocol types and JSON envelopes for tidesync.
//!
//! This crate provides:
//! - `SyncObject`, the transport-neutral envelope for one entity change
//! - `SyncEntity` / `SyncMeta`, the contract every syncable type implements
//! - `SyncOptions`, `SyncScope` and the typed `SyncValues` side channel
//! - `SyncIssue` for per-object failures and `Tombstone` for deletions
//! - Protocol messages (begin, change pages, apply, corrections, end)
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entity;
mod error;
mod issue;
mod messages;
mod object;
mod options;
mod tombstone;

pub use entity::{SyncEntity, SyncMeta};
pub use error::{ProtocolError, ProtocolResult};
pub use issue::{SyncIssue, SyncIssueType};
pub use messages::{
    ApplyRequest, BeginSyncRequest, BeginSyncResponse, ChangeCountResponse, ChangeRequest,
    CorrectionRequest, EndSyncRequest, ServiceResult, SyncMessage, APPLY_CORRECTIONS_PATH,
    APPLY_PATH, BEGIN_PATH, CHANGES_PATH, CHANGE_COUNT_PATH, CORRECTIONS_PATH, END_PATH,
};
pub use object::{ObjectKey, SyncObject, SyncStatus};
pub use options::{
    SyncOptions, SyncScope, SyncValue, SyncValues, ValueKey, ValueType, ACCOUNT_CHANGED,
    CLIENT_NAME, DEFAULT_ITEMS_PER_SYNC_REQUEST, KNOWN_VALUE_KEYS,
};
pub use tombstone::Tombstone;

/// Unix timestamp of 0001-01-01T00:00:00Z.
const FULL_SYNC_WATERMARK_SECS: i64 = -62_135_596_800;

/// The "full sync" watermark: no change is older than this.
///
/// A never-synced peer sends this as both watermarks.
pub fn full_sync_watermark() -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp(FULL_SYNC_WATERMARK_SECS, 0)
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC)
}
