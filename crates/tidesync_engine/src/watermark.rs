//! Persisted watermarks.

use crate::error::SyncResult;
use chrono::{DateTime, Utc};
use tidesync_protocol::full_sync_watermark;
use tidesync_store::{Repository, StoreError};

/// Metadata key of `last_synced_on_client`.
pub const CLIENT_WATERMARK_KEY: &str = "tidesync.lastSyncedOnClient";

/// Metadata key of `last_synced_on_server`.
pub const SERVER_WATERMARK_KEY: &str = "tidesync.lastSyncedOnServer";

/// Loads `(client, server)` watermarks, defaulting to a full sync.
pub fn load_watermarks(repo: &dyn Repository) -> SyncResult<(DateTime<Utc>, DateTime<Utc>)> {
    Ok((
        load(repo, CLIENT_WATERMARK_KEY)?,
        load(repo, SERVER_WATERMARK_KEY)?,
    ))
}

/// Stores `(client, server)` watermarks as RFC 3339 strings.
pub fn save_watermarks(
    repo: &dyn Repository,
    client: DateTime<Utc>,
    server: DateTime<Utc>,
) -> SyncResult<()> {
    repo.set_metadata(CLIENT_WATERMARK_KEY, &client.to_rfc3339())?;
    repo.set_metadata(SERVER_WATERMARK_KEY, &server.to_rfc3339())?;
    Ok(())
}

fn load(repo: &dyn Repository, key: &str) -> SyncResult<DateTime<Utc>> {
    match repo.metadata(key)? {
        None => Ok(full_sync_watermark()),
        Some(value) => DateTime::parse_from_rfc3339(&value)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StoreError::Corrupted(format!("{key}: {e}")).into()),
    }
}
