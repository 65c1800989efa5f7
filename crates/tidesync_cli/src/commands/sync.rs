//! Sync command implementation.
//!
//! Runs a [`SyncServer`] over the remote snapshot in-process and syncs
//! the local snapshot with it through the loopback transport, so the
//! full wire path is exercised without a network.

use super::CliError;
use std::path::Path;
use std::sync::Arc;
use tidesync_engine::{
    load_watermarks, save_watermarks, DatabaseSyncClient, LoopbackClient, SyncConfig,
    SyncCycleResult, SyncEngine, WebSyncClient,
};
use tidesync_server::{ServerConfig, SyncServer};
use tidesync_store::MemoryRepository;
use tidesync_testkit::{account_email_index, local_registry, DemoSchema};
use tracing::{info, warn};

const LOOPBACK_URL: &str = "loopback://tidesync";

/// Runs the sync command.
pub fn run(
    path: &Path,
    remote: &Path,
    token: Option<&str>,
    secret: Option<&str>,
    page_size: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    if path == remote {
        return Err(CliError::SameSnapshot.into());
    }
    if page_size == 0 {
        return Err(CliError::EmptyPage.into());
    }

    let local = Arc::new(MemoryRepository::open(path)?);
    let server_repo =
        Arc::new(MemoryRepository::open(remote)?.with_unique_index(account_email_index()));

    let result = sync_snapshots(&local, &server_repo, token, secret, page_size)?;
    local.save(path)?;
    server_repo.save(remote)?;

    println!("Synced {:?} with {:?}", path, remote);
    println!("  Rounds:     {}", result.rounds);
    println!("  Pulled:     {}", result.pulled);
    println!("  Pushed:     {}", result.pushed);
    println!("  Corrected:  {}", result.corrected);
    println!("  Suppressed: {}", result.suppressed);
    println!("  Duration:   {:?}", result.duration);
    if !result.issues.is_empty() {
        println!("  Issues:");
        for issue in &result.issues {
            println!(
                "    {:?} {} {}: {}",
                issue.issue_type, issue.type_name, issue.sync_id, issue.message
            );
        }
    }
    Ok(())
}

/// Syncs `local` with a server over `server_repo` and persists the new
/// watermarks into `local`.
pub fn sync_snapshots(
    local: &Arc<MemoryRepository>,
    server_repo: &Arc<MemoryRepository>,
    token: Option<&str>,
    secret: Option<&str>,
    page_size: u32,
) -> Result<SyncCycleResult, Box<dyn std::error::Error>> {
    let mut server_config = ServerConfig::new();
    if let Some(secret) = secret {
        server_config = server_config.with_auth(secret.as_bytes().to_vec());
    } else {
        warn!("no secret given, the server treats every caller as an administrator");
    }
    let server = Arc::new(SyncServer::new(
        server_config,
        server_repo.clone(),
        Arc::new(DemoSchema),
    ));

    let mut remote = WebSyncClient::new(LOOPBACK_URL, LoopbackClient::new(server));
    if let Some(token) = token {
        remote = remote.with_token(token);
    }

    let (client_mark, server_mark) = load_watermarks(local.as_ref())?;
    let engine = SyncEngine::new(
        SyncConfig::new().with_items_per_sync_request(page_size),
        DatabaseSyncClient::local(local.clone(), local_registry()),
        remote,
    )
    .with_watermarks(client_mark, server_mark);

    let result = engine.sync_with_retry()?;
    let (client_mark, server_mark) = engine.watermarks();
    save_watermarks(local.as_ref(), client_mark, server_mark)?;

    info!(
        rounds = result.rounds,
        pulled = result.pulled,
        pushed = result.pushed,
        issues = result.issues.len(),
        "snapshot sync finished"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::seed::seed;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tidesync_store::Transaction;
    use tidesync_testkit::Person;

    #[test]
    fn syncs_snapshot_files_and_remembers_watermarks() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("device.json");
        let server = dir.path().join("server.json");

        let seeded = MemoryRepository::new();
        seed(&seeded, 5, &mut StdRng::seed_from_u64(3)).unwrap();
        seeded.save(&server).unwrap();

        run(&device, &server, None, None, 2).unwrap();

        let local = MemoryRepository::open(&device).unwrap();
        assert_eq!(local.row_counts("Person"), (5, 0));
        assert_eq!(local.row_counts("AccountDto"), (1, 0));
        let (client_mark, _) = load_watermarks(&local).unwrap();
        assert!(client_mark > tidesync_protocol::full_sync_watermark());

        // Rows pulled last time are offered back once, then the files are quiet.
        let local = Arc::new(local);
        let server_repo = Arc::new(MemoryRepository::open(&server).unwrap());
        let second = sync_snapshots(&local, &server_repo, None, None, 2).unwrap();
        assert_eq!(second.pulled, 0);
        assert!(second.issues.is_empty());
        let third = sync_snapshots(&local, &server_repo, None, None, 2).unwrap();
        assert_eq!(third.pulled + third.pushed, 0);
    }

    #[test]
    fn local_edits_reach_the_server_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("device.json");
        let server = dir.path().join("server.json");

        let local = MemoryRepository::new();
        let mut txn = Transaction::new(&local);
        let mut ada = Person::new(uuid::Uuid::nil(), "Ada", "ada@example.com");
        txn.add(&mut ada).unwrap();
        txn.save_changes().unwrap();
        local.save(&device).unwrap();

        run(&device, &server, None, None, 10).unwrap();

        let stored = MemoryRepository::open(&server).unwrap();
        let found: Option<Person> = Transaction::new(&stored).find(ada.meta.sync_id).unwrap();
        assert_eq!(found.map(|p| p.name), Some("Ada".to_string()));
    }

    #[test]
    fn refuses_to_sync_a_snapshot_with_itself() {
        let path = Path::new("same.json");
        let err = run(path, path, None, None, 10).unwrap_err();
        assert!(err.to_string().contains("differ"));
    }
}
