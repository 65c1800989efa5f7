//! Inspect command implementation.

use super::CliError;
use serde::Serialize;
use std::path::Path;
use tidesync_engine::load_watermarks;
use tidesync_protocol::full_sync_watermark;
use tidesync_store::MemoryRepository;

/// Snapshot inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Snapshot path.
    pub path: String,
    /// Whether the snapshot file exists.
    pub exists: bool,
    /// Per-type counts.
    pub types: Vec<TypeStats>,
    /// Total live rows.
    pub live_rows: usize,
    /// Total tombstones.
    pub tombstones: usize,
    /// Client watermark, if this snapshot has synced.
    pub last_synced_on_client: Option<String>,
    /// Server watermark, if this snapshot has synced.
    pub last_synced_on_server: Option<String>,
}

/// Counts for one entity type.
#[derive(Debug, Serialize)]
pub struct TypeStats {
    /// Type name.
    pub name: String,
    /// Live rows.
    pub live: usize,
    /// Soft-deleted rows.
    pub deleted: usize,
    /// Tombstones.
    pub tombstones: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if format != "text" && format != "json" {
        return Err(CliError::UnknownFormat(format.into()).into());
    }

    let repo = MemoryRepository::open(path)?;
    let mut result = inspect(&repo)?;
    result.path = path.display().to_string();
    result.exists = path.exists();

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Collects counts and watermarks from `repo`.
pub fn inspect(repo: &MemoryRepository) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let types: Vec<TypeStats> = repo
        .type_names()
        .into_iter()
        .map(|name| {
            let (live, deleted) = repo.row_counts(&name);
            let tombstones = repo.tombstone_count(&name);
            TypeStats {
                name,
                live,
                deleted,
                tombstones,
            }
        })
        .collect();

    let (client, server) = load_watermarks(repo)?;
    let never = full_sync_watermark();
    let stamp = |t: chrono::DateTime<chrono::Utc>| (t != never).then(|| t.to_rfc3339());

    Ok(InspectResult {
        path: String::new(),
        exists: true,
        live_rows: types.iter().map(|t| t.live).sum(),
        tombstones: types.iter().map(|t| t.tombstones).sum(),
        types,
        last_synced_on_client: stamp(client),
        last_synced_on_server: stamp(server),
    })
}

fn print_text_output(result: &InspectResult) {
    println!("Snapshot: {}", result.path);
    if !result.exists {
        println!("  (file does not exist)");
        return;
    }
    println!();

    println!("Types:");
    if result.types.is_empty() {
        println!("  (none)");
    }
    for t in &result.types {
        println!(
            "  {:<12} {:>6} live  {:>4} deleted  {:>4} tombstones",
            t.name, t.live, t.deleted, t.tombstones
        );
    }
    println!();

    println!("Totals:");
    println!("  Live rows:  {}", result.live_rows);
    println!("  Tombstones: {}", result.tombstones);
    println!();

    println!("Watermarks:");
    println!(
        "  Client: {}",
        result.last_synced_on_client.as_deref().unwrap_or("never synced")
    );
    println!(
        "  Server: {}",
        result.last_synced_on_server.as_deref().unwrap_or("never synced")
    );
}
