//! Prune-tombstones command implementation.

use chrono::{Duration, Utc};
use std::path::Path;
use tidesync_store::MemoryRepository;

/// Runs the prune-tombstones command.
///
/// Peers whose watermark is older than the cutoff will no longer learn
/// about the pruned deletions.
pub fn run(path: &Path, older_than_days: u32) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("snapshot not found: {}", path.display()).into());
    }

    let repo = MemoryRepository::open(path)?;
    let cutoff = Utc::now() - Duration::days(i64::from(older_than_days));
    let before: usize = count(&repo);
    let pruned = repo.prune_tombstones(cutoff);
    repo.save(path)?;

    println!("Pruned tombstones in {:?}", path);
    println!("  Cutoff:    {}", cutoff.to_rfc3339());
    println!("  Removed:   {}", pruned);
    println!("  Remaining: {}", before - pruned);
    Ok(())
}

fn count(repo: &MemoryRepository) -> usize {
    repo.type_names()
        .iter()
        .map(|name| repo.tombstone_count(name))
        .sum()
}
