// src/sys/backups.rs

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

/// Copies `content` into `backup_dir/{prefix}_{timestamp}.conf`.
pub async fn write_backup(backup_dir: &Path, prefix: &str, content: &str) -> Result<PathBuf, String> {
    fs::create_dir_all(backup_dir)
        .await
        .map_err(|e| format!("Failed to create backup directory: {}", e))?;

    // Microseconds keep two mutations in the same second from colliding.
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S_%6f");
    let path = backup_dir.join(format!("{}_{}.conf", prefix, timestamp));
    fs::write(&path, content)
        .await
        .map_err(|e| format!("Failed to write backup {:?}: {}", path, e))?;
    Ok(path)
}

/// Keeps the newest `keep_count` backups with the given prefix and deletes the
/// rest. Returns how many were deleted.
pub async fn prune_backups(backup_dir: &Path, prefix: &str, keep_count: usize) -> Result<usize, String> {
    let mut entries = match fs::read_dir(backup_dir).await {
        Ok(dir) => dir,
        Err(e) => return Err(format!("Failed to read backup directory: {}", e)),
    };

    let marker = format!("{}_", prefix);
    let mut paths: Vec<PathBuf> = Vec::new();

    // 1. Collect matching backup files
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(&marker) && n.ends_with(".conf"));
        if matches && path.is_file() {
            paths.push(path);
        }
    }

    // 2. Sort by name, which is chronological thanks to the timestamp format
    paths.sort();

    if paths.len() <= keep_count {
        return Ok(0);
    }

    // 3. Remove everything but the newest `keep_count`
    let prune_count = paths.len() - keep_count;
    let mut deleted = 0;
    for path in &paths[..prune_count] {
        if let Err(e) = fs::remove_file(path).await {
            // A stubborn file must not fail the DNS mutation that triggered pruning.
            warn!("Failed to delete old backup {:?}: {}", path, e);
        } else {
            deleted += 1;
        }
    }

    Ok(deleted)
}
