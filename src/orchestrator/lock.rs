// src/orchestrator/lock.rs

use nix::fcntl::{Flock, FlockArg};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::BackendError;

/// Held for the whole of one operation. Dropping it releases every lock.
pub struct UserGuard {
    // Field order matters: file locks are released before the in-process ones.
    _files: Vec<Flock<File>>,
    _local: Vec<OwnedMutexGuard<()>>,
}

/// Per-username serialisation. In-process locks always apply; with a lock
/// directory configured, an exclusive `flock` on `{dir}/{username}.lock`
/// also serialises separate agent processes.
pub struct UserLocks {
    local: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    lock_dir: Option<PathBuf>,
}

impl UserLocks {
    pub fn new(lock_dir: Option<PathBuf>) -> Self {
        Self { local: Mutex::new(HashMap::new()), lock_dir }
    }

    fn slot(&self, username: &str) -> Arc<AsyncMutex<()>> {
        let mut local = self.local.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Forget idle slots so the map tracks only contended usernames.
        local.retain(|_, slot| Arc::strong_count(slot) > 1);
        local.entry(username.to_string()).or_default().clone()
    }

    /// Locks every name in `usernames`, always in sorted order so two
    /// renames touching the same pair cannot deadlock.
    pub async fn acquire(&self, usernames: &[&str]) -> Result<UserGuard, BackendError> {
        let mut names: Vec<&str> = usernames.to_vec();
        names.sort_unstable();
        names.dedup();

        let mut local = Vec::with_capacity(names.len());
        for name in &names {
            local.push(self.slot(name).lock_owned().await);
        }

        let mut files = Vec::new();
        if let Some(dir) = &self.lock_dir {
            for name in &names {
                files.push(lock_file(dir, name).await?);
            }
        }

        debug!(usernames = ?names, "user locks acquired");
        Ok(UserGuard { _files: files, _local: local })
    }
}

async fn lock_file(dir: &Path, username: &str) -> Result<Flock<File>, BackendError> {
    let path = dir.join(format!("{}.lock", username));
    let dir = dir.to_path_buf();

    // flock(2) blocks; keep it off the runtime threads.
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&dir)
            .map_err(|e| BackendError::unavailable(format!("failed to create lock directory {:?}: {}", dir, e)))?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| BackendError::unavailable(format!("failed to open lock file {:?}: {}", path, e)))?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| BackendError::unavailable(format!("flock on {:?} failed: {}", path, errno)))
    })
    .await
    .map_err(|e| BackendError::unavailable(format!("lock task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_username_is_serialised() {
        let locks = Arc::new(UserLocks::new(None));
        let guard = locks.acquire(&["alice"]).await.unwrap();

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(&["alice"]).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn different_usernames_proceed_independently() {
        let locks = UserLocks::new(None);
        let _alice = locks.acquire(&["alice"]).await.unwrap();
        let bob = tokio::time::timeout(Duration::from_millis(100), locks.acquire(&["bob"])).await;
        assert!(bob.is_ok());
    }

    #[tokio::test]
    async fn file_locks_are_created_per_username() {
        let dir = tempfile::tempdir().unwrap();
        let locks = UserLocks::new(Some(dir.path().join("locks")));
        let guard = locks.acquire(&["bob", "alice", "bob"]).await.unwrap();
        assert!(dir.path().join("locks/alice.lock").exists());
        assert!(dir.path().join("locks/bob.lock").exists());
        drop(guard);

        // Released on drop, so a second holder gets in immediately.
        let again = tokio::time::timeout(Duration::from_millis(500), locks.acquire(&["alice"])).await;
        assert!(again.is_ok());
    }
}
