use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use crate::ledger::UsageLedger;

/// Owns a file on disk and deletes it when dropped, so every return path
/// out of a job handler releases its artifacts. `into_path` transfers
/// ownership for the rare case where the file must outlive the guard.
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
    armed: bool,
}

impl TempFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the file now instead of waiting for drop.
    pub async fn remove(mut self) {
        self.armed = false;
        remove_file_if_exists(&self.path).await;
    }

    #[allow(dead_code)]
    pub fn into_path(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(error) = std::fs::remove_file(&self.path) {
            if error.kind() != std::io::ErrorKind::NotFound {
                tracing::error!(path = %self.path.display(), error = %error, "failed to delete temp file");
            }
        }
    }
}

pub async fn remove_file_if_exists(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            tracing::error!(path = %path.display(), error = %error, "failed to delete temp file");
        }
    }
}

/// Background sweeper for artifacts the guards could not release (files
/// orphaned by a crash or kill between upload and cleanup) plus ledger
/// reservations whose TTL elapsed. Deleting an already-deleted file is a
/// no-op, so repeated sweeps are safe.
pub fn spawn_sweeper(
    dirs: Vec<PathBuf>,
    max_age: Duration,
    interval: Duration,
    ledger: UsageLedger,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            for dir in &dirs {
                if let Err(error) = sweep_dir(dir, max_age).await {
                    tracing::warn!(dir = %dir.display(), error = %error, "sweep failed");
                }
            }

            match ledger.prune_expired().await {
                Ok(0) => {}
                Ok(pruned) => {
                    tracing::info!(pruned, "pruned expired usage reservations");
                }
                Err(error) => {
                    tracing::warn!(error = %error, "failed to prune usage reservations");
                }
            }
        }
    });
}

async fn sweep_dir(dir: &Path, max_age: Duration) -> std::io::Result<()> {
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut removed = 0usize;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = match entry.metadata().await {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => continue,
        };
        let modified = match metadata.modified() {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        if modified < cutoff {
            remove_file_if_exists(&entry.path()).await;
            removed += 1;
        }
    }

    if removed > 0 {
        tracing::info!(dir = %dir.display(), removed, "swept orphaned files");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn scratch_file(contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("cleanup-test-{}", Uuid::new_v4()));
        std::fs::write(&path, contents).expect("write scratch file");
        path
    }

    #[test]
    fn guard_deletes_on_drop() {
        let path = scratch_file(b"x");
        {
            let _guard = TempFile::new(path.clone());
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn explicit_remove_disarms_the_guard() {
        let path = scratch_file(b"x");
        let guard = TempFile::new(path.clone());
        guard.remove().await;
        assert!(!path.exists());
    }

    #[test]
    fn into_path_transfers_ownership() {
        let path = scratch_file(b"x");
        let guard = TempFile::new(path.clone());
        let kept = guard.into_path();
        assert!(kept.exists());
        std::fs::remove_file(kept).unwrap();
    }

    #[tokio::test]
    async fn sweep_removes_only_old_files() {
        let dir = std::env::temp_dir().join(format!("sweep-test-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let fresh = dir.join("fresh.jpg");
        tokio::fs::write(&fresh, b"x").await.unwrap();

        // max_age of zero treats everything already on disk as stale.
        sweep_dir(&dir, Duration::from_secs(3600)).await.unwrap();
        assert!(fresh.exists());

        sweep_dir(&dir, Duration::ZERO).await.unwrap();
        assert!(!fresh.exists());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
