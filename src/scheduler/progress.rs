use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::utils::write_atomic;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub total_items: usize,
    pub completed: usize,
    pub failed: usize,
    /// Items not yet attempted in this run
    pub remaining: usize,
}

impl fmt::Display for RunTotals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} completed, {} failed, {} remaining of {}",
            self.completed, self.failed, self.remaining, self.total_items
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedItem {
    pub id: String,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressCheckpoint {
    pub run_id: Uuid,
    pub completed_ids: Vec<String>,
    #[serde(default)]
    pub failed: Vec<FailedItem>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub units_completed: usize,
    #[serde(default)]
    pub totals: RunTotals,
    #[serde(skip)]
    completed_index: HashSet<String>,
}

impl PartialEq for ProgressCheckpoint {
    fn eq(&self, other: &Self) -> bool {
        self.run_id == other.run_id
            && self.completed_ids == other.completed_ids
            && self.failed == other.failed
            && self.units_completed == other.units_completed
            && self.totals == other.totals
    }
}

impl ProgressCheckpoint {
    pub fn new(total_items: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            completed_ids: Vec::new(),
            failed: Vec::new(),
            last_updated: Utc::now(),
            units_completed: 0,
            totals: RunTotals {
                total_items,
                remaining: total_items,
                ..RunTotals::default()
            },
            completed_index: HashSet::new(),
        }
    }

    fn rebuild_index(&mut self) {
        self.completed_index = self.completed_ids.iter().cloned().collect();
    }

    pub fn is_completed(&self, id: &str) -> bool {
        self.completed_index.contains(id)
    }

    pub fn completed_count(&self) -> usize {
        self.completed_ids.len()
    }

    /// Marks `id` complete and drops it from the failed ledger
    pub fn mark_completed(&mut self, id: &str) {
        if self.completed_index.insert(id.to_string()) {
            self.completed_ids.push(id.to_string());
        }
        self.failed.retain(|f| f.id != id);
    }

    /// Records a failure, replacing any earlier entry for the same id
    pub fn record_failure(&mut self, id: &str, error: impl Into<String>, attempts: u32) {
        let entry = FailedItem {
            id: id.to_string(),
            error: error.into(),
            attempts,
            failed_at: Utc::now(),
        };
        match self.failed.iter_mut().find(|f| f.id == id) {
            Some(existing) => *existing = entry,
            None => self.failed.push(entry),
        }
    }

    pub fn failed_ids(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.id.clone()).collect()
    }

    /// Every id not yet completed, in the given order
    pub fn remaining<'a>(&self, ids: &'a [String]) -> Vec<&'a String> {
        ids.iter().filter(|id| !self.is_completed(id)).collect()
    }

    pub fn refresh_totals(&mut self, total_items: usize) {
        let completed = self.completed_ids.len();
        let failed = self.failed.len();
        self.totals = RunTotals {
            total_items,
            completed,
            failed,
            remaining: total_items.saturating_sub(completed + failed),
        };
        self.last_updated = Utc::now();
    }
}

/// Holds the lock file for as long as the store lives
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release progress lock {}: {}", self.path.display(), e);
        }
    }
}

/// Single-writer checkpoint file. Opening the store takes `<checkpoint>.lock`
/// with create-new semantics, so a second concurrent run fails with
/// [`PipelineError::Locked`].
pub struct ProgressStore {
    path: PathBuf,
    _lock: LockGuard,
}

impl ProgressStore {
    pub fn lock_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let lock_path = Self::lock_path(path);
        let mut lock_file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(PipelineError::Locked(lock_path))
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(lock_file, "{}", std::process::id())?;
        debug!("Acquired progress lock {}", lock_path.display());

        Ok(Self {
            path: path.to_path_buf(),
            _lock: LockGuard { path: lock_path },
        })
    }

    /// Remove a lock left behind by a run that was killed outright
    pub fn break_lock(path: &Path) -> Result<bool> {
        let lock_path = Self::lock_path(path);
        match std::fs::remove_file(&lock_path) {
            Ok(()) => {
                warn!("Removed stale progress lock {}", lock_path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<ProgressCheckpoint>> {
        Self::read(&self.path).await
    }

    /// Read a checkpoint without taking the lock, for status reporting
    pub async fn read(path: &Path) -> Result<Option<ProgressCheckpoint>> {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut checkpoint: ProgressCheckpoint = serde_json::from_slice(&content)
            .map_err(|e| PipelineError::Checkpoint(format!("{}: {}", path.display(), e)))?;
        checkpoint.rebuild_index();
        Ok(Some(checkpoint))
    }

    pub async fn save(&self, checkpoint: &ProgressCheckpoint) -> Result<()> {
        let json = serde_json::to_vec_pretty(checkpoint)?;
        write_atomic(&self.path, &json)
            .await
            .map_err(|e| PipelineError::Checkpoint(format!("failed to save {}: {}", self.path.display(), e)))?;
        debug!(
            completed = checkpoint.totals.completed,
            failed = checkpoint.totals.failed,
            "Checkpoint saved"
        );
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Checkpoint cleared");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_failed_ledger_is_keyed_by_id() {
        let mut checkpoint = ProgressCheckpoint::new(3);
        checkpoint.record_failure("a", "timeout", 3);
        checkpoint.record_failure("a", "bad gateway", 3);
        assert_eq!(checkpoint.failed.len(), 1);
        assert_eq!(checkpoint.failed[0].error, "bad gateway");

        checkpoint.mark_completed("a");
        checkpoint.mark_completed("a");
        assert!(checkpoint.failed.is_empty());
        assert_eq!(checkpoint.completed_ids, vec!["a"]);
    }

    #[test]
    fn test_remaining_keeps_order() {
        let ids: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let mut checkpoint = ProgressCheckpoint::new(ids.len());
        checkpoint.mark_completed("c");
        checkpoint.mark_completed("a");
        checkpoint.record_failure("b", "boom", 1);
        let remaining: Vec<&str> = checkpoint.remaining(&ids).into_iter().map(|s| s.as_str()).collect();
        assert_eq!(remaining, vec!["b", "d"]);

        checkpoint.refresh_totals(ids.len());
        assert_eq!(checkpoint.totals.completed, 2);
        assert_eq!(checkpoint.totals.failed, 1);
        assert_eq!(checkpoint.totals.remaining, 1);
        assert_eq!(checkpoint.totals.to_string(), "2 completed, 1 failed, 1 remaining of 4");
    }

    #[tokio::test]
    async fn test_save_load_round_trip_rebuilds_index() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::open(&dir.path().join("progress.json")).unwrap();
        assert!(store.load().await.unwrap().is_none());

        let mut checkpoint = ProgressCheckpoint::new(2);
        checkpoint.mark_completed("x");
        store.save(&checkpoint).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
        assert!(loaded.is_completed("x"));

        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[test]
    fn test_second_store_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        let store = ProgressStore::open(&path).unwrap();
        assert!(matches!(ProgressStore::open(&path), Err(PipelineError::Locked(_))));

        drop(store);
        assert!(ProgressStore::open(&path).is_ok());
    }

    #[test]
    fn test_break_stale_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(ProgressStore::lock_path(&path), "12345").unwrap();
        assert!(ProgressStore::open(&path).is_err());
        assert!(ProgressStore::break_lock(&path).unwrap());
        assert!(ProgressStore::open(&path).is_ok());
    }
}
