//! Snapshot persistence
//!
//! The file store keeps one `.fleetstack/<stack>.json` per stack. Writes go
//! to a temporary file that is synced and then renamed over the live file, so
//! readers observe either the previous or the new snapshot, never a torn one.

use crate::error::{EngineError, Result};
use crate::snapshot::{SNAPSHOT_VERSION, Snapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub const STATE_DIR: &str = ".fleetstack";
const LOCK_STALE_AFTER_HOURS: i64 = 1;

/// Backend holding the last committed snapshot of each stack
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Load the committed snapshot, or an empty one if the stack has none
    async fn load(&self, stack: &str, project: &str) -> Result<Snapshot>;

    /// Atomically replace the committed snapshot
    async fn save(&self, snapshot: &Snapshot) -> Result<()>;

    /// Acquire exclusive access to a stack for the duration of a run
    async fn acquire_lock(&self, _stack: &str) -> Result<StateLock> {
        Ok(StateLock::unlocked())
    }
}

/// In-memory store, used by tests and previews
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    snapshot: Arc<Mutex<Option<Snapshot>>>,
    saves: Arc<Mutex<usize>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        let store = Self::new();
        *store.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
        store
    }

    pub fn current(&self) -> Option<Snapshot> {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of committed saves
    pub fn saves(&self) -> usize {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, stack: &str, project: &str) -> Result<Snapshot> {
        Ok(self
            .current()
            .unwrap_or_else(|| Snapshot::empty(stack, project)))
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }
}

/// JSON files under `<project root>/.fleetstack/`
pub struct FileSnapshotStore {
    /// Project root directory
    project_root: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        Self {
            project_root: project_root.as_ref().to_path_buf(),
        }
    }

    /// Get the state directory path
    pub fn state_dir(&self) -> PathBuf {
        self.project_root.join(STATE_DIR)
    }

    pub fn snapshot_path(&self, stack: &str) -> PathBuf {
        self.state_dir().join(format!("{stack}.json"))
    }

    fn backup_path(&self, stack: &str) -> PathBuf {
        self.state_dir().join(format!("{stack}.json.backup"))
    }

    fn temp_path(&self, stack: &str) -> PathBuf {
        self.state_dir().join(format!("{stack}.json.tmp"))
    }

    fn lock_path(&self, stack: &str) -> PathBuf {
        self.state_dir().join(format!("{stack}.lock.json"))
    }

    /// Ensure the state directory exists
    async fn ensure_state_dir(&self) -> Result<()> {
        let dir = self.state_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir).await?;
            tracing::debug!("Created state directory: {}", dir.display());
        }
        Ok(())
    }

    /// Remove a lock regardless of its age
    pub async fn force_unlock(&self, stack: &str) -> Result<bool> {
        let lock_path = self.lock_path(stack);
        if !lock_path.exists() {
            return Ok(false);
        }
        fs::remove_file(&lock_path).await?;
        tracing::warn!("Force-removed state lock {}", lock_path.display());
        Ok(true)
    }

    /// Holder of the current lock, if any
    pub async fn lock_holder(&self, stack: &str) -> Result<Option<LockInfo>> {
        let lock_path = self.lock_path(stack);
        if !lock_path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&lock_path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self, stack: &str, project: &str) -> Result<Snapshot> {
        let path = self.snapshot_path(stack);
        if !path.exists() {
            tracing::debug!(stack, "Snapshot not found, starting from an empty stack");
            return Ok(Snapshot::empty(stack, project));
        }

        let content = fs::read_to_string(&path).await?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;

        if snapshot.version > SNAPSHOT_VERSION {
            return Err(EngineError::StateError(format!(
                "Snapshot version {} is newer than supported version {}",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }

        tracing::debug!("Loaded snapshot with {} resources", snapshot.len());
        Ok(snapshot)
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        self.ensure_state_dir().await?;

        let path = self.snapshot_path(&snapshot.stack);
        let temp = self.temp_path(&snapshot.stack);

        let content = serde_json::to_vec_pretty(snapshot)?;
        let mut file = fs::File::create(&temp).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);

        if path.exists() {
            fs::copy(&path, self.backup_path(&snapshot.stack)).await?;
            tracing::debug!("Created snapshot backup");
        }
        fs::rename(&temp, &path).await?;

        tracing::info!(
            stack = %snapshot.stack,
            resources = snapshot.len(),
            "Committed snapshot"
        );
        Ok(())
    }

    async fn acquire_lock(&self, stack: &str) -> Result<StateLock> {
        self.ensure_state_dir().await?;

        let lock_path = self.lock_path(stack);

        if let Some(lock_info) = self.lock_holder(stack).await? {
            let age = Utc::now().signed_duration_since(lock_info.acquired_at);
            if age.num_hours() < LOCK_STALE_AFTER_HOURS {
                return Err(EngineError::LockError(format!(
                    "Stack {} is locked by {} since {}",
                    stack, lock_info.holder, lock_info.acquired_at
                )));
            }

            tracing::warn!("Removing stale lock from {}", lock_info.holder);
        }

        let lock_info = LockInfo {
            holder: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown".to_string()),
            acquired_at: Utc::now(),
        };

        let content = serde_json::to_string_pretty(&lock_info)?;
        fs::write(&lock_path, content).await?;

        tracing::debug!(stack, "Acquired state lock");
        Ok(StateLock {
            lock_path: Some(lock_path),
            released: false,
        })
    }
}

/// Lock information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

/// RAII guard for a stack lock
#[derive(Debug)]
pub struct StateLock {
    lock_path: Option<PathBuf>,
    released: bool,
}

impl StateLock {
    /// Guard for stores without locking
    pub fn unlocked() -> Self {
        Self {
            lock_path: None,
            released: true,
        }
    }

    /// Release the lock
    pub async fn release(mut self) -> Result<()> {
        if !self.released {
            if let Some(lock_path) = &self.lock_path {
                if lock_path.exists() {
                    fs::remove_file(lock_path).await?;
                    tracing::debug!("Released state lock");
                }
            }
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(lock_path) = &self.lock_path {
            if lock_path.exists() {
                // Drop cannot await
                let _ = std::fs::remove_file(lock_path);
            }
        }
    }
}
