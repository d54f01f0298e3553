//! Cross-process sync lock backed by a JSON file inside the workspace's
//! `.git` directory.
//!
//! The transport holds the lock for the length of a reconciliation; the
//! engine only inspects it. A lock whose owner process is gone is dead, one
//! older than the configured age is stuck, and either may be reclaimed.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use quill_core::error::io_err;
use quill_core::{LockStatus, SyncError};
use quill_sync::LockService;

use crate::paths::sync_lock_path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub started_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FileLockService {
    path: PathBuf,
    stuck_after: Duration,
}

impl FileLockService {
    pub fn for_workspace(workspace: &Path, stuck_after: Duration) -> Self {
        Self {
            path: sync_lock_path(workspace),
            stuck_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Option<LockRecord>, SyncError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_err(&self.path, err)),
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                // A half-written record has no usable owner; report it as dead.
                tracing::warn!(path = %self.path.display(), error = %err, "unreadable sync lock");
                Ok(Some(LockRecord {
                    pid: 0,
                    started_at_ms: 0,
                    phase: None,
                }))
            }
        }
    }

    async fn inspect(&self) -> Result<LockStatus, SyncError> {
        let Some(record) = self.read()? else {
            return Ok(LockStatus::absent());
        };
        let now_ms = Utc::now().timestamp_millis();
        let age_ms = u64::try_from(now_ms - record.started_at_ms).unwrap_or(0);
        // A record carrying our own pid is left over from an earlier session
        // of this process; the engine never inspects while its own session runs.
        let is_dead = record.pid == 0
            || record.pid == std::process::id()
            || !process_alive(record.pid).await;
        Ok(LockStatus {
            exists: true,
            is_dead,
            is_stuck: u128::from(age_ms) > self.stuck_after.as_millis(),
            age_ms,
            owner_pid: record.pid,
            phase: record.phase,
        })
    }

    /// Take the lock for this process, reclaiming a dead or stuck one.
    pub async fn acquire(&self, phase: &str) -> Result<HeldLock, SyncError> {
        let status = self.inspect().await?;
        if status.is_held() {
            return Err(SyncError::LockContested {
                age_ms: status.age_ms,
            });
        }
        if status.exists {
            tracing::warn!(
                owner_pid = status.owner_pid,
                dead = status.is_dead,
                stuck = status.is_stuck,
                "reclaiming stale sync lock",
            );
        }

        let held = HeldLock {
            path: self.path.clone(),
            record: LockRecord {
                pid: std::process::id(),
                started_at_ms: Utc::now().timestamp_millis(),
                phase: Some(phase.to_string()),
            },
        };
        held.write()?;
        Ok(held)
    }
}

#[async_trait]
impl LockService for FileLockService {
    async fn check_lock(&self) -> Result<LockStatus, SyncError> {
        self.inspect().await
    }

    async fn cleanup_stale_lock(&self) -> Result<bool, SyncError> {
        let status = self.inspect().await?;
        if !status.exists || status.is_held() {
            return Ok(false);
        }
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_err(&self.path, err)),
        }
    }
}

/// The lock as held by this process. Removed on drop.
#[derive(Debug)]
pub struct HeldLock {
    path: PathBuf,
    record: LockRecord,
}

impl HeldLock {
    pub fn set_phase(&mut self, phase: &str) -> Result<(), SyncError> {
        self.record.phase = Some(phase.to_string());
        self.write()
    }

    fn write(&self) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let tmp = self.path.with_extension("lock.tmp");
        let body = serde_json::to_vec(&self.record)?;
        fs::write(&tmp, body).map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to release sync lock");
            }
        }
    }
}

#[cfg(unix)]
async fn process_alive(pid: u32) -> bool {
    // `kill -0` checks liveness without signalling.
    match tokio::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(err) => {
            tracing::debug!(pid, error = %err, "could not check lock owner; assuming alive");
            true
        }
    }
}

#[cfg(not(unix))]
async fn process_alive(_pid: u32) -> bool {
    true
}
