//! Size-based rotation for the daemon's log files.
//!
//! `daemon.log` becomes `daemon.log.1`, older copies shift up by one, and the
//! copy past [`RotationPolicy::keep`] is deleted.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::paths::{stderr_log_path, stdout_log_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Rotate once the live file reaches this size.
    pub max_bytes: u64,
    /// Rotated copies to keep.
    pub keep: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            keep: 5,
        }
    }
}

impl RotationPolicy {
    /// Rotate `log` if it is over the size limit. A missing file is not an
    /// error. Returns whether a rotation happened.
    pub fn rotate(&self, log: &Path) -> io::Result<bool> {
        let size = match fs::metadata(log) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        if size < self.max_bytes {
            return Ok(false);
        }

        remove_if_present(&backup_path(log, self.keep))?;
        for n in (1..self.keep).rev() {
            let from = backup_path(log, n);
            if from.exists() {
                fs::rename(&from, backup_path(log, n + 1))?;
            }
        }
        if self.keep > 0 {
            fs::rename(log, backup_path(log, 1))?;
        }

        // The daemon's stdio keeps writing to this path.
        fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(log)?;
        Ok(true)
    }
}

/// Rotate the daemon's stdout and stderr logs under `home`. Failures are
/// logged per file.
pub fn rotate_logs(home: &Path) {
    let policy = RotationPolicy::default();
    for log in [stdout_log_path(home), stderr_log_path(home)] {
        match policy.rotate(&log) {
            Ok(true) => tracing::info!(path = %log.display(), "log file rotated"),
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(path = %log.display(), error = %err, "log rotation failed")
            }
        }
    }
}

fn backup_path(log: &Path, n: usize) -> PathBuf {
    let mut name = log.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{n}"));
    log.with_file_name(name)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
