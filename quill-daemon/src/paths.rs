use std::path::{Path, PathBuf};
use std::time::Duration;

use quill_core::config::quill_root;

/// Repeated filesystem events for one path inside this window collapse into one.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

pub const DAEMON_STDOUT_LOG: &str = "daemon.log";
pub const DAEMON_STDERR_LOG: &str = "daemon-err.log";
pub const DAEMON_SOCKET: &str = "daemon.sock";

/// Lock file name, relative to the workspace's `.git` directory.
pub const SYNC_LOCK_FILE: &str = "quill-sync.lock";

pub fn run_dir(home: &Path) -> PathBuf {
    quill_root(home).join("run")
}

pub fn socket_path(home: &Path) -> PathBuf {
    run_dir(home).join(DAEMON_SOCKET)
}

pub fn logs_dir(home: &Path) -> PathBuf {
    quill_root(home).join("logs")
}

pub fn stdout_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDOUT_LOG)
}

pub fn stderr_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDERR_LOG)
}

pub fn sync_lock_path(workspace: &Path) -> PathBuf {
    workspace.join(".git").join(SYNC_LOCK_FILE)
}
