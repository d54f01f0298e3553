use std::path::PathBuf;

use thiserror::Error;

use quill_core::SyncError;

/// Failures of the daemon process and of clients talking to it.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("file watcher failed: {0}")]
    Notify(#[from] notify::Error),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("malformed daemon message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0} is no longer running")]
    ChannelClosed(&'static str),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    /// The daemon handled the request and answered with an error.
    #[error("{0}")]
    Rejected(String),

    #[error("daemon is not running (no socket at {socket})")]
    DaemonNotRunning { socket: PathBuf },

    #[error("no workspace configured in {config}; run `quill init <path>` first")]
    NoWorkspace { config: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
