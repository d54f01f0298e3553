//! Error types for quill.

use std::path::PathBuf;

use thiserror::Error;

/// Substrings that mark a failure as connectivity-class rather than a genuine
/// transport fault. Matched case-insensitively against the error text.
const CONNECTIVITY_MARKERS: &[&str] = &[
    "network",
    "offline",
    "could not resolve host",
    "unable to access",
    "connection refused",
    "connection reset",
    "connection timed out",
    "timed out",
    "no route to host",
    "enotfound",
    "econnrefused",
    "etimedout",
    "session expired",
    "token expired",
];

/// All errors that can arise while coordinating a sync.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No workspace, import-blocked, unauthenticated, or a hard version gate failed.
    /// Never retried automatically.
    #[error("sync precondition unmet: {reason}")]
    PreconditionUnmet { reason: String },

    /// Another process holds the cross-process sync lock.
    #[error("sync lock held by another process (acquired {age_ms} ms ago)")]
    LockContested { age_ms: u64 },

    /// Network unreachable, offline, or an expired session.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// Any other failure reported by the core reconciliation.
    #[error("transport error: {0}")]
    Transport(String),

    /// A pre/post step failed. Logged and absorbed, never fatal to a session.
    #[error("{hook} hook failed: {message}")]
    Hook { hook: &'static str, message: String },

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (config save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on config load, with the offending path.
    #[error("failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// `dirs::home_dir()` returned `None`; cannot locate `~/.quill/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

impl SyncError {
    pub fn precondition(reason: impl Into<String>) -> Self {
        SyncError::PreconditionUnmet {
            reason: reason.into(),
        }
    }

    pub fn hook(hook: &'static str, err: impl std::fmt::Display) -> Self {
        SyncError::Hook {
            hook,
            message: err.to_string(),
        }
    }

    /// Classify a free-text failure from the transport into
    /// [`SyncError::Connectivity`] or [`SyncError::Transport`].
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_connectivity_message(&message) {
            SyncError::Connectivity(message)
        } else {
            SyncError::Transport(message)
        }
    }

    /// Whether this error belongs to the cooldown-gated connectivity channel.
    ///
    /// Errors constructed as `Transport` or `Io` are re-checked by message
    /// content, since collaborators do not always classify for us.
    pub fn is_connectivity(&self) -> bool {
        match self {
            SyncError::Connectivity(_) => true,
            SyncError::Transport(message) => is_connectivity_message(message),
            SyncError::Io { source, .. } => is_connectivity_message(&source.to_string()),
            _ => false,
        }
    }
}

/// True when `message` reads like a network/offline/session-expired failure.
pub fn is_connectivity_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    CONNECTIVITY_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Convenience constructor for [`SyncError::Io`].
pub fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("fatal: unable to access 'https://host/repo.git/'", true)]
    #[case("Could not resolve host: example.org", true)]
    #[case("request failed: ETIMEDOUT", true)]
    #[case("Session expired, please sign in again", true)]
    #[case("merge conflict in notes.codex", false)]
    #[case("fatal: refusing to merge unrelated histories", false)]
    fn classify_splits_connectivity_from_transport(#[case] message: &str, #[case] conn: bool) {
        let err = SyncError::classify(message);
        assert_eq!(err.is_connectivity(), conn, "message: {message}");
        if conn {
            assert!(matches!(err, SyncError::Connectivity(_)));
        } else {
            assert!(matches!(err, SyncError::Transport(_)));
        }
    }

    #[test]
    fn unclassified_transport_error_is_rechecked_by_content() {
        let err = SyncError::Transport("network is unreachable".to_string());
        assert!(err.is_connectivity());
    }

    #[test]
    fn hook_error_names_the_hook() {
        let err = SyncError::hook("index", "rebuild aborted");
        assert_eq!(err.to_string(), "index hook failed: rebuild aborted");
        assert!(!err.is_connectivity());
    }
}
