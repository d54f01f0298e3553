//! Host-side collaborators bound by the daemon, and the binding itself.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use quill_core::{QuillConfig, SyncError};
use quill_sync::{AuthProvider, AuthStatus, Collaborators, Notifier, ProgressReporter, ProgressUpdate};

use crate::git::{GitTransport, GitVersionGate, GitWorkingCopy};
use crate::lockfile::FileLockService;

const RECENT_NOTICES: usize = 20;

/// Authenticated when no token variable is configured, or when the configured
/// variable is set and non-empty.
#[derive(Debug, Clone, Default)]
pub struct EnvTokenAuth {
    var: Option<String>,
}

impl EnvTokenAuth {
    pub fn new(var: Option<String>) -> Self {
        Self { var }
    }
}

#[async_trait]
impl AuthProvider for EnvTokenAuth {
    fn available(&self) -> bool {
        true
    }

    async fn status(&self) -> Result<AuthStatus, SyncError> {
        let authenticated = match &self.var {
            None => true,
            Some(var) => std::env::var(var).is_ok_and(|token| !token.trim().is_empty()),
        };
        Ok(AuthStatus { authenticated })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoticeLevel {
    Info,
    Transient,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Sends user-facing notices to the log and keeps the last few for `status`.
#[derive(Debug, Default)]
pub struct TracingNotifier {
    recent: Mutex<VecDeque<Notice>>,
}

impl TracingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent notices, oldest first.
    pub fn recent(&self) -> Vec<Notice> {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn keep(&self, level: NoticeLevel, message: &str) {
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.len() == RECENT_NOTICES {
            recent.pop_front();
        }
        recent.push_back(Notice {
            level,
            message: message.to_string(),
            at: Utc::now(),
        });
    }
}

impl Notifier for TracingNotifier {
    fn info(&self, message: &str) {
        tracing::info!(notice = %message, "notice");
        self.keep(NoticeLevel::Info, message);
    }

    fn transient(&self, message: &str, dismiss_after: Duration) {
        tracing::info!(notice = %message, dismiss_after_ms = dismiss_after.as_millis() as u64, "transient notice");
        self.keep(NoticeLevel::Transient, message);
    }

    fn warn_modal(&self, message: &str) {
        tracing::warn!(notice = %message, "warning");
        self.keep(NoticeLevel::Warning, message);
    }

    fn error(&self, message: &str) {
        tracing::error!(notice = %message, "error notice");
        self.keep(NoticeLevel::Error, message);
    }
}

/// Progress surface that writes to the log.
#[derive(Debug, Clone, Default)]
pub struct LogProgressReporter;

impl ProgressReporter for LogProgressReporter {
    fn begin(&self, title: &str) {
        tracing::info!(title, "progress opened");
    }

    fn report(&self, update: &ProgressUpdate) {
        if update.increment > 0 {
            tracing::info!(percent = update.percent, stage = %update.message, "progress");
        } else {
            tracing::debug!(percent = update.percent, stage = %update.message, "progress");
        }
    }

    fn finish(&self) {
        tracing::info!("progress closed");
    }
}

/// Everything the daemon binds for one workspace.
pub struct Bound {
    pub collaborators: Collaborators,
    pub notifier: Arc<TracingNotifier>,
    pub locks: Arc<FileLockService>,
}

/// Bind the git-backed collaborators for `workspace`. Optional hooks the
/// daemon has no implementation for stay unbound.
pub fn bind(config: &QuillConfig, workspace: &Path) -> Bound {
    let locks = Arc::new(FileLockService::for_workspace(
        workspace,
        config.lock_stuck_after(),
    ));
    let notifier = Arc::new(TracingNotifier::new());
    let collaborators = Collaborators::new(
        Arc::new(GitTransport::new(workspace, Arc::clone(&locks))),
        Arc::new(EnvTokenAuth::new(config.auth_token_env.clone())),
        locks.clone(),
        Arc::new(GitWorkingCopy),
        Arc::new(GitVersionGate::new(
            config.required_git_version.clone(),
            config.min_host_version.clone(),
        )),
        notifier.clone(),
    )
    .with_progress(Arc::new(LogProgressReporter));

    Bound {
        collaborators,
        notifier,
        locks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unset_token_variable_means_signed_out() {
        let auth = EnvTokenAuth::new(Some("QUILL_TEST_TOKEN_THAT_IS_NEVER_SET".into()));
        assert!(!auth.status().await.unwrap().authenticated);
    }

    #[tokio::test]
    async fn no_token_variable_means_signed_in() {
        assert!(EnvTokenAuth::default().status().await.unwrap().authenticated);
    }

    #[test]
    fn notifier_keeps_only_recent_notices() {
        let notifier = TracingNotifier::new();
        for n in 0..(RECENT_NOTICES + 5) {
            notifier.info(&format!("notice {n}"));
        }
        notifier.error("last");

        let recent = notifier.recent();
        assert_eq!(recent.len(), RECENT_NOTICES);
        assert_eq!(recent.last().map(|n| n.level.clone()), Some(NoticeLevel::Error));
        assert_eq!(recent[0].message, "notice 6");
    }

    #[test]
    fn daemon_binds_only_progress_hook() {
        let workspace = tempfile::TempDir::new().unwrap();
        let bound = bind(&QuillConfig::default(), workspace.path());
        let caps = bound.collaborators.capabilities();
        assert!(caps.progress);
        assert!(!caps.migration && !caps.repair && !caps.index);
        assert!(!caps.viewers && !caps.media && !caps.usage);
        assert!(bound.locks.path().ends_with(".git/quill-sync.lock"));
    }
}
