//! Collaborator contracts consumed by the engine.
//!
//! Required collaborators are passed to [`Collaborators::new`]. Optional hooks
//! are bound through the `with_*` builder methods; which ones are present is
//! captured once in [`Capabilities`] when the engine is constructed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use quill_core::{LockStatus, SyncError, SyncResult, SyncStatusEvent};

use crate::progress::ProgressUpdate;

// ---------------------------------------------------------------------------
// Required collaborators
// ---------------------------------------------------------------------------

/// The version-control reconciliation (fetch, merge, push).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Reconcile the working copy, committing local edits with `message`.
    ///
    /// `stages` receives stage text as the transport moves through its steps.
    async fn sync(&self, message: &str, stages: &StageSink) -> Result<SyncResult, SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuthStatus {
    pub authenticated: bool,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Whether an authentication provider is present at all.
    fn available(&self) -> bool;

    async fn status(&self) -> Result<AuthStatus, SyncError>;
}

/// Authoritative cross-process lock, owned by another component.
#[async_trait]
pub trait LockService: Send + Sync {
    async fn check_lock(&self) -> Result<LockStatus, SyncError>;

    /// Remove a dead or stuck lock. Returns `true` if something was removed.
    async fn cleanup_stale_lock(&self) -> Result<bool, SyncError>;
}

#[async_trait]
pub trait WorkingCopyState: Send + Sync {
    /// Whether `path` has uncommitted local modifications.
    async fn is_dirty(&self, path: &Path) -> Result<bool, SyncError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionCheck {
    pub ok: bool,
    pub installed: Option<String>,
    pub required: String,
}

impl VersionCheck {
    pub fn installed_label(&self) -> &str {
        self.installed.as_deref().unwrap_or("not installed")
    }
}

#[async_trait]
pub trait VersionGate: Send + Sync {
    /// Hard gate: the collaborating service must meet its minimum version.
    async fn check_required_service_version(&self) -> Result<VersionCheck, SyncError>;

    /// Soft gate: an outdated host only earns an informational prompt.
    async fn check_host_version(&self) -> Result<VersionCheck, SyncError>;
}

/// User-facing notification surface.
pub trait Notifier: Send + Sync {
    /// Non-blocking informational message.
    fn info(&self, message: &str);

    /// Auto-dismissing indicator.
    fn transient(&self, message: &str, dismiss_after: Duration);

    /// Blocking warning the user has to acknowledge.
    fn warn_modal(&self, message: &str);

    /// Blocking error notification.
    fn error(&self, message: &str);
}

// ---------------------------------------------------------------------------
// Optional hooks
// ---------------------------------------------------------------------------

#[async_trait]
pub trait MigrationHook: Send + Sync {
    async fn needs_migration(&self) -> Result<bool, SyncError>;
    async fn run(&self) -> Result<(), SyncError>;
}

/// Repair of auxiliary metadata files.
#[async_trait]
pub trait RepairHook: Send + Sync {
    /// Whether the repaired auxiliary file has local modifications.
    async fn has_local_changes(&self) -> Result<bool, SyncError>;

    /// Repair `paths`, or everything when `paths` is empty.
    async fn repair(&self, paths: &[PathBuf]) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexStatus {
    pub needs_full_rebuild: bool,
}

/// Derived search index.
#[async_trait]
pub trait IndexRebuilder: Send + Sync {
    async fn check_status(&self) -> Result<IndexStatus, SyncError>;

    /// Incrementally re-index `files`, reporting `(done, total)`.
    async fn sync_changed_files(
        &self,
        files: &[PathBuf],
        progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<(), SyncError>;

    async fn rebuild_all(&self) -> Result<(), SyncError>;
}

/// Open editors and viewers.
#[async_trait]
pub trait ViewerRefresh: Send + Sync {
    async fn refresh_files(&self, paths: &[PathBuf]) -> Result<(), SyncError>;
    async fn close_for_deleted_files(&self, paths: &[PathBuf]) -> Result<(), SyncError>;
}

/// Large attached media (reclaim or materialize per the active strategy).
#[async_trait]
pub trait MediaStrategy: Send + Sync {
    async fn post_sync_cleanup(&self, uploaded: &[PathBuf]) -> Result<(), SyncError>;
}

pub trait UsageReporter: Send + Sync {
    /// Queue a usage-metrics report to run after `delay`.
    fn schedule_report(&self, delay: Duration);
}

/// Progress surface driven by the progress projection.
pub trait ProgressReporter: Send + Sync {
    fn begin(&self, title: &str);
    fn report(&self, update: &ProgressUpdate);
    fn finish(&self);
}

// ---------------------------------------------------------------------------
// Stage sink
// ---------------------------------------------------------------------------

/// Callback handed to the transport so it can publish stage changes.
#[derive(Clone)]
pub struct StageSink {
    emit: Arc<dyn Fn(SyncStatusEvent) + Send + Sync>,
}

impl StageSink {
    pub fn new(emit: impl Fn(SyncStatusEvent) + Send + Sync + 'static) -> Self {
        Self {
            emit: Arc::new(emit),
        }
    }

    /// A sink that discards everything.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn stage(&self, text: impl Into<String>) {
        (self.emit)(SyncStatusEvent::stage(text));
    }

    /// Structured progress for a known phase (`commit`, `fetch`, `merge`,
    /// `push`); rendered to text through
    /// [`quill_core::types::format_stage`].
    pub fn progress(&self, phase: &str, loaded: u64, total: u64) {
        (self.emit)(SyncStatusEvent::Progress {
            phase: phase.to_string(),
            loaded: Some(loaded),
            total: Some(total),
            description: None,
        });
    }
}

impl fmt::Debug for StageSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSink").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

/// Which optional hooks are bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub migration: bool,
    pub repair: bool,
    pub index: bool,
    pub viewers: bool,
    pub media: bool,
    pub usage: bool,
    pub progress: bool,
}

/// Every collaborator the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) auth: Arc<dyn AuthProvider>,
    pub(crate) lock: Arc<dyn LockService>,
    pub(crate) working_copy: Arc<dyn WorkingCopyState>,
    pub(crate) versions: Arc<dyn VersionGate>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) migration: Option<Arc<dyn MigrationHook>>,
    pub(crate) repair: Option<Arc<dyn RepairHook>>,
    pub(crate) index: Option<Arc<dyn IndexRebuilder>>,
    pub(crate) viewers: Option<Arc<dyn ViewerRefresh>>,
    pub(crate) media: Option<Arc<dyn MediaStrategy>>,
    pub(crate) usage: Option<Arc<dyn UsageReporter>>,
    pub(crate) progress: Option<Arc<dyn ProgressReporter>>,
}

impl Collaborators {
    pub fn new(
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthProvider>,
        lock: Arc<dyn LockService>,
        working_copy: Arc<dyn WorkingCopyState>,
        versions: Arc<dyn VersionGate>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            transport,
            auth,
            lock,
            working_copy,
            versions,
            notifier,
            migration: None,
            repair: None,
            index: None,
            viewers: None,
            media: None,
            usage: None,
            progress: None,
        }
    }

    pub fn with_migration(mut self, hook: Arc<dyn MigrationHook>) -> Self {
        self.migration = Some(hook);
        self
    }

    pub fn with_repair(mut self, hook: Arc<dyn RepairHook>) -> Self {
        self.repair = Some(hook);
        self
    }

    pub fn with_index(mut self, index: Arc<dyn IndexRebuilder>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_viewers(mut self, viewers: Arc<dyn ViewerRefresh>) -> Self {
        self.viewers = Some(viewers);
        self
    }

    pub fn with_media(mut self, media: Arc<dyn MediaStrategy>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_usage(mut self, usage: Arc<dyn UsageReporter>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_progress(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.progress = Some(reporter);
        self
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            migration: self.migration.is_some(),
            repair: self.repair.is_some(),
            index: self.index.is_some(),
            viewers: self.viewers.is_some(),
            media: self.media.is_some(),
            usage: self.usage.is_some(),
            progress: self.progress.is_some(),
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("capabilities", &self.capabilities())
            .finish_non_exhaustive()
    }
}
