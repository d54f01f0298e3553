//! Session executor: pre-hooks, the transport call, post-hooks, terminal
//! status, and the pending-queue drain that follows every session.
//!
//! Hook failures are logged and absorbed. Only a transport failure changes
//! the session's terminal status.

use std::path::PathBuf;

use quill_core::{PendingChange, SyncError, SyncResult, SyncStatusEvent};

use crate::contracts::{IndexRebuilder, StageSink};
use crate::coordinator::SkipReason;
use crate::engine::SyncEngine;
use crate::queue::coalesce;
use crate::scheduler::Scheduled;

/// Stage texts published by the engine itself.
pub mod stages {
    pub const CHECKING: &str = "Checking sync preconditions";
    pub const STARTING: &str = "Starting sync";
    pub const PREPARING: &str = "Preparing workspace";
    pub const COMMITTING: &str = "Committing local changes";
    pub const APPLYING: &str = "Applying remote changes";
    pub const INDEXING: &str = "Updating index";
    pub const COMPLETE: &str = "Synchronization complete";
    pub const OFFLINE: &str = "skipped (offline)";
}

/// Owns the busy flag of a running session. Dropping it runs the terminal
/// sequence exactly once, whatever path the session took.
pub(crate) struct SessionGuard {
    engine: SyncEngine,
    outcome: Option<SyncStatusEvent>,
}

impl SessionGuard {
    pub(crate) fn new(engine: SyncEngine) -> Self {
        Self {
            engine,
            outcome: None,
        }
    }

    fn finish(mut self, outcome: SyncStatusEvent) {
        self.outcome = Some(outcome);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or_else(|| SyncStatusEvent::Failed {
            message: "sync task ended unexpectedly".to_string(),
        });
        self.engine.end_session(outcome);
    }
}

impl SyncEngine {
    pub(crate) async fn run_session(self, session: SessionGuard, message: String) {
        self.set_stage(stages::PREPARING);
        self.run_pre_hooks().await;

        self.set_stage(stages::COMMITTING);
        let transport = std::sync::Arc::clone(&self.inner.collab.transport);
        let sink = self.stage_sink();
        match transport.sync(&message, &sink).await {
            Ok(result) if result.offline => {
                tracing::info!("remote unreachable; sync skipped (offline)");
                self.set_stage(stages::OFFLINE);
                session.finish(SyncStatusEvent::Completed);
            }
            Ok(result) => {
                tracing::info!(
                    changed = result.changed_files.len(),
                    new = result.new_files.len(),
                    deleted = result.deleted_files.len(),
                    "sync transport finished",
                );
                self.set_stage(stages::APPLYING);
                self.run_post_hooks(&result).await;
                self.set_stage(stages::COMPLETE);
                session.finish(SyncStatusEvent::Completed);
            }
            Err(SyncError::LockContested { age_ms }) => {
                // Another process took the lock after the claim's check.
                let reason = SkipReason::LockContested { age_ms, phase: None };
                tracing::info!(reason = %reason, "transport found the sync lock held; requeueing");
                self.state()
                    .pending
                    .restore(vec![PendingChange::new(message)]);
                session.finish(SyncStatusEvent::Skipped {
                    message: reason.to_string(),
                });
            }
            Err(err) => {
                self.report_failure(&err);
                session.finish(SyncStatusEvent::Failed {
                    message: err.to_string(),
                });
            }
        }
    }

    /// Terminal sequence: clear the session, account for it, broadcast the
    /// outcome, then re-evaluate anything queued while it ran.
    pub(crate) fn end_session(&self, outcome: SyncStatusEvent) {
        let drain = {
            let mut state = self.state();
            let session = state.release();
            if state.session_counted {
                state.initiated = state.initiated.saturating_sub(1);
                state.session_counted = false;
            }
            if let Some(session) = session {
                let elapsed = chrono::Utc::now() - session.started_at;
                tracing::info!(
                    trigger = %session.trigger,
                    elapsed_ms = elapsed.num_milliseconds(),
                    outcome = ?outcome,
                    "sync session ended",
                );
            }
            !state.pending.is_empty()
        };
        self.publish(outcome);
        if drain {
            self.spawn_drain();
        }
    }

    fn stage_sink(&self) -> StageSink {
        let engine = self.clone();
        StageSink::new(move |event| {
            if let Some(stage) = event.stage_text() {
                engine.state().set_stage(&stage);
                engine.log_stage(&stage);
            }
            engine.publish(event);
        })
    }

    fn report_failure(&self, err: &SyncError) {
        if err.is_connectivity() {
            tracing::warn!(error = %err, "sync failed: remote unreachable");
            if self.inner.notices.try_pass() {
                self.inner.collab.notifier.info(
                    "Sync could not reach the server. Your changes are saved locally and will sync when the connection returns.",
                );
            } else {
                tracing::debug!("connectivity notice suppressed by cooldown");
            }
        } else {
            tracing::error!(error = %err, "sync failed");
            self.inner
                .collab
                .notifier
                .error(&format!("Sync failed: {err}"));
        }
    }

    // -----------------------------------------------------------------------
    // Hooks
    // -----------------------------------------------------------------------

    async fn run_pre_hooks(&self) {
        let collab = &self.inner.collab;
        if let Some(migration) = &collab.migration {
            let result = async {
                if migration.needs_migration().await? {
                    tracing::info!("running pre-sync migration");
                    migration.run().await?;
                }
                Ok::<(), SyncError>(())
            }
            .await;
            absorb("migration", result);
        }
        if let Some(repair) = &collab.repair {
            let result = async {
                if repair.has_local_changes().await? {
                    repair.repair(&[]).await?;
                }
                Ok::<(), SyncError>(())
            }
            .await;
            absorb("repair", result);
        }
    }

    async fn run_post_hooks(&self, result: &SyncResult) {
        let collab = &self.inner.collab;
        let touched = result.touched();

        if let Some(repair) = &collab.repair {
            if !touched.is_empty() {
                absorb("repair", repair.repair(&touched).await);
            }
        }
        if let Some(migration) = &collab.migration {
            if !result.new_files.is_empty() {
                let outcome = async {
                    if migration.needs_migration().await? {
                        tracing::info!("running post-sync migration for incoming files");
                        migration.run().await?;
                    }
                    Ok::<(), SyncError>(())
                }
                .await;
                absorb("migration", outcome);
            }
        }
        if let Some(viewers) = &collab.viewers {
            if !touched.is_empty() {
                absorb("viewer refresh", viewers.refresh_files(&touched).await);
            }
            if !result.deleted_files.is_empty() {
                absorb(
                    "viewer close",
                    viewers.close_for_deleted_files(&result.deleted_files).await,
                );
            }
        }
        if let Some(media) = &collab.media {
            absorb("media", media.post_sync_cleanup(&touched).await);
        }
        if let Some(usage) = &collab.usage {
            usage.schedule_report(self.inner.options.usage_report_delay);
        }
        if let Some(index) = &collab.index {
            self.set_stage(stages::INDEXING);
            self.refresh_index(index.as_ref(), &touched).await;
        }
    }

    async fn refresh_index(&self, index: &dyn IndexRebuilder, touched: &[PathBuf]) {
        let status = match index.check_status().await {
            Ok(status) => status,
            Err(err) => {
                absorb("index", Err(err));
                return;
            }
        };
        if status.needs_full_rebuild {
            tracing::info!("index needs a full rebuild");
            absorb("index", index.rebuild_all().await);
            return;
        }
        if touched.is_empty() {
            return;
        }

        let engine = self.clone();
        let progress = move |done: u64, total: u64| {
            engine.set_stage(&format!("Indexing files: {done}/{total}"));
        };
        if let Err(err) = index.sync_changed_files(touched, &progress).await {
            tracing::warn!(error = %err, "incremental index update failed; rebuilding");
            absorb("index", index.rebuild_all().await);
        }
    }

    // -----------------------------------------------------------------------
    // Pending queue drain
    // -----------------------------------------------------------------------

    /// Re-evaluate the pending queue in the background.
    pub(crate) fn spawn_drain(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no runtime available; pending changes wait for the next trigger");
            return;
        };
        let engine = self.clone();
        runtime.spawn(async move { engine.drain_pending().await });
    }

    /// Let the filesystem settle, then either re-schedule the queued changes
    /// as one sync or discard them if the working copy turned out clean.
    /// Changes that cannot be scheduled go back on the queue.
    pub(crate) async fn drain_pending(&self) {
        let settle = {
            let state = self.state();
            if state.pending.is_empty() {
                return;
            }
            state.config.settle_delay()
        };
        tokio::time::sleep(settle).await;

        let dirty = match self.workspace() {
            Some(path) => self.inner.collab.working_copy.is_dirty(&path).await,
            None => Err(SyncError::precondition("no workspace open")),
        };

        let changes = {
            let mut state = self.state();
            if state.busy {
                // The running session drains again when it ends.
                return;
            }
            state.pending.take()
        };
        let Some(message) = coalesce(&changes) else {
            return;
        };

        match dirty {
            Ok(false) => {
                tracing::debug!(
                    discarded = changes.len(),
                    "working copy clean; queued changes already synced"
                );
                return;
            }
            Ok(true) => {}
            Err(err) => {
                tracing::warn!(error = %err, "could not read working copy state; scheduling follow-up sync");
            }
        }

        match self.schedule_sync(message) {
            Scheduled::Armed(delay) => {
                tracing::info!(
                    queued = changes.len(),
                    delay_secs = delay.as_secs(),
                    "follow-up sync scheduled for queued changes",
                );
            }
            Scheduled::Queued => {}
            Scheduled::Ignored(reason) => {
                // Re-evaluated once the blocking condition clears.
                tracing::info!(
                    reason = %reason,
                    queued = changes.len(),
                    "follow-up sync deferred; keeping queued changes",
                );
                self.state().pending.restore(changes);
            }
        }
    }
}

fn absorb(hook: &'static str, result: Result<(), SyncError>) {
    if let Err(err) = result {
        let err = match err {
            err @ SyncError::Hook { .. } => err,
            other => SyncError::hook(hook, other),
        };
        tracing::warn!(error = %err, "sync hook failed; continuing");
    }
}
