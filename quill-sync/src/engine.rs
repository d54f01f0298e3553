//! The engine handle and its shared state.
//!
//! One [`SyncEngine`] is constructed at startup and cloned into every call
//! site. All in-process coordination state lives behind a single mutex that
//! is never held across an `.await`; claims happen synchronously before any
//! asynchronous work starts.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use quill_core::{QuillConfig, SyncSession, SyncStatusEvent, SyncTrigger};

use crate::broadcast::{ListenerGuard, StatusBroadcaster};
use crate::contracts::{Capabilities, Collaborators};
use crate::notice::NoticeGate;
use crate::progress::ProgressSurfaces;
use crate::queue::PendingChangeQueue;
use crate::scheduler::TimerSlot;

/// Construction-time knobs that are not user configuration.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Log every stage change at `info` instead of `debug`.
    pub verbose: bool,
    /// How long the "already syncing" indicator stays up.
    pub busy_notice: Duration,
    /// Delay handed to the usage reporter after each successful sync.
    pub usage_report_delay: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            busy_notice: Duration::from_secs(3),
            usage_report_delay: Duration::from_secs(30),
        }
    }
}

/// Snapshot returned by [`SyncEngine::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub busy: bool,
    pub stage: Option<String>,
    pub trigger: Option<SyncTrigger>,
    pub import_blocked: bool,
    pub pending_changes: usize,
    pub timer_armed: bool,
    pub workspace: Option<PathBuf>,
    pub percent: Option<u8>,
}

pub(crate) struct EngineState {
    /// Busy flag. Set ⇔ `session` is `Some`.
    pub(crate) busy: bool,
    pub(crate) session: Option<SyncSession>,
    /// Sessions initiated through `execute_sync` and not yet accounted for.
    pub(crate) initiated: u32,
    /// Whether the in-flight session still holds its `initiated` count.
    pub(crate) session_counted: bool,
    pub(crate) import_blocks: u32,
    pub(crate) workspace: Option<PathBuf>,
    pub(crate) config: QuillConfig,
    pub(crate) timer: TimerSlot,
    pub(crate) pending: PendingChangeQueue,
}

impl EngineState {
    /// Set the busy flag and create the session in one step.
    /// Returns `false` if another session already holds the claim.
    pub(crate) fn claim(&mut self, session: SyncSession) -> bool {
        if self.busy {
            return false;
        }
        self.busy = true;
        self.session = Some(session);
        true
    }

    /// Clear the busy flag and destroy the session in one step.
    pub(crate) fn release(&mut self) -> Option<SyncSession> {
        self.busy = false;
        self.session.take()
    }

    pub(crate) fn set_stage(&mut self, stage: &str) {
        if let Some(session) = self.session.as_mut() {
            session.stage = stage.to_string();
        }
    }
}

pub(crate) struct Inner {
    pub(crate) state: Mutex<EngineState>,
    pub(crate) collab: Collaborators,
    pub(crate) capabilities: Capabilities,
    pub(crate) broadcaster: StatusBroadcaster,
    pub(crate) notices: NoticeGate,
    pub(crate) progress: ProgressSurfaces,
    pub(crate) options: EngineOptions,
}

/// Cheap, cloneable handle to the coordination engine.
#[derive(Clone)]
pub struct SyncEngine {
    pub(crate) inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(config: QuillConfig, collab: Collaborators, options: EngineOptions) -> Self {
        let capabilities = collab.capabilities();
        tracing::debug!(capabilities = ?capabilities, "binding sync collaborators");

        let state = EngineState {
            busy: false,
            session: None,
            initiated: 0,
            session_counted: false,
            import_blocks: 0,
            workspace: config.workspace.clone(),
            config: config.clone(),
            timer: TimerSlot::default(),
            pending: PendingChangeQueue::new(),
        };
        let progress = ProgressSurfaces::new(collab.progress.clone());
        let notices = NoticeGate::new(config.connectivity_notice_cooldown());

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                collab,
                capabilities,
                broadcaster: StatusBroadcaster::new(),
                notices,
                progress,
                options,
            }),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, EngineState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.capabilities
    }

    pub fn status(&self) -> EngineStatus {
        let state = self.state();
        EngineStatus {
            busy: state.busy,
            stage: state
                .session
                .as_ref()
                .map(|s| s.stage.clone())
                .filter(|s| !s.is_empty()),
            trigger: state.session.as_ref().map(|s| s.trigger),
            import_blocked: state.import_blocks > 0,
            pending_changes: state.pending.len(),
            timer_armed: state.timer.is_armed(),
            workspace: state.workspace.clone(),
            percent: state.busy.then(|| self.inner.progress.percent()),
        }
    }

    /// Messages currently waiting for the next sync, oldest first.
    pub fn pending_messages(&self) -> Vec<String> {
        self.state()
            .pending
            .iter()
            .map(|change| change.message.clone())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Status stream
    // -----------------------------------------------------------------------

    /// Register a status callback. Dropping the guard unregisters it.
    pub fn add_status_listener(
        &self,
        listener: impl Fn(&SyncStatusEvent) + Send + Sync + 'static,
    ) -> ListenerGuard {
        self.inner.broadcaster.add_listener(listener)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncStatusEvent> {
        self.inner.broadcaster.subscribe()
    }

    pub(crate) fn publish(&self, event: SyncStatusEvent) {
        self.inner.broadcaster.publish(event);
    }

    /// Record `stage` on the in-flight session and broadcast it.
    pub(crate) fn set_stage(&self, stage: &str) {
        self.state().set_stage(stage);
        self.log_stage(stage);
        self.publish(SyncStatusEvent::stage(stage));
    }

    pub(crate) fn log_stage(&self, stage: &str) {
        if self.inner.options.verbose {
            tracing::info!(stage, "sync stage");
        } else {
            tracing::debug!(stage, "sync stage");
        }
    }

    // -----------------------------------------------------------------------
    // Workspace, configuration, import block
    // -----------------------------------------------------------------------

    /// A workspace was opened: auto-arming is possible again and any queued
    /// changes are re-evaluated.
    pub fn open_workspace(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        tracing::info!(workspace = %path.display(), "workspace opened");
        let reevaluate = {
            let mut state = self.state();
            state.workspace = Some(path);
            !state.busy && !state.pending.is_empty()
        };
        if reevaluate {
            self.spawn_drain();
        }
    }

    /// The last workspace closed: clear any pending timer and stop auto-arming.
    pub fn close_workspace(&self) {
        let mut state = self.state();
        state.workspace = None;
        if state.timer.cancel() {
            tracing::info!("workspace closed; pending sync timer cleared");
        }
    }

    pub fn workspace(&self) -> Option<PathBuf> {
        self.state().workspace.clone()
    }

    /// Apply a new configuration and re-evaluate scheduling against it.
    ///
    /// Disabling auto-sync clears the live timer. A changed delay re-arms a
    /// live timer at the new delay. Re-enabling auto-sync drains changes that
    /// were kept while it was off.
    pub fn update_config(&self, config: QuillConfig) {
        self.inner
            .notices
            .set_window(config.connectivity_notice_cooldown());
        let reevaluate = {
            let mut state = self.state();
            let was_enabled = state.config.auto_sync_enabled;
            let old_delay = state.config.effective_sync_delay();
            let new_delay = config.effective_sync_delay();
            if let Some(workspace) = config.workspace.as_deref() {
                if state.workspace.as_deref() != Some(workspace) {
                    state.workspace = Some(workspace.to_path_buf());
                }
            }
            let enabled = config.auto_sync_enabled;
            state.config = config;

            if !enabled {
                if state.timer.cancel() {
                    tracing::info!("auto-sync disabled; pending sync timer cleared");
                }
            } else if new_delay != old_delay {
                if let Some(message) = state.timer.live_message().map(str::to_string) {
                    self.arm_timer(&mut state, message, new_delay);
                    tracing::info!(delay_secs = new_delay.as_secs(), "sync delay changed; timer re-armed");
                }
            }
            enabled && !was_enabled && !state.busy && !state.pending.is_empty()
        };
        if reevaluate {
            tracing::info!("auto-sync enabled; re-evaluating queued changes");
            self.spawn_drain();
        }
    }

    pub fn config(&self) -> QuillConfig {
        self.state().config.clone()
    }

    /// Begin an exclusive bulk import. Nestable; pauses scheduling and execution.
    pub fn begin_import_block(&self) {
        let mut state = self.state();
        state.import_blocks += 1;
        tracing::debug!(depth = state.import_blocks, "import block entered");
    }

    /// End one level of import block. Reaching zero re-evaluates queued changes.
    pub fn end_import_block(&self) {
        let reevaluate = {
            let mut state = self.state();
            if state.import_blocks == 0 {
                tracing::warn!("end_import_block called without a matching begin");
                return;
            }
            state.import_blocks -= 1;
            tracing::debug!(depth = state.import_blocks, "import block exited");
            state.import_blocks == 0 && !state.busy && !state.pending.is_empty()
        };
        if reevaluate {
            self.spawn_drain();
        }
    }
}
