//! Scheduler gate: owns the single deferred-sync timer.
//!
//! Replacing the timer cancels the previous one (last write wins for
//! scheduling). Content is never lost this way: while a session is in
//! flight the timer is left alone and the message goes to the pending queue,
//! which the session re-arms from when it ends.

use std::time::Duration;

use tokio::task::AbortHandle;

use quill_core::SyncTrigger;

use crate::coordinator::SkipReason;
use crate::engine::{EngineState, SyncEngine};

/// Outcome of [`SyncEngine::schedule_sync`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheduled {
    /// A timer was armed for this delay.
    Armed(Duration),
    /// A session is in flight; the message joined the pending queue.
    Queued,
    /// Nothing was armed.
    Ignored(SkipReason),
}

#[derive(Debug, Default)]
pub(crate) struct TimerSlot {
    generation: u64,
    handle: Option<AbortHandle>,
    /// Message the live timer will commit with.
    message: Option<String>,
}

impl TimerSlot {
    pub(crate) fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    pub(crate) fn live_message(&self) -> Option<&str> {
        self.handle.as_ref().and(self.message.as_deref())
    }

    /// Cancel the live timer. Idempotent; returns whether one was live.
    pub(crate) fn cancel(&mut self) -> bool {
        self.generation = self.generation.wrapping_add(1);
        self.message = None;
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl SyncEngine {
    /// Request a sync after the configured debounce delay.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule_sync(&self, message: impl Into<String>) -> Scheduled {
        let message = message.into();
        let mut state = self.state();

        if state.import_blocks > 0 {
            tracing::debug!(message = %message, "import in progress; not arming sync timer");
            return Scheduled::Ignored(SkipReason::ImportBlocked);
        }
        if state.workspace.is_none() {
            tracing::debug!(message = %message, "no workspace open; not arming sync timer");
            return Scheduled::Ignored(SkipReason::NoWorkspace);
        }
        if !state.config.auto_sync_enabled {
            tracing::debug!(message = %message, "auto-sync disabled; not arming sync timer");
            return Scheduled::Ignored(SkipReason::AutoSyncDisabled);
        }
        if state.busy {
            // The in-flight session re-arms from the queue when it ends.
            state.pending.push(message);
            tracing::debug!(queued = state.pending.len(), "sync in flight; change queued");
            return Scheduled::Queued;
        }

        let delay = state.config.effective_sync_delay();
        self.arm_timer(&mut state, message, delay);
        Scheduled::Armed(delay)
    }

    /// Cancel the live timer, if any.
    pub fn clear_pending_sync(&self) {
        if self.state().timer.cancel() {
            tracing::debug!("pending sync timer cleared");
        }
    }

    pub(crate) fn arm_timer(&self, state: &mut EngineState, message: String, delay: Duration) {
        state.timer.cancel();
        state.timer.message = Some(message.clone());
        let generation = state.timer.generation;
        let engine = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.fire_timer(generation, message).await;
        });
        state.timer.handle = Some(task.abort_handle());
        tracing::debug!(delay_secs = delay.as_secs(), "sync timer armed");
    }

    async fn fire_timer(&self, generation: u64, message: String) {
        {
            let mut state = self.state();
            if state.timer.generation != generation {
                return;
            }
            // Detach before executing so the claim's timer clear cannot abort
            // this very task.
            state.timer.handle = None;
            state.timer.message = None;
        }
        let dispatch = self.dispatch(message, SyncTrigger::Scheduled).await;
        tracing::debug!(dispatch = ?dispatch, "scheduled sync fired");
    }
}
