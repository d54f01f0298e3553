//! Bridge for status pushed by a cooperating external synchronizer.
//!
//! The external synchronizer also reports the sessions this engine started
//! itself. Those are recognised through the `initiated` counter and only
//! accounted for; the executor owns their terminal sequence.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use quill_core::types::format_stage;
use quill_core::{ExternalSyncEvent, SyncSession, SyncStatusEvent, SyncTrigger};

use crate::engine::SyncEngine;

/// Keeps the bridge task alive. Dropping it detaches the bridge.
#[must_use = "dropping the handle stops consuming external events"]
pub struct BridgeHandle {
    task: JoinHandle<()>,
}

impl BridgeHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Owner {
    External { drain: bool },
    Internal,
    Idle,
}

impl SyncEngine {
    /// Consume external status events until the sender side closes.
    pub fn attach_external(&self, mut events: mpsc::UnboundedReceiver<ExternalSyncEvent>) -> BridgeHandle {
        let engine = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                engine.handle_external(event);
            }
            tracing::debug!("external status stream closed");
        });
        BridgeHandle { task }
    }

    /// Apply one external status event.
    pub fn handle_external(&self, event: ExternalSyncEvent) {
        match event {
            ExternalSyncEvent::Started { message } => self.external_started(message),
            ExternalSyncEvent::Progress {
                phase,
                loaded,
                total,
                description,
            } => self.external_progress(phase, loaded, total, description),
            ExternalSyncEvent::Completed => self.external_finished(SyncStatusEvent::Completed),
            ExternalSyncEvent::Error { message } => {
                tracing::warn!(error = %message, "external synchronizer reported an error");
                self.external_finished(SyncStatusEvent::Failed { message })
            }
            ExternalSyncEvent::Skipped { message } => {
                self.external_finished(SyncStatusEvent::Skipped { message })
            }
        }
    }

    fn external_started(&self, message: String) {
        let stage = if message.is_empty() {
            "Synchronizing".to_string()
        } else {
            message
        };
        let adopted = {
            let mut state = self.state();
            if state.initiated > 0 || state.busy {
                false
            } else {
                let mut session = SyncSession::new(SyncTrigger::ExternalCooperative, "");
                session.stage = stage.clone();
                state.claim(session)
            }
        };
        if !adopted {
            tracing::debug!("external start for a session already tracked here");
            return;
        }

        tracing::info!(stage = %stage, "external synchronizer started a sync");
        self.inner.progress.start_external("Synchronizing", self.subscribe());
        self.publish(SyncStatusEvent::Started);
        self.log_stage(&stage);
        self.publish(SyncStatusEvent::stage(stage));
    }

    fn external_progress(
        &self,
        phase: String,
        loaded: Option<u64>,
        total: Option<u64>,
        description: Option<String>,
    ) {
        let stage = format_stage(&phase, loaded, total, description.as_deref());
        let owner = {
            let mut state = self.state();
            let trigger = state.session.as_ref().map(|s| s.trigger);
            if trigger == Some(SyncTrigger::ExternalCooperative) {
                state.set_stage(&stage);
            }
            trigger
        };
        match owner {
            Some(SyncTrigger::ExternalCooperative) => {
                self.log_stage(&stage);
                self.publish(SyncStatusEvent::Progress {
                    phase,
                    loaded,
                    total,
                    description,
                });
            }
            // Internal sessions already publish through their stage sink.
            Some(_) => tracing::trace!(stage = %stage, "external progress for internal session"),
            None => tracing::debug!(stage = %stage, "external progress with no session in flight"),
        }
    }

    fn external_finished(&self, outcome: SyncStatusEvent) {
        let owner = {
            let mut state = self.state();
            match state.session.as_ref().map(|s| s.trigger) {
                Some(SyncTrigger::ExternalCooperative) => {
                    state.release();
                    Owner::External {
                        drain: !state.pending.is_empty(),
                    }
                }
                Some(_) => {
                    if state.session_counted && state.initiated > 0 {
                        state.initiated -= 1;
                        state.session_counted = false;
                    }
                    Owner::Internal
                }
                None => Owner::Idle,
            }
        };

        match owner {
            Owner::External { drain } => {
                tracing::info!(outcome = ?outcome, "external sync finished");
                self.publish(outcome);
                self.inner.progress.finish_external();
                if drain {
                    self.spawn_drain();
                }
            }
            Owner::Internal => {
                tracing::debug!("external synchronizer finished a session started here");
            }
            Owner::Idle => {
                tracing::debug!(outcome = ?outcome, "external terminal event with no session in flight");
            }
        }
    }
}
