//! Claim protocol: in-process busy flag first, then the authoritative
//! cross-process lock, then preflight, then hand-off to the executor.
//!
//! Every early return releases the partial claim; [`ClaimGuard`] does it on
//! drop so no path can leak the busy flag.

use std::fmt;
use std::sync::Arc;

use quill_core::{SyncError, SyncSession, SyncStatusEvent, SyncTrigger};

use crate::engine::SyncEngine;
use crate::executor::{stages, SessionGuard};

/// Why a sync request did not start a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoWorkspace,
    ImportBlocked,
    AutoSyncDisabled,
    /// A session is already in flight in this process.
    Busy,
    /// Another process holds the sync lock.
    LockContested {
        age_ms: u64,
        phase: Option<String>,
    },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoWorkspace => write!(f, "no workspace is open"),
            SkipReason::ImportBlocked => write!(f, "an import is in progress"),
            SkipReason::AutoSyncDisabled => write!(f, "auto-sync is disabled"),
            SkipReason::Busy => write!(f, "a sync is already in progress"),
            SkipReason::LockContested { age_ms, phase } => {
                write!(f, "another process is syncing (lock age {age_ms} ms")?;
                if let Some(phase) = phase {
                    write!(f, ", phase {phase}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Result of [`SyncEngine::execute_sync`], known once the claim and preflight
/// are settled. The session itself keeps running in the background.
#[derive(Debug)]
pub enum Dispatch {
    Started,
    Skipped(SkipReason),
    Failed(SyncError),
}

impl Dispatch {
    pub fn is_started(&self) -> bool {
        matches!(self, Dispatch::Started)
    }
}

/// Partial claim on the busy flag. Released on drop unless promoted.
pub(crate) struct ClaimGuard {
    engine: Option<SyncEngine>,
}

impl ClaimGuard {
    fn new(engine: SyncEngine) -> Self {
        Self {
            engine: Some(engine),
        }
    }

    /// Promote to a running session; the session guard owns release from here.
    fn into_session(mut self) -> Option<SessionGuard> {
        self.engine.take().map(SessionGuard::new)
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.state().release();
        }
    }
}

impl SyncEngine {
    /// Start a sync now, if nothing prevents it.
    ///
    /// Returns once the claim and preflight checks are settled; the
    /// reconciliation runs as a background task. Subscribe to the status
    /// stream to observe completion.
    pub async fn execute_sync(&self, message: impl Into<String>, manual: bool) -> Dispatch {
        let trigger = if manual {
            SyncTrigger::Manual
        } else {
            SyncTrigger::Scheduled
        };
        self.dispatch(message.into(), trigger).await
    }

    pub(crate) async fn dispatch(&self, message: String, trigger: SyncTrigger) -> Dispatch {
        let manual = trigger == SyncTrigger::Manual;

        // Claim synchronously, before any await.
        let refused = {
            let mut state = self.state();
            if state.workspace.is_none() && !manual {
                Some((SkipReason::NoWorkspace, !state.busy))
            } else if state.import_blocks > 0 {
                state.pending.push(message.clone());
                Some((SkipReason::ImportBlocked, !state.busy))
            } else {
                let mut session = SyncSession::new(trigger, message.clone());
                session.stage = stages::CHECKING.to_string();
                if state.claim(session) {
                    None
                } else {
                    state.pending.push(message.clone());
                    Some((SkipReason::Busy, false))
                }
            }
        };
        if let Some((reason, announce)) = refused {
            return self.refuse(reason, announce, manual);
        }
        let claim = ClaimGuard::new(self.clone());

        // Verify against the authoritative cross-process lock.
        match self.inner.collab.lock.check_lock().await {
            Ok(lock) if lock.is_held() => {
                let text = format!(
                    "Another sync started {} is still running; your changes will sync afterwards.",
                    lock.age_description()
                );
                if manual {
                    self.inner.collab.notifier.info(&text);
                }
                tracing::info!(
                    age_ms = lock.age_ms,
                    owner_pid = lock.owner_pid,
                    phase = lock.phase.as_deref().unwrap_or("-"),
                    "sync lock held by another process; queued change",
                );
                self.state().pending.push(message);
                self.publish(SyncStatusEvent::Skipped { message: text });
                drop(claim);
                self.spawn_drain();
                return Dispatch::Skipped(SkipReason::LockContested {
                    age_ms: lock.age_ms,
                    phase: lock.phase,
                });
            }
            Ok(lock) if lock.exists => {
                // The lock owner reclaims dead or stuck locks.
                tracing::warn!(
                    dead = lock.is_dead,
                    stuck = lock.is_stuck,
                    age_ms = lock.age_ms,
                    owner_pid = lock.owner_pid,
                    "proceeding past stale sync lock",
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "could not read sync lock; proceeding");
            }
        }

        if let Err(err) = self.preflight().await {
            tracing::info!(error = %err, "sync preflight failed");
            self.publish(SyncStatusEvent::Failed {
                message: err.to_string(),
            });
            drop(claim);
            return Dispatch::Failed(err);
        }

        // Hand off. A claimed sync supersedes any future auto-trigger.
        let events = self.subscribe();
        {
            let mut state = self.state();
            state.timer.cancel();
            state.set_stage(stages::STARTING);
            state.initiated += 1;
            state.session_counted = true;
        }
        let Some(session) = claim.into_session() else {
            return Dispatch::Failed(SyncError::precondition("sync claim was lost"));
        };

        tracing::info!(trigger = %trigger, message = %message, "sync started");
        self.inner.progress.start(session_title(trigger), events);
        self.publish(SyncStatusEvent::Started);
        self.log_stage(stages::STARTING);
        self.publish(SyncStatusEvent::stage(stages::STARTING));

        tokio::spawn(self.clone().run_session(session, message));
        Dispatch::Started
    }

    fn refuse(&self, reason: SkipReason, announce: bool, manual: bool) -> Dispatch {
        tracing::debug!(reason = %reason, manual, "sync request refused");
        let notifier = Arc::clone(&self.inner.collab.notifier);
        if manual {
            match reason {
                SkipReason::Busy => notifier.transient(
                    "Sync already in progress; your changes will be included next.",
                    self.inner.options.busy_notice,
                ),
                SkipReason::ImportBlocked => {
                    notifier.info("Sync is paused while an import is in progress.")
                }
                _ => {}
            }
        }
        // Skips while a session is in flight stay off the status stream so
        // they cannot end that session's progress surface.
        if announce {
            self.publish(SyncStatusEvent::Skipped {
                message: reason.to_string(),
            });
        }
        Dispatch::Skipped(reason)
    }
}

fn session_title(trigger: SyncTrigger) -> &'static str {
    match trigger {
        SyncTrigger::Manual => "Syncing project",
        SyncTrigger::Scheduled => "Auto-syncing project",
        SyncTrigger::ExternalCooperative => "Synchronizing",
    }
}
