//! # quill-sync
//!
//! Synchronization coordination engine.
//!
//! Decides when and whether a reconciliation of the local working copy may
//! run, given four independent trigger sources: the debounce timer
//! ([`SyncEngine::schedule_sync`]), explicit requests
//! ([`SyncEngine::execute_sync`]), a cooperating external synchronizer
//! ([`SyncEngine::attach_external`]), and edits queued while a session is
//! already in flight.
//!
//! Guarantees at most one session per process, never drops queued edits,
//! and defers to the cross-process lock reported by [`LockService`].

pub mod broadcast;
pub mod contracts;
pub mod progress;
pub mod queue;

mod bridge;
mod coordinator;
mod engine;
mod executor;
mod notice;
mod preflight;
mod scheduler;

pub use bridge::BridgeHandle;
pub use broadcast::{ListenerGuard, StatusBroadcaster};
pub use contracts::{
    AuthProvider, AuthStatus, Capabilities, Collaborators, IndexRebuilder, IndexStatus,
    LockService, MediaStrategy, MigrationHook, Notifier, ProgressReporter, RepairHook, StageSink,
    Transport, UsageReporter, VersionCheck, VersionGate, ViewerRefresh, WorkingCopyState,
};
pub use coordinator::{Dispatch, SkipReason};
pub use engine::{EngineOptions, EngineStatus, SyncEngine};
pub use executor::stages;
pub use progress::{ProgressProjector, ProgressUpdate};
pub use queue::PendingChangeQueue;
pub use scheduler::Scheduled;
