//! Quill core library: domain types, error taxonomy, configuration.
//!
//! - [`types`]: sessions, lock views, status events, transport results
//! - [`error`]: [`SyncError`]
//! - [`config`]: [`QuillConfig`] load / save

pub mod config;
pub mod error;
pub mod types;

pub use config::{QuillConfig, MIN_SYNC_DELAY_MINUTES};
pub use error::SyncError;
pub use types::{
    ExternalSyncEvent, LockStatus, PendingChange, SyncResult, SyncSession, SyncStatusEvent,
    SyncTrigger,
};
