//! Quill daemon: one sync engine per workspace, driven by a filesystem
//! watcher and a local socket, reconciling through the git CLI.

pub mod collaborators;
mod error;
pub mod git;
pub mod lockfile;
pub mod log_rotation;
pub mod paths;
pub mod protocol;
mod runtime;

pub use collaborators::{bind, Bound, EnvTokenAuth, LogProgressReporter, TracingNotifier};
pub use error::DaemonError;
pub use git::{GitTransport, GitVersionGate, GitWorkingCopy};
pub use lockfile::{FileLockService, HeldLock, LockRecord};
pub use protocol::{
    push_external, request_import, request_schedule, request_status, request_stop, request_sync,
    send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{run, start_blocking};
