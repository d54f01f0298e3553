//! `quill external ...`: status events from a synchronizer running outside
//! the daemon.

use anyhow::Result;
use clap::Subcommand;

use quill_core::ExternalSyncEvent;
use quill_daemon::push_external;

use super::home;
use super::sync::not_running_hint;

#[derive(Subcommand, Debug)]
pub enum ExternalCommand {
    /// An external sync began.
    Started {
        /// Initial stage text.
        #[arg(default_value = "")]
        message: String,
    },
    /// An external sync reached a new stage.
    Progress {
        /// Stage name, e.g. "fetch" or "push".
        phase: String,
        #[arg(long)]
        loaded: Option<u64>,
        #[arg(long)]
        total: Option<u64>,
        #[arg(long)]
        description: Option<String>,
    },
    /// The external sync finished.
    Completed,
    /// The external sync failed.
    Error { message: String },
    /// The external sync did nothing.
    Skipped {
        #[arg(default_value = "")]
        message: String,
    },
}

impl From<ExternalCommand> for ExternalSyncEvent {
    fn from(command: ExternalCommand) -> Self {
        match command {
            ExternalCommand::Started { message } => ExternalSyncEvent::Started { message },
            ExternalCommand::Progress {
                phase,
                loaded,
                total,
                description,
            } => ExternalSyncEvent::Progress {
                phase,
                loaded,
                total,
                description,
            },
            ExternalCommand::Completed => ExternalSyncEvent::Completed,
            ExternalCommand::Error { message } => ExternalSyncEvent::Error { message },
            ExternalCommand::Skipped { message } => ExternalSyncEvent::Skipped { message },
        }
    }
}

pub fn run(command: ExternalCommand) -> Result<()> {
    let home = home()?;
    push_external(&home, command.into()).map_err(not_running_hint)?;
    Ok(())
}
