//! Quill: collaborative project sync CLI.
//!
//! # Usage
//!
//! ```text
//! quill init <path> [--auto-sync on|off] [--delay-minutes N]
//! quill sync [-m <message>]
//! quill schedule <message>
//! quill status [--json]
//! quill import begin|end
//! quill external started|progress|completed|error|skipped
//! quill daemon start [--detach]|stop|status|logs
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand,
    external::ExternalCommand,
    import::ImportCommand,
    init::InitArgs,
    status::StatusArgs,
    sync::{ScheduleArgs, SyncArgs},
};

#[derive(Parser, Debug)]
#[command(
    name = "quill",
    version,
    about = "Keep a translation project in sync with its remote",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Set the working copy the daemon keeps in sync.
    Init(InitArgs),

    /// Run a sync now and wait for it to finish.
    Sync(SyncArgs),

    /// Ask for a sync after the configured delay.
    Schedule(ScheduleArgs),

    /// Show the sync engine's current state.
    Status(StatusArgs),

    /// Hold off automatic syncs while a bulk import runs.
    Import {
        #[command(subcommand)]
        command: ImportCommand,
    },

    /// Report progress from an external synchronizer.
    External {
        #[command(subcommand)]
        command: ExternalCommand,
    },

    /// Manage the Quill background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Sync(args) => args.run(),
        Commands::Schedule(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Import { command } => commands::import::run(command),
        Commands::External { command } => commands::external::run(command),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
