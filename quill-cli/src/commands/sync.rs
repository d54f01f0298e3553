//! `quill sync` and `quill schedule`.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::Value;

use quill_daemon::{request_schedule, request_sync, DaemonError};

use super::home;

/// Run a sync now and wait for it to finish.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Commit message for local changes.
    #[arg(long, short = 'm')]
    pub message: Option<String>,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let outcome = request_sync(&home, self.message).map_err(not_running_hint)?;
        match field(&outcome, "outcome") {
            "completed" => println!("{} sync complete", "✓".green()),
            "skipped" => println!(
                "{} sync skipped: {}",
                "•".yellow(),
                field(&outcome, "reason")
            ),
            other => println!("sync finished: {other}"),
        }
        Ok(())
    }
}

/// Ask for a sync after the configured delay.
#[derive(Args, Debug)]
pub struct ScheduleArgs {
    /// Commit message describing the change.
    pub message: String,
}

impl ScheduleArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let outcome = request_schedule(&home, self.message).map_err(not_running_hint)?;
        match field(&outcome, "outcome") {
            "armed" => {
                let secs = outcome
                    .get("delay_secs")
                    .and_then(Value::as_u64)
                    .unwrap_or_default();
                println!("sync scheduled in {} min", secs / 60);
            }
            "queued" => println!("sync in progress; change queued for the next one"),
            "ignored" => println!("not scheduled: {}", field(&outcome, "reason")),
            other => println!("schedule: {other}"),
        }
        Ok(())
    }
}

fn field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("unknown")
}

pub(crate) fn not_running_hint(err: DaemonError) -> anyhow::Error {
    match err {
        DaemonError::DaemonNotRunning { .. } => {
            anyhow::Error::new(err).context("start it with `quill daemon start --detach`")
        }
        other => anyhow::Error::new(other),
    }
}
