//! `quill status`: engine state as reported by the daemon.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::Args;
use colored::Colorize;
use serde_json::{json, Value};
use tabled::{settings::Style, Table, Tabled};

use quill_core::config::load_at;
use quill_daemon::paths::socket_path;
use quill_daemon::{request_status, DaemonError};

use super::home;

/// Arguments for `quill status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let status = match request_status(&home) {
            Ok(status) => status,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                let config = load_at(&home).context("failed to load config")?;
                json!({
                    "running": false,
                    "socket": socket_path(&home).display().to_string(),
                    "workspace": config.workspace,
                    "auto_sync_enabled": config.auto_sync_enabled,
                    "sync_delay_secs": config.effective_sync_delay().as_secs(),
                })
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&status).context("failed to render status JSON")?
            );
            return Ok(());
        }

        print_report(&status);
        Ok(())
    }
}

#[derive(Tabled)]
struct NoticeRow {
    #[tabled(rename = "when")]
    when: String,
    #[tabled(rename = "level")]
    level: String,
    #[tabled(rename = "message")]
    message: String,
}

fn print_report(status: &Value) {
    let running = status["running"].as_bool().unwrap_or(false);
    let workspace = status
        .pointer("/engine/workspace")
        .or_else(|| status.get("workspace"))
        .and_then(Value::as_str)
        .unwrap_or("(none)");

    println!(
        "Quill v{} | daemon {} | workspace {}",
        env!("CARGO_PKG_VERSION"),
        if running {
            "running".green()
        } else {
            "stopped".red()
        },
        workspace
    );
    println!(
        "auto-sync {} | delay {} min",
        if status["auto_sync_enabled"].as_bool().unwrap_or(false) {
            "on"
        } else {
            "off"
        },
        status["sync_delay_secs"].as_u64().unwrap_or_default() / 60
    );

    let Some(engine) = status.get("engine") else {
        return;
    };
    println!("{}", "■".repeat(48).bright_black());
    println!("{}", engine_line(engine));
    if engine["import_blocked"].as_bool().unwrap_or(false) {
        println!("{} import in progress; automatic sync paused", "•".yellow());
    }
    let pending = engine["pending_changes"].as_u64().unwrap_or_default();
    if pending > 0 {
        println!("{pending} change(s) waiting for the next sync");
    }
    if engine["timer_armed"].as_bool().unwrap_or(false) {
        println!("a debounced sync is scheduled");
    }

    let rows: Vec<NoticeRow> = status["notices"]
        .as_array()
        .map(|notices| notices.iter().map(notice_row).collect())
        .unwrap_or_default();
    if !rows.is_empty() {
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
    }
}

fn engine_line(engine: &Value) -> String {
    if !engine["busy"].as_bool().unwrap_or(false) {
        return format!("{} idle", "●".green());
    }
    let stage = engine["stage"].as_str().unwrap_or("syncing");
    match engine["percent"].as_u64() {
        Some(percent) => format!("{} {stage} ({percent}%)", "●".yellow()),
        None => format!("{} {stage}", "●".yellow()),
    }
}

fn notice_row(notice: &Value) -> NoticeRow {
    let when = notice["at"]
        .as_str()
        .and_then(|at| at.parse::<DateTime<Utc>>().ok())
        .map(|at| at.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_default();
    NoticeRow {
        when,
        level: notice["level"].as_str().unwrap_or_default().to_string(),
        message: notice["message"].as_str().unwrap_or_default().to_string(),
    }
}
