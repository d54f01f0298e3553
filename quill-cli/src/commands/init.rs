//! `quill init <path> [--auto-sync on|off] [--delay-minutes N]`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};

use quill_core::config::{config_path_at, save_at, set_workspace_at};
use quill_core::MIN_SYNC_DELAY_MINUTES;

use super::home;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

/// Set the working copy the daemon keeps in sync.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Path to the project's git working copy.
    pub path: PathBuf,

    /// Turn debounced auto-sync on or off.
    #[arg(long, value_enum)]
    pub auto_sync: Option<Toggle>,

    /// Minutes to wait after an edit before syncing (at least 5).
    #[arg(long)]
    pub delay_minutes: Option<u64>,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let path = self
            .path
            .canonicalize()
            .with_context(|| format!("cannot resolve path '{}'", self.path.display()))?;

        let mut config = set_workspace_at(&home, path.clone())
            .with_context(|| format!("failed to record workspace '{}'", path.display()))?;

        let mut changed = false;
        if let Some(toggle) = self.auto_sync {
            config.auto_sync_enabled = toggle == Toggle::On;
            changed = true;
        }
        if let Some(minutes) = self.delay_minutes {
            if minutes < MIN_SYNC_DELAY_MINUTES {
                println!(
                    "note: sync delay below {MIN_SYNC_DELAY_MINUTES} minutes is raised to {MIN_SYNC_DELAY_MINUTES}"
                );
            }
            config.sync_delay_minutes = minutes;
            changed = true;
        }
        if changed {
            save_at(&home, &config).context("failed to save config")?;
        }

        println!("✓ Syncing workspace '{}'", path.display());
        println!(
            "  auto-sync {} | delay {} min",
            if config.auto_sync_enabled { "on" } else { "off" },
            config.effective_sync_delay().as_secs() / 60
        );
        println!("  Saved to: {}", config_path_at(&home).display());
        println!("  A running daemon applies these settings; restart it to switch workspaces.");
        Ok(())
    }
}
