//! `quill import begin|end`

use anyhow::Result;
use clap::Subcommand;

use quill_daemon::request_import;

use super::home;
use super::sync::not_running_hint;

#[derive(Subcommand, Debug)]
pub enum ImportCommand {
    /// Enter an import; automatic syncs wait until every import ends.
    Begin,
    /// Leave an import.
    End,
}

pub fn run(command: ImportCommand) -> Result<()> {
    let home = home()?;
    let begin = matches!(command, ImportCommand::Begin);
    let status = request_import(&home, begin).map_err(not_running_hint)?;
    let blocked = status
        .get("import_blocked")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if blocked {
        println!("automatic sync paused for import");
    } else {
        println!("automatic sync resumed");
    }
    Ok(())
}
