//! `quill daemon`: background engine lifecycle.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use quill_daemon::paths::{logs_dir, stderr_log_path, stdout_log_path};
use quill_daemon::{request_status, request_stop, start_blocking, DaemonError};

use super::home;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground, or in the background with --detach.
    Start(DaemonStartArgs),
    /// Ask a running daemon to shut down.
    Stop,
    /// Print the daemon's status as JSON.
    Status,
    /// Show the tail of the daemon log files.
    Logs(DaemonLogsArgs),
}

#[derive(Args, Debug)]
pub struct DaemonStartArgs {
    /// Run in the background, logging to ~/.quill/logs.
    #[arg(long)]
    pub detach: bool,
}

#[derive(Args, Debug)]
pub struct DaemonLogsArgs {
    /// Lines to show from the end of each file.
    #[arg(long, default_value_t = 100)]
    pub lines: usize,

    /// Skip the stdout log.
    #[arg(long)]
    pub stderr_only: bool,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = home()?;

    match command {
        DaemonCommand::Start(args) if args.detach => detach(&home),
        DaemonCommand::Start(_) => start_blocking(&home).context("daemon exited with error"),
        DaemonCommand::Stop => {
            match request_stop(&home) {
                Ok(()) => println!("daemon stop requested"),
                Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
                Err(err) => return Err(err).context("failed to stop daemon"),
            }
            Ok(())
        }
        DaemonCommand::Status => {
            let status = match request_status(&home) {
                Ok(status) => status,
                Err(DaemonError::DaemonNotRunning { socket }) => serde_json::json!({
                    "running": false,
                    "socket": socket.display().to_string(),
                }),
                Err(err) => return Err(err).context("failed to query daemon status"),
            };
            let rendered =
                serde_json::to_string_pretty(&status).context("failed to render daemon status")?;
            println!("{rendered}");
            Ok(())
        }
        DaemonCommand::Logs(args) => {
            let mut files = vec![stderr_log_path(&home)];
            if !args.stderr_only {
                files.insert(0, stdout_log_path(&home));
            }
            for path in files {
                print_tail(&path, args.lines)?;
            }
            Ok(())
        }
    }
}

/// Re-launch this binary as a foreground daemon with output going to the log
/// files, then wait for its socket.
fn detach(home: &Path) -> Result<()> {
    if request_status(home).is_ok() {
        println!("daemon is already running");
        return Ok(());
    }

    let logs = logs_dir(home);
    fs::create_dir_all(&logs).with_context(|| format!("create {}", logs.display()))?;
    let stdout = append(&stdout_log_path(home))?;
    let stderr = append(&stderr_log_path(home))?;

    let binary = std::env::current_exe().context("could not locate the quill binary")?;
    let child = Command::new(binary)
        .args(["daemon", "start"])
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .spawn()
        .context("failed to spawn daemon")?;

    match request_status(home) {
        Ok(_) => println!("daemon started (pid {})", child.id()),
        Err(_) => println!(
            "daemon spawned (pid {}); see `quill daemon logs` if it does not come up",
            child.id()
        ),
    }
    Ok(())
}

fn append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))
}

fn print_tail(path: &Path, lines: usize) -> Result<()> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            println!("log file not found: {}", path.display());
            return Ok(());
        }
        Err(err) => return Err(err).with_context(|| format!("open {}", path.display())),
    };

    let mut tail = VecDeque::with_capacity(lines);
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        tail.push_back(line);
        while tail.len() > lines {
            tail.pop_front();
        }
    }

    println!("==> {} <==", path.display());
    tail.iter().for_each(|line| println!("{line}"));
    Ok(())
}
