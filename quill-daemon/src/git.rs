//! Git CLI collaborators: the reconciliation transport, the working-copy
//! check, and the git version gate.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use semver::Version;
use tokio::process::Command;

use quill_core::error::io_err;
use quill_core::{SyncError, SyncResult};
use quill_sync::{StageSink, Transport, VersionCheck, VersionGate, WorkingCopyState};

use crate::lockfile::FileLockService;

const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug)]
struct GitOutput {
    stdout: String,
    stderr: String,
}

async fn git(workspace: &Path, args: &[&str]) -> Result<GitOutput, SyncError> {
    tracing::trace!(args = ?args, "git");
    let output = Command::new("git")
        .arg("-C")
        .arg(workspace)
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| io_err(workspace, e))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if output.status.success() {
        Ok(GitOutput { stdout, stderr })
    } else {
        Err(SyncError::classify(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )))
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Commit, fetch, merge upstream, push. Holds the workspace sync lock
/// throughout.
#[derive(Debug, Clone)]
pub struct GitTransport {
    workspace: PathBuf,
    locks: Arc<FileLockService>,
    remote: String,
}

impl GitTransport {
    pub fn new(workspace: impl Into<PathBuf>, locks: Arc<FileLockService>) -> Self {
        Self {
            workspace: workspace.into(),
            locks,
            remote: "origin".to_string(),
        }
    }

    async fn head(&self) -> Option<String> {
        git(&self.workspace, &["rev-parse", "--verify", "HEAD"])
            .await
            .ok()
            .map(|out| out.stdout.trim().to_string())
    }

    async fn has_upstream(&self) -> bool {
        git(
            &self.workspace,
            &["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"],
        )
        .await
        .is_ok()
    }

    async fn has_remote(&self) -> bool {
        match git(&self.workspace, &["remote"]).await {
            Ok(out) => out.stdout.lines().any(|line| line.trim() == self.remote),
            Err(_) => false,
        }
    }

    async fn commit_local(&self, message: &str) -> Result<bool, SyncError> {
        git(&self.workspace, &["add", "-A"]).await?;
        let staged = git(&self.workspace, &["diff", "--cached", "--name-only"]).await?;
        if staged.stdout.trim().is_empty() {
            return Ok(false);
        }
        git(&self.workspace, &["commit", "--no-verify", "-m", message]).await?;
        Ok(true)
    }

    async fn merge_upstream(&self) -> Result<(), SyncError> {
        if let Err(err) = git(&self.workspace, &["merge", "--no-edit", "@{u}"]).await {
            if let Err(abort) = git(&self.workspace, &["merge", "--abort"]).await {
                tracing::warn!(error = %abort, "merge abort failed");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn changes_since(&self, before: &str) -> Result<SyncResult, SyncError> {
        let range = format!("{before}..HEAD");
        let diff = git(&self.workspace, &["diff", "--name-status", &range]).await?;
        Ok(parse_name_status(&diff.stdout))
    }
}

#[async_trait]
impl Transport for GitTransport {
    async fn sync(&self, message: &str, stages: &StageSink) -> Result<SyncResult, SyncError> {
        let mut lock = self.locks.acquire("commit").await?;

        let committed = self.commit_local(message).await?;
        tracing::debug!(committed, "local changes committed");

        if !self.has_remote().await {
            tracing::info!(remote = %self.remote, "no remote configured; nothing to reconcile");
            return Ok(SyncResult::default());
        }

        lock.set_phase("fetch")?;
        stages.stage("Fetching remote changes");
        let fetched = match git(&self.workspace, &["fetch", "--progress", &self.remote]).await {
            Ok(out) => out,
            Err(err) if err.is_connectivity() => {
                tracing::info!(error = %err, "remote unreachable");
                return Ok(SyncResult::offline());
            }
            Err(err) => return Err(err),
        };
        if let Some((loaded, total)) = last_counter(&fetched.stderr, "Receiving objects") {
            stages.progress("fetch", loaded, total);
        }

        let mut result = SyncResult::default();
        let push_args = if self.has_upstream().await {
            lock.set_phase("merge")?;
            stages.stage("Merging changes");
            let before = self.head().await;
            self.merge_upstream().await?;
            if let Some(before) = before {
                result = self.changes_since(&before).await?;
            }
            vec!["push"]
        } else {
            vec!["push", "-u", self.remote.as_str(), "HEAD"]
        };

        lock.set_phase("push")?;
        stages.stage("Uploading changes");
        let pushed = git(&self.workspace, &push_args).await?;
        if let Some((loaded, total)) = last_counter(&pushed.stderr, "Writing objects") {
            stages.progress("push", loaded, total);
        }

        Ok(result)
    }
}

/// Parse `git diff --name-status` output. Renames count as a deletion of the
/// old path plus a new file.
fn parse_name_status(output: &str) -> SyncResult {
    let mut result = SyncResult::default();
    for line in output.lines() {
        let mut fields = line.split('\t');
        let (Some(status), Some(first)) = (fields.next(), fields.next()) else {
            continue;
        };
        let second = fields.next();
        match status.chars().next() {
            Some('A') | Some('C') => result.new_files.push(PathBuf::from(second.unwrap_or(first))),
            Some('D') => result.deleted_files.push(PathBuf::from(first)),
            Some('R') => {
                result.deleted_files.push(PathBuf::from(first));
                if let Some(renamed) = second {
                    result.new_files.push(PathBuf::from(renamed));
                }
            }
            Some(_) => result.changed_files.push(PathBuf::from(first)),
            None => {}
        }
    }
    result
}

/// Last `(n/m)` counter git printed for `label` in its progress output.
fn last_counter(stderr: &str, label: &str) -> Option<(u64, u64)> {
    stderr
        .split(['\r', '\n'])
        .filter(|line| line.contains(label))
        .filter_map(|line| {
            let open = line.find('(')?;
            let close = open + line[open..].find(')')?;
            let (loaded, total) = line[open + 1..close].split_once('/')?;
            Some((loaded.trim().parse().ok()?, total.trim().parse().ok()?))
        })
        .last()
}

// ---------------------------------------------------------------------------
// Working copy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct GitWorkingCopy;

#[async_trait]
impl WorkingCopyState for GitWorkingCopy {
    async fn is_dirty(&self, path: &Path) -> Result<bool, SyncError> {
        let status = git(path, &["status", "--porcelain"]).await?;
        Ok(!status.stdout.trim().is_empty())
    }
}

// ---------------------------------------------------------------------------
// Versions
// ---------------------------------------------------------------------------

/// Hard gate on the installed git, soft gate on this host's version.
#[derive(Debug, Clone)]
pub struct GitVersionGate {
    required_git: String,
    min_host: String,
}

impl GitVersionGate {
    pub fn new(required_git: impl Into<String>, min_host: impl Into<String>) -> Self {
        Self {
            required_git: required_git.into(),
            min_host: min_host.into(),
        }
    }
}

#[async_trait]
impl VersionGate for GitVersionGate {
    async fn check_required_service_version(&self) -> Result<VersionCheck, SyncError> {
        let required = parse_required(&self.required_git)?;
        let output = Command::new("git")
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await;
        let installed = match output {
            Ok(output) if output.status.success() => {
                parse_git_version(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(error = %err, "git is not installed");
                None
            }
        };
        Ok(VersionCheck {
            ok: installed.as_ref().is_some_and(|v| *v >= required),
            installed: installed.map(|v| v.to_string()),
            required: self.required_git.clone(),
        })
    }

    async fn check_host_version(&self) -> Result<VersionCheck, SyncError> {
        let required = parse_required(&self.min_host)?;
        let installed = Version::parse(HOST_VERSION)
            .map_err(|err| SyncError::precondition(format!("invalid host version: {err}")))?;
        Ok(VersionCheck {
            ok: installed >= required,
            installed: Some(installed.to_string()),
            required: self.min_host.clone(),
        })
    }
}

fn parse_required(raw: &str) -> Result<Version, SyncError> {
    lenient_version(raw)
        .ok_or_else(|| SyncError::precondition(format!("invalid version requirement '{raw}'")))
}

/// `git version 2.39.2 (Apple Git-143)` → 2.39.2; `2.45.1.windows.1` → 2.45.1.
fn parse_git_version(output: &str) -> Option<Version> {
    let raw = output.trim().strip_prefix("git version ")?;
    lenient_version(raw.split_whitespace().next()?)
}

fn lenient_version(raw: &str) -> Option<Version> {
    let mut parts = raw
        .split('.')
        .map(|part| part.parse::<u64>().ok())
        .take_while(Option::is_some)
        .flatten();
    let major = parts.next()?;
    Some(Version::new(
        major,
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    ))
}
