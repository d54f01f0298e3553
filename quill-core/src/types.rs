//! Domain types for the quill sync engine.
//!
//! Status events and external events are serializable so the daemon can carry
//! them over its JSON socket protocol unchanged.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// What started a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncTrigger {
    /// The debounce timer fired.
    Scheduled,
    /// A user explicitly asked for a sync.
    Manual,
    /// A cooperating external synchronizer started a reconciliation this
    /// process did not initiate.
    ExternalCooperative,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncTrigger::Scheduled => write!(f, "scheduled"),
            SyncTrigger::Manual => write!(f, "manual"),
            SyncTrigger::ExternalCooperative => write!(f, "external"),
        }
    }
}

/// The single in-flight sync session of this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSession {
    pub trigger: SyncTrigger,
    pub commit_message: String,
    pub stage: String,
    pub started_at: DateTime<Utc>,
}

impl SyncSession {
    pub fn new(trigger: SyncTrigger, commit_message: impl Into<String>) -> Self {
        Self {
            trigger,
            commit_message: commit_message.into(),
            stage: String::new(),
            started_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cross-process lock view
// ---------------------------------------------------------------------------

/// Read-only view of the cross-process sync lock. Owned elsewhere; only observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStatus {
    pub exists: bool,
    pub is_dead: bool,
    pub is_stuck: bool,
    pub age_ms: u64,
    pub owner_pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl LockStatus {
    /// No lock present.
    pub fn absent() -> Self {
        Self::default()
    }

    /// A live lock owned by another process: present, neither dead nor stuck.
    pub fn is_held(&self) -> bool {
        self.exists && !self.is_dead && !self.is_stuck
    }

    /// Human-readable age, e.g. `"2 minute(s) ago"`.
    pub fn age_description(&self) -> String {
        let secs = self.age_ms / 1000;
        if secs < 60 {
            format!("{secs} second(s) ago")
        } else if secs < 60 * 60 {
            format!("{} minute(s) ago", secs / 60)
        } else {
            format!("{} hour(s) ago", secs / (60 * 60))
        }
    }
}

// ---------------------------------------------------------------------------
// Pending changes
// ---------------------------------------------------------------------------

/// A change description that arrived while a sync was in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    pub message: String,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingChange {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            enqueued_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Status events
// ---------------------------------------------------------------------------

/// Lifecycle event published to every status listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SyncStatusEvent {
    Started,
    Progress {
        phase: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        loaded: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Completed,
    Failed {
        message: String,
    },
    Skipped {
        message: String,
    },
}

impl SyncStatusEvent {
    /// A progress event carrying only stage text.
    pub fn stage(text: impl Into<String>) -> Self {
        SyncStatusEvent::Progress {
            phase: text.into(),
            loaded: None,
            total: None,
            description: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncStatusEvent::Completed
                | SyncStatusEvent::Failed { .. }
                | SyncStatusEvent::Skipped { .. }
        )
    }

    /// The stage text a progress surface should display for this event.
    pub fn stage_text(&self) -> Option<String> {
        match self {
            SyncStatusEvent::Progress {
                phase,
                loaded,
                total,
                description,
            } => Some(format_stage(phase, *loaded, *total, description.as_deref())),
            _ => None,
        }
    }
}

/// Render a structured progress report as stage text.
///
/// Known phases map to fixed wording; counters are appended as `loaded/total`
/// so the progress projection can interpolate them.
pub fn format_stage(
    phase: &str,
    loaded: Option<u64>,
    total: Option<u64>,
    description: Option<&str>,
) -> String {
    let base = match phase.to_ascii_lowercase().as_str() {
        "commit" => "Committing local changes".to_string(),
        "fetch" => "Receiving objects".to_string(),
        "merge" => "Merging changes".to_string(),
        "push" => "Uploading changes".to_string(),
        _ => description.unwrap_or(phase).to_string(),
    };
    match (loaded, total) {
        (Some(loaded), Some(total)) if total > 0 => format!("{base}: {loaded}/{total}"),
        _ => base,
    }
}

/// Status pushed by a cooperating external synchronizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ExternalSyncEvent {
    Started {
        #[serde(default)]
        message: String,
    },
    Progress {
        phase: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        loaded: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Completed,
    Error {
        message: String,
    },
    Skipped {
        #[serde(default)]
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Transport result
// ---------------------------------------------------------------------------

/// What one reconciliation changed in the working copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub changed_files: Vec<PathBuf>,
    pub new_files: Vec<PathBuf>,
    pub deleted_files: Vec<PathBuf>,
    pub offline: bool,
}

impl SyncResult {
    pub fn offline() -> Self {
        Self {
            offline: true,
            ..Self::default()
        }
    }

    /// Files that still exist after the merge (changed or added).
    pub fn touched(&self) -> Vec<PathBuf> {
        self.changed_files
            .iter()
            .chain(self.new_files.iter())
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.changed_files.is_empty() && self.new_files.is_empty() && self.deleted_files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_age_reads_in_minutes() {
        let lock = LockStatus {
            exists: true,
            age_ms: 120_000,
            ..LockStatus::default()
        };
        assert_eq!(lock.age_description(), "2 minute(s) ago");
        assert!(lock.is_held());
    }

    #[test]
    fn dead_or_stuck_lock_is_not_held() {
        let dead = LockStatus {
            exists: true,
            is_dead: true,
            ..LockStatus::default()
        };
        let stuck = LockStatus {
            exists: true,
            is_stuck: true,
            ..LockStatus::default()
        };
        assert!(!dead.is_held());
        assert!(!stuck.is_held());
        assert!(!LockStatus::absent().is_held());
    }

    #[test]
    fn known_phases_render_with_counters() {
        assert_eq!(
            format_stage("fetch", Some(1200), Some(4000), None),
            "Receiving objects: 1200/4000"
        );
        assert_eq!(format_stage("push", None, None, None), "Uploading changes");
        assert_eq!(
            format_stage("indexing", None, None, Some("Rebuilding index")),
            "Rebuilding index"
        );
    }

    #[test]
    fn status_event_json_is_tagged() {
        let json = serde_json::to_value(SyncStatusEvent::Failed {
            message: "boom".to_string(),
        })
        .expect("encode");
        assert_eq!(json["kind"], "failed");
        assert_eq!(json["message"], "boom");

        let decoded: ExternalSyncEvent =
            serde_json::from_str(r#"{"kind":"progress","phase":"fetch","loaded":3,"total":9}"#)
                .expect("decode");
        assert!(matches!(
            decoded,
            ExternalSyncEvent::Progress {
                loaded: Some(3),
                total: Some(9),
                ..
            }
        ));
    }

    #[test]
    fn touched_excludes_deleted() {
        let result = SyncResult {
            changed_files: vec![PathBuf::from("a.codex")],
            new_files: vec![PathBuf::from("b.codex")],
            deleted_files: vec![PathBuf::from("c.codex")],
            offline: false,
        };
        assert_eq!(
            result.touched(),
            vec![PathBuf::from("a.codex"), PathBuf::from("b.codex")]
        );
        assert!(!result.is_empty());
        assert!(SyncResult::offline().is_empty());
    }
}
