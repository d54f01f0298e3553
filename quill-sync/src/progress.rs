//! Progress projection.
//!
//! Maps free-text stage strings to a percentage that never goes backwards
//! within a session. Static stages sit on fixed anchors; stages carrying a
//! live `current/total` counter interpolate inside a fixed band.
//!
//! [`ProgressSurfaces`] drives a [`ProgressReporter`] from the status stream.
//! Only one surface is open at a time: a new projection waits until the
//! previous one has finished closing.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot, Mutex as AsyncMutex};

use quill_core::SyncStatusEvent;

use crate::contracts::ProgressReporter;

/// Stages that sit on a fixed percentage. Matched case-insensitively as
/// substrings, first match wins.
const STATIC_ANCHORS: &[(&str, u8)] = &[
    ("synchronization complete", 100),
    ("skipped (offline)", 100),
    ("starting sync", 2),
    ("preparing workspace", 5),
    ("committing local changes", 10),
    ("fetching remote changes", 20),
    ("merging changes", 65),
    ("uploading changes", 75),
    ("applying remote changes", 88),
    ("updating index", 90),
];

/// Stages that carry a `current/total` counter, with the band they fill.
const COUNTER_BANDS: &[(&str, u8, u8)] = &[
    ("counting objects", 10, 15),
    ("compressing objects", 15, 20),
    ("receiving objects", 20, 55),
    ("resolving deltas", 55, 65),
    ("writing objects", 75, 87),
    ("indexing files", 90, 98),
];

fn counter_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\d+)\s*/\s*(\d+)").unwrap_or_else(|err| {
            unreachable!("counter pattern is a valid literal regex: {err}")
        })
    })
}

/// Percentage for `stage`, or `None` when the stage is not recognized.
pub fn project(stage: &str) -> Option<u8> {
    let lower = stage.to_ascii_lowercase();

    for (needle, start, end) in COUNTER_BANDS {
        if !lower.contains(needle) {
            continue;
        }
        let Some((current, total)) = parse_counter(&lower) else {
            return Some(*start);
        };
        let span = f64::from(end - start);
        let fraction = current.min(total) as f64 / total as f64;
        return Some(start + (span * fraction).floor() as u8);
    }

    STATIC_ANCHORS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, percent)| *percent)
}

fn parse_counter(text: &str) -> Option<(u64, u64)> {
    let captures = counter_pattern().captures(text)?;
    let current = captures.get(1)?.as_str().parse().ok()?;
    let total: u64 = captures.get(2)?.as_str().parse().ok()?;
    (total > 0).then_some((current, total))
}

/// One update for a progress surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    pub message: String,
    /// Total reported so far, 0–100.
    pub percent: u8,
    /// Amount added by this update; 0 for a text-only update.
    pub increment: u8,
}

/// Monotonic projection state for one session.
#[derive(Debug, Default, Clone)]
pub struct ProgressProjector {
    reported: u8,
}

impl ProgressProjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn percent(&self) -> u8 {
        self.reported
    }

    /// Project `stage`. A value at or below what was already reported yields a
    /// text-only update with zero increment.
    pub fn observe(&mut self, stage: &str) -> ProgressUpdate {
        let increment = match project(stage) {
            Some(target) if target > self.reported => {
                let increment = target - self.reported;
                self.reported = target;
                increment
            }
            _ => 0,
        };
        ProgressUpdate {
            message: stage.to_string(),
            percent: self.reported,
            increment,
        }
    }

    /// Fill to 100%.
    pub fn complete(&mut self, message: &str) -> ProgressUpdate {
        let increment = 100u8.saturating_sub(self.reported);
        self.reported = 100;
        ProgressUpdate {
            message: message.to_string(),
            percent: 100,
            increment,
        }
    }
}

// ---------------------------------------------------------------------------
// Surfaces
// ---------------------------------------------------------------------------

pub(crate) struct ProgressSurfaces {
    reporter: Option<Arc<dyn ProgressReporter>>,
    surface: Arc<AsyncMutex<()>>,
    percent: Arc<AtomicU8>,
    external_active: Arc<AtomicBool>,
    external_cancel: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

impl ProgressSurfaces {
    pub(crate) fn new(reporter: Option<Arc<dyn ProgressReporter>>) -> Self {
        Self {
            reporter,
            surface: Arc::new(AsyncMutex::new(())),
            percent: Arc::new(AtomicU8::new(0)),
            external_active: Arc::new(AtomicBool::new(false)),
            external_cancel: std::sync::Mutex::new(None),
        }
    }

    /// Last percentage reported by any projection.
    pub(crate) fn percent(&self) -> u8 {
        self.percent.load(Ordering::Relaxed)
    }

    /// Project a session started by this engine. `events` must be subscribed
    /// before the session's `Started` event is published.
    pub(crate) fn start(&self, title: &str, events: broadcast::Receiver<SyncStatusEvent>) {
        tokio::spawn(project_session(
            title.to_string(),
            events,
            self.reporter.clone(),
            Arc::clone(&self.surface),
            Arc::clone(&self.percent),
            None,
        ));
    }

    /// Project a session driven by the external synchronizer. Only one such
    /// projection runs at a time; a second start while one is active is ignored.
    pub(crate) fn start_external(&self, title: &str, events: broadcast::Receiver<SyncStatusEvent>) {
        if self
            .external_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("external progress projection already active");
            return;
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        *self
            .external_cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(cancel_tx);

        let active = Arc::clone(&self.external_active);
        let projection = project_session(
            title.to_string(),
            events,
            self.reporter.clone(),
            Arc::clone(&self.surface),
            Arc::clone(&self.percent),
            Some(cancel_rx),
        );
        tokio::spawn(async move {
            projection.await;
            active.store(false, Ordering::Release);
        });
    }

    /// Resolve the external projection, if one is pending.
    pub(crate) fn finish_external(&self) {
        let cancel = self
            .external_cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(cancel) = cancel {
            let _ = cancel.send(());
        }
    }
}

async fn project_session(
    title: String,
    mut events: broadcast::Receiver<SyncStatusEvent>,
    reporter: Option<Arc<dyn ProgressReporter>>,
    surface: Arc<AsyncMutex<()>>,
    percent: Arc<AtomicU8>,
    cancel: Option<oneshot::Receiver<()>>,
) {
    let _surface = surface.lock_owned().await;
    // Only the projection holding the surface writes the shared percentage.
    percent.store(0, Ordering::Relaxed);
    if let Some(reporter) = &reporter {
        reporter.begin(&title);
    }

    let mut projector = ProgressProjector::new();
    let mut cancel = cancel;
    loop {
        let event = match cancel.as_mut() {
            Some(cancel_rx) => tokio::select! {
                biased;
                event = events.recv() => event,
                _ = cancel_rx => break,
            },
            None => events.recv().await,
        };

        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "progress projection lagged behind status stream");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let update = match &event {
            SyncStatusEvent::Started => continue,
            SyncStatusEvent::Completed => Some(projector.complete("Synchronization complete")),
            SyncStatusEvent::Failed { .. } | SyncStatusEvent::Skipped { .. } => None,
            SyncStatusEvent::Progress { .. } => event
                .stage_text()
                .map(|stage| projector.observe(&stage)),
        };

        if let Some(update) = update {
            percent.store(update.percent, Ordering::Relaxed);
            if let Some(reporter) = &reporter {
                reporter.report(&update);
            }
        }
        if event.is_terminal() {
            break;
        }
    }

    if let Some(reporter) = &reporter {
        reporter.finish();
    }
}
