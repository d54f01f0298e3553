use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Semaphore};

use quill_core::{
    ExternalSyncEvent, LockStatus, QuillConfig, SyncError, SyncResult, SyncStatusEvent,
    SyncTrigger,
};
use quill_sync::{
    stages, AuthProvider, AuthStatus, Collaborators, Dispatch, EngineOptions, IndexRebuilder,
    IndexStatus, LockService, Notifier, ProgressReporter, ProgressUpdate, RepairHook, Scheduled,
    SkipReason, StageSink, SyncEngine, Transport, VersionCheck, VersionGate, ViewerRefresh,
    WorkingCopyState,
};

const WORKSPACE: &str = "/projects/genesis";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Outcome {
    Clean,
    Changed(SyncResult),
    Offline,
    Unreachable,
    Broken,
    /// Another process grabbed the lock after the engine's own check.
    Contested,
}

struct FakeTransport {
    gate: Arc<Semaphore>,
    messages: Mutex<Vec<String>>,
    outcome: Mutex<Outcome>,
}

impl FakeTransport {
    fn open() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(1_000)),
            messages: Mutex::new(Vec::new()),
            outcome: Mutex::new(Outcome::Clean),
        }
    }

    /// Every call blocks until the test releases a permit.
    fn gated() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            ..Self::open()
        }
    }

    fn release(&self, calls: usize) {
        self.gate.add_permits(calls);
    }

    fn set_outcome(&self, outcome: Outcome) {
        *self.outcome.lock().unwrap() = outcome;
    }

    fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn sync(&self, message: &str, stages: &StageSink) -> Result<SyncResult, SyncError> {
        self.messages.lock().unwrap().push(message.to_string());
        stages.progress("fetch", 5, 10);
        let permit = self.gate.acquire().await.expect("gate open");
        permit.forget();
        stages.progress("push", 1, 1);

        let outcome = self.outcome.lock().unwrap().clone();
        match outcome {
            Outcome::Clean => Ok(SyncResult::default()),
            Outcome::Changed(result) => Ok(result),
            Outcome::Offline => Ok(SyncResult::offline()),
            Outcome::Unreachable => Err(SyncError::classify(
                "fatal: unable to access 'https://git.example/genesis.git/': Could not resolve host",
            )),
            Outcome::Broken => Err(SyncError::Transport("merge conflict in GEN.codex".into())),
            Outcome::Contested => Err(SyncError::LockContested { age_ms: 30_000 }),
        }
    }
}

struct FakeAuth {
    authenticated: AtomicBool,
}

#[async_trait]
impl AuthProvider for FakeAuth {
    fn available(&self) -> bool {
        true
    }

    async fn status(&self) -> Result<AuthStatus, SyncError> {
        Ok(AuthStatus {
            authenticated: self.authenticated.load(Ordering::SeqCst),
        })
    }
}

#[derive(Default)]
struct FakeLock {
    status: Mutex<LockStatus>,
}

#[async_trait]
impl LockService for FakeLock {
    async fn check_lock(&self) -> Result<LockStatus, SyncError> {
        Ok(self.status.lock().unwrap().clone())
    }

    async fn cleanup_stale_lock(&self) -> Result<bool, SyncError> {
        Ok(false)
    }
}

#[derive(Default)]
struct FakeWorkingCopy {
    dirty: AtomicBool,
    unreadable: AtomicBool,
    checks: AtomicUsize,
}

#[async_trait]
impl WorkingCopyState for FakeWorkingCopy {
    async fn is_dirty(&self, path: &Path) -> Result<bool, SyncError> {
        assert_eq!(path, Path::new(WORKSPACE));
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.unreadable.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("git status: index.lock exists".into()));
        }
        Ok(self.dirty.load(Ordering::SeqCst))
    }
}

struct FakeVersions {
    service_ok: AtomicBool,
    host_ok: AtomicBool,
}

#[async_trait]
impl VersionGate for FakeVersions {
    async fn check_required_service_version(&self) -> Result<VersionCheck, SyncError> {
        Ok(VersionCheck {
            ok: self.service_ok.load(Ordering::SeqCst),
            installed: Some("2.20.0".into()),
            required: "2.30.0".into(),
        })
    }

    async fn check_host_version(&self) -> Result<VersionCheck, SyncError> {
        Ok(VersionCheck {
            ok: self.host_ok.load(Ordering::SeqCst),
            installed: Some("0.0.9".into()),
            required: "0.1.0".into(),
        })
    }
}

#[derive(Default)]
struct RecordingNotifier {
    log: Mutex<Vec<(&'static str, String)>>,
}

impl RecordingNotifier {
    fn of_kind(&self, kind: &str) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn info(&self, message: &str) {
        self.log.lock().unwrap().push(("info", message.to_string()));
    }
    fn transient(&self, message: &str, _dismiss_after: Duration) {
        self.log
            .lock()
            .unwrap()
            .push(("transient", message.to_string()));
    }
    fn warn_modal(&self, message: &str) {
        self.log.lock().unwrap().push(("modal", message.to_string()));
    }
    fn error(&self, message: &str) {
        self.log.lock().unwrap().push(("error", message.to_string()));
    }
}

struct Fakes {
    transport: Arc<FakeTransport>,
    auth: Arc<FakeAuth>,
    lock: Arc<FakeLock>,
    working_copy: Arc<FakeWorkingCopy>,
    versions: Arc<FakeVersions>,
    notifier: Arc<RecordingNotifier>,
}

impl Fakes {
    fn new(transport: FakeTransport) -> Self {
        init_tracing();
        Self {
            transport: Arc::new(transport),
            auth: Arc::new(FakeAuth {
                authenticated: AtomicBool::new(true),
            }),
            lock: Arc::new(FakeLock::default()),
            working_copy: Arc::new(FakeWorkingCopy::default()),
            versions: Arc::new(FakeVersions {
                service_ok: AtomicBool::new(true),
                host_ok: AtomicBool::new(true),
            }),
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            self.transport.clone(),
            self.auth.clone(),
            self.lock.clone(),
            self.working_copy.clone(),
            self.versions.clone(),
            self.notifier.clone(),
        )
    }

    fn engine(&self) -> SyncEngine {
        self.engine_with(self.collaborators(), config())
    }

    fn engine_with(&self, collab: Collaborators, config: QuillConfig) -> SyncEngine {
        SyncEngine::new(config, collab, EngineOptions::default())
    }
}

fn config() -> QuillConfig {
    QuillConfig {
        workspace: Some(PathBuf::from(WORKSPACE)),
        ..QuillConfig::default()
    }
}

/// Events up to and including the next terminal one.
async fn session_events(rx: &mut broadcast::Receiver<SyncStatusEvent>) -> Vec<SyncStatusEvent> {
    let mut events = Vec::new();
    loop {
        let event = rx.recv().await.expect("status stream open");
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

fn stage_texts(events: &[SyncStatusEvent]) -> Vec<String> {
    events.iter().filter_map(|e| e.stage_text()).collect()
}

// ---------------------------------------------------------------------------
// Mutual exclusion
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn second_request_while_busy_is_queued_not_run() {
    let fakes = Fakes::new(FakeTransport::gated());
    let engine = fakes.engine();
    let mut rx = engine.subscribe();

    assert!(engine.execute_sync("first", true).await.is_started());
    assert!(engine.status().busy);

    match engine.execute_sync("second", true).await {
        Dispatch::Skipped(SkipReason::Busy) => {}
        other => panic!("expected busy skip, got {other:?}"),
    }
    assert_eq!(engine.pending_messages(), vec!["second".to_string()]);
    assert_eq!(fakes.notifier.of_kind("transient").len(), 1);

    fakes.transport.release(1);
    let events = session_events(&mut rx).await;
    assert_eq!(events.first(), Some(&SyncStatusEvent::Started));
    assert_eq!(events.last(), Some(&SyncStatusEvent::Completed));
    assert_eq!(fakes.transport.messages(), vec!["first".to_string()]);
    assert!(!engine.status().busy);
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_start_exactly_one_session() {
    let fakes = Fakes::new(FakeTransport::gated());
    let engine = fakes.engine();

    let (a, b) = tokio::join!(
        engine.execute_sync("a", true),
        engine.execute_sync("b", false)
    );
    let started = [&a, &b].iter().filter(|d| d.is_started()).count();
    assert_eq!(started, 1, "got {a:?} and {b:?}");

    fakes.transport.release(10);
}

#[tokio::test(start_paused = true)]
async fn session_publishes_stages_in_order() {
    let fakes = Fakes::new(FakeTransport::open());
    let engine = fakes.engine();
    let mut rx = engine.subscribe();

    assert!(engine.execute_sync("edited GEN.codex", true).await.is_started());
    let events = session_events(&mut rx).await;

    assert_eq!(
        stage_texts(&events),
        vec![
            stages::STARTING.to_string(),
            stages::PREPARING.to_string(),
            stages::COMMITTING.to_string(),
            "Receiving objects: 5/10".to_string(),
            "Uploading changes: 1/1".to_string(),
            stages::APPLYING.to_string(),
            stages::COMPLETE.to_string(),
        ]
    );
    assert_eq!(events.last(), Some(&SyncStatusEvent::Completed));
}

// ---------------------------------------------------------------------------
// No lost edits
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn edit_during_session_syncs_verbatim_afterwards() {
    let fakes = Fakes::new(FakeTransport::gated());
    fakes.working_copy.dirty.store(true, Ordering::SeqCst);
    let engine = fakes.engine();
    let mut rx = engine.subscribe();

    assert!(engine.execute_sync("manual sync", true).await.is_started());
    assert_eq!(engine.schedule_sync("edited GEN.codex"), Scheduled::Queued);

    fakes.transport.release(2);
    session_events(&mut rx).await;

    // Settle delay, then the drain re-arms the timer.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let status = engine.status();
    assert!(status.timer_armed);
    assert_eq!(status.pending_changes, 0);

    tokio::time::sleep(Duration::from_secs(5 * 60)).await;
    assert_eq!(
        fakes.transport.messages(),
        vec!["manual sync".to_string(), "edited GEN.codex".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn many_edits_during_session_coalesce_into_one_follow_up() {
    let fakes = Fakes::new(FakeTransport::gated());
    fakes.working_copy.dirty.store(true, Ordering::SeqCst);
    let engine = fakes.engine();
    let mut rx = engine.subscribe();

    assert!(engine.execute_sync("manual sync", true).await.is_started());
    for book in ["GEN", "EXO", "LEV"] {
        assert_eq!(
            engine.schedule_sync(format!("edited {book}.codex")),
            Scheduled::Queued
        );
    }

    fakes.transport.release(2);
    session_events(&mut rx).await;
    tokio::time::sleep(Duration::from_secs(5 * 60 + 2)).await;

    assert_eq!(
        fakes.transport.messages(),
        vec!["manual sync".to_string(), "changes to 3 files".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn queued_edits_are_discarded_when_working_copy_is_clean() {
    let fakes = Fakes::new(FakeTransport::gated());
    let engine = fakes.engine();
    let mut rx = engine.subscribe();

    // A: manual sync in flight. B: an edit lands and is queued.
    assert!(engine.execute_sync("A", true).await.is_started());
    assert_eq!(engine.schedule_sync("B"), Scheduled::Queued);

    // A's commit already included B's edit, so the tree is clean afterwards.
    fakes.transport.release(1);
    session_events(&mut rx).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let status = engine.status();
    assert_eq!(status.pending_changes, 0);
    assert!(!status.timer_armed);
    assert_eq!(fakes.working_copy.checks.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    assert_eq!(fakes.transport.messages(), vec!["A".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn unreadable_working_copy_still_schedules_follow_up() {
    let fakes = Fakes::new(FakeTransport::gated());
    fakes.working_copy.unreadable.store(true, Ordering::SeqCst);
    let engine = fakes.engine();
    let mut rx = engine.subscribe();

    assert!(engine.execute_sync("manual sync", true).await.is_started());
    assert_eq!(engine.schedule_sync("edited GEN.codex"), Scheduled::Queued);

    fakes.transport.release(2);
    session_events(&mut rx).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(fakes.working_copy.checks.load(Ordering::SeqCst), 1);
    let status = engine.status();
    assert!(status.timer_armed);
    assert_eq!(status.pending_changes, 0);

    tokio::time::sleep(Duration::from_secs(5 * 60)).await;
    assert_eq!(
        fakes.transport.messages(),
        vec!["manual sync".to_string(), "edited GEN.codex".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn changes_queued_while_auto_sync_is_off_survive_until_re_enabled() {
    let fakes = Fakes::new(FakeTransport::gated());
    fakes.working_copy.dirty.store(true, Ordering::SeqCst);
    let engine = fakes.engine_with(
        fakes.collaborators(),
        QuillConfig {
            auto_sync_enabled: false,
            ..config()
        },
    );
    let mut rx = engine.subscribe();

    assert!(engine.execute_sync("A", true).await.is_started());
    assert!(matches!(
        engine.execute_sync("B", true).await,
        Dispatch::Skipped(SkipReason::Busy)
    ));

    fakes.transport.release(2);
    session_events(&mut rx).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    // The follow-up cannot be armed, but B is kept rather than dropped.
    assert_eq!(engine.pending_messages(), vec!["B".to_string()]);
    assert!(!engine.status().timer_armed);
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    assert_eq!(fakes.transport.messages(), vec!["A".to_string()]);

    engine.update_config(config());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(engine.status().timer_armed);
    assert!(engine.pending_messages().is_empty());

    tokio::time::sleep(Duration::from_secs(5 * 60)).await;
    assert_eq!(
        fakes.transport.messages(),
        vec!["A".to_string(), "B".to_string()]
    );
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn configured_delay_below_floor_is_clamped() {
    let fakes = Fakes::new(FakeTransport::open());
    let engine = fakes.engine_with(
        fakes.collaborators(),
        QuillConfig {
            sync_delay_minutes: 1,
            ..config()
        },
    );

    assert_eq!(
        engine.schedule_sync("edited GEN.codex"),
        Scheduled::Armed(Duration::from_secs(5 * 60))
    );

    tokio::time::sleep(Duration::from_secs(5 * 60 - 1)).await;
    assert!(fakes.transport.messages().is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(fakes.transport.messages(), vec!["edited GEN.codex".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn rescheduling_replaces_the_previous_timer() {
    let fakes = Fakes::new(FakeTransport::open());
    let engine = fakes.engine();

    engine.schedule_sync("first");
    tokio::time::sleep(Duration::from_secs(60)).await;
    engine.schedule_sync("second");

    tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;
    assert_eq!(fakes.transport.messages(), vec!["second".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn changed_delay_re_arms_the_live_timer() {
    let fakes = Fakes::new(FakeTransport::open());
    let engine = fakes.engine();

    assert_eq!(
        engine.schedule_sync("edited GEN.codex"),
        Scheduled::Armed(Duration::from_secs(5 * 60))
    );
    engine.update_config(QuillConfig {
        sync_delay_minutes: 10,
        ..config()
    });
    assert!(engine.status().timer_armed);

    tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;
    assert!(fakes.transport.messages().is_empty());

    tokio::time::sleep(Duration::from_secs(5 * 60)).await;
    assert_eq!(fakes.transport.messages(), vec!["edited GEN.codex".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn unchanged_config_leaves_no_timer_behind() {
    let fakes = Fakes::new(FakeTransport::open());
    let engine = fakes.engine();

    engine.update_config(QuillConfig {
        sync_delay_minutes: 10,
        ..config()
    });
    assert!(!engine.status().timer_armed);

    tokio::time::sleep(Duration::from_secs(20 * 60)).await;
    assert!(fakes.transport.messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn disabling_auto_sync_clears_timer_and_ignores_schedules() {
    let fakes = Fakes::new(FakeTransport::open());
    let engine = fakes.engine();

    assert!(matches!(engine.schedule_sync("edit"), Scheduled::Armed(_)));
    engine.update_config(QuillConfig {
        auto_sync_enabled: false,
        ..config()
    });
    assert!(!engine.status().timer_armed);
    assert_eq!(
        engine.schedule_sync("edit"),
        Scheduled::Ignored(SkipReason::AutoSyncDisabled)
    );

    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    assert!(fakes.transport.messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn closing_workspace_clears_timer() {
    let fakes = Fakes::new(FakeTransport::open());
    let engine = fakes.engine();

    assert!(matches!(engine.schedule_sync("edit"), Scheduled::Armed(_)));
    engine.close_workspace();
    assert!(!engine.status().timer_armed);
    assert_eq!(
        engine.schedule_sync("edit"),
        Scheduled::Ignored(SkipReason::NoWorkspace)
    );

    match engine.execute_sync("auto", false).await {
        Dispatch::Skipped(SkipReason::NoWorkspace) => {}
        other => panic!("expected no-workspace skip, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    assert!(fakes.transport.messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn clear_pending_sync_cancels_timer() {
    let fakes = Fakes::new(FakeTransport::open());
    let engine = fakes.engine();

    engine.schedule_sync("edit");
    engine.clear_pending_sync();
    engine.clear_pending_sync();

    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    assert!(fakes.transport.messages().is_empty());
}

// ---------------------------------------------------------------------------
// Lock respect and preflight
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn live_foreign_lock_skips_and_queues() {
    let fakes = Fakes::new(FakeTransport::open());
    *fakes.lock.status.lock().unwrap() = LockStatus {
        exists: true,
        age_ms: 120_000,
        owner_pid: 4242,
        phase: Some("fetch".into()),
        ..LockStatus::default()
    };
    let engine = fakes.engine();

    match engine.execute_sync("edited GEN.codex", true).await {
        Dispatch::Skipped(SkipReason::LockContested { age_ms, phase }) => {
            assert_eq!(age_ms, 120_000);
            assert_eq!(phase.as_deref(), Some("fetch"));
        }
        other => panic!("expected lock contention, got {other:?}"),
    }

    assert!(!engine.status().busy);
    assert_eq!(engine.pending_messages(), vec!["edited GEN.codex".to_string()]);
    let infos = fakes.notifier.of_kind("info");
    assert_eq!(infos.len(), 1);
    assert!(infos[0].contains("2 minute(s) ago"), "got {infos:?}");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(fakes.transport.messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn queued_edit_retries_once_foreign_lock_clears() {
    let fakes = Fakes::new(FakeTransport::open());
    fakes.working_copy.dirty.store(true, Ordering::SeqCst);
    *fakes.lock.status.lock().unwrap() = LockStatus {
        exists: true,
        age_ms: 5_000,
        owner_pid: 4242,
        ..LockStatus::default()
    };
    let engine = fakes.engine();

    assert!(matches!(
        engine.execute_sync("edited GEN.codex", false).await,
        Dispatch::Skipped(SkipReason::LockContested { .. })
    ));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(engine.status().timer_armed);

    *fakes.lock.status.lock().unwrap() = LockStatus::default();
    tokio::time::sleep(Duration::from_secs(5 * 60)).await;
    assert_eq!(fakes.transport.messages(), vec!["edited GEN.codex".to_string()]);
    assert!(engine.pending_messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn lock_taken_during_transport_skips_and_requeues() {
    let fakes = Fakes::new(FakeTransport::open());
    fakes.transport.set_outcome(Outcome::Contested);
    fakes.working_copy.dirty.store(true, Ordering::SeqCst);
    let engine = fakes.engine();
    let mut rx = engine.subscribe();

    assert!(engine.execute_sync("edited GEN.codex", true).await.is_started());
    let events = session_events(&mut rx).await;
    match events.last() {
        Some(SyncStatusEvent::Skipped { message }) => {
            assert!(message.contains("another process is syncing"), "got {message}");
        }
        other => panic!("expected skipped session, got {other:?}"),
    }
    assert!(fakes.notifier.of_kind("error").is_empty());
    assert_eq!(engine.pending_messages(), vec!["edited GEN.codex".to_string()]);

    fakes.transport.set_outcome(Outcome::Clean);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(engine.status().timer_armed);

    tokio::time::sleep(Duration::from_secs(5 * 60)).await;
    assert_eq!(
        fakes.transport.messages(),
        vec!["edited GEN.codex".to_string(), "edited GEN.codex".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn stuck_lock_does_not_block() {
    let fakes = Fakes::new(FakeTransport::open());
    *fakes.lock.status.lock().unwrap() = LockStatus {
        exists: true,
        is_stuck: true,
        age_ms: 3_600_000,
        ..LockStatus::default()
    };
    let engine = fakes.engine();

    assert!(engine.execute_sync("edit", true).await.is_started());
}

#[tokio::test(start_paused = true)]
async fn outdated_service_raises_modal_and_never_reaches_transport() {
    let fakes = Fakes::new(FakeTransport::open());
    fakes.versions.service_ok.store(false, Ordering::SeqCst);
    let engine = fakes.engine();
    let mut rx = engine.subscribe();

    match engine.execute_sync("edit", true).await {
        Dispatch::Failed(SyncError::PreconditionUnmet { reason }) => {
            assert!(reason.contains("2.30.0"), "got {reason}");
        }
        other => panic!("expected precondition failure, got {other:?}"),
    }

    assert_eq!(fakes.notifier.of_kind("modal").len(), 1);
    assert!(matches!(
        rx.recv().await.expect("event"),
        SyncStatusEvent::Failed { .. }
    ));
    assert!(!engine.status().busy);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(fakes.transport.messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn signed_out_user_gets_notice_and_failure() {
    let fakes = Fakes::new(FakeTransport::open());
    fakes.auth.authenticated.store(false, Ordering::SeqCst);
    let engine = fakes.engine();

    assert!(matches!(
        engine.execute_sync("edit", true).await,
        Dispatch::Failed(SyncError::PreconditionUnmet { .. })
    ));
    assert_eq!(fakes.notifier.of_kind("info").len(), 1);
    assert!(!engine.status().busy);
}

#[tokio::test(start_paused = true)]
async fn outdated_host_only_informs() {
    let fakes = Fakes::new(FakeTransport::open());
    fakes.versions.host_ok.store(false, Ordering::SeqCst);
    let engine = fakes.engine();

    assert!(engine.execute_sync("edit", true).await.is_started());
    assert_eq!(fakes.notifier.of_kind("info").len(), 1);
    assert!(fakes.notifier.of_kind("modal").is_empty());
}

// ---------------------------------------------------------------------------
// Import block
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn nested_import_blocks_pause_until_fully_released() {
    let fakes = Fakes::new(FakeTransport::open());
    fakes.working_copy.dirty.store(true, Ordering::SeqCst);
    let engine = fakes.engine();

    engine.begin_import_block();
    engine.begin_import_block();
    assert_eq!(
        engine.schedule_sync("edit"),
        Scheduled::Ignored(SkipReason::ImportBlocked)
    );
    match engine.execute_sync("manual during import", true).await {
        Dispatch::Skipped(SkipReason::ImportBlocked) => {}
        other => panic!("expected import block, got {other:?}"),
    }
    assert_eq!(engine.pending_messages().len(), 1);

    engine.end_import_block();
    assert!(engine.status().import_blocked);
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    assert!(fakes.transport.messages().is_empty());

    engine.end_import_block();
    assert!(!engine.status().import_blocked);
    tokio::time::sleep(Duration::from_secs(5 * 60 + 2)).await;
    assert_eq!(
        fakes.transport.messages(),
        vec!["manual during import".to_string()]
    );

    // Unbalanced end is tolerated.
    engine.end_import_block();
    assert!(!engine.status().import_blocked);
}

// ---------------------------------------------------------------------------
// Transport outcomes and hooks
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn offline_result_completes_without_error() {
    let fakes = Fakes::new(FakeTransport::open());
    fakes.transport.set_outcome(Outcome::Offline);
    let engine = fakes.engine();
    let mut rx = engine.subscribe();

    assert!(engine.execute_sync("edit", true).await.is_started());
    let events = session_events(&mut rx).await;

    assert!(stage_texts(&events).contains(&stages::OFFLINE.to_string()));
    assert_eq!(events.last(), Some(&SyncStatusEvent::Completed));
    assert!(fakes.notifier.of_kind("error").is_empty());
}

#[tokio::test(start_paused = true)]
async fn connectivity_notices_respect_cooldown() {
    let fakes = Fakes::new(FakeTransport::open());
    fakes.transport.set_outcome(Outcome::Unreachable);
    let engine = fakes.engine();
    let mut rx = engine.subscribe();

    for _ in 0..2 {
        assert!(engine.execute_sync("edit", true).await.is_started());
        let events = session_events(&mut rx).await;
        assert!(matches!(events.last(), Some(SyncStatusEvent::Failed { .. })));
    }
    assert_eq!(fakes.notifier.of_kind("info").len(), 1);
    assert!(fakes.notifier.of_kind("error").is_empty());

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(engine.execute_sync("edit", true).await.is_started());
    session_events(&mut rx).await;
    assert_eq!(fakes.notifier.of_kind("info").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn transport_fault_surfaces_an_error() {
    let fakes = Fakes::new(FakeTransport::open());
    fakes.transport.set_outcome(Outcome::Broken);
    let engine = fakes.engine();
    let mut rx = engine.subscribe();

    assert!(engine.execute_sync("edit", true).await.is_started());
    let events = session_events(&mut rx).await;

    match events.last() {
        Some(SyncStatusEvent::Failed { message }) => assert!(message.contains("merge conflict")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(fakes.notifier.of_kind("error").len(), 1);
    assert!(!engine.status().busy);
}

struct FailingRepair;

#[async_trait]
impl RepairHook for FailingRepair {
    async fn has_local_changes(&self) -> Result<bool, SyncError> {
        Ok(true)
    }
    async fn repair(&self, _paths: &[PathBuf]) -> Result<(), SyncError> {
        Err(SyncError::Transport("metadata file is locked".into()))
    }
}

struct FailingViewers;

#[async_trait]
impl ViewerRefresh for FailingViewers {
    async fn refresh_files(&self, _paths: &[PathBuf]) -> Result<(), SyncError> {
        Err(SyncError::hook("viewer refresh", "webview gone"))
    }
    async fn close_for_deleted_files(&self, _paths: &[PathBuf]) -> Result<(), SyncError> {
        Ok(())
    }
}

#[derive(Default)]
struct FlakyIndex {
    rebuilt: AtomicBool,
}

#[async_trait]
impl IndexRebuilder for FlakyIndex {
    async fn check_status(&self) -> Result<IndexStatus, SyncError> {
        Ok(IndexStatus {
            needs_full_rebuild: false,
        })
    }
    async fn sync_changed_files(
        &self,
        files: &[PathBuf],
        progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<(), SyncError> {
        progress(1, files.len() as u64);
        Err(SyncError::Transport("index database busy".into()))
    }
    async fn rebuild_all(&self) -> Result<(), SyncError> {
        self.rebuilt.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn hook_failures_are_absorbed() {
    let fakes = Fakes::new(FakeTransport::open());
    fakes.transport.set_outcome(Outcome::Changed(SyncResult {
        changed_files: vec![PathBuf::from("GEN.codex")],
        new_files: vec![PathBuf::from("EXO.codex")],
        ..SyncResult::default()
    }));
    let index = Arc::new(FlakyIndex::default());
    let collab = fakes
        .collaborators()
        .with_repair(Arc::new(FailingRepair))
        .with_viewers(Arc::new(FailingViewers))
        .with_index(index.clone());
    let engine = fakes.engine_with(collab, config());
    assert!(engine.capabilities().repair);
    assert!(!engine.capabilities().media);
    let mut rx = engine.subscribe();

    assert!(engine.execute_sync("edit", true).await.is_started());
    let events = session_events(&mut rx).await;

    assert_eq!(events.last(), Some(&SyncStatusEvent::Completed));
    assert!(stage_texts(&events).contains(&"Indexing files: 1/2".to_string()));
    assert!(index.rebuilt.load(Ordering::SeqCst), "fallback rebuild ran");
    assert!(fakes.notifier.of_kind("error").is_empty());
}

#[derive(Default)]
struct RecordingReporter {
    log: Mutex<Vec<String>>,
}

impl ProgressReporter for RecordingReporter {
    fn begin(&self, title: &str) {
        self.log.lock().unwrap().push(format!("begin {title}"));
    }
    fn report(&self, update: &ProgressUpdate) {
        self.log.lock().unwrap().push(format!("{}%", update.percent));
    }
    fn finish(&self) {
        self.log.lock().unwrap().push("finish".to_string());
    }
}

#[tokio::test(start_paused = true)]
async fn progress_surface_reaches_one_hundred_percent() {
    let fakes = Fakes::new(FakeTransport::open());
    let reporter = Arc::new(RecordingReporter::default());
    let collab = fakes.collaborators().with_progress(reporter.clone());
    let engine = fakes.engine_with(collab, config());
    let mut rx = engine.subscribe();

    assert!(engine.execute_sync("edit", true).await.is_started());
    session_events(&mut rx).await;
    settle().await;

    let log = reporter.log.lock().unwrap().clone();
    assert_eq!(log.first().map(String::as_str), Some("begin Syncing project"));
    assert_eq!(log.last().map(String::as_str), Some("finish"));
    assert!(log.contains(&"100%".to_string()), "got {log:?}");
}

// ---------------------------------------------------------------------------
// External synchronizer
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn external_session_is_adopted_and_released() {
    let fakes = Fakes::new(FakeTransport::open());
    let engine = fakes.engine();
    let mut rx = engine.subscribe();

    engine.handle_external(ExternalSyncEvent::Started {
        message: String::new(),
    });
    let status = engine.status();
    assert!(status.busy);
    assert_eq!(status.trigger, Some(SyncTrigger::ExternalCooperative));

    // No local session can start over it.
    assert!(matches!(
        engine.execute_sync("edit", true).await,
        Dispatch::Skipped(SkipReason::Busy)
    ));

    engine.handle_external(ExternalSyncEvent::Progress {
        phase: "fetch".into(),
        loaded: Some(5),
        total: Some(10),
        description: None,
    });
    assert_eq!(
        engine.status().stage.as_deref(),
        Some("Receiving objects: 5/10")
    );

    engine.handle_external(ExternalSyncEvent::Completed);
    assert!(!engine.status().busy);
    let events = session_events(&mut rx).await;
    assert_eq!(events.first(), Some(&SyncStatusEvent::Started));
    assert_eq!(events.last(), Some(&SyncStatusEvent::Completed));
}

#[tokio::test(start_paused = true)]
async fn external_events_for_own_session_are_not_double_counted() {
    let fakes = Fakes::new(FakeTransport::gated());
    let engine = fakes.engine();
    let mut rx = engine.subscribe();

    assert!(engine.execute_sync("mine", true).await.is_started());

    engine.handle_external(ExternalSyncEvent::Started {
        message: "Syncing".into(),
    });
    assert_eq!(engine.status().trigger, Some(SyncTrigger::Manual));

    // The executor, not the bridge, ends an internal session.
    engine.handle_external(ExternalSyncEvent::Completed);
    assert!(engine.status().busy);

    fakes.transport.release(1);
    let events = session_events(&mut rx).await;
    let completions = events
        .iter()
        .filter(|e| **e == SyncStatusEvent::Completed)
        .count();
    assert_eq!(completions, 1);
    assert!(!engine.status().busy);

    // The counter is back to zero: the next external start is adopted.
    engine.handle_external(ExternalSyncEvent::Started {
        message: String::new(),
    });
    assert_eq!(
        engine.status().trigger,
        Some(SyncTrigger::ExternalCooperative)
    );
}

#[tokio::test(start_paused = true)]
async fn attached_bridge_consumes_channel() {
    let fakes = Fakes::new(FakeTransport::open());
    let engine = fakes.engine();
    let (tx, events) = mpsc::unbounded_channel();
    let bridge = engine.attach_external(events);

    tx.send(ExternalSyncEvent::Started {
        message: String::new(),
    })
    .expect("bridge alive");
    settle().await;
    assert!(engine.status().busy);

    tx.send(ExternalSyncEvent::Error {
        message: "remote rejected".into(),
    })
    .expect("bridge alive");
    settle().await;
    assert!(!engine.status().busy);

    drop(tx);
    settle().await;
    assert!(bridge.is_finished());
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn disposed_listener_stops_receiving() {
    let fakes = Fakes::new(FakeTransport::open());
    let engine = fakes.engine();
    let seen = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&seen);
    let guard = engine.add_status_listener(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let mut rx = engine.subscribe();

    assert!(engine.execute_sync("one", true).await.is_started());
    session_events(&mut rx).await;
    let after_first = seen.load(Ordering::SeqCst);
    assert!(after_first > 0);

    guard.dispose();
    assert!(engine.execute_sync("two", true).await.is_started());
    session_events(&mut rx).await;
    assert_eq!(seen.load(Ordering::SeqCst), after_first);
}

#[tokio::test(start_paused = true)]
async fn listener_may_query_engine_status() {
    let fakes = Fakes::new(FakeTransport::open());
    let engine = fakes.engine();
    let observed = Arc::new(Mutex::new(Vec::new()));

    let observer = engine.clone();
    let sink = Arc::clone(&observed);
    let _guard = engine.add_status_listener(move |event| {
        if event.is_terminal() {
            sink.lock().unwrap().push(observer.status().busy);
        }
    });
    let mut rx = engine.subscribe();

    assert!(engine.execute_sync("edit", true).await.is_started());
    session_events(&mut rx).await;
    assert_eq!(*observed.lock().unwrap(), vec![false]);
}
