use std::collections::HashMap;
use std::future::Future;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use quill_core::config::{config_path_at, load_at, quill_root};
use quill_core::{ExternalSyncEvent, SyncStatusEvent};
use quill_sync::{Dispatch, EngineOptions, LockService, Scheduled, SyncEngine};

use crate::collaborators::{bind, TracingNotifier};
use crate::error::{io_err, DaemonError};
use crate::paths::{logs_dir, run_dir, socket_path, DEBOUNCE_WINDOW};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// Shared by every socket client.
#[derive(Clone)]
struct Context {
    home: PathBuf,
    engine: SyncEngine,
    notifier: Arc<TracingNotifier>,
    external: mpsc::UnboundedSender<ExternalSyncEvent>,
    started_at_unix: u64,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon runtime.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let config = load_at(&home)?;
    let Some(workspace) = config.workspace.clone() else {
        return Err(DaemonError::NoWorkspace {
            config: config_path_at(&home),
        });
    };
    // FSEvents reports real paths (e.g. /private/var/... on macOS).
    let workspace = fs::canonicalize(&workspace).map_err(|e| io_err(&workspace, e))?;

    let bound = bind(&config, &workspace);
    match bound.locks.cleanup_stale_lock().await {
        Ok(true) => tracing::warn!(path = %bound.locks.path().display(), "removed stale sync lock"),
        Ok(false) => {}
        Err(err) => tracing::warn!(error = %err, "could not inspect sync lock at startup"),
    }

    let verbose = std::env::var_os("QUILL_VERBOSE").is_some();
    let engine = SyncEngine::new(
        config,
        bound.collaborators,
        EngineOptions {
            verbose,
            ..EngineOptions::default()
        },
    );
    engine.open_workspace(&workspace);
    tracing::info!(workspace = %workspace.display(), capabilities = ?engine.capabilities(), "daemon starting");

    let (external_tx, external_rx) = mpsc::unbounded_channel();
    let _bridge = engine.attach_external(external_rx);

    let context = Context {
        home: home.clone(),
        engine: engine.clone(),
        notifier: bound.notifier,
        external: external_tx,
        started_at_unix: unix_seconds_now(),
    };
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let watcher = spawn_until_shutdown(
        &shutdown_tx,
        watcher_task(home.clone(), workspace, engine.clone(), shutdown_tx.subscribe()),
    );
    let socket = spawn_until_shutdown(
        &shutdown_tx,
        socket_server_task(context, shutdown_tx.clone(), shutdown_tx.subscribe()),
    );
    let rotation = spawn_until_shutdown(
        &shutdown_tx,
        log_rotation_task(home, shutdown_tx.subscribe()),
    );
    let signal = spawn_until_shutdown(&shutdown_tx, signal_task(shutdown_tx.subscribe()));

    let (watcher, socket, rotation, signal) = tokio::join!(watcher, socket, rotation, signal);

    engine.close_workspace();
    handle_join("watcher", watcher)?;
    handle_join("socket_server", socket)?;
    handle_join("log_rotation", rotation)?;
    handle_join("signal_handler", signal)?;
    Ok(())
}

/// Spawn a daemon task; when it ends, for any reason, every other task is
/// told to shut down.
fn spawn_until_shutdown<F>(
    shutdown: &broadcast::Sender<()>,
    task: F,
) -> JoinHandle<Result<(), DaemonError>>
where
    F: Future<Output = Result<(), DaemonError>> + Send + 'static,
{
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        let result = task.await;
        let _ = shutdown.send(());
        result
    })
}

async fn signal_task(mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), DaemonError> {
    tokio::select! {
        _ = shutdown_rx.recv() => Ok(()),
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| io_err("ctrl-c handler", e))?;
            tracing::info!("interrupted; shutting down");
            Ok(())
        }
    }
}

async fn watcher_task(
    home: PathBuf,
    workspace: PathBuf,
    engine: SyncEngine,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    watcher.watch(&workspace, RecursiveMode::Recursive)?;
    tracing::debug!(path = %workspace.display(), "watching workspace");
    // The config is replaced by rename, so watch its directory.
    watcher.watch(&quill_root(&home), RecursiveMode::NonRecursive)?;
    let config_files = config_aliases(&config_path_at(&home));

    let mut debounce = HashMap::<PathBuf, Instant>::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }

                for path in event.paths {
                    if config_files.iter().any(|file| file == &path) {
                        reload_config(&home, &engine, &workspace);
                        continue;
                    }
                    let Some(relative) = workspace_relative(&path, &workspace) else {
                        continue;
                    };
                    if !should_process_event(&mut debounce, &path, Instant::now()) {
                        continue;
                    }

                    let message = format!("edited {}", relative.display());
                    match engine.schedule_sync(message) {
                        Scheduled::Armed(delay) => tracing::debug!(
                            path = %relative.display(),
                            delay_secs = delay.as_secs(),
                            "edit scheduled a sync",
                        ),
                        Scheduled::Queued => tracing::debug!(path = %relative.display(), "edit queued behind running sync"),
                        Scheduled::Ignored(reason) => tracing::debug!(path = %relative.display(), reason = %reason, "edit did not schedule a sync"),
                    }
                }
            }
        }
    }

    Ok(())
}

async fn socket_server_task(
    context: Context,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&context.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "daemon socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let context = context.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, context, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    context: Context,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stop = request.cmd == "stop";
        let response = handle_request(&context, request, &shutdown_tx).await;
        write_response(&mut writer, &response).await?;
        if stop {
            break;
        }
    }

    Ok(())
}

async fn handle_request(
    context: &Context,
    request: DaemonRequest,
    shutdown_tx: &broadcast::Sender<()>,
) -> DaemonResponse {
    let engine = &context.engine;
    match request.cmd.as_str() {
        "status" => DaemonResponse::ok(build_status_payload(context)),
        "sync" => {
            let message = request
                .message
                .unwrap_or_else(|| "manual sync".to_string());
            run_manual_sync(engine, message).await
        }
        "schedule" => {
            let Some(message) = request.message else {
                return DaemonResponse::error("schedule requires a message");
            };
            DaemonResponse::ok(match engine.schedule_sync(message) {
                Scheduled::Armed(delay) => json!({ "outcome": "armed", "delay_secs": delay.as_secs() }),
                Scheduled::Queued => json!({ "outcome": "queued" }),
                Scheduled::Ignored(reason) => json!({ "outcome": "ignored", "reason": reason.to_string() }),
            })
        }
        "import-begin" => {
            engine.begin_import_block();
            DaemonResponse::ok(json!(engine.status()))
        }
        "import-end" => {
            engine.end_import_block();
            DaemonResponse::ok(json!(engine.status()))
        }
        "external" => {
            let Some(event) = request.event else {
                return DaemonResponse::error("external requires an event");
            };
            match context.external.send(event) {
                Ok(()) => DaemonResponse::ok(json!({ "accepted": true })),
                Err(_) => DaemonResponse::error(DaemonError::ChannelClosed("external bridge").to_string()),
            }
        }
        "stop" => {
            let _ = shutdown_tx.send(());
            DaemonResponse::ok(json!({ "stopping": true }))
        }
        other => DaemonResponse::error(format!("unknown command '{other}'")),
    }
}

/// Start a manual sync and wait for the session's terminal event.
async fn run_manual_sync(engine: &SyncEngine, message: String) -> DaemonResponse {
    let mut events = engine.subscribe();
    match engine.execute_sync(message, true).await {
        Dispatch::Started => {}
        Dispatch::Skipped(reason) => {
            return DaemonResponse::ok(json!({ "outcome": "skipped", "reason": reason.to_string() }))
        }
        Dispatch::Failed(err) => return DaemonResponse::error(err.to_string()),
    }

    loop {
        match events.recv().await {
            Ok(SyncStatusEvent::Completed) => {
                return DaemonResponse::ok(json!({ "outcome": "completed" }))
            }
            Ok(SyncStatusEvent::Failed { message }) => return DaemonResponse::error(message),
            Ok(SyncStatusEvent::Skipped { message }) => {
                return DaemonResponse::ok(json!({ "outcome": "skipped", "reason": message }))
            }
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "sync waiter lagged behind status stream");
            }
            Err(broadcast::error::RecvError::Closed) => {
                return DaemonResponse::error(DaemonError::ChannelClosed("status stream").to_string())
            }
        }
    }
}

fn build_status_payload(context: &Context) -> Value {
    let config = context.engine.config();
    json!({
        "running": true,
        "started_at_unix": context.started_at_unix,
        "socket": socket_path(&context.home).display().to_string(),
        "auto_sync_enabled": config.auto_sync_enabled,
        "sync_delay_secs": config.effective_sync_delay().as_secs(),
        "engine": context.engine.status(),
        "pending_messages": context.engine.pending_messages(),
        "capabilities": context.engine.capabilities(),
        "notices": context.notifier.recent(),
    })
}

async fn log_rotation_task(
    home: PathBuf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick is immediate; skip it so startup never rotates.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let home = home.clone();
                // Failures are logged inside rotate_logs.
                let _ = tokio::task::spawn_blocking(move || crate::log_rotation::rotate_logs(&home)).await;
            }
        }
    }
    Ok(())
}

/// Re-read the config file and apply it to the engine. The bound workspace
/// stays fixed for the life of the process.
fn reload_config(home: &Path, engine: &SyncEngine, workspace: &Path) {
    let mut config = match load_at(home) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(error = %err, "could not reload config; keeping current settings");
            return;
        }
    };
    let requested = config
        .workspace
        .as_deref()
        .map(|path| fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()));
    if requested.as_deref() != Some(workspace) {
        tracing::warn!(
            requested = ?config.workspace,
            bound = %workspace.display(),
            "config names a different workspace; restart the daemon to switch",
        );
    }
    config.workspace = Some(workspace.to_path_buf());
    tracing::info!(
        auto_sync_enabled = config.auto_sync_enabled,
        sync_delay_secs = config.effective_sync_delay().as_secs(),
        "config reloaded",
    );
    engine.update_config(config);
}

/// The config path as given plus its canonical form, since watchers may
/// report either.
fn config_aliases(config_file: &Path) -> Vec<PathBuf> {
    let mut aliases = vec![config_file.to_path_buf()];
    if let (Some(dir), Some(name)) = (config_file.parent(), config_file.file_name()) {
        if let Ok(real_dir) = fs::canonicalize(dir) {
            let real = real_dir.join(name);
            if real != config_file {
                aliases.push(real);
            }
        }
    }
    aliases
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Path relative to the workspace, or `None` for paths outside it or inside
/// `.git/`.
fn workspace_relative(path: &Path, workspace: &Path) -> Option<PathBuf> {
    let relative = path.strip_prefix(workspace).ok()?;
    match relative.components().next() {
        None => None,
        Some(Component::Normal(first)) if first == ".git" => None,
        Some(_) => Some(relative.to_path_buf()),
    }
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    if StdUnixStream::connect(socket).is_ok() {
        return Err(DaemonError::Protocol(format!(
            "daemon socket already in use: {}",
            socket.display()
        )));
    }
    tracing::warn!(socket = %socket.display(), "removing stale daemon socket before bind");

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn should_process_event(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
) -> bool {
    should_process_event_with_threshold(debounce, path, now, DEBOUNCE_WINDOW)
}

fn should_process_event_with_threshold(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
    threshold: Duration,
) -> bool {
    debounce.retain(|_, seen_at| now.duration_since(*seen_at) <= Duration::from_secs(30));
    match debounce.get(path) {
        Some(last_seen) if now.duration_since(*last_seen) < threshold => false,
        _ => {
            debounce.insert(path.to_path_buf(), now);
            true
        }
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [run_dir(home), logs_dir(home)] {
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let mut payload = serde_json::to_string(response)?;
    payload.push('\n');
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
