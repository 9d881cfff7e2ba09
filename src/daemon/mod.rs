#![forbid(unsafe_code)]

pub mod logging;
pub mod state;
pub mod status;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use time::OffsetDateTime;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backend::BackendClient;
use crate::config::machine::MachineIdentity;
use crate::config::projects::ProjectRegistry;
use crate::config::{Paths, Settings};
use crate::crypto::Decryptor;
use crate::daemon::state::{QueuedTask, SharedState};
use crate::daemon::status::{DaemonInfo, StatusPublisher};
use crate::error::PushdError;
use crate::task::model::{ExecutionStatus, Task, now_rfc3339};
use crate::task::runner::{self, RunContext, format_duration};
use crate::task::supervisor::SupervisorConfig;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const MAX_CONCURRENT: usize = 5;

const IDLE_WARN: Duration = Duration::from_secs(5 * 60);
const IDLE_LIMIT: Duration = Duration::from_secs(10 * 60);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);
const STOP_WAIT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub poll_interval: Duration,
    pub max_concurrent: usize,
    pub supervisor: SupervisorConfig,
    pub mirror_stderr: bool,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_concurrent: MAX_CONCURRENT,
            supervisor: SupervisorConfig::default(),
            mirror_stderr: false,
        }
    }
}

/// The daemon main loop: immediate poll, then a periodic tick that sweeps
/// running tasks, polls the backend, and dispatches new work up to the
/// concurrency cap. SIGTERM/SIGINT drain gracefully.
pub async fn run(paths: Paths, mut opts: DaemonOptions) -> anyhow::Result<()> {
    paths.ensure_dirs()?;
    logging::init_daemon(paths.log_file(), opts.mirror_stderr)?;

    reap_stale_pid(&paths)?;
    std::fs::write(paths.pid_file(), format!("{}\n", std::process::id()))
        .with_context(|| format!("failed to write {}", paths.pid_file().display()))?;
    let _pid_guard = PidGuard {
        pid_file: paths.pid_file(),
    };
    let version = env!("CARGO_PKG_VERSION");
    std::fs::write(paths.version_file(), format!("{version}\n"))
        .with_context(|| format!("failed to write {}", paths.version_file().display()))?;

    let settings = Settings::load(&paths)?;
    opts.supervisor.auto_commit = settings.auto_commit;
    let machine = MachineIdentity::load_or_create(&paths)?;

    tracing::info!("push task execution daemon started");
    tracing::info!(
        pid = std::process::id(),
        version,
        machine = %machine.machine_id,
        poll_interval_secs = opts.poll_interval.as_secs(),
        max_concurrent = opts.max_concurrent,
        log = %paths.log_file().display(),
        "daemon configuration"
    );
    if settings.api_key.is_none() {
        tracing::warn!("no API key configured; run the connect flow, polling will be idle");
    }

    let state = state::shared();
    let registry = Arc::new(Mutex::new(ProjectRegistry::load(&paths)));
    let decryptor = Decryptor::init().await;
    let cancel = CancellationToken::new();

    let daemon_info = DaemonInfo {
        pid: std::process::id(),
        version: version.to_owned(),
        started_at: now_rfc3339(),
        machine_name: machine.machine_name.clone(),
        machine_id_suffix: machine.suffix.clone(),
    };
    let status = Arc::new(StatusPublisher::new(
        paths.status_file(),
        daemon_info,
        state.clone(),
        opts.max_concurrent,
    ));
    status.publish();

    let mut backend = BackendClient::new(&settings, machine.clone()).ok().map(Arc::new);
    let mut joinset: JoinSet<()> = JoinSet::new();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    // Immediate poll on startup, then the interval takes over.
    poll_and_dispatch(
        &paths,
        &settings,
        &machine,
        &mut backend,
        &registry,
        &decryptor,
        &state,
        &status,
        &opts,
        &cancel,
        &mut joinset,
    )
    .await;
    status.publish();

    let mut ticker = tokio::time::interval(opts.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                sweep_idle(&state);
                poll_and_dispatch(
                    &paths,
                    &settings,
                    &machine,
                    &mut backend,
                    &registry,
                    &decryptor,
                    &state,
                    &status,
                    &opts,
                    &cancel,
                    &mut joinset,
                )
                .await;
                status.publish();
            }
            Some(res) = joinset.join_next() => {
                if let Err(e) = res {
                    tracing::error!(error = %e, "task join error");
                }
            }
        }
    }

    // Graceful drain: supervisors terminate their children and the runners
    // report failed + daemon_shutdown, then clean up their worktrees.
    state::lock(&state).set_draining();
    cancel.cancel();
    let drain = async {
        while joinset.join_next().await.is_some() {}
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::error!("drain timed out, abandoning remaining tasks");
        joinset.abort_all();
    }

    drop(_pid_guard);
    status.publish_final();
    tracing::info!("daemon stopped");
    Ok(())
}

struct PidGuard {
    pid_file: std::path::PathBuf,
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.pid_file);
    }
}

#[allow(clippy::too_many_arguments)]
async fn poll_and_dispatch(
    paths: &Paths,
    settings: &Settings,
    machine: &MachineIdentity,
    backend: &mut Option<Arc<BackendClient>>,
    registry: &Arc<Mutex<ProjectRegistry>>,
    decryptor: &Decryptor,
    state: &SharedState,
    status: &Arc<StatusPublisher>,
    opts: &DaemonOptions,
    cancel: &CancellationToken,
    joinset: &mut JoinSet<()>,
) {
    if cancel.is_cancelled() {
        return;
    }

    let running = state::lock(state).running_count();
    if running >= opts.max_concurrent {
        tracing::debug!(running, cap = opts.max_concurrent, "at capacity, skipping poll");
        return;
    }

    // The connect flow may have written an API key since startup.
    if backend.is_none() {
        let reloaded = Settings::load(paths).unwrap_or_else(|_| settings.clone());
        match BackendClient::new(&reloaded, machine.clone()) {
            Ok(client) => *backend = Some(Arc::new(client)),
            Err(_) => {
                tracing::debug!("no API key yet, skipping poll");
                return;
            }
        }
    }
    let Some(client) = backend.as_ref() else {
        return;
    };

    let repo_urls = registry
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .registered_urls();

    let tasks = match client.poll(&repo_urls).await {
        Ok(tasks) => tasks,
        Err(e) if e.is_auth() => {
            tracing::error!("backend rejected API key (401); reconnect to reauthenticate");
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "poll failed");
            return;
        }
    };

    let mut tasks: Vec<Task> = tasks
        .into_iter()
        .filter(|t| t.execution_status == ExecutionStatus::Queued)
        .collect();
    for task in &mut tasks {
        decryptor.decrypt_task(task);
    }

    {
        let mut s = state::lock(state);
        let queued = tasks
            .iter()
            .filter(|t| !s.is_running(t.display_number))
            .map(|t| QueuedTask {
                display_number: t.display_number,
                summary: t.summary.clone(),
            })
            .collect();
        s.set_queued(queued);
    }

    if tasks.is_empty() {
        if running > 0 {
            tracing::debug!(running, "no new tasks");
        }
        return;
    }
    tracing::info!(count = tasks.len(), "found queued task(s)");

    let ctx = RunContext {
        backend: Arc::clone(client),
        state: state.clone(),
        registry: Arc::clone(registry),
        paths: paths.clone(),
        status: Arc::clone(status),
        supervisor: opts.supervisor.clone(),
        settings: settings.clone(),
        cancel: cancel.clone(),
    };

    // Dispatch in backend order, bounded by remaining capacity, never two
    // runs of the same display number.
    let capacity = opts.max_concurrent - running;
    let mut dispatched = BTreeSet::new();
    let mut started = 0usize;
    for task in tasks {
        if started >= capacity {
            break;
        }
        if dispatched.contains(&task.display_number)
            || state::lock(state).is_running(task.display_number)
        {
            continue;
        }
        dispatched.insert(task.display_number);
        started += 1;
        joinset.spawn(runner::run_task(ctx.clone(), task));
    }
}

/// Idle detection runs on the tick, measured from the last stdout line, not
/// from task start. Idle never kills a task.
fn sweep_idle(state: &SharedState) {
    let now = OffsetDateTime::now_utc();
    let mut s = state::lock(state);
    for record in s.running_values_mut() {
        let idle = now - record.last_output_at;
        let Ok(idle) = Duration::try_from(idle) else {
            continue;
        };
        if idle > IDLE_LIMIT {
            record.phase_detail = Some(format!("no output for {}", format_duration(idle.as_secs())));
            tracing::warn!(
                task = record.display_number,
                idle_secs = idle.as_secs(),
                "task is idle"
            );
        } else if idle > IDLE_WARN {
            tracing::warn!(
                task = record.display_number,
                idle_secs = idle.as_secs(),
                "task has been quiet"
            );
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return std::future::pending().await,
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(_) => return std::future::pending().await,
        };
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn read_pid(paths: &Paths) -> Option<u32> {
    let raw = std::fs::read_to_string(paths.pid_file()).ok()?;
    raw.trim().parse().ok()
}

#[cfg(unix)]
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    i32::try_from(pid).is_ok_and(|pid| kill(Pid::from_raw(pid), None).is_ok())
}

#[cfg(not(unix))]
#[must_use]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
pub(crate) fn send_sigterm(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    if let Ok(pid) = i32::try_from(pid) {
        let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
pub(crate) fn send_sigterm(_pid: u32) {}

/// A second daemon on the same machine is refused; a stale PID file left by
/// a crash is reaped.
fn reap_stale_pid(paths: &Paths) -> Result<(), PushdError> {
    let Some(pid) = read_pid(paths) else {
        return Ok(());
    };
    if pid != std::process::id() && pid_alive(pid) {
        return Err(PushdError::AlreadyRunning(pid));
    }
    tracing::info!(pid, "removing stale pid file");
    let _ = std::fs::remove_file(paths.pid_file());
    Ok(())
}

/// Stop a running daemon: SIGTERM, then wait for it to exit.
/// Returns false when no daemon was running.
pub async fn stop(paths: &Paths) -> anyhow::Result<bool> {
    let Some(pid) = read_pid(paths) else {
        return Ok(false);
    };
    if !pid_alive(pid) {
        let _ = std::fs::remove_file(paths.pid_file());
        return Ok(false);
    }

    send_sigterm(pid);
    let start = std::time::Instant::now();
    while start.elapsed() < STOP_WAIT {
        if !pid_alive(pid) {
            return Ok(true);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    anyhow::bail!("daemon (pid {pid}) did not stop within {}s", STOP_WAIT.as_secs())
}

/// Start the daemon detached when it is not already running.
pub async fn start(paths: &Paths) -> anyhow::Result<bool> {
    if let Some(pid) = read_pid(paths)
        && pid_alive(pid)
    {
        return Ok(false);
    }
    spawn_detached()?;
    Ok(true)
}

/// Start the daemon detached when it is not running; restart it when the
/// recorded version differs from the installed one. This is the sole
/// in-band update mechanism.
pub async fn ensure_running(paths: &Paths) -> anyhow::Result<bool> {
    let installed = env!("CARGO_PKG_VERSION");
    if let Some(pid) = read_pid(paths)
        && pid_alive(pid)
    {
        let recorded = std::fs::read_to_string(paths.version_file())
            .map(|v| v.trim().to_owned())
            .unwrap_or_default();
        if recorded == installed {
            return Ok(false);
        }
        tracing::info!(recorded = %recorded, installed, "daemon version changed, restarting");
        stop(paths).await?;
    }
    spawn_detached()?;
    Ok(true)
}

fn spawn_detached() -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("failed to resolve current executable")?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("run")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        cmd.process_group(0);
    }
    cmd.spawn().context("failed to spawn daemon")?;
    Ok(())
}
