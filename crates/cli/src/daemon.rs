//! Daemon process lifecycle: PID file, exclusive lock, background spawn via
//! re-exec, signal handling, and the foreground composition root that wires
//! every component named in spec §4.9 together and runs it to completion.

use std::fs;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use agora_broker::TinyBus;
use agora_config::AppConfig;
use agora_llm::{LlmRouter, LlmSessionLauncher, Provider};
use agora_orchestrator::control::{run_control_server, ControlClient, ControlCommand, ControlEvent};
use agora_orchestrator::{ExitReason, Orchestrator, RateLimitStateManager, SchedulerCoordinator, Watchdog, WatchdogAction};
use agora_relay::RelayState;
use agora_store::{DriveQualityLog, RuntimeDir};
use anyhow::{bail, Result};
use fs2::FileExt;

#[derive(Debug, Clone)]
pub(crate) struct DaemonPaths {
    pub(crate) runtime_dir: PathBuf,
    pub(crate) pid_file: PathBuf,
    pub(crate) log_file: PathBuf,
    pub(crate) lock_file: PathBuf,
    pub(crate) socket_path: PathBuf,
}

pub(crate) fn daemon_paths(config: &AppConfig) -> DaemonPaths {
    let runtime_dir = PathBuf::from(&config.daemon.runtime_dir);
    DaemonPaths {
        pid_file: runtime_dir.join("daemon.pid"),
        log_file: runtime_dir.join("daemon.log"),
        lock_file: runtime_dir.join("daemon.lock"),
        socket_path: PathBuf::from(&config.daemon.socket_path),
        runtime_dir,
    }
}

pub(crate) fn daemon_start(config: &AppConfig, force: bool) -> Result<()> {
    let paths = daemon_paths(config);
    fs::create_dir_all(&paths.runtime_dir)?;

    if is_socket_live(&paths.socket_path) && !force {
        bail!("daemon already running on socket {}; use `agora daemon restart`", paths.socket_path.display());
    }

    if let Some(pid) = read_pid(&paths.pid_file)? {
        if is_pid_running(pid) {
            if !force {
                bail!("daemon already running with pid {pid}; use `agora daemon restart` or `--force`");
            }
            terminate_pid(pid)?;
            wait_for_pid_exit(pid, Duration::from_secs(4));
        }
        let _ = fs::remove_file(&paths.pid_file);
    }

    if paths.socket_path.exists() {
        let _ = fs::remove_file(&paths.socket_path);
    }
    if force && paths.lock_file.exists() {
        let _ = fs::remove_file(&paths.lock_file);
    }

    let exe = std::env::current_exe()?;
    let out = OpenOptions::new().create(true).append(true).open(&paths.log_file)?;
    let err = out.try_clone()?;

    let mut child = Command::new(exe)
        .arg("run")
        .env("AGORA_DAEMON_PROCESS", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .spawn()?;

    fs::write(&paths.pid_file, child.id().to_string())?;

    for _ in 0..50 {
        if is_socket_live(&paths.socket_path) {
            println!("daemon started");
            println!("- pid: {}", child.id());
            println!("- socket: {}", paths.socket_path.display());
            println!("- log: {}", paths.log_file.display());
            return Ok(());
        }
        if let Some(status) = child.try_wait()? {
            let _ = fs::remove_file(&paths.pid_file);
            bail!("daemon exited during startup with status {status}; check {}", paths.log_file.display());
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    let _ = fs::remove_file(&paths.pid_file);
    bail!("daemon did not become ready on socket {}; check {}", paths.socket_path.display(), paths.log_file.display())
}

pub(crate) async fn daemon_stop(config: &AppConfig) -> Result<()> {
    let paths = daemon_paths(config);
    let client = ControlClient::new(&paths.socket_path);
    if client.send(ControlCommand::Stop).await.is_ok() {
        println!("daemon stop requested gracefully");
    }

    let Some(pid) = read_pid(&paths.pid_file)? else {
        println!("daemon is not running");
        return Ok(());
    };

    if !is_pid_running(pid) {
        let _ = fs::remove_file(&paths.pid_file);
        println!("daemon was not running (stale pid file cleaned)");
        return Ok(());
    }

    wait_for_pid_exit(pid, Duration::from_millis(config.daemon.shutdown_grace_ms));
    if is_pid_running(pid) {
        terminate_pid(pid)?;
        wait_for_pid_exit(pid, Duration::from_secs(4));
    }
    let _ = fs::remove_file(&paths.pid_file);
    let _ = fs::remove_file(&paths.lock_file);
    println!("daemon stopped (pid {pid})");
    Ok(())
}

pub(crate) fn wait_for_pid_exit(pid: u32, timeout: Duration) {
    let step = Duration::from_millis(50);
    let mut waited = Duration::from_millis(0);
    while waited < timeout {
        if !is_pid_running(pid) {
            return;
        }
        std::thread::sleep(step);
        waited += step;
    }
}

pub(crate) fn daemon_status(config: &AppConfig) -> Result<()> {
    let paths = daemon_paths(config);
    let socket_live = is_socket_live(&paths.socket_path);

    match read_pid(&paths.pid_file)? {
        Some(pid) if is_pid_running(pid) || socket_live => {
            println!("daemon status: running");
            println!("- pid: {pid}");
            println!("- socket: {}", paths.socket_path.display());
            println!("- log: {}", paths.log_file.display());
        }
        _ => {
            println!("daemon status: stopped");
            println!("- socket: {}", paths.socket_path.display());
            println!("- log: {}", paths.log_file.display());
        }
    }
    Ok(())
}

pub(crate) fn is_socket_live(path: &Path) -> bool {
    std::os::unix::net::UnixStream::connect(path).is_ok()
}

pub(crate) fn read_pid(path: &Path) -> Result<Option<u32>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    Ok(raw.trim().parse::<u32>().ok())
}

pub(crate) fn is_pid_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        Command::new("kill").arg("-0").arg(pid.to_string()).status().map(|status| status.success()).unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

pub(crate) fn terminate_pid(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let status = Command::new("kill").arg(pid.to_string()).status()?;
        if !status.success() {
            bail!("failed to terminate daemon pid {pid}");
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        bail!("daemon stop is only implemented on unix in this build")
    }
}

/// Ensures a daemon is reachable on the control socket, starting one in the
/// background if not (mirrors the teacher's `ensure_daemon_running`).
pub(crate) fn ensure_daemon_running(config: &AppConfig) -> Result<()> {
    let paths = daemon_paths(config);
    if is_socket_live(&paths.socket_path) {
        return Ok(());
    }
    daemon_start(config, false)?;
    for _ in 0..50 {
        if is_socket_live(&paths.socket_path) {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    bail!("daemon did not become ready on socket {}", paths.socket_path.display())
}

/// Polls the watchdog on its configured interval and feeds `Nudge`/
/// `ForceRestart` actions back into the orchestrator (spec §4.5's wiring
/// gap, closed here in the composition root).
async fn run_watchdog_driver(watchdog: Arc<Watchdog>, orchestrator: Arc<Orchestrator>) {
    loop {
        tokio::time::sleep(watchdog.poll_interval()).await;
        match watchdog.poll() {
            WatchdogAction::Healthy => {}
            WatchdogAction::Nudge(message) => {
                tracing::warn!(%message, "watchdog nudging stalled loop");
                orchestrator.inject_message(message).await;
            }
            WatchdogAction::ForceRestart => {
                tracing::error!("watchdog forcing restart after sustained stall");
                orchestrator.request_restart();
            }
        }
    }
}

/// The foreground composition root (spec §4.9): builds every component and
/// runs the loop to completion. Invoked either directly via `agora run` (the
/// hidden entry the daemon re-execs into) or in-process when the caller
/// wants a foreground, non-daemonized run.
pub(crate) async fn run_daemon_process(config: AppConfig) -> Result<ExitReason> {
    let paths = daemon_paths(&config);
    fs::create_dir_all(&paths.runtime_dir)?;

    let lock_file = File::create(&paths.lock_file)?;
    lock_file.try_lock_exclusive().map_err(|_| anyhow::anyhow!("another daemon instance already holds the lock"))?;
    fs::write(&paths.pid_file, std::process::id().to_string())?;

    let runtime = Arc::new(RuntimeDir::new(&paths.runtime_dir));
    let drive_quality_log = DriveQualityLog::new(paths.runtime_dir.join("drive_quality.jsonl"));

    let router = Arc::new(LlmRouter::default());
    let launcher = Arc::new(LlmSessionLauncher::new(router, Provider::Ollama, "llama3", "openrouter/auto"));

    let scheduler_coordinator = SchedulerCoordinator::bundled(config.scheduler.clone(), runtime.clone());
    let rate_limit_manager = RateLimitStateManager::new(runtime.clone(), config.rate_limit.clone());
    let watchdog = Arc::new(Watchdog::new(config.watchdog.clone()));

    let orchestrator = Orchestrator::new(
        config.r#loop.clone(),
        launcher,
        runtime,
        drive_quality_log,
        scheduler_coordinator,
        rate_limit_manager,
        watchdog.clone(),
        config.rate_limit.plan_file.clone(),
    );

    orchestrator.initialize_sleeping().await;
    if orchestrator.state().await == agora_orchestrator::LoopState::Stopped {
        orchestrator.start().await?;
    }

    let relay_state = RelayState::new(config.relay.clone());
    let bus = Arc::new(TinyBus::new());
    bus.start().await?;

    let control_socket = paths.socket_path.clone();
    let control_orchestrator = orchestrator.clone();
    let control_server = run_control_server(control_socket, control_orchestrator);

    let watchdog_driver = run_watchdog_driver(watchdog, orchestrator.clone());

    let relay_server = agora_relay::run(relay_state);

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
        Ok::<(), anyhow::Error>(())
    };
    #[cfg(not(unix))]
    let terminate = async {
        tokio::signal::ctrl_c().await?;
        Ok::<(), anyhow::Error>(())
    };

    let exit_reason = tokio::select! {
        result = orchestrator.run_forever() => result?,
        result = relay_server => { result?; ExitReason::Graceful }
        result = control_server => { result?; ExitReason::Graceful }
        _ = watchdog_driver => ExitReason::Graceful,
        result = terminate => {
            result?;
            orchestrator.stop().await;
            ExitReason::Graceful
        }
    };

    let _ = bus.stop().await;
    let _ = fs::remove_file(&paths.pid_file);
    let _ = fs::remove_file(&paths.lock_file);
    let _ = fs::remove_file(&paths.socket_path);

    Ok(exit_reason)
}

/// Sends a single control command to a running daemon, starting one first
/// if none is reachable, and prints the reply.
pub(crate) async fn send_control_command(config: &AppConfig, command: ControlCommand) -> Result<()> {
    ensure_daemon_running(config)?;
    let paths = daemon_paths(config);
    let client = ControlClient::new(&paths.socket_path);
    match client.send(command).await? {
        ControlEvent::Ack { message } => println!("{message}"),
        ControlEvent::StatusReply { status } => {
            println!("state: {}", status.state);
            println!("cycle: {}", status.cycle_number);
            println!("pending messages: {}", status.pending_messages);
            println!(
                "cycles: {} total, {} successful, {} failed, {} idle ({} consecutive)",
                status.metrics.total_cycles,
                status.metrics.successful_cycles,
                status.metrics.failed_cycles,
                status.metrics.idle_cycles,
                status.metrics.consecutive_idle_cycles,
            );
        }
        ControlEvent::Error { message } => bail!(message),
    }
    Ok(())
}
