//! Local control surface: a Unix-socket, JSON-line protocol for operator
//! commands (spec §4.9, §6). One command per connection, mirroring the
//! teacher's daemon socket idiom — write a JSON line, read JSON lines back
//! until a terminal event, close.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::orchestrator::Orchestrator;
use crate::types::{LoopMetrics, LoopState};

/// Operator commands accepted on the control socket (spec §4.9: "start/stop/
/// pause/status/inject").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    Start,
    Stop,
    Pause,
    Resume,
    Wake,
    Status,
    Inject { message: String },
    RequestAudit,
    RequestRestart,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub state: LoopState,
    pub cycle_number: u64,
    pub pending_messages: usize,
    pub metrics: LoopMetrics,
}

/// Reply frame. Every request gets exactly one terminal `Ack`, `StatusReply`,
/// or `Error` before the connection closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    Ack { message: String },
    StatusReply { status: StatusPayload },
    Error { message: String },
}

async fn dispatch(orchestrator: &Arc<Orchestrator>, command: ControlCommand) -> ControlEvent {
    match command {
        ControlCommand::Start => match orchestrator.start().await {
            Ok(()) => ControlEvent::Ack { message: "started".into() },
            Err(err) => ControlEvent::Error { message: err.to_string() },
        },
        ControlCommand::Stop => {
            orchestrator.stop().await;
            ControlEvent::Ack { message: "stopped".into() }
        }
        ControlCommand::Pause => match orchestrator.pause().await {
            Ok(()) => ControlEvent::Ack { message: "paused".into() },
            Err(err) => ControlEvent::Error { message: err.to_string() },
        },
        ControlCommand::Resume => match orchestrator.resume().await {
            Ok(()) => ControlEvent::Ack { message: "resumed".into() },
            Err(err) => ControlEvent::Error { message: err.to_string() },
        },
        ControlCommand::Wake => match orchestrator.wake().await {
            Ok(()) => ControlEvent::Ack { message: "woke".into() },
            Err(err) => ControlEvent::Error { message: err.to_string() },
        },
        ControlCommand::Status => ControlEvent::StatusReply {
            status: StatusPayload {
                state: orchestrator.state().await,
                cycle_number: orchestrator.metrics().await.total_cycles,
                pending_messages: orchestrator.pending_message_count().await,
                metrics: orchestrator.metrics().await,
            },
        },
        ControlCommand::Inject { message } => {
            let delivered_live = orchestrator.inject_message(message).await;
            ControlEvent::Ack {
                message: if delivered_live { "delivered to live session".into() } else { "queued for next cycle".into() },
            }
        }
        ControlCommand::RequestAudit => {
            orchestrator.request_audit();
            ControlEvent::Ack { message: "audit requested".into() }
        }
        ControlCommand::RequestRestart => {
            orchestrator.request_restart();
            ControlEvent::Ack { message: "restart requested".into() }
        }
    }
}

async fn handle_connection(stream: UnixStream, orchestrator: Arc<Orchestrator>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }

    let event = match serde_json::from_str::<ControlCommand>(line.trim()) {
        Ok(command) => dispatch(&orchestrator, command).await,
        Err(err) => ControlEvent::Error { message: format!("malformed command: {err}") },
    };

    let encoded = serde_json::to_string(&event)?;
    write_half.write_all(encoded.as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    write_half.flush().await?;
    Ok(())
}

/// Binds `socket_path` and serves control connections until the listener
/// errors or the process is torn down. Removes a stale socket file left
/// behind by an unclean shutdown before binding (spec §4.9 daemon lifecycle).
pub async fn run_control_server(socket_path: impl AsRef<Path>, orchestrator: Arc<Orchestrator>) -> Result<()> {
    let socket_path = socket_path.as_ref();
    if socket_path.exists() {
        let _ = std::fs::remove_file(socket_path);
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    debug!(socket = %socket_path.display(), "control socket listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, orchestrator).await {
                warn!(%err, "control connection error");
            }
        });
    }
}

/// Thin client over the same protocol, for the CLI's operator commands.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: std::path::PathBuf,
}

impl ControlClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self { socket_path: socket_path.as_ref().to_path_buf() }
    }

    pub async fn send(&self, command: ControlCommand) -> Result<ControlEvent> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (read_half, mut write_half) = stream.into_split();

        let request = serde_json::to_string(&command)?;
        write_half.write_all(request.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
        write_half.flush().await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        if line.trim().is_empty() {
            anyhow::bail!("control socket closed without a response");
        }
        Ok(serde_json::from_str(line.trim())?)
    }

    pub async fn is_live(&self) -> bool {
        UnixStream::connect(&self.socket_path).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idle::IdleHandler;
    use crate::rate_limit::RateLimitStateManager;
    use crate::roles::{Ego, Id, Subconscious, Superego};
    use crate::scheduler::SchedulerCoordinator;
    use crate::watchdog::Watchdog;
    use agora_config::{LoopConfig, WatchdogConfig};
    use agora_llm::InMemorySessionLauncher;
    use agora_store::{DriveQualityLog, RuntimeDir};

    fn test_orchestrator(dir: &std::path::Path) -> Arc<Orchestrator> {
        let launcher = Arc::new(InMemorySessionLauncher::new());
        let runtime = Arc::new(RuntimeDir::new(dir));
        Orchestrator::new(
            LoopConfig::default(),
            launcher,
            runtime.clone(),
            DriveQualityLog::new(dir.join("drive_quality.log")),
            SchedulerCoordinator::new(Vec::new()),
            RateLimitStateManager::new(runtime, agora_config::RateLimitConfig::default()),
            Arc::new(Watchdog::new(WatchdogConfig::default())),
            dir.join("plan.md").to_string_lossy().to_string(),
        )
    }

    #[tokio::test]
    async fn status_roundtrips_over_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path());
        let socket_path = dir.path().join("control.sock");

        let server_orchestrator = orchestrator.clone();
        let server_socket = socket_path.clone();
        tokio::spawn(async move {
            let _ = run_control_server(server_socket, server_orchestrator).await;
        });

        for _ in 0..50 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let client = ControlClient::new(&socket_path);
        let reply = client.send(ControlCommand::Status).await.unwrap();
        match reply {
            ControlEvent::StatusReply { status } => assert_eq!(status.state, LoopState::Stopped),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn inject_without_live_session_acks_queued() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path());
        let socket_path = dir.path().join("control.sock");

        let server_orchestrator = orchestrator.clone();
        let server_socket = socket_path.clone();
        tokio::spawn(async move {
            let _ = run_control_server(server_socket, server_orchestrator).await;
        });

        for _ in 0..50 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let client = ControlClient::new(&socket_path);
        let reply = client.send(ControlCommand::Inject { message: "hello".into() }).await.unwrap();
        assert!(matches!(reply, ControlEvent::Ack { message } if message.contains("queued")));
    }
}
