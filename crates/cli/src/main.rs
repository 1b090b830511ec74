//! Composition root's front door: a clap CLI exposing the daemon lifecycle
//! (start/stop/status/restart) and the operator control surface (spec §4.9
//! "a local control surface... for operator commands — start/stop/pause/
//! status/inject") over the control socket `daemon.rs` serves.

mod daemon;

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use agora_config::AppConfig;
use agora_orchestrator::{ControlCommand, ExitReason};

#[derive(Debug, Parser)]
#[command(name = "agora", version, about = "Cognitive loop orchestrator daemon and control CLI")]
struct Cli {
    /// Path to the TOML config file (spec §6: AGORA_CONFIG_PATH).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the daemon in the background.
    Start {
        /// Kill and replace an already-running daemon.
        #[arg(long)]
        force: bool,
    },
    /// Stop the background daemon gracefully.
    Stop,
    /// Print whether the daemon is running and its pid/socket/log.
    Status,
    /// Restart the background daemon.
    Restart,
    /// Run the daemon in the foreground (the entry the background start
    /// re-execs into; also usable directly under a process supervisor).
    #[command(hide = true)]
    Run,
    /// Pause the drive loop (RUNNING -> PAUSED).
    Pause,
    /// Resume a paused drive loop (PAUSED -> RUNNING).
    Resume,
    /// Wake a sleeping loop (SLEEPING -> RUNNING).
    Wake,
    /// Inject a message into the running loop: live session if one is
    /// active, otherwise queued for the next cycle.
    Inject {
        message: String,
    },
    /// Request a governance audit on the next cycle boundary, regardless of
    /// the configured interval.
    Audit,
    /// Print the current loop state and counters.
    Loop {
        #[command(subcommand)]
        command: LoopCommands,
    },
}

#[derive(Debug, Subcommand)]
enum LoopCommands {
    /// Print loop state, cycle number, pending-message count, and metrics.
    Status,
    /// Transition to STOPPED and exit the process with the sentinel
    /// restart code (spec §4.1 `requestRestart`, §6 exit code 75).
    RequestRestart,
}

fn config_path(cli_override: Option<&str>) -> String {
    cli_override
        .map(str::to_string)
        .or_else(|| std::env::var("AGORA_CONFIG_PATH").ok())
        .unwrap_or_else(|| "config/default.toml".to_string())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();

    // The daemon re-execs itself with this marker set (spec §6) before the
    // foreground process ever reaches clap parsing, so it's checked first.
    if std::env::var("AGORA_DAEMON_PROCESS").ok().as_deref() == Some("1") {
        let config = AppConfig::load_from(config_path(None))?;
        init_logging(&config);
        return run_foreground(config).await;
    }

    let cli = Cli::parse();
    let config = AppConfig::load_from(config_path(cli.config.as_deref()))?;
    init_logging(&config);

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Start { force } => {
            daemon::daemon_start(&config, force)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Stop => {
            daemon::daemon_stop(&config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status => {
            daemon::daemon_status(&config)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Restart => {
            daemon::daemon_stop(&config).await.ok();
            daemon::daemon_start(&config, true)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run => run_foreground(config).await,
        Commands::Pause => {
            daemon::send_control_command(&config, ControlCommand::Pause).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Resume => {
            daemon::send_control_command(&config, ControlCommand::Resume).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Wake => {
            daemon::send_control_command(&config, ControlCommand::Wake).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Inject { message } => {
            daemon::send_control_command(&config, ControlCommand::Inject { message }).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Audit => {
            daemon::send_control_command(&config, ControlCommand::RequestAudit).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Loop { command } => match command {
            LoopCommands::Status => {
                daemon::send_control_command(&config, ControlCommand::Status).await?;
                Ok(ExitCode::SUCCESS)
            }
            LoopCommands::RequestRestart => {
                daemon::send_control_command(&config, ControlCommand::RequestRestart).await?;
                Ok(ExitCode::SUCCESS)
            }
        },
    }
}

/// Runs the daemon to completion and maps its exit reason to the process
/// exit codes documented in spec §6: 0 graceful, 75 the supervised-restart
/// sentinel. A returned `Err` here is the fatal kind (exit 1, via `main`'s
/// default `Result` handling under `#[tokio::main]`).
async fn run_foreground(config: AppConfig) -> Result<ExitCode> {
    match daemon::run_daemon_process(config).await? {
        ExitReason::Graceful => Ok(ExitCode::SUCCESS),
        ExitReason::Restart => Ok(ExitCode::from(75)),
    }
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_env("AGORA_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(config.telemetry.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
