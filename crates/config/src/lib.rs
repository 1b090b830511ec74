use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// The orchestrator's two interchangeable drive modes (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveMode {
    /// Dispatch one task per iteration through Ego/Subconscious.
    Cycle,
    /// Build a single prompt and run one reasoning session to completion
    /// per iteration, draining pending messages in via mid-flight inject.
    Tick,
}

impl Default for DriveMode {
    fn default() -> Self {
        DriveMode::Cycle
    }
}

/// Knobs for the Loop Orchestrator's cycle/tick engine (spec §3, §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub drive_mode: DriveMode,
    pub cycle_delay_ms: u64,
    pub superego_audit_interval: u64,
    pub max_consecutive_idle_cycles: u32,
    pub idle_sleep_enabled: bool,
    pub evaluate_outcome_enabled: bool,
    /// 0-100. Below this, Reconsideration falls back to the LLM evaluator.
    pub evaluate_outcome_quality_threshold: u8,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            drive_mode: DriveMode::Cycle,
            cycle_delay_ms: 3_000,
            superego_audit_interval: 10,
            max_consecutive_idle_cycles: 5,
            idle_sleep_enabled: true,
            evaluate_outcome_enabled: false,
            evaluate_outcome_quality_threshold: 60,
        }
    }
}

/// Per-job intervals for the bundled scheduler set (spec §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub backup_interval_minutes: u64,
    pub validation_interval_minutes: u64,
    pub metrics_interval_minutes: u64,
    pub health_check_interval_minutes: u64,
    pub email_digest_interval_minutes: u64,
    pub email_digest_enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backup_interval_minutes: 60,
            validation_interval_minutes: 30,
            metrics_interval_minutes: 5,
            health_check_interval_minutes: 5,
            email_digest_interval_minutes: 24 * 60,
            email_digest_enabled: false,
        }
    }
}

/// Artifact locations used by the Rate-Limit State Manager (spec §4.3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub plan_file: String,
    pub restart_context_file: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            plan_file: "PLAN.md".to_string(),
            restart_context_file: "restart_context.md".to_string(),
        }
    }
}

/// Watchdog stall-detection thresholds (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub poll_interval_secs: u64,
    pub stall_threshold_secs: u64,
    /// None disables the force-restart escalation entirely.
    pub force_restart_threshold_secs: Option<u64>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5 * 60,
            stall_threshold_secs: 20 * 60,
            force_restart_threshold_secs: Some(10 * 60),
        }
    }
}

/// Relay bind/auth knobs (spec §4.8, §6). `jwt_secret` is deliberately not
/// persisted via `save_to` in practice — it is overlaid from
/// `AGORA_RELAY_JWT_SECRET` at load time, same as the teacher overlays
/// `OLLAMA_BASE_URL` onto `LlmConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_host: String,
    pub ws_port: u16,
    pub jwt_secret: Option<String>,
    pub jwt_expiry_seconds: u64,
    pub buffer_capacity: usize,
    pub origin_allowlist: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            ws_port: 8787,
            jwt_secret: None,
            jwt_expiry_seconds: 3_600,
            buffer_capacity: 100,
            origin_allowlist: vec!["localhost".to_string(), "127.0.0.1".to_string()],
        }
    }
}

/// Placeholder for forward-compatible broker tuning; the bus itself has no
/// knobs today beyond registration order (spec §4.7).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BrokerConfig {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: String,
    pub runtime_dir: String,
    pub shutdown_grace_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/agora.sock".to_string(),
            runtime_dir: ".agora/runtime".to_string(),
            shutdown_grace_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub r#loop: LoopConfig,
    pub scheduler: SchedulerConfig,
    pub rate_limit: RateLimitConfig,
    pub watchdog: WatchdogConfig,
    pub relay: RelayConfig,
    pub broker: BrokerConfig,
    pub telemetry: TelemetryConfig,
    pub daemon: DaemonConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(secret) = env::var("AGORA_RELAY_JWT_SECRET") {
            if !secret.is_empty() {
                config.relay.jwt_secret = Some(secret);
            }
        }
        if let Ok(expiry) = env::var("AGORA_JWT_EXPIRY_SECONDS") {
            if let Ok(parsed) = expiry.parse() {
                config.relay.jwt_expiry_seconds = parsed;
            }
        }
        if let Ok(port) = env::var("PORT") {
            if let Ok(parsed) = port.parse() {
                config.relay.ws_port = parsed;
            }
        }
        if let Ok(level) = env::var("AGORA_LOG") {
            if !level.is_empty() {
                config.telemetry.log_level = level;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// REST surface of the relay is disabled entirely when no secret is
    /// configured (spec §6): `AGORA_RELAY_JWT_SECRET` is required to enable it.
    pub fn relay_rest_enabled(&self) -> bool {
        self.relay.jwt_secret.as_deref().is_some_and(|s| !s.is_empty())
    }

    pub fn rest_port(&self) -> u16 {
        self.relay.ws_port + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_need_no_file() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.r#loop.max_consecutive_idle_cycles, 5);
        assert!(!cfg.relay_rest_enabled());
    }

    #[test]
    fn load_from_missing_file_falls_back_to_default() {
        let cfg = AppConfig::load_from("/nonexistent/path/does-not-exist.toml").unwrap();
        assert_eq!(cfg.daemon.socket_path, "/tmp/agora.sock");
    }

    #[test]
    fn load_from_malformed_file_propagates_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "not = [valid toml").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("default.toml");
        let mut cfg = AppConfig::default();
        cfg.r#loop.cycle_delay_ms = 1234;
        cfg.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.r#loop.cycle_delay_ms, 1234);
    }
}
