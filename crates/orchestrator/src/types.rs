//! Core data model: loop state, metrics, cycle results, and the structured
//! event taxonomy the orchestrator emits (spec §3, §7).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The orchestrator's single source of truth for "what is it doing right
/// now". Transitions are constrained to those the orchestrator's public
/// contract exposes (`start`/`pause`/`resume`/`stop`/`wake`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    Stopped,
    Running,
    Paused,
    Sleeping,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            LoopState::Stopped => "stopped",
            LoopState::Running => "running",
            LoopState::Paused => "paused",
            LoopState::Sleeping => "sleeping",
        };
        f.write_str(label)
    }
}

/// Running counters. `consecutive_idle_cycles` resets to zero on any
/// non-idle cycle or successful plan creation (I2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopMetrics {
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub idle_cycles: u64,
    pub consecutive_idle_cycles: u32,
    pub superego_audits: u64,
}

impl LoopMetrics {
    pub fn record_idle(&mut self) {
        self.idle_cycles += 1;
        self.consecutive_idle_cycles += 1;
    }

    pub fn record_success(&mut self) {
        self.successful_cycles += 1;
        self.consecutive_idle_cycles = 0;
    }

    pub fn record_failure(&mut self) {
        self.failed_cycles += 1;
    }
}

/// What a single cycle did (spec §3, §8 scenario 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleAction {
    Dispatch,
    Idle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleResult {
    pub cycle_number: u64,
    pub action: CycleAction,
    pub task_id: Option<String>,
    pub success: bool,
    pub summary: String,
}

impl CycleResult {
    /// The no-op result returned when the engine is re-entered while a
    /// cycle is already processing, or while the conversation gate holds
    /// the drive loop (spec §4.1 steps 1-2, §8 scenario 6).
    pub fn deferred(cycle_number: u64, reason: &str) -> Self {
        Self {
            cycle_number,
            action: CycleAction::Idle,
            task_id: None,
            success: true,
            summary: reason.to_string(),
        }
    }
}

/// An opaque message awaiting delivery into a live session, or drained into
/// the next cycle's dispatch prompt when none is active.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub body: String,
    pub arrived_at: DateTime<Utc>,
}

impl PendingMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into(), arrived_at: Utc::now() }
    }
}

/// Joins a queue of pending messages into the single combined prompt the
/// cycle engine hands to a role alongside its own prompt (spec §5 ordering
/// guarantees: arrival order, `\n\n---\n\n` separator).
pub fn combine_pending(messages: &VecDeque<PendingMessage>) -> Option<String> {
    if messages.is_empty() {
        return None;
    }
    Some(messages.iter().map(|m| m.body.as_str()).collect::<Vec<_>>().join("\n\n---\n\n"))
}

/// The conversation-session gate (I7): serializes interactive chat against
/// the drive loop. While `Active`, the cycle/tick engine defers; messages
/// that arrive mid-conversation are FIFO-queued rather than dropped.
#[derive(Debug, Default)]
pub enum ConversationGate {
    #[default]
    Inactive,
    Active {
        queued: VecDeque<PendingMessage>,
    },
}

impl ConversationGate {
    pub fn is_active(&self) -> bool {
        matches!(self, ConversationGate::Active { .. })
    }
}

/// Structured events the loop emits on its WebSocket event sink for
/// downstream UIs to consume (spec §7: "state changes, cycle completion,
/// idle, audit, injection, reconsideration, etc.").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    StateChanged { from: LoopState, to: LoopState },
    CycleComplete { result: CycleResult },
    Idle { consecutive: u32 },
    AuditStarted,
    AuditCompleted { accepted: usize },
    AuditFailed { reason: String },
    MessageInjected { delivered_live: bool },
    Reconsideration { quality_score: u8, needs_reassessment: bool },
    RateLimited { until: DateTime<Utc> },
    Woke,
    PlanCreated { approved: usize },
    Stopped,
}
