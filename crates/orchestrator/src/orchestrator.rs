//! The Loop Orchestrator: state machine, cycle/tick engines, message
//! injection, sleep/wake, the conversation-session gate, and audit
//! scheduling (spec §4.1).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use agora_config::{DriveMode, LoopConfig};
use agora_llm::{Role, SessionLauncher, SessionRequest};
use agora_store::{DriveQualityLog, DriveRating, RuntimeDir};
use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::idle::{render_plan, IdleHandler, IdleOutcome};
use crate::rate_limit::{parse_rate_limit_reset, RateLimitStateManager};
use crate::roles::{DispatchOutcome, Ego, ExecutionStatus, Id, Subconscious, Superego};
use crate::scheduler::SchedulerCoordinator;
use crate::types::{
    combine_pending, ConversationGate, CycleAction, CycleResult, LoopMetrics, LoopState, OrchestratorEvent, PendingMessage,
};
use crate::watchdog::{Watchdog, WatchdogAction};

const EVENT_BROADCAST_CAP: usize = 256;

/// How `run_forever`'s loop exited, so the composition root can choose an
/// exit code (spec §6).
#[derive(Debug)]
pub enum ExitReason {
    Graceful,
    Restart,
}

pub struct Orchestrator {
    config: LoopConfig,
    state: Mutex<LoopState>,
    metrics: Mutex<LoopMetrics>,
    cycle_number: AtomicU64,
    processing: AtomicBool,
    pending: Mutex<VecDeque<PendingMessage>>,
    conversation: Mutex<ConversationGate>,
    tick_requested: AtomicBool,
    audit_requested: AtomicBool,
    audit_running: AtomicBool,
    restart_requested: AtomicBool,
    rate_limit_until: Mutex<Option<chrono::DateTime<Utc>>>,

    /// Held directly (in addition to the role wrappers below) so tick mode
    /// can launch its single end-to-end session without going through a
    /// specialized role (spec §4.1 tick mode, §9 "dynamic dispatch").
    launcher: Arc<dyn SessionLauncher>,
    ego: Ego,
    subconscious: Subconscious,
    superego: Superego,
    idle_handler: IdleHandler,

    scheduler_coordinator: SchedulerCoordinator,
    rate_limit_manager: RateLimitStateManager,
    watchdog: Arc<Watchdog>,
    drive_quality_log: DriveQualityLog,
    runtime: Arc<RuntimeDir>,
    plan_file: String,

    events: broadcast::Sender<OrchestratorEvent>,
    wake_notify: Notify,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: LoopConfig,
        launcher: Arc<dyn SessionLauncher>,
        runtime: Arc<RuntimeDir>,
        drive_quality_log: DriveQualityLog,
        scheduler_coordinator: SchedulerCoordinator,
        rate_limit_manager: RateLimitStateManager,
        watchdog: Arc<Watchdog>,
        plan_file: impl Into<String>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BROADCAST_CAP);
        let ego = Ego::new(launcher.clone());
        let subconscious = Subconscious::new(launcher.clone());
        let superego = Superego::new(launcher.clone());
        let id = Id::new(launcher.clone());
        let idle_handler = IdleHandler::new(id, Superego::new(launcher.clone()));

        Arc::new(Self {
            config,
            state: Mutex::new(LoopState::Stopped),
            metrics: Mutex::new(LoopMetrics::default()),
            cycle_number: AtomicU64::new(0),
            processing: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            conversation: Mutex::new(ConversationGate::Inactive),
            tick_requested: AtomicBool::new(false),
            audit_requested: AtomicBool::new(false),
            audit_running: AtomicBool::new(false),
            restart_requested: AtomicBool::new(false),
            rate_limit_until: Mutex::new(None),
            launcher,
            ego,
            subconscious,
            superego,
            idle_handler,
            scheduler_coordinator,
            rate_limit_manager,
            watchdog,
            drive_quality_log,
            runtime,
            plan_file: plan_file.into(),
            events,
            wake_notify: Notify::new(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.events.send(event);
    }

    pub async fn state(&self) -> LoopState {
        *self.state.lock().await
    }

    pub async fn metrics(&self) -> LoopMetrics {
        self.metrics.lock().await.clone()
    }

    pub async fn pending_message_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn transition(&self, to: LoopState) {
        let mut state = self.state.lock().await;
        let from = *state;
        if from == to {
            return;
        }
        *state = to;
        drop(state);
        info!(%from, %to, "orchestrator state transition");
        self.emit(OrchestratorEvent::StateChanged { from, to });
    }

    // ── public contract (spec §4.1) ──────────────────────────────────────

    /// STOPPED→RUNNING, SLEEPING→RUNNING (wake), or RUNNING-while-rate-limited
    /// (clears the rate limit and wakes the timer). Illegal from PAUSED.
    pub async fn start(&self) -> Result<()> {
        let current = *self.state.lock().await;
        match current {
            LoopState::Stopped | LoopState::Sleeping => {
                self.record_activity();
                self.transition(LoopState::Running).await;
                self.wake_notify.notify_waiters();
                Ok(())
            }
            LoopState::Running => {
                let mut rate_limit = self.rate_limit_until.lock().await;
                if rate_limit.take().is_some() {
                    self.rate_limit_manager.clear_hibernation().ok();
                    self.wake_notify.notify_waiters();
                }
                Ok(())
            }
            LoopState::Paused => Err(anyhow!("cannot start() while paused; call resume() instead")),
        }
    }

    pub async fn pause(&self) -> Result<()> {
        let current = *self.state.lock().await;
        if current != LoopState::Running {
            return Err(anyhow!("pause() is only legal from RUNNING, currently {current}"));
        }
        self.transition(LoopState::Paused).await;
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        let current = *self.state.lock().await;
        if current != LoopState::Paused {
            return Err(anyhow!("resume() is only legal from PAUSED, currently {current}"));
        }
        self.record_activity();
        self.transition(LoopState::Running).await;
        self.wake_notify.notify_waiters();
        Ok(())
    }

    /// Any state → STOPPED. The shutdown grace deadline and best-effort
    /// in-flight session notice are the composition root's responsibility
    /// (it owns the live session, the orchestrator only owns the state).
    pub async fn stop(&self) {
        self.transition(LoopState::Stopped).await;
        self.emit(OrchestratorEvent::Stopped);
        self.wake_notify.notify_waiters();
    }

    /// SLEEPING→RUNNING. Safe to call from any thread/task.
    pub async fn wake(&self) -> Result<()> {
        let current = *self.state.lock().await;
        if current != LoopState::Sleeping {
            return Err(anyhow!("wake() is only legal from SLEEPING, currently {current}"));
        }
        self.record_activity();
        self.transition(LoopState::Running).await;
        self.emit(OrchestratorEvent::Woke);
        self.wake_notify.notify_waiters();
        Ok(())
    }

    pub fn request_audit(&self) {
        self.audit_requested.store(true, Ordering::SeqCst);
    }

    pub fn request_restart(&self) {
        self.restart_requested.store(true, Ordering::SeqCst);
        self.wake_notify.notify_waiters();
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested.load(Ordering::SeqCst)
    }

    /// Forwards to the active session's mid-flight input channel if one is
    /// running conceptually "live" (approximated here by the conversation
    /// gate being active); otherwise appends to the pending queue and wakes
    /// the timer. Returns whether the message was delivered live.
    pub async fn inject_message(&self, body: impl Into<String>) -> bool {
        let body = body.into();
        self.record_activity();

        let mut gate = self.conversation.lock().await;
        if let ConversationGate::Active { queued } = &mut *gate {
            queued.push_back(PendingMessage::new(body));
            self.emit(OrchestratorEvent::MessageInjected { delivered_live: true });
            return true;
        }
        drop(gate);

        self.pending.lock().await.push_back(PendingMessage::new(body));
        self.emit(OrchestratorEvent::MessageInjected { delivered_live: false });
        self.wake_notify.notify_waiters();
        false
    }

    /// Interactive variant (spec §4.1.3): wakes from sleep if needed, then
    /// either injects into the live gate or opens a new conversation
    /// session that runs exclusively until idle-timeout or success.
    pub async fn handle_user_message(&self, body: impl Into<String>) -> Result<String> {
        if *self.state.lock().await == LoopState::Sleeping {
            self.wake().await?;
        }

        let body = body.into();
        let mut gate = self.conversation.lock().await;
        if let ConversationGate::Active { queued } = &mut *gate {
            queued.push_back(PendingMessage::new(body));
            return Ok("queued into active conversation session".to_string());
        }

        *gate = ConversationGate::Active { queued: VecDeque::new() };
        drop(gate);

        self.record_activity();
        let reply = self.run_conversation_session(body).await;

        let mut gate = self.conversation.lock().await;
        let drained = match std::mem::take(&mut *gate) {
            ConversationGate::Active { queued } => queued,
            ConversationGate::Inactive => VecDeque::new(),
        };
        *gate = ConversationGate::Inactive;
        drop(gate);

        for leftover in drained {
            self.pending.lock().await.push_back(leftover);
        }

        if self.tick_requested.swap(false, Ordering::SeqCst) {
            self.wake_notify.notify_waiters();
        }

        reply
    }

    /// Runs a single conversation turn through Ego, bounded by the
    /// conversation idle-timeout (spec §5 cancellation & timeout).
    async fn run_conversation_session(&self, body: String) -> Result<String> {
        let timeout = StdDuration::from_secs(20);
        match tokio::time::timeout(timeout, self.ego.next_dispatch(Some(&body))).await {
            Ok(Ok(Some(dispatch))) => Ok(dispatch.description),
            Ok(Ok(None)) => Ok("Noted.".to_string()),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(anyhow!("conversation session timed out")),
        }
    }

    pub fn record_activity(&self) {
        self.watchdog.record_activity();
    }

    // ── initialization ─────────────────────────────────────────────────

    /// Reconstructs `LoopState::Sleeping` / a pending rate-limit hibernation
    /// from disk, so a restart mid-hibernation resumes the same wait rather
    /// than starting a fresh one (spec §4.3, §8 scenario 2).
    pub async fn initialize_sleeping(&self) {
        if let Some(reset_at) = self.rate_limit_manager.restore_pending_reset() {
            *self.rate_limit_until.lock().await = Some(reset_at);
            self.transition(LoopState::Sleeping).await;
            return;
        }
        if self.runtime.read_sleep_flag() == Some(true) {
            self.transition(LoopState::Sleeping).await;
        }
    }

    // ── drive loop ──────────────────────────────────────────────────────

    /// Runs cycle mode until the orchestrator reaches STOPPED (graceful) or
    /// a restart is requested (spec §4.1, §6 exit codes).
    pub async fn run_forever(self: &Arc<Self>) -> Result<ExitReason> {
        loop {
            if self.restart_requested() {
                return Ok(ExitReason::Restart);
            }

            match self.state().await {
                LoopState::Stopped => return Ok(ExitReason::Graceful),
                LoopState::Paused => {
                    self.wake_notify.notified().await;
                    continue;
                }
                LoopState::Sleeping => {
                    self.sleep_until_wake_or_reset().await;
                    continue;
                }
                LoopState::Running => {
                    let result = match self.config.drive_mode {
                        DriveMode::Cycle => self.run_cycle().await?,
                        DriveMode::Tick => self.run_tick().await?,
                    };
                    debug!(cycle = result.cycle_number, success = result.success, "cycle complete");
                    if self.config.drive_mode == DriveMode::Cycle {
                        self.after_cycle().await?;
                    }

                    tokio::select! {
                        _ = tokio::time::sleep(StdDuration::from_millis(self.config.cycle_delay_ms)) => {}
                        _ = self.wake_notify.notified() => {}
                    }
                }
            }
        }
    }

    async fn sleep_until_wake_or_reset(&self) {
        let until = *self.rate_limit_until.lock().await;
        let wait = match until {
            Some(reset_at) => {
                let delta = reset_at - Utc::now();
                delta.to_std().unwrap_or(StdDuration::from_secs(0))
            }
            None => StdDuration::from_secs(60 * 60),
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                if until.is_some() {
                    self.rate_limit_manager.clear_hibernation().ok();
                    *self.rate_limit_until.lock().await = None;
                    let _ = self.wake().await;
                }
            }
            _ = self.wake_notify.notified() => {}
        }
    }

    /// The authoritative 11-step cycle algorithm (spec §4.1).
    pub async fn run_cycle(self: &Arc<Self>) -> Result<CycleResult> {
        // Step 1: re-entrancy guard.
        if self.processing.swap(true, Ordering::SeqCst) {
            let cycle = self.cycle_number.load(Ordering::SeqCst);
            return Ok(CycleResult::deferred(cycle, "Deferred: a cycle is already processing"));
        }
        let guard = ProcessingGuard { flag: &self.processing };

        // Step 2: conversation gate takes priority over the drive loop.
        if self.conversation.lock().await.is_active() {
            self.tick_requested.store(true, Ordering::SeqCst);
            let cycle = self.cycle_number.load(Ordering::SeqCst);
            drop(guard);
            return Ok(CycleResult::deferred(cycle, "Deferred due to active conversation session"));
        }

        // Step 3.
        let cycle_number = self.cycle_number.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut metrics = self.metrics.lock().await;
            metrics.total_cycles += 1;
        }
        self.record_activity();

        // Step 4: ask Ego for next dispatch.
        let pending_combined = combine_pending(&*self.pending.lock().await);
        let dispatch = self.ego.next_dispatch(pending_combined.as_deref()).await?;

        let result = match dispatch {
            None => {
                self.pending.lock().await.clear();
                let mut metrics = self.metrics.lock().await;
                metrics.record_idle();
                let consecutive = metrics.consecutive_idle_cycles;
                drop(metrics);
                self.emit(OrchestratorEvent::Idle { consecutive });
                CycleResult {
                    cycle_number,
                    action: CycleAction::Idle,
                    task_id: None,
                    success: true,
                    summary: "idle: nothing to dispatch".to_string(),
                }
            }
            Some(task) => self.run_dispatch(cycle_number, task, pending_combined).await?,
        };

        // Step 9.
        self.emit(OrchestratorEvent::CycleComplete { result: result.clone() });
        self.record_activity();

        // Step 10: audits.
        if self.should_audit(cycle_number) {
            self.spawn_audit();
        }

        // Step 11: schedulers.
        self.scheduler_coordinator.run_due().await;

        drop(guard);
        Ok(result)
    }

    async fn run_dispatch(
        &self,
        cycle_number: u64,
        task: DispatchOutcome,
        pending_combined: Option<String>,
    ) -> Result<CycleResult> {
        // Step 5: hand the task (plus any pending messages) to Subconscious.
        let outcome = self.subconscious.execute(&task, pending_combined.as_deref()).await?;
        self.pending.lock().await.clear();

        let success = outcome.status != ExecutionStatus::Failure;
        {
            let mut metrics = self.metrics.lock().await;
            if outcome.status == ExecutionStatus::Success {
                metrics.record_success();
            } else if outcome.status == ExecutionStatus::Failure {
                metrics.record_failure();
            }
        }

        // On success, append any progress/skill/memory update Subconscious
        // returned (spec §4.1 step 5). Silently skipped when none was given.
        if outcome.status == ExecutionStatus::Success {
            if let Some(note) = outcome.progress.as_ref().and_then(|p| p.note.as_deref()) {
                self.runtime.append_progress_entry(&format!("task {}: {}", task.task_id, note)).ok();
            }
        }

        // Step 6: Drive-Quality Tracker.
        if let Some(generated_on) = agora_store::parse_generated_marker(&task.description) {
            let score = heuristic_drive_score(&outcome);
            self.drive_quality_log
                .record(DriveRating {
                    rated_at: Utc::now(),
                    task_id: task.task_id.clone(),
                    generated_on,
                    score,
                    summary: outcome.summary.clone(),
                })
                .await
                .ok();
        }

        // Step 7: Superego audits any proposals Subconscious raised.
        if !outcome.proposals.is_empty() {
            let accepted = self.superego.audit_proposals(&outcome.proposals).await.unwrap_or_default();
            if !accepted.is_empty() {
                self.emit(OrchestratorEvent::AuditCompleted { accepted: accepted.len() });
            }
        }

        // Step 8: Reconsideration, only on success/partial.
        if outcome.status != ExecutionStatus::Failure {
            self.reconsider(&task, &outcome).await?;
        }

        // Rate-limit sensing over the free-text summary.
        if let Some(reset_at) = parse_rate_limit_reset(&outcome.summary, Utc::now()) {
            self.enter_hibernation(reset_at, Some(task.task_id.as_str()), &task.description).await?;
        }

        Ok(CycleResult {
            cycle_number,
            action: CycleAction::Dispatch,
            task_id: Some(task.task_id),
            success,
            summary: outcome.summary,
        })
    }

    /// Tick mode (spec §4.1): builds a single prompt, runs one reasoning
    /// session to completion, and drains pending messages into it via
    /// mid-flight inject before the iteration ends (§9 "streaming mid-flight
    /// inject"). Shares steps 1-3 and 9-11 with the cycle engine; has no
    /// idle/dispatch distinction of its own since a tick always runs the
    /// session through to completion.
    pub async fn run_tick(self: &Arc<Self>) -> Result<CycleResult> {
        if self.processing.swap(true, Ordering::SeqCst) {
            let cycle = self.cycle_number.load(Ordering::SeqCst);
            return Ok(CycleResult::deferred(cycle, "Deferred: a cycle is already processing"));
        }
        let guard = ProcessingGuard { flag: &self.processing };

        if self.conversation.lock().await.is_active() {
            self.tick_requested.store(true, Ordering::SeqCst);
            let cycle = self.cycle_number.load(Ordering::SeqCst);
            drop(guard);
            return Ok(CycleResult::deferred(cycle, "Deferred due to active conversation session"));
        }

        let cycle_number = self.cycle_number.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut metrics = self.metrics.lock().await;
            metrics.total_cycles += 1;
        }
        self.record_activity();

        let prompt = "Continue the agent's ongoing work for this tick.".to_string();
        let handle = self.launcher.launch(SessionRequest::new(Role::Agent, prompt)).await?;

        // Drain whatever arrived since the last tick into the live session's
        // mid-flight input channel, in arrival order (spec §5 ordering).
        let drained: Vec<_> = self.pending.lock().await.drain(..).collect();
        for message in drained {
            let _ = handle.input_tx.send(message.body).await;
        }

        let session_result = handle.join().await;
        let (success, summary) = match session_result {
            Ok(result) => {
                let mut metrics = self.metrics.lock().await;
                metrics.record_success();
                (true, result.content)
            }
            Err(error) => {
                let mut metrics = self.metrics.lock().await;
                metrics.record_failure();
                (false, format!("tick session failed: {error}"))
            }
        };

        let result = CycleResult { cycle_number, action: CycleAction::Dispatch, task_id: None, success, summary };

        self.emit(OrchestratorEvent::CycleComplete { result: result.clone() });
        self.record_activity();

        if let Some(reset_at) = parse_rate_limit_reset(&result.summary, Utc::now()) {
            self.enter_hibernation(reset_at, None, &result.summary).await?;
        }

        if self.should_audit(cycle_number) {
            self.spawn_audit();
        }
        self.scheduler_coordinator.run_due().await;

        drop(guard);
        Ok(result)
    }

    /// Reconsideration (spec §4.1.1): heuristic-first unless LLM evaluation
    /// is always-on; sets the one-shot audit flag on a poor outcome.
    async fn reconsider(&self, task: &DispatchOutcome, outcome: &crate::roles::ExecutionOutcome) -> Result<()> {
        let (quality_score, needs_reassessment) = if self.config.evaluate_outcome_enabled {
            let evaluation = self.superego.evaluate_outcome(task, outcome).await?;
            (evaluation.quality_score, evaluation.needs_reassessment)
        } else {
            let heuristic_score = heuristic_drive_score(outcome) as u16 * 10;
            let heuristic_score = heuristic_score.min(100) as u8;
            if heuristic_score >= self.config.evaluate_outcome_quality_threshold {
                let needs_reassessment = heuristic_score == 0;
                (heuristic_score, needs_reassessment)
            } else {
                let evaluation = self.superego.evaluate_outcome(task, outcome).await?;
                (evaluation.quality_score, evaluation.needs_reassessment)
            }
        };

        self.emit(OrchestratorEvent::Reconsideration { quality_score, needs_reassessment });
        if quality_score < 50 || needs_reassessment {
            self.request_audit();
        }
        Ok(())
    }

    fn should_audit(&self, cycle_number: u64) -> bool {
        let requested = self.audit_requested.swap(false, Ordering::SeqCst);
        let interval = self.config.superego_audit_interval.max(1);
        requested || cycle_number % interval == 0
    }

    /// Fire-and-forget audit: at most one in flight; new requests before
    /// completion are coalesced via the one-shot flag that's already been
    /// cleared by `should_audit` (spec §5 ordering, §8 scenario 3). The next
    /// cycle begins without waiting for this to finish.
    fn spawn_audit(self: &Arc<Self>) {
        if self.audit_running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emit(OrchestratorEvent::AuditStarted);

        let this = self.clone();
        tokio::spawn(async move {
            let snapshot = this.metrics.lock().await.clone();
            let outcome = this.superego.run_governance_audit(&snapshot).await;
            this.metrics.lock().await.superego_audits += 1;
            match outcome {
                Ok(outcome) => this.emit(OrchestratorEvent::AuditCompleted { accepted: outcome.concerns.len() }),
                Err(error) => {
                    warn!(%error, "governance audit failed");
                    this.emit(OrchestratorEvent::AuditFailed { reason: error.to_string() });
                }
            }
            this.audit_running.store(false, Ordering::SeqCst);
        });
    }

    async fn enter_hibernation(&self, reset_at: chrono::DateTime<Utc>, task_id: Option<&str>, description: &str) -> Result<()> {
        {
            let mut rate_limit = self.rate_limit_until.lock().await;
            if rate_limit.is_some() {
                return Ok(());
            }
            *rate_limit = Some(reset_at);
        }
        self.rate_limit_manager.enter_hibernation(reset_at, task_id, description)?;
        self.emit(OrchestratorEvent::RateLimited { until: reset_at });
        self.transition(LoopState::Sleeping).await;
        Ok(())
    }

    /// After-cycle idle escalation (spec §4.1 tail): once the consecutive
    /// idle counter reaches the threshold, run the Idle Handler; otherwise
    /// leave state untouched.
    async fn after_cycle(&self) -> Result<()> {
        let consecutive = self.metrics.lock().await.consecutive_idle_cycles;
        if consecutive < self.config.max_consecutive_idle_cycles {
            return Ok(());
        }

        match self.idle_handler.run().await? {
            IdleOutcome::PlanCreated { approved, titles } => {
                let today = Utc::now().date_naive();
                let plan_body = render_plan(today, &titles);
                std::fs::write(&self.plan_file, plan_body)?;
                self.metrics.lock().await.consecutive_idle_cycles = 0;
                self.emit(OrchestratorEvent::PlanCreated { approved });
            }
            IdleOutcome::NotIdle | IdleOutcome::LowConfidencePause => {
                // Leave state as-is; the next cycle will retry detection.
            }
            IdleOutcome::NoGoals | IdleOutcome::AllRejected => {
                if self.config.idle_sleep_enabled {
                    self.transition(LoopState::Sleeping).await;
                    self.runtime.write_sleep_flag(true).ok();
                } else {
                    self.transition(LoopState::Stopped).await;
                }
            }
        }
        Ok(())
    }
}

/// RAII guard clearing the re-entrancy flag on every exit path, including
/// the `?` early-returns inside `run_cycle`'s dispatch branch.
struct ProcessingGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// A 0-10 heuristic quality score derived from the execution outcome alone,
/// used both by the Drive-Quality Tracker (§4.6) and as Reconsideration's
/// heuristic fallback (§4.1.1) before scaling to the 0-100 range.
fn heuristic_drive_score(outcome: &crate::roles::ExecutionOutcome) -> u8 {
    match outcome.status {
        ExecutionStatus::Success => 8,
        ExecutionStatus::Partial => 5,
        ExecutionStatus::Failure => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_llm::InMemorySessionLauncher;
    use agora_store::DriveQualityLog;
    use std::sync::Arc;

    fn script(json: &str) -> String {
        format!("```json\n{json}\n```")
    }

    async fn test_orchestrator(launcher: Arc<InMemorySessionLauncher>) -> (Arc<Orchestrator>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(RuntimeDir::new(dir.path()));
        let drive_log = DriveQualityLog::new(dir.path().join("ratings.jsonl"));
        let scheduler = SchedulerCoordinator::bundled(agora_config::SchedulerConfig::default(), runtime.clone());
        let rate_limit = RateLimitStateManager::new(
            runtime.clone(),
            agora_config::RateLimitConfig {
                plan_file: dir.path().join("PLAN.md").to_string_lossy().to_string(),
                restart_context_file: "restart_context.md".to_string(),
            },
        );
        let watchdog = Arc::new(Watchdog::new(agora_config::WatchdogConfig::default()));
        let config = LoopConfig { max_consecutive_idle_cycles: 100, ..Default::default() };

        let orchestrator = Orchestrator::new(
            config,
            launcher,
            runtime,
            drive_log,
            scheduler,
            rate_limit,
            watchdog,
            dir.path().join("PLAN.md").to_string_lossy().to_string(),
        );
        (orchestrator, dir)
    }

    #[tokio::test]
    async fn dispatch_cycle_increments_totals_and_resets_idle_counter() {
        let launcher = Arc::new(InMemorySessionLauncher::new());
        launcher
            .push(Role::Ego, script(r#"{"action":"dispatch","params":{"taskId":"T1","description":"do X"}}"#))
            .await;
        launcher.push(Role::Subconscious, script(r#"{"action":"execute","params":{"status":"success"}}"#)).await;
        let (orchestrator, _dir) = test_orchestrator(launcher).await;

        let result = orchestrator.run_cycle().await.unwrap();
        assert_eq!(result.cycle_number, 1);
        assert!(result.success);
        assert_eq!(result.task_id.as_deref(), Some("T1"));

        let metrics = orchestrator.metrics().await;
        assert_eq!(metrics.total_cycles, 1);
        assert_eq!(metrics.consecutive_idle_cycles, 0);
    }

    #[tokio::test]
    async fn idle_cycle_increments_consecutive_counter() {
        let launcher = Arc::new(InMemorySessionLauncher::new());
        launcher.push(Role::Ego, script(r#"{"action":"idle"}"#)).await;
        let (orchestrator, _dir) = test_orchestrator(launcher).await;

        let result = orchestrator.run_cycle().await.unwrap();
        assert_eq!(result.action, CycleAction::Idle);

        let metrics = orchestrator.metrics().await;
        assert_eq!(metrics.idle_cycles, 1);
        assert_eq!(metrics.consecutive_idle_cycles, 1);
    }

    #[tokio::test]
    async fn pending_message_injected_during_dispatch_reaches_subconscious() {
        // Scenario 1 (spec §8): Ego dispatches T1, a message is injected
        // before Subconscious runs, and the pending queue drains to zero.
        let launcher = Arc::new(InMemorySessionLauncher::new());
        launcher
            .push(Role::Ego, script(r#"{"action":"dispatch","params":{"taskId":"T1","description":"do X"}}"#))
            .await;
        launcher.push(Role::Subconscious, script(r#"{"action":"execute","params":{"status":"success"}}"#)).await;
        let (orchestrator, _dir) = test_orchestrator(launcher).await;

        orchestrator.inject_message("hi").await;
        assert_eq!(orchestrator.pending_message_count().await, 1);

        let result = orchestrator.run_cycle().await.unwrap();
        assert_eq!(result.cycle_number, 1);
        assert!(result.success);
        assert_eq!(orchestrator.pending_message_count().await, 0);
    }

    #[tokio::test]
    async fn successful_dispatch_appends_progress_note() {
        let launcher = Arc::new(InMemorySessionLauncher::new());
        launcher
            .push(Role::Ego, script(r#"{"action":"dispatch","params":{"taskId":"T1","description":"do X"}}"#))
            .await;
        launcher
            .push(
                Role::Subconscious,
                script(r#"{"action":"execute","params":{"status":"success","progress":{"note":"shipped the thing"}}}"#),
            )
            .await;
        let (orchestrator, dir) = test_orchestrator(launcher).await;

        orchestrator.run_cycle().await.unwrap();

        let runtime = RuntimeDir::new(dir.path());
        let lines = runtime.read_progress_log();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("task T1: shipped the thing"));
    }

    #[tokio::test]
    async fn reentrant_cycle_call_is_a_no_op() {
        let launcher = Arc::new(InMemorySessionLauncher::new());
        let (orchestrator, _dir) = test_orchestrator(launcher).await;
        orchestrator.processing.store(true, Ordering::SeqCst);

        let result = orchestrator.run_cycle().await.unwrap();
        assert!(result.summary.starts_with("Deferred"));
        assert_eq!(result.cycle_number, 0);
    }

    #[tokio::test]
    async fn conversation_gate_defers_cycle_and_requests_tick() {
        let launcher = Arc::new(InMemorySessionLauncher::new());
        let (orchestrator, _dir) = test_orchestrator(launcher).await;
        *orchestrator.conversation.lock().await = ConversationGate::Active { queued: VecDeque::new() };

        let result = orchestrator.run_cycle().await.unwrap();
        assert_eq!(result.summary, "Deferred due to active conversation session");
        assert!(orchestrator.tick_requested.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn rate_limit_summary_triggers_hibernation() {
        let launcher = Arc::new(InMemorySessionLauncher::new());
        launcher
            .push(Role::Ego, script(r#"{"action":"dispatch","params":{"taskId":"T1","description":"do X"}}"#))
            .await;
        launcher
            .push(
                Role::Subconscious,
                script(r#"{"action":"execute","params":{"status":"failure"},"reply":"rate limit resets at 2099-01-01T00:00:00Z"}"#),
            )
            .await;
        let (orchestrator, _dir) = test_orchestrator(launcher).await;

        orchestrator.run_cycle().await.unwrap();
        assert_eq!(orchestrator.state().await, LoopState::Sleeping);
        assert!(orchestrator.rate_limit_until.lock().await.is_some());
    }

    #[tokio::test]
    async fn start_from_paused_is_rejected() {
        let launcher = Arc::new(InMemorySessionLauncher::new());
        let (orchestrator, _dir) = test_orchestrator(launcher).await;
        orchestrator.start().await.unwrap();
        orchestrator.pause().await.unwrap();
        assert!(orchestrator.start().await.is_err());
    }

    #[tokio::test]
    async fn stop_is_legal_from_any_state() {
        let launcher = Arc::new(InMemorySessionLauncher::new());
        let (orchestrator, _dir) = test_orchestrator(launcher).await;
        orchestrator.stop().await;
        assert_eq!(orchestrator.state().await, LoopState::Stopped);
    }

    #[tokio::test]
    async fn tick_drains_pending_messages_into_the_live_session() {
        let launcher = Arc::new(InMemorySessionLauncher::new());
        launcher.push(Role::Agent, "did some things").await;
        let (orchestrator, _dir) = test_orchestrator(launcher).await;

        orchestrator.inject_message("hi").await;
        assert_eq!(orchestrator.pending_message_count().await, 1);

        let result = orchestrator.run_tick().await.unwrap();
        assert_eq!(result.cycle_number, 1);
        assert!(result.success);
        assert_eq!(result.summary, "did some things");
        assert_eq!(orchestrator.pending_message_count().await, 0);
    }

    #[tokio::test]
    async fn reentrant_tick_call_is_a_no_op() {
        let launcher = Arc::new(InMemorySessionLauncher::new());
        let (orchestrator, _dir) = test_orchestrator(launcher).await;
        orchestrator.processing.store(true, Ordering::SeqCst);

        let result = orchestrator.run_tick().await.unwrap();
        assert!(result.summary.starts_with("Deferred"));
    }
}
