//! Thin role wrappers around the opaque reasoning session (spec §1, §4.1,
//! §9 "Dynamic dispatch"). Each wrapper owns no state beyond the shared
//! [`SessionLauncher`]; the orchestrator never inspects how a role arrives
//! at its answer, only the structured fields it emits.

use std::sync::Arc;

use agora_llm::{extract_json_output, Role, SessionLauncher, SessionRequest, StructuredOutput};
use anyhow::Result;
use serde::Deserialize;

/// What Ego decided to dispatch next, or nothing (idle).
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub task_id: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    Failure,
    Partial,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProgressUpdate {
    #[serde(default)]
    pub note: Option<String>,
}

/// A change Subconscious or Id proposes for Superego to accept or reject.
#[derive(Debug, Clone, Deserialize)]
pub struct Proposal {
    pub title: String,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub summary: String,
    pub proposals: Vec<Proposal>,
    pub progress: Option<ProgressUpdate>,
}

#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    /// 0-100.
    pub quality_score: u8,
    pub needs_reassessment: bool,
}

/// A goal candidate Id proposes during the idle pipeline (spec §4.4).
#[derive(Debug, Clone, Deserialize)]
pub struct GoalCandidate {
    pub title: String,
    #[serde(default)]
    pub detail: Option<String>,
    /// 0-100. Only consulted by the confidence-gated policy variant.
    #[serde(default)]
    pub confidence: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct DispatchParams {
    #[serde(default, rename = "taskId")]
    task_id: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ExecutionParams {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    proposals: Vec<Proposal>,
    #[serde(default)]
    progress: Option<ProgressUpdate>,
}

#[derive(Debug, Deserialize, Default)]
struct EvaluationParams {
    #[serde(default, rename = "qualityScore")]
    quality_score: Option<u8>,
    #[serde(default, rename = "needsReassessment")]
    needs_reassessment: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct GoalsParams {
    #[serde(default)]
    goals: Vec<GoalCandidate>,
}

#[derive(Debug, Deserialize, Default)]
struct GovernanceParams {
    #[serde(default)]
    concerns: Vec<String>,
}

/// What a periodic governance audit (spec §4.1 step 10) turned up.
#[derive(Debug, Clone, Default)]
pub struct GovernanceAuditOutcome {
    pub concerns: Vec<String>,
}

async fn run(launcher: &dyn SessionLauncher, role: Role, prompt: String) -> Result<StructuredOutput> {
    let handle = launcher.launch(SessionRequest::new(role, prompt)).await?;
    let result = handle.join().await?;
    Ok(extract_json_output::<StructuredOutput>(&result.content).unwrap_or_default())
}

/// Decides what to dispatch next each cycle, or that there is nothing to do.
pub struct Ego {
    launcher: Arc<dyn SessionLauncher>,
}

impl Ego {
    pub fn new(launcher: Arc<dyn SessionLauncher>) -> Self {
        Self { launcher }
    }

    /// `pending` is the combined text of any messages queued since the last
    /// cycle, folded into the dispatch prompt per the ordering guarantee in
    /// spec §5.
    pub async fn next_dispatch(&self, pending: Option<&str>) -> Result<Option<DispatchOutcome>> {
        let mut prompt = "What should be dispatched next? Respond with a fenced json block \
            containing {\"action\":\"dispatch\",\"params\":{\"taskId\":...,\"description\":...}} \
            or {\"action\":\"idle\"} if there is nothing to do."
            .to_string();
        if let Some(pending) = pending {
            prompt.push_str("\n\n---\n\n");
            prompt.push_str(pending);
        }

        let output = run(self.launcher.as_ref(), Role::Ego, prompt).await?;
        if output.action.as_deref() != Some("dispatch") {
            return Ok(None);
        }

        let params: DispatchParams = serde_json::from_value(output.params).unwrap_or_default();
        let (Some(task_id), Some(description)) = (params.task_id, params.description) else {
            return Ok(None);
        };
        Ok(Some(DispatchOutcome { task_id, description }))
    }
}

/// Carries out a dispatched task.
pub struct Subconscious {
    launcher: Arc<dyn SessionLauncher>,
}

impl Subconscious {
    pub fn new(launcher: Arc<dyn SessionLauncher>) -> Self {
        Self { launcher }
    }

    pub async fn execute(&self, task: &DispatchOutcome, pending: Option<&str>) -> Result<ExecutionOutcome> {
        let mut prompt = format!(
            "Execute task {}: {}\n\nRespond with a fenced json block containing \
            {{\"action\":\"execute\",\"params\":{{\"status\":\"success|failure|partial\",\"proposals\":[...]}}}}.",
            task.task_id, task.description
        );
        if let Some(pending) = pending {
            prompt.push_str("\n\n---\n\n");
            prompt.push_str(pending);
        }

        let output = run(self.launcher.as_ref(), Role::Subconscious, prompt).await?;
        let params: ExecutionParams = serde_json::from_value(output.params).unwrap_or_default();
        let status = match params.status.as_deref() {
            Some("success") => ExecutionStatus::Success,
            Some("partial") => ExecutionStatus::Partial,
            _ => ExecutionStatus::Failure,
        };
        let summary = output.reply.unwrap_or_else(|| format!("task {} completed with no summary", task.task_id));

        Ok(ExecutionOutcome { status, summary, proposals: params.proposals, progress: params.progress })
    }
}

/// Audits proposals and outcomes.
pub struct Superego {
    launcher: Arc<dyn SessionLauncher>,
}

impl Superego {
    pub fn new(launcher: Arc<dyn SessionLauncher>) -> Self {
        Self { launcher }
    }

    /// Shares this role's launcher with another role instance (e.g. the
    /// idle handler's own `Superego`) without requiring callers to thread
    /// a second `Arc` through construction.
    pub(crate) fn launcher_handle(&self) -> Arc<dyn SessionLauncher> {
        self.launcher.clone()
    }

    /// LLM-based Reconsideration evaluator (spec §4.1.1).
    pub async fn evaluate_outcome(&self, task: &DispatchOutcome, outcome: &ExecutionOutcome) -> Result<EvaluationOutcome> {
        let prompt = format!(
            "Evaluate the outcome of task {} ({}): {}\n\nRespond with a fenced json block containing \
            {{\"action\":\"evaluate\",\"params\":{{\"qualityScore\":0-100,\"needsReassessment\":bool}}}}.",
            task.task_id, task.description, outcome.summary
        );
        let output = run(self.launcher.as_ref(), Role::Superego, prompt).await?;
        let params: EvaluationParams = serde_json::from_value(output.params).unwrap_or_default();
        Ok(EvaluationOutcome {
            quality_score: params.quality_score.unwrap_or(0),
            needs_reassessment: params.needs_reassessment.unwrap_or(false),
        })
    }

    /// Runs the audit step: reviews subconscious-raised proposals and
    /// returns the accepted subset (spec §4.1 step 7).
    pub async fn audit_proposals(&self, proposals: &[Proposal]) -> Result<Vec<Proposal>> {
        if proposals.is_empty() {
            return Ok(Vec::new());
        }
        let titles: Vec<&str> = proposals.iter().map(|p| p.title.as_str()).collect();
        let prompt = format!(
            "Review these proposals and accept or reject each: {}\n\nRespond with a fenced json block \
            containing {{\"action\":\"audit\",\"params\":{{\"accepted\":[\"title\", ...]}}}}.",
            titles.join(", ")
        );
        let output = run(self.launcher.as_ref(), Role::Superego, prompt).await?;
        let accepted: Vec<String> =
            output.params.get("accepted").and_then(|v| serde_json::from_value(v.clone()).ok()).unwrap_or_default();
        Ok(proposals.iter().filter(|p| accepted.contains(&p.title)).cloned().collect())
    }

    /// Periodic governance audit (spec §4.1 step 10): a broader self-check
    /// independent of any single task's proposals, run fire-and-forget off
    /// the cycle's critical path.
    pub async fn run_governance_audit(&self, metrics: &crate::types::LoopMetrics) -> Result<GovernanceAuditOutcome> {
        let prompt = format!(
            "Perform a governance audit of recent agent behavior. Totals so far: {} cycles, \
            {} successful, {} failed, {} idle. Respond with a fenced json block containing \
            {{\"action\":\"audit_governance\",\"params\":{{\"concerns\":[...]}}}}.",
            metrics.total_cycles, metrics.successful_cycles, metrics.failed_cycles, metrics.idle_cycles
        );
        let output = run(self.launcher.as_ref(), Role::Superego, prompt).await?;
        let params: GovernanceParams = serde_json::from_value(output.params).unwrap_or_default();
        Ok(GovernanceAuditOutcome { concerns: params.concerns })
    }

    /// Evaluates a single idle-generated goal candidate for inclusion in a
    /// new plan (spec §4.4 stage 3).
    pub async fn evaluate_goal(&self, candidate: &GoalCandidate) -> Result<bool> {
        let prompt = format!(
            "Should this goal be adopted: \"{}\"{}? Respond with a fenced json block containing \
            {{\"action\":\"approve\"}} or {{\"action\":\"reject\"}}.",
            candidate.title,
            candidate.detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default(),
        );
        let output = run(self.launcher.as_ref(), Role::Superego, prompt).await?;
        Ok(output.action.as_deref() == Some("approve"))
    }
}

/// Generates goal candidates when the orchestrator has been idle too long.
pub struct Id {
    launcher: Arc<dyn SessionLauncher>,
}

impl Id {
    pub fn new(launcher: Arc<dyn SessionLauncher>) -> Self {
        Self { launcher }
    }

    /// Stage 1: is the agent truly idle, or just between dispatches?
    pub async fn is_truly_idle(&self) -> Result<bool> {
        let prompt = "Is there genuinely nothing left to do? Respond with a fenced json block \
            containing {\"action\":\"idle\"} or {\"action\":\"not_idle\"}."
            .to_string();
        let output = run(self.launcher.as_ref(), Role::Id, prompt).await?;
        Ok(output.action.as_deref() == Some("idle"))
    }

    /// Stage 2: propose new goal candidates.
    pub async fn propose_goals(&self) -> Result<Vec<GoalCandidate>> {
        let prompt = "Propose new goals for this agent to pursue. Respond with a fenced json block \
            containing {\"action\":\"propose_goals\",\"params\":{\"goals\":[{\"title\":...,\"confidence\":0-100}]}}."
            .to_string();
        let output = run(self.launcher.as_ref(), Role::Id, prompt).await?;
        let params: GoalsParams = serde_json::from_value(output.params).unwrap_or_default();
        Ok(params.goals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_llm::InMemorySessionLauncher;

    fn script(json: &str) -> String {
        format!("```json\n{json}\n```")
    }

    #[tokio::test]
    async fn ego_returns_none_when_idle() {
        let launcher = Arc::new(InMemorySessionLauncher::new());
        launcher.push(Role::Ego, script(r#"{"action":"idle"}"#)).await;
        let ego = Ego::new(launcher);
        assert!(ego.next_dispatch(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ego_parses_dispatch() {
        let launcher = Arc::new(InMemorySessionLauncher::new());
        launcher
            .push(Role::Ego, script(r#"{"action":"dispatch","params":{"taskId":"T1","description":"do X"}}"#))
            .await;
        let ego = Ego::new(launcher);
        let dispatch = ego.next_dispatch(None).await.unwrap().unwrap();
        assert_eq!(dispatch.task_id, "T1");
        assert_eq!(dispatch.description, "do X");
    }

    #[tokio::test]
    async fn subconscious_defaults_to_failure_on_unknown_status() {
        let launcher = Arc::new(InMemorySessionLauncher::new());
        launcher.push(Role::Subconscious, script(r#"{"action":"execute","params":{}}"#)).await;
        let sub = Subconscious::new(launcher);
        let task = DispatchOutcome { task_id: "T1".to_string(), description: "x".to_string() };
        let outcome = sub.execute(&task, None).await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Failure);
    }

    #[tokio::test]
    async fn superego_accepts_matching_titles_only() {
        let launcher = Arc::new(InMemorySessionLauncher::new());
        launcher
            .push(Role::Superego, script(r#"{"action":"audit","params":{"accepted":["keep this"]}}"#))
            .await;
        let superego = Superego::new(launcher);
        let proposals = vec![
            Proposal { title: "keep this".to_string(), detail: None },
            Proposal { title: "drop this".to_string(), detail: None },
        ];
        let accepted = superego.audit_proposals(&proposals).await.unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].title, "keep this");
    }

    #[tokio::test]
    async fn superego_governance_audit_parses_concerns() {
        let launcher = Arc::new(InMemorySessionLauncher::new());
        launcher
            .push(Role::Superego, script(r#"{"action":"audit_governance","params":{"concerns":["stalled task backlog"]}}"#))
            .await;
        let superego = Superego::new(launcher);
        let metrics = crate::types::LoopMetrics::default();
        let outcome = superego.run_governance_audit(&metrics).await.unwrap();
        assert_eq!(outcome.concerns, vec!["stalled task backlog".to_string()]);
    }

    #[tokio::test]
    async fn id_proposes_goals_with_confidence() {
        let launcher = Arc::new(InMemorySessionLauncher::new());
        launcher
            .push(Role::Id, script(r#"{"action":"propose_goals","params":{"goals":[{"title":"learn rust","confidence":80}]}}"#))
            .await;
        let id = Id::new(launcher);
        let goals = id.propose_goals().await.unwrap();
        assert_eq!(goals.len(), 1);
        assert_eq!(goals[0].confidence, Some(80));
    }
}
