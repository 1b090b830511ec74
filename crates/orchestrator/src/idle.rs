//! Idle Handler: the detect/propose/evaluate pipeline invoked once the
//! consecutive-idle-cycle threshold is exceeded (spec §4.4).

use crate::roles::{GoalCandidate, Id, Superego};

/// Confidence threshold below which a candidate short-circuits the whole
/// pipeline to `LowConfidencePause`, awaiting human intervention, rather
/// than being silently dropped (spec §4.4 policy variant).
const LOW_CONFIDENCE_THRESHOLD: u8 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleOutcome {
    /// Stage 1 found the agent was not genuinely idle.
    NotIdle,
    /// Stage 2 produced no candidates at all.
    NoGoals,
    /// Stage 3 rejected every candidate.
    AllRejected,
    /// A candidate's confidence fell below the fixed threshold.
    LowConfidencePause,
    /// At least one candidate was approved; a new plan was written with
    /// this many approved goals.
    PlanCreated { approved: usize, titles: Vec<String> },
}

pub struct IdleHandler {
    id: Id,
    superego: Superego,
}

impl IdleHandler {
    pub fn new(id: Id, superego: Superego) -> Self {
        Self { id, superego }
    }

    /// Runs the full three-stage pipeline (spec §4.4).
    pub async fn run(&self) -> anyhow::Result<IdleOutcome> {
        if !self.id.is_truly_idle().await? {
            return Ok(IdleOutcome::NotIdle);
        }

        let candidates = self.id.propose_goals().await?;
        if candidates.is_empty() {
            return Ok(IdleOutcome::NoGoals);
        }

        if let Some(low) = candidates.iter().find(|c| c.confidence.is_some_and(|score| score < LOW_CONFIDENCE_THRESHOLD)) {
            tracing::debug!(title = %low.title, confidence = ?low.confidence, "idle candidate below confidence threshold");
            return Ok(IdleOutcome::LowConfidencePause);
        }

        let approved = self.evaluate_candidates(&candidates).await?;
        if approved.is_empty() {
            return Ok(IdleOutcome::AllRejected);
        }

        Ok(IdleOutcome::PlanCreated { approved: approved.len(), titles: approved })
    }

    async fn evaluate_candidates(&self, candidates: &[GoalCandidate]) -> anyhow::Result<Vec<String>> {
        let mut approved = Vec::new();
        for candidate in candidates {
            if self.superego.evaluate_goal(candidate).await? {
                approved.push(candidate.title.clone());
            }
        }
        Ok(approved)
    }
}

/// Renders a plan body whose "Current Goal" is the approved titles and
/// whose "Tasks" section enumerates each as an unchecked item, each
/// prefixed with the marker the Drive-Quality Tracker later scans for
/// (spec §4.4, §4.6).
pub fn render_plan(today: chrono::NaiveDate, titles: &[String]) -> String {
    let goal_list = titles.iter().map(|t| format!("- {t}")).collect::<Vec<_>>().join("\n");
    let tasks = titles
        .iter()
        .map(|t| format!("- [ ] [ID-generated {}] {}", today.format("%Y-%m-%d"), t))
        .collect::<Vec<_>>()
        .join("\n");
    format!("## Current Goal\n\n{goal_list}\n\n## Tasks\n\n{tasks}\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::{Id, Superego};
    use agora_llm::{InMemorySessionLauncher, Role};
    use std::sync::Arc;

    fn script(json: &str) -> String {
        format!("```json\n{json}\n```")
    }

    #[tokio::test]
    async fn not_idle_short_circuits() {
        let launcher = Arc::new(InMemorySessionLauncher::new());
        launcher.push(Role::Id, script(r#"{"action":"not_idle"}"#)).await;
        let handler = IdleHandler::new(Id::new(launcher.clone()), Superego::new(launcher));
        assert_eq!(handler.run().await.unwrap(), IdleOutcome::NotIdle);
    }

    #[tokio::test]
    async fn no_candidates_yields_no_goals() {
        let launcher = Arc::new(InMemorySessionLauncher::new());
        launcher.push(Role::Id, script(r#"{"action":"idle"}"#)).await;
        launcher.push(Role::Id, script(r#"{"action":"propose_goals","params":{"goals":[]}}"#)).await;
        let handler = IdleHandler::new(Id::new(launcher.clone()), Superego::new(launcher));
        assert_eq!(handler.run().await.unwrap(), IdleOutcome::NoGoals);
    }

    #[tokio::test]
    async fn low_confidence_candidate_pauses() {
        let launcher = Arc::new(InMemorySessionLauncher::new());
        launcher.push(Role::Id, script(r#"{"action":"idle"}"#)).await;
        launcher
            .push(Role::Id, script(r#"{"action":"propose_goals","params":{"goals":[{"title":"risky","confidence":5}]}}"#))
            .await;
        let handler = IdleHandler::new(Id::new(launcher.clone()), Superego::new(launcher));
        assert_eq!(handler.run().await.unwrap(), IdleOutcome::LowConfidencePause);
    }

    #[tokio::test]
    async fn all_rejected_when_superego_rejects_every_candidate() {
        let launcher = Arc::new(InMemorySessionLauncher::new());
        launcher.push(Role::Id, script(r#"{"action":"idle"}"#)).await;
        launcher
            .push(Role::Id, script(r#"{"action":"propose_goals","params":{"goals":[{"title":"x"}]}}"#))
            .await;
        launcher.push(Role::Superego, script(r#"{"action":"reject"}"#)).await;
        let handler = IdleHandler::new(Id::new(launcher.clone()), Superego::new(launcher));
        assert_eq!(handler.run().await.unwrap(), IdleOutcome::AllRejected);
    }

    #[tokio::test]
    async fn approved_candidates_create_plan() {
        let launcher = Arc::new(InMemorySessionLauncher::new());
        launcher.push(Role::Id, script(r#"{"action":"idle"}"#)).await;
        launcher
            .push(Role::Id, script(r#"{"action":"propose_goals","params":{"goals":[{"title":"learn rust"},{"title":"write tests"}]}}"#))
            .await;
        launcher.push(Role::Superego, script(r#"{"action":"approve"}"#)).await;
        launcher.push(Role::Superego, script(r#"{"action":"approve"}"#)).await;
        let handler = IdleHandler::new(Id::new(launcher.clone()), Superego::new(launcher));
        match handler.run().await.unwrap() {
            IdleOutcome::PlanCreated { approved, titles } => {
                assert_eq!(approved, 2);
                assert_eq!(titles, vec!["learn rust".to_string(), "write tests".to_string()]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn plan_rendering_marks_tasks_with_generated_date() {
        let today = chrono::NaiveDate::from_ymd_opt(2026, 7, 28).unwrap();
        let plan = render_plan(today, &["learn rust".to_string()]);
        assert!(plan.contains("[ID-generated 2026-07-28] learn rust"));
        assert!(plan.contains("## Current Goal"));
    }
}
