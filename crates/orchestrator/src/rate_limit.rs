//! Rate-limit reset parsing and the Rate-Limit State Manager (spec §4.1.2,
//! §4.3, §9 open question (b)).

use std::sync::Arc;

use agora_config::RateLimitConfig;
use agora_store::RuntimeDir;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;

/// Three accepted forms, each gated by a recognizable lead-in phrase so the
/// parser never matches an unrelated number in free-text cycle summaries
/// (spec §9(b)):
///
/// - an absolute RFC-3339 timestamp following `resets at`
/// - an integer count of seconds following `retry in`
/// - an integer count of milliseconds following `reset_ms`
///
/// Seconds and milliseconds are disambiguated by lead-in phrase alone, not
/// magnitude, since each has its own dedicated phrase.
struct RateLimitPatterns {
    absolute: Regex,
    seconds: Regex,
    milliseconds: Regex,
}

impl RateLimitPatterns {
    fn new() -> Self {
        Self {
            absolute: Regex::new(r"(?i)resets? at\s+(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2}))")
                .expect("valid regex"),
            seconds: Regex::new(r"(?i)retry in\s+(\d+)\s*(?:s|sec|secs|seconds)?\b").expect("valid regex"),
            milliseconds: Regex::new(r"(?i)reset_ms[:=]?\s*(\d+)").expect("valid regex"),
        }
    }
}

/// Extracts an absolute reset time from a free-text cycle summary. Parsing
/// failures (no recognizable lead-in phrase, or a malformed value behind
/// one) yield `None` — the loop continues normally rather than hibernating
/// on a false positive.
pub fn parse_rate_limit_reset(summary: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let patterns = RateLimitPatterns::new();

    if let Some(captures) = patterns.absolute.captures(summary) {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&captures[1]) {
            return Some(parsed.with_timezone(&Utc));
        }
    }

    if let Some(captures) = patterns.seconds.captures(summary) {
        if let Ok(secs) = captures[1].parse::<i64>() {
            return Some(now + Duration::seconds(secs));
        }
    }

    if let Some(captures) = patterns.milliseconds.captures(summary) {
        if let Ok(millis) = captures[1].parse::<i64>() {
            return Some(now + Duration::milliseconds(millis));
        }
    }

    None
}

/// Persists and restores hibernation context across process restarts
/// (spec §4.3). Wraps the same [`RuntimeDir`] the rest of the daemon's
/// state files live under.
pub struct RateLimitStateManager {
    runtime: Arc<RuntimeDir>,
    config: RateLimitConfig,
}

impl RateLimitStateManager {
    pub fn new(runtime: Arc<RuntimeDir>, config: RateLimitConfig) -> Self {
        Self { runtime, config }
    }

    /// Enters hibernation: reads the plan, writes the restart-context
    /// artifact, banners the plan file's "Current Goal" block, and appends a
    /// progress entry noting the hibernation (spec §4.3 steps 1-4).
    pub fn enter_hibernation(
        &self,
        reset_at: DateTime<Utc>,
        interrupted_task_id: Option<&str>,
        goal_summary: &str,
    ) -> Result<()> {
        let plan = std::fs::read_to_string(&self.config.plan_file).unwrap_or_default();

        let context = format!(
            "# Hibernation\n\nStarted: {}\nExpected reset: {}\nInterrupted task: {}\nGoal: {}\n\n## Plan snapshot\n\n{}\n",
            Utc::now().to_rfc3339(),
            reset_at.to_rfc3339(),
            interrupted_task_id.unwrap_or("none"),
            goal_summary,
            plan,
        );
        self.runtime.write_restart_context(&context)?;
        self.runtime.write_rate_limit_marker(reset_at)?;

        let banner = format!("[RATE LIMITED — resuming at {}]\n{}", reset_at.to_rfc3339(), goal_summary);
        let updated_plan = replace_current_goal(&plan, &banner);
        std::fs::write(&self.config.plan_file, updated_plan)?;

        self.runtime.append_progress_entry(&format!(
            "hibernating until {} (interrupted task: {})",
            reset_at.to_rfc3339(),
            interrupted_task_id.unwrap_or("none"),
        ))?;

        Ok(())
    }

    /// Resolves hibernation back to neutral state once the loop resumes
    /// past the stored reset time.
    pub fn clear_hibernation(&self) -> Result<()> {
        self.runtime.clear_rate_limit_marker()?;
        self.runtime.clear_restart_context()?;
        Ok(())
    }

    /// On process start: reconstructs a pending `rateLimitUntil` from disk
    /// so a restart mid-hibernation resumes the same wait rather than
    /// restarting it (spec §4.3, §8 scenario 2).
    pub fn restore_pending_reset(&self) -> Option<DateTime<Utc>> {
        self.runtime.read_rate_limit_marker()
    }
}

/// Replaces (or prepends) the plan's "Current Goal" section with `banner`.
/// Plan format beyond that single heading is owner-defined and passed
/// through unchanged.
fn replace_current_goal(plan: &str, banner: &str) -> String {
    const HEADING: &str = "## Current Goal";
    if let Some(start) = plan.find(HEADING) {
        let after_heading = start + HEADING.len();
        let rest = &plan[after_heading..];
        let section_end = rest.find("\n## ").map(|i| after_heading + i).unwrap_or(plan.len());
        format!("{}{}\n\n{}\n{}", &plan[..after_heading], "", banner, &plan[section_end..])
    } else {
        format!("{HEADING}\n\n{banner}\n\n{plan}")
    }
}
