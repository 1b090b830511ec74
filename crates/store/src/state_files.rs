use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

/// The plain-text and marker files persisted under a daemon's `runtime_dir`
/// (§6): sleep flag, rate-limit marker, envelope dedup set, per-scheduler
/// last-run timestamps, and the restart-context markdown produced by the
/// Rate-Limit State Manager (§4.3).
#[derive(Debug, Clone)]
pub struct RuntimeDir {
    root: PathBuf,
}

const NEUTRAL_RESTART_CONTEXT: &str = "_No active hibernation. Nothing to resume._\n";

impl RuntimeDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sleep_flag_path(&self) -> PathBuf {
        self.root.join("sleep.flag")
    }

    fn rate_limit_marker_path(&self) -> PathBuf {
        self.root.join("rate_limit.marker")
    }

    fn dedup_set_path(&self) -> PathBuf {
        self.root.join("envelope_dedup.json")
    }

    fn scheduler_last_run_path(&self, scheduler: &str) -> PathBuf {
        self.root.join("schedulers").join(format!("{scheduler}.last_run"))
    }

    fn restart_context_path(&self) -> PathBuf {
        self.root.join("restart_context.md")
    }

    fn progress_log_path(&self) -> PathBuf {
        self.root.join("progress.log")
    }

    fn ensure_dir(dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))
    }

    // ── sleep flag ──────────────────────────────────────────────────────────

    pub fn write_sleep_flag(&self, sleeping: bool) -> Result<()> {
        Self::ensure_dir(&self.root)?;
        let content = if sleeping { "sleeping" } else { "awake" };
        std::fs::write(self.sleep_flag_path(), content)?;
        Ok(())
    }

    /// `None` when no flag has ever been written (fresh install).
    pub fn read_sleep_flag(&self) -> Option<bool> {
        let raw = std::fs::read_to_string(self.sleep_flag_path()).ok()?;
        match raw.trim() {
            "sleeping" => Some(true),
            "awake" => Some(false),
            _ => None,
        }
    }

    // ── rate-limit marker ───────────────────────────────────────────────────

    pub fn write_rate_limit_marker(&self, until: DateTime<Utc>) -> Result<()> {
        Self::ensure_dir(&self.root)?;
        std::fs::write(self.rate_limit_marker_path(), until.to_rfc3339())?;
        Ok(())
    }

    pub fn read_rate_limit_marker(&self) -> Option<DateTime<Utc>> {
        let raw = std::fs::read_to_string(self.rate_limit_marker_path()).ok()?;
        DateTime::parse_from_rfc3339(raw.trim()).ok().map(|dt| dt.with_timezone(&Utc))
    }

    pub fn clear_rate_limit_marker(&self) -> Result<()> {
        let path = self.rate_limit_marker_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    // ── envelope dedup set ──────────────────────────────────────────────────

    pub fn load_dedup_set(&self) -> HashSet<String> {
        std::fs::read_to_string(self.dedup_set_path())
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn save_dedup_set(&self, ids: &HashSet<String>) -> Result<()> {
        Self::ensure_dir(&self.root)?;
        let rendered = serde_json::to_string(ids)?;
        std::fs::write(self.dedup_set_path(), rendered)?;
        Ok(())
    }

    // ── per-scheduler last-run ──────────────────────────────────────────────

    pub fn read_scheduler_last_run(&self, scheduler: &str) -> Option<DateTime<Utc>> {
        let raw = std::fs::read_to_string(self.scheduler_last_run_path(scheduler)).ok()?;
        DateTime::parse_from_rfc3339(raw.trim()).ok().map(|dt| dt.with_timezone(&Utc))
    }

    pub fn write_scheduler_last_run(&self, scheduler: &str, at: DateTime<Utc>) -> Result<()> {
        let path = self.scheduler_last_run_path(scheduler);
        if let Some(parent) = path.parent() {
            Self::ensure_dir(parent)?;
        }
        std::fs::write(path, at.to_rfc3339())?;
        Ok(())
    }

    // ── restart context ──────────────────────────────────────────────────────

    pub fn write_restart_context(&self, markdown: &str) -> Result<()> {
        Self::ensure_dir(&self.root)?;
        std::fs::write(self.restart_context_path(), markdown)?;
        Ok(())
    }

    pub fn read_restart_context(&self) -> Option<String> {
        std::fs::read_to_string(self.restart_context_path()).ok()
    }

    /// Resets the restart-context artifact to neutral content once
    /// hibernation has resolved normally.
    pub fn clear_restart_context(&self) -> Result<()> {
        self.write_restart_context(NEUTRAL_RESTART_CONTEXT)
    }

    // ── progress log ──────────────────────────────────────────────────────

    /// Appends one timestamped line to the progress log: the substrate
    /// channel §4.1 step 5's "append progress/skill/memory updates" and
    /// §4.3 step 4's "appends a progress entry noting the hibernation" both
    /// write into.
    pub fn append_progress_entry(&self, note: &str) -> Result<()> {
        use std::io::Write;
        Self::ensure_dir(&self.root)?;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(self.progress_log_path())?;
        writeln!(file, "{} {}", Utc::now().to_rfc3339(), note)?;
        Ok(())
    }

    pub fn read_progress_log(&self) -> Vec<String> {
        std::fs::read_to_string(self.progress_log_path())
            .map(|raw| raw.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn sleep_flag_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = RuntimeDir::new(dir.path());
        assert_eq!(runtime.read_sleep_flag(), None);

        runtime.write_sleep_flag(true).unwrap();
        assert_eq!(runtime.read_sleep_flag(), Some(true));

        runtime.write_sleep_flag(false).unwrap();
        assert_eq!(runtime.read_sleep_flag(), Some(false));
    }

    #[test]
    fn rate_limit_marker_round_trips_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = RuntimeDir::new(dir.path());
        let until = Utc::now() + Duration::minutes(5);

        runtime.write_rate_limit_marker(until).unwrap();
        let read_back = runtime.read_rate_limit_marker().unwrap();
        assert_eq!(read_back.timestamp(), until.timestamp());

        runtime.clear_rate_limit_marker().unwrap();
        assert!(runtime.read_rate_limit_marker().is_none());
    }

    #[test]
    fn dedup_set_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = RuntimeDir::new(dir.path());
        let mut ids = HashSet::new();
        ids.insert("env-1".to_string());
        ids.insert("env-2".to_string());

        runtime.save_dedup_set(&ids).unwrap();
        assert_eq!(runtime.load_dedup_set(), ids);
    }

    #[test]
    fn scheduler_last_run_round_trips_independently_per_job() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = RuntimeDir::new(dir.path());
        let at = Utc::now();

        runtime.write_scheduler_last_run("backup", at).unwrap();
        assert!(runtime.read_scheduler_last_run("validation").is_none());
        assert_eq!(
            runtime.read_scheduler_last_run("backup").unwrap().timestamp(),
            at.timestamp()
        );
    }

    #[test]
    fn progress_log_appends_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = RuntimeDir::new(dir.path());
        assert!(runtime.read_progress_log().is_empty());

        runtime.append_progress_entry("entered hibernation").unwrap();
        runtime.append_progress_entry("task T1 completed").unwrap();

        let lines = runtime.read_progress_log();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("entered hibernation"));
        assert!(lines[1].ends_with("task T1 completed"));
    }

    #[test]
    fn restart_context_clears_to_neutral_template() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = RuntimeDir::new(dir.path());
        runtime.write_restart_context("# Hibernating\n").unwrap();
        assert_eq!(runtime.read_restart_context().unwrap(), "# Hibernating\n");

        runtime.clear_restart_context().unwrap();
        assert_eq!(runtime.read_restart_context().unwrap(), NEUTRAL_RESTART_CONTEXT);
    }
}
