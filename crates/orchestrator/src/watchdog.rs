//! Watchdog: periodic stall detection with nudge injection (spec §4.5).

use std::sync::atomic::{AtomicI64, Ordering};

use agora_config::WatchdogConfig;
use chrono::Utc;

/// What the watchdog decided to do on a given poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Activity is recent enough; nothing to do.
    Healthy,
    /// The stall threshold was exceeded; inject this reminder.
    Nudge(String),
    /// The stall persisted past the force-restart threshold.
    ForceRestart,
}

/// Tracks the last recorded activity timestamp and, on each poll, compares
/// it against the configured thresholds. `record_activity` is called from
/// every orchestrator entry point that represents activity (cycle boundary,
/// wake, inject, user message).
pub struct Watchdog {
    config: WatchdogConfig,
    last_activity_millis: AtomicI64,
    nudged_at_millis: AtomicI64,
}

const NOT_SET: i64 = i64::MIN;

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            last_activity_millis: AtomicI64::new(Utc::now().timestamp_millis()),
            nudged_at_millis: AtomicI64::new(NOT_SET),
        }
    }

    pub fn record_activity(&self) {
        self.last_activity_millis.store(Utc::now().timestamp_millis(), Ordering::SeqCst);
        self.nudged_at_millis.store(NOT_SET, Ordering::SeqCst);
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.poll_interval_secs)
    }

    /// Compares `now - lastActivity` against the stall threshold, and
    /// (if already nudged) the force-restart threshold.
    pub fn poll(&self) -> WatchdogAction {
        let now = Utc::now().timestamp_millis();
        let last_activity = self.last_activity_millis.load(Ordering::SeqCst);
        let stalled_for = now.saturating_sub(last_activity);

        if stalled_for < self.config.stall_threshold_secs as i64 * 1000 {
            return WatchdogAction::Healthy;
        }

        let nudged_at = self.nudged_at_millis.load(Ordering::SeqCst);
        if nudged_at == NOT_SET {
            self.nudged_at_millis.store(now, Ordering::SeqCst);
            return WatchdogAction::Nudge(format!(
                "No activity recorded for {}s — is the loop stuck?",
                stalled_for / 1000
            ));
        }

        if let Some(force_restart_threshold) = self.config.force_restart_threshold_secs {
            let since_nudge = now.saturating_sub(nudged_at);
            if since_nudge >= force_restart_threshold as i64 * 1000 {
                return WatchdogAction::ForceRestart;
            }
        }

        WatchdogAction::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering as O;

    fn config(stall_secs: u64, force_restart_secs: Option<u64>) -> WatchdogConfig {
        WatchdogConfig { poll_interval_secs: 1, stall_threshold_secs: stall_secs, force_restart_threshold_secs: force_restart_secs }
    }

    #[test]
    fn healthy_when_activity_is_recent() {
        let watchdog = Watchdog::new(config(600, Some(300)));
        assert_eq!(watchdog.poll(), WatchdogAction::Healthy);
    }

    #[test]
    fn nudges_once_stall_threshold_exceeded() {
        let watchdog = Watchdog::new(config(0, Some(600)));
        watchdog.last_activity_millis.store(Utc::now().timestamp_millis() - 5_000, O::SeqCst);
        assert!(matches!(watchdog.poll(), WatchdogAction::Nudge(_)));
    }

    #[test]
    fn record_activity_resets_nudge_state() {
        let watchdog = Watchdog::new(config(0, Some(600)));
        watchdog.last_activity_millis.store(Utc::now().timestamp_millis() - 5_000, O::SeqCst);
        assert!(matches!(watchdog.poll(), WatchdogAction::Nudge(_)));
        watchdog.record_activity();
        assert_eq!(watchdog.poll(), WatchdogAction::Healthy);
    }

    #[test]
    fn force_restart_after_nudge_persists_past_second_threshold() {
        let watchdog = Watchdog::new(config(0, Some(0)));
        watchdog.last_activity_millis.store(Utc::now().timestamp_millis() - 10_000, O::SeqCst);
        assert!(matches!(watchdog.poll(), WatchdogAction::Nudge(_)));
        watchdog.nudged_at_millis.store(Utc::now().timestamp_millis() - 10_000, O::SeqCst);
        assert_eq!(watchdog.poll(), WatchdogAction::ForceRestart);
    }

    #[test]
    fn no_force_restart_when_threshold_disabled() {
        let watchdog = Watchdog::new(config(0, None));
        watchdog.last_activity_millis.store(Utc::now().timestamp_millis() - 10_000, O::SeqCst);
        assert!(matches!(watchdog.poll(), WatchdogAction::Nudge(_)));
        watchdog.nudged_at_millis.store(Utc::now().timestamp_millis() - 10_000, O::SeqCst);
        assert_eq!(watchdog.poll(), WatchdogAction::Healthy);
    }
}
