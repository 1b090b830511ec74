//! Scheduler Coordinator and the bundled periodic job set (spec §4.2).

use std::sync::Arc;

use agora_config::SchedulerConfig;
use agora_store::RuntimeDir;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

/// A periodic job owned by the [`SchedulerCoordinator`]. Implementations
/// persist their own "last-run" timestamp and must never let a failure
/// propagate past `run` — the coordinator treats every `Err` as a logged,
/// non-fatal scheduler failure (spec §4.2 failure policy).
#[async_trait]
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &str;
    async fn should_run(&self) -> bool;
    async fn run(&self) -> anyhow::Result<()>;
}

/// Domain event a scheduler emits on completion (spec §4.2).
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Completed { name: String },
    Failed { name: String, error: String },
}

/// Runs every due scheduler, in registration order, once per cycle boundary.
pub struct SchedulerCoordinator {
    schedulers: Vec<Arc<dyn Scheduler>>,
}

impl SchedulerCoordinator {
    pub fn new(schedulers: Vec<Arc<dyn Scheduler>>) -> Self {
        Self { schedulers }
    }

    /// Wires up the bundled job set named in spec §2/§4.2, sourcing their
    /// intervals from `config` and their last-run timestamps from `runtime`.
    pub fn bundled(config: SchedulerConfig, runtime: Arc<RuntimeDir>) -> Self {
        let mut schedulers: Vec<Arc<dyn Scheduler>> = vec![
            Arc::new(IntervalJob::new("backup", config.backup_interval_minutes, runtime.clone())),
            Arc::new(IntervalJob::new("validation", config.validation_interval_minutes, runtime.clone())),
            Arc::new(IntervalJob::new("metrics", config.metrics_interval_minutes, runtime.clone())),
            Arc::new(IntervalJob::new("health_check", config.health_check_interval_minutes, runtime.clone())),
        ];
        if config.email_digest_enabled {
            schedulers.push(Arc::new(IntervalJob::new("email_digest", config.email_digest_interval_minutes, runtime)));
        }
        Self::new(schedulers)
    }

    /// Runs every due scheduler. One failure never blocks the rest (spec
    /// §4.2 "Schedulers are independent").
    pub async fn run_due(&self) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        for scheduler in &self.schedulers {
            if !scheduler.should_run().await {
                continue;
            }
            match scheduler.run().await {
                Ok(()) => events.push(SchedulerEvent::Completed { name: scheduler.name().to_string() }),
                Err(error) => {
                    debug!(scheduler = scheduler.name(), %error, "scheduler run failed");
                    events.push(SchedulerEvent::Failed { name: scheduler.name().to_string(), error: error.to_string() });
                }
            }
        }
        events
    }
}

/// A generic fixed-interval job. The bundled set (`backup`, `validation`,
/// `metrics`, `health_check`, `email_digest`) all share this shape; their
/// side effects beyond the interval gate are out of scope (§1) and modelled
/// as a completion no-op, since the substrate formats and credential stores
/// they'd touch are owned elsewhere.
struct IntervalJob {
    name: &'static str,
    interval_minutes: u64,
    runtime: Arc<RuntimeDir>,
}

impl IntervalJob {
    fn new(name: &'static str, interval_minutes: u64, runtime: Arc<RuntimeDir>) -> Self {
        Self { name, interval_minutes, runtime }
    }

    fn next_scheduled_time(&self, previous: DateTime<Utc>) -> DateTime<Utc> {
        previous + chrono::Duration::minutes(self.interval_minutes as i64)
    }
}

#[async_trait]
impl Scheduler for IntervalJob {
    fn name(&self) -> &str {
        self.name
    }

    async fn should_run(&self) -> bool {
        match self.runtime.read_scheduler_last_run(self.name) {
            Some(last) => Utc::now() >= self.next_scheduled_time(last),
            None => true,
        }
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.runtime.write_scheduler_last_run(self.name, Utc::now())?;
        Ok(())
    }
}
