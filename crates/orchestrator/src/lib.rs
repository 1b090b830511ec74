pub mod control;
pub mod idle;
pub mod orchestrator;
pub mod rate_limit;
pub mod roles;
pub mod scheduler;
pub mod types;
pub mod watchdog;

pub use control::{ControlClient, ControlCommand, ControlEvent, StatusPayload};
pub use idle::{render_plan, IdleHandler, IdleOutcome};
pub use orchestrator::{ExitReason, Orchestrator};
pub use rate_limit::{parse_rate_limit_reset, RateLimitStateManager};
pub use roles::{Ego, Id, Subconscious, Superego};
pub use scheduler::{Scheduler, SchedulerCoordinator, SchedulerEvent};
pub use types::{ConversationGate, CycleAction, CycleResult, LoopMetrics, LoopState, OrchestratorEvent, PendingMessage};
pub use watchdog::{Watchdog, WatchdogAction};
