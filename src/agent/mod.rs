//! The triage agent: reactive cycles over unread mail and the actions they take.

pub mod cycle;
pub mod executor;
pub mod lock;
pub mod log;
pub mod retry;
pub mod settings;
pub mod tracker;

pub use cycle::{AgentCycleRunner, CycleState, spawn_agent_sweep};
pub use executor::{ActionContext, ActionExecutor, ActionOutcome};
pub use lock::{UserLockGuard, UserLocks};
pub use log::{ActionRecord, AgentLog, ErrorRecord, LogBuilder, LogKind};
pub use retry::RetryPolicy;
pub use settings::UserSettings;
pub use tracker::IdempotencyTracker;
