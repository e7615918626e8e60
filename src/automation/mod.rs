//! Recurring automations and the scheduler that fires them.

pub mod model;
pub mod scheduler;

pub use model::{Automation, AutomationAction, AutomationInput, Schedule};
pub use scheduler::{AutomationScheduler, LeaderLease, LocalLease, TickReport, spawn_scheduler};
