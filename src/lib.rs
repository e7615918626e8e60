//! Inbox Pilot — an email triage agent.
//!
//! Classifies unread mail, applies user rules, drafts replies for review,
//! and runs recurring automations on a persisted schedule.

pub mod agent;
pub mod automation;
pub mod config;
pub mod drafts;
pub mod error;
pub mod mail;
pub mod pilot;
pub mod rules;
pub mod safety;
pub mod store;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use pilot::{AgentStatus, InboxPilot, PilotDeps};
