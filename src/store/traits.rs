//! Unified `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::agent::log::AgentLog;
use crate::automation::model::Automation;
use crate::drafts::{Draft, DraftStatus};
use crate::error::DatabaseError;
use crate::rules::{Rule, RuleInput, RuleSet};

/// Outcome of a compare-and-swap on a draft's status.
#[derive(Debug, Clone)]
pub enum DraftTransition {
    /// The draft was in the expected state and has moved.
    Applied(Draft),
    /// Someone else moved it first; carries the status they left it in.
    Conflict(DraftStatus),
    NotFound,
}

/// Backend-agnostic database trait covering rules, automations, drafts,
/// agent state, logs, and settings.
///
/// Rule and automation lookups are scoped by user: an id owned by another
/// user behaves exactly like a missing one.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Rules ───────────────────────────────────────────────────────

    async fn create_rule(&self, user_id: &str, input: &RuleInput) -> Result<Rule, DatabaseError>;

    async fn get_rule(&self, user_id: &str, id: i64) -> Result<Option<Rule>, DatabaseError>;

    /// Replace name, trigger, action, and enabled flag. Clears any warning.
    async fn update_rule(
        &self,
        user_id: &str,
        id: i64,
        input: &RuleInput,
    ) -> Result<Option<Rule>, DatabaseError>;

    async fn delete_rule(&self, user_id: &str, id: i64) -> Result<bool, DatabaseError>;

    /// Enable or disable a rule. Enabling clears a malformed-rule warning.
    async fn set_rule_enabled(
        &self,
        user_id: &str,
        id: i64,
        enabled: bool,
    ) -> Result<Option<Rule>, DatabaseError>;

    /// All of the user's rules, malformed rows reported separately.
    async fn list_rules(&self, user_id: &str) -> Result<RuleSet, DatabaseError>;

    /// Enabled rules in ascending id order, malformed rows reported separately.
    async fn load_enabled_rules(&self, user_id: &str) -> Result<RuleSet, DatabaseError>;

    async fn increment_rule_trigger_count(&self, id: i64) -> Result<(), DatabaseError>;

    /// Disable a rule that failed to parse and store why.
    async fn flag_malformed_rule(&self, id: i64, reason: &str) -> Result<(), DatabaseError>;

    // ── Automations ─────────────────────────────────────────────────

    async fn create_automation(&self, automation: &Automation) -> Result<(), DatabaseError>;

    async fn get_automation(
        &self,
        user_id: &str,
        id: Uuid,
    ) -> Result<Option<Automation>, DatabaseError>;

    async fn delete_automation(&self, user_id: &str, id: Uuid) -> Result<bool, DatabaseError>;

    async fn list_automations(&self, user_id: &str) -> Result<Vec<Automation>, DatabaseError>;

    /// Enabled automations whose next fire instant is at or before `now`.
    async fn list_due_automations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Automation>, DatabaseError>;

    /// Advance an automation after a firing and append its log, atomically.
    ///
    /// Applies only if `run_count` still equals `expected_run_count`.
    /// Returns `false` (and writes nothing) if another firing got there first.
    async fn record_automation_fire(
        &self,
        id: Uuid,
        expected_run_count: u64,
        fired_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
        log: &AgentLog,
    ) -> Result<bool, DatabaseError>;

    // ── Drafts ──────────────────────────────────────────────────────

    async fn insert_draft(&self, draft: &Draft) -> Result<(), DatabaseError>;

    async fn get_draft(&self, id: Uuid) -> Result<Option<Draft>, DatabaseError>;

    /// Drafts for a user, newest first, optionally filtered by status.
    async fn list_drafts(
        &self,
        user_id: &str,
        status: Option<DraftStatus>,
    ) -> Result<Vec<Draft>, DatabaseError>;

    /// Move a draft from `from` to `to` if it is still in `from`.
    ///
    /// `body` replaces the draft body when the move applies.
    async fn transition_draft(
        &self,
        id: Uuid,
        from: DraftStatus,
        to: DraftStatus,
        body: Option<&str>,
    ) -> Result<DraftTransition, DatabaseError>;

    // ── Agent state and logs ────────────────────────────────────────

    async fn load_processed_ids(&self, user_id: &str) -> Result<Vec<String>, DatabaseError>;

    /// Persist a cycle's processed ids and its log in one transaction.
    async fn record_cycle(
        &self,
        user_id: &str,
        email_ids: &[String],
        log: &AgentLog,
    ) -> Result<(), DatabaseError>;

    async fn append_agent_log(&self, log: &AgentLog) -> Result<(), DatabaseError>;

    /// Most recent logs first.
    async fn list_agent_logs(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<AgentLog>, DatabaseError>;

    /// Logs started at or after `since`, oldest first.
    async fn list_agent_logs_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<AgentLog>, DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError>;

    async fn set_setting(
        &self,
        user_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    // ── Users ───────────────────────────────────────────────────────

    /// Every user with rules, automations, or settings.
    async fn list_agent_users(&self) -> Result<Vec<String>, DatabaseError>;
}
