//! Append-only audit records of what the agent did.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mail::types::Category;

/// What produced a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogKind {
    /// A reactive pass over unread mail.
    Cycle,
    /// A scheduled automation firing.
    Automation { automation_id: Uuid, action: String },
}

impl LogKind {
    pub fn type_tag(&self) -> &'static str {
        match self {
            LogKind::Cycle => "cycle",
            LogKind::Automation { .. } => "automation",
        }
    }
}

/// One action taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub email_id: Option<String>,
    pub rule_id: Option<i64>,
    /// Action type tag ("label", "draft_reply", "digest_sent", ...).
    pub action: String,
    pub detail: String,
}

/// One failure recorded without aborting the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub email_id: Option<String>,
    pub rule_id: Option<i64>,
    pub action: Option<String>,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            email_id: None,
            rule_id: None,
            action: None,
            message: message.into(),
        }
    }

    pub fn for_email(email_id: &str, message: impl Into<String>) -> Self {
        Self {
            email_id: Some(email_id.to_string()),
            ..Self::new(message)
        }
    }
}

/// Persisted audit record: one per cycle or automation firing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLog {
    pub id: Uuid,
    pub user_id: String,
    pub kind: LogKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed_count: u32,
    pub actions: Vec<ActionRecord>,
    pub errors: Vec<ErrorRecord>,
    pub summary: String,
}

/// Accumulates records during a run and renders the summary at the end.
#[derive(Debug)]
pub struct LogBuilder {
    user_id: String,
    kind: LogKind,
    started_at: DateTime<Utc>,
    processed: u32,
    categories: BTreeMap<String, u32>,
    actions: Vec<ActionRecord>,
    errors: Vec<ErrorRecord>,
}

impl LogBuilder {
    pub fn new(user_id: &str, kind: LogKind, started_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            kind,
            started_at,
            processed: 0,
            categories: BTreeMap::new(),
            actions: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn record_processed(&mut self, category: Option<Category>) {
        self.processed += 1;
        let key = category.map_or_else(|| "unclassified".to_string(), |c| c.to_string());
        *self.categories.entry(key).or_default() += 1;
    }

    pub fn record_action(&mut self, record: ActionRecord) {
        self.actions.push(record);
    }

    pub fn record_error(&mut self, error: ErrorRecord) {
        self.errors.push(error);
    }

    pub fn actions(&self) -> &[ActionRecord] {
        &self.actions
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    pub fn finish(self, finished_at: DateTime<Utc>) -> AgentLog {
        let summary = self.render_summary(finished_at);
        AgentLog {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            kind: self.kind,
            started_at: self.started_at,
            finished_at,
            processed_count: self.processed,
            actions: self.actions,
            errors: self.errors,
            summary,
        }
    }

    fn render_summary(&self, finished_at: DateTime<Utc>) -> String {
        let elapsed = (finished_at - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        let mut out = String::new();

        if let LogKind::Automation { action, .. } = &self.kind {
            let _ = write!(out, "[{action}] ");
        }

        if self.processed == 0 && self.actions.is_empty() {
            let _ = write!(out, "No new emails to process ({elapsed:.1}s)");
        } else {
            let _ = write!(out, "Processed {} emails in {elapsed:.1}s:", self.processed);
            for (category, count) in &self.categories {
                let _ = write!(out, "\n  - {count} {category}");
            }
            let mut by_action: BTreeMap<&str, usize> = BTreeMap::new();
            for record in &self.actions {
                *by_action.entry(record.action.as_str()).or_default() += 1;
            }
            for (action, count) in by_action {
                let _ = write!(out, "\n  {action}: {count}");
            }
        }

        if !self.errors.is_empty() {
            let _ = write!(out, "\n  Errors: {}", self.errors.len());
        }
        out
    }
}
