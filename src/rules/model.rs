//! Core types for user-defined triage rules.
//!
//! A rule pairs one trigger with one action. Triggers and actions are closed
//! enums, each variant carrying only its own config shape. In the database
//! they are stored as a type tag plus a JSON config blob.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A persisted rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Creation id; ascending id is the evaluation and execution order.
    pub id: i64,
    pub user_id: String,
    pub name: String,
    pub trigger: Trigger,
    pub action: RuleAction,
    pub enabled: bool,
    pub trigger_count: u64,
    /// Set when the rule was disabled automatically.
    pub warning: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// User-supplied fields for creating or replacing a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleInput {
    pub name: String,
    pub trigger: Trigger,
    pub action: RuleAction,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RuleInput {
    pub fn new(name: impl Into<String>, trigger: Trigger, action: RuleAction) -> Self {
        Self {
            name: name.into(),
            trigger,
            action,
            enabled: true,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::Rule("name must not be empty".into()));
        }
        if let RuleAction::Forward { to } = &self.action
            && !to.contains('@')
        {
            return Err(ValidationError::Rule(format!(
                "forward target '{to}' is not an email address"
            )));
        }
        Ok(())
    }
}

/// When a rule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Any new email, optionally narrowed by sender or text.
    EmailReceived {
        #[serde(default)]
        from: Option<String>,
        #[serde(default)]
        contains: Option<String>,
    },
    /// Classified as urgent or high priority.
    PriorityHigh,
    /// Sender is a VIP.
    VipSender,
    /// Subject or body contains any of the keywords.
    KeywordMatch { keywords: Vec<String> },
}

impl Trigger {
    /// The string tag stored in the DB trigger_type column.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Trigger::EmailReceived { .. } => "email_received",
            Trigger::PriorityHigh => "priority_high",
            Trigger::VipSender => "vip_sender",
            Trigger::KeywordMatch { .. } => "keyword_match",
        }
    }

    /// Parse a trigger from its DB representation.
    pub fn from_db(trigger_type: &str, config: serde_json::Value) -> Result<Self, String> {
        match trigger_type {
            "email_received" => Ok(Trigger::EmailReceived {
                from: non_empty_str(&config, "from"),
                contains: non_empty_str(&config, "contains"),
            }),
            "priority_high" => Ok(Trigger::PriorityHigh),
            "vip_sender" => Ok(Trigger::VipSender),
            "keyword_match" => {
                let keywords = match config.get("keywords") {
                    Some(serde_json::Value::Array(arr)) => arr
                        .iter()
                        .filter_map(|v| v.as_str())
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect(),
                    Some(serde_json::Value::String(s)) => s
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect(),
                    _ => return Err("keyword_match trigger missing 'keywords'".into()),
                };
                Ok(Trigger::KeywordMatch { keywords })
            }
            other => Err(format!("unknown trigger type: {other}")),
        }
    }

    /// Serialize trigger-specific config to JSON for DB storage.
    pub fn to_config_json(&self) -> serde_json::Value {
        match self {
            Trigger::EmailReceived { from, contains } => serde_json::json!({
                "from": from,
                "contains": contains,
            }),
            Trigger::PriorityHigh | Trigger::VipSender => serde_json::json!({}),
            Trigger::KeywordMatch { keywords } => serde_json::json!({ "keywords": keywords }),
        }
    }
}

/// What a rule does when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    /// Apply a label; defaults to the category label.
    Label {
        #[serde(default)]
        name: Option<String>,
    },
    /// Draft a reply and queue it for approval.
    DraftReply {
        #[serde(default = "default_instructions")]
        instructions: String,
        #[serde(default)]
        tone: Option<String>,
    },
    /// Create a task in the external task list.
    CreateTask {
        #[serde(default)]
        title: Option<String>,
    },
    Forward { to: String },
    Archive,
    /// Record a notification in the agent log.
    Notify {
        #[serde(default)]
        message: Option<String>,
    },
}

pub(crate) fn default_instructions() -> String {
    "Respond to this email appropriately.".to_string()
}

impl RuleAction {
    /// The string tag stored in the DB action_type column.
    pub fn type_tag(&self) -> &'static str {
        match self {
            RuleAction::Label { .. } => "label",
            RuleAction::DraftReply { .. } => "draft_reply",
            RuleAction::CreateTask { .. } => "create_task",
            RuleAction::Forward { .. } => "forward",
            RuleAction::Archive => "archive",
            RuleAction::Notify { .. } => "notify",
        }
    }

    /// Parse an action from its DB representation.
    pub fn from_db(action_type: &str, config: serde_json::Value) -> Result<Self, String> {
        match action_type {
            "label" => Ok(RuleAction::Label {
                name: non_empty_str(&config, "name"),
            }),
            "draft_reply" => Ok(RuleAction::DraftReply {
                instructions: non_empty_str(&config, "instructions")
                    .unwrap_or_else(default_instructions),
                tone: non_empty_str(&config, "tone"),
            }),
            "create_task" => Ok(RuleAction::CreateTask {
                title: non_empty_str(&config, "title"),
            }),
            "forward" => {
                let to = non_empty_str(&config, "to").ok_or("forward action missing 'to'")?;
                Ok(RuleAction::Forward { to })
            }
            "archive" => Ok(RuleAction::Archive),
            "notify" => Ok(RuleAction::Notify {
                message: non_empty_str(&config, "message"),
            }),
            other => Err(format!("unknown action type: {other}")),
        }
    }

    /// Serialize action config to JSON for DB storage.
    pub fn to_config_json(&self) -> serde_json::Value {
        match self {
            RuleAction::Label { name } => serde_json::json!({ "name": name }),
            RuleAction::DraftReply { instructions, tone } => serde_json::json!({
                "instructions": instructions,
                "tone": tone,
            }),
            RuleAction::CreateTask { title } => serde_json::json!({ "title": title }),
            RuleAction::Forward { to } => serde_json::json!({ "to": to }),
            RuleAction::Archive => serde_json::json!({}),
            RuleAction::Notify { message } => serde_json::json!({ "message": message }),
        }
    }
}

fn non_empty_str(config: &serde_json::Value, key: &str) -> Option<String> {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// A rule row that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRule {
    pub id: i64,
    pub reason: String,
}

/// A user's enabled rules as loaded for one cycle.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    /// Parsed rules in ascending id order.
    pub rules: Vec<Rule>,
    pub malformed: Vec<MalformedRule>,
}
