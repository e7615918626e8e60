//! Draft replies awaiting approval.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mail::types::Category;

/// Lifecycle of a draft. Once a draft leaves `Pending` it never returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Pending,
    Approved,
    Rejected,
    Sent,
}

impl DraftStatus {
    /// Allowed edges: pending → approved | rejected, approved → sent.
    pub fn can_transition_to(self, next: DraftStatus) -> bool {
        matches!(
            (self, next),
            (DraftStatus::Pending, DraftStatus::Approved)
                | (DraftStatus::Pending, DraftStatus::Rejected)
                | (DraftStatus::Approved, DraftStatus::Sent)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DraftStatus::Pending => "pending",
            DraftStatus::Approved => "approved",
            DraftStatus::Rejected => "rejected",
            DraftStatus::Sent => "sent",
        }
    }
}

impl fmt::Display for DraftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DraftStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DraftStatus::Pending),
            "approved" => Ok(DraftStatus::Approved),
            "rejected" => Ok(DraftStatus::Rejected),
            "sent" => Ok(DraftStatus::Sent),
            other => Err(format!("unknown draft status: {other}")),
        }
    }
}

/// Risk level assigned by the safety reviewer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::None => write!(f, "none"),
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
        }
    }
}

impl FromStr for Severity {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Severity::None),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// A generated reply draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub id: Uuid,
    pub user_id: String,
    pub source_email_id: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub status: DraftStatus,
    pub instructions: String,
    pub tone: String,
    pub severity: Severity,
    pub safety_flags: Vec<String>,
    /// Category of the email being replied to.
    pub source_category: Option<Category>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Draft {
    /// Whether an auto-send policy may send this draft without review.
    ///
    /// Requires a clean safety review and a source category on the user's
    /// allow-list. The decision to actually auto-send lives outside the agent.
    pub fn auto_send_eligible(&self, allow_list: &[Category]) -> bool {
        self.status == DraftStatus::Pending
            && self.severity == Severity::None
            && self
                .source_category
                .is_some_and(|category| allow_list.contains(&category))
    }
}

/// Prefix a subject with "Re: " unless it already has one.
pub fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("re:")) {
        trimmed.to_string()
    } else {
        format!("Re: {trimmed}")
    }
}
