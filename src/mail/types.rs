//! Shared email types exchanged with the mail and analysis collaborators.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ── Priority & category ─────────────────────────────────────────────

/// How soon an email needs attention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Urgent and high priority both count as "high" for rule matching.
    pub fn is_high(self) -> bool {
        matches!(self, Priority::Urgent | Priority::High)
    }

    /// Days until a task created for this email is due.
    pub fn due_offset_days(self) -> u64 {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Normal => 3,
            Priority::Low => 7,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Urgent => write!(f, "urgent"),
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

impl FromStr for Priority {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urgent" => Ok(Priority::Urgent),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// What kind of email this is, as decided by the analysis service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    ActionRequired,
    WaitingOn,
    Fyi,
    Newsletter,
    Promotional,
    Personal,
    Spam,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::ActionRequired,
        Category::WaitingOn,
        Category::Fyi,
        Category::Newsletter,
        Category::Promotional,
        Category::Personal,
        Category::Spam,
    ];

    /// Mailbox label applied when a label action has no explicit name.
    pub fn label(self) -> &'static str {
        match self {
            Category::ActionRequired => "Inbox Pilot/Action Required",
            Category::WaitingOn => "Inbox Pilot/Waiting On",
            Category::Fyi => "Inbox Pilot/FYI",
            Category::Newsletter => "Inbox Pilot/Newsletter",
            Category::Promotional => "Inbox Pilot/Promotional",
            Category::Personal => "Inbox Pilot/Personal",
            Category::Spam => "Inbox Pilot/Spam",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::ActionRequired => "action_required",
            Category::WaitingOn => "waiting_on",
            Category::Fyi => "fyi",
            Category::Newsletter => "newsletter",
            Category::Promotional => "promotional",
            Category::Personal => "personal",
            Category::Spam => "spam",
        };
        f.write_str(s)
    }
}

impl FromStr for Category {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.to_string() == s)
            .ok_or_else(|| format!("unknown category: {s}"))
    }
}

/// Label added on top of the category label for VIP senders.
pub const VIP_LABEL: &str = "Inbox Pilot/VIP";

// ── Email ───────────────────────────────────────────────────────────

/// An email as reported by the mail provider. Read-only to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Email {
    /// Provider-native message id.
    pub id: String,
    /// Sender address.
    pub sender: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub subject: String,
    /// Snippet or full body text.
    #[serde(default)]
    pub body: String,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub is_vip: bool,
}

impl Email {
    /// Display name of the sender, falling back to the local part of the address.
    pub fn sender_display(&self) -> &str {
        match self.sender_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => self.sender.split('@').next().unwrap_or(&self.sender),
        }
    }
}

/// Result of the analysis service's classify call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: Category,
    pub priority: Priority,
    #[serde(default)]
    pub summary: String,
}

/// An email paired with its classification. Rules only ever see these.
#[derive(Debug, Clone)]
pub struct ClassifiedEmail {
    pub email: Email,
    pub category: Category,
    pub priority: Priority,
    pub summary: String,
    /// Provider VIP flag or sender listed in the user's VIP contacts.
    pub is_vip: bool,
    haystack: String,
}

impl ClassifiedEmail {
    pub fn new(email: Email, classification: Classification, vip_contacts: &[String]) -> Self {
        let is_vip = email.is_vip || is_vip_sender(vip_contacts, &email.sender);
        let haystack = format!("{}\n{}", email.subject, email.body).to_lowercase();
        Self {
            email,
            category: classification.category,
            priority: classification.priority,
            summary: classification.summary,
            is_vip,
            haystack,
        }
    }

    /// Case-insensitive substring search over subject and body.
    pub fn mentions(&self, needle: &str) -> bool {
        let needle = needle.trim();
        !needle.is_empty() && self.haystack.contains(&needle.to_lowercase())
    }
}

// ── Tasks ───────────────────────────────────────────────────────────

/// A task handed to the external task sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub title: String,
    pub notes: String,
    pub due: NaiveDate,
    pub source_email_id: Option<String>,
}

/// Case-insensitive match of `sender` against a VIP list, ignoring surrounding whitespace.
pub fn is_vip_sender(vip_contacts: &[String], sender: &str) -> bool {
    let sender = sender.trim();
    vip_contacts
        .iter()
        .any(|vip| vip.trim().eq_ignore_ascii_case(sender))
}

/// Truncate to at most `max` bytes on a char boundary, appending "..." when cut.
pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
