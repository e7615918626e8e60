//! Collaborator interfaces the agent consumes.
//!
//! The agent never talks to a mailbox, a language model, or a task list
//! directly. Everything goes through these traits so that providers can be
//! swapped (Gmail, Outlook, an HTTP gateway, test doubles).

use async_trait::async_trait;

use crate::error::{AnalysisError, ProviderError};
use crate::mail::types::{Classification, Email, TaskRecord};

/// Mailbox access for one or more users.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Fetch up to `limit` unread emails.
    async fn fetch_unread(&self, user_id: &str, limit: usize) -> Result<Vec<Email>, ProviderError>;

    /// Send a new message from the user's mailbox.
    async fn send(
        &self,
        user_id: &str,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), ProviderError>;

    /// Apply a named label (or category on providers without labels).
    async fn label(&self, user_id: &str, email_id: &str, name: &str) -> Result<(), ProviderError>;

    /// Mark an email read and remove it from the active view.
    async fn mark_read(&self, user_id: &str, email_id: &str) -> Result<(), ProviderError>;
}

/// Email understanding and reply drafting.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn classify(&self, email: &Email) -> Result<Classification, AnalysisError>;

    /// Draft a reply body following the given instructions and tone.
    async fn draft(
        &self,
        email: &Email,
        instructions: &str,
        tone: &str,
    ) -> Result<String, AnalysisError>;
}

/// External task list (Google Tasks, Todoist, ...).
#[async_trait]
pub trait TaskSink: Send + Sync {
    /// Create a task and return its id.
    async fn create_task(&self, user_id: &str, task: &TaskRecord) -> Result<String, ProviderError>;
}
