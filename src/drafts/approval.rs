//! Human review of generated drafts.
//!
//! Every status change is a compare-and-swap in the store, so two reviewers
//! acting on the same draft cannot both win.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::retry::{RetryPolicy, with_retry};
use crate::drafts::{Draft, DraftStatus};
use crate::error::{DraftError, Result};
use crate::mail::provider::MailProvider;
use crate::store::{Database, DraftTransition};

pub struct DraftApprovals {
    store: Arc<dyn Database>,
    mail: Arc<dyn MailProvider>,
    retry: RetryPolicy,
}

impl DraftApprovals {
    pub fn new(store: Arc<dyn Database>, mail: Arc<dyn MailProvider>, retry: RetryPolicy) -> Self {
        Self { store, mail, retry }
    }

    /// Approve a pending draft and send it.
    ///
    /// A blank `edited_body` keeps the generated body. If sending fails the
    /// draft stays approved and can be retried with [`Self::send_approved`].
    pub async fn approve(&self, draft_id: Uuid, edited_body: Option<&str>) -> Result<Draft> {
        let body = edited_body.filter(|b| !b.trim().is_empty());
        let draft = self
            .transition(draft_id, DraftStatus::Pending, DraftStatus::Approved, body)
            .await?;
        info!(draft_id = %draft_id, user_id = %draft.user_id, edited = body.is_some(), "Draft approved");
        self.send(draft).await
    }

    /// Send a draft that was approved but not yet delivered.
    pub async fn send_approved(&self, draft_id: Uuid) -> Result<Draft> {
        let draft = self
            .store
            .get_draft(draft_id)
            .await?
            .ok_or(DraftError::NotFound { id: draft_id })?;
        if draft.status != DraftStatus::Approved {
            return Err(DraftError::Conflict {
                id: draft_id,
                current: draft.status,
            }
            .into());
        }
        self.send(draft).await
    }

    pub async fn reject(&self, draft_id: Uuid) -> Result<Draft> {
        let draft = self
            .transition(draft_id, DraftStatus::Pending, DraftStatus::Rejected, None)
            .await?;
        info!(draft_id = %draft_id, user_id = %draft.user_id, "Draft rejected");
        Ok(draft)
    }

    async fn send(&self, draft: Draft) -> Result<Draft> {
        let sent = with_retry(&self.retry, "send_draft", || {
            self.mail
                .send(&draft.user_id, &draft.recipient, &draft.subject, &draft.body)
        })
        .await;
        if let Err(e) = sent {
            warn!(draft_id = %draft.id, user_id = %draft.user_id, "Sending approved draft failed: {e}");
            return Err(e.into());
        }

        let draft = self
            .transition(draft.id, DraftStatus::Approved, DraftStatus::Sent, None)
            .await?;
        info!(draft_id = %draft.id, to = %draft.recipient, "Draft sent");
        Ok(draft)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: DraftStatus,
        to: DraftStatus,
        body: Option<&str>,
    ) -> Result<Draft> {
        match self.store.transition_draft(id, from, to, body).await? {
            DraftTransition::Applied(draft) => Ok(draft),
            DraftTransition::Conflict(current) => Err(DraftError::Conflict { id, current }.into()),
            DraftTransition::NotFound => Err(DraftError::NotFound { id }.into()),
        }
    }
}
