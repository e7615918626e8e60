//! Per-user record of already-processed email ids.
//!
//! Ids are staged while a cycle runs and only become part of the tracker
//! after the store has durably recorded them together with the cycle's log.
//! A cycle that dies before that point leaves the tracker untouched, so the
//! next cycle retries the same emails.

use std::collections::HashSet;

use crate::error::DatabaseError;
use crate::mail::types::Email;
use crate::store::Database;

#[derive(Debug, Clone)]
pub struct IdempotencyTracker {
    processed: HashSet<String>,
    staged: Vec<String>,
}

impl IdempotencyTracker {
    /// Load the user's processed ids from the store.
    pub async fn load(store: &dyn Database, user_id: &str) -> Result<Self, DatabaseError> {
        let processed = store.load_processed_ids(user_id).await?;
        Ok(Self::from_ids(processed))
    }

    pub fn from_ids(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            processed: ids.into_iter().collect(),
            staged: Vec::new(),
        }
    }

    /// Committed or staged in this cycle.
    pub fn contains(&self, email_id: &str) -> bool {
        self.processed.contains(email_id) || self.staged.iter().any(|id| id == email_id)
    }

    /// Keep only emails not seen before, dropping duplicates within the batch.
    pub fn retain_unprocessed(&self, emails: Vec<Email>) -> Vec<Email> {
        let mut seen = HashSet::new();
        emails
            .into_iter()
            .filter(|e| !self.contains(&e.id) && seen.insert(e.id.clone()))
            .collect()
    }

    /// Mark an email as handled in the current cycle.
    pub fn stage(&mut self, email_id: &str) {
        if !self.contains(email_id) {
            self.staged.push(email_id.to_string());
        }
    }

    pub fn staged(&self) -> &[String] {
        &self.staged
    }

    /// Fold staged ids into the committed set once the store has them.
    pub fn commit_staged(&mut self) {
        self.processed.extend(self.staged.drain(..));
    }

    /// Number of committed ids.
    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }
}
