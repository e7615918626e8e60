//! Single-flight lock keyed by user id.
//!
//! At most one cycle or automation firing runs per user at any time. The
//! lock is non-blocking: a second caller is told the user is busy instead
//! of queueing behind the first.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

/// Shared registry of users with work in flight.
#[derive(Debug, Clone, Default)]
pub struct UserLocks {
    active: Arc<Mutex<HashSet<String>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the user, or `None` if something already holds them.
    pub fn try_acquire(&self, user_id: &str) -> Option<UserLockGuard> {
        let mut active = self.active_set();
        if !active.insert(user_id.to_string()) {
            debug!(user_id, "User busy");
            return None;
        }
        Some(UserLockGuard {
            active: Arc::clone(&self.active),
            user_id: user_id.to_string(),
        })
    }

    pub fn is_held(&self, user_id: &str) -> bool {
        self.active_set().contains(user_id)
    }

    fn active_set(&self) -> MutexGuard<'_, HashSet<String>> {
        // The set stays consistent even if a holder panicked mid-insert.
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Releases the user when dropped.
#[derive(Debug)]
pub struct UserLockGuard {
    active: Arc<Mutex<HashSet<String>>>,
    user_id: String,
}

impl Drop for UserLockGuard {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.user_id);
    }
}
