//! Per-user agent preferences, stored as one JSON settings row.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::DatabaseError;
use crate::mail::types::{Category, is_vip_sender};
use crate::store::Database;

/// Settings key the preferences live under.
pub const SETTINGS_KEY: &str = "agent";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    /// Senders treated as VIP regardless of the provider's flag.
    pub vip_contacts: Vec<String>,
    /// Tone used for drafts whose rule does not set one.
    pub draft_tone: String,
    /// Categories whose clean drafts an auto-send policy may send.
    pub auto_send_categories: Vec<Category>,
    pub display_name: Option<String>,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            vip_contacts: Vec::new(),
            draft_tone: "professional".to_string(),
            auto_send_categories: Vec::new(),
            display_name: None,
        }
    }
}

impl UserSettings {
    /// Load a user's settings, falling back to defaults when absent or unreadable.
    pub async fn load(store: &dyn Database, user_id: &str) -> Result<Self, DatabaseError> {
        let Some(value) = store.get_setting(user_id, SETTINGS_KEY).await? else {
            return Ok(Self::default());
        };
        match serde_json::from_value(value) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                warn!(user_id, "Unreadable agent settings, using defaults: {e}");
                Ok(Self::default())
            }
        }
    }

    pub async fn save(&self, store: &dyn Database, user_id: &str) -> Result<(), DatabaseError> {
        let value =
            serde_json::to_value(self).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        store.set_setting(user_id, SETTINGS_KEY, &value).await
    }

    pub fn is_vip(&self, sender: &str) -> bool {
        is_vip_sender(&self.vip_contacts, sender)
    }
}
