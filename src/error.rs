//! Error types for Inbox Pilot.

use std::time::Duration;

use uuid::Uuid;

use crate::drafts::DraftStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    #[error("Draft error: {0}")]
    Draft(#[from] DraftError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mail provider and task sink errors.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{operation} failed (transient): {reason}")]
    Transient { operation: String, reason: String },

    #[error("{operation} failed: {reason}")]
    Permanent { operation: String, reason: String },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },
}

impl ProviderError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }
}

/// Analysis/drafting service errors.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("Analysis request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("Invalid analysis response: {reason}")]
    InvalidResponse { reason: String },

    #[error("Analysis timed out after {timeout:?}")]
    Timeout { timeout: Duration },
}

/// Failure of a single rule or automation action.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error("Failed to persist action result: {0}")]
    Database(#[from] DatabaseError),
}

/// Draft approval workflow errors.
#[derive(Debug, thiserror::Error)]
pub enum DraftError {
    #[error("Draft {id} not found")]
    NotFound { id: Uuid },

    #[error("Draft {id} is already {current}")]
    Conflict { id: Uuid, current: DraftStatus },
}

/// Agent cycle errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("A cycle is already running for user {user_id}")]
    CycleInProgress { user_id: String },
}

/// Rejected user input.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid schedule: {0}")]
    Schedule(String),

    #[error("Unknown timezone: {0}")]
    Timezone(String),

    #[error("Invalid rule: {0}")]
    Rule(String),

    #[error("Invalid automation: {0}")]
    Automation(String),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
