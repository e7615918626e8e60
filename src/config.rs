//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::agent::retry::RetryPolicy;
use crate::error::ConfigError;

const ENV_PREFIX: &str = "INBOX_PILOT_";

fn env(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env(key) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|e: T::Err| ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}{key}"),
            message: e.to_string(),
        }),
    }
}

fn env_secs(key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_secs))
}

/// Agent cycle configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Maximum unread emails fetched per cycle.
    pub batch_size: usize,
    /// Wall-clock budget for one cycle; remaining emails wait for the next one.
    pub cycle_budget: Duration,
    pub retry: RetryPolicy,
    /// How often the background sweep runs a cycle for every user.
    pub sweep_interval: Duration,
    pub max_concurrent_users: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            cycle_budget: Duration::from_secs(300), // 5 minutes
            retry: RetryPolicy::default(),
            sweep_interval: Duration::from_secs(3600), // 1 hour
            max_concurrent_users: 4,
        }
    }
}

/// Automation scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            enabled: true,
        }
    }
}

/// Mail/analysis gateway connection settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_token: SecretString,
    pub timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_token: SecretString::from(String::new()),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Everything the daemon needs to start.
#[derive(Debug, Clone)]
pub struct PilotConfig {
    pub db_path: PathBuf,
    pub agent: AgentConfig,
    pub scheduler: SchedulerConfig,
    pub gateway: GatewayConfig,
}

impl AgentConfig {
    /// Defaults overridden by `INBOX_PILOT_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(batch_size) = env_parse::<usize>("BATCH_SIZE")? {
            if batch_size == 0 {
                return Err(ConfigError::InvalidValue {
                    key: format!("{ENV_PREFIX}BATCH_SIZE"),
                    message: "must be at least 1".into(),
                });
            }
            config.batch_size = batch_size;
        }
        if let Some(budget) = env_secs("CYCLE_BUDGET_SECS")? {
            config.cycle_budget = budget;
        }
        if let Some(interval) = env_secs("SWEEP_INTERVAL_SECS")? {
            config.sweep_interval = interval;
        }
        if let Some(n) = env_parse::<usize>("MAX_CONCURRENT_USERS")? {
            config.max_concurrent_users = n.max(1);
        }
        if let Some(attempts) = env_parse::<u32>("RETRY_ATTEMPTS")? {
            config.retry.max_attempts = attempts.max(1);
        }
        if let Some(timeout) = env_secs("CALL_TIMEOUT_SECS")? {
            config.retry.call_timeout = timeout;
        }
        Ok(config)
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(poll) = env_secs("SCHEDULER_POLL_SECS")? {
            config.poll_interval = poll;
        }
        if let Some(enabled) = env_parse::<bool>("SCHEDULER_ENABLED")? {
            config.enabled = enabled;
        }
        Ok(config)
    }
}

impl GatewayConfig {
    /// Requires `INBOX_PILOT_GATEWAY_URL` and `INBOX_PILOT_GATEWAY_TOKEN`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = env("GATEWAY_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar(format!("{ENV_PREFIX}GATEWAY_URL")))?;
        let api_token = env("GATEWAY_TOKEN")
            .ok_or_else(|| ConfigError::MissingEnvVar(format!("{ENV_PREFIX}GATEWAY_TOKEN")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: SecretString::from(api_token),
            timeout: env_secs("GATEWAY_TIMEOUT_SECS")?.unwrap_or(Duration::from_secs(30)),
        })
    }
}

impl PilotConfig {
    /// Build the full config from `INBOX_PILOT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            db_path: env("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/inbox-pilot.db")),
            agent: AgentConfig::from_env()?,
            scheduler: SchedulerConfig::from_env()?,
            gateway: GatewayConfig::from_env()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.cycle_budget, Duration::from_secs(300));
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn scheduler_defaults_enabled() {
        let config = SchedulerConfig::default();
        assert!(config.enabled);
        assert_eq!(config.poll_interval, Duration::from_secs(60));
    }
}
