//! Bounded retry with exponential backoff for provider calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{AnalysisError, ProviderError};

/// How provider calls are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a single attempt.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. Used by tests.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Delay before the attempt following `attempt` (1-based), with ±25% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        if exp.is_zero() {
            return exp;
        }
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        exp.mul_f64(factor)
    }
}

/// Run `call` until it succeeds, fails permanently, or attempts run out.
///
/// Each attempt is bounded by the policy's call timeout; a timeout counts as
/// a retryable failure.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(policy.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                operation: operation.to_string(),
                timeout: policy.call_timeout,
            }),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after error: {e}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Bound an analysis call by the policy's call timeout. Analysis is not retried.
pub async fn with_timeout<T, Fut>(policy: &RetryPolicy, call: Fut) -> Result<T, AnalysisError>
where
    Fut: Future<Output = Result<T, AnalysisError>>,
{
    match tokio::time::timeout(policy.call_timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(AnalysisError::Timeout {
            timeout: policy.call_timeout,
        }),
    }
}
