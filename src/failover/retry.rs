//! Per-endpoint retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::{error, warn};

use crate::failover::RetryConfig;
use crate::proto::error::{Error, Result};

/// Retries an operation on configured error classes.
///
/// When attempts run out the last error is returned unchanged.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    name: String,
    config: RetryConfig,
}

impl RetryPolicy {
    /// Creates a policy named after its endpoint.
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    /// The policy's settings.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Returns true if `err` should be retried.
    pub fn should_retry(&self, err: &Error) -> bool {
        let class = err.class();
        !self.config.ignore.contains(&class) && self.config.retry_on.contains(&class)
    }

    /// The wait schedule: `max_attempts - 1` waits, the first one
    /// `wait_duration`, each next one `backoff_multiplier` times longer.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.config.wait_duration)
            .with_factor(self.config.backoff_multiplier.max(1.0) as f32)
            .with_max_times(self.config.max_attempts.saturating_sub(1) as usize)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or
    /// runs out of attempts.
    pub async fn run<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0u32;
        let result = op
            .retry(self.backoff())
            .sleep(tokio::time::sleep)
            .when(|e: &Error| self.should_retry(e))
            .notify(|e: &Error, wait: Duration| {
                retries += 1;
                warn!(
                    endpoint = %self.name,
                    attempt = retries,
                    ?wait,
                    error = %e,
                    "retrying command"
                );
            })
            .await;

        if let Err(e) = &result {
            error!(endpoint = %self.name, attempts = retries + 1, error = %e, "command failed");
        }
        result
    }
}
