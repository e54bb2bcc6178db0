//! # Multi-endpoint failover
//!
//! Several independent Redis deployments ("endpoints"), each with its own
//! pool, retry policy and circuit breaker. Traffic goes to one active
//! endpoint; when its breaker opens, the [`CircuitBreakerExecutor`] forces
//! it open and moves on to the next endpoint in priority order. Going back
//! is an operator decision made through
//! [`MultiEndpointProvider::fail_back_to`].
//!
//! ```no_run
//! # async fn example() -> routis::Result<()> {
//! use routis::failover::{EndpointConfig, MultiEndpointConfig};
//! use routis::{ClientBuilder, HostAndPort};
//!
//! let config = MultiEndpointConfig::new(vec![
//!     EndpointConfig::new(HostAndPort::new("primary.example", 6379), 1),
//!     EndpointConfig::new(HostAndPort::new("dr.example", 6379), 2),
//! ]);
//! let client = ClientBuilder::new().multi_endpoint(config).build().await?;
//! client.set("key", "value").await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use crate::core::config::{ConnectionConfig, PoolConfig};
use crate::core::node::HostAndPort;
use crate::proto::error::ErrorClass;

mod breaker;
mod endpoint;
mod executor;
mod provider;
mod retry;

pub use breaker::{CircuitBreaker, CircuitState};
pub use endpoint::Endpoint;
pub use executor::CircuitBreakerExecutor;
pub use provider::MultiEndpointProvider;
pub use retry::RetryPolicy;

/// Retry settings applied per endpoint.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RetryConfig {
    /// Total attempts, the first call included.
    pub max_attempts: u32,
    /// Wait before the first retry.
    pub wait_duration: Duration,
    /// Factor applied to the wait after each retry.
    pub backoff_multiplier: f64,
    /// Error classes that are retried.
    pub retry_on: Vec<ErrorClass>,
    /// Error classes never retried, even if listed in `retry_on`.
    pub ignore: Vec<ErrorClass>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            wait_duration: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            retry_on: vec![ErrorClass::Connection],
            ignore: Vec::new(),
        }
    }
}

impl RetryConfig {
    /// Sets the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the initial wait and the backoff multiplier.
    pub fn with_backoff(mut self, wait_duration: Duration, multiplier: f64) -> Self {
        self.wait_duration = wait_duration;
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets the retried and ignored error classes.
    pub fn with_classes(mut self, retry_on: Vec<ErrorClass>, ignore: Vec<ErrorClass>) -> Self {
        self.retry_on = retry_on;
        self.ignore = ignore;
        self
    }
}

/// Circuit breaker settings applied per endpoint.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct CircuitBreakerConfig {
    /// Failure percentage at or above which the breaker opens.
    pub failure_rate_threshold: f32,
    /// Number of most recent calls the failure rate is computed over.
    pub sliding_window_size: usize,
    /// Calls needed before the failure rate is evaluated. Defaults to the
    /// window size.
    pub minimum_number_of_calls: Option<usize>,
    /// Error classes counted as failures.
    pub record_on: Vec<ErrorClass>,
    /// Error classes counted as neither failure nor success.
    pub ignore: Vec<ErrorClass>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 10.0,
            sliding_window_size: 2,
            minimum_number_of_calls: None,
            record_on: vec![ErrorClass::Connection],
            ignore: Vec::new(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Sets the failure rate threshold in percent.
    pub fn with_failure_rate_threshold(mut self, threshold: f32) -> Self {
        self.failure_rate_threshold = threshold;
        self
    }

    /// Sets the sliding window size.
    pub fn with_sliding_window(
        mut self,
        size: usize,
        minimum_number_of_calls: Option<usize>,
    ) -> Self {
        self.sliding_window_size = size;
        self.minimum_number_of_calls = minimum_number_of_calls;
        self
    }

    /// Sets the recorded and ignored error classes.
    pub fn with_classes(mut self, record_on: Vec<ErrorClass>, ignore: Vec<ErrorClass>) -> Self {
        self.record_on = record_on;
        self.ignore = ignore;
        self
    }
}

/// One endpoint of a [`MultiEndpointConfig`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct EndpointConfig {
    /// Where the endpoint lives.
    pub address: HostAndPort,
    /// Failover order; lower is preferred.
    pub priority: u32,
    /// Relative weight, informational.
    pub weight: f32,
    /// How connections to this endpoint are opened.
    pub connection: ConnectionConfig,
    /// Pool bounds for this endpoint.
    pub pool: PoolConfig,
}

impl EndpointConfig {
    /// An endpoint with default connection and pool settings.
    pub fn new(address: HostAndPort, priority: u32) -> Self {
        Self {
            address,
            priority,
            weight: 1.0,
            connection: ConnectionConfig::default(),
            pool: PoolConfig::default(),
        }
    }

    /// Sets the weight.
    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }

    /// Sets the connection settings.
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Sets the pool bounds.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }
}

/// Settings for a [`MultiEndpointProvider`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct MultiEndpointConfig {
    /// Endpoints; sorted by priority when the provider is built.
    pub endpoints: Vec<EndpointConfig>,
    /// Retry policy shared by every endpoint.
    pub retry: RetryConfig,
    /// Breaker settings shared by every endpoint.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Error classes that trigger failover to the next endpoint.
    pub fallback_on: Vec<ErrorClass>,
}

impl MultiEndpointConfig {
    /// Config with default retry, breaker and fallback settings.
    pub fn new(endpoints: Vec<EndpointConfig>) -> Self {
        Self {
            endpoints,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            fallback_on: vec![ErrorClass::Failover],
        }
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the breaker settings.
    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    /// Sets the error classes that trigger failover.
    pub fn with_fallback_on(mut self, fallback_on: Vec<ErrorClass>) -> Self {
        self.fallback_on = fallback_on;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.wait_duration, Duration::from_millis(500));
        assert_eq!(retry.retry_on, vec![ErrorClass::Connection]);

        let breaker = CircuitBreakerConfig::default();
        assert_eq!(breaker.failure_rate_threshold, 10.0);
        assert_eq!(breaker.sliding_window_size, 2);
        assert!(breaker.minimum_number_of_calls.is_none());

        let config = MultiEndpointConfig::new(Vec::new());
        assert_eq!(config.fallback_on, vec![ErrorClass::Failover]);
    }
}
