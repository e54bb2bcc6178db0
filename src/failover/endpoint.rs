use std::fmt;
use std::sync::Arc;

use crate::core::connection::Connector;
use crate::core::node::HostAndPort;
use crate::core::pool::ConnectionPool;
use crate::failover::breaker::CircuitBreaker;
use crate::failover::retry::RetryPolicy;
use crate::failover::{CircuitBreakerConfig, EndpointConfig, RetryConfig};

/// One independently pooled deployment behind a [`MultiEndpointProvider`].
///
/// [`MultiEndpointProvider`]: crate::failover::MultiEndpointProvider
pub struct Endpoint {
    name: String,
    priority: u32,
    weight: f32,
    pool: ConnectionPool,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl Endpoint {
    pub(crate) fn new(
        config: &EndpointConfig,
        connector: Arc<dyn Connector>,
        retry: &RetryConfig,
        breaker: &CircuitBreakerConfig,
    ) -> Self {
        let name = endpoint_name(config.priority, &config.address);
        Self {
            priority: config.priority,
            weight: config.weight,
            pool: ConnectionPool::new(config.address.clone(), connector, config.pool.clone()),
            retry: RetryPolicy::new(name.clone(), retry.clone()),
            breaker: CircuitBreaker::new(name.clone(), breaker.clone()),
            name,
        }
    }

    /// `endpoint:<priority>:<host>:<port>`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured priority.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Configured weight.
    pub fn weight(&self) -> f32 {
        self.weight
    }

    /// Address of the endpoint.
    pub fn address(&self) -> &HostAndPort {
        self.pool.addr()
    }

    /// The endpoint's pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// The endpoint's retry policy.
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// The endpoint's circuit breaker.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("state", &self.breaker.state())
            .finish()
    }
}

fn endpoint_name(priority: u32, address: &HostAndPort) -> String {
    format!("endpoint:{priority}:{address}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover::CircuitState;
    use crate::mocks::MockConnector;

    #[test]
    fn test_endpoint_name() {
        let config = EndpointConfig::new(HostAndPort::new("redis.example", 12000), 2);
        let endpoint = Endpoint::new(
            &config,
            Arc::new(MockConnector::new()),
            &RetryConfig::default(),
            &CircuitBreakerConfig::default(),
        );
        assert_eq!(endpoint.name(), "endpoint:2:redis.example:12000");
        assert_eq!(endpoint.breaker().name(), endpoint.name());
        assert_eq!(endpoint.breaker().state(), CircuitState::Closed);
        assert_eq!(endpoint.address(), &HostAndPort::new("redis.example", 12000));
    }
}
