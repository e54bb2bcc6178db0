//! Circuit-breaking executor with endpoint failover.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::core::command::Cmd;
use crate::core::executor::CommandExecutor;
use crate::core::provider::ConnectionProvider;
use crate::failover::endpoint::Endpoint;
use crate::failover::provider::MultiEndpointProvider;
use crate::failover::CircuitState;
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// Runs each command on the active endpoint through that endpoint's retry
/// policy and circuit breaker.
///
/// When the breaker refuses the call (or the call fails with another
/// configured fallback class) the endpoint is forced open, the provider
/// advances to the next endpoint and the command is replayed there.
#[derive(Debug)]
pub struct CircuitBreakerExecutor {
    provider: Arc<MultiEndpointProvider>,
    failover_lock: tokio::sync::Mutex<()>,
}

impl CircuitBreakerExecutor {
    /// Creates an executor over `provider`.
    pub fn new(provider: Arc<MultiEndpointProvider>) -> Self {
        Self {
            provider,
            failover_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The provider this executor fails over.
    pub fn provider(&self) -> &Arc<MultiEndpointProvider> {
        &self.provider
    }

    async fn call(endpoint: &Endpoint, cmd: &Cmd) -> Result<Frame> {
        let breaker = endpoint.breaker();
        breaker.try_acquire()?;
        let result = endpoint
            .retry()
            .run(move || async move {
                let mut conn = endpoint.pool().get().await?;
                conn.execute(cmd).await
            })
            .await;
        match &result {
            Ok(_) => breaker.on_success(),
            Err(e) => breaker.on_error(e),
        }
        result
    }

    /// Forces the endpoint at `index` open and moves traffic to the next one.
    ///
    /// Callers racing on the same endpoint serialize here; only the first
    /// one still seeing `index` active advances. An endpoint an operator
    /// already forced open is stepped over the same way.
    async fn fail_over(&self, index: usize, endpoint: &Endpoint, cause: Error) -> Result<()> {
        let _guard = self.failover_lock.lock().await;
        let breaker = endpoint.breaker();
        if breaker.state() == CircuitState::ForcedOpen {
            if self.provider.is_last_endpoint_exhausted() {
                return Err(Error::NoFurtherEndpoint {
                    endpoint: endpoint.name().to_string(),
                    source: Some(Box::new(cause)),
                });
            }
            if self.provider.active_index() != index {
                return Ok(());
            }
        } else {
            breaker.transition_to_forced_open();
        }

        match self.provider.advance_to_next_endpoint().await {
            Ok(next) => {
                self.provider.run_failover_hook(next);
                Ok(())
            }
            Err(Error::NoFurtherEndpoint { endpoint, .. }) => Err(Error::NoFurtherEndpoint {
                endpoint,
                source: Some(Box::new(cause)),
            }),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl CommandExecutor for CircuitBreakerExecutor {
    #[instrument(level = "trace", skip_all, fields(cmd = %cmd.name()))]
    async fn execute(&self, cmd: &Cmd) -> Result<Frame> {
        let mut visited = Vec::with_capacity(self.provider.len());
        loop {
            let (index, endpoint) = self.provider.active();
            if visited.contains(&index) {
                warn!(endpoint = %endpoint.name(), "failover came back to a visited endpoint");
                return Err(Error::NoFurtherEndpoint {
                    endpoint: endpoint.name().to_string(),
                    source: None,
                });
            }
            visited.push(index);

            match Self::call(&endpoint, cmd).await {
                Ok(frame) => return Ok(frame),
                Err(e) if self.provider.is_fallback(&e) => {
                    debug!(endpoint = %endpoint.name(), error = %e, "running failover");
                    self.fail_over(index, &endpoint, e).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&self) {
        self.provider.close();
    }
}
