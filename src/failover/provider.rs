//! Active-endpoint bookkeeping for multi-endpoint deployments.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, instrument, warn};

use crate::core::command::Cmd;
use crate::core::connection::{Connector, TcpConnector};
use crate::core::pool::PooledConnection;
use crate::core::provider::ConnectionProvider;
use crate::failover::endpoint::Endpoint;
use crate::failover::{CircuitState, EndpointConfig, MultiEndpointConfig};
use crate::proto::error::{Error, ErrorClass, Result};

type FailoverHook = dyn Fn(&str) + Send + Sync;

#[derive(Debug, Clone, Copy)]
struct ActiveState {
    /// 1-based position in `endpoints`.
    index: usize,
    /// Set when a failover ran past the last endpoint.
    exhausted: bool,
}

/// Owns every endpoint and the index of the one serving traffic.
///
/// The provider only performs index changes; deciding when to fail over is
/// up to [`CircuitBreakerExecutor`]. Indexes are 1-based, endpoint 1 being
/// the lowest priority value.
///
/// [`CircuitBreakerExecutor`]: crate::failover::CircuitBreakerExecutor
pub struct MultiEndpointProvider {
    endpoints: Vec<Arc<Endpoint>>,
    fallback_on: Vec<ErrorClass>,
    active: ArcSwap<ActiveState>,
    write_lock: tokio::sync::Mutex<()>,
    hook: RwLock<Option<Arc<FailoverHook>>>,
}

impl MultiEndpointProvider {
    /// Builds a provider connecting over TCP with each endpoint's
    /// connection settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if no endpoint is configured.
    pub fn new(config: MultiEndpointConfig) -> Result<Self> {
        Self::build(config, |endpoint| {
            Arc::new(TcpConnector::new(endpoint.connection.clone()))
        })
    }

    /// Builds a provider whose endpoints all connect through `connector`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if no endpoint is configured.
    pub fn with_connector(
        config: MultiEndpointConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        Self::build(config, |_| Arc::clone(&connector))
    }

    fn build<F>(mut config: MultiEndpointConfig, mut connector: F) -> Result<Self>
    where
        F: FnMut(&EndpointConfig) -> Arc<dyn Connector>,
    {
        if config.endpoints.is_empty() {
            return Err(Error::Validation {
                message: "at least one endpoint must be configured".to_string(),
                source: None,
            });
        }
        config.endpoints.sort_by_key(|endpoint| endpoint.priority);
        let endpoints = config
            .endpoints
            .iter()
            .map(|endpoint| {
                Arc::new(Endpoint::new(
                    endpoint,
                    connector(endpoint),
                    &config.retry,
                    &config.circuit_breaker,
                ))
            })
            .collect();

        Ok(Self {
            endpoints,
            fallback_on: config.fallback_on,
            active: ArcSwap::from_pointee(ActiveState {
                index: 1,
                exhausted: false,
            }),
            write_lock: tokio::sync::Mutex::new(()),
            hook: RwLock::new(None),
        })
    }

    /// Number of endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Always false; a provider has at least one endpoint.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Endpoints in failover order.
    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    /// Endpoint at a 1-based `index`.
    pub fn endpoint(&self, index: usize) -> Option<Arc<Endpoint>> {
        index
            .checked_sub(1)
            .and_then(|i| self.endpoints.get(i))
            .cloned()
    }

    /// Index of the endpoint serving traffic.
    pub fn active_index(&self) -> usize {
        self.active.load().index
    }

    /// The endpoint serving traffic.
    pub fn active_endpoint(&self) -> Arc<Endpoint> {
        self.active().1
    }

    pub(crate) fn active(&self) -> (usize, Arc<Endpoint>) {
        let index = self.active.load().index;
        // The index is always kept within 1..=len.
        let endpoint = Arc::clone(&self.endpoints[index - 1]);
        (index, endpoint)
    }

    /// True once a failover found no endpoint left to move to.
    pub fn is_last_endpoint_exhausted(&self) -> bool {
        self.active.load().exhausted
    }

    /// Returns true if `err` should make the executor fail over.
    pub fn is_fallback(&self, err: &Error) -> bool {
        self.fallback_on.contains(&err.class())
    }

    /// Makes the next endpoint in priority order active, skipping endpoints
    /// whose breaker is forced open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoFurtherEndpoint`] and marks the provider exhausted
    /// when no endpoint is left.
    pub async fn advance_to_next_endpoint(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let current = **self.active.load();
        let mut index = current.index;
        loop {
            if index + 1 > self.endpoints.len() {
                self.active.store(Arc::new(ActiveState {
                    index,
                    exhausted: true,
                }));
                let endpoint = self.endpoints[index - 1].name().to_string();
                warn!(%endpoint, "no further endpoint to fail over to");
                return Err(Error::NoFurtherEndpoint {
                    endpoint,
                    source: None,
                });
            }
            index += 1;
            let endpoint = &self.endpoints[index - 1];
            if endpoint.breaker().state() == CircuitState::ForcedOpen {
                warn!(endpoint = %endpoint.name(), "skipping forced open endpoint");
                continue;
            }
            self.active.store(Arc::new(ActiveState {
                index,
                exhausted: current.exhausted,
            }));
            info!(
                from = %self.endpoints[current.index - 1].name(),
                to = %endpoint.name(),
                "failed over to next endpoint"
            );
            return Ok(index);
        }
    }

    /// Makes endpoint `index` active again after checking it answers.
    ///
    /// A no-op when `index` is already active and its breaker is not forced
    /// open. Otherwise the endpoint's breaker is closed and a `PING` sent;
    /// if that fails the breaker goes back to its previous forced-open state
    /// and the active endpoint is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an unknown index or a failed probe.
    #[instrument(level = "debug", skip(self))]
    pub async fn fail_back_to(&self, index: usize) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let current = **self.active.load();
        if let Some(endpoint) = self.endpoint(index) {
            if index == current.index && endpoint.breaker().state() != CircuitState::ForcedOpen {
                return Ok(());
            }
        }
        let endpoint = self.endpoint(index).ok_or_else(|| Error::Validation {
            message: format!(
                "endpoint index {index} is out of range, expected 1..={}",
                self.endpoints.len()
            ),
            source: None,
        })?;

        Self::validate_target_connection(&endpoint).await?;

        info!(
            from = %self.endpoints[current.index - 1].name(),
            to = %endpoint.name(),
            "failed back to endpoint"
        );
        self.active.store(Arc::new(ActiveState {
            index,
            exhausted: false,
        }));
        Ok(())
    }

    async fn validate_target_connection(endpoint: &Endpoint) -> Result<()> {
        let breaker = endpoint.breaker();
        let original = breaker.state();
        breaker.transition_to_closed();

        let probe = async {
            let mut conn = endpoint.pool().get().await?;
            conn.ping().await
        };
        if let Err(e) = probe.await {
            if original == CircuitState::ForcedOpen {
                breaker.transition_to_forced_open();
            }
            warn!(endpoint = %endpoint.name(), error = %e, "failback validation failed");
            return Err(Error::Validation {
                message: format!(
                    "{} failed to connect. Please check configuration and try again.",
                    endpoint.name()
                ),
                source: Some(Box::new(e)),
            });
        }
        Ok(())
    }

    /// Registers a callback run with the new endpoint's name after every
    /// failover.
    pub fn set_failover_hook<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.hook.write() = Some(Arc::new(hook));
    }

    /// Runs the failover hook for endpoint `index`, if one is registered.
    pub fn run_failover_hook(&self, index: usize) {
        let hook = self.hook.read().clone();
        if let (Some(hook), Some(endpoint)) = (hook, self.endpoint(index)) {
            hook(endpoint.name());
        }
    }
}

impl fmt::Debug for MultiEndpointProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active = **self.active.load();
        f.debug_struct("MultiEndpointProvider")
            .field("endpoints", &self.endpoints)
            .field("active", &active.index)
            .field("exhausted", &active.exhausted)
            .finish()
    }
}

#[async_trait]
impl ConnectionProvider for MultiEndpointProvider {
    async fn connection(&self, _cmd: &Cmd) -> Result<PooledConnection> {
        self.active_endpoint().pool().get().await
    }

    fn close(&self) {
        for endpoint in &self.endpoints {
            endpoint.pool().close();
        }
    }
}
