use std::sync::Arc;
use std::time::Duration;

use crate::core::config::{ConnectionConfig, PoolConfig};
use crate::core::connection::{Connector, TcpConnector};
use crate::core::executor::{CommandExecutor, RetryingExecutor, SimpleExecutor};
use crate::core::node::HostAndPort;
use crate::core::provider::{ConnectionProvider, PooledProvider};
use crate::failover::{CircuitBreakerExecutor, MultiEndpointConfig, MultiEndpointProvider};
use crate::sentinel::{
    SentinelConfig, SentinelConnectionProvider, SentinelConnector, TcpSentinelConnector,
};
use crate::{Client, Error, Result};

#[cfg(feature = "cluster")]
use crate::cluster::{ClusterCommandExecutor, ClusterConfig, ClusterConnectionProvider};

#[derive(Debug)]
enum Deployment {
    Standalone(HostAndPort),
    #[cfg(feature = "cluster")]
    Cluster(Vec<HostAndPort>),
    Sentinel(SentinelConfig),
    MultiEndpoint(MultiEndpointConfig),
}

/// Builder for configuring and creating a [`Client`].
///
/// Pick one deployment shape (standalone, cluster, Sentinel or
/// multi-endpoint), adjust the settings, then [`build`](Self::build).
///
/// # Example
///
/// ```no_run
/// use routis::ClientBuilder;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ClientBuilder::new()
///     .standalone("redis://localhost:6379")?
///     .password("secret")
///     .database(0)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ClientBuilder {
    deployment: Option<Deployment>,
    connection: ConnectionConfig,
    pool: PoolConfig,
    #[cfg(feature = "cluster")]
    cluster: ClusterConfig,
    retry: Option<(u32, Duration)>,
    connector: Option<Arc<dyn Connector>>,
    sentinel_connector: Option<Arc<dyn SentinelConnector>>,
}

impl ClientBuilder {
    /// Creates a new [`ClientBuilder`] instance.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets a single Redis node.
    ///
    /// # Arguments
    ///
    /// * `address` - `host:port`, `[v6]:port` or `redis://host:port`
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unparseable address.
    pub fn standalone(mut self, address: &str) -> Result<Self> {
        self.deployment = Some(Deployment::Standalone(HostAndPort::parse(address)?));
        Ok(self)
    }

    /// Targets a Redis Cluster reachable through the given seed nodes.
    ///
    /// # Arguments
    ///
    /// * `seeds` - Comma-separated seed addresses
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if no seed parses.
    #[cfg(feature = "cluster")]
    pub fn cluster(mut self, seeds: &str) -> Result<Self> {
        self.deployment = Some(Deployment::Cluster(HostAndPort::parse_list(seeds)?));
        Ok(self)
    }

    /// Sets cluster retry, refresh and pool settings.
    #[cfg(feature = "cluster")]
    #[inline]
    pub fn cluster_config(mut self, config: ClusterConfig) -> Self {
        self.cluster = config;
        self
    }

    /// Targets the master tracked by a set of Sentinels.
    ///
    /// Connection and pool settings are taken from `config`, not from this
    /// builder.
    #[inline]
    pub fn sentinel(mut self, config: SentinelConfig) -> Self {
        self.deployment = Some(Deployment::Sentinel(config));
        self
    }

    /// Targets several independent deployments with circuit-breaker
    /// failover between them.
    #[inline]
    pub fn multi_endpoint(mut self, config: MultiEndpointConfig) -> Self {
        self.deployment = Some(Deployment::MultiEndpoint(config));
        self
    }

    /// Sets the password for authentication.
    #[inline]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.connection.password = Some(password.into());
        self
    }

    /// Sets the username for ACL authentication.
    #[inline]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.connection.username = Some(username.into());
        self
    }

    /// Sets the Redis database number to select after connection.
    ///
    /// # Arguments
    ///
    /// * `database` - Database number (0-15)
    #[inline]
    pub fn database(mut self, database: u8) -> Self {
        self.connection.database = Some(database);
        self
    }

    /// Sets the client connection name.
    ///
    /// # Arguments
    ///
    /// * `name` - Client name displayed in `CLIENT LIST`
    #[inline]
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.connection.client_name = Some(name.into());
        self
    }

    /// Sets the connection timeout.
    #[inline]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection.connect_timeout = timeout;
        self
    }

    /// Sets the read timeout for commands.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Maximum time to wait for a response. `None` means no timeout.
    #[inline]
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connection.response_timeout = timeout;
        self
    }

    /// Sets every connection setting at once (standalone and cluster).
    #[inline]
    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection = config;
        self
    }

    /// Sets the pool bounds of a standalone client.
    #[inline]
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Retries connection failures on standalone and Sentinel clients.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Attempts per command, the first one included
    /// * `max_total_retries_duration` - Time budget per command
    #[inline]
    pub fn retry(mut self, max_attempts: u32, max_total_retries_duration: Duration) -> Self {
        self.retry = Some((max_attempts, max_total_retries_duration));
        self
    }

    /// Opens node connections through `connector` instead of TCP.
    #[inline]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Opens Sentinel connections through `connector` instead of TCP.
    #[inline]
    pub fn sentinel_connector(mut self, connector: Arc<dyn SentinelConnector>) -> Self {
        self.sentinel_connector = Some(connector);
        self
    }

    /// Builds the [`Client`].
    ///
    /// Cluster and Sentinel clients discover their topology here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if no deployment was chosen, and
    /// whatever the chosen provider reports when it cannot start.
    pub async fn build(self) -> Result<Client> {
        let deployment = self.deployment.ok_or_else(|| Error::InvalidArgument {
            message: "address is required".to_string(),
        })?;
        let custom_connector = self.connector;
        let connector = custom_connector
            .clone()
            .unwrap_or_else(|| Arc::new(TcpConnector::new(self.connection.clone())));

        let executor: Arc<dyn CommandExecutor> = match deployment {
            Deployment::Standalone(addr) => {
                let provider = Arc::new(PooledProvider::new(addr, connector, self.pool));
                single_node_executor(provider, self.retry)?
            }
            #[cfg(feature = "cluster")]
            Deployment::Cluster(seeds) => {
                let provider =
                    ClusterConnectionProvider::new(seeds, connector, &self.cluster).await?;
                Arc::new(ClusterCommandExecutor::from_config(
                    Arc::new(provider),
                    &self.cluster,
                )?)
            }
            Deployment::Sentinel(config) => {
                let sentinel_connector = self.sentinel_connector.unwrap_or_else(|| {
                    Arc::new(TcpSentinelConnector::new(config.sentinel_connection.clone()))
                });
                let master_connector = custom_connector.unwrap_or_else(|| {
                    Arc::new(TcpConnector::new(config.master_connection.clone()))
                });
                let provider = SentinelConnectionProvider::with_connectors(
                    config,
                    master_connector,
                    sentinel_connector,
                )
                .await?;
                single_node_executor(Arc::new(provider), self.retry)?
            }
            Deployment::MultiEndpoint(config) => {
                let provider = match custom_connector {
                    Some(connector) => MultiEndpointProvider::with_connector(config, connector)?,
                    None => MultiEndpointProvider::new(config)?,
                };
                Arc::new(CircuitBreakerExecutor::new(Arc::new(provider)))
            }
        };
        Ok(Client::with_executor(executor))
    }
}

fn single_node_executor(
    provider: Arc<dyn ConnectionProvider>,
    retry: Option<(u32, Duration)>,
) -> Result<Arc<dyn CommandExecutor>> {
    Ok(match retry {
        Some((max_attempts, duration)) => {
            Arc::new(RetryingExecutor::new(provider, max_attempts, duration)?)
        }
        None => Arc::new(SimpleExecutor::new(provider)),
    })
}
