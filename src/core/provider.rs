//! Connection providers: where a command's connection comes from.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::command::Cmd;
use crate::core::config::PoolConfig;
use crate::core::connection::Connector;
use crate::core::node::HostAndPort;
use crate::core::pool::{ConnectionPool, PooledConnection};
use crate::proto::error::Result;

/// Supplies a connection for a command.
///
/// Implementations decide routing (single node, slot owner, current
/// Sentinel master, ...); executors decide what to do when the command
/// fails on that connection.
#[async_trait]
pub trait ConnectionProvider: Send + Sync + fmt::Debug {
    /// Borrows a connection suitable for `cmd`.
    async fn connection(&self, cmd: &Cmd) -> Result<PooledConnection>;

    /// Releases every pool and background task owned by the provider.
    fn close(&self);
}

/// Provider backed by a single node's pool.
#[derive(Debug, Clone)]
pub struct PooledProvider {
    pool: ConnectionPool,
}

impl PooledProvider {
    /// Creates a provider for `addr`.
    pub fn new(addr: HostAndPort, connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            pool: ConnectionPool::new(addr, connector, config),
        }
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

#[async_trait]
impl ConnectionProvider for PooledProvider {
    async fn connection(&self, _cmd: &Cmd) -> Result<PooledConnection> {
        self.pool.get().await
    }

    fn close(&self) {
        self.pool.close();
    }
}
