//! Bounded per-node connection pool.
//!
//! A pool never holds more than `max_size` connections. Idle connections
//! are reused first; a new one is opened through the pool's [`Connector`]
//! only when none is idle. Closing a pool retires it: idle connections are
//! closed at once, borrowed ones when their borrower drops them.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::core::command::Cmd;
use crate::core::config::PoolConfig;
use crate::core::connection::{Connection, Connector};
use crate::core::node::HostAndPort;
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

struct PoolInner {
    addr: HostAndPort,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    max_size: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<Box<dyn Connection>>>,
    active: AtomicUsize,
    closed: AtomicBool,
}

impl PoolInner {
    fn release(&self, mut conn: Box<dyn Connection>) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        if conn.is_broken() || self.closed.load(Ordering::Acquire) {
            conn.close();
            trace!(node = %self.addr, "connection discarded");
            return;
        }
        self.idle.lock().push_back(conn);
        // close() may have drained the queue between the check and the push.
        if self.closed.load(Ordering::Acquire) {
            self.drain();
        }
    }

    fn drain(&self) {
        let drained: Vec<_> = self.idle.lock().drain(..).collect();
        for mut conn in drained {
            conn.close();
        }
    }
}

/// Connection pool for a single node.
///
/// Cheap to clone; clones share the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates an empty pool. No connection is opened until the first borrow.
    pub fn new(addr: HostAndPort, connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        let max_size = config.max_size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                addr,
                connector,
                config,
                max_size,
                permits: Arc::new(Semaphore::new(max_size)),
                idle: Mutex::new(VecDeque::new()),
                active: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The node this pool connects to.
    pub fn addr(&self) -> &HostAndPort {
        &self.inner.addr
    }

    /// Borrows a connection, opening one if none is idle.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolExhausted`] if no slot frees up within `max_wait`
    /// - [`Error::PoolClosed`] if the pool is (or gets) closed
    /// - any error from opening a new connection
    pub async fn get(&self) -> Result<PooledConnection> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(Error::PoolClosed {
                address: inner.addr.clone(),
            });
        }

        let acquire = inner.permits.clone().acquire_owned();
        let permit = match inner.config.max_wait {
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .map_err(|_| Error::PoolExhausted {
                    address: inner.addr.clone(),
                })?,
            None => acquire.await,
        }
        .map_err(|_| Error::PoolClosed {
            address: inner.addr.clone(),
        })?;

        loop {
            let candidate = inner.idle.lock().pop_front();
            let Some(mut conn) = candidate else { break };
            if conn.is_broken() {
                conn.close();
                continue;
            }
            if inner.config.test_on_borrow && conn.ping().await.is_err() {
                debug!(node = %inner.addr, "idle connection failed validation");
                conn.close();
                continue;
            }
            return Ok(self.wrap(conn, permit));
        }

        let conn = inner.connector.connect(&inner.addr).await?;
        debug!(node = %inner.addr, "opened pooled connection");
        Ok(self.wrap(conn, permit))
    }

    fn wrap(&self, conn: Box<dyn Connection>, permit: OwnedSemaphorePermit) -> PooledConnection {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        PooledConnection {
            addr: self.inner.addr.clone(),
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        }
    }

    /// Closes the pool.
    ///
    /// Idle connections are closed now. Borrowed connections stay usable and
    /// are closed when returned. Waiting borrowers fail with
    /// [`Error::PoolClosed`].
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.permits.close();
        self.inner.drain();
        debug!(node = %self.inner.addr, "pool closed");
    }

    /// Returns true once [`ConnectionPool::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Returns true if both handles refer to the same pool.
    pub fn same_pool(&self, other: &ConnectionPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of idle connections ready for reuse.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Number of connections currently borrowed.
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("addr", &self.inner.addr)
            .field("max_size", &self.inner.max_size)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A connection borrowed from a [`ConnectionPool`].
///
/// Dropping it returns the connection to its pool, or closes it if the
/// connection broke or the pool has been closed in the meantime.
pub struct PooledConnection {
    addr: HostAndPort,
    conn: Option<Box<dyn Connection>>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// The node this connection talks to.
    pub fn addr(&self) -> &HostAndPort {
        &self.addr
    }

    /// See [`Connection::execute`].
    pub async fn execute(&mut self, cmd: &Cmd) -> Result<Frame> {
        match self.conn.as_mut() {
            Some(conn) => conn.execute(cmd).await,
            None => Err(released()),
        }
    }

    /// See [`Connection::send_command`].
    pub async fn send_command(&mut self, cmd: &Cmd) -> Result<Frame> {
        match self.conn.as_mut() {
            Some(conn) => conn.send_command(cmd).await,
            None => Err(released()),
        }
    }

    /// See [`Connection::ping`].
    pub async fn ping(&mut self) -> Result<()> {
        match self.conn.as_mut() {
            Some(conn) => conn.ping().await,
            None => Err(released()),
        }
    }

    /// Returns true if the connection can no longer be used.
    pub fn is_broken(&self) -> bool {
        self.conn.as_ref().map_or(true, |conn| conn.is_broken())
    }

    /// Closes the underlying connection so it is not returned to the pool.
    pub fn discard(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.close();
        }
    }
}

fn released() -> Error {
    Error::connection("connection already released")
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("addr", &self.addr)
            .field("broken", &self.is_broken())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command;
    use crate::mocks::MockConnector;
    use std::time::Duration;

    fn node() -> HostAndPort {
        HostAndPort::new("10.0.0.1", 6379)
    }

    fn pool_with(connector: &MockConnector, config: PoolConfig) -> ConnectionPool {
        ConnectionPool::new(node(), Arc::new(connector.clone()), config)
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let connector = MockConnector::new();
        let pool = pool_with(&connector, PoolConfig::default());

        let mut conn = pool.get().await.unwrap();
        conn.execute(&command::ping()).await.unwrap();
        assert_eq!(pool.active_count(), 1);
        drop(conn);

        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.active_count(), 0);
        let _again = pool.get().await.unwrap();
        assert_eq!(connector.connect_count(&node()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_pool_times_out() {
        let connector = MockConnector::new();
        let config = PoolConfig::default()
            .with_max_size(1)
            .with_max_wait(Some(Duration::from_millis(50)));
        let pool = pool_with(&connector, config);

        let _held = pool.get().await.unwrap();
        let result = pool.get().await;
        assert!(matches!(result, Err(Error::PoolExhausted { .. })));
    }

    #[tokio::test]
    async fn test_waiter_gets_returned_connection() {
        let connector = MockConnector::new();
        let pool = pool_with(&connector, PoolConfig::default().with_max_size(1));

        let held = pool.get().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get().await.map(|c| c.addr().clone()) })
        };
        tokio::task::yield_now().await;
        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), node());
        assert_eq!(connector.connect_count(&node()), 1);
    }

    #[tokio::test]
    async fn test_close_retires_borrowed_connections_on_return() {
        let connector = MockConnector::new();
        let pool = pool_with(&connector, PoolConfig::default());

        let idle = pool.get().await.unwrap();
        let mut borrowed = pool.get().await.unwrap();
        drop(idle);
        assert_eq!(pool.idle_count(), 1);

        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(connector.close_count(&node()), 1);

        // Still usable until returned.
        borrowed.execute(&command::ping()).await.unwrap();
        drop(borrowed);
        assert_eq!(connector.close_count(&node()), 2);
        assert!(matches!(pool.get().await, Err(Error::PoolClosed { .. })));
    }

    #[tokio::test]
    async fn test_broken_connection_is_not_reused() {
        let connector = MockConnector::new();
        let pool = pool_with(&connector, PoolConfig::default());

        let mut conn = pool.get().await.unwrap();
        conn.discard();
        drop(conn);
        assert_eq!(pool.idle_count(), 0);

        let _fresh = pool.get().await.unwrap();
        assert_eq!(connector.connect_count(&node()), 2);
    }

    #[tokio::test]
    async fn test_borrow_validation_drops_dead_idle_connection() {
        let connector = MockConnector::new();
        let pool = pool_with(&connector, PoolConfig::default().with_test_on_borrow(true));

        drop(pool.get().await.unwrap());
        connector.set_down(&node(), true);
        assert!(pool.get().await.is_err());
        assert_eq!(pool.idle_count(), 0);

        connector.set_down(&node(), false);
        assert!(pool.get().await.is_ok());
    }
}
