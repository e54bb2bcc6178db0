//! Picks the cluster node a command's connection comes from.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::cluster::cache::SlotTopologyCache;
use crate::cluster::slot::command_slot;
use crate::cluster::ClusterConfig;
use crate::core::command::Cmd;
use crate::core::connection::Connector;
use crate::core::node::HostAndPort;
use crate::core::pool::{ConnectionPool, PooledConnection};
use crate::core::provider::ConnectionProvider;
use crate::proto::error::{Error, Result};

/// Routes commands to slot owners through a [`SlotTopologyCache`].
#[derive(Debug, Clone)]
pub struct ClusterConnectionProvider {
    cache: Arc<SlotTopologyCache>,
}

impl ClusterConnectionProvider {
    /// Discovers the cluster from `seeds` and starts the periodic refresh
    /// if one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TopologyUnavailable`] if no seed returned a usable
    /// slot table.
    pub async fn new(
        seeds: Vec<HostAndPort>,
        connector: Arc<dyn Connector>,
        config: &ClusterConfig,
    ) -> Result<Self> {
        let cache = Arc::new(SlotTopologyCache::new(seeds, connector, config));
        cache.discover().await?;
        if let Some(period) = config.topology_refresh_period {
            cache.start_periodic_refresh(period);
        }
        Ok(Self { cache })
    }

    /// Wraps an already discovered cache.
    pub fn from_cache(cache: Arc<SlotTopologyCache>) -> Self {
        Self { cache }
    }

    /// The slot table behind this provider.
    pub fn cache(&self) -> &Arc<SlotTopologyCache> {
        &self.cache
    }

    /// A connection to the owner of `slot`.
    ///
    /// An unassigned slot triggers a refresh; if the slot is still
    /// unassigned afterwards any live node is used and its redirect will
    /// point the way.
    pub async fn connection_for_slot(&self, slot: u16) -> Result<PooledConnection> {
        if let Some(pool) = self.cache.resolve(slot) {
            return pool.get().await;
        }
        debug!(slot, "slot not assigned, refreshing topology");
        self.cache.refresh(None).await;
        match self.cache.resolve(slot) {
            Some(pool) => pool.get().await,
            None => self.random_connection().await,
        }
    }

    /// A connection to a random replica of `slot`'s owner.
    ///
    /// Falls back to [`connection_for_slot`](Self::connection_for_slot)
    /// when the owner has no replicas.
    pub async fn connection_for_slot_replica(&self, slot: u16) -> Result<PooledConnection> {
        match self.cache.resolve_replica(slot) {
            Some(pool) => pool.get().await,
            None => self.connection_for_slot(slot).await,
        }
    }

    /// A connection to any node that answers `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoReachableNode`] carrying the first failure if no
    /// known node answers.
    #[instrument(level = "trace", skip(self))]
    pub async fn random_connection(&self) -> Result<PooledConnection> {
        let mut first_error = None;
        for pool in self.cache.shuffled_pools() {
            let attempt = async {
                let mut conn = pool.get().await?;
                conn.ping().await?;
                Ok::<_, Error>(conn)
            };
            match attempt.await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!(node = %pool.addr(), error = %e, "node failed liveness check");
                    first_error.get_or_insert(e);
                }
            }
        }
        Err(Error::NoReachableNode {
            source: first_error.map(Box::new),
        })
    }

    /// A connection to `node`, creating its pool if the node is new.
    pub async fn connection_to(&self, node: &HostAndPort) -> Result<PooledConnection> {
        self.cache.setup_node_if_not_exist(node).get().await
    }

    /// Refreshes the slot table, querying `hint` first when given.
    pub async fn renew_slot_cache(&self, hint: Option<&mut PooledConnection>) {
        self.cache.refresh(hint).await;
    }

    /// Returns true once the provider has been closed.
    pub fn is_closed(&self) -> bool {
        self.cache.is_closed()
    }

    /// Pools of every primary node.
    pub fn primary_pools(&self) -> Vec<ConnectionPool> {
        self.cache.primaries()
    }
}

#[async_trait]
impl ConnectionProvider for ClusterConnectionProvider {
    async fn connection(&self, cmd: &Cmd) -> Result<PooledConnection> {
        match command_slot(cmd)? {
            Some(slot) => self.connection_for_slot(slot).await,
            None => self.random_connection().await,
        }
    }

    fn close(&self) {
        self.cache.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::key_slot;
    use crate::core::command;
    use crate::mocks::{cluster_slots_frame, MockCluster, MockConnector};
    use crate::proto::frame::Frame;
    use parking_lot::Mutex;

    fn node(port: u16) -> HostAndPort {
        MockCluster::node(port)
    }

    async fn provider(cluster: &MockCluster) -> ClusterConnectionProvider {
        ClusterConnectionProvider::new(
            vec![node(7000)],
            Arc::new(cluster.connector()),
            &ClusterConfig::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_keyed_command_goes_to_slot_owner() {
        let cluster = MockCluster::three_nodes();
        let provider = provider(&cluster).await;

        let conn = provider.connection(&command::get("foo")).await.unwrap();
        assert_eq!(conn.addr(), &cluster.owner(key_slot("foo")));

        let pinned = provider
            .connection(&command::ping().with_slot(16000))
            .await
            .unwrap();
        assert_eq!(pinned.addr(), &node(7002));
    }

    #[tokio::test]
    async fn test_cross_slot_rejected() {
        let cluster = MockCluster::three_nodes();
        let provider = provider(&cluster).await;
        assert!(matches!(
            provider.connection(&command::mget(["foo", "bar"])).await,
            Err(Error::CrossSlot)
        ));
    }

    #[tokio::test]
    async fn test_keyless_command_skips_dead_nodes() {
        let cluster = MockCluster::three_nodes();
        let connector = cluster.connector();
        let provider = provider(&cluster).await;
        connector.set_down(&node(7000), true);
        connector.set_down(&node(7001), true);

        for _ in 0..5 {
            let conn = provider.connection(&command::ping()).await.unwrap();
            assert_eq!(conn.addr(), &node(7002));
        }
    }

    #[tokio::test]
    async fn test_no_reachable_node() {
        let cluster = MockCluster::three_nodes();
        let connector = cluster.connector();
        let provider = provider(&cluster).await;
        for port in [7000, 7001, 7002] {
            connector.set_down(&node(port), true);
        }

        let err = provider.random_connection().await.unwrap_err();
        assert!(matches!(err, Error::NoReachableNode { source: Some(_) }));
    }

    #[tokio::test]
    async fn test_unassigned_slot_refreshes_then_falls_back() {
        let reply = Arc::new(Mutex::new(cluster_slots_frame(&[(
            0,
            100,
            node(7000),
            vec![],
        )])));
        let current = Arc::clone(&reply);
        let connector = MockConnector::with_handler(move |_, cmd| {
            Ok(match cmd.name().as_str() {
                "CLUSTER" => current.lock().clone(),
                "PING" => Frame::simple("PONG"),
                _ => Frame::simple("OK"),
            })
        });
        let provider = ClusterConnectionProvider::new(
            vec![node(7000)],
            Arc::new(connector.clone()),
            &ClusterConfig::default().with_allow_partial_slots(true),
        )
        .await
        .unwrap();

        // Slot 200 shows up on refresh.
        *reply.lock() = cluster_slots_frame(&[
            (0, 100, node(7000), vec![]),
            (101, 300, node(7001), vec![]),
        ]);
        let conn = provider.connection_for_slot(200).await.unwrap();
        assert_eq!(conn.addr(), &node(7001));
        assert_eq!(connector.count("CLUSTER SLOTS"), 2);

        // Slot 5000 stays unassigned: refresh, then any live node.
        let conn = provider.connection_for_slot(5000).await.unwrap();
        assert!([node(7000), node(7001)].contains(conn.addr()));
        assert_eq!(connector.count("CLUSTER SLOTS"), 3);
    }

    #[tokio::test]
    async fn test_replica_connection_falls_back_to_owner() {
        let cluster = MockCluster::three_nodes();
        cluster.add_replica(&node(7001), node(7004));
        let provider = provider(&cluster).await;

        let conn = provider.connection_for_slot_replica(6000).await.unwrap();
        assert_eq!(conn.addr(), &node(7004));
        let conn = provider.connection_for_slot_replica(0).await.unwrap();
        assert_eq!(conn.addr(), &node(7000));
    }

    #[tokio::test]
    async fn test_connection_to_new_node() {
        let cluster = MockCluster::three_nodes();
        let provider = provider(&cluster).await;

        let conn = provider.connection_to(&node(7005)).await.unwrap();
        assert_eq!(conn.addr(), &node(7005));
        assert!(provider.cache().nodes().contains(&node(7005)));
    }

    #[tokio::test]
    async fn test_close_closes_pools() {
        let cluster = MockCluster::three_nodes();
        let provider = provider(&cluster).await;
        let pools = provider.primary_pools();
        assert_eq!(pools.len(), 3);

        ConnectionProvider::close(&provider);
        assert!(pools.iter().all(ConnectionPool::is_closed));
    }
}
