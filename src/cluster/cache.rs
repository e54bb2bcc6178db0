//! Client-side slot table and per-node pools.
//!
//! Readers load an immutable `SlotSnapshot` without locking. Every change
//! builds a new snapshot and swaps it in under `write_lock`, so a lookup
//! never sees a half-built table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::cluster::commands::cluster_slots;
use crate::cluster::slot::SLOT_COUNT;
use crate::cluster::topology::ClusterTopology;
use crate::cluster::ClusterConfig;
use crate::core::config::PoolConfig;
use crate::core::connection::Connector;
use crate::core::node::HostAndPort;
use crate::core::pool::{ConnectionPool, PooledConnection};
use crate::proto::error::{Error, Result};

#[derive(Debug)]
struct SlotSnapshot {
    /// Index into `owners` per slot.
    slots: Arc<[Option<u16>]>,
    owners: Vec<HostAndPort>,
    /// Replicas of each owner, parallel to `owners`.
    replicas: Vec<Vec<HostAndPort>>,
    pools: HashMap<HostAndPort, ConnectionPool>,
    partial: bool,
}

impl SlotSnapshot {
    fn empty() -> Self {
        Self {
            slots: vec![None; usize::from(SLOT_COUNT)].into(),
            owners: Vec::new(),
            replicas: Vec::new(),
            pools: HashMap::new(),
            partial: true,
        }
    }

    fn owner_index(&self, slot: u16) -> Option<usize> {
        let index = (*self.slots.get(usize::from(slot))?)?;
        Some(usize::from(index))
    }

    fn owner(&self, slot: u16) -> Option<&HostAndPort> {
        self.owners.get(self.owner_index(slot)?)
    }

    fn replicas(&self, slot: u16) -> &[HostAndPort] {
        self.owner_index(slot)
            .and_then(|index| self.replicas.get(index))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Slot-to-node map plus one [`ConnectionPool`] per known node.
///
/// Built once from the seed nodes by [`SlotTopologyCache::discover`] and
/// kept current by [`SlotTopologyCache::refresh`].
pub struct SlotTopologyCache {
    seeds: Vec<HostAndPort>,
    connector: Arc<dyn Connector>,
    pool_config: PoolConfig,
    allow_partial_slots: bool,
    snapshot: ArcSwap<SlotSnapshot>,
    write_lock: Mutex<()>,
    rediscover: tokio::sync::Mutex<()>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SlotTopologyCache {
    /// Creates an empty cache. Nothing is contacted until
    /// [`discover`](Self::discover).
    pub fn new(
        seeds: Vec<HostAndPort>,
        connector: Arc<dyn Connector>,
        config: &ClusterConfig,
    ) -> Self {
        Self {
            seeds,
            connector,
            pool_config: config.pool.clone(),
            allow_partial_slots: config.allow_partial_slots,
            snapshot: ArcSwap::from_pointee(SlotSnapshot::empty()),
            write_lock: Mutex::new(()),
            rediscover: tokio::sync::Mutex::new(()),
            refresh_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// The configured seed nodes.
    pub fn seeds(&self) -> &[HostAndPort] {
        &self.seeds
    }

    /// Builds the slot table from the first seed node that answers.
    ///
    /// Seeds are tried in random order over fresh connections.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TopologyUnavailable`] if there are no seeds or none
    /// of them returned a usable slot table; the first failure is attached.
    #[instrument(level = "debug", skip_all, fields(seeds = self.seeds.len()))]
    pub async fn discover(&self) -> Result<()> {
        let mut seeds = self.seeds.clone();
        seeds.shuffle(&mut rand::thread_rng());

        let mut first_error = None;
        for seed in &seeds {
            match self.fetch_from_seed(seed).await {
                Ok(topology) => {
                    self.install(&topology);
                    info!(
                        seed = %seed,
                        nodes = self.snapshot.load().pools.len(),
                        "cluster topology discovered"
                    );
                    return Ok(());
                }
                Err(e) => {
                    debug!(seed = %seed, error = %e, "seed did not return topology");
                    first_error.get_or_insert(e);
                }
            }
        }

        Err(Error::TopologyUnavailable {
            message: "could not initialize cluster slots cache".to_string(),
            source: first_error.map(Box::new),
        })
    }

    /// Re-reads the slot table.
    ///
    /// Sources are tried in order: `hint` (the connection that observed the
    /// stale routing), the seed nodes, then every other known node in random
    /// order. The first valid reply wins. If another refresh is already
    /// running this returns at once.
    ///
    /// Returns true if a new table was installed.
    #[instrument(level = "debug", skip_all)]
    pub async fn refresh(&self, hint: Option<&mut PooledConnection>) -> bool {
        let Ok(_guard) = self.rediscover.try_lock() else {
            debug!("topology refresh already in progress");
            return false;
        };

        if let Some(conn) = hint {
            match self.fetch(conn).await {
                Ok(topology) => {
                    self.install(&topology);
                    debug!(source = %conn.addr(), "topology refreshed");
                    return true;
                }
                Err(e) => debug!(source = %conn.addr(), error = %e, "refresh via hint failed"),
            }
        }

        for seed in &self.seeds {
            match self.fetch_from_seed(seed).await {
                Ok(topology) => {
                    self.install(&topology);
                    debug!(source = %seed, "topology refreshed");
                    return true;
                }
                Err(e) => debug!(source = %seed, error = %e, "refresh via seed failed"),
            }
        }

        for pool in self.shuffled_pools() {
            if self.seeds.contains(pool.addr()) {
                continue;
            }
            let result = match pool.get().await {
                Ok(mut conn) => self.fetch(&mut conn).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(topology) => {
                    self.install(&topology);
                    debug!(source = %pool.addr(), "topology refreshed");
                    return true;
                }
                Err(e) => debug!(source = %pool.addr(), error = %e, "refresh via node failed"),
            }
        }

        warn!("topology refresh failed on every known node");
        false
    }

    /// Returns the pool of the node owning `slot`, if assigned.
    pub fn resolve(&self, slot: u16) -> Option<ConnectionPool> {
        let snapshot = self.snapshot.load();
        let owner = snapshot.owner(slot)?;
        snapshot.pools.get(owner).cloned()
    }

    /// Returns the pool of a replica serving `slot`, picked at random.
    ///
    /// `None` if the slot is unassigned or its owner has no replicas.
    pub fn resolve_replica(&self, slot: u16) -> Option<ConnectionPool> {
        let snapshot = self.snapshot.load();
        let pools: Vec<_> = snapshot
            .replicas(slot)
            .iter()
            .filter_map(|node| snapshot.pools.get(node))
            .collect();
        pools.choose(&mut rand::thread_rng()).map(|&p| p.clone())
    }

    /// Returns the replicas of the node owning `slot`.
    pub fn slot_replicas(&self, slot: u16) -> Vec<HostAndPort> {
        self.snapshot.load().replicas(slot).to_vec()
    }

    /// Returns the node owning `slot`, if assigned.
    pub fn slot_owner(&self, slot: u16) -> Option<HostAndPort> {
        self.snapshot.load().owner(slot).cloned()
    }

    /// Returns true if the installed table leaves some slot unassigned.
    pub fn is_partial(&self) -> bool {
        self.snapshot.load().partial
    }

    /// A pool picked at random among all known nodes.
    pub fn random_pool(&self) -> Option<ConnectionPool> {
        let snapshot = self.snapshot.load();
        let pools: Vec<_> = snapshot.pools.values().collect();
        pools.choose(&mut rand::thread_rng()).map(|&p| p.clone())
    }

    /// Every known node's pool, in random order.
    pub fn shuffled_pools(&self) -> Vec<ConnectionPool> {
        let mut pools: Vec<_> = self.snapshot.load().pools.values().cloned().collect();
        pools.shuffle(&mut rand::thread_rng());
        pools
    }

    /// Pools of the nodes owning at least one slot.
    pub fn primaries(&self) -> Vec<ConnectionPool> {
        let snapshot = self.snapshot.load();
        snapshot
            .owners
            .iter()
            .filter_map(|node| snapshot.pools.get(node).cloned())
            .collect()
    }

    /// Every known node, primaries and replicas.
    pub fn nodes(&self) -> Vec<HostAndPort> {
        let mut nodes: Vec<_> = self.snapshot.load().pools.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// The pool for `node`, if the node is known.
    pub fn pool(&self, node: &HostAndPort) -> Option<ConnectionPool> {
        self.snapshot.load().pools.get(node).cloned()
    }

    /// The pool for `node`, created if the node is not known yet.
    ///
    /// Redirect targets may point at nodes the last refresh did not see.
    pub fn setup_node_if_not_exist(&self, node: &HostAndPort) -> ConnectionPool {
        if let Some(pool) = self.pool(node) {
            return pool;
        }

        let _write = self.write_lock.lock();
        let current = self.snapshot.load_full();
        if let Some(pool) = current.pools.get(node) {
            return pool.clone();
        }
        let pool = self.new_pool(node);
        if self.closed.load(Ordering::Acquire) {
            pool.close();
            return pool;
        }
        let mut pools = current.pools.clone();
        pools.insert(node.clone(), pool.clone());
        self.snapshot.store(Arc::new(SlotSnapshot {
            slots: Arc::clone(&current.slots),
            owners: current.owners.clone(),
            replicas: current.replicas.clone(),
            pools,
            partial: current.partial,
        }));
        debug!(node = %node, "added pool for new node");
        pool
    }

    /// Refreshes the topology every `period` until the cache is closed or
    /// dropped.
    pub fn start_periodic_refresh(self: &Arc<Self>, period: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else { break };
                if cache.closed.load(Ordering::Acquire) {
                    break;
                }
                cache.refresh(None).await;
            }
        });
        if let Some(previous) = self.refresh_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops background refresh and closes every pool.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.refresh_task.lock().take() {
            task.abort();
        }
        let _write = self.write_lock.lock();
        let old = self.snapshot.swap(Arc::new(SlotSnapshot::empty()));
        for pool in old.pools.values() {
            pool.close();
        }
        debug!("slot topology cache closed");
    }

    fn new_pool(&self, node: &HostAndPort) -> ConnectionPool {
        ConnectionPool::new(
            node.clone(),
            Arc::clone(&self.connector),
            self.pool_config.clone(),
        )
    }

    async fn fetch_from_seed(&self, seed: &HostAndPort) -> Result<ClusterTopology> {
        let mut conn = self.connector.connect(seed).await?;
        let reply = conn.execute(&cluster_slots()).await;
        conn.close();
        self.validate(ClusterTopology::from_cluster_slots(&reply?)?)
    }

    async fn fetch(&self, conn: &mut PooledConnection) -> Result<ClusterTopology> {
        let reply = conn.execute(&cluster_slots()).await?;
        self.validate(ClusterTopology::from_cluster_slots(&reply)?)
    }

    fn validate(&self, topology: ClusterTopology) -> Result<ClusterTopology> {
        if self.allow_partial_slots {
            return Ok(topology);
        }
        if topology.is_empty() {
            return Err(Error::TopologyUnavailable {
                message: "cluster slots list is empty".to_string(),
                source: None,
            });
        }
        if !topology.has_full_coverage() {
            return Err(Error::TopologyUnavailable {
                message: "cluster slots have holes".to_string(),
                source: None,
            });
        }
        Ok(topology)
    }

    /// Replaces the snapshot with `topology`, keeping pools of nodes that
    /// are still present and closing the rest.
    fn install(&self, topology: &ClusterTopology) {
        let _write = self.write_lock.lock();
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let current = self.snapshot.load_full();

        let mut pools = HashMap::new();
        for node in topology.nodes() {
            let pool = current
                .pools
                .get(&node)
                .cloned()
                .unwrap_or_else(|| self.new_pool(&node));
            pools.insert(node, pool);
        }

        let owners = topology.primaries();
        let mut replicas = vec![Vec::new(); owners.len()];
        let mut slots = vec![None; usize::from(SLOT_COUNT)];
        for range in &topology.slot_ranges {
            let index = owners.iter().position(|o| o == &range.primary);
            if let Some(known) = index.and_then(|i| replicas.get_mut(i)) {
                for replica in &range.replicas {
                    if !known.contains(replica) {
                        known.push(replica.clone());
                    }
                }
            }
            // At most SLOT_COUNT owners, so the index always fits.
            let index = index.and_then(|i| u16::try_from(i).ok());
            for slot in range.start..=range.end {
                slots[usize::from(slot)] = index;
            }
        }
        let partial = slots.iter().any(Option::is_none);

        let departed: Vec<_> = current
            .pools
            .iter()
            .filter(|(node, _)| !pools.contains_key(*node))
            .map(|(node, pool)| (node.clone(), pool.clone()))
            .collect();

        self.snapshot.store(Arc::new(SlotSnapshot {
            slots: slots.into(),
            owners,
            replicas,
            pools,
            partial,
        }));

        // Borrowers woken by the close must already see the new table.
        for (node, pool) in departed {
            info!(node = %node, "node left the cluster topology, closing its pool");
            pool.close();
        }
    }
}

impl std::fmt::Debug for SlotTopologyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot.load();
        f.debug_struct("SlotTopologyCache")
            .field("seeds", &self.seeds)
            .field("nodes", &snapshot.pools.len())
            .field("partial", &snapshot.partial)
            .finish()
    }
}

impl Drop for SlotTopologyCache {
    fn drop(&mut self) {
        if let Some(task) = self.refresh_task.get_mut().take() {
            task.abort();
        }
    }
}
