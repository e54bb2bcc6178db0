//! # Cluster routing
//!
//! Redis Cluster support with slot-based routing, topology discovery,
//! and redirect handling (MOVED/ASK).
//!
//! ## Features
//!
//! - **Slot-based routing**: commands go to the node owning their key's slot
//! - **Topology discovery**: uses CLUSTER SLOTS to map slots to nodes
//! - **Redirect handling**: MOVED refreshes the slot table, ASK replays with `ASKING`
//! - **Connection pooling**: one pool per known node
//! - **Hash tags**: Redis hash tags `{...}` keep multi-key operations on one slot
//!
//! ## Example
//!
//! ```no_run
//! # async fn example() -> routis::Result<()> {
//! use routis::ClientBuilder;
//!
//! let client = ClientBuilder::new()
//!     .cluster("127.0.0.1:7000,127.0.0.1:7001")?
//!     .build()
//!     .await?;
//!
//! client.set("key", "value").await?;
//! let value = client.get("key").await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use crate::core::config::PoolConfig;

mod cache;
pub mod commands;
mod errors;
mod executor;
mod provider;
pub(crate) mod slot;
mod topology;

pub use cache::SlotTopologyCache;
pub use errors::parse_redis_error;
pub use executor::ClusterCommandExecutor;
pub use provider::ClusterConnectionProvider;
pub use slot::{command_slot, key_slot, SLOT_COUNT};
pub use topology::{ClusterTopology, SlotRange};

/// Default number of attempts per cluster command.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default wall-clock budget for all attempts of one command.
pub const DEFAULT_MAX_TOTAL_RETRIES_DURATION: Duration = Duration::from_secs(10);

/// Cluster routing settings.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClusterConfig {
    /// Attempts per command, redirects included.
    pub max_attempts: u32,
    /// Deadline for all attempts of one command.
    pub max_total_retries_duration: Duration,
    /// Refresh the slot table in the background at this period.
    pub topology_refresh_period: Option<Duration>,
    /// Accept `CLUSTER SLOTS` replies that leave slots unassigned.
    pub allow_partial_slots: bool,
    /// Settings for each node's pool.
    pub pool: PoolConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_total_retries_duration: DEFAULT_MAX_TOTAL_RETRIES_DURATION,
            topology_refresh_period: None,
            allow_partial_slots: false,
            pool: PoolConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Sets the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the total retry deadline.
    pub fn with_max_total_retries_duration(mut self, duration: Duration) -> Self {
        self.max_total_retries_duration = duration;
        self
    }

    /// Enables background topology refresh.
    pub fn with_topology_refresh_period(mut self, period: Option<Duration>) -> Self {
        self.topology_refresh_period = period;
        self
    }

    /// Accepts slot tables with holes.
    pub fn with_allow_partial_slots(mut self, allow: bool) -> Self {
        self.allow_partial_slots = allow;
        self
    }

    /// Sets the per-node pool settings.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }
}
