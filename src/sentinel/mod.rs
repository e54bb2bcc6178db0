//! # Sentinel-tracked master
//!
//! [`SentinelConnectionProvider`] asks a set of Sentinels where a named
//! master lives, keeps a pool pointed at it, and follows failovers announced
//! on the `+switch-master` channel. One listener task runs per Sentinel.

use std::time::Duration;

use crate::core::config::{ConnectionConfig, PoolConfig};
use crate::core::node::HostAndPort;

pub mod client;
mod provider;

pub use client::{parse_switch_master, SentinelClient, SentinelConnector, TcpSentinelConnector};
pub use provider::SentinelConnectionProvider;

/// Channel on which Sentinels announce a master change.
pub const SWITCH_MASTER_CHANNEL: &str = "+switch-master";

/// Default wait before a listener reconnects to its Sentinel.
pub const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// How long a listener waits before reconnecting after losing its Sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResubscribeDelay {
    /// Same wait every time.
    Constant(Duration),
    /// Doubles from `initial` on each failed attempt, up to `max`.
    Exponential {
        /// First wait.
        initial: Duration,
        /// Upper bound.
        max: Duration,
    },
}

impl Default for ResubscribeDelay {
    fn default() -> Self {
        ResubscribeDelay::Constant(DEFAULT_RESUBSCRIBE_DELAY)
    }
}

impl ResubscribeDelay {
    /// Wait before reconnect number `attempt` (0-based since the last
    /// successful subscribe).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            ResubscribeDelay::Constant(wait) => wait,
            ResubscribeDelay::Exponential { initial, max } => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Settings for a [`SentinelConnectionProvider`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SentinelConfig {
    /// Logical master name monitored by the Sentinels.
    pub master_name: String,
    /// Sentinel addresses, queried in order at startup.
    pub sentinels: Vec<HostAndPort>,
    /// Listener reconnect policy.
    pub resubscribe_delay: ResubscribeDelay,
    /// Settings for connections to the master.
    pub master_connection: ConnectionConfig,
    /// Settings for connections to the Sentinels.
    pub sentinel_connection: ConnectionConfig,
    /// Pool bounds for the master.
    pub pool: PoolConfig,
}

impl SentinelConfig {
    /// Config with default connection, pool and reconnect settings.
    pub fn new(master_name: impl Into<String>, sentinels: Vec<HostAndPort>) -> Self {
        Self {
            master_name: master_name.into(),
            sentinels,
            resubscribe_delay: ResubscribeDelay::default(),
            master_connection: ConnectionConfig::default(),
            sentinel_connection: ConnectionConfig::default(),
            pool: PoolConfig::default(),
        }
    }

    /// Sets the reconnect policy.
    pub fn with_resubscribe_delay(mut self, delay: ResubscribeDelay) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Sets how master connections are opened.
    pub fn with_master_connection(mut self, config: ConnectionConfig) -> Self {
        self.master_connection = config;
        self
    }

    /// Sets how Sentinel connections are opened.
    pub fn with_sentinel_connection(mut self, config: ConnectionConfig) -> Self {
        self.sentinel_connection = config;
        self
    }

    /// Sets the master pool bounds.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }
}
