//! Drives one cluster command through redirects, connection failures and
//! topology refreshes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::cluster::commands::{asking, readonly};
use crate::cluster::provider::ClusterConnectionProvider;
use crate::cluster::slot::command_slot;
use crate::cluster::ClusterConfig;
use crate::core::command::Cmd;
use crate::core::executor::{backoff_sleep, CommandExecutor};
use crate::core::node::HostAndPort;
use crate::core::pool::PooledConnection;
use crate::core::provider::ConnectionProvider;
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

#[derive(Debug, Clone)]
enum Redirect {
    Moved(HostAndPort),
    Ask(HostAndPort),
}

impl Redirect {
    fn target(&self) -> &HostAndPort {
        match self {
            Redirect::Moved(node) | Redirect::Ask(node) => node,
        }
    }
}

/// Cluster-aware executor.
///
/// Each command gets at most `max_attempts` attempts and must finish before
/// `max_total_retries_duration` elapses:
///
/// - `MOVED` replays on the named node and refreshes the slot table
/// - `ASK` replays on the named node after `ASKING`, without a refresh
/// - connection failures back off and refresh once two happen in a row
/// - a pool closed by a topology change is re-resolved like a redirect
/// - anything else is returned as is
///
/// [`execute_on_replica`](Self::execute_on_replica) runs the same loop but
/// reads from a replica of the slot owner.
#[derive(Debug, Clone)]
pub struct ClusterCommandExecutor {
    provider: Arc<ClusterConnectionProvider>,
    max_attempts: u32,
    max_total_retries_duration: Duration,
}

impl ClusterCommandExecutor {
    /// Creates an executor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `max_attempts` is zero.
    pub fn new(
        provider: Arc<ClusterConnectionProvider>,
        max_attempts: u32,
        max_total_retries_duration: Duration,
    ) -> Result<Self> {
        if max_attempts == 0 {
            return Err(Error::InvalidArgument {
                message: "max_attempts must be greater than 0".to_string(),
            });
        }
        Ok(Self {
            provider,
            max_attempts,
            max_total_retries_duration,
        })
    }

    /// Creates an executor with the attempt settings from `config`.
    pub fn from_config(
        provider: Arc<ClusterConnectionProvider>,
        config: &ClusterConfig,
    ) -> Result<Self> {
        Self::new(
            provider,
            config.max_attempts,
            config.max_total_retries_duration,
        )
    }

    /// The provider commands are routed through.
    pub fn provider(&self) -> &Arc<ClusterConnectionProvider> {
        &self.provider
    }

    /// Sends `cmd` to every primary.
    ///
    /// Returns the common reply when every node succeeded with the same
    /// reply.
    ///
    /// # Errors
    ///
    /// - [`Error::Broadcast`] listing the failing nodes, or the nodes whose
    ///   reply differs from the first one
    /// - [`Error::NoReachableNode`] if no primary is known
    #[instrument(level = "debug", skip_all, fields(cmd = %cmd.name()))]
    pub async fn broadcast(&self, cmd: &Cmd) -> Result<Frame> {
        let pools = self.provider.primary_pools();
        if pools.is_empty() {
            return Err(Error::NoReachableNode { source: None });
        }

        let replies = join_all(pools.iter().map(|pool| async move {
            let mut conn = pool.get().await?;
            conn.execute(cmd).await
        }))
        .await;

        let total = pools.len();
        let mut common: Option<Frame> = None;
        let mut failures = Vec::new();
        for (pool, reply) in pools.iter().zip(replies) {
            match reply {
                Ok(frame) => match &common {
                    None => common = Some(frame),
                    Some(first) if *first == frame => {}
                    Some(_) => failures.push((
                        pool.addr().clone(),
                        "reply differs from other nodes".to_string(),
                    )),
                },
                Err(e) => failures.push((pool.addr().clone(), e.to_string())),
            }
        }

        match common {
            Some(frame) if failures.is_empty() => Ok(frame),
            _ => {
                warn!(total, failed = failures.len(), "broadcast failed");
                Err(Error::Broadcast { total, failures })
            }
        }
    }

    /// Runs a read on a replica of the slot owner.
    ///
    /// The replica connection is put in `READONLY` mode first. Redirects,
    /// connection failures and the deadline are handled as in
    /// [`execute`](CommandExecutor::execute); a `MOVED` reply sends the
    /// command on to the named primary. Keyless commands go to any node.
    #[instrument(level = "trace", skip_all, fields(cmd = %cmd.name()))]
    pub async fn execute_on_replica(&self, cmd: &Cmd) -> Result<Frame> {
        self.route(cmd, true).await
    }

    async fn acquire(
        &self,
        slot: Option<u16>,
        redirect: Option<&Redirect>,
        replica: bool,
    ) -> Result<PooledConnection> {
        match (redirect, slot) {
            (Some(redirect), _) => self.provider.connection_to(redirect.target()).await,
            (None, Some(slot)) if replica => self.provider.connection_for_slot_replica(slot).await,
            (None, Some(slot)) => self.provider.connection_for_slot(slot).await,
            (None, None) => self.provider.random_connection().await,
        }
    }

    async fn run(
        conn: &mut PooledConnection,
        cmd: &Cmd,
        redirect: Option<&Redirect>,
        readonly_mode: bool,
    ) -> Result<Frame> {
        match redirect {
            Some(Redirect::Ask(_)) => {
                conn.execute(&asking()).await?;
            }
            None if readonly_mode => {
                conn.execute(&readonly()).await?;
            }
            _ => {}
        }
        conn.execute(cmd).await
    }

    /// Returns true if the topology was refreshed, which resets the
    /// consecutive failure count and any pending redirect.
    async fn handle_connection_problem(
        &self,
        attempts_left: u32,
        consecutive_failures: u32,
        deadline: Instant,
    ) -> Result<bool> {
        if self.max_attempts < 3 {
            // Not enough attempts for a probe; refresh before the last one.
            if attempts_left == 0 {
                self.provider.renew_slot_cache(None).await;
                return Ok(true);
            }
            return Ok(false);
        }

        if consecutive_failures < 2 {
            return Ok(false);
        }

        let sleep = backoff_sleep(attempts_left, deadline)?;
        debug!(?sleep, attempts_left, "backing off before topology refresh");
        tokio::time::sleep(sleep).await;
        self.provider.renew_slot_cache(None).await;
        Ok(true)
    }

    async fn route(&self, cmd: &Cmd, replica: bool) -> Result<Frame> {
        let slot = command_slot(cmd)?;
        let readonly_mode = replica && slot.is_some();
        let deadline = Instant::now() + self.max_total_retries_duration;

        let mut redirect: Option<Redirect> = None;
        let mut consecutive_failures = 0u32;
        let mut last_error: Option<Error> = None;

        for attempts_left in (1..=self.max_attempts).rev() {
            let acquired = self.acquire(slot, redirect.as_ref(), replica).await;
            let (result, mut conn) = match acquired {
                Ok(mut conn) => {
                    let result = Self::run(&mut conn, cmd, redirect.as_ref(), readonly_mode).await;
                    (result, Some(conn))
                }
                Err(e) => (Err(e), None),
            };

            match result {
                Ok(frame) => return Ok(frame),
                Err(e) if e.is_connection_error() => {
                    debug!(error = %e, attempts_left, "connection failure");
                    drop(conn);
                    last_error = Some(e);
                    consecutive_failures += 1;
                    match self
                        .handle_connection_problem(attempts_left - 1, consecutive_failures, deadline)
                        .await
                    {
                        Ok(true) => {
                            consecutive_failures = 0;
                            redirect = None;
                        }
                        Ok(false) => {}
                        Err(_) => {
                            return Err(Error::DeadlineExceeded {
                                source: last_error.map(Box::new),
                            })
                        }
                    }
                }
                Err(e) if e.is_redirect() => {
                    consecutive_failures = 0;
                    let next = match &e {
                        Error::Moved { address, .. } => Redirect::Moved(address.clone()),
                        Error::Ask { address, .. } => Redirect::Ask(address.clone()),
                        _ => return Err(e),
                    };
                    debug!(redirect = ?next, "redirected");
                    if let Redirect::Moved(_) = next {
                        self.provider.renew_slot_cache(conn.as_mut()).await;
                    }
                    redirect = Some(next);
                    // A connection failure is a more useful cause than a redirect.
                    if last_error.as_ref().map_or(true, Error::is_redirect) {
                        last_error = Some(e);
                    }
                }
                Err(e @ Error::PoolClosed { .. }) if !self.provider.is_closed() => {
                    // The node left the topology while we waited on its pool.
                    debug!(error = %e, attempts_left, "pool retired, re-resolving");
                    redirect = None;
                    if last_error.is_none() {
                        last_error = Some(e);
                    }
                }
                Err(e) => return Err(e),
            }

            if Instant::now() > deadline {
                warn!(cmd = %cmd.name(), "cluster retry deadline exceeded");
                return Err(Error::DeadlineExceeded {
                    source: last_error.map(Box::new),
                });
            }
        }

        warn!(cmd = %cmd.name(), attempts = self.max_attempts, "no more cluster attempts left");
        Err(Error::AttemptsExhausted {
            source: last_error.map(Box::new),
        })
    }
}

#[async_trait]
impl CommandExecutor for ClusterCommandExecutor {
    #[instrument(level = "trace", skip_all, fields(cmd = %cmd.name()))]
    async fn execute(&self, cmd: &Cmd) -> Result<Frame> {
        self.route(cmd, false).await
    }

    fn close(&self) {
        self.provider.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::key_slot;
    use crate::core::command;
    use crate::core::config::PoolConfig;
    use crate::mocks::{cluster_slots_frame, MockCluster, MockConnector};
    use bytes::Bytes;

    fn node(port: u16) -> HostAndPort {
        MockCluster::node(port)
    }

    async fn executor_for(
        connector: &MockConnector,
        max_attempts: u32,
        duration: Duration,
    ) -> ClusterCommandExecutor {
        let provider = ClusterConnectionProvider::new(
            vec![node(7000)],
            Arc::new(connector.clone()),
            &ClusterConfig::default(),
        )
        .await
        .unwrap();
        ClusterCommandExecutor::new(Arc::new(provider), max_attempts, duration).unwrap()
    }

    #[tokio::test]
    async fn test_set_get_across_nodes() {
        let cluster = MockCluster::three_nodes();
        let executor = executor_for(&cluster.connector(), 5, Duration::from_secs(10)).await;

        for key in ["a", "b", "c", "foo", "{user}.1"] {
            let reply = executor.execute(&command::set(key, "v")).await.unwrap();
            assert_eq!(reply, Frame::simple("OK"));
        }
        let reply = executor.execute(&command::get("foo")).await.unwrap();
        assert_eq!(reply, Frame::BulkString(Some(Bytes::from("v"))));
        // Every command went straight to its owner.
        let owner = cluster.owner(key_slot("foo"));
        assert!(cluster.connector().commands(&owner).len() >= 2);
        assert_eq!(cluster.connector().count("CLUSTER SLOTS"), 1);
    }

    #[tokio::test]
    async fn test_moved_redirect_refreshes_topology() {
        let cluster = MockCluster::three_nodes();
        let connector = cluster.connector();
        let executor = executor_for(&connector, 5, Duration::from_secs(10)).await;
        let get = command::get("k").with_slot(500);

        cluster.move_slots(500, 500, &node(7001));
        connector.clear_log();

        let reply = executor.execute(&get).await.unwrap();
        assert!(reply.is_null());
        assert_eq!(connector.count("CLUSTER SLOTS"), 1);
        assert_eq!(executor.provider().cache().slot_owner(500), Some(node(7001)));

        // The next command for the slot goes straight to the new owner.
        connector.clear_log();
        executor.execute(&get).await.unwrap();
        assert_eq!(connector.all_commands(), vec![(node(7001), "GET k".to_string())]);
    }

    #[tokio::test]
    async fn test_moved_then_ask_refreshes_once() {
        let cluster = MockCluster::three_nodes();
        let connector = cluster.connector();
        let executor = executor_for(&connector, 5, Duration::from_secs(10)).await;

        cluster.move_slots(500, 500, &node(7001));
        cluster.set_migrating(500, &node(7002));
        connector.clear_log();

        let reply = executor
            .execute(&command::get("k").with_slot(500))
            .await
            .unwrap();
        assert!(reply.is_null());
        assert_eq!(connector.count("CLUSTER SLOTS"), 1);
        assert_eq!(
            connector.commands(&node(7002)),
            vec!["ASKING".to_string(), "GET k".to_string()]
        );
        // ASK does not change ownership.
        assert_eq!(executor.provider().cache().slot_owner(500), Some(node(7001)));
    }

    #[tokio::test]
    async fn test_replica_read() {
        let cluster = MockCluster::three_nodes();
        cluster.add_replica(&node(7000), node(7003));
        let connector = cluster.connector();
        let executor = executor_for(&connector, 5, Duration::from_secs(10)).await;
        executor
            .execute(&command::set("k", "v").with_slot(500))
            .await
            .unwrap();
        connector.clear_log();

        let reply = executor
            .execute_on_replica(&command::get("k").with_slot(500))
            .await
            .unwrap();
        assert_eq!(reply, Frame::BulkString(Some(Bytes::from("v"))));
        assert_eq!(
            connector.commands(&node(7003)),
            vec!["READONLY".to_string(), "GET k".to_string()]
        );
        assert!(connector.commands(&node(7000)).is_empty());

        // No replica: the owner serves the read.
        connector.clear_log();
        executor
            .execute_on_replica(&command::get("k").with_slot(6000))
            .await
            .unwrap();
        assert!(connector
            .commands(&node(7001))
            .contains(&"GET k".to_string()));
    }

    #[tokio::test]
    async fn test_replica_read_follows_moved() {
        let cluster = MockCluster::three_nodes();
        cluster.add_replica(&node(7000), node(7003));
        let connector = cluster.connector();
        let executor = executor_for(&connector, 5, Duration::from_secs(10)).await;

        cluster.move_slots(500, 500, &node(7001));
        connector.clear_log();

        let reply = executor
            .execute_on_replica(&command::get("k").with_slot(500))
            .await
            .unwrap();
        assert!(reply.is_null());
        assert_eq!(connector.count("CLUSTER SLOTS"), 1);
        assert!(connector
            .commands(&node(7001))
            .contains(&"GET k".to_string()));
        assert_eq!(executor.provider().cache().slot_owner(500), Some(node(7001)));
        assert!(executor.provider().cache().slot_replicas(500).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_on_departed_node_is_rerouted() {
        let cluster = MockCluster::three_nodes();
        let connector = cluster.connector();
        let config = ClusterConfig::default().with_pool(PoolConfig::default().with_max_size(1));
        let provider = ClusterConnectionProvider::new(
            vec![node(7000)],
            Arc::new(connector.clone()),
            &config,
        )
        .await
        .unwrap();
        let executor = ClusterCommandExecutor::from_config(Arc::new(provider), &config).unwrap();

        let held = executor.provider().connection_for_slot(16000).await.unwrap();
        assert_eq!(held.addr(), &node(7002));

        let waiter = {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor
                    .execute(&command::get("k").with_slot(16000))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        cluster.move_slots(10923, 16383, &node(7001));
        executor.provider().renew_slot_cache(None).await;

        assert!(waiter.await.unwrap().unwrap().is_null());
        assert!(connector
            .commands(&node(7001))
            .contains(&"GET k".to_string()));
        assert_eq!(connector.count("GET"), 1);
        drop(held);
        executor.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_wins_over_attempts() {
        let cluster = MockCluster::three_nodes();
        let connector = cluster.connector();
        let executor = executor_for(&connector, 100, Duration::from_millis(50)).await;

        connector.set_handler(|_, _| Err(Error::connection("reset")));
        connector.set_latency(Some(Duration::from_millis(20)));
        connector.clear_log();

        let started = Instant::now();
        let err = executor.execute(&command::get("foo")).await.unwrap_err();
        assert!(
            matches!(err, Error::DeadlineExceeded { source: Some(_) }),
            "{err:?}"
        );
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(connector.count("GET") < 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_exhausted_carries_last_error() {
        let cluster = MockCluster::three_nodes();
        let connector = cluster.connector();
        let executor = executor_for(&connector, 4, Duration::from_secs(10)).await;
        connector.set_handler(|_, cmd| match cmd.name().as_str() {
            "GET" => Err(Error::connection("reset")),
            _ => Ok(Frame::simple("OK")),
        });

        let err = executor.execute(&command::get("foo")).await.unwrap_err();
        match err {
            Error::AttemptsExhausted { source: Some(source) } => {
                assert!(source.is_connection_error())
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(connector.count("GET"), 4);
    }

    #[tokio::test]
    async fn test_few_attempts_refresh_only_before_last() {
        let only = node(7000);
        let slots = cluster_slots_frame(&[(0, 16383, only.clone(), vec![])]);
        let connector = MockConnector::with_handler(move |_, cmd| match cmd.name().as_str() {
            "CLUSTER" => Ok(slots.clone()),
            "GET" => Err(Error::connection("reset")),
            _ => Ok(Frame::simple("OK")),
        });
        let executor = executor_for(&connector, 2, Duration::from_secs(10)).await;
        connector.clear_log();

        let err = executor.execute(&command::get("foo")).await.unwrap_err();
        assert!(matches!(err, Error::AttemptsExhausted { .. }));
        assert_eq!(connector.count("GET"), 2);
        assert_eq!(connector.count("CLUSTER SLOTS"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_after_two_consecutive_failures() {
        let only = node(7000);
        let slots = cluster_slots_frame(&[(0, 16383, only.clone(), vec![])]);
        let connector = MockConnector::with_handler(move |_, cmd| match cmd.name().as_str() {
            "CLUSTER" => Ok(slots.clone()),
            "GET" => Err(Error::connection("reset")),
            _ => Ok(Frame::simple("OK")),
        });
        let executor = executor_for(&connector, 5, Duration::from_secs(3600)).await;
        connector.clear_log();

        executor.execute(&command::get("foo")).await.unwrap_err();
        // Failures 1-2 refresh, 3-4 refresh, the fifth is the last attempt.
        assert_eq!(connector.count("GET"), 5);
        assert_eq!(connector.count("CLUSTER SLOTS"), 2);
    }

    #[tokio::test]
    async fn test_server_errors_are_not_retried() {
        let cluster = MockCluster::three_nodes();
        let connector = cluster.connector();
        let executor = executor_for(&connector, 5, Duration::from_secs(10)).await;
        connector.set_handler(|_, _| {
            Ok(Frame::Error(b"WRONGTYPE Operation against a key".to_vec()))
        });
        connector.clear_log();

        let err = executor.execute(&command::get("foo")).await.unwrap_err();
        assert!(matches!(err, Error::Server { .. }));
        assert_eq!(connector.count("GET"), 1);
    }

    #[tokio::test]
    async fn test_cross_slot_fails_fast() {
        let cluster = MockCluster::three_nodes();
        let connector = cluster.connector();
        let executor = executor_for(&connector, 5, Duration::from_secs(10)).await;
        connector.clear_log();

        let err = executor
            .execute(&command::mget(["foo", "bar"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CrossSlot));
        assert!(connector.all_commands().is_empty());
    }

    #[tokio::test]
    async fn test_keyless_command_uses_any_node() {
        let cluster = MockCluster::three_nodes();
        let executor = executor_for(&cluster.connector(), 5, Duration::from_secs(10)).await;
        assert_eq!(
            executor.execute(&command::ping()).await.unwrap(),
            Frame::simple("PONG")
        );
    }

    #[tokio::test]
    async fn test_broadcast() {
        let cluster = MockCluster::three_nodes();
        let connector = cluster.connector();
        let executor = executor_for(&connector, 5, Duration::from_secs(10)).await;

        let reply = executor.broadcast(&Cmd::new("FLUSHALL")).await.unwrap();
        assert_eq!(reply, Frame::simple("OK"));
        assert_eq!(connector.count("FLUSHALL"), 3);

        connector.set_down(&node(7001), true);
        match executor.broadcast(&Cmd::new("FLUSHALL")).await.unwrap_err() {
            Error::Broadcast { total, failures } => {
                assert_eq!(total, 3);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, node(7001));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_reply_mismatch() {
        let cluster = MockCluster::three_nodes();
        let connector = cluster.connector();
        let executor = executor_for(&connector, 5, Duration::from_secs(10)).await;
        connector.set_handler(|node, _| Ok(Frame::Integer(i64::from(node.port()))));

        let err = executor.broadcast(&Cmd::new("DBSIZE")).await.unwrap_err();
        assert!(matches!(err, Error::Broadcast { total: 3, ref failures } if failures.len() == 2));
    }

    #[test]
    fn test_redirect_target() {
        assert_eq!(Redirect::Moved(node(1)).target(), &node(1));
        assert_eq!(Redirect::Ask(node(2)).target(), &node(2));
    }
}
