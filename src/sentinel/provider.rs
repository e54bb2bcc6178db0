use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::core::command::Cmd;
use crate::core::config::PoolConfig;
use crate::core::connection::{Connector, TcpConnector};
use crate::core::node::HostAndPort;
use crate::core::pool::{ConnectionPool, PooledConnection};
use crate::core::provider::ConnectionProvider;
use crate::proto::error::{Error, Result};
use crate::sentinel::client::{parse_switch_master, SentinelConnector, TcpSentinelConnector};
use crate::sentinel::{ResubscribeDelay, SentinelConfig, SWITCH_MASTER_CHANNEL};

struct MasterState {
    master: HostAndPort,
    pool: ConnectionPool,
}

struct Shared {
    master_name: String,
    connector: Arc<dyn Connector>,
    pool_config: PoolConfig,
    state: ArcSwap<MasterState>,
    write_lock: Mutex<()>,
}

impl Shared {
    /// Points the pool at `master`. Returns false if it already was.
    fn init_master(&self, master: HostAndPort) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.state.load_full();
        if current.master == master {
            return false;
        }
        let pool = ConnectionPool::new(
            master.clone(),
            Arc::clone(&self.connector),
            self.pool_config.clone(),
        );
        self.state.store(Arc::new(MasterState {
            master: master.clone(),
            pool,
        }));
        // Borrowed connections go back to the retired pool and are closed there.
        current.pool.close();
        info!(
            master_name = %self.master_name,
            from = %current.master,
            to = %master,
            "master changed, switched connection pool"
        );
        true
    }
}

/// Keeps a connection pool pointed at the master a set of Sentinels reports.
///
/// A listener task per Sentinel re-queries the master on every (re)connect
/// and then follows `+switch-master` announcements. A master change swaps in
/// a new pool; connections already borrowed from the old pool stay usable
/// and are closed when returned.
pub struct SentinelConnectionProvider {
    shared: Arc<Shared>,
    sentinels: Vec<HostAndPort>,
    shutdown: watch::Sender<bool>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl SentinelConnectionProvider {
    /// Discovers the master over TCP and starts the listeners.
    ///
    /// # Errors
    ///
    /// See [`SentinelConnectionProvider::with_connectors`].
    pub async fn new(config: SentinelConfig) -> Result<Self> {
        let connector = Arc::new(TcpConnector::new(config.master_connection.clone()));
        let sentinels = Arc::new(TcpSentinelConnector::new(
            config.sentinel_connection.clone(),
        ));
        Self::with_connectors(config, connector, sentinels).await
    }

    /// Discovers the master through `sentinel_connector` and starts the
    /// listeners. Master connections are opened with `connector`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] with no Sentinel configured,
    /// [`Error::Sentinel`] if Sentinels answered but none knows the master,
    /// and [`Error::Connection`] if no Sentinel could be reached.
    #[instrument(level = "debug", skip_all, fields(master_name = %config.master_name))]
    pub async fn with_connectors(
        config: SentinelConfig,
        connector: Arc<dyn Connector>,
        sentinel_connector: Arc<dyn SentinelConnector>,
    ) -> Result<Self> {
        if config.sentinels.is_empty() {
            return Err(Error::InvalidArgument {
                message: "at least one sentinel address is required".to_string(),
            });
        }
        let master =
            initial_master(&config.master_name, &config.sentinels, &*sentinel_connector).await?;
        info!(master_name = %config.master_name, %master, "redis master running");

        let shared = Arc::new(Shared {
            master_name: config.master_name.clone(),
            state: ArcSwap::from_pointee(MasterState {
                pool: ConnectionPool::new(
                    master.clone(),
                    Arc::clone(&connector),
                    config.pool.clone(),
                ),
                master,
            }),
            connector,
            pool_config: config.pool,
            write_lock: Mutex::new(()),
        });

        let (shutdown, _) = watch::channel(false);
        let listeners = config
            .sentinels
            .iter()
            .map(|sentinel| {
                tokio::spawn(listen(
                    Arc::clone(&shared),
                    Arc::clone(&sentinel_connector),
                    sentinel.clone(),
                    config.resubscribe_delay,
                    shutdown.subscribe(),
                ))
            })
            .collect();

        Ok(Self {
            shared,
            sentinels: config.sentinels,
            shutdown,
            listeners: Mutex::new(listeners),
        })
    }

    /// Logical name of the tracked master.
    pub fn master_name(&self) -> &str {
        &self.shared.master_name
    }

    /// Address of the current master.
    pub fn current_master(&self) -> HostAndPort {
        self.shared.state.load().master.clone()
    }

    /// Pool of the current master.
    pub fn pool(&self) -> ConnectionPool {
        self.shared.state.load().pool.clone()
    }

    /// Configured Sentinel addresses.
    pub fn sentinels(&self) -> &[HostAndPort] {
        &self.sentinels
    }

    /// Number of listener tasks still running.
    pub fn running_listeners(&self) -> usize {
        self.listeners
            .lock()
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }
}

impl fmt::Debug for SentinelConnectionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SentinelConnectionProvider")
            .field("master_name", &self.shared.master_name)
            .field("master", &self.shared.state.load().master)
            .field("sentinels", &self.sentinels)
            .finish()
    }
}

#[async_trait]
impl ConnectionProvider for SentinelConnectionProvider {
    /// Borrows from the current master's pool.
    ///
    /// A borrower parked on a pool that a master switch retired moves on to
    /// the new pool instead of failing.
    async fn connection(&self, _cmd: &Cmd) -> Result<PooledConnection> {
        let mut pool = self.pool();
        loop {
            match pool.get().await {
                Err(e @ Error::PoolClosed { .. }) => {
                    let current = self.pool();
                    if current.same_pool(&pool) {
                        return Err(e);
                    }
                    debug!(master = %current.addr(), "pool retired by master switch, retrying");
                    pool = current;
                }
                other => return other,
            }
        }
    }

    fn close(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        debug!(master_name = %self.shared.master_name, "stopping sentinel listeners");
        self.shared.state.load().pool.close();
    }
}

impl Drop for SentinelConnectionProvider {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn initial_master(
    master_name: &str,
    sentinels: &[HostAndPort],
    connector: &dyn SentinelConnector,
) -> Result<HostAndPort> {
    let mut sentinel_available = false;
    for sentinel in sentinels {
        debug!(%sentinel, "connecting to sentinel");
        let reply = match connector.connect(sentinel).await {
            Ok(mut client) => client.get_master_addr_by_name(master_name).await,
            Err(e) => Err(e),
        };
        match reply {
            Ok(Some(master)) => {
                debug!(%sentinel, %master, "found master");
                return Ok(master);
            }
            Ok(None) => {
                sentinel_available = true;
                warn!(%sentinel, master_name, "master name is not monitored by sentinel");
            }
            Err(e) => warn!(%sentinel, error = %e, "cannot get master address from sentinel"),
        }
    }

    if sentinel_available {
        Err(Error::Sentinel {
            message: format!(
                "can connect to sentinel, but {master_name} seems to be not monitored"
            ),
        })
    } else {
        Err(Error::connection(format!(
            "all sentinels down, cannot determine where {master_name} master is running"
        )))
    }
}

async fn listen(
    shared: Arc<Shared>,
    connector: Arc<dyn SentinelConnector>,
    sentinel: HostAndPort,
    delay: ResubscribeDelay,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt = 0u32;
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            result = session(&shared, &*connector, &sentinel, &mut attempt) => {
                if let Err(e) = result {
                    warn!(%sentinel, error = %e, "lost connection to sentinel");
                }
            }
        }

        let wait = delay.delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!(%sentinel, ?wait, "reconnecting to sentinel");
        tokio::select! {
            _ = shutdown.changed() => break,
            () = tokio::time::sleep(wait) => {}
        }
    }
    debug!(%sentinel, "sentinel listener stopped");
}

/// One connection's worth of listening. Only returns on error.
async fn session(
    shared: &Shared,
    connector: &dyn SentinelConnector,
    sentinel: &HostAndPort,
    attempt: &mut u32,
) -> Result<()> {
    let mut client = connector.connect(sentinel).await?;

    // Catch up on switches missed while disconnected.
    match client.get_master_addr_by_name(&shared.master_name).await? {
        Some(master) => {
            shared.init_master(master);
        }
        None => warn!(
            %sentinel,
            master_name = %shared.master_name,
            "cannot get master address from sentinel"
        ),
    }

    client.subscribe(SWITCH_MASTER_CHANNEL).await?;
    *attempt = 0;
    debug!(%sentinel, "subscribed to {}", SWITCH_MASTER_CHANNEL);

    loop {
        let message = client.next_message().await?;
        match parse_switch_master(&shared.master_name, &message) {
            Ok(Some(master)) => {
                shared.init_master(master);
            }
            Ok(None) => debug!(%sentinel, %message, "ignoring switch for another master"),
            Err(e) => error!(%sentinel, error = %e, "invalid message received on sentinel"),
        }
    }
}
