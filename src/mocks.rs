//! In-memory Redis nodes and Sentinels for tests.
//!
//! Compiled for unit tests and behind the `test-utils` feature.
//!
//! [`MockConnector`] plugs into any pool in place of the TCP connector. Every
//! command is answered by a handler closure; nodes can be marked down, slowed
//! down and inspected afterwards. [`MockCluster`] builds a handler that
//! behaves like a small Redis Cluster (slot ownership, `MOVED`, `ASK`,
//! `CLUSTER SLOTS`), and [`MockSentinels`] stands in for a Sentinel
//! deployment.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::core::command::Cmd;
use crate::core::connection::{Connection, Connector};
use crate::core::node::HostAndPort;
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

type Handler = dyn Fn(&HostAndPort, &Cmd) -> Result<Frame> + Send + Sync;

#[derive(Default)]
struct NodeStats {
    connects: usize,
    closes: usize,
}

struct MockState {
    handler: RwLock<Arc<Handler>>,
    down: Mutex<HashSet<HostAndPort>>,
    latency: Mutex<Option<Duration>>,
    log: Mutex<Vec<(HostAndPort, String)>>,
    stats: Mutex<HashMap<HostAndPort, NodeStats>>,
}

/// Scriptable [`Connector`] producing in-memory connections.
///
/// The default handler answers `PING` with `PONG` and everything else with
/// `OK`.
#[derive(Clone)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// Creates a connector with the default handler.
    pub fn new() -> Self {
        Self::with_handler(|_, cmd| {
            Ok(match cmd.name().as_str() {
                "PING" => Frame::simple("PONG"),
                _ => Frame::simple("OK"),
            })
        })
    }

    /// Creates a connector answering every command with `handler`.
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&HostAndPort, &Cmd) -> Result<Frame> + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(MockState {
                handler: RwLock::new(Arc::new(handler)),
                down: Mutex::new(HashSet::new()),
                latency: Mutex::new(None),
                log: Mutex::new(Vec::new()),
                stats: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Replaces the handler for subsequent commands.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&HostAndPort, &Cmd) -> Result<Frame> + Send + Sync + 'static,
    {
        *self.state.handler.write() = Arc::new(handler);
    }

    /// Marks a node down (refuses connects, resets open connections) or up.
    pub fn set_down(&self, node: &HostAndPort, down: bool) {
        let mut set = self.state.down.lock();
        if down {
            set.insert(node.clone());
        } else {
            set.remove(node);
        }
    }

    /// Delays every command by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.state.latency.lock() = latency;
    }

    fn is_down(&self, node: &HostAndPort) -> bool {
        self.state.down.lock().contains(node)
    }

    /// Commands received by `node`, rendered as space-separated text.
    pub fn commands(&self, node: &HostAndPort) -> Vec<String> {
        self.state
            .log
            .lock()
            .iter()
            .filter(|(n, _)| n == node)
            .map(|(_, line)| line.clone())
            .collect()
    }

    /// Every command received, in arrival order.
    pub fn all_commands(&self) -> Vec<(HostAndPort, String)> {
        self.state.log.lock().clone()
    }

    /// How many received commands start with `prefix` (e.g. `"CLUSTER SLOTS"`).
    pub fn count(&self, prefix: &str) -> usize {
        self.state
            .log
            .lock()
            .iter()
            .filter(|(_, line)| line.starts_with(prefix))
            .count()
    }

    /// Forgets the command log.
    pub fn clear_log(&self) {
        self.state.log.lock().clear();
    }

    /// Connections opened to `node`.
    pub fn connect_count(&self, node: &HostAndPort) -> usize {
        self.state.stats.lock().get(node).map_or(0, |s| s.connects)
    }

    /// Connections to `node` closed by their owner.
    pub fn close_count(&self, node: &HostAndPort) -> usize {
        self.state.stats.lock().get(node).map_or(0, |s| s.closes)
    }
}

impl fmt::Debug for MockConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnector")
            .field("down", &*self.state.down.lock())
            .finish()
    }
}

fn render(cmd: &Cmd) -> String {
    cmd.args()
        .iter()
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, addr: &HostAndPort) -> Result<Box<dyn Connection>> {
        if self.is_down(addr) {
            return Err(Error::Io {
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            });
        }
        self.state
            .stats
            .lock()
            .entry(addr.clone())
            .or_default()
            .connects += 1;
        Ok(Box::new(MockConnection {
            addr: addr.clone(),
            connector: self.clone(),
            broken: false,
            closed: false,
        }))
    }
}

/// Connection handed out by [`MockConnector`].
pub struct MockConnection {
    addr: HostAndPort,
    connector: MockConnector,
    broken: bool,
    closed: bool,
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnection")
            .field("addr", &self.addr)
            .field("broken", &self.broken)
            .finish()
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn addr(&self) -> &HostAndPort {
        &self.addr
    }

    async fn send_command(&mut self, cmd: &Cmd) -> Result<Frame> {
        if self.broken {
            return Err(Error::connection(format!("connection to {} is closed", self.addr)));
        }
        let latency = *self.connector.state.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.connector.is_down(&self.addr) {
            self.broken = true;
            return Err(Error::Io {
                source: io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"),
            });
        }
        self.connector
            .state
            .log
            .lock()
            .push((self.addr.clone(), render(cmd)));
        let handler = Arc::clone(&*self.connector.state.handler.read());
        let result = handler(&self.addr, cmd);
        if matches!(&result, Err(e) if e.is_connection_error()) {
            self.broken = true;
        }
        result
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    fn close(&mut self) {
        self.broken = true;
        if !self.closed {
            self.closed = true;
            self.connector
                .state
                .stats
                .lock()
                .entry(self.addr.clone())
                .or_default()
                .closes += 1;
        }
    }
}

/// Builds a `CLUSTER SLOTS` reply from `(start, end, primary, replicas)`.
pub fn cluster_slots_frame(ranges: &[(u16, u16, HostAndPort, Vec<HostAndPort>)]) -> Frame {
    let node = |n: &HostAndPort| {
        Frame::Array(vec![
            Frame::bulk(n.host().to_string()),
            Frame::Integer(i64::from(n.port())),
            Frame::bulk(format!("{:040x}", n.port())),
        ])
    };
    Frame::Array(
        ranges
            .iter()
            .map(|(start, end, primary, replicas)| {
                let mut entry = vec![
                    Frame::Integer(i64::from(*start)),
                    Frame::Integer(i64::from(*end)),
                    node(primary),
                ];
                entry.extend(replicas.iter().map(node));
                Frame::Array(entry)
            })
            .collect(),
    )
}

#[cfg(feature = "cluster")]
pub use cluster::MockCluster;

#[cfg(feature = "cluster")]
mod cluster {
    use super::*;
    use crate::cluster::slot::{command_slot, SLOT_COUNT};

    struct ClusterState {
        owners: Vec<HostAndPort>,
        replicas: HashMap<HostAndPort, Vec<HostAndPort>>,
        migrating: HashMap<u16, HostAndPort>,
        asking: HashSet<HostAndPort>,
        readonly: HashSet<HostAndPort>,
        data: HashMap<Bytes, Bytes>,
    }

    impl ClusterState {
        fn slots_reply(&self) -> Frame {
            let mut ranges = Vec::new();
            let mut start = 0usize;
            while start < self.owners.len() {
                let owner = &self.owners[start];
                let mut end = start;
                while end + 1 < self.owners.len() && &self.owners[end + 1] == owner {
                    end += 1;
                }
                let replicas = self.replicas.get(owner).cloned().unwrap_or_default();
                ranges.push((start as u16, end as u16, owner.clone(), replicas));
                start = end + 1;
            }
            cluster_slots_frame(&ranges)
        }
    }

    /// A simulated Redis Cluster served through a [`MockConnector`].
    ///
    /// Keyed commands sent to the wrong node get `MOVED`; a slot marked as
    /// migrating answers `ASK` from its owner and is served by the target
    /// after `ASKING`. A replica that got `READONLY` serves `GET` for its
    /// primary's slots. `GET`/`SET`/`DEL` work against a shared key space.
    #[derive(Clone)]
    pub struct MockCluster {
        connector: MockConnector,
        state: Arc<Mutex<ClusterState>>,
    }

    impl MockCluster {
        /// Creates a cluster where each `(start, end, node)` range is owned
        /// by `node`. Ranges must cover all slots.
        pub fn new(ranges: &[(u16, u16, HostAndPort)]) -> Self {
            let mut owners = vec![ranges[0].2.clone(); SLOT_COUNT as usize];
            for (start, end, node) in ranges {
                for slot in *start..=*end {
                    owners[slot as usize] = node.clone();
                }
            }
            let state = Arc::new(Mutex::new(ClusterState {
                owners,
                replicas: HashMap::new(),
                migrating: HashMap::new(),
                asking: HashSet::new(),
                readonly: HashSet::new(),
                data: HashMap::new(),
            }));
            let handler_state = Arc::clone(&state);
            let connector =
                MockConnector::with_handler(move |node, cmd| respond(&handler_state, node, cmd));
            Self { connector, state }
        }

        /// Three primaries splitting the slot space evenly.
        pub fn three_nodes() -> Self {
            Self::new(&[
                (0, 5460, Self::node(7000)),
                (5461, 10922, Self::node(7001)),
                (10923, 16383, Self::node(7002)),
            ])
        }

        /// `127.0.0.1:<port>`.
        pub fn node(port: u16) -> HostAndPort {
            HostAndPort::new("127.0.0.1", port)
        }

        /// The connector serving this cluster.
        pub fn connector(&self) -> MockConnector {
            self.connector.clone()
        }

        /// Advertises `replica` for `primary` in `CLUSTER SLOTS`.
        pub fn add_replica(&self, primary: &HostAndPort, replica: HostAndPort) {
            self.state
                .lock()
                .replicas
                .entry(primary.clone())
                .or_default()
                .push(replica);
        }

        /// Hands slots `start..=end` to `node` (server-side resharding).
        pub fn move_slots(&self, start: u16, end: u16, node: &HostAndPort) {
            let mut state = self.state.lock();
            for slot in start..=end {
                state.owners[slot as usize] = node.clone();
            }
        }

        /// Starts migrating `slot` to `target`: the owner answers `ASK`.
        pub fn set_migrating(&self, slot: u16, target: &HostAndPort) {
            self.state.lock().migrating.insert(slot, target.clone());
        }

        /// The node currently owning `slot`.
        pub fn owner(&self, slot: u16) -> HostAndPort {
            self.state.lock().owners[slot as usize].clone()
        }
    }

    fn respond(state: &Mutex<ClusterState>, node: &HostAndPort, cmd: &Cmd) -> Result<Frame> {
        let mut state = state.lock();
        let asking = state.asking.remove(node);
        match cmd.name().as_str() {
            "PING" => return Ok(Frame::simple("PONG")),
            "ASKING" => {
                state.asking.insert(node.clone());
                return Ok(Frame::simple("OK"));
            }
            "READONLY" => {
                state.readonly.insert(node.clone());
                return Ok(Frame::simple("OK"));
            }
            "CLUSTER" => return Ok(state.slots_reply()),
            _ => {}
        }

        let slot = match command_slot(cmd) {
            Ok(Some(slot)) => slot,
            Ok(None) => return Ok(Frame::simple("OK")),
            Err(_) => {
                return Ok(Frame::Error(
                    b"CROSSSLOT Keys in request don't hash to the same slot".to_vec(),
                ))
            }
        };
        let owner = state.owners[slot as usize].clone();
        let migrating = state.migrating.get(&slot).cloned();
        let replica_read = cmd.name() == "GET"
            && state.readonly.contains(node)
            && state
                .replicas
                .get(&owner)
                .map_or(false, |replicas| replicas.contains(node));
        match migrating {
            Some(target) if &target == node && asking => {}
            Some(target) if &owner == node => {
                return Ok(Frame::Error(format!("ASK {slot} {target}").into_bytes()));
            }
            _ if &owner != node && !replica_read => {
                return Ok(Frame::Error(format!("MOVED {slot} {owner}").into_bytes()));
            }
            _ => {}
        }

        let args = cmd.args();
        Ok(match cmd.name().as_str() {
            "GET" => Frame::BulkString(state.data.get(&args[1]).cloned()),
            "SET" => {
                state.data.insert(args[1].clone(), args[2].clone());
                Frame::simple("OK")
            }
            "DEL" => {
                let removed = args[1..]
                    .iter()
                    .filter(|k| state.data.remove(*k).is_some())
                    .count();
                Frame::Integer(removed as i64)
            }
            _ => Frame::simple("OK"),
        })
    }
}

pub use sentinel::MockSentinels;

mod sentinel {
    use super::*;
    use crate::sentinel::client::{SentinelClient, SentinelConnector};
    use tokio::sync::mpsc;

    struct SentinelState {
        masters: HashMap<String, HostAndPort>,
        down: HashSet<HostAndPort>,
        subscribers: Vec<(HostAndPort, mpsc::UnboundedSender<String>)>,
        queries: usize,
        connects: HashMap<HostAndPort, usize>,
    }

    /// A set of simulated Sentinels sharing one view of the masters.
    #[derive(Clone)]
    pub struct MockSentinels {
        state: Arc<Mutex<SentinelState>>,
    }

    impl Default for MockSentinels {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockSentinels {
        /// Creates sentinels that monitor nothing yet.
        pub fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(SentinelState {
                    masters: HashMap::new(),
                    down: HashSet::new(),
                    subscribers: Vec::new(),
                    queries: 0,
                    connects: HashMap::new(),
                })),
            }
        }

        /// Sets the address returned for `name` without publishing an event.
        pub fn set_master(&self, name: &str, master: HostAndPort) {
            self.state.lock().masters.insert(name.to_string(), master);
        }

        /// Fails over `name` to `new_master` and publishes `+switch-master`
        /// to every subscribed sentinel connection.
        pub fn switch_master(&self, name: &str, new_master: HostAndPort) {
            let mut state = self.state.lock();
            let old = state
                .masters
                .insert(name.to_string(), new_master.clone())
                .unwrap_or_else(|| new_master.clone());
            let message = format!(
                "{name} {} {} {} {}",
                old.host(),
                old.port(),
                new_master.host(),
                new_master.port()
            );
            state
                .subscribers
                .retain(|(_, tx)| tx.send(message.clone()).is_ok());
        }

        /// Publishes a raw message on the `+switch-master` channel.
        pub fn publish(&self, message: &str) {
            self.state
                .lock()
                .subscribers
                .retain(|(_, tx)| tx.send(message.to_string()).is_ok());
        }

        /// Marks a sentinel down (refuses connects, drops subscriptions) or up.
        pub fn set_down(&self, sentinel: &HostAndPort, down: bool) {
            let mut state = self.state.lock();
            if down {
                state.down.insert(sentinel.clone());
                state.subscribers.retain(|(addr, _)| addr != sentinel);
            } else {
                state.down.remove(sentinel);
            }
        }

        /// Number of live subscriptions.
        pub fn subscriber_count(&self) -> usize {
            let mut state = self.state.lock();
            state.subscribers.retain(|(_, tx)| !tx.is_closed());
            state.subscribers.len()
        }

        /// Number of `GET-MASTER-ADDR-BY-NAME` queries answered.
        pub fn query_count(&self) -> usize {
            self.state.lock().queries
        }

        /// Connections opened to `sentinel`.
        pub fn connect_count(&self, sentinel: &HostAndPort) -> usize {
            self.state
                .lock()
                .connects
                .get(sentinel)
                .copied()
                .unwrap_or(0)
        }
    }

    impl fmt::Debug for MockSentinels {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("MockSentinels")
                .field("masters", &self.state.lock().masters)
                .finish()
        }
    }

    struct MockSentinelClient {
        addr: HostAndPort,
        state: Arc<Mutex<SentinelState>>,
        messages: Option<mpsc::UnboundedReceiver<String>>,
    }

    impl fmt::Debug for MockSentinelClient {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("MockSentinelClient")
                .field("addr", &self.addr)
                .finish()
        }
    }

    fn lost(addr: &HostAndPort) -> Error {
        Error::connection(format!("sentinel {addr} unreachable"))
    }

    #[async_trait]
    impl SentinelClient for MockSentinelClient {
        async fn get_master_addr_by_name(&mut self, master_name: &str) -> Result<Option<HostAndPort>> {
            let mut state = self.state.lock();
            if state.down.contains(&self.addr) {
                return Err(lost(&self.addr));
            }
            state.queries += 1;
            Ok(state.masters.get(master_name).cloned())
        }

        async fn subscribe(&mut self, channel: &str) -> Result<()> {
            debug_assert_eq!(channel, crate::sentinel::SWITCH_MASTER_CHANNEL);
            let mut state = self.state.lock();
            if state.down.contains(&self.addr) {
                return Err(lost(&self.addr));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            state.subscribers.push((self.addr.clone(), tx));
            self.messages = Some(rx);
            Ok(())
        }

        async fn next_message(&mut self) -> Result<String> {
            let rx = self
                .messages
                .as_mut()
                .ok_or_else(|| Error::connection("not subscribed"))?;
            rx.recv().await.ok_or_else(|| lost(&self.addr))
        }
    }

    #[async_trait]
    impl SentinelConnector for MockSentinels {
        async fn connect(&self, addr: &HostAndPort) -> Result<Box<dyn SentinelClient>> {
            let mut state = self.state.lock();
            if state.down.contains(addr) {
                return Err(Error::Io {
                    source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
                });
            }
            *state.connects.entry(addr.clone()).or_default() += 1;
            Ok(Box::new(MockSentinelClient {
                addr: addr.clone(),
                state: Arc::clone(&self.state),
                messages: None,
            }))
        }
    }
}
