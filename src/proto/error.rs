use std::io;

use thiserror::Error;

use crate::core::node::HostAndPort;

/// Result type alias for routis operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by connections, pools and the routing executors.
///
/// Executors only look at an error's [`ErrorClass`] and, for redirects, at
/// the target carried by [`Error::Moved`] / [`Error::Ask`]. Terminal errors
/// keep the last low-level cause as their source.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An IO error occurred.
    #[error("IO error: {source}")]
    Io {
        /// The underlying IO error.
        #[from]
        source: io::Error,
    },

    /// The connection could not be used (closed, refused, no longer usable).
    #[error("connection error: {message}")]
    Connection {
        /// Description of the failure.
        message: String,
    },

    /// Connecting or waiting for a reply took too long.
    #[error("timed out: {message}")]
    Timeout {
        /// What timed out.
        message: String,
    },

    /// A protocol error occurred.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the error.
        message: String,
    },

    /// The server returned an error.
    #[error("server error: {message}")]
    Server {
        /// Error message from server.
        message: String,
    },

    /// Authentication failed.
    #[error("authentication failed")]
    Auth,

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of invalid argument.
        message: String,
    },

    /// Redis Cluster: the slot permanently moved to another node.
    ///
    /// The client retries against `address` and refreshes its slot table.
    #[error("MOVED slot {slot} to {address}")]
    Moved {
        /// The slot number (0-16383).
        slot: u16,
        /// The node now owning the slot.
        address: HostAndPort,
    },

    /// Redis Cluster: the key is being migrated (ASK redirect).
    ///
    /// The client sends `ASKING` to `address` before replaying the command.
    /// The slot table is left alone.
    #[error("ASK slot {slot} to {address}")]
    Ask {
        /// The slot number (0-16383).
        slot: u16,
        /// The node temporarily serving the key.
        address: HostAndPort,
    },

    /// Redis Cluster is down or unavailable.
    #[error("CLUSTERDOWN cluster is down")]
    ClusterDown,

    /// Multi-key operation with keys in different slots (cluster mode).
    #[error("CROSSSLOT keys in multi-key operation map to different slots")]
    CrossSlot,

    /// No connection became available within the pool's wait limit.
    #[error("connection pool for {address} exhausted")]
    PoolExhausted {
        /// Node the pool points at.
        address: HostAndPort,
    },

    /// The pool was closed and no longer hands out connections.
    #[error("connection pool for {address} is closed")]
    PoolClosed {
        /// Node the pool points at.
        address: HostAndPort,
    },

    /// No node answered a topology query.
    #[error("cluster topology unavailable: {message}")]
    TopologyUnavailable {
        /// Why discovery failed.
        message: String,
        /// First failure seen while trying nodes.
        #[source]
        source: Option<Box<Error>>,
    },

    /// Every known cluster node failed a liveness check.
    #[error("no reachable node in cluster")]
    NoReachableNode {
        /// First failure seen while probing nodes.
        #[source]
        source: Option<Box<Error>>,
    },

    /// A retrying executor ran out of attempts.
    #[error("no more attempts left")]
    AttemptsExhausted {
        /// Last failure observed before giving up.
        #[source]
        source: Option<Box<Error>>,
    },

    /// A retrying executor passed its total retry deadline.
    #[error("retry deadline exceeded")]
    DeadlineExceeded {
        /// Last failure observed before giving up.
        #[source]
        source: Option<Box<Error>>,
    },

    /// A broadcast command failed on some nodes or got differing replies.
    #[error("broadcast failed on {} of {total} nodes", failures.len())]
    Broadcast {
        /// Number of nodes the command was sent to.
        total: usize,
        /// Nodes that failed, with the rendered error (or a mismatch note).
        failures: Vec<(HostAndPort, String)>,
    },

    /// An endpoint's circuit breaker refused the call.
    #[error("circuit breaker '{endpoint}' does not permit calls")]
    CallNotPermitted {
        /// Name of the endpoint whose breaker is open.
        endpoint: String,
    },

    /// No endpoint is left to fail over to.
    #[error(
        "endpoint could not fail over: no further endpoint is configured after '{endpoint}'; \
         fail back or restart with an available endpoint"
    )]
    NoFurtherEndpoint {
        /// Name of the last endpoint that was tried.
        endpoint: String,
        /// Failure that triggered the exhausted failover, if any.
        #[source]
        source: Option<Box<Error>>,
    },

    /// Operator input or a failback target did not validate.
    #[error("validation failed: {message}")]
    Validation {
        /// Description of the problem.
        message: String,
        /// Health probe failure, if that is what failed.
        #[source]
        source: Option<Box<Error>>,
    },

    /// Sentinel answered but could not tell us where the master is.
    #[error("sentinel error: {message}")]
    Sentinel {
        /// Description of the problem.
        message: String,
    },
}

/// Coarse error categories used by retry and circuit-breaker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Transport failures: refused, reset, closed, timed out.
    Connection,
    /// MOVED / ASK.
    Redirect,
    /// Pool exhausted or closed.
    Pool,
    /// Error replies and protocol violations.
    Server,
    /// Cluster-level terminal conditions.
    Cluster,
    /// Circuit breaker denials and endpoint exhaustion.
    Failover,
    /// Bad input or failed validation.
    Validation,
}

impl Error {
    /// Builds a [`Error::Connection`] from a message.
    pub fn connection(message: impl Into<String>) -> Self {
        Error::Connection {
            message: message.into(),
        }
    }

    /// Returns the category this error belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Io { .. } | Error::Connection { .. } | Error::Timeout { .. } => {
                ErrorClass::Connection
            }
            Error::Moved { .. } | Error::Ask { .. } => ErrorClass::Redirect,
            Error::PoolExhausted { .. } | Error::PoolClosed { .. } => ErrorClass::Pool,
            Error::Protocol { .. }
            | Error::Server { .. }
            | Error::Auth
            | Error::ClusterDown
            | Error::CrossSlot
            | Error::Sentinel { .. } => ErrorClass::Server,
            Error::TopologyUnavailable { .. }
            | Error::NoReachableNode { .. }
            | Error::AttemptsExhausted { .. }
            | Error::DeadlineExceeded { .. }
            | Error::Broadcast { .. } => ErrorClass::Cluster,
            Error::CallNotPermitted { .. } | Error::NoFurtherEndpoint { .. } => {
                ErrorClass::Failover
            }
            Error::InvalidArgument { .. } | Error::Validation { .. } => ErrorClass::Validation,
        }
    }

    /// Returns true for transport-level failures that justify a retry.
    pub fn is_connection_error(&self) -> bool {
        self.class() == ErrorClass::Connection
    }

    /// Returns true for MOVED and ASK replies.
    pub fn is_redirect(&self) -> bool {
        self.class() == ErrorClass::Redirect
    }
}
