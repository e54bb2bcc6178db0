//! # Routis Core
//!
//! Node addressing, connections, pools and the two seams every deployment
//! shape plugs into.
//!
//! ## Modules
//!
//! - [`node`] - `HostAndPort`
//! - [`command`] - Command representation and builders
//! - [`connection`] - `Connection` / `Connector` and the TCP implementation
//! - [`pool`] - Bounded per-node pool
//! - [`provider`] - Where a command's connection comes from
//! - [`executor`] - How a command is driven to a reply
//! - [`builder`] - Client builder

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

pub use crate::proto::error::{Error, Result};

/// Client builder configuration.
pub mod builder;
/// Command construction helpers.
pub mod command;
/// Connection and pool settings.
pub mod config;
/// Low-level connection management.
pub mod connection;
/// Command executors.
pub mod executor;
/// Node addresses.
pub mod node;
/// Connection pooling.
pub mod pool;
/// Connection providers.
pub mod provider;

use crate::core::command::Cmd;
use crate::core::executor::CommandExecutor;
use crate::proto::frame::Frame;

/// High-level Redis client over any deployment shape.
///
/// Cheap to clone; clones share the executor and its pools. Build one with
/// [`builder::ClientBuilder`].
///
/// # Example
///
/// ```no_run
/// use routis::Client;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = Client::connect("redis://localhost:6379").await?;
///     client.set("key", "value").await?;
///     let value = client.get("key").await?;
///     assert_eq!(value.as_deref(), Some(&b"value"[..]));
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Client {
    executor: Arc<dyn CommandExecutor>,
}

impl Client {
    /// Wraps an executor.
    pub fn with_executor(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Connects to a single Redis node.
    ///
    /// # Arguments
    ///
    /// * `addr` - `host:port` or a `redis://host:port` URL
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unparseable address.
    pub async fn connect<T: AsRef<str>>(addr: T) -> Result<Self> {
        builder::ClientBuilder::new()
            .standalone(addr.as_ref())?
            .build()
            .await
    }

    /// The executor behind this client.
    pub fn executor(&self) -> &Arc<dyn CommandExecutor> {
        &self.executor
    }

    /// Executes an arbitrary command.
    pub async fn execute(&self, cmd: &Cmd) -> Result<Frame> {
        self.executor.execute(cmd).await
    }

    /// Sends a PING command to the server.
    pub async fn ping(&self) -> Result<()> {
        self.execute(&command::ping()).await.map(|_| ())
    }

    /// Echoes the provided message back from the server.
    pub async fn echo(&self, msg: &str) -> Result<Bytes> {
        let frame = self.execute(&command::echo(msg.to_string())).await?;
        Ok(command::frame_to_bytes(frame)?.unwrap_or_default())
    }

    /// Gets the value associated with the specified key.
    ///
    /// # Returns
    ///
    /// Returns `Some(Bytes)` if the key exists, or `None` if it does not.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let frame = self.execute(&command::get(key.to_string())).await?;
        command::frame_to_bytes(frame)
    }

    /// Sets the string value of a key.
    pub async fn set(&self, key: &str, value: impl Into<Bytes>) -> Result<()> {
        self.execute(&command::set(key.to_string(), value))
            .await
            .map(|_| ())
    }

    /// Sets the value of a key with an expiration time.
    pub async fn set_with_expiry(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        expiry: Duration,
    ) -> Result<()> {
        self.execute(&command::set_with_expiry(key.to_string(), value, expiry))
            .await
            .map(|_| ())
    }

    /// Increments the number stored at key by one.
    pub async fn incr(&self, key: &str) -> Result<i64> {
        let frame = self.execute(&command::incr(key.to_string())).await?;
        command::frame_to_int(frame)
    }

    /// Removes the specified key.
    ///
    /// # Returns
    ///
    /// `true` if the key was removed, `false` if the key did not exist.
    pub async fn del(&self, key: &str) -> Result<bool> {
        let frame = self.execute(&command::del([key.to_string()])).await?;
        Ok(command::frame_to_int(frame)? > 0)
    }

    /// Returns true if the key exists.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let frame = self.execute(&command::exists([key.to_string()])).await?;
        Ok(command::frame_to_int(frame)? > 0)
    }

    /// Releases pools and stops background tasks.
    pub fn close(&self) {
        self.executor.close();
    }
}
