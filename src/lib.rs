//! # Routis
//!
//! Connection routing and resilience for Redis clients: slot-aware routing
//! with MOVED/ASK handling for Redis Cluster, master tracking through
//! Sentinel, and circuit-breaker failover across independent endpoints.
//!
//! Every deployment shape is a [`core::executor::CommandExecutor`] over a
//! [`core::provider::ConnectionProvider`]; [`Client`] only talks to the
//! executor.
//!
//! ## Features
//!
//! - `cluster` - Redis Cluster routing (default)
//!
//! ## Example
//!
//! ```no_run
//! use routis::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::connect("redis://localhost:6379").await?;
//!     client.ping().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod core;
pub mod failover;
#[cfg(any(test, feature = "test-utils"))]
pub mod mocks;
pub mod proto;
pub mod sentinel;

#[cfg(feature = "cluster")]
pub mod cluster;

pub use crate::core::builder::ClientBuilder;
pub use crate::core::command::Cmd;
pub use crate::core::node::HostAndPort;
pub use crate::core::{Client, Error, Result};
pub use crate::proto::error::ErrorClass;
pub use crate::proto::frame::Frame;

#[cfg(feature = "cluster")]
pub use crate::cluster::key_slot;
