//! Parsing utilities for Redis Cluster error responses.
//!
//! Redis Cluster uses special error responses for redirects:
//! - `MOVED <slot> <host>:<port>` - Permanent redirect
//! - `ASK <slot> <host>:<port>` - Temporary redirect during migration
//! - `CLUSTERDOWN` - Cluster is unavailable

use crate::core::node::HostAndPort;
use crate::proto::error::Error;

/// Parses a Redis error message and converts cluster redirects to typed errors.
///
/// # Returns
///
/// - `Error::Moved` for MOVED redirects
/// - `Error::Ask` for ASK redirects
/// - `Error::ClusterDown` for CLUSTERDOWN errors
/// - `Error::CrossSlot` for CROSSSLOT errors
/// - `Error::Server` for everything else, including malformed redirects
///
/// # Examples
///
/// ```
/// use routis::cluster::parse_redis_error;
/// use routis::Error;
///
/// let err = parse_redis_error(b"MOVED 3999 127.0.0.1:7000");
/// assert!(matches!(err, Error::Moved { slot: 3999, .. }));
/// ```
pub fn parse_redis_error(error_msg: &[u8]) -> Error {
    let msg = String::from_utf8_lossy(error_msg);
    let msg = msg.trim();

    if let Some(stripped) = msg.strip_prefix("MOVED ") {
        if let Some((slot, address)) = parse_redirect(stripped) {
            return Error::Moved { slot, address };
        }
    }

    if let Some(stripped) = msg.strip_prefix("ASK ") {
        if let Some((slot, address)) = parse_redirect(stripped) {
            return Error::Ask { slot, address };
        }
    }

    if msg.starts_with("CLUSTERDOWN") {
        return Error::ClusterDown;
    }

    if msg.starts_with("CROSSSLOT") {
        return Error::CrossSlot;
    }

    Error::Server {
        message: msg.to_string(),
    }
}

/// Parses redirect arguments: "<slot> <host>:<port>"
fn parse_redirect(args: &str) -> Option<(u16, HostAndPort)> {
    let mut parts = args.split_whitespace();
    let slot: u16 = parts.next()?.parse().ok()?;
    let address = parts.next()?;
    if parts.next().is_some() || !address.contains(':') {
        return None;
    }
    let address = HostAndPort::parse(address).ok()?;
    Some((slot, address))
}
