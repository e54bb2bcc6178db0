//! Node addressing.

use std::fmt;
use std::str::FromStr;

use crate::proto::error::{Error, Result};

/// Default Redis port used when an address omits one.
pub const DEFAULT_PORT: u16 = 6379;

/// Network identity of a Redis node.
///
/// Two nodes are the same node exactly when host and port are equal; the
/// slot table, node pools and redirect targets are all keyed by this type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostAndPort {
    host: String,
    port: u16,
}

impl HostAndPort {
    /// Creates a node address from its parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns the host name or IP literal (IPv6 without brackets).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parses an address.
    ///
    /// Accepts `host:port`, `[v6]:port`, a bare host (port 6379) and
    /// `redis://host:port` / `rediss://host:port` URLs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an empty host, an invalid port
    /// or an unparseable URL.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.contains("://") {
            return Self::parse_url(input);
        }

        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| invalid(format!("unterminated IPv6 literal in '{input}'")))?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(invalid(format!("unexpected text after ']' in '{input}'"))),
            }
        } else {
            match input.rsplit_once(':') {
                // A bare IPv6 literal has several colons and no port.
                Some((host, _)) if host.contains(':') => (input, None),
                Some((host, port)) => (host, Some(port)),
                None => (input, None),
            }
        };

        if host.is_empty() {
            return Err(invalid(format!("missing host in '{input}'")));
        }
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| invalid(format!("invalid port in '{input}'")))?,
            None => DEFAULT_PORT,
        };
        Ok(Self::new(host, port))
    }

    fn parse_url(input: &str) -> Result<Self> {
        let url = url::Url::parse(input).map_err(|_| invalid(format!("invalid address '{input}'")))?;
        if url.scheme() != "redis" && url.scheme() != "rediss" {
            return Err(invalid(
                "invalid scheme, expected redis:// or rediss://".to_string(),
            ));
        }
        let host = url
            .host_str()
            .ok_or_else(|| invalid(format!("missing host in '{input}'")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(Self::new(host, url.port().unwrap_or(DEFAULT_PORT)))
    }

    /// Parses a comma-separated list of addresses, skipping empty entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when an entry is malformed or the
    /// list contains no address at all.
    pub fn parse_list(input: &str) -> Result<Vec<Self>> {
        let nodes = input
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect::<Result<Vec<_>>>()?;
        if nodes.is_empty() {
            return Err(invalid("no valid addresses provided".to_string()));
        }
        Ok(nodes)
    }

    /// Returns the `host:port` form used to open a socket.
    pub fn socket_addr(&self) -> String {
        self.to_string()
    }
}

fn invalid(message: String) -> Error {
    Error::InvalidArgument { message }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for HostAndPort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<(&str, u16)> for HostAndPort {
    fn from((host, port): (&str, u16)) -> Self {
        Self::new(host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let node = HostAndPort::parse("127.0.0.1:7000").unwrap();
        assert_eq!(node.host(), "127.0.0.1");
        assert_eq!(node.port(), 7000);
    }

    #[test]
    fn test_parse_bare_host_uses_default_port() {
        let node = HostAndPort::parse("redis-master.local").unwrap();
        assert_eq!(node, HostAndPort::new("redis-master.local", 6379));
    }

    #[test]
    fn test_parse_ipv6() {
        let node = HostAndPort::parse("[::1]:7000").unwrap();
        assert_eq!(node.host(), "::1");
        assert_eq!(node.port(), 7000);
        assert_eq!(node.to_string(), "[::1]:7000");

        let bare = HostAndPort::parse("2001:db8::1").unwrap();
        assert_eq!(bare.port(), 6379);
    }

    #[test]
    fn test_parse_url() {
        let node = HostAndPort::parse("redis://localhost:6380").unwrap();
        assert_eq!(node, HostAndPort::new("localhost", 6380));
        let node = HostAndPort::parse("rediss://cache.example.com").unwrap();
        assert_eq!(node, HostAndPort::new("cache.example.com", 6379));
        assert!(HostAndPort::parse("http://localhost:6379").is_err());
    }

    #[test]
    fn test_parse_invalid() {
        assert!(HostAndPort::parse("").is_err());
        assert!(HostAndPort::parse(":7000").is_err());
        assert!(HostAndPort::parse("host:port").is_err());
        assert!(HostAndPort::parse("host:70000").is_err());
        assert!(HostAndPort::parse("[::1").is_err());
    }

    #[test]
    fn test_parse_list() {
        let nodes = HostAndPort::parse_list("  127.0.0.1:7000  ,  127.0.0.1:7001 ,").unwrap();
        assert_eq!(
            nodes,
            vec![
                HostAndPort::new("127.0.0.1", 7000),
                HostAndPort::new("127.0.0.1", 7001)
            ]
        );
        assert!(HostAndPort::parse_list("").is_err());
        assert!(HostAndPort::parse_list(" , ").is_err());
    }

    #[test]
    fn test_display_roundtrips_through_parse() {
        let node = HostAndPort::new("10.0.0.5", 6379);
        assert_eq!(node.to_string().parse::<HostAndPort>().unwrap(), node);
    }
}
