//! Talking to Sentinels.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::core::command::{self, Cmd};
use crate::core::config::ConnectionConfig;
use crate::core::connection::{connect_tcp, FramedStream};
use crate::core::node::HostAndPort;
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// One connection to a Sentinel.
///
/// After [`SentinelClient::subscribe`] the connection is in pub/sub mode and
/// only [`SentinelClient::next_message`] may be used.
#[async_trait]
pub trait SentinelClient: Send + fmt::Debug {
    /// `SENTINEL GET-MASTER-ADDR-BY-NAME`; `None` when the master is not
    /// monitored by this Sentinel.
    async fn get_master_addr_by_name(&mut self, master_name: &str) -> Result<Option<HostAndPort>>;

    /// Subscribes to `channel`.
    async fn subscribe(&mut self, channel: &str) -> Result<()>;

    /// Waits for the next message published on the subscribed channel.
    async fn next_message(&mut self) -> Result<String>;
}

/// Opens [`SentinelClient`]s.
#[async_trait]
pub trait SentinelConnector: Send + Sync + fmt::Debug {
    /// Connects to the Sentinel at `addr`.
    async fn connect(&self, addr: &HostAndPort) -> Result<Box<dyn SentinelClient>>;
}

/// Parses a `+switch-master` payload
/// (`<name> <old-ip> <old-port> <new-ip> <new-port>`).
///
/// Returns `Ok(None)` when the message is about another master.
///
/// # Errors
///
/// Returns [`Error::Protocol`] for a malformed message.
///
/// ```
/// use routis::sentinel::parse_switch_master;
/// use routis::HostAndPort;
///
/// let msg = "mymaster 10.0.0.1 6379 10.0.0.2 6380";
/// assert_eq!(
///     parse_switch_master("mymaster", msg).unwrap(),
///     Some(HostAndPort::new("10.0.0.2", 6380))
/// );
/// assert_eq!(parse_switch_master("other", msg).unwrap(), None);
/// ```
pub fn parse_switch_master(master_name: &str, message: &str) -> Result<Option<HostAndPort>> {
    let parts: Vec<&str> = message.split(' ').collect();
    if parts.len() < 5 {
        return Err(Error::Protocol {
            message: format!("invalid {} message: '{message}'", super::SWITCH_MASTER_CHANNEL),
        });
    }
    if parts[0] != master_name {
        return Ok(None);
    }
    let port = parts[4].parse().map_err(|_| Error::Protocol {
        message: format!("invalid port in switch-master message: '{message}'"),
    })?;
    Ok(Some(HostAndPort::new(parts[3], port)))
}

fn parse_master_addr(frame: Frame) -> Result<Option<HostAndPort>> {
    match frame {
        Frame::Null | Frame::BulkString(None) => Ok(None),
        Frame::Error(message) => Err(Error::Sentinel {
            message: String::from_utf8_lossy(&message).into_owned(),
        }),
        Frame::Array(items) if items.is_empty() => Ok(None),
        Frame::Array(items) if items.len() == 2 => {
            let host = items[0].as_text();
            let port = items[1].as_int().and_then(|p| u16::try_from(p).ok());
            match (host, port) {
                (Some(host), Some(port)) if !host.is_empty() => {
                    Ok(Some(HostAndPort::new(host, port)))
                }
                _ => Err(Error::Protocol {
                    message: "invalid master address reply".to_string(),
                }),
            }
        }
        other => Err(Error::Protocol {
            message: format!("unexpected master address reply: {other:?}"),
        }),
    }
}

/// Sentinel connection over TCP.
#[derive(Debug)]
pub struct TcpSentinelClient {
    addr: HostAndPort,
    framed: FramedStream<TcpStream>,
    response_timeout: Option<Duration>,
}

impl TcpSentinelClient {
    /// Connects and authenticates if a password is configured.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] or [`Error::Io`] if the socket cannot be
    /// opened and [`Error::Auth`] if authentication is rejected.
    pub async fn connect(addr: &HostAndPort, config: &ConnectionConfig) -> Result<Self> {
        let stream = connect_tcp(addr, config.connect_timeout).await?;
        let mut client = Self {
            addr: addr.clone(),
            framed: FramedStream::new(stream),
            response_timeout: config.response_timeout,
        };
        if let Some(password) = &config.password {
            let auth = match &config.username {
                Some(user) => command::auth_with_username(user.clone(), password.clone()),
                None => command::auth(password.clone()),
            };
            if let Frame::Error(_) = client.request(&auth).await? {
                return Err(Error::Auth);
            }
        }
        debug!(sentinel = %addr, "connected to sentinel");
        Ok(client)
    }

    async fn request(&mut self, cmd: &Cmd) -> Result<Frame> {
        let frame = cmd.to_frame();
        let limit = self.response_timeout;
        let framed = &mut self.framed;
        let round_trip = async {
            framed.write_frame(&frame).await?;
            framed.read_frame().await
        };
        match limit {
            Some(limit) => tokio::time::timeout(limit, round_trip)
                .await
                .map_err(|_| Error::Timeout {
                    message: format!("waiting for {} reply from sentinel", cmd.name()),
                })?,
            None => round_trip.await,
        }
    }
}

#[async_trait]
impl SentinelClient for TcpSentinelClient {
    async fn get_master_addr_by_name(&mut self, master_name: &str) -> Result<Option<HostAndPort>> {
        let cmd = command::sentinel_get_master_addr_by_name(master_name.to_string());
        let reply = self.request(&cmd).await?;
        parse_master_addr(reply)
    }

    async fn subscribe(&mut self, channel: &str) -> Result<()> {
        let reply = self.request(&command::subscribe(channel.to_string())).await?;
        let confirmed = reply
            .as_array()
            .and_then(|items| items.first())
            .and_then(Frame::as_text)
            .is_some_and(|kind| kind.eq_ignore_ascii_case("subscribe"));
        if !confirmed {
            return Err(Error::Protocol {
                message: format!("unexpected SUBSCRIBE reply from {}", self.addr),
            });
        }
        Ok(())
    }

    async fn next_message(&mut self) -> Result<String> {
        loop {
            let frame = self.framed.read_frame().await?;
            let Some(items) = frame.as_array() else {
                continue;
            };
            let is_message = items
                .first()
                .and_then(Frame::as_text)
                .is_some_and(|kind| kind.eq_ignore_ascii_case("message"));
            if is_message && items.len() == 3 {
                if let Some(payload) = items[2].as_text() {
                    return Ok(payload);
                }
            }
            trace!(sentinel = %self.addr, "skipping pub/sub frame");
        }
    }
}

/// Opens [`TcpSentinelClient`]s with a fixed [`ConnectionConfig`].
#[derive(Debug, Clone, Default)]
pub struct TcpSentinelConnector {
    config: ConnectionConfig,
}

impl TcpSentinelConnector {
    /// Creates a connector.
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SentinelConnector for TcpSentinelConnector {
    async fn connect(&self, addr: &HostAndPort) -> Result<Box<dyn SentinelClient>> {
        let client = TcpSentinelClient::connect(addr, &self.config).await?;
        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_switch_master() {
        let msg = "mymaster 127.0.0.1 6379 127.0.0.1 6380";
        assert_eq!(
            parse_switch_master("mymaster", msg).unwrap(),
            Some(HostAndPort::new("127.0.0.1", 6380))
        );
        assert_eq!(parse_switch_master("cache", msg).unwrap(), None);
        assert!(matches!(
            parse_switch_master("mymaster", "mymaster 127.0.0.1 6379"),
            Err(Error::Protocol { .. })
        ));
        assert!(parse_switch_master("mymaster", "mymaster a 1 b port").is_err());
    }

    #[test]
    fn test_parse_master_addr() {
        let reply = Frame::Array(vec![Frame::bulk("10.0.0.5"), Frame::bulk("6379")]);
        assert_eq!(
            parse_master_addr(reply).unwrap(),
            Some(HostAndPort::new("10.0.0.5", 6379))
        );
        assert_eq!(parse_master_addr(Frame::Null).unwrap(), None);
        assert_eq!(parse_master_addr(Frame::Array(Vec::new())).unwrap(), None);
        assert!(matches!(
            parse_master_addr(Frame::Error(b"ERR unknown".to_vec())),
            Err(Error::Sentinel { .. })
        ));
        assert!(parse_master_addr(Frame::Array(vec![Frame::bulk("h")])).is_err());
    }

    #[tokio::test]
    async fn test_tcp_sentinel_query_and_subscribe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = FramedStream::new(stream);
            let mut seen = Vec::new();

            seen.push(framed.read_frame().await.unwrap());
            framed
                .write_frame(&Frame::Array(vec![
                    Frame::bulk("10.0.0.9"),
                    Frame::bulk("6380"),
                ]))
                .await
                .unwrap();

            seen.push(framed.read_frame().await.unwrap());
            framed
                .write_frame(&Frame::Array(vec![
                    Frame::bulk("subscribe"),
                    Frame::bulk("+switch-master"),
                    Frame::Integer(1),
                ]))
                .await
                .unwrap();
            framed
                .write_frame(&Frame::Array(vec![
                    Frame::bulk("message"),
                    Frame::bulk("+switch-master"),
                    Frame::bulk("mymaster 10.0.0.9 6380 10.0.0.10 6381"),
                ]))
                .await
                .unwrap();
            seen
        });

        let addr = HostAndPort::new("127.0.0.1", port);
        let mut client = TcpSentinelClient::connect(&addr, &ConnectionConfig::default())
            .await
            .unwrap();
        assert_eq!(
            client.get_master_addr_by_name("mymaster").await.unwrap(),
            Some(HostAndPort::new("10.0.0.9", 6380))
        );
        client.subscribe("+switch-master").await.unwrap();
        assert_eq!(
            client.next_message().await.unwrap(),
            "mymaster 10.0.0.9 6380 10.0.0.10 6381"
        );

        let seen = server.await.unwrap();
        assert_eq!(
            seen,
            vec![
                command::sentinel_get_master_addr_by_name("mymaster").into_frame(),
                command::subscribe("+switch-master").into_frame(),
            ]
        );
    }
}
