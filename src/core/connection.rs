use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::core::command::{self, Cmd};
use crate::core::config::ConnectionConfig;
use crate::core::node::HostAndPort;
use crate::proto::codec;
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// A single connection to one Redis node.
///
/// This is the only surface the routing layer talks to: send a command,
/// get a reply or an error. Error replies are turned into typed errors
/// (`MOVED`/`ASK` become redirects) by [`Connection::execute`].
#[async_trait]
pub trait Connection: Send + fmt::Debug {
    /// The node this connection talks to.
    fn addr(&self) -> &HostAndPort;

    /// Sends one command and returns the raw reply frame, error replies
    /// included.
    async fn send_command(&mut self, cmd: &Cmd) -> Result<Frame>;

    /// Returns true once the connection hit a transport error and must not
    /// be reused.
    fn is_broken(&self) -> bool;

    /// Closes the connection. Further use fails.
    fn close(&mut self);

    /// Sends a command and converts an error reply into an [`Error`].
    async fn execute(&mut self, cmd: &Cmd) -> Result<Frame> {
        match self.send_command(cmd).await? {
            Frame::Error(message) => Err(reply_error(&message)),
            frame => Ok(frame),
        }
    }

    /// Sends `PING`.
    async fn ping(&mut self) -> Result<()> {
        self.execute(&command::ping()).await.map(|_| ())
    }
}

/// Opens connections to nodes.
///
/// Pools hold a connector rather than opening sockets themselves, so tests
/// can substitute in-memory nodes.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Opens a ready-to-use connection to `addr`.
    async fn connect(&self, addr: &HostAndPort) -> Result<Box<dyn Connection>>;
}

/// Maps an error reply to a typed error.
pub(crate) fn reply_error(message: &[u8]) -> Error {
    #[cfg(feature = "cluster")]
    {
        crate::cluster::parse_redis_error(message)
    }
    #[cfg(not(feature = "cluster"))]
    {
        Error::Server {
            message: String::from_utf8_lossy(message).trim().to_string(),
        }
    }
}

/// RESP framing over any byte stream.
///
/// Handles encoding and decoding of whole frames; partial reads are
/// buffered until a complete frame is available.
pub struct FramedStream<S> {
    stream: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(256),
        }
    }

    /// Encodes and writes a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.write_buf.clear();
        codec::encode(frame, &mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads the next complete frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the peer closes the stream and
    /// [`Error::Protocol`] for malformed data.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = codec::decode(&mut self.read_buf)? {
                return Ok(frame);
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::connection("connection closed by peer"));
            }
        }
    }

    /// Shuts down the write half.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

impl<S: fmt::Debug> fmt::Debug for FramedStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedStream")
            .field("stream", &self.stream)
            .field("buffered", &self.read_buf.len())
            .finish()
    }
}

/// Opens a TCP stream to `addr`, bounded by `timeout`.
pub(crate) async fn connect_tcp(addr: &HostAndPort, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr.socket_addr()))
        .await
        .map_err(|_| Error::Timeout {
            message: format!("connecting to {addr}"),
        })??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Plain TCP connection to a Redis node.
#[derive(Debug)]
pub struct TcpConnection {
    addr: HostAndPort,
    framed: FramedStream<TcpStream>,
    response_timeout: Option<Duration>,
    broken: bool,
}

impl TcpConnection {
    /// Connects and runs the `AUTH` / `SELECT` / `CLIENT SETNAME` handshake.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] or [`Error::Io`] if the socket cannot be
    /// opened and [`Error::Auth`] if authentication is rejected.
    pub async fn connect(addr: &HostAndPort, config: &ConnectionConfig) -> Result<Self> {
        let stream = connect_tcp(addr, config.connect_timeout).await?;
        let mut conn = Self {
            addr: addr.clone(),
            framed: FramedStream::new(stream),
            response_timeout: config.response_timeout,
            broken: false,
        };

        if let Some(password) = &config.password {
            let auth = match &config.username {
                Some(user) => command::auth_with_username(user.clone(), password.clone()),
                None => command::auth(password.clone()),
            };
            if let Frame::Error(_) = conn.send_command(&auth).await? {
                return Err(Error::Auth);
            }
        }
        if let Some(db) = config.database {
            conn.execute(&command::select(db)).await?;
        }
        if let Some(name) = &config.client_name {
            conn.execute(&command::client_setname(name.clone())).await?;
        }

        debug!(node = %addr, "connected");
        Ok(conn)
    }

    async fn round_trip(&mut self, frame: &Frame) -> Result<Frame> {
        self.framed.write_frame(frame).await?;
        self.framed.read_frame().await
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn addr(&self) -> &HostAndPort {
        &self.addr
    }

    async fn send_command(&mut self, cmd: &Cmd) -> Result<Frame> {
        if self.broken {
            return Err(Error::connection(format!("connection to {} is closed", self.addr)));
        }
        let frame = cmd.to_frame();
        let result = match self.response_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.round_trip(&frame)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    message: format!("waiting for {} reply from {}", cmd.name(), self.addr),
                }),
            },
            None => self.round_trip(&frame).await,
        };
        // A failed or abandoned round trip leaves the stream mid-frame.
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    fn close(&mut self) {
        self.broken = true;
    }
}

/// Opens [`TcpConnection`]s with a fixed [`ConnectionConfig`].
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: ConnectionConfig,
}

impl TcpConnector {
    /// Creates a connector.
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    /// The settings used for new connections.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &HostAndPort) -> Result<Box<dyn Connection>> {
        let conn = TcpConnection::connect(addr, &self.config).await?;
        Ok(Box::new(conn))
    }
}
