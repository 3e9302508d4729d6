//! Transport seam and the bundled RESP connection
//!
//! [`Transport`] is the contract the facade dispatches against: one socket,
//! strict request/response, plus the batched and subscribed sub-modes. The
//! cluster router implements the same trait, so nothing above this seam
//! distinguishes single-node from cluster operation. [`Connector`] decides
//! how transports are opened and is the injection point for custom
//! transports in tests and embeddings.

use crate::command::Command;
use crate::core::config::{Addr, Config, ReconnectPolicy, Resolved};
use crate::core::error::TransportError;
use crate::core::reply::Reply;
use crate::protocol;
use async_trait::async_trait;
use bytes::BytesMut;
use std::io::Cursor;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, warn};

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// One connection to one server (or something that behaves like one)
///
/// Implementations own the socket and its read/write cursor; the facade
/// guarantees a single caller at a time. Replies carrying server error lines
/// are returned as errors by `call`/`blocking_call`, but kept in place by
/// `exec_batch` so the pipeline layer can distribute before raising.
#[async_trait]
pub trait Transport: Send {
    /// Issue one command and read its reply
    async fn call(&mut self, command: &Command) -> TransportResult<Reply>;

    /// Issue a command whose reply may be delayed up to `wait`
    ///
    /// `None` blocks indefinitely. The caller is expected to have already
    /// folded the read timeout into `wait`.
    async fn blocking_call(&mut self, wait: Option<Duration>, command: &Command)
        -> TransportResult<Reply>;

    /// Send every command in one flush, then read one reply per command
    async fn exec_batch(&mut self, commands: &[Command]) -> TransportResult<Vec<Reply>>;

    /// Write a command without reading a reply (subscribed mode)
    async fn send(&mut self, command: &Command) -> TransportResult<()>;

    /// Read one server-pushed frame (subscribed mode)
    ///
    /// `None` blocks indefinitely.
    async fn recv_push(&mut self, wait: Option<Duration>) -> TransportResult<Reply>;

    /// The connection's configured read timeout; zero means none
    fn read_timeout(&self) -> Duration;

    /// Replace the reconnection policy, returning the prior one
    fn set_reconnect(&mut self, policy: ReconnectPolicy) -> ReconnectPolicy;

    /// Whether a physical connection is currently established
    fn is_connected(&self) -> bool;

    /// Drop the physical connection
    async fn close(&mut self) -> TransportResult<()>;
}

/// Opens transports from a configuration
///
/// The default connector dials the bundled RESP transport; a custom
/// connector substitutes any [`Transport`] implementation, which is also the
/// seam test stubs plug into.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport for the configured server
    async fn connect(&self, config: &Config) -> TransportResult<Box<dyn Transport>>;

    /// Open a transport to one specific node (cluster routing)
    async fn connect_node(&self, config: &Config, addr: &Addr)
        -> TransportResult<Box<dyn Transport>>;
}

/// The bundled connector: plain RESP over TCP or a unix socket
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, config: &Config) -> TransportResult<Box<dyn Transport>> {
        let resolved = config
            .resolve()
            .map_err(|e| TransportError::CannotConnect(e.to_string()))?;
        let conn = RespConnection::establish(config, resolved, false).await?;
        Ok(Box::new(conn))
    }

    async fn connect_node(
        &self,
        config: &Config,
        addr: &Addr,
    ) -> TransportResult<Box<dyn Transport>> {
        // Cluster nodes always use database 0; the db option is a
        // standalone concern.
        let resolved = Resolved {
            addr: addr.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            db: 0,
        };
        let conn = RespConnection::establish(config, resolved, config.replica).await?;
        Ok(Box::new(conn))
    }
}

#[derive(Debug)]
enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Tcp(s) => s.write_all(buf).await,
            Self::Unix(s) => s.write_all(buf).await,
        }
    }

    async fn read_buf(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read_buf(buf).await,
            Self::Unix(s) => s.read_buf(buf).await,
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown().await,
            Self::Unix(s) => s.shutdown().await,
        }
    }
}

/// A RESP2 connection to one server
///
/// Reconnection happens lazily: a broken or timed-out connection is dropped
/// and the next use redials according to the reconnect policy. The connect
/// handshake (AUTH, SELECT, CLIENT SETNAME, READONLY) is replayed on every
/// physical connection.
#[derive(Debug)]
pub struct RespConnection {
    resolved: Resolved,
    id: Option<String>,
    read_timeout: Duration,
    connect_timeout: Duration,
    reconnect: ReconnectPolicy,
    readonly: bool,
    stream: Option<Stream>,
    buffer: BytesMut,
}

impl RespConnection {
    /// Dial and perform the connect handshake
    pub async fn establish(
        config: &Config,
        resolved: Resolved,
        readonly: bool,
    ) -> TransportResult<Self> {
        let mut conn = Self {
            resolved,
            id: config.id.clone(),
            read_timeout: config.read_timeout(),
            connect_timeout: config.effective_connect_timeout(),
            reconnect: config.reconnect.clone(),
            readonly,
            stream: None,
            buffer: BytesMut::with_capacity(8192),
        };
        conn.dial().await?;
        Ok(conn)
    }

    async fn dial(&mut self) -> TransportResult<()> {
        let addr = self.resolved.addr.clone();
        debug!(server = %addr, "connecting");

        let connect = async {
            match &addr {
                Addr::Tcp { host, port } => TcpStream::connect((host.as_str(), *port))
                    .await
                    .map(Stream::Tcp),
                Addr::Unix { path } => UnixStream::connect(path).await.map(Stream::Unix),
            }
        };
        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                TransportError::CannotConnect(format!(
                    "timed out connecting to {} after {:?}",
                    addr, self.connect_timeout
                ))
            })?
            .map_err(|e| {
                TransportError::CannotConnect(format!("failed to connect to {}: {}", addr, e))
            })?;

        self.buffer.clear();
        self.stream = Some(stream);
        self.handshake().await
    }

    /// Handshake issued once per physical connection, reconnects included
    async fn handshake(&mut self) -> TransportResult<()> {
        if let Some(password) = self.resolved.password.clone() {
            let auth = match self.resolved.username.clone() {
                Some(username) => Command::new("AUTH").arg(username).arg(password),
                None => Command::new("AUTH").arg(password),
            };
            let reply = self.round_trip(&auth, Some(self.read_deadline())).await?;
            match reply {
                Reply::Simple(ref s) if s == "OK" => {}
                Reply::Error(msg) => return Err(TransportError::Authentication(msg)),
                other => {
                    return Err(TransportError::Authentication(format!(
                        "unexpected AUTH reply: {:?}",
                        other
                    )))
                }
            }
        }
        if self.resolved.db > 0 {
            let select = Command::new("SELECT").arg(self.resolved.db);
            self.expect_ok(&select).await?;
        }
        if let Some(id) = self.id.clone() {
            let setname = Command::new("CLIENT").arg("SETNAME").arg(id);
            self.expect_ok(&setname).await?;
        }
        if self.readonly {
            self.expect_ok(&Command::new("READONLY")).await?;
        }
        debug!(server = %self.resolved.addr, "connected");
        Ok(())
    }

    async fn expect_ok(&mut self, command: &Command) -> TransportResult<()> {
        let reply = self.round_trip(command, Some(self.read_deadline())).await?;
        match reply {
            Reply::Simple(ref s) if s == "OK" => Ok(()),
            Reply::Error(msg) => Err(TransportError::from_error_reply(msg)),
            other => Err(TransportError::UnknownReply(format!(
                "unexpected {} reply: {:?}",
                command.name(),
                other
            ))),
        }
    }

    fn read_deadline(&self) -> Duration {
        self.read_timeout
    }

    async fn ensure_connected(&mut self) -> TransportResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let delays = self.reconnect.delays();
        if delays.is_empty() {
            return Err(TransportError::CannotConnect(
                "not connected and reconnection is disabled".to_string(),
            ));
        }
        let mut last = None;
        for (attempt, delay) in delays.iter().enumerate() {
            if !delay.is_zero() {
                tokio::time::sleep(*delay).await;
            }
            match self.dial().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        server = %self.resolved.addr,
                        attempt = attempt + 1,
                        error = %e,
                        "reconnect attempt failed"
                    );
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| {
            TransportError::CannotConnect("reconnect attempts exhausted".to_string())
        }))
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> TransportResult<()> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            TransportError::Connection("connection is not established".to_string())
        })?;
        if let Err(e) = stream.write_all(bytes).await {
            self.stream = None;
            return Err(TransportError::Connection(format!("write failed: {}", e)));
        }
        Ok(())
    }

    async fn read_reply(&mut self, deadline: Option<Duration>) -> TransportResult<Reply> {
        match deadline {
            Some(d) if !d.is_zero() => {
                match tokio::time::timeout(d, self.read_reply_inner()).await {
                    Ok(result) => result,
                    Err(_) => {
                        // A half-read reply leaves the stream desynchronized.
                        self.stream = None;
                        Err(TransportError::ReadTimeout(format!(
                            "read timed out after {:?}",
                            d
                        )))
                    }
                }
            }
            _ => self.read_reply_inner().await,
        }
    }

    async fn read_reply_inner(&mut self) -> TransportResult<Reply> {
        loop {
            let mut cursor = Cursor::new(&self.buffer[..]);
            match protocol::decode(&mut cursor) {
                Ok(Some(reply)) => {
                    let consumed = cursor.position() as usize;
                    let _ = self.buffer.split_to(consumed);
                    return Ok(reply);
                }
                Ok(None) => {}
                Err(e) => {
                    self.stream = None;
                    return Err(e);
                }
            }

            let stream = self.stream.as_mut().ok_or_else(|| {
                TransportError::Connection("connection is not established".to_string())
            })?;
            match stream.read_buf(&mut self.buffer).await {
                Ok(0) => {
                    self.stream = None;
                    return Err(TransportError::Connection(
                        "connection closed by server".to_string(),
                    ));
                }
                Ok(_) => {}
                Err(e) => {
                    self.stream = None;
                    return Err(TransportError::Connection(format!("read failed: {}", e)));
                }
            }
        }
    }

    async fn round_trip(
        &mut self,
        command: &Command,
        deadline: Option<Duration>,
    ) -> TransportResult<Reply> {
        let mut buf = BytesMut::new();
        protocol::encode_command(command, &mut buf);
        self.write_bytes(&buf).await?;
        self.read_reply(deadline).await
    }
}

#[async_trait]
impl Transport for RespConnection {
    async fn call(&mut self, command: &Command) -> TransportResult<Reply> {
        self.ensure_connected().await?;
        let reply = self
            .round_trip(command, Some(self.read_deadline()))
            .await?;
        match reply {
            Reply::Error(msg) => Err(TransportError::from_error_reply(msg)),
            other => Ok(other),
        }
    }

    async fn blocking_call(
        &mut self,
        wait: Option<Duration>,
        command: &Command,
    ) -> TransportResult<Reply> {
        self.ensure_connected().await?;
        let reply = self.round_trip(command, wait).await?;
        match reply {
            Reply::Error(msg) => Err(TransportError::from_error_reply(msg)),
            other => Ok(other),
        }
    }

    async fn exec_batch(&mut self, commands: &[Command]) -> TransportResult<Vec<Reply>> {
        self.ensure_connected().await?;

        // All commands go out in a single flush; replies are read afterwards.
        let mut buf = BytesMut::new();
        for command in commands {
            protocol::encode_command(command, &mut buf);
        }
        self.write_bytes(&buf).await?;

        let mut replies = Vec::with_capacity(commands.len());
        for _ in commands {
            replies.push(self.read_reply(Some(self.read_deadline())).await?);
        }
        Ok(replies)
    }

    async fn send(&mut self, command: &Command) -> TransportResult<()> {
        self.ensure_connected().await?;
        let mut buf = BytesMut::new();
        protocol::encode_command(command, &mut buf);
        self.write_bytes(&buf).await
    }

    async fn recv_push(&mut self, wait: Option<Duration>) -> TransportResult<Reply> {
        self.ensure_connected().await?;
        self.read_reply(wait).await
    }

    fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    fn set_reconnect(&mut self, policy: ReconnectPolicy) -> ReconnectPolicy {
        std::mem::replace(&mut self.reconnect, policy)
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> TransportResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn read_command(stream: &mut TcpStream) -> Vec<String> {
        let mut buf = BytesMut::new();
        loop {
            let mut cursor = Cursor::new(&buf[..]);
            if let Some(Reply::Array(items)) = protocol::decode(&mut cursor).unwrap() {
                let consumed = cursor.position() as usize;
                let _ = buf.split_to(consumed);
                return items
                    .iter()
                    .map(|item| item.as_string().unwrap())
                    .collect();
            }
            stream.read_buf(&mut buf).await.unwrap();
        }
    }

    fn config() -> Config {
        Config::new()
            .password("sekrit")
            .db(2)
            .id("worker-1")
            .timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn handshake_runs_auth_select_and_setname() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            assert_eq!(read_command(&mut stream).await, ["AUTH", "sekrit"]);
            stream.write_all(b"+OK\r\n").await.unwrap();
            assert_eq!(read_command(&mut stream).await, ["SELECT", "2"]);
            stream.write_all(b"+OK\r\n").await.unwrap();
            assert_eq!(
                read_command(&mut stream).await,
                ["CLIENT", "SETNAME", "worker-1"]
            );
            stream.write_all(b"+OK\r\n").await.unwrap();
            assert_eq!(read_command(&mut stream).await, ["PING"]);
            stream.write_all(b"+PONG\r\n").await.unwrap();
        });

        let config = config().host("127.0.0.1").port(port);
        let resolved = config.resolve().unwrap();
        let mut conn = RespConnection::establish(&config, resolved, false)
            .await
            .unwrap();
        let pong = conn.call(&Command::new("PING")).await.unwrap();
        assert_eq!(pong, Reply::Simple("PONG".into()));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_auth_is_an_authentication_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_command(&mut stream).await;
            stream
                .write_all(b"-WRONGPASS invalid username-password pair\r\n")
                .await
                .unwrap();
        });

        let config = config().host("127.0.0.1").port(port);
        let resolved = config.resolve().unwrap();
        let err = RespConnection::establish(&config, resolved, false)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Authentication(_)));
    }

    #[tokio::test]
    async fn read_timeout_poisons_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Swallow the command and never answer.
            let _ = read_command(&mut stream).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let config = Config::new()
            .host("127.0.0.1")
            .port(port)
            .timeout(Duration::from_millis(50));
        let resolved = config.resolve().unwrap();
        let mut conn = RespConnection::establish(&config, resolved, false)
            .await
            .unwrap();
        let err = conn.call(&Command::new("GET").arg("k")).await.unwrap_err();
        assert!(matches!(err, TransportError::ReadTimeout(_)));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn server_error_replies_are_classified() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_command(&mut stream).await;
            stream
                .write_all(b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n")
                .await
                .unwrap();
        });

        let config = Config::new().host("127.0.0.1").port(port);
        let resolved = config.resolve().unwrap();
        let mut conn = RespConnection::establish(&config, resolved, false)
            .await
            .unwrap();
        let err = conn.call(&Command::new("INCR").arg("k")).await.unwrap_err();
        assert!(matches!(err, TransportError::WrongType(_)));
    }
}
