//! The client facade
//!
//! [`Client`] is the single entry point: it owns one transport behind an
//! async mutex, so every operation runs alone on the connection no matter
//! how many tasks share the handle. Construction selects the transport from
//! the configuration: cluster seeds select the router, otherwise the
//! connector dials a single connection.

use crate::cluster::ClusterRouter;
use crate::command::Command;
use crate::connection::{Connector, DefaultConnector, Transport};
use crate::core::config::{Config, DeprecationPolicy, ReconnectPolicy};
use crate::core::error::{Error, Result};
use crate::core::reply::Reply;
use crate::guard::ForkGuard;
use crate::pipeline::Pipeline;
use crate::subscribe::{Event, Session, Subscription};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

struct Inner {
    transport: Box<dyn Transport>,
    guard: ForkGuard,
    reconnect_suspended: bool,
}

/// Puts the saved reconnect policy back when a `without_reconnect` block
/// ends; the `Drop` path covers panics and dropped futures.
struct RestoreReconnect {
    inner: Arc<Mutex<Inner>>,
    prior: Option<ReconnectPolicy>,
}

impl RestoreReconnect {
    async fn now(&mut self) {
        if let Some(prior) = self.prior.take() {
            let mut inner = self.inner.lock().await;
            inner.transport.set_reconnect(prior);
            inner.reconnect_suspended = false;
        }
    }
}

impl Drop for RestoreReconnect {
    fn drop(&mut self) {
        let Some(prior) = self.prior.take() else { return };
        let inner = Arc::clone(&self.inner);
        // The lock is async, so the unwind path hands the restore to the
        // runtime instead of blocking in drop.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let mut inner = inner.lock().await;
                inner.transport.set_reconnect(prior);
                inner.reconnect_suspended = false;
            });
        }
    }
}

/// A handle to one server (or cluster), safe to share across tasks
///
/// Cloning is deliberately not provided; [`Client::dup`] opens a fresh
/// connection with the same configuration instead, so two handles never
/// interleave on one socket by accident.
pub struct Client {
    config: Config,
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Connect with the given configuration
    ///
    /// Cluster seeds select the cluster router; otherwise the configured
    /// connector (or the bundled RESP transport) dials the resolved server.
    pub async fn connect(config: Config) -> Result<Self> {
        if config.sentinels.is_some() && config.connector.is_none() {
            return Err(Error::Config(
                "sentinel discovery is not built in; supply a connector that resolves \
                 the server through your sentinels"
                    .to_string(),
            ));
        }

        let transport: Box<dyn Transport> = if config.cluster.is_some() {
            Box::new(ClusterRouter::new(&config)?)
        } else {
            let connector: Arc<dyn Connector> = match &config.connector {
                Some(connector) => Arc::clone(connector),
                None => Arc::new(DefaultConnector),
            };
            connector.connect(&config).await?
        };
        debug!(server = %config.server_url(), "client connected");

        let guard = ForkGuard::new(config.inherit_socket);
        Ok(Self {
            config,
            inner: Arc::new(Mutex::new(Inner {
                transport,
                guard,
                reconnect_suspended: false,
            })),
        })
    }

    /// Issue one command and return its reply
    ///
    /// Server error replies surface as the matching [`Error`] kind with the
    /// server's message preserved verbatim.
    pub async fn call(&self, command: Command) -> Result<Reply> {
        let mut inner = self.inner.lock().await;
        inner.guard.check(inner.reconnect_suspended)?;
        inner.transport.call(&command).await.map_err(Error::from)
    }

    /// Issue a command that may legitimately block server-side
    ///
    /// `timeout` is the server-side blocking budget the command was built
    /// with; the read deadline is extended past it so the reply is not cut
    /// off early. A zero timeout blocks indefinitely, as does a connection
    /// configured without a read deadline.
    pub async fn blocking_call(&self, timeout: Duration, command: Command) -> Result<Reply> {
        let mut inner = self.inner.lock().await;
        inner.guard.check(inner.reconnect_suspended)?;
        let read_timeout = inner.transport.read_timeout();
        let wait = if timeout.is_zero() || read_timeout.is_zero() {
            None
        } else {
            Some(timeout + read_timeout)
        };
        inner
            .transport
            .blocking_call(wait, &command)
            .await
            .map_err(Error::from)
    }

    /// Flush a batch of commands in one round trip
    ///
    /// The build closure queues commands synchronously, so a batch can never
    /// nest another network operation. Replies come back in submission
    /// order; after all of them are read, the first server error in the
    /// batch is raised.
    pub async fn pipelined<F>(&self, build: F) -> Result<Vec<Reply>>
    where
        F: FnOnce(&mut Pipeline) -> Result<()>,
    {
        let mut pipe = Pipeline::new();
        build(&mut pipe)?;
        if pipe.is_empty() {
            return Ok(Vec::new());
        }

        let mut inner = self.inner.lock().await;
        inner.guard.check(inner.reconnect_suspended)?;
        let raw = inner
            .transport
            .exec_batch(pipe.commands())
            .await
            .map_err(Error::from)?;
        pipe.distribute(raw)
    }

    /// Subscribe to channels and dispatch pushed events to `handler`
    ///
    /// The connection stays in subscribed mode until every subscription is
    /// released (the handler can release or add more through its
    /// [`Subscription`] argument), the deadline elapses, or an error occurs.
    /// A zero deadline listens forever. The handle's other operations wait
    /// until the session ends.
    pub async fn subscribe<I, T, F>(&self, channels: I, deadline: Duration, handler: F) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
        F: FnMut(Event, &mut Subscription) -> Result<()> + Send,
    {
        let initial = Command::new("SUBSCRIBE").args(channels.into_iter().map(Into::into));
        self.run_session(initial, deadline, handler).await
    }

    /// Subscribe to patterns and dispatch pushed events to `handler`
    pub async fn psubscribe<I, T, F>(
        &self,
        patterns: I,
        deadline: Duration,
        handler: F,
    ) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
        F: FnMut(Event, &mut Subscription) -> Result<()> + Send,
    {
        let initial = Command::new("PSUBSCRIBE").args(patterns.into_iter().map(Into::into));
        self.run_session(initial, deadline, handler).await
    }

    async fn run_session<F>(&self, initial: Command, deadline: Duration, mut handler: F) -> Result<()>
    where
        F: FnMut(Event, &mut Subscription) -> Result<()> + Send,
    {
        let mut inner = self.inner.lock().await;
        inner.guard.check(inner.reconnect_suspended)?;
        // The session borrows the transport, so the handle is back in
        // request/response mode on every exit path.
        let mut session = Session::new(&mut *inner.transport);
        session.run(initial, deadline, &mut handler).await
    }

    /// Run a block with automatic reconnection disabled
    ///
    /// Connection loss inside the block surfaces immediately instead of
    /// being repaired, which matters for commands that are unsafe to replay.
    /// The prior policy is restored when the block ends, on error, panic,
    /// and cancellation paths too.
    pub async fn without_reconnect<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let prior = {
            let mut inner = self.inner.lock().await;
            inner.reconnect_suspended = true;
            inner.transport.set_reconnect(ReconnectPolicy::Attempts(0))
        };
        let mut restore = RestoreReconnect {
            inner: Arc::clone(&self.inner),
            prior: Some(prior),
        };

        let result = body().await;
        restore.now().await;
        result
    }

    /// Whether a physical connection is currently established
    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.transport.is_connected()
    }

    /// Drop the physical connection
    ///
    /// The handle stays usable; the next operation reconnects according to
    /// the reconnect policy.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.transport.close().await.map_err(Error::from)
    }

    /// Renamed to [`Client::close`]; behavior follows the configured
    /// deprecation policy
    pub async fn disconnect(&self) -> Result<()> {
        match self.config.deprecations {
            DeprecationPolicy::Warn => {
                warn!("disconnect() is deprecated, use close()");
            }
            DeprecationPolicy::Silence => {}
            DeprecationPolicy::Raise => {
                return Err(Error::Deprecated(
                    "disconnect() is deprecated, use close()".to_string(),
                ))
            }
        }
        self.close().await
    }

    /// Open a second handle with the same configuration
    ///
    /// The new handle has its own connection; the two never share a socket.
    pub async fn dup(&self) -> Result<Self> {
        Self::connect(self.config.clone()).await
    }

    /// The configured connection name, if any
    pub fn id(&self) -> Option<&str> {
        self.config.id.as_deref()
    }

    /// Display form of the server this handle points at, without credentials
    pub fn server_url(&self) -> String {
        self.config.server_url()
    }

    /// The configuration this handle was built from
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[cfg(test)]
    pub(crate) async fn simulate_fork(&self) {
        self.inner.lock().await.guard.pretend_forked();
    }
}
