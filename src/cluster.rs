//! Cluster routing
//!
//! The router implements [`Transport`], so the facade dispatches through it
//! exactly as it would through a single connection. Each command is routed
//! by its key: the key hashes to one of 16384 slots (CRC16/XMODEM, with
//! `{hash tag}` extraction), and the slot maps onto the configured nodes by
//! even partition. Node connections open lazily on first use.

use crate::command::Command;
use crate::connection::{Connector, DefaultConnector, Transport, TransportResult};
use crate::core::config::{parse_node, Addr, Config, ReconnectPolicy};
use crate::core::error::{Result, TransportError};
use crate::core::reply::Reply;
use async_trait::async_trait;
use crc16::{State, XMODEM};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Number of hash slots in a cluster
pub const SLOTS: u16 = 16384;

/// Routes commands across a fixed set of cluster nodes
pub struct ClusterRouter {
    config: Config,
    connector: Arc<dyn Connector>,
    nodes: Vec<Addr>,
    connections: Vec<Option<Box<dyn Transport>>>,
    reconnect: ReconnectPolicy,
    // Node a subscription was entered on; pushes are read from it.
    subscribed: Option<usize>,
}

impl ClusterRouter {
    /// Build a router from the configured seed nodes
    pub fn new(config: &Config) -> Result<Self> {
        let seeds = config.cluster.as_deref().unwrap_or_default();
        let mut nodes = Vec::with_capacity(seeds.len());
        for seed in seeds {
            let mut addr = parse_node(seed)?;
            if let (Some(fixed), Addr::Tcp { host, .. }) = (&config.fixed_hostname, &mut addr) {
                *host = fixed.clone();
            }
            nodes.push(addr);
        }
        if nodes.is_empty() {
            return Err(crate::core::error::Error::Config(
                "cluster mode requires at least one node".to_string(),
            ));
        }
        let connector: Arc<dyn Connector> = match &config.connector {
            Some(connector) => Arc::clone(connector),
            None => Arc::new(DefaultConnector),
        };
        let connections = nodes.iter().map(|_| None).collect();
        Ok(Self {
            config: config.clone(),
            connector,
            nodes,
            connections,
            reconnect: config.reconnect.clone(),
            subscribed: None,
        })
    }

    /// Hash slot for a key, honoring `{hash tag}` extraction
    pub fn slot(key: &str) -> u16 {
        let hashed = hash_tag(key);
        State::<XMODEM>::calculate(hashed.as_bytes()) % SLOTS
    }

    fn node_index(&self, command: &Command) -> usize {
        match command.routing_key() {
            Some(key) => {
                let slot = Self::slot(key) as usize;
                slot * self.nodes.len() / SLOTS as usize
            }
            // Keyless commands pin to the first node so a session of them
            // stays on one connection.
            None => 0,
        }
    }

    async fn transport_at(&mut self, index: usize) -> TransportResult<&mut Box<dyn Transport>> {
        if self.connections[index].is_none() {
            let addr = &self.nodes[index];
            debug!(node = %addr, "opening cluster node connection");
            let mut transport = self.connector.connect_node(&self.config, addr).await?;
            transport.set_reconnect(self.reconnect.clone());
            self.connections[index] = Some(transport);
        }
        match self.connections[index].as_mut() {
            Some(transport) => Ok(transport),
            None => Err(TransportError::Connection(
                "cluster node connection missing after connect".to_string(),
            )),
        }
    }

    async fn route(&mut self, command: &Command) -> TransportResult<&mut Box<dyn Transport>> {
        let index = self.node_index(command);
        self.transport_at(index).await
    }
}

/// Reduce a key to its hash tag when one is present
///
/// Only the first `{` and the first `}` after it count, and an empty tag
/// hashes the whole key.
fn hash_tag(key: &str) -> &str {
    if let Some(open) = key.find('{') {
        if let Some(close) = key[open + 1..].find('}') {
            if close > 0 {
                return &key[open + 1..open + 1 + close];
            }
        }
    }
    key
}

#[async_trait]
impl Transport for ClusterRouter {
    async fn call(&mut self, command: &Command) -> TransportResult<Reply> {
        self.route(command).await?.call(command).await
    }

    async fn blocking_call(
        &mut self,
        wait: Option<Duration>,
        command: &Command,
    ) -> TransportResult<Reply> {
        self.route(command).await?.blocking_call(wait, command).await
    }

    async fn exec_batch(&mut self, commands: &[Command]) -> TransportResult<Vec<Reply>> {
        // The whole batch goes to the node of the first keyed command; a
        // batch spanning slots on different nodes is the caller's mistake
        // and surfaces as server-side MOVED errors.
        let index = commands
            .iter()
            .find_map(|c| c.routing_key().map(|_| self.node_index(c)))
            .unwrap_or(0);
        self.transport_at(index).await?.exec_batch(commands).await
    }

    async fn send(&mut self, command: &Command) -> TransportResult<()> {
        let index = match self.subscribed {
            Some(index) => index,
            None => self.node_index(command),
        };
        self.subscribed = Some(index);
        self.transport_at(index).await?.send(command).await
    }

    async fn recv_push(&mut self, wait: Option<Duration>) -> TransportResult<Reply> {
        let index = self.subscribed.ok_or_else(|| {
            TransportError::Connection("no subscribed cluster node".to_string())
        })?;
        self.transport_at(index).await?.recv_push(wait).await
    }

    fn read_timeout(&self) -> Duration {
        self.config.read_timeout()
    }

    fn set_reconnect(&mut self, policy: ReconnectPolicy) -> ReconnectPolicy {
        for connection in self.connections.iter_mut().flatten() {
            connection.set_reconnect(policy.clone());
        }
        std::mem::replace(&mut self.reconnect, policy)
    }

    fn is_connected(&self) -> bool {
        self.connections
            .iter()
            .flatten()
            .any(|c| c.is_connected())
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.subscribed = None;
        // Every node gets closed; the first failure is reported afterwards.
        let mut first_err = None;
        for connection in self.connections.iter_mut() {
            if let Some(mut transport) = connection.take() {
                if let Err(e) = transport.close().await {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
