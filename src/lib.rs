//! Thread-safe command facade for the Redis wire protocol
//!
//! `redis-facade` sits between application code and a Redis connection. It
//! serializes access to one underlying connection, translates transport
//! failures into a stable error taxonomy, and layers pipelining and
//! publish/subscribe on top of a plain request/response transport. When a
//! cluster node list is configured, the same facade routes commands through
//! a cluster router instead of a single connection.
//!
//! # Quick start
//!
//! ```no_run
//! use redis_facade::{Client, Command, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::connect(Config::new().host("localhost")).await?;
//!
//!     client.call(Command::new("SET").arg("mykey").arg("myvalue")).await?;
//!     let reply = client.call(Command::new("GET").arg("mykey")).await?;
//!     println!("Value: {}", reply.as_string()?);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Pipelining
//!
//! ```no_run
//! # use redis_facade::{Client, Command, Config};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let client = Client::connect(Config::new()).await?;
//! let replies = client
//!     .pipelined(|pipe| {
//!         pipe.queue(Command::new("SET").arg("k1").arg("v1"));
//!         pipe.queue(Command::new("INCR").arg("counter"));
//!         pipe.queue(Command::new("GET").arg("k1"));
//!         Ok(())
//!     })
//!     .await?;
//! assert_eq!(replies.len(), 3);
//! # Ok(())
//! # }
//! ```

#![deny(warnings)]
#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::future_not_send)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::return_self_not_must_use)]

pub mod client;
pub mod cluster;
pub mod command;
pub mod connection;
pub mod pipeline;
pub mod protocol;
pub mod subscribe;

mod guard;

pub use client::Client;
pub mod core;

pub use crate::command::Command;
pub use crate::connection::{Connector, DefaultConnector, Transport, TransportResult};
pub use crate::core::{
    config::{Addr, Config, DeprecationPolicy, ReconnectPolicy, SentinelRole},
    error::{Error, Result, TransportError},
    reply::Reply,
};
pub use crate::pipeline::Pipeline;
pub use crate::subscribe::{Event, Subscription};
