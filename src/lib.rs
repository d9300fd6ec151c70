//! redis-mux is the connection core of a Redis client: one long-lived,
//! pipelined, full-duplex connection to a Redis-compatible server that
//! multiplexes any number of concurrent logical requests over a single
//! transport.
//!
//! The pieces:
//!
//! * [`resp3`]: a resumable RESP3 parser producing borrowed nodes, plus
//!   the client-side encoder.
//! * [`Request`] / [`Response`]: a pipeline of commands and its per-command
//!   typed results.
//! * The multiplexer (internal): routes incoming frames to the request
//!   that owns them, hands server pushes to [`Connection::receive`], and
//!   implements the cancellation rules.
//! * [`Connection`]: the public handle. `run` drives the reader, writer
//!   and health-check loops and reconnects after transient failures,
//!   optionally discovering the server through Sentinel.
//!
//! # Example
//!
//! ```no_run
//! use redis_mux::{Config, Connection, Request, Response};
//!
//! # async fn example() -> Result<(), redis_mux::Error> {
//! let conn = Connection::new(Config::default());
//!
//! let runner = conn.clone();
//! tokio::spawn(async move {
//!     if let Err(err) = runner.run().await {
//!         eprintln!("connection terminated: {err}");
//!     }
//! });
//!
//! let mut req = Request::new();
//! req.push("SET", &["key", "value"]);
//! req.push("GET", &["key"]);
//!
//! let mut resp = Response::new();
//! conn.exec(&req, &mut resp).await?;
//! let (_set, value): (String, String) = resp.into_tuple()?;
//! assert_eq!(value, "value");
//! # Ok(())
//! # }
//! ```
//!
//! Connections speak RESP3 only: the handshake always sends `HELLO 3`, and
//! servers limited to RESP2 fail the handshake.

mod adapter;
mod buffer;
mod config;
mod connection;
mod error;
mod multiplexer;
mod request;
pub mod resp3;
mod response;
mod sentinel;
mod value;

pub use adapter::{
    deserialize, Adapter, Ignore, NodeCollector, OwnedNode, ResponseSink, ValueBuilder, ValuesSink,
};
pub use config::{Address, Config, SentinelConfig, ServerRole};
pub use connection::{Connection, Operation};
pub use error::{Error, Result};
pub use multiplexer::Usage;
pub use request::{Request, RequestConfig, ToBulk};
pub use response::{FromResponse, Response};
pub use value::{FromValue, PushKind, Value, VerbatimFormat};
