//! livetap: live per-client queries over a line-delimited JSON feed.
//!
//! Clients connect over TCP or WebSocket, send a query naming a logical
//! stream together with output expressions and filter expressions, and then
//! receive one evaluated result per matching record for as long as they stay
//! connected. Every stream is served by a single actor that holds at most one
//! upstream connection and fans records out to its subscribers.
//!
//! # Example
//!
//! ```rust,no_run
//! use livetap::{CacheConfig, StreamRegistry, TcpUpstream};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let upstream = Arc::new(TcpUpstream::new("127.0.0.1:3535"));
//!     let registry = StreamRegistry::spawn(upstream, CacheConfig::default());
//!
//!     let stream = registry.locate("ranger").await?;
//!     let mut subscription = stream.subscribe(64).await?;
//!     while let Some(record) = subscription.recv().await {
//!         println!("{}", record);
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod expression;
pub mod field;
pub mod registry;
pub mod server;
pub mod session;
pub mod stream;
pub mod transport;
pub mod window;

#[cfg(test)]
mod tests;

pub use config::{CacheConfig, CliArgs, Settings};
pub use error::{BoxError, EvalError, ParseError, SessionError, StreamError, TransportError};
pub use expression::{parse, Expression};
pub use registry::StreamRegistry;
pub use session::{ClientSession, JsonConn, Query};
pub use stream::{Record, StreamHandle, StreamStats, Subscription, TcpUpstream, Upstream};
pub use transport::{LineConn, WsConn};
pub use window::{AggregateFunction, Bound, RunningAggregate, Window, WindowListener};
