//! Raw TCP server engine.
//!
//! Accepts plain or TLS connections, enforces a client limit, and hands each
//! admitted connection to a pluggable [`ConnectionStrategy`]. Packet framing
//! and bulk broadcast are built on top as reusable components.
//!
//! # Components
//!
//! - [`Server`]: lifecycle (bind, accept, tick, stop) and metrics
//! - [`Socket`]: one connection with counted I/O, deadlines and close listeners
//! - [`SocketRegistry`]: bounded admission and sweeping of closed sockets
//! - [`TaskPerConnection`]: default strategy, one task per connection
//! - [`PacketFramingHandler`]: splits a stream into packets with a
//!   [`FramingProtocol`]
//! - [`BulkBroadcaster`]: writes one payload to many streams with a worker pool
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tinytcp::{
//!     FramingContext, PacketFramingHandler, Server, ServerConfig, SplitBySeparator,
//!     TaskPerConnection,
//! };
//!
//! # async fn run() -> Result<(), tinytcp::ServerError> {
//! let handler = PacketFramingHandler::new(SplitBySeparator::newline(), |ctx: &mut FramingContext| {
//!     let id = ctx.socket().id();
//!     ctx.on_packet(move |packet: &[u8]| println!("{id}: {} bytes", packet.len()));
//! });
//!
//! let server = Server::new(ServerConfig::new("127.0.0.1:7000"), TaskPerConnection::new(handler));
//! server.start().await
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod broadcast;
mod config;
mod counting;
mod error;
mod framing;
mod metrics;
mod pool;
mod registry;
mod server;
mod service;
mod socket;
mod strategy;
mod stream;
mod tls;
mod util;

pub use broadcast::{BroadcasterConfig, BulkBroadcaster, segments};
pub use config::{ListenMode, ServerConfig};
pub use counting::{ByteCounter, CountingStream};
pub use error::{BroadcastError, ServerError, SocketError};
pub use framing::{
    FramingConfig, FramingContext, OverflowPolicy, PacketFramingHandler, PacketHandler,
    read_packets,
};
pub use metrics::ServerMetrics;
pub use pool::{Pool, Recycle};
pub use registry::SocketRegistry;
pub use server::{MetricsHandler, Server, ServerState};
pub use service::{Service, run_until};
pub use socket::{CloseListener, Connection, Socket, SocketReader, SocketWriter};
pub use strategy::{ConnectionStrategy, SocketHandler, TaskPerConnection};
pub use stream::{ByteStream, Closer, DeadlineSetter, Reader, Writer};
pub use tinytcp_proto::{
    FramingError, FramingProtocol, LengthPrefix, LengthPrefixed, SplitBySeparator,
};
pub use tls::{TlsConfig, acceptor_from_pem};
