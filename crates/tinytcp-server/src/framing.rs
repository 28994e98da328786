//! Packet framing over a byte stream.
//!
//! [`PacketFramingHandler`] is a [`SocketHandler`] that reads a connection
//! in fixed-size chunks and feeds complete packets, as delimited by a
//! [`FramingProtocol`], to a per-connection [`PacketHandler`].
//!
//! # Buffering
//!
//! Chunks are parsed in place while no partial packet is pending. Only the
//! incomplete tail of a chunk is copied into an accumulator, which then
//! receives whole chunks until its packet completes. Every packet is
//! delivered exactly once, in stream order, regardless of how the stream
//! was split into reads.
//!
//! # Limits
//!
//! A pending packet may not grow past `max_packet_size` bytes (prefix or
//! separator included). The limit is checked after every complete packet in
//! a read was delivered, so it only ever applies to one partial packet. On
//! overflow the [`OverflowPolicy`] either discards
//! the pending bytes and resynchronizes on the next read, or closes the
//! connection.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tinytcp_proto::FramingProtocol;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    ByteStream, Socket, SocketHandler,
    pool::{Pool, Recycle},
};

/// Buffers kept for reuse across connections.
const BUFFER_POOL_CAPACITY: usize = 64;

/// What to do when a pending packet exceeds `max_packet_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the pending bytes and keep reading.
    #[default]
    DropAndResync,
    /// Close the connection.
    CloseConnection,
}

/// Framing limits and timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramingConfig {
    /// Bytes requested per read.
    pub read_buffer_size: usize,
    /// Largest pending packet, in bytes. 0 disables the limit.
    pub max_packet_size: usize,
    /// Action on an oversized packet.
    pub overflow_policy: OverflowPolicy,
    /// Close connections that send nothing for this long.
    pub idle_timeout: Option<Duration>,
}

impl FramingConfig {
    /// Default read chunk size.
    pub const DEFAULT_READ_BUFFER_SIZE: usize = 4 * 1024;

    /// Default pending packet limit.
    pub const DEFAULT_MAX_PACKET_SIZE: usize = 16 * 1024;
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: Self::DEFAULT_READ_BUFFER_SIZE,
            max_packet_size: Self::DEFAULT_MAX_PACKET_SIZE,
            overflow_policy: OverflowPolicy::DropAndResync,
            idle_timeout: None,
        }
    }
}

/// Receives decoded packets for one connection.
///
/// `packet` borrows the read buffer and is only valid during the call.
#[async_trait]
pub trait PacketHandler: Send {
    /// Handle one complete packet.
    async fn on_packet(&mut self, packet: &[u8]);
}

struct FnPacketHandler<F>(F);

#[async_trait]
impl<F: FnMut(&[u8]) + Send> PacketHandler for FnPacketHandler<F> {
    async fn on_packet(&mut self, packet: &[u8]) {
        (self.0)(packet);
    }
}

struct Discard;

#[async_trait]
impl PacketHandler for Discard {
    async fn on_packet(&mut self, _packet: &[u8]) {}
}

/// Per-connection setup passed to the context callback.
pub struct FramingContext {
    socket: Arc<Socket>,
    handler: Option<Box<dyn PacketHandler>>,
}

impl FramingContext {
    fn new(socket: Arc<Socket>) -> Self {
        Self { socket, handler: None }
    }

    /// The connection being framed.
    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    /// Handle packets with a synchronous callback.
    pub fn on_packet(&mut self, handler: impl FnMut(&[u8]) + Send + 'static) {
        self.handler = Some(Box::new(FnPacketHandler(handler)));
    }

    /// Handle packets with an async handler.
    pub fn set_packet_handler(&mut self, handler: impl PacketHandler + 'static) {
        self.handler = Some(Box::new(handler));
    }

    fn into_handler(self) -> Box<dyn PacketHandler> {
        self.handler.unwrap_or_else(|| Box::new(Discard))
    }
}

struct FramingBuffers {
    chunk: Vec<u8>,
    pending: BytesMut,
}

impl Recycle for FramingBuffers {
    fn reset(&mut self) {
        self.pending.clear();
    }
}

/// Socket handler that splits the stream into packets.
pub struct PacketFramingHandler<P, C> {
    protocol: P,
    on_context: C,
    config: FramingConfig,
    buffers: Pool<FramingBuffers>,
}

impl<P, C> PacketFramingHandler<P, C>
where
    P: FramingProtocol + 'static,
    C: Fn(&mut FramingContext) + Send + Sync + 'static,
{
    /// Frame connections with `protocol`. `on_context` runs once per
    /// connection to install its packet handler.
    pub fn new(protocol: P, on_context: C) -> Self {
        Self {
            protocol,
            on_context,
            config: FramingConfig::default(),
            buffers: Pool::new(BUFFER_POOL_CAPACITY),
        }
    }

    /// Replace the framing limits.
    pub fn with_config(mut self, config: FramingConfig) -> Self {
        self.config = config;
        self
    }

    /// Active framing limits.
    pub fn config(&self) -> &FramingConfig {
        &self.config
    }
}

#[async_trait]
impl<P, C> SocketHandler for PacketFramingHandler<P, C>
where
    P: FramingProtocol + 'static,
    C: Fn(&mut FramingContext) + Send + Sync + 'static,
{
    async fn handle(&self, socket: Arc<Socket>) {
        let mut context = FramingContext::new(Arc::clone(&socket));
        (self.on_context)(&mut context);
        let mut handler = context.into_handler();

        let chunk_size = self.config.read_buffer_size.max(1);
        let mut buffers = self.buffers.acquire().unwrap_or_else(|| FramingBuffers {
            chunk: vec![0; chunk_size],
            pending: BytesMut::new(),
        });
        buffers.chunk.resize(chunk_size, 0);

        let mut framer = Framer { config: &self.config, buffers };
        framer.run(&*socket, &self.protocol, handler.as_mut()).await;
        self.buffers.recycle(framer.buffers);
    }
}

/// Read packets from `stream` until it closes.
///
/// This is the loop behind [`PacketFramingHandler`], usable with any
/// [`ByteStream`].
pub async fn read_packets<S, P>(
    stream: &S,
    protocol: &P,
    config: &FramingConfig,
    handler: &mut dyn PacketHandler,
) where
    S: ByteStream + ?Sized,
    P: FramingProtocol + ?Sized,
{
    let buffers = FramingBuffers {
        chunk: vec![0; config.read_buffer_size.max(1)],
        pending: BytesMut::new(),
    };
    Framer { config, buffers }.run(stream, protocol, handler).await;
}

struct Framer<'a> {
    config: &'a FramingConfig,
    buffers: FramingBuffers,
}

impl Framer<'_> {
    async fn run<S, P>(&mut self, stream: &S, protocol: &P, handler: &mut dyn PacketHandler)
    where
        S: ByteStream + ?Sized,
        P: FramingProtocol + ?Sized,
    {
        loop {
            if let Some(idle) = self.config.idle_timeout {
                if stream.set_read_deadline(Some(Instant::now() + idle)).is_err() {
                    break;
                }
            }

            let n = match stream.read(&mut self.buffers.chunk).await {
                Ok(n) => n,
                Err(err) if err.is_timeout() => {
                    if self.config.idle_timeout.is_some() {
                        debug!("Closing idle TCP connection");
                        stream.close().await;
                        break;
                    }
                    // The deadline was set elsewhere and has passed.
                    if stream.set_read_deadline(None).is_err() {
                        break;
                    }
                    continue;
                },
                Err(_) => {
                    stream.close().await;
                    break;
                },
            };

            if !self.feed(n, protocol, handler).await {
                stream.close().await;
                break;
            }
        }
    }

    /// Process `n` fresh bytes from the chunk buffer. Returns false if the
    /// connection must be closed.
    async fn feed<P>(&mut self, n: usize, protocol: &P, handler: &mut dyn PacketHandler) -> bool
    where
        P: FramingProtocol + ?Sized,
    {
        let config = self.config;
        let max = config.max_packet_size;
        let FramingBuffers { chunk, pending } = &mut self.buffers;
        let fresh = &chunk[..n];

        if pending.is_empty() {
            let rest = dispatch(protocol, fresh, handler).await;
            let len = rest.len();
            if max > 0 && len > max {
                return overflow(config, pending, len);
            }
            pending.extend_from_slice(rest);
            return true;
        }

        pending.extend_from_slice(fresh);
        let consumed = pending.len() - dispatch(protocol, &pending[..], handler).await.len();
        pending.advance(consumed);

        // Only the partial packet left after dispatch counts against the limit.
        let len = pending.len();
        if max > 0 && len > max {
            return overflow(config, pending, len);
        }
        true
    }
}

/// Apply the overflow policy to a pending packet of `len` bytes.
fn overflow(config: &FramingConfig, pending: &mut BytesMut, len: usize) -> bool {
    pending.clear();
    match config.overflow_policy {
        OverflowPolicy::DropAndResync => {
            warn!(len, max = config.max_packet_size, "Dropping oversized packet");
            true
        },
        OverflowPolicy::CloseConnection => {
            warn!(len, max = config.max_packet_size, "Closing connection on oversized packet");
            false
        },
    }
}

/// Deliver every complete packet in `buf`, returning the unconsumed tail.
async fn dispatch<'b, P>(
    protocol: &P,
    mut buf: &'b [u8],
    handler: &mut dyn PacketHandler,
) -> &'b [u8]
where
    P: FramingProtocol + ?Sized,
{
    while let Some((packet, rest)) = protocol.extract_packet(buf) {
        if rest.len() >= buf.len() {
            break;
        }
        handler.on_packet(packet).await;
        buf = rest;
    }
    buf
}
