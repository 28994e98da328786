//! Connected client socket.
//!
//! A [`Socket`] wraps one accepted connection (plain TCP or TLS) behind a
//! shared, thread-safe handle. Reads and writes are counted, honor optional
//! deadlines, and classify errors: terminal errors (peer gone, reset, broken
//! pipe) close the socket automatically, timeouts never do.
//!
//! # Close semantics
//!
//! - `close()` is idempotent. The first call wins a compare-and-swap on the
//!   closed latch; later calls return immediately.
//! - In-flight reads and writes are woken by the close signal and return
//!   [`SocketError::Closed`].
//! - Close listeners run exactly once, after the transport is released, in
//!   reverse registration order. A listener registered after close runs
//!   immediately on the registering task.
//! - A panicking listener is logged and does not stop the others.
//!
//! # Stream stack
//!
//! Each direction is a boxed stream: a [`CountingStream`] over the transport
//! half, plus any layers installed with [`Socket::wrap_reader`] and
//! [`Socket::wrap_writer`] (compression, for example). The counters always
//! measure wire bytes.

use std::{
    fmt::{self, Write as _},
    future::Future,
    io,
    net::SocketAddr,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{Mutex as AsyncMutex, Notify},
    time::Instant,
};
use tracing::{debug, error, warn};

use crate::{
    Closer, DeadlineSetter, Reader, SocketError, Writer,
    counting::{ByteCounter, CountingStream},
    error::is_terminal_kind,
    pool::Recycle,
    util::{lock, panic_message},
};

/// Transport a [`Socket`] can own: TCP streams, TLS streams, in-memory pipes.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Connection for T {}

type Transport = Box<dyn Connection>;

/// Read side of a socket's stream stack.
pub type SocketReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write side of a socket's stream stack.
pub type SocketWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Time allowed for a graceful transport shutdown (TLS close_notify).
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Callback invoked once when a socket closes.
pub type CloseListener = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Listeners {
    fired: bool,
    pending: Vec<CloseListener>,
}

/// Handle to one connected client.
///
/// Shared as `Arc<Socket>` between the registry, the connection strategy
/// and user code. All methods take `&self`.
pub struct Socket {
    id: u64,
    peer: Option<SocketAddr>,
    remote_address: String,
    connected_at: SystemTime,
    tls: bool,

    closed: AtomicBool,
    close_signal: Notify,

    reader: AsyncMutex<Option<SocketReader>>,
    writer: AsyncMutex<Option<SocketWriter>>,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,

    read_counter: Arc<ByteCounter>,
    write_counter: Arc<ByteCounter>,

    listeners: Mutex<Listeners>,
}

impl Default for Socket {
    fn default() -> Self {
        Self {
            id: 0,
            peer: None,
            remote_address: String::new(),
            connected_at: SystemTime::UNIX_EPOCH,
            tls: false,
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
            reader: AsyncMutex::new(None),
            writer: AsyncMutex::new(None),
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            read_counter: Arc::new(ByteCounter::new()),
            write_counter: Arc::new(ByteCounter::new()),
            listeners: Mutex::new(Listeners::default()),
        }
    }
}

impl Socket {
    /// Wrap a connection that did not go through a server.
    ///
    /// Useful for tests and for client-side code that wants the same
    /// counting and close semantics.
    pub fn new(conn: impl Connection, peer: Option<SocketAddr>) -> Self {
        let mut socket = Self::default();
        socket.attach(0, Box::new(conn), peer, false);
        socket
    }

    /// Bind a pooled (reset) socket to a freshly accepted connection.
    pub(crate) fn attach(
        &mut self,
        id: u64,
        conn: Transport,
        peer: Option<SocketAddr>,
        tls: bool,
    ) {
        let (reader, writer) = tokio::io::split(conn);

        self.id = id;
        self.peer = peer;
        self.remote_address.clear();
        if let Some(peer) = peer {
            let _ = write!(self.remote_address, "{}", peer.ip());
        }
        self.connected_at = SystemTime::now();
        self.tls = tls;
        *self.closed.get_mut() = false;
        *self.reader.get_mut() =
            Some(Box::new(CountingStream::new(reader, Arc::clone(&self.read_counter))));
        *self.writer.get_mut() =
            Some(Box::new(CountingStream::new(writer, Arc::clone(&self.write_counter))));
    }

    /// Server-assigned connection id, unique per server, starting at 1.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Peer host, without the port.
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// Full peer address, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Wall-clock time the connection was admitted.
    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    /// True for connections accepted through the TLS listener.
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Inbound byte counter.
    pub fn read_counter(&self) -> &ByteCounter {
        &self.read_counter
    }

    /// Outbound byte counter.
    pub fn write_counter(&self) -> &ByteCounter {
        &self.write_counter
    }

    /// Bytes read over the connection's lifetime.
    pub fn total_read(&self) -> u64 {
        self.read_counter.total()
    }

    /// Bytes written over the connection's lifetime.
    pub fn total_written(&self) -> u64 {
        self.write_counter.total()
    }

    /// Inbound bytes per second over the last tick.
    pub fn reads_per_second(&self) -> u64 {
        self.read_counter.rate()
    }

    /// Outbound bytes per second over the last tick.
    pub fn writes_per_second(&self) -> u64 {
        self.write_counter.rate()
    }

    /// Replace the read stream with `wrapper(current)`.
    ///
    /// Call before the first read; a pending read holds the stream and
    /// delays the swap. Does nothing once the socket is closed.
    pub async fn wrap_reader(&self, wrapper: impl FnOnce(SocketReader) -> SocketReader) {
        let mut guard = self.reader.lock().await;
        if let Some(reader) = guard.take() {
            *guard = Some(wrapper(reader));
        }
    }

    /// Replace the write stream with `wrapper(current)`.
    ///
    /// The wrapper is shut down on close, so it can flush trailing state.
    pub async fn wrap_writer(&self, wrapper: impl FnOnce(SocketWriter) -> SocketWriter) {
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.take() {
            *guard = Some(wrapper(writer));
        }
    }

    /// True once `close()` has started, locally or after a terminal error.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Read into `buf`.
    ///
    /// # Errors
    ///
    /// - [`SocketError::Closed`] if the socket is (or becomes) closed
    /// - [`SocketError::EndOfStream`] if the peer closed its side
    /// - [`SocketError::DeadlineExceeded`] if the read deadline passed
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        let result = self.read_once(buf).await;
        self.settle(result, "reading from").await
    }

    /// Write the whole of `buf` and flush.
    ///
    /// # Errors
    ///
    /// Same as [`Socket::read`]; a deadline expiry reports the number of
    /// bytes already written.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, SocketError> {
        let result = self.write_once(buf).await;
        self.settle(result, "writing to").await
    }

    /// Set the read deadline; `None` clears it.
    ///
    /// # Errors
    ///
    /// [`SocketError::Closed`] if the socket is closed.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<(), SocketError> {
        if self.is_closed() {
            return Err(SocketError::Closed);
        }
        *lock(&self.read_deadline) = deadline;
        Ok(())
    }

    /// Set the write deadline; `None` clears it.
    ///
    /// # Errors
    ///
    /// [`SocketError::Closed`] if the socket is closed.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<(), SocketError> {
        if self.is_closed() {
            return Err(SocketError::Closed);
        }
        *lock(&self.write_deadline) = deadline;
        Ok(())
    }

    /// Register a callback to run when the socket closes.
    pub fn on_close(&self, listener: impl FnOnce() + Send + 'static) {
        let mut listeners = lock(&self.listeners);
        if listeners.fired {
            drop(listeners);
            invoke(Box::new(listener));
            return;
        }
        listeners.pending.push(Box::new(listener));
    }

    /// Close the connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(socket_id = self.id, remote = %self.remote_address, "Closing TCP client connection");
        self.close_signal.notify_waiters();

        let reader = self.reader.lock().await.take();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await {
                Ok(Err(err)) if !is_terminal_kind(err.kind()) => {
                    debug!(socket_id = self.id, error = %err, "Error shutting down TCP connection");
                },
                _ => {},
            }
        }
        drop(reader);

        self.fire_listeners();
    }

    async fn read_once(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        let closed = self.close_signal.notified();
        tokio::pin!(closed);
        if self.is_closed() {
            return Err(SocketError::Closed);
        }
        let deadline = *lock(&self.read_deadline);

        let io = async {
            let mut guard = self.reader.lock().await;
            let Some(reader) = guard.as_mut() else {
                return Err(SocketError::Closed);
            };
            match within(deadline, reader.read(buf)).await {
                None => Err(SocketError::DeadlineExceeded { transferred: 0 }),
                Some(Ok(0)) if !buf.is_empty() => Err(SocketError::EndOfStream),
                Some(Ok(n)) => Ok(n),
                Some(Err(err)) => Err(SocketError::Io(err)),
            }
        };

        tokio::select! {
            biased;
            () = &mut closed => Err(SocketError::Closed),
            result = io => result,
        }
    }

    async fn write_once(&self, buf: &[u8]) -> Result<usize, SocketError> {
        let closed = self.close_signal.notified();
        tokio::pin!(closed);
        if self.is_closed() {
            return Err(SocketError::Closed);
        }
        let deadline = *lock(&self.write_deadline);

        let io = async {
            let mut guard = self.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                return Err(SocketError::Closed);
            };
            let mut transferred = 0;
            while transferred < buf.len() {
                match within(deadline, writer.write(&buf[transferred..])).await {
                    None => return Err(SocketError::DeadlineExceeded { transferred }),
                    Some(Ok(0)) => {
                        return Err(SocketError::Io(io::Error::from(io::ErrorKind::WriteZero)));
                    },
                    Some(Ok(n)) => transferred += n,
                    Some(Err(err)) => return Err(SocketError::Io(err)),
                }
            }

            match within(deadline, writer.flush()).await {
                None => Err(SocketError::DeadlineExceeded { transferred }),
                Some(Ok(())) => Ok(transferred),
                Some(Err(err)) => Err(SocketError::Io(err)),
            }
        };

        tokio::select! {
            biased;
            () = &mut closed => Err(SocketError::Closed),
            result = io => result,
        }
    }

    /// Classify an I/O outcome. Terminal errors close the socket.
    ///
    /// Must be called after the transport lock is released.
    async fn settle<T>(&self, result: Result<T, SocketError>, op: &str) -> Result<T, SocketError> {
        if let Err(err) = &result {
            if err.is_terminal() {
                if !self.is_closed() {
                    debug!(socket_id = self.id, remote = %self.remote_address, "Connection closed by TCP client");
                }
                self.close().await;
            } else if !err.is_timeout() {
                warn!(socket_id = self.id, error = %err, "Error while {op} TCP socket");
            }
        }
        result
    }

    fn fire_listeners(&self) {
        let mut pending = {
            let mut listeners = lock(&self.listeners);
            listeners.fired = true;
            std::mem::take(&mut listeners.pending)
        };

        while let Some(listener) = pending.pop() {
            invoke(listener);
        }

        // Hand the allocation back for the next connection.
        let mut listeners = lock(&self.listeners);
        if listeners.pending.is_empty() {
            listeners.pending = pending;
        }
    }
}

fn invoke(listener: CloseListener) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(listener)) {
        error!(panic = %panic_message(&*panic), "Panic inside socket close listener");
    }
}

/// Run `fut` until `deadline`. `None` means the deadline passed first.
async fn within<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        None => Some(fut.await),
        Some(deadline) if deadline <= Instant::now() => None,
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
    }
}

impl Recycle for Socket {
    fn reset(&mut self) {
        self.id = 0;
        self.peer = None;
        self.remote_address.clear();
        self.connected_at = SystemTime::UNIX_EPOCH;
        self.tls = false;
        *self.closed.get_mut() = false;
        *self.reader.get_mut() = None;
        *self.writer.get_mut() = None;
        *self.read_deadline.get_mut().unwrap_or_else(PoisonError::into_inner) = None;
        *self.write_deadline.get_mut().unwrap_or_else(PoisonError::into_inner) = None;
        self.read_counter.reset();
        self.write_counter.reset();
        let listeners = self.listeners.get_mut().unwrap_or_else(PoisonError::into_inner);
        listeners.fired = false;
        listeners.pending.clear();
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("remote_address", &self.remote_address)
            .field("tls", &self.tls)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Reader for Socket {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        Socket::read(self, buf).await
    }
}

#[async_trait]
impl Writer for Socket {
    async fn write(&self, buf: &[u8]) -> Result<usize, SocketError> {
        Socket::write(self, buf).await
    }
}

#[async_trait]
impl Closer for Socket {
    async fn close(&self) {
        Socket::close(self).await;
    }

    fn is_closed(&self) -> bool {
        Socket::is_closed(self)
    }
}

impl DeadlineSetter for Socket {
    fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<(), SocketError> {
        Socket::set_read_deadline(self, deadline)
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<(), SocketError> {
        Socket::set_write_deadline(self, deadline)
    }
}
