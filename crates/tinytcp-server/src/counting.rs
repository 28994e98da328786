//! Byte-counting stream wrappers.
//!
//! Every socket owns two [`ByteCounter`]s, one per direction, shared with the
//! [`CountingStream`] layers sitting directly on its transport halves. User
//! stream wrappers go on top, so the counters always see wire bytes.
//!
//! Counters track three values:
//! - `current`: bytes moved since the last tick (atomic increment on I/O)
//! - `total`: bytes accumulated by previous ticks
//! - `rate`: bytes per second over the last tick interval
//!
//! The background job calls [`ByteCounter::update`] once per tick, which
//! swaps `current` to zero and folds it into `total`.

use std::{
    io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Lock-free byte counter for one stream direction.
#[derive(Debug, Default)]
pub struct ByteCounter {
    current: AtomicU64,
    total: AtomicU64,
    rate: AtomicU64,
}

impl ByteCounter {
    /// Create a zeroed counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `n` transferred bytes.
    pub fn add(&self, n: usize) {
        if n > 0 {
            self.current.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    /// Bytes transferred since the last tick.
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Bytes transferred over the whole lifetime of the stream.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed) + self.current()
    }

    /// Bytes per second measured over the last tick interval.
    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    /// Close the current interval.
    ///
    /// Atomically takes the per-interval count, folds it into the total,
    /// recomputes the rate and returns the bytes moved in the interval.
    pub fn update(&self, interval: Duration) -> u64 {
        let current = self.current.swap(0, Ordering::AcqRel);
        self.total.fetch_add(current, Ordering::Relaxed);
        self.rate.store(per_second(current, interval), Ordering::Relaxed);
        current
    }

    /// Zero every field before the owner is recycled.
    pub fn reset(&self) {
        self.current.store(0, Ordering::Relaxed);
        self.total.store(0, Ordering::Relaxed);
        self.rate.store(0, Ordering::Relaxed);
    }
}

/// Convert a byte count over `interval` into bytes per second.
pub(crate) fn per_second(bytes: u64, interval: Duration) -> u64 {
    if interval.is_zero() {
        return bytes;
    }
    (bytes as f64 / interval.as_secs_f64()) as u64
}

/// Stream adapter that records transferred bytes into a [`ByteCounter`].
///
/// Reads count the bytes appended to the read buffer, writes count the
/// bytes the transport accepted. Flush and shutdown pass through.
pub struct CountingStream<S> {
    inner: S,
    counter: Arc<ByteCounter>,
}

impl<S> CountingStream<S> {
    /// Wrap `inner`, counting into `counter`.
    pub fn new(inner: S, counter: Arc<ByteCounter>) -> Self {
        Self { inner, counter }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            this.counter.add(buf.filled().len() - before);
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountingStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            this.counter.add(n);
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
