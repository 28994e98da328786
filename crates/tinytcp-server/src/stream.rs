//! Capability traits for byte streams.
//!
//! Components that only move bytes (framing, broadcast) depend on these
//! traits instead of [`Socket`](crate::Socket), so they can be driven by any
//! stream implementation, including in-memory test doubles.

use async_trait::async_trait;
use tokio::time::Instant;

use crate::SocketError;

/// Reads bytes from a stream.
#[async_trait]
pub trait Reader: Send + Sync {
    /// Read into `buf`, returning the number of bytes read.
    ///
    /// Zero bytes read into a non-empty buffer is reported as
    /// [`SocketError::EndOfStream`], never as `Ok(0)`.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, SocketError>;
}

/// Writes bytes to a stream.
#[async_trait]
pub trait Writer: Send + Sync {
    /// Write the whole of `buf` and flush it.
    ///
    /// On deadline expiry the error carries how many bytes were written.
    async fn write(&self, buf: &[u8]) -> Result<usize, SocketError>;
}

/// Closes a stream.
#[async_trait]
pub trait Closer: Send + Sync {
    /// Close the stream. Idempotent.
    async fn close(&self);

    /// True once the stream is closed.
    fn is_closed(&self) -> bool;
}

/// Sets I/O deadlines on a stream.
pub trait DeadlineSetter: Send + Sync {
    /// Deadline for subsequent reads; `None` clears it.
    fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<(), SocketError>;

    /// Deadline for subsequent writes; `None` clears it.
    fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<(), SocketError>;
}

/// A full duplex byte stream.
pub trait ByteStream: Reader + Writer + Closer + DeadlineSetter {}

impl<T: Reader + Writer + Closer + DeadlineSetter + ?Sized> ByteStream for T {}
