//! Error types for the server engine.
//!
//! Errors are split by layer: [`SocketError`] for per-connection I/O,
//! [`ServerError`] for the server lifecycle, and [`BroadcastError`] for the
//! bulk broadcaster. Only `ServerError` ever crosses the public server
//! boundary, and only from `start()`.

use std::io;

use thiserror::Error;

/// Errors returned by socket reads, writes and deadline updates.
#[derive(Error, Debug)]
pub enum SocketError {
    /// The socket was closed, locally or by the peer.
    #[error("use of closed connection")]
    Closed,

    /// The peer closed its side of the stream.
    #[error("end of stream")]
    EndOfStream,

    /// The read or write deadline passed before the operation completed.
    ///
    /// `transferred` bytes were moved before expiry, so a writer can resume
    /// with the unwritten suffix.
    #[error("i/o deadline exceeded after {transferred} bytes")]
    DeadlineExceeded {
        /// Bytes transferred before the deadline
        transferred: usize,
    },

    /// Any other transport error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl SocketError {
    /// True if the connection cannot be used after this error.
    ///
    /// Terminal errors close the socket automatically.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Closed | Self::EndOfStream => true,
            Self::DeadlineExceeded { .. } => false,
            Self::Io(err) => is_terminal_kind(err.kind()),
        }
    }

    /// True if this error is a deadline expiry. Never terminal.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::DeadlineExceeded { .. } => true,
            Self::Io(err) => err.kind() == io::ErrorKind::TimedOut,
            Self::Closed | Self::EndOfStream => false,
        }
    }
}

/// I/O error kinds after which the peer is gone.
pub(crate) fn is_terminal_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Convert `SocketError` to `io::Error` for code built on `std::io` APIs.
impl From<SocketError> for io::Error {
    fn from(err: SocketError) -> Self {
        match err {
            SocketError::Io(err) => err,
            SocketError::Closed => Self::new(io::ErrorKind::NotConnected, err.to_string()),
            SocketError::EndOfStream => Self::new(io::ErrorKind::UnexpectedEof, err.to_string()),
            SocketError::DeadlineExceeded { .. } => {
                Self::new(io::ErrorKind::TimedOut, err.to_string())
            },
        }
    }
}

/// Fatal server errors, returned from `Server::start`.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid configuration (bind address, intervals, TLS paths).
    #[error("configuration error: {0}")]
    Config(String),

    /// The listener could not be bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// Resolved address we tried to bind
        address: String,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// TLS material could not be loaded or is invalid.
    #[error("TLS error: {0}")]
    Tls(String),

    /// `start()` was called while the server is already listening.
    #[error("server already started")]
    AlreadyStarted,

    /// The background metrics and cleanup job failed.
    #[error("background job failed: {0}")]
    BackgroundJob(String),

    /// The server was aborted by an internal failure.
    #[error("server aborted: {0}")]
    Aborted(String),

    /// Transport error outside of a single connection.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Errors returned by the bulk broadcaster.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    /// Worker count or segment size is zero.
    #[error("invalid broadcaster config: {0}")]
    InvalidConfig(String),

    /// The broadcaster was stopped; no more messages are accepted.
    #[error("broadcaster stopped")]
    Stopped,
}
