//! Packet framing protocols for tinytcp.
//!
//! A TCP connection delivers a continuous byte stream. This crate defines how
//! discrete packets are cut out of that stream, without performing any I/O:
//!
//! - [`FramingProtocol`]: extension point with two operations, extract and
//!   encode.
//! - [`SplitBySeparator`]: packets end with a fixed byte sequence (e.g. `\n`
//!   for line-oriented protocols).
//! - [`LengthPrefixed`]: packets start with their length, encoded as one of
//!   the [`LengthPrefix`] kinds.
//!
//! Extraction borrows from the caller's buffer. A returned packet is a view
//! into that buffer and stays valid only as long as the buffer is not
//! modified, which the borrow checker enforces.
//!
//! # Example
//!
//! ```
//! use tinytcp_proto::{FramingProtocol, SplitBySeparator};
//!
//! let protocol = SplitBySeparator::newline();
//! let (packet, rest) = protocol.extract_packet(b"AAAA\nBB").unwrap();
//! assert_eq!(packet, b"AAAA");
//! assert_eq!(rest, b"BB");
//! assert!(protocol.extract_packet(rest).is_none());
//! ```

#![forbid(unsafe_code)]

pub mod errors;
mod length_prefix;
mod protocol;
mod separator;
pub mod varint;

pub use errors::{FramingError, Result};
pub use length_prefix::{LengthPrefix, LengthPrefixed};
pub use protocol::FramingProtocol;
pub use separator::SplitBySeparator;
