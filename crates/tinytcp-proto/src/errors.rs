//! Error types for packet encoding.
//!
//! Extraction never fails: an incomplete or not-yet-decodable buffer simply
//! yields no packet. Errors only arise when building a protocol or encoding a
//! payload that the protocol cannot represent.

use thiserror::Error;

use crate::LengthPrefix;

/// Result alias for framing operations.
pub type Result<T> = std::result::Result<T, FramingError>;

/// Errors raised while configuring a protocol or encoding a packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// Payload length does not fit the configured length prefix.
    #[error("payload too large: {len} bytes exceeds {prefix:?} limit of {max}")]
    PayloadTooLarge {
        /// Actual payload length
        len: usize,
        /// Largest length the prefix can carry
        max: u64,
        /// Prefix kind that was used
        prefix: LengthPrefix,
    },

    /// A separator protocol needs at least one byte to split on.
    #[error("separator must not be empty")]
    EmptySeparator,

    /// Payload contains the separator, so the receiver would split it early.
    #[error("payload contains the separator at offset {offset}")]
    PayloadContainsSeparator {
        /// Offset of the first separator occurrence
        offset: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = FramingError::PayloadTooLarge { len: 70_000, max: 65_535, prefix: LengthPrefix::U16Be };
        assert_eq!(err.to_string(), "payload too large: 70000 bytes exceeds U16Be limit of 65535");

        let err = FramingError::PayloadContainsSeparator { offset: 3 };
        assert_eq!(err.to_string(), "payload contains the separator at offset 3");
    }
}
