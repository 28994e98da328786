//! Separator-delimited framing.

use bytes::{BufMut, BytesMut};

use crate::{
    FramingProtocol,
    errors::{FramingError, Result},
};

/// Packets terminated by a fixed byte sequence.
///
/// Suited to line-oriented protocols such as Telnet-style sessions. The
/// separator itself is consumed and never appears in the extracted packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitBySeparator {
    separator: Box<[u8]>,
}

impl SplitBySeparator {
    /// Create a separator protocol.
    ///
    /// # Errors
    ///
    /// - `FramingError::EmptySeparator` if `separator` is empty
    pub fn new(separator: impl Into<Vec<u8>>) -> Result<Self> {
        let separator = separator.into();
        if separator.is_empty() {
            return Err(FramingError::EmptySeparator);
        }

        Ok(Self { separator: separator.into_boxed_slice() })
    }

    /// Packets terminated by `\n`.
    #[must_use]
    pub fn newline() -> Self {
        Self { separator: Box::new([b'\n']) }
    }

    /// The configured separator.
    #[must_use]
    pub fn separator(&self) -> &[u8] {
        &self.separator
    }

    fn find(&self, haystack: &[u8]) -> Option<usize> {
        match &*self.separator {
            [byte] => haystack.iter().position(|b| b == byte),
            _ => haystack.windows(self.separator.len()).position(|w| w == &*self.separator),
        }
    }
}

impl FramingProtocol for SplitBySeparator {
    fn extract_packet<'a>(&self, buf: &'a [u8]) -> Option<(&'a [u8], &'a [u8])> {
        let at = self.find(buf)?;
        let (packet, tail) = buf.split_at(at);
        Some((packet, tail.get(self.separator.len()..)?))
    }

    fn encode_packet(&self, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        if let Some(offset) = self.find(payload) {
            return Err(FramingError::PayloadContainsSeparator { offset });
        }

        dst.reserve(payload.len() + self.separator.len());
        dst.put_slice(payload);
        dst.put_slice(&self.separator);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_frames_in_one_buffer() {
        let protocol = SplitBySeparator::newline();

        let (first, rest) = protocol.extract_packet(b"AAAA\nBBBB\n").unwrap();
        assert_eq!(first, b"AAAA");

        let (second, rest) = protocol.extract_packet(rest).unwrap();
        assert_eq!(second, b"BBBB");
        assert!(rest.is_empty());
    }

    #[test]
    fn missing_separator_extracts_nothing() {
        let protocol = SplitBySeparator::newline();
        assert!(protocol.extract_packet(b"no newline here").is_none());
        assert!(protocol.extract_packet(b"").is_none());
    }

    #[test]
    fn empty_packet_between_separators() {
        let protocol = SplitBySeparator::newline();
        let (packet, rest) = protocol.extract_packet(b"\nX\n").unwrap();
        assert!(packet.is_empty());
        assert_eq!(rest, b"X\n");
    }

    #[test]
    fn multi_byte_separator() {
        let protocol = SplitBySeparator::new(b"\r\n".to_vec()).unwrap();

        assert!(protocol.extract_packet(b"HELLO\r").is_none());

        let (packet, rest) = protocol.extract_packet(b"HELLO\r\nWORLD").unwrap();
        assert_eq!(packet, b"HELLO");
        assert_eq!(rest, b"WORLD");
    }

    #[test]
    fn empty_separator_rejected() {
        assert_eq!(SplitBySeparator::new(Vec::new()), Err(FramingError::EmptySeparator));
    }

    #[test]
    fn encode_appends_separator() {
        let protocol = SplitBySeparator::newline();
        let mut dst = BytesMut::new();
        protocol.encode_packet(b"ping", &mut dst).unwrap();
        assert_eq!(&dst[..], b"ping\n");
    }

    #[test]
    fn encode_rejects_embedded_separator() {
        let protocol = SplitBySeparator::newline();
        let mut dst = BytesMut::new();
        assert_eq!(
            protocol.encode_packet(b"ab\ncd", &mut dst),
            Err(FramingError::PayloadContainsSeparator { offset: 2 })
        );
        assert!(dst.is_empty());
    }
}
