//! Length-prefixed framing.
//!
//! Wire layout: `[length prefix][payload: declared length bytes]`. The prefix
//! carries the payload length only, never its own size.

use bytes::{BufMut, BytesMut};

use crate::{
    FramingProtocol,
    errors::{FramingError, Result},
    varint,
};

/// Encoding of the packet length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LengthPrefix {
    /// 7-bit continuation varint, at most 5 bytes, 32-bit length
    VarInt,
    /// 7-bit continuation varint, at most 10 bytes, 64-bit length
    VarLong,
    /// 16-bit unsigned, big endian
    U16Be,
    /// 16-bit unsigned, little endian
    U16Le,
    /// 32-bit unsigned, big endian
    U32Be,
    /// 32-bit unsigned, little endian
    U32Le,
    /// 64-bit unsigned, big endian
    U64Be,
    /// 64-bit unsigned, little endian
    U64Le,
}

impl LengthPrefix {
    /// Every prefix kind.
    pub const ALL: [Self; 8] = [
        Self::VarInt,
        Self::VarLong,
        Self::U16Be,
        Self::U16Le,
        Self::U32Be,
        Self::U32Le,
        Self::U64Be,
        Self::U64Le,
    ];

    /// Width in bytes for fixed-width prefixes, `None` for varints.
    #[must_use]
    pub const fn fixed_width(self) -> Option<usize> {
        match self {
            Self::VarInt | Self::VarLong => None,
            Self::U16Be | Self::U16Le => Some(2),
            Self::U32Be | Self::U32Le => Some(4),
            Self::U64Be | Self::U64Le => Some(8),
        }
    }

    /// Largest payload length representable by this prefix.
    #[must_use]
    pub const fn max_length(self) -> u64 {
        match self {
            Self::U16Be | Self::U16Le => u16::MAX as u64,
            Self::VarInt | Self::U32Be | Self::U32Le => u32::MAX as u64,
            Self::VarLong | Self::U64Be | Self::U64Le => u64::MAX,
        }
    }

    /// Decode the prefix at the start of `buf`.
    ///
    /// Returns `(prefix_len, declared_length)`, or `None` if the prefix is
    /// not fully buffered yet.
    #[must_use]
    pub fn decode(self, buf: &[u8]) -> Option<(usize, u64)> {
        match self {
            Self::VarInt => varint::read_var_int(buf).map(|(len, value)| (len, u64::from(value))),
            Self::VarLong => varint::read_var_long(buf),
            Self::U16Be => Some((2, u64::from(u16::from_be_bytes(take(buf)?)))),
            Self::U16Le => Some((2, u64::from(u16::from_le_bytes(take(buf)?)))),
            Self::U32Be => Some((4, u64::from(u32::from_be_bytes(take(buf)?)))),
            Self::U32Le => Some((4, u64::from(u32::from_le_bytes(take(buf)?)))),
            Self::U64Be => Some((8, u64::from_be_bytes(take(buf)?))),
            Self::U64Le => Some((8, u64::from_le_bytes(take(buf)?))),
        }
    }

    /// Append a prefix declaring `len` payload bytes.
    ///
    /// # Errors
    ///
    /// - `FramingError::PayloadTooLarge` if `len` exceeds
    ///   [`LengthPrefix::max_length`]
    pub fn encode(self, len: usize, dst: &mut impl BufMut) -> Result<()> {
        let too_large = || FramingError::PayloadTooLarge { len, max: self.max_length(), prefix: self };
        let value = u64::try_from(len).map_err(|_| too_large())?;
        if value > self.max_length() {
            return Err(too_large());
        }

        match self {
            Self::VarInt | Self::VarLong => varint::put_var_long(dst, value),
            Self::U16Be => dst.put_u16(value as u16),
            Self::U16Le => dst.put_u16_le(value as u16),
            Self::U32Be => dst.put_u32(value as u32),
            Self::U32Le => dst.put_u32_le(value as u32),
            Self::U64Be => dst.put_u64(value),
            Self::U64Le => dst.put_u64_le(value),
        }

        Ok(())
    }
}

fn take<const N: usize>(buf: &[u8]) -> Option<[u8; N]> {
    buf.get(..N)?.try_into().ok()
}

/// Packets preceded by their payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthPrefixed {
    prefix: LengthPrefix,
}

impl LengthPrefixed {
    /// Create a length-prefixed protocol using `prefix`.
    #[must_use]
    pub const fn new(prefix: LengthPrefix) -> Self {
        Self { prefix }
    }

    /// The configured prefix kind.
    #[must_use]
    pub const fn prefix(&self) -> LengthPrefix {
        self.prefix
    }
}

impl FramingProtocol for LengthPrefixed {
    fn extract_packet<'a>(&self, buf: &'a [u8]) -> Option<(&'a [u8], &'a [u8])> {
        let (prefix_len, declared) = self.prefix.decode(buf)?;
        // A length that does not fit in memory can never be satisfied.
        let declared = usize::try_from(declared).ok()?;
        let body = buf.get(prefix_len..)?;

        if body.len() < declared {
            return None;
        }

        Some(body.split_at(declared))
    }

    fn encode_packet(&self, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        let prefix_len = match self.prefix.fixed_width() {
            Some(width) => width,
            None => varint::var_long_len(payload.len() as u64),
        };

        dst.reserve(prefix_len + payload.len());
        self.prefix.encode(payload.len(), dst)?;
        dst.put_slice(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(prefix: LengthPrefix, payload: &[u8]) -> BytesMut {
        let mut dst = BytesMut::new();
        LengthPrefixed::new(prefix).encode_packet(payload, &mut dst).unwrap();
        dst
    }

    #[test]
    fn u32_be_waits_for_declared_length() {
        let protocol = LengthPrefixed::new(LengthPrefix::U32Be);
        let mut buf = vec![0, 0, 0, 10];
        buf.extend_from_slice(b"012345");

        let before = buf.clone();
        assert!(protocol.extract_packet(&buf).is_none());
        assert_eq!(buf, before);

        buf.extend_from_slice(b"6789");
        let (packet, rest) = protocol.extract_packet(&buf).unwrap();
        assert_eq!(packet, b"0123456789");
        assert!(rest.is_empty());
    }

    #[test]
    fn partial_prefix_extracts_nothing() {
        for prefix in LengthPrefix::ALL {
            let full = encoded(prefix, &[7u8; 300]);
            let protocol = LengthPrefixed::new(prefix);
            assert!(protocol.extract_packet(&full[..1]).is_none(), "{prefix:?}");
        }
    }

    #[test]
    fn little_endian_prefix_layout() {
        assert_eq!(&encoded(LengthPrefix::U16Le, b"abc")[..], &[3, 0, b'a', b'b', b'c']);
        assert_eq!(&encoded(LengthPrefix::U16Be, b"abc")[..], &[0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn zero_length_packet() {
        let protocol = LengthPrefixed::new(LengthPrefix::VarInt);
        let (packet, rest) = protocol.extract_packet(&[0x00, 0xFF]).unwrap();
        assert!(packet.is_empty());
        assert_eq!(rest, &[0xFF]);
    }

    #[test]
    fn rest_holds_following_packet() {
        let mut buf = encoded(LengthPrefix::U64Le, b"first");
        buf.extend_from_slice(&encoded(LengthPrefix::U64Le, b"second"));

        let protocol = LengthPrefixed::new(LengthPrefix::U64Le);
        let (first, rest) = protocol.extract_packet(&buf).unwrap();
        assert_eq!(first, b"first");

        let (second, rest) = protocol.extract_packet(rest).unwrap();
        assert_eq!(second, b"second");
        assert!(rest.is_empty());
    }

    #[test]
    fn oversized_payload_rejected_for_u16() {
        let mut dst = BytesMut::new();
        let result =
            LengthPrefixed::new(LengthPrefix::U16Be).encode_packet(&vec![0u8; 70_000], &mut dst);
        assert_eq!(
            result,
            Err(FramingError::PayloadTooLarge { len: 70_000, max: 65_535, prefix: LengthPrefix::U16Be })
        );
        assert!(dst.is_empty());
    }

    #[test]
    fn huge_declared_length_never_extracts() {
        let protocol = LengthPrefixed::new(LengthPrefix::U64Be);
        let buf = [0xFF; 16];
        assert!(protocol.extract_packet(&buf).is_none());
    }
}
