//! The framing extension point.

use std::sync::Arc;

use bytes::BytesMut;

use crate::errors::Result;

/// Strategy for cutting packets out of a byte buffer.
///
/// # Invariants
///
/// - `extract_packet` never mutates its input. Returning `None` means "not
///   enough data yet", and the caller keeps the whole buffer for the next
///   attempt.
/// - When `Some((packet, rest))` is returned, `rest` is a suffix of `buf` and
///   everything before `rest` belongs to the extracted packet (including any
///   prefix or separator bytes).
/// - `extract_packet(encode_packet(p))` yields `(p, [])` for every payload
///   that `encode_packet` accepts.
pub trait FramingProtocol: Send + Sync {
    /// Split `buf` into the first complete packet and the remaining bytes.
    fn extract_packet<'a>(&self, buf: &'a [u8]) -> Option<(&'a [u8], &'a [u8])>;

    /// Append `payload`, framed by this protocol, to `dst`.
    fn encode_packet(&self, payload: &[u8], dst: &mut BytesMut) -> Result<()>;
}

impl<P: FramingProtocol + ?Sized> FramingProtocol for Box<P> {
    fn extract_packet<'a>(&self, buf: &'a [u8]) -> Option<(&'a [u8], &'a [u8])> {
        (**self).extract_packet(buf)
    }

    fn encode_packet(&self, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        (**self).encode_packet(payload, dst)
    }
}

impl<P: FramingProtocol + ?Sized> FramingProtocol for Arc<P> {
    fn extract_packet<'a>(&self, buf: &'a [u8]) -> Option<(&'a [u8], &'a [u8])> {
        (**self).extract_packet(buf)
    }

    fn encode_packet(&self, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        (**self).encode_packet(payload, dst)
    }
}
