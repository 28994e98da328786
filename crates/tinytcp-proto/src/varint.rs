//! Variable-length integers with 7-bit continuation encoding.
//!
//! Each byte carries 7 value bits, least significant group first. The high
//! bit is set on every byte except the last one.
//!
//! - `VarInt`: at most 5 bytes, 32-bit value
//! - `VarLong`: at most 10 bytes, 64-bit value

use bytes::BufMut;

/// Longest encoding of a 32-bit varint.
pub const MAX_VAR_INT_LEN: usize = 5;

/// Longest encoding of a 64-bit varint.
pub const MAX_VAR_LONG_LEN: usize = 10;

const SEGMENT_BITS: u8 = 0x7F;
const CONTINUE_BIT: u8 = 0x80;

/// Decode a 32-bit varint from the start of `buf`.
///
/// Returns `(encoded_len, value)`, or `None` if the buffer ends before the
/// terminating byte or the encoding runs past [`MAX_VAR_INT_LEN`] bytes.
/// Value bits beyond 32 in the fifth byte are discarded.
pub fn read_var_int(buf: &[u8]) -> Option<(usize, u32)> {
    read(buf, MAX_VAR_INT_LEN).map(|(len, value)| (len, value as u32))
}

/// Decode a 64-bit varint from the start of `buf`.
///
/// Returns `(encoded_len, value)`, or `None` if the buffer ends before the
/// terminating byte or the encoding runs past [`MAX_VAR_LONG_LEN`] bytes.
pub fn read_var_long(buf: &[u8]) -> Option<(usize, u64)> {
    read(buf, MAX_VAR_LONG_LEN)
}

/// Append a 32-bit varint to `dst`.
pub fn put_var_int(dst: &mut impl BufMut, value: u32) {
    put_var_long(dst, u64::from(value));
}

/// Append a 64-bit varint to `dst`.
pub fn put_var_long(dst: &mut impl BufMut, mut value: u64) {
    while value > u64::from(SEGMENT_BITS) {
        dst.put_u8((value as u8 & SEGMENT_BITS) | CONTINUE_BIT);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Number of bytes `put_var_long(value)` writes.
pub fn var_long_len(value: u64) -> usize {
    let significant_bits = (u64::BITS - value.leading_zeros()).max(1) as usize;
    significant_bits.div_ceil(7)
}

fn read(buf: &[u8], max_len: usize) -> Option<(usize, u64)> {
    let mut value = 0u64;

    for (i, &byte) in buf.iter().take(max_len).enumerate() {
        value |= u64::from(byte & SEGMENT_BITS) << (7 * i);
        if byte & CONTINUE_BIT == 0 {
            return Some((i + 1, value));
        }
    }

    None
}
