//! Prefix-based integer coding (RFC 7541 Section 5.1).
//!
//! An integer is packed into the low N bits of a byte; if the value does
//! not fit, the remaining value follows as a series of 7-bit continuation
//! bytes, least significant group first.

use bytes::{BufMut, BytesMut};

use crate::error::{Result, TapwireError};

/// Encode an integer with the given prefix size (1..=8 bits).
///
/// `first_byte_mask` contains the high bits already set in the first byte,
/// the bits above the prefix. `prefix_bits` is the number of low bits
/// available in the first byte.
pub fn encode_integer(value: u64, prefix_bits: u8, first_byte_mask: u8, buf: &mut BytesMut) {
    debug_assert!((1..=8).contains(&prefix_bits));

    let max_prefix: u64 = (1u64 << prefix_bits) - 1;

    if value < max_prefix {
        buf.put_u8(first_byte_mask | (value as u8));
        return;
    }

    buf.put_u8(first_byte_mask | (max_prefix as u8));
    let mut remaining = value - max_prefix;
    while remaining >= 128 {
        buf.put_u8(0x80 | (remaining & 0x7f) as u8);
        remaining >>= 7;
    }
    buf.put_u8(remaining as u8);
}

/// Decode an integer with the given prefix size (1..=8 bits).
///
/// Returns `(value, bytes_consumed)`.
pub fn decode_integer(buf: &[u8], prefix_bits: u8) -> Result<(u64, usize)> {
    debug_assert!((1..=8).contains(&prefix_bits));

    if buf.is_empty() {
        return Err(TapwireError::Hpack("integer truncated at first byte".into()));
    }

    let max_prefix: u64 = (1u64 << prefix_bits) - 1;
    let value = u64::from(buf[0]) & max_prefix;

    if value < max_prefix {
        return Ok((value, 1));
    }

    let mut value = max_prefix;
    let mut shift: u32 = 0;
    let mut i = 1;

    loop {
        if i >= buf.len() {
            return Err(TapwireError::Hpack(
                "integer truncated mid continuation".into(),
            ));
        }

        let byte = buf[i];
        // checked_shl would let high bits fall off silently, so multiply.
        let addition = u64::from(byte & 0x7f)
            .checked_mul(1u64 << shift)
            .ok_or_else(|| TapwireError::Hpack("integer continuation overflows u64".into()))?;
        value = value
            .checked_add(addition)
            .ok_or_else(|| TapwireError::Hpack("integer continuation overflows u64".into()))?;

        i += 1;
        if byte & 0x80 == 0 {
            break;
        }

        shift += 7;
        if shift > 63 {
            return Err(TapwireError::Hpack("integer continuation overflows u64".into()));
        }
    }

    Ok((value, i))
}
