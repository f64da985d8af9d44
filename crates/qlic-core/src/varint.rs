//! Variable-length integer codec.
//!
//! Non-negative integers encode in 1, 2, 4, or 8 bytes; the top two bits of
//! the first byte select the width (0b00 = 1 byte / 6 data bits, 0b01 = 2 /
//! 14, 0b10 = 4 / 30, 0b11 = 8 / 62). The encoder always emits the minimum
//! sufficient width unless the caller pins one (packet headers are
//! right-justified into a reservation; the connection id is written at a
//! fixed width chosen once).
//!
//! Decoding distinguishes "not enough bytes yet" (`Ok(None)`) from
//! malformed input (`Err`): an incomplete varint at the tail of a byte pipe
//! is an expected condition, not an error.

use crate::error::WireError;

/// Largest encodable value (62 data bits).
pub const VARINT_MAX: u64 = (1 << 62) - 1;

const MAX_1: u64 = (1 << 6) - 1;
const MAX_2: u64 = (1 << 14) - 1;
const MAX_4: u64 = (1 << 30) - 1;

/// Encoded width in bytes for `n`, at minimum sufficient width.
///
/// # Errors
///
/// Returns [`WireError::VarintRange`] for values past 62 bits.
pub fn varint_len(n: u64) -> Result<usize, WireError> {
    match n {
        _ if n <= MAX_1 => Ok(1),
        _ if n <= MAX_2 => Ok(2),
        _ if n <= MAX_4 => Ok(4),
        _ if n <= VARINT_MAX => Ok(8),
        _ => Err(WireError::VarintRange(n)),
    }
}

/// Append `n` at minimum sufficient width.
///
/// # Errors
///
/// Returns [`WireError::VarintRange`] for values past 62 bits.
pub fn put_varint(buf: &mut Vec<u8>, n: u64) -> Result<(), WireError> {
    let width = varint_len(n)?;
    let mut scratch = [0u8; 8];
    encode_into(&mut scratch[..width], n, width);
    buf.extend_from_slice(&scratch[..width]);
    Ok(())
}

/// Encode `n` into exactly `out` (whose length must be 1, 2, 4, or 8 and
/// wide enough for the value).
///
/// # Errors
///
/// Returns [`WireError::VarintRange`] if `n` does not fit the given width
/// or the width is not a legal varint width.
pub fn put_varint_width(out: &mut [u8], n: u64) -> Result<(), WireError> {
    let width = out.len();
    let fits = match width {
        1 => n <= MAX_1,
        2 => n <= MAX_2,
        4 => n <= MAX_4,
        8 => n <= VARINT_MAX,
        _ => false,
    };
    if !fits {
        return Err(WireError::VarintRange(n));
    }
    encode_into(out, n, width);
    Ok(())
}

fn encode_into(out: &mut [u8], n: u64, width: usize) {
    let prefix: u8 = match width {
        1 => 0b00,
        2 => 0b01,
        4 => 0b10,
        _ => 0b11,
    };
    let bytes = n.to_be_bytes();
    out.copy_from_slice(&bytes[8 - width..]);
    out[0] = (out[0] & 0x3F) | (prefix << 6);
}

/// Decode one varint from the head of `buf`.
///
/// Returns `Ok(None)` if the buffer does not yet hold a complete varint,
/// otherwise the value and the number of bytes consumed.
pub fn decode_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let width = 1usize << (first >> 6);
    if buf.len() < width {
        return None;
    }
    let mut value = u64::from(first & 0x3F);
    for byte in &buf[1..width] {
        value = (value << 8) | u64::from(*byte);
    }
    Some((value, width))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn boundary_widths() {
        for (value, expected) in [
            (0u64, 1usize),
            (63, 1),
            (64, 2),
            (16_383, 2),
            (16_384, 4),
            ((1 << 30) - 1, 4),
            (1 << 30, 8),
            (VARINT_MAX, 8),
        ] {
            assert_eq!(varint_len(value).unwrap(), expected, "value {value}");
            let mut buf = Vec::new();
            put_varint(&mut buf, value).unwrap();
            assert_eq!(buf.len(), expected);
            assert_eq!(decode_varint(&buf), Some((value, expected)));
        }
    }

    #[test]
    fn out_of_range_is_rejected() {
        let mut buf = Vec::new();
        assert!(matches!(
            put_varint(&mut buf, VARINT_MAX + 1),
            Err(WireError::VarintRange(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_input_is_eof_not_error() {
        // First byte declares 4-byte width but only 2 bytes are present.
        let buf = [0b1000_0001u8, 0x00];
        assert_eq!(decode_varint(&buf), None);
        assert_eq!(decode_varint(&[]), None);
    }

    #[test]
    fn fixed_width_encoding() {
        let mut out = [0u8; 4];
        put_varint_width(&mut out, 7).unwrap();
        assert_eq!(decode_varint(&out), Some((7, 4)));

        // Value too large for the pinned width.
        let mut narrow = [0u8; 1];
        assert!(put_varint_width(&mut narrow, 64).is_err());

        // Width that is not a legal varint width.
        let mut odd = [0u8; 3];
        assert!(put_varint_width(&mut odd, 1).is_err());
    }

    #[test]
    fn non_minimal_encodings_still_decode() {
        // The decoder accepts any declared width; minimality is an encoder
        // property, not a decoder requirement.
        let mut wide = [0u8; 8];
        put_varint_width(&mut wide, 5).unwrap();
        assert_eq!(decode_varint(&wide), Some((5, 8)));
    }

    proptest! {
        #[test]
        fn roundtrip(value in 0u64..=VARINT_MAX) {
            let mut buf = Vec::new();
            put_varint(&mut buf, value).unwrap();
            prop_assert_eq!(buf.len(), varint_len(value).unwrap());
            prop_assert_eq!(decode_varint(&buf), Some((value, buf.len())));
        }

        #[test]
        fn trailing_bytes_are_untouched(value in 0u64..=VARINT_MAX, tail in any::<Vec<u8>>()) {
            let mut buf = Vec::new();
            put_varint(&mut buf, value).unwrap();
            let consumed = buf.len();
            buf.extend_from_slice(&tail);
            prop_assert_eq!(decode_varint(&buf), Some((value, consumed)));
        }
    }
}
