//! Variable-length integer codec (RFC 9000 section 16).

use super::error::{CodecError, Result};

/// Largest value representable as a variable-length integer.
pub const MAX: u64 = (1 << 62) - 1;

/// Minimal encoded length for `value`: 1, 2, 4, or 8 bytes.
///
/// Only meaningful for values within [`MAX`]; larger values report 8.
#[must_use]
pub const fn len(value: u64) -> usize {
    if value < 1 << 6 {
        1
    } else if value < 1 << 14 {
        2
    } else if value < 1 << 30 {
        4
    } else {
        8
    }
}

/// Encode `value` into the front of `buf`, returning the encoded length.
pub fn encode_into(value: u64, buf: &mut [u8]) -> Result<usize> {
    if value > MAX {
        return Err(CodecError::VarintOverflow { value });
    }
    let needed = len(value);
    if buf.len() < needed {
        return Err(CodecError::UnexpectedEnd {
            needed,
            available: buf.len(),
        });
    }
    match needed {
        1 => buf[0] = value as u8,
        2 => buf[..2].copy_from_slice(&((value as u16) | 0x4000).to_be_bytes()),
        4 => buf[..4].copy_from_slice(&((value as u32) | 0x8000_0000).to_be_bytes()),
        _ => buf[..8].copy_from_slice(&(value | 0xc000_0000_0000_0000).to_be_bytes()),
    }
    Ok(needed)
}

/// Decode a varint from the front of `buf`, returning the value and consumed length.
pub fn decode_from(buf: &[u8]) -> Result<(u64, usize)> {
    let Some(&first) = buf.first() else {
        return Err(CodecError::UnexpectedEnd {
            needed: 1,
            available: 0,
        });
    };
    let needed = 1usize << (first >> 6);
    if buf.len() < needed {
        return Err(CodecError::UnexpectedEnd {
            needed,
            available: buf.len(),
        });
    }
    let mut value = u64::from(first & 0x3f);
    for &byte in &buf[1..needed] {
        value = (value << 8) | u64::from(byte);
    }
    Ok((value, needed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_at_documented_thresholds() {
        assert_eq!(len(0), 1);
        assert_eq!(len(63), 1);
        assert_eq!(len(64), 2);
        assert_eq!(len(16383), 2);
        assert_eq!(len(16384), 4);
        assert_eq!(len(1_073_741_823), 4);
        assert_eq!(len(1_073_741_824), 8);
        assert_eq!(len(MAX), 8);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut buf = [0u8; 8];
        assert!(matches!(
            encode_into(MAX + 1, &mut buf),
            Err(CodecError::VarintOverflow { .. })
        ));
    }

    #[test]
    fn decode_reports_short_buffer() {
        // First byte declares an 8-byte encoding but only 3 bytes follow.
        let buf = [0xc0, 0x01, 0x02];
        assert!(matches!(
            decode_from(&buf),
            Err(CodecError::UnexpectedEnd { needed: 8, .. })
        ));
    }

    #[test]
    fn rfc_appendix_a_examples() {
        // RFC 9000 A.1 sample encodings.
        let mut buf = [0u8; 8];
        assert_eq!(encode_into(151_288_809_941_952_652, &mut buf).unwrap(), 8);
        assert_eq!(buf, [0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c]);

        assert_eq!(decode_from(&[0x9d, 0x7f, 0x3e, 0x7d]).unwrap(), (494_878_333, 4));
        assert_eq!(decode_from(&[0x7b, 0xbd]).unwrap(), (15_293, 2));
        assert_eq!(decode_from(&[0x25]).unwrap(), (37, 1));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: any in-range value roundtrips and uses the minimal length.
            #[test]
            fn prop_roundtrip(value in 0u64..=MAX) {
                let mut buf = [0u8; 8];
                let written = encode_into(value, &mut buf).unwrap();
                prop_assert_eq!(written, len(value));
                let (decoded, consumed) = decode_from(&buf[..written]).unwrap();
                prop_assert_eq!(decoded, value);
                prop_assert_eq!(consumed, written);
            }
        }
    }
}
