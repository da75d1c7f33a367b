//! Packet number truncation and reconstruction (RFC 9000 appendix A).

/// Largest valid full packet number (62 bits).
pub const MAX_PACKET_NUMBER: u64 = (1 << 62) - 1;

/// Truncate `pn` for transmission given the largest packet number the
/// peer has acknowledged, returning the truncated value and the minimal
/// byte length in 1..=4.
///
/// The sender must keep at least twice the unacknowledged range
/// representable, so the receiver can reconstruct unambiguously.
#[must_use]
pub fn truncate(pn: u64, largest_acked: Option<u64>) -> (u64, usize) {
    let num_unacked = match largest_acked {
        Some(largest) => pn.saturating_sub(largest),
        None => pn + 1,
    };
    // Bits needed to represent twice the unacked range.
    let min_bits = 64 - num_unacked.leading_zeros() as usize + 1;
    let len = min_bits.div_ceil(8).clamp(1, 4);
    let mask = if len == 4 { u64::from(u32::MAX) } else { (1u64 << (len * 8)) - 1 };
    (pn & mask, len)
}

/// Reconstruct a full packet number from its truncated form.
///
/// `expected` is the next packet number the receiver anticipates
/// (largest received plus one). Picks the candidate with the given low
/// bits closest to `expected`, breaking ties toward the smaller value.
#[must_use]
pub fn decode(expected: u64, truncated: u64, len: usize) -> u64 {
    let pn_bits = (len * 8) as u32;
    let win = 1u64 << pn_bits;
    let half = win / 2;
    let mask = win - 1;
    let candidate = (expected & !mask) | truncated;
    if candidate.wrapping_add(half) <= expected && candidate.checked_add(win).is_some_and(|c| c <= MAX_PACKET_NUMBER) {
        candidate + win
    } else if candidate > expected.saturating_add(half) && candidate >= win {
        candidate - win
    } else {
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_minimal_length() {
        assert_eq!(truncate(0, None), (0, 1));
        assert_eq!(truncate(0xff, Some(0xfe)), (0xff, 1));
        assert_eq!(truncate(0xac5c02, Some(0xabe8b3)), (0x5c02, 2));
        assert_eq!(truncate(0xace8fe, Some(0xabe8b3)), (0xace8fe & 0xff_ffff, 3));
    }

    #[test]
    fn rfc_appendix_example() {
        // RFC 9000 A.3: expected 0xa82f30ea + 1, truncated 0x9b32 over 16 bits.
        assert_eq!(decode(0xa82f_30eb, 0x9b32, 2), 0xa82f_9b32);
    }

    #[test]
    fn reconstruction_wraps_forward_and_backward() {
        // Truncated value far behind the window maps forward.
        assert_eq!(decode(0x1_0000, 0x02, 1), 0x1_0002);
        // Candidate above the window maps back.
        assert_eq!(decode(0x100, 0xff, 1), 0xff);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: truncation roundtrips for any consistent sender state.
            #[test]
            fn prop_roundtrip(largest in 0u64..1 << 48, gap in 1u64..1 << 14) {
                let pn = largest + gap;
                let (truncated, len) = truncate(pn, Some(largest));
                // The receiver has seen everything up to `largest`.
                prop_assert_eq!(decode(largest + 1, truncated, len), pn);
            }

            /// Property: first packets (nothing acked) roundtrip from zero state.
            #[test]
            fn prop_roundtrip_unacked(pn in 0u64..1 << 14) {
                let (truncated, len) = truncate(pn, None);
                prop_assert_eq!(decode(0, truncated, len), pn);
            }
        }
    }
}
