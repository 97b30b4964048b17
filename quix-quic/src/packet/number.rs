//! Packet number truncation and recovery (draft-12 Section 4.8).
//!
//! Packet numbers are 62-bit counters, truncated on the wire to 1, 2 or 4
//! bytes. The decoder reconstructs the full value relative to the largest
//! number previously seen in the same space.

use crate::error::{Error, QuicError, Result};

/// Truncated packet-number width on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PnWidth {
    One = 1,
    Two = 2,
    Four = 4,
}

impl PnWidth {
    /// Width from the short-header type bits (0x0/0x1/0x2).
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(PnWidth::One),
            0x1 => Some(PnWidth::Two),
            0x2 => Some(PnWidth::Four),
            _ => None,
        }
    }

    /// Short-header type bits for this width.
    pub fn to_bits(self) -> u8 {
        match self {
            PnWidth::One => 0x0,
            PnWidth::Two => 0x1,
            PnWidth::Four => 0x2,
        }
    }

    pub fn len(self) -> usize {
        self as usize
    }

    /// Wire mask for this width.
    fn mask(self) -> u64 {
        match self {
            PnWidth::One => 0xFF,
            PnWidth::Two => 0xFFFF,
            PnWidth::Four => 0xFFFF_FFFF,
        }
    }
}

/// Truncate `pn` to `width` bytes.
pub fn truncate(pn: u64, width: PnWidth) -> u64 {
    pn & width.mask()
}

/// Smallest width that lets the peer recover `pn` given it has acked
/// `largest_acked`.
pub fn minimal_width(pn: u64, largest_acked: Option<u64>) -> PnWidth {
    let reference = largest_acked.map(|l| l + 1).unwrap_or(0);
    let distance = pn.saturating_sub(reference).max(reference.saturating_sub(pn));
    if distance < 1 << 7 {
        PnWidth::One
    } else if distance < 1 << 15 {
        PnWidth::Two
    } else {
        PnWidth::Four
    }
}

/// Recover a full packet number from its truncated form.
///
/// Given `largest` (the largest number seen in the space), the candidate is
/// `(largest + 1)` with its low bits replaced by the truncated value,
/// adjusted by one window so it lands in
/// `(largest + 1 - 2^(w-1), largest + 1 + 2^(w-1)]`.
pub fn recover(truncated: u64, largest: Option<u64>, width: PnWidth) -> u64 {
    let largest = match largest {
        Some(l) => l,
        None => return truncated,
    };
    let expected = largest + 1;
    let win = width.mask() + 1;
    let half = win / 2;
    let candidate = (expected & !width.mask()) | truncated;

    if candidate + half <= expected && candidate + win < (1u64 << 62) {
        candidate + win
    } else if candidate > expected + half && candidate >= win {
        candidate - win
    } else {
        candidate
    }
}

/// Parse `width` big-endian bytes into the truncated value.
pub fn parse(bytes: &[u8], width: PnWidth) -> Result<u64> {
    if bytes.len() < width.len() {
        return Err(Error::Quic(QuicError::FrameEncodingError));
    }
    let mut value = 0u64;
    for byte in &bytes[..width.len()] {
        value = (value << 8) | *byte as u64;
    }
    Ok(value)
}

/// Write the truncation of `pn` as `width` big-endian bytes.
pub fn encode(pn: u64, width: PnWidth, out: &mut Vec<u8>) {
    let truncated = truncate(pn, width);
    for shift in (0..width.len()).rev() {
        out.push((truncated >> (shift * 8)) as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recover_sequential() {
        assert_eq!(recover(1, Some(0), PnWidth::One), 1);
        assert_eq!(recover(2, Some(1), PnWidth::One), 2);
        assert_eq!(recover(3, Some(2), PnWidth::One), 3);
    }

    #[test]
    fn test_recover_without_reference() {
        assert_eq!(recover(0, None, PnWidth::Four), 0);
        assert_eq!(recover(0x42, None, PnWidth::One), 0x42);
    }

    #[test]
    fn test_recover_wraps_forward() {
        assert_eq!(recover(0, Some(255), PnWidth::One), 256);
        assert_eq!(recover(0, Some(0xFFFF), PnWidth::Two), 0x1_0000);
    }

    #[test]
    fn test_recover_draft_example() {
        // largest = 0xa82f30ea, truncated 0x9b32 at two bytes.
        assert_eq!(recover(0x9b32, Some(0xa82f_30ea), PnWidth::Two), 0xa82f_9b32);
    }

    #[test]
    fn test_truncate_encode_parse() {
        let mut out = Vec::new();
        encode(0xa82f_9b32, PnWidth::Two, &mut out);
        assert_eq!(out, vec![0x9b, 0x32]);
        assert_eq!(parse(&out, PnWidth::Two).unwrap(), 0x9b32);
    }

    #[test]
    fn test_roundtrip_within_window() {
        for width in [PnWidth::One, PnWidth::Two, PnWidth::Four] {
            let half = ((width.mask() + 1) / 2) as i64;
            let largest: u64 = 1 << 20;
            for delta in [1i64, 2, half - 1, half] {
                let next = (largest as i64 + delta) as u64;
                let mut out = Vec::new();
                encode(next, width, &mut out);
                let truncated = parse(&out, width).unwrap();
                assert_eq!(recover(truncated, Some(largest), width), next);
            }
        }
    }

    #[test]
    fn test_minimal_width_growth() {
        assert_eq!(minimal_width(10, Some(5)), PnWidth::One);
        assert_eq!(minimal_width(300, Some(5)), PnWidth::Two);
        assert_eq!(minimal_width(1 << 20, Some(5)), PnWidth::Four);
        assert_eq!(minimal_width(0, None), PnWidth::One);
    }

    #[test]
    fn test_parse_short_buffer() {
        assert!(parse(&[0x01], PnWidth::Two).is_err());
    }
}
