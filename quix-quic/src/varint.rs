//! Variable-length integer encoding (draft-12 Section 7.1).
//!
//! The top two bits of the first byte select the length class (1/2/4/8
//! bytes); the remaining 62 bits hold the value in network order. Encoders
//! emit the smallest sufficient class.

use bytes::{Buf, BufMut};

use crate::error::{Error, QuicError, Result};

/// Largest encodable value (2^62 - 1).
pub const MAX: u64 = (1u64 << 62) - 1;

/// Number of bytes the minimal encoding of `value` occupies.
pub fn size(value: u64) -> usize {
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

/// Encode `value` into `buf` using the minimal length class.
///
/// Returns the number of bytes written. Values above [`MAX`] are a
/// frame-encoding error.
pub fn write<B: BufMut>(value: u64, buf: &mut B) -> Result<usize> {
    if value > MAX {
        return Err(Error::Quic(QuicError::FrameEncodingError));
    }
    match size(value) {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(value as u16 | 0x4000),
        4 => buf.put_u32(value as u32 | 0x8000_0000),
        _ => buf.put_u64(value | 0xC000_0000_0000_0000),
    }
    Ok(size(value))
}

/// Decode one integer from the front of `buf`, advancing it.
pub fn read<B: Buf>(buf: &mut B) -> Result<u64> {
    if !buf.has_remaining() {
        return Err(Error::Quic(QuicError::FrameEncodingError));
    }
    let first = buf.chunk()[0];
    let len = 1usize << (first >> 6);
    if buf.remaining() < len {
        return Err(Error::Quic(QuicError::FrameEncodingError));
    }
    let value = match len {
        1 => (buf.get_u8() & 0x3F) as u64,
        2 => (buf.get_u16() & 0x3FFF) as u64,
        4 => (buf.get_u32() & 0x3FFF_FFFF) as u64,
        _ => buf.get_u64() & 0x3FFF_FFFF_FFFF_FFFF,
    };
    Ok(value)
}

/// Decode from a slice, returning `(value, bytes_consumed)`.
pub fn decode(buf: &[u8]) -> Option<(u64, usize)> {
    let mut cursor = buf;
    let before = cursor.len();
    match read(&mut cursor) {
        Ok(value) => Some((value, before - cursor.len())),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn roundtrip(value: u64) -> (u64, usize) {
        let mut buf = BytesMut::new();
        let written = write(value, &mut buf).unwrap();
        assert_eq!(written, buf.len());
        let (decoded, consumed) = decode(&buf).unwrap();
        assert_eq!(consumed, written);
        (decoded, written)
    }

    #[test]
    fn test_roundtrip_class_boundaries() {
        for value in [
            0u64,
            1,
            63,
            64,
            16383,
            16384,
            1_073_741_823,
            1_073_741_824,
            MAX,
        ] {
            let (decoded, _) = roundtrip(value);
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn test_minimal_length() {
        assert_eq!(roundtrip(0).1, 1);
        assert_eq!(roundtrip(63).1, 1);
        assert_eq!(roundtrip(64).1, 2);
        assert_eq!(roundtrip(16383).1, 2);
        assert_eq!(roundtrip(16384).1, 4);
        assert_eq!(roundtrip(1_073_741_823).1, 4);
        assert_eq!(roundtrip(1_073_741_824).1, 8);
        assert_eq!(roundtrip(MAX).1, 8);
    }

    #[test]
    fn test_known_encodings() {
        // Examples from the transport draft appendix.
        let mut buf = BytesMut::new();
        write(151_288_809_941_952_652, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0xC2, 0x19, 0x7C, 0x5E, 0xFF, 0x14, 0xE8, 0x8C]);

        let mut buf = BytesMut::new();
        write(494_878_333, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x9D, 0x7F, 0x3E, 0x7D]);

        let mut buf = BytesMut::new();
        write(15_293, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x7B, 0xBD]);

        let mut buf = BytesMut::new();
        write(37, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x25]);
    }

    #[test]
    fn test_value_too_large() {
        let mut buf = BytesMut::new();
        assert!(write(MAX + 1, &mut buf).is_err());
    }

    #[test]
    fn test_truncated_input() {
        assert!(decode(&[]).is_none());
        assert!(decode(&[0x40]).is_none());
        assert!(decode(&[0x80, 0x01]).is_none());
        assert!(decode(&[0xC0, 0x01, 0x02, 0x03]).is_none());
    }
}
