//! Variable-length integer coding.
//!
//! The top two bits of the first byte select the width: 00 = 1 byte,
//! 01 = 2 bytes, 10 = 4 bytes, 11 = 8 bytes. Values are limited to 62 bits.

use bytes::{Buf, BufMut};

/// Largest encodable value (2^62 - 1).
pub const VARINT_MAX: u64 = (1u64 << 62) - 1;

/// Decode a varint, consuming it from `buf`. Returns `None` on a short
/// buffer.
pub fn decode<B: Buf>(buf: &mut B) -> Option<u64> {
    if !buf.has_remaining() {
        return None;
    }
    let first = buf.chunk()[0];
    let len = 1usize << (first >> 6);
    if buf.remaining() < len {
        return None;
    }
    let val = match len {
        1 => u64::from(buf.get_u8()),
        2 => u64::from(buf.get_u16() & 0x3fff),
        4 => u64::from(buf.get_u32() & 0x3fff_ffff),
        8 => buf.get_u64() & 0x3fff_ffff_ffff_ffff,
        _ => unreachable!(),
    };
    Some(val)
}

/// Encode `val` in the shortest form. Callers must ensure
/// `val <= VARINT_MAX`; higher bits would collide with the length tag.
pub fn encode<B: BufMut>(val: u64, buf: &mut B) {
    debug_assert!(val <= VARINT_MAX);
    if val < 1 << 6 {
        buf.put_u8(val as u8);
    } else if val < 1 << 14 {
        buf.put_u16(val as u16 | 0x4000);
    } else if val < 1 << 30 {
        buf.put_u32(val as u32 | 0x8000_0000);
    } else {
        buf.put_u64(val | 0xc000_0000_0000_0000);
    }
}

/// Encode `val` in exactly `len` bytes (2, 4 or 8), even if a shorter form
/// exists. Used for length fields written before their value is known.
pub fn encode_fixed<B: BufMut>(val: u64, len: usize, buf: &mut B) {
    match len {
        2 => {
            debug_assert!(val < 1 << 14);
            buf.put_u16(val as u16 | 0x4000);
        }
        4 => {
            debug_assert!(val < 1 << 30);
            buf.put_u32(val as u32 | 0x8000_0000);
        }
        8 => {
            debug_assert!(val <= VARINT_MAX);
            buf.put_u64(val | 0xc000_0000_0000_0000);
        }
        _ => panic!("invalid fixed varint length {len}"),
    }
}

/// Encoded size of `val` in bytes: 1, 2, 4 or 8.
pub fn size(val: u64) -> usize {
    if val < 1 << 6 {
        1
    } else if val < 1 << 14 {
        2
    } else if val < 1 << 30 {
        4
    } else {
        8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// decode(encode(x)) == x with size(encode(x)) in {1, 2, 4, 8}.
    #[test]
    fn round_trip_at_width_boundaries() {
        for &(val, want_len) in &[
            (0u64, 1usize),
            (63, 1),
            (64, 2),
            (16383, 2),
            (16384, 4),
            ((1 << 30) - 1, 4),
            (1 << 30, 8),
            (VARINT_MAX, 8),
        ] {
            let mut buf = Vec::new();
            encode(val, &mut buf);
            assert_eq!(buf.len(), want_len, "width for {val}");
            let mut rd = &buf[..];
            assert_eq!(decode(&mut rd), Some(val));
            assert!(rd.is_empty());
            assert_eq!(size(val), want_len);
        }
    }

    #[test]
    fn short_buffer_returns_none() {
        let mut buf = Vec::new();
        encode(VARINT_MAX, &mut buf);
        for cut in 0..buf.len() {
            let mut rd = &buf[..cut];
            assert_eq!(decode(&mut rd), None);
        }
    }

    #[test]
    fn fixed_width_decodes_like_shortest() {
        let mut buf = Vec::new();
        encode_fixed(17, 2, &mut buf);
        assert_eq!(buf.len(), 2);
        let mut rd = &buf[..];
        assert_eq!(decode(&mut rd), Some(17));
    }

    /// Known wire vectors.
    #[test]
    fn wire_vectors() {
        let mut rd = &[0x25u8][..];
        assert_eq!(decode(&mut rd), Some(37));
        let mut rd = &[0x7b, 0xbd][..];
        assert_eq!(decode(&mut rd), Some(15293));
        let mut rd = &[0x9d, 0x7f, 0x3e, 0x7d][..];
        assert_eq!(decode(&mut rd), Some(494_878_333));
        let mut rd = &[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c][..];
        assert_eq!(decode(&mut rd), Some(151_288_809_941_952_652));
    }
}
