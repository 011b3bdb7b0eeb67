use bytes::{Buf, BufMut};

use crate::MAX_VAR_INT;

/// A decode ran off the end of its input
#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
#[fail(display = "unexpected end of buffer")]
pub struct UnexpectedEnd;

pub type Result<T> = ::std::result::Result<T, UnexpectedEnd>;

pub trait Codec: Sized {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
    fn encode<B: BufMut>(&self, buf: &mut B);
}

impl Codec for u8 {
    fn decode<B: Buf>(buf: &mut B) -> Result<u8> {
        if buf.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u8())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self);
    }
}

impl Codec for u16 {
    fn decode<B: Buf>(buf: &mut B) -> Result<u16> {
        if buf.remaining() < 2 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u16())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(*self);
    }
}

impl Codec for u32 {
    fn decode<B: Buf>(buf: &mut B) -> Result<u32> {
        if buf.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u32())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(*self);
    }
}

impl Codec for u64 {
    fn decode<B: Buf>(buf: &mut B) -> Result<u64> {
        if buf.remaining() < 8 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u64())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(*self);
    }
}

/// Decode a variable-length integer
///
/// The top two bits of the first byte select a 1, 2, 4, or 8 byte encoding; the remaining bits
/// are the big-endian value.
pub fn read_var<B: Buf>(buf: &mut B) -> Result<u64> {
    if buf.remaining() < 1 {
        return Err(UnexpectedEnd);
    }
    let first = buf.get_u8();
    let len = 1usize << (first >> 6);
    let mut x = u64::from(first & 0x3f);
    if buf.remaining() < len - 1 {
        return Err(UnexpectedEnd);
    }
    for _ in 1..len {
        x = x << 8 | u64::from(buf.get_u8());
    }
    Ok(x)
}

/// Encode a variable-length integer in its smallest form
///
/// # Panics
/// - if `x` exceeds 2^62 - 1
pub fn write_var<B: BufMut>(buf: &mut B, x: u64) {
    if x < 1 << 6 {
        buf.put_u8(x as u8);
    } else if x < 1 << 14 {
        buf.put_u16(0x4000 | x as u16);
    } else if x < 1 << 30 {
        buf.put_u32(0x8000_0000 | x as u32);
    } else {
        assert!(x <= MAX_VAR_INT, "varint out of range");
        buf.put_u64(0xc000_0000_0000_0000 | x);
    }
}

/// Number of bytes `write_var` will use for `x`
pub fn var_len(x: u64) -> usize {
    if x < 1 << 6 {
        1
    } else if x < 1 << 14 {
        2
    } else if x < 1 << 30 {
        4
    } else {
        8
    }
}

pub trait BufExt {
    fn get<T: Codec>(&mut self) -> Result<T>;
    fn get_var(&mut self) -> Result<u64>;
}

impl<B: Buf> BufExt for B {
    fn get<T: Codec>(&mut self) -> Result<T> {
        T::decode(self)
    }
    fn get_var(&mut self) -> Result<u64> {
        read_var(self)
    }
}

pub trait BufMutExt {
    fn write<T: Codec>(&mut self, x: T);
    fn write_var(&mut self, x: u64);
}

impl<B: BufMut> BufMutExt for B {
    fn write<T: Codec>(&mut self, x: T) {
        x.encode(self);
    }
    fn write_var(&mut self, x: u64) {
        write_var(self, x);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(x: u64) {
        let mut buf = Vec::new();
        write_var(&mut buf, x);
        assert_eq!(buf.len(), var_len(x));
        let mut r = Cursor::new(&buf);
        assert_eq!(read_var(&mut r).unwrap(), x);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn varint_roundtrip() {
        for &x in &[
            0,
            1,
            63,
            64,
            16_383,
            16_384,
            1_073_741_823,
            1_073_741_824,
            151_288_809_941_952_652, // RFC 9000 §A.1 8-byte example
            MAX_VAR_INT,
        ] {
            roundtrip(x);
        }
    }

    #[test]
    fn varint_examples() {
        // RFC 9000 §A.1 sample encodings
        let mut r = Cursor::new(&[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c][..]);
        assert_eq!(read_var(&mut r).unwrap(), 151_288_809_941_952_652);
        let mut r = Cursor::new(&[0x9d, 0x7f, 0x3e, 0x7d][..]);
        assert_eq!(read_var(&mut r).unwrap(), 494_878_333);
        let mut r = Cursor::new(&[0x7b, 0xbd][..]);
        assert_eq!(read_var(&mut r).unwrap(), 15_293);
        let mut r = Cursor::new(&[0x25][..]);
        assert_eq!(read_var(&mut r).unwrap(), 37);
    }

    #[test]
    fn varint_truncated() {
        let mut r = Cursor::new(&[0x40][..]);
        assert_eq!(read_var(&mut r), Err(UnexpectedEnd));
        let mut r = Cursor::new(&[0xc0, 0, 0][..]);
        assert_eq!(read_var(&mut r), Err(UnexpectedEnd));
        let mut r = Cursor::new(&[][..]);
        assert_eq!(read_var(&mut r), Err(UnexpectedEnd));
    }

    #[test]
    #[should_panic]
    fn varint_overflow() {
        let mut buf = Vec::new();
        write_var(&mut buf, MAX_VAR_INT + 1);
    }
}
