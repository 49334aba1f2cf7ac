//! Variable-length integer encoding used throughout the mpy format.
//!
//! Values are stored big-endian in 7-bit groups; every byte except the last
//! has its high bit set. Signed values carry their sign in bit 0x40 of the
//! first byte.

use thiserror::Error;

/// Errors raised while reading encoded bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    Truncated,
    #[error("encoded integer does not fit in 64 bits")]
    Overflow,
    #[error("malformed encoding: {0}")]
    Malformed(&'static str),
}

/// Longest varint a 64-bit value can need.
const MAX_VARINT_BYTES: usize = 10;

/// Append `value` as an unsigned varint.
pub fn write_uint(out: &mut Vec<u8>, value: u64) {
    let mut buf = [0u8; MAX_VARINT_BYTES];
    let mut start = buf.len();
    let mut v = value;
    loop {
        start -= 1;
        buf[start] = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    let last = buf.len() - 1;
    for (i, byte) in buf.iter().enumerate().skip(start) {
        out.push(if i == last { *byte } else { *byte | 0x80 });
    }
}

/// Number of bytes `write_uint` produces for `value`.
pub fn uint_len(value: u64) -> usize {
    let mut len = 1;
    let mut v = value >> 7;
    while v != 0 {
        len += 1;
        v >>= 7;
    }
    len
}

/// Append `value` as a signed varint.
pub fn write_int(out: &mut Vec<u8>, value: i64) {
    let mut buf = [0u8; MAX_VARINT_BYTES + 1];
    let mut start = buf.len();
    let mut v = value;
    loop {
        start -= 1;
        buf[start] = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 || v == -1 {
            break;
        }
    }
    // The top stored bit must agree with the sign.
    if v == -1 && buf[start] & 0x40 == 0 {
        start -= 1;
        buf[start] = 0x7f;
    } else if v == 0 && buf[start] & 0x40 != 0 {
        start -= 1;
        buf[start] = 0;
    }
    let last = buf.len() - 1;
    for (i, byte) in buf.iter().enumerate().skip(start) {
        out.push(if i == last { *byte } else { *byte | 0x80 });
    }
}

/// Cursor over an encoded byte slice.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Current offset into the underlying slice.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.bytes.get(self.pos).ok_or(DecodeError::Truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).ok_or(DecodeError::Truncated)?;
        let slice = self.bytes.get(self.pos..end).ok_or(DecodeError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_uint(&mut self) -> Result<u64, DecodeError> {
        let mut value: u64 = 0;
        loop {
            let byte = self.read_u8()?;
            if value >> 57 != 0 {
                return Err(DecodeError::Overflow);
            }
            value = (value << 7) | u64::from(byte & 0x7f);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
    }

    pub fn read_int(&mut self) -> Result<i64, DecodeError> {
        let first = *self.bytes.get(self.pos).ok_or(DecodeError::Truncated)?;
        let mut value: i64 = if first & 0x40 != 0 { -1 } else { 0 };
        loop {
            let byte = self.read_u8()?;
            let top = value >> 56;
            if top != 0 && top != -1 {
                return Err(DecodeError::Overflow);
            }
            value = (value << 7) | i64::from(byte & 0x7f);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uint(value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        write_uint(&mut out, value);
        out
    }

    fn int(value: i64) -> Vec<u8> {
        let mut out = Vec::new();
        write_int(&mut out, value);
        out
    }

    #[test]
    fn test_uint_encoding() {
        assert_eq!(uint(0), vec![0x00]);
        assert_eq!(uint(0x7f), vec![0x7f]);
        assert_eq!(uint(0x80), vec![0x81, 0x00]);
        assert_eq!(uint(300), vec![0x82, 0x2c]);
        assert_eq!(uint_len(300), 2);
        assert_eq!(uint_len(u64::MAX), 10);
    }

    #[test]
    fn test_int_encoding() {
        assert_eq!(int(0), vec![0x00]);
        assert_eq!(int(63), vec![0x3f]);
        assert_eq!(int(64), vec![0x80, 0x40]);
        assert_eq!(int(-1), vec![0x7f]);
        assert_eq!(int(-64), vec![0x40]);
        assert_eq!(int(-65), vec![0xff, 0x3f]);
    }

    #[test]
    fn test_reader_round_trip() {
        let mut out = Vec::new();
        write_uint(&mut out, 123_456);
        write_int(&mut out, -123_456);
        write_int(&mut out, i64::MIN);
        write_int(&mut out, i64::MAX);
        let mut reader = ByteReader::new(&out);
        assert_eq!(reader.read_uint(), Ok(123_456));
        assert_eq!(reader.read_int(), Ok(-123_456));
        assert_eq!(reader.read_int(), Ok(i64::MIN));
        assert_eq!(reader.read_int(), Ok(i64::MAX));
        assert!(reader.is_empty());
    }

    #[test]
    fn test_truncated_and_overflow() {
        assert_eq!(ByteReader::new(&[0x81]).read_uint(), Err(DecodeError::Truncated));
        assert_eq!(ByteReader::new(&[]).read_int(), Err(DecodeError::Truncated));
        let too_long = [0xff; 12];
        assert_eq!(ByteReader::new(&too_long).read_uint(), Err(DecodeError::Overflow));
        assert_eq!(ByteReader::new(&[1, 2]).read_bytes(3), Err(DecodeError::Truncated));
    }
}
