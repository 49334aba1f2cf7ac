//! Function prelude: the bit-packed signature, line-number table and cell list
//! that precede the instructions of every code object.

use bitflags::bitflags;

use crate::varint::{self, ByteReader, DecodeError};

bitflags! {
    /// Scope flags stored in the signature.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ScopeFlags: u8 {
        const VARARGS = 0x01;
        const VARKEYWORDS = 0x02;
        const GENERATOR = 0x04;
        const DEFKWARGS = 0x08;
    }
}

/// Terminator of the cell slot list.
pub const CELLS_END: u8 = 0xff;

/// Placeholder bytes reserved in the prelude for the name and filename qstrs.
pub const QSTR_PLACEHOLDER_LEN: usize = 4;

/// Upper bound on signature continuation bytes accepted by the decoder.
const MAX_SIGNATURE_BYTES: usize = 16;

/// Frame layout of a code object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Signature {
    /// Locals plus maximum operand-stack depth; always at least 1.
    pub n_state: u32,
    pub n_exc_stack: u32,
    pub scope_flags: ScopeFlags,
    /// Positional parameters, including closed-over cells passed in front.
    pub n_pos_args: u32,
    pub n_kwonly_args: u32,
    pub n_def_pos_args: u32,
}

impl Signature {
    /// Append the signature.
    ///
    /// The first byte holds `xSSSSEAA`; each continuation byte holds
    /// `xFSSKAED`, consuming the remaining high bits of every field until
    /// all of them are exhausted.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut s = u64::from(self.n_state.saturating_sub(1));
        let mut e = u64::from(self.n_exc_stack);
        let mut f = u64::from(self.scope_flags.bits());
        let mut a = u64::from(self.n_pos_args);
        let mut k = u64::from(self.n_kwonly_args);
        let mut d = u64::from(self.n_def_pos_args);

        let mut z = ((s & 0xf) << 3 | (e & 1) << 2 | (a & 3)) as u8;
        s >>= 4;
        e >>= 1;
        a >>= 2;
        while s | e | f | a | k | d != 0 {
            out.push(0x80 | z);
            z = ((f & 1) << 6 | (s & 3) << 4 | (k & 1) << 3 | (a & 1) << 2 | (e & 1) << 1 | (d & 1))
                as u8;
            s >>= 2;
            e >>= 1;
            f >>= 1;
            a >>= 1;
            k >>= 1;
            d >>= 1;
        }
        out.push(z);
    }

    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let mut z = reader.read_u8()?;
        let mut s = u64::from((z >> 3) & 0xf);
        let mut e = u64::from((z >> 2) & 1);
        let mut f: u64 = 0;
        let mut a = u64::from(z & 3);
        let mut k: u64 = 0;
        let mut d: u64 = 0;
        let mut n = 0u32;
        while z & 0x80 != 0 {
            if n as usize >= MAX_SIGNATURE_BYTES {
                return Err(DecodeError::Malformed("signature too long"));
            }
            z = reader.read_u8()?;
            let z64 = u64::from(z);
            s |= (z64 & 0x30) << (2 * n);
            e |= (z64 & 0x02) << n;
            f |= ((z64 & 0x40) >> 6) << n;
            a |= (z64 & 0x04) << n;
            k |= ((z64 & 0x08) >> 3) << n;
            d |= (z64 & 0x01) << n;
            n += 1;
        }
        let field = |value: u64| u32::try_from(value).map_err(|_| DecodeError::Overflow);
        let flags = u8::try_from(f)
            .ok()
            .and_then(ScopeFlags::from_bits)
            .ok_or(DecodeError::Malformed("unknown scope flags"))?;
        Ok(Self {
            n_state: field(s + 1)?,
            n_exc_stack: field(e)?,
            scope_flags: flags,
            n_pos_args: field(a)?,
            n_kwonly_args: field(k)?,
            n_def_pos_args: field(d)?,
        })
    }
}

/// Incremental writer of the line-number table.
///
/// Each entry advances a (bytecode offset, source line) pair. Only forward
/// line movement is recorded.
#[derive(Debug, Clone)]
pub struct LineInfoEncoder {
    out: Vec<u8>,
    last_offset: usize,
    last_line: u32,
}

impl Default for LineInfoEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl LineInfoEncoder {
    pub fn new() -> Self {
        Self {
            out: Vec::new(),
            last_offset: 0,
            last_line: 1,
        }
    }

    /// Record that the instruction at `offset` starts source line `line`.
    pub fn mark(&mut self, offset: usize, line: u32) {
        if line <= self.last_line {
            return;
        }
        let mut bytes = offset.saturating_sub(self.last_offset);
        let mut lines = (line - self.last_line) as usize;
        while bytes > 0 || lines > 0 {
            let (b, l);
            if lines <= 6 || bytes > 0xf {
                b = bytes.min(0x1f);
                l = if b < bytes { 0 } else { lines.min(0x3) };
                self.out.push((b | l << 5) as u8);
            } else {
                b = bytes.min(0xf);
                l = lines.min(0x7ff);
                self.out.push((0x80 | b | ((l >> 4) & 0x70)) as u8);
                self.out.push((l & 0xff) as u8);
            }
            bytes -= b;
            lines -= l;
        }
        self.last_offset = offset;
        self.last_line = line;
    }

    pub fn finish(self) -> Vec<u8> {
        self.out
    }
}

/// Expand a line-number table into `(offset, line)` pairs.
pub fn decode_line_info(info: &[u8]) -> Result<Vec<(usize, u32)>, DecodeError> {
    let mut reader = ByteReader::new(info);
    let mut offset = 0usize;
    let mut line = 1u32;
    let mut entries = Vec::new();
    while !reader.is_empty() {
        let c = reader.read_u8()?;
        let (b, l) = if c & 0x80 == 0 {
            (usize::from(c & 0x1f), u32::from(c >> 5))
        } else {
            let low = reader.read_u8()?;
            (usize::from(c & 0xf), (u32::from(c) << 4 & 0x700) | u32::from(low))
        };
        offset += b;
        line = line
            .checked_add(l)
            .ok_or(DecodeError::Malformed("line number overflow"))?;
        entries.push((offset, line));
    }
    Ok(entries)
}

/// Source line of the instruction at `target`, if the table covers it.
pub fn line_for_offset(info: &[u8], target: usize) -> Option<u32> {
    let entries = decode_line_info(info).ok()?;
    let mut line = 1;
    for (offset, l) in entries {
        if offset > target {
            break;
        }
        line = l;
    }
    Some(line)
}

/// Decoded prelude of a code object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prelude {
    pub signature: Signature,
    pub line_info: Vec<u8>,
    pub cells: Vec<u8>,
}

impl Prelude {
    /// Append the prelude: signature, self-inclusive info size, name and
    /// filename placeholders, line info, then the cell slots and terminator.
    pub fn encode(&self, out: &mut Vec<u8>) {
        self.signature.encode(out);
        let body = QSTR_PLACEHOLDER_LEN + self.line_info.len();
        varint::write_uint(out, info_size(body) as u64);
        out.extend_from_slice(&[0; QSTR_PLACEHOLDER_LEN]);
        out.extend_from_slice(&self.line_info);
        out.extend_from_slice(&self.cells);
        out.push(CELLS_END);
    }

    /// Size in bytes of the encoded prelude.
    pub fn encoded_len(&self) -> usize {
        let mut out = Vec::new();
        self.encode(&mut out);
        out.len()
    }

    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let signature = Signature::decode(reader)?;
        let size_start = reader.position();
        let size = usize::try_from(reader.read_uint()?).map_err(|_| DecodeError::Overflow)?;
        let size_len = reader.position() - size_start;
        let rest = size
            .checked_sub(size_len + QSTR_PLACEHOLDER_LEN)
            .ok_or(DecodeError::Malformed("info size smaller than its header"))?;
        reader.read_bytes(QSTR_PLACEHOLDER_LEN)?;
        let line_info = reader.read_bytes(rest)?.to_vec();
        let mut cells = Vec::new();
        loop {
            let slot = reader.read_u8()?;
            if slot == CELLS_END {
                break;
            }
            cells.push(slot);
        }
        Ok(Self {
            signature,
            line_info,
            cells,
        })
    }
}

/// Total info size for a body of `body` bytes, counting the size field itself.
fn info_size(body: usize) -> usize {
    let mut total = body + 1;
    loop {
        let next = body + varint::uint_len(total as u64);
        if next == total {
            return total;
        }
        total = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig_bytes(sig: &Signature) -> Vec<u8> {
        let mut out = Vec::new();
        sig.encode(&mut out);
        out
    }

    #[test]
    fn test_small_signature_is_one_byte() {
        let sig = Signature {
            n_state: 3,
            n_pos_args: 1,
            ..Default::default()
        };
        let bytes = sig_bytes(&sig);
        assert_eq!(bytes, vec![(2 << 3) | 1]);
        assert_eq!(Signature::decode(&mut ByteReader::new(&bytes)), Ok(sig));
    }

    #[test]
    fn test_wide_signature_round_trip() {
        let sig = Signature {
            n_state: 300,
            n_exc_stack: 5,
            scope_flags: ScopeFlags::GENERATOR | ScopeFlags::VARKEYWORDS,
            n_pos_args: 17,
            n_kwonly_args: 4,
            n_def_pos_args: 9,
        };
        let bytes = sig_bytes(&sig);
        assert!(bytes.len() > 1);
        assert!(bytes[..bytes.len() - 1].iter().all(|b| b & 0x80 != 0));
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(Signature::decode(&mut reader), Ok(sig));
        assert!(reader.is_empty());
    }

    #[test]
    fn test_signature_rejects_unknown_flags() {
        // The fifth continuation byte lands its flag on bit 4.
        let bytes = [0x80, 0x80, 0x80, 0x80, 0x80, 0x40];
        let err = Signature::decode(&mut ByteReader::new(&bytes)).unwrap_err();
        assert_eq!(err, DecodeError::Malformed("unknown scope flags"));
        let truncated = [0x80];
        assert_eq!(
            Signature::decode(&mut ByteReader::new(&truncated)),
            Err(DecodeError::Truncated)
        );
    }

    #[test]
    fn test_line_info_short_and_long_forms() {
        let mut enc = LineInfoEncoder::new();
        enc.mark(0, 1);
        enc.mark(4, 2);
        enc.mark(10, 12);
        enc.mark(8, 12);
        let info = enc.finish();
        assert_eq!(info, vec![4 | 1 << 5, 0x80 | 6, 10]);
        assert_eq!(decode_line_info(&info), Ok(vec![(4, 2), (10, 12)]));
        assert_eq!(line_for_offset(&info, 0), Some(1));
        assert_eq!(line_for_offset(&info, 5), Some(2));
        assert_eq!(line_for_offset(&info, 11), Some(12));
    }

    #[test]
    fn test_line_info_large_byte_skip() {
        let mut enc = LineInfoEncoder::new();
        enc.mark(40, 3);
        let info = enc.finish();
        assert_eq!(info, vec![0x1f, 9 | 2 << 5]);
        assert_eq!(decode_line_info(&info), Ok(vec![(31, 1), (40, 3)]));
    }

    #[test]
    fn test_prelude_round_trip() {
        let prelude = Prelude {
            signature: Signature {
                n_state: 4,
                n_pos_args: 2,
                ..Default::default()
            },
            line_info: vec![3 | 1 << 5],
            cells: vec![0, 3],
        };
        let mut out = Vec::new();
        prelude.encode(&mut out);
        assert_eq!(out.len(), prelude.encoded_len());
        assert_eq!(*out.last().unwrap(), CELLS_END);
        let mut reader = ByteReader::new(&out);
        assert_eq!(Prelude::decode(&mut reader), Ok(prelude));
        assert!(reader.is_empty());
    }

    #[test]
    fn test_info_size_counts_itself() {
        assert_eq!(info_size(4), 5);
        assert_eq!(info_size(126), 127);
        assert_eq!(info_size(127), 129);
    }
}
