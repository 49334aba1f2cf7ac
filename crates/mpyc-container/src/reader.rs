//! Deserialization of `.mpy` files back into code object trees.
//!
//! Qstr operands are replaced by 2-byte indices into the decoded object's
//! `names`, numbered in order of appearance, which is exactly what the
//! compiler produces in memory.

use std::io::Read;

use mpyc_bytecode::opcode::LOAD_CONST_SMALL_INT_MULTI;
use mpyc_bytecode::{ByteReader, CodeObject, Constant, Op, OperandFormat, Prelude};
use tracing::{debug, info};

use crate::error::ContainerError;
use crate::header::ContainerOptions;
use crate::window::QstrWindow;
use crate::{CODE_KIND_BYTECODE, STATIC_QSTR_EMPTY};

/// Deepest nesting of code records accepted.
const MAX_NESTING: usize = 64;

/// A decoded `.mpy` file.
#[derive(Debug, Clone, PartialEq)]
pub struct MpyFile {
    pub options: ContainerOptions,
    pub code: CodeObject,
}

/// Decoder over an in-memory `.mpy` image.
pub struct MpyReader<'a> {
    reader: ByteReader<'a>,
    options: ContainerOptions,
    window: QstrWindow,
}

impl<'a> MpyReader<'a> {
    /// Read the header; the records follow with [`MpyReader::read_root`].
    pub fn new(bytes: &'a [u8]) -> Result<Self, ContainerError> {
        let mut reader = ByteReader::new(bytes);
        let options = ContainerOptions::decode(&mut reader)?;
        info!(
            features = options.features.bits(),
            small_int_bits = options.small_int_bits,
            window_size = options.window_size,
            "read header"
        );
        Ok(Self {
            reader,
            options,
            window: QstrWindow::new(options.window_size),
        })
    }

    pub fn options(&self) -> &ContainerOptions {
        &self.options
    }

    /// Read the root record and check nothing follows it.
    pub fn read_root(mut self) -> Result<MpyFile, ContainerError> {
        let code = self.read_code(0)?;
        if !self.reader.is_empty() {
            return Err(ContainerError::Corrupt(format!(
                "{} trailing bytes after root code object",
                self.reader.remaining()
            )));
        }
        Ok(MpyFile {
            options: self.options,
            code,
        })
    }

    fn read_count(&mut self, what: &'static str) -> Result<usize, ContainerError> {
        let value = self.reader.read_uint().map_err(ContainerError::reading(what))?;
        usize::try_from(value).map_err(|_| ContainerError::Corrupt(format!("{} {}", what, value)))
    }

    fn read_qstr(&mut self) -> Result<String, ContainerError> {
        let tag = self.read_count("qstr")?;
        if tag == 0 {
            let index = self.reader.read_u8().map_err(ContainerError::reading("qstr"))?;
            return match index {
                STATIC_QSTR_EMPTY => Ok(String::new()),
                other => Err(ContainerError::Corrupt(format!(
                    "reference to static qstr {}",
                    other
                ))),
            };
        }
        if tag & 1 == 1 {
            let index = tag >> 1;
            return self.window.access(index).map(str::to_string).ok_or_else(|| {
                ContainerError::Corrupt(format!("qstr window index {} out of range", index))
            });
        }
        let bytes = self
            .reader
            .read_bytes(tag >> 1)
            .map_err(ContainerError::reading("qstr"))?;
        let value = std::str::from_utf8(bytes)
            .map_err(|_| ContainerError::Corrupt("qstr is not valid UTF-8".to_string()))?
            .to_string();
        self.window.push(&value);
        Ok(value)
    }

    /// Read `len` in-memory instruction bytes, resolving qstr operands.
    fn read_instructions(&mut self, len: usize) -> Result<(Vec<u8>, Vec<String>), ContainerError> {
        let what = "instructions";
        let cache_lookups = self.options.cache_lookups();
        let mut code = Vec::new();
        let mut names = Vec::new();
        while code.len() < len {
            let byte = self.reader.read_u8().map_err(ContainerError::reading(what))?;
            code.push(byte);
            let op = Op::from_u8(byte);
            if op.is_none() && byte < LOAD_CONST_SMALL_INT_MULTI {
                return Err(ContainerError::Corrupt(format!("unknown opcode {:#04x}", byte)));
            }
            match OperandFormat::of(byte) {
                OperandFormat::Byte => {}
                OperandFormat::Qstr => {
                    let name = self.read_qstr()?;
                    let index = u16::try_from(names.len()).map_err(|_| {
                        ContainerError::Corrupt("too many qstr operands".to_string())
                    })?;
                    code.extend_from_slice(&index.to_le_bytes());
                    names.push(name);
                }
                OperandFormat::VarUint => loop {
                    let b = self.reader.read_u8().map_err(ContainerError::reading(what))?;
                    code.push(b);
                    if b & 0x80 == 0 {
                        break;
                    }
                },
                OperandFormat::Offset => {
                    let bytes = self.reader.read_bytes(2).map_err(ContainerError::reading(what))?;
                    code.extend_from_slice(bytes);
                }
            }
            if op.is_some_and(|op| op.has_extra_byte(cache_lookups)) {
                let extra = self.reader.read_u8().map_err(ContainerError::reading(what))?;
                code.push(extra);
            }
        }
        if code.len() != len {
            return Err(ContainerError::Corrupt(
                "instruction overruns its record".to_string(),
            ));
        }
        Ok((code, names))
    }

    fn read_constant(&mut self) -> Result<Constant, ContainerError> {
        let tag = self
            .reader
            .read_u8()
            .map_err(ContainerError::reading("constant"))?;
        if tag == b'e' {
            return Ok(Constant::Ellipsis);
        }
        let len = self.read_count("constant")?;
        let payload = self
            .reader
            .read_bytes(len)
            .map_err(ContainerError::reading("constant"))?;
        if tag == b'b' {
            return Ok(Constant::Bytes(payload.to_vec()));
        }
        let text = std::str::from_utf8(payload)
            .map_err(|_| ContainerError::Corrupt("constant is not valid UTF-8".to_string()))?;
        let invalid = || ContainerError::Corrupt(format!("invalid '{}' constant {:?}", tag as char, text));
        match tag {
            b's' => Ok(Constant::Str(text.to_string())),
            b'i' => text.parse().map(Constant::Int).map_err(|_| invalid()),
            b'f' => text.parse().map(Constant::Float).map_err(|_| invalid()),
            b'c' => parse_complex(text)
                .map(|(real, imag)| Constant::Complex { real, imag })
                .ok_or_else(invalid),
            other => Err(ContainerError::Corrupt(format!(
                "unknown constant tag {:#04x}",
                other
            ))),
        }
    }

    fn read_code(&mut self, depth: usize) -> Result<CodeObject, ContainerError> {
        if depth > MAX_NESTING {
            return Err(ContainerError::Corrupt("code objects nested too deeply".to_string()));
        }
        let kind_len = self.read_count("code record length")?;
        let kind = (kind_len & 3) as u8;
        if kind != CODE_KIND_BYTECODE {
            return Err(ContainerError::UnsupportedKind { kind });
        }
        let bc_len = kind_len >> 2;

        let start = self.reader.position();
        let prelude = Prelude::decode(&mut self.reader).map_err(ContainerError::reading("prelude"))?;
        let prelude_len = self.reader.position() - start;
        let code_len = bc_len.checked_sub(prelude_len).ok_or_else(|| {
            ContainerError::Corrupt("record shorter than its prelude".to_string())
        })?;
        let (code, names) = self.read_instructions(code_len)?;

        let name = self.read_qstr()?;
        let filename = self.read_qstr()?;
        let n_obj = self.read_count("constant count")?;
        let n_raw_code = self.read_count("code object count")?;
        debug!(name = %name, bc_len, n_obj, n_raw_code, "read code record");

        let sig = prelude.signature;
        let argnames = (0..sig.n_pos_args + sig.n_kwonly_args)
            .map(|_| self.read_qstr())
            .collect::<Result<Vec<_>, _>>()?;
        let consts = (0..n_obj)
            .map(|_| self.read_constant())
            .collect::<Result<Vec<_>, _>>()?;
        let children = (0..n_raw_code)
            .map(|_| self.read_code(depth + 1))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CodeObject {
            name,
            filename,
            code,
            names,
            argnames,
            consts,
            children,
            line_info: prelude.line_info,
            signature: sig,
            cells: prelude.cells,
        })
    }
}

/// Parse `2.0j` or `(1.0+2.0j)`.
fn parse_complex(text: &str) -> Option<(f64, f64)> {
    let inner = text
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .unwrap_or(text);
    let body = inner.strip_suffix('j')?;
    let bytes = body.as_bytes();
    let split = (1..bytes.len())
        .rev()
        .find(|&i| matches!(bytes[i], b'+' | b'-') && !matches!(bytes[i - 1], b'e' | b'E'));
    match split {
        Some(i) => Some((body[..i].parse().ok()?, body[i..].parse().ok()?)),
        None => Some((0.0, body.parse().ok()?)),
    }
}

/// Decode a complete in-memory `.mpy` image.
pub fn read_mpy(bytes: &[u8]) -> Result<MpyFile, ContainerError> {
    MpyReader::new(bytes)?.read_root()
}

/// Read and decode a complete `.mpy` file from `input`.
pub fn load_mpy<R: Read>(input: &mut R) -> Result<MpyFile, ContainerError> {
    let mut bytes = Vec::new();
    input.read_to_end(&mut bytes)?;
    read_mpy(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complex_forms() {
        assert_eq!(parse_complex("2.5j"), Some((0.0, 2.5)));
        assert_eq!(parse_complex("(1.0-2.0j)"), Some((1.0, -2.0)));
        assert_eq!(parse_complex("(1e-07+3e+20j)"), Some((1e-7, 3e20)));
        assert_eq!(parse_complex("-0.0j"), Some((0.0, -0.0)));
        assert_eq!(parse_complex("2.5"), None);
    }
}
