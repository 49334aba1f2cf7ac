//! Serialization of code object trees.

use std::io::Write;

use mpyc_bytecode::varint::write_uint;
use mpyc_bytecode::{CodeObject, Constant, Operand, decode_instructions, format_complex, format_float};
use tracing::{debug, info};

use crate::error::ContainerError;
use crate::header::ContainerOptions;
use crate::window::QstrWindow;
use crate::{CODE_KIND_BYTECODE, STATIC_QSTR_EMPTY};

/// Encoder for one `.mpy` file.
///
/// Holds the qstr window, so a writer is used for exactly one file.
#[derive(Debug)]
pub struct MpyWriter {
    options: ContainerOptions,
    window: QstrWindow,
}

impl MpyWriter {
    pub fn new(options: ContainerOptions) -> Self {
        Self {
            options,
            window: QstrWindow::new(options.window_size),
        }
    }

    /// Encode the header followed by the record tree rooted at `code`.
    pub fn encode(mut self, code: &CodeObject) -> Result<Vec<u8>, ContainerError> {
        let mut out = Vec::new();
        self.options.encode(&mut out);
        info!(
            features = self.options.features.bits(),
            small_int_bits = self.options.small_int_bits,
            window_size = self.options.window_size,
            "wrote header"
        );
        self.write_code(&mut out, code)?;
        Ok(out)
    }

    fn write_qstr(&mut self, out: &mut Vec<u8>, value: &str) {
        if value.is_empty() {
            out.extend_from_slice(&[0, STATIC_QSTR_EMPTY]);
            return;
        }
        if let Some(index) = self.window.position(value) {
            write_uint(out, ((index as u64) << 1) | 1);
            self.window.access(index);
            return;
        }
        write_uint(out, (value.len() as u64) << 1);
        out.extend_from_slice(value.as_bytes());
        self.window.push(value);
    }

    fn write_code(&mut self, out: &mut Vec<u8>, code: &CodeObject) -> Result<(), ContainerError> {
        let mut body = Vec::new();
        code.prelude().encode(&mut body);
        // The length field counts in-memory bytes, where every qstr operand is two bytes.
        let bc_len = body.len() + code.code.len();

        let instrs = decode_instructions(&code.code, self.options.cache_lookups())
            .map_err(|e| ContainerError::Corrupt(format!("{} in code of '{}'", e, code.name)))?;
        for instr in instrs {
            let bytes = &code.code[instr.offset..instr.offset + instr.size];
            match instr.operand {
                Operand::Qstr(index) => {
                    let name = code.names.get(usize::from(index)).ok_or_else(|| {
                        ContainerError::Corrupt(format!(
                            "qstr index {} out of range in '{}'",
                            index, code.name
                        ))
                    })?;
                    body.push(bytes[0]);
                    self.write_qstr(&mut body, name);
                    body.extend_from_slice(&bytes[3..]);
                }
                _ => body.extend_from_slice(bytes),
            }
        }

        write_uint(out, ((bc_len as u64) << 2) | u64::from(CODE_KIND_BYTECODE));
        out.extend_from_slice(&body);
        self.write_qstr(out, &code.name);
        self.write_qstr(out, &code.filename);
        write_uint(out, code.consts.len() as u64);
        write_uint(out, code.children.len() as u64);

        let n_args = (code.signature.n_pos_args + code.signature.n_kwonly_args) as usize;
        if code.argnames.len() != n_args {
            return Err(ContainerError::Corrupt(format!(
                "'{}' has {} argument names for {} arguments",
                code.name,
                code.argnames.len(),
                n_args
            )));
        }
        for name in &code.argnames {
            self.write_qstr(out, name);
        }
        for constant in &code.consts {
            write_constant(out, constant);
        }
        debug!(
            name = %code.name,
            bc_len,
            n_obj = code.consts.len(),
            n_raw_code = code.children.len(),
            "wrote code record"
        );
        for child in &code.children {
            self.write_code(out, child)?;
        }
        Ok(())
    }
}

fn write_constant(out: &mut Vec<u8>, constant: &Constant) {
    let (tag, payload) = match constant {
        Constant::Ellipsis => {
            out.push(b'e');
            return;
        }
        Constant::Str(s) => (b's', s.as_bytes().to_vec()),
        Constant::Bytes(b) => (b'b', b.clone()),
        Constant::Int(i) => (b'i', i.to_string().into_bytes()),
        Constant::Float(x) => (b'f', format_float(*x).into_bytes()),
        Constant::Complex { real, imag } => (b'c', format_complex(*real, *imag).into_bytes()),
    };
    out.push(tag);
    write_uint(out, payload.len() as u64);
    out.extend_from_slice(&payload);
}

/// Encode `code` as a complete `.mpy` file.
pub fn to_bytes(code: &CodeObject, options: &ContainerOptions) -> Result<Vec<u8>, ContainerError> {
    MpyWriter::new(*options).encode(code)
}

/// Write `code` as a complete `.mpy` file to `out`.
pub fn write_mpy<W: Write>(
    out: &mut W,
    code: &CodeObject,
    options: &ContainerOptions,
) -> Result<(), ContainerError> {
    let bytes = to_bytes(code, options)?;
    out.write_all(&bytes)?;
    out.flush()?;
    Ok(())
}
