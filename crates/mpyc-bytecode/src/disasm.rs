//! Instruction decoding and human-readable listings of code objects.

use std::fmt::Write;

use crate::code::CodeObject;
use crate::opcode::{
    BINARY_OP_MULTI, BinaryOp, LOAD_CONST_SMALL_INT_MULTI, LOAD_FAST_MULTI, Op, OperandFormat,
    SMALL_INT_MULTI_MIN, STORE_FAST_MULTI, UNARY_OP_MULTI, UnaryOp,
};
use crate::prelude::decode_line_info;
use crate::varint::{ByteReader, DecodeError};

/// What an instruction does, with its operand decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Op(Op),
    SmallInt(i64),
    LoadFast(u32),
    StoreFast(u32),
    Unary(UnaryOp),
    Binary(BinaryOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    /// Index into the code object's `names`.
    Qstr(u16),
    Uint(u64),
    Int(i64),
    /// Absolute jump target.
    Target(usize),
}

/// A single decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub offset: usize,
    pub size: usize,
    pub opcode: Opcode,
    pub operand: Operand,
    pub extra: Option<u8>,
}

/// Decode the instruction at `offset` of an in-memory instruction stream.
pub fn decode_instruction(
    code: &[u8],
    offset: usize,
    cache_lookups: bool,
) -> Result<Instruction, DecodeError> {
    let mut reader = ByteReader::new(code.get(offset..).ok_or(DecodeError::Truncated)?);
    let byte = reader.read_u8()?;
    let opcode = match byte {
        b if b >= BINARY_OP_MULTI => Opcode::Binary(
            BinaryOp::from_u8(b - BINARY_OP_MULTI)
                .ok_or(DecodeError::Malformed("unknown binary operator"))?,
        ),
        b if b >= UNARY_OP_MULTI => Opcode::Unary(
            UnaryOp::from_u8(b - UNARY_OP_MULTI).ok_or(DecodeError::Malformed("unknown opcode"))?,
        ),
        b if b >= STORE_FAST_MULTI => Opcode::StoreFast(u32::from(b - STORE_FAST_MULTI)),
        b if b >= LOAD_FAST_MULTI => Opcode::LoadFast(u32::from(b - LOAD_FAST_MULTI)),
        b if b >= LOAD_CONST_SMALL_INT_MULTI => {
            Opcode::SmallInt(i64::from(b - LOAD_CONST_SMALL_INT_MULTI) + SMALL_INT_MULTI_MIN)
        }
        b => Opcode::Op(Op::from_u8(b).ok_or(DecodeError::Malformed("unknown opcode"))?),
    };

    let (operand, extra) = match opcode {
        Opcode::Op(op) => {
            let operand = match op.format() {
                OperandFormat::Byte => Operand::None,
                OperandFormat::Qstr => Operand::Qstr(reader.read_u16_le()?),
                OperandFormat::VarUint if op == Op::LoadConstSmallInt => {
                    Operand::Int(reader.read_int()?)
                }
                OperandFormat::VarUint => Operand::Uint(reader.read_uint()?),
                OperandFormat::Offset => {
                    let raw = i64::from(reader.read_u16_le()?);
                    let relative = if op.is_signed_jump() { raw - 0x8000 } else { raw };
                    let target = (offset + 3) as i64 + relative;
                    let target = usize::try_from(target)
                        .map_err(|_| DecodeError::Malformed("jump before start of code"))?;
                    Operand::Target(target)
                }
            };
            let extra = if op.has_extra_byte(cache_lookups) {
                Some(reader.read_u8()?)
            } else {
                None
            };
            (operand, extra)
        }
        _ => (Operand::None, None),
    };

    Ok(Instruction {
        offset,
        size: reader.position(),
        opcode,
        operand,
        extra,
    })
}

/// Decode a whole instruction stream.
pub fn decode_instructions(
    code: &[u8],
    cache_lookups: bool,
) -> Result<Vec<Instruction>, DecodeError> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < code.len() {
        let instr = decode_instruction(code, offset, cache_lookups)?;
        offset += instr.size;
        out.push(instr);
    }
    Ok(out)
}

/// Render a listing of `code` and all nested code objects.
pub fn disassemble(code: &CodeObject, cache_lookups: bool) -> Result<String, DecodeError> {
    let mut out = String::new();
    write_code(&mut out, code, cache_lookups, 0)?;
    Ok(out)
}

fn write_code(
    out: &mut String,
    code: &CodeObject,
    cache_lookups: bool,
    depth: usize,
) -> Result<(), DecodeError> {
    let indent = "  ".repeat(depth);
    let sig = &code.signature;
    let _ = writeln!(
        out,
        "{}code {} ({}) n_state={} n_exc_stack={} flags={:#04x} args={}/{}/{}",
        indent,
        code.name,
        code.filename,
        sig.n_state,
        sig.n_exc_stack,
        sig.scope_flags.bits(),
        sig.n_pos_args,
        sig.n_kwonly_args,
        sig.n_def_pos_args
    );
    if !code.argnames.is_empty() {
        let _ = writeln!(out, "{}  argnames: {}", indent, code.argnames.join(", "));
    }
    if !code.cells.is_empty() {
        let cells: Vec<String> = code.cells.iter().map(u8::to_string).collect();
        let _ = writeln!(out, "{}  cells: {}", indent, cells.join(", "));
    }

    let lines = decode_line_info(&code.line_info)?;
    let mut next_line = lines.iter().peekable();
    for instr in decode_instructions(&code.code, cache_lookups)? {
        let mut line_col = String::new();
        while let Some((offset, line)) = next_line.peek() {
            if *offset > instr.offset {
                break;
            }
            line_col = format!("{:>4}", line);
            next_line.next();
        }
        let _ = writeln!(
            out,
            "{}  {:>4} {:>5}  {}",
            indent,
            line_col,
            instr.offset,
            describe(code, &instr)
        );
    }

    for child in &code.children {
        write_code(out, child, cache_lookups, depth + 1)?;
    }
    Ok(())
}

fn describe(code: &CodeObject, instr: &Instruction) -> String {
    let op = match instr.opcode {
        Opcode::SmallInt(n) => return format!("LOAD_CONST_SMALL_INT {}", n),
        Opcode::LoadFast(n) => return format!("LOAD_FAST {}", n),
        Opcode::StoreFast(n) => return format!("STORE_FAST {}", n),
        Opcode::Unary(u) => return format!("UNARY_OP {}", u),
        Opcode::Binary(b) => return format!("BINARY_OP {}", b),
        Opcode::Op(op) => op,
    };
    let mut text = op.name().to_string();
    match instr.operand {
        Operand::None => {}
        Operand::Qstr(index) => {
            let name = code
                .names
                .get(usize::from(index))
                .map(String::as_str)
                .unwrap_or("?");
            let _ = write!(text, " {}", name);
        }
        Operand::Int(n) => {
            let _ = write!(text, " {}", n);
        }
        Operand::Uint(n) => {
            let _ = write!(text, " {}", n);
            if let Some(detail) = pool_detail(code, op, n as usize) {
                let _ = write!(text, " ({})", detail);
            }
        }
        Operand::Target(target) => {
            let _ = write!(text, " -> {}", target);
        }
    }
    if let Some(extra) = instr.extra {
        let _ = write!(text, " [{}]", extra);
    }
    text
}

fn pool_detail(code: &CodeObject, op: Op, index: usize) -> Option<String> {
    match op {
        Op::LoadConstObj => code
            .consts
            .get(index.checked_sub(code.consts_base())?)
            .map(|c| c.to_string()),
        Op::MakeFunction | Op::MakeFunctionDefargs | Op::MakeClosure | Op::MakeClosureDefargs => {
            code.children
                .get(index.checked_sub(code.children_base())?)
                .map(|c| format!("code {}", c.name))
        }
        _ => None,
    }
}
