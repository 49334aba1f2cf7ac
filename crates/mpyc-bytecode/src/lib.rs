//! MicroPython bytecode for mpyc.
//!
//! This crate provides the opcode table, the variable-length integer and
//! prelude encodings, code objects, the instruction builder used by the
//! compiler and a disassembler.

pub mod builder;
pub mod code;
pub mod disasm;
pub mod opcode;
pub mod prelude;
pub mod varint;

pub use builder::{BuildError, CodeBuilder, Label, ScopeInfo};
pub use code::{CodeObject, Constant, format_complex, format_float};
pub use disasm::{Instruction, Opcode, Operand, decode_instruction, decode_instructions, disassemble};
pub use opcode::{BinaryOp, Op, OperandFormat, UnaryOp};
pub use prelude::{LineInfoEncoder, Prelude, ScopeFlags, Signature, decode_line_info, line_for_offset};
pub use varint::{ByteReader, DecodeError};
