//! Instruction builder used during compilation.
//!
//! Instructions are collected into a small intermediate form where jumps
//! refer to symbolic labels and constant/child references are still relative
//! to their own pools. `finish` resolves label positions in one pass and
//! serializes in a second.

use thiserror::Error;

use crate::code::{CodeObject, Constant};
use crate::opcode::{
    BINARY_OP_MULTI, BinaryOp, FAST_MULTI_SLOTS, LOAD_CONST_SMALL_INT_MULTI, LOAD_FAST_MULTI, Op,
    SMALL_INT_MULTI_MAX, SMALL_INT_MULTI_MIN, STORE_FAST_MULTI, UNARY_OP_MULTI, UnaryOp,
};
use crate::prelude::{LineInfoEncoder, ScopeFlags, Signature};
use crate::varint;

/// Errors raised when serializing a finished scope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("jump of {distance} bytes does not fit in a 16-bit offset")]
    JumpOutOfRange { distance: i64 },

    #[error("{count} qstr operands in one code object; at most 65536 fit a 16-bit index")]
    TooManyQstrs { count: usize },
}

/// Forward or backward jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Clone)]
enum Item {
    Bytes(Vec<u8>),
    Jump {
        op: Op,
        label: Label,
        extra: Option<u8>,
    },
    ConstObj(usize),
    RawCode {
        op: Op,
        child: usize,
        extra: Option<u8>,
    },
    Line(u32),
}

/// Static facts about a scope that the builder cannot see.
#[derive(Debug, Clone, Default)]
pub struct ScopeInfo {
    pub name: String,
    pub filename: String,
    pub flags: ScopeFlags,
    /// Number of local slots, including parameters and cells.
    pub n_locals: u32,
    pub n_pos_args: u32,
    pub n_kwonly_args: u32,
    pub n_def_pos_args: u32,
    pub argnames: Vec<String>,
    pub cells: Vec<u8>,
}

/// Mutable code builder for a single scope.
#[derive(Debug)]
pub struct CodeBuilder {
    items: Vec<Item>,
    labels: Vec<Option<usize>>,
    names: Vec<String>,
    consts: Vec<Constant>,
    children: Vec<CodeObject>,
    cache_lookups: bool,
    stack: i32,
    max_stack: i32,
    exc_depth: u32,
    max_exc_depth: u32,
    last_line: u32,
    /// A label points at the next item, so it must not merge into the previous one.
    label_pending: bool,
}

impl CodeBuilder {
    pub fn new(cache_lookups: bool) -> Self {
        Self {
            items: Vec::new(),
            labels: Vec::new(),
            names: Vec::new(),
            consts: Vec::new(),
            children: Vec::new(),
            cache_lookups,
            stack: 0,
            max_stack: 0,
            exc_depth: 0,
            max_exc_depth: 0,
            last_line: 0,
            label_pending: false,
        }
    }

    // =========================================================================
    // Depth bookkeeping
    // =========================================================================

    /// Current operand-stack depth.
    pub fn stack_depth(&self) -> i32 {
        self.stack
    }

    /// Apply a stack delta that no single instruction accounts for.
    pub fn adjust_stack(&mut self, delta: i32) {
        self.stack += delta;
        assert!(
            self.stack >= 0,
            "operand stack depth went negative ({})",
            self.stack
        );
        self.max_stack = self.max_stack.max(self.stack);
    }

    pub fn exception_depth(&self) -> u32 {
        self.exc_depth
    }

    /// Enter a block protected by `SETUP_*`.
    pub fn push_exception_block(&mut self) {
        self.exc_depth += 1;
        self.max_exc_depth = self.max_exc_depth.max(self.exc_depth);
    }

    pub fn pop_exception_block(&mut self) {
        assert!(self.exc_depth > 0, "exception block stack underflow");
        self.exc_depth -= 1;
    }

    // =========================================================================
    // Labels and lines
    // =========================================================================

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the next instruction.
    pub fn place_label(&mut self, label: Label) {
        let slot = &mut self.labels[label.0];
        assert!(slot.is_none(), "label {} placed twice", label.0);
        *slot = Some(self.items.len());
        self.label_pending = true;
    }

    /// Attribute following instructions to source `line`.
    pub fn set_line(&mut self, line: u32) {
        if line != self.last_line {
            self.last_line = line;
            self.push_item(Item::Line(line));
        }
    }

    // =========================================================================
    // Emission
    // =========================================================================

    fn push_item(&mut self, item: Item) {
        self.items.push(item);
        self.label_pending = false;
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        if !self.label_pending {
            if let Some(Item::Bytes(last)) = self.items.last_mut() {
                last.extend_from_slice(bytes);
                return;
            }
        }
        self.push_item(Item::Bytes(bytes.to_vec()));
    }

    /// Emit an instruction without operand.
    pub fn emit(&mut self, op: Op) {
        self.push_bytes(&[op as u8]);
        self.adjust_stack(op.stack_effect(0));
    }

    /// Emit an instruction with an unsigned varint operand.
    pub fn emit_arg(&mut self, op: Op, arg: u32) {
        let mut bytes = vec![op as u8];
        varint::write_uint(&mut bytes, u64::from(arg));
        self.push_bytes(&bytes);
        self.adjust_stack(op.stack_effect(arg));
    }

    /// Emit an instruction whose operand is a qstr.
    ///
    /// Indices past `u16::MAX` are reported by [`CodeBuilder::finish`].
    pub fn emit_qstr(&mut self, op: Op, name: &str) {
        let index = u16::try_from(self.names.len()).unwrap_or(u16::MAX);
        self.names.push(name.to_string());
        let [lo, hi] = index.to_le_bytes();
        let mut bytes = vec![op as u8, lo, hi];
        if op.has_extra_byte(self.cache_lookups) {
            bytes.push(0);
        }
        self.push_bytes(&bytes);
        self.adjust_stack(op.stack_effect(0));
    }

    pub fn emit_small_int(&mut self, value: i64) {
        if (SMALL_INT_MULTI_MIN..=SMALL_INT_MULTI_MAX).contains(&value) {
            let byte = LOAD_CONST_SMALL_INT_MULTI as i64 + value - SMALL_INT_MULTI_MIN;
            self.push_bytes(&[byte as u8]);
        } else {
            let mut bytes = vec![Op::LoadConstSmallInt as u8];
            varint::write_int(&mut bytes, value);
            self.push_bytes(&bytes);
        }
        self.adjust_stack(1);
    }

    /// Load an object constant, reusing an existing pool entry when equal.
    pub fn emit_const(&mut self, value: Constant) {
        let index = match self.consts.iter().position(|c| *c == value) {
            Some(index) => index,
            None => {
                self.consts.push(value);
                self.consts.len() - 1
            }
        };
        self.push_item(Item::ConstObj(index));
        self.adjust_stack(1);
    }

    pub fn emit_load_fast(&mut self, slot: u32) {
        if slot < FAST_MULTI_SLOTS {
            self.push_bytes(&[LOAD_FAST_MULTI + slot as u8]);
            self.adjust_stack(1);
        } else {
            self.emit_arg(Op::LoadFastN, slot);
        }
    }

    pub fn emit_store_fast(&mut self, slot: u32) {
        if slot < FAST_MULTI_SLOTS {
            self.push_bytes(&[STORE_FAST_MULTI + slot as u8]);
            self.adjust_stack(-1);
        } else {
            self.emit_arg(Op::StoreFastN, slot);
        }
    }

    pub fn emit_unary(&mut self, op: UnaryOp) {
        self.push_bytes(&[UNARY_OP_MULTI + op as u8]);
    }

    pub fn emit_binary(&mut self, op: BinaryOp) {
        self.push_bytes(&[BINARY_OP_MULTI + op as u8]);
        self.adjust_stack(-1);
    }

    /// Emit a jump-family instruction targeting `label`.
    pub fn emit_jump(&mut self, op: Op, label: Label) {
        debug_assert!(op != Op::UnwindJump, "use emit_unwind_jump");
        self.push_item(Item::Jump {
            op,
            label,
            extra: None,
        });
        self.adjust_stack(op.stack_effect(0));
    }

    /// Jump out of `depth` exception blocks; `depth` has 0x80 set when a for
    /// loop's iterator must be discarded as well.
    pub fn emit_unwind_jump(&mut self, label: Label, depth: u8) {
        self.push_item(Item::Jump {
            op: Op::UnwindJump,
            label,
            extra: Some(depth),
        });
    }

    /// Materialize a function from `child`.
    ///
    /// `n_closed` cells must already be on the stack, above the default
    /// argument tuple and keyword dict when `has_defaults` is set.
    pub fn emit_make_function(&mut self, child: CodeObject, n_closed: u8, has_defaults: bool) {
        let op = match (n_closed > 0, has_defaults) {
            (false, false) => Op::MakeFunction,
            (false, true) => Op::MakeFunctionDefargs,
            (true, false) => Op::MakeClosure,
            (true, true) => Op::MakeClosureDefargs,
        };
        self.children.push(child);
        self.push_item(Item::RawCode {
            op,
            child: self.children.len() - 1,
            extra: (n_closed > 0).then_some(n_closed),
        });
        self.adjust_stack(op.stack_effect(u32::from(n_closed)));
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    fn item_size(&self, item: &Item, n_argnames: usize) -> usize {
        match item {
            Item::Bytes(bytes) => bytes.len(),
            Item::Jump { extra, .. } => 3 + usize::from(extra.is_some()),
            Item::ConstObj(index) => 1 + varint::uint_len((n_argnames + index) as u64),
            Item::RawCode { child, extra, .. } => {
                let index = n_argnames + self.consts.len() + child;
                1 + varint::uint_len(index as u64) + usize::from(extra.is_some())
            }
            Item::Line(_) => 0,
        }
    }

    /// Resolve labels and produce the finished code object.
    ///
    /// Panics if a referenced label was never placed.
    pub fn finish(self, info: ScopeInfo) -> Result<CodeObject, BuildError> {
        if self.names.len() > usize::from(u16::MAX) + 1 {
            return Err(BuildError::TooManyQstrs {
                count: self.names.len(),
            });
        }
        let n_argnames = info.argnames.len();

        let mut positions = Vec::with_capacity(self.items.len() + 1);
        let mut pos = 0usize;
        for item in &self.items {
            positions.push(pos);
            pos += self.item_size(item, n_argnames);
        }
        positions.push(pos);

        let mut code = Vec::with_capacity(pos);
        let mut lines = LineInfoEncoder::new();
        for item in &self.items {
            match item {
                Item::Bytes(bytes) => code.extend_from_slice(bytes),
                Item::Jump { op, label, extra } => {
                    let target = match self.labels[label.0] {
                        Some(item_index) => positions[item_index],
                        None => panic!("label {} referenced but never placed", label.0),
                    };
                    let distance = target as i64 - (code.len() + 3) as i64;
                    let encoded = if op.is_signed_jump() {
                        distance + 0x8000
                    } else {
                        distance
                    };
                    let encoded = u16::try_from(encoded)
                        .map_err(|_| BuildError::JumpOutOfRange { distance })?;
                    code.push(*op as u8);
                    code.extend_from_slice(&encoded.to_le_bytes());
                    code.extend(extra);
                }
                Item::ConstObj(index) => {
                    code.push(Op::LoadConstObj as u8);
                    varint::write_uint(&mut code, (n_argnames + index) as u64);
                }
                Item::RawCode { op, child, extra } => {
                    code.push(*op as u8);
                    let index = n_argnames + self.consts.len() + child;
                    varint::write_uint(&mut code, index as u64);
                    code.extend(extra);
                }
                Item::Line(line) => lines.mark(code.len(), *line),
            }
        }

        let n_state = (info.n_locals + self.max_stack as u32).max(1);
        Ok(CodeObject {
            name: info.name,
            filename: info.filename,
            code,
            names: self.names,
            argnames: info.argnames,
            consts: self.consts,
            children: self.children,
            line_info: lines.finish(),
            signature: Signature {
                n_state,
                n_exc_stack: self.max_exc_depth,
                scope_flags: info.flags,
                n_pos_args: info.n_pos_args,
                n_kwonly_args: info.n_kwonly_args,
                n_def_pos_args: info.n_def_pos_args,
            },
            cells: info.cells,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ScopeInfo {
        ScopeInfo {
            name: "<module>".into(),
            filename: "t.py".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_simple_sequence() {
        let mut b = CodeBuilder::new(false);
        b.emit_small_int(1);
        b.emit_small_int(100);
        b.emit_binary(BinaryOp::Add);
        b.emit_qstr(Op::StoreName, "x");
        b.emit(Op::LoadConstNone);
        b.emit(Op::ReturnValue);
        assert_eq!(b.stack_depth(), 0);
        let code = b.finish(info()).unwrap();
        assert_eq!(
            code.code,
            vec![0x81, 0x22, 0x80, 0x64, 0xd7 + 27, 0x16, 0, 0, 0x51, 0x63]
        );
        assert_eq!(code.names, vec!["x".to_string()]);
        assert_eq!(code.signature.n_state, 2);
    }

    #[test]
    fn test_qstr_index_limit() {
        let mut b = CodeBuilder::new(false);
        for _ in 0..=u16::MAX {
            b.emit_qstr(Op::LoadName, "x");
            b.emit(Op::PopTop);
        }
        b.emit(Op::LoadConstNone);
        b.emit(Op::ReturnValue);
        let code = b.finish(info()).unwrap();
        assert_eq!(code.names.len(), 65536);

        let mut b = CodeBuilder::new(false);
        for _ in 0..=u16::MAX as usize + 1 {
            b.emit_qstr(Op::LoadName, "x");
            b.emit(Op::PopTop);
        }
        b.emit(Op::LoadConstNone);
        b.emit(Op::ReturnValue);
        assert_eq!(
            b.finish(info()).unwrap_err(),
            BuildError::TooManyQstrs { count: 65537 }
        );
    }

    #[test]
    fn test_qstrs_are_not_deduplicated() {
        let mut b = CodeBuilder::new(true);
        b.emit_qstr(Op::LoadGlobal, "print");
        b.emit_qstr(Op::LoadGlobal, "print");
        b.emit(Op::PopTop);
        b.emit(Op::PopTop);
        let code = b.finish(info()).unwrap();
        assert_eq!(code.names.len(), 2);
        // Cache byte follows each LOAD_GLOBAL.
        assert_eq!(code.code, vec![0x12, 0, 0, 0, 0x12, 1, 0, 0, 0x59, 0x59]);
    }

    #[test]
    fn test_forward_and_backward_jumps() {
        let mut b = CodeBuilder::new(false);
        let top = b.new_label();
        let end = b.new_label();
        b.place_label(top);
        b.emit(Op::LoadConstTrue);
        b.emit_jump(Op::PopJumpIfFalse, end);
        b.emit_jump(Op::Jump, top);
        b.place_label(end);
        b.emit(Op::LoadConstNone);
        b.emit(Op::ReturnValue);
        let code = b.finish(info()).unwrap();
        // POP_JUMP_IF_FALSE at 1 jumps to 7: 7 - 4 = 3, biased.
        assert_eq!(&code.code[1..4], &[0x44, 0x03, 0x80]);
        // JUMP at 4 jumps to 0: 0 - 7 = -7, biased.
        assert_eq!(&code.code[4..7], &[0x42, 0xf9, 0x7f]);
    }

    #[test]
    fn test_constants_follow_argnames() {
        let mut b = CodeBuilder::new(false);
        b.emit_const(Constant::Str("hello".into()));
        b.emit_const(Constant::Float(1.5));
        b.emit_const(Constant::Str("hello".into()));
        b.emit_arg(Op::BuildTuple, 3);
        b.emit(Op::ReturnValue);
        let code = b
            .finish(ScopeInfo {
                argnames: vec!["a".into(), "b".into()],
                n_locals: 2,
                n_pos_args: 2,
                ..info()
            })
            .unwrap();
        assert_eq!(code.consts.len(), 2);
        assert_eq!(&code.code[..6], &[0x23, 2, 0x23, 3, 0x23, 2]);
        assert_eq!(code.signature.n_state, 5);
    }

    #[test]
    fn test_make_closure_layout() {
        let child = CodeBuilder::new(false).finish(info()).unwrap();
        let mut b = CodeBuilder::new(false);
        b.emit_load_fast(0);
        b.emit_make_function(child, 1, false);
        assert_eq!(b.stack_depth(), 1);
        b.emit(Op::ReturnValue);
        let code = b.finish(info()).unwrap();
        assert_eq!(code.code, vec![0xb0, 0x20, 0, 1, 0x63]);
        assert_eq!(code.children.len(), 1);
    }

    #[test]
    fn test_line_info_follows_instructions() {
        let mut b = CodeBuilder::new(false);
        b.set_line(1);
        b.emit(Op::LoadConstNone);
        b.emit(Op::PopTop);
        b.set_line(3);
        b.emit(Op::LoadConstNone);
        b.emit(Op::ReturnValue);
        let code = b.finish(info()).unwrap();
        assert_eq!(code.line_info, vec![2 | 2 << 5]);
    }

    #[test]
    fn test_exception_depth_high_water() {
        let mut b = CodeBuilder::new(false);
        b.push_exception_block();
        b.push_exception_block();
        b.pop_exception_block();
        b.pop_exception_block();
        b.emit(Op::LoadConstNone);
        b.emit(Op::ReturnValue);
        let code = b.finish(info()).unwrap();
        assert_eq!(code.signature.n_exc_stack, 2);
    }

    #[test]
    #[should_panic(expected = "never placed")]
    fn test_unplaced_label_panics() {
        let mut b = CodeBuilder::new(false);
        let label = b.new_label();
        b.emit_jump(Op::Jump, label);
        let _ = b.finish(info());
    }

    #[test]
    #[should_panic(expected = "went negative")]
    fn test_negative_stack_panics() {
        let mut b = CodeBuilder::new(false);
        b.emit(Op::PopTop);
    }
}
