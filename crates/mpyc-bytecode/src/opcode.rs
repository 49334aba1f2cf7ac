//! MicroPython bytecode opcode definitions (mpy format version 5).
//!
//! Opcodes are grouped by operand format: the high nibble of the opcode
//! selects whether it takes no operand, a qstr, a var-uint or a jump offset.

use std::fmt;

/// Base of the "multi" opcode ranges, which encode their argument in the opcode itself.
pub const LOAD_CONST_SMALL_INT_MULTI: u8 = 0x70;
pub const LOAD_FAST_MULTI: u8 = 0xb0;
pub const STORE_FAST_MULTI: u8 = 0xc0;
pub const UNARY_OP_MULTI: u8 = 0xd0;
pub const BINARY_OP_MULTI: u8 = 0xd7;

/// Range of integers encodable by `LOAD_CONST_SMALL_INT_MULTI`.
pub const SMALL_INT_MULTI_MIN: i64 = -16;
pub const SMALL_INT_MULTI_MAX: i64 = 47;

/// Number of local slots addressable by the fast-local multi opcodes.
pub const FAST_MULTI_SLOTS: u32 = 16;

/// Operand format of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandFormat {
    /// No operand (or the operand is folded into the opcode).
    Byte,
    /// A qstr reference.
    Qstr,
    /// An unsigned (or, for small ints, signed) varint.
    VarUint,
    /// A 16-bit little-endian jump offset.
    Offset,
}

impl OperandFormat {
    /// Format of `opcode`, derived from its high nibble.
    pub fn of(opcode: u8) -> Self {
        match (0x0000_03a4u32 >> (2 * (opcode >> 4) as u32)) & 3 {
            0 => OperandFormat::Byte,
            1 => OperandFormat::Qstr,
            2 => OperandFormat::VarUint,
            _ => OperandFormat::Offset,
        }
    }
}

/// Bytecode opcodes with an operand outside the opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    // =========================================================================
    // Qstr operand (0x10-0x1f)
    // =========================================================================
    LoadConstString = 0x10,
    LoadName = 0x11,
    LoadGlobal = 0x12,
    LoadAttr = 0x13,
    LoadMethod = 0x14,
    LoadSuperMethod = 0x15,
    StoreName = 0x16,
    StoreGlobal = 0x17,
    StoreAttr = 0x18,
    DeleteName = 0x19,
    DeleteGlobal = 0x1a,
    ImportName = 0x1b,
    ImportFrom = 0x1c,

    // =========================================================================
    // Var-uint operand (0x20-0x3f)
    // =========================================================================
    /// Raw code index, followed by a byte holding the number of closed-over cells.
    MakeClosure = 0x20,
    MakeClosureDefargs = 0x21,
    /// Signed varint operand.
    LoadConstSmallInt = 0x22,
    LoadConstObj = 0x23,
    LoadFastN = 0x24,
    LoadDeref = 0x25,
    StoreFastN = 0x26,
    StoreDeref = 0x27,
    DeleteFast = 0x28,
    DeleteDeref = 0x29,
    BuildTuple = 0x2a,
    BuildList = 0x2b,
    BuildMap = 0x2c,
    BuildSet = 0x2d,
    BuildSlice = 0x2e,
    StoreComp = 0x2f,
    UnpackSequence = 0x30,
    /// Operand is `n_before | n_after << 8`.
    UnpackEx = 0x31,
    MakeFunction = 0x32,
    MakeFunctionDefargs = 0x33,
    /// Operand is `n_positional | n_keyword << 8`.
    CallFunction = 0x34,
    CallFunctionVarKw = 0x35,
    CallMethod = 0x36,
    CallMethodVarKw = 0x37,

    // =========================================================================
    // Jump offset operand (0x40-0x4f)
    // =========================================================================
    /// Followed by a byte holding the unwind depth (0x80 set when leaving a for loop).
    UnwindJump = 0x40,
    Jump = 0x42,
    PopJumpIfTrue = 0x43,
    PopJumpIfFalse = 0x44,
    JumpIfTrueOrPop = 0x45,
    JumpIfFalseOrPop = 0x46,
    SetupWith = 0x47,
    SetupExcept = 0x48,
    SetupFinally = 0x49,
    PopExceptJump = 0x4a,
    ForIter = 0x4b,

    // =========================================================================
    // No operand (0x50-0x6f)
    // =========================================================================
    LoadConstFalse = 0x50,
    LoadConstNone = 0x51,
    LoadConstTrue = 0x52,
    LoadNull = 0x53,
    LoadBuildClass = 0x54,
    LoadSubscr = 0x55,
    StoreSubscr = 0x56,
    DupTop = 0x57,
    DupTopTwo = 0x58,
    PopTop = 0x59,
    RotTwo = 0x5a,
    RotThree = 0x5b,
    WithCleanup = 0x5c,
    EndFinally = 0x5d,
    GetIter = 0x5e,
    GetIterStack = 0x5f,
    StoreMap = 0x62,
    ReturnValue = 0x63,
    RaiseLast = 0x64,
    RaiseObj = 0x65,
    RaiseFrom = 0x66,
    YieldValue = 0x67,
    YieldFrom = 0x68,
    ImportStar = 0x69,
}

const ALL_OPS: &[Op] = &[
    Op::LoadConstString,
    Op::LoadName,
    Op::LoadGlobal,
    Op::LoadAttr,
    Op::LoadMethod,
    Op::LoadSuperMethod,
    Op::StoreName,
    Op::StoreGlobal,
    Op::StoreAttr,
    Op::DeleteName,
    Op::DeleteGlobal,
    Op::ImportName,
    Op::ImportFrom,
    Op::MakeClosure,
    Op::MakeClosureDefargs,
    Op::LoadConstSmallInt,
    Op::LoadConstObj,
    Op::LoadFastN,
    Op::LoadDeref,
    Op::StoreFastN,
    Op::StoreDeref,
    Op::DeleteFast,
    Op::DeleteDeref,
    Op::BuildTuple,
    Op::BuildList,
    Op::BuildMap,
    Op::BuildSet,
    Op::BuildSlice,
    Op::StoreComp,
    Op::UnpackSequence,
    Op::UnpackEx,
    Op::MakeFunction,
    Op::MakeFunctionDefargs,
    Op::CallFunction,
    Op::CallFunctionVarKw,
    Op::CallMethod,
    Op::CallMethodVarKw,
    Op::UnwindJump,
    Op::Jump,
    Op::PopJumpIfTrue,
    Op::PopJumpIfFalse,
    Op::JumpIfTrueOrPop,
    Op::JumpIfFalseOrPop,
    Op::SetupWith,
    Op::SetupExcept,
    Op::SetupFinally,
    Op::PopExceptJump,
    Op::ForIter,
    Op::LoadConstFalse,
    Op::LoadConstNone,
    Op::LoadConstTrue,
    Op::LoadNull,
    Op::LoadBuildClass,
    Op::LoadSubscr,
    Op::StoreSubscr,
    Op::DupTop,
    Op::DupTopTwo,
    Op::PopTop,
    Op::RotTwo,
    Op::RotThree,
    Op::WithCleanup,
    Op::EndFinally,
    Op::GetIter,
    Op::GetIterStack,
    Op::StoreMap,
    Op::ReturnValue,
    Op::RaiseLast,
    Op::RaiseObj,
    Op::RaiseFrom,
    Op::YieldValue,
    Op::YieldFrom,
    Op::ImportStar,
];

impl Op {
    /// Look up the opcode for a byte below the multi ranges.
    pub fn from_u8(byte: u8) -> Option<Op> {
        ALL_OPS.iter().copied().find(|op| *op as u8 == byte)
    }

    pub fn format(self) -> OperandFormat {
        OperandFormat::of(self as u8)
    }

    /// True for jumps whose offset may be negative (biased by 0x8000).
    pub fn is_signed_jump(self) -> bool {
        matches!(
            self,
            Op::UnwindJump
                | Op::Jump
                | Op::PopJumpIfTrue
                | Op::PopJumpIfFalse
                | Op::JumpIfTrueOrPop
                | Op::JumpIfFalseOrPop
        )
    }

    /// True for the qstr ops that carry an inline-cache byte when caching is enabled.
    pub fn has_cache(self) -> bool {
        matches!(
            self,
            Op::LoadName | Op::LoadGlobal | Op::LoadAttr | Op::StoreAttr
        )
    }

    /// True if the instruction is followed by one extra byte after its operand.
    pub fn has_extra_byte(self, cache_lookups: bool) -> bool {
        match self {
            Op::MakeClosure | Op::MakeClosureDefargs | Op::UnwindJump => true,
            op => cache_lookups && op.has_cache(),
        }
    }

    /// Operand-stack delta of the instruction.
    ///
    /// `arg` is the argument that determines the delta: the item count for
    /// builds and unpacks, the packed counts for calls and `UNPACK_EX`, and
    /// the number of closed-over cells for the closure makers. It is ignored
    /// by fixed-delta instructions.
    pub fn stack_effect(self, arg: u32) -> i32 {
        let n = arg as i32;
        let lo = (arg & 0xff) as i32;
        let hi = ((arg >> 8) & 0xff) as i32;
        match self {
            Op::LoadConstString
            | Op::LoadName
            | Op::LoadGlobal
            | Op::LoadMethod
            | Op::LoadConstSmallInt
            | Op::LoadConstObj
            | Op::LoadFastN
            | Op::LoadDeref
            | Op::LoadConstFalse
            | Op::LoadConstNone
            | Op::LoadConstTrue
            | Op::LoadNull
            | Op::LoadBuildClass
            | Op::ImportFrom
            | Op::MakeFunction
            | Op::BuildMap
            | Op::DupTop
            | Op::ForIter => 1,

            Op::LoadAttr
            | Op::DeleteName
            | Op::DeleteGlobal
            | Op::DeleteFast
            | Op::DeleteDeref
            | Op::UnwindJump
            | Op::Jump
            | Op::SetupExcept
            | Op::SetupFinally
            | Op::PopExceptJump
            | Op::RotTwo
            | Op::RotThree
            | Op::GetIter
            | Op::RaiseLast
            | Op::YieldValue => 0,

            Op::LoadSuperMethod
            | Op::StoreName
            | Op::StoreGlobal
            | Op::StoreFastN
            | Op::StoreDeref
            | Op::ImportName
            | Op::MakeFunctionDefargs
            | Op::PopJumpIfTrue
            | Op::PopJumpIfFalse
            | Op::JumpIfTrueOrPop
            | Op::JumpIfFalseOrPop
            | Op::LoadSubscr
            | Op::PopTop
            | Op::EndFinally
            | Op::ReturnValue
            | Op::RaiseObj
            | Op::YieldFrom
            | Op::ImportStar => -1,

            Op::StoreAttr | Op::StoreMap | Op::WithCleanup | Op::RaiseFrom => -2,
            Op::StoreSubscr => -3,
            Op::DupTopTwo | Op::SetupWith => 2,
            Op::GetIterStack => 3,

            Op::MakeClosure => 1 - n,
            Op::MakeClosureDefargs => -1 - n,
            Op::BuildTuple | Op::BuildList | Op::BuildSet | Op::BuildSlice => 1 - n,
            Op::StoreComp => -n,
            Op::UnpackSequence => n - 1,
            Op::UnpackEx => lo + hi,
            Op::CallFunction => -(lo + 2 * hi),
            Op::CallFunctionVarKw => -(lo + 2 * hi + 2),
            Op::CallMethod => -(1 + lo + 2 * hi),
            Op::CallMethodVarKw => -(1 + lo + 2 * hi + 2),
        }
    }

    /// Mnemonic, as printed by the disassembler.
    pub fn name(self) -> &'static str {
        match self {
            Op::LoadConstString => "LOAD_CONST_STRING",
            Op::LoadName => "LOAD_NAME",
            Op::LoadGlobal => "LOAD_GLOBAL",
            Op::LoadAttr => "LOAD_ATTR",
            Op::LoadMethod => "LOAD_METHOD",
            Op::LoadSuperMethod => "LOAD_SUPER_METHOD",
            Op::StoreName => "STORE_NAME",
            Op::StoreGlobal => "STORE_GLOBAL",
            Op::StoreAttr => "STORE_ATTR",
            Op::DeleteName => "DELETE_NAME",
            Op::DeleteGlobal => "DELETE_GLOBAL",
            Op::ImportName => "IMPORT_NAME",
            Op::ImportFrom => "IMPORT_FROM",
            Op::MakeClosure => "MAKE_CLOSURE",
            Op::MakeClosureDefargs => "MAKE_CLOSURE_DEFARGS",
            Op::LoadConstSmallInt => "LOAD_CONST_SMALL_INT",
            Op::LoadConstObj => "LOAD_CONST_OBJ",
            Op::LoadFastN => "LOAD_FAST_N",
            Op::LoadDeref => "LOAD_DEREF",
            Op::StoreFastN => "STORE_FAST_N",
            Op::StoreDeref => "STORE_DEREF",
            Op::DeleteFast => "DELETE_FAST",
            Op::DeleteDeref => "DELETE_DEREF",
            Op::BuildTuple => "BUILD_TUPLE",
            Op::BuildList => "BUILD_LIST",
            Op::BuildMap => "BUILD_MAP",
            Op::BuildSet => "BUILD_SET",
            Op::BuildSlice => "BUILD_SLICE",
            Op::StoreComp => "STORE_COMP",
            Op::UnpackSequence => "UNPACK_SEQUENCE",
            Op::UnpackEx => "UNPACK_EX",
            Op::MakeFunction => "MAKE_FUNCTION",
            Op::MakeFunctionDefargs => "MAKE_FUNCTION_DEFARGS",
            Op::CallFunction => "CALL_FUNCTION",
            Op::CallFunctionVarKw => "CALL_FUNCTION_VAR_KW",
            Op::CallMethod => "CALL_METHOD",
            Op::CallMethodVarKw => "CALL_METHOD_VAR_KW",
            Op::UnwindJump => "UNWIND_JUMP",
            Op::Jump => "JUMP",
            Op::PopJumpIfTrue => "POP_JUMP_IF_TRUE",
            Op::PopJumpIfFalse => "POP_JUMP_IF_FALSE",
            Op::JumpIfTrueOrPop => "JUMP_IF_TRUE_OR_POP",
            Op::JumpIfFalseOrPop => "JUMP_IF_FALSE_OR_POP",
            Op::SetupWith => "SETUP_WITH",
            Op::SetupExcept => "SETUP_EXCEPT",
            Op::SetupFinally => "SETUP_FINALLY",
            Op::PopExceptJump => "POP_EXCEPT_JUMP",
            Op::ForIter => "FOR_ITER",
            Op::LoadConstFalse => "LOAD_CONST_FALSE",
            Op::LoadConstNone => "LOAD_CONST_NONE",
            Op::LoadConstTrue => "LOAD_CONST_TRUE",
            Op::LoadNull => "LOAD_NULL",
            Op::LoadBuildClass => "LOAD_BUILD_CLASS",
            Op::LoadSubscr => "LOAD_SUBSCR",
            Op::StoreSubscr => "STORE_SUBSCR",
            Op::DupTop => "DUP_TOP",
            Op::DupTopTwo => "DUP_TOP_TWO",
            Op::PopTop => "POP_TOP",
            Op::RotTwo => "ROT_TWO",
            Op::RotThree => "ROT_THREE",
            Op::WithCleanup => "WITH_CLEANUP",
            Op::EndFinally => "END_FINALLY",
            Op::GetIter => "GET_ITER",
            Op::GetIterStack => "GET_ITER_STACK",
            Op::StoreMap => "STORE_MAP",
            Op::ReturnValue => "RETURN_VALUE",
            Op::RaiseLast => "RAISE_LAST",
            Op::RaiseObj => "RAISE_OBJ",
            Op::RaiseFrom => "RAISE_FROM",
            Op::YieldValue => "YIELD_VALUE",
            Op::YieldFrom => "YIELD_FROM",
            Op::ImportStar => "IMPORT_STAR",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Unary operators, encoded as `UNARY_OP_MULTI + op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UnaryOp {
    Positive = 0,
    Negative = 1,
    Invert = 2,
    Not = 3,
}

impl UnaryOp {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(UnaryOp::Positive),
            1 => Some(UnaryOp::Negative),
            2 => Some(UnaryOp::Invert),
            3 => Some(UnaryOp::Not),
            _ => None,
        }
    }
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnaryOp::Positive => "POSITIVE",
            UnaryOp::Negative => "NEGATIVE",
            UnaryOp::Invert => "INVERT",
            UnaryOp::Not => "NOT",
        };
        write!(f, "{}", s)
    }
}

/// Binary operators, encoded as `BINARY_OP_MULTI + op`.
///
/// The in-place forms sit at a fixed distance from their plain forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BinaryOp {
    Less = 0,
    More = 1,
    Equal = 2,
    LessEqual = 3,
    MoreEqual = 4,
    NotEqual = 5,
    In = 6,
    Is = 7,
    ExceptionMatch = 8,
    InplaceOr = 9,
    InplaceXor = 10,
    InplaceAnd = 11,
    InplaceLshift = 12,
    InplaceRshift = 13,
    InplaceAdd = 14,
    InplaceSubtract = 15,
    InplaceMultiply = 16,
    InplaceMatMultiply = 17,
    InplaceFloorDivide = 18,
    InplaceTrueDivide = 19,
    InplaceModulo = 20,
    InplacePower = 21,
    Or = 22,
    Xor = 23,
    And = 24,
    Lshift = 25,
    Rshift = 26,
    Add = 27,
    Subtract = 28,
    Multiply = 29,
    MatMultiply = 30,
    FloorDivide = 31,
    TrueDivide = 32,
    Modulo = 33,
    Power = 34,
}

const BINARY_OP_NAMES: [&str; 35] = [
    "LESS",
    "MORE",
    "EQUAL",
    "LESS_EQUAL",
    "MORE_EQUAL",
    "NOT_EQUAL",
    "IN",
    "IS",
    "EXCEPTION_MATCH",
    "INPLACE_OR",
    "INPLACE_XOR",
    "INPLACE_AND",
    "INPLACE_LSHIFT",
    "INPLACE_RSHIFT",
    "INPLACE_ADD",
    "INPLACE_SUBTRACT",
    "INPLACE_MULTIPLY",
    "INPLACE_MAT_MULTIPLY",
    "INPLACE_FLOOR_DIVIDE",
    "INPLACE_TRUE_DIVIDE",
    "INPLACE_MODULO",
    "INPLACE_POWER",
    "OR",
    "XOR",
    "AND",
    "LSHIFT",
    "RSHIFT",
    "ADD",
    "SUBTRACT",
    "MULTIPLY",
    "MAT_MULTIPLY",
    "FLOOR_DIVIDE",
    "TRUE_DIVIDE",
    "MODULO",
    "POWER",
];

const BINARY_OPS: [BinaryOp; 35] = [
    BinaryOp::Less,
    BinaryOp::More,
    BinaryOp::Equal,
    BinaryOp::LessEqual,
    BinaryOp::MoreEqual,
    BinaryOp::NotEqual,
    BinaryOp::In,
    BinaryOp::Is,
    BinaryOp::ExceptionMatch,
    BinaryOp::InplaceOr,
    BinaryOp::InplaceXor,
    BinaryOp::InplaceAnd,
    BinaryOp::InplaceLshift,
    BinaryOp::InplaceRshift,
    BinaryOp::InplaceAdd,
    BinaryOp::InplaceSubtract,
    BinaryOp::InplaceMultiply,
    BinaryOp::InplaceMatMultiply,
    BinaryOp::InplaceFloorDivide,
    BinaryOp::InplaceTrueDivide,
    BinaryOp::InplaceModulo,
    BinaryOp::InplacePower,
    BinaryOp::Or,
    BinaryOp::Xor,
    BinaryOp::And,
    BinaryOp::Lshift,
    BinaryOp::Rshift,
    BinaryOp::Add,
    BinaryOp::Subtract,
    BinaryOp::Multiply,
    BinaryOp::MatMultiply,
    BinaryOp::FloorDivide,
    BinaryOp::TrueDivide,
    BinaryOp::Modulo,
    BinaryOp::Power,
];

/// Distance between a plain arithmetic operator and its in-place form.
const INPLACE_DISTANCE: u8 = BinaryOp::Or as u8 - BinaryOp::InplaceOr as u8;

impl BinaryOp {
    pub fn from_u8(byte: u8) -> Option<Self> {
        BINARY_OPS.get(byte as usize).copied()
    }

    /// The in-place variant of an arithmetic operator; other operators map to themselves.
    pub fn inplace(self) -> Self {
        let code = self as u8;
        if (BinaryOp::Or as u8..=BinaryOp::Power as u8).contains(&code) {
            BINARY_OPS[(code - INPLACE_DISTANCE) as usize]
        } else {
            self
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BINARY_OP_NAMES[*self as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operand_format() {
        assert_eq!(Op::LoadName.format(), OperandFormat::Qstr);
        assert_eq!(Op::CallFunction.format(), OperandFormat::VarUint);
        assert_eq!(Op::MakeClosure.format(), OperandFormat::VarUint);
        assert_eq!(Op::ForIter.format(), OperandFormat::Offset);
        assert_eq!(Op::ReturnValue.format(), OperandFormat::Byte);
        assert_eq!(OperandFormat::of(LOAD_FAST_MULTI + 3), OperandFormat::Byte);
        assert_eq!(OperandFormat::of(BINARY_OP_MULTI + 34), OperandFormat::Byte);
    }

    #[test]
    fn test_from_u8_round_trip() {
        for op in ALL_OPS {
            assert_eq!(Op::from_u8(*op as u8), Some(*op));
        }
        assert_eq!(Op::from_u8(0x41), None);
        assert_eq!(Op::from_u8(0x60), None);
    }

    #[test]
    fn test_extra_bytes() {
        assert!(Op::MakeClosure.has_extra_byte(false));
        assert!(Op::UnwindJump.has_extra_byte(false));
        assert!(!Op::LoadGlobal.has_extra_byte(false));
        assert!(Op::LoadGlobal.has_extra_byte(true));
        assert!(!Op::StoreName.has_extra_byte(true));
    }

    #[test]
    fn test_stack_effects() {
        assert_eq!(Op::CallFunction.stack_effect(2 | 1 << 8), -4);
        assert_eq!(Op::CallMethod.stack_effect(1), -2);
        assert_eq!(Op::CallFunctionVarKw.stack_effect(0), -2);
        assert_eq!(Op::BuildTuple.stack_effect(3), -2);
        assert_eq!(Op::BuildTuple.stack_effect(0), 1);
        assert_eq!(Op::UnpackSequence.stack_effect(3), 2);
        assert_eq!(Op::UnpackEx.stack_effect(1 | 2 << 8), 3);
        assert_eq!(Op::MakeClosureDefargs.stack_effect(2), -3);
        assert_eq!(Op::StoreSubscr.stack_effect(0), -3);
    }

    #[test]
    fn test_binary_op_inplace() {
        assert_eq!(BinaryOp::Add.inplace(), BinaryOp::InplaceAdd);
        assert_eq!(BinaryOp::Power.inplace(), BinaryOp::InplacePower);
        assert_eq!(BinaryOp::Or.inplace(), BinaryOp::InplaceOr);
        assert_eq!(BinaryOp::Less.inplace(), BinaryOp::Less);
        assert_eq!(BinaryOp::from_u8(34), Some(BinaryOp::Power));
        assert_eq!(BinaryOp::from_u8(35), None);
        assert_eq!(BinaryOp::InplaceFloorDivide.to_string(), "INPLACE_FLOOR_DIVIDE");
    }
}
