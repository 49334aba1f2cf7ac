//! AST node types for the mpyc parser.

use mpyc_lexer::{Position, StringValue};
use std::fmt;

/// Identifies a scope-introducing node (module, def, class, lambda).
///
/// Assigned sequentially by the parser; the module is always `0`.
pub type NodeId = u32;

/// Base trait for all AST nodes.
pub trait Node {
    fn pos(&self) -> Position;

    /// 1-indexed source line of the node.
    fn line(&self) -> usize {
        self.pos().line_number()
    }
}

/// Access mode of a name-like expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExprContext {
    #[default]
    Load,
    Store,
    Del,
}

/// A parsed compilation unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub id: NodeId,
    pub body: Vec<Stmt>,
}

// ============================================================================
// Operators
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mult,
    MatMult,
    Div,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitOr,
    BitXor,
    BitAnd,
}

impl BinaryOperator {
    /// Map an operator token to a binary operator.
    pub fn from_op(op: &str) -> Option<Self> {
        let op = match op {
            "+" => BinaryOperator::Add,
            "-" => BinaryOperator::Sub,
            "*" => BinaryOperator::Mult,
            "@" => BinaryOperator::MatMult,
            "/" => BinaryOperator::Div,
            "//" => BinaryOperator::FloorDiv,
            "%" => BinaryOperator::Mod,
            "**" => BinaryOperator::Pow,
            "<<" => BinaryOperator::LShift,
            ">>" => BinaryOperator::RShift,
            "|" => BinaryOperator::BitOr,
            "^" => BinaryOperator::BitXor,
            "&" => BinaryOperator::BitAnd,
            _ => return None,
        };
        Some(op)
    }

    /// Map an augmented-assignment token such as `+=` to its operator.
    pub fn from_augmented(op: &str) -> Option<Self> {
        op.strip_suffix('=').and_then(Self::from_op)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Sub => "-",
            BinaryOperator::Mult => "*",
            BinaryOperator::MatMult => "@",
            BinaryOperator::Div => "/",
            BinaryOperator::FloorDiv => "//",
            BinaryOperator::Mod => "%",
            BinaryOperator::Pow => "**",
            BinaryOperator::LShift => "<<",
            BinaryOperator::RShift => ">>",
            BinaryOperator::BitOr => "|",
            BinaryOperator::BitXor => "^",
            BinaryOperator::BitAnd => "&",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOperator {
    Invert,
    Not,
    UAdd,
    USub,
}

impl UnaryOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnaryOperator::Invert => "~",
            UnaryOperator::Not => "not ",
            UnaryOperator::UAdd => "+",
            UnaryOperator::USub => "-",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoolOperator {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOperator {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Is,
    IsNot,
    In,
    NotIn,
}

impl CompareOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOperator::Eq => "==",
            CompareOperator::NotEq => "!=",
            CompareOperator::Lt => "<",
            CompareOperator::LtE => "<=",
            CompareOperator::Gt => ">",
            CompareOperator::GtE => ">=",
            CompareOperator::Is => "is",
            CompareOperator::IsNot => "is not",
            CompareOperator::In => "in",
            CompareOperator::NotIn => "not in",
        }
    }
}

// ============================================================================
// Expressions
// ============================================================================

/// Expression node enumeration.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Name(Name),
    Int(IntLit),
    Float(FloatLit),
    Imaginary(ImaginaryLit),
    Str(StrLit),
    Constant(ConstantLit),
    BinOp(Box<BinOpExpr>),
    UnaryOp(Box<UnaryOpExpr>),
    BoolOp(BoolOpExpr),
    Compare(Box<CompareExpr>),
    Call(Box<CallExpr>),
    Attribute(Box<AttributeExpr>),
    Subscript(Box<SubscriptExpr>),
    Slice(Box<SliceExpr>),
    Tuple(SequenceExpr),
    List(SequenceExpr),
    Set(SequenceExpr),
    Dict(DictExpr),
    Lambda(Box<LambdaExpr>),
    IfExp(Box<IfExpr>),
    Starred(Box<StarredExpr>),
    Yield(Box<YieldExpr>),
    YieldFrom(Box<YieldFromExpr>),
}

impl Node for Expr {
    fn pos(&self) -> Position {
        match self {
            Expr::Name(e) => e.position,
            Expr::Int(e) => e.position,
            Expr::Float(e) => e.position,
            Expr::Imaginary(e) => e.position,
            Expr::Str(e) => e.position,
            Expr::Constant(e) => e.position,
            Expr::BinOp(e) => e.left.pos(),
            Expr::UnaryOp(e) => e.position,
            Expr::BoolOp(e) => e.position,
            Expr::Compare(e) => e.left.pos(),
            Expr::Call(e) => e.func.pos(),
            Expr::Attribute(e) => e.value.pos(),
            Expr::Subscript(e) => e.value.pos(),
            Expr::Slice(e) => e.position,
            Expr::Tuple(e) | Expr::List(e) | Expr::Set(e) => e.position,
            Expr::Dict(e) => e.position,
            Expr::Lambda(e) => e.position,
            Expr::IfExp(e) => e.body.pos(),
            Expr::Starred(e) => e.position,
            Expr::Yield(e) => e.position,
            Expr::YieldFrom(e) => e.position,
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: &[Expr], sep: &str) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, "{}", sep)?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Name(e) => write!(f, "{}", e.id),
            Expr::Int(e) => write!(f, "{}", e.value),
            Expr::Float(e) => write!(f, "{:?}", e.value),
            Expr::Imaginary(e) => write!(f, "{:?}j", e.value),
            Expr::Str(e) => match &e.value {
                StringValue::Text(s) => write!(f, "{:?}", s),
                StringValue::Bytes(b) => write!(f, "b{:?}", String::from_utf8_lossy(b)),
            },
            Expr::Constant(e) => write!(f, "{}", e.value),
            Expr::BinOp(e) => write!(f, "({} {} {})", e.left, e.op.as_str(), e.right),
            Expr::UnaryOp(e) => write!(f, "({}{})", e.op.as_str(), e.operand),
            Expr::BoolOp(e) => {
                let sep = match e.op {
                    BoolOperator::And => " and ",
                    BoolOperator::Or => " or ",
                };
                write!(f, "(")?;
                write_joined(f, &e.values, sep)?;
                write!(f, ")")
            }
            Expr::Compare(e) => {
                write!(f, "({}", e.left)?;
                for (op, right) in e.ops.iter().zip(&e.comparators) {
                    write!(f, " {} {}", op.as_str(), right)?;
                }
                write!(f, ")")
            }
            Expr::Call(e) => {
                write!(f, "{}(", e.func)?;
                write_joined(f, &e.args, ", ")?;
                for (i, kw) in e.keywords.iter().enumerate() {
                    if i > 0 || !e.args.is_empty() {
                        write!(f, ", ")?;
                    }
                    match &kw.arg {
                        Some(name) => write!(f, "{}={}", name, kw.value)?,
                        None => write!(f, "**{}", kw.value)?,
                    }
                }
                write!(f, ")")
            }
            Expr::Attribute(e) => write!(f, "{}.{}", e.value, e.attr),
            Expr::Subscript(e) => write!(f, "{}[{}]", e.value, e.index),
            Expr::Slice(e) => {
                if let Some(lower) = &e.lower {
                    write!(f, "{}", lower)?;
                }
                write!(f, ":")?;
                if let Some(upper) = &e.upper {
                    write!(f, "{}", upper)?;
                }
                if let Some(step) = &e.step {
                    write!(f, ":{}", step)?;
                }
                Ok(())
            }
            Expr::Tuple(e) => {
                write!(f, "(")?;
                write_joined(f, &e.elts, ", ")?;
                if e.elts.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Expr::List(e) => {
                write!(f, "[")?;
                write_joined(f, &e.elts, ", ")?;
                write!(f, "]")
            }
            Expr::Set(e) => {
                write!(f, "{{")?;
                write_joined(f, &e.elts, ", ")?;
                write!(f, "}}")
            }
            Expr::Dict(e) => {
                write!(f, "{{")?;
                for (i, (k, v)) in e.keys.iter().zip(&e.values).enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Expr::Lambda(e) => write!(f, "(lambda {}: {})", e.args, e.body),
            Expr::IfExp(e) => write!(f, "({} if {} else {})", e.body, e.test, e.orelse),
            Expr::Starred(e) => write!(f, "*{}", e.value),
            Expr::Yield(e) => match &e.value {
                Some(v) => write!(f, "(yield {})", v),
                None => write!(f, "(yield)"),
            },
            Expr::YieldFrom(e) => write!(f, "(yield from {})", e.value),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Name {
    pub position: Position,
    pub id: String,
    pub ctx: ExprContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntLit {
    pub position: Position,
    pub value: i128,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FloatLit {
    pub position: Position,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImaginaryLit {
    pub position: Position,
    pub value: f64,
}

/// One or more adjacent string literals, concatenated.
#[derive(Debug, Clone, PartialEq)]
pub struct StrLit {
    pub position: Position,
    pub value: StringValue,
    pub formatted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Singleton {
    None,
    True,
    False,
    Ellipsis,
}

impl fmt::Display for Singleton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Singleton::None => "None",
            Singleton::True => "True",
            Singleton::False => "False",
            Singleton::Ellipsis => "...",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstantLit {
    pub position: Position,
    pub value: Singleton,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinOpExpr {
    pub left: Expr,
    pub op: BinaryOperator,
    pub right: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnaryOpExpr {
    pub position: Position,
    pub op: UnaryOperator,
    pub operand: Expr,
}

/// A flattened `and`/`or` chain.
#[derive(Debug, Clone, PartialEq)]
pub struct BoolOpExpr {
    pub position: Position,
    pub op: BoolOperator,
    pub values: Vec<Expr>,
}

/// A comparison chain: `left ops[0] comparators[0] ops[1] comparators[1] ...`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompareExpr {
    pub left: Expr,
    pub ops: Vec<CompareOperator>,
    pub comparators: Vec<Expr>,
}

/// Keyword argument; `arg` is `None` for `**mapping`.
#[derive(Debug, Clone, PartialEq)]
pub struct Keyword {
    pub position: Position,
    pub arg: Option<String>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallExpr {
    pub func: Expr,
    /// Positional arguments; `*seq` appears as [`Expr::Starred`].
    pub args: Vec<Expr>,
    pub keywords: Vec<Keyword>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeExpr {
    pub value: Expr,
    pub attr: String,
    pub ctx: ExprContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptExpr {
    pub value: Expr,
    pub index: Expr,
    pub ctx: ExprContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SliceExpr {
    pub position: Position,
    pub lower: Option<Expr>,
    pub upper: Option<Expr>,
    pub step: Option<Expr>,
}

/// Tuple, list or set display.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceExpr {
    pub position: Position,
    pub elts: Vec<Expr>,
    pub ctx: ExprContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DictExpr {
    pub position: Position,
    pub keys: Vec<Expr>,
    pub values: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LambdaExpr {
    pub id: NodeId,
    pub position: Position,
    pub args: Arguments,
    pub body: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfExpr {
    pub test: Expr,
    pub body: Expr,
    pub orelse: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StarredExpr {
    pub position: Position,
    pub value: Expr,
    pub ctx: ExprContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct YieldExpr {
    pub position: Position,
    pub value: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct YieldFromExpr {
    pub position: Position,
    pub value: Expr,
}

// ============================================================================
// Function signatures
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    pub position: Position,
    pub name: String,
}

/// Parameter list of a `def` or `lambda`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Arguments {
    pub args: Vec<Arg>,
    /// Defaults for the trailing positional parameters.
    pub defaults: Vec<Expr>,
    pub vararg: Option<Arg>,
    pub kwonlyargs: Vec<Arg>,
    /// One entry per keyword-only parameter.
    pub kw_defaults: Vec<Option<Expr>>,
    pub kwarg: Option<Arg>,
}

impl Arguments {
    /// Parameter names in slot order: positional, keyword-only, `*args`, `**kwargs`.
    pub fn names(&self) -> impl Iterator<Item = &Arg> {
        self.args
            .iter()
            .chain(self.kwonlyargs.iter())
            .chain(self.vararg.iter())
            .chain(self.kwarg.iter())
    }
}

impl fmt::Display for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        let first_default = self.args.len() - self.defaults.len();
        for (i, arg) in self.args.iter().enumerate() {
            match i.checked_sub(first_default) {
                Some(d) => parts.push(format!("{}={}", arg.name, self.defaults[d])),
                None => parts.push(arg.name.clone()),
            }
        }
        if let Some(v) = &self.vararg {
            parts.push(format!("*{}", v.name));
        } else if !self.kwonlyargs.is_empty() {
            parts.push("*".to_string());
        }
        for (arg, default) in self.kwonlyargs.iter().zip(&self.kw_defaults) {
            match default {
                Some(d) => parts.push(format!("{}={}", arg.name, d)),
                None => parts.push(arg.name.clone()),
            }
        }
        if let Some(k) = &self.kwarg {
            parts.push(format!("**{}", k.name));
        }
        write!(f, "{}", parts.join(", "))
    }
}

// ============================================================================
// Statements
// ============================================================================

/// Statement node enumeration.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(ExprStmt),
    Assign(AssignStmt),
    AugAssign(AugAssignStmt),
    If(Box<IfStmt>),
    While(Box<WhileStmt>),
    For(Box<ForStmt>),
    With(Box<WithStmt>),
    Try(Box<TryStmt>),
    FunctionDef(Box<FunctionDef>),
    ClassDef(Box<ClassDef>),
    Return(ReturnStmt),
    Delete(DeleteStmt),
    Raise(RaiseStmt),
    Assert(AssertStmt),
    Import(ImportStmt),
    ImportFrom(ImportFromStmt),
    Global(NamesStmt),
    Nonlocal(NamesStmt),
    Pass(Position),
    Break(Position),
    Continue(Position),
}

impl Node for Stmt {
    fn pos(&self) -> Position {
        match self {
            Stmt::Expr(s) => s.value.pos(),
            Stmt::Assign(s) => s.position,
            Stmt::AugAssign(s) => s.position,
            Stmt::If(s) => s.position,
            Stmt::While(s) => s.position,
            Stmt::For(s) => s.position,
            Stmt::With(s) => s.position,
            Stmt::Try(s) => s.position,
            Stmt::FunctionDef(s) => s.position,
            Stmt::ClassDef(s) => s.position,
            Stmt::Return(s) => s.position,
            Stmt::Delete(s) => s.position,
            Stmt::Raise(s) => s.position,
            Stmt::Assert(s) => s.position,
            Stmt::Import(s) => s.position,
            Stmt::ImportFrom(s) => s.position,
            Stmt::Global(s) | Stmt::Nonlocal(s) => s.position,
            Stmt::Pass(p) | Stmt::Break(p) | Stmt::Continue(p) => *p,
        }
    }
}

impl fmt::Display for Stmt {
    /// One-line summary of the statement head, used in diagnostics.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stmt::Expr(s) => write!(f, "{}", s.value),
            Stmt::Assign(s) => {
                for target in &s.targets {
                    write!(f, "{} = ", target)?;
                }
                write!(f, "{}", s.value)
            }
            Stmt::AugAssign(s) => write!(f, "{} {}= {}", s.target, s.op.as_str(), s.value),
            Stmt::If(s) => write!(f, "if {}: ...", s.test),
            Stmt::While(s) => write!(f, "while {}: ...", s.test),
            Stmt::For(s) => write!(f, "for {} in {}: ...", s.target, s.iter),
            Stmt::With(_) => write!(f, "with ...: ..."),
            Stmt::Try(_) => write!(f, "try: ..."),
            Stmt::FunctionDef(s) => write!(f, "def {}({}): ...", s.name, s.args),
            Stmt::ClassDef(s) => write!(f, "class {}: ...", s.name),
            Stmt::Return(s) => match &s.value {
                Some(v) => write!(f, "return {}", v),
                None => write!(f, "return"),
            },
            Stmt::Delete(s) => {
                write!(f, "del ")?;
                write_joined(f, &s.targets, ", ")
            }
            Stmt::Raise(s) => match (&s.exc, &s.cause) {
                (Some(e), Some(c)) => write!(f, "raise {} from {}", e, c),
                (Some(e), None) => write!(f, "raise {}", e),
                _ => write!(f, "raise"),
            },
            Stmt::Assert(s) => write!(f, "assert {}", s.test),
            Stmt::Import(s) => {
                let names: Vec<String> = s.names.iter().map(|a| a.to_string()).collect();
                write!(f, "import {}", names.join(", "))
            }
            Stmt::ImportFrom(s) => {
                let names: Vec<String> = s.names.iter().map(|a| a.to_string()).collect();
                write!(
                    f,
                    "from {}{} import {}",
                    ".".repeat(s.level),
                    s.module.as_deref().unwrap_or(""),
                    names.join(", ")
                )
            }
            Stmt::Global(s) => write!(f, "global {}", s.names.join(", ")),
            Stmt::Nonlocal(s) => write!(f, "nonlocal {}", s.names.join(", ")),
            Stmt::Pass(_) => write!(f, "pass"),
            Stmt::Break(_) => write!(f, "break"),
            Stmt::Continue(_) => write!(f, "continue"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExprStmt {
    pub value: Expr,
}

/// `a = b = value`; targets are in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignStmt {
    pub position: Position,
    pub targets: Vec<Expr>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AugAssignStmt {
    pub position: Position,
    pub target: Expr,
    pub op: BinaryOperator,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfStmt {
    pub position: Position,
    pub test: Expr,
    pub body: Vec<Stmt>,
    /// `elif` chains nest as a single `If` here.
    pub orelse: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WhileStmt {
    pub position: Position,
    pub test: Expr,
    pub body: Vec<Stmt>,
    pub orelse: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForStmt {
    pub position: Position,
    pub target: Expr,
    pub iter: Expr,
    pub body: Vec<Stmt>,
    pub orelse: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WithItem {
    pub context_expr: Expr,
    pub optional_vars: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WithStmt {
    pub position: Position,
    pub items: Vec<WithItem>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExceptHandler {
    pub position: Position,
    /// `None` for a bare `except:`.
    pub type_: Option<Expr>,
    pub name: Option<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TryStmt {
    pub position: Position,
    pub body: Vec<Stmt>,
    pub handlers: Vec<ExceptHandler>,
    pub orelse: Vec<Stmt>,
    pub finalbody: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub id: NodeId,
    pub position: Position,
    pub name: String,
    pub args: Arguments,
    pub body: Vec<Stmt>,
    /// Outermost decorator first, as written.
    pub decorators: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDef {
    pub id: NodeId,
    pub position: Position,
    pub name: String,
    pub bases: Vec<Expr>,
    pub keywords: Vec<Keyword>,
    pub body: Vec<Stmt>,
    pub decorators: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReturnStmt {
    pub position: Position,
    pub value: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStmt {
    pub position: Position,
    pub targets: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RaiseStmt {
    pub position: Position,
    pub exc: Option<Expr>,
    pub cause: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssertStmt {
    pub position: Position,
    pub test: Expr,
    pub msg: Option<Expr>,
}

/// `name as asname` in an import.
#[derive(Debug, Clone, PartialEq)]
pub struct Alias {
    pub name: String,
    pub asname: Option<String>,
}

impl fmt::Display for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.asname {
            Some(asname) => write!(f, "{} as {}", self.name, asname),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportStmt {
    pub position: Position,
    pub names: Vec<Alias>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportFromStmt {
    pub position: Position,
    pub module: Option<String>,
    /// A single `*` alias for star imports.
    pub names: Vec<Alias>,
    /// Number of leading dots.
    pub level: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamesStmt {
    pub position: Position,
    pub names: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(id: &str) -> Expr {
        Expr::Name(Name {
            position: Position::default(),
            id: id.to_string(),
            ctx: ExprContext::Load,
        })
    }

    #[test]
    fn test_augmented_operator() {
        assert_eq!(BinaryOperator::from_augmented("//="), Some(BinaryOperator::FloorDiv));
        assert_eq!(BinaryOperator::from_augmented("**="), Some(BinaryOperator::Pow));
        assert_eq!(BinaryOperator::from_augmented("=="), None);
        assert_eq!(BinaryOperator::from_augmented("+"), None);
    }

    #[test]
    fn test_display_tuple() {
        let single = Expr::Tuple(SequenceExpr {
            position: Position::default(),
            elts: vec![name("a")],
            ctx: ExprContext::Load,
        });
        assert_eq!(single.to_string(), "(a,)");
    }

    #[test]
    fn test_display_arguments() {
        let args = Arguments {
            args: vec![
                Arg { position: Position::default(), name: "a".into() },
                Arg { position: Position::default(), name: "b".into() },
            ],
            defaults: vec![name("d")],
            kwonlyargs: vec![Arg { position: Position::default(), name: "k".into() }],
            kw_defaults: vec![None],
            ..Default::default()
        };
        assert_eq!(args.to_string(), "a, b=d, *, k");
        let names: Vec<&str> = args.names().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "k"]);
    }
}
