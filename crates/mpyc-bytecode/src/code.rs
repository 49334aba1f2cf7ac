//! Compiled code objects.

use std::fmt;

use crate::prelude::{Prelude, Signature};

/// Object constant in a code object's pool.
///
/// Small integers and the `None`/`True`/`False` singletons are encoded inline
/// in the instruction stream and never appear here.
#[derive(Debug, Clone)]
pub enum Constant {
    Str(String),
    Bytes(Vec<u8>),
    /// Integer too wide for an inline small int.
    Int(i128),
    Float(f64),
    Complex { real: f64, imag: f64 },
    Ellipsis,
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::Str(a), Constant::Str(b)) => a == b,
            (Constant::Bytes(a), Constant::Bytes(b)) => a == b,
            (Constant::Int(a), Constant::Int(b)) => a == b,
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            (
                Constant::Complex { real: ar, imag: ai },
                Constant::Complex { real: br, imag: bi },
            ) => ar.to_bits() == br.to_bits() && ai.to_bits() == bi.to_bits(),
            (Constant::Ellipsis, Constant::Ellipsis) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Str(s) => write!(f, "{:?}", s),
            Constant::Bytes(b) => {
                write!(f, "b'")?;
                for byte in b {
                    match byte {
                        b'\\' => write!(f, "\\\\")?,
                        b'\'' => write!(f, "\\'")?,
                        0x20..=0x7e => write!(f, "{}", *byte as char)?,
                        _ => write!(f, "\\x{:02x}", byte)?,
                    }
                }
                write!(f, "'")
            }
            Constant::Int(i) => write!(f, "{}", i),
            Constant::Float(x) => write!(f, "{}", format_float(*x)),
            Constant::Complex { real, imag } => write!(f, "{}", format_complex(*real, *imag)),
            Constant::Ellipsis => write!(f, "Ellipsis"),
        }
    }
}

/// Shortest round-trip decimal text of a float, always marked as a float.
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    format!("{:?}", value)
}

/// Text form of a complex constant: `2.0j` or `(1.0+2.0j)`.
pub fn format_complex(real: f64, imag: f64) -> String {
    if real == 0.0 && real.is_sign_positive() {
        return format!("{}j", format_float(imag));
    }
    let imag_text = format_float(imag);
    let sign = if imag_text.starts_with('-') { "" } else { "+" };
    format!("({}{}{}j)", format_float(real), sign, imag_text)
}

/// A compiled scope: module, function, lambda or class body.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeObject {
    pub name: String,
    pub filename: String,
    /// Instruction bytes; qstr operands are 2-byte indices into `names`.
    pub code: Vec<u8>,
    /// Qstr operands in the order they appear in `code`.
    pub names: Vec<String>,
    /// Argument names: upvalues, positional, then keyword-only parameters.
    pub argnames: Vec<String>,
    pub consts: Vec<Constant>,
    pub children: Vec<CodeObject>,
    pub line_info: Vec<u8>,
    pub signature: Signature,
    /// Local slots that hold cells.
    pub cells: Vec<u8>,
}

impl CodeObject {
    pub fn prelude(&self) -> Prelude {
        Prelude {
            signature: self.signature,
            line_info: self.line_info.clone(),
            cells: self.cells.clone(),
        }
    }

    /// Index of the first object constant in the pool index space.
    pub fn consts_base(&self) -> usize {
        self.argnames.len()
    }

    /// Index of the first nested code object in the pool index space.
    pub fn children_base(&self) -> usize {
        self.argnames.len() + self.consts.len()
    }

    /// Number of code objects in this tree, including `self`.
    pub fn count_code_objects(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(CodeObject::count_code_objects)
            .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_constants_compare_by_bits() {
        assert_eq!(Constant::Float(f64::NAN), Constant::Float(f64::NAN));
        assert_ne!(Constant::Float(0.0), Constant::Float(-0.0));
        assert_ne!(Constant::Int(1), Constant::Float(1.0));
    }

    #[test]
    fn test_constant_display() {
        assert_eq!(Constant::Str("a'b".into()).to_string(), "\"a'b\"");
        assert_eq!(Constant::Bytes(vec![b'h', 0, b'\'']).to_string(), "b'h\\x00\\''");
        assert_eq!(Constant::Float(1.0).to_string(), "1.0");
        assert_eq!(Constant::Float(f64::INFINITY).to_string(), "inf");
        assert_eq!(
            Constant::Complex { real: 0.0, imag: 2.5 }.to_string(),
            "2.5j"
        );
        assert_eq!(
            Constant::Complex { real: 1.0, imag: -2.0 }.to_string(),
            "(1.0-2.0j)"
        );
    }

    #[test]
    fn test_pool_bases() {
        let code = CodeObject {
            name: "f".into(),
            filename: "t.py".into(),
            code: vec![],
            names: vec![],
            argnames: vec!["a".into(), "b".into()],
            consts: vec![Constant::Ellipsis],
            children: vec![],
            line_info: vec![],
            signature: Signature::default(),
            cells: vec![],
        };
        assert_eq!(code.consts_base(), 2);
        assert_eq!(code.children_base(), 3);
        assert_eq!(code.count_code_objects(), 1);
    }
}
