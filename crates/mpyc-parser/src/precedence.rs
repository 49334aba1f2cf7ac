//! Operator precedence levels for Pratt parsing.

use mpyc_lexer::{Token, TokenKind};

/// Precedence levels (higher = tighter binding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Precedence {
    Lowest = 1,
    Ternary = 2, // x if c else y
    Or = 3,      // or
    And = 4,     // and
    Not = 5,     // not x
    Compare = 6, // < > == >= <= != in not-in is is-not
    BitOr = 7,   // |
    BitXor = 8,  // ^
    BitAnd = 9,  // &
    Shift = 10,  // << >>
    Sum = 11,    // + -
    Product = 12, // * / // % @
    Unary = 13,  // -x +x ~x
    Power = 14,  // ** (right-associative)
    Postfix = 15, // f() a[i] a.b
}

impl Precedence {
    /// Left binding power of `token` when it appears after an operand.
    ///
    /// `peek` disambiguates `not in` from a stray `not`.
    pub fn infix(token: &Token, peek: &Token) -> Self {
        match token.kind {
            TokenKind::Name => match token.text.as_str() {
                "if" => Precedence::Ternary,
                "or" => Precedence::Or,
                "and" => Precedence::And,
                "in" | "is" => Precedence::Compare,
                "not" if peek.is_keyword("in") => Precedence::Compare,
                _ => Precedence::Lowest,
            },
            TokenKind::Op => match token.text.as_str() {
                "<" | ">" | "==" | ">=" | "<=" | "!=" => Precedence::Compare,
                "|" => Precedence::BitOr,
                "^" => Precedence::BitXor,
                "&" => Precedence::BitAnd,
                "<<" | ">>" => Precedence::Shift,
                "+" | "-" => Precedence::Sum,
                "*" | "/" | "//" | "%" | "@" => Precedence::Product,
                "**" => Precedence::Power,
                "(" | "[" | "." => Precedence::Postfix,
                _ => Precedence::Lowest,
            },
            _ => Precedence::Lowest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpyc_lexer::Position;

    fn tok(kind: TokenKind, text: &str) -> Token {
        Token::new(kind, text, Position::default(), Position::default())
    }

    #[test]
    fn test_ordering() {
        assert!(Precedence::Ternary < Precedence::Or);
        assert!(Precedence::Or < Precedence::And);
        assert!(Precedence::Compare < Precedence::BitOr);
        assert!(Precedence::Unary < Precedence::Power);
        assert!(Precedence::Power < Precedence::Postfix);
    }

    #[test]
    fn test_not_in_lookahead() {
        let not = tok(TokenKind::Name, "not");
        let in_kw = tok(TokenKind::Name, "in");
        let x = tok(TokenKind::Name, "x");
        assert_eq!(Precedence::infix(&not, &in_kw), Precedence::Compare);
        assert_eq!(Precedence::infix(&not, &x), Precedence::Lowest);
    }

    #[test]
    fn test_operators() {
        let end = tok(TokenKind::Newline, "\n");
        assert_eq!(Precedence::infix(&tok(TokenKind::Op, "//"), &end), Precedence::Product);
        assert_eq!(Precedence::infix(&tok(TokenKind::Op, "<<"), &end), Precedence::Shift);
        assert_eq!(Precedence::infix(&tok(TokenKind::Op, "="), &end), Precedence::Lowest);
    }
}
