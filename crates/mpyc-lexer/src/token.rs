//! Token types produced by the tokenizer.

use std::fmt;

/// Token kinds, following the classic Python `tokenize` categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenKind {
    /// Identifier or keyword.
    Name,
    Number,
    /// String literal, stored with its prefix and quotes.
    String,
    /// Operator or delimiter.
    Op,
    /// End of a logical line.
    Newline,
    /// Non-logical line break (blank line, comment line, inside brackets).
    Nl,
    Indent,
    Dedent,
    Comment,
    EndMarker,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenKind::Name => "NAME",
            TokenKind::Number => "NUMBER",
            TokenKind::String => "STRING",
            TokenKind::Op => "OP",
            TokenKind::Newline => "NEWLINE",
            TokenKind::Nl => "NL",
            TokenKind::Indent => "INDENT",
            TokenKind::Dedent => "DEDENT",
            TokenKind::Comment => "COMMENT",
            TokenKind::EndMarker => "ENDMARKER",
        };
        write!(f, "{}", s)
    }
}

/// Reserved words. A NAME token whose text is one of these is a keyword.
pub const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

/// Returns true if `name` is a reserved word.
pub fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

/// Position in source code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    /// Character offset within the file.
    pub char: usize,
    /// Character offset of the start of the current line.
    pub line_start: usize,
    /// 0-indexed line number.
    pub line: usize,
    /// 0-indexed column number.
    pub column: usize,
}

impl Position {
    /// Create a new Position.
    pub fn new(char: usize, line_start: usize, line: usize, column: usize) -> Self {
        Self {
            char,
            line_start,
            line,
            column,
        }
    }

    /// Returns the 1-indexed line number.
    pub fn line_number(&self) -> usize {
        self.line + 1
    }

    /// Returns the 1-indexed column number.
    pub fn column_number(&self) -> usize {
        self.column + 1
    }
}

/// A token produced by the tokenizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Source text of the token.
    pub text: String,
    pub start: Position,
    pub end: Position,
}

impl Token {
    /// Create a new Token.
    pub fn new(kind: TokenKind, text: impl Into<String>, start: Position, end: Position) -> Self {
        Self {
            kind,
            text: text.into(),
            start,
            end,
        }
    }

    /// 1-indexed source line of the token start.
    pub fn line(&self) -> usize {
        self.start.line_number()
    }

    /// True for an OP token with exactly this text.
    pub fn is_op(&self, op: &str) -> bool {
        self.kind == TokenKind::Op && self.text == op
    }

    /// True for a NAME token spelling this keyword.
    pub fn is_keyword(&self, kw: &str) -> bool {
        self.kind == TokenKind::Name && self.text == kw
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TokenKind::Newline | TokenKind::Nl => write!(f, "{}", self.kind),
            TokenKind::Indent | TokenKind::Dedent | TokenKind::EndMarker => {
                write!(f, "{}", self.kind)
            }
            _ => write!(f, "{} {:?}", self.kind, self.text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords() {
        assert!(is_keyword("lambda"));
        assert!(is_keyword("None"));
        assert!(!is_keyword("none"));
        assert!(!is_keyword("print"));
    }

    #[test]
    fn test_position() {
        let pos = Position::new(10, 5, 1, 5);
        assert_eq!(pos.line_number(), 2);
        assert_eq!(pos.column_number(), 6);
    }

    #[test]
    fn test_token_display() {
        let tok = Token::new(TokenKind::Op, "+=", Position::default(), Position::default());
        assert_eq!(tok.to_string(), "OP \"+=\"");
        assert!(tok.is_op("+="));
        assert!(!tok.is_keyword("+="));
    }
}
