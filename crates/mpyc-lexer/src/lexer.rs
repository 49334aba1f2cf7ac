//! Indentation-aware tokenizer for Python source.

use std::collections::VecDeque;

use crate::token::{Position, Token, TokenKind};
use thiserror::Error;

/// Errors that can occur during tokenization.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LexerError {
    #[error("invalid number literal: {literal} at line {line}, column {column}")]
    InvalidNumber {
        literal: String,
        line: usize,
        column: usize,
    },

    #[error("unterminated string literal at line {line}, column {column}")]
    UnterminatedString { line: usize, column: usize },

    #[error("invalid escape sequence in string at line {line}, column {column}")]
    InvalidEscape { line: usize, column: usize },

    #[error("unindent does not match any outer indentation level at line {line}")]
    InconsistentDedent { line: usize },

    #[error("unexpected character {ch:?} at line {line}, column {column}")]
    UnexpectedCharacter {
        ch: char,
        line: usize,
        column: usize,
    },
}

/// Anything that can hand the parser a stream of positioned tokens.
///
/// The end of input is signalled by an `EndMarker` token, which is returned
/// again on every subsequent call.
pub trait TokenSource {
    fn next_token(&mut self) -> Result<Token, LexerError>;
}

/// A pre-built token sequence, mostly useful for tests.
pub struct TokenStream {
    tokens: std::vec::IntoIter<Token>,
    last: Position,
}

impl TokenStream {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens: tokens.into_iter(),
            last: Position::default(),
        }
    }
}

impl TokenSource for TokenStream {
    fn next_token(&mut self) -> Result<Token, LexerError> {
        match self.tokens.next() {
            Some(tok) => {
                self.last = tok.end;
                Ok(tok)
            }
            None => Ok(Token::new(TokenKind::EndMarker, "", self.last, self.last)),
        }
    }
}

/// Operators, longest first so the first prefix match wins.
const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "+=", "-=", "*=", "/=", "%=", "@=", "&=", "|=", "^=",
    "**", "//", "<<", ">>", "==", "!=", ">=", "<=", "->", ":=", "+", "-", "*", "/", "%", "@",
    "&", "|", "^", "~", "<", ">", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "=",
];

/// Lexer tokenizes Python source code.
pub struct Lexer {
    chars: Vec<char>,
    position: usize,
    next_position: usize,
    ch: char,
    line: usize,
    column: isize,
    line_start: usize,
    token_start: Position,
    indents: Vec<usize>,
    paren_level: usize,
    at_line_start: bool,
    line_has_content: bool,
    pending: VecDeque<Token>,
    finished: bool,
}

impl Lexer {
    /// Create a new lexer for the given input.
    pub fn new(input: &str) -> Self {
        let chars: Vec<char> = input.chars().collect();
        let mut lexer = Self {
            chars,
            position: 0,
            next_position: 0,
            ch: '\0',
            line: 0,
            column: -1,
            line_start: 0,
            token_start: Position::default(),
            indents: vec![0],
            paren_level: 0,
            at_line_start: true,
            line_has_content: false,
            pending: VecDeque::new(),
            finished: false,
        };
        lexer.read_char();
        lexer
    }

    fn current_position(&self) -> Position {
        Position::new(
            self.position,
            self.line_start,
            self.line,
            self.column.max(0) as usize,
        )
    }

    /// Read the next character.
    fn read_char(&mut self) {
        if self.next_position >= self.chars.len() {
            self.ch = '\0';
        } else {
            self.ch = self.chars[self.next_position];
        }
        self.position = self.next_position;
        self.next_position += 1;
        self.column += 1;
    }

    /// Peek n characters past the current one without consuming.
    fn peek_char_n(&self, n: usize) -> char {
        let idx = self.position + n;
        if idx >= self.chars.len() {
            '\0'
        } else {
            self.chars[idx]
        }
    }

    fn skip_whitespace(&mut self) {
        while self.ch == ' ' || self.ch == '\t' || self.ch == '\x0c' {
            self.read_char();
        }
    }

    /// Consume a line break (`\n`, `\r\n` or `\r`) and update line tracking.
    fn consume_newline(&mut self) {
        if self.ch == '\r' {
            self.read_char();
        }
        if self.ch == '\n' {
            self.read_char();
        }
        self.line += 1;
        self.column = 0;
        self.line_start = self.position;
    }

    fn start_token(&mut self) {
        self.token_start = self.current_position();
    }

    fn make_token(&self, kind: TokenKind, text: impl Into<String>) -> Token {
        Token::new(kind, text, self.token_start, self.current_position())
    }

    fn source_text(&self) -> String {
        self.chars[self.token_start.char..self.position].iter().collect()
    }

    /// Get the next token.
    pub fn next_token(&mut self) -> Result<Token, LexerError> {
        if let Some(tok) = self.pending.pop_front() {
            return Ok(tok);
        }
        if self.finished {
            return Ok(self.make_token(TokenKind::EndMarker, ""));
        }

        if self.at_line_start && self.paren_level == 0 {
            self.at_line_start = false;
            if let Some(tok) = self.read_indentation()? {
                return Ok(tok);
            }
        }

        self.skip_whitespace();

        // Explicit line joining
        while self.ch == '\\' && matches!(self.peek_char_n(1), '\n' | '\r') {
            self.read_char();
            self.consume_newline();
            self.skip_whitespace();
        }

        self.start_token();

        if self.ch == '\0' {
            return Ok(self.finish());
        }

        if self.ch == '#' {
            while !matches!(self.ch, '\n' | '\r' | '\0') {
                self.read_char();
            }
            let text = self.source_text();
            return Ok(self.make_token(TokenKind::Comment, text));
        }

        if self.ch == '\n' || self.ch == '\r' {
            let kind = if self.paren_level > 0 || !self.line_has_content {
                TokenKind::Nl
            } else {
                TokenKind::Newline
            };
            self.consume_newline();
            let tok = Token::new(kind, "\n", self.token_start, self.token_start);
            if self.paren_level == 0 {
                self.at_line_start = true;
                self.line_has_content = false;
            }
            return Ok(tok);
        }

        self.line_has_content = true;

        if self.ch == '"' || self.ch == '\'' {
            return self.read_string();
        }

        if self.ch.is_ascii_digit() || (self.ch == '.' && self.peek_char_n(1).is_ascii_digit()) {
            return self.read_number();
        }

        if is_name_start(self.ch) {
            while is_name_continue(self.ch) {
                self.read_char();
            }
            let text = self.source_text();
            if (self.ch == '"' || self.ch == '\'') && is_string_prefix(&text) {
                return self.read_string();
            }
            return Ok(self.make_token(TokenKind::Name, text));
        }

        if let Some(tok) = self.read_operator() {
            return Ok(tok);
        }

        let pos = self.current_position();
        Err(LexerError::UnexpectedCharacter {
            ch: self.ch,
            line: pos.line_number(),
            column: pos.column_number(),
        })
    }

    /// Measure leading whitespace of a fresh logical line and queue
    /// INDENT/DEDENT tokens. Blank and comment-only lines are ignored.
    fn read_indentation(&mut self) -> Result<Option<Token>, LexerError> {
        self.start_token();
        let mut col = 0;
        loop {
            match self.ch {
                ' ' => col += 1,
                '\t' => col = (col / 8 + 1) * 8,
                '\x0c' => col = 0,
                _ => break,
            }
            self.read_char();
        }
        if matches!(self.ch, '#' | '\n' | '\r' | '\0') {
            return Ok(None);
        }

        let current = self.indents.last().copied().unwrap_or(0);
        if col > current {
            self.indents.push(col);
            let text = self.source_text();
            return Ok(Some(self.make_token(TokenKind::Indent, text)));
        }
        if col < current {
            while self.indents.last().is_some_and(|&level| level > col) {
                self.indents.pop();
                let tok = self.make_token(TokenKind::Dedent, "");
                self.pending.push_back(tok);
            }
            if self.indents.last().copied().unwrap_or(0) != col {
                return Err(LexerError::InconsistentDedent {
                    line: self.current_position().line_number(),
                });
            }
            return Ok(self.pending.pop_front());
        }
        Ok(None)
    }

    /// Queue the closing NEWLINE, outstanding DEDENTs and the end marker.
    fn finish(&mut self) -> Token {
        self.finished = true;
        if self.line_has_content {
            self.line_has_content = false;
            let tok = self.make_token(TokenKind::Newline, "");
            self.pending.push_back(tok);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            let tok = self.make_token(TokenKind::Dedent, "");
            self.pending.push_back(tok);
        }
        let end = self.make_token(TokenKind::EndMarker, "");
        self.pending.push_back(end);
        self.pending
            .pop_front()
            .unwrap_or_else(|| self.make_token(TokenKind::EndMarker, ""))
    }

    /// Read a string literal. Any prefix letters have already been consumed;
    /// the token text keeps prefix and quotes verbatim.
    fn read_string(&mut self) -> Result<Token, LexerError> {
        let quote = self.ch;
        let triple = self.peek_char_n(1) == quote && self.peek_char_n(2) == quote;
        let quote_len = if triple { 3 } else { 1 };
        for _ in 0..quote_len {
            self.read_char();
        }

        loop {
            match self.ch {
                '\0' => {
                    return Err(LexerError::UnterminatedString {
                        line: self.token_start.line_number(),
                        column: self.token_start.column_number(),
                    });
                }
                '\\' => {
                    self.read_char();
                    if matches!(self.ch, '\n' | '\r') {
                        self.consume_newline();
                    } else if self.ch != '\0' {
                        self.read_char();
                    }
                }
                '\n' | '\r' => {
                    if !triple {
                        return Err(LexerError::UnterminatedString {
                            line: self.token_start.line_number(),
                            column: self.token_start.column_number(),
                        });
                    }
                    self.consume_newline();
                }
                c if c == quote => {
                    if !triple {
                        self.read_char();
                        break;
                    }
                    if self.peek_char_n(1) == quote && self.peek_char_n(2) == quote {
                        self.read_char();
                        self.read_char();
                        self.read_char();
                        break;
                    }
                    self.read_char();
                }
                _ => self.read_char(),
            }
        }

        let text = self.source_text();
        Ok(self.make_token(TokenKind::String, text))
    }

    /// Read a number literal (int, float, imaginary; hex, octal, binary).
    fn read_number(&mut self) -> Result<Token, LexerError> {
        if self.ch == '0' && matches!(self.peek_char_n(1), 'x' | 'X' | 'o' | 'O' | 'b' | 'B') {
            self.read_char();
            self.read_char();
            while self.ch.is_ascii_hexdigit() || self.ch == '_' {
                self.read_char();
            }
        } else {
            while self.ch.is_ascii_digit() || self.ch == '_' {
                self.read_char();
            }
            if self.ch == '.' {
                self.read_char();
                while self.ch.is_ascii_digit() || self.ch == '_' {
                    self.read_char();
                }
            }
            if matches!(self.ch, 'e' | 'E') {
                self.read_char();
                if matches!(self.ch, '+' | '-') {
                    self.read_char();
                }
                while self.ch.is_ascii_digit() {
                    self.read_char();
                }
            }
            if matches!(self.ch, 'j' | 'J') {
                self.read_char();
            }
        }

        let text = self.source_text();
        if is_name_continue(self.ch) {
            let pos = self.current_position();
            return Err(LexerError::InvalidNumber {
                literal: format!("{}{}", text, self.ch),
                line: pos.line_number(),
                column: pos.column_number(),
            });
        }
        Ok(self.make_token(TokenKind::Number, text))
    }

    /// Read an operator or delimiter using longest match.
    fn read_operator(&mut self) -> Option<Token> {
        let op = OPERATORS.iter().find(|op| {
            op.chars()
                .enumerate()
                .all(|(i, c)| self.peek_char_n(i) == c)
        })?;
        for _ in 0..op.len() {
            self.read_char();
        }
        match *op {
            "(" | "[" | "{" => self.paren_level += 1,
            ")" | "]" | "}" => self.paren_level = self.paren_level.saturating_sub(1),
            _ => {}
        }
        Some(self.make_token(TokenKind::Op, *op))
    }
}

impl TokenSource for Lexer {
    fn next_token(&mut self) -> Result<Token, LexerError> {
        Lexer::next_token(self)
    }
}

fn is_name_start(ch: char) -> bool {
    ch.is_alphabetic() || ch == '_'
}

fn is_name_continue(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_'
}

fn is_string_prefix(text: &str) -> bool {
    matches!(
        text.to_ascii_lowercase().as_str(),
        "r" | "u" | "b" | "f" | "br" | "rb" | "fr" | "rf"
    )
}

/// Tokenize an input string into a vector of tokens, ending with `EndMarker`.
pub fn tokenize(input: &str) -> Result<Vec<Token>, LexerError> {
    let mut lexer = Lexer::new(input);
    let mut tokens = Vec::new();
    loop {
        let tok = lexer.next_token()?;
        let is_end = tok.kind == TokenKind::EndMarker;
        tokens.push(tok);
        if is_end {
            break;
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input).unwrap().iter().map(|t| t.kind).collect()
    }

    fn texts(input: &str) -> Vec<String> {
        tokenize(input)
            .unwrap()
            .into_iter()
            .filter(|t| matches!(t.kind, TokenKind::Name | TokenKind::Op | TokenKind::Number))
            .map(|t| t.text)
            .collect()
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(kinds(""), vec![TokenKind::EndMarker]);
    }

    #[test]
    fn test_simple_statement() {
        use TokenKind::*;
        assert_eq!(kinds("x = 1\n"), vec![Name, Op, Number, Newline, EndMarker]);
        // Missing trailing newline still closes the logical line
        assert_eq!(kinds("x = 1"), vec![Name, Op, Number, Newline, EndMarker]);
    }

    #[test]
    fn test_indent_dedent() {
        use TokenKind::*;
        let src = "if x:\n    y\n    z\nw\n";
        assert_eq!(
            kinds(src),
            vec![
                Name, Name, Op, Newline, Indent, Name, Newline, Name, Newline, Dedent, Name,
                Newline, EndMarker
            ]
        );
    }

    #[test]
    fn test_dedent_at_eof() {
        use TokenKind::*;
        let src = "def f():\n  if a:\n    b";
        let toks = kinds(src);
        assert_eq!(&toks[toks.len() - 4..], &[Newline, Dedent, Dedent, EndMarker]);
    }

    #[test]
    fn test_inconsistent_dedent() {
        let err = tokenize("if x:\n    y\n  z\n").unwrap_err();
        assert!(matches!(err, LexerError::InconsistentDedent { line: 3 }));
    }

    #[test]
    fn test_blank_and_comment_lines() {
        use TokenKind::*;
        let src = "x\n\n   # note\ny\n";
        assert_eq!(
            kinds(src),
            vec![Name, Newline, Nl, Comment, Nl, Name, Newline, EndMarker]
        );
    }

    #[test]
    fn test_brackets_join_lines() {
        use TokenKind::*;
        let src = "f(a,\n      b)\n";
        assert_eq!(
            kinds(src),
            vec![Name, Op, Name, Op, Nl, Name, Op, Newline, EndMarker]
        );
    }

    #[test]
    fn test_backslash_continuation() {
        assert_eq!(texts("x = 1 + \\\n    2\n"), vec!["x", "=", "1", "+", "2"]);
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            texts("0x1F 0o17 0b101 1_000 3.14 .5 1e10 2.5E-3 4j"),
            vec!["0x1F", "0o17", "0b101", "1_000", "3.14", ".5", "1e10", "2.5E-3", "4j"]
        );
    }

    #[test]
    fn test_invalid_number() {
        assert!(matches!(
            tokenize("12abc"),
            Err(LexerError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn test_operators_longest_match() {
        assert_eq!(
            texts("a **= b // c >>= d != e -> f ... g"),
            vec!["a", "**=", "b", "//", "c", ">>=", "d", "!=", "e", "->", "f", "...", "g"]
        );
    }

    #[test]
    fn test_strings_keep_source_text() {
        let toks = tokenize(r#"s = b'ab\'c' + r"x\y" + '''multi
line'''"#)
        .unwrap();
        let strings: Vec<_> = toks
            .iter()
            .filter(|t| t.kind == TokenKind::String)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(strings, vec![r"b'ab\'c'", r#"r"x\y""#, "'''multi\nline'''"]);
    }

    #[test]
    fn test_unterminated_string() {
        assert!(matches!(
            tokenize("'abc\n"),
            Err(LexerError::UnterminatedString { line: 1, .. })
        ));
        assert!(matches!(
            tokenize("\"\"\"abc"),
            Err(LexerError::UnterminatedString { .. })
        ));
    }

    #[test]
    fn test_unexpected_character() {
        assert!(matches!(
            tokenize("a ? b"),
            Err(LexerError::UnexpectedCharacter { ch: '?', .. })
        ));
    }

    #[test]
    fn test_position_tracking() {
        let toks = tokenize("a\n  \nbc = 1\n").unwrap();
        let bc = toks.iter().find(|t| t.text == "bc").unwrap();
        assert_eq!(bc.line(), 3);
        assert_eq!(bc.start.column, 0);
        let one = toks.iter().find(|t| t.text == "1").unwrap();
        assert_eq!(one.start.column_number(), 6);
    }

    #[test]
    fn test_crlf() {
        use TokenKind::*;
        assert_eq!(kinds("a\r\nb\r\n"), vec![Name, Newline, Name, Newline, EndMarker]);
    }

    #[test]
    fn test_token_stream_ends_with_marker() {
        let mut stream = TokenStream::new(vec![]);
        assert_eq!(stream.next_token().unwrap().kind, TokenKind::EndMarker);
        assert_eq!(stream.next_token().unwrap().kind, TokenKind::EndMarker);
    }
}
