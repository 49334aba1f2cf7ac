//! Decoding of STRING and NUMBER token text into values.

use crate::lexer::LexerError;

/// Decoded payload of a string literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StringValue {
    Text(String),
    Bytes(Vec<u8>),
}

/// A decoded string literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringLiteral {
    pub value: StringValue,
    /// Set for `f"..."` literals; the body is kept undecoded.
    pub formatted: bool,
}

/// Decoded numeric literal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumberValue {
    Int(i128),
    Float(f64),
    /// Imaginary literal such as `2j`; holds the imaginary part.
    Imaginary(f64),
}

/// Decode the source text of a STRING token.
///
/// `line` and `column` locate the token for error reporting.
pub fn decode_string(text: &str, line: usize, column: usize) -> Result<StringLiteral, LexerError> {
    let quote_at = text
        .find(['\'', '"'])
        .ok_or(LexerError::UnterminatedString { line, column })?;
    let prefix = text[..quote_at].to_ascii_lowercase();
    let raw = prefix.contains('r');
    let bytes = prefix.contains('b');
    let formatted = prefix.contains('f');

    let quoted = &text[quote_at..];
    let quote_len = if quoted.len() >= 6 && (quoted.starts_with("'''") || quoted.starts_with("\"\"\""))
    {
        3
    } else {
        1
    };
    if quoted.len() < 2 * quote_len {
        return Err(LexerError::UnterminatedString { line, column });
    }
    let body = &quoted[quote_len..quoted.len() - quote_len];

    let mut decoder = EscapeDecoder {
        chars: body.chars().collect(),
        pos: 0,
        line,
        column,
    };

    let value = if bytes {
        StringValue::Bytes(decoder.decode_bytes(raw)?)
    } else if raw || formatted {
        StringValue::Text(decoder.decode_raw())
    } else {
        StringValue::Text(decoder.decode_text()?)
    };

    Ok(StringLiteral { value, formatted })
}

struct EscapeDecoder {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
}

impl EscapeDecoder {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn error(&self) -> LexerError {
        LexerError::InvalidEscape {
            line: self.line,
            column: self.column,
        }
    }

    /// Raw and formatted bodies are kept verbatim.
    fn decode_raw(&mut self) -> String {
        let mut out = String::new();
        while let Some(c) = self.next() {
            out.push(c);
        }
        out
    }

    fn decode_text(&mut self) -> Result<String, LexerError> {
        let mut out = String::new();
        while let Some(c) = self.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match self.read_common_escape()? {
                Escaped::Char(ch) => out.push(ch),
                Escaped::Nothing => {}
                Escaped::Unknown(ch) => {
                    match ch {
                        'u' => out.push(self.read_hex_escape(4)?),
                        'U' => out.push(self.read_hex_escape(8)?),
                        'N' => return Err(self.error()),
                        _ => {
                            out.push('\\');
                            out.push(ch);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn decode_bytes(&mut self, raw: bool) -> Result<Vec<u8>, LexerError> {
        let mut out = Vec::new();
        while let Some(c) = self.next() {
            if !c.is_ascii() {
                return Err(self.error());
            }
            if c != '\\' || raw {
                out.push(c as u8);
                continue;
            }
            match self.read_common_escape()? {
                Escaped::Char(ch) => out.push(ch as u32 as u8),
                Escaped::Nothing => {}
                Escaped::Unknown(ch) => {
                    out.push(b'\\');
                    out.push(ch as u8);
                }
            }
        }
        Ok(out)
    }

    /// Escapes shared by text and bytes literals.
    fn read_common_escape(&mut self) -> Result<Escaped, LexerError> {
        let Some(ch) = self.next() else {
            return Err(self.error());
        };
        let esc = match ch {
            '\n' => Escaped::Nothing,
            '\r' => {
                if self.peek() == Some('\n') {
                    self.pos += 1;
                }
                Escaped::Nothing
            }
            'n' => Escaped::Char('\n'),
            'r' => Escaped::Char('\r'),
            't' => Escaped::Char('\t'),
            '\\' => Escaped::Char('\\'),
            '"' => Escaped::Char('"'),
            '\'' => Escaped::Char('\''),
            'a' => Escaped::Char('\x07'),
            'b' => Escaped::Char('\x08'),
            'f' => Escaped::Char('\x0C'),
            'v' => Escaped::Char('\x0B'),
            '0'..='7' => Escaped::Char(self.read_octal_escape(ch)),
            'x' => Escaped::Char(self.read_hex_escape(2)?),
            other => Escaped::Unknown(other),
        };
        Ok(esc)
    }

    fn read_octal_escape(&mut self, first_digit: char) -> char {
        let mut value = first_digit.to_digit(8).unwrap_or(0);
        for _ in 0..2 {
            match self.peek().and_then(|c| c.to_digit(8)) {
                Some(d) => {
                    value = value * 8 + d;
                    self.pos += 1;
                }
                None => break,
            }
        }
        char::from_u32(value).unwrap_or('\u{FFFD}')
    }

    fn read_hex_escape(&mut self, n: usize) -> Result<char, LexerError> {
        let mut value = 0u32;
        for _ in 0..n {
            let digit = self
                .next()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| self.error())?;
            value = value * 16 + digit;
        }
        char::from_u32(value).ok_or_else(|| self.error())
    }
}

enum Escaped {
    Char(char),
    Nothing,
    Unknown(char),
}

/// Decode the source text of a NUMBER token.
pub fn decode_number(text: &str, line: usize, column: usize) -> Result<NumberValue, LexerError> {
    let invalid = || LexerError::InvalidNumber {
        literal: text.to_string(),
        line,
        column,
    };
    let clean: String = text.chars().filter(|&c| c != '_').collect();
    let lower = clean.to_ascii_lowercase();

    let radix = match lower.get(..2) {
        Some("0x") => Some(16),
        Some("0o") => Some(8),
        Some("0b") => Some(2),
        _ => None,
    };
    if let Some(radix) = radix {
        return i128::from_str_radix(&lower[2..], radix)
            .map(NumberValue::Int)
            .map_err(|_| invalid());
    }

    if let Some(imag) = lower.strip_suffix('j') {
        return imag
            .parse::<f64>()
            .map(NumberValue::Imaginary)
            .map_err(|_| invalid());
    }

    if lower.contains(['.', 'e']) {
        return lower
            .parse::<f64>()
            .map(NumberValue::Float)
            .map_err(|_| invalid());
    }

    // Python forbids leading zeros on non-zero decimal integers
    if lower.len() > 1 && lower.starts_with('0') && lower.chars().any(|c| c != '0') {
        return Err(invalid());
    }
    lower.parse::<i128>().map(NumberValue::Int).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(src: &str) -> String {
        match decode_string(src, 1, 1).unwrap().value {
            StringValue::Text(s) => s,
            other => panic!("expected text, got {:?}", other),
        }
    }

    fn bytes(src: &str) -> Vec<u8> {
        match decode_string(src, 1, 1).unwrap().value {
            StringValue::Bytes(b) => b,
            other => panic!("expected bytes, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_strings() {
        assert_eq!(text("'hello'"), "hello");
        assert_eq!(text("\"it's\""), "it's");
        assert_eq!(text("''"), "");
        assert_eq!(text("'''a\nb'''"), "a\nb");
    }

    #[test]
    fn test_escape_sequences() {
        assert_eq!(text(r"'a\nb\tc'"), "a\nb\tc");
        assert_eq!(text(r"'\x41\101é'"), "AAé");
        assert_eq!(text(r"'\q'"), "\\q");
        assert_eq!(text("'a\\\nb'"), "ab");
    }

    #[test]
    fn test_raw_strings() {
        assert_eq!(text(r"r'\n'"), "\\n");
        assert_eq!(text(r"R'\d+'"), "\\d+");
    }

    #[test]
    fn test_bytes() {
        assert_eq!(bytes(r"b'\x00ab'"), vec![0, b'a', b'b']);
        assert_eq!(bytes(r"rb'\x'"), b"\\x".to_vec());
        assert!(decode_string("b'é'", 1, 1).is_err());
    }

    #[test]
    fn test_formatted_flag() {
        let lit = decode_string("f'{x}'", 1, 1).unwrap();
        assert!(lit.formatted);
    }

    #[test]
    fn test_invalid_hex_escape() {
        assert!(matches!(
            decode_string(r"'\xZZ'", 3, 4),
            Err(LexerError::InvalidEscape { line: 3, column: 4 })
        ));
    }

    #[test]
    fn test_numbers() {
        assert_eq!(decode_number("42", 1, 1).unwrap(), NumberValue::Int(42));
        assert_eq!(decode_number("0xff", 1, 1).unwrap(), NumberValue::Int(255));
        assert_eq!(decode_number("0o17", 1, 1).unwrap(), NumberValue::Int(15));
        assert_eq!(decode_number("0b1010", 1, 1).unwrap(), NumberValue::Int(10));
        assert_eq!(decode_number("1_000", 1, 1).unwrap(), NumberValue::Int(1000));
        assert_eq!(decode_number("2.5", 1, 1).unwrap(), NumberValue::Float(2.5));
        assert_eq!(decode_number("1e3", 1, 1).unwrap(), NumberValue::Float(1000.0));
        assert_eq!(decode_number("3j", 1, 1).unwrap(), NumberValue::Imaginary(3.0));
        assert_eq!(decode_number("0", 1, 1).unwrap(), NumberValue::Int(0));
        assert_eq!(decode_number("000", 1, 1).unwrap(), NumberValue::Int(0));
    }

    #[test]
    fn test_invalid_numbers() {
        assert!(decode_number("012", 1, 1).is_err());
        assert!(decode_number("0b102", 1, 1).is_err());
    }
}
