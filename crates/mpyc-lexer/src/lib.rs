//! mpyc lexer - tokenization of Python source for the mpyc compiler.
//!
//! The parser only depends on the [`TokenSource`] trait; [`Lexer`] is the
//! concrete indentation-aware implementation.
//!
//! # Example
//!
//! ```
//! use mpyc_lexer::{Lexer, TokenKind};
//!
//! let mut lexer = Lexer::new("x = 42\n");
//! let token = lexer.next_token().unwrap();
//! assert_eq!(token.kind, TokenKind::Name);
//! assert_eq!(token.text, "x");
//! ```

pub mod lexer;
pub mod literal;
pub mod token;

pub use lexer::{tokenize, Lexer, LexerError, TokenSource, TokenStream};
pub use literal::{decode_number, decode_string, NumberValue, StringLiteral, StringValue};
pub use token::{is_keyword, Position, Token, TokenKind, KEYWORDS};
