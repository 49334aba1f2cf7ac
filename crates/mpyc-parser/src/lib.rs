//! mpyc parser - AST construction for the Python subset accepted by mpyc.
//!
//! The parser consumes any [`mpyc_lexer::TokenSource`], builds the AST with
//! a recursive-descent statement grammar and Pratt expression parsing, and
//! then runs a single pass that tags assignment and deletion targets.

pub mod ast;
pub mod context;
pub mod parser;
pub mod precedence;

pub use ast::*;
pub use context::tag_targets;
pub use parser::{MAX_NESTING, parse, parse_tokens, Parser, ParserError};
pub use precedence::Precedence;
