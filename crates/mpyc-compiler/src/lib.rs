//! mpyc compiler - symbol tables and bytecode generation.
//!
//! This crate resolves every name of a parsed module to its runtime access
//! form and then walks the AST, producing one [`mpyc_bytecode::CodeObject`]
//! per lexical scope.

pub mod compiler;
pub mod symbol_table;

pub use compiler::{compile, Compiler, CompilerConfig, CompilerError};
pub use symbol_table::{
    Access, Layout, ScopeKind, Symbol, SymbolTable, SymbolTableError, SymbolTables,
};
