//! Tree-walking bytecode compiler.
//!
//! One [`CodeBuilder`] is active per lexical scope. Scopes are kept on an
//! explicit stack owned by the [`Compiler`]; each scope carries its own stack
//! of loop frames so `break`/`continue` never leak across a `def`.

use crate::symbol_table::{Access, ScopeKind, SymbolTable, SymbolTableError, SymbolTables};
use mpyc_bytecode::{
    BinaryOp, BuildError, CodeBuilder, CodeObject, Constant, Label, Op, ScopeFlags, ScopeInfo,
    UnaryOp,
};
use mpyc_lexer::StringValue;
use mpyc_parser::*;
use thiserror::Error;
use tracing::debug;

/// Compilation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompilerError {
    #[error("{message} at line {line}")]
    Syntax { message: String, line: usize },

    #[error("unsupported construct: {construct} at line {line}")]
    Unsupported { construct: String, line: usize },

    #[error("value {value} out of range at line {line}")]
    ValueOutOfRange { value: String, line: usize },

    #[error("{0}")]
    Binding(#[from] SymbolTableError),

    #[error("{0}")]
    Build(#[from] BuildError),
}

impl CompilerError {
    fn syntax(message: impl Into<String>, line: usize) -> Self {
        Self::Syntax {
            message: message.into(),
            line,
        }
    }

    fn out_of_range(value: impl ToString, line: usize) -> Self {
        Self::ValueOutOfRange {
            value: value.to_string(),
            line,
        }
    }
}

/// Compiler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerConfig {
    /// Source filename recorded in every code object.
    pub filename: String,
    /// Emit an inline-cache byte after cached name and attribute lookups.
    pub cache_lookups: bool,
    /// Width in bits of integers the target VM stores inline.
    pub small_int_bits: u8,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            filename: "<stdin>".to_string(),
            cache_lookups: false,
            small_int_bits: 31,
        }
    }
}

/// Number of operand-stack slots a `for` loop keeps for its iterator.
const ITER_BUF_SLOTS: i32 = 4;

/// Unwind-depth flag telling `UNWIND_JUMP` to also drop a `for` iterator.
const UNWIND_FROM_FOR: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    While,
    For,
}

#[derive(Debug, Clone, Copy)]
struct LoopFrame {
    kind: LoopKind,
    continue_label: Label,
    break_label: Label,
    /// Exception depth when the loop was entered.
    exc_depth: u32,
}

struct ScopeFrame<'a> {
    table: &'a SymbolTable,
    builder: CodeBuilder,
    loops: Vec<LoopFrame>,
}

/// Body of a scope being compiled, with what its prelude needs.
#[derive(Clone, Copy)]
enum ScopeBody<'b> {
    Module(&'b [Stmt]),
    Function(&'b Arguments, &'b [Stmt]),
    Lambda(&'b Arguments, &'b Expr),
    Class(&'b str, &'b [Stmt]),
}

/// Bytecode compiler for one module.
pub struct Compiler<'a> {
    config: &'a CompilerConfig,
    tables: &'a SymbolTables,
    scopes: Vec<ScopeFrame<'a>>,
}

impl<'a> Compiler<'a> {
    pub fn new(config: &'a CompilerConfig, tables: &'a SymbolTables) -> Self {
        Self {
            config,
            tables,
            scopes: Vec::new(),
        }
    }

    /// Compile `module` into its root code object.
    pub fn compile_module(mut self, module: &Module) -> Result<CodeObject, CompilerError> {
        self.compile_scope(module.id, "<module>", ScopeBody::Module(&module.body), 1)
    }

    // ===========================================================================
    // Scope Management
    // ===========================================================================

    fn frame(&self) -> &ScopeFrame<'a> {
        match self.scopes.last() {
            Some(frame) => frame,
            None => unreachable!("no active scope"),
        }
    }

    fn frame_mut(&mut self) -> &mut ScopeFrame<'a> {
        match self.scopes.last_mut() {
            Some(frame) => frame,
            None => unreachable!("no active scope"),
        }
    }

    fn table(&self) -> &'a SymbolTable {
        self.frame().table
    }

    fn b(&mut self) -> &mut CodeBuilder {
        &mut self.frame_mut().builder
    }

    fn lookup_table(&self, id: NodeId) -> &'a SymbolTable {
        match self.tables.get(id) {
            Some(table) => table,
            None => panic!("no symbol table for scope node {}", id),
        }
    }

    fn compile_scope(
        &mut self,
        id: NodeId,
        name: &str,
        body: ScopeBody<'_>,
        line: usize,
    ) -> Result<CodeObject, CompilerError> {
        let table = self.lookup_table(id);
        debug!(scope = %name, id, "entering scope");
        self.scopes.push(ScopeFrame {
            table,
            builder: CodeBuilder::new(self.config.cache_lookups),
            loops: Vec::new(),
        });
        let result = self.compile_scope_body(body, line);
        let frame = match self.scopes.pop() {
            Some(frame) => frame,
            None => unreachable!("scope stack underflow"),
        };
        result?;
        let info = self.scope_info(frame.table, name, body, line)?;
        Ok(frame.builder.finish(info)?)
    }

    fn compile_scope_body(&mut self, body: ScopeBody<'_>, line: usize) -> Result<(), CompilerError> {
        match body {
            ScopeBody::Module(stmts) => {
                self.compile_block(stmts)?;
                self.return_none();
            }
            ScopeBody::Function(_, stmts) => {
                self.compile_block(stmts)?;
                if !matches!(stmts.last(), Some(Stmt::Return(_))) {
                    self.return_none();
                }
            }
            ScopeBody::Lambda(_, expr) => {
                self.b().set_line(line as u32);
                self.compile_expr(expr)?;
                if self.table().is_generator() {
                    self.b().emit(Op::PopTop);
                    self.b().emit(Op::LoadConstNone);
                }
                self.b().emit(Op::ReturnValue);
            }
            ScopeBody::Class(name, stmts) => {
                self.b().set_line(line as u32);
                self.load_name("__name__");
                self.store_name("__module__");
                self.b().emit_qstr(Op::LoadConstString, name);
                self.store_name("__qualname__");
                self.compile_block(stmts)?;
                self.return_none();
            }
        }
        Ok(())
    }

    fn return_none(&mut self) {
        self.b().emit(Op::LoadConstNone);
        self.b().emit(Op::ReturnValue);
    }

    /// Prelude facts of a finished scope.
    fn scope_info(
        &self,
        table: &SymbolTable,
        name: &str,
        body: ScopeBody<'_>,
        line: usize,
    ) -> Result<ScopeInfo, CompilerError> {
        let mut argnames: Vec<String> = table.upvals().to_vec();
        let mut flags = ScopeFlags::empty();
        let mut n_pos_args = argnames.len();
        let mut n_kwonly_args = 0;
        let mut n_def_pos_args = 0;

        if let ScopeBody::Function(args, _) | ScopeBody::Lambda(args, _) = body {
            argnames.extend(args.args.iter().map(|a| a.name.clone()));
            argnames.extend(args.kwonlyargs.iter().map(|a| a.name.clone()));
            n_pos_args += args.args.len();
            n_kwonly_args = args.kwonlyargs.len();
            n_def_pos_args = args.defaults.len();
            flags.set(ScopeFlags::VARARGS, args.vararg.is_some());
            flags.set(ScopeFlags::VARKEYWORDS, args.kwarg.is_some());
            flags.set(ScopeFlags::DEFKWARGS, has_kw_defaults(args));
            flags.set(ScopeFlags::GENERATOR, table.is_generator());
        }

        let cells = table
            .cell_slots()
            .into_iter()
            .map(|slot| u8::try_from(slot).map_err(|_| CompilerError::out_of_range(slot, line)))
            .collect::<Result<Vec<u8>, _>>()?;

        Ok(ScopeInfo {
            name: name.to_string(),
            filename: self.config.filename.clone(),
            flags,
            n_locals: table.n_locals(),
            n_pos_args: n_pos_args as u32,
            n_kwonly_args: n_kwonly_args as u32,
            n_def_pos_args: n_def_pos_args as u32,
            argnames,
            cells,
        })
    }

    // ===========================================================================
    // Statement Compilation
    // ===========================================================================

    fn compile_block(&mut self, stmts: &[Stmt]) -> Result<(), CompilerError> {
        for stmt in stmts {
            let line = stmt.line();
            debug!(scope = %self.table().name(), line, stmt = %stmt, "compiling statement");
            let depth = self.b().stack_depth();
            self.b().set_line(line as u32);
            self.compile_statement(stmt)?;
            let after = self.b().stack_depth();
            assert_eq!(
                after, depth,
                "operand stack imbalance after statement at line {}",
                line
            );
        }
        Ok(())
    }

    fn compile_statement(&mut self, stmt: &Stmt) -> Result<(), CompilerError> {
        let line = stmt.line();
        match stmt {
            Stmt::Expr(s) => self.compile_expr_stmt(&s.value),
            Stmt::Assign(s) => {
                self.compile_expr(&s.value)?;
                if let Some((last, rest)) = s.targets.split_last() {
                    for target in rest {
                        self.b().emit(Op::DupTop);
                        self.compile_store(target, line)?;
                    }
                    self.compile_store(last, line)?;
                }
                Ok(())
            }
            Stmt::AugAssign(s) => self.compile_aug_assign(s, line),
            Stmt::If(s) => self.compile_if(s),
            Stmt::While(s) => self.compile_while(s),
            Stmt::For(s) => self.compile_for(s, line),
            Stmt::With(s) => self.compile_with(&s.items, &s.body, line),
            Stmt::Try(s) => {
                if s.finalbody.is_empty() {
                    self.compile_try_except(s)
                } else {
                    self.compile_try_finally(s)
                }
            }
            Stmt::FunctionDef(def) => self.compile_function_def(def, line),
            Stmt::ClassDef(def) => self.compile_class_def(def, line),
            Stmt::Return(s) => {
                if self.table().kind() != ScopeKind::Function {
                    return Err(CompilerError::syntax("'return' outside function", line));
                }
                match &s.value {
                    Some(value) => self.compile_expr(value)?,
                    None => self.b().emit(Op::LoadConstNone),
                }
                self.b().emit(Op::ReturnValue);
                Ok(())
            }
            Stmt::Delete(s) => {
                for target in &s.targets {
                    self.compile_delete(target, line)?;
                }
                Ok(())
            }
            Stmt::Raise(s) => self.compile_raise(s),
            Stmt::Assert(s) => self.compile_assert(s),
            Stmt::Import(s) => self.compile_import(s),
            Stmt::ImportFrom(s) => self.compile_import_from(s),
            Stmt::Break(_) => self.compile_break(line),
            Stmt::Continue(_) => self.compile_continue(line),
            Stmt::Global(_) | Stmt::Nonlocal(_) | Stmt::Pass(_) => Ok(()),
        }
    }

    fn compile_expr_stmt(&mut self, value: &Expr) -> Result<(), CompilerError> {
        // A lone constant (docstrings included) has no effect.
        let lonely_constant = match value {
            Expr::Int(_) | Expr::Float(_) | Expr::Imaginary(_) | Expr::Constant(_) => true,
            Expr::Str(s) => !s.formatted,
            _ => false,
        };
        if lonely_constant {
            return Ok(());
        }
        self.compile_expr(value)?;
        self.b().emit(Op::PopTop);
        Ok(())
    }

    fn compile_aug_assign(&mut self, s: &AugAssignStmt, line: usize) -> Result<(), CompilerError> {
        let op = binary_op(s.op).inplace();
        match &s.target {
            Expr::Name(name) => {
                self.load_name(&name.id);
                self.compile_expr(&s.value)?;
                self.b().emit_binary(op);
                self.store_name(&name.id);
            }
            Expr::Attribute(attr) => {
                self.compile_expr(&attr.value)?;
                self.b().emit(Op::DupTop);
                self.b().emit_qstr(Op::LoadAttr, &attr.attr);
                self.compile_expr(&s.value)?;
                self.b().emit_binary(op);
                self.b().emit(Op::RotTwo);
                self.b().emit_qstr(Op::StoreAttr, &attr.attr);
            }
            Expr::Subscript(sub) => {
                self.compile_expr(&sub.value)?;
                self.compile_expr(&sub.index)?;
                self.b().emit(Op::DupTopTwo);
                self.b().emit(Op::LoadSubscr);
                self.compile_expr(&s.value)?;
                self.b().emit_binary(op);
                self.b().emit(Op::RotThree);
                self.b().emit(Op::StoreSubscr);
            }
            _ => {
                return Err(CompilerError::syntax(
                    "illegal expression for augmented assignment",
                    line,
                ));
            }
        }
        Ok(())
    }

    fn compile_if(&mut self, s: &IfStmt) -> Result<(), CompilerError> {
        let else_label = self.b().new_label();
        self.compile_jump_if(&s.test, false, else_label)?;
        self.compile_block(&s.body)?;
        if s.orelse.is_empty() {
            self.b().place_label(else_label);
        } else {
            let end = self.b().new_label();
            self.b().emit_jump(Op::Jump, end);
            self.b().place_label(else_label);
            self.compile_block(&s.orelse)?;
            self.b().place_label(end);
        }
        Ok(())
    }

    fn compile_while(&mut self, s: &WhileStmt) -> Result<(), CompilerError> {
        let continue_label = self.b().new_label();
        let break_label = self.b().new_label();
        let top = self.b().new_label();

        let always = matches!(&s.test, Expr::Constant(c) if c.value == Singleton::True);
        if !always {
            self.b().emit_jump(Op::Jump, continue_label);
        }
        self.b().place_label(top);
        self.push_loop(LoopKind::While, continue_label, break_label);
        let body = self.compile_block(&s.body);
        self.pop_loop();
        body?;
        self.b().place_label(continue_label);
        self.compile_jump_if(&s.test, true, top)?;

        // break/continue in the else block belong to an outer loop.
        self.compile_block(&s.orelse)?;
        self.b().place_label(break_label);
        Ok(())
    }

    fn compile_for(&mut self, s: &ForStmt, line: usize) -> Result<(), CompilerError> {
        let continue_label = self.b().new_label();
        let pop_label = self.b().new_label();
        let break_label = self.b().new_label();

        self.compile_expr(&s.iter)?;
        self.b().emit(Op::GetIterStack);
        self.b().place_label(continue_label);
        self.b().emit_jump(Op::ForIter, pop_label);
        self.compile_store(&s.target, line)?;

        self.push_loop(LoopKind::For, continue_label, break_label);
        let body = self.compile_block(&s.body);
        self.pop_loop();
        body?;

        self.b().emit_jump(Op::Jump, continue_label);
        self.b().place_label(pop_label);
        // FOR_ITER drops the iterator slots when it is exhausted.
        self.b().adjust_stack(-ITER_BUF_SLOTS);
        self.compile_block(&s.orelse)?;
        self.b().place_label(break_label);
        Ok(())
    }

    fn push_loop(&mut self, kind: LoopKind, continue_label: Label, break_label: Label) {
        let exc_depth = self.b().exception_depth();
        self.frame_mut().loops.push(LoopFrame {
            kind,
            continue_label,
            break_label,
            exc_depth,
        });
    }

    fn pop_loop(&mut self) {
        self.frame_mut().loops.pop();
    }

    fn compile_break(&mut self, line: usize) -> Result<(), CompilerError> {
        let Some(frame) = self.frame().loops.last().copied() else {
            return Err(CompilerError::syntax("'break' outside loop", line));
        };
        let depth = self.unwind_depth(&frame, line)?;
        let from_for = frame.kind == LoopKind::For;
        if depth == 0 {
            if from_for {
                for _ in 0..ITER_BUF_SLOTS {
                    self.b().emit(Op::PopTop);
                }
            }
            self.b().emit_jump(Op::Jump, frame.break_label);
            if from_for {
                // Code after the jump is unreachable but still counted.
                self.b().adjust_stack(ITER_BUF_SLOTS);
            }
        } else {
            let flag = if from_for { UNWIND_FROM_FOR } else { 0 };
            self.b().emit_unwind_jump(frame.break_label, depth | flag);
        }
        Ok(())
    }

    fn compile_continue(&mut self, line: usize) -> Result<(), CompilerError> {
        let Some(frame) = self.frame().loops.last().copied() else {
            return Err(CompilerError::syntax("'continue' not properly in loop", line));
        };
        let depth = self.unwind_depth(&frame, line)?;
        if depth == 0 {
            self.b().emit_jump(Op::Jump, frame.continue_label);
        } else {
            self.b().emit_unwind_jump(frame.continue_label, depth);
        }
        Ok(())
    }

    /// Exception blocks a jump to `frame`'s labels has to leave.
    fn unwind_depth(&mut self, frame: &LoopFrame, line: usize) -> Result<u8, CompilerError> {
        let depth = self.b().exception_depth() - frame.exc_depth;
        match u8::try_from(depth) {
            Ok(d) if d < UNWIND_FROM_FOR => Ok(d),
            _ => Err(CompilerError::out_of_range(depth, line)),
        }
    }

    fn compile_with(
        &mut self,
        items: &[WithItem],
        body: &[Stmt],
        line: usize,
    ) -> Result<(), CompilerError> {
        let Some((item, rest)) = items.split_first() else {
            return self.compile_block(body);
        };
        let end = self.b().new_label();
        self.compile_expr(&item.context_expr)?;
        self.b().emit_jump(Op::SetupWith, end);
        self.b().push_exception_block();
        match &item.optional_vars {
            Some(target) => self.compile_store(target, line)?,
            None => self.b().emit(Op::PopTop),
        }
        self.compile_with(rest, body, line)?;

        self.b().emit(Op::LoadConstNone);
        self.b().place_label(end);
        // __exit__ is called with three arguments on top of the saved state.
        self.b().adjust_stack(2);
        self.b().emit(Op::WithCleanup);
        self.b().adjust_stack(-2);
        self.b().pop_exception_block();
        self.b().emit(Op::EndFinally);
        Ok(())
    }

    fn compile_try_finally(&mut self, s: &TryStmt) -> Result<(), CompilerError> {
        let finally_label = self.b().new_label();
        self.b().emit_jump(Op::SetupFinally, finally_label);
        self.b().push_exception_block();

        if s.handlers.is_empty() {
            // Room for the state UNWIND_JUMP saves while running the finally block.
            self.b().adjust_stack(3);
            self.compile_block(&s.body)?;
            self.compile_block(&s.orelse)?;
            self.b().adjust_stack(-3);
        } else {
            self.compile_try_except(s)?;
        }

        self.b().emit(Op::LoadConstNone);
        self.b().place_label(finally_label);
        self.compile_block(&s.finalbody)?;
        self.b().pop_exception_block();
        self.b().emit(Op::EndFinally);
        Ok(())
    }

    fn compile_try_except(&mut self, s: &TryStmt) -> Result<(), CompilerError> {
        let handler_label = self.b().new_label();
        let success_label = self.b().new_label();
        let end = self.b().new_label();

        self.b().emit_jump(Op::SetupExcept, handler_label);
        self.b().push_exception_block();
        self.compile_block(&s.body)?;
        self.b().emit_jump(Op::PopExceptJump, success_label);

        self.b().place_label(handler_label);
        // The raised exception, plus the state a nested UNWIND_JUMP may save.
        self.b().adjust_stack(4);

        for (i, handler) in s.handlers.iter().enumerate() {
            let next_handler = self.b().new_label();
            match &handler.type_ {
                None if i + 1 != s.handlers.len() => {
                    return Err(CompilerError::syntax(
                        "default 'except' must be last",
                        handler.position.line_number(),
                    ));
                }
                None => {}
                Some(type_) => {
                    self.b().emit(Op::DupTop);
                    self.compile_expr(type_)?;
                    self.b().emit_binary(BinaryOp::ExceptionMatch);
                    self.b().emit_jump(Op::PopJumpIfFalse, next_handler);
                }
            }

            match &handler.name {
                None => {
                    self.b().emit(Op::PopTop);
                    self.compile_block(&handler.body)?;
                }
                Some(name) => {
                    self.store_name(name);
                    // The name is unbound when the handler exits, however it exits.
                    let cleanup = self.b().new_label();
                    self.b().emit_jump(Op::SetupFinally, cleanup);
                    self.b().push_exception_block();
                    self.compile_block(&handler.body)?;
                    self.b().emit(Op::LoadConstNone);
                    self.b().place_label(cleanup);
                    self.b().adjust_stack(1);
                    self.b().emit(Op::LoadConstNone);
                    self.store_name(name);
                    self.delete_name(name);
                    self.b().adjust_stack(-1);
                    self.b().pop_exception_block();
                    self.b().emit(Op::EndFinally);
                }
            }

            self.b().emit_jump(Op::PopExceptJump, end);
            self.b().place_label(next_handler);
            self.b().adjust_stack(1);
        }

        self.b().pop_exception_block();
        self.b().emit(Op::EndFinally);
        self.b().adjust_stack(-3);

        self.b().place_label(success_label);
        self.compile_block(&s.orelse)?;
        self.b().place_label(end);
        Ok(())
    }

    fn compile_raise(&mut self, s: &RaiseStmt) -> Result<(), CompilerError> {
        match (&s.exc, &s.cause) {
            (None, _) => self.b().emit(Op::RaiseLast),
            (Some(exc), None) => {
                self.compile_expr(exc)?;
                self.b().emit(Op::RaiseObj);
            }
            (Some(exc), Some(cause)) => {
                self.compile_expr(exc)?;
                self.compile_expr(cause)?;
                self.b().emit(Op::RaiseFrom);
            }
        }
        Ok(())
    }

    fn compile_assert(&mut self, s: &AssertStmt) -> Result<(), CompilerError> {
        let end = self.b().new_label();
        self.compile_jump_if(&s.test, true, end)?;
        self.b().emit_qstr(Op::LoadGlobal, "AssertionError");
        if let Some(msg) = &s.msg {
            self.compile_expr(msg)?;
            self.b().emit_arg(Op::CallFunction, 1);
        }
        self.b().emit(Op::RaiseObj);
        self.b().place_label(end);
        Ok(())
    }

    fn compile_import(&mut self, s: &ImportStmt) -> Result<(), CompilerError> {
        for alias in &s.names {
            self.b().emit_small_int(0);
            self.b().emit(Op::LoadConstNone);
            self.b().emit_qstr(Op::ImportName, &alias.name);
            let mut components = alias.name.split('.');
            let base = components.next().unwrap_or(&alias.name);
            match &alias.asname {
                Some(asname) => {
                    for component in components {
                        self.b().emit_qstr(Op::LoadAttr, component);
                    }
                    self.store_name(asname);
                }
                None => self.store_name(base),
            }
        }
        Ok(())
    }

    fn compile_import_from(&mut self, s: &ImportFromStmt) -> Result<(), CompilerError> {
        let line = s.position.line_number();
        let level = i64::try_from(s.level).map_err(|_| CompilerError::out_of_range(s.level, line))?;
        let module = s.module.as_deref().unwrap_or("");
        self.b().emit_small_int(level);

        if matches!(s.names.as_slice(), [alias] if alias.name == "*") {
            self.b().emit_qstr(Op::LoadConstString, "*");
            self.b().emit_arg(Op::BuildTuple, 1);
            self.b().emit_qstr(Op::ImportName, module);
            self.b().emit(Op::ImportStar);
            return Ok(());
        }

        for alias in &s.names {
            self.b().emit_qstr(Op::LoadConstString, &alias.name);
        }
        self.b().emit_arg(Op::BuildTuple, s.names.len() as u32);
        self.b().emit_qstr(Op::ImportName, module);
        for alias in &s.names {
            self.b().emit_qstr(Op::ImportFrom, &alias.name);
            self.store_name(alias.asname.as_deref().unwrap_or(&alias.name));
        }
        self.b().emit(Op::PopTop);
        Ok(())
    }

    // ===========================================================================
    // Functions and Classes
    // ===========================================================================

    fn compile_function_def(&mut self, def: &FunctionDef, line: usize) -> Result<(), CompilerError> {
        for decorator in &def.decorators {
            self.compile_expr(decorator)?;
        }
        self.make_function(
            def.id,
            &def.name,
            ScopeBody::Function(&def.args, &def.body),
            line,
        )?;
        // Innermost decorator first.
        for _ in &def.decorators {
            self.b().emit_arg(Op::CallFunction, 1);
        }
        self.store_name(&def.name);
        Ok(())
    }

    fn compile_class_def(&mut self, def: &ClassDef, line: usize) -> Result<(), CompilerError> {
        for decorator in &def.decorators {
            self.compile_expr(decorator)?;
        }
        self.b().emit(Op::LoadBuildClass);
        let code = self.compile_scope(def.id, &def.name, ScopeBody::Class(&def.name, &def.body), line)?;
        let n_closed = self.load_closure_cells(self.lookup_table(def.id), line)?;
        self.b().emit_make_function(code, n_closed, false);
        self.b().emit_qstr(Op::LoadConstString, &def.name);
        self.compile_call_args(&def.bases, &def.keywords, 2, false, line)?;
        for _ in &def.decorators {
            self.b().emit_arg(Op::CallFunction, 1);
        }
        self.store_name(&def.name);
        Ok(())
    }

    /// Push a function object for `body`, defaults and closed-over cells included.
    fn make_function(
        &mut self,
        id: NodeId,
        name: &str,
        body: ScopeBody<'_>,
        line: usize,
    ) -> Result<(), CompilerError> {
        let args = match body {
            ScopeBody::Function(args, _) | ScopeBody::Lambda(args, _) => args,
            ScopeBody::Module(_) | ScopeBody::Class(..) => {
                unreachable!("make_function called for a non-function scope")
            }
        };

        let has_kw = has_kw_defaults(args);
        let has_defaults = !args.defaults.is_empty() || has_kw;
        if has_defaults {
            if args.defaults.is_empty() {
                self.b().emit(Op::LoadConstNone);
            } else {
                for default in &args.defaults {
                    self.compile_expr(default)?;
                }
                self.b().emit_arg(Op::BuildTuple, args.defaults.len() as u32);
            }
            if has_kw {
                let count = args.kw_defaults.iter().flatten().count();
                self.b().emit_arg(Op::BuildMap, count as u32);
                for (arg, default) in args.kwonlyargs.iter().zip(&args.kw_defaults) {
                    if let Some(default) = default {
                        self.compile_expr(default)?;
                        self.b().emit_qstr(Op::LoadConstString, &arg.name);
                        self.b().emit(Op::StoreMap);
                    }
                }
            } else {
                self.b().emit(Op::LoadConstNone);
            }
        }

        let code = self.compile_scope(id, name, body, line)?;
        let n_closed = self.load_closure_cells(self.lookup_table(id), line)?;
        self.b().emit_make_function(code, n_closed, has_defaults);
        Ok(())
    }

    /// Load the cells `child` closes over from the current scope's slots.
    fn load_closure_cells(&mut self, child: &SymbolTable, line: usize) -> Result<u8, CompilerError> {
        let table = self.table();
        for name in child.upvals() {
            match table.slot(name) {
                Some(slot) => self.b().emit_load_fast(slot),
                None => unreachable!("'{}' is closed over but has no slot in '{}'", name, table.name()),
            }
        }
        let n = child.upvals().len();
        u8::try_from(n).map_err(|_| CompilerError::out_of_range(n, line))
    }

    // ===========================================================================
    // Name Access
    // ===========================================================================

    fn load_name(&mut self, name: &str) {
        match self.table().access(name) {
            Access::Fast(slot) => self.b().emit_load_fast(slot),
            Access::Deref(slot) => self.b().emit_arg(Op::LoadDeref, slot),
            Access::Global => self.b().emit_qstr(Op::LoadGlobal, name),
            Access::Name => self.b().emit_qstr(Op::LoadName, name),
        }
    }

    fn store_name(&mut self, name: &str) {
        match self.table().access(name) {
            Access::Fast(slot) => self.b().emit_store_fast(slot),
            Access::Deref(slot) => self.b().emit_arg(Op::StoreDeref, slot),
            Access::Global => self.b().emit_qstr(Op::StoreGlobal, name),
            Access::Name => self.b().emit_qstr(Op::StoreName, name),
        }
    }

    fn delete_name(&mut self, name: &str) {
        match self.table().access(name) {
            Access::Fast(slot) => self.b().emit_arg(Op::DeleteFast, slot),
            Access::Deref(slot) => self.b().emit_arg(Op::DeleteDeref, slot),
            Access::Global => self.b().emit_qstr(Op::DeleteGlobal, name),
            Access::Name => self.b().emit_qstr(Op::DeleteName, name),
        }
    }

    // ===========================================================================
    // Assignment Targets
    // ===========================================================================

    /// Store the value on top of the stack into `target`.
    fn compile_store(&mut self, target: &Expr, line: usize) -> Result<(), CompilerError> {
        match target {
            Expr::Name(name) => self.store_name(&name.id),
            Expr::Attribute(attr) => {
                self.compile_expr(&attr.value)?;
                self.b().emit_qstr(Op::StoreAttr, &attr.attr);
            }
            Expr::Subscript(sub) => {
                self.compile_expr(&sub.value)?;
                self.compile_expr(&sub.index)?;
                self.b().emit(Op::StoreSubscr);
            }
            Expr::Tuple(seq) | Expr::List(seq) => self.compile_unpack(&seq.elts, line)?,
            other => {
                return Err(CompilerError::syntax(
                    format!("can't assign to {}", other),
                    line,
                ));
            }
        }
        Ok(())
    }

    fn compile_unpack(&mut self, elts: &[Expr], line: usize) -> Result<(), CompilerError> {
        match elts.iter().position(|e| matches!(e, Expr::Starred(_))) {
            Some(star) => {
                let before = star;
                let after = elts.len() - star - 1;
                if before > 0xff || after > 0xff {
                    return Err(CompilerError::out_of_range(elts.len(), line));
                }
                self.b()
                    .emit_arg(Op::UnpackEx, before as u32 | (after as u32) << 8);
            }
            None => self.b().emit_arg(Op::UnpackSequence, elts.len() as u32),
        }
        for elt in elts {
            match elt {
                Expr::Starred(star) => self.compile_store(&star.value, line)?,
                other => self.compile_store(other, line)?,
            }
        }
        Ok(())
    }

    fn compile_delete(&mut self, target: &Expr, line: usize) -> Result<(), CompilerError> {
        match target {
            Expr::Name(name) => self.delete_name(&name.id),
            Expr::Attribute(attr) => {
                self.compile_expr(&attr.value)?;
                self.b().emit(Op::LoadNull);
                self.b().emit(Op::RotTwo);
                self.b().emit_qstr(Op::StoreAttr, &attr.attr);
            }
            Expr::Subscript(sub) => {
                self.compile_expr(&sub.value)?;
                self.compile_expr(&sub.index)?;
                self.b().emit(Op::LoadNull);
                self.b().emit(Op::RotThree);
                self.b().emit(Op::StoreSubscr);
            }
            Expr::Tuple(seq) | Expr::List(seq) => {
                for elt in &seq.elts {
                    self.compile_delete(elt, line)?;
                }
            }
            other => {
                return Err(CompilerError::syntax(format!("can't delete {}", other), line));
            }
        }
        Ok(())
    }

    // ===========================================================================
    // Expression Compilation
    // ===========================================================================

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), CompilerError> {
        let line = expr.line();
        match expr {
            Expr::Name(name) => self.load_name(&name.id),
            Expr::Int(lit) => self.compile_int(lit.value, line)?,
            Expr::Float(lit) => self.b().emit_const(Constant::Float(lit.value)),
            Expr::Imaginary(lit) => self.b().emit_const(Constant::Complex {
                real: 0.0,
                imag: lit.value,
            }),
            Expr::Str(lit) => {
                if lit.formatted {
                    return Err(CompilerError::Unsupported {
                        construct: "formatted string literal".to_string(),
                        line,
                    });
                }
                let constant = match &lit.value {
                    StringValue::Text(s) => Constant::Str(s.clone()),
                    StringValue::Bytes(b) => Constant::Bytes(b.clone()),
                };
                self.b().emit_const(constant);
            }
            Expr::Constant(lit) => match lit.value {
                Singleton::None => self.b().emit(Op::LoadConstNone),
                Singleton::True => self.b().emit(Op::LoadConstTrue),
                Singleton::False => self.b().emit(Op::LoadConstFalse),
                Singleton::Ellipsis => self.b().emit_const(Constant::Ellipsis),
            },
            Expr::BinOp(e) => {
                self.compile_expr(&e.left)?;
                self.compile_expr(&e.right)?;
                self.b().emit_binary(binary_op(e.op));
            }
            Expr::UnaryOp(e) => match (e.op, &e.operand) {
                (UnaryOperator::USub, Expr::Int(lit)) => self.compile_int(-lit.value, line)?,
                _ => {
                    self.compile_expr(&e.operand)?;
                    self.b().emit_unary(unary_op(e.op));
                }
            },
            Expr::BoolOp(e) => self.compile_bool_op(e)?,
            Expr::Compare(e) => self.compile_compare(e)?,
            Expr::Call(e) => self.compile_call(e, line)?,
            Expr::Attribute(e) => {
                self.compile_expr(&e.value)?;
                self.b().emit_qstr(Op::LoadAttr, &e.attr);
            }
            Expr::Subscript(e) => {
                self.compile_expr(&e.value)?;
                self.compile_expr(&e.index)?;
                self.b().emit(Op::LoadSubscr);
            }
            Expr::Slice(e) => {
                self.compile_optional(e.lower.as_ref())?;
                self.compile_optional(e.upper.as_ref())?;
                match &e.step {
                    Some(step) => {
                        self.compile_expr(step)?;
                        self.b().emit_arg(Op::BuildSlice, 3);
                    }
                    None => self.b().emit_arg(Op::BuildSlice, 2),
                }
            }
            Expr::Tuple(e) => self.compile_sequence(Op::BuildTuple, &e.elts)?,
            Expr::List(e) => self.compile_sequence(Op::BuildList, &e.elts)?,
            Expr::Set(e) => self.compile_sequence(Op::BuildSet, &e.elts)?,
            Expr::Dict(e) => {
                self.b().emit_arg(Op::BuildMap, e.keys.len() as u32);
                for (key, value) in e.keys.iter().zip(&e.values) {
                    self.compile_expr(value)?;
                    self.compile_expr(key)?;
                    self.b().emit(Op::StoreMap);
                }
            }
            Expr::Lambda(e) => {
                self.make_function(e.id, "<lambda>", ScopeBody::Lambda(&e.args, &e.body), line)?
            }
            Expr::IfExp(e) => {
                let else_label = self.b().new_label();
                let end = self.b().new_label();
                self.compile_jump_if(&e.test, false, else_label)?;
                self.compile_expr(&e.body)?;
                self.b().emit_jump(Op::Jump, end);
                self.b().place_label(else_label);
                // Only one branch runs.
                self.b().adjust_stack(-1);
                self.compile_expr(&e.orelse)?;
                self.b().place_label(end);
            }
            Expr::Starred(_) => {
                return Err(CompilerError::syntax("can't use starred expression here", line));
            }
            Expr::Yield(e) => {
                self.check_in_function("'yield' outside function", line)?;
                self.compile_optional(e.value.as_ref())?;
                self.b().emit(Op::YieldValue);
            }
            Expr::YieldFrom(e) => {
                self.check_in_function("'yield from' outside function", line)?;
                self.compile_expr(&e.value)?;
                self.b().emit(Op::GetIter);
                self.b().emit(Op::LoadConstNone);
                self.b().emit(Op::YieldFrom);
            }
        }
        Ok(())
    }

    fn check_in_function(&self, message: &str, line: usize) -> Result<(), CompilerError> {
        if self.table().kind() == ScopeKind::Function {
            Ok(())
        } else {
            Err(CompilerError::syntax(message, line))
        }
    }

    /// Compile `expr`, or push `None` when absent.
    fn compile_optional(&mut self, expr: Option<&Expr>) -> Result<(), CompilerError> {
        match expr {
            Some(expr) => self.compile_expr(expr),
            None => {
                self.b().emit(Op::LoadConstNone);
                Ok(())
            }
        }
    }

    fn compile_int(&mut self, value: i128, line: usize) -> Result<(), CompilerError> {
        let bits = u32::from(self.config.small_int_bits.clamp(2, 63));
        let limit = 1i128 << (bits - 1);
        if value < -limit || value >= limit {
            return Err(CompilerError::out_of_range(value, line));
        }
        self.b().emit_small_int(value as i64);
        Ok(())
    }

    fn compile_sequence(&mut self, op: Op, elts: &[Expr]) -> Result<(), CompilerError> {
        for elt in elts {
            self.compile_expr(elt)?;
        }
        self.b().emit_arg(op, elts.len() as u32);
        Ok(())
    }

    fn compile_bool_op(&mut self, e: &BoolOpExpr) -> Result<(), CompilerError> {
        let Some((last, rest)) = e.values.split_last() else {
            return Ok(());
        };
        let end = self.b().new_label();
        let op = match e.op {
            BoolOperator::Or => Op::JumpIfTrueOrPop,
            BoolOperator::And => Op::JumpIfFalseOrPop,
        };
        for value in rest {
            self.compile_expr(value)?;
            self.b().emit_jump(op, end);
        }
        self.compile_expr(last)?;
        self.b().place_label(end);
        Ok(())
    }

    fn compile_compare(&mut self, e: &CompareExpr) -> Result<(), CompilerError> {
        self.compile_expr(&e.left)?;
        let multi = e.ops.len() > 1;
        let fail = self.b().new_label();

        for (i, (op, right)) in e.ops.iter().zip(&e.comparators).enumerate() {
            let last = i + 1 == e.ops.len();
            self.compile_expr(right)?;
            if !last {
                self.b().emit(Op::DupTop);
                self.b().emit(Op::RotThree);
            }
            self.emit_compare(*op);
            if !last {
                self.b().emit_jump(Op::JumpIfFalseOrPop, fail);
            }
        }

        if multi {
            let end = self.b().new_label();
            self.b().emit_jump(Op::Jump, end);
            self.b().place_label(fail);
            // The failed comparison result sits above the leftover operand.
            self.b().adjust_stack(1);
            self.b().emit(Op::RotTwo);
            self.b().emit(Op::PopTop);
            self.b().place_label(end);
        }
        Ok(())
    }

    fn emit_compare(&mut self, op: CompareOperator) {
        let (binary, invert) = match op {
            CompareOperator::Eq => (BinaryOp::Equal, false),
            CompareOperator::NotEq => (BinaryOp::NotEqual, false),
            CompareOperator::Lt => (BinaryOp::Less, false),
            CompareOperator::LtE => (BinaryOp::LessEqual, false),
            CompareOperator::Gt => (BinaryOp::More, false),
            CompareOperator::GtE => (BinaryOp::MoreEqual, false),
            CompareOperator::Is => (BinaryOp::Is, false),
            CompareOperator::IsNot => (BinaryOp::Is, true),
            CompareOperator::In => (BinaryOp::In, false),
            CompareOperator::NotIn => (BinaryOp::In, true),
        };
        self.b().emit_binary(binary);
        if invert {
            self.b().emit_unary(UnaryOp::Not);
        }
    }

    /// Compile a condition and jump to `label` when it evaluates to `when`.
    fn compile_jump_if(&mut self, expr: &Expr, when: bool, label: Label) -> Result<(), CompilerError> {
        match expr {
            Expr::UnaryOp(e) if e.op == UnaryOperator::Not => {
                return self.compile_jump_if(&e.operand, !when, label);
            }
            Expr::BoolOp(e) => {
                let is_or = e.op == BoolOperator::Or;
                if is_or == when {
                    for value in &e.values {
                        self.compile_jump_if(value, when, label)?;
                    }
                } else if let Some((last, rest)) = e.values.split_last() {
                    let skip = self.b().new_label();
                    for value in rest {
                        self.compile_jump_if(value, !when, skip)?;
                    }
                    self.compile_jump_if(last, when, label)?;
                    self.b().place_label(skip);
                }
                return Ok(());
            }
            Expr::Constant(c) if matches!(c.value, Singleton::True | Singleton::False) => {
                if (c.value == Singleton::True) == when {
                    self.b().emit_jump(Op::Jump, label);
                }
                return Ok(());
            }
            _ => {}
        }
        self.compile_expr(expr)?;
        let op = if when {
            Op::PopJumpIfTrue
        } else {
            Op::PopJumpIfFalse
        };
        self.b().emit_jump(op, label);
        Ok(())
    }

    fn compile_call(&mut self, e: &CallExpr, line: usize) -> Result<(), CompilerError> {
        match &e.func {
            Expr::Attribute(attr) => {
                self.compile_expr(&attr.value)?;
                self.b().emit_qstr(Op::LoadMethod, &attr.attr);
                self.compile_call_args(&e.args, &e.keywords, 0, true, line)
            }
            func => {
                self.compile_expr(func)?;
                self.compile_call_args(&e.args, &e.keywords, 0, false, line)
            }
        }
    }

    /// Push the arguments of a call whose callable is already on the stack,
    /// then emit the call. `n_extra` positional arguments were pushed by the caller.
    fn compile_call_args(
        &mut self,
        args: &[Expr],
        keywords: &[Keyword],
        n_extra: u32,
        is_method: bool,
        line: usize,
    ) -> Result<(), CompilerError> {
        let mut n_positional = n_extra;
        let mut star: Option<&Expr> = None;
        for arg in args {
            match arg {
                Expr::Starred(s) => {
                    if star.is_some() {
                        return Err(CompilerError::syntax("can't have multiple *x", line));
                    }
                    star = Some(&s.value);
                }
                other => {
                    if star.is_some() {
                        return Err(CompilerError::syntax("non-keyword arg after */**", line));
                    }
                    self.compile_expr(other)?;
                    n_positional += 1;
                }
            }
        }

        let mut n_keyword = 0u32;
        let mut double_star: Option<&Expr> = None;
        for keyword in keywords {
            match &keyword.arg {
                Some(name) => {
                    self.b().emit_qstr(Op::LoadConstString, name);
                    self.compile_expr(&keyword.value)?;
                    n_keyword += 1;
                }
                None => {
                    if double_star.is_some() {
                        return Err(CompilerError::syntax("can't have multiple **x", line));
                    }
                    double_star = Some(&keyword.value);
                }
            }
        }

        let var_kw = star.is_some() || double_star.is_some();
        if var_kw {
            self.compile_or_null(star)?;
            self.compile_or_null(double_star)?;
        }

        if n_positional > 0xff || n_keyword > 0xff {
            return Err(CompilerError::out_of_range(n_positional.max(n_keyword), line));
        }
        let op = match (is_method, var_kw) {
            (false, false) => Op::CallFunction,
            (false, true) => Op::CallFunctionVarKw,
            (true, false) => Op::CallMethod,
            (true, true) => Op::CallMethodVarKw,
        };
        self.b().emit_arg(op, n_positional | n_keyword << 8);
        Ok(())
    }

    fn compile_or_null(&mut self, expr: Option<&Expr>) -> Result<(), CompilerError> {
        match expr {
            Some(expr) => self.compile_expr(expr),
            None => {
                self.b().emit(Op::LoadNull);
                Ok(())
            }
        }
    }
}

fn has_kw_defaults(args: &Arguments) -> bool {
    args.kw_defaults.iter().any(Option::is_some)
}

fn binary_op(op: BinaryOperator) -> BinaryOp {
    match op {
        BinaryOperator::Add => BinaryOp::Add,
        BinaryOperator::Sub => BinaryOp::Subtract,
        BinaryOperator::Mult => BinaryOp::Multiply,
        BinaryOperator::MatMult => BinaryOp::MatMultiply,
        BinaryOperator::Div => BinaryOp::TrueDivide,
        BinaryOperator::FloorDiv => BinaryOp::FloorDivide,
        BinaryOperator::Mod => BinaryOp::Modulo,
        BinaryOperator::Pow => BinaryOp::Power,
        BinaryOperator::LShift => BinaryOp::Lshift,
        BinaryOperator::RShift => BinaryOp::Rshift,
        BinaryOperator::BitOr => BinaryOp::Or,
        BinaryOperator::BitXor => BinaryOp::Xor,
        BinaryOperator::BitAnd => BinaryOp::And,
    }
}

fn unary_op(op: UnaryOperator) -> UnaryOp {
    match op {
        UnaryOperator::UAdd => UnaryOp::Positive,
        UnaryOperator::USub => UnaryOp::Negative,
        UnaryOperator::Invert => UnaryOp::Invert,
        UnaryOperator::Not => UnaryOp::Not,
    }
}

/// Build the symbol tables of `module` and compile it.
pub fn compile(module: &Module, config: &CompilerConfig) -> Result<CodeObject, CompilerError> {
    let tables = SymbolTables::build(module)?;
    Compiler::new(config, &tables).compile_module(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpyc_bytecode::{Opcode, decode_instructions};

    fn compile_with(source: &str, config: &CompilerConfig) -> Result<CodeObject, CompilerError> {
        let module = mpyc_parser::parse(source).expect("parse failed");
        compile(&module, config)
    }

    fn compile_source(source: &str) -> CodeObject {
        compile_with(source, &CompilerConfig::default()).expect("compilation failed")
    }

    fn compile_err(source: &str) -> CompilerError {
        compile_with(source, &CompilerConfig::default()).expect_err("compilation succeeded")
    }

    fn ops(code: &CodeObject) -> Vec<Opcode> {
        decode_instructions(&code.code, false)
            .expect("undecodable code")
            .into_iter()
            .map(|i| i.opcode)
            .collect()
    }

    fn has_op(code: &CodeObject, op: Op) -> bool {
        ops(code).contains(&Opcode::Op(op))
    }

    #[test]
    fn test_module_store_and_return() {
        let code = compile_source("x = 1\n");
        assert_eq!(code.name, "<module>");
        assert_eq!(code.filename, "<stdin>");
        assert_eq!(code.code, vec![0x81, 0x16, 0x00, 0x00, 0x51, 0x63]);
        assert_eq!(code.names, vec!["x".to_string()]);
    }

    #[test]
    fn test_lonely_constants_are_dropped() {
        let code = compile_source("\"doc\"\n42\nNone\n");
        assert_eq!(code.code, vec![0x51, 0x63]);
        assert!(code.consts.is_empty());
    }

    #[test]
    fn test_constants_are_pooled_once() {
        let code = compile_source("a = 'hi'\nb = 'hi'\nc = 1.5\nd = 2j\n");
        assert_eq!(
            code.consts,
            vec![
                Constant::Str("hi".into()),
                Constant::Float(1.5),
                Constant::Complex { real: 0.0, imag: 2.0 },
            ]
        );
    }

    #[test]
    fn test_small_int_range() {
        let code = compile_source("x = -1073741824\n");
        assert!(has_op(&code, Op::LoadConstSmallInt));
        assert!(matches!(
            compile_err("x = 1073741824\n"),
            CompilerError::ValueOutOfRange { line: 1, .. }
        ));
        let wide = CompilerConfig {
            small_int_bits: 63,
            ..Default::default()
        };
        assert!(compile_with("x = 1073741824\n", &wide).is_ok());
    }

    #[test]
    fn test_closure_code() {
        let code = compile_source(
            "def f():\n    x = 1\n    def g():\n        return x\n    return g\n",
        );
        let f = &code.children[0];
        assert_eq!(f.cells, vec![1]);
        assert_eq!(
            f.code,
            vec![0x81, 0x27, 0x01, 0xb1, 0x20, 0x00, 0x01, 0xc0, 0xb0, 0x63]
        );
        let g = &f.children[0];
        assert_eq!(g.argnames, vec!["x".to_string()]);
        assert_eq!(g.signature.n_pos_args, 1);
        assert_eq!(g.code, vec![0x25, 0x00, 0x63]);
    }

    #[test]
    fn test_function_signature() {
        let code = compile_source("def f(a, b=1, *c, d, e=2, **g):\n    pass\n");
        let f = &code.children[0];
        let sig = f.signature;
        assert_eq!(
            sig.scope_flags,
            ScopeFlags::VARARGS | ScopeFlags::VARKEYWORDS | ScopeFlags::DEFKWARGS
        );
        assert_eq!(sig.n_pos_args, 2);
        assert_eq!(sig.n_kwonly_args, 2);
        assert_eq!(sig.n_def_pos_args, 1);
        assert_eq!(f.argnames, vec!["a", "b", "d", "e"]);
        assert!(has_op(&code, Op::MakeFunctionDefargs));
        assert!(has_op(&code, Op::StoreMap));
    }

    #[test]
    fn test_generator_flag() {
        let code = compile_source("def g():\n    yield 1\n    yield from h()\n");
        let g = &code.children[0];
        assert!(g.signature.scope_flags.contains(ScopeFlags::GENERATOR));
        assert!(has_op(g, Op::YieldValue));
        assert!(has_op(g, Op::YieldFrom));
    }

    #[test]
    fn test_method_call_with_keywords() {
        let code = compile_source("a.b(1, k=2)\n");
        assert_eq!(
            &ops(&code)[..6],
            &[
                Opcode::Op(Op::LoadName),
                Opcode::Op(Op::LoadMethod),
                Opcode::SmallInt(1),
                Opcode::Op(Op::LoadConstString),
                Opcode::SmallInt(2),
                Opcode::Op(Op::CallMethod),
            ]
        );
    }

    #[test]
    fn test_star_call_uses_null_placeholder() {
        let code = compile_source("f(*args)\n");
        let ops = ops(&code);
        assert!(ops.contains(&Opcode::Op(Op::LoadNull)));
        assert!(ops.contains(&Opcode::Op(Op::CallFunctionVarKw)));
        assert!(matches!(
            compile_err("f(*a, *b)\n"),
            CompilerError::Syntax { .. }
        ));
    }

    #[test]
    fn test_break_out_of_for_pops_iterator() {
        let code = compile_source("for i in x:\n    break\n");
        assert!(has_op(&code, Op::GetIterStack));
        let pops = [0x59, 0x59, 0x59, 0x59, 0x42];
        assert!(code.code.windows(pops.len()).any(|w| w == pops));
    }

    #[test]
    fn test_break_across_try_unwinds() {
        let code = compile_source(
            "for i in x:\n    try:\n        break\n    except E:\n        pass\n",
        );
        let unwind = decode_instructions(&code.code, false)
            .unwrap()
            .into_iter()
            .find(|i| i.opcode == Opcode::Op(Op::UnwindJump))
            .expect("no UNWIND_JUMP");
        assert_eq!(unwind.extra, Some(0x81));
        assert_eq!(code.signature.n_exc_stack, 1);
    }

    #[test]
    fn test_named_handler_is_deleted() {
        let code = compile_source(
            "def f():\n    try:\n        g()\n    except E as e:\n        h(e)\n    finally:\n        k()\n",
        );
        let f = &code.children[0];
        assert!(has_op(f, Op::DeleteFast));
        assert!(has_op(f, Op::SetupFinally));
        assert_eq!(f.signature.n_exc_stack, 3);
    }

    #[test]
    fn test_with_statement() {
        let code = compile_source("with a as b, c:\n    pass\n");
        let ops = ops(&code);
        assert_eq!(
            ops.iter().filter(|o| **o == Opcode::Op(Op::SetupWith)).count(),
            2
        );
        assert_eq!(
            ops.iter().filter(|o| **o == Opcode::Op(Op::WithCleanup)).count(),
            2
        );
        assert_eq!(code.signature.n_exc_stack, 2);
    }

    #[test]
    fn test_chained_compare() {
        let code = compile_source("r = a < b < c\n");
        let ops = ops(&code);
        assert!(ops.contains(&Opcode::Op(Op::DupTop)));
        assert!(ops.contains(&Opcode::Op(Op::RotThree)));
        assert!(ops.contains(&Opcode::Op(Op::JumpIfFalseOrPop)));
        assert!(ops.contains(&Opcode::Binary(BinaryOp::Less)));
    }

    #[test]
    fn test_not_in_inverts() {
        let code = compile_source("r = a not in b\n");
        let ops = ops(&code);
        assert!(ops.contains(&Opcode::Binary(BinaryOp::In)));
        assert!(ops.contains(&Opcode::Unary(UnaryOp::Not)));
    }

    #[test]
    fn test_augmented_assignment_forms() {
        let code = compile_source("x += 1\na.b -= 2\nc[i] *= 3\n");
        let ops = ops(&code);
        assert!(ops.contains(&Opcode::Binary(BinaryOp::InplaceAdd)));
        assert!(ops.contains(&Opcode::Binary(BinaryOp::InplaceSubtract)));
        assert!(ops.contains(&Opcode::Binary(BinaryOp::InplaceMultiply)));
        assert!(ops.contains(&Opcode::Op(Op::DupTopTwo)));
    }

    #[test]
    fn test_delete_forms() {
        let code = compile_source("del a, b.c, d[0]\n");
        let ops = ops(&code);
        assert!(ops.contains(&Opcode::Op(Op::DeleteName)));
        assert_eq!(
            ops.iter().filter(|o| **o == Opcode::Op(Op::LoadNull)).count(),
            2
        );
    }

    #[test]
    fn test_class_body() {
        let code = compile_source("class C(B):\n    x = 1\n");
        assert_eq!(
            &ops(&code)[..5],
            &[
                Opcode::Op(Op::LoadBuildClass),
                Opcode::Op(Op::MakeFunction),
                Opcode::Op(Op::LoadConstString),
                Opcode::Op(Op::LoadName),
                Opcode::Op(Op::CallFunction),
            ]
        );
        let body = &code.children[0];
        assert_eq!(body.name, "C");
        assert_eq!(
            &body.names[..4],
            &["__name__", "__module__", "C", "__qualname__"]
        );
    }

    #[test]
    fn test_decorators_are_called_after_definition() {
        let code = compile_source("@d1\n@d2\ndef f():\n    pass\n");
        let ops = ops(&code);
        let make = ops
            .iter()
            .position(|o| *o == Opcode::Op(Op::MakeFunction))
            .unwrap();
        assert_eq!(ops[make + 1], Opcode::Op(Op::CallFunction));
        assert_eq!(ops[make + 2], Opcode::Op(Op::CallFunction));
    }

    #[test]
    fn test_imports() {
        let code = compile_source("import a.b.c as d\nfrom .m import x as y\nfrom n import *\n");
        let ops = ops(&code);
        assert!(ops.contains(&Opcode::Op(Op::ImportFrom)));
        assert!(ops.contains(&Opcode::Op(Op::ImportStar)));
        assert!(code.names.contains(&"a.b.c".to_string()));
        assert!(code.names.contains(&"d".to_string()));
    }

    #[test]
    fn test_cache_lookups_add_cache_bytes() {
        let config = CompilerConfig {
            cache_lookups: true,
            ..Default::default()
        };
        let code = compile_with("def f():\n    return g\n", &config).unwrap();
        assert_eq!(code.children[0].code, vec![0x12, 0x00, 0x00, 0x00, 0x63]);
    }

    #[test]
    fn test_control_flow_errors() {
        assert!(matches!(
            compile_err("break\n"),
            CompilerError::Syntax { line: 1, .. }
        ));
        assert!(matches!(
            compile_err("x = 1\ncontinue\n"),
            CompilerError::Syntax { line: 2, .. }
        ));
        assert!(matches!(
            compile_err("return 1\n"),
            CompilerError::Syntax { .. }
        ));
        assert!(matches!(
            compile_err("class C:\n    yield 1\n"),
            CompilerError::Syntax { line: 2, .. }
        ));
        assert!(matches!(
            compile_err("x = f\"{y}\"\n"),
            CompilerError::Unsupported { .. }
        ));
        assert!(matches!(
            compile_err("def f():\n    nonlocal q\n"),
            CompilerError::Binding(SymbolTableError::NoNonlocalBinding { .. })
        ));
    }

    fn syntax_message(source: &str) -> (String, usize) {
        match compile_err(source) {
            CompilerError::Syntax { message, line } => (message, line),
            other => panic!("expected a syntax error, got {:?}", other),
        }
    }

    #[test]
    fn test_loop_control_is_scoped_to_its_function() {
        assert_eq!(syntax_message("break\n"), ("'break' outside loop".to_string(), 1));
        assert_eq!(
            syntax_message("continue\n"),
            ("'continue' not properly in loop".to_string(), 1)
        );
        assert_eq!(
            syntax_message("x = 1\nreturn x\n"),
            ("'return' outside function".to_string(), 2)
        );

        // An enclosing loop in another scope does not count.
        assert_eq!(
            syntax_message("for x in y:\n    def f():\n        break\n"),
            ("'break' outside loop".to_string(), 3)
        );
        assert_eq!(
            syntax_message("while x:\n    def f():\n        continue\n"),
            ("'continue' not properly in loop".to_string(), 3)
        );
        assert_eq!(
            syntax_message("while x:\n    class C:\n        break\n"),
            ("'break' outside loop".to_string(), 3)
        );
        assert_eq!(
            syntax_message("def f():\n    class C:\n        return 1\n"),
            ("'return' outside function".to_string(), 3)
        );

        // The loop inside the function body is the one that counts.
        let code = compile_source("def f():\n    for x in y:\n        break\n");
        assert!(has_op(&code.children[0], Op::ForIter));
    }

    #[test]
    fn test_too_many_qstrs_is_an_error() {
        let source: String = (0..70_000).map(|i| format!("a{} = 0\n", i)).collect();
        assert!(matches!(
            compile_err(&source),
            CompilerError::Build(BuildError::TooManyQstrs { count: 70_000 })
        ));
    }

    #[test]
    fn test_while_else_and_conditions() {
        let code = compile_source(
            "while a and not b:\n    if c or d:\n        continue\n    x = 1 if e else 2\nelse:\n    y = 3\n",
        );
        let ops = ops(&code);
        assert!(ops.contains(&Opcode::Op(Op::PopJumpIfTrue)));
        assert!(ops.contains(&Opcode::Op(Op::PopJumpIfFalse)));
        assert!(code.names.contains(&"y".to_string()));
    }

    #[test]
    fn test_line_info_is_recorded() {
        let code = compile_source("x = 1\n\ny = 2\n");
        let lines = mpyc_bytecode::decode_line_info(&code.line_info).unwrap();
        assert_eq!(lines.last().map(|(_, l)| *l), Some(3));
    }
}
