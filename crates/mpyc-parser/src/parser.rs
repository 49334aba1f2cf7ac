//! Recursive-descent statement parser with Pratt expression parsing.

use crate::ast::*;
use crate::context::tag_targets;
use crate::precedence::Precedence;
use mpyc_lexer::{
    decode_number, decode_string, is_keyword, Lexer, LexerError, NumberValue, Position,
    StringValue, Token, TokenKind, TokenSource, TokenStream,
};
use thiserror::Error;

/// Errors that can occur during parsing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParserError {
    #[error("{message} at line {line}, column {column}")]
    Syntax {
        message: String,
        line: usize,
        column: usize,
    },

    #[error("lexer error: {0}")]
    Lexer(#[from] LexerError),
}

impl ParserError {
    pub(crate) fn new(message: impl Into<String>, pos: Position) -> Self {
        Self::Syntax {
            message: message.into(),
            line: pos.line_number(),
            column: pos.column_number(),
        }
    }

    /// 1-indexed line of the error, when known.
    pub fn line(&self) -> Option<usize> {
        match self {
            ParserError::Syntax { line, .. } => Some(*line),
            ParserError::Lexer(_) => None,
        }
    }
}

/// Deepest expression or block nesting the parser accepts.
pub const MAX_NESTING: usize = 200;

/// Parser over any [`TokenSource`].
///
/// Parsing stops at the first error; there is no recovery.
pub struct Parser<S: TokenSource> {
    source: S,
    cur_token: Token,
    peek_token: Token,
    next_id: NodeId,
    max_depth: usize,
    depth: usize,
    /// Deepest nesting level reached by the subtree being measured.
    deepest: usize,
}

impl<S: TokenSource> Parser<S> {
    /// Create a new parser reading from `source`.
    pub fn new(mut source: S) -> Result<Self, ParserError> {
        let cur_token = Self::pull(&mut source)?;
        let peek_token = Self::pull(&mut source)?;
        Ok(Self {
            source,
            cur_token,
            peek_token,
            next_id: 1,
            max_depth: MAX_NESTING,
            depth: 0,
            deepest: 0,
        })
    }

    /// Next significant token; comments and non-logical line breaks are dropped.
    fn pull(source: &mut S) -> Result<Token, LexerError> {
        loop {
            let token = source.next_token()?;
            if !matches!(token.kind, TokenKind::Comment | TokenKind::Nl) {
                return Ok(token);
            }
        }
    }

    fn next_token(&mut self) -> Result<(), ParserError> {
        let next = Self::pull(&mut self.source)?;
        self.cur_token = std::mem::replace(&mut self.peek_token, next);
        Ok(())
    }

    fn cur_token_is(&self, kind: TokenKind) -> bool {
        self.cur_token.kind == kind
    }

    fn cur_is_op(&self, op: &str) -> bool {
        self.cur_token.is_op(op)
    }

    fn cur_is_keyword(&self, kw: &str) -> bool {
        self.cur_token.is_keyword(kw)
    }

    fn alloc_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Error citing the current token.
    fn unexpected(&self, expected: &str) -> ParserError {
        ParserError::new(
            format!("expected {}, found {}", expected, self.cur_token),
            self.cur_token.start,
        )
    }

    fn expect_op(&mut self, op: &str) -> Result<Position, ParserError> {
        if !self.cur_is_op(op) {
            return Err(self.unexpected(&format!("'{}'", op)));
        }
        let pos = self.cur_token.start;
        self.next_token()?;
        Ok(pos)
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), ParserError> {
        if !self.cur_is_keyword(kw) {
            return Err(self.unexpected(&format!("'{}'", kw)));
        }
        self.next_token()
    }

    fn expect_name(&mut self) -> Result<(String, Position), ParserError> {
        if !self.cur_token_is(TokenKind::Name) || is_keyword(&self.cur_token.text) {
            return Err(self.unexpected("identifier"));
        }
        let name = self.cur_token.text.clone();
        let pos = self.cur_token.start;
        self.next_token()?;
        Ok((name, pos))
    }

    fn expect_newline(&mut self) -> Result<(), ParserError> {
        match self.cur_token.kind {
            TokenKind::Newline => self.next_token(),
            TokenKind::EndMarker => Ok(()),
            _ => Err(self.unexpected("end of statement")),
        }
    }

    fn enter(&mut self) -> Result<(), ParserError> {
        self.depth += 1;
        self.reach(self.depth)
    }

    /// Record that the tree extends to nesting `level`.
    fn reach(&mut self, level: usize) -> Result<(), ParserError> {
        if level > self.max_depth {
            return Err(ParserError::new(
                "maximum nesting depth exceeded",
                self.cur_token.start,
            ));
        }
        self.deepest = self.deepest.max(level);
        Ok(())
    }

    /// Run `parse` and report how many levels below the current one the
    /// resulting tree reaches.
    fn measure<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, ParserError>,
    ) -> Result<(T, usize), ParserError> {
        let base = self.depth;
        let outer = std::mem::replace(&mut self.deepest, base);
        let value = parse(self)?;
        let height = self.deepest - base;
        self.deepest = outer.max(self.deepest);
        Ok((value, height))
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    /// Parse the entire token stream as one module.
    pub fn parse_module(&mut self) -> Result<Module, ParserError> {
        let mut body = Vec::new();
        while !self.cur_token_is(TokenKind::EndMarker) {
            if self.cur_token_is(TokenKind::Newline) {
                self.next_token()?;
                continue;
            }
            self.parse_statement(&mut body)?;
        }
        Ok(Module { id: 0, body })
    }

    // =========================================================================
    // Statement Parsing
    // =========================================================================

    /// Parse one logical line or compound statement into `out`.
    fn parse_statement(&mut self, out: &mut Vec<Stmt>) -> Result<(), ParserError> {
        match self.cur_token.kind {
            TokenKind::Op if self.cur_is_op("@") => {
                out.push(self.parse_decorated()?);
                return Ok(());
            }
            TokenKind::Indent => {
                return Err(ParserError::new("unexpected indent", self.cur_token.start));
            }
            TokenKind::Name => {}
            _ => return self.parse_simple_line(out),
        }
        let stmt = match self.cur_token.text.as_str() {
            "if" => self.parse_if()?,
            "while" => self.parse_while()?,
            "for" => self.parse_for()?,
            "try" => self.parse_try()?,
            "with" => self.parse_with()?,
            "def" => self.parse_funcdef(Vec::new())?,
            "class" => self.parse_classdef(Vec::new())?,
            "async" | "await" => {
                return Err(ParserError::new(
                    format!("'{}' is not supported", self.cur_token.text),
                    self.cur_token.start,
                ));
            }
            _ => return self.parse_simple_line(out),
        };
        out.push(stmt);
        Ok(())
    }

    /// `simple_stmt (';' simple_stmt)* [';'] NEWLINE`
    fn parse_simple_line(&mut self, out: &mut Vec<Stmt>) -> Result<(), ParserError> {
        loop {
            out.push(self.parse_simple_statement()?);
            if !self.cur_is_op(";") {
                break;
            }
            self.next_token()?;
            if self.at_end_of_line() {
                break;
            }
        }
        self.expect_newline()
    }

    fn at_end_of_line(&self) -> bool {
        matches!(
            self.cur_token.kind,
            TokenKind::Newline | TokenKind::EndMarker
        )
    }

    fn at_end_of_simple(&self) -> bool {
        self.at_end_of_line() || self.cur_is_op(";")
    }

    /// Suite after a compound statement header's ':'.
    fn parse_suite(&mut self) -> Result<Vec<Stmt>, ParserError> {
        let mut body = Vec::new();
        if !self.cur_token_is(TokenKind::Newline) {
            self.parse_simple_line(&mut body)?;
            return Ok(body);
        }
        self.next_token()?;
        if !self.cur_token_is(TokenKind::Indent) {
            return Err(self.unexpected("an indented block"));
        }
        self.next_token()?;

        self.enter()?;
        while !self.cur_token_is(TokenKind::Dedent) && !self.cur_token_is(TokenKind::EndMarker) {
            if self.cur_token_is(TokenKind::Newline) {
                self.next_token()?;
                continue;
            }
            self.parse_statement(&mut body)?;
        }
        self.leave();

        if self.cur_token_is(TokenKind::Dedent) {
            self.next_token()?;
        }
        Ok(body)
    }

    fn parse_simple_statement(&mut self) -> Result<Stmt, ParserError> {
        let pos = self.cur_token.start;
        if self.cur_token_is(TokenKind::Name) {
            match self.cur_token.text.as_str() {
                "pass" => {
                    self.next_token()?;
                    return Ok(Stmt::Pass(pos));
                }
                "break" => {
                    self.next_token()?;
                    return Ok(Stmt::Break(pos));
                }
                "continue" => {
                    self.next_token()?;
                    return Ok(Stmt::Continue(pos));
                }
                "return" => return self.parse_return(),
                "del" => return self.parse_del(),
                "raise" => return self.parse_raise(),
                "global" | "nonlocal" => return self.parse_names_stmt(),
                "assert" => return self.parse_assert(),
                "import" => return self.parse_import(),
                "from" => return self.parse_from_import(),
                _ => {}
            }
        }
        self.parse_expression_statement()
    }

    fn parse_expression_statement(&mut self) -> Result<Stmt, ParserError> {
        let position = self.cur_token.start;
        let first = self.parse_testlist_or_yield()?;

        if self.cur_is_op("=") {
            let mut targets = vec![first];
            let value = loop {
                self.next_token()?; // consume '='
                let next = self.parse_testlist_or_yield()?;
                if !self.cur_is_op("=") {
                    break next;
                }
                targets.push(next);
            };
            return Ok(Stmt::Assign(AssignStmt {
                position,
                targets,
                value,
            }));
        }

        if self.cur_token_is(TokenKind::Op) {
            if let Some(op) = BinaryOperator::from_augmented(&self.cur_token.text) {
                self.next_token()?;
                let value = self.parse_testlist_or_yield()?;
                return Ok(Stmt::AugAssign(AugAssignStmt {
                    position,
                    target: first,
                    op,
                    value,
                }));
            }
            if self.cur_is_op(":") {
                return Err(ParserError::new(
                    "annotated assignments are not supported",
                    self.cur_token.start,
                ));
            }
        }

        Ok(Stmt::Expr(ExprStmt { value: first }))
    }

    fn parse_return(&mut self) -> Result<Stmt, ParserError> {
        let position = self.cur_token.start;
        self.next_token()?; // consume 'return'
        let value = if self.at_end_of_simple() {
            None
        } else {
            Some(self.parse_testlist(Precedence::Lowest)?)
        };
        Ok(Stmt::Return(ReturnStmt { position, value }))
    }

    fn parse_del(&mut self) -> Result<Stmt, ParserError> {
        let position = self.cur_token.start;
        self.next_token()?; // consume 'del'
        let mut targets = Vec::new();
        loop {
            targets.push(self.parse_expression(Precedence::Compare)?);
            if !self.cur_is_op(",") {
                break;
            }
            self.next_token()?;
            if self.at_end_of_simple() {
                break;
            }
        }
        Ok(Stmt::Delete(DeleteStmt { position, targets }))
    }

    fn parse_raise(&mut self) -> Result<Stmt, ParserError> {
        let position = self.cur_token.start;
        self.next_token()?; // consume 'raise'
        let mut exc = None;
        let mut cause = None;
        if !self.at_end_of_simple() {
            exc = Some(self.parse_expression(Precedence::Lowest)?);
            if self.cur_is_keyword("from") {
                self.next_token()?;
                cause = Some(self.parse_expression(Precedence::Lowest)?);
            }
        }
        Ok(Stmt::Raise(RaiseStmt {
            position,
            exc,
            cause,
        }))
    }

    fn parse_names_stmt(&mut self) -> Result<Stmt, ParserError> {
        let position = self.cur_token.start;
        let global = self.cur_is_keyword("global");
        self.next_token()?;
        let mut names = Vec::new();
        loop {
            names.push(self.expect_name()?.0);
            if !self.cur_is_op(",") {
                break;
            }
            self.next_token()?;
        }
        let stmt = NamesStmt { position, names };
        Ok(if global {
            Stmt::Global(stmt)
        } else {
            Stmt::Nonlocal(stmt)
        })
    }

    fn parse_assert(&mut self) -> Result<Stmt, ParserError> {
        let position = self.cur_token.start;
        self.next_token()?; // consume 'assert'
        let test = self.parse_expression(Precedence::Lowest)?;
        let msg = if self.cur_is_op(",") {
            self.next_token()?;
            Some(self.parse_expression(Precedence::Lowest)?)
        } else {
            None
        };
        Ok(Stmt::Assert(AssertStmt {
            position,
            test,
            msg,
        }))
    }

    fn parse_dotted_name(&mut self) -> Result<String, ParserError> {
        let (mut name, _) = self.expect_name()?;
        while self.cur_is_op(".") {
            self.next_token()?;
            name.push('.');
            name.push_str(&self.expect_name()?.0);
        }
        Ok(name)
    }

    fn parse_import(&mut self) -> Result<Stmt, ParserError> {
        let position = self.cur_token.start;
        self.next_token()?; // consume 'import'
        let mut names = Vec::new();
        loop {
            let name = self.parse_dotted_name()?;
            let asname = if self.cur_is_keyword("as") {
                self.next_token()?;
                Some(self.expect_name()?.0)
            } else {
                None
            };
            names.push(Alias { name, asname });
            if !self.cur_is_op(",") {
                break;
            }
            self.next_token()?;
        }
        Ok(Stmt::Import(ImportStmt { position, names }))
    }

    fn parse_from_import(&mut self) -> Result<Stmt, ParserError> {
        let position = self.cur_token.start;
        self.next_token()?; // consume 'from'

        let mut level = 0;
        loop {
            if self.cur_is_op(".") {
                level += 1;
            } else if self.cur_is_op("...") {
                level += 3;
            } else {
                break;
            }
            self.next_token()?;
        }

        let module = if self.cur_is_keyword("import") {
            if level == 0 {
                return Err(self.unexpected("module name"));
            }
            None
        } else {
            Some(self.parse_dotted_name()?)
        };
        self.expect_keyword("import")?;

        if self.cur_is_op("*") {
            self.next_token()?;
            return Ok(Stmt::ImportFrom(ImportFromStmt {
                position,
                module,
                names: vec![Alias {
                    name: "*".to_string(),
                    asname: None,
                }],
                level,
            }));
        }

        let parenthesized = self.cur_is_op("(");
        if parenthesized {
            self.next_token()?;
        }
        let mut names = Vec::new();
        loop {
            let (name, _) = self.expect_name()?;
            let asname = if self.cur_is_keyword("as") {
                self.next_token()?;
                Some(self.expect_name()?.0)
            } else {
                None
            };
            names.push(Alias { name, asname });
            if !self.cur_is_op(",") {
                break;
            }
            self.next_token()?;
            if parenthesized && self.cur_is_op(")") {
                break;
            }
        }
        if parenthesized {
            self.expect_op(")")?;
        }

        Ok(Stmt::ImportFrom(ImportFromStmt {
            position,
            module,
            names,
            level,
        }))
    }

    // =========================================================================
    // Compound Statements
    // =========================================================================

    /// Parses `if` and, recursively, each `elif`.
    fn parse_if(&mut self) -> Result<Stmt, ParserError> {
        let position = self.cur_token.start;
        self.next_token()?; // consume 'if' / 'elif'
        let test = self.parse_expression(Precedence::Lowest)?;
        self.expect_op(":")?;
        let body = self.parse_suite()?;
        let orelse = if self.cur_is_keyword("elif") {
            vec![self.parse_if()?]
        } else {
            self.parse_else()?
        };
        Ok(Stmt::If(Box::new(IfStmt {
            position,
            test,
            body,
            orelse,
        })))
    }

    fn parse_else(&mut self) -> Result<Vec<Stmt>, ParserError> {
        if !self.cur_is_keyword("else") {
            return Ok(Vec::new());
        }
        self.next_token()?;
        self.expect_op(":")?;
        self.parse_suite()
    }

    fn parse_while(&mut self) -> Result<Stmt, ParserError> {
        let position = self.cur_token.start;
        self.next_token()?; // consume 'while'
        let test = self.parse_expression(Precedence::Lowest)?;
        self.expect_op(":")?;
        let body = self.parse_suite()?;
        let orelse = self.parse_else()?;
        Ok(Stmt::While(Box::new(WhileStmt {
            position,
            test,
            body,
            orelse,
        })))
    }

    fn parse_for(&mut self) -> Result<Stmt, ParserError> {
        let position = self.cur_token.start;
        self.next_token()?; // consume 'for'
        let target = self.parse_testlist(Precedence::Compare)?;
        self.expect_keyword("in")?;
        let iter = self.parse_testlist(Precedence::Lowest)?;
        self.expect_op(":")?;
        let body = self.parse_suite()?;
        let orelse = self.parse_else()?;
        Ok(Stmt::For(Box::new(ForStmt {
            position,
            target,
            iter,
            body,
            orelse,
        })))
    }

    fn parse_try(&mut self) -> Result<Stmt, ParserError> {
        let position = self.cur_token.start;
        self.next_token()?; // consume 'try'
        self.expect_op(":")?;
        let body = self.parse_suite()?;

        let mut handlers: Vec<ExceptHandler> = Vec::new();
        while self.cur_is_keyword("except") {
            let handler_pos = self.cur_token.start;
            if handlers.last().is_some_and(|h| h.type_.is_none()) {
                return Err(ParserError::new("default 'except:' must be last", handler_pos));
            }
            self.next_token()?;
            let mut type_ = None;
            let mut name = None;
            if !self.cur_is_op(":") {
                type_ = Some(self.parse_expression(Precedence::Lowest)?);
                if self.cur_is_keyword("as") {
                    self.next_token()?;
                    name = Some(self.expect_name()?.0);
                }
            }
            self.expect_op(":")?;
            let body = self.parse_suite()?;
            handlers.push(ExceptHandler {
                position: handler_pos,
                type_,
                name,
                body,
            });
        }

        let orelse = if handlers.is_empty() {
            Vec::new()
        } else {
            self.parse_else()?
        };

        let finalbody = if self.cur_is_keyword("finally") {
            self.next_token()?;
            self.expect_op(":")?;
            self.parse_suite()?
        } else {
            Vec::new()
        };

        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.unexpected("'except' or 'finally'"));
        }

        Ok(Stmt::Try(Box::new(TryStmt {
            position,
            body,
            handlers,
            orelse,
            finalbody,
        })))
    }

    fn parse_with(&mut self) -> Result<Stmt, ParserError> {
        let position = self.cur_token.start;
        self.next_token()?; // consume 'with'
        let mut items = Vec::new();
        loop {
            let context_expr = self.parse_expression(Precedence::Lowest)?;
            let optional_vars = if self.cur_is_keyword("as") {
                self.next_token()?;
                Some(self.parse_expression(Precedence::Compare)?)
            } else {
                None
            };
            items.push(WithItem {
                context_expr,
                optional_vars,
            });
            if !self.cur_is_op(",") {
                break;
            }
            self.next_token()?;
        }
        self.expect_op(":")?;
        let body = self.parse_suite()?;
        Ok(Stmt::With(Box::new(WithStmt {
            position,
            items,
            body,
        })))
    }

    /// One or more `@decorator` lines followed by a `def` or `class`.
    fn parse_decorated(&mut self) -> Result<Stmt, ParserError> {
        let mut decorators = Vec::new();
        while self.cur_is_op("@") {
            self.next_token()?;
            decorators.push(self.parse_expression(Precedence::Lowest)?);
            self.expect_newline()?;
        }
        if self.cur_is_keyword("def") {
            self.parse_funcdef(decorators)
        } else if self.cur_is_keyword("class") {
            self.parse_classdef(decorators)
        } else {
            Err(self.unexpected("'def' or 'class' after decorator"))
        }
    }

    fn parse_funcdef(&mut self, decorators: Vec<Expr>) -> Result<Stmt, ParserError> {
        let position = self.cur_token.start;
        self.next_token()?; // consume 'def'
        let (name, _) = self.expect_name()?;
        self.expect_op("(")?;
        let args = self.parse_parameters(")", true)?;
        self.expect_op(")")?;
        if self.cur_is_op("->") {
            self.next_token()?;
            self.parse_expression(Precedence::Lowest)?;
        }
        self.expect_op(":")?;
        let id = self.alloc_id();
        let body = self.parse_suite()?;
        Ok(Stmt::FunctionDef(Box::new(FunctionDef {
            id,
            position,
            name,
            args,
            body,
            decorators,
        })))
    }

    fn parse_classdef(&mut self, decorators: Vec<Expr>) -> Result<Stmt, ParserError> {
        let position = self.cur_token.start;
        self.next_token()?; // consume 'class'
        let (name, _) = self.expect_name()?;
        let (bases, keywords) = if self.cur_is_op("(") {
            self.next_token()?;
            self.parse_call_arguments()?
        } else {
            (Vec::new(), Vec::new())
        };
        self.expect_op(":")?;
        let id = self.alloc_id();
        let body = self.parse_suite()?;
        Ok(Stmt::ClassDef(Box::new(ClassDef {
            id,
            position,
            name,
            bases,
            keywords,
            body,
            decorators,
        })))
    }

    /// Parameter list up to (not including) `end`.
    ///
    /// Annotations are accepted and discarded when `annotations` is set.
    fn parse_parameters(&mut self, end: &str, annotations: bool) -> Result<Arguments, ParserError> {
        let mut args = Arguments::default();
        let mut seen_star = false;
        let mut seen: Vec<String> = Vec::new();

        while !self.cur_is_op(end) {
            let pos = self.cur_token.start;
            if self.cur_is_op("**") {
                self.next_token()?;
                args.kwarg = Some(self.parse_param(annotations)?);
            } else if self.cur_is_op("*") {
                if seen_star {
                    return Err(ParserError::new("duplicate '*' in parameter list", pos));
                }
                seen_star = true;
                self.next_token()?;
                if self.cur_token_is(TokenKind::Name) {
                    args.vararg = Some(self.parse_param(annotations)?);
                }
            } else {
                if args.kwarg.is_some() {
                    return Err(ParserError::new("parameter after '**' parameter", pos));
                }
                let arg = self.parse_param(annotations)?;
                let default = if self.cur_is_op("=") {
                    self.next_token()?;
                    Some(self.parse_expression(Precedence::Lowest)?)
                } else {
                    None
                };
                if seen_star {
                    args.kwonlyargs.push(arg);
                    args.kw_defaults.push(default);
                } else {
                    match default {
                        Some(d) => args.defaults.push(d),
                        None if !args.defaults.is_empty() => {
                            return Err(ParserError::new(
                                "non-default argument follows default argument",
                                pos,
                            ));
                        }
                        None => {}
                    }
                    args.args.push(arg);
                }
            }

            if !self.cur_is_op(",") {
                break;
            }
            self.next_token()?;
        }

        if seen_star && args.vararg.is_none() && args.kwonlyargs.is_empty() {
            return Err(self.unexpected("named parameter after bare '*'"));
        }
        for arg in args.names() {
            if seen.contains(&arg.name) {
                return Err(ParserError::new(
                    format!("duplicate argument '{}' in function definition", arg.name),
                    arg.position,
                ));
            }
            seen.push(arg.name.clone());
        }
        Ok(args)
    }

    fn parse_param(&mut self, annotations: bool) -> Result<Arg, ParserError> {
        let (name, position) = self.expect_name()?;
        if annotations && self.cur_is_op(":") {
            self.next_token()?;
            self.parse_expression(Precedence::Lowest)?;
        }
        Ok(Arg { position, name })
    }

    // =========================================================================
    // Expression Lists
    // =========================================================================

    /// True if the current token can begin an expression.
    fn can_start_expr(&self) -> bool {
        match self.cur_token.kind {
            TokenKind::Number | TokenKind::String => true,
            TokenKind::Name => {
                !is_keyword(&self.cur_token.text)
                    || matches!(
                        self.cur_token.text.as_str(),
                        "None" | "True" | "False" | "lambda" | "not"
                    )
            }
            TokenKind::Op => matches!(
                self.cur_token.text.as_str(),
                "(" | "[" | "{" | "-" | "+" | "~" | "*" | "..."
            ),
            _ => false,
        }
    }

    /// Expression or `*expr`, with elements folded above `precedence`.
    fn parse_star_or_expr(&mut self, precedence: Precedence) -> Result<Expr, ParserError> {
        if self.cur_is_op("*") {
            let position = self.cur_token.start;
            self.next_token()?;
            let value = self.parse_expression(Precedence::Compare)?;
            return Ok(Expr::Starred(Box::new(StarredExpr {
                position,
                value,
                ctx: ExprContext::Load,
            })));
        }
        self.parse_expression(precedence)
    }

    /// Comma-separated expressions; more than one (or a trailing comma) forms a tuple.
    fn parse_testlist(&mut self, precedence: Precedence) -> Result<Expr, ParserError> {
        let position = self.cur_token.start;
        let first = self.parse_star_or_expr(precedence)?;
        if !self.cur_is_op(",") {
            return Ok(first);
        }
        let mut elts = vec![first];
        while self.cur_is_op(",") {
            self.next_token()?;
            if !self.can_start_expr() {
                break;
            }
            elts.push(self.parse_star_or_expr(precedence)?);
        }
        Ok(Expr::Tuple(SequenceExpr {
            position,
            elts,
            ctx: ExprContext::Load,
        }))
    }

    fn parse_testlist_or_yield(&mut self) -> Result<Expr, ParserError> {
        if self.cur_is_keyword("yield") {
            return self.parse_yield();
        }
        self.parse_testlist(Precedence::Lowest)
    }

    fn parse_yield(&mut self) -> Result<Expr, ParserError> {
        let position = self.cur_token.start;
        self.next_token()?; // consume 'yield'
        if self.cur_is_keyword("from") {
            self.next_token()?;
            let value = self.parse_expression(Precedence::Lowest)?;
            return Ok(Expr::YieldFrom(Box::new(YieldFromExpr { position, value })));
        }
        let value = if self.can_start_expr() {
            Some(self.parse_testlist(Precedence::Lowest)?)
        } else {
            None
        };
        Ok(Expr::Yield(Box::new(YieldExpr { position, value })))
    }

    // =========================================================================
    // Pratt Expression Parsing
    // =========================================================================

    /// Parse an expression, folding operators that bind tighter than `precedence`.
    pub fn parse_expression(&mut self, precedence: Precedence) -> Result<Expr, ParserError> {
        self.enter()?;
        let result = self.parse_expression_inner(precedence);
        self.leave();
        result
    }

    fn parse_expression_inner(&mut self, precedence: Precedence) -> Result<Expr, ParserError> {
        let (mut left, mut height) = self.measure(|p| p.parse_prefix())?;
        loop {
            let next = Precedence::infix(&self.cur_token, &self.peek_token);
            if next <= precedence {
                break;
            }
            // Each fold nests the tree built so far one level deeper.
            let (folded, right) = self.measure(|p| p.parse_infix(left, next))?;
            height = (height + 1).max(right);
            self.reach(self.depth + height)?;
            left = folded;
        }
        Ok(left)
    }

    fn parse_prefix(&mut self) -> Result<Expr, ParserError> {
        let position = self.cur_token.start;
        match self.cur_token.kind {
            TokenKind::Name => self.parse_name_prefix(),
            TokenKind::Number => self.parse_number(),
            TokenKind::String => self.parse_string(),
            TokenKind::Op => match self.cur_token.text.as_str() {
                "-" | "+" | "~" => {
                    let op = match self.cur_token.text.as_str() {
                        "-" => UnaryOperator::USub,
                        "+" => UnaryOperator::UAdd,
                        _ => UnaryOperator::Invert,
                    };
                    self.next_token()?;
                    let operand = self.parse_expression(Precedence::Unary)?;
                    Ok(Expr::UnaryOp(Box::new(UnaryOpExpr {
                        position,
                        op,
                        operand,
                    })))
                }
                "(" => self.parse_grouped(),
                "[" => self.parse_list(),
                "{" => self.parse_brace(),
                "..." => {
                    self.next_token()?;
                    Ok(Expr::Constant(ConstantLit {
                        position,
                        value: Singleton::Ellipsis,
                    }))
                }
                _ => Err(self.unexpected("expression")),
            },
            _ => Err(self.unexpected("expression")),
        }
    }

    fn parse_name_prefix(&mut self) -> Result<Expr, ParserError> {
        let position = self.cur_token.start;
        let constant = match self.cur_token.text.as_str() {
            "None" => Some(Singleton::None),
            "True" => Some(Singleton::True),
            "False" => Some(Singleton::False),
            _ => None,
        };
        if let Some(value) = constant {
            self.next_token()?;
            return Ok(Expr::Constant(ConstantLit { position, value }));
        }

        match self.cur_token.text.as_str() {
            "not" => {
                self.next_token()?;
                let operand = self.parse_expression(Precedence::Not)?;
                Ok(Expr::UnaryOp(Box::new(UnaryOpExpr {
                    position,
                    op: UnaryOperator::Not,
                    operand,
                })))
            }
            "lambda" => self.parse_lambda(),
            text if is_keyword(text) => Err(self.unexpected("expression")),
            _ => {
                let id = self.cur_token.text.clone();
                self.next_token()?;
                Ok(Expr::Name(Name {
                    position,
                    id,
                    ctx: ExprContext::Load,
                }))
            }
        }
    }

    fn parse_number(&mut self) -> Result<Expr, ParserError> {
        let position = self.cur_token.start;
        let value = decode_number(
            &self.cur_token.text,
            position.line_number(),
            position.column_number(),
        )?;
        self.next_token()?;
        Ok(match value {
            NumberValue::Int(value) => Expr::Int(IntLit { position, value }),
            NumberValue::Float(value) => Expr::Float(FloatLit { position, value }),
            NumberValue::Imaginary(value) => Expr::Imaginary(ImaginaryLit { position, value }),
        })
    }

    /// Adjacent string literals concatenate into one node.
    fn parse_string(&mut self) -> Result<Expr, ParserError> {
        let position = self.cur_token.start;
        let mut formatted = false;
        let mut value: Option<StringValue> = None;

        while self.cur_token_is(TokenKind::String) {
            let start = self.cur_token.start;
            let lit = decode_string(
                &self.cur_token.text,
                start.line_number(),
                start.column_number(),
            )?;
            formatted |= lit.formatted;
            value = Some(match (value, lit.value) {
                (None, v) => v,
                (Some(StringValue::Text(mut a)), StringValue::Text(b)) => {
                    a.push_str(&b);
                    StringValue::Text(a)
                }
                (Some(StringValue::Bytes(mut a)), StringValue::Bytes(b)) => {
                    a.extend_from_slice(&b);
                    StringValue::Bytes(a)
                }
                _ => {
                    return Err(ParserError::new(
                        "cannot mix bytes and nonbytes literals",
                        start,
                    ));
                }
            });
            self.next_token()?;
        }

        let value = value.ok_or_else(|| self.unexpected("string"))?;
        Ok(Expr::Str(StrLit {
            position,
            value,
            formatted,
        }))
    }

    /// `( )`, `(expr)`, `(a, b)` or `(yield ...)`.
    fn parse_grouped(&mut self) -> Result<Expr, ParserError> {
        let position = self.expect_op("(")?;
        if self.cur_is_op(")") {
            self.next_token()?;
            return Ok(Expr::Tuple(SequenceExpr {
                position,
                elts: Vec::new(),
                ctx: ExprContext::Load,
            }));
        }
        if self.cur_is_keyword("yield") {
            let expr = self.parse_yield()?;
            self.expect_op(")")?;
            return Ok(expr);
        }

        let first = self.parse_star_or_expr(Precedence::Lowest)?;
        if self.cur_is_keyword("for") {
            return Err(ParserError::new(
                "generator expressions are not supported",
                self.cur_token.start,
            ));
        }
        if !self.cur_is_op(",") {
            self.expect_op(")")?;
            return Ok(first);
        }

        let mut elts = vec![first];
        while self.cur_is_op(",") {
            self.next_token()?;
            if self.cur_is_op(")") {
                break;
            }
            elts.push(self.parse_star_or_expr(Precedence::Lowest)?);
        }
        self.expect_op(")")?;
        Ok(Expr::Tuple(SequenceExpr {
            position,
            elts,
            ctx: ExprContext::Load,
        }))
    }

    /// Comma-separated elements up to `close`, allowing a trailing comma.
    fn parse_elements(&mut self, close: &str) -> Result<Vec<Expr>, ParserError> {
        let mut elts = Vec::new();
        while !self.cur_is_op(close) {
            elts.push(self.parse_star_or_expr(Precedence::Lowest)?);
            if self.cur_is_keyword("for") {
                return Err(ParserError::new(
                    "comprehensions are not supported",
                    self.cur_token.start,
                ));
            }
            if !self.cur_is_op(",") {
                break;
            }
            self.next_token()?;
        }
        self.expect_op(close)?;
        Ok(elts)
    }

    fn parse_list(&mut self) -> Result<Expr, ParserError> {
        let position = self.expect_op("[")?;
        let elts = self.parse_elements("]")?;
        Ok(Expr::List(SequenceExpr {
            position,
            elts,
            ctx: ExprContext::Load,
        }))
    }

    /// Dict or set display.
    fn parse_brace(&mut self) -> Result<Expr, ParserError> {
        let position = self.expect_op("{")?;
        if self.cur_is_op("}") {
            self.next_token()?;
            return Ok(Expr::Dict(DictExpr {
                position,
                keys: Vec::new(),
                values: Vec::new(),
            }));
        }
        if self.cur_is_op("**") {
            return Err(ParserError::new(
                "dict unpacking is not supported",
                self.cur_token.start,
            ));
        }

        let first = self.parse_star_or_expr(Precedence::Lowest)?;
        if !self.cur_is_op(":") {
            let mut elts = vec![first];
            if self.cur_is_keyword("for") {
                return Err(ParserError::new(
                    "comprehensions are not supported",
                    self.cur_token.start,
                ));
            }
            if self.cur_is_op(",") {
                self.next_token()?;
                elts.extend(self.parse_elements("}")?);
            } else {
                self.expect_op("}")?;
            }
            return Ok(Expr::Set(SequenceExpr {
                position,
                elts,
                ctx: ExprContext::Load,
            }));
        }

        let mut keys = vec![first];
        let mut values = Vec::new();
        loop {
            self.expect_op(":")?;
            values.push(self.parse_expression(Precedence::Lowest)?);
            if self.cur_is_keyword("for") {
                return Err(ParserError::new(
                    "comprehensions are not supported",
                    self.cur_token.start,
                ));
            }
            if !self.cur_is_op(",") {
                break;
            }
            self.next_token()?;
            if self.cur_is_op("}") {
                break;
            }
            keys.push(self.parse_expression(Precedence::Lowest)?);
        }
        self.expect_op("}")?;
        Ok(Expr::Dict(DictExpr {
            position,
            keys,
            values,
        }))
    }

    fn parse_lambda(&mut self) -> Result<Expr, ParserError> {
        let position = self.cur_token.start;
        self.next_token()?; // consume 'lambda'
        let args = self.parse_parameters(":", false)?;
        self.expect_op(":")?;
        let id = self.alloc_id();
        let body = self.parse_expression(Precedence::Lowest)?;
        Ok(Expr::Lambda(Box::new(LambdaExpr {
            id,
            position,
            args,
            body,
        })))
    }

    fn parse_infix(&mut self, left: Expr, precedence: Precedence) -> Result<Expr, ParserError> {
        match precedence {
            Precedence::Ternary => self.parse_ternary(left),
            Precedence::Or => self.parse_bool_op(left, BoolOperator::Or, "or", precedence),
            Precedence::And => self.parse_bool_op(left, BoolOperator::And, "and", precedence),
            Precedence::Compare => self.parse_compare(left),
            Precedence::Postfix => match self.cur_token.text.as_str() {
                "(" => self.parse_call(left),
                "[" => self.parse_subscript(left),
                _ => self.parse_attribute(left),
            },
            _ => self.parse_binary(left, precedence),
        }
    }

    fn parse_binary(&mut self, left: Expr, precedence: Precedence) -> Result<Expr, ParserError> {
        let op = BinaryOperator::from_op(&self.cur_token.text)
            .ok_or_else(|| self.unexpected("binary operator"))?;
        self.next_token()?;
        // Power is right-associative and binds its right operand tighter than unary minus.
        let right_precedence = if op == BinaryOperator::Pow {
            Precedence::Unary
        } else {
            precedence
        };
        let right = self.parse_expression(right_precedence)?;
        Ok(Expr::BinOp(Box::new(BinOpExpr { left, op, right })))
    }

    fn parse_ternary(&mut self, body: Expr) -> Result<Expr, ParserError> {
        self.next_token()?; // consume 'if'
        let test = self.parse_expression(Precedence::Ternary)?;
        self.expect_keyword("else")?;
        let orelse = self.parse_expression(Precedence::Lowest)?;
        Ok(Expr::IfExp(Box::new(IfExpr { test, body, orelse })))
    }

    /// Folds a run of the same boolean operator into one node.
    fn parse_bool_op(
        &mut self,
        left: Expr,
        op: BoolOperator,
        keyword: &str,
        precedence: Precedence,
    ) -> Result<Expr, ParserError> {
        let position = left.pos();
        let mut values = vec![left];
        while self.cur_is_keyword(keyword) {
            self.next_token()?;
            values.push(self.parse_expression(precedence)?);
        }
        Ok(Expr::BoolOp(BoolOpExpr {
            position,
            op,
            values,
        }))
    }

    /// Consume a comparison operator, if one is next.
    fn parse_compare_op(&mut self) -> Result<Option<CompareOperator>, ParserError> {
        let op = match (self.cur_token.kind, self.cur_token.text.as_str()) {
            (TokenKind::Op, "<") => CompareOperator::Lt,
            (TokenKind::Op, ">") => CompareOperator::Gt,
            (TokenKind::Op, "==") => CompareOperator::Eq,
            (TokenKind::Op, ">=") => CompareOperator::GtE,
            (TokenKind::Op, "<=") => CompareOperator::LtE,
            (TokenKind::Op, "!=") => CompareOperator::NotEq,
            (TokenKind::Name, "in") => CompareOperator::In,
            (TokenKind::Name, "not") if self.peek_token.is_keyword("in") => {
                self.next_token()?;
                CompareOperator::NotIn
            }
            (TokenKind::Name, "is") => {
                if self.peek_token.is_keyword("not") {
                    self.next_token()?;
                    CompareOperator::IsNot
                } else {
                    CompareOperator::Is
                }
            }
            _ => return Ok(None),
        };
        self.next_token()?;
        Ok(Some(op))
    }

    /// `a < b < c` becomes a single node with two operators.
    fn parse_compare(&mut self, left: Expr) -> Result<Expr, ParserError> {
        let mut ops = Vec::new();
        let mut comparators = Vec::new();
        while let Some(op) = self.parse_compare_op()? {
            ops.push(op);
            comparators.push(self.parse_expression(Precedence::Compare)?);
        }
        Ok(Expr::Compare(Box::new(CompareExpr {
            left,
            ops,
            comparators,
        })))
    }

    /// Arguments after an opening '(' up to and including ')'.
    fn parse_call_arguments(&mut self) -> Result<(Vec<Expr>, Vec<Keyword>), ParserError> {
        let mut args = Vec::new();
        let mut keywords: Vec<Keyword> = Vec::new();

        while !self.cur_is_op(")") {
            let position = self.cur_token.start;
            if self.cur_is_op("*") {
                self.next_token()?;
                let value = self.parse_expression(Precedence::Lowest)?;
                args.push(Expr::Starred(Box::new(StarredExpr {
                    position,
                    value,
                    ctx: ExprContext::Load,
                })));
            } else if self.cur_is_op("**") {
                self.next_token()?;
                let value = self.parse_expression(Precedence::Lowest)?;
                keywords.push(Keyword {
                    position,
                    arg: None,
                    value,
                });
            } else if self.cur_token_is(TokenKind::Name)
                && self.peek_token.is_op("=")
                && !is_keyword(&self.cur_token.text)
            {
                let arg = self.cur_token.text.clone();
                self.next_token()?; // name
                self.next_token()?; // '='
                if keywords.iter().any(|k| k.arg.as_deref() == Some(arg.as_str())) {
                    return Err(ParserError::new(
                        format!("keyword argument repeated: {}", arg),
                        position,
                    ));
                }
                let value = self.parse_expression(Precedence::Lowest)?;
                keywords.push(Keyword {
                    position,
                    arg: Some(arg),
                    value,
                });
            } else {
                if !keywords.is_empty() {
                    return Err(ParserError::new(
                        "positional argument follows keyword argument",
                        position,
                    ));
                }
                args.push(self.parse_expression(Precedence::Lowest)?);
                if self.cur_is_keyword("for") {
                    return Err(ParserError::new(
                        "generator expressions are not supported",
                        self.cur_token.start,
                    ));
                }
            }

            if !self.cur_is_op(",") {
                break;
            }
            self.next_token()?;
        }
        self.expect_op(")")?;
        Ok((args, keywords))
    }

    fn parse_call(&mut self, func: Expr) -> Result<Expr, ParserError> {
        self.next_token()?; // consume '('
        let (args, keywords) = self.parse_call_arguments()?;
        Ok(Expr::Call(Box::new(CallExpr {
            func,
            args,
            keywords,
        })))
    }

    fn parse_attribute(&mut self, value: Expr) -> Result<Expr, ParserError> {
        self.next_token()?; // consume '.'
        let (attr, _) = self.expect_name()?;
        Ok(Expr::Attribute(Box::new(AttributeExpr {
            value,
            attr,
            ctx: ExprContext::Load,
        })))
    }

    fn parse_subscript(&mut self, value: Expr) -> Result<Expr, ParserError> {
        let position = self.expect_op("[")?;
        let first = self.parse_slice_item()?;
        let index = if self.cur_is_op(",") {
            let mut elts = vec![first];
            while self.cur_is_op(",") {
                self.next_token()?;
                if self.cur_is_op("]") {
                    break;
                }
                elts.push(self.parse_slice_item()?);
            }
            Expr::Tuple(SequenceExpr {
                position,
                elts,
                ctx: ExprContext::Load,
            })
        } else {
            first
        };
        self.expect_op("]")?;
        Ok(Expr::Subscript(Box::new(SubscriptExpr {
            value,
            index,
            ctx: ExprContext::Load,
        })))
    }

    fn at_slice_bound(&self) -> bool {
        self.cur_is_op("]") || self.cur_is_op(",") || self.cur_is_op(":")
    }

    /// `expr` or `[lower]:[upper][:[step]]`.
    fn parse_slice_item(&mut self) -> Result<Expr, ParserError> {
        let position = self.cur_token.start;
        let lower = if self.cur_is_op(":") {
            None
        } else {
            let expr = self.parse_expression(Precedence::Lowest)?;
            if !self.cur_is_op(":") {
                return Ok(expr);
            }
            Some(expr)
        };
        self.next_token()?; // consume ':'

        let upper = if self.at_slice_bound() {
            None
        } else {
            Some(self.parse_expression(Precedence::Lowest)?)
        };
        let mut step = None;
        if self.cur_is_op(":") {
            self.next_token()?;
            if !self.at_slice_bound() {
                step = Some(self.parse_expression(Precedence::Lowest)?);
            }
        }
        Ok(Expr::Slice(Box::new(SliceExpr {
            position,
            lower,
            upper,
            step,
        })))
    }
}

/// Parse and target-tag a complete source text.
pub fn parse(source: &str) -> Result<Module, ParserError> {
    let mut parser = Parser::new(Lexer::new(source))?;
    let mut module = parser.parse_module()?;
    tag_targets(&mut module)?;
    Ok(module)
}

/// Parse a pre-tokenized stream.
pub fn parse_tokens(tokens: Vec<Token>) -> Result<Module, ParserError> {
    let mut parser = Parser::new(TokenStream::new(tokens))?;
    let mut module = parser.parse_module()?;
    tag_targets(&mut module)?;
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Module {
        parse(source).unwrap_or_else(|e| panic!("parse error: {}", e))
    }

    fn parse_expr(source: &str) -> Expr {
        let module = parse_ok(source);
        assert_eq!(module.body.len(), 1, "expected one statement");
        match module.body.into_iter().next() {
            Some(Stmt::Expr(s)) => s.value,
            other => panic!("expected expression statement, got {:?}", other),
        }
    }

    fn parse_err(source: &str) -> String {
        match parse(source) {
            Ok(m) => panic!("expected error, parsed {:?}", m),
            Err(e) => e.to_string(),
        }
    }

    #[test]
    fn test_integers_and_floats() {
        assert!(matches!(parse_expr("42"), Expr::Int(IntLit { value: 42, .. })));
        assert!(matches!(parse_expr("0x1f"), Expr::Int(IntLit { value: 31, .. })));
        assert!(matches!(parse_expr("2.5"), Expr::Float(_)));
        assert!(matches!(parse_expr("3j"), Expr::Imaginary(_)));
    }

    #[test]
    fn test_string_concatenation() {
        let expr = parse_expr("'ab' \"cd\"");
        match expr {
            Expr::Str(s) => assert_eq!(s.value, StringValue::Text("abcd".into())),
            other => panic!("expected string, got {:?}", other),
        }
        assert!(parse_err("'a' b'b'").contains("cannot mix bytes"));
    }

    #[test]
    fn test_constants() {
        assert!(matches!(
            parse_expr("None"),
            Expr::Constant(ConstantLit { value: Singleton::None, .. })
        ));
        assert!(matches!(
            parse_expr("..."),
            Expr::Constant(ConstantLit { value: Singleton::Ellipsis, .. })
        ));
    }

    #[test]
    fn test_bool_op_precedence() {
        let expr = parse_expr("a or b and c");
        let Expr::BoolOp(or) = &expr else {
            panic!("expected bool op, got {:?}", expr);
        };
        assert_eq!(or.op, BoolOperator::Or);
        assert_eq!(or.values.len(), 2);
        assert!(matches!(&or.values[1], Expr::BoolOp(b) if b.op == BoolOperator::And));
        assert_eq!(expr.to_string(), "(a or (b and c))");
    }

    #[test]
    fn test_bool_op_flattening() {
        let expr = parse_expr("a or b or c");
        assert!(matches!(&expr, Expr::BoolOp(b) if b.values.len() == 3));
        assert_eq!(parse_expr("a and b or c").to_string(), "((a and b) or c)");
    }

    #[test]
    fn test_compare_chain() {
        let expr = parse_expr("a < b < c");
        let Expr::Compare(cmp) = &expr else {
            panic!("expected compare, got {:?}", expr);
        };
        assert_eq!(cmp.ops, vec![CompareOperator::Lt, CompareOperator::Lt]);
        assert_eq!(cmp.comparators.len(), 2);
    }

    #[test]
    fn test_compare_keywords() {
        assert_eq!(parse_expr("a not in b").to_string(), "(a not in b)");
        assert_eq!(parse_expr("a is not b").to_string(), "(a is not b)");
        assert_eq!(parse_expr("not a == b").to_string(), "(not (a == b))");
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(parse_expr("a + b * c").to_string(), "(a + (b * c))");
        assert_eq!(parse_expr("a - b - c").to_string(), "((a - b) - c)");
        assert_eq!(parse_expr("a | b ^ c & d").to_string(), "(a | (b ^ (c & d)))");
        assert_eq!(parse_expr("a << 1 + 2").to_string(), "(a << (1 + 2))");
    }

    #[test]
    fn test_power_right_associative() {
        assert_eq!(parse_expr("2 ** 3 ** 2").to_string(), "(2 ** (3 ** 2))");
        assert_eq!(parse_expr("-2 ** 2").to_string(), "(-(2 ** 2))");
        assert_eq!(parse_expr("2 ** -1").to_string(), "(2 ** (-1))");
    }

    #[test]
    fn test_ternary() {
        assert_eq!(parse_expr("a if b else c").to_string(), "(a if b else c)");
        assert_eq!(
            parse_expr("a if b else c if d else e").to_string(),
            "(a if b else (c if d else e))"
        );
        assert_eq!(parse_expr("a or b if c else d").to_string(), "((a or b) if c else d)");
    }

    #[test]
    fn test_postfix() {
        assert_eq!(parse_expr("a.b(c)[d]").to_string(), "a.b(c)[d]");
        assert_eq!(parse_expr("f(x, *y, k=1, **z)").to_string(), "f(x, *y, k=1, **z)");
        assert_eq!(parse_expr("a[1:2]").to_string(), "a[1:2]");
        assert_eq!(parse_expr("a[::2]").to_string(), "a[::2]");
        assert_eq!(parse_expr("a[1, 2]").to_string(), "a[(1, 2)]");
    }

    #[test]
    fn test_collections() {
        assert_eq!(parse_expr("[1, 2,]").to_string(), "[1, 2]");
        assert_eq!(parse_expr("(1,)").to_string(), "(1,)");
        assert_eq!(parse_expr("()").to_string(), "()");
        assert_eq!(parse_expr("{1: 2, 3: 4}").to_string(), "{1: 2, 3: 4}");
        assert_eq!(parse_expr("{1, 2}").to_string(), "{1, 2}");
        assert!(matches!(parse_expr("{}"), Expr::Dict(_)));
    }

    #[test]
    fn test_multiline_brackets() {
        let expr = parse_expr("[1,\n 2,\n 3]\n");
        assert!(matches!(expr, Expr::List(l) if l.elts.len() == 3));
    }

    #[test]
    fn test_lambda() {
        assert_eq!(parse_expr("lambda x, y=1: x + y").to_string(), "(lambda x, y=1: (x + y))");
        assert!(matches!(parse_expr("lambda: 0"), Expr::Lambda(_)));
    }

    #[test]
    fn test_assignment() {
        let module = parse_ok("a = b = 1\n");
        let Stmt::Assign(assign) = &module.body[0] else {
            panic!("expected assignment");
        };
        assert_eq!(assign.targets.len(), 2);
        assert!(matches!(&assign.targets[0], Expr::Name(n) if n.ctx == ExprContext::Store));
    }

    #[test]
    fn test_tuple_assignment() {
        let module = parse_ok("a, *b = c\n");
        let Stmt::Assign(assign) = &module.body[0] else {
            panic!("expected assignment");
        };
        assert!(matches!(&assign.targets[0], Expr::Tuple(t) if t.elts.len() == 2));
    }

    #[test]
    fn test_augmented_assignment() {
        let module = parse_ok("x //= 2\n");
        assert!(matches!(
            &module.body[0],
            Stmt::AugAssign(a) if a.op == BinaryOperator::FloorDiv
        ));
    }

    #[test]
    fn test_semicolons() {
        let module = parse_ok("a = 1; b = 2;\n");
        assert_eq!(module.body.len(), 2);
    }

    #[test]
    fn test_if_elif_else() {
        let module = parse_ok("if a:\n    x = 1\nelif b:\n    x = 2\nelse:\n    x = 3\n");
        let Stmt::If(stmt) = &module.body[0] else {
            panic!("expected if");
        };
        assert_eq!(stmt.body.len(), 1);
        let Some(Stmt::If(elif)) = stmt.orelse.first() else {
            panic!("expected elif");
        };
        assert_eq!(elif.orelse.len(), 1);
    }

    #[test]
    fn test_single_line_suite() {
        let module = parse_ok("while x: x -= 1\n");
        assert!(matches!(&module.body[0], Stmt::While(w) if w.body.len() == 1));
    }

    #[test]
    fn test_for_else() {
        let module = parse_ok("for i, j in pairs:\n    pass\nelse:\n    done()\n");
        let Stmt::For(stmt) = &module.body[0] else {
            panic!("expected for");
        };
        assert!(matches!(&stmt.target, Expr::Tuple(t) if t.ctx == ExprContext::Store));
        assert_eq!(stmt.orelse.len(), 1);
    }

    #[test]
    fn test_try() {
        let source = "\
try:
    f()
except ValueError as e:
    g(e)
except:
    pass
else:
    h()
finally:
    k()
";
        let module = parse_ok(source);
        let Stmt::Try(stmt) = &module.body[0] else {
            panic!("expected try");
        };
        assert_eq!(stmt.handlers.len(), 2);
        assert_eq!(stmt.handlers[0].name.as_deref(), Some("e"));
        assert!(stmt.handlers[1].type_.is_none());
        assert_eq!(stmt.orelse.len(), 1);
        assert_eq!(stmt.finalbody.len(), 1);
    }

    #[test]
    fn test_bare_except_must_be_last() {
        let err = parse_err("try:\n    pass\nexcept:\n    pass\nexcept E:\n    pass\n");
        assert!(err.contains("must be last"));
    }

    #[test]
    fn test_with() {
        let module = parse_ok("with open(p) as f, lock:\n    pass\n");
        let Stmt::With(stmt) = &module.body[0] else {
            panic!("expected with");
        };
        assert_eq!(stmt.items.len(), 2);
        assert!(stmt.items[1].optional_vars.is_none());
    }

    #[test]
    fn test_function_def() {
        let source = "def f(a, b: int = 1, *args, c, d=2, **kw) -> int:\n    return a\n";
        let module = parse_ok(source);
        let Stmt::FunctionDef(def) = &module.body[0] else {
            panic!("expected def");
        };
        assert_eq!(def.name, "f");
        assert_eq!(def.args.args.len(), 2);
        assert_eq!(def.args.defaults.len(), 1);
        assert_eq!(def.args.vararg.as_ref().map(|a| a.name.as_str()), Some("args"));
        assert_eq!(def.args.kwonlyargs.len(), 2);
        assert!(def.args.kw_defaults[0].is_none());
        assert!(def.args.kwarg.is_some());
        assert_ne!(def.id, module.id);
    }

    #[test]
    fn test_parameter_errors() {
        assert!(parse_err("def f(a=1, b):\n    pass\n").contains("non-default"));
        assert!(parse_err("def f(a, a):\n    pass\n").contains("duplicate argument"));
        assert!(parse_err("def f(*):\n    pass\n").contains("bare '*'"));
    }

    #[test]
    fn test_decorators() {
        let module = parse_ok("@a\n@b.c(1)\ndef f():\n    pass\n");
        let Stmt::FunctionDef(def) = &module.body[0] else {
            panic!("expected def");
        };
        assert_eq!(def.decorators.len(), 2);
        assert!(parse_err("@a\nx = 1\n").contains("after decorator"));
    }

    #[test]
    fn test_class_def() {
        let module = parse_ok("class A(B, metaclass=M):\n    x = 1\n");
        let Stmt::ClassDef(class) = &module.body[0] else {
            panic!("expected class");
        };
        assert_eq!(class.bases.len(), 1);
        assert_eq!(class.keywords.len(), 1);
    }

    #[test]
    fn test_distinct_node_ids() {
        let module = parse_ok("def f():\n    g = lambda: 0\nclass C:\n    pass\n");
        let Stmt::FunctionDef(def) = &module.body[0] else {
            panic!("expected def");
        };
        let Stmt::ClassDef(class) = &module.body[1] else {
            panic!("expected class");
        };
        let Stmt::Assign(assign) = &def.body[0] else {
            panic!("expected assignment");
        };
        let Expr::Lambda(lambda) = &assign.value else {
            panic!("expected lambda");
        };
        let mut ids = vec![module.id, def.id, class.id, lambda.id];
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn test_imports() {
        let module = parse_ok("import a.b as c, d\nfrom ..x import (y as z, w,)\nfrom . import m\nfrom os import *\n");
        assert!(matches!(&module.body[0], Stmt::Import(i) if i.names.len() == 2));
        assert!(matches!(
            &module.body[1],
            Stmt::ImportFrom(i) if i.level == 2 && i.names.len() == 2
        ));
        assert!(matches!(
            &module.body[2],
            Stmt::ImportFrom(i) if i.level == 1 && i.module.is_none()
        ));
        assert!(matches!(&module.body[3], Stmt::ImportFrom(i) if i.names[0].name == "*"));
    }

    #[test]
    fn test_simple_statements() {
        let module = parse_ok(
            "global a, b\ndel x, y[0]\nassert x, 'msg'\nraise E from c\nraise\nreturn\n",
        );
        assert!(matches!(&module.body[0], Stmt::Global(g) if g.names.len() == 2));
        assert!(matches!(&module.body[1], Stmt::Delete(d) if d.targets.len() == 2));
        assert!(matches!(&module.body[2], Stmt::Assert(a) if a.msg.is_some()));
        assert!(matches!(&module.body[3], Stmt::Raise(r) if r.cause.is_some()));
        assert!(matches!(&module.body[4], Stmt::Raise(r) if r.exc.is_none()));
        assert!(matches!(&module.body[5], Stmt::Return(r) if r.value.is_none()));
    }

    #[test]
    fn test_yield() {
        let module = parse_ok("def g():\n    x = yield 1\n    yield from y\n    yield\n");
        let Stmt::FunctionDef(def) = &module.body[0] else {
            panic!("expected def");
        };
        assert!(matches!(&def.body[0], Stmt::Assign(a) if matches!(a.value, Expr::Yield(_))));
        assert!(matches!(&def.body[1], Stmt::Expr(e) if matches!(e.value, Expr::YieldFrom(_))));
        assert!(matches!(&def.body[2], Stmt::Expr(e) if matches!(&e.value, Expr::Yield(y) if y.value.is_none())));
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let module = parse_ok("# header\n\nx = 1  # trailing\n\n\ny = 2\n");
        assert_eq!(module.body.len(), 2);
    }

    #[test]
    fn test_syntax_error_cites_token_and_line() {
        let err = parse("x = 1\nif x\n    pass\n").unwrap_err();
        assert_eq!(err.line(), Some(2));
        assert!(err.to_string().contains("expected ':'"));
        assert!(err.to_string().contains("NEWLINE"));
    }

    #[test]
    fn test_unsupported_forms() {
        assert!(parse_err("[x for x in y]\n").contains("comprehensions"));
        assert!(parse_err("async def f():\n    pass\n").contains("async"));
        assert!(parse_err("x: int = 1\n").contains("annotated"));
    }

    #[test]
    fn test_nesting_limit_counts_operator_chains() {
        let within = format!("x = 1{}\n", "+1".repeat(MAX_NESTING - 10));
        parse_ok(&within);

        let chain = format!("x = 1{}\n", "+1".repeat(MAX_NESTING * 5));
        assert!(parse_err(&chain).contains("maximum nesting depth"));

        let calls = format!("f{}\n", "()".repeat(MAX_NESTING * 5));
        assert!(parse_err(&calls).contains("maximum nesting depth"));

        let parens = format!("{}x{}\n", "(".repeat(MAX_NESTING + 1), ")".repeat(MAX_NESTING + 1));
        assert!(parse_err(&parens).contains("maximum nesting depth"));
    }

    #[test]
    fn test_nesting_limit_sees_chains_after_deep_operands() {
        // Each level's chain comes after its deeply nested left operand.
        let mut source = String::from("x");
        for _ in 0..30 {
            source = format!("({}){}", source, "+1".repeat(30));
        }
        assert!(parse_err(&format!("{}\n", source)).contains("maximum nesting depth"));
    }

    #[test]
    fn test_parse_tokens() {
        let tokens = mpyc_lexer::tokenize("a + 1\n").unwrap();
        let module = parse_tokens(tokens).unwrap();
        assert_eq!(module.body.len(), 1);
    }
}
