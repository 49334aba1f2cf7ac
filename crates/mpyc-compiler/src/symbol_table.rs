//! Static scope resolution.
//!
//! Symbol tables are built in two passes. The upward pass walks the AST once,
//! recording definitions and uses against the innermost scope; when a scope
//! is left, its free names are handed to its parent, which marks its own
//! matching symbols as captured by a child. The downward pass (`finalize`)
//! then runs parent-first, deciding which locals become cells and laying out
//! the local slots of every scope.
//!
//! Function and class scopes skip enclosing class bodies when looking for
//! their parent: a method closes over the function around the class, never
//! over the class namespace. The class body still has to pass those cells
//! down when it creates the method, so it receives them as forwarded upvalues.

use indexmap::{IndexMap, IndexSet};
use mpyc_parser::*;
use thiserror::Error;

/// Static binding errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SymbolTableError {
    #[error("name '{name}' is nonlocal and global at line {line}")]
    GlobalAndNonlocal { name: String, line: usize },
    #[error("name '{name}' is used prior to global/nonlocal declaration at line {line}")]
    DeclarationAfterUse { name: String, line: usize },
    #[error("name '{name}' is parameter and global/nonlocal at line {line}")]
    ParameterDeclared { name: String, line: usize },
    #[error("no binding for nonlocal '{name}' found at line {line}")]
    NoNonlocalBinding { name: String, line: usize },
    #[error("nonlocal declaration of '{name}' not allowed at module level at line {line}")]
    NonlocalAtModule { name: String, line: usize },
}

/// Kind of a lexical scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Function,
    Class,
}

/// How a name is accessed at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Local slot of the current frame.
    Fast(u32),
    /// Cell held in a local slot, either owned or received from a parent.
    Deref(u32),
    /// Module globals by name.
    Global,
    /// Current namespace by name (module and class bodies).
    Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Name,
    Global,
    Fast,
    Deref,
}

/// Per-scope record of one identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Symbol {
    pub is_def: bool,
    pub is_use: bool,
    pub is_use_in_children: bool,
    pub is_param: bool,
    pub is_fastlocal: bool,
    pub is_global: bool,
    pub is_nonlocal: bool,
    /// Line of the global/nonlocal declaration, if any.
    pub declared_at: usize,
}

impl Symbol {
    /// Not bound in this scope, or explicitly bound elsewhere.
    pub fn is_free(&self) -> bool {
        !self.is_def || self.is_nonlocal
    }

    /// Bound here and read by a nested scope.
    pub fn is_cell(&self) -> bool {
        self.is_fastlocal && self.is_def && self.is_use_in_children
    }
}

/// Local slot assignment of a finalized scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layout {
    pub upvals: Vec<String>,
    pub params: Vec<String>,
    pub locals: Vec<String>,
    pub cells: Vec<String>,
    slots: IndexMap<String, u32>,
}

impl Layout {
    /// All local slot names, in slot order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }
}

/// Symbols of a single scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolTable {
    id: NodeId,
    name: String,
    kind: ScopeKind,
    parent: Option<NodeId>,
    symbols: IndexMap<String, Symbol>,
    /// Names read free by child scopes.
    children_free: IndexSet<String>,
    /// Names a class body must receive so it can pass them to its methods.
    forwarded: IndexSet<String>,
    is_generator: bool,
    cellvars: IndexSet<String>,
    layout: Layout,
    access: IndexMap<String, Access>,
}

impl SymbolTable {
    fn new(id: NodeId, name: &str, kind: ScopeKind, parent: Option<NodeId>) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind,
            parent,
            symbols: IndexMap::new(),
            children_free: IndexSet::new(),
            forwarded: IndexSet::new(),
            is_generator: false,
            cellvars: IndexSet::new(),
            layout: Layout::default(),
            access: IndexMap::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_generator(&self) -> bool {
        self.is_generator
    }

    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    pub fn symbols(&self) -> impl Iterator<Item = (&str, &Symbol)> {
        self.symbols.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Names received from the parent as cells, in the parent's order.
    pub fn upvals(&self) -> &[String] {
        &self.layout.upvals
    }

    /// Number of local slots.
    pub fn n_locals(&self) -> u32 {
        self.layout.slots.len() as u32
    }

    pub fn slot(&self, name: &str) -> Option<u32> {
        self.layout.slots.get(name).copied()
    }

    /// Slots that must be turned into cells on entry.
    pub fn cell_slots(&self) -> Vec<u32> {
        self.cellvars
            .iter()
            .filter_map(|name| self.slot(name))
            .collect()
    }

    pub fn is_cellvar(&self, name: &str) -> bool {
        self.cellvars.contains(name)
    }

    /// Runtime access for `name` in this scope.
    pub fn access(&self, name: &str) -> Access {
        match self.access.get(name) {
            Some(access) => *access,
            None if self.kind == ScopeKind::Function => Access::Global,
            None => Access::Name,
        }
    }

    fn reference(&mut self, name: &str) -> &mut Symbol {
        self.symbols.entry(name.to_string()).or_default()
    }

    fn add_def(&mut self, name: &str) {
        let is_function = self.kind == ScopeKind::Function;
        let sym = self.reference(name);
        sym.is_def = true;
        if !sym.is_global && !sym.is_nonlocal && is_function {
            sym.is_fastlocal = true;
        }
    }

    fn add_param(&mut self, name: &str) {
        self.add_def(name);
        self.reference(name).is_param = true;
    }

    fn add_use(&mut self, name: &str) {
        self.reference(name).is_use = true;
    }

    fn check_pristine(&self, name: &str, line: usize) -> Result<(), SymbolTableError> {
        let Some(sym) = self.symbols.get(name) else {
            return Ok(());
        };
        if sym.is_param {
            return Err(SymbolTableError::ParameterDeclared {
                name: name.to_string(),
                line,
            });
        }
        if sym.is_def || sym.is_use {
            return Err(SymbolTableError::DeclarationAfterUse {
                name: name.to_string(),
                line,
            });
        }
        Ok(())
    }

    /// Names this scope needs from its parent.
    fn free_names(&self) -> impl Iterator<Item = &String> {
        self.symbols
            .iter()
            .filter(|(_, sym)| sym.is_free())
            .map(|(name, _)| name)
            .chain(self.forwarded.iter())
    }
}

/// All symbol tables of a module, keyed by the node that opens each scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolTables {
    tables: IndexMap<NodeId, SymbolTable>,
}

impl SymbolTables {
    /// Build and finalize the symbol tables of `module`.
    pub fn build(module: &Module) -> Result<Self, SymbolTableError> {
        let mut builder = Builder::default();
        builder.visit_module(module)?;
        let mut tables = SymbolTables {
            tables: builder.tables,
        };
        tables.finalize()?;
        Ok(tables)
    }

    pub fn get(&self, id: NodeId) -> Option<&SymbolTable> {
        self.tables.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SymbolTable> {
        self.tables.values()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Tables are created parent-first, so insertion order is top-down.
    fn finalize(&mut self) -> Result<(), SymbolTableError> {
        for index in 0..self.tables.len() {
            let (cellvars, layout, access) = self.compute(index)?;
            if let Some((_, table)) = self.tables.get_index_mut(index) {
                table.cellvars = cellvars;
                table.layout = layout;
                table.access = access;
            }
        }
        Ok(())
    }

    fn ancestors<'a>(&'a self, table: &SymbolTable) -> impl Iterator<Item = &'a SymbolTable> {
        std::iter::successors(
            table.parent.and_then(|id| self.tables.get(&id)),
            |t| t.parent.and_then(|id| self.tables.get(&id)),
        )
    }

    /// Resolution of a name that is not bound in `table`.
    fn resolve_free(&self, table: &SymbolTable, name: &str) -> Resolution {
        if self.ancestors(table).any(|p| p.cellvars.contains(name)) {
            Resolution::Deref
        } else if table.kind == ScopeKind::Function {
            Resolution::Global
        } else {
            Resolution::Name
        }
    }

    fn resolve(&self, table: &SymbolTable, cellvars: &IndexSet<String>, name: &str) -> Resolution {
        let Some(sym) = table.symbols.get(name) else {
            return self.resolve_free(table, name);
        };
        if sym.is_free() {
            return self.resolve_free(table, name);
        }
        if cellvars.contains(name) {
            Resolution::Deref
        } else if sym.is_global {
            Resolution::Global
        } else if table.kind == ScopeKind::Function && sym.is_fastlocal {
            Resolution::Fast
        } else {
            Resolution::Name
        }
    }

    #[allow(clippy::type_complexity)]
    fn compute(
        &self,
        index: usize,
    ) -> Result<(IndexSet<String>, Layout, IndexMap<String, Access>), SymbolTableError> {
        let Some((_, table)) = self.tables.get_index(index) else {
            return Ok(Default::default());
        };

        for (name, sym) in &table.symbols {
            if !sym.is_nonlocal {
                continue;
            }
            let bound = self
                .ancestors(table)
                .filter(|p| p.kind != ScopeKind::Module)
                .any(|p| p.symbols.get(name).is_some_and(|s| s.is_def));
            if !bound {
                return Err(SymbolTableError::NoNonlocalBinding {
                    name: name.clone(),
                    line: sym.declared_at,
                });
            }
        }

        let cellvars: IndexSet<String> = table
            .symbols
            .iter()
            .filter(|(_, sym)| sym.is_cell())
            .map(|(name, _)| name.clone())
            .collect();

        let mut layout = Layout::default();
        if let Some(parent) = table.parent.and_then(|id| self.tables.get(&id)) {
            if parent.kind != ScopeKind::Module {
                for name in parent.symbols.keys() {
                    let needed = match table.symbols.get(name) {
                        Some(sym) => {
                            sym.is_free()
                                && self.resolve(table, &cellvars, name) == Resolution::Deref
                        }
                        None => false,
                    };
                    let forwarded = table.forwarded.contains(name)
                        && self.resolve_free(table, name) == Resolution::Deref;
                    if needed || forwarded {
                        layout.upvals.push(name.clone());
                    }
                }
            }
        }

        for (name, sym) in &table.symbols {
            let resolution = self.resolve(table, &cellvars, name);
            let is_cell = cellvars.contains(name);
            if resolution == Resolution::Deref && !is_cell {
                continue;
            }
            if sym.is_fastlocal || resolution == Resolution::Deref {
                if sym.is_param {
                    layout.params.push(name.clone());
                } else if is_cell {
                    layout.cells.push(name.clone());
                } else {
                    layout.locals.push(name.clone());
                }
            }
        }

        for name in layout
            .upvals
            .iter()
            .chain(&layout.params)
            .chain(&layout.locals)
            .chain(&layout.cells)
        {
            let slot = layout.slots.len() as u32;
            layout.slots.entry(name.clone()).or_insert(slot);
        }

        let mut access = IndexMap::new();
        for name in table.symbols.keys() {
            let resolved = match self.resolve(table, &cellvars, name) {
                Resolution::Fast => layout.slots.get(name).map(|s| Access::Fast(*s)),
                Resolution::Deref => layout.slots.get(name).map(|s| Access::Deref(*s)),
                Resolution::Global => Some(Access::Global),
                Resolution::Name => Some(Access::Name),
            };
            match resolved {
                Some(a) => {
                    access.insert(name.clone(), a);
                }
                None => unreachable!("'{}' resolved to a slot that was never laid out", name),
            }
        }

        Ok((cellvars, layout, access))
    }
}

/// Upward pass over the AST.
#[derive(Default)]
struct Builder {
    tables: IndexMap<NodeId, SymbolTable>,
    /// Lexically enclosing scopes, innermost last.
    stack: Vec<NodeId>,
}

impl Builder {
    fn current(&mut self) -> &mut SymbolTable {
        let id = self.stack.last().copied().unwrap_or_default();
        self.tables
            .get_mut(&id)
            .unwrap_or_else(|| unreachable!("scope {} not registered", id))
    }

    /// Nearest enclosing scope that is not a class body.
    fn function_parent(&self) -> Option<NodeId> {
        self.stack
            .iter()
            .rev()
            .find(|id| {
                self.tables
                    .get(*id)
                    .is_some_and(|t| t.kind != ScopeKind::Class)
            })
            .copied()
    }

    fn push_scope(&mut self, id: NodeId, name: &str, kind: ScopeKind) {
        let parent = self.function_parent();
        self.tables.insert(id, SymbolTable::new(id, name, kind, parent));
        self.stack.push(id);
    }

    fn pop_scope(&mut self) {
        let Some(id) = self.stack.pop() else {
            return;
        };
        let Some(table) = self.tables.get_mut(&id) else {
            return;
        };
        for name in table.children_free.clone() {
            table.reference(&name).is_use_in_children = true;
        }
        let free: Vec<String> = table.free_names().cloned().collect();
        let parent = table.parent;

        if let Some(parent) = parent.and_then(|p| self.tables.get_mut(&p)) {
            parent.children_free.extend(free.iter().cloned());
        }
        if let Some(lexical) = self.stack.last().and_then(|p| self.tables.get_mut(p)) {
            if lexical.kind == ScopeKind::Class {
                lexical.forwarded.extend(free);
            }
        }
    }

    fn visit_module(&mut self, module: &Module) -> Result<(), SymbolTableError> {
        self.push_scope(module.id, "<module>", ScopeKind::Module);
        self.visit_body(&module.body)?;
        self.pop_scope();
        Ok(())
    }

    fn visit_body(&mut self, body: &[Stmt]) -> Result<(), SymbolTableError> {
        for stmt in body {
            self.visit_stmt(stmt)?;
        }
        Ok(())
    }

    fn visit_exprs(&mut self, exprs: &[Expr]) {
        for expr in exprs {
            self.visit_expr(expr);
        }
    }

    fn visit_stmt(&mut self, stmt: &Stmt) -> Result<(), SymbolTableError> {
        match stmt {
            Stmt::Expr(s) => self.visit_expr(&s.value),
            Stmt::Assign(s) => {
                self.visit_exprs(&s.targets);
                self.visit_expr(&s.value);
            }
            Stmt::AugAssign(s) => {
                if let Expr::Name(name) = &s.target {
                    self.current().add_use(&name.id);
                }
                self.visit_expr(&s.target);
                self.visit_expr(&s.value);
            }
            Stmt::If(s) => {
                self.visit_expr(&s.test);
                self.visit_body(&s.body)?;
                self.visit_body(&s.orelse)?;
            }
            Stmt::While(s) => {
                self.visit_expr(&s.test);
                self.visit_body(&s.body)?;
                self.visit_body(&s.orelse)?;
            }
            Stmt::For(s) => {
                self.visit_expr(&s.target);
                self.visit_expr(&s.iter);
                self.visit_body(&s.body)?;
                self.visit_body(&s.orelse)?;
            }
            Stmt::With(s) => {
                for item in &s.items {
                    self.visit_expr(&item.context_expr);
                    if let Some(vars) = &item.optional_vars {
                        self.visit_expr(vars);
                    }
                }
                self.visit_body(&s.body)?;
            }
            Stmt::Try(s) => {
                self.visit_body(&s.body)?;
                for handler in &s.handlers {
                    if let Some(type_) = &handler.type_ {
                        self.visit_expr(type_);
                    }
                    if let Some(name) = &handler.name {
                        self.current().add_def(name);
                    }
                    self.visit_body(&handler.body)?;
                }
                self.visit_body(&s.orelse)?;
                self.visit_body(&s.finalbody)?;
            }
            Stmt::FunctionDef(def) => {
                self.visit_exprs(&def.decorators);
                self.visit_defaults(&def.args);
                self.current().add_def(&def.name);
                self.push_scope(def.id, &def.name, ScopeKind::Function);
                self.add_params(&def.args);
                self.visit_body(&def.body)?;
                self.pop_scope();
            }
            Stmt::ClassDef(def) => {
                self.visit_exprs(&def.decorators);
                self.visit_exprs(&def.bases);
                for kw in &def.keywords {
                    self.visit_expr(&kw.value);
                }
                self.current().add_def(&def.name);
                self.push_scope(def.id, &def.name, ScopeKind::Class);
                self.visit_body(&def.body)?;
                self.pop_scope();
            }
            Stmt::Return(s) => {
                if let Some(value) = &s.value {
                    self.visit_expr(value);
                }
            }
            Stmt::Delete(s) => self.visit_exprs(&s.targets),
            Stmt::Raise(s) => {
                if let Some(exc) = &s.exc {
                    self.visit_expr(exc);
                }
                if let Some(cause) = &s.cause {
                    self.visit_expr(cause);
                }
            }
            Stmt::Assert(s) => {
                self.visit_expr(&s.test);
                if let Some(msg) = &s.msg {
                    self.visit_expr(msg);
                }
            }
            Stmt::Import(s) => {
                for alias in &s.names {
                    let bound = match &alias.asname {
                        Some(asname) => asname.as_str(),
                        None => alias.name.split('.').next().unwrap_or(&alias.name),
                    };
                    self.current().add_def(bound);
                }
            }
            Stmt::ImportFrom(s) => {
                for alias in s.names.iter().filter(|a| a.name != "*") {
                    let bound = alias.asname.as_ref().unwrap_or(&alias.name);
                    self.current().add_def(bound);
                }
            }
            Stmt::Global(s) => {
                let line = s.position.line_number();
                for name in &s.names {
                    self.add_global(name, line)?;
                }
            }
            Stmt::Nonlocal(s) => {
                let line = s.position.line_number();
                for name in &s.names {
                    self.add_nonlocal(name, line)?;
                }
            }
            Stmt::Pass(_) | Stmt::Break(_) | Stmt::Continue(_) => {}
        }
        Ok(())
    }

    fn add_global(&mut self, name: &str, line: usize) -> Result<(), SymbolTableError> {
        let scope = self.current();
        scope.check_pristine(name, line)?;
        let sym = scope.reference(name);
        if sym.is_nonlocal {
            return Err(SymbolTableError::GlobalAndNonlocal {
                name: name.to_string(),
                line,
            });
        }
        sym.is_global = true;
        sym.declared_at = line;
        if let Some(module) = self.stack.first().and_then(|id| self.tables.get_mut(id)) {
            module.reference(name).is_global = true;
        }
        Ok(())
    }

    fn add_nonlocal(&mut self, name: &str, line: usize) -> Result<(), SymbolTableError> {
        let scope = self.current();
        if scope.kind == ScopeKind::Module {
            return Err(SymbolTableError::NonlocalAtModule {
                name: name.to_string(),
                line,
            });
        }
        scope.check_pristine(name, line)?;
        let sym = scope.reference(name);
        if sym.is_global {
            return Err(SymbolTableError::GlobalAndNonlocal {
                name: name.to_string(),
                line,
            });
        }
        sym.is_nonlocal = true;
        sym.declared_at = line;
        Ok(())
    }

    fn visit_defaults(&mut self, args: &Arguments) {
        self.visit_exprs(&args.defaults);
        for default in args.kw_defaults.iter().flatten() {
            self.visit_expr(default);
        }
    }

    fn add_params(&mut self, args: &Arguments) {
        let scope = self.current();
        for arg in args.names() {
            scope.add_param(&arg.name);
        }
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Name(name) => match name.ctx {
                ExprContext::Load => self.current().add_use(&name.id),
                ExprContext::Store | ExprContext::Del => self.current().add_def(&name.id),
            },
            Expr::Int(_)
            | Expr::Float(_)
            | Expr::Imaginary(_)
            | Expr::Str(_)
            | Expr::Constant(_) => {}
            Expr::BinOp(e) => {
                self.visit_expr(&e.left);
                self.visit_expr(&e.right);
            }
            Expr::UnaryOp(e) => self.visit_expr(&e.operand),
            Expr::BoolOp(e) => self.visit_exprs(&e.values),
            Expr::Compare(e) => {
                self.visit_expr(&e.left);
                self.visit_exprs(&e.comparators);
            }
            Expr::Call(e) => {
                self.visit_expr(&e.func);
                self.visit_exprs(&e.args);
                for kw in &e.keywords {
                    self.visit_expr(&kw.value);
                }
            }
            Expr::Attribute(e) => self.visit_expr(&e.value),
            Expr::Subscript(e) => {
                self.visit_expr(&e.value);
                self.visit_expr(&e.index);
            }
            Expr::Slice(e) => {
                for part in [&e.lower, &e.upper, &e.step].into_iter().flatten() {
                    self.visit_expr(part);
                }
            }
            Expr::Tuple(e) | Expr::List(e) | Expr::Set(e) => self.visit_exprs(&e.elts),
            Expr::Dict(e) => {
                for (key, value) in e.keys.iter().zip(&e.values) {
                    self.visit_expr(key);
                    self.visit_expr(value);
                }
            }
            Expr::Lambda(e) => {
                self.visit_defaults(&e.args);
                self.push_scope(e.id, "<lambda>", ScopeKind::Function);
                self.add_params(&e.args);
                self.visit_expr(&e.body);
                self.pop_scope();
            }
            Expr::IfExp(e) => {
                self.visit_expr(&e.test);
                self.visit_expr(&e.body);
                self.visit_expr(&e.orelse);
            }
            Expr::Starred(e) => self.visit_expr(&e.value),
            Expr::Yield(e) => {
                self.current().is_generator = true;
                if let Some(value) = &e.value {
                    self.visit_expr(value);
                }
            }
            Expr::YieldFrom(e) => {
                self.current().is_generator = true;
                self.visit_expr(&e.value);
            }
        }
    }
}
