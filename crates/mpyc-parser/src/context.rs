//! Access-mode tagging of assignment and deletion targets.
//!
//! The parser builds every expression with [`ExprContext::Load`]. This pass
//! walks the statements once and rewrites the context of each target subtree
//! in place, rejecting expressions that cannot be assigned to or deleted.

use crate::ast::*;
use crate::parser::ParserError;

/// Tag every target in `module` with its Store or Del context.
pub fn tag_targets(module: &mut Module) -> Result<(), ParserError> {
    tag_body(&mut module.body)
}

fn tag_body(body: &mut [Stmt]) -> Result<(), ParserError> {
    for stmt in body {
        tag_stmt(stmt)?;
    }
    Ok(())
}

fn tag_stmt(stmt: &mut Stmt) -> Result<(), ParserError> {
    match stmt {
        Stmt::Assign(s) => {
            for target in &mut s.targets {
                set_context(target, ExprContext::Store)?;
            }
        }
        Stmt::AugAssign(s) => {
            if !matches!(
                s.target,
                Expr::Name(_) | Expr::Attribute(_) | Expr::Subscript(_)
            ) {
                return Err(ParserError::new(
                    format!(
                        "'{}' is an illegal expression for augmented assignment",
                        describe(&s.target)
                    ),
                    s.target.pos(),
                ));
            }
            set_context(&mut s.target, ExprContext::Store)?;
        }
        Stmt::Delete(s) => {
            for target in &mut s.targets {
                set_context(target, ExprContext::Del)?;
            }
        }
        Stmt::For(s) => {
            set_context(&mut s.target, ExprContext::Store)?;
            tag_body(&mut s.body)?;
            tag_body(&mut s.orelse)?;
        }
        Stmt::With(s) => {
            for item in &mut s.items {
                if let Some(vars) = &mut item.optional_vars {
                    set_context(vars, ExprContext::Store)?;
                }
            }
            tag_body(&mut s.body)?;
        }
        Stmt::If(s) => {
            tag_body(&mut s.body)?;
            tag_body(&mut s.orelse)?;
        }
        Stmt::While(s) => {
            tag_body(&mut s.body)?;
            tag_body(&mut s.orelse)?;
        }
        Stmt::Try(s) => {
            tag_body(&mut s.body)?;
            for handler in &mut s.handlers {
                tag_body(&mut handler.body)?;
            }
            tag_body(&mut s.orelse)?;
            tag_body(&mut s.finalbody)?;
        }
        Stmt::FunctionDef(s) => tag_body(&mut s.body)?,
        Stmt::ClassDef(s) => tag_body(&mut s.body)?,
        Stmt::Expr(_)
        | Stmt::Return(_)
        | Stmt::Raise(_)
        | Stmt::Assert(_)
        | Stmt::Import(_)
        | Stmt::ImportFrom(_)
        | Stmt::Global(_)
        | Stmt::Nonlocal(_)
        | Stmt::Pass(_)
        | Stmt::Break(_)
        | Stmt::Continue(_) => {}
    }
    Ok(())
}

/// Push `ctx` onto a target expression and its nested targets.
fn set_context(expr: &mut Expr, ctx: ExprContext) -> Result<(), ParserError> {
    match expr {
        Expr::Name(e) => e.ctx = ctx,
        Expr::Attribute(e) => e.ctx = ctx,
        Expr::Subscript(e) => e.ctx = ctx,
        Expr::Tuple(e) | Expr::List(e) => {
            e.ctx = ctx;
            let starred = e
                .elts
                .iter()
                .filter(|elt| matches!(elt, Expr::Starred(_)))
                .count();
            if starred > 1 {
                return Err(ParserError::new(
                    "multiple starred expressions in assignment",
                    e.position,
                ));
            }
            for elt in &mut e.elts {
                match elt {
                    Expr::Starred(star) if ctx == ExprContext::Store => {
                        star.ctx = ctx;
                        set_context(&mut star.value, ctx)?;
                    }
                    _ => set_context(elt, ctx)?,
                }
            }
        }
        Expr::Starred(e) => {
            let message = match ctx {
                ExprContext::Del => "cannot delete starred",
                _ => "starred assignment target must be in a list or tuple",
            };
            return Err(ParserError::new(message, e.position));
        }
        other => {
            let verb = match ctx {
                ExprContext::Del => "delete",
                _ => "assign to",
            };
            return Err(ParserError::new(
                format!("cannot {} {}", verb, describe(other)),
                other.pos(),
            ));
        }
    }
    Ok(())
}

fn describe(expr: &Expr) -> &'static str {
    match expr {
        Expr::Name(_) => "name",
        Expr::Attribute(_) => "attribute",
        Expr::Subscript(_) => "subscript",
        Expr::Tuple(_) => "tuple",
        Expr::List(_) => "list",
        Expr::Int(_) | Expr::Float(_) | Expr::Imaginary(_) | Expr::Str(_) => "literal",
        Expr::Constant(_) => "keyword",
        Expr::BinOp(_) | Expr::UnaryOp(_) | Expr::BoolOp(_) => "operator",
        Expr::Compare(_) => "comparison",
        Expr::Call(_) => "function call",
        Expr::Slice(_) => "slice",
        Expr::Set(_) => "set display",
        Expr::Dict(_) => "dict display",
        Expr::Lambda(_) => "lambda",
        Expr::IfExp(_) => "conditional expression",
        Expr::Starred(_) => "starred",
        Expr::Yield(_) | Expr::YieldFrom(_) => "yield expression",
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::*;
    use crate::parser::parse;

    fn first_stmt(source: &str) -> Stmt {
        let module = parse(source).unwrap_or_else(|e| panic!("parse error: {}", e));
        module.body.into_iter().next().expect("one statement")
    }

    #[test]
    fn test_nested_targets_get_store() {
        let Stmt::Assign(assign) = first_stmt("(a, [b, *c]), d.e, f[0] = x\n") else {
            panic!("expected assignment");
        };
        let Expr::Tuple(outer) = &assign.targets[0] else {
            panic!("expected tuple target");
        };
        assert_eq!(outer.ctx, ExprContext::Store);
        let Expr::Tuple(inner) = &outer.elts[0] else {
            panic!("expected nested tuple");
        };
        assert!(matches!(&inner.elts[0], Expr::Name(n) if n.ctx == ExprContext::Store));
        let Expr::List(list) = &inner.elts[1] else {
            panic!("expected list");
        };
        assert!(matches!(
            &list.elts[1],
            Expr::Starred(s) if s.ctx == ExprContext::Store
                && matches!(&s.value, Expr::Name(n) if n.ctx == ExprContext::Store)
        ));
        assert!(matches!(&outer.elts[1], Expr::Attribute(a) if a.ctx == ExprContext::Store));
        assert!(matches!(&outer.elts[2], Expr::Subscript(s) if s.ctx == ExprContext::Store));
    }

    #[test]
    fn test_value_side_stays_load() {
        let Stmt::Assign(assign) = first_stmt("a = b.c\n") else {
            panic!("expected assignment");
        };
        assert!(matches!(&assign.value, Expr::Attribute(a) if a.ctx == ExprContext::Load));
    }

    #[test]
    fn test_delete_targets() {
        let Stmt::Delete(del) = first_stmt("del a, b.c, (d, e)\n") else {
            panic!("expected del");
        };
        assert!(matches!(&del.targets[0], Expr::Name(n) if n.ctx == ExprContext::Del));
        assert!(matches!(&del.targets[1], Expr::Attribute(a) if a.ctx == ExprContext::Del));
        assert!(matches!(&del.targets[2], Expr::Tuple(t) if t.ctx == ExprContext::Del));
    }

    #[test]
    fn test_nested_bodies_are_tagged() {
        let Stmt::FunctionDef(def) = first_stmt("def f():\n    for i in r:\n        x = i\n")
        else {
            panic!("expected def");
        };
        let Stmt::For(for_stmt) = &def.body[0] else {
            panic!("expected for");
        };
        assert!(matches!(&for_stmt.target, Expr::Name(n) if n.ctx == ExprContext::Store));
        assert!(matches!(
            &for_stmt.body[0],
            Stmt::Assign(a) if matches!(&a.targets[0], Expr::Name(n) if n.ctx == ExprContext::Store)
        ));
    }

    #[test]
    fn test_invalid_targets() {
        let err = |src: &str| parse(src).unwrap_err().to_string();
        assert!(err("f() = 1\n").contains("cannot assign to function call"));
        assert!(err("1 = x\n").contains("cannot assign to literal"));
        assert!(err("del a + b\n").contains("cannot delete operator"));
        assert!(err("a, *b, *c = x\n").contains("multiple starred"));
        assert!(err("*a = x\n").contains("must be in a list or tuple"));
        assert!(err("(a, b) += 1\n").contains("augmented assignment"));
    }
}
