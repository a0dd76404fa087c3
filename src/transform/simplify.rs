//! Statement-level cleanup run at the end of lowering.

use crate::analysis::simplify::{can_prove, simplify};
use crate::ir::stmt::Stmt;
use crate::transform::Transform;
use crate::utils::errors::LowerResult;

/// Simplify every expression, substitute constant lets, drop unused lets,
/// resolve constant conditions and remove empty or single-iteration loops.
pub fn simplify_stmt(s: Stmt) -> Stmt {
    match s {
        Stmt::LetStmt { name, value, body } => {
            let value = simplify(&value);
            if value.as_int().is_some() {
                return simplify_stmt(body.substitute(&name, &value));
            }
            let body = simplify_stmt(*body);
            if body.uses_var(&name) {
                Stmt::LetStmt { name, value, body: Box::new(body) }
            } else {
                body
            }
        }
        Stmt::For { name, min, extent, kind, body } => {
            let min = simplify(&min);
            let extent = simplify(&extent);
            match extent.as_int() {
                Some(e) if e <= 0 => Stmt::NoOp,
                Some(1) if !kind.is_gpu() => simplify_stmt(Stmt::let_stmt(name, min, *body)),
                _ => match simplify_stmt(*body) {
                    Stmt::NoOp => Stmt::NoOp,
                    body => Stmt::For { name, min, extent, kind, body: Box::new(body) },
                },
            }
        }
        Stmt::IfThenElse { cond, then_case, else_case } => {
            let cond = simplify(&cond);
            match cond.as_int() {
                Some(0) => else_case.map_or(Stmt::NoOp, |e| simplify_stmt(*e)),
                Some(_) => simplify_stmt(*then_case),
                None => {
                    let then_case = simplify_stmt(*then_case);
                    let else_case = else_case.map(|e| simplify_stmt(*e)).filter(|e| !e.is_no_op());
                    if then_case.is_no_op() && else_case.is_none() {
                        Stmt::NoOp
                    } else {
                        Stmt::IfThenElse { cond, then_case: Box::new(then_case), else_case: else_case.map(Box::new) }
                    }
                }
            }
        }
        Stmt::AssertStmt { cond, message } => {
            if can_prove(&cond) {
                Stmt::NoOp
            } else {
                Stmt::AssertStmt { cond: simplify(&cond), message }
            }
        }
        other => other.map_exprs(simplify).map_children(simplify_stmt),
    }
}

/// [`simplify_stmt`] as a pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimplifyStmt;

impl Transform for SimplifyStmt {
    fn name(&self) -> &str {
        "simplify"
    }

    fn apply(&self, stmt: &mut Stmt) -> LowerResult<bool> {
        let before = std::mem::replace(stmt, Stmt::NoOp);
        let after = simplify_stmt(before.clone());
        let changed = after != before;
        *stmt = after;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::expr::Expr;
    use crate::ir::stmt::ForKind;

    fn store(index: Expr) -> Stmt {
        Stmt::Store { buffer: "b".into(), index, value: Expr::int(1) }
    }

    #[test]
    fn test_constant_lets_are_substituted() {
        let s = Stmt::let_stmt(
            "n",
            Expr::int(2) + 2,
            Stmt::let_stmt("unused", Expr::var("q"), store(Expr::var("n") * 3)),
        );
        assert_eq!(simplify_stmt(s), store(Expr::int(12)));
    }

    #[test]
    fn test_loops() {
        let body = store(Expr::var("i"));
        let empty = Stmt::for_loop("i", Expr::int(0), Expr::int(0), ForKind::Serial, body.clone());
        assert_eq!(simplify_stmt(empty), Stmt::NoOp);
        let single = Stmt::for_loop("i", Expr::var("m"), Expr::int(1), ForKind::Parallel, body.clone());
        assert_eq!(simplify_stmt(single), Stmt::let_stmt("i", Expr::var("m"), body.clone()));
        let gpu = Stmt::for_loop("i", Expr::int(0), Expr::int(1), ForKind::GpuBlock, body.clone());
        assert!(matches!(simplify_stmt(gpu), Stmt::For { .. }));
    }

    #[test]
    fn test_conditions() {
        let s = Stmt::block(vec![
            Stmt::if_then(Expr::lt(Expr::var("x"), Expr::var("x") + 1), store(Expr::int(0))),
            Stmt::AssertStmt { cond: Expr::le(Expr::int(0), Expr::int(4)), message: "fits".into() },
        ]);
        assert_eq!(simplify_stmt(s), store(Expr::int(0)));

        let mut s = Stmt::if_then(Expr::int(0), store(Expr::int(0)));
        assert!(SimplifyStmt.apply(&mut s).unwrap());
        assert_eq!(s, Stmt::NoOp);
        assert!(!SimplifyStmt.apply(&mut s).unwrap());
    }
}
