//! Storage flattening.
//!
//! Multi-dimensional storage becomes flat: each value buffer `b` of a
//! realization gets
//!
//! ```text
//! let b.min.<d> = ...      // 0 for folded dimensions
//! let b.extent.<d> = ...   // the fold factor for folded dimensions
//! let b.stride.<d> = ...   // row-major, dimension 0 is dense
//! allocate b[b.stride.<n-1> * b.extent.<n-1>]
//! ```
//!
//! and every `Provide`/`Call` becomes a `Store`/`Load` at
//! `sum((c_d - b.min.d) * b.stride.d)`, with `c_d mod factor` in place of
//! `c_d - b.min.d` on a folded dimension. External buffers use the same
//! names as parameters bound by the caller.

use crate::ir::expr::Expr;
use crate::ir::stage::{buffer_name, StageGraph};
use crate::ir::stmt::{Range, Stmt, StorageFold};
use std::collections::HashMap;

pub fn buffer_min(buffer: &str, dim: usize) -> String {
    format!("{}.min.{}", buffer, dim)
}

pub fn buffer_extent(buffer: &str, dim: usize) -> String {
    format!("{}.extent.{}", buffer, dim)
}

pub fn buffer_stride(buffer: &str, dim: usize) -> String {
    format!("{}.stride.{}", buffer, dim)
}

/// Flat index of `args` in `buffer`.
pub fn flat_index(buffer: &str, args: &[Expr], folds: &[StorageFold]) -> Expr {
    let mut index: Option<Expr> = None;
    for (d, arg) in args.iter().enumerate() {
        let offset = match folds.iter().find(|f| f.dim == d) {
            Some(fold) => Expr::modulo(arg.clone(), Expr::int(fold.factor)),
            None => arg.clone() - Expr::var(buffer_min(buffer, d)),
        };
        let term = offset * Expr::var(buffer_stride(buffer, d));
        index = Some(match index {
            Some(i) => i + term,
            None => term,
        });
    }
    index.unwrap_or_else(|| Expr::int(0))
}

fn value_let(stage: &str, index: usize) -> String {
    format!("{}.value.{}", stage, index)
}

struct Flattener<'a> {
    graph: &'a StageGraph,
    folds: HashMap<String, Vec<StorageFold>>,
}

impl<'a> Flattener<'a> {
    fn values(&self, stage: &str) -> usize {
        self.graph.by_name(stage).map_or(1, |s| s.values())
    }

    fn folds(&self, stage: &str) -> &[StorageFold] {
        self.folds.get(stage).map_or(&[], |f| f.as_slice())
    }

    fn expr(&self, e: &Expr) -> Expr {
        match e {
            Expr::Call { name, args, value_index } => {
                let args: Vec<Expr> = args.iter().map(|a| self.expr(a)).collect();
                let buffer = buffer_name(name, *value_index, self.values(name));
                Expr::load(buffer.clone(), flat_index(&buffer, &args, self.folds(name)))
            }
            other => other.map_children(|c| self.expr(c)),
        }
    }

    fn realize(&self, name: &str, values: usize, bounds: &[Range], folds: &[StorageFold], body: Stmt) -> Stmt {
        let mut body = body;
        for v in (0..values).rev() {
            let buffer = buffer_name(name, v, values);
            let size = match bounds.len() {
                0 => Expr::int(1),
                n => Expr::var(buffer_stride(&buffer, n - 1)) * Expr::var(buffer_extent(&buffer, n - 1)),
            };
            let mut lets = Vec::new();
            for (d, range) in bounds.iter().enumerate() {
                let (min, extent) = match folds.iter().find(|f| f.dim == d) {
                    Some(fold) => (Expr::int(0), Expr::int(fold.factor)),
                    None => (range.min.clone(), range.extent.clone()),
                };
                let stride = match d {
                    0 => Expr::int(1),
                    _ => Expr::var(buffer_stride(&buffer, d - 1)) * Expr::var(buffer_extent(&buffer, d - 1)),
                };
                lets.push((buffer_min(&buffer, d), min));
                lets.push((buffer_extent(&buffer, d), extent));
                lets.push((buffer_stride(&buffer, d), stride));
            }
            body = Stmt::Allocate { name: buffer, size, body: Box::new(body) };
            for (n, value) in lets.into_iter().rev() {
                body = Stmt::let_stmt(n, value, body);
            }
        }
        body
    }

    fn provide(&self, name: String, values: Vec<Expr>, args: Vec<Expr>) -> Stmt {
        let args: Vec<Expr> = args.iter().map(|a| self.expr(a)).collect();
        let values: Vec<Expr> = values.iter().map(|v| self.expr(v)).collect();
        let count = values.len();
        let store = |v: usize, value: Expr| {
            let buffer = buffer_name(&name, v, count);
            Stmt::Store { index: flat_index(&buffer, &args, self.folds(&name)), buffer, value }
        };
        if count == 1 {
            return values.into_iter().next().map_or(Stmt::NoOp, |value| store(0, value));
        }
        // Every value is computed before any is stored.
        let stores = Stmt::block((0..count).map(|v| store(v, Expr::var(value_let(&name, v)))).collect());
        values
            .into_iter()
            .enumerate()
            .rev()
            .fold(stores, |body, (v, value)| Stmt::let_stmt(value_let(&name, v), value, body))
    }

    fn stmt(&self, s: Stmt) -> Stmt {
        match s {
            Stmt::Realize { name, values, bounds, folds, body } => {
                let bounds: Vec<Range> =
                    bounds.iter().map(|r| Range { min: self.expr(&r.min), extent: self.expr(&r.extent) }).collect();
                let body = self.stmt(*body);
                self.realize(&name, values, &bounds, &folds, body)
            }
            Stmt::Provide { name, values, args } => self.provide(name, values, args),
            other => other.map_exprs(|e| self.expr(e)).map_children(|c| self.stmt(c)),
        }
    }
}

/// Flatten every realization and access in `tree`.
pub fn flatten(tree: Stmt, graph: &StageGraph) -> Stmt {
    let mut folds = HashMap::new();
    tree.visit(&mut |s| {
        if let Stmt::Realize { name, folds: f, .. } = s {
            if !f.is_empty() {
                folds.insert(name.clone(), f.clone());
            }
        }
    });
    Flattener { graph, folds }.stmt(tree)
}
