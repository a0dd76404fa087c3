//! The imperative statement tree produced by lowering.
//!
//! Before flattening, storage is multi-dimensional (`Realize`, `Provide`,
//! `Expr::Call`); afterwards it is flat (`Allocate`, `Store`,
//! `Expr::Load`). Storage is always scoped: it lives exactly as long as the
//! body of the node that declares it.

use crate::ir::expr::Expr;
use crate::utils::pretty::{format_list, CodeFormatter};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the iterations of a loop are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForKind {
    Serial,
    Parallel,
    Vectorized,
    Unrolled,
    GpuBlock,
    GpuThread,
}

impl ForKind {
    pub fn is_gpu(self) -> bool {
        matches!(self, ForKind::GpuBlock | ForKind::GpuThread)
    }

    /// Iterations may run concurrently.
    pub fn is_parallel(self) -> bool {
        matches!(self, ForKind::Parallel | ForKind::GpuBlock | ForKind::GpuThread)
    }

    /// Keyword printed before `for`.
    pub fn prefix(self) -> &'static str {
        match self {
            ForKind::Serial => "",
            ForKind::Parallel => "parallel ",
            ForKind::Vectorized => "vectorized ",
            ForKind::Unrolled => "unrolled ",
            ForKind::GpuBlock => "gpu_block ",
            ForKind::GpuThread => "gpu_thread ",
        }
    }
}

/// A half-open span `[min, min + extent)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub min: Expr,
    pub extent: Expr,
}

impl Range {
    pub fn new(min: impl Into<Expr>, extent: impl Into<Expr>) -> Self {
        Self { min: min.into(), extent: extent.into() }
    }

    /// Last coordinate covered.
    pub fn max(&self) -> Expr {
        self.min.clone() + self.extent.clone() - 1
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.extent)
    }
}

/// Direction of a host/device copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    ToDevice,
    ToHost,
}

/// A dimension of a realization stored as a circular buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageFold {
    pub dim: usize,
    pub factor: i64,
}

/// A statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// Statements executed in order
    Block(Vec<Stmt>),
    /// Loop `name` over `[min, min + extent)`
    For {
        name: String,
        min: Expr,
        extent: Expr,
        kind: ForKind,
        body: Box<Stmt>,
    },
    /// Bind `name` for the duration of `body`
    LetStmt {
        name: String,
        value: Expr,
        body: Box<Stmt>,
    },
    IfThenElse {
        cond: Expr,
        then_case: Box<Stmt>,
        else_case: Option<Box<Stmt>>,
    },
    /// Computation of stage `name`: pure definition, updates in order, then
    /// the statements that read it
    ProducerConsumer {
        name: String,
        produce: Box<Stmt>,
        updates: Vec<Stmt>,
        consume: Box<Stmt>,
    },
    /// Multi-dimensional storage for stage `name`
    Realize {
        name: String,
        values: usize,
        bounds: Vec<Range>,
        folds: Vec<StorageFold>,
        body: Box<Stmt>,
    },
    /// Flat storage of `size` elements
    Allocate {
        name: String,
        size: Expr,
        body: Box<Stmt>,
    },
    /// Multi-dimensional store of every value of a stage
    Provide {
        name: String,
        values: Vec<Expr>,
        args: Vec<Expr>,
    },
    /// Flat store
    Store {
        buffer: String,
        index: Expr,
        value: Expr,
    },
    AssertStmt {
        cond: Expr,
        message: String,
    },
    /// Counter `name`, starting at zero, scoped to `body`
    Semaphore {
        name: String,
        body: Box<Stmt>,
    },
    /// Add `amount` to a counter
    Signal {
        semaphore: String,
        amount: Expr,
    },
    /// Block until a counter reaches `count`; does not consume
    Wait {
        semaphore: String,
        count: Expr,
    },
    /// Copy a region of a buffer between host and device
    DeviceTransfer {
        buffer: String,
        direction: TransferDirection,
        region: Vec<Range>,
    },
    /// Wait for all outstanding device work
    DeviceSync,
    NoOp,
}

impl Stmt {
    /// Build a block, dropping no-ops and splicing nested blocks.
    pub fn block(stmts: Vec<Stmt>) -> Stmt {
        let mut out = Vec::with_capacity(stmts.len());
        for s in stmts {
            match s {
                Stmt::NoOp => {}
                Stmt::Block(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Stmt::NoOp,
            1 => out.pop().unwrap_or(Stmt::NoOp),
            _ => Stmt::Block(out),
        }
    }

    pub fn let_stmt(name: impl Into<String>, value: Expr, body: Stmt) -> Stmt {
        Stmt::LetStmt { name: name.into(), value, body: Box::new(body) }
    }

    pub fn for_loop(name: impl Into<String>, min: Expr, extent: Expr, kind: ForKind, body: Stmt) -> Stmt {
        Stmt::For { name: name.into(), min, extent, kind, body: Box::new(body) }
    }

    pub fn if_then(cond: Expr, then_case: Stmt) -> Stmt {
        Stmt::IfThenElse { cond, then_case: Box::new(then_case), else_case: None }
    }

    pub fn is_no_op(&self) -> bool {
        matches!(self, Stmt::NoOp)
    }

    /// Direct child statements.
    pub fn children(&self) -> Vec<&Stmt> {
        match self {
            Stmt::Block(stmts) => stmts.iter().collect(),
            Stmt::For { body, .. }
            | Stmt::LetStmt { body, .. }
            | Stmt::Realize { body, .. }
            | Stmt::Allocate { body, .. }
            | Stmt::Semaphore { body, .. } => vec![body.as_ref()],
            Stmt::IfThenElse { then_case, else_case, .. } => {
                let mut v = vec![then_case.as_ref()];
                if let Some(e) = else_case {
                    v.push(e.as_ref());
                }
                v
            }
            Stmt::ProducerConsumer { produce, updates, consume, .. } => {
                let mut v = vec![produce.as_ref()];
                v.extend(updates.iter());
                v.push(consume.as_ref());
                v
            }
            _ => Vec::new(),
        }
    }

    /// Expressions held directly by this node.
    pub fn exprs(&self) -> Vec<&Expr> {
        match self {
            Stmt::For { min, extent, .. } => vec![min, extent],
            Stmt::LetStmt { value, .. } => vec![value],
            Stmt::IfThenElse { cond, .. } => vec![cond],
            Stmt::Realize { bounds, .. } => bounds.iter().flat_map(|r| [&r.min, &r.extent]).collect(),
            Stmt::Allocate { size, .. } => vec![size],
            Stmt::Provide { values, args, .. } => values.iter().chain(args.iter()).collect(),
            Stmt::Store { index, value, .. } => vec![index, value],
            Stmt::AssertStmt { cond, .. } => vec![cond],
            Stmt::Signal { amount, .. } => vec![amount],
            Stmt::Wait { count, .. } => vec![count],
            Stmt::DeviceTransfer { region, .. } => {
                region.iter().flat_map(|r| [&r.min, &r.extent]).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Rebuild with every direct child statement passed through `f`.
    pub fn map_children<F: FnMut(Stmt) -> Stmt>(self, mut f: F) -> Stmt {
        match self {
            Stmt::Block(stmts) => Stmt::block(stmts.into_iter().map(&mut f).collect()),
            Stmt::For { name, min, extent, kind, body } => {
                Stmt::For { name, min, extent, kind, body: Box::new(f(*body)) }
            }
            Stmt::LetStmt { name, value, body } => {
                Stmt::LetStmt { name, value, body: Box::new(f(*body)) }
            }
            Stmt::IfThenElse { cond, then_case, else_case } => Stmt::IfThenElse {
                cond,
                then_case: Box::new(f(*then_case)),
                else_case: else_case.map(|e| Box::new(f(*e))),
            },
            Stmt::ProducerConsumer { name, produce, updates, consume } => {
                let produce = Box::new(f(*produce));
                let updates = updates.into_iter().map(&mut f).collect();
                let consume = Box::new(f(*consume));
                Stmt::ProducerConsumer { name, produce, updates, consume }
            }
            Stmt::Realize { name, values, bounds, folds, body } => {
                Stmt::Realize { name, values, bounds, folds, body: Box::new(f(*body)) }
            }
            Stmt::Allocate { name, size, body } => {
                Stmt::Allocate { name, size, body: Box::new(f(*body)) }
            }
            Stmt::Semaphore { name, body } => Stmt::Semaphore { name, body: Box::new(f(*body)) },
            other => other,
        }
    }

    /// Rebuild with every expression held directly by this node passed
    /// through `f`. Children are left alone.
    pub fn map_exprs<F: FnMut(&Expr) -> Expr>(self, mut f: F) -> Stmt {
        let range = |r: Range, f: &mut F| Range { min: f(&r.min), extent: f(&r.extent) };
        match self {
            Stmt::For { name, min, extent, kind, body } => {
                Stmt::For { name, min: f(&min), extent: f(&extent), kind, body }
            }
            Stmt::LetStmt { name, value, body } => Stmt::LetStmt { name, value: f(&value), body },
            Stmt::IfThenElse { cond, then_case, else_case } => {
                Stmt::IfThenElse { cond: f(&cond), then_case, else_case }
            }
            Stmt::Realize { name, values, bounds, folds, body } => Stmt::Realize {
                name,
                values,
                bounds: bounds.into_iter().map(|r| range(r, &mut f)).collect(),
                folds,
                body,
            },
            Stmt::Allocate { name, size, body } => Stmt::Allocate { name, size: f(&size), body },
            Stmt::Provide { name, values, args } => Stmt::Provide {
                name,
                values: values.iter().map(&mut f).collect(),
                args: args.iter().map(&mut f).collect(),
            },
            Stmt::Store { buffer, index, value } => {
                Stmt::Store { buffer, index: f(&index), value: f(&value) }
            }
            Stmt::AssertStmt { cond, message } => Stmt::AssertStmt { cond: f(&cond), message },
            Stmt::Signal { semaphore, amount } => Stmt::Signal { semaphore, amount: f(&amount) },
            Stmt::Wait { semaphore, count } => Stmt::Wait { semaphore, count: f(&count) },
            Stmt::DeviceTransfer { buffer, direction, region } => Stmt::DeviceTransfer {
                buffer,
                direction,
                region: region.into_iter().map(|r| range(r, &mut f)).collect(),
            },
            other => other,
        }
    }

    /// Apply `f` to every expression in the whole tree.
    pub fn transform_exprs<F: FnMut(&Expr) -> Expr>(self, f: &mut F) -> Stmt {
        self.map_exprs(|e| f(e)).map_children(|c| c.transform_exprs(f))
    }

    /// Visit every statement, pre-order.
    pub fn visit<F: FnMut(&Stmt)>(&self, f: &mut F) {
        f(self);
        for c in self.children() {
            c.visit(f);
        }
    }

    /// Visit every expression held anywhere in the tree.
    pub fn visit_exprs<F: FnMut(&Expr)>(&self, f: &mut F) {
        self.visit(&mut |s| {
            for e in s.exprs() {
                f(e);
            }
        });
    }

    /// True if any expression in the tree calls `stage`.
    pub fn calls(&self, stage: &str) -> bool {
        let mut found = false;
        self.visit_exprs(&mut |e| found |= e.calls(stage));
        found
    }

    /// True if `name` occurs as a variable anywhere in the tree.
    pub fn uses_var(&self, name: &str) -> bool {
        let mut found = false;
        self.visit_exprs(&mut |e| found |= e.uses_var(name));
        found
    }

    /// True if the tree contains the producer of `stage`.
    pub fn contains_producer(&self, stage: &str) -> bool {
        let mut found = false;
        self.visit(&mut |s| {
            if let Stmt::ProducerConsumer { name, .. } = s {
                found |= name == stage;
            }
        });
        found
    }

    /// The `ProducerConsumer` node of `stage`.
    pub fn find_producer(&self, stage: &str) -> Option<&Stmt> {
        if matches!(self, Stmt::ProducerConsumer { name, .. } if name == stage) {
            return Some(self);
        }
        self.children().into_iter().find_map(|c| c.find_producer(stage))
    }

    /// The loop called `loop_name`.
    pub fn find_loop(&self, loop_name: &str) -> Option<&Stmt> {
        if matches!(self, Stmt::For { name, .. } if name == loop_name) {
            return Some(self);
        }
        self.children().into_iter().find_map(|c| c.find_loop(loop_name))
    }

    /// Replace the `ProducerConsumer` node of `stage` with `f(node)`.
    pub fn replace_producer<F: FnMut(Stmt) -> Stmt>(self, stage: &str, f: &mut F) -> Stmt {
        if matches!(&self, Stmt::ProducerConsumer { name, .. } if name == stage) {
            return f(self);
        }
        self.map_children(|c| c.replace_producer(stage, f))
    }

    /// Replace the body of loop `loop_name` with `f(body)`.
    pub fn replace_loop_body<F: FnMut(Stmt) -> Stmt>(self, loop_name: &str, f: &mut F) -> Stmt {
        match self {
            Stmt::For { name, min, extent, kind, body } if name == loop_name => {
                Stmt::For { name, min, extent, kind, body: Box::new(f(*body)) }
            }
            other => other.map_children(|c| c.replace_loop_body(loop_name, f)),
        }
    }

    /// Replace free occurrences of `name` with `value`, respecting
    /// shadowing by inner lets and loops.
    pub fn substitute(self, name: &str, value: &Expr) -> Stmt {
        let rebind = match &self {
            Stmt::For { name: n, .. } | Stmt::LetStmt { name: n, .. } => n == name,
            _ => false,
        };
        let s = self.map_exprs(|e| e.substitute(name, value));
        if rebind {
            s
        } else {
            s.map_children(|c| c.substitute(name, value))
        }
    }

    /// Write the tree into a formatter.
    pub fn print(&self, out: &mut CodeFormatter) {
        match self {
            Stmt::Block(stmts) => {
                for s in stmts {
                    s.print(out);
                }
            }
            Stmt::For { name, min, extent, kind, body } => {
                let header = format!("{}for ({}, {}, {})", kind.prefix(), name, min, extent);
                out.block(&header, |o| body.print(o));
            }
            Stmt::LetStmt { name, value, body } => {
                out.writeln(&format!("let {} = {}", name, value));
                body.print(out);
            }
            Stmt::IfThenElse { cond, then_case, else_case } => {
                out.writeln(&format!("if ({}) {{", cond));
                out.indent();
                then_case.print(out);
                out.dedent();
                if let Some(e) = else_case {
                    out.writeln("} else {");
                    out.indent();
                    e.print(out);
                    out.dedent();
                }
                out.writeln("}");
            }
            Stmt::ProducerConsumer { name, produce, updates, consume } => {
                out.block(&format!("produce {}", name), |o| produce.print(o));
                for u in updates {
                    out.block(&format!("update {}", name), |o| u.print(o));
                }
                if !consume.is_no_op() {
                    out.block(&format!("consume {}", name), |o| consume.print(o));
                }
            }
            Stmt::Realize { name, bounds, folds, body, .. } => {
                let mut header = format!("realize {}({})", name, format_list(bounds, ", "));
                for fold in folds {
                    header.push_str(&format!(" fold({}, {})", fold.dim, fold.factor));
                }
                out.block(&header, |o| body.print(o));
            }
            Stmt::Allocate { name, size, body } => {
                out.block(&format!("allocate {}[{}]", name, size), |o| body.print(o));
            }
            Stmt::Provide { name, values, args } => {
                let rhs = if values.len() == 1 {
                    values[0].to_string()
                } else {
                    format!("{{{}}}", format_list(values, ", "))
                };
                out.writeln(&format!("{}({}) = {}", name, format_list(args, ", "), rhs));
            }
            Stmt::Store { buffer, index, value } => {
                out.writeln(&format!("{}[{}] = {}", buffer, index, value));
            }
            Stmt::AssertStmt { cond, message } => {
                out.writeln(&format!("assert({}, {:?})", cond, message));
            }
            Stmt::Semaphore { name, body } => {
                out.block(&format!("semaphore {}", name), |o| body.print(o));
            }
            Stmt::Signal { semaphore, amount } => {
                out.writeln(&format!("signal({}, {})", semaphore, amount));
            }
            Stmt::Wait { semaphore, count } => {
                out.writeln(&format!("wait({}, {})", semaphore, count));
            }
            Stmt::DeviceTransfer { buffer, direction, region } => {
                let op = match direction {
                    TransferDirection::ToDevice => "copy_to_device",
                    TransferDirection::ToHost => "copy_to_host",
                };
                out.writeln(&format!("{} {}({})", op, buffer, format_list(region, ", ")));
            }
            Stmt::DeviceSync => out.writeln("device_sync"),
            Stmt::NoOp => {}
        }
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = CodeFormatter::default_indent();
        self.print(&mut out);
        f.write_str(&out.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provide(x: &str) -> Stmt {
        Stmt::Provide {
            name: "f".into(),
            values: vec![Expr::var(x) * 2],
            args: vec![Expr::var(x)],
        }
    }

    #[test]
    fn test_block_flattens() {
        let s = Stmt::block(vec![
            Stmt::NoOp,
            Stmt::block(vec![provide("a"), provide("b")]),
            Stmt::NoOp,
        ]);
        match s {
            Stmt::Block(v) => assert_eq!(v.len(), 2),
            other => panic!("expected block, got {:?}", other),
        }
        assert_eq!(Stmt::block(vec![Stmt::NoOp]), Stmt::NoOp);
    }

    #[test]
    fn test_substitute_respects_shadowing() {
        let inner = Stmt::let_stmt("x", Expr::var("x") + 1, provide("x"));
        let s = Stmt::block(vec![provide("x"), inner]).substitute("x", &Expr::int(5));
        let text = s.to_string();
        assert!(text.contains("f(5) = (5 * 2)"));
        assert!(text.contains("let x = (5 + 1)"));
        assert!(text.contains("f(x) = (x * 2)"));
    }

    #[test]
    fn test_print_loop() {
        let s = Stmt::for_loop("f.s0.x", Expr::int(0), Expr::int(4), ForKind::Parallel, provide("f.s0.x"));
        let text = s.to_string();
        assert!(text.starts_with("parallel for (f.s0.x, 0, 4) {\n"));
        assert!(text.contains("  f(f.s0.x) = (f.s0.x * 2)"));
    }

    #[test]
    fn test_queries() {
        let s = Stmt::ProducerConsumer {
            name: "f".into(),
            produce: Box::new(provide("x")),
            updates: vec![],
            consume: Box::new(Stmt::Store {
                buffer: "out".into(),
                index: Expr::int(0),
                value: Expr::call("f", vec![Expr::int(0)]),
            }),
        };
        assert!(s.contains_producer("f"));
        assert!(s.calls("f"));
        assert!(!s.calls("g"));
        assert!(s.uses_var("x"));
        assert!(s.find_producer("f").is_some());
        assert!(s.find_producer("out").is_none());
    }

    #[test]
    fn test_replace_loop_body() {
        let s = Stmt::for_loop(
            "y",
            Expr::int(0),
            Expr::int(2),
            ForKind::Serial,
            Stmt::for_loop("x", Expr::int(0), Expr::int(2), ForKind::Serial, provide("x")),
        );
        let s = s.replace_loop_body("x", &mut |body| {
            Stmt::block(vec![Stmt::AssertStmt { cond: Expr::int(1), message: "ok".into() }, body])
        });
        match s.find_loop("x") {
            Some(Stmt::For { body, .. }) => assert!(matches!(body.as_ref(), Stmt::Block(v) if v.len() == 2)),
            other => panic!("loop x not found: {:?}", other),
        }
    }
}
