//! Integer expressions over stage coordinates.
//!
//! Expressions are plain trees. Every value is a 64-bit signed integer;
//! comparisons and logical operators produce `0` or `1`. Arithmetic wraps
//! at run time (see [`BinOp::checked_apply`] for the compile-time variant),
//! division rounds so that the remainder is non-negative (Euclidean), and
//! dividing by zero yields zero.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
    Eq,
    Ne,
    Lt,
    Le,
    And,
    Or,
}

impl BinOp {
    /// Evaluate the operator on two concrete values.
    pub fn apply(self, a: i64, b: i64) -> i64 {
        match self {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Div => {
                if b == 0 {
                    0
                } else {
                    a.wrapping_div_euclid(b)
                }
            }
            BinOp::Mod => {
                if b == 0 {
                    0
                } else {
                    a.wrapping_rem_euclid(b)
                }
            }
            BinOp::Min => a.min(b),
            BinOp::Max => a.max(b),
            BinOp::Eq => (a == b) as i64,
            BinOp::Ne => (a != b) as i64,
            BinOp::Lt => (a < b) as i64,
            BinOp::Le => (a <= b) as i64,
            BinOp::And => (a != 0 && b != 0) as i64,
            BinOp::Or => (a != 0 || b != 0) as i64,
        }
    }

    /// Like [`BinOp::apply`], but `None` when the result does not fit.
    pub fn checked_apply(self, a: i64, b: i64) -> Option<i64> {
        match self {
            BinOp::Add => a.checked_add(b),
            BinOp::Sub => a.checked_sub(b),
            BinOp::Mul => a.checked_mul(b),
            BinOp::Div if b == 0 => Some(0),
            BinOp::Div => a.checked_div_euclid(b),
            BinOp::Mod if b == 0 => Some(0),
            BinOp::Mod => a.checked_rem_euclid(b),
            _ => Some(self.apply(a, b)),
        }
    }

    /// True for operators whose result is a boolean.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::And | BinOp::Or
        )
    }

    fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Min => "min",
            BinOp::Max => "max",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

/// An integer expression.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Expr {
    /// Integer constant
    Int(i64),
    /// Named variable: a coordinate, loop variable, let or parameter
    Var(String),
    /// Binary operation
    Binary {
        op: BinOp,
        a: Box<Expr>,
        b: Box<Expr>,
    },
    /// Logical negation
    Not(Box<Expr>),
    /// `cond ? then_value : else_value`, evaluating only the chosen side
    Select {
        cond: Box<Expr>,
        then_value: Box<Expr>,
        else_value: Box<Expr>,
    },
    /// Value `value_index` of stage `name` at the given coordinates
    Call {
        name: String,
        args: Vec<Expr>,
        #[serde(default)]
        value_index: usize,
    },
    /// Flat buffer read (only after flattening)
    Load { buffer: String, index: Box<Expr> },
}

impl Expr {
    pub fn int(value: i64) -> Self {
        Expr::Int(value)
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    pub fn binary(op: BinOp, a: Expr, b: Expr) -> Self {
        Expr::Binary { op, a: Box::new(a), b: Box::new(b) }
    }

    /// Call value 0 of a stage.
    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call { name: name.into(), args, value_index: 0 }
    }

    /// Call one value of a tuple-valued stage.
    pub fn call_value(name: impl Into<String>, args: Vec<Expr>, value_index: usize) -> Self {
        Expr::Call { name: name.into(), args, value_index }
    }

    pub fn load(buffer: impl Into<String>, index: Expr) -> Self {
        Expr::Load { buffer: buffer.into(), index: Box::new(index) }
    }

    pub fn div(a: Expr, b: Expr) -> Self {
        Expr::binary(BinOp::Div, a, b)
    }

    pub fn modulo(a: Expr, b: Expr) -> Self {
        Expr::binary(BinOp::Mod, a, b)
    }

    pub fn min(a: Expr, b: Expr) -> Self {
        Expr::binary(BinOp::Min, a, b)
    }

    pub fn max(a: Expr, b: Expr) -> Self {
        Expr::binary(BinOp::Max, a, b)
    }

    /// `max(lo, min(e, hi))`
    pub fn clamp(e: Expr, lo: Expr, hi: Expr) -> Self {
        Expr::max(Expr::min(e, hi), lo)
    }

    pub fn eq(a: Expr, b: Expr) -> Self {
        Expr::binary(BinOp::Eq, a, b)
    }

    pub fn lt(a: Expr, b: Expr) -> Self {
        Expr::binary(BinOp::Lt, a, b)
    }

    pub fn le(a: Expr, b: Expr) -> Self {
        Expr::binary(BinOp::Le, a, b)
    }

    pub fn gt(a: Expr, b: Expr) -> Self {
        Expr::binary(BinOp::Lt, b, a)
    }

    pub fn ge(a: Expr, b: Expr) -> Self {
        Expr::binary(BinOp::Le, b, a)
    }

    pub fn and(a: Expr, b: Expr) -> Self {
        Expr::binary(BinOp::And, a, b)
    }

    pub fn or(a: Expr, b: Expr) -> Self {
        Expr::binary(BinOp::Or, a, b)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(a: Expr) -> Self {
        Expr::Not(Box::new(a))
    }

    pub fn select(cond: Expr, then_value: Expr, else_value: Expr) -> Self {
        Expr::Select {
            cond: Box::new(cond),
            then_value: Box::new(then_value),
            else_value: Box::new(else_value),
        }
    }

    /// The constant value, if this is an integer literal.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Expr::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_var(&self) -> Option<&str> {
        match self {
            Expr::Var(name) => Some(name),
            _ => None,
        }
    }

    /// Immediate sub-expressions, in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Int(_) | Expr::Var(_) => Vec::new(),
            Expr::Binary { a, b, .. } => vec![a.as_ref(), b.as_ref()],
            Expr::Not(a) => vec![a.as_ref()],
            Expr::Select { cond, then_value, else_value } => {
                vec![cond.as_ref(), then_value.as_ref(), else_value.as_ref()]
            }
            Expr::Call { args, .. } => args.iter().collect(),
            Expr::Load { index, .. } => vec![index.as_ref()],
        }
    }

    /// Rebuild this node with every child passed through `f`.
    pub fn map_children<F: FnMut(&Expr) -> Expr>(&self, mut f: F) -> Expr {
        match self {
            Expr::Int(_) | Expr::Var(_) => self.clone(),
            Expr::Binary { op, a, b } => Expr::binary(*op, f(a.as_ref()), f(b.as_ref())),
            Expr::Not(a) => Expr::not(f(a.as_ref())),
            Expr::Select { cond, then_value, else_value } => Expr::select(
                f(cond.as_ref()),
                f(then_value.as_ref()),
                f(else_value.as_ref()),
            ),
            Expr::Call { name, args, value_index } => Expr::Call {
                name: name.clone(),
                args: args.iter().map(&mut f).collect(),
                value_index: *value_index,
            },
            Expr::Load { buffer, index } => Expr::load(buffer.clone(), f(index.as_ref())),
        }
    }

    /// Visit every node, pre-order.
    pub fn visit<F: FnMut(&Expr)>(&self, f: &mut F) {
        f(self);
        for c in self.children() {
            c.visit(f);
        }
    }

    /// Replace every occurrence of variable `name` with `value`.
    pub fn substitute(&self, name: &str, value: &Expr) -> Expr {
        match self {
            Expr::Var(v) if v == name => value.clone(),
            _ => self.map_children(|c| c.substitute(name, value)),
        }
    }

    /// Replace variables simultaneously; replacements are not revisited.
    pub fn substitute_all(&self, map: &HashMap<String, Expr>) -> Expr {
        match self {
            Expr::Var(v) => map.get(v).cloned().unwrap_or_else(|| self.clone()),
            _ => self.map_children(|c| c.substitute_all(map)),
        }
    }

    /// Rewrite calls bottom-up; `f` returns `Some` to replace a call.
    pub fn replace_calls<F>(&self, f: &mut F) -> Expr
    where
        F: FnMut(&str, &[Expr], usize) -> Option<Expr>,
    {
        let rebuilt = self.map_children(|c| c.replace_calls(f));
        if let Expr::Call { name, args, value_index } = &rebuilt {
            if let Some(e) = f(name, args, *value_index) {
                return e;
            }
        }
        rebuilt
    }

    /// Names of all free variables.
    pub fn free_vars(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.visit(&mut |e| {
            if let Expr::Var(v) = e {
                out.insert(v.clone());
            }
        });
        out
    }

    pub fn uses_var(&self, name: &str) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if let Expr::Var(v) = e {
                found |= v == name;
            }
        });
        found
    }

    /// Names of all stages called.
    pub fn called_stages(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.visit(&mut |e| {
            if let Expr::Call { name, .. } = e {
                out.insert(name.clone());
            }
        });
        out
    }

    /// True if the expression calls `stage`.
    pub fn calls(&self, stage: &str) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if let Expr::Call { name, .. } = e {
                found |= name == stage;
            }
        });
        found
    }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Self {
        Expr::Int(v)
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Self {
        Expr::Int(v as i64)
    }
}

impl From<&str> for Expr {
    fn from(name: &str) -> Self {
        Expr::Var(name.to_string())
    }
}

impl From<String> for Expr {
    fn from(name: String) -> Self {
        Expr::Var(name)
    }
}

impl<T: Into<Expr>> Add<T> for Expr {
    type Output = Expr;

    fn add(self, rhs: T) -> Expr {
        Expr::binary(BinOp::Add, self, rhs.into())
    }
}

impl<T: Into<Expr>> Sub<T> for Expr {
    type Output = Expr;

    fn sub(self, rhs: T) -> Expr {
        Expr::binary(BinOp::Sub, self, rhs.into())
    }
}

impl<T: Into<Expr>> Mul<T> for Expr {
    type Output = Expr;

    fn mul(self, rhs: T) -> Expr {
        Expr::binary(BinOp::Mul, self, rhs.into())
    }
}

impl Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::binary(BinOp::Sub, Expr::Int(0), self)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Int(v) => write!(f, "{}", v),
            Expr::Var(v) => write!(f, "{}", v),
            Expr::Binary { op: op @ (BinOp::Min | BinOp::Max), a, b } => {
                write!(f, "{}({}, {})", op.symbol(), a, b)
            }
            Expr::Binary { op, a, b } => write!(f, "({} {} {})", a, op.symbol(), b),
            Expr::Not(a) => write!(f, "!{}", a),
            Expr::Select { cond, then_value, else_value } => {
                write!(f, "select({}, {}, {})", cond, then_value, else_value)
            }
            Expr::Call { name, args, value_index } => {
                write!(f, "{}(", name)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")?;
                if *value_index > 0 {
                    write!(f, "[{}]", value_index)?;
                }
                Ok(())
            }
            Expr::Load { buffer, index } => write!(f, "{}[{}]", buffer, index),
        }
    }
}
