//! Algebraic simplification.
//!
//! Sums, differences and products by constants are normalised through a
//! [`LinearForm`]: a constant plus integer multiples of *atoms*, where an
//! atom is any sub-expression that is not itself linear (a variable, a call,
//! a `min`, ...). On top of that the simplifier folds constants, resolves
//! `min`/`max` and comparisons whose operands differ by a constant, divides
//! exactly when the coefficients allow it, and removes dead `select` arms.
//!
//! Arithmetic here is checked. A fold that would overflow is not
//! performed, and [`overflows`] reports such expressions so that bounds
//! inference can reject them instead of trusting a wrapped value.

use crate::ir::expr::{BinOp, Expr};
use num_integer::Integer;
use std::collections::BTreeMap;

/// `constant + sum(coeff * atom)`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinearForm {
    pub terms: BTreeMap<Expr, i64>,
    pub constant: i64,
}

impl LinearForm {
    pub fn constant(value: i64) -> Self {
        Self { terms: BTreeMap::new(), constant: value }
    }

    pub fn atom(e: Expr) -> Self {
        let mut terms = BTreeMap::new();
        terms.insert(e, 1);
        Self { terms, constant: 0 }
    }

    /// The value, if there are no atoms.
    pub fn as_constant(&self) -> Option<i64> {
        if self.terms.is_empty() {
            Some(self.constant)
        } else {
            None
        }
    }

    /// `self += other * k`; `None` on overflow, leaving `self` unspecified.
    pub fn add_scaled(&mut self, other: &LinearForm, k: i64) -> Option<()> {
        self.constant = self.constant.checked_add(other.constant.checked_mul(k)?)?;
        for (atom, c) in &other.terms {
            let entry = self.terms.entry(atom.clone()).or_insert(0);
            *entry = entry.checked_add(c.checked_mul(k)?)?;
            if *entry == 0 {
                self.terms.remove(atom);
            }
        }
        Some(())
    }

    /// `self *= k`; `None` on overflow.
    pub fn scale(&mut self, k: i64) -> Option<()> {
        if k == 0 {
            self.terms.clear();
            self.constant = 0;
            return Some(());
        }
        self.constant = self.constant.checked_mul(k)?;
        for c in self.terms.values_mut() {
            *c = c.checked_mul(k)?;
        }
        Some(())
    }

    /// Decompose an expression whose children are already simplified.
    /// A sum or product that overflows stays a single atom.
    pub fn from_expr(e: &Expr) -> Self {
        Self::try_from_expr(e).unwrap_or_else(|| Self::atom(e.clone()))
    }

    /// Decompose an expression; `None` if collecting its terms overflows.
    pub fn try_from_expr(e: &Expr) -> Option<Self> {
        match e {
            Expr::Int(v) => Some(Self::constant(*v)),
            Expr::Binary { op: BinOp::Add, a, b } => {
                let mut l = Self::from_expr(a);
                l.add_scaled(&Self::from_expr(b), 1)?;
                Some(l)
            }
            Expr::Binary { op: BinOp::Sub, a, b } => {
                let mut l = Self::from_expr(a);
                l.add_scaled(&Self::from_expr(b), -1)?;
                Some(l)
            }
            Expr::Binary { op: BinOp::Mul, a, b } => {
                let la = Self::from_expr(a);
                let lb = Self::from_expr(b);
                if let Some(k) = la.as_constant() {
                    let mut out = lb;
                    out.scale(k)?;
                    Some(out)
                } else if let Some(k) = lb.as_constant() {
                    let mut out = la;
                    out.scale(k)?;
                    Some(out)
                } else {
                    Some(Self::atom(e.clone()))
                }
            }
            _ => Some(Self::atom(e.clone())),
        }
    }

    /// Canonical expression: positive terms, then negative terms, then the
    /// constant.
    pub fn to_expr(&self) -> Expr {
        let term = |atom: &Expr, k: i64| {
            if k == 1 {
                atom.clone()
            } else {
                Expr::binary(BinOp::Mul, atom.clone(), Expr::Int(k))
            }
        };
        let mut acc: Option<Expr> = None;
        for (atom, &k) in self.terms.iter().filter(|(_, k)| **k > 0) {
            let t = term(atom, k);
            acc = Some(match acc {
                Some(a) => Expr::binary(BinOp::Add, a, t),
                None => t,
            });
        }
        let mut constant_used = false;
        let has_negative = self.terms.values().any(|&k| k < 0);
        if acc.is_none() && (self.constant != 0 || !has_negative) {
            acc = Some(Expr::Int(self.constant));
            constant_used = true;
        }
        for (atom, &k) in self.terms.iter().filter(|(_, k)| **k < 0) {
            acc = Some(match (acc, k.checked_neg()) {
                (Some(a), Some(n)) => Expr::binary(BinOp::Sub, a, term(atom, n)),
                (None, Some(n)) => Expr::binary(BinOp::Sub, Expr::Int(0), term(atom, n)),
                (Some(a), None) => Expr::binary(BinOp::Add, a, term(atom, k)),
                (None, None) => term(atom, k),
            });
        }
        let acc = acc.unwrap_or(Expr::Int(0));
        if constant_used || self.constant == 0 {
            acc
        } else {
            match self.constant.checked_neg() {
                Some(n) if self.constant < 0 => Expr::binary(BinOp::Sub, acc, Expr::Int(n)),
                _ => Expr::binary(BinOp::Add, acc, Expr::Int(self.constant)),
            }
        }
    }

    /// Split into the terms whose coefficients are multiples of `k` (divided
    /// by `k`) and the rest.
    fn split_multiples(&self, k: i64) -> (LinearForm, LinearForm) {
        let mut whole = LinearForm::default();
        let mut rest = LinearForm::constant(self.constant);
        for (atom, &c) in &self.terms {
            match c.checked_div(k) {
                Some(q) if Integer::is_multiple_of(&c, &k) => {
                    whole.terms.insert(atom.clone(), q);
                }
                _ => {
                    rest.terms.insert(atom.clone(), c);
                }
            }
        }
        (whole, rest)
    }
}

/// Simplify an expression.
pub fn simplify(e: &Expr) -> Expr {
    let e = e.map_children(simplify);
    simplify_node(e)
}

/// The value of `e` if it simplifies to a constant.
pub fn const_value(e: &Expr) -> Option<i64> {
    simplify(e).as_int()
}

/// `a - b` if it is a constant.
pub fn constant_difference(a: &Expr, b: &Expr) -> Option<i64> {
    let mut l = LinearForm::from_expr(&simplify(a));
    l.add_scaled(&LinearForm::from_expr(&simplify(b)), -1)?;
    l.as_constant()
}

/// True if `cond` simplifies to a non-zero constant.
pub fn can_prove(cond: &Expr) -> bool {
    matches!(simplify(cond), Expr::Int(v) if v != 0)
}

/// True for expressions whose value is always 0 or 1.
pub fn is_boolean(e: &Expr) -> bool {
    match e {
        Expr::Int(v) => *v == 0 || *v == 1,
        Expr::Binary { op, .. } => op.is_comparison(),
        Expr::Not(_) => true,
        _ => false,
    }
}

fn simplify_node(e: Expr) -> Expr {
    match e {
        Expr::Binary { op, a, b } => simplify_binary(op, *a, *b),
        Expr::Not(a) => match *a {
            Expr::Int(v) => Expr::Int((v == 0) as i64),
            Expr::Not(inner) if is_boolean(&inner) => *inner,
            Expr::Binary { op: BinOp::Lt, a, b } => Expr::binary(BinOp::Le, *b, *a),
            Expr::Binary { op: BinOp::Le, a, b } => Expr::binary(BinOp::Lt, *b, *a),
            Expr::Binary { op: BinOp::Eq, a, b } => Expr::binary(BinOp::Ne, *a, *b),
            Expr::Binary { op: BinOp::Ne, a, b } => Expr::binary(BinOp::Eq, *a, *b),
            other => Expr::not(other),
        },
        Expr::Select { cond, then_value, else_value } => match cond.as_int() {
            Some(0) => *else_value,
            Some(_) => *then_value,
            None if then_value == else_value => *then_value,
            None => Expr::Select { cond, then_value, else_value },
        },
        other => other,
    }
}

fn linear(op: BinOp, a: Expr, b: Expr) -> Expr {
    let e = Expr::binary(op, a, b);
    match LinearForm::try_from_expr(&e) {
        Some(l) => l.to_expr(),
        None => e,
    }
}

/// `a - b` for already simplified operands, if constant.
fn constant_difference_of(a: &Expr, b: &Expr) -> Option<i64> {
    let mut d = LinearForm::from_expr(a);
    d.add_scaled(&LinearForm::from_expr(b), -1)?;
    d.as_constant()
}

/// True if a sum, product or quotient in `e` cannot be computed without
/// overflowing `i64`. Only meaningful for simplified expressions, where
/// every such node is one the simplifier declined to fold.
pub fn overflows(e: &Expr) -> bool {
    let mut found = false;
    e.visit(&mut |node| {
        if let Expr::Binary { op, a, b } = node {
            let bad = match (a.as_int(), b.as_int()) {
                (Some(x), Some(y)) => op.checked_apply(x, y).is_none(),
                _ => matches!(op, BinOp::Add | BinOp::Sub | BinOp::Mul) && LinearForm::try_from_expr(node).is_none(),
            };
            found |= bad;
        }
    });
    found
}

fn simplify_binary(op: BinOp, a: Expr, b: Expr) -> Expr {
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return match op.checked_apply(x, y) {
            Some(v) => Expr::Int(v),
            None => Expr::binary(op, a, b),
        };
    }
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul => linear(op, a, b),
        BinOp::Div => simplify_div(a, b),
        BinOp::Mod => simplify_mod(a, b),
        BinOp::Min | BinOp::Max => simplify_min_max(op, a, b),
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le => {
            match constant_difference_of(&a, &b) {
                Some(diff) => Expr::Int(op.apply(diff, 0)),
                None => Expr::binary(op, a, b),
            }
        }
        BinOp::And => match (a.as_int(), b.as_int()) {
            (Some(0), _) | (_, Some(0)) => Expr::Int(0),
            (Some(_), _) if is_boolean(&b) => b,
            (_, Some(_)) if is_boolean(&a) => a,
            _ if a == b && is_boolean(&a) => a,
            _ => Expr::binary(op, a, b),
        },
        BinOp::Or => match (a.as_int(), b.as_int()) {
            (Some(v), _) | (_, Some(v)) if v != 0 => Expr::Int(1),
            (Some(_), _) if is_boolean(&b) => b,
            (_, Some(_)) if is_boolean(&a) => a,
            _ if a == b && is_boolean(&a) => a,
            _ => Expr::binary(op, a, b),
        },
    }
}

fn simplify_div(a: Expr, b: Expr) -> Expr {
    let c = match b.as_int() {
        Some(0) => return Expr::Int(0),
        Some(c) => c,
        None => return Expr::binary(BinOp::Div, a, b),
    };
    let (mut whole, rest) = LinearForm::from_expr(&a).split_multiples(c);
    let folded = match rest.as_constant() {
        Some(r) => r
            .checked_div_euclid(c)
            .and_then(|q| whole.constant.checked_add(q))
            .map(|v| whole.constant = v),
        None if whole.terms.is_empty() => None,
        None => whole.add_scaled(&LinearForm::atom(Expr::binary(BinOp::Div, rest.to_expr(), b.clone())), 1),
    };
    match folded {
        Some(()) => whole.to_expr(),
        None => Expr::binary(BinOp::Div, a, b),
    }
}

fn simplify_mod(a: Expr, b: Expr) -> Expr {
    let c = match b.as_int() {
        Some(0) => return Expr::Int(0),
        Some(c) => c,
        None => return Expr::binary(BinOp::Mod, a, b),
    };
    let (_, mut rest) = LinearForm::from_expr(&a).split_multiples(c);
    let Some(r) = rest.constant.checked_rem_euclid(c) else {
        return Expr::binary(BinOp::Mod, a, b);
    };
    rest.constant = r;
    match rest.as_constant() {
        Some(r) => Expr::Int(r),
        None => Expr::binary(BinOp::Mod, rest.to_expr(), b),
    }
}

fn simplify_min_max(op: BinOp, a: Expr, b: Expr) -> Expr {
    if a == b {
        return a;
    }
    if let Some(diff) = constant_difference_of(&a, &b) {
        let a_wins = if op == BinOp::Min { diff <= 0 } else { diff >= 0 };
        return if a_wins { a } else { b };
    }
    // Constants go on the right.
    let (a, b) = if a.as_int().is_some() { (b, a) } else { (a, b) };
    if let (Expr::Binary { op: inner_op, a: x, b: y }, Some(c2)) = (&a, b.as_int()) {
        if *inner_op == op {
            if let Some(c1) = y.as_int() {
                return Expr::binary(op, (**x).clone(), Expr::Int(op.apply(c1, c2)));
            }
        }
    }
    if let Expr::Binary { op: inner_op, a: x, b: y } = &a {
        if *inner_op == op && (**x == b || **y == b) {
            return a;
        }
    }
    Expr::binary(op, a, b)
}
