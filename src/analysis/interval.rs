//! Symbolic interval arithmetic.
//!
//! An [`Interval`] bounds an expression from below and above by other
//! expressions; a missing side is unbounded. Bounds are always sound: an
//! interval may be wider than the true range, never narrower.

use crate::analysis::simplify::{const_value, simplify};
use crate::ir::expr::{BinOp, Expr};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Closed interval `[min, max]` of symbolic bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub min: Option<Expr>,
    pub max: Option<Expr>,
}

/// Per-dimension intervals of a stage.
pub type Region = Vec<Interval>;

impl Interval {
    pub fn new(min: Expr, max: Expr) -> Self {
        Self { min: Some(min), max: Some(max) }
    }

    pub fn point(e: Expr) -> Self {
        Self { min: Some(e.clone()), max: Some(e) }
    }

    pub fn everything() -> Self {
        Self { min: None, max: None }
    }

    pub fn is_bounded(&self) -> bool {
        self.min.is_some() && self.max.is_some()
    }

    /// The constant value if the interval is a single constant point.
    pub fn as_const_point(&self) -> Option<i64> {
        match (&self.min, &self.max) {
            (Some(Expr::Int(a)), Some(Expr::Int(b))) if a == b => Some(*a),
            _ => None,
        }
    }

    /// `max - min + 1`, if bounded.
    pub fn extent(&self) -> Option<Expr> {
        match (&self.min, &self.max) {
            (Some(lo), Some(hi)) => Some(simplify(&(hi.clone() - lo.clone() + 1))),
            _ => None,
        }
    }

    pub fn simplified(&self) -> Self {
        Self {
            min: self.min.as_ref().map(simplify),
            max: self.max.as_ref().map(simplify),
        }
    }

    /// Smallest interval containing both.
    pub fn hull(a: &Interval, b: &Interval) -> Interval {
        let min = match (&a.min, &b.min) {
            (Some(x), Some(y)) => Some(simplify(&Expr::min(x.clone(), y.clone()))),
            _ => None,
        };
        let max = match (&a.max, &b.max) {
            (Some(x), Some(y)) => Some(simplify(&Expr::max(x.clone(), y.clone()))),
            _ => None,
        };
        Interval { min, max }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |e: &Option<Expr>, inf: &'static str| match e {
            Some(e) => e.to_string(),
            None => inf.to_string(),
        };
        write!(f, "[{}, {}]", side(&self.min, "-inf"), side(&self.max, "+inf"))
    }
}

/// Hull of two regions of the same dimensionality.
pub fn region_hull(a: &Region, b: &Region) -> Region {
    a.iter().zip(b.iter()).map(|(x, y)| Interval::hull(x, y)).collect()
}

/// A stack of bindings per name; inner bindings shadow outer ones.
#[derive(Debug, Clone)]
pub struct Scope<T> {
    table: HashMap<String, Vec<T>>,
}

impl<T> Default for Scope<T> {
    fn default() -> Self {
        Self { table: HashMap::new() }
    }
}

impl<T> Scope<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &str, value: T) {
        self.table.entry(name.to_string()).or_default().push(value);
    }

    pub fn pop(&mut self, name: &str) {
        if let Some(stack) = self.table.get_mut(name) {
            stack.pop();
            if stack.is_empty() {
                self.table.remove(name);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.table.get(name).and_then(|s| s.last())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

fn both(a: &Option<Expr>, b: &Option<Expr>, f: impl FnOnce(Expr, Expr) -> Expr) -> Option<Expr> {
    match (a, b) {
        (Some(x), Some(y)) => Some(simplify(&f(x.clone(), y.clone()))),
        _ => None,
    }
}

/// Bounds of `e` given intervals for some of its variables. Variables not
/// in `scope` are treated as unknown but fixed values.
pub fn bounds_of_expr(e: &Expr, scope: &Scope<Interval>) -> Interval {
    match e {
        Expr::Int(_) => Interval::point(e.clone()),
        Expr::Var(name) => match scope.get(name) {
            Some(i) => i.clone(),
            None => Interval::point(e.clone()),
        },
        Expr::Binary { op, a, b } => {
            let ia = bounds_of_expr(a, scope);
            let ib = bounds_of_expr(b, scope);
            bounds_of_binary(e, *op, ia, ib)
        }
        Expr::Not(_) => boolean_bounds(e),
        Expr::Select { then_value, else_value, .. } => {
            let t = bounds_of_expr(then_value, scope);
            let f = bounds_of_expr(else_value, scope);
            Interval::hull(&t, &f)
        }
        Expr::Call { .. } | Expr::Load { .. } => Interval::everything(),
    }
}

fn boolean_bounds(e: &Expr) -> Interval {
    match const_value(e) {
        Some(v) => Interval::point(Expr::Int(v)),
        None => Interval::new(Expr::Int(0), Expr::Int(1)),
    }
}

fn bounds_of_binary(e: &Expr, op: BinOp, a: Interval, b: Interval) -> Interval {
    match op {
        BinOp::Add => Interval {
            min: both(&a.min, &b.min, |x, y| x + y),
            max: both(&a.max, &b.max, |x, y| x + y),
        },
        BinOp::Sub => Interval {
            min: both(&a.min, &b.max, |x, y| x - y),
            max: both(&a.max, &b.min, |x, y| x - y),
        },
        BinOp::Mul => bounds_of_mul(a, b),
        BinOp::Div => bounds_of_div(a, b),
        BinOp::Mod => bounds_of_mod(a, b),
        BinOp::Min => Interval {
            min: both(&a.min, &b.min, Expr::min),
            max: match (&a.max, &b.max) {
                (Some(x), Some(y)) => Some(simplify(&Expr::min(x.clone(), y.clone()))),
                (Some(x), None) | (None, Some(x)) => Some(x.clone()),
                (None, None) => None,
            },
        },
        BinOp::Max => Interval {
            min: match (&a.min, &b.min) {
                (Some(x), Some(y)) => Some(simplify(&Expr::max(x.clone(), y.clone()))),
                (Some(x), None) | (None, Some(x)) => Some(x.clone()),
                (None, None) => None,
            },
            max: both(&a.max, &b.max, Expr::max),
        },
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::And | BinOp::Or => boolean_bounds(e),
    }
}

fn scale(i: &Interval, k: i64) -> Interval {
    let mul = |e: &Option<Expr>| e.as_ref().map(|x| simplify(&(x.clone() * k)));
    if k >= 0 {
        Interval { min: mul(&i.min), max: mul(&i.max) }
    } else {
        Interval { min: mul(&i.max), max: mul(&i.min) }
    }
}

fn corners(a: &Interval, b: &Interval, op: BinOp) -> Interval {
    match (&a.min, &a.max, &b.min, &b.max) {
        (Some(a0), Some(a1), Some(b0), Some(b1)) => {
            let c = |x: &Expr, y: &Expr| Expr::binary(op, x.clone(), y.clone());
            let (p, q, r, s) = (c(a0, b0), c(a0, b1), c(a1, b0), c(a1, b1));
            let lo = Expr::min(Expr::min(p.clone(), q.clone()), Expr::min(r.clone(), s.clone()));
            let hi = Expr::max(Expr::max(p, q), Expr::max(r, s));
            Interval::new(simplify(&lo), simplify(&hi))
        }
        _ => Interval::everything(),
    }
}

fn bounds_of_mul(a: Interval, b: Interval) -> Interval {
    if let Some(k) = b.as_const_point() {
        return scale(&a, k);
    }
    if let Some(k) = a.as_const_point() {
        return scale(&b, k);
    }
    corners(&a, &b, BinOp::Mul)
}

fn bounds_of_div(a: Interval, b: Interval) -> Interval {
    if let Some(k) = b.as_const_point() {
        if k == 0 {
            return Interval::point(Expr::Int(0));
        }
        let div = |e: &Option<Expr>| e.as_ref().map(|x| simplify(&Expr::div(x.clone(), Expr::Int(k))));
        return if k > 0 {
            Interval { min: div(&a.min), max: div(&a.max) }
        } else {
            Interval { min: div(&a.max), max: div(&a.min) }
        };
    }
    let positive = b.min.as_ref().and_then(const_value).map_or(false, |v| v > 0);
    let negative = b.max.as_ref().and_then(const_value).map_or(false, |v| v < 0);
    if positive || negative {
        return corners(&a, &b, BinOp::Div);
    }
    // The divisor may be zero or change sign: |a / b| <= |a|.
    match (&a.min, &a.max) {
        (Some(lo), Some(hi)) => {
            let m = simplify(&Expr::max(hi.clone(), Expr::Int(0) - lo.clone()));
            let m = simplify(&Expr::max(m, Expr::Int(0)));
            Interval::new(simplify(&(Expr::Int(0) - m.clone())), m)
        }
        _ => Interval::everything(),
    }
}

fn bounds_of_mod(a: Interval, b: Interval) -> Interval {
    if let Some(k) = b.as_const_point() {
        if k == 0 {
            return Interval::point(Expr::Int(0));
        }
        let m = k.checked_abs().map_or(i64::MAX, |a| a - 1);
        let lo = a.min.as_ref().and_then(const_value);
        let hi = a.max.as_ref().and_then(const_value);
        if let (Some(lo), Some(hi)) = (lo, hi) {
            if lo >= 0 && hi <= m {
                return Interval::new(Expr::Int(lo), Expr::Int(hi));
            }
        }
        return Interval::new(Expr::Int(0), Expr::Int(m));
    }
    match (&b.min, &b.max) {
        (Some(lo), Some(hi)) => {
            let m = Expr::max(hi.clone(), Expr::Int(0) - lo.clone()) - 1;
            Interval::new(Expr::Int(0), simplify(&Expr::max(m, Expr::Int(0))))
        }
        _ => Interval { min: Some(Expr::Int(0)), max: None },
    }
}

/// Narrow the intervals of variables constrained by `cond` holding.
/// Understands `v <= e`, `v < e`, `e <= v`, `e < v`, `v == e` and
/// conjunctions of those; only variables already in scope are narrowed.
/// Returns the narrowed bindings to push for the duration of the branch.
pub fn narrow_by_condition(cond: &Expr, scope: &Scope<Interval>) -> Vec<(String, Interval)> {
    let mut out: Vec<(String, Interval)> = Vec::new();
    collect_narrowing(cond, scope, &mut out);
    out
}

fn current(name: &str, scope: &Scope<Interval>, pending: &[(String, Interval)]) -> Option<Interval> {
    pending
        .iter()
        .rev()
        .find(|(n, _)| n == name)
        .map(|(_, i)| i.clone())
        .or_else(|| scope.get(name).cloned())
}

fn tighten_max(i: &mut Interval, bound: Option<Expr>) {
    if let Some(b) = bound {
        i.max = Some(match i.max.take() {
            Some(m) => simplify(&Expr::min(m, b)),
            None => b,
        });
    }
}

fn tighten_min(i: &mut Interval, bound: Option<Expr>) {
    if let Some(b) = bound {
        i.min = Some(match i.min.take() {
            Some(m) => simplify(&Expr::max(m, b)),
            None => b,
        });
    }
}

fn collect_narrowing(cond: &Expr, scope: &Scope<Interval>, out: &mut Vec<(String, Interval)>) {
    let Expr::Binary { op, a, b } = cond else {
        return;
    };
    if *op == BinOp::And {
        collect_narrowing(a, scope, out);
        collect_narrowing(b, scope, out);
        return;
    }
    let shift = |e: Option<Expr>, d: i64| e.map(|x| simplify(&(x + d)));
    // (variable, other side, variable is on the left)
    let sides: Vec<(&str, &Expr, bool)> = [(a, b, true), (b, a, false)]
        .into_iter()
        .filter_map(|(v, other, left)| v.as_var().map(|name| (name, other.as_ref(), left)))
        .collect();
    for (name, other, var_on_left) in sides {
        let Some(mut interval) = current(name, scope, out) else {
            continue;
        };
        let bound = bounds_of_expr(other, scope);
        match (op, var_on_left) {
            (BinOp::Le, true) => tighten_max(&mut interval, bound.max),
            (BinOp::Lt, true) => tighten_max(&mut interval, shift(bound.max, -1)),
            (BinOp::Le, false) => tighten_min(&mut interval, bound.min),
            (BinOp::Lt, false) => tighten_min(&mut interval, shift(bound.min, 1)),
            (BinOp::Eq, _) => {
                tighten_min(&mut interval, bound.min);
                tighten_max(&mut interval, bound.max);
            }
            _ => continue,
        }
        out.push((name.to_string(), interval));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x() -> Expr {
        Expr::var("x")
    }

    fn scope_x(lo: i64, hi: i64) -> Scope<Interval> {
        let mut s = Scope::new();
        s.push("x", Interval::new(Expr::Int(lo), Expr::Int(hi)));
        s
    }

    #[test]
    fn test_linear_bounds_are_exact() {
        let s = scope_x(0, 99);
        let i = bounds_of_expr(&(x() + 1), &s);
        assert_eq!(i, Interval::new(Expr::Int(1), Expr::Int(100)));
        let i = bounds_of_expr(&(Expr::int(10) - x() * 2), &s);
        assert_eq!(i, Interval::new(Expr::Int(-188), Expr::Int(10)));
    }

    #[test]
    fn test_symbolic_variables_stay_points() {
        let s = Scope::new();
        let i = bounds_of_expr(&(Expr::var("t") * 8 + 3), &s);
        assert_eq!(i, Interval::point(Expr::var("t") * 8 + 3));
    }

    #[test]
    fn test_products_use_corners() {
        let mut s = scope_x(-2, 3);
        s.push("y", Interval::new(Expr::Int(-1), Expr::Int(4)));
        let i = bounds_of_expr(&(x() * Expr::var("y")), &s);
        assert_eq!(i, Interval::new(Expr::Int(-8), Expr::Int(12)));
    }

    #[test]
    fn test_division_and_modulo() {
        let s = scope_x(-5, 9);
        assert_eq!(
            bounds_of_expr(&Expr::div(x(), Expr::int(2)), &s),
            Interval::new(Expr::Int(-3), Expr::Int(4))
        );
        assert_eq!(
            bounds_of_expr(&Expr::modulo(x(), Expr::int(4)), &s),
            Interval::new(Expr::Int(0), Expr::Int(3))
        );
        let small = scope_x(1, 2);
        assert_eq!(
            bounds_of_expr(&Expr::modulo(x(), Expr::int(4)), &small),
            Interval::new(Expr::Int(1), Expr::Int(2))
        );
        // divisor straddles zero
        let mut s2 = scope_x(-5, 9);
        s2.push("d", Interval::new(Expr::Int(-1), Expr::Int(1)));
        assert_eq!(
            bounds_of_expr(&Expr::div(x(), Expr::var("d")), &s2),
            Interval::new(Expr::Int(-9), Expr::Int(9))
        );
    }

    #[test]
    fn test_loads_are_unbounded() {
        let s = scope_x(0, 3);
        let i = bounds_of_expr(&(Expr::call("f", vec![x()]) + 1), &s);
        assert!(!i.is_bounded());
        // clamping recovers a bound
        let c = Expr::clamp(Expr::call("f", vec![x()]), Expr::int(0), Expr::int(15));
        assert_eq!(bounds_of_expr(&c, &s), Interval::new(Expr::Int(0), Expr::Int(15)));
    }

    #[test]
    fn test_select_is_hull() {
        let s = scope_x(0, 10);
        let e = Expr::select(Expr::lt(x(), Expr::int(5)), x() + 100, Expr::int(-1));
        assert_eq!(bounds_of_expr(&e, &s), Interval::new(Expr::Int(-1), Expr::Int(110)));
    }

    #[test]
    fn test_narrowing() {
        let s = scope_x(0, 15);
        let cond = Expr::and(Expr::le(x(), Expr::int(9)), Expr::lt(Expr::int(2), x()));
        let n = narrow_by_condition(&cond, &s);
        let last = &n.last().unwrap().1;
        assert_eq!(last, &Interval::new(Expr::Int(3), Expr::Int(9)));
        // variables not in scope are left alone
        assert!(narrow_by_condition(&Expr::le(Expr::var("q"), Expr::int(1)), &s).is_empty());
    }

    #[test]
    fn test_scope_shadowing() {
        let mut s = Scope::new();
        s.push("a", 1);
        s.push("a", 2);
        assert_eq!(s.get("a"), Some(&2));
        s.pop("a");
        assert_eq!(s.get("a"), Some(&1));
        s.pop("a");
        assert!(!s.contains("a"));
    }
}
