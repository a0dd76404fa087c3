//! Monotonicity of expressions in a variable.

use crate::ir::expr::{BinOp, Expr};
use std::fmt;

/// How an expression changes as a variable increases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Monotonic {
    Constant,
    Increasing,
    Decreasing,
    Unknown,
}

impl Monotonic {
    fn flip(self) -> Self {
        match self {
            Monotonic::Increasing => Monotonic::Decreasing,
            Monotonic::Decreasing => Monotonic::Increasing,
            other => other,
        }
    }

    /// Direction of a sum of two expressions.
    fn combine(self, other: Self) -> Self {
        use Monotonic::*;
        match (self, other) {
            (Constant, x) | (x, Constant) => x,
            (Increasing, Increasing) => Increasing,
            (Decreasing, Decreasing) => Decreasing,
            _ => Unknown,
        }
    }

    /// Never decreases as the variable grows.
    pub fn is_non_decreasing(self) -> bool {
        matches!(self, Monotonic::Constant | Monotonic::Increasing)
    }
}

impl fmt::Display for Monotonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Monotonic::Constant => "constant",
            Monotonic::Increasing => "increasing",
            Monotonic::Decreasing => "decreasing",
            Monotonic::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Classify `e` as a function of `var`. `Increasing` and `Decreasing` are
/// not strict.
pub fn is_monotonic(e: &Expr, var: &str) -> Monotonic {
    match e {
        Expr::Int(_) => Monotonic::Constant,
        Expr::Var(v) if v == var => Monotonic::Increasing,
        Expr::Var(_) => Monotonic::Constant,
        Expr::Binary { op, a, b } => {
            let ma = is_monotonic(a, var);
            let mb = is_monotonic(b, var);
            match op {
                BinOp::Add | BinOp::Min | BinOp::Max => ma.combine(mb),
                BinOp::Sub => ma.combine(mb.flip()),
                BinOp::Mul => match (a.as_int(), b.as_int()) {
                    (_, Some(k)) => scaled(ma, k),
                    (Some(k), _) => scaled(mb, k),
                    _ => constant_or_unknown(ma, mb),
                },
                BinOp::Div => match b.as_int() {
                    Some(k) => scaled(ma, k),
                    None => constant_or_unknown(ma, mb),
                },
                _ => constant_or_unknown(ma, mb),
            }
        }
        Expr::Not(a) => constant_or_unknown(is_monotonic(a, var), Monotonic::Constant),
        Expr::Select { cond, then_value, else_value } => {
            let mc = is_monotonic(cond, var);
            let mt = is_monotonic(then_value, var);
            let me = is_monotonic(else_value, var);
            if mc == Monotonic::Constant {
                mt.combine(me)
            } else if mt == Monotonic::Constant && me == Monotonic::Constant && then_value == else_value {
                Monotonic::Constant
            } else {
                Monotonic::Unknown
            }
        }
        Expr::Call { args, .. } => {
            if args.iter().all(|a| is_monotonic(a, var) == Monotonic::Constant) {
                Monotonic::Constant
            } else {
                Monotonic::Unknown
            }
        }
        Expr::Load { index, .. } => constant_or_unknown(is_monotonic(index, var), Monotonic::Constant),
    }
}

fn scaled(m: Monotonic, k: i64) -> Monotonic {
    match k {
        0 => Monotonic::Constant,
        k if k > 0 => m,
        _ => m.flip(),
    }
}

fn constant_or_unknown(a: Monotonic, b: Monotonic) -> Monotonic {
    if a == Monotonic::Constant && b == Monotonic::Constant {
        Monotonic::Constant
    } else {
        Monotonic::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v() -> Expr {
        Expr::var("v")
    }

    #[test]
    fn test_affine() {
        assert_eq!(is_monotonic(&(v() * 8 + 3), "v"), Monotonic::Increasing);
        assert_eq!(is_monotonic(&(Expr::int(3) - v()), "v"), Monotonic::Decreasing);
        assert_eq!(is_monotonic(&(Expr::var("w") + 1), "v"), Monotonic::Constant);
        assert_eq!(is_monotonic(&(v() - v()), "v"), Monotonic::Unknown);
    }

    #[test]
    fn test_min_max_division() {
        let e = Expr::min(v() + 2, Expr::var("n"));
        assert!(is_monotonic(&e, "v").is_non_decreasing());
        assert_eq!(is_monotonic(&Expr::div(v(), Expr::int(-2)), "v"), Monotonic::Decreasing);
        assert_eq!(is_monotonic(&Expr::modulo(v(), Expr::int(4)), "v"), Monotonic::Unknown);
    }

    #[test]
    fn test_data_dependent() {
        let e = Expr::call("lut", vec![v()]);
        assert_eq!(is_monotonic(&e, "v"), Monotonic::Unknown);
        let s = Expr::select(Expr::lt(v(), Expr::int(3)), Expr::int(0), Expr::int(1));
        assert_eq!(is_monotonic(&s, "v"), Monotonic::Unknown);
    }
}
