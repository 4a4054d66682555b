//! AST-level constant folding.
//!
//! Folds literal arithmetic, comparison and string concatenation before
//! instruction selection so hot loops don't re-evaluate constant subtrees.
//! Semantics-preserving only: anything involving ToPrimitive on objects, or
//! operators whose result depends on runtime state, is left alone.

use crate::ast::{BinaryOp, Expr, UnaryOp};

/// Fold a single expression node whose children are already folded.
///
/// Returns `Some(replacement)` when the node is a compile-time constant.
pub fn fold_expr(expr: &Expr) -> Option<Expr> {
    match expr {
        Expr::Binary { op, lhs, rhs } => fold_binary(*op, lhs, rhs),
        Expr::Unary { op, operand } => fold_unary(*op, operand),
        _ => None,
    }
}

fn fold_binary(op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Option<Expr> {
    if let (Expr::Number(a), Expr::Number(b)) = (lhs, rhs) {
        let (a, b) = (*a, *b);
        return Some(match op {
            BinaryOp::Add => Expr::Number(a + b),
            BinaryOp::Sub => Expr::Number(a - b),
            BinaryOp::Mul => Expr::Number(a * b),
            BinaryOp::Div => Expr::Number(a / b),
            BinaryOp::Mod => Expr::Number(js_mod(a, b)),
            BinaryOp::Pow => Expr::Number(a.powf(b)),
            BinaryOp::Lt => Expr::Boolean(a < b),
            BinaryOp::Le => Expr::Boolean(a <= b),
            BinaryOp::Gt => Expr::Boolean(a > b),
            BinaryOp::Ge => Expr::Boolean(a >= b),
            BinaryOp::Eq | BinaryOp::StrictEq => Expr::Boolean(a == b),
            BinaryOp::Ne | BinaryOp::StrictNe => Expr::Boolean(a != b),
            BinaryOp::BitAnd => Expr::Number((to_int32(a) & to_int32(b)) as f64),
            BinaryOp::BitOr => Expr::Number((to_int32(a) | to_int32(b)) as f64),
            BinaryOp::BitXor => Expr::Number((to_int32(a) ^ to_int32(b)) as f64),
            BinaryOp::Shl => Expr::Number((to_int32(a) << (to_uint32(b) & 31)) as f64),
            BinaryOp::Shr => Expr::Number((to_int32(a) >> (to_uint32(b) & 31)) as f64),
            BinaryOp::Ushr => Expr::Number((to_uint32(a) >> (to_uint32(b) & 31)) as f64),
            BinaryOp::InstanceOf | BinaryOp::In => return None,
        });
    }
    if let (Expr::String(a), Expr::String(b)) = (lhs, rhs)
        && op == BinaryOp::Add
    {
        let mut out = String::with_capacity(a.len() + b.len());
        out.push_str(a);
        out.push_str(b);
        return Some(Expr::String(out));
    }
    None
}

fn fold_unary(op: UnaryOp, operand: &Expr) -> Option<Expr> {
    match (op, operand) {
        (UnaryOp::Neg, Expr::Number(n)) => Some(Expr::Number(-n)),
        (UnaryOp::BitNot, Expr::Number(n)) => Some(Expr::Number((!to_int32(*n)) as f64)),
        (UnaryOp::Not, Expr::Boolean(b)) => Some(Expr::Boolean(!b)),
        _ => None,
    }
}

/// ECMAScript `%`: sign of the dividend, NaN on zero divisor.
fn js_mod(a: f64, b: f64) -> f64 {
    if b == 0.0 { f64::NAN } else { a % b }
}

/// ECMAScript ToInt32 for a known-finite-or-not double.
fn to_int32(n: f64) -> i32 {
    if !n.is_finite() || n == 0.0 {
        return 0;
    }
    let n = n.trunc();
    (n as i64 as u64 as u32) as i32
}

fn to_uint32(n: f64) -> u32 {
    to_int32(n) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::num;

    fn bin(op: BinaryOp, a: f64, b: f64) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(num(a)),
            rhs: Box::new(num(b)),
        }
    }

    #[test]
    fn folds_arithmetic() {
        assert_eq!(fold_expr(&bin(BinaryOp::Add, 2.0, 3.0)), Some(num(5.0)));
        assert_eq!(fold_expr(&bin(BinaryOp::Mul, 4.0, 0.5)), Some(num(2.0)));
    }

    #[test]
    fn folds_comparisons_to_booleans() {
        assert_eq!(
            fold_expr(&bin(BinaryOp::Lt, 1.0, 2.0)),
            Some(Expr::Boolean(true))
        );
    }

    #[test]
    fn zero_divisor_mod_is_nan() {
        match fold_expr(&bin(BinaryOp::Mod, 5.0, 0.0)) {
            Some(Expr::Number(n)) => assert!(n.is_nan()),
            other => panic!("expected NaN, got {other:?}"),
        }
    }

    #[test]
    fn string_concat_folds() {
        let concat = Expr::Binary {
            op: BinaryOp::Add,
            lhs: Box::new(Expr::String("foo".into())),
            rhs: Box::new(Expr::String("bar".into())),
        };
        assert_eq!(fold_expr(&concat), Some(Expr::String("foobar".into())));
    }

    #[test]
    fn leaves_runtime_dependent_ops_alone() {
        assert_eq!(fold_expr(&bin(BinaryOp::In, 1.0, 2.0)), None);
        assert_eq!(fold_expr(&Expr::Ident("x".into())), None);
    }

    #[test]
    fn shift_masks_count() {
        assert_eq!(
            fold_expr(&bin(BinaryOp::Shl, 1.0, 33.0)),
            Some(num(2.0)) // 1 << (33 & 31)
        );
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn same_number(a: Option<Expr>, b: f64) -> bool {
            match a {
                Some(Expr::Number(n)) => n == b || (n.is_nan() && b.is_nan()),
                _ => false,
            }
        }

        proptest! {
            /// Folding arithmetic agrees with evaluating it.
            #[test]
            fn fold_matches_evaluation(a in -1e9f64..1e9, b in -1e9f64..1e9) {
                prop_assert!(same_number(fold_expr(&bin(BinaryOp::Add, a, b)), a + b));
                prop_assert!(same_number(fold_expr(&bin(BinaryOp::Sub, a, b)), a - b));
                prop_assert!(same_number(fold_expr(&bin(BinaryOp::Mul, a, b)), a * b));
            }

            /// Folded comparisons agree with f64 ordering.
            #[test]
            fn fold_matches_comparison(a in any::<i32>(), b in any::<i32>()) {
                let (a, b) = (a as f64, b as f64);
                prop_assert_eq!(
                    fold_expr(&bin(BinaryOp::Lt, a, b)),
                    Some(Expr::Boolean(a < b))
                );
                prop_assert_eq!(
                    fold_expr(&bin(BinaryOp::StrictEq, a, b)),
                    Some(Expr::Boolean(a == b))
                );
            }

            /// Bitwise folds match the ToInt32 semantics of the runtime.
            #[test]
            fn fold_matches_int32_semantics(a in any::<i32>(), b in any::<i32>()) {
                let (fa, fb) = (a as f64, b as f64);
                prop_assert!(same_number(
                    fold_expr(&bin(BinaryOp::BitAnd, fa, fb)),
                    (a & b) as f64
                ));
                prop_assert!(same_number(
                    fold_expr(&bin(BinaryOp::Shl, fa, fb)),
                    (a << ((b as u32) & 31)) as f64
                ));
            }
        }
    }
}
