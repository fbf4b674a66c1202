//! Constant folding and substitution of known slot values.

use super::ast::{BinaryOp, Expr, Function};

impl Expr {
    /// Replaces every slot for which `value` yields a number by that number.
    pub fn substitute<F>(&self, value: &F) -> Expr
    where
        F: Fn(usize) -> Option<f64>,
    {
        match self {
            Expr::Num(v) => Expr::Num(*v),
            Expr::Var(slot) => match value(*slot) {
                Some(v) => Expr::Num(v),
                None => Expr::Var(*slot),
            },
            Expr::Neg(inner) => Expr::Neg(Box::new(inner.substitute(value))),
            Expr::Binary(op, lhs, rhs) => {
                Expr::binary(*op, lhs.substitute(value), rhs.substitute(value))
            }
            Expr::Call(function, args) => {
                Expr::Call(*function, args.iter().map(|a| a.substitute(value)).collect())
            }
        }
    }

    /// Folds constant sub-trees and removes neutral elements.
    ///
    /// Folding is idempotent: folding an already folded tree returns an equal tree.
    pub fn fold(self) -> Expr {
        match self {
            Expr::Num(_) | Expr::Var(_) => self,
            Expr::Neg(inner) => match inner.fold() {
                Expr::Num(v) => Expr::Num(-v),
                Expr::Neg(x) => *x,
                other => Expr::Neg(Box::new(other)),
            },
            Expr::Binary(op, lhs, rhs) => fold_binary(op, lhs.fold(), rhs.fold()),
            Expr::Call(function, args) => {
                fold_call(function, args.into_iter().map(Expr::fold).collect())
            }
        }
    }
}

fn fold_binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    use BinaryOp::*;

    if let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) {
        return Expr::Num(op.apply(a, b));
    }

    let is = |e: &Expr, v: f64| e.as_number() == Some(v);

    match op {
        Add if is(&lhs, 0.0) => rhs,
        Add if is(&rhs, 0.0) => lhs,
        Sub if is(&rhs, 0.0) => lhs,
        Sub if is(&lhs, 0.0) => Expr::Neg(Box::new(rhs)),
        Mul if is(&lhs, 0.0) || is(&rhs, 0.0) => Expr::Num(0.0),
        Mul if is(&lhs, 1.0) => rhs,
        Mul if is(&rhs, 1.0) => lhs,
        Div if is(&rhs, 1.0) => lhs,
        Div if is(&lhs, 0.0) && !rhs.is_zero() => Expr::Num(0.0),
        Pow if is(&rhs, 1.0) => lhs,
        Pow if is(&rhs, 0.0) => Expr::Num(1.0),
        _ => Expr::binary(op, lhs, rhs),
    }
}

fn fold_call(function: Function, mut args: Vec<Expr>) -> Expr {
    if function == Function::If && args.len() == 3 {
        if let Some(condition) = args[0].as_number() {
            let branch = if condition != 0.0 { 1 } else { 2 };
            return args.swap_remove(branch);
        }
        if args[1] == args[2] {
            return args.swap_remove(1);
        }
        return Expr::Call(function, args);
    }

    let values: Option<Vec<f64>> = args.iter().map(Expr::as_number).collect();
    match values {
        Some(values) => Expr::Num(function.apply(&values)),
        None => Expr::Call(function, args),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::expression::parser::parse_equation;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_substitute_then_fold_to_number() {
        let expr = parse_equation("k * 2 + offset", &names(&["k", "offset"])).unwrap();
        let folded = expr.substitute(&|slot| Some([3.0, 1.0][slot])).fold();
        assert_eq!(folded, Expr::Num(7.0));
    }

    #[test]
    fn test_partial_substitution_removes_neutral_elements() {
        let expr = parse_equation("k * A + c", &names(&["k", "A", "c"])).unwrap();
        let folded = expr
            .substitute(&|slot| match slot {
                0 => Some(1.0),
                2 => Some(0.0),
                _ => None,
            })
            .fold();
        assert_eq!(folded, Expr::Var(1));
    }

    #[test]
    fn test_fold_is_idempotent() {
        let expr = parse_equation("if(gt(c, 1), A * 0 + B, A)", &names(&["c", "A", "B"]))
            .unwrap()
            .substitute(&|slot| (slot == 0).then_some(2.0));
        let once = expr.fold();
        let twice = once.clone().fold();
        assert_eq!(once, Expr::Var(2));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_fold_keeps_state_dependent_condition() {
        let expr = parse_equation("if(gt(A, 1), 2, 3)", &names(&["A"])).unwrap();
        let folded = expr.clone().fold();
        assert_eq!(folded, expr);
    }
}
