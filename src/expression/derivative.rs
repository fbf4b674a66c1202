//! Symbolic partial derivatives of expression trees.
//!
//! Derivatives are used for the analytic Jacobian and for the parameter terms of the
//! sensitivity equations. Piecewise functions (`if`, `min`, `max`, `abs`) are
//! differentiated branch-wise; logical functions and rounding have derivative zero.

use super::ast::{BinaryOp, Expr, Function};

impl Expr {
    /// Partial derivative with respect to `slot`, already folded.
    pub fn derivative(&self, slot: usize) -> Expr {
        self.derive(slot).fold()
    }

    fn derive(&self, slot: usize) -> Expr {
        use BinaryOp::*;

        if !self.uses_slot(slot) {
            return Expr::Num(0.0);
        }

        match self {
            Expr::Num(_) => Expr::Num(0.0),
            Expr::Var(s) => Expr::Num(if *s == slot { 1.0 } else { 0.0 }),
            Expr::Neg(inner) => Expr::Neg(Box::new(inner.derive(slot))),
            Expr::Binary(op, a, b) => {
                let a = a.as_ref();
                let b = b.as_ref();
                let da = a.derive(slot);
                let db = b.derive(slot);

                match op {
                    Add => Expr::binary(Add, da, db),
                    Sub => Expr::binary(Sub, da, db),
                    Mul => Expr::binary(
                        Add,
                        Expr::binary(Mul, da, b.clone()),
                        Expr::binary(Mul, a.clone(), db),
                    ),
                    Div => Expr::binary(
                        Div,
                        Expr::binary(
                            Sub,
                            Expr::binary(Mul, da, b.clone()),
                            Expr::binary(Mul, a.clone(), db),
                        ),
                        Expr::binary(Pow, b.clone(), Expr::Num(2.0)),
                    ),
                    Pow if !b.uses_slot(slot) => Expr::binary(
                        Mul,
                        Expr::binary(
                            Mul,
                            b.clone(),
                            Expr::binary(Pow, a.clone(), Expr::binary(Sub, b.clone(), Expr::Num(1.0))),
                        ),
                        da,
                    ),
                    Pow => {
                        // d(a^b) = a^b * (db * ln(a) + b * da / a)
                        let ln_a = Expr::Call(Function::Ln, vec![a.clone()]);
                        Expr::binary(
                            Mul,
                            self.clone(),
                            Expr::binary(
                                Add,
                                Expr::binary(Mul, db, ln_a),
                                Expr::binary(
                                    Div,
                                    Expr::binary(Mul, b.clone(), da),
                                    a.clone(),
                                ),
                            ),
                        )
                    }
                    // piecewise linear in the dividend
                    Rem => da,
                }
            }
            Expr::Call(function, args) => derive_call(*function, args, slot),
        }
    }
}

fn derive_call(function: Function, args: &[Expr], slot: usize) -> Expr {
    use BinaryOp::*;

    let call = |f: Function, a: &Expr| Expr::Call(f, vec![a.clone()]);
    let Some(a) = args.first() else {
        return Expr::Num(0.0);
    };
    let da = || a.derive(slot);

    match function {
        Function::Exp => Expr::binary(Mul, call(Function::Exp, a), da()),
        Function::Ln => Expr::binary(Div, da(), a.clone()),
        Function::Log10 => Expr::binary(
            Div,
            da(),
            Expr::binary(Mul, a.clone(), Expr::Num(std::f64::consts::LN_10)),
        ),
        Function::Sqrt => Expr::binary(
            Div,
            da(),
            Expr::binary(Mul, Expr::Num(2.0), call(Function::Sqrt, a)),
        ),
        Function::Abs => Expr::binary(Mul, call(Function::Sign, a), da()),
        Function::Sin => Expr::binary(Mul, call(Function::Cos, a), da()),
        Function::Cos => Expr::Neg(Box::new(Expr::binary(Mul, call(Function::Sin, a), da()))),
        Function::Tan => Expr::binary(
            Div,
            da(),
            Expr::binary(Pow, call(Function::Cos, a), Expr::Num(2.0)),
        ),
        Function::Asin | Function::Acos => {
            let d = Expr::binary(
                Div,
                da(),
                call(
                    Function::Sqrt,
                    &Expr::binary(
                        Sub,
                        Expr::Num(1.0),
                        Expr::binary(Pow, a.clone(), Expr::Num(2.0)),
                    ),
                ),
            );
            if function == Function::Acos {
                Expr::Neg(Box::new(d))
            } else {
                d
            }
        }
        Function::Atan => Expr::binary(
            Div,
            da(),
            Expr::binary(
                Add,
                Expr::Num(1.0),
                Expr::binary(Pow, a.clone(), Expr::Num(2.0)),
            ),
        ),
        Function::Sinh => Expr::binary(Mul, call(Function::Cosh, a), da()),
        Function::Cosh => Expr::binary(Mul, call(Function::Sinh, a), da()),
        Function::Tanh => Expr::binary(
            Mul,
            Expr::binary(
                Sub,
                Expr::Num(1.0),
                Expr::binary(Pow, call(Function::Tanh, a), Expr::Num(2.0)),
            ),
            da(),
        ),
        Function::Min | Function::Max => derive_extremum(function, args, slot),
        Function::If if args.len() == 3 => Expr::Call(
            Function::If,
            vec![
                args[0].clone(),
                args[1].derive(slot),
                args[2].derive(slot),
            ],
        ),
        // piecewise constant
        _ => Expr::Num(0.0),
    }
}

/// `min(a, rest..)' = if(a <= min(rest..), a', min(rest..)')`, same for `max` with `>=`.
fn derive_extremum(function: Function, args: &[Expr], slot: usize) -> Expr {
    match args {
        [] => Expr::Num(0.0),
        [single] => single.derive(slot),
        [first, rest @ ..] => {
            let rest_expr = if rest.len() == 1 {
                rest[0].clone()
            } else {
                Expr::Call(function, rest.to_vec())
            };
            let compare = if function == Function::Min {
                Function::Le
            } else {
                Function::Ge
            };
            Expr::Call(
                Function::If,
                vec![
                    Expr::Call(compare, vec![first.clone(), rest_expr]),
                    first.derive(slot),
                    derive_extremum(function, rest, slot),
                ],
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::expression::parser::parse_equation;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|n| n.to_string()).collect()
    }

    /// Compares the symbolic derivative against a central finite difference.
    fn check(equation: &str, aliases: &[&str], point: &[f64], slot: usize) {
        let expr = parse_equation(equation, &names(aliases)).unwrap();
        let derivative = expr.derivative(slot);

        let at = |values: Vec<f64>| move |s: usize| values[s];
        let analytic = derivative.eval(&at(point.to_vec()));

        let h = 1e-6;
        let mut plus = point.to_vec();
        let mut minus = point.to_vec();
        plus[slot] += h;
        minus[slot] -= h;
        let numeric = (expr.eval(&at(plus)) - expr.eval(&at(minus))) / (2.0 * h);

        assert_relative_eq!(analytic, numeric, max_relative = 1e-5, epsilon = 1e-8);
    }

    #[test]
    fn test_rational_rate_law() {
        check("Vmax * S / (Km + S)", &["Vmax", "S", "Km"], &[10.0, 3.0, 2.0], 1);
        check("Vmax * S / (Km + S)", &["Vmax", "S", "Km"], &[10.0, 3.0, 2.0], 2);
    }

    #[test]
    fn test_powers_and_transcendental() {
        check("A ^ 3 + exp(-k * A)", &["A", "k"], &[1.5, 0.3], 0);
        check("A ^ B", &["A", "B"], &[1.5, 2.5], 0);
        check("A ^ B", &["A", "B"], &[1.5, 2.5], 1);
        check("ln(A) * sqrt(A) + sin(A) / cos(A)", &["A"], &[0.7], 0);
        check("atan(A) + tanh(A) - log10(A)", &["A"], &[0.7], 0);
    }

    #[test]
    fn test_piecewise() {
        check("max(A, 2 * B, 1)", &["A", "B"], &[3.0, 1.0], 0);
        check("max(A, 2 * B, 1)", &["A", "B"], &[1.0, 3.0], 1);
        check("min(A, B)", &["A", "B"], &[1.0, 3.0], 0);
        check("if(gt(A, 1), A ^ 2, -A)", &["A"], &[2.0], 0);
        check("if(gt(A, 1), A ^ 2, -A)", &["A"], &[0.5], 0);
        check("abs(A - 4)", &["A"], &[2.0], 0);
    }

    #[test]
    fn test_unused_slot_has_zero_derivative() {
        let expr = parse_equation("k * A", &names(&["k", "A", "B"])).unwrap();
        assert_eq!(expr.derivative(2), Expr::Num(0.0));
        assert_eq!(expr.derivative(0), Expr::Var(1));
    }
}
