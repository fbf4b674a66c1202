//! Parsing of equation text into [`Expr`] trees.
//!
//! Tokenizing and operator precedence are delegated to `meval`, which hands back the
//! equation in reverse polish notation. The RPN is folded into an [`Expr`] while
//! identifiers are bound to the slots of the declaring formula.

use meval::tokenizer::{Operation, Token};
use thiserror::Error;

use super::ast::{BinaryOp, Expr, Function};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("function '{name}' called with {given} arguments")]
    Arity { name: String, given: usize },
    #[error("unsupported operator '{0}'")]
    Unsupported(String),
}

/// Parses `equation`, binding every identifier to its position in `aliases`.
///
/// The identifiers `pi` and `e` are read as constants unless they are declared aliases.
///
/// # Arguments
///
/// * `equation` - Equation text, e.g. `"k * A / (Km + A)"`
/// * `aliases` - Aliases declared by the owning formula, in slot order
///
/// # Returns
///
/// Returns the expression tree or an [`ExpressionError`] describing the first problem.
pub fn parse_equation(equation: &str, aliases: &[String]) -> Result<Expr, ExpressionError> {
    let rpn: meval::Expr = equation
        .parse()
        .map_err(|e: meval::Error| ExpressionError::Syntax(e.to_string()))?;

    let mut stack: Vec<Expr> = Vec::new();

    for token in rpn.iter() {
        match token {
            Token::Number(value) => stack.push(Expr::Num(*value)),
            Token::Var(name) => stack.push(resolve_identifier(name, aliases)?),
            Token::Unary(Operation::Plus) => {}
            Token::Unary(Operation::Minus) => {
                let operand = pop(&mut stack)?;
                stack.push(match operand {
                    Expr::Num(v) => Expr::Num(-v),
                    other => Expr::Neg(Box::new(other)),
                });
            }
            Token::Unary(op) => return Err(ExpressionError::Unsupported(format!("{:?}", op))),
            Token::Binary(op) => {
                let rhs = pop(&mut stack)?;
                let lhs = pop(&mut stack)?;
                stack.push(Expr::binary(binary_op(op)?, lhs, rhs));
            }
            Token::Func(name, arg_count) => {
                let function = Function::from_name(name)
                    .ok_or_else(|| ExpressionError::UnknownFunction(name.clone()))?;
                let given = arg_count.unwrap_or(0);
                check_arity(function, name, given)?;

                if stack.len() < given {
                    return Err(ExpressionError::Syntax(format!(
                        "missing arguments of '{}'",
                        name
                    )));
                }
                let args = stack.split_off(stack.len() - given);
                stack.push(Expr::Call(function, args));
            }
            other => {
                return Err(ExpressionError::Syntax(format!(
                    "unexpected token {:?}",
                    other
                )))
            }
        }
    }

    match (stack.pop(), stack.is_empty()) {
        (Some(expr), true) => Ok(expr),
        _ => Err(ExpressionError::Syntax("incomplete expression".into())),
    }
}

/// Returns the identifiers used in `equation` in order of first appearance.
pub fn equation_identifiers(equation: &str) -> Result<Vec<String>, ExpressionError> {
    let rpn: meval::Expr = equation
        .parse()
        .map_err(|e: meval::Error| ExpressionError::Syntax(e.to_string()))?;

    let mut identifiers: Vec<String> = Vec::new();
    for token in rpn.iter() {
        if let Token::Var(name) = token {
            if !identifiers.contains(name) {
                identifiers.push(name.clone());
            }
        }
    }
    Ok(identifiers)
}

fn resolve_identifier(name: &str, aliases: &[String]) -> Result<Expr, ExpressionError> {
    if let Some(slot) = aliases.iter().position(|a| a == name) {
        return Ok(Expr::Var(slot));
    }

    match name {
        "pi" => Ok(Expr::Num(std::f64::consts::PI)),
        "e" => Ok(Expr::Num(std::f64::consts::E)),
        _ => Err(ExpressionError::UnknownIdentifier(name.to_string())),
    }
}

fn binary_op(op: &Operation) -> Result<BinaryOp, ExpressionError> {
    match op {
        Operation::Plus => Ok(BinaryOp::Add),
        Operation::Minus => Ok(BinaryOp::Sub),
        Operation::Times => Ok(BinaryOp::Mul),
        Operation::Div => Ok(BinaryOp::Div),
        Operation::Pow => Ok(BinaryOp::Pow),
        Operation::Rem => Ok(BinaryOp::Rem),
        other => Err(ExpressionError::Unsupported(format!("{:?}", other))),
    }
}

fn check_arity(function: Function, name: &str, given: usize) -> Result<(), ExpressionError> {
    let (min, max) = function.arity();
    if given < min || max.is_some_and(|max| given > max) {
        return Err(ExpressionError::Arity {
            name: name.to_string(),
            given,
        });
    }
    Ok(())
}

fn pop(stack: &mut Vec<Expr>) -> Result<Expr, ExpressionError> {
    stack
        .pop()
        .ok_or_else(|| ExpressionError::Syntax("missing operand".into()))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn aliases(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_parse_binds_slots() {
        let expr = parse_equation("k * A", &aliases(&["A", "k"])).unwrap();
        assert_eq!(
            expr,
            Expr::binary(BinaryOp::Mul, Expr::Var(1), Expr::Var(0))
        );
    }

    #[test]
    fn test_parse_precedence_and_unary_minus() {
        let expr = parse_equation("-a + b * 2 ^ 2", &aliases(&["a", "b"])).unwrap();
        assert_eq!(expr.eval(&|slot| [3.0, 5.0][slot]), 17.0);
    }

    #[test]
    fn test_parse_logical_functions() {
        let expr = parse_equation(
            "if(and(ge(Time, 5), lt(A, 10)), 1, 0)",
            &aliases(&["Time", "A"]),
        )
        .unwrap();
        assert_eq!(expr.eval(&|slot| [6.0, 3.0][slot]), 1.0);
        assert_eq!(expr.eval(&|slot| [4.0, 3.0][slot]), 0.0);
    }

    #[test]
    fn test_parse_constants() {
        let expr = parse_equation("2 * pi", &[]).unwrap();
        assert_eq!(expr.eval(&|_| 0.0), 2.0 * std::f64::consts::PI);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse_equation("k * X", &aliases(&["k"])),
            Err(ExpressionError::UnknownIdentifier("X".into()))
        );
        assert_eq!(
            parse_equation("foo(1)", &[]),
            Err(ExpressionError::UnknownFunction("foo".into()))
        );
        assert!(matches!(
            parse_equation("if(1, 2)", &[]),
            Err(ExpressionError::Arity { .. })
        ));
        assert!(matches!(
            parse_equation("1 +", &[]),
            Err(ExpressionError::Syntax(_))
        ));
    }

    #[test]
    fn test_equation_identifiers() {
        let ids = equation_identifiers("k * A + k / B").unwrap();
        assert_eq!(ids, vec!["k", "A", "B"]);
    }
}
