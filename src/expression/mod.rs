//! Expression trees of explicit formulas: parsing, evaluation, constant folding and
//! symbolic differentiation.

mod ast;
mod derivative;
mod parser;
mod simplify;

pub use ast::{BinaryOp, Expr, Function};
pub use parser::{equation_identifiers, parse_equation, ExpressionError};
