//! Expression trees of explicit formulas.
//!
//! An [`Expr`] refers to its inputs only through variable slots. A slot is the position
//! of an alias in the reference list of the formula that owns the tree, so the tree
//! itself never knows about quantities, time or the state vector.

use std::collections::BTreeSet;
use std::fmt::Write;

/// Binary arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Rem,
}

impl BinaryOp {
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
            BinaryOp::Rem => a % b,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "^",
            BinaryOp::Rem => "%",
        }
    }

    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Add | BinaryOp::Sub => 1,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 2,
            BinaryOp::Pow => 3,
        }
    }
}

/// Named functions, including the logical ones.
///
/// Logical functions return `1.0` for true and `0.0` for false; any value other
/// than `0.0` counts as true when used as an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Exp,
    Ln,
    Log10,
    Sqrt,
    Abs,
    Sign,
    Floor,
    Ceil,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Min,
    Max,
    If,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Neq,
    And,
    Or,
    Not,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        let function = match name.to_ascii_lowercase().as_str() {
            "exp" => Function::Exp,
            "ln" | "log" => Function::Ln,
            "log10" => Function::Log10,
            "sqrt" => Function::Sqrt,
            "abs" => Function::Abs,
            "sign" | "signum" => Function::Sign,
            "floor" => Function::Floor,
            "ceil" => Function::Ceil,
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "asin" => Function::Asin,
            "acos" => Function::Acos,
            "atan" => Function::Atan,
            "sinh" => Function::Sinh,
            "cosh" => Function::Cosh,
            "tanh" => Function::Tanh,
            "min" => Function::Min,
            "max" => Function::Max,
            "if" => Function::If,
            "lt" => Function::Lt,
            "le" | "leq" => Function::Le,
            "gt" => Function::Gt,
            "ge" | "geq" => Function::Ge,
            "eq" => Function::Eq,
            "neq" | "ne" => Function::Neq,
            "and" => Function::And,
            "or" => Function::Or,
            "not" => Function::Not,
            _ => return None,
        };
        Some(function)
    }

    pub fn name(self) -> &'static str {
        match self {
            Function::Exp => "exp",
            Function::Ln => "ln",
            Function::Log10 => "log10",
            Function::Sqrt => "sqrt",
            Function::Abs => "abs",
            Function::Sign => "sign",
            Function::Floor => "floor",
            Function::Ceil => "ceil",
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::Tan => "tan",
            Function::Asin => "asin",
            Function::Acos => "acos",
            Function::Atan => "atan",
            Function::Sinh => "sinh",
            Function::Cosh => "cosh",
            Function::Tanh => "tanh",
            Function::Min => "min",
            Function::Max => "max",
            Function::If => "if",
            Function::Lt => "lt",
            Function::Le => "le",
            Function::Gt => "gt",
            Function::Ge => "ge",
            Function::Eq => "eq",
            Function::Neq => "neq",
            Function::And => "and",
            Function::Or => "or",
            Function::Not => "not",
        }
    }

    /// Accepted argument counts as `(min, max)`; `None` means unbounded.
    pub fn arity(self) -> (usize, Option<usize>) {
        match self {
            Function::Min | Function::Max => (1, None),
            Function::If => (3, Some(3)),
            Function::Lt
            | Function::Le
            | Function::Gt
            | Function::Ge
            | Function::Eq
            | Function::Neq => (2, Some(2)),
            Function::And | Function::Or => (2, None),
            _ => (1, Some(1)),
        }
    }

    /// True for the relational functions comparing exactly two operands.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Function::Lt | Function::Le | Function::Gt | Function::Ge | Function::Eq | Function::Neq
        )
    }

    /// True for functions whose value is a boolean (0 or 1).
    pub fn is_logical(self) -> bool {
        self.is_comparison() || matches!(self, Function::And | Function::Or | Function::Not)
    }

    /// Evaluates the function on already evaluated arguments.
    pub fn apply(self, args: &[f64]) -> f64 {
        let a = args.first().copied().unwrap_or(f64::NAN);
        let b = args.get(1).copied().unwrap_or(f64::NAN);

        match self {
            Function::Exp => a.exp(),
            Function::Ln => a.ln(),
            Function::Log10 => a.log10(),
            Function::Sqrt => a.sqrt(),
            Function::Abs => a.abs(),
            Function::Sign => {
                if a > 0.0 {
                    1.0
                } else if a < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }
            Function::Floor => a.floor(),
            Function::Ceil => a.ceil(),
            Function::Sin => a.sin(),
            Function::Cos => a.cos(),
            Function::Tan => a.tan(),
            Function::Asin => a.asin(),
            Function::Acos => a.acos(),
            Function::Atan => a.atan(),
            Function::Sinh => a.sinh(),
            Function::Cosh => a.cosh(),
            Function::Tanh => a.tanh(),
            Function::Min => args.iter().copied().fold(f64::INFINITY, f64::min),
            Function::Max => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Function::If => {
                if a != 0.0 {
                    b
                } else {
                    args.get(2).copied().unwrap_or(f64::NAN)
                }
            }
            Function::Lt => truth(a < b),
            Function::Le => truth(a <= b),
            Function::Gt => truth(a > b),
            Function::Ge => truth(a >= b),
            Function::Eq => truth(a == b),
            Function::Neq => truth(a != b),
            Function::And => truth(args.iter().all(|v| *v != 0.0)),
            Function::Or => truth(args.iter().any(|v| *v != 0.0)),
            Function::Not => truth(a == 0.0),
        }
    }
}

fn truth(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

/// Expression tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Var(usize),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

impl Expr {
    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    /// Evaluates the tree, reading variable slots through `var`.
    pub fn eval<F>(&self, var: &F) -> f64
    where
        F: Fn(usize) -> f64,
    {
        match self {
            Expr::Num(v) => *v,
            Expr::Var(slot) => var(*slot),
            Expr::Neg(inner) => -inner.eval(var),
            Expr::Binary(op, lhs, rhs) => op.apply(lhs.eval(var), rhs.eval(var)),
            Expr::Call(Function::If, args) if args.len() == 3 => {
                // only the selected branch is evaluated
                if args[0].eval(var) != 0.0 {
                    args[1].eval(var)
                } else {
                    args[2].eval(var)
                }
            }
            Expr::Call(function, args) => {
                let values: Vec<f64> = args.iter().map(|a| a.eval(var)).collect();
                function.apply(&values)
            }
        }
    }

    /// Returns the value if the tree is a plain number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Expr::Num(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Expr::Num(v) if *v == 0.0)
    }

    /// Collects all variable slots used anywhere in the tree.
    pub fn collect_slots(&self, out: &mut BTreeSet<usize>) {
        match self {
            Expr::Num(_) => {}
            Expr::Var(slot) => {
                out.insert(*slot);
            }
            Expr::Neg(inner) => inner.collect_slots(out),
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_slots(out);
                rhs.collect_slots(out);
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.collect_slots(out)),
        }
    }

    pub fn uses_slot(&self, slot: usize) -> bool {
        match self {
            Expr::Num(_) => false,
            Expr::Var(s) => *s == slot,
            Expr::Neg(inner) => inner.uses_slot(slot),
            Expr::Binary(_, lhs, rhs) => lhs.uses_slot(slot) || rhs.uses_slot(slot),
            Expr::Call(_, args) => args.iter().any(|a| a.uses_slot(slot)),
        }
    }

    /// Operands compared against time in the logical part of the tree.
    ///
    /// Walks `and`/`or`/`not` and returns, for every comparison with one side being
    /// exactly a time slot, the other side. These are candidate switch time points.
    pub fn time_comparison_operands<'a, P>(&'a self, is_time: &P) -> Vec<&'a Expr>
    where
        P: Fn(usize) -> bool,
    {
        let mut operands = Vec::new();
        self.push_time_operands(is_time, &mut operands);
        operands
    }

    fn push_time_operands<'a, P>(&'a self, is_time: &P, out: &mut Vec<&'a Expr>)
    where
        P: Fn(usize) -> bool,
    {
        if let Expr::Call(function, args) = self {
            if function.is_comparison() && args.len() == 2 {
                match (&args[0], &args[1]) {
                    (Expr::Var(s), other) if is_time(*s) => out.push(other),
                    (other, Expr::Var(s)) if is_time(*s) => out.push(other),
                    _ => {}
                }
            } else if matches!(function, Function::And | Function::Or | Function::Not) {
                args.iter().for_each(|a| a.push_time_operands(is_time, out));
            }
        }
    }

    /// Renders the tree as equation text using `names` for the slots.
    pub fn to_equation(&self, names: &[String]) -> String {
        let mut out = String::new();
        self.write_equation(names, 0, &mut out);
        out
    }

    fn write_equation(&self, names: &[String], parent_precedence: u8, out: &mut String) {
        match self {
            Expr::Num(v) => {
                if *v < 0.0 {
                    let _ = write!(out, "({})", v);
                } else {
                    let _ = write!(out, "{}", v);
                }
            }
            Expr::Var(slot) => match names.get(*slot) {
                Some(name) => out.push_str(name),
                None => {
                    let _ = write!(out, "#{}", slot);
                }
            },
            Expr::Neg(inner) => {
                out.push_str("(-");
                inner.write_equation(names, 4, out);
                out.push(')');
            }
            Expr::Binary(op, lhs, rhs) => {
                let precedence = op.precedence();
                let bracket = precedence < parent_precedence;
                if bracket {
                    out.push('(');
                }
                // the non-associative side gets the tighter binding
                let (left, right) = match op {
                    BinaryOp::Pow => (precedence + 1, precedence),
                    _ => (precedence, precedence + 1),
                };
                lhs.write_equation(names, left, out);
                out.push_str(op.symbol());
                rhs.write_equation(names, right, out);
                if bracket {
                    out.push(')');
                }
            }
            Expr::Call(function, args) => {
                out.push_str(function.name());
                out.push('(');
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    arg.write_equation(names, 0, out);
                }
                out.push(')');
            }
        }
    }
}
