//! Error Module
//!
//! This module provides the single error type used across model loading, finalization
//! and simulation runs.
//!
//! # Categories
//!
//! Every [`ModelError`] belongs to one [`ErrorCategory`]:
//! - `Structural`: broken references, missing nodes, both/neither of value and formula
//! - `Semantic`: cycles, invalid tables, out-of-order calls, varying fixed quantities
//! - `Numeric`: negative values, integrator failures, time limits
//!
//! Only convergence and error-test failures of the integrator are retryable
//! (see [`ModelError::is_retryable`]); everything else aborts the current operation.

use std::fmt;

use thiserror::Error;

/// Coarse classification of a [`ModelError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Structural,
    Semantic,
    Numeric,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Structural => write!(f, "structural"),
            ErrorCategory::Semantic => write!(f, "semantic"),
            ErrorCategory::Numeric => write!(f, "numeric"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ModelError {
    // ---- structural
    #[error("{node} references unknown object id {id}")]
    UnresolvedReference { node: String, id: u64 },
    #[error("Object with id {id} is defined more than once ({kind})")]
    DuplicateId { kind: &'static str, id: u64 },
    #[error("{path} has both formula and value attributes")]
    ValueAndFormula { path: String },
    #[error("{path} has neither a formula nor a value")]
    NoValueOrFormula { path: String },
    #[error("Formula {formula_id}: alias '{alias}' is not declared")]
    UnknownAlias { formula_id: u64, alias: String },
    #[error("Formula {formula_id}: cannot parse '{equation}': {message}")]
    Parse {
        formula_id: u64,
        equation: String,
        message: String,
    },
    #[error("Load source does not match the model schema:\n{}", .0.join("\n"))]
    SchemaValidation(Vec<String>),
    #[error("Invalid indices permutation: {0}")]
    InvalidPermutation(String),
    #[error("{path}: {message}")]
    IndexMismatch { path: String, message: String },
    #[error("File error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    // ---- semantic
    #[error("Cyclic dependencies found for {path}")]
    CyclicDependency { path: String },
    #[error("Table formula {formula_id}: {message}")]
    InvalidTable { formula_id: u64, message: String },
    #[error("Formula {formula_id} references nontable object {path}")]
    NonTableReference { formula_id: u64, path: String },
    #[error("{kind} {path} is fixed and cannot be varied")]
    FixedQuantity { kind: &'static str, path: String },
    #[error("Parameter {path} cannot be varied")]
    NotVariable { path: String },
    #[error("{message}")]
    InvalidState {
        operation: &'static str,
        message: String,
    },
    #[error("Scale factor of {path} must be positive (got {value})")]
    InvalidScaleFactor { path: String, value: f64 },
    #[error("Output schema: {0}")]
    InvalidOutputSchema(String),
    #[error("Time points output schema is empty")]
    EmptyOutputSchema,
    #[error("Switch {switch_id}: {message}")]
    InvalidSwitchTarget { switch_id: u64, message: String },

    // ---- numeric
    #[error("Initial value of {path} was not set")]
    InitialValueNotSet { path: String },
    #[error("Initial value of {path} is negative, but it was marked as positive")]
    NegativeInitialValue { path: String },
    #[error(
        "The following variables became negative at time {time}:\n{}\n\
         Try to reduce the solver tolerances by an order of magnitude. \
         If the problem persists, check whether the variables were wrongly defined \
         as non-negative, or whether the model contains sign errors.",
        .variables.join("\n")
    )]
    NegativeValues { time: f64, variables: Vec<String> },
    #[error("Convergence failure at time {time}: {message}")]
    ConvergenceFailure { time: f64, message: String },
    #[error("Error test failure at time {time}: {message}")]
    ErrorTestFailure { time: f64, message: String },
    #[error("Solver warning at time {time}: {message}")]
    SolverWarning { time: f64, message: String },
    #[error("Simulation execution time limit exceeded ({limit} s)")]
    TimeLimitExceeded { limit: f64 },
    #[error("Simulation was cancelled at time {time}")]
    Cancelled { time: f64 },
}

impl ModelError {
    /// Category of the error as used by callers to decide how to report it.
    pub fn category(&self) -> ErrorCategory {
        use ModelError::*;

        match self {
            UnresolvedReference { .. }
            | DuplicateId { .. }
            | ValueAndFormula { .. }
            | NoValueOrFormula { .. }
            | UnknownAlias { .. }
            | Parse { .. }
            | SchemaValidation(_)
            | InvalidPermutation(_)
            | IndexMismatch { .. }
            | Io(_)
            | Json(_) => ErrorCategory::Structural,

            CyclicDependency { .. }
            | InvalidTable { .. }
            | NonTableReference { .. }
            | FixedQuantity { .. }
            | NotVariable { .. }
            | InvalidState { .. }
            | InvalidScaleFactor { .. }
            | InvalidOutputSchema(_)
            | EmptyOutputSchema
            | InvalidSwitchTarget { .. } => ErrorCategory::Semantic,

            InitialValueNotSet { .. }
            | NegativeInitialValue { .. }
            | NegativeValues { .. }
            | ConvergenceFailure { .. }
            | ErrorTestFailure { .. }
            | SolverWarning { .. }
            | TimeLimitExceeded { .. }
            | Cancelled { .. } => ErrorCategory::Numeric,
        }
    }

    /// Name of the operation that raised the error.
    pub fn source_name(&self) -> &'static str {
        use ModelError::*;

        match self {
            UnresolvedReference { .. } | DuplicateId { .. } | UnknownAlias { .. } => {
                "Simulation::load"
            }
            ValueAndFormula { .. } | NoValueOrFormula { .. } => "Quantity::load",
            Parse { .. } => "ExplicitFormula::parse",
            SchemaValidation(_) | Io(_) | Json(_) => "io::load",
            InvalidPermutation(_) => "Rcm::permutation",
            IndexMismatch { .. } => "Species::remap_rhs_used_variables",
            CyclicDependency { .. } => "Hierarchy::check_cycles",
            InvalidTable { .. } => "TableFormula::cache_values",
            NonTableReference { .. } => "TableFormula::finalize",
            FixedQuantity { .. } | NotVariable { .. } => "Simulation::set_values",
            InvalidState { operation, .. } => *operation,
            InvalidScaleFactor { .. } => "Species::set_scale_factor",
            InvalidOutputSchema(_) => "OutputSchema::time_points",
            EmptyOutputSchema => "OutputTimePoints::merge",
            InvalidSwitchTarget { .. } => "Switch::finalize",
            InitialValueNotSet { .. } | NegativeInitialValue { .. } => {
                "Simulation::de_initial_values"
            }
            NegativeValues { .. } => "Runner::check_negative_values",
            ConvergenceFailure { .. } | ErrorTestFailure { .. } | SolverWarning { .. } => {
                "Runner::advance"
            }
            TimeLimitExceeded { .. } | Cancelled { .. } => "Runner::solve",
        }
    }

    /// True for integrator failures that may succeed with tighter tolerances.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ModelError::ConvergenceFailure { .. } | ModelError::ErrorTestFailure { .. }
        )
    }

    pub(crate) fn invalid_state(operation: &'static str, message: impl Into<String>) -> Self {
        ModelError::InvalidState {
            operation,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_integrator_failures_are_retryable() {
        let conv = ModelError::ConvergenceFailure {
            time: 1.0,
            message: "step failed".into(),
        };
        let test = ModelError::ErrorTestFailure {
            time: 1.0,
            message: "nan".into(),
        };
        let neg = ModelError::NegativeValues {
            time: 1.0,
            variables: vec!["A".into()],
        };

        assert!(conv.is_retryable());
        assert!(test.is_retryable());
        assert!(!neg.is_retryable());
        assert!(!ModelError::EmptyOutputSchema.is_retryable());
    }

    #[test]
    fn test_categories_and_sources() {
        let err = ModelError::CyclicDependency {
            path: "Organism|P1".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Semantic);
        assert_eq!(err.source_name(), "Hierarchy::check_cycles");
        assert_eq!(err.to_string(), "Cyclic dependencies found for Organism|P1");

        let err = ModelError::invalid_state("Simulation::finalize", "already finalized");
        assert_eq!(err.category(), ErrorCategory::Semantic);
        assert_eq!(err.source_name(), "Simulation::finalize");
    }

    #[test]
    fn test_negative_values_message_names_variables() {
        let err = ModelError::NegativeValues {
            time: 2.0,
            variables: vec!["Organism|A".into(), "Organism|B".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("Organism|A"));
        assert!(msg.contains("Organism|B"));
        assert!(msg.contains("reduce the solver tolerances"));
        assert_eq!(err.category(), ErrorCategory::Numeric);
    }
}
