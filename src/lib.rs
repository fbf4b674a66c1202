//! ODE Model Library
//!
//! This library compiles declarative physiological and pharmacokinetic models into ODE
//! systems and runs them, including:
//! - Loading models from JSON documents and validating them against a JSON schema
//! - Leveling quantity dependencies and rejecting circular references
//! - Simplifying formulas and assigning the quantities integrated by the solver
//! - Event switches, table formulas and bandwidth-reduced Jacobians
//! - Forward parameter sensitivities and result export

#![warn(unused_imports)]

/// Commonly used types and functionality re-exported for convenience
pub mod prelude {
    pub use crate::error::{ErrorCategory, ModelError};
    pub use crate::formula::table::TablePoint;
    pub use crate::io::*;
    pub use crate::options::*;
    pub use crate::output::{IntervalDistribution, OutputInterval, OutputSchema};
    pub use crate::quantity::{ParameterInfo, QuantityInfo, SpeciesInfo};
    pub use crate::simulation::result::*;
    pub use crate::simulation::{Simulation, SimulationState};

    pub use peroxide::fuga::{RK4, RK5};
}

/// Error types and their categories
pub mod error;
/// Run options and solver settings
pub mod options;

/// Equation parsing, evaluation and symbolic differentiation
pub mod expression;
/// Formula variants and their evaluation against the solver state
pub mod formula;
/// Symbolic references from formulas to quantities
pub mod reference;
/// Parameters, species and observers
pub mod quantity;
/// The arena owning quantities, formulas and switches
pub mod model;

/// Dependency leveling and cycle detection
pub mod hierarchy;
/// Event switches
pub mod switch;
/// Output schemas and the merged time-point schedule
pub mod output;
/// Bandwidth reduction of the Jacobian
pub mod bandwidth;

/// Lifecycle, finalization and run driver
pub mod simulation;

/// Reading and writing model documents
pub mod io;
/// Tabular display of models and results
pub mod info;
