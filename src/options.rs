//! Options module for configuring model finalization and simulation runs.
//!
//! This module provides two configuration structs, both created through their
//! `derive_builder` builders:
//!
//! - [`SimulationOptions`]: switches that gate behaviours of loading and running
//! - [`SolverSettings`]: tolerances and step control handed to the integration driver
//!
//! Both are serde-serialisable so they can travel inside a model document or a
//! separate options file.

use std::path::PathBuf;

use derive_builder::Builder;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Switches recognised by the loader and the run driver.
///
/// # Fields
///
/// * `show_progress` - Show a progress bar advancing with the output points (default: false)
/// * `execution_time_limit` - Wall clock limit of a run in seconds, 0 means unlimited (default: 0.0)
/// * `stop_on_warnings` - Treat solver warnings as errors (default: true)
/// * `auto_reduce_tolerances` - Retry runs failing with convergence/error-test failures with tighter tolerances (default: true)
/// * `write_log_file` - Append run milestones to `log_file` if one is configured (default: true)
/// * `check_for_negative_values` - Fail if non-negative species become negative (default: true)
/// * `validate_with_schema` - Validate the load source against the model JSON schema (default: false)
/// * `identify_used_parameters` - Mark only parameters reachable from the DE system as used (default: false)
/// * `keep_source_text` - Keep the raw load-source text on the simulation (default: false)
/// * `use_float_comparison_in_user_output_time_points` - Compare user output times in single precision (default: true)
///
/// # Examples
///
/// ```
/// use odemodel::prelude::SimulationOptionsBuilder;
///
/// let options = SimulationOptionsBuilder::default()
///     .stop_on_warnings(false)
///     .execution_time_limit(30.0)
///     .build()
///     .unwrap();
///
/// assert!(options.auto_reduce_tolerances);
/// ```
#[derive(Debug, Clone, Builder, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct SimulationOptions {
    #[builder(default = "false")]
    pub show_progress: bool,
    #[builder(default = "0.0")]
    pub execution_time_limit: f64,
    #[builder(default = "true")]
    pub stop_on_warnings: bool,
    #[builder(default = "true")]
    pub auto_reduce_tolerances: bool,
    #[builder(default = "true")]
    pub write_log_file: bool,
    #[builder(default = "None", setter(into, strip_option))]
    pub log_file: Option<PathBuf>,
    #[builder(default = "true")]
    pub check_for_negative_values: bool,
    #[builder(default = "false")]
    pub validate_with_schema: bool,
    #[builder(default = "false")]
    pub identify_used_parameters: bool,
    #[builder(default = "false")]
    pub keep_source_text: bool,
    #[builder(default = "true")]
    pub use_float_comparison_in_user_output_time_points: bool,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            show_progress: false,
            execution_time_limit: 0.0,
            stop_on_warnings: true,
            auto_reduce_tolerances: true,
            write_log_file: true,
            log_file: None,
            check_for_negative_values: true,
            validate_with_schema: false,
            identify_used_parameters: false,
            keep_source_text: false,
            use_float_comparison_in_user_output_time_points: true,
        }
    }
}

impl SimulationOptions {
    /// Returns the configured time limit, `None` if runs are unlimited.
    pub fn time_limit(&self) -> Option<f64> {
        (self.execution_time_limit > 0.0).then_some(self.execution_time_limit)
    }
}

/// Tolerance and step-size configuration of the integration driver.
///
/// # Fields
///
/// * `abs_tol` - Absolute tolerance (default: 1e-10)
/// * `rel_tol` - Relative tolerance (default: 1e-5)
/// * `max_step` - Largest sub-step taken between two output points (default: 0.01)
/// * `max_steps` - Largest number of sub-steps between two output points (default: 100000)
/// * `use_jacobian` - Whether consumers should request the analytic Jacobian (default: true)
/// * `use_banded_jacobian` - Reorder variables and use banded Jacobian storage (default: false)
/// * `abs_tol_min` - Floor for automatic tolerance reduction (default: 1e-12)
/// * `rel_tol_min` - Floor for automatic tolerance reduction (default: 1e-9)
#[derive(Debug, Clone, Builder, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct SolverSettings {
    #[builder(default = "1e-10")]
    pub abs_tol: f64,
    #[builder(default = "1e-5")]
    pub rel_tol: f64,
    #[builder(default = "0.01")]
    pub max_step: f64,
    #[builder(default = "100_000")]
    pub max_steps: usize,
    #[builder(default = "true")]
    pub use_jacobian: bool,
    #[builder(default = "false")]
    pub use_banded_jacobian: bool,
    #[builder(default = "1e-12")]
    pub abs_tol_min: f64,
    #[builder(default = "1e-9")]
    pub rel_tol_min: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            abs_tol: 1e-10,
            rel_tol: 1e-5,
            max_step: 0.01,
            max_steps: 100_000,
            use_jacobian: true,
            use_banded_jacobian: false,
            abs_tol_min: 1e-12,
            rel_tol_min: 1e-9,
        }
    }
}

impl SolverSettings {
    /// Tightens the tolerances by one order of magnitude.
    ///
    /// Each tolerance above its floor is divided by 10 but never set below the floor.
    /// The sub-step size shrinks by the same factor as the relative tolerance.
    ///
    /// # Returns
    ///
    /// `false` if both tolerances were already at their floor and nothing changed.
    pub fn reduce_tolerances(&mut self) -> bool {
        if self.abs_tol <= self.abs_tol_min && self.rel_tol <= self.rel_tol_min {
            return false;
        }

        if self.abs_tol > self.abs_tol_min {
            self.abs_tol = reduced_tolerance(self.abs_tol, self.abs_tol_min);
        }

        if self.rel_tol > self.rel_tol_min {
            let reduced = reduced_tolerance(self.rel_tol, self.rel_tol_min);
            self.max_step *= reduced / self.rel_tol;
            self.rel_tol = reduced;
        }

        true
    }
}

/// One order of magnitude below `value`, snapped to `floor` when within rounding distance.
fn reduced_tolerance(value: f64, floor: f64) -> f64 {
    let reduced = value / 10.0;
    if reduced <= floor * (1.0 + 1e-6) {
        floor
    } else {
        reduced
    }
}
