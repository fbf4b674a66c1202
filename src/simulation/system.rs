//! DE System Module
//!
//! This module exposes a finalized model to the integrator.
//!
//! # Key Components
//!
//! - [`DeSystem`]: implements [`ODEProblem`] over the scaled state vector, optionally
//!   extended by forward sensitivity equations
//! - Dense and banded Jacobians of the right-hand side
//!
//! The solver state holds `value / scale_factor` for every species, so equation `i` reads
//! `du_i/dt = (sum of right-hand-side summands) / s_i`. With `m` sensitivity parameters
//! the state is extended by `m` blocks of `n` entries; block `k` holds `du/dp_k` and
//! follows `dS/dt = J S + df/dp`.

use std::cell::RefCell;

use nalgebra::DMatrix;
use peroxide::fuga::ODEProblem;

use crate::bandwidth::BandMatrix;
use crate::formula::{FormulaIdx, JacobianSink, StateView};
use crate::model::Model;
use crate::quantity::QuantityIdx;

/// Right-hand side of a finalized model.
#[derive(Debug)]
pub struct DeSystem<'a> {
    model: &'a Model,
    equations: Vec<Equation>,
    sensitivity_parameters: &'a [QuantityIdx],
    warnings: RefCell<Vec<(f64, String)>>,
}

#[derive(Debug, Clone)]
struct Equation {
    path: String,
    rhs: Vec<FormulaIdx>,
    scale: f64,
}

impl<'a> DeSystem<'a> {
    /// Builds the system from the species of the DE system in ODE index order.
    pub fn new(model: &'a Model, sensitivity_parameters: &'a [QuantityIdx]) -> Self {
        let equations = model
            .de_species()
            .into_iter()
            .map(|q| {
                let quantity = model.quantity(q);
                Equation {
                    path: quantity.path.clone(),
                    rhs: quantity.species().map(|s| s.rhs.clone()).unwrap_or_default(),
                    scale: quantity.scale_factor(),
                }
            })
            .collect();

        Self {
            model,
            equations,
            sensitivity_parameters,
            warnings: RefCell::new(Vec::new()),
        }
    }

    /// Number of species equations.
    pub fn size(&self) -> usize {
        self.equations.len()
    }

    /// Length of the full state including sensitivity blocks.
    pub fn state_len(&self) -> usize {
        self.size() * (1 + self.sensitivity_parameters.len())
    }

    /// Derivatives of the species equations only.
    pub fn species_rhs(&self, time: f64, y: &[f64], dy: &mut [f64]) {
        let view = StateView::scaled(&y[..self.size()], time);

        for (i, equation) in self.equations.iter().enumerate() {
            let sum: f64 = equation
                .rhs
                .iter()
                .map(|f| self.model.formula(*f).compute(self.model, &view))
                .sum();
            dy[i] = sum / equation.scale;

            if !dy[i].is_finite() {
                self.warnings.borrow_mut().push((
                    time,
                    format!("Derivative of {} is not finite ({})", equation.path, dy[i]),
                ));
            }
        }
    }

    /// Adds the Jacobian of the species equations at `(time, y)` to `sink`.
    pub fn jacobian_into(&self, time: f64, y: &[f64], sink: &mut dyn JacobianSink) {
        let view = StateView::scaled(&y[..self.size()], time);

        for (row, equation) in self.equations.iter().enumerate() {
            let prefactor = 1.0 / equation.scale;
            for f in &equation.rhs {
                self.model
                    .formula(*f)
                    .jacobian(self.model, &view, row, prefactor, sink);
            }
        }
    }

    pub fn dense_jacobian(&self, time: f64, y: &[f64]) -> DMatrix<f64> {
        let n = self.size();
        let mut jacobian = DMatrix::zeros(n, n);
        self.jacobian_into(time, y, &mut jacobian);
        jacobian
    }

    /// Jacobian in band storage with the given half-bandwidths.
    pub fn band_jacobian(&self, time: f64, y: &[f64], lower: usize, upper: usize) -> BandMatrix {
        let mut jacobian = BandMatrix::zeros(self.size(), lower, upper);
        self.jacobian_into(time, y, &mut jacobian);
        jacobian
    }

    /// Warnings collected since the last call, with the time they occurred at.
    pub fn take_warnings(&self) -> Vec<(f64, String)> {
        std::mem::take(&mut *self.warnings.borrow_mut())
    }
}

impl ODEProblem for DeSystem<'_> {
    fn rhs(&self, t: f64, y: &[f64], dy: &mut [f64]) -> anyhow::Result<()> {
        let n = self.size();
        self.species_rhs(t, y, dy);

        let m = self.sensitivity_parameters.len();
        if m == 0 {
            return Ok(());
        }

        let mut sink = SensitivitySink::new(n, self.sensitivity_parameters);
        self.jacobian_into(t, y, &mut sink);

        for k in 0..m {
            let block = n + k * n;
            let s = &y[block..block + n];
            for i in 0..n {
                let js: f64 = (0..n).map(|j| sink.states[(i, j)] * s[j]).sum();
                dy[block + i] = js + sink.parameters[(i, k)];
            }
        }

        Ok(())
    }
}

/// Collects the state Jacobian and the parameter derivatives in one pass.
struct SensitivitySink<'a> {
    states: DMatrix<f64>,
    parameters: DMatrix<f64>,
    columns: &'a [QuantityIdx],
}

impl<'a> SensitivitySink<'a> {
    fn new(n: usize, columns: &'a [QuantityIdx]) -> Self {
        Self {
            states: DMatrix::zeros(n, n),
            parameters: DMatrix::zeros(n, columns.len()),
            columns,
        }
    }
}

impl JacobianSink for SensitivitySink<'_> {
    fn add_state(&mut self, row: usize, column: usize, value: f64) {
        self.states[(row, column)] += value;
    }

    fn parameter_column(&self, quantity: QuantityIdx) -> Option<usize> {
        self.columns.iter().position(|q| *q == quantity)
    }

    fn add_parameter(&mut self, row: usize, column: usize, value: f64) {
        self.parameters[(row, column)] += value;
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::model::tests::{explicit, parameter, species};
    use crate::quantity::{ParameterInfo, SpeciesInfo};
    use crate::simulation::Simulation;

    /// `A -> B` with rate `k * A`, `B` scaled by 10.
    fn conversion() -> Simulation {
        let mut model = Model::new();
        let k = parameter(&mut model, 1, 0.5);
        let a = species(&mut model, 2, 4.0, vec![]);
        let b = species(&mut model, 3, 0.0, vec![]);
        let loss = explicit(&mut model, 10, "-k * A", &[("k", Some(k)), ("A", Some(a))]);
        let gain = explicit(&mut model, 11, "k * A", &[("k", Some(k)), ("A", Some(a))]);
        for (q, f) in [(a, loss), (b, gain)] {
            let data = model.quantity_mut(q).species_mut().unwrap();
            data.rhs = vec![f];
            data.original_rhs = vec![f];
        }

        let mut simulation = Simulation::default();
        simulation.load(model).unwrap();
        simulation
            .set_variable_parameters(&[ParameterInfo::new(1, 0.5).with_sensitivity()])
            .unwrap();
        simulation
            .set_variable_species(&[SpeciesInfo::new(3, 0.0, 10.0)])
            .unwrap();
        simulation.finalize().unwrap();
        simulation
            .set_species_properties(&[SpeciesInfo::new(3, 0.0, 10.0)])
            .unwrap();
        simulation
    }

    #[test]
    fn test_rhs_divides_by_scale() {
        let simulation = conversion();
        let system = DeSystem::new(simulation.model(), simulation.sensitivity_parameters());
        assert_eq!(system.size(), 2);
        assert_eq!(system.state_len(), 4);

        let y = [4.0, 0.0, 0.0, 0.0];
        let mut dy = [0.0; 4];
        system.rhs(0.0, &y, &mut dy).unwrap();

        assert_relative_eq!(dy[0], -2.0);
        assert_relative_eq!(dy[1], 0.2);
        // dS/dt = df/dk at S = 0: -A and A / 10
        assert_relative_eq!(dy[2], -4.0);
        assert_relative_eq!(dy[3], 0.4);
    }

    #[test]
    fn test_jacobian_matches_finite_differences() {
        let simulation = conversion();
        let system = DeSystem::new(simulation.model(), simulation.sensitivity_parameters());

        let y = [3.0, 0.7];
        let jacobian = system.dense_jacobian(0.0, &y);

        let h = 1e-6;
        for j in 0..2 {
            let mut plus = y;
            let mut minus = y;
            plus[j] += h;
            minus[j] -= h;
            let (mut f_plus, mut f_minus) = ([0.0; 2], [0.0; 2]);
            system.species_rhs(0.0, &plus, &mut f_plus);
            system.species_rhs(0.0, &minus, &mut f_minus);
            for i in 0..2 {
                let fd = (f_plus[i] - f_minus[i]) / (2.0 * h);
                assert_relative_eq!(jacobian[(i, j)], fd, epsilon = 1e-6);
            }
        }

        let band = system.band_jacobian(0.0, &y, 1, 1).to_dense();
        for i in 0..2 {
            for j in 0..2 {
                assert_relative_eq!(band[(i, j)], jacobian[(i, j)]);
            }
        }
    }

    #[test]
    fn test_non_finite_derivatives_are_reported() {
        let mut model = Model::new();
        let a = species(&mut model, 1, 1.0, vec![]);
        let f = explicit(&mut model, 10, "1 / (A - 1)", &[("A", Some(a))]);
        let data = model.quantity_mut(a).species_mut().unwrap();
        data.rhs = vec![f];
        data.original_rhs = vec![f];

        let mut simulation = Simulation::default();
        simulation.load(model).unwrap();
        simulation.finalize().unwrap();

        let system = DeSystem::new(simulation.model(), &[]);
        let mut dy = [0.0];
        system.rhs(2.5, &[1.0], &mut dy).unwrap();

        let warnings = system.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].0, 2.5);
        assert!(warnings[0].1.starts_with("Derivative of Organism|S1"));
        assert!(system.take_warnings().is_empty());
    }
}
