//! Simulation results: time series of species, observers and parameter sensitivities.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::formula::StateView;
use crate::model::Model;
use crate::quantity::{QuantityIdx, QuantityKind};

/// Time series of one quantity.
///
/// Quantities that stay constant during the run store a single value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantitySeries {
    pub id: u64,
    pub path: String,
    pub kind: String,
    pub values: Vec<f64>,
}

impl QuantitySeries {
    pub fn is_constant(&self) -> bool {
        self.values.len() == 1
    }

    /// Value at output point `index`, the single value for constant quantities.
    pub fn value_at(&self, index: usize) -> Option<f64> {
        if self.is_constant() {
            self.values.first().copied()
        } else {
            self.values.get(index).copied()
        }
    }
}

/// Sensitivity of a species with respect to a parameter, in real units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivitySeries {
    pub quantity_path: String,
    pub parameter_path: String,
    pub values: Vec<f64>,
}

/// Output of a successful run.
///
/// # Fields
///
/// * `time` - Saved output times, starting with the start time
/// * `quantities` - Series of persistable species and of all observers
/// * `sensitivities` - Series per DE species and sensitivity parameter
/// * `tolerance_was_reduced` - Whether the run needed tightened tolerances
/// * `abs_tol`, `rel_tol` - Tolerances of the successful attempt
/// * `warnings` - Solver warnings collected when `stop_on_warnings` is off
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub time: Vec<f64>,
    pub quantities: Vec<QuantitySeries>,
    pub sensitivities: Vec<SensitivitySeries>,
    pub tolerance_was_reduced: bool,
    pub abs_tol: f64,
    pub rel_tol: f64,
    pub warnings: Vec<String>,
}

impl SimulationResult {
    pub fn quantity(&self, path: &str) -> Option<&QuantitySeries> {
        self.quantities.iter().find(|q| q.path == path)
    }

    pub fn values(&self, path: &str) -> Option<&[f64]> {
        self.quantity(path).map(|q| q.values.as_slice())
    }

    pub fn sensitivity(&self, quantity_path: &str, parameter_path: &str) -> Option<&[f64]> {
        self.sensitivities
            .iter()
            .find(|s| s.quantity_path == quantity_path && s.parameter_path == parameter_path)
            .map(|s| s.values.as_slice())
    }

    pub fn to_json(&self) -> Result<String, ModelError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

/// Where a recorded series takes its values from.
#[derive(Debug, Clone, Copy)]
enum Source {
    State { index: usize, scale: f64 },
    Constant,
    Observer(QuantityIdx),
}

/// Collects the series of one run attempt.
#[derive(Debug)]
pub(crate) struct ResultRecorder {
    sources: Vec<Source>,
    result: SimulationResult,
    size: usize,
    sensitivity_scales: Vec<f64>,
    abs_tol: f64,
}

impl ResultRecorder {
    /// Plans the series of persistable species, observers and sensitivities.
    ///
    /// # Arguments
    ///
    /// * `model` - Finalized model
    /// * `sensitivity_parameters` - Parameters with sensitivity equations
    /// * `abs_tol` - Absolute tolerance; saved values in `(-abs_tol, 0)` are stored as 0
    pub(crate) fn new(model: &Model, sensitivity_parameters: &[QuantityIdx], abs_tol: f64) -> Self {
        let mut sources = Vec::new();
        let mut result = SimulationResult {
            abs_tol,
            ..Default::default()
        };

        for q in model.quantity_indices() {
            let quantity = model.quantity(q);
            if !quantity.is_persistable {
                continue;
            }
            let source = if quantity.is_observer() {
                Source::Observer(q)
            } else if let Some(index) = quantity.ode_index() {
                Source::State {
                    index,
                    scale: quantity.scale_factor(),
                }
            } else if quantity.is_species() {
                Source::Constant
            } else {
                continue;
            };

            let values = match source {
                Source::Constant => {
                    vec![model.quantity_value(q, &StateView::scaled(&[], 0.0))]
                }
                _ => Vec::new(),
            };
            sources.push(source);
            result.quantities.push(QuantitySeries {
                id: quantity.id,
                path: quantity.path.clone(),
                kind: quantity.kind_name().to_string(),
                values,
            });
        }

        let de_species = model.de_species();
        let sensitivity_scales = de_species
            .iter()
            .map(|q| model.quantity(*q).scale_factor())
            .collect();
        for p in sensitivity_parameters {
            for q in &de_species {
                result.sensitivities.push(SensitivitySeries {
                    quantity_path: model.quantity(*q).path.clone(),
                    parameter_path: model.quantity(*p).path.clone(),
                    values: Vec::new(),
                });
            }
        }

        Self {
            sources,
            result,
            size: de_species.len(),
            sensitivity_scales,
            abs_tol,
        }
    }

    /// Saves the solution at `time`.
    ///
    /// Observers are computed for all first and committed afterwards, so an observer
    /// reading another observer sees the value of the previous output point.
    pub(crate) fn record(&mut self, model: &mut Model, y: &[f64], time: f64) {
        let n = self.size;
        let states = &y[..n];
        self.result.time.push(time);

        let view = StateView::scaled(states, time);
        let mut observers = Vec::new();
        for (source, series) in self.sources.iter().zip(self.result.quantities.iter_mut()) {
            match *source {
                Source::State { index, scale } => {
                    let stored = clamp_tiny_negative(states[index], self.abs_tol);
                    series.values.push(stored * scale);
                }
                Source::Observer(q) => {
                    let value = model.definition_value(&model.quantity(q).definition, &view);
                    series.values.push(value);
                    observers.push((q, value));
                }
                Source::Constant => {}
            }
        }

        for (q, value) in observers {
            if let QuantityKind::Observer(data) = &mut model.quantity_mut(q).kind {
                data.last_value = value;
            }
        }
        for q in model.de_species() {
            if let Some(i) = model.quantity(q).ode_index() {
                let scale = model.quantity(q).scale_factor();
                if let Some(species) = model.quantity_mut(q).species_mut() {
                    species.latest_value = states[i] * scale;
                }
            }
        }

        for (k, series) in self.result.sensitivities.iter_mut().enumerate() {
            let parameter = k / n.max(1);
            let i = k % n.max(1);
            let value = y.get(n + parameter * n + i).copied().unwrap_or(f64::NAN);
            series.values.push(value * self.sensitivity_scales[i]);
        }
    }

    pub(crate) fn finish(
        mut self,
        rel_tol: f64,
        tolerance_was_reduced: bool,
        warnings: Vec<String>,
    ) -> SimulationResult {
        self.result.rel_tol = rel_tol;
        self.result.tolerance_was_reduced = tolerance_was_reduced;
        self.result.warnings = warnings;
        self.result
    }
}

fn clamp_tiny_negative(value: f64, abs_tol: f64) -> f64 {
    if value < 0.0 && value > -abs_tol {
        0.0
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn result() -> SimulationResult {
        SimulationResult {
            time: vec![0.0, 1.0],
            quantities: vec![
                QuantitySeries {
                    id: 1,
                    path: "Organism|A".into(),
                    kind: "Species".into(),
                    values: vec![1.0, 0.5],
                },
                QuantitySeries {
                    id: 2,
                    path: "Organism|B".into(),
                    kind: "Species".into(),
                    values: vec![3.0],
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_constant_series_repeat_their_value() {
        let result = result();
        let b = result.quantity("Organism|B").unwrap();
        assert!(b.is_constant());
        assert_eq!(b.value_at(1), Some(3.0));
        assert_eq!(result.quantity("Organism|A").unwrap().value_at(1), Some(0.5));
        assert_eq!(result.values("Organism|C"), None);
    }

    #[test]
    fn test_clamp_only_within_tolerance() {
        assert_eq!(clamp_tiny_negative(-1e-12, 1e-10), 0.0);
        assert_eq!(clamp_tiny_negative(-1e-9, 1e-10), -1e-9);
        assert_eq!(clamp_tiny_negative(2.0, 1e-10), 2.0);
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.json");
        let result = result();
        result.save_json(&path).unwrap();

        let loaded: SimulationResult =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, result);
    }
}
