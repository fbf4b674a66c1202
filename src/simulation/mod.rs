//! Simulation Module
//!
//! This module provides [`Simulation`], the orchestrator owning a loaded [`Model`] and
//! driving it through its lifecycle:
//!
//! `Created -> Loaded -> Leveled -> Simplified -> IndexAssigned -> Finalized`
//!
//! # Key Components
//!
//! - [`Simulation::load`]: takes the model built by the loader and checks it for cycles
//! - [`Simulation::finalize`]: turns the model into an executable DE system
//! - [`Simulation::run`]: integrates the system with any `peroxide` integrator
//! - mutators for variable parameters and species, before and after finalization
//!
//! States only move forward. Values changed during a run (by switches or current-run
//! simplification) are reset after every run, so a finalized simulation can be run
//! repeatedly with new parameter values.

pub mod finalize;
pub mod run_log;
pub mod result;
pub mod runner;
pub mod system;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::ModelError;
use crate::formula::table::{Table, TablePoint};
use crate::formula::{Formula, FormulaKind, StateView};
use crate::hierarchy::Hierarchy;
use crate::io::ModelDocument;
use crate::model::Model;
use crate::options::{SimulationOptions, SolverSettings};
use crate::output::OutputSchema;
use crate::quantity::{
    Definition, ParameterInfo, Quantity, QuantityIdx, QuantityInfo, ScaleConsumer, SpeciesInfo,
};
use crate::switch::{mark_switch_usage, simplify_switches, update_switch_scale};

use self::result::SimulationResult;

/// Lifecycle stage of a [`Simulation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SimulationState {
    Created,
    Loaded,
    Leveled,
    Simplified,
    IndexAssigned,
    Finalized,
}

/// Orchestrator of a model: finalization, runs and value mutation.
#[derive(Debug)]
pub struct Simulation {
    pub name: String,
    pub options: SimulationOptions,
    pub solver: SolverSettings,
    pub output_schema: OutputSchema,
    pub start_time: f64,
    pub(crate) model: Model,
    pub(crate) hierarchy: Hierarchy,
    pub(crate) sensitivity_parameters: Vec<QuantityIdx>,
    pub(crate) bandwidths: (usize, usize),
    state: SimulationState,
    source_text: Option<String>,
    document: Option<ModelDocument>,
    cancel: Arc<AtomicBool>,
    result: Option<SimulationResult>,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new(SimulationOptions::default(), SolverSettings::default())
    }
}

impl Simulation {
    pub fn new(options: SimulationOptions, solver: SolverSettings) -> Self {
        Self {
            name: String::new(),
            options,
            solver,
            output_schema: OutputSchema::default(),
            start_time: 0.0,
            model: Model::new(),
            hierarchy: Hierarchy::default(),
            sensitivity_parameters: Vec::new(),
            bandwidths: (0, 0),
            state: SimulationState::Created,
            source_text: None,
            document: None,
            cancel: Arc::new(AtomicBool::new(false)),
            result: None,
        }
    }

    /// Takes ownership of a fully resolved model.
    ///
    /// Levels the quantities once with a cycle check, so later re-leveling can skip it.
    ///
    /// # Returns
    ///
    /// Returns [`ModelError::CyclicDependency`] naming a quantity on a cycle, or an
    /// invalid-state error if a model was already loaded.
    pub fn load(&mut self, mut model: Model) -> Result<(), ModelError> {
        if self.state != SimulationState::Created {
            return Err(ModelError::invalid_state(
                "Simulation::load",
                "Simulation was already loaded",
            ));
        }

        self.hierarchy = Hierarchy::build(&mut model, true)?;
        mark_switch_usage(&mut model);
        self.model = model;
        self.state = SimulationState::Loaded;

        log::info!(
            "Loaded model with {} quantities, {} formulas and {} switches",
            self.model.quantities().len(),
            self.model.formulas().len(),
            self.model.switches().len()
        );
        Ok(())
    }

    pub fn state(&self) -> SimulationState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SimulationState) {
        self.state = state;
    }

    pub fn is_finalized(&self) -> bool {
        self.state == SimulationState::Finalized
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Raw load-source text, kept if `keep_source_text` was set.
    pub fn source_text(&self) -> Option<&str> {
        self.source_text.as_deref()
    }

    pub(crate) fn set_source_text(&mut self, text: String) {
        if self.options.keep_source_text {
            self.source_text = Some(text);
        }
    }

    /// Document the simulation was loaded from.
    pub fn document(&self) -> Option<&ModelDocument> {
        self.document.as_ref()
    }

    pub(crate) fn set_document(&mut self, document: ModelDocument) {
        self.document = Some(document);
    }

    /// Lower and upper half-bandwidth of the Jacobian after finalization.
    pub fn bandwidths(&self) -> (usize, usize) {
        self.bandwidths
    }

    /// Number of equations of the DE system.
    pub fn de_size(&self) -> usize {
        self.model.de_species().len()
    }

    /// Parameters for which sensitivities are computed.
    pub fn sensitivity_parameters(&self) -> &[QuantityIdx] {
        &self.sensitivity_parameters
    }

    /// Flag polled by a running simulation; setting it cancels the run.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub(crate) fn cancel_flag(&self) -> &AtomicBool {
        &self.cancel
    }

    /// Result of the latest successful run.
    pub fn result(&self) -> Option<&SimulationResult> {
        self.result.as_ref()
    }

    pub(crate) fn set_result(&mut self, result: SimulationResult) {
        self.result = Some(result);
    }

    pub fn quantity_infos(&self) -> Vec<QuantityInfo> {
        self.model.quantities().iter().map(QuantityInfo::from).collect()
    }

    /// Snapshots of all parameters.
    pub fn parameter_infos(&self) -> Vec<ParameterInfo> {
        self.model
            .quantities()
            .iter()
            .filter_map(|q| {
                let parameter = q.parameter()?;
                let table_points = q
                    .definition
                    .formula()
                    .and_then(|f| self.model.formula(f).table())
                    .map(|t| t.points().to_vec());
                Some(ParameterInfo {
                    id: q.id,
                    path: q.path.clone(),
                    value: q.definition.value().unwrap_or(f64::NAN),
                    table_points,
                    calculate_sensitivity: parameter.calculate_sensitivity,
                    can_be_varied: parameter.can_be_varied,
                    is_used: q.is_used,
                })
            })
            .collect()
    }

    /// Snapshots of all species.
    pub fn species_infos(&self) -> Vec<SpeciesInfo> {
        self.model
            .quantities()
            .iter()
            .filter_map(|q| {
                let species = q.species()?;
                Some(SpeciesInfo {
                    id: q.id,
                    path: q.path.clone(),
                    value: q.definition.value().unwrap_or(f64::NAN),
                    scale_factor: species.scale_factor,
                    negative_values_allowed: species.negative_values_allowed,
                })
            })
            .collect()
    }

    /// Marks parameters as variable across runs, optionally with sensitivities.
    ///
    /// Only allowed before finalization.
    pub fn set_variable_parameters(&mut self, parameters: &[ParameterInfo]) -> Result<(), ModelError> {
        if self.is_finalized() {
            return Err(ModelError::invalid_state(
                "Simulation::set_variable_parameters",
                "Cannot set parameter properties: simulation already finalized",
            ));
        }

        for info in parameters {
            let idx = self.lookup(info.id, "set_variable_parameters")?;
            let quantity = self.model.quantity_mut(idx);
            let path = quantity.path.clone();
            let parameter = quantity
                .parameter_mut()
                .ok_or_else(|| ModelError::NotVariable { path: path.clone() })?;
            if !parameter.can_be_varied {
                return Err(ModelError::NotVariable { path });
            }
            parameter.calculate_sensitivity = info.calculate_sensitivity;
            quantity.is_fixed = false;
        }
        Ok(())
    }

    /// Marks species initial values as variable across runs.
    ///
    /// Only allowed before finalization.
    pub fn set_variable_species(&mut self, species: &[SpeciesInfo]) -> Result<(), ModelError> {
        if self.is_finalized() {
            return Err(ModelError::invalid_state(
                "Simulation::set_variable_species",
                "Cannot set DE variable properties: simulation already finalized",
            ));
        }

        for info in species {
            let idx = self.lookup(info.id, "set_variable_species")?;
            let quantity = self.model.quantity_mut(idx);
            if !quantity.is_species() {
                return Err(ModelError::invalid_state(
                    "Simulation::set_variable_species",
                    format!("{} is not a species", quantity.path),
                ));
            }
            quantity.is_fixed = false;
        }
        Ok(())
    }

    /// Sets parameter values (or table points) for the next run.
    ///
    /// Only allowed after finalization and only for parameters marked variable.
    pub fn set_parameter_values(&mut self, parameters: &[ParameterInfo]) -> Result<(), ModelError> {
        if !self.is_finalized() {
            return Err(ModelError::invalid_state(
                "Simulation::set_parameter_values",
                "Cannot set parameter values: simulation is not finalized",
            ));
        }

        for info in parameters {
            let idx = self.lookup(info.id, "set_parameter_values")?;
            let quantity = self.model.quantity(idx);
            if !quantity.is_parameter() || quantity.is_fixed {
                return Err(ModelError::FixedQuantity {
                    kind: quantity.kind_name(),
                    path: quantity.path.clone(),
                });
            }

            match &info.table_points {
                Some(points) => self.set_table_points(idx, points.clone())?,
                None => self.model.quantity_mut(idx).set_initial_value(info.value),
            }
        }
        Ok(())
    }

    /// Sets species initial values and scale factors for the next run.
    ///
    /// Only allowed after finalization and only for species marked variable.
    pub fn set_species_properties(&mut self, species: &[SpeciesInfo]) -> Result<(), ModelError> {
        if !self.is_finalized() {
            return Err(ModelError::invalid_state(
                "Simulation::set_species_properties",
                "Cannot set DE variable properties: simulation is not finalized",
            ));
        }

        for info in species {
            let idx = self.lookup(info.id, "set_species_properties")?;
            let quantity = self.model.quantity(idx);
            if !quantity.is_species() || quantity.is_fixed {
                return Err(ModelError::FixedQuantity {
                    kind: quantity.kind_name(),
                    path: quantity.path.clone(),
                });
            }
            if !(info.scale_factor > 0.0) {
                return Err(ModelError::InvalidScaleFactor {
                    path: quantity.path.clone(),
                    value: info.scale_factor,
                });
            }

            self.model.quantity_mut(idx).set_initial_value(info.value);
            self.set_scale_factor(idx, info.scale_factor);
        }
        Ok(())
    }

    /// Replaces the scale factor of a species and updates every cached copy.
    fn set_scale_factor(&mut self, idx: QuantityIdx, scale: f64) {
        let consumers = match self.model.quantity_mut(idx).species_mut() {
            Some(species) => {
                species.scale_factor = scale;
                species.scale_consumers.clone()
            }
            None => return,
        };

        for consumer in consumers {
            match consumer {
                ScaleConsumer::Formula(f) => {
                    self.model.formula_mut(f).update_both(|kind| {
                        if let FormulaKind::Explicit(explicit) = kind {
                            explicit.update_scale(idx, scale);
                        }
                    });
                }
                ScaleConsumer::Switch(s) => update_switch_scale(&mut self.model, s, idx, scale),
            }
        }
    }

    /// Replaces the points of a table parameter, turning a value parameter into a table.
    fn set_table_points(&mut self, idx: QuantityIdx, points: Vec<TablePoint>) -> Result<(), ModelError> {
        let table_error = |id: u64, e: crate::formula::table::TableError| ModelError::InvalidTable {
            formula_id: id,
            message: e.to_string(),
        };

        if let Some(f) = self.model.quantity(idx).definition.formula() {
            if self.model.formula(f).table().is_some() {
                let id = self.model.formula(f).id;
                let mut result = Ok(());
                self.model.formula_mut(f).update_both(|kind| {
                    if let FormulaKind::Table(table) = kind {
                        if let Err(e) = table.set_points(points.clone()) {
                            result = Err(table_error(id, e));
                        }
                    }
                });
                return result;
            }
        }

        let id = self.model.next_free_id();
        let table = Table::new(points, false).map_err(|e| table_error(id, e))?;
        let f = self
            .model
            .add_formula(Formula::new(id, FormulaKind::Table(table)))?;
        let quantity = self.model.quantity_mut(idx);
        quantity.definition = Definition::Formula(f);
        quantity.original = Definition::Formula(f);
        Ok(())
    }

    fn lookup(&self, id: u64, operation: &str) -> Result<QuantityIdx, ModelError> {
        self.model
            .quantity_by_id(id)
            .ok_or_else(|| ModelError::UnresolvedReference {
                node: operation.to_string(),
                id,
            })
    }

    /// Simplifies the model bottom up until nothing changes.
    ///
    /// Permanent simplification also drops zero right-hand-side summands, which may turn
    /// species into constants and enable further folding. Current-run simplification
    /// only folds values and is undone by the reset after the run.
    pub(crate) fn simplify_objects(&mut self, for_current_run: bool) {
        let ordered: Vec<QuantityIdx> = self.hierarchy.ordered().collect();
        let species: Vec<QuantityIdx> = self
            .model
            .quantity_indices()
            .filter(|q| self.model.quantity(*q).is_species())
            .collect();

        loop {
            let mut simplified = false;
            for q in &ordered {
                if self.model.is_constant(*q, for_current_run) {
                    continue;
                }
                simplified |= self.model.simplify_quantity(*q, for_current_run);
            }

            if for_current_run {
                break;
            }
            for q in &species {
                simplified |= self.model.simplify_rhs(*q);
            }
            if !simplified {
                break;
            }
        }

        simplify_switches(&mut self.model, for_current_run);

        if !for_current_run {
            let observers: Vec<QuantityIdx> = self
                .model
                .quantity_indices()
                .filter(|q| self.model.quantity(*q).is_observer())
                .collect();
            for q in observers {
                if let Some(f) = self.model.quantity(q).definition.formula() {
                    self.model.simplify_formula(f, false);
                }
            }
        }
    }

    /// Initial values of the DE system in solver (scaled) units.
    ///
    /// Quantities are evaluated level by level, so initial-value formulas see the values
    /// of the species they depend on.
    ///
    /// # Returns
    ///
    /// Fails if an initial value could not be computed or a species that must stay
    /// non-negative starts negative.
    pub fn de_initial_values(&self) -> Result<Vec<f64>, ModelError> {
        let de_species = self.model.de_species();
        let mut y = vec![f64::NAN; de_species.len()];

        for q in self.hierarchy.ordered() {
            let quantity = self.model.quantity(q);
            if let Some(i) = quantity.ode_index() {
                let view = StateView::unscaled(&y, self.start_time);
                y[i] = self.model.definition_value(&quantity.definition, &view);
            }
        }

        for q in de_species {
            let quantity: &Quantity = self.model.quantity(q);
            let Some(i) = quantity.ode_index() else {
                continue;
            };
            if y[i].is_nan() {
                return Err(ModelError::InitialValueNotSet {
                    path: quantity.path.clone(),
                });
            }
            let negative_allowed = quantity
                .species()
                .is_some_and(|s| s.negative_values_allowed);
            if y[i] < 0.0 && !negative_allowed {
                return Err(ModelError::NegativeInitialValue {
                    path: quantity.path.clone(),
                });
            }
            y[i] /= quantity.scale_factor();
        }

        Ok(y)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::tests::{explicit, parameter, species};

    fn decay_model() -> Model {
        let mut model = Model::new();
        let k = parameter(&mut model, 1, 0.5);
        let a = species(&mut model, 2, 4.0, vec![]);
        let rate = explicit(&mut model, 10, "-k * A", &[("k", Some(k)), ("A", Some(a))]);
        model.quantity_mut(a).species_mut().unwrap().rhs = vec![rate];
        model.quantity_mut(a).species_mut().unwrap().original_rhs = vec![rate];
        model
    }

    #[test]
    fn test_state_machine_order() {
        let mut simulation = Simulation::default();
        let err = simulation.finalize().unwrap_err();
        assert_eq!(err.to_string(), "Simulation was not loaded yet - cannot finalize");

        simulation.load(decay_model()).unwrap();
        assert_eq!(simulation.state(), SimulationState::Loaded);
        assert!(simulation.load(decay_model()).is_err());

        simulation.finalize().unwrap();
        assert_eq!(simulation.state(), SimulationState::Finalized);

        let err = simulation.finalize().unwrap_err();
        assert_eq!(err.to_string(), "Simulation was already finalized");
    }

    #[test]
    fn test_permanent_simplification_is_idempotent() {
        use crate::formula::{FormulaIdx, SumTerm};

        let mut model = Model::new();
        let k = parameter(&mut model, 1, 2.0);
        let v = parameter(&mut model, 2, 3.0);
        model.quantity_mut(v).is_fixed = false;
        let a = species(&mut model, 3, 1.0, vec![]);
        let decay = explicit(&mut model, 10, "-k * A", &[("k", Some(k)), ("A", Some(a))]);
        let inflow = explicit(
            &mut model,
            11,
            "v * A + k * k",
            &[("v", Some(v)), ("A", Some(a)), ("k", Some(k))],
        );
        let rhs = model
            .add_formula(Formula::new(
                12,
                FormulaKind::Sum(vec![
                    SumTerm { weight: 1.0, formula: decay },
                    SumTerm { weight: 0.5, formula: inflow },
                ]),
            ))
            .unwrap();
        model.quantity_mut(a).species_mut().unwrap().rhs = vec![rhs];
        model.quantity_mut(a).species_mut().unwrap().original_rhs = vec![rhs];

        let mut simulation = Simulation::default();
        simulation.load(model).unwrap();

        simulation.simplify_objects(false);
        let formulas = simulation.model().formulas().to_vec();
        let definitions: Vec<Definition> = simulation
            .model()
            .quantities()
            .iter()
            .map(|q| q.definition)
            .collect();
        let used = |f: FormulaIdx| simulation.model().formula(f).used_quantities(simulation.model());
        assert_eq!(used(decay), vec![a]);
        assert_eq!(used(inflow), vec![v, a]);

        simulation.simplify_objects(false);
        assert_eq!(simulation.model().formulas(), formulas.as_slice());
        let again: Vec<Definition> = simulation
            .model()
            .quantities()
            .iter()
            .map(|q| q.definition)
            .collect();
        assert_eq!(again, definitions);
    }

    #[test]
    fn test_mutators_respect_finalization() {
        let mut simulation = Simulation::default();
        simulation.load(decay_model()).unwrap();

        let err = simulation
            .set_parameter_values(&[ParameterInfo::new(1, 2.0)])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot set parameter values: simulation is not finalized"
        );

        simulation
            .set_variable_parameters(&[ParameterInfo::new(1, 0.5)])
            .unwrap();
        simulation.finalize().unwrap();

        let err = simulation
            .set_variable_parameters(&[ParameterInfo::new(1, 0.5)])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot set parameter properties: simulation already finalized"
        );

        simulation
            .set_parameter_values(&[ParameterInfo::new(1, 2.0)])
            .unwrap();
        let k = simulation.model().quantity_by_id(1).unwrap();
        assert_eq!(simulation.model().quantity(k).definition, Definition::Value(2.0));

        let err = simulation
            .set_species_properties(&[SpeciesInfo::new(2, 1.0, 1.0)])
            .unwrap_err();
        assert_eq!(err.to_string(), "Species Organism|S2 is fixed and cannot be varied");
    }

    #[test]
    fn test_variable_species_initial_value_and_scale() {
        let mut simulation = Simulation::default();
        simulation.load(decay_model()).unwrap();
        simulation
            .set_variable_species(&[SpeciesInfo::new(2, 4.0, 1.0)])
            .unwrap();
        simulation.finalize().unwrap();

        simulation
            .set_species_properties(&[SpeciesInfo::new(2, 8.0, 2.0)])
            .unwrap();
        assert_eq!(simulation.de_initial_values().unwrap(), vec![4.0]);

        let rate = simulation.model().formula_by_id(10).unwrap();
        let slots = simulation.model().formula(rate).explicit().unwrap().slots().to_vec();
        assert!(slots.iter().any(|s| matches!(s, crate::formula::Slot::State { scale, .. } if *scale == 2.0)));

        let err = simulation
            .set_species_properties(&[SpeciesInfo::new(2, 8.0, 0.0)])
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidScaleFactor { .. }));
    }

    #[test]
    fn test_table_points_for_value_parameter() {
        let mut simulation = Simulation::default();
        simulation.load(decay_model()).unwrap();
        simulation
            .set_variable_parameters(&[ParameterInfo::new(1, 0.5)])
            .unwrap();
        simulation.finalize().unwrap();

        let points = vec![TablePoint::new(0.0, 1.0), TablePoint::new(10.0, 2.0)];
        simulation
            .set_parameter_values(&[ParameterInfo::new(1, 0.0).with_table_points(points.clone())])
            .unwrap();

        let info = simulation
            .parameter_infos()
            .into_iter()
            .find(|p| p.id == 1)
            .unwrap();
        assert_eq!(info.table_points, Some(points));

        // replacing the points of an existing table keeps the formula
        let formulas = simulation.model().formulas().len();
        simulation
            .set_parameter_values(&[ParameterInfo::new(1, 0.0)
                .with_table_points(vec![TablePoint::new(0.0, 3.0)])])
            .unwrap();
        assert_eq!(simulation.model().formulas().len(), formulas);
    }

    #[test]
    fn test_initial_values_follow_levels() {
        let mut model = Model::new();
        let a = species(&mut model, 1, 2.0, vec![]);
        let init = explicit(&mut model, 10, "3 * A", &[("A", Some(a))]);
        let b = species(&mut model, 2, 0.0, vec![]);
        model.quantity_mut(b).definition = Definition::Formula(init);
        model.quantity_mut(b).original = Definition::Formula(init);
        for (q, id) in [(a, 20), (b, 21)] {
            let rate = model.add_formula(Formula::constant(id, 1.0)).unwrap();
            let data = model.quantity_mut(q).species_mut().unwrap();
            data.rhs = vec![rate];
            data.original_rhs = vec![rate];
        }
        model.quantity_mut(a).is_fixed = false;

        let mut simulation = Simulation::default();
        simulation.load(model).unwrap();
        simulation.finalize().unwrap();

        assert_eq!(simulation.de_initial_values().unwrap(), vec![2.0, 6.0]);

        let a = simulation.model().quantity_by_id(1).unwrap();
        simulation.model.quantity_mut(a).set_initial_value(-1.0);
        let err = simulation.de_initial_values().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Initial value of Organism|S1 is negative, but it was marked as positive"
        );
    }
}
