//! Finalization of a loaded model into an executable DE system.

use std::collections::BTreeSet;

use crate::bandwidth::{check_permutation, half_bandwidths, reverse_cuthill_mckee, symmetrize};
use crate::error::ModelError;
use crate::formula::{ExplicitFormula, Formula, FormulaIdx, FormulaKind};
use crate::hierarchy::Hierarchy;
use crate::quantity::{Definition, ObserverData, Quantity, QuantityIdx, QuantityKind, ScaleConsumer};
use crate::reference::{Binding, BindingTarget};
use crate::switch::{finalize_switches, switch_used_variables};

use super::{Simulation, SimulationState};

impl Simulation {
    /// Turns the loaded model into an executable DE system.
    ///
    /// Runs, in order: sensitivity parameter caching, leveling, permanent
    /// simplification with re-leveling, ODE index assignment, formula and switch
    /// finalization, observer synthesis for persistable parameters, caching of the
    /// right-hand-side dependencies and (with a banded Jacobian) bandwidth reduction.
    pub fn finalize(&mut self) -> Result<(), ModelError> {
        match self.state() {
            SimulationState::Created => {
                return Err(ModelError::invalid_state(
                    "Simulation::finalize",
                    "Simulation was not loaded yet - cannot finalize",
                ))
            }
            SimulationState::Finalized => {
                return Err(ModelError::invalid_state(
                    "Simulation::finalize",
                    "Simulation was already finalized",
                ))
            }
            _ => {}
        }

        self.cache_sensitivity_parameters();
        self.validate_table_references()?;

        self.hierarchy = Hierarchy::build(&mut self.model, false)?;
        self.set_state(SimulationState::Leveled);

        self.simplify_objects(false);
        self.hierarchy = Hierarchy::build(&mut self.model, false)?;
        self.set_state(SimulationState::Simplified);

        self.assign_ode_indices();
        self.set_state(SimulationState::IndexAssigned);

        self.finalize_formulas();
        finalize_switches(&mut self.model)?;
        self.create_observers_for_persistable_parameters()?;
        self.cache_rhs_used_variables();

        if self.solver.use_banded_jacobian && self.de_size() > 1 {
            self.reduce_bandwidth()?;
        }
        self.bandwidths = half_bandwidths(&self.rhs_used_variables());

        self.identify_used_parameters();
        self.set_state(SimulationState::Finalized);

        log::info!(
            "Finalized '{}': {} equations, {} sensitivity parameters, bandwidths {:?}",
            self.name,
            self.de_size(),
            self.sensitivity_parameters.len(),
            self.bandwidths
        );
        Ok(())
    }

    fn cache_sensitivity_parameters(&mut self) {
        self.sensitivity_parameters = self
            .model
            .quantity_indices()
            .filter(|q| {
                let quantity = self.model.quantity(*q);
                if !quantity.is_sensitivity_parameter() {
                    return false;
                }
                if quantity.definition.value().is_none() {
                    log::warn!(
                        "Sensitivities of formula parameter {} are not computed",
                        quantity.path
                    );
                    return false;
                }
                true
            })
            .collect();
    }

    /// Tables wrapped by offset and argument formulas must be table (or constant) parameters.
    fn validate_table_references(&self) -> Result<(), ModelError> {
        for formula in self.model.formulas() {
            let table = match formula.kind {
                FormulaKind::TableWithOffset { table, .. }
                | FormulaKind::TableWithXArgument { table, .. } => table,
                _ => continue,
            };
            let quantity = self.model.quantity(table);
            let is_table = quantity.is_parameter()
                && (self.model.table_of(table).is_some()
                    || matches!(quantity.definition, Definition::Value(_)));
            if !is_table {
                return Err(ModelError::NonTableReference {
                    formula_id: formula.id,
                    path: quantity.path.clone(),
                });
            }
        }
        Ok(())
    }

    /// Assigns sequential ODE indices to species that remain in the DE system.
    fn assign_ode_indices(&mut self) {
        let mut next = 0;
        for q in self.model.quantity_indices().collect::<Vec<_>>() {
            let quantity = self.model.quantity_mut(q);
            let changed_by_switch = quantity.is_changed_by_switch;
            let Some(species) = quantity.species_mut() else {
                continue;
            };

            species.constant_during_calculation = species.rhs.is_empty() && !changed_by_switch;
            species.ode_index = if species.constant_during_calculation {
                None
            } else {
                next += 1;
                Some(next - 1)
            };
        }
        log::debug!("Assigned {} ODE indices", next);
    }

    /// Binds the state slots of explicit formulas and registers them as scale consumers.
    fn finalize_formulas(&mut self) {
        let states: Vec<Option<(usize, f64)>> = self
            .model
            .quantities()
            .iter()
            .map(|q| q.ode_index().map(|i| (i, q.scale_factor())))
            .collect();
        let state_of = |q: QuantityIdx| states[q.0];

        for f in 0..self.model.formulas().len() {
            let f = FormulaIdx(f);
            let Some(explicit) = self.model.formula(f).explicit() else {
                continue;
            };
            let bound: BTreeSet<QuantityIdx> = explicit
                .slots()
                .iter()
                .filter_map(|s| s.quantity())
                .filter(|q| states[q.0].is_some())
                .collect();

            self.model.formula_mut(f).update_both(|kind| {
                if let FormulaKind::Explicit(explicit) = kind {
                    explicit.bind_states(&state_of);
                }
            });

            for q in bound {
                if let Some(species) = self.model.quantity_mut(q).species_mut() {
                    if !species.scale_consumers.contains(&ScaleConsumer::Formula(f)) {
                        species.scale_consumers.push(ScaleConsumer::Formula(f));
                    }
                }
            }
        }
    }

    /// Observers that report the value of every persistable parameter.
    fn create_observers_for_persistable_parameters(&mut self) -> Result<(), ModelError> {
        let persistable: Vec<QuantityIdx> = self
            .model
            .quantity_indices()
            .filter(|q| {
                let quantity = self.model.quantity(*q);
                quantity.is_parameter() && quantity.is_persistable
            })
            .collect();

        for parameter in persistable {
            let formula_id = self.model.next_free_id();
            let binding = Binding {
                alias: "P".into(),
                target: BindingTarget::Quantity(parameter),
            };
            let explicit = ExplicitFormula::new(formula_id, "P", vec![binding])?;
            let formula = self
                .model
                .add_formula(Formula::new(formula_id, FormulaKind::Explicit(explicit)))?;

            let source = self.model.quantity(parameter);
            let mut observer = Quantity::new(
                self.model.next_free_id(),
                source.name.clone(),
                source.path.clone(),
                Definition::Formula(formula),
                QuantityKind::Observer(ObserverData {
                    last_value: f64::NAN,
                }),
            );
            observer.unit = source.unit.clone();
            observer.description = source.description.clone();
            log::debug!("Created observer for persistable parameter {}", observer.path);
            self.model.add_quantity(observer)?;
            self.model.quantity_mut(parameter).is_persistable = false;
        }
        Ok(())
    }

    /// Caches the sorted ODE indices every right-hand side depends on.
    ///
    /// A right-hand side reaching a switch target may depend on everything a switch
    /// can swap in.
    fn cache_rhs_used_variables(&mut self) {
        let from_switches = switch_used_variables(&self.model);

        for q in self.model.de_species() {
            let rhs = match self.model.quantity(q).species() {
                Some(species) => species.rhs.clone(),
                None => continue,
            };

            let mut used = BTreeSet::new();
            for f in rhs {
                let (variables, reached) = self.model.formula_reach(f);
                used.extend(variables);
                if reached
                    .iter()
                    .any(|r| self.model.quantity(*r).is_changed_by_switch)
                {
                    used.extend(from_switches.iter().copied());
                }
            }

            if let Some(species) = self.model.quantity_mut(q).species_mut() {
                species.rhs_used_variables = used.into_iter().collect();
            }
        }
    }

    pub(crate) fn rhs_used_variables(&self) -> Vec<Vec<usize>> {
        self.model
            .de_species()
            .into_iter()
            .map(|q| {
                self.model
                    .quantity(q)
                    .species()
                    .map(|s| s.rhs_used_variables.clone())
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Reorders the DE system with reverse Cuthill-McKee and rewrites every cached index.
    fn reduce_bandwidth(&mut self) -> Result<(), ModelError> {
        let used = self.rhs_used_variables();
        let n = used.len();
        let before = half_bandwidths(&used);

        let mut matrix = vec![vec![false; n]; n];
        for (row, columns) in used.iter().enumerate() {
            for column in columns {
                matrix[row][*column] = true;
            }
        }
        symmetrize(&mut matrix)?;

        let permutation = reverse_cuthill_mckee(&matrix)?;
        check_permutation(&permutation, n)?;

        let mut new_index_of = vec![0; n];
        for (new, old) in permutation.iter().enumerate() {
            new_index_of[*old] = new;
        }

        for q in self.model.de_species() {
            let path = self.model.quantity(q).path.clone();
            let Some(species) = self.model.quantity_mut(q).species_mut() else {
                continue;
            };
            let Some(old) = species.ode_index else {
                continue;
            };
            species.ode_index = Some(new_index_of[old]);

            let mut remapped = Vec::with_capacity(species.rhs_used_variables.len());
            for v in &species.rhs_used_variables {
                let new = new_index_of.get(*v).copied().ok_or_else(|| ModelError::IndexMismatch {
                    path: path.clone(),
                    message: format!("used variable {} is not part of the DE system", v),
                })?;
                remapped.push(new);
            }
            remapped.sort_unstable();
            species.rhs_used_variables = remapped;
        }

        for f in 0..self.model.formulas().len() {
            self.model.formula_mut(FormulaIdx(f)).update_both(|kind| {
                if let FormulaKind::Explicit(explicit) = kind {
                    explicit.remap_states(&new_index_of);
                }
            });
        }
        finalize_switches(&mut self.model)?;

        let after = half_bandwidths(&self.rhs_used_variables());
        log::debug!("Reduced bandwidths from {:?} to {:?}", before, after);
        Ok(())
    }

    /// Marks the parameters reachable from the DE system, observers and switches as used.
    ///
    /// Without `identify_used_parameters` every parameter counts as used.
    fn identify_used_parameters(&mut self) {
        if !self.options.identify_used_parameters {
            for quantity in self.model.quantities.iter_mut() {
                quantity.is_used = true;
            }
            return;
        }

        let mut roots: Vec<FormulaIdx> = Vec::new();
        for quantity in self.model.quantities() {
            if let Some(species) = quantity.species() {
                if species.ode_index.is_some() {
                    roots.extend(species.rhs.iter().copied());
                    roots.extend(quantity.definition.formula());
                }
            } else if quantity.is_observer() {
                roots.extend(quantity.definition.formula());
            }
        }
        for switch in self.model.switches() {
            roots.push(switch.condition);
            roots.extend(switch.changes.iter().map(|c| c.new_formula));
        }

        let mut reached = BTreeSet::new();
        for f in roots {
            reached.extend(self.model.formula_reach(f).1);
        }
        for switch in self.model.switches() {
            reached.extend(switch.changes.iter().map(|c| c.target));
        }

        let mut unused = 0;
        for q in self.model.quantity_indices().collect::<Vec<_>>() {
            let is_used = reached.contains(&q) || self.sensitivity_parameters.contains(&q);
            let quantity = self.model.quantity_mut(q);
            if quantity.is_parameter() {
                quantity.is_used = is_used;
                unused += usize::from(!is_used);
            }
        }
        log::info!("{} parameters are not used by the simulated system", unused);
    }
}
