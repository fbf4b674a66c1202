//! Switch Module
//!
//! This module provides discontinuous events. A [`Switch`] owns a condition formula and
//! a list of [`FormulaChange`]s; when the condition evaluates to `1` at a scheduled
//! switch time, every change is applied and the caller learns whether the integrator
//! must restart.
//!
//! # Key Components
//!
//! - [`Switch`] / [`FormulaChange`]: loaded switch data plus the cached species position
//! - [`SwitchOutcome`]: restart flag and the state variables whose dependents changed
//! - [`perform_switch_updates`]: evaluates all switches at one time point
//! - [`switch_time_points`]: candidate times derived from `Time <op> value` conditions

use std::collections::BTreeSet;

use crate::error::ModelError;
use crate::formula::{FormulaIdx, Slot, StateView};
use crate::model::Model;
use crate::quantity::{Definition, QuantityIdx, ScaleConsumer};

/// Replacement of one quantity's definition.
#[derive(Debug, Clone, PartialEq)]
pub struct FormulaChange {
    pub target: QuantityIdx,
    pub new_formula: FormulaIdx,
    /// Store the value of `new_formula` at switch time instead of the formula itself.
    pub use_as_value: bool,
    species: Option<SpeciesTarget>,
}

/// Cached state position and scale factor of a species target.
#[derive(Debug, Clone, Copy, PartialEq)]
struct SpeciesTarget {
    ode_index: usize,
    scale: f64,
}

impl FormulaChange {
    pub fn new(target: QuantityIdx, new_formula: FormulaIdx, use_as_value: bool) -> Self {
        Self {
            target,
            new_formula,
            use_as_value,
            species: None,
        }
    }

    /// State position of the target species once finalized.
    pub fn species_index(&self) -> Option<usize> {
        self.species.map(|s| s.ode_index)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Switch {
    pub id: u64,
    pub condition: FormulaIdx,
    pub one_time: bool,
    pub changes: Vec<FormulaChange>,
    fired: bool,
}

impl Switch {
    pub fn new(id: u64, condition: FormulaIdx, one_time: bool, changes: Vec<FormulaChange>) -> Self {
        Self {
            id,
            condition,
            one_time,
            changes,
            fired: false,
        }
    }

    pub fn was_fired(&self) -> bool {
        self.fired
    }

    pub fn reset(&mut self) {
        self.fired = false;
    }
}

/// Result of evaluating the switches at one time point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SwitchOutcome {
    /// Whether the integrator has to restart from the (possibly modified) state.
    pub restart: bool,
    /// ODE indices used by definitions that were replaced or introduced.
    pub touched_variables: BTreeSet<usize>,
}

/// Caches the species positions of all switch targets.
///
/// Must run again whenever ODE indices change. Registers each switch as consumer of its
/// target species' scale factor.
pub fn finalize_switches(model: &mut Model) -> Result<(), ModelError> {
    for s in 0..model.switches.len() {
        for c in 0..model.switches[s].changes.len() {
            let target = model.switches[s].changes[c].target;
            let switch_id = model.switches[s].id;

            let quantity = model.quantity(target);
            let species = match quantity.species() {
                Some(species) => match species.ode_index {
                    Some(ode_index) => Some(SpeciesTarget {
                        ode_index,
                        scale: species.scale_factor,
                    }),
                    None => {
                        return Err(ModelError::InvalidSwitchTarget {
                            switch_id,
                            message: format!(
                                "species {} changed by switch is marked as constant",
                                quantity.path
                            ),
                        })
                    }
                },
                None => None,
            };

            model.switches[s].changes[c].species = species;
            if species.is_some() {
                if let Some(data) = model.quantity_mut(target).species_mut() {
                    if !data.scale_consumers.contains(&ScaleConsumer::Switch(s)) {
                        data.scale_consumers.push(ScaleConsumer::Switch(s));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Updates the cached scale factor of changes targeting `target`.
pub fn update_switch_scale(model: &mut Model, switch: usize, target: QuantityIdx, scale: f64) {
    for change in model.switches[switch].changes.iter_mut() {
        if change.target == target {
            if let Some(species) = change.species.as_mut() {
                species.scale = scale;
            }
        }
    }
}

/// Evaluates every switch at `time` and applies the changes of those that fire.
///
/// Switches are processed in load order; a change applied by one switch is visible to
/// the conditions of the following ones. One-time switches fire at most once per run.
///
/// # Arguments
///
/// * `model` - Model whose definitions may be replaced
/// * `y` - Scaled solver state, species targets are overwritten in place
/// * `time` - Current time
pub fn perform_switch_updates(model: &mut Model, y: &mut [f64], time: f64) -> SwitchOutcome {
    let mut outcome = SwitchOutcome::default();

    for s in 0..model.switches.len() {
        let switch = &model.switches[s];
        if switch.one_time && switch.fired {
            continue;
        }

        let condition = model
            .formula(switch.condition)
            .compute(model, &StateView::scaled(y, time));
        if condition != 1.0 {
            continue;
        }

        log::debug!("Switch {} fired at time {}", switch.id, time);
        model.switches[s].fired = true;

        let changes = model.switches[s].changes.clone();
        for change in &changes {
            outcome.restart |= apply_change(model, change, y, time, &mut outcome.touched_variables);
        }
    }

    outcome
}

fn apply_change(
    model: &mut Model,
    change: &FormulaChange,
    y: &mut [f64],
    time: f64,
    touched: &mut BTreeSet<usize>,
) -> bool {
    if let Some(species) = change.species {
        let value = model
            .formula(change.new_formula)
            .compute(model, &StateView::scaled(y, time));
        let scaled = value / species.scale;
        if scaled == y[species.ode_index] {
            return false;
        }
        y[species.ode_index] = scaled;
        return true;
    }

    let old = model.quantity(change.target).definition;

    if change.use_as_value {
        touched.extend(definition_variables(model, old));
        let value = model
            .formula(change.new_formula)
            .compute(model, &StateView::scaled(y, time));
        model.quantity_mut(change.target).definition = Definition::Value(value);
        return true;
    }

    if old == Definition::Formula(change.new_formula) {
        return false;
    }

    touched.extend(definition_variables(model, old));
    model.quantity_mut(change.target).definition = Definition::Formula(change.new_formula);
    touched.extend(model.formula_used_variables(change.new_formula));
    true
}

fn definition_variables(model: &Model, definition: Definition) -> BTreeSet<usize> {
    match definition {
        Definition::Value(_) => BTreeSet::new(),
        Definition::Formula(f) => model.formula_used_variables(f),
    }
}

/// ODE indices that switch replacement formulas may introduce into dependents.
///
/// Switches whose condition is identically zero never fire and contribute nothing.
pub fn switch_used_variables(model: &Model) -> BTreeSet<usize> {
    let mut used = BTreeSet::new();
    for switch in &model.switches {
        if model.formula(switch.condition).is_zero(model) {
            continue;
        }
        for change in switch.changes.iter().filter(|c| !c.use_as_value) {
            used.extend(model.formula_used_variables(change.new_formula));
        }
    }
    used
}

/// Simplifies conditions and replacement formulas of all switches.
pub fn simplify_switches(model: &mut Model, for_current_run: bool) {
    let formulas: Vec<FormulaIdx> = model
        .switches
        .iter()
        .flat_map(|s| std::iter::once(s.condition).chain(s.changes.iter().map(|c| c.new_formula)))
        .collect();
    for f in formulas {
        model.simplify_formula(f, for_current_run);
    }
}

/// Times at which switch conditions of the form `Time <op> value` may flip.
///
/// Only operands that can be evaluated without the state (all referenced quantities
/// constant for the current run) yield a time point.
pub fn switch_time_points(model: &Model) -> Vec<f64> {
    let mut points = Vec::new();

    for switch in &model.switches {
        let Some(explicit) = model.formula(switch.condition).explicit() else {
            continue;
        };
        for operand in explicit.time_comparison_operands() {
            let mut slots = BTreeSet::new();
            operand.collect_slots(&mut slots);
            let constant = slots.iter().all(|s| match explicit.slots()[*s] {
                Slot::Quantity(q) => model.is_constant(q, true),
                _ => false,
            });
            if !constant {
                continue;
            }
            let view = StateView::scaled(&[], 0.0);
            let value = operand.eval(&|s| explicit.slot_value(s, model, &view));
            if value.is_finite() {
                points.push(value);
            }
        }
    }

    points.sort_by(f64::total_cmp);
    points.dedup();
    points
}

/// Marks quantities read by switch conditions and replacement formulas and flags the
/// switch targets.
pub fn mark_switch_usage(model: &mut Model) {
    let mut used = Vec::new();
    let mut targets = Vec::new();
    for switch in &model.switches {
        used.extend(model.formula(switch.condition).used_quantities(model));
        for change in &switch.changes {
            used.extend(model.formula(change.new_formula).used_quantities(model));
            targets.push(change.target);
        }
    }
    for q in used {
        model.quantity_mut(q).is_used_by_switch = true;
    }
    for q in targets {
        model.quantity_mut(q).is_changed_by_switch = true;
    }
}
