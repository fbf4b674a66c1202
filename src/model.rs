//! Model Module
//!
//! This module provides [`Model`], the arena owning every quantity, formula and switch
//! of a simulation. All cross links between these objects are indices into the arena.
//!
//! # Key Components
//!
//! - Registration with id bookkeeping ([`Model::add_quantity`], [`Model::add_formula`])
//! - Evaluation entry points used by formulas ([`Model::quantity_value`],
//!   [`Model::quantity_jacobian`])
//! - Simplification primitives ([`Model::simplify_formula`], [`Model::simplify_quantity`],
//!   [`Model::simplify_rhs`])
//! - Dependency queries ([`Model::used_quantities`], [`Model::formula_used_variables`])

use std::collections::{BTreeSet, HashMap};

use crate::error::ModelError;
use crate::formula::table::Table;
use crate::formula::{Formula, FormulaIdx, FormulaKind, JacobianSink, Slot, StateView};
use crate::quantity::{Definition, Quantity, QuantityIdx, QuantityKind};
use crate::switch::Switch;

#[derive(Debug, Clone, Default)]
pub struct Model {
    pub(crate) quantities: Vec<Quantity>,
    pub(crate) formulas: Vec<Formula>,
    pub(crate) switches: Vec<Switch>,
    quantity_ids: HashMap<u64, QuantityIdx>,
    formula_ids: HashMap<u64, FormulaIdx>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a quantity.
    ///
    /// # Returns
    ///
    /// The arena index, or [`ModelError::DuplicateId`] if the id is already taken.
    pub fn add_quantity(&mut self, quantity: Quantity) -> Result<QuantityIdx, ModelError> {
        if self.quantity_ids.contains_key(&quantity.id) {
            return Err(ModelError::DuplicateId {
                kind: "quantity",
                id: quantity.id,
            });
        }
        let idx = QuantityIdx(self.quantities.len());
        self.quantity_ids.insert(quantity.id, idx);
        self.quantities.push(quantity);
        Ok(idx)
    }

    /// Registers a formula.
    pub fn add_formula(&mut self, formula: Formula) -> Result<FormulaIdx, ModelError> {
        if self.formula_ids.contains_key(&formula.id) {
            return Err(ModelError::DuplicateId {
                kind: "formula",
                id: formula.id,
            });
        }
        let idx = FormulaIdx(self.formulas.len());
        self.formula_ids.insert(formula.id, idx);
        self.formulas.push(formula);
        Ok(idx)
    }

    /// Replaces the formula at `idx`, keeping its arena position.
    pub(crate) fn replace_formula(&mut self, idx: FormulaIdx, formula: Formula) {
        self.formulas[idx.0] = formula;
    }

    pub fn add_switch(&mut self, switch: Switch) -> Result<usize, ModelError> {
        if self.switches.iter().any(|s| s.id == switch.id) {
            return Err(ModelError::DuplicateId {
                kind: "switch",
                id: switch.id,
            });
        }
        self.switches.push(switch);
        Ok(self.switches.len() - 1)
    }

    pub fn quantity(&self, idx: QuantityIdx) -> &Quantity {
        &self.quantities[idx.0]
    }

    pub fn quantity_mut(&mut self, idx: QuantityIdx) -> &mut Quantity {
        &mut self.quantities[idx.0]
    }

    pub fn formula(&self, idx: FormulaIdx) -> &Formula {
        &self.formulas[idx.0]
    }

    pub fn formula_mut(&mut self, idx: FormulaIdx) -> &mut Formula {
        &mut self.formulas[idx.0]
    }

    pub fn quantities(&self) -> &[Quantity] {
        &self.quantities
    }

    pub fn formulas(&self) -> &[Formula] {
        &self.formulas
    }

    pub fn switches(&self) -> &[Switch] {
        &self.switches
    }

    pub fn quantity_indices(&self) -> impl Iterator<Item = QuantityIdx> {
        (0..self.quantities.len()).map(QuantityIdx)
    }

    pub fn quantity_by_id(&self, id: u64) -> Option<QuantityIdx> {
        self.quantity_ids.get(&id).copied()
    }

    pub fn formula_by_id(&self, id: u64) -> Option<FormulaIdx> {
        self.formula_ids.get(&id).copied()
    }

    pub fn quantity_ids(&self) -> &HashMap<u64, QuantityIdx> {
        &self.quantity_ids
    }

    /// Looks up a quantity by its path.
    pub fn quantity_by_path(&self, path: &str) -> Option<QuantityIdx> {
        self.quantities
            .iter()
            .position(|q| q.path == path)
            .map(QuantityIdx)
    }

    /// Species of the DE system ordered by their ODE index.
    pub fn de_species(&self) -> Vec<QuantityIdx> {
        let mut species: Vec<(usize, QuantityIdx)> = self
            .quantity_indices()
            .filter_map(|q| self.quantity(q).ode_index().map(|i| (i, q)))
            .collect();
        species.sort();
        species.into_iter().map(|(_, q)| q).collect()
    }

    pub fn is_constant(&self, idx: QuantityIdx, for_current_run: bool) -> bool {
        self.quantity(idx).is_constant(for_current_run)
    }

    /// Value of a quantity in the given state.
    ///
    /// Species of the DE system are read from the state vector, observers return their
    /// last committed value.
    pub fn quantity_value(&self, idx: QuantityIdx, view: &StateView) -> f64 {
        let quantity = self.quantity(idx);
        match &quantity.kind {
            QuantityKind::Species(species) => {
                if let Some(i) = species.ode_index {
                    return view.species_value(i, species.scale_factor);
                }
            }
            QuantityKind::Observer(observer) => return observer.last_value,
            QuantityKind::Parameter(_) => {}
        }
        self.definition_value(&quantity.definition, view)
    }

    /// Value of a quantity's own definition, bypassing state and observer caches.
    pub fn definition_value(&self, definition: &Definition, view: &StateView) -> f64 {
        match definition {
            Definition::Value(v) => *v,
            Definition::Formula(f) => self.formula(*f).compute(self, view),
        }
    }

    /// Adds `prefactor * d(quantity)/d(state)` to row `row` of `sink`.
    pub fn quantity_jacobian(
        &self,
        idx: QuantityIdx,
        view: &StateView,
        row: usize,
        prefactor: f64,
        sink: &mut dyn JacobianSink,
    ) {
        let quantity = self.quantity(idx);
        if let Some(i) = quantity.ode_index() {
            sink.add_state(row, i, prefactor * view.state_factor(quantity.scale_factor()));
            return;
        }
        if let Some(column) = sink.parameter_column(idx) {
            sink.add_parameter(row, column, prefactor);
            return;
        }
        if quantity.is_observer() {
            return;
        }
        if let Definition::Formula(f) = quantity.definition {
            self.formula(f).jacobian(self, view, row, prefactor, sink);
        }
    }

    /// The table behind a table-defined quantity.
    pub fn table_of(&self, idx: QuantityIdx) -> Option<&Table> {
        self.quantity(idx)
            .definition
            .formula()
            .and_then(|f| self.formula(f).table())
    }

    /// Value of the table quantity `idx` at argument `x`.
    ///
    /// A quantity simplified to a value yields that value; other formulas are evaluated
    /// with `x` as time.
    pub fn table_value(&self, idx: QuantityIdx, view: &StateView, x: f64) -> f64 {
        match self.table_of(idx) {
            Some(table) => table.value_at(x),
            None => self.quantity_value(idx, &view.at_time(x)),
        }
    }

    pub fn table_derivative(&self, idx: QuantityIdx, x: f64) -> f64 {
        self.table_of(idx)
            .map(|table| table.derivative_at(x))
            .unwrap_or(0.0)
    }

    /// Quantities a quantity depends on through its definition.
    ///
    /// Observers are not part of the dependency graph: formulas read their previous
    /// value, so edges to observers are dropped.
    pub fn used_quantities(&self, idx: QuantityIdx) -> Vec<QuantityIdx> {
        match self.quantity(idx).definition {
            Definition::Value(_) => Vec::new(),
            Definition::Formula(f) => self
                .formula(f)
                .used_quantities(self)
                .into_iter()
                .filter(|q| !self.quantity(*q).is_observer())
                .collect(),
        }
    }

    /// ODE indices a formula depends on, directly or through quantity formulas.
    pub fn formula_used_variables(&self, idx: FormulaIdx) -> BTreeSet<usize> {
        self.formula_reach(idx).0
    }

    /// ODE indices and quantities reachable from a formula.
    ///
    /// The walk stops at species of the DE system and at observers.
    pub fn formula_reach(&self, idx: FormulaIdx) -> (BTreeSet<usize>, BTreeSet<QuantityIdx>) {
        let mut used = BTreeSet::new();
        let mut visited = BTreeSet::new();
        self.collect_formula_variables(idx, &mut used, &mut visited);
        (used, visited)
    }

    fn collect_formula_variables(
        &self,
        idx: FormulaIdx,
        used: &mut BTreeSet<usize>,
        visited: &mut BTreeSet<QuantityIdx>,
    ) {
        for q in self.formula(idx).used_quantities(self) {
            self.collect_quantity_variables(q, used, visited);
        }
    }

    fn collect_quantity_variables(
        &self,
        idx: QuantityIdx,
        used: &mut BTreeSet<usize>,
        visited: &mut BTreeSet<QuantityIdx>,
    ) {
        if !visited.insert(idx) {
            return;
        }
        let quantity = self.quantity(idx);
        if let Some(i) = quantity.ode_index() {
            used.insert(i);
            return;
        }
        if quantity.is_observer() {
            return;
        }
        if let Definition::Formula(f) = quantity.definition {
            self.collect_formula_variables(f, used, visited);
        }
    }

    /// An id above every quantity and formula id in use.
    pub(crate) fn next_free_id(&self) -> u64 {
        let quantities = self.quantities.iter().map(|q| q.id);
        let formulas = self.formulas.iter().map(|f| f.id);
        quantities.chain(formulas).max().map_or(1, |id| id + 1)
    }

    /// Simplifies a formula in place.
    ///
    /// Slots reading quantities that are constant are replaced by their values.
    /// Permanent simplification also becomes the reset target.
    ///
    /// # Returns
    ///
    /// `true` if the formula no longer depends on anything variable.
    pub fn simplify_formula(&mut self, idx: FormulaIdx, for_current_run: bool) -> bool {
        let simplified = match &self.formula(idx).kind {
            FormulaKind::Constant(_) => return true,
            FormulaKind::Table(table) => table.is_constant(),
            FormulaKind::TableWithOffset { table, offset } => {
                self.is_constant(*table, for_current_run)
                    && self.is_constant(*offset, for_current_run)
            }
            FormulaKind::TableWithXArgument { table, argument } => {
                self.is_constant(*table, for_current_run)
                    && self.is_constant(*argument, for_current_run)
            }
            FormulaKind::Sum(terms) => {
                let terms: Vec<FormulaIdx> = terms.iter().map(|t| t.formula).collect();
                let mut all = true;
                for term in terms {
                    all &= self.simplify_formula(term, for_current_run);
                }
                all
            }
            FormulaKind::Explicit(explicit) => {
                let values: Vec<Option<f64>> = explicit
                    .slots()
                    .iter()
                    .map(|slot| match slot {
                        Slot::Quantity(q) if self.is_constant(*q, for_current_run) => {
                            self.quantity(*q).definition.value()
                        }
                        _ => None,
                    })
                    .collect();

                let formula = self.formula_mut(idx);
                match &mut formula.kind {
                    FormulaKind::Explicit(explicit) => {
                        explicit.simplify_with(&|slot| values.get(slot).copied().flatten())
                    }
                    _ => false,
                }
            }
        };

        if !for_current_run {
            self.formula_mut(idx).commit();
        }
        simplified
    }

    /// Replaces a formula-defined quantity by its value if the formula simplifies.
    ///
    /// # Returns
    ///
    /// `true` if the quantity changed from formula to value.
    pub fn simplify_quantity(&mut self, idx: QuantityIdx, for_current_run: bool) -> bool {
        let Definition::Formula(f) = self.quantity(idx).definition else {
            return false;
        };
        if !self.simplify_formula(f, for_current_run) {
            return false;
        }

        let value = self.formula(f).compute(self, &StateView::scaled(&[], 0.0));
        let quantity = self.quantity_mut(idx);
        quantity.definition = Definition::Value(value);
        if !for_current_run {
            quantity.original = Definition::Value(value);
        }
        true
    }

    /// Drops right-hand-side summands of a species that are identically zero.
    ///
    /// # Returns
    ///
    /// `true` if at least one summand was removed.
    pub fn simplify_rhs(&mut self, idx: QuantityIdx) -> bool {
        let rhs = match self.quantity(idx).species() {
            Some(species) if !species.rhs.is_empty() => species.rhs.clone(),
            _ => return false,
        };

        let mut kept = Vec::with_capacity(rhs.len());
        for f in rhs.iter().copied() {
            self.simplify_formula(f, false);
            if !self.formula(f).is_zero(self) {
                kept.push(f);
            }
        }

        if kept.len() == rhs.len() {
            return false;
        }
        if let Some(species) = self.quantity_mut(idx).species_mut() {
            species.original_rhs = kept.clone();
            species.rhs = kept;
        }
        true
    }

    /// Restart times of every table in the model.
    pub fn restart_time_points(&self) -> Vec<f64> {
        let mut points: Vec<f64> = self
            .formulas
            .iter()
            .flat_map(|f| f.restart_time_points(self))
            .collect();
        points.sort_by(f64::total_cmp);
        points.dedup();
        points
    }

    /// Restores every quantity, formula and switch to its pre-run state.
    pub fn reset(&mut self) {
        self.quantities.iter_mut().for_each(Quantity::reset);
        self.formulas.iter_mut().for_each(Formula::reset);
        self.switches.iter_mut().for_each(Switch::reset);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::formula::table::TablePoint;
    use crate::formula::ExplicitFormula;
    use crate::quantity::{ObserverData, ParameterData, SpeciesData};
    use crate::reference::{Binding, BindingTarget};

    pub(crate) fn parameter(model: &mut Model, id: u64, value: f64) -> QuantityIdx {
        model
            .add_quantity(Quantity::new(
                id,
                format!("P{}", id),
                format!("Organism|P{}", id),
                Definition::Value(value),
                QuantityKind::Parameter(ParameterData::default()),
            ))
            .unwrap()
    }

    pub(crate) fn explicit(
        model: &mut Model,
        id: u64,
        equation: &str,
        refs: &[(&str, Option<QuantityIdx>)],
    ) -> FormulaIdx {
        let bindings = refs
            .iter()
            .map(|(alias, target)| Binding {
                alias: alias.to_string(),
                target: match target {
                    Some(q) => BindingTarget::Quantity(*q),
                    None => BindingTarget::Time,
                },
            })
            .collect();
        let explicit = ExplicitFormula::new(id, equation, bindings).unwrap();
        model
            .add_formula(Formula::new(id, FormulaKind::Explicit(explicit)))
            .unwrap()
    }

    pub(crate) fn formula_parameter(
        model: &mut Model,
        id: u64,
        formula: FormulaIdx,
    ) -> QuantityIdx {
        model
            .add_quantity(Quantity::new(
                id,
                format!("P{}", id),
                format!("Organism|P{}", id),
                Definition::Formula(formula),
                QuantityKind::Parameter(ParameterData::default()),
            ))
            .unwrap()
    }

    pub(crate) fn species(
        model: &mut Model,
        id: u64,
        value: f64,
        rhs: Vec<FormulaIdx>,
    ) -> QuantityIdx {
        model
            .add_quantity(Quantity::new(
                id,
                format!("S{}", id),
                format!("Organism|S{}", id),
                Definition::Value(value),
                QuantityKind::Species(SpeciesData::new(1.0, false, rhs)),
            ))
            .unwrap()
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let mut model = Model::new();
        parameter(&mut model, 1, 1.0);
        let err = model
            .add_quantity(Quantity::new(
                1,
                "k",
                "k",
                Definition::Value(1.0),
                QuantityKind::Parameter(ParameterData::default()),
            ))
            .unwrap_err();
        assert_eq!(err.to_string(), "Object with id 1 is defined more than once (quantity)");
    }

    #[test]
    fn test_values_through_formulas_and_state() {
        let mut model = Model::new();
        let k = parameter(&mut model, 1, 2.0);
        let a = species(&mut model, 3, 1.0, vec![]);
        let rate = explicit(&mut model, 10, "k * A", &[("k", Some(k)), ("A", Some(a))]);

        model.quantity_mut(a).species_mut().unwrap().ode_index = Some(0);
        model.quantity_mut(a).species_mut().unwrap().scale_factor = 10.0;

        let y = [0.5];
        assert_relative_eq!(model.quantity_value(a, &StateView::scaled(&y, 0.0)), 5.0);
        assert_relative_eq!(model.formula(rate).compute(&model, &StateView::scaled(&y, 0.0)), 10.0);
        assert_relative_eq!(model.formula(rate).compute(&model, &StateView::unscaled(&y, 0.0)), 1.0);

        let mut jacobian = DMatrix::<f64>::zeros(1, 1);
        model
            .formula(rate)
            .jacobian(&model, &StateView::scaled(&y, 0.0), 0, 0.1, &mut jacobian);
        // 0.1 * k * scale
        assert_relative_eq!(jacobian[(0, 0)], 2.0);
    }

    #[test]
    fn test_observer_reads_last_value() {
        let mut model = Model::new();
        let f = model.add_formula(Formula::constant(1, 3.0)).unwrap();
        let o = model
            .add_quantity(Quantity::new(
                5,
                "O",
                "Organism|O",
                Definition::Formula(f),
                QuantityKind::Observer(ObserverData { last_value: 7.0 }),
            ))
            .unwrap();
        assert_eq!(model.quantity_value(o, &StateView::scaled(&[], 0.0)), 7.0);
        assert!(model.used_quantities(o).is_empty());
    }

    #[test]
    fn test_simplify_chain_to_value() {
        let mut model = Model::new();
        let k = parameter(&mut model, 1, 2.0);
        let f = explicit(&mut model, 10, "k * 3", &[("k", Some(k))]);
        let p = formula_parameter(&mut model, 2, f);

        assert!(model.simplify_quantity(p, false));
        assert_eq!(model.quantity(p).definition, Definition::Value(6.0));
        assert_eq!(model.quantity(p).original, Definition::Value(6.0));

        // already a value
        assert!(!model.simplify_quantity(p, false));
    }

    #[test]
    fn test_current_run_simplification_is_reset() {
        let mut model = Model::new();
        let k = parameter(&mut model, 1, 2.0);
        model.quantity_mut(k).is_fixed = false;
        let f = explicit(&mut model, 10, "k + Time", &[("k", Some(k)), ("Time", None)]);
        let g = explicit(&mut model, 11, "k * 2", &[("k", Some(k))]);
        let p = formula_parameter(&mut model, 2, g);

        assert!(!model.simplify_formula(f, false));
        assert!(!model.simplify_quantity(p, false));

        assert!(!model.simplify_formula(f, true));
        assert_eq!(model.formula(f).explicit().unwrap().current_equation(), "2+Time");
        assert!(model.simplify_quantity(p, true));
        assert_eq!(model.quantity(p).definition, Definition::Value(4.0));

        model.reset();
        assert_eq!(model.quantity(p).definition, Definition::Formula(g));
        assert_eq!(model.formula(f).explicit().unwrap().current_equation(), "k+Time");
    }

    #[test]
    fn test_rhs_zero_summands_are_dropped() {
        let mut model = Model::new();
        let k = parameter(&mut model, 1, 0.0);
        let a = species(&mut model, 2, 1.0, vec![]);
        let zero = explicit(&mut model, 10, "k * A", &[("k", Some(k)), ("A", Some(a))]);
        model.quantity_mut(a).species_mut().unwrap().rhs = vec![zero];

        assert!(!model.is_constant(a, false));
        assert!(model.simplify_rhs(a));
        assert!(model.quantity(a).species().unwrap().rhs.is_empty());
        assert!(model.is_constant(a, false));
        assert!(!model.simplify_rhs(a));
    }

    #[test]
    fn test_formula_used_variables_follow_parameters() {
        let mut model = Model::new();
        let a = species(&mut model, 1, 1.0, vec![]);
        let b = species(&mut model, 2, 1.0, vec![]);
        model.quantity_mut(a).species_mut().unwrap().ode_index = Some(0);
        model.quantity_mut(b).species_mut().unwrap().ode_index = Some(1);

        let inner = explicit(&mut model, 10, "2 * B", &[("B", Some(b))]);
        let p = formula_parameter(&mut model, 3, inner);
        let outer = explicit(&mut model, 11, "A + P", &[("A", Some(a)), ("P", Some(p))]);

        let used: Vec<usize> = model.formula_used_variables(outer).into_iter().collect();
        assert_eq!(used, vec![0, 1]);
        assert_eq!(model.de_species(), vec![a, b]);
    }

    #[test]
    fn test_table_quantities_and_restart_points() {
        let mut model = Model::new();
        let table = Table::new(
            vec![TablePoint::new(0.0, 0.0), TablePoint::with_restart(10.0, 10.0)],
            false,
        )
        .unwrap();
        let t = model
            .add_formula(Formula::new(1, FormulaKind::Table(table)))
            .unwrap();
        let table_q = formula_parameter(&mut model, 1, t);
        let offset = parameter(&mut model, 2, 2.0);
        let shifted = model
            .add_formula(Formula::new(
                2,
                FormulaKind::TableWithOffset {
                    table: table_q,
                    offset,
                },
            ))
            .unwrap();

        let view = StateView::scaled(&[], 5.0);
        assert_relative_eq!(model.formula(shifted).compute(&model, &view), 3.0);
        assert_eq!(model.restart_time_points(), vec![0.0, 2.0, 10.0, 12.0]);
    }
}
