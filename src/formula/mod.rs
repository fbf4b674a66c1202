//! Formula Module
//!
//! This module provides the expression model: the closed set of formula variants that
//! define quantity values, right-hand-side summands, switch conditions and switch
//! replacement values.
//!
//! # Key Components
//!
//! - [`Formula`]: an arena entry with its id, current [`FormulaKind`] and the kind to
//!   restore after a run
//! - [`ExplicitFormula`]: parsed equation text with bound references
//! - [`StateView`]: the state vector, time and [`ScaleMode`] a formula is evaluated against
//! - [`JacobianSink`]: destination of Jacobian contributions (dense, banded or
//!   sensitivity storage)
//!
//! Formulas refer to quantities and to other formulas through arena indices. Evaluation
//! therefore always goes through [`crate::model::Model`], which owns both arenas.

pub mod table;

use std::collections::BTreeSet;

use nalgebra::DMatrix;

use crate::bandwidth::BandMatrix;
use crate::error::ModelError;
use crate::expression::{parse_equation, Expr};
use crate::model::Model;
use crate::quantity::QuantityIdx;
use crate::reference::{Binding, BindingTarget};

use self::table::Table;

/// Index of a formula in the model arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FormulaIdx(pub usize);

/// Whether species values are read from the solver state in scaled units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleMode {
    /// The state holds `value / scale_factor`; reads multiply by the scale factor.
    UseScaleFactor,
    /// The state holds real values.
    IgnoreScaleFactor,
}

/// State a formula is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct StateView<'a> {
    pub y: &'a [f64],
    pub time: f64,
    pub mode: ScaleMode,
}

impl<'a> StateView<'a> {
    pub fn scaled(y: &'a [f64], time: f64) -> Self {
        Self {
            y,
            time,
            mode: ScaleMode::UseScaleFactor,
        }
    }

    pub fn unscaled(y: &'a [f64], time: f64) -> Self {
        Self {
            y,
            time,
            mode: ScaleMode::IgnoreScaleFactor,
        }
    }

    /// Same state, evaluated at another time.
    pub fn at_time(&self, time: f64) -> Self {
        Self { time, ..*self }
    }

    /// Real value of state entry `index` given the species scale factor.
    pub fn species_value(&self, index: usize, scale: f64) -> f64 {
        let stored = self.y.get(index).copied().unwrap_or(f64::NAN);
        match self.mode {
            ScaleMode::UseScaleFactor => stored * scale,
            ScaleMode::IgnoreScaleFactor => stored,
        }
    }

    /// Factor between a change of the stored entry and a change of the real value.
    pub fn state_factor(&self, scale: f64) -> f64 {
        match self.mode {
            ScaleMode::UseScaleFactor => scale,
            ScaleMode::IgnoreScaleFactor => 1.0,
        }
    }
}

/// Receives partial derivatives of right-hand sides.
///
/// Rows are equations (ODE indices), state columns are ODE indices. Sinks that track
/// parameter sensitivities additionally report a column for every sensitivity parameter;
/// contributions of those parameters are then routed to [`JacobianSink::add_parameter`]
/// instead of being expanded through the parameter definition.
pub trait JacobianSink {
    fn add_state(&mut self, row: usize, column: usize, value: f64);

    fn parameter_column(&self, _quantity: QuantityIdx) -> Option<usize> {
        None
    }

    fn add_parameter(&mut self, _row: usize, _column: usize, _value: f64) {}
}

impl JacobianSink for DMatrix<f64> {
    fn add_state(&mut self, row: usize, column: usize, value: f64) {
        self[(row, column)] += value;
    }
}

impl JacobianSink for BandMatrix {
    fn add_state(&mut self, row: usize, column: usize, value: f64) {
        // entries outside the band are structurally zero after reordering
        self.add(row, column, value);
    }
}

/// Input of an explicit formula, resolved from its binding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Slot {
    Time,
    Quantity(QuantityIdx),
    /// A species of the DE system with its cached state position and scale factor.
    State {
        quantity: QuantityIdx,
        ode_index: usize,
        scale: f64,
    },
}

impl Slot {
    pub fn quantity(&self) -> Option<QuantityIdx> {
        match self {
            Slot::Time => None,
            Slot::Quantity(q) | Slot::State { quantity: q, .. } => Some(*q),
        }
    }
}

/// Parsed equation with its bound references.
#[derive(Debug, Clone, PartialEq)]
pub struct ExplicitFormula {
    equation: String,
    bindings: Vec<Binding>,
    slots: Vec<Slot>,
    expr: Expr,
    derivatives: Vec<Expr>,
}

impl ExplicitFormula {
    /// Parses `equation` against the aliases of `bindings`.
    ///
    /// # Arguments
    ///
    /// * `formula_id` - Id of the owning formula, used in error messages
    /// * `equation` - Equation text
    /// * `bindings` - Resolved references, one slot per binding
    pub fn new(
        formula_id: u64,
        equation: impl Into<String>,
        bindings: Vec<Binding>,
    ) -> Result<Self, ModelError> {
        let equation = equation.into();
        let aliases: Vec<String> = bindings.iter().map(|b| b.alias.clone()).collect();
        let expr = parse_equation(&equation, &aliases).map_err(|e| ModelError::Parse {
            formula_id,
            equation: equation.clone(),
            message: e.to_string(),
        })?;

        let slots = bindings
            .iter()
            .map(|b| match b.target {
                BindingTarget::Time => Slot::Time,
                BindingTarget::Quantity(q) => Slot::Quantity(q),
            })
            .collect();

        let mut formula = Self {
            equation,
            bindings,
            slots,
            expr,
            derivatives: Vec::new(),
        };
        formula.update_derivatives();
        Ok(formula)
    }

    pub fn equation(&self) -> &str {
        &self.equation
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// The current tree rendered with the binding aliases.
    pub fn current_equation(&self) -> String {
        let aliases: Vec<String> = self.bindings.iter().map(|b| b.alias.clone()).collect();
        self.expr.to_equation(&aliases)
    }

    /// Slots still referenced by the (possibly simplified) tree.
    pub fn used_slots(&self) -> BTreeSet<usize> {
        let mut used = BTreeSet::new();
        self.expr.collect_slots(&mut used);
        used
    }

    /// Quantities still referenced by the tree.
    pub fn used_quantities(&self) -> Vec<QuantityIdx> {
        self.used_slots()
            .into_iter()
            .filter_map(|s| self.slots[s].quantity())
            .collect()
    }

    pub fn slot_value(&self, slot: usize, model: &Model, view: &StateView) -> f64 {
        match self.slots[slot] {
            Slot::Time => view.time,
            Slot::Quantity(q) => model.quantity_value(q, view),
            Slot::State {
                ode_index, scale, ..
            } => view.species_value(ode_index, scale),
        }
    }

    pub fn compute(&self, model: &Model, view: &StateView) -> f64 {
        self.expr.eval(&|slot| self.slot_value(slot, model, view))
    }

    pub fn jacobian(
        &self,
        model: &Model,
        view: &StateView,
        row: usize,
        prefactor: f64,
        sink: &mut dyn JacobianSink,
    ) {
        for (slot, derivative) in self.derivatives.iter().enumerate() {
            if derivative.is_zero() {
                continue;
            }
            let d = derivative.eval(&|s| self.slot_value(s, model, view));
            if d == 0.0 {
                continue;
            }
            match self.slots[slot] {
                Slot::Time => {}
                Slot::State {
                    ode_index, scale, ..
                } => sink.add_state(row, ode_index, prefactor * d * view.state_factor(scale)),
                Slot::Quantity(q) => model.quantity_jacobian(q, view, row, prefactor * d, sink),
            }
        }
    }

    /// Substitutes the given slot values and folds the tree.
    ///
    /// # Returns
    ///
    /// `true` if the tree reduced to a number.
    pub fn simplify_with<F>(&mut self, value: &F) -> bool
    where
        F: Fn(usize) -> Option<f64>,
    {
        let simplified = self.expr.substitute(value).fold();
        if simplified != self.expr {
            self.expr = simplified;
            self.update_derivatives();
        }
        self.expr.as_number().is_some()
    }

    /// Binds state slots to the species positions of the DE system.
    pub fn bind_states<F>(&mut self, state_of: &F)
    where
        F: Fn(QuantityIdx) -> Option<(usize, f64)>,
    {
        for slot in self.slots.iter_mut() {
            let Some(quantity) = slot.quantity() else {
                continue;
            };
            *slot = match state_of(quantity) {
                Some((ode_index, scale)) => Slot::State {
                    quantity,
                    ode_index,
                    scale,
                },
                None => Slot::Quantity(quantity),
            };
        }
    }

    /// Updates the cached scale factor of every state slot of `quantity`.
    pub fn update_scale(&mut self, quantity: QuantityIdx, new_scale: f64) {
        for slot in self.slots.iter_mut() {
            if let Slot::State {
                quantity: q, scale, ..
            } = slot
            {
                if *q == quantity {
                    *scale = new_scale;
                }
            }
        }
    }

    /// Rewrites cached state positions through `old -> new`.
    pub fn remap_states(&mut self, new_index_of: &[usize]) {
        for slot in self.slots.iter_mut() {
            if let Slot::State { ode_index, .. } = slot {
                *ode_index = new_index_of[*ode_index];
            }
        }
    }

    /// Operands compared against a time slot in the condition tree.
    pub fn time_comparison_operands(&self) -> Vec<&Expr> {
        self.expr
            .time_comparison_operands(&|s| matches!(self.slots.get(s), Some(Slot::Time)))
    }

    fn update_derivatives(&mut self) {
        self.derivatives = (0..self.slots.len())
            .map(|slot| {
                if self.expr.uses_slot(slot) {
                    self.expr.derivative(slot)
                } else {
                    Expr::Num(0.0)
                }
            })
            .collect();
    }
}

/// Weighted summand of a sum formula.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SumTerm {
    pub weight: f64,
    pub formula: FormulaIdx,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormulaKind {
    Constant(f64),
    Explicit(ExplicitFormula),
    Sum(Vec<SumTerm>),
    Table(Table),
    /// Table of another quantity evaluated at `time - offset`.
    TableWithOffset {
        table: QuantityIdx,
        offset: QuantityIdx,
    },
    /// Table of another quantity evaluated at the value of `argument`.
    TableWithXArgument {
        table: QuantityIdx,
        argument: QuantityIdx,
    },
}

impl FormulaKind {
    pub fn name(&self) -> &'static str {
        match self {
            FormulaKind::Constant(_) => "Constant",
            FormulaKind::Explicit(_) => "Explicit",
            FormulaKind::Sum(_) => "Sum",
            FormulaKind::Table(_) => "Table",
            FormulaKind::TableWithOffset { .. } => "TableWithOffset",
            FormulaKind::TableWithXArgument { .. } => "TableWithXArgument",
        }
    }
}

/// Arena entry of a formula.
///
/// `kind` is what is evaluated. `original` is restored by [`Formula::reset`]; permanent
/// simplification and finalization overwrite it through [`Formula::commit`].
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    pub id: u64,
    pub kind: FormulaKind,
    original: FormulaKind,
}

impl Formula {
    pub fn new(id: u64, kind: FormulaKind) -> Self {
        Self {
            id,
            original: kind.clone(),
            kind,
        }
    }

    pub fn constant(id: u64, value: f64) -> Self {
        Self::new(id, FormulaKind::Constant(value))
    }

    pub fn explicit(&self) -> Option<&ExplicitFormula> {
        match &self.kind {
            FormulaKind::Explicit(explicit) => Some(explicit),
            _ => None,
        }
    }

    pub fn table(&self) -> Option<&Table> {
        match &self.kind {
            FormulaKind::Table(table) => Some(table),
            _ => None,
        }
    }

    /// Makes the current kind the reset target.
    pub fn commit(&mut self) {
        self.original = self.kind.clone();
    }

    pub fn reset(&mut self) {
        self.kind = self.original.clone();
    }

    /// Applies `update` to both the current and the reset kind.
    pub fn update_both<F>(&mut self, mut update: F)
    where
        F: FnMut(&mut FormulaKind),
    {
        update(&mut self.kind);
        update(&mut self.original);
    }

    /// Value of the formula, `model` resolving quantities and nested formulas.
    pub fn compute(&self, model: &Model, view: &StateView) -> f64 {
        match &self.kind {
            FormulaKind::Constant(v) => *v,
            FormulaKind::Explicit(explicit) => explicit.compute(model, view),
            FormulaKind::Sum(terms) => terms
                .iter()
                .map(|t| t.weight * model.formula(t.formula).compute(model, view))
                .sum(),
            FormulaKind::Table(table) => table.value_at(view.time),
            FormulaKind::TableWithOffset { table, offset } => {
                let shifted = view.time - model.quantity_value(*offset, view);
                model.table_value(*table, view, shifted)
            }
            FormulaKind::TableWithXArgument { table, argument } => {
                let x = model.quantity_value(*argument, view);
                model.table_value(*table, view, x)
            }
        }
    }

    /// Adds `prefactor * d(formula)/d(state)` to row `row` of `sink`.
    ///
    /// Nothing is added for a zero prefactor.
    pub fn jacobian(
        &self,
        model: &Model,
        view: &StateView,
        row: usize,
        prefactor: f64,
        sink: &mut dyn JacobianSink,
    ) {
        if prefactor == 0.0 {
            return;
        }
        match &self.kind {
            FormulaKind::Constant(_) | FormulaKind::Table(_) => {}
            FormulaKind::Explicit(explicit) => explicit.jacobian(model, view, row, prefactor, sink),
            FormulaKind::Sum(terms) => {
                for term in terms {
                    model
                        .formula(term.formula)
                        .jacobian(model, view, row, prefactor * term.weight, sink);
                }
            }
            FormulaKind::TableWithOffset { table, offset } => {
                let shifted = view.time - model.quantity_value(*offset, view);
                let slope = model.table_derivative(*table, shifted);
                if slope != 0.0 {
                    model.quantity_jacobian(*offset, view, row, -prefactor * slope, sink);
                }
            }
            FormulaKind::TableWithXArgument { table, argument } => {
                let x = model.quantity_value(*argument, view);
                let slope = model.table_derivative(*table, x);
                if slope != 0.0 {
                    model.quantity_jacobian(*argument, view, row, prefactor * slope, sink);
                }
            }
        }
    }

    /// True if the formula is known to evaluate to zero everywhere.
    pub fn is_zero(&self, model: &Model) -> bool {
        match &self.kind {
            FormulaKind::Constant(v) => *v == 0.0,
            FormulaKind::Explicit(explicit) => explicit.expr().is_zero(),
            FormulaKind::Sum(terms) => terms
                .iter()
                .all(|t| t.weight == 0.0 || model.formula(t.formula).is_zero(model)),
            FormulaKind::Table(table) => table.constant_value() == Some(0.0),
            FormulaKind::TableWithOffset { .. } | FormulaKind::TableWithXArgument { .. } => false,
        }
    }

    /// Quantities this formula reads directly, the edges used for leveling.
    pub fn used_quantities(&self, model: &Model) -> Vec<QuantityIdx> {
        match &self.kind {
            FormulaKind::Constant(_) | FormulaKind::Table(_) => Vec::new(),
            FormulaKind::Explicit(explicit) => explicit.used_quantities(),
            FormulaKind::Sum(terms) => {
                let mut used: Vec<QuantityIdx> = terms
                    .iter()
                    .flat_map(|t| model.formula(t.formula).used_quantities(model))
                    .collect();
                used.sort();
                used.dedup();
                used
            }
            FormulaKind::TableWithOffset { table, offset } => vec![*table, *offset],
            FormulaKind::TableWithXArgument { table, argument } => vec![*table, *argument],
        }
    }

    /// Table discontinuities requiring a solver restart.
    pub fn restart_time_points(&self, model: &Model) -> Vec<f64> {
        match &self.kind {
            FormulaKind::Table(table) => table.restart_time_points().to_vec(),
            FormulaKind::TableWithOffset { table, offset } => {
                let shift = if model.is_constant(*offset, false) {
                    model.quantity_value(*offset, &StateView::unscaled(&[], 0.0))
                } else {
                    0.0
                };
                model
                    .table_of(*table)
                    .map(|t| t.restart_time_points().iter().map(|x| x + shift).collect())
                    .unwrap_or_default()
            }
            _ => Vec::new(),
        }
    }
}
