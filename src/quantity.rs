//! Quantity Module
//!
//! This module provides the quantities of a model: parameters, species (the ODE state
//! variables) and observers.
//!
//! # Key Components
//!
//! - [`Quantity`]: common record with id, path, flags and its current/original definition
//! - [`Definition`]: either a scalar value or a formula, never both
//! - [`QuantityKind`]: the kind-specific data of parameters, species and observers
//! - [`ParameterInfo`], [`SpeciesInfo`]: snapshots exchanged with a host through the
//!   mutators of [`crate::simulation::Simulation`]
//!
//! Quantities live in an arena owned by [`crate::model::Model`] and are addressed by
//! [`QuantityIdx`]. Everything a quantity points to (formulas, other quantities,
//! consumers of its scale factor) is held as an index into the same arenas.

use serde::{Deserialize, Serialize};

use crate::formula::table::TablePoint;
use crate::formula::FormulaIdx;

/// Index of a quantity in the model arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuantityIdx(pub usize);

/// What a quantity currently evaluates to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Definition {
    Value(f64),
    Formula(FormulaIdx),
}

impl Definition {
    pub fn value(&self) -> Option<f64> {
        match self {
            Definition::Value(v) => Some(*v),
            Definition::Formula(_) => None,
        }
    }

    pub fn formula(&self) -> Option<FormulaIdx> {
        match self {
            Definition::Formula(f) => Some(*f),
            Definition::Value(_) => None,
        }
    }
}

/// Object that cached the scale factor of a species and must be told when it changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleConsumer {
    Formula(FormulaIdx),
    Switch(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterData {
    pub can_be_varied: bool,
    pub calculate_sensitivity: bool,
}

impl Default for ParameterData {
    fn default() -> Self {
        Self {
            can_be_varied: true,
            calculate_sensitivity: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeciesData {
    /// Position in the state vector, `None` while not assigned or when constant.
    pub ode_index: Option<usize>,
    pub scale_factor: f64,
    pub negative_values_allowed: bool,
    /// Right-hand side summands currently in effect.
    pub rhs: Vec<FormulaIdx>,
    /// Summands restored by a reset.
    pub original_rhs: Vec<FormulaIdx>,
    /// Sorted ODE indices the right-hand side depends on.
    pub rhs_used_variables: Vec<usize>,
    pub constant_during_calculation: bool,
    pub scale_consumers: Vec<ScaleConsumer>,
    /// Value of the state at the latest saved output point.
    pub latest_value: f64,
}

impl SpeciesData {
    pub fn new(scale_factor: f64, negative_values_allowed: bool, rhs: Vec<FormulaIdx>) -> Self {
        Self {
            ode_index: None,
            scale_factor,
            negative_values_allowed,
            original_rhs: rhs.clone(),
            rhs,
            rhs_used_variables: Vec::new(),
            constant_during_calculation: false,
            scale_consumers: Vec::new(),
            latest_value: f64::NAN,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObserverData {
    /// Value committed at the latest output point, read by formulas referencing the observer.
    pub last_value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuantityKind {
    Parameter(ParameterData),
    Species(SpeciesData),
    Observer(ObserverData),
}

/// A model quantity.
///
/// # Fields
///
/// * `id` - Unique numeric id from the load source
/// * `name`, `path`, `unit`, `description` - Descriptive metadata
/// * `definition` - Current value or formula
/// * `original` - Definition restored by [`Quantity::reset`]
/// * `is_fixed` - Whether the value is fixed across runs (parameters and species initial values)
/// * `is_changed_by_switch` - Whether a switch targets this quantity
/// * `is_used_by_switch` - Whether a switch condition or replacement formula reads this quantity
/// * `is_persistable` - Whether the time series of the quantity is reported
/// * `is_used` - Whether the quantity is reachable from the simulated system
/// * `level` - Dependency depth from hierarchical leveling
#[derive(Debug, Clone, PartialEq)]
pub struct Quantity {
    pub id: u64,
    pub name: String,
    pub path: String,
    pub unit: Option<String>,
    pub description: Option<String>,
    pub definition: Definition,
    pub original: Definition,
    pub is_fixed: bool,
    pub is_changed_by_switch: bool,
    pub is_used_by_switch: bool,
    pub is_persistable: bool,
    pub is_used: bool,
    pub level: usize,
    pub kind: QuantityKind,
}

impl Quantity {
    pub fn new(
        id: u64,
        name: impl Into<String>,
        path: impl Into<String>,
        definition: Definition,
        kind: QuantityKind,
    ) -> Self {
        let is_persistable = !matches!(kind, QuantityKind::Parameter(_));
        Self {
            id,
            name: name.into(),
            path: path.into(),
            unit: None,
            description: None,
            definition,
            original: definition,
            is_fixed: true,
            is_changed_by_switch: false,
            is_used_by_switch: false,
            is_persistable,
            is_used: true,
            level: 0,
            kind,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            QuantityKind::Parameter(_) => "Parameter",
            QuantityKind::Species(_) => "Species",
            QuantityKind::Observer(_) => "Observer",
        }
    }

    pub fn is_parameter(&self) -> bool {
        matches!(self.kind, QuantityKind::Parameter(_))
    }

    pub fn is_species(&self) -> bool {
        matches!(self.kind, QuantityKind::Species(_))
    }

    pub fn is_observer(&self) -> bool {
        matches!(self.kind, QuantityKind::Observer(_))
    }

    pub fn parameter(&self) -> Option<&ParameterData> {
        match &self.kind {
            QuantityKind::Parameter(data) => Some(data),
            _ => None,
        }
    }

    pub fn parameter_mut(&mut self) -> Option<&mut ParameterData> {
        match &mut self.kind {
            QuantityKind::Parameter(data) => Some(data),
            _ => None,
        }
    }

    pub fn species(&self) -> Option<&SpeciesData> {
        match &self.kind {
            QuantityKind::Species(data) => Some(data),
            _ => None,
        }
    }

    pub fn species_mut(&mut self) -> Option<&mut SpeciesData> {
        match &mut self.kind {
            QuantityKind::Species(data) => Some(data),
            _ => None,
        }
    }

    pub fn observer(&self) -> Option<&ObserverData> {
        match &self.kind {
            QuantityKind::Observer(data) => Some(data),
            _ => None,
        }
    }

    /// State vector position of a species in the DE system.
    pub fn ode_index(&self) -> Option<usize> {
        self.species().and_then(|s| s.ode_index)
    }

    pub fn scale_factor(&self) -> f64 {
        self.species().map(|s| s.scale_factor).unwrap_or(1.0)
    }

    /// Parameters marked for sensitivity calculation that are not fixed.
    pub fn is_sensitivity_parameter(&self) -> bool {
        !self.is_fixed
            && self
                .parameter()
                .is_some_and(|p| p.calculate_sensitivity)
    }

    /// Whether the value can be folded into dependent formulas.
    ///
    /// For the current run only the absence of a formula and of switch changes
    /// matter; permanently, the quantity must also be fixed. Sensitivity parameters,
    /// observers and species of the DE system are never constant.
    pub fn is_constant(&self, for_current_run: bool) -> bool {
        if self.is_observer() || self.ode_index().is_some() {
            return false;
        }
        if self.parameter().is_some_and(|p| p.calculate_sensitivity) {
            return false;
        }
        if self
            .species()
            .is_some_and(|s| !s.constant_during_calculation && !s.rhs.is_empty())
        {
            return false;
        }
        if self.is_changed_by_switch || matches!(self.definition, Definition::Formula(_)) {
            return false;
        }
        for_current_run || self.is_fixed
    }

    /// Replaces the value permanently, dropping any formula.
    pub fn set_initial_value(&mut self, value: f64) {
        self.definition = Definition::Value(value);
        self.original = Definition::Value(value);
    }

    /// Restores the definition (and for species the RHS) the run started from.
    pub fn reset(&mut self) {
        self.definition = self.original;
        match &mut self.kind {
            QuantityKind::Species(data) => {
                data.rhs = data.original_rhs.clone();
                data.latest_value = f64::NAN;
            }
            QuantityKind::Observer(data) => data.last_value = f64::NAN,
            QuantityKind::Parameter(_) => {}
        }
    }

    /// Renders the `"Species Organism|A"` prefix used in messages.
    pub fn describe(&self) -> String {
        format!("{} {}", self.kind_name(), self.path)
    }
}

/// Snapshot of the common quantity properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantityInfo {
    pub id: u64,
    pub name: String,
    pub path: String,
    pub unit: Option<String>,
    pub value: Option<f64>,
    pub is_formula: bool,
    pub is_fixed: bool,
    pub is_persistable: bool,
}

impl From<&Quantity> for QuantityInfo {
    fn from(quantity: &Quantity) -> Self {
        Self {
            id: quantity.id,
            name: quantity.name.clone(),
            path: quantity.path.clone(),
            unit: quantity.unit.clone(),
            value: quantity.definition.value(),
            is_formula: matches!(quantity.definition, Definition::Formula(_)),
            is_fixed: quantity.is_fixed,
            is_persistable: quantity.is_persistable,
        }
    }
}

/// Parameter snapshot used to mark parameters variable and to set next-run values.
///
/// # Fields
///
/// * `id` - Parameter id
/// * `path` - Parameter path, informational
/// * `value` - New value for the next run, ignored when `table_points` is set
/// * `table_points` - New table points for the next run
/// * `calculate_sensitivity` - Whether sensitivities are computed for the parameter
/// * `can_be_varied` - Whether the model allows varying the parameter
/// * `is_used` - Whether the parameter is reachable from the simulated system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub id: u64,
    pub path: String,
    pub value: f64,
    #[serde(default)]
    pub table_points: Option<Vec<TablePoint>>,
    #[serde(default)]
    pub calculate_sensitivity: bool,
    #[serde(default = "default_true")]
    pub can_be_varied: bool,
    #[serde(default = "default_true")]
    pub is_used: bool,
}

impl ParameterInfo {
    pub fn new(id: u64, value: f64) -> Self {
        Self {
            id,
            path: String::new(),
            value,
            table_points: None,
            calculate_sensitivity: false,
            can_be_varied: true,
            is_used: true,
        }
    }

    pub fn with_sensitivity(mut self) -> Self {
        self.calculate_sensitivity = true;
        self
    }

    pub fn with_table_points(mut self, points: Vec<TablePoint>) -> Self {
        self.table_points = Some(points);
        self
    }

    pub fn is_table(&self) -> bool {
        self.table_points.is_some()
    }
}

/// Species snapshot used to mark species variable and to set next-run initial values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesInfo {
    pub id: u64,
    pub path: String,
    pub value: f64,
    pub scale_factor: f64,
    #[serde(default)]
    pub negative_values_allowed: bool,
}

impl SpeciesInfo {
    pub fn new(id: u64, value: f64, scale_factor: f64) -> Self {
        Self {
            id,
            path: String::new(),
            value,
            scale_factor,
            negative_values_allowed: false,
        }
    }
}

fn default_true() -> bool {
    true
}
