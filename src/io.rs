//! Model I/O Module
//!
//! This module loads models from their JSON document form and writes them back.
//!
//! # Key Components
//!
//! - [`ModelDocument`]: the serialized model with its nodes, options and output schema
//! - [`load_model`], [`load_model_str`]: two-pass loading into a [`Simulation`]
//! - [`validate_json`]: validation of a document against its generated JSON schema
//! - [`Simulation::to_document`]: export of the current model, including values set
//!   through the mutators
//!
//! Loading happens in two passes. The first pass registers every quantity and formula
//! under its id; the second resolves all id references between the registered nodes.

use std::fmt;
use std::path::Path;

use colored::Colorize;
use jsonschema::validator_for;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ModelError;
use crate::formula::table::{Table, TablePoint};
use crate::formula::{ExplicitFormula, Formula, FormulaIdx, FormulaKind, SumTerm};
use crate::model::Model;
use crate::options::{SimulationOptions, SolverSettings};
use crate::output::OutputSchema;
use crate::quantity::{
    Definition, ObserverData, ParameterData, Quantity, QuantityIdx, QuantityKind, SpeciesData,
};
use crate::reference::QuantityReference;
use crate::simulation::Simulation;
use crate::switch::{FormulaChange, Switch};

/// Serialized model.
///
/// # Fields
///
/// * `name` - Name of the model
/// * `start_time` - Simulation start time
/// * `options` - Simulation options
/// * `solver` - Solver settings
/// * `output_schema` - User output times
/// * `parameters`, `species`, `observers` - Quantity nodes
/// * `formulas` - Formula nodes referenced by quantities and switches
/// * `switches` - Switch nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ModelDocument {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub options: SimulationOptions,
    #[serde(default)]
    pub solver: SolverSettings,
    #[serde(default)]
    pub output_schema: OutputSchema,
    #[serde(default)]
    pub parameters: Vec<ParameterNode>,
    #[serde(default)]
    pub species: Vec<SpeciesNode>,
    #[serde(default)]
    pub observers: Vec<QuantityNode>,
    #[serde(default)]
    pub formulas: Vec<FormulaNode>,
    #[serde(default)]
    pub switches: Vec<SwitchNode>,
}

/// Fields shared by every quantity node. Exactly one of `value` and `formula_id` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct QuantityNode {
    pub id: u64,
    pub name: String,
    /// Full path, defaults to the name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistable: Option<bool>,
}

impl QuantityNode {
    fn path(&self) -> String {
        self.path.clone().unwrap_or_else(|| self.name.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ParameterNode {
    #[serde(flatten)]
    pub quantity: QuantityNode,
    #[serde(default = "default_true")]
    pub can_be_varied: bool,
    #[serde(default)]
    pub calculate_sensitivity: bool,
    #[serde(default = "default_true")]
    pub fixed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SpeciesNode {
    #[serde(flatten)]
    pub quantity: QuantityNode,
    #[serde(default = "default_scale")]
    pub scale_factor: f64,
    #[serde(default)]
    pub negative_values_allowed: bool,
    /// Formula ids of the right-hand-side summands.
    #[serde(default)]
    pub rhs: Vec<u64>,
    #[serde(default = "default_true")]
    pub fixed: bool,
}

/// Formula node, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FormulaNode {
    Constant {
        id: u64,
        value: f64,
    },
    Explicit {
        id: u64,
        equation: String,
        #[serde(default)]
        references: Vec<QuantityReference>,
    },
    Sum {
        id: u64,
        terms: Vec<SumTermNode>,
    },
    Table {
        id: u64,
        points: Vec<TablePoint>,
        #[serde(default)]
        use_derived_values: bool,
    },
    TableWithOffset {
        id: u64,
        table_id: u64,
        offset_id: u64,
    },
    TableWithXArgument {
        id: u64,
        table_id: u64,
        argument_id: u64,
    },
}

impl FormulaNode {
    pub fn id(&self) -> u64 {
        match self {
            FormulaNode::Constant { id, .. }
            | FormulaNode::Explicit { id, .. }
            | FormulaNode::Sum { id, .. }
            | FormulaNode::Table { id, .. }
            | FormulaNode::TableWithOffset { id, .. }
            | FormulaNode::TableWithXArgument { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SumTermNode {
    pub formula_id: u64,
    #[serde(default = "default_scale")]
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SwitchNode {
    pub id: u64,
    pub condition_id: u64,
    #[serde(default)]
    pub one_time: bool,
    pub changes: Vec<ChangeNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChangeNode {
    pub target_id: u64,
    pub formula_id: u64,
    #[serde(default)]
    pub use_as_value: bool,
}

fn default_true() -> bool {
    true
}

fn default_scale() -> f64 {
    1.0
}

/// Reads a model file into a loaded (not yet finalized) simulation.
pub fn load_model(path: impl AsRef<Path>) -> Result<Simulation, ModelError> {
    let text = std::fs::read_to_string(path)?;
    load_model_str(&text)
}

/// Parses a model document into a loaded (not yet finalized) simulation.
///
/// Validates the text against the document schema first if the document enables
/// `validate_with_schema`.
pub fn load_model_str(text: &str) -> Result<Simulation, ModelError> {
    let document: ModelDocument = serde_json::from_str(text)?;

    if document.options.validate_with_schema {
        let report = validate_json(text)?;
        if !report.valid {
            return Err(ModelError::SchemaValidation(
                report.errors.iter().map(|e| e.to_string()).collect(),
            ));
        }
    }

    let mut simulation = Simulation::from_document(document)?;
    simulation.set_source_text(text.to_string());
    Ok(simulation)
}

/// Writes the document of `simulation` as pretty JSON.
pub fn save_model(path: impl AsRef<Path>, simulation: &Simulation) -> Result<(), ModelError> {
    let document = simulation.to_document()?;
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, &document)?;
    Ok(())
}

impl Simulation {
    /// Builds the model of `document` and loads it.
    pub fn from_document(document: ModelDocument) -> Result<Self, ModelError> {
        let model = build_model(&document)?;

        let mut simulation = Simulation::new(document.options.clone(), document.solver.clone());
        simulation.name = document.name.clone();
        simulation.start_time = document.start_time;
        simulation.output_schema = document.output_schema.clone();
        simulation.load(model)?;
        simulation.set_document(document);
        Ok(simulation)
    }

    /// The loaded document with the values of variable parameters and species replaced
    /// by their current (next-run) values.
    pub fn to_document(&self) -> Result<ModelDocument, ModelError> {
        let mut document = self.document().cloned().ok_or_else(|| {
            ModelError::invalid_state("Simulation::to_document", "Simulation was not loaded from a document")
        })?;
        document.options = self.options.clone();
        document.solver = self.solver.clone();
        document.output_schema = self.output_schema.clone();
        document.start_time = self.start_time;

        for node in document.parameters.iter_mut() {
            let Some(q) = self.model.quantity_by_id(node.quantity.id) else {
                continue;
            };
            let quantity = self.model.quantity(q);
            if quantity.is_fixed {
                continue;
            }
            node.fixed = false;

            match quantity.original {
                Definition::Value(value) => {
                    node.quantity.value = Some(value);
                    node.quantity.formula_id = None;
                }
                Definition::Formula(f) => {
                    let formula = self.model.formula(f);
                    if let Some(table) = formula.table() {
                        upsert_table(&mut document.formulas, formula.id, table);
                        node.quantity.value = None;
                        node.quantity.formula_id = Some(formula.id);
                    }
                }
            }
        }

        for node in document.species.iter_mut() {
            let Some(q) = self.model.quantity_by_id(node.quantity.id) else {
                continue;
            };
            let quantity = self.model.quantity(q);
            if quantity.is_fixed {
                continue;
            }
            node.fixed = false;
            if let Definition::Value(value) = quantity.original {
                node.quantity.value = Some(value);
                node.quantity.formula_id = None;
            }
            node.scale_factor = quantity.scale_factor();
        }

        Ok(document)
    }
}

fn upsert_table(formulas: &mut Vec<FormulaNode>, id: u64, table: &Table) {
    let node = FormulaNode::Table {
        id,
        points: table.points().to_vec(),
        use_derived_values: table.use_derived_values(),
    };
    match formulas.iter_mut().find(|f| f.id() == id) {
        Some(existing) => *existing = node,
        None => formulas.push(node),
    }
}

/// Builds the model arena from a document in two passes.
fn build_model(document: &ModelDocument) -> Result<Model, ModelError> {
    let mut model = Model::new();

    // pass 1: register every node under its id
    for node in &document.formulas {
        model.add_formula(Formula::constant(node.id(), f64::NAN))?;
    }
    for node in &document.parameters {
        let data = ParameterData {
            can_be_varied: node.can_be_varied,
            calculate_sensitivity: node.calculate_sensitivity,
        };
        let mut quantity = register(&node.quantity, QuantityKind::Parameter(data));
        quantity.is_fixed = node.fixed;
        model.add_quantity(quantity)?;
    }
    for node in &document.species {
        let data = SpeciesData::new(node.scale_factor, node.negative_values_allowed, Vec::new());
        let mut quantity = register(&node.quantity, QuantityKind::Species(data));
        quantity.is_fixed = node.fixed;
        model.add_quantity(quantity)?;
    }
    for node in &document.observers {
        let data = ObserverData {
            last_value: f64::NAN,
        };
        model.add_quantity(register(node, QuantityKind::Observer(data)))?;
    }

    // pass 2: resolve references
    for node in &document.formulas {
        let formula = resolve_formula(&model, node)?;
        let idx = formula_idx(&model, node.id(), "formula")?;
        model.replace_formula(idx, formula);
    }

    let nodes = document
        .parameters
        .iter()
        .map(|p| &p.quantity)
        .chain(document.species.iter().map(|s| &s.quantity))
        .chain(document.observers.iter());
    for node in nodes {
        let definition = resolve_definition(&model, node)?;
        let q = quantity_idx(&model, node.id, "quantity")?;
        let quantity = model.quantity_mut(q);
        quantity.definition = definition;
        quantity.original = definition;
    }

    for node in &document.species {
        let rhs = node
            .rhs
            .iter()
            .map(|id| formula_idx(&model, *id, &format!("Species {}", node.quantity.path())))
            .collect::<Result<Vec<_>, _>>()?;
        let q = quantity_idx(&model, node.quantity.id, "species")?;
        if let Some(species) = model.quantity_mut(q).species_mut() {
            species.original_rhs = rhs.clone();
            species.rhs = rhs;
        }
    }

    for node in &document.switches {
        let switch = resolve_switch(&model, node)?;
        model.add_switch(switch)?;
    }

    log::debug!(
        "Built model with {} quantities, {} formulas and {} switches",
        model.quantities().len(),
        model.formulas().len(),
        model.switches().len()
    );
    Ok(model)
}

fn register(node: &QuantityNode, kind: QuantityKind) -> Quantity {
    let mut quantity = Quantity::new(
        node.id,
        node.name.clone(),
        node.path(),
        Definition::Value(f64::NAN),
        kind,
    );
    quantity.unit = node.unit.clone();
    quantity.description = node.description.clone();
    if let Some(persistable) = node.persistable {
        quantity.is_persistable = persistable;
    }
    quantity
}

fn quantity_idx(model: &Model, id: u64, node: &str) -> Result<QuantityIdx, ModelError> {
    model
        .quantity_by_id(id)
        .ok_or_else(|| ModelError::UnresolvedReference {
            node: node.to_string(),
            id,
        })
}

fn formula_idx(model: &Model, id: u64, node: &str) -> Result<FormulaIdx, ModelError> {
    model
        .formula_by_id(id)
        .ok_or_else(|| ModelError::UnresolvedReference {
            node: node.to_string(),
            id,
        })
}

fn resolve_definition(model: &Model, node: &QuantityNode) -> Result<Definition, ModelError> {
    match (node.value, node.formula_id) {
        (Some(_), Some(_)) => Err(ModelError::ValueAndFormula { path: node.path() }),
        (None, None) => Err(ModelError::NoValueOrFormula { path: node.path() }),
        (Some(value), None) => Ok(Definition::Value(value)),
        (None, Some(id)) => Ok(Definition::Formula(formula_idx(model, id, &node.path())?)),
    }
}

fn resolve_formula(model: &Model, node: &FormulaNode) -> Result<Formula, ModelError> {
    let id = node.id();
    let owner = format!("Formula {}", id);

    let kind = match node {
        FormulaNode::Constant { value, .. } => FormulaKind::Constant(*value),
        FormulaNode::Explicit {
            equation,
            references,
            ..
        } => {
            let bindings = references
                .iter()
                .map(|r| r.resolve(model.quantity_ids(), &owner))
                .collect::<Result<Vec<_>, _>>()?;
            FormulaKind::Explicit(ExplicitFormula::new(id, equation.clone(), bindings)?)
        }
        FormulaNode::Sum { terms, .. } => FormulaKind::Sum(
            terms
                .iter()
                .map(|t| {
                    Ok(SumTerm {
                        weight: t.weight,
                        formula: formula_idx(model, t.formula_id, &owner)?,
                    })
                })
                .collect::<Result<Vec<_>, ModelError>>()?,
        ),
        FormulaNode::Table {
            points,
            use_derived_values,
            ..
        } => FormulaKind::Table(Table::new(points.clone(), *use_derived_values).map_err(
            |e| ModelError::InvalidTable {
                formula_id: id,
                message: e.to_string(),
            },
        )?),
        FormulaNode::TableWithOffset {
            table_id,
            offset_id,
            ..
        } => FormulaKind::TableWithOffset {
            table: quantity_idx(model, *table_id, &owner)?,
            offset: quantity_idx(model, *offset_id, &owner)?,
        },
        FormulaNode::TableWithXArgument {
            table_id,
            argument_id,
            ..
        } => FormulaKind::TableWithXArgument {
            table: quantity_idx(model, *table_id, &owner)?,
            argument: quantity_idx(model, *argument_id, &owner)?,
        },
    };

    Ok(Formula::new(id, kind))
}

fn resolve_switch(model: &Model, node: &SwitchNode) -> Result<Switch, ModelError> {
    let owner = format!("Switch {}", node.id);
    let condition = formula_idx(model, node.condition_id, &owner)?;
    let changes = node
        .changes
        .iter()
        .map(|c| {
            Ok(FormulaChange::new(
                quantity_idx(model, c.target_id, &owner)?,
                formula_idx(model, c.formula_id, &owner)?,
                c.use_as_value,
            ))
        })
        .collect::<Result<Vec<_>, ModelError>>()?;

    Ok(Switch::new(node.id, condition, node.one_time, changes))
}

/// Outcome of validating a document against the schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
}

/// A single schema violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    /// JSON path of the offending value
    pub location: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\n\t└── {}",
            self.location.bold(),
            self.message.bold().red()
        )
    }
}

/// Validates a model document against the JSON schema of [`ModelDocument`].
///
/// # Arguments
///
/// * `content` - JSON text of the document
///
/// # Returns
///
/// The report listing every violation; fails only if `content` is not JSON.
pub fn validate_json(content: &str) -> Result<ValidationReport, ModelError> {
    let json: Value = serde_json::from_str(content)?;
    let schema = serde_json::to_value(schema_for!(ModelDocument))?;
    let validator = validator_for(&schema)
        .map_err(|e| ModelError::SchemaValidation(vec![format!("Invalid schema: {}", e)]))?;

    let errors: Vec<ValidationError> = validator
        .iter_errors(&json)
        .map(|error| ValidationError {
            location: error.instance_path.to_string(),
            message: error.to_string().replace('"', "'"),
        })
        .collect();

    Ok(ValidationReport {
        valid: errors.is_empty(),
        errors,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::quantity::ParameterInfo;

    fn decay_document() -> Value {
        json!({
            "name": "decay",
            "options": { "write_log_file": false },
            "output_schema": { "intervals": [{ "start": 0.0, "end": 1.0, "points": 3 }] },
            "parameters": [
                { "id": 1, "name": "k", "path": "Organism|k", "value": 0.5 }
            ],
            "species": [
                { "id": 2, "name": "A", "path": "Organism|A", "value": 1.0, "rhs": [10] }
            ],
            "formulas": [
                {
                    "type": "explicit",
                    "id": 10,
                    "equation": "-k * A",
                    "references": [{ "alias": "k", "id": 1 }, { "alias": "A", "id": 2 }]
                }
            ]
        })
    }

    #[test]
    fn test_two_pass_load_resolves_forward_references() {
        let simulation = load_model_str(&decay_document().to_string()).unwrap();
        let model = simulation.model();

        let a = model.quantity_by_path("Organism|A").unwrap();
        let rhs = &model.quantity(a).species().unwrap().rhs;
        assert_eq!(rhs.len(), 1);
        assert_eq!(model.formula(rhs[0]).id, 10);
        assert_eq!(simulation.name, "decay");
    }

    #[test]
    fn test_value_and_formula_are_exclusive() {
        let mut document = decay_document();
        document["parameters"][0]["formula_id"] = json!(10);
        let err = load_model_str(&document.to_string()).unwrap_err();
        assert_eq!(err.to_string(), "Organism|k has both formula and value attributes");

        let mut document = decay_document();
        document["parameters"][0]
            .as_object_mut()
            .unwrap()
            .remove("value");
        let err = load_model_str(&document.to_string()).unwrap_err();
        assert_eq!(err.to_string(), "Organism|k has neither a formula nor a value");
    }

    #[test]
    fn test_unresolved_reference_names_node() {
        let mut document = decay_document();
        document["formulas"][0]["references"][0]["id"] = json!(99);
        let err = load_model_str(&document.to_string()).unwrap_err();
        assert_eq!(err.to_string(), "Formula 10 references unknown object id 99");
    }

    #[test]
    fn test_cyclic_sum_formulas_are_rejected() {
        let document = |terms_of_21: Value| {
            json!({
                "parameters": [{ "id": 1, "name": "k", "path": "Organism|k", "formula_id": 20 }],
                "formulas": [
                    { "type": "sum", "id": 20, "terms": [{ "formula_id": 21 }] },
                    { "type": "sum", "id": 21, "terms": terms_of_21 },
                    { "type": "constant", "id": 22, "value": 1.5 }
                ]
            })
        };

        let simulation = load_model_str(&document(json!([{ "formula_id": 22 }])).to_string());
        assert!(simulation.is_ok());

        let err = load_model_str(&document(json!([{ "formula_id": 20 }])).to_string()).unwrap_err();
        assert_eq!(err.to_string(), "Cyclic dependencies found for formula 20");

        let err = load_model_str(&document(json!([{ "formula_id": 21 }])).to_string()).unwrap_err();
        assert_eq!(err.to_string(), "Cyclic dependencies found for formula 21");
    }

    #[test]
    fn test_invalid_table_is_rejected() {
        let mut document = decay_document();
        document["formulas"].as_array_mut().unwrap().push(json!({
            "type": "table",
            "id": 11,
            "points": [{ "x": 1.0, "y": 0.0 }, { "x": 0.5, "y": 1.0 }]
        }));
        let err = load_model_str(&document.to_string()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Table formula 11: X values of table formula must be strictly increasing"
        );
    }

    #[test]
    fn test_schema_validation() {
        let report = validate_json(&decay_document().to_string()).unwrap();
        assert!(report.valid);

        let mut document = decay_document();
        document["parameters"][0]["id"] = json!("one");
        let report = validate_json(&document.to_string()).unwrap();
        assert!(!report.valid);
        assert!(!report.errors.is_empty());
    }

    #[test]
    fn test_source_text_is_kept_on_request() {
        let mut document = decay_document();
        let text = document.to_string();
        assert_eq!(load_model_str(&text).unwrap().source_text(), None);

        document["options"]["keep_source_text"] = json!(true);
        let text = document.to_string();
        assert_eq!(load_model_str(&text).unwrap().source_text(), Some(text.as_str()));
    }

    #[test]
    fn test_document_reflects_next_run_values() {
        let mut simulation = load_model_str(&decay_document().to_string()).unwrap();
        simulation
            .set_variable_parameters(&[ParameterInfo::new(1, 0.5)])
            .unwrap();
        simulation.finalize().unwrap();
        simulation
            .set_parameter_values(&[ParameterInfo::new(1, 2.0)])
            .unwrap();

        let document = simulation.to_document().unwrap();
        assert_eq!(document.parameters[0].quantity.value, Some(2.0));

        let reloaded = Simulation::from_document(document).unwrap();
        let k = reloaded.model().quantity_by_id(1).unwrap();
        assert_eq!(reloaded.model().quantity(k).definition, Definition::Value(2.0));
    }
}
