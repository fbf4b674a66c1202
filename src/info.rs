//! Information display module for simulations and their results
//!
//! This module implements `Display` for [`Simulation`] and [`SimulationResult`], rendering
//! quantities, switches and time series as tables.

use std::fmt::{self, Display};

use itertools::Itertools;
use tabled::{builder::Builder, settings::Style};

use crate::formula::{FormulaIdx, FormulaKind};
use crate::model::Model;
use crate::quantity::{Definition, Quantity};
use crate::simulation::result::SimulationResult;
use crate::simulation::Simulation;
use crate::switch::Switch;

impl Display for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let model = self.model();
        let mut builder = Builder::default();
        builder.push_record(vec![format!("Model '{}' ({:?})", self.name, self.state())]);

        let parameters: Vec<&Quantity> = model.quantities().iter().filter(|q| q.is_parameter()).collect();
        let species: Vec<&Quantity> = model.quantities().iter().filter(|q| q.is_species()).collect();
        let observers: Vec<&Quantity> = model.quantities().iter().filter(|q| q.is_observer()).collect();

        if !parameters.is_empty() {
            builder.push_record(vec!["Parameters"]);
            builder.push_record(vec![to_table(&parameters, model, parameter_columns(), parameter_record)]);
        }

        if !species.is_empty() {
            builder.push_record(vec!["Species"]);
            builder.push_record(vec![to_table(&species, model, species_columns(), species_record)]);
        }

        if !observers.is_empty() {
            builder.push_record(vec!["Observers"]);
            builder.push_record(vec![to_table(&observers, model, observer_columns(), observer_record)]);
        }

        if !model.switches().is_empty() {
            let switches: Vec<&Switch> = model.switches().iter().collect();
            builder.push_record(vec!["Switches"]);
            builder.push_record(vec![to_table(&switches, model, switch_columns(), switch_record)]);
        }

        if self.is_finalized() {
            let (lower, upper) = self.bandwidths();
            builder.push_record(vec![format!(
                "{} equations, half-bandwidths {} / {}",
                self.de_size(),
                lower,
                upper
            )]);
        }

        let mut table = builder.build();
        table.with(Style::sharp());
        write!(f, "{}", table)
    }
}

impl Display for SimulationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = Builder::default();

        let mut header = vec!["Time".to_string()];
        header.extend(self.quantities.iter().map(|q| q.path.clone()));
        builder.push_record(header);

        for (i, t) in self.time.iter().enumerate() {
            let mut row = vec![format!("{:.4}", t)];
            row.extend(self.quantities.iter().map(|q| {
                q.value_at(i)
                    .map(|v| format!("{:.6e}", v))
                    .unwrap_or_default()
            }));
            builder.push_record(row);
        }

        let mut table = builder.build();
        table.with(Style::rounded());
        write!(f, "{}", table)
    }
}

/// Renders `items` with the given columns and row function.
fn to_table<T>(
    items: &[T],
    model: &Model,
    columns: Vec<String>,
    record: fn(&T, &Model) -> Vec<String>,
) -> String {
    let mut builder = Builder::default();
    builder.push_record(columns);
    for item in items {
        builder.push_record(record(item, model));
    }

    let mut table = builder.build();
    table.with(Style::rounded());
    table.to_string()
}

fn headers(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

fn parameter_columns() -> Vec<String> {
    headers(&["ID", "Path", "Definition", "Fixed", "Sensitivity", "Used"])
}

fn parameter_record(quantity: &&Quantity, model: &Model) -> Vec<String> {
    let sensitivity = quantity
        .parameter()
        .is_some_and(|p| p.calculate_sensitivity);
    vec![
        quantity.id.to_string(),
        quantity.path.clone(),
        describe_definition(&quantity.definition, model),
        quantity.is_fixed.to_string(),
        sensitivity.to_string(),
        quantity.is_used.to_string(),
    ]
}

fn species_columns() -> Vec<String> {
    headers(&["ID", "Path", "Initial value", "Scale", "ODE index", "Right-hand side"])
}

fn species_record(quantity: &&Quantity, model: &Model) -> Vec<String> {
    let rhs = quantity
        .species()
        .map(|s| {
            s.rhs
                .iter()
                .map(|f| describe_formula(model, *f))
                .join(" + ")
        })
        .unwrap_or_default();
    vec![
        quantity.id.to_string(),
        quantity.path.clone(),
        describe_definition(&quantity.definition, model),
        quantity.scale_factor().to_string(),
        quantity
            .ode_index()
            .map_or_else(|| "constant".to_string(), |i| i.to_string()),
        rhs,
    ]
}

fn observer_columns() -> Vec<String> {
    headers(&["ID", "Path", "Formula"])
}

fn observer_record(quantity: &&Quantity, model: &Model) -> Vec<String> {
    vec![
        quantity.id.to_string(),
        quantity.path.clone(),
        describe_definition(&quantity.definition, model),
    ]
}

fn switch_columns() -> Vec<String> {
    headers(&["ID", "Condition", "One time", "Changes"])
}

fn switch_record(switch: &&Switch, model: &Model) -> Vec<String> {
    let changes = switch
        .changes
        .iter()
        .map(|c| {
            let mode = if c.use_as_value { " (value)" } else { "" };
            format!(
                "{} := {}{}",
                model.quantity(c.target).path,
                describe_formula(model, c.new_formula),
                mode
            )
        })
        .join("\n");
    vec![
        switch.id.to_string(),
        describe_formula(model, switch.condition),
        switch.one_time.to_string(),
        changes,
    ]
}

fn describe_definition(definition: &Definition, model: &Model) -> String {
    match definition {
        Definition::Value(v) => v.to_string(),
        Definition::Formula(f) => describe_formula(model, *f),
    }
}

fn describe_formula(model: &Model, idx: FormulaIdx) -> String {
    let formula = model.formula(idx);
    match &formula.kind {
        FormulaKind::Constant(v) => v.to_string(),
        FormulaKind::Explicit(explicit) => explicit.current_equation(),
        FormulaKind::Sum(terms) => terms
            .iter()
            .map(|t| format!("{} * ({})", t.weight, describe_formula(model, t.formula)))
            .join(" + "),
        FormulaKind::Table(table) => format!("table of {} points", table.points().len()),
        FormulaKind::TableWithOffset { table, offset } => format!(
            "{}(Time - {})",
            model.quantity(*table).path,
            model.quantity(*offset).path
        ),
        FormulaKind::TableWithXArgument { table, argument } => format!(
            "{}({})",
            model.quantity(*table).path,
            model.quantity(*argument).path
        ),
    }
}

#[cfg(test)]
mod tests {
    use crate::io::load_model_str;

    #[test]
    fn test_display_lists_sections() {
        let text = serde_json::json!({
            "name": "decay",
            "parameters": [{ "id": 1, "name": "k", "path": "Organism|k", "value": 0.5 }],
            "species": [{ "id": 2, "name": "A", "path": "Organism|A", "value": 1.0, "rhs": [10] }],
            "formulas": [{
                "type": "explicit",
                "id": 10,
                "equation": "-k * A",
                "references": [{ "alias": "k", "id": 1 }, { "alias": "A", "id": 2 }]
            }]
        })
        .to_string();

        let simulation = load_model_str(&text).unwrap();
        let rendered = simulation.to_string();
        assert!(rendered.contains("Parameters"));
        assert!(rendered.contains("Organism|A"));
        assert!(rendered.contains("Right-hand side"));
        assert!(rendered.contains("Organism|k"));
        assert!(!rendered.contains("Switches"));
    }
}
