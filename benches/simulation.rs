use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use odemodel::prelude::*;
use serde_json::{json, Value};

/// Linear chain of `n` species, each draining into the next one.
fn chain_document(n: u64, banded: bool, sensitivities: bool) -> Value {
    let mut species = Vec::new();
    let mut formulas = Vec::new();

    for i in 0..n {
        let id = 100 + i;
        let rhs_id = 1000 + i;
        species.push(json!({
            "id": id,
            "name": format!("S{}", i),
            "path": format!("Chain|S{}", i),
            "value": if i == 0 { 1.0 } else { 0.0 },
            "rhs": [rhs_id]
        }));

        let (equation, references) = if i == 0 {
            ("-k * X".to_string(), json!([{ "alias": "k", "id": 1 }, { "alias": "X", "id": id }]))
        } else {
            (
                "k * P - k * X".to_string(),
                json!([
                    { "alias": "k", "id": 1 },
                    { "alias": "P", "id": id - 1 },
                    { "alias": "X", "id": id }
                ]),
            )
        };
        formulas.push(json!({
            "type": "explicit",
            "id": rhs_id,
            "equation": equation,
            "references": references
        }));
    }

    json!({
        "name": "chain",
        "options": { "write_log_file": false },
        "solver": { "use_banded_jacobian": banded, "max_step": 0.05 },
        "output_schema": { "intervals": [{ "start": 0.0, "end": 10.0, "points": 101 }] },
        "parameters": [{
            "id": 1,
            "name": "k",
            "path": "Chain|k",
            "value": 0.3,
            "fixed": !sensitivities,
            "calculate_sensitivity": sensitivities
        }],
        "species": species,
        "formulas": formulas
    })
}

fn finalized(document: &Value) -> Simulation {
    let mut simulation =
        load_model_str(&document.to_string()).expect("Failed to load benchmark model");
    simulation
        .finalize()
        .expect("Failed to finalize benchmark model");
    simulation
}

fn benchmark_simulation(c: &mut Criterion) {
    let document = chain_document(20, false, false);
    let sensitivity_document = chain_document(20, false, true);

    c.bench_function("finalize_chain", |b| {
        let banded = chain_document(20, true, false);
        b.iter(|| black_box(finalized(black_box(&banded))));
    });

    let mut simulation = finalized(&document);
    c.bench_function("run_chain_rk4", |b| {
        b.iter(|| {
            let _ = black_box(simulation.run(&RK4));
        });
    });

    let mut simulation = finalized(&sensitivity_document);
    c.bench_function("run_chain_sensitivities_rk4", |b| {
        b.iter(|| {
            let _ = black_box(simulation.run(&RK4));
        });
    });
}

criterion_group!(benches, benchmark_simulation);
criterion_main!(benches);
