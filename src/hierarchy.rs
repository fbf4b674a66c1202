//! Hierarchical leveling of parameters and species.
//!
//! Every parameter and species is a node; it has an edge to each quantity its
//! definition reads. The level of a node is one more than the highest level among the
//! nodes it uses, so evaluating level by level always sees dependencies first.

use crate::error::ModelError;
use crate::formula::{FormulaIdx, FormulaKind};
use crate::model::Model;
use crate::quantity::QuantityIdx;

/// Leveled parameters and species of a model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Hierarchy {
    /// Nodes grouped by level, lowest level first.
    pub levels: Vec<Vec<QuantityIdx>>,
}

impl Hierarchy {
    /// Levels the parameters and species of `model` and stores each level on its quantity.
    ///
    /// # Arguments
    ///
    /// * `model` - Model whose quantities are leveled
    /// * `check_cycles` - Fail with [`ModelError::CyclicDependency`] if a node reaches itself
    pub fn build(model: &mut Model, check_cycles: bool) -> Result<Self, ModelError> {
        if check_cycles {
            if let Some(f) = find_cyclic_formula(model) {
                return Err(ModelError::CyclicDependency {
                    path: format!("formula {}", model.formula(f).id),
                });
            }
        }

        let nodes: Vec<QuantityIdx> = model
            .quantity_indices()
            .filter(|q| !model.quantity(*q).is_observer())
            .collect();

        let mut position = vec![usize::MAX; model.quantities().len()];
        for (i, q) in nodes.iter().enumerate() {
            position[q.0] = i;
        }

        let edges: Vec<Vec<usize>> = nodes
            .iter()
            .map(|q| {
                model
                    .used_quantities(*q)
                    .into_iter()
                    .map(|used| position[used.0])
                    .filter(|p| *p != usize::MAX)
                    .collect()
            })
            .collect();

        if check_cycles {
            if let Some(node) = find_cyclic_node(&edges) {
                return Err(ModelError::CyclicDependency {
                    path: model.quantity(nodes[node]).path.clone(),
                });
            }
        }

        let node_levels = assign_levels(&edges);
        let top = node_levels.iter().copied().max().map_or(0, |l| l + 1);
        let mut levels = vec![Vec::new(); top];
        for (i, q) in nodes.iter().enumerate() {
            model.quantity_mut(*q).level = node_levels[i];
            levels[node_levels[i]].push(*q);
        }

        log::debug!(
            "Leveled {} quantities into {} levels",
            nodes.len(),
            levels.len()
        );

        Ok(Self { levels })
    }

    /// All leveled quantities, dependencies before dependents.
    pub fn ordered(&self) -> impl Iterator<Item = QuantityIdx> + '_ {
        self.levels.iter().flatten().copied()
    }
}

/// Iterates `level(u) = max(level(v) for u -> v) + 1` to a fixed point.
///
/// Nodes without dependencies stay at level 0. The iteration is bounded by the node
/// count, so a cyclic graph still terminates, with meaningless levels.
pub fn assign_levels(edges: &[Vec<usize>]) -> Vec<usize> {
    let mut levels = vec![0usize; edges.len()];

    for _ in 0..=edges.len() {
        let mut changed = false;
        for (node, used) in edges.iter().enumerate() {
            let level = used.iter().map(|v| levels[*v] + 1).max().unwrap_or(0);
            if level != levels[node] {
                levels[node] = level;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    levels
}

/// First node that reaches itself through the `edges`, if any.
///
/// The reachability set of every node is grown by repeated relaxation until it stops
/// changing.
pub fn find_cyclic_node(edges: &[Vec<usize>]) -> Option<usize> {
    let n = edges.len();

    for start in 0..n {
        let mut reached = vec![false; n];
        for v in &edges[start] {
            reached[*v] = true;
        }

        let mut changed = true;
        while changed && !reached[start] {
            changed = false;
            for node in 0..n {
                if !reached[node] {
                    continue;
                }
                for v in &edges[node] {
                    if !reached[*v] {
                        reached[*v] = true;
                        changed = true;
                    }
                }
            }
        }

        if reached[start] {
            return Some(start);
        }
    }

    None
}

/// First formula that reaches itself through sum terms, if any.
///
/// Sums are the only formula-to-formula edges; everything else goes through
/// quantities and is covered by [`find_cyclic_node`].
pub fn find_cyclic_formula(model: &Model) -> Option<FormulaIdx> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Open,
        Done,
    }

    let terms = |f: usize| -> Vec<usize> {
        match &model.formulas()[f].kind {
            FormulaKind::Sum(terms) => terms.iter().map(|t| t.formula.0).collect(),
            _ => Vec::new(),
        }
    };

    let n = model.formulas().len();
    let mut marks = vec![Mark::New; n];

    for root in 0..n {
        if marks[root] != Mark::New {
            continue;
        }
        marks[root] = Mark::Open;
        let mut stack = vec![(root, terms(root), 0usize)];

        while let Some((node, children, next)) = stack.last_mut() {
            let node = *node;
            let Some(child) = children.get(*next).copied() else {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            };
            *next += 1;

            let mark = marks[child];
            match mark {
                Mark::Open => return Some(FormulaIdx(child)),
                Mark::New => {
                    marks[child] = Mark::Open;
                    stack.push((child, terms(child), 0));
                }
                Mark::Done => {}
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::formula::{Formula, SumTerm};
    use crate::model::tests::{explicit, formula_parameter, parameter};

    /// Random DAG: edges only point from a node to nodes earlier in a shuffled order.
    fn random_dag(rng: &mut StdRng, n: usize) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..n).collect();
        for i in (1..n).rev() {
            order.swap(i, rng.gen_range(0..=i));
        }

        let mut edges = vec![Vec::new(); n];
        for i in 1..n {
            for j in 0..i {
                if rng.gen_range(0..4) == 0 {
                    edges[order[i]].push(order[j]);
                }
            }
        }
        edges
    }

    #[test]
    fn test_levels_respect_every_edge() {
        let mut rng = StdRng::seed_from_u64(0x9E37_79B9_7F4A_7C15);

        for n in 1..40 {
            let edges = random_dag(&mut rng, n);
            assert_eq!(find_cyclic_node(&edges), None);

            let levels = assign_levels(&edges);
            for (u, used) in edges.iter().enumerate() {
                for v in used {
                    assert!(levels[u] > levels[*v], "edge {} -> {}", u, v);
                }
                if used.is_empty() {
                    assert_eq!(levels[u], 0);
                }
            }
        }
    }

    #[test]
    fn test_cycles_are_detected() {
        let mut rng = StdRng::seed_from_u64(42);

        for n in 2..30 {
            let mut edges = random_dag(&mut rng, n);
            let levels = assign_levels(&edges);

            // walk down from a highest node and close the path back to it
            let high = (0..n).max_by_key(|i| levels[*i]).unwrap();
            let mut low = high;
            while let Some(next) = edges[low].first() {
                low = *next;
            }
            edges[low].push(high);
            assert!(find_cyclic_node(&edges).is_some());
        }

        assert_eq!(find_cyclic_node(&[vec![0]]), Some(0));
        assert_eq!(find_cyclic_node(&[vec![1], vec![2], vec![0]]), Some(0));
    }

    #[test]
    fn test_build_levels_model() {
        let mut model = Model::new();
        let k = parameter(&mut model, 1, 2.0);
        let f = explicit(&mut model, 10, "2 * k", &[("k", Some(k))]);
        let p = formula_parameter(&mut model, 2, f);
        let g = explicit(&mut model, 11, "p + k", &[("p", Some(p)), ("k", Some(k))]);
        let q = formula_parameter(&mut model, 3, g);

        let hierarchy = Hierarchy::build(&mut model, true).unwrap();
        assert_eq!(hierarchy.levels, vec![vec![k], vec![p], vec![q]]);
        assert_eq!(model.quantity(q).level, 2);
        assert_eq!(hierarchy.ordered().collect::<Vec<_>>(), vec![k, p, q]);
    }

    #[test]
    fn test_build_reports_cycle_path() {
        let mut model = Model::new();
        let f = explicit(&mut model, 10, "b + 1", &[("b", Some(QuantityIdx(1)))]);
        let g = explicit(&mut model, 11, "a * 2", &[("a", Some(QuantityIdx(0)))]);
        formula_parameter(&mut model, 1, f);
        formula_parameter(&mut model, 2, g);

        let err = Hierarchy::build(&mut model, true).unwrap_err();
        assert_eq!(err.to_string(), "Cyclic dependencies found for Organism|P1");
    }

    #[test]
    fn test_sum_cycles_are_detected() {
        let mut model = Model::new();
        let k = parameter(&mut model, 1, 2.0);
        let leaf = explicit(&mut model, 10, "k", &[("k", Some(k))]);
        let inner = model
            .add_formula(Formula::new(11, FormulaKind::Sum(Vec::new())))
            .unwrap();
        let outer = model
            .add_formula(Formula::new(
                12,
                FormulaKind::Sum(vec![
                    SumTerm { weight: 1.0, formula: inner },
                    SumTerm { weight: 2.0, formula: leaf },
                ]),
            ))
            .unwrap();
        formula_parameter(&mut model, 2, outer);
        assert_eq!(find_cyclic_formula(&model), None);

        // inner -> outer -> inner
        model.formula_mut(inner).kind = FormulaKind::Sum(vec![SumTerm {
            weight: 1.0,
            formula: outer,
        }]);
        assert!(find_cyclic_formula(&model).is_some());

        let err = Hierarchy::build(&mut model, true).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Cyclic dependencies found for formula"));
    }
}
