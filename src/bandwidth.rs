//! Bandwidth Reduction Module
//!
//! This module reorders the ODE variables of a finalized system so that the Jacobian
//! becomes as narrow-banded as possible.
//!
//! # Key Components
//!
//! - [`Adjacency`]: compressed undirected adjacency structure of the variable graph
//! - [`reverse_cuthill_mckee`]: computes the reordering permutation
//! - [`check_permutation`]: validates that a permutation is a bijection on `0..n`
//! - [`half_bandwidths`]: lower/upper half-bandwidths of a dependency pattern
//! - [`BandMatrix`]: band storage of a Jacobian sized by the half-bandwidths
//!
//! Permutations are returned as `perm[new_position] = old_index`.

use std::collections::BTreeSet;

use nalgebra::DMatrix;

use crate::error::ModelError;

/// Undirected adjacency of a square boolean pattern in compressed row form.
///
/// Neighbours of node `i` are `neighbours[row_offsets[i]..row_offsets[i + 1]]`,
/// sorted ascending. Diagonal entries are ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct Adjacency {
    pub row_offsets: Vec<usize>,
    pub neighbours: Vec<usize>,
}

impl Adjacency {
    /// Builds the adjacency of the symmetrized `matrix`.
    ///
    /// # Returns
    ///
    /// Returns an error if `matrix` is not square.
    pub fn from_matrix(matrix: &[Vec<bool>]) -> Result<Self, ModelError> {
        let mut symmetric = matrix.to_vec();
        symmetrize(&mut symmetric)?;

        let mut row_offsets = Vec::with_capacity(symmetric.len() + 1);
        let mut neighbours = Vec::new();
        row_offsets.push(0);

        for (row, entries) in symmetric.iter().enumerate() {
            neighbours.extend(
                entries
                    .iter()
                    .enumerate()
                    .filter(|(column, set)| **set && *column != row)
                    .map(|(column, _)| column),
            );
            row_offsets.push(neighbours.len());
        }

        Ok(Self {
            row_offsets,
            neighbours,
        })
    }

    pub fn node_count(&self) -> usize {
        self.row_offsets.len().saturating_sub(1)
    }

    pub fn adjacency_count(&self) -> usize {
        self.neighbours.len()
    }

    pub fn neighbours_of(&self, node: usize) -> &[usize] {
        &self.neighbours[self.row_offsets[node]..self.row_offsets[node + 1]]
    }

    /// Number of neighbours of `node` still available in `mask`.
    fn masked_degree(&self, node: usize, mask: &[bool]) -> usize {
        self.neighbours_of(node)
            .iter()
            .filter(|n| mask[**n])
            .count()
    }
}

/// Makes `matrix` symmetric in place: `M[i][j] = M[j][i] = M[i][j] || M[j][i]`.
pub fn symmetrize(matrix: &mut [Vec<bool>]) -> Result<(), ModelError> {
    let n = matrix.len();
    if matrix.iter().any(|row| row.len() != n) {
        return Err(ModelError::InvalidPermutation(
            "matrix with invalid structure passed".into(),
        ));
    }

    for row in 0..n {
        for column in 0..row {
            let set = matrix[row][column] || matrix[column][row];
            matrix[row][column] = set;
            matrix[column][row] = set;
        }
    }
    Ok(())
}

/// Computes a bandwidth-reducing permutation of the nodes of `matrix`.
///
/// The matrix is symmetrized first. Each connected component is ordered by a
/// breadth-first search starting at a pseudo-peripheral root; the component ordering
/// is reversed. Components follow each other in order of their lowest node.
///
/// # Arguments
///
/// * `matrix` - Square boolean dependency pattern, row `i` being the variables equation `i` uses
///
/// # Returns
///
/// Returns `perm` with `perm[new_position] = old_index`, validated to be a permutation.
pub fn reverse_cuthill_mckee(matrix: &[Vec<bool>]) -> Result<Vec<usize>, ModelError> {
    let adjacency = Adjacency::from_matrix(matrix)?;
    let n = adjacency.node_count();

    let mut mask = vec![true; n];
    let mut permutation = Vec::with_capacity(n);

    for node in 0..n {
        if !mask[node] {
            continue;
        }
        let root = find_root(node, &adjacency, &mut mask);
        permutation.extend(order_component(root, &adjacency, &mut mask));
    }

    check_permutation(&permutation, n)?;
    Ok(permutation)
}

/// Validates that `permutation` contains every index of `0..node_count` exactly once.
pub fn check_permutation(permutation: &[usize], node_count: usize) -> Result<(), ModelError> {
    const PREFIX: &str = "RCM produced invalid indices permutation";

    if permutation.len() != node_count {
        return Err(ModelError::InvalidPermutation(format!(
            "{}: number of permutated indices does not match the number of nodes",
            PREFIX
        )));
    }

    let present: BTreeSet<usize> = permutation.iter().copied().collect();
    if let Some(missing) = (0..node_count).find(|i| !present.contains(i)) {
        return Err(ModelError::InvalidPermutation(format!(
            "{}: index {} not available",
            PREFIX, missing
        )));
    }
    Ok(())
}

/// Rooted level structure of a connected component.
struct LevelStructure {
    nodes: Vec<usize>,
    level_starts: Vec<usize>,
}

impl LevelStructure {
    fn depth(&self) -> usize {
        self.level_starts.len()
    }

    fn last_level(&self) -> &[usize] {
        let start = self.level_starts.last().copied().unwrap_or(0);
        &self.nodes[start..]
    }
}

/// Breadth-first level structure rooted at `root` over the nodes available in `mask`.
/// `mask` is left unchanged.
fn level_structure(root: usize, adjacency: &Adjacency, mask: &mut [bool]) -> LevelStructure {
    let mut nodes = vec![root];
    let mut level_starts = Vec::new();
    mask[root] = false;

    let mut level_end = 0;
    loop {
        let level_begin = level_end;
        level_end = nodes.len();
        level_starts.push(level_begin);

        for i in level_begin..level_end {
            for &neighbour in adjacency.neighbours_of(nodes[i]) {
                if mask[neighbour] {
                    mask[neighbour] = false;
                    nodes.push(neighbour);
                }
            }
        }

        if nodes.len() == level_end {
            break;
        }
    }

    for node in &nodes {
        mask[*node] = true;
    }

    LevelStructure {
        nodes,
        level_starts,
    }
}

/// Finds a pseudo-peripheral node of the component containing `start`.
fn find_root(start: usize, adjacency: &Adjacency, mask: &mut [bool]) -> usize {
    let mut root = start;
    let mut levels = level_structure(root, adjacency, mask);
    let component_size = levels.nodes.len();

    if levels.depth() == 1 || levels.depth() == component_size {
        return root;
    }

    loop {
        // lowest-degree node of the last level; ties keep the earliest node
        let candidates = levels.last_level();
        root = candidates[0];
        let mut min_degree = component_size;
        if candidates.len() > 1 {
            for &node in candidates {
                let degree = adjacency.masked_degree(node, mask);
                if degree < min_degree {
                    root = node;
                    min_degree = degree;
                }
            }
        }

        let next = level_structure(root, adjacency, mask);
        if next.depth() <= levels.depth() {
            break;
        }
        levels = next;
        if component_size <= levels.depth() {
            break;
        }
    }

    root
}

/// Degrees (restricted to `mask`) of all nodes in the component of `root`.
fn component_degrees(root: usize, adjacency: &Adjacency, mask: &[bool]) -> Vec<usize> {
    let mut degrees = vec![0; adjacency.node_count()];
    let mut visited = vec![false; adjacency.node_count()];
    let mut queue = vec![root];
    visited[root] = true;

    let mut i = 0;
    while i < queue.len() {
        let node = queue[i];
        for &neighbour in adjacency.neighbours_of(node) {
            if mask[neighbour] {
                degrees[node] += 1;
                if !visited[neighbour] {
                    visited[neighbour] = true;
                    queue.push(neighbour);
                }
            }
        }
        i += 1;
    }

    degrees
}

/// Cuthill-McKee ordering of the component of `root`, reversed.
fn order_component(root: usize, adjacency: &Adjacency, mask: &mut [bool]) -> Vec<usize> {
    let degrees = component_degrees(root, adjacency, mask);
    let mut order = vec![root];
    mask[root] = false;

    let mut level_end = 0;
    while level_end < order.len() {
        let level_begin = level_end;
        level_end = order.len();

        for i in level_begin..level_end {
            let first_new = order.len();
            for &neighbour in adjacency.neighbours_of(order[i]) {
                if mask[neighbour] {
                    mask[neighbour] = false;
                    order.push(neighbour);
                }
            }

            // stable sort by increasing degree; the first discovered neighbour keeps its place
            if order.len() > first_new + 1 {
                order[first_new + 1..].sort_by_key(|node| degrees[*node]);
            }
        }
    }

    order.reverse();
    order
}

/// Lower and upper half-bandwidths of a dependency pattern.
///
/// `used[i]` lists the variables row `i` depends on. Upper is the largest `j - i`,
/// lower the largest `i - j` over all dependencies.
pub fn half_bandwidths(used: &[Vec<usize>]) -> (usize, usize) {
    used.iter()
        .enumerate()
        .flat_map(|(row, columns)| {
            columns
                .iter()
                .map(move |column| (row.saturating_sub(*column), column.saturating_sub(row)))
        })
        .fold((0, 0), |(lower, upper), (l, u)| (lower.max(l), upper.max(u)))
}

/// Square matrix in band storage.
///
/// Element `(i, j)` with `-lower <= j - i <= upper` is stored at row `upper + i - j`
/// of column `j`, as banded linear solvers expect it.
#[derive(Debug, Clone, PartialEq)]
pub struct BandMatrix {
    size: usize,
    lower: usize,
    upper: usize,
    data: DMatrix<f64>,
}

impl BandMatrix {
    pub fn zeros(size: usize, lower: usize, upper: usize) -> Self {
        Self {
            size,
            lower,
            upper,
            data: DMatrix::zeros(lower + upper + 1, size),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn bandwidths(&self) -> (usize, usize) {
        (self.lower, self.upper)
    }

    fn storage_row(&self, row: usize, column: usize) -> Option<usize> {
        if row >= self.size || column >= self.size {
            return None;
        }
        let shifted = self.upper + row;
        (shifted >= column && shifted - column <= self.lower + self.upper)
            .then(|| shifted - column)
    }

    /// Element `(row, column)`, zero outside the band.
    pub fn get(&self, row: usize, column: usize) -> f64 {
        self.storage_row(row, column)
            .map(|r| self.data[(r, column)])
            .unwrap_or(0.0)
    }

    /// Adds `value` to `(row, column)`; returns false if the element lies outside the band.
    pub fn add(&mut self, row: usize, column: usize, value: f64) -> bool {
        match self.storage_row(row, column) {
            Some(r) => {
                self.data[(r, column)] += value;
                true
            }
            None => false,
        }
    }

    pub fn fill_zero(&mut self) {
        self.data.fill(0.0);
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.size, self.size, |i, j| self.get(i, j))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn pattern(n: usize, entries: &[(usize, usize)]) -> Vec<Vec<bool>> {
        let mut matrix = vec![vec![false; n]; n];
        for (i, j) in entries {
            matrix[*i][*j] = true;
        }
        matrix
    }

    fn example_matrix() -> Vec<Vec<bool>> {
        pattern(
            10,
            &[
                (0, 3),
                (0, 5),
                (1, 2),
                (1, 4),
                (1, 6),
                (1, 9),
                (2, 1),
                (2, 3),
                (2, 4),
                (3, 0),
                (3, 2),
                (3, 5),
                (3, 8),
                (4, 1),
                (4, 2),
                (4, 6),
                (5, 0),
                (5, 3),
                (5, 6),
                (5, 7),
                (6, 1),
                (6, 4),
                (6, 5),
                (6, 7),
                (7, 5),
                (7, 6),
                (8, 3),
                (9, 1),
            ],
        )
    }

    #[test]
    fn test_adjacency_structure() {
        let adjacency = Adjacency::from_matrix(&example_matrix()).unwrap();

        assert_eq!(adjacency.adjacency_count(), 28);
        assert_eq!(
            adjacency.row_offsets,
            vec![0, 2, 6, 9, 13, 16, 20, 24, 26, 27, 28]
        );
        assert_eq!(
            adjacency.neighbours,
            vec![
                3, 5, 2, 4, 6, 9, 1, 3, 4, 0, 2, 5, 8, 1, 2, 6, 0, 3, 6, 7, 1, 4, 5, 7, 5, 6,
                3, 1
            ]
        );
    }

    #[test]
    fn test_rcm_permutation() {
        let permutation = reverse_cuthill_mckee(&example_matrix()).unwrap();
        assert_eq!(permutation, vec![8, 0, 7, 5, 3, 6, 4, 2, 1, 9]);
    }

    #[test]
    fn test_rcm_symmetrizes_one_sided_pattern() {
        // upper triangle only: 0-1, 1-2 chain plus isolated 3
        let permutation = reverse_cuthill_mckee(&pattern(4, &[(0, 1), (1, 2)])).unwrap();
        check_permutation(&permutation, 4).unwrap();
        assert_eq!(permutation[3], 3);
    }

    #[test]
    fn test_rcm_is_bijection_on_varied_patterns() {
        let mut rng = StdRng::seed_from_u64(0x2545_F491_4F6C_DD1D);
        for n in 0..25 {
            let mut matrix = vec![vec![false; n]; n];
            for row in matrix.iter_mut() {
                for entry in row.iter_mut() {
                    *entry = rng.gen_range(0..5) == 0;
                }
            }
            let permutation = reverse_cuthill_mckee(&matrix).unwrap();
            check_permutation(&permutation, n).unwrap();
        }
    }

    #[test]
    fn test_check_permutation_errors() {
        let err = check_permutation(&[0, 1], 3).unwrap_err();
        assert!(err
            .to_string()
            .contains("number of permutated indices does not match the number of nodes"));

        let err = check_permutation(&[0, 0, 2], 3).unwrap_err();
        assert!(err.to_string().contains("index 1 not available"));
    }

    #[test]
    fn test_rcm_reduces_bandwidth_of_example() {
        let matrix = example_matrix();
        let used: Vec<Vec<usize>> = matrix
            .iter()
            .map(|row| (0..row.len()).filter(|j| row[*j]).collect())
            .collect();
        let before = half_bandwidths(&used);

        let permutation = reverse_cuthill_mckee(&matrix).unwrap();
        let mut new_index = vec![0; permutation.len()];
        for (new, old) in permutation.iter().enumerate() {
            new_index[*old] = new;
        }
        let reordered: Vec<Vec<usize>> = permutation
            .iter()
            .map(|old| used[*old].iter().map(|j| new_index[*j]).collect())
            .collect();
        let after = half_bandwidths(&reordered);

        assert_eq!(before, (8, 8));
        assert!(after.0 < before.0 && after.1 < before.1);
    }

    #[test]
    fn test_band_matrix_storage() {
        let mut band = BandMatrix::zeros(4, 1, 2);
        assert!(band.add(0, 2, 3.0));
        assert!(band.add(2, 1, -1.0));
        assert!(band.add(2, 1, -1.0));
        assert!(!band.add(3, 0, 1.0));

        assert_eq!(band.get(0, 2), 3.0);
        assert_eq!(band.get(2, 1), -2.0);
        assert_eq!(band.get(3, 0), 0.0);

        let dense = band.to_dense();
        assert_eq!(dense[(0, 2)], 3.0);
        assert_eq!(dense[(2, 1)], -2.0);
    }
}
