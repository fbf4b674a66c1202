//! Piecewise linear lookup tables.
//!
//! A [`Table`] maps an argument (usually time) to a value by linear interpolation between
//! sorted support points. In derived mode the table instead returns the slope of the
//! interval containing the argument, which is how rate tables are fed into right-hand
//! sides.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Support point of a table.
///
/// # Fields
///
/// * `x` - Argument value, strictly increasing across the table
/// * `y` - Value at `x`
/// * `restart` - Whether the integrator must restart when the argument passes `x`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TablePoint {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub restart: bool,
}

impl TablePoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            restart: false,
        }
    }

    pub fn with_restart(x: f64, y: f64) -> Self {
        Self { x, y, restart: true }
    }
}

/// Validation failures of table construction.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TableError {
    #[error("Table formula must have at least {0} value point(s)")]
    TooFewPoints(usize),
    #[error("X values of table formula must be strictly increasing")]
    NotIncreasing,
}

/// Lookup table with cached interval slopes and restart points.
///
/// Cloning copies every cached vector, so a clone is independent of the original.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    points: Vec<TablePoint>,
    use_derived_values: bool,
    slopes: Vec<f64>,
    restart_times: Vec<f64>,
}

impl Table {
    /// Creates a table and caches slopes and restart points.
    ///
    /// # Arguments
    ///
    /// * `points` - Support points with strictly increasing `x`
    /// * `use_derived_values` - Return interval slopes instead of interpolated values
    ///
    /// # Returns
    ///
    /// Returns a [`TableError`] if there are too few points (2 in derived mode, 1
    /// otherwise) or if the `x` values are not strictly increasing.
    pub fn new(points: Vec<TablePoint>, use_derived_values: bool) -> Result<Self, TableError> {
        let required = if use_derived_values { 2 } else { 1 };
        if points.len() < required {
            return Err(TableError::TooFewPoints(required));
        }
        if points.windows(2).any(|w| w[0].x >= w[1].x) {
            return Err(TableError::NotIncreasing);
        }

        let slopes: Vec<f64> = points
            .windows(2)
            .map(|w| (w[1].y - w[0].y) / (w[1].x - w[0].x))
            .collect();

        let mut restart_times = vec![points[0].x];
        restart_times.extend(points.iter().skip(1).filter(|p| p.restart).map(|p| p.x));

        if use_derived_values {
            // a rate switching on after a flat interval is a discontinuity
            for i in 1..slopes.len() {
                if slopes[i - 1] == 0.0 && slopes[i] != 0.0 && !points[i].restart {
                    restart_times.push(points[i].x);
                }
            }
        }

        Ok(Self {
            points,
            use_derived_values,
            slopes,
            restart_times,
        })
    }

    pub fn points(&self) -> &[TablePoint] {
        &self.points
    }

    pub fn use_derived_values(&self) -> bool {
        self.use_derived_values
    }

    /// Replaces the support points, keeping the interpolation mode.
    pub fn set_points(&mut self, points: Vec<TablePoint>) -> Result<(), TableError> {
        *self = Table::new(points, self.use_derived_values)?;
        Ok(())
    }

    /// Restart points in the order they were collected: the first `x`, flagged points,
    /// then derived-mode interval starts.
    pub fn restart_time_points(&self) -> &[f64] {
        &self.restart_times
    }

    /// Value of the table at `x`.
    pub fn value_at(&self, x: f64) -> f64 {
        let first = &self.points[0];
        let last = &self.points[self.points.len() - 1];

        if self.use_derived_values {
            if x < first.x || x >= last.x {
                return 0.0;
            }
            return self.slopes[self.interval_of(x)];
        }

        if x <= first.x {
            return first.y;
        }
        if x >= last.x {
            return last.y;
        }
        let i = self.interval_of(x);
        self.points[i].y + (x - self.points[i].x) * self.slopes[i]
    }

    /// Derivative of [`Table::value_at`] with respect to its argument.
    ///
    /// Zero in derived mode and outside the support range.
    pub fn derivative_at(&self, x: f64) -> f64 {
        let first = &self.points[0];
        let last = &self.points[self.points.len() - 1];
        if self.use_derived_values || x <= first.x || x >= last.x {
            return 0.0;
        }
        self.slopes[self.interval_of(x)]
    }

    /// True if the table yields the same value for every argument.
    pub fn is_constant(&self) -> bool {
        if self.use_derived_values {
            self.slopes.iter().all(|s| *s == 0.0)
        } else {
            self.points.windows(2).all(|w| w[0].y == w[1].y)
        }
    }

    /// The single value of a constant table.
    pub fn constant_value(&self) -> Option<f64> {
        self.is_constant().then(|| self.value_at(self.points[0].x))
    }

    /// Index `i` of the interval `[x_i, x_{i+1})` containing `x`; requires `x_0 <= x < x_last`.
    fn interval_of(&self, x: f64) -> usize {
        let upper = self.points.partition_point(|p| p.x <= x);
        upper.saturating_sub(1).min(self.slopes.len().saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;

    use super::*;

    fn example_points() -> Vec<TablePoint> {
        vec![
            TablePoint::new(0.0, 0.0),
            TablePoint::new(1.0, 2.0),
            TablePoint::with_restart(5.0, 3.0),
            TablePoint::new(20.0, 6.0),
            TablePoint::with_restart(40.0, 6.0),
            TablePoint::new(41.0, 8.0),
        ]
    }

    #[test]
    fn test_direct_mode_values() {
        let table = Table::new(example_points(), false).unwrap();

        let expected = [
            (-1.0, 0.0),
            (0.0, 0.0),
            (0.5, 1.0),
            (1.0, 2.0),
            (3.0, 2.5),
            (5.0, 3.0),
            (10.0, 4.0),
            (20.0, 6.0),
            (40.0, 6.0),
            (40.5, 7.0),
            (42.0, 8.0),
        ];
        for (x, y) in expected {
            assert_relative_eq!(table.value_at(x), y, epsilon = 1e-12);
        }

        assert_eq!(table.restart_time_points(), &[0.0, 5.0, 40.0]);
    }

    #[test]
    fn test_derived_mode_values() {
        let table = Table::new(example_points(), true).unwrap();

        let expected = [
            (-1.0, 0.0),
            (0.0, 2.0),
            (1.0, 0.25),
            (5.0, 0.2),
            (20.0, 0.0),
            (40.0, 2.0),
            (42.0, 0.0),
        ];
        for (x, y) in expected {
            assert_relative_eq!(table.value_at(x), y, epsilon = 1e-12);
        }

        // 40 already flagged, nothing added
        assert_eq!(table.restart_time_points(), &[0.0, 5.0, 40.0]);
    }

    #[test]
    fn test_derived_mode_adds_rate_onset() {
        let points = vec![
            TablePoint::new(0.0, 1.0),
            TablePoint::new(2.0, 1.0),
            TablePoint::new(3.0, 4.0),
        ];
        let table = Table::new(points.clone(), true).unwrap();
        assert_eq!(table.restart_time_points(), &[0.0, 2.0]);

        let table = Table::new(points, false).unwrap();
        assert_eq!(table.restart_time_points(), &[0.0]);
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            Table::new(vec![TablePoint::new(0.0, 1.0)], true),
            Err(TableError::TooFewPoints(2))
        );
        assert_eq!(Table::new(vec![], false), Err(TableError::TooFewPoints(1)));
        assert_eq!(
            Table::new(
                vec![TablePoint::new(1.0, 1.0), TablePoint::new(1.0, 2.0)],
                false
            ),
            Err(TableError::NotIncreasing)
        );
    }

    #[test]
    fn test_single_point_table_is_constant() {
        let table = Table::new(vec![TablePoint::new(3.0, 7.0)], false).unwrap();
        assert_eq!(table.value_at(-10.0), 7.0);
        assert_eq!(table.value_at(10.0), 7.0);
        assert_eq!(table.constant_value(), Some(7.0));
        assert_eq!(table.derivative_at(3.0), 0.0);
    }

    #[test]
    fn test_clone_is_independent() {
        let table = Table::new(example_points(), false).unwrap();
        let mut copy = table.clone();
        copy.set_points(vec![TablePoint::new(0.0, 1.0)]).unwrap();

        assert_eq!(table.points().len(), 6);
        assert_eq!(copy.value_at(5.0), 1.0);
        assert_relative_eq!(table.value_at(3.0), 2.5);
    }
}
