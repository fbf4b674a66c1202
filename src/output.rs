//! Output Schema Module
//!
//! This module defines where a simulation reports its solution and where the integrator
//! has to stop for discontinuities.
//!
//! # Key Components
//!
//! - [`OutputSchema`]: user-facing intervals and discrete output times
//! - [`OutputInterval`]: start/end/point count with an [`IntervalDistribution`]
//! - [`OutputTimePoint`]: one scheduled stop of the integration driver
//! - [`merge_time_points`]: merges user, switch and table-restart times into one schedule

use std::collections::BTreeSet;

use ordered_float::OrderedFloat;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// How the points of an interval are spread between its start and end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IntervalDistribution {
    #[default]
    Equidistant,
    Logarithmic,
}

/// A range of output times.
///
/// # Fields
///
/// * `start` - First time point of the interval
/// * `end` - Last time point of the interval
/// * `points` - Number of points including start and end
/// * `distribution` - Spacing of the points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OutputInterval {
    pub start: f64,
    pub end: f64,
    pub points: usize,
    #[serde(default)]
    pub distribution: IntervalDistribution,
}

impl OutputInterval {
    pub fn new(start: f64, end: f64, points: usize) -> Self {
        Self {
            start,
            end,
            points,
            distribution: IntervalDistribution::Equidistant,
        }
    }

    /// Expands the interval into its time points.
    ///
    /// # Returns
    ///
    /// A single point if `start == end`, otherwise `points` values from `start` to `end`.
    /// Fails for `start > end`, fewer than 2 points or a logarithmic interval not
    /// starting above zero.
    pub fn time_points(&self) -> Result<Vec<f64>, ModelError> {
        if self.start > self.end {
            return Err(ModelError::InvalidOutputSchema(
                "Value for start time should be less than or equal to value for end time".into(),
            ));
        }
        if self.start == self.end {
            return Ok(vec![self.start]);
        }
        if self.points < 2 {
            return Err(ModelError::InvalidOutputSchema(
                "At least 2 points for time interval required".into(),
            ));
        }

        let last = self.points - 1;
        let mut points = Vec::with_capacity(self.points);

        match self.distribution {
            IntervalDistribution::Equidistant => {
                let dt = (self.end - self.start) / last as f64;
                points.push(self.start);
                points.extend((1..last).map(|i| self.start + dt * i as f64));
                points.push(self.end);
            }
            IntervalDistribution::Logarithmic => {
                if self.start <= 0.0 {
                    return Err(ModelError::InvalidOutputSchema(
                        "Logarithmic interval must start above zero".into(),
                    ));
                }
                let ratio = (self.end / self.start).powf(1.0 / last as f64);
                points.push(self.start);
                points.extend((1..last).map(|i| self.start * ratio.powi(i as i32)));
                points.push(self.end);
            }
        }

        Ok(points)
    }
}

/// User output specification: intervals plus discrete time points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OutputSchema {
    #[serde(default)]
    pub intervals: Vec<OutputInterval>,
    #[serde(default)]
    pub time_points: Vec<f64>,
}

impl OutputSchema {
    /// All user output times, sorted and without duplicates.
    ///
    /// # Arguments
    ///
    /// * `single_precision` - Round every time to `f32` before comparing, so points
    ///   differing only below single precision collapse into one
    pub fn all_time_points(&self, single_precision: bool) -> Result<Vec<f64>, ModelError> {
        let mut unique: BTreeSet<OrderedFloat<f64>> = BTreeSet::new();

        for interval in &self.intervals {
            for t in interval.time_points()? {
                unique.insert(OrderedFloat(round_time(t, single_precision)));
            }
        }
        for t in &self.time_points {
            unique.insert(OrderedFloat(round_time(*t, single_precision)));
        }

        Ok(unique.into_iter().map(|t| t.0).collect())
    }
}

fn round_time(t: f64, single_precision: bool) -> f64 {
    if single_precision {
        t as f32 as f64
    } else {
        t
    }
}

/// One stop of the integration driver.
///
/// # Fields
///
/// * `time` - Time of the stop
/// * `save_solution` - Whether the solution is reported at this time
/// * `is_switch_time` - Whether switch conditions are evaluated at this time
/// * `restart_system` - Whether a table discontinuity forces a restart at this time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputTimePoint {
    pub time: f64,
    pub save_solution: bool,
    pub is_switch_time: bool,
    pub restart_system: bool,
}

/// Merges the three time sources into the driver schedule.
///
/// Table restart times are folded into the switch times and remembered for the
/// `restart_system` flag. All switch and user times `<= start_time` are dropped.
/// Switch times after the last user time are not scheduled.
///
/// # Arguments
///
/// * `start_time` - Simulation start time
/// * `user_times` - User output times
/// * `switch_times` - Times at which switch conditions may flip
/// * `restart_times` - Table restart times
///
/// # Returns
///
/// Returns the ordered schedule, or [`ModelError::EmptyOutputSchema`] if no user time
/// lies after `start_time`.
pub fn merge_time_points(
    start_time: f64,
    user_times: &[f64],
    switch_times: &[f64],
    restart_times: &[f64],
) -> Result<Vec<OutputTimePoint>, ModelError> {
    let restart_set: BTreeSet<OrderedFloat<f64>> =
        restart_times.iter().copied().map(OrderedFloat).collect();

    let after_start = |times: &mut dyn Iterator<Item = f64>| -> Vec<f64> {
        times
            .filter(|t| *t > start_time)
            .map(OrderedFloat)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|t| t.0)
            .collect()
    };

    let user = after_start(&mut user_times.iter().copied());
    let switches = after_start(&mut switch_times.iter().chain(restart_times).copied());

    if user.is_empty() {
        return Err(ModelError::EmptyOutputSchema);
    }

    let point = |time: f64, save_solution: bool, is_switch_time: bool| OutputTimePoint {
        time,
        save_solution,
        is_switch_time,
        restart_system: restart_set.contains(&OrderedFloat(time)),
    };

    let mut schedule = Vec::with_capacity(user.len() + switches.len());
    let mut user_iter = user.into_iter().peekable();

    for switch_time in switches {
        if user_iter.peek().is_none() {
            break;
        }

        while let Some(&user_time) = user_iter.peek() {
            if user_time <= switch_time {
                schedule.push(point(user_time, true, user_time == switch_time));
                user_iter.next();
                if user_time == switch_time {
                    break;
                }
            } else {
                schedule.push(point(switch_time, false, true));
                break;
            }
        }
    }

    schedule.extend(user_iter.map(|t| OutputTimePoint {
        time: t,
        save_solution: true,
        is_switch_time: false,
        restart_system: false,
    }));

    Ok(schedule)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;

    use super::*;

    fn times(schedule: &[OutputTimePoint]) -> Vec<f64> {
        schedule.iter().map(|p| p.time).collect()
    }

    #[test]
    fn test_merge_marks_coinciding_switch_times() {
        let schedule =
            merge_time_points(0.0, &[1.0, 2.0, 3.0, 4.0, 5.0], &[2.0, 4.0], &[]).unwrap();

        assert_eq!(times(&schedule), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert!(schedule.iter().all(|p| p.save_solution));
        let switch_flags: Vec<bool> = schedule.iter().map(|p| p.is_switch_time).collect();
        assert_eq!(switch_flags, vec![false, true, false, true, false]);
        assert!(schedule.iter().all(|p| !p.restart_system));
    }

    #[test]
    fn test_merge_inserts_unsaved_switch_points() {
        let schedule = merge_time_points(0.0, &[1.0, 3.0], &[0.0, 2.0, 2.0], &[2.5, 10.0]).unwrap();

        assert_eq!(times(&schedule), vec![1.0, 2.0, 2.5, 3.0]);
        let saved: Vec<bool> = schedule.iter().map(|p| p.save_solution).collect();
        assert_eq!(saved, vec![true, false, false, true]);
        let restarts: Vec<bool> = schedule.iter().map(|p| p.restart_system).collect();
        assert_eq!(restarts, vec![false, false, true, false]);
    }

    #[test]
    fn test_merge_requires_user_time_after_start() {
        let result = merge_time_points(5.0, &[1.0, 5.0], &[6.0], &[]);
        assert!(matches!(result, Err(ModelError::EmptyOutputSchema)));
        assert_eq!(
            result.unwrap_err().to_string(),
            "Time points output schema is empty"
        );
    }

    #[test]
    fn test_interval_expansion() {
        let points = OutputInterval::new(0.0, 1.0, 5).time_points().unwrap();
        assert_eq!(points, vec![0.0, 0.25, 0.5, 0.75, 1.0]);

        assert_eq!(OutputInterval::new(2.0, 2.0, 0).time_points().unwrap(), vec![2.0]);
        assert!(OutputInterval::new(2.0, 1.0, 3).time_points().is_err());
        assert!(OutputInterval::new(0.0, 1.0, 1).time_points().is_err());

        let interval = OutputInterval {
            distribution: IntervalDistribution::Logarithmic,
            ..OutputInterval::new(0.1, 100.0, 4)
        };
        let points = interval.time_points().unwrap();
        for (actual, expected) in points.iter().zip([0.1, 1.0, 10.0, 100.0]) {
            assert_relative_eq!(*actual, expected, max_relative = 1e-12);
        }

        let interval = OutputInterval {
            distribution: IntervalDistribution::Logarithmic,
            ..OutputInterval::new(0.0, 100.0, 4)
        };
        assert!(interval.time_points().is_err());
    }

    #[test]
    fn test_schema_collects_unique_sorted_points() {
        let schema = OutputSchema {
            intervals: vec![OutputInterval::new(0.0, 2.0, 3)],
            time_points: vec![1.5, 1.0, 0.1],
        };
        let points = schema.all_time_points(false).unwrap();
        assert_eq!(points, vec![0.0, 0.1, 1.0, 1.5, 2.0]);

        // differs from 1.0 only below single precision
        let schema = OutputSchema {
            intervals: vec![],
            time_points: vec![1.0, 1.0 + 1e-12],
        };
        assert_eq!(schema.all_time_points(true).unwrap(), vec![1.0]);
        assert_eq!(schema.all_time_points(false).unwrap().len(), 2);
    }
}
