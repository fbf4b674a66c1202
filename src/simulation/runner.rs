//! Run driver: schedules the integration, applies switches and collects results.

use std::sync::atomic::Ordering;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use peroxide::fuga::ODEIntegrator;

use crate::error::ModelError;
use crate::output::{merge_time_points, OutputTimePoint};
use crate::switch::{perform_switch_updates, switch_time_points};

use super::run_log::RunLog;
use super::result::{ResultRecorder, SimulationResult};
use super::system::DeSystem;
use super::Simulation;

impl Simulation {
    /// The merged schedule of user output, switch and table-restart times.
    ///
    /// Switch times are derived from conditions that can be evaluated for the current
    /// run, so the schedule may differ between runs with different parameter values.
    pub fn output_time_points(&self) -> Result<Vec<OutputTimePoint>, ModelError> {
        let single_precision = self.options.use_float_comparison_in_user_output_time_points;
        let user = self.output_schema.all_time_points(single_precision)?;
        let switches = switch_time_points(&self.model);
        let restarts = self.model.restart_time_points();

        merge_time_points(self.start_time, &user, &switches, &restarts)
    }

    /// Runs the simulation with `integrator` and stores the result.
    ///
    /// Convergence and error-test failures are retried with tightened tolerances when
    /// `auto_reduce_tolerances` is set, until the tolerance floor is reached. Quantities,
    /// formulas and switches are reset to their pre-run state after every attempt.
    ///
    /// # Arguments
    ///
    /// * `integrator` - Any `peroxide` integrator, e.g. `RK4` or `RK5::default()`
    ///
    /// # Returns
    ///
    /// The result of the successful attempt, or the error that ended the run.
    pub fn run<S: ODEIntegrator>(&mut self, integrator: &S) -> Result<&SimulationResult, ModelError> {
        if !self.is_finalized() {
            return Err(ModelError::invalid_state(
                "Simulation::run",
                "Simulation is not finalized",
            ));
        }

        let mut log = RunLog::new(&self.options)?;
        log.milestone(&format!("Starting simulation run of '{}'", self.name));
        self.cancel_flag().store(false, Ordering::Relaxed);

        let mut tolerance_was_reduced = false;
        let outcome = loop {
            self.simplify_objects(true);

            match self.solve(integrator, &mut log, tolerance_was_reduced) {
                Ok(result) => break Ok(result),
                Err(e) if e.is_retryable() && self.options.auto_reduce_tolerances => {
                    if !self.solver.reduce_tolerances() {
                        break Err(e);
                    }
                    tolerance_was_reduced = true;
                    log::warn!(
                        "{}; retrying with abs_tol = {:e}, rel_tol = {:e}",
                        e,
                        self.solver.abs_tol,
                        self.solver.rel_tol
                    );
                    self.model.reset();
                }
                Err(e) => break Err(e),
            }
        };
        self.model.reset();

        match outcome {
            Ok(result) => {
                log.milestone(&format!(
                    "Simulation run finished with {} output points",
                    result.time.len()
                ));
                self.set_result(result);
                self.result().ok_or_else(|| {
                    ModelError::invalid_state("Simulation::run", "Simulation result is missing")
                })
            }
            Err(e) => {
                log.milestone(&format!("Simulation run failed: {}", e));
                Err(e)
            }
        }
    }

    /// One run attempt with the current tolerances.
    fn solve<S: ODEIntegrator>(
        &mut self,
        integrator: &S,
        log: &mut RunLog,
        tolerance_was_reduced: bool,
    ) -> Result<SimulationResult, ModelError> {
        let schedule = self.output_time_points()?;
        let n = self.de_size();
        let m = self.sensitivity_parameters.len();

        let mut y = self.de_initial_values()?;
        y.resize(n * (1 + m), 0.0);

        let mut warnings = Vec::new();
        let mut recorder =
            ResultRecorder::new(&self.model, &self.sensitivity_parameters, self.solver.abs_tol);

        let start = self.start_time;
        let outcome = perform_switch_updates(&mut self.model, &mut y[..n], start);
        if outcome.restart {
            log::debug!("Switches changed the initial state");
        }
        recorder.record(&mut self.model, &y, start);

        let end = schedule.last().map_or(start, |p| p.time);
        let progress = progress_bar(schedule.len() as u64, self.options.show_progress);
        let mut t = start;

        for point in &schedule {
            self.advance(integrator, &mut y, t, point.time, log, &mut warnings)?;
            t = point.time;

            if point.is_switch_time {
                let outcome = perform_switch_updates(&mut self.model, &mut y[..n], t);
                // one-step integrators keep no history, every advance starts fresh
                if outcome.restart || point.restart_system {
                    log::debug!(
                        "Restarting integration at time {} ({} variables affected)",
                        t,
                        outcome.touched_variables.len()
                    );
                }
            }

            if self.options.check_for_negative_values {
                self.check_negative_values(&y[..n], t)?;
            }

            if point.save_solution {
                recorder.record(&mut self.model, &y, t);
            }

            if self.options.show_progress {
                let percent = if end > start {
                    100.0 * (t - start) / (end - start)
                } else {
                    100.0
                };
                progress.set_message(format!("t = {:.4} ({:.0}%)", t, percent));
                progress.inc(1);
            }

            if self.cancel_flag().load(Ordering::Relaxed) {
                progress.abandon_with_message("cancelled");
                return Err(ModelError::Cancelled { time: t });
            }
        }
        progress.finish_and_clear();

        Ok(recorder.finish(self.solver.rel_tol, tolerance_was_reduced, warnings))
    }

    /// Integrates from `from` to `to` in sub-steps no larger than `max_step`.
    fn advance<S: ODEIntegrator>(
        &self,
        integrator: &S,
        y: &mut [f64],
        from: f64,
        to: f64,
        log: &RunLog,
        warnings: &mut Vec<String>,
    ) -> Result<(), ModelError> {
        let system = DeSystem::new(&self.model, &self.sensitivity_parameters);
        let limit = self.options.time_limit();
        let started = Instant::now();

        let mut t = from;
        let mut steps = 0usize;
        while t < to {
            let remaining = to - t;
            let (h, next) = if remaining <= self.solver.max_step {
                (remaining, to)
            } else {
                (self.solver.max_step, t + self.solver.max_step)
            };

            integrator
                .step(&system, t, y, h)
                .map_err(|e| ModelError::ConvergenceFailure {
                    time: t,
                    message: e.to_string(),
                })?;
            t = next;
            steps += 1;

            if y.iter().any(|v| !v.is_finite()) {
                return Err(ModelError::ErrorTestFailure {
                    time: t,
                    message: "solution is not finite".into(),
                });
            }

            for (time, message) in system.take_warnings() {
                if self.options.stop_on_warnings {
                    return Err(ModelError::SolverWarning { time, message });
                }
                log::warn!("Solver warning at time {}: {}", time, message);
                warnings.push(format!("t = {}: {}", time, message));
            }

            if steps >= self.solver.max_steps && t < to {
                return Err(ModelError::ConvergenceFailure {
                    time: t,
                    message: format!("maximum number of {} steps reached", self.solver.max_steps),
                });
            }

            if let Some(limit) = limit {
                if log.elapsed() > limit {
                    return Err(ModelError::TimeLimitExceeded { limit });
                }
            }
        }

        log::trace!(
            "Advanced from {} to {} in {} steps ({:?})",
            from,
            to,
            steps,
            started.elapsed()
        );
        Ok(())
    }

    /// Fails if a species that must stay non-negative dropped below `-100 * abs_tol`.
    fn check_negative_values(&self, y: &[f64], time: f64) -> Result<(), ModelError> {
        let threshold = -100.0 * self.solver.abs_tol;
        let variables: Vec<String> = self
            .model
            .de_species()
            .into_iter()
            .filter_map(|q| {
                let quantity = self.model.quantity(q);
                let species = quantity.species()?;
                let i = species.ode_index?;
                (!species.negative_values_allowed && y[i] < threshold)
                    .then(|| quantity.path.clone())
            })
            .collect();

        if variables.is_empty() {
            Ok(())
        } else {
            Err(ModelError::NegativeValues { time, variables })
        }
    }
}

fn progress_bar(len: u64, show: bool) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }

    let bar = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar().template(
        "Simulating: {spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} | {elapsed}/{eta} | {msg}",
    ) {
        bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏ "));
    }
    bar
}
