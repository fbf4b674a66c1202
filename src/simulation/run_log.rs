//! Run milestones for the optional simulation log file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::time::Instant;

use crate::error::ModelError;
use crate::options::SimulationOptions;

/// Records run milestones through `log` and, if configured, appends them to a file.
///
/// Every line written to the file carries the seconds elapsed since the log was opened.
#[derive(Debug)]
pub struct RunLog {
    file: Option<File>,
    started: Instant,
}

impl RunLog {
    /// Opens the log file if `write_log_file` is set and a path is configured.
    pub fn new(options: &SimulationOptions) -> Result<Self, ModelError> {
        let file = match (&options.log_file, options.write_log_file) {
            (Some(path), true) => Some(OpenOptions::new().create(true).append(true).open(path)?),
            _ => None,
        };

        Ok(Self {
            file,
            started: Instant::now(),
        })
    }

    /// Seconds since the log was opened.
    pub fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Logs `message` and appends it, timestamped, to the log file.
    pub fn milestone(&mut self, message: &str) {
        log::info!("{}", message);

        let elapsed = self.elapsed();
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = writeln!(file, "[{:>10.3} s] {}", elapsed, message) {
                log::warn!("Could not write to simulation log file: {}", e);
                self.file = None;
            }
        }
    }
}
