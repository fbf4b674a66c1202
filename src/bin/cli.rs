//! Command-line interface for the odemodel library
//!
//! This binary loads model documents and provides:
//! - Running a simulation and exporting its result
//! - Printing the quantities, switches and bandwidths of a model
//! - Validating a document against the model schema
//!
//! # Usage
//!
//! ```bash
//! # Run a model with the RK5 integrator and write the result
//! odemodel run --path model.json --solver rk5 --output result.json
//!
//! # Show the finalized model
//! odemodel info --path model.json --finalize
//!
//! # Validate a document
//! odemodel validate --path model.json
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use odemodel::prelude::*;

/// Main CLI configuration struct
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
enum Commands {
    /// Finalize and run a model
    Run {
        /// Path to the model document
        #[arg(short, long)]
        path: PathBuf,

        /// Integrator used for the run
        #[arg(short, long, value_enum, default_value_t = Integrator::Rk4)]
        solver: Integrator,

        /// Path to save the result to; the result table is printed otherwise
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overrides the maximum integration step of the document
        #[arg(long)]
        max_step: Option<f64>,

        /// Shows a progress bar during the run
        #[arg(long, default_value_t = false)]
        progress: bool,
    },
    /// Print the contents of a model
    Info {
        /// Path to the model document
        #[arg(short, long)]
        path: PathBuf,

        /// Finalize the model before printing it
        #[arg(short, long, default_value_t = false)]
        finalize: bool,
    },
    /// Validate a model document against the schema
    Validate {
        /// Path to the model document
        #[arg(short, long)]
        path: PathBuf,
    },
}

/// Available integrators
#[derive(Clone, Copy, ValueEnum)]
enum Integrator {
    Rk4,
    Rk5,
}

/// Main entry point for the CLI application
pub fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let outcome = match &cli.command {
        Commands::Run {
            path,
            solver,
            output,
            max_step,
            progress,
        } => run(path, *solver, output.as_deref(), *max_step, *progress),
        Commands::Info { path, finalize } => info(path, *finalize),
        Commands::Validate { path } => validate(path),
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", "Error:".bold().red(), e);
            ExitCode::FAILURE
        }
    }
}

fn run(
    path: &Path,
    solver: Integrator,
    output: Option<&Path>,
    max_step: Option<f64>,
    progress: bool,
) -> Result<ExitCode, ModelError> {
    let mut simulation = load_model(path)?;
    if let Some(max_step) = max_step {
        simulation.solver.max_step = max_step;
    }
    simulation.options.show_progress |= progress;
    simulation.finalize()?;

    let result = match solver {
        Integrator::Rk4 => simulation.run(&RK4)?,
        Integrator::Rk5 => simulation.run(&RK5::default())?,
    }
    .clone();

    if result.tolerance_was_reduced {
        println!(
            "{} tolerances were reduced to abs_tol = {:e}, rel_tol = {:e}",
            "Note:".yellow(),
            result.abs_tol,
            result.rel_tol
        );
    }
    for warning in &result.warnings {
        println!("{} {}", "Warning:".yellow(), warning);
    }

    match output {
        Some(output) => {
            result.save_json(output)?;
            println!(
                "{} Result with {} time points written to {}",
                "✓".green().bold(),
                result.time.len(),
                output.display()
            );
        }
        None => println!("{}", result),
    }

    Ok(ExitCode::SUCCESS)
}

fn info(path: &Path, finalize: bool) -> Result<ExitCode, ModelError> {
    let mut simulation = load_model(path)?;
    if finalize {
        simulation.finalize()?;
    }
    println!("{}", simulation);
    Ok(ExitCode::SUCCESS)
}

fn validate(path: &Path) -> Result<ExitCode, ModelError> {
    let content = std::fs::read_to_string(path)?;
    let report = validate_json(&content)?;

    if report.valid {
        println!("{} {} is valid", "✓".green().bold(), path.display());
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{} {} has {} schema violations",
        "✗".red().bold(),
        path.display(),
        report.errors.len()
    );
    for error in &report.errors {
        println!("{}", error);
    }
    Ok(ExitCode::FAILURE)
}
