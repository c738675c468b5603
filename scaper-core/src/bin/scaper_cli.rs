// This file is part of Scaper.
// Copyright © 2022, 2023, 2024, 2025 André de Palma, Lucas Javaudin
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Command-line interface of the Scaper engine.
use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scaper_core::parameters::{ModelConfig, ModelContext};
use scaper_core::run::{
    self, CsOptions, DerivOptions, EstOptions, ObsOptions, SimOptions, Sweep,
};
use scaper_core::{io, logging};

/// Scaper: day-path microsimulation and estimation.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Model folder with an `input/` directory; outputs go to its
    /// sub-folders.
    #[arg(long, env = "SCAPER_MODEL", default_value = "models/default", global = true)]
    model: PathBuf,
    /// Optional JSON file overriding the model configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Verbose terminal output.
    #[arg(short = 'c', long = "console", global = true)]
    console: bool,
    /// Log file; defaults to a timestamped file under `<model>/logs/`.
    #[arg(short = 'l', long = "logFile", global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Simulate day-paths.
    Sim {
        /// Maximum number of agents.
        #[arg(short = 't')]
        max_agents: Option<usize>,
        /// Zone sample size; omit for the full zone system.
        #[arg(short = 'z')]
        zones: Option<usize>,
        /// Number of worker threads.
        #[arg(short = 'x')]
        threads: Option<usize>,
        /// Output file (CSV or Parquet by extension).
        #[arg(short = 'o')]
        output: Option<PathBuf>,
    },
    /// Generate choice sets for estimation.
    Cs {
        #[arg(short = 't')]
        max_agents: Option<usize>,
        #[arg(short = 'z')]
        zones: Option<usize>,
        #[arg(short = 'x')]
        threads: Option<usize>,
        /// Simulated alternatives per agent.
        #[arg(short = 'a', default_value_t = 500)]
        alternatives: usize,
        #[arg(short = 'o')]
        output: Option<PathBuf>,
    },
    /// Estimate the utility parameters from the latest choice sets.
    Est {
        #[command(subcommand)]
        target: Option<EstTarget>,
        #[arg(short = 'x')]
        threads: Option<usize>,
        /// Number of starts; later starts are randomly perturbed.
        #[arg(short = 'n', default_value_t = 1)]
        restarts: usize,
        /// Use a numerical Hessian for the standard errors.
        #[arg(short = 'H')]
        numerical_hessian: bool,
        #[arg(short = 'o')]
        output: Option<PathBuf>,
    },
    /// Compute expected values and their travel-time derivatives.
    Deriv {
        #[arg(short = 't')]
        max_agents: Option<usize>,
        #[arg(short = 'z')]
        zones: Option<usize>,
        #[arg(short = 'x')]
        threads: Option<usize>,
        /// Travel-time scale sweep: min delta max.
        #[arg(long = "tt", num_args = 3)]
        travel_time: Option<Vec<f64>>,
        /// Work-duration sweep in minutes: min delta max.
        #[arg(long = "wd", num_args = 3)]
        work_duration: Option<Vec<f64>>,
        /// Use central differences over the grid instead of the analytic
        /// derivative.
        #[arg(long = "numDeriv")]
        numerical: bool,
        /// Also simulate one day-path per agent.
        #[arg(long = "sim")]
        simulate: bool,
        #[arg(short = 'o')]
        output: Option<PathBuf>,
    },
    /// Re-emit the observed trips in the simulation output format.
    #[command(name = "obsToCsv")]
    ObsToCsv {
        #[arg(short = 't')]
        max_agents: Option<usize>,
        #[arg(short = 'o')]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum EstTarget {
    /// Estimate the zone-importance model instead of the utility
    /// parameters.
    Zonesampling,
}

fn sweep(values: &Option<Vec<f64>>) -> Option<Sweep> {
    values.as_ref().map(|v| Sweep {
        min: v[0],
        delta: v[1],
        max: v[2],
    })
}

fn load_context(args: &Args) -> Result<(ModelContext, Vec<scaper_core::population::Agent>)> {
    let config: ModelConfig = match &args.config {
        Some(path) => {
            let file =
                File::open(path).with_context(|| format!("Failed to open config `{path:?}`"))?;
            serde_json::from_reader(file)
                .with_context(|| format!("Invalid configuration in `{path:?}`"))?
        }
        None => ModelConfig::default(),
    };
    let params = io::read_parameters(&io::input_file(&args.model, "parameters.csv"))?;
    let zones = io::read_zones(&io::input_file(&args.model, "zones.csv"))?;
    let los = io::read_network(&io::input_file(&args.model, "network.csv"), zones.nb_zones)?;
    let agents = io::read_agents(
        &io::input_file(&args.model, "agents.csv"),
        zones.nb_zones,
        &config.horizon,
    )?;
    Ok((ModelContext::new(config, params, zones, los), agents))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let log_file = match &args.log_file {
        Some(path) => path.clone(),
        None => io::output_file(&args.model, "logs", "scaper", "log")?,
    };
    logging::initialize_logging(args.console, Some(&log_file))?;

    let (ctx, agents) = load_context(&args)?;
    let horizon = ctx.config.horizon;
    match &args.command {
        Command::Sim {
            max_agents,
            zones,
            threads,
            output,
        } => {
            run::init_threads(*threads);
            let options = SimOptions {
                max_agents: *max_agents,
                sample_size: *zones,
                output: match output {
                    Some(path) => path.clone(),
                    None => io::output_file(&args.model, "sim", "trips", "csv")?,
                },
            };
            run::run_sim(&ctx, &agents, &options)
        }
        Command::Cs {
            max_agents,
            zones,
            threads,
            alternatives,
            output,
        } => {
            run::init_threads(*threads);
            let observed =
                io::read_trips(&io::input_file(&args.model, "trips.csv"), &horizon)?;
            let (alts_output, zones_output) = match output {
                Some(path) => {
                    let zones_path = path.with_extension("zones.csv");
                    (path.clone(), zones_path)
                }
                None => (
                    io::output_file(&args.model, "cs", "choicesets", "csv")?,
                    io::output_file(&args.model, "cs", "choiceset_zones", "csv")?,
                ),
            };
            let options = CsOptions {
                max_agents: *max_agents,
                sample_size: *zones,
                nb_alternatives: *alternatives,
                alts_output,
                zones_output,
            };
            run::run_cs(&ctx, &agents, &observed, &options)
        }
        Command::Est {
            target,
            threads,
            restarts,
            numerical_hessian,
            output,
        } => {
            run::init_threads(*threads);
            let output = match output {
                Some(path) => path.clone(),
                None => io::output_file(&args.model, "est", "estimates", "csv")?,
            };
            match target {
                Some(EstTarget::Zonesampling) => {
                    let observed =
                        io::read_trips(&io::input_file(&args.model, "trips.csv"), &horizon)?;
                    let options = EstOptions {
                        alts_path: PathBuf::new(),
                        zones_path: PathBuf::new(),
                        restarts: *restarts,
                        numerical_hessian: *numerical_hessian,
                        output,
                    };
                    run::run_est_zonesampling(&ctx, &agents, &observed, &options)
                }
                None => {
                    let options = EstOptions {
                        alts_path: run::latest_output(&args.model, "cs", "choicesets")?,
                        zones_path: run::latest_output(&args.model, "cs", "choiceset_zones")?,
                        restarts: *restarts,
                        numerical_hessian: *numerical_hessian,
                        output,
                    };
                    run::run_est(&ctx, &agents, &options)
                }
            }
        }
        Command::Deriv {
            max_agents,
            zones,
            threads,
            travel_time,
            work_duration,
            numerical,
            simulate,
            output,
        } => {
            run::init_threads(*threads);
            let options = DerivOptions {
                max_agents: *max_agents,
                sample_size: *zones,
                travel_time: sweep(travel_time),
                work_duration: sweep(work_duration),
                numerical: *numerical,
                simulate: *simulate,
                output: match output {
                    Some(path) => path.clone(),
                    None => io::output_file(&args.model, "sim", "sensitivities", "csv")?,
                },
                sim_output: simulate
                    .then(|| io::output_file(&args.model, "sim", "trips", "csv"))
                    .transpose()?,
            };
            run::run_deriv(&ctx, &agents, &options)
        }
        Command::ObsToCsv { max_agents, output } => {
            let observed =
                io::read_trips(&io::input_file(&args.model, "trips.csv"), &horizon)?;
            let options = ObsOptions {
                max_agents: *max_agents,
                output: match output {
                    Some(path) => path.clone(),
                    None => io::output_file(&args.model, "sim", "observed_trips", "csv")?,
                },
            };
            run::run_obs_to_csv(&ctx, &observed, &options)
        }
    }
}
