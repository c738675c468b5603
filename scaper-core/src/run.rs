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

//! The command drivers: simulation, choice-set generation, estimation,
//! sensitivity sweeps and observation re-emission.
//!
//! Agents are processed by rayon workers; each worker owns its allocation
//! pools through `map_init`/`for_each_init`. Per-agent failures are logged
//! and counted on the progress bar; the run continues. Results are funneled
//! through a mutex into a single writer.
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use hashbrown::HashMap;
use log::{info, warn};
use mat::{BufferPool, MatPool};
use nalgebra::DVector;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use rayon::prelude::*;

use crate::choiceset::generate_choiceset;
use crate::daypath::{path_to_trips, Trip};
use crate::estimation::cost::PathLikelihood;
use crate::estimation::maximize_with_restarts;
use crate::estimation::zonesampling::ZoneSamplingLikelihood;
use crate::io::{self, DerivRow, TripRow};
use crate::parameters::ModelContext;
use crate::population::Agent;
use crate::progress_bar::ScaperProgressBar;
use crate::simulator::{draw_class, simulate_day};
use crate::state_space::start_state;
use crate::utility::ScaperUtility;
use crate::value_function::deriv::DerivEngine;
use crate::value_function::ValueFunction;
use crate::world::{sampling, World};

/// Per-worker allocation pools. Never shared between threads.
struct WorkerAlloc {
    mats: MatPool,
    ev: BufferPool,
    world: BufferPool,
}

impl WorkerAlloc {
    fn new(nb_zones: usize) -> Self {
        WorkerAlloc {
            mats: MatPool::new(nb_zones),
            ev: BufferPool::new(),
            world: BufferPool::new(),
        }
    }
}

/// Configures the global rayon thread pool; a no-op when it is already
/// built.
pub fn init_threads(nb_threads: Option<usize>) {
    if let Some(nb) = nb_threads {
        let _ = rayon::ThreadPoolBuilder::new()
            .num_threads(nb)
            .build_global();
    }
}

/// The seed of this run: the configured one, or a random one (logged so
/// the run can be reproduced).
fn base_seed(ctx: &ModelContext) -> u64 {
    match ctx.config.random_seed {
        Some(seed) => seed,
        None => {
            let seed: u64 = rand::thread_rng().gen();
            info!("Using random seed {seed}");
            seed
        }
    }
}

fn agent_rng(seed: u64, agent: &Agent) -> XorShiftRng {
    XorShiftRng::seed_from_u64(seed.wrapping_add(agent.id))
}

fn limit<'t, T>(items: &'t [T], max: Option<usize>) -> &'t [T] {
    &items[..items.len().min(max.unwrap_or(usize::MAX))]
}

/// Options of the `sim` command.
#[derive(Clone, Debug)]
pub struct SimOptions {
    pub max_agents: Option<usize>,
    pub sample_size: Option<usize>,
    pub output: PathBuf,
}

/// Simulates one day-path per agent and writes the trip file.
pub fn run_sim(ctx: &ModelContext, agents: &[Agent], options: &SimOptions) -> Result<()> {
    let spec = ScaperUtility::new(ctx);
    let agents = limit(agents, options.max_agents);
    let seed = base_seed(ctx);
    let bp = ScaperProgressBar::new(agents.len());
    let rows: Mutex<Vec<TripRow>> = Mutex::new(Vec::new());
    info!("Simulating {} agents", agents.len());
    agents
        .par_iter()
        .panic_fuse()
        .for_each_init(
            || WorkerAlloc::new(ctx.zones.nb_zones),
            |alloc, agent| {
                let mut rng = agent_rng(seed, agent);
                let agent_rows =
                    simulate_agent(ctx, &spec, agent, options.sample_size, alloc, &mut rng);
                rows.lock().unwrap().extend(agent_rows);
                bp.inc();
            },
        );
    bp.finish();
    let rows = rows.into_inner().unwrap();
    io::write_trip_rows(&options.output, &ctx.config.horizon, &rows)?;
    info!(
        "Wrote {} trips for {} agents to `{:?}`",
        rows.len(),
        agents.len(),
        options.output
    );
    Ok(())
}

fn simulate_agent(
    ctx: &ModelContext,
    spec: &ScaperUtility,
    agent: &Agent,
    sample_size: Option<usize>,
    alloc: &WorkerAlloc,
    rng: &mut XorShiftRng,
) -> Vec<TripRow> {
    let mut required = vec![agent.home_zone];
    required.extend(agent.work_zone);
    let world = match sample_size {
        Some(size) => sampling::sample_world(ctx, agent, size, &required, rng, &alloc.world),
        None => World::full(ctx),
    };
    let class = draw_class(ctx, spec, agent, rng);
    let mut vf = ValueFunction::new(ctx, agent, &world, spec, class, &alloc.mats, &alloc.ev);
    let path = simulate_day(ctx, &world, agent, &mut vf, rng);
    path_to_trips(agent, class, &path)
        .into_iter()
        .map(|trip| {
            let travel_minutes = world.scalar_travel_minutes(
                trip.mode,
                world.z_index(trip.origin),
                world.z_index(trip.destination),
                trip.departure,
            );
            TripRow {
                trip,
                travel_minutes,
            }
        })
        .collect()
}

/// Options of the `cs` command.
#[derive(Clone, Debug)]
pub struct CsOptions {
    pub max_agents: Option<usize>,
    pub sample_size: Option<usize>,
    pub nb_alternatives: usize,
    pub alts_output: PathBuf,
    pub zones_output: PathBuf,
}

/// Generates the choice sets of the observed agents and writes them.
pub fn run_cs(
    ctx: &ModelContext,
    agents: &[Agent],
    observed: &[(u64, Vec<Trip>)],
    options: &CsOptions,
) -> Result<()> {
    let spec = ScaperUtility::new(ctx);
    let by_id: HashMap<u64, &Agent> = agents.iter().map(|a| (a.id, a)).collect();
    let mut observations: Vec<(&Agent, &[Trip])> = Vec::new();
    for (agent_id, trips) in observed {
        match by_id.get(agent_id) {
            Some(agent) => observations.push((agent, trips)),
            None => warn!("Observed trips for unknown agent {agent_id}"),
        }
    }
    let observations = limit(&observations, options.max_agents);
    let seed = base_seed(ctx);
    let bp = ScaperProgressBar::new(observations.len());
    let choicesets = Mutex::new(Vec::new());
    info!(
        "Generating choice sets for {} agents ({} alternatives each)",
        observations.len(),
        options.nb_alternatives
    );
    observations
        .par_iter()
        .panic_fuse()
        .for_each_init(
            || WorkerAlloc::new(ctx.zones.nb_zones),
            |alloc, &(agent, trips)| {
                let mut rng = agent_rng(seed, agent);
                match generate_choiceset(
                    ctx,
                    &spec,
                    agent,
                    trips,
                    options.nb_alternatives,
                    options.sample_size,
                    &mut rng,
                    &alloc.mats,
                    &alloc.ev,
                    &alloc.world,
                ) {
                    Some(cs) => {
                        choicesets.lock().unwrap().push(cs);
                        bp.inc();
                    }
                    None => bp.fail(),
                }
            },
        );
    bp.finish();
    let choicesets = choicesets.into_inner().unwrap();
    if choicesets.is_empty() {
        bail!("No feasible observation: nothing to write");
    }
    io::write_choicesets(&options.alts_output, &options.zones_output, &choicesets)?;
    info!(
        "Wrote {} choice sets to `{:?}`",
        choicesets.len(),
        options.alts_output
    );
    Ok(())
}

/// Options of the `est` command.
#[derive(Clone, Debug)]
pub struct EstOptions {
    pub alts_path: PathBuf,
    pub zones_path: PathBuf,
    pub restarts: usize,
    pub numerical_hessian: bool,
    pub output: PathBuf,
}

/// Estimates the utility parameters from choice sets.
pub fn run_est(ctx: &ModelContext, agents: &[Agent], options: &EstOptions) -> Result<()> {
    let spec = ScaperUtility::new(ctx);
    let choicesets = io::read_choicesets(&options.alts_path, &options.zones_path)?;
    info!("Read {} choice sets from `{:?}`", choicesets.len(), options.alts_path);
    let likelihood = PathLikelihood::build(ctx, &spec, agents, &choicesets)?;
    info!(
        "Estimating {} parameters on {} observations",
        likelihood.param_ids().len(),
        likelihood.nb_observations()
    );
    let ids = likelihood.param_ids().to_vec();
    let x0 = DVector::from_iterator(ids.len(), ids.iter().map(|&id| ctx.params.value(id)));
    let mut rng = XorShiftRng::seed_from_u64(base_seed(ctx));
    let maximum = maximize_with_restarts(
        &likelihood,
        &x0,
        options.restarts,
        ctx.config.restart_scale,
        options.numerical_hessian,
        &mut rng,
    );
    write_estimation_output(ctx, &ids, &maximum, &options.output)
}

/// Estimates the zone-importance MNL from the observed trips.
pub fn run_est_zonesampling(
    ctx: &ModelContext,
    agents: &[Agent],
    observed: &[(u64, Vec<Trip>)],
    options: &EstOptions,
) -> Result<()> {
    let trips: Vec<Trip> = observed
        .iter()
        .flat_map(|(_, trips)| trips.iter().cloned())
        .collect();
    let likelihood = ZoneSamplingLikelihood::build(ctx, agents, &trips)?;
    info!(
        "Estimating the zone-sampling model on {} trips",
        trips.len()
    );
    let ids = likelihood.param_ids().to_vec();
    let x0 = DVector::from_iterator(ids.len(), ids.iter().map(|&id| ctx.params.value(id)));
    let mut rng = XorShiftRng::seed_from_u64(base_seed(ctx));
    let maximum = maximize_with_restarts(
        &likelihood,
        &x0,
        options.restarts,
        ctx.config.restart_scale,
        options.numerical_hessian,
        &mut rng,
    );
    write_estimation_output(ctx, &ids, &maximum, &options.output)
}

fn write_estimation_output(
    ctx: &ModelContext,
    ids: &[crate::parameters::ParamId],
    maximum: &mle::Maximum,
    output: &Path,
) -> Result<()> {
    match maximum.termination {
        mle::Termination::WithinConvergenceTolerance => {
            info!("Converged: log-likelihood {:.6}", maximum.value)
        }
        termination => warn!(
            "Estimation stopped without convergence ({termination:?}); \
             reporting the last finite point (log-likelihood {:.6})",
            maximum.value
        ),
    }
    let mut params = ctx.params.clone();
    params.set_values(ids, maximum.x.as_slice());
    let errors: HashMap<&str, f64> = ids
        .iter()
        .enumerate()
        .map(|(k, &id)| (ctx.params.name(id), maximum.std_errors[k]))
        .collect();
    let mut names = Vec::new();
    let mut values = Vec::new();
    let mut estimates = Vec::new();
    let mut std_errors = Vec::new();
    for parameter in params.iter() {
        names.push(parameter.name.clone());
        values.push(parameter.value);
        estimates.push(parameter.estimate);
        std_errors.push(errors.get(parameter.name.as_str()).copied());
    }
    io::write_estimates(output, &names, &values, &estimates, &std_errors)?;
    info!("Wrote estimates to `{output:?}`");
    Ok(())
}

/// A `min, delta, max` sweep grid.
#[derive(Clone, Copy, Debug)]
pub struct Sweep {
    pub min: f64,
    pub delta: f64,
    pub max: f64,
}

impl Sweep {
    /// The grid values, inclusive of both ends.
    pub fn values(&self) -> Vec<f64> {
        let mut values = Vec::new();
        let mut x = self.min;
        while x <= self.max + 1e-9 {
            values.push(x);
            x += self.delta;
        }
        values
    }
}

/// Options of the `deriv` command.
#[derive(Clone, Debug)]
pub struct DerivOptions {
    pub max_agents: Option<usize>,
    pub sample_size: Option<usize>,
    pub travel_time: Option<Sweep>,
    pub work_duration: Option<Sweep>,
    pub numerical: bool,
    pub simulate: bool,
    pub output: PathBuf,
    pub sim_output: Option<PathBuf>,
}

/// Computes expected values and travel-time derivatives over the sweep
/// grids.
pub fn run_deriv(ctx: &ModelContext, agents: &[Agent], options: &DerivOptions) -> Result<()> {
    if options.travel_time.is_none() && options.work_duration.is_none() {
        bail!("Nothing to sweep: give a travel-time or work-duration grid");
    }
    let spec = ScaperUtility::new(ctx);
    let agents = limit(agents, options.max_agents);
    let seed = base_seed(ctx);
    let bp = ScaperProgressBar::new(agents.len());
    let rows: Mutex<Vec<DerivRow>> = Mutex::new(Vec::new());
    let sim_rows: Mutex<Vec<TripRow>> = Mutex::new(Vec::new());
    let nb_classes = ctx.params.nb_classes();
    info!("Computing sensitivities for {} agents", agents.len());
    agents
        .par_iter()
        .panic_fuse()
        .for_each_init(
            || WorkerAlloc::new(ctx.zones.nb_zones),
            |alloc, agent| {
                let mut rng = agent_rng(seed, agent);
                let mut required = vec![agent.home_zone];
                required.extend(agent.work_zone);
                let mut world = match options.sample_size {
                    Some(size) => {
                        sampling::sample_world(ctx, agent, size, &required, &mut rng, &alloc.world)
                    }
                    None => World::full(ctx),
                };
                let start = start_state(ctx, agent);
                let mut agent_rows = Vec::new();
                if let Some(sweep) = options.travel_time {
                    let grid = sweep.values();
                    for class in 0..nb_classes {
                        if options.numerical {
                            let evs: Vec<f64> = grid
                                .iter()
                                .map(|&scale| {
                                    world.set_tt_scale(scale);
                                    let mut vf = ValueFunction::new(
                                        ctx, agent, &world, &spec, class, &alloc.mats, &alloc.ev,
                                    );
                                    vf.expected_value(&start)
                                })
                                .collect();
                            for (i, (&x, &ev)) in grid.iter().zip(evs.iter()).enumerate() {
                                let derivative = (i > 0 && i + 1 < evs.len())
                                    .then(|| (evs[i + 1] - evs[i - 1]) / (2.0 * sweep.delta));
                                agent_rows.push(DerivRow {
                                    agent_id: agent.id,
                                    class,
                                    sweep: "tt",
                                    x,
                                    expected_value: ev,
                                    derivative,
                                });
                            }
                        } else {
                            for &scale in &grid {
                                world.set_tt_scale(scale);
                                let mut engine = DerivEngine::new(
                                    ctx, agent, &world, &spec, class, &alloc.mats, &alloc.ev,
                                );
                                let (ev, dev) = engine.expected_value_and_derivative(&start);
                                agent_rows.push(DerivRow {
                                    agent_id: agent.id,
                                    class,
                                    sweep: "tt",
                                    x: scale,
                                    expected_value: ev,
                                    derivative: Some(dev),
                                });
                            }
                        }
                    }
                    world.set_tt_scale(1.0);
                }
                if let Some(sweep) = options.work_duration {
                    if agent.work_zone.is_some() {
                        for class in 0..nb_classes {
                            for &minutes in &sweep.values() {
                                let mut swept = agent.clone();
                                swept.work_duration = Some(
                                    ctx.config.horizon.minutes_to_timesteps(minutes).round()
                                        as u32,
                                );
                                let mut vf = ValueFunction::new(
                                    ctx, &swept, &world, &spec, class, &alloc.mats, &alloc.ev,
                                );
                                let ev = vf.expected_value(&start_state(ctx, &swept));
                                agent_rows.push(DerivRow {
                                    agent_id: agent.id,
                                    class,
                                    sweep: "wd",
                                    x: minutes,
                                    expected_value: ev,
                                    derivative: None,
                                });
                            }
                        }
                    }
                }
                if options.simulate {
                    let class = draw_class(ctx, &spec, agent, &mut rng);
                    let mut vf = ValueFunction::new(
                        ctx, agent, &world, &spec, class, &alloc.mats, &alloc.ev,
                    );
                    let path = simulate_day(ctx, &world, agent, &mut vf, &mut rng);
                    let trips = path_to_trips(agent, class, &path);
                    sim_rows.lock().unwrap().extend(trips.into_iter().map(|trip| {
                        let travel_minutes = world.scalar_travel_minutes(
                            trip.mode,
                            world.z_index(trip.origin),
                            world.z_index(trip.destination),
                            trip.departure,
                        );
                        TripRow {
                            trip,
                            travel_minutes,
                        }
                    }));
                }
                rows.lock().unwrap().extend(agent_rows);
                bp.inc();
            },
        );
    bp.finish();
    io::write_deriv_rows(&options.output, &rows.into_inner().unwrap())?;
    info!("Wrote sensitivities to `{:?}`", options.output);
    if let Some(sim_output) = &options.sim_output {
        io::write_trip_rows(sim_output, &ctx.config.horizon, &sim_rows.into_inner().unwrap())?;
        info!("Wrote simulated trips to `{sim_output:?}`");
    }
    Ok(())
}

/// Options of the `obs-to-csv` command.
#[derive(Clone, Debug)]
pub struct ObsOptions {
    pub max_agents: Option<usize>,
    pub output: PathBuf,
}

/// Re-emits the observed trips in the simulation output format, with
/// travel and arrival times derived from the level of service.
pub fn run_obs_to_csv(
    ctx: &ModelContext,
    observed: &[(u64, Vec<Trip>)],
    options: &ObsOptions,
) -> Result<()> {
    let world = World::full(ctx);
    let observed = limit(observed, options.max_agents);
    let mut rows = Vec::new();
    for (_, trips) in observed {
        for trip in trips {
            let travel_minutes = world.scalar_travel_minutes(
                trip.mode,
                world.z_index(trip.origin),
                world.z_index(trip.destination),
                trip.departure,
            );
            rows.push(TripRow {
                trip: trip.clone(),
                travel_minutes,
            });
        }
    }
    io::write_trip_rows(&options.output, &ctx.config.horizon, &rows)?;
    info!("Wrote {} observed trips to `{:?}`", rows.len(), options.output);
    Ok(())
}

/// The most recent file named `<anything>_<name>.<csv|parquet>` under
/// `<model>/<kind>/`, by path order (dates and timestamps sort
/// lexicographically).
pub fn latest_output(model_dir: &Path, kind: &str, name: &str) -> Result<PathBuf> {
    let root = model_dir.join(kind);
    let mut candidates: Vec<PathBuf> = Vec::new();
    let days = std::fs::read_dir(&root)
        .with_context(|| format!("No `{kind}` outputs under `{root:?}`"))?;
    for day in days.flatten() {
        if !day.path().is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(day.path())?.flatten() {
            let path = entry.path();
            let matches = path
                .file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|s| s.ends_with(&format!("_{name}")))
                && path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e == "csv" || e == "parquet");
            if matches {
                candidates.push(path);
            }
        }
    }
    candidates.sort();
    candidates
        .pop()
        .with_context(|| format!("No `{name}` file found under `{root:?}`"))
}
