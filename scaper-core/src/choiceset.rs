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

//! Choice-set generation for estimation.
//!
//! For an agent with observed trips, the generator samples a world around
//! the observed zones, replays the observation, simulates alternative
//! day-paths and attaches to every alternative its importance-sampling
//! correction `-ln` of the class-averaged conditional path probability.
//! Duplicated alternatives collapse into one entry whose correction grows
//! by `ln` of the cluster size.
use log::warn;
use mat::{BufferPool, MatPool};
use rand::Rng;

use crate::daypath::{path_to_trips, path_utility, same_trips, trips_to_path, DayPath, Trip};
use crate::parameters::ModelContext;
use crate::population::Agent;
use crate::simulator::{class_probabilities, draw_class, simulate_day};
use crate::state_space::start_state;
use crate::utility::UtilitySpec;
use crate::value_function::ValueFunction;
use crate::world::{sampling, World};

/// One alternative of a choice set: a trip list and its sampling
/// correction.
#[derive(Clone, Debug)]
pub struct Alternative {
    pub trips: Vec<Trip>,
    pub correction: f64,
}

/// A choice set: the agent, the sampled zones and the alternatives, with
/// the observed one at index 0.
#[derive(Clone, Debug)]
pub struct Choiceset {
    pub agent_id: u64,
    pub zones: Vec<usize>,
    pub alternatives: Vec<Alternative>,
}

/// The zones a sampled world must contain for this agent and observation.
pub fn required_zones(agent: &Agent, observed: &[Trip]) -> Vec<usize> {
    let mut zones = vec![agent.home_zone];
    if let Some(work) = agent.work_zone {
        if !zones.contains(&work) {
            zones.push(work);
        }
    }
    for trip in observed {
        for z in [trip.origin, trip.destination] {
            if !zones.contains(&z) {
                zones.push(z);
            }
        }
    }
    zones
}

/// Generates the choice set of one agent, or `None` when the observation is
/// not feasible under the current model (logged and skipped).
#[allow(clippy::too_many_arguments)]
pub fn generate_choiceset<R: Rng>(
    ctx: &ModelContext,
    spec: &dyn UtilitySpec,
    agent: &Agent,
    observed: &[Trip],
    nb_alternatives: usize,
    sample_size: Option<usize>,
    rng: &mut R,
    mat_pool: &MatPool,
    ev_pool: &BufferPool,
    world_pool: &BufferPool,
) -> Option<Choiceset> {
    let required = required_zones(agent, observed);
    let world = match sample_size {
        Some(size) => sampling::sample_world(ctx, agent, size, &required, rng, world_pool),
        None => World::full(ctx),
    };
    let Some(observed_path) = trips_to_path(ctx, &world, agent, observed) else {
        warn!(
            "Skipping agent {}: the observed trips are infeasible under the current model",
            agent.id
        );
        return None;
    };

    let nb_classes = ctx.params.nb_classes();
    let class_probs = class_probabilities(ctx, spec, agent);
    let start = start_state(ctx, agent);
    let mut vfs: Vec<ValueFunction> = (0..nb_classes)
        .map(|class| ValueFunction::new(ctx, agent, &world, spec, class, mat_pool, ev_pool))
        .collect();
    let start_values: Vec<f64> = vfs.iter_mut().map(|vf| vf.expected_value(&start)).collect();

    // `-ln` of the class-averaged conditional probability of a path.
    let correction_of = |path: &DayPath| -> f64 {
        let average: f64 = (0..nb_classes)
            .map(|class| {
                let u = path_utility(ctx, &world, spec, agent, class, path);
                class_probs[class] * (u - start_values[class]).exp()
            })
            .sum();
        -average.ln()
    };

    let mut clusters: Vec<(Alternative, usize)> = vec![(
        Alternative {
            trips: observed.to_vec(),
            correction: correction_of(&observed_path),
        },
        1,
    )];
    for _ in 0..nb_alternatives {
        let class = draw_class(ctx, spec, agent, rng);
        let path = simulate_day(ctx, &world, agent, &mut vfs[class], rng);
        let trips = path_to_trips(agent, class, &path);
        match clusters
            .iter_mut()
            .find(|(alt, _)| same_trips(&alt.trips, &trips))
        {
            Some((_, count)) => *count += 1,
            None => {
                let correction = correction_of(&path);
                clusters.push((Alternative { trips, correction }, 1));
            }
        }
    }
    let alternatives = clusters
        .into_iter()
        .map(|(mut alternative, count)| {
            alternative.correction += (count as f64).ln();
            alternative
        })
        .collect();
    Some(Choiceset {
        agent_id: agent.id,
        zones: world.zones().to_vec(),
        alternatives,
    })
}
