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

//! Day-paths, trips and the conversions between them.
use crate::parameters::ModelContext;
use crate::population::Agent;
use crate::state_space::{
    classify, next_single_state, Activity, Decision, Feasibility, Location, Mode, State,
    start_state,
};
use crate::utility::UtilitySpec;
use crate::world::World;

/// The ordered (state, decision) sequence of one agent's day, ending in an
/// end state.
#[derive(Clone, Debug)]
pub struct DayPath {
    pub steps: Vec<(State, Decision)>,
    pub end: State,
}

/// One trip of a day-path, as serialized.
#[derive(Clone, Debug, PartialEq)]
pub struct Trip {
    pub agent_id: u64,
    /// Latent class the trip was simulated under.
    pub class: usize,
    /// Activity started at the destination.
    pub activity: Activity,
    pub mode: Mode,
    pub origin: usize,
    pub destination: usize,
    /// Departure time in timesteps (exact, not truncated).
    pub departure: f64,
}

/// Whether two trip lists describe the same physical day (the latent class
/// is not part of the comparison).
pub fn same_trips(a: &[Trip], b: &[Trip]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b.iter()).all(|(x, y)| {
            x.activity == y.activity
                && x.mode == y.mode
                && x.origin == y.origin
                && x.destination == y.destination
                && x.departure == y.departure
        })
}

/// Extracts the trips of a day-path: one per `Travel` followed by a
/// `Start`.
pub fn path_to_trips(agent: &Agent, class: usize, path: &DayPath) -> Vec<Trip> {
    let mut trips = Vec::new();
    for window in path.steps.windows(2) {
        if let (
            (state, Decision::Travel(mode, dest)),
            (_, Decision::Start(activity)),
        ) = (&window[0], &window[1])
        {
            trips.push(Trip {
                agent_id: agent.id,
                class,
                activity: *activity,
                mode: *mode,
                origin: state
                    .location
                    .zone()
                    .expect("impossible state: traveling from a compressed location"),
                destination: dest
                    .zone()
                    .expect("impossible state: trip to a compressed destination"),
                departure: state.time_of_day,
            });
        }
    }
    trips
}

/// Replays a trip list into a day-path, or `None` when the trips are not
/// feasible under the current model.
///
/// The walk emits `Continue` until a trip's departure-half-step threshold,
/// then `End`, `Travel` and `Start`, and fills the remaining time with
/// `Continue`. It fails when any produced state is infeasible or the
/// terminal state is not an end state.
pub fn trips_to_path(
    ctx: &ModelContext,
    world: &World,
    agent: &Agent,
    trips: &[Trip],
) -> Option<DayPath> {
    let mut steps = Vec::new();
    let mut state = start_state(ctx, agent);
    for trip in trips {
        // Wait at the current activity until the departure threshold.
        loop {
            if classify(ctx, agent, &state) != Feasibility::Good {
                return None;
            }
            let step = ctx.config.horizon.decision_step_at(state.time_of_day);
            if state.time_of_day + 0.5 * step >= trip.departure {
                break;
            }
            let next = next_single_state(ctx, world, agent, &state, &Decision::Continue);
            steps.push((state, Decision::Continue));
            state = next;
        }
        let destination = match trip.activity {
            Activity::Home => Location::Residence(trip.destination),
            Activity::Work => Location::Workplace(trip.destination),
            _ => Location::NonFixed(Some(trip.destination)),
        };
        for decision in [
            Decision::End,
            Decision::Travel(trip.mode, destination),
            Decision::Start(trip.activity),
        ] {
            if classify(ctx, agent, &state) != Feasibility::Good {
                return None;
            }
            let next = next_single_state(ctx, world, agent, &state, &decision);
            steps.push((state, decision));
            state = next;
        }
    }
    // Fill the rest of the day.
    loop {
        match classify(ctx, agent, &state) {
            Feasibility::End => return Some(DayPath { steps, end: state }),
            Feasibility::Bad => return None,
            Feasibility::Good => {
                let next = next_single_state(ctx, world, agent, &state, &Decision::Continue);
                steps.push((state, Decision::Continue));
                state = next;
            }
        }
    }
}

/// The systematic utility of a day-path under the current parameters: the
/// named variables of every step dotted with the parameter values, plus the
/// zone-sampling corrections of its travel steps.
///
/// Together with the value of the start state this gives the path's choice
/// probability: `P = exp(U - V(start))`.
pub fn path_utility(
    ctx: &ModelContext,
    world: &World,
    spec: &dyn UtilitySpec,
    agent: &Agent,
    class: usize,
    path: &DayPath,
) -> f64 {
    let mut variables = Vec::new();
    let mut utility = 0.0;
    for (state, decision) in &path.steps {
        variables.clear();
        spec.step_variables(ctx, world, agent, class, state, decision, &mut variables);
        utility += variables
            .iter()
            .map(|&(id, x)| ctx.params.value(id) * x)
            .sum::<f64>();
        if let Decision::Travel(_, dest) = decision {
            let origin = world.z_index(state.location.zone().expect("concrete travel step"));
            utility += world.correction_value(origin, dest);
        }
    }
    utility
}
