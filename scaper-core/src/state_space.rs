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

//! The state space of the day-path decision process.
//!
//! States describe what an agent is doing, where, when and with which
//! history; decisions are the feasible transitions out of a state. The
//! `Depart` and `Arrive` activities are internal phase markers splitting the
//! joint end-travel-start choice into three successive transitions.
//!
//! [options] is intentionally liberal: it does not check downstream
//! time-space feasibility. Infeasible continuations are eliminated by the
//! value function, which assigns them a zero choice weight.
use anyhow::{bail, Result};
use serde_derive::Deserialize;

use crate::parameters::ModelContext;
use crate::population::Agent;
use crate::units::frac;
use crate::world::World;

/// Number of travel modes.
pub const NB_MODES: usize = 4;

/// A travel mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
pub enum Mode {
    Car,
    Transit,
    Walk,
    Bike,
}

impl Mode {
    /// All modes, in index order.
    pub const ALL: [Mode; NB_MODES] = [Mode::Car, Mode::Transit, Mode::Walk, Mode::Bike];

    /// Index of the mode.
    pub fn index(self) -> usize {
        match self {
            Mode::Car => 0,
            Mode::Transit => 1,
            Mode::Walk => 2,
            Mode::Bike => 3,
        }
    }

    /// Name of the mode, as used in input and output files.
    pub fn name(self) -> &'static str {
        match self {
            Mode::Car => "car",
            Mode::Transit => "transit",
            Mode::Walk => "walk",
            Mode::Bike => "bike",
        }
    }

    /// Parses a mode name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "car" => Ok(Mode::Car),
            "transit" => Ok(Mode::Transit),
            "walk" => Ok(Mode::Walk),
            "bike" => Ok(Mode::Bike),
            _ => bail!("Unknown mode `{name}`"),
        }
    }

    /// Whether the mode's level of service distinguishes peak hours.
    pub fn has_peak(self) -> bool {
        matches!(self, Mode::Car | Mode::Transit)
    }
}

/// The vehicle an agent carries along, derived from the mode when leaving
/// the residence and cleared on arrival there.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Vehicle {
    #[default]
    None,
    Car,
    Bike,
}

/// Returns the vehicle implied by traveling with the given mode.
pub fn vehicle_of(mode: Mode) -> Vehicle {
    match mode {
        Mode::Car => Vehicle::Car,
        Mode::Bike => Vehicle::Bike,
        Mode::Transit | Mode::Walk => Vehicle::None,
    }
}

/// An activity, including the two internal travel phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
pub enum Activity {
    /// About to travel: the next decision chooses mode and destination.
    Depart,
    /// Just arrived: the next decision starts an activity.
    Arrive,
    Home,
    Work,
    Shop,
    Other,
}

impl Activity {
    /// Name of the activity, as used in input and output files.
    pub fn name(self) -> &'static str {
        match self {
            Activity::Depart => "depart",
            Activity::Arrive => "arrive",
            Activity::Home => "home",
            Activity::Work => "work",
            Activity::Shop => "shop",
            Activity::Other => "other",
        }
    }

    /// Parses an activity name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "depart" => Ok(Activity::Depart),
            "arrive" => Ok(Activity::Arrive),
            "home" => Ok(Activity::Home),
            "work" => Ok(Activity::Work),
            "shop" => Ok(Activity::Shop),
            "other" => Ok(Activity::Other),
            _ => bail!("Unknown activity `{name}`"),
        }
    }
}

/// Where an agent is (or, compressed, everywhere it could be).
///
/// `NonFixed(None)` is the "all zones" wildcard used only during expected
/// value computation; `Residence` and `Workplace` always point to one
/// concrete zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Location {
    Residence(usize),
    Workplace(usize),
    NonFixed(Option<usize>),
}

impl Location {
    /// The concrete zone of the location, if any.
    pub fn zone(self) -> Option<usize> {
        match self {
            Location::Residence(z) | Location::Workplace(z) => Some(z),
            Location::NonFixed(z) => z,
        }
    }

    /// The case tag of the location, without the zone.
    pub fn case(self) -> LocationCase {
        match self {
            Location::Residence(_) => LocationCase::Residence,
            Location::Workplace(_) => LocationCase::Workplace,
            Location::NonFixed(_) => LocationCase::NonFixed,
        }
    }
}

/// Location case tag, used in cache keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LocationCase {
    Residence,
    Workplace,
    NonFixed,
}

/// A state of the day-path decision process. Immutable after creation.
#[derive(Clone, Debug, PartialEq)]
pub struct State {
    pub activity: Activity,
    pub location: Location,
    /// Time of day in timesteps since the day start; may be fractional.
    pub time_of_day: f64,
    /// Timesteps spent in the current activity, capped by the tracked
    /// duration of the activity.
    pub duration: u32,
    pub vehicle: Vehicle,
    /// History flag: whether the agent has (validly) worked today.
    pub has_worked: bool,
}

/// A decision out of a state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Decision {
    /// Start the given activity at the current location.
    Start(Activity),
    /// Keep performing the current activity for one decision step.
    Continue,
    /// End the current activity and enter the departure phase.
    End,
    /// Travel with the given mode to the given location.
    ///
    /// The destination may be `NonFixed(None)`, the compressed
    /// all-destinations form used for expected value computation, or a
    /// concrete zone (the exploded form used during simulation).
    Travel(Mode, Location),
}

/// Feasibility of a state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Feasibility {
    /// A terminal state at the day end meeting all mandated conditions.
    End,
    /// An infeasible state.
    Bad,
    /// A regular state with at least the potential of a feasible future.
    Good,
}

/// The attributes of a state that key the expected value cache: everything
/// except the time of day and the concrete non-fixed zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub activity: Activity,
    pub location: LocationCase,
    pub duration: u32,
    pub vehicle: Vehicle,
    pub has_worked: bool,
}

/// Returns the cache key of a state.
pub fn cache_key(state: &State) -> CacheKey {
    CacheKey {
        activity: state.activity,
        location: state.location.case(),
        duration: state.duration,
        vehicle: state.vehicle,
        has_worked: state.has_worked,
    }
}

/// The state every agent starts the day in: at home, at the day start.
pub fn start_state(ctx: &ModelContext, agent: &Agent) -> State {
    State {
        activity: Activity::Home,
        location: Location::Residence(agent.home_zone),
        time_of_day: 0.0,
        duration: 1.min(max_tracked_duration(ctx, agent, Activity::Home)),
        vehicle: Vehicle::None,
        has_worked: false,
    }
}

/// The cap on the tracked duration of an activity.
///
/// A mandated work duration extends the cap so that over-fulfilment is still
/// observable (the history flag must drop again one step past the mandate).
pub fn max_tracked_duration(ctx: &ModelContext, agent: &Agent, activity: Activity) -> u32 {
    let cap = ctx.config.max_tracked_duration.for_activity(activity);
    match (activity, agent.work_duration) {
        (Activity::Work, Some(w)) => cap.max(w + 1),
        _ => cap,
    }
}

/// Classifies a state as terminal, infeasible or regular.
pub fn classify(ctx: &ModelContext, agent: &Agent, state: &State) -> Feasibility {
    let day_length = ctx.config.horizon.day_length() as f64;
    let t = state.time_of_day;
    if t < 0.0 || t > day_length {
        return Feasibility::Bad;
    }
    if t == day_length {
        let at_home = state.activity == Activity::Home
            && state.location == Location::Residence(agent.home_zone);
        let work_fulfilled = state.has_worked == agent.work_zone.is_some();
        return if at_home && work_fulfilled {
            Feasibility::End
        } else {
            Feasibility::Bad
        };
    }
    match state.activity {
        Activity::Home if state.location.case() != LocationCase::Residence => Feasibility::Bad,
        Activity::Work
            if agent.work_zone.is_none() || state.location.case() != LocationCase::Workplace =>
        {
            Feasibility::Bad
        }
        _ => Feasibility::Good,
    }
}

/// Generates the feasible decisions out of a state.
///
/// With `explode`, every non-fixed destination is its own travel decision;
/// otherwise a single compressed all-destinations decision stands for them.
pub fn options(
    ctx: &ModelContext,
    agent: &Agent,
    world: &World,
    state: &State,
    explode: bool,
) -> Vec<Decision> {
    match state.activity {
        Activity::Depart => {
            let modes: &[Mode] = if agent.has_car {
                &Mode::ALL
            } else {
                &ctx.config.no_car_modes
            };
            let mut decisions = Vec::new();
            for &mode in modes {
                if state.location.case() != LocationCase::Residence {
                    decisions.push(Decision::Travel(mode, Location::Residence(agent.home_zone)));
                }
                if let Some(work) = agent.work_zone {
                    if state.location.case() != LocationCase::Workplace {
                        decisions.push(Decision::Travel(mode, Location::Workplace(work)));
                    }
                }
                if explode {
                    for &zone in world.zones() {
                        decisions.push(Decision::Travel(mode, Location::NonFixed(Some(zone))));
                    }
                } else {
                    decisions.push(Decision::Travel(mode, Location::NonFixed(None)));
                }
            }
            decisions
        }
        Activity::Arrive => match state.location.case() {
            LocationCase::Residence => vec![Decision::Start(Activity::Home)],
            LocationCase::Workplace => vec![Decision::Start(Activity::Work)],
            LocationCase::NonFixed => ctx
                .config
                .discretionary
                .iter()
                .map(|&a| Decision::Start(a))
                .collect(),
        },
        _ => vec![Decision::Continue, Decision::End],
    }
}

/// Applies a decision to a state, with the given time of day of the
/// resulting state.
pub fn next_state(
    ctx: &ModelContext,
    agent: &Agent,
    state: &State,
    decision: &Decision,
    time_of_day: f64,
) -> State {
    match decision {
        Decision::Start(activity) => State {
            activity: *activity,
            location: state.location,
            time_of_day,
            duration: 1.min(max_tracked_duration(ctx, agent, *activity)),
            vehicle: state.vehicle,
            has_worked: worked_after(agent, *activity, 0, state.has_worked),
        },
        Decision::Continue => State {
            activity: state.activity,
            location: state.location,
            time_of_day,
            duration: (state.duration + 1)
                .min(max_tracked_duration(ctx, agent, state.activity)),
            vehicle: state.vehicle,
            has_worked: worked_after(agent, state.activity, state.duration, state.has_worked),
        },
        Decision::End => State {
            activity: Activity::Depart,
            location: state.location,
            time_of_day,
            duration: 0,
            vehicle: state.vehicle,
            has_worked: state.has_worked,
        },
        Decision::Travel(mode, dest) => {
            let vehicle = if dest.case() == LocationCase::Residence {
                Vehicle::None
            } else if state.location.case() == LocationCase::Residence {
                vehicle_of(*mode)
            } else {
                state.vehicle
            };
            State {
                activity: Activity::Arrive,
                location: *dest,
                time_of_day,
                duration: 0,
                vehicle,
                has_worked: state.has_worked,
            }
        }
    }
}

/// Updates the `has_worked` flag after performing `activity` for one more
/// step, coming from `prev_duration` tracked steps.
///
/// With a mandated work duration `w`, the flag is raised exactly when the
/// `w`-th work step completes and dropped again when the mandate is
/// overshot; without a mandate, it is sticky.
fn worked_after(agent: &Agent, activity: Activity, prev_duration: u32, prev_flag: bool) -> bool {
    if activity != Activity::Work {
        return prev_flag;
    }
    match agent.work_duration {
        Some(w) => {
            if prev_duration + 1 == w {
                true
            } else if prev_duration == w {
                false
            } else {
                prev_flag
            }
        }
        None => true,
    }
}

/// Applies a decision with its concrete deterministic time advance: zero
/// for `End`, the scalar door-to-door travel time for `Travel`, the
/// decision step otherwise.
pub fn next_single_state(
    ctx: &ModelContext,
    world: &World,
    agent: &Agent,
    state: &State,
    decision: &Decision,
) -> State {
    let horizon = &ctx.config.horizon;
    let t = state.time_of_day;
    let dt = match decision {
        Decision::End => 0.0,
        Decision::Travel(mode, dest) => {
            let origin = state
                .location
                .zone()
                .expect("impossible state: traveling from a compressed location");
            let dest = dest
                .zone()
                .expect("impossible state: single transition to a compressed destination");
            let minutes =
                world.scalar_travel_minutes(*mode, world.z_index(origin), world.z_index(dest), t);
            horizon.minutes_to_timesteps(minutes)
        }
        Decision::Start(_) | Decision::Continue => horizon.decision_step_at(t),
    };
    next_state(ctx, agent, state, decision, horizon.snap(t + dt))
}

/// Returns the integer-timestep states reachable from `(state, decision)`,
/// used as interpolation anchors by the value function.
///
/// For `Travel`, one state per integral travel duration the world reports,
/// plus one more to cover the upper interpolation anchor of fractional
/// departure times; otherwise the floor and ceiling of the deterministic
/// next time.
pub fn next_integral_time_states(
    ctx: &ModelContext,
    world: &World,
    agent: &Agent,
    state: &State,
    decision: &Decision,
) -> Vec<State> {
    let horizon = &ctx.config.horizon;
    let day_length = horizon.day_length() as f64;
    let t = state.time_of_day;
    let mut times: Vec<f64> = Vec::new();
    match decision {
        Decision::Travel(mode, dest) => {
            let origin = world.axis(&state.location);
            let destination = world.axis(dest);
            let (lo, hi) = world.travel_timesteps(*mode, origin, destination);
            let base = t.floor();
            for k in lo..=(hi + 1) {
                let anchor = (base + k as f64).min(day_length);
                if times.last() != Some(&anchor) {
                    times.push(anchor);
                }
            }
        }
        _ => {
            let dt = match decision {
                Decision::End => 0.0,
                _ => horizon.decision_step_at(t),
            };
            let next = horizon.snap(t + dt);
            times.push(next.floor());
            if frac(next) > 0.0 {
                times.push(next.floor() + 1.0);
            }
        }
    }
    times
        .into_iter()
        .map(|anchor| next_state(ctx, agent, state, decision, anchor))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::parameters::{ModelConfig, Params};
    use crate::population::tests::home_agent;
    use crate::world::tests::{constant_los, uniform_zones};

    pub(crate) fn context(nb_zones: usize) -> ModelContext {
        let config = ModelConfig::default();
        let los = constant_los(nb_zones, &config.horizon, 10.0);
        ModelContext::new(config, Params::empty(), uniform_zones(nb_zones), los)
    }

    fn worker(home: usize, work: usize, mandate: Option<u32>) -> Agent {
        Agent {
            work_zone: Some(work),
            work_duration: mandate,
            ..home_agent(home)
        }
    }

    #[test]
    fn classify_bounds_test() {
        let ctx = context(3);
        let agent = home_agent(0);
        let mut state = start_state(&ctx, &agent);
        assert_eq!(classify(&ctx, &agent, &state), Feasibility::Good);
        state.time_of_day = -1.0;
        assert_eq!(classify(&ctx, &agent, &state), Feasibility::Bad);
        state.time_of_day = ctx.config.horizon.day_length() as f64 + 1.0;
        assert_eq!(classify(&ctx, &agent, &state), Feasibility::Bad);
    }

    #[test]
    fn classify_day_end_test() {
        let ctx = context(3);
        let day_length = ctx.config.horizon.day_length() as f64;
        // No workplace: ending at home with no work is an End state.
        let agent = home_agent(0);
        let mut state = start_state(&ctx, &agent);
        state.time_of_day = day_length;
        assert_eq!(classify(&ctx, &agent, &state), Feasibility::End);
        // A worked flag without a workplace is infeasible.
        state.has_worked = true;
        assert_eq!(classify(&ctx, &agent, &state), Feasibility::Bad);
        // With a workplace, the flag is mandatory.
        let agent = worker(0, 1, None);
        let mut state = start_state(&ctx, &agent);
        state.time_of_day = day_length;
        assert_eq!(classify(&ctx, &agent, &state), Feasibility::Bad);
        state.has_worked = true;
        assert_eq!(classify(&ctx, &agent, &state), Feasibility::End);
        // Ending away from home is infeasible.
        state.location = Location::NonFixed(Some(2));
        state.activity = Activity::Other;
        assert_eq!(classify(&ctx, &agent, &state), Feasibility::Bad);
    }

    #[test]
    fn classify_inconsistent_location_test() {
        let ctx = context(3);
        let agent = home_agent(0);
        let mut state = start_state(&ctx, &agent);
        state.location = Location::NonFixed(Some(1));
        assert_eq!(classify(&ctx, &agent, &state), Feasibility::Bad);
        // Working without a work zone is infeasible.
        let mut state = start_state(&ctx, &agent);
        state.activity = Activity::Work;
        state.location = Location::Workplace(1);
        assert_eq!(classify(&ctx, &agent, &state), Feasibility::Bad);
    }

    #[test]
    fn options_depart_test() {
        let ctx = context(3);
        let world = World::full(&ctx);
        let agent = worker(0, 1, None);
        let mut state = start_state(&ctx, &agent);
        state.activity = Activity::Depart;
        // From home: work and compressed non-fixed, but no travel to home.
        let decisions = options(&ctx, &agent, &world, &state, false);
        assert_eq!(decisions.len(), NB_MODES * 2);
        assert!(decisions
            .iter()
            .all(|d| !matches!(d, Decision::Travel(_, Location::Residence(_)))));
        // Exploded: one travel decision per zone instead of the compressed
        // one.
        let decisions = options(&ctx, &agent, &world, &state, true);
        assert_eq!(decisions.len(), NB_MODES * (1 + 3));
    }

    #[test]
    fn options_arrive_test() {
        let ctx = context(3);
        let world = World::full(&ctx);
        let agent = worker(0, 1, None);
        let mut state = start_state(&ctx, &agent);
        state.activity = Activity::Arrive;
        assert_eq!(
            options(&ctx, &agent, &world, &state, false),
            vec![Decision::Start(Activity::Home)]
        );
        state.location = Location::Workplace(1);
        assert_eq!(
            options(&ctx, &agent, &world, &state, false),
            vec![Decision::Start(Activity::Work)]
        );
        state.location = Location::NonFixed(Some(2));
        assert_eq!(
            options(&ctx, &agent, &world, &state, false),
            vec![
                Decision::Start(Activity::Shop),
                Decision::Start(Activity::Other)
            ]
        );
    }

    #[test]
    fn mandated_work_duration_test() {
        let ctx = context(3);
        let agent = worker(0, 1, Some(3));
        let mut state = State {
            activity: Activity::Work,
            location: Location::Workplace(1),
            time_of_day: 10.0,
            duration: 1,
            vehicle: Vehicle::None,
            has_worked: false,
        };
        // Second step: not yet.
        state = next_state(&ctx, &agent, &state, &Decision::Continue, 11.0);
        assert_eq!(state.duration, 2);
        assert!(!state.has_worked);
        // Third step completes the mandate.
        state = next_state(&ctx, &agent, &state, &Decision::Continue, 12.0);
        assert_eq!(state.duration, 3);
        assert!(state.has_worked);
        // Overshooting drops the flag again.
        state = next_state(&ctx, &agent, &state, &Decision::Continue, 13.0);
        assert_eq!(state.duration, 4);
        assert!(!state.has_worked);
        // And it stays down.
        state = next_state(&ctx, &agent, &state, &Decision::Continue, 14.0);
        assert!(!state.has_worked);
    }

    #[test]
    fn sticky_has_worked_test() {
        let ctx = context(3);
        let agent = worker(0, 1, None);
        let mut state = State {
            activity: Activity::Arrive,
            location: Location::Workplace(1),
            time_of_day: 10.0,
            duration: 0,
            vehicle: Vehicle::None,
            has_worked: false,
        };
        state = next_state(&ctx, &agent, &state, &Decision::Start(Activity::Work), 11.0);
        assert!(state.has_worked);
        state = next_state(&ctx, &agent, &state, &Decision::Continue, 12.0);
        assert!(state.has_worked);
    }

    #[test]
    fn vehicle_transitions_test() {
        let ctx = context(3);
        let agent = worker(0, 1, None);
        let mut state = start_state(&ctx, &agent);
        state.activity = Activity::Depart;
        // Leaving home by car picks the car up.
        let travel = Decision::Travel(Mode::Car, Location::Workplace(1));
        let at_work = next_state(&ctx, &agent, &state, &travel, 2.0);
        assert_eq!(at_work.vehicle, Vehicle::Car);
        // Traveling on from elsewhere keeps it.
        let mut depart = at_work.clone();
        depart.activity = Activity::Depart;
        let travel = Decision::Travel(Mode::Transit, Location::NonFixed(Some(2)));
        let elsewhere = next_state(&ctx, &agent, &depart, &travel, 4.0);
        assert_eq!(elsewhere.vehicle, Vehicle::Car);
        // Arriving home clears it.
        let mut depart = elsewhere.clone();
        depart.activity = Activity::Depart;
        let travel = Decision::Travel(Mode::Car, Location::Residence(0));
        let home = next_state(&ctx, &agent, &depart, &travel, 6.0);
        assert_eq!(home.vehicle, Vehicle::None);
    }

    #[test]
    fn duration_cap_test() {
        let ctx = context(3);
        let agent = home_agent(0);
        let cap = ctx.config.max_tracked_duration.home;
        let mut state = start_state(&ctx, &agent);
        for k in 0..(cap + 5) {
            state = next_state(&ctx, &agent, &state, &Decision::Continue, k as f64 + 1.0);
        }
        assert_eq!(state.duration, cap);
        // A mandate extends the work cap past the mandate itself.
        let agent = worker(0, 1, Some(48));
        assert_eq!(max_tracked_duration(&ctx, &agent, Activity::Work), 49);
    }

    #[test]
    fn next_integral_time_states_test() {
        let ctx = context(3);
        let world = World::full(&ctx);
        let agent = home_agent(0);
        // Continue from a fractional time: floor and ceiling anchors.
        let mut state = start_state(&ctx, &agent);
        state.time_of_day = 4.5;
        let anchors =
            next_integral_time_states(&ctx, &world, &agent, &state, &Decision::Continue);
        let times: Vec<f64> = anchors.iter().map(|s| s.time_of_day).collect();
        assert_eq!(times, vec![5.0, 6.0]);
        // End advances no time.
        let anchors = next_integral_time_states(&ctx, &world, &agent, &state, &Decision::End);
        let times: Vec<f64> = anchors.iter().map(|s| s.time_of_day).collect();
        assert_eq!(times, vec![4.0, 5.0]);
        // Travel: one anchor per integral travel duration (10 minutes
        // everywhere, one timestep), plus the extra upper anchor.
        state.activity = Activity::Depart;
        state.time_of_day = 4.0;
        let travel = Decision::Travel(Mode::Walk, Location::NonFixed(Some(1)));
        let anchors = next_integral_time_states(&ctx, &world, &agent, &state, &travel);
        let times: Vec<f64> = anchors.iter().map(|s| s.time_of_day).collect();
        assert_eq!(times, vec![5.0, 6.0]);
    }
}
