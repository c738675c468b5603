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

//! The utility specification.
//!
//! A [UtilitySpec] turns `(state, decision)` pairs into utility: as
//! broadcast matrices for the value-function engine, and as named-variable
//! sequences (parameter id, value) for path evaluation and estimation. The
//! utility is linear in the parameters, so the two forms agree by
//! construction: the matrix form is the dot product of the variables with
//! the current parameter values.
//!
//! [ScaperUtility] is the default specification; it resolves its
//! coefficients against the parameter table once, per latent class, with
//! the table's permissive missing-name rule.
use mat::{Mat, MatPool};

use crate::parameters::{ModelContext, ParamId, Params};
use crate::population::Agent;
use crate::state_space::{Activity, Decision, LocationCase, Mode, State, Vehicle, NB_MODES};
use crate::world::{Axis, World};

/// Cost multiplier of transit trips for card holders.
const TRANSIT_CARD_COST_FACTOR: f64 = 0.5;

/// A pluggable utility specification.
pub trait UtilitySpec: Sync {
    /// Accumulates the utility of taking `decision` in `state` into `u`,
    /// in the decision's broadcast shape, under the current parameter
    /// values. Zone-sampling corrections are *not* part of the utility;
    /// the engine adds them.
    #[allow(clippy::too_many_arguments)]
    fn accumulate<'m>(
        &self,
        ctx: &ModelContext,
        world: &World,
        agent: &Agent,
        class: usize,
        state: &State,
        decision: &Decision,
        u: &mut Mat<'m>,
        pool: &'m MatPool,
    );

    /// Pushes the named variables of a concrete-zone step: pairs of
    /// parameter id and variable value whose dot product with the
    /// parameter vector is the step utility.
    #[allow(clippy::too_many_arguments)]
    fn step_variables(
        &self,
        ctx: &ModelContext,
        world: &World,
        agent: &Agent,
        class: usize,
        state: &State,
        decision: &Decision,
        out: &mut Vec<(ParamId, f64)>,
    );

    /// Pushes the named variables of the class-membership utility of
    /// `class` (empty for the reference class 0).
    fn class_variables(
        &self,
        ctx: &ModelContext,
        agent: &Agent,
        class: usize,
        out: &mut Vec<(ParamId, f64)>,
    );

    /// The in-vehicle travel-time coefficient, for the sensitivity engine.
    fn travel_time_coefficient(&self, class: usize, mode: Mode) -> f64;
}

/// A coefficient resolved against the parameter table: its id (when the
/// parameter exists) and its current value (0 when missing).
#[derive(Clone, Copy, Debug, Default)]
struct Coefficient {
    id: Option<ParamId>,
    value: f64,
}

impl Coefficient {
    fn resolve(params: &Params, name: &str, class: usize) -> Self {
        match params.resolve(name, class) {
            Some(id) => Coefficient {
                id: Some(id),
                value: params.value(id),
            },
            None => Coefficient::default(),
        }
    }

    fn push(self, value: f64, out: &mut Vec<(ParamId, f64)>) {
        if let Some(id) = self.id {
            out.push((id, value));
        }
    }
}

#[derive(Clone, Debug, Default)]
struct ClassCoefficients {
    asc: [Coefficient; NB_MODES],
    b_time: [Coefficient; NB_MODES],
    b_wait: Coefficient,
    b_access: Coefficient,
    b_cost: Coefficient,
    b_log_pop: Coefficient,
    b_log_emp: Coefficient,
    duration: [Coefficient; 4],
    start_asc: [Coefficient; 4],
    cls_const: Coefficient,
    cls_age: Coefficient,
    cls_income: Coefficient,
    cls_kids: Coefficient,
}

/// Index of an activity in the per-activity coefficient arrays.
fn activity_slot(activity: Activity) -> Option<usize> {
    match activity {
        Activity::Home => Some(0),
        Activity::Work => Some(1),
        Activity::Shop => Some(2),
        Activity::Other => Some(3),
        Activity::Depart | Activity::Arrive => None,
    }
}

/// The default utility specification.
#[derive(Clone, Debug)]
pub struct ScaperUtility {
    classes: Vec<ClassCoefficients>,
}

impl ScaperUtility {
    /// Resolves the coefficients of every latent class against the
    /// parameter table.
    pub fn new(ctx: &ModelContext) -> Self {
        let params = &ctx.params;
        let classes = (0..params.nb_classes())
            .map(|class| {
                let mut c = ClassCoefficients::default();
                for mode in Mode::ALL {
                    let i = mode.index();
                    c.asc[i] = Coefficient::resolve(params, &format!("asc_{}", mode.name()), class);
                    c.b_time[i] =
                        Coefficient::resolve(params, &format!("b_time_{}", mode.name()), class);
                }
                c.b_wait = Coefficient::resolve(params, "b_wait", class);
                c.b_access = Coefficient::resolve(params, "b_access", class);
                c.b_cost = Coefficient::resolve(params, "b_cost", class);
                c.b_log_pop = Coefficient::resolve(params, "b_log_pop", class);
                c.b_log_emp = Coefficient::resolve(params, "b_log_emp", class);
                for activity in [Activity::Home, Activity::Work, Activity::Shop, Activity::Other] {
                    let slot = activity_slot(activity).unwrap();
                    c.duration[slot] =
                        Coefficient::resolve(params, &format!("dur_{}", activity.name()), class);
                }
                for &activity in &ctx.config.discretionary {
                    if let Some(slot) = activity_slot(activity) {
                        c.start_asc[slot] = Coefficient::resolve(
                            params,
                            &format!("asc_{}", activity.name()),
                            class,
                        );
                    }
                }
                if class > 0 {
                    c.cls_const = Coefficient::resolve(params, "cls_const", class);
                    c.cls_age = Coefficient::resolve(params, "cls_age", class);
                    c.cls_income = Coefficient::resolve(params, "cls_income", class);
                    c.cls_kids = Coefficient::resolve(params, "cls_kids", class);
                }
                c
            })
            .collect();
        ScaperUtility { classes }
    }

    fn cost_factor(agent: &Agent, mode: Mode) -> f64 {
        if mode == Mode::Transit && agent.transit_card {
            TRANSIT_CARD_COST_FACTOR
        } else {
            1.0
        }
    }
}

impl UtilitySpec for ScaperUtility {
    fn accumulate<'m>(
        &self,
        ctx: &ModelContext,
        world: &World,
        agent: &Agent,
        class: usize,
        state: &State,
        decision: &Decision,
        u: &mut Mat<'m>,
        pool: &'m MatPool,
    ) {
        let c = &self.classes[class];
        match decision {
            Decision::Travel(mode, dest) => {
                let i = mode.index();
                let t = state.time_of_day;
                let origin = world.axis(&state.location);
                let destination = world.axis(dest);
                u.add_constant(c.asc[i].value);
                for (coefficient, (mut base, peak)) in [
                    (
                        c.b_time[i].value,
                        world.travel_time(pool, *mode, origin, destination, t),
                    ),
                    (
                        c.b_wait.value,
                        world.travel_wait(pool, *mode, origin, destination, t),
                    ),
                    (
                        c.b_access.value,
                        world.travel_access(pool, *mode, origin, destination, t),
                    ),
                    (
                        c.b_cost.value * Self::cost_factor(agent, *mode),
                        world.travel_cost(pool, *mode, origin, destination, t),
                    ),
                ] {
                    base.scale_inplace(coefficient);
                    u.add(&base);
                    if let Some(mut peak) = peak {
                        peak.scale_inplace(coefficient);
                        u.add(&peak);
                    }
                }
                if dest.case() == LocationCase::NonFixed {
                    let mut pop = world.log_pop(pool, destination);
                    pop.scale_inplace(c.b_log_pop.value);
                    u.add(&pop);
                    let mut emp = world.log_emp(pool, destination);
                    emp.scale_inplace(c.b_log_emp.value);
                    u.add(&emp);
                }
            }
            Decision::Start(_) | Decision::Continue => {
                let activity = match decision {
                    Decision::Start(a) => *a,
                    _ => state.activity,
                };
                let steps = ctx.config.horizon.decision_step_at(state.time_of_day);
                if let Some(slot) = activity_slot(activity) {
                    u.add_constant(c.duration[slot].value * steps);
                    if matches!(decision, Decision::Start(_)) {
                        u.add_constant(c.start_asc[slot].value);
                    }
                }
                if state.vehicle == Vehicle::Car && activity != Activity::Home {
                    let minutes = ctx.config.horizon.timesteps_to_minutes(steps);
                    let mut parking = world.parking_rate(pool, world.axis(&state.location));
                    parking.scale_inplace(c.b_cost.value * minutes);
                    u.add(&parking);
                }
            }
            Decision::End => {}
        }
    }

    fn step_variables(
        &self,
        ctx: &ModelContext,
        world: &World,
        agent: &Agent,
        class: usize,
        state: &State,
        decision: &Decision,
        out: &mut Vec<(ParamId, f64)>,
    ) {
        let c = &self.classes[class];
        match decision {
            Decision::Travel(mode, dest) => {
                let i = mode.index();
                let t = state.time_of_day;
                let o = world.z_index(state.location.zone().expect("concrete travel step"));
                let d = world.z_index(dest.zone().expect("concrete travel step"));
                c.asc[i].push(1.0, out);
                c.b_time[i].push(world.scalar_time(*mode, o, d, t), out);
                c.b_wait.push(world.scalar_wait(*mode, o, d, t), out);
                c.b_access.push(world.scalar_access(*mode, o, d, t), out);
                c.b_cost.push(
                    world.scalar_cost(*mode, o, d, t) * Self::cost_factor(agent, *mode),
                    out,
                );
                if dest.case() == LocationCase::NonFixed {
                    c.b_log_pop.push(world.log_pop_value(d), out);
                    c.b_log_emp.push(world.log_emp_value(d), out);
                }
            }
            Decision::Start(_) | Decision::Continue => {
                let activity = match decision {
                    Decision::Start(a) => *a,
                    _ => state.activity,
                };
                let steps = ctx.config.horizon.decision_step_at(state.time_of_day);
                if let Some(slot) = activity_slot(activity) {
                    c.duration[slot].push(steps, out);
                    if matches!(decision, Decision::Start(_)) {
                        c.start_asc[slot].push(1.0, out);
                    }
                }
                if state.vehicle == Vehicle::Car && activity != Activity::Home {
                    let z = world.z_index(state.location.zone().expect("concrete activity step"));
                    let minutes = ctx.config.horizon.timesteps_to_minutes(steps);
                    c.b_cost.push(world.parking_value(z) * minutes, out);
                }
            }
            Decision::End => {}
        }
    }

    fn class_variables(
        &self,
        _ctx: &ModelContext,
        agent: &Agent,
        class: usize,
        out: &mut Vec<(ParamId, f64)>,
    ) {
        if class == 0 {
            return;
        }
        let c = &self.classes[class];
        c.cls_const.push(1.0, out);
        c.cls_age.push(agent.age, out);
        c.cls_income.push(agent.income, out);
        c.cls_kids.push(if agent.has_kids { 1.0 } else { 0.0 }, out);
    }

    fn travel_time_coefficient(&self, class: usize, mode: Mode) -> f64 {
        self.classes[class].b_time[mode.index()].value
    }
}

#[cfg(test)]
mod tests {
    use mat::Shape;

    use super::*;
    use crate::parameters::{ModelConfig, Parameter};
    use crate::population::tests::home_agent;
    use crate::state_space::{start_state, Location};
    use crate::world::tests::{constant_los, uniform_zones};

    fn parameter(name: &str, value: f64) -> Parameter {
        Parameter {
            name: name.to_owned(),
            value,
            estimate: false,
        }
    }

    fn context() -> ModelContext {
        let config = ModelConfig::default();
        let params = Params::new(vec![
            parameter("asc_walk", -0.5),
            parameter("b_time_walk", -0.1),
            parameter("b_cost", -0.2),
            parameter("dur_home", 0.3),
            parameter("b_log_pop", 0.7),
        ])
        .unwrap();
        let los = constant_los(3, &config.horizon, 10.0);
        ModelContext::new(config, params, uniform_zones(3), los)
    }

    #[test]
    fn matrix_and_variables_agree_test() {
        // The matrix form must equal the dot product of the named
        // variables with the parameter values.
        let ctx = context();
        let world = World::full(&ctx);
        let spec = ScaperUtility::new(&ctx);
        let agent = home_agent(0);
        let pool = MatPool::new(3);
        let mut state = start_state(&ctx, &agent);
        state.activity = Activity::Depart;
        let decision = Decision::Travel(Mode::Walk, Location::NonFixed(Some(2)));

        let mut u = pool.acquire(Shape::Scalar);
        spec.accumulate(&ctx, &world, &agent, 0, &state, &decision, &mut u, &pool);

        let mut variables = Vec::new();
        spec.step_variables(&ctx, &world, &agent, 0, &state, &decision, &mut variables);
        let dot: f64 = variables
            .iter()
            .map(|&(id, x)| ctx.params.value(id) * x)
            .sum();
        assert!((u.value(0, 0) - dot).abs() < 1e-12);
        // asc_walk + b_time_walk * 10 + b_cost * 1 + b_log_pop * ln(1001).
        let expected = -0.5 - 0.1 * 10.0 - 0.2 + 0.7 * 1001.0f64.ln();
        assert!((dot - expected).abs() < 1e-12);
    }

    #[test]
    fn continue_utility_test() {
        let ctx = context();
        let world = World::full(&ctx);
        let spec = ScaperUtility::new(&ctx);
        let agent = home_agent(0);
        let pool = MatPool::new(3);
        let state = start_state(&ctx, &agent);
        let mut u = pool.acquire(Shape::Scalar);
        spec.accumulate(
            &ctx,
            &world,
            &agent,
            0,
            &state,
            &Decision::Continue,
            &mut u,
            &pool,
        );
        // One decision step of the home duration rate.
        assert!((u.value(0, 0) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn end_has_no_utility_test() {
        let ctx = context();
        let world = World::full(&ctx);
        let spec = ScaperUtility::new(&ctx);
        let agent = home_agent(0);
        let pool = MatPool::new(3);
        let state = start_state(&ctx, &agent);
        let mut u = pool.acquire(Shape::Scalar);
        spec.accumulate(&ctx, &world, &agent, 0, &state, &Decision::End, &mut u, &pool);
        assert_eq!(u.value(0, 0), 0.0);
    }

    #[test]
    fn missing_parameters_resolve_to_zero_test() {
        let ctx = context();
        let spec = ScaperUtility::new(&ctx);
        // `b_time_car` is not in the table: coefficient 0, no variable.
        assert_eq!(spec.travel_time_coefficient(0, Mode::Car), 0.0);
        assert_eq!(spec.travel_time_coefficient(0, Mode::Walk), -0.1);
    }
}
