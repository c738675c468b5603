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

//! Travel-time sensitivity of the value function.
//!
//! Alongside the expected-value rows, a second cache (zero-defaulted)
//! accumulates `dV(s) = sum_d P(d|s) (du(s,d) + dEV(s,d))`, the derivative
//! of the value with respect to a uniform scaling of in-vehicle travel
//! times. `du` is the travel-time coefficient times the unscaled in-vehicle
//! minutes; `dEV` chains through the interpolation, a slope term carrying
//! the arrival-time shift.
use mat::{BufferPool, Mat, MatPool};

use super::interp::{self, DestOffsets};
use super::{EvCache, ValueFunction};
use crate::parameters::ModelContext;
use crate::population::Agent;
use crate::state_space::{
    cache_key, classify, next_integral_time_states, next_state, options, Decision, Feasibility,
    Location, State,
};
use crate::utility::UtilitySpec;
use crate::world::World;

/// A value function paired with its travel-time derivative.
pub struct DerivEngine<'a, 'p> {
    vf: ValueFunction<'a, 'p>,
    dcache: EvCache<'p>,
}

impl<'a, 'p> DerivEngine<'a, 'p> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: &'a ModelContext,
        agent: &'a Agent,
        world: &'a World<'a, 'a>,
        utility: &'a dyn UtilitySpec,
        class: usize,
        mat_pool: &'p MatPool,
        ev_pool: &'p BufferPool,
    ) -> Self {
        let vf = ValueFunction::new(ctx, agent, world, utility, class, mat_pool, ev_pool);
        let dcache = EvCache::new(
            ev_pool,
            world.nb_zones(),
            ctx.config.horizon.day_length(),
            0.0,
        );
        DerivEngine { vf, dcache }
    }

    /// The expected value of a concrete state and its derivative with
    /// respect to the travel-time scale.
    pub fn expected_value_and_derivative(&mut self, state: &State) -> (f64, f64) {
        let ev = self.vf.expected_value(state);
        self.ensure_derivative(state);
        let key = cache_key(state);
        let stride = self.dcache.stride();
        let offset = match state.location {
            Location::NonFixed(Some(z)) => self.vf.world_ref().z_index(z) * stride,
            Location::NonFixed(None) => panic!("the derivative of a compressed state is a vector"),
            _ => 0,
        };
        let day_length = self.vf.context().config.horizon.day_length();
        let mut out = [0.0];
        let row = self.dcache.row(&key);
        interp::add_ev_uniform(
            &mut out,
            row,
            state.time_of_day,
            DestOffsets::Single(offset),
            day_length,
        );
        (ev, out[0])
    }

    /// Mirrors the value-function traversal for the derivative cache.
    fn ensure_derivative(&mut self, state: &State) {
        let ctx = self.vf.context();
        let agent = self.vf.agent_ref();
        let world = self.vf.world_ref();
        let state = match state.location {
            Location::NonFixed(Some(_)) => State {
                location: Location::NonFixed(None),
                ..state.clone()
            },
            _ => state.clone(),
        };
        if classify(ctx, agent, &state) != Feasibility::Good {
            self.dcache.cache_value(&state, 0.0);
            return;
        }
        if !self.dcache.needs_caching(&state) {
            return;
        }
        let mut stack = vec![state];
        while let Some(top) = stack.last().cloned() {
            if !self.dcache.needs_caching(&top) {
                stack.pop();
                continue;
            }
            let mut ready = true;
            for decision in options(ctx, agent, world, &top, false) {
                for next in next_integral_time_states(ctx, world, agent, &top, &decision) {
                    match classify(ctx, agent, &next) {
                        Feasibility::Good => {
                            if self.dcache.needs_caching(&next) {
                                stack.push(next);
                                ready = false;
                            }
                        }
                        // Terminal values do not move with travel time.
                        _ => self.dcache.cache_value(&next, 0.0),
                    }
                }
            }
            if ready {
                let top = stack.pop().unwrap();
                self.compute_derivative(&top);
            }
        }
    }

    /// The choice-probability-weighted derivative of one state.
    fn compute_derivative(&mut self, state: &State) {
        let ctx = self.vf.context();
        let agent = self.vf.agent_ref();
        let world = self.vf.world_ref();
        let pool = self.vf.mat_pool();
        let shape = self.vf.value_shape(state);
        let mut numerator = pool.acquire(shape);
        let mut denominator = pool.acquire(shape);
        for decision in options(ctx, agent, world, state, false) {
            let phi = self.vf.option_phi(state, &decision);
            let mut term = self.option_derivative(state, &decision);
            term.mul_inplace(&phi);
            numerator.add(&term);
            denominator.add(&phi);
        }
        // Zero total weight (an infeasible state): the numerator is zero
        // too and the derivative stays zero.
        numerator.div_ignore_zero(&denominator);
        self.dcache.cache(state, &numerator);
    }

    /// `du + dEV` of one decision, in the decision's broadcast shape.
    fn option_derivative(&mut self, state: &State, decision: &Decision) -> Mat<'p> {
        let ctx = self.vf.context();
        let agent = self.vf.agent_ref();
        let world = self.vf.world_ref();
        let pool = self.vf.mat_pool();
        let horizon = &ctx.config.horizon;
        let day_length = horizon.day_length();
        let stride = self.dcache.stride();
        let n = world.nb_zones();
        let mut g = pool.acquire(self.vf.decision_shape(state, decision));
        match decision {
            Decision::Travel(mode, dest) => {
                let t0 = state.time_of_day;
                let origin = world.axis(&state.location);
                let destination = world.axis(dest);
                let alpha = world.tt_scale();
                // du: the travel-time coefficient times the unscaled
                // in-vehicle minutes.
                let coefficient = self
                    .vf
                    .utility_ref()
                    .travel_time_coefficient(self.vf.class(), *mode);
                let (mut base, peak) = world.travel_time(pool, *mode, origin, destination, t0);
                base.scale_inplace(coefficient / alpha);
                g.add(&base);
                if let Some(mut peak) = peak {
                    peak.scale_inplace(coefficient / alpha);
                    g.add(&peak);
                }
                // Arrival times and their sensitivity to the scale; only
                // the in-vehicle part moves with it.
                let mut times = pool.acquire(g.shape());
                let mut dtau = pool.acquire(g.shape());
                for (is_time, (base, peak)) in [
                    (true, world.travel_time(pool, *mode, origin, destination, t0)),
                    (false, world.travel_wait(pool, *mode, origin, destination, t0)),
                    (
                        false,
                        world.travel_access(pool, *mode, origin, destination, t0),
                    ),
                ] {
                    times.add(&base);
                    if is_time {
                        dtau.add(&base);
                    }
                    if let Some(peak) = &peak {
                        times.add(peak);
                        if is_time {
                            dtau.add(peak);
                        }
                    }
                }
                times.scale_inplace(1.0 / horizon.timestep_minutes);
                times.materialize();
                times.add_constant(t0);
                dtau.scale_inplace(1.0 / (alpha * horizon.timestep_minutes));
                dtau.materialize();
                let next = next_state(ctx, agent, state, decision, t0);
                let key = cache_key(&next);
                let offsets = match dest {
                    Location::Residence(_) | Location::Workplace(_) => DestOffsets::Zeros,
                    Location::NonFixed(Some(z)) => DestOffsets::Single(world.z_index(*z) * stride),
                    Location::NonFixed(None) => {
                        DestOffsets::All(self.vf.offsets.all_dests(n, stride, g.shape().len()))
                    }
                };
                let ev_row = self.vf.cache.row(&key);
                let dev_row = self.dcache.row(&key);
                interp::add_ev_derivative(
                    g.data_mut(),
                    ev_row,
                    dev_row,
                    times.data(),
                    dtau.data(),
                    offsets,
                    day_length,
                );
            }
            _ => {
                let dt = match decision {
                    Decision::End => 0.0,
                    _ => horizon.decision_step_at(state.time_of_day),
                };
                let t1 = horizon.snap(state.time_of_day + dt);
                let next = next_state(ctx, agent, state, decision, t1);
                let key = cache_key(&next);
                let offsets = match next.location {
                    Location::Residence(_) | Location::Workplace(_) => DestOffsets::Zeros,
                    Location::NonFixed(Some(z)) => DestOffsets::Single(world.z_index(z) * stride),
                    Location::NonFixed(None) => {
                        DestOffsets::All(self.vf.offsets.all_dests(n, stride, g.shape().len()))
                    }
                };
                let row = self.dcache.row(&key);
                interp::add_ev_uniform(g.data_mut(), row, t1, offsets, day_length);
            }
        }
        g
    }
}
