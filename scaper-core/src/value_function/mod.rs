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

//! The value-function engine.
//!
//! For a state `s` and decision `d`, the choice weight is
//! `phi(s, d) = exp(u(s, d) + EV(s, d))` where `EV` is the expected value of
//! the next states, linearly interpolated over integral timesteps. The
//! value of a regular state is the logsum `ln sum_d phi(s, d)`; end states
//! are worth 0 and infeasible states `-inf`.
//!
//! The traversal is a memoized depth-first search written with an explicit
//! stack, so deep state spaces cannot overflow the call stack. Compressed
//! all-zones states carry the per-zone values as a column matrix; their
//! cached rows serve both the compressed recursion and the exploded option
//! sets of the simulator.
mod cache;
pub mod deriv;
pub mod interp;

pub use cache::EvCache;

use mat::{BufferPool, Mat, MatPool, Shape};

use self::interp::{DestOffsets, OffsetCache};
use crate::parameters::ModelContext;
use crate::population::Agent;
use crate::state_space::{
    cache_key, classify, next_integral_time_states, next_state, options, Decision, Feasibility,
    Location, State,
};
use crate::utility::UtilitySpec;
use crate::world::World;

/// The per-agent, per-class value function over the state space.
pub struct ValueFunction<'a, 'p> {
    ctx: &'a ModelContext,
    agent: &'a Agent,
    world: &'a World<'a, 'a>,
    utility: &'a dyn UtilitySpec,
    class: usize,
    pool: &'p MatPool,
    cache: EvCache<'p>,
    offsets: OffsetCache,
}

impl<'a, 'p> ValueFunction<'a, 'p> {
    /// Creates the value function with an empty cache.
    pub fn new(
        ctx: &'a ModelContext,
        agent: &'a Agent,
        world: &'a World<'a, 'a>,
        utility: &'a dyn UtilitySpec,
        class: usize,
        mat_pool: &'p MatPool,
        ev_pool: &'p BufferPool,
    ) -> Self {
        let cache = EvCache::new(
            ev_pool,
            world.nb_zones(),
            ctx.config.horizon.day_length(),
            f64::NEG_INFINITY,
        );
        ValueFunction {
            ctx,
            agent,
            world,
            utility,
            class,
            pool: mat_pool,
            cache,
            offsets: OffsetCache::new(),
        }
    }

    /// The latent class of this value function.
    pub fn class(&self) -> usize {
        self.class
    }

    /// The expected value of a concrete state, interpolated in time.
    pub fn expected_value(&mut self, state: &State) -> f64 {
        self.ensure_cached(state);
        let key = cache_key(state);
        let stride = self.cache.stride();
        let offset = match state.location {
            Location::NonFixed(Some(z)) => self.world.z_index(z) * stride,
            Location::NonFixed(None) => {
                panic!("the expected value of a compressed state is a vector")
            }
            _ => 0,
        };
        let day_length = self.ctx.config.horizon.day_length();
        let mut out = [0.0];
        let row = self.cache.row(&key);
        interp::add_ev_uniform(
            &mut out,
            row,
            state.time_of_day,
            DestOffsets::Single(offset),
            day_length,
        );
        out[0]
    }

    /// Makes sure the state (in its compressed form) and everything it can
    /// reach is cached.
    pub fn ensure_cached(&mut self, state: &State) {
        let state = compressed(state);
        match classify(self.ctx, self.agent, &state) {
            Feasibility::End => {
                self.cache.cache_value(&state, 0.0);
                return;
            }
            Feasibility::Bad => {
                self.cache.cache_value(&state, f64::NEG_INFINITY);
                return;
            }
            Feasibility::Good => {}
        }
        if !self.cache.needs_caching(&state) {
            return;
        }
        let mut stack = vec![state];
        while let Some(top) = stack.last().cloned() {
            if !self.cache.needs_caching(&top) {
                stack.pop();
                continue;
            }
            let mut ready = true;
            for decision in options(self.ctx, self.agent, self.world, &top, false) {
                for next in
                    next_integral_time_states(self.ctx, self.world, self.agent, &top, &decision)
                {
                    match classify(self.ctx, self.agent, &next) {
                        Feasibility::End => self.cache.cache_value(&next, 0.0),
                        Feasibility::Bad => self.cache.cache_value(&next, f64::NEG_INFINITY),
                        Feasibility::Good => {
                            if self.cache.needs_caching(&next) {
                                stack.push(next);
                                ready = false;
                            }
                        }
                    }
                }
            }
            if ready {
                let top = stack.pop().unwrap();
                self.compute_and_cache(&top);
            }
        }
    }

    /// The exploded option weights of a concrete state: every decision with
    /// its (scalar) choice weight `phi`.
    pub fn exploded_utilities(&mut self, state: &State) -> Vec<(Decision, f64)> {
        self.ensure_cached(state);
        let decisions = options(self.ctx, self.agent, self.world, state, true);
        decisions
            .into_iter()
            .map(|decision| {
                let phi = self.option_phi(state, &decision);
                debug_assert_eq!(phi.shape(), Shape::Scalar);
                let weight = phi.value(0, 0);
                (decision, weight)
            })
            .collect()
    }

    /// Computes the logsum of a state's options and caches it.
    fn compute_and_cache(&mut self, state: &State) {
        let mut acc = self.pool.acquire(self.value_shape(state));
        for decision in options(self.ctx, self.agent, self.world, state, false) {
            let phi = self.option_phi(state, &decision);
            acc.add(&phi);
        }
        // A zero sum (every option infeasible) becomes `-inf` here.
        acc.log_inplace();
        self.cache.cache(state, &acc);
    }

    /// The exponentiated utility of one option: systematic utility, zone
    /// sampling correction and interpolated expected future value.
    pub(crate) fn option_phi(&mut self, state: &State, decision: &Decision) -> Mat<'p> {
        let mut u = self.pool.acquire(self.decision_shape(state, decision));
        self.utility.accumulate(
            self.ctx,
            self.world,
            self.agent,
            self.class,
            state,
            decision,
            &mut u,
            self.pool,
        );
        if let Decision::Travel(_, dest) = decision {
            let origin = self.world.axis(&state.location);
            let corrections = self.world.corrections(self.pool, origin, dest);
            u.add(&corrections);
        }
        self.add_expected_future(&mut u, state, decision);
        u.exp_inplace();
        u
    }

    /// Adds the interpolated expected value of the decision's next states.
    fn add_expected_future(&mut self, u: &mut Mat<'p>, state: &State, decision: &Decision) {
        let horizon = &self.ctx.config.horizon;
        let day_length = horizon.day_length();
        let stride = self.cache.stride();
        let n = self.world.nb_zones();
        match decision {
            Decision::Travel(mode, dest) => {
                let next = next_state(self.ctx, self.agent, state, decision, state.time_of_day);
                let key = cache_key(&next);
                let t0 = state.time_of_day;
                let origin = self.world.axis(&state.location);
                let destination = self.world.axis(dest);
                // Per-cell arrival times, in timesteps.
                let mut times = self.pool.acquire(u.shape());
                for (base, peak) in [
                    self.world
                        .travel_time(self.pool, *mode, origin, destination, t0),
                    self.world
                        .travel_wait(self.pool, *mode, origin, destination, t0),
                    self.world
                        .travel_access(self.pool, *mode, origin, destination, t0),
                ] {
                    times.add(&base);
                    if let Some(peak) = &peak {
                        times.add(peak);
                    }
                }
                times.scale_inplace(1.0 / horizon.timestep_minutes);
                times.materialize();
                times.add_constant(t0);
                let offsets = match dest {
                    Location::Residence(_) | Location::Workplace(_) => DestOffsets::Zeros,
                    Location::NonFixed(Some(z)) => {
                        DestOffsets::Single(self.world.z_index(*z) * stride)
                    }
                    Location::NonFixed(None) => {
                        DestOffsets::All(self.offsets.all_dests(n, stride, u.shape().len()))
                    }
                };
                let row = self.cache.row(&key);
                interp::add_ev_interpolated(u.data_mut(), row, times.data(), offsets, day_length);
            }
            _ => {
                let dt = match decision {
                    Decision::End => 0.0,
                    _ => horizon.decision_step_at(state.time_of_day),
                };
                let t1 = horizon.snap(state.time_of_day + dt);
                let next = next_state(self.ctx, self.agent, state, decision, t1);
                let key = cache_key(&next);
                let offsets = match next.location {
                    Location::Residence(_) | Location::Workplace(_) => DestOffsets::Zeros,
                    Location::NonFixed(Some(z)) => {
                        DestOffsets::Single(self.world.z_index(z) * stride)
                    }
                    Location::NonFixed(None) => {
                        DestOffsets::All(self.offsets.all_dests(n, stride, u.shape().len()))
                    }
                };
                let row = self.cache.row(&key);
                interp::add_ev_uniform(u.data_mut(), row, t1, offsets, day_length);
            }
        }
    }

    /// The shape of a state's value: a column over zones for compressed
    /// states, a scalar otherwise.
    pub(crate) fn value_shape(&self, state: &State) -> Shape {
        if matches!(state.location, Location::NonFixed(None)) {
            Shape::Col(self.world.nb_zones())
        } else {
            Shape::Scalar
        }
    }

    /// The broadcast shape of a decision's utility matrix.
    pub(crate) fn decision_shape(&self, state: &State, decision: &Decision) -> Shape {
        let n = self.world.nb_zones();
        let origin_all = matches!(state.location, Location::NonFixed(None));
        match decision {
            Decision::Travel(_, Location::NonFixed(None)) => {
                if origin_all {
                    Shape::Full(n)
                } else {
                    Shape::Row(n)
                }
            }
            _ => {
                if origin_all {
                    Shape::Col(n)
                } else {
                    Shape::Scalar
                }
            }
        }
    }

    pub(crate) fn context(&self) -> &'a ModelContext {
        self.ctx
    }

    pub(crate) fn agent_ref(&self) -> &'a Agent {
        self.agent
    }

    pub(crate) fn world_ref(&self) -> &'a World<'a, 'a> {
        self.world
    }

    pub(crate) fn utility_ref(&self) -> &'a dyn UtilitySpec {
        self.utility
    }

    pub(crate) fn mat_pool(&self) -> &'p MatPool {
        self.pool
    }
}

/// The compressed representative of a state: a concrete non-fixed zone is
/// widened to the all-zones form so that cached rows are always complete.
fn compressed(state: &State) -> State {
    match state.location {
        Location::NonFixed(Some(_)) => State {
            location: Location::NonFixed(None),
            ..state.clone()
        },
        _ => state.clone(),
    }
}
