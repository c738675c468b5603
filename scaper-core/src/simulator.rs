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

//! The path simulator: draws one day-path from the choice distribution
//! induced by the value function.
//!
//! Each step computes the exploded option weights of the current state,
//! draws one by inverse-CDF sampling and advances deterministically. A
//! zero-weight sum or an infeasible state inside the walk is unreachable by
//! construction, so both panic: they indicate a bug in the state space or
//! the value function.
use rand::Rng;

use crate::daypath::DayPath;
use crate::parameters::ModelContext;
use crate::population::Agent;
use crate::state_space::{classify, next_single_state, start_state, Feasibility, State};
use crate::utility::UtilitySpec;
use crate::value_function::ValueFunction;
use crate::world::World;

/// The class-membership probabilities of an agent: a softmax over the
/// class-membership utilities (class 0 is the reference).
pub fn class_probabilities(ctx: &ModelContext, spec: &dyn UtilitySpec, agent: &Agent) -> Vec<f64> {
    let nb_classes = ctx.params.nb_classes();
    let mut variables = Vec::new();
    let utilities: Vec<f64> = (0..nb_classes)
        .map(|class| {
            variables.clear();
            spec.class_variables(ctx, agent, class, &mut variables);
            variables
                .iter()
                .map(|&(id, x)| ctx.params.value(id) * x)
                .sum()
        })
        .collect();
    let max = utilities.iter().fold(f64::NEG_INFINITY, |m, &v| m.max(v));
    let mut probabilities: Vec<f64> = utilities.iter().map(|&v| (v - max).exp()).collect();
    let total: f64 = probabilities.iter().sum();
    for p in probabilities.iter_mut() {
        *p /= total;
    }
    probabilities
}

/// Draws a latent class from the class-membership probabilities.
pub fn draw_class<R: Rng>(
    ctx: &ModelContext,
    spec: &dyn UtilitySpec,
    agent: &Agent,
    rng: &mut R,
) -> usize {
    let probabilities = class_probabilities(ctx, spec, agent);
    let u: f64 = rng.gen();
    let mut cumulative = 0.0;
    for (class, &p) in probabilities.iter().enumerate() {
        cumulative += p;
        if u < cumulative {
            return class;
        }
    }
    probabilities.len() - 1
}

/// The per-option probabilities of one state, in the order of the exploded
/// options. Exposed for the equivalence checks of the test suite.
pub fn step_probabilities(vf: &mut ValueFunction, state: &State) -> Vec<f64> {
    let weights = vf.exploded_utilities(state);
    let total: f64 = weights.iter().map(|(_, w)| w).sum();
    weights.into_iter().map(|(_, w)| w / total).collect()
}

/// Simulates one day-path of the agent under the value function's class.
pub fn simulate_day<R: Rng>(
    ctx: &ModelContext,
    world: &World,
    agent: &Agent,
    vf: &mut ValueFunction,
    rng: &mut R,
) -> DayPath {
    let mut steps = Vec::new();
    let mut state = start_state(ctx, agent);
    loop {
        match classify(ctx, agent, &state) {
            Feasibility::End => return DayPath { steps, end: state },
            Feasibility::Bad => panic!(
                "impossible state: simulation reached an infeasible state {state:?} for agent {}",
                agent.id
            ),
            Feasibility::Good => {}
        }
        let weights = vf.exploded_utilities(&state);
        let total: f64 = weights.iter().map(|(_, w)| w).sum();
        assert!(
            total > 0.0 && total.is_finite(),
            "impossible state: zero or non-finite choice weight at {state:?} for agent {}",
            agent.id
        );
        let mut draw = rng.gen::<f64>() * total;
        // Rounding at the top of the CDF must not select a zero-weight
        // option: fall back to the last positive one.
        let mut chosen = weights.iter().rposition(|&(_, w)| w > 0.0).unwrap();
        for (i, (_, w)) in weights.iter().enumerate() {
            draw -= w;
            if draw < 0.0 {
                chosen = i;
                break;
            }
        }
        let decision = weights[chosen].0;
        let next = next_single_state(ctx, world, agent, &state, &decision);
        steps.push((state, decision));
        state = next;
    }
}
