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

//! The latent-class path likelihood over choice sets.
//!
//! Per observation, the builder pre-computes, for every latent class, the
//! estimated-variable rows of the class membership and the
//! variables-by-alternative matrix of the conditional path choice; the
//! fixed utility parts (non-estimated parameters, sampling corrections) go
//! into constant terms. The observed path sits at row 0.
//!
//! Value, gradient and sum-of-score matrix are weighted parallel reductions
//! over the observations.
use anyhow::{bail, Context, Result};
use hashbrown::HashMap;
use log::warn;
use mle::Objective;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::choiceset::Choiceset;
use crate::daypath::trips_to_path;
use crate::parameters::{ModelContext, ParamId};
use crate::population::Agent;
use crate::utility::UtilitySpec;
use crate::world::World;

struct Observation {
    weight: f64,
    /// Per class: estimated-variable row of the class membership.
    class_vars: Vec<DVector<f64>>,
    /// Per class: fixed class-membership utility.
    class_fixed: Vec<f64>,
    /// Per class: alternatives-by-parameters variable matrix (row 0 is the
    /// observed path).
    choice_vars: Vec<DMatrix<f64>>,
    /// Per class: fixed utility per alternative, including the sampling
    /// correction.
    choice_fixed: Vec<DVector<f64>>,
}

/// The latent-class log-likelihood of observed paths against their choice
/// sets, as a function of the estimated parameter vector.
pub struct PathLikelihood {
    observations: Vec<Observation>,
    param_ids: Vec<ParamId>,
}

impl PathLikelihood {
    /// Builds the likelihood from choice sets.
    ///
    /// Fails when no parameter is marked for estimation, when an agent of a
    /// choice set is unknown, or when an estimated parameter never occurs
    /// in the data (its gradient would be identically zero).
    pub fn build(
        ctx: &ModelContext,
        spec: &dyn UtilitySpec,
        agents: &[Agent],
        choicesets: &[Choiceset],
    ) -> Result<Self> {
        let param_ids = ctx.params.estimated();
        if param_ids.is_empty() {
            bail!("No parameter is marked for estimation");
        }
        let index: HashMap<ParamId, usize> = param_ids
            .iter()
            .enumerate()
            .map(|(k, &id)| (id, k))
            .collect();
        let agent_by_id: HashMap<u64, &Agent> = agents.iter().map(|a| (a.id, a)).collect();
        let world = World::full(ctx);
        let nb_classes = ctx.params.nb_classes();
        let dim = param_ids.len();

        let mut observations = Vec::with_capacity(choicesets.len());
        let mut variables = Vec::new();
        for cs in choicesets {
            let agent = agent_by_id
                .get(&cs.agent_id)
                .with_context(|| format!("Choice set for unknown agent {}", cs.agent_id))?;

            // Replay every alternative; the whole observation is dropped
            // when the observed path fails.
            let mut paths = Vec::with_capacity(cs.alternatives.len());
            let mut corrections = Vec::with_capacity(cs.alternatives.len());
            for (j, alternative) in cs.alternatives.iter().enumerate() {
                match trips_to_path(ctx, &world, agent, &alternative.trips) {
                    Some(path) => {
                        paths.push(path);
                        corrections.push(alternative.correction);
                    }
                    None if j == 0 => {
                        warn!(
                            "Skipping agent {}: the observed path is infeasible under the \
                             current model",
                            cs.agent_id
                        );
                        paths.clear();
                        break;
                    }
                    None => {
                        warn!(
                            "Dropping an infeasible alternative of agent {}",
                            cs.agent_id
                        );
                    }
                }
            }
            if paths.is_empty() {
                continue;
            }

            let mut class_vars = Vec::with_capacity(nb_classes);
            let mut class_fixed = Vec::with_capacity(nb_classes);
            let mut choice_vars = Vec::with_capacity(nb_classes);
            let mut choice_fixed = Vec::with_capacity(nb_classes);
            for class in 0..nb_classes {
                variables.clear();
                spec.class_variables(ctx, agent, class, &mut variables);
                let mut row = DVector::zeros(dim);
                let mut fixed = 0.0;
                for &(id, x) in &variables {
                    match index.get(&id) {
                        Some(&k) => row[k] += x,
                        None => fixed += ctx.params.value(id) * x,
                    }
                }
                class_vars.push(row);
                class_fixed.push(fixed);

                let mut vars = DMatrix::zeros(paths.len(), dim);
                let mut fixed = DVector::from_column_slice(&corrections);
                for (j, path) in paths.iter().enumerate() {
                    for (state, decision) in &path.steps {
                        variables.clear();
                        spec.step_variables(
                            ctx, &world, agent, class, state, decision, &mut variables,
                        );
                        for &(id, x) in &variables {
                            match index.get(&id) {
                                Some(&k) => vars[(j, k)] += x,
                                None => fixed[j] += ctx.params.value(id) * x,
                            }
                        }
                    }
                }
                choice_vars.push(vars);
                choice_fixed.push(fixed);
            }
            observations.push(Observation {
                weight: agent.weight,
                class_vars,
                class_fixed,
                choice_vars,
                choice_fixed,
            });
        }
        if observations.is_empty() {
            bail!("No usable observation in the choice sets");
        }

        // Every estimated parameter must occur somewhere in the data.
        let mut used = vec![false; dim];
        for obs in &observations {
            for row in obs.class_vars.iter() {
                for k in 0..dim {
                    used[k] |= row[k] != 0.0;
                }
            }
            for vars in obs.choice_vars.iter() {
                for k in 0..dim {
                    used[k] |= vars.column(k).iter().any(|&v| v != 0.0);
                }
            }
        }
        let missing: Vec<&str> = param_ids
            .iter()
            .zip(used.iter())
            .filter(|(_, &u)| !u)
            .map(|(&id, _)| ctx.params.name(id))
            .collect();
        if !missing.is_empty() {
            bail!(
                "The following estimated parameters are never observed in the data: {}",
                missing.join(", ")
            );
        }
        Ok(PathLikelihood {
            observations,
            param_ids,
        })
    }

    /// Identifiers of the estimated parameters, in the order of the
    /// parameter vector.
    pub fn param_ids(&self) -> &[ParamId] {
        &self.param_ids
    }

    /// Number of usable observations.
    pub fn nb_observations(&self) -> usize {
        self.observations.len()
    }
}

/// Numerically stable softmax.
fn softmax(utilities: &DVector<f64>) -> DVector<f64> {
    let max = utilities.iter().fold(f64::NEG_INFINITY, |m, &v| m.max(v));
    let mut out = utilities.map(|v| (v - max).exp());
    let total: f64 = out.iter().sum();
    out /= total;
    out
}

impl Observation {
    /// Unweighted log-likelihood and gradient of one observation.
    fn ll_grad(&self, theta: &DVector<f64>) -> (f64, DVector<f64>) {
        let nb_classes = self.class_vars.len();
        let dim = theta.len();
        let class_u = DVector::from_iterator(
            nb_classes,
            (0..nb_classes).map(|c| self.class_vars[c].dot(theta) + self.class_fixed[c]),
        );
        let class_probs = softmax(&class_u);

        let mut conditional = Vec::with_capacity(nb_classes);
        let mut likelihood = 0.0;
        for c in 0..nb_classes {
            let u = &self.choice_vars[c] * theta + &self.choice_fixed[c];
            let p = softmax(&u);
            likelihood += class_probs[c] * p[0];
            conditional.push(p);
        }
        if !(likelihood > 0.0) || !likelihood.is_finite() {
            return (f64::NEG_INFINITY, DVector::zeros(dim));
        }

        // Prior mean of the class rows.
        let mut class_mean = DVector::zeros(dim);
        for c in 0..nb_classes {
            class_mean += &self.class_vars[c] * class_probs[c];
        }
        let mut gradient = DVector::zeros(dim);
        for c in 0..nb_classes {
            // Posterior probability of the class given the observed path.
            let posterior = class_probs[c] * conditional[c][0] / likelihood;
            let x0 = self.choice_vars[c].row(0).transpose();
            let x_mean = self.choice_vars[c].transpose() * &conditional[c];
            gradient += (&self.class_vars[c] - &class_mean + x0 - x_mean) * posterior;
        }
        (likelihood.ln(), gradient)
    }
}

impl Objective for PathLikelihood {
    fn dim(&self) -> usize {
        self.param_ids.len()
    }

    fn value(&self, x: &DVector<f64>) -> f64 {
        self.observations
            .par_iter()
            .map(|obs| obs.weight * obs.ll_grad(x).0)
            .sum()
    }

    fn value_grad(&self, x: &DVector<f64>) -> (f64, DVector<f64>) {
        let dim = self.dim();
        self.observations
            .par_iter()
            .map(|obs| {
                let (ll, grad) = obs.ll_grad(x);
                (obs.weight * ll, grad * obs.weight)
            })
            .reduce(
                || (0.0, DVector::zeros(dim)),
                |(va, ga), (vb, gb)| (va + vb, ga + gb),
            )
    }

    fn score_matrix(&self, x: &DVector<f64>) -> DMatrix<f64> {
        let dim = self.dim();
        let (sum_w, sum_wg, sum_wggt) = self
            .observations
            .par_iter()
            .map(|obs| {
                let (_, g) = obs.ll_grad(x);
                let outer = &g * g.transpose() * obs.weight;
                (obs.weight, g * obs.weight, outer)
            })
            .reduce(
                || (0.0, DVector::zeros(dim), DMatrix::zeros(dim, dim)),
                |(wa, ga, ma), (wb, gb, mb)| (wa + wb, ga + gb, ma + mb),
            );
        // Centered second moment of the weighted scores.
        &sum_wggt - &sum_wg * sum_wg.transpose() / sum_w
    }
}
