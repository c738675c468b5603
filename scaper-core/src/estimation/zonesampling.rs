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

//! Estimation of the zone-importance MNL.
//!
//! Every observed trip is a destination choice over all zones; the
//! variables are those of the zone-sampling utility (log-population,
//! log-employment, off-peak car time from the trip origin). Variable
//! blocks are shared between observations with the same origin.
use anyhow::{bail, Result};
use hashbrown::HashMap;
use mle::Objective;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::daypath::Trip;
use crate::parameters::{ModelContext, ParamId};
use crate::population::Agent;
use crate::state_space::Mode;
use crate::world::sampling::ZONE_SAMPLING_PARAMETERS;

struct OriginBlock {
    /// Zones-by-parameters variable matrix.
    vars: DMatrix<f64>,
    /// Fixed utility per zone (non-estimated zone-sampling parameters).
    fixed: DVector<f64>,
}

struct ZsObservation {
    weight: f64,
    destination: usize,
    block: usize,
}

/// The log-likelihood of the observed destinations under the zone-sampling
/// MNL.
pub struct ZoneSamplingLikelihood {
    blocks: Vec<OriginBlock>,
    observations: Vec<ZsObservation>,
    param_ids: Vec<ParamId>,
}

impl ZoneSamplingLikelihood {
    /// Builds the likelihood from the observed trips.
    pub fn build(ctx: &ModelContext, agents: &[Agent], trips: &[Trip]) -> Result<Self> {
        let param_ids: Vec<ParamId> = ZONE_SAMPLING_PARAMETERS
            .iter()
            .filter_map(|name| ctx.params.resolve(name, 0))
            .filter(|&id| ctx.params.is_estimated(id))
            .collect();
        if param_ids.is_empty() {
            bail!(
                "No zone-sampling parameter ({}) is marked for estimation",
                ZONE_SAMPLING_PARAMETERS.join(", ")
            );
        }
        let weight_by_id: HashMap<u64, f64> = agents.iter().map(|a| (a.id, a.weight)).collect();
        let n = ctx.zones.nb_zones;
        let car_time = &ctx.los.mode(Mode::Car).time.offpeak;
        let variable = |name: &str, origin: usize, zone: usize| -> f64 {
            match name {
                "zs_log_pop" => ctx.zones.log_population[zone],
                "zs_log_emp" => ctx.zones.log_employment[zone],
                "zs_time" => car_time[origin * n + zone],
                _ => unreachable!("unknown zone-sampling parameter"),
            }
        };

        let mut blocks: Vec<OriginBlock> = Vec::new();
        let mut block_by_origin: HashMap<usize, usize> = HashMap::new();
        let mut observations = Vec::with_capacity(trips.len());
        for trip in trips {
            let block = *block_by_origin.entry(trip.origin).or_insert_with(|| {
                let mut vars = DMatrix::zeros(n, param_ids.len());
                let mut fixed = DVector::zeros(n);
                for zone in 0..n {
                    for (k, &id) in param_ids.iter().enumerate() {
                        vars[(zone, k)] = variable(ctx.params.name(id), trip.origin, zone);
                    }
                    for name in ZONE_SAMPLING_PARAMETERS {
                        if let Some(id) = ctx.params.resolve(name, 0) {
                            if !ctx.params.is_estimated(id) {
                                fixed[zone] +=
                                    ctx.params.value(id) * variable(name, trip.origin, zone);
                            }
                        }
                    }
                }
                blocks.push(OriginBlock { vars, fixed });
                blocks.len() - 1
            });
            observations.push(ZsObservation {
                weight: weight_by_id.get(&trip.agent_id).copied().unwrap_or(1.0),
                destination: trip.destination,
                block,
            });
        }
        if observations.is_empty() {
            bail!("No observed trip to estimate the zone-sampling model from");
        }
        Ok(ZoneSamplingLikelihood {
            blocks,
            observations,
            param_ids,
        })
    }

    /// Identifiers of the estimated parameters, in the order of the
    /// parameter vector.
    pub fn param_ids(&self) -> &[ParamId] {
        &self.param_ids
    }

    fn ll_grad(&self, obs: &ZsObservation, theta: &DVector<f64>) -> (f64, DVector<f64>) {
        let block = &self.blocks[obs.block];
        let u = &block.vars * theta + &block.fixed;
        let max = u.iter().fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        let exp = u.map(|v| (v - max).exp());
        let total: f64 = exp.iter().sum();
        let p = exp / total;
        let ll = p[obs.destination].ln();
        let x_dest = block.vars.row(obs.destination).transpose();
        let x_mean = block.vars.transpose() * &p;
        (ll, x_dest - x_mean)
    }
}

impl Objective for ZoneSamplingLikelihood {
    fn dim(&self) -> usize {
        self.param_ids.len()
    }

    fn value(&self, x: &DVector<f64>) -> f64 {
        self.observations
            .par_iter()
            .map(|obs| obs.weight * self.ll_grad(obs, x).0)
            .sum()
    }

    fn value_grad(&self, x: &DVector<f64>) -> (f64, DVector<f64>) {
        let dim = self.dim();
        self.observations
            .par_iter()
            .map(|obs| {
                let (ll, grad) = self.ll_grad(obs, x);
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
                let (_, g) = self.ll_grad(obs, x);
                let outer = &g * g.transpose() * obs.weight;
                (obs.weight, g * obs.weight, outer)
            })
            .reduce(
                || (0.0, DVector::zeros(dim), DMatrix::zeros(dim, dim)),
                |(wa, ga, ma), (wb, gb, mb)| (wa + wb, ga + gb, ma + mb),
            );
        &sum_wggt - &sum_wg * sum_wg.transpose() / sum_w
    }
}
