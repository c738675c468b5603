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

//! Parameter estimation: the latent-class path likelihood, the
//! zone-sampling likelihood and the multi-start driver.
pub mod cost;
pub mod zonesampling;

use log::info;
use mle::{maximize, BfgsOptions, Maximum, Objective};
use nalgebra::DVector;
use rand::Rng;

/// Maximizes the objective from `x0`, with `restarts - 1` additional runs
/// from multiplicatively perturbed starting points (each coordinate scaled
/// by `restart_scale * U(0, 1)`). The best finite maximum wins.
pub fn maximize_with_restarts<R: Rng>(
    objective: &dyn Objective,
    x0: &DVector<f64>,
    restarts: usize,
    restart_scale: f64,
    numerical_hessian: bool,
    rng: &mut R,
) -> Maximum {
    let options = BfgsOptions {
        numerical_hessian,
        ..Default::default()
    };
    let restarts = restarts.max(1);
    let mut best: Option<Maximum> = None;
    for run in 0..restarts {
        let start = if run == 0 {
            x0.clone()
        } else {
            x0.map(|v| v * restart_scale * rng.gen::<f64>())
        };
        info!("Estimation run {} of {restarts}", run + 1);
        let maximum = maximize(objective, &start, &options);
        info!(
            "Run {}: log-likelihood {:.6} after {} iterations ({:?})",
            run + 1,
            maximum.value,
            maximum.iterations,
            maximum.termination
        );
        if best
            .as_ref()
            .map_or(true, |b| maximum.value > b.value && maximum.value.is_finite())
        {
            best = Some(maximum);
        }
    }
    best.expect("at least one estimation run")
}
