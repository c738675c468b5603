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

//! Importance sampling of zones.
//!
//! A sampled world keeps the agent's required zones (home, work, observed
//! trip ends) and fills the remaining slots by independent draws with
//! replacement from a destination-choice MNL. Duplicates are kept: each
//! slot is a separate alternative whose correction makes the estimator
//! unbiased.
use hashbrown::HashMap;
use mat::BufferPool;
use rand::Rng;

use super::{minute_range, SampledComponent, SampledMode, World, ZoneSample};
use crate::parameters::ModelContext;
use crate::population::Agent;
use crate::state_space::Mode;

/// Names of the zone-sampling parameters.
pub const ZONE_SAMPLING_PARAMETERS: [&str; 3] = ["zs_log_pop", "zs_log_emp", "zs_time"];

/// The destination-choice utility of every zone for the zone-sampling MNL.
///
/// The variables are the log-population and log-employment of the zone and
/// the off-peak car travel time from the agent's home.
pub fn zone_utilities(ctx: &ModelContext, agent: &Agent) -> Vec<f64> {
    let n = ctx.zones.nb_zones;
    let b_pop = ctx.params.get("zs_log_pop", 0);
    let b_emp = ctx.params.get("zs_log_emp", 0);
    let b_time = ctx.params.get("zs_time", 0);
    let car_time = &ctx.los.mode(Mode::Car).time.offpeak;
    let home = agent.home_zone;
    (0..n)
        .map(|d| {
            b_pop * ctx.zones.log_population[d]
                + b_emp * ctx.zones.log_employment[d]
                + b_time * car_time[home * n + d]
        })
        .collect()
}

/// The normalized zone-sampling probabilities of an agent.
pub fn zone_probabilities(ctx: &ModelContext, agent: &Agent) -> Vec<f64> {
    let utilities = zone_utilities(ctx, agent);
    let max = utilities.iter().fold(f64::NEG_INFINITY, |m, &v| m.max(v));
    let mut probs: Vec<f64> = utilities.iter().map(|&v| (v - max).exp()).collect();
    let sum: f64 = probs.iter().sum();
    for p in probs.iter_mut() {
        *p /= sum;
    }
    probs
}

/// Samples a world of `size` zones for the agent.
///
/// The required zones come first (deduplicated, order preserved); the
/// remaining slots are drawn with replacement from the zone-sampling MNL.
/// The correction term of a destination slot `d` is `-ln(size * p_d)`.
pub fn sample_world<'c, 'w, R: Rng>(
    ctx: &'c ModelContext,
    agent: &Agent,
    size: usize,
    required: &[usize],
    rng: &mut R,
    pool: &'w BufferPool,
) -> World<'c, 'w> {
    let probs = zone_probabilities(ctx, agent);
    let mut zones: Vec<usize> = Vec::with_capacity(size);
    for &z in required {
        if !zones.contains(&z) {
            zones.push(z);
        }
    }
    let cumulative: Vec<f64> = probs
        .iter()
        .scan(0.0, |sum, &p| {
            *sum += p;
            Some(*sum)
        })
        .collect();
    while zones.len() < size {
        let u: f64 = rng.gen();
        let z = cumulative.partition_point(|&c| c <= u).min(probs.len() - 1);
        zones.push(z);
    }
    build_sample(ctx, zones, &probs, size, pool)
}

fn build_sample<'c, 'w>(
    ctx: &'c ModelContext,
    zones: Vec<usize>,
    probs: &[f64],
    size: usize,
    pool: &'w BufferPool,
) -> World<'c, 'w> {
    let ns = zones.len();
    let n = ctx.zones.nb_zones;
    // Duplicate slots keep the index of their first occurrence.
    let mut z_index = HashMap::with_capacity(ns);
    for (local, &zone) in zones.iter().enumerate() {
        z_index.entry(zone).or_insert(local);
    }
    let dest_correction: Vec<f64> = zones
        .iter()
        .map(|&z| -(size as f64 * probs[z]).ln())
        .collect();

    let gather_zone_vector = |values: &[f64]| {
        let mut buf = pool.acquire(ns, 0.0);
        for (local, &zone) in zones.iter().enumerate() {
            buf[local] = values[zone];
        }
        buf
    };
    let gather_od = |values: &[f64]| {
        let mut buf = pool.acquire(ns * ns, 0.0);
        for (o_local, &o) in zones.iter().enumerate() {
            for (d_local, &d) in zones.iter().enumerate() {
                buf[o_local * ns + d_local] = values[o * n + d];
            }
        }
        buf
    };
    let gather_component = |c: &super::LosComponent| SampledComponent {
        peak: c.peak.as_ref().map(|v| gather_od(v)),
        offpeak: gather_od(&c.offpeak),
    };

    let modes = Mode::ALL
        .iter()
        .map(|&mode| {
            let source = ctx.los.mode(mode);
            let time = gather_component(&source.time);
            let wait = gather_component(&source.wait);
            let access = gather_component(&source.access);
            let cost = gather_component(&source.cost);
            let minute_range = minute_range(
                (
                    time.offpeak.as_slice(),
                    time.peak.as_deref().map(|v| v.as_slice()),
                ),
                (
                    wait.offpeak.as_slice(),
                    wait.peak.as_deref().map(|v| v.as_slice()),
                ),
                (
                    access.offpeak.as_slice(),
                    access.peak.as_deref().map(|v| v.as_slice()),
                ),
            );
            SampledMode {
                time,
                wait,
                access,
                cost,
                minute_range,
            }
        })
        .collect();

    let sample = ZoneSample {
        z_index,
        dest_correction,
        modes,
        population: gather_zone_vector(&ctx.zones.population),
        employment: gather_zone_vector(&ctx.zones.employment),
        parking_per_minute: gather_zone_vector(&ctx.zones.parking_per_minute),
        log_population: gather_zone_vector(&ctx.zones.log_population),
        log_employment: gather_zone_vector(&ctx.zones.log_employment),
        zones,
    };
    World::sampled(ctx, sample)
}

#[cfg(test)]
mod tests {
    use mat::{MatPool, Shape};
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    use super::*;
    use crate::parameters::{ModelConfig, Params};
    use crate::state_space::Location;
    use crate::world::tests::{constant_los, uniform_zones};
    use crate::world::Axis;

    fn context(nb_zones: usize) -> ModelContext {
        let config = ModelConfig::default();
        let los = constant_los(nb_zones, &config.horizon, 10.0);
        ModelContext::new(config, Params::empty(), uniform_zones(nb_zones), los)
    }

    #[test]
    fn required_zones_come_first_test() {
        let ctx = context(60);
        let agent = crate::population::tests::home_agent(7);
        let pool = BufferPool::new();
        let mut rng = XorShiftRng::seed_from_u64(42);
        let world = sample_world(&ctx, &agent, 20, &[7, 13], &mut rng, &pool);
        assert!(world.is_sampled());
        assert_eq!(world.nb_zones(), 20);
        assert_eq!(&world.zones()[..2], &[7, 13]);
        assert_eq!(world.z_index(7), 0);
        assert_eq!(world.z_index(13), 1);
    }

    #[test]
    fn corrections_shape_and_diagonal_test() {
        let ctx = context(60);
        let agent = crate::population::tests::home_agent(7);
        let pool = BufferPool::new();
        let mats = MatPool::new(20);
        let mut rng = XorShiftRng::seed_from_u64(7);
        let world = sample_world(&ctx, &agent, 20, &[7], &mut rng, &pool);
        // Uniform zones: p = 1/60, correction = -ln(20/60) everywhere off
        // the diagonal.
        let expected = -(20.0f64 / 60.0).ln();
        let full = world.corrections(&mats, Axis::All, &Location::NonFixed(None));
        assert_eq!(full.shape(), Shape::Full(20));
        for o in 0..20 {
            for d in 0..20 {
                let v = full.value(o, d);
                if o == d {
                    assert_eq!(v, 0.0);
                } else {
                    assert!((v - expected).abs() < 1e-12);
                }
            }
        }
        // Fixed-zone destinations carry no correction.
        let fixed = world.corrections(&mats, Axis::All, &Location::Residence(7));
        assert_eq!(fixed.shape(), Shape::Scalar);
        assert_eq!(fixed.sum(), 0.0);
    }

    #[test]
    fn sampled_los_matches_global_test() {
        let ctx = context(30);
        let agent = crate::population::tests::home_agent(3);
        let pool = BufferPool::new();
        let mats = MatPool::new(10);
        let mut rng = XorShiftRng::seed_from_u64(1);
        let world = sample_world(&ctx, &agent, 10, &[3], &mut rng, &pool);
        let (base, peak) = world.travel_time(&mats, Mode::Walk, Axis::One(0), Axis::One(5), 0.0);
        assert!(peak.is_none());
        assert_eq!(base.value(0, 0), 10.0);
        assert_eq!(world.scalar_travel_minutes(Mode::Walk, 0, 5, 0.0), 10.0);
    }
}
