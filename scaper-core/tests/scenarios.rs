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

//! End-to-end scenarios of the engine: value function, simulation, choice
//! sets and estimation on small synthetic worlds.
use mat::{BufferPool, MatPool};
use nalgebra::DVector;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;
use scaper_core::choiceset::generate_choiceset;
use scaper_core::daypath::{path_to_trips, path_utility, same_trips, trips_to_path};
use scaper_core::estimation::cost::PathLikelihood;
use scaper_core::estimation::maximize_with_restarts;
use scaper_core::parameters::{ModelConfig, ModelContext, Parameter, Params};
use scaper_core::population::Agent;
use scaper_core::simulator::{draw_class, simulate_day, step_probabilities};
use scaper_core::state_space::{
    classify, start_state, Activity, Decision, Feasibility, Location, State,
};
use scaper_core::units::Horizon;
use scaper_core::utility::ScaperUtility;
use scaper_core::value_function::deriv::DerivEngine;
use scaper_core::value_function::ValueFunction;
use scaper_core::world::{sampling, LosComponent, LosTables, ModeLos, World, ZoneTable};

/// Builds a context with uniform zones, a flat level of service and the
/// given horizon and parameters.
fn toy_context(
    nb_zones: usize,
    day_hours: f64,
    timestep_minutes: f64,
    travel_minutes: f64,
    params: &[(&str, f64, bool)],
) -> ModelContext {
    let horizon = Horizon {
        day_start_hour: 0.0,
        day_end_hour: day_hours,
        timestep_minutes,
        decision_step: 1,
    };
    let mut config = ModelConfig {
        horizon,
        ..Default::default()
    };
    config.random_seed = Some(7);
    let n2 = nb_zones * nb_zones;
    let modes = (0..4)
        .map(|_| {
            ModeLos::new(
                LosComponent::flat(vec![travel_minutes; n2]),
                LosComponent::flat(vec![0.0; n2]),
                LosComponent::flat(vec![0.0; n2]),
                LosComponent::flat(vec![1.0; n2]),
            )
        })
        .collect();
    let los = LosTables::new(modes, nb_zones);
    let zones = ZoneTable::new(
        vec![100.0; nb_zones],
        vec![50.0; nb_zones],
        vec![0.0; nb_zones],
    );
    let params = Params::new(
        params
            .iter()
            .map(|&(name, value, estimate)| Parameter {
                name: name.to_owned(),
                value,
                estimate,
            })
            .collect(),
    )
    .unwrap();
    ModelContext::new(config, params, zones, los)
}

fn agent(id: u64, home: usize) -> Agent {
    Agent {
        id,
        age: 35.0,
        female: false,
        income: 30_000.0,
        has_kids: false,
        home_zone: home,
        work_zone: None,
        has_car: true,
        transit_card: false,
        weight: 1.0,
        work_duration: None,
    }
}

/// S1: a degenerate agent with no reachable alternative stays home; the
/// value of the start state is the day length times the home rate.
#[test]
fn s1_degenerate_agent_stays_home_test() {
    // Day of 3 one-hour timesteps; travel takes 10 hours, so every travel
    // arrives after the day end and is infeasible.
    let toy = toy_context(3, 3.0, 60.0, 600.0, &[("dur_home", 0.7, false)]);
    let ctx = &toy;
    let world = World::full(ctx);
    let spec = ScaperUtility::new(ctx);
    let a = agent(1, 0);
    let mats = MatPool::new(3);
    let ev = BufferPool::new();
    let mut vf = ValueFunction::new(ctx, &a, &world, &spec, 0, &mats, &ev);
    let start = start_state(ctx, &a);
    let value = vf.expected_value(&start);
    assert!((value - 3.0 * 0.7).abs() < 1e-9, "value = {value}");

    let mut rng = XorShiftRng::seed_from_u64(1);
    let path = simulate_day(ctx, &world, &a, &mut vf, &mut rng);
    assert_eq!(path.steps.len(), 3);
    assert!(path
        .steps
        .iter()
        .all(|(_, d)| matches!(d, Decision::Continue)));
    assert_eq!(classify(ctx, &a, &path.end), Feasibility::End);
}

/// S2: a mandated work duration forces a work episode of exactly that
/// length into every feasible day.
#[test]
fn s2_forced_work_test() {
    let toy = toy_context(
        6,
        18.0,
        10.0,
        10.0,
        &[
            ("dur_home", 0.05, false),
            ("dur_work", 0.2, false),
            ("dur_shop", 0.1, false),
            ("dur_other", 0.1, false),
        ],
    );
    let mut ctx = toy;
    ctx.config.horizon.day_start_hour = 5.0;
    ctx.config.horizon.day_end_hour = 23.0;
    ctx.config.max_tracked_duration.work = 12;
    let ctx = &ctx;
    assert_eq!(ctx.config.horizon.day_length(), 108);
    let mut a = agent(1, 0);
    a.work_zone = Some(5);
    a.work_duration = Some(48);
    let world = World::full(ctx);
    let spec = ScaperUtility::new(ctx);
    let mats = MatPool::new(6);
    let ev = BufferPool::new();
    let mut vf = ValueFunction::new(ctx, &a, &world, &spec, 0, &mats, &ev);
    let mut rng = XorShiftRng::seed_from_u64(2);
    let path = simulate_day(ctx, &world, &a, &mut vf, &mut rng);
    assert!(path.end.has_worked);
    assert!(path
        .steps
        .iter()
        .any(|(_, d)| matches!(d, Decision::Travel(_, Location::Workplace(5)))));
    let work_continues = path
        .steps
        .iter()
        .filter(|(s, d)| s.activity == Activity::Work && matches!(d, Decision::Continue))
        .count();
    assert!(work_continues >= 47, "only {work_continues} work continues");
    // Path validity along the way.
    for (state, _) in &path.steps {
        assert_ne!(classify(ctx, &a, state), Feasibility::Bad);
    }
}

/// S5: on a tiny world, the simulator's per-step probabilities compose to
/// the MNL probability over whole paths.
#[test]
fn s5_path_probabilities_match_mnl_test() {
    let toy = toy_context(
        2,
        4.0,
        60.0,
        60.0,
        &[
            ("dur_home", 0.4, false),
            ("dur_shop", 0.9, false),
            ("asc_shop", 0.3, false),
            ("asc_other", -0.4, false),
            ("b_time_walk", -0.01, false),
            ("b_cost", -0.05, false),
        ],
    );
    let ctx = &toy;
    let world = World::full(ctx);
    let spec = ScaperUtility::new(ctx);
    let a = agent(1, 0);
    let mats = MatPool::new(2);
    let ev = BufferPool::new();
    let mut vf = ValueFunction::new(ctx, &a, &world, &spec, 0, &mats, &ev);
    let start = start_state(ctx, &a);
    let start_value = vf.expected_value(&start);

    // Enumerate all day-paths with positive probability.
    struct Enumerated {
        probability: f64,
        utility: f64,
    }
    let mut paths: Vec<Enumerated> = Vec::new();
    let mut pending: Vec<(State, f64, Vec<(State, Decision)>)> =
        vec![(start.clone(), 1.0, Vec::new())];
    while let Some((state, probability, steps)) = pending.pop() {
        match classify(ctx, &a, &state) {
            Feasibility::End => {
                let path = scaper_core::daypath::DayPath {
                    steps,
                    end: state,
                };
                let utility = path_utility(ctx, &world, &spec, &a, 0, &path);
                paths.push(Enumerated {
                    probability,
                    utility,
                });
            }
            Feasibility::Bad => panic!("enumeration reached an infeasible state"),
            Feasibility::Good => {
                let weights = vf.exploded_utilities(&state);
                let total: f64 = weights.iter().map(|(_, w)| w).sum();
                for (decision, weight) in weights {
                    if weight > 0.0 {
                        let next = scaper_core::state_space::next_single_state(
                            ctx, &world, &a, &state, &decision,
                        );
                        let mut steps = steps.clone();
                        steps.push((state.clone(), decision));
                        pending.push((next, probability * weight / total, steps));
                    }
                }
            }
        }
    }
    assert!(paths.len() > 1);
    // Probabilities are a distribution.
    let total: f64 = paths.iter().map(|p| p.probability).sum();
    assert!((total - 1.0).abs() < 1e-10);
    // And each equals the MNL form exp(U - V(start)).
    for path in &paths {
        let mnl = (path.utility - start_value).exp();
        assert!(
            (path.probability - mnl).abs() < 1e-9,
            "{} vs {}",
            path.probability,
            mnl
        );
    }
    // The logsum is consistent with the enumeration.
    let logsum: f64 = paths.iter().map(|p| p.utility.exp()).sum::<f64>().ln();
    assert!((logsum - start_value).abs() < 1e-9);
}

/// Value-function roundtrip: the cached value of a state equals the logsum
/// of its recomputed option weights.
#[test]
fn value_roundtrip_test() {
    let toy = toy_context(
        3,
        6.0,
        60.0,
        60.0,
        &[("dur_home", 0.2, false), ("dur_shop", 0.5, false)],
    );
    let ctx = &toy;
    let world = World::full(ctx);
    let spec = ScaperUtility::new(ctx);
    let a = agent(1, 1);
    let mats = MatPool::new(3);
    let ev = BufferPool::new();
    let mut vf = ValueFunction::new(ctx, &a, &world, &spec, 0, &mats, &ev);
    let mut rng = XorShiftRng::seed_from_u64(3);
    let path = simulate_day(ctx, &world, &a, &mut vf, &mut rng);
    for (state, _) in &path.steps {
        let value = vf.expected_value(state);
        let weights = vf.exploded_utilities(state);
        let recomputed: f64 = weights.iter().map(|(_, w)| w).sum::<f64>().ln();
        assert!(
            (value - recomputed).abs() < 1e-9,
            "{value} vs {recomputed} at {state:?}"
        );
        // Probability normalization.
        let probabilities = step_probabilities(&mut vf, state);
        let total: f64 = probabilities.iter().sum();
        assert!((total - 1.0).abs() < 1e-10);
    }
}

/// Simulation under a sampled world stays within the sampled zones and
/// remains feasible.
#[test]
fn sampled_world_paths_are_valid_test() {
    let toy = toy_context(
        30,
        6.0,
        60.0,
        60.0,
        &[("dur_home", 0.2, false), ("dur_shop", 0.6, false)],
    );
    let ctx = &toy;
    let spec = ScaperUtility::new(ctx);
    let a = agent(1, 3);
    let mats = MatPool::new(30);
    let ev = BufferPool::new();
    let world_pool = BufferPool::new();
    let mut rng = XorShiftRng::seed_from_u64(4);
    let world = sampling::sample_world(ctx, &a, 10, &[3], &mut rng, &world_pool);
    let mut vf = ValueFunction::new(ctx, &a, &world, &spec, 0, &mats, &ev);
    for _ in 0..5 {
        let path = simulate_day(ctx, &world, &a, &mut vf, &mut rng);
        assert_eq!(classify(ctx, &a, &path.end), Feasibility::End);
        for trip in path_to_trips(&a, 0, &path) {
            assert!(world.zones().contains(&trip.origin));
            assert!(world.zones().contains(&trip.destination));
        }
    }
}

/// Choice-set correction law: with no simulated alternatives, the observed
/// correction is minus the log-probability of the observed path.
#[test]
fn correction_law_test() {
    let toy = toy_context(
        2,
        4.0,
        60.0,
        60.0,
        &[
            ("dur_home", 0.4, false),
            ("dur_shop", 0.9, false),
            ("asc_shop", 0.3, false),
        ],
    );
    let ctx = &toy;
    let world = World::full(ctx);
    let spec = ScaperUtility::new(ctx);
    let a = agent(1, 0);
    let mats = MatPool::new(2);
    let ev = BufferPool::new();
    let world_pool = BufferPool::new();

    // Draw an observation from the model itself.
    let mut vf = ValueFunction::new(ctx, &a, &world, &spec, 0, &mats, &ev);
    let mut rng = XorShiftRng::seed_from_u64(5);
    let path = simulate_day(ctx, &world, &a, &mut vf, &mut rng);
    let observed = path_to_trips(&a, 0, &path);

    let cs = generate_choiceset(
        ctx,
        &spec,
        &a,
        &observed,
        0,
        None,
        &mut rng,
        &mats,
        &ev,
        &world_pool,
    )
    .unwrap();
    assert_eq!(cs.alternatives.len(), 1);
    assert!(same_trips(&cs.alternatives[0].trips, &observed));

    // Independent probability from the per-step distributions.
    let replayed = trips_to_path(ctx, &world, &a, &observed).unwrap();
    let mut log_probability = 0.0;
    for (state, decision) in &replayed.steps {
        let weights = vf.exploded_utilities(state);
        let total: f64 = weights.iter().map(|(_, w)| w).sum();
        let weight = weights
            .iter()
            .find(|(d, _)| d == decision)
            .map(|(_, w)| *w)
            .unwrap();
        log_probability += (weight / total).ln();
    }
    assert!(
        (cs.alternatives[0].correction + log_probability).abs() < 1e-9,
        "correction {} vs -log p {}",
        cs.alternatives[0].correction,
        -log_probability
    );
}

/// Duplicate alternatives collapse with a `ln k` correction adjustment.
#[test]
fn choiceset_dedup_test() {
    // A world where staying home is overwhelmingly likely, so the
    // simulated alternatives duplicate the observed stay-home path.
    let toy = toy_context(
        2,
        3.0,
        60.0,
        60.0,
        &[("dur_home", 5.0, false), ("dur_shop", -30.0, false)],
    );
    let ctx = &toy;
    let world = World::full(ctx);
    let spec = ScaperUtility::new(ctx);
    let a = agent(1, 0);
    let mats = MatPool::new(2);
    let ev = BufferPool::new();
    let world_pool = BufferPool::new();
    let mut vf = ValueFunction::new(ctx, &a, &world, &spec, 0, &mats, &ev);
    let mut rng = XorShiftRng::seed_from_u64(6);
    let stay_home = simulate_day(ctx, &world, &a, &mut vf, &mut rng);
    let observed = path_to_trips(&a, 0, &stay_home);
    assert!(observed.is_empty());

    let nb_alternatives = 5;
    let cs = generate_choiceset(
        ctx,
        &spec,
        &a,
        &observed,
        nb_alternatives,
        None,
        &mut rng,
        &mats,
        &ev,
        &world_pool,
    )
    .unwrap();
    // The total duplicate count is conserved.
    let total: usize = 1 + nb_alternatives;
    let implied: f64 = cs
        .alternatives
        .iter()
        .map(|alt| {
            // Recover the cluster count from the correction shift.
            let base = {
                let replayed = trips_to_path(ctx, &world, &a, &alt.trips).unwrap();
                let utilities: f64 = path_utility(ctx, &world, &spec, &a, 0, &replayed);
                let start_value = vf.expected_value(&start_state(ctx, &a));
                -(utilities - start_value)
            };
            (alt.correction - base).exp()
        })
        .sum();
    assert!((implied - total as f64).abs() < 1e-6);
}

/// S6: estimation recovers the parameters that generated the data.
#[test]
fn s6_estimation_recovers_ground_truth_test() {
    let truth = [
        ("dur_shop", 0.8),
        ("asc_shop", -0.5),
        ("dur_other", 0.5),
        ("asc_other", -0.8),
    ];
    let params: Vec<(&str, f64, bool)> = truth
        .iter()
        .map(|&(name, value)| (name, value, true))
        .chain([("dur_home", 0.3, false), ("b_time_walk", -0.02, false)])
        .collect();
    let toy = toy_context(3, 12.0, 60.0, 60.0, &params);
    let ctx = &toy;
    let world = World::full(ctx);
    let spec = ScaperUtility::new(ctx);
    let mats = MatPool::new(3);
    let ev = BufferPool::new();
    let world_pool = BufferPool::new();

    // Simulate observations and build choice sets under the true
    // parameters.
    let mut rng = XorShiftRng::seed_from_u64(42);
    let agents: Vec<Agent> = (0..200).map(|i| agent(i as u64 + 1, (i % 3) as usize)).collect();
    let mut choicesets = Vec::new();
    for a in &agents {
        let class = draw_class(ctx, &spec, a, &mut rng);
        let mut vf = ValueFunction::new(ctx, a, &world, &spec, class, &mats, &ev);
        let path = simulate_day(ctx, &world, a, &mut vf, &mut rng);
        let observed = path_to_trips(a, class, &path);
        let cs = generate_choiceset(
            ctx,
            &spec,
            a,
            &observed,
            60,
            None,
            &mut rng,
            &mats,
            &ev,
            &world_pool,
        )
        .unwrap();
        choicesets.push(cs);
    }

    // Estimate from a perturbed starting point.
    let mut start_params = ctx.params.clone();
    let ids = start_params.estimated();
    start_params.set_values(&ids, &[0.2, 0.0, 0.1, -0.2]);
    let est_ctx = ModelContext::new(
        ctx.config.clone(),
        start_params,
        ctx.zones.clone(),
        ctx.los.clone(),
    );
    let est_spec = ScaperUtility::new(&est_ctx);
    let likelihood = PathLikelihood::build(&est_ctx, &est_spec, &agents, &choicesets).unwrap();
    let x0 = DVector::from_iterator(
        ids.len(),
        ids.iter().map(|&id| est_ctx.params.value(id)),
    );
    let maximum = maximize_with_restarts(&likelihood, &x0, 1, 2.0, false, &mut rng);
    assert!(maximum.value.is_finite());

    let mut recovered = 0;
    for (k, &(name, target)) in truth.iter().enumerate() {
        let estimate = maximum.x[k];
        let se = maximum.std_errors[k].max(1e-6);
        if (estimate - target).abs() <= 3.0 * se {
            recovered += 1;
        } else {
            eprintln!("{name}: estimate {estimate:.4}, target {target:.4}, se {se:.4}");
        }
    }
    // At least 80% of the parameters within three standard errors.
    assert!(recovered * 10 >= truth.len() * 8, "recovered {recovered}/4");
}

/// The analytic travel-time derivative matches central differences.
#[test]
fn analytic_derivative_matches_numeric_test() {
    // Fractional travel times keep the interpolation away from its kinks.
    let toy = toy_context(
        3,
        8.0,
        60.0,
        45.0,
        &[
            ("dur_home", 0.3, false),
            ("dur_shop", 0.7, false),
            ("b_time_walk", -0.05, false),
            ("b_time_car", -0.03, false),
            ("b_time_transit", -0.04, false),
            ("b_time_bike", -0.05, false),
        ],
    );
    let ctx = &toy;
    let spec = ScaperUtility::new(ctx);
    let a = agent(1, 0);
    let mats = MatPool::new(3);
    let ev = BufferPool::new();
    let start = start_state(ctx, &a);

    let mut world = World::full(ctx);
    let mut engine = DerivEngine::new(ctx, &a, &world, &spec, 0, &mats, &ev);
    let (value, derivative) = engine.expected_value_and_derivative(&start);
    drop(engine);

    let h = 1e-5;
    let mut at = |scale: f64| {
        world.set_tt_scale(scale);
        let mut vf = ValueFunction::new(ctx, &a, &world, &spec, 0, &mats, &ev);
        vf.expected_value(&start)
    };
    let numeric = (at(1.0 + h) - at(1.0 - h)) / (2.0 * h);
    assert!((at(1.0) - value).abs() < 1e-9);
    assert!(
        (derivative - numeric).abs() < 1e-4 * derivative.abs().max(1.0),
        "analytic {derivative} vs numeric {numeric}"
    );
}
