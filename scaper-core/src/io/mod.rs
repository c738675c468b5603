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

//! Tabular input and output.
//!
//! Input files live under `<model>/input/`:
//!
//! - `zones.csv`: one row per zone in index order, columns `population`,
//!   `employment`, `parking_per_hour`.
//! - `network.csv`: one row per origin-destination pair, sorted by origin
//!   then destination; columns `origin`, `destination` and, per mode,
//!   `<mode>_<peak|offpeak>_<time|wait|access|cost>` for peaked modes and
//!   `<mode>_<time|wait|access|cost>` for the others.
//! - `agents.csv`: one row per agent.
//! - `trips.csv`: observed trips, departure times as `HH:MM`.
//! - `parameters.csv`: `parameter,value,estimate`, conventionally starting
//!   with the `nClasses` row.
//!
//! Outputs are written under `<model>/<kind>/<YY-MM-DD>/` with a
//! timestamped file name, as CSV or Parquet by extension.
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use hashbrown::HashMap;
use itertools::Itertools;
use polars::prelude::*;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::choiceset::{Alternative, Choiceset};
use crate::daypath::Trip;
use crate::parameters::{Parameter, Params};
use crate::population::Agent;
use crate::state_space::{Activity, Mode};
use crate::units::Horizon;
use crate::world::{LosComponent, LosTables, ModeLos, ZoneTable};

/// Path of an input file of the model folder.
pub fn input_file(model_dir: &Path, name: &str) -> PathBuf {
    model_dir.join("input").join(name)
}

/// Path of a timestamped output file under `<model>/<kind>/<YY-MM-DD>/`,
/// with the directories created.
pub fn output_file(model_dir: &Path, kind: &str, name: &str, ext: &str) -> Result<PathBuf> {
    let now = OffsetDateTime::now_utc();
    let day = now
        .format(format_description!("[year repr:last_two]-[month]-[day]"))
        .context("Failed to format the date")?;
    let stamp = now
        .format(format_description!("[hour][minute][second]"))
        .context("Failed to format the time")?;
    let dir = model_dir.join(kind).join(day);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create output directory `{dir:?}`"))?;
    Ok(dir.join(format!("{stamp}_{name}.{ext}")))
}

fn read_table(path: &Path) -> Result<DataFrame> {
    CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path.to_path_buf()))
        .with_context(|| format!("Failed to open `{path:?}`"))?
        .finish()
        .with_context(|| format!("Failed to read `{path:?}`"))
}

fn write_table(df: &mut DataFrame, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create `{path:?}`"))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("parquet") => {
            ParquetWriter::new(file)
                .finish(df)
                .with_context(|| format!("Failed to write `{path:?}`"))?;
        }
        _ => {
            CsvWriter::new(file)
                .include_header(true)
                .finish(df)
                .with_context(|| format!("Failed to write `{path:?}`"))?;
        }
    }
    Ok(())
}

fn f64_column(df: &DataFrame, path: &Path, name: &str) -> Result<Vec<f64>> {
    let series = df
        .column(name)
        .with_context(|| format!("Missing column `{name}` in `{path:?}`"))?
        .as_materialized_series()
        .cast(&DataType::Float64)
        .with_context(|| format!("Column `{name}` of `{path:?}` is not numeric"))?;
    let ca = series.f64().unwrap();
    if ca.null_count() > 0 {
        bail!("Column `{name}` of `{path:?}` has missing values");
    }
    Ok(ca.into_no_null_iter().collect())
}

fn opt_f64_column(df: &DataFrame, path: &Path, name: &str) -> Result<Vec<Option<f64>>> {
    let series = df
        .column(name)
        .with_context(|| format!("Missing column `{name}` in `{path:?}`"))?
        .as_materialized_series()
        .cast(&DataType::Float64)
        .with_context(|| format!("Column `{name}` of `{path:?}` is not numeric"))?;
    Ok(series.f64().unwrap().iter().collect())
}

fn i64_column(df: &DataFrame, path: &Path, name: &str) -> Result<Vec<i64>> {
    let series = df
        .column(name)
        .with_context(|| format!("Missing column `{name}` in `{path:?}`"))?
        .as_materialized_series()
        .cast(&DataType::Int64)
        .with_context(|| format!("Column `{name}` of `{path:?}` is not an integer"))?;
    let ca = series.i64().unwrap();
    if ca.null_count() > 0 {
        bail!("Column `{name}` of `{path:?}` has missing values");
    }
    Ok(ca.into_no_null_iter().collect())
}

fn str_column(df: &DataFrame, path: &Path, name: &str) -> Result<Vec<String>> {
    let series = df
        .column(name)
        .with_context(|| format!("Missing column `{name}` in `{path:?}`"))?
        .as_materialized_series()
        .cast(&DataType::String)
        .with_context(|| format!("Column `{name}` of `{path:?}` is not text"))?;
    let ca = series.str().unwrap();
    ca.iter()
        .enumerate()
        .map(|(i, v)| {
            v.map(|s| s.to_owned())
                .with_context(|| format!("Missing value in column `{name}` row {i} of `{path:?}`"))
        })
        .collect()
}

/// Reads the zone table.
pub fn read_zones(path: &Path) -> Result<ZoneTable> {
    let df = read_table(path)?;
    Ok(ZoneTable::new(
        f64_column(&df, path, "population")?,
        f64_column(&df, path, "employment")?,
        f64_column(&df, path, "parking_per_hour")?,
    ))
}

/// Reads the network level-of-service tables.
pub fn read_network(path: &Path, nb_zones: usize) -> Result<LosTables> {
    let df = read_table(path)?;
    let origins = i64_column(&df, path, "origin")?;
    let destinations = i64_column(&df, path, "destination")?;
    if origins.len() != nb_zones * nb_zones {
        bail!(
            "`{path:?}` has {} rows, expected {} for {} zones",
            origins.len(),
            nb_zones * nb_zones,
            nb_zones
        );
    }
    for (i, (&o, &d)) in origins.iter().zip(destinations.iter()).enumerate() {
        let (eo, ed) = ((i / nb_zones) as i64, (i % nb_zones) as i64);
        if o != eo || d != ed {
            bail!(
                "`{path:?}` is not sorted by origin then destination at row {i}: \
                 got ({o}, {d}), expected ({eo}, {ed})"
            );
        }
    }
    let component = |mode: Mode, what: &str| -> Result<LosComponent> {
        if mode.has_peak() {
            Ok(LosComponent {
                peak: Some(f64_column(
                    &df,
                    path,
                    &format!("{}_peak_{what}", mode.name()),
                )?),
                offpeak: f64_column(&df, path, &format!("{}_offpeak_{what}", mode.name()))?,
            })
        } else {
            Ok(LosComponent::flat(f64_column(
                &df,
                path,
                &format!("{}_{what}", mode.name()),
            )?))
        }
    };
    let modes = Mode::ALL
        .iter()
        .map(|&mode| {
            Ok(ModeLos::new(
                component(mode, "time")?,
                component(mode, "wait")?,
                component(mode, "access")?,
                component(mode, "cost")?,
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(LosTables::new(modes, nb_zones))
}

/// Reads the agents.
pub fn read_agents(path: &Path, nb_zones: usize, horizon: &Horizon) -> Result<Vec<Agent>> {
    let df = read_table(path)?;
    let ids = i64_column(&df, path, "id")?;
    let ages = f64_column(&df, path, "age")?;
    let females = i64_column(&df, path, "female")?;
    let incomes = f64_column(&df, path, "income")?;
    let has_kids = i64_column(&df, path, "has_kids")?;
    let home_zones = i64_column(&df, path, "home_zone")?;
    let work_zones = opt_f64_column(&df, path, "work_zone")?;
    let has_cars = i64_column(&df, path, "has_car")?;
    let transit_cards = i64_column(&df, path, "transit_card")?;
    let weights = f64_column(&df, path, "weight")?;
    let work_minutes = opt_f64_column(&df, path, "work_duration_minutes")?;
    (0..ids.len())
        .map(|i| {
            Agent::from_values(
                ids[i] as u64,
                ages[i],
                females[i] != 0,
                incomes[i],
                has_kids[i] != 0,
                home_zones[i] as usize,
                work_zones[i].map(|z| z as usize),
                has_cars[i] != 0,
                transit_cards[i] != 0,
                weights[i],
                work_minutes[i].map(|m| horizon.minutes_to_timesteps(m).round() as u32),
                nb_zones,
            )
            .with_context(|| format!("Invalid agent at row {i} of `{path:?}`"))
        })
        .collect()
}

/// Reads the parameter table.
pub fn read_parameters(path: &Path) -> Result<Params> {
    let df = read_table(path)?;
    let names = str_column(&df, path, "parameter")?;
    let values = f64_column(&df, path, "value")?;
    let estimates = i64_column(&df, path, "estimate")?;
    let rows = names
        .into_iter()
        .zip(values)
        .zip(estimates)
        .map(|((name, value), estimate)| Parameter {
            name,
            value,
            estimate: estimate != 0,
        })
        .collect();
    Params::new(rows).with_context(|| format!("Invalid parameter table `{path:?}`"))
}

/// Reads the observed trips, grouped by agent and sorted by departure time
/// within each agent.
pub fn read_trips(path: &Path, horizon: &Horizon) -> Result<Vec<(u64, Vec<Trip>)>> {
    let df = read_table(path)?;
    let agent_ids = i64_column(&df, path, "agent_id")?;
    let activities = str_column(&df, path, "activity")?;
    let modes = str_column(&df, path, "mode")?;
    let origins = i64_column(&df, path, "origin")?;
    let destinations = i64_column(&df, path, "destination")?;
    let departures = str_column(&df, path, "departure_time")?;
    let mut by_agent: HashMap<u64, Vec<Trip>> = HashMap::new();
    let mut order: Vec<u64> = Vec::new();
    for i in 0..agent_ids.len() {
        let agent_id = agent_ids[i] as u64;
        let trip = Trip {
            agent_id,
            class: 0,
            activity: Activity::from_name(&activities[i])
                .with_context(|| format!("Invalid activity at row {i} of `{path:?}`"))?,
            mode: Mode::from_name(&modes[i])
                .with_context(|| format!("Invalid mode at row {i} of `{path:?}`"))?,
            origin: origins[i] as usize,
            destination: destinations[i] as usize,
            departure: horizon
                .parse_hhmm(&departures[i])
                .with_context(|| format!("Invalid departure time at row {i} of `{path:?}`"))?,
        };
        if !by_agent.contains_key(&agent_id) {
            order.push(agent_id);
        }
        by_agent.entry(agent_id).or_default().push(trip);
    }
    Ok(order
        .into_iter()
        .map(|id| {
            let mut trips = by_agent.remove(&id).unwrap();
            trips.sort_by(|a, b| a.departure.total_cmp(&b.departure));
            (id, trips)
        })
        .collect())
}

/// One row of the simulation output, with the level-of-service-derived
/// travel and arrival times.
#[derive(Clone, Debug)]
pub struct TripRow {
    pub trip: Trip,
    /// Door-to-door travel time in minutes.
    pub travel_minutes: f64,
}

/// Writes simulated (or re-emitted observed) trips. Departure and arrival
/// times are truncated to the minute in the file.
pub fn write_trip_rows(path: &Path, horizon: &Horizon, rows: &[TripRow]) -> Result<()> {
    let mut df = df!(
        "IndID" => rows.iter().map(|r| r.trip.agent_id as i64).collect::<Vec<_>>(),
        "LatentClass" => rows.iter().map(|r| r.trip.class as i64).collect::<Vec<_>>(),
        "Activity" => rows.iter().map(|r| r.trip.activity.name()).collect::<Vec<_>>(),
        "Mode" => rows.iter().map(|r| r.trip.mode.name()).collect::<Vec<_>>(),
        "Origin" => rows.iter().map(|r| r.trip.origin as i64).collect::<Vec<_>>(),
        "Destination" => rows.iter().map(|r| r.trip.destination as i64).collect::<Vec<_>>(),
        "DepartureTime" => rows.iter().map(|r| horizon.format_hhmm(r.trip.departure)).collect::<Vec<_>>(),
        "TravelTime" => rows.iter().map(|r| r.travel_minutes.floor() as i64).collect::<Vec<_>>(),
        "ArrivalTime" => rows.iter().map(|r| {
            horizon.format_hhmm(r.trip.departure + horizon.minutes_to_timesteps(r.travel_minutes))
        }).collect::<Vec<_>>(),
    )
    .context("Failed to assemble the trip output")?;
    write_table(&mut df, path)
}

/// Writes the choice sets: one file of flattened alternatives and one file
/// of the sampled zone arrays.
///
/// An alternative without trips (a full day at home) is serialized as a
/// single marker row with `trip = -1`.
pub fn write_choicesets(
    alts_path: &Path,
    zones_path: &Path,
    choicesets: &[Choiceset],
) -> Result<()> {
    let mut agent_ids: Vec<i64> = Vec::new();
    let mut alternatives: Vec<i64> = Vec::new();
    let mut corrections: Vec<f64> = Vec::new();
    let mut trip_indices: Vec<i64> = Vec::new();
    let mut classes: Vec<i64> = Vec::new();
    let mut activities: Vec<&str> = Vec::new();
    let mut modes: Vec<&str> = Vec::new();
    let mut origins: Vec<i64> = Vec::new();
    let mut destinations: Vec<i64> = Vec::new();
    let mut departures: Vec<f64> = Vec::new();
    for cs in choicesets {
        for (j, alternative) in cs.alternatives.iter().enumerate() {
            let mut push = |trip_index: i64, trip: Option<&Trip>| {
                agent_ids.push(cs.agent_id as i64);
                alternatives.push(j as i64);
                corrections.push(alternative.correction);
                trip_indices.push(trip_index);
                classes.push(trip.map_or(0, |t| t.class as i64));
                activities.push(trip.map_or("none", |t| t.activity.name()));
                modes.push(trip.map_or("none", |t| t.mode.name()));
                origins.push(trip.map_or(-1, |t| t.origin as i64));
                destinations.push(trip.map_or(-1, |t| t.destination as i64));
                departures.push(trip.map_or(0.0, |t| t.departure));
            };
            if alternative.trips.is_empty() {
                push(-1, None);
            } else {
                for (k, trip) in alternative.trips.iter().enumerate() {
                    push(k as i64, Some(trip));
                }
            }
        }
    }
    let mut df = df!(
        "agent_id" => agent_ids,
        "alternative" => alternatives,
        "correction" => corrections,
        "trip" => trip_indices,
        "latent_class" => classes,
        "activity" => activities,
        "mode" => modes,
        "origin" => origins,
        "destination" => destinations,
        "departure" => departures,
    )
    .context("Failed to assemble the choice-set output")?;
    write_table(&mut df, alts_path)?;

    let mut zone_agents: Vec<i64> = Vec::new();
    let mut slots: Vec<i64> = Vec::new();
    let mut zones: Vec<i64> = Vec::new();
    for cs in choicesets {
        for (slot, &zone) in cs.zones.iter().enumerate() {
            zone_agents.push(cs.agent_id as i64);
            slots.push(slot as i64);
            zones.push(zone as i64);
        }
    }
    let mut df = df!(
        "agent_id" => zone_agents,
        "slot" => slots,
        "zone" => zones,
    )
    .context("Failed to assemble the choice-set zones output")?;
    write_table(&mut df, zones_path)
}

/// Reads choice sets back from their two files.
pub fn read_choicesets(alts_path: &Path, zones_path: &Path) -> Result<Vec<Choiceset>> {
    let df = read_table(alts_path)?;
    let agent_ids = i64_column(&df, alts_path, "agent_id")?;
    let alternatives = i64_column(&df, alts_path, "alternative")?;
    let corrections = f64_column(&df, alts_path, "correction")?;
    let trip_indices = i64_column(&df, alts_path, "trip")?;
    let classes = i64_column(&df, alts_path, "latent_class")?;
    let activities = str_column(&df, alts_path, "activity")?;
    let modes = str_column(&df, alts_path, "mode")?;
    let origins = i64_column(&df, alts_path, "origin")?;
    let destinations = i64_column(&df, alts_path, "destination")?;
    let departures = f64_column(&df, alts_path, "departure")?;

    let zones_df = read_table(zones_path)?;
    let zone_agents = i64_column(&zones_df, zones_path, "agent_id")?;
    let slots = i64_column(&zones_df, zones_path, "slot")?;
    let zone_values = i64_column(&zones_df, zones_path, "zone")?;
    let mut zones_by_agent: HashMap<u64, Vec<(i64, usize)>> = HashMap::new();
    for i in 0..zone_agents.len() {
        zones_by_agent
            .entry(zone_agents[i] as u64)
            .or_default()
            .push((slots[i], zone_values[i] as usize));
    }

    let mut by_agent: HashMap<u64, Vec<(i64, i64, f64, Option<Trip>)>> = HashMap::new();
    let mut order: Vec<u64> = Vec::new();
    for i in 0..agent_ids.len() {
        let agent_id = agent_ids[i] as u64;
        let trip = if trip_indices[i] < 0 {
            None
        } else {
            Some(Trip {
                agent_id,
                class: classes[i] as usize,
                activity: Activity::from_name(&activities[i])
                    .with_context(|| format!("Invalid activity at row {i} of `{alts_path:?}`"))?,
                mode: Mode::from_name(&modes[i])
                    .with_context(|| format!("Invalid mode at row {i} of `{alts_path:?}`"))?,
                origin: origins[i] as usize,
                destination: destinations[i] as usize,
                departure: departures[i],
            })
        };
        if !by_agent.contains_key(&agent_id) {
            order.push(agent_id);
        }
        by_agent.entry(agent_id).or_default().push((
            alternatives[i],
            trip_indices[i],
            corrections[i],
            trip,
        ));
    }
    order
        .into_iter()
        .map(|agent_id| {
            let mut rows = by_agent.remove(&agent_id).unwrap();
            rows.sort_by_key(|&(alt, trip, _, _)| (alt, trip));
            let mut alternative_list: Vec<Alternative> = Vec::new();
            for (alt, rows) in &rows.into_iter().chunk_by(|&(alt, _, _, _)| alt) {
                if alt as usize != alternative_list.len() {
                    bail!(
                        "Non-contiguous alternative indices for agent {agent_id} in \
                         `{alts_path:?}`"
                    );
                }
                let mut correction = 0.0;
                let mut trips = Vec::new();
                for (_, _, c, trip) in rows {
                    correction = c;
                    trips.extend(trip);
                }
                alternative_list.push(Alternative { trips, correction });
            }
            let mut zones = zones_by_agent.remove(&agent_id).unwrap_or_default();
            zones.sort_by_key(|&(slot, _)| slot);
            Ok(Choiceset {
                agent_id,
                zones: zones.into_iter().map(|(_, z)| z).collect(),
                alternatives: alternative_list,
            })
        })
        .collect()
}

/// Writes the estimation results.
pub fn write_estimates(
    path: &Path,
    names: &[String],
    values: &[f64],
    estimates: &[bool],
    std_errors: &[Option<f64>],
) -> Result<()> {
    let t_stats: Vec<Option<f64>> = values
        .iter()
        .zip(std_errors.iter())
        .map(|(&v, se)| se.map(|se| if se > 0.0 { v / se } else { f64::NAN }))
        .collect();
    let mut df = df!(
        "parameter" => names,
        "value" => values,
        "estimate" => estimates.iter().map(|&e| e as i64).collect::<Vec<_>>(),
        "std_error" => std_errors.iter().map(|se| se.unwrap_or(f64::NAN)).collect::<Vec<_>>(),
        "t_stat" => t_stats.iter().map(|t| t.unwrap_or(f64::NAN)).collect::<Vec<_>>(),
    )
    .context("Failed to assemble the estimation output")?;
    write_table(&mut df, path)
}

/// One row of the sensitivity output.
#[derive(Clone, Debug)]
pub struct DerivRow {
    pub agent_id: u64,
    pub class: usize,
    /// `tt` for the travel-time sweep, `wd` for the work-duration sweep.
    pub sweep: &'static str,
    pub x: f64,
    pub expected_value: f64,
    pub derivative: Option<f64>,
}

/// Writes the expected values and derivatives of the sensitivity sweeps.
pub fn write_deriv_rows(path: &Path, rows: &[DerivRow]) -> Result<()> {
    let mut df = df!(
        "agent_id" => rows.iter().map(|r| r.agent_id as i64).collect::<Vec<_>>(),
        "latent_class" => rows.iter().map(|r| r.class as i64).collect::<Vec<_>>(),
        "sweep" => rows.iter().map(|r| r.sweep).collect::<Vec<_>>(),
        "x" => rows.iter().map(|r| r.x).collect::<Vec<_>>(),
        "expected_value" => rows.iter().map(|r| r.expected_value).collect::<Vec<_>>(),
        "derivative" => rows.iter().map(|r| r.derivative.unwrap_or(f64::NAN)).collect::<Vec<_>>(),
    )
    .context("Failed to assemble the sensitivity output")?;
    write_table(&mut df, path)
}
