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

//! Model configuration, the parameter table and the model context.
//!
//! The [ModelContext] replaces any global mutable state: it is owned by the
//! top-level entry point and passed to workers by reference.
use anyhow::{bail, Result};
use hashbrown::HashMap;
use serde_derive::Deserialize;

use crate::logging;
use crate::state_space::{Activity, Mode};
use crate::units::Horizon;
use crate::world::{LosTables, PeakSchedule, ZoneTable};

/// Name of the conventional first row of the parameter table holding the
/// number of latent classes.
const NB_CLASSES: &str = "nClasses";

/// Identifier of a parameter in the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ParamId(usize);

/// One row of the parameter table.
#[derive(Clone, Debug)]
pub struct Parameter {
    /// Name of the parameter.
    pub name: String,
    /// Current value.
    pub value: f64,
    /// `true` if the parameter is estimated.
    pub estimate: bool,
}

/// The parameter table: named values with estimation flags and the number of
/// latent classes.
///
/// Lookups are permissive: a missing name yields 0 and is logged once per
/// distinct name.
#[derive(Clone, Debug)]
pub struct Params {
    entries: Vec<Parameter>,
    index: HashMap<String, ParamId>,
    nb_classes: usize,
}

impl Params {
    /// Builds the table from its rows, extracting the `nClasses` row (which
    /// defaults to 1 when absent).
    pub fn new(rows: Vec<Parameter>) -> Result<Self> {
        let mut entries = Vec::with_capacity(rows.len());
        let mut index = HashMap::with_capacity(rows.len());
        let mut nb_classes = 1;
        for row in rows {
            if row.name == NB_CLASSES {
                nb_classes = row.value as usize;
                if nb_classes == 0 {
                    bail!("`{NB_CLASSES}` must be at least 1");
                }
                continue;
            }
            let id = ParamId(entries.len());
            if index.insert(row.name.clone(), id).is_some() {
                bail!("Duplicate parameter `{}`", row.name);
            }
            entries.push(row);
        }
        Ok(Params {
            entries,
            index,
            nb_classes,
        })
    }

    /// An empty table with a single class.
    pub fn empty() -> Self {
        Params {
            entries: Vec::new(),
            index: HashMap::new(),
            nb_classes: 1,
        }
    }

    /// Number of latent classes.
    pub fn nb_classes(&self) -> usize {
        self.nb_classes
    }

    /// Resolves a name for a latent class: the class-specific variant
    /// `name:c<class>` takes precedence over the plain name.
    ///
    /// A missing name is logged once and yields `None`.
    pub fn resolve(&self, name: &str, class: usize) -> Option<ParamId> {
        if self.nb_classes > 1 {
            if let Some(&id) = self.index.get(format!("{name}:c{class}").as_str()) {
                return Some(id);
            }
        }
        match self.index.get(name) {
            Some(&id) => Some(id),
            None => {
                logging::warn_missing_parameter(name);
                None
            }
        }
    }

    /// Current value of a parameter.
    pub fn value(&self, id: ParamId) -> f64 {
        self.entries[id.0].value
    }

    /// Name of a parameter.
    pub fn name(&self, id: ParamId) -> &str {
        &self.entries[id.0].name
    }

    /// Whether the parameter is estimated.
    pub fn is_estimated(&self, id: ParamId) -> bool {
        self.entries[id.0].estimate
    }

    /// Permissive value lookup by name: 0 when missing.
    pub fn get(&self, name: &str, class: usize) -> f64 {
        self.resolve(name, class).map_or(0.0, |id| self.value(id))
    }

    /// Identifiers of the estimated parameters, in table order.
    pub fn estimated(&self) -> Vec<ParamId> {
        (0..self.entries.len())
            .map(ParamId)
            .filter(|&id| self.entries[id.0].estimate)
            .collect()
    }

    /// Overwrites the values of the given parameters.
    pub fn set_values(&mut self, ids: &[ParamId], values: &[f64]) {
        debug_assert_eq!(ids.len(), values.len());
        for (&id, &value) in ids.iter().zip(values.iter()) {
            self.entries[id.0].value = value;
        }
    }

    /// Iterates over the rows of the table.
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.entries.iter()
    }
}

/// Per-activity caps on the tracked duration.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct MaxDurations {
    pub home: u32,
    pub work: u32,
    pub shop: u32,
    pub other: u32,
}

impl Default for MaxDurations {
    fn default() -> Self {
        MaxDurations {
            home: 12,
            work: 12,
            shop: 6,
            other: 6,
        }
    }
}

impl MaxDurations {
    /// Cap for the given activity; the travel phases track no duration.
    pub fn for_activity(&self, activity: Activity) -> u32 {
        match activity {
            Activity::Depart | Activity::Arrive => 0,
            Activity::Home => self.home,
            Activity::Work => self.work,
            Activity::Shop => self.shop,
            Activity::Other => self.other,
        }
    }
}

/// Peak periods, in hours of day.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct PeakConfig {
    pub am_start_hour: f64,
    pub am_end_hour: f64,
    pub pm_start_hour: f64,
    pub pm_end_hour: f64,
    /// Width of the cosine-smoothed transition on each side of a peak.
    pub buffer_hours: f64,
}

impl Default for PeakConfig {
    fn default() -> Self {
        PeakConfig {
            am_start_hour: 7.0,
            am_end_hour: 9.0,
            pm_start_hour: 15.0,
            pm_end_hour: 17.0,
            buffer_hours: 1.0,
        }
    }
}

/// Static configuration of the model.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub horizon: Horizon,
    pub peaks: PeakConfig,
    pub max_tracked_duration: MaxDurations,
    /// Activities that can be started at a non-fixed location.
    pub discretionary: Vec<Activity>,
    /// Modes available to agents without a car.
    ///
    /// The default is all modes, letting the utility discourage car use;
    /// restrict the set here to forbid it outright.
    pub no_car_modes: Vec<Mode>,
    /// Scale of the multiplicative perturbation applied to the starting
    /// point of estimation restarts.
    pub restart_scale: f64,
    /// Default number of simulated alternatives per choice set.
    pub nb_alternatives: usize,
    /// Seed of the random draws; random when absent.
    ///
    /// A run with a seed is reproducible: each agent draws from its own
    /// stream seeded by `seed + agent id`.
    pub random_seed: Option<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            horizon: Horizon::default(),
            peaks: PeakConfig::default(),
            max_tracked_duration: MaxDurations::default(),
            discretionary: vec![Activity::Shop, Activity::Other],
            no_car_modes: Mode::ALL.to_vec(),
            restart_scale: 2.0,
            nb_alternatives: 500,
            random_seed: None,
        }
    }
}

/// Everything the workers need: configuration, parameters and the immutable
/// zonal and network data.
#[derive(Debug)]
pub struct ModelContext {
    pub config: ModelConfig,
    pub params: Params,
    pub zones: ZoneTable,
    pub los: LosTables,
    pub peaks: PeakSchedule,
}

impl ModelContext {
    /// Assembles the context and derives the peak schedule in timesteps.
    pub fn new(config: ModelConfig, params: Params, zones: ZoneTable, los: LosTables) -> Self {
        let peaks = PeakSchedule::from_config(&config.peaks, &config.horizon);
        ModelContext {
            config,
            params,
            zones,
            los,
            peaks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, value: f64, estimate: bool) -> Parameter {
        Parameter {
            name: name.to_owned(),
            value,
            estimate,
        }
    }

    #[test]
    fn nb_classes_extraction_test() {
        let params = Params::new(vec![row(NB_CLASSES, 3.0, false), row("b_cost", -0.1, true)])
            .unwrap();
        assert_eq!(params.nb_classes(), 3);
        // `nClasses` defaults to 1 when absent.
        let params = Params::new(vec![row("b_cost", -0.1, true)]).unwrap();
        assert_eq!(params.nb_classes(), 1);
    }

    #[test]
    fn class_specific_resolution_test() {
        let params = Params::new(vec![
            row(NB_CLASSES, 2.0, false),
            row("b_cost", -0.1, false),
            row("b_cost:c1", -0.5, false),
        ])
        .unwrap();
        assert_eq!(params.get("b_cost", 0), -0.1);
        assert_eq!(params.get("b_cost", 1), -0.5);
    }

    #[test]
    fn permissive_lookup_test() {
        let params = Params::new(vec![row("b_cost", -0.1, false)]).unwrap();
        assert_eq!(params.get("no_such_parameter", 0), 0.0);
    }

    #[test]
    fn estimated_set_test() {
        let mut params = Params::new(vec![
            row("a", 1.0, true),
            row("b", 2.0, false),
            row("c", 3.0, true),
        ])
        .unwrap();
        let ids = params.estimated();
        assert_eq!(ids.len(), 2);
        params.set_values(&ids, &[10.0, 30.0]);
        assert_eq!(params.get("a", 0), 10.0);
        assert_eq!(params.get("b", 0), 2.0);
        assert_eq!(params.get("c", 0), 30.0);
    }

    #[test]
    fn duplicate_parameter_test() {
        assert!(Params::new(vec![row("a", 1.0, true), row("a", 2.0, false)]).is_err());
    }
}
