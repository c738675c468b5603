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

//! Everything related to agents.
use anyhow::{bail, Result};

/// Representation of an independent individual whose day-path is simulated.
///
/// An agent is characterized by demographics, fixed geography (home and
/// optional work zone), vehicle ownership and an optional mandated work
/// duration.
#[derive(Clone, Debug)]
pub struct Agent {
    /// Id used when writing results.
    pub id: u64,
    /// Age in years.
    pub age: f64,
    /// `true` for female agents.
    pub female: bool,
    /// Yearly income.
    pub income: f64,
    /// `true` if the agent's household has children.
    pub has_kids: bool,
    /// Zone of the agent's residence.
    pub home_zone: usize,
    /// Zone of the agent's workplace, if any.
    pub work_zone: Option<usize>,
    /// `true` if the agent's household owns a car.
    pub has_car: bool,
    /// `true` if the agent holds a transit card.
    pub transit_card: bool,
    /// Sampling weight of the agent.
    pub weight: f64,
    /// Mandated work duration in timesteps, if any.
    ///
    /// When set, the day can only end well if the agent worked exactly this
    /// long in one stretch.
    pub work_duration: Option<u32>,
}

impl Agent {
    /// Creates an agent from input values.
    ///
    /// Returns an error if some values are invalid.
    #[allow(clippy::too_many_arguments)]
    pub fn from_values(
        id: u64,
        age: f64,
        female: bool,
        income: f64,
        has_kids: bool,
        home_zone: usize,
        work_zone: Option<usize>,
        has_car: bool,
        transit_card: bool,
        weight: f64,
        work_duration: Option<u32>,
        nb_zones: usize,
    ) -> Result<Self> {
        if home_zone >= nb_zones {
            bail!("Agent {id}: home zone {home_zone} is not a valid zone");
        }
        if let Some(z) = work_zone {
            if z >= nb_zones {
                bail!("Agent {id}: work zone {z} is not a valid zone");
            }
        }
        if work_duration.is_some() && work_zone.is_none() {
            bail!("Agent {id}: mandated work duration without a work zone");
        }
        if !(weight > 0.0) {
            bail!("Agent {id}: weight must be positive, got {weight}");
        }
        Ok(Agent {
            id,
            age,
            female,
            income,
            has_kids,
            home_zone,
            work_zone,
            has_car,
            transit_card,
            weight,
            work_duration,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// An agent without a workplace, used across the test suite.
    pub(crate) fn home_agent(home_zone: usize) -> Agent {
        Agent {
            id: 1,
            age: 35.0,
            female: false,
            income: 30_000.0,
            has_kids: false,
            home_zone,
            work_zone: None,
            has_car: true,
            transit_card: false,
            weight: 1.0,
            work_duration: None,
        }
    }

    #[test]
    fn from_values_validation_test() {
        assert!(Agent::from_values(
            1, 35.0, false, 0.0, false, 10, None, true, false, 1.0, None, 5
        )
        .is_err());
        assert!(Agent::from_values(
            1, 35.0, false, 0.0, false, 0, None, true, false, 1.0, Some(48), 5
        )
        .is_err());
        assert!(Agent::from_values(
            1, 35.0, false, 0.0, false, 0, Some(1), true, false, 0.0, None, 5
        )
        .is_err());
        assert!(Agent::from_values(
            1, 35.0, false, 0.0, false, 0, Some(1), true, false, 2.0, Some(48), 5
        )
        .is_ok());
    }
}
