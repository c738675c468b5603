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

//! Time units of the model.
//!
//! Internally, all times of day are expressed in (possibly fractional)
//! timesteps since the start of the simulated day. The [Horizon] converts
//! between timesteps, minutes and wall-clock `HH:MM` strings.
use anyhow::{bail, Context, Result};
use serde_derive::Deserialize;

/// Grid times within this tolerance of an integer are snapped to it.
const SNAP_TOLERANCE: f64 = 1e-9;

/// The simulated day: its bounds, its time quantum and the minimum advance
/// of a within-activity decision.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct Horizon {
    /// Hour of day at which the simulated day starts.
    pub day_start_hour: f64,
    /// Hour of day at which the simulated day ends.
    pub day_end_hour: f64,
    /// Length of one timestep, in minutes.
    pub timestep_minutes: f64,
    /// Minimum time advance of a `Continue` decision, in timesteps.
    pub decision_step: u32,
}

impl Default for Horizon {
    fn default() -> Self {
        Horizon {
            day_start_hour: 4.0,
            day_end_hour: 24.0,
            timestep_minutes: 10.0,
            decision_step: 1,
        }
    }
}

impl Horizon {
    /// Number of timesteps in the day.
    pub fn day_length(&self) -> usize {
        let steps = (self.day_end_hour - self.day_start_hour) * 60.0 / self.timestep_minutes;
        steps.round() as usize
    }

    /// Converts a duration in minutes to timesteps.
    pub fn minutes_to_timesteps(&self, minutes: f64) -> f64 {
        minutes / self.timestep_minutes
    }

    /// Converts a duration in timesteps to minutes.
    pub fn timesteps_to_minutes(&self, timesteps: f64) -> f64 {
        timesteps * self.timestep_minutes
    }

    /// Converts an hour of day to a time of day in timesteps.
    pub fn hour_to_time(&self, hour: f64) -> f64 {
        (hour - self.day_start_hour) * 60.0 / self.timestep_minutes
    }

    /// The time advance of a within-activity decision taken at `time`:
    /// the decision step, clamped so that the day end is not overshot.
    pub fn decision_step_at(&self, time: f64) -> f64 {
        (self.decision_step as f64).min((self.day_length() as f64 - time).max(0.0))
    }

    /// Snaps a time of day to the nearest grid point when within tolerance.
    ///
    /// Times are sums of floating-point steps; snapping keeps grid times
    /// exactly integral so that day-end comparisons stay exact.
    pub fn snap(&self, time: f64) -> f64 {
        let rounded = time.round();
        if (time - rounded).abs() < SNAP_TOLERANCE {
            rounded
        } else {
            time
        }
    }

    /// Formats a time of day as `HH:MM`, truncated to the minute.
    pub fn format_hhmm(&self, time: f64) -> String {
        let minutes = self.day_start_hour * 60.0 + self.timesteps_to_minutes(time);
        let minutes = minutes.floor() as i64;
        format!("{:02}:{:02}", minutes.div_euclid(60) % 24, minutes.rem_euclid(60))
    }

    /// Parses a `HH:MM` string into a time of day in timesteps.
    pub fn parse_hhmm(&self, s: &str) -> Result<f64> {
        let (h, m) = s
            .split_once(':')
            .with_context(|| format!("Invalid time `{s}`: expected HH:MM"))?;
        let h: f64 = h
            .trim()
            .parse()
            .with_context(|| format!("Invalid hour in `{s}`"))?;
        let m: f64 = m
            .trim()
            .parse()
            .with_context(|| format!("Invalid minute in `{s}`"))?;
        if !(0.0..60.0).contains(&m) {
            bail!("Invalid minute in `{s}`");
        }
        Ok(self.hour_to_time(h + m / 60.0))
    }
}

/// Returns the fractional part of a non-negative time.
///
/// **Panics** on negative input: times of day are non-negative by
/// construction, so a negative input is a programmer error.
pub fn frac(x: f64) -> f64 {
    assert!(x >= 0.0, "frac called on a negative time: {x}");
    x.fract()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_length_test() {
        let h = Horizon::default();
        assert_eq!(h.day_length(), 120);
        let h = Horizon {
            day_start_hour: 5.0,
            day_end_hour: 23.0,
            timestep_minutes: 10.0,
            decision_step: 1,
        };
        assert_eq!(h.day_length(), 108);
    }

    #[test]
    fn hhmm_roundtrip_test() {
        let h = Horizon::default();
        let t = h.parse_hhmm("08:30").unwrap();
        assert!((t - 27.0).abs() < 1e-12);
        assert_eq!(h.format_hhmm(t), "08:30");
        // Truncation to the minute.
        assert_eq!(h.format_hhmm(t + 0.05), "08:30");
        assert!(h.parse_hhmm("8h30").is_err());
        assert!(h.parse_hhmm("08:75").is_err());
    }

    #[test]
    fn decision_step_clamps_at_day_end_test() {
        let h = Horizon::default();
        assert_eq!(h.decision_step_at(0.0), 1.0);
        assert_eq!(h.decision_step_at(119.5), 0.5);
        assert_eq!(h.decision_step_at(120.0), 0.0);
    }

    #[test]
    fn frac_test() {
        assert_eq!(frac(3.25), 0.25);
        assert_eq!(frac(0.0), 0.0);
    }

    #[test]
    #[should_panic(expected = "negative time")]
    fn frac_negative_panics_test() {
        frac(-0.1);
    }
}
