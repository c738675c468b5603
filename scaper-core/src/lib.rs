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

//! Scaper: a microsimulation engine for travel behavior.
//!
//! Each agent is driven through a finite-horizon decision process over
//! (activity, location, time, history) states. The engine computes the
//! recursive expected utility of every state, simulates day-paths from the
//! induced choice distribution, builds importance-sampled choice sets and
//! estimates the utility parameters by maximum likelihood.
#![doc(html_no_source)]

pub mod choiceset;
pub mod daypath;
pub mod estimation;
pub mod io;
pub mod logging;
pub mod parameters;
pub mod population;
pub mod progress_bar;
pub mod run;
pub mod simulator;
pub mod state_space;
pub mod units;
pub mod utility;
pub mod value_function;
pub mod world;

// Dependencies only used in the bins.
use clap as _;
use serde_json as _;
