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

//! Everything related to logging.
use std::fs::File;
use std::path::Path;
use std::sync::{LazyLock, Mutex};

use anyhow::{Context, Result};
use hashbrown::HashSet;
use log::{warn, LevelFilter};
use simplelog::{
    ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};

static MISSING_PARAMETERS: LazyLock<Mutex<HashSet<String>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Warns about a parameter name that is not defined in the parameter table.
///
/// The warning is sent at most once per distinct name; the lookup itself is
/// permissive and yields 0.
pub(crate) fn warn_missing_parameter(name: &str) {
    let mut sent = LazyLock::force(&MISSING_PARAMETERS).lock().unwrap();
    if sent.insert(name.to_owned()) {
        warn!("Parameter `{name}` is not defined: using 0");
    }
}

/// Initializes logging to the terminal and, optionally, to a file.
///
/// The terminal logger is verbose only when `console` is set; the file
/// logger records everything down to debug level.
pub fn initialize_logging(console: bool, log_file: Option<&Path>) -> Result<()> {
    let term_level = if console {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        term_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = log_file {
        let file = File::create(path)
            .with_context(|| format!("Failed to create log file `{path:?}`"))?;
        loggers.push(WriteLogger::new(LevelFilter::Debug, Config::default(), file));
    }
    CombinedLogger::init(loggers).context("Failed to initialize logging")
}
