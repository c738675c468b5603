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

//! Progress bar for per-agent processing.
use std::sync::{Arc, Mutex};

use indicatif::{ProgressBar, ProgressStyle};
use log::{log_enabled, warn, Level};

/// The bar is refreshed every UPDATE increments.
const UPDATE: u64 = 1000;

#[derive(Debug, Default)]
struct Counts {
    done: u64,
    failed: u64,
}

/// A progress bar over agents that also records per-agent failures.
#[derive(Debug, Clone)]
pub struct ScaperProgressBar {
    bp: ProgressBar,
    counts: Arc<Mutex<Counts>>,
}

impl ScaperProgressBar {
    /// Returns a [ScaperProgressBar] of given length.
    pub fn new(length: usize) -> Self {
        let bp = if log_enabled!(Level::Info) {
            ProgressBar::new(length as u64)
        } else {
            ProgressBar::hidden()
        };
        bp.set_style(
            ProgressStyle::default_bar()
                .template("{bar:60} ETA: {eta}")
                .unwrap(),
        );
        ScaperProgressBar {
            bp,
            counts: Arc::new(Mutex::new(Counts::default())),
        }
    }

    /// Increments the progress bar by one successfully processed agent.
    ///
    /// The bar is refreshed only periodically.
    pub fn inc(&self) {
        let mut counts = self.counts.lock().unwrap();
        counts.done += 1;
        if counts.done % UPDATE == 0 {
            self.bp.inc(UPDATE);
        }
    }

    /// Records a failed agent and advances the bar.
    pub fn fail(&self) {
        let mut counts = self.counts.lock().unwrap();
        counts.done += 1;
        counts.failed += 1;
        if counts.done % UPDATE == 0 {
            self.bp.inc(UPDATE);
        }
    }

    /// Number of failed agents so far.
    pub fn nb_failed(&self) -> u64 {
        self.counts.lock().unwrap().failed
    }

    /// Sets the progress bar to finished and reports the failure count.
    pub fn finish(&self) {
        self.bp.finish_and_clear();
        let counts = self.counts.lock().unwrap();
        if counts.failed > 0 {
            warn!("{} of {} agents failed", counts.failed, counts.done);
        }
    }
}
