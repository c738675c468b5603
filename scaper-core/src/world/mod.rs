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

//! The world as one agent sees it: zonal attributes, level-of-service
//! matrices and, on sampled worlds, the zone-sampling corrections.
//!
//! A [World] is either the full zone system (borrowing the immutable global
//! arrays) or an importance-sampled view whose buffers are rented from the
//! worker's pool. Level-of-service queries return one or two [Mat]s: modes
//! with a peak distinction return the off-peak matrix scaled by `1 - p` and
//! the peak matrix scaled by `p`, where `p` is the cosine-smoothed peak
//! proportion at the departure time.
pub mod sampling;

use hashbrown::HashMap;
use mat::{Mat, MatPool, Shape};
use object_pool::Reusable;

use crate::parameters::{ModelContext, PeakConfig};
use crate::state_space::{Location, LocationCase, Mode, NB_MODES};
use crate::units::Horizon;

/// Zonal attributes, indexed by zone in file order.
#[derive(Clone, Debug, Default)]
pub struct ZoneTable {
    pub nb_zones: usize,
    pub population: Vec<f64>,
    pub employment: Vec<f64>,
    /// Parking rate per minute.
    pub parking_per_minute: Vec<f64>,
    pub log_population: Vec<f64>,
    pub log_employment: Vec<f64>,
    /// The identity zone array `0..nb_zones`, exposed by full worlds.
    identity: Vec<usize>,
}

impl ZoneTable {
    /// Builds the table from raw columns; the parking rate is given per
    /// hour, as in the input file.
    pub fn new(population: Vec<f64>, employment: Vec<f64>, parking_per_hour: Vec<f64>) -> Self {
        let nb_zones = population.len();
        debug_assert_eq!(employment.len(), nb_zones);
        debug_assert_eq!(parking_per_hour.len(), nb_zones);
        let log_population = population.iter().map(|&x| (1.0 + x).ln()).collect();
        let log_employment = employment.iter().map(|&x| (1.0 + x).ln()).collect();
        let parking_per_minute = parking_per_hour.iter().map(|&x| x / 60.0).collect();
        ZoneTable {
            nb_zones,
            population,
            employment,
            parking_per_minute,
            log_population,
            log_employment,
            identity: (0..nb_zones).collect(),
        }
    }
}

/// One level-of-service component of one mode: an `n x n` matrix per peak
/// period, or a single matrix for modes without a peak distinction.
#[derive(Clone, Debug, Default)]
pub struct LosComponent {
    pub peak: Option<Vec<f64>>,
    pub offpeak: Vec<f64>,
}

impl LosComponent {
    /// A component without peak distinction.
    pub fn flat(values: Vec<f64>) -> Self {
        LosComponent {
            peak: None,
            offpeak: values,
        }
    }
}

/// The level of service of one mode.
#[derive(Clone, Debug, Default)]
pub struct ModeLos {
    /// In-vehicle time, in minutes.
    pub time: LosComponent,
    /// Waiting time, in minutes.
    pub wait: LosComponent,
    /// Access time, in minutes.
    pub access: LosComponent,
    /// Monetary cost.
    pub cost: LosComponent,
    /// Range of the door-to-door travel time over all cells and periods, in
    /// minutes.
    pub minute_range: (f64, f64),
}

impl ModeLos {
    /// Builds the mode tables and pre-computes the door-to-door minute
    /// range.
    pub fn new(time: LosComponent, wait: LosComponent, access: LosComponent, cost: LosComponent) -> Self {
        let mut mode = ModeLos {
            time,
            wait,
            access,
            cost,
            minute_range: (0.0, 0.0),
        };
        mode.minute_range = minute_range(
            (&mode.time.offpeak, mode.time.peak.as_deref()),
            (&mode.wait.offpeak, mode.wait.peak.as_deref()),
            (&mode.access.offpeak, mode.access.peak.as_deref()),
        );
        mode
    }
}

/// Computes the minimum and maximum door-to-door minutes over all cells of
/// all periods. Each component is given as its off-peak slice and, when the
/// mode distinguishes periods, its peak slice.
pub(crate) fn minute_range(
    time: (&[f64], Option<&[f64]>),
    wait: (&[f64], Option<&[f64]>),
    access: (&[f64], Option<&[f64]>),
) -> (f64, f64) {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    let has_peak = time.1.is_some() || wait.1.is_some() || access.1.is_some();
    for peak in [false, true] {
        if peak && !has_peak {
            continue;
        }
        let pick = |c: (&[f64], Option<&[f64]>), i: usize| -> f64 {
            match (peak, c.1) {
                (true, Some(p)) => p[i],
                _ => c.0[i],
            }
        };
        for i in 0..time.0.len() {
            let total = pick(time, i) + pick(wait, i) + pick(access, i);
            lo = lo.min(total);
            hi = hi.max(total);
        }
    }
    if lo.is_finite() {
        (lo, hi)
    } else {
        (0.0, 0.0)
    }
}

/// The level-of-service tables of all modes.
#[derive(Clone, Debug, Default)]
pub struct LosTables {
    modes: Vec<ModeLos>,
    pub nb_zones: usize,
}

impl LosTables {
    /// Builds the tables; `modes` is indexed by [Mode::index].
    pub fn new(modes: Vec<ModeLos>, nb_zones: usize) -> Self {
        debug_assert_eq!(modes.len(), NB_MODES);
        LosTables { modes, nb_zones }
    }

    /// The tables of one mode.
    pub fn mode(&self, mode: Mode) -> &ModeLos {
        &self.modes[mode.index()]
    }
}

/// The peak periods in timesteps, with C1-continuous cosine-smoothed
/// transitions over the buffer.
#[derive(Clone, Copy, Debug)]
pub struct PeakSchedule {
    windows: [(f64, f64); 2],
    buffer: f64,
}

impl PeakSchedule {
    /// Converts the configured peak hours to timesteps.
    pub fn from_config(config: &PeakConfig, horizon: &Horizon) -> Self {
        PeakSchedule {
            windows: [
                (
                    horizon.hour_to_time(config.am_start_hour),
                    horizon.hour_to_time(config.am_end_hour),
                ),
                (
                    horizon.hour_to_time(config.pm_start_hour),
                    horizon.hour_to_time(config.pm_end_hour),
                ),
            ],
            buffer: horizon.minutes_to_timesteps(config.buffer_hours * 60.0),
        }
    }

    /// The proportion of peak conditions at time `t`: 1 inside a peak
    /// window, 0 outside the buffered windows, cosine-smoothed across the
    /// buffers. The AM and PM windows are independent.
    pub fn proportion_peak(&self, t: f64) -> f64 {
        self.windows
            .iter()
            .map(|&w| self.window_proportion(w, t))
            .fold(0.0, f64::max)
    }

    fn window_proportion(&self, (start, end): (f64, f64), t: f64) -> f64 {
        let b = self.buffer;
        if (start..=end).contains(&t) {
            1.0
        } else if b <= 0.0 {
            0.0
        } else if t > start - b && t < start {
            cos_smooth((t - (start - b)) / b)
        } else if t > end && t < end + b {
            cos_smooth(((end + b) - t) / b)
        } else {
            0.0
        }
    }
}

/// Half-cycle cosine smoothing over the unit interval: 0 at 0, 1 at 1, with
/// zero slope at both ends.
fn cos_smooth(x: f64) -> f64 {
    0.5 * (1.0 - (std::f64::consts::PI * x).cos())
}

/// One side of a level-of-service query: a concrete (local) zone or all
/// zones of the world.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    One(usize),
    All,
}

/// The components of the level of service.
#[derive(Clone, Copy, Debug)]
enum Component {
    Time,
    Wait,
    Access,
    Cost,
}

pub(crate) struct SampledComponent<'w> {
    pub(crate) peak: Option<Reusable<'w, Vec<f64>>>,
    pub(crate) offpeak: Reusable<'w, Vec<f64>>,
}

pub(crate) struct SampledMode<'w> {
    pub(crate) time: SampledComponent<'w>,
    pub(crate) wait: SampledComponent<'w>,
    pub(crate) access: SampledComponent<'w>,
    pub(crate) cost: SampledComponent<'w>,
    pub(crate) minute_range: (f64, f64),
}

/// The sampled part of a [World]: the selected zones, the gathered arrays
/// and the sampling corrections.
pub(crate) struct ZoneSample<'w> {
    pub(crate) zones: Vec<usize>,
    pub(crate) z_index: HashMap<usize, usize>,
    /// `-ln(N p_d)` per local destination.
    pub(crate) dest_correction: Vec<f64>,
    pub(crate) modes: Vec<SampledMode<'w>>,
    pub(crate) population: Reusable<'w, Vec<f64>>,
    pub(crate) employment: Reusable<'w, Vec<f64>>,
    pub(crate) parking_per_minute: Reusable<'w, Vec<f64>>,
    pub(crate) log_population: Reusable<'w, Vec<f64>>,
    pub(crate) log_employment: Reusable<'w, Vec<f64>>,
}

/// A per-agent snapshot of the zonal and origin-destination data.
pub struct World<'c, 'w> {
    ctx: &'c ModelContext,
    sample: Option<ZoneSample<'w>>,
    /// Multiplier applied to in-vehicle travel times (used by the
    /// travel-time sensitivity sweeps).
    tt_scale: f64,
}

impl<'c, 'w> World<'c, 'w> {
    /// The full-zone world.
    pub fn full(ctx: &'c ModelContext) -> Self {
        World {
            ctx,
            sample: None,
            tt_scale: 1.0,
        }
    }

    pub(crate) fn sampled(ctx: &'c ModelContext, sample: ZoneSample<'w>) -> Self {
        World {
            ctx,
            sample: Some(sample),
            tt_scale: 1.0,
        }
    }

    /// Whether this is an importance-sampled view.
    pub fn is_sampled(&self) -> bool {
        self.sample.is_some()
    }

    /// Number of zones of the view.
    pub fn nb_zones(&self) -> usize {
        match &self.sample {
            Some(s) => s.zones.len(),
            None => self.ctx.zones.nb_zones,
        }
    }

    /// The global zone ids of the view, in local order.
    pub fn zones(&self) -> &[usize] {
        match &self.sample {
            Some(s) => &s.zones,
            None => &self.ctx.zones.identity,
        }
    }

    /// The local index of a global zone.
    ///
    /// **Panics** if the zone is not part of the view: callers only query
    /// zones that the sampling was required to include.
    pub fn z_index(&self, zone: usize) -> usize {
        match &self.sample {
            Some(s) => *s
                .z_index
                .get(&zone)
                .unwrap_or_else(|| panic!("zone {zone} is not part of the sampled world")),
            None => {
                debug_assert!(zone < self.ctx.zones.nb_zones);
                zone
            }
        }
    }

    /// The global zone id of a local index.
    pub fn global_zone(&self, local: usize) -> usize {
        match &self.sample {
            Some(s) => s.zones[local],
            None => local,
        }
    }

    /// The query axis of a location: its concrete local zone, or all zones.
    pub fn axis(&self, location: &Location) -> Axis {
        match location.zone() {
            Some(z) => Axis::One(self.z_index(z)),
            None => Axis::All,
        }
    }

    /// The travel-time multiplier of the view.
    pub fn tt_scale(&self) -> f64 {
        self.tt_scale
    }

    /// Sets the travel-time multiplier.
    pub fn set_tt_scale(&mut self, scale: f64) {
        self.tt_scale = scale;
    }

    fn component_slices(&self, mode: Mode, component: Component) -> (&[f64], Option<&[f64]>) {
        match &self.sample {
            Some(s) => {
                let m = &s.modes[mode.index()];
                let c = match component {
                    Component::Time => &m.time,
                    Component::Wait => &m.wait,
                    Component::Access => &m.access,
                    Component::Cost => &m.cost,
                };
                (
                    c.offpeak.as_slice(),
                    c.peak.as_deref().map(|v| v.as_slice()),
                )
            }
            None => {
                let m = self.ctx.los.mode(mode);
                let c = match component {
                    Component::Time => &m.time,
                    Component::Wait => &m.wait,
                    Component::Access => &m.access,
                    Component::Cost => &m.cost,
                };
                (c.offpeak.as_slice(), c.peak.as_deref())
            }
        }
    }

    /// Copies the cells selected by the axes out of an `n x n` slice.
    fn gather<'m>(&self, pool: &'m MatPool, values: &[f64], o: Axis, d: Axis) -> Mat<'m> {
        let n = self.nb_zones();
        match (o, d) {
            (Axis::One(o), Axis::One(d)) => {
                let mut m = pool.acquire(Shape::Scalar);
                m.data_mut()[0] = values[o * n + d];
                m
            }
            (Axis::One(o), Axis::All) => {
                let mut m = pool.acquire(Shape::Row(n));
                m.data_mut().copy_from_slice(&values[o * n..(o + 1) * n]);
                m
            }
            (Axis::All, Axis::One(d)) => {
                let mut m = pool.acquire(Shape::Col(n));
                for (k, v) in m.data_mut().iter_mut().enumerate() {
                    *v = values[k * n + d];
                }
                m
            }
            (Axis::All, Axis::All) => {
                let mut m = pool.acquire(Shape::Full(n));
                m.data_mut().copy_from_slice(values);
                m
            }
        }
    }

    fn query<'m>(
        &self,
        pool: &'m MatPool,
        mode: Mode,
        component: Component,
        o: Axis,
        d: Axis,
        t: f64,
        scale: f64,
    ) -> (Mat<'m>, Option<Mat<'m>>) {
        let (offpeak, peak) = self.component_slices(mode, component);
        let mut base = self.gather(pool, offpeak, o, d);
        base.scale_inplace(scale);
        match peak {
            None => (base, None),
            Some(peak) => {
                let p = self.ctx.peaks.proportion_peak(t);
                base.scale_inplace(1.0 - p);
                let mut peak_mat = self.gather(pool, peak, o, d);
                peak_mat.scale_inplace(scale * p);
                (base, Some(peak_mat))
            }
        }
    }

    /// In-vehicle travel time in minutes, as a peak/off-peak pair whose
    /// scaled sum is the effective value at departure time `t`.
    pub fn travel_time<'m>(
        &self,
        pool: &'m MatPool,
        mode: Mode,
        o: Axis,
        d: Axis,
        t: f64,
    ) -> (Mat<'m>, Option<Mat<'m>>) {
        self.query(pool, mode, Component::Time, o, d, t, self.tt_scale)
    }

    /// Waiting time in minutes.
    pub fn travel_wait<'m>(
        &self,
        pool: &'m MatPool,
        mode: Mode,
        o: Axis,
        d: Axis,
        t: f64,
    ) -> (Mat<'m>, Option<Mat<'m>>) {
        self.query(pool, mode, Component::Wait, o, d, t, 1.0)
    }

    /// Access time in minutes.
    pub fn travel_access<'m>(
        &self,
        pool: &'m MatPool,
        mode: Mode,
        o: Axis,
        d: Axis,
        t: f64,
    ) -> (Mat<'m>, Option<Mat<'m>>) {
        self.query(pool, mode, Component::Access, o, d, t, 1.0)
    }

    /// Monetary travel cost.
    pub fn travel_cost<'m>(
        &self,
        pool: &'m MatPool,
        mode: Mode,
        o: Axis,
        d: Axis,
        t: f64,
    ) -> (Mat<'m>, Option<Mat<'m>>) {
        self.query(pool, mode, Component::Cost, o, d, t, 1.0)
    }

    fn scalar_component(&self, mode: Mode, component: Component, o: usize, d: usize, t: f64) -> f64 {
        let idx = o * self.nb_zones() + d;
        let (offpeak, peak) = self.component_slices(mode, component);
        match peak {
            None => offpeak[idx],
            Some(peak) => {
                let p = self.ctx.peaks.proportion_peak(t);
                (1.0 - p) * offpeak[idx] + p * peak[idx]
            }
        }
    }

    /// Peak-blended in-vehicle minutes between two local zones.
    pub fn scalar_time(&self, mode: Mode, o: usize, d: usize, t: f64) -> f64 {
        self.tt_scale * self.scalar_component(mode, Component::Time, o, d, t)
    }

    /// Peak-blended waiting minutes between two local zones.
    pub fn scalar_wait(&self, mode: Mode, o: usize, d: usize, t: f64) -> f64 {
        self.scalar_component(mode, Component::Wait, o, d, t)
    }

    /// Peak-blended access minutes between two local zones.
    pub fn scalar_access(&self, mode: Mode, o: usize, d: usize, t: f64) -> f64 {
        self.scalar_component(mode, Component::Access, o, d, t)
    }

    /// Peak-blended monetary cost between two local zones.
    pub fn scalar_cost(&self, mode: Mode, o: usize, d: usize, t: f64) -> f64 {
        self.scalar_component(mode, Component::Cost, o, d, t)
    }

    /// Scalar door-to-door travel time in minutes between two local zones
    /// at departure time `t` (in-vehicle, wait and access, peak-blended).
    pub fn scalar_travel_minutes(&self, mode: Mode, o: usize, d: usize, t: f64) -> f64 {
        self.scalar_time(mode, o, d, t)
            + self.scalar_wait(mode, o, d, t)
            + self.scalar_access(mode, o, d, t)
    }

    /// Log-population of one local zone.
    pub fn log_pop_value(&self, local: usize) -> f64 {
        match &self.sample {
            Some(s) => s.log_population[local],
            None => self.ctx.zones.log_population[local],
        }
    }

    /// Log-employment of one local zone.
    pub fn log_emp_value(&self, local: usize) -> f64 {
        match &self.sample {
            Some(s) => s.log_employment[local],
            None => self.ctx.zones.log_employment[local],
        }
    }

    /// Parking rate per minute of one local zone.
    pub fn parking_value(&self, local: usize) -> f64 {
        match &self.sample {
            Some(s) => s.parking_per_minute[local],
            None => self.ctx.zones.parking_per_minute[local],
        }
    }

    /// The inclusive range of integral timesteps a travel with this mode
    /// may consume, across peak and off-peak.
    ///
    /// For a concrete origin-destination pair, the range of that cell;
    /// otherwise the range over all cells of the view (a superset is
    /// harmless: it only produces extra interpolation anchors).
    pub fn travel_timesteps(&self, mode: Mode, o: Axis, d: Axis) -> (i64, i64) {
        let horizon = &self.ctx.config.horizon;
        let (lo_min, hi_min) = match (o, d) {
            (Axis::One(o), Axis::One(d)) => {
                let n = self.nb_zones();
                let idx = o * n + d;
                let mut lo = f64::INFINITY;
                let mut hi = f64::NEG_INFINITY;
                for peak in [false, true] {
                    let mut total = 0.0;
                    let mut present = !peak;
                    for (component, scale) in [
                        (Component::Time, self.tt_scale),
                        (Component::Wait, 1.0),
                        (Component::Access, 1.0),
                    ] {
                        let (offpeak, peak_values) = self.component_slices(mode, component);
                        let value = match (peak, peak_values) {
                            (true, Some(p)) => {
                                present = true;
                                p[idx]
                            }
                            _ => offpeak[idx],
                        };
                        total += scale * value;
                    }
                    if present {
                        lo = lo.min(total);
                        hi = hi.max(total);
                    }
                }
                (lo, hi)
            }
            _ => {
                let (lo, hi) = match &self.sample {
                    Some(s) => s.modes[mode.index()].minute_range,
                    None => self.ctx.los.mode(mode).minute_range,
                };
                // The pre-computed range excludes the travel-time scale;
                // widen conservatively.
                (lo * self.tt_scale.min(1.0), hi * self.tt_scale.max(1.0))
            }
        };
        let lo = horizon.minutes_to_timesteps(lo_min).floor() as i64;
        let hi = horizon.minutes_to_timesteps(hi_min).ceil() as i64;
        (lo.max(0), hi.max(lo.max(0)))
    }

    /// Parking rate per minute at the location axis (a column over origins,
    /// or a scalar).
    pub fn parking_rate<'m>(&self, pool: &'m MatPool, axis: Axis) -> Mat<'m> {
        let values: &[f64] = match &self.sample {
            Some(s) => &s.parking_per_minute,
            None => &self.ctx.zones.parking_per_minute,
        };
        self.zone_vector(pool, values, axis, false)
    }

    /// Log-population of the destination axis (a row over destinations, or
    /// a scalar).
    pub fn log_pop<'m>(&self, pool: &'m MatPool, axis: Axis) -> Mat<'m> {
        let values: &[f64] = match &self.sample {
            Some(s) => &s.log_population,
            None => &self.ctx.zones.log_population,
        };
        self.zone_vector(pool, values, axis, true)
    }

    /// Log-employment of the destination axis.
    pub fn log_emp<'m>(&self, pool: &'m MatPool, axis: Axis) -> Mat<'m> {
        let values: &[f64] = match &self.sample {
            Some(s) => &s.log_employment,
            None => &self.ctx.zones.log_employment,
        };
        self.zone_vector(pool, values, axis, true)
    }

    fn zone_vector<'m>(
        &self,
        pool: &'m MatPool,
        values: &[f64],
        axis: Axis,
        by_destination: bool,
    ) -> Mat<'m> {
        match axis {
            Axis::One(z) => {
                let mut m = pool.acquire(Shape::Scalar);
                m.data_mut()[0] = values[z];
                m
            }
            Axis::All => {
                let n = self.nb_zones();
                let shape = if by_destination {
                    Shape::Row(n)
                } else {
                    Shape::Col(n)
                };
                let mut m = pool.acquire(shape);
                m.data_mut().copy_from_slice(&values[..n]);
                m
            }
        }
    }

    /// The zone-sampling correction of a travel decision: zero on full
    /// worlds and for fixed-zone destinations, `-ln(N p_d)` off the
    /// diagonal for non-fixed destinations.
    ///
    /// The returned shape is a scalar, row, column or full matrix depending
    /// on which of origin and destination carries a concrete zone.
    pub fn corrections<'m>(&self, pool: &'m MatPool, origin: Axis, dest: &Location) -> Mat<'m> {
        let Some(sample) = &self.sample else {
            return pool.acquire(Shape::Scalar);
        };
        if dest.case() != LocationCase::NonFixed {
            return pool.acquire(Shape::Scalar);
        }
        let n = self.nb_zones();
        let c = &sample.dest_correction;
        match (origin, dest.zone()) {
            (Axis::One(o), Some(zone)) => {
                let d = self.z_index(zone);
                let mut m = pool.acquire(Shape::Scalar);
                m.data_mut()[0] = if o == d { 0.0 } else { c[d] };
                m
            }
            (Axis::One(o), None) => {
                let mut m = pool.acquire(Shape::Row(n));
                m.data_mut().copy_from_slice(c);
                m.data_mut()[o] = 0.0;
                m
            }
            (Axis::All, Some(zone)) => {
                let d = self.z_index(zone);
                let mut m = pool.acquire(Shape::Col(n));
                m.data_mut().fill(c[d]);
                m.data_mut()[d] = 0.0;
                m
            }
            (Axis::All, None) => {
                let mut m = pool.acquire(Shape::Full(n));
                for (o, row) in m.data_mut().chunks_exact_mut(n).enumerate() {
                    row.copy_from_slice(c);
                    row[o] = 0.0;
                }
                m
            }
        }
    }

    /// The scalar correction of a concrete travel step, mirroring
    /// [World::corrections].
    pub fn correction_value(&self, origin_local: usize, dest: &Location) -> f64 {
        let Some(sample) = &self.sample else {
            return 0.0;
        };
        if dest.case() != LocationCase::NonFixed {
            return 0.0;
        }
        let d = self.z_index(dest.zone().expect("concrete travel step"));
        if origin_local == d {
            0.0
        } else {
            sample.dest_correction[d]
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A zone table with uniform attributes.
    pub(crate) fn uniform_zones(nb_zones: usize) -> ZoneTable {
        ZoneTable::new(
            vec![1000.0; nb_zones],
            vec![500.0; nb_zones],
            vec![1.2; nb_zones],
        )
    }

    /// Level-of-service tables with a constant travel time for every mode
    /// and no peak distinction, zero wait and access, unit cost.
    pub(crate) fn constant_los(nb_zones: usize, _horizon: &Horizon, minutes: f64) -> LosTables {
        let n2 = nb_zones * nb_zones;
        let modes = Mode::ALL
            .iter()
            .map(|_| {
                ModeLos::new(
                    LosComponent::flat(vec![minutes; n2]),
                    LosComponent::flat(vec![0.0; n2]),
                    LosComponent::flat(vec![0.0; n2]),
                    LosComponent::flat(vec![1.0; n2]),
                )
            })
            .collect();
        LosTables::new(modes, nb_zones)
    }

    fn peak_schedule() -> PeakSchedule {
        let horizon = Horizon::default();
        PeakSchedule::from_config(&PeakConfig::default(), &horizon)
    }

    #[test]
    fn proportion_peak_boundaries_test() {
        let peaks = peak_schedule();
        let horizon = Horizon::default();
        // Exactly at peak start and end: 1.
        assert_eq!(peaks.proportion_peak(horizon.hour_to_time(7.0)), 1.0);
        assert_eq!(peaks.proportion_peak(horizon.hour_to_time(9.0)), 1.0);
        // At the outer buffer edges: 0.
        assert_eq!(peaks.proportion_peak(horizon.hour_to_time(6.0)), 0.0);
        assert_eq!(peaks.proportion_peak(horizon.hour_to_time(10.0)), 0.0);
        // Midway through the buffer: one half.
        let mid = peaks.proportion_peak(horizon.hour_to_time(9.5));
        assert!((mid - 0.5).abs() < 1e-12);
        // Strictly inside (0, 1) elsewhere in the buffer.
        let x = peaks.proportion_peak(horizon.hour_to_time(9.75));
        assert!(x > 0.0 && x < 0.5);
        // Far from the peaks: 0.
        assert_eq!(peaks.proportion_peak(horizon.hour_to_time(12.5)), 0.0);
        // The PM window is independent.
        assert_eq!(peaks.proportion_peak(horizon.hour_to_time(16.0)), 1.0);
    }

    #[test]
    fn proportion_peak_continuity_test() {
        let peaks = peak_schedule();
        let horizon = Horizon::default();
        let mut t = 0.0;
        let mut prev = peaks.proportion_peak(0.0);
        let step = 1e-3;
        while t < horizon.day_length() as f64 {
            t += step;
            let p = peaks.proportion_peak(t);
            assert!((0.0..=1.0).contains(&p));
            // Lipschitz bound of the cosine half-cycle over the buffer.
            let bound = std::f64::consts::PI / (2.0 * peaks.buffer) * step * 1.01;
            assert!((p - prev).abs() <= bound, "jump at t = {t}");
            prev = p;
        }
    }

    #[test]
    fn peak_blending_of_travel_time_test() {
        // Peak travel time 20, off-peak 10: at the buffer midpoint the
        // effective time is 15.
        let nb_zones = 2;
        let n2 = nb_zones * nb_zones;
        let mut los = constant_los(nb_zones, &Horizon::default(), 10.0);
        los.modes[Mode::Car.index()].time.peak = Some(vec![20.0; n2]);
        let config = crate::parameters::ModelConfig::default();
        let ctx = ModelContext::new(
            config,
            crate::parameters::Params::empty(),
            uniform_zones(nb_zones),
            los,
        );
        let world = World::full(&ctx);
        let pool = MatPool::new(nb_zones);
        let horizon = Horizon::default();
        let t = horizon.hour_to_time(9.5);
        let (base, peak) = world.travel_time(&pool, Mode::Car, Axis::One(0), Axis::One(1), t);
        let total = base.value(0, 0) + peak.unwrap().value(0, 0);
        assert!((total - 15.0).abs() < 1e-9);
        // The same blend drives the scalar query.
        assert!((world.scalar_travel_minutes(Mode::Car, 0, 1, t) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn travel_timesteps_range_test() {
        let nb_zones = 2;
        let horizon = Horizon::default();
        let ctx = ModelContext::new(
            crate::parameters::ModelConfig::default(),
            crate::parameters::Params::empty(),
            uniform_zones(nb_zones),
            constant_los(nb_zones, &horizon, 25.0),
        );
        let world = World::full(&ctx);
        // 25 minutes = 2.5 timesteps: anchors from 2 to 3.
        assert_eq!(world.travel_timesteps(Mode::Walk, Axis::All, Axis::All), (2, 3));
        assert_eq!(
            world.travel_timesteps(Mode::Walk, Axis::One(0), Axis::One(1)),
            (2, 3)
        );
    }

    #[test]
    fn full_world_corrections_are_zero_test() {
        let nb_zones = 3;
        let ctx = ModelContext::new(
            crate::parameters::ModelConfig::default(),
            crate::parameters::Params::empty(),
            uniform_zones(nb_zones),
            constant_los(nb_zones, &Horizon::default(), 10.0),
        );
        let world = World::full(&ctx);
        let pool = MatPool::new(nb_zones);
        let m = world.corrections(&pool, Axis::All, &Location::NonFixed(None));
        assert_eq!(m.sum(), 0.0);
        assert_eq!(world.correction_value(0, &Location::NonFixed(Some(1))), 0.0);
    }
}
