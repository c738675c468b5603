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

//! The per-agent expected-value cache.
//!
//! Rows are keyed by [CacheKey], the state attributes excluding time and
//! the concrete non-fixed zone. A row holds one value per integral timestep
//! plus two sentinel slots, so the interpolation kernel can always read one
//! slot past the day end; non-fixed keys hold one such stretch per zone,
//! zone-major.
//!
//! The cache is single-owner: it lives inside one agent's value function and
//! its buffers return to the worker's pool on drop.
use hashbrown::HashMap;
use mat::{BufferPool, Mat, Shape};
use object_pool::Reusable;

use crate::state_space::{cache_key, CacheKey, LocationCase, State};

struct CacheRow<'p> {
    todo: Vec<bool>,
    data: Reusable<'p, Vec<f64>>,
}

/// A memo of per-timestep values, `-inf`-defaulted for expected values and
/// zero-defaulted for derivative rows.
pub struct EvCache<'p> {
    pool: &'p BufferPool,
    default: f64,
    day_length: usize,
    nb_zones: usize,
    rows: HashMap<CacheKey, CacheRow<'p>>,
}

impl<'p> EvCache<'p> {
    /// Creates an empty cache.
    pub fn new(pool: &'p BufferPool, nb_zones: usize, day_length: usize, default: f64) -> Self {
        EvCache {
            pool,
            default,
            day_length,
            nb_zones,
            rows: HashMap::new(),
        }
    }

    /// Length of one per-zone stretch of a row.
    pub fn stride(&self) -> usize {
        self.day_length + 2
    }

    fn width(&self, key: &CacheKey) -> usize {
        match key.location {
            LocationCase::NonFixed => self.nb_zones,
            _ => 1,
        }
    }

    fn ensure_row(&mut self, key: CacheKey) -> &mut CacheRow<'p> {
        let (pool, default, day_length) = (self.pool, self.default, self.day_length);
        let len = self.width(&key) * self.stride();
        self.rows.entry(key).or_insert_with(|| CacheRow {
            todo: vec![true; day_length],
            data: pool.acquire(len, default),
        })
    }

    /// Whether the state's slot still has to be computed: its integral
    /// timestep is within the day and the todo flag of its key is set.
    ///
    /// A missing key initializes a new default-filled row.
    pub fn needs_caching(&mut self, state: &State) -> bool {
        let slot = state.time_of_day.floor() as i64;
        if slot < 0 || slot >= self.day_length as i64 {
            return false;
        }
        self.ensure_row(cache_key(state)).todo[slot as usize]
    }

    /// The full row of the state's key, creating a default row if absent.
    pub fn row(&mut self, key: &CacheKey) -> &[f64] {
        &self.ensure_row(*key).data
    }

    /// Writes the matrix at the state's integral timestep and clears the
    /// todo flag.
    ///
    /// For fixed-zone keys the matrix must be a scalar; for non-fixed keys
    /// (cached from the compressed all-zones form) a column over the zones.
    pub fn cache(&mut self, state: &State, values: &Mat) {
        let slot = state.time_of_day.floor() as usize;
        debug_assert!(slot <= self.day_length);
        let stride = self.stride();
        let day_length = self.day_length;
        let row = self.ensure_row(cache_key(state));
        match (state.location.case(), values.shape()) {
            (LocationCase::NonFixed, Shape::Col(_)) => {
                debug_assert!(
                    state.location.zone().is_none(),
                    "caching a concrete-zone state with a column matrix"
                );
                for (zone, value) in values.iter_scaled().enumerate() {
                    row.data[zone * stride + slot] = value;
                }
            }
            (_, Shape::Scalar) => {
                row.data[slot] = values.value(0, 0);
            }
            (case, shape) => panic!("cannot cache a {shape:?} matrix for a {case:?} key"),
        }
        if slot < day_length {
            row.todo[slot] = false;
        }
    }

    /// Writes a constant at the state's integral timestep (0 for end
    /// states) and clears the todo flag. Slots past the day end are
    /// ignored.
    pub fn cache_value(&mut self, state: &State, value: f64) {
        let slot = state.time_of_day.floor() as i64;
        if slot < 0 || slot > self.day_length as i64 {
            return;
        }
        let slot = slot as usize;
        let stride = self.stride();
        let width = self.width(&cache_key(state));
        let day_length = self.day_length;
        let row = self.ensure_row(cache_key(state));
        for zone in 0..width {
            row.data[zone * stride + slot] = value;
        }
        if slot < day_length {
            row.todo[slot] = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use mat::MatPool;

    use super::*;
    use crate::state_space::{Activity, Location, Vehicle};

    fn state(location: Location, time: f64) -> State {
        State {
            activity: Activity::Shop,
            location,
            time_of_day: time,
            duration: 1,
            vehicle: Vehicle::None,
            has_worked: false,
        }
    }

    #[test]
    fn monotone_cache_test() {
        let pool = BufferPool::new();
        let mats = MatPool::new(1);
        let mut cache = EvCache::new(&pool, 1, 10, f64::NEG_INFINITY);
        let s = state(Location::Residence(0), 3.5);
        assert!(cache.needs_caching(&s));
        let mut m = mats.acquire(Shape::Scalar);
        m.data_mut()[0] = -1.25;
        cache.cache(&s, &m);
        // Once cached, the flag stays down and the value stays put.
        assert!(!cache.needs_caching(&s));
        let key = cache_key(&s);
        assert_eq!(cache.row(&key)[3], -1.25);
        assert!(!cache.needs_caching(&s));
        assert_eq!(cache.row(&key)[3], -1.25);
    }

    #[test]
    fn default_row_test() {
        let pool = BufferPool::new();
        let mut cache = EvCache::new(&pool, 1, 4, f64::NEG_INFINITY);
        let s = state(Location::Residence(0), 0.0);
        let key = cache_key(&s);
        let row = cache.row(&key);
        assert_eq!(row.len(), 6);
        assert!(row.iter().all(|&v| v == f64::NEG_INFINITY));
    }

    #[test]
    fn non_fixed_rows_are_zone_major_test() {
        let pool = BufferPool::new();
        let mats = MatPool::new(3);
        let mut cache = EvCache::new(&pool, 3, 4, f64::NEG_INFINITY);
        let s = state(Location::NonFixed(None), 2.0);
        let mut col = mats.acquire(Shape::Col(3));
        col.data_mut().copy_from_slice(&[1.0, 2.0, 3.0]);
        cache.cache(&s, &col);
        let key = cache_key(&s);
        let stride = cache.stride();
        let row = cache.row(&key).to_vec();
        assert_eq!(row[2], 1.0);
        assert_eq!(row[stride + 2], 2.0);
        assert_eq!(row[2 * stride + 2], 3.0);
        // A concrete zone shares the key and therefore the row.
        let concrete = state(Location::NonFixed(Some(1)), 2.0);
        assert!(!cache.needs_caching(&concrete));
    }

    #[test]
    fn out_of_day_slots_test() {
        let pool = BufferPool::new();
        let mut cache = EvCache::new(&pool, 1, 4, f64::NEG_INFINITY);
        // The day-end slot is writable but never "todo".
        let s = state(Location::Residence(0), 4.0);
        assert!(!cache.needs_caching(&s));
        cache.cache_value(&s, 0.0);
        let key = cache_key(&s);
        assert_eq!(cache.row(&key)[4], 0.0);
        // The sentinel slot keeps the default.
        assert_eq!(cache.row(&key)[5], f64::NEG_INFINITY);
        // Slots beyond the row are ignored.
        let far = state(Location::Residence(0), 7.0);
        cache.cache_value(&far, 0.0);
        assert!(!cache.needs_caching(&far));
    }
}
