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

//! The time-interpolation kernels, the hot path of the value function.
//!
//! Each cell of a utility matrix looks up an expected-value row at a
//! per-cell (or uniform) continuous time and adds the linear interpolation
//! between the two surrounding integral timesteps. The destination offset
//! selects the zone stretch of the row. When the upper interpolation weight
//! is exactly zero the upper anchor must not be read: `0 * -inf` would
//! poison the cell with a NaN.
//!
//! The kernels run a four-wide main loop with a scalar tail so that the
//! compiler can vectorize them.

/// How each cell of a matrix maps to the zone stretches of an
/// expected-value row.
#[derive(Clone, Copy, Debug)]
pub enum DestOffsets<'a> {
    /// Fixed-zone rows have a single stretch at offset zero.
    Zeros,
    /// Every cell reads the same stretch (one concrete non-fixed zone); the
    /// value is the element offset `zone * stride`.
    Single(usize),
    /// Cell `i` reads the stretch at `offsets[i]`; for both column and full
    /// matrices this is `(i % nb_zones) * stride`.
    All(&'a [usize]),
}

/// Per-worker cache of the all-destinations offset array, rebuilt when the
/// zone count changes.
#[derive(Debug, Default)]
pub struct OffsetCache {
    nb_zones: usize,
    stride: usize,
    all: Vec<usize>,
}

impl OffsetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The all-destinations offsets for matrices over `nb_zones` zones with
    /// the given row stride, valid for cell counts up to `nb_zones^2`.
    pub fn all_dests(&mut self, nb_zones: usize, stride: usize, cells: usize) -> &[usize] {
        if self.nb_zones != nb_zones || self.stride != stride {
            self.nb_zones = nb_zones;
            self.stride = stride;
            self.all.clear();
            self.all
                .extend((0..nb_zones * nb_zones).map(|i| (i % nb_zones) * stride));
        }
        debug_assert!(cells <= self.all.len());
        &self.all[..cells]
    }
}

/// Interpolated read of one cell.
#[inline(always)]
fn interpolate(ev: &[f64], offset: usize, t: f64, day_length: f64) -> f64 {
    let t = t.min(day_length);
    let floor = t.floor();
    let idx = offset + floor as usize;
    let a = t - floor;
    if a == 0.0 {
        ev[idx]
    } else {
        (1.0 - a) * ev[idx] + a * ev[idx + 1]
    }
}

macro_rules! interp_loop {
    ($u:expr, $times:expr, $ev:expr, $dl:expr, $off:expr) => {{
        let n = $u.len();
        let main = n - n % 4;
        let mut i = 0;
        while i < main {
            $u[i] += interpolate($ev, $off(i), $times[i], $dl);
            $u[i + 1] += interpolate($ev, $off(i + 1), $times[i + 1], $dl);
            $u[i + 2] += interpolate($ev, $off(i + 2), $times[i + 2], $dl);
            $u[i + 3] += interpolate($ev, $off(i + 3), $times[i + 3], $dl);
            i += 4;
        }
        while i < n {
            $u[i] += interpolate($ev, $off(i), $times[i], $dl);
            i += 1;
        }
    }};
}

/// Adds the interpolated expected value at per-cell times to the utility
/// cells.
pub fn add_ev_interpolated(
    u: &mut [f64],
    ev: &[f64],
    times: &[f64],
    offsets: DestOffsets,
    day_length: usize,
) {
    debug_assert_eq!(u.len(), times.len());
    let dl = day_length as f64;
    match offsets {
        DestOffsets::Zeros => interp_loop!(u, times, ev, dl, |_i: usize| 0),
        DestOffsets::Single(offset) => interp_loop!(u, times, ev, dl, |_i: usize| offset),
        DestOffsets::All(offsets) => {
            debug_assert_eq!(offsets.len(), u.len());
            interp_loop!(u, times, ev, dl, |i: usize| offsets[i])
        }
    }
}

/// Adds the interpolated expected value at one uniform time to the utility
/// cells.
pub fn add_ev_uniform(u: &mut [f64], ev: &[f64], t: f64, offsets: DestOffsets, day_length: usize) {
    let dl = day_length as f64;
    match offsets {
        DestOffsets::Zeros => {
            let v = interpolate(ev, 0, t, dl);
            for cell in u.iter_mut() {
                *cell += v;
            }
        }
        DestOffsets::Single(offset) => {
            let v = interpolate(ev, offset, t, dl);
            for cell in u.iter_mut() {
                *cell += v;
            }
        }
        DestOffsets::All(offsets) => {
            debug_assert_eq!(offsets.len(), u.len());
            for (cell, &offset) in u.iter_mut().zip(offsets.iter()) {
                *cell += interpolate(ev, offset, t, dl);
            }
        }
    }
}

/// Derivative counterpart of [add_ev_interpolated]: interpolates the
/// derivative row and adds the time-shift term, the slope of the
/// expected-value row times the per-cell arrival-time sensitivity `dtau`.
///
/// Cells whose expected-value slope is not finite (a `-inf` anchor) or that
/// are clamped at the day end contribute no shift term: their choice weight
/// is zero anyway and the product must stay NaN-free.
pub fn add_ev_derivative(
    out: &mut [f64],
    ev: &[f64],
    dev: &[f64],
    times: &[f64],
    dtau: &[f64],
    offsets: DestOffsets,
    day_length: usize,
) {
    debug_assert_eq!(out.len(), times.len());
    debug_assert_eq!(out.len(), dtau.len());
    let dl = day_length as f64;
    let one = |out: &mut f64, t: f64, dtau: f64, offset: usize| {
        *out += interpolate(dev, offset, t, dl);
        if t < dl {
            let idx = offset + t.floor() as usize;
            let slope = ev[idx + 1] - ev[idx];
            if slope.is_finite() {
                *out += dtau * slope;
            }
        }
    };
    match offsets {
        DestOffsets::Zeros => {
            for ((out, &t), &dt) in out.iter_mut().zip(times.iter()).zip(dtau.iter()) {
                one(out, t, dt, 0);
            }
        }
        DestOffsets::Single(offset) => {
            for ((out, &t), &dt) in out.iter_mut().zip(times.iter()).zip(dtau.iter()) {
                one(out, t, dt, offset);
            }
        }
        DestOffsets::All(offsets) => {
            debug_assert_eq!(offsets.len(), out.len());
            for (((out, &t), &dt), &offset) in out
                .iter_mut()
                .zip(times.iter())
                .zip(dtau.iter())
                .zip(offsets.iter())
            {
                one(out, t, dt, offset);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Straightforward scalar reference of the kernel contract.
    fn reference(ev: &[f64], offset: usize, t: f64, day_length: usize) -> f64 {
        let t = t.min(day_length as f64);
        let idx = offset + t.floor() as usize;
        let a = t - t.floor();
        let b = 1.0 - a;
        b * ev[idx] + if a == 0.0 { 0.0 } else { a * ev[idx + 1] }
    }

    #[test]
    fn kernel_matches_reference_test() {
        let day_length = 6;
        let stride = day_length + 2;
        // Two zone stretches with sentinels.
        let mut ev = vec![0.0; 2 * stride];
        for (i, v) in ev.iter_mut().enumerate() {
            *v = (i as f64).sin();
        }
        ev[day_length + 1] = f64::NEG_INFINITY;
        ev[stride + day_length + 1] = f64::NEG_INFINITY;
        let times: Vec<f64> = (0..10).map(|i| 0.7 * i as f64).collect();
        let offsets: Vec<usize> = (0..10).map(|i| (i % 2) * stride).collect();
        let mut u = vec![1.0; 10];
        add_ev_interpolated(&mut u, &ev, &times, DestOffsets::All(&offsets), day_length);
        for i in 0..10 {
            let expected = 1.0 + reference(&ev, offsets[i], times[i], day_length);
            assert!(
                (u[i] - expected).abs() < 1e-12 || u[i] == expected,
                "cell {i}: {} vs {expected}",
                u[i]
            );
        }
    }

    #[test]
    fn zero_upper_weight_skips_sentinel_test() {
        let day_length = 4;
        let mut ev = vec![2.0; day_length + 2];
        ev[day_length] = 0.0;
        ev[day_length + 1] = f64::NEG_INFINITY;
        // Reading exactly at the day end must not touch the sentinel.
        let mut u = vec![0.0];
        add_ev_interpolated(&mut u, &ev, &[4.0], DestOffsets::Zeros, day_length);
        assert_eq!(u[0], 0.0);
        // Reading past the day end clamps to it.
        let mut u = vec![0.0];
        add_ev_interpolated(&mut u, &ev, &[7.3], DestOffsets::Zeros, day_length);
        assert_eq!(u[0], 0.0);
    }

    #[test]
    fn uniform_matches_per_cell_test() {
        let day_length = 5;
        let stride = day_length + 2;
        let ev: Vec<f64> = (0..3 * stride).map(|i| (i as f64) * 0.25).collect();
        let offsets: Vec<usize> = (0..3).map(|i| i * stride).collect();
        let t = 2.5;
        let mut a = vec![0.0; 3];
        add_ev_uniform(&mut a, &ev, t, DestOffsets::All(&offsets), day_length);
        let mut b = vec![0.0; 3];
        add_ev_interpolated(&mut b, &ev, &[t; 3], DestOffsets::All(&offsets), day_length);
        assert_eq!(a, b);
    }

    #[test]
    fn offset_cache_test() {
        let mut cache = OffsetCache::new();
        let offsets = cache.all_dests(3, 8, 9);
        assert_eq!(offsets, &[0, 8, 16, 0, 8, 16, 0, 8, 16]);
        // A column over the same zones uses the prefix.
        let offsets = cache.all_dests(3, 8, 3);
        assert_eq!(offsets, &[0, 8, 16]);
    }

    #[test]
    fn derivative_kernel_test() {
        let day_length = 6;
        let stride = day_length + 2;
        // Linear expected value with slope 2, derivative row constant 3.
        let ev: Vec<f64> = (0..stride).map(|i| 2.0 * i as f64).collect();
        let dev = vec![3.0; stride];
        let mut out = vec![0.0];
        add_ev_derivative(
            &mut out,
            &ev,
            &dev,
            &[2.5],
            &[1.5],
            DestOffsets::Zeros,
            day_length,
        );
        // 3 (interpolated derivative) + 1.5 * 2 (shift term).
        assert!((out[0] - 6.0).abs() < 1e-12);
    }
}
