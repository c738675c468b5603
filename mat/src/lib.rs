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

//! Broadcast-shaped matrices over a zone system.
//!
//! A [Mat] represents the logical value `scale * data`, where `data` is laid
//! out according to a [Shape]: a scalar, a row vector keyed by destination
//! zone, a column vector keyed by origin zone, or a full origin-destination
//! matrix in row-major order.
//!
//! Folding a part into an accumulator with [Mat::add] broadcasts the part up
//! to the accumulator shape (a scalar to anything, a row to each row of a
//! full matrix, a column to each column) or reduces it down (a row, column or
//! full matrix summed into a scalar, a full matrix row-summed into a column).
//! The reduction direction exists because the cells collapsed along an axis
//! represent distinct alternatives of a compressed decision, whose
//! exponentiated utilities must be summed.
//!
//! Folding a row vector into a column accumulator (or the converse) is a
//! programmer error and panics.
#![doc(html_no_source)]

mod pool;

pub use pool::{BufferPool, MatPool};

use object_pool::Reusable;

/// The layout of a [Mat] over a zone system with `n` zones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shape {
    /// A single value.
    Scalar,
    /// `1 x n`, keyed by destination zone.
    Row(usize),
    /// `n x 1`, keyed by origin zone.
    Col(usize),
    /// `n x n`, row-major (origin-major).
    Full(usize),
}

impl Shape {
    /// Returns the number of stored values.
    pub fn len(self) -> usize {
        match self {
            Shape::Scalar => 1,
            Shape::Row(n) | Shape::Col(n) => n,
            Shape::Full(n) => n * n,
        }
    }

    /// Returns `true` if the shape stores no value (never the case).
    pub fn is_empty(self) -> bool {
        false
    }

    /// Returns the number of zones of the shape, if any.
    pub fn num_zones(self) -> Option<usize> {
        match self {
            Shape::Scalar => None,
            Shape::Row(n) | Shape::Col(n) | Shape::Full(n) => Some(n),
        }
    }
}

/// A broadcast-shaped array with a scalar multiplier, backed by a pooled
/// buffer.
///
/// The buffer returns to its [MatPool] when the `Mat` is dropped.
pub struct Mat<'p> {
    scale: f64,
    shape: Shape,
    data: Reusable<'p, Vec<f64>>,
}

impl<'p> Mat<'p> {
    pub(crate) fn from_buffer(shape: Shape, data: Reusable<'p, Vec<f64>>) -> Self {
        debug_assert_eq!(data.len(), shape.len());
        Mat {
            scale: 1.0,
            shape,
            data,
        }
    }

    /// Returns the shape of the matrix.
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Returns the scalar multiplier.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Returns the raw stored values (not multiplied by the scale).
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Returns the raw stored values mutably.
    ///
    /// The scale still applies to the stored values; use [Mat::materialize]
    /// first when raw slice access must see the logical values.
    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Multiplies the logical value by `k`.
    ///
    /// The multiplication is deferred to the scale; the stored values are
    /// untouched until [Mat::materialize] folds it in.
    pub fn scale_inplace(&mut self, k: f64) {
        self.scale *= k;
    }

    /// Folds the scale into the stored values, leaving `scale == 1`.
    pub fn materialize(&mut self) {
        if self.scale != 1.0 {
            let s = self.scale;
            for v in self.data.iter_mut() {
                *v *= s;
            }
            self.scale = 1.0;
        }
    }

    /// Overwrites every value with `v` and resets the scale.
    pub fn fill(&mut self, v: f64) {
        self.scale = 1.0;
        self.data.fill(v);
    }

    /// Adds the constant `c` to the logical value of every cell.
    pub fn add_constant(&mut self, c: f64) {
        self.materialize();
        for v in self.data.iter_mut() {
            *v += c;
        }
    }

    /// Folds `part` into the accumulator, broadcasting or reducing as
    /// described in the crate documentation.
    ///
    /// The accumulator must be unscaled (acquire from a pool and fold parts
    /// into it before applying any scale).
    ///
    /// **Panics** on incompatible shapes (row into column or column into
    /// row, or mismatched zone counts): this is a programmer error.
    pub fn add(&mut self, part: &Mat) {
        assert!(
            self.scale == 1.0,
            "cannot fold into a scaled accumulator (scale = {})",
            self.scale
        );
        let s = part.scale;
        match (self.shape, part.shape) {
            // Same shape: element-wise.
            (a, b) if a == b => {
                for (acc, &v) in self.data.iter_mut().zip(part.data.iter()) {
                    *acc += s * v;
                }
            }
            // Scalar part broadcasts to anything.
            (_, Shape::Scalar) => {
                let v = s * part.data[0];
                for acc in self.data.iter_mut() {
                    *acc += v;
                }
            }
            // Row part adds to each row of a full accumulator.
            (Shape::Full(n), Shape::Row(m)) => {
                check_zones(n, m);
                for row in self.data.chunks_exact_mut(n) {
                    for (acc, &v) in row.iter_mut().zip(part.data.iter()) {
                        *acc += s * v;
                    }
                }
            }
            // Column part adds to each column of a full accumulator.
            (Shape::Full(n), Shape::Col(m)) => {
                check_zones(n, m);
                for (row, &v) in self.data.chunks_exact_mut(n).zip(part.data.iter()) {
                    let v = s * v;
                    for acc in row.iter_mut() {
                        *acc += v;
                    }
                }
            }
            // Full part row-sums into a column accumulator: the destinations
            // of each origin row are distinct compressed alternatives.
            (Shape::Col(n), Shape::Full(m)) => {
                check_zones(n, m);
                for (acc, row) in self.data.iter_mut().zip(part.data.chunks_exact(m)) {
                    let sum: f64 = row.iter().sum();
                    *acc += s * sum;
                }
            }
            // Everything sums into a scalar accumulator.
            (Shape::Scalar, Shape::Row(_) | Shape::Col(_) | Shape::Full(_)) => {
                let sum: f64 = part.data.iter().sum();
                self.data[0] += s * sum;
            }
            (a, b) => panic!("shape mismatch: cannot fold {b:?} into {a:?}"),
        }
    }

    /// Replaces every logical value by its natural logarithm.
    pub fn log_inplace(&mut self) {
        self.materialize();
        for v in self.data.iter_mut() {
            *v = v.ln();
        }
    }

    /// Replaces every logical value by its exponential.
    pub fn exp_inplace(&mut self) {
        self.materialize();
        for v in self.data.iter_mut() {
            *v = v.exp();
        }
    }

    /// Multiplies element-wise by `other`, which must have the same shape.
    pub fn mul_inplace(&mut self, other: &Mat) {
        assert!(
            self.shape == other.shape,
            "shape mismatch: cannot multiply {:?} by {:?}",
            self.shape,
            other.shape
        );
        self.scale *= other.scale;
        for (a, &b) in self.data.iter_mut().zip(other.data.iter()) {
            *a *= b;
        }
    }

    /// Divides element-wise by `den` (same shape) wherever the denominator
    /// is positive; other cells are left unchanged.
    pub fn div_ignore_zero(&mut self, den: &Mat) {
        assert!(
            self.shape == den.shape,
            "shape mismatch: cannot divide {:?} by {:?}",
            self.shape,
            den.shape
        );
        self.materialize();
        for (a, &b) in self.data.iter_mut().zip(den.data.iter()) {
            let b = den.scale * b;
            if b > 0.0 {
                *a /= b;
            }
        }
    }

    /// Divides each row of a full matrix by the matching entry of a column
    /// vector wherever that entry is positive; rows with a non-positive
    /// denominator are left unchanged.
    pub fn divide_rows_ignore_zero(&mut self, den: &Mat) {
        let n = match (self.shape, den.shape) {
            (Shape::Full(n), Shape::Col(m)) => {
                check_zones(n, m);
                n
            }
            (a, b) => panic!("shape mismatch: cannot divide rows of {a:?} by {b:?}"),
        };
        self.materialize();
        for (row, &d) in self.data.chunks_exact_mut(n).zip(den.data.iter()) {
            let d = den.scale * d;
            if d > 0.0 {
                for v in row.iter_mut() {
                    *v /= d;
                }
            }
        }
    }

    /// Returns the logical value of the cell at `(origin, dest)`.
    ///
    /// Broadcast shapes ignore the irrelevant index.
    pub fn value(&self, origin: usize, dest: usize) -> f64 {
        let idx = match self.shape {
            Shape::Scalar => 0,
            Shape::Row(_) => dest,
            Shape::Col(_) => origin,
            Shape::Full(n) => origin * n + dest,
        };
        self.scale * self.data[idx]
    }

    /// Returns the sum of all logical values.
    pub fn sum(&self) -> f64 {
        let sum: f64 = self.data.iter().sum();
        self.scale * sum
    }

    /// Iterates over the logical values in storage order.
    pub fn iter_scaled(&self) -> impl Iterator<Item = f64> + '_ {
        let s = self.scale;
        self.data.iter().map(move |&v| s * v)
    }
}

impl std::fmt::Debug for Mat<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mat")
            .field("scale", &self.scale)
            .field("shape", &self.shape)
            .field("data", &self.data.as_slice())
            .finish()
    }
}

fn check_zones(n: usize, m: usize) {
    assert!(n == m, "shape mismatch: {n} zones vs {m} zones");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled<'p>(pool: &'p MatPool, shape: Shape, values: &[f64]) -> Mat<'p> {
        let mut m = pool.acquire(shape);
        m.data_mut().copy_from_slice(values);
        m
    }

    #[test]
    fn add_broadcast_up_test() {
        let pool = MatPool::new(2);
        // Scalar into everything.
        let mut scalar = pool.acquire(Shape::Scalar);
        let mut two = filled(&pool, Shape::Scalar, &[2.0]);
        two.scale_inplace(3.0);
        scalar.add(&two);
        assert_eq!(scalar.data(), &[6.0]);

        let mut full = filled(&pool, Shape::Full(2), &[1., 2., 3., 4.]);
        full.add(&two);
        assert_eq!(full.data(), &[7., 8., 9., 10.]);

        // Row into each row of a full matrix.
        let row = filled(&pool, Shape::Row(2), &[10., 20.]);
        let mut full = filled(&pool, Shape::Full(2), &[1., 2., 3., 4.]);
        full.add(&row);
        assert_eq!(full.data(), &[11., 22., 13., 24.]);

        // Column into each column of a full matrix.
        let col = filled(&pool, Shape::Col(2), &[10., 20.]);
        let mut full = filled(&pool, Shape::Full(2), &[1., 2., 3., 4.]);
        full.add(&col);
        assert_eq!(full.data(), &[11., 12., 23., 24.]);
    }

    #[test]
    fn add_reduce_down_test() {
        let pool = MatPool::new(2);
        // Full row-sums into a column.
        let mut full = filled(&pool, Shape::Full(2), &[1., 2., 3., 4.]);
        full.scale_inplace(2.0);
        let mut col = pool.acquire(Shape::Col(2));
        col.add(&full);
        assert_eq!(col.data(), &[6.0, 14.0]);

        // Row and full sum into a scalar.
        let row = filled(&pool, Shape::Row(2), &[1., 5.]);
        let mut scalar = pool.acquire(Shape::Scalar);
        scalar.add(&row);
        scalar.add(&full);
        assert_eq!(scalar.data(), &[26.0]);
    }

    #[test]
    #[should_panic(expected = "shape mismatch")]
    fn add_row_into_col_panics_test() {
        let pool = MatPool::new(2);
        let row = filled(&pool, Shape::Row(2), &[1., 2.]);
        let mut col = pool.acquire(Shape::Col(2));
        col.add(&row);
    }

    #[test]
    #[should_panic(expected = "shape mismatch")]
    fn add_zone_count_mismatch_panics_test() {
        let pool = MatPool::new(3);
        let row = filled(&pool, Shape::Row(3), &[1., 2., 3.]);
        let mut full = pool.acquire(Shape::Full(2));
        full.add(&row);
    }

    #[test]
    fn exp_log_materialize_test() {
        let pool = MatPool::new(2);
        let mut m = filled(&pool, Shape::Row(2), &[0.0, 1.0]);
        m.scale_inplace(2.0);
        m.exp_inplace();
        assert_eq!(m.scale(), 1.0);
        assert!((m.data()[0] - 1.0).abs() < 1e-12);
        assert!((m.data()[1] - 2.0f64.exp()).abs() < 1e-12);
        m.log_inplace();
        assert!((m.data()[0]).abs() < 1e-12);
        assert!((m.data()[1] - 2.0).abs() < 1e-12);
        // log of a zero sum yields minus infinity.
        let mut z = pool.acquire(Shape::Scalar);
        z.log_inplace();
        assert_eq!(z.data()[0], f64::NEG_INFINITY);
    }

    #[test]
    fn divide_rows_ignore_zero_test() {
        let pool = MatPool::new(2);
        let mut full = filled(&pool, Shape::Full(2), &[2., 4., 6., 8.]);
        let den = filled(&pool, Shape::Col(2), &[2.0, 0.0]);
        full.divide_rows_ignore_zero(&den);
        assert_eq!(full.data(), &[1., 2., 6., 8.]);
    }

    #[test]
    fn value_accessor_test() {
        let pool = MatPool::new(2);
        let mut full = filled(&pool, Shape::Full(2), &[1., 2., 3., 4.]);
        full.scale_inplace(10.0);
        assert_eq!(full.value(1, 0), 30.0);
        let row = filled(&pool, Shape::Row(2), &[1., 2.]);
        assert_eq!(row.value(1, 1), 2.0);
        let col = filled(&pool, Shape::Col(2), &[1., 2.]);
        assert_eq!(col.value(1, 0), 2.0);
    }

    #[test]
    fn pool_returns_zeroed_buffers_test() {
        let pool = MatPool::new(2);
        {
            let mut m = pool.acquire(Shape::Full(2));
            m.fill(42.0);
        }
        // The buffer is reused but must come back zeroed.
        let m = pool.acquire(Shape::Full(2));
        assert!(m.data().iter().all(|&v| v == 0.0));
        assert_eq!(m.scale(), 1.0);
    }
}
