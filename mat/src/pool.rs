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

//! Object pools for the hot-path buffers.
//!
//! Each worker thread owns its pools; a pool must never be shared between
//! threads. Buffers return to their pool when the RAII guard is dropped, so
//! every rent is balanced by construction.
use object_pool::{Pool, Reusable};

use crate::{Mat, Shape};

/// Initial number of buffers kept per pool.
const POOL_CAPACITY: usize = 16;

/// A pool of reusable `Vec<f64>` buffers.
pub struct BufferPool {
    pool: Pool<Vec<f64>>,
}

impl BufferPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        BufferPool {
            pool: Pool::new(POOL_CAPACITY, Vec::new),
        }
    }

    /// Rents a buffer of length `len` with every value set to `fill`.
    pub fn acquire(&self, len: usize, fill: f64) -> Reusable<'_, Vec<f64>> {
        let mut buf = self.pool.pull(Vec::new);
        buf.clear();
        buf.resize(len, fill);
        buf
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A pool of [Mat] buffers, one inner pool per shape class so that buffers
/// of comparable size are reused together.
pub struct MatPool {
    nb_zones: usize,
    scalars: BufferPool,
    vectors: BufferPool,
    fulls: BufferPool,
}

impl MatPool {
    /// Creates a pool for a zone system of `nb_zones` zones.
    ///
    /// The zone count is advisory: [MatPool::acquire] accepts any shape, so
    /// a single pool serves both full and sampled worlds.
    pub fn new(nb_zones: usize) -> Self {
        MatPool {
            nb_zones,
            scalars: BufferPool::new(),
            vectors: BufferPool::new(),
            fulls: BufferPool::new(),
        }
    }

    /// Returns the zone count the pool was created for.
    pub fn nb_zones(&self) -> usize {
        self.nb_zones
    }

    /// Rents a zeroed [Mat] of the given shape with scale 1.
    pub fn acquire(&self, shape: Shape) -> Mat<'_> {
        let inner = match shape {
            Shape::Scalar => &self.scalars,
            Shape::Row(_) | Shape::Col(_) => &self.vectors,
            Shape::Full(_) => &self.fulls,
        };
        Mat::from_buffer(shape, inner.acquire(shape.len(), 0.0))
    }
}
