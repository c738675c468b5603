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

//! Maximum-likelihood machinery: a BFGS maximizer with a
//! bracketing-sectioning line search, a numerical Hessian and sandwich
//! standard errors.
#![doc(html_no_source)]

mod bfgs;
mod hessian;
mod line_search;

pub use bfgs::{maximize, BfgsOptions, Maximum, Termination};
pub use hessian::numerical_hessian;
pub use line_search::{LineSearchFailure, LineSearchPoint};

use nalgebra::{DMatrix, DVector};

/// A twice-evaluable log-likelihood-like function to maximize.
pub trait Objective: Sync {
    /// Number of free parameters.
    fn dim(&self) -> usize;

    /// Value at `x`; may be non-finite for infeasible points.
    fn value(&self, x: &DVector<f64>) -> f64;

    /// Value and gradient at `x`.
    fn value_grad(&self, x: &DVector<f64>) -> (f64, DVector<f64>);

    /// Sum-of-score outer-product matrix at `x`, used to initialize the
    /// inverse Hessian and for robust standard errors.
    fn score_matrix(&self, x: &DVector<f64>) -> DMatrix<f64>;
}
