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

//! Numerical Hessian by central differences of the gradient.
use nalgebra::{DMatrix, DVector};

use crate::Objective;

/// Perturbation of the central differences.
const EPSILON: f64 = 1e-8;

/// Returns the Hessian of the objective at `x`, column by column from
/// central differences of the gradient, symmetrized.
pub fn numerical_hessian(objective: &dyn Objective, x: &DVector<f64>) -> DMatrix<f64> {
    let n = objective.dim();
    let mut hessian = DMatrix::zeros(n, n);
    let mut point = x.clone();
    for j in 0..n {
        point[j] = x[j] + EPSILON;
        let (_, forward) = objective.value_grad(&point);
        point[j] = x[j] - EPSILON;
        let (_, backward) = objective.value_grad(&point);
        point[j] = x[j];
        let column = (forward - backward) / (2.0 * EPSILON);
        hessian.column_mut(j).copy_from(&column);
    }
    // Central differences are not exactly symmetric.
    let transposed = hessian.transpose();
    (hessian + transposed) * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quadratic {
        a: DMatrix<f64>,
    }

    impl Objective for Quadratic {
        fn dim(&self) -> usize {
            self.a.nrows()
        }
        fn value(&self, x: &DVector<f64>) -> f64 {
            -0.5 * x.dot(&(&self.a * x))
        }
        fn value_grad(&self, x: &DVector<f64>) -> (f64, DVector<f64>) {
            (self.value(x), -(&self.a * x))
        }
        fn score_matrix(&self, _x: &DVector<f64>) -> DMatrix<f64> {
            self.a.clone()
        }
    }

    #[test]
    fn matches_analytic_hessian_test() {
        let a = DMatrix::from_row_slice(2, 2, &[3.0, 1.0, 1.0, 2.0]);
        let objective = Quadratic { a: a.clone() };
        let x = DVector::from_row_slice(&[0.3, -0.7]);
        let hessian = numerical_hessian(&objective, &x);
        for i in 0..2 {
            for j in 0..2 {
                assert!((hessian[(i, j)] + a[(i, j)]).abs() < 1e-5);
            }
        }
    }
}
