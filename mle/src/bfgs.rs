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

//! BFGS maximization driver.
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

use crate::line_search::{self, LineSearchFailure};
use crate::{hessian, Objective};

/// Options of the BFGS maximizer.
#[derive(Clone, Debug)]
pub struct BfgsOptions {
    /// Maximum number of outer iterations.
    pub max_iterations: usize,
    /// Convergence tolerance on the change of the objective value.
    pub value_tolerance: f64,
    /// Convergence tolerance on the L1 norm of the gradient.
    pub gradient_tolerance: f64,
    /// Cap on the worst-case coordinate move of the starting step.
    pub max_var_change: f64,
    /// If `true`, standard errors use a numerical Hessian instead of the
    /// BFGS estimate.
    pub numerical_hessian: bool,
}

impl Default for BfgsOptions {
    fn default() -> Self {
        BfgsOptions {
            max_iterations: 10_000,
            value_tolerance: 1e-10,
            gradient_tolerance: 1e-6,
            max_var_change: 1.0,
            numerical_hessian: false,
        }
    }
}

/// How the maximizer stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// Both convergence tolerances were met.
    WithinConvergenceTolerance,
    /// The outer iteration budget was exhausted.
    MaxIterationsReached,
    /// The search direction (or the gradient) was not finite.
    NumericalFailure,
    /// The line search gave up; the result holds the last finite point.
    LineSearchFailure(LineSearchFailure),
}

impl Termination {
    /// Returns `true` if the maximizer stopped on its convergence criterion.
    pub fn is_converged(self) -> bool {
        matches!(self, Termination::WithinConvergenceTolerance)
    }
}

/// Result of a maximization run.
#[derive(Clone, Debug)]
pub struct Maximum {
    /// Final point.
    pub x: DVector<f64>,
    /// Objective value at the final point.
    pub value: f64,
    /// Gradient at the final point.
    pub gradient: DVector<f64>,
    /// Sandwich standard errors `sqrt(diag(H B H))`.
    pub std_errors: DVector<f64>,
    /// Why the maximizer stopped.
    pub termination: Termination,
    /// Number of outer iterations.
    pub iterations: usize,
    /// Number of objective evaluations.
    pub evaluations: usize,
}

/// Maximizes the objective from `x0` with BFGS and a bracketing-sectioning
/// line search.
///
/// Whatever the termination reason, the result carries the last finite point
/// together with the sandwich standard errors computed there.
pub fn maximize(objective: &dyn Objective, x0: &DVector<f64>, options: &BfgsOptions) -> Maximum {
    let n = objective.dim();
    let mut x = x0.clone();
    let (mut value, mut gradient) = objective.value_grad(&x);
    let mut evaluations = 1;
    let mut iterations = 0;

    // The initial inverse Hessian is the inverse of the sum-of-score matrix
    // (an estimate of the information matrix); identity when singular.
    let mut inv_hessian = invert_if_possible(objective.score_matrix(&x))
        .unwrap_or_else(|| DMatrix::identity(n, n));

    let mut alpha_prev: f64 = 1.0;
    let mut termination = Termination::MaxIterationsReached;
    for k in 0..options.max_iterations {
        iterations = k + 1;
        let direction = &inv_hessian * &gradient;
        let direction_l1: f64 = direction.iter().map(|v| v.abs()).sum();
        if !direction_l1.is_finite() {
            termination = Termination::NumericalFailure;
            break;
        }
        if direction_l1 == 0.0 {
            termination = if gradient.iter().map(|v| v.abs()).sum::<f64>()
                < options.gradient_tolerance
            {
                Termination::WithinConvergenceTolerance
            } else {
                Termination::NumericalFailure
            };
            break;
        }
        let alpha0 = (alpha_prev * 10.0)
            .min(options.max_var_change / direction_l1)
            .min(1.0);
        let slope0 = gradient.dot(&direction);
        let outcome = line_search::search(
            |alpha| {
                let trial = &x + &direction * alpha;
                let (v, g) = objective.value_grad(&trial);
                let slope = g.dot(&direction);
                (v, g, slope)
            },
            value,
            slope0,
            alpha0,
        );
        evaluations += outcome.evaluations;
        match outcome.accepted {
            Ok(point) => {
                let x_new = &x + &direction * point.alpha;
                let s = &x_new - &x;
                // Gradient decrement: positive curvature for a concave
                // objective means `s . (g_old - g_new) > 0`.
                let y = &gradient - &point.gradient;
                let sy = s.dot(&y);
                if sy <= 0.0 {
                    warn!("Non-positive curvature ({sy:.3e}): resetting the inverse Hessian");
                    inv_hessian = DMatrix::identity(n, n);
                } else {
                    let rho = 1.0 / sy;
                    let left = DMatrix::identity(n, n) - (&s * y.transpose()) * rho;
                    inv_hessian = &left * &inv_hessian * left.transpose() + (&s * s.transpose()) * rho;
                }
                let converged = (point.value - value).abs() <= options.value_tolerance
                    && point.gradient.iter().map(|v| v.abs()).sum::<f64>()
                        < options.gradient_tolerance;
                debug!(
                    "BFGS iteration {}: value = {:.8e}, step = {:.3e}",
                    iterations, point.value, point.alpha
                );
                x = x_new;
                value = point.value;
                gradient = point.gradient;
                alpha_prev = point.alpha;
                if converged {
                    termination = Termination::WithinConvergenceTolerance;
                    break;
                }
            }
            Err(failure) => {
                warn!("Line search failed at iteration {iterations}: {failure}");
                if let Some(best) = outcome.best {
                    if best.value > value {
                        x += &direction * best.alpha;
                        value = best.value;
                        gradient = best.gradient;
                    }
                }
                termination = Termination::LineSearchFailure(failure);
                break;
            }
        }
    }

    let std_errors = standard_errors(objective, &x, &inv_hessian, options);
    Maximum {
        x,
        value,
        gradient,
        std_errors,
        termination,
        iterations,
        evaluations,
    }
}

/// Computes `sqrt(diag(H B H))` where `B` is the sum-of-score matrix and `H`
/// the inverse Hessian (numerical or BFGS-estimated, per option).
fn standard_errors(
    objective: &dyn Objective,
    x: &DVector<f64>,
    bfgs_inv_hessian: &DMatrix<f64>,
    options: &BfgsOptions,
) -> DVector<f64> {
    let b = objective.score_matrix(x);
    let h = if options.numerical_hessian {
        // The objective is maximized, so the information matrix estimate is
        // the negated Hessian.
        invert_if_possible(-hessian::numerical_hessian(objective, x)).unwrap_or_else(|| {
            warn!("Numerical Hessian is singular: falling back to the BFGS estimate");
            bfgs_inv_hessian.clone()
        })
    } else {
        bfgs_inv_hessian.clone()
    };
    let cov = &h * b * &h;
    DVector::from_iterator(x.len(), (0..x.len()).map(|i| cov[(i, i)].max(0.0).sqrt()))
}

fn invert_if_possible(m: DMatrix<f64>) -> Option<DMatrix<f64>> {
    if m.iter().any(|v| !v.is_finite()) {
        return None;
    }
    m.try_inverse()
        .filter(|inv| inv.iter().all(|v| v.is_finite()))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Strictly concave quadratic `f(x) = -0.5 (x - t)' A (x - t)`.
    struct ConcaveQuadratic {
        a: DMatrix<f64>,
        target: DVector<f64>,
    }

    impl Objective for ConcaveQuadratic {
        fn dim(&self) -> usize {
            self.target.len()
        }

        fn value(&self, x: &DVector<f64>) -> f64 {
            let d = x - &self.target;
            -0.5 * d.dot(&(&self.a * &d))
        }

        fn value_grad(&self, x: &DVector<f64>) -> (f64, DVector<f64>) {
            let d = x - &self.target;
            (-0.5 * d.dot(&(&self.a * &d)), -(&self.a * &d))
        }

        fn score_matrix(&self, _x: &DVector<f64>) -> DMatrix<f64> {
            self.a.clone()
        }
    }

    fn quadratic() -> ConcaveQuadratic {
        let a = DMatrix::from_row_slice(
            4,
            4,
            &[
                4.0, 1.0, 0.0, 0.0, //
                1.0, 3.0, 0.5, 0.0, //
                0.0, 0.5, 2.0, 0.2, //
                0.0, 0.0, 0.2, 1.0,
            ],
        );
        let target = DVector::from_row_slice(&[1.0, -2.0, 0.5, 3.0]);
        ConcaveQuadratic { a, target }
    }

    #[test]
    fn converges_on_concave_quadratic_test() {
        let objective = quadratic();
        let x0 = DVector::from_row_slice(&[0.0, 0.0, 0.0, 0.0]);
        let options = BfgsOptions {
            max_var_change: 10.0,
            ..Default::default()
        };
        let maximum = maximize(&objective, &x0, &options);
        assert_eq!(maximum.termination, Termination::WithinConvergenceTolerance);
        // A quadratic must converge within twice the dimension.
        assert!(maximum.iterations <= 2 * objective.dim());
        for i in 0..4 {
            assert!((maximum.x[i] - objective.target[i]).abs() < 1e-6);
        }
        assert!(maximum.value.abs() < 1e-10);
    }

    #[test]
    fn standard_errors_from_score_test() {
        // At the maximum of the quadratic, H ~ A^-1 and B = A, so the
        // sandwich collapses to A^-1 and the standard errors are the square
        // roots of its diagonal.
        let objective = quadratic();
        let x0 = objective.target.clone();
        let maximum = maximize(&objective, &x0, &BfgsOptions::default());
        let expected = objective.a.clone().try_inverse().unwrap();
        for i in 0..4 {
            assert!((maximum.std_errors[i] - expected[(i, i)].sqrt()).abs() < 1e-6);
        }
    }

    #[test]
    fn numerical_failure_on_nan_gradient_test() {
        struct NanGradient;
        impl Objective for NanGradient {
            fn dim(&self) -> usize {
                2
            }
            fn value(&self, _x: &DVector<f64>) -> f64 {
                0.0
            }
            fn value_grad(&self, _x: &DVector<f64>) -> (f64, DVector<f64>) {
                (0.0, DVector::from_row_slice(&[f64::NAN, 1.0]))
            }
            fn score_matrix(&self, _x: &DVector<f64>) -> DMatrix<f64> {
                DMatrix::identity(2, 2)
            }
        }
        let maximum = maximize(&NanGradient, &DVector::zeros(2), &BfgsOptions::default());
        assert_eq!(maximum.termination, Termination::NumericalFailure);
    }
}
