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

//! Bracketing-sectioning line search for maximization.
//!
//! The search maintains a bracket `(low, high)` along the ascent direction.
//! The inner candidate is the stationary point of the cubic Hermite
//! interpolant of `(f, f')` at the two endpoints, restricted to the middle
//! 60% of the bracket. A candidate is accepted on a Wolfe-like curvature
//! condition; a candidate that is lower-valued than the low endpoint (or has
//! a negative directional derivative) narrows the bracket, otherwise it
//! becomes the new low endpoint and the bracket widens when the high
//! endpoint still has a positive derivative.
use nalgebra::DVector;

/// Maximum number of bracketing iterations.
const MAX_ITERATIONS: usize = 200;
/// Maximum number of halvings when looking for an initial finite step.
const MAX_HALVINGS: usize = 20;
/// Curvature factor of the acceptance condition.
const CURVATURE: f64 = 0.95;
/// A candidate with `|bracket width * slope|` below this is accepted as flat.
const FLAT_TOLERANCE: f64 = 1e-16;
/// Widening factor of the high endpoint.
const WIDEN: f64 = 10.0;
/// Upper bound on the step size.
const MAX_STEP: f64 = 1e10;
/// Candidates are restricted to `[low + SECTION*w, high - SECTION*w]`.
const SECTION: f64 = 0.2;

/// An evaluated point along the search direction.
#[derive(Clone, Debug)]
pub struct LineSearchPoint {
    /// Step size.
    pub alpha: f64,
    /// Objective value at the point.
    pub value: f64,
    /// Full gradient at the point.
    pub gradient: DVector<f64>,
    /// Directional derivative at the point.
    pub slope: f64,
}

/// Why the line search gave up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineSearchFailure {
    /// The bracketing loop did not accept a point within the iteration
    /// budget.
    MaxIterationsReached,
    /// No finite objective value was found along the direction.
    FiniteStepNotFound,
}

impl std::fmt::Display for LineSearchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaxIterationsReached => write!(f, "line search reached its iteration budget"),
            Self::FiniteStepNotFound => write!(f, "no finite step found along the direction"),
        }
    }
}

/// Result of a line search: the accepted point or the failure, plus the best
/// finite point seen (used to report standard errors from the last finite
/// point on failure).
pub(crate) struct SearchOutcome {
    pub accepted: Result<LineSearchPoint, LineSearchFailure>,
    pub best: Option<LineSearchPoint>,
    pub evaluations: usize,
}

/// Runs the line search.
///
/// `eval` maps a step size to `(value, gradient, slope)` at `x + alpha * d`;
/// `value0` and `slope0` are the objective value and directional derivative
/// at `alpha = 0`; `alpha0` is the initial step.
pub(crate) fn search<E>(mut eval: E, value0: f64, slope0: f64, alpha0: f64) -> SearchOutcome
where
    E: FnMut(f64) -> (f64, DVector<f64>, f64),
{
    let mut evaluations = 0;
    let mut best: Option<LineSearchPoint> = None;

    let mut record = |point: &LineSearchPoint, best: &mut Option<LineSearchPoint>| {
        if point.value.is_finite() && best.as_ref().map_or(true, |b| point.value > b.value) {
            *best = Some(point.clone());
        }
    };

    // Find an initial feasible (finite-valued) step by halving.
    let mut alpha = alpha0;
    let mut high = loop {
        let (value, gradient, slope) = eval(alpha);
        evaluations += 1;
        if value.is_finite() {
            break LineSearchPoint {
                alpha,
                value,
                gradient,
                slope,
            };
        }
        if evaluations > MAX_HALVINGS {
            return SearchOutcome {
                accepted: Err(LineSearchFailure::FiniteStepNotFound),
                best,
                evaluations,
            };
        }
        alpha *= 0.5;
    };
    record(&high, &mut best);

    let mut low = LineSearchPoint {
        alpha: 0.0,
        value: value0,
        gradient: DVector::zeros(0),
        slope: slope0,
    };
    let mut can_widen = true;

    // The feasible point is the first candidate; afterwards candidates come
    // from the cubic interpolant of the bracket.
    let mut candidate = high.clone();
    for _ in 0..MAX_ITERATIONS {
        let width = high.alpha - low.alpha;
        if candidate.slope.abs() <= CURVATURE * slope0.abs()
            || (width * candidate.slope).abs() < FLAT_TOLERANCE
        {
            return SearchOutcome {
                accepted: Ok(candidate),
                best,
                evaluations,
            };
        }
        if candidate.value < low.value || candidate.slope < 0.0 {
            // The maximum is between the low endpoint and the candidate.
            if candidate.alpha < high.alpha {
                high = candidate.clone();
            }
        } else {
            // The candidate improves on the low endpoint and still climbs.
            if candidate.alpha > low.alpha {
                low = candidate.clone();
            }
            if high.slope > 0.0 && can_widen {
                let wide = (high.alpha * WIDEN).min(MAX_STEP);
                let (value, gradient, slope) = eval(wide);
                evaluations += 1;
                if value.is_finite() {
                    high = LineSearchPoint {
                        alpha: wide,
                        value,
                        gradient,
                        slope,
                    };
                    record(&high, &mut best);
                } else {
                    // The widened endpoint left the feasible region.
                    can_widen = false;
                }
                if high.alpha >= MAX_STEP {
                    can_widen = false;
                }
            }
        }

        let width = high.alpha - low.alpha;
        let inner = cubic_maximizer(&low, &high)
            .unwrap_or_else(|| low.alpha + 0.5 * width)
            .clamp(low.alpha + SECTION * width, high.alpha - SECTION * width);
        let (value, gradient, slope) = eval(inner);
        evaluations += 1;
        candidate = LineSearchPoint {
            alpha: inner,
            value,
            gradient,
            slope,
        };
        record(&candidate, &mut best);
    }
    SearchOutcome {
        accepted: Err(LineSearchFailure::MaxIterationsReached),
        best,
        evaluations,
    }
}

/// Returns the stationary point of the cubic Hermite interpolant of the two
/// endpoints, or `None` when the interpolant has none in a usable form.
///
/// The formula is the textbook cubic-interpolation step for minimization,
/// applied to the negated function.
fn cubic_maximizer(low: &LineSearchPoint, high: &LineSearchPoint) -> Option<f64> {
    let (a, b) = (low.alpha, high.alpha);
    let (fa, da) = (-low.value, -low.slope);
    let (fb, db) = (-high.value, -high.slope);
    let d1 = da + db - 3.0 * (fa - fb) / (a - b);
    let disc = d1 * d1 - da * db;
    if disc < 0.0 {
        return None;
    }
    let d2 = (b - a).signum() * disc.sqrt();
    let denom = db - da + 2.0 * d2;
    if denom == 0.0 {
        return None;
    }
    let c = b - (b - a) * (db + d2 - d1) / denom;
    c.is_finite().then_some(c)
}
