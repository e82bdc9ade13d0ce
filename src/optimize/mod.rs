//! Levenberg-Marquardt non-linear least squares.
//!
//! This module provides a self-contained damped Gauss-Newton solver used by
//! the transform and RPC fitting code. Given a target vector `y`, a model
//! function `f` and an initial guess `x0`, [`lm`] finds a local minimum of
//!
//! ```text
//! E = || diff(y, f(x)) ||^2
//! ```
//!
//! in the neighborhood of `x0`. The default diff function is simple
//! subtraction. Numerical stability can be improved by providing an
//! analytical Jacobian for `f`; otherwise a forward-difference Jacobian is
//! used.

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

pub const LM_DEFAULT_ABS_TOLERANCE: f64 = 1e-16;
pub const LM_DEFAULT_REL_TOLERANCE: f64 = 1e-16;
pub const LM_DEFAULT_MAX_ITERATIONS: usize = 100;

/// Termination reason reported by [`lm`].
///
/// `DidNotConverge` is a normal termination signal, not an error: the solver
/// returns its best-effort parameter vector and the caller decides whether
/// the fit is usable (typically by checking the residual norm).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LmStatus {
    DidNotConverge,
    ConvergedAbsTolerance,
    ConvergedRelTolerance,
}

/// Solver tolerances and iteration bound.
#[derive(Debug, Clone, Copy)]
pub struct LmOptions {
    pub abs_tolerance: f64,
    pub rel_tolerance: f64,
    pub max_iterations: usize,
}

impl Default for LmOptions {
    fn default() -> Self {
        LmOptions {
            abs_tolerance: LM_DEFAULT_ABS_TOLERANCE,
            rel_tolerance: LM_DEFAULT_REL_TOLERANCE,
            max_iterations: LM_DEFAULT_MAX_ITERATIONS,
        }
    }
}

/// Forward-difference numerical Jacobian of `f` at `x`.
///
/// Step size per parameter is `eps = 1e-7 + |1e-7 * x[i]|`. Much better to
/// supply an analytical Jacobian if you can.
pub fn numerical_jacobian<F>(f: &F, x: &DVector<f64>) -> DMatrix<f64>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    let y = f(x);
    let n = y.len();
    let k = x.len();
    let mut result = DMatrix::zeros(n, k);
    for i in 0..k {
        let mut xp = x.clone();
        let eps = 1e-7 + (1e-7 * x[i]).abs();
        xp[i] += eps;
        let yp = f(&xp);
        result.set_column(i, &((yp - &y) / eps));
    }
    result
}

/// Minimum-norm least-squares solve of `a * x = b` via SVD.
///
/// The damping term generally keeps the system well-conditioned; if the
/// factorization still fails to back-substitute, a zero step is returned so
/// the caller simply keeps its current iterate.
fn solve_least_squares(a: &DMatrix<f64>, b: &DVector<f64>) -> DVector<f64> {
    let ncols = a.ncols();
    match a.clone().svd(true, true).solve(b, 1e-15) {
        Ok(soln) => soln,
        Err(msg) => {
            warn!("lm: least-squares solve failed ({msg}), taking zero step");
            DVector::zeros(ncols)
        }
    }
}

/// Levenberg-Marquardt with a custom residual-difference function and an
/// optional analytical Jacobian.
///
/// Returns the final parameter vector together with the termination
/// [`LmStatus`].
pub fn lm_with<F, D>(
    y: &DVector<f64>,
    f: F,
    x0: DVector<f64>,
    diff: D,
    jacobian: Option<&dyn Fn(&DVector<f64>) -> DMatrix<f64>>,
    opts: &LmOptions,
) -> (DVector<f64>, LmStatus)
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
    D: Fn(&DVector<f64>, &DVector<f64>) -> DVector<f64>,
{
    // Fixed measurement weight; folded into both the gradient and the
    // Gauss-Newton Hessian so it cancels in the solve, but kept to match the
    // reference formulation.
    let r_inv = 10.0;
    let mut lamb = 0.1;

    let mut x = x0;
    let yhat = f(&x);
    let error = diff(y, &yhat);
    let mut norm_start = error.norm();

    // Solution may already be good enough
    if norm_start < opts.abs_tolerance {
        debug!("lm: initial guess already within absolute tolerance");
        return (x, LmStatus::ConvergedAbsTolerance);
    }

    let mut status = LmStatus::DidNotConverge;
    let mut outer_iterations = 0;
    loop {
        outer_iterations += 1;

        // Value, gradient and Gauss-Newton Hessian at the current point.
        let yhat = f(&x);
        let error = diff(y, &yhat);
        norm_start = error.norm();

        let j = match jacobian {
            Some(jac) => jac(&x),
            None => numerical_jacobian(&f, &x),
        };
        let del_j = j.transpose() * &error * (-r_inv);
        let hessian = (j.transpose() * &j) * r_inv;

        // Inner loop: grow the damping term until the step improves the
        // residual. The diagonal update deliberately compounds on the same
        // working matrix across failed attempts within one outer iteration.
        let mut hessian_lm = hessian.clone();
        let mut short_circuit = false;
        let mut x_try = x.clone();
        let mut norm_try = norm_start + 1.0;
        let mut inner_iterations = 0;
        while norm_try > norm_start {
            for i in 0..hessian_lm.nrows() {
                hessian_lm[(i, i)] += hessian_lm[(i, i)] * lamb + lamb;
            }

            let delta_x = solve_least_squares(&hessian_lm, &del_j);
            x_try = &x - &delta_x;
            let y_try = f(&x_try);
            let error_try = diff(y, &y_try);
            norm_try = error_try.norm();

            if norm_try > norm_start {
                lamb *= 10.0;
            }

            inner_iterations += 1;
            if inner_iterations > 5 {
                // No improving step found at this point; keep the old
                // iterate and fall through to the convergence checks.
                short_circuit = true;
                norm_try = norm_start;
            }
        }

        // Check order matters: a later check overrides an earlier status.
        let mut done = false;
        if (norm_start - norm_try) / norm_start < opts.rel_tolerance {
            status = LmStatus::ConvergedRelTolerance;
            debug!("lm: converged to relative tolerance");
            done = true;
        }
        if norm_try < opts.abs_tolerance {
            status = LmStatus::ConvergedAbsTolerance;
            debug!("lm: converged to absolute tolerance");
            done = true;
        }
        if outer_iterations >= opts.max_iterations {
            status = LmStatus::DidNotConverge;
            debug!("lm: reached max iterations");
            done = true;
        }

        // If the inner loop short-circuited we never actually found a better
        // x, so don't take the trial point.
        if !short_circuit {
            x = x_try;
        }

        lamb /= 10.0;

        if done {
            break;
        }
    }

    (x, status)
}

/// Levenberg-Marquardt with subtraction residuals and a numerical Jacobian.
pub fn lm<F>(y: &DVector<f64>, f: F, x0: DVector<f64>, opts: &LmOptions) -> (DVector<f64>, LmStatus)
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    lm_with(y, f, x0, |u, v| u - v, None, opts)
}

/// Convenience wrapper returning just the fitted parameter vector.
pub fn optimize<F>(y: &DVector<f64>, f: F, x0: DVector<f64>) -> DVector<f64>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    let (x, _status) = lm(y, f, x0, &LmOptions::default());
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_numerical_jacobian_linear() {
        let f = |x: &DVector<f64>| x * 2.0;
        let x = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let j = numerical_jacobian(&f, &x);
        for r in 0..3 {
            for c in 0..3 {
                let expected = if r == c { 2.0 } else { 0.0 };
                assert_relative_eq!(j[(r, c)], expected, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_lm_toy_problem() {
        // f(x) = (x - 5)^2 applied componentwise, target 0: minimum at x = 5.
        let f = |x: &DVector<f64>| x.map(|xi| (xi - 5.0) * (xi - 5.0));
        let y = DVector::zeros(3);
        let x0 = DVector::zeros(3);
        let (x, status) = lm(&y, f, x0, &LmOptions::default());
        assert_ne!(status, LmStatus::DidNotConverge);
        for i in 0..3 {
            assert_relative_eq!(x[i], 5.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_lm_immediate_convergence() {
        // Initial guess already hits the target exactly.
        let f = |x: &DVector<f64>| x.clone();
        let y = DVector::from_vec(vec![1.0, 2.0]);
        let x0 = DVector::from_vec(vec![1.0, 2.0]);
        let (x, status) = lm(&y, f, x0, &LmOptions::default());
        assert_eq!(status, LmStatus::ConvergedAbsTolerance);
        assert_relative_eq!(x[0], 1.0);
        assert_relative_eq!(x[1], 2.0);
    }

    #[test]
    fn test_lm_linear_system() {
        // Fitting a linear model is a single Gauss-Newton step.
        let f = |x: &DVector<f64>| {
            DVector::from_vec(vec![x[0] + x[1], x[0] - x[1], 2.0 * x[0]])
        };
        let y = DVector::from_vec(vec![3.0, -1.0, 2.0]);
        let x0 = DVector::zeros(2);
        let (x, _status) = lm(&y, f, x0, &LmOptions::default());
        assert_relative_eq!(x[0], 1.0, epsilon = 1e-8);
        assert_relative_eq!(x[1], 2.0, epsilon = 1e-8);
    }

    #[test]
    fn test_optimize_wrapper() {
        let f = |x: &DVector<f64>| x.map(|xi| xi * 3.0);
        let y = DVector::from_vec(vec![6.0, 9.0]);
        let x0 = DVector::zeros(2);
        let x = optimize(&y, f, x0);
        assert_relative_eq!(x[0], 2.0, epsilon = 1e-8);
        assert_relative_eq!(x[1], 3.0, epsilon = 1e-8);
    }
}
