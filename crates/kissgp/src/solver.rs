//! Krylov subspace solvers for symmetric positive definite systems `A x = b`
//! where `A` is only known through matrix-vector products.
//!
//! Each iteration costs exactly one product with `A` plus a few vector operations.
//! The conjugate residual method minimizes the residual norm over the Krylov subspace,
//! hence its residual norm never increases; it is the default method.
//! The conjugate gradient method minimizes the `A`-norm of the error instead.

use crate::errors::{GpError, Result};
use crate::operators::LinearOperator;
use linfa::Float;
use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayView1};
use rayon::prelude::*;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Krylov method used to solve linear systems
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum SolverMethod {
    /// Conjugate residual: monotonic residual norm decrease
    #[default]
    ConjugateResidual,
    /// Conjugate gradient
    ConjugateGradient,
}

/// Result of an iterative solve
#[derive(Clone, Debug)]
pub struct Solution<F: Float> {
    /// Best approximate solution found
    pub x: Array1<F>,
    /// Residual norm `||b - A x_k||` of every iterate, starting from `x_0 = 0`
    pub residual_norms: Vec<F>,
    /// Number of iterations (matrix-vector products after the initial one)
    pub iterations: usize,
    /// Whether the relative residual fell below the tolerance
    pub converged: bool,
}

/// Iterative solver configuration
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct KrylovSolver<F: Float> {
    method: SolverMethod,
    max_iterations: usize,
    tolerance: F,
}

impl<F: Float> Default for KrylovSolver<F> {
    fn default() -> Self {
        KrylovSolver {
            method: SolverMethod::default(),
            max_iterations: 100,
            tolerance: F::cast(1e-6),
        }
    }
}

impl<F: Float> KrylovSolver<F> {
    /// Constructor given the method, the iterations budget and the relative residual tolerance
    pub fn new(method: SolverMethod, max_iterations: usize, tolerance: F) -> Self {
        KrylovSolver {
            method,
            max_iterations,
            tolerance,
        }
    }

    /// Krylov method
    pub fn method(&self) -> SolverMethod {
        self.method
    }

    /// Maximum number of iterations
    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Relative residual tolerance
    pub fn tolerance(&self) -> F {
        self.tolerance
    }

    /// Solve `op x = b` starting from `x_0 = 0`.
    ///
    /// Running out of iterations is not an error: a warning is logged and the best
    /// iterate is returned with `converged` set to false.
    pub fn solve<Op: LinearOperator<F>>(&self, op: &Op, b: &ArrayView1<F>) -> Result<Solution<F>> {
        if b.len() != op.size() {
            return Err(GpError::DimensionError(format!(
                "right hand side of size {} for an operator of size {}",
                b.len(),
                op.size()
            )));
        }
        if b.iter().any(|v| !v.is_finite()) {
            return Err(GpError::InvalidValueError(
                "right hand side has non finite values".to_string(),
            ));
        }
        let b_norm = norm(b);
        if b_norm == F::zero() {
            return Ok(Solution {
                x: Array1::zeros(b.len()),
                residual_norms: vec![F::zero()],
                iterations: 0,
                converged: true,
            });
        }
        let sol = match self.method {
            SolverMethod::ConjugateResidual => self.conjugate_residual(op, b, b_norm)?,
            SolverMethod::ConjugateGradient => self.conjugate_gradient(op, b, b_norm)?,
        };
        if sol.converged {
            debug!(
                "{:?} converged in {} iterations",
                self.method, sol.iterations
            );
        } else {
            let best = sol
                .residual_norms
                .iter()
                .fold(F::infinity(), |a, &r| a.min(r));
            warn!(
                "{:?} did not converge in {} iterations (relative residual {})",
                self.method,
                sol.iterations,
                best / b_norm
            );
        }
        Ok(sol)
    }

    /// Solve `op x = b_i` for every row `b_i` of `rhs`, systems being solved in parallel
    pub fn solve_many<Op: LinearOperator<F>>(
        &self,
        op: &Op,
        rhs: &Array2<F>,
    ) -> Result<Vec<Solution<F>>> {
        rhs.outer_iter()
            .into_par_iter()
            .map(|b| self.solve(op, &b))
            .collect()
    }

    fn conjugate_residual<Op: LinearOperator<F>>(
        &self,
        op: &Op,
        b: &ArrayView1<F>,
        b_norm: F,
    ) -> Result<Solution<F>> {
        let threshold = self.tolerance * b_norm;
        let mut x = Array1::zeros(b.len());
        let mut r = b.to_owned();
        let mut p = r.clone();
        let mut ar = op.matvec(&r.view());
        let mut ap = ar.clone();
        let mut r_ar = r.dot(&ar);
        let mut residual_norms = vec![b_norm];
        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.max_iterations {
            let ap_ap = ap.dot(&ap);
            if !(ap_ap > F::zero()) || !(r_ar > F::zero()) {
                warn!("Conjugate residual breakdown at iteration {iterations}");
                break;
            }
            // minimizer of ||r - alpha A p||, equal to (r.Ar)/(Ap.Ap) in exact arithmetic
            let alpha = r.dot(&ap) / ap_ap;
            x.scaled_add(alpha, &p);
            r.scaled_add(-alpha, &ap);
            iterations += 1;
            let r_norm = norm(&r.view());
            check_finite(r_norm, iterations)?;
            residual_norms.push(r_norm);
            if r_norm <= threshold {
                converged = true;
                break;
            }
            ar = op.matvec(&r.view());
            let r_ar_next = r.dot(&ar);
            let beta = r_ar_next / r_ar;
            r_ar = r_ar_next;
            p = &r + &(p * beta);
            ap = &ar + &(ap * beta);
        }
        Ok(Solution {
            x,
            residual_norms,
            iterations,
            converged,
        })
    }

    fn conjugate_gradient<Op: LinearOperator<F>>(
        &self,
        op: &Op,
        b: &ArrayView1<F>,
        b_norm: F,
    ) -> Result<Solution<F>> {
        let threshold = self.tolerance * b_norm;
        let mut x = Array1::zeros(b.len());
        let mut r = b.to_owned();
        let mut p = r.clone();
        let mut r_r = r.dot(&r);
        let mut residual_norms = vec![b_norm];
        let mut best = (b_norm, x.clone());
        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.max_iterations {
            let ap = op.matvec(&p.view());
            let p_ap = p.dot(&ap);
            if !(p_ap > F::zero()) {
                warn!("Conjugate gradient breakdown at iteration {iterations}: operator not positive definite");
                break;
            }
            let alpha = r_r / p_ap;
            x.scaled_add(alpha, &p);
            r.scaled_add(-alpha, &ap);
            iterations += 1;
            let r_r_next = r.dot(&r);
            let r_norm = r_r_next.sqrt();
            check_finite(r_norm, iterations)?;
            residual_norms.push(r_norm);
            if r_norm < best.0 {
                best = (r_norm, x.clone());
            }
            if r_norm <= threshold {
                converged = true;
                break;
            }
            let beta = r_r_next / r_r;
            r_r = r_r_next;
            p = &r + &(p * beta);
        }
        Ok(Solution {
            x: best.1,
            residual_norms,
            iterations,
            converged,
        })
    }
}

fn norm<F: Float>(v: &ArrayView1<F>) -> F {
    v.dot(v).sqrt()
}

fn check_finite<F: Float>(r_norm: F, iteration: usize) -> Result<()> {
    if !r_norm.is_finite() {
        return Err(GpError::LikelihoodComputationError(format!(
            "non finite residual at iteration {iteration}"
        )));
    }
    Ok(())
}
