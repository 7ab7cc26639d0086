//! Lanczos tridiagonalization and its uses:
//! * stochastic Lanczos quadrature estimate of `log |A|`,
//! * low rank factor of `A^-1` used to cache predictive variances (LOVE).
//!
//! References:
//! * Ubaru, S., Chen, J., & Saad, Y. (2017). Fast estimation of tr(f(A)) via stochastic
//!   Lanczos quadrature. SIAM Journal on Matrix Analysis and Applications, 38(4).
//! * Pleiss, G., Gardner, J., Weinberger, K., & Wilson, A. G. (2018). Constant-time predictive
//!   distributions for Gaussian processes. ICML.

use crate::errors::{GpError, Result};
use crate::operators::LinearOperator;
use linfa::Float;
use linfa_linalg::{cholesky::*, eigh::*, triangular::*};
use log::warn;
use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use ndarray_rand::rand::Rng;
use rayon::prelude::*;

/// Partial tridiagonalization `A Q ≈ Q T` of a symmetric operator
#[derive(Clone, Debug)]
pub struct LanczosDecomposition<F: Float> {
    /// Orthonormal basis of the Krylov subspace (n, k)
    basis: Array2<F>,
    /// Diagonal of T (k)
    alphas: Array1<F>,
    /// Off diagonal of T (k - 1)
    betas: Array1<F>,
}

impl<F: Float> LanczosDecomposition<F> {
    /// Run at most `max_iterations` Lanczos steps on `op` from `init` direction,
    /// with full reorthogonalization of the basis.
    pub fn new<Op: LinearOperator<F>>(
        op: &Op,
        init: &ArrayView1<F>,
        max_iterations: usize,
    ) -> Result<Self> {
        let n = op.size();
        if init.len() != n {
            return Err(GpError::DimensionError(format!(
                "Lanczos initial vector of size {} for an operator of size {n}",
                init.len()
            )));
        }
        let init_norm = init.dot(init).sqrt();
        if !(init_norm > F::zero()) || !init_norm.is_finite() {
            return Err(GpError::InvalidValueError(
                "Lanczos initial vector should be finite and non zero".to_string(),
            ));
        }
        let k_max = max_iterations.clamp(1, n);
        let mut basis = Array2::zeros((n, k_max));
        let mut alphas = Vec::with_capacity(k_max);
        let mut betas = Vec::with_capacity(k_max);
        basis.column_mut(0).assign(&init.mapv(|v| v / init_norm));

        let mut scale = F::zero();
        for j in 0..k_max {
            let q = basis.column(j).to_owned();
            let mut w = op.matvec(&q.view());
            let alpha = q.dot(&w);
            w.scaled_add(-alpha, &q);
            if j > 0 {
                let beta: F = betas[j - 1];
                w.scaled_add(-beta, &basis.column(j - 1));
            }
            // twice is enough
            for _ in 0..2 {
                let qj = basis.slice(s![.., ..=j]);
                let coefs = qj.t().dot(&w);
                w -= &qj.dot(&coefs);
            }
            alphas.push(alpha);
            let beta = w.dot(&w).sqrt();
            scale = scale.max(alpha.abs() + beta);
            if j + 1 == k_max || beta <= F::cast(1e-10) * scale {
                break;
            }
            betas.push(beta);
            basis.column_mut(j + 1).assign(&w.mapv(|v| v / beta));
        }
        let k = alphas.len();
        Ok(LanczosDecomposition {
            basis: basis.slice(s![.., ..k]).to_owned(),
            alphas: Array1::from(alphas),
            betas: Array1::from(betas),
        })
    }

    /// Number of Lanczos steps actually done
    pub fn n_steps(&self) -> usize {
        self.alphas.len()
    }

    /// Orthonormal basis Q (n, k)
    pub fn basis(&self) -> &Array2<F> {
        &self.basis
    }

    /// Dense tridiagonal matrix T (k, k)
    pub fn tridiagonal(&self) -> Array2<F> {
        let k = self.n_steps();
        let mut t = Array2::from_diag(&self.alphas);
        for (i, b) in self.betas.iter().enumerate() {
            t[[i, i + 1]] = *b;
            t[[i + 1, i]] = *b;
        }
        debug_assert_eq!(t.dim(), (k, k));
        t
    }

    /// Gauss quadrature of `e_1^T f(T) e_1`: sum of `tau_i^2 f(lambda_i)`
    /// where `lambda_i` are eigenvalues of T and `tau_i` first components of its eigenvectors.
    /// Non positive eigenvalues are clamped before applying `f`.
    pub fn quadrature(&self, f: impl Fn(F) -> F) -> Result<F> {
        let (eigvals, eigvecs) = self.tridiagonal().eigh_into()?;
        let max_eig = eigvals.iter().fold(F::zero(), |a, &b| a.max(b));
        let floor = (max_eig * F::epsilon()).max(F::min_positive_value());
        let mut res = F::zero();
        for (lambda, tau) in eigvals.iter().zip(eigvecs.row(0).iter()) {
            let lambda = if *lambda < floor {
                warn!("Lanczos eigenvalue {lambda} clamped to {floor}");
                floor
            } else {
                *lambda
            };
            res += *tau * *tau * f(lambda);
        }
        Ok(res)
    }

    /// Factor `R = Q L^-T` where `T = L L^T`, such that `A^-1 ≈ R R^T`
    /// on the Krylov subspace.
    pub fn inverse_factor(&self) -> Result<Array2<F>> {
        let l = self.tridiagonal().cholesky()?;
        let rt = l.solve_triangular(&self.basis.t(), UPLO::Lower)?;
        Ok(rt.reversed_axes())
    }
}

/// Probe vectors (n_probes, n) with `E[z z^T] = I`.
///
/// Rademacher vectors drawn from `rng`, unless `n_probes >= n` in which case
/// the `n` scaled canonical vectors `sqrt(n) e_i` are used, making trace estimates exact.
pub fn probe_vectors<F: Float, R: Rng>(n: usize, n_probes: usize, rng: &mut R) -> Array2<F> {
    if n_probes >= n {
        Array2::eye(n) * F::cast(n).sqrt()
    } else {
        Array2::from_shape_simple_fn((n_probes, n), || {
            if rng.r#gen::<bool>() {
                F::one()
            } else {
                -F::one()
            }
        })
    }
}

/// Stochastic Lanczos quadrature estimate of `log |op|`:
/// `1/p sum_i ||z_i||^2 e_1^T log(T_i) e_1` over the probe vectors `z_i` (rows of `probes`).
pub fn logdet<F: Float, Op: LinearOperator<F>>(
    op: &Op,
    probes: &Array2<F>,
    max_iterations: usize,
) -> Result<F> {
    if probes.nrows() == 0 {
        return Err(GpError::InvalidValueError(
            "log determinant estimation needs at least one probe vector".to_string(),
        ));
    }
    let terms = probes
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|z| -> Result<F> {
            let lanczos = LanczosDecomposition::new(op, &z, max_iterations)?;
            Ok(z.dot(&z) * lanczos.quadrature(|l| l.ln())?)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(terms.iter().fold(F::zero(), |a, &b| a + b) / F::cast(probes.nrows()))
}
