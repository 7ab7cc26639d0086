//! Negative log marginal likelihood of the SKI GP and its gradient wrt raw hyperparameters.
//!
//! With `r = y - m(x)` and `K = W K_grid W^T + noise * I`, the loss is normalized by
//! the number of training points:
//!
//! `loss = (r^T K^-1 r / 2 + log|K| / 2 + n log(2 pi) / 2) / n`
//!
//! and for a covariance parameter `theta`, with `alpha = K^-1 r`:
//!
//! `d loss / d theta = (- alpha^T dK alpha / 2 + tr(K^-1 dK) / 2) / n`
//!
//! Linear solves use a Krylov solver, `log|K|` is estimated by stochastic Lanczos quadrature
//! and traces by the Hutchinson estimator `tr(K^-1 dK) ≈ 1/p sum_i (K^-1 z_i)^T dK z_i`
//! over the same probe vectors.

use crate::GridFloat;
use crate::correlation_models::CorrelationModel;
use crate::errors::{GpError, Result};
use crate::grid::Grid;
use crate::hyperparameters::Hyperparameters;
use crate::interpolation::InterpolationWeights;
use crate::lanczos::{logdet, probe_vectors};
use crate::mean_models::MeanModel;
use crate::operators::{AddedDiagOperator, InterpolatedOperator, KroneckerToeplitz, LinearOperator};
use crate::solver::{KrylovSolver, Solution};
use log::debug;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};
use ndarray_rand::rand::Rng;
use rayon::prelude::*;

/// Result of a likelihood evaluation
#[derive(Clone, Debug)]
pub struct LikelihoodEval<F: GridFloat> {
    /// Normalized negative log marginal likelihood
    pub loss: F,
    /// Derivatives of the loss wrt flattened raw hyperparameters
    pub gradient: Array1<F>,
    /// `K^-1 (y - m(x))`
    pub alpha: Array1<F>,
    /// Whether every linear solve reached the solver tolerance
    pub converged: bool,
}

/// Marginal likelihood of a SKI GP bound to training data
#[derive(Clone, Debug)]
pub struct MarginalLikelihood<'a, F: GridFloat, Mean: MeanModel<F>, Corr: CorrelationModel<F>> {
    mean: Mean,
    corr: Corr,
    x: ArrayView2<'a, F>,
    y: ArrayView1<'a, F>,
    grid: &'a Grid<F>,
    weights: &'a InterpolationWeights<F>,
    solver: KrylovSolver<F>,
    n_probes: usize,
    max_lanczos_iterations: usize,
}

impl<'a, F: GridFloat, Mean: MeanModel<F>, Corr: CorrelationModel<F>>
    MarginalLikelihood<'a, F, Mean, Corr>
{
    /// Constructor given training data `(x, y)`, the inducing grid, the interpolation weights
    /// of `x` on the grid and the stochastic estimation settings.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mean: Mean,
        corr: Corr,
        x: ArrayView2<'a, F>,
        y: ArrayView1<'a, F>,
        grid: &'a Grid<F>,
        weights: &'a InterpolationWeights<F>,
        solver: KrylovSolver<F>,
        n_probes: usize,
        max_lanczos_iterations: usize,
    ) -> Result<Self> {
        if x.nrows() != y.len() || weights.n_points() != y.len() {
            return Err(GpError::DimensionError(format!(
                "{} input points, {} outputs and {} interpolated points",
                x.nrows(),
                y.len(),
                weights.n_points()
            )));
        }
        if x.ncols() != grid.dim() || weights.n_nodes() != grid.size() {
            return Err(GpError::DimensionError(format!(
                "inputs of dimension {} interpolated on {} nodes with a grid of dimension {} with {} nodes",
                x.ncols(),
                weights.n_nodes(),
                grid.dim(),
                grid.size()
            )));
        }
        if n_probes == 0 || max_lanczos_iterations == 0 {
            return Err(GpError::InvalidValueError(
                "number of probes and Lanczos iterations should be positive".to_string(),
            ));
        }
        Ok(MarginalLikelihood {
            mean,
            corr,
            x,
            y,
            grid,
            weights,
            solver,
            n_probes,
            max_lanczos_iterations,
        })
    }

    /// Number of training points
    pub fn n_points(&self) -> usize {
        self.y.len()
    }

    /// Loss, gradient and `alpha` at given hyperparameters, probe vectors being drawn from `rng`
    pub fn evaluate<R: Rng>(
        &self,
        hyperparameters: &Hyperparameters<F>,
        rng: &mut R,
    ) -> Result<LikelihoodEval<F>> {
        hyperparameters.validate(&self.corr)?;
        if hyperparameters.mean_params().len() != self.mean.n_params() {
            return Err(GpError::InvalidHyperparameterError(format!(
                "{} expects {} parameters, got {}",
                self.mean,
                self.mean.n_params(),
                hyperparameters.mean_params().len()
            )));
        }
        let n = self.n_points();
        let nf = F::cast(n);
        let k_grid = KroneckerToeplitz::from_kernel(&self.corr, self.grid, hyperparameters)?;
        let ski = InterpolatedOperator::new(self.weights, &k_grid)?;
        let cov = AddedDiagOperator::new(ski, hyperparameters.noise_variance());

        let residual = &self.y - &self.mean.value(&self.x, hyperparameters.mean_params());
        let probes = probe_vectors(n, self.n_probes, rng);
        let mut rhs = Array2::zeros((probes.nrows() + 1, n));
        rhs.row_mut(0).assign(&residual);
        rhs.slice_mut(s![1.., ..]).assign(&probes);
        let solutions = self.solver.solve_many(&cov, &rhs)?;
        let converged = solutions.iter().all(|s| s.converged);
        let alpha = solutions[0].x.clone();
        let probe_solves = &solutions[1..];

        let logdet = logdet(&cov, &probes, self.max_lanczos_iterations)?;
        let two_pi = F::cast(2. * std::f64::consts::PI);
        let half = F::cast(0.5);
        let loss = (half * residual.dot(&alpha) + half * logdet + half * nf * two_pi.ln()) / nf;
        if !loss.is_finite() {
            return Err(GpError::LikelihoodComputationError(format!(
                "non finite loss with hyperparameters {hyperparameters}"
            )));
        }

        let mut gradient = Array1::zeros(hyperparameters.len());
        let derivatives = k_grid.corr_derivatives(&self.corr, self.grid, hyperparameters)?;
        let corr_grads = derivatives
            .par_iter()
            .map(|dk| -> Result<F> {
                let dop = InterpolatedOperator::new(self.weights, dk)?;
                Ok(derivative_term(&dop, &alpha, &probes, probe_solves))
            })
            .collect::<Result<Vec<_>>>()?;
        gradient
            .slice_mut(s![..corr_grads.len()])
            .assign(&Array1::from(corr_grads));

        // dK / d ln outputscale = W K_grid W^T
        gradient[hyperparameters.outputscale_index()] =
            derivative_term(cov.inner(), &alpha, &probes, probe_solves);

        // dK / d ln noise = exp(ln noise) * I
        let noise_scale = hyperparameters.log_noise.exp();
        let trace = probe_solves
            .iter()
            .zip(probes.outer_iter())
            .fold(F::zero(), |acc, (u, z)| acc + u.x.dot(&z))
            / F::cast(probes.nrows());
        gradient[hyperparameters.noise_index()] =
            noise_scale * (-half * alpha.dot(&alpha) + half * trace);

        let jac = self.mean.jacobian(&self.x, hyperparameters.mean_params());
        let mean_grad = -jac.t().dot(&alpha);
        gradient
            .slice_mut(s![hyperparameters.mean_index()..])
            .assign(&mean_grad);

        gradient.mapv_inplace(|g| g / nf);
        debug!("loss = {loss}, logdet = {logdet}, gradient = {gradient}");
        Ok(LikelihoodEval {
            loss,
            gradient,
            alpha,
            converged,
        })
    }
}

/// `- alpha^T dK alpha / 2 + tr(K^-1 dK) / 2` with the Hutchinson trace estimate
fn derivative_term<F: GridFloat, Op: LinearOperator<F>>(
    dop: &Op,
    alpha: &Array1<F>,
    probes: &Array2<F>,
    probe_solves: &[Solution<F>],
) -> F {
    let half = F::cast(0.5);
    let quad = alpha.dot(&dop.matvec(&alpha.view()));
    let trace = probes
        .outer_iter()
        .zip(probe_solves.iter())
        .fold(F::zero(), |acc, (z, u)| acc + u.x.dot(&dop.matvec(&z)))
        / F::cast(probes.nrows());
    -half * quad + half * trace
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation_models::*;
    use crate::mean_models::{ConstantMean, ZeroMean};
    use crate::solver::SolverMethod;
    use approx::assert_abs_diff_eq;
    use finitediff::FiniteDiff;
    use linfa_linalg::{cholesky::*, triangular::*};
    use ndarray::{Array, Axis, array};
    use ndarray_rand::RandomExt;
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::{Normal, Uniform};
    use paste::paste;
    use rand_xoshiro::Xoshiro256Plus;

    /// Exact negative log likelihood from the explicit SKI covariance matrix
    fn dense_loss<Mean: MeanModel<f64>, Corr: CorrelationModel<f64>>(
        mean: &Mean,
        corr: &Corr,
        x: &Array2<f64>,
        y: &Array1<f64>,
        grid: &Grid<f64>,
        hp: &Hyperparameters<f64>,
    ) -> f64 {
        let w = InterpolationWeights::new(grid, x).unwrap().to_dense();
        let nodes = grid.nodes();
        let k_grid = covariance(corr, &nodes, &nodes, hp.corr_params(), hp.outputscale()).unwrap();
        let n = y.len();
        let k = w.dot(&k_grid).dot(&w.t()) + Array2::<f64>::eye(n) * hp.noise_variance();
        let r = y - &mean.value(x, hp.mean_params());
        let l = k.cholesky().unwrap();
        let z = l
            .solve_triangular(&r.clone().insert_axis(Axis(1)), UPLO::Lower)
            .unwrap();
        let logdet = 2. * l.diag().mapv(f64::ln).sum();
        let nf = n as f64;
        (0.5 * z.column(0).dot(&z.column(0))
            + 0.5 * logdet
            + 0.5 * nf * (2. * std::f64::consts::PI).ln())
            / nf
    }

    fn training_data(n: usize) -> (Array2<f64>, Array1<f64>) {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let x = Array::random_using((n, 1), Uniform::new(0., 1.), &mut rng);
        let noise = Array::random_using(n, Normal::new(0., 0.1).unwrap(), &mut rng);
        let y = x.column(0).mapv(|v: f64| (6. * v).sin() + 0.5) + noise;
        (x, y)
    }

    fn exact_solver() -> KrylovSolver<f64> {
        KrylovSolver::new(SolverMethod::ConjugateResidual, 500, 1e-12)
    }

    macro_rules! test_likelihood {
        ($corr:ident, $init:expr, $mean:expr) => {
            paste! {
                #[test]
                fn [<test_ $corr:snake _loss_and_gradient_exact>]() {
                    let corr = $init;
                    let mean = $mean;
                    let n = 25;
                    let (x, y) = training_data(n);
                    let grid = Grid::new(&[(0., 1.)], &[15]).unwrap();
                    let weights = InterpolationWeights::new(&grid, &x).unwrap();
                    let lik = MarginalLikelihood::new(
                        mean, corr, x.view(), y.view(), &grid, &weights, exact_solver(), n, n,
                    )
                    .unwrap();
                    let corr_params = corr.params_from_lengthscale(0.3).insert_axis(Axis(0));
                    let hp = Hyperparameters::new(
                        corr_params, 1.2, 0.05, mean.initial_params(&y), 1e-6,
                    )
                    .unwrap();

                    let mut rng = Xoshiro256Plus::seed_from_u64(0);
                    let eval = lik.evaluate(&hp, &mut rng).unwrap();
                    assert!(eval.converged);
                    let expected = dense_loss(&mean, &corr, &x, &y, &grid, &hp);
                    assert_abs_diff_eq!(eval.loss, expected, epsilon = 1e-6);

                    let f = |raw: &Vec<f64>| -> f64 {
                        dense_loss(&mean, &corr, &x, &y, &grid, &hp.with_raw(&Array1::from(raw.clone())).unwrap())
                    };
                    let fdiff = hp.to_raw().to_vec().central_diff(&f);
                    assert_abs_diff_eq!(eval.gradient, Array1::from(fdiff), epsilon = 1e-5);
                }
            }
        };
    }

    test_likelihood!(SquaredExponential, SquaredExponentialCorr(), ConstantMean());
    test_likelihood!(Matern32, Matern32Corr(), ZeroMean());
    test_likelihood!(Matern52, Matern52Corr(), ConstantMean());
    test_likelihood!(AbsoluteExponential, AbsoluteExponentialCorr(), ConstantMean());
    test_likelihood!(SpectralMixture, SpectralMixtureCorr::new(2), ConstantMean());

    #[test]
    fn test_stochastic_estimate() {
        let n = 200;
        let (x, y) = training_data(n);
        let grid = Grid::new(&[(0., 1.)], &[50]).unwrap();
        let weights = InterpolationWeights::new(&grid, &x).unwrap();
        let corr = SquaredExponentialCorr();
        let lik = MarginalLikelihood::new(
            ConstantMean(),
            corr,
            x.view(),
            y.view(),
            &grid,
            &weights,
            KrylovSolver::default(),
            30,
            30,
        )
        .unwrap();
        let hp = Hyperparameters::new(array![[f64::ln(0.2)]], 1., 0.05, array![0.5], 1e-6).unwrap();
        let mut rng = Xoshiro256Plus::seed_from_u64(1);
        let eval = lik.evaluate(&hp, &mut rng).unwrap();
        let expected = dense_loss(&ConstantMean(), &corr, &x, &y, &grid, &hp);
        assert_abs_diff_eq!(eval.loss, expected, epsilon = 0.05 * expected.abs().max(1.));
        assert_eq!(eval.gradient.len(), 4);
        assert_eq!(eval.alpha.len(), n);
    }

    #[test]
    fn test_invalid_inputs() {
        let (x, y) = training_data(10);
        let grid = Grid::new(&[(0., 1.)], &[10]).unwrap();
        let weights = InterpolationWeights::new(&grid, &x).unwrap();
        let y_short = y.slice(s![..5]);
        assert!(matches!(
            MarginalLikelihood::new(
                ZeroMean(),
                SquaredExponentialCorr(),
                x.view(),
                y_short,
                &grid,
                &weights,
                KrylovSolver::default(),
                5,
                5
            ),
            Err(GpError::DimensionError(_))
        ));

        let lik = MarginalLikelihood::new(
            ZeroMean(),
            SquaredExponentialCorr(),
            x.view(),
            y.view(),
            &grid,
            &weights,
            KrylovSolver::default(),
            5,
            5,
        )
        .unwrap();
        let hp = Hyperparameters::new(array![[0.]], 1., 0.1, array![], 1e-6).unwrap();
        let bad = hp.with_raw(&array![f64::INFINITY, 0., 0.]).unwrap();
        let mut rng = Xoshiro256Plus::seed_from_u64(1);
        assert!(matches!(
            lik.evaluate(&bad, &mut rng),
            Err(GpError::InvalidHyperparameterError(_))
        ));
        let with_mean = Hyperparameters::new(array![[0.]], 1., 0.1, array![1.], 1e-6).unwrap();
        assert!(lik.evaluate(&with_mean, &mut rng).is_err());
    }
}
