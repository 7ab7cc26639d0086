use crate::GridFloat;
use crate::correlation_models::*;
use crate::errors::{GpError, Result};
use crate::grid::{Grid, choose_grid_size};
use crate::hyperparameters::Hyperparameters;
use crate::interpolation::InterpolationWeights;
use crate::lanczos::LanczosDecomposition;
use crate::likelihood::{LikelihoodEval, MarginalLikelihood};
use crate::mean_models::*;
use crate::operators::{AddedDiagOperator, InterpolatedOperator, KroneckerToeplitz, LinearOperator};
use crate::optimization::{AdamParams, optimize_params};
use crate::parameters::{SkiParams, SkiValidParams};
use crate::solver::KrylovSolver;

use linfa::prelude::{DatasetBase, Fit, PredictInplace};
use ndarray::{Array1, Array2, ArrayBase, ArrayView1, ArrayView2, Axis, Data, Ix1, Ix2, Zip};
use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_stats::QuantileExt;
use rand_xoshiro::Xoshiro256Plus;

use log::{debug, info};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

#[cfg(feature = "persistent")]
use std::{fs, io::Write};

/// Ratio of grid nodes per dimension wrt `n^(1/nx)` when grid size is not given
pub const SKI_GRID_RATIO: f64 = 1.;

/// Internal parameters computed during training
/// used later on in prediction computations
#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(deserialize = "F: Deserialize<'de>"))
)]
pub(crate) struct SkiInnerParams<F: GridFloat> {
    /// Predictive mean cache `K_grid W^T alpha` (M)
    mean_cache: Array1<F>,
    /// Predictive variance cache `K_grid W^T R` (M, k) where `K^-1 ≈ R R^T`
    var_cache: Array2<F>,
}

/// Scalable Gaussian process regression with structured kernel interpolation (KISS-GP).
///
/// The covariance of the `n` training points is approximated by `W K_grid W^T` where
/// `K_grid` is the kernel evaluated on a regular inducing grid of `M` nodes and `W` the
/// sparse cubic interpolation weights from grid nodes to points. `K_grid` is a Kronecker
/// product of symmetric Toeplitz matrices so that the covariance is never formed: linear
/// systems are solved with a Krylov method, the log determinant of the likelihood is
/// estimated by stochastic Lanczos quadrature and hyperparameters are trained with Adam.
///
/// Prediction reuses caches computed once after training: the mean costs an interpolation
/// of a grid vector and the variance (LOVE) an interpolation of a (M, k) grid matrix.
///
/// Training inputs and prediction points have to lie within the grid bounds, which are given
/// in parameters or taken as the extent of the training inputs.
///
/// # Features
///
/// ## serializable
///
/// The `serializable` feature enables the serialization of GP models using the [`serde crate`](https://serde.rs/).
///
/// ## persistent
///
/// The `persistent` feature enables `save()`/`load()` methods of trained models to/from JSON files.
///
/// # Example
///
/// ```no_run
/// use kissgp::{correlation_models::*, mean_models::*, SkiGaussianProcess};
/// use linfa::prelude::*;
/// use ndarray::{Array, Array1, Array2, Axis};
/// use ndarray_rand::rand::SeedableRng;
/// use ndarray_rand::rand_distr::Uniform;
/// use ndarray_rand::RandomExt;
/// use rand_xoshiro::Xoshiro256Plus;
///
/// let mut rng = Xoshiro256Plus::seed_from_u64(42);
/// let xt = Array::random_using((1000, 1), Uniform::new(0., 1.), &mut rng);
/// let yt = xt.column(0).mapv(|v: f64| (4. * std::f64::consts::PI * v).sin());
///
/// let gp = SkiGaussianProcess::<f64, ConstantMean, SquaredExponentialCorr>::params(
///                 ConstantMean::default(),
///                 SquaredExponentialCorr::default())
///                 .grid_size(400)
///                 .grid_bounds(vec![(0., 1.)])
///                 .fit(&Dataset::new(xt, yt))
///                 .expect("SKI GP trained");
///
/// let xtest = Array::linspace(0., 1., 51).insert_axis(Axis(1));
/// let ypred = gp.predict(&xtest).expect("SKI GP prediction");
/// let yvariances = gp.predict_var(&xtest).expect("SKI GP prediction");
///```
///
/// # Reference:
///
/// Wilson, A. G., & Nickisch, H. (2015). [Kernel interpolation for scalable structured
/// Gaussian processes (KISS-GP)](https://arxiv.org/abs/1503.01057). ICML.
///
/// Pleiss, G., Gardner, J., Weinberger, K., & Wilson, A. G. (2018). [Constant-time predictive
/// distributions for Gaussian processes](https://arxiv.org/abs/1803.06058). ICML.
///
#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(
        serialize = "F: Serialize, Mean: Serialize, Corr: Serialize",
        deserialize = "F: Deserialize<'de>, Mean: Deserialize<'de>, Corr: Deserialize<'de>"
    ))
)]
pub struct SkiGaussianProcess<F: GridFloat, Mean: MeanModel<F>, Corr: CorrelationModel<F>> {
    /// Trained hyperparameters
    hyperparameters: Hyperparameters<F>,
    /// Inducing grid
    grid: Grid<F>,
    /// Loss (normalized negative log marginal likelihood) at trained hyperparameters
    likelihood: F,
    /// Loss history of the training
    losses: Vec<F>,
    /// Prediction caches
    inner_params: SkiInnerParams<F>,
    /// Training dataset (input, output)
    pub(crate) training_data: (Array2<F>, Array1<F>),
    /// Parameters used to fit this model
    pub(crate) params: SkiValidParams<F, Mean, Corr>,
}

/// KISS-GP with constant mean and squared exponential correlation
pub type KissGp<F> = SkiParams<F, ConstantMean, SquaredExponentialCorr>;

impl<F: GridFloat> KissGp<F> {
    /// KISS-GP parameters constructor
    pub fn params() -> SkiParams<F, ConstantMean, SquaredExponentialCorr> {
        SkiParams::new(ConstantMean(), SquaredExponentialCorr())
    }
}

impl<F: GridFloat, Mean: MeanModel<F>, Corr: CorrelationModel<F>> fmt::Display
    for SkiGaussianProcess<F, Mean, Corr>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "SkiGP(mean={}, corr={}, grid={:?}, {}, likelihood={})",
            self.params.mean,
            self.params.corr,
            self.grid.shape(),
            self.hyperparameters,
            self.likelihood,
        )
    }
}

impl<F: GridFloat, Mean: MeanModel<F>, Corr: CorrelationModel<F>>
    SkiGaussianProcess<F, Mean, Corr>
{
    /// SKI GP parameters contructor
    pub fn params<NewMean: MeanModel<F>, NewCorr: CorrelationModel<F>>(
        mean: NewMean,
        corr: NewCorr,
    ) -> SkiParams<F, NewMean, NewCorr> {
        SkiParams::new(mean, corr)
    }

    /// Predict output values at n given `x` points of nx components specified as a (n, nx) matrix.
    /// Returns n scalar output values as a vector (n,).
    pub fn predict(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array1<F>> {
        let weights = InterpolationWeights::new(&self.grid, x)?;
        Ok(self.mean_values(x, &weights))
    }

    /// Predict variance values of the latent function at n given `x` points of nx components
    /// specified as a (n, nx) matrix. Returns n variance values as (n,) column vector.
    pub fn predict_var(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array1<F>> {
        let weights = InterpolationWeights::new(&self.grid, x)?;
        self.variance_values(&weights)
    }

    /// Predict both output values and variance at n given `x` points of nx components
    pub fn predict_valvar(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<(Array1<F>, Array1<F>)> {
        let weights = InterpolationWeights::new(&self.grid, x)?;
        Ok((self.mean_values(x, &weights), self.variance_values(&weights)?))
    }

    /// Confidence region `(mean - 2 std, mean + 2 std)` at n given `x` points
    pub fn confidence_region(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<(Array1<F>, Array1<F>)> {
        let (mean, var) = self.predict_valvar(x)?;
        let two_std = var.mapv(|v| F::cast(2.) * v.sqrt());
        Ok((&mean - &two_std, &mean + &two_std))
    }

    /// Predict derivatives at a set of point `x` specified as a (n, nx) matrix where x has nx components.
    /// Returns a (n, nx) matrix containing output derivatives at x wrt each nx components
    pub fn predict_gradients(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        self.grid.check_points(x)?;
        let mut drv = self
            .params
            .mean
            .input_gradients(x, self.hyperparameters.mean_params());
        for (d, mut col) in drv.columns_mut().into_iter().enumerate() {
            let dweights = InterpolationWeights::derivatives(&self.grid, x, d)?;
            col += &dweights.interpolate(&self.inner_params.mean_cache);
        }
        Ok(drv)
    }

    fn mean_values(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        weights: &InterpolationWeights<F>,
    ) -> Array1<F> {
        self.params
            .mean
            .value(x, self.hyperparameters.mean_params())
            + weights.interpolate(&self.inner_params.mean_cache)
    }

    /// `w^T K_grid w - ||w^T C||^2` for each point interpolation weights `w`
    fn variance_values(&self, weights: &InterpolationWeights<F>) -> Result<Array1<F>> {
        let k_grid =
            KroneckerToeplitz::from_kernel(&self.params.corr, &self.grid, &self.hyperparameters)?;
        let prior = InterpolatedOperator::new(weights, &k_grid)?.diag();
        let explained = weights
            .interpolate_matrix(&self.inner_params.var_cache)
            .mapv(|v| v * v)
            .sum_axis(Axis(1));
        // Variance might be slightly negative depending on
        // the Lanczos approximation: set to zero in that case
        Ok((prior - explained).mapv(|v| if v < F::zero() { F::zero() } else { v }))
    }

    /// Trained hyperparameters
    pub fn hyperparameters(&self) -> &Hyperparameters<F> {
        &self.hyperparameters
    }

    /// Trained lengthscales, meaningful for one parameter correlation models
    pub fn lengthscales(&self) -> Array1<F> {
        self.hyperparameters.lengthscales()
    }

    /// Trained output scale
    pub fn outputscale(&self) -> F {
        self.hyperparameters.outputscale()
    }

    /// Trained noise variance
    pub fn noise_variance(&self) -> F {
        self.hyperparameters.noise_variance()
    }

    /// Loss values along the training
    pub fn losses(&self) -> &[F] {
        &self.losses
    }

    /// Normalized negative log marginal likelihood at trained hyperparameters
    pub fn likelihood(&self) -> F {
        self.likelihood
    }

    /// Inducing grid
    pub fn grid(&self) -> &Grid<F> {
        &self.grid
    }

    /// Retrieve input and output dimensions
    pub fn dims(&self) -> (usize, usize) {
        (self.training_data.0.ncols(), 1)
    }

    /// Training dataset (input, output)
    pub fn training_data(&self) -> (&Array2<F>, &Array1<F>) {
        (&self.training_data.0, &self.training_data.1)
    }
}

#[cfg(feature = "persistent")]
impl<F, Mean, Corr> SkiGaussianProcess<F, Mean, Corr>
where
    F: GridFloat + Serialize + for<'de> Deserialize<'de>,
    Mean: MeanModel<F> + Serialize + for<'de> Deserialize<'de>,
    Corr: CorrelationModel<F> + Serialize + for<'de> Deserialize<'de>,
{
    /// Save the trained model in the given JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let mut file = fs::File::create(path)?;
        let bytes = serde_json::to_vec(self)?;
        file.write_all(&bytes)?;
        Ok(())
    }

    /// Load a trained model from the given JSON file.
    pub fn load(path: &str) -> Result<Self> {
        let data = fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| GpError::LoadError(e.to_string()))
    }
}

impl<F, D, Mean, Corr> PredictInplace<ArrayBase<D, Ix2>, Array1<F>>
    for SkiGaussianProcess<F, Mean, Corr>
where
    F: GridFloat,
    D: Data<Elem = F>,
    Mean: MeanModel<F>,
    Corr: CorrelationModel<F>,
{
    fn predict_inplace(&self, x: &ArrayBase<D, Ix2>, y: &mut Array1<F>) {
        assert_eq!(
            x.nrows(),
            y.len(),
            "The number of data points must match the number of output targets."
        );

        let values = self.predict(x).expect("SKI GP Prediction");
        *y = values;
    }

    fn default_target(&self, x: &ArrayBase<D, Ix2>) -> Array1<F> {
        Array1::zeros((x.nrows(),))
    }
}

/// SKI Gausssian Process adaptator to implement `linfa::Predict` trait for variance prediction.
pub struct SkiVariancePredictor<'a, F, Mean, Corr>(pub &'a SkiGaussianProcess<F, Mean, Corr>)
where
    F: GridFloat,
    Mean: MeanModel<F>,
    Corr: CorrelationModel<F>;

impl<F, D, Mean, Corr> PredictInplace<ArrayBase<D, Ix2>, Array1<F>>
    for SkiVariancePredictor<'_, F, Mean, Corr>
where
    F: GridFloat,
    D: Data<Elem = F>,
    Mean: MeanModel<F>,
    Corr: CorrelationModel<F>,
{
    fn predict_inplace(&self, x: &ArrayBase<D, Ix2>, y: &mut Array1<F>) {
        assert_eq!(
            x.nrows(),
            y.len(),
            "The number of data points must match the number of output targets."
        );

        let values = self.0.predict_var(x).expect("SKI GP Prediction");
        *y = values;
    }

    fn default_target(&self, x: &ArrayBase<D, Ix2>) -> Array1<F> {
        Array1::zeros(x.nrows())
    }
}

impl<F: GridFloat, Mean: MeanModel<F>, Corr: CorrelationModel<F>, D: Data<Elem = F>>
    Fit<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>, GpError> for SkiValidParams<F, Mean, Corr>
{
    type Object = SkiGaussianProcess<F, Mean, Corr>;

    /// Fit SKI GP hyperparameters by minimizing the negative log marginal likelihood
    fn fit(
        &self,
        dataset: &DatasetBase<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>>,
    ) -> Result<Self::Object> {
        let x = dataset.records().view();
        let y = dataset.targets().view();
        check_training_data(&x, &y)?;

        let grid = self.build_grid(&x)?;
        let weights = InterpolationWeights::new(&grid, &x)?;
        let lik = self.marginal_likelihood(&x, &y, &grid, &weights)?;
        debug!(
            "Train SKI GP with {} points on a {:?} grid",
            x.nrows(),
            grid.shape()
        );

        let mut rng = self.rng();
        let hyperparameters0 = self.initial_hyperparameters(&x, &y, &mut rng)?;
        let mut trainable = Array1::from_elem(hyperparameters0.len(), true);
        if !self.noise.is_optimized() {
            trainable[hyperparameters0.noise_index()] = false;
        }

        let objfn = |raw: &Array1<F>| -> Result<(F, Array1<F>)> {
            let hyperparameters = hyperparameters0.with_raw(raw)?;
            let eval = lik.evaluate(&hyperparameters, &mut rng)?;
            Ok((eval.loss, eval.gradient))
        };
        let now = Instant::now();
        let optimized = optimize_params(
            objfn,
            &hyperparameters0.to_raw(),
            &trainable,
            AdamParams {
                learning_rate: self.learning_rate,
                n_iterations: self.n_iterations,
                ..AdamParams::default()
            },
        )?;
        debug!("elapsed optim = {:?}", now.elapsed().as_millis());

        let hyperparameters = hyperparameters0.with_raw(&optimized.params)?;
        let eval = lik.evaluate(&hyperparameters, &mut rng)?;
        let inner_params = self.inner_params(&x, &y, &grid, &weights, &hyperparameters)?;
        info!(
            "SKI GP trained in {} iterations: {hyperparameters}, loss = {}",
            self.n_iterations, eval.loss
        );
        Ok(SkiGaussianProcess {
            hyperparameters,
            grid,
            likelihood: eval.loss,
            losses: optimized.losses,
            inner_params,
            training_data: (x.to_owned(), y.to_owned()),
            params: self.clone(),
        })
    }
}

impl<F: GridFloat, Mean: MeanModel<F>, Corr: CorrelationModel<F>> SkiValidParams<F, Mean, Corr> {
    /// Evaluate the normalized negative log marginal likelihood of the SKI GP specified by
    /// these parameters on training data `(x, y)` at the given hyperparameters, together with
    /// its gradient wrt the raw hyperparameters. Intended for an external optimizer.
    pub fn loss(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
        hyperparameters: &Hyperparameters<F>,
    ) -> Result<LikelihoodEval<F>> {
        let (x, y) = (x.view(), y.view());
        check_training_data(&x, &y)?;
        let grid = self.build_grid(&x)?;
        let weights = InterpolationWeights::new(&grid, &x)?;
        let lik = self.marginal_likelihood(&x, &y, &grid, &weights)?;
        lik.evaluate(hyperparameters, &mut self.rng())
    }

    /// Hyperparameters used as starting point of the training on `(x, y)`
    pub fn initial_hyperparameters<R: Rng>(
        &self,
        x: &ArrayView2<F>,
        y: &ArrayView1<F>,
        rng: &mut R,
    ) -> Result<Hyperparameters<F>> {
        let mut corr = Array2::zeros((x.ncols(), self.corr.n_params()));
        for (mut row, col) in corr.rows_mut().into_iter().zip(x.columns()) {
            row.assign(&self.corr.initial_params(self.lengthscale, &col, y, rng));
        }
        Hyperparameters::new(
            corr,
            self.outputscale,
            self.noise.init(),
            self.mean.initial_params(y),
            self.noise.min(),
        )
    }

    /// Inducing grid for the given training inputs
    pub fn build_grid(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Grid<F>> {
        let dim = x.ncols();
        let bounds = match &self.grid_bounds {
            Some(bounds) if bounds.len() == dim => bounds.clone(),
            Some(bounds) => {
                return Err(GpError::DimensionError(format!(
                    "{} grid bounds given for inputs of dimension {dim}",
                    bounds.len()
                )));
            }
            None => x
                .columns()
                .into_iter()
                .map(|col| -> Result<(F, F)> {
                    let lower = *col.min().map_err(|e| {
                        GpError::InvalidValueError(format!("cannot infer grid bounds: {e}"))
                    })?;
                    let upper = *col.max().map_err(|e| {
                        GpError::InvalidValueError(format!("cannot infer grid bounds: {e}"))
                    })?;
                    if lower < upper {
                        Ok((lower, upper))
                    } else {
                        let half = F::cast(0.5);
                        Ok((lower - half, upper + half))
                    }
                })
                .collect::<Result<Vec<_>>>()?,
        };
        let sizes = match &self.grid_size {
            None => vec![choose_grid_size(x.nrows(), dim, SKI_GRID_RATIO); dim],
            Some(sizes) if sizes.len() == 1 => vec![sizes[0]; dim],
            Some(sizes) if sizes.len() == dim => sizes.clone(),
            Some(sizes) => {
                return Err(GpError::DimensionError(format!(
                    "{} grid sizes given for inputs of dimension {dim}",
                    sizes.len()
                )));
            }
        };
        Grid::new(&bounds, &sizes)
    }

    fn solver(&self) -> KrylovSolver<F> {
        KrylovSolver::new(
            self.solver_method,
            self.max_cg_iterations,
            self.cg_tolerance,
        )
    }

    fn rng(&self) -> Xoshiro256Plus {
        match self.seed {
            Some(seed) => Xoshiro256Plus::seed_from_u64(seed),
            None => Xoshiro256Plus::from_entropy(),
        }
    }

    fn marginal_likelihood<'a>(
        &self,
        x: &'a ArrayView2<F>,
        y: &'a ArrayView1<F>,
        grid: &'a Grid<F>,
        weights: &'a InterpolationWeights<F>,
    ) -> Result<MarginalLikelihood<'a, F, Mean, Corr>> {
        MarginalLikelihood::new(
            self.mean,
            self.corr,
            x.view(),
            y.view(),
            grid,
            weights,
            self.solver(),
            self.n_probes,
            self.max_lanczos_iterations,
        )
    }

    /// Prediction caches at trained hyperparameters: `K_grid W^T alpha` for the mean and
    /// `K_grid W^T R` for the variance, `R` coming from a Lanczos decomposition of the
    /// training covariance started from the training residual.
    fn inner_params(
        &self,
        x: &ArrayView2<F>,
        y: &ArrayView1<F>,
        grid: &Grid<F>,
        weights: &InterpolationWeights<F>,
        hyperparameters: &Hyperparameters<F>,
    ) -> Result<SkiInnerParams<F>> {
        let k_grid = KroneckerToeplitz::from_kernel(&self.corr, grid, hyperparameters)?;
        let cov = AddedDiagOperator::new(
            InterpolatedOperator::new(weights, &k_grid)?,
            hyperparameters.noise_variance(),
        );
        let residual = y - &self.mean.value(x, hyperparameters.mean_params());
        let alpha = self.solver().solve(&cov, &residual.view())?;
        let mean_cache = k_grid.matvec(&weights.transpose_interpolate(&alpha.x).view());

        let init = if residual.iter().any(|r| *r != F::zero()) {
            residual
        } else {
            Array1::ones(residual.len())
        };
        let lanczos = LanczosDecomposition::new(&cov, &init.view(), self.max_lanczos_iterations)?;
        let root = lanczos.inverse_factor()?;
        let mut var_cache = Array2::zeros((grid.size(), root.ncols()));
        Zip::from(var_cache.columns_mut())
            .and(root.columns())
            .par_for_each(|mut c, r| {
                c.assign(&k_grid.matvec(&weights.transpose_interpolate(&r).view()));
            });
        debug!("Variance cache of rank {}", lanczos.n_steps());
        Ok(SkiInnerParams {
            mean_cache,
            var_cache,
        })
    }
}

fn check_training_data<F: GridFloat>(x: &ArrayView2<F>, y: &ArrayView1<F>) -> Result<()> {
    if x.nrows() == 0 || x.ncols() == 0 {
        return Err(GpError::InvalidValueError(
            "training data should contain at least one point of dimension >= 1".to_string(),
        ));
    }
    if x.nrows() != y.len() {
        return Err(GpError::DimensionError(format!(
            "{} training inputs for {} training outputs",
            x.nrows(),
            y.len()
        )));
    }
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return Err(GpError::InvalidValueError(
            "training data should be finite".to_string(),
        ));
    }
    Ok(())
}
