use crate::correlation_models::CorrelationModel;
use crate::errors::{GpError, Result};
use crate::grid::GRID_MIN_SIZE;
use crate::mean_models::MeanModel;
use crate::solver::SolverMethod;
use linfa::{Float, ParamGuard};

#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Default number of hyperparameters optimization steps
pub const SKI_N_ITERATIONS: usize = 30;
/// Default learning rate of hyperparameters optimization
pub const SKI_LEARNING_RATE: f64 = 0.1;
/// Default max number of iterations of linear solves
pub const SKI_MAX_CG_ITERATIONS: usize = 100;
/// Default relative residual tolerance of linear solves
pub const SKI_CG_TOLERANCE: f64 = 1e-6;
/// Default number of probe vectors of stochastic estimations
pub const SKI_N_PROBES: usize = 10;
/// Default max number of Lanczos iterations
pub const SKI_MAX_LANCZOS_ITERATIONS: usize = 30;

/// An enum to represent a scalar hyper parameter tuning
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum ParamTuning<F: Float> {
    /// Constant parameter (ie given not estimated)
    Fixed(F),
    /// Parameter optimized starting from `init`, kept greater than `min`
    Optimized {
        /// Initial guess for the parameter
        init: F,
        /// Lower bound of the parameter
        min: F,
    },
}

impl<F: Float> Default for ParamTuning<F> {
    fn default() -> Self {
        ParamTuning::Optimized {
            init: F::cast(ParamTuning::<F>::DEFAULT_NOISE_INIT),
            min: F::cast(ParamTuning::<F>::DEFAULT_NOISE_MIN),
        }
    }
}

impl<F: Float> ParamTuning<F> {
    /// Default initial noise variance
    pub const DEFAULT_NOISE_INIT: f64 = 0.1;
    /// Default noise variance lower bound
    pub const DEFAULT_NOISE_MIN: f64 = 1e-4;

    /// Get initial value
    pub fn init(&self) -> F {
        match self {
            ParamTuning::Fixed(v) => *v,
            ParamTuning::Optimized { init, min: _ } => *init,
        }
    }

    /// Lower bound of the value, zero when fixed
    pub fn min(&self) -> F {
        match self {
            ParamTuning::Fixed(_) => F::zero(),
            ParamTuning::Optimized { init: _, min } => *min,
        }
    }

    /// Whether the parameter is optimized
    pub fn is_optimized(&self) -> bool {
        matches!(self, ParamTuning::Optimized { .. })
    }
}

/// A set of validated SKI GP parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(
        serialize = "F: Serialize, Mean: Serialize, Corr: Serialize",
        deserialize = "F: Deserialize<'de>, Mean: Deserialize<'de>, Corr: Deserialize<'de>"
    ))
)]
pub struct SkiValidParams<F: Float, Mean: MeanModel<F>, Corr: CorrelationModel<F>> {
    /// Mean model of the GP prior
    pub(crate) mean: Mean,
    /// Correlation model of the kernel
    pub(crate) corr: Corr,
    /// Number of grid nodes, one value for all dimensions or one per dimension.
    /// Chosen from the number of training points when not set
    pub(crate) grid_size: Option<Vec<usize>>,
    /// Grid bounds (lower, upper) per dimension, inferred from training inputs when not set
    pub(crate) grid_bounds: Option<Vec<(F, F)>>,
    /// Initial lengthscale
    pub(crate) lengthscale: F,
    /// Initial output scale
    pub(crate) outputscale: F,
    /// Noise variance tuning
    pub(crate) noise: ParamTuning<F>,
    /// Number of optimization steps
    pub(crate) n_iterations: usize,
    /// Optimizer learning rate
    pub(crate) learning_rate: F,
    /// Krylov method of linear solves
    pub(crate) solver_method: SolverMethod,
    /// Max number of iterations of linear solves
    pub(crate) max_cg_iterations: usize,
    /// Relative residual tolerance of linear solves
    pub(crate) cg_tolerance: F,
    /// Number of probe vectors of log determinant and trace estimations
    pub(crate) n_probes: usize,
    /// Max number of Lanczos iterations
    pub(crate) max_lanczos_iterations: usize,
    /// Random generator seed
    pub(crate) seed: Option<u64>,
}

impl<F: Float, Mean: MeanModel<F>, Corr: CorrelationModel<F>> Default
    for SkiValidParams<F, Mean, Corr>
{
    fn default() -> SkiValidParams<F, Mean, Corr> {
        SkiValidParams {
            mean: Mean::default(),
            corr: Corr::default(),
            grid_size: None,
            grid_bounds: None,
            lengthscale: F::cast(0.5),
            outputscale: F::one(),
            noise: ParamTuning::default(),
            n_iterations: SKI_N_ITERATIONS,
            learning_rate: F::cast(SKI_LEARNING_RATE),
            solver_method: SolverMethod::default(),
            max_cg_iterations: SKI_MAX_CG_ITERATIONS,
            cg_tolerance: F::cast(SKI_CG_TOLERANCE),
            n_probes: SKI_N_PROBES,
            max_lanczos_iterations: SKI_MAX_LANCZOS_ITERATIONS,
            seed: None,
        }
    }
}

impl<F: Float, Mean: MeanModel<F>, Corr: CorrelationModel<F>> SkiValidParams<F, Mean, Corr> {
    /// Get mean model
    pub fn mean(&self) -> &Mean {
        &self.mean
    }

    /// Get correlation model
    pub fn corr(&self) -> &Corr {
        &self.corr
    }

    /// Get grid size setting
    pub fn grid_size(&self) -> Option<&Vec<usize>> {
        self.grid_size.as_ref()
    }

    /// Get grid bounds setting
    pub fn grid_bounds(&self) -> Option<&Vec<(F, F)>> {
        self.grid_bounds.as_ref()
    }

    /// Get initial lengthscale
    pub fn lengthscale(&self) -> F {
        self.lengthscale
    }

    /// Get initial output scale
    pub fn outputscale(&self) -> F {
        self.outputscale
    }

    /// Get noise variance tuning
    pub fn noise(&self) -> &ParamTuning<F> {
        &self.noise
    }

    /// Get number of optimization steps
    pub fn n_iterations(&self) -> usize {
        self.n_iterations
    }

    /// Get learning rate
    pub fn learning_rate(&self) -> F {
        self.learning_rate
    }

    /// Get Krylov solver method
    pub fn solver_method(&self) -> SolverMethod {
        self.solver_method
    }

    /// Get max number of linear solver iterations
    pub fn max_cg_iterations(&self) -> usize {
        self.max_cg_iterations
    }

    /// Get linear solver relative tolerance
    pub fn cg_tolerance(&self) -> F {
        self.cg_tolerance
    }

    /// Get number of probe vectors
    pub fn n_probes(&self) -> usize {
        self.n_probes
    }

    /// Get max number of Lanczos iterations
    pub fn max_lanczos_iterations(&self) -> usize {
        self.max_lanczos_iterations
    }

    /// Get random generator seed
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }
}

#[derive(Clone, Debug)]
/// The set of hyperparameters that can be specified for the execution of
/// the [SKI GP algorithm](struct.SkiGaussianProcess.html).
pub struct SkiParams<F: Float, Mean: MeanModel<F>, Corr: CorrelationModel<F>>(
    SkiValidParams<F, Mean, Corr>,
);

impl<F: Float, Mean: MeanModel<F>, Corr: CorrelationModel<F>> SkiParams<F, Mean, Corr> {
    /// A constructor for SKI GP parameters given mean and correlation models
    pub fn new(mean: Mean, corr: Corr) -> SkiParams<F, Mean, Corr> {
        Self(SkiValidParams {
            mean,
            corr,
            ..Default::default()
        })
    }

    /// A constructor for SKI GP parameters from validated parameters
    pub fn new_from_valid(params: &SkiValidParams<F, Mean, Corr>) -> Self {
        Self(params.clone())
    }

    /// Set mean model.
    pub fn mean(mut self, mean: Mean) -> Self {
        self.0.mean = mean;
        self
    }

    /// Set correlation model.
    pub fn corr(mut self, corr: Corr) -> Self {
        self.0.corr = corr;
        self
    }

    /// Set the same number of grid nodes for every dimension
    pub fn grid_size(mut self, grid_size: usize) -> Self {
        self.0.grid_size = Some(vec![grid_size]);
        self
    }

    /// Set the number of grid nodes of each dimension
    pub fn grid_sizes(mut self, grid_sizes: Vec<usize>) -> Self {
        self.0.grid_size = Some(grid_sizes);
        self
    }

    /// Set grid bounds `(lower, upper)` of each dimension.
    ///
    /// Training and prediction points have to lie within these bounds.
    pub fn grid_bounds(mut self, grid_bounds: Vec<(F, F)>) -> Self {
        self.0.grid_bounds = Some(grid_bounds);
        self
    }

    /// Set initial lengthscale of the correlation model
    pub fn lengthscale(mut self, lengthscale: F) -> Self {
        self.0.lengthscale = lengthscale;
        self
    }

    /// Set initial output scale
    pub fn outputscale(mut self, outputscale: F) -> Self {
        self.0.outputscale = outputscale;
        self
    }

    /// Set noise variance tuning
    pub fn noise(mut self, noise: ParamTuning<F>) -> Self {
        self.0.noise = noise;
        self
    }

    /// Set the number of hyperparameters optimization steps
    pub fn n_iterations(mut self, n_iterations: usize) -> Self {
        self.0.n_iterations = n_iterations;
        self
    }

    /// Set the optimizer learning rate
    pub fn learning_rate(mut self, learning_rate: F) -> Self {
        self.0.learning_rate = learning_rate;
        self
    }

    /// Set the Krylov method of linear solves
    pub fn solver_method(mut self, solver_method: SolverMethod) -> Self {
        self.0.solver_method = solver_method;
        self
    }

    /// Set the max number of iterations of linear solves
    pub fn max_cg_iterations(mut self, max_cg_iterations: usize) -> Self {
        self.0.max_cg_iterations = max_cg_iterations;
        self
    }

    /// Set the relative residual tolerance of linear solves
    pub fn cg_tolerance(mut self, cg_tolerance: F) -> Self {
        self.0.cg_tolerance = cg_tolerance;
        self
    }

    /// Set the number of probe vectors.
    ///
    /// When greater than the number of training points, estimations are exact.
    pub fn n_probes(mut self, n_probes: usize) -> Self {
        self.0.n_probes = n_probes;
        self
    }

    /// Set the max number of Lanczos iterations
    pub fn max_lanczos_iterations(mut self, max_lanczos_iterations: usize) -> Self {
        self.0.max_lanczos_iterations = max_lanczos_iterations;
        self
    }

    /// Set the seed of the random generator used for probe vectors
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.0.seed = seed;
        self
    }
}

impl<F: Float, Mean: MeanModel<F>, Corr: CorrelationModel<F>>
    From<SkiValidParams<F, Mean, Corr>> for SkiParams<F, Mean, Corr>
{
    fn from(valid: SkiValidParams<F, Mean, Corr>) -> Self {
        SkiParams(valid)
    }
}

fn check_positive<F: Float>(name: &str, value: F) -> Result<()> {
    if !(value > F::zero()) || !value.is_finite() {
        return Err(GpError::InvalidValueError(format!(
            "`{name}` should be a finite positive value, got {value}"
        )));
    }
    Ok(())
}

impl<F: Float, Mean: MeanModel<F>, Corr: CorrelationModel<F>> ParamGuard
    for SkiParams<F, Mean, Corr>
{
    type Checked = SkiValidParams<F, Mean, Corr>;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        let params = &self.0;
        if let Some(sizes) = &params.grid_size {
            if sizes.is_empty() {
                return Err(GpError::InvalidValueError(
                    "`grid_size` cannot be empty".to_string(),
                ));
            }
            if let Some(size) = sizes.iter().find(|s| **s < GRID_MIN_SIZE) {
                return Err(GpError::InvalidValueError(format!(
                    "`grid_size` should be at least {GRID_MIN_SIZE}, got {size}"
                )));
            }
        }
        if let Some(bounds) = &params.grid_bounds {
            if bounds.is_empty() {
                return Err(GpError::InvalidValueError(
                    "`grid_bounds` cannot be empty".to_string(),
                ));
            }
            for (lower, upper) in bounds.iter() {
                if !lower.is_finite() || !upper.is_finite() || lower >= upper {
                    return Err(GpError::InvalidValueError(format!(
                        "`grid_bounds` should be finite with lower < upper, got ({lower}, {upper})"
                    )));
                }
            }
            if let Some(sizes) = &params.grid_size {
                if sizes.len() > 1 && sizes.len() != bounds.len() {
                    return Err(GpError::InvalidValueError(format!(
                        "{} grid sizes given for {} grid bounds",
                        sizes.len(),
                        bounds.len()
                    )));
                }
            }
        }
        check_positive("lengthscale", params.lengthscale)?;
        check_positive("outputscale", params.outputscale)?;
        check_positive("learning_rate", params.learning_rate)?;
        check_positive("cg_tolerance", params.cg_tolerance)?;
        match params.noise {
            ParamTuning::Fixed(v) => check_positive("noise", v)?,
            ParamTuning::Optimized { init, min } => {
                if !(min >= F::zero()) || !(init > min) || !init.is_finite() {
                    return Err(GpError::InvalidValueError(format!(
                        "noise should be optimized from a finite init ({init}) greater than min ({min}) >= 0"
                    )));
                }
            }
        }
        if params.max_cg_iterations == 0 || params.n_probes == 0 || params.max_lanczos_iterations == 0
        {
            return Err(GpError::InvalidValueError(
                "`max_cg_iterations`, `n_probes` and `max_lanczos_iterations` should be positive"
                    .to_string(),
            ));
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}
