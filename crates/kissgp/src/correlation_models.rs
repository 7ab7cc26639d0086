//! A module for stationary correlation models used to build the covariance kernel of the GP model.
//!
//! A correlation model is a one-dimensional function `k(tau; theta)` of the lag `tau = x - x'`.
//! The kernel of a multi-dimensional input is the product of one correlation per dimension
//! scaled by the output scale, which makes it separable: evaluated on a regular grid it is
//! a Kronecker product of symmetric Toeplitz matrices.
//!
//! Hyperparameters are handled in log space (raw parameters) so that any finite raw value
//! maps to a valid positive hyperparameter.
//!
//! The following correlation models are implemented:
//! * squared exponential (RBF),
//! * absolute exponential,
//! * matern 3/2,
//! * matern 5/2,
//! * spectral mixture.

use crate::errors::{GpError, Result};
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2, Zip};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::{Distribution, StandardNormal};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

/// A trait for using a stationary correlation model in SKI GP regression
pub trait CorrelationModel<F: Float>:
    Clone + Copy + Default + fmt::Display + fmt::Debug + Send + Sync
{
    /// Number of raw hyperparameters for one input dimension
    fn n_params(&self) -> usize;

    /// Raw (log space) hyperparameters corresponding to the given `lengthscale`
    fn params_from_lengthscale(&self, lengthscale: F) -> Array1<F>;

    /// Initial raw hyperparameters for one input dimension.
    ///
    /// `x` is the training input column of the dimension and `y` the training outputs.
    /// Default is to use the given `lengthscale`, data driven models override it.
    fn initial_params<R: Rng>(
        &self,
        lengthscale: F,
        _x: &ArrayBase<impl Data<Elem = F>, Ix1>,
        _y: &ArrayBase<impl Data<Elem = F>, Ix1>,
        _rng: &mut R,
    ) -> Array1<F> {
        self.params_from_lengthscale(lengthscale)
    }

    /// Correlation value at lag `tau` given raw hyperparameters `params`
    fn value(&self, tau: F, params: &ArrayBase<impl Data<Elem = F>, Ix1>) -> F;

    /// Derivatives of the correlation at lag `tau` wrt each raw hyperparameter
    fn gradient(&self, tau: F, params: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Array1<F>;

    /// Check raw hyperparameters map to finite positive values
    fn check_params(&self, params: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<()> {
        if params.len() != self.n_params() {
            return Err(GpError::InvalidHyperparameterError(format!(
                "{} expects {} hyperparameters, got {}",
                self,
                self.n_params(),
                params.len()
            )));
        }
        for &p in params.iter() {
            let v = p.exp();
            if !p.is_finite() || !v.is_finite() || v <= F::zero() {
                return Err(GpError::InvalidHyperparameterError(format!(
                    "{self} hyperparameter exp({p}) is not a finite positive value"
                )));
            }
        }
        Ok(())
    }
}

/// Dense kernel matrix between `a` (p, nx) and `b` (q, nx) points.
///
/// `params` holds the raw hyperparameters as a (nx, n_params) matrix,
/// the result is the (p, q) matrix `outputscale * prod_j k(a_ij - b_kj)`.
pub fn covariance<F: Float, Corr: CorrelationModel<F>>(
    corr: &Corr,
    a: &ArrayBase<impl Data<Elem = F>, Ix2>,
    b: &ArrayBase<impl Data<Elem = F>, Ix2>,
    params: &ArrayBase<impl Data<Elem = F>, Ix2>,
    outputscale: F,
) -> Result<Array2<F>> {
    if a.ncols() != b.ncols() || a.ncols() != params.nrows() {
        return Err(GpError::DimensionError(format!(
            "covariance between {} and {} dimensional points with {} dimensional hyperparameters",
            a.ncols(),
            b.ncols(),
            params.nrows()
        )));
    }
    for p in params.rows() {
        corr.check_params(&p)?;
    }
    let mut k = Array2::from_elem((a.nrows(), b.nrows()), outputscale);
    Zip::indexed(&mut k).for_each(|(i, j), kij| {
        Zip::from(a.row(i))
            .and(b.row(j))
            .and(params.rows())
            .for_each(|ai, bj, p| *kij *= corr.value(*ai - *bj, &p));
    });
    Ok(k)
}

macro_rules! declare_corr_util_impls {
    ($corr:ident, $name:literal) => {
        impl From<$corr> for String {
            fn from(_item: $corr) -> String {
                $name.to_string()
            }
        }

        impl TryFrom<String> for $corr {
            type Error = &'static str;
            fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
                if s == $name {
                    Ok(Self::default())
                } else {
                    Err(concat!("Bad string value for ", stringify!($corr), ", should be '", $name, "'"))
                }
            }
        }

        impl fmt::Display for $corr {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, $name)
            }
        }
    };
}

/// Squared exponential (RBF) correlation model
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct SquaredExponentialCorr();

impl<F: Float> CorrelationModel<F> for SquaredExponentialCorr {
    fn n_params(&self) -> usize {
        1
    }

    fn params_from_lengthscale(&self, lengthscale: F) -> Array1<F> {
        Array1::from_elem(1, lengthscale.ln())
    }

    /// exp( - (tau / l)^2 / 2 )
    fn value(&self, tau: F, params: &ArrayBase<impl Data<Elem = F>, Ix1>) -> F {
        let r = tau / params[0].exp();
        F::exp(F::cast(-0.5) * r * r)
    }

    fn gradient(&self, tau: F, params: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Array1<F> {
        let r = tau / params[0].exp();
        let r2 = r * r;
        Array1::from_elem(1, r2 * F::exp(F::cast(-0.5) * r2))
    }
}

declare_corr_util_impls!(SquaredExponentialCorr, "SquaredExponential");

/// Absolute exponential correlation model
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct AbsoluteExponentialCorr();

impl<F: Float> CorrelationModel<F> for AbsoluteExponentialCorr {
    fn n_params(&self) -> usize {
        1
    }

    fn params_from_lengthscale(&self, lengthscale: F) -> Array1<F> {
        Array1::from_elem(1, lengthscale.ln())
    }

    /// exp( - |tau| / l )
    fn value(&self, tau: F, params: &ArrayBase<impl Data<Elem = F>, Ix1>) -> F {
        F::exp(-tau.abs() / params[0].exp())
    }

    fn gradient(&self, tau: F, params: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Array1<F> {
        let r = tau.abs() / params[0].exp();
        Array1::from_elem(1, r * F::exp(-r))
    }
}

declare_corr_util_impls!(AbsoluteExponentialCorr, "AbsoluteExponential");

/// Matern 3/2 correlation model
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct Matern32Corr();

impl<F: Float> CorrelationModel<F> for Matern32Corr {
    fn n_params(&self) -> usize {
        1
    }

    fn params_from_lengthscale(&self, lengthscale: F) -> Array1<F> {
        Array1::from_elem(1, lengthscale.ln())
    }

    /// (1 + sqrt(3) * |tau| / l) exp( - sqrt(3) * |tau| / l )
    fn value(&self, tau: F, params: &ArrayBase<impl Data<Elem = F>, Ix1>) -> F {
        let r = F::cast(3.).sqrt() * tau.abs() / params[0].exp();
        (F::one() + r) * F::exp(-r)
    }

    fn gradient(&self, tau: F, params: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Array1<F> {
        let r = F::cast(3.).sqrt() * tau.abs() / params[0].exp();
        Array1::from_elem(1, r * r * F::exp(-r))
    }
}

declare_corr_util_impls!(Matern32Corr, "Matern32");

/// Matern 5/2 correlation model
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct Matern52Corr();

impl<F: Float> CorrelationModel<F> for Matern52Corr {
    fn n_params(&self) -> usize {
        1
    }

    fn params_from_lengthscale(&self, lengthscale: F) -> Array1<F> {
        Array1::from_elem(1, lengthscale.ln())
    }

    /// (1 + sqrt(5) * |tau| / l + (5/3) * (tau / l)^2) exp( - sqrt(5) * |tau| / l )
    fn value(&self, tau: F, params: &ArrayBase<impl Data<Elem = F>, Ix1>) -> F {
        let r = F::cast(5.).sqrt() * tau.abs() / params[0].exp();
        (F::one() + r + r * r / F::cast(3.)) * F::exp(-r)
    }

    fn gradient(&self, tau: F, params: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Array1<F> {
        let r = F::cast(5.).sqrt() * tau.abs() / params[0].exp();
        Array1::from_elem(1, r * r / F::cast(3.) * (F::one() + r) * F::exp(-r))
    }
}

declare_corr_util_impls!(Matern52Corr, "Matern52");

/// Spectral mixture correlation model
///
///   q
///  sum w_i exp( - 2 pi^2 tau^2 s_i^2 ) cos( 2 pi tau mu_i )
///  i=1
///
/// Raw hyperparameters are laid out as `[ln w_1..ln w_q, ln mu_1..ln mu_q, ln s_1..ln s_q]`.
///
/// Reference: Wilson, A. G., & Adams, R. P. (2013).
/// [Gaussian Process Kernels for Pattern Discovery and Extrapolation](https://arxiv.org/abs/1302.4245)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct SpectralMixtureCorr {
    n_mixtures: usize,
}

impl Default for SpectralMixtureCorr {
    fn default() -> Self {
        SpectralMixtureCorr { n_mixtures: 4 }
    }
}

impl SpectralMixtureCorr {
    /// Constructor with `n_mixtures` gaussian components in the spectral density
    pub fn new(n_mixtures: usize) -> Self {
        SpectralMixtureCorr {
            n_mixtures: n_mixtures.max(1),
        }
    }

    /// Number of mixture components
    pub fn n_mixtures(&self) -> usize {
        self.n_mixtures
    }
}

impl<F: Float> CorrelationModel<F> for SpectralMixtureCorr {
    fn n_params(&self) -> usize {
        3 * self.n_mixtures
    }

    /// Equal weights, zero-ish frequencies and `1 / lengthscale` spectral scales
    fn params_from_lengthscale(&self, lengthscale: F) -> Array1<F> {
        let q = self.n_mixtures;
        let mut params = Array1::zeros(3 * q);
        for i in 0..q {
            params[i] = (F::one() / F::cast(q)).ln();
            params[q + i] = (F::cast(i + 1) / (F::cast(2 * q) * lengthscale)).ln();
            params[2 * q + i] = (F::one() / lengthscale).ln();
        }
        params
    }

    /// Inverse of scales drawn from |N(0, max_dist^2)|,
    /// means from Uniform(0, 0.5 / min_dist),
    /// weights set to std(y) / n_mixtures.
    fn initial_params<R: Rng>(
        &self,
        lengthscale: F,
        x: &ArrayBase<impl Data<Elem = F>, Ix1>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
        rng: &mut R,
    ) -> Array1<F> {
        let mut xs = x.to_vec();
        xs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let max_dist = match (xs.first(), xs.last()) {
            (Some(first), Some(last)) => *last - *first,
            _ => F::zero(),
        };
        let min_dist = xs
            .windows(2)
            .map(|w| w[1] - w[0])
            .filter(|d| *d > F::zero())
            .fold(F::infinity(), |a, b| a.min(b));
        if max_dist <= F::zero() || !min_dist.is_finite() {
            log::warn!("Not enough distinct points to initialize {self} from data");
            return self.params_from_lengthscale(lengthscale);
        }
        let y_std = if y.len() > 1 {
            y.std(F::one())
        } else {
            F::one()
        };
        let y_std = if y_std > F::zero() { y_std } else { F::one() };

        let q = self.n_mixtures;
        let mut params = Array1::zeros(3 * q);
        let tiny = F::epsilon();
        for i in 0..q {
            params[i] = (y_std / F::cast(q)).ln();
            let u: f64 = rng.gen_range(f64::EPSILON..1.0);
            params[q + i] = (F::cast(u) * F::cast(0.5) / min_dist).ln();
            let n: f64 = StandardNormal.sample(rng);
            let scale = (F::cast(n) * max_dist).abs().max(tiny);
            params[2 * q + i] = (F::one() / scale).ln();
        }
        params
    }

    fn value(&self, tau: F, params: &ArrayBase<impl Data<Elem = F>, Ix1>) -> F {
        let q = self.n_mixtures;
        let two_pi = F::cast(2. * std::f64::consts::PI);
        let mut k = F::zero();
        for i in 0..q {
            let w = params[i].exp();
            let mu = params[q + i].exp();
            let s = params[2 * q + i].exp();
            let exp_term = F::exp(-F::cast(0.5) * (two_pi * tau * s).powi(2));
            let cos_term = (two_pi * tau * mu).cos();
            k += w * exp_term * cos_term;
        }
        k
    }

    fn gradient(&self, tau: F, params: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Array1<F> {
        let q = self.n_mixtures;
        let two_pi = F::cast(2. * std::f64::consts::PI);
        let mut grad = Array1::zeros(3 * q);
        for i in 0..q {
            let w = params[i].exp();
            let mu = params[q + i].exp();
            let s = params[2 * q + i].exp();
            let a = (two_pi * tau * s).powi(2);
            let exp_term = F::exp(-F::cast(0.5) * a);
            let phase = two_pi * tau * mu;
            grad[i] = w * exp_term * phase.cos();
            grad[q + i] = -w * exp_term * phase.sin() * phase;
            grad[2 * q + i] = -w * exp_term * phase.cos() * a;
        }
        grad
    }
}

impl fmt::Display for SpectralMixtureCorr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SpectralMixture({})", self.n_mixtures)
    }
}
