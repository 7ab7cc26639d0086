use crate::correlation_models::CorrelationModel;
use crate::errors::{GpError, Result};
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, s};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hyperparameters of a SKI GP model.
///
/// Every positive quantity is stored as its logarithm (raw parameter) so that
/// the optimizer works in an unconstrained space. Flattened layout used by
/// the optimizer is `[corr (row major), ln outputscale, ln noise, mean]`.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(deserialize = "F: Deserialize<'de>"))
)]
pub struct Hyperparameters<F: Float> {
    /// Raw correlation parameters as a (nx, n_params) matrix
    pub(crate) corr: Array2<F>,
    /// Log of the output scale (signal variance)
    pub(crate) log_outputscale: F,
    /// Log of the noise variance in excess of the noise floor
    pub(crate) log_noise: F,
    /// Mean model parameters
    pub(crate) mean: Array1<F>,
    /// Minimal noise variance
    pub(crate) noise_floor: F,
}

impl<F: Float> Hyperparameters<F> {
    /// Constructor from raw correlation parameters and positive values
    /// for output scale and noise variance.
    pub fn new(
        corr: Array2<F>,
        outputscale: F,
        noise_variance: F,
        mean: Array1<F>,
        noise_floor: F,
    ) -> Result<Self> {
        if !(outputscale > F::zero()) {
            return Err(GpError::InvalidHyperparameterError(format!(
                "outputscale should be positive, got {outputscale}"
            )));
        }
        if !(noise_variance > noise_floor) {
            return Err(GpError::InvalidHyperparameterError(format!(
                "noise variance should be greater than noise floor {noise_floor}, got {noise_variance}"
            )));
        }
        Ok(Hyperparameters {
            corr,
            log_outputscale: outputscale.ln(),
            log_noise: (noise_variance - noise_floor).ln(),
            mean,
            noise_floor,
        })
    }

    /// Raw correlation parameters (nx, n_params)
    pub fn corr_params(&self) -> &Array2<F> {
        &self.corr
    }

    /// Lengthscales, meaningful for one parameter correlation models
    /// (squared exponential, absolute exponential, matern)
    pub fn lengthscales(&self) -> Array1<F> {
        self.corr.column(0).mapv(|v| v.exp())
    }

    /// Output scale (signal variance)
    pub fn outputscale(&self) -> F {
        self.log_outputscale.exp()
    }

    /// Noise variance
    pub fn noise_variance(&self) -> F {
        self.log_noise.exp() + self.noise_floor
    }

    /// Mean model parameters
    pub fn mean_params(&self) -> &Array1<F> {
        &self.mean
    }

    /// Input dimension
    pub fn dim(&self) -> usize {
        self.corr.nrows()
    }

    /// Total number of raw parameters
    pub fn len(&self) -> usize {
        self.corr.len() + 2 + self.mean.len()
    }

    /// Whether there is no parameter at all (never the case in practice)
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of ln outputscale in the flattened layout
    pub fn outputscale_index(&self) -> usize {
        self.corr.len()
    }

    /// Index of ln noise in the flattened layout
    pub fn noise_index(&self) -> usize {
        self.corr.len() + 1
    }

    /// Index of the first mean parameter in the flattened layout
    pub fn mean_index(&self) -> usize {
        self.corr.len() + 2
    }

    /// Flatten raw parameters
    pub fn to_raw(&self) -> Array1<F> {
        let mut raw = Array1::zeros(self.len());
        let nc = self.corr.len();
        raw.slice_mut(s![..nc]).assign(
            &Array1::from_iter(self.corr.iter().cloned()),
        );
        raw[nc] = self.log_outputscale;
        raw[nc + 1] = self.log_noise;
        raw.slice_mut(s![nc + 2..]).assign(&self.mean);
        raw
    }

    /// Build a new set of hyperparameters from flattened raw parameters
    pub fn with_raw(&self, raw: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<Self> {
        if raw.len() != self.len() {
            return Err(GpError::InvalidHyperparameterError(format!(
                "expected {} raw hyperparameters, got {}",
                self.len(),
                raw.len()
            )));
        }
        let nc = self.corr.len();
        let corr = Array2::from_shape_vec(self.corr.dim(), raw.slice(s![..nc]).to_vec())
            .map_err(|e| GpError::InvalidHyperparameterError(e.to_string()))?;
        Ok(Hyperparameters {
            corr,
            log_outputscale: raw[nc],
            log_noise: raw[nc + 1],
            mean: raw.slice(s![nc + 2..]).to_owned(),
            noise_floor: self.noise_floor,
        })
    }

    /// Check every hyperparameter leads to a finite valid model
    pub fn validate<Corr: CorrelationModel<F>>(&self, corr: &Corr) -> Result<()> {
        for row in self.corr.rows() {
            corr.check_params(&row)?;
        }
        let outputscale = self.outputscale();
        if !self.log_outputscale.is_finite() || !outputscale.is_finite() || outputscale <= F::zero()
        {
            return Err(GpError::InvalidHyperparameterError(format!(
                "outputscale exp({}) is not a finite positive value",
                self.log_outputscale
            )));
        }
        let noise = self.noise_variance();
        if !self.log_noise.is_finite() || !noise.is_finite() || noise <= F::zero() {
            return Err(GpError::InvalidHyperparameterError(format!(
                "noise variance exp({}) is not a finite positive value",
                self.log_noise
            )));
        }
        if self.mean.iter().any(|v| !v.is_finite()) {
            return Err(GpError::InvalidHyperparameterError(format!(
                "mean parameters {} are not finite",
                self.mean
            )));
        }
        Ok(())
    }
}

impl<F: Float> fmt::Display for Hyperparameters<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "corr={}, outputscale={}, noise variance={}, mean={}",
            self.corr.mapv(|v| v.exp()),
            self.outputscale(),
            self.noise_variance(),
            self.mean
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation_models::SquaredExponentialCorr;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_raw_roundtrip_layout() {
        let hp = Hyperparameters::new(array![[0.1], [0.2]], 2., 0.5, array![3.], 1e-4).unwrap();
        let raw = hp.to_raw();
        assert_eq!(raw.len(), 5);
        assert_eq!(hp.outputscale_index(), 2);
        assert_eq!(hp.noise_index(), 3);
        assert_eq!(hp.mean_index(), 4);
        assert_abs_diff_eq!(raw[2], 2f64.ln());
        assert_abs_diff_eq!(raw[4], 3.);

        let mut raw2 = raw.clone();
        raw2[0] = -1.;
        let hp2 = hp.with_raw(&raw2).unwrap();
        assert_abs_diff_eq!(hp2.lengthscales(), array![(-1f64).exp(), 0.2f64.exp()]);
        assert_abs_diff_eq!(hp2.noise_variance(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_invalid_hyperparameters() {
        assert!(Hyperparameters::new(array![[0.1]], -2., 0.5, array![], 1e-4).is_err());
        assert!(Hyperparameters::new(array![[0.1]], 2., 1e-5, array![], 1e-4).is_err());

        let hp = Hyperparameters::new(array![[0.1]], 1., 0.5, array![], 1e-4).unwrap();
        let hp = hp.with_raw(&array![f64::NAN, 0., 0.]).unwrap();
        assert!(matches!(
            hp.validate(&SquaredExponentialCorr()),
            Err(GpError::InvalidHyperparameterError(_))
        ));
        let hp = hp.with_raw(&array![0., 800., 0.]).unwrap();
        assert!(hp.validate(&SquaredExponentialCorr()).is_err());
        assert!(hp.with_raw(&array![0., 0.]).is_err());
    }
}
