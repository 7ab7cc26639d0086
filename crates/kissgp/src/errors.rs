use thiserror::Error;

/// A result type for SKI GP regression algorithm
pub type Result<T> = std::result::Result<T, GpError>;

/// An error when using [`SkiGaussianProcess`](crate::SkiGaussianProcess) algorithm
#[derive(Error, Debug)]
pub enum GpError {
    /// When LikelihoodComputation computation fails
    #[error("LikelihoodComputation computation error: {0}")]
    LikelihoodComputationError(String),
    #[error(transparent)]
    /// When linear algebra computation fails
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When a linfa error occurs
    #[error(transparent)]
    LinfaError(#[from] linfa::error::Error),
    /// When a point lies outside the inducing grid bounds
    #[error("OutOfRange error: {0}")]
    OutOfRangeError(String),
    /// When a kernel is given a degenerate hyperparameter (nan, inf, non positive)
    #[error("InvalidHyperparameter error: {0}")]
    InvalidHyperparameterError(String),
    /// When input dimension does not match the one of the model
    #[error("Dimension error: {0}")]
    DimensionError(String),
    #[cfg(feature = "persistent")]
    #[error("Save error: {0}")]
    /// When error during saving
    SaveError(#[from] serde_json::Error),
    /// When error during loading
    #[error("Load IO error")]
    LoadIoError(#[from] std::io::Error),
    /// When error during loading
    #[error("Load error: {0}")]
    LoadError(String),
    /// When error dur to a bad value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
}
