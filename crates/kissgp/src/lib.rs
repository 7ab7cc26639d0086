//! This library implements scalable [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process) regression
//! with structured kernel interpolation, also known as KISS-GP.
//!
//! The covariance of the training points is approximated by interpolating the kernel evaluated on a
//! regular inducing grid: `K ≈ W K_grid W^T`, where `W` holds sparse cubic interpolation weights and
//! `K_grid` is a Kronecker product of symmetric Toeplitz matrices. Matrix-vector products with the
//! training covariance then cost O(N + M log M) in processing time and O(N + M) in memory where N is the
//! number of training points and M the number of grid nodes, the covariance matrix being never formed.
//!
//! Training relies on Krylov methods only: linear systems are solved with conjugate residual (or
//! conjugate gradient) iterations, the log determinant of the marginal likelihood is estimated by
//! stochastic Lanczos quadrature and its derivatives by Hutchinson trace estimation.
//! Hyperparameters are optimized with Adam.
//!
//! The SKI GP method is implemented by [SkiGaussianProcess] parameterized by [SkiParams].
//! Building blocks (grid, interpolation, structured operators, solvers, likelihood) are public modules.
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod algorithm;
pub mod correlation_models;
mod errors;
pub mod grid;
mod hyperparameters;
pub mod interpolation;
pub mod lanczos;
pub mod likelihood;
pub mod mean_models;
pub mod operators;
pub mod solver;

mod parameters;

mod optimization;

pub use algorithm::*;
pub use errors::*;
pub use hyperparameters::*;
pub use parameters::*;

/// Floating point type of SKI GP computations, usable by linfa algorithms and FFTs
pub trait GridFloat: linfa::Float + rustfft::FftNum {}

impl<T: linfa::Float + rustfft::FftNum> GridFloat for T {}
