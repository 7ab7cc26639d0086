//! A module for mean models of the GP prior.
//!
//! The following models are implemented:
//! * constant (one learnable constant),
//! * zero (no parameter)

use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use paste::paste;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

/// A trait for mean models used in SKI GP regression
pub trait MeanModel<F: Float>: Clone + Copy + Default + fmt::Display + fmt::Debug + Sync {
    /// Number of learnable parameters of the mean
    fn n_params(&self) -> usize;

    /// Initial parameter values given training outputs `y`
    fn initial_params(&self, y: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Array1<F>;

    /// Compute mean values at `x` points specified as (n, nx) matrix
    fn value(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        params: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array1<F>;

    /// Derivatives of the mean values wrt the parameters as a (n, n_params) matrix
    fn jacobian(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        params: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array2<F>;

    /// Derivatives of the mean values wrt the `x` components as a (n, nx) matrix
    fn input_gradients(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        params: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array2<F>;
}

/// A constant function as mean of the GP
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct ConstantMean();

impl<F: Float> MeanModel<F> for ConstantMean {
    fn n_params(&self) -> usize {
        1
    }

    /// Start from the empirical mean of the outputs
    fn initial_params(&self, y: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Array1<F> {
        Array1::from_elem(1, y.mean().unwrap_or_else(F::zero))
    }

    /// mean(x) = [c, ..., c].T
    fn value(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        params: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array1<F> {
        Array1::from_elem(x.nrows(), params[0])
    }

    fn jacobian(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        _params: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array2<F> {
        Array2::ones((x.nrows(), 1))
    }

    fn input_gradients(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        _params: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array2<F> {
        Array2::zeros(x.raw_dim())
    }
}

/// A zero function as mean of the GP
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct ZeroMean();

impl<F: Float> MeanModel<F> for ZeroMean {
    fn n_params(&self) -> usize {
        0
    }

    fn initial_params(&self, _y: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Array1<F> {
        Array1::zeros(0)
    }

    fn value(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        _params: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array1<F> {
        Array1::zeros(x.nrows())
    }

    fn jacobian(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        _params: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array2<F> {
        Array2::zeros((x.nrows(), 0))
    }

    fn input_gradients(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        _params: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array2<F> {
        Array2::zeros(x.raw_dim())
    }
}

macro_rules! declare_mean_util_impls {
    ($mean:ident) => {
        paste! {
            impl fmt::Display for [<$mean Mean>] {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, "{}Mean", stringify!($mean))
                }
            }

            impl From<[<$mean Mean>]> for String {
                fn from(_item: [<$mean Mean>]) -> Self {
                    [<$mean Mean>]().to_string()
                }
            }

            impl TryFrom<String> for [<$mean Mean>] {
                type Error = &'static str;
                fn try_from(s: String) -> Result<Self, Self::Error> {
                    if s == stringify!([<$mean Mean>]) {
                        Ok(Self::default())
                    } else {
                        Err("Bad string value for [<$mean Mean>], should be \'[<$mean Mean>]\'")
                    }
                }
            }
        }
    };
}

declare_mean_util_impls!(Constant);
declare_mean_util_impls!(Zero);

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_constant() {
        let x = array![[1., 2.], [3., 4.], [5., 6.]];
        let params = ConstantMean().initial_params(&array![1., 2., 6.]);
        assert_abs_diff_eq!(params, array![3.]);
        assert_abs_diff_eq!(ConstantMean().value(&x, &params), array![3., 3., 3.]);
        assert_abs_diff_eq!(
            ConstantMean().jacobian(&x, &params),
            array![[1.], [1.], [1.]]
        );
    }

    #[test]
    fn test_zero() {
        let x = array![[1.], [3.]];
        let params = ZeroMean().initial_params(&array![1., 2.]);
        assert_eq!(MeanModel::<f64>::n_params(&ZeroMean()), 0);
        assert_abs_diff_eq!(ZeroMean().value(&x, &params), array![0., 0.]);
        assert_eq!(ZeroMean().jacobian(&x, &params).dim(), (2, 0));
        assert_eq!(ZeroMean().input_gradients(&x, &params), Array2::<f64>::zeros((2, 1)));
    }

    #[cfg(feature = "serializable")]
    #[test]
    fn test_save_load() {
        let json = serde_json::to_string(&ConstantMean()).unwrap();
        assert_eq!(json, r#""ConstantMean""#);
        let mean: ConstantMean = serde_json::from_str(&json).unwrap();
        assert_eq!(mean, ConstantMean());
        assert!(serde_json::from_str::<ZeroMean>(&json).is_err());
    }

    #[test]
    fn test_utils() {
        assert_eq!("ConstantMean", ConstantMean().to_string());
        assert_eq!(
            ZeroMean(),
            ZeroMean::try_from("ZeroMean".to_string()).unwrap()
        );
    }
}
