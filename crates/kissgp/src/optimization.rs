use crate::errors::Result;
use linfa::Float;
use log::{debug, warn};
use ndarray::{Array1, Zip};

/// Settings of the Adam first order optimizer
pub(crate) struct AdamParams<F: Float> {
    pub learning_rate: F,
    pub beta1: F,
    pub beta2: F,
    pub epsilon: F,
    pub n_iterations: usize,
}

impl<F: Float> Default for AdamParams<F> {
    fn default() -> Self {
        AdamParams {
            learning_rate: F::cast(0.1),
            beta1: F::cast(0.9),
            beta2: F::cast(0.999),
            epsilon: F::cast(1e-8),
            n_iterations: 30,
        }
    }
}

/// Result of hyperparameters optimization
pub(crate) struct Optimized<F: Float> {
    /// Parameters after the last step
    pub params: Array1<F>,
    /// Loss evaluated at each step, before the parameters update
    pub losses: Vec<F>,
}

/// Minimize `objfn` returning loss and gradient wrt parameters with the Adam algorithm
/// from `param0`. Parameters where `trainable` is false are kept at their initial value.
///
/// Reference: Kingma, D. P., & Ba, J. (2015). Adam: A method for stochastic optimization. ICLR.
pub(crate) fn optimize_params<ObjF, F>(
    mut objfn: ObjF,
    param0: &Array1<F>,
    trainable: &Array1<bool>,
    adam: AdamParams<F>,
) -> Result<Optimized<F>>
where
    ObjF: FnMut(&Array1<F>) -> Result<(F, Array1<F>)>,
    F: Float,
{
    let mut params = param0.to_owned();
    let mut m = Array1::<F>::zeros(params.len());
    let mut v = Array1::<F>::zeros(params.len());
    let mut losses = Vec::with_capacity(adam.n_iterations);

    for t in 1..=adam.n_iterations {
        let (loss, mut grad) = objfn(&params)?;
        Zip::from(&mut grad)
            .and(trainable)
            .for_each(|g, &on| {
                if !on {
                    *g = F::zero()
                }
            });
        debug!("Iter {t}/{} - loss: {loss}", adam.n_iterations);
        losses.push(loss);

        let bias1 = F::one() - adam.beta1.powi(t as i32);
        let bias2 = F::one() - adam.beta2.powi(t as i32);
        Zip::from(&mut params)
            .and(&mut m)
            .and(&mut v)
            .and(&grad)
            .for_each(|p, m, v, &g| {
                *m = adam.beta1 * *m + (F::one() - adam.beta1) * g;
                *v = adam.beta2 * *v + (F::one() - adam.beta2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *p -= adam.learning_rate * m_hat / (v_hat.sqrt() + adam.epsilon);
            });
    }

    if let (Some(first), Some(last)) = (losses.first(), losses.last()) {
        if losses.len() > 1 && *last >= *first {
            warn!("Training stalled: loss went from {first} to {last}");
        }
    }
    Ok(Optimized { params, losses })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_adam_quadratic() {
        let target = array![1., -2., 0.5];
        let objfn = |p: &Array1<f64>| -> Result<(f64, Array1<f64>)> {
            let d = p - &target;
            Ok((d.dot(&d), 2. * d))
        };
        let adam = AdamParams {
            n_iterations: 500,
            ..AdamParams::default()
        };
        let res = optimize_params(objfn, &array![0., 0., 0.], &array![true, true, true], adam)
            .unwrap();
        assert_eq!(res.losses.len(), 500);
        assert_abs_diff_eq!(res.params, target, epsilon = 1e-2);
        assert!(res.losses.last().unwrap() < res.losses.first().unwrap());
    }

    #[test]
    fn test_adam_frozen_params() {
        let objfn = |p: &Array1<f64>| -> Result<(f64, Array1<f64>)> {
            Ok((p.dot(p), 2. * p))
        };
        let res = optimize_params(
            objfn,
            &array![1., 1.],
            &array![true, false],
            AdamParams::default(),
        )
        .unwrap();
        assert_abs_diff_eq!(res.params[1], 1.);
        assert!(res.params[0].abs() < 1.);
    }

    #[test]
    fn test_first_step_size() {
        // first Adam step moves every trainable parameter by the learning rate
        let objfn = |p: &Array1<f64>| -> Result<(f64, Array1<f64>)> {
            Ok((p.sum(), array![3., -0.001]))
        };
        let adam = AdamParams {
            n_iterations: 1,
            ..AdamParams::default()
        };
        let res = optimize_params(objfn, &array![0., 0.], &array![true, true], adam).unwrap();
        assert_abs_diff_eq!(res.params, array![-0.1, 0.1], epsilon = 1e-4);
    }
}
