//! Lazily evaluated covariance operators.
//!
//! The SKI covariance `W K_grid W^T + noise * I` of the training points is never formed:
//! it is only accessed through matrix-vector products. `K_grid` is the kernel evaluated
//! on the regular grid, a Kronecker product of symmetric Toeplitz matrices (one per
//! dimension) whose products cost `O(m log m)` thanks to a circulant embedding and FFT.

use crate::correlation_models::CorrelationModel;
use crate::errors::{GpError, Result};
use crate::grid::Grid;
use crate::hyperparameters::Hyperparameters;
use crate::interpolation::InterpolationWeights;
use crate::GridFloat;
use linfa::Float;
use ndarray::{Array1, Array2, ArrayView1, Zip, s};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::fmt;
use std::sync::Arc;

/// A symmetric linear operator only accessed through matrix-vector products
pub trait LinearOperator<F: Float>: Sync {
    /// Number of rows (and columns)
    fn size(&self) -> usize;

    /// Product of the operator with `v`
    fn matvec(&self, v: &ArrayView1<F>) -> Array1<F>;

    /// Diagonal of the operator
    fn diag(&self) -> Array1<F> {
        self.to_dense().diag().to_owned()
    }

    /// Dense matrix, built column by column from products with unit vectors
    fn to_dense(&self) -> Array2<F> {
        let n = self.size();
        let mut dense = Array2::zeros((n, n));
        let mut e = Array1::zeros(n);
        for j in 0..n {
            e[j] = F::one();
            dense.column_mut(j).assign(&self.matvec(&e.view()));
            e[j] = F::zero();
        }
        dense
    }
}

/// Symmetric Toeplitz matrix defined by its first column
#[derive(Clone)]
pub struct SymmetricToeplitz<F: GridFloat> {
    column: Array1<F>,
    /// FFT of the first column of the (2m, 2m) circulant embedding
    spectrum: Vec<Complex<F>>,
    forward: Arc<dyn Fft<F>>,
    inverse: Arc<dyn Fft<F>>,
}

impl<F: GridFloat> SymmetricToeplitz<F> {
    /// Constructor from the first column `[t_0, ..., t_{m-1}]`
    pub fn new(column: Array1<F>) -> Result<Self> {
        let m = column.len();
        if m == 0 {
            return Err(GpError::InvalidValueError(
                "Toeplitz matrix needs a non empty column".to_string(),
            ));
        }
        let mut planner = FftPlanner::<F>::new();
        let forward = planner.plan_fft_forward(2 * m);
        let inverse = planner.plan_fft_inverse(2 * m);

        // [t_0, ..., t_{m-1}, 0, t_{m-1}, ..., t_1]
        let mut spectrum = vec![Complex::new(F::zero(), F::zero()); 2 * m];
        for k in 0..m {
            spectrum[k].re = column[k];
        }
        for k in 1..m {
            spectrum[2 * m - k].re = column[k];
        }
        forward.process(&mut spectrum);
        Ok(SymmetricToeplitz {
            column,
            spectrum,
            forward,
            inverse,
        })
    }

    /// First column
    pub fn column(&self) -> &Array1<F> {
        &self.column
    }

    /// Entry (i, j) of the matrix
    pub fn entry(&self, i: usize, j: usize) -> F {
        self.column[i.abs_diff(j)]
    }
}

impl<F: GridFloat> fmt::Debug for SymmetricToeplitz<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SymmetricToeplitz")
            .field("column", &self.column)
            .finish()
    }
}

impl<F: GridFloat> LinearOperator<F> for SymmetricToeplitz<F> {
    fn size(&self) -> usize {
        self.column.len()
    }

    fn matvec(&self, v: &ArrayView1<F>) -> Array1<F> {
        let m = self.size();
        let mut buffer = vec![Complex::new(F::zero(), F::zero()); 2 * m];
        buffer.iter_mut().zip(v.iter()).for_each(|(b, vi)| b.re = *vi);
        self.forward.process(&mut buffer);
        buffer
            .iter_mut()
            .zip(self.spectrum.iter())
            .for_each(|(b, s)| *b = *b * *s);
        self.inverse.process(&mut buffer);
        let scale = F::cast(2 * m);
        Array1::from_iter(buffer.iter().take(m).map(|b| b.re / scale))
    }

    fn diag(&self) -> Array1<F> {
        Array1::from_elem(self.size(), self.column[0])
    }

    fn to_dense(&self) -> Array2<F> {
        let m = self.size();
        Array2::from_shape_fn((m, m), |(i, j)| self.entry(i, j))
    }
}

/// Kernel matrix on the grid: `outputscale * T_1 ⊗ T_2 ⊗ ... ⊗ T_nx`
/// where `T_d` is the symmetric Toeplitz correlation matrix along dimension `d`.
#[derive(Clone, Debug)]
pub struct KroneckerToeplitz<F: GridFloat> {
    factors: Vec<SymmetricToeplitz<F>>,
    outputscale: F,
}

impl<F: GridFloat> KroneckerToeplitz<F> {
    /// Constructor from Toeplitz factors (the first one varies slowest)
    pub fn new(factors: Vec<SymmetricToeplitz<F>>, outputscale: F) -> Result<Self> {
        if factors.is_empty() {
            return Err(GpError::InvalidValueError(
                "Kronecker product needs at least one factor".to_string(),
            ));
        }
        Ok(KroneckerToeplitz {
            factors,
            outputscale,
        })
    }

    /// Grid kernel matrix for the given correlation model and hyperparameters
    pub fn from_kernel<Corr: CorrelationModel<F>>(
        corr: &Corr,
        grid: &Grid<F>,
        hyperparameters: &Hyperparameters<F>,
    ) -> Result<Self> {
        check_grid_dim(grid, hyperparameters)?;
        let factors = grid
            .axes()
            .iter()
            .zip(hyperparameters.corr_params().rows())
            .map(|(axis, params)| {
                corr.check_params(&params)?;
                let lags = Array1::from_shape_fn(axis.size(), |k| F::cast(k) * axis.spacing());
                SymmetricToeplitz::new(lags.mapv(|tau| corr.value(tau, &params)))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(factors, hyperparameters.outputscale())
    }

    /// Derivatives of the grid kernel matrix wrt every raw correlation parameter,
    /// in the flattened hyperparameters order (dimension major).
    ///
    /// The derivative wrt a parameter of dimension `d` is the same Kronecker product
    /// with the `d`-th factor replaced by its elementwise derivative.
    pub fn corr_derivatives<Corr: CorrelationModel<F>>(
        &self,
        corr: &Corr,
        grid: &Grid<F>,
        hyperparameters: &Hyperparameters<F>,
    ) -> Result<Vec<Self>> {
        check_grid_dim(grid, hyperparameters)?;
        let mut derivatives = Vec::with_capacity(hyperparameters.corr_params().len());
        for (d, (axis, params)) in grid
            .axes()
            .iter()
            .zip(hyperparameters.corr_params().rows())
            .enumerate()
        {
            let lags = Array1::from_shape_fn(axis.size(), |k| F::cast(k) * axis.spacing());
            let mut grads = Array2::zeros((axis.size(), params.len()));
            Zip::from(grads.rows_mut())
                .and(&lags)
                .for_each(|mut g, tau| g.assign(&corr.gradient(*tau, &params)));
            for column in grads.columns() {
                let mut factors = self.factors.clone();
                factors[d] = SymmetricToeplitz::new(column.to_owned())?;
                derivatives.push(KroneckerToeplitz {
                    factors,
                    outputscale: self.outputscale,
                });
            }
        }
        Ok(derivatives)
    }

    /// Output scale
    pub fn outputscale(&self) -> F {
        self.outputscale
    }

    /// Toeplitz factors
    pub fn factors(&self) -> &[SymmetricToeplitz<F>] {
        &self.factors
    }

    /// Entry (i, j) given flat row-major grid indices
    pub fn entry(&self, i: usize, j: usize) -> F {
        let mut i = i;
        let mut j = j;
        let mut value = self.outputscale;
        for factor in self.factors.iter().rev() {
            let m = factor.size();
            value *= factor.entry(i % m, j % m);
            i /= m;
            j /= m;
        }
        value
    }
}

impl<F: GridFloat> LinearOperator<F> for KroneckerToeplitz<F> {
    fn size(&self) -> usize {
        self.factors.iter().map(|f| f.size()).product()
    }

    /// Apply each factor to the lanes of its dimension, the grid vector being
    /// the row-major flattening of a (m_1, ..., m_nx) tensor.
    fn matvec(&self, v: &ArrayView1<F>) -> Array1<F> {
        let total = self.size();
        let mut res = v.to_owned();
        let mut inner = total;
        for factor in self.factors.iter() {
            let m = factor.size();
            inner /= m;
            let outer = total / (m * inner);
            for o in 0..outer {
                for i in 0..inner {
                    let start = o * m * inner + i;
                    let end = start + (m - 1) * inner + 1;
                    let mut lane = res.slice_mut(s![start..end; inner as isize]);
                    let prod = factor.matvec(&lane.view());
                    lane.assign(&prod);
                }
            }
        }
        res.mapv_inplace(|x| x * self.outputscale);
        res
    }

    fn diag(&self) -> Array1<F> {
        let d = self
            .factors
            .iter()
            .fold(self.outputscale, |acc, f| acc * f.column()[0]);
        Array1::from_elem(self.size(), d)
    }

    fn to_dense(&self) -> Array2<F> {
        let m = self.size();
        Array2::from_shape_fn((m, m), |(i, j)| self.entry(i, j))
    }
}

fn check_grid_dim<F: GridFloat>(grid: &Grid<F>, hyperparameters: &Hyperparameters<F>) -> Result<()> {
    if grid.dim() != hyperparameters.dim() {
        return Err(GpError::DimensionError(format!(
            "grid of dimension {} with hyperparameters of dimension {}",
            grid.dim(),
            hyperparameters.dim()
        )));
    }
    Ok(())
}

/// Interpolated grid operator `W K W^T` over the points of the interpolation weights
#[derive(Clone, Copy, Debug)]
pub struct InterpolatedOperator<'a, F: GridFloat> {
    weights: &'a InterpolationWeights<F>,
    grid_op: &'a KroneckerToeplitz<F>,
}

impl<'a, F: GridFloat> InterpolatedOperator<'a, F> {
    /// Constructor, fails when weights and grid operator sizes differ
    pub fn new(
        weights: &'a InterpolationWeights<F>,
        grid_op: &'a KroneckerToeplitz<F>,
    ) -> Result<Self> {
        if weights.n_nodes() != grid_op.size() {
            return Err(GpError::DimensionError(format!(
                "interpolation weights on {} nodes with a grid operator of size {}",
                weights.n_nodes(),
                grid_op.size()
            )));
        }
        Ok(InterpolatedOperator { weights, grid_op })
    }

    /// Underlying grid operator
    pub fn grid_op(&self) -> &KroneckerToeplitz<F> {
        self.grid_op
    }
}

impl<F: GridFloat> LinearOperator<F> for InterpolatedOperator<'_, F> {
    fn size(&self) -> usize {
        self.weights.n_points()
    }

    fn matvec(&self, v: &ArrayView1<F>) -> Array1<F> {
        let u = self.weights.transpose_interpolate(v);
        self.weights.interpolate(&self.grid_op.matvec(&u.view()))
    }

    fn diag(&self) -> Array1<F> {
        let indices = self.weights.indices();
        let values = self.weights.values();
        Array1::from_shape_fn(self.size(), |p| {
            let (idx, w) = (indices.row(p), values.row(p));
            let mut d = F::zero();
            for a in 0..idx.len() {
                for b in 0..idx.len() {
                    d += w[a] * w[b] * self.grid_op.entry(idx[a], idx[b]);
                }
            }
            d
        })
    }
}

/// `A + value * I`
#[derive(Clone, Debug)]
pub struct AddedDiagOperator<F: Float, Op: LinearOperator<F>> {
    op: Op,
    value: F,
}

impl<F: Float, Op: LinearOperator<F>> AddedDiagOperator<F, Op> {
    /// Add `value` to the diagonal of `op`
    pub fn new(op: Op, value: F) -> Self {
        AddedDiagOperator { op, value }
    }

    /// Operator without the added diagonal
    pub fn inner(&self) -> &Op {
        &self.op
    }

    /// Added diagonal value
    pub fn diag_value(&self) -> F {
        self.value
    }
}

impl<F: Float, Op: LinearOperator<F>> LinearOperator<F> for AddedDiagOperator<F, Op> {
    fn size(&self) -> usize {
        self.op.size()
    }

    fn matvec(&self, v: &ArrayView1<F>) -> Array1<F> {
        let mut res = self.op.matvec(v);
        res.scaled_add(self.value, v);
        res
    }

    fn diag(&self) -> Array1<F> {
        self.op.diag() + self.value
    }
}

/// Operator backed by an explicit square matrix
#[derive(Clone, Debug, PartialEq)]
pub struct DenseOperator<F: Float> {
    matrix: Array2<F>,
}

impl<F: Float> DenseOperator<F> {
    /// Constructor, fails if `matrix` is not square
    pub fn new(matrix: Array2<F>) -> Result<Self> {
        if !matrix.is_square() {
            return Err(GpError::DimensionError(format!(
                "operator matrix should be square, got {:?}",
                matrix.dim()
            )));
        }
        Ok(DenseOperator { matrix })
    }
}

impl<F: Float> LinearOperator<F> for DenseOperator<F> {
    fn size(&self) -> usize {
        self.matrix.nrows()
    }

    fn matvec(&self, v: &ArrayView1<F>) -> Array1<F> {
        self.matrix.dot(v)
    }

    fn diag(&self) -> Array1<F> {
        self.matrix.diag().to_owned()
    }

    fn to_dense(&self) -> Array2<F> {
        self.matrix.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation_models::{
        Matern32Corr, SpectralMixtureCorr, SquaredExponentialCorr, covariance,
    };
    use approx::assert_abs_diff_eq;
    use linfa_linalg::eigh::*;
    use ndarray::{Array, Axis, array};
    use ndarray_rand::RandomExt;
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use rand_xoshiro::Xoshiro256Plus;

    fn kron(a: &Array2<f64>, b: &Array2<f64>) -> Array2<f64> {
        let (ra, ca) = a.dim();
        let (rb, cb) = b.dim();
        Array2::from_shape_fn((ra * rb, ca * cb), |(i, j)| {
            a[[i / rb, j / cb]] * b[[i % rb, j % cb]]
        })
    }

    #[test]
    fn test_toeplitz_matvec() {
        let column = array![4., 1.5, -0.5, 0.25, 0.1];
        let t = SymmetricToeplitz::new(column).unwrap();
        let dense = t.to_dense();
        assert_abs_diff_eq!(dense, dense.t(), epsilon = 1e-15);
        assert_abs_diff_eq!(dense[[4, 1]], 0.25);
        let v = array![1., -2., 3., 0.5, -1.];
        assert_abs_diff_eq!(t.matvec(&v.view()), dense.dot(&v), epsilon = 1e-10);
        // single element
        let t = SymmetricToeplitz::new(array![2.]).unwrap();
        assert_abs_diff_eq!(t.matvec(&array![3.].view()), array![6.], epsilon = 1e-12);
        assert!(SymmetricToeplitz::<f64>::new(array![]).is_err());
    }

    #[test]
    fn test_grid_kernel_symmetric_psd() {
        let grid = Grid::new(&[(0., 1.)], &[30]).unwrap();
        for lengthscale in [0.05, 0.3, 2.] {
            let hp = Hyperparameters::new(
                array![[f64::ln(lengthscale)]],
                1.3,
                0.1,
                array![],
                1e-6,
            )
            .unwrap();
            let k = KroneckerToeplitz::from_kernel(&SquaredExponentialCorr(), &grid, &hp)
                .unwrap()
                .to_dense();
            assert_abs_diff_eq!(k, k.t(), epsilon = 1e-14);
            let (eigvals, _) = k.eigh_into().unwrap();
            assert!(eigvals.iter().all(|v| *v > -1e-8));
        }
    }

    #[test]
    fn test_kronecker_matches_dense() {
        let grid = Grid::new(&[(0., 1.), (-1., 2.)], &[5, 6]).unwrap();
        let hp =
            Hyperparameters::new(array![[-1.], [0.2]], 2., 0.1, array![], 1e-6).unwrap();
        let k = KroneckerToeplitz::from_kernel(&Matern32Corr(), &grid, &hp).unwrap();
        assert_eq!(k.size(), 30);

        let expected = 2. * kron(&k.factors()[0].to_dense(), &k.factors()[1].to_dense());
        assert_abs_diff_eq!(k.to_dense(), expected, epsilon = 1e-12);
        // dense kernel on the grid nodes
        let nodes = grid.nodes();
        let cov = covariance(&Matern32Corr(), &nodes, &nodes, hp.corr_params(), 2.).unwrap();
        assert_abs_diff_eq!(cov, expected, epsilon = 1e-12);

        let mut rng = Xoshiro256Plus::seed_from_u64(0);
        let v = Array::random_using(30, Uniform::new(-1., 1.), &mut rng);
        assert_abs_diff_eq!(k.matvec(&v.view()), expected.dot(&v), epsilon = 1e-10);
        assert_abs_diff_eq!(k.diag(), expected.diag(), epsilon = 1e-12);
    }

    #[test]
    fn test_kronecker_lanes() {
        let t3 = SymmetricToeplitz::new(array![2., 0.5, 0.1]).unwrap();
        let t4 = SymmetricToeplitz::new(array![1., 0.3, -0.2, 0.05]).unwrap();
        let t2 = SymmetricToeplitz::new(array![1.5, 0.4]).unwrap();

        let k = KroneckerToeplitz::new(vec![t3.clone(), t4.clone()], 1.).unwrap();
        let expected = kron(&t3.to_dense(), &t4.to_dense());
        let ones = Array1::ones(12);
        assert_abs_diff_eq!(k.matvec(&ones.view()), expected.dot(&ones), epsilon = 1e-12);

        let k = KroneckerToeplitz::new(vec![t3.clone(), t4.clone(), t2.clone()], 0.7).unwrap();
        let expected = 0.7 * kron(&kron(&t3.to_dense(), &t4.to_dense()), &t2.to_dense());
        let mut rng = Xoshiro256Plus::seed_from_u64(3);
        let v = Array::random_using(24, Uniform::new(-1., 1.), &mut rng);
        assert_abs_diff_eq!(k.matvec(&v.view()), expected.dot(&v), epsilon = 1e-12);
        let mut by_columns = Array2::zeros((24, 24));
        for (j, mut col) in by_columns.columns_mut().into_iter().enumerate() {
            let mut e = Array1::zeros(24);
            e[j] = 1.;
            col.assign(&k.matvec(&e.view()));
        }
        assert_abs_diff_eq!(by_columns, k.to_dense(), epsilon = 1e-12);
    }

    #[test]
    fn test_kronecker_derivatives() {
        let grid = Grid::new(&[(0., 1.), (0., 1.)], &[6, 5]).unwrap();
        let corr = SpectralMixtureCorr::new(1);
        let raw = array![[0.1, 0.3, 0.5], [-0.2, 0.7, 0.1]];
        let hp = Hyperparameters::new(raw.clone(), 1.5, 0.1, array![], 1e-6).unwrap();
        let k = KroneckerToeplitz::from_kernel(&corr, &grid, &hp).unwrap();
        let derivatives = k.corr_derivatives(&corr, &grid, &hp).unwrap();
        assert_eq!(derivatives.len(), 6);

        let eps = 1e-6;
        for (p, dk) in derivatives.iter().enumerate() {
            let mut plus = hp.to_raw();
            plus[p] += eps;
            let mut minus = hp.to_raw();
            minus[p] -= eps;
            let kp = KroneckerToeplitz::from_kernel(&corr, &grid, &hp.with_raw(&plus).unwrap())
                .unwrap()
                .to_dense();
            let km = KroneckerToeplitz::from_kernel(&corr, &grid, &hp.with_raw(&minus).unwrap())
                .unwrap()
                .to_dense();
            assert_abs_diff_eq!(dk.to_dense(), (kp - km) / (2. * eps), epsilon = 1e-6);
        }
    }

    #[test]
    fn test_interpolated_matvec_matches_dense() {
        // N=20 points, M=10 grid nodes
        let grid = Grid::new(&[(0., 1.)], &[10]).unwrap();
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let x = Array::random_using((20, 1), Uniform::new(0., 1.), &mut rng);
        let w = InterpolationWeights::new(&grid, &x).unwrap();
        let hp = Hyperparameters::new(array![[f64::ln(0.3)]], 1.2, 0.1, array![], 1e-6).unwrap();
        let k = KroneckerToeplitz::from_kernel(&SquaredExponentialCorr(), &grid, &hp).unwrap();
        let op = InterpolatedOperator::new(&w, &k).unwrap();
        assert_eq!(op.size(), 20);

        let wd = w.to_dense();
        let expected = wd.dot(&k.to_dense()).dot(&wd.t());
        let v = Array::random_using(20, Uniform::new(-1., 1.), &mut rng);
        assert_abs_diff_eq!(op.matvec(&v.view()), expected.dot(&v), epsilon = 1e-10);
        assert_abs_diff_eq!(op.diag(), expected.diag(), epsilon = 1e-10);

        let noisy = AddedDiagOperator::new(op, 0.1);
        assert_abs_diff_eq!(
            noisy.matvec(&v.view()),
            expected.dot(&v) + 0.1 * &v,
            epsilon = 1e-10
        );
        assert_abs_diff_eq!(noisy.diag(), &expected.diag() + 0.1, epsilon = 1e-10);
    }

    #[test]
    fn test_interpolated_approximates_kernel() {
        let grid = Grid::new(&[(0., 1.)], &[100]).unwrap();
        let x = Array::linspace(0., 1., 15).insert_axis(Axis(1));
        let w = InterpolationWeights::new(&grid, &x).unwrap();
        let hp = Hyperparameters::new(array![[f64::ln(0.2)]], 1., 0.1, array![], 1e-6).unwrap();
        let k = KroneckerToeplitz::from_kernel(&SquaredExponentialCorr(), &grid, &hp).unwrap();
        let ski = InterpolatedOperator::new(&w, &k).unwrap().to_dense();
        let exact = covariance(&SquaredExponentialCorr(), &x, &x, hp.corr_params(), 1.).unwrap();
        assert_abs_diff_eq!(ski, exact, epsilon = 1e-3);
    }

    #[test]
    fn test_dense_operator() {
        let a = array![[2., 1.], [1., 3.]];
        let op = DenseOperator::new(a.clone()).unwrap();
        assert_abs_diff_eq!(op.matvec(&array![1., 1.].view()), array![3., 4.]);
        assert_abs_diff_eq!(op.diag(), array![2., 3.]);
        assert_abs_diff_eq!(op.to_dense(), a);
        assert!(DenseOperator::new(array![[1., 2.]]).is_err());
    }
}
