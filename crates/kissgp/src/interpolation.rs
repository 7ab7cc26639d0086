//! Sparse interpolation of the grid nodes to arbitrary points.
//!
//! Each point is linked to its 4 surrounding nodes per dimension with the Keys cubic
//! convolution kernel (`a = -0.5`), the multi-dimensional weights being the tensor product
//! of the one-dimensional ones: a point has `4^nx` (node index, weight) pairs.
//! Weights only depend on the geometry, they are computed once per set of points.
//!
//! Reference: Keys, R. (1981). Cubic convolution interpolation for digital image processing.
//! IEEE Transactions on Acoustics, Speech, and Signal Processing, 29(6), 1153-1160.

use crate::errors::{GpError, Result};
use crate::grid::Grid;
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, ArrayView1, Data, Ix1, Ix2, Zip};
use rayon::prelude::*;

/// Number of neighbour nodes along one dimension
const N_NEIGHBOURS: usize = 4;

/// Keys cubic convolution kernel with `a = -0.5`
pub fn cubic_kernel<F: Float>(s: F) -> F {
    let a = F::cast(-0.5);
    let s = s.abs();
    if s <= F::one() {
        (a + F::cast(2.)) * s * s * s - (a + F::cast(3.)) * s * s + F::one()
    } else if s < F::cast(2.) {
        a * s * s * s - F::cast(5.) * a * s * s + F::cast(8.) * a * s - F::cast(4.) * a
    } else {
        F::zero()
    }
}

/// Derivative of the Keys cubic convolution kernel
pub fn cubic_kernel_derivative<F: Float>(s: F) -> F {
    let a = F::cast(-0.5);
    let sign = if s < F::zero() { -F::one() } else { F::one() };
    let s = s.abs();
    let d = if s <= F::one() {
        F::cast(3.) * (a + F::cast(2.)) * s * s - F::cast(2.) * (a + F::cast(3.)) * s
    } else if s < F::cast(2.) {
        F::cast(3.) * a * s * s - F::cast(10.) * a * s + F::cast(8.) * a
    } else {
        F::zero()
    };
    sign * d
}

/// Sparse interpolation matrix `W` (n, M) from grid nodes to points
#[derive(Clone, Debug, PartialEq)]
pub struct InterpolationWeights<F: Float> {
    n_nodes: usize,
    /// Flat grid node indices (n, 4^nx)
    indices: Array2<usize>,
    /// Corresponding weights (n, 4^nx)
    values: Array2<F>,
}

impl<F: Float> InterpolationWeights<F> {
    /// Compute interpolation weights of `x` (n, nx) points on `grid`.
    ///
    /// Fails with an out of range error when a point is outside grid bounds.
    pub fn new(grid: &Grid<F>, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Self> {
        Self::compute(grid, x, None)
    }

    /// Derivatives of the interpolation weights of `x` points wrt their `dim`-th component,
    /// such that `derivatives(grid, x, d).interpolate(u)` is the derivative of the
    /// interpolant of `u` along `d`.
    pub fn derivatives(
        grid: &Grid<F>,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        dim: usize,
    ) -> Result<Self> {
        if dim >= grid.dim() {
            return Err(GpError::DimensionError(format!(
                "derivative wrt component {dim} on a grid of dimension {}",
                grid.dim()
            )));
        }
        Self::compute(grid, x, Some(dim))
    }

    fn compute(
        grid: &Grid<F>,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        derivative: Option<usize>,
    ) -> Result<Self> {
        if x.ncols() != grid.dim() {
            return Err(GpError::DimensionError(format!(
                "points of dimension {} interpolated on a grid of dimension {}",
                x.ncols(),
                grid.dim()
            )));
        }
        let n_entries = N_NEIGHBOURS.pow(grid.dim() as u32);
        let x = x.view();
        let rows = (0..x.nrows())
            .into_par_iter()
            .map(|i| point_weights(grid, &x.row(i), derivative))
            .collect::<Result<Vec<_>>>()?;

        let mut indices = Array2::zeros((x.nrows(), n_entries));
        let mut values = Array2::zeros((x.nrows(), n_entries));
        for (i, (ri, rv)) in rows.iter().enumerate() {
            indices.row_mut(i).assign(&ArrayView1::from(ri));
            values.row_mut(i).assign(&ArrayView1::from(rv));
        }
        Ok(InterpolationWeights {
            n_nodes: grid.size(),
            indices,
            values,
        })
    }

    /// Number of interpolated points `n`
    pub fn n_points(&self) -> usize {
        self.indices.nrows()
    }

    /// Number of grid nodes `M`
    pub fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    /// Flat node indices (n, 4^nx)
    pub fn indices(&self) -> &Array2<usize> {
        &self.indices
    }

    /// Interpolation weights (n, 4^nx)
    pub fn values(&self) -> &Array2<F> {
        &self.values
    }

    /// `W u` where `u` is a vector of grid node values (M)
    pub fn interpolate(&self, u: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Array1<F> {
        let mut res = Array1::zeros(self.n_points());
        Zip::from(&mut res)
            .and(self.indices.rows())
            .and(self.values.rows())
            .for_each(|r, idx, val| {
                *r = idx
                    .iter()
                    .zip(val.iter())
                    .fold(F::zero(), |acc, (&j, &w)| acc + w * u[j]);
            });
        res
    }

    /// `W U` where `U` is a (M, k) matrix of grid node values
    pub fn interpolate_matrix(&self, u: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
        let mut res = Array2::zeros((self.n_points(), u.ncols()));
        Zip::from(res.rows_mut())
            .and(self.indices.rows())
            .and(self.values.rows())
            .for_each(|mut r, idx, val| {
                idx.iter()
                    .zip(val.iter())
                    .for_each(|(&j, &w)| r.scaled_add(w, &u.row(j)));
            });
        res
    }

    /// `W^T v` where `v` is a vector of point values (n)
    pub fn transpose_interpolate(&self, v: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Array1<F> {
        let mut res = Array1::zeros(self.n_nodes);
        Zip::from(v)
            .and(self.indices.rows())
            .and(self.values.rows())
            .for_each(|&vi, idx, val| {
                idx.iter()
                    .zip(val.iter())
                    .for_each(|(&j, &w)| res[j] += w * vi);
            });
        res
    }

    /// Dense (n, M) interpolation matrix
    pub fn to_dense(&self) -> Array2<F> {
        let mut w = Array2::zeros((self.n_points(), self.n_nodes));
        Zip::from(w.rows_mut())
            .and(self.indices.rows())
            .and(self.values.rows())
            .for_each(|mut row, idx, val| {
                idx.iter()
                    .zip(val.iter())
                    .for_each(|(&j, &v)| row[j] += v);
            });
        w
    }
}

/// Flat indices and weights of the `4^nx` neighbour nodes of one point
/// (weights along dimension `derivative` being replaced by their derivatives)
fn point_weights<F: Float>(
    grid: &Grid<F>,
    x: &ArrayBase<impl Data<Elem = F>, Ix1>,
    derivative: Option<usize>,
) -> Result<(Vec<usize>, Vec<F>)> {
    let shape = grid.shape();
    let mut indices = vec![0usize];
    let mut weights = vec![F::one()];
    for (d, axis) in grid.axes().iter().enumerate() {
        let (j, t) = axis.locate(x[d]).map_err(|e| match e {
            GpError::OutOfRangeError(msg) => {
                GpError::OutOfRangeError(format!("dimension {d}: {msg}"))
            }
            e => e,
        })?;
        // neighbours j-1, j, j+1, j+2 at signed distances 1+t, t, t-1, t-2 (in spacing unit)
        let kernel = |s: F| {
            if derivative == Some(d) {
                cubic_kernel_derivative(s) / axis.spacing()
            } else {
                cubic_kernel(s)
            }
        };
        let local = [
            (j - 1, kernel(F::one() + t)),
            (j, kernel(t)),
            (j + 1, kernel(t - F::one())),
            (j + 2, kernel(t - F::cast(2.))),
        ];
        // row-major: last dimension varies fastest
        let mut next_indices = Vec::with_capacity(indices.len() * N_NEIGHBOURS);
        let mut next_weights = Vec::with_capacity(weights.len() * N_NEIGHBOURS);
        for (&flat, &w) in indices.iter().zip(weights.iter()) {
            for &(k, wk) in local.iter() {
                next_indices.push(flat * shape[d] + k);
                next_weights.push(w * wk);
            }
        }
        indices = next_indices;
        weights = next_weights;
    }
    Ok((indices, weights))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, Axis, array};
    use ndarray_rand::RandomExt;
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use rand_xoshiro::Xoshiro256Plus;

    #[test]
    fn test_cubic_kernel() {
        assert_abs_diff_eq!(cubic_kernel(0.), 1.);
        assert_abs_diff_eq!(cubic_kernel(1.), 0.);
        assert_abs_diff_eq!(cubic_kernel(-1.), 0.);
        assert_abs_diff_eq!(cubic_kernel(2.), 0.);
        assert_abs_diff_eq!(cubic_kernel(3.5), 0.);
        assert_abs_diff_eq!(cubic_kernel(0.5), 0.5625);
        assert_abs_diff_eq!(cubic_kernel(1.5), -0.0625);
    }

    #[test]
    fn test_weights_sum_to_one() {
        let grid = Grid::new(&[(0., 1.), (-2., 3.)], &[10, 7]).unwrap();
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let mut x = Array::random_using((50, 2), Uniform::new(0., 1.), &mut rng);
        x.column_mut(1).mapv_inplace(|v| -2. + 5. * v);
        let w = InterpolationWeights::new(&grid, &x).unwrap();
        assert_eq!(w.values().dim(), (50, 16));
        let sums = w.values().sum_axis(Axis(1));
        assert_abs_diff_eq!(sums, Array1::ones(50), epsilon = 1e-6);
        assert_abs_diff_eq!(w.to_dense().sum_axis(Axis(1)), Array1::ones(50), epsilon = 1e-6);
    }

    #[test]
    fn test_point_on_node() {
        let grid = Grid::new(&[(0., 1.)], &[13]).unwrap();
        // 0.3 is the 4th node (index 4 with padding node)
        let w = InterpolationWeights::new(&grid, &array![[0.3], [0.], [1.]]).unwrap();
        let dense = w.to_dense();
        assert_abs_diff_eq!(dense[[0, 4]], 1., epsilon = 1e-9);
        assert_abs_diff_eq!(dense.row(0).sum(), 1., epsilon = 1e-9);
        assert!(dense
            .row(0)
            .iter()
            .enumerate()
            .all(|(j, v): (usize, &f64)| j == 4 || v.abs() < 1e-9));
        assert_abs_diff_eq!(dense[[1, 1]], 1., epsilon = 1e-9);
        assert_abs_diff_eq!(dense[[2, 11]], 1., epsilon = 1e-9);
    }

    #[test]
    fn test_out_of_range() {
        let grid = Grid::new(&[(0., 1.)], &[10]).unwrap();
        let res = InterpolationWeights::new(&grid, &array![[0.5], [1.2]]);
        assert!(matches!(res, Err(GpError::OutOfRangeError(_))));
        let res = InterpolationWeights::new(&grid, &array![[0.5, 0.5]]);
        assert!(matches!(res, Err(GpError::DimensionError(_))));
    }

    #[test]
    fn test_quadratic_reproduction() {
        // Keys cubic convolution reproduces polynomials up to degree 2
        let grid = Grid::new(&[(0., 1.)], &[20]).unwrap();
        let nodes = grid.axes()[0].nodes();
        let u = nodes.mapv(|v: f64| 3. * v * v - v + 0.5);
        let x = Array::linspace(0., 1., 37);
        let w = InterpolationWeights::new(&grid, &x.clone().insert_axis(Axis(1))).unwrap();
        assert_abs_diff_eq!(
            w.interpolate(&u),
            x.mapv(|v: f64| 3. * v * v - v + 0.5),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_cubic_kernel_derivative() {
        for s in [-1.7, -0.6, -0.1, 0.3, 0.9, 1.2, 1.8] {
            let h = 1e-6;
            let fd = (cubic_kernel(s + h) - cubic_kernel(s - h)) / (2. * h);
            assert_abs_diff_eq!(cubic_kernel_derivative(s), fd, epsilon = 1e-6);
        }
        assert_abs_diff_eq!(cubic_kernel_derivative(2.5), 0.);
    }

    #[test]
    fn test_derivative_weights() {
        let grid = Grid::new(&[(0., 1.), (-1., 1.)], &[15, 12]).unwrap();
        let nodes = grid.nodes();
        // quadratic in both components is reproduced, so are its derivatives
        let u = nodes.map_axis(Axis(1), |p| p[0] * p[0] + 2. * p[0] * p[1] - p[1]);
        let x = array![[0.1, 0.2], [0.55, -0.9], [1., 0.], [0.33, 0.77]];
        let d0 = InterpolationWeights::derivatives(&grid, &x, 0).unwrap();
        let d1 = InterpolationWeights::derivatives(&grid, &x, 1).unwrap();
        let expected0 = x.map_axis(Axis(1), |p| 2. * p[0] + 2. * p[1]);
        let expected1 = x.map_axis(Axis(1), |p| 2. * p[0] - 1.);
        assert_abs_diff_eq!(d0.interpolate(&u), expected0, epsilon = 1e-9);
        assert_abs_diff_eq!(d1.interpolate(&u), expected1, epsilon = 1e-9);
        assert!(matches!(
            InterpolationWeights::derivatives(&grid, &x, 2),
            Err(GpError::DimensionError(_))
        ));
    }

    #[test]
    fn test_transpose_interpolate() {
        let grid = Grid::new(&[(0., 1.), (0., 1.)], &[6, 5]).unwrap();
        let x = array![[0.1, 0.2], [0.55, 0.9], [1., 0.]];
        let w = InterpolationWeights::new(&grid, &x).unwrap();
        let v = array![1., -2., 0.5];
        let dense = w.to_dense();
        assert_abs_diff_eq!(w.transpose_interpolate(&v), dense.t().dot(&v), epsilon = 1e-12);
        let u = Array::linspace(0., 1., 30);
        assert_abs_diff_eq!(w.interpolate(&u), dense.dot(&u), epsilon = 1e-12);
        let um = Array::linspace(-1., 1., 90).into_shape((30, 3)).unwrap();
        assert_abs_diff_eq!(w.interpolate_matrix(&um), dense.dot(&um), epsilon = 1e-12);
    }
}
