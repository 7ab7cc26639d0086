//! Regular inducing grid used by structured kernel interpolation.
//!
//! Along each dimension the grid has `size` equally spaced nodes. The declared bounds
//! `[lower, upper]` are covered by the inner nodes, one extra node is added on each side so
//! that any point within bounds has the four neighbours required by cubic interpolation:
//!
//! `spacing = (upper - lower) / (size - 3)`, nodes `lower - spacing + k * spacing, k = 0..size`

use crate::errors::{GpError, Result};
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Minimal number of nodes along one grid dimension
pub const GRID_MIN_SIZE: usize = 4;

/// One dimension of the inducing grid
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct GridAxis<F: Float> {
    lower: F,
    upper: F,
    size: usize,
    spacing: F,
}

impl<F: Float> GridAxis<F> {
    /// Build `size` nodes covering `[lower, upper]`
    pub fn new(lower: F, upper: F, size: usize) -> Result<Self> {
        if size < GRID_MIN_SIZE {
            return Err(GpError::InvalidValueError(format!(
                "grid size should be at least {GRID_MIN_SIZE}, got {size}"
            )));
        }
        if !lower.is_finite() || !upper.is_finite() || lower >= upper {
            return Err(GpError::InvalidValueError(format!(
                "grid bounds should be finite with lower < upper, got ({lower}, {upper})"
            )));
        }
        let spacing = (upper - lower) / F::cast(size - 3);
        Ok(GridAxis {
            lower,
            upper,
            size,
            spacing,
        })
    }

    /// Declared lower bound
    pub fn lower(&self) -> F {
        self.lower
    }

    /// Declared upper bound
    pub fn upper(&self) -> F {
        self.upper
    }

    /// Number of nodes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Distance between two consecutive nodes
    pub fn spacing(&self) -> F {
        self.spacing
    }

    /// Location of the k-th node
    pub fn node(&self, k: usize) -> F {
        self.lower - self.spacing + F::cast(k) * self.spacing
    }

    /// All node locations
    pub fn nodes(&self) -> Array1<F> {
        Array1::from_shape_fn(self.size, |k| self.node(k))
    }

    /// Locate `x` on the axis.
    ///
    /// Returns `(j, t)` where `j` is the index of the node at the left of `x`
    /// (`1 <= j <= size - 3`) and `t = (x - node(j)) / spacing` in `[0, 1]`.
    /// Fails when `x` lies outside the declared bounds.
    pub fn locate(&self, x: F) -> Result<(usize, F)> {
        if !(x >= self.lower && x <= self.upper) {
            return Err(GpError::OutOfRangeError(format!(
                "{x} is outside grid bounds [{}, {}]",
                self.lower, self.upper
            )));
        }
        let u = (x - self.lower) / self.spacing + F::one();
        let j = u
            .floor()
            .to_usize()
            .unwrap_or(1)
            .clamp(1, self.size - 3);
        Ok((j, u - F::cast(j)))
    }
}

/// Cartesian product of regular grid axes
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(deserialize = "F: Deserialize<'de>"))
)]
pub struct Grid<F: Float> {
    axes: Vec<GridAxis<F>>,
}

impl<F: Float> Grid<F> {
    /// Build a grid given `(lower, upper)` bounds and node count per dimension
    pub fn new(bounds: &[(F, F)], sizes: &[usize]) -> Result<Self> {
        if bounds.is_empty() || bounds.len() != sizes.len() {
            return Err(GpError::InvalidValueError(format!(
                "grid needs as many bounds as sizes (at least one), got {} bounds and {} sizes",
                bounds.len(),
                sizes.len()
            )));
        }
        let axes = bounds
            .iter()
            .zip(sizes)
            .map(|((lo, up), size)| GridAxis::new(*lo, *up, *size))
            .collect::<Result<Vec<_>>>()?;
        Ok(Grid { axes })
    }

    /// Input dimension
    pub fn dim(&self) -> usize {
        self.axes.len()
    }

    /// Grid axes
    pub fn axes(&self) -> &[GridAxis<F>] {
        &self.axes
    }

    /// Number of nodes per dimension
    pub fn shape(&self) -> Vec<usize> {
        self.axes.iter().map(|a| a.size()).collect()
    }

    /// Total number of nodes `M`
    pub fn size(&self) -> usize {
        self.axes.iter().map(|a| a.size()).product()
    }

    /// Declared bounds per dimension
    pub fn bounds(&self) -> Vec<(F, F)> {
        self.axes.iter().map(|a| (a.lower(), a.upper())).collect()
    }

    /// All grid nodes as a (M, nx) matrix, row-major ordering (last dimension varies fastest)
    pub fn nodes(&self) -> Array2<F> {
        let shape = self.shape();
        let m = self.size();
        let mut nodes = Array2::zeros((m, self.dim()));
        for (flat, mut row) in nodes.rows_mut().into_iter().enumerate() {
            let mut rem = flat;
            for d in (0..self.dim()).rev() {
                row[d] = self.axes[d].node(rem % shape[d]);
                rem /= shape[d];
            }
        }
        nodes
    }

    /// Check every point of `x` (n, nx) lies within the grid bounds
    pub fn check_points(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<()> {
        if x.ncols() != self.dim() {
            return Err(GpError::DimensionError(format!(
                "points of dimension {} given to a grid of dimension {}",
                x.ncols(),
                self.dim()
            )));
        }
        for (i, row) in x.rows().into_iter().enumerate() {
            for (axis, v) in self.axes.iter().zip(row.iter()) {
                axis.locate(*v).map_err(|e| match e {
                    GpError::OutOfRangeError(msg) => {
                        GpError::OutOfRangeError(format!("point #{i}: {msg}"))
                    }
                    e => e,
                })?;
            }
        }
        Ok(())
    }
}

/// Number of grid nodes per dimension adapted to the number of training points:
/// `ratio * n^(1/nx)` nodes, at least [GRID_MIN_SIZE].
pub fn choose_grid_size(n_points: usize, dim: usize, ratio: f64) -> usize {
    let dim = dim.max(1) as f64;
    let size = (ratio * (n_points as f64).powf(1. / dim)).floor() as usize;
    size.max(GRID_MIN_SIZE)
}
