//! Structured kernel interpolation (SKI / KISS-GP).
//!
//! The covariance between arbitrary points is approximated as `K(X1, X2) ≈ W1 K_grid W2^T`
//! where `K_grid` is the kernel evaluated on a regular lattice (a Kronecker product of
//! Toeplitz matrices for separable stationary kernels) and `W` holds local cubic
//! convolution weights (4 nonzeros per dimension and per point).
//!
//! Inputs have to lie inside the grid bounds, see [BoundsPolicy].

use crate::errors::{GpError, Result};
use crate::kernels::{GridTerm, Kernel};
use crate::toeplitz::KroneckerToeplitz;
use crate::utils::to_f64;
use linfa::Float;
use log::warn;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2, Zip};
use rayon::prelude::*;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Number of interpolation weights per dimension (cubic stencil)
const STENCIL: usize = 4;
/// Minimum number of grid points per dimension
pub const MIN_GRID_SIZE: usize = 5;

/// Behaviour when an input lies outside the grid bounds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum BoundsPolicy {
    /// Fail with [GpError::OutOfBoundsInput]
    #[default]
    Reject,
    /// Move the input to the closest bound (a warning is logged)
    Clamp,
}

/// A regular lattice covering given bounds.
///
/// With `g` points in a dimension bounded by `[a, b]`, the spacing is `h = (b - a) / (g - 4)`
/// and the points go from `a - 1.5 h` to `b + 1.5 h`, so that every cubic stencil of a point
/// inside the bounds stays on the grid.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Grid<F: Float> {
    bounds: Vec<(F, F)>,
    sizes: Vec<usize>,
    spacings: Vec<F>,
    origins: Vec<F>,
}

impl<F: Float> Grid<F> {
    /// Grid with `grid_size` points in every dimension of `bounds`
    pub fn new(bounds: &[(F, F)], grid_size: usize) -> Result<Self> {
        Self::with_sizes(bounds, &vec![grid_size; bounds.len()])
    }

    /// Grid with `sizes[k]` points in dimension k
    pub fn with_sizes(bounds: &[(F, F)], sizes: &[usize]) -> Result<Self> {
        if bounds.is_empty() {
            return Err(GpError::Configuration(
                "grid needs at least one dimension".to_string(),
            ));
        }
        if bounds.len() != sizes.len() {
            return Err(GpError::dimension_mismatch(
                "grid sizes",
                bounds.len(),
                sizes.len(),
            ));
        }
        if let Some(g) = sizes.iter().find(|&&g| g < MIN_GRID_SIZE) {
            return Err(GpError::Configuration(format!(
                "grid size should be at least {MIN_GRID_SIZE}, got {g}"
            )));
        }
        if let Some((a, b)) = bounds.iter().find(|(a, b)| !(a < b)) {
            return Err(GpError::Configuration(format!(
                "grid bounds should satisfy lower < upper, got [{a}, {b}]"
            )));
        }
        let spacings: Vec<F> = bounds
            .iter()
            .zip(sizes)
            .map(|((a, b), &g)| (*b - *a) / F::cast(g - 4))
            .collect();
        let origins = bounds
            .iter()
            .zip(&spacings)
            .map(|((a, _), &h)| *a - F::cast(1.5) * h)
            .collect();
        Ok(Grid {
            bounds: bounds.to_vec(),
            sizes: sizes.to_vec(),
            spacings,
            origins,
        })
    }

    /// Number of dimensions
    pub fn num_dims(&self) -> usize {
        self.sizes.len()
    }

    /// Points per dimension
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Bounds inside which inputs are accepted
    pub fn bounds(&self) -> &[(F, F)] {
        &self.bounds
    }

    /// Total number of grid points
    pub fn len(&self) -> usize {
        self.sizes.iter().product()
    }

    /// Always false, a grid holds at least one point per dimension
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Coordinates of the points along dimension `k`
    pub fn axis(&self, k: usize) -> Array1<F> {
        let (o, h) = (self.origins[k], self.spacings[k]);
        Array1::from_shape_fn(self.sizes[k], |j| o + F::cast(j) * h)
    }

    /// Distances `j * h_k` between the first point and the others, per dimension
    pub fn offsets(&self) -> Vec<Array1<F>> {
        self.sizes
            .iter()
            .zip(&self.spacings)
            .map(|(&g, &h)| Array1::from_shape_fn(g, |j| F::cast(j) * h))
            .collect()
    }

    /// All grid points as a (len, num_dims) matrix in flat index order
    pub fn points(&self) -> Array2<F> {
        let d = self.num_dims();
        let mut pts = Array2::zeros((self.len(), d));
        for (flat, mut row) in pts.rows_mut().into_iter().enumerate() {
            let mut rest = flat;
            for k in (0..d).rev() {
                let j = rest % self.sizes[k];
                rest /= self.sizes[k];
                row[k] = self.origins[k] + F::cast(j) * self.spacings[k];
            }
        }
        pts
    }

    fn strides(&self) -> Vec<usize> {
        let d = self.num_dims();
        let mut strides = vec![1; d];
        for k in (0..d.saturating_sub(1)).rev() {
            strides[k] = strides[k + 1] * self.sizes[k + 1];
        }
        strides
    }
}

/// Keys cubic convolution kernel (a = -0.5)
fn cubic_weight<F: Float>(s: F) -> F {
    let s = s.abs();
    if s <= F::one() {
        (F::cast(1.5) * s - F::cast(2.5)) * s * s + F::one()
    } else if s < F::cast(2.) {
        ((F::cast(-0.5) * s + F::cast(2.5)) * s - F::cast(4.)) * s + F::cast(2.)
    } else {
        F::zero()
    }
}

/// Sparse (n, grid size) matrix with a fixed number of nonzeros per row
#[derive(Clone, Debug)]
pub struct InterpolationMatrix<F: Float> {
    ncols: usize,
    indices: Array2<usize>,
    values: Array2<F>,
}

impl<F: Float> InterpolationMatrix<F> {
    /// Cubic interpolation weights of the rows of `x` on `grid`
    pub fn cubic(
        grid: &Grid<F>,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        policy: BoundsPolicy,
    ) -> Result<Self> {
        let d = grid.num_dims();
        if x.ncols() != d {
            return Err(GpError::dimension_mismatch(
                "interpolated inputs",
                d,
                x.ncols(),
            ));
        }
        let x = bounded_inputs(grid, x, policy)?;
        let nnz = STENCIL.pow(d as u32);
        let strides = grid.strides();
        let mut indices = Array2::zeros((x.nrows(), nnz));
        let mut values = Array2::zeros((x.nrows(), nnz));
        Zip::from(indices.rows_mut())
            .and(values.rows_mut())
            .and(x.rows())
            .par_for_each(|mut idx, mut val, xi| {
                let mut base = vec![0usize; d];
                let mut weights = vec![[F::zero(); STENCIL]; d];
                for k in 0..d {
                    let u = (xi[k] - grid.origins[k]) / grid.spacings[k];
                    let i0 = u.floor();
                    let t = u - i0;
                    // stencil i0 - 1 ..= i0 + 2, in range for inputs inside the bounds
                    base[k] = i0.to_usize().unwrap_or(1).clamp(1, grid.sizes[k] - 3) - 1;
                    for (j, w) in weights[k].iter_mut().enumerate() {
                        *w = cubic_weight(t + F::one() - F::cast(j));
                    }
                }
                for c in 0..nnz {
                    let mut rest = c;
                    let mut flat = 0;
                    let mut w = F::one();
                    for k in (0..d).rev() {
                        let j = rest % STENCIL;
                        rest /= STENCIL;
                        flat += (base[k] + j) * strides[k];
                        w *= weights[k][j];
                    }
                    idx[c] = flat;
                    val[c] = w;
                }
            });
        Ok(InterpolationMatrix {
            ncols: grid.len(),
            indices,
            values,
        })
    }

    /// Number of interpolated points
    pub fn nrows(&self) -> usize {
        self.indices.nrows()
    }

    /// Number of grid points
    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// Grid indices of the nonzeros, one row per point
    pub fn indices(&self) -> &Array2<usize> {
        &self.indices
    }

    /// Weights of the nonzeros, one row per point
    pub fn values(&self) -> &Array2<F> {
        &self.values
    }

    /// `W v` for a grid vector `v`
    pub fn matvec(&self, v: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Array1<F> {
        let mut res = Array1::zeros(self.nrows());
        Zip::from(&mut res)
            .and(self.indices.rows())
            .and(self.values.rows())
            .for_each(|r, idx, val| {
                *r = idx
                    .iter()
                    .zip(val.iter())
                    .fold(F::zero(), |acc, (&i, &w)| acc + w * v[i]);
            });
        res
    }

    /// `W^T u` for a point vector `u`
    pub fn t_matvec(&self, u: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Array1<F> {
        let mut res = Array1::zeros(self.ncols);
        for ((idx, val), &ui) in self
            .indices
            .rows()
            .into_iter()
            .zip(self.values.rows())
            .zip(u.iter())
        {
            for (&i, &w) in idx.iter().zip(val.iter()) {
                res[i] += w * ui;
            }
        }
        res
    }

    /// `W R` for a dense (grid size, k) matrix `R`
    pub fn dot_dense(&self, r: &ArrayBase<impl Data<Elem = F> + Sync, Ix2>) -> Result<Array2<F>> {
        if r.nrows() != self.ncols {
            return Err(GpError::dimension_mismatch(
                "interpolated matrix rows",
                self.ncols,
                r.nrows(),
            ));
        }
        let mut res = Array2::zeros((self.nrows(), r.ncols()));
        Zip::from(res.rows_mut())
            .and(self.indices.rows())
            .and(self.values.rows())
            .par_for_each(|mut row, idx, val| {
                for (&i, &w) in idx.iter().zip(val.iter()) {
                    row.scaled_add(w, &r.row(i));
                }
            });
        Ok(res)
    }

    /// Row `i` as a dense grid vector
    pub fn row_dense(&self, i: usize) -> Array1<F> {
        let mut row = Array1::zeros(self.ncols);
        for (&j, &w) in self.indices.row(i).iter().zip(self.values.row(i).iter()) {
            row[j] += w;
        }
        row
    }

    /// Dense (n, grid size) matrix
    pub fn to_dense(&self) -> Array2<F> {
        let mut dense = Array2::zeros((self.nrows(), self.ncols));
        for i in 0..self.nrows() {
            dense.row_mut(i).assign(&self.row_dense(i));
        }
        dense
    }
}

fn bounded_inputs<F: Float>(
    grid: &Grid<F>,
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    policy: BoundsPolicy,
) -> Result<Array2<F>> {
    let mut x = x.to_owned();
    let mut n_clamped = 0;
    for (k, &(lo, up)) in grid.bounds.iter().enumerate() {
        let tol = (up - lo) * F::cast(1e-9);
        for v in x.column_mut(k).iter_mut() {
            if !v.is_finite() || *v < lo - tol || *v > up + tol {
                match policy {
                    BoundsPolicy::Reject => {
                        return Err(GpError::OutOfBoundsInput {
                            dim: k,
                            value: to_f64(*v),
                            lower: to_f64(lo),
                            upper: to_f64(up),
                        })
                    }
                    BoundsPolicy::Clamp => {
                        if !v.is_finite() {
                            return Err(GpError::NumericalInstability(
                                "non finite interpolated input".to_string(),
                            ));
                        }
                        n_clamped += 1;
                    }
                }
            }
            *v = v.max(lo).min(up);
        }
    }
    if n_clamped > 0 {
        warn!("{n_clamped} input values clamped into the interpolation grid bounds");
    }
    Ok(x)
}

/// The structured covariance `W1 K_grid W2^T`
#[derive(Clone, Debug)]
pub struct InterpolatedCovariance<F: Float> {
    left: Arc<InterpolationMatrix<F>>,
    right: Arc<InterpolationMatrix<F>>,
    grid: KroneckerToeplitz<F>,
}

impl<F: Float> InterpolatedCovariance<F> {
    /// Covariance between the rows of `left` and `right` interpolated from `grid`
    pub fn new(
        left: Arc<InterpolationMatrix<F>>,
        right: Arc<InterpolationMatrix<F>>,
        grid: KroneckerToeplitz<F>,
    ) -> Result<Self> {
        for w in [&left, &right] {
            if w.ncols() != grid.size() {
                return Err(GpError::dimension_mismatch(
                    "interpolation grid",
                    grid.size(),
                    w.ncols(),
                ));
            }
        }
        Ok(InterpolatedCovariance { left, right, grid })
    }

    /// Shape (n1, n2)
    pub fn dim(&self) -> (usize, usize) {
        (self.left.nrows(), self.right.nrows())
    }

    /// Left interpolation matrix
    pub fn left(&self) -> &InterpolationMatrix<F> {
        &self.left
    }

    /// Right interpolation matrix
    pub fn right(&self) -> &InterpolationMatrix<F> {
        &self.right
    }

    /// Grid covariance
    pub fn grid(&self) -> &KroneckerToeplitz<F> {
        &self.grid
    }

    /// Same structure multiplied by `s`
    pub fn scaled(&self, s: F) -> Self {
        InterpolatedCovariance {
            left: Arc::clone(&self.left),
            right: Arc::clone(&self.right),
            grid: self.grid.scaled(s),
        }
    }

    /// Same interpolation with another grid covariance
    pub fn with_grid(&self, grid: KroneckerToeplitz<F>) -> Self {
        InterpolatedCovariance {
            left: Arc::clone(&self.left),
            right: Arc::clone(&self.right),
            grid,
        }
    }

    /// `W1 K_grid W2^T v` without forming the dense product
    pub fn matvec(&self, v: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<Array1<F>> {
        if v.len() != self.right.nrows() {
            return Err(GpError::dimension_mismatch(
                "interpolated covariance vector",
                self.right.nrows(),
                v.len(),
            ));
        }
        let kv = self.grid.matvec(&self.right.t_matvec(v))?;
        Ok(self.left.matvec(&kv))
    }

    /// `K_grid W2^T` as a (grid size, n2) matrix
    pub fn grid_times_right_t(&self) -> Result<Array2<F>> {
        let columns = (0..self.right.nrows())
            .into_par_iter()
            .map(|j| self.grid.matvec(&self.right.row_dense(j)))
            .collect::<Result<Vec<_>>>()?;
        let mut res = Array2::zeros((self.grid.size(), columns.len()));
        for (j, col) in columns.iter().enumerate() {
            res.column_mut(j).assign(col);
        }
        Ok(res)
    }

    /// Dense (n1, n2) matrix
    pub fn to_dense(&self) -> Result<Array2<F>> {
        let kw = self.grid_times_right_t()?;
        let mut dense = Array2::zeros(self.dim());
        Zip::from(dense.columns_mut())
            .and(kw.columns())
            .par_for_each(|mut col, kwj| col.assign(&self.left.matvec(&kwj)));
        Ok(dense)
    }

    /// Diagonal entries (i, i) for i < min(n1, n2)
    pub fn diag(&self) -> Array1<F> {
        let n = self.left.nrows().min(self.right.nrows());
        let mut diag = Array1::zeros(n);
        Zip::indexed(&mut diag).par_for_each(|i, d| {
            let (li, lv) = (self.left.indices.row(i), self.left.values.row(i));
            let (ri, rv) = (self.right.indices.row(i), self.right.values.row(i));
            let mut acc = F::zero();
            for (&a, &wa) in li.iter().zip(lv.iter()) {
                for (&b, &wb) in ri.iter().zip(rv.iter()) {
                    acc += wa * wb * self.grid.entry(a, b);
                }
            }
            *d = acc;
        });
        diag
    }
}

/// A kernel interpolated from a regular grid (KISS-GP) wrapping a separable stationary kernel
#[derive(Clone, Debug)]
pub struct GridInterpolationKernel<F: Float, K> {
    base: K,
    grid: Grid<F>,
    policy: BoundsPolicy,
}

impl<F: Float, K: Kernel<F>> GridInterpolationKernel<F, K> {
    /// `grid_size` points per dimension over `grid_bounds` (one pair per input dimension)
    pub fn new(base: K, grid_size: usize, grid_bounds: &[(F, F)]) -> Result<Self> {
        Self::from_grid(base, Grid::new(grid_bounds, grid_size)?)
    }

    /// Interpolation from a given grid
    pub fn from_grid(base: K, grid: Grid<F>) -> Result<Self> {
        if let Some(d) = base.input_dim() {
            if d != grid.num_dims() {
                return Err(GpError::dimension_mismatch(
                    "grid dimensions",
                    d,
                    grid.num_dims(),
                ));
            }
        }
        if base.grid_factors(&grid.offsets()).is_none() {
            return Err(GpError::Configuration(
                "grid interpolation requires a separable stationary base kernel".to_string(),
            ));
        }
        Ok(GridInterpolationKernel {
            base,
            grid,
            policy: BoundsPolicy::default(),
        })
    }

    /// Set the behaviour for inputs outside the grid bounds
    pub fn with_bounds_policy(mut self, policy: BoundsPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Interpolation grid
    pub fn grid(&self) -> &Grid<F> {
        &self.grid
    }

    /// Base kernel evaluated on the grid
    pub fn base(&self) -> &K {
        &self.base
    }

    /// Interpolation matrix of the rows of `x`
    pub fn interpolate(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<InterpolationMatrix<F>> {
        InterpolationMatrix::cubic(&self.grid, x, self.policy)
    }

    /// Base kernel on the grid as a Kronecker product of Toeplitz matrices
    pub fn grid_covariance(&self) -> Result<KroneckerToeplitz<F>> {
        let factors = self.factors()?;
        KroneckerToeplitz::new(factors.scale, factors.columns)
    }

    /// `W K_grid W^T v` for the rows of `x`
    pub fn multiply(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        v: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<Array1<F>> {
        let w = Arc::new(self.interpolate(x)?);
        InterpolatedCovariance::new(Arc::clone(&w), w, self.grid_covariance()?)?.matvec(v)
    }

    fn factors(&self) -> Result<crate::kernels::GridFactors<F>> {
        self.base.grid_factors(&self.grid.offsets()).ok_or_else(|| {
            GpError::Configuration(
                "grid interpolation requires a separable stationary base kernel".to_string(),
            )
        })
    }

    fn interpolated(
        &self,
        x1: &ArrayBase<impl Data<Elem = F>, Ix2>,
        x2: &ArrayBase<impl Data<Elem = F>, Ix2>,
        grid: KroneckerToeplitz<F>,
    ) -> Result<InterpolatedCovariance<F>> {
        let left = Arc::new(self.interpolate(x1)?);
        let right = Arc::new(self.interpolate(x2)?);
        InterpolatedCovariance::new(left, right, grid)
    }
}

impl<F: Float, K: Kernel<F>> Kernel<F> for GridInterpolationKernel<F, K> {
    fn input_dim(&self) -> Option<usize> {
        Some(self.grid.num_dims())
    }

    fn value(
        &self,
        x1: &ArrayBase<impl Data<Elem = F>, Ix2>,
        x2: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Array2<F>> {
        self.interpolated(x1, x2, self.grid_covariance()?)?
            .to_dense()
    }

    fn diag(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array1<F>> {
        Ok(self.interpolated(x, x, self.grid_covariance()?)?.diag())
    }

    fn value_with_gradients(
        &self,
        x1: &ArrayBase<impl Data<Elem = F>, Ix2>,
        x2: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<(Array2<F>, Vec<Array2<F>>)> {
        let factors = self.factors()?;
        let k_grid = KroneckerToeplitz::new(factors.scale, factors.columns.clone())?;
        let cov = self.interpolated(x1, x2, k_grid.clone())?;
        let value = cov.to_dense()?;
        let mut grads = Vec::with_capacity(factors.derivatives.len());
        for terms in factors.derivatives {
            let mut grad = Array2::zeros(cov.dim());
            for term in terms {
                match term {
                    GridTerm::Whole => grad += &value,
                    GridTerm::Factor { dim, column } => {
                        grad += &cov.with_grid(k_grid.with_factor(dim, column)?).to_dense()?
                    }
                }
            }
            grads.push(grad);
        }
        Ok((value, grads))
    }

    fn hyperparameters(&self) -> Array1<F> {
        self.base.hyperparameters()
    }

    fn set_hyperparameters(&mut self, raw: &Array1<F>) -> Result<()> {
        self.base.set_hyperparameters(raw)
    }

    fn hyperparameter_names(&self) -> Vec<String> {
        self.base.hyperparameter_names()
    }

    fn structured(
        &self,
        x1: &ArrayBase<impl Data<Elem = F>, Ix2>,
        x2: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Option<InterpolatedCovariance<F>>> {
        Ok(Some(self.interpolated(x1, x2, self.grid_covariance()?)?))
    }
}
