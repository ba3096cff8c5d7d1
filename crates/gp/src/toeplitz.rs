//! Structured covariance matrices over regular grids.
//!
//! A stationary kernel evaluated on a regular 1D grid gives a symmetric Toeplitz matrix,
//! its product with a vector is computed in O(g log g) by embedding it in a circulant
//! matrix diagonalized by the FFT. On a d-dimensional lattice a separable kernel gives a
//! Kronecker product of such matrices whose product with a vector is done one axis at a time.

use crate::errors::{GpError, Result};
use crate::utils::to_f64;
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix1, IxDyn, Zip};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::fmt;
use std::sync::Arc;

/// A symmetric Toeplitz matrix given by its first column
#[derive(Clone)]
pub struct ToeplitzMatrix<F: Float> {
    column: Array1<F>,
    /// FFT of the first column of the circulant embedding
    spectrum: Arc<Vec<Complex<f64>>>,
    fft: Arc<dyn Fft<f64>>,
    ifft: Arc<dyn Fft<f64>>,
}

impl<F: Float> fmt::Debug for ToeplitzMatrix<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ToeplitzMatrix")
            .field("column", &self.column)
            .finish()
    }
}

impl<F: Float> ToeplitzMatrix<F> {
    /// Symmetric Toeplitz matrix with first column `column`
    pub fn new(column: Array1<F>) -> Result<Self> {
        let g = column.len();
        if g == 0 {
            return Err(GpError::Configuration(
                "Toeplitz matrix needs a non empty column".to_string(),
            ));
        }
        // circulant embedding [c0 .. c(g-1), c(g-2) .. c1]
        let n = (2 * g).saturating_sub(2).max(1);
        let mut circ: Vec<Complex<f64>> = Vec::with_capacity(n);
        circ.extend(column.iter().map(|&v| Complex::new(to_f64(v), 0.)));
        circ.extend(
            column
                .iter()
                .skip(1)
                .take(g.saturating_sub(2))
                .rev()
                .map(|&v| Complex::new(to_f64(v), 0.)),
        );
        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(n);
        let ifft = planner.plan_fft_inverse(n);
        fft.process(&mut circ);
        Ok(ToeplitzMatrix {
            column,
            spectrum: Arc::new(circ),
            fft,
            ifft,
        })
    }

    /// Matrix size
    pub fn size(&self) -> usize {
        self.column.len()
    }

    /// First column
    pub fn column(&self) -> &Array1<F> {
        &self.column
    }

    /// Entry (i, j)
    pub fn entry(&self, i: usize, j: usize) -> F {
        self.column[i.abs_diff(j)]
    }

    /// Dense matrix
    pub fn to_dense(&self) -> Array2<F> {
        let g = self.size();
        Array2::from_shape_fn((g, g), |(i, j)| self.entry(i, j))
    }

    /// Product with `v` through the circulant embedding
    pub fn matvec(&self, v: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Array1<F> {
        let g = self.size();
        let n = self.spectrum.len();
        let mut buffer = vec![Complex::new(0., 0.); n];
        for (b, &x) in buffer.iter_mut().zip(v.iter()) {
            *b = Complex::new(to_f64(x), 0.);
        }
        self.fft.process(&mut buffer);
        for (b, s) in buffer.iter_mut().zip(self.spectrum.iter()) {
            *b *= s;
        }
        self.ifft.process(&mut buffer);
        let norm = 1. / n as f64;
        Array1::from_iter(buffer.iter().take(g).map(|c| F::cast(c.re * norm)))
    }
}

/// `scale * T_1 ⊗ ... ⊗ T_d` with symmetric Toeplitz factors, indices are in row-major
/// order (last dimension varies fastest)
#[derive(Clone, Debug)]
pub struct KroneckerToeplitz<F: Float> {
    scale: F,
    factors: Vec<ToeplitzMatrix<F>>,
}

impl<F: Float> KroneckerToeplitz<F> {
    /// Kronecker product of Toeplitz matrices built from first `columns`
    pub fn new(scale: F, columns: Vec<Array1<F>>) -> Result<Self> {
        if columns.is_empty() {
            return Err(GpError::Configuration(
                "Kronecker product needs at least one factor".to_string(),
            ));
        }
        let factors = columns
            .into_iter()
            .map(ToeplitzMatrix::new)
            .collect::<Result<Vec<_>>>()?;
        Ok(KroneckerToeplitz { scale, factors })
    }

    /// Same operator with factor `dim` replaced by the Toeplitz matrix of `column`
    pub fn with_factor(&self, dim: usize, column: Array1<F>) -> Result<Self> {
        let current = self.factors.get(dim).ok_or_else(|| {
            GpError::dimension_mismatch("Kronecker factor index", self.factors.len(), dim)
        })?;
        if column.len() != current.size() {
            return Err(GpError::dimension_mismatch(
                "Kronecker factor size",
                current.size(),
                column.len(),
            ));
        }
        let mut factors = self.factors.clone();
        factors[dim] = ToeplitzMatrix::new(column)?;
        Ok(KroneckerToeplitz {
            scale: self.scale,
            factors,
        })
    }

    /// Same operator multiplied by `s`
    pub fn scaled(&self, s: F) -> Self {
        KroneckerToeplitz {
            scale: self.scale * s,
            factors: self.factors.clone(),
        }
    }

    /// Output scale
    pub fn scale(&self) -> F {
        self.scale
    }

    /// Number of points per dimension
    pub fn shape(&self) -> Vec<usize> {
        self.factors.iter().map(|f| f.size()).collect()
    }

    /// Total size (product of the factor sizes)
    pub fn size(&self) -> usize {
        self.factors.iter().map(|f| f.size()).product()
    }

    /// Entry (a, b) where a and b are flat grid indices
    pub fn entry(&self, a: usize, b: usize) -> F {
        let mut a = a;
        let mut b = b;
        let mut value = self.scale;
        for f in self.factors.iter().rev() {
            let g = f.size();
            value *= f.entry(a % g, b % g);
            a /= g;
            b /= g;
        }
        value
    }

    /// Constant diagonal value
    pub fn diag_value(&self) -> F {
        self.factors
            .iter()
            .fold(self.scale, |acc, f| acc * f.column()[0])
    }

    /// Dense matrix, only meant for small grids
    pub fn to_dense(&self) -> Array2<F> {
        let n = self.size();
        Array2::from_shape_fn((n, n), |(a, b)| self.entry(a, b))
    }

    /// Product with `v` applying each Toeplitz factor along its axis
    pub fn matvec(&self, v: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<Array1<F>> {
        let n = self.size();
        if v.len() != n {
            return Err(GpError::dimension_mismatch("grid vector", n, v.len()));
        }
        let mut tensor = v
            .to_owned()
            .into_shape(IxDyn(&self.shape()))
            .map_err(|e| GpError::NumericalInstability(e.to_string()))?;
        for (k, factor) in self.factors.iter().enumerate() {
            Zip::from(tensor.lanes_mut(Axis(k))).par_for_each(|mut lane| {
                let res = factor.matvec(&lane);
                lane.assign(&res);
            });
        }
        let s = self.scale;
        let flat = tensor
            .into_shape(n)
            .map_err(|e| GpError::NumericalInstability(e.to_string()))?;
        Ok(flat.mapv(|x| x * s))
    }
}
