//! Multivariate normal distributions produced by GP models.
//!
//! The covariance is kept in the cheapest available form: dense, diagonal, zero
//! (point mass) or interpolated from a grid with an added diagonal.

use crate::errors::{GpError, Result};
use crate::interpolation::InterpolatedCovariance;
use crate::utils::{cholesky_logdet, jittered_cholesky, solve_lower, DEFAULT_JITTER};
use linfa::Float;
use linfa_linalg::eigh::*;
use ndarray::{Array, Array1, Array2, ArrayBase, Axis, Data, Ix1};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;

/// Covariance representations
#[derive(Clone, Debug)]
pub enum Covariance<F: Float> {
    /// Dense symmetric matrix
    Dense(Array2<F>),
    /// Diagonal matrix given by its diagonal
    Diagonal(Array1<F>),
    /// Zero matrix of the given size
    Zero(usize),
    /// `W1 K_grid W2^T + diag(noise)`
    Interpolated {
        /// Grid interpolated covariance
        operator: InterpolatedCovariance<F>,
        /// Added diagonal
        noise: Array1<F>,
    },
}

impl<F: Float> Covariance<F> {
    /// Size of the (square) matrix
    pub fn dim(&self) -> usize {
        match self {
            Covariance::Dense(m) => m.nrows(),
            Covariance::Diagonal(d) => d.len(),
            Covariance::Zero(n) => *n,
            Covariance::Interpolated { noise, .. } => noise.len(),
        }
    }

    /// Diagonal entries
    pub fn diag(&self) -> Array1<F> {
        match self {
            Covariance::Dense(m) => m.diag().to_owned(),
            Covariance::Diagonal(d) => d.to_owned(),
            Covariance::Zero(n) => Array1::zeros(*n),
            Covariance::Interpolated { operator, noise } => operator.diag() + noise,
        }
    }

    /// Dense matrix
    pub fn to_dense(&self) -> Result<Array2<F>> {
        match self {
            Covariance::Dense(m) => Ok(m.to_owned()),
            Covariance::Diagonal(d) => Ok(Array2::from_diag(d)),
            Covariance::Zero(n) => Ok(Array2::zeros((*n, *n))),
            Covariance::Interpolated { operator, noise } => {
                let mut m = operator.to_dense()?;
                m.diag_mut().zip_mut_with(noise, |a, &b| *a += b);
                Ok(m)
            }
        }
    }

    /// Matrix vector product
    pub fn matvec(&self, v: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<Array1<F>> {
        if v.len() != self.dim() {
            return Err(GpError::dimension_mismatch(
                "covariance vector",
                self.dim(),
                v.len(),
            ));
        }
        match self {
            Covariance::Dense(m) => Ok(m.dot(v)),
            Covariance::Diagonal(d) => Ok(d * v),
            Covariance::Zero(n) => Ok(Array1::zeros(*n)),
            Covariance::Interpolated { operator, noise } => Ok(operator.matvec(v)? + noise * v),
        }
    }

    /// Same covariance plus `diag(d)`
    pub fn add_diag(&self, d: &Array1<F>) -> Covariance<F> {
        match self {
            Covariance::Dense(m) => {
                let mut m = m.to_owned();
                m.diag_mut().zip_mut_with(d, |a, &b| *a += b);
                Covariance::Dense(m)
            }
            Covariance::Diagonal(v) => Covariance::Diagonal(v + d),
            Covariance::Zero(_) => Covariance::Diagonal(d.to_owned()),
            Covariance::Interpolated { operator, noise } => Covariance::Interpolated {
                operator: operator.clone(),
                noise: noise + d,
            },
        }
    }
}

/// A multivariate normal distribution N(mean, covariance), immutable once built
#[derive(Clone, Debug)]
pub struct MultivariateNormal<F: Float> {
    mean: Array1<F>,
    covariance: Covariance<F>,
}

impl<F: Float> MultivariateNormal<F> {
    /// Builds the distribution checking sizes, finiteness and symmetry of dense covariances
    pub fn new(mean: Array1<F>, covariance: Covariance<F>) -> Result<Self> {
        if mean.len() != covariance.dim() {
            return Err(GpError::dimension_mismatch(
                "normal distribution covariance",
                mean.len(),
                covariance.dim(),
            ));
        }
        if mean.iter().any(|v| !v.is_finite()) {
            return Err(GpError::NumericalInstability(
                "non finite mean".to_string(),
            ));
        }
        match &covariance {
            Covariance::Dense(m) => {
                if !m.is_square() {
                    return Err(GpError::dimension_mismatch(
                        "dense covariance columns",
                        m.nrows(),
                        m.ncols(),
                    ));
                }
                let scale = m.iter().fold(F::zero(), |acc, v| acc.max(v.abs()));
                let tol = F::cast(1e-8) * scale.max(F::one());
                for ((i, j), &v) in m.indexed_iter() {
                    if !v.is_finite() || (j > i && (v - m[[j, i]]).abs() > tol) {
                        return Err(GpError::NumericalInstability(format!(
                            "covariance is not symmetric or not finite at ({i}, {j})"
                        )));
                    }
                }
            }
            Covariance::Diagonal(d) => {
                if d.iter().any(|v| !v.is_finite() || *v < F::zero()) {
                    return Err(GpError::NumericalInstability(
                        "diagonal covariance with negative or non finite values".to_string(),
                    ));
                }
            }
            _ => (),
        }
        Ok(MultivariateNormal { mean, covariance })
    }

    /// Number of variables
    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Mean vector
    pub fn mean(&self) -> &Array1<F> {
        &self.mean
    }

    /// Covariance representation
    pub fn covariance(&self) -> &Covariance<F> {
        &self.covariance
    }

    /// Dense covariance matrix
    pub fn covariance_matrix(&self) -> Result<Array2<F>> {
        self.covariance.to_dense()
    }

    /// Marginal variances (negative round-off values are set to zero)
    pub fn variance(&self) -> Array1<F> {
        self.covariance.diag().mapv(|v| v.max(F::zero()))
    }

    /// Marginal standard deviations
    pub fn stddev(&self) -> Array1<F> {
        self.variance().mapv(|v| v.sqrt())
    }

    /// Two standard deviations below and above the mean
    pub fn confidence_region(&self) -> (Array1<F>, Array1<F>) {
        let two_sigma = self.stddev().mapv(|s| s * F::cast(2.));
        (&self.mean - &two_sigma, &self.mean + &two_sigma)
    }

    /// Log density at `y`
    pub fn log_prob(&self, y: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<F> {
        if y.len() != self.dim() {
            return Err(GpError::dimension_mismatch(
                "log probability target",
                self.dim(),
                y.len(),
            ));
        }
        let n = F::cast(self.dim());
        let log_2pi = F::cast(2. * std::f64::consts::PI).ln();
        let r = y - &self.mean;
        match &self.covariance {
            Covariance::Zero(_) => Err(GpError::NumericalInstability(
                "log density of a point mass distribution".to_string(),
            )),
            Covariance::Diagonal(d) => {
                if d.iter().any(|v| *v <= F::zero()) {
                    return Err(GpError::NumericalInstability(
                        "log density with a zero variance".to_string(),
                    ));
                }
                let quad = (&r * &r / d).sum();
                let logdet = d.mapv(|v| v.ln()).sum();
                Ok(-F::cast(0.5) * (quad + logdet + n * log_2pi))
            }
            cov => {
                let l = jittered_cholesky(&cov.to_dense()?, F::cast(DEFAULT_JITTER), "normal")?;
                let z = solve_lower(&l, &r.insert_axis(Axis(1)))?;
                let quad = z.mapv(|v| v * v).sum();
                Ok(-F::cast(0.5) * (quad + cholesky_logdet(&l) + n * log_2pi))
            }
        }
    }

    /// Draws `n_samples` samples returned as a (dim, n_samples) matrix.
    ///
    /// Dense covariances are decomposed with eigenvalues, small or negative eigenvalues
    /// being set to zero.
    pub fn sample<R: Rng>(&self, n_samples: usize, rng: &mut R) -> Result<Array2<F>> {
        let n = self.dim();
        let z = Array::random_using((n, n_samples), StandardNormal, rng).mapv(|v: f64| F::cast(v));
        let centered = match &self.covariance {
            Covariance::Zero(_) => Array2::zeros((n, n_samples)),
            Covariance::Diagonal(d) => &z * &d.mapv(|v| v.sqrt()).insert_axis(Axis(1)),
            cov => {
                let (v, w) = cov.to_dense()?.eigh_into()?;
                let v = v.mapv(|x| {
                    // eigenvalues lower bounded at 1e-9
                    if x < F::cast(1e-9) {
                        return F::zero();
                    }
                    x.sqrt()
                });
                (w * &v).dot(&z)
            }
        };
        Ok(centered + &self.mean.view().insert_axis(Axis(1)))
    }
}
