//! A module for covariance functions (kernels) k(x, x') used by GP models.
//!
//! The following kernels are implemented:
//! * squared exponential (RBF) with shared or ARD lengthscales,
//! * Matérn 5/2 as a product of one dimensional factors,
//! * an output scale wrapper around any other kernel.
//!
//! Hyperparameters are handled in an unconstrained *raw* space (log values)
//! so that any real vector given by an optimizer maps to a valid kernel.

use crate::errors::{GpError, Result};
use crate::interpolation::InterpolatedCovariance;
use crate::utils::axis_differences;
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2, Zip};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// One term of the derivative of a grid covariance w.r.t. a raw hyperparameter
#[derive(Clone, Debug)]
pub enum GridTerm<F: Float> {
    /// The derivative is the grid covariance itself
    Whole,
    /// The derivative replaces the Toeplitz factor of dimension `dim` by `column`
    Factor {
        /// Dimension of the replaced factor
        dim: usize,
        /// First column of the derivative factor
        column: Array1<F>,
    },
}

/// Separable description of a stationary kernel evaluated on a regular grid:
/// `K_grid = scale * T_1 ⊗ ... ⊗ T_d` where each `T_k` is symmetric Toeplitz.
#[derive(Clone, Debug)]
pub struct GridFactors<F: Float> {
    /// Output scale multiplying the Kronecker product
    pub scale: F,
    /// First columns of the Toeplitz factors
    pub columns: Vec<Array1<F>>,
    /// For each raw hyperparameter, the sum of terms giving the derivative
    pub derivatives: Vec<Vec<GridTerm<F>>>,
}

/// A trait for covariance functions
pub trait Kernel<F: Float>: Clone + fmt::Debug + Send + Sync {
    /// Input dimension required by the kernel, `None` when any dimension is accepted
    fn input_dim(&self) -> Option<usize>;

    /// Covariance matrix between `x1` (n1, d) and `x2` (n2, d) points as a (n1, n2) matrix
    fn value(
        &self,
        x1: &ArrayBase<impl Data<Elem = F>, Ix2>,
        x2: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Array2<F>>;

    /// Diagonal of `value(x, x)`
    fn diag(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array1<F>>;

    /// Covariance matrix and its derivatives w.r.t. each raw hyperparameter
    fn value_with_gradients(
        &self,
        x1: &ArrayBase<impl Data<Elem = F>, Ix2>,
        x2: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<(Array2<F>, Vec<Array2<F>>)>;

    /// Raw (unconstrained) hyperparameters
    fn hyperparameters(&self) -> Array1<F>;

    /// Set raw hyperparameters, the length has to match [Kernel::hyperparameters]
    fn set_hyperparameters(&mut self, raw: &Array1<F>) -> Result<()>;

    /// Names of the raw hyperparameters
    fn hyperparameter_names(&self) -> Vec<String>;

    /// Toeplitz description on a regular grid given per dimension offsets `j * h_k`.
    /// Only separable stationary kernels support it.
    fn grid_factors(&self, _offsets: &[Array1<F>]) -> Option<GridFactors<F>> {
        None
    }

    /// Structured form `W1 K_grid W2^T` of `value(x1, x2)` when the kernel interpolates from a grid
    fn structured(
        &self,
        _x1: &ArrayBase<impl Data<Elem = F>, Ix2>,
        _x2: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Option<InterpolatedCovariance<F>>> {
        Ok(None)
    }

    /// Checks `x` columns against the kernel input dimension
    fn check_input(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<()> {
        match self.input_dim() {
            Some(d) if d != x.ncols() => {
                Err(GpError::dimension_mismatch("kernel input", d, x.ncols()))
            }
            _ => Ok(()),
        }
    }
}

fn check_pair<F: Float>(
    x1: &ArrayBase<impl Data<Elem = F>, Ix2>,
    x2: &ArrayBase<impl Data<Elem = F>, Ix2>,
    n_lengthscales: usize,
) -> Result<()> {
    if x1.ncols() != x2.ncols() {
        return Err(GpError::dimension_mismatch(
            "kernel inputs",
            x1.ncols(),
            x2.ncols(),
        ));
    }
    if n_lengthscales > 1 && n_lengthscales != x1.ncols() {
        return Err(GpError::dimension_mismatch(
            "ARD lengthscales",
            n_lengthscales,
            x1.ncols(),
        ));
    }
    Ok(())
}

fn check_lengthscales<F: Float>(lengthscales: &Array1<F>) -> Result<()> {
    if lengthscales.is_empty() {
        return Err(GpError::Configuration(
            "at least one lengthscale is required".to_string(),
        ));
    }
    if lengthscales.iter().any(|l| !(*l > F::zero()) || !l.is_finite()) {
        return Err(GpError::Configuration(format!(
            "lengthscales should be positive, got {lengthscales}"
        )));
    }
    Ok(())
}

/// One dimensional profile p(u) of a separable stationary kernel
/// k(x, x') = prod_k p((x_k - x'_k) / l_k), with r(u) = d log p / d log l
trait Profile {
    fn value<F: Float>(u: F) -> F;
    fn dlog_lengthscale<F: Float>(u: F) -> F;
}

fn separable_value<F: Float, P: Profile>(
    x1: &ArrayBase<impl Data<Elem = F>, Ix2>,
    x2: &ArrayBase<impl Data<Elem = F>, Ix2>,
    lengthscales: &Array1<F>,
    with_gradients: bool,
) -> (Array2<F>, Vec<Array2<F>>) {
    let dim = x1.ncols();
    let mut k = Array2::ones((x1.nrows(), x2.nrows()));
    let mut ratios = Vec::with_capacity(if with_gradients { dim } else { 0 });
    for d in 0..dim {
        let l = if lengthscales.len() == 1 {
            lengthscales[0]
        } else {
            lengthscales[d]
        };
        let u = axis_differences(x1, x2, d).mapv(|v| v / l);
        Zip::from(&mut k).and(&u).par_for_each(|k, &u| {
            *k *= P::value::<F>(u);
        });
        if with_gradients {
            ratios.push(u.mapv(P::dlog_lengthscale::<F>));
        }
    }
    if !with_gradients {
        return (k, vec![]);
    }
    let grads = if lengthscales.len() == 1 {
        let sum = ratios
            .into_iter()
            .fold(Array2::zeros(k.raw_dim()), |acc, r| acc + r);
        vec![&k * &sum]
    } else {
        ratios.into_iter().map(|r| &k * &r).collect()
    };
    (k, grads)
}

fn separable_grid_factors<F: Float, P: Profile>(
    offsets: &[Array1<F>],
    lengthscales: &Array1<F>,
) -> Option<GridFactors<F>> {
    if lengthscales.len() > 1 && lengthscales.len() != offsets.len() {
        return None;
    }
    let mut columns = Vec::with_capacity(offsets.len());
    let mut dcolumns = Vec::with_capacity(offsets.len());
    for (d, off) in offsets.iter().enumerate() {
        let l = if lengthscales.len() == 1 {
            lengthscales[0]
        } else {
            lengthscales[d]
        };
        let u = off.mapv(|v| v / l);
        let col = u.mapv(P::value::<F>);
        dcolumns.push(&col * &u.mapv(P::dlog_lengthscale::<F>));
        columns.push(col);
    }
    let derivatives = if lengthscales.len() == 1 {
        vec![dcolumns
            .into_iter()
            .enumerate()
            .map(|(dim, column)| GridTerm::Factor { dim, column })
            .collect()]
    } else {
        dcolumns
            .into_iter()
            .enumerate()
            .map(|(dim, column)| vec![GridTerm::Factor { dim, column }])
            .collect()
    };
    Some(GridFactors {
        scale: F::one(),
        columns,
        derivatives,
    })
}

fn lengthscale_names(n: usize) -> Vec<String> {
    if n == 1 {
        vec!["lengthscale".to_string()]
    } else {
        (0..n).map(|i| format!("lengthscale_{i}")).collect()
    }
}

struct Gaussian;

impl Profile for Gaussian {
    fn value<F: Float>(u: F) -> F {
        (-F::cast(0.5) * u * u).exp()
    }
    fn dlog_lengthscale<F: Float>(u: F) -> F {
        u * u
    }
}

struct Matern52;

impl Profile for Matern52 {
    fn value<F: Float>(u: F) -> F {
        let a = F::cast(5.).sqrt() * u.abs();
        (F::one() + a + a * a / F::cast(3.)) * (-a).exp()
    }
    fn dlog_lengthscale<F: Float>(u: F) -> F {
        let a = F::cast(5.).sqrt() * u.abs();
        let p = F::one() + a + a * a / F::cast(3.);
        a * a * (F::one() + a) / (F::cast(3.) * p)
    }
}

macro_rules! separable_kernel {
    ($name:ident, $profile:ident, $desc:literal) => {
        #[doc = concat!("A ", $desc, " kernel with one shared lengthscale or one lengthscale per input dimension (ARD)")]
        #[derive(Clone, Debug, PartialEq)]
        #[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
        pub struct $name<F: Float> {
            log_lengthscales: Array1<F>,
        }

        impl<F: Float> Default for $name<F> {
            fn default() -> Self {
                $name {
                    log_lengthscales: Array1::zeros(1),
                }
            }
        }

        impl<F: Float> $name<F> {
            /// Kernel with one lengthscale shared by every dimension
            pub fn new(lengthscale: F) -> Result<Self> {
                Self::ard(Array1::from_elem(1, lengthscale))
            }

            /// Kernel with one lengthscale per input dimension
            pub fn ard(lengthscales: Array1<F>) -> Result<Self> {
                check_lengthscales(&lengthscales)?;
                Ok($name {
                    log_lengthscales: lengthscales.mapv(|l| l.ln()),
                })
            }

            /// Current lengthscales
            pub fn lengthscales(&self) -> Array1<F> {
                self.log_lengthscales.mapv(|v| v.exp())
            }
        }

        impl<F: Float> Kernel<F> for $name<F> {
            fn input_dim(&self) -> Option<usize> {
                match self.log_lengthscales.len() {
                    1 => None,
                    n => Some(n),
                }
            }

            fn value(
                &self,
                x1: &ArrayBase<impl Data<Elem = F>, Ix2>,
                x2: &ArrayBase<impl Data<Elem = F>, Ix2>,
            ) -> Result<Array2<F>> {
                check_pair(x1, x2, self.log_lengthscales.len())?;
                Ok(separable_value::<F, $profile>(x1, x2, &self.lengthscales(), false).0)
            }

            fn diag(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array1<F>> {
                check_pair(x, x, self.log_lengthscales.len())?;
                Ok(Array1::ones(x.nrows()))
            }

            fn value_with_gradients(
                &self,
                x1: &ArrayBase<impl Data<Elem = F>, Ix2>,
                x2: &ArrayBase<impl Data<Elem = F>, Ix2>,
            ) -> Result<(Array2<F>, Vec<Array2<F>>)> {
                check_pair(x1, x2, self.log_lengthscales.len())?;
                Ok(separable_value::<F, $profile>(x1, x2, &self.lengthscales(), true))
            }

            fn hyperparameters(&self) -> Array1<F> {
                self.log_lengthscales.to_owned()
            }

            fn set_hyperparameters(&mut self, raw: &Array1<F>) -> Result<()> {
                if raw.len() != self.log_lengthscales.len() {
                    return Err(GpError::dimension_mismatch(
                        concat!(stringify!($name), " hyperparameters"),
                        self.log_lengthscales.len(),
                        raw.len(),
                    ));
                }
                self.log_lengthscales.assign(raw);
                Ok(())
            }

            fn hyperparameter_names(&self) -> Vec<String> {
                lengthscale_names(self.log_lengthscales.len())
            }

            fn grid_factors(&self, offsets: &[Array1<F>]) -> Option<GridFactors<F>> {
                separable_grid_factors::<F, $profile>(offsets, &self.lengthscales())
            }
        }
    };
}

separable_kernel!(RbfKernel, Gaussian, "squared exponential (RBF)");
separable_kernel!(Matern52Kernel, Matern52, "Matérn 5/2 product");

/// Multiplies an inner kernel by a positive output scale stored in log-space
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct ScaleKernel<F: Float, K> {
    inner: K,
    log_outputscale: F,
}

impl<F: Float, K: Kernel<F>> ScaleKernel<F, K> {
    /// Wraps `inner` with an output scale of 1
    pub fn new(inner: K) -> Self {
        ScaleKernel {
            inner,
            log_outputscale: F::zero(),
        }
    }

    /// Set the output scale (has to be positive)
    pub fn with_outputscale(mut self, outputscale: F) -> Result<Self> {
        if !(outputscale > F::zero()) {
            return Err(GpError::Configuration(format!(
                "outputscale should be positive, got {outputscale}"
            )));
        }
        self.log_outputscale = outputscale.ln();
        Ok(self)
    }

    /// Current output scale
    pub fn outputscale(&self) -> F {
        self.log_outputscale.exp()
    }

    /// Wrapped kernel
    pub fn inner(&self) -> &K {
        &self.inner
    }
}

impl<F: Float, K: Kernel<F>> Kernel<F> for ScaleKernel<F, K> {
    fn input_dim(&self) -> Option<usize> {
        self.inner.input_dim()
    }

    fn value(
        &self,
        x1: &ArrayBase<impl Data<Elem = F>, Ix2>,
        x2: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Array2<F>> {
        let s = self.outputscale();
        Ok(self.inner.value(x1, x2)?.mapv(|v| v * s))
    }

    fn diag(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array1<F>> {
        let s = self.outputscale();
        Ok(self.inner.diag(x)?.mapv(|v| v * s))
    }

    fn value_with_gradients(
        &self,
        x1: &ArrayBase<impl Data<Elem = F>, Ix2>,
        x2: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<(Array2<F>, Vec<Array2<F>>)> {
        let s = self.outputscale();
        let (k, grads) = self.inner.value_with_gradients(x1, x2)?;
        let k = k.mapv(|v| v * s);
        let mut grads: Vec<Array2<F>> = grads.into_iter().map(|g| g.mapv(|v| v * s)).collect();
        // d(s k)/d(log s) = s k
        grads.push(k.to_owned());
        Ok((k, grads))
    }

    fn hyperparameters(&self) -> Array1<F> {
        let mut raw = self.inner.hyperparameters().to_vec();
        raw.push(self.log_outputscale);
        Array1::from_vec(raw)
    }

    fn set_hyperparameters(&mut self, raw: &Array1<F>) -> Result<()> {
        let n_inner = self.inner.hyperparameters().len();
        if raw.len() != n_inner + 1 {
            return Err(GpError::dimension_mismatch(
                "ScaleKernel hyperparameters",
                n_inner + 1,
                raw.len(),
            ));
        }
        self.inner
            .set_hyperparameters(&raw.slice(ndarray::s![..n_inner]).to_owned())?;
        self.log_outputscale = raw[n_inner];
        Ok(())
    }

    fn hyperparameter_names(&self) -> Vec<String> {
        let mut names = self.inner.hyperparameter_names();
        names.push("outputscale".to_string());
        names
    }

    fn grid_factors(&self, offsets: &[Array1<F>]) -> Option<GridFactors<F>> {
        let mut factors = self.inner.grid_factors(offsets)?;
        factors.scale *= self.outputscale();
        factors.derivatives.push(vec![GridTerm::Whole]);
        Some(factors)
    }

    fn structured(
        &self,
        x1: &ArrayBase<impl Data<Elem = F>, Ix2>,
        x2: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Option<InterpolatedCovariance<F>>> {
        let s = self.outputscale();
        Ok(self.inner.structured(x1, x2)?.map(|c| c.scaled(s)))
    }
}
