//! A module for mean functions of the GP prior.
//!
//! The following models are implemented:
//! * zero,
//! * constant (learned offset),
//! * linear (learned weights and bias).

use crate::errors::{GpError, Result};
use linfa::Float;
use ndarray::{concatenate, s, Array1, Array2, ArrayBase, Axis, Data, Ix2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// A trait for mean functions m(x) of GP models
pub trait MeanFunction<F: Float>: Clone + fmt::Debug + fmt::Display + Send + Sync {
    /// Mean values at the rows of `x` (n, nx)
    fn value(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array1<F>;

    /// Derivatives of the mean values w.r.t. the parameters as a (n, n_params) matrix
    fn jacobian(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F>;

    /// Parameters
    fn hyperparameters(&self) -> Array1<F>;

    /// Set parameters, the length has to match [MeanFunction::hyperparameters]
    fn set_hyperparameters(&mut self, raw: &Array1<F>) -> Result<()>;

    /// Input dimension required by the mean, `None` when any dimension is accepted
    fn input_dim(&self) -> Option<usize> {
        None
    }
}

fn check_len<F: Float>(what: &str, expected: usize, raw: &Array1<F>) -> Result<()> {
    if raw.len() != expected {
        return Err(GpError::dimension_mismatch(what, expected, raw.len()));
    }
    Ok(())
}

/// m(x) = 0
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct ZeroMean;

impl fmt::Display for ZeroMean {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Zero")
    }
}

impl<F: Float> MeanFunction<F> for ZeroMean {
    fn value(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array1<F> {
        Array1::zeros(x.nrows())
    }

    fn jacobian(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
        Array2::zeros((x.nrows(), 0))
    }

    fn hyperparameters(&self) -> Array1<F> {
        Array1::zeros(0)
    }

    fn set_hyperparameters(&mut self, raw: &Array1<F>) -> Result<()> {
        check_len("ZeroMean parameters", 0, raw)
    }
}

/// m(x) = c
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct ConstantMean<F: Float> {
    constant: F,
}

impl<F: Float> ConstantMean<F> {
    /// Constant mean starting at `constant`
    pub fn new(constant: F) -> Self {
        ConstantMean { constant }
    }

    /// Current constant
    pub fn constant(&self) -> F {
        self.constant
    }
}

impl<F: Float> fmt::Display for ConstantMean<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Constant({})", self.constant)
    }
}

impl<F: Float> MeanFunction<F> for ConstantMean<F> {
    fn value(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array1<F> {
        Array1::from_elem(x.nrows(), self.constant)
    }

    fn jacobian(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
        Array2::ones((x.nrows(), 1))
    }

    fn hyperparameters(&self) -> Array1<F> {
        Array1::from_elem(1, self.constant)
    }

    fn set_hyperparameters(&mut self, raw: &Array1<F>) -> Result<()> {
        check_len("ConstantMean parameters", 1, raw)?;
        self.constant = raw[0];
        Ok(())
    }
}

/// m(x) = w.x + b
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct LinearMean<F: Float> {
    weights: Array1<F>,
    bias: F,
}

impl<F: Float> LinearMean<F> {
    /// Zero weights and bias for `input_dim` dimensional inputs
    pub fn new(input_dim: usize) -> Self {
        LinearMean {
            weights: Array1::zeros(input_dim),
            bias: F::zero(),
        }
    }

    /// Current weights
    pub fn weights(&self) -> &Array1<F> {
        &self.weights
    }

    /// Current bias
    pub fn bias(&self) -> F {
        self.bias
    }
}

impl<F: Float> fmt::Display for LinearMean<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Linear({}, {})", self.weights, self.bias)
    }
}

impl<F: Float> MeanFunction<F> for LinearMean<F> {
    fn value(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array1<F> {
        x.dot(&self.weights).mapv(|v| v + self.bias)
    }

    fn jacobian(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
        concatenate![Axis(1), x.to_owned(), Array2::ones((x.nrows(), 1))]
    }

    fn hyperparameters(&self) -> Array1<F> {
        let mut raw = self.weights.to_vec();
        raw.push(self.bias);
        Array1::from_vec(raw)
    }

    fn set_hyperparameters(&mut self, raw: &Array1<F>) -> Result<()> {
        let n = self.weights.len();
        check_len("LinearMean parameters", n + 1, raw)?;
        self.weights.assign(&raw.slice(s![..n]));
        self.bias = raw[n];
        Ok(())
    }

    fn input_dim(&self) -> Option<usize> {
        Some(self.weights.len())
    }
}
