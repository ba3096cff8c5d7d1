//! Feature extractors applied to raw inputs before the kernel (deep kernel learning).
//!
//! Extractors are fixed maps here: their weights are not trained by the GP objectives.
//! [ScaleToBounds] brings features inside the bounds of an interpolation grid.

use crate::errors::{GpError, Result};
use linfa::Float;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Shrink factor keeping scaled features strictly inside the bounds
pub const SCALE_TO_BOUNDS_SHRINK: f64 = 0.95;

/// A trait for maps from raw inputs (n, d) to features (n, d')
pub trait FeatureExtractor<F: Float>: fmt::Debug + Send + Sync {
    /// Features of the rows of `x`
    fn transform(&self, x: &ArrayView2<F>) -> Result<Array2<F>>;

    /// Feature dimension produced from `input_dim` dimensional inputs
    fn output_dim(&self, input_dim: usize) -> usize;
}

/// Features are the inputs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct IdentityFeatures;

impl<F: Float> FeatureExtractor<F> for IdentityFeatures {
    fn transform(&self, x: &ArrayView2<F>) -> Result<Array2<F>> {
        Ok(x.to_owned())
    }

    fn output_dim(&self, input_dim: usize) -> usize {
        input_dim
    }
}

/// Element-wise activation of a [LinearFeatures] layer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum Activation {
    /// No activation
    #[default]
    Identity,
    /// tanh
    Tanh,
    /// max(0, x)
    Relu,
}

impl Activation {
    fn apply<F: Float>(&self, v: F) -> F {
        match self {
            Activation::Identity => v,
            Activation::Tanh => v.tanh(),
            Activation::Relu => v.max(F::zero()),
        }
    }
}

/// Dense layer `activation(x W + b)`
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct LinearFeatures<F: Float> {
    weights: Array2<F>,
    bias: Array1<F>,
    activation: Activation,
}

impl<F: Float> LinearFeatures<F> {
    /// Layer with `weights` (d, d') and `bias` (d')
    pub fn new(weights: Array2<F>, bias: Array1<F>) -> Result<Self> {
        if weights.ncols() != bias.len() {
            return Err(GpError::dimension_mismatch(
                "linear features bias",
                weights.ncols(),
                bias.len(),
            ));
        }
        Ok(LinearFeatures {
            weights,
            bias,
            activation: Activation::Identity,
        })
    }

    /// Layer with N(0, 1/d) weights and zero bias
    pub fn random<R: Rng>(input_dim: usize, output_dim: usize, rng: &mut R) -> Result<Self> {
        let std = 1. / (input_dim.max(1) as f64).sqrt();
        let normal = Normal::new(0., std).map_err(|e| GpError::Configuration(e.to_string()))?;
        let weights = Array2::random_using((input_dim, output_dim), normal, rng).mapv(F::cast);
        Self::new(weights, Array1::zeros(output_dim))
    }

    /// Sets the activation
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Weights (d, d')
    pub fn weights(&self) -> &Array2<F> {
        &self.weights
    }
}

impl<F: Float> FeatureExtractor<F> for LinearFeatures<F> {
    fn transform(&self, x: &ArrayView2<F>) -> Result<Array2<F>> {
        if x.ncols() != self.weights.nrows() {
            return Err(GpError::dimension_mismatch(
                "linear features input",
                self.weights.nrows(),
                x.ncols(),
            ));
        }
        let act = self.activation;
        Ok((x.dot(&self.weights) + &self.bias).mapv(|v| act.apply(v)))
    }

    fn output_dim(&self, _input_dim: usize) -> usize {
        self.weights.ncols()
    }
}

/// Affine rescaling of all features into `0.95 * [lower, upper]` from the global
/// minimum and maximum of a reference set
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct ScaleToBounds<F: Float> {
    lower: F,
    upper: F,
    range: Option<(F, F)>,
}

impl<F: Float> ScaleToBounds<F> {
    /// Rescaling into `[lower, upper]`, not yet fitted: each transformed batch then uses
    /// its own minimum and maximum
    pub fn new(lower: F, upper: F) -> Result<Self> {
        if !(lower < upper) {
            return Err(GpError::Configuration(format!(
                "scale bounds should satisfy lower < upper, got [{lower}, {upper}]"
            )));
        }
        Ok(ScaleToBounds {
            lower,
            upper,
            range: None,
        })
    }

    /// Freezes the minimum and maximum of `x`
    pub fn fitted(mut self, x: &ArrayView2<F>) -> Result<Self> {
        self.range = Some(Self::min_max(x)?);
        Ok(self)
    }

    /// Frozen (min, max) if fitted
    pub fn range(&self) -> Option<(F, F)> {
        self.range
    }

    fn min_max(x: &ArrayView2<F>) -> Result<(F, F)> {
        if x.is_empty() {
            return Err(GpError::Configuration(
                "cannot scale an empty set of features".to_string(),
            ));
        }
        let (lo, hi) = x.fold((F::infinity(), F::neg_infinity()), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
        Ok((lo, hi))
    }
}

impl<F: Float> FeatureExtractor<F> for ScaleToBounds<F> {
    fn transform(&self, x: &ArrayView2<F>) -> Result<Array2<F>> {
        let (lo, hi) = match self.range {
            Some(r) => r,
            None => Self::min_max(x)?,
        };
        let shrink = F::cast(SCALE_TO_BOUNDS_SHRINK);
        let width = (hi - lo).max(F::epsilon());
        let span = self.upper - self.lower;
        Ok(x.mapv(|v| shrink * ((v - lo) / width * span + self.lower)))
    }

    fn output_dim(&self, input_dim: usize) -> usize {
        input_dim
    }
}

/// Extractors applied one after the other
#[derive(Clone, Debug, Default)]
pub struct Sequential<F: Float> {
    stages: Vec<Arc<dyn FeatureExtractor<F>>>,
}

impl<F: Float> Sequential<F> {
    /// Empty pipeline (identity)
    pub fn new() -> Self {
        Sequential { stages: Vec::new() }
    }

    /// Appends a stage
    pub fn then(mut self, stage: impl FeatureExtractor<F> + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }
}

impl<F: Float> FeatureExtractor<F> for Sequential<F> {
    fn transform(&self, x: &ArrayView2<F>) -> Result<Array2<F>> {
        let mut out = x.to_owned();
        for stage in &self.stages {
            out = stage.transform(&out.view())?;
        }
        Ok(out)
    }

    fn output_dim(&self, input_dim: usize) -> usize {
        self.stages
            .iter()
            .fold(input_dim, |d, stage| stage.output_dim(d))
    }
}

/// Applies an optional extractor
pub(crate) fn extract<F: Float>(
    features: Option<&Arc<dyn FeatureExtractor<F>>>,
    x: &ArrayView2<F>,
) -> Result<Array2<F>> {
    match features {
        Some(f) => f.transform(x),
        None => Ok(x.to_owned()),
    }
}

/// Minimum and maximum of each column
pub fn column_bounds<F: Float>(x: &ArrayView2<F>) -> Vec<(F, F)> {
    x.axis_iter(Axis(1))
        .map(|c| {
            c.fold((F::infinity(), F::neg_infinity()), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use ndarray_rand::rand::SeedableRng;
    use rand_xoshiro::Xoshiro256Plus;

    #[test]
    fn test_scale_to_bounds() {
        let x = array![[0., 10.], [5., 2.5]];
        let s = ScaleToBounds::new(-1., 1.).unwrap();
        let z = s.transform(&x.view()).unwrap();
        assert_abs_diff_eq!(z, array![[-0.95, 0.95], [0., -0.475]], epsilon = 1e-12);
        let frozen = s.fitted(&x.view()).unwrap();
        let z = frozen.transform(&array![[20.]].view()).unwrap();
        assert_abs_diff_eq!(z[[0, 0]], 2.85, epsilon = 1e-12);
        assert!(ScaleToBounds::new(1., 1.).is_err());
    }

    #[test]
    fn test_linear_features() {
        let f = LinearFeatures::new(array![[1., 0.], [0., 2.], [1., 1.]], array![0.5, -1.])
            .unwrap()
            .with_activation(Activation::Relu);
        let z = f.transform(&array![[1., 1., 1.]].view()).unwrap();
        assert_abs_diff_eq!(z, array![[2.5, 2.]]);
        assert_eq!(FeatureExtractor::<f64>::output_dim(&f, 3), 2);
        assert!(matches!(
            f.transform(&array![[1., 1.]].view()),
            Err(GpError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_sequential_output_in_bounds() {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let net = Sequential::new()
            .then(
                LinearFeatures::random(4, 2, &mut rng)
                    .unwrap()
                    .with_activation(Activation::Tanh),
            )
            .then(ScaleToBounds::new(-1., 1.).unwrap());
        assert_eq!(net.output_dim(4), 2);
        let x = Array2::from_shape_fn((20, 4), |(i, j)| (i * 4 + j) as f64 / 10.);
        let z = net.transform(&x.view()).unwrap();
        assert_eq!(z.dim(), (20, 2));
        assert!(z.iter().all(|v| v.abs() <= 0.95 + 1e-12));
        let bounds = column_bounds(&z.view());
        assert_eq!(bounds.len(), 2);
    }
}
