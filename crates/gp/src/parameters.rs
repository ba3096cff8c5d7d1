use crate::errors::{GpError, Result};
use crate::features::FeatureExtractor;
use crate::iterative::IterativeSettings;
use crate::kernels::Kernel;
use crate::mean_models::MeanFunction;
use crate::utils::DEFAULT_JITTER;
use crate::variational_distributions::VariationalKind;
use linfa::{Float, ParamGuard};
use ndarray::Array2;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default number of training epochs
pub const DEFAULT_N_EPOCHS: usize = 50;
/// Default Adam learning rate
pub const DEFAULT_LEARNING_RATE: f64 = 0.1;
/// Default initial noise variance
pub const DEFAULT_NOISE_INIT: f64 = 0.1;

/// Inducing points specification
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum Inducings<F: Float> {
    /// `usize` points are selected randomly in the training dataset (after feature extraction)
    Randomized(usize),
    /// Points are given as a (npoints, nx) matrix in feature space
    Located(Array2<F>),
}

impl<F: Float> Default for Inducings<F> {
    fn default() -> Inducings<F> {
        Self::Randomized(10)
    }
}

/// Variational strategy specification
#[derive(Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum StrategyKind<F: Float> {
    /// Standard inducing point conditioning
    #[default]
    Standard,
    /// Covariance inducing points plus a mean-only inducing set with point estimates
    OrthogonallyDecoupled(Inducings<F>),
}

/// Optimization settings shared by both model kinds
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct TrainingSettings<F: Float> {
    /// Number of passes over the training data
    pub n_epochs: usize,
    /// Default Adam learning rate
    pub learning_rate: F,
    /// Initial noise variance
    pub noise_init: F,
    /// Diagonal jitter added before factorizations
    pub jitter: F,
}

impl<F: Float> Default for TrainingSettings<F> {
    fn default() -> Self {
        TrainingSettings {
            n_epochs: DEFAULT_N_EPOCHS,
            learning_rate: F::cast(DEFAULT_LEARNING_RATE),
            noise_init: F::cast(DEFAULT_NOISE_INIT),
            jitter: F::cast(DEFAULT_JITTER),
        }
    }
}

impl<F: Float> TrainingSettings<F> {
    fn check(&self) -> Result<()> {
        if !(self.learning_rate > F::zero()) {
            return Err(GpError::Configuration(format!(
                "learning rate should be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.noise_init > F::zero()) {
            return Err(GpError::Configuration(format!(
                "initial noise should be positive, got {}",
                self.noise_init
            )));
        }
        if !(self.jitter >= F::zero()) {
            return Err(GpError::Configuration(format!(
                "jitter should be non negative, got {}",
                self.jitter
            )));
        }
        Ok(())
    }
}

/// A set of validated exact GP parameters.
#[derive(Clone, Debug)]
pub struct ExactGpValidParams<F: Float, M: MeanFunction<F>, K: Kernel<F>> {
    pub(crate) mean: M,
    pub(crate) kernel: K,
    pub(crate) features: Option<Arc<dyn FeatureExtractor<F>>>,
    pub(crate) training: TrainingSettings<F>,
    pub(crate) iterative: IterativeSettings<F>,
}

impl<F: Float, M: MeanFunction<F>, K: Kernel<F>> ExactGpValidParams<F, M, K> {
    /// Get mean function
    pub fn mean(&self) -> &M {
        &self.mean
    }

    /// Get kernel
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Get feature extractor
    pub fn features(&self) -> Option<&Arc<dyn FeatureExtractor<F>>> {
        self.features.as_ref()
    }

    /// Get optimization settings
    pub fn training(&self) -> &TrainingSettings<F> {
        &self.training
    }

    /// Get settings of the iterative path of grid interpolated kernels
    pub fn iterative(&self) -> &IterativeSettings<F> {
        &self.iterative
    }
}

#[derive(Clone, Debug)]
/// The set of hyperparameters that can be specified for fitting an
/// [ExactGp](crate::ExactGp) by maximizing the exact marginal log likelihood.
pub struct ExactGpParams<F: Float, M: MeanFunction<F>, K: Kernel<F>>(
    ExactGpValidParams<F, M, K>,
);

impl<F: Float, M: MeanFunction<F>, K: Kernel<F>> ExactGpParams<F, M, K> {
    /// A constructor for exact GP parameters given mean and kernel
    pub fn new(mean: M, kernel: K) -> ExactGpParams<F, M, K> {
        Self(ExactGpValidParams {
            mean,
            kernel,
            features: None,
            training: TrainingSettings::default(),
            iterative: IterativeSettings::default(),
        })
    }

    /// Set the feature extractor applied to inputs
    pub fn features(mut self, features: Arc<dyn FeatureExtractor<F>>) -> Self {
        self.0.features = Some(features);
        self
    }

    /// Set the iterative solver settings used by grid interpolated kernels on large
    /// training sets
    pub fn iterative(mut self, settings: IterativeSettings<F>) -> Self {
        self.0.iterative = settings;
        self
    }

    /// Set the number of epochs (full batch steps)
    pub fn n_epochs(mut self, n_epochs: usize) -> Self {
        self.0.training.n_epochs = n_epochs;
        self
    }

    /// Set the learning rate
    pub fn learning_rate(mut self, learning_rate: F) -> Self {
        self.0.training.learning_rate = learning_rate;
        self
    }

    /// Set the initial noise variance
    pub fn noise_init(mut self, noise: F) -> Self {
        self.0.training.noise_init = noise;
        self
    }

    /// Set the jitter
    pub fn jitter(mut self, jitter: F) -> Self {
        self.0.training.jitter = jitter;
        self
    }
}

impl<F: Float, M: MeanFunction<F>, K: Kernel<F>> ParamGuard for ExactGpParams<F, M, K> {
    type Checked = ExactGpValidParams<F, M, K>;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        self.0.training.check()?;
        self.0.iterative.check()?;
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}

/// A set of validated stochastic variational GP parameters.
#[derive(Clone, Debug)]
pub struct SvgpValidParams<F: Float, M: MeanFunction<F>, K: Kernel<F>> {
    pub(crate) mean: M,
    pub(crate) kernel: K,
    pub(crate) features: Option<Arc<dyn FeatureExtractor<F>>>,
    pub(crate) training: TrainingSettings<F>,
    pub(crate) inducings: Inducings<F>,
    pub(crate) variational: VariationalKind,
    pub(crate) strategy: StrategyKind<F>,
    pub(crate) whiten: bool,
    pub(crate) learn_inducing_locations: bool,
    pub(crate) batch_size: Option<usize>,
    pub(crate) variational_learning_rate: Option<F>,
    pub(crate) beta: F,
    pub(crate) seed: Option<u64>,
}

impl<F: Float, M: MeanFunction<F>, K: Kernel<F>> SvgpValidParams<F, M, K> {
    /// Get mean function
    pub fn mean(&self) -> &M {
        &self.mean
    }

    /// Get kernel
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Get feature extractor
    pub fn features(&self) -> Option<&Arc<dyn FeatureExtractor<F>>> {
        self.features.as_ref()
    }

    /// Get optimization settings
    pub fn training(&self) -> &TrainingSettings<F> {
        &self.training
    }

    /// Get inducing points
    pub fn inducings(&self) -> &Inducings<F> {
        &self.inducings
    }

    /// Get the variational distribution kind
    pub fn variational(&self) -> VariationalKind {
        self.variational
    }

    /// Get the strategy kind
    pub fn strategy(&self) -> &StrategyKind<F> {
        &self.strategy
    }

    /// Whether q(u) is whitened
    pub fn whiten(&self) -> bool {
        self.whiten
    }

    /// Whether inducing locations are trained
    pub fn learn_inducing_locations(&self) -> bool {
        self.learn_inducing_locations
    }

    /// Get the minibatch size (`None` means full batch)
    pub fn batch_size(&self) -> Option<usize> {
        self.batch_size
    }

    /// Get the learning rate of the variational parameters
    pub fn variational_learning_rate(&self) -> Option<F> {
        self.variational_learning_rate
    }

    /// Get the KL weight
    pub fn beta(&self) -> F {
        self.beta
    }

    /// Get seed
    pub fn seed(&self) -> Option<&u64> {
        self.seed.as_ref()
    }
}

#[derive(Clone, Debug)]
/// The set of hyperparameters that can be specified for fitting an
/// [ApproximateGp](crate::ApproximateGp) by maximizing the variational ELBO.
pub struct SvgpParams<F: Float, M: MeanFunction<F>, K: Kernel<F>>(SvgpValidParams<F, M, K>);

impl<F: Float, M: MeanFunction<F>, K: Kernel<F>> SvgpParams<F, M, K> {
    /// A constructor for SVGP parameters given mean, kernel and inducing points
    pub fn new(mean: M, kernel: K, inducings: Inducings<F>) -> SvgpParams<F, M, K> {
        Self(SvgpValidParams {
            mean,
            kernel,
            features: None,
            training: TrainingSettings::default(),
            inducings,
            variational: VariationalKind::default(),
            strategy: StrategyKind::default(),
            whiten: true,
            learn_inducing_locations: false,
            batch_size: None,
            variational_learning_rate: None,
            beta: F::one(),
            seed: None,
        })
    }

    /// Set the feature extractor applied to inputs
    pub fn features(mut self, features: Arc<dyn FeatureExtractor<F>>) -> Self {
        self.0.features = Some(features);
        self
    }

    /// Specify nz inducing points as (nz, feature_dim) matrix.
    pub fn inducings(mut self, z: Array2<F>) -> Self {
        self.0.inducings = Inducings::Located(z);
        self
    }

    /// Specify nz number of inducing points which will be picked randomly in the training dataset.
    pub fn n_inducings(mut self, nz: usize) -> Self {
        self.0.inducings = Inducings::Randomized(nz);
        self
    }

    /// Set the variational distribution kind
    pub fn variational(mut self, kind: VariationalKind) -> Self {
        self.0.variational = kind;
        self
    }

    /// Set the variational strategy
    pub fn strategy(mut self, strategy: StrategyKind<F>) -> Self {
        self.0.strategy = strategy;
        self
    }

    /// Whiten q(u) against the prior Cholesky factor
    pub fn whiten(mut self, whiten: bool) -> Self {
        self.0.whiten = whiten;
        self
    }

    /// Train inducing locations (off by default, see [crate::ApproximateGp::learn_inducing_locations])
    pub fn learn_inducing_locations(mut self, learn: bool) -> Self {
        self.0.learn_inducing_locations = learn;
        self
    }

    /// Set the minibatch size
    pub fn batch_size(mut self, batch_size: Option<usize>) -> Self {
        self.0.batch_size = batch_size;
        self
    }

    /// Set the number of epochs
    pub fn n_epochs(mut self, n_epochs: usize) -> Self {
        self.0.training.n_epochs = n_epochs;
        self
    }

    /// Set the default learning rate
    pub fn learning_rate(mut self, learning_rate: F) -> Self {
        self.0.training.learning_rate = learning_rate;
        self
    }

    /// Set a specific learning rate for the variational parameters
    pub fn variational_learning_rate(mut self, learning_rate: Option<F>) -> Self {
        self.0.variational_learning_rate = learning_rate;
        self
    }

    /// Set the initial noise variance
    pub fn noise_init(mut self, noise: F) -> Self {
        self.0.training.noise_init = noise;
        self
    }

    /// Set the jitter
    pub fn jitter(mut self, jitter: F) -> Self {
        self.0.training.jitter = jitter;
        self
    }

    /// Set the KL weight
    pub fn beta(mut self, beta: F) -> Self {
        self.0.beta = beta;
        self
    }

    /// Set the random generator seed (inducing point selection and minibatches)
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.0.seed = seed;
        self
    }
}

fn check_inducings<F: Float>(inducings: &Inducings<F>, what: &str) -> Result<()> {
    match inducings {
        Inducings::Randomized(0) => Err(GpError::Configuration(format!(
            "at least one {what} inducing point is required"
        ))),
        Inducings::Located(z) if z.nrows() == 0 => Err(GpError::Configuration(format!(
            "at least one {what} inducing point is required"
        ))),
        _ => Ok(()),
    }
}

impl<F: Float, M: MeanFunction<F>, K: Kernel<F>> ParamGuard for SvgpParams<F, M, K> {
    type Checked = SvgpValidParams<F, M, K>;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        self.0.training.check()?;
        check_inducings(&self.0.inducings, "covariance")?;
        if let StrategyKind::OrthogonallyDecoupled(mean_inducings) = &self.0.strategy {
            check_inducings(mean_inducings, "mean")?;
        }
        if self.0.batch_size == Some(0) {
            return Err(GpError::Configuration(
                "batch size should be positive".to_string(),
            ));
        }
        if let Some(lr) = self.0.variational_learning_rate {
            if !(lr > F::zero()) {
                return Err(GpError::Configuration(format!(
                    "variational learning rate should be positive, got {lr}"
                )));
            }
        }
        if !(self.0.beta >= F::zero()) {
            return Err(GpError::Configuration(format!(
                "KL weight should be non negative, got {}",
                self.0.beta
            )));
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}
