//! GP model containers.
//!
//! Both models expose a single `forward(x, mode)` operation. The [Mode] is an explicit
//! token: [Mode::Training] returns the distribution used by the training objective
//! (the prior for [ExactGp], q(f) for [ApproximateGp]) while [Mode::Evaluation] returns
//! the posterior predictive distribution of the latent function. Adding the observation
//! noise is left to [GaussianLikelihood::marginal].
//!
//! Every parameter mutation goes through [Trainable::set_parameters] which bumps the
//! model [Generation] so that cached factorizations are never reused across updates.

use crate::cache::{FactorCache, Generation};
use crate::distributions::{Covariance, MultivariateNormal};
use crate::errors::{GpError, Result};
use crate::features::{extract, FeatureExtractor};
use crate::iterative::{IterativeFactor, IterativeSettings, ShiftedOperator};
use crate::kernels::Kernel;
use crate::likelihood::GaussianLikelihood;
use crate::mean_models::MeanFunction;
use crate::utils::{
    cholesky_logdet, cholesky_solve_vec, jittered_cholesky, solve_lower, DEFAULT_JITTER,
};
use crate::variational_strategies::{PredictOptions, Strategy, VariationalStrategy};

use linfa::prelude::{Float, PredictInplace};
use linfa_linalg::eigh::*;
use log::debug;
use ndarray::{Array1, Array2, ArrayBase, ArrayView2, Axis, Data, Ix1, Ix2};
use rayon::prelude::*;
use std::fmt;
use std::sync::Arc;

/// Parameter group of the mean function
pub const MEAN_GROUP: &str = "mean";
/// Parameter group of the kernel (raw hyperparameters)
pub const COVAR_GROUP: &str = "covar";
/// Parameter group of the likelihood (raw noise)
pub const LIKELIHOOD_GROUP: &str = "likelihood";
/// Parameter group of the variational distribution(s)
pub const VARIATIONAL_GROUP: &str = "variational";
/// Parameter group of the inducing locations
pub const INDUCING_GROUP: &str = "inducing_points";

/// Named groups of raw parameter values
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Parameters<F: Float> {
    names: Vec<String>,
    values: Vec<Array1<F>>,
}

impl<F: Float> Parameters<F> {
    /// Empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a group, replacing an existing one with the same name
    pub fn register(&mut self, name: &str, values: Array1<F>) {
        match self.get_mut(name) {
            Some(v) => *v = values,
            None => {
                self.names.push(name.to_string());
                self.values.push(values);
            }
        }
    }

    /// Group values by name
    pub fn get(&self, name: &str) -> Option<&Array1<F>> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.values[i])
    }

    /// Mutable group values by name
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Array1<F>> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &mut self.values[i])
    }

    /// Number of groups
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether there is no group
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Total number of values
    pub fn num_values(&self) -> usize {
        self.values.iter().map(|v| v.len()).sum()
    }

    /// Iterates over (name, values)
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Array1<F>)> {
        self.names
            .iter()
            .zip(self.values.iter())
            .map(|(n, v)| (n.as_str(), v))
    }

    /// Same groups filled with zeros
    pub fn zeros_like(&self) -> Self {
        Parameters {
            names: self.names.clone(),
            values: self.values.iter().map(|v| Array1::zeros(v.len())).collect(),
        }
    }
}

/// A trait for models trained by gradient descent on raw parameters
pub trait Trainable<F: Float> {
    /// Current raw parameters by group
    fn parameters(&self) -> Parameters<F>;

    /// Sets the given groups (others are left unchanged) and bumps the generation
    fn set_parameters(&mut self, params: &Parameters<F>) -> Result<()>;

    /// Current parameter generation
    fn generation(&self) -> Generation;
}

/// Settings of the posterior predictive computation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PredictiveSettings {
    /// Reuse factors cached at the current generation (predictive mean cache and
    /// variance root) instead of solving against the training covariance per query
    pub fast_pred_var: bool,
    /// Optional rank truncation of the cached variance root of grid interpolated kernels
    pub max_root_rank: Option<usize>,
}

impl PredictiveSettings {
    /// Fast predictive variances
    pub fn fast() -> Self {
        PredictiveSettings {
            fast_pred_var: true,
            max_root_rank: None,
        }
    }
}

/// Model mode passed to every forward evaluation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Distribution consumed by the training objective
    Training,
    /// Posterior predictive distribution
    Evaluation(PredictiveSettings),
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Evaluation(PredictiveSettings::default())
    }
}

fn check_input_dim<F: Float, M: MeanFunction<F>, K: Kernel<F>>(
    mean: &M,
    kernel: &K,
    features: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<()> {
    kernel.check_input(features)?;
    if let Some(d) = mean.input_dim() {
        if d != features.ncols() {
            return Err(GpError::dimension_mismatch(
                "mean function input",
                d,
                features.ncols(),
            ));
        }
    }
    Ok(())
}

fn symmetrize<F: Float>(m: Array2<F>) -> Array2<F> {
    (&m + &m.t()) * F::cast(0.5)
}

/// How `K + noise I` at the training points is solved
#[derive(Debug)]
pub(crate) enum TrainingSolver<F: Float> {
    /// Lower Cholesky factor of `K + (noise + jitter) I`
    Cholesky(Array2<F>),
    /// Conjugate gradients on the grid interpolated operator, never densified
    Iterative(IterativeFactor<F>),
}

/// Factors of `K + noise I` at the training points
#[derive(Debug)]
pub(crate) struct PosteriorFactor<F: Float> {
    pub(crate) solver: TrainingSolver<F>,
    /// `(K + noise I)^-1 (y - mu)`
    pub(crate) alpha: Array1<F>,
}

impl<F: Float> PosteriorFactor<F> {
    /// `log det (K + noise I)`, estimated on the iterative path
    pub(crate) fn logdet(&self) -> F {
        match &self.solver {
            TrainingSolver::Cholesky(chol) => cholesky_logdet(chol),
            TrainingSolver::Iterative(factor) => factor.logdet,
        }
    }
}

/// Precomputed predictive variance roots
#[derive(Debug)]
enum VarianceRoot<F: Float> {
    /// `L^-1` for dense kernels: `var = k(x, x) - |L^-1 k(X, x)|^2`
    Dense(Array2<F>),
    /// For grid interpolated kernels: `mean(x) = mu(x) + W_x mean_cache` and
    /// `var = diag(W_x K_grid W_x^T) - |W_x root|^2` with `root = K_grid W^T L^-T`
    Interpolated {
        mean_cache: Array1<F>,
        root: Array2<F>,
    },
}

#[derive(Debug)]
struct FastPrediction<F: Float> {
    rank: Option<usize>,
    root: VarianceRoot<F>,
}

/// Best rank `k` root `R_k` with `R_k R_k^T ~ R R^T`
fn truncate_root<F: Float>(root: Array2<F>, rank: usize) -> Result<Array2<F>> {
    let (g, n) = root.dim();
    if rank >= g.min(n) {
        return Ok(root);
    }
    let top = |eigvals: &Array1<F>| {
        let mut order: Vec<usize> = (0..eigvals.len()).collect();
        order.sort_by(|&a, &b| {
            eigvals[b]
                .partial_cmp(&eigvals[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        order.truncate(rank);
        order
    };
    if g <= n {
        let (vals, vecs) = symmetrize(root.dot(&root.t())).eigh_into()?;
        let idx = top(&vals);
        let scales = vals.select(Axis(0), &idx).mapv(|v| v.max(F::zero()).sqrt());
        Ok(vecs.select(Axis(1), &idx) * &scales)
    } else {
        let (vals, vecs) = symmetrize(root.t().dot(&root)).eigh_into()?;
        let idx = top(&vals);
        Ok(root.dot(&vecs.select(Axis(1), &idx)))
    }
}

/// Exact GP regression model `y = f(g(x)) + e` with `f ~ GP(mu, k)`, an optional fixed
/// feature extractor `g` and Gaussian noise `e`
pub struct ExactGp<F: Float, M: MeanFunction<F>, K: Kernel<F>> {
    train_inputs: Array2<F>,
    train_features: Array2<F>,
    train_targets: Array1<F>,
    mean: M,
    kernel: K,
    likelihood: GaussianLikelihood<F>,
    features: Option<Arc<dyn FeatureExtractor<F>>>,
    jitter: F,
    iterative: IterativeSettings<F>,
    generation: Generation,
    posterior_cache: FactorCache<PosteriorFactor<F>>,
    fast_cache: FactorCache<FastPrediction<F>>,
}

impl<F: Float, M: MeanFunction<F>, K: Kernel<F>> Clone for ExactGp<F, M, K> {
    fn clone(&self) -> Self {
        ExactGp {
            train_inputs: self.train_inputs.to_owned(),
            train_features: self.train_features.to_owned(),
            train_targets: self.train_targets.to_owned(),
            mean: self.mean.clone(),
            kernel: self.kernel.clone(),
            likelihood: self.likelihood.clone(),
            features: self.features.clone(),
            jitter: self.jitter,
            iterative: self.iterative.clone(),
            generation: self.generation,
            posterior_cache: self.posterior_cache.clone(),
            fast_cache: self.fast_cache.clone(),
        }
    }
}

impl<F: Float, M: MeanFunction<F>, K: Kernel<F>> fmt::Debug for ExactGp<F, M, K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ExactGp")
            .field("n_train", &self.train_targets.len())
            .field("mean", &self.mean)
            .field("kernel", &self.kernel)
            .field("likelihood", &self.likelihood)
            .field("features", &self.features)
            .field("generation", &self.generation)
            .finish()
    }
}

impl<F: Float, M: MeanFunction<F>, K: Kernel<F>> fmt::Display for ExactGp<F, M, K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ExactGp(mean={}, covar={:?}, noise={})",
            self.mean,
            self.kernel.hyperparameters(),
            self.likelihood.noise()
        )
    }
}

impl<F: Float, M: MeanFunction<F>, K: Kernel<F>> ExactGp<F, M, K> {
    /// Model conditioned on training inputs `x` (n, d) and targets `y` (n).
    ///
    /// Dimensions of the inputs, the kernel and the mean are checked here.
    pub fn new(
        x: Array2<F>,
        y: Array1<F>,
        mean: M,
        kernel: K,
        likelihood: GaussianLikelihood<F>,
    ) -> Result<Self> {
        if x.nrows() == 0 {
            return Err(GpError::Configuration(
                "at least one training point is required".to_string(),
            ));
        }
        if x.nrows() != y.len() {
            return Err(GpError::dimension_mismatch(
                "training targets",
                x.nrows(),
                y.len(),
            ));
        }
        check_input_dim(&mean, &kernel, &x)?;
        Ok(ExactGp {
            train_features: x.to_owned(),
            train_inputs: x,
            train_targets: y,
            mean,
            kernel,
            likelihood,
            features: None,
            jitter: F::cast(DEFAULT_JITTER),
            iterative: IterativeSettings::default(),
            generation: Generation::default(),
            posterior_cache: FactorCache::new("exact posterior"),
            fast_cache: FactorCache::new("exact fast variance"),
        })
    }

    /// Applies `extractor` to every input before the kernel
    pub fn with_features(mut self, extractor: Arc<dyn FeatureExtractor<F>>) -> Result<Self> {
        let features = extractor.transform(&self.train_inputs.view())?;
        check_input_dim(&self.mean, &self.kernel, &features)?;
        self.train_features = features;
        self.features = Some(extractor);
        self.generation.bump();
        Ok(self)
    }

    /// Diagonal jitter added before factorizing the training covariance
    pub fn with_jitter(mut self, jitter: F) -> Result<Self> {
        if !(jitter >= F::zero()) {
            return Err(GpError::Configuration(format!(
                "jitter should be non negative, got {jitter}"
            )));
        }
        self.jitter = jitter;
        self.generation.bump();
        Ok(self)
    }

    /// Settings of the iterative path taken by grid interpolated kernels when the training
    /// set is larger than `settings.max_cholesky_size`
    pub fn with_iterative_settings(mut self, settings: IterativeSettings<F>) -> Result<Self> {
        settings.check()?;
        self.iterative = settings;
        self.generation.bump();
        Ok(self)
    }

    /// Training inputs
    pub fn train_inputs(&self) -> &Array2<F> {
        &self.train_inputs
    }

    /// Training features (inputs after the feature extractor)
    pub fn train_features(&self) -> &Array2<F> {
        &self.train_features
    }

    /// Training targets
    pub fn train_targets(&self) -> &Array1<F> {
        &self.train_targets
    }

    /// Mean function
    pub fn mean(&self) -> &M {
        &self.mean
    }

    /// Kernel
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Likelihood
    pub fn likelihood(&self) -> &GaussianLikelihood<F> {
        &self.likelihood
    }

    /// Jitter
    pub fn jitter(&self) -> F {
        self.jitter
    }

    /// Iterative solver settings
    pub fn iterative_settings(&self) -> &IterativeSettings<F> {
        &self.iterative
    }

    /// Whether the training covariance is solved by conjugate gradients
    pub fn is_iterative(&self) -> Result<bool> {
        Ok(matches!(
            self.posterior_factor()?.solver,
            TrainingSolver::Iterative(_)
        ))
    }

    fn features_of(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        let z = extract(self.features.as_ref(), &x.view())?;
        check_input_dim(&self.mean, &self.kernel, &z)?;
        Ok(z)
    }

    /// Factors of the training covariance for the current generation
    pub(crate) fn posterior_factor(&self) -> Result<Arc<PosteriorFactor<F>>> {
        self.posterior_cache.get_or_try_insert(self.generation, || {
            let x = &self.train_features;
            let shift = self.likelihood.noise() + self.jitter;
            let residuals = &self.train_targets - &self.mean.value(x);
            if x.nrows() > self.iterative.max_cholesky_size {
                if let Some(operator) = self.kernel.structured(x, x)? {
                    debug!(
                        "{} training points above {}: iterative solves",
                        x.nrows(),
                        self.iterative.max_cholesky_size
                    );
                    let operator = ShiftedOperator::new(operator, shift)?;
                    let (factor, alpha) =
                        IterativeFactor::new(operator, &residuals, &self.iterative)?;
                    return Ok(PosteriorFactor {
                        solver: TrainingSolver::Iterative(factor),
                        alpha,
                    });
                }
            }
            let k = self.kernel.value(x, x)?;
            let chol = jittered_cholesky(&k, shift, "training")?;
            let alpha = cholesky_solve_vec(&chol, &residuals)?;
            Ok(PosteriorFactor {
                solver: TrainingSolver::Cholesky(chol),
                alpha,
            })
        })
    }

    fn fast_prediction(&self, rank: Option<usize>) -> Result<Arc<FastPrediction<F>>> {
        let compute = || {
            let post = self.posterior_factor()?;
            let chol = match &post.solver {
                TrainingSolver::Cholesky(chol) => chol,
                TrainingSolver::Iterative(factor) => {
                    let op = factor.operator.operator();
                    let kw = op.grid_times_right_t()?;
                    let init = factor.samples.column(0).to_owned();
                    let inv_root =
                        factor.inverse_root(&init, rank.unwrap_or(self.iterative.root_rank))?;
                    let root = VarianceRoot::Interpolated {
                        mean_cache: kw.dot(&post.alpha),
                        root: kw.dot(&inv_root),
                    };
                    return Ok(FastPrediction { rank, root });
                }
            };
            let n = chol.nrows();
            let l_inv = solve_lower(chol, &Array2::eye(n))?;
            let root = match self
                .kernel
                .structured(&self.train_features, &self.train_features)?
            {
                Some(op) => {
                    let kw = op.grid_times_right_t()?;
                    let mut root = kw.dot(&l_inv.t());
                    if let Some(rank) = rank {
                        root = truncate_root(root, rank)?;
                    }
                    VarianceRoot::Interpolated {
                        mean_cache: kw.dot(&post.alpha),
                        root,
                    }
                }
                None => VarianceRoot::Dense(l_inv),
            };
            Ok(FastPrediction { rank, root })
        };
        let cached = self.fast_cache.get_or_try_insert(self.generation, compute)?;
        if cached.rank == rank {
            return Ok(cached);
        }
        debug!("fast variance root rebuilt for rank {rank:?}");
        self.fast_cache.invalidate();
        self.fast_cache.get_or_try_insert(self.generation, compute)
    }

    /// Prior N(mu(x), K(x, x)), structured when the kernel interpolates from a grid
    pub fn prior(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<MultivariateNormal<F>> {
        let z = self.features_of(x)?;
        let cov = match self.kernel.structured(&z, &z)? {
            Some(operator) => Covariance::Interpolated {
                operator,
                noise: Array1::zeros(z.nrows()),
            },
            None => Covariance::Dense(symmetrize(self.kernel.value(&z, &z)?)),
        };
        MultivariateNormal::new(self.mean.value(&z), cov)
    }

    /// Distribution of the latent function at the rows of `x` in the given mode
    pub fn forward(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        mode: Mode,
    ) -> Result<MultivariateNormal<F>> {
        match mode {
            Mode::Training => self.prior(x),
            Mode::Evaluation(settings) => self.posterior(x, settings, true),
        }
    }

    /// Posterior predictive of the latent function with marginal variances
    pub fn predict(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        settings: PredictiveSettings,
    ) -> Result<MultivariateNormal<F>> {
        self.posterior(x, settings, false)
    }

    /// Posterior predictive mean
    pub fn predict_mean(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array1<F>> {
        Ok(self
            .predict(x, PredictiveSettings::default())?
            .mean()
            .to_owned())
    }

    /// Posterior predictive variance of the latent function
    pub fn predict_var(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array1<F>> {
        Ok(self.predict(x, PredictiveSettings::default())?.variance())
    }

    fn posterior(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        settings: PredictiveSettings,
        full_covariance: bool,
    ) -> Result<MultivariateNormal<F>> {
        let z = self.features_of(x)?;
        let post = self.posterior_factor()?;
        let prior_mean = self.mean.value(&z);
        if settings.fast_pred_var {
            let fast = self.fast_prediction(settings.max_root_rank)?;
            if let VarianceRoot::Interpolated { mean_cache, root } = &fast.root {
                let self_cov = self.kernel.structured(&z, &z)?.ok_or_else(|| {
                    GpError::Configuration("kernel lost its grid structure".to_string())
                })?;
                let w = self_cov.left();
                let f_mean = prior_mean + w.matvec(mean_cache);
                let wr = w.dot_dense(root)?;
                let cov = if full_covariance {
                    Covariance::Dense(symmetrize(self_cov.to_dense()? - wr.dot(&wr.t())))
                } else {
                    let var = self_cov.diag() - wr.mapv(|v| v * v).sum_axis(Axis(1));
                    Covariance::Diagonal(var.mapv(|v| v.max(F::zero())))
                };
                return MultivariateNormal::new(f_mean, cov);
            }
        }
        let chol = match &post.solver {
            TrainingSolver::Cholesky(chol) => chol,
            TrainingSolver::Iterative(factor) => {
                return self.iterative_posterior(
                    &z,
                    prior_mean,
                    &post.alpha,
                    factor,
                    full_covariance,
                );
            }
        };
        let kxt = self.kernel.value(&z, &self.train_features)?;
        let f_mean = prior_mean + kxt.dot(&post.alpha);
        let v = if settings.fast_pred_var {
            match &self.fast_prediction(settings.max_root_rank)?.root {
                VarianceRoot::Dense(l_inv) => l_inv.dot(&kxt.t()),
                VarianceRoot::Interpolated { .. } => solve_lower(chol, &kxt.t())?,
            }
        } else {
            solve_lower(chol, &kxt.t().to_owned())?
        };
        let cov = if full_covariance {
            Covariance::Dense(symmetrize(self.kernel.value(&z, &z)? - v.t().dot(&v)))
        } else {
            let var = self.kernel.diag(&z)? - v.mapv(|e| e * e).sum_axis(Axis(0));
            Covariance::Diagonal(var.mapv(|e| e.max(F::zero())))
        };
        MultivariateNormal::new(f_mean, cov)
    }

    /// Posterior through products with the interpolated operators only: one conjugate
    /// gradient solve per query point for the covariance
    fn iterative_posterior(
        &self,
        z: &Array2<F>,
        prior_mean: Array1<F>,
        alpha: &Array1<F>,
        factor: &IterativeFactor<F>,
        full_covariance: bool,
    ) -> Result<MultivariateNormal<F>> {
        let lost = || GpError::Configuration("kernel lost its grid structure".to_string());
        let train = &self.train_features;
        let cross = self.kernel.structured(z, train)?.ok_or_else(lost)?;
        let cross_t = self.kernel.structured(train, z)?.ok_or_else(lost)?;
        let f_mean = prior_mean + cross.matvec(alpha)?;

        let m = z.nrows();
        let columns = (0..m)
            .into_par_iter()
            .map(|j| {
                let mut e = Array1::zeros(m);
                e[j] = F::one();
                let k = cross_t.matvec(&e)?;
                let s = factor.solve(&k)?;
                Ok((k, s))
            })
            .collect::<Result<Vec<_>>>()?;
        let n = train.nrows();
        let mut k_xz = Array2::zeros((n, m));
        let mut s_xz = Array2::zeros((n, m));
        for (j, (k, s)) in columns.iter().enumerate() {
            k_xz.column_mut(j).assign(k);
            s_xz.column_mut(j).assign(s);
        }
        let cov = if full_covariance {
            let k_zz = self.kernel.structured(z, z)?.ok_or_else(lost)?.to_dense()?;
            Covariance::Dense(symmetrize(k_zz - k_xz.t().dot(&s_xz)))
        } else {
            let reduction = (&k_xz * &s_xz).sum_axis(Axis(0));
            let var = self.kernel.diag(z)? - reduction;
            Covariance::Diagonal(var.mapv(|e| e.max(F::zero())))
        };
        MultivariateNormal::new(f_mean, cov)
    }

    /// Posterior predictive of the observations (latent plus noise)
    pub fn predict_observed(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        settings: PredictiveSettings,
    ) -> Result<MultivariateNormal<F>> {
        self.likelihood.marginal(&self.predict(x, settings)?)
    }
}

impl<F: Float, M: MeanFunction<F>, K: Kernel<F>> Trainable<F> for ExactGp<F, M, K> {
    fn parameters(&self) -> Parameters<F> {
        let mut params = Parameters::new();
        params.register(MEAN_GROUP, self.mean.hyperparameters());
        params.register(COVAR_GROUP, self.kernel.hyperparameters());
        params.register(
            LIKELIHOOD_GROUP,
            Array1::from_elem(1, self.likelihood.raw_noise()),
        );
        params
    }

    /// All groups are applied or none: on error the model is left untouched
    fn set_parameters(&mut self, params: &Parameters<F>) -> Result<()> {
        let mut mean = self.mean.clone();
        let mut kernel = self.kernel.clone();
        let mut likelihood = self.likelihood.clone();
        for (name, values) in params.iter() {
            match name {
                MEAN_GROUP => mean.set_hyperparameters(values)?,
                COVAR_GROUP => kernel.set_hyperparameters(values)?,
                LIKELIHOOD_GROUP => set_raw_noise(&mut likelihood, values)?,
                other => {
                    return Err(GpError::Configuration(format!(
                        "unknown parameter group {other} for an exact model"
                    )))
                }
            }
        }
        self.mean = mean;
        self.kernel = kernel;
        self.likelihood = likelihood;
        self.generation.bump();
        Ok(())
    }

    fn generation(&self) -> Generation {
        self.generation
    }
}

fn set_raw_noise<F: Float>(likelihood: &mut GaussianLikelihood<F>, values: &Array1<F>) -> Result<()> {
    if values.len() != 1 {
        return Err(GpError::dimension_mismatch(
            "likelihood parameters",
            1,
            values.len(),
        ));
    }
    likelihood.set_raw_noise(values[0]);
    Ok(())
}

/// Approximate (variational) GP model: q(f(x)) is obtained by a variational strategy
/// from a distribution over inducing values
pub struct ApproximateGp<F: Float, M: MeanFunction<F>, K: Kernel<F>> {
    mean: M,
    kernel: K,
    strategy: Strategy<F>,
    likelihood: GaussianLikelihood<F>,
    features: Option<Arc<dyn FeatureExtractor<F>>>,
    learn_inducing_locations: bool,
    generation: Generation,
}

impl<F: Float, M: MeanFunction<F>, K: Kernel<F>> Clone for ApproximateGp<F, M, K> {
    fn clone(&self) -> Self {
        ApproximateGp {
            mean: self.mean.clone(),
            kernel: self.kernel.clone(),
            strategy: self.strategy.clone(),
            likelihood: self.likelihood.clone(),
            features: self.features.clone(),
            learn_inducing_locations: self.learn_inducing_locations,
            generation: self.generation,
        }
    }
}

impl<F: Float, M: MeanFunction<F>, K: Kernel<F>> fmt::Debug for ApproximateGp<F, M, K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ApproximateGp")
            .field("mean", &self.mean)
            .field("kernel", &self.kernel)
            .field("strategy", &self.strategy)
            .field("likelihood", &self.likelihood)
            .field("features", &self.features)
            .field("learn_inducing_locations", &self.learn_inducing_locations)
            .field("generation", &self.generation)
            .finish()
    }
}

impl<F: Float, M: MeanFunction<F>, K: Kernel<F>> fmt::Display for ApproximateGp<F, M, K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ApproximateGp(mean={}, covar={:?}, noise={}, inducing={})",
            self.mean,
            self.kernel.hyperparameters(),
            self.likelihood.noise(),
            self.strategy.num_inducing()
        )
    }
}

impl<F: Float, M: MeanFunction<F>, K: Kernel<F>> ApproximateGp<F, M, K> {
    /// Model with the given strategy.
    ///
    /// Inducing point, kernel and mean dimensions are checked here and q(u) is set to
    /// its prior when the strategy is not whitened.
    pub fn new(
        mean: M,
        kernel: K,
        strategy: impl Into<Strategy<F>>,
        likelihood: GaussianLikelihood<F>,
    ) -> Result<Self> {
        let mut strategy = strategy.into();
        let sample = Array2::zeros((1, strategy.input_dim()));
        check_input_dim(&mean, &kernel, &sample)?;
        strategy.initialize(&mean, &kernel)?;
        Ok(ApproximateGp {
            mean,
            kernel,
            strategy,
            likelihood,
            features: None,
            learn_inducing_locations: false,
            generation: Generation::default(),
        })
    }

    /// Applies `extractor` to every input; `input_dim` is the raw input dimension
    pub fn with_features(
        mut self,
        extractor: Arc<dyn FeatureExtractor<F>>,
        input_dim: usize,
    ) -> Result<Self> {
        let out = extractor.output_dim(input_dim);
        if out != self.strategy.input_dim() {
            return Err(GpError::dimension_mismatch(
                "feature dimension vs inducing points",
                self.strategy.input_dim(),
                out,
            ));
        }
        self.features = Some(extractor);
        self.generation.bump();
        Ok(self)
    }

    /// Whether inducing locations are part of the trainable parameters (off by default).
    ///
    /// Their ELBO gradient is taken by central differences: each evaluation costs about
    /// `2 m d` extra ELBO evaluations for `m` inducing points of dimension `d`.
    pub fn learn_inducing_locations(mut self, learn: bool) -> Self {
        self.learn_inducing_locations = learn;
        self
    }

    /// Mean function
    pub fn mean(&self) -> &M {
        &self.mean
    }

    /// Kernel
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Variational strategy
    pub fn strategy(&self) -> &Strategy<F> {
        &self.strategy
    }

    /// Likelihood
    pub fn likelihood(&self) -> &GaussianLikelihood<F> {
        &self.likelihood
    }

    pub(crate) fn features_of(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        let z = extract(self.features.as_ref(), &x.view())?;
        if z.ncols() != self.strategy.input_dim() {
            return Err(GpError::dimension_mismatch(
                "features vs inducing points",
                self.strategy.input_dim(),
                z.ncols(),
            ));
        }
        Ok(z)
    }

    /// Distribution q(f) at the rows of `x`: marginal variances in training mode,
    /// full covariance in evaluation mode
    pub fn forward(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        mode: Mode,
    ) -> Result<MultivariateNormal<F>> {
        let z = self.features_of(x)?;
        let options = match mode {
            Mode::Training => PredictOptions::default(),
            Mode::Evaluation(settings) => PredictOptions {
                full_covariance: true,
                fast_pred_var: settings.fast_pred_var,
            },
        };
        self.strategy
            .predict(&self.mean, &self.kernel, &z, Some(self.generation), options)
    }

    /// Posterior predictive of the latent function with marginal variances
    pub fn predict(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        settings: PredictiveSettings,
    ) -> Result<MultivariateNormal<F>> {
        let z = self.features_of(x)?;
        let options = PredictOptions {
            full_covariance: false,
            fast_pred_var: settings.fast_pred_var,
        };
        self.strategy
            .predict(&self.mean, &self.kernel, &z, Some(self.generation), options)
    }

    /// Posterior predictive mean
    pub fn predict_mean(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array1<F>> {
        Ok(self
            .predict(x, PredictiveSettings::default())?
            .mean()
            .to_owned())
    }

    /// Posterior predictive variance of the latent function
    pub fn predict_var(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array1<F>> {
        Ok(self.predict(x, PredictiveSettings::default())?.variance())
    }

    /// Posterior predictive of the observations (latent plus noise)
    pub fn predict_observed(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        settings: PredictiveSettings,
    ) -> Result<MultivariateNormal<F>> {
        self.likelihood.marginal(&self.predict(x, settings)?)
    }

    /// KL divergence of q(u) from its prior
    pub fn kl_divergence(&self) -> Result<F> {
        self.strategy
            .kl_divergence(&self.mean, &self.kernel, Some(self.generation))
    }

    /// Sum over the batch of the expected log likelihood and the KL divergence,
    /// computed without caching (for perturbed copies of the model)
    pub(crate) fn elbo_parts(
        &self,
        x: &ArrayView2<F>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<(F, F)> {
        let z = self.features_of(x)?;
        let q = self.strategy.predict(
            &self.mean,
            &self.kernel,
            &z,
            None,
            PredictOptions::default(),
        )?;
        let ell = self
            .likelihood
            .expected_log_prob(y, q.mean(), &q.variance())
            .sum();
        let kl = self.strategy.kl_divergence(&self.mean, &self.kernel, None)?;
        Ok((ell, kl))
    }
}

impl<F: Float, M: MeanFunction<F>, K: Kernel<F>> Trainable<F> for ApproximateGp<F, M, K> {
    fn parameters(&self) -> Parameters<F> {
        let mut params = Parameters::new();
        params.register(MEAN_GROUP, self.mean.hyperparameters());
        params.register(COVAR_GROUP, self.kernel.hyperparameters());
        params.register(
            LIKELIHOOD_GROUP,
            Array1::from_elem(1, self.likelihood.raw_noise()),
        );
        params.register(VARIATIONAL_GROUP, self.strategy.variational_parameters());
        if self.learn_inducing_locations {
            params.register(INDUCING_GROUP, self.strategy.inducing_parameters());
        }
        params
    }

    /// All groups are applied or none: on error the model is left untouched
    fn set_parameters(&mut self, params: &Parameters<F>) -> Result<()> {
        let mut mean = self.mean.clone();
        let mut kernel = self.kernel.clone();
        let mut likelihood = self.likelihood.clone();
        let mut strategy = self.strategy.clone();
        for (name, values) in params.iter() {
            match name {
                MEAN_GROUP => mean.set_hyperparameters(values)?,
                COVAR_GROUP => kernel.set_hyperparameters(values)?,
                LIKELIHOOD_GROUP => set_raw_noise(&mut likelihood, values)?,
                VARIATIONAL_GROUP => strategy.set_variational_parameters(values)?,
                INDUCING_GROUP => strategy.set_inducing_parameters(values)?,
                other => {
                    return Err(GpError::Configuration(format!(
                        "unknown parameter group {other} for an approximate model"
                    )))
                }
            }
        }
        self.mean = mean;
        self.kernel = kernel;
        self.likelihood = likelihood;
        self.strategy = strategy;
        self.generation.bump();
        Ok(())
    }

    fn generation(&self) -> Generation {
        self.generation
    }
}

impl<F, D, M, K> PredictInplace<ArrayBase<D, Ix2>, Array1<F>> for ExactGp<F, M, K>
where
    F: Float,
    D: Data<Elem = F>,
    M: MeanFunction<F>,
    K: Kernel<F>,
{
    fn predict_inplace(&self, x: &ArrayBase<D, Ix2>, y: &mut Array1<F>) {
        assert_eq!(
            x.nrows(),
            y.len(),
            "The number of data points must match the number of output targets."
        );
        *y = self.predict_mean(x).expect("GP prediction");
    }

    fn default_target(&self, x: &ArrayBase<D, Ix2>) -> Array1<F> {
        Array1::zeros(x.nrows())
    }
}

impl<F, D, M, K> PredictInplace<ArrayBase<D, Ix2>, Array1<F>> for ApproximateGp<F, M, K>
where
    F: Float,
    D: Data<Elem = F>,
    M: MeanFunction<F>,
    K: Kernel<F>,
{
    fn predict_inplace(&self, x: &ArrayBase<D, Ix2>, y: &mut Array1<F>) {
        assert_eq!(
            x.nrows(),
            y.len(),
            "The number of data points must match the number of output targets."
        );
        *y = self.predict_mean(x).expect("GP prediction");
    }

    fn default_target(&self, x: &ArrayBase<D, Ix2>) -> Array1<F> {
        Array1::zeros(x.nrows())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::ScaleToBounds;
    use crate::interpolation::{GridInterpolationKernel, InterpolatedCovariance};
    use crate::kernels::{RbfKernel, ScaleKernel};
    use crate::mean_models::{ConstantMean, LinearMean, ZeroMean};
    use crate::mll::ExactMarginalLogLikelihood;
    use crate::variational_distributions::{Variational, VariationalKind};
    use crate::variational_strategies::StandardStrategy;
    use approx::assert_abs_diff_eq;
    use linfa::prelude::Predict;
    use ndarray::{array, Array};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand_xoshiro::Xoshiro256Plus;

    fn data(n: usize, seed: u64) -> (Array2<f64>, Array1<f64>) {
        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        let x = Array::random_using((n, 1), Uniform::new(0f64, 1.), &mut rng);
        let y = x.column(0).mapv(|v| (6. * v).sin());
        (x, y)
    }

    fn exact() -> ExactGp<f64, ZeroMean, ScaleKernel<f64, RbfKernel<f64>>> {
        let (x, y) = data(30, 0);
        ExactGp::new(
            x,
            y,
            ZeroMean,
            ScaleKernel::new(RbfKernel::new(0.2).unwrap()),
            GaussianLikelihood::new(1e-2).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_exact_interpolates() {
        let gp = exact();
        let x = array![[0.25], [0.5], [0.75]];
        let mean = gp.predict_mean(&x).unwrap();
        assert_abs_diff_eq!(mean, x.column(0).mapv(|v| (6. * v).sin()), epsilon = 5e-2);
        let var = gp.predict_var(&x).unwrap();
        assert!(var.iter().all(|&v| (0. ..0.05).contains(&v)), "{var}");
        let pred: Array1<f64> = Predict::predict(&gp, &x);
        assert_abs_diff_eq!(pred, mean);
    }

    #[test]
    fn test_forward_modes() {
        let gp = exact();
        let x = array![[0.1], [0.2]];
        let prior = gp.forward(&x, Mode::Training).unwrap();
        assert_abs_diff_eq!(prior.mean(), &array![0., 0.]);
        assert_abs_diff_eq!(prior.variance(), array![1., 1.], epsilon = 1e-12);
        let post = gp.forward(&x, Mode::default()).unwrap();
        assert!(matches!(post.covariance(), Covariance::Dense(_)));
        assert_abs_diff_eq!(post.variance(), gp.predict_var(&x).unwrap(), epsilon = 1e-10);
        let observed = gp
            .predict_observed(&x, PredictiveSettings::default())
            .unwrap();
        assert_abs_diff_eq!(
            observed.variance(),
            post.variance() + gp.likelihood().noise(),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_dimension_checked_at_construction() {
        let (x, y) = data(10, 1);
        let err = ExactGp::new(
            x.clone(),
            y.clone(),
            ZeroMean,
            RbfKernel::ard(array![1., 1.]).unwrap(),
            GaussianLikelihood::default(),
        )
        .unwrap_err();
        assert!(matches!(err, GpError::DimensionMismatch { .. }));
        let err = ExactGp::new(
            x.clone(),
            y.clone(),
            LinearMean::new(3),
            RbfKernel::new(1.).unwrap(),
            GaussianLikelihood::default(),
        )
        .unwrap_err();
        assert!(matches!(err, GpError::DimensionMismatch { .. }));
        let z = Array2::zeros((4, 2));
        let s = StandardStrategy::new(z, Variational::new(VariationalKind::Delta, 4)).unwrap();
        let err = ApproximateGp::new(
            ZeroMean,
            RbfKernel::ard(array![1., 1., 1.]).unwrap(),
            s,
            GaussianLikelihood::default(),
        )
        .unwrap_err();
        assert!(matches!(err, GpError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_generation_bumped_on_update() {
        let mut gp = exact();
        let g0 = gp.generation();
        let before = gp.predict_mean(&array![[0.3]]).unwrap();
        let mut params = gp.parameters();
        assert_eq!(params.len(), 3);
        params.get_mut(COVAR_GROUP).unwrap()[0] = 0.5f64.ln();
        gp.set_parameters(&params).unwrap();
        assert!(gp.generation() > g0);
        let after = gp.predict_mean(&array![[0.3]]).unwrap();
        assert!((before[0] - after[0]).abs() > 1e-6);
        let mut bad = Parameters::new();
        bad.register("unknown", array![1.]);
        assert!(gp.set_parameters(&bad).is_err());
    }

    #[test]
    fn test_rejected_update_leaves_exact_model_untouched() {
        let mut gp = exact();
        let x = array![[0.33]];
        let g0 = gp.generation();
        let before = gp.predict_mean(&x).unwrap();
        gp.predict(&x, PredictiveSettings::fast()).unwrap();
        let params = gp.parameters();
        let mut mixed = Parameters::new();
        mixed.register(COVAR_GROUP, array![0.02f64.ln(), 0.]);
        mixed.register(LIKELIHOOD_GROUP, array![0., 0.]);
        assert!(matches!(
            gp.set_parameters(&mixed),
            Err(GpError::DimensionMismatch { .. })
        ));
        assert_eq!(gp.generation(), g0);
        assert_eq!(gp.parameters(), params);
        let after = gp.predict_mean(&x).unwrap();
        assert_abs_diff_eq!(after, before);
        assert_abs_diff_eq!(gp.clone().predict_mean(&x).unwrap(), after, epsilon = 1e-12);
        let fast = gp.predict(&x, PredictiveSettings::fast()).unwrap();
        assert_abs_diff_eq!(fast.mean(), &before, epsilon = 1e-10);
    }

    #[test]
    fn test_rejected_update_leaves_approximate_model_untouched() {
        let z = Array::linspace(0., 1., 5).insert_axis(Axis(1));
        let s = StandardStrategy::new(z, Variational::new(VariationalKind::Cholesky, 5)).unwrap();
        let mut gp = ApproximateGp::new(
            ZeroMean,
            ScaleKernel::new(RbfKernel::new(0.3).unwrap()),
            s,
            GaussianLikelihood::default(),
        )
        .unwrap()
        .learn_inducing_locations(true);
        let x = array![[0.33], [0.8]];
        let mut params = gp.parameters();
        params.get_mut(VARIATIONAL_GROUP).unwrap()[0] = 1.;
        gp.set_parameters(&params).unwrap();
        let g0 = gp.generation();
        let before = gp.predict(&x, PredictiveSettings::default()).unwrap();
        let kl = gp.kl_divergence().unwrap();
        let valid = gp.parameters();

        let mut mixed = valid.clone();
        mixed.get_mut(COVAR_GROUP).unwrap()[0] = 0.02f64.ln();
        mixed.get_mut(VARIATIONAL_GROUP).unwrap()[0] = -3.;
        mixed.register(INDUCING_GROUP, array![0., 1.]);
        assert!(gp.set_parameters(&mixed).is_err());
        assert_eq!(gp.generation(), g0);
        assert_eq!(gp.parameters(), valid);
        let after = gp.predict(&x, PredictiveSettings::default()).unwrap();
        assert_abs_diff_eq!(after.mean(), before.mean(), epsilon = 1e-12);
        assert_abs_diff_eq!(after.variance(), before.variance(), epsilon = 1e-12);
        assert_abs_diff_eq!(gp.kl_divergence().unwrap(), kl, epsilon = 1e-12);
        let fresh = gp.clone().predict(&x, PredictiveSettings::default()).unwrap();
        assert_abs_diff_eq!(fresh.mean(), after.mean(), epsilon = 1e-12);
    }

    #[test]
    fn test_exact_fast_pred_var_dense() {
        let gp = exact();
        let x = Array::linspace(0., 1., 15).insert_axis(Axis(1));
        let slow = gp.predict(&x, PredictiveSettings::default()).unwrap();
        let fast = gp.predict(&x, PredictiveSettings::fast()).unwrap();
        assert_abs_diff_eq!(slow.mean(), fast.mean(), epsilon = 1e-10);
        assert_abs_diff_eq!(slow.variance(), fast.variance(), epsilon = 1e-8);
    }

    fn ski_model() -> ExactGp<f64, ConstantMean<f64>, ScaleKernel<f64, GridInterpolationKernel<f64, RbfKernel<f64>>>>
    {
        let mut rng = Xoshiro256Plus::seed_from_u64(3);
        let x = Array::random_using((60, 2), Uniform::new(-3f64, 3.), &mut rng);
        let y = x.map_axis(Axis(1), |r| (r[0]).sin() + 0.5 * (r[1]).cos());
        let grid = GridInterpolationKernel::new(
            RbfKernel::new(0.8).unwrap(),
            24,
            &[(-1., 1.), (-1., 1.)],
        )
        .unwrap();
        let scaler = ScaleToBounds::new(-1., 1.)
            .unwrap()
            .fitted(&x.view())
            .unwrap();
        ExactGp::new(
            x,
            y,
            ConstantMean::default(),
            ScaleKernel::new(grid),
            GaussianLikelihood::new(1e-2).unwrap(),
        )
        .and_then(|gp| gp.with_features(Arc::new(scaler)))
        .unwrap()
    }

    #[test]
    fn test_ski_fast_pred_var_invariance() {
        let gp = ski_model();
        let mut rng = Xoshiro256Plus::seed_from_u64(4);
        let x = Array::random_using((12, 2), Uniform::new(-2.5, 2.5), &mut rng);
        let slow = gp.predict(&x, PredictiveSettings::default()).unwrap();
        let fast = gp.predict(&x, PredictiveSettings::fast()).unwrap();
        let rel = |a: &Array1<f64>, b: &Array1<f64>| {
            (a - b).mapv(f64::abs).sum() / b.mapv(f64::abs).sum().max(1e-12)
        };
        assert!(rel(fast.mean(), slow.mean()) < 1e-2);
        assert!(rel(&fast.variance(), &slow.variance()) < 1e-2);
        // full rank truncation changes nothing, lower ranks stay close on the mean
        let truncated = gp
            .predict(
                &x,
                PredictiveSettings {
                    fast_pred_var: true,
                    max_root_rank: Some(40),
                },
            )
            .unwrap();
        assert_abs_diff_eq!(truncated.mean(), fast.mean(), epsilon = 1e-10);
        assert!(truncated
            .variance()
            .iter()
            .zip(fast.variance().iter())
            .all(|(t, f)| *t >= *f - 1e-8));
    }

    #[test]
    fn test_ski_prior_is_structured() {
        let gp = ski_model();
        let x = array![[0.5, -0.5], [1., 2.]];
        let prior = gp.forward(&x, Mode::Training).unwrap();
        assert!(matches!(prior.covariance(), Covariance::Interpolated { .. }));
        let out = gp.forward(&array![[100., 0.]], Mode::Training);
        assert!(matches!(out, Err(GpError::OutOfBoundsInput { .. })));
    }

    /// Grid interpolated kernel refusing every dense covariance evaluation
    #[derive(Clone, Debug)]
    struct StructuredOnly<K>(K);

    impl<K: Kernel<f64>> Kernel<f64> for StructuredOnly<K> {
        fn input_dim(&self) -> Option<usize> {
            self.0.input_dim()
        }

        fn value(
            &self,
            x1: &ArrayBase<impl Data<Elem = f64>, Ix2>,
            x2: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        ) -> Result<Array2<f64>> {
            Err(GpError::Configuration(format!(
                "dense ({}, {}) covariance requested",
                x1.nrows(),
                x2.nrows()
            )))
        }

        fn diag(&self, x: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Result<Array1<f64>> {
            self.0.diag(x)
        }

        fn value_with_gradients(
            &self,
            x1: &ArrayBase<impl Data<Elem = f64>, Ix2>,
            x2: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        ) -> Result<(Array2<f64>, Vec<Array2<f64>>)> {
            Ok((self.value(x1, x2)?, vec![]))
        }

        fn hyperparameters(&self) -> Array1<f64> {
            self.0.hyperparameters()
        }

        fn set_hyperparameters(&mut self, raw: &Array1<f64>) -> Result<()> {
            self.0.set_hyperparameters(raw)
        }

        fn hyperparameter_names(&self) -> Vec<String> {
            self.0.hyperparameter_names()
        }

        fn structured(
            &self,
            x1: &ArrayBase<impl Data<Elem = f64>, Ix2>,
            x2: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        ) -> Result<Option<InterpolatedCovariance<f64>>> {
            self.0.structured(x1, x2)
        }
    }

    fn ski_kernel(
        grid_size: usize,
    ) -> ScaleKernel<f64, GridInterpolationKernel<f64, RbfKernel<f64>>> {
        ScaleKernel::new(
            GridInterpolationKernel::new(RbfKernel::new(0.2).unwrap(), grid_size, &[(0., 1.)])
                .unwrap(),
        )
    }

    #[test]
    fn test_large_ski_model_never_densified() {
        let (x, y) = data(2000, 11);
        let gp = ExactGp::new(
            x,
            y,
            ConstantMean::default(),
            StructuredOnly(ski_kernel(64)),
            GaussianLikelihood::new(1e-2).unwrap(),
        )
        .unwrap();
        assert!(gp.kernel().value(gp.train_features(), gp.train_features()).is_err());
        assert!(gp.is_iterative().unwrap());

        let mll = ExactMarginalLogLikelihood.value(&gp).unwrap();
        assert!(mll.is_finite());
        let objective = ExactMarginalLogLikelihood.evaluate(&gp).unwrap();
        for (_, g) in objective.gradients.iter() {
            assert!(g.iter().all(|v| v.is_finite()), "{g}");
        }

        let xs = Array::linspace(0.05, 0.95, 7).insert_axis(Axis(1));
        let truth = xs.column(0).mapv(|v: f64| (6. * v).sin());
        for settings in [PredictiveSettings::default(), PredictiveSettings::fast()] {
            let pred = gp.predict(&xs, settings).unwrap();
            assert_abs_diff_eq!(pred.mean(), &truth, epsilon = 0.05);
            assert!(pred.variance().iter().all(|v| (0. ..0.05).contains(v)));
        }
        let post = gp
            .forward(&xs, Mode::Evaluation(PredictiveSettings::default()))
            .unwrap();
        assert!(matches!(post.covariance(), Covariance::Dense(_)));

        // the factorized path needs the dense covariance
        let small_limit = IterativeSettings {
            max_cholesky_size: 5000,
            ..IterativeSettings::default()
        };
        let dense = gp.clone().with_iterative_settings(small_limit).unwrap();
        assert!(ExactMarginalLogLikelihood.value(&dense).is_err());
    }

    #[test]
    fn test_iterative_matches_factorized() {
        let (x, y) = data(300, 12);
        let factorized = ExactGp::new(
            x,
            y,
            ConstantMean::default(),
            ski_kernel(50),
            GaussianLikelihood::new(1e-2).unwrap(),
        )
        .unwrap();
        let iterative = factorized
            .clone()
            .with_iterative_settings(IterativeSettings {
                max_cholesky_size: 0,
                cg_tolerance: 1e-9,
                num_samples: 60,
                lanczos_steps: 80,
                ..IterativeSettings::default()
            })
            .unwrap();
        assert!(!factorized.is_iterative().unwrap());
        assert!(iterative.is_iterative().unwrap());

        let mll = ExactMarginalLogLikelihood;
        assert_abs_diff_eq!(
            mll.value(&iterative).unwrap(),
            mll.value(&factorized).unwrap(),
            epsilon = 0.05
        );
        let exact = mll.evaluate(&factorized).unwrap();
        let estimated = mll.evaluate(&iterative).unwrap();
        assert_abs_diff_eq!(
            estimated.gradients.get(MEAN_GROUP).unwrap(),
            exact.gradients.get(MEAN_GROUP).unwrap(),
            epsilon = 1e-5
        );
        for (_, g) in estimated.gradients.iter() {
            assert!(g.iter().all(|v| v.is_finite()));
        }

        let xs = Array::linspace(0.05, 0.95, 9).insert_axis(Axis(1));
        let expected = factorized.predict(&xs, PredictiveSettings::default()).unwrap();
        let slow = iterative.predict(&xs, PredictiveSettings::default()).unwrap();
        assert_abs_diff_eq!(slow.mean(), expected.mean(), epsilon = 1e-4);
        assert_abs_diff_eq!(slow.variance(), expected.variance(), epsilon = 1e-4);
        let fast = iterative.predict(&xs, PredictiveSettings::fast()).unwrap();
        assert_abs_diff_eq!(fast.mean(), expected.mean(), epsilon = 1e-4);
        assert_abs_diff_eq!(fast.variance(), expected.variance(), epsilon = 1e-3);

        let mode = Mode::Evaluation(PredictiveSettings::default());
        let full = iterative.forward(&xs, mode).unwrap();
        let expected_full = factorized.forward(&xs, mode).unwrap();
        match (full.covariance(), expected_full.covariance()) {
            (Covariance::Dense(a), Covariance::Dense(b)) => {
                assert_abs_diff_eq!(a, b, epsilon = 1e-4)
            }
            other => panic!("unexpected covariances {other:?}"),
        }
    }

    #[test]
    fn test_approximate_forward_and_parameters() {
        let z = Array::linspace(0., 1., 6).insert_axis(Axis(1));
        let s = StandardStrategy::new(z, Variational::new(VariationalKind::Cholesky, 6)).unwrap();
        let mut gp = ApproximateGp::new(
            ConstantMean::default(),
            ScaleKernel::new(RbfKernel::new(0.3).unwrap()),
            s,
            GaussianLikelihood::default(),
        )
        .unwrap();
        assert!(gp.parameters().get(INDUCING_GROUP).is_none());
        gp = gp.learn_inducing_locations(true);
        let params = gp.parameters();
        assert_eq!(
            params.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            vec![MEAN_GROUP, COVAR_GROUP, LIKELIHOOD_GROUP, VARIATIONAL_GROUP, INDUCING_GROUP]
        );
        assert_eq!(params.get(VARIATIONAL_GROUP).unwrap().len(), 6 + 21);
        let x = array![[0.2], [0.4], [0.9]];
        let q = gp.forward(&x, Mode::Training).unwrap();
        assert!(matches!(q.covariance(), Covariance::Diagonal(_)));
        let q = gp.forward(&x, Mode::default()).unwrap();
        assert!(matches!(q.covariance(), Covariance::Dense(_)));
        assert_abs_diff_eq!(gp.kl_divergence().unwrap(), 0., epsilon = 1e-10);
        gp = gp.learn_inducing_locations(false);
        assert!(gp.parameters().get(INDUCING_GROUP).is_none());
    }
}
