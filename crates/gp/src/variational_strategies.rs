//! Variational strategies mapping q(u) at inducing points to q(f) at query points.
//!
//! With `K_zz = L L^T` (plus jitter), `A = L^-1 K_zx` and the projection
//! `P = A` (whitened) or `P = K_zz^-1 K_zx` (unwhitened), the conditional is
//!
//! ```text
//! mean(x) = mu(x) + P^T m_c
//! cov(x)  = K_xx - A^T A + P^T S P
//! ```
//!
//! where `m_c` is `m` (whitened) or `m - mu(Z)` (unwhitened).
//!
//! The orthogonally decoupled strategy adds a mean-only path over a second inducing
//! set whose values are point estimates `b`:
//!
//! ```text
//! mean(x) += C(x, Z_b) b,  KL += 0.5 b^T C(Z_b, Z_b) b
//! ```
//!
//! with `C` the covariance of the inner conditional. The mean-only set never enters
//! a factorization.

use crate::cache::{FactorCache, Generation};
use crate::distributions::{Covariance, MultivariateNormal};
use crate::errors::{GpError, Result};
use crate::kernels::Kernel;
use crate::likelihood::GaussianLikelihood;
use crate::mean_models::MeanFunction;
use crate::utils::{jittered_cholesky, solve_lower, solve_lower_t, DEFAULT_JITTER};
use crate::variational_distributions::{
    PriorFactor, Variational, VariationalDistribution, VariationalKind,
};
use linfa::Float;
use ndarray::{s, Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// How a predictive distribution is computed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PredictOptions {
    /// Full covariance matrix instead of marginal variances
    pub full_covariance: bool,
    /// Reuse cached predictive weights (same result up to round-off)
    pub fast_pred_var: bool,
}

/// Batch terms of the evidence lower bound with their analytic gradients
/// w.r.t. the raw variational parameters and the raw noise
#[derive(Clone, Debug)]
pub struct ElboTerms<F: Float> {
    /// Sum over the batch of E_q[log p(y_i | f_i)]
    pub expected_log_lik: F,
    /// KL divergence between q(u) and its prior
    pub kl: F,
    /// Gradient of `expected_log_lik` w.r.t. the variational parameters
    pub dell_dvariational: Array1<F>,
    /// Gradient of `kl` w.r.t. the variational parameters
    pub dkl_dvariational: Array1<F>,
    /// Gradient of `expected_log_lik` w.r.t. the raw noise
    pub dell_draw_noise: F,
}

/// A trait for variational strategies
pub trait VariationalStrategy<F: Float>: Clone + fmt::Debug + Send + Sync {
    /// Input dimension of the inducing points
    fn input_dim(&self) -> usize;

    /// Number of inducing points entering the covariance factorization
    fn num_inducing(&self) -> usize;

    /// Approximate posterior q(f) at the rows of `x`.
    ///
    /// Factorizations are cached for `generation` when given.
    fn predict<M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        mean: &M,
        kernel: &K,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        generation: Option<Generation>,
        options: PredictOptions,
    ) -> Result<MultivariateNormal<F>>;

    /// KL divergence of q(u) from the prior
    fn kl_divergence<M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        mean: &M,
        kernel: &K,
        generation: Option<Generation>,
    ) -> Result<F>;

    /// ELBO terms on the batch `(x, y)`
    fn elbo_terms<M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        mean: &M,
        kernel: &K,
        likelihood: &GaussianLikelihood<F>,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
        generation: Option<Generation>,
    ) -> Result<ElboTerms<F>>;

    /// Raw variational parameters
    fn variational_parameters(&self) -> Array1<F>;

    /// Set raw variational parameters
    fn set_variational_parameters(&mut self, raw: &Array1<F>) -> Result<()>;

    /// Inducing locations flattened row by row
    fn inducing_parameters(&self) -> Array1<F>;

    /// Set inducing locations from a flat vector
    fn set_inducing_parameters(&mut self, raw: &Array1<F>) -> Result<()>;

    /// Sets q(u) to the prior when it is not whitened
    fn initialize<M: MeanFunction<F>, K: Kernel<F>>(&mut self, mean: &M, kernel: &K)
        -> Result<()>;
}

/// Predictive weights valid for one parameter generation:
/// `mean(x) = mu(x) + K_xz weights`, `cov(x) = K_xx + K_xz middle K_zx`
#[derive(Debug)]
struct PredictionCache<F: Float> {
    weights: Array1<F>,
    middle: Array2<F>,
    /// Weights of the mean-only inducing set (decoupled strategy)
    mean_weights: Option<Array1<F>>,
}

/// `L^-1 K_zx` and `K_zz^-1 K_zx` when not whitened
struct Projection<F: Float> {
    whitened: Array2<F>,
    unwhitened: Option<Array2<F>>,
}

impl<F: Float> Projection<F> {
    fn interp(&self) -> &Array2<F> {
        self.unwhitened.as_ref().unwrap_or(&self.whitened)
    }
}

/// `S p` or None when S = 0
fn covariance_times<F: Float>(cov: &Covariance<F>, p: &Array2<F>) -> Result<Option<Array2<F>>> {
    Ok(match cov {
        Covariance::Zero(_) => None,
        Covariance::Diagonal(d) => Some(p * &d.view().insert_axis(Axis(1))),
        Covariance::Dense(s) => Some(s.dot(p)),
        other => Some(other.to_dense()?.dot(p)),
    })
}

fn column_dots<F: Float>(a: &Array2<F>, b: &Array2<F>) -> Array1<F> {
    (a * b).sum_axis(Axis(0))
}

fn symmetrize<F: Float>(m: Array2<F>) -> Array2<F> {
    (&m + &m.t()) * F::cast(0.5)
}

fn outer<F: Float>(u: &Array1<F>, v: &Array1<F>) -> Array2<F> {
    u.view()
        .insert_axis(Axis(1))
        .dot(&v.view().insert_axis(Axis(0)))
}

fn flatten<F: Float>(x: &Array2<F>) -> Array1<F> {
    x.iter().cloned().collect()
}

fn check_columns<F: Float>(
    what: &str,
    expected: usize,
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<()> {
    if x.ncols() != expected {
        return Err(GpError::dimension_mismatch(what, expected, x.ncols()));
    }
    Ok(())
}

fn inducing_cache<F: Float>() -> FactorCache<Array2<F>> {
    FactorCache::new("inducing Cholesky")
}

fn prediction_cache<F: Float>() -> FactorCache<PredictionCache<F>> {
    FactorCache::new("variational prediction")
}

/// Inducing point strategy conditioning q(f) on q(u) over a single inducing set
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct StandardStrategy<F: Float> {
    inducing_points: Array2<F>,
    variational: Variational<F>,
    whiten: bool,
    jitter: F,
    #[cfg_attr(feature = "serializable", serde(skip, default = "inducing_cache"))]
    chol_cache: FactorCache<Array2<F>>,
    #[cfg_attr(feature = "serializable", serde(skip, default = "prediction_cache"))]
    pred_cache: FactorCache<PredictionCache<F>>,
}

impl<F: Float> StandardStrategy<F> {
    /// Whitened strategy over `inducing_points` (m, d) with q(u) given by `variational`
    pub fn new(inducing_points: Array2<F>, variational: Variational<F>) -> Result<Self> {
        if inducing_points.nrows() == 0 {
            return Err(GpError::Configuration(
                "at least one inducing point is required".to_string(),
            ));
        }
        if variational.num_inducing() != inducing_points.nrows() {
            return Err(GpError::dimension_mismatch(
                "variational distribution size",
                inducing_points.nrows(),
                variational.num_inducing(),
            ));
        }
        Ok(StandardStrategy {
            inducing_points,
            variational,
            whiten: true,
            jitter: F::cast(DEFAULT_JITTER),
            chol_cache: inducing_cache(),
            pred_cache: prediction_cache(),
        })
    }

    /// Whitened (u = L v, prior N(0, I) on v) or unwhitened parameterization
    pub fn whitened(mut self, whiten: bool) -> Self {
        self.whiten = whiten;
        self
    }

    /// Diagonal jitter added to `K_zz` before factorization
    pub fn with_jitter(mut self, jitter: F) -> Result<Self> {
        if !(jitter >= F::zero()) {
            return Err(GpError::Configuration(format!(
                "jitter should be non negative, got {jitter}"
            )));
        }
        self.jitter = jitter;
        Ok(self)
    }

    /// Inducing locations (m, d)
    pub fn inducing_points(&self) -> &Array2<F> {
        &self.inducing_points
    }

    /// q(u)
    pub fn variational_distribution(&self) -> &Variational<F> {
        &self.variational
    }

    /// Whether q(u) is whitened
    pub fn is_whitened(&self) -> bool {
        self.whiten
    }

    /// Jitter added to `K_zz`
    pub fn jitter(&self) -> F {
        self.jitter
    }

    /// Lower Cholesky factor of `K_zz + jitter I`, cached per generation
    pub fn inducing_cholesky<K: Kernel<F>>(
        &self,
        kernel: &K,
        generation: Option<Generation>,
    ) -> Result<Arc<Array2<F>>> {
        self.chol_cache.fetch(generation, || {
            let kzz = kernel.value(&self.inducing_points, &self.inducing_points)?;
            jittered_cholesky(&kzz, self.jitter, "inducing points")
        })
    }

    /// Distribution q(u) is compared to: N(0, I) when whitened, N(mu(Z), K_zz) otherwise
    pub fn prior<M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        mean: &M,
        kernel: &K,
    ) -> Result<MultivariateNormal<F>> {
        let m = self.inducing_points.nrows();
        if self.whiten {
            MultivariateNormal::new(Array1::zeros(m), Covariance::Diagonal(Array1::ones(m)))
        } else {
            let kzz = kernel.value(&self.inducing_points, &self.inducing_points)?;
            MultivariateNormal::new(
                mean.value(&self.inducing_points),
                Covariance::Dense(symmetrize(kzz)),
            )
        }
    }

    /// Factorized prior of the KL term, reusing the cached `K_zz + jitter I` factor when
    /// not whitened
    pub fn kl_prior<M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        mean: &M,
        kernel: &K,
        generation: Option<Generation>,
    ) -> Result<PriorFactor<F>> {
        if self.whiten {
            return Ok(PriorFactor::standard(self.num_inducing()));
        }
        let chol = self.inducing_cholesky(kernel, generation)?;
        PriorFactor::from_cholesky(mean.value(&self.inducing_points), chol)
    }

    fn project<K: Kernel<F>>(
        &self,
        kernel: &K,
        chol: &Array2<F>,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Projection<F>> {
        let kzx = kernel.value(&self.inducing_points, x)?;
        let whitened = solve_lower(chol, &kzx)?;
        let unwhitened = if self.whiten {
            None
        } else {
            Some(solve_lower_t(chol, &whitened)?)
        };
        Ok(Projection {
            whitened,
            unwhitened,
        })
    }

    fn centered_mean<M: MeanFunction<F>>(&self, mean: &M) -> Array1<F> {
        let m = self.variational.mean();
        if self.whiten {
            m.to_owned()
        } else {
            m - &mean.value(&self.inducing_points)
        }
    }

    /// `R = L^-1` and `R_p` such that `P = R_p K_zx`
    fn whitening_operators<K: Kernel<F>>(
        &self,
        kernel: &K,
        generation: Option<Generation>,
    ) -> Result<(Array2<F>, Array2<F>)> {
        let chol = self.inducing_cholesky(kernel, generation)?;
        let r = solve_lower(&chol, &Array2::eye(chol.nrows()))?;
        let r_p = if self.whiten {
            r.to_owned()
        } else {
            r.t().dot(&r)
        };
        Ok((r, r_p))
    }

    fn cached_prediction<M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        mean: &M,
        kernel: &K,
        generation: Option<Generation>,
    ) -> Result<Arc<PredictionCache<F>>> {
        self.pred_cache.fetch(generation, || {
            let (r, r_p) = self.whitening_operators(kernel, generation)?;
            let weights = r_p.t().dot(&self.centered_mean(mean));
            Ok(PredictionCache {
                weights,
                middle: self.middle_term(&r, &r_p)?,
                mean_weights: None,
            })
        })
    }

    /// `-R^T R + R_p^T S R_p`
    fn middle_term(&self, r: &Array2<F>, r_p: &Array2<F>) -> Result<Array2<F>> {
        let mut middle = -r.t().dot(r);
        if let Some(sr) = covariance_times(&self.variational.covariance(), r_p)? {
            middle = middle + r_p.t().dot(&sr);
        }
        Ok(symmetrize(middle))
    }

    /// Conditional mean and covariance at `x` given the projection of `x`
    fn conditional<M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        mean: &M,
        kernel: &K,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        proj: &Projection<F>,
        full_covariance: bool,
    ) -> Result<(Array1<F>, Covariance<F>)> {
        let a = &proj.whitened;
        let p = proj.interp();
        let f_mean = mean.value(x) + p.t().dot(&self.centered_mean(mean));
        let sp = covariance_times(&self.variational.covariance(), p)?;
        let covariance = if full_covariance {
            let mut cov = kernel.value(x, x)? - a.t().dot(a);
            if let Some(sp) = sp {
                cov = cov + p.t().dot(&sp);
            }
            Covariance::Dense(symmetrize(cov))
        } else {
            let mut var = kernel.diag(x)? - column_dots(a, a);
            if let Some(sp) = sp {
                var = var + column_dots(p, &sp);
            }
            Covariance::Diagonal(var.mapv(|v| v.max(F::zero())))
        };
        Ok((f_mean, covariance))
    }

    /// Prediction from cached weights
    fn fast_predict<M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        mean: &M,
        kernel: &K,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        cache: &PredictionCache<F>,
        full_covariance: bool,
    ) -> Result<(Array1<F>, Covariance<F>)> {
        let kxz = kernel.value(x, &self.inducing_points)?;
        let f_mean = mean.value(x) + kxz.dot(&cache.weights);
        let km = kxz.dot(&cache.middle);
        let covariance = if full_covariance {
            Covariance::Dense(symmetrize(kernel.value(x, x)? + km.dot(&kxz.t())))
        } else {
            let var = kernel.diag(x)? + (km * &kxz).sum_axis(Axis(1));
            Covariance::Diagonal(var.mapv(|v| v.max(F::zero())))
        };
        Ok((f_mean, covariance))
    }

    fn invalidate(&self) {
        self.chol_cache.invalidate();
        self.pred_cache.invalidate();
    }
}

impl<F: Float> VariationalStrategy<F> for StandardStrategy<F> {
    fn input_dim(&self) -> usize {
        self.inducing_points.ncols()
    }

    fn num_inducing(&self) -> usize {
        self.inducing_points.nrows()
    }

    fn predict<M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        mean: &M,
        kernel: &K,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        generation: Option<Generation>,
        options: PredictOptions,
    ) -> Result<MultivariateNormal<F>> {
        check_columns("query points", self.input_dim(), x)?;
        let (f_mean, cov) = if options.fast_pred_var {
            let cache = self.cached_prediction(mean, kernel, generation)?;
            self.fast_predict(mean, kernel, x, &cache, options.full_covariance)?
        } else {
            let chol = self.inducing_cholesky(kernel, generation)?;
            let proj = self.project(kernel, &chol, x)?;
            self.conditional(mean, kernel, x, &proj, options.full_covariance)?
        };
        MultivariateNormal::new(f_mean, cov)
    }

    fn kl_divergence<M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        mean: &M,
        kernel: &K,
        generation: Option<Generation>,
    ) -> Result<F> {
        self.variational
            .kl_divergence_factored(&self.kl_prior(mean, kernel, generation)?)
    }

    fn elbo_terms<M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        mean: &M,
        kernel: &K,
        likelihood: &GaussianLikelihood<F>,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
        generation: Option<Generation>,
    ) -> Result<ElboTerms<F>> {
        check_columns("training points", self.input_dim(), x)?;
        let chol = self.inducing_cholesky(kernel, generation)?;
        let proj = self.project(kernel, &chol, x)?;
        let (f_mean, cov) = self.conditional(mean, kernel, x, &proj, false)?;
        let var = cov.diag();
        let noise = likelihood.noise();
        let expected_log_lik = likelihood.expected_log_prob(y, &f_mean, &var).sum();

        let p = proj.interp();
        let residuals = (y - &f_mean).mapv(|v| v / noise);
        let dm = p.dot(&residuals);
        let ds = p.dot(&p.t()) * (-F::cast(0.5) / noise);
        let dell_dvariational = self.variational.chain_gradients(&dm, &ds);

        let prior = self.kl_prior(mean, kernel, generation)?;
        let kl = self.variational.kl_divergence_factored(&prior)?;
        let (dkm, dks) = self.variational.kl_gradients_factored(&prior)?;
        Ok(ElboTerms {
            expected_log_lik,
            kl,
            dell_dvariational,
            dkl_dvariational: self.variational.chain_gradients(&dkm, &dks),
            dell_draw_noise: likelihood.expected_log_prob_dnoise(y, &f_mean, &var)
                * likelihood.dnoise_draw(),
        })
    }

    fn variational_parameters(&self) -> Array1<F> {
        self.variational.parameters()
    }

    fn set_variational_parameters(&mut self, raw: &Array1<F>) -> Result<()> {
        self.pred_cache.invalidate();
        self.variational.set_parameters(raw)
    }

    fn inducing_parameters(&self) -> Array1<F> {
        flatten(&self.inducing_points)
    }

    fn set_inducing_parameters(&mut self, raw: &Array1<F>) -> Result<()> {
        let shape = self.inducing_points.dim();
        if raw.len() != shape.0 * shape.1 {
            return Err(GpError::dimension_mismatch(
                "inducing locations",
                shape.0 * shape.1,
                raw.len(),
            ));
        }
        self.invalidate();
        self.inducing_points = raw.to_owned().into_shape(shape)?;
        Ok(())
    }

    fn initialize<M: MeanFunction<F>, K: Kernel<F>>(
        &mut self,
        mean: &M,
        kernel: &K,
    ) -> Result<()> {
        if !self.whiten {
            let prior = self.prior(mean, kernel)?;
            self.variational.initialize(&prior)?;
            self.pred_cache.invalidate();
        }
        Ok(())
    }
}

/// Strategy with separate inducing sets for the mean and the covariance
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct OrthogonallyDecoupledStrategy<F: Float> {
    covar: StandardStrategy<F>,
    mean_inducing_points: Array2<F>,
    mean_distribution: Variational<F>,
    #[cfg_attr(feature = "serializable", serde(skip, default = "prediction_cache"))]
    pred_cache: FactorCache<PredictionCache<F>>,
}

/// Inner conditional pieces shared by prediction and ELBO computations
struct DecoupledConditional<F: Float> {
    proj_x: Projection<F>,
    proj_b: Projection<F>,
    mean: Array1<F>,
    covariance: Covariance<F>,
}

impl<F: Float> OrthogonallyDecoupledStrategy<F> {
    /// Decouples `covar` (covariance path) from a mean path over `mean_inducing_points`
    /// whose values are given by a delta distribution
    pub fn new(
        covar: StandardStrategy<F>,
        mean_inducing_points: Array2<F>,
        mean_distribution: Variational<F>,
    ) -> Result<Self> {
        if mean_distribution.kind() != VariationalKind::Delta {
            return Err(GpError::Configuration(format!(
                "the mean path of a decoupled strategy requires a Delta distribution, got {}",
                mean_distribution.kind()
            )));
        }
        if mean_inducing_points.nrows() == 0 {
            return Err(GpError::Configuration(
                "at least one mean inducing point is required".to_string(),
            ));
        }
        check_columns(
            "mean inducing points",
            covar.inducing_points.ncols(),
            &mean_inducing_points,
        )?;
        if mean_distribution.num_inducing() != mean_inducing_points.nrows() {
            return Err(GpError::dimension_mismatch(
                "mean distribution size",
                mean_inducing_points.nrows(),
                mean_distribution.num_inducing(),
            ));
        }
        Ok(OrthogonallyDecoupledStrategy {
            covar,
            mean_inducing_points,
            mean_distribution,
            pred_cache: prediction_cache(),
        })
    }

    /// Covariance path
    pub fn covar_strategy(&self) -> &StandardStrategy<F> {
        &self.covar
    }

    /// Mean-only inducing locations
    pub fn mean_inducing_points(&self) -> &Array2<F> {
        &self.mean_inducing_points
    }

    /// Point estimates of the mean-only inducing values
    pub fn mean_distribution(&self) -> &Variational<F> {
        &self.mean_distribution
    }

    fn num_mean_inducing(&self) -> usize {
        self.mean_inducing_points.nrows()
    }

    fn inner_conditional<M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        mean: &M,
        kernel: &K,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        generation: Option<Generation>,
        full_covariance: bool,
    ) -> Result<DecoupledConditional<F>> {
        let chol = self.covar.inducing_cholesky(kernel, generation)?;
        let proj_x = self.covar.project(kernel, &chol, x)?;
        let proj_b = self
            .covar
            .project(kernel, &chol, &self.mean_inducing_points)?;
        let (f_mean, covariance) =
            self.covar
                .conditional(mean, kernel, x, &proj_x, full_covariance)?;
        Ok(DecoupledConditional {
            proj_x,
            proj_b,
            mean: f_mean,
            covariance,
        })
    }

    /// Inner conditional covariance between the rows of `x` and the mean set
    fn cross_covariance<K: Kernel<F>>(
        &self,
        kernel: &K,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        proj_x: &Projection<F>,
        proj_b: &Projection<F>,
    ) -> Result<Array2<F>> {
        let mut c = kernel.value(x, &self.mean_inducing_points)?
            - proj_x.whitened.t().dot(&proj_b.whitened);
        let p_b = proj_b.interp();
        if let Some(sp) = covariance_times(&self.covar.variational.covariance(), p_b)? {
            c = c + proj_x.interp().t().dot(&sp);
        }
        Ok(c)
    }

    /// `0.5 b^T C_bb b` and `C_bb b`
    fn mean_penalty<K: Kernel<F>>(
        &self,
        kernel: &K,
        proj_b: &Projection<F>,
    ) -> Result<(F, Array1<F>, Array1<F>)> {
        let b = self.mean_distribution.mean();
        let kbb = kernel.value(&self.mean_inducing_points, &self.mean_inducing_points)?;
        let ab = proj_b.whitened.dot(b);
        let pb = proj_b.interp().dot(b);
        let s_pb = self.covar.variational.covariance().matvec(&pb)?;
        let c_b = kbb.dot(b) - proj_b.whitened.t().dot(&ab) + proj_b.interp().t().dot(&s_pb);
        Ok((F::cast(0.5) * b.dot(&c_b), c_b, pb))
    }

    fn cached_prediction<M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        mean: &M,
        kernel: &K,
        generation: Option<Generation>,
    ) -> Result<Arc<PredictionCache<F>>> {
        self.pred_cache.fetch(generation, || {
            let (r, r_p) = self.covar.whitening_operators(kernel, generation)?;
            let b = self.mean_distribution.mean();
            let kzb = kernel.value(&self.covar.inducing_points, &self.mean_inducing_points)?;
            let kzb_b = kzb.dot(b);
            let ab = r.dot(&kzb_b);
            let pb = r_p.dot(&kzb_b);
            let s_pb = self.covar.variational.covariance().matvec(&pb)?;
            let weights = r_p.t().dot(&self.covar.centered_mean(mean)) - r.t().dot(&ab)
                + r_p.t().dot(&s_pb);
            Ok(PredictionCache {
                weights,
                middle: self.covar.middle_term(&r, &r_p)?,
                mean_weights: Some(b.to_owned()),
            })
        })
    }
}

impl<F: Float> VariationalStrategy<F> for OrthogonallyDecoupledStrategy<F> {
    fn input_dim(&self) -> usize {
        self.covar.input_dim()
    }

    fn num_inducing(&self) -> usize {
        self.covar.num_inducing()
    }

    fn predict<M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        mean: &M,
        kernel: &K,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        generation: Option<Generation>,
        options: PredictOptions,
    ) -> Result<MultivariateNormal<F>> {
        check_columns("query points", self.input_dim(), x)?;
        if options.fast_pred_var {
            let cache = self.cached_prediction(mean, kernel, generation)?;
            let (mut f_mean, cov) =
                self.covar
                    .fast_predict(mean, kernel, x, &cache, options.full_covariance)?;
            if let Some(b) = &cache.mean_weights {
                f_mean = f_mean + kernel.value(x, &self.mean_inducing_points)?.dot(b);
            }
            return MultivariateNormal::new(f_mean, cov);
        }
        let cond = self.inner_conditional(mean, kernel, x, generation, options.full_covariance)?;
        let c_xb = self.cross_covariance(kernel, x, &cond.proj_x, &cond.proj_b)?;
        let f_mean = cond.mean + c_xb.dot(self.mean_distribution.mean());
        MultivariateNormal::new(f_mean, cond.covariance)
    }

    fn kl_divergence<M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        mean: &M,
        kernel: &K,
        generation: Option<Generation>,
    ) -> Result<F> {
        let chol = self.covar.inducing_cholesky(kernel, generation)?;
        let proj_b = self
            .covar
            .project(kernel, &chol, &self.mean_inducing_points)?;
        let (penalty, _, _) = self.mean_penalty(kernel, &proj_b)?;
        Ok(self.covar.kl_divergence(mean, kernel, generation)? + penalty)
    }

    fn elbo_terms<M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        mean: &M,
        kernel: &K,
        likelihood: &GaussianLikelihood<F>,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
        generation: Option<Generation>,
    ) -> Result<ElboTerms<F>> {
        check_columns("training points", self.input_dim(), x)?;
        let cond = self.inner_conditional(mean, kernel, x, generation, false)?;
        let c_xb = self.cross_covariance(kernel, x, &cond.proj_x, &cond.proj_b)?;
        let b = self.mean_distribution.mean();
        let f_mean = &cond.mean + &c_xb.dot(b);
        let var = cond.covariance.diag();
        let noise = likelihood.noise();
        let expected_log_lik = likelihood.expected_log_prob(y, &f_mean, &var).sum();
        let residuals = (y - &f_mean).mapv(|v| v / noise);

        // covariance path
        let p_x = cond.proj_x.interp();
        let p_r = p_x.dot(&residuals);
        let (penalty, c_b, pb) = self.mean_penalty(kernel, &cond.proj_b)?;
        let ds = p_x.dot(&p_x.t()) * (-F::cast(0.5) / noise) + outer(&p_r, &pb);
        let q = &self.covar.variational;
        let mut dell = q.chain_gradients(&p_r, &ds).to_vec();
        let prior = self.covar.kl_prior(mean, kernel, generation)?;
        let (dkm, dks) = q.kl_gradients_factored(&prior)?;
        let dks = dks + outer(&pb, &pb) * F::cast(0.5);
        let mut dkl = q.chain_gradients(&dkm, &dks).to_vec();

        // mean path
        let nb = self.num_mean_inducing();
        let zeros = Array2::zeros((nb, nb));
        dell.extend(
            self.mean_distribution
                .chain_gradients(&c_xb.t().dot(&residuals), &zeros),
        );
        dkl.extend(self.mean_distribution.chain_gradients(&c_b, &zeros));

        Ok(ElboTerms {
            expected_log_lik,
            kl: q.kl_divergence_factored(&prior)? + penalty,
            dell_dvariational: Array1::from_vec(dell),
            dkl_dvariational: Array1::from_vec(dkl),
            dell_draw_noise: likelihood.expected_log_prob_dnoise(y, &f_mean, &var)
                * likelihood.dnoise_draw(),
        })
    }

    fn variational_parameters(&self) -> Array1<F> {
        let mut raw = self.covar.variational_parameters().to_vec();
        raw.extend(self.mean_distribution.parameters().iter());
        Array1::from_vec(raw)
    }

    fn set_variational_parameters(&mut self, raw: &Array1<F>) -> Result<()> {
        let n_covar = self.covar.variational.parameters().len();
        let expected = n_covar + self.num_mean_inducing();
        if raw.len() != expected {
            return Err(GpError::dimension_mismatch(
                "decoupled variational parameters",
                expected,
                raw.len(),
            ));
        }
        self.pred_cache.invalidate();
        self.covar
            .set_variational_parameters(&raw.slice(s![..n_covar]).to_owned())?;
        self.mean_distribution
            .set_parameters(&raw.slice(s![n_covar..]).to_owned())
    }

    fn inducing_parameters(&self) -> Array1<F> {
        let mut raw = self.covar.inducing_parameters().to_vec();
        raw.extend(self.mean_inducing_points.iter());
        Array1::from_vec(raw)
    }

    fn set_inducing_parameters(&mut self, raw: &Array1<F>) -> Result<()> {
        let n_covar = self.covar.inducing_points.len();
        let shape = self.mean_inducing_points.dim();
        let expected = n_covar + shape.0 * shape.1;
        if raw.len() != expected {
            return Err(GpError::dimension_mismatch(
                "decoupled inducing locations",
                expected,
                raw.len(),
            ));
        }
        self.pred_cache.invalidate();
        self.covar
            .set_inducing_parameters(&raw.slice(s![..n_covar]).to_owned())?;
        self.mean_inducing_points = raw.slice(s![n_covar..]).to_owned().into_shape(shape)?;
        Ok(())
    }

    fn initialize<M: MeanFunction<F>, K: Kernel<F>>(
        &mut self,
        mean: &M,
        kernel: &K,
    ) -> Result<()> {
        self.pred_cache.invalidate();
        self.covar.initialize(mean, kernel)
    }
}

/// A variational strategy chosen at runtime
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum Strategy<F: Float> {
    /// Single inducing set
    Standard(StandardStrategy<F>),
    /// Separate mean and covariance inducing sets
    OrthogonallyDecoupled(OrthogonallyDecoupledStrategy<F>),
}

impl<F: Float> From<StandardStrategy<F>> for Strategy<F> {
    fn from(s: StandardStrategy<F>) -> Self {
        Strategy::Standard(s)
    }
}

impl<F: Float> From<OrthogonallyDecoupledStrategy<F>> for Strategy<F> {
    fn from(s: OrthogonallyDecoupledStrategy<F>) -> Self {
        Strategy::OrthogonallyDecoupled(s)
    }
}

impl<F: Float> Strategy<F> {
    /// Number of inducing points of both paths
    pub fn num_inducing_total(&self) -> usize {
        match self {
            Strategy::Standard(s) => s.num_inducing(),
            Strategy::OrthogonallyDecoupled(s) => s.num_inducing() + s.num_mean_inducing(),
        }
    }
}

macro_rules! delegate {
    ($self:ident, $s:ident => $e:expr) => {
        match $self {
            Strategy::Standard($s) => $e,
            Strategy::OrthogonallyDecoupled($s) => $e,
        }
    };
}

impl<F: Float> VariationalStrategy<F> for Strategy<F> {
    fn input_dim(&self) -> usize {
        delegate!(self, s => s.input_dim())
    }

    fn num_inducing(&self) -> usize {
        delegate!(self, s => s.num_inducing())
    }

    fn predict<M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        mean: &M,
        kernel: &K,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        generation: Option<Generation>,
        options: PredictOptions,
    ) -> Result<MultivariateNormal<F>> {
        delegate!(self, s => s.predict(mean, kernel, x, generation, options))
    }

    fn kl_divergence<M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        mean: &M,
        kernel: &K,
        generation: Option<Generation>,
    ) -> Result<F> {
        delegate!(self, s => s.kl_divergence(mean, kernel, generation))
    }

    fn elbo_terms<M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        mean: &M,
        kernel: &K,
        likelihood: &GaussianLikelihood<F>,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
        generation: Option<Generation>,
    ) -> Result<ElboTerms<F>> {
        delegate!(self, s => s.elbo_terms(mean, kernel, likelihood, x, y, generation))
    }

    fn variational_parameters(&self) -> Array1<F> {
        delegate!(self, s => s.variational_parameters())
    }

    fn set_variational_parameters(&mut self, raw: &Array1<F>) -> Result<()> {
        delegate!(self, s => s.set_variational_parameters(raw))
    }

    fn inducing_parameters(&self) -> Array1<F> {
        delegate!(self, s => s.inducing_parameters())
    }

    fn set_inducing_parameters(&mut self, raw: &Array1<F>) -> Result<()> {
        delegate!(self, s => s.set_inducing_parameters(raw))
    }

    fn initialize<M: MeanFunction<F>, K: Kernel<F>>(
        &mut self,
        mean: &M,
        kernel: &K,
    ) -> Result<()> {
        delegate!(self, s => s.initialize(mean, kernel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{RbfKernel, ScaleKernel};
    use crate::mean_models::{ConstantMean, ZeroMean};
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::{Normal, Uniform};
    use ndarray_rand::RandomExt;
    use rand_xoshiro::Xoshiro256Plus;

    fn kernel() -> ScaleKernel<f64, RbfKernel<f64>> {
        ScaleKernel::new(RbfKernel::new(0.2).unwrap())
            .with_outputscale(1.3)
            .unwrap()
    }

    fn points(n: usize, seed: u64) -> Array2<f64> {
        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        Array::random_using((n, 1), Uniform::new(0., 1.), &mut rng)
    }

    fn randomize<S: VariationalStrategy<f64>>(strategy: &mut S, seed: u64) {
        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        let n = strategy.variational_parameters().len();
        let raw = Array::random_using(n, Normal::new(0., 0.3).unwrap(), &mut rng);
        strategy.set_variational_parameters(&raw).unwrap();
    }

    fn standard(kind: VariationalKind, m: usize, whiten: bool) -> StandardStrategy<f64> {
        let z = Array::linspace(0., 1., m).insert_axis(Axis(1));
        StandardStrategy::new(z, Variational::new(kind, m))
            .unwrap()
            .whitened(whiten)
    }

    fn decoupled(m_covar: usize, m_mean: usize) -> OrthogonallyDecoupledStrategy<f64> {
        let zb = Array::linspace(0.02, 0.98, m_mean).insert_axis(Axis(1));
        OrthogonallyDecoupledStrategy::new(
            standard(VariationalKind::Cholesky, m_covar, true),
            zb,
            Variational::new(VariationalKind::Delta, m_mean),
        )
        .unwrap()
    }

    #[test]
    fn test_prior_recovered_at_initialization() {
        // whitened q(v) = N(0, I) gives q(f) = prior
        let s = standard(VariationalKind::Cholesky, 8, true);
        let x = points(5, 0);
        let k = kernel();
        let q = s
            .predict(&ZeroMean, &k, &x, None, PredictOptions::default())
            .unwrap();
        assert_abs_diff_eq!(q.mean(), &Array1::zeros(5), epsilon = 1e-12);
        assert_abs_diff_eq!(q.variance(), k.diag(&x).unwrap(), epsilon = 1e-5);
    }

    #[test]
    fn test_unwhitened_initialized_to_prior() {
        let mut s = standard(VariationalKind::Cholesky, 6, false);
        let k = kernel();
        let mean = ConstantMean::new(0.7);
        s.initialize(&mean, &k).unwrap();
        assert_abs_diff_eq!(
            s.kl_divergence(&mean, &k, None).unwrap(),
            0.,
            epsilon = 1e-4
        );
        let x = points(4, 1);
        let q = s
            .predict(&mean, &k, &x, None, PredictOptions::default())
            .unwrap();
        assert_abs_diff_eq!(q.mean(), &Array1::from_elem(4, 0.7), epsilon = 1e-5);
    }

    #[test]
    fn test_unwhitened_kl_uses_strategy_jitter() {
        // duplicated inducing points make K_zz singular
        let z = array![[0.2], [0.2], [0.6], [0.9]];
        let k = kernel();
        let mean = ConstantMean::new(0.3);
        let kl_with = |jitter: f64| {
            let mut s = StandardStrategy::new(
                z.clone(),
                Variational::new(VariationalKind::Cholesky, 4),
            )
            .unwrap()
            .whitened(false)
            .with_jitter(jitter)
            .unwrap();
            randomize(&mut s, 7);
            let generation = Generation::default();
            let kl = s.kl_divergence(&mean, &k, Some(generation)).unwrap();
            // the KL filled the shared inducing factor cache
            assert_eq!(s.chol_cache.cached_generation(), Some(generation));
            let kzz = k.value(&z, &z).unwrap();
            let chol = jittered_cholesky(&kzz, jitter, "expected").unwrap();
            let prior = PriorFactor::from_cholesky(mean.value(&z), Arc::new(chol)).unwrap();
            let expected = s.variational.kl_divergence_factored(&prior).unwrap();
            assert_abs_diff_eq!(kl, expected, epsilon = 1e-10);
            assert!(kl.is_finite());
            kl
        };
        let small = kl_with(1e-3);
        let large = kl_with(1e-1);
        assert!((small - large).abs() > 1e-6);
    }

    #[test]
    fn test_full_and_marginal_predictions_agree() {
        let mut s = standard(VariationalKind::Cholesky, 7, true);
        randomize(&mut s, 3);
        let x = points(6, 2);
        let k = kernel();
        let full = s
            .predict(
                &ZeroMean,
                &k,
                &x,
                None,
                PredictOptions {
                    full_covariance: true,
                    fast_pred_var: false,
                },
            )
            .unwrap();
        let diag = s
            .predict(&ZeroMean, &k, &x, None, PredictOptions::default())
            .unwrap();
        assert_abs_diff_eq!(full.mean(), diag.mean(), epsilon = 1e-12);
        assert_abs_diff_eq!(full.variance(), diag.variance(), epsilon = 1e-10);
    }

    #[test]
    fn test_fast_pred_var_matches() {
        let k = kernel();
        let x = points(10, 4);
        let mut strategies: Vec<Strategy<f64>> = vec![
            standard(VariationalKind::Cholesky, 9, true).into(),
            standard(VariationalKind::MeanField, 9, false).into(),
            standard(VariationalKind::Delta, 9, true).into(),
            decoupled(5, 12).into(),
        ];
        for (i, s) in strategies.iter_mut().enumerate() {
            randomize(s, 10 + i as u64);
            for full_covariance in [false, true] {
                let slow = s
                    .predict(
                        &ZeroMean,
                        &k,
                        &x,
                        Some(Generation::default()),
                        PredictOptions {
                            full_covariance,
                            fast_pred_var: false,
                        },
                    )
                    .unwrap();
                let fast = s
                    .predict(
                        &ZeroMean,
                        &k,
                        &x,
                        Some(Generation::default()),
                        PredictOptions {
                            full_covariance,
                            fast_pred_var: true,
                        },
                    )
                    .unwrap();
                assert_abs_diff_eq!(slow.mean(), fast.mean(), epsilon = 1e-5);
                assert_abs_diff_eq!(slow.variance(), fast.variance(), epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_cache_dropped_on_parameter_update() {
        let mut s = standard(VariationalKind::Cholesky, 5, true);
        let k = kernel();
        let x = points(3, 5);
        let gen = Some(Generation::default());
        let fast = PredictOptions {
            full_covariance: false,
            fast_pred_var: true,
        };
        let before = s.predict(&ZeroMean, &k, &x, gen, fast).unwrap();
        randomize(&mut s, 6);
        let after = s.predict(&ZeroMean, &k, &x, gen, fast).unwrap();
        let fresh = s.predict(&ZeroMean, &k, &x, None, fast).unwrap();
        assert!((before.mean() - after.mean()).mapv(f64::abs).sum() > 1e-6);
        assert_abs_diff_eq!(after.mean(), fresh.mean(), epsilon = 1e-12);
    }

    #[test]
    fn test_decoupled_requires_delta_mean() {
        let z = array![[0.1], [0.5]];
        let err = OrthogonallyDecoupledStrategy::new(
            standard(VariationalKind::Cholesky, 3, true),
            z.clone(),
            Variational::new(VariationalKind::MeanField, 2),
        )
        .unwrap_err();
        assert!(matches!(err, GpError::Configuration(_)));
        let err = OrthogonallyDecoupledStrategy::new(
            standard(VariationalKind::Cholesky, 3, true),
            array![[0.1, 0.2]],
            Variational::new(VariationalKind::Delta, 1),
        )
        .unwrap_err();
        assert!(matches!(err, GpError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_decoupled_with_zero_mean_path_is_inner() {
        let mut d = decoupled(6, 20);
        let n_covar = d.covar_strategy().variational_parameters().len();
        let mut raw = d.variational_parameters();
        let mut rng = Xoshiro256Plus::seed_from_u64(7);
        raw.slice_mut(s![..n_covar])
            .assign(&Array::random_using(n_covar, Normal::new(0., 0.3).unwrap(), &mut rng));
        raw.slice_mut(s![n_covar..]).fill(0.);
        d.set_variational_parameters(&raw).unwrap();
        let k = kernel();
        let x = points(8, 8);
        let q = d
            .predict(&ZeroMean, &k, &x, None, PredictOptions::default())
            .unwrap();
        let q_in = d
            .covar_strategy()
            .predict(&ZeroMean, &k, &x, None, PredictOptions::default())
            .unwrap();
        assert_abs_diff_eq!(q.mean(), q_in.mean(), epsilon = 1e-12);
        assert_abs_diff_eq!(
            d.kl_divergence(&ZeroMean, &k, None).unwrap(),
            d.covar_strategy().kl_divergence(&ZeroMean, &k, None).unwrap(),
            epsilon = 1e-12
        );
    }

    fn check_elbo_gradients<S: VariationalStrategy<f64>>(mut s: S, seed: u64) {
        randomize(&mut s, seed);
        let k = kernel();
        let mean = ConstantMean::new(0.1);
        let x = points(12, seed + 1);
        let y = x.column(0).mapv(|v| (6. * v).sin());
        let lik = GaussianLikelihood::new(0.2).unwrap();
        let terms = s.elbo_terms(&mean, &k, &lik, &x, &y, None).unwrap();
        let theta = s.variational_parameters();
        let eps = 1e-6;
        for p in 0..theta.len() {
            let mut t = theta.clone();
            t[p] += eps;
            let mut up = s.clone();
            up.set_variational_parameters(&t).unwrap();
            t[p] -= 2. * eps;
            let mut lo = s.clone();
            lo.set_variational_parameters(&t).unwrap();
            let up = up.elbo_terms(&mean, &k, &lik, &x, &y, None).unwrap();
            let lo = lo.elbo_terms(&mean, &k, &lik, &x, &y, None).unwrap();
            let fd_ell = (up.expected_log_lik - lo.expected_log_lik) / (2. * eps);
            let fd_kl = (up.kl - lo.kl) / (2. * eps);
            assert_abs_diff_eq!(terms.dell_dvariational[p], fd_ell, epsilon = 1e-4);
            assert_abs_diff_eq!(terms.dkl_dvariational[p], fd_kl, epsilon = 1e-4);
        }
        let raw = lik.raw_noise();
        let mut up = lik.clone();
        up.set_raw_noise(raw + eps);
        let mut lo = lik.clone();
        lo.set_raw_noise(raw - eps);
        let fd = (s.elbo_terms(&mean, &k, &up, &x, &y, None).unwrap().expected_log_lik
            - s.elbo_terms(&mean, &k, &lo, &x, &y, None).unwrap().expected_log_lik)
            / (2. * eps);
        assert_abs_diff_eq!(terms.dell_draw_noise, fd, epsilon = 1e-4);
    }

    #[test]
    fn test_elbo_gradients() {
        check_elbo_gradients(standard(VariationalKind::Cholesky, 4, true), 20);
        check_elbo_gradients(standard(VariationalKind::MeanField, 4, false), 30);
        check_elbo_gradients(standard(VariationalKind::Delta, 4, true), 40);
        check_elbo_gradients(decoupled(3, 5), 50);
    }

    #[test]
    fn test_inducing_parameters_roundtrip() {
        let mut s: Strategy<f64> = decoupled(3, 4).into();
        let raw = s.inducing_parameters();
        assert_eq!(raw.len(), 7);
        let shifted = &raw + 0.01;
        s.set_inducing_parameters(&shifted).unwrap();
        assert_abs_diff_eq!(s.inducing_parameters(), shifted);
        assert!(s.set_inducing_parameters(&array![0.]).is_err());
    }
}
