//! Approximate posteriors q(u) = N(m, S) over the function values at inducing points.
//!
//! The parameterizations are:
//! * full covariance `S = L L^T` with a lower triangular `L` whose diagonal is stored in log-space,
//! * mean-field `S = diag(s)` with `sqrt(s) = softplus(raw)`,
//! * delta (point mass) `S = 0`.
//!
//! Parameters are exposed as one flat raw vector, mean first.

use crate::distributions::{Covariance, MultivariateNormal};
use crate::errors::{GpError, Result};
use crate::utils::{
    cholesky_inverse, cholesky_logdet, inv_softplus, jittered_cholesky, sigmoid, softplus, solve_lower,
    DEFAULT_JITTER,
};
use linfa::Float;
use ndarray::{s, Array1, Array2, Axis};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Available parameterizations
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum VariationalKind {
    /// Full covariance (Cholesky factor)
    #[default]
    Cholesky,
    /// Diagonal covariance
    MeanField,
    /// Point mass
    Delta,
}

impl fmt::Display for VariationalKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            VariationalKind::Cholesky => "Cholesky",
            VariationalKind::MeanField => "MeanField",
            VariationalKind::Delta => "Delta",
        };
        write!(f, "{name}")
    }
}

/// A trait for variational distributions over inducing values
pub trait VariationalDistribution<F: Float>: Clone + fmt::Debug + Send + Sync {
    /// Parameterization
    fn kind(&self) -> VariationalKind;

    /// Number of inducing values
    fn num_inducing(&self) -> usize;

    /// Mean vector m
    fn mean(&self) -> &Array1<F>;

    /// Covariance S
    fn covariance(&self) -> Covariance<F>;

    /// Flat raw parameters (mean first)
    fn parameters(&self) -> Array1<F>;

    /// Set flat raw parameters
    fn set_parameters(&mut self, raw: &Array1<F>) -> Result<()>;

    /// KL(q || prior) against a factorized prior, for a point mass the prior fit penalty
    /// 0.5 (m - mu)^T P^-1 (m - mu)
    fn kl_divergence_factored(&self, prior: &PriorFactor<F>) -> Result<F>;

    /// Gradients of [VariationalDistribution::kl_divergence_factored] w.r.t. the mean and
    /// the covariance entries
    fn kl_gradients_factored(&self, prior: &PriorFactor<F>) -> Result<(Array1<F>, Array2<F>)>;

    /// KL(q || prior)
    fn kl_divergence(&self, prior: &MultivariateNormal<F>) -> Result<F> {
        self.kl_divergence_factored(&PriorFactor::new(prior, self.num_inducing())?)
    }

    /// Gradients of [VariationalDistribution::kl_divergence]
    fn kl_gradients(&self, prior: &MultivariateNormal<F>) -> Result<(Array1<F>, Array2<F>)> {
        self.kl_gradients_factored(&PriorFactor::new(prior, self.num_inducing())?)
    }

    /// Gradient w.r.t. the raw parameters of an objective given its gradients w.r.t.
    /// the mean `dm` and the covariance entries `ds`
    fn chain_gradients(&self, dm: &Array1<F>, ds: &Array2<F>) -> Array1<F>;

    /// Set q(u) to the given distribution (as far as the parameterization allows)
    fn initialize(&mut self, prior: &MultivariateNormal<F>) -> Result<()>;

    /// q(u) as a normal distribution
    fn distribution(&self) -> Result<MultivariateNormal<F>> {
        MultivariateNormal::new(self.mean().to_owned(), self.covariance())
    }
}

/// Prior N(mu, P) of the inducing values, factorized for the KL divergences
#[derive(Clone, Debug)]
pub struct PriorFactor<F: Float> {
    mean: Array1<F>,
    /// Some(L) with P = L L^T, None for the identity
    chol: Option<Arc<Array2<F>>>,
    /// Diagonal of P^-1 for diagonal priors
    inv_diag: Option<Array1<F>>,
}

impl<F: Float> PriorFactor<F> {
    /// N(0, I) over `m` values
    pub fn standard(m: usize) -> Self {
        PriorFactor {
            mean: Array1::zeros(m),
            chol: None,
            inv_diag: None,
        }
    }

    /// N(mean, L L^T) from an already computed lower Cholesky factor `chol`
    pub fn from_cholesky(mean: Array1<F>, chol: Arc<Array2<F>>) -> Result<Self> {
        if chol.dim() != (mean.len(), mean.len()) {
            return Err(GpError::dimension_mismatch(
                "prior Cholesky factor",
                mean.len(),
                chol.nrows(),
            ));
        }
        Ok(PriorFactor {
            mean,
            chol: Some(chol),
            inv_diag: None,
        })
    }

    /// Factorizes `prior` over `m` values, dense covariances get [DEFAULT_JITTER]
    pub fn new(prior: &MultivariateNormal<F>, m: usize) -> Result<Self> {
        if prior.dim() != m {
            return Err(GpError::dimension_mismatch(
                "variational prior",
                m,
                prior.dim(),
            ));
        }
        let mean = prior.mean().to_owned();
        match prior.covariance() {
            Covariance::Diagonal(d) => {
                if d.iter().any(|v| *v <= F::zero()) {
                    return Err(GpError::NumericalInstability(
                        "singular diagonal prior".to_string(),
                    ));
                }
                Ok(PriorFactor {
                    mean,
                    chol: None,
                    inv_diag: Some(d.mapv(|v| F::one() / v)),
                })
            }
            Covariance::Zero(_) => Err(GpError::NumericalInstability(
                "point mass prior".to_string(),
            )),
            cov => Ok(PriorFactor {
                mean,
                chol: Some(Arc::new(jittered_cholesky(
                    &cov.to_dense()?,
                    F::cast(DEFAULT_JITTER),
                    "variational prior",
                )?)),
                inv_diag: None,
            }),
        }
    }

    /// Number of values
    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    fn check_dim(&self, m: usize) -> Result<()> {
        if self.dim() != m {
            return Err(GpError::dimension_mismatch("variational prior", m, self.dim()));
        }
        Ok(())
    }

    /// (m - mu)^T P^-1 (m - mu)
    fn mahalanobis(&self, m: &Array1<F>) -> Result<F> {
        let r = m - &self.mean;
        match (self.chol.as_deref(), &self.inv_diag) {
            (Some(l), _) => {
                let z = solve_lower(l, &r.insert_axis(Axis(1)))?;
                Ok(z.mapv(|v| v * v).sum())
            }
            (None, Some(inv)) => Ok((&r * &r * inv).sum()),
            (None, None) => Ok(r.dot(&r)),
        }
    }

    /// P^-1
    fn precision(&self) -> Result<Array2<F>> {
        match (self.chol.as_deref(), &self.inv_diag) {
            (Some(l), _) => cholesky_inverse(l),
            (None, Some(inv)) => Ok(Array2::from_diag(inv)),
            (None, None) => Ok(Array2::eye(self.mean.len())),
        }
    }

    fn logdet(&self) -> F {
        match (self.chol.as_deref(), &self.inv_diag) {
            (Some(l), _) => cholesky_logdet(l),
            (None, Some(inv)) => -inv.mapv(|v| v.ln()).sum(),
            (None, None) => F::zero(),
        }
    }

    /// tr(P^-1 S) for S = root root^T
    fn trace_root(&self, root: &Array2<F>) -> Result<F> {
        match (self.chol.as_deref(), &self.inv_diag) {
            (Some(l), _) => Ok(solve_lower(l, root)?.mapv(|v| v * v).sum()),
            (None, Some(inv)) => Ok((root.mapv(|v| v * v).sum_axis(Axis(1)) * inv).sum()),
            (None, None) => Ok(root.mapv(|v| v * v).sum()),
        }
    }

    /// diag(P^-1)
    fn inv_diag(&self) -> Result<Array1<F>> {
        match (self.chol.as_deref(), &self.inv_diag) {
            (Some(l), _) => {
                let l_inv = solve_lower(l, &Array2::eye(l.nrows()))?;
                Ok(l_inv.mapv(|v| v * v).sum_axis(Axis(0)))
            }
            (None, Some(inv)) => Ok(inv.to_owned()),
            (None, None) => Ok(Array1::ones(self.mean.len())),
        }
    }
}

fn check_raw<F: Float>(what: &str, expected: usize, raw: &Array1<F>) -> Result<()> {
    if raw.len() != expected {
        return Err(GpError::dimension_mismatch(what, expected, raw.len()));
    }
    Ok(())
}

/// Full covariance variational distribution S = L L^T
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct CholeskyVariationalDistribution<F: Float> {
    mean: Array1<F>,
    /// Lower triangular factor with log-diagonal
    raw_chol: Array2<F>,
}

impl<F: Float> CholeskyVariationalDistribution<F> {
    /// q(u) = N(0, I) over `num_inducing` values
    pub fn new(num_inducing: usize) -> Self {
        CholeskyVariationalDistribution {
            mean: Array1::zeros(num_inducing),
            raw_chol: Array2::zeros((num_inducing, num_inducing)),
        }
    }

    /// Lower triangular factor L with a positive diagonal
    pub fn chol(&self) -> Array2<F> {
        let mut l = self.raw_chol.to_owned();
        l.diag_mut().mapv_inplace(|v| v.exp());
        l
    }
}

impl<F: Float> VariationalDistribution<F> for CholeskyVariationalDistribution<F> {
    fn kind(&self) -> VariationalKind {
        VariationalKind::Cholesky
    }

    fn num_inducing(&self) -> usize {
        self.mean.len()
    }

    fn mean(&self) -> &Array1<F> {
        &self.mean
    }

    fn covariance(&self) -> Covariance<F> {
        let l = self.chol();
        Covariance::Dense(l.dot(&l.t()))
    }

    fn parameters(&self) -> Array1<F> {
        let m = self.num_inducing();
        let mut raw = Vec::with_capacity(m + m * (m + 1) / 2);
        raw.extend(self.mean.iter());
        for i in 0..m {
            raw.extend(self.raw_chol.slice(s![i, ..=i]).iter());
        }
        Array1::from_vec(raw)
    }

    fn set_parameters(&mut self, raw: &Array1<F>) -> Result<()> {
        let m = self.num_inducing();
        check_raw("Cholesky variational parameters", m + m * (m + 1) / 2, raw)?;
        self.mean.assign(&raw.slice(s![..m]));
        let mut k = m;
        for i in 0..m {
            self.raw_chol
                .slice_mut(s![i, ..=i])
                .assign(&raw.slice(s![k..k + i + 1]));
            k += i + 1;
        }
        Ok(())
    }

    fn kl_divergence_factored(&self, p: &PriorFactor<F>) -> Result<F> {
        let m = self.num_inducing();
        p.check_dim(m)?;
        let l = self.chol();
        let trace = p.trace_root(&l)?;
        let quad = p.mahalanobis(&self.mean)?;
        let logdet_q = cholesky_logdet(&l);
        Ok(F::cast(0.5) * (trace + quad - F::cast(m) + p.logdet() - logdet_q))
    }

    fn kl_gradients_factored(&self, p: &PriorFactor<F>) -> Result<(Array1<F>, Array2<F>)> {
        p.check_dim(self.num_inducing())?;
        let precision = p.precision()?;
        let dm = precision.dot(&(&self.mean - &p.mean));
        let ds = (precision - cholesky_inverse(&self.chol())?) * F::cast(0.5);
        Ok((dm, ds))
    }

    fn chain_gradients(&self, dm: &Array1<F>, ds: &Array2<F>) -> Array1<F> {
        let m = self.num_inducing();
        let l = self.chol();
        // dF/dL = (G + G^T) L
        let dl = (ds + &ds.t()).dot(&l);
        let mut grad = Vec::with_capacity(m + m * (m + 1) / 2);
        grad.extend(dm.iter());
        for i in 0..m {
            for j in 0..=i {
                let g = if i == j { dl[[i, i]] * l[[i, i]] } else { dl[[i, j]] };
                grad.push(g);
            }
        }
        Array1::from_vec(grad)
    }

    fn initialize(&mut self, prior: &MultivariateNormal<F>) -> Result<()> {
        let m = self.num_inducing();
        if prior.dim() != m {
            return Err(GpError::dimension_mismatch(
                "variational initialization",
                m,
                prior.dim(),
            ));
        }
        let l = jittered_cholesky(
            &prior.covariance_matrix()?,
            F::cast(DEFAULT_JITTER),
            "variational initialization",
        )?;
        self.mean.assign(prior.mean());
        let mut raw = l;
        raw.diag_mut().mapv_inplace(|v| v.ln());
        self.raw_chol = raw;
        Ok(())
    }
}

/// Diagonal covariance variational distribution S = diag(softplus(raw)^2)
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct MeanFieldVariationalDistribution<F: Float> {
    mean: Array1<F>,
    raw_stddev: Array1<F>,
}

impl<F: Float> MeanFieldVariationalDistribution<F> {
    /// q(u) = N(0, I) over `num_inducing` values
    pub fn new(num_inducing: usize) -> Self {
        MeanFieldVariationalDistribution {
            mean: Array1::zeros(num_inducing),
            raw_stddev: Array1::from_elem(num_inducing, inv_softplus(F::one())),
        }
    }

    /// Standard deviations
    pub fn stddev(&self) -> Array1<F> {
        self.raw_stddev.mapv(softplus)
    }
}

impl<F: Float> VariationalDistribution<F> for MeanFieldVariationalDistribution<F> {
    fn kind(&self) -> VariationalKind {
        VariationalKind::MeanField
    }

    fn num_inducing(&self) -> usize {
        self.mean.len()
    }

    fn mean(&self) -> &Array1<F> {
        &self.mean
    }

    fn covariance(&self) -> Covariance<F> {
        Covariance::Diagonal(self.stddev().mapv(|v| v * v))
    }

    fn parameters(&self) -> Array1<F> {
        let mut raw = self.mean.to_vec();
        raw.extend(self.raw_stddev.iter());
        Array1::from_vec(raw)
    }

    fn set_parameters(&mut self, raw: &Array1<F>) -> Result<()> {
        let m = self.num_inducing();
        check_raw("mean-field variational parameters", 2 * m, raw)?;
        self.mean.assign(&raw.slice(s![..m]));
        self.raw_stddev.assign(&raw.slice(s![m..]));
        Ok(())
    }

    fn kl_divergence_factored(&self, p: &PriorFactor<F>) -> Result<F> {
        let m = self.num_inducing();
        p.check_dim(m)?;
        let var = self.stddev().mapv(|v| v * v);
        let trace = (p.inv_diag()? * &var).sum();
        let quad = p.mahalanobis(&self.mean)?;
        let logdet_q = var.mapv(|v| v.ln()).sum();
        Ok(F::cast(0.5) * (trace + quad - F::cast(m) + p.logdet() - logdet_q))
    }

    fn kl_gradients_factored(&self, p: &PriorFactor<F>) -> Result<(Array1<F>, Array2<F>)> {
        p.check_dim(self.num_inducing())?;
        let dm = p.precision()?.dot(&(&self.mean - &p.mean));
        let var = self.stddev().mapv(|v| v * v);
        let ds = (p.inv_diag()? - var.mapv(|v| F::one() / v)) * F::cast(0.5);
        Ok((dm, Array2::from_diag(&ds)))
    }

    fn chain_gradients(&self, dm: &Array1<F>, ds: &Array2<F>) -> Array1<F> {
        let mut grad = dm.to_vec();
        let two = F::cast(2.);
        grad.extend(
            self.raw_stddev
                .iter()
                .zip(ds.diag().iter())
                .map(|(&r, &g)| g * two * softplus(r) * sigmoid(r)),
        );
        Array1::from_vec(grad)
    }

    fn initialize(&mut self, prior: &MultivariateNormal<F>) -> Result<()> {
        if prior.dim() != self.num_inducing() {
            return Err(GpError::dimension_mismatch(
                "variational initialization",
                self.num_inducing(),
                prior.dim(),
            ));
        }
        self.mean.assign(prior.mean());
        self.raw_stddev = prior
            .stddev()
            .mapv(|s| inv_softplus(s.max(F::cast(1e-6))));
        Ok(())
    }
}

/// Point mass variational distribution (MAP estimate of the inducing values)
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct DeltaVariationalDistribution<F: Float> {
    mean: Array1<F>,
}

impl<F: Float> DeltaVariationalDistribution<F> {
    /// Point mass at 0 over `num_inducing` values
    pub fn new(num_inducing: usize) -> Self {
        DeltaVariationalDistribution {
            mean: Array1::zeros(num_inducing),
        }
    }
}

impl<F: Float> VariationalDistribution<F> for DeltaVariationalDistribution<F> {
    fn kind(&self) -> VariationalKind {
        VariationalKind::Delta
    }

    fn num_inducing(&self) -> usize {
        self.mean.len()
    }

    fn mean(&self) -> &Array1<F> {
        &self.mean
    }

    fn covariance(&self) -> Covariance<F> {
        Covariance::Zero(self.mean.len())
    }

    fn parameters(&self) -> Array1<F> {
        self.mean.to_owned()
    }

    fn set_parameters(&mut self, raw: &Array1<F>) -> Result<()> {
        check_raw("delta variational parameters", self.num_inducing(), raw)?;
        self.mean.assign(raw);
        Ok(())
    }

    fn kl_divergence_factored(&self, p: &PriorFactor<F>) -> Result<F> {
        p.check_dim(self.num_inducing())?;
        Ok(F::cast(0.5) * p.mahalanobis(&self.mean)?)
    }

    fn kl_gradients_factored(&self, p: &PriorFactor<F>) -> Result<(Array1<F>, Array2<F>)> {
        let m = self.num_inducing();
        p.check_dim(m)?;
        let dm = p.precision()?.dot(&(&self.mean - &p.mean));
        Ok((dm, Array2::zeros((m, m))))
    }

    fn chain_gradients(&self, dm: &Array1<F>, _ds: &Array2<F>) -> Array1<F> {
        dm.to_owned()
    }

    fn initialize(&mut self, prior: &MultivariateNormal<F>) -> Result<()> {
        if prior.dim() != self.num_inducing() {
            return Err(GpError::dimension_mismatch(
                "variational initialization",
                self.num_inducing(),
                prior.dim(),
            ));
        }
        self.mean.assign(prior.mean());
        Ok(())
    }
}

/// A variational distribution whose parameterization is chosen at runtime
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum Variational<F: Float> {
    /// Full covariance
    Cholesky(CholeskyVariationalDistribution<F>),
    /// Diagonal covariance
    MeanField(MeanFieldVariationalDistribution<F>),
    /// Point mass
    Delta(DeltaVariationalDistribution<F>),
}

impl<F: Float> Variational<F> {
    /// Distribution of the given kind over `num_inducing` values
    pub fn new(kind: VariationalKind, num_inducing: usize) -> Self {
        match kind {
            VariationalKind::Cholesky => {
                Variational::Cholesky(CholeskyVariationalDistribution::new(num_inducing))
            }
            VariationalKind::MeanField => {
                Variational::MeanField(MeanFieldVariationalDistribution::new(num_inducing))
            }
            VariationalKind::Delta => {
                Variational::Delta(DeltaVariationalDistribution::new(num_inducing))
            }
        }
    }
}

macro_rules! delegate {
    ($self:ident, $q:ident => $e:expr) => {
        match $self {
            Variational::Cholesky($q) => $e,
            Variational::MeanField($q) => $e,
            Variational::Delta($q) => $e,
        }
    };
}

impl<F: Float> VariationalDistribution<F> for Variational<F> {
    fn kind(&self) -> VariationalKind {
        delegate!(self, q => q.kind())
    }

    fn num_inducing(&self) -> usize {
        delegate!(self, q => q.num_inducing())
    }

    fn mean(&self) -> &Array1<F> {
        delegate!(self, q => q.mean())
    }

    fn covariance(&self) -> Covariance<F> {
        delegate!(self, q => q.covariance())
    }

    fn parameters(&self) -> Array1<F> {
        delegate!(self, q => q.parameters())
    }

    fn set_parameters(&mut self, raw: &Array1<F>) -> Result<()> {
        delegate!(self, q => q.set_parameters(raw))
    }

    fn kl_divergence_factored(&self, prior: &PriorFactor<F>) -> Result<F> {
        delegate!(self, q => q.kl_divergence_factored(prior))
    }

    fn kl_gradients_factored(&self, prior: &PriorFactor<F>) -> Result<(Array1<F>, Array2<F>)> {
        delegate!(self, q => q.kl_gradients_factored(prior))
    }

    fn chain_gradients(&self, dm: &Array1<F>, ds: &Array2<F>) -> Array1<F> {
        delegate!(self, q => q.chain_gradients(dm, ds))
    }

    fn initialize(&mut self, prior: &MultivariateNormal<F>) -> Result<()> {
        delegate!(self, q => q.initialize(prior))
    }
}
