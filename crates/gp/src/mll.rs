//! Training objectives.
//!
//! Both objectives are maximized quantities reported per datum. They are returned as an
//! [Objective] whose `loss` is the negated objective and whose gradients are the loss
//! gradients w.r.t. every raw parameter group of the model, ready for the optimizer.

use crate::errors::{GpError, Result};
use crate::kernels::Kernel;
use crate::mean_models::MeanFunction;
use crate::models::{
    ApproximateGp, ExactGp, Parameters, Trainable, TrainingSolver, COVAR_GROUP,
    INDUCING_GROUP, LIKELIHOOD_GROUP, MEAN_GROUP, VARIATIONAL_GROUP,
};
use crate::utils::{cholesky_inverse, to_f64};
use crate::variational_strategies::VariationalStrategy;

use finitediff::ndarr;
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};

/// Loss (negated objective) and its gradients by parameter group
#[derive(Clone, Debug)]
pub struct Objective<F: Float> {
    /// Value to minimize
    pub loss: F,
    /// Gradients of `loss` w.r.t. raw parameters
    pub gradients: Parameters<F>,
}

/// Central finite differences of `value` around `theta`
fn numerical_gradient<F: Float>(
    theta: &Array1<F>,
    value: impl Fn(&Array1<F>) -> Result<F>,
) -> Result<Array1<F>> {
    if theta.is_empty() {
        return Ok(Array1::zeros(0));
    }
    let f = |t: &Array1<f64>| -> std::result::Result<f64, anyhow::Error> {
        Ok(to_f64(value(&t.mapv(F::cast))?))
    };
    let grad = ndarr::central_diff(&f)(&theta.mapv(to_f64))?;
    Ok(grad.mapv(F::cast))
}

/// Exact marginal log likelihood `log p(y | X)` divided by the number of training points
#[derive(Clone, Copy, Debug, Default)]
pub struct ExactMarginalLogLikelihood;

impl ExactMarginalLogLikelihood {
    /// Objective value of the model on its training data
    pub fn value<F: Float, M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        model: &ExactGp<F, M, K>,
    ) -> Result<F> {
        let post = model.posterior_factor()?;
        let residuals = model.train_targets() - &model.mean().value(model.train_features());
        let n = F::cast(residuals.len());
        let fit = residuals.dot(&post.alpha);
        let log_2pi = F::cast((2. * std::f64::consts::PI).ln());
        let mll = -F::cast(0.5) * (fit + post.logdet() + n * log_2pi);
        Ok(mll / n)
    }

    /// Loss and gradients w.r.t. mean, kernel and noise raw parameters.
    ///
    /// Gradients are analytic when the training covariance is factorized. On the iterative
    /// path the traces `tr(K^-1 dK)` are Hutchinson estimates over the solver random
    /// vectors and the kernel products are differentiated by central finite differences.
    pub fn evaluate<F: Float, M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        model: &ExactGp<F, M, K>,
    ) -> Result<Objective<F>> {
        let value = self.value(model)?;
        let post = model.posterior_factor()?;
        let x = model.train_features();
        let n = F::cast(x.nrows());
        let half = F::cast(0.5);
        let alpha = &post.alpha;
        let dmean = model.mean().jacobian(x).t().dot(alpha) / n;

        let (dcovar, dnoise) = match &post.solver {
            TrainingSolver::Cholesky(chol) => {
                self.factorized_gradients(model, &cholesky_inverse(chol)?, alpha)?
            }
            TrainingSolver::Iterative(factor) => {
                let kernel = model.kernel();
                let dcovar = numerical_gradient(&kernel.hyperparameters(), |theta| {
                    let mut k = kernel.clone();
                    k.set_hyperparameters(theta)?;
                    let op = k.structured(x, x)?.ok_or_else(|| {
                        GpError::Configuration("kernel lost its grid structure".to_string())
                    })?;
                    let fit = alpha.dot(&op.matvec(alpha)?);
                    Ok(fit - factor.trace_solve(|v: &Array1<F>| op.matvec(v))?)
                })?
                .mapv(|g| half * g / n);
                let trace_k_inv = factor.trace_solve(|v: &Array1<F>| Ok(v.to_owned()))?;
                let dnoise =
                    half * (alpha.dot(alpha) - trace_k_inv) * model.likelihood().dnoise_draw() / n;
                (dcovar, dnoise)
            }
        };

        let mut gradients = Parameters::new();
        gradients.register(MEAN_GROUP, -dmean);
        gradients.register(COVAR_GROUP, -dcovar);
        gradients.register(LIKELIHOOD_GROUP, Array1::from_elem(1, -dnoise));
        Ok(Objective {
            loss: -value,
            gradients,
        })
    }

    fn factorized_gradients<F: Float, M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        model: &ExactGp<F, M, K>,
        k_inv: &Array2<F>,
        alpha: &Array1<F>,
    ) -> Result<(Array1<F>, F)> {
        let x = model.train_features();
        let n = F::cast(x.nrows());
        let half = F::cast(0.5);

        // d mll / d theta = 0.5 tr((alpha alpha^T - K^-1) dK)
        let mut inner = -k_inv.clone();
        for ((i, j), v) in inner.indexed_iter_mut() {
            *v += alpha[i] * alpha[j];
        }
        let (_, dk) = model.kernel().value_with_gradients(x, x)?;
        let dcovar = Array1::from_iter(dk.iter().map(|d| half * (&inner * d).sum() / n));

        let trace_k_inv = k_inv.diag().sum();
        let dnoise = half * (alpha.dot(alpha) - trace_k_inv) * model.likelihood().dnoise_draw() / n;
        Ok((dcovar, dnoise))
    }
}

/// Evidence lower bound of a variational model on a batch
///
/// ```text
/// elbo = sum_b E_q[log p(y_b | f_b)] / B - beta * KL(q(u) || p(u)) / N
/// ```
///
/// with `B` the batch size and `N` the total number of training points, so that the
/// batch estimate is unbiased for the full data ELBO divided by `N`.
#[derive(Clone, Copy, Debug)]
pub struct VariationalElbo<F: Float> {
    num_data: usize,
    beta: F,
}

impl<F: Float> VariationalElbo<F> {
    /// ELBO for a training set of `num_data` points
    pub fn new(num_data: usize) -> Result<Self> {
        if num_data == 0 {
            return Err(GpError::Configuration(
                "the ELBO requires a positive number of training points".to_string(),
            ));
        }
        Ok(VariationalElbo {
            num_data,
            beta: F::one(),
        })
    }

    /// Weight of the KL term (1 by default)
    pub fn with_beta(mut self, beta: F) -> Result<Self> {
        if !(beta >= F::zero()) {
            return Err(GpError::Configuration(format!(
                "KL weight should be non negative, got {beta}"
            )));
        }
        self.beta = beta;
        Ok(self)
    }

    /// Total number of training points
    pub fn num_data(&self) -> usize {
        self.num_data
    }

    /// KL weight
    pub fn beta(&self) -> F {
        self.beta
    }

    fn combine(&self, ell: F, kl: F, batch: usize) -> F {
        ell / F::cast(batch) - self.beta * kl / F::cast(self.num_data)
    }

    fn check_batch(&self, x_rows: usize, y_len: usize) -> Result<()> {
        if x_rows != y_len {
            return Err(GpError::dimension_mismatch("batch targets", x_rows, y_len));
        }
        if y_len == 0 {
            return Err(GpError::Configuration("empty batch".to_string()));
        }
        Ok(())
    }

    /// ELBO value on the batch `(x, y)`
    pub fn value<M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        model: &ApproximateGp<F, M, K>,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<F> {
        self.check_batch(x.nrows(), y.len())?;
        let (ell, kl) = model.elbo_parts(&x.view(), y)?;
        Ok(self.combine(ell, kl, y.len()))
    }

    /// Loss and gradients on the batch `(x, y)`.
    ///
    /// Variational parameters and noise get analytic gradients, mean, kernel and inducing
    /// location gradients are obtained by central finite differences.
    pub fn evaluate<M: MeanFunction<F>, K: Kernel<F>>(
        &self,
        model: &ApproximateGp<F, M, K>,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<Objective<F>> {
        self.check_batch(x.nrows(), y.len())?;
        let batch = y.len();
        let z = model.features_of(x)?;
        let terms = model.strategy().elbo_terms(
            model.mean(),
            model.kernel(),
            model.likelihood(),
            &z,
            y,
            Some(model.generation()),
        )?;
        let value = self.combine(terms.expected_log_lik, terms.kl, batch);
        let b = F::cast(batch);
        let n = F::cast(self.num_data);

        let x = x.view();
        let perturbed = |group: &str, t: &Array1<F>| -> Result<F> {
            let mut copy = model.clone();
            let mut single = Parameters::new();
            single.register(group, t.to_owned());
            copy.set_parameters(&single)?;
            let (ell, kl) = copy.elbo_parts(&x, y)?;
            Ok(self.combine(ell, kl, batch))
        };

        let mut gradients = Parameters::new();
        for (name, values) in model.parameters().iter() {
            let grad = match name {
                VARIATIONAL_GROUP => {
                    -(&terms.dell_dvariational / b - &terms.dkl_dvariational * (self.beta / n))
                }
                LIKELIHOOD_GROUP => Array1::from_elem(1, -terms.dell_draw_noise / b),
                MEAN_GROUP | COVAR_GROUP | INDUCING_GROUP => {
                    -numerical_gradient(values, |t| perturbed(name, t))?
                }
                other => {
                    return Err(GpError::Configuration(format!(
                        "no gradient for parameter group {other}"
                    )))
                }
            };
            gradients.register(name, grad);
        }
        Ok(Objective {
            loss: -value,
            gradients,
        })
    }
}
