use crate::distributions::{Covariance, MultivariateNormal};
use crate::errors::{GpError, Result};
use crate::utils::{inv_softplus, sigmoid, softplus};
use linfa::Float;
use ndarray::{Array1, ArrayBase, Data, Ix1, Zip};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Lower bound added to the noise variance
pub const NOISE_FLOOR: f64 = 1e-4;

/// Homoscedastic Gaussian observation noise y = f + e, e ~ N(0, noise).
///
/// The noise variance is `softplus(raw) + NOISE_FLOOR`.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct GaussianLikelihood<F: Float> {
    raw_noise: F,
}

impl<F: Float> Default for GaussianLikelihood<F> {
    fn default() -> Self {
        GaussianLikelihood { raw_noise: F::zero() }
    }
}

impl<F: Float> GaussianLikelihood<F> {
    /// Likelihood with a given initial noise variance (greater than the floor)
    pub fn new(noise: F) -> Result<Self> {
        let floor = F::cast(NOISE_FLOOR);
        if !(noise > floor) {
            return Err(GpError::Configuration(format!(
                "noise variance should be greater than {NOISE_FLOOR}, got {noise}"
            )));
        }
        Ok(GaussianLikelihood {
            raw_noise: inv_softplus(noise - floor),
        })
    }

    /// Noise variance
    pub fn noise(&self) -> F {
        softplus(self.raw_noise) + F::cast(NOISE_FLOOR)
    }

    /// d noise / d raw
    pub fn dnoise_draw(&self) -> F {
        sigmoid(self.raw_noise)
    }

    /// Raw (unconstrained) parameter
    pub fn raw_noise(&self) -> F {
        self.raw_noise
    }

    /// Set the raw parameter
    pub fn set_raw_noise(&mut self, raw: F) {
        self.raw_noise = raw;
    }

    /// Distribution of observations given the latent distribution `f`
    pub fn marginal(&self, f: &MultivariateNormal<F>) -> Result<MultivariateNormal<F>> {
        let noise = Array1::from_elem(f.dim(), self.noise());
        let cov: Covariance<F> = f.covariance().add_diag(&noise);
        MultivariateNormal::new(f.mean().to_owned(), cov)
    }

    /// E_q[log p(y_i | f_i)] for each i where q(f_i) = N(mean_i, var_i)
    pub fn expected_log_prob(
        &self,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
        mean: &Array1<F>,
        var: &Array1<F>,
    ) -> Array1<F> {
        let noise = self.noise();
        let half_log = F::cast(0.5) * (F::cast(2. * std::f64::consts::PI) * noise).ln();
        let mut res = Array1::zeros(y.len());
        Zip::from(&mut res)
            .and(y)
            .and(mean)
            .and(var)
            .for_each(|r, &yi, &mi, &vi| {
                *r = -half_log - ((yi - mi) * (yi - mi) + vi) / (F::cast(2.) * noise);
            });
        res
    }

    /// Derivative of the summed expected log likelihood w.r.t. the noise variance
    pub fn expected_log_prob_dnoise(
        &self,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
        mean: &Array1<F>,
        var: &Array1<F>,
    ) -> F {
        let noise = self.noise();
        let two = F::cast(2.);
        let sq = Zip::from(y)
            .and(mean)
            .and(var)
            .fold(F::zero(), |acc, &yi, &mi, &vi| {
                acc + (yi - mi) * (yi - mi) + vi
            });
        -F::cast(y.len()) / (two * noise) + sq / (two * noise * noise)
    }
}
