//! Metrics to evaluate GP models predictions on test data, and a k-fold
//! cross-validated Q2 predictive coefficient for any fitted linfa model.

use crate::distributions::MultivariateNormal;
use crate::errors::{GpError, Result};
use linfa::dataset::Dataset;
use linfa::{
    traits::{Fit, Predict, PredictInplace},
    Float, ParamGuard,
};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1};

fn check_targets<F: Float>(
    pred: &MultivariateNormal<F>,
    test_y: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Result<()> {
    if pred.dim() != test_y.len() {
        return Err(GpError::dimension_mismatch(
            "test targets",
            pred.dim(),
            test_y.len(),
        ));
    }
    if test_y.is_empty() {
        return Err(GpError::Configuration("no test target".to_string()));
    }
    Ok(())
}

/// Mean of `|y - mean|`
pub fn mean_absolute_error<F: Float>(
    pred: &MultivariateNormal<F>,
    test_y: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Result<F> {
    check_targets(pred, test_y)?;
    let n = F::cast(test_y.len());
    Ok((test_y - pred.mean()).mapv(|v| v.abs()).sum() / n)
}

/// Square root of the mean of `(y - mean)^2`
pub fn root_mean_squared_error<F: Float>(
    pred: &MultivariateNormal<F>,
    test_y: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Result<F> {
    check_targets(pred, test_y)?;
    let n = F::cast(test_y.len());
    Ok(((test_y - pred.mean()).mapv(|v| v * v).sum() / n).sqrt())
}

fn gaussian_loss<F: Float>(y: F, mean: F, var: F) -> F {
    let half = F::cast(0.5);
    half * (F::cast(2. * std::f64::consts::PI) * var).ln() + half * (y - mean) * (y - mean) / var
}

/// Mean negative log predictive density of the marginals.
///
/// When `train_y` is given, the loss of the trivial model N(mean(train_y), var(train_y))
/// is subtracted so that values below zero beat it.
pub fn mean_standardized_log_loss<F: Float>(
    pred: &MultivariateNormal<F>,
    test_y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    train_y: Option<&Array1<F>>,
) -> Result<F> {
    check_targets(pred, test_y)?;
    let var = pred.variance();
    if var.iter().any(|v| !(*v > F::zero())) {
        return Err(GpError::NumericalInstability(
            "log loss requires positive predictive variances".to_string(),
        ));
    }
    let trivial = match train_y {
        Some(t) if t.len() > 1 => {
            let mean = t.mean().unwrap_or_else(F::zero);
            Some((mean, t.var(F::one())))
        }
        Some(_) => {
            return Err(GpError::Configuration(
                "at least two training targets are required to standardize the log loss"
                    .to_string(),
            ))
        }
        None => None,
    };
    let mut total = F::zero();
    for ((&y, &m), &v) in test_y.iter().zip(pred.mean().iter()).zip(var.iter()) {
        total += gaussian_loss(y, m, v);
        if let Some((tm, tv)) = trivial {
            total -= gaussian_loss(y, tm, tv);
        }
    }
    Ok(total / F::cast(test_y.len()))
}

/// Predictive coefficient `Q2 = 1 - PRESS / TSS` estimated by k-fold cross validation of
/// models fitted with `params`
pub fn q2_score<F, P, O>(
    params: &P,
    dataset: &Dataset<F, F, Ix1>,
    kfold: usize,
) -> Result<F>
where
    F: Float,
    P: Fit<Array2<F>, Array1<F>, GpError, Object = O> + ParamGuard,
    O: PredictInplace<Array2<F>, Array1<F>>,
{
    let yt = dataset.targets();
    if kfold < 2 || kfold > yt.len() {
        return Err(GpError::Configuration(format!(
            "k-fold should be in [2, {}], got {kfold}",
            yt.len()
        )));
    }
    let yt_mean = yt.mean().unwrap_or_else(F::zero);
    // Predictive Residual Sum of Squares
    let mut press = F::zero();
    // Total Sum of Squares
    let mut tss = F::zero();
    for (train, valid) in dataset.fold(kfold).into_iter() {
        let model: O = params.fit(&train)?;
        let pred = model.predict(valid.records());
        press += (valid.targets() - pred).mapv(|v| v * v).sum();
        tss += (valid.targets() - yt_mean).mapv(|v| v * v).sum();
    }
    Ok(F::one() - press / tss)
}
