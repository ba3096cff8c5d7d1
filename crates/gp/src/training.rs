//! Fitting of [ExactGp] and [ApproximateGp] models with Adam on their training objective.

use crate::errors::{GpError, Result};
use crate::features::extract;
use crate::kernels::Kernel;
use crate::likelihood::GaussianLikelihood;
use crate::mean_models::MeanFunction;
use crate::mll::{ExactMarginalLogLikelihood, VariationalElbo};
use crate::models::{ApproximateGp, ExactGp, VARIATIONAL_GROUP};
use crate::optim::Adam;
use crate::parameters::{
    ExactGpParams, ExactGpValidParams, Inducings, StrategyKind, SvgpParams, SvgpValidParams,
};
use crate::utils::minibatches;
use crate::variational_distributions::{Variational, VariationalKind};
use crate::variational_strategies::{OrthogonallyDecoupledStrategy, StandardStrategy, Strategy};

use linfa::prelude::{DatasetBase, Fit, Float};
use log::{debug, info};
use ndarray::{Array1, Array2, ArrayBase, ArrayView2, Axis, Data, Ix1, Ix2, Zip};
use ndarray_rand::rand::seq::SliceRandom;
use ndarray_rand::rand::SeedableRng;
use rand_xoshiro::Xoshiro256Plus;
use std::time::Instant;

impl<F: Float, M: MeanFunction<F>, K: Kernel<F>> ExactGp<F, M, K> {
    /// Exact GP parameters builder
    pub fn params(mean: M, kernel: K) -> ExactGpParams<F, M, K> {
        ExactGpParams::new(mean, kernel)
    }
}

impl<F: Float, M: MeanFunction<F>, K: Kernel<F>> ApproximateGp<F, M, K> {
    /// Stochastic variational GP parameters builder
    pub fn params(mean: M, kernel: K, inducings: Inducings<F>) -> SvgpParams<F, M, K> {
        SvgpParams::new(mean, kernel, inducings)
    }
}

fn check_dataset(x_rows: usize, y_len: usize) -> Result<()> {
    if x_rows != y_len {
        return Err(GpError::dimension_mismatch("training targets", x_rows, y_len));
    }
    if x_rows == 0 {
        return Err(GpError::Configuration("empty training dataset".to_string()));
    }
    Ok(())
}

impl<F: Float, M: MeanFunction<F>, K: Kernel<F>, D: Data<Elem = F> + Sync>
    Fit<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>, GpError> for ExactGpValidParams<F, M, K>
{
    type Object = ExactGp<F, M, K>;

    /// Fit GP hyperparameters by maximizing the exact marginal log likelihood
    fn fit(
        &self,
        dataset: &DatasetBase<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>>,
    ) -> Result<Self::Object> {
        let x = dataset.records();
        let y = dataset.targets();
        check_dataset(x.nrows(), y.len())?;

        let mut model = ExactGp::new(
            x.to_owned(),
            y.to_owned(),
            self.mean().clone(),
            self.kernel().clone(),
            GaussianLikelihood::new(self.training().noise_init)?,
        )?
        .with_jitter(self.training().jitter)?
        .with_iterative_settings(self.iterative().clone())?;
        if let Some(features) = self.features() {
            model = model.with_features(features.clone())?;
        }

        let now = Instant::now();
        let mll = ExactMarginalLogLikelihood;
        let mut optimizer = Adam::new(self.training().learning_rate)?;
        let n_epochs = self.training().n_epochs;
        for epoch in 0..n_epochs {
            let objective = mll.evaluate(&model)?;
            optimizer.zero_gradients();
            optimizer.accumulate_gradients(&objective.gradients)?;
            optimizer.step(&mut model)?;
            debug!("Epoch {}/{n_epochs} - loss = {}", epoch + 1, objective.loss);
        }
        info!(
            "Exact GP trained on {} points in {} ms: mll = {}, {model}",
            x.nrows(),
            now.elapsed().as_millis(),
            mll.value(&model)?
        );
        Ok(model)
    }
}

impl<F: Float, M: MeanFunction<F>, K: Kernel<F>, D: Data<Elem = F> + Sync>
    Fit<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>, GpError> for SvgpValidParams<F, M, K>
{
    type Object = ApproximateGp<F, M, K>;

    /// Fit variational and GP parameters by maximizing the ELBO on minibatches
    fn fit(
        &self,
        dataset: &DatasetBase<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>>,
    ) -> Result<Self::Object> {
        let x = dataset.records();
        let y = dataset.targets();
        check_dataset(x.nrows(), y.len())?;
        let n = x.nrows();

        let mut rng = match self.seed() {
            Some(seed) => Xoshiro256Plus::seed_from_u64(*seed),
            None => Xoshiro256Plus::from_entropy(),
        };
        let features = extract(self.features(), &x.view())?;
        let z = match self.inducings() {
            Inducings::Randomized(nz) => make_inducings(*nz, &features.view(), &mut rng),
            Inducings::Located(z) => z.to_owned(),
        };
        let covar = StandardStrategy::new(z.to_owned(), Variational::new(self.variational(), z.nrows()))?
            .whitened(self.whiten())
            .with_jitter(self.training().jitter)?;
        let strategy: Strategy<F> = match self.strategy() {
            StrategyKind::Standard => covar.into(),
            StrategyKind::OrthogonallyDecoupled(mean_inducings) => {
                let zb = match mean_inducings {
                    Inducings::Randomized(nz) => make_inducings(*nz, &features.view(), &mut rng),
                    Inducings::Located(zb) => zb.to_owned(),
                };
                let delta = Variational::new(VariationalKind::Delta, zb.nrows());
                OrthogonallyDecoupledStrategy::new(covar, zb, delta)?.into()
            }
        };

        let mut model = ApproximateGp::new(
            self.mean().clone(),
            self.kernel().clone(),
            strategy,
            GaussianLikelihood::new(self.training().noise_init)?,
        )?
        .learn_inducing_locations(self.learn_inducing_locations());
        if let Some(extractor) = self.features() {
            model = model.with_features(extractor.clone(), x.ncols())?;
        }

        let now = Instant::now();
        let elbo = VariationalElbo::new(n)?.with_beta(self.beta())?;
        let mut optimizer = Adam::new(self.training().learning_rate)?;
        if let Some(lr) = self.variational_learning_rate() {
            optimizer = optimizer.with_group(VARIATIONAL_GROUP, lr)?;
        }
        let batch_size = self.batch_size().unwrap_or(n);
        let n_epochs = self.training().n_epochs;
        for epoch in 0..n_epochs {
            let mut epoch_loss = F::zero();
            for indices in minibatches(n, batch_size, &mut rng) {
                let xb = x.select(Axis(0), &indices);
                let yb = y.select(Axis(0), &indices);
                let objective = elbo.evaluate(&model, &xb, &yb)?;
                optimizer.zero_gradients();
                optimizer.accumulate_gradients(&objective.gradients)?;
                optimizer.step(&mut model)?;
                epoch_loss += objective.loss * F::cast(indices.len());
            }
            debug!(
                "Epoch {}/{n_epochs} - loss = {}",
                epoch + 1,
                epoch_loss / F::cast(n)
            );
        }
        info!(
            "Variational GP trained on {n} points with {} inducing points in {} ms: elbo = {}, {model}",
            model.strategy().num_inducing_total(),
            now.elapsed().as_millis(),
            elbo.value(&model, x, y)?
        );
        Ok(model)
    }
}

/// Random subset of `n_inducing` rows of `xt` (all rows when fewer)
pub(crate) fn make_inducings<F: Float>(
    n_inducing: usize,
    xt: &ArrayView2<F>,
    rng: &mut Xoshiro256Plus,
) -> Array2<F> {
    let mut indices = (0..xt.nrows()).collect::<Vec<_>>();
    indices.shuffle(rng);
    let n = n_inducing.min(xt.nrows());
    let mut z = Array2::zeros((n, xt.ncols()));
    Zip::from(z.rows_mut())
        .and(&Array1::from_vec(indices[..n].to_vec()))
        .for_each(|mut zi, i| zi.assign(&xt.row(*i)));
    z
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::ScaleToBounds;
    use crate::interpolation::GridInterpolationKernel;
    use crate::iterative::IterativeSettings;
    use crate::kernels::{RbfKernel, ScaleKernel};
    use crate::mean_models::{ConstantMean, ZeroMean};
    use crate::models::{PredictiveSettings, Trainable, INDUCING_GROUP};
    use crate::variational_strategies::VariationalStrategy;
    use linfa::prelude::{Dataset, ParamGuard};
    use ndarray::Array;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use std::sync::Arc;

    fn dataset(n: usize, seed: u64) -> Dataset<f64, f64, Ix1> {
        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        let x = Array::random_using((n, 1), Uniform::new(0., 1.), &mut rng);
        let y = x.column(0).mapv(|v| (2. * std::f64::consts::PI * v).sin());
        Dataset::new(x, y)
    }

    #[test]
    fn test_make_inducings() {
        let mut rng = Xoshiro256Plus::seed_from_u64(0);
        let x = Array::linspace(0., 9., 10).insert_axis(Axis(1));
        let z = make_inducings(4, &x.view(), &mut rng);
        assert_eq!(z.dim(), (4, 1));
        assert!(z.iter().all(|v| x.iter().any(|w| w == v)));
        let z = make_inducings(20, &x.view(), &mut rng);
        assert_eq!(z.nrows(), 10);
    }

    #[test]
    fn test_exact_fit_improves_mll() {
        let ds = dataset(40, 1);
        let untrained = ExactGp::new(
            ds.records().to_owned(),
            ds.targets().to_owned(),
            ConstantMean::default(),
            ScaleKernel::new(RbfKernel::new(1.).unwrap()),
            GaussianLikelihood::new(0.1).unwrap(),
        )
        .unwrap();
        let before = ExactMarginalLogLikelihood.value(&untrained).unwrap();
        let gp = ExactGp::params(
            ConstantMean::default(),
            ScaleKernel::new(RbfKernel::new(1.).unwrap()),
        )
        .n_epochs(60)
        .learning_rate(0.1)
        .fit(&ds)
        .expect("GP fitted");
        let after = ExactMarginalLogLikelihood.value(&gp).unwrap();
        assert!(after > before, "mll {before} -> {after}");
        assert!(gp.generation().value() >= 60);
        assert!(gp.likelihood().noise() < 0.1);
    }

    #[test]
    fn test_exact_fit_with_ski_features() {
        let ds = dataset(50, 2);
        let scaler = ScaleToBounds::new(-1., 1.).unwrap().fitted(&ds.records().view()).unwrap();
        let kernel = ScaleKernel::new(
            GridInterpolationKernel::new(RbfKernel::new(0.5).unwrap(), 64, &[(-1., 1.)]).unwrap(),
        );
        let gp = ExactGp::params(ZeroMean, kernel)
            .features(Arc::new(scaler))
            .n_epochs(20)
            .fit(&ds)
            .expect("GP fitted");
        let x = Array::linspace(0.1, 0.9, 9).insert_axis(Axis(1));
        let pred = gp.predict(&x, PredictiveSettings::fast()).unwrap();
        let truth = x.column(0).mapv(|v| (2. * std::f64::consts::PI * v).sin());
        let mae = (pred.mean() - &truth).mapv(f64::abs).mean().unwrap();
        assert!(mae < 0.2, "mae = {mae}");
    }

    #[test]
    fn test_exact_fit_ski_iterative() {
        let ds = dataset(400, 9);
        let kernel = ScaleKernel::new(
            GridInterpolationKernel::new(RbfKernel::new(0.3).unwrap(), 80, &[(0., 1.)]).unwrap(),
        );
        let settings = IterativeSettings {
            max_cholesky_size: 200,
            ..IterativeSettings::default()
        };
        let gp = ExactGp::params(ConstantMean::default(), kernel)
            .iterative(settings)
            .n_epochs(15)
            .fit(&ds)
            .expect("GP fitted");
        assert!(gp.is_iterative().unwrap());
        assert_eq!(gp.iterative_settings().max_cholesky_size, 200);
        let x = Array::linspace(0.1, 0.9, 9).insert_axis(Axis(1));
        let truth = x.column(0).mapv(|v| (2. * std::f64::consts::PI * v).sin());
        for settings in [PredictiveSettings::default(), PredictiveSettings::fast()] {
            let pred = gp.predict(&x, settings).unwrap();
            let mae = (pred.mean() - &truth).mapv(f64::abs).mean().unwrap();
            assert!(mae < 0.1, "mae = {mae}");
            assert!(pred.variance().iter().all(|v| v.is_finite() && *v >= 0.));
        }

        let bad = ExactGp::params(ZeroMean, ScaleKernel::new(RbfKernel::new(0.3).unwrap()))
            .iterative(IterativeSettings {
                num_samples: 0,
                ..IterativeSettings::default()
            });
        assert!(matches!(bad.check_ref(), Err(GpError::Configuration(_))));
    }

    #[test]
    fn test_svgp_fit_minibatch() {
        let ds = dataset(120, 3);
        let params = ApproximateGp::params(
            ZeroMean,
            ScaleKernel::new(RbfKernel::new(0.3).unwrap()),
            Inducings::Randomized(12),
        )
        .batch_size(Some(30))
        .n_epochs(40)
        .learning_rate(0.05)
        .variational_learning_rate(Some(0.1))
        .seed(Some(42));
        let gp = params.clone().fit(&ds).expect("SVGP fitted");
        let x = Array::linspace(0.1, 0.9, 9).insert_axis(Axis(1));
        let truth = x.column(0).mapv(|v| (2. * std::f64::consts::PI * v).sin());
        let mean = gp.predict_mean(&x).unwrap();
        let mae = (&mean - &truth).mapv(f64::abs).mean().unwrap();
        assert!(mae < 0.3, "mae = {mae}");
        assert_eq!(gp.strategy().num_inducing(), 12);

        // same seed, same model
        let again = params.fit(&ds).unwrap();
        assert_eq!(again.parameters(), gp.parameters());
    }

    #[test]
    fn test_svgp_learned_inducing_locations() {
        let ds = dataset(60, 5);
        let (x, y) = (ds.records(), ds.targets());
        let z0 = Array::linspace(0., 0.3, 5).insert_axis(Axis(1));
        let strategy =
            StandardStrategy::new(z0.clone(), Variational::new(VariationalKind::Cholesky, 5))
                .unwrap();
        let mut gp = ApproximateGp::new(
            ZeroMean,
            ScaleKernel::new(RbfKernel::new(0.3).unwrap()),
            strategy,
            GaussianLikelihood::new(0.1).unwrap(),
        )
        .unwrap()
        .learn_inducing_locations(true);
        let elbo = VariationalElbo::new(x.nrows()).unwrap();
        let mut adam = Adam::new(0.05)
            .unwrap()
            .with_group(VARIATIONAL_GROUP, 0.1)
            .unwrap();
        let mut losses = vec![];
        for _ in 0..30 {
            let objective = elbo.evaluate(&gp, x, y).unwrap();
            assert_eq!(objective.gradients.get(INDUCING_GROUP).unwrap().len(), 5);
            adam.zero_gradients();
            adam.accumulate_gradients(&objective.gradients).unwrap();
            adam.step(&mut gp).unwrap();
            losses.push(objective.loss);
        }
        assert!(losses[29] < losses[0], "{losses:?}");
        let z = gp.strategy().inducing_parameters();
        let moved = (&z - &z0.column(0)).mapv(f64::abs).sum();
        assert!(moved > 1e-3, "inducing locations did not move: {z}");

        // the same through the builder
        let fitted = ApproximateGp::params(
            ZeroMean,
            ScaleKernel::new(RbfKernel::new(0.3).unwrap()),
            Inducings::Located(z0),
        )
        .learn_inducing_locations(true)
        .n_epochs(10)
        .seed(Some(1))
        .fit(&ds)
        .expect("SVGP fitted");
        assert!(fitted.parameters().get(INDUCING_GROUP).is_some());
    }

    #[test]
    fn test_svgp_fit_decoupled() {
        let ds = dataset(60, 4);
        let gp = ApproximateGp::params(
            ZeroMean,
            ScaleKernel::new(RbfKernel::new(0.3).unwrap()),
            Inducings::Randomized(6),
        )
        .strategy(StrategyKind::OrthogonallyDecoupled(Inducings::Randomized(20)))
        .n_epochs(10)
        .seed(Some(0))
        .check()
        .unwrap()
        .fit(&ds)
        .expect("decoupled SVGP fitted");
        assert!(matches!(gp.strategy(), Strategy::OrthogonallyDecoupled(_)));
        assert_eq!(gp.strategy().num_inducing_total(), 26);
    }

    #[test]
    fn test_fit_rejects_bad_dataset() {
        let ds = Dataset::new(Array2::<f64>::zeros((0, 1)), Array1::zeros(0));
        let res = ExactGp::params(ZeroMean, RbfKernel::new(1.).unwrap()).fit(&ds);
        assert!(matches!(res, Err(GpError::Configuration(_))));
    }
}
