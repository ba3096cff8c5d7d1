//! End-to-end training scenarios. Full size runs are ignored by default:
//! `cargo test --release -- --ignored` runs them.

use crate::features::ScaleToBounds;
use crate::kernels::{RbfKernel, ScaleKernel};
use crate::likelihood::GaussianLikelihood;
use crate::mean_models::{ConstantMean, ZeroMean};
use crate::metrics::mean_absolute_error;
use crate::mll::{ExactMarginalLogLikelihood, VariationalElbo};
use crate::models::{ApproximateGp, ExactGp, PredictiveSettings, Trainable, VARIATIONAL_GROUP};
use crate::optim::Adam;
use crate::parameters::{Inducings, StrategyKind};
use crate::variational_distributions::{Variational, VariationalKind};
use crate::variational_strategies::{
    OrthogonallyDecoupledStrategy, StandardStrategy, VariationalStrategy,
};
use crate::{minibatches, Kernel, MeanFunction};

use linfa::prelude::{Dataset, Fit};
use ndarray::{array, Array, Array1, Array2, Axis};
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn init_logger() {
    let env = env_logger::Env::new().filter_or("DKGP_LOG", "info");
    let _ = env_logger::Builder::from_env(env).is_test(true).try_init();
}

fn target(x: &Array2<f64>) -> Array1<f64> {
    x.map_axis(Axis(1), |r| {
        let mut v = (2. * std::f64::consts::PI * r[0]).sin();
        if r.len() > 2 {
            v += 0.5 * (3. * r[1]).cos() * r[2];
        }
        v
    })
}

fn noisy_data(n: usize, dim: usize, noise_std: f64, seed: u64) -> (Array2<f64>, Array1<f64>) {
    let mut rng = Xoshiro256Plus::seed_from_u64(seed);
    let x = Array::random_using((n, dim), Uniform::new(0., 1.), &mut rng);
    let noise = Array::random_using(n, Normal::new(0., noise_std).unwrap(), &mut rng);
    let y = target(&x) + noise;
    (x, y)
}

/// Exact model losses over `n_steps` Adam steps
fn exact_training_losses(n: usize, n_steps: usize) -> Vec<f64> {
    let (x, y) = noisy_data(n, 3, 0.05, 0);
    let scaler = ScaleToBounds::new(-1., 1.).unwrap().fitted(&x.view()).unwrap();
    let mut gp = ExactGp::new(
        x,
        y,
        ConstantMean::default(),
        ScaleKernel::new(RbfKernel::ard(array![0.5, 0.5, 0.5]).unwrap()),
        GaussianLikelihood::new(0.25).unwrap(),
    )
    .unwrap()
    .with_features(Arc::new(scaler))
    .unwrap();
    let mut adam = Adam::new(0.05).unwrap();
    let mut losses = Vec::with_capacity(n_steps);
    for _ in 0..n_steps {
        let objective = ExactMarginalLogLikelihood.evaluate(&gp).unwrap();
        adam.zero_gradients();
        adam.accumulate_gradients(&objective.gradients).unwrap();
        adam.step(&mut gp).unwrap();
        losses.push(objective.loss);
    }
    losses
}

fn check_exact_training(n: usize) {
    init_logger();
    let losses = exact_training_losses(n, 60);
    assert!(losses[59] < losses[0], "{losses:?}");
    for w in losses[50..].windows(2) {
        assert!(w[1] <= w[0] + 5e-3, "loss increased {} -> {}", w[0], w[1]);
    }
}

#[test]
fn test_scenario_exact_training_converges() {
    check_exact_training(300);
}

#[test]
#[ignore]
fn test_scenario_exact_training_converges_full() {
    check_exact_training(2000);
}

fn check_variational_kinds(n_train: usize, n_test: usize, n_epochs: usize) {
    init_logger();
    let (xt, yt) = noisy_data(n_train, 1, 0.1, 1);
    let (xv, yv) = noisy_data(n_test, 1, 0.1, 2);
    let z = Array::linspace(0., 1., 30).insert_axis(Axis(1));
    for kind in [
        VariationalKind::Cholesky,
        VariationalKind::MeanField,
        VariationalKind::Delta,
    ] {
        let gp = ApproximateGp::params(
            ZeroMean,
            ScaleKernel::new(RbfKernel::new(0.2).unwrap()),
            Inducings::Located(z.clone()),
        )
        .variational(kind)
        .learn_inducing_locations(false)
        .batch_size(Some(100))
        .n_epochs(n_epochs)
        .learning_rate(0.05)
        .variational_learning_rate(Some(0.1))
        .seed(Some(42))
        .fit(&Dataset::new(xt.clone(), yt.clone()))
        .expect("SVGP fitted");
        let pred = gp.predict(&xv, PredictiveSettings::default()).unwrap();
        let mae = mean_absolute_error(&pred, &yv).unwrap();
        log::info!("{kind} variational distribution: test MAE = {mae}");
        assert!(mae < 0.25, "{kind}: MAE = {mae}");
    }
}

#[test]
fn test_scenario_variational_kinds_fit() {
    check_variational_kinds(300, 100, 40);
}

#[test]
#[ignore]
fn test_scenario_variational_kinds_fit_full() {
    check_variational_kinds(1000, 200, 40);
}

/// Mean time of `n_steps` ELBO steps on minibatches of 100 points
fn time_per_step<M: MeanFunction<f64>, K: Kernel<f64>>(
    gp: &mut ApproximateGp<f64, M, K>,
    x: &Array2<f64>,
    y: &Array1<f64>,
    n_steps: usize,
) -> Duration {
    let elbo = VariationalElbo::new(x.nrows()).unwrap();
    let mut adam = Adam::new(0.05)
        .unwrap()
        .with_group(VARIATIONAL_GROUP, 0.1)
        .unwrap();
    let mut rng = Xoshiro256Plus::seed_from_u64(3);
    let batches = minibatches(x.nrows(), 100, &mut rng);
    let now = Instant::now();
    for indices in batches.iter().cycle().take(n_steps) {
        let xb = x.select(Axis(0), indices);
        let yb = y.select(Axis(0), indices);
        let objective = elbo.evaluate(gp, &xb, &yb).unwrap();
        adam.zero_gradients();
        adam.accumulate_gradients(&objective.gradients).unwrap();
        adam.step(gp).unwrap();
    }
    now.elapsed() / n_steps as u32
}

/// The decoupled model only factorizes the `n_covar` covariance inducing points while the
/// standard one factorizes all `n_train`. Wall clock timings are only compared when
/// `compare_timings` is set since they are unreliable on a loaded machine.
fn check_decoupled_cost(
    n_train: usize,
    n_covar: usize,
    n_epochs: usize,
    compare_timings: bool,
) {
    init_logger();
    let (xt, yt) = noisy_data(n_train, 1, 0.1, 4);
    let (xv, yv) = noisy_data(200, 1, 0.1, 5);
    let kernel = ScaleKernel::new(RbfKernel::new(0.2).unwrap());
    let z_covar = Array::linspace(0., 1., n_covar).insert_axis(Axis(1));

    let standard = StandardStrategy::new(
        xt.clone(),
        Variational::new(VariationalKind::MeanField, n_train),
    )
    .unwrap()
    .with_jitter(1e-3)
    .unwrap();
    let mut standard_gp = ApproximateGp::new(
        ZeroMean,
        kernel.clone(),
        standard,
        GaussianLikelihood::new(0.1).unwrap(),
    )
    .unwrap()
    .learn_inducing_locations(false);

    let covar = StandardStrategy::new(
        z_covar,
        Variational::new(VariationalKind::MeanField, n_covar),
    )
    .unwrap()
    .with_jitter(1e-3)
    .unwrap();
    let decoupled = OrthogonallyDecoupledStrategy::new(
        covar,
        xt.clone(),
        Variational::new(VariationalKind::Delta, n_train),
    )
    .unwrap();
    let mut decoupled_gp = ApproximateGp::new(
        ZeroMean,
        kernel,
        decoupled,
        GaussianLikelihood::new(0.1).unwrap(),
    )
    .unwrap()
    .learn_inducing_locations(false);

    let n_steps = n_epochs * n_train.div_ceil(100);
    let standard_cost = time_per_step(&mut standard_gp, &xt, &yt, n_steps);
    let decoupled_cost = time_per_step(&mut decoupled_gp, &xt, &yt, n_steps);
    let standard_mae = mean_absolute_error(
        &standard_gp.predict(&xv, PredictiveSettings::default()).unwrap(),
        &yv,
    )
    .unwrap();
    let decoupled_mae = mean_absolute_error(
        &decoupled_gp.predict(&xv, PredictiveSettings::default()).unwrap(),
        &yv,
    )
    .unwrap();
    log::info!(
        "standard: {standard_cost:?}/step MAE = {standard_mae}, \
         decoupled: {decoupled_cost:?}/step MAE = {decoupled_mae}"
    );
    assert_eq!(standard_gp.strategy().num_inducing(), n_train);
    assert_eq!(decoupled_gp.strategy().num_inducing(), n_covar);
    assert_eq!(decoupled_gp.strategy().num_inducing_total(), n_covar + n_train);
    assert!(n_covar < n_train);
    if compare_timings {
        assert!(decoupled_cost < standard_cost);
    }
    assert!(decoupled_mae < 2. * standard_mae);
    assert!(standard_gp.generation() > crate::Generation::default());
}

#[test]
fn test_scenario_decoupled_cost() {
    check_decoupled_cost(300, 30, 30, false);
}

#[test]
#[ignore]
fn test_scenario_decoupled_cost_full() {
    check_decoupled_cost(1000, 100, 30, true);
}

#[test]
fn test_decoupled_params_fit() {
    let (xt, yt) = noisy_data(200, 1, 0.1, 6);
    let gp = ApproximateGp::params(
        ZeroMean,
        ScaleKernel::new(RbfKernel::new(0.2).unwrap()),
        Inducings::Randomized(20),
    )
    .strategy(StrategyKind::OrthogonallyDecoupled(Inducings::Randomized(100)))
    .variational(VariationalKind::MeanField)
    .learn_inducing_locations(false)
    .batch_size(Some(50))
    .n_epochs(30)
    .variational_learning_rate(Some(0.1))
    .seed(Some(7))
    .fit(&Dataset::new(xt, yt))
    .expect("decoupled SVGP fitted");
    let (xv, yv) = noisy_data(100, 1, 0.1, 8);
    let pred = gp.predict(&xv, PredictiveSettings::fast()).unwrap();
    assert!(mean_absolute_error(&pred, &yv).unwrap() < 0.3);
}
