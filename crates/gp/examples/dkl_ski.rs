use dkgp_gp::{
    metrics, Activation, ExactGp, FeatureExtractor, GridInterpolationKernel, LinearFeatures,
    PredictiveSettings, RbfKernel, ScaleKernel, ScaleToBounds, Sequential, ZeroMean,
};
use linfa::prelude::*;
use ndarray::{Array, Array1, Array2, Axis};
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;
use std::sync::Arc;

fn target(x: &Array2<f64>) -> Array1<f64> {
    x.map_axis(Axis(1), |r| (3. * r[0]).sin() * (2. * r[1]).cos())
}

fn main() {
    let env = env_logger::Env::new().filter_or("DKGP_LOG", "info");
    env_logger::Builder::from_env(env).init();

    let mut rng = Xoshiro256Plus::seed_from_u64(42);
    let xt = Array::random_using((1000, 2), Uniform::new(-1., 1.), &mut rng);
    let yt = target(&xt);
    let xv = Array::random_using((200, 2), Uniform::new(-1., 1.), &mut rng);
    let yv = target(&xv);

    // 2 -> 2 random tanh layer followed by a rescaling into the grid bounds
    let layer = LinearFeatures::random(2, 2, &mut rng)
        .expect("feature layer")
        .with_activation(Activation::Tanh);
    let hidden = layer.transform(&xt.view()).expect("hidden features");
    let scaler = ScaleToBounds::new(-1., 1.)
        .and_then(|s| s.fitted(&hidden.view()))
        .expect("scaler");
    let features = Sequential::new().then(layer).then(scaler);

    let kernel = ScaleKernel::new(
        GridInterpolationKernel::new(
            RbfKernel::ard(Array1::from_elem(2, 0.5)).expect("base kernel"),
            64,
            &[(-1., 1.), (-1., 1.)],
        )
        .expect("SKI kernel"),
    );
    let gp = ExactGp::params(ZeroMean, kernel)
        .features(Arc::new(features))
        .n_epochs(50)
        .learning_rate(0.05)
        .fit(&Dataset::new(xt, yt))
        .expect("GP fitted");
    println!("{gp}");

    for settings in [PredictiveSettings::default(), PredictiveSettings::fast()] {
        let pred = gp.predict(&xv, settings).expect("prediction");
        println!(
            "fast_pred_var={}: MAE = {:.4}, MSLL = {:.4}",
            settings.fast_pred_var,
            metrics::mean_absolute_error(&pred, &yv).expect("MAE"),
            metrics::mean_standardized_log_loss(&pred, &yv, None).expect("MSLL"),
        );
    }
}
