use dkgp_gp::{
    metrics, ApproximateGp, Inducings, PredictiveSettings, RbfKernel, ScaleKernel, StrategyKind,
    VariationalKind, ZeroMean,
};
use linfa::prelude::*;
use ndarray::{Array, Array1, Array2, Axis};
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;

fn noisy_sine(n: usize, rng: &mut Xoshiro256Plus) -> (Array2<f64>, Array1<f64>) {
    let x = Array::random_using((n, 1), Uniform::new(0., 1.), rng);
    let noise = Array::random_using(n, Normal::new(0., 0.1).unwrap(), rng);
    let y = x.column(0).mapv(|v| (2. * std::f64::consts::PI * v).sin()) + noise;
    (x, y)
}

fn main() {
    let env = env_logger::Env::new().filter_or("DKGP_LOG", "info");
    env_logger::Builder::from_env(env).init();

    let mut rng = Xoshiro256Plus::seed_from_u64(0);
    let (xt, yt) = noisy_sine(1000, &mut rng);
    let (xv, yv) = noisy_sine(200, &mut rng);
    let ds = Dataset::new(xt, yt);
    let z = Array::linspace(0., 1., 30).insert_axis(Axis(1));

    let strategies = [
        ("standard", StrategyKind::Standard),
        (
            "decoupled",
            StrategyKind::OrthogonallyDecoupled(Inducings::Randomized(300)),
        ),
    ];
    for (name, strategy) in strategies {
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
            .strategy(strategy.clone())
            .variational(kind)
            .batch_size(Some(100))
            .n_epochs(40)
            .learning_rate(0.05)
            .variational_learning_rate(Some(0.1))
            .seed(Some(42))
            .fit(&ds)
            .expect("SVGP fitted");
            let pred = gp
                .predict(&xv, PredictiveSettings::default())
                .expect("prediction");
            println!(
                "{name} {kind}: MAE = {:.4}",
                metrics::mean_absolute_error(&pred, &yv).expect("MAE")
            );
        }
    }
}
