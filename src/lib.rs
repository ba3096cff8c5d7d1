//! Scalable Gaussian process inference in Rust.
//!
//! This crate gathers the GP engine of the `dkgp` workspace:
//!
//! * exact GP regression, possibly with structured kernel interpolation (KISS-GP) over a
//!   learned feature space (deep kernel learning),
//! * stochastic variational GPs with Cholesky, mean field or delta variational
//!   distributions and standard or orthogonally decoupled inducing point strategies,
//! * training objectives (exact marginal log likelihood and ELBO), an Adam optimizer
//!   with per-group learning rates and evaluation metrics.
//!
//! See [gp] for the full documentation.
//!
//! ```no_run
//! use dkgp::{ApproximateGp, Inducings, PredictiveSettings, RbfKernel, ScaleKernel, ZeroMean};
//! use linfa::prelude::*;
//! use ndarray::{Array, Axis};
//!
//! let xt = Array::linspace(0f64, 1., 200).insert_axis(Axis(1));
//! let yt = xt.column(0).mapv(|v| (6. * v).sin());
//! let gp = ApproximateGp::params(
//!     ZeroMean,
//!     ScaleKernel::new(RbfKernel::new(0.2).unwrap()),
//!     Inducings::Randomized(20),
//! )
//! .batch_size(Some(50))
//! .fit(&Dataset::new(xt, yt))
//! .expect("SVGP fitted");
//! let pred = gp
//!     .predict(&Array::linspace(0., 1., 5).insert_axis(Axis(1)), PredictiveSettings::default())
//!     .expect("prediction");
//! println!("{}", pred.mean());
//! ```
pub use dkgp_gp as gp;
pub use dkgp_gp::*;
