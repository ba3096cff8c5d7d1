//! This library implements scalable [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process)
//! regression engines: the covariance machinery behind deep kernel learning and
//! inducing point approximations.
//!
//! Two model kinds are available:
//!
//! * [ExactGp] conditions on all training points. Combined with a [GridInterpolationKernel]
//!   the kernel matrix is represented as `W K_grid W^T` (structured kernel interpolation,
//!   KISS-GP) where `W` holds sparse cubic interpolation weights and `K_grid` is a Kronecker
//!   product of Toeplitz matrices multiplied through FFT. Inputs are usually mapped by a
//!   [FeatureExtractor] and rescaled into the grid bounds by [ScaleToBounds].
//! * [ApproximateGp] summarizes the data by a variational distribution q(u) over inducing
//!   values (Cholesky, mean field or delta parameterization) mapped to query points by a
//!   [StandardStrategy] or an [OrthogonallyDecoupledStrategy].
//!
//! Models are trained by maximizing [ExactMarginalLogLikelihood] or [VariationalElbo] with
//! the [Adam] optimizer, either step by step or through the linfa `Fit` implementations of
//! [ExactGpParams] and [SvgpParams]. Every forward evaluation takes an explicit [Mode];
//! factorizations are cached per parameter [Generation] and never reused across updates.
//!
//! ```no_run
//! use dkgp_gp::{ExactGp, ZeroMean, RbfKernel, ScaleKernel, PredictiveSettings};
//! use linfa::prelude::*;
//! use ndarray::{array, Array1};
//!
//! let xt: ndarray::Array2<f64> = array![[0.0], [0.25], [0.5], [0.75], [1.0]];
//! let yt: Array1<f64> = xt.column(0).mapv(|v| (6. * v).sin());
//! let gp = ExactGp::params(ZeroMean, ScaleKernel::new(RbfKernel::new(0.3).unwrap()))
//!     .n_epochs(30)
//!     .fit(&Dataset::new(xt, yt))
//!     .expect("GP fitted");
//! let pred = gp.predict(&array![[0.4]], PredictiveSettings::fast()).expect("prediction");
//! println!("mean = {} var = {}", pred.mean(), pred.variance());
//! ```
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod cache;
mod distributions;
mod errors;
mod features;
mod interpolation;
mod iterative;
pub mod kernels;
mod likelihood;
pub mod mean_models;
pub mod metrics;
mod mll;
mod models;
mod nearest_neighbors;
mod optim;
mod parameters;
#[cfg(test)]
mod scenarios;
mod toeplitz;
mod training;
mod utils;
mod variational_distributions;
mod variational_strategies;

pub use cache::*;
pub use distributions::*;
pub use errors::*;
pub use features::*;
pub use interpolation::*;
pub use iterative::*;
pub use kernels::{Kernel, Matern52Kernel, RbfKernel, ScaleKernel};
pub use likelihood::*;
pub use mean_models::{ConstantMean, LinearMean, MeanFunction, ZeroMean};
pub use mll::*;
pub use models::*;
pub use nearest_neighbors::*;
pub use optim::*;
pub use parameters::*;
pub use toeplitz::*;
pub use utils::{minibatches, DEFAULT_JITTER};
pub use variational_distributions::*;
pub use variational_strategies::*;
