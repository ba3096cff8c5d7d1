use thiserror::Error;

/// A result type for GP inference algorithms
pub type Result<T> = std::result::Result<T, GpError>;

/// An error when building, training or evaluating an [`ExactGp`](crate::ExactGp)
/// or an [`ApproximateGp`](crate::ApproximateGp) model
#[derive(Error, Debug)]
pub enum GpError {
    /// When a covariance factorization fails or produces non finite values
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),
    /// When an input of the structured interpolation layer lies outside the grid
    #[error("Input {value} of dimension {dim} out of grid bounds [{lower}, {upper}]")]
    OutOfBoundsInput {
        /// Offending dimension
        dim: usize,
        /// Offending value
        value: f64,
        /// Grid lower bound in that dimension
        lower: f64,
        /// Grid upper bound in that dimension
        upper: f64,
    },
    /// When inducing points, lengthscales and input features dimensions disagree
    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// What is being checked
        what: String,
        /// Expected dimension
        expected: usize,
        /// Actual dimension
        actual: usize,
    },
    /// When a hyperparameter or a combination of options is invalid
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    /// When linear algebra computation fails
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When an array cannot be reshaped
    #[error(transparent)]
    ShapeError(#[from] ndarray::ShapeError),
    /// When a linfa error occurs
    #[error(transparent)]
    LinfaError(#[from] linfa::error::Error),
    /// When a numerical gradient evaluation fails
    #[error("Finite difference error: {0}")]
    FiniteDifference(#[from] anyhow::Error),
}

impl GpError {
    pub(crate) fn dimension_mismatch(what: &str, expected: usize, actual: usize) -> GpError {
        GpError::DimensionMismatch {
            what: what.to_string(),
            expected,
            actual,
        }
    }
}
