//! Matrix free solves against large structured training covariances.
//!
//! A training covariance `K + s I` whose products are cheap (grid interpolated kernels) is
//! never formed. Solves use conjugate gradients, `log det` is estimated by stochastic
//! Lanczos quadrature over Rademacher vectors, and the same vectors give Hutchinson
//! estimates `tr(A) ~ mean(z^T A z)` of the traces needed by the gradients.

use crate::errors::{GpError, Result};
use crate::interpolation::InterpolatedCovariance;
use linfa::Float;
use linfa_linalg::eigh::*;
use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1};
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;
use rayon::prelude::*;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Default training size above which structured covariances are solved iteratively
pub const DEFAULT_MAX_CHOLESKY_SIZE: usize = 800;

/// Settings of the iterative training path of structured kernels
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct IterativeSettings<F: Float> {
    /// Structured training covariances larger than this are never factorized
    pub max_cholesky_size: usize,
    /// Relative residual norm at which conjugate gradients stop
    pub cg_tolerance: F,
    /// Maximum number of conjugate gradient iterations
    pub max_cg_iterations: usize,
    /// Number of random vectors of the log determinant and trace estimates
    pub num_samples: usize,
    /// Lanczos steps of the log determinant quadrature
    pub lanczos_steps: usize,
    /// Rank of the Lanczos root used by fast predictive variances
    pub root_rank: usize,
    /// Seed of the random vectors
    pub seed: u64,
}

impl<F: Float> Default for IterativeSettings<F> {
    fn default() -> Self {
        IterativeSettings {
            max_cholesky_size: DEFAULT_MAX_CHOLESKY_SIZE,
            cg_tolerance: F::cast(1e-6),
            max_cg_iterations: 1000,
            num_samples: 10,
            lanczos_steps: 30,
            root_rank: 100,
            seed: 0,
        }
    }
}

impl<F: Float> IterativeSettings<F> {
    pub(crate) fn check(&self) -> Result<()> {
        if !(self.cg_tolerance > F::zero()) {
            return Err(GpError::Configuration(format!(
                "conjugate gradient tolerance should be positive, got {}",
                self.cg_tolerance
            )));
        }
        for (what, v) in [
            ("conjugate gradient iterations", self.max_cg_iterations),
            ("random vectors", self.num_samples),
            ("Lanczos steps", self.lanczos_steps),
            ("Lanczos root rank", self.root_rank),
        ] {
            if v == 0 {
                return Err(GpError::Configuration(format!(
                    "number of {what} should be positive"
                )));
            }
        }
        Ok(())
    }
}

/// Solves `A x = b` for a symmetric positive definite `A` given by its products
pub fn conjugate_gradient<F: Float>(
    op: impl Fn(&Array1<F>) -> Result<Array1<F>>,
    b: &ArrayBase<impl Data<Elem = F>, Ix1>,
    tolerance: F,
    max_iterations: usize,
) -> Result<Array1<F>> {
    let mut x = Array1::zeros(b.len());
    let b_norm = b.dot(b).sqrt();
    if b_norm == F::zero() {
        return Ok(x);
    }
    let target = tolerance * b_norm;
    let mut r = b.to_owned();
    let mut p = r.clone();
    let mut rs = r.dot(&r);
    for iter in 0..max_iterations {
        let ap = op(&p)?;
        let curvature = p.dot(&ap);
        if !(curvature > F::zero()) {
            return Err(GpError::NumericalInstability(format!(
                "conjugate gradients met a non positive curvature {curvature}"
            )));
        }
        let step = rs / curvature;
        x.scaled_add(step, &p);
        r.scaled_add(-step, &ap);
        let rs_new = r.dot(&r);
        if !rs_new.is_finite() {
            return Err(GpError::NumericalInstability(
                "non finite conjugate gradient residual".to_string(),
            ));
        }
        if rs_new.sqrt() <= target {
            debug!("conjugate gradients converged in {} iterations", iter + 1);
            return Ok(x);
        }
        p = &r + &(p * (rs_new / rs));
        rs = rs_new;
    }
    warn!(
        "conjugate gradients stopped after {max_iterations} iterations, relative residual {}",
        rs.sqrt() / b_norm
    );
    Ok(x)
}

/// Conjugate gradient solves of every column of `b`, in parallel
pub fn solve_columns<F: Float>(
    op: impl Fn(&Array1<F>) -> Result<Array1<F>> + Sync,
    b: &Array2<F>,
    tolerance: F,
    max_iterations: usize,
) -> Result<Array2<F>> {
    let columns = (0..b.ncols())
        .into_par_iter()
        .map(|j| conjugate_gradient(&op, &b.column(j), tolerance, max_iterations))
        .collect::<Result<Vec<_>>>()?;
    let mut res = Array2::zeros(b.dim());
    for (j, col) in columns.iter().enumerate() {
        res.column_mut(j).assign(col);
    }
    Ok(res)
}

/// Lanczos decomposition `Q^T A Q = T` with `T` symmetric tridiagonal
#[derive(Debug)]
pub struct Lanczos<F: Float> {
    /// Orthonormal basis (n, k), first column along the initial vector
    pub basis: Array2<F>,
    /// Diagonal of `T` (k)
    pub diagonal: Array1<F>,
    /// Off diagonal of `T` (k - 1)
    pub off_diagonal: Array1<F>,
}

impl<F: Float> Lanczos<F> {
    /// Dense `T`
    pub fn tridiagonal(&self) -> Array2<F> {
        let mut t = Array2::from_diag(&self.diagonal);
        for (i, &b) in self.off_diagonal.iter().enumerate() {
            t[[i, i + 1]] = b;
            t[[i + 1, i]] = b;
        }
        t
    }
}

/// At most `steps` Lanczos iterations from `init` with full reorthogonalization.
///
/// Stops early when the Krylov space becomes invariant.
pub fn lanczos<F: Float>(
    op: impl Fn(&Array1<F>) -> Result<Array1<F>>,
    init: &ArrayBase<impl Data<Elem = F>, Ix1>,
    steps: usize,
) -> Result<Lanczos<F>> {
    let n = init.len();
    let steps = steps.min(n);
    let norm = init.dot(init).sqrt();
    if !(norm > F::zero()) || steps == 0 {
        return Err(GpError::Configuration(
            "Lanczos iterations need a non zero initial vector".to_string(),
        ));
    }
    let mut basis = vec![init.mapv(|v| v / norm)];
    let mut diagonal = Vec::with_capacity(steps);
    let mut off_diagonal = Vec::with_capacity(steps);
    let breakdown = F::cast(1e-10);
    for k in 0..steps {
        let mut w = op(&basis[k])?;
        let a = basis[k].dot(&w);
        diagonal.push(a);
        for _ in 0..2 {
            for q in basis.iter() {
                let c = q.dot(&w);
                w.scaled_add(-c, q);
            }
        }
        let b = w.dot(&w).sqrt();
        if k + 1 == steps || b <= breakdown * a.abs().max(F::one()) {
            break;
        }
        off_diagonal.push(b);
        basis.push(w.mapv(|v| v / b));
    }
    let mut q = Array2::zeros((n, basis.len()));
    for (j, v) in basis.iter().enumerate() {
        q.column_mut(j).assign(v);
    }
    Ok(Lanczos {
        basis: q,
        diagonal: Array1::from_vec(diagonal),
        off_diagonal: Array1::from_vec(off_diagonal),
    })
}

/// Stochastic Lanczos quadrature estimate of `log det A` averaged over the columns of
/// `samples` (Rademacher vectors)
pub fn logdet_estimate<F: Float>(
    op: impl Fn(&Array1<F>) -> Result<Array1<F>> + Sync,
    samples: &Array2<F>,
    steps: usize,
) -> Result<F> {
    let estimates = (0..samples.ncols())
        .into_par_iter()
        .map(|j| {
            let z = samples.column(j);
            let decomposition = lanczos(&op, &z, steps)?;
            let (eigvals, eigvecs) = decomposition.tridiagonal().eigh_into()?;
            let mut quadrature = F::zero();
            for (i, &theta) in eigvals.iter().enumerate() {
                if !(theta > F::zero()) {
                    return Err(GpError::NumericalInstability(format!(
                        "non positive Ritz value {theta} in log determinant estimate"
                    )));
                }
                quadrature += eigvecs[[0, i]] * eigvecs[[0, i]] * theta.ln();
            }
            Ok(z.dot(&z) * quadrature)
        })
        .collect::<Result<Vec<_>>>()?;
    let total = estimates.iter().fold(F::zero(), |acc, &v| acc + v);
    Ok(total / F::cast(estimates.len()))
}

/// `num` random vectors of size `n` with independent +1 / -1 entries
pub fn rademacher<F: Float>(n: usize, num: usize, seed: u64) -> Array2<F> {
    let mut rng = Xoshiro256Plus::seed_from_u64(seed);
    Array2::random_using((n, num), Uniform::new(0u8, 2), &mut rng)
        .mapv(|b| if b == 0 { -F::one() } else { F::one() })
}

/// `K + shift I` for a grid interpolated `K`
#[derive(Clone, Debug)]
pub struct ShiftedOperator<F: Float> {
    operator: InterpolatedCovariance<F>,
    shift: F,
}

impl<F: Float> ShiftedOperator<F> {
    /// Square operator `operator + shift I`
    pub fn new(operator: InterpolatedCovariance<F>, shift: F) -> Result<Self> {
        let (n1, n2) = operator.dim();
        if n1 != n2 {
            return Err(GpError::dimension_mismatch("square operator", n1, n2));
        }
        Ok(ShiftedOperator { operator, shift })
    }

    /// Size of the operator
    pub fn size(&self) -> usize {
        self.operator.dim().0
    }

    /// Structured part
    pub fn operator(&self) -> &InterpolatedCovariance<F> {
        &self.operator
    }

    /// Diagonal shift
    pub fn shift(&self) -> F {
        self.shift
    }

    /// `(K + shift I) v`
    pub fn apply(&self, v: &Array1<F>) -> Result<Array1<F>> {
        let mut kv = self.operator.matvec(v)?;
        kv.scaled_add(self.shift, v);
        Ok(kv)
    }
}

/// Training covariance handled by conjugate gradients and stochastic estimates
#[derive(Debug)]
pub(crate) struct IterativeFactor<F: Float> {
    pub(crate) operator: ShiftedOperator<F>,
    pub(crate) settings: IterativeSettings<F>,
    /// Estimate of `log det (K + shift I)`
    pub(crate) logdet: F,
    /// Rademacher vectors (n, num_samples)
    pub(crate) samples: Array2<F>,
    /// `(K + shift I)^-1 samples`
    pub(crate) solves: Array2<F>,
}

impl<F: Float> IterativeFactor<F> {
    /// Factor of `operator` and the solve `(K + shift I)^-1 residuals`
    pub(crate) fn new(
        operator: ShiftedOperator<F>,
        residuals: &Array1<F>,
        settings: &IterativeSettings<F>,
    ) -> Result<(Self, Array1<F>)> {
        settings.check()?;
        let n = operator.size();
        if residuals.len() != n {
            return Err(GpError::dimension_mismatch("training residuals", n, residuals.len()));
        }
        let samples = rademacher(n, settings.num_samples, settings.seed);
        let mut rhs = Array2::zeros((n, settings.num_samples + 1));
        rhs.column_mut(0).assign(residuals);
        rhs.slice_mut(ndarray::s![.., 1..]).assign(&samples);
        let apply = |v: &Array1<F>| operator.apply(v);
        let solved = solve_columns(
            apply,
            &rhs,
            settings.cg_tolerance,
            settings.max_cg_iterations,
        )?;
        let logdet = logdet_estimate(apply, &samples, settings.lanczos_steps)?;
        debug!("iterative training factor of size {n}: log det ~ {logdet}");
        let alpha = solved.column(0).to_owned();
        let solves = solved.slice(ndarray::s![.., 1..]).to_owned();
        Ok((
            IterativeFactor {
                operator,
                settings: settings.clone(),
                logdet,
                samples,
                solves,
            },
            alpha,
        ))
    }

    /// `(K + shift I)^-1 b`
    pub(crate) fn solve(&self, b: &Array1<F>) -> Result<Array1<F>> {
        conjugate_gradient(
            |v: &Array1<F>| self.operator.apply(v),
            b,
            self.settings.cg_tolerance,
            self.settings.max_cg_iterations,
        )
    }

    /// Hutchinson estimate of `tr((K + shift I)^-1 A)` for a symmetric `A` given by its
    /// products
    pub(crate) fn trace_solve(&self, op: impl Fn(&Array1<F>) -> Result<Array1<F>>) -> Result<F> {
        let mut total = F::zero();
        for (z, s) in self.samples.columns().into_iter().zip(self.solves.columns()) {
            total += s.dot(&op(&z.to_owned())?);
        }
        Ok(total / F::cast(self.samples.ncols()))
    }

    /// Lanczos root `R` (n, k) with `R R^T ~ (K + shift I)^-1`, started from `init`
    pub(crate) fn inverse_root(&self, init: &Array1<F>, rank: usize) -> Result<Array2<F>> {
        let decomposition = lanczos(|v: &Array1<F>| self.operator.apply(v), init, rank)?;
        let (eigvals, eigvecs) = decomposition.tridiagonal().eigh_into()?;
        if eigvals.iter().any(|v| !(*v > F::zero())) {
            return Err(GpError::NumericalInstability(
                "non positive Ritz value in the predictive variance root".to_string(),
            ));
        }
        let scales = eigvals.mapv(|v| F::one() / v.sqrt());
        Ok(decomposition.basis.dot(&(eigvecs * &scales)))
    }
}
