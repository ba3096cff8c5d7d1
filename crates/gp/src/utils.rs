use crate::errors::{GpError, Result};
use linfa::Float;
use linfa_linalg::{cholesky::*, triangular::*};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2, Zip};
use ndarray_rand::rand::seq::SliceRandom;
use ndarray_rand::rand::Rng;

/// Default diagonal jitter added before factorizing a covariance matrix
pub const DEFAULT_JITTER: f64 = 1e-6;

/// softplus(x) = log(1 + exp(x)), computed without overflow
pub fn softplus<F: Float>(x: F) -> F {
    if x > F::cast(20.) {
        x
    } else {
        x.exp().ln_1p()
    }
}

/// Inverse of [softplus], defined for y > 0
pub fn inv_softplus<F: Float>(y: F) -> F {
    if y > F::cast(20.) {
        y
    } else {
        y.exp_m1().ln()
    }
}

/// Logistic function, the derivative of [softplus]
pub fn sigmoid<F: Float>(x: F) -> F {
    F::one() / (F::one() + (-x).exp())
}

pub(crate) fn to_f64<F: Float>(v: F) -> f64 {
    v.to_f64().unwrap_or(f64::NAN)
}

/// Computes the differences of the `k`th components between each row of `x`
/// and each row of `y` as a (nrows(x), nrows(y)) matrix
pub fn axis_differences<F: Float>(
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    y: &ArrayBase<impl Data<Elem = F>, Ix2>,
    k: usize,
) -> Array2<F> {
    let mut diff = Array2::zeros((x.nrows(), y.nrows()));
    let xk = x.column(k);
    let yk = y.column(k);
    Zip::from(diff.rows_mut())
        .and(&xk)
        .par_for_each(|mut row, &xi| {
            Zip::from(&mut row).and(&yk).for_each(|d, &yj| *d = xi - yj);
        });
    diff
}

/// Lower Cholesky factor of `a + jitter * I`.
///
/// A failure is reported as [GpError::NumericalInstability] and is never retried.
pub fn jittered_cholesky<F: Float>(
    a: &ArrayBase<impl Data<Elem = F>, Ix2>,
    jitter: F,
    what: &str,
) -> Result<Array2<F>> {
    if a.iter().any(|v| !v.is_finite()) {
        return Err(GpError::NumericalInstability(format!(
            "non finite values in {what} covariance"
        )));
    }
    let mut jittered = a.to_owned();
    jittered.diag_mut().mapv_inplace(|v| v + jitter);
    jittered.cholesky_into().map_err(|e| {
        GpError::NumericalInstability(format!(
            "{what} covariance factorization failed with jitter {}: {e}",
            to_f64(jitter)
        ))
    })
}

/// Solves `L X = B` for lower triangular `L`
pub fn solve_lower<F: Float>(
    l: &Array2<F>,
    b: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<Array2<F>> {
    Ok(l.solve_triangular(b, UPLO::Lower)?)
}

/// Solves `L^T X = B` for lower triangular `L`
pub fn solve_lower_t<F: Float>(
    l: &Array2<F>,
    b: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<Array2<F>> {
    Ok(l.t().solve_triangular(b, UPLO::Upper)?)
}

/// Solves `L L^T x = b` given the lower Cholesky factor `L`
pub fn cholesky_solve_vec<F: Float>(l: &Array2<F>, b: &Array1<F>) -> Result<Array1<F>> {
    let rhs = b.to_owned().insert_axis(ndarray::Axis(1));
    let tmp = solve_lower(l, &rhs)?;
    let sol = solve_lower_t(l, &tmp)?;
    Ok(sol.column(0).to_owned())
}

/// Inverse of `L L^T` given the lower Cholesky factor `L`
pub fn cholesky_inverse<F: Float>(l: &Array2<F>) -> Result<Array2<F>> {
    let l_inv = solve_lower(l, &Array2::eye(l.nrows()))?;
    Ok(l_inv.t().dot(&l_inv))
}

/// log determinant of `L L^T` given the lower Cholesky factor `L`
pub fn cholesky_logdet<F: Float>(l: &Array2<F>) -> F {
    F::cast(2.) * l.diag().mapv(|v| v.ln()).sum()
}

/// Shuffles `0..n_data` and splits the indices in batches of `batch_size`
/// (the last one may be smaller)
pub fn minibatches<R: Rng>(n_data: usize, batch_size: usize, rng: &mut R) -> Vec<Vec<usize>> {
    let mut indices: Vec<usize> = (0..n_data).collect();
    indices.shuffle(rng);
    indices
        .chunks(batch_size.max(1))
        .map(|c| c.to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use ndarray_rand::rand::SeedableRng;
    use rand_xoshiro::Xoshiro256Plus;

    #[test]
    fn test_axis_differences() {
        let x = array![[-0.9486833, 1.], [-0.82219219, 2.]];
        let y = array![[-1.26491106, 0.], [0., 0.], [1.26491106, 3.]];
        assert_abs_diff_eq!(
            &array![
                [0.31622777, -0.9486833, -2.21359436],
                [0.44271887, -0.82219219, -2.08710326]
            ],
            &axis_differences(&x, &y, 0),
            epsilon = 1e-6
        );
        assert_abs_diff_eq!(
            &array![[1., 1., -2.], [2., 2., -1.]],
            &axis_differences(&x, &y, 1),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_softplus_inverse() {
        for v in [-5., -0.3, 0., 1.2, 30.] {
            assert_abs_diff_eq!(v, inv_softplus(softplus(v)), epsilon = 1e-9);
        }
        assert_abs_diff_eq!(softplus(0.), 2f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(sigmoid(0.), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_cholesky_helpers() {
        let a = array![[4., 2., 0.6], [2., 2., 0.4], [0.6, 0.4, 1.]];
        let l = jittered_cholesky(&a, 0., "test").expect("factorization");
        assert_abs_diff_eq!(l.dot(&l.t()), a, epsilon = 1e-12);
        let inv = cholesky_inverse(&l).unwrap();
        assert_abs_diff_eq!(inv.dot(&a), Array2::eye(3), epsilon = 1e-10);
        let b = array![1., -2., 0.5];
        let x = cholesky_solve_vec(&l, &b).unwrap();
        assert_abs_diff_eq!(a.dot(&x), b, epsilon = 1e-10);
        let det: f64 = 4. * (2. * 1. - 0.4 * 0.4) - 2. * (2. * 1. - 0.4 * 0.6)
            + 0.6 * (2. * 0.4 - 2. * 0.6);
        assert_abs_diff_eq!(cholesky_logdet(&l), det.ln(), epsilon = 1e-10);
    }

    #[test]
    fn test_cholesky_failure_is_numerical_instability() {
        let a = array![[1., 2.], [2., 1.]];
        match jittered_cholesky(&a, 1e-6, "indefinite") {
            Err(GpError::NumericalInstability(msg)) => assert!(msg.contains("indefinite")),
            other => panic!("unexpected {other:?}"),
        }
        let a = array![[f64::NAN, 0.], [0., 1.]];
        assert!(matches!(
            jittered_cholesky(&a, 1e-6, "nan"),
            Err(GpError::NumericalInstability(_))
        ));
    }

    #[test]
    fn test_minibatches() {
        let mut rng = Xoshiro256Plus::seed_from_u64(0);
        let batches = minibatches(10, 4, &mut rng);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 2);
        let mut all: Vec<usize> = batches.concat();
        all.sort();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }
}
