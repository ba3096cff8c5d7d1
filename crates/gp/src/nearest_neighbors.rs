//! Brute-force k-nearest-neighbor search on rows of feature matrices.
//!
//! Neighbors are ordered by increasing squared euclidean distance, ties broken by the
//! smaller index.

use crate::errors::{GpError, Result};
use linfa::Float;
use ndarray::{Array2, ArrayBase, ArrayView1, ArrayView2, Axis, Data, Ix2, Zip};
use std::cmp::Ordering;

/// k-nearest-neighbor index over a reference set of points
#[derive(Clone, Debug)]
pub struct NearestNeighbors<F: Float> {
    k: usize,
    reference: Option<Array2<F>>,
}

fn sq_dist<F: Float>(a: &ArrayView1<F>, b: &ArrayView1<F>) -> F {
    Zip::from(a)
        .and(b)
        .fold(F::zero(), |acc, &u, &v| acc + (u - v) * (u - v))
}

/// Indices of the `k` rows of `points` closest to `query`
fn k_closest<F: Float>(query: &ArrayView1<F>, points: &ArrayView2<F>, k: usize) -> Vec<usize> {
    let mut dists: Vec<(F, usize)> = points
        .axis_iter(Axis(0))
        .enumerate()
        .map(|(j, p)| (sq_dist(query, &p), j))
        .collect();
    let by_distance = |a: &(F, usize), b: &(F, usize)| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(Ordering::Equal)
            .then(a.1.cmp(&b.1))
    };
    if k < dists.len() {
        dists.select_nth_unstable_by(k, by_distance);
        dists.truncate(k);
    }
    dists.sort_by(by_distance);
    dists.into_iter().map(|(_, j)| j).collect()
}

impl<F: Float> NearestNeighbors<F> {
    /// Index returning `k` neighbors by default
    pub fn new(k: usize) -> Result<Self> {
        if k == 0 {
            return Err(GpError::Configuration(
                "number of neighbors should be positive".to_string(),
            ));
        }
        Ok(NearestNeighbors { k, reference: None })
    }

    /// Default number of neighbors
    pub fn k(&self) -> usize {
        self.k
    }

    /// Number of reference points (0 before [NearestNeighbors::set_nn_idx])
    pub fn num_points(&self) -> usize {
        self.reference.as_ref().map_or(0, |r| r.nrows())
    }

    /// Sets (or replaces) the reference points (n, d)
    pub fn set_nn_idx(&mut self, points: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<()> {
        if points.nrows() == 0 {
            return Err(GpError::Configuration(
                "empty nearest neighbor reference set".to_string(),
            ));
        }
        self.reference = Some(points.to_owned());
        Ok(())
    }

    /// Indices (n_query, k) of the `k` (default: the index one) nearest reference points
    /// of each query row
    pub fn find_nn_idx(
        &self,
        queries: &ArrayBase<impl Data<Elem = F>, Ix2>,
        k: Option<usize>,
    ) -> Result<Array2<usize>> {
        let reference = self.reference.as_ref().ok_or_else(|| {
            GpError::Configuration("nearest neighbor reference points are not set".to_string())
        })?;
        let k = k.unwrap_or(self.k);
        if k == 0 || k > reference.nrows() {
            return Err(GpError::Configuration(format!(
                "number of neighbors should be in [1, {}], got {k}",
                reference.nrows()
            )));
        }
        if queries.ncols() != reference.ncols() {
            return Err(GpError::dimension_mismatch(
                "nearest neighbor queries",
                reference.ncols(),
                queries.ncols(),
            ));
        }
        let mut idx = Array2::zeros((queries.nrows(), k));
        Zip::from(idx.rows_mut())
            .and(queries.rows())
            .par_for_each(|mut row, q| {
                for (slot, j) in row.iter_mut().zip(k_closest(&q, &reference.view(), k)) {
                    *slot = j;
                }
            });
        Ok(idx)
    }

    /// For each point `i >= k` of `points`, indices of its `k` nearest points among the
    /// preceding ones `0..i`, as a (n - k, k) matrix
    pub fn build_sequential_nn_idx(
        &self,
        points: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Array2<usize>> {
        let n = points.nrows();
        if self.k >= n {
            return Err(GpError::Configuration(format!(
                "number of neighbors {} should be smaller than the number of points {n}",
                self.k
            )));
        }
        let k = self.k;
        let points = points.view();
        let mut idx = Array2::zeros((n - k, k));
        Zip::indexed(idx.rows_mut()).par_for_each(|r, mut row| {
            let i = r + k;
            let preceding = points.slice(ndarray::s![..i, ..]);
            for (slot, j) in row
                .iter_mut()
                .zip(k_closest(&points.row(i), &preceding, k))
            {
                *slot = j;
            }
        });
        Ok(idx)
    }
}
