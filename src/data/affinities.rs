use num_traits::{Float, FromPrimitive};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::time::Instant;
use tracing::debug;

use crate::data::structures::*;

/////////////
// Globals //
/////////////

/// Floor applied to every raw Gaussian kernel value before normalisation
pub const MIN_POSSIBLE_PROB: f64 = 1e-9;

// probabilities at or below this contribute nothing measurable to the row
// entropy and would blow up ln(p)
const ENTROPY_CUTOFF: f64 = 1e-7;

// the binary search accepts its best effort after this many trials
const MAX_TRIALS: usize = 50;

////////////////
// Calibrator //
////////////////

/// Calibrate one row of conditional probabilities p_{j|i}
///
/// Binary search over the Gaussian precision β drives the row entropy
/// -Σ p ln p to the target ln(perplexity). β starts at 1 with open bounds;
/// it doubles (halves) while the relevant bound is still infinite and
/// bisects otherwise. After `MAX_TRIALS` trials the best effort is accepted;
/// this is the designed convergence policy, not an error.
///
/// ### Params
///
/// * `row` - The kNN entries of point `owner`
/// * `owner` - Index of the point this row belongs to; a neighbour entry
///   pointing back at it gets probability zero
/// * `perplexity` - Target perplexity
/// * `tol` - Entropy convergence tolerance
///
/// ### Returns
///
/// The normalised probabilities, aligned with `row`
fn calibrate_row<T>(row: &[Neighbour<T>], owner: usize, perplexity: T, tol: T) -> Vec<T>
where
    T: Float + FromPrimitive,
{
    let target_entropy = perplexity.ln();
    let min_prob = T::from_f64(MIN_POSSIBLE_PROB).unwrap();
    let cutoff = T::from_f64(ENTROPY_CUTOFF).unwrap();
    let two = T::from_f64(2.0).unwrap();

    let mut beta = T::one();
    let mut beta_min = T::neg_infinity();
    let mut beta_max = T::infinity();
    let mut probs = vec![T::zero(); row.len()];

    for _ in 0..MAX_TRIALS {
        // raw kernel values, clamped away from zero so no row can collapse
        let mut sum_p = T::zero();
        for (k, neighbour) in row.iter().enumerate() {
            let p = if neighbour.index == owner {
                T::zero()
            } else {
                (-neighbour.dist * beta).exp().max(min_prob)
            };
            probs[k] = p;
            sum_p = sum_p + p;
        }

        // the clamp keeps every non-self entry alive, so zero mass means the
        // row only references its owner; such a row stays all zero
        if sum_p == T::zero() {
            return probs;
        }

        // normalise and measure the entropy in one pass
        let mut entropy = T::zero();
        for p in probs.iter_mut() {
            *p = *p / sum_p;
            if *p > cutoff {
                entropy = entropy - *p * p.ln();
            }
        }

        let entropy_diff = entropy - target_entropy;
        if entropy_diff.abs() < tol {
            break;
        }

        if entropy_diff > T::zero() {
            // entropy too high → distribution too flat → narrow the kernel
            beta_min = beta;
            beta = if beta_max.is_infinite() {
                beta * two
            } else {
                (beta + beta_max) / two
            };
        } else {
            // entropy too low → distribution too peaked → widen the kernel
            beta_max = beta;
            beta = if beta_min.is_infinite() {
                beta / two
            } else {
                (beta + beta_min) / two
            };
        }
    }

    probs
}

/// Compute conditional Gaussian affinities from a kNN table
///
/// For each point i the Gaussian bandwidth is calibrated so the conditional
/// distribution p_{j|i} over its neighbours has entropy ln(perplexity).
/// Rows are processed in parallel.
///
/// ### Params
///
/// * `neighbours` - For each point, its kNN entries (index + original-space
///   distance)
/// * `perplexity` - Target perplexity (effective neighbourhood size)
/// * `tol` - Entropy convergence tolerance for the binary search
///
/// ### Returns
///
/// Sparse matrix of the asymmetric conditional probabilities p_{j|i}; empty
/// when the table has no rows or no columns
pub fn perplexity_affinities<T>(
    neighbours: &[Vec<Neighbour<T>>],
    perplexity: T,
    tol: T,
) -> SparseAffinities<T>
where
    T: Float + FromPrimitive + Send + Sync,
{
    let n = neighbours.len();
    if n == 0 || neighbours[0].is_empty() {
        return SparseAffinities::default();
    }

    let start = Instant::now();

    let rows: Vec<Vec<T>> = neighbours
        .par_iter()
        .enumerate()
        .map(|(i, row)| calibrate_row(row, i, perplexity, tol))
        .collect();

    let capacity: usize = rows.iter().map(|r| r.len()).sum();
    let mut row_indices = Vec::with_capacity(capacity);
    let mut col_indices = Vec::with_capacity(capacity);
    let mut values = Vec::with_capacity(capacity);

    for (i, probs) in rows.into_iter().enumerate() {
        for (neighbour, p) in neighbours[i].iter().zip(probs) {
            if neighbour.index != i && p > T::zero() {
                row_indices.push(i);
                col_indices.push(neighbour.index);
                values.push(p);
            }
        }
    }

    debug!(n, elapsed = ?start.elapsed(), "calibrated conditional affinities");

    SparseAffinities {
        row_indices,
        col_indices,
        values,
        n_samples: n,
    }
}

////////////////////
// Symmetrisation //
////////////////////

/// Symmetrise conditional affinities into the joint distribution
///
/// P[i,j] = P[j,i] = (p(j|i) + p(i|j)) / 2N over the union of directed kNN
/// pairs; both directions are stored. The result sums to one over its
/// support and is never renormalised again.
///
/// ### Params
///
/// * `graph` - Directed conditional probabilities from
///   [`perplexity_affinities`]
///
/// ### Returns
///
/// The symmetric joint probability matrix
pub fn symmetrise_affinities<T>(graph: SparseAffinities<T>) -> SparseAffinities<T>
where
    T: Float + FromPrimitive + Send + Sync,
{
    let n = graph.n_samples;
    if graph.is_empty() {
        return graph;
    }

    let normalisation = T::from_usize(2 * n).unwrap();

    // adjacency map for O(1) lookup of the reverse direction
    let mut adj: Vec<FxHashMap<usize, T>> = vec![FxHashMap::default(); n];
    for ((&i, &j), &w) in graph
        .row_indices
        .iter()
        .zip(&graph.col_indices)
        .zip(&graph.values)
    {
        adj[i].insert(j, w);
    }

    // every unordered pair {i, j} present in either direction
    let mut pairs_set: FxHashSet<(usize, usize)> = FxHashSet::default();
    for (&i, &j) in graph.row_indices.iter().zip(&graph.col_indices) {
        pairs_set.insert(if i < j { (i, j) } else { (j, i) });
    }
    let pairs: Vec<(usize, usize)> = pairs_set.into_iter().collect();

    let edges: Vec<[(usize, usize, T); 2]> = pairs
        .par_iter()
        .map(|&(i, j)| {
            let w_ij = adj[i].get(&j).copied().unwrap_or_else(T::zero);
            let w_ji = adj[j].get(&i).copied().unwrap_or_else(T::zero);
            let p_sym = (w_ij + w_ji) / normalisation;
            [(i, j, p_sym), (j, i, p_sym)]
        })
        .collect();

    let mut row_indices = Vec::with_capacity(edges.len() * 2);
    let mut col_indices = Vec::with_capacity(edges.len() * 2);
    let mut values = Vec::with_capacity(edges.len() * 2);

    for pair_edges in edges {
        for (i, j, w) in pair_edges {
            row_indices.push(i);
            col_indices.push(j);
            values.push(w);
        }
    }

    SparseAffinities {
        row_indices,
        col_indices,
        values,
        n_samples: n,
    }
}

///////////
// Tests //
///////////
