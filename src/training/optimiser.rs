use num_traits::{Float, FromPrimitive};
use rayon::prelude::*;

use crate::utils::bh_tree::*;
use crate::utils::math::*;

/////////////
// Globals //
/////////////

/// Barnes-Hut approximation threshold: a cell is summarised once its extent
/// over its distance drops below this
pub const THETA: f64 = 0.8;

/// Iteration at which momentum switches from its initial to its final value
pub const MOMENTUM_SWITCH_ITER: usize = 250;
/// Momentum used while the embedding is still settling
pub const INITIAL_MOMENTUM: f64 = 0.5;
/// Momentum used after the switch
pub const FINAL_MOMENTUM: f64 = 0.8;

/// Number of early iterations with exaggerated attractive forces
pub const EXAGGERATION_ITER: usize = 100;
/// Attractive multiplier during the exaggeration phase
pub const EXAGGERATION_FACTOR: f64 = 4.0;

/// Floor for the adaptive per-coordinate gains
pub const MIN_GAIN: f64 = 0.01;

// below this the normaliser is treated as zero to avoid dividing by noise
const Z_EPS: f64 = 1e-12;

///////////////
// Schedules //
///////////////

/// Momentum coefficient for a given iteration
pub fn momentum_at<T>(iter: usize) -> T
where
    T: Float + FromPrimitive,
{
    if iter < MOMENTUM_SWITCH_ITER {
        T::from_f64(INITIAL_MOMENTUM).unwrap()
    } else {
        T::from_f64(FINAL_MOMENTUM).unwrap()
    }
}

/// Attractive-force multiplier for a given iteration
pub fn exaggeration_at<T>(iter: usize) -> T
where
    T: Float + FromPrimitive,
{
    if iter < EXAGGERATION_ITER {
        T::from_f64(EXAGGERATION_FACTOR).unwrap()
    } else {
        T::one()
    }
}

//////////////
// Gradient //
//////////////

/// Evaluate the full t-SNE gradient for the current embedding
///
/// Attractive forces are summed exactly over the sparse affinity rows;
/// repulsive forces are approximated by walking the space-partitioning tree
/// under the Barnes-Hut criterion. Per-point contributions are computed in
/// parallel; the normaliser Z is reduced sequentially afterwards so the
/// result is deterministic.
///
/// ### Params
///
/// * `y` - Current embedding, flat row-major N×D
/// * `affinities` - Per-row view of the symmetric joint matrix P
/// * `tree` - Annotated tree built from `y`
/// * `theta` - Barnes-Hut threshold; 0 degenerates to the exact O(N²) walk
/// * `exaggeration` - Attractive multiplier for the current iteration
///
/// ### Returns
///
/// A tuple `(grad, z)` where:
/// * `grad` - Gradient, flat row-major N×D, combined as
///   4·(exaggeration·F_attr − F_rep / Z)
/// * `z` - The global normaliser of the unnormalised affinities
pub fn compute_gradient<T, const D: usize>(
    y: &[T],
    affinities: &[Vec<(usize, T)>],
    tree: &SpTree<T, D>,
    theta: T,
    exaggeration: T,
) -> (Vec<T>, T)
where
    T: Float + FromPrimitive + Send + Sync,
{
    let n = y.len() / D;
    let four = T::from_f64(4.0).unwrap();
    let z_eps = T::from_f64(Z_EPS).unwrap();

    let forces: Vec<([T; D], [T; D], T)> = (0..n)
        .into_par_iter()
        .map(|i| {
            let yi = &y[i * D..(i + 1) * D];

            // attractive forces, exact over the kNN support
            let mut attract = [T::zero(); D];
            for &(j, p) in &affinities[i] {
                let yj = &y[j * D..(j + 1) * D];
                let q = T::one() / (T::one() + dist2::<T, D>(yi, yj));
                let force = p * q;
                for d in 0..D {
                    attract[d] = attract[d] + force * (yi[d] - yj[d]);
                }
            }

            // repulsive forces, Barnes-Hut approximated
            let mut repulse = [T::zero(); D];
            let mut z_partial = T::zero();
            tree.visit(|node| {
                let s2 = dist2::<T, D>(yi, &node.y_cell);
                let summarise =
                    node.is_leaf() || (s2 > T::zero() && node.r_cell / s2.sqrt() < theta);

                if summarise {
                    let mass = T::from_u32(node.num_cells).unwrap();
                    let q = T::one() / (T::one() + s2);
                    z_partial = z_partial + mass * q;
                    let w = mass * q * q;
                    for d in 0..D {
                        repulse[d] = repulse[d] + w * (yi[d] - node.y_cell[d]);
                    }
                } else {
                    // the point stored at an opened cell lives in none of its
                    // children, so it enters here as a singleton charge
                    let s2_point = dist2::<T, D>(yi, &node.point);
                    let mass = T::from_u32(node.count).unwrap();
                    let q = T::one() / (T::one() + s2_point);
                    z_partial = z_partial + mass * q;
                    let w = mass * q * q;
                    for d in 0..D {
                        repulse[d] = repulse[d] + w * (yi[d] - node.point[d]);
                    }
                }

                summarise
            });

            (attract, repulse, z_partial)
        })
        .collect();

    let z_total = forces.iter().fold(T::zero(), |acc, f| acc + f.2);
    let z_inv = if z_total > z_eps {
        T::one() / z_total
    } else {
        T::zero()
    };

    let mut grad = vec![T::zero(); n * D];
    for (i, (attract, repulse, _)) in forces.iter().enumerate() {
        for d in 0..D {
            grad[i * D + d] = four * (exaggeration * attract[d] - repulse[d] * z_inv);
        }
    }

    (grad, z_total)
}

////////////
// Update //
////////////

/// Adaptive gain and momentum update for one coordinate
///
/// The gain shrinks while gradient and accumulated step agree in sign and
/// grows otherwise, floored at `MIN_GAIN`.
///
/// ### Params
///
/// * `val` - Coordinate to update
/// * `step` - Accumulated momentum step for this coordinate
/// * `gain` - Adaptive gain for this coordinate
/// * `grad` - Current gradient entry
/// * `lr` - Base learning rate
/// * `momentum` - Momentum coefficient for this iteration
#[inline(always)]
fn update_coordinate<T>(val: &mut T, step: &mut T, gain: &mut T, grad: T, lr: T, momentum: T)
where
    T: Float + FromPrimitive,
{
    if (grad > T::zero()) == (*step > T::zero()) {
        *gain = *gain * T::from_f64(0.8).unwrap();
    } else {
        *gain = *gain + T::from_f64(0.2).unwrap();
    }
    *gain = (*gain).max(T::from_f64(MIN_GAIN).unwrap());

    *step = momentum * *step - lr * *gain * grad;
    *val = *val + *step;
}

/// Apply one gradient-descent update and recentre the embedding
///
/// Every coordinate gets the gain/momentum update, then the column means are
/// subtracted so the embedding keeps a zero mean after every step.
///
/// ### Params
///
/// * `y` - Embedding to update in place, flat row-major N×D
/// * `grad` - Gradient from [`compute_gradient`]
/// * `step` - Momentum memory, updated in place
/// * `gains` - Adaptive gains, updated in place
/// * `lr` - Base learning rate
/// * `momentum` - Momentum coefficient for this iteration
pub fn apply_update<T, const D: usize>(
    y: &mut [T],
    grad: &[T],
    step: &mut [T],
    gains: &mut [T],
    lr: T,
    momentum: T,
) where
    T: Float + FromPrimitive + Send + Sync,
{
    for k in 0..y.len() {
        update_coordinate(&mut y[k], &mut step[k], &mut gains[k], grad[k], lr, momentum);
    }

    let means = column_means::<T, D>(y);
    y.par_chunks_mut(D).for_each(|p| {
        for d in 0..D {
            p[d] = p[d] - means[d];
        }
    });
}

///////////
// Tests //
///////////
