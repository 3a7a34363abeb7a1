#![allow(clippy::needless_range_loop)]

//! Barnes-Hut accelerated t-SNE over a precomputed k-nearest-neighbour graph.
//!
//! The caller supplies the kNN table; the engine calibrates the joint
//! probability matrix to a target perplexity, draws a random initial
//! embedding and then iterates gradient-descent steps, each of which rebuilds
//! a space-partitioning tree to approximate the repulsive forces in
//! O(N log N).

pub mod data;
pub mod training;
pub mod utils;

use num_traits::{Float, FromPrimitive, ToPrimitive};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::Instant;
use thiserror::Error;
use thousands::*;
use tracing::debug;

use crate::data::affinities::*;
use crate::data::structures::*;
use crate::training::optimiser::*;
use crate::utils::bh_tree::SpTree;
use crate::utils::random::PolarGaussian;

/////////////
// Globals //
/////////////

// standard deviation of the random initial embedding
const INIT_STD: f64 = 1e-4;

////////////
// Errors //
////////////

/// Fatal conditions surfaced by the engine
///
/// Every variant is an unrecoverable caller or configuration error; the
/// perplexity search terminating without convergence is a designed policy
/// and never reported here.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TsneError {
    /// The configuration asked for an embedding dimension other than 2 or 3
    #[error("unsupported embedding dimension {0}: must be 2 or 3")]
    UnsupportedDimension(usize),

    /// `step` was called before `init_data_dist`
    #[error("step called before init_data_dist")]
    Uninitialized,

    /// The neighbour table has no rows or no columns
    #[error("neighbour table has no entries")]
    EmptyNeighbours,

    /// A neighbour row disagrees with the uniform K of the first row
    #[error("neighbour row {row} has {got} entries, expected {expected}")]
    RaggedNeighbours {
        row: usize,
        got: usize,
        expected: usize,
    },

    /// A neighbour entry points outside the point set
    #[error("neighbour index {index} in row {row} is outside 0..{n}")]
    NeighbourIndexOutOfRange { row: usize, index: usize, n: usize },

    /// A warm-start solution has the wrong length
    #[error("solution has {got} values, expected {expected}")]
    SolutionLengthMismatch { got: usize, expected: usize },
}

////////////
// Params //
////////////

/// Engine configuration
///
/// ### Fields
///
/// * `dim` - Embedding dimensionality, 2 or 3
/// * `perplexity` - Target perplexity of the conditional distributions; the
///   caller is responsible for keeping it at or below K
/// * `epsilon` - Base learning rate
/// * `tol` - Entropy convergence tolerance of the perplexity search
/// * `seed` - Optional RNG seed for reproducible runs
#[derive(Clone, Debug)]
pub struct TsneParams<T> {
    pub dim: usize,
    pub perplexity: T,
    pub epsilon: T,
    pub tol: T,
    pub seed: Option<u64>,
}

impl<T> TsneParams<T>
where
    T: Float + FromPrimitive,
{
    /// Generate new engine parameters
    ///
    /// ### Params
    ///
    /// * `dim` - Embedding dimensionality, 2 or 3
    /// * `perplexity` - Target perplexity. Default `30`.
    /// * `epsilon` - Base learning rate. Default `10`.
    /// * `tol` - Perplexity-search tolerance. Default `1e-4`.
    /// * `seed` - Optional seed; `None` seeds from the operating system.
    ///
    /// ### Returns
    ///
    /// Initialised self
    pub fn new(
        dim: usize,
        perplexity: Option<T>,
        epsilon: Option<T>,
        tol: Option<T>,
        seed: Option<u64>,
    ) -> Self {
        let perplexity = perplexity.unwrap_or_else(|| T::from_f64(30.0).unwrap());
        let epsilon = epsilon.unwrap_or_else(|| T::from_f64(10.0).unwrap());
        let tol = tol.unwrap_or_else(|| T::from_f64(1e-4).unwrap());

        Self {
            dim,
            perplexity,
            epsilon,
            tol,
            seed,
        }
    }
}

impl<T> Default for TsneParams<T>
where
    T: Float + FromPrimitive,
{
    fn default() -> Self {
        Self::new(2, None, None, None, None)
    }
}

////////////
// Engine //
////////////

/// Barnes-Hut t-SNE engine
///
/// Owns the joint probability matrix, the solution and the optimiser state.
/// Single-threaded and cooperative at the contract level: a `step` runs to
/// completion before any other method may be called, and the solution borrow
/// handed out by [`solution`](Self::solution) is valid until the next step.
/// Per-point gradient work inside a step is parallelised internally with a
/// deterministic reduction.
pub struct TsneEngine<T, R = StdRng> {
    dim: usize,
    perplexity: T,
    epsilon: T,
    tol: T,
    rng: R,
    gauss: PolarGaussian<T>,
    n: usize,
    affinities: Vec<Vec<(usize, T)>>,
    y: Vec<T>,
    gains: Vec<T>,
    step_memory: Vec<T>,
    iter: usize,
}

impl<T> TsneEngine<T, StdRng>
where
    T: Float + FromPrimitive + ToPrimitive + Send + Sync,
{
    /// Generate a new engine with the default uniform source
    ///
    /// Uses a [`StdRng`] seeded from `params.seed`, or from the operating
    /// system when no seed is given.
    ///
    /// ### Params
    ///
    /// * `params` - Engine configuration
    ///
    /// ### Returns
    ///
    /// The engine, or `UnsupportedDimension` for a dimension outside {2, 3}
    pub fn new(params: &TsneParams<T>) -> Result<Self, TsneError> {
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self::with_rng(params, rng)
    }
}

impl<T, R> TsneEngine<T, R>
where
    T: Float + FromPrimitive + ToPrimitive + Send + Sync,
    R: Rng,
{
    /// Generate a new engine around a caller-provided uniform source
    ///
    /// The Gaussian sampler state lives next to the source inside the
    /// engine, so two engines never share draws.
    ///
    /// ### Params
    ///
    /// * `params` - Engine configuration
    /// * `rng` - Uniform-in-[0,1) source
    ///
    /// ### Returns
    ///
    /// The engine, or `UnsupportedDimension` for a dimension outside {2, 3}
    pub fn with_rng(params: &TsneParams<T>, rng: R) -> Result<Self, TsneError> {
        if params.dim != 2 && params.dim != 3 {
            return Err(TsneError::UnsupportedDimension(params.dim));
        }

        Ok(Self {
            dim: params.dim,
            perplexity: params.perplexity,
            epsilon: params.epsilon,
            tol: params.tol,
            rng,
            gauss: PolarGaussian::new(),
            n: 0,
            affinities: Vec::new(),
            y: Vec::new(),
            gains: Vec::new(),
            step_memory: Vec::new(),
            iter: 0,
        })
    }

    fn validate_neighbours(neighbours: &[Vec<Neighbour<T>>]) -> Result<(), TsneError> {
        if neighbours.is_empty() || neighbours[0].is_empty() {
            return Err(TsneError::EmptyNeighbours);
        }

        let n = neighbours.len();
        let k = neighbours[0].len();

        for (row, entries) in neighbours.iter().enumerate() {
            if entries.len() != k {
                return Err(TsneError::RaggedNeighbours {
                    row,
                    got: entries.len(),
                    expected: k,
                });
            }
            for neighbour in entries {
                if neighbour.index >= n {
                    return Err(TsneError::NeighbourIndexOutOfRange {
                        row,
                        index: neighbour.index,
                        n,
                    });
                }
            }
        }

        Ok(())
    }

    /// Supply the kNN graph and build the joint probability matrix
    ///
    /// Calibrates the conditional distributions to the target perplexity,
    /// symmetrises them into the joint matrix P and draws a fresh random
    /// solution.
    ///
    /// ### Params
    ///
    /// * `neighbours` - For each point, its kNN entries; K must be uniform
    ///   across rows and every index must lie in [0, N)
    ///
    /// ### Returns
    ///
    /// `()`, or the validation error for an empty, ragged or out-of-range
    /// table
    pub fn init_data_dist(&mut self, neighbours: &[Vec<Neighbour<T>>]) -> Result<(), TsneError> {
        Self::validate_neighbours(neighbours)?;

        let start = Instant::now();
        let directed = perplexity_affinities(neighbours, self.perplexity, self.tol);
        let joint = symmetrise_affinities(directed);

        self.n = neighbours.len();
        self.affinities = joint.to_adjacency();

        debug!(
            n = self.n,
            edges = joint.len(),
            elapsed = ?start.elapsed(),
            "built joint distribution"
        );

        self.init_solution();
        Ok(())
    }

    /// Re-draw the solution and reset the optimiser state
    ///
    /// The embedding is sampled from N(0, 1e-4²), gains go back to 1, the
    /// momentum memory to 0 and the iteration counter to 0.
    pub fn init_solution(&mut self) {
        let size = self.n * self.dim;
        let std = T::from_f64(INIT_STD).unwrap();

        let mut y = Vec::with_capacity(size);
        for _ in 0..size {
            y.push(self.gauss.randn(&mut self.rng, T::zero(), std));
        }

        self.y = y;
        self.gains = vec![T::one(); size];
        self.step_memory = vec![T::zero(); size];
        self.iter = 0;
    }

    /// Run one optimisation step
    ///
    /// Builds a fresh tree from the current embedding, evaluates the
    /// gradient, applies the adaptive update and recentres the embedding.
    /// The solution and the iteration counter are updated together at the
    /// end of the step.
    ///
    /// ### Returns
    ///
    /// `()`, or `Uninitialized` when no data distribution has been supplied
    pub fn step(&mut self) -> Result<(), TsneError> {
        self.step_with_z().map(|_| ())
    }

    fn step_with_z(&mut self) -> Result<T, TsneError> {
        if self.n == 0 {
            return Err(TsneError::Uninitialized);
        }

        let z = match self.dim {
            2 => self.step_inner::<2>(),
            3 => self.step_inner::<3>(),
            _ => unreachable!("dimension is validated at construction"),
        };

        Ok(z)
    }

    fn step_inner<const D: usize>(&mut self) -> T {
        let theta = T::from_f64(THETA).unwrap();
        let exaggeration = exaggeration_at::<T>(self.iter);
        let momentum = momentum_at::<T>(self.iter);

        let tree = SpTree::<T, D>::new(&self.y);
        let (grad, z) =
            compute_gradient::<T, D>(&self.y, &self.affinities, &tree, theta, exaggeration);

        apply_update::<T, D>(
            &mut self.y,
            &grad,
            &mut self.step_memory,
            &mut self.gains,
            self.epsilon,
            momentum,
        );

        self.iter += 1;
        z
    }

    /// Run a batch of optimisation steps
    ///
    /// ### Params
    ///
    /// * `n_steps` - Number of steps to run
    /// * `verbose` - Print progress and the normaliser Z every 50 steps
    ///
    /// ### Returns
    ///
    /// `()`, or `Uninitialized` when no data distribution has been supplied
    pub fn optimise(&mut self, n_steps: usize, verbose: bool) -> Result<(), TsneError> {
        for step in 0..n_steps {
            let z = self.step_with_z()?;

            if verbose && (step % 50 == 0 || step + 1 == n_steps) {
                println!(
                    "Completed step {} out of {} | Z = {}",
                    step,
                    n_steps,
                    z.to_f32().unwrap().separate_with_underscores()
                );
            }
        }
        Ok(())
    }

    /// The current solution as a flat row-major N×D vector
    ///
    /// The borrow is valid until the next `step`; treat it as read-only.
    pub fn solution(&self) -> &[T] {
        &self.y
    }

    /// Warm-start the solution from caller-provided coordinates
    ///
    /// Optimiser state (gains, momentum, iteration counter) is left
    /// untouched.
    ///
    /// ### Params
    ///
    /// * `y` - Flat row-major N×D coordinates
    ///
    /// ### Returns
    ///
    /// `()`, or `SolutionLengthMismatch`
    pub fn set_solution(&mut self, y: &[T]) -> Result<(), TsneError> {
        if y.len() != self.n * self.dim {
            return Err(TsneError::SolutionLengthMismatch {
                got: y.len(),
                expected: self.n * self.dim,
            });
        }
        self.y = y.to_vec();
        Ok(())
    }

    /// Number of embedded points
    pub fn len(&self) -> usize {
        self.n
    }

    /// Whether the engine holds no points yet
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Embedding dimensionality
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Completed optimisation steps
    pub fn iteration(&self) -> usize {
        self.iter
    }

    /// Per-row view of the symmetric joint matrix P
    pub fn affinities(&self) -> &[Vec<(usize, T)>] {
        &self.affinities
    }

    /// Current adaptive gains, flat row-major N×D
    pub fn gains(&self) -> &[T] {
        &self.gains
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod engine_tests {
    use super::*;
    use crate::utils::math::column_means;
    use approx::assert_relative_eq;

    /// Helper: ring kNN table with unit-ish distances
    fn ring_neighbours(n: usize, k: usize) -> Vec<Vec<Neighbour<f64>>> {
        (0..n)
            .map(|i| {
                (1..=k)
                    .map(|offset| Neighbour::new((i + offset) % n, offset as f64))
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_construction_rejects_bad_dimensions() {
        for dim in [0, 1, 4, 7] {
            let params = TsneParams::<f64>::new(dim, None, None, None, Some(1));
            assert_eq!(
                TsneEngine::new(&params).err(),
                Some(TsneError::UnsupportedDimension(dim))
            );
        }
    }

    #[test]
    fn test_step_before_init_fails() {
        let params = TsneParams::<f64>::new(2, None, None, None, Some(1));
        let mut engine = TsneEngine::new(&params).unwrap();
        assert_eq!(engine.step().err(), Some(TsneError::Uninitialized));
    }

    #[test]
    fn test_invalid_neighbour_tables_are_rejected() {
        let params = TsneParams::<f64>::new(2, Some(2.0), None, None, Some(1));
        let mut engine = TsneEngine::new(&params).unwrap();

        let empty: Vec<Vec<Neighbour<f64>>> = vec![];
        assert_eq!(
            engine.init_data_dist(&empty).err(),
            Some(TsneError::EmptyNeighbours)
        );

        let no_columns: Vec<Vec<Neighbour<f64>>> = vec![vec![]; 4];
        assert_eq!(
            engine.init_data_dist(&no_columns).err(),
            Some(TsneError::EmptyNeighbours)
        );

        let mut ragged = ring_neighbours(4, 2);
        ragged[2].pop();
        assert_eq!(
            engine.init_data_dist(&ragged).err(),
            Some(TsneError::RaggedNeighbours {
                row: 2,
                got: 1,
                expected: 2
            })
        );

        let mut out_of_range = ring_neighbours(4, 2);
        out_of_range[1][0].index = 4;
        assert_eq!(
            engine.init_data_dist(&out_of_range).err(),
            Some(TsneError::NeighbourIndexOutOfRange {
                row: 1,
                index: 4,
                n: 4
            })
        );
    }

    #[test]
    fn test_joint_matrix_is_symmetric_with_unit_mass() {
        let params = TsneParams::<f64>::new(2, Some(3.0), None, None, Some(42));
        let mut engine = TsneEngine::new(&params).unwrap();
        engine.init_data_dist(&ring_neighbours(10, 4)).unwrap();

        let adj = engine.affinities();

        let mut total = 0.0;
        for (i, row) in adj.iter().enumerate() {
            for &(j, w) in row {
                total += w;
                let mirrored = adj[j]
                    .iter()
                    .find(|&&(col, _)| col == i)
                    .map(|&(_, w_ji)| w_ji);
                assert_eq!(mirrored, Some(w), "P[{},{}] has no equal mirror", i, j);
            }
        }
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_iteration_counter_increases_by_one_per_step() {
        let params = TsneParams::<f64>::new(2, Some(2.0), None, None, Some(7));
        let mut engine = TsneEngine::new(&params).unwrap();
        engine.init_data_dist(&ring_neighbours(8, 3)).unwrap();

        assert_eq!(engine.iteration(), 0);
        for expected in 1..=20 {
            engine.step().unwrap();
            assert_eq!(engine.iteration(), expected);
        }
    }

    #[test]
    fn test_solution_is_zero_mean_after_every_step() {
        let params = TsneParams::<f64>::new(3, Some(2.0), None, None, Some(3));
        let mut engine = TsneEngine::new(&params).unwrap();
        engine.init_data_dist(&ring_neighbours(12, 3)).unwrap();

        for _ in 0..30 {
            engine.step().unwrap();
            let means = column_means::<f64, 3>(engine.solution());
            for d in 0..3 {
                assert_relative_eq!(means[d], 0.0, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_gains_stay_above_floor() {
        let params = TsneParams::<f64>::new(2, Some(2.0), None, None, Some(13));
        let mut engine = TsneEngine::new(&params).unwrap();
        engine.init_data_dist(&ring_neighbours(10, 3)).unwrap();

        for _ in 0..120 {
            engine.step().unwrap();
            for &g in engine.gains() {
                assert!(g >= MIN_GAIN, "gain {} below floor", g);
            }
        }
    }

    #[test]
    fn test_single_point_step_is_a_no_op() {
        let params = TsneParams::<f64>::new(2, Some(2.0), None, None, Some(5));
        let mut engine = TsneEngine::new(&params).unwrap();

        // the only possible neighbour of a lone point is itself
        let neighbours = vec![vec![Neighbour::new(0, 0.0)]];
        engine.init_data_dist(&neighbours).unwrap();

        engine.step().unwrap();

        // zero gradient, so only the recentring acts: the point sits at the
        // origin and stays there
        assert_relative_eq!(engine.solution()[0], 0.0);
        assert_relative_eq!(engine.solution()[1], 0.0);
        engine.step().unwrap();
        assert_relative_eq!(engine.solution()[0], 0.0);
        assert_relative_eq!(engine.solution()[1], 0.0);
    }

    #[test]
    fn test_two_points_stay_mirrored() {
        let params = TsneParams::<f64>::new(2, Some(1.5), None, None, Some(21));
        let mut engine = TsneEngine::new(&params).unwrap();

        let neighbours = vec![
            vec![Neighbour::new(1, 1.0)],
            vec![Neighbour::new(0, 1.0)],
        ];
        engine.init_data_dist(&neighbours).unwrap();

        engine.step().unwrap();

        // recentring makes the pair exactly symmetric about the origin
        let y = engine.solution();
        assert_relative_eq!(y[0], -y[2], epsilon = 1e-12);
        assert_relative_eq!(y[1], -y[3], epsilon = 1e-12);
    }

    #[test]
    fn test_coincident_input_points_stay_finite() {
        let params = TsneParams::<f64>::new(2, Some(2.0), None, None, Some(17));
        let mut engine = TsneEngine::new(&params).unwrap();

        // every pairwise original-space distance is zero
        let n = 6;
        let neighbours: Vec<Vec<Neighbour<f64>>> = (0..n)
            .map(|i| {
                (0..n)
                    .filter(|&j| j != i)
                    .map(|j| Neighbour::new(j, 0.0))
                    .collect()
            })
            .collect();
        engine.init_data_dist(&neighbours).unwrap();

        // uniform rows: every conditional probability is 1/(n-1)
        for row in engine.affinities() {
            for &(_, w) in row {
                assert_relative_eq!(w, 1.0 / (n as f64 * (n as f64 - 1.0)), epsilon = 1e-9);
            }
        }

        for _ in 0..50 {
            engine.step().unwrap();
        }
        assert!(engine.solution().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_set_solution_validates_length() {
        let params = TsneParams::<f64>::new(2, Some(2.0), None, None, Some(2));
        let mut engine = TsneEngine::new(&params).unwrap();
        engine.init_data_dist(&ring_neighbours(4, 2)).unwrap();

        assert_eq!(
            engine.set_solution(&[0.0; 5]).err(),
            Some(TsneError::SolutionLengthMismatch {
                got: 5,
                expected: 8
            })
        );
        assert!(engine.set_solution(&[0.1; 8]).is_ok());
        assert_relative_eq!(engine.solution()[0], 0.1);
    }
}
