use num_traits::Float;

/////////////////////
// Data structures //
/////////////////////

///////////////
// kNN table //
///////////////

/// One entry of the caller-supplied k-nearest-neighbour table
///
/// ### Fields
///
/// * `index` - Index of the neighbour
/// * `dist` - Distance to the neighbour in the original feature space
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbour<T> {
    pub index: usize,
    pub dist: T,
}

impl<T> Neighbour<T> {
    /// Generate a new neighbour entry
    ///
    /// ### Params
    ///
    /// * `index` - Index of the neighbour
    /// * `dist` - Distance to the neighbour
    ///
    /// ### Returns
    ///
    /// Initialised self
    pub fn new(index: usize, dist: T) -> Self {
        Self { index, dist }
    }
}

////////////////////////
// Sparse affinities //
////////////////////////

/// Sparse affinity matrix in COO (coordinate) format
///
/// Represents the joint probability matrix P: dense N×N in meaning but only
/// the entries on the union of directed kNN pairs are stored.
///
/// ### Fields
///
/// * `row_indices` - Row index of each stored entry
/// * `col_indices` - Column index of each stored entry
/// * `values` - The stored probabilities
/// * `n_samples` - Number of points N
#[derive(Clone, Debug)]
pub struct SparseAffinities<T> {
    pub row_indices: Vec<usize>,
    pub col_indices: Vec<usize>,
    pub values: Vec<T>,
    pub n_samples: usize,
}

impl<T> Default for SparseAffinities<T> {
    fn default() -> Self {
        Self {
            row_indices: Vec::new(),
            col_indices: Vec::new(),
            values: Vec::new(),
            n_samples: 0,
        }
    }
}

impl<T> SparseAffinities<T>
where
    T: Float,
{
    /// Returns the number of stored entries
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Sum of every stored entry
    ///
    /// ### Returns
    ///
    /// The total probability mass over the sparse support
    pub fn total_mass(&self) -> T {
        self.values.iter().fold(T::zero(), |acc, &v| acc + v)
    }

    /// Generate an edge list from the COO triplets
    ///
    /// ### Returns
    ///
    /// A vector of `(row, col, value)` tuples
    pub fn to_edge_list(&self) -> Vec<(usize, usize, T)> {
        self.row_indices
            .iter()
            .zip(&self.col_indices)
            .zip(&self.values)
            .map(|((&r, &c), &v)| (r, c, v))
            .collect()
    }

    /// Convert to a per-row adjacency list
    ///
    /// This is the layout the attractive-force pass iterates over.
    ///
    /// ### Returns
    ///
    /// For each row i, the `(j, P[i,j])` pairs stored in that row
    pub fn to_adjacency(&self) -> Vec<Vec<(usize, T)>> {
        let mut adj: Vec<Vec<(usize, T)>> = vec![Vec::new(); self.n_samples];
        for ((&i, &j), &w) in self
            .row_indices
            .iter()
            .zip(&self.col_indices)
            .zip(&self.values)
        {
            adj[i].push((j, w));
        }
        adj
    }
}

///////////
// Tests //
///////////
