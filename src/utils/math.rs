use num_traits::{Float, FromPrimitive};

//////////////////////
// Distance kernels //
//////////////////////

/// Squared Euclidean distance between two D-dimensional points
///
/// Monomorphised over the embedding dimension so the compiler can fully
/// unroll the loop in the gradient hot path. Inputs of the wrong length
/// indicate an implementation bug and abort.
///
/// ### Params
///
/// * `a` - First point, length `D`
/// * `b` - Second point, length `D`
///
/// ### Returns
///
/// `Σ_d (a_d - b_d)²`
#[inline(always)]
pub fn dist2<T, const D: usize>(a: &[T], b: &[T]) -> T
where
    T: Float,
{
    assert_eq!(a.len(), D, "dimension mismatch: expected {}, got {}", D, a.len());
    assert_eq!(b.len(), D, "dimension mismatch: expected {}, got {}", D, b.len());

    let mut acc = T::zero();
    for d in 0..D {
        let diff = a[d] - b[d];
        acc = acc + diff * diff;
    }
    acc
}

/////////////////////
// Column helpers //
/////////////////////

/// Per-column means of a flat row-major N×D matrix
///
/// ### Params
///
/// * `y` - Flat row-major matrix; length must be a multiple of `D`
///
/// ### Returns
///
/// The D column means
pub fn column_means<T, const D: usize>(y: &[T]) -> [T; D]
where
    T: Float + FromPrimitive,
{
    assert_eq!(y.len() % D, 0, "flat matrix length {} is not a multiple of {}", y.len(), D);

    let n = y.len() / D;
    let mut means = [T::zero(); D];

    for row in y.chunks_exact(D) {
        for d in 0..D {
            means[d] = means[d] + row[d];
        }
    }

    let n_float = T::from_usize(n.max(1)).unwrap();
    for mean in means.iter_mut() {
        *mean = *mean / n_float;
    }

    means
}

///////////
// Tests //
///////////
