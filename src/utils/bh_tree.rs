use num_traits::{Float, FromPrimitive};

// Beyond this depth neighbouring cell boundaries collapse below f64
// resolution, so further splitting cannot separate points.
const MAX_DEPTH: usize = 64;

////////////
// SpNode //
////////////

/// A node in the flattened space-partitioning tree
///
/// Every node permanently owns the first point that landed in its cell
/// during construction; exact duplicates of that point accumulate in
/// `count` instead of splitting the cell forever.
///
/// ### Fields
///
/// * `point` - The point stored at this node
/// * `count` - Multiplicity of `point` (> 1 only for coincident inserts)
/// * `children` - Arena indices of the child cells; only the first 2^D
///   slots are used. A node with no children is a leaf.
/// * `num_cells` - Number of points in this subtree, own point included
/// * `y_cell` - Centroid of the points in this subtree
/// * `r_cell` - Cell extent along the first axis
/// * `low` - Lower corner of the cell
/// * `high` - Upper corner of the cell
#[derive(Clone, Debug)]
pub struct SpNode<T, const D: usize> {
    pub point: [T; D],
    pub count: u32,
    pub children: [Option<u32>; 8],
    pub num_cells: u32,
    pub y_cell: [T; D],
    pub r_cell: T,
    pub low: [T; D],
    pub high: [T; D],
}

impl<T, const D: usize> SpNode<T, D>
where
    T: Float,
{
    fn leaf(point: [T; D], low: [T; D], high: [T; D]) -> Self {
        Self {
            point,
            count: 1,
            children: [None; 8],
            num_cells: 0,
            y_cell: [T::zero(); D],
            r_cell: high[0] - low[0],
            low,
            high,
        }
    }

    /// Whether this node has no children
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.children.iter().all(|c| c.is_none())
    }
}

////////////
// SpTree //
////////////

/// Space-partitioning tree over the current embedding
///
/// A quadtree for D = 2 and an octree for D = 3, stored as a contiguous
/// arena of nodes addressed by `u32` indices for cache locality. The root
/// covers the tight axis-aligned bounding box of the point set; every
/// internal node splits its cell at the midpoint along each axis into 2^D
/// equal children. Rebuilt from scratch on every optimisation step and
/// immutable after annotation.
///
/// ### Fields
///
/// * `nodes` - The flat arena storing the `SpNode`s
/// * `root` - Index of the root (always 0)
pub struct SpTree<T, const D: usize> {
    pub nodes: Vec<SpNode<T, D>>,
    root: u32,
}

impl<T, const D: usize> SpTree<T, D>
where
    T: Float + FromPrimitive,
{
    /// Number of child slots actually used per node
    pub const N_CHILDREN: usize = 1 << D;

    /// Build and annotate the tree from a flat row-major point set
    ///
    /// Points are inserted in index order; ties on exact midpoint
    /// coordinates go to the upper-half child, so the structure is
    /// deterministic for a given input.
    ///
    /// ### Params
    ///
    /// * `points` - Flat row-major N×D coordinates; must be non-empty and a
    ///   multiple of `D` long
    ///
    /// ### Returns
    ///
    /// The annotated tree
    pub fn new(points: &[T]) -> Self {
        assert!(!points.is_empty(), "tree needs at least one point");
        assert_eq!(
            points.len() % D,
            0,
            "flat point set length {} is not a multiple of {}",
            points.len(),
            D
        );

        let n = points.len() / D;

        // tight bounding box over all points
        let mut low = [T::infinity(); D];
        let mut high = [T::neg_infinity(); D];
        for p in points.chunks_exact(D) {
            for d in 0..D {
                low[d] = low[d].min(p[d]);
                high[d] = high[d].max(p[d]);
            }
        }

        let mut first = [T::zero(); D];
        first.copy_from_slice(&points[..D]);

        let mut tree = Self {
            nodes: Vec::with_capacity(n * 2),
            root: 0,
        };
        tree.nodes.push(SpNode::leaf(first, low, high));

        for i in 1..n {
            let mut p = [T::zero(); D];
            p.copy_from_slice(&points[i * D..(i + 1) * D]);
            tree.insert(p);
        }

        tree.annotate(tree.root);
        tree
    }

    /// The root node
    pub fn root(&self) -> &SpNode<T, D> {
        &self.nodes[self.root as usize]
    }

    /// Index of the child cell of `node` that contains `p`
    ///
    /// Bit d of the index is set when `p[d]` lies in the upper half along
    /// axis d; a coordinate exactly on the midpoint counts as upper half.
    fn child_index(node: &SpNode<T, D>, p: &[T; D]) -> usize {
        let half = T::from_f64(0.5).unwrap();
        let mut idx = 0;
        for d in 0..D {
            let mid = (node.low[d] + node.high[d]) * half;
            if p[d] >= mid {
                idx |= 1 << d;
            }
        }
        idx
    }

    /// Bounds of child cell `child` of `node` under midpoint splitting
    fn child_box(node: &SpNode<T, D>, child: usize) -> ([T; D], [T; D]) {
        let half = T::from_f64(0.5).unwrap();
        let mut low = node.low;
        let mut high = node.high;
        for d in 0..D {
            let mid = (low[d] + high[d]) * half;
            if child & (1 << d) != 0 {
                low[d] = mid;
            } else {
                high[d] = mid;
            }
        }
        (low, high)
    }

    fn insert(&mut self, p: [T; D]) {
        let mut idx = self.root as usize;

        for _ in 0..MAX_DEPTH {
            let node = &self.nodes[idx];

            // exact duplicates pile up on one node instead of subdividing
            if node.is_leaf() && node.point == p {
                self.nodes[idx].count += 1;
                return;
            }

            let child = Self::child_index(node, &p);
            match node.children[child] {
                Some(next) => idx = next as usize,
                None => {
                    let (low, high) = Self::child_box(node, child);
                    let leaf_idx = self.nodes.len() as u32;
                    self.nodes.push(SpNode::leaf(p, low, high));
                    self.nodes[idx].children[child] = Some(leaf_idx);
                    return;
                }
            }
        }

        // cell collapsed below float resolution: fold into the current node
        self.nodes[idx].count += 1;
    }

    /// Bottom-up annotation of subtree counts and centroids
    ///
    /// `num_cells` counts the node's own point(s) plus everything below it;
    /// `y_cell` is the matching count-weighted centroid. Null child slots
    /// are skipped.
    fn annotate(&mut self, idx: u32) -> (u32, [T; D]) {
        let children = self.nodes[idx as usize].children;
        let point = self.nodes[idx as usize].point;
        let own = self.nodes[idx as usize].count;

        let own_float = T::from_u32(own).unwrap();
        let mut num = own;
        let mut acc = [T::zero(); D];
        for d in 0..D {
            acc[d] = point[d] * own_float;
        }

        for child in children.iter().take(Self::N_CHILDREN).flatten() {
            let (child_num, child_cell) = self.annotate(*child);
            let child_float = T::from_u32(child_num).unwrap();
            num += child_num;
            for d in 0..D {
                acc[d] = acc[d] + child_cell[d] * child_float;
            }
        }

        let num_float = T::from_u32(num).unwrap();
        for a in acc.iter_mut() {
            *a = *a / num_float;
        }

        let node = &mut self.nodes[idx as usize];
        node.num_cells = num;
        node.y_cell = acc;
        (num, acc)
    }

    /// Depth-first traversal with a pruning predicate
    ///
    /// `accept` inspects a node; returning `true` summarises the subtree and
    /// stops the descent there, returning `false` opens the node and visits
    /// its children. An iterative stack keeps worst-case memory bounded.
    ///
    /// ### Params
    ///
    /// * `accept` - The pruning predicate
    pub fn visit<F>(&self, mut accept: F)
    where
        F: FnMut(&SpNode<T, D>) -> bool,
    {
        let mut stack: Vec<u32> = Vec::with_capacity(64);
        stack.push(self.root);

        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx as usize];
            if accept(node) {
                continue;
            }
            for child in node.children.iter().take(Self::N_CHILDREN).flatten() {
                stack.push(*child);
            }
        }
    }
}

///////////
// Tests //
///////////
