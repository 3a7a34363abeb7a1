use bh_tsne_rs::data::structures::Neighbour;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

/// Create flat row-major Gaussian cluster data around the given centres
///
/// Returns the data and the cluster label of each point.
pub fn create_cluster_data(
    n_per_cluster: usize,
    n_dim: usize,
    centres: &[Vec<f64>],
    std: f64,
    seed: u64,
) -> (Vec<f64>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = StandardNormal;

    let n_total = n_per_cluster * centres.len();
    let mut data = Vec::with_capacity(n_total * n_dim);
    let mut labels = Vec::with_capacity(n_total);

    for (cluster_id, centre) in centres.iter().enumerate() {
        for _ in 0..n_per_cluster {
            for d in 0..n_dim {
                let noise: f64 = normal.sample(&mut rng);
                data.push(centre[d] + noise * std);
            }
            labels.push(cluster_id);
        }
    }

    (data, labels)
}

/// Flat row-major standard-Gaussian feature matrix
pub fn gaussian_data(n: usize, n_dim: usize, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = StandardNormal;
    (0..n * n_dim).map(|_| normal.sample(&mut rng)).collect()
}

/// Exact k-nearest-neighbour table by brute force
///
/// Euclidean distances in the original feature space, self excluded,
/// neighbours sorted nearest-first.
pub fn brute_force_knn(data: &[f64], n_dim: usize, k: usize) -> Vec<Vec<Neighbour<f64>>> {
    let n = data.len() / n_dim;
    assert!(k < n, "k = {} needs at least {} points", k, k + 1);

    (0..n)
        .map(|i| {
            let mut dists: Vec<(usize, f64)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| {
                    let d2: f64 = (0..n_dim)
                        .map(|d| {
                            let diff = data[i * n_dim + d] - data[j * n_dim + d];
                            diff * diff
                        })
                        .sum();
                    (j, d2.sqrt())
                })
                .collect();

            dists.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
            dists.truncate(k);
            dists.into_iter().map(|(j, d)| Neighbour::new(j, d)).collect()
        })
        .collect()
}

/// Mean silhouette score of an embedding under the given labels
pub fn silhouette(embedding: &[f64], dim: usize, labels: &[usize]) -> f64 {
    let n = labels.len();
    let n_clusters = labels.iter().max().unwrap() + 1;

    let dist = |i: usize, j: usize| -> f64 {
        (0..dim)
            .map(|d| {
                let diff = embedding[i * dim + d] - embedding[j * dim + d];
                diff * diff
            })
            .sum::<f64>()
            .sqrt()
    };

    let mut total = 0.0;
    for i in 0..n {
        // mean distance to every cluster
        let mut sums = vec![0.0; n_clusters];
        let mut counts = vec![0usize; n_clusters];
        for j in 0..n {
            if j != i {
                sums[labels[j]] += dist(i, j);
                counts[labels[j]] += 1;
            }
        }

        let own = labels[i];
        let a = sums[own] / counts[own] as f64;
        let b = (0..n_clusters)
            .filter(|&c| c != own && counts[c] > 0)
            .map(|c| sums[c] / counts[c] as f64)
            .fold(f64::INFINITY, f64::min);

        total += (b - a) / a.max(b);
    }

    total / n as f64
}
