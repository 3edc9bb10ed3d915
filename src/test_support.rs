//! Synthetic data shared by unit tests

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// `per_cluster` points around each center, uniformly jittered by `spread`
pub fn blobs(centers: &[&[f64]], per_cluster: usize, spread: f64, seed: u64) -> Array2<f64> {
    let dims = centers[0].len();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut values = Vec::with_capacity(centers.len() * per_cluster * dims);
    for center in centers {
        for _ in 0..per_cluster {
            for &c in center.iter() {
                values.push(c + rng.gen_range(-spread..spread));
            }
        }
    }
    Array2::from_shape_vec((centers.len() * per_cluster, dims), values)
        .expect("blob shape matches generated values")
}

/// Ground-truth blob index of each row produced by [`blobs`]
pub fn blob_truth(n_centers: usize, per_cluster: usize) -> Vec<i64> {
    (0..n_centers)
        .flat_map(|c| std::iter::repeat(c as i64).take(per_cluster))
        .collect()
}

pub fn four_blobs(per_cluster: usize, seed: u64) -> Array2<f64> {
    blobs(
        &[
            &[0.0, 0.0, 0.0, 0.0],
            &[10.0, 0.0, 0.0, 10.0],
            &[0.0, 10.0, 10.0, 0.0],
            &[10.0, 10.0, -10.0, -10.0],
        ],
        per_cluster,
        1.0,
        seed,
    )
}
