//! Clustering engine: one `fit` contract over four algorithm families

use linfa::prelude::*;
use linfa_clustering::{Dbscan, GaussianMixtureModel, GmmError, KMeans};
use linfa_nn::distance::L2Dist;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::error::FitError;

mod hierarchical;

pub use hierarchical::{Dendrogram, Linkage};

/// Label of points a density-based clustering leaves unassigned
pub const NOISE: i64 = -1;

/// Anything that turns a (scaled) feature matrix into cluster labels
pub trait ClusterEngine {
    fn fit(&self, features: &Array2<f64>) -> Result<Clustering, FitError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Variant {
    Partitioning,
    Density,
    Hierarchical,
    Probabilistic,
}

impl Variant {
    pub const ALL: [Variant; 4] = [
        Variant::Partitioning,
        Variant::Density,
        Variant::Hierarchical,
        Variant::Probabilistic,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Variant::Partitioning => "kmeans",
            Variant::Density => "dbscan",
            Variant::Hierarchical => "agglomerative",
            Variant::Probabilistic => "gaussian_mixture",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// K-Means with `n_init` seeded restarts; the lowest-inertia run is kept
#[derive(Debug, Clone, PartialEq)]
pub struct PartitioningParams {
    pub k: usize,
    pub n_init: usize,
    pub max_iterations: u64,
    pub tolerance: f64,
    pub seed: u64,
}

impl PartitioningParams {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            n_init: 10,
            max_iterations: 300,
            tolerance: 1e-4,
            seed: 42,
        }
    }
}

/// DBSCAN neighbourhood radius and core-point threshold
#[derive(Debug, Clone, PartialEq)]
pub struct DensityParams {
    pub epsilon: f64,
    pub min_points: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HierarchicalParams {
    pub k: usize,
    pub linkage: Linkage,
}

/// Gaussian mixture fitted by EM from `n_init` k-means initialisations
#[derive(Debug, Clone, PartialEq)]
pub struct MixtureParams {
    pub components: usize,
    pub n_init: usize,
    pub max_iterations: u64,
    pub tolerance: f64,
    pub seed: u64,
}

impl MixtureParams {
    pub fn new(components: usize, n_init: usize) -> Self {
        Self {
            components,
            n_init,
            max_iterations: 1000,
            tolerance: 1e-4,
            seed: 1,
        }
    }
}

/// A clustering algorithm together with its hyperparameters
#[derive(Debug, Clone, PartialEq)]
pub enum Algorithm {
    Partitioning(PartitioningParams),
    Density(DensityParams),
    Hierarchical(HierarchicalParams),
    Probabilistic(MixtureParams),
}

impl Algorithm {
    pub fn variant(&self) -> Variant {
        match self {
            Algorithm::Partitioning(_) => Variant::Partitioning,
            Algorithm::Density(_) => Variant::Density,
            Algorithm::Hierarchical(_) => Variant::Hierarchical,
            Algorithm::Probabilistic(_) => Variant::Probabilistic,
        }
    }

    /// Flat `key=value` rendering of the hyperparameters
    pub fn hyperparameters(&self) -> String {
        match self {
            Algorithm::Partitioning(p) => format!("k={};n_init={};seed={}", p.k, p.n_init, p.seed),
            Algorithm::Density(p) => format!("epsilon={};min_points={}", p.epsilon, p.min_points),
            Algorithm::Hierarchical(p) => format!("k={};linkage={}", p.k, p.linkage.name()),
            Algorithm::Probabilistic(p) => format!(
                "components={};n_init={};seed={}",
                p.components, p.n_init, p.seed
            ),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.variant(), self.hyperparameters())
    }
}

impl ClusterEngine for Algorithm {
    fn fit(&self, features: &Array2<f64>) -> Result<Clustering, FitError> {
        match self {
            Algorithm::Partitioning(params) => params.fit(features),
            Algorithm::Density(params) => params.fit(features),
            Algorithm::Hierarchical(params) => params.fit(features),
            Algorithm::Probabilistic(params) => params.fit(features),
        }
    }
}

/// Result of one successful fit
#[derive(Debug, Clone, PartialEq)]
pub struct Clustering {
    pub algorithm: Algorithm,
    /// One label per input row, `NOISE` or `0..n_clusters`
    pub labels: Array1<i64>,
    pub n_clusters: usize,
    pub n_noise: usize,
    /// Within-cluster sum of squares, partitioning only
    pub inertia: Option<f64>,
    /// Centroids in label order, partitioning only
    pub centroids: Option<Array2<f64>>,
}

impl Clustering {
    fn new(algorithm: Algorithm, labels: Array1<i64>, n_clusters: usize) -> Self {
        let n_noise = labels.iter().filter(|&&l| l == NOISE).count();
        Self {
            algorithm,
            labels,
            n_clusters,
            n_noise,
            inertia: None,
            centroids: None,
        }
    }

    /// Number of points per label
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.n_clusters];
        for &label in self.labels.iter() {
            if label >= 0 && (label as usize) < self.n_clusters {
                sizes[label as usize] += 1;
            }
        }
        sizes
    }
}

/// Relabel memberships in order of first appearance. Returns the labels and,
/// for each new label, the raw label it came from.
fn canonical_labels(memberships: impl IntoIterator<Item = Option<usize>>) -> (Array1<i64>, Vec<usize>) {
    let mut mapping: HashMap<usize, i64> = HashMap::new();
    let mut order = Vec::new();
    let labels: Array1<i64> = memberships
        .into_iter()
        .map(|membership| match membership {
            None => NOISE,
            Some(raw) => *mapping.entry(raw).or_insert_with(|| {
                order.push(raw);
                (order.len() - 1) as i64
            }),
        })
        .collect();
    (labels, order)
}

fn distinct_points(features: &Array2<f64>) -> usize {
    features
        .outer_iter()
        .map(|row| row.iter().map(|v| (v + 0.0).to_bits()).collect::<Vec<u64>>())
        .collect::<HashSet<_>>()
        .len()
}

fn ensure_distinct(features: &Array2<f64>, required: usize) -> Result<(), FitError> {
    check_distinct(distinct_points(features), required)
}

fn check_distinct(distinct: usize, required: usize) -> Result<(), FitError> {
    if required == 0 {
        return Err(FitError::InvalidParams("cluster count must be positive".into()));
    }
    if distinct < required {
        return Err(FitError::InsufficientPoints { distinct, required });
    }
    Ok(())
}

impl ClusterEngine for PartitioningParams {
    fn fit(&self, features: &Array2<f64>) -> Result<Clustering, FitError> {
        ensure_distinct(features, self.k)?;

        let dataset = DatasetBase::from(features.clone());
        let rng = StdRng::seed_from_u64(self.seed);
        let model = KMeans::<f64, L2Dist>::params_with(self.k, rng, L2Dist)
            .n_runs(self.n_init.max(1))
            .max_n_iterations(self.max_iterations)
            .tolerance(self.tolerance)
            .fit(&dataset)
            .map_err(|err| FitError::Backend(err.to_string()))?;

        let assigned: Array1<usize> = model.predict(features);
        if !is_lloyd_fixed_point(features, &assigned, model.centroids()) {
            return Err(FitError::NotConverged {
                algorithm: Variant::Partitioning.name(),
                iterations: self.max_iterations,
            });
        }

        let (labels, order) = canonical_labels(assigned.iter().map(|&l| Some(l)));
        let centroids = model.centroids().select(Axis(0), &order);
        let inertia = compute_inertia(features, &labels, &centroids);

        let mut clustering = Clustering::new(Algorithm::Partitioning(self.clone()), labels, order.len());
        clustering.inertia = Some(inertia);
        clustering.centroids = Some(centroids);
        Ok(clustering)
    }
}

impl ClusterEngine for DensityParams {
    fn fit(&self, features: &Array2<f64>) -> Result<Clustering, FitError> {
        if self.min_points < 2 {
            return Err(FitError::InvalidParams(format!(
                "min_points must be at least 2, got {}",
                self.min_points
            )));
        }

        let algorithm = Algorithm::Density(self.clone());
        // A zero radius reaches no neighbour
        if !(self.epsilon > 0.0) {
            let labels = Array1::from_elem(features.nrows(), NOISE);
            return Ok(Clustering::new(algorithm, labels, 0));
        }

        let memberships: Array1<Option<usize>> = Dbscan::params(self.min_points)
            .tolerance(self.epsilon)
            .transform(features)
            .map_err(|err| FitError::InvalidParams(err.to_string()))?;

        let (labels, order) = canonical_labels(memberships.iter().copied());
        Ok(Clustering::new(algorithm, labels, order.len()))
    }
}

impl ClusterEngine for MixtureParams {
    fn fit(&self, features: &Array2<f64>) -> Result<Clustering, FitError> {
        ensure_distinct(features, self.components)?;

        let dataset = DatasetBase::from(features.clone());
        let model = GaussianMixtureModel::<f64>::params(self.components)
            .n_runs(self.n_init.max(1) as u64)
            .tolerance(self.tolerance)
            .max_n_iterations(self.max_iterations)
            .with_rng(StdRng::seed_from_u64(self.seed))
            .fit(&dataset)
            .map_err(|err| match err {
                GmmError::NotConverged(_) => FitError::NotConverged {
                    algorithm: Variant::Probabilistic.name(),
                    iterations: self.max_iterations,
                },
                other => FitError::Backend(other.to_string()),
            })?;

        let assigned: Array1<usize> = model.predict(features);
        let (labels, order) = canonical_labels(assigned.iter().map(|&l| Some(l)));
        Ok(Clustering::new(Algorithm::Probabilistic(self.clone()), labels, order.len()))
    }
}

/// True when recomputing each centroid as the mean of its points would not
/// move any point to a different centroid
fn is_lloyd_fixed_point(features: &Array2<f64>, assigned: &Array1<usize>, centroids: &Array2<f64>) -> bool {
    let mut sums = Array2::<f64>::zeros(centroids.raw_dim());
    let mut counts = vec![0usize; centroids.nrows()];
    for (row, &label) in features.outer_iter().zip(assigned.iter()) {
        if label < counts.len() {
            let mut acc = sums.row_mut(label);
            acc += &row;
            counts[label] += 1;
        }
    }

    let mut means = centroids.clone();
    for (idx, &count) in counts.iter().enumerate() {
        if count > 0 {
            means.row_mut(idx).assign(&sums.row(idx).mapv(|v| v / count as f64));
        }
    }

    features.outer_iter().zip(assigned.iter()).all(|(row, &label)| {
        let own = squared_distance(&row, &means.row(label));
        means
            .outer_iter()
            .all(|mean| own <= squared_distance(&row, &mean) + 1e-12)
    })
}

/// Compute within-cluster sum of squares (inertia); noise points are skipped
pub fn compute_inertia(features: &Array2<f64>, labels: &Array1<i64>, centroids: &Array2<f64>) -> f64 {
    let mut inertia = 0.0;

    for (i, &cluster) in labels.iter().enumerate() {
        if cluster >= 0 && (cluster as usize) < centroids.nrows() {
            inertia += squared_distance(&features.row(i), &centroids.row(cluster as usize));
        }
    }

    inertia
}

pub(crate) fn squared_distance(a: &ArrayView1<f64>, b: &ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Calculate Euclidean distance between two points
pub(crate) fn euclidean_distance(a: &ArrayView1<f64>, b: &ArrayView1<f64>) -> f64 {
    squared_distance(a, b).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{blob_truth, blobs};
    use ndarray::array;

    fn two_blobs() -> Array2<f64> {
        blobs(&[&[0.0, 0.0], &[8.0, 8.0]], 15, 0.5, 7)
    }

    fn same_partition(labels: &Array1<i64>, truth: &[i64]) -> bool {
        let (canonical, _) = canonical_labels(truth.iter().map(|&t| Some(t as usize)));
        labels.iter().zip(canonical.iter()).all(|(a, b)| a == b)
    }

    #[test]
    fn test_kmeans_is_deterministic_with_fixed_seed() {
        let features = blobs(&[&[0.0, 0.0], &[5.0, 5.0], &[0.0, 5.0]], 20, 2.0, 3);
        let params = PartitioningParams::new(3);
        let first = params.fit(&features).unwrap();
        let second = params.fit(&features).unwrap();

        assert_eq!(first.labels, second.labels);
        assert_eq!(first.inertia, second.inertia);
    }

    #[test]
    fn test_kmeans_recovers_separated_blobs() {
        let features = two_blobs();
        let clustering = PartitioningParams::new(2).fit(&features).unwrap();

        assert_eq!(clustering.n_clusters, 2);
        assert!(same_partition(&clustering.labels, &blob_truth(2, 15)));
        assert_eq!(clustering.cluster_sizes(), vec![15, 15]);
        assert!(clustering.inertia.unwrap() >= 0.0);
        assert_eq!(clustering.centroids.as_ref().unwrap().shape(), &[2, 2]);
    }

    #[test]
    fn test_too_few_distinct_points() {
        let features = array![[1.0, 1.0], [1.0, 1.0], [2.0, 2.0], [2.0, 2.0]];
        let err = PartitioningParams::new(3).fit(&features).unwrap_err();
        assert_eq!(err, FitError::InsufficientPoints { distinct: 2, required: 3 });

        let err = MixtureParams::new(3, 1).fit(&features).unwrap_err();
        assert!(matches!(err, FitError::InsufficientPoints { .. }));
    }

    #[test]
    fn test_dbscan_zero_epsilon_is_all_noise() {
        let features = two_blobs();
        let params = DensityParams {
            epsilon: 0.0,
            min_points: 2,
        };
        let clustering = params.fit(&features).unwrap();

        assert_eq!(clustering.n_clusters, 0);
        assert_eq!(clustering.n_noise, features.nrows());
        assert!(clustering.labels.iter().all(|&l| l == NOISE));
    }

    #[test]
    fn test_dbscan_finds_dense_regions_and_noise() {
        let mut rows = two_blobs().into_raw_vec();
        rows.extend_from_slice(&[40.0, -40.0]);
        let features = Array2::from_shape_vec((31, 2), rows).unwrap();

        let clustering = DensityParams {
            epsilon: 1.5,
            min_points: 3,
        }
        .fit(&features)
        .unwrap();

        assert_eq!(clustering.n_clusters, 2);
        assert_eq!(clustering.labels[30], NOISE);
        assert_eq!(clustering.n_noise, 1);
    }

    #[test]
    fn test_dbscan_rejects_single_point_cores() {
        let params = DensityParams {
            epsilon: 1.0,
            min_points: 1,
        };
        assert!(matches!(params.fit(&two_blobs()), Err(FitError::InvalidParams(_))));
    }

    #[test]
    fn test_gaussian_mixture_labels_blobs() {
        let features = two_blobs();
        let clustering = MixtureParams::new(2, 2).fit(&features).unwrap();

        assert_eq!(clustering.n_clusters, 2);
        assert!(same_partition(&clustering.labels, &blob_truth(2, 15)));
    }

    #[test]
    fn test_algorithm_dispatch_and_rendering() {
        let algorithm = Algorithm::Hierarchical(HierarchicalParams {
            k: 2,
            linkage: Linkage::Ward,
        });
        let clustering = algorithm.fit(&two_blobs()).unwrap();

        assert_eq!(clustering.algorithm.variant(), Variant::Hierarchical);
        assert_eq!(algorithm.to_string(), "agglomerative(k=2;linkage=ward)");
    }

    #[test]
    fn test_canonical_labels_follow_first_appearance() {
        let (labels, order) = canonical_labels(vec![Some(4), None, Some(1), Some(4)]);
        assert_eq!(labels, array![0, NOISE, 1, 0]);
        assert_eq!(order, vec![4, 1]);
    }
}
