//! Agglomerative clustering via the nearest-neighbour chain algorithm
//!
//! Distances live in a condensed upper-triangular matrix and are updated with
//! the Lance-Williams recurrences, so memory grows with `n^2 / 2`.

use ndarray::{Array1, Array2};

use super::{
    canonical_labels, check_distinct, distinct_points, ensure_distinct, squared_distance, Algorithm, ClusterEngine,
    Clustering, HierarchicalParams,
};
use crate::error::FitError;

/// Rule for the distance between two clusters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Linkage {
    /// Minimum increase of within-cluster variance
    #[default]
    Ward,
    Single,
    Complete,
    Average,
}

impl Linkage {
    pub fn name(self) -> &'static str {
        match self {
            Linkage::Ward => "ward",
            Linkage::Single => "single",
            Linkage::Complete => "complete",
            Linkage::Average => "average",
        }
    }

    /// Distance from the union of `a` and `b` to `c`
    fn update(self, d_ac: f64, d_bc: f64, d_ab: f64, n_a: usize, n_b: usize, n_c: usize) -> f64 {
        let (n_a, n_b, n_c) = (n_a as f64, n_b as f64, n_c as f64);
        match self {
            Linkage::Single => d_ac.min(d_bc),
            Linkage::Complete => d_ac.max(d_bc),
            Linkage::Average => (n_a * d_ac + n_b * d_bc) / (n_a + n_b),
            Linkage::Ward => ((n_a + n_c) * d_ac + (n_b + n_c) * d_bc - n_c * d_ab) / (n_a + n_b + n_c),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Merge {
    keep: usize,
    absorbed: usize,
    height: f64,
}

struct CondensedDistances {
    n: usize,
    values: Vec<f64>,
}

impl CondensedDistances {
    /// Ward works on squared Euclidean distances, the other linkages on plain ones
    fn new(features: &Array2<f64>, linkage: Linkage) -> Self {
        let n = features.nrows();
        let mut values = Vec::with_capacity(n * n.saturating_sub(1) / 2);
        for i in 0..n {
            for j in (i + 1)..n {
                let sq = squared_distance(&features.row(i), &features.row(j));
                values.push(if linkage == Linkage::Ward { sq } else { sq.sqrt() });
            }
        }
        Self { n, values }
    }

    fn index(&self, a: usize, b: usize) -> usize {
        let (i, j) = if a < b { (a, b) } else { (b, a) };
        self.n * i - i * (i + 1) / 2 + (j - i - 1)
    }

    fn get(&self, a: usize, b: usize) -> f64 {
        self.values[self.index(a, b)]
    }

    fn set(&mut self, a: usize, b: usize, value: f64) {
        let idx = self.index(a, b);
        self.values[idx] = value;
    }
}

/// Full merge sequence (n - 1 merges), in the order the chain found them
fn merge_tree(features: &Array2<f64>, linkage: Linkage) -> Vec<Merge> {
    let n = features.nrows();
    let mut distances = CondensedDistances::new(features, linkage);
    let mut sizes = vec![1usize; n];
    let mut active = vec![true; n];
    let mut chain: Vec<usize> = Vec::with_capacity(n);
    let mut merges = Vec::with_capacity(n.saturating_sub(1));

    while merges.len() + 1 < n {
        if chain.is_empty() {
            match active.iter().position(|&alive| alive) {
                Some(start) => chain.push(start),
                None => break,
            }
        }

        // Grow the chain until its tip and the element before it are reciprocal nearest neighbours
        let (a, b) = loop {
            let tip = chain[chain.len() - 1];
            let previous = chain.len().checked_sub(2).map(|idx| chain[idx]);
            let (mut nearest, mut nearest_distance) = match previous {
                Some(p) => (p, distances.get(tip, p)),
                None => (usize::MAX, f64::INFINITY),
            };
            for candidate in 0..n {
                if candidate == tip || !active[candidate] {
                    continue;
                }
                let d = distances.get(tip, candidate);
                if d < nearest_distance {
                    nearest = candidate;
                    nearest_distance = d;
                }
            }

            if Some(nearest) == previous || nearest == usize::MAX {
                chain.pop();
                chain.pop();
                break (tip, nearest);
            }
            chain.push(nearest);
        };
        if b == usize::MAX {
            break;
        }

        let (keep, absorbed) = if a < b { (a, b) } else { (b, a) };
        let height = distances.get(keep, absorbed);
        for other in 0..n {
            if !active[other] || other == keep || other == absorbed {
                continue;
            }
            let updated = linkage.update(
                distances.get(keep, other),
                distances.get(absorbed, other),
                height,
                sizes[keep],
                sizes[absorbed],
                sizes[other],
            );
            distances.set(keep, other, updated);
        }
        active[absorbed] = false;
        sizes[keep] += sizes[absorbed];
        merges.push(Merge {
            keep,
            absorbed,
            height,
        });
    }

    merges
}

fn find(parent: &mut [usize], mut node: usize) -> usize {
    while parent[node] != node {
        parent[node] = parent[parent[node]];
        node = parent[node];
    }
    node
}

/// Apply the `n - k` lowest merges and label each point by its root
fn cut_tree(n: usize, merges: &[Merge], k: usize) -> Array1<usize> {
    let mut ordered: Vec<&Merge> = merges.iter().collect();
    ordered.sort_by(|x, y| x.height.total_cmp(&y.height));

    let mut parent: Vec<usize> = (0..n).collect();
    for merge in ordered.into_iter().take(n.saturating_sub(k)) {
        let root_keep = find(&mut parent, merge.keep);
        let root_absorbed = find(&mut parent, merge.absorbed);
        if root_keep != root_absorbed {
            parent[root_absorbed] = root_keep;
        }
    }

    (0..n).map(|node| find(&mut parent, node)).collect()
}

/// Merge sequence of one linkage over a fixed feature matrix
///
/// The tree does not depend on the cluster count, so a sweep over k builds it
/// once and cuts it per k. Only the merges are kept; the distance matrix is
/// dropped once the tree is built.
#[derive(Debug, Clone)]
pub struct Dendrogram {
    linkage: Linkage,
    n: usize,
    distinct: usize,
    merges: Vec<Merge>,
}

impl Dendrogram {
    pub fn build(features: &Array2<f64>, linkage: Linkage) -> Self {
        Self {
            linkage,
            n: features.nrows(),
            distinct: distinct_points(features),
            merges: merge_tree(features, linkage),
        }
    }

    pub fn linkage(&self) -> Linkage {
        self.linkage
    }

    /// Flat clustering with exactly `k` clusters
    pub fn cut(&self, k: usize) -> Result<Clustering, FitError> {
        check_distinct(self.distinct, k)?;

        let roots = cut_tree(self.n, &self.merges, k);
        let (labels, order) = canonical_labels(roots.iter().map(|&root| Some(root)));

        Ok(Clustering::new(
            Algorithm::Hierarchical(HierarchicalParams {
                k,
                linkage: self.linkage,
            }),
            labels,
            order.len(),
        ))
    }
}

impl ClusterEngine for HierarchicalParams {
    fn fit(&self, features: &Array2<f64>) -> Result<Clustering, FitError> {
        ensure_distinct(features, self.k)?;
        Dendrogram::build(features, self.linkage).cut(self.k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{blob_truth, blobs};
    use ndarray::array;

    #[test]
    fn test_condensed_index_covers_upper_triangle() {
        let features = array![[0.0], [1.0], [3.0], [6.0]];
        let distances = CondensedDistances::new(&features, Linkage::Single);
        assert_eq!(distances.values.len(), 6);
        assert_eq!(distances.get(0, 3), 6.0);
        assert_eq!(distances.get(3, 2), 3.0);
        assert_eq!(distances.get(1, 2), 2.0);
    }

    #[test]
    fn test_merge_tree_has_n_minus_one_merges() {
        let features = array![[0.0], [1.0], [3.0], [6.0], [10.0]];
        for linkage in [Linkage::Ward, Linkage::Single, Linkage::Complete, Linkage::Average] {
            assert_eq!(merge_tree(&features, linkage).len(), 4);
        }
    }

    #[test]
    fn test_single_linkage_heights_on_a_line() {
        let features = array![[0.0], [1.0], [3.0], [6.0]];
        let mut heights: Vec<f64> = merge_tree(&features, Linkage::Single)
            .iter()
            .map(|m| m.height)
            .collect();
        heights.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(heights, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_ward_recovers_three_blobs() {
        let features = blobs(&[&[0.0, 0.0], &[9.0, 0.0], &[0.0, 9.0]], 12, 1.0, 11);
        let params = HierarchicalParams {
            k: 3,
            linkage: Linkage::Ward,
        };
        let clustering = params.fit(&features).unwrap();

        assert_eq!(clustering.n_clusters, 3);
        let truth = blob_truth(3, 12);
        let (expected, _) = canonical_labels(truth.iter().map(|&t| Some(t as usize)));
        assert_eq!(clustering.labels, expected);
    }

    #[test]
    fn test_cut_produces_exactly_k_clusters() {
        let features = blobs(&[&[0.0, 0.0], &[5.0, 5.0]], 10, 3.0, 5);
        for k in 1..=6 {
            for linkage in [Linkage::Ward, Linkage::Average, Linkage::Complete] {
                let clustering = HierarchicalParams { k, linkage }.fit(&features).unwrap();
                assert_eq!(clustering.n_clusters, k);
            }
        }
    }

    #[test]
    fn test_more_clusters_than_points_is_fit_error() {
        let features = array![[0.0, 0.0], [1.0, 1.0]];
        let err = HierarchicalParams {
            k: 3,
            linkage: Linkage::Ward,
        }
        .fit(&features)
        .unwrap_err();
        assert!(matches!(err, FitError::InsufficientPoints { distinct: 2, required: 3 }));
    }

    #[test]
    fn test_one_dendrogram_cuts_like_separate_fits() {
        let features = blobs(&[&[0.0, 0.0], &[6.0, 0.0], &[0.0, 6.0]], 8, 1.5, 21);
        for linkage in [Linkage::Ward, Linkage::Single] {
            let dendrogram = Dendrogram::build(&features, linkage);
            assert_eq!(dendrogram.linkage(), linkage);
            for k in 1..=5 {
                let fitted = HierarchicalParams { k, linkage }.fit(&features).unwrap();
                assert_eq!(dendrogram.cut(k).unwrap(), fitted);
            }
        }
    }

    #[test]
    fn test_dendrogram_cut_checks_cluster_count() {
        let features = array![[0.0, 0.0], [0.0, 0.0], [1.0, 1.0]];
        let dendrogram = Dendrogram::build(&features, Linkage::Average);

        assert_eq!(dendrogram.cut(2).unwrap().n_clusters, 2);
        assert_eq!(
            dendrogram.cut(3).unwrap_err(),
            FitError::InsufficientPoints { distinct: 2, required: 3 }
        );
        assert!(matches!(dendrogram.cut(0), Err(FitError::InvalidParams(_))));
    }
}
