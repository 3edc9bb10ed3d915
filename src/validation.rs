//! Internal cluster quality metrics over scaled features and labels
//!
//! Both metrics ignore noise points and are only defined for labelings with at
//! least two clusters of at least two points each. Otherwise they return a
//! [`ValidationError`] instead of a number.

use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;
use std::collections::BTreeMap;

use crate::error::ValidationError;
use crate::model::{euclidean_distance, squared_distance, Clustering, NOISE};

/// Member row indices per non-noise label, checked for metric preconditions
fn cluster_members(labels: &Array1<i64>) -> Result<BTreeMap<i64, Vec<usize>>, ValidationError> {
    let mut members: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (idx, &label) in labels.iter().enumerate() {
        if label != NOISE {
            members.entry(label).or_default().push(idx);
        }
    }

    if members.len() < 2 {
        return Err(ValidationError::TooFewClusters {
            found: members.len(),
        });
    }
    if let Some((&label, _)) = members.iter().find(|(_, rows)| rows.len() < 2) {
        return Err(ValidationError::SingletonCluster { label });
    }
    Ok(members)
}

/// Calinski-Harabasz index: between-cluster over within-cluster dispersion,
/// each normalised by its degrees of freedom. Higher is better.
pub fn calinski_harabasz(features: &Array2<f64>, labels: &Array1<i64>) -> Result<f64, ValidationError> {
    let members = cluster_members(labels)?;
    let rows: Vec<usize> = members.values().flatten().copied().collect();
    let n = rows.len() as f64;
    let k = members.len() as f64;

    let overall = features
        .select(Axis(0), &rows)
        .mean_axis(Axis(0))
        .ok_or(ValidationError::TooFewClusters { found: 0 })?;

    let mut between = 0.0;
    let mut within = 0.0;
    for indices in members.values() {
        let points = features.select(Axis(0), indices);
        let Some(centroid) = points.mean_axis(Axis(0)) else {
            continue;
        };
        between += indices.len() as f64 * squared_distance(&centroid.view(), &overall.view());
        within += points
            .outer_iter()
            .map(|point| squared_distance(&point, &centroid.view()))
            .sum::<f64>();
    }

    if within <= 0.0 {
        return Err(ValidationError::DegenerateDispersion);
    }
    Ok((between / (k - 1.0)) / (within / (n - k)))
}

/// Mean silhouette coefficient over all non-noise points, in `[-1, 1]`
pub fn silhouette(features: &Array2<f64>, labels: &Array1<i64>) -> Result<f64, ValidationError> {
    let members = cluster_members(labels)?;
    let rows: Vec<usize> = members.values().flatten().copied().collect();

    let coefficients: Vec<f64> = rows
        .par_iter()
        .map(|&i| {
            let point = features.row(i);
            let own = labels[i];

            let mean_distance = |indices: &[usize]| {
                let (sum, count) = indices
                    .iter()
                    .filter(|&&j| j != i)
                    .fold((0.0, 0usize), |(sum, count), &j| {
                        (sum + euclidean_distance(&point, &features.row(j)), count + 1)
                    });
                sum / count as f64
            };

            // a(i): mean distance to the rest of its own cluster
            let a_i = mean_distance(&members[&own]);
            // b(i): lowest mean distance to another cluster
            let b_i = members
                .iter()
                .filter(|&(&label, _)| label != own)
                .map(|(_, indices)| mean_distance(indices))
                .fold(f64::INFINITY, f64::min);

            let scale = a_i.max(b_i);
            if scale == 0.0 {
                0.0
            } else {
                (b_i - a_i) / scale
            }
        })
        .collect();

    Ok(coefficients.iter().sum::<f64>() / coefficients.len() as f64)
}

/// Both quality metrics for one clustering; advisory only
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterQuality {
    pub calinski_harabasz: Result<f64, ValidationError>,
    pub silhouette: Result<f64, ValidationError>,
}

impl ClusterQuality {
    pub fn evaluate(features: &Array2<f64>, clustering: &Clustering) -> Self {
        Self {
            calinski_harabasz: calinski_harabasz(features, &clustering.labels),
            silhouette: silhouette(features, &clustering.labels),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{blob_truth, blobs};
    use ndarray::array;

    fn separated() -> (Array2<f64>, Array1<i64>) {
        let features = blobs(&[&[0.0, 0.0], &[20.0, 20.0]], 10, 0.5, 2);
        (features, Array1::from(blob_truth(2, 10)))
    }

    #[test]
    fn test_well_separated_clusters_score_high() {
        let (features, labels) = separated();
        assert!(silhouette(&features, &labels).unwrap() > 0.9);
        assert!(calinski_harabasz(&features, &labels).unwrap() > 100.0);
    }

    #[test]
    fn test_shuffled_labels_score_lower() {
        let (features, labels) = separated();
        let mixed: Array1<i64> = (0..labels.len()).map(|i| (i % 2) as i64).collect();

        assert!(silhouette(&features, &mixed).unwrap() < silhouette(&features, &labels).unwrap());
        assert!(
            calinski_harabasz(&features, &mixed).unwrap()
                < calinski_harabasz(&features, &labels).unwrap()
        );
    }

    #[test]
    fn test_known_calinski_harabasz_value() {
        // centroids 0.5 and 10.5, overall 5.5: B = 4 * 25 = 100, W = 4 * 0.25 = 1
        let features = array![[0.0], [1.0], [10.0], [11.0]];
        let labels = array![0, 0, 1, 1];
        let score = calinski_harabasz(&features, &labels).unwrap();
        assert!((score - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_cluster_is_undefined() {
        let (features, _) = separated();
        let labels = Array1::zeros(features.nrows());
        assert_eq!(
            silhouette(&features, &labels),
            Err(ValidationError::TooFewClusters { found: 1 })
        );
        assert_eq!(
            calinski_harabasz(&features, &labels),
            Err(ValidationError::TooFewClusters { found: 1 })
        );
    }

    #[test]
    fn test_singleton_cluster_is_undefined() {
        let features = array![[0.0], [0.1], [5.0]];
        let labels = array![0, 0, 1];
        assert_eq!(
            silhouette(&features, &labels),
            Err(ValidationError::SingletonCluster { label: 1 })
        );
    }

    #[test]
    fn test_noise_points_are_ignored() {
        let features = array![[0.0], [1.0], [10.0], [11.0], [100.0]];
        let with_noise = array![0, 0, 1, 1, NOISE];
        let without = array![0, 0, 1, 1];
        let trimmed = features.slice(ndarray::s![0..4, ..]).to_owned();

        assert_eq!(
            calinski_harabasz(&features, &with_noise),
            calinski_harabasz(&trimmed, &without)
        );
        assert_eq!(silhouette(&features, &with_noise), silhouette(&trimmed, &without));
    }

    #[test]
    fn test_all_noise_is_undefined() {
        let features = array![[0.0], [1.0]];
        let labels = array![NOISE, NOISE];
        assert_eq!(
            calinski_harabasz(&features, &labels),
            Err(ValidationError::TooFewClusters { found: 0 })
        );
    }

    #[test]
    fn test_collapsed_clusters_have_degenerate_dispersion() {
        let features = array![[1.0], [1.0], [4.0], [4.0]];
        let labels = array![0, 0, 1, 1];
        assert_eq!(
            calinski_harabasz(&features, &labels),
            Err(ValidationError::DegenerateDispersion)
        );
    }
}
