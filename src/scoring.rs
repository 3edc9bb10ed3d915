//! Rule-based RFM scoring with percentile buckets recomputed per dataset

use polars::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;
use tracing::{debug, warn};

use crate::data::{FeatureColumn, FeatureTable, CUSTOMER_ID};
use crate::error::DataError;

/// How one metric is cut into ordered percentile buckets
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSpec {
    pub column: FeatureColumn,
    pub buckets: usize,
    /// Higher raw values get higher bucket labels when true
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScorerConfig {
    pub recency: BucketSpec,
    pub review: BucketSpec,
    pub delay: BucketSpec,
    pub monetary: BucketSpec,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            recency: BucketSpec {
                column: FeatureColumn::Recency,
                buckets: 3,
                ascending: false,
            },
            review: BucketSpec {
                column: FeatureColumn::ReviewScore,
                buckets: 5,
                ascending: true,
            },
            delay: BucketSpec {
                column: FeatureColumn::DeliveryDelay,
                buckets: 3,
                ascending: true,
            },
            monetary: BucketSpec {
                column: FeatureColumn::Monetary,
                buckets: 3,
                ascending: true,
            },
        }
    }
}

/// Ordered marketing segments, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SegmentLevel {
    RequireActivation,
    NeedsAttention,
    Promising,
    Potential,
    Loyal,
    Champions,
    CantLooseThem,
}

/// Lowest score of each band, highest band first. Everything below the
/// last floor is `RequireActivation`, so every score maps to exactly one level.
const LEVEL_FLOORS: [(u32, SegmentLevel); 6] = [
    (10, SegmentLevel::CantLooseThem),
    (9, SegmentLevel::Champions),
    (8, SegmentLevel::Loyal),
    (7, SegmentLevel::Potential),
    (6, SegmentLevel::Promising),
    (5, SegmentLevel::NeedsAttention),
];

impl SegmentLevel {
    pub fn from_score(score: u32) -> Self {
        LEVEL_FLOORS
            .iter()
            .find(|(floor, _)| score >= *floor)
            .map(|&(_, level)| level)
            .unwrap_or(SegmentLevel::RequireActivation)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SegmentLevel::CantLooseThem => "Can't Loose Them",
            SegmentLevel::Champions => "Champions",
            SegmentLevel::Loyal => "Loyal",
            SegmentLevel::Potential => "Potential",
            SegmentLevel::Promising => "Promising",
            SegmentLevel::NeedsAttention => "Needs Attention",
            SegmentLevel::RequireActivation => "Require Activation",
        }
    }
}

impl fmt::Display for SegmentLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RfmScore {
    pub customer_id: String,
    pub r: u32,
    pub s: u32,
    pub d: u32,
    pub m: u32,
    pub score: u32,
    pub level: SegmentLevel,
}

impl RfmScore {
    /// Bucket indices concatenated as R, S, M, D
    pub fn code(&self) -> String {
        format!("{}{}{}{}", self.r, self.s, self.m, self.d)
    }
}

/// Number of buckets each metric actually produced after tie collapsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketCounts {
    pub recency: usize,
    pub review: usize,
    pub delay: usize,
    pub monetary: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LevelSummary {
    pub level: SegmentLevel,
    pub customers: usize,
    pub recency_mean: f64,
    pub review_mean: f64,
    pub delay_mean: f64,
    pub monetary_mean: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RfmTable {
    pub scores: Vec<RfmScore>,
    pub bucket_counts: BucketCounts,
}

impl RfmTable {
    /// Smallest and largest composite score these buckets can produce
    pub fn score_range(&self) -> RangeInclusive<u32> {
        let counts = [
            self.bucket_counts.recency,
            self.bucket_counts.review,
            self.bucket_counts.delay,
            self.bucket_counts.monetary,
        ];
        let min = counts.iter().filter(|&&c| c > 0).count() as u32;
        let max = counts.iter().sum::<usize>() as u32;
        min..=max
    }

    /// Per-level customer counts and mean raw metrics, best level first
    pub fn level_summary(&self, features: &FeatureTable) -> Vec<LevelSummary> {
        let mut groups: BTreeMap<SegmentLevel, Vec<&str>> = BTreeMap::new();
        for score in &self.scores {
            groups.entry(score.level).or_default().push(&score.customer_id);
        }

        groups
            .into_iter()
            .rev()
            .map(|(level, ids)| {
                let rows: Vec<_> = ids.iter().filter_map(|id| features.get(id)).collect();
                let mean = |column: FeatureColumn| {
                    rows.iter().map(|row| column.value(row)).sum::<f64>() / rows.len() as f64
                };
                LevelSummary {
                    level,
                    customers: rows.len(),
                    recency_mean: mean(FeatureColumn::Recency),
                    review_mean: mean(FeatureColumn::ReviewScore),
                    delay_mean: mean(FeatureColumn::DeliveryDelay),
                    monetary_mean: mean(FeatureColumn::Monetary),
                }
            })
            .collect()
    }

    pub fn to_dataframe(&self) -> Result<DataFrame, DataError> {
        let ids: Vec<&str> = self.scores.iter().map(|s| s.customer_id.as_str()).collect();
        let pick = |f: fn(&RfmScore) -> u32| self.scores.iter().map(f).collect::<Vec<u32>>();
        let codes: Vec<String> = self.scores.iter().map(RfmScore::code).collect();
        let levels: Vec<&str> = self.scores.iter().map(|s| s.level.as_str()).collect();

        let frame = DataFrame::new(vec![
            Series::new(CUSTOMER_ID, ids),
            Series::new("r", pick(|s| s.r)),
            Series::new("s", pick(|s| s.s)),
            Series::new("d", pick(|s| s.d)),
            Series::new("m", pick(|s| s.m)),
            Series::new("rfm_segment", codes),
            Series::new("rfm_score", pick(|s| s.score)),
            Series::new("rfm_level", levels),
        ])?;
        Ok(frame)
    }
}

/// Assigns percentile buckets, composite scores and segment levels
#[derive(Debug, Clone, Default)]
pub struct SegmentScorer {
    config: ScorerConfig,
}

impl SegmentScorer {
    pub fn new(config: ScorerConfig) -> Self {
        Self { config }
    }

    pub fn score(&self, features: &FeatureTable) -> RfmTable {
        let (r, recency) = bucketize(features, self.config.recency);
        let (s, review) = bucketize(features, self.config.review);
        let (d, delay) = bucketize(features, self.config.delay);
        let (m, monetary) = bucketize(features, self.config.monetary);

        let scores = features
            .rows()
            .iter()
            .enumerate()
            .map(|(idx, row)| {
                let score = r[idx] + s[idx] + d[idx] + m[idx];
                RfmScore {
                    customer_id: row.customer_id.clone(),
                    r: r[idx],
                    s: s[idx],
                    d: d[idx],
                    m: m[idx],
                    score,
                    level: SegmentLevel::from_score(score),
                }
            })
            .collect();

        RfmTable {
            scores,
            bucket_counts: BucketCounts {
                recency,
                review,
                delay,
                monetary,
            },
        }
    }
}

fn bucketize(features: &FeatureTable, spec: BucketSpec) -> (Vec<u32>, usize) {
    let values = features.column(spec.column);
    let edges = quantile_edges(&values, spec.buckets);
    let (labels, effective) = assign_buckets(&values, &edges, spec.ascending);

    if effective < spec.buckets && !values.is_empty() {
        warn!(
            column = spec.column.name(),
            requested = spec.buckets,
            effective,
            "tied values collapsed percentile buckets"
        );
    }
    debug!(column = spec.column.name(), ?edges, "percentile cut points");
    (labels, effective)
}

/// Distinct quantile cut points at `i / buckets`, linear interpolation
pub fn quantile_edges(values: &[f64], buckets: usize) -> Vec<f64> {
    if values.is_empty() || buckets == 0 {
        return Vec::new();
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let last = (sorted.len() - 1) as f64;

    let mut edges: Vec<f64> = (0..=buckets)
        .map(|i| {
            let pos = last * i as f64 / buckets as f64;
            let lower = pos.floor() as usize;
            let upper = pos.ceil() as usize;
            let frac = pos - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * frac
        })
        .collect();
    edges.dedup();
    edges
}

/// Label each value with a 1-based bucket index. The first bucket is closed,
/// later ones are `(lo, hi]`. Returns the labels and the bucket count.
pub fn assign_buckets(values: &[f64], edges: &[f64], ascending: bool) -> (Vec<u32>, usize) {
    if values.is_empty() {
        return (Vec::new(), 0);
    }

    let buckets = edges.len().saturating_sub(1).max(1);
    let interior = if edges.len() > 2 {
        &edges[1..edges.len() - 1]
    } else {
        &[][..]
    };

    let labels = values
        .iter()
        .map(|&v| {
            let idx = interior.partition_point(|&edge| edge < v);
            if ascending {
                (idx + 1) as u32
            } else {
                (buckets - idx) as u32
            }
        })
        .collect();
    (labels, buckets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CustomerFeatures;

    fn table(values: &[(f64, i64)]) -> FeatureTable {
        let rows = values
            .iter()
            .enumerate()
            .map(|(i, &(monetary, recency))| CustomerFeatures {
                customer_id: format!("c{i:02}"),
                recency,
                frequency: 1,
                monetary,
                review_score: 1.0 + (i % 5) as f64,
                delivery_delay: i as f64 - 3.0,
            })
            .collect();
        FeatureTable::new(rows).unwrap()
    }

    #[test]
    fn test_monetary_tertiles_ascend() {
        let rfm = SegmentScorer::default().score(&table(&[(10.0, 5), (50.0, 5), (90.0, 5)]));
        let m: Vec<u32> = rfm.scores.iter().map(|s| s.m).collect();
        assert_eq!(m, vec![1, 2, 3]);
    }

    #[test]
    fn test_recent_customers_get_high_recency_bucket() {
        let rfm = SegmentScorer::default().score(&table(&[(1.0, 5), (1.0, 50), (1.0, 100)]));
        let r: Vec<u32> = rfm.scores.iter().map(|s| s.r).collect();
        assert_eq!(r, vec![3, 2, 1]);
    }

    #[test]
    fn test_ties_collapse_buckets() {
        let rfm = SegmentScorer::default().score(&table(&[(7.0, 1), (7.0, 1), (7.0, 1), (7.0, 1)]));
        assert_eq!(rfm.bucket_counts.monetary, 1);
        assert_eq!(rfm.bucket_counts.recency, 1);
        assert!(rfm.scores.iter().all(|s| s.m == 1 && s.r == 1));
    }

    #[test]
    fn test_partial_ties_keep_distinct_edges() {
        let values = [1.0, 1.0, 1.0, 1.0, 2.0, 3.0];
        let edges = quantile_edges(&values, 3);
        assert_eq!(edges.len(), 3);
        let (labels, buckets) = assign_buckets(&values, &edges, true);
        assert_eq!(buckets, 2);
        assert_eq!(labels, vec![1, 1, 1, 1, 2, 2]);
    }

    #[test]
    fn test_scores_stay_within_derived_range() {
        let values: Vec<(f64, i64)> = (0..40).map(|i| (i as f64 * 3.5, (i * 7) % 23)).collect();
        let rfm = SegmentScorer::default().score(&table(&values));
        let range = rfm.score_range();

        assert_eq!(*range.start(), 4);
        assert_eq!(*range.end(), 14);
        for score in &rfm.scores {
            assert!(range.contains(&score.score));
            assert_eq!(score.score, score.r + score.s + score.d + score.m);
        }
    }

    #[test]
    fn test_levels_partition_scores_without_gaps() {
        let mut previous = SegmentLevel::from_score(0);
        assert_eq!(previous, SegmentLevel::RequireActivation);
        for score in 1..=30 {
            let level = SegmentLevel::from_score(score);
            assert!(level >= previous, "levels must not decrease with score");
            previous = level;
        }
        assert_eq!(SegmentLevel::from_score(4), SegmentLevel::RequireActivation);
        assert_eq!(SegmentLevel::from_score(5), SegmentLevel::NeedsAttention);
        assert_eq!(SegmentLevel::from_score(9), SegmentLevel::Champions);
        assert_eq!(SegmentLevel::from_score(10), SegmentLevel::CantLooseThem);
        assert_eq!(SegmentLevel::from_score(14), SegmentLevel::CantLooseThem);
    }

    #[test]
    fn test_level_summary_counts_every_customer() {
        let values: Vec<(f64, i64)> = (0..20).map(|i| (i as f64, i)).collect();
        let features = table(&values);
        let rfm = SegmentScorer::default().score(&features);
        let summary = rfm.level_summary(&features);

        assert_eq!(summary.iter().map(|s| s.customers).sum::<usize>(), 20);
        assert!(summary.windows(2).all(|w| w[0].level > w[1].level));
    }

    #[test]
    fn test_rfm_dataframe_shape() {
        let rfm = SegmentScorer::default().score(&table(&[(10.0, 5), (50.0, 6), (90.0, 7)]));
        let frame = rfm.to_dataframe().unwrap();
        assert_eq!(frame.shape(), (3, 8));
    }
}
