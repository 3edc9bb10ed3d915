//! End-to-end segmentation run over one order table
//!
//! Builds features, scores RFM segments, selects a clustering model on the
//! standardised features, profiles the winning clusters and optionally
//! measures temporal stability. Every product is available as a polars
//! `DataFrame` for the batch runner to persist.

use ndarray::Array1;
use polars::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use crate::data::{FeatureBuilder, FeatureColumn, FeatureConfig, FeatureTable, OrderTable, CUSTOMER_ID};
use crate::model::{Algorithm, Clustering};
use crate::scaler::ScaledFeatures;
use crate::scoring::{LevelSummary, RfmTable, ScorerConfig, SegmentScorer};
use crate::selection::{CellOutcome, ModelSelection, ModelSelector, SelectorConfig};
use crate::stability::{StabilityConfig, StabilityEvaluator, StabilityReport};
use crate::validation::ClusterQuality;
use crate::Result;

const CLUSTER: &str = "cluster";

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub features: FeatureConfig,
    pub scorer: ScorerConfig,
    pub selector: SelectorConfig,
    /// `None` skips the stability evaluation
    pub stability: Option<StabilityConfig>,
    /// Cluster a seeded random subset of at most this many customers
    pub sample_size: Option<usize>,
    pub sample_seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            features: FeatureConfig::default(),
            scorer: ScorerConfig::default(),
            selector: SelectorConfig::default(),
            stability: Some(StabilityConfig::default()),
            sample_size: Some(9500),
            sample_seed: 1,
        }
    }
}

/// Label of every clustered customer under the selected model
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterAssignment {
    pub customer_ids: Vec<String>,
    pub labels: Array1<i64>,
    pub algorithm: Algorithm,
}

impl ClusterAssignment {
    fn new(customer_ids: Vec<String>, clustering: &Clustering) -> Self {
        Self {
            customer_ids,
            labels: clustering.labels.clone(),
            algorithm: clustering.algorithm.clone(),
        }
    }

    pub fn to_dataframe(&self) -> Result<DataFrame> {
        let n = self.customer_ids.len();
        let variant = self.algorithm.variant().name();
        let hyperparameters = self.algorithm.hyperparameters();

        Ok(DataFrame::new(vec![
            Series::new(CUSTOMER_ID, &self.customer_ids),
            Series::new(CLUSTER, self.labels.to_vec()),
            Series::new("algorithm", vec![variant; n]),
            Series::new("hyperparameters", vec![hyperparameters.as_str(); n]),
        ])?)
    }
}

/// Everything a run produces
#[derive(Debug)]
pub struct PipelineOutput {
    pub features: FeatureTable,
    pub rfm: RfmTable,
    pub levels: Vec<LevelSummary>,
    /// Customers the models were fitted on
    pub clustered: FeatureTable,
    pub selection: ModelSelection,
    pub assignment: ClusterAssignment,
    pub quality: ClusterQuality,
    pub stability: Option<StabilityReport>,
}

impl PipelineOutput {
    pub fn levels_frame(&self) -> Result<DataFrame> {
        let levels = &self.levels;
        Ok(DataFrame::new(vec![
            Series::new("rfm_level", levels.iter().map(|l| l.level.as_str()).collect::<Vec<_>>()),
            Series::new("customers", levels.iter().map(|l| l.customers as u32).collect::<Vec<_>>()),
            Series::new("recency_mean", levels.iter().map(|l| l.recency_mean).collect::<Vec<_>>()),
            Series::new("review_mean", levels.iter().map(|l| l.review_mean).collect::<Vec<_>>()),
            Series::new("delay_mean", levels.iter().map(|l| l.delay_mean).collect::<Vec<_>>()),
            Series::new("monetary_mean", levels.iter().map(|l| l.monetary_mean).collect::<Vec<_>>()),
        ])?)
    }

    /// Size and mean/min/max of every raw feature per cluster label
    pub fn cluster_profile(&self) -> Result<DataFrame> {
        let mut frame = self.clustered.to_dataframe()?;
        frame.with_column(Series::new(CLUSTER, self.assignment.labels.to_vec()))?;

        let mut aggregations = vec![len().alias("customers")];
        for column in FeatureColumn::ALL {
            let name = column.name();
            aggregations.push(col(name).cast(DataType::Float64).mean().alias(&format!("{name}_mean")));
            aggregations.push(col(name).cast(DataType::Float64).min().alias(&format!("{name}_min")));
            aggregations.push(col(name).cast(DataType::Float64).max().alias(&format!("{name}_max")));
        }

        let profile = frame
            .lazy()
            .group_by([col(CLUSTER)])
            .agg(aggregations)
            .sort([CLUSTER], SortMultipleOptions::default())
            .collect()?;
        Ok(profile)
    }

    /// One row per evaluated cell, including rejected ones
    pub fn sweep_log(&self) -> Result<DataFrame> {
        let mut variant = Vec::new();
        let mut algorithm = Vec::new();
        let mut clusters: Vec<Option<u32>> = Vec::new();
        let mut noise: Vec<Option<u32>> = Vec::new();
        let mut score: Vec<Option<f64>> = Vec::new();
        let mut rejection: Vec<Option<String>> = Vec::new();
        let mut best = Vec::new();

        for sweep in &self.selection.sweeps {
            for (idx, cell) in sweep.cells.iter().enumerate() {
                variant.push(sweep.variant.name());
                algorithm.push(cell.algorithm.to_string());
                best.push(sweep.best == Some(idx));
                match &cell.outcome {
                    CellOutcome::Scored { clustering, score: s } => {
                        clusters.push(Some(clustering.n_clusters as u32));
                        noise.push(Some(clustering.n_noise as u32));
                        score.push(Some(*s));
                        rejection.push(None);
                    }
                    CellOutcome::Rejected(reason) => {
                        clusters.push(None);
                        noise.push(None);
                        score.push(None);
                        rejection.push(Some(reason.reason()));
                    }
                }
            }
        }

        Ok(DataFrame::new(vec![
            Series::new("variant", variant),
            Series::new("algorithm", algorithm),
            Series::new("clusters", clusters),
            Series::new("noise", noise),
            Series::new("calinski_harabasz", score),
            Series::new("rejection", rejection),
            Series::new("best_in_sweep", best),
        ])?)
    }

    /// Inertia curve of the partitioning sweep
    pub fn elbow_frame(&self) -> Result<DataFrame> {
        let (curve, chosen) = match &self.selection.elbow {
            Ok(elbow) => (elbow.curve.as_slice(), Some(elbow.k)),
            Err(_) => (&[][..], None),
        };

        Ok(DataFrame::new(vec![
            Series::new("k", curve.iter().map(|p| p.k as u32).collect::<Vec<_>>()),
            Series::new("inertia", curve.iter().map(|p| p.inertia.as_ref().ok().copied()).collect::<Vec<_>>()),
            Series::new(
                "error",
                curve
                    .iter()
                    .map(|p| p.inertia.as_ref().err().map(|e| e.to_string()))
                    .collect::<Vec<_>>(),
            ),
            Series::new("selected", curve.iter().map(|p| Some(p.k) == chosen).collect::<Vec<_>>()),
        ])?)
    }

    pub fn quality_frame(&self) -> Result<DataFrame> {
        let metrics = [
            ("calinski_harabasz", &self.quality.calinski_harabasz),
            ("silhouette", &self.quality.silhouette),
        ];
        Ok(DataFrame::new(vec![
            Series::new("metric", metrics.iter().map(|(name, _)| *name).collect::<Vec<_>>()),
            Series::new("value", metrics.iter().map(|(_, v)| v.as_ref().ok().copied()).collect::<Vec<_>>()),
            Series::new(
                "error",
                metrics
                    .iter()
                    .map(|(_, v)| v.as_ref().err().map(|e| e.to_string()))
                    .collect::<Vec<_>>(),
            ),
        ])?)
    }

    /// Every output table with the file stem it should be written under
    pub fn tables(&self) -> Result<Vec<(&'static str, DataFrame)>> {
        let mut tables = vec![
            ("features", self.features.to_dataframe()?),
            ("rfm_scores", self.rfm.to_dataframe()?),
            ("rfm_levels", self.levels_frame()?),
            ("assignment", self.assignment.to_dataframe()?),
            ("cluster_profile", self.cluster_profile()?),
            ("elbow", self.elbow_frame()?),
            ("sweep_log", self.sweep_log()?),
            ("quality", self.quality_frame()?),
        ];
        if let Some(report) = &self.stability {
            tables.push(("stability_windows", report.windows_frame()?));
            tables.push(("stability_comparisons", report.comparisons_frame()?));
        }
        Ok(tables)
    }
}

/// Seeded subset of at most `size` customers, in table order
fn sample_customers(features: &FeatureTable, size: Option<usize>, seed: u64) -> Result<FeatureTable> {
    match size {
        Some(size) if size < features.len() => {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut picked = rand::seq::index::sample(&mut rng, features.len(), size).into_vec();
            picked.sort_unstable();
            let rows = picked.into_iter().map(|idx| features.rows()[idx].clone()).collect();
            Ok(FeatureTable::new(rows)?)
        }
        _ => Ok(features.clone()),
    }
}

pub struct SegmentationPipeline {
    config: PipelineConfig,
}

impl SegmentationPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn run(&self, orders: &OrderTable) -> Result<PipelineOutput> {
        let config = &self.config;

        let features = FeatureBuilder::new(config.features.clone()).build(orders)?;
        info!(customers = features.len(), "features built");

        let rfm = SegmentScorer::new(config.scorer.clone()).score(&features);
        let levels = rfm.level_summary(&features);
        info!(levels = levels.len(), "rfm segments scored");

        let clustered = sample_customers(&features, config.sample_size, config.sample_seed)?;
        let scaled = ScaledFeatures::fit(&clustered, &FeatureColumn::CLUSTERING)?;
        info!(customers = scaled.len(), columns = scaled.columns.len(), "features standardised");

        let selection = ModelSelector::new(config.selector.clone()).select(&scaled.values)?;
        let quality = ClusterQuality::evaluate(&scaled.values, &selection.best.clustering);
        let assignment = ClusterAssignment::new(scaled.customer_ids.clone(), &selection.best.clustering);

        let stability = match &config.stability {
            Some(stability) => {
                let evaluator =
                    StabilityEvaluator::new(stability.clone(), config.features.clone(), config.selector.clone());
                let report = evaluator.evaluate(orders)?;
                info!(
                    windows = report.windows.len(),
                    compared = report.ari_series().len(),
                    "stability evaluated"
                );
                Some(report)
            }
            None => None,
        };

        Ok(PipelineOutput {
            features,
            rfm,
            levels,
            clustered,
            selection,
            assignment,
            quality,
            stability,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CustomerFeatures;

    fn table(n: usize) -> FeatureTable {
        let rows = (0..n)
            .map(|i| CustomerFeatures {
                customer_id: format!("c{i:03}"),
                recency: i as i64,
                frequency: 1,
                monetary: 10.0 * i as f64,
                review_score: 5.0,
                delivery_delay: 0.0,
            })
            .collect();
        FeatureTable::new(rows).unwrap()
    }

    #[test]
    fn test_sampling_is_seeded_and_bounded() {
        let features = table(50);
        let first = sample_customers(&features, Some(20), 1).unwrap();
        let second = sample_customers(&features, Some(20), 1).unwrap();

        assert_eq!(first.len(), 20);
        assert_eq!(first, second);
        assert!(first.customer_ids().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_small_tables_are_not_sampled() {
        let features = table(5);
        assert_eq!(sample_customers(&features, Some(20), 1).unwrap(), features);
        assert_eq!(sample_customers(&features, None, 1).unwrap(), features);
    }
}
