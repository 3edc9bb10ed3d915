//! Temporal stability of the partitioning model over sliding windows
//!
//! Window 0 covers the first `base_months` of orders. Every later window starts
//! `step_months` further on and spans `step_months + base_months`. Each window
//! is re-featurised, re-scaled and re-clustered from scratch, then compared to
//! the reference window with the Adjusted Rand Index on the customers they
//! share.

use chrono::{DateTime, Months, Utc};
use ndarray::Array1;
use polars::prelude::*;
use rayon::prelude::*;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::data::{FeatureBuilder, FeatureColumn, FeatureConfig, OrderTable};
use crate::error::{SegmentError, WindowError};
use crate::scaler::ScaledFeatures;
use crate::selection::{ModelSelector, SelectorConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StabilityConfig {
    pub base_months: u32,
    pub step_months: u32,
    /// Index of the window every other window is compared against
    pub reference_window: usize,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            base_months: 12,
            step_months: 1,
            reference_window: 0,
        }
    }
}

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub index: usize,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

fn add_months(anchor: DateTime<Utc>, months: u32) -> Result<DateTime<Utc>, WindowError> {
    anchor
        .checked_add_months(Months::new(months))
        .ok_or_else(|| WindowError::InvalidSchedule(format!("{anchor} + {months} months overflows")))
}

/// Windows over `[first, last]`; the first window is always produced, later
/// ones only while they end no later than `last`
pub fn window_schedule(
    first: DateTime<Utc>,
    last: DateTime<Utc>,
    base_months: u32,
    step_months: u32,
) -> Result<Vec<TimeWindow>, WindowError> {
    if base_months == 0 || step_months == 0 {
        return Err(WindowError::InvalidSchedule(format!(
            "base ({base_months}) and step ({step_months}) must be at least one month"
        )));
    }

    let mut windows = vec![TimeWindow {
        index: 0,
        start: first,
        end: add_months(first, base_months)?,
    }];
    for index in 1usize.. {
        let offset = u32::try_from(index)
            .ok()
            .and_then(|i| i.checked_mul(step_months))
            .ok_or_else(|| WindowError::InvalidSchedule("too many windows".into()))?;
        let end = add_months(first, offset + step_months + base_months)?;
        if end > last {
            break;
        }
        windows.push(TimeWindow {
            index,
            start: add_months(first, offset)?,
            end,
        });
    }
    Ok(windows)
}

/// Adjusted Rand Index between two labelings of the same points.
///
/// Both slices are read pairwise; any excess on the longer one is ignored.
/// Returns exactly 1.0 when the labelings agree on every pair, including the
/// degenerate cases of fewer than two points.
pub fn adjusted_rand_index(first: &[i64], second: &[i64]) -> f64 {
    let comb2 = |n: u64| (n * n.saturating_sub(1) / 2) as f64;

    let mut contingency: HashMap<(i64, i64), u64> = HashMap::new();
    let mut first_sizes: HashMap<i64, u64> = HashMap::new();
    let mut second_sizes: HashMap<i64, u64> = HashMap::new();
    let mut n = 0u64;
    for (&a, &b) in first.iter().zip(second.iter()) {
        *contingency.entry((a, b)).or_default() += 1;
        *first_sizes.entry(a).or_default() += 1;
        *second_sizes.entry(b).or_default() += 1;
        n += 1;
    }

    let index: f64 = contingency.values().map(|&c| comb2(c)).sum();
    let first_pairs: f64 = first_sizes.values().map(|&c| comb2(c)).sum();
    let second_pairs: f64 = second_sizes.values().map(|&c| comb2(c)).sum();

    // no pair is joined by one labeling and split by the other
    if first_pairs == index && second_pairs == index {
        return 1.0;
    }

    let expected = first_pairs * second_pairs / comb2(n);
    let maximum = (first_pairs + second_pairs) / 2.0;
    (index - expected) / (maximum - expected)
}

/// Partitioning labels of one window
#[derive(Debug, Clone, PartialEq)]
pub struct WindowClustering {
    pub customer_ids: Vec<String>,
    pub labels: Array1<i64>,
    pub k: usize,
}

#[derive(Debug)]
pub struct WindowOutcome {
    pub window: TimeWindow,
    pub result: Result<WindowClustering, WindowError>,
}

#[derive(Debug)]
pub struct StabilityComparison {
    pub reference: usize,
    pub comparison: usize,
    pub shared_customers: usize,
    pub ari: Result<f64, WindowError>,
}

#[derive(Debug)]
pub struct StabilityReport {
    pub reference_window: usize,
    pub windows: Vec<WindowOutcome>,
    pub comparisons: Vec<StabilityComparison>,
}

impl StabilityReport {
    /// ARI values of the successful comparisons, in window order
    pub fn ari_series(&self) -> Vec<(usize, f64)> {
        self.comparisons
            .iter()
            .filter_map(|c| c.ari.as_ref().ok().map(|&ari| (c.comparison, ari)))
            .collect()
    }

    pub fn windows_frame(&self) -> Result<DataFrame, SegmentError> {
        let index: Vec<u32> = self.windows.iter().map(|w| w.window.index as u32).collect();
        let day = |at: DateTime<Utc>| at.format("%Y-%m-%d").to_string();
        let start: Vec<String> = self.windows.iter().map(|w| day(w.window.start)).collect();
        let end: Vec<String> = self.windows.iter().map(|w| day(w.window.end)).collect();
        let customers: Vec<Option<u32>> = self
            .windows
            .iter()
            .map(|w| w.result.as_ref().ok().map(|c| c.customer_ids.len() as u32))
            .collect();
        let k: Vec<Option<u32>> = self
            .windows
            .iter()
            .map(|w| w.result.as_ref().ok().map(|c| c.k as u32))
            .collect();
        let error: Vec<Option<String>> = self
            .windows
            .iter()
            .map(|w| w.result.as_ref().err().map(|e| e.to_string()))
            .collect();

        Ok(DataFrame::new(vec![
            Series::new("window", index),
            Series::new("start", start),
            Series::new("end", end),
            Series::new("customers", customers),
            Series::new("k", k),
            Series::new("error", error),
        ])?)
    }

    pub fn comparisons_frame(&self) -> Result<DataFrame, SegmentError> {
        let reference: Vec<u32> = self.comparisons.iter().map(|c| c.reference as u32).collect();
        let comparison: Vec<u32> = self.comparisons.iter().map(|c| c.comparison as u32).collect();
        let shared: Vec<u32> = self.comparisons.iter().map(|c| c.shared_customers as u32).collect();
        let ari: Vec<Option<f64>> = self.comparisons.iter().map(|c| c.ari.as_ref().ok().copied()).collect();
        let error: Vec<Option<String>> = self
            .comparisons
            .iter()
            .map(|c| c.ari.as_ref().err().map(|e| e.to_string()))
            .collect();

        Ok(DataFrame::new(vec![
            Series::new("reference", reference),
            Series::new("comparison", comparison),
            Series::new("shared_customers", shared),
            Series::new("ari", ari),
            Series::new("error", error),
        ])?)
    }
}

fn failed(window: usize, err: impl Into<SegmentError>) -> WindowError {
    WindowError::Failed {
        window,
        source: Box::new(err.into()),
    }
}

/// ARI between two windows on their shared customers
fn compare(
    reference: &WindowClustering,
    other: &WindowClustering,
    reference_index: usize,
    window: usize,
) -> (usize, Result<f64, WindowError>) {
    let reference_labels: HashMap<&str, i64> = reference
        .customer_ids
        .iter()
        .map(String::as_str)
        .zip(reference.labels.iter().copied())
        .collect();

    let (left, right): (Vec<i64>, Vec<i64>) = other
        .customer_ids
        .iter()
        .zip(other.labels.iter())
        .filter_map(|(id, &label)| reference_labels.get(id.as_str()).map(|&r| (r, label)))
        .unzip();

    if left.is_empty() {
        return (
            0,
            Err(WindowError::NoOverlap {
                reference: reference_index,
                comparison: window,
            }),
        );
    }
    (left.len(), Ok(adjusted_rand_index(&left, &right)))
}

/// Re-runs feature building, scaling and elbow k-means per window
pub struct StabilityEvaluator {
    config: StabilityConfig,
    builder: FeatureBuilder,
    selector: ModelSelector,
}

impl StabilityEvaluator {
    pub fn new(config: StabilityConfig, features: FeatureConfig, selector: SelectorConfig) -> Self {
        Self {
            config,
            builder: FeatureBuilder::new(features),
            selector: ModelSelector::new(selector),
        }
    }

    pub fn schedule(&self, orders: &OrderTable) -> Result<Vec<TimeWindow>, SegmentError> {
        let (first, last) = orders
            .time_span()?
            .ok_or_else(|| WindowError::InvalidSchedule("order table has no approval timestamps".into()))?;
        Ok(window_schedule(
            first,
            last,
            self.config.base_months,
            self.config.step_months,
        )?)
    }

    fn run_window(&self, orders: &OrderTable, window: &TimeWindow) -> Result<WindowClustering, WindowError> {
        let slice = orders
            .between(window.start, window.end)
            .map_err(|err| failed(window.index, err))?;
        if slice.is_empty() {
            return Err(WindowError::Empty {
                window: window.index,
            });
        }

        let features = self.builder.build(&slice).map_err(|err| failed(window.index, err))?;
        let scaled = ScaledFeatures::fit(&features, &FeatureColumn::CLUSTERING)
            .map_err(|err| failed(window.index, err))?;
        let elbow = self
            .selector
            .elbow(&scaled.values)
            .map_err(|err| failed(window.index, err))?;

        debug!(window = window.index, customers = scaled.len(), k = elbow.k, "window clustered");
        Ok(WindowClustering {
            customer_ids: scaled.customer_ids,
            labels: elbow.clustering.labels,
            k: elbow.k,
        })
    }

    /// Cluster every window and compare each one with the reference window
    pub fn evaluate(&self, orders: &OrderTable) -> Result<StabilityReport, SegmentError> {
        let schedule = self.schedule(orders)?;
        let reference = self.config.reference_window;
        if reference >= schedule.len() {
            return Err(WindowError::InvalidSchedule(format!(
                "reference window {reference} outside {} windows",
                schedule.len()
            ))
            .into());
        }
        info!(windows = schedule.len(), reference, "evaluating stability");

        let windows: Vec<WindowOutcome> = schedule
            .par_iter()
            .map(|window| WindowOutcome {
                window: *window,
                result: self.run_window(orders, window),
            })
            .collect();
        for outcome in &windows {
            if let Err(err) = &outcome.result {
                warn!(window = outcome.window.index, error = %err, "window skipped");
            }
        }

        let reference_run = windows[reference].result.as_ref().ok();
        let comparisons = windows
            .iter()
            .filter(|outcome| outcome.window.index != reference)
            .map(|outcome| {
                let comparison = outcome.window.index;
                let (shared_customers, ari) = match (reference_run, &outcome.result) {
                    (None, _) => (0, Err(WindowError::ReferenceUnavailable { reference })),
                    (Some(_), Err(_)) => (0, Err(WindowError::ComparisonUnavailable { comparison })),
                    (Some(base), Ok(run)) => compare(base, run, reference, comparison),
                };
                StabilityComparison {
                    reference,
                    comparison,
                    shared_customers,
                    ari,
                }
            })
            .collect();

        Ok(StabilityReport {
            reference_window: reference,
            windows,
            comparisons,
        })
    }
}
