//! SegmentForge: customer segmentation from order-level data
//!
//! This library turns an order table into per-customer behavioural features,
//! scores rule-based RFM segments, searches four clustering families for the
//! best partition of the standardised features and measures how stable that
//! partition is across sliding time windows.

pub mod cli;
pub mod data;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod scaler;
pub mod scoring;
pub mod selection;
pub mod stability;
pub mod validation;

#[cfg(test)]
mod test_support;

// Re-export public items for easier access
pub use cli::Args;
pub use data::{load_orders_csv, FeatureBuilder, FeatureColumn, FeatureConfig, FeatureTable, OrderRecord, OrderTable};
pub use error::{DataError, FitError, SegmentError, ValidationError, WindowError};
pub use model::{Algorithm, ClusterEngine, Clustering, Linkage, Variant, NOISE};
pub use pipeline::{ClusterAssignment, PipelineConfig, PipelineOutput, SegmentationPipeline};
pub use scaler::{ScaledFeatures, StandardScaler};
pub use scoring::{RfmTable, ScorerConfig, SegmentLevel, SegmentScorer};
pub use selection::{ModelSelection, ModelSelector, SelectorConfig};
pub use stability::{adjusted_rand_index, StabilityConfig, StabilityEvaluator, StabilityReport};
pub use validation::ClusterQuality;

/// Common result type used throughout the library
pub type Result<T> = std::result::Result<T, SegmentError>;
