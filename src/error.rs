//! Error taxonomy for the segmentation pipeline

use polars::prelude::PolarsError;
use thiserror::Error;

/// Input table problems. Fatal: the run cannot produce meaningful features.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("required column `{0}` is missing")]
    MissingColumn(&'static str),
    #[error("required column `{0}` contains only nulls")]
    EmptyColumn(&'static str),
    #[error("column `{column}` has unsupported type {dtype}")]
    ColumnType { column: &'static str, dtype: String },
    #[error("order table has no rows")]
    NoRows,
    #[error("customer `{customer_id}` has no approval timestamp on any order")]
    MissingTimestamp { customer_id: String },
    #[error("customer `{customer_id}` has no `{column}` value on any order")]
    MissingValue { customer_id: String, column: &'static str },
    #[error("customer `{customer_id}` ordered after the reference date")]
    FutureOrder { customer_id: String },
    #[error("customer `{0}` appears more than once in the feature table")]
    DuplicateCustomer(String),
    #[error("feature matrix has {found} columns, scaler was fitted on {expected}")]
    ShapeMismatch { expected: usize, found: usize },
    #[error("cannot fit a scaler on an empty matrix")]
    EmptyMatrix,
    #[error(transparent)]
    Frame(#[from] PolarsError),
}

/// A single clustering attempt failed. Recoverable: the attempt is excluded.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum FitError {
    #[error("{distinct} distinct points cannot form {required} clusters")]
    InsufficientPoints { distinct: usize, required: usize },
    #[error("{algorithm} did not converge within {iterations} iterations")]
    NotConverged {
        algorithm: &'static str,
        iterations: u64,
    },
    #[error("invalid hyperparameters: {0}")]
    InvalidParams(String),
    #[error("fitting failed: {0}")]
    Backend(String),
    #[error("no valid {variant} candidate in the sweep")]
    NoValidCandidate { variant: &'static str },
}

/// A quality metric is undefined for the labeling it was given.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("need at least 2 non-noise clusters, found {found}")]
    TooFewClusters { found: usize },
    #[error("cluster {label} has fewer than 2 points")]
    SingletonCluster { label: i64 },
    #[error("within-cluster dispersion is zero")]
    DegenerateDispersion,
}

/// Failure confined to one stability window or one window comparison.
#[derive(Debug, Error)]
pub enum WindowError {
    #[error("window {window} contains no orders")]
    Empty { window: usize },
    #[error("windows {reference} and {comparison} share no customers")]
    NoOverlap { reference: usize, comparison: usize },
    #[error("reference window {reference} has no clustering to compare against")]
    ReferenceUnavailable { reference: usize },
    #[error("window {comparison} has no clustering to compare")]
    ComparisonUnavailable { comparison: usize },
    #[error("window {window} failed: {source}")]
    Failed {
        window: usize,
        #[source]
        source: Box<SegmentError>,
    },
    #[error("invalid window schedule: {0}")]
    InvalidSchedule(String),
}

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Fit(#[from] FitError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Window(#[from] WindowError),
}

impl From<PolarsError> for SegmentError {
    fn from(err: PolarsError) -> Self {
        SegmentError::Data(DataError::Frame(err))
    }
}
