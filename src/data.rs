//! Order table validation and per-customer feature computation using Polars

use chrono::{DateTime, TimeZone, Utc};
use ndarray::Array2;
use polars::prelude::*;
use std::path::Path;
use tracing::{debug, info};

use crate::error::DataError;

pub const CUSTOMER_ID: &str = "customer_id";
pub const ORDER_ID: &str = "order_id";
pub const APPROVED_AT: &str = "order_approved_at";
pub const PAYMENT_VALUE: &str = "payment_value";
pub const REVIEW_SCORE: &str = "review_score";
pub const DELIVERY_DELAY: &str = "delivery_delay";

const REQUIRED_COLUMNS: [&str; 6] = [
    CUSTOMER_ID,
    ORDER_ID,
    APPROVED_AT,
    PAYMENT_VALUE,
    REVIEW_SCORE,
    DELIVERY_DELAY,
];

const LAST_APPROVED: &str = "last_approved_ms";
const FREQUENCY: &str = "frequency";
const MONETARY: &str = "monetary";

pub(crate) const MILLIS_PER_DAY: i64 = 86_400_000;

/// One order-level row as handed over by the ingestion step
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRecord {
    pub customer_id: String,
    pub order_id: String,
    pub approved_at: Option<DateTime<Utc>>,
    pub payment_value: f64,
    pub review_score: f64,
    /// Days between delivery and the estimate; negative means early
    pub delivery_delay: i64,
}

/// Validated order table with a fixed schema.
///
/// `order_approved_at` is held as epoch milliseconds (`Int64`), all measures
/// as `Float64`. Construction fails with [`DataError`] when a required column
/// is absent or entirely null.
#[derive(Debug, Clone)]
pub struct OrderTable {
    frame: DataFrame,
}

impl OrderTable {
    /// Validate and normalise an arbitrary frame
    pub fn try_new(frame: DataFrame) -> Result<Self, DataError> {
        if frame.height() == 0 {
            return Err(DataError::NoRows);
        }

        let customer = required(&frame, CUSTOMER_ID)?.cast(&DataType::String)?;
        let order = required(&frame, ORDER_ID)?.cast(&DataType::String)?;
        let approved = normalize_timestamps(required(&frame, APPROVED_AT)?)?;
        let payment = required(&frame, PAYMENT_VALUE)?.cast(&DataType::Float64)?;
        let review = required(&frame, REVIEW_SCORE)?.cast(&DataType::Float64)?;
        let delay = required(&frame, DELIVERY_DELAY)?.cast(&DataType::Float64)?;

        let columns = vec![customer, order, approved, payment, review, delay];
        for (name, series) in REQUIRED_COLUMNS.iter().zip(columns.iter()) {
            if series.null_count() == series.len() {
                return Err(DataError::EmptyColumn(name));
            }
        }

        Ok(Self {
            frame: DataFrame::new(columns)?,
        })
    }

    /// Build a table from typed records
    pub fn from_records(records: &[OrderRecord]) -> Result<Self, DataError> {
        let customers: Vec<&str> = records.iter().map(|r| r.customer_id.as_str()).collect();
        let orders: Vec<&str> = records.iter().map(|r| r.order_id.as_str()).collect();
        let approved: Vec<Option<i64>> = records
            .iter()
            .map(|r| r.approved_at.map(|t| t.timestamp_millis()))
            .collect();
        let payments: Vec<f64> = records.iter().map(|r| r.payment_value).collect();
        let reviews: Vec<f64> = records.iter().map(|r| r.review_score).collect();
        let delays: Vec<i64> = records.iter().map(|r| r.delivery_delay).collect();

        let frame = DataFrame::new(vec![
            Series::new(CUSTOMER_ID, customers),
            Series::new(ORDER_ID, orders),
            Series::new(APPROVED_AT, approved),
            Series::new(PAYMENT_VALUE, payments),
            Series::new(REVIEW_SCORE, reviews),
            Series::new(DELIVERY_DELAY, delays),
        ])?;

        Self::try_new(frame)
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn height(&self) -> usize {
        self.frame.height()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.height() == 0
    }

    /// Earliest and latest approval timestamps, `None` for an empty table
    pub fn time_span(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, DataError> {
        let approved = self.frame.column(APPROVED_AT)?.i64()?;
        let span = match (approved.min(), approved.max()) {
            (Some(first), Some(last)) => DateTime::from_timestamp_millis(first)
                .zip(DateTime::from_timestamp_millis(last)),
            _ => None,
        };
        Ok(span)
    }

    /// Orders approved in `[start, end)`, as a new table
    pub fn between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, DataError> {
        let frame = self
            .frame
            .clone()
            .lazy()
            .filter(
                col(APPROVED_AT)
                    .gt_eq(lit(start.timestamp_millis()))
                    .and(col(APPROVED_AT).lt(lit(end.timestamp_millis()))),
            )
            .collect()?;
        Ok(Self { frame })
    }
}

fn required<'a>(frame: &'a DataFrame, name: &'static str) -> Result<&'a Series, DataError> {
    frame
        .column(name)
        .map_err(|_| DataError::MissingColumn(name))
}

/// Convert any temporal or integer column into epoch milliseconds
fn normalize_timestamps(series: &Series) -> Result<Series, DataError> {
    let to_millis: fn(i64) -> i64 = match series.dtype() {
        DataType::Datetime(TimeUnit::Nanoseconds, _) => |v| v.div_euclid(1_000_000),
        DataType::Datetime(TimeUnit::Microseconds, _) => |v| v.div_euclid(1_000),
        DataType::Datetime(TimeUnit::Milliseconds, _) => |v| v,
        DataType::Date => |v| v * MILLIS_PER_DAY,
        DataType::Int64 | DataType::Int32 | DataType::UInt32 | DataType::UInt64 => |v| v,
        other => {
            return Err(DataError::ColumnType {
                column: APPROVED_AT,
                dtype: other.to_string(),
            })
        }
    };

    let raw = series.cast(&DataType::Int64)?;
    let millis: Vec<Option<i64>> = raw.i64()?.into_iter().map(|v| v.map(to_millis)).collect();
    Ok(Series::new(APPROVED_AT, millis))
}

/// Load an order-level CSV file into a validated table
///
/// # Arguments
/// * `file_path` - Path to a CSV file with the six required columns
///
/// # Returns
/// * `OrderTable` ready for feature construction
pub fn load_orders_csv(file_path: impl AsRef<Path>) -> Result<OrderTable, DataError> {
    let frame = LazyCsvReader::new(file_path.as_ref())
        .with_has_header(true)
        .with_try_parse_dates(true)
        .finish()?
        .collect()?;

    debug!(rows = frame.height(), "loaded order csv");
    OrderTable::try_new(frame)
}

/// Behavioural features of one customer over one window
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerFeatures {
    pub customer_id: String,
    /// Whole days between the reference date and the last approved order
    pub recency: i64,
    /// Number of distinct orders
    pub frequency: u32,
    /// Total payment value
    pub monetary: f64,
    pub review_score: f64,
    pub delivery_delay: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureColumn {
    Recency,
    Frequency,
    Monetary,
    ReviewScore,
    DeliveryDelay,
}

impl FeatureColumn {
    pub const ALL: [FeatureColumn; 5] = [
        FeatureColumn::Recency,
        FeatureColumn::Frequency,
        FeatureColumn::Monetary,
        FeatureColumn::ReviewScore,
        FeatureColumn::DeliveryDelay,
    ];

    /// Columns used for clustering; frequency is almost always 1 and adds no signal
    pub const CLUSTERING: [FeatureColumn; 4] = [
        FeatureColumn::Recency,
        FeatureColumn::Monetary,
        FeatureColumn::DeliveryDelay,
        FeatureColumn::ReviewScore,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FeatureColumn::Recency => "recency",
            FeatureColumn::Frequency => FREQUENCY,
            FeatureColumn::Monetary => MONETARY,
            FeatureColumn::ReviewScore => REVIEW_SCORE,
            FeatureColumn::DeliveryDelay => DELIVERY_DELAY,
        }
    }

    pub fn value(self, features: &CustomerFeatures) -> f64 {
        match self {
            FeatureColumn::Recency => features.recency as f64,
            FeatureColumn::Frequency => f64::from(features.frequency),
            FeatureColumn::Monetary => features.monetary,
            FeatureColumn::ReviewScore => features.review_score,
            FeatureColumn::DeliveryDelay => features.delivery_delay,
        }
    }
}

/// One feature vector per distinct customer, sorted by customer id
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    rows: Vec<CustomerFeatures>,
}

impl FeatureTable {
    pub fn new(mut rows: Vec<CustomerFeatures>) -> Result<Self, DataError> {
        rows.sort_by(|a, b| a.customer_id.cmp(&b.customer_id));
        if let Some(pair) = rows.windows(2).find(|w| w[0].customer_id == w[1].customer_id) {
            return Err(DataError::DuplicateCustomer(pair[0].customer_id.clone()));
        }
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[CustomerFeatures] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, customer_id: &str) -> Option<&CustomerFeatures> {
        self.rows
            .binary_search_by(|row| row.customer_id.as_str().cmp(customer_id))
            .ok()
            .map(|idx| &self.rows[idx])
    }

    pub fn customer_ids(&self) -> Vec<String> {
        self.rows.iter().map(|r| r.customer_id.clone()).collect()
    }

    pub fn column(&self, column: FeatureColumn) -> Vec<f64> {
        self.rows.iter().map(|r| column.value(r)).collect()
    }

    /// Raw feature matrix (n_customers, columns.len())
    pub fn matrix(&self, columns: &[FeatureColumn]) -> Array2<f64> {
        Array2::from_shape_fn((self.rows.len(), columns.len()), |(i, j)| {
            columns[j].value(&self.rows[i])
        })
    }

    pub fn to_dataframe(&self) -> Result<DataFrame, DataError> {
        let ids: Vec<&str> = self.rows.iter().map(|r| r.customer_id.as_str()).collect();
        let recency: Vec<i64> = self.rows.iter().map(|r| r.recency).collect();
        let frequency: Vec<u32> = self.rows.iter().map(|r| r.frequency).collect();
        let frame = DataFrame::new(vec![
            Series::new(CUSTOMER_ID, ids),
            Series::new(FeatureColumn::Recency.name(), recency),
            Series::new(FREQUENCY, frequency),
            Series::new(MONETARY, self.column(FeatureColumn::Monetary)),
            Series::new(REVIEW_SCORE, self.column(FeatureColumn::ReviewScore)),
            Series::new(DELIVERY_DELAY, self.column(FeatureColumn::DeliveryDelay)),
        ])?;
        Ok(frame)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureConfig {
    /// Recency is measured back from this instant
    pub reference_date: DateTime<Utc>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            reference_date: Utc
                .with_ymd_and_hms(2018, 9, 3, 0, 0, 0)
                .single()
                .unwrap_or(DateTime::UNIX_EPOCH),
        }
    }
}

/// Aggregates order rows into customer feature vectors
#[derive(Debug, Clone, Default)]
pub struct FeatureBuilder {
    config: FeatureConfig,
}

impl FeatureBuilder {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }

    pub fn reference_date(&self) -> DateTime<Utc> {
        self.config.reference_date
    }

    /// Compute one feature vector per customer present in `table`
    ///
    /// Exact duplicate rows are dropped first, then rows are folded per order
    /// (payments summed) and orders per customer.
    pub fn build(&self, table: &OrderTable) -> Result<FeatureTable, DataError> {
        let reference_ms = self.config.reference_date.timestamp_millis();

        let per_customer = table
            .frame()
            .clone()
            .lazy()
            .filter(
                col(CUSTOMER_ID)
                    .is_not_null()
                    .and(col(ORDER_ID).is_not_null()),
            )
            .unique_stable(None, UniqueKeepStrategy::First)
            .group_by([col(CUSTOMER_ID), col(ORDER_ID)])
            .agg([
                col(APPROVED_AT).max(),
                col(PAYMENT_VALUE).sum(),
                col(REVIEW_SCORE).mean(),
                col(DELIVERY_DELAY).mean(),
            ])
            .group_by([col(CUSTOMER_ID)])
            .agg([
                col(APPROVED_AT).max().alias(LAST_APPROVED),
                col(ORDER_ID).n_unique().cast(DataType::Int64).alias(FREQUENCY),
                col(PAYMENT_VALUE).sum().alias(MONETARY),
                col(REVIEW_SCORE).mean(),
                col(DELIVERY_DELAY).mean(),
            ])
            .collect()?;

        let ids = per_customer.column(CUSTOMER_ID)?.str()?;
        let last_approved = per_customer.column(LAST_APPROVED)?.i64()?;
        let frequency = per_customer.column(FREQUENCY)?.i64()?;
        let monetary = per_customer.column(MONETARY)?.f64()?;
        let review = per_customer.column(REVIEW_SCORE)?.f64()?;
        let delay = per_customer.column(DELIVERY_DELAY)?.f64()?;

        let mut rows = Vec::with_capacity(per_customer.height());
        for idx in 0..per_customer.height() {
            let customer_id = ids
                .get(idx)
                .ok_or(DataError::EmptyColumn(CUSTOMER_ID))?
                .to_string();

            let last_ms = last_approved
                .get(idx)
                .ok_or_else(|| DataError::MissingTimestamp {
                    customer_id: customer_id.clone(),
                })?;
            let elapsed = reference_ms - last_ms;
            if elapsed < 0 {
                return Err(DataError::FutureOrder { customer_id });
            }

            let missing = |column: &'static str| DataError::MissingValue {
                customer_id: customer_id.clone(),
                column,
            };
            let orders = frequency.get(idx).ok_or_else(|| missing(ORDER_ID))?;
            let review_score = review.get(idx).ok_or_else(|| missing(REVIEW_SCORE))?;
            let delivery_delay = delay.get(idx).ok_or_else(|| missing(DELIVERY_DELAY))?;
            let total = monetary.get(idx).ok_or_else(|| missing(PAYMENT_VALUE))?;

            rows.push(CustomerFeatures {
                recency: elapsed.div_euclid(MILLIS_PER_DAY),
                frequency: orders as u32,
                monetary: total,
                review_score,
                delivery_delay,
                customer_id,
            });
        }

        let table = FeatureTable::new(rows)?;
        info!(customers = table.len(), "built customer features");
        Ok(table)
    }
}
