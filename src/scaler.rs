//! Standardisation of feature matrices for distance-based clustering

use ndarray::{Array1, Array2, Axis};
use tracing::warn;

use crate::data::{FeatureColumn, FeatureTable};
use crate::error::DataError;

/// Standard deviations at or below this are treated as zero variance
const MIN_STD: f64 = 1e-12;

/// Fitted per-column standardisation: `(x - mean) / std`
///
/// Columns with zero variance are left untouched by [`transform`](Self::transform)
/// and reported through [`zero_variance_columns`](Self::zero_variance_columns).
#[derive(Debug, Clone, PartialEq)]
pub struct StandardScaler {
    means: Array1<f64>,
    stds: Array1<f64>,
    zero_variance: Vec<usize>,
}

impl StandardScaler {
    pub fn fit(data: &Array2<f64>) -> Result<Self, DataError> {
        if data.nrows() == 0 || data.ncols() == 0 {
            return Err(DataError::EmptyMatrix);
        }

        let means = data.mean_axis(Axis(0)).ok_or(DataError::EmptyMatrix)?;
        let stds = data.std_axis(Axis(0), 0.0);
        let zero_variance: Vec<usize> = stds
            .iter()
            .enumerate()
            .filter(|&(_, &std)| std <= MIN_STD || !std.is_finite())
            .map(|(idx, _)| idx)
            .collect();

        if !zero_variance.is_empty() {
            warn!(columns = ?zero_variance, "zero-variance columns are passed through unscaled");
        }

        Ok(Self {
            means,
            stds,
            zero_variance,
        })
    }

    pub fn transform(&self, data: &Array2<f64>) -> Result<Array2<f64>, DataError> {
        if data.ncols() != self.means.len() {
            return Err(DataError::ShapeMismatch {
                expected: self.means.len(),
                found: data.ncols(),
            });
        }

        let mut scaled = data.to_owned();
        for (idx, mut column) in scaled.axis_iter_mut(Axis(1)).enumerate() {
            if self.zero_variance.contains(&idx) {
                continue;
            }
            let (mean, std) = (self.means[idx], self.stds[idx]);
            column.mapv_inplace(|x| (x - mean) / std);
        }
        Ok(scaled)
    }

    pub fn fit_transform(data: &Array2<f64>) -> Result<(Self, Array2<f64>), DataError> {
        let scaler = Self::fit(data)?;
        let scaled = scaler.transform(data)?;
        Ok((scaler, scaled))
    }

    pub fn means(&self) -> &Array1<f64> {
        &self.means
    }

    pub fn stds(&self) -> &Array1<f64> {
        &self.stds
    }

    pub fn zero_variance_columns(&self) -> &[usize] {
        &self.zero_variance
    }
}

/// Standardised features, keyed like the table they came from
#[derive(Debug, Clone)]
pub struct ScaledFeatures {
    pub customer_ids: Vec<String>,
    pub columns: Vec<FeatureColumn>,
    pub values: Array2<f64>,
    pub scaler: StandardScaler,
}

impl ScaledFeatures {
    /// Fit a scaler on the selected columns of `table` and apply it
    pub fn fit(table: &FeatureTable, columns: &[FeatureColumn]) -> Result<Self, DataError> {
        let raw = table.matrix(columns);
        let (scaler, values) = StandardScaler::fit_transform(&raw)?;
        Ok(Self {
            customer_ids: table.customer_ids(),
            columns: columns.to_vec(),
            values,
            scaler,
        })
    }

    pub fn len(&self) -> usize {
        self.customer_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.customer_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_standardizes_columns() {
        let data = array![[1.0, 10.0], [2.0, 20.0], [3.0, 30.0], [4.0, 40.0]];
        let (scaler, scaled) = StandardScaler::fit_transform(&data).unwrap();

        assert!(scaler.zero_variance_columns().is_empty());
        for column in scaled.axis_iter(Axis(1)) {
            let mean = column.mean().unwrap();
            let std = column.std(0.0);
            assert!(mean.abs() < 1e-12);
            assert!((std - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_zero_variance_column_passes_through() {
        let data = array![[1.0, 7.0], [2.0, 7.0], [3.0, 7.0]];
        let (scaler, scaled) = StandardScaler::fit_transform(&data).unwrap();

        assert_eq!(scaler.zero_variance_columns(), &[1]);
        assert!(scaled.column(1).iter().all(|&x| x == 7.0));
        assert!(scaled.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_fitted_scaler_is_reusable() {
        let train = array![[0.0], [2.0]];
        let scaler = StandardScaler::fit(&train).unwrap();
        let other = scaler.transform(&array![[1.0], [3.0]]).unwrap();
        assert_eq!(other, array![[0.0], [2.0]]);
    }

    #[test]
    fn test_width_mismatch_is_rejected() {
        let scaler = StandardScaler::fit(&array![[1.0, 2.0], [3.0, 4.0]]).unwrap();
        let err = scaler.transform(&array![[1.0]]).unwrap_err();
        assert!(matches!(err, DataError::ShapeMismatch { expected: 2, found: 1 }));
    }

    #[test]
    fn test_empty_matrix_is_rejected() {
        let empty = Array2::<f64>::zeros((0, 3));
        assert!(matches!(
            StandardScaler::fit(&empty),
            Err(DataError::EmptyMatrix)
        ));
    }
}
