//! Command-line interface definitions and argument parsing

use anyhow::bail;
use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;

use crate::data::FeatureConfig;
use crate::pipeline::PipelineConfig;
use crate::selection::SelectorConfig;
use crate::stability::StabilityConfig;

/// Customer segmentation over order data: RFM scoring, model selection
/// across four clustering families and temporal stability
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the input orders CSV file
    #[arg(short, long, default_value = "orders.csv")]
    pub input: String,

    /// Directory the output tables are written to
    #[arg(short, long, default_value = "segmentforge-out")]
    pub output_dir: String,

    /// Recency is measured back from this date (YYYY-MM-DD)
    #[arg(short, long, default_value = "2018-09-03")]
    pub reference_date: String,

    /// Smallest cluster count tried by the elbow sweep
    #[arg(long, default_value = "2")]
    pub k_min: usize,

    /// Largest cluster count tried by the elbow sweep
    #[arg(long, default_value = "8")]
    pub k_max: usize,

    /// Seed for every randomised fit
    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Maximum iterations for K-Means
    #[arg(long, default_value = "300")]
    pub max_iters: u64,

    /// Tolerance for K-Means and EM convergence
    #[arg(long, default_value = "1e-4")]
    pub tolerance: f64,

    /// K-Means restarts per cluster count
    #[arg(long, default_value = "10")]
    pub restarts: usize,

    /// Cluster at most this many customers (0 clusters everyone)
    #[arg(long, default_value = "9500")]
    pub sample: usize,

    /// Length of the first stability window in months
    #[arg(long, default_value = "12")]
    pub window_base: u32,

    /// Months between consecutive stability windows
    #[arg(long, default_value = "1")]
    pub window_step: u32,

    /// Skip the sliding-window stability evaluation
    #[arg(long)]
    pub skip_stability: bool,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Parse the reference date as midnight UTC
    /// Expected format: "YYYY-MM-DD"
    pub fn parse_reference_date(&self) -> anyhow::Result<DateTime<Utc>> {
        let date = NaiveDate::parse_from_str(self.reference_date.trim(), "%Y-%m-%d")
            .map_err(|_| anyhow::anyhow!("Invalid reference date: {}", self.reference_date))?;
        match date.and_hms_opt(0, 0, 0) {
            Some(midnight) => Ok(midnight.and_utc()),
            None => bail!("Invalid reference date: {}", self.reference_date),
        }
    }

    /// Build the pipeline configuration from the arguments
    pub fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        if self.k_min < 1 || self.k_min > self.k_max {
            bail!("K range must satisfy 1 <= k-min <= k-max, got {}..={}", self.k_min, self.k_max);
        }
        if self.restarts == 0 {
            bail!("Restarts must be at least 1");
        }

        let selector = SelectorConfig {
            k_range: self.k_min..=self.k_max,
            seed: self.seed,
            n_init: self.restarts,
            max_iterations: self.max_iters,
            tolerance: self.tolerance,
            ..SelectorConfig::default()
        };
        let stability = (!self.skip_stability).then(|| StabilityConfig {
            base_months: self.window_base,
            step_months: self.window_step,
            ..StabilityConfig::default()
        });

        Ok(PipelineConfig {
            features: FeatureConfig {
                reference_date: self.parse_reference_date()?,
            },
            selector,
            stability,
            sample_size: (self.sample > 0).then_some(self.sample),
            ..PipelineConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn args() -> Args {
        Args::parse_from(["segmentforge"])
    }

    #[test]
    fn test_parse_reference_date() {
        let mut args = args();
        assert_eq!(
            args.parse_reference_date().unwrap(),
            Utc.with_ymd_and_hms(2018, 9, 3, 0, 0, 0).unwrap()
        );

        args.reference_date = "03/09/2018".to_string();
        assert!(args.parse_reference_date().is_err());
    }

    #[test]
    fn test_pipeline_config_from_flags() {
        let args = Args::parse_from([
            "segmentforge",
            "--k-min",
            "3",
            "--k-max",
            "5",
            "--sample",
            "0",
            "--skip-stability",
            "--restarts",
            "4",
        ]);
        let config = args.pipeline_config().unwrap();

        assert_eq!(config.selector.k_range, 3..=5);
        assert_eq!(config.selector.n_init, 4);
        assert_eq!(config.sample_size, None);
        assert!(config.stability.is_none());
    }

    #[test]
    fn test_defaults_keep_stability() {
        let config = args().pipeline_config().unwrap();
        assert_eq!(config.sample_size, Some(9500));
        assert_eq!(config.stability, Some(StabilityConfig::default()));
    }

    #[test]
    fn test_invalid_k_range() {
        let mut args = args();
        args.k_min = 6;
        args.k_max = 3;
        assert!(args.pipeline_config().is_err());
    }
}
