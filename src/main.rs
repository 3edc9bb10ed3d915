//! SegmentForge: customer segmentation batch runner
//!
//! Loads an orders CSV, runs the full segmentation pipeline and writes every
//! output table as CSV into the output directory.

use anyhow::{Context, Result};
use clap::Parser;
use polars::prelude::*;
use segmentforge::{load_orders_csv, Args, PipelineOutput, SegmentationPipeline};
use std::fs::{self, File};
use std::path::Path;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(log_filter(args.verbose))
        .compact()
        .init();

    run_full_pipeline(&args)
}

/// `SEGMENTFORGE_LOG` overrides the level picked by `--verbose`
fn log_filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_env("SEGMENTFORGE_LOG").unwrap_or_else(|_| EnvFilter::new(default))
}

/// Run the full segmentation pipeline
fn run_full_pipeline(args: &Args) -> Result<()> {
    println!("=== Customer Segmentation Pipeline ===\n");

    let config = args.pipeline_config()?;
    let start_time = Instant::now();

    // Step 1: Load orders
    if args.verbose {
        println!("Step 1: Loading orders");
        println!("  Input file: {}", args.input);
    }
    let orders = load_orders_csv(&args.input).with_context(|| format!("loading {}", args.input))?;
    println!("✓ Orders loaded: {} rows", orders.height());

    // Step 2: Features, scoring, selection, stability
    if args.verbose {
        println!("\nStep 2: Running pipeline");
        println!("  Reference date: {}", config.features.reference_date.format("%Y-%m-%d"));
        println!("  K range: {:?}", config.selector.k_range);
        println!("  Stability windows: {}", config.stability.is_some());
    }
    let pipeline_start = Instant::now();
    let output = SegmentationPipeline::new(config).run(&orders)?;
    println!("✓ Pipeline finished");
    if args.verbose {
        println!("  Pipeline time: {:.2}s", pipeline_start.elapsed().as_secs_f64());
    }

    print_summary(&output);

    // Step 3: Write tables
    let written = write_tables(&output, Path::new(&args.output_dir))?;
    println!("\n✓ {} tables written to {}", written, args.output_dir);

    println!("\n=== Pipeline Complete ===");
    println!("Total processing time: {:.2}s", start_time.elapsed().as_secs_f64());

    Ok(())
}

fn print_summary(output: &PipelineOutput) {
    println!("\n=== Customers ===");
    println!("Customers: {}", output.features.len());
    println!("Clustered: {}", output.clustered.len());

    println!("\n=== RFM Levels ===");
    for level in &output.levels {
        let percentage = (level.customers as f64 / output.features.len() as f64) * 100.0;
        println!("{}: {} customers ({:.1}%)", level.level, level.customers, percentage);
    }

    println!("\n=== Chosen Model ===");
    let best = &output.selection.best;
    println!("{} (Calinski-Harabasz {:.2})", best.clustering.algorithm, best.score);
    for candidate in output.selection.candidates() {
        println!("  {}: {:.2}", candidate.clustering.algorithm, candidate.score);
    }

    let total = output.assignment.customer_ids.len();
    for (i, &size) in best.clustering.cluster_sizes().iter().enumerate() {
        let percentage = (size as f64 / total as f64) * 100.0;
        println!("Cluster {}: {} customers ({:.1}%)", i, size, percentage);
    }
    if best.clustering.n_noise > 0 {
        println!("Noise: {} customers", best.clustering.n_noise);
    }

    match &output.quality.silhouette {
        Ok(score) => println!("\nSilhouette score: {:.3}", score),
        Err(err) => println!("\nSilhouette score: undefined ({})", err),
    }

    if let Some(report) = &output.stability {
        println!("\n=== Stability (ARI vs window {}) ===", report.reference_window);
        for comparison in &report.comparisons {
            match &comparison.ari {
                Ok(ari) => println!("Window {}: {:.3}", comparison.comparison, ari),
                Err(err) => println!("Window {}: {}", comparison.comparison, err),
            }
        }
    }
}

/// Write every output table as `<name>.csv` and return how many were written
fn write_tables(output: &PipelineOutput, dir: &Path) -> Result<usize> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let tables = output.tables()?;
    let count = tables.len();
    for (name, mut frame) in tables {
        let path = dir.join(format!("{name}.csv"));
        let mut file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        CsvWriter::new(&mut file)
            .include_header(true)
            .finish(&mut frame)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn test_verbose_raises_log_level() {
        if std::env::var_os("SEGMENTFORGE_LOG").is_some() {
            return;
        }
        assert_eq!(log_filter(false).max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(log_filter(true).max_level_hint(), Some(LevelFilter::DEBUG));
    }
}
