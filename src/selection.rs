//! Hyperparameter sweeps and model selection
//!
//! The partitioning variant picks its cluster count with the elbow rule on the
//! inertia curve. The other variants run a grid search where each cell is scored
//! with the Calinski-Harabasz index. Cells are fitted in parallel but always
//! reported in grid order, and every reduction breaks ties towards the earlier
//! cell, so the selection does not depend on the thread count.

use ndarray::Array2;
use rayon::prelude::*;
use std::ops::RangeInclusive;
use tracing::{debug, info};

use crate::error::{FitError, ValidationError};
use crate::model::{
    Algorithm, ClusterEngine, Clustering, Dendrogram, DensityParams, HierarchicalParams, Linkage, MixtureParams,
    PartitioningParams, Variant,
};
use crate::validation::calinski_harabasz;

/// Sweep ranges and fitting budget
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorConfig {
    /// Cluster counts tried by the elbow sweep
    pub k_range: RangeInclusive<usize>,
    pub seed: u64,
    pub n_init: usize,
    pub max_iterations: u64,
    pub tolerance: f64,
    pub epsilons: Vec<f64>,
    pub min_points: Vec<usize>,
    pub hierarchical_k: RangeInclusive<usize>,
    pub linkage: Linkage,
    pub mixture_components: Vec<usize>,
    pub mixture_n_init: Vec<usize>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            k_range: 2..=8,
            seed: 42,
            n_init: 10,
            max_iterations: 300,
            tolerance: 1e-4,
            epsilons: (0..=12).map(|step| 1.0 + 0.25 * step as f64).collect(),
            min_points: vec![10, 15, 20, 25],
            hierarchical_k: 2..=7,
            linkage: Linkage::Ward,
            mixture_components: (2..=6).collect(),
            mixture_n_init: (2..=6).collect(),
        }
    }
}

/// One point of the inertia curve
#[derive(Debug, Clone, PartialEq)]
pub struct ElbowPoint {
    pub k: usize,
    pub inertia: Result<f64, FitError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElbowSelection {
    pub curve: Vec<ElbowPoint>,
    pub k: usize,
    pub clustering: Clustering,
}

/// Why a grid cell produced no score
#[derive(Debug, Clone, PartialEq)]
pub enum CellRejection {
    Fit(FitError),
    TooFewClusters { found: usize },
    Undefined(ValidationError),
}

impl CellRejection {
    pub fn reason(&self) -> String {
        match self {
            CellRejection::Fit(err) => format!("fit failed: {err}"),
            CellRejection::TooFewClusters { found } => format!("too few clusters: {found}"),
            CellRejection::Undefined(err) => format!("score undefined: {err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellOutcome {
    Scored { clustering: Clustering, score: f64 },
    Rejected(CellRejection),
}

impl CellOutcome {
    pub fn score(&self) -> Option<f64> {
        match self {
            CellOutcome::Scored { score, .. } => Some(*score),
            CellOutcome::Rejected(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub algorithm: Algorithm,
    pub outcome: CellOutcome,
}

/// All cells of one variant's grid, in grid order
#[derive(Debug, Clone, PartialEq)]
pub struct SweepReport {
    pub variant: Variant,
    pub cells: Vec<Cell>,
    /// Index of the highest-scoring cell
    pub best: Option<usize>,
}

impl SweepReport {
    fn new(variant: Variant, cells: Vec<Cell>) -> Self {
        let best = best_index(cells.iter().map(|cell| cell.outcome.score()));
        Self {
            variant,
            cells,
            best,
        }
    }

    pub fn best_cell(&self) -> Option<&Cell> {
        self.best.map(|idx| &self.cells[idx])
    }

    pub fn rejected(&self) -> usize {
        self.cells
            .iter()
            .filter(|cell| matches!(cell.outcome, CellOutcome::Rejected(_)))
            .count()
    }
}

/// Best clustering of one variant with its score
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub clustering: Clustering,
    pub score: f64,
}

impl Candidate {
    pub fn variant(&self) -> Variant {
        self.clustering.algorithm.variant()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSelection {
    pub elbow: Result<ElbowSelection, FitError>,
    /// Elbow-selected partitioning cell followed by the three grid sweeps
    pub sweeps: Vec<SweepReport>,
    pub best: Candidate,
}

impl ModelSelection {
    /// Best candidate of each variant, in variant order
    pub fn candidates(&self) -> Vec<Candidate> {
        self.sweeps
            .iter()
            .filter_map(|sweep| sweep.best_cell())
            .filter_map(|cell| match &cell.outcome {
                CellOutcome::Scored { clustering, score } => Some(Candidate {
                    clustering: clustering.clone(),
                    score: *score,
                }),
                CellOutcome::Rejected(_) => None,
            })
            .collect()
    }
}

/// Index of the highest score; ties keep the earliest
fn best_index(scores: impl IntoIterator<Item = Option<f64>>) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, score) in scores.into_iter().enumerate() {
        let Some(score) = score else { continue };
        match best {
            Some((_, current)) if score <= current => {}
            _ => best = Some((idx, score)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// Elbow of a decreasing cost curve: the point farthest from the chord joining
/// the first and last points, after min-max normalising both axes.
/// Ties go to the smaller k.
pub fn elbow_k(points: &[(usize, f64)]) -> Option<usize> {
    let (first, last) = match points {
        [] => return None,
        [only] => return Some(only.0),
        [first, .., last] => (first, last),
    };

    let (k_min, k_max) = (first.0 as f64, last.0 as f64);
    let (cost_min, cost_max) = points
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &(_, c)| {
            (lo.min(c), hi.max(c))
        });
    let normalise = |value: f64, lo: f64, hi: f64| {
        if hi > lo {
            (value - lo) / (hi - lo)
        } else {
            0.0
        }
    };
    let norm = |&(k, cost): &(usize, f64)| {
        (
            normalise(k as f64, k_min, k_max),
            normalise(cost, cost_min, cost_max),
        )
    };

    let (x0, y0) = norm(first);
    let (x1, y1) = norm(last);
    let chord = ((x1 - x0).powi(2) + (y1 - y0).powi(2)).sqrt();

    let mut best = (first.0, f64::NEG_INFINITY);
    for point in points {
        let (x, y) = norm(point);
        let distance = if chord > 0.0 {
            ((y1 - y0) * x - (x1 - x0) * y + x1 * y0 - y1 * x0).abs() / chord
        } else {
            0.0
        };
        if distance > best.1 + 1e-12 {
            best = (point.0, distance);
        }
    }
    Some(best.0)
}

fn score_clustering(clustering: Clustering, features: &Array2<f64>) -> CellOutcome {
    match calinski_harabasz(features, &clustering.labels) {
        Ok(score) => CellOutcome::Scored { clustering, score },
        Err(ValidationError::TooFewClusters { found }) => {
            CellOutcome::Rejected(CellRejection::TooFewClusters { found })
        }
        Err(err) => CellOutcome::Rejected(CellRejection::Undefined(err)),
    }
}

/// Fit and score one grid cell
fn run_cell(algorithm: &Algorithm, features: &Array2<f64>) -> Cell {
    record_cell(algorithm, algorithm.fit(features), features)
}

fn record_cell(algorithm: &Algorithm, fit: Result<Clustering, FitError>, features: &Array2<f64>) -> Cell {
    let outcome = match fit {
        Err(err) => CellOutcome::Rejected(CellRejection::Fit(err)),
        Ok(clustering) => score_clustering(clustering, features),
    };

    match &outcome {
        CellOutcome::Scored { score, clustering } => {
            debug!(%algorithm, score, clusters = clustering.n_clusters, noise = clustering.n_noise, "cell scored")
        }
        CellOutcome::Rejected(rejection) => debug!(%algorithm, reason = %rejection.reason(), "cell rejected"),
    }
    Cell {
        algorithm: algorithm.clone(),
        outcome,
    }
}

/// Hierarchical cells share one dendrogram per linkage and only differ in the cut
fn hierarchical_cells(grid: &[Algorithm], features: &Array2<f64>) -> Vec<Cell> {
    let mut linkages: Vec<Linkage> = Vec::new();
    for algorithm in grid {
        if let Algorithm::Hierarchical(params) = algorithm {
            if !linkages.contains(&params.linkage) {
                linkages.push(params.linkage);
            }
        }
    }
    let dendrograms: Vec<Dendrogram> = linkages
        .iter()
        .map(|&linkage| {
            debug!(linkage = linkage.name(), points = features.nrows(), "building dendrogram");
            Dendrogram::build(features, linkage)
        })
        .collect();

    grid.par_iter()
        .map(|algorithm| match algorithm {
            Algorithm::Hierarchical(params) => match dendrograms.iter().find(|d| d.linkage() == params.linkage) {
                Some(dendrogram) => record_cell(algorithm, dendrogram.cut(params.k), features),
                None => run_cell(algorithm, features),
            },
            _ => run_cell(algorithm, features),
        })
        .collect()
}

pub struct ModelSelector {
    config: SelectorConfig,
}

impl ModelSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    fn partitioning(&self, k: usize) -> PartitioningParams {
        PartitioningParams {
            k,
            n_init: self.config.n_init,
            max_iterations: self.config.max_iterations,
            tolerance: self.config.tolerance,
            seed: self.config.seed,
        }
    }

    /// Grid of one variant in evaluation order
    pub fn grid(&self, variant: Variant) -> Vec<Algorithm> {
        let config = &self.config;
        match variant {
            Variant::Partitioning => config
                .k_range
                .clone()
                .map(|k| Algorithm::Partitioning(self.partitioning(k)))
                .collect(),
            Variant::Density => config
                .epsilons
                .iter()
                .flat_map(|&epsilon| {
                    config.min_points.iter().map(move |&min_points| {
                        Algorithm::Density(DensityParams {
                            epsilon,
                            min_points,
                        })
                    })
                })
                .collect(),
            Variant::Hierarchical => config
                .hierarchical_k
                .clone()
                .map(|k| {
                    Algorithm::Hierarchical(HierarchicalParams {
                        k,
                        linkage: config.linkage,
                    })
                })
                .collect(),
            Variant::Probabilistic => config
                .mixture_components
                .iter()
                .flat_map(|&components| {
                    config.mixture_n_init.iter().map(move |&n_init| {
                        Algorithm::Probabilistic(MixtureParams {
                            components,
                            n_init,
                            max_iterations: config.max_iterations.max(1000),
                            tolerance: config.tolerance,
                            seed: config.seed,
                        })
                    })
                })
                .collect(),
        }
    }

    /// Sweep k over `k_range` and pick the elbow of the inertia curve
    pub fn elbow(&self, features: &Array2<f64>) -> Result<ElbowSelection, FitError> {
        let fits: Vec<(usize, Result<Clustering, FitError>)> = self
            .config
            .k_range
            .clone()
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|k| (k, self.partitioning(k).fit(features)))
            .collect();

        let valid: Vec<(usize, f64)> = fits
            .iter()
            .filter_map(|(k, fit)| {
                let inertia = fit.as_ref().ok()?.inertia?;
                Some((*k, inertia))
            })
            .collect();
        let chosen = elbow_k(&valid).ok_or(FitError::NoValidCandidate {
            variant: Variant::Partitioning.name(),
        })?;

        let mut clustering = None;
        let mut curve = Vec::with_capacity(fits.len());
        for (k, fit) in fits {
            match fit {
                Ok(fitted) => {
                    curve.push(ElbowPoint {
                        k,
                        inertia: fitted.inertia.ok_or(FitError::Backend("missing inertia".into())),
                    });
                    if k == chosen {
                        clustering = Some(fitted);
                    }
                }
                Err(err) => curve.push(ElbowPoint { k, inertia: Err(err) }),
            }
        }
        let clustering = clustering.ok_or(FitError::NoValidCandidate {
            variant: Variant::Partitioning.name(),
        })?;

        debug!(k = chosen, "elbow selected");
        Ok(ElbowSelection {
            curve,
            k: chosen,
            clustering,
        })
    }

    /// Fit and score every cell of a variant's grid
    pub fn sweep(&self, variant: Variant, features: &Array2<f64>) -> SweepReport {
        let grid = self.grid(variant);
        let cells: Vec<Cell> = match variant {
            Variant::Hierarchical => hierarchical_cells(&grid, features),
            _ => grid.par_iter().map(|algorithm| run_cell(algorithm, features)).collect(),
        };
        let report = SweepReport::new(variant, cells);
        info!(
            %variant,
            cells = report.cells.len(),
            rejected = report.rejected(),
            best = ?report.best_cell().and_then(|cell| cell.outcome.score()),
            "sweep finished"
        );
        report
    }

    /// Elbow for partitioning, grid search for the rest, best score overall
    pub fn select(&self, features: &Array2<f64>) -> Result<ModelSelection, FitError> {
        let elbow = self.elbow(features);

        let partitioning_cells = match &elbow {
            Ok(selection) => vec![Cell {
                algorithm: selection.clustering.algorithm.clone(),
                outcome: score_clustering(selection.clustering.clone(), features),
            }],
            Err(_) => Vec::new(),
        };
        let mut sweeps = vec![SweepReport::new(Variant::Partitioning, partitioning_cells)];
        for variant in [Variant::Density, Variant::Hierarchical, Variant::Probabilistic] {
            sweeps.push(self.sweep(variant, features));
        }

        let scores: Vec<Option<f64>> = sweeps
            .iter()
            .map(|sweep| sweep.best_cell().and_then(|cell| cell.outcome.score()))
            .collect();
        let winner = best_index(scores).ok_or(FitError::NoValidCandidate { variant: "any" })?;
        let best = match sweeps[winner].best_cell().map(|cell| &cell.outcome) {
            Some(CellOutcome::Scored { clustering, score }) => Candidate {
                clustering: clustering.clone(),
                score: *score,
            },
            _ => return Err(FitError::NoValidCandidate { variant: "any" }),
        };

        info!(algorithm = %best.clustering.algorithm, score = best.score, "model selected");
        Ok(ModelSelection { elbow, sweeps, best })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::four_blobs;

    fn small_config() -> SelectorConfig {
        SelectorConfig {
            n_init: 3,
            epsilons: vec![0.0, 2.0, 4.0],
            min_points: vec![5],
            hierarchical_k: 2..=5,
            mixture_components: vec![2, 4],
            mixture_n_init: vec![2],
            ..SelectorConfig::default()
        }
    }

    #[test]
    fn test_elbow_of_a_sharp_knee() {
        let curve = [(2, 100.0), (3, 50.0), (4, 10.0), (5, 9.0), (6, 8.5), (7, 8.0)];
        assert_eq!(elbow_k(&curve), Some(4));
    }

    #[test]
    fn test_elbow_edge_cases() {
        assert_eq!(elbow_k(&[]), None);
        assert_eq!(elbow_k(&[(5, 3.0)]), Some(5));
        // a straight line has no knee, the smallest k wins
        assert_eq!(elbow_k(&[(2, 3.0), (3, 2.0), (4, 1.0)]), Some(2));
        assert_eq!(elbow_k(&[(2, 1.0), (3, 1.0), (4, 1.0)]), Some(2));
    }

    #[test]
    fn test_best_index_keeps_earliest_tie() {
        assert_eq!(best_index([None, Some(2.0), Some(5.0), Some(5.0)]), Some(2));
        assert_eq!(best_index([None, None]), None);
    }

    #[test]
    fn test_default_grids_match_sizes() {
        let selector = ModelSelector::new(SelectorConfig::default());
        assert_eq!(selector.grid(Variant::Partitioning).len(), 7);
        assert_eq!(selector.grid(Variant::Density).len(), 13 * 4);
        assert_eq!(selector.grid(Variant::Hierarchical).len(), 6);
        assert_eq!(selector.grid(Variant::Probabilistic).len(), 25);

        let epsilons = &selector.config().epsilons;
        assert_eq!(epsilons.first(), Some(&1.0));
        assert_eq!(epsilons.last(), Some(&4.0));
    }

    #[test]
    fn test_elbow_recovers_four_blobs() {
        let features = four_blobs(25, 9);
        let selection = ModelSelector::new(small_config()).elbow(&features).unwrap();

        assert!((3..=5).contains(&selection.k), "elbow chose k = {}", selection.k);
        assert_eq!(selection.curve.len(), 7);
        assert_eq!(selection.clustering.n_clusters, selection.k);
    }

    #[test]
    fn test_elbow_without_valid_points_fails() {
        let features = ndarray::array![[0.0, 0.0], [1.0, 1.0]];
        let config = SelectorConfig {
            k_range: 3..=4,
            ..small_config()
        };
        let err = ModelSelector::new(config).elbow(&features).unwrap_err();
        assert_eq!(err, FitError::NoValidCandidate { variant: "kmeans" });
    }

    #[test]
    fn test_density_sweep_records_rejected_cells() {
        let features = four_blobs(25, 9);
        let report = ModelSelector::new(small_config()).sweep(Variant::Density, &features);

        assert_eq!(report.cells.len(), 3);
        // epsilon 0 labels everything noise
        assert!(matches!(
            report.cells[0].outcome,
            CellOutcome::Rejected(CellRejection::TooFewClusters { found: 0 })
        ));
        let best = report.best_cell().unwrap();
        assert!(best.outcome.score().is_some());
    }

    #[test]
    fn test_selection_is_deterministic() {
        let features = four_blobs(20, 4);
        let selector = ModelSelector::new(small_config());
        let first = selector.select(&features).unwrap();
        let second = selector.select(&features).unwrap();

        assert_eq!(first.best, second.best);
        assert_eq!(first.sweeps.len(), 4);
        assert_eq!(first.candidates().len(), second.candidates().len());
        assert!(first.best.score > 0.0);
        assert!(first
            .candidates()
            .iter()
            .all(|candidate| candidate.score <= first.best.score));
    }

    #[test]
    fn test_hierarchical_sweep_matches_individual_fits() {
        let features = four_blobs(15, 6);
        let selector = ModelSelector::new(small_config());
        let report = selector.sweep(Variant::Hierarchical, &features);

        let grid = selector.grid(Variant::Hierarchical);
        assert_eq!(report.cells.len(), grid.len());
        for (cell, algorithm) in report.cells.iter().zip(&grid) {
            assert_eq!(&cell.algorithm, algorithm);
            assert_eq!(cell, &run_cell(algorithm, &features));
        }
    }

    #[test]
    fn test_selection_does_not_depend_on_thread_count() {
        let features = four_blobs(20, 4);
        let selector = ModelSelector::new(small_config());
        let select_with = |threads: usize| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .unwrap()
                .install(|| selector.select(&features).unwrap())
        };

        let single = select_with(1);
        let many = select_with(8);
        assert_eq!(single.best, many.best);
        assert_eq!(single.sweeps, many.sweeps);
        assert_eq!(single.elbow, many.elbow);
    }
}
