//! Result types for experiment reports and their summaries.

use serde::{Deserialize, Serialize};

use lloss::{ExperimentConfig, TrialReport};

/// Everything written to `report.json` after a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentReport {
    /// Run start, in seconds since the Unix epoch.
    pub started_at_unix: u64,
    /// Resolved configuration after TOML and CLI overrides.
    pub config: ExperimentConfig,
    /// Training pool size.
    pub train_size: usize,
    /// Test set size (0 when no test set was evaluated).
    pub test_size: usize,
    /// Wall-clock duration of the whole run in seconds.
    pub elapsed_secs: f64,
    pub trials: Vec<TrialReport>,
}

/// One row of the per-cycle summary table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle: usize,
    /// Mean labeled set size over the trials that reached this cycle.
    pub mean_labeled: f64,
    /// Mean test accuracy, if any trial evaluated one.
    pub mean_accuracy: Option<f64>,
    /// Trials that reached this cycle.
    pub trials: usize,
}

/// Average labeled size and accuracy per cycle across trials.
///
/// Trials that stopped early only contribute to the cycles they ran.
pub fn summarize_cycles(trials: &[TrialReport]) -> Vec<CycleSummary> {
    let max_cycles = trials.iter().map(|t| t.labeled_sizes.len()).max().unwrap_or(0);
    (0..max_cycles)
        .map(|cycle| {
            let sizes: Vec<usize> = trials.iter().filter_map(|t| t.labeled_sizes.get(cycle).copied()).collect();
            let accs: Vec<f64> = trials.iter().filter_map(|t| t.accuracies.get(cycle).copied()).collect();
            CycleSummary {
                cycle,
                mean_labeled: sizes.iter().sum::<usize>() as f64 / sizes.len().max(1) as f64,
                mean_accuracy: (!accs.is_empty()).then(|| accs.iter().sum::<f64>() / accs.len() as f64),
                trials: sizes.len(),
            }
        })
        .collect()
}
