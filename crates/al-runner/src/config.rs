//! TOML config loading for the runner CLI.
//!
//! Deserializes `configs/experiment.toml`, which has `[experiment]`,
//! `[optimizer]` and `[model]` sections, then merges with CLI overrides.

use std::path::Path;

use lloss::{ExperimentConfig, MetricLossKind, OptimizerSettings, RankingLossKind};
use serde::Deserialize;

/// Top-level structure matching `configs/experiment.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct ExperimentToml {
    /// Acquisition budget, schedule and objectives.
    #[serde(default)]
    pub experiment: ExperimentConfig,
    /// SGD settings. Takes precedence over `[experiment.optimizer]`.
    #[serde(default)]
    pub optimizer: Option<OptimizerSettings>,
    /// Backbone and loss-prediction module sizes.
    #[serde(default)]
    pub model: ModelToml,
}

/// Architecture of the reference MLP backbone and of the loss-prediction module.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelToml {
    /// Widths of the four backbone stages.
    #[serde(default = "default_stage_dims")]
    pub stage_dims: Vec<usize>,
    /// Projection width per feature map in the loss-prediction module.
    #[serde(default = "default_interm_dim")]
    pub interm_dim: usize,
}

fn default_stage_dims() -> Vec<usize> {
    vec![128, 128, 64, 64]
}

fn default_interm_dim() -> usize {
    128
}

impl Default for ModelToml {
    fn default() -> Self {
        Self {
            stage_dims: default_stage_dims(),
            interm_dim: default_interm_dim(),
        }
    }
}

impl ModelToml {
    /// The reference backbone has exactly four stages, one per feature map
    /// the loss-prediction module consumes.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.stage_dims.len() != 4 {
            anyhow::bail!(
                "[model] stage_dims needs exactly 4 widths, got {:?}",
                self.stage_dims
            );
        }
        if self.stage_dims.contains(&0) || self.interm_dim == 0 {
            anyhow::bail!(
                "[model] widths must be > 0 (stage_dims {:?}, interm_dim {})",
                self.stage_dims,
                self.interm_dim
            );
        }
        Ok(())
    }
}

impl ExperimentToml {
    /// The experiment config with the top-level `[optimizer]` section folded in.
    pub fn experiment_config(&self) -> ExperimentConfig {
        let mut config = self.experiment.clone();
        if let Some(optimizer) = &self.optimizer {
            config.optimizer = optimizer.clone();
        }
        config
    }
}

/// Load and deserialize an `ExperimentToml` from a TOML file.
pub fn load_experiment_toml(path: &Path) -> anyhow::Result<ExperimentToml> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;
    let config: ExperimentToml = toml::from_str(&contents)?;
    tracing::info!(path = %path.display(), "Loaded experiment config");
    Ok(config)
}

/// CLI flags that override TOML values.
#[derive(Debug, Default, Clone)]
pub struct ExperimentOverrides {
    pub trials: Option<usize>,
    pub cycles: Option<usize>,
    pub epochs: Option<usize>,
    pub initial_query: Option<usize>,
    pub addendum: Option<usize>,
    pub subset_size: Option<usize>,
    pub batch_size: Option<usize>,
    pub seed: Option<u64>,
    pub lr: Option<f64>,
    pub ranking_loss: Option<RankingLossKind>,
    pub metric_loss: Option<MetricLossKind>,
    pub mid_cycle_pick: bool,
    pub distillation: bool,
}

/// Apply CLI overrides on top of a loaded config.
///
/// Priority chain: defaults < TOML values < CLI flags. Boolean flags can only
/// switch a feature on.
pub fn apply_overrides(config: &mut ExperimentConfig, overrides: &ExperimentOverrides) {
    if let Some(n) = overrides.trials {
        config.trials = n;
    }
    if let Some(n) = overrides.cycles {
        config.cycles = n;
    }
    if let Some(n) = overrides.epochs {
        config.epochs = n;
    }
    if let Some(n) = overrides.initial_query {
        config.initial_query = n;
    }
    if let Some(n) = overrides.addendum {
        config.addendum = n;
    }
    if let Some(n) = overrides.subset_size {
        config.subset_size = n;
    }
    if let Some(n) = overrides.batch_size {
        config.batch_size = n;
    }
    if let Some(seed) = overrides.seed {
        config.seed = seed;
    }
    if let Some(lr) = overrides.lr {
        config.optimizer.lr = lr;
    }
    if let Some(kind) = overrides.ranking_loss {
        config.ranking_loss = kind;
    }
    if let Some(kind) = overrides.metric_loss {
        config.metric_loss = kind;
    }
    if overrides.mid_cycle_pick {
        config.mid_cycle_pick = true;
    }
    if overrides.distillation {
        config.distillation = true;
    }
}
