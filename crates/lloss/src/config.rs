//! Experiment configuration: acquisition budget, training schedule and the
//! choice of auxiliary objectives.
//!
//! Deserializes from the `[experiment]` table of the runner's TOML file. Every
//! field has a default matching the reference CIFAR-10 experiment, so an empty
//! table is a valid (if slow) configuration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ActiveLearningError, Result};

/// How the loss-prediction module is trained against the true per-example loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RankingLossKind {
    /// No loss-prediction objective; the module is not trained.
    None,
    /// Pairwise margin ranking on predicted vs. true loss ordering.
    MarginRanking,
    /// Mean squared error regression onto the true loss.
    Mse,
    /// Mean absolute error regression onto the true loss.
    L1,
    /// Huber (beta = 1) regression onto the true loss.
    SmoothL1,
    /// Triplet margin loss on the predicted scores grouped by class label.
    Triplet,
}

impl fmt::Display for RankingLossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "None",
            Self::MarginRanking => "MarginRanking",
            Self::Mse => "MSE",
            Self::L1 => "L1",
            Self::SmoothL1 => "SmoothL1",
            Self::Triplet => "Triplet",
        };
        f.write_str(name)
    }
}

impl FromStr for RankingLossKind {
    type Err = ActiveLearningError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "None" | "none" => Ok(Self::None),
            "MarginRanking" | "MarginRankingLoss" => Ok(Self::MarginRanking),
            "MSE" | "Mse" => Ok(Self::Mse),
            "L1" => Ok(Self::L1),
            "SmoothL1" => Ok(Self::SmoothL1),
            "Triplet" => Ok(Self::Triplet),
            other => Err(ActiveLearningError::config(format!(
                "unknown ranking loss kind '{other}'"
            ))),
        }
    }
}

impl TryFrom<String> for RankingLossKind {
    type Error = ActiveLearningError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<RankingLossKind> for String {
    fn from(kind: RankingLossKind) -> Self {
        kind.to_string()
    }
}

/// Metric-learning objective applied to the loss-prediction module's embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MetricLossKind {
    None,
    TripletMargin,
    NPairs,
    Nca,
    GeneralizedLiftedStructure,
    NtXent,
    Contrastive,
}

impl fmt::Display for MetricLossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "None",
            Self::TripletMargin => "TripletMargin",
            Self::NPairs => "NPairs",
            Self::Nca => "NCA",
            Self::GeneralizedLiftedStructure => "GeneralizedLiftedStructure",
            Self::NtXent => "NTXent",
            Self::Contrastive => "Contrastive",
        };
        f.write_str(name)
    }
}

impl FromStr for MetricLossKind {
    type Err = ActiveLearningError;

    fn from_str(s: &str) -> Result<Self> {
        // Long names are the ones used by the metric-learning library the
        // reference experiment was configured with.
        match s {
            "None" | "none" => Ok(Self::None),
            "TripletMargin" | "TripletMarginLoss" => Ok(Self::TripletMargin),
            "NPairs" | "NPairsLoss" => Ok(Self::NPairs),
            "NCA" | "NCALoss" => Ok(Self::Nca),
            "GeneralizedLiftedStructure" | "GeneralizedLiftedStructureLoss" => {
                Ok(Self::GeneralizedLiftedStructure)
            }
            "NTXent" | "NTXentLoss" => Ok(Self::NtXent),
            "Contrastive" | "ContrastiveLoss" => Ok(Self::Contrastive),
            other => Err(ActiveLearningError::config(format!(
                "unknown metric loss kind '{other}'"
            ))),
        }
    }
}

impl TryFrom<String> for MetricLossKind {
    type Error = ActiveLearningError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<MetricLossKind> for String {
    fn from(kind: MetricLossKind) -> Self {
        kind.to_string()
    }
}

/// SGD settings shared by the backbone and the loss-prediction module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSettings {
    /// Base learning rate for both models.
    #[serde(default = "default_lr")]
    pub lr: f64,
    /// SGD momentum.
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    /// Weight decay for the backbone.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Weight decay for the loss-prediction module.
    #[serde(default = "default_weight_decay")]
    pub module_weight_decay: f64,
    /// Gradient norm bound for the loss-prediction module when clipping is on.
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,
    /// Multiplicative learning-rate decay applied at every milestone.
    #[serde(default = "default_lr_gamma")]
    pub lr_gamma: f64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            momentum: default_momentum(),
            weight_decay: default_weight_decay(),
            module_weight_decay: default_weight_decay(),
            max_grad_norm: default_max_grad_norm(),
            lr_gamma: default_lr_gamma(),
        }
    }
}

/// Full experiment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Independent repetitions, each with its own seed.
    #[serde(default = "default_trials")]
    pub trials: usize,
    /// Acquisition rounds per trial.
    #[serde(default = "default_cycles")]
    pub cycles: usize,
    /// Size of the random initial labeled set.
    #[serde(default = "default_addendum")]
    pub initial_query: usize,
    /// Examples moved from unlabeled to labeled per cycle.
    #[serde(default = "default_addendum")]
    pub addendum: usize,
    /// Size of the random candidate subpool scored each cycle.
    #[serde(default = "default_subset_size")]
    pub subset_size: usize,
    /// Training epochs per cycle.
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Epoch after which module features are detached from the backbone graph.
    #[serde(default = "default_epoch_loss")]
    pub epoch_loss: usize,
    /// Ascending epochs at which learning rates decay by `lr_gamma`.
    #[serde(default = "default_milestones")]
    pub milestones: Vec<usize>,
    /// Minibatch size for training and scoring.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Margin of the pairwise ranking loss.
    #[serde(default = "default_margin")]
    pub margin: f64,
    /// Weight of the loss-prediction term.
    #[serde(default = "default_weight")]
    pub ranking_weight: f64,
    /// Extra scale applied by the regression ranking modes (MSE, L1, SmoothL1).
    #[serde(default = "default_weight")]
    pub regression_weight: f64,
    /// Weight of the metric-learning term.
    #[serde(default = "default_weight")]
    pub metric_weight: f64,
    /// Loss-prediction objective.
    #[serde(default = "default_ranking_loss")]
    pub ranking_loss: RankingLossKind,
    /// Metric-learning objective on module embeddings.
    #[serde(default = "default_metric_loss")]
    pub metric_loss: MetricLossKind,
    /// Enable the log-ratio distance distillation term.
    #[serde(default)]
    pub distillation: bool,
    /// Clip the loss-prediction module's gradient norm.
    #[serde(default)]
    pub gradient_clip: bool,
    /// Score and select at the first milestone instead of after the last epoch.
    #[serde(default)]
    pub mid_cycle_pick: bool,
    /// Added to the trial index to form each trial's seed.
    #[serde(default)]
    pub seed: u64,
    /// Optimizer steps between observability records.
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    #[serde(default)]
    pub optimizer: OptimizerSettings,
}

fn default_trials() -> usize {
    3
}
fn default_cycles() -> usize {
    10
}
fn default_addendum() -> usize {
    1_000
}
fn default_subset_size() -> usize {
    10_000
}
fn default_epochs() -> usize {
    200
}
fn default_epoch_loss() -> usize {
    120
}
fn default_milestones() -> Vec<usize> {
    vec![160]
}
fn default_batch_size() -> usize {
    128
}
fn default_margin() -> f64 {
    1.0
}
fn default_weight() -> f64 {
    1.0
}
fn default_ranking_loss() -> RankingLossKind {
    RankingLossKind::MarginRanking
}
fn default_metric_loss() -> MetricLossKind {
    MetricLossKind::None
}
fn default_log_interval() -> usize {
    10
}
fn default_lr() -> f64 {
    0.1
}
fn default_momentum() -> f64 {
    0.9
}
fn default_weight_decay() -> f64 {
    5e-4
}
fn default_max_grad_norm() -> f64 {
    1.0
}
fn default_lr_gamma() -> f64 {
    0.1
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            trials: default_trials(),
            cycles: default_cycles(),
            initial_query: default_addendum(),
            addendum: default_addendum(),
            subset_size: default_subset_size(),
            epochs: default_epochs(),
            epoch_loss: default_epoch_loss(),
            milestones: default_milestones(),
            batch_size: default_batch_size(),
            margin: default_margin(),
            ranking_weight: default_weight(),
            regression_weight: default_weight(),
            metric_weight: default_weight(),
            ranking_loss: default_ranking_loss(),
            metric_loss: default_metric_loss(),
            distillation: false,
            gradient_clip: false,
            mid_cycle_pick: false,
            seed: 0,
            log_interval: default_log_interval(),
            optimizer: OptimizerSettings::default(),
        }
    }
}

impl ExperimentConfig {
    /// Check the configuration against a pool of `pool_size` examples.
    ///
    /// Runs before any model is constructed; every failure is a
    /// [`ActiveLearningError::Configuration`].
    pub fn validate(&self, pool_size: usize) -> Result<()> {
        let err = |msg: String| Err(ActiveLearningError::Configuration(msg));

        if self.epochs == 0 {
            return err("epochs must be > 0".into());
        }
        if self.batch_size == 0 {
            return err("batch_size must be > 0".into());
        }
        if self.ranking_loss == RankingLossKind::MarginRanking && self.batch_size % 2 != 0 {
            return err(format!(
                "batch_size {} is odd; pairwise ranking needs even batches",
                self.batch_size
            ));
        }
        if self.addendum == 0 {
            return err("addendum must be > 0".into());
        }
        if self.subset_size == 0 {
            return err("subset_size must be > 0".into());
        }
        if self.addendum > self.subset_size {
            return err(format!(
                "addendum {} exceeds subset_size {}",
                self.addendum, self.subset_size
            ));
        }
        if self.initial_query == 0 {
            return err("initial_query must be > 0".into());
        }
        if self.initial_query >= pool_size {
            return err(format!(
                "initial_query {} must be smaller than the pool size {pool_size}",
                self.initial_query
            ));
        }
        if self.milestones.windows(2).any(|w| w[0] >= w[1]) {
            return err(format!(
                "milestones must be strictly ascending, got {:?}",
                self.milestones
            ));
        }
        if self.mid_cycle_pick {
            match self.milestones.first() {
                Some(&m) if m > 0 && m < self.epochs => {}
                _ => {
                    return err(format!(
                        "mid_cycle_pick needs a first milestone inside (0, {}), got {:?}",
                        self.epochs, self.milestones
                    ))
                }
            }
        }
        if self.log_interval == 0 {
            return err("log_interval must be > 0".into());
        }
        Ok(())
    }

    /// Epoch at which a mid-cycle acquisition happens, if enabled.
    pub fn pick_epoch(&self) -> Option<usize> {
        if self.mid_cycle_pick {
            self.milestones.first().copied()
        } else {
            None
        }
    }
}
