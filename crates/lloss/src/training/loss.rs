//! Joint objective: supervised cross-entropy plus the loss-prediction,
//! metric-learning and distillation terms.
//!
//! All losses are generic over `B: Backend` and operate on burn tensors.
//! Objectives are resolved from the configuration once, when the
//! [`JointLoss`] is built, and called through trait objects per batch.

use burn::prelude::*;
use burn::tensor::activation::log_softmax;
use burn::tensor::TensorData;

use crate::config::{ExperimentConfig, RankingLossKind};
use crate::error::{ActiveLearningError, Result};
use crate::model::{BackboneOutput, LossNet};
use crate::training::metric::{
    build_metric_objective, log_ratio_loss, loss_to_distance, MetricObjective, TripletMarginLoss,
};

/// Fixed weight of the distillation term.
pub const DISTILLATION_WEIGHT: f64 = 0.1;

/// Unreduced cross-entropy: one loss per example, shape `(batch,)`.
pub fn per_example_cross_entropy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
    let log_probs = log_softmax(logits, 1);
    log_probs
        .gather(1, targets.unsqueeze_dim::<2>(1))
        .squeeze::<1>(1)
        .neg()
}

/// Reduction applied to per-pair ranking losses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Mean over the `B` pairs, shape `(1,)`.
    Mean,
    /// One loss per pair, shape `(B,)`.
    None,
}

/// Pairwise margin ranking loss between predicted and true per-example losses.
///
/// A batch of `2B` is split by index reversal: example `i` is paired with
/// `2B-1-i`. For each pair the sign of the true loss difference (ties count as
/// positive) decides which prediction must be larger by at least `margin`:
/// `max(0, margin - sign * (pred_i - pred_j))`. Only the ordering of
/// `target_loss` is used and it is detached from the graph.
///
/// # Errors
/// [`ActiveLearningError::Configuration`] if the batch size is odd or the two
/// inputs differ in length.
pub fn margin_ranking_loss<B: Backend>(
    pred_loss: Tensor<B, 1>,
    target_loss: Tensor<B, 1>,
    margin: f64,
    reduction: Reduction,
) -> Result<Tensor<B, 1>> {
    let [n] = pred_loss.dims();
    if n % 2 != 0 {
        return Err(ActiveLearningError::config(format!(
            "pairwise ranking needs an even batch, got {n}"
        )));
    }
    if target_loss.dims() != [n] {
        return Err(ActiveLearningError::config(format!(
            "predicted ({n}) and target ({:?}) losses differ in length",
            target_loss.dims()
        )));
    }
    let device = pred_loss.device();
    let half = n / 2;

    let reversed: Vec<i64> = (0..n as i64).rev().collect();
    let reversed = Tensor::<B, 1, Int>::from_data(TensorData::new(reversed, [n]), &device);

    let target_loss = target_loss.detach();
    let pred_diff = (pred_loss.clone() - pred_loss.select(0, reversed.clone())).slice([0..half]);
    let target_diff = (target_loss.clone() - target_loss.select(0, reversed)).slice([0..half]);

    let sign = target_diff.greater_equal_elem(0.0).float() * 2.0 - 1.0;
    let per_pair = (sign * pred_diff).neg().add_scalar(margin).clamp_min(0.0);

    Ok(match reduction {
        Reduction::Mean => per_pair.mean(),
        Reduction::None => per_pair,
    })
}

/// Objective that trains the loss-prediction module against true losses.
pub trait LossPredictionObjective<B: Backend>: Send + Sync {
    fn name(&self) -> &'static str;

    /// Scalar loss, shape `(1,)`. `target_loss` is the unreduced supervised
    /// loss; implementations must not propagate gradients through it.
    fn forward(&self, pred_loss: Tensor<B, 1>, target_loss: Tensor<B, 1>, labels: &[usize]) -> Result<Tensor<B, 1>>;
}

/// [`margin_ranking_loss`] with mean reduction.
#[derive(Debug, Clone)]
pub struct MarginRankingObjective {
    pub margin: f64,
}

impl<B: Backend> LossPredictionObjective<B> for MarginRankingObjective {
    fn name(&self) -> &'static str {
        "MarginRanking"
    }

    fn forward(&self, pred_loss: Tensor<B, 1>, target_loss: Tensor<B, 1>, _labels: &[usize]) -> Result<Tensor<B, 1>> {
        margin_ranking_loss(pred_loss, target_loss, self.margin, Reduction::Mean)
    }
}

/// Pointwise regression penalty used by [`RegressionObjective`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegressionKind {
    Mse,
    L1,
    SmoothL1,
}

/// Regress predicted losses directly onto the (detached) true losses.
#[derive(Debug, Clone)]
pub struct RegressionObjective {
    pub kind: RegressionKind,
    pub weight: f64,
}

impl<B: Backend> LossPredictionObjective<B> for RegressionObjective {
    fn name(&self) -> &'static str {
        match self.kind {
            RegressionKind::Mse => "MSE",
            RegressionKind::L1 => "L1",
            RegressionKind::SmoothL1 => "SmoothL1",
        }
    }

    fn forward(&self, pred_loss: Tensor<B, 1>, target_loss: Tensor<B, 1>, _labels: &[usize]) -> Result<Tensor<B, 1>> {
        let diff = pred_loss - target_loss.detach();
        let per_example = match self.kind {
            RegressionKind::Mse => diff.powf_scalar(2.0),
            RegressionKind::L1 => diff.abs(),
            RegressionKind::SmoothL1 => {
                let abs = diff.abs();
                let quadratic = abs.clone().lower_elem(1.0).float();
                let linear = quadratic.clone().neg().add_scalar(1.0);
                quadratic * abs.clone().powf_scalar(2.0) * 0.5 + linear * (abs - 0.5)
            }
        };
        Ok(per_example.mean() * self.weight)
    }
}

/// Triplet margin loss on the predicted scores, treated as 1-d embeddings
/// grouped by class label.
#[derive(Debug, Clone)]
pub struct ScoreTripletObjective {
    pub triplet: TripletMarginLoss,
}

impl<B: Backend> LossPredictionObjective<B> for ScoreTripletObjective {
    fn name(&self) -> &'static str {
        "Triplet"
    }

    fn forward(&self, pred_loss: Tensor<B, 1>, _target_loss: Tensor<B, 1>, labels: &[usize]) -> Result<Tensor<B, 1>> {
        Ok(MetricObjective::<B>::forward(
            &self.triplet,
            pred_loss.unsqueeze_dim::<2>(1),
            labels,
        ))
    }
}

/// Resolve the configured ranking mode. `None` disables the term.
pub fn build_ranking_objective<B: Backend>(config: &ExperimentConfig) -> Option<Box<dyn LossPredictionObjective<B>>> {
    let regression = |kind| -> Box<dyn LossPredictionObjective<B>> {
        Box::new(RegressionObjective {
            kind,
            weight: config.regression_weight,
        })
    };
    match config.ranking_loss {
        RankingLossKind::None => None,
        RankingLossKind::MarginRanking => Some(Box::new(MarginRankingObjective {
            margin: config.margin,
        })),
        RankingLossKind::Mse => Some(regression(RegressionKind::Mse)),
        RankingLossKind::L1 => Some(regression(RegressionKind::L1)),
        RankingLossKind::SmoothL1 => Some(regression(RegressionKind::SmoothL1)),
        RankingLossKind::Triplet => Some(Box::new(ScoreTripletObjective {
            triplet: TripletMarginLoss { margin: 0.1 },
        })),
    }
}

/// Whether backbone features feeding the loss-prediction module stay attached
/// to the backbone's graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradientMode {
    /// Module gradients flow back into the backbone.
    Joint,
    /// Features are detached: the module keeps learning, the backbone only
    /// sees the supervised gradient.
    AuxiliaryOnly,
}

impl GradientMode {
    /// `AuxiliaryOnly` once `epoch` is past `epoch_loss`.
    pub fn for_epoch(epoch: usize, epoch_loss: usize) -> Self {
        if epoch > epoch_loss {
            Self::AuxiliaryOnly
        } else {
            Self::Joint
        }
    }
}

/// Scalar values of every loss component for one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct LossBreakdown {
    pub supervised: f64,
    pub ranking: f64,
    pub metric: f64,
    pub distillation: f64,
    pub total: f64,
}

/// Loss tensors of one forward pass. `total` is what gets backpropagated.
pub struct JointLossOutput<B: Backend> {
    pub total: Tensor<B, 1>,
    pub supervised: Tensor<B, 1>,
    pub ranking: Option<Tensor<B, 1>>,
    pub metric: Option<Tensor<B, 1>>,
    pub distillation: Option<Tensor<B, 1>>,
}

impl<B: Backend> JointLossOutput<B> {
    /// Read every component back to the host.
    pub fn breakdown(&self) -> LossBreakdown {
        let scalar = |t: &Tensor<B, 1>| -> f64 { t.clone().into_scalar().elem() };
        LossBreakdown {
            supervised: scalar(&self.supervised),
            ranking: self.ranking.as_ref().map(scalar).unwrap_or(0.0),
            metric: self.metric.as_ref().map(scalar).unwrap_or(0.0),
            distillation: self.distillation.as_ref().map(scalar).unwrap_or(0.0),
            total: scalar(&self.total),
        }
    }
}

/// The combined training objective for backbone and loss-prediction module.
///
/// `total = supervised + ranking_weight * ranking + metric_weight * metric
///          + 0.1 * distillation`
pub struct JointLoss<B: Backend> {
    ranking: Option<Box<dyn LossPredictionObjective<B>>>,
    ranking_weight: f64,
    metric: Option<Box<dyn MetricObjective<B>>>,
    metric_weight: f64,
    distillation: bool,
}

impl<B: Backend> JointLoss<B> {
    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self {
            ranking: build_ranking_objective(config),
            ranking_weight: config.ranking_weight,
            metric: build_metric_objective(config.metric_loss),
            metric_weight: config.metric_weight,
            distillation: config.distillation,
        }
    }

    /// Names of the active auxiliary terms, for logging.
    pub fn describe(&self) -> String {
        format!(
            "ranking={} (w={}), metric={} (w={}), distillation={}",
            self.ranking.as_ref().map(|r| r.name()).unwrap_or("None"),
            self.ranking_weight,
            self.metric.as_ref().map(|m| m.name()).unwrap_or("None"),
            self.metric_weight,
            self.distillation,
        )
    }

    /// Score the batch with `module` and combine all terms.
    ///
    /// In [`GradientMode::AuxiliaryOnly`] the features are detached before the
    /// module sees them.
    pub fn forward(
        &self,
        output: BackboneOutput<B>,
        module: &LossNet<B>,
        targets: Tensor<B, 1, Int>,
        labels: &[usize],
        mode: GradientMode,
    ) -> Result<JointLossOutput<B>> {
        let BackboneOutput {
            logits,
            features,
            representation,
        } = output;

        let target_loss = per_example_cross_entropy(logits, targets);
        let supervised = target_loss.clone().mean();

        let features = match mode {
            GradientMode::Joint => features,
            GradientMode::AuxiliaryOnly => features.map(Tensor::detach),
        };
        let scored = module.forward(features);

        let ranking = self
            .ranking
            .as_ref()
            .map(|objective| objective.forward(scored.scores.clone(), target_loss, labels))
            .transpose()?;
        let metric = self
            .metric
            .as_ref()
            .map(|objective| objective.forward(scored.embedding, labels));
        let distillation = self.distillation.then(|| {
            let target_dist = loss_to_distance(scored.scores);
            log_ratio_loss(representation.detach(), target_dist)
        });

        let mut total = supervised.clone();
        if let Some(r) = &ranking {
            total = total + r.clone() * self.ranking_weight;
        }
        if let Some(m) = &metric {
            total = total + m.clone() * self.metric_weight;
        }
        if let Some(d) = &distillation {
            total = total + d.clone() * DISTILLATION_WEIGHT;
        }

        Ok(JointLossOutput {
            total,
            supervised,
            ranking,
            metric,
            distillation,
        })
    }
}
