//! Metric-learning objectives over embedding batches, plus the log-ratio
//! distance distillation loss.
//!
//! All objectives work on dense pairwise matrices. Pair masks are built on the
//! host from the label slice since labels never carry gradients. Embeddings
//! are L2-normalized per row before any distance or similarity is taken, so
//! the fixed margins are measured on the unit sphere.

use burn::prelude::*;
use burn::tensor::TensorData;

use crate::config::MetricLossKind;

/// Keeps `sqrt` differentiable at zero distance.
const DIST_EPS: f64 = 1e-12;
/// Pushes masked-out entries out of a log-sum-exp.
const MASK_PENALTY: f64 = 1e4;

/// Positive/negative pair masks for a labeled batch.
///
/// `positive[i][j] = 1` iff `i != j` and both share a label;
/// `negative[i][j] = 1` iff labels differ.
pub struct PairMasks<B: Backend> {
    pub positive: Tensor<B, 2>,
    pub negative: Tensor<B, 2>,
}

impl<B: Backend> PairMasks<B> {
    pub fn new(labels: &[usize], device: &B::Device) -> Self {
        let n = labels.len();
        let mut positive = vec![0.0_f32; n * n];
        let mut negative = vec![0.0_f32; n * n];
        for i in 0..n {
            for j in 0..n {
                if labels[i] == labels[j] {
                    if i != j {
                        positive[i * n + j] = 1.0;
                    }
                } else {
                    negative[i * n + j] = 1.0;
                }
            }
        }
        Self {
            positive: Tensor::from_data(TensorData::new(positive, [n, n]), device),
            negative: Tensor::from_data(TensorData::new(negative, [n, n]), device),
        }
    }
}

/// `1 - I` for an `n × n` matrix.
pub(crate) fn off_diagonal<B: Backend>(n: usize, device: &B::Device) -> Tensor<B, 2> {
    let data: Vec<f32> = (0..n * n)
        .map(|k| if k / n == k % n { 0.0 } else { 1.0 })
        .collect();
    Tensor::from_data(TensorData::new(data, [n, n]), device)
}

/// Squared Euclidean distances between all rows, `(n, n)`.
pub fn pairwise_sq_distances<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let sq = x.clone().powf_scalar(2.0).sum_dim(1); // (n, 1)
    let gram = x.clone().matmul(x.transpose());
    (sq.clone() + sq.transpose() - gram * 2.0).clamp_min(0.0)
}

/// Each row scaled to unit L2 norm.
pub fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norms = (x.clone().powf_scalar(2.0).sum_dim(1) + DIST_EPS).sqrt();
    x / norms
}

/// Euclidean distances between all rows, `(n, n)`.
pub fn pairwise_distances<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    (pairwise_sq_distances(x) + DIST_EPS).sqrt()
}

/// Row-wise log-sum-exp restricted to `mask`, `(n,)`.
///
/// Rows with an empty mask produce a large negative value; callers exclude
/// them with [`row_has_any`].
fn masked_logsumexp<B: Backend>(x: Tensor<B, 2>, mask: Tensor<B, 2>) -> Tensor<B, 1> {
    let shifted = x + (mask.clone() - 1.0) * MASK_PENALTY;
    let row_max = shifted.clone().max_dim(1).detach();
    let sum = ((shifted - row_max.clone()).exp() * mask).sum_dim(1);
    (sum.clamp_min(1e-30).log() + row_max).squeeze::<1>(1)
}

/// `1.0` for rows of `mask` with at least one entry, else `0.0`.
fn row_has_any<B: Backend>(mask: Tensor<B, 2>) -> Tensor<B, 1> {
    mask.sum_dim(1).squeeze::<1>(1).greater_elem(0.0).float()
}

/// Mean of `values` over entries where `weights` is set; zero if none are.
fn weighted_mean<B: Backend, const D: usize>(values: Tensor<B, D>, weights: Tensor<B, D>) -> Tensor<B, 1> {
    let count = weights.clone().sum().clamp_min(1.0);
    (values * weights).sum() / count
}

/// Mean over the strictly positive entries of `losses`; zero if there are none.
fn avg_non_zero<B: Backend, const D: usize>(losses: Tensor<B, D>) -> Tensor<B, 1> {
    let count = losses.clone().greater_elem(0.0).float().sum().clamp_min(1.0);
    losses.sum() / count
}

/// A metric-learning loss over `(embeddings, labels)`.
pub trait MetricObjective<B: Backend>: Send + Sync {
    fn name(&self) -> &'static str;

    /// Scalar loss, shape `(1,)`.
    fn forward(&self, embeddings: Tensor<B, 2>, labels: &[usize]) -> Tensor<B, 1>;
}

/// Resolve a configured kind to its objective. `None` disables the term.
pub fn build_metric_objective<B: Backend>(kind: MetricLossKind) -> Option<Box<dyn MetricObjective<B>>> {
    match kind {
        MetricLossKind::None => None,
        MetricLossKind::TripletMargin => Some(Box::new(TripletMarginLoss { margin: 0.1 })),
        MetricLossKind::NPairs => Some(Box::new(NPairsLoss)),
        MetricLossKind::Nca => Some(Box::new(NcaLoss)),
        MetricLossKind::GeneralizedLiftedStructure => Some(Box::new(LiftedStructureLoss {
            pos_margin: 0.0,
            neg_margin: 0.1,
        })),
        MetricLossKind::NtXent => Some(Box::new(NtXentLoss { temperature: 0.1 })),
        MetricLossKind::Contrastive => Some(Box::new(ContrastiveLoss {
            pos_margin: 0.0,
            neg_margin: 1.0,
        })),
    }
}

/// Triplet margin loss over every valid `(anchor, positive, negative)` triple,
/// averaged over the triples that still violate the margin.
#[derive(Debug, Clone)]
pub struct TripletMarginLoss {
    pub margin: f64,
}

impl<B: Backend> MetricObjective<B> for TripletMarginLoss {
    fn name(&self) -> &'static str {
        "TripletMargin"
    }

    fn forward(&self, embeddings: Tensor<B, 2>, labels: &[usize]) -> Tensor<B, 1> {
        let masks = PairMasks::<B>::new(labels, &embeddings.device());
        let dist = pairwise_distances(l2_normalize(embeddings));

        let d_ap = dist.clone().unsqueeze_dim::<3>(2); // (a, p, 1)
        let d_an = dist.unsqueeze_dim::<3>(1); // (a, 1, n)
        let valid = masks.positive.unsqueeze_dim::<3>(2) * masks.negative.unsqueeze_dim::<3>(1);
        let losses = (d_ap - d_an + self.margin).clamp_min(0.0) * valid;
        avg_non_zero(losses)
    }
}

/// Contrastive loss: pull positives within `pos_margin`, push negatives past
/// `neg_margin`.
#[derive(Debug, Clone)]
pub struct ContrastiveLoss {
    pub pos_margin: f64,
    pub neg_margin: f64,
}

impl<B: Backend> MetricObjective<B> for ContrastiveLoss {
    fn name(&self) -> &'static str {
        "Contrastive"
    }

    fn forward(&self, embeddings: Tensor<B, 2>, labels: &[usize]) -> Tensor<B, 1> {
        let masks = PairMasks::<B>::new(labels, &embeddings.device());
        let dist = pairwise_distances(l2_normalize(embeddings));

        let pos = (dist.clone() - self.pos_margin).clamp_min(0.0) * masks.positive;
        let neg = (dist.neg() + self.neg_margin).clamp_min(0.0) * masks.negative;
        avg_non_zero(pos) + avg_non_zero(neg)
    }
}

/// Neighbourhood component analysis: softmax over negative squared distances,
/// maximizing the probability mass on same-class neighbours.
#[derive(Debug, Clone)]
pub struct NcaLoss;

impl<B: Backend> MetricObjective<B> for NcaLoss {
    fn name(&self) -> &'static str {
        "NCA"
    }

    fn forward(&self, embeddings: Tensor<B, 2>, labels: &[usize]) -> Tensor<B, 1> {
        let n = labels.len();
        let device = embeddings.device();
        let masks = PairMasks::<B>::new(labels, &device);
        let logits = pairwise_sq_distances(l2_normalize(embeddings)).neg();
        softmax_neighbour_loss(logits, masks.positive, off_diagonal(n, &device))
    }
}

/// N-pairs loss: like NCA but with dot-product similarities of the unit
/// embeddings, so every other example in the batch acts as a negative for an
/// anchor's positives.
#[derive(Debug, Clone)]
pub struct NPairsLoss;

impl<B: Backend> MetricObjective<B> for NPairsLoss {
    fn name(&self) -> &'static str {
        "NPairs"
    }

    fn forward(&self, embeddings: Tensor<B, 2>, labels: &[usize]) -> Tensor<B, 1> {
        let n = labels.len();
        let device = embeddings.device();
        let masks = PairMasks::<B>::new(labels, &device);
        let unit = l2_normalize(embeddings);
        let logits = unit.clone().matmul(unit.transpose());
        softmax_neighbour_loss(logits, masks.positive, off_diagonal(n, &device))
    }
}

/// `-log(sum_{p} softmax(logits)_{ap})` with the softmax over `support`,
/// averaged over anchors that have at least one positive.
fn softmax_neighbour_loss<B: Backend>(
    logits: Tensor<B, 2>,
    positive: Tensor<B, 2>,
    support: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let has_pos = row_has_any(positive.clone());
    let pos_lse = masked_logsumexp(logits.clone(), positive);
    let all_lse = masked_logsumexp(logits, support);
    weighted_mean(all_lse - pos_lse, has_pos)
}

/// NT-Xent: temperature-scaled cosine similarity, one softmax term per
/// positive pair against all of the anchor's negatives.
#[derive(Debug, Clone)]
pub struct NtXentLoss {
    pub temperature: f64,
}

impl<B: Backend> MetricObjective<B> for NtXentLoss {
    fn name(&self) -> &'static str {
        "NTXent"
    }

    fn forward(&self, embeddings: Tensor<B, 2>, labels: &[usize]) -> Tensor<B, 1> {
        let masks = PairMasks::<B>::new(labels, &embeddings.device());
        let unit = l2_normalize(embeddings);
        // Cosine similarities are bounded, so exp cannot overflow at t = 0.1.
        let sim = unit.clone().matmul(unit.transpose()) / self.temperature;

        let exp_sim = sim.clone().exp();
        let neg_sum = (exp_sim.clone() * masks.negative).sum_dim(1); // (n, 1)
        let pair_losses = (exp_sim + neg_sum).log() - sim;
        weighted_mean(pair_losses, masks.positive)
    }
}

/// Generalized lifted structure loss:
/// `relu(lse(d_ap - pos_margin) + lse(neg_margin - d_an))` per anchor.
#[derive(Debug, Clone)]
pub struct LiftedStructureLoss {
    pub pos_margin: f64,
    pub neg_margin: f64,
}

impl<B: Backend> MetricObjective<B> for LiftedStructureLoss {
    fn name(&self) -> &'static str {
        "GeneralizedLiftedStructure"
    }

    fn forward(&self, embeddings: Tensor<B, 2>, labels: &[usize]) -> Tensor<B, 1> {
        let masks = PairMasks::<B>::new(labels, &embeddings.device());
        let dist = pairwise_distances(l2_normalize(embeddings));

        let valid = row_has_any(masks.positive.clone()) * row_has_any(masks.negative.clone());
        let pos_lse = masked_logsumexp(dist.clone() - self.pos_margin, masks.positive);
        let neg_lse = masked_logsumexp(dist.neg() + self.neg_margin, masks.negative);
        weighted_mean((pos_lse + neg_lse).clamp_min(0.0), valid)
    }
}

/// Target distance matrix from predicted losses: `|p_i - p_j|`.
pub fn loss_to_distance<B: Backend>(pred_loss: Tensor<B, 1>) -> Tensor<B, 2> {
    (pred_loss.clone().unsqueeze_dim::<2>(1) - pred_loss.unsqueeze_dim::<2>(0)).abs()
}

/// Log-ratio loss between the geometry of `representations` and a target
/// distance matrix.
///
/// For every anchor `a` and pair `i != j` (both `!= a`) penalizes
/// `(log(d_ai / d_aj) - log(t_ai / t_aj))^2`, averaged over anchors and
/// ordered pairs. Batches smaller than three give zero.
pub fn log_ratio_loss<B: Backend>(representations: Tensor<B, 2>, target_dist: Tensor<B, 2>) -> Tensor<B, 1> {
    const EPS: f64 = 1e-6;
    let [n, _] = representations.dims();
    let device = representations.device();
    if n < 3 {
        return Tensor::zeros([1], &device);
    }

    let mask = off_diagonal::<B>(n, &device);
    let log_d = (pairwise_distances(representations) + EPS).log();
    let log_t = (target_dist + EPS).log();
    let residual = (log_d - log_t) * mask;

    // sum_{i,j} (r_i - r_j)^2 = 2 (m * sum r^2 - (sum r)^2) over the m valid entries.
    let m = (n - 1) as f64;
    let s1 = residual.clone().sum_dim(1);
    let s2 = residual.powf_scalar(2.0).sum_dim(1);
    let per_anchor = (s2 * m - s1.powf_scalar(2.0)) * 2.0 / (m * (m - 1.0));
    per_anchor.mean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    const ALL_KINDS: [MetricLossKind; 6] = [
        MetricLossKind::TripletMargin,
        MetricLossKind::NPairs,
        MetricLossKind::Nca,
        MetricLossKind::GeneralizedLiftedStructure,
        MetricLossKind::NtXent,
        MetricLossKind::Contrastive,
    ];

    fn embeddings(rows: &[[f32; 2]]) -> Tensor<TestBackend, 2> {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_data(TensorData::new(flat, [rows.len(), 2]), &Default::default())
    }

    /// Two tight, far-apart clusters matching the labels.
    fn separated() -> Tensor<TestBackend, 2> {
        embeddings(&[[5.0, 0.0], [5.1, 0.1], [-5.0, 0.0], [-5.1, -0.1]])
    }

    /// Same points, labels interleaved across clusters.
    const SEPARATED_LABELS: [usize; 4] = [0, 0, 1, 1];
    const MIXED_LABELS: [usize; 4] = [0, 1, 0, 1];

    fn value(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_scalar().elem()
    }

    #[test]
    fn test_pair_masks() {
        let masks = PairMasks::<TestBackend>::new(&[0, 0, 1], &Default::default());
        let pos: Vec<f32> = masks.positive.into_data().to_vec().unwrap();
        let neg: Vec<f32> = masks.negative.into_data().to_vec().unwrap();
        assert_eq!(pos, vec![0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(neg, vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_pairwise_distances() {
        let d = pairwise_distances(embeddings(&[[0.0, 0.0], [3.0, 4.0]]));
        let values: Vec<f32> = d.into_data().to_vec().unwrap();
        assert!(values[0].abs() < 1e-4);
        assert!((values[1] - 5.0).abs() < 1e-4);
        assert!((values[2] - 5.0).abs() < 1e-4);
    }

    #[test]
    fn test_none_builds_nothing() {
        assert!(build_metric_objective::<TestBackend>(MetricLossKind::None).is_none());
    }

    #[test]
    fn test_all_objectives_finite_and_non_negative() {
        for kind in ALL_KINDS {
            let objective = build_metric_objective::<TestBackend>(kind).unwrap();
            for labels in [SEPARATED_LABELS, MIXED_LABELS] {
                let loss = value(objective.forward(separated(), &labels));
                assert!(loss.is_finite(), "{kind}: loss is not finite");
                assert!(loss >= -1e-5, "{kind}: negative loss {loss}");
            }
        }
    }

    #[test]
    fn test_separated_clusters_score_better_than_mixed() {
        for kind in ALL_KINDS {
            let objective = build_metric_objective::<TestBackend>(kind).unwrap();
            let good = value(objective.forward(separated(), &SEPARATED_LABELS));
            let bad = value(objective.forward(separated(), &MIXED_LABELS));
            assert!(good < bad, "{kind}: separated={good} should be below mixed={bad}");
        }
    }

    #[test]
    fn test_objectives_ignore_embedding_scale() {
        let x = embeddings(&[[0.3, 0.1], [0.2, 0.4], [-0.1, 0.2], [0.0, -0.3]]);
        for kind in ALL_KINDS {
            let objective = build_metric_objective::<TestBackend>(kind).unwrap();
            let base = value(objective.forward(x.clone(), &MIXED_LABELS));
            for scale in [0.1, 10.0, 100.0] {
                let scaled = value(objective.forward(x.clone() * scale, &MIXED_LABELS));
                assert!(
                    (scaled - base).abs() < 1e-3 * base.abs().max(1.0),
                    "{kind}: scale {scale} gives {scaled}, unscaled {base}"
                );
            }
        }
    }

    #[test]
    fn test_l2_normalize_rows() {
        let unit = l2_normalize(embeddings(&[[3.0, 4.0], [0.0, -2.0]]));
        let values: Vec<f32> = unit.into_data().to_vec().unwrap();
        let expected = [0.6, 0.8, 0.0, -1.0];
        for (v, e) in values.iter().zip(expected) {
            assert!((v - e).abs() < 1e-5, "{v} vs {e}");
        }
    }

    #[test]
    fn test_triplet_zero_when_margin_satisfied() {
        let loss = TripletMarginLoss { margin: 0.1 };
        let v = value(MetricObjective::<TestBackend>::forward(&loss, separated(), &SEPARATED_LABELS));
        assert!(v.abs() < 1e-6, "well separated triplets should give zero, got {v}");
    }

    #[test]
    fn test_objectives_produce_gradients() {
        let device = Default::default();
        for kind in ALL_KINDS {
            let x = Tensor::<TestAutodiffBackend, 2>::from_data(
                TensorData::new(vec![0.3_f32, 0.1, 0.2, 0.4, -0.1, 0.2, 0.0, -0.3], [4, 2]),
                &device,
            )
            .require_grad();
            let objective = build_metric_objective::<TestAutodiffBackend>(kind).unwrap();
            let grads = objective.forward(x.clone(), &MIXED_LABELS).backward();
            let grad = x.grad(&grads).expect("embedding gradient");
            let values: Vec<f32> = grad.into_data().to_vec().unwrap();
            assert!(values.iter().all(|g| g.is_finite()), "{kind}: non-finite gradient");
        }
    }

    #[test]
    fn test_loss_to_distance() {
        let p = Tensor::<TestBackend, 1>::from_data(TensorData::from([1.0_f32, 4.0, 2.0]), &Default::default());
        let d: Vec<f32> = loss_to_distance(p).into_data().to_vec().unwrap();
        assert_eq!(d, vec![0.0, 3.0, 1.0, 3.0, 0.0, 2.0, 1.0, 2.0, 0.0]);
    }

    #[test]
    fn test_log_ratio_zero_for_matching_geometry() {
        // Points on a line; target distances are exactly the embedding distances.
        let x = embeddings(&[[0.0, 0.0], [1.0, 0.0], [3.0, 0.0], [7.0, 0.0]]);
        let target = pairwise_distances(x.clone());
        let v = value(log_ratio_loss(x, target));
        assert!(v.abs() < 1e-3, "matching geometry should give ~0, got {v}");
    }

    #[test]
    fn test_log_ratio_scale_invariant_but_not_shape_invariant() {
        let x = embeddings(&[[0.0, 0.0], [1.0, 0.0], [3.0, 0.0], [7.0, 0.0]]);
        let scaled = pairwise_distances(x.clone()) * 10.0;
        let v = value(log_ratio_loss(x.clone(), scaled));
        assert!(v.abs() < 1e-3, "uniformly scaled target should give ~0, got {v}");

        let flat = Tensor::<TestBackend, 2>::ones([4, 4], &Default::default());
        let v = value(log_ratio_loss(x, flat));
        assert!(v > 0.1, "mismatched geometry should be penalized, got {v}");
    }

    #[test]
    fn test_log_ratio_small_batch_is_zero() {
        let x = embeddings(&[[0.0, 0.0], [1.0, 0.0]]);
        let target = pairwise_distances(x.clone());
        assert_eq!(value(log_ratio_loss(x, target)), 0.0);
    }
}
