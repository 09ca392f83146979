//! Subpool scoring and acquisition.
//!
//! Scoring runs on inference copies of the models (the inner, non-autodiff
//! backend obtained through `AutodiffModule::valid`), so nothing here can reach
//! an optimizer.

use std::collections::HashSet;

use burn::prelude::*;
use rand::Rng;

use crate::data::{Batch, BatchLoader, Dataset};
use crate::error::{ActiveLearningError, Result};
use crate::model::{Backbone, LossNet};
use crate::sink::SelectionRow;
use crate::training::loss::per_example_cross_entropy;

/// Scores of one subpool, aligned by position with `subpool`.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolScores {
    pub subpool: Vec<usize>,
    /// Predicted loss per subpool example. Higher means more informative.
    pub scores: Vec<f32>,
    /// True per-example loss. Diagnostic only, never used for selection.
    pub true_losses: Vec<f32>,
}

impl PoolScores {
    pub fn len(&self) -> usize {
        self.subpool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subpool.is_empty()
    }

    /// `(index, score, true_loss, picked)` for every subpool example.
    pub fn selection_rows(&self, picked: &[usize]) -> Vec<SelectionRow> {
        let picked: HashSet<usize> = picked.iter().copied().collect();
        self.subpool
            .iter()
            .zip(self.scores.iter().zip(&self.true_losses))
            .map(|(&index, (&score, &true_loss))| SelectionRow {
                index,
                score: score as f64,
                true_loss: true_loss as f64,
                picked: picked.contains(&index),
            })
            .collect()
    }

    /// Mean true loss of picked and of unpicked subpool examples.
    ///
    /// A side with no examples reports `NaN`.
    pub fn mean_true_loss_split(&self, picked: &[usize]) -> (f64, f64) {
        let picked: HashSet<usize> = picked.iter().copied().collect();
        let (mut sum_in, mut n_in, mut sum_out, mut n_out) = (0.0, 0usize, 0.0, 0usize);
        for (index, &loss) in self.subpool.iter().zip(&self.true_losses) {
            if picked.contains(index) {
                sum_in += loss as f64;
                n_in += 1;
            } else {
                sum_out += loss as f64;
                n_out += 1;
            }
        }
        (sum_in / n_in as f64, sum_out / n_out as f64)
    }
}

/// Draws a random subpool from the unlabeled set and scores it.
#[derive(Debug, Clone, Copy)]
pub struct PoolSampler {
    pub subset_size: usize,
    pub batch_size: usize,
}

impl PoolSampler {
    pub fn new(subset_size: usize, batch_size: usize) -> Self {
        Self {
            subset_size,
            batch_size,
        }
    }

    /// `subset_size` indices drawn without replacement from `unlabeled`.
    pub fn draw_subpool(&self, unlabeled: &[usize], rng: &mut impl Rng) -> Result<Vec<usize>> {
        if self.subset_size > unlabeled.len() {
            return Err(ActiveLearningError::InsufficientPool {
                requested: self.subset_size,
                available: unlabeled.len(),
            });
        }
        Ok(rand::seq::index::sample(rng, unlabeled.len(), self.subset_size)
            .into_iter()
            .map(|i| unlabeled[i])
            .collect())
    }

    /// Draw a subpool and score it.
    ///
    /// # Errors
    /// [`ActiveLearningError::InsufficientPool`] if `unlabeled` is smaller than
    /// `subset_size`.
    pub fn score<B, M>(
        &self,
        backbone: &M,
        module: &LossNet<B>,
        dataset: &dyn Dataset,
        unlabeled: &[usize],
        rng: &mut impl Rng,
        device: &B::Device,
    ) -> Result<PoolScores>
    where
        B: Backend,
        M: Backbone<B>,
    {
        let subpool = self.draw_subpool(unlabeled, rng)?;
        let (scores, true_losses) = self.score_indices(backbone, module, dataset, &subpool, rng, device)?;
        Ok(PoolScores {
            subpool,
            scores,
            true_losses,
        })
    }

    /// Score `indices` in order with sequential batches.
    pub fn score_indices<B, M>(
        &self,
        backbone: &M,
        module: &LossNet<B>,
        dataset: &dyn Dataset,
        indices: &[usize],
        rng: &mut impl Rng,
        device: &B::Device,
    ) -> Result<(Vec<f32>, Vec<f32>)>
    where
        B: Backend,
        M: Backbone<B>,
    {
        let loader = BatchLoader::sequential(indices.to_vec(), self.batch_size);
        let mut scores = Vec::with_capacity(indices.len());
        let mut true_losses = Vec::with_capacity(indices.len());

        // Sequential loaders never consume randomness.
        for chunk in loader.epoch_chunks(rng) {
            let batch = Batch::gather(dataset, &chunk)?;
            let output = backbone.forward(batch.features_tensor::<B>(device));
            let losses = per_example_cross_entropy(output.logits, batch.labels_tensor::<B>(device));
            let predicted = module.forward(output.features).scores;

            scores.extend(tensor_values(predicted)?);
            true_losses.extend(tensor_values(losses)?);
        }
        Ok((scores, true_losses))
    }
}

fn tensor_values<B: Backend>(tensor: Tensor<B, 1>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| ActiveLearningError::Dataset(format!("cannot read scores back: {e:?}")))
}

/// The `addendum` subpool indices with the highest scores.
///
/// Positions are stably sorted by ascending score and the tail is taken, so
/// among equal scores the later subpool position wins. The result is in
/// ascending score order.
pub fn select_addendum(subpool: &[usize], scores: &[f32], addendum: usize) -> Vec<usize> {
    debug_assert_eq!(subpool.len(), scores.len());
    let mut order: Vec<usize> = (0..subpool.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));
    let start = order.len().saturating_sub(addendum);
    order[start..].iter().map(|&pos| subpool[pos]).collect()
}
