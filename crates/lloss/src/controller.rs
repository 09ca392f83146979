//! Trials × cycles acquisition loop.
//!
//! Each trial starts from a seeded random partition of the training pool. Each
//! cycle trains fresh models on the labeled set, scores a random subpool of the
//! unlabeled set, and moves the highest-scoring `addendum` examples into the
//! labeled set. The last cycle's models are checkpointed per trial.

use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointSink, TrialMeta};
use crate::config::{ExperimentConfig, RankingLossKind};
use crate::data::{rebuild_training_loader, Batch, Dataset};
use crate::error::{ActiveLearningError, Result};
use crate::model::{Backbone, LossNetConfig};
use crate::sampling::{select_addendum, PoolSampler, PoolScores};
use crate::sink::{record_selection_best_effort, ObservabilitySink, TracingSink};
use crate::training::trainer::{CycleModels, Trainer};

/// Labeled/unlabeled partition of the training pool `0..universe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolState {
    labeled: Vec<usize>,
    unlabeled: Vec<usize>,
    universe: usize,
}

impl PoolState {
    /// Shuffle `0..universe` and label the first `initial_query` indices.
    pub fn init(universe: usize, initial_query: usize, rng: &mut impl Rng) -> Self {
        let mut indices: Vec<usize> = (0..universe).collect();
        indices.shuffle(rng);
        let unlabeled = indices.split_off(initial_query.min(universe));
        Self {
            labeled: indices,
            unlabeled,
            universe,
        }
    }

    pub fn labeled(&self) -> &[usize] {
        &self.labeled
    }

    pub fn unlabeled(&self) -> &[usize] {
        &self.unlabeled
    }

    /// Move `picked` from the unlabeled to the labeled set.
    ///
    /// # Panics
    /// If any picked index is not currently unlabeled.
    pub fn acquire(&mut self, picked: &[usize]) {
        let mut is_picked = vec![false; self.universe];
        for &idx in picked {
            assert!(idx < self.universe, "picked index {idx} outside pool of {}", self.universe);
            assert!(!is_picked[idx], "index {idx} picked twice");
            is_picked[idx] = true;
        }
        let before = self.unlabeled.len();
        self.unlabeled.retain(|&idx| !is_picked[idx]);
        assert_eq!(
            before - self.unlabeled.len(),
            picked.len(),
            "picked indices must all be unlabeled"
        );
        self.labeled.extend_from_slice(picked);
    }

    /// Panic unless labeled and unlabeled are disjoint and cover `0..universe`.
    pub fn check_invariants(&self) {
        let mut seen = vec![false; self.universe];
        for &idx in self.labeled.iter().chain(&self.unlabeled) {
            assert!(idx < self.universe, "index {idx} outside pool of {}", self.universe);
            assert!(!seen[idx], "index {idx} is in the partition twice");
            seen[idx] = true;
        }
        assert!(
            seen.iter().all(|&s| s),
            "labeled ({}) + unlabeled ({}) do not cover the pool of {}",
            self.labeled.len(),
            self.unlabeled.len(),
            self.universe
        );
    }
}

/// Outcome of one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialReport {
    pub trial: usize,
    /// Labeled set size each cycle trained on.
    pub labeled_sizes: Vec<usize>,
    /// Test accuracy after each cycle; empty without a test set.
    pub accuracies: Vec<f64>,
    /// Indices acquired at the end of each completed acquisition.
    pub acquired: Vec<Vec<usize>>,
    /// Labeled set size when the trial ended.
    pub final_labeled: usize,
    pub exhausted: bool,
}

impl TrialReport {
    fn new(trial: usize) -> Self {
        Self {
            trial,
            labeled_sizes: Vec::new(),
            accuracies: Vec::new(),
            acquired: Vec::new(),
            final_labeled: 0,
            exhausted: false,
        }
    }
}

/// Top-1 accuracy of `backbone` over all of `dataset`.
pub fn evaluate_accuracy<B, M>(backbone: &M, dataset: &dyn Dataset, batch_size: usize, device: &B::Device) -> Result<f64>
where
    B: Backend,
    M: Backbone<B>,
{
    if dataset.is_empty() {
        return Ok(0.0);
    }
    let indices: Vec<usize> = (0..dataset.len()).collect();
    let mut correct = 0usize;
    for chunk in indices.chunks(batch_size) {
        let batch = Batch::gather(dataset, chunk)?;
        let logits = backbone.forward(batch.features_tensor::<B>(device)).logits;
        let predicted: Vec<i64> = logits
            .argmax(1)
            .flatten::<1>(0, 1)
            .into_data()
            .convert::<i64>()
            .to_vec()
            .map_err(|e| ActiveLearningError::Dataset(format!("cannot read predictions back: {e:?}")))?;
        correct += predicted
            .iter()
            .zip(&batch.labels)
            .filter(|(p, l)| **p as usize == **l)
            .count();
    }
    Ok(correct as f64 / dataset.len() as f64)
}

/// Runs the full experiment for one backbone architecture.
///
/// `backbone_factory` builds a freshly initialized backbone; it is called at
/// the start of every cycle. The loss-prediction module is sized from the
/// backbone's feature widths, using `module_config` for everything else.
pub struct ActiveLearner<'a, B: AutodiffBackend, M: Module<B>, F> {
    config: ExperimentConfig,
    train_set: &'a dyn Dataset,
    test_set: Option<&'a dyn Dataset>,
    backbone_factory: F,
    module_config: LossNetConfig,
    device: B::Device,
    sink: Box<dyn ObservabilitySink + 'a>,
    checkpoints: Option<Box<dyn CheckpointSink<B, M> + 'a>>,
}

impl<'a, B, M, F> ActiveLearner<'a, B, M, F>
where
    B: AutodiffBackend,
    M: Backbone<B> + AutodiffModule<B>,
    M::InnerModule: Backbone<B::InnerBackend>,
    F: Fn(&B::Device) -> M,
{
    pub fn new(
        config: ExperimentConfig,
        train_set: &'a dyn Dataset,
        backbone_factory: F,
        module_config: LossNetConfig,
        device: B::Device,
    ) -> Self {
        Self {
            config,
            train_set,
            test_set: None,
            backbone_factory,
            module_config,
            device,
            sink: Box::new(TracingSink),
            checkpoints: None,
        }
    }

    /// Evaluate accuracy on `test_set` after every cycle.
    pub fn with_test_set(mut self, test_set: &'a dyn Dataset) -> Self {
        self.test_set = Some(test_set);
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn ObservabilitySink + 'a>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Box<dyn CheckpointSink<B, M> + 'a>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Reject the configuration before any model is built.
    ///
    /// Besides [`ExperimentConfig::validate`], a test set must have the same
    /// feature width as the training pool.
    pub fn validate(&self) -> Result<()> {
        self.config.validate(self.train_set.len())?;
        if let Some(test_set) = self.test_set {
            if test_set.feature_dim() != self.train_set.feature_dim() {
                return Err(ActiveLearningError::config(format!(
                    "test set has feature width {} but the training pool has {}",
                    test_set.feature_dim(),
                    self.train_set.feature_dim()
                )));
            }
        }
        Ok(())
    }

    /// Validate, then run every trial.
    pub fn run(&mut self) -> Result<Vec<TrialReport>> {
        self.validate()?;
        (0..self.config.trials).map(|trial| self.run_trial(trial)).collect()
    }

    /// Run one trial. All randomness is seeded from `seed + trial`.
    ///
    /// Pool exhaustion ends the trial early but is not an error: the report is
    /// marked `exhausted` and the checkpoint is still written.
    pub fn run_trial(&mut self, trial: usize) -> Result<TrialReport> {
        let config = self.config.clone();
        let seed = config.seed + trial as u64;
        B::seed(seed);
        let mut rng = StdRng::seed_from_u64(seed);

        let mut pool = PoolState::init(self.train_set.len(), config.initial_query, &mut rng);
        pool.check_invariants();
        let even_batches = config.ranking_loss == RankingLossKind::MarginRanking;
        let mut loader = rebuild_training_loader(pool.labeled(), config.batch_size, even_batches);
        let sampler = PoolSampler::new(config.subset_size, config.batch_size);

        tracing::info!(
            trial,
            seed,
            labeled = pool.labeled().len(),
            unlabeled = pool.unlabeled().len(),
            "Starting trial"
        );

        let mut report = TrialReport::new(trial);
        let mut last_models = None;
        let mut cycles_completed = 0;

        for cycle in 0..config.cycles {
            report.labeled_sizes.push(pool.labeled().len());

            let models = self.fresh_models();
            let mut trainer = Trainer::<B, M>::new(&config);
            if cycle == 0 {
                tracing::info!(trial, "Objective: {}", trainer.joint_loss().describe());
            }

            let pick_epoch = config.pick_epoch();
            let first_phase_end = pick_epoch.unwrap_or(config.epochs);
            let mut models = trainer.train(
                models,
                &loader,
                self.train_set,
                &mut rng,
                0,
                first_phase_end,
                self.sink.as_mut(),
                &self.device,
            )?;

            let mid_cycle_scores = match pick_epoch {
                Some(_) => Some(self.score_pool(trial, cycle, &models, &pool, &sampler, &mut rng)),
                None => None,
            };
            if first_phase_end < config.epochs {
                models = trainer.train(
                    models,
                    &loader,
                    self.train_set,
                    &mut rng,
                    first_phase_end,
                    config.epochs,
                    self.sink.as_mut(),
                    &self.device,
                )?;
            }
            let scored = match mid_cycle_scores {
                Some(scored) => scored,
                None => self.score_pool(trial, cycle, &models, &pool, &sampler, &mut rng),
            };
            cycles_completed = cycle + 1;

            self.log_cycle(trial, cycle, &models, &pool, &mut report)?;

            match scored {
                Ok(scores) => {
                    let picked = select_addendum(&scores.subpool, &scores.scores, config.addendum);
                    self.log_selection(trial, cycle, &scores, &picked);
                    pool.acquire(&picked);
                    pool.check_invariants();
                    loader = rebuild_training_loader(pool.labeled(), config.batch_size, even_batches);
                    report.acquired.push(picked);
                    last_models = Some(models);
                }
                Err(err @ ActiveLearningError::PoolExhausted { .. }) => {
                    tracing::warn!(trial, cycle, "{err}");
                    report.exhausted = true;
                    last_models = Some(models);
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        report.final_labeled = pool.labeled().len();
        if let Some(models) = last_models {
            let meta = TrialMeta {
                trial,
                cycles_completed,
                labeled: report.final_labeled,
                exhausted: report.exhausted,
            };
            if let Some(checkpoints) = self.checkpoints.as_mut() {
                checkpoints
                    .save(trial, &models.backbone, &models.module, &meta)
                    .map_err(ActiveLearningError::Checkpoint)?;
            }
        }

        tracing::info!(
            trial,
            cycles_completed,
            final_labeled = report.final_labeled,
            exhausted = report.exhausted,
            "Trial complete"
        );
        Ok(report)
    }

    fn fresh_models(&self) -> CycleModels<B, M> {
        let backbone = (self.backbone_factory)(&self.device);
        let mut module_config = self.module_config.clone();
        module_config.feature_dims = backbone.feature_dims().to_vec();
        let module = module_config.init::<B>(&self.device);
        CycleModels { backbone, module }
    }

    /// Score a subpool with inference copies of `models`.
    fn score_pool(
        &self,
        trial: usize,
        cycle: usize,
        models: &CycleModels<B, M>,
        pool: &PoolState,
        sampler: &PoolSampler,
        rng: &mut StdRng,
    ) -> Result<PoolScores> {
        let available = pool.unlabeled().len();
        if available < sampler.subset_size {
            return Err(ActiveLearningError::PoolExhausted {
                trial,
                cycle,
                available,
                required: sampler.subset_size,
            });
        }
        let backbone = models.backbone.valid();
        let module = models.module.valid();
        sampler.score(&backbone, &module, self.train_set, pool.unlabeled(), rng, &self.device)
    }

    fn log_cycle(
        &self,
        trial: usize,
        cycle: usize,
        models: &CycleModels<B, M>,
        pool: &PoolState,
        report: &mut TrialReport,
    ) -> Result<()> {
        let labeled = pool.labeled().len();
        match self.test_set {
            Some(test_set) => {
                let backbone = models.backbone.valid();
                let acc = evaluate_accuracy::<B::InnerBackend, _>(&backbone, test_set, self.config.batch_size, &self.device)?;
                report.accuracies.push(acc);
                tracing::info!(
                    "Trial {}/{} || Cycle {}/{} || Label set size {}: Test acc {:.4}",
                    trial + 1,
                    self.config.trials,
                    cycle + 1,
                    self.config.cycles,
                    labeled,
                    acc
                );
            }
            None => tracing::info!(
                "Trial {}/{} || Cycle {}/{} || Label set size {}",
                trial + 1,
                self.config.trials,
                cycle + 1,
                self.config.cycles,
                labeled
            ),
        }
        Ok(())
    }

    fn log_selection(&mut self, trial: usize, cycle: usize, scores: &PoolScores, picked: &[usize]) {
        let (picked_loss, unpicked_loss) = scores.mean_true_loss_split(picked);
        tracing::info!(
            trial,
            cycle,
            picked = picked.len(),
            picked_true_loss = format!("{picked_loss:.4}"),
            unpicked_true_loss = format!("{unpicked_loss:.4}"),
            "Acquired"
        );
        let rows = scores.selection_rows(picked);
        record_selection_best_effort(self.sink.as_mut(), trial, cycle, &rows);
    }
}
