//! Cycle training loop: backbone and loss-prediction module trained together
//! from one backward pass, each with its own SGD optimizer and step schedule.
//!
//! A [`Trainer`] lives for one cycle. It owns both optimizers (and their
//! momentum state), both learning-rate schedules and the step counter, so
//! training `[0, k)` and then `[k, n)` through the same trainer is the same as
//! training `[0, n)` in one call.

use std::time::Instant;

use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{GradientsParams, Optimizer, Sgd, SgdConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use rand::Rng;

use crate::config::{ExperimentConfig, OptimizerSettings};
use crate::data::{Batch, BatchLoader, Dataset};
use crate::error::Result;
use crate::model::{Backbone, LossNet};
use crate::sink::{record_best_effort, ObservabilitySink};
use crate::training::clip::clip_grad_norm;
use crate::training::loss::{GradientMode, JointLoss, LossBreakdown};
use crate::training::schedule::MultiStepLr;

/// SGD optimizer over module `M` on autodiff backend `B`.
pub type SgdOptimizer<B, M> = OptimizerAdaptor<Sgd<<B as AutodiffBackend>::InnerBackend>, M, B>;

/// The two models trained in a cycle.
#[derive(Debug, Clone)]
pub struct CycleModels<B: AutodiffBackend, M> {
    pub backbone: M,
    pub module: LossNet<B>,
}

/// Per-step settings derived from the epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingStep {
    pub mode: GradientMode,
    pub backbone_lr: f64,
    pub module_lr: f64,
}

/// SGD with momentum and weight decay. Dampening is zero (classic momentum).
fn sgd_config(settings: &OptimizerSettings, weight_decay: f64) -> SgdConfig {
    SgdConfig::new()
        .with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(settings.momentum)
                .with_dampening(0.0)
                .with_nesterov(false),
        ))
        .with_weight_decay(Some(WeightDecayConfig::new(weight_decay as f32)))
}

/// Fresh optimizers for one cycle. Clipping is applied by the [`Trainer`],
/// not by the optimizers.
pub fn build_optimizers<B, M>(config: &ExperimentConfig) -> (SgdOptimizer<B, M>, SgdOptimizer<B, LossNet<B>>)
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let settings = &config.optimizer;
    (
        sgd_config(settings, settings.weight_decay).init::<B, M>(),
        sgd_config(settings, settings.module_weight_decay).init::<B, LossNet<B>>(),
    )
}

/// Drives epochs over the labeled set for one cycle.
pub struct Trainer<B: AutodiffBackend, M: AutodiffModule<B>> {
    joint_loss: JointLoss<B>,
    backbone_optim: SgdOptimizer<B, M>,
    module_optim: SgdOptimizer<B, LossNet<B>>,
    backbone_lr: MultiStepLr,
    module_lr: MultiStepLr,
    epoch_loss: usize,
    log_interval: usize,
    /// Bound on the loss-prediction module's global gradient norm.
    max_grad_norm: Option<f64>,
    step: u64,
}

impl<B, M> Trainer<B, M>
where
    B: AutodiffBackend,
    M: Backbone<B> + AutodiffModule<B>,
{
    /// Trainer with fresh optimizers and a zeroed step counter.
    pub fn new(config: &ExperimentConfig) -> Self {
        let (backbone_optim, module_optim) = build_optimizers::<B, M>(config);
        let schedule = MultiStepLr::new(
            config.optimizer.lr,
            config.milestones.clone(),
            config.optimizer.lr_gamma,
        );
        Self {
            joint_loss: JointLoss::from_config(config),
            backbone_optim,
            module_optim,
            backbone_lr: schedule.clone(),
            module_lr: schedule,
            epoch_loss: config.epoch_loss,
            log_interval: config.log_interval.max(1),
            max_grad_norm: config.gradient_clip.then_some(config.optimizer.max_grad_norm),
            step: 0,
        }
    }

    /// Optimizer steps taken so far.
    pub fn step_count(&self) -> u64 {
        self.step
    }

    pub fn joint_loss(&self) -> &JointLoss<B> {
        &self.joint_loss
    }

    /// Learning rates and gradient mode in effect during `epoch`.
    pub fn plan(&self, epoch: usize) -> TrainingStep {
        TrainingStep {
            mode: GradientMode::for_epoch(epoch, self.epoch_loss),
            backbone_lr: self.backbone_lr.lr_at(epoch),
            module_lr: self.module_lr.lr_at(epoch),
        }
    }

    /// Train epochs `[start_epoch, end_epoch)`.
    ///
    /// Every epoch visits each batch of `loader` once, in the order drawn from
    /// `rng`. Loss components go to `sink` every `log_interval` steps; sink
    /// failures are logged and training continues.
    #[allow(clippy::too_many_arguments)]
    pub fn train(
        &mut self,
        mut models: CycleModels<B, M>,
        loader: &BatchLoader,
        dataset: &dyn Dataset,
        rng: &mut impl Rng,
        start_epoch: usize,
        end_epoch: usize,
        sink: &mut dyn ObservabilitySink,
        device: &B::Device,
    ) -> Result<CycleModels<B, M>> {
        tracing::debug!(
            start_epoch,
            end_epoch,
            batches = loader.num_batches(),
            examples = loader.indices().len(),
            "Training segment"
        );
        let segment_start = Instant::now();

        for epoch in start_epoch..end_epoch {
            let plan = self.plan(epoch);
            let mut epoch_total = 0.0;
            let mut batches = 0usize;

            for chunk in loader.epoch_chunks(rng) {
                let batch = Batch::gather(dataset, &chunk)?;
                let (updated, total, breakdown) = self.training_step(models, &batch, plan, device)?;
                models = updated;
                epoch_total += total;
                batches += 1;

                if let Some(breakdown) = breakdown {
                    record_best_effort(
                        sink,
                        self.step,
                        &[
                            ("backbone", breakdown.supervised),
                            ("ranking", breakdown.ranking),
                            ("metric", breakdown.metric),
                            ("distillation", breakdown.distillation),
                            ("total", breakdown.total),
                        ],
                    );
                }
            }

            if batches > 0 {
                let lr_str = format!("{:.2e}", plan.backbone_lr);
                tracing::debug!(
                    epoch,
                    lr = %lr_str,
                    mode = ?plan.mode,
                    "mean loss {:.4}",
                    epoch_total / batches as f64
                );
            }
        }

        tracing::debug!(
            steps = self.step,
            elapsed_secs = format!("{:.1}", segment_start.elapsed().as_secs_f64()),
            "Segment finished"
        );
        Ok(models)
    }

    /// One forward/backward pass and one update of both models.
    ///
    /// Returns the total loss. The per-term breakdown is only read back on
    /// steps that land on `log_interval`.
    pub fn training_step(
        &mut self,
        models: CycleModels<B, M>,
        batch: &Batch,
        step: TrainingStep,
        device: &B::Device,
    ) -> Result<(CycleModels<B, M>, f64, Option<LossBreakdown>)> {
        let CycleModels { backbone, module } = models;

        let input = batch.features_tensor::<B>(device);
        let targets = batch.labels_tensor::<B>(device);
        let output = self.joint_loss.forward(
            backbone.forward(input),
            &module,
            targets,
            &batch.labels,
            step.mode,
        )?;
        let logged = (self.step + 1) % self.log_interval as u64 == 0;
        let breakdown = logged.then(|| output.breakdown());
        let total = match &breakdown {
            Some(breakdown) => breakdown.total,
            None => output.total.clone().into_scalar().elem(),
        };

        let mut grads = output.total.backward();
        let backbone_grads = GradientsParams::from_module(&mut grads, &backbone);
        let mut module_grads = GradientsParams::from_module(&mut grads, &module);
        if let Some(max_norm) = self.max_grad_norm {
            let (clipped, norm) = clip_grad_norm::<B, _>(&module, module_grads, max_norm);
            if norm > max_norm {
                tracing::trace!(norm, max_norm, "Clipped loss-prediction gradients");
            }
            module_grads = clipped;
        }

        let backbone = self.backbone_optim.step(step.backbone_lr, backbone, backbone_grads);
        let module = self.module_optim.step(step.module_lr, module, module_grads);
        self.step += 1;

        Ok((CycleModels { backbone, module }, total, breakdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;
    use burn::module::{ModuleVisitor, ParamId};
    use burn::nn::Initializer;
    use burn::tensor::TensorData;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use crate::data::{rebuild_training_loader, InMemoryDataset};
    use crate::model::{LossNetConfig, MlpBackbone, MlpBackboneConfig};
    use crate::sink::NullSink;

    type TestAutodiffBackend = Autodiff<NdArray<f32>>;
    type Models = CycleModels<TestAutodiffBackend, MlpBackbone<TestAutodiffBackend>>;
    type TestTrainer = Trainer<TestAutodiffBackend, MlpBackbone<TestAutodiffBackend>>;

    // Constant weights keep tests independent of the backend's global RNG.
    fn models(device: &<TestAutodiffBackend as Backend>::Device) -> Models {
        let init = Initializer::Constant { value: 0.05 };
        let backbone = MlpBackboneConfig::new(3, 2)
            .with_stage_dims(vec![8, 8, 6, 6])
            .with_initializer(init.clone())
            .init(device);
        let module = LossNetConfig::new(backbone.feature_dims().to_vec())
            .with_interm_dim(4)
            .with_initializer(init)
            .init(device);
        CycleModels { backbone, module }
    }

    fn config() -> ExperimentConfig {
        ExperimentConfig {
            epochs: 4,
            epoch_loss: 1,
            milestones: vec![2],
            batch_size: 4,
            log_interval: 1,
            ..ExperimentConfig::default()
        }
    }

    fn fixed_input_outputs(models: &Models) -> Vec<f32> {
        let device = Default::default();
        let x = Tensor::<TestAutodiffBackend, 2>::from_data(
            TensorData::new(vec![0.3_f32, -0.2, 1.0, 0.5, 0.5, -1.0], [2, 3]),
            &device,
        );
        let out = models.backbone.forward(x);
        let scores = models.module.forward(out.features.clone()).scores;
        let mut values: Vec<f32> = out.logits.into_data().to_vec().unwrap();
        values.extend(scores.into_data().to_vec::<f32>().unwrap());
        values
    }

    /// Every float parameter of a module, flattened in visit order.
    struct ParamValues(Vec<f32>);

    impl<B: Backend> ModuleVisitor<B> for ParamValues {
        fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
            self.0
                .extend(tensor.clone().into_data().convert::<f32>().to_vec::<f32>().unwrap());
        }
    }

    fn module_params(module: &LossNet<TestAutodiffBackend>) -> Vec<f32> {
        let mut values = ParamValues(Vec::new());
        module.visit(&mut values);
        values.0
    }

    struct CountingSink {
        iterations: Vec<u64>,
        fail: bool,
    }

    impl ObservabilitySink for CountingSink {
        fn record(&mut self, iteration: u64, scalars: &[(&str, f64)]) -> anyhow::Result<()> {
            self.iterations.push(iteration);
            assert!(scalars.iter().any(|(name, _)| *name == "total"));
            if self.fail {
                anyhow::bail!("sink offline");
            }
            Ok(())
        }
    }

    #[test]
    fn test_plan_follows_schedule_and_threshold() {
        let trainer = TestTrainer::new(&config());
        let early = trainer.plan(0);
        assert_eq!(early.mode, GradientMode::Joint);
        assert!((early.backbone_lr - 0.1).abs() < 1e-12);
        let late = trainer.plan(3);
        assert_eq!(late.mode, GradientMode::AuxiliaryOnly);
        assert!((late.module_lr - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_split_training_matches_single_run() {
        let device = Default::default();
        let dataset = InMemoryDataset::gaussian_blobs(16, 2, 3, 0.5, 0);
        let loader = rebuild_training_loader(&(0..16).collect::<Vec<_>>(), 4, true);
        let config = config();

        let mut whole = TestTrainer::new(&config);
        let mut rng = StdRng::seed_from_u64(9);
        let once = whole
            .train(models(&device), &loader, &dataset, &mut rng, 0, 4, &mut NullSink, &device)
            .unwrap();

        let mut split = TestTrainer::new(&config);
        let mut rng = StdRng::seed_from_u64(9);
        let halfway = split
            .train(models(&device), &loader, &dataset, &mut rng, 0, 2, &mut NullSink, &device)
            .unwrap();
        let twice = split
            .train(halfway, &loader, &dataset, &mut rng, 2, 4, &mut NullSink, &device)
            .unwrap();

        assert_eq!(whole.step_count(), 16);
        assert_eq!(split.step_count(), 16);
        for (a, b) in fixed_input_outputs(&once).iter().zip(fixed_input_outputs(&twice)) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn test_training_changes_weights() {
        let device = Default::default();
        let dataset = InMemoryDataset::gaussian_blobs(8, 2, 3, 0.5, 1);
        let loader = rebuild_training_loader(&(0..8).collect::<Vec<_>>(), 4, true);
        let initial = models(&device);
        let before = fixed_input_outputs(&initial);

        let mut trainer = TestTrainer::new(&config());
        let trained = trainer
            .train(initial, &loader, &dataset, &mut StdRng::seed_from_u64(0), 0, 1, &mut NullSink, &device)
            .unwrap();
        let after = fixed_input_outputs(&trained);
        assert!(before.iter().zip(&after).any(|(a, b)| (a - b).abs() > 1e-6));
    }

    #[test]
    fn test_sink_failures_do_not_abort_training() {
        let device = Default::default();
        let dataset = InMemoryDataset::gaussian_blobs(12, 2, 3, 0.5, 2);
        let loader = rebuild_training_loader(&(0..12).collect::<Vec<_>>(), 4, true);
        let config = ExperimentConfig {
            log_interval: 2,
            ..config()
        };

        let mut sink = CountingSink {
            iterations: Vec::new(),
            fail: true,
        };
        let mut trainer = TestTrainer::new(&config);
        trainer
            .train(models(&device), &loader, &dataset, &mut StdRng::seed_from_u64(3), 0, 2, &mut sink, &device)
            .unwrap();

        assert_eq!(trainer.step_count(), 6);
        assert_eq!(sink.iterations, vec![2, 4, 6]);
    }

    #[test]
    fn test_gradient_clip_bounds_whole_module_update() {
        let device = Default::default();
        let dataset = InMemoryDataset::gaussian_blobs(4, 2, 3, 0.5, 4);
        let batch = Batch::gather(&dataset, &[0, 1, 2, 3]).unwrap();
        let max_norm = 1e-4;
        let config = ExperimentConfig {
            gradient_clip: true,
            optimizer: OptimizerSettings {
                weight_decay: 0.0,
                module_weight_decay: 0.0,
                max_grad_norm: max_norm,
                ..OptimizerSettings::default()
            },
            ..config()
        };

        let initial = models(&device);
        let before = module_params(&initial.module);
        let mut trainer = TestTrainer::new(&config);
        let plan = trainer.plan(0);
        let (stepped, total, breakdown) = trainer.training_step(initial, &batch, plan, &device).unwrap();
        let after = module_params(&stepped.module);

        // First SGD step without weight decay moves parameters by lr * grad, so
        // the update norm equals lr times the clipped global gradient norm.
        let moved = before
            .iter()
            .zip(&after)
            .map(|(a, b)| ((a - b) as f64).powi(2))
            .sum::<f64>()
            .sqrt();
        let expected = plan.module_lr * max_norm;
        assert!(moved <= expected * 1.05, "update {moved} exceeds {expected}");
        assert!(moved >= expected * 0.5, "update {moved} far below {expected}");

        assert!(total.is_finite());
        assert!(breakdown.is_some(), "log_interval 1 reads the breakdown every step");
    }

    #[test]
    fn test_breakdown_only_on_logged_steps() {
        let device = Default::default();
        let dataset = InMemoryDataset::gaussian_blobs(4, 2, 3, 0.5, 5);
        let batch = Batch::gather(&dataset, &[0, 1, 2, 3]).unwrap();
        let config = ExperimentConfig {
            log_interval: 3,
            ..config()
        };
        let mut trainer = TestTrainer::new(&config);
        let plan = trainer.plan(0);

        let mut models = models(&device);
        let mut logged = Vec::new();
        for _ in 0..6 {
            let (next, total, breakdown) = trainer.training_step(models, &batch, plan, &device).unwrap();
            if let Some(b) = &breakdown {
                assert!((b.total - total).abs() < 1e-9);
            }
            logged.push(breakdown.is_some());
            models = next;
        }
        assert_eq!(logged, vec![false, false, true, false, false, true]);
    }
}
