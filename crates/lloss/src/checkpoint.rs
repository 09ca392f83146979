//! Per-trial checkpoints of both models.
//!
//! Layout under the checkpoint root:
//!
//! ```text
//! trial_{t}/backbone.mpk
//! trial_{t}/loss_net.mpk
//! trial_{t}/meta.json
//! ```
//!
//! Saving a trial overwrites only that trial's directory.

use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};

use crate::model::LossNet;

/// Metadata saved alongside each trial's weights.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TrialMeta {
    pub trial: usize,
    pub cycles_completed: usize,
    pub labeled: usize,
    /// The trial stopped early because the unlabeled pool ran out.
    pub exhausted: bool,
}

/// Destination for end-of-trial weights.
pub trait CheckpointSink<B: Backend, M: Module<B>> {
    fn save(&mut self, trial: usize, backbone: &M, module: &LossNet<B>, meta: &TrialMeta) -> anyhow::Result<()>;
}

/// Writes checkpoints with burn's named MessagePack recorder.
#[derive(Debug, Clone)]
pub struct FileCheckpointSink {
    dir: PathBuf,
}

impl FileCheckpointSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding trial `trial`'s files.
    pub fn trial_dir(&self, trial: usize) -> PathBuf {
        self.dir.join(format!("trial_{trial}"))
    }
}

impl<B: Backend, M: Module<B>> CheckpointSink<B, M> for FileCheckpointSink {
    fn save(&mut self, trial: usize, backbone: &M, module: &LossNet<B>, meta: &TrialMeta) -> anyhow::Result<()> {
        let trial_dir = self.trial_dir(trial);
        std::fs::create_dir_all(&trial_dir)?;
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();

        backbone
            .clone()
            .save_file(trial_dir.join("backbone"), &recorder)
            .map_err(|e| anyhow::anyhow!("Failed to save backbone for trial {trial}: {e}"))?;
        module
            .clone()
            .save_file(trial_dir.join("loss_net"), &recorder)
            .map_err(|e| anyhow::anyhow!("Failed to save loss net for trial {trial}: {e}"))?;

        let meta_path = trial_dir.join("meta.json");
        serde_json::to_writer_pretty(std::fs::File::create(&meta_path)?, meta)?;

        tracing::info!(trial, dir = %trial_dir.display(), "Checkpoint saved (backbone + loss net + meta)");
        Ok(())
    }
}

/// Load a trial checkpoint onto freshly initialized models.
///
/// `backbone` and `module` only provide the architecture; their weights are
/// replaced by the saved ones.
pub fn load_trial_checkpoint<B, M>(
    trial_dir: &Path,
    backbone: M,
    module: LossNet<B>,
    device: &B::Device,
) -> anyhow::Result<(M, LossNet<B>, TrialMeta)>
where
    B: Backend,
    M: Module<B>,
{
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let backbone = backbone
        .load_file(trial_dir.join("backbone"), &recorder, device)
        .map_err(|e| anyhow::anyhow!("Failed to load backbone from {}: {e}", trial_dir.display()))?;
    let module = module
        .load_file(trial_dir.join("loss_net"), &recorder, device)
        .map_err(|e| anyhow::anyhow!("Failed to load loss net from {}: {e}", trial_dir.display()))?;

    let meta_path = trial_dir.join("meta.json");
    let meta: TrialMeta = serde_json::from_reader(
        std::fs::File::open(&meta_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", meta_path.display()))?,
    )
    .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", meta_path.display()))?;

    Ok((backbone, module, meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::nn::Initializer;
    use burn::tensor::TensorData;

    use crate::model::{Backbone, LossNetConfig, MlpBackboneConfig};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_save_load_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let device = Default::default();

        let config = MlpBackboneConfig::new(3, 2).with_stage_dims(vec![5, 5, 4, 4]);
        let backbone = config
            .clone()
            .with_initializer(Initializer::Constant { value: 0.2 })
            .init::<TestBackend>(&device);
        let module_config = LossNetConfig::new(backbone.feature_dims().to_vec()).with_interm_dim(3);
        let module = module_config
            .clone()
            .with_initializer(Initializer::Constant { value: -0.1 })
            .init::<TestBackend>(&device);

        let meta = TrialMeta {
            trial: 2,
            cycles_completed: 4,
            labeled: 120,
            exhausted: false,
        };
        let mut sink = FileCheckpointSink::new(tmp.path());
        CheckpointSink::<TestBackend, _>::save(&mut sink, 2, &backbone, &module, &meta).unwrap();

        let trial_dir = sink.trial_dir(2);
        assert!(trial_dir.join("backbone.mpk").exists());
        assert!(trial_dir.join("loss_net.mpk").exists());
        assert!(trial_dir.join("meta.json").exists());

        // Fresh models with different weights.
        let (loaded_backbone, loaded_module, loaded_meta) = load_trial_checkpoint(
            &trial_dir,
            config.init::<TestBackend>(&device),
            module_config.init::<TestBackend>(&device),
            &device,
        )
        .unwrap();
        assert_eq!(loaded_meta, meta);

        let x = Tensor::<TestBackend, 2>::from_data(TensorData::new(vec![1.0_f32, -0.5, 0.25], [1, 3]), &device);
        let expected = backbone.forward(x.clone());
        let actual = loaded_backbone.forward(x);
        let diff: f32 = (expected.logits - actual.logits).abs().max().into_scalar();
        assert!(diff < 1e-6);

        let expected_score = module.forward(expected.features).scores;
        let actual_score = loaded_module.forward(actual.features).scores;
        let diff: f32 = (expected_score - actual_score).abs().max().into_scalar();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_missing_checkpoint_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let device = Default::default();
        let backbone = MlpBackboneConfig::new(3, 2).init::<TestBackend>(&device);
        let module = LossNetConfig::new(backbone.feature_dims().to_vec()).init::<TestBackend>(&device);
        let result = load_trial_checkpoint(&tmp.path().join("trial_0"), backbone, module, &device);
        assert!(result.is_err());
    }
}
