//! Backbone classifier interface.
//!
//! The loss-prediction module needs the backbone's intermediate activations,
//! so a backbone returns its class scores together with four feature maps
//! (already pooled to one vector per example) and its penultimate
//! representation.

use burn::nn::{Initializer, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Everything a backbone forward pass exposes to the training pipeline.
#[derive(Debug, Clone)]
pub struct BackboneOutput<B: Backend> {
    /// Unnormalized class scores, `(batch, num_classes)`.
    pub logits: Tensor<B, 2>,
    /// Four intermediate feature maps, `(batch, d_i)` each, shallow to deep.
    pub features: [Tensor<B, 2>; 4],
    /// Penultimate representation, `(batch, d_repr)`.
    pub representation: Tensor<B, 2>,
}

/// A classifier that exposes the four feature maps consumed by [`crate::model::LossNet`].
pub trait Backbone<B: Backend>: Module<B> {
    fn forward(&self, input: Tensor<B, 2>) -> BackboneOutput<B>;

    /// Widths of the four feature maps, used to size the loss-prediction module.
    fn feature_dims(&self) -> [usize; 4];
}

/// Configuration for [`MlpBackbone`].
///
/// ```text
/// (batch, d_input)
///   → Linear → ReLU → f1  (stage_dims[0])
///   → Linear → ReLU → f2  (stage_dims[1])
///   → Linear → ReLU → f3  (stage_dims[2])
///   → Linear → ReLU → f4  (stage_dims[3]) = representation
///   → Linear → logits     (num_classes)
/// ```
#[derive(Config, Debug)]
pub struct MlpBackboneConfig {
    /// Input feature width.
    pub d_input: usize,
    /// Number of output classes.
    pub num_classes: usize,
    /// Widths of the four stages.
    #[config(default = "vec![128, 128, 64, 64]")]
    pub stage_dims: Vec<usize>,
    /// Weight initializer for every layer.
    #[config(
        default = "Initializer::KaimingUniform { gain: 1.0 / 3.0f64.sqrt(), fan_out_only: false }"
    )]
    pub initializer: Initializer,
}

/// Four-stage MLP classifier.
#[derive(Module, Debug)]
pub struct MlpBackbone<B: Backend> {
    stages: Vec<Linear<B>>,
    classifier: Linear<B>,
}

impl MlpBackboneConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MlpBackbone<B> {
        assert_eq!(
            self.stage_dims.len(),
            4,
            "MlpBackbone needs exactly four stage widths, got {:?}",
            self.stage_dims
        );
        let mut d_in = self.d_input;
        let mut stages = Vec::with_capacity(4);
        for &d_out in &self.stage_dims {
            stages.push(
                LinearConfig::new(d_in, d_out)
                    .with_initializer(self.initializer.clone())
                    .init(device),
            );
            d_in = d_out;
        }
        MlpBackbone {
            stages,
            classifier: LinearConfig::new(d_in, self.num_classes)
                .with_initializer(self.initializer.clone())
                .init(device),
        }
    }
}

impl<B: Backend> Backbone<B> for MlpBackbone<B> {
    fn forward(&self, input: Tensor<B, 2>) -> BackboneOutput<B> {
        let f1 = relu(self.stages[0].forward(input));
        let f2 = relu(self.stages[1].forward(f1.clone()));
        let f3 = relu(self.stages[2].forward(f2.clone()));
        let f4 = relu(self.stages[3].forward(f3.clone()));
        let logits = self.classifier.forward(f4.clone());
        BackboneOutput {
            logits,
            representation: f4.clone(),
            features: [f1, f2, f3, f4],
        }
    }

    fn feature_dims(&self) -> [usize; 4] {
        let width = |l: &Linear<B>| l.weight.val().dims()[1];
        [
            width(&self.stages[0]),
            width(&self.stages[1]),
            width(&self.stages[2]),
            width(&self.stages[3]),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        let model = MlpBackboneConfig::new(6, 3)
            .with_stage_dims(vec![16, 12, 8, 4])
            .init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 2>::random([5, 6], Distribution::Normal(0.0, 1.0), &device);

        let out = model.forward(input);
        assert_eq!(out.logits.dims(), [5, 3]);
        assert_eq!(out.features[0].dims(), [5, 16]);
        assert_eq!(out.features[3].dims(), [5, 4]);
        assert_eq!(out.representation.dims(), [5, 4]);
        assert_eq!(model.feature_dims(), [16, 12, 8, 4]);
    }

    #[test]
    #[should_panic(expected = "four stage widths")]
    fn test_wrong_stage_count_panics() {
        let device = Default::default();
        let _ = MlpBackboneConfig::new(6, 3)
            .with_stage_dims(vec![16, 8])
            .init::<TestBackend>(&device);
    }
}
