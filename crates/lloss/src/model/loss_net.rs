use burn::nn::{Initializer, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Configuration for the loss-prediction module.
///
/// Each of the backbone's four feature maps goes through its own projection;
/// the concatenated projections are the module's embedding, and a final linear
/// layer maps the embedding to one score per example.
///
/// ```text
/// f_i: (batch, feature_dims[i])
///   → Linear(feature_dims[i]→interm_dim) → ReLU        (× 4)
///   → concat                               → embedding: (batch, 4 * interm_dim)
///   → Linear(4 * interm_dim→1) → squeeze   → score:     (batch,)
/// ```
#[derive(Config, Debug)]
pub struct LossNetConfig {
    /// Widths of the backbone's four feature maps.
    pub feature_dims: Vec<usize>,
    /// Projection width per feature map.
    #[config(default = 128)]
    pub interm_dim: usize,
    #[config(
        default = "Initializer::KaimingUniform { gain: 1.0 / 3.0f64.sqrt(), fan_out_only: false }"
    )]
    pub initializer: Initializer,
}

/// Loss-prediction module: estimates how large an example's training loss is.
///
/// Only the relative order of its scores is meaningful; it is trained with a
/// ranking objective and never sees absolute loss values at inference time.
#[derive(Module, Debug)]
pub struct LossNet<B: Backend> {
    /// One projection per feature map.
    projections: Vec<Linear<B>>,
    /// Embedding → score.
    head: Linear<B>,
}

/// Scores and embeddings for one batch.
#[derive(Debug, Clone)]
pub struct LossNetOutput<B: Backend> {
    /// Predicted loss per example, `(batch,)`.
    pub scores: Tensor<B, 1>,
    /// Concatenated feature projections, `(batch, 4 * interm_dim)`.
    pub embedding: Tensor<B, 2>,
}

impl LossNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> LossNet<B> {
        assert_eq!(
            self.feature_dims.len(),
            4,
            "LossNet needs exactly four feature widths, got {:?}",
            self.feature_dims
        );
        let projections = self
            .feature_dims
            .iter()
            .map(|&d| {
                LinearConfig::new(d, self.interm_dim)
                    .with_initializer(self.initializer.clone())
                    .init(device)
            })
            .collect();
        LossNet {
            projections,
            head: LinearConfig::new(4 * self.interm_dim, 1)
                .with_initializer(self.initializer.clone())
                .init(device),
        }
    }
}

impl<B: Backend> LossNet<B> {
    /// Score a batch from its four feature maps.
    pub fn forward(&self, features: [Tensor<B, 2>; 4]) -> LossNetOutput<B> {
        let projected: Vec<Tensor<B, 2>> = self
            .projections
            .iter()
            .zip(features)
            .map(|(proj, f)| relu(proj.forward(f)))
            .collect();
        let embedding = Tensor::cat(projected, 1);
        let scores: Tensor<B, 1> = self.head.forward(embedding.clone()).squeeze::<1>(1);
        LossNetOutput { scores, embedding }
    }
}
