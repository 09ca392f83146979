//! Gradient clipping by the total L2 norm over every parameter of a module.
//!
//! burn's optimizer-level `GradientClippingConfig::Norm` bounds each parameter
//! tensor on its own. The loss-prediction module is clipped as a whole
//! instead: all of its gradients are scaled by the same factor so that their
//! joint norm stays within the bound.

use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

/// Added to the norm before dividing.
const NORM_EPS: f64 = 1e-6;

/// Collects the squared norm of every gradient registered for the module.
struct SquaredNorms<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    squared: Vec<Tensor<B::InnerBackend, 1>>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SquaredNorms<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            self.squared.push(grad.powf_scalar(2.0).sum());
        }
    }
}

/// Multiplies every gradient registered for the module by `factor`.
struct ScaleGrads<'a> {
    grads: &'a mut GradientsParams,
    factor: f64,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for ScaleGrads<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            self.grads.register::<B::InnerBackend, D>(id, grad.mul_scalar(self.factor));
        }
    }
}

/// L2 norm of all of `module`'s gradients taken together.
pub fn global_grad_norm<B, M>(module: &M, grads: &GradientsParams) -> f64
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = SquaredNorms::<B> {
        grads,
        squared: Vec::new(),
    };
    module.visit(&mut visitor);
    if visitor.squared.is_empty() {
        return 0.0;
    }
    Tensor::cat(visitor.squared, 0).sum().sqrt().into_scalar().elem()
}

/// Scale `grads` by `min(1, max_norm / (norm + eps))`, where `norm` is the
/// global gradient norm of `module`. Returns the clipped gradients and the
/// norm measured before clipping.
pub fn clip_grad_norm<B, M>(module: &M, mut grads: GradientsParams, max_norm: f64) -> (GradientsParams, f64)
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let norm = global_grad_norm::<B, M>(module, &grads);
    let factor = max_norm / (norm + NORM_EPS);
    if factor < 1.0 {
        module.visit(&mut ScaleGrads {
            grads: &mut grads,
            factor,
        });
    }
    (grads, norm)
}
