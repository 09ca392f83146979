//! Model components: the backbone classifier interface with an MLP reference
//! implementation, and the loss-prediction module that scores examples.

pub mod backbone;
pub mod loss_net;

pub use backbone::{Backbone, BackboneOutput, MlpBackbone, MlpBackboneConfig};
pub use loss_net::{LossNet, LossNetConfig, LossNetOutput};
