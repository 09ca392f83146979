//! Learning-loss active learning.
//!
//! Trains a classifier together with a small loss-prediction module that learns
//! to rank examples by how large their training loss would be. After every
//! cycle the ranking is used to pick which unlabeled examples get labeled next.
//! Models are burn modules and every component is generic over `B: Backend`.

pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod model;
pub mod sampling;
pub mod sink;
pub mod training;

pub use config::{ExperimentConfig, MetricLossKind, OptimizerSettings, RankingLossKind};
pub use controller::{ActiveLearner, PoolState, TrialReport};
pub use error::ActiveLearningError;
pub use sampling::{select_addendum, PoolSampler, PoolScores};
