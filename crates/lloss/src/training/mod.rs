//! Training pipeline: the joint objective and its auxiliary losses, the
//! learning-rate schedule, and the two-optimizer cycle trainer.

pub mod clip;
pub mod loss;
pub mod metric;
pub mod schedule;
pub mod trainer;
