//! Error taxonomy for experiment setup, acquisition and persistence.

/// Errors surfaced by the active-learning pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ActiveLearningError {
    /// Invalid experiment setup. Always detected before any model is built,
    /// except for the odd-batch check inside the ranking loss itself.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// A subpool larger than the candidate set was requested.
    #[error("Cannot draw a subpool of {requested} from {available} unlabeled examples")]
    InsufficientPool { requested: usize, available: usize },
    /// The unlabeled pool can no longer fill a subpool; ends the current trial.
    #[error("Pool exhausted in trial {trial} at cycle {cycle}: {available} unlabeled left, subpool needs {required}")]
    PoolExhausted {
        trial: usize,
        cycle: usize,
        available: usize,
        required: usize,
    },
    /// Failure to persist or restore a trial checkpoint.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[source] anyhow::Error),
    /// Dataset lookup failed (missing index, inconsistent feature width).
    #[error("Dataset error: {0}")]
    Dataset(String),
    /// Observability sink failure. Only ever logged, never returned from training.
    #[error("Observability sink error: {0}")]
    Observability(#[source] anyhow::Error),
}

impl ActiveLearningError {
    /// Shorthand for a [`ActiveLearningError::Configuration`] error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ActiveLearningError>;
