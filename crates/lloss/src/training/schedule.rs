//! Epoch-indexed learning-rate schedule.

/// Step decay: the learning rate is multiplied by `gamma` at every milestone.
///
/// The rate is a pure function of the epoch, so a cycle trained as `[0, k)`
/// followed by `[k, n)` sees exactly the same rates as one run over `[0, n)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiStepLr {
    base_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
}

impl MultiStepLr {
    /// `milestones` must be ascending.
    pub fn new(base_lr: f64, milestones: Vec<usize>, gamma: f64) -> Self {
        debug_assert!(
            milestones.windows(2).all(|w| w[0] < w[1]),
            "milestones must be ascending"
        );
        Self {
            base_lr,
            milestones,
            gamma,
        }
    }

    /// Learning rate in effect during `epoch`.
    pub fn lr_at(&self, epoch: usize) -> f64 {
        let passed = self.milestones.iter().take_while(|&&m| m <= epoch).count();
        self.base_lr * self.gamma.powi(passed as i32)
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }
}
