//! Learning-rate schedules.

use crate::config::{SolverConfig, WarmupMethod};

/// Maps an iteration to a learning rate.
pub trait LrSchedule: Send {
    /// Learning rate for `iteration`.
    fn lr_at(&self, iteration: u64) -> f32;
}

/// Warmup followed by step decay.
///
/// `lr = base_lr · warmup(iteration) · gamma^k`, where `k` is the number of
/// milestones in `steps` that are `<= iteration`.
#[derive(Debug, Clone)]
pub struct WarmupMultiStep {
    base_lr: f32,
    steps: Vec<u64>,
    gamma: f32,
    warmup_factor: f32,
    warmup_iters: u64,
    warmup_method: WarmupMethod,
}

impl WarmupMultiStep {
    /// Builds the schedule from the `solver` configuration section.
    #[must_use]
    pub fn from_config(config: &SolverConfig) -> Self {
        Self {
            base_lr: config.base_lr,
            steps: config.steps.clone(),
            gamma: config.gamma,
            warmup_factor: config.warmup_factor,
            warmup_iters: config.warmup_iters,
            warmup_method: config.warmup_method,
        }
    }

    fn warmup(&self, iteration: u64) -> f32 {
        if iteration >= self.warmup_iters {
            return 1.0;
        }
        match self.warmup_method {
            WarmupMethod::Constant => self.warmup_factor,
            WarmupMethod::Linear => {
                let alpha = iteration as f32 / self.warmup_iters as f32;
                self.warmup_factor * (1.0 - alpha) + alpha
            }
        }
    }
}

impl LrSchedule for WarmupMultiStep {
    fn lr_at(&self, iteration: u64) -> f32 {
        let decays = self.steps.partition_point(|&milestone| milestone <= iteration);
        self.base_lr * self.warmup(iteration) * self.gamma.powi(decays as i32)
    }
}
