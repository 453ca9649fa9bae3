//! Reference SGD optimizer over a [`ParameterStore`].
//!
//! Momentum SGD with L2 weight decay, the solver used for detector
//! fine-tuning:
//!
//! ```text
//! d   = grad + weight_decay · w
//! buf = momentum · buf + d          (buf = d on the first update)
//! w   = w − lr · buf
//! ```
//!
//! Only trainable parameters that carry a gradient are updated. Gradients are
//! validated before any value is written, so a failing step leaves the model
//! untouched.

use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpointable;
use crate::config::SolverConfig;
use crate::error::{DualResult, DualStreamError, RecoveryAction};
use crate::parameters::ParameterStore;
use crate::{Batch, Model, Optimizer};

/// Momentum SGD with weight decay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sgd {
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    /// Momentum buffers by canonical parameter position.
    buffers: Vec<Option<Vec<f32>>>,
    steps: u64,
}

impl Sgd {
    /// Creates an optimizer.
    #[must_use]
    pub fn new(lr: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            momentum,
            weight_decay,
            buffers: Vec::new(),
            steps: 0,
        }
    }

    /// Creates an optimizer from the `solver` configuration section.
    #[must_use]
    pub fn from_config(config: &SolverConfig) -> Self {
        Self::new(config.base_lr, config.momentum, config.weight_decay)
    }

    /// Number of successful steps.
    #[must_use]
    pub fn steps_taken(&self) -> u64 {
        self.steps
    }

    /// Applies one update to `store`.
    ///
    /// # Errors
    ///
    /// Returns a recoverable `OptimizerFailed` if any gradient is not finite.
    pub fn apply(&mut self, store: &mut ParameterStore) -> DualResult<()> {
        if let Some(bad) = store
            .iter()
            .filter(|p| p.role().is_gradient_bearing())
            .find(|p| p.grad().is_some_and(|g| g.iter().any(|v| !v.is_finite())))
        {
            return Err((
                DualStreamError::OptimizerFailed {
                    detail: format!("non-finite gradient for '{}'", bad.name()),
                },
                Some(RecoveryAction::SkipIteration),
            ));
        }

        if self.buffers.len() < store.len() {
            self.buffers.resize(store.len(), None);
        }

        for (param, buffer) in store.iter_mut().zip(self.buffers.iter_mut()) {
            if !param.role().is_gradient_bearing() {
                continue;
            }
            let (data, grad) = param.data_and_grad_mut();
            let Some(grad) = grad else { continue };

            let update: Vec<f32> = grad
                .iter()
                .zip(data.iter())
                .map(|(g, w)| g + self.weight_decay * w)
                .collect();

            let velocity = match buffer {
                Some(buf) if self.momentum > 0.0 => {
                    buf.iter_mut()
                        .zip(&update)
                        .for_each(|(b, d)| *b = self.momentum * *b + d);
                    buf
                }
                _ => buffer.insert(update),
            };

            data.iter_mut()
                .zip(velocity.iter())
                .for_each(|(w, v)| *w -= self.lr * v);
        }

        self.steps += 1;
        Ok(())
    }
}

impl<M, B> Optimizer<M, B> for Sgd
where
    B: Batch,
    M: Model<B>,
{
    fn step(&mut self, model: &mut M) -> DualResult<()> {
        self.apply(model.parameters_mut())
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }
}

impl Checkpointable for Sgd {
    fn state_dict(&self) -> DualResult<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| {
            (
                DualStreamError::CheckpointError {
                    reason: format!("Failed to serialize optimizer: {e}"),
                },
                None,
            )
        })
    }

    fn load_state_dict(&mut self, state: serde_json::Value) -> DualResult<()> {
        *self = serde_json::from_value(state).map_err(|e| {
            (
                DualStreamError::CheckpointError {
                    reason: format!("Malformed optimizer state: {e}"),
                },
                None,
            )
        })?;
        Ok(())
    }
}
