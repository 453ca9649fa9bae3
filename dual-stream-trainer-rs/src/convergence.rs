//! Base-loss EMA and the convergence signal derived from it.
//!
//! The tracker keeps an exponential moving average of the base-stream loss:
//!
//! ```text
//! ema ← beta · ema + (1 − beta) · loss_base
//! ```
//!
//! and maps it onto a signed convergence signal:
//!
//! ```text
//! general_converge = scale · (ema − target) / ema
//! ```
//!
//! With the default `scale = 3` and `target = 0.2` the signal is zero when the
//! base loss has settled at the floor, positive above it and negative below it.
//! A large signal means the base classes are still far from converged, which
//! gives the base gradient more weight in the mixed update.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::DynamicConfig;
use crate::error::{self, DualResult, DualStreamError};

/// Serializable EMA state, persisted with trainer checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceState {
    /// Base loss observed at the first update of the run.
    pub ema_lb0: Option<f32>,
    /// Current EMA value; `None` until seeded.
    pub ema_lb_old: Option<f32>,
    /// Smoothing factor in `[0, 1)`.
    pub beta: f32,
    /// Number of base losses folded into the EMA.
    pub observations: u64,
}

/// Maintains the base-loss EMA and computes the convergence signal.
#[derive(Debug, Clone)]
pub struct ConvergenceTracker {
    state: ConvergenceState,
    target_loss: f32,
    convergence_scale: f32,
    min_ema: f32,
}

impl ConvergenceTracker {
    /// Creates a tracker from the `dynamic` configuration section.
    ///
    /// Without an `initial_ema` prior the first observed loss seeds the EMA.
    #[must_use]
    pub fn new(config: &DynamicConfig) -> Self {
        Self {
            state: ConvergenceState {
                ema_lb0: None,
                ema_lb_old: config.initial_ema,
                beta: config.beta,
                observations: 0,
            },
            target_loss: config.target_loss,
            convergence_scale: config.convergence_scale,
            min_ema: config.min_ema,
        }
    }

    /// Restores a tracker from checkpointed state.
    ///
    /// Signal constants still come from `config`; `beta` comes from the state
    /// so a resumed run continues the same recurrence.
    #[must_use]
    pub fn from_state(config: &DynamicConfig, state: ConvergenceState) -> Self {
        let mut tracker = Self::new(config);
        tracker.state = state;
        tracker
    }

    /// Returns a copy of the state for checkpointing.
    #[must_use]
    pub fn state(&self) -> ConvergenceState {
        self.state.clone()
    }

    /// Current EMA value, if seeded.
    #[must_use]
    pub fn ema(&self) -> Option<f32> {
        self.state.ema_lb_old
    }

    /// Base loss of the first update, if any.
    #[must_use]
    pub fn initial_loss(&self) -> Option<f32> {
        self.state.ema_lb0
    }

    /// Folds one base loss into the EMA and returns the new value.
    ///
    /// The caller must reject non-finite losses first; a NaN folded in here
    /// would poison every later iteration.
    pub fn update(&mut self, loss_base: f32) -> f32 {
        let state = &mut self.state;
        if state.ema_lb0.is_none() {
            state.ema_lb0 = Some(loss_base);
        }

        let ema = match state.ema_lb_old {
            Some(old) => state.beta * old + (1.0 - state.beta) * loss_base,
            None => loss_base,
        };
        state.ema_lb_old = Some(ema);
        state.observations += 1;

        debug!(loss_base, ema, observations = state.observations, "base loss EMA updated");
        ema
    }

    /// Maps an EMA value onto the convergence signal.
    ///
    /// `iteration` is only used to label errors.
    ///
    /// # Errors
    ///
    /// Returns a recoverable `NumericalInstability` when `ema` is not finite or
    /// its magnitude is below the configured minimum.
    pub fn convergence_signal(&self, ema: f32, iteration: u64) -> DualResult<f32> {
        if !ema.is_finite() || ema.abs() < self.min_ema {
            return error::skip(DualStreamError::NumericalInstability {
                detail: format!(
                    "base loss EMA {ema} is too small to derive a convergence signal (min {})",
                    self.min_ema
                ),
                iteration,
            });
        }
        Ok(self.convergence_scale * (ema - self.target_loss) / ema)
    }
}
