//! Error types and recovery actions for dual-stream fine-tuning.
//!
//! Every fallible operation in this crate returns a [`DualResult`], which pairs
//! the error with an optional [`RecoveryAction`]. The trainer shell uses the
//! action to decide whether a failed iteration is skipped (training goes on)
//! or whether the run has to stop.
//!
//! # Why Recoverable Errors?
//!
//! A fine-tuning run mixes two independent data streams for thousands of
//! iterations. A single malformed novel batch or a transient optimizer failure
//! should cost one iteration, not the whole run:
//! - **Novel forward/backward failure**: skip the iteration, nothing applied
//! - **Mixing failure** (layout mismatch, degenerate norms): skip the iteration
//! - **Apply failure** (gradient assignment or optimizer step): skip the iteration
//! - **Construction failure** (config, streams, checkpoints): abort
//!
//! # Example
//!
//! ```rust
//! use dual_stream_trainer_rs::error::{DualStreamError, RecoveryAction};
//!
//! fn handle(error: DualStreamError, action: Option<RecoveryAction>) {
//!     match action {
//!         Some(action) if action.can_continue() => {
//!             println!("skipping iteration: {error} ({})", action.description());
//!         }
//!         _ => println!("fatal: {error}"),
//!     }
//! }
//! ```

use thiserror::Error;

use crate::StreamKind;

/// The main error type for dual-stream training.
#[derive(Debug, Error)]
pub enum DualStreamError {
    /// The model's forward pass failed for a batch.
    #[error("Forward pass failed on {stream} stream at iteration {iteration}: {detail}")]
    ForwardFailed {
        /// Which stream the batch came from.
        stream: StreamKind,
        /// The iteration being executed.
        iteration: u64,
        /// Description of the failure.
        detail: String,
    },

    /// The model's backward pass failed.
    #[error("Backward pass failed on {stream} stream at iteration {iteration}: {detail}")]
    BackwardFailed {
        /// Which stream the loss came from.
        stream: StreamKind,
        /// The iteration being executed.
        iteration: u64,
        /// Description of the failure.
        detail: String,
    },

    /// Two gradient vectors (or a vector and the model) disagree on which
    /// parameters carry a gradient.
    ///
    /// Combining such vectors element-wise would silently mix unrelated
    /// parameters, so the operation is refused.
    #[error("Gradient layout mismatch: {detail}")]
    LayoutMismatch {
        /// Description of the mismatch.
        detail: String,
    },

    /// A tensor or gradient buffer has the wrong number of elements.
    #[error("Shape mismatch for '{name}': expected {expected} elements, found {found}")]
    ShapeMismatch {
        /// Parameter name.
        name: String,
        /// Expected element count.
        expected: usize,
        /// Observed element count.
        found: usize,
    },

    /// Numerical instability (NaN, infinity, or a division by a vanishing value).
    #[error("Numerical instability at iteration {iteration}: {detail}")]
    NumericalInstability {
        /// Description of the instability.
        detail: String,
        /// The iteration where it was detected.
        iteration: u64,
    },

    /// The optimizer failed to apply an update.
    #[error("Optimizer step failed: {detail}")]
    OptimizerFailed {
        /// Description of the failure.
        detail: String,
    },

    /// A training stream stopped producing batches.
    ///
    /// Streams are expected to be infinite; exhaustion is a construction bug.
    #[error("The {stream} stream is exhausted after {drawn} batches")]
    StreamExhausted {
        /// The exhausted stream.
        stream: StreamKind,
        /// Number of batches drawn before exhaustion.
        drawn: u64,
    },

    /// Parameter store error (duplicate names, unknown parameters).
    #[error("Parameter error: {detail}")]
    ParameterError {
        /// Description of the problem.
        detail: String,
    },

    /// Configuration error (invalid parameters or incompatible settings).
    #[error("Configuration error: {detail}")]
    ConfigError {
        /// Description of the configuration issue.
        detail: String,
    },

    /// Checkpoint save or load failed.
    #[error("Checkpoint error: {reason}")]
    CheckpointError {
        /// Description of the checkpoint failure.
        reason: String,
    },

    /// Evaluation failed.
    #[error("Evaluation error: {detail}")]
    EvaluationError {
        /// Description of the evaluation failure.
        detail: String,
    },

    /// Metric writer I/O failed.
    #[error("Metrics writer error: {detail}")]
    WriterError {
        /// Description of the failure.
        detail: String,
    },

    /// Integration error with an external tensor framework.
    #[cfg(feature = "candle")]
    #[error("Integration error with {crate_name}: {detail}")]
    IntegrationError {
        /// Name of the external crate.
        crate_name: String,
        /// Description of the integration issue.
        detail: String,
    },
}

/// Recovery actions that can be taken in response to training errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Continue training normally; the error was informational.
    Continue,

    /// Drop the current iteration without applying any update and move on.
    SkipIteration,

    /// Abort training (unrecoverable error).
    Abort {
        /// Reason for aborting.
        reason: String,
    },
}

impl RecoveryAction {
    /// Returns whether this action allows training to continue.
    #[must_use]
    pub fn can_continue(&self) -> bool {
        !matches!(self, RecoveryAction::Abort { .. })
    }

    /// Returns a human-readable description of the recovery action.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::Continue => "Continue training normally".to_string(),
            Self::SkipIteration => "Skip current iteration".to_string(),
            Self::Abort { reason } => format!("Abort training: {reason}"),
        }
    }
}

/// Result type that carries both the error and a suggested recovery action.
///
/// A `None` action means the error is fatal.
pub type DualResult<T> = Result<T, (DualStreamError, Option<RecoveryAction>)>;

/// Builds a fatal error tuple.
pub(crate) fn fatal<T>(error: DualStreamError) -> DualResult<T> {
    Err((error, None))
}

/// Builds a recoverable error tuple that skips the current iteration.
pub(crate) fn skip<T>(error: DualStreamError) -> DualResult<T> {
    Err((error, Some(RecoveryAction::SkipIteration)))
}

/// Returns whether an error tuple allows the run to continue.
#[must_use]
pub fn is_recoverable(action: Option<&RecoveryAction>) -> bool {
    action.is_some_and(RecoveryAction::can_continue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_action_can_continue() {
        assert!(RecoveryAction::Continue.can_continue());
        assert!(RecoveryAction::SkipIteration.can_continue());
        assert!(!RecoveryAction::Abort {
            reason: "test".to_string()
        }
        .can_continue());
    }

    #[test]
    fn test_missing_action_is_fatal() {
        assert!(!is_recoverable(None));
        assert!(is_recoverable(Some(&RecoveryAction::SkipIteration)));
        assert!(!is_recoverable(Some(&RecoveryAction::Abort {
            reason: "boom".into()
        })));
    }

    #[test]
    fn test_error_display_mentions_stream() {
        let err = DualStreamError::ForwardFailed {
            stream: StreamKind::Novel,
            iteration: 7,
            detail: "empty annotations".into(),
        };
        let text = err.to_string();
        assert!(text.contains("novel"));
        assert!(text.contains("iteration 7"));
    }

    #[test]
    fn test_skip_helper_attaches_action() {
        let result: DualResult<()> = skip(DualStreamError::LayoutMismatch {
            detail: "x".into(),
        });
        let (_, action) = result.unwrap_err();
        assert_eq!(action, Some(RecoveryAction::SkipIteration));
    }
}
