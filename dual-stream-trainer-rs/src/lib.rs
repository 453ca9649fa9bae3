//! # dual-stream-trainer-rs
//!
//! Dual-stream gradient-balancing fine-tuning for few-shot object detection.
//!
//! ## Overview
//!
//! A detector trained on abundant *base* classes is fine-tuned on a mixture of
//! base data and a handful of *novel* class examples. Training naively on the
//! mixture lets the novel gradient drag the shared parameters away from what
//! the base classes need. This crate balances the two streams every iteration:
//!
//! 1. Forward + backward on a novel batch, capture `grad_novel`
//! 2. Forward + backward on a base batch, capture `grad_base`
//! 3. Track an EMA of the base loss and derive a convergence signal
//! 4. Measure how much `grad_novel` agrees with `grad_base`
//! 5. Apply `λ · grad_base + grad_novel`, with `λ = max(convergence, angle)`
//!
//! ```text
//!   novel stream ──▶ forward/backward ──▶ grad_novel ─┐
//!                                                      ├──▶ mixer ──▶ assign ──▶ optimizer
//!   base stream  ──▶ forward/backward ──▶ grad_base ──┘      ▲
//!                          │                                 │
//!                          └──▶ loss_base ──▶ EMA ──▶ convergence signal
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use dual_stream_trainer_rs::prelude::*;
//!
//! let config = DualStreamConfig::builder()
//!     .max_iter(10_000)
//!     .base_lr(0.01)
//!     .checkpoint_period(5_000)
//!     .build();
//!
//! // let mut trainer = DualStreamTrainer::new(model, optimizer, novel, base, config, ProcessInfo::single())?;
//! // trainer.resume_or_load(true, None)?;
//! // let results = trainer.train()?;
//! ```
//!
//! ## Feature Flags
//!
//! - `std` - Enable standard library support (default)
//! - `candle` - Adapter between Candle `VarMap`/`GradStore` and [`ParameterStore`]
//! - `full` - Enable all features
//!
//! ## Architecture
//!
//! - [`config`] - Training configuration and serialization
//! - [`error`] - Error types with recovery actions
//! - [`parameters`] - Ordered parameter storage with optional gradients
//! - [`gradient`] - Flatten/assign of gradients under a fixed layout
//! - [`convergence`] - Base-loss EMA and convergence signal
//! - [`mixer`] - Alignment-based gradient combination
//! - [`step`] - One dual-stream iteration
//! - [`data`] - Training streams and cyclic samplers
//! - [`optimizer`] - Reference momentum SGD
//! - [`scheduler`] - Warmup multi-step learning-rate schedule
//! - [`metrics`] - Scalar storage and writers
//! - [`checkpoint`] - Trainer checkpoints
//! - [`hooks`] - Iteration hooks (timer, LR, precise BN, checkpoint, eval, writer)
//! - [`trainer`] - The iteration loop
#![cfg_attr(
    feature = "candle",
    doc = "- [`candle_integration`] - Candle adapter (requires `candle` feature)"
)]
#![cfg_attr(
    not(feature = "candle"),
    doc = "- `candle_integration` - Candle adapter (requires `candle` feature)"
)]

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]
// Allow precision loss casts - acceptable in ML numerical code
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::type_complexity)]

// Core modules
pub mod config;
pub mod error;
pub mod parameters;

// Gradient balancing
pub mod convergence;
pub mod gradient;
pub mod mixer;
pub mod step;

// Training shell
pub mod checkpoint;
pub mod data;
pub mod hooks;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

// Framework integration
#[cfg(feature = "candle")]
pub mod candle_integration;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use config::DualStreamConfig;
pub use convergence::{ConvergenceState, ConvergenceTracker};
pub use error::{DualResult, DualStreamError, RecoveryAction};
pub use gradient::{GradientLayout, GradientVector};
pub use mixer::{GradientMixer, MixingDecision};
pub use parameters::{Parameter, ParameterRole, ParameterStore};
pub use step::{DualStreamStep, IterationOutcome, IterationReport, StepStage};
pub use trainer::{DualStreamTrainer, ProcessInfo};

/// Named loss terms returned by a forward pass.
///
/// Ordered so that logs and metric files list terms deterministically.
pub type LossMap = BTreeMap<String, f32>;

/// Which data stream a batch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Base-class data.
    Base,
    /// Novel (few-shot) class data.
    Novel,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base => f.write_str("base"),
            Self::Novel => f.write_str("novel"),
        }
    }
}

/// Batch of training data.
///
/// The actual batch format depends on the model implementation.
pub trait Batch: Send {
    /// Returns the batch size (number of samples).
    fn batch_size(&self) -> usize;
}

/// A model trainable with the dual-stream step.
///
/// # Contract
///
/// - [`Model::forward`] computes the loss terms for a batch. The `stream`
///   argument tells the model which stream the batch came from, for models
///   whose heads or loss weighting differ between base and novel data.
/// - [`Model::backward`] differentiates the sum of the terms returned by the
///   most recent `forward` and *accumulates* the result into the gradient
///   buffers of [`Model::parameters_mut`], creating a buffer the first time a
///   parameter receives a gradient.
/// - The parameter enumeration order never changes after construction.
///
/// # Thread Safety
///
/// Models must be `Send` but not `Sync`; the trainer keeps them behind a
/// `Mutex`, so autodiff frameworks with `!Sync` gradient types work.
///
/// # Example
///
/// ```rust,ignore
/// impl Model<DetectionBatch> for FineTunedDetector {
///     fn forward(&mut self, batch: &DetectionBatch, stream: StreamKind) -> DualResult<LossMap> {
///         let losses = self.detector.losses(batch, stream == StreamKind::Base)?;
///         Ok(losses)
///     }
///
///     fn backward(&mut self) -> DualResult<()> {
///         let grads = self.pending_loss.take().unwrap().backward()?;
///         self.capture_grads(&grads)
///     }
///
///     fn parameters(&self) -> &ParameterStore { &self.params }
///     fn parameters_mut(&mut self) -> &mut ParameterStore { &mut self.params }
/// }
/// ```
pub trait Model<B: Batch>: Send {
    /// Executes the forward pass and returns the named loss terms.
    fn forward(&mut self, batch: &B, stream: StreamKind) -> DualResult<LossMap>;

    /// Executes the backward pass for the most recent forward.
    fn backward(&mut self) -> DualResult<()>;

    /// The parameter store, in canonical order.
    fn parameters(&self) -> &ParameterStore;

    /// The parameter store, mutably.
    fn parameters_mut(&mut self) -> &mut ParameterStore;

    /// Whether the model is in training mode.
    fn is_training(&self) -> bool {
        true
    }

    /// Drops forward state when `backward` will not be called.
    fn clear_forward_state(&mut self) {}

    /// Updates normalization running statistics from one batch, without
    /// touching gradients. Used by precise-BN recalibration.
    fn update_norm_statistics(&mut self, batch: &B) -> DualResult<()> {
        let _ = batch;
        Ok(())
    }
}

/// Trait for optimizers that update model parameters.
///
/// # Example
///
/// ```rust,ignore
/// impl<M: Model<B>, B: Batch> Optimizer<M, B> for AdamW {
///     fn step(&mut self, model: &mut M) -> DualResult<()> {
///         self.update(model.parameters_mut())
///     }
///     // ...
/// }
/// ```
pub trait Optimizer<M, B: Batch>: Send
where
    M: Model<B>,
{
    /// Zero-fills every existing gradient buffer of the model.
    fn zero_grad(&mut self, model: &mut M) {
        model.parameters_mut().zero_grad();
    }

    /// Performs a single optimization step from the model's gradient buffers.
    ///
    /// Implementations should validate before writing, so that a failed step
    /// leaves the parameters unchanged.
    fn step(&mut self, model: &mut M) -> DualResult<()>;

    /// Returns the current learning rate.
    fn learning_rate(&self) -> f32;

    /// Sets the learning rate (for warmup/decay schedules).
    fn set_learning_rate(&mut self, lr: f32);
}

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```
/// use dual_stream_trainer_rs::prelude::*;
/// ```
pub mod prelude {
    pub use crate::checkpoint::Checkpointable;
    pub use crate::data::{CyclicSampler, TrainingStream};
    pub use crate::hooks::Evaluator;
    pub use crate::optimizer::Sgd;
    pub use crate::{
        Batch, DualResult, DualStreamConfig, DualStreamError, DualStreamTrainer,
        IterationOutcome, LossMap, Model, Optimizer, ParameterStore, ProcessInfo,
        RecoveryAction, StreamKind,
    };
}
