//! One dual-stream training iteration.
//!
//! [`DualStreamStep::run`] walks a small state machine per iteration:
//!
//! ```text
//!   Idle ──▶ NovelForwardBackward ──▶ BaseForwardBackward ──▶ Mix ──▶ Apply ──▶ Idle
//!    │ ▲            │                                                  │
//!    │ │            └──────────────── skip ──▶ Idle ◀──── skip ────────┘
//!    └─┘ past the iteration ceiling
//! ```
//!
//! 1. Clear gradients, draw a novel batch, forward + backward, capture
//!    `grad_novel`.
//! 2. Clear gradients, draw a base batch, forward + backward, capture
//!    `grad_base`.
//! 3. Fold the base loss into the EMA, derive the convergence and angle
//!    signals, combine the two gradients.
//! 4. Write the mixed gradient back and step the optimizer.
//!
//! Recoverable failures become [`IterationOutcome::Skipped`]; the optimizer
//! never runs in a skipped iteration, so parameters are untouched. Fatal
//! failures are returned as errors.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, debug_span, info, warn};

use crate::config::DualStreamConfig;
use crate::convergence::{ConvergenceState, ConvergenceTracker};
use crate::data::TrainingStream;
use crate::error::{self, DualResult, DualStreamError, RecoveryAction};
use crate::gradient::{self, GradientLayout};
use crate::metrics::EventStorage;
use crate::mixer::{GradientMixer, MixingDecision};
use crate::{Batch, LossMap, Model, Optimizer, StreamKind};

/// Stage of the per-iteration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepStage {
    /// Between iterations.
    Idle,
    /// Novel batch forward and backward pass.
    NovelForwardBackward,
    /// Base batch forward and backward pass.
    BaseForwardBackward,
    /// EMA update, signals and gradient combination.
    Mix,
    /// Gradient assignment and optimizer step.
    Apply,
}

impl fmt::Display for StepStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::NovelForwardBackward => "novel_forward_backward",
            Self::BaseForwardBackward => "base_forward_backward",
            Self::Mix => "mix",
            Self::Apply => "apply",
        };
        f.write_str(name)
    }
}

/// Summary of an applied iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationReport {
    /// Iteration index.
    pub iteration: u64,
    /// Summed novel-stream loss.
    pub loss_novel: f32,
    /// Summed base-stream loss.
    pub loss_base: f32,
    /// Base-loss EMA after this iteration's update.
    pub ema: f32,
    /// Mixing coefficients used.
    pub decision: MixingDecision,
}

/// Result of one call to [`DualStreamStep::run`].
#[derive(Debug, Clone, PartialEq)]
pub enum IterationOutcome {
    /// The mixed gradient was applied.
    Applied(IterationReport),
    /// A recoverable failure; nothing was applied.
    Skipped {
        /// Stage that failed.
        stage: StepStage,
        /// Error description.
        reason: String,
    },
    /// The iteration is past the configured ceiling and was not executed.
    BeyondCeiling,
}

impl IterationOutcome {
    /// Returns whether an update was applied.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// Returns the report of an applied iteration.
    #[must_use]
    pub fn report(&self) -> Option<&IterationReport> {
        match self {
            Self::Applied(report) => Some(report),
            _ => None,
        }
    }
}

/// Orchestrates dual-stream iterations.
///
/// Owns the gradient layout (computed once, at construction), the convergence
/// tracker and the iteration ceiling. The model, optimizer and streams are
/// borrowed per call.
#[derive(Debug, Clone)]
pub struct DualStreamStep {
    layout: GradientLayout,
    tracker: ConvergenceTracker,
    mixer: GradientMixer,
    ceiling: Option<u64>,
    ceiling_reported: bool,
    stage: StepStage,
}

impl DualStreamStep {
    /// Builds the step for a model's parameter store.
    ///
    /// # Errors
    ///
    /// Returns a fatal `ParameterError` if the store has no gradient-bearing
    /// parameters.
    pub fn new(config: &DualStreamConfig, store: &crate::ParameterStore) -> DualResult<Self> {
        let layout = GradientLayout::from_store(store);
        if layout.entries().is_empty() {
            return error::fatal(DualStreamError::ParameterError {
                detail: "model has no trainable parameters".to_string(),
            });
        }
        debug!(
            parameters = layout.entries().len(),
            scalars = layout.total_numel(),
            "gradient layout built"
        );

        Ok(Self {
            layout,
            tracker: ConvergenceTracker::new(&config.dynamic),
            mixer: GradientMixer::new(),
            ceiling: config.solver.ceiling(),
            ceiling_reported: false,
            stage: StepStage::Idle,
        })
    }

    /// Replaces the convergence state, e.g. after resuming.
    pub fn restore_convergence(&mut self, config: &DualStreamConfig, state: ConvergenceState) {
        self.tracker = ConvergenceTracker::from_state(&config.dynamic, state);
    }

    /// The gradient layout.
    #[must_use]
    pub fn layout(&self) -> &GradientLayout {
        &self.layout
    }

    /// The convergence tracker.
    #[must_use]
    pub fn tracker(&self) -> &ConvergenceTracker {
        &self.tracker
    }

    /// The iteration ceiling, if enabled.
    #[must_use]
    pub fn ceiling(&self) -> Option<u64> {
        self.ceiling
    }

    /// Current state machine stage; `Idle` outside of `run`.
    #[must_use]
    pub fn stage(&self) -> StepStage {
        self.stage
    }

    /// Executes iteration `iteration`.
    ///
    /// # Errors
    ///
    /// Returns fatal errors only: exhausted streams, a model outside training
    /// mode, a changed parameter store, or a base-pass failure without a
    /// recovery suggestion.
    pub fn run<B, M, O>(
        &mut self,
        iteration: u64,
        model: &mut M,
        optimizer: &mut O,
        novel: &mut TrainingStream<B>,
        base: &mut TrainingStream<B>,
        storage: &mut EventStorage,
    ) -> DualResult<IterationOutcome>
    where
        B: Batch,
        M: Model<B>,
        O: Optimizer<M, B>,
    {
        if let Some(ceiling) = self.ceiling.filter(|&c| iteration > c) {
            if !self.ceiling_reported {
                info!(
                    iteration,
                    ceiling, "iteration ceiling passed; remaining iterations are no-ops"
                );
                self.ceiling_reported = true;
            }
            return Ok(IterationOutcome::BeyondCeiling);
        }

        if !model.is_training() {
            return error::fatal(DualStreamError::ConfigError {
                detail: "model was switched to evaluation mode".to_string(),
            });
        }

        let span = debug_span!("dual_stream_step", iteration);
        let _enter = span.enter();

        let result = self.execute(iteration, model, optimizer, novel, base, storage);
        let failed_stage = self.stage;
        self.stage = StepStage::Idle;

        match result {
            Ok(report) => Ok(IterationOutcome::Applied(report)),
            Err((err, action)) if error::is_recoverable(action.as_ref()) => {
                warn!(
                    iteration,
                    stage = %failed_stage,
                    error = %err,
                    "iteration skipped, no update applied"
                );
                storage.put_scalar("dynamic/skipped", 1.0);
                Ok(IterationOutcome::Skipped {
                    stage: failed_stage,
                    reason: err.to_string(),
                })
            }
            Err(fatal) => Err(fatal),
        }
    }

    fn execute<B, M, O>(
        &mut self,
        iteration: u64,
        model: &mut M,
        optimizer: &mut O,
        novel: &mut TrainingStream<B>,
        base: &mut TrainingStream<B>,
        storage: &mut EventStorage,
    ) -> DualResult<IterationReport>
    where
        B: Batch,
        M: Model<B>,
        O: Optimizer<M, B>,
    {
        // Novel stream: any model failure skips the iteration.
        self.stage = StepStage::NovelForwardBackward;
        optimizer.zero_grad(model);
        let batch = novel.next_batch()?;
        let (losses_novel, loss_novel) =
            forward_backward(model, &batch, StreamKind::Novel, iteration)
                .map_err(|(err, action)| (err, Some(transient(action))))?;
        let grad_novel = gradient::flatten(&self.layout, model.parameters())?;
        storage.put_scalar("dynamic/loss_n", f64::from(loss_novel));
        storage.put_losses("novel", &losses_novel);

        // Base stream: failures keep the model's own recovery suggestion.
        self.stage = StepStage::BaseForwardBackward;
        optimizer.zero_grad(model);
        let batch = base.next_batch()?;
        let (losses_base, loss_base) = forward_backward(model, &batch, StreamKind::Base, iteration)?;
        let grad_base = gradient::flatten(&self.layout, model.parameters())?;
        storage.put_scalar("dynamic/loss_b", f64::from(loss_base));
        storage.put_losses("base", &losses_base);

        self.stage = StepStage::Mix;
        let ema = self.tracker.update(loss_base);
        let general_converge = self.tracker.convergence_signal(ema, iteration)?;
        let (new_grad, decision) = self
            .mixer
            .mix(&grad_base, &grad_novel, general_converge, iteration)?;
        storage.put_scalar("dynamic/ema_lb", f64::from(ema));
        storage.put_scalar("dynamic/converge", f64::from(decision.general_converge));
        storage.put_scalar("dynamic/angle", f64::from(decision.angle_base));
        storage.put_scalar("dynamic/lambda", f64::from(decision.dynamic_lambda));
        debug!(
            ema,
            converge = decision.general_converge,
            angle = decision.angle_base,
            lambda = decision.dynamic_lambda,
            "gradients mixed"
        );

        // Apply: failures are reported and the iteration becomes a no-op.
        self.stage = StepStage::Apply;
        gradient::assign(&self.layout, model.parameters_mut(), &new_grad)
            .and_then(|()| optimizer.step(model))
            .map_err(|(err, action)| (err, Some(transient(action))))?;

        Ok(IterationReport {
            iteration,
            loss_novel,
            loss_base,
            ema,
            decision,
        })
    }
}

/// Runs forward and backward for one batch and returns the losses and their sum.
fn forward_backward<B, M>(
    model: &mut M,
    batch: &B,
    stream: StreamKind,
    iteration: u64,
) -> DualResult<(LossMap, f32)>
where
    B: Batch,
    M: Model<B>,
{
    let losses = model.forward(batch, stream)?;
    let total: f32 = losses.values().sum();
    if !total.is_finite() {
        model.clear_forward_state();
        return error::skip(DualStreamError::NumericalInstability {
            detail: format!("{stream} loss is not finite ({total})"),
            iteration,
        });
    }
    model.backward()?;
    Ok((losses, total))
}

/// Downgrades a recovery suggestion to a skip unless it asks to abort.
fn transient(action: Option<RecoveryAction>) -> RecoveryAction {
    match action {
        Some(abort @ RecoveryAction::Abort { .. }) => abort,
        _ => RecoveryAction::SkipIteration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::Sgd;
    use crate::ParameterStore;

    /// Linear least-squares model: loss = 0.5 · (w · x − y)² per term.
    struct Linear {
        store: ParameterStore,
        pending: Option<Vec<f32>>,
        fail_novel_backward: bool,
        last_stream: Option<StreamKind>,
    }

    #[derive(Clone)]
    struct Sample {
        x: [f32; 2],
        y: f32,
    }

    impl Batch for Sample {
        fn batch_size(&self) -> usize {
            1
        }
    }

    impl Linear {
        fn new() -> Self {
            let mut store = ParameterStore::new();
            store.insert_named("w", vec![2], vec![0.5, -0.5]).unwrap();
            Self {
                store,
                pending: None,
                fail_novel_backward: false,
                last_stream: None,
            }
        }
    }

    impl Model<Sample> for Linear {
        fn forward(&mut self, batch: &Sample, stream: StreamKind) -> DualResult<LossMap> {
            let w = self.store.get("w").unwrap().data();
            let residual = w[0] * batch.x[0] + w[1] * batch.x[1] - batch.y;
            self.pending = Some(vec![residual * batch.x[0], residual * batch.x[1]]);
            self.last_stream = Some(stream);
            let mut losses = LossMap::new();
            losses.insert("loss_reg".to_string(), 0.5 * residual * residual);
            Ok(losses)
        }

        fn backward(&mut self) -> DualResult<()> {
            if self.fail_novel_backward && self.last_stream == Some(StreamKind::Novel) {
                return Err((
                    DualStreamError::BackwardFailed {
                        stream: StreamKind::Novel,
                        iteration: 0,
                        detail: "forced".into(),
                    },
                    None,
                ));
            }
            let grad = self.pending.take().unwrap_or_default();
            self.store.accumulate_grad("w", &grad)
        }

        fn parameters(&self) -> &ParameterStore {
            &self.store
        }

        fn parameters_mut(&mut self) -> &mut ParameterStore {
            &mut self.store
        }
    }

    fn streams() -> (TrainingStream<Sample>, TrainingStream<Sample>) {
        let novel = std::iter::repeat(Sample { x: [0.0, 1.0], y: 2.0 });
        let base = std::iter::repeat(Sample { x: [1.0, 0.0], y: -1.0 });
        (
            TrainingStream::new(StreamKind::Novel, novel),
            TrainingStream::new(StreamKind::Base, base),
        )
    }

    fn config() -> DualStreamConfig {
        DualStreamConfig::builder().base_lr(0.1).build()
    }

    #[test]
    fn test_applied_iteration_moves_parameters() {
        let config = config();
        let mut model = Linear::new();
        let mut optimizer = Sgd::from_config(&config.solver);
        let mut step = DualStreamStep::new(&config, model.parameters()).unwrap();
        let (mut novel, mut base) = streams();
        let mut storage = EventStorage::default();

        let before = model.parameters().values_snapshot();
        let outcome = step
            .run(0, &mut model, &mut optimizer, &mut novel, &mut base, &mut storage)
            .unwrap();

        let report = outcome.report().unwrap();
        assert!(report.decision.dynamic_lambda >= report.decision.general_converge);
        assert_ne!(model.parameters().values_snapshot(), before);
        assert_eq!(step.stage(), StepStage::Idle);
        assert!(storage.latest_value("dynamic/lambda").is_some());
        assert!(storage.latest_value("novel/loss_reg").is_some());
    }

    #[test]
    fn test_novel_failure_is_skipped() {
        let config = config();
        let mut model = Linear::new();
        model.fail_novel_backward = true;
        let mut optimizer = Sgd::from_config(&config.solver);
        let mut step = DualStreamStep::new(&config, model.parameters()).unwrap();
        let (mut novel, mut base) = streams();
        let mut storage = EventStorage::default();

        let before = model.parameters().values_snapshot();
        let outcome = step
            .run(0, &mut model, &mut optimizer, &mut novel, &mut base, &mut storage)
            .unwrap();

        assert!(matches!(
            outcome,
            IterationOutcome::Skipped {
                stage: StepStage::NovelForwardBackward,
                ..
            }
        ));
        assert_eq!(model.parameters().values_snapshot(), before);
        assert_eq!(base.drawn(), 0);
        assert_eq!(step.tracker().ema(), None);
    }

    #[test]
    fn test_beyond_ceiling_is_noop() {
        let config = config();
        let mut model = Linear::new();
        let mut optimizer = Sgd::from_config(&config.solver);
        let mut step = DualStreamStep::new(&config, model.parameters()).unwrap();
        let (mut novel, mut base) = streams();
        let mut storage = EventStorage::default();

        assert_eq!(step.ceiling(), Some(8000));
        let outcome = step
            .run(8001, &mut model, &mut optimizer, &mut novel, &mut base, &mut storage)
            .unwrap();
        assert_eq!(outcome, IterationOutcome::BeyondCeiling);
        assert_eq!(novel.drawn(), 0);
        assert_eq!(optimizer.steps_taken(), 0);
    }

    #[test]
    fn test_beyond_ceiling_leaves_buffers_untouched() {
        let config = config();
        let mut model = Linear::new();
        let mut optimizer = Sgd::from_config(&config.solver);
        let mut step = DualStreamStep::new(&config, model.parameters()).unwrap();
        let (mut novel, mut base) = streams();
        let mut storage = EventStorage::default();

        let outcome = step
            .run(0, &mut model, &mut optimizer, &mut novel, &mut base, &mut storage)
            .unwrap();
        assert!(outcome.is_applied());

        let grads = model.parameters().grads_snapshot();
        let values = model.parameters().values_snapshot();
        let tracker = step.tracker().state();
        assert!(grads.iter().all(Option::is_some));

        let outcome = step
            .run(8001, &mut model, &mut optimizer, &mut novel, &mut base, &mut storage)
            .unwrap();
        assert_eq!(outcome, IterationOutcome::BeyondCeiling);
        assert_eq!(model.parameters().grads_snapshot(), grads);
        assert_eq!(model.parameters().values_snapshot(), values);
        assert_eq!(step.tracker().state(), tracker);
        assert_eq!(optimizer.steps_taken(), 1);
    }

    #[test]
    fn test_ceiling_iteration_itself_runs() {
        let config = config();
        let mut model = Linear::new();
        let mut optimizer = Sgd::from_config(&config.solver);
        let mut step = DualStreamStep::new(&config, model.parameters()).unwrap();
        let (mut novel, mut base) = streams();
        let mut storage = EventStorage::default();

        let outcome = step
            .run(8000, &mut model, &mut optimizer, &mut novel, &mut base, &mut storage)
            .unwrap();
        assert!(outcome.is_applied());
    }

    #[test]
    fn test_empty_model_rejected() {
        let config = config();
        let store = ParameterStore::new();
        let (err, action) = DualStreamStep::new(&config, &store).unwrap_err();
        assert!(matches!(err, DualStreamError::ParameterError { .. }));
        assert!(action.is_none());
    }

    #[test]
    fn test_transient_keeps_abort() {
        let abort = RecoveryAction::Abort {
            reason: "oom".into(),
        };
        assert_eq!(transient(Some(abort.clone())), abort);
        assert_eq!(transient(None), RecoveryAction::SkipIteration);
    }
}
