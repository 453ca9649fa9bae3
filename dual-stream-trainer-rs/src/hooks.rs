//! Iteration hooks.
//!
//! Hooks run around every iteration of the trainer loop. The standard
//! pipeline, in execution order:
//!
//! | Hook | Does | Primary only |
//! |---|---|---|
//! | [`IterationTimer`] | records `time` per iteration, logs total time | no |
//! | [`LrSchedulerHook`] | records `lr`, sets the next iteration's LR | no |
//! | [`PreciseBn`] | recalibrates normalization statistics | no |
//! | [`PeriodicCheckpointer`] | periodic and final checkpoints | yes |
//! | [`EvalHook`] | periodic and final evaluation | no |
//! | [`PeriodicWriter`] | flushes metric writers | yes |
//!
//! Precise BN runs before the checkpointer and the evaluator so that both see
//! recalibrated statistics. Primary-only hooks are skipped on other processes.
//!
//! # Failure handling
//!
//! A hook error with a recoverable action (e.g. a metrics write failure) is
//! logged and the pipeline moves on; a fatal hook error stops training.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::checkpoint::{CheckpointManager, Checkpointable, TrainerCheckpoint};
use crate::config::DualStreamConfig;
use crate::convergence::ConvergenceState;
use crate::data::TrainingStream;
use crate::error::{self, DualResult, DualStreamError};
use crate::metrics::{EventStorage, EventWriter};
use crate::scheduler::LrSchedule;
use crate::{Batch, Model, Optimizer};

/// Flattened evaluation results, e.g. `bbox/AP50 → 41.2`.
pub type EvalResults = BTreeMap<String, f64>;

/// Runs inference over an evaluation set.
pub trait Evaluator<M>: Send {
    /// Evaluates the model and returns flattened metrics.
    fn evaluate(&mut self, model: &mut M) -> DualResult<EvalResults>;
}

/// Evaluator shared between the evaluation hook and stand-alone evaluation.
pub type SharedEvaluator<M> = Arc<Mutex<Box<dyn Evaluator<M>>>>;

/// Everything a hook can see or touch.
pub struct HookContext<'a, M, O> {
    /// Current iteration (the one just run, for `after_step`).
    pub iteration: u64,
    /// First iteration of this run.
    pub start_iter: u64,
    /// Total iterations; the loop runs `start_iter..max_iter`.
    pub max_iter: u64,
    /// The model.
    pub model: &'a Arc<Mutex<M>>,
    /// The optimizer.
    pub optimizer: &'a Arc<Mutex<O>>,
    /// Scalar storage.
    pub storage: &'a mut EventStorage,
    /// Run configuration.
    pub config: &'a DualStreamConfig,
    /// Convergence state after the current iteration.
    pub convergence: &'a ConvergenceState,
    /// Latest evaluation results.
    pub eval_results: &'a mut Option<EvalResults>,
}

impl<M, O> HookContext<'_, M, O> {
    /// Iteration that follows the current one.
    #[must_use]
    pub fn next_iter(&self) -> u64 {
        self.iteration + 1
    }

    /// Whether the current iteration is the last one.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.next_iter() == self.max_iter
    }

    /// Whether the next iteration is a multiple of `period` (0 disables).
    #[must_use]
    pub fn at_period(&self, period: u64) -> bool {
        period > 0 && self.next_iter() % period == 0
    }
}

/// A hook called around training iterations.
///
/// All methods default to no-ops.
pub trait Hook<B, M, O>: Send {
    /// Hook name, for logs.
    fn name(&self) -> &str;

    /// Whether the hook only runs on the primary process.
    fn primary_only(&self) -> bool {
        false
    }

    /// Called once before the first iteration.
    fn before_train(&mut self, ctx: &mut HookContext<'_, M, O>) -> DualResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Called once after the last iteration.
    fn after_train(&mut self, ctx: &mut HookContext<'_, M, O>) -> DualResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Called before each iteration.
    fn before_step(&mut self, ctx: &mut HookContext<'_, M, O>) -> DualResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Called after each iteration, including skipped ones.
    fn after_step(&mut self, ctx: &mut HookContext<'_, M, O>) -> DualResult<()> {
        let _ = ctx;
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum HookEvent {
    BeforeTrain,
    AfterTrain,
    BeforeStep,
    AfterStep,
}

/// Ordered hooks, filtered by process role.
pub struct HookPipeline<B, M, O> {
    hooks: Vec<Box<dyn Hook<B, M, O>>>,
    is_primary: bool,
}

impl<B, M, O> HookPipeline<B, M, O> {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new(is_primary: bool) -> Self {
        Self {
            hooks: Vec::new(),
            is_primary,
        }
    }

    /// Appends a hook.
    pub fn register(&mut self, hook: Box<dyn Hook<B, M, O>>) {
        self.hooks.push(hook);
    }

    /// Inserts hooks ahead of the ones already registered.
    pub fn prepend(&mut self, hooks: Vec<Box<dyn Hook<B, M, O>>>) {
        self.hooks.splice(0..0, hooks);
    }

    /// Number of registered hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether no hooks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Names of the hooks that run on this process, in order.
    #[must_use]
    pub fn active_names(&self) -> Vec<String> {
        self.hooks
            .iter()
            .filter(|h| self.is_primary || !h.primary_only())
            .map(|h| h.name().to_string())
            .collect()
    }

    /// Runs `before_train` on every active hook.
    pub fn before_train(&mut self, ctx: &mut HookContext<'_, M, O>) -> DualResult<()> {
        self.dispatch(HookEvent::BeforeTrain, ctx)
    }

    /// Runs `after_train` on every active hook.
    pub fn after_train(&mut self, ctx: &mut HookContext<'_, M, O>) -> DualResult<()> {
        self.dispatch(HookEvent::AfterTrain, ctx)
    }

    /// Runs `before_step` on every active hook.
    pub fn before_step(&mut self, ctx: &mut HookContext<'_, M, O>) -> DualResult<()> {
        self.dispatch(HookEvent::BeforeStep, ctx)
    }

    /// Runs `after_step` on every active hook.
    pub fn after_step(&mut self, ctx: &mut HookContext<'_, M, O>) -> DualResult<()> {
        self.dispatch(HookEvent::AfterStep, ctx)
    }

    fn dispatch(&mut self, event: HookEvent, ctx: &mut HookContext<'_, M, O>) -> DualResult<()> {
        let is_primary = self.is_primary;
        for hook in self.hooks.iter_mut().filter(|h| is_primary || !h.primary_only()) {
            let result = match event {
                HookEvent::BeforeTrain => hook.before_train(ctx),
                HookEvent::AfterTrain => hook.after_train(ctx),
                HookEvent::BeforeStep => hook.before_step(ctx),
                HookEvent::AfterStep => hook.after_step(ctx),
            };
            match result {
                Ok(()) => {}
                Err((err, action)) if error::is_recoverable(action.as_ref()) => {
                    warn!(hook = hook.name(), error = %err, "hook failed, continuing");
                }
                Err(fatal) => return Err(fatal),
            }
        }
        Ok(())
    }
}

/// Records per-iteration wall time as the `time` scalar.
#[derive(Debug, Default)]
pub struct IterationTimer {
    train_start: Option<Instant>,
    step_start: Option<Instant>,
    step_total: Duration,
    steps: u64,
}

impl IterationTimer {
    /// Creates a timer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<B, M, O> Hook<B, M, O> for IterationTimer {
    fn name(&self) -> &str {
        "IterationTimer"
    }

    fn before_train(&mut self, _ctx: &mut HookContext<'_, M, O>) -> DualResult<()> {
        self.train_start = Some(Instant::now());
        self.step_total = Duration::ZERO;
        self.steps = 0;
        Ok(())
    }

    fn before_step(&mut self, _ctx: &mut HookContext<'_, M, O>) -> DualResult<()> {
        self.step_start = Some(Instant::now());
        Ok(())
    }

    fn after_step(&mut self, ctx: &mut HookContext<'_, M, O>) -> DualResult<()> {
        if let Some(start) = self.step_start.take() {
            let elapsed = start.elapsed();
            self.step_total += elapsed;
            self.steps += 1;
            ctx.storage.put_scalar("time", elapsed.as_secs_f64());
        }
        Ok(())
    }

    fn after_train(&mut self, _ctx: &mut HookContext<'_, M, O>) -> DualResult<()> {
        let Some(start) = self.train_start else {
            return Ok(());
        };
        let total = start.elapsed();
        if self.steps > 0 {
            let per_iter = self.step_total.as_secs_f64() / self.steps as f64;
            info!(
                iterations = self.steps,
                seconds_per_iter = per_iter,
                "overall training speed"
            );
        }
        info!(
            total_seconds = total.as_secs_f64(),
            hook_seconds = total.saturating_sub(self.step_total).as_secs_f64(),
            "total training time"
        );
        Ok(())
    }
}

/// Drives the optimizer's learning rate from a schedule.
pub struct LrSchedulerHook<S> {
    schedule: S,
}

impl<S: LrSchedule> LrSchedulerHook<S> {
    /// Wraps a schedule.
    #[must_use]
    pub fn new(schedule: S) -> Self {
        Self { schedule }
    }
}

impl<B, M, O, S> Hook<B, M, O> for LrSchedulerHook<S>
where
    B: Batch,
    M: Model<B>,
    O: Optimizer<M, B>,
    S: LrSchedule,
{
    fn name(&self) -> &str {
        "LRScheduler"
    }

    fn before_train(&mut self, ctx: &mut HookContext<'_, M, O>) -> DualResult<()> {
        let lr = self.schedule.lr_at(ctx.start_iter);
        ctx.optimizer.lock().set_learning_rate(lr);
        Ok(())
    }

    fn after_step(&mut self, ctx: &mut HookContext<'_, M, O>) -> DualResult<()> {
        let mut optimizer = ctx.optimizer.lock();
        ctx.storage
            .put_scalar("lr", f64::from(optimizer.learning_rate()));
        optimizer.set_learning_rate(self.schedule.lr_at(ctx.next_iter()));
        Ok(())
    }
}

/// Recomputes normalization running statistics over a dedicated stream.
///
/// Runs at every evaluation period and after the final iteration.
pub struct PreciseBn<B> {
    stream: TrainingStream<B>,
    num_iter: usize,
    period: u64,
}

impl<B> PreciseBn<B> {
    /// Creates the hook.
    #[must_use]
    pub fn new(stream: TrainingStream<B>, num_iter: usize, period: u64) -> Self {
        Self {
            stream,
            num_iter,
            period,
        }
    }

    fn recalibrate<M: Model<B>>(&mut self, model: &mut M) -> DualResult<()>
    where
        B: Batch,
    {
        for _ in 0..self.num_iter {
            let batch = self.stream.next_batch()?;
            model.update_norm_statistics(&batch)?;
        }
        Ok(())
    }
}

impl<B, M, O> Hook<B, M, O> for PreciseBn<B>
where
    B: Batch,
    M: Model<B>,
{
    fn name(&self) -> &str {
        "PreciseBN"
    }

    fn after_step(&mut self, ctx: &mut HookContext<'_, M, O>) -> DualResult<()> {
        if ctx.is_final() || ctx.at_period(self.period) {
            info!(
                iteration = ctx.iteration,
                batches = self.num_iter,
                "recomputing precise normalization statistics"
            );
            let mut model = ctx.model.lock();
            self.recalibrate(&mut *model)?;
        }
        Ok(())
    }
}

/// Saves periodic checkpoints and `model_final`.
pub struct PeriodicCheckpointer {
    manager: CheckpointManager,
    period: u64,
}

impl PeriodicCheckpointer {
    /// Creates the hook.
    #[must_use]
    pub fn new(manager: CheckpointManager, period: u64) -> Self {
        Self { manager, period }
    }
}

/// Captures the full trainer checkpoint for the context's iteration.
pub(crate) fn capture_checkpoint<M, O>(ctx: &HookContext<'_, M, O>) -> DualResult<TrainerCheckpoint>
where
    M: Checkpointable,
    O: Checkpointable,
{
    let model = ctx.model.lock().state_dict()?;
    let optimizer = ctx.optimizer.lock().state_dict()?;
    Ok(TrainerCheckpoint::new(
        ctx.iteration,
        ctx.convergence.clone(),
        ctx.config.clone(),
        model,
        optimizer,
    ))
}

impl<B, M, O> Hook<B, M, O> for PeriodicCheckpointer
where
    M: Checkpointable + Send,
    O: Checkpointable + Send,
{
    fn name(&self) -> &str {
        "PeriodicCheckpointer"
    }

    fn primary_only(&self) -> bool {
        true
    }

    fn after_step(&mut self, ctx: &mut HookContext<'_, M, O>) -> DualResult<()> {
        let periodic = ctx.at_period(self.period);
        let is_final = ctx.is_final();
        if !periodic && !is_final {
            return Ok(());
        }

        let checkpoint = capture_checkpoint(ctx)?;
        if periodic {
            self.manager.save_periodic(&checkpoint)?;
        }
        if is_final {
            self.manager.save_named("model_final", &checkpoint)?;
        }
        Ok(())
    }
}

/// Runs the evaluator periodically and after the final iteration.
pub struct EvalHook<M> {
    evaluator: SharedEvaluator<M>,
    period: u64,
}

impl<M> EvalHook<M> {
    /// Creates the hook.
    #[must_use]
    pub fn new(evaluator: SharedEvaluator<M>, period: u64) -> Self {
        Self { evaluator, period }
    }
}

/// Runs an evaluator and checks that every metric is finite.
pub(crate) fn run_evaluator<M>(evaluator: &SharedEvaluator<M>, model: &mut M) -> DualResult<EvalResults> {
    let results = evaluator.lock().evaluate(model)?;
    if let Some((name, value)) = results.iter().find(|(_, v)| !v.is_finite()) {
        return error::fatal(DualStreamError::EvaluationError {
            detail: format!("metric '{name}' is not a finite number ({value})"),
        });
    }
    Ok(results)
}

impl<B, M, O> Hook<B, M, O> for EvalHook<M>
where
    M: Send,
{
    fn name(&self) -> &str {
        "EvalHook"
    }

    fn after_step(&mut self, ctx: &mut HookContext<'_, M, O>) -> DualResult<()> {
        if !ctx.is_final() && !ctx.at_period(self.period) {
            return Ok(());
        }

        let results = {
            let mut model = ctx.model.lock();
            run_evaluator(&self.evaluator, &mut *model)?
        };
        info!(iteration = ctx.iteration, ?results, "evaluation results");
        for (name, value) in &results {
            ctx.storage.put_scalar(name, *value);
        }
        *ctx.eval_results = Some(results);
        Ok(())
    }
}

/// Flushes metric writers every `period` iterations and at the end.
pub struct PeriodicWriter {
    writers: Vec<Box<dyn EventWriter>>,
    period: u64,
}

impl PeriodicWriter {
    /// Creates the hook.
    #[must_use]
    pub fn new(writers: Vec<Box<dyn EventWriter>>, period: u64) -> Self {
        Self { writers, period }
    }

    fn write_all(&mut self, storage: &EventStorage) -> DualResult<()> {
        for writer in &mut self.writers {
            writer.write(storage)?;
        }
        Ok(())
    }
}

impl<B, M, O> Hook<B, M, O> for PeriodicWriter {
    fn name(&self) -> &str {
        "PeriodicWriter"
    }

    fn primary_only(&self) -> bool {
        true
    }

    fn after_step(&mut self, ctx: &mut HookContext<'_, M, O>) -> DualResult<()> {
        if ctx.at_period(self.period) || ctx.is_final() {
            self.write_all(&*ctx.storage)?;
        }
        Ok(())
    }

    fn after_train(&mut self, ctx: &mut HookContext<'_, M, O>) -> DualResult<()> {
        self.write_all(&*ctx.storage)?;
        for writer in &mut self.writers {
            writer.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergence::ConvergenceTracker;
    use crate::error::RecoveryAction;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        primary_only: bool,
        fail_recoverable: bool,
    }

    impl Hook<(), (), ()> for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn primary_only(&self) -> bool {
            self.primary_only
        }

        fn after_step(&mut self, _ctx: &mut HookContext<'_, (), ()>) -> DualResult<()> {
            self.log.lock().push(self.name.to_string());
            if self.fail_recoverable {
                return Err((
                    DualStreamError::WriterError {
                        detail: "disk full".into(),
                    },
                    Some(RecoveryAction::Continue),
                ));
            }
            Ok(())
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>, primary_only: bool) -> Box<Recorder> {
        Box::new(Recorder {
            name,
            log: Arc::clone(log),
            primary_only,
            fail_recoverable: false,
        })
    }

    fn run_after_step(pipeline: &mut HookPipeline<(), (), ()>, iteration: u64) -> DualResult<()> {
        let config = DualStreamConfig::default();
        let convergence = ConvergenceTracker::new(&config.dynamic).state();
        let model = Arc::new(Mutex::new(()));
        let optimizer = Arc::new(Mutex::new(()));
        let mut storage = EventStorage::default();
        let mut eval_results = None;
        let mut ctx = HookContext {
            iteration,
            start_iter: 0,
            max_iter: 10,
            model: &model,
            optimizer: &optimizer,
            storage: &mut storage,
            config: &config,
            convergence: &convergence,
            eval_results: &mut eval_results,
        };
        pipeline.after_step(&mut ctx)
    }

    #[test]
    fn test_pipeline_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = HookPipeline::new(true);
        pipeline.register(recorder("precise_bn", &log, false));
        pipeline.register(recorder("checkpoint", &log, true));
        pipeline.register(recorder("eval", &log, false));
        pipeline.register(recorder("writer", &log, true));

        run_after_step(&mut pipeline, 0).unwrap();
        assert_eq!(
            *log.lock(),
            vec!["precise_bn", "checkpoint", "eval", "writer"]
        );
    }

    #[test]
    fn test_primary_only_hooks_skipped_on_replicas() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = HookPipeline::new(false);
        pipeline.register(recorder("checkpoint", &log, true));
        pipeline.register(recorder("eval", &log, false));
        pipeline.register(recorder("writer", &log, true));

        run_after_step(&mut pipeline, 0).unwrap();
        assert_eq!(*log.lock(), vec!["eval"]);
        assert_eq!(pipeline.active_names(), vec!["eval".to_string()]);
    }

    #[test]
    fn test_recoverable_hook_error_does_not_stop_pipeline() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = HookPipeline::new(true);
        pipeline.register(Box::new(Recorder {
            name: "writer",
            log: Arc::clone(&log),
            primary_only: false,
            fail_recoverable: true,
        }));
        pipeline.register(recorder("after", &log, false));

        run_after_step(&mut pipeline, 3).unwrap();
        assert_eq!(*log.lock(), vec!["writer", "after"]);
    }

    #[test]
    fn test_context_periods() {
        let config = DualStreamConfig::default();
        let convergence = ConvergenceTracker::new(&config.dynamic).state();
        let model = Arc::new(Mutex::new(()));
        let optimizer = Arc::new(Mutex::new(()));
        let mut storage = EventStorage::default();
        let mut eval_results = None;
        let ctx: HookContext<'_, (), ()> = HookContext {
            iteration: 4999,
            start_iter: 0,
            max_iter: 10_000,
            model: &model,
            optimizer: &optimizer,
            storage: &mut storage,
            config: &config,
            convergence: &convergence,
            eval_results: &mut eval_results,
        };
        assert!(ctx.at_period(5000));
        assert!(!ctx.at_period(0));
        assert!(!ctx.is_final());
    }
}
