//! The training loop.
//!
//! [`DualStreamTrainer`] owns the model, the optimizer and both training
//! streams, and drives iterations `start_iter..max_iter`. Each iteration:
//!
//! 1. `before_step` hooks
//! 2. [`DualStreamStep::run`]
//! 3. `after_step` hooks (timer, LR, precise BN, checkpoint, eval, writer)
//!
//! The iteration counter advances by exactly one per iteration, whether the
//! update was applied, skipped, or bypassed past the ceiling.

use parking_lot::{Mutex, MutexGuard};
use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::checkpoint::{CheckpointManager, Checkpointable, TrainerCheckpoint};
use crate::config::DualStreamConfig;
use crate::data::TrainingStream;
use crate::error::{self, DualResult, DualStreamError};
use crate::hooks::{
    self, EvalHook, EvalResults, Evaluator, Hook, HookContext, HookPipeline, IterationTimer,
    LrSchedulerHook, PeriodicCheckpointer, PeriodicWriter, PreciseBn, SharedEvaluator,
};
use crate::metrics::{CommonMetricPrinter, EventStorage, EventWriter, JsonWriter, TrainingStatistics};
use crate::scheduler::WarmupMultiStep;
use crate::step::{DualStreamStep, IterationOutcome};
use crate::{Batch, Model, Optimizer};

/// Rank of this process within a multi-process run.
///
/// Gradient synchronisation between replicas is the model's business; the
/// trainer only uses the rank for seeding and to keep file-writing hooks on
/// the primary process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Rank of this process, `0..world_size`.
    pub rank: usize,
    /// Number of processes.
    pub world_size: usize,
}

impl ProcessInfo {
    /// A single-process run.
    #[must_use]
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// Process `rank` of `world_size`.
    #[must_use]
    pub fn new(rank: usize, world_size: usize) -> Self {
        Self { rank, world_size }
    }

    /// Whether this is the primary (rank 0) process.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }

    /// Per-process seed: `base + rank`, with a random base when unset.
    #[must_use]
    pub fn derive_seed(&self, base: Option<u64>) -> u64 {
        base.unwrap_or_else(|| u64::from(rand::random::<u32>()))
            .wrapping_add(self.rank as u64)
    }
}

impl Default for ProcessInfo {
    fn default() -> Self {
        Self::single()
    }
}

/// Prepares the output directory and logs the run setup.
///
/// On the primary process the output directory is created and the full
/// configuration is written to `config.toml`. Returns this process's seed.
///
/// # Errors
///
/// Returns a fatal `ConfigError` if the configuration is invalid or the
/// output directory cannot be written.
pub fn default_setup(config: &DualStreamConfig, process: &ProcessInfo) -> DualResult<u64> {
    config.validate()?;

    if process.is_primary() {
        std::fs::create_dir_all(&config.output_dir).map_err(|e| {
            (
                DualStreamError::ConfigError {
                    detail: format!(
                        "failed to create output directory {}: {e}",
                        config.output_dir.display()
                    ),
                },
                None,
            )
        })?;
    }

    info!(
        rank = process.rank,
        world_size = process.world_size,
        "process setup"
    );
    info!("running with full config:\n{}", config.to_toml_string()?);

    if process.is_primary() {
        let path = config.output_dir.join("config.toml");
        config.to_file(&path)?;
        info!(path = %path.display(), "full config saved");
    }

    let seed = process.derive_seed(config.seed);
    info!(seed, "using seed for stream shuffling");
    Ok(seed)
}

/// Dual-stream fine-tuning loop.
///
/// # Type Parameters
///
/// - `B`: batch type shared by both streams
/// - `M`: the model
/// - `O`: the optimizer
///
/// # Example
///
/// ```rust,ignore
/// let config = DualStreamConfig::from_file("finetune.toml")?;
/// let process = ProcessInfo::single();
/// let seed = default_setup(&config, &process)?;
///
/// let novel = TrainingStream::new(StreamKind::Novel, CyclicSampler::new(novel_set, seed));
/// let base = TrainingStream::new(StreamKind::Base, CyclicSampler::new(base_set, seed));
///
/// let mut trainer = DualStreamTrainer::new(model, Sgd::from_config(&config.solver), novel, base, config, process)?;
/// trainer.set_evaluator(MyEvaluator::new(test_set));
/// trainer.resume_or_load(true, None)?;
/// let results = trainer.train()?;
/// ```
pub struct DualStreamTrainer<B, M, O> {
    /// The model being trained.
    ///
    /// Uses `Mutex` instead of `RwLock` because models may not be `Sync`.
    model: Arc<Mutex<M>>,

    /// The optimizer for parameter updates.
    optimizer: Arc<Mutex<O>>,

    /// Novel-class batches.
    novel: TrainingStream<B>,

    /// Base-class batches.
    base: TrainingStream<B>,

    /// Per-iteration gradient balancing state.
    step: DualStreamStep,

    /// Hooks around each iteration.
    hooks: HookPipeline<B, M, O>,

    /// Whether the default hooks have been built.
    default_hooks_built: bool,

    /// Evaluator for the eval hook and `evaluate`.
    evaluator: Option<SharedEvaluator<M>>,

    /// Dedicated stream for precise-BN recalibration.
    precise_bn_stream: Option<TrainingStream<B>>,

    /// Per-iteration scalars.
    storage: EventStorage,

    /// Applied/skipped counts.
    statistics: TrainingStatistics,

    /// Latest evaluation results.
    eval_results: Option<EvalResults>,

    config: DualStreamConfig,
    process: ProcessInfo,
    start_iter: u64,
    iter: u64,
    max_iter: u64,
}

impl<B, M, O> DualStreamTrainer<B, M, O>
where
    B: Batch + 'static,
    M: Model<B> + Checkpointable + 'static,
    O: Optimizer<M, B> + Checkpointable + 'static,
{
    /// Creates a trainer.
    ///
    /// The gradient layout is computed here from the model's parameter store
    /// and stays fixed for the run.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the model has no
    /// trainable parameters.
    pub fn new(
        model: M,
        optimizer: O,
        novel: TrainingStream<B>,
        base: TrainingStream<B>,
        config: DualStreamConfig,
        process: ProcessInfo,
    ) -> DualResult<Self> {
        config.validate()?;
        let step = DualStreamStep::new(&config, model.parameters())?;

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            optimizer: Arc::new(Mutex::new(optimizer)),
            novel,
            base,
            step,
            hooks: HookPipeline::new(process.is_primary()),
            default_hooks_built: false,
            evaluator: None,
            precise_bn_stream: None,
            storage: EventStorage::new(config.collect_metrics),
            statistics: TrainingStatistics::default(),
            eval_results: None,
            max_iter: config.solver.max_iter,
            config,
            process,
            start_iter: 0,
            iter: 0,
        })
    }

    /// Sets the evaluator used by the eval hook and [`Self::evaluate`].
    pub fn set_evaluator(&mut self, evaluator: impl Evaluator<M> + 'static) {
        let boxed: Box<dyn Evaluator<M>> = Box::new(evaluator);
        self.evaluator = Some(Arc::new(Mutex::new(boxed)));
    }

    /// Sets the stream used for precise-BN recalibration.
    pub fn set_precise_bn_stream(&mut self, stream: TrainingStream<B>) {
        self.precise_bn_stream = Some(stream);
    }

    /// Registers extra hooks, run after the default ones.
    pub fn register_hooks(&mut self, hooks: Vec<Box<dyn Hook<B, M, O>>>) {
        for hook in hooks {
            self.hooks.register(hook);
        }
    }

    /// Restores from the latest checkpoint, or loads initial weights.
    ///
    /// With `resume` and a checkpoint in the output directory, model,
    /// optimizer and convergence state are restored and training continues at
    /// the iteration after the stored one. Otherwise, if `weights` names a
    /// checkpoint file, only its model state is loaded and training starts at
    /// iteration 0. Returns the start iteration.
    ///
    /// # Errors
    ///
    /// Returns a fatal `CheckpointError` if a checkpoint cannot be read or
    /// does not fit the model.
    pub fn resume_or_load(&mut self, resume: bool, weights: Option<&Path>) -> DualResult<u64> {
        let latest = if resume {
            CheckpointManager::new(&self.config.output_dir, self.config.keep_last_n)?.load_latest()?
        } else {
            None
        };

        if let Some(checkpoint) = latest {
            self.model.lock().load_state_dict(checkpoint.model)?;
            self.optimizer.lock().load_state_dict(checkpoint.optimizer)?;
            self.step
                .restore_convergence(&self.config, checkpoint.convergence);
            self.start_iter = checkpoint.iteration + 1;
            info!(
                iteration = checkpoint.iteration,
                start_iter = self.start_iter,
                "resumed from checkpoint"
            );
        } else {
            if let Some(path) = weights {
                let checkpoint = TrainerCheckpoint::load(path)?;
                self.model.lock().load_state_dict(checkpoint.model)?;
                info!(path = %path.display(), "loaded initial weights");
            }
            self.start_iter = 0;
        }

        self.iter = self.start_iter;
        Ok(self.start_iter)
    }

    fn build_default_hooks(&mut self) -> DualResult<Vec<Box<dyn Hook<B, M, O>>>> {
        let config = &self.config;
        let mut hooks: Vec<Box<dyn Hook<B, M, O>>> = vec![
            Box::new(IterationTimer::new()),
            Box::new(LrSchedulerHook::new(WarmupMultiStep::from_config(&config.solver))),
        ];

        if config.test.precise_bn.enabled {
            let has_statistics = self.model.lock().parameters().has_norm_statistics();
            match self.precise_bn_stream.take() {
                Some(stream) if has_statistics => hooks.push(Box::new(PreciseBn::new(
                    stream,
                    config.test.precise_bn.num_iter,
                    config.test.eval_period,
                ))),
                Some(_) => info!("precise BN enabled but the model has no normalization statistics"),
                None => warn!("precise BN enabled but no recalibration stream was set"),
            }
        }

        if self.process.is_primary() {
            let manager = CheckpointManager::new(&config.output_dir, config.keep_last_n)?;
            hooks.push(Box::new(PeriodicCheckpointer::new(
                manager,
                config.solver.checkpoint_period,
            )));
        }

        match &self.evaluator {
            Some(evaluator) => hooks.push(Box::new(EvalHook::new(
                Arc::clone(evaluator),
                config.test.eval_period,
            ))),
            None => info!("no evaluator set, evaluation hook disabled"),
        }

        if self.process.is_primary() {
            std::fs::create_dir_all(&config.output_dir).map_err(|e| {
                (
                    DualStreamError::WriterError {
                        detail: format!("failed to create {}: {e}", config.output_dir.display()),
                    },
                    None,
                )
            })?;
            let writers: Vec<Box<dyn EventWriter>> = vec![
                Box::new(CommonMetricPrinter::new(self.max_iter)),
                Box::new(JsonWriter::new(config.output_dir.join("metrics.json"))?),
            ];
            hooks.push(Box::new(PeriodicWriter::new(writers, config.writer_period)));
        }

        Ok(hooks)
    }

    /// Builds the default hooks once, ahead of any registered ones.
    fn ensure_hooks(&mut self) -> DualResult<()> {
        if !self.default_hooks_built {
            let defaults = self.build_default_hooks()?;
            self.hooks.prepend(defaults);
            self.default_hooks_built = true;
        }
        Ok(())
    }

    /// Runs iterations `start_iter..max_iter`.
    ///
    /// Returns the last evaluation results, if an evaluator ran.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error; `after_train` hooks still run.
    pub fn train(&mut self) -> DualResult<Option<EvalResults>> {
        self.ensure_hooks()?;
        info!(
            start_iter = self.start_iter,
            max_iter = self.max_iter,
            hooks = ?self.hooks.active_names(),
            "starting training"
        );

        self.iter = self.start_iter;
        let result = self.dispatch_train(true, self.start_iter).and_then(|()| {
            while self.iter < self.max_iter {
                self.run_iteration()?;
            }
            Ok(())
        });

        if let Err((err, _)) = &result {
            error!(iteration = self.iter, error = %err, "exception during training");
        }
        let last = self.iter.saturating_sub(1).max(self.start_iter);
        let after = self.dispatch_train(false, last);
        result?;
        after?;

        info!("{}", self.statistics.summary());
        Ok(self.eval_results.clone())
    }

    fn dispatch_train(&mut self, before: bool, iteration: u64) -> DualResult<()> {
        let convergence = self.step.tracker().state();
        let mut ctx = HookContext {
            iteration,
            start_iter: self.start_iter,
            max_iter: self.max_iter,
            model: &self.model,
            optimizer: &self.optimizer,
            storage: &mut self.storage,
            config: &self.config,
            convergence: &convergence,
            eval_results: &mut self.eval_results,
        };
        if before {
            self.hooks.before_train(&mut ctx)
        } else {
            self.hooks.after_train(&mut ctx)
        }
    }

    /// Runs one iteration with its hooks and advances the counter by one.
    ///
    /// # Errors
    ///
    /// Returns fatal step or hook errors. Recoverable step failures are
    /// reported as [`IterationOutcome::Skipped`].
    pub fn run_iteration(&mut self) -> DualResult<IterationOutcome> {
        let iteration = self.iter;
        self.storage.set_iteration(iteration);

        {
            let convergence = self.step.tracker().state();
            let mut ctx = HookContext {
                iteration,
                start_iter: self.start_iter,
                max_iter: self.max_iter,
                model: &self.model,
                optimizer: &self.optimizer,
                storage: &mut self.storage,
                config: &self.config,
                convergence: &convergence,
                eval_results: &mut self.eval_results,
            };
            self.hooks.before_step(&mut ctx)?;
        }

        let outcome = {
            let mut model = self.model.lock();
            let mut optimizer = self.optimizer.lock();
            self.step.run(
                iteration,
                &mut *model,
                &mut *optimizer,
                &mut self.novel,
                &mut self.base,
                &mut self.storage,
            )?
        };
        self.statistics.record(&outcome);

        {
            let convergence = self.step.tracker().state();
            let mut ctx = HookContext {
                iteration,
                start_iter: self.start_iter,
                max_iter: self.max_iter,
                model: &self.model,
                optimizer: &self.optimizer,
                storage: &mut self.storage,
                config: &self.config,
                convergence: &convergence,
                eval_results: &mut self.eval_results,
            };
            self.hooks.after_step(&mut ctx)?;
        }

        self.iter += 1;
        Ok(outcome)
    }

    /// Evaluates the current model once, outside of training.
    ///
    /// # Errors
    ///
    /// Returns a fatal `EvaluationError` if no evaluator is set.
    pub fn evaluate(&mut self) -> DualResult<EvalResults> {
        let Some(evaluator) = &self.evaluator else {
            return error::fatal(DualStreamError::EvaluationError {
                detail: "no evaluator set".to_string(),
            });
        };
        let results = {
            let mut model = self.model.lock();
            hooks::run_evaluator(evaluator, &mut *model)?
        };
        info!(?results, "evaluation results");
        self.eval_results = Some(results.clone());
        Ok(results)
    }

    /// Captures a checkpoint of the current state.
    ///
    /// The stored iteration is the last completed one. The model and
    /// optimizer locks are taken one after the other, so the caller must not
    /// hold a guard from [`Self::model`] or [`Self::optimizer`].
    ///
    /// # Errors
    ///
    /// Returns a fatal `CheckpointError` before any iteration has completed,
    /// or an error if model or optimizer state cannot be captured.
    pub fn checkpoint(&self) -> DualResult<TrainerCheckpoint> {
        let Some(completed) = self.iter.checked_sub(1) else {
            return error::fatal(DualStreamError::CheckpointError {
                reason: "no iteration has completed yet".to_string(),
            });
        };
        let model_state = self.model.lock().state_dict()?;
        let optimizer_state = self.optimizer.lock().state_dict()?;
        Ok(TrainerCheckpoint::new(
            completed,
            self.step.tracker().state(),
            self.config.clone(),
            model_state,
            optimizer_state,
        ))
    }
}

impl<B, M, O> DualStreamTrainer<B, M, O> {
    /// Next iteration to run.
    #[must_use]
    pub fn iteration(&self) -> u64 {
        self.iter
    }

    /// First iteration of this run.
    #[must_use]
    pub fn start_iter(&self) -> u64 {
        self.start_iter
    }

    /// Total iterations.
    #[must_use]
    pub fn max_iter(&self) -> u64 {
        self.max_iter
    }

    /// The per-iteration step state.
    #[must_use]
    pub fn step(&self) -> &DualStreamStep {
        &self.step
    }

    /// Applied/skipped counts.
    #[must_use]
    pub fn statistics(&self) -> &TrainingStatistics {
        &self.statistics
    }

    /// Recorded scalars.
    #[must_use]
    pub fn storage(&self) -> &EventStorage {
        &self.storage
    }

    /// Latest evaluation results.
    #[must_use]
    pub fn eval_results(&self) -> Option<&EvalResults> {
        self.eval_results.as_ref()
    }

    /// Names of the hooks that run on this process.
    #[must_use]
    pub fn hook_names(&self) -> Vec<String> {
        self.hooks.active_names()
    }

    /// Locks and returns the model.
    pub fn model(&self) -> MutexGuard<'_, M> {
        self.model.lock()
    }

    /// Locks and returns the optimizer.
    pub fn optimizer(&self) -> MutexGuard<'_, O> {
        self.optimizer.lock()
    }

    /// The run configuration.
    #[must_use]
    pub fn config(&self) -> &DualStreamConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_seed_adds_rank() {
        assert_eq!(ProcessInfo::new(3, 4).derive_seed(Some(10)), 13);
        assert_eq!(ProcessInfo::single().derive_seed(Some(10)), 10);
        assert!(ProcessInfo::single().is_primary());
        assert!(!ProcessInfo::new(1, 2).is_primary());
    }

    #[test]
    fn test_default_setup_writes_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = DualStreamConfig::builder()
            .output_dir(dir.path().join("out"))
            .seed(5)
            .build();

        let seed = default_setup(&config, &ProcessInfo::single()).unwrap();
        assert_eq!(seed, 5);
        let saved = DualStreamConfig::from_file(dir.path().join("out/config.toml")).unwrap();
        assert_eq!(saved.seed, Some(5));
    }

    #[test]
    fn test_default_setup_replica_writes_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = DualStreamConfig::builder()
            .output_dir(dir.path().join("out"))
            .seed(5)
            .build();

        let seed = default_setup(&config, &ProcessInfo::new(2, 4)).unwrap();
        assert_eq!(seed, 7);
        assert!(!dir.path().join("out").exists());
    }
}
