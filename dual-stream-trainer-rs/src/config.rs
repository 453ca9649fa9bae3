//! Configuration types for dual-stream fine-tuning.
//!
//! The configuration is split into the same sections a detection fine-tuning
//! run is usually described with:
//!
//! - [`DynamicConfig`] - gradient balancing (EMA smoothing, convergence target)
//! - [`SolverConfig`] - iteration budget, learning-rate schedule, checkpoint cadence
//! - [`TestConfig`] - evaluation cadence and normalization-statistics recalibration
//!
//! Every field has a serde default, so a TOML file only needs to name the
//! values it changes.
//!
//! # Example
//!
//! ```rust
//! use dual_stream_trainer_rs::config::DualStreamConfig;
//!
//! let config = DualStreamConfig::builder()
//!     .max_iter(4000)
//!     .beta(0.95)
//!     .eval_period(500)
//!     .build();
//! assert!(config.validate().is_ok());
//!
//! // let config = DualStreamConfig::from_file("configs/finetune_10shot.toml")?;
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DualResult, DualStreamError};

/// Main configuration for the dual-stream trainer.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `dynamic.beta` | 0.9 | EMA smoothing of the base loss |
/// | `dynamic.target_loss` | 0.2 | Base-loss floor of the convergence signal |
/// | `solver.max_iter` | 10000 | Iterations of the run |
/// | `solver.iteration_ceiling` | 8000 | Iteration after which steps are no-ops |
/// | `test.eval_period` | 0 | Evaluation cadence (0 = only at the end) |
/// | `writer_period` | 20 | Metric writer flush cadence |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DualStreamConfig {
    /// Gradient balancing parameters.
    #[serde(default)]
    pub dynamic: DynamicConfig,

    /// Optimization and iteration budget.
    #[serde(default)]
    pub solver: SolverConfig,

    /// Evaluation and precise-BN parameters.
    #[serde(default)]
    pub test: TestConfig,

    /// Directory receiving checkpoints, `metrics.json` and `config.toml`.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Number of periodic checkpoints to keep on disk.
    #[serde(default = "default_keep_last_n")]
    pub keep_last_n: usize,

    /// Flush metric writers every N iterations.
    #[serde(default = "default_writer_period")]
    pub writer_period: u64,

    /// Base seed for stream shuffling; each process adds its rank.
    ///
    /// `None` draws a fresh seed from the OS.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Whether to record per-iteration statistics.
    #[serde(default = "default_collect_metrics")]
    pub collect_metrics: bool,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}
fn default_keep_last_n() -> usize {
    3
}
fn default_writer_period() -> u64 {
    20
}
fn default_collect_metrics() -> bool {
    true
}

impl Default for DualStreamConfig {
    fn default() -> Self {
        Self {
            dynamic: DynamicConfig::default(),
            solver: SolverConfig::default(),
            test: TestConfig::default(),
            output_dir: default_output_dir(),
            keep_last_n: default_keep_last_n(),
            writer_period: default_writer_period(),
            seed: None,
            collect_metrics: default_collect_metrics(),
        }
    }
}

impl DualStreamConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> DualStreamConfigBuilder {
        DualStreamConfigBuilder::default()
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> DualResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            (
                DualStreamError::ConfigError {
                    detail: format!("Failed to read config file: {e}"),
                },
                None,
            )
        })?;

        Self::from_toml_str(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid TOML for this schema.
    pub fn from_toml_str(content: &str) -> DualResult<Self> {
        toml::from_str(content).map_err(|e| {
            (
                DualStreamError::ConfigError {
                    detail: format!("Failed to parse config: {e}"),
                },
                None,
            )
        })
    }

    /// Serializes the configuration as pretty TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml_string(&self) -> DualResult<String> {
        toml::to_string_pretty(self).map_err(|e| {
            (
                DualStreamError::ConfigError {
                    detail: format!("Failed to serialize config: {e}"),
                },
                None,
            )
        })
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> DualResult<()> {
        let content = self.to_toml_string()?;

        std::fs::write(path.as_ref(), content).map_err(|e| {
            (
                DualStreamError::ConfigError {
                    detail: format!("Failed to write config file: {e}"),
                },
                None,
            )
        })
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a fatal `ConfigError` describing the first invalid value.
    pub fn validate(&self) -> DualResult<()> {
        let invalid = |detail: &str| {
            Err((
                DualStreamError::ConfigError {
                    detail: detail.to_string(),
                },
                None,
            ))
        };

        if !(0.0..1.0).contains(&self.dynamic.beta) {
            return invalid("dynamic.beta must be in [0, 1)");
        }
        if self.dynamic.target_loss.is_nan() || self.dynamic.target_loss < 0.0 {
            return invalid("dynamic.target_loss must be >= 0");
        }
        if !self.dynamic.convergence_scale.is_finite() {
            return invalid("dynamic.convergence_scale must be finite");
        }
        if self.dynamic.min_ema.is_nan() || self.dynamic.min_ema <= 0.0 {
            return invalid("dynamic.min_ema must be > 0");
        }
        if let Some(prior) = self.dynamic.initial_ema {
            if !prior.is_finite() || prior.abs() < self.dynamic.min_ema {
                return invalid("dynamic.initial_ema must be finite and away from zero");
            }
        }
        if self.solver.max_iter == 0 {
            return invalid("solver.max_iter must be > 0");
        }
        if self.solver.base_lr.is_nan() || self.solver.base_lr <= 0.0 {
            return invalid("solver.base_lr must be > 0");
        }
        if !(0.0..1.0).contains(&self.solver.momentum) {
            return invalid("solver.momentum must be in [0, 1)");
        }
        if self.solver.weight_decay.is_nan() || self.solver.weight_decay < 0.0 {
            return invalid("solver.weight_decay must be >= 0");
        }
        if self.solver.steps.windows(2).any(|w| w[0] >= w[1]) {
            return invalid("solver.steps must be strictly increasing");
        }
        if self.solver.warmup_factor.is_nan()
            || self.solver.warmup_factor <= 0.0
            || self.solver.warmup_factor > 1.0
        {
            return invalid("solver.warmup_factor must be in (0, 1]");
        }
        if self.test.precise_bn.enabled && self.test.precise_bn.num_iter == 0 {
            return invalid("test.precise_bn.num_iter must be > 0 when enabled");
        }
        if self.writer_period == 0 {
            return invalid("writer_period must be > 0");
        }
        if self.keep_last_n == 0 {
            return invalid("keep_last_n must be > 0");
        }

        Ok(())
    }
}

/// Gradient balancing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicConfig {
    /// EMA smoothing constant for the base loss, in `[0, 1)`.
    #[serde(default = "default_beta")]
    pub beta: f32,

    /// Optional EMA prior.
    ///
    /// With `None` the EMA is seeded by the first base loss of the run. With a
    /// value, the recurrence is applied from this prior on the first
    /// iteration (a prior of `0.45` matches a typical detector base loss).
    #[serde(default)]
    pub initial_ema: Option<f32>,

    /// Base-loss floor at which the convergence signal is zero.
    #[serde(default = "default_target_loss")]
    pub target_loss: f32,

    /// Multiplier of the convergence signal.
    #[serde(default = "default_convergence_scale")]
    pub convergence_scale: f32,

    /// Smallest EMA magnitude accepted as a divisor.
    #[serde(default = "default_min_ema")]
    pub min_ema: f32,
}

fn default_beta() -> f32 {
    0.9
}
fn default_target_loss() -> f32 {
    0.2
}
fn default_convergence_scale() -> f32 {
    3.0
}
fn default_min_ema() -> f32 {
    1e-6
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            beta: default_beta(),
            initial_ema: None,
            target_loss: default_target_loss(),
            convergence_scale: default_convergence_scale(),
            min_ema: default_min_ema(),
        }
    }
}

/// Warmup shape of the learning-rate schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WarmupMethod {
    /// Ramp linearly from `warmup_factor * base_lr` to `base_lr`.
    #[default]
    Linear,
    /// Hold `warmup_factor * base_lr` during the warmup.
    Constant,
}

/// Optimization and iteration budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Total number of iterations.
    #[serde(default = "default_max_iter")]
    pub max_iter: u64,

    /// Iteration index after which every step is a no-op.
    ///
    /// Updates stop after iteration 8000 by default, regardless of
    /// `max_iter`. `0` disables the ceiling; read it through
    /// [`SolverConfig::ceiling`].
    #[serde(default = "default_iteration_ceiling")]
    pub iteration_ceiling: u64,

    /// Base learning rate.
    #[serde(default = "default_base_lr")]
    pub base_lr: f32,

    /// SGD momentum.
    #[serde(default = "default_momentum")]
    pub momentum: f32,

    /// L2 weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,

    /// Iterations at which the learning rate is multiplied by `gamma`.
    #[serde(default = "default_steps")]
    pub steps: Vec<u64>,

    /// Decay factor applied at each entry of `steps`.
    #[serde(default = "default_gamma")]
    pub gamma: f32,

    /// Starting fraction of `base_lr` during warmup.
    #[serde(default = "default_warmup_factor")]
    pub warmup_factor: f32,

    /// Number of warmup iterations.
    #[serde(default = "default_warmup_iters")]
    pub warmup_iters: u64,

    /// Warmup shape.
    #[serde(default)]
    pub warmup_method: WarmupMethod,

    /// Save a checkpoint every N iterations (0 disables periodic saves).
    #[serde(default = "default_checkpoint_period")]
    pub checkpoint_period: u64,
}

fn default_max_iter() -> u64 {
    10_000
}
fn default_iteration_ceiling() -> u64 {
    8000
}
fn default_base_lr() -> f32 {
    0.01
}
fn default_momentum() -> f32 {
    0.9
}
fn default_weight_decay() -> f32 {
    1e-4
}
fn default_steps() -> Vec<u64> {
    vec![8000]
}
fn default_gamma() -> f32 {
    0.1
}
fn default_warmup_factor() -> f32 {
    0.001
}
fn default_warmup_iters() -> u64 {
    10
}
fn default_checkpoint_period() -> u64 {
    5000
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iter: default_max_iter(),
            iteration_ceiling: default_iteration_ceiling(),
            base_lr: default_base_lr(),
            momentum: default_momentum(),
            weight_decay: default_weight_decay(),
            steps: default_steps(),
            gamma: default_gamma(),
            warmup_factor: default_warmup_factor(),
            warmup_iters: default_warmup_iters(),
            warmup_method: WarmupMethod::default(),
            checkpoint_period: default_checkpoint_period(),
        }
    }
}

impl SolverConfig {
    /// Returns the active iteration ceiling, if any.
    #[must_use]
    pub fn ceiling(&self) -> Option<u64> {
        (self.iteration_ceiling > 0).then_some(self.iteration_ceiling)
    }
}

/// Evaluation cadence and normalization-statistics recalibration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestConfig {
    /// Evaluate every N iterations (0 = only after the final iteration).
    #[serde(default)]
    pub eval_period: u64,

    /// Precise-BN recalibration.
    #[serde(default)]
    pub precise_bn: PreciseBnConfig,
}

/// Recalibration of normalization running statistics before evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreciseBnConfig {
    /// Whether to run the recalibration.
    #[serde(default)]
    pub enabled: bool,

    /// Number of batches used per recalibration.
    #[serde(default = "default_precise_bn_iters")]
    pub num_iter: usize,
}

fn default_precise_bn_iters() -> usize {
    200
}

impl Default for PreciseBnConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            num_iter: default_precise_bn_iters(),
        }
    }
}

/// Builder for `DualStreamConfig`.
#[derive(Debug, Default)]
pub struct DualStreamConfigBuilder {
    beta: Option<f32>,
    initial_ema: Option<f32>,
    max_iter: Option<u64>,
    iteration_ceiling: Option<u64>,
    base_lr: Option<f32>,
    steps: Option<Vec<u64>>,
    warmup_iters: Option<u64>,
    checkpoint_period: Option<u64>,
    eval_period: Option<u64>,
    precise_bn: Option<PreciseBnConfig>,
    output_dir: Option<PathBuf>,
    writer_period: Option<u64>,
    seed: Option<u64>,
}

impl DualStreamConfigBuilder {
    /// Sets the EMA smoothing constant.
    #[must_use]
    pub fn beta(mut self, beta: f32) -> Self {
        self.beta = Some(beta);
        self
    }

    /// Sets an explicit EMA prior.
    #[must_use]
    pub fn initial_ema(mut self, prior: f32) -> Self {
        self.initial_ema = Some(prior);
        self
    }

    /// Sets the iteration budget.
    #[must_use]
    pub fn max_iter(mut self, max_iter: u64) -> Self {
        self.max_iter = Some(max_iter);
        self
    }

    /// Sets (or disables, with `None`) the iteration ceiling.
    #[must_use]
    pub fn iteration_ceiling(mut self, ceiling: Option<u64>) -> Self {
        self.iteration_ceiling = Some(ceiling.unwrap_or(0));
        self
    }

    /// Sets the base learning rate.
    #[must_use]
    pub fn base_lr(mut self, lr: f32) -> Self {
        self.base_lr = Some(lr);
        self
    }

    /// Sets the learning-rate decay steps.
    #[must_use]
    pub fn steps(mut self, steps: Vec<u64>) -> Self {
        self.steps = Some(steps);
        self
    }

    /// Sets the number of warmup iterations.
    #[must_use]
    pub fn warmup_iters(mut self, iters: u64) -> Self {
        self.warmup_iters = Some(iters);
        self
    }

    /// Sets the checkpoint cadence.
    #[must_use]
    pub fn checkpoint_period(mut self, period: u64) -> Self {
        self.checkpoint_period = Some(period);
        self
    }

    /// Sets the evaluation cadence.
    #[must_use]
    pub fn eval_period(mut self, period: u64) -> Self {
        self.eval_period = Some(period);
        self
    }

    /// Sets the precise-BN configuration.
    #[must_use]
    pub fn precise_bn(mut self, precise_bn: PreciseBnConfig) -> Self {
        self.precise_bn = Some(precise_bn);
        self
    }

    /// Sets the output directory.
    #[must_use]
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Sets the metric writer cadence.
    #[must_use]
    pub fn writer_period(mut self, period: u64) -> Self {
        self.writer_period = Some(period);
        self
    }

    /// Sets the base seed.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Builds the configuration with defaults for unset values.
    pub fn build(self) -> DualStreamConfig {
        let defaults = DualStreamConfig::default();
        DualStreamConfig {
            dynamic: DynamicConfig {
                beta: self.beta.unwrap_or(defaults.dynamic.beta),
                initial_ema: self.initial_ema.or(defaults.dynamic.initial_ema),
                ..defaults.dynamic
            },
            solver: SolverConfig {
                max_iter: self.max_iter.unwrap_or(defaults.solver.max_iter),
                iteration_ceiling: self
                    .iteration_ceiling
                    .unwrap_or(defaults.solver.iteration_ceiling),
                base_lr: self.base_lr.unwrap_or(defaults.solver.base_lr),
                steps: self.steps.unwrap_or(defaults.solver.steps),
                warmup_iters: self.warmup_iters.unwrap_or(defaults.solver.warmup_iters),
                checkpoint_period: self
                    .checkpoint_period
                    .unwrap_or(defaults.solver.checkpoint_period),
                ..defaults.solver
            },
            test: TestConfig {
                eval_period: self.eval_period.unwrap_or(defaults.test.eval_period),
                precise_bn: self.precise_bn.unwrap_or(defaults.test.precise_bn),
            },
            output_dir: self.output_dir.unwrap_or(defaults.output_dir),
            writer_period: self.writer_period.unwrap_or(defaults.writer_period),
            seed: self.seed.or(defaults.seed),
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DualStreamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.solver.ceiling(), Some(8000));
        assert!((config.dynamic.target_loss - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_builder_pattern() {
        let config = DualStreamConfig::builder()
            .beta(0.95)
            .max_iter(2000)
            .iteration_ceiling(None)
            .eval_period(250)
            .seed(7)
            .build();

        assert!((config.dynamic.beta - 0.95).abs() < f32::EPSILON);
        assert_eq!(config.solver.max_iter, 2000);
        assert_eq!(config.solver.ceiling(), None);
        assert_eq!(config.test.eval_period, 250);
        assert_eq!(config.seed, Some(7));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = DualStreamConfig::builder()
            .initial_ema(0.45)
            .iteration_ceiling(None)
            .build();
        let toml_str = config.to_toml_string().unwrap();
        let parsed = DualStreamConfig::from_toml_str(&toml_str).unwrap();

        assert_eq!(parsed.solver.max_iter, config.solver.max_iter);
        assert_eq!(parsed.solver.ceiling(), None);
        assert_eq!(parsed.dynamic.initial_ema, Some(0.45));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed = DualStreamConfig::from_toml_str(
            r#"
            writer_period = 5

            [dynamic]
            beta = 0.8

            [solver]
            max_iter = 300
            "#,
        )
        .unwrap();

        assert_eq!(parsed.writer_period, 5);
        assert!((parsed.dynamic.beta - 0.8).abs() < f32::EPSILON);
        assert_eq!(parsed.solver.max_iter, 300);
        assert_eq!(parsed.solver.ceiling(), Some(8000));
        assert_eq!(parsed.solver.warmup_method, WarmupMethod::Linear);
    }

    #[test]
    fn test_invalid_beta() {
        let mut config = DualStreamConfig::default();
        config.dynamic.beta = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_steps_order() {
        let config = DualStreamConfig::builder().steps(vec![500, 200]).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_prior_rejected() {
        let config = DualStreamConfig::builder().initial_ema(0.0).build();
        assert!(config.validate().is_err());
    }
}
