//! Training metrics collection and reporting.
//!
//! Every iteration publishes named scalars into an [`EventStorage`]: the two
//! stream losses, the base-loss EMA, the mixing coefficients, the learning
//! rate and the iteration time. Writers periodically drain the storage:
//!
//! - [`CommonMetricPrinter`] logs a one-line summary (with ETA) through
//!   `tracing`
//! - [`JsonWriter`] appends one JSON object per flush to `metrics.json`
//!
//! Aggregate counts of applied and skipped iterations are kept separately in
//! [`TrainingStatistics`].
//!
//! # Scalar names
//!
//! | Name | Meaning |
//! |---|---|
//! | `dynamic/loss_n` | summed novel-stream loss |
//! | `dynamic/loss_b` | summed base-stream loss |
//! | `dynamic/ema_lb` | base-loss EMA after the update |
//! | `dynamic/converge` | convergence signal |
//! | `dynamic/angle` | alignment signal |
//! | `dynamic/lambda` | coefficient applied to the base gradient |
//! | `novel/<loss>`, `base/<loss>` | individual loss terms |
//! | `lr` | learning rate |
//! | `time` | iteration wall time in seconds |

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::info;

use crate::error::{DualResult, DualStreamError};
use crate::step::{IterationOutcome, StepStage};
use crate::LossMap;

/// Maximum history kept per scalar.
const DEFAULT_MAX_HISTORY: usize = 10_000;

/// Per-iteration scalar storage.
#[derive(Debug, Clone)]
pub struct EventStorage {
    enabled: bool,
    iteration: u64,
    latest: BTreeMap<String, (f64, u64)>,
    history: HashMap<String, VecDeque<(u64, f64)>>,
    max_history: usize,
}

impl Default for EventStorage {
    fn default() -> Self {
        Self::new(true)
    }
}

impl EventStorage {
    /// Creates a storage; a disabled storage drops every scalar.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            iteration: 0,
            latest: BTreeMap::new(),
            history: HashMap::new(),
            max_history: DEFAULT_MAX_HISTORY,
        }
    }

    /// Sets the iteration that subsequent scalars belong to.
    pub fn set_iteration(&mut self, iteration: u64) {
        self.iteration = iteration;
    }

    /// Returns the current iteration.
    #[must_use]
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Records a scalar for the current iteration.
    pub fn put_scalar(&mut self, name: &str, value: f64) {
        if !self.enabled {
            return;
        }
        self.latest
            .insert(name.to_string(), (value, self.iteration));
        let history = self.history.entry(name.to_string()).or_default();
        if history.len() == self.max_history {
            history.pop_front();
        }
        history.push_back((self.iteration, value));
    }

    /// Records every loss term under `prefix/`.
    pub fn put_losses(&mut self, prefix: &str, losses: &LossMap) {
        for (name, value) in losses {
            self.put_scalar(&format!("{prefix}/{name}"), f64::from(*value));
        }
    }

    /// Latest value and iteration of every scalar.
    #[must_use]
    pub fn latest(&self) -> &BTreeMap<String, (f64, u64)> {
        &self.latest
    }

    /// Latest value of one scalar.
    #[must_use]
    pub fn latest_value(&self, name: &str) -> Option<f64> {
        self.latest.get(name).map(|(value, _)| *value)
    }

    /// Recorded history of one scalar, oldest first.
    #[must_use]
    pub fn history(&self, name: &str) -> Option<&VecDeque<(u64, f64)>> {
        self.history.get(name)
    }

    /// Median of the last `window` values of a scalar.
    #[must_use]
    pub fn median(&self, name: &str, window: usize) -> Option<f64> {
        let history = self.history.get(name)?;
        let mut values: Vec<f64> = history
            .iter()
            .rev()
            .take(window.max(1))
            .map(|(_, v)| *v)
            .collect();
        if values.is_empty() {
            return None;
        }
        values.sort_by(f64::total_cmp);
        let mid = values.len() / 2;
        Some(if values.len() % 2 == 0 {
            (values[mid - 1] + values[mid]) / 2.0
        } else {
            values[mid]
        })
    }

    /// Mean over the whole recorded history of a scalar.
    #[must_use]
    pub fn global_avg(&self, name: &str) -> Option<f64> {
        let history = self.history.get(name)?;
        if history.is_empty() {
            return None;
        }
        Some(history.iter().map(|(_, v)| v).sum::<f64>() / history.len() as f64)
    }

    /// Drops all recorded scalars.
    pub fn clear(&mut self) {
        self.latest.clear();
        self.history.clear();
    }
}

/// Aggregate training statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingStatistics {
    /// Iterations executed (including skipped and bypassed ones).
    pub total_iterations: u64,

    /// Iterations whose mixed update was applied.
    pub applied: u64,

    /// Iterations skipped during the novel forward/backward pass.
    pub skipped_novel: u64,

    /// Iterations skipped during the base forward/backward pass.
    pub skipped_base: u64,

    /// Iterations skipped while mixing.
    pub skipped_mix: u64,

    /// Iterations whose update could not be applied.
    pub skipped_apply: u64,

    /// Iterations bypassed past the iteration ceiling.
    pub beyond_ceiling: u64,

    /// Last applied base loss.
    pub final_loss_base: Option<f32>,

    /// Last applied novel loss.
    pub final_loss_novel: Option<f32>,

    /// Last base-loss EMA.
    pub final_ema: Option<f32>,

    /// Mean `dynamic_lambda` over applied iterations.
    pub mean_lambda: f32,
}

impl TrainingStatistics {
    /// Folds one iteration outcome into the statistics.
    pub fn record(&mut self, outcome: &IterationOutcome) {
        self.total_iterations += 1;
        match outcome {
            IterationOutcome::Applied(report) => {
                self.applied += 1;
                let n = self.applied as f32;
                self.mean_lambda += (report.decision.dynamic_lambda - self.mean_lambda) / n;
                self.final_loss_base = Some(report.loss_base);
                self.final_loss_novel = Some(report.loss_novel);
                self.final_ema = Some(report.ema);
            }
            IterationOutcome::Skipped { stage, .. } => match stage {
                StepStage::NovelForwardBackward => self.skipped_novel += 1,
                StepStage::BaseForwardBackward => self.skipped_base += 1,
                StepStage::Mix => self.skipped_mix += 1,
                StepStage::Apply | StepStage::Idle => self.skipped_apply += 1,
            },
            IterationOutcome::BeyondCeiling => self.beyond_ceiling += 1,
        }
    }

    /// Total skipped iterations.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped_novel + self.skipped_base + self.skipped_mix + self.skipped_apply
    }

    /// Exports the statistics as pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Returns a console-friendly summary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "Training Summary:\n\
             ├─ Iterations: {}\n\
             ├─ Applied: {}\n\
             ├─ Skipped: novel={}, base={}, mix={}, apply={}\n\
             ├─ Beyond Ceiling: {}\n\
             ├─ Mean Lambda: {:.4}\n\
             └─ Final EMA: {}",
            self.total_iterations,
            self.applied,
            self.skipped_novel,
            self.skipped_base,
            self.skipped_mix,
            self.skipped_apply,
            self.beyond_ceiling,
            self.mean_lambda,
            self.final_ema
                .map_or_else(|| "n/a".to_string(), |ema| format!("{ema:.4}")),
        )
    }
}

/// Sink for the scalars in an [`EventStorage`].
pub trait EventWriter: Send {
    /// Writes the current state of the storage.
    fn write(&mut self, storage: &EventStorage) -> DualResult<()>;

    /// Flushes and releases resources.
    fn close(&mut self) -> DualResult<()> {
        Ok(())
    }
}

/// Logs iteration, ETA, losses and learning rate.
#[derive(Debug)]
pub struct CommonMetricPrinter {
    max_iter: u64,
    window: usize,
    last_write: Option<(Instant, u64)>,
}

impl CommonMetricPrinter {
    /// Creates a printer for a run of `max_iter` iterations.
    #[must_use]
    pub fn new(max_iter: u64) -> Self {
        Self {
            max_iter,
            window: 20,
            last_write: None,
        }
    }

    fn eta_seconds(&mut self, storage: &EventStorage) -> Option<f64> {
        let iteration = storage.iteration();
        let remaining = self.max_iter.saturating_sub(iteration + 1) as f64;
        let eta = match storage.median("time", 1000) {
            Some(per_iter) => Some(per_iter * remaining),
            // Without a timer hook, estimate from the wall time between writes.
            None => self.last_write.and_then(|(at, iter)| {
                let done = iteration.checked_sub(iter).filter(|d| *d > 0)?;
                Some(at.elapsed().as_secs_f64() / done as f64 * remaining)
            }),
        };
        self.last_write = Some((Instant::now(), iteration));
        eta
    }
}

impl EventWriter for CommonMetricPrinter {
    fn write(&mut self, storage: &EventStorage) -> DualResult<()> {
        let eta = self
            .eta_seconds(storage)
            .map_or_else(|| "n/a".to_string(), format_eta);

        let losses = storage
            .latest()
            .iter()
            .filter(|(name, _)| name.starts_with("dynamic/") || name.contains("loss"))
            .filter_map(|(name, _)| {
                storage
                    .median(name, self.window)
                    .map(|v| format!("{name}: {v:.4}"))
            })
            .collect::<Vec<_>>()
            .join("  ");

        let time = storage
            .global_avg("time")
            .map_or_else(|| "n/a".to_string(), |t| format!("{t:.4}"));
        let lr = storage
            .latest_value("lr")
            .map_or_else(|| "n/a".to_string(), |lr| format!("{lr:.6}"));

        info!(
            "eta: {eta}  iter: {}  {losses}  time: {time}  lr: {lr}",
            storage.iteration()
        );
        Ok(())
    }
}

fn format_eta(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let (hours, rest) = (total / 3600, total % 3600);
    format!("{hours}:{:02}:{:02}", rest / 60, rest % 60)
}

/// Appends scalars as JSON lines to a file.
///
/// Each flush writes one object with the iteration and every scalar updated
/// since the previous flush.
pub struct JsonWriter {
    path: PathBuf,
    file: BufWriter<File>,
    last_written: Option<u64>,
}

impl JsonWriter {
    /// Opens (appending) the JSON-lines file at `path`.
    ///
    /// # Errors
    ///
    /// Returns a fatal `WriterError` if the file cannot be opened.
    pub fn new(path: impl AsRef<Path>) -> DualResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                (
                    DualStreamError::WriterError {
                        detail: format!("failed to open {}: {e}", path.display()),
                    },
                    None,
                )
            })?;
        Ok(Self {
            path,
            file: BufWriter::new(file),
            last_written: None,
        })
    }

    /// Path of the output file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventWriter for JsonWriter {
    fn write(&mut self, storage: &EventStorage) -> DualResult<()> {
        let mut record = serde_json::Map::new();
        for (name, (value, iteration)) in storage.latest() {
            if self.last_written.is_some_and(|last| *iteration <= last) {
                continue;
            }
            record.insert(name.clone(), serde_json::json!(value));
        }
        if record.is_empty() {
            return Ok(());
        }
        record.insert("iteration".to_string(), serde_json::json!(storage.iteration()));

        let line = serde_json::Value::Object(record).to_string();
        writeln!(self.file, "{line}")
            .and_then(|()| self.file.flush())
            .map_err(|e| {
                (
                    DualStreamError::WriterError {
                        detail: format!("failed to write {}: {e}", self.path.display()),
                    },
                    Some(crate::error::RecoveryAction::Continue),
                )
            })?;
        self.last_written = Some(storage.iteration());
        Ok(())
    }

    fn close(&mut self) -> DualResult<()> {
        self.file.flush().map_err(|e| {
            (
                DualStreamError::WriterError {
                    detail: e.to_string(),
                },
                Some(crate::error::RecoveryAction::Continue),
            )
        })
    }
}
