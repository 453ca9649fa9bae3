//! Checkpoint save/restore for the dual-stream trainer.
//!
//! A checkpoint lets a run resume exactly where it stopped:
//! - the last completed iteration (the run resumes at the next one)
//! - the base-loss EMA state, so the convergence signal does not restart
//! - the model and optimizer state
//! - the configuration, for inspection on restore
//!
//! # Format
//!
//! Checkpoints are JSON files. The trainer never looks inside model or
//! optimizer tensors; both are captured through [`Checkpointable`] as opaque
//! JSON values, so a framework adapter may store a reference to its own
//! weight file instead of inline values.
//!
//! # Layout on disk
//!
//! ```text
//! output/
//! ├── model_0004999.json   periodic, rotated (keep_last_n)
//! ├── model_0009999.json
//! ├── model_final.json     written once at the last iteration, never rotated
//! └── last_checkpoint      name of the most recent file
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::DualStreamConfig;
use crate::convergence::ConvergenceState;
use crate::error::{DualResult, DualStreamError};
use crate::parameters::ParameterStore;

/// Current checkpoint format version.
const CHECKPOINT_VERSION: u32 = 1;

/// Prefix of periodic checkpoint files.
const PERIODIC_PREFIX: &str = "model_";

/// File recording the name of the most recent checkpoint.
const LAST_CHECKPOINT_FILE: &str = "last_checkpoint";

fn checkpoint_error<T>(reason: String) -> DualResult<T> {
    Err((DualStreamError::CheckpointError { reason }, None))
}

/// State that can be written into and restored from a checkpoint.
pub trait Checkpointable {
    /// Captures the current state.
    fn state_dict(&self) -> DualResult<serde_json::Value>;

    /// Restores state captured by [`Checkpointable::state_dict`].
    fn load_state_dict(&mut self, state: serde_json::Value) -> DualResult<()>;
}

/// Complete checkpoint of a dual-stream run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerCheckpoint {
    /// Checkpoint format version for compatibility checking.
    pub version: u32,

    /// Last completed iteration.
    pub iteration: u64,

    /// Base-loss EMA state.
    pub convergence: ConvergenceState,

    /// Training configuration.
    pub config: DualStreamConfig,

    /// Model state from [`Checkpointable::state_dict`].
    pub model: serde_json::Value,

    /// Optimizer state from [`Checkpointable::state_dict`].
    pub optimizer: serde_json::Value,

    /// Metadata about the checkpoint.
    pub metadata: CheckpointMetadata,
}

impl TrainerCheckpoint {
    /// Creates a checkpoint for `iteration`.
    #[must_use]
    pub fn new(
        iteration: u64,
        convergence: ConvergenceState,
        config: DualStreamConfig,
        model: serde_json::Value,
        optimizer: serde_json::Value,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            iteration,
            convergence,
            config,
            model,
            optimizer,
            metadata: CheckpointMetadata::new().with_iteration(iteration),
        }
    }

    /// Saves the checkpoint to a file.
    ///
    /// # Errors
    ///
    /// Returns an error if file creation or serialization fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> DualResult<()> {
        let file = File::create(path.as_ref()).or_else(|e| {
            checkpoint_error(format!("Failed to create checkpoint file: {e}"))
        })?;

        serde_json::to_writer(BufWriter::new(file), self)
            .or_else(|e| checkpoint_error(format!("Failed to serialize checkpoint: {e}")))
    }

    /// Loads a checkpoint from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file doesn't exist, is corrupted, or has an
    /// incompatible version.
    pub fn load<P: AsRef<Path>>(path: P) -> DualResult<Self> {
        let file = File::open(path.as_ref())
            .or_else(|e| checkpoint_error(format!("Failed to open checkpoint file: {e}")))?;

        let checkpoint: Self = serde_json::from_reader(BufReader::new(file))
            .or_else(|e| checkpoint_error(format!("Failed to deserialize checkpoint: {e}")))?;

        if checkpoint.version != CHECKPOINT_VERSION {
            return checkpoint_error(format!(
                "Incompatible checkpoint version: {} (expected {})",
                checkpoint.version, CHECKPOINT_VERSION
            ));
        }

        Ok(checkpoint)
    }
}

/// Metadata about a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Iteration when the checkpoint was created.
    pub iteration: u64,

    /// Wall-clock timestamp (RFC 3339 format).
    pub timestamp: String,

    /// Hostname where the checkpoint was created.
    pub hostname: String,

    /// User-provided notes.
    pub notes: String,
}

impl CheckpointMetadata {
    /// Creates new metadata with current timestamp and hostname.
    #[must_use]
    pub fn new() -> Self {
        Self {
            iteration: 0,
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            notes: String::new(),
        }
    }

    /// Sets the iteration.
    #[must_use]
    pub fn with_iteration(mut self, iteration: u64) -> Self {
        self.iteration = iteration;
        self
    }

    /// Sets user notes.
    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }
}

impl Default for CheckpointMetadata {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize, Deserialize)]
struct StoredTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

/// Parameter values by name. Gradients are not persisted.
impl Checkpointable for ParameterStore {
    fn state_dict(&self) -> DualResult<serde_json::Value> {
        let tensors: BTreeMap<&str, StoredTensor> = self
            .iter()
            .map(|p| {
                (
                    p.name(),
                    StoredTensor {
                        shape: p.shape().to_vec(),
                        data: p.data().to_vec(),
                    },
                )
            })
            .collect();
        serde_json::to_value(tensors)
            .or_else(|e| checkpoint_error(format!("Failed to serialize parameters: {e}")))
    }

    fn load_state_dict(&mut self, state: serde_json::Value) -> DualResult<()> {
        let mut tensors: BTreeMap<String, StoredTensor> = serde_json::from_value(state)
            .or_else(|e| checkpoint_error(format!("Malformed parameter state: {e}")))?;

        // Every parameter is checked before any value is overwritten.
        let mut matched = Vec::with_capacity(self.len());
        for param in self.iter() {
            let Some(stored) = tensors.remove(param.name()) else {
                return checkpoint_error(format!("Missing parameter '{}' in checkpoint", param.name()));
            };
            if stored.shape != param.shape() || stored.data.len() != param.numel() {
                return checkpoint_error(format!(
                    "Shape mismatch for '{}': checkpoint {:?}, model {:?}",
                    param.name(),
                    stored.shape,
                    param.shape()
                ));
            }
            matched.push(stored.data);
        }

        for (param, data) in self.iter_mut().zip(matched) {
            param.data_mut().copy_from_slice(&data);
        }

        if !tensors.is_empty() {
            let unexpected: Vec<&str> = tensors.keys().map(String::as_str).collect();
            warn!(?unexpected, "checkpoint holds parameters the model does not have");
        }
        Ok(())
    }
}

/// Manages checkpoint files in an output directory.
///
/// Handles periodic saves, the final checkpoint, rotating old periodic files
/// and locating the most recent checkpoint for resuming.
#[derive(Debug)]
pub struct CheckpointManager {
    /// Directory where checkpoints are saved.
    checkpoint_dir: PathBuf,

    /// Number of periodic checkpoints to keep.
    keep_last_n: usize,

    /// Periodic checkpoint files, oldest first.
    checkpoints: Vec<PathBuf>,
}

impl CheckpointManager {
    /// Creates a manager, scanning `checkpoint_dir` for existing checkpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or read.
    pub fn new(checkpoint_dir: impl AsRef<Path>, keep_last_n: usize) -> DualResult<Self> {
        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();

        std::fs::create_dir_all(&checkpoint_dir).or_else(|e| {
            checkpoint_error(format!("Failed to create checkpoint directory: {e}"))
        })?;

        let checkpoints = Self::scan_checkpoints(&checkpoint_dir)?;

        Ok(Self {
            checkpoint_dir,
            keep_last_n: keep_last_n.max(1),
            checkpoints,
        })
    }

    /// Directory holding the checkpoints.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.checkpoint_dir
    }

    /// Saves a periodic checkpoint (`model_{iteration:07}.json`) and rotates.
    ///
    /// # Errors
    ///
    /// Returns an error if saving or rotation fails.
    pub fn save_periodic(&mut self, checkpoint: &TrainerCheckpoint) -> DualResult<PathBuf> {
        let name = format!("{PERIODIC_PREFIX}{:07}", checkpoint.iteration);
        let path = self.save_named(&name, checkpoint)?;

        self.checkpoints.retain(|p| p != &path);
        self.checkpoints.push(path.clone());
        self.rotate_checkpoints()?;

        Ok(path)
    }

    /// Saves a checkpoint under `name`, outside of rotation.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn save_named(&mut self, name: &str, checkpoint: &TrainerCheckpoint) -> DualResult<PathBuf> {
        let filename = format!("{name}.json");
        let path = self.checkpoint_dir.join(&filename);
        checkpoint.save(&path)?;

        std::fs::write(self.checkpoint_dir.join(LAST_CHECKPOINT_FILE), &filename).or_else(
            |e| checkpoint_error(format!("Failed to record last checkpoint: {e}")),
        )?;
        info!(path = %path.display(), iteration = checkpoint.iteration, "checkpoint saved");

        Ok(path)
    }

    /// Loads the most recent checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if loading fails.
    pub fn load_latest(&self) -> DualResult<Option<TrainerCheckpoint>> {
        match self.latest_checkpoint_path() {
            Some(path) => Ok(Some(TrainerCheckpoint::load(path)?)),
            None => Ok(None),
        }
    }

    /// Returns the path of the most recent checkpoint.
    ///
    /// Prefers the `last_checkpoint` record, falling back to the newest
    /// periodic file.
    #[must_use]
    pub fn latest_checkpoint_path(&self) -> Option<PathBuf> {
        let recorded = std::fs::read_to_string(self.checkpoint_dir.join(LAST_CHECKPOINT_FILE))
            .ok()
            .map(|name| self.checkpoint_dir.join(name.trim()))
            .filter(|path| path.is_file());
        recorded.or_else(|| self.checkpoints.last().cloned())
    }

    /// Returns whether any checkpoint exists.
    #[must_use]
    pub fn has_checkpoint(&self) -> bool {
        self.latest_checkpoint_path().is_some()
    }

    fn periodic_iteration(path: &Path) -> Option<u64> {
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix(PERIODIC_PREFIX))
            .and_then(|s| s.parse::<u64>().ok())
    }

    /// Scans a directory for periodic checkpoints.
    fn scan_checkpoints(dir: &Path) -> DualResult<Vec<PathBuf>> {
        let entries = std::fs::read_dir(dir).or_else(|e| {
            checkpoint_error(format!("Failed to read checkpoint directory: {e}"))
        })?;

        let mut checkpoints = Vec::new();
        for entry in entries {
            let path = entry
                .or_else(|e| checkpoint_error(format!("Failed to read directory entry: {e}")))?
                .path();
            if path.extension().and_then(|s| s.to_str()) == Some("json")
                && Self::periodic_iteration(&path).is_some()
            {
                checkpoints.push(path);
            }
        }

        checkpoints.sort_by_key(|path| Self::periodic_iteration(path).unwrap_or(0));
        Ok(checkpoints)
    }

    /// Deletes periodic checkpoints beyond the newest `keep_last_n`.
    fn rotate_checkpoints(&mut self) -> DualResult<()> {
        while self.checkpoints.len() > self.keep_last_n {
            let old = self.checkpoints.remove(0);
            std::fs::remove_file(&old).or_else(|e| {
                checkpoint_error(format!("Failed to delete old checkpoint: {e}"))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergence::ConvergenceTracker;
    use tempfile::TempDir;

    fn checkpoint(iteration: u64) -> TrainerCheckpoint {
        let config = DualStreamConfig::default();
        let mut tracker = ConvergenceTracker::new(&config.dynamic);
        tracker.update(0.9);
        TrainerCheckpoint::new(
            iteration,
            tracker.state(),
            config,
            serde_json::json!({}),
            serde_json::json!({}),
        )
    }

    #[test]
    fn test_checkpoint_save_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ckpt.json");

        checkpoint(42).save(&path).unwrap();
        let loaded = TrainerCheckpoint::load(&path).unwrap();

        assert_eq!(loaded.version, CHECKPOINT_VERSION);
        assert_eq!(loaded.iteration, 42);
        assert_eq!(loaded.metadata.iteration, 42);
        assert_eq!(loaded.convergence.ema_lb_old, Some(0.9));
    }

    #[test]
    fn test_checkpoint_metadata() {
        let metadata = CheckpointMetadata::new()
            .with_iteration(1000)
            .with_notes("Test checkpoint");

        assert_eq!(metadata.iteration, 1000);
        assert_eq!(metadata.notes, "Test checkpoint");
        assert!(!metadata.timestamp.is_empty());
    }

    #[test]
    fn test_checkpoint_manager_rotation() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = CheckpointManager::new(temp_dir.path(), 2).unwrap();

        for iteration in [99, 199, 299] {
            manager.save_periodic(&checkpoint(iteration)).unwrap();
        }

        let iterations: Vec<u64> = manager
            .checkpoints
            .iter()
            .filter_map(|p| CheckpointManager::periodic_iteration(p))
            .collect();
        assert_eq!(iterations, vec![199, 299]);
        assert!(!temp_dir.path().join("model_0000099.json").exists());
    }

    #[test]
    fn test_final_checkpoint_is_latest_and_not_rotated() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = CheckpointManager::new(temp_dir.path(), 1).unwrap();

        manager.save_periodic(&checkpoint(99)).unwrap();
        manager.save_named("model_final", &checkpoint(149)).unwrap();
        assert_eq!(manager.load_latest().unwrap().unwrap().iteration, 149);
        assert!(temp_dir.path().join("model_0000099.json").exists());
    }

    #[test]
    fn test_rescan_finds_existing_checkpoints() {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut manager = CheckpointManager::new(temp_dir.path(), 3).unwrap();
            assert!(manager.load_latest().unwrap().is_none());
            manager.save_periodic(&checkpoint(499)).unwrap();
        }
        std::fs::remove_file(temp_dir.path().join(LAST_CHECKPOINT_FILE)).unwrap();

        let manager = CheckpointManager::new(temp_dir.path(), 3).unwrap();
        assert!(manager.has_checkpoint());
        assert_eq!(manager.load_latest().unwrap().unwrap().iteration, 499);
    }

    #[test]
    fn test_incompatible_version() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad_version.json");

        let mut bad = checkpoint(0);
        bad.version = 999;
        let file = File::create(&path).unwrap();
        serde_json::to_writer(BufWriter::new(file), &bad).unwrap();

        assert!(TrainerCheckpoint::load(&path).is_err());
    }

    #[test]
    fn test_parameter_store_state_roundtrip() {
        let mut store = ParameterStore::new();
        store.insert_named("w", vec![2], vec![1.0, 2.0]).unwrap();
        let state = store.state_dict().unwrap();

        store.get_mut("w").unwrap().data_mut()[0] = 9.0;
        store.load_state_dict(state).unwrap();
        assert_eq!(store.get("w").unwrap().data(), &[1.0, 2.0]);
    }

    #[test]
    fn test_parameter_store_missing_key() {
        let mut store = ParameterStore::new();
        store.insert_named("w", vec![1], vec![1.0]).unwrap();
        assert!(store.load_state_dict(serde_json::json!({})).is_err());
    }

    #[test]
    fn test_parameter_store_failed_load_keeps_values() {
        let mut store = ParameterStore::new();
        store.insert_named("a", vec![1], vec![1.0]).unwrap();
        store.insert_named("b", vec![1], vec![2.0]).unwrap();
        let state = serde_json::json!({ "a": { "shape": [1], "data": [9.0] } });

        assert!(store.load_state_dict(state).is_err());
        assert_eq!(store.get("a").unwrap().data(), &[1.0]);
        assert_eq!(store.get("b").unwrap().data(), &[2.0]);
    }

    #[test]
    fn test_parameter_store_shape_mismatch_keeps_values() {
        let mut store = ParameterStore::new();
        store.insert_named("a", vec![1], vec![1.0]).unwrap();
        store.insert_named("b", vec![2], vec![2.0, 3.0]).unwrap();
        let state = serde_json::json!({
            "a": { "shape": [1], "data": [9.0] },
            "b": { "shape": [3], "data": [0.0, 0.0, 0.0] },
        });

        assert!(store.load_state_dict(state).is_err());
        assert_eq!(store.get("a").unwrap().data(), &[1.0]);
        assert_eq!(store.get("b").unwrap().data(), &[2.0, 3.0]);
    }
}
