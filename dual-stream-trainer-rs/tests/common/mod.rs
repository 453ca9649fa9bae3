//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dual_stream_trainer_rs::hooks::{EvalResults, Evaluator};
use dual_stream_trainer_rs::prelude::*;

/// One regression sample.
#[derive(Debug, Clone)]
pub struct Sample {
    pub x: [f32; 2],
    pub y: f32,
}

impl Batch for Sample {
    fn batch_size(&self) -> usize {
        1
    }
}

/// Two-weight linear regressor with a normalization statistic.
///
/// Loss is `0.5 · (w · x − y)²`. The novel samples only touch `w[1]` and the
/// base samples only touch `w[0]`, but both write the whole `head.w` buffer.
pub struct Regressor {
    pub store: ParameterStore,
    pending: Option<Vec<f32>>,
    pub training: bool,
    /// Novel forward calls (0-based) that fail.
    pub fail_novel_at: HashSet<u64>,
    /// Base forward calls (0-based) that return a NaN loss.
    pub nan_base_at: HashSet<u64>,
    novel_calls: u64,
    base_calls: u64,
}

impl Regressor {
    pub fn new() -> Self {
        let mut store = ParameterStore::new();
        store.insert_named("head.w", vec![2], vec![0.5, -0.5]).unwrap();
        store.insert_named("bn.running_mean", vec![1], vec![0.0]).unwrap();
        Self {
            store,
            pending: None,
            training: true,
            fail_novel_at: HashSet::new(),
            nan_base_at: HashSet::new(),
            novel_calls: 0,
            base_calls: 0,
        }
    }

    pub fn weights(&self) -> Vec<f32> {
        self.store.get("head.w").unwrap().data().to_vec()
    }

    pub fn running_mean(&self) -> f32 {
        self.store.get("bn.running_mean").unwrap().data()[0]
    }
}

impl Model<Sample> for Regressor {
    fn forward(&mut self, batch: &Sample, stream: StreamKind) -> DualResult<LossMap> {
        let call = match stream {
            StreamKind::Novel => {
                self.novel_calls += 1;
                self.novel_calls - 1
            }
            StreamKind::Base => {
                self.base_calls += 1;
                self.base_calls - 1
            }
        };
        if stream == StreamKind::Novel && self.fail_novel_at.contains(&call) {
            return Err((
                DualStreamError::ForwardFailed {
                    stream,
                    iteration: call,
                    detail: "injected failure".into(),
                },
                None,
            ));
        }

        let w = self.weights();
        let residual = w[0] * batch.x[0] + w[1] * batch.x[1] - batch.y;
        self.pending = Some(vec![residual * batch.x[0], residual * batch.x[1]]);

        let mut loss = 0.5 * residual * residual;
        if stream == StreamKind::Base && self.nan_base_at.contains(&call) {
            loss = f32::NAN;
        }
        let mut losses = LossMap::new();
        losses.insert("loss_reg".to_string(), loss);
        Ok(losses)
    }

    fn backward(&mut self) -> DualResult<()> {
        let grad = self.pending.take().unwrap_or_else(|| vec![0.0; 2]);
        self.store.accumulate_grad("head.w", &grad)
    }

    fn parameters(&self) -> &ParameterStore {
        &self.store
    }

    fn parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.store
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn clear_forward_state(&mut self) {
        self.pending = None;
    }

    fn update_norm_statistics(&mut self, _batch: &Sample) -> DualResult<()> {
        self.store.get_mut("bn.running_mean").unwrap().data_mut()[0] += 1.0;
        Ok(())
    }
}

impl Checkpointable for Regressor {
    fn state_dict(&self) -> DualResult<serde_json::Value> {
        self.store.state_dict()
    }

    fn load_state_dict(&mut self, state: serde_json::Value) -> DualResult<()> {
        self.store.load_state_dict(state)
    }
}

/// Reports the regression error on a fixed point and counts its calls.
pub struct CountingEvaluator {
    pub calls: Arc<AtomicUsize>,
}

impl Evaluator<Regressor> for CountingEvaluator {
    fn evaluate(&mut self, model: &mut Regressor) -> DualResult<EvalResults> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let w = model.weights();
        let residual = w[0] - w[1] + 3.0;
        let mut results = EvalResults::new();
        results.insert("regression/mse".to_string(), f64::from(residual * residual));
        Ok(results)
    }
}

pub fn novel_stream() -> TrainingStream<Sample> {
    TrainingStream::new(
        StreamKind::Novel,
        std::iter::repeat(Sample { x: [0.0, 1.0], y: 2.0 }),
    )
}

pub fn base_stream() -> TrainingStream<Sample> {
    TrainingStream::new(
        StreamKind::Base,
        std::iter::repeat(Sample { x: [1.0, 0.0], y: -1.0 }),
    )
}

pub fn trainer(
    model: Regressor,
    config: DualStreamConfig,
    process: ProcessInfo,
) -> DualStreamTrainer<Sample, Regressor, Sgd> {
    let optimizer = Sgd::from_config(&config.solver);
    DualStreamTrainer::new(model, optimizer, novel_stream(), base_stream(), config, process)
        .unwrap()
}
