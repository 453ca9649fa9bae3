//! Dual-stream fine-tuning of a toy regressor.
//!
//! A linear model is "pre-trained" on base data, then fine-tuned on a
//! mixture of base data and a handful of novel samples. The novel samples
//! share one input feature with the base data, so naive fine-tuning would
//! drag the shared weight away from what the base data needs.
//!
//! # Running
//!
//! ```bash
//! cargo run --example toy_finetune -- --max-iter 2000 --output-dir ./output/toy
//! cargo run --example toy_finetune -- --resume --output-dir ./output/toy
//! cargo run --example toy_finetune -- --eval-only --output-dir ./output/toy
//! ```

use std::path::PathBuf;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dual_stream_trainer_rs::config::PreciseBnConfig;
use dual_stream_trainer_rs::hooks::EvalResults;
use dual_stream_trainer_rs::prelude::*;
use dual_stream_trainer_rs::trainer::default_setup;

const FEATURES: usize = 4;
/// Base targets depend on features 0..3, novel targets on features 2..4.
const BASE_WEIGHTS: [f32; FEATURES] = [1.5, -2.0, 0.5, 0.0];
const NOVEL_WEIGHTS: [f32; FEATURES] = [0.0, 0.0, 0.5, 3.0];

#[derive(Parser)]
#[command(name = "toy-finetune")]
#[command(about = "Dual-stream fine-tuning of a toy linear regressor")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Resume from the last checkpoint in the output directory
    #[arg(long)]
    resume: bool,

    /// Only evaluate the latest checkpoint
    #[arg(long)]
    eval_only: bool,

    /// Override solver.max_iter
    #[arg(long)]
    max_iter: Option<u64>,

    /// Override output_dir
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Number of novel training samples
    #[arg(long, default_value_t = 10)]
    shots: usize,
}

#[derive(Debug, Clone)]
struct Sample {
    x: [f32; FEATURES],
    y: f32,
}

impl Batch for Sample {
    fn batch_size(&self) -> usize {
        1
    }
}

fn make_samples(weights: &[f32; FEATURES], active: std::ops::Range<usize>, n: usize, rng: &mut StdRng) -> Vec<Sample> {
    (0..n)
        .map(|_| {
            let mut x = [0.0; FEATURES];
            for i in active.clone() {
                x[i] = rng.gen_range(-1.0..1.0);
            }
            let y = x.iter().zip(weights).map(|(a, w)| a * w).sum::<f32>() + rng.gen_range(-0.01..0.01);
            Sample { x, y }
        })
        .collect()
}

/// Linear regressor with a running mean of its inputs.
struct ToyRegressor {
    params: ParameterStore,
    pending: Option<Vec<f32>>,
}

impl ToyRegressor {
    fn new(weights: Vec<f32>) -> DualResult<Self> {
        let mut params = ParameterStore::new();
        params.insert_named("head.weight", vec![FEATURES], weights)?;
        params.insert_named("input.running_mean", vec![FEATURES], vec![0.0; FEATURES])?;
        Ok(Self {
            params,
            pending: None,
        })
    }

    fn predict(&self, x: &[f32; FEATURES]) -> f32 {
        self.params
            .get("head.weight")
            .map_or(0.0, |w| w.data().iter().zip(x).map(|(w, x)| w * x).sum())
    }
}

impl Model<Sample> for ToyRegressor {
    fn forward(&mut self, batch: &Sample, _stream: StreamKind) -> DualResult<LossMap> {
        let residual = self.predict(&batch.x) - batch.y;
        self.pending = Some(batch.x.iter().map(|x| residual * x).collect());
        let mut losses = LossMap::new();
        losses.insert("loss_reg".to_string(), 0.5 * residual * residual);
        Ok(losses)
    }

    fn backward(&mut self) -> DualResult<()> {
        match self.pending.take() {
            Some(grad) => self.params.accumulate_grad("head.weight", &grad),
            None => Err((
                DualStreamError::BackwardFailed {
                    stream: StreamKind::Base,
                    iteration: 0,
                    detail: "backward without forward".to_string(),
                },
                None,
            )),
        }
    }

    fn parameters(&self) -> &ParameterStore {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.params
    }

    fn clear_forward_state(&mut self) {
        self.pending = None;
    }

    fn update_norm_statistics(&mut self, batch: &Sample) -> DualResult<()> {
        if let Some(mean) = self.params.get_mut("input.running_mean") {
            for (m, x) in mean.data_mut().iter_mut().zip(&batch.x) {
                *m = 0.9 * *m + 0.1 * x;
            }
        }
        Ok(())
    }
}

impl Checkpointable for ToyRegressor {
    fn state_dict(&self) -> DualResult<serde_json::Value> {
        self.params.state_dict()
    }

    fn load_state_dict(&mut self, state: serde_json::Value) -> DualResult<()> {
        self.params.load_state_dict(state)
    }
}

/// Mean squared error on held-out base and novel samples.
struct HeldOut {
    base: Vec<Sample>,
    novel: Vec<Sample>,
}

impl HeldOut {
    fn mse(model: &ToyRegressor, samples: &[Sample]) -> f64 {
        let total: f64 = samples
            .iter()
            .map(|s| f64::from(model.predict(&s.x) - s.y).powi(2))
            .sum();
        total / samples.len().max(1) as f64
    }
}

impl Evaluator<ToyRegressor> for HeldOut {
    fn evaluate(&mut self, model: &mut ToyRegressor) -> DualResult<EvalResults> {
        let mut results = EvalResults::new();
        results.insert("base/mse".to_string(), Self::mse(model, &self.base));
        results.insert("novel/mse".to_string(), Self::mse(model, &self.novel));
        Ok(results)
    }
}

fn dual<T>(result: DualResult<T>) -> anyhow::Result<T> {
    result.map_err(|(err, _)| anyhow::Error::new(err))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut config = match &args.config {
        Some(path) => dual(DualStreamConfig::from_file(path))?,
        None => DualStreamConfig::builder()
            .max_iter(3000)
            .iteration_ceiling(Some(2400))
            .base_lr(0.02)
            .steps(vec![2000])
            .warmup_iters(50)
            .checkpoint_period(1000)
            .eval_period(500)
            .precise_bn(PreciseBnConfig {
                enabled: true,
                num_iter: 20,
            })
            .output_dir("./output/toy_finetune")
            .seed(42)
            .build(),
    };
    if let Some(max_iter) = args.max_iter {
        config.solver.max_iter = max_iter;
    }
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }

    let process = ProcessInfo::single();
    let seed = dual(default_setup(&config, &process))?;
    let mut rng = StdRng::seed_from_u64(seed);

    let base_train = make_samples(&BASE_WEIGHTS, 0..3, 500, &mut rng);
    let novel_train = make_samples(&NOVEL_WEIGHTS, 2..4, args.shots, &mut rng);
    let held_out = HeldOut {
        base: make_samples(&BASE_WEIGHTS, 0..3, 200, &mut rng),
        novel: make_samples(&NOVEL_WEIGHTS, 2..4, 200, &mut rng),
    };

    // "Pre-trained" on base data: base weights known, novel feature unused.
    let model = dual(ToyRegressor::new(BASE_WEIGHTS.to_vec()))?;
    let novel = TrainingStream::new(StreamKind::Novel, CyclicSampler::new(novel_train, seed));
    let base = TrainingStream::new(
        StreamKind::Base,
        CyclicSampler::new(base_train.clone(), seed.wrapping_add(1)),
    );
    let optimizer = Sgd::from_config(&config.solver);

    let mut trainer = dual(DualStreamTrainer::new(
        model, optimizer, novel, base, config, process,
    ))?;
    trainer.set_evaluator(held_out);
    trainer.set_precise_bn_stream(TrainingStream::new(
        StreamKind::Base,
        CyclicSampler::new(base_train, seed.wrapping_add(2)),
    ));

    if args.eval_only {
        dual(trainer.resume_or_load(true, None))?;
        let results = dual(trainer.evaluate())?;
        for (name, value) in &results {
            tracing::info!("{name}: {value:.6}");
        }
        return Ok(());
    }

    let start = dual(trainer.resume_or_load(args.resume, None))?;
    tracing::info!(start, "training");
    if let Some(results) = dual(trainer.train())? {
        for (name, value) in &results {
            tracing::info!("{name}: {value:.6}");
        }
    }
    tracing::info!("weights: {:?}", trainer.model().parameters().values_snapshot()[0]);
    Ok(())
}
