//! Training loop over the resampled batch stream.
//!
//! Every batch also fills the per-class diagnostic histograms that `plot`
//! renders: the pT and decay-length distributions the classifier actually saw.

use burn::config::Config;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::activation::log_softmax;
use burn::tensor::backend::AutodiffBackend;
use jetstream::histogram::{Axis, Histogram1D};
use jetstream::pipeline::{Pipeline, PipelineError};
use jetstream::record::Batch;
use jetstream::schema::SchemaError;
use thiserror::Error;
use tracing::info;

use crate::model::{ClassifierInput, JetClassifier};

/// log10(pT / 1 GeV)
pub const DIAG_PT_AXIS: Axis = Axis::new(10, 1.3, 3.0);
/// log10(c tau / 1 mm)
pub const DIAG_DECAY_AXIS: Axis = Axis::new(10, -2.0, 5.0);

#[derive(Config, Debug)]
pub struct TrainingConfig {
    #[config(default = 1e-3)]
    pub learning_rate: f64,

    /// Log every this many steps.
    #[config(default = 50)]
    pub log_interval: usize,

    /// Stop after this many steps even if the stream has more batches.
    #[config(default = "None")]
    pub max_steps: Option<usize>,
}

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Per-class pT and decay-length histograms of the training stream.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticHistograms {
    pub pt: Vec<Histogram1D>,
    pub decay: Vec<Histogram1D>,
}

impl DiagnosticHistograms {
    pub fn new(num_classes: usize) -> Self {
        Self {
            pt: vec![Histogram1D::new(DIAG_PT_AXIS); num_classes],
            decay: vec![Histogram1D::new(DIAG_DECAY_AXIS); num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.pt.len()
    }

    /// Fill from every row of `batch` by its argmax class. Rows with no class
    /// are skipped; the decay histogram needs at least one gen column.
    pub fn fill_batch(&mut self, batch: &Batch, pt_index: usize) {
        for i in 0..batch.batch_size {
            let Some(class) = batch.class_of(i).filter(|&c| c < self.pt.len()) else {
                continue;
            };
            if let Some(&pt) = batch.globals_row(i).get(pt_index) {
                self.pt[class].fill(pt as f64);
            }
            if let Some(&decay) = batch.gen_row(i).first() {
                self.decay[class].fill(decay as f64);
            }
        }
    }

    /// Events filled into class `class`, flow bins included.
    pub fn events(&self, class: usize) -> f64 {
        self.pt[class].total()
    }
}

// ============================================================================
// Loop
// ============================================================================

#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub steps: usize,
    pub events: u64,
    pub last_loss: Option<f32>,
    pub diagnostics: DiagnosticHistograms,
}

/// Soft-label cross entropy: `-mean_b sum_k truth[b,k] * log_softmax(logits)[b,k]`.
///
/// Rows with an all-zero truth vector contribute nothing.
pub fn cross_entropy<B: Backend>(logits: Tensor<B, 2>, truth: Tensor<B, 2>) -> Tensor<B, 1> {
    (log_softmax(logits, 1) * truth).sum_dim(1).mean().neg()
}

/// Train until the pipeline reports end of stream (or `max_steps`).
pub fn train<B: AutodiffBackend>(
    pipeline: &Pipeline,
    mut model: JetClassifier<B>,
    config: &TrainingConfig,
    device: &B::Device,
) -> Result<(JetClassifier<B>, TrainingSummary), TrainError> {
    let kinematics = pipeline.schema().kinematic_columns()?;
    let mut optim = AdamConfig::new().init();
    let mut diagnostics = DiagnosticHistograms::new(pipeline.schema().num_classes());
    let mut steps = 0usize;
    let mut events = 0u64;
    let mut last_loss = None;

    info!(
        "Training: lr {}, log every {} steps, max steps {:?}",
        config.learning_rate, config.log_interval, config.max_steps
    );

    while config.max_steps.is_none_or(|max| steps < max) {
        let Some(batch) = pipeline.next_batch()? else {
            break;
        };
        if batch.is_empty() {
            continue;
        }
        diagnostics.fill_batch(&batch, kinematics.pt);

        let truth = Tensor::<B, 2>::from_data(
            TensorData::new(batch.truth.clone(), [batch.batch_size, batch.num_classes]),
            device,
        );
        let logits = model.forward(ClassifierInput::from_batch(&batch, device));
        let loss = cross_entropy(logits, truth);

        if config.log_interval > 0 && steps % config.log_interval == 0 {
            let v: f32 = loss.clone().into_scalar().elem();
            let shapes: Vec<String> = batch
                .shapes()
                .into_iter()
                .map(|(name, dims)| format!("{name}={dims:?}"))
                .collect();
            info!("step {steps:>5}: loss = {v:.6} [{}]", shapes.join(" "));
            last_loss = Some(v);
        }

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = optim.step(config.learning_rate, model, grads);

        steps += 1;
        events += batch.batch_size as u64;
    }

    info!("Training done: {steps} steps, {events} events");
    Ok((
        model,
        TrainingSummary {
            steps,
            events,
            last_loss,
            diagnostics,
        },
    ))
}
