//! Joint training of the sketch and image encoders.
//!
//! One Adam optimizer updates the concatenated parameter set of both encoders
//! under the triplet margin loss. The learning rate decays on an epoch
//! schedule, progress is checkpointed locally every `print_every` iterations,
//! and each epoch ends with a retrieval evaluation and a published checkpoint.

use std::path::Path;
use std::time::Instant;

use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::evaluation::{evaluate, EvaluationConfig};
use crate::model::bridge::tensor_to_f64;
use crate::model::twin::SketchImageModel;
use crate::training::checkpoint::{capture_training_state, load_training_state, CheckpointStore};
use crate::training::data::{collate, SketchImageDataset, TripletLoader, TripletSource};
use crate::training::loss::TripletMarginLossConfig;
use crate::training::running::RunningAverage;
use crate::training::schedule::StepLrConfig;
use crate::training::sink::MetricsSink;
use crate::SbirError;

/// Metric names emitted to the sink.
pub const METRIC_LOSS: &str = "Average Total loss";
pub const METRIC_LR: &str = "Learning rate";
pub const METRIC_MAP: &str = "Average Training mAP";
pub const METRIC_SKETCHES: &str = "Sketches";
pub const METRIC_RETRIEVED: &str = "Retrieved Images";

/// Configuration for a training run.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Triplets per optimizer step.
    #[config(default = 16)]
    pub batch_size: usize,
    /// Base learning rate for Adam.
    #[config(default = 1e-4)]
    pub lr: f64,
    /// Epochs between learning-rate decays.
    #[config(default = 10)]
    pub lr_scheduler_step_size: usize,
    /// Learning-rate decay factor.
    #[config(default = 0.1)]
    pub gamma: f64,
    /// First epoch to run; non-zero when resuming.
    #[config(default = 0)]
    pub start_epoch: usize,
    /// Epoch to stop before.
    #[config(default = 20)]
    pub epochs: usize,
    /// Iterations between progress logs and local checkpoints.
    #[config(default = 50)]
    pub print_every: usize,
    /// Triplet margin.
    #[config(default = 1.0)]
    pub margin: f64,
    /// L2 penalty for Adam; zero disables it.
    #[config(default = 0.0)]
    pub weight_decay: f64,
    /// Clip the global gradient norm to this value when set.
    pub max_grad_norm: Option<f64>,
    /// End-of-epoch retrieval evaluation.
    #[config(default = "EvaluationConfig::new()")]
    pub evaluation: EvaluationConfig,
}

impl TrainingConfig {
    /// Reject configurations the loop cannot run.
    pub fn validate(&self) -> Result<(), SbirError> {
        let fail = |msg: String| Err(SbirError::InvalidConfig(msg));
        if self.batch_size == 0 {
            return fail("batch_size must be > 0".to_string());
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return fail(format!("lr must be > 0, got {}", self.lr));
        }
        if self.lr_scheduler_step_size == 0 {
            return fail("lr_scheduler_step_size must be > 0".to_string());
        }
        if self.start_epoch > self.epochs {
            return fail(format!(
                "start_epoch {} is past epochs {}",
                self.start_epoch, self.epochs
            ));
        }
        if self.print_every == 0 {
            return fail("print_every must be > 0".to_string());
        }
        if self.weight_decay < 0.0 {
            return fail(format!("weight_decay must be >= 0, got {}", self.weight_decay));
        }
        if let Some(norm) = self.max_grad_norm {
            if !(norm > 0.0) {
                return fail(format!("max_grad_norm must be > 0, got {norm}"));
            }
        }
        Ok(())
    }
}

/// What a finished run hands back.
#[derive(Debug)]
pub struct TrainingOutcome<B: AutodiffBackend> {
    pub model: SketchImageModel<B>,
    /// Learning rate used in each epoch that ran.
    pub learning_rates: Vec<f64>,
    /// Example-weighted mean loss of each epoch.
    pub epoch_losses: Vec<f64>,
    /// Training-gallery mAP after each epoch.
    pub epoch_maps: Vec<f64>,
    /// Global step of the last iteration.
    pub global_step: u64,
}

/// Format seconds as `H:MM:SS`.
pub fn format_eta(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.round() as u64
    } else {
        0
    };
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

/// Pass `value` through, or fail the run if it is NaN or infinite.
pub fn ensure_finite(value: f64, epoch: usize, iteration: usize) -> Result<f64, SbirError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(SbirError::NonFiniteLoss {
            epoch,
            iteration,
            value,
        })
    }
}

/// Train both encoders of `model`.
///
/// # Arguments
/// - `config`: hyperparameters, validated before anything runs
/// - `model`: freshly initialized pair (overwritten from `resume_from` if given)
/// - `loader`: yields the training triplets
/// - `gallery`: dataset evaluated at the end of every epoch
/// - `store`: where checkpoints go; epoch-end snapshots are published
/// - `sink`: receives loss, learning rate, mAP and visualization grids
/// - `resume_from`: snapshot to restore model and optimizer state from
///
/// Resuming starts `config.start_epoch` at its first batch. After a mid-epoch
/// snapshot the sink sees that epoch's steps a second time.
///
/// # Errors
/// Any failure is fatal: a non-finite loss aborts with
/// [`SbirError::NonFiniteLoss`] after the most recent checkpoint, and a
/// missing resume path with [`SbirError::MissingCheckpoint`].
#[allow(clippy::too_many_arguments)]
pub fn train<B, S>(
    config: &TrainingConfig,
    model: SketchImageModel<B>,
    loader: &mut TripletLoader<S>,
    gallery: &SketchImageDataset,
    store: &CheckpointStore,
    sink: &mut dyn MetricsSink,
    resume_from: Option<&Path>,
    device: &B::Device,
) -> anyhow::Result<TrainingOutcome<B>>
where
    B: AutodiffBackend,
    S: TripletSource,
{
    config.validate()?;

    let loss_fn = TripletMarginLossConfig::new()
        .with_margin(config.margin)
        .init();

    let mut optim_config = AdamConfig::new();
    if config.weight_decay > 0.0 {
        optim_config =
            optim_config.with_weight_decay(Some(WeightDecayConfig::new(config.weight_decay as f32)));
    }
    if let Some(norm) = config.max_grad_norm {
        optim_config =
            optim_config.with_grad_clipping(Some(GradientClippingConfig::Norm(norm as f32)));
    }
    let mut optimizer = optim_config.init::<B, SketchImageModel<B>>();
    let mut model = model;

    if let Some(path) = resume_from {
        let restored = load_training_state(path, model, Some(optimizer), device)?;
        model = restored.model;
        optimizer = restored
            .optimizer
            .ok_or_else(|| anyhow::anyhow!("optimizer lost while restoring {}", path.display()))?;
        if restored.epochs_completed != config.start_epoch {
            tracing::warn!(
                checkpoint_epochs = restored.epochs_completed,
                start_epoch = config.start_epoch,
                "Resuming at an epoch that differs from the checkpoint's"
            );
        }
        tracing::info!(
            path = %path.display(),
            iteration = restored.iteration,
            epochs_completed = restored.epochs_completed,
            "Restored model and optimizer state"
        );
    }

    let mut scheduler = StepLrConfig::new(config.lr_scheduler_step_size)
        .with_gamma(config.gamma)
        .init(config.lr)?;
    scheduler.advance(config.start_epoch);

    let num_batches = loader.num_batches();
    tracing::info!(
        params = model.num_params(),
        start_epoch = config.start_epoch,
        epochs = config.epochs,
        num_batches,
        batch_size = loader.batch_size(),
        margin = loss_fn.margin(),
        lr = %format!("{:.2e}", scheduler.lr()),
        "Starting training"
    );

    let train_start = Instant::now();
    let mut learning_rates = Vec::new();
    let mut epoch_losses = Vec::new();
    let mut epoch_maps = Vec::new();
    let mut global_step = (config.start_epoch * num_batches) as u64;

    for epoch in config.start_epoch..config.epochs {
        let epoch_start = Instant::now();
        let lr = scheduler.lr();
        let mut loss_avg = RunningAverage::new();
        let mut time_avg = RunningAverage::new();

        for (iteration, items) in loader.epoch().enumerate() {
            let step_start = Instant::now();
            let items = items?;
            let batch = collate::<B>(&items, device)?;
            let batch_len = batch.len();

            let (anchors, positives, negatives) =
                model.forward_triplet(batch.anchors, batch.positives, batch.negatives);
            let loss = loss_fn.forward(anchors, positives, negatives)?;
            let loss_value = ensure_finite(tensor_to_f64(loss.clone()), epoch, iteration)?;

            // Gradients are rebuilt from scratch by every backward pass.
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optimizer.step(lr, model, grads);

            loss_avg.update(loss_value, batch_len as f64);
            time_avg.update_one(step_start.elapsed().as_secs_f64());
            global_step = (epoch * num_batches + iteration) as u64;
            tracing::debug!(epoch, iteration, loss = loss_value, "step");

            if iteration % config.print_every == 0 {
                let remaining = num_batches.saturating_sub(iteration + 1) as f64;
                let eta = format_eta(time_avg.current().unwrap_or(0.0) * remaining);
                let avg_loss = loss_avg.current().unwrap_or(loss_value);
                tracing::info!(
                    epoch,
                    iteration,
                    num_batches,
                    loss = %format!("{avg_loss:.4}"),
                    lr = %format!("{lr:.2e}"),
                    eta = %eta,
                    "Training progress"
                );
                sink.log_scalar(METRIC_LOSS, avg_loss, global_step)?;

                let state = capture_training_state(iteration, epoch, &model, &optimizer)?;
                store.save(&state, false)?;
            }
        }

        let epoch_loss = loss_avg
            .current()
            .ok_or_else(|| SbirError::EmptyInput(format!("epoch {epoch} produced no batches")))?;
        learning_rates.push(lr);
        epoch_losses.push(epoch_loss);
        sink.log_scalar(METRIC_LR, lr, global_step)?;
        scheduler.step();

        let valid = model.valid();
        let report = evaluate::<B::InnerBackend, _, _>(
            &valid.sketch_encoder,
            &valid.image_encoder,
            gallery,
            &config.evaluation,
            device,
        )?;
        drop(valid);

        sink.log_scalar(METRIC_MAP, report.mean_average_precision, global_step)?;
        if !report.sketches.is_empty() {
            sink.log_images(METRIC_SKETCHES, &report.sketches, global_step)?;
            sink.log_images(METRIC_RETRIEVED, &report.retrieved_grids, global_step)?;
        }
        epoch_maps.push(report.mean_average_precision);

        let state = capture_training_state(num_batches, epoch + 1, &model, &optimizer)?;
        store.save(&state, true)?;

        tracing::info!(
            epoch,
            loss = %format!("{epoch_loss:.4}"),
            map = %format!("{:.4}", report.mean_average_precision),
            next_lr = %format!("{:.2e}", scheduler.lr()),
            elapsed = %format_eta(epoch_start.elapsed().as_secs_f64()),
            "Epoch complete"
        );
    }

    tracing::info!(
        epochs_run = epoch_losses.len(),
        global_step,
        elapsed = %format_eta(train_start.elapsed().as_secs_f64()),
        "Training complete"
    );

    Ok(TrainingOutcome {
        model,
        learning_rates,
        epoch_losses,
        epoch_maps,
        global_step,
    })
}
