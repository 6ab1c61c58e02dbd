//! Integration tests for the sbir crate.
//!
//! These exercise cross-module behaviour: data pipeline -> twin model -> loss
//! -> optimizer, checkpoint save/restore of model and optimizer state, resume
//! semantics of the training loop, and retrieval evaluation. Everything runs on
//! the NdArray backend with tiny synthetic images.

use std::path::Path;
use std::sync::Arc;

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use sbir::evaluation::{evaluate, EvaluationConfig};
use sbir::model::bridge::{images_to_tensor, tensor_to_rows};
use sbir::model::embedder::EmbedderConfig;
use sbir::model::encoder::PixelEmbedder;
use sbir::model::twin::SketchImageModel;
use sbir::training::checkpoint::{
    capture_training_state, load_training_state, CheckpointStore, DirectoryArtifactStore,
    IMAGE_MODEL, OPTIMIZER, SKETCH_MODEL,
};
use sbir::training::data::{
    collate, ImageData, LabeledImage, SketchImageDataset, TripletItem, TripletLoader,
};
use sbir::training::loss::TripletMarginLossConfig;
use sbir::training::sink::MemorySink;
use sbir::training::trainer::{train, TrainingConfig, METRIC_LOSS, METRIC_MAP, METRIC_RETRIEVED};
use sbir::SbirError;

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<NdArray<f32>>;

const SIDE: usize = 8;

/// Image whose channel `class` is bright and the rest dark, plus jitter.
fn class_image(class: usize, rng: &mut StdRng) -> ImageData {
    let mut pixels = Vec::with_capacity(3 * SIDE * SIDE);
    for ch in 0..3 {
        let base = if ch == class { 0.9 } else { 0.1 };
        for _ in 0..SIDE * SIDE {
            pixels.push(base + rng.gen_range(-0.05..0.05));
        }
    }
    ImageData::new(3, SIDE, SIDE, pixels).unwrap()
}

/// Three classes, two sketches and two gallery images each.
fn synthetic_dataset(seed: u64) -> SketchImageDataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut sketches = Vec::new();
    let mut images = Vec::new();
    for class in 0..3 {
        for _ in 0..2 {
            sketches.push(LabeledImage::new(class_image(class, &mut rng), class));
            images.push(LabeledImage::new(class_image(class, &mut rng), class));
        }
    }
    let names = ["red", "green", "blue"].iter().map(|s| s.to_string()).collect();
    SketchImageDataset::new(names, sketches, images).unwrap()
}

fn tiny_embedder() -> EmbedderConfig {
    EmbedderConfig::new()
        .with_channels(vec![4, 8])
        .with_hidden_dim(16)
        .with_embedding_dim(6)
        .with_dropout(0.0)
}

fn tiny_config(epochs: usize) -> TrainingConfig {
    TrainingConfig::new()
        .with_batch_size(4)
        .with_lr(1e-3)
        .with_lr_scheduler_step_size(2)
        .with_epochs(epochs)
        .with_print_every(1)
        .with_evaluation(
            EvaluationConfig::new()
                .with_batch_size(4)
                .with_top_k(2)
                .with_num_display(2)
                .with_seed(Some(0)),
        )
}

fn loader(dataset: &Arc<SketchImageDataset>, seed: u64) -> TripletLoader<SketchImageDataset> {
    TripletLoader::new(Arc::clone(dataset), 4, true, Some(seed)).unwrap()
}

/// Inference-mode embeddings of a fixed batch through both encoders.
fn fixed_embeddings(model: &SketchImageModel<TestAutodiffBackend>) -> Vec<Vec<f32>> {
    let device = Default::default();
    let mut rng = StdRng::seed_from_u64(99);
    let imgs: Vec<ImageData> = (0..3).map(|c| class_image(c, &mut rng)).collect();
    let refs: Vec<&ImageData> = imgs.iter().collect();
    let valid = model.valid();
    let input = images_to_tensor::<TestBackend>(&refs, &device).unwrap();
    let mut rows = tensor_to_rows(valid.sketch_encoder.forward(input.clone())).unwrap();
    rows.extend(tensor_to_rows(valid.image_encoder.forward(input)).unwrap());
    rows
}

/// One Adam step on a fixed batch at lr 1e-2.
fn train_step<O>(
    model: SketchImageModel<TestAutodiffBackend>,
    optim: &mut O,
    items: &[TripletItem],
) -> SketchImageModel<TestAutodiffBackend>
where
    O: Optimizer<SketchImageModel<TestAutodiffBackend>, TestAutodiffBackend>,
{
    let device = Default::default();
    let batch = collate::<TestAutodiffBackend>(items, &device).unwrap();
    let (a, p, n) = model.forward_triplet(batch.anchors, batch.positives, batch.negatives);
    let loss = TripletMarginLossConfig::new().init().forward(a, p, n).unwrap();
    let grads = GradientsParams::from_grads(loss.backward(), &model);
    optim.step(1e-2, model, grads)
}

// ---------------------------------------------------------------------------
// Test 1: one manual training step through the whole pipeline
// ---------------------------------------------------------------------------

#[test]
fn test_single_step_updates_both_encoders() {
    let device = Default::default();
    let dataset = Arc::new(synthetic_dataset(1));
    let mut loader = loader(&dataset, 3);

    let mut model = SketchImageModel::<TestAutodiffBackend>::from_config(&tiny_embedder(), &device);
    let before = fixed_embeddings(&model);

    let mut optim = AdamConfig::new().init();
    let loss_fn = TripletMarginLossConfig::new().init();

    let items = loader.epoch().next().unwrap().unwrap();
    let batch = collate::<TestAutodiffBackend>(&items, &device).unwrap();
    let (a, p, n) = model.forward_triplet(batch.anchors, batch.positives, batch.negatives);
    let loss = loss_fn.forward(a, p, n).unwrap();
    let loss_val: f32 = loss.clone().into_scalar().elem();
    assert!(loss_val.is_finite() && loss_val >= 0.0);

    let grads = GradientsParams::from_grads(loss.backward(), &model);
    model = optim.step(1e-2, model, grads);

    let after = fixed_embeddings(&model);
    // Rows 0..3 come from the sketch encoder, 3..6 from the image encoder.
    assert_ne!(before[..3], after[..3], "sketch encoder did not move");
    assert_ne!(before[3..], after[3..], "image encoder did not move");
}

// ---------------------------------------------------------------------------
// Test 2: full run logs, checkpoints and publishes
// ---------------------------------------------------------------------------

#[test]
fn test_train_run_checkpoints_and_logs() {
    let device = Default::default();
    let run_dir = TempDir::new().unwrap();
    let publish_dir = TempDir::new().unwrap();
    let dataset = Arc::new(synthetic_dataset(2));
    let mut loader = loader(&dataset, 5);
    let store = CheckpointStore::new(run_dir.path())
        .with_artifact_store(DirectoryArtifactStore::new(publish_dir.path()));
    let sink = MemorySink::new();
    let mut writer = sink.clone();

    let model = SketchImageModel::<TestAutodiffBackend>::from_config(&tiny_embedder(), &device);
    let outcome = train(
        &tiny_config(2),
        model,
        &mut loader,
        &dataset,
        &store,
        &mut writer,
        None,
        &device,
    )
    .unwrap();

    assert_eq!(outcome.learning_rates, vec![1e-3, 1e-3]);
    assert_eq!(outcome.epoch_losses.len(), 2);
    assert!(outcome.epoch_losses.iter().all(|l| l.is_finite() && *l >= 0.0));
    assert!(outcome.epoch_maps.iter().all(|m| (0.0..=1.0).contains(m)));
    // 6 anchors / batch 4 → 2 batches per epoch; last step is epoch 1, iteration 1.
    assert_eq!(outcome.global_step, 3);

    // print_every = 1: one loss event per iteration, one mAP event per epoch.
    assert_eq!(sink.values(METRIC_LOSS).len(), 4);
    assert_eq!(sink.values(METRIC_MAP), outcome.epoch_maps);
    let steps: Vec<u64> = sink
        .scalars()
        .iter()
        .filter(|e| e.name == METRIC_LOSS)
        .map(|e| e.step)
        .collect();
    assert_eq!(steps, vec![0, 1, 2, 3]);
    assert!(sink
        .image_events()
        .iter()
        .any(|(name, count, _)| name == METRIC_RETRIEVED && *count == 2));

    let last = CheckpointStore::load(run_dir.path()).unwrap();
    assert_eq!(last.epochs_completed, 2);
    for name in [SKETCH_MODEL, IMAGE_MODEL, OPTIMIZER] {
        assert!(last.contains(name), "missing {name}");
    }
    assert!(publish_dir.path().join("epoch_0001").join("meta.json").is_file());
    assert!(publish_dir.path().join("epoch_0002").join("meta.json").is_file());
}

// ---------------------------------------------------------------------------
// Test 3: resume applies the same learning rate as an uninterrupted run
// ---------------------------------------------------------------------------

#[test]
fn test_resume_matches_uninterrupted_learning_rate() {
    let device = Default::default();
    let dataset = Arc::new(synthetic_dataset(3));

    // Uninterrupted: epochs [0, 5).
    let full_dir = TempDir::new().unwrap();
    let full = train(
        &tiny_config(5),
        SketchImageModel::<TestAutodiffBackend>::from_config(&tiny_embedder(), &device),
        &mut loader(&dataset, 1),
        &dataset,
        &CheckpointStore::new(full_dir.path()),
        &mut MemorySink::new(),
        None,
        &device,
    )
    .unwrap();

    // Interrupted after epoch 3, then resumed from its checkpoint.
    let part_dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(part_dir.path());
    train(
        &tiny_config(3),
        SketchImageModel::<TestAutodiffBackend>::from_config(&tiny_embedder(), &device),
        &mut loader(&dataset, 1),
        &dataset,
        &store,
        &mut MemorySink::new(),
        None,
        &device,
    )
    .unwrap();

    let resumed = train(
        &tiny_config(5).with_start_epoch(3),
        SketchImageModel::<TestAutodiffBackend>::from_config(&tiny_embedder(), &device),
        &mut loader(&dataset, 1),
        &dataset,
        &store,
        &mut MemorySink::new(),
        Some(&store.latest_path()),
        &device,
    )
    .unwrap();

    assert_eq!(full.learning_rates.len(), 5);
    assert_eq!(resumed.learning_rates.len(), 2);
    assert_eq!(resumed.learning_rates[1], full.learning_rates[4]);
    assert_eq!(resumed.learning_rates[0], full.learning_rates[3]);
    // Global steps keep counting across the resume.
    assert_eq!(resumed.global_step, full.global_step);
}

// ---------------------------------------------------------------------------
// Test 4: checkpoint round trip restores weights and optimizer moments
// ---------------------------------------------------------------------------

#[test]
fn test_checkpoint_round_trip_model_and_optimizer() {
    let device = Default::default();
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path());
    let dataset = Arc::new(synthetic_dataset(4));
    let mut loader = TripletLoader::new(Arc::clone(&dataset), 4, false, Some(8)).unwrap();
    let items = loader.epoch().next().unwrap().unwrap();

    let mut optim = AdamConfig::new().init::<TestAutodiffBackend, SketchImageModel<TestAutodiffBackend>>();
    let model = SketchImageModel::<TestAutodiffBackend>::from_config(&tiny_embedder(), &device);
    let model = train_step(model, &mut optim, &items);

    let state = capture_training_state(7, 1, &model, &optim).unwrap();
    store.save(&state, false).unwrap();

    let fresh = SketchImageModel::<TestAutodiffBackend>::from_config(&tiny_embedder(), &device);
    assert_ne!(fixed_embeddings(&fresh), fixed_embeddings(&model));
    let fresh_optim = AdamConfig::new().init::<TestAutodiffBackend, SketchImageModel<TestAutodiffBackend>>();
    let restored = load_training_state(&store.latest_path(), fresh, Some(fresh_optim), &device).unwrap();
    assert_eq!(restored.iteration, 7);
    assert_eq!(restored.epochs_completed, 1);
    assert_eq!(fixed_embeddings(&restored.model), fixed_embeddings(&model), "weights differ after restore");

    // A second step only agrees if the Adam moments came back too.
    let mut restored_optim = restored.optimizer.unwrap();
    let continued = train_step(model, &mut optim, &items);
    let continued_restored = train_step(restored.model, &mut restored_optim, &items);
    assert_eq!(fixed_embeddings(&continued), fixed_embeddings(&continued_restored));
}

// ---------------------------------------------------------------------------
// Test 5: resuming from a missing path fails before training
// ---------------------------------------------------------------------------

#[test]
fn test_resume_from_missing_checkpoint() {
    let device = Default::default();
    let dir = TempDir::new().unwrap();
    let dataset = Arc::new(synthetic_dataset(5));
    let missing = dir.path().join("does-not-exist");

    let err = train(
        &tiny_config(1),
        SketchImageModel::<TestAutodiffBackend>::from_config(&tiny_embedder(), &device),
        &mut loader(&dataset, 0),
        &dataset,
        &CheckpointStore::new(dir.path()),
        &mut MemorySink::new(),
        Some(missing.as_path()),
        &device,
    )
    .unwrap_err();

    match err.downcast_ref::<SbirError>() {
        Some(SbirError::MissingCheckpoint(p)) => assert_eq!(p, &missing),
        other => panic!("expected MissingCheckpoint, got {other:?}"),
    }
    assert!(!Path::new(&dir.path().join("last")).exists());
}

// ---------------------------------------------------------------------------
// Test 6: anchors equal to positives with far negatives cost nothing
// ---------------------------------------------------------------------------

#[test]
fn test_zero_loss_for_well_separated_triplets() {
    let device = Default::default();
    let loss_fn = TripletMarginLossConfig::new().init();

    // Three triplets in a batch of four: the fourth row repeats the first.
    let anchors = Tensor::<TestAutodiffBackend, 2>::random([3, 6], Distribution::Normal(0.0, 1.0), &device);
    let anchors = Tensor::cat(vec![anchors.clone(), anchors.slice([0..1, 0..6])], 0);
    let negatives = anchors.clone().add_scalar(50.0);

    let per: Vec<f32> = loss_fn
        .per_triplet(anchors.clone(), anchors.clone(), negatives.clone())
        .unwrap()
        .into_data()
        .to_vec()
        .unwrap();
    assert_eq!(per, vec![0.0; 4]);
    let value: f32 = loss_fn
        .forward(anchors.clone(), anchors, negatives)
        .unwrap()
        .into_scalar()
        .elem();
    assert_eq!(value, 0.0);
}

// ---------------------------------------------------------------------------
// Test 7: raw-pixel retrieval on separable classes is perfect
// ---------------------------------------------------------------------------

#[test]
fn test_pixel_baseline_retrieval_is_perfect() {
    let device = Default::default();
    let dataset = synthetic_dataset(6);
    let encoder = PixelEmbedder::new(3, SIDE, SIDE);
    let config = EvaluationConfig::new().with_top_k(2).with_num_display(3).with_seed(Some(1));

    let report = evaluate::<TestBackend, _, _>(&encoder, &encoder, &dataset, &config, &device).unwrap();
    assert!((report.mean_average_precision - 1.0).abs() < 1e-12);
    assert_eq!(report.per_sketch_ap.len(), 6);
    assert_eq!(report.sketches.len(), 3);
    assert_eq!(report.retrieved_grids.len(), 3);

    // 2 cells of 8x8 with padding 2: height 8+4, width 2*10+2.
    let grid = &report.retrieved_grids[0];
    assert_eq!((grid.height, grid.width, grid.channels), (12, 22, 3));
    let sketch = &report.sketches[0];
    assert_eq!((sketch.height, sketch.width, sketch.channels), (SIDE, SIDE, 3));

    // Same seed, same sample.
    let again = evaluate::<TestBackend, _, _>(&encoder, &encoder, &dataset, &config, &device).unwrap();
    assert_eq!(again.sketches, report.sketches);
}

// ---------------------------------------------------------------------------
// Test 8: a mid-epoch snapshot resumes at the start of that epoch
// ---------------------------------------------------------------------------

#[test]
fn test_mid_epoch_resume_replays_epoch_from_first_batch() {
    let device = Default::default();
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path());
    let dataset = Arc::new(synthetic_dataset(8));

    // Snapshot taken at iteration 1 of epoch 1 (one epoch fully completed).
    let items = loader(&dataset, 2).epoch().next().unwrap().unwrap();
    let mut optim = AdamConfig::new().init::<TestAutodiffBackend, SketchImageModel<TestAutodiffBackend>>();
    let model = SketchImageModel::<TestAutodiffBackend>::from_config(&tiny_embedder(), &device);
    let model = train_step(model, &mut optim, &items);
    store
        .save(&capture_training_state(1, 1, &model, &optim).unwrap(), false)
        .unwrap();

    let sink = MemorySink::new();
    let outcome = train(
        &tiny_config(2).with_start_epoch(1),
        SketchImageModel::<TestAutodiffBackend>::from_config(&tiny_embedder(), &device),
        &mut loader(&dataset, 2),
        &dataset,
        &store,
        &mut sink.clone(),
        Some(&store.latest_path()),
        &device,
    )
    .unwrap();

    // Two batches per epoch: epoch 1 replays steps 2 and 3 from its first batch,
    // including the step the snapshot already covered.
    let loss_steps: Vec<u64> = sink
        .scalars()
        .into_iter()
        .filter(|e| e.name == METRIC_LOSS)
        .map(|e| e.step)
        .collect();
    assert_eq!(loss_steps, vec![2, 3]);
    assert_eq!(outcome.global_step, 3);
    assert_eq!(CheckpointStore::load(dir.path()).unwrap().epochs_completed, 2);
}
