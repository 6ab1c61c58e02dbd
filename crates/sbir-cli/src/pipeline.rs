//! Training and evaluation pipelines behind the CLI subcommands.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};

use sbir::evaluation::evaluate;
use sbir::model::embedder::EmbedderConfig;
use sbir::model::twin::SketchImageModel;
use sbir::training::checkpoint::restore_models;
use sbir::training::{train, CheckpointStore, DirectoryArtifactStore, TripletLoader};

use crate::config::{
    build_data_settings, build_embedder_config, build_evaluation_config, build_training_config,
    load_or_default, TrainCliOverrides,
};
use crate::dataset::load_image_folder;
use crate::sink::{save_png, JsonlSink};

pub type EvalBackend = NdArray<f32>;
pub type TrainBackend = Autodiff<EvalBackend>;

/// Encoder architecture saved next to the checkpoints of a run.
pub const MODEL_CONFIG_FILE: &str = "model.json";
/// Metrics written by `train`, relative to the run directory.
pub const LOG_DIR: &str = "logs";

/// Arguments for the `train` subcommand.
#[derive(Debug)]
pub struct TrainArgs {
    /// Dataset root with `sketches/` and `images/`.
    pub data_dir: PathBuf,
    /// Where checkpoints, model config and metrics go.
    pub run_dir: PathBuf,
    pub config: Option<PathBuf>,
    /// Snapshot or run directory to resume from.
    pub resume_from: Option<PathBuf>,
    pub epochs: Option<usize>,
    pub start_epoch: Option<usize>,
    pub batch_size: Option<usize>,
    pub lr: Option<f64>,
    pub print_every: Option<usize>,
    /// Directory epoch-end snapshots are published to.
    pub publish_dir: Option<PathBuf>,
    pub seed: Option<u64>,
}

/// Arguments for the `evaluate` subcommand.
#[derive(Debug)]
pub struct EvaluateArgs {
    pub data_dir: PathBuf,
    /// Snapshot or run directory holding the trained encoders.
    pub checkpoint: PathBuf,
    pub config: Option<PathBuf>,
    pub top_k: Option<usize>,
    pub num_display: Option<usize>,
    pub seed: Option<u64>,
    /// Write sampled sketches, retrieval grids and per-sketch AP here.
    pub output_dir: Option<PathBuf>,
}

/// Train both encoders on an image-folder dataset.
pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let start = Instant::now();

    // 1. Resolve configuration
    let toml = load_or_default(args.config.as_deref())?;
    let cli = TrainCliOverrides {
        epochs: args.epochs,
        start_epoch: args.start_epoch,
        batch_size: args.batch_size,
        lr: args.lr,
        print_every: args.print_every,
        seed: args.seed,
    };
    let mut config = build_training_config(&toml, &cli);
    if let (Some(path), None) = (&args.resume_from, args.start_epoch) {
        let state = CheckpointStore::load(path)?;
        tracing::info!(
            path = %path.display(),
            start_epoch = state.epochs_completed,
            "Resuming at the checkpoint's completed epoch count"
        );
        config.start_epoch = state.epochs_completed;
    }
    config.validate()?;
    let data = build_data_settings(&toml.data, args.seed);

    std::fs::create_dir_all(&args.run_dir)
        .with_context(|| format!("creating run dir {}", args.run_dir.display()))?;
    let model_config = match &args.resume_from {
        Some(path) => find_model_config(path)?.unwrap_or_else(|| build_embedder_config(&toml.model)),
        None => build_embedder_config(&toml.model),
    };
    save_model_config(&model_config, &args.run_dir.join(MODEL_CONFIG_FILE))?;

    // 2. Load data
    let dataset = Arc::new(load_image_folder(&args.data_dir, data.image_size)?);
    let mut loader = TripletLoader::new(
        Arc::clone(&dataset),
        config.batch_size,
        data.shuffle,
        data.seed,
    )?
    .with_prefetch(data.prefetch);

    // 3. Checkpoints and metrics
    let mut store = CheckpointStore::new(&args.run_dir);
    if let Some(dir) = &args.publish_dir {
        store = store.with_artifact_store(DirectoryArtifactStore::new(dir));
    }
    let mut sink = JsonlSink::create(&args.run_dir.join(LOG_DIR))?;

    // 4. Train
    let device = NdArrayDevice::default();
    let model = SketchImageModel::<TrainBackend>::from_config(&model_config, &device);
    let outcome = train(
        &config,
        model,
        &mut loader,
        &dataset,
        &store,
        &mut sink,
        args.resume_from.as_deref(),
        &device,
    )?;

    let elapsed = start.elapsed();
    println!("\n--- Training Summary ---");
    println!("Epochs: {}..{}", config.start_epoch, config.epochs);
    println!("Steps: {}", outcome.global_step);
    if let Some(loss) = outcome.epoch_losses.last() {
        println!("Final loss: {loss:.4}");
    }
    if let Some(map) = outcome.epoch_maps.last() {
        println!("Final mAP: {map:.4}");
    }
    println!("Checkpoint: {}", store.latest_path().display());
    println!("Elapsed: {:.1}s", elapsed.as_secs_f64());

    Ok(())
}

/// Evaluate trained encoders: mAP over the dataset plus optional visuals.
pub fn run_evaluate(args: EvaluateArgs) -> anyhow::Result<()> {
    let toml = load_or_default(args.config.as_deref())?;
    let mut eval_config = build_evaluation_config(&toml.evaluation);
    if let Some(k) = args.top_k {
        eval_config.top_k = k;
    }
    if let Some(n) = args.num_display {
        eval_config.num_display = n;
    }
    if args.seed.is_some() {
        eval_config.seed = args.seed;
    }
    let data = build_data_settings(&toml.data, args.seed);

    let model_config = match find_model_config(&args.checkpoint)? {
        Some(c) => c,
        None => {
            tracing::warn!(
                checkpoint = %args.checkpoint.display(),
                "No {MODEL_CONFIG_FILE} found; using the configured architecture"
            );
            build_embedder_config(&toml.model)
        }
    };

    let device = NdArrayDevice::default();
    let state = CheckpointStore::load(&args.checkpoint)?;
    let model = restore_models(
        &state,
        SketchImageModel::<EvalBackend>::from_config(&model_config, &device),
        &device,
    )?;
    tracing::info!(
        checkpoint = %args.checkpoint.display(),
        epochs_completed = state.epochs_completed,
        "Loaded encoders"
    );

    let dataset = load_image_folder(&args.data_dir, data.image_size)?;
    let report = evaluate::<EvalBackend, _, _>(
        &model.sketch_encoder,
        &model.image_encoder,
        &dataset,
        &eval_config,
        &device,
    )?;
    tracing::info!(map = report.mean_average_precision, "Evaluation complete");

    if let Some(dir) = &args.output_dir {
        std::fs::create_dir_all(dir)?;
        for (i, sketch) in report.sketches.iter().enumerate() {
            save_png(sketch, &dir.join(format!("sketch_{i}.png")))?;
        }
        for (i, grid) in report.retrieved_grids.iter().enumerate() {
            save_png(grid, &dir.join(format!("retrieved_{i}.png")))?;
        }
        let summary = serde_json::json!({
            "mean_average_precision": report.mean_average_precision,
            "per_sketch_ap": report.per_sketch_ap,
        });
        std::fs::write(
            dir.join("evaluation.json"),
            serde_json::to_string_pretty(&summary)?,
        )?;
    }

    println!("--- Evaluation Summary ---");
    println!("Sketches: {}", dataset.sketches().len());
    println!("Gallery: {}", dataset.images().len());
    println!("mAP: {:.4}", report.mean_average_precision);

    Ok(())
}

fn save_model_config(config: &EmbedderConfig, path: &Path) -> anyhow::Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(config)?)
        .with_context(|| format!("writing {}", path.display()))
}

/// Look for the run's `model.json` in `path` and its two ancestors, which
/// covers a run dir, `run/last` and `publish/epoch_n` next to a run.
fn find_model_config(path: &Path) -> anyhow::Result<Option<EmbedderConfig>> {
    for dir in path.ancestors().take(3) {
        let candidate = dir.join(MODEL_CONFIG_FILE);
        if candidate.is_file() {
            let file = std::fs::File::open(&candidate)?;
            let config: EmbedderConfig = serde_json::from_reader(file)
                .with_context(|| format!("parsing {}", candidate.display()))?;
            tracing::info!(path = %candidate.display(), "Loaded model config");
            return Ok(Some(config));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_dataset(root: &Path) {
        let colors = [("circle", [230u8, 20, 20]), ("square", [20, 230, 20]), ("star", [20, 20, 230])];
        for (name, color) in colors {
            for (sub, n) in [("sketches", 2), ("images", 2)] {
                let dir = root.join(sub).join(name);
                std::fs::create_dir_all(&dir).unwrap();
                for i in 0..n {
                    image::RgbImage::from_fn(8, 8, |x, _| {
                        let shade = if x % 2 == i { 0 } else { 10 };
                        image::Rgb([color[0] - shade, color[1] - shade, color[2] - shade])
                    })
                    .save(dir.join(format!("{i}.png")))
                    .unwrap();
                }
            }
        }
    }

    fn write_config(path: &Path) {
        std::fs::write(
            path,
            r#"
[training]
batch_size = 3
lr = 1e-3
lr_scheduler_step_size = 1
epochs = 1
print_every = 1

[model]
channels = [4]
hidden_dim = 8
embedding_dim = 4
dropout = 0.0

[evaluation]
batch_size = 4
top_k = 2
num_display = 2
seed = 0

[data]
image_size = 8
seed = 1
prefetch = 1
"#,
        )
        .unwrap();
    }

    #[test]
    fn test_train_then_evaluate() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = tmp.path().join("data");
        let run_dir = tmp.path().join("run");
        let publish_dir = tmp.path().join("published");
        let out_dir = tmp.path().join("eval");
        let config = tmp.path().join("train.toml");
        write_dataset(&data_dir);
        write_config(&config);

        run_train(TrainArgs {
            data_dir: data_dir.clone(),
            run_dir: run_dir.clone(),
            config: Some(config.clone()),
            resume_from: None,
            epochs: None,
            start_epoch: None,
            batch_size: None,
            lr: None,
            print_every: None,
            publish_dir: Some(publish_dir.clone()),
            seed: None,
        })
        .unwrap();

        assert!(run_dir.join(MODEL_CONFIG_FILE).is_file());
        assert!(run_dir.join("last").join("meta.json").is_file());
        assert!(publish_dir.join("epoch_0001").join("meta.json").is_file());
        let events = std::fs::read_to_string(run_dir.join(LOG_DIR).join("events.jsonl")).unwrap();
        assert!(events.contains("Average Training mAP"));

        // Resume for one more epoch; start epoch comes from the checkpoint.
        run_train(TrainArgs {
            data_dir: data_dir.clone(),
            run_dir: run_dir.clone(),
            config: Some(config.clone()),
            resume_from: Some(run_dir.clone()),
            epochs: Some(2),
            start_epoch: None,
            batch_size: None,
            lr: None,
            print_every: None,
            publish_dir: Some(publish_dir.clone()),
            seed: None,
        })
        .unwrap();
        let state = CheckpointStore::load(&run_dir).unwrap();
        assert_eq!(state.epochs_completed, 2);
        assert!(publish_dir.join("epoch_0002").is_dir());

        run_evaluate(EvaluateArgs {
            data_dir,
            checkpoint: run_dir.join("last"),
            config: Some(config),
            top_k: None,
            num_display: None,
            seed: None,
            output_dir: Some(out_dir.clone()),
        })
        .unwrap();

        let summary: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out_dir.join("evaluation.json")).unwrap())
                .unwrap();
        assert_eq!(summary["per_sketch_ap"].as_array().unwrap().len(), 6);
        assert!(out_dir.join("retrieved_0.png").is_file());
        assert!(out_dir.join("sketch_1.png").is_file());
    }

    #[test]
    fn test_find_model_config_walks_up() {
        let tmp = tempfile::tempdir().unwrap();
        let config = EmbedderConfig::new().with_embedding_dim(7);
        save_model_config(&config, &tmp.path().join(MODEL_CONFIG_FILE)).unwrap();
        let nested = tmp.path().join("last");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_model_config(&nested).unwrap().unwrap();
        assert_eq!(found.embedding_dim, 7);
        assert!(find_model_config(&tmp.path().join("elsewhere/deeper/still"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_evaluate_missing_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        write_dataset(tmp.path());
        let err = run_evaluate(EvaluateArgs {
            data_dir: tmp.path().to_path_buf(),
            checkpoint: tmp.path().join("nope"),
            config: None,
            top_k: None,
            num_display: None,
            seed: None,
            output_dir: None,
        })
        .unwrap_err();
        assert!(err.downcast_ref::<sbir::SbirError>().is_some(), "got {err:#}");
    }
}
