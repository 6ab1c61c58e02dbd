mod config;
mod dataset;
mod pipeline;
mod sink;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pipeline::{EvaluateArgs, TrainArgs};

/// sbir: train and evaluate sketch-based image retrieval encoders.
#[derive(Parser)]
#[command(name = "sbir", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train the sketch and image encoders with a triplet margin objective.
    Train {
        /// Dataset root containing `sketches/<class>/` and `images/<class>/`.
        #[arg(long)]
        data_dir: PathBuf,
        /// Output directory for checkpoints, model config and metrics.
        #[arg(long)]
        run_dir: PathBuf,
        /// Path to a training config TOML file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Resume from a snapshot or run directory.
        #[arg(long)]
        resume_from: Option<PathBuf>,
        /// Override the total number of epochs.
        #[arg(long)]
        epochs: Option<usize>,
        /// Override the first epoch (defaults to the checkpoint's when resuming).
        #[arg(long)]
        start_epoch: Option<usize>,
        /// Override the batch size.
        #[arg(long)]
        batch_size: Option<usize>,
        /// Override the base learning rate.
        #[arg(long)]
        lr: Option<f64>,
        /// Override how often (in batches) loss is logged and checkpointed.
        #[arg(long)]
        print_every: Option<usize>,
        /// Publish epoch-end snapshots into this directory.
        #[arg(long)]
        publish_dir: Option<PathBuf>,
        /// Seed for shuffling, triplet sampling and visualization.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Compute retrieval mAP of trained encoders.
    Evaluate {
        /// Dataset root containing `sketches/<class>/` and `images/<class>/`.
        #[arg(long)]
        data_dir: PathBuf,
        /// Snapshot or run directory to load encoders from.
        #[arg(long)]
        checkpoint: PathBuf,
        /// Path to a config TOML file (`[evaluation]`, `[model]` and `[data]` are read).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the number of retrieved images per grid.
        #[arg(long)]
        top_k: Option<usize>,
        /// Override the number of visualized sketches.
        #[arg(long)]
        num_display: Option<usize>,
        /// Seed for choosing visualized sketches.
        #[arg(long)]
        seed: Option<u64>,
        /// Write sketches, retrieval grids and per-sketch AP here.
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            data_dir,
            run_dir,
            config,
            resume_from,
            epochs,
            start_epoch,
            batch_size,
            lr,
            print_every,
            publish_dir,
            seed,
        } => pipeline::run_train(TrainArgs {
            data_dir,
            run_dir,
            config,
            resume_from,
            epochs,
            start_epoch,
            batch_size,
            lr,
            print_every,
            publish_dir,
            seed,
        }),
        Command::Evaluate {
            data_dir,
            checkpoint,
            config,
            top_k,
            num_display,
            seed,
            output_dir,
        } => pipeline::run_evaluate(EvaluateArgs {
            data_dir,
            checkpoint,
            config,
            top_k,
            num_display,
            seed,
            output_dir,
        }),
    }
}
