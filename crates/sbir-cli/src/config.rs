//! TOML config loading for the sbir CLI.
//!
//! Deserializes `configs/train.toml`, which has `[training]`, `[model]`,
//! `[evaluation]` and `[data]` sections. Every field is optional; the
//! resolved configuration is built as defaults < TOML < CLI flags.

use std::path::Path;

use serde::Deserialize;

use sbir::evaluation::EvaluationConfig;
use sbir::model::embedder::EmbedderConfig;
use sbir::training::trainer::TrainingConfig;

/// Top-level structure matching `configs/train.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SbirToml {
    #[serde(default)]
    pub training: TrainingOverrides,
    #[serde(default)]
    pub model: ModelOverrides,
    #[serde(default)]
    pub evaluation: EvaluationOverrides,
    #[serde(default)]
    pub data: DataOverrides,
}

/// Optional overrides for [`TrainingConfig`] fields.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingOverrides {
    pub batch_size: Option<usize>,
    pub lr: Option<f64>,
    pub lr_scheduler_step_size: Option<usize>,
    pub gamma: Option<f64>,
    pub start_epoch: Option<usize>,
    pub epochs: Option<usize>,
    pub print_every: Option<usize>,
    pub margin: Option<f64>,
    pub weight_decay: Option<f64>,
    pub max_grad_norm: Option<f64>,
}

/// Optional overrides for [`EmbedderConfig`]; both encoders share them.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelOverrides {
    pub channels: Option<Vec<usize>>,
    pub hidden_dim: Option<usize>,
    pub embedding_dim: Option<usize>,
    pub dropout: Option<f64>,
}

/// Optional overrides for [`EvaluationConfig`].
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvaluationOverrides {
    pub batch_size: Option<usize>,
    pub top_k: Option<usize>,
    pub num_display: Option<usize>,
    pub gallery_per_class: Option<usize>,
    pub grid_padding: Option<usize>,
    pub seed: Option<u64>,
}

/// Optional overrides for [`DataSettings`].
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataOverrides {
    pub image_size: Option<u32>,
    pub shuffle: Option<bool>,
    pub seed: Option<u64>,
    pub prefetch: Option<usize>,
}

/// How the image-folder dataset is read and batched.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSettings {
    /// Images are resized to `image_size x image_size`.
    pub image_size: u32,
    pub shuffle: bool,
    pub seed: Option<u64>,
    /// Batches buffered ahead of the training loop.
    pub prefetch: usize,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            image_size: 64,
            shuffle: true,
            seed: None,
            prefetch: 2,
        }
    }
}

/// Flags of the `train` subcommand that override the TOML file.
#[derive(Debug, Default, Clone)]
pub struct TrainCliOverrides {
    pub epochs: Option<usize>,
    pub start_epoch: Option<usize>,
    pub batch_size: Option<usize>,
    pub lr: Option<f64>,
    pub print_every: Option<usize>,
    pub seed: Option<u64>,
}

/// Load and deserialize an `SbirToml` from a TOML file.
pub fn load_sbir_toml(path: &Path) -> anyhow::Result<SbirToml> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config {}: {e}", path.display()))?;
    let config: SbirToml = toml::from_str(&contents)?;
    tracing::info!(path = %path.display(), "Loaded sbir config");
    Ok(config)
}

/// Load the TOML file if one was given, otherwise use all defaults.
pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<SbirToml> {
    match path {
        Some(p) => load_sbir_toml(p),
        None => Ok(SbirToml::default()),
    }
}

/// Build an [`EvaluationConfig`] from defaults and TOML overrides.
pub fn build_evaluation_config(overrides: &EvaluationOverrides) -> EvaluationConfig {
    let mut config = EvaluationConfig::new();
    if let Some(n) = overrides.batch_size {
        config.batch_size = n;
    }
    if let Some(k) = overrides.top_k {
        config.top_k = k;
    }
    if let Some(n) = overrides.num_display {
        config.num_display = n;
    }
    if overrides.gallery_per_class.is_some() {
        config.gallery_per_class = overrides.gallery_per_class;
    }
    if let Some(p) = overrides.grid_padding {
        config.grid_padding = p;
    }
    if overrides.seed.is_some() {
        config.seed = overrides.seed;
    }
    config
}

/// Build a [`TrainingConfig`] from defaults, TOML overrides and CLI flags.
///
/// Priority chain: `TrainingConfig::new()` defaults < TOML values < CLI flags.
/// A CLI `--seed` also seeds the visualization sample unless the TOML set one.
pub fn build_training_config(toml: &SbirToml, cli: &TrainCliOverrides) -> TrainingConfig {
    let t = &toml.training;
    let mut config = TrainingConfig::new();

    if let Some(n) = t.batch_size {
        config.batch_size = n;
    }
    if let Some(lr) = t.lr {
        config.lr = lr;
    }
    if let Some(n) = t.lr_scheduler_step_size {
        config.lr_scheduler_step_size = n;
    }
    if let Some(g) = t.gamma {
        config.gamma = g;
    }
    if let Some(n) = t.start_epoch {
        config.start_epoch = n;
    }
    if let Some(n) = t.epochs {
        config.epochs = n;
    }
    if let Some(n) = t.print_every {
        config.print_every = n;
    }
    if let Some(m) = t.margin {
        config.margin = m;
    }
    if let Some(w) = t.weight_decay {
        config.weight_decay = w;
    }
    if t.max_grad_norm.is_some() {
        config.max_grad_norm = t.max_grad_norm;
    }
    config.evaluation = build_evaluation_config(&toml.evaluation);

    // CLI overrides take highest priority
    if let Some(n) = cli.epochs {
        config.epochs = n;
    }
    if let Some(n) = cli.start_epoch {
        config.start_epoch = n;
    }
    if let Some(n) = cli.batch_size {
        config.batch_size = n;
    }
    if let Some(lr) = cli.lr {
        config.lr = lr;
    }
    if let Some(n) = cli.print_every {
        config.print_every = n;
    }
    if config.evaluation.seed.is_none() {
        config.evaluation.seed = cli.seed;
    }

    config
}

/// Build the encoder configuration shared by both domains.
pub fn build_embedder_config(overrides: &ModelOverrides) -> EmbedderConfig {
    let mut config = EmbedderConfig::new();
    if let Some(c) = &overrides.channels {
        config.channels = c.clone();
    }
    if let Some(n) = overrides.hidden_dim {
        config.hidden_dim = n;
    }
    if let Some(n) = overrides.embedding_dim {
        config.embedding_dim = n;
    }
    if let Some(p) = overrides.dropout {
        config.dropout = p;
    }
    config
}

/// Resolve data settings; a CLI `--seed` wins over the TOML seed.
pub fn build_data_settings(overrides: &DataOverrides, seed_cli: Option<u64>) -> DataSettings {
    let mut settings = DataSettings::default();
    if let Some(s) = overrides.image_size {
        settings.image_size = s;
    }
    if let Some(s) = overrides.shuffle {
        settings.shuffle = s;
    }
    if overrides.seed.is_some() {
        settings.seed = overrides.seed;
    }
    if let Some(p) = overrides.prefetch {
        settings.prefetch = p;
    }
    if seed_cli.is_some() {
        settings.seed = seed_cli;
    }
    settings
}
