use std::path::PathBuf;

/// Errors raised by the training, checkpointing and evaluation core.
///
/// `NonFiniteLoss` and `ShapeMismatch` are fatal to a training run; the run is
/// expected to be resumed from the last checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum SbirError {
    /// Loss became NaN or infinite.
    #[error("non-finite loss {value} at epoch {epoch}, iteration {iteration}")]
    NonFiniteLoss {
        epoch: usize,
        iteration: usize,
        value: f64,
    },

    /// Tensor shapes do not line up.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Resume was requested from a checkpoint path that does not exist.
    #[error("checkpoint not found: {}", .0.display())]
    MissingCheckpoint(PathBuf),

    /// A checkpoint exists but lacks the requested named sub-state.
    #[error("checkpoint has no component named '{name}'")]
    MissingComponent { name: String },

    /// An operation was invoked with zero examples.
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// The dataset cannot produce triplets or ground truth.
    #[error("invalid dataset: {0}")]
    InvalidDataset(String),

    /// The prefetching data loader stopped before the epoch was complete.
    #[error("data loader failed: {0}")]
    Loader(String),

    /// Configuration rejected by validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Failure inside a burn recorder.
    #[error("record error: {0}")]
    Record(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<burn::record::RecorderError> for SbirError {
    fn from(e: burn::record::RecorderError) -> Self {
        SbirError::Record(e.to_string())
    }
}
