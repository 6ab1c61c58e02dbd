//! Training: triplet data pipeline, loss, schedule, checkpoints and the loop.

pub mod checkpoint;
pub mod data;
pub mod loss;
pub mod running;
pub mod schedule;
pub mod sink;
pub mod trainer;

pub use checkpoint::{CheckpointState, CheckpointStore, DirectoryArtifactStore};
pub use data::{SketchImageDataset, TripletLoader};
pub use loss::{TripletMarginLoss, TripletMarginLossConfig};
pub use running::RunningAverage;
pub use schedule::{StepLr, StepLrConfig};
pub use sink::{MemorySink, MetricsSink, TracingSink};
pub use trainer::{train, TrainingConfig, TrainingOutcome};
