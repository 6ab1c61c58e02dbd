//! Resumable training snapshots.
//!
//! A [`CheckpointState`] is a name → serialized-record map plus the iteration
//! counters it was taken at. [`CheckpointStore`] writes it to
//! `<run_dir>/last/` (one `<name>.mpk` per component and a `meta.json`),
//! replacing the previous snapshot as a whole, and can additionally publish it
//! through an [`ArtifactStore`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;

use crate::model::twin::SketchImageModel;
use crate::SbirError;

/// Component holding the sketch encoder's parameters.
pub const SKETCH_MODEL: &str = "sketch_model";
/// Component holding the image encoder's parameters.
pub const IMAGE_MODEL: &str = "image_model";
/// Component holding the optimizer's moment buffers.
pub const OPTIMIZER: &str = "optimizer";

const LAST_DIR: &str = "last";
const STAGING_DIR: &str = ".last.staging";
const RETIRED_DIR: &str = ".last.old";
const META_FILE: &str = "meta.json";
const COMPONENT_EXT: &str = "mpk";

type BytesRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

/// Metadata saved alongside the component files.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    pub iteration: usize,
    pub epochs_completed: usize,
    pub components: Vec<String>,
}

/// Everything needed to resume: counters plus named serialized sub-states.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointState {
    /// Iteration within the epoch at which the snapshot was taken.
    ///
    /// Informational only. Resume restarts epoch `epochs_completed` at its
    /// first batch, so the steps of a mid-epoch snapshot's epoch are trained
    /// and emitted again under the same global step numbers.
    pub iteration: usize,
    /// Epochs fully finished before the snapshot.
    pub epochs_completed: usize,
    components: BTreeMap<String, Vec<u8>>,
}

impl CheckpointState {
    pub fn new(iteration: usize, epochs_completed: usize) -> Self {
        Self {
            iteration,
            epochs_completed,
            components: BTreeMap::new(),
        }
    }

    /// Serialize a module's record under `name`, replacing any previous entry.
    pub fn insert_module<B: Backend, M: Module<B>>(
        &mut self,
        name: &str,
        module: &M,
    ) -> Result<(), SbirError> {
        validate_name(name)?;
        let bytes =
            Recorder::<B>::record(&BytesRecorder::new(), module.clone().into_record(), ())?;
        self.components.insert(name.to_string(), bytes);
        Ok(())
    }

    /// Serialize an optimizer's state under `name`.
    pub fn insert_optimizer<B, M, O>(&mut self, name: &str, optimizer: &O) -> Result<(), SbirError>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        validate_name(name)?;
        let bytes = Recorder::<B>::record(&BytesRecorder::new(), optimizer.to_record(), ())?;
        self.components.insert(name.to_string(), bytes);
        Ok(())
    }

    /// Load the record stored under `name` into `module`.
    pub fn restore_module<B: Backend, M: Module<B>>(
        &self,
        name: &str,
        module: M,
        device: &B::Device,
    ) -> Result<M, SbirError> {
        let bytes = self.bytes(name)?.to_vec();
        let record: M::Record = Recorder::<B>::load(&BytesRecorder::new(), bytes, device)?;
        Ok(module.load_record(record))
    }

    /// Load the optimizer state stored under `name` into `optimizer`.
    pub fn restore_optimizer<B, M, O>(
        &self,
        name: &str,
        optimizer: O,
        device: &B::Device,
    ) -> Result<O, SbirError>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let bytes = self.bytes(name)?.to_vec();
        let record: O::Record = Recorder::<B>::load(&BytesRecorder::new(), bytes, device)?;
        Ok(optimizer.load_record(record))
    }

    /// Store raw bytes under `name`.
    pub fn insert_bytes(&mut self, name: &str, bytes: Vec<u8>) -> Result<(), SbirError> {
        validate_name(name)?;
        self.components.insert(name.to_string(), bytes);
        Ok(())
    }

    /// Raw serialized bytes of a component.
    pub fn bytes(&self, name: &str) -> Result<&[u8], SbirError> {
        self.components
            .get(name)
            .map(|b| b.as_slice())
            .ok_or_else(|| SbirError::MissingComponent {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    pub fn component_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.components.keys().map(|k| k.as_str())
    }

    fn meta(&self) -> CheckpointMeta {
        CheckpointMeta {
            iteration: self.iteration,
            epochs_completed: self.epochs_completed,
            components: self.components.keys().cloned().collect(),
        }
    }
}

/// Component names become file names.
fn validate_name(name: &str) -> Result<(), SbirError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(SbirError::InvalidConfig(format!(
            "checkpoint component name '{name}' must be non-empty [A-Za-z0-9_-]"
        )))
    }
}

/// Durable destination for published snapshots.
pub trait ArtifactStore {
    /// Copy the snapshot directory somewhere durable; returns where it went.
    fn publish(&self, snapshot: &Path, meta: &CheckpointMeta) -> Result<PathBuf, SbirError>;
}

/// Publishes snapshots into `<root>/epoch_<n>/`, overwriting a previous
/// publication of the same epoch.
#[derive(Debug, Clone)]
pub struct DirectoryArtifactStore {
    root: PathBuf,
}

impl DirectoryArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactStore for DirectoryArtifactStore {
    fn publish(&self, snapshot: &Path, meta: &CheckpointMeta) -> Result<PathBuf, SbirError> {
        let dest = self.root.join(format!("epoch_{:04}", meta.epochs_completed));
        if dest.exists() {
            std::fs::remove_dir_all(&dest)?;
        }
        std::fs::create_dir_all(&dest)?;
        for entry in std::fs::read_dir(snapshot)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                std::fs::copy(entry.path(), dest.join(entry.file_name()))?;
            }
        }
        Ok(dest)
    }
}

/// Writes and reads the run's latest snapshot.
pub struct CheckpointStore {
    run_dir: PathBuf,
    artifacts: Option<Box<dyn ArtifactStore>>,
}

impl CheckpointStore {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
            artifacts: None,
        }
    }

    /// Enable publishing through `store`.
    pub fn with_artifact_store(mut self, store: impl ArtifactStore + 'static) -> Self {
        self.artifacts = Some(Box::new(store));
        self
    }

    /// Directory of the latest snapshot.
    pub fn latest_path(&self) -> PathBuf {
        self.run_dir.join(LAST_DIR)
    }

    /// Overwrite the latest snapshot with `state`; with `publish`, also hand
    /// it to the artifact store. Returns the local snapshot path.
    ///
    /// The snapshot is assembled in a staging directory and renamed into
    /// place, so `last/` never mixes files from two saves.
    pub fn save(&self, state: &CheckpointState, publish: bool) -> Result<PathBuf, SbirError> {
        std::fs::create_dir_all(&self.run_dir)?;
        let staging = self.run_dir.join(STAGING_DIR);
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir_all(&staging)?;

        for (name, bytes) in &state.components {
            std::fs::write(staging.join(format!("{name}.{COMPONENT_EXT}")), bytes)?;
        }
        let meta = state.meta();
        serde_json::to_writer_pretty(std::fs::File::create(staging.join(META_FILE))?, &meta)?;

        let last = self.latest_path();
        let retired = self.run_dir.join(RETIRED_DIR);
        if last.exists() {
            if retired.exists() {
                std::fs::remove_dir_all(&retired)?;
            }
            std::fs::rename(&last, &retired)?;
        }
        std::fs::rename(&staging, &last)?;
        if retired.exists() {
            std::fs::remove_dir_all(&retired)?;
        }

        tracing::debug!(
            path = %last.display(),
            iteration = state.iteration,
            epochs_completed = state.epochs_completed,
            components = meta.components.len(),
            "Checkpoint saved"
        );

        if publish {
            match &self.artifacts {
                Some(store) => {
                    let dest = store.publish(&last, &meta)?;
                    tracing::info!(
                        dest = %dest.display(),
                        epochs_completed = state.epochs_completed,
                        "Checkpoint published"
                    );
                }
                None => {
                    tracing::warn!("Publish requested but no artifact store is configured; kept local only");
                }
            }
        }
        Ok(last)
    }

    /// Read a snapshot. `path` may be a snapshot directory or a run directory
    /// containing `last/`.
    ///
    /// If a save was interrupted between its two renames, `last/` is missing
    /// and the previous snapshot is read from `.last.old/` instead.
    ///
    /// # Errors
    /// `MissingCheckpoint` if no snapshot is found at `path`, under
    /// `path/last/`, or in the retired slot.
    pub fn load(path: &Path) -> Result<CheckpointState, SbirError> {
        let dir = if path.join(META_FILE).is_file() {
            path.to_path_buf()
        } else if path.join(LAST_DIR).join(META_FILE).is_file() {
            path.join(LAST_DIR)
        } else if let Some(retired) = retired_snapshot(path) {
            tracing::warn!(
                path = %path.display(),
                retired = %retired.display(),
                "Latest snapshot missing; loading the retired one"
            );
            retired
        } else {
            return Err(SbirError::MissingCheckpoint(path.to_path_buf()));
        };

        let meta: CheckpointMeta =
            serde_json::from_reader(std::fs::File::open(dir.join(META_FILE))?)?;
        let mut state = CheckpointState::new(meta.iteration, meta.epochs_completed);
        for name in &meta.components {
            let file = dir.join(format!("{name}.{COMPONENT_EXT}"));
            let bytes = std::fs::read(&file).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SbirError::MissingComponent { name: name.clone() }
                } else {
                    SbirError::Io(e)
                }
            })?;
            state.insert_bytes(name, bytes)?;
        }
        Ok(state)
    }
}

/// The retired snapshot for a run directory, or for a `last/` path inside it.
fn retired_snapshot(path: &Path) -> Option<PathBuf> {
    let run_dir = if path.file_name().is_some_and(|n| n == LAST_DIR) {
        path.parent()?
    } else {
        path
    };
    let retired = run_dir.join(RETIRED_DIR);
    retired.join(META_FILE).is_file().then_some(retired)
}

/// Snapshot both encoders.
pub fn capture_models<B: Backend>(
    iteration: usize,
    epochs_completed: usize,
    model: &SketchImageModel<B>,
) -> Result<CheckpointState, SbirError> {
    let mut state = CheckpointState::new(iteration, epochs_completed);
    state.insert_module::<B, _>(SKETCH_MODEL, &model.sketch_encoder)?;
    state.insert_module::<B, _>(IMAGE_MODEL, &model.image_encoder)?;
    Ok(state)
}

/// Snapshot both encoders and the optimizer.
pub fn capture_training_state<B, O>(
    iteration: usize,
    epochs_completed: usize,
    model: &SketchImageModel<B>,
    optimizer: &O,
) -> Result<CheckpointState, SbirError>
where
    B: AutodiffBackend,
    O: Optimizer<SketchImageModel<B>, B>,
{
    let mut state = capture_models(iteration, epochs_completed, model)?;
    state.insert_optimizer::<B, SketchImageModel<B>, O>(OPTIMIZER, optimizer)?;
    Ok(state)
}

/// Encoders (and optionally optimizer) restored from a snapshot.
pub struct RestoredTraining<B: AutodiffBackend, O> {
    pub model: SketchImageModel<B>,
    pub optimizer: Option<O>,
    pub iteration: usize,
    pub epochs_completed: usize,
}

/// Restore both encoders into `model` in place of their current weights.
pub fn restore_models<B: Backend>(
    state: &CheckpointState,
    model: SketchImageModel<B>,
    device: &B::Device,
) -> Result<SketchImageModel<B>, SbirError> {
    let SketchImageModel {
        sketch_encoder,
        image_encoder,
    } = model;
    Ok(SketchImageModel {
        sketch_encoder: state.restore_module::<B, _>(SKETCH_MODEL, sketch_encoder, device)?,
        image_encoder: state.restore_module::<B, _>(IMAGE_MODEL, image_encoder, device)?,
    })
}

/// Load a snapshot from `path` into caller-supplied instances.
///
/// With `optimizer = None` the optimizer sub-state is skipped even if present.
/// A snapshot without one leaves a supplied optimizer untouched.
pub fn load_training_state<B, O>(
    path: &Path,
    model: SketchImageModel<B>,
    optimizer: Option<O>,
    device: &B::Device,
) -> Result<RestoredTraining<B, O>, SbirError>
where
    B: AutodiffBackend,
    O: Optimizer<SketchImageModel<B>, B>,
{
    let state = CheckpointStore::load(path)?;
    let model = restore_models(&state, model, device)?;
    let optimizer = match optimizer {
        Some(optim) if state.contains(OPTIMIZER) => Some(
            state.restore_optimizer::<B, SketchImageModel<B>, O>(OPTIMIZER, optim, device)?,
        ),
        Some(optim) => {
            tracing::warn!(path = %path.display(), "Checkpoint has no optimizer state; starting fresh moments");
            Some(optim)
        }
        None => None,
    };
    Ok(RestoredTraining {
        model,
        optimizer,
        iteration: state.iteration,
        epochs_completed: state.epochs_completed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::embedder::EmbedderConfig;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;
    use burn::nn::{Linear, LinearConfig};

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn tiny() -> EmbedderConfig {
        EmbedderConfig::new()
            .with_in_channels(1)
            .with_channels(vec![2])
            .with_hidden_dim(4)
            .with_embedding_dim(3)
    }

    fn weights<B: Backend>(linear: &Linear<B>) -> Vec<f32> {
        linear.weight.val().into_data().convert::<f32>().to_vec().unwrap()
    }

    #[test]
    fn test_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = CheckpointStore::load(&missing).unwrap_err();
        assert!(matches!(err, SbirError::MissingCheckpoint(ref p) if p == &missing));
    }

    #[test]
    fn test_module_round_trip_is_bit_identical() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        let saved = LinearConfig::new(4, 3).init::<TestBackend>(&device);
        let mut state = CheckpointState::new(17, 2);
        state.insert_module::<TestBackend, _>("head", &saved).unwrap();
        let path = store.save(&state, false).unwrap();
        assert_eq!(path, dir.path().join("last"));

        let loaded = CheckpointStore::load(dir.path()).unwrap();
        assert_eq!(loaded.iteration, 17);
        assert_eq!(loaded.epochs_completed, 2);

        let fresh = LinearConfig::new(4, 3).init::<TestBackend>(&device);
        assert_ne!(weights(&fresh), weights(&saved));
        let restored = loaded.restore_module::<TestBackend, _>("head", fresh, &device).unwrap();
        assert_eq!(weights(&restored), weights(&saved));
    }

    #[test]
    fn test_extra_named_component() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        let model = SketchImageModel::<TestAutodiffBackend>::from_config(&tiny(), &device);
        let mut state = capture_models(3, 1, &model).unwrap();
        let domain_net = LinearConfig::new(3, 2).init::<TestAutodiffBackend>(&device);
        state
            .insert_module::<TestAutodiffBackend, _>("domain_net", &domain_net)
            .unwrap();
        store.save(&state, false).unwrap();

        let loaded = CheckpointStore::load(&store.latest_path()).unwrap();
        let names: Vec<&str> = loaded.component_names().collect();
        assert_eq!(names, vec!["domain_net", "image_model", "sketch_model"]);

        let restored = loaded
            .restore_module::<TestAutodiffBackend, _>(
                "domain_net",
                LinearConfig::new(3, 2).init::<TestAutodiffBackend>(&device),
                &device,
            )
            .unwrap();
        assert_eq!(weights(&restored), weights(&domain_net));
    }

    #[test]
    fn test_missing_component() {
        let state = CheckpointState::new(0, 0);
        let err = state.bytes(OPTIMIZER).unwrap_err();
        assert!(matches!(err, SbirError::MissingComponent { ref name } if name == OPTIMIZER));
    }

    #[test]
    fn test_rejects_unsafe_component_name() {
        let mut state = CheckpointState::new(0, 0);
        assert!(state.insert_bytes("../escape", vec![1]).is_err());
        assert!(state.insert_bytes("", vec![1]).is_err());
        assert!(state.insert_bytes("ok_name-2", vec![1]).is_ok());
    }

    #[test]
    fn test_save_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        let mut first = CheckpointState::new(1, 0);
        first.insert_bytes("stale", vec![1, 2, 3]).unwrap();
        store.save(&first, false).unwrap();

        let mut second = CheckpointState::new(2, 0);
        second.insert_bytes("fresh", vec![4]).unwrap();
        store.save(&second, false).unwrap();

        let loaded = CheckpointStore::load(dir.path()).unwrap();
        assert_eq!(loaded.iteration, 2);
        assert_eq!(loaded.component_names().collect::<Vec<_>>(), vec!["fresh"]);
        assert!(!store.latest_path().join("stale.mpk").exists());
        assert!(!dir.path().join(STAGING_DIR).exists());
    }

    #[test]
    fn test_interrupted_swap_loads_retired_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        let mut state = CheckpointState::new(5, 2);
        state.insert_bytes("blob", vec![7]).unwrap();
        store.save(&state, false).unwrap();

        // Killed after `last/` was retired but before staging moved in.
        std::fs::rename(store.latest_path(), dir.path().join(RETIRED_DIR)).unwrap();

        for path in [dir.path().to_path_buf(), store.latest_path()] {
            let loaded = CheckpointStore::load(&path).unwrap();
            assert_eq!(loaded.iteration, 5);
            assert_eq!(loaded.epochs_completed, 2);
            assert_eq!(loaded.bytes("blob").unwrap(), &[7]);
        }

        // The next save replaces it without dropping the retired copy first.
        let next = CheckpointState::new(6, 2);
        store.save(&next, false).unwrap();
        assert_eq!(CheckpointStore::load(dir.path()).unwrap().iteration, 6);
        assert!(!dir.path().join(RETIRED_DIR).exists());
    }

    #[test]
    fn test_publish_copies_to_artifact_store() {
        let dir = tempfile::tempdir().unwrap();
        let published = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path())
            .with_artifact_store(DirectoryArtifactStore::new(published.path()));

        let mut state = CheckpointState::new(0, 3);
        state.insert_bytes("blob", vec![9, 9]).unwrap();
        store.save(&state, false).unwrap();
        assert!(!published.path().join("epoch_0003").exists());

        store.save(&state, true).unwrap();
        let copy = CheckpointStore::load(&published.path().join("epoch_0003")).unwrap();
        assert_eq!(copy.bytes("blob").unwrap(), &[9, 9]);
        assert_eq!(copy.epochs_completed, 3);
    }

    #[test]
    fn test_publish_without_store_stays_local() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let state = CheckpointState::new(0, 1);
        let path = store.save(&state, true).unwrap();
        assert!(path.join(META_FILE).is_file());
    }
}
