//! Pluggable destinations for training metrics.

use std::sync::{Arc, Mutex};

use crate::training::data::ImageArray;
use crate::SbirError;

/// Receives named scalar and image events keyed by a monotonically
/// increasing step.
pub trait MetricsSink {
    fn log_scalar(&mut self, name: &str, value: f64, step: u64) -> Result<(), SbirError>;

    fn log_images(&mut self, name: &str, images: &[ImageArray], step: u64)
        -> Result<(), SbirError>;
}

/// Emits every event as a structured `tracing` line. Images are summarized by
/// count and shape only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn log_scalar(&mut self, name: &str, value: f64, step: u64) -> Result<(), SbirError> {
        tracing::info!(metric = name, value, step, "scalar");
        Ok(())
    }

    fn log_images(
        &mut self,
        name: &str,
        images: &[ImageArray],
        step: u64,
    ) -> Result<(), SbirError> {
        let shapes: Vec<String> = images
            .iter()
            .map(|i| format!("{}x{}x{}", i.height, i.width, i.channels))
            .collect();
        tracing::info!(metric = name, count = images.len(), step, shapes = ?shapes, "images");
        Ok(())
    }
}

/// A scalar event captured by [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarEvent {
    pub name: String,
    pub value: f64,
    pub step: u64,
}

#[derive(Debug, Default)]
struct Recorded {
    scalars: Vec<ScalarEvent>,
    images: Vec<(String, usize, u64)>,
}

/// Keeps events in memory behind a shared handle, so a clone can be read back
/// after the first handle was moved into the training loop.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    inner: Arc<Mutex<Recorded>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scalars(&self) -> Vec<ScalarEvent> {
        self.inner
            .lock()
            .map(|r| r.scalars.clone())
            .unwrap_or_default()
    }

    /// Scalar values logged under `name`, in order.
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.scalars()
            .into_iter()
            .filter(|e| e.name == name)
            .map(|e| e.value)
            .collect()
    }

    /// `(name, image count, step)` of every image event.
    pub fn image_events(&self) -> Vec<(String, usize, u64)> {
        self.inner
            .lock()
            .map(|r| r.images.clone())
            .unwrap_or_default()
    }

    fn with<F: FnOnce(&mut Recorded)>(&self, f: F) -> Result<(), SbirError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| std::io::Error::other("metrics sink lock poisoned"))?;
        f(&mut guard);
        Ok(())
    }
}

impl MetricsSink for MemorySink {
    fn log_scalar(&mut self, name: &str, value: f64, step: u64) -> Result<(), SbirError> {
        self.with(|r| {
            r.scalars.push(ScalarEvent {
                name: name.to_string(),
                value,
                step,
            })
        })
    }

    fn log_images(
        &mut self,
        name: &str,
        images: &[ImageArray],
        step: u64,
    ) -> Result<(), SbirError> {
        self.with(|r| r.images.push((name.to_string(), images.len(), step)))
    }
}

impl<S: MetricsSink + ?Sized> MetricsSink for Box<S> {
    fn log_scalar(&mut self, name: &str, value: f64, step: u64) -> Result<(), SbirError> {
        (**self).log_scalar(name, value, step)
    }

    fn log_images(
        &mut self,
        name: &str,
        images: &[ImageArray],
        step: u64,
    ) -> Result<(), SbirError> {
        (**self).log_images(name, images, step)
    }
}
