//! Triplet data pipeline for sketch/image training.
//!
//! Holds labeled sketches and gallery images in memory, indexes gallery images
//! by class, and draws (anchor, positive, negative) triplets: the anchor is a
//! sketch, the positive a random gallery image of the same class, the negative
//! a random gallery image of another class. Batches are produced by a
//! background thread into a bounded queue; tensors are only built on the
//! consuming side by [`collate`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use burn::prelude::*;
use burn::tensor::TensorData;
use crossbeam_channel::{bounded, Receiver};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::model::bridge::{embeddings_to_tensor, images_to_tensor};
use crate::SbirError;

/// A single image stored channel-first (`C × H × W`) as `f32` pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageData {
    channels: usize,
    height: usize,
    width: usize,
    pixels: Vec<f32>,
}

impl ImageData {
    /// Wrap a CHW pixel buffer, checking its length against the shape.
    pub fn new(
        channels: usize,
        height: usize,
        width: usize,
        pixels: Vec<f32>,
    ) -> Result<Self, SbirError> {
        if pixels.len() != channels * height * width {
            return Err(SbirError::ShapeMismatch(format!(
                "pixel buffer has {} values, expected {channels}x{height}x{width}",
                pixels.len()
            )));
        }
        Ok(Self {
            channels,
            height,
            width,
            pixels,
        })
    }

    /// Image of the given shape with every pixel set to `value`.
    pub fn filled(channels: usize, height: usize, width: usize, value: f32) -> Self {
        Self {
            channels,
            height,
            width,
            pixels: vec![value; channels * height * width],
        }
    }

    /// `[channels, height, width]`.
    pub fn shape(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    /// Reorder into channel-last layout for display.
    pub fn to_hwc(&self) -> ImageArray {
        let (c, h, w) = (self.channels, self.height, self.width);
        let mut data = vec![0.0; c * h * w];
        for ch in 0..c {
            for y in 0..h {
                for x in 0..w {
                    data[(y * w + x) * c + ch] = self.pixels[(ch * h + y) * w + x];
                }
            }
        }
        ImageArray {
            height: h,
            width: w,
            channels: c,
            data,
        }
    }
}

/// Channel-last (`H × W × C`) image array, the layout visual sinks consume.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct ImageArray {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub data: Vec<f32>,
}

impl ImageArray {
    /// Pixel value at `(y, x, channel)`.
    pub fn get(&self, y: usize, x: usize, channel: usize) -> f32 {
        self.data[(y * self.width + x) * self.channels + channel]
    }
}

/// An image together with its class index.
#[derive(Clone, Debug)]
pub struct LabeledImage {
    pub image: ImageData,
    pub class: usize,
}

impl LabeledImage {
    pub fn new(image: ImageData, class: usize) -> Self {
        Self { image, class }
    }
}

/// Class → gallery image indices, in gallery order.
#[derive(Clone, Debug, Default)]
pub struct ClassIndex {
    by_class: BTreeMap<usize, Vec<usize>>,
}

impl ClassIndex {
    /// Index a gallery by class.
    pub fn build(images: &[LabeledImage]) -> Self {
        let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, img) in images.iter().enumerate() {
            by_class.entry(img.class).or_default().push(i);
        }
        Self { by_class }
    }

    /// Gallery indices belonging to `class` (empty if none).
    pub fn members(&self, class: usize) -> &[usize] {
        self.by_class.get(&class).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Classes with at least one gallery image, ascending.
    pub fn classes(&self) -> impl Iterator<Item = usize> + '_ {
        self.by_class.keys().copied()
    }
}

/// Labeled sketches plus a labeled image gallery.
#[derive(Clone, Debug)]
pub struct SketchImageDataset {
    class_names: Vec<String>,
    sketches: Vec<LabeledImage>,
    images: Vec<LabeledImage>,
    label_embeddings: Option<Vec<Vec<f32>>>,
    index: ClassIndex,
    populated: Vec<usize>,
}

impl SketchImageDataset {
    /// Build a dataset, validating that triplets can be formed.
    ///
    /// # Errors
    /// `InvalidDataset` if a class index is out of range, a sketch's class has
    /// no gallery image, or fewer than two classes have gallery images.
    pub fn new(
        class_names: Vec<String>,
        sketches: Vec<LabeledImage>,
        images: Vec<LabeledImage>,
    ) -> Result<Self, SbirError> {
        let n_classes = class_names.len();
        if let Some(bad) = sketches
            .iter()
            .chain(images.iter())
            .find(|s| s.class >= n_classes)
        {
            return Err(SbirError::InvalidDataset(format!(
                "class index {} out of range ({n_classes} classes)",
                bad.class
            )));
        }

        let index = ClassIndex::build(&images);
        let populated: Vec<usize> = index.classes().collect();
        if populated.len() < 2 {
            return Err(SbirError::InvalidDataset(format!(
                "need gallery images in at least two classes, found {}",
                populated.len()
            )));
        }
        if let Some(orphan) = sketches
            .iter()
            .find(|s| index.members(s.class).is_empty())
        {
            return Err(SbirError::InvalidDataset(format!(
                "class '{}' has sketches but no gallery images",
                class_names[orphan.class]
            )));
        }

        tracing::info!(
            classes = n_classes,
            sketches = sketches.len(),
            images = images.len(),
            "SketchImageDataset initialized"
        );

        Ok(Self {
            class_names,
            sketches,
            images,
            label_embeddings: None,
            index,
            populated,
        })
    }

    /// Attach one semantic label embedding per class.
    pub fn with_label_embeddings(mut self, embeddings: Vec<Vec<f32>>) -> Result<Self, SbirError> {
        if embeddings.len() != self.class_names.len() {
            return Err(SbirError::ShapeMismatch(format!(
                "{} label embeddings for {} classes",
                embeddings.len(),
                self.class_names.len()
            )));
        }
        if let Some(first) = embeddings.first() {
            if embeddings.iter().any(|e| e.len() != first.len()) {
                return Err(SbirError::ShapeMismatch(
                    "label embeddings differ in length".to_string(),
                ));
            }
        }
        self.label_embeddings = Some(embeddings);
        Ok(self)
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn sketches(&self) -> &[LabeledImage] {
        &self.sketches
    }

    pub fn images(&self) -> &[LabeledImage] {
        &self.images
    }

    /// The label-indexed dictionary: class → gallery image indices.
    pub fn class_index(&self) -> &ClassIndex {
        &self.index
    }

    pub fn label_embedding(&self, class: usize) -> Option<&[f32]> {
        self.label_embeddings
            .as_ref()
            .and_then(|e| e.get(class))
            .map(|e| e.as_slice())
    }
}

/// One training example: anchor sketch, positive and negative gallery images.
#[derive(Clone, Debug)]
pub struct TripletItem {
    pub anchor: ImageData,
    pub positive: ImageData,
    pub negative: ImageData,
    pub label_embedding: Option<Vec<f32>>,
    pub positive_class: usize,
    pub negative_class: usize,
}

/// Anything that can hand out triplets for a fixed set of anchors.
pub trait TripletSource: Send + Sync + 'static {
    /// Number of anchors; one epoch visits each anchor once.
    fn num_anchors(&self) -> usize;

    /// Draw a triplet for the given anchor.
    fn triplet(&self, anchor: usize, rng: &mut StdRng) -> TripletItem;
}

impl TripletSource for SketchImageDataset {
    fn num_anchors(&self) -> usize {
        self.sketches.len()
    }

    fn triplet(&self, anchor: usize, rng: &mut StdRng) -> TripletItem {
        let sketch = &self.sketches[anchor];
        let class = sketch.class;

        // Both picks are non-empty: `new` guarantees the sketch's class and at
        // least one other class are populated.
        let positives = self.index.members(class);
        let positive_idx = positives[rng.gen_range(0..positives.len())];

        let others: Vec<usize> = self
            .populated
            .iter()
            .copied()
            .filter(|&c| c != class)
            .collect();
        let negative_class = others[rng.gen_range(0..others.len())];
        let negatives = self.index.members(negative_class);
        let negative_idx = negatives[rng.gen_range(0..negatives.len())];

        TripletItem {
            anchor: sketch.image.clone(),
            positive: self.images[positive_idx].image.clone(),
            negative: self.images[negative_idx].image.clone(),
            label_embedding: self.label_embedding(class).map(|e| e.to_vec()),
            positive_class: class,
            negative_class,
        }
    }
}

/// A collated batch on a burn device: the six aligned training elements.
#[derive(Debug, Clone)]
pub struct TripletBatch<B: Backend> {
    /// Sketches, `(batch, C, H, W)`.
    pub anchors: Tensor<B, 4>,
    /// Same-class images, `(batch, C, H, W)`.
    pub positives: Tensor<B, 4>,
    /// Other-class images, `(batch, C, H, W)`.
    pub negatives: Tensor<B, 4>,
    /// Semantic label embeddings, `(batch, D)`, when every item carries one.
    pub label_embeddings: Option<Tensor<B, 2>>,
    /// Class index of each positive.
    pub positive_classes: Tensor<B, 1, Int>,
    /// Class index of each negative.
    pub negative_classes: Tensor<B, 1, Int>,
}

impl<B: Backend> TripletBatch<B> {
    pub fn len(&self) -> usize {
        self.anchors.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stack triplet items into tensors on `device`.
pub fn collate<B: Backend>(
    items: &[TripletItem],
    device: &B::Device,
) -> Result<TripletBatch<B>, SbirError> {
    if items.is_empty() {
        return Err(SbirError::EmptyInput("cannot collate an empty batch".to_string()));
    }
    let anchors: Vec<&ImageData> = items.iter().map(|t| &t.anchor).collect();
    let positives: Vec<&ImageData> = items.iter().map(|t| &t.positive).collect();
    let negatives: Vec<&ImageData> = items.iter().map(|t| &t.negative).collect();

    let label_embeddings = match items
        .iter()
        .map(|t| t.label_embedding.clone())
        .collect::<Option<Vec<_>>>()
    {
        Some(embs) => Some(embeddings_to_tensor::<B>(&embs, device)?),
        None => None,
    };

    let class_tensor = |classes: Vec<i64>| {
        let n = classes.len();
        Tensor::<B, 1, Int>::from_data(TensorData::new(classes, [n]), device)
    };

    Ok(TripletBatch {
        anchors: images_to_tensor::<B>(&anchors, device)?,
        positives: images_to_tensor::<B>(&positives, device)?,
        negatives: images_to_tensor::<B>(&negatives, device)?,
        label_embeddings,
        positive_classes: class_tensor(items.iter().map(|t| t.positive_class as i64).collect()),
        negative_classes: class_tensor(items.iter().map(|t| t.negative_class as i64).collect()),
    })
}

/// Epoch-wise batch loader with a background producer.
///
/// Each call to [`epoch`](TripletLoader::epoch) fixes the anchor order
/// (shuffled if configured), then a producer thread draws triplets and pushes
/// whole batches into a bounded queue of `prefetch` batches. The consumer
/// blocks while the queue is empty.
pub struct TripletLoader<S: TripletSource> {
    source: Arc<S>,
    batch_size: usize,
    shuffle: bool,
    prefetch: usize,
    rng: StdRng,
}

impl<S: TripletSource> TripletLoader<S> {
    /// Create a loader. `seed = None` seeds from OS entropy.
    ///
    /// # Errors
    /// `InvalidConfig` for a zero batch size, `EmptyInput` for a source without anchors.
    pub fn new(
        source: Arc<S>,
        batch_size: usize,
        shuffle: bool,
        seed: Option<u64>,
    ) -> Result<Self, SbirError> {
        if batch_size == 0 {
            return Err(SbirError::InvalidConfig("batch_size must be > 0".to_string()));
        }
        if source.num_anchors() == 0 {
            return Err(SbirError::EmptyInput("triplet source has no anchors".to_string()));
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            source,
            batch_size,
            shuffle,
            prefetch: 2,
            rng,
        })
    }

    /// Number of batches buffered ahead of the consumer (at least 1).
    pub fn with_prefetch(mut self, depth: usize) -> Self {
        self.prefetch = depth.max(1);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches per epoch; the last batch may be short.
    pub fn num_batches(&self) -> usize {
        self.source.num_anchors().div_ceil(self.batch_size)
    }

    /// Start producing one epoch of batches.
    pub fn epoch(&mut self) -> EpochBatches {
        let mut order: Vec<usize> = (0..self.source.num_anchors()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        let epoch_seed: u64 = self.rng.gen();
        let expected = self.num_batches();

        let (tx, rx) = bounded(self.prefetch);
        let source = Arc::clone(&self.source);
        let batch_size = self.batch_size;
        let handle = std::thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(epoch_seed);
            for chunk in order.chunks(batch_size) {
                let batch: Vec<TripletItem> =
                    chunk.iter().map(|&a| source.triplet(a, &mut rng)).collect();
                if tx.send(batch).is_err() {
                    // Consumer went away; nothing left to do.
                    return;
                }
            }
        });

        EpochBatches {
            rx,
            handle: Some(handle),
            expected,
            received: 0,
        }
    }
}

/// Iterator over one epoch's batches, fed by the producer thread.
pub struct EpochBatches {
    rx: Receiver<Vec<TripletItem>>,
    handle: Option<JoinHandle<()>>,
    expected: usize,
    received: usize,
}

impl EpochBatches {
    /// Batches this epoch will yield.
    pub fn expected(&self) -> usize {
        self.expected
    }
}

impl Iterator for EpochBatches {
    type Item = Result<Vec<TripletItem>, SbirError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.rx.recv() {
            Ok(batch) => {
                self.received += 1;
                Some(Ok(batch))
            }
            Err(_) => {
                let handle = self.handle.take()?;
                let panicked = handle.join().is_err();
                if panicked || self.received < self.expected {
                    Some(Err(SbirError::Loader(format!(
                        "producer stopped after {} of {} batches",
                        self.received, self.expected
                    ))))
                } else {
                    None
                }
            }
        }
    }
}
