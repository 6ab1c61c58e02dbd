//! The embedding-model contract used by training and retrieval.
//!
//! Training and evaluation only ever see an encoder through
//! [`EmbeddingModel`]: a batch of `(batch, channels, height, width)` images in,
//! a batch of `(batch, embedding_dim)` vectors out. The backbone behind it is
//! interchangeable.

use burn::prelude::*;

/// Maps a batch of images to a batch of fixed-size embedding vectors.
///
/// Implementations built from burn modules get train/eval mode switching for
/// free: the autodiff-backed module is the training-mode encoder (dropout
/// active), and `AutodiffModule::valid()` yields the inference-mode encoder.
pub trait EmbeddingModel<B: Backend> {
    /// Encode `images` of shape `(batch, channels, height, width)` into
    /// embeddings of shape `(batch, embedding_dim)`.
    fn encode(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    /// Dimensionality of the produced embeddings.
    fn embedding_dim(&self) -> usize;
}

/// Parameter-free encoder that flattens each image into its pixel vector.
///
/// Serves as a raw-pixel retrieval baseline and as a transparent encoder when
/// checking ranking metrics by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelEmbedder {
    dim: usize,
}

impl PixelEmbedder {
    /// Baseline for images of the given CHW shape.
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            dim: channels * height * width,
        }
    }
}

impl<B: Backend> EmbeddingModel<B> for PixelEmbedder {
    fn encode(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, ..] = images.dims();
        images.reshape([batch, self.dim])
    }

    fn embedding_dim(&self) -> usize {
        self.dim
    }
}
