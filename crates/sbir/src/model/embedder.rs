use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::relu;

use crate::model::encoder::EmbeddingModel;

/// Configuration for the convolutional embedding network.
///
/// ```text
/// (batch, in_channels, H, W)
///   → [Conv3x3 stride 2 → ReLU] × len(channels)
///   → global average pool → (batch, channels.last)
///   → Linear(→hidden_dim) → ReLU → Dropout
///   → Linear(→embedding_dim)
///   → embedding: (batch, embedding_dim)
/// ```
#[derive(Config, Debug)]
pub struct EmbedderConfig {
    /// Number of input image channels.
    #[config(default = 3)]
    pub in_channels: usize,
    /// Output channels of each stride-2 convolution stage.
    #[config(default = "vec![32, 64, 128]")]
    pub channels: Vec<usize>,
    /// Width of the hidden projection layer.
    #[config(default = 512)]
    pub hidden_dim: usize,
    /// Size of the shared embedding space.
    #[config(default = 300)]
    pub embedding_dim: usize,
    /// Dropout applied before the output projection (training mode only).
    #[config(default = 0.5)]
    pub dropout: f64,
}

/// Convolutional trunk with a pooled projection head.
///
/// One instance encodes sketches, another encodes photographs; the two never
/// share weights.
#[derive(Module, Debug)]
pub struct ConvEmbedder<B: Backend> {
    pub(crate) stages: Vec<Conv2d<B>>,
    pool: AdaptiveAvgPool2d,
    hidden: Linear<B>,
    dropout: Dropout,
    output: Linear<B>,
    embedding_dim: usize,
}

impl EmbedderConfig {
    /// Initialize a ConvEmbedder with freshly sampled weights.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvEmbedder<B> {
        let mut stages = Vec::with_capacity(self.channels.len());
        let mut c_in = self.in_channels;
        for &c_out in &self.channels {
            stages.push(
                Conv2dConfig::new([c_in, c_out], [3, 3])
                    .with_stride([2, 2])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device),
            );
            c_in = c_out;
        }

        ConvEmbedder {
            stages,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            hidden: LinearConfig::new(c_in, self.hidden_dim).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            output: LinearConfig::new(self.hidden_dim, self.embedding_dim).init(device),
            embedding_dim: self.embedding_dim,
        }
    }
}

impl<B: Backend> ConvEmbedder<B> {
    /// Forward pass.
    ///
    /// Input shape: `(batch, in_channels, H, W)`
    /// Output shape: `(batch, embedding_dim)`
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        for stage in &self.stages {
            x = relu(stage.forward(x));
        }

        let [batch, channels, _, _] = x.dims();
        let pooled = self.pool.forward(x).reshape([batch, channels]);

        let h = relu(self.hidden.forward(pooled));
        let h = self.dropout.forward(h);
        self.output.forward(h)
    }
}

impl<B: Backend> EmbeddingModel<B> for ConvEmbedder<B> {
    fn encode(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(images)
    }

    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }
}
