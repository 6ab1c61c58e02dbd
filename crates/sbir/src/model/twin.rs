//! The sketch/image encoder pair trained as one parameter group.

use burn::prelude::*;

use crate::model::embedder::{ConvEmbedder, EmbedderConfig};

/// Two independently-weighted encoders owned side by side.
///
/// Deriving `Module` over both fields makes the pair's parameter set the
/// concatenation of the two encoders' parameters, so a single optimizer
/// updates both while they never share a weight.
#[derive(Module, Debug)]
pub struct SketchImageModel<B: Backend> {
    /// Encodes hand-drawn sketches (the anchor domain).
    pub sketch_encoder: ConvEmbedder<B>,
    /// Encodes photographs (positives, negatives and the gallery).
    pub image_encoder: ConvEmbedder<B>,
}

impl<B: Backend> SketchImageModel<B> {
    /// Build the pair from per-domain configurations.
    pub fn new(sketch: &EmbedderConfig, image: &EmbedderConfig, device: &B::Device) -> Self {
        Self {
            sketch_encoder: sketch.init(device),
            image_encoder: image.init(device),
        }
    }

    /// Build both encoders from one configuration (still independently initialized).
    pub fn from_config(config: &EmbedderConfig, device: &B::Device) -> Self {
        Self::new(config, config, device)
    }

    /// Embed a triplet batch: anchors through the sketch encoder, positives and
    /// negatives through the image encoder.
    pub fn forward_triplet(
        &self,
        anchors: Tensor<B, 4>,
        positives: Tensor<B, 4>,
        negatives: Tensor<B, 4>,
    ) -> (Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>) {
        (
            self.sketch_encoder.forward(anchors),
            self.image_encoder.forward(positives),
            self.image_encoder.forward(negatives),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;
    use burn::optim::GradientsParams;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn config() -> EmbedderConfig {
        EmbedderConfig::new()
            .with_channels(vec![4])
            .with_hidden_dim(8)
            .with_embedding_dim(4)
            .with_dropout(0.0)
    }

    #[test]
    fn test_param_count_is_sum_of_encoders() {
        let device = Default::default();
        let model = SketchImageModel::<TestBackend>::from_config(&config(), &device);
        assert_eq!(
            model.num_params(),
            model.sketch_encoder.num_params() + model.image_encoder.num_params()
        );
    }

    #[test]
    fn test_encoders_are_independent() {
        let device = Default::default();
        let model = SketchImageModel::<TestBackend>::from_config(&config(), &device);
        let input = Tensor::<TestBackend, 4>::random(
            [2, 3, 8, 8],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let s = model.sketch_encoder.forward(input.clone());
        let i = model.image_encoder.forward(input);
        let diff: f32 = (s - i).abs().sum().into_scalar().elem();
        assert!(diff > 1e-6, "encoders should not share weights");
    }

    #[test]
    fn test_triplet_forward_reaches_both_encoders() {
        let device = Default::default();
        let model = SketchImageModel::<TestAutodiffBackend>::from_config(&config(), &device);
        let batch = || {
            Tensor::<TestAutodiffBackend, 4>::random(
                [3, 3, 8, 8],
                Distribution::Normal(0.0, 1.0),
                &device,
            )
        };
        let (a, p, n) = model.forward_triplet(batch(), batch(), batch());
        assert_eq!(a.dims(), [3, 4]);

        let loss = (a.clone() - p).powf_scalar(2.0).sum() + (a - n).powf_scalar(2.0).sum();
        let grads = GradientsParams::from_grads(loss.backward(), &model);

        for (name, encoder) in [("sketch", &model.sketch_encoder), ("image", &model.image_encoder)] {
            let grad = grads
                .get::<NdArray<f32>, 4>(encoder.stages[0].weight.id)
                .unwrap_or_else(|| panic!("{name} encoder should receive a gradient"));
            let grad_sum: f32 = grad.abs().sum().into_scalar().elem();
            assert!(grad_sum > 0.0, "{name} encoder gradient is zero");
        }
    }
}
