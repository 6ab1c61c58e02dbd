//! Triplet margin objective over (anchor, positive, negative) embeddings.
//!
//! Generic over `B: Backend`; gradients flow to all three inputs.

use burn::prelude::*;

use crate::SbirError;

/// Configuration for [`TripletMarginLoss`].
#[derive(Config, Debug)]
pub struct TripletMarginLossConfig {
    /// Required separation between anchor-negative and anchor-positive distance.
    #[config(default = 1.0)]
    pub margin: f64,
    /// Added to each coordinate difference before the norm, keeping the
    /// gradient finite when two embeddings coincide.
    #[config(default = 1e-6)]
    pub eps: f64,
}

impl TripletMarginLossConfig {
    pub fn init(&self) -> TripletMarginLoss {
        TripletMarginLoss {
            margin: self.margin,
            eps: self.eps,
        }
    }
}

/// `mean_i max(0, margin + d(a_i, p_i) - d(a_i, n_i))` with Euclidean `d`.
///
/// When anchor, positive and negative coincide the two distances are equal and
/// the triplet contributes exactly `margin`.
#[derive(Clone, Debug)]
pub struct TripletMarginLoss {
    margin: f64,
    eps: f64,
}

impl TripletMarginLoss {
    pub fn margin(&self) -> f64 {
        self.margin
    }

    /// Scalar loss of shape `(1,)`, averaged over the batch.
    ///
    /// # Arguments
    /// - `anchor`, `positive`, `negative`: shape `(batch, dim)`, all equal
    ///
    /// # Errors
    /// `EmptyInput` for a zero-sized batch, `ShapeMismatch` if shapes differ.
    pub fn forward<B: Backend>(
        &self,
        anchor: Tensor<B, 2>,
        positive: Tensor<B, 2>,
        negative: Tensor<B, 2>,
    ) -> Result<Tensor<B, 1>, SbirError> {
        Ok(self.per_triplet(anchor, positive, negative)?.mean())
    }

    /// Unreduced hinge values, shape `(batch,)`.
    pub fn per_triplet<B: Backend>(
        &self,
        anchor: Tensor<B, 2>,
        positive: Tensor<B, 2>,
        negative: Tensor<B, 2>,
    ) -> Result<Tensor<B, 1>, SbirError> {
        let shape = anchor.dims();
        if positive.dims() != shape || negative.dims() != shape {
            return Err(SbirError::ShapeMismatch(format!(
                "triplet shapes differ: anchor {shape:?}, positive {:?}, negative {:?}",
                positive.dims(),
                negative.dims()
            )));
        }
        if shape[0] == 0 {
            return Err(SbirError::EmptyInput("triplet loss on an empty batch".to_string()));
        }

        let d_pos = pairwise_distance(anchor.clone(), positive, self.eps);
        let d_neg = pairwise_distance(anchor, negative, self.eps);
        Ok((d_pos - d_neg).add_scalar(self.margin).clamp_min(0.0))
    }
}

/// Row-wise `||x - y + eps||_2`, shape `(batch,)`.
pub fn pairwise_distance<B: Backend>(x: Tensor<B, 2>, y: Tensor<B, 2>, eps: f64) -> Tensor<B, 1> {
    (x - y)
        .add_scalar(eps)
        .powf_scalar(2.0)
        .sum_dim(1)
        .sqrt()
        .squeeze::<1>(1)
}
