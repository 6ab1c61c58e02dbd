//! Tensor bridge: conversions between plain `f32` buffers and burn tensors.
//!
//! The data pipeline and the evaluator work with `Vec<f32>` image buffers and
//! embedding rows; the networks need `Tensor<B, 4>` / `Tensor<B, 2>`.

use burn::prelude::*;
use burn::tensor::TensorData;

use crate::training::data::ImageData;
use crate::SbirError;

/// Stack a batch of CHW images into a `(batch, channels, height, width)` tensor.
///
/// All images must share the same shape.
pub fn images_to_tensor<B: Backend>(
    images: &[&ImageData],
    device: &B::Device,
) -> Result<Tensor<B, 4>, SbirError> {
    let first = images
        .first()
        .ok_or_else(|| SbirError::EmptyInput("image batch has no images".to_string()))?;
    let shape = first.shape();
    for (i, img) in images.iter().enumerate() {
        if img.shape() != shape {
            return Err(SbirError::ShapeMismatch(format!(
                "image {i} has shape {:?}, expected {shape:?}",
                img.shape()
            )));
        }
    }

    let [c, h, w] = shape;
    let mut flat = Vec::with_capacity(images.len() * c * h * w);
    for img in images {
        flat.extend_from_slice(img.pixels());
    }
    Ok(Tensor::from_data(
        TensorData::new(flat, [images.len(), c, h, w]),
        device,
    ))
}

/// Convert a batch of f32 embeddings to a burn 2D tensor.
///
/// # Errors
/// `EmptyInput` if `embeddings` is empty, `ShapeMismatch` if rows differ in length.
pub fn embeddings_to_tensor<B: Backend>(
    embeddings: &[Vec<f32>],
    device: &B::Device,
) -> Result<Tensor<B, 2>, SbirError> {
    let dim = embeddings
        .first()
        .map(|e| e.len())
        .ok_or_else(|| SbirError::EmptyInput("no embeddings".to_string()))?;
    for (i, emb) in embeddings.iter().enumerate() {
        if emb.len() != dim {
            return Err(SbirError::ShapeMismatch(format!(
                "embedding {i} has length {}, expected {dim}",
                emb.len()
            )));
        }
    }

    let flat: Vec<f32> = embeddings.iter().flat_map(|v| v.iter().copied()).collect();
    Ok(Tensor::from_data(
        TensorData::new(flat, [embeddings.len(), dim]),
        device,
    ))
}

/// Split a `(rows, dim)` tensor into one `Vec<f32>` per row.
pub fn tensor_to_rows<B: Backend>(tensor: Tensor<B, 2>) -> Result<Vec<Vec<f32>>, SbirError> {
    let [rows, dim] = tensor.dims();
    let flat = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| SbirError::ShapeMismatch(format!("cannot read tensor data: {e:?}")))?;
    if dim == 0 {
        return Ok(vec![Vec::new(); rows]);
    }
    Ok(flat.chunks(dim).map(|c| c.to_vec()).collect())
}

/// Extract a single f64 scalar from a one-element tensor.
pub fn tensor_to_f64<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}
