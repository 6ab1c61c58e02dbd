//! Embedding networks and the tensor bridge between plain image buffers and
//! burn tensors.

pub mod bridge;
pub mod embedder;
pub mod encoder;
pub mod twin;
