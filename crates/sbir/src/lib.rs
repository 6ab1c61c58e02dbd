//! Sketch-based image retrieval.
//!
//! Two independently-weighted embedding networks (one for sketches, one for
//! photographs) are trained jointly with a triplet margin objective so that a
//! sketch lands close to the images of its class in a shared metric space.
//! Retrieval quality is measured as mean average precision over a gallery.

pub mod error;
pub mod evaluation;
pub mod model;
pub mod training;

pub use error::SbirError;
