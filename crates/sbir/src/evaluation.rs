//! Sketch → image retrieval evaluation.
//!
//! Every sketch and every gallery image is encoded once, the full
//! `(sketches, gallery)` similarity matrix is built with tensor ops, and each
//! row is ranked to score average precision against the sketch's class.
//! A few random sketches also get a top-k grid of what they retrieved.
//!
//! Similarity is negative Euclidean distance. Rankings sort by descending
//! similarity and break ties by ascending gallery index, so equal scores
//! always rank the same way.

use burn::prelude::*;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::model::bridge::{images_to_tensor, tensor_to_rows};
use crate::model::encoder::EmbeddingModel;
use crate::training::data::{ImageArray, ImageData, LabeledImage, SketchImageDataset};
use crate::SbirError;

/// Encode passes with at most this many batches run without a progress bar.
const PROGRESS_MIN_BATCHES: usize = 8;

/// Upper bound on the `(queries, gallery, dim)` difference block built per
/// similarity chunk.
const SIMILARITY_CHUNK_ELEMS: usize = 1 << 22;

/// Configuration for retrieval evaluation.
#[derive(Config, Debug)]
pub struct EvaluationConfig {
    /// Images per encoder forward pass.
    #[config(default = 64)]
    pub batch_size: usize,
    /// Retrieved images shown per visualized sketch (grid columns).
    #[config(default = 5)]
    pub top_k: usize,
    /// Number of sketches sampled for visualization.
    #[config(default = 4)]
    pub num_display: usize,
    /// Rank against only the first `n` gallery images of each class.
    /// `None` ranks against the full gallery.
    pub gallery_per_class: Option<usize>,
    /// Border between grid cells, in pixels.
    #[config(default = 2)]
    pub grid_padding: usize,
    /// Seed for choosing which sketches to visualize.
    pub seed: Option<u64>,
}

/// Result of one evaluation pass.
#[derive(Debug, Clone)]
pub struct EvaluationReport {
    /// Sampled sketches, channel-last.
    pub sketches: Vec<ImageArray>,
    /// One grid of top-k retrieved gallery images per sampled sketch.
    pub retrieved_grids: Vec<ImageArray>,
    pub mean_average_precision: f64,
    /// Average precision of every sketch, in dataset order.
    pub per_sketch_ap: Vec<f64>,
}

/// Encode `images` in batches of `batch_size`; returns `(n, embedding_dim)`.
///
/// Pass an inference-mode encoder (a `valid()` module on the inner backend)
/// so no autodiff graph is built.
pub fn encode_all<B: Backend, M: EmbeddingModel<B>>(
    model: &M,
    images: &[&ImageData],
    batch_size: usize,
    label: &str,
    device: &B::Device,
) -> Result<Tensor<B, 2>, SbirError> {
    if images.is_empty() {
        return Err(SbirError::EmptyInput(format!("no {label} to encode")));
    }
    if batch_size == 0 {
        return Err(SbirError::InvalidConfig(
            "evaluation batch_size must be > 0".to_string(),
        ));
    }

    let num_batches = images.len().div_ceil(batch_size);
    let pb = if num_batches > PROGRESS_MIN_BATCHES {
        let pb = ProgressBar::new(images.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        pb.set_message(format!("Encoding {label}"));
        pb
    } else {
        ProgressBar::hidden()
    };

    let mut chunks = Vec::with_capacity(num_batches);
    for batch in images.chunks(batch_size) {
        let tensor = images_to_tensor::<B>(batch, device)?;
        chunks.push(model.encode(tensor));
        pb.inc(batch.len() as u64);
    }
    pb.finish_and_clear();

    Ok(Tensor::cat(chunks, 0))
}

/// Negative Euclidean distance between every query row and every gallery
/// row, shape `(queries, gallery)`. Row `i` holds query `i`'s scores in
/// gallery order.
pub fn similarity_matrix<B: Backend>(
    queries: Tensor<B, 2>,
    gallery: Tensor<B, 2>,
) -> Result<Tensor<B, 2>, SbirError> {
    let [n_q, dim_q] = queries.dims();
    let [n_g, dim_g] = gallery.dims();
    if n_q == 0 || n_g == 0 {
        return Err(SbirError::EmptyInput(format!(
            "similarity of {n_q} queries against {n_g} gallery images"
        )));
    }
    if dim_q != dim_g {
        return Err(SbirError::ShapeMismatch(format!(
            "query embeddings have dim {dim_q}, gallery embeddings {dim_g}"
        )));
    }

    if dim_q == 0 {
        return Ok(Tensor::zeros([n_q, n_g], &queries.device()));
    }

    // Coordinate-wise differences, so an exact duplicate scores exactly 0.
    let chunk = (SIMILARITY_CHUNK_ELEMS / (n_g * dim_q)).max(1);
    let gallery = gallery.unsqueeze_dim::<3>(0); // (1, n_g, dim)
    let mut rows = Vec::with_capacity(n_q.div_ceil(chunk));
    for start in (0..n_q).step_by(chunk) {
        let end = (start + chunk).min(n_q);
        let block = queries.clone().slice([start..end, 0..dim_q]).unsqueeze_dim::<3>(1); // (c, 1, dim)
        let sq_dist = (block - gallery.clone())
            .powf_scalar(2.0)
            .sum_dim(2)
            .reshape([end - start, n_g]);
        rows.push(sq_dist.sqrt().neg());
    }
    Ok(Tensor::cat(rows, 0))
}

/// Gallery indices by descending similarity, ties by ascending index.
/// NaN scores rank last.
pub fn rank_gallery(similarities: &[f32]) -> Vec<usize> {
    let key = |i: usize| {
        let s = similarities[i];
        if s.is_nan() {
            f32::NEG_INFINITY
        } else if s == 0.0 {
            // -0.0 and 0.0 tie.
            0.0
        } else {
            s
        }
    };
    let mut order: Vec<usize> = (0..similarities.len()).collect();
    order.sort_by(|&a, &b| key(b).total_cmp(&key(a)).then(a.cmp(&b)));
    order
}

/// Average precision of a ranking: mean of precision@rank over the ranks
/// holding a relevant item. Zero when nothing is relevant.
pub fn average_precision(ranking: &[usize], is_relevant: impl Fn(usize) -> bool) -> f64 {
    let mut hits = 0usize;
    let mut precision_sum = 0.0;
    for (rank, &idx) in ranking.iter().enumerate() {
        if is_relevant(idx) {
            hits += 1;
            precision_sum += hits as f64 / (rank + 1) as f64;
        }
    }
    if hits == 0 {
        0.0
    } else {
        precision_sum / hits as f64
    }
}

/// Per-query average precision and their unweighted mean.
///
/// `similarities[i]` scores query `i` against the gallery; gallery item `j`
/// is relevant to query `i` when `gallery_classes[j] == query_classes[i]`.
///
/// # Errors
/// `EmptyInput` with no queries, `ShapeMismatch` for misaligned inputs,
/// `InvalidDataset` when a query's class has no gallery item.
pub fn mean_average_precision(
    similarities: &[Vec<f32>],
    query_classes: &[usize],
    gallery_classes: &[usize],
) -> Result<(f64, Vec<f64>), SbirError> {
    if similarities.is_empty() {
        return Err(SbirError::EmptyInput("mAP over zero queries".to_string()));
    }
    if similarities.len() != query_classes.len() {
        return Err(SbirError::ShapeMismatch(format!(
            "{} similarity rows for {} queries",
            similarities.len(),
            query_classes.len()
        )));
    }

    let mut per_query = Vec::with_capacity(similarities.len());
    for (i, (row, &class)) in similarities.iter().zip(query_classes).enumerate() {
        if row.len() != gallery_classes.len() {
            return Err(SbirError::ShapeMismatch(format!(
                "similarity row {i} has {} entries for a gallery of {}",
                row.len(),
                gallery_classes.len()
            )));
        }
        if !gallery_classes.contains(&class) {
            return Err(SbirError::InvalidDataset(format!(
                "query {i} has class {class} with no gallery images"
            )));
        }
        let ranking = rank_gallery(row);
        per_query.push(average_precision(&ranking, |j| gallery_classes[j] == class));
    }

    let map = per_query.iter().sum::<f64>() / per_query.len() as f64;
    Ok((map, per_query))
}

/// Tile same-shaped images into a grid with `nrow` images per row and
/// `padding` zero pixels around every cell (torchvision `make_grid` layout).
pub fn make_grid(images: &[ImageArray], nrow: usize, padding: usize) -> Result<ImageArray, SbirError> {
    let first = images
        .first()
        .ok_or_else(|| SbirError::EmptyInput("grid of zero images".to_string()))?;
    let (h, w, c) = (first.height, first.width, first.channels);
    if let Some(bad) = images
        .iter()
        .find(|i| (i.height, i.width, i.channels) != (h, w, c))
    {
        return Err(SbirError::ShapeMismatch(format!(
            "grid cell {}x{}x{} differs from {h}x{w}x{c}",
            bad.height, bad.width, bad.channels
        )));
    }
    if nrow == 0 {
        return Err(SbirError::InvalidConfig("grid nrow must be > 0".to_string()));
    }

    let cols = nrow.min(images.len());
    let rows = images.len().div_ceil(nrow);
    let (cell_h, cell_w) = (h + padding, w + padding);
    let height = rows * cell_h + padding;
    let width = cols * cell_w + padding;
    let mut data = vec![0.0f32; height * width * c];

    for (k, img) in images.iter().enumerate() {
        let top = (k / nrow) * cell_h + padding;
        let left = (k % nrow) * cell_w + padding;
        for y in 0..h {
            let src = y * w * c;
            let dst = ((top + y) * width + left) * c;
            data[dst..dst + w * c].copy_from_slice(&img.data[src..src + w * c]);
        }
    }

    Ok(ImageArray {
        height,
        width,
        channels: c,
        data,
    })
}

/// Pick `num_display` sketches uniformly without replacement and grid their
/// top-`k` retrievals. Returns `(sketches, grids)`.
///
/// With `num_display == 0` or `k == 0` nothing is computed and `rng` is left
/// untouched.
pub fn sample_visuals<R: RngCore + ?Sized>(
    rng: &mut R,
    similarities: &[Vec<f32>],
    sketches: &[&ImageData],
    gallery: &[&ImageData],
    num_display: usize,
    k: usize,
    padding: usize,
) -> Result<(Vec<ImageArray>, Vec<ImageArray>), SbirError> {
    if num_display == 0 || k == 0 {
        return Ok((Vec::new(), Vec::new()));
    }
    if sketches.is_empty() || gallery.is_empty() {
        return Err(SbirError::EmptyInput(
            "visualization needs sketches and gallery images".to_string(),
        ));
    }
    if similarities.len() != sketches.len() {
        return Err(SbirError::ShapeMismatch(format!(
            "{} similarity rows for {} sketches",
            similarities.len(),
            sketches.len()
        )));
    }

    let amount = num_display.min(sketches.len());
    let chosen = rand::seq::index::sample(rng, sketches.len(), amount);

    let mut shown = Vec::with_capacity(amount);
    let mut grids = Vec::with_capacity(amount);
    for i in chosen.iter() {
        let ranking = rank_gallery(&similarities[i]);
        let top: Vec<ImageArray> = ranking
            .iter()
            .take(k)
            .map(|&j| gallery[j].to_hwc())
            .collect();
        grids.push(make_grid(&top, k, padding)?);
        shown.push(sketches[i].to_hwc());
    }
    Ok((shown, grids))
}

/// Gallery indices kept for ranking: all of them, or the first `n` of each
/// class in gallery order.
fn select_gallery(dataset: &SketchImageDataset, per_class: Option<usize>) -> Vec<usize> {
    match per_class {
        None => (0..dataset.images().len()).collect(),
        Some(n) => {
            let index = dataset.class_index();
            let mut keep: Vec<usize> = index
                .classes()
                .flat_map(|c| index.members(c).iter().take(n).copied())
                .collect();
            keep.sort_unstable();
            keep
        }
    }
}

/// Run a full evaluation pass over `dataset`.
///
/// The visualization sample is drawn from `config.seed` (OS entropy if unset).
pub fn evaluate<B, S, I>(
    sketch_encoder: &S,
    image_encoder: &I,
    dataset: &SketchImageDataset,
    config: &EvaluationConfig,
    device: &B::Device,
) -> Result<EvaluationReport, SbirError>
where
    B: Backend,
    S: EmbeddingModel<B>,
    I: EmbeddingModel<B>,
{
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    evaluate_with_rng::<B, S, I, _>(sketch_encoder, image_encoder, dataset, config, &mut rng, device)
}

/// [`evaluate`] with a caller-supplied RNG for the visualization sample.
pub fn evaluate_with_rng<B, S, I, R>(
    sketch_encoder: &S,
    image_encoder: &I,
    dataset: &SketchImageDataset,
    config: &EvaluationConfig,
    rng: &mut R,
    device: &B::Device,
) -> Result<EvaluationReport, SbirError>
where
    B: Backend,
    S: EmbeddingModel<B>,
    I: EmbeddingModel<B>,
    R: RngCore + ?Sized,
{
    if config.gallery_per_class == Some(0) {
        return Err(SbirError::InvalidConfig(
            "gallery_per_class must be > 0 when set".to_string(),
        ));
    }
    let sketches: Vec<&LabeledImage> = dataset.sketches().iter().collect();
    if sketches.is_empty() {
        return Err(SbirError::EmptyInput("no sketches to evaluate".to_string()));
    }
    let kept = select_gallery(dataset, config.gallery_per_class);
    let gallery: Vec<&LabeledImage> = kept.iter().map(|&j| &dataset.images()[j]).collect();
    if gallery.is_empty() {
        return Err(SbirError::EmptyInput("gallery is empty".to_string()));
    }

    let sketch_images: Vec<&ImageData> = sketches.iter().map(|s| &s.image).collect();
    let gallery_images: Vec<&ImageData> = gallery.iter().map(|g| &g.image).collect();

    let sketch_emb = encode_all::<B, _>(sketch_encoder, &sketch_images, config.batch_size, "sketches", device)?;
    let gallery_emb = encode_all::<B, _>(image_encoder, &gallery_images, config.batch_size, "gallery", device)?;
    let similarities = tensor_to_rows(similarity_matrix(sketch_emb, gallery_emb)?)?;

    let query_classes: Vec<usize> = sketches.iter().map(|s| s.class).collect();
    let gallery_classes: Vec<usize> = gallery.iter().map(|g| g.class).collect();
    let (map, per_sketch_ap) = mean_average_precision(&similarities, &query_classes, &gallery_classes)?;

    let (shown, grids) = sample_visuals(
        rng,
        &similarities,
        &sketch_images,
        &gallery_images,
        config.num_display,
        config.top_k,
        config.grid_padding,
    )?;

    tracing::debug!(
        sketches = sketches.len(),
        gallery = gallery.len(),
        map,
        "Retrieval evaluation complete"
    );

    Ok(EvaluationReport {
        sketches: shown,
        retrieved_grids: grids,
        mean_average_precision: map,
        per_sketch_ap,
    })
}
