//! Image-folder dataset loading.
//!
//! Layout:
//!
//! ```text
//! <data_dir>/sketches/<class>/*.png|jpg|jpeg
//! <data_dir>/images/<class>/*.png|jpg|jpeg
//! ```
//!
//! Class names are the sorted union of subdirectory names under both roots;
//! class indices follow that order.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use image::imageops::FilterType;

use sbir::training::data::{ImageData, LabeledImage};
use sbir::training::SketchImageDataset;

pub const SKETCH_DIR: &str = "sketches";
pub const IMAGE_DIR: &str = "images";

const EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Load `data_dir` into a [`SketchImageDataset`], resizing every image to
/// `image_size x image_size` RGB.
pub fn load_image_folder(data_dir: &Path, image_size: u32) -> anyhow::Result<SketchImageDataset> {
    if image_size == 0 {
        anyhow::bail!("image_size must be > 0");
    }
    let sketch_root = data_dir.join(SKETCH_DIR);
    let image_root = data_dir.join(IMAGE_DIR);
    for root in [&sketch_root, &image_root] {
        if !root.is_dir() {
            anyhow::bail!("expected directory {}", root.display());
        }
    }

    let mut names = BTreeSet::new();
    names.extend(class_dirs(&sketch_root)?);
    names.extend(class_dirs(&image_root)?);
    let class_names: Vec<String> = names.into_iter().collect();

    let mut sketches = Vec::new();
    let mut images = Vec::new();
    for (class, name) in class_names.iter().enumerate() {
        for path in image_files(&sketch_root.join(name))? {
            sketches.push(LabeledImage::new(load_image(&path, image_size)?, class));
        }
        for path in image_files(&image_root.join(name))? {
            images.push(LabeledImage::new(load_image(&path, image_size)?, class));
        }
    }

    tracing::info!(
        dir = %data_dir.display(),
        classes = class_names.len(),
        sketches = sketches.len(),
        images = images.len(),
        image_size,
        "Loaded image folder"
    );

    SketchImageDataset::new(class_names, sketches, images)
        .with_context(|| format!("invalid dataset at {}", data_dir.display()))
}

/// Read one image as CHW RGB in `[0, 1]`.
pub fn load_image(path: &Path, image_size: u32) -> anyhow::Result<ImageData> {
    let img = image::open(path)
        .map_err(|e| anyhow!("failed to open image {:?}: {e}", path))?
        .resize_exact(image_size, image_size, FilterType::Triangle)
        .to_rgb8();
    let (w, h) = img.dimensions();
    let (w, h) = (w as usize, h as usize);

    let mut pixels = vec![0.0f32; 3 * h * w];
    for (x, y, p) in img.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            pixels[(c * h + y) * w + x] = p[c] as f32 / 255.0;
        }
    }
    Ok(ImageData::new(3, h, w, pixels)?)
}

fn class_dirs(root: &Path) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(root).with_context(|| format!("reading {}", root.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            out.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(out)
}

/// Supported image files in `dir`, sorted. A missing directory is empty.
fn image_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let supported = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if supported && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
