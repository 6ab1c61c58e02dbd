//! File-backed metrics sink: scalars as JSON lines, images as PNG files.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use sbir::training::data::ImageArray;
use sbir::training::MetricsSink;
use sbir::SbirError;

pub const EVENTS_FILE: &str = "events.jsonl";
pub const IMAGES_DIR: &str = "images";

#[derive(Serialize)]
struct ScalarLine<'a> {
    name: &'a str,
    value: f64,
    step: u64,
}

/// Appends scalar events to `<dir>/events.jsonl` and writes image events to
/// `<dir>/images/<name>/step_<step>_<i>.png`.
pub struct JsonlSink {
    dir: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(EVENTS_FILE))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }
}

impl MetricsSink for JsonlSink {
    fn log_scalar(&mut self, name: &str, value: f64, step: u64) -> Result<(), SbirError> {
        serde_json::to_writer(&mut self.writer, &ScalarLine { name, value, step })?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn log_images(
        &mut self,
        name: &str,
        images: &[ImageArray],
        step: u64,
    ) -> Result<(), SbirError> {
        let dir = self.dir.join(IMAGES_DIR).join(slug(name));
        std::fs::create_dir_all(&dir)?;
        for (i, array) in images.iter().enumerate() {
            save_png(array, &dir.join(format!("step_{step:06}_{i}.png")))?;
        }
        Ok(())
    }
}

/// Metric names contain spaces; directory names should not.
fn slug(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// Convert a channel-last float array to 8-bit RGB, clamping to `[0, 1]`.
/// Single-channel arrays are replicated to gray.
pub fn to_rgb_image(array: &ImageArray) -> Result<image::RgbImage, SbirError> {
    if array.channels != 1 && array.channels != 3 {
        return Err(SbirError::ShapeMismatch(format!(
            "cannot render {} channels as RGB",
            array.channels
        )));
    }
    let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    let mut img = image::RgbImage::new(array.width as u32, array.height as u32);
    for (x, y, px) in img.enumerate_pixels_mut() {
        let (x, y) = (x as usize, y as usize);
        *px = if array.channels == 1 {
            let v = to_u8(array.get(y, x, 0));
            image::Rgb([v, v, v])
        } else {
            image::Rgb([
                to_u8(array.get(y, x, 0)),
                to_u8(array.get(y, x, 1)),
                to_u8(array.get(y, x, 2)),
            ])
        };
    }
    Ok(img)
}

pub fn save_png(array: &ImageArray, path: &Path) -> Result<(), SbirError> {
    to_rgb_image(array)?
        .save(path)
        .map_err(|e| SbirError::Io(std::io::Error::other(e)))
}
