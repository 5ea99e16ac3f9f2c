use image::{imageops, GrayImage, ImageBuffer, ImageReader, Luma};
use petcam_common::config::MotionConfig;
use petcam_common::types::Rect;
use std::io::Cursor;
use tracing::warn;

/// Per-frame detection parameters, taken from the `[motion]` config section.
#[derive(Debug, Clone, Copy)]
pub struct Tuning {
    pub blur_sigma: f32,
    pub model_weight: f32,
    pub diff_threshold: u8,
    pub min_area: u32,
}

impl From<&MotionConfig> for Tuning {
    fn from(config: &MotionConfig) -> Self {
        Self {
            blur_sigma: config.blur_sigma,
            model_weight: config.model_weight,
            diff_threshold: config.diff_threshold,
            min_area: config.min_area,
        }
    }
}

/// Floating-point accumulator holding the "empty scene" the detector compares
/// incoming frames against.
pub struct BackgroundModel {
    acc: ImageBuffer<Luma<f32>, Vec<f32>>,
}

impl BackgroundModel {
    fn from_initial(img: &GrayImage) -> Self {
        let acc = ImageBuffer::from_fn(img.width(), img.height(), |x, y| {
            Luma([f32::from(img.get_pixel(x, y).0[0])])
        });
        Self { acc }
    }

    /// Blend `img` into the running average: acc = (1 - w) * acc + w * img.
    fn accumulate(&mut self, img: &GrayImage, weight: f32) {
        for (acc, px) in self.acc.pixels_mut().zip(img.pixels()) {
            acc.0[0] = (1.0 - weight) * acc.0[0] + weight * f32::from(px.0[0]);
        }
    }

    /// The model rounded back to 8-bit for differencing.
    fn rounded(&self) -> GrayImage {
        GrayImage::from_fn(self.acc.width(), self.acc.height(), |x, y| {
            Luma([self.acc.get_pixel(x, y).0[0].round().clamp(0.0, 255.0) as u8])
        })
    }

    fn dimensions(&self) -> (u32, u32) {
        self.acc.dimensions()
    }
}

/// Decode a JPEG and reduce it to the single-channel form used for
/// differencing: grayscale, Gaussian-blurred to suppress sensor noise.
pub fn simplify(jpeg: &[u8], blur_sigma: f32) -> Result<GrayImage, VisionError> {
    let decoded = ImageReader::new(Cursor::new(jpeg))
        .with_guessed_format()
        .map_err(VisionError::Header)?
        .decode()
        .map_err(VisionError::Decode)?;
    let gray = decoded.to_luma8();
    if blur_sigma > 0.0 {
        Ok(imageops::blur(&gray, blur_sigma))
    } else {
        Ok(gray)
    }
}

/// Run one frame through the detection pipeline, updating the model in place.
/// The first frame initializes the model and reports no motion.
pub fn process(
    model: &mut Option<BackgroundModel>,
    jpeg: &[u8],
    tuning: &Tuning,
) -> Result<Vec<Rect>, VisionError> {
    let img = simplify(jpeg, tuning.blur_sigma)?;
    Ok(track(model, &img, tuning))
}

/// Detection over an already-simplified frame: blend into the model, diff,
/// binarize, dilate twice, then box the surviving foreground regions.
fn track(model: &mut Option<BackgroundModel>, img: &GrayImage, tuning: &Tuning) -> Vec<Rect> {
    match model {
        Some(background) if background.dimensions() == img.dimensions() => {
            background.accumulate(img, tuning.model_weight);
            let (width, height) = img.dimensions();
            let mut mask = foreground_mask(img, &background.rounded(), tuning.diff_threshold);
            for _ in 0..2 {
                mask = dilate(&mask, width, height);
            }
            bounding_boxes(&mask, width, height, tuning.min_area)
        }
        state => {
            if state.is_some() {
                warn!("frame dimensions changed, resetting background model");
            }
            *state = Some(BackgroundModel::from_initial(img));
            Vec::new()
        }
    }
}

/// Per-pixel |img - background| >= threshold.
fn foreground_mask(img: &GrayImage, background: &GrayImage, threshold: u8) -> Vec<bool> {
    img.pixels()
        .zip(background.pixels())
        .map(|(a, b)| a.0[0].abs_diff(b.0[0]) >= threshold)
        .collect()
}

/// One pass of 3x3 morphological dilation over a binary mask.
fn dilate(mask: &[bool], width: u32, height: u32) -> Vec<bool> {
    let (w, h) = (width as usize, height as usize);
    let mut out = vec![false; mask.len()];
    for y in 0..h {
        for x in 0..w {
            if !mask[y * w + x] {
                continue;
            }
            for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                    out[ny * w + nx] = true;
                }
            }
        }
    }
    out
}

/// Bounding box of every 8-connected foreground region with at least
/// `min_area` pixels, in scan order.
fn bounding_boxes(mask: &[bool], width: u32, height: u32, min_area: u32) -> Vec<Rect> {
    let (w, h) = (width as usize, height as usize);
    let mut visited = vec![false; mask.len()];
    let mut boxes = Vec::new();
    let mut stack = Vec::new();

    for start in 0..mask.len() {
        if !mask[start] || visited[start] {
            continue;
        }
        visited[start] = true;
        stack.push(start);

        let (mut min_x, mut max_x) = (start % w, start % w);
        let (mut min_y, mut max_y) = (start / w, start / w);
        let mut area: u32 = 0;

        while let Some(idx) = stack.pop() {
            area += 1;
            let (x, y) = (idx % w, idx / w);
            min_x = min_x.min(x);
            max_x = max_x.max(x);
            min_y = min_y.min(y);
            max_y = max_y.max(y);

            for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                    let neighbor = ny * w + nx;
                    if mask[neighbor] && !visited[neighbor] {
                        visited[neighbor] = true;
                        stack.push(neighbor);
                    }
                }
            }
        }

        if area >= min_area {
            boxes.push(Rect {
                x: min_x as u32,
                y: min_y as u32,
                w: (max_x - min_x + 1) as u32,
                h: (max_y - min_y + 1) as u32,
            });
        }
    }

    boxes
}

#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("failed to read frame header: {0}")]
    Header(std::io::Error),
    #[error("failed to decode frame: {0}")]
    Decode(image::ImageError),
}
