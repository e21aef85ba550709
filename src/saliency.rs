use candle_core::{Tensor, Var};
use image::{ImageBuffer, Luma, imageops::FilterType};

use crate::classifier::ClassLabel;
use crate::clip::DualEncoder;
use crate::error::PipelineError;

pub type GrayF32 = ImageBuffer<Luma<f32>, Vec<f32>>;

const STAGE: &str = "saliency";

/// Single-channel evidence raster, row-major, values in [0, 1]. All zero
/// when the selected class had no positive pixel contribution.
#[derive(Debug, Clone)]
pub struct SaliencyMap {
    width: u32,
    height: u32,
    values: Vec<f32>,
}

impl SaliencyMap {
    pub fn new(width: u32, height: u32, values: Vec<f32>) -> Self {
        assert_eq!(values.len(), (width as usize) * (height as usize));
        Self {
            width,
            height,
            values,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.values[(y * self.width + x) as usize]
    }

    /// Bilinear resize. Values stay within [0, 1] because the kernel is a
    /// convex combination of inputs.
    pub fn resize(&self, width: u32, height: u32) -> SaliencyMap {
        if width == self.width && height == self.height {
            return self.clone();
        }
        let buffer = GrayF32::from_fn(self.width, self.height, |x, y| Luma([self.get(x, y)]));
        let resized = image::imageops::resize(&buffer, width, height, FilterType::Triangle);
        SaliencyMap {
            width,
            height,
            values: resized.into_raw(),
        }
    }
}

/// Computes a gradient saliency map for the selected class and resizes it
/// to the source image resolution.
///
/// The pixel tensor is wrapped in a fresh `Var` so the autodiff graph and
/// its gradients live only for this call; nothing carries over between
/// invocations.
pub fn extract(
    encoder: &dyn DualEncoder,
    pixel_values: &Tensor,
    class_text_features: &Tensor,
    label: ClassLabel,
    target_width: u32,
    target_height: u32,
) -> Result<SaliencyMap, PipelineError> {
    let pixels =
        Var::from_tensor(pixel_values).map_err(|err| PipelineError::inference(STAGE, err))?;
    let image_features = encoder.encode_image(&pixels)?;

    let rows = class_score_gradient(&pixels, &image_features, class_text_features, label)
        .map_err(|err| PipelineError::inference(STAGE, err))?;

    let height = rows.len() as u32;
    let width = rows.first().map(|r| r.len()).unwrap_or(0) as u32;
    let mut values = Vec::with_capacity((width * height) as usize);
    for row in rows {
        values.extend(row);
    }

    let native = SaliencyMap::new(width, height, normalize_positive(values));
    log::debug!(
        "saliency map {}x{} resized to {target_width}x{target_height}",
        native.width(),
        native.height()
    );
    Ok(native.resize(target_width, target_height))
}

/// Backpropagates the image-embedding dot text-embedding score for the
/// selected class and collapses the pixel gradient over channels.
fn class_score_gradient(
    pixels: &Var,
    image_features: &Tensor,
    class_text_features: &Tensor,
    label: ClassLabel,
) -> candle_core::Result<Vec<Vec<f32>>> {
    let target = class_text_features.narrow(0, label.canonical_index(), 1)?;
    let score = image_features.matmul(&target.t()?)?.squeeze(0)?.squeeze(0)?;
    let grads = score.backward()?;
    let grad = match grads.get(pixels) {
        Some(grad) => grad,
        None => candle_core::bail!("no gradient reached the input pixels"),
    };
    // (1, 3, h, w) -> signed channel mean -> (h, w)
    grad.squeeze(0)?.mean(0)?.to_vec2::<f32>()
}

/// Clamps negatives (and non-finite values) to zero, then scales so the
/// peak is exactly 1. A map with no positive evidence stays all zero.
pub(crate) fn normalize_positive(mut values: Vec<f32>) -> Vec<f32> {
    for v in values.iter_mut() {
        if !v.is_finite() || *v < 0.0 {
            *v = 0.0;
        }
    }
    let max = values.iter().fold(0.0f32, |acc, v| acc.max(*v));
    if max > 0.0 {
        for v in values.iter_mut() {
            *v /= max;
        }
    }
    values
}
