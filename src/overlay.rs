use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use image::{Luma, Rgb, RgbImage};
use imageproc::filter::gaussian_blur_f32;

use crate::config::OverlayConfig;
use crate::error::PipelineError;
use crate::saliency::{GrayF32, SaliencyMap, normalize_positive};

/// Highlight color for rendered overlays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayColor {
    Red,
    Green,
    Blue,
}

impl OverlayColor {
    pub fn rgb(&self) -> Rgb<u8> {
        match self {
            OverlayColor::Red => Rgb([255, 0, 0]),
            OverlayColor::Green => Rgb([0, 255, 0]),
            OverlayColor::Blue => Rgb([0, 0, 255]),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OverlayColor::Red => "red",
            OverlayColor::Green => "green",
            OverlayColor::Blue => "blue",
        }
    }
}

impl fmt::Display for OverlayColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OverlayColor {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "red" => Ok(OverlayColor::Red),
            "green" => Ok(OverlayColor::Green),
            "blue" => Ok(OverlayColor::Blue),
            other => Err(PipelineError::Config(format!(
                "unknown overlay color {other:?}, expected red, green or blue"
            ))),
        }
    }
}

/// Renders the saliency map onto the image. Pure: identical inputs give
/// identical output.
///
/// The steps are order-significant: threshold, grayscale dilation, Gaussian
/// blur, renormalize, then alpha composite in the highlight color.
pub fn render(
    map: &SaliencyMap,
    image: &RgbImage,
    color: OverlayColor,
    config: &OverlayConfig,
) -> Result<RgbImage, PipelineError> {
    let (width, height) = image.dimensions();
    if map.width() != width || map.height() != height {
        return Err(PipelineError::Inference {
            stage: "overlay",
            detail: format!(
                "saliency map {}x{} does not match image {width}x{height}",
                map.width(),
                map.height()
            ),
        });
    }
    let min_side = width.min(height);

    // Keep graded values, drop weak evidence.
    let cutoff = config.threshold;
    let alpha: Vec<f32> = map
        .values()
        .iter()
        .map(|v| if *v < cutoff { 0.0 } else { *v })
        .collect();

    let dilate_window = odd_window(min_side, config.dilation_frac, 3);
    let alpha = dilate_max(&alpha, width as usize, height as usize, dilate_window);

    let blur_window = odd_window(min_side, config.blur_frac, 3);
    let sigma = (blur_window as f32 / 6.0).max(0.5);
    let buffer = GrayF32::from_fn(width, height, |x, y| {
        Luma([alpha[(y * width + x) as usize]])
    });
    let blurred = gaussian_blur_f32(&buffer, sigma);

    let alpha = normalize_positive(blurred.into_raw());

    let highlight = color.rgb();
    let k1 = config.highlight_strength;
    let k2 = config.base_fade;
    let mut out = image.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let a = alpha[(y * width + x) as usize];
        if a <= 0.0 {
            continue;
        }
        for c in 0..3 {
            let blended = highlight.0[c] as f32 * a * k1 + pixel.0[c] as f32 * (1.0 - a * k2);
            pixel.0[c] = blended.round().clamp(0.0, 255.0) as u8;
        }
    }
    Ok(out)
}

/// Writes the overlay as `<stem>_overlay.png` under `dir`, creating the
/// directory when needed.
pub fn save(overlay: &RgbImage, source: &Path, dir: &Path) -> Result<PathBuf, PipelineError> {
    std::fs::create_dir_all(dir)?;
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    let path = dir.join(format!("{stem}_overlay.png"));
    overlay
        .save(&path)
        .map_err(|err| PipelineError::Io(std::io::Error::other(err)))?;
    log::info!("overlay written to {}", path.display());
    Ok(path)
}

/// Window side from a fraction of the short image side, odd, at least `min`.
fn odd_window(min_side: u32, frac: f32, min: usize) -> usize {
    let side = ((min_side as f32 * frac).round() as usize).max(min);
    if side % 2 == 0 { side + 1 } else { side }
}

/// Grayscale dilation with a square window: separable sliding-window
/// maximum over rows then columns.
fn dilate_max(values: &[f32], width: usize, height: usize, window: usize) -> Vec<f32> {
    let radius = window / 2;
    if radius == 0 {
        return values.to_vec();
    }

    let mut horizontal = vec![0.0f32; values.len()];
    for y in 0..height {
        let row = &values[y * width..(y + 1) * width];
        sliding_max_into(row, radius, &mut horizontal[y * width..(y + 1) * width]);
    }

    let mut out = vec![0.0f32; values.len()];
    let mut column = vec![0.0f32; height];
    let mut column_max = vec![0.0f32; height];
    for x in 0..width {
        for y in 0..height {
            column[y] = horizontal[y * width + x];
        }
        sliding_max_into(&column, radius, &mut column_max);
        for y in 0..height {
            out[y * width + x] = column_max[y];
        }
    }
    out
}

/// Maximum over a centered window of `2 * radius + 1` around each position,
/// clamped at the edges. Monotonic deque, O(len).
fn sliding_max_into(input: &[f32], radius: usize, output: &mut [f32]) {
    let len = input.len();
    if len == 0 {
        return;
    }
    let mut deque: VecDeque<usize> = VecDeque::new();
    for i in 0..(len + radius) {
        if i < len {
            while deque.back().is_some_and(|&back| input[back] <= input[i]) {
                deque.pop_back();
            }
            deque.push_back(i);
        }
        if i >= radius {
            let pos = i - radius;
            while deque.front().is_some_and(|&front| front + radius < pos) {
                deque.pop_front();
            }
            if let Some(&front) = deque.front() {
                output[pos] = input[front];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> OverlayConfig {
        OverlayConfig::default()
    }

    fn gradient_image(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn sliding_max_covers_centered_window() {
        let input = [1.0, 3.0, 2.0, 0.0, 5.0];
        let mut output = [0.0; 5];
        sliding_max_into(&input, 1, &mut output);
        assert_eq!(output, [3.0, 3.0, 3.0, 5.0, 5.0]);
    }

    #[test]
    fn sliding_max_with_zero_radius_is_identity() {
        let input = [4.0, 1.0, 2.0];
        let mut output = [0.0; 3];
        sliding_max_into(&input, 0, &mut output);
        assert_eq!(output, input);
    }

    #[test]
    fn sliding_max_window_larger_than_input_is_global_max() {
        let input = [0.2, 0.9, 0.1];
        let mut output = [0.0; 3];
        sliding_max_into(&input, 10, &mut output);
        assert_eq!(output, [0.9, 0.9, 0.9]);
    }

    #[test]
    fn dilation_spreads_an_isolated_peak() {
        let mut values = vec![0.0f32; 25];
        values[12] = 1.0; // center of a 5x5 grid
        let dilated = dilate_max(&values, 5, 5, 3);
        let ones = dilated.iter().filter(|v| **v == 1.0).count();
        assert_eq!(ones, 9);
        assert_eq!(dilated[0], 0.0);
        assert_eq!(dilated[12], 1.0);
        assert_eq!(dilated[6], 1.0); // one up, one left
    }

    #[test]
    fn window_sizing_is_odd_with_floor() {
        assert_eq!(odd_window(1000, 0.03, 3), 31);
        assert_eq!(odd_window(100, 0.03, 3), 3);
        assert_eq!(odd_window(10, 0.03, 3), 3);
        assert_eq!(odd_window(1000, 0.08, 3), 81);
    }

    #[test]
    fn zero_map_reproduces_the_image_exactly() {
        let image = gradient_image(16, 12);
        let map = SaliencyMap::new(16, 12, vec![0.0; 16 * 12]);
        let rendered = render(&map, &image, OverlayColor::Red, &test_config()).expect("render");
        assert_eq!(rendered.as_raw(), image.as_raw());
    }

    #[test]
    fn sub_threshold_map_leaves_the_image_untouched() {
        let image = gradient_image(8, 8);
        // Everything below the 0.25 cutoff is dropped before dilation, so
        // nothing survives to composite.
        let map = SaliencyMap::new(8, 8, vec![0.2; 64]);
        let rendered = render(&map, &image, OverlayColor::Blue, &test_config()).expect("render");
        assert_eq!(rendered.as_raw(), image.as_raw());
    }

    #[test]
    fn render_is_deterministic() {
        let image = gradient_image(20, 20);
        let values: Vec<f32> = (0..400).map(|i| (i % 5) as f32 / 4.0).collect();
        let map = SaliencyMap::new(20, 20, values);
        let first = render(&map, &image, OverlayColor::Green, &test_config()).expect("render");
        let second = render(&map, &image, OverlayColor::Green, &test_config()).expect("render");
        assert_eq!(first.as_raw(), second.as_raw());
    }

    #[test]
    fn render_preserves_dimensions_down_to_one_pixel() {
        let image = RgbImage::from_pixel(1, 1, Rgb([100, 150, 200]));
        let map = SaliencyMap::new(1, 1, vec![1.0]);
        let rendered = render(&map, &image, OverlayColor::Red, &test_config()).expect("render");
        assert_eq!(rendered.dimensions(), (1, 1));
        // Full-strength alpha: c = highlight * 0.7 + original * (1 - 0.4)
        let pixel = rendered.get_pixel(0, 0);
        assert_eq!(pixel.0, [239, 90, 120]);
    }

    #[test]
    fn blend_saturates_at_white() {
        let image = RgbImage::from_pixel(1, 1, Rgb([255, 255, 255]));
        let map = SaliencyMap::new(1, 1, vec![1.0]);
        let rendered = render(&map, &image, OverlayColor::Red, &test_config()).expect("render");
        assert_eq!(rendered.get_pixel(0, 0).0[0], 255);
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let image = gradient_image(3, 3);
        let map = SaliencyMap::new(2, 2, vec![0.0; 4]);
        let result = render(&map, &image, OverlayColor::Red, &test_config());
        assert!(matches!(
            result,
            Err(PipelineError::Inference { stage: "overlay", .. })
        ));
    }

    #[test]
    fn color_parsing_is_case_insensitive() {
        assert_eq!("Red".parse::<OverlayColor>().unwrap(), OverlayColor::Red);
        assert_eq!(" BLUE ".parse::<OverlayColor>().unwrap(), OverlayColor::Blue);
        assert!("magenta".parse::<OverlayColor>().is_err());
    }
}
