//! Pixel statistics tuned for bright, clean cartoon art rather than
//! photorealism: saturated colors, sparse deliberate edges and a varied
//! palette score well.

use image::{DynamicImage, GenericImageView, GrayImage, RgbImage};

use super::engine::{MetricImages, QualityMetric};
use crate::error::MetricError;

/// Long edge images are reduced to before computing statistics.
const ANALYSIS_EDGE_PX: u32 = 512;

fn analysis_view(image: &DynamicImage) -> DynamicImage {
    let (width, height) = image.dimensions();
    if width.max(height) > ANALYSIS_EDGE_PX {
        image.thumbnail(ANALYSIS_EDGE_PX, ANALYSIS_EDGE_PX)
    } else {
        image.clone()
    }
}

fn ensure_non_empty(name: &str, image: &DynamicImage) -> Result<(), MetricError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(MetricError::unavailable(name, "empty image"));
    }
    Ok(())
}

/// HSV saturation on a 0..=255 scale.
fn saturation(pixel: [u8; 3]) -> f64 {
    let max = pixel.iter().copied().max().unwrap_or(0) as f64;
    let min = pixel.iter().copied().min().unwrap_or(0) as f64;
    if max == 0.0 {
        0.0
    } else {
        (max - min) / max * 255.0
    }
}

/// 60% normalized mean saturation plus 40% share of strongly saturated pixels.
pub struct ColorVibrancy;

impl QualityMetric for ColorVibrancy {
    fn name(&self) -> &str {
        "color_vibrancy"
    }

    fn compute(&self, images: &MetricImages<'_>) -> Result<f64, MetricError> {
        ensure_non_empty(self.name(), images.candidate)?;
        let rgb: RgbImage = analysis_view(images.candidate).to_rgb8();

        let total = rgb.width() as f64 * rgb.height() as f64;
        let (sum, vivid) = rgb.pixels().fold((0.0, 0usize), |(sum, vivid), pixel| {
            let s = saturation(pixel.0);
            (sum + s, vivid + usize::from(s > 80.0))
        });

        let mean_saturation = sum / total;
        let vivid_ratio = vivid as f64 / total * 100.0;
        let score = (mean_saturation / 160.0 * 100.0) * 0.6 + vivid_ratio * 0.4;
        Ok(score.clamp(0.0, 100.0))
    }
}

/// Edge density with a 5-18% sweet spot: fewer edges reads as featureless,
/// more reads as photographic noise.
pub struct EdgeCleanliness {
    gradient_threshold: u32,
}

impl EdgeCleanliness {
    pub fn new() -> Self {
        Self {
            gradient_threshold: 150,
        }
    }
}

impl Default for EdgeCleanliness {
    fn default() -> Self {
        Self::new()
    }
}

fn edge_density(gray: &GrayImage, threshold: u32) -> f64 {
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let at = |x: u32, y: u32| gray.get_pixel(x, y).0[0] as i32;
    let mut edges = 0usize;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let gx = (at(x + 1, y - 1) + 2 * at(x + 1, y) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2 * at(x - 1, y) + at(x - 1, y + 1));
            let gy = (at(x - 1, y + 1) + 2 * at(x, y + 1) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2 * at(x, y - 1) + at(x + 1, y - 1));
            if gx.unsigned_abs() + gy.unsigned_abs() > threshold {
                edges += 1;
            }
        }
    }

    edges as f64 / ((width - 2) as f64 * (height - 2) as f64) * 100.0
}

pub(crate) fn cleanliness_from_density(density: f64) -> f64 {
    let score = if (5.0..=18.0).contains(&density) {
        100.0
    } else if density < 3.0 {
        density / 3.0 * 60.0
    } else if density < 5.0 {
        60.0 + (density - 3.0) / 2.0 * 40.0
    } else {
        100.0 - (density - 18.0) * 5.0
    };
    score.clamp(0.0, 100.0)
}

impl QualityMetric for EdgeCleanliness {
    fn name(&self) -> &str {
        "edge_cleanliness"
    }

    fn compute(&self, images: &MetricImages<'_>) -> Result<f64, MetricError> {
        ensure_non_empty(self.name(), images.candidate)?;
        let gray = analysis_view(images.candidate).to_luma8();
        Ok(cleanliness_from_density(edge_density(
            &gray,
            self.gradient_threshold,
        )))
    }
}

/// Mean per-channel histogram entropy against a 7.5 bit ceiling.
pub struct ColorDiversity;

impl QualityMetric for ColorDiversity {
    fn name(&self) -> &str {
        "color_diversity"
    }

    fn compute(&self, images: &MetricImages<'_>) -> Result<f64, MetricError> {
        ensure_non_empty(self.name(), images.candidate)?;
        let rgb = analysis_view(images.candidate).to_rgb8();

        let mut histograms = [[0u64; 256]; 3];
        for pixel in rgb.pixels() {
            for (channel, value) in pixel.0.iter().enumerate() {
                histograms[channel][*value as usize] += 1;
            }
        }

        let total = rgb.width() as f64 * rgb.height() as f64;
        let mean_entropy = histograms
            .iter()
            .map(|histogram| {
                histogram
                    .iter()
                    .filter(|count| **count > 0)
                    .map(|count| {
                        let p = *count as f64 / total;
                        -p * p.log2()
                    })
                    .sum::<f64>()
            })
            .sum::<f64>()
            / 3.0;

        Ok((mean_entropy / 7.5 * 100.0).clamp(0.0, 100.0))
    }
}

/// Variance of the 4-neighbour Laplacian; 300 and above counts as fully sharp.
pub struct Sharpness;

fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let at = |x: u32, y: u32| gray.get_pixel(x, y).0[0] as f64;
    let mut responses = Vec::with_capacity(((width - 2) * (height - 2)) as usize);
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            responses.push(
                at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * at(x, y),
            );
        }
    }
    variance(&responses)
}

fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
}

impl QualityMetric for Sharpness {
    fn name(&self) -> &str {
        "sharpness"
    }

    fn compute(&self, images: &MetricImages<'_>) -> Result<f64, MetricError> {
        ensure_non_empty(self.name(), images.candidate)?;
        let gray = analysis_view(images.candidate).to_luma8();
        Ok((laplacian_variance(&gray) / 300.0 * 100.0).clamp(0.0, 100.0))
    }
}

/// RMS contrast of the grayscale image against a 70 level ceiling.
pub struct Contrast;

impl QualityMetric for Contrast {
    fn name(&self) -> &str {
        "contrast"
    }

    fn compute(&self, images: &MetricImages<'_>) -> Result<f64, MetricError> {
        ensure_non_empty(self.name(), images.candidate)?;
        let levels: Vec<f64> = analysis_view(images.candidate)
            .to_luma8()
            .pixels()
            .map(|pixel| pixel.0[0] as f64)
            .collect();
        let rms = variance(&levels).sqrt();
        Ok((rms / 70.0 * 100.0).clamp(0.0, 100.0))
    }
}

/// How close the candidate already is to the print pixel target.
pub struct ResolutionAdequacy;

impl QualityMetric for ResolutionAdequacy {
    fn name(&self) -> &str {
        "resolution"
    }

    fn compute(&self, images: &MetricImages<'_>) -> Result<f64, MetricError> {
        let target = images.print_target;
        if target.width == 0 || target.height == 0 {
            return Err(MetricError::unavailable(self.name(), "print target has no area"));
        }
        let (width, height) = images.candidate.dimensions();
        let ratio = (width as f64 / target.width as f64).min(height as f64 / target.height as f64);
        Ok(if ratio >= 1.0 { 100.0 } else { ratio * 100.0 })
    }
}
