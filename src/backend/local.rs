use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};
use std::time::Instant;
use tracing::debug;

use super::{BackendDescriptor, TransformBackend, TransformOutput, TransformRequest};
use crate::error::TransformError;

const POSTERIZE_LEVELS: u8 = 6;

/// Offline stand-in for a hosted model: boosts saturation and posterizes to
/// flat cartoon-like color bands. Prompts are ignored; the seed nudges the
/// saturation boost so regenerated attempts differ.
pub struct LocalCartoonBackend {
    descriptor: BackendDescriptor,
}

impl LocalCartoonBackend {
    pub fn new() -> Self {
        Self {
            descriptor: BackendDescriptor {
                id: "local_cartoon".to_string(),
                model_id: "local/posterize-v1".to_string(),
                supports_identity_lock: false,
                supports_single_step: true,
                supports_two_step: true,
                cost_per_run: 0.0,
            },
        }
    }
}

impl Default for LocalCartoonBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn saturation_gain(seed: Option<u64>) -> f32 {
    1.35 + seed.map(|seed| (seed % 5) as f32 * 0.05).unwrap_or(0.0)
}

fn posterize(value: f32) -> u8 {
    let step = 255.0 / (POSTERIZE_LEVELS - 1) as f32;
    ((value.clamp(0.0, 255.0) / step).round() * step) as u8
}

pub(crate) fn cartoonize(image: &DynamicImage, gain: f32) -> RgbImage {
    let rgb = image.to_rgb8();
    RgbImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0.map(f32::from);
        let luma = 0.299 * r + 0.587 * g + 0.114 * b;
        let boost = |channel: f32| posterize(luma + (channel - luma) * gain);
        Rgb([boost(r), boost(g), boost(b)])
    })
}

#[async_trait]
impl TransformBackend for LocalCartoonBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    async fn transform(&self, request: TransformRequest) -> Result<TransformOutput, TransformError> {
        if request.image.width() == 0 || request.image.height() == 0 {
            return Err(TransformError::InvalidInput("empty image".to_string()));
        }

        let started = Instant::now();
        let gain = saturation_gain(request.params.seed);
        let source = request.image.clone();
        let image = tokio::task::spawn_blocking(move || cartoonize(&source, gain))
            .await
            .map_err(|e| TransformError::ProviderError(format!("worker panicked: {}", e)))?;
        debug!("Cartoonized {}x{} with gain {:.2}", image.width(), image.height(), gain);

        Ok(TransformOutput {
            image: DynamicImage::ImageRgb8(image),
            cost: self.descriptor.cost_per_run,
            latency: started.elapsed(),
            model_id: self.descriptor.model_id.clone(),
        })
    }
}
