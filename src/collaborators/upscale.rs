use async_trait::async_trait;
use image::imageops::FilterType;
use image::DynamicImage;
use std::sync::Arc;
use tracing::debug;

use crate::error::UpscaleError;
use crate::export::PrintDimensions;

pub struct UpscaleOutput {
    pub image: DynamicImage,
    pub cost: f64,
}

/// Brings a working image up to exact print dimensions.
#[async_trait]
pub trait Upscaler: Send + Sync {
    fn name(&self) -> &str;

    async fn upscale(
        &self,
        image: Arc<DynamicImage>,
        target: PrintDimensions,
    ) -> Result<UpscaleOutput, UpscaleError>;
}

/// Local Lanczos resample. Crops to the target aspect ratio around the
/// center before scaling so nothing is stretched.
#[derive(Default)]
pub struct LanczosUpscaler;

impl LanczosUpscaler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Upscaler for LanczosUpscaler {
    fn name(&self) -> &str {
        "lanczos"
    }

    async fn upscale(
        &self,
        image: Arc<DynamicImage>,
        target: PrintDimensions,
    ) -> Result<UpscaleOutput, UpscaleError> {
        if target.width == 0 || target.height == 0 {
            return Err(UpscaleError::Failed(format!("invalid target {}", target)));
        }
        let image = tokio::task::spawn_blocking(move || {
            image.resize_to_fill(target.width, target.height, FilterType::Lanczos3)
        })
        .await
        .map_err(|e| UpscaleError::Failed(format!("worker panicked: {}", e)))?;
        debug!("Resampled to {}x{}", image.width(), image.height());

        Ok(UpscaleOutput { image, cost: 0.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::solid_image;

    #[tokio::test]
    async fn test_hits_exact_target() {
        let upscaler = LanczosUpscaler::new();
        let target = PrintDimensions {
            width: 120,
            height: 168,
        };

        let output = upscaler
            .upscale(Arc::new(solid_image(64, 48, [10, 20, 30])), target)
            .await
            .unwrap();
        assert_eq!((output.image.width(), output.image.height()), (120, 168));
        assert_eq!(output.cost, 0.0);
    }

    #[tokio::test]
    async fn test_rejects_empty_target() {
        let upscaler = LanczosUpscaler::new();
        let target = PrintDimensions {
            width: 0,
            height: 10,
        };
        assert!(upscaler
            .upscale(Arc::new(solid_image(4, 4, [0, 0, 0])), target)
            .await
            .is_err());
    }
}
