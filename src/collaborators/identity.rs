use async_trait::async_trait;
use image::DynamicImage;
use std::sync::Arc;

use crate::backend::TransformOutput;
use crate::error::TransformError;

pub struct FixedImage {
    pub output: TransformOutput,
    /// Face region lifted from the reference photo, kept for manual review.
    pub face_crop: Option<DynamicImage>,
}

/// Restores the customer's likeness on a stylized image, typically by
/// swapping the face from the reference photo back in.
#[async_trait]
pub trait IdentityFixer: Send + Sync {
    fn name(&self) -> &str;

    async fn fix(
        &self,
        reference: Arc<DynamicImage>,
        generated: Arc<DynamicImage>,
    ) -> Result<FixedImage, TransformError>;
}
