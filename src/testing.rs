//! Shared fixtures and scripted collaborators for unit tests.

use async_trait::async_trait;
use chrono::Utc;
use image::{DynamicImage, ImageBuffer, Rgb};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{
    BackendDescriptor, TransformBackend, TransformOutput, TransformParams, TransformRequest,
};
use crate::collaborators::{FixedImage, IdentityFixer, UpscaleOutput, Upscaler};
use crate::error::{MetricError, TransformError, UpscaleError};
use crate::export::{PrintDimensions, PuzzleSize};
use crate::quality::{MetricImages, QualityMetric, QualityReport};
use crate::store::JobRequest;
use crate::style::GenerationSettings;

pub(crate) fn solid_image(width: u32, height: u32, rgb: [u8; 3]) -> DynamicImage {
    DynamicImage::ImageRgb8(ImageBuffer::from_pixel(width, height, Rgb(rgb)))
}

pub(crate) fn write_photo(dir: &Path, name: &str, image: DynamicImage) -> String {
    let path = dir.join(name);
    image.save(&path).unwrap();
    path.display().to_string()
}

pub(crate) fn request(order_id: &str) -> JobRequest {
    JobRequest {
        order_id: order_id.to_string(),
        photo: "photo.png".to_string(),
        style_key: "storybook_cartoon".to_string(),
        subject: "a child".to_string(),
        puzzle_size: PuzzleSize::Pieces500,
        backend_id: "mock".to_string(),
        skip_consent: false,
    }
}

pub(crate) fn report(attempt: u32, composite: f64) -> QualityReport {
    QualityReport {
        attempt,
        artifact_uri: format!("memory://attempt-{}", attempt),
        metrics: Vec::new(),
        composite,
        threshold: 70.0,
        pass: composite >= 70.0,
        scored_at: Utc::now(),
    }
}

pub(crate) fn transform_request(prompt: &str) -> TransformRequest {
    transform_request_with(solid_image(8, 8, [90, 60, 30]), prompt, None)
}

pub(crate) fn transform_request_with(
    image: DynamicImage,
    prompt: &str,
    seed: Option<u64>,
) -> TransformRequest {
    TransformRequest {
        image: Arc::new(image),
        prompt: prompt.to_string(),
        negative_prompt: None,
        params: TransformParams {
            seed,
            settings: GenerationSettings::default(),
            subject: "a child".to_string(),
        },
    }
}

pub(crate) struct FixedMetric {
    name: String,
    score: Option<f64>,
}

impl FixedMetric {
    pub(crate) fn ok(name: impl Into<String>, score: f64) -> Self {
        Self {
            name: name.into(),
            score: Some(score),
        }
    }

    pub(crate) fn unavailable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            score: None,
        }
    }
}

impl QualityMetric for FixedMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn compute(&self, _images: &MetricImages<'_>) -> Result<f64, MetricError> {
        self.score
            .ok_or_else(|| MetricError::unavailable(self.name.as_str(), "scripted outage"))
    }
}

/// Returns its scores in order, repeating the last one.
pub(crate) struct SequenceMetric {
    name: String,
    scores: Vec<f64>,
    calls: AtomicUsize,
}

impl SequenceMetric {
    pub(crate) fn new(name: &str, scores: &[f64]) -> Self {
        Self {
            name: name.to_string(),
            scores: scores.to_vec(),
            calls: AtomicUsize::new(0),
        }
    }
}

impl QualityMetric for SequenceMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn compute(&self, _images: &MetricImages<'_>) -> Result<f64, MetricError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let index = call.min(self.scores.len().saturating_sub(1));
        self.scores
            .get(index)
            .copied()
            .ok_or_else(|| MetricError::unavailable(self.name.as_str(), "no scores scripted"))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub prompt: String,
    pub seed: Option<u64>,
}

/// Echoes its input image back after an optional delay, or fails.
pub(crate) struct MockBackend {
    descriptor: BackendDescriptor,
    delay: Option<Duration>,
    failure: Option<TransformError>,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
}

impl MockBackend {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            descriptor: BackendDescriptor {
                id: id.to_string(),
                model_id: format!("{}-model", id),
                supports_identity_lock: false,
                supports_single_step: true,
                supports_two_step: true,
                cost_per_run: 0.04,
            },
            delay: None,
            failure: None,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn fail_with(mut self, error: TransformError) -> Self {
        self.failure = Some(error);
        self
    }

    pub(crate) fn single_step_only(mut self) -> Self {
        self.descriptor.supports_two_step = false;
        self
    }

    pub(crate) fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransformBackend for MockBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    async fn transform(&self, request: TransformRequest) -> Result<TransformOutput, TransformError> {
        self.calls.lock().unwrap().push(RecordedCall {
            prompt: request.prompt.clone(),
            seed: request.params.seed,
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        Ok(TransformOutput {
            image: DynamicImage::clone(&request.image),
            cost: self.descriptor.cost_per_run,
            latency: self.delay.unwrap_or_default(),
            model_id: self.descriptor.model_id.clone(),
        })
    }
}

/// Paints the generated image a fixed color, or fails.
pub(crate) struct MockFixer {
    failure: Option<TransformError>,
}

impl MockFixer {
    pub(crate) const COLOR: [u8; 3] = [7, 7, 7];

    pub(crate) fn working() -> Self {
        Self { failure: None }
    }

    pub(crate) fn failing(error: TransformError) -> Self {
        Self {
            failure: Some(error),
        }
    }
}

#[async_trait]
impl IdentityFixer for MockFixer {
    fn name(&self) -> &str {
        "mock_face_swap"
    }

    async fn fix(
        &self,
        reference: Arc<DynamicImage>,
        generated: Arc<DynamicImage>,
    ) -> Result<FixedImage, TransformError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        // Centered square, half the short edge.
        let side = (reference.width().min(reference.height()) / 2).max(1);
        let face_crop = reference.crop_imm(
            (reference.width() - side) / 2,
            (reference.height() - side) / 2,
            side,
            side,
        );
        Ok(FixedImage {
            output: TransformOutput {
                image: solid_image(generated.width(), generated.height(), Self::COLOR),
                cost: 0.003,
                latency: Duration::ZERO,
                model_id: "mock-face-swap".to_string(),
            },
            face_crop: Some(face_crop),
        })
    }
}

/// Fails, returns its input untouched, or stalls before resampling.
pub(crate) enum ScriptedUpscaler {
    Failing,
    Passthrough,
    Stalled(Duration),
}

#[async_trait]
impl Upscaler for ScriptedUpscaler {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn upscale(
        &self,
        image: Arc<DynamicImage>,
        target: PrintDimensions,
    ) -> Result<UpscaleOutput, UpscaleError> {
        match self {
            ScriptedUpscaler::Failing => Err(UpscaleError::Failed("gpu unavailable".to_string())),
            ScriptedUpscaler::Passthrough => Ok(UpscaleOutput {
                image: DynamicImage::clone(&image),
                cost: 0.0,
            }),
            ScriptedUpscaler::Stalled(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(UpscaleOutput {
                    image: image.resize_exact(target.width, target.height, image::imageops::FilterType::Nearest),
                    cost: 0.0,
                })
            }
        }
    }
}
