use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageReader};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use super::transitions::StageRun;
use crate::artifacts::ArtifactStore;
use crate::backend::{BackendHandle, TransformParams, TransformRequest};
use crate::collaborators::{ConsentLedger, FixedImage, IdentityFixer, Upscaler};
use crate::config::{PipelineConfig, SeedPolicy};
use crate::error::{ArtifactError, ExportError, TransformError, UpscaleError};
use crate::export::Exporter;
use crate::quality::QualityEngine;
use crate::store::{Artifact, ArtifactKind, FailureReason, Job, Stage, StageOutcome, StageResult};
use crate::style::{PipelineMode, StylePreset};

/// Resolved per-job inputs: the style and the backend that serves it.
#[derive(Clone)]
pub struct JobContext {
    pub preset: StylePreset,
    pub backend: Arc<BackendHandle>,
}

/// Runs one stage against a job snapshot and reports what happened. It
/// never touches the job store; the driver commits the returned
/// [`StageRun`].
pub struct StageExecutor {
    pub(crate) config: PipelineConfig,
    pub(crate) artifacts: Arc<dyn ArtifactStore>,
    pub(crate) consent: Arc<dyn ConsentLedger>,
    pub(crate) upscaler: Arc<dyn Upscaler>,
    pub(crate) identity_fixer: Option<Arc<dyn IdentityFixer>>,
    pub(crate) quality: Arc<QualityEngine>,
    pub(crate) exporter: Arc<Exporter>,
}

impl StageExecutor {
    #[instrument(skip_all, fields(job_id = %job.id, stage = %stage))]
    pub async fn run(&self, job: &Job, context: &JobContext, stage: Stage) -> StageRun {
        let started = Instant::now();
        debug!("Starting stage");

        let mut run = match stage {
            Stage::Consent => self.consent(job).await,
            Stage::Preprocess => self.preprocess(job).await,
            Stage::Transform => self.transform(job, context).await,
            Stage::IdentityFix => self.identity_fix(job).await,
            Stage::QualityScoring => self.score(job).await,
            Stage::Upscale => self.upscale(job).await,
            Stage::Export => self.export(job).await,
        };
        run.result = run.result.with_duration(started.elapsed());

        match run.result.outcome {
            StageOutcome::Success | StageOutcome::Skipped => info!(
                "Stage {} finished ({:?}) in {}ms",
                stage, run.result.outcome, run.result.duration_ms
            ),
            StageOutcome::FailedNonFatal => warn!(
                "Stage {} degraded: {}",
                stage,
                run.result.error.as_deref().unwrap_or("unknown error")
            ),
            StageOutcome::FailedFatal => tracing::error!(
                "Stage {} failed: {}",
                stage,
                run.result.error.as_deref().unwrap_or("unknown error")
            ),
        }
        run
    }

    async fn consent(&self, job: &Job) -> StageRun {
        if job.skip_consent {
            warn!("Consent check bypassed for order {}", job.order_id);
            return StageRun::new(StageResult::new(Stage::Consent, 0, StageOutcome::Skipped));
        }

        let result = StageResult::success(Stage::Consent, 0);
        match tokio::time::timeout(self.timeout(), self.consent.is_consented(&job.order_id)).await {
            Ok(Ok(true)) => StageRun::new(result),
            Ok(Ok(false)) => StageRun::fatal(result, FailureReason::ConsentRequired),
            Ok(Err(e)) => StageRun::fatal(result.with_error(e), FailureReason::ConsentRequired),
            Err(_) => StageRun::fatal(
                result.with_error("consent check timed out"),
                FailureReason::ConsentRequired,
            ),
        }
    }

    async fn preprocess(&self, job: &Job) -> StageRun {
        let result = StageResult::success(Stage::Preprocess, 0);
        let path = job.photo.clone();
        let (min_px, max_px) = (self.config.min_input_px, self.config.max_working_px);

        let prepared = tokio::task::spawn_blocking(move || prepare_input(Path::new(&path), min_px, max_px))
            .await
            .unwrap_or_else(|e| Err(format!("preprocessing panicked: {}", e)));
        let image = match prepared {
            Ok(image) => image,
            Err(reason) => {
                return StageRun::fatal(
                    result.with_error(&reason),
                    FailureReason::InvalidInput(reason),
                )
            }
        };

        match self
            .store(job, ArtifactKind::InputResized, 0, Stage::Preprocess, image)
            .await
        {
            Ok(artifact) => {
                let uri = artifact.uri.clone();
                StageRun::new(result.with_output(&uri))
                    .with_artifact(artifact)
                    .with_working(uri)
            }
            Err(e) => internal(result, e),
        }
    }

    async fn transform(&self, job: &Job, context: &JobContext) -> StageRun {
        let attempt = job.current_attempt();
        let seed = self.seed_for(attempt);
        let result = StageResult::success(Stage::Transform, attempt).with_seed(seed);

        let input = match self.load_input(job).await {
            Ok(input) => input,
            Err(e) => return internal(result, e),
        };

        let params = TransformParams {
            seed,
            settings: context.preset.settings,
            subject: job.subject.clone(),
        };
        let first = TransformRequest {
            image: input,
            prompt: context.preset.prompt.clone(),
            negative_prompt: context.preset.negative_prompt.clone(),
            params: params.clone(),
        };

        let mut cost = 0.0;
        let mut output = match context.backend.transform(first).await {
            Ok(output) => output,
            Err(e) => return transform_failed(result, e),
        };
        cost += output.cost;

        if let PipelineMode::TwoStep { refine_prompt } = &context.preset.mode {
            debug!("Refining stage-one output");
            let second = TransformRequest {
                image: Arc::new(output.image),
                prompt: refine_prompt.clone(),
                negative_prompt: context.preset.negative_prompt.clone(),
                params,
            };
            output = match context.backend.transform(second).await {
                Ok(output) => output,
                Err(e) => return transform_failed(result.with_cost(cost), e),
            };
            cost += output.cost;
        }

        let result = result.with_cost(cost);
        match self
            .store(job, ArtifactKind::Generated, attempt, Stage::Transform, output.image)
            .await
        {
            Ok(artifact) => {
                let uri = artifact.uri.clone();
                StageRun::new(result.with_output(&uri))
                    .with_artifact(artifact)
                    .with_working(uri)
            }
            Err(e) => internal(result, e),
        }
    }

    async fn identity_fix(&self, job: &Job) -> StageRun {
        let attempt = job.current_attempt();
        let result = StageResult::success(Stage::IdentityFix, attempt);
        let Some(fixer) = self.identity_fixer.clone() else {
            debug!("No identity fixer configured");
            return StageRun::new(StageResult::new(Stage::IdentityFix, attempt, StageOutcome::Skipped));
        };

        let degraded = |error: String| {
            StageRun::new(
                StageResult::new(Stage::IdentityFix, attempt, StageOutcome::FailedNonFatal)
                    .with_error(error),
            )
        };

        let (reference, generated) = match (self.load_input(job).await, self.load_working(job).await) {
            (Ok(reference), Ok(generated)) => (reference, generated),
            (Err(e), _) | (_, Err(e)) => return degraded(e.to_string()),
        };

        let fixed: FixedImage =
            match tokio::time::timeout(self.timeout(), fixer.fix(reference, generated)).await {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return degraded(format!("{} failed: {}", fixer.name(), e)),
                Err(_) => {
                    return degraded(
                        TransformError::Timeout(self.config.stage_timeout_secs).to_string(),
                    )
                }
            };

        let result = result.with_cost(fixed.output.cost);
        let run = match self
            .store(job, ArtifactKind::Generated, attempt, Stage::IdentityFix, fixed.output.image)
            .await
        {
            Ok(artifact) => {
                let uri = artifact.uri.clone();
                StageRun::new(result.with_output(&uri))
                    .with_artifact(artifact)
                    .with_working(uri)
            }
            Err(e) => return degraded(e.to_string()),
        };

        let Some(face_crop) = fixed.face_crop else {
            return run;
        };
        match self
            .store(job, ArtifactKind::FaceCrop, attempt, Stage::IdentityFix, face_crop)
            .await
        {
            Ok(artifact) => run.with_artifact(artifact),
            Err(e) => {
                warn!("Face crop for job {} not kept: {}", job.id, e);
                run
            }
        }
    }

    async fn score(&self, job: &Job) -> StageRun {
        let attempt = job.current_attempt();
        let result = StageResult::success(Stage::QualityScoring, attempt);
        let Some(candidate_uri) = job.working_uri.clone() else {
            return internal(result, "no working image to score");
        };

        let (original, candidate) = match (self.load_input(job).await, self.load_working(job).await) {
            (Ok(original), Ok(candidate)) => (original, candidate),
            (Err(e), _) | (_, Err(e)) => return internal(result, e),
        };

        let target = match self.exporter.specs().dimensions(job.puzzle_size) {
            Ok(target) => target,
            Err(e) => return internal(result, e),
        };
        let engine = self.quality.clone();
        let scored = tokio::task::spawn_blocking(move || engine.score(&original, &candidate, target)).await;
        let report = match scored {
            Ok(report) => report.for_attempt(attempt, candidate_uri.clone()),
            Err(e) => return internal(result, format!("scoring panicked: {}", e)),
        };

        info!(
            "Attempt {} scored {:.1} (threshold {:.1})",
            attempt, report.composite, report.threshold
        );
        StageRun::new(result.with_output(candidate_uri)).with_report(report)
    }

    async fn upscale(&self, job: &Job) -> StageRun {
        let attempt = job.selected_attempt.unwrap_or_else(|| job.current_attempt());
        let result = StageResult::success(Stage::Upscale, attempt);
        let working = match self.load_working(job).await {
            Ok(working) => working,
            Err(e) => return internal(result, e),
        };

        let target = match self.exporter.specs().dimensions(job.puzzle_size) {
            Ok(target) => target,
            Err(e) => {
                let reason = FailureReason::Export(e.to_string());
                return StageRun::fatal(result.with_error(e), reason);
            }
        };
        let output = match tokio::time::timeout(self.timeout(), self.upscaler.upscale(working, target)).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                let reason = FailureReason::Upscale(e.to_string());
                return StageRun::fatal(result.with_error(e), reason);
            }
            Err(_) => {
                let error = UpscaleError::Timeout(self.config.stage_timeout_secs);
                let reason = FailureReason::Upscale(error.to_string());
                return StageRun::fatal(result.with_error(error), reason);
            }
        };

        let result = result.with_cost(output.cost);
        match self
            .store(job, ArtifactKind::Upscaled, attempt, Stage::Upscale, output.image)
            .await
        {
            Ok(artifact) => {
                let uri = artifact.uri.clone();
                StageRun::new(result.with_output(&uri))
                    .with_artifact(artifact)
                    .with_working(uri)
            }
            Err(e) => internal(result, e),
        }
    }

    async fn export(&self, job: &Job) -> StageRun {
        let attempt = job.selected_attempt.unwrap_or_else(|| job.current_attempt());
        let result = StageResult::success(Stage::Export, attempt);
        let working = match self.load_working(job).await {
            Ok(working) => working,
            Err(e) => return internal(result, e),
        };

        let exporter = self.exporter.clone();
        let size = job.puzzle_size;
        let exported = tokio::task::spawn_blocking(move || exporter.export(DynamicImage::clone(&working), size)).await;
        let output = match exported {
            Ok(Ok(output)) => output,
            Ok(Err(e @ ExportError::DimensionMismatch { .. })) => {
                let reason = FailureReason::DimensionMismatch(e.to_string());
                return StageRun::fatal(result.with_error(e), reason);
            }
            Ok(Err(e)) => {
                let reason = FailureReason::Export(e.to_string());
                return StageRun::fatal(result.with_error(e), reason);
            }
            Err(e) => return internal(result, format!("export panicked: {}", e)),
        };

        let preview = self
            .store(job, ArtifactKind::Preview, attempt, Stage::Export, output.preview)
            .await;
        let print_ready = self
            .store(job, ArtifactKind::PrintReady, attempt, Stage::Export, output.print_ready)
            .await;
        match (preview, print_ready) {
            (Ok(preview), Ok(print_ready)) => {
                let uri = print_ready.uri.clone();
                StageRun::new(result.with_output(&uri))
                    .with_artifact(preview)
                    .with_artifact(print_ready)
            }
            (Err(e), _) | (_, Err(e)) => {
                let reason = FailureReason::Export(e.to_string());
                StageRun::fatal(result.with_error(e), reason)
            }
        }
    }

    fn timeout(&self) -> Duration {
        self.config.stage_timeout()
    }

    fn seed_for(&self, attempt: u32) -> Option<u64> {
        match self.config.seed_policy {
            SeedPolicy::Reuse => self.config.base_seed,
            SeedPolicy::Vary => Some(
                self.config
                    .base_seed
                    .map(|base| base.wrapping_add(u64::from(attempt)))
                    .unwrap_or_else(rand::random),
            ),
        }
    }

    async fn load_input(&self, job: &Job) -> Result<Arc<DynamicImage>, ArtifactError> {
        let artifact = job
            .latest_artifact(ArtifactKind::InputResized, 0)
            .ok_or_else(|| ArtifactError::NotFound(format!("{}/input_resized", job.id)))?;
        self.load(artifact.uri.clone()).await
    }

    async fn load_working(&self, job: &Job) -> Result<Arc<DynamicImage>, ArtifactError> {
        let uri = job
            .working_uri
            .clone()
            .ok_or_else(|| ArtifactError::NotFound(format!("{}/working", job.id)))?;
        self.load(uri).await
    }

    async fn load(&self, uri: String) -> Result<Arc<DynamicImage>, ArtifactError> {
        let artifacts = self.artifacts.clone();
        tokio::task::spawn_blocking(move || artifacts.load(&uri))
            .await
            .map_err(|e| ArtifactError::Io(std::io::Error::other(e)))?
    }

    async fn store(
        &self,
        job: &Job,
        kind: ArtifactKind,
        attempt: u32,
        stage: Stage,
        image: DynamicImage,
    ) -> Result<Artifact, ArtifactError> {
        let artifacts = self.artifacts.clone();
        let id = job.id;
        let committed: Vec<String> = job.artifacts.iter().map(|a| a.uri.clone()).collect();
        tokio::task::spawn_blocking(move || {
            match artifacts.put(id, kind, attempt, stage, &image) {
                // Written by an earlier run that stopped before the job store
                // recorded it. That file is the one downstream stages saw.
                Err(ArtifactError::AlreadyExists(uri)) if !committed.contains(&uri) => {
                    warn!("Adopting uncommitted artifact {}", uri);
                    artifacts.recover(id, kind, attempt, stage)
                }
                other => other,
            }
        })
        .await
        .map_err(|e| ArtifactError::Io(std::io::Error::other(e)))?
    }
}

fn transform_failed(result: StageResult, error: TransformError) -> StageRun {
    let reason = match &error {
        TransformError::InvalidInput(detail) => FailureReason::InvalidInput(detail.clone()),
        other => FailureReason::Transform(other.to_string()),
    };
    StageRun::fatal(result.with_error(error), reason)
}

fn internal(result: StageResult, error: impl std::fmt::Display) -> StageRun {
    let reason = FailureReason::Internal(error.to_string());
    StageRun::fatal(result.with_error(error), reason)
}

/// Decodes the customer photo, applies its EXIF orientation, enforces the
/// minimum size and bounds the working copy.
pub(crate) fn prepare_input(path: &Path, min_px: u32, max_px: u32) -> Result<DynamicImage, String> {
    let reader = ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let mut decoder = reader
        .into_decoder()
        .map_err(|e| format!("cannot decode {}: {}", path.display(), e))?;
    let orientation = decoder
        .orientation()
        .map_err(|e| format!("cannot read orientation: {}", e))?;
    let mut image = DynamicImage::from_decoder(decoder)
        .map_err(|e| format!("cannot decode {}: {}", path.display(), e))?;
    image.apply_orientation(orientation);

    let (width, height) = (image.width(), image.height());
    if width < min_px || height < min_px {
        return Err(format!(
            "photo is {}x{}, at least {}px per side is required",
            width, height, min_px
        ));
    }

    let image = DynamicImage::ImageRgb8(image.to_rgb8());
    if width.max(height) > max_px {
        debug!("Bounding {}x{} working copy to {}px", width, height, max_px);
        return Ok(image.resize(max_px, max_px, FilterType::Lanczos3));
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{solid_image, write_photo};

    #[test]
    fn test_prepare_rejects_small_photos() {
        let dir = tempfile::tempdir().unwrap();
        let photo = write_photo(dir.path(), "small.png", solid_image(200, 400, [9, 9, 9]));
        let err = prepare_input(Path::new(&photo), 256, 1024).unwrap_err();
        assert!(err.contains("200x400"), "{}", err);
    }

    #[test]
    fn test_prepare_bounds_long_edge() {
        let dir = tempfile::tempdir().unwrap();
        let photo = write_photo(dir.path(), "big.png", solid_image(600, 300, [9, 9, 9]));
        let image = prepare_input(Path::new(&photo), 256, 400).unwrap();
        assert_eq!((image.width(), image.height()), (400, 200));
    }

    #[test]
    fn test_prepare_converts_to_rgb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gray.png");
        DynamicImage::new_luma8(300, 300).save(&path).unwrap();
        let image = prepare_input(&path, 256, 1024).unwrap();
        assert!(matches!(image, DynamicImage::ImageRgb8(_)));
    }

    #[test]
    fn test_prepare_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.png");
        std::fs::write(&path, b"definitely not an image").unwrap();
        assert!(prepare_input(&path, 256, 1024).is_err());
        assert!(prepare_input(&dir.path().join("missing.png"), 256, 1024).is_err());
    }
}
