use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::executor::{JobContext, StageExecutor};
use super::transitions::{apply, plan, Policy, Step};
use crate::artifacts::{ArtifactStore, FsArtifactStore, MemoryArtifactStore};
use crate::backend::{BackendRegistry, LocalCartoonBackend, TransformBackend};
use crate::collaborators::{ConsentLedger, IdentityFixer, LanczosUpscaler, MemoryConsentLedger, Upscaler};
use crate::config::{Configuration, SeedPolicy};
use crate::error::{AppError, StoreError};
use crate::export::{Exporter, PrintSpecs};
use crate::quality::{default_engine, FaceAnalyzer, QualityEngine};
use crate::store::{FailureReason, Job, JobId, JobRequest, JobStatus, JobStore};
use crate::style::{StyleCatalog, DEFAULT_STYLE};

/// Drives jobs through the fixed stage topology. Holds no per-job state:
/// everything a run needs is read back from the job store between stages,
/// so any non-terminal job can be picked up again after a restart.
pub struct Orchestrator {
    configuration: Configuration,
    store: Arc<JobStore>,
    registry: BackendRegistry,
    styles: StyleCatalog,
    executor: StageExecutor,
}

impl Orchestrator {
    pub fn builder(configuration: Configuration) -> OrchestratorBuilder {
        OrchestratorBuilder::new(configuration)
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn styles(&self) -> &StyleCatalog {
        &self.styles
    }

    /// Fills in defaults and rejects a request that could never run:
    /// unknown style or backend, or a style the backend cannot serve.
    pub fn validate(&self, mut request: JobRequest) -> Result<JobRequest, AppError> {
        if request.order_id.trim().is_empty() {
            return Err(AppError::InvalidSubmission("order id is empty".to_string()));
        }
        if request.photo.trim().is_empty() {
            return Err(AppError::InvalidSubmission("photo is empty".to_string()));
        }
        if request.style_key.trim().is_empty() {
            request.style_key = DEFAULT_STYLE.to_string();
        }
        if request.backend_id.trim().is_empty() {
            request.backend_id = self.configuration.default_backend.clone();
        }

        let preset = self.styles.get(&request.style_key)?;
        let backend = self.registry.resolve_for(&request.backend_id, preset)?;
        request.style_key = preset.key.clone();
        request.backend_id = backend.id().to_string();
        Ok(request)
    }

    /// Validates and records a new job without running it.
    pub fn create(&self, request: JobRequest) -> Result<JobId, AppError> {
        let request = self.validate(request)?;
        let job = Job::new(request);
        info!(
            "Created job {} for order {} ({}, {}, {})",
            job.id, job.order_id, job.style_key, job.backend_id, job.puzzle_size
        );
        Ok(self.store.create(job)?)
    }

    fn context(&self, job: &Job) -> Result<JobContext, AppError> {
        let preset = self.styles.get(&job.style_key)?.clone();
        let backend = self.registry.resolve_for(&job.backend_id, &preset)?;
        Ok(JobContext { preset, backend })
    }

    /// Runs `id` from its persisted status until it reaches a terminal state
    /// or `cancel` fires. Cancellation is only observed between stages; a
    /// stage that finishes after cancellation is discarded, not committed.
    pub async fn drive(&self, id: JobId, cancel: CancellationToken) -> Result<Arc<Job>, AppError> {
        let job = self.store.get(id)?;
        let context = match self.context(&job) {
            Ok(context) => context,
            Err(e) if !job.status.is_terminal() => {
                warn!("Job {} cannot be resolved: {}", id, e);
                let reason = FailureReason::Internal(e.to_string());
                return Ok(self.store.set_status(id, JobStatus::Failed(reason))?);
            }
            Err(_) => return Ok(job),
        };
        let policy = Policy {
            face_fix: context.preset.face_fix,
            max_extra_attempts: self.configuration.pipeline.max_extra_attempts,
        };

        loop {
            let job = self.store.get(id)?;
            let stage = match plan(&job.status) {
                Step::Done => {
                    info!("Job {} finished as {}", id, job.status);
                    return Ok(job);
                }
                _ if cancel.is_cancelled() => return self.cancelled(id),
                Step::Enter(status) => {
                    debug!("Job {} entering {}", id, status);
                    self.store.set_status(id, status)?;
                    continue;
                }
                Step::Run(stage) => stage,
            };

            let run = self.executor.run(&job, &context, stage).await;
            if cancel.is_cancelled() {
                debug!("Discarding {} result of cancelled job {}", stage, id);
                return self.cancelled(id);
            }
            self.store.update(id, |job| {
                apply(job, run, &policy);
                Ok(())
            })?;
        }
    }

    fn cancelled(&self, id: JobId) -> Result<Arc<Job>, AppError> {
        info!("Job {} cancelled", id);
        match self.store.set_status(id, JobStatus::Cancelled) {
            Ok(job) => Ok(job),
            // Raced with a terminal commit; the terminal state stands.
            Err(StoreError::Terminal(_)) => Ok(self.store.get(id)?),
            Err(e) => Err(e.into()),
        }
    }
}

/// Assembles an [`Orchestrator`] from configuration, with individual
/// collaborators and settings overridable.
pub struct OrchestratorBuilder {
    configuration: Configuration,
    backends: Vec<Arc<dyn TransformBackend>>,
    styles: Option<StyleCatalog>,
    store: Option<Arc<JobStore>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    consent: Option<Arc<dyn ConsentLedger>>,
    upscaler: Option<Arc<dyn Upscaler>>,
    identity_fixer: Option<Arc<dyn IdentityFixer>>,
    face_analyzer: Option<Arc<dyn FaceAnalyzer>>,
    quality: Option<QualityEngine>,
    print_specs: Option<PrintSpecs>,
}

impl OrchestratorBuilder {
    pub fn new(configuration: Configuration) -> Self {
        Self {
            configuration,
            backends: Vec::new(),
            styles: None,
            store: None,
            artifacts: None,
            consent: None,
            upscaler: None,
            identity_fixer: None,
            face_analyzer: None,
            quality: None,
            print_specs: None,
        }
    }

    // Overrides the configured regeneration budget.
    pub fn max_extra_attempts(mut self, max_extra_attempts: u32) -> Self {
        self.configuration.pipeline.max_extra_attempts = max_extra_attempts;
        self
    }

    pub fn seed_policy(mut self, seed_policy: SeedPolicy, base_seed: Option<u64>) -> Self {
        self.configuration.pipeline.seed_policy = seed_policy;
        self.configuration.pipeline.base_seed = base_seed;
        self
    }

    pub fn worker_concurrency(mut self, worker_concurrency: usize) -> Self {
        self.configuration.pipeline.worker_concurrency = worker_concurrency;
        self
    }

    pub fn stage_timeout_secs(mut self, stage_timeout_secs: u64) -> Self {
        self.configuration.pipeline.stage_timeout_secs = stage_timeout_secs;
        self
    }

    pub fn min_input_px(mut self, min_input_px: u32) -> Self {
        self.configuration.pipeline.min_input_px = min_input_px;
        self
    }

    pub fn quality_threshold(mut self, threshold: f64) -> Self {
        self.configuration.quality.threshold = threshold;
        self
    }

    pub fn backend(mut self, backend: Arc<dyn TransformBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn styles(mut self, styles: StyleCatalog) -> Self {
        self.styles = Some(styles);
        self
    }

    pub fn store(mut self, store: Arc<JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn consent(mut self, consent: Arc<dyn ConsentLedger>) -> Self {
        self.consent = Some(consent);
        self
    }

    pub fn upscaler(mut self, upscaler: Arc<dyn Upscaler>) -> Self {
        self.upscaler = Some(upscaler);
        self
    }

    pub fn identity_fixer(mut self, identity_fixer: Arc<dyn IdentityFixer>) -> Self {
        self.identity_fixer = Some(identity_fixer);
        self
    }

    pub fn face_analyzer(mut self, face_analyzer: Arc<dyn FaceAnalyzer>) -> Self {
        self.face_analyzer = Some(face_analyzer);
        self
    }

    /// Replaces the engine built from the `quality` configuration section.
    pub fn quality(mut self, quality: QualityEngine) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn print_specs(mut self, print_specs: PrintSpecs) -> Self {
        self.print_specs = Some(print_specs);
        self
    }

    pub fn build(self) -> Result<Orchestrator, AppError> {
        let configuration = self.configuration;
        configuration.validate()?;

        let store = match (self.store, &configuration.storage.jobs_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(JobStore::open(dir.clone())?),
            (None, None) => Arc::new(JobStore::in_memory()),
        };
        let artifacts: Arc<dyn ArtifactStore> = match (self.artifacts, &configuration.storage.artifacts_dir) {
            (Some(artifacts), _) => artifacts,
            (None, Some(dir)) => Arc::new(FsArtifactStore::new(dir.clone())?),
            (None, None) => Arc::new(MemoryArtifactStore::new()),
        };

        let mut backends = self.backends;
        if backends.is_empty() {
            backends.push(Arc::new(LocalCartoonBackend::new()));
        }
        let registry = BackendRegistry::new(&configuration.pipeline, backends);
        registry.resolve(&configuration.default_backend)?;

        let quality = self
            .quality
            .unwrap_or_else(|| default_engine(configuration.quality.clone(), self.face_analyzer));

        let consent: Arc<dyn ConsentLedger> = match self.consent {
            Some(consent) => consent,
            None => Arc::new(MemoryConsentLedger::new()),
        };
        let upscaler: Arc<dyn Upscaler> = match self.upscaler {
            Some(upscaler) => upscaler,
            None => Arc::new(LanczosUpscaler::new()),
        };

        let executor = StageExecutor {
            config: configuration.pipeline.clone(),
            artifacts,
            consent,
            upscaler,
            identity_fixer: self.identity_fixer,
            quality: Arc::new(quality),
            exporter: Arc::new(Exporter::new(self.print_specs.unwrap_or_default())),
        };

        Ok(Orchestrator {
            configuration,
            store,
            registry,
            styles: self.styles.unwrap_or_default(),
            executor,
        })
    }
}
