use std::path::PathBuf;
use thiserror::Error;

use crate::store::{JobId, JobStatus};

// Main Application Error Type

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Registry Error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Store Error: {0}")]
    Store(#[from] StoreError),
    #[error("Artifact Error: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("Configuration Error: {0}")]
    Config(#[from] ConfigError),
    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),
}

// External transformation provider errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("transform timed out after {0}s")]
    Timeout(u64),
    #[error("provider error: {0}")]
    ProviderError(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("unknown backend '{requested}', available: {available}")]
    UnknownBackend { requested: String, available: String },
    #[error("unknown style '{requested}', available: {available}")]
    UnknownStyle { requested: String, available: String },
    #[error("style '{style}' needs a two-step backend but '{backend}' is single-step only")]
    IncompatibleStyle { style: String, backend: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("metric '{metric}' unavailable: {reason}")]
    Unavailable { metric: String, reason: String },
}

impl MetricError {
    pub fn unavailable(metric: impl Into<String>, reason: impl Into<String>) -> Self {
        MetricError::Unavailable {
            metric: metric.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpscaleError {
    #[error("upscale timed out after {0}s")]
    Timeout(u64),
    #[error("upscale failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum ConsentError {
    #[error("consent log IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed consent record on line {line}: {source}")]
    Malformed {
        line: usize,
        source: serde_json::Error,
    },
    #[error("consent record encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("print-ready output is {actual_width}x{actual_height}, expected {expected_width}x{expected_height}")]
    DimensionMismatch {
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },
    #[error("unsupported puzzle size: {0} pieces")]
    UnsupportedSize(u32),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("order '{0}' already has a job")]
    DuplicateOrder(String),
    #[error("job {0} is terminal and can no longer change")]
    Terminal(JobId),
    #[error("stage history of job {0} is append-only")]
    HistoryRewrite(JobId),
    #[error("rating must be between 1 and 5, got {0}")]
    InvalidRating(u8),
    #[error("journal IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("journal JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("artifact {0} not found")]
    NotFound(String),
    #[error("artifact {0} already exists and is immutable")]
    AlreadyExists(String),
    #[error("artifact IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
