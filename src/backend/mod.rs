//! Pluggable image-transformation providers.
//!
//! Every provider implements [`TransformBackend`]; the pipeline never talks
//! to one directly but through a [`BackendHandle`] which layers a timeout and
//! a concurrency cap on top of it.

mod local;
mod registry;
mod service;

use async_trait::async_trait;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::TransformError;
use crate::style::GenerationSettings;

pub use local::LocalCartoonBackend;
pub use registry::BackendRegistry;
pub use service::{BackendHandle, BackendService};

/// Static facts about a provider, used for routing and cost accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub id: String,
    pub model_id: String,
    pub supports_identity_lock: bool,
    pub supports_single_step: bool,
    pub supports_two_step: bool,
    pub cost_per_run: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformParams {
    pub seed: Option<u64>,
    pub settings: GenerationSettings,
    /// Free-form description of who is in the photo.
    pub subject: String,
}

#[derive(Debug, Clone)]
pub struct TransformRequest {
    pub image: Arc<DynamicImage>,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub params: TransformParams,
}

#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub image: DynamicImage,
    pub cost: f64,
    pub latency: Duration,
    pub model_id: String,
}

#[async_trait]
pub trait TransformBackend: Send + Sync {
    fn descriptor(&self) -> &BackendDescriptor;

    async fn transform(&self, request: TransformRequest) -> Result<TransformOutput, TransformError>;
}
