use futures::task::{Context, Poll};
use futures::Future;
use std::{
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tower::timeout::error::Elapsed;
use tower::util::BoxCloneService;
use tower::{BoxError, Service, ServiceBuilder, ServiceExt};
use tracing::{debug, instrument, warn};

use super::{BackendDescriptor, TransformBackend, TransformOutput, TransformRequest};
use crate::error::TransformError;

/// Adapts a [`TransformBackend`] to a tower [`Service`].
#[derive(Clone)]
pub struct BackendService {
    backend: Arc<dyn TransformBackend>,
}

impl BackendService {
    pub fn new(backend: Arc<dyn TransformBackend>) -> Self {
        Self { backend }
    }
}

impl Service<TransformRequest> for BackendService {
    type Response = TransformOutput;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: TransformRequest) -> Self::Future {
        let backend = self.backend.clone();
        Box::pin(async move { backend.transform(request).await.map_err(BoxError::from) })
    }
}

/// A resolved backend: the provider behind a per-call timeout and a cap on
/// in-flight calls shared by every job using it.
pub struct BackendHandle {
    descriptor: BackendDescriptor,
    timeout: Duration,
    service: Mutex<BoxCloneService<TransformRequest, TransformOutput, BoxError>>,
}

impl BackendHandle {
    pub fn new(backend: Arc<dyn TransformBackend>, timeout: Duration, concurrency: usize) -> Self {
        let descriptor = backend.descriptor().clone();
        let service = ServiceBuilder::new()
            .timeout(timeout)
            .concurrency_limit(concurrency.max(1))
            .service(BackendService::new(backend));

        Self {
            descriptor,
            timeout,
            service: Mutex::new(BoxCloneService::new(service)),
        }
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    #[instrument(skip(self, request), fields(backend = %self.descriptor.id))]
    pub async fn transform(&self, request: TransformRequest) -> Result<TransformOutput, TransformError> {
        // Clones share the concurrency semaphore.
        let service = self
            .service
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match service.oneshot(request).await {
            Ok(output) => {
                debug!("Backend returned in {:?}", output.latency);
                Ok(output)
            }
            Err(e) => {
                let error = classify(e, self.timeout);
                warn!("Backend call failed: {}", error);
                Err(error)
            }
        }
    }
}

fn classify(error: BoxError, timeout: Duration) -> TransformError {
    if error.is::<Elapsed>() {
        return TransformError::Timeout(timeout.as_secs());
    }
    match error.downcast::<TransformError>() {
        Ok(error) => *error,
        Err(other) => TransformError::ProviderError(other.to_string()),
    }
}
