use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::orchestrator::Orchestrator;
use crate::error::{AppError, StoreError};
use crate::store::{Feedback, Job, JobId, JobRequest, JobStatus};

struct RunningJob {
    cancel: CancellationToken,
    done: CancellationToken,
}

/// Caller-facing surface: submit orders, poll them, cancel them.
///
/// Jobs run on their own tasks; at most `worker_concurrency` of them are
/// past the queue at once. Stages within a job stay strictly sequential.
pub struct FulfillmentService {
    orchestrator: Arc<Orchestrator>,
    permits: Arc<Semaphore>,
    running: Arc<Mutex<HashMap<JobId, RunningJob>>>,
}

impl FulfillmentService {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let workers = orchestrator.configuration().pipeline.worker_concurrency.max(1);
        Self {
            orchestrator: Arc::new(orchestrator),
            permits: Arc::new(Semaphore::new(workers)),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Records the job and schedules it. Fails fast on anything that makes
    /// the order unrunnable, including a second job for the same order.
    pub async fn submit(&self, request: JobRequest) -> Result<JobId, AppError> {
        let id = self.orchestrator.create(request)?;
        self.spawn(id);
        Ok(id)
    }

    pub fn get_status(&self, id: JobId) -> Result<Arc<Job>, StoreError> {
        self.orchestrator.store().get(id)
    }

    /// Stores a 1-5 rating with an optional comment.
    pub fn submit_feedback(
        &self,
        id: JobId,
        rating: u8,
        comment: impl Into<String>,
    ) -> Result<Feedback, StoreError> {
        self.orchestrator.store().add_feedback(id, rating, comment)
    }

    pub fn get_feedback(&self, id: JobId) -> Result<Option<Feedback>, StoreError> {
        self.orchestrator.store().latest_feedback(id)
    }

    pub fn list(&self, limit: usize) -> Vec<Arc<Job>> {
        self.orchestrator.store().list(limit)
    }

    /// Requests cancellation. A running job stops at its next stage
    /// boundary; a job with no task is cancelled on the spot. Returns false
    /// if the job had already finished.
    pub fn cancel(&self, id: JobId) -> Result<bool, StoreError> {
        let job = self.get_status(id)?;
        if job.status.is_terminal() {
            return Ok(false);
        }

        let signalled = self
            .lock_running()
            .get(&id)
            .map(|running| running.cancel.cancel())
            .is_some();
        if !signalled {
            match self.orchestrator.store().set_status(id, JobStatus::Cancelled) {
                Ok(_) => {}
                Err(StoreError::Terminal(_)) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        info!("Cancellation requested for job {}", id);
        Ok(true)
    }

    /// Waits until the job's task has finished and returns its final
    /// snapshot. Returns immediately for jobs that are not running.
    pub async fn wait(&self, id: JobId) -> Result<Arc<Job>, StoreError> {
        let done = self.lock_running().get(&id).map(|running| running.done.clone());
        if let Some(done) = done {
            done.cancelled().await;
        }
        self.get_status(id)
    }

    /// Picks up every persisted job that has not reached a terminal state,
    /// e.g. after a restart.
    pub fn resume_pending(&self) -> Vec<JobId> {
        let pending: Vec<JobId> = self
            .orchestrator
            .store()
            .list(usize::MAX)
            .iter()
            .filter(|job| !job.status.is_terminal())
            .map(|job| job.id)
            .collect();

        let resumed: Vec<JobId> = pending.into_iter().filter(|id| self.spawn(*id)).collect();
        if !resumed.is_empty() {
            info!("Resumed {} pending jobs", resumed.len());
        }
        resumed
    }

    /// Starts a task for `id` unless one is already running.
    fn spawn(&self, id: JobId) -> bool {
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        {
            let mut running = self.lock_running();
            if running.contains_key(&id) {
                return false;
            }
            running.insert(
                id,
                RunningJob {
                    cancel: cancel.clone(),
                    done: done.clone(),
                },
            );
        }

        let orchestrator = self.orchestrator.clone();
        let permits = self.permits.clone();
        let running = self.running.clone();
        tokio::spawn(async move {
            let permit = tokio::select! {
                permit = permits.acquire_owned() => permit.ok(),
                _ = cancel.cancelled() => None,
            };

            // A job cancelled while queued still goes through `drive`, which
            // records the cancellation without running a stage.
            if permit.is_none() && !cancel.is_cancelled() {
                warn!("Worker pool closed; job {} not started", id);
            } else {
                match orchestrator.drive(id, cancel).await {
                    Ok(job) => info!("Job {} stopped at {}", id, job.status),
                    Err(e) => error!("Job {} aborted: {}", id, e),
                }
            }
            drop(permit);

            running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            done.cancel();
        });
        true
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, RunningJob>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
