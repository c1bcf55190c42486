use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info};

use super::job::{Feedback, Job, JobId, StageResult};
use super::status::JobStatus;
use crate::error::StoreError;

/// Per-job slot: one writer at a time, readers grab the current snapshot.
struct JobCell {
    writer: Mutex<()>,
    snapshot: RwLock<Arc<Job>>,
}

impl JobCell {
    fn new(job: Job) -> Self {
        Self {
            writer: Mutex::new(()),
            snapshot: RwLock::new(Arc::new(job)),
        }
    }

    fn current(&self) -> Arc<Job> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Default)]
struct Index {
    jobs: HashMap<JobId, Arc<JobCell>>,
    orders: HashMap<String, JobId>,
}

/// Concurrency-safe record of every job.
///
/// Writes to one job are serialized by that job's own lock, so two jobs
/// never contend; the index lock is only held to look a job up or insert
/// one. Readers receive immutable `Arc<Job>` snapshots.
pub struct JobStore {
    index: RwLock<Index>,
    journal: Option<Journal>,
}

impl JobStore {
    pub fn in_memory() -> Self {
        Self {
            index: RwLock::new(Index::default()),
            journal: None,
        }
    }

    /// Journals every job to `<dir>/<id>.json` and reloads whatever is
    /// already there.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let journal = Journal::new(dir.into())?;
        let mut index = Index::default();
        for job in journal.load_all()? {
            index.orders.insert(job.order_id.clone(), job.id);
            index.jobs.insert(job.id, Arc::new(JobCell::new(job)));
        }
        info!(
            "Opened job store at {} with {} jobs",
            journal.dir.display(),
            index.jobs.len()
        );

        Ok(Self {
            index: RwLock::new(index),
            journal: Some(journal),
        })
    }

    pub fn create(&self, job: Job) -> Result<JobId, StoreError> {
        let id = job.id;
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        if index.orders.contains_key(&job.order_id) {
            return Err(StoreError::DuplicateOrder(job.order_id));
        }
        if let Some(journal) = &self.journal {
            journal.write(&job)?;
        }
        index.orders.insert(job.order_id.clone(), id);
        index.jobs.insert(id, Arc::new(JobCell::new(job)));
        debug!("Created job {}", id);
        Ok(id)
    }

    pub fn get(&self, id: JobId) -> Result<Arc<Job>, StoreError> {
        Ok(self.cell(id)?.current())
    }

    pub fn find_by_order(&self, order_id: &str) -> Option<Arc<Job>> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        let id = index.orders.get(order_id)?;
        index.jobs.get(id).map(|cell| cell.current())
    }

    /// Newest first.
    pub fn list(&self, limit: usize) -> Vec<Arc<Job>> {
        let cells: Vec<Arc<JobCell>> = {
            let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
            index.jobs.values().cloned().collect()
        };
        let mut jobs: Vec<Arc<Job>> = cells.iter().map(|cell| cell.current()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        jobs.truncate(limit);
        jobs
    }

    pub fn append_stage(&self, id: JobId, result: StageResult) -> Result<Arc<Job>, StoreError> {
        self.update(id, |job| {
            job.stage_history.push(result);
            Ok(())
        })
    }

    pub fn set_status(&self, id: JobId, status: JobStatus) -> Result<Arc<Job>, StoreError> {
        self.update(id, |job| {
            transition(job, status);
            Ok(())
        })
    }

    /// Applies `mutate` to a private copy under the job's writer lock and
    /// publishes it as the new snapshot. A status change made by `mutate` is
    /// checked against the state machine; stage history may only grow.
    pub fn update<F>(&self, id: JobId, mutate: F) -> Result<Arc<Job>, StoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), StoreError>,
    {
        let cell = self.cell(id)?;
        let _writer = cell.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let current = cell.current();
        if current.status.is_terminal() {
            return Err(StoreError::Terminal(id));
        }

        let mut next = Job::clone(&current);
        mutate(&mut next)?;

        if next.status != current.status && !current.status.can_transition_to(&next.status) {
            return Err(StoreError::InvalidTransition {
                id,
                from: current.status.clone(),
                to: next.status,
            });
        }
        if next.stage_history.len() < current.stage_history.len()
            || next.stage_history[..current.stage_history.len()] != current.stage_history[..]
        {
            return Err(StoreError::HistoryRewrite(id));
        }

        self.publish(&cell, next)
    }

    /// Records a rating for the job. Unlike [`JobStore::update`] this also
    /// works once the job is terminal, which is when customers rate it.
    pub fn add_feedback(
        &self,
        id: JobId,
        rating: u8,
        comment: impl Into<String>,
    ) -> Result<Feedback, StoreError> {
        if !(1..=5).contains(&rating) {
            return Err(StoreError::InvalidRating(rating));
        }
        let cell = self.cell(id)?;
        let _writer = cell.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let feedback = Feedback {
            rating,
            comment: comment.into(),
            created_at: Utc::now(),
        };
        let mut next = Job::clone(&cell.current());
        next.feedback.push(feedback.clone());
        self.publish(&cell, next)?;
        debug!("Job {} rated {}/5", id, rating);
        Ok(feedback)
    }

    /// Most recent feedback; later entries win ties.
    pub fn latest_feedback(&self, id: JobId) -> Result<Option<Feedback>, StoreError> {
        Ok(self
            .get(id)?
            .feedback
            .iter()
            .max_by_key(|feedback| feedback.created_at)
            .cloned())
    }

    /// Journals `next` and swaps it in. Callers hold the job's writer lock.
    fn publish(&self, cell: &JobCell, mut next: Job) -> Result<Arc<Job>, StoreError> {
        next.updated_at = Utc::now();
        if let Some(journal) = &self.journal {
            journal.write(&next)?;
        }

        let next = Arc::new(next);
        *cell.snapshot.write().unwrap_or_else(PoisonError::into_inner) = next.clone();
        Ok(next)
    }

    fn cell(&self, id: JobId) -> Result<Arc<JobCell>, StoreError> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .jobs
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }
}

/// Moves `job` to `status`, keeping the `error` field in sync with failures.
pub(crate) fn transition(job: &mut Job, status: JobStatus) {
    if let JobStatus::Failed(reason) = &status {
        job.error = Some(reason.to_string());
    }
    job.status = status;
}

struct Journal {
    dir: PathBuf,
}

impl Journal {
    fn new(dir: PathBuf) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: JobId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Write-then-rename so a crash never leaves a half-written record.
    fn write(&self, job: &Job) -> Result<(), StoreError> {
        let path = self.path_for(job.id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(job)?;
        std::fs::write(&tmp, bytes).map_err(|source| io_error(&tmp, source))?;
        std::fs::rename(&tmp, &path).map_err(|source| io_error(&path, source))
    }

    fn load_all(&self) -> Result<Vec<Job>, StoreError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| io_error(&self.dir, source))?;
        let mut jobs = Vec::new();
        for entry in entries {
            let path = entry.map_err(|source| io_error(&self.dir, source))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = std::fs::read(&path).map_err(|source| io_error(&path, source))?;
            jobs.push(serde_json::from_slice(&bytes)?);
        }
        Ok(jobs)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}
