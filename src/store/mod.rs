mod job;
mod job_store;
mod status;

pub use job::{
    Artifact, ArtifactKind, Feedback, Job, JobId, JobRequest, JobSummary, Stage, StageOutcome,
    StageResult,
};
pub(crate) use job_store::transition;
pub use job_store::JobStore;
pub use status::{FailureReason, JobStatus};
