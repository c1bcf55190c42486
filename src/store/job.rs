use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use super::status::{FailureReason, JobStatus};
use crate::export::PuzzleSize;
use crate::quality::QualityReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(JobId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Consent,
    Preprocess,
    Transform,
    IdentityFix,
    QualityScoring,
    Upscale,
    Export,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Consent => "consent",
            Stage::Preprocess => "preprocess",
            Stage::Transform => "transform",
            Stage::IdentityFix => "identity_fix",
            Stage::QualityScoring => "quality_scoring",
            Stage::Upscale => "upscale",
            Stage::Export => "export",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    Skipped,
    FailedNonFatal,
    FailedFatal,
}

impl StageOutcome {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StageOutcome::FailedFatal)
    }
}

/// One entry of a job's stage history. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub attempt: u32,
    pub outcome: StageOutcome,
    pub duration_ms: u64,
    pub cost: f64,
    pub output: Option<String>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub finished_at: DateTime<Utc>,
}

impl StageResult {
    pub fn new(stage: Stage, attempt: u32, outcome: StageOutcome) -> Self {
        Self {
            stage,
            attempt,
            outcome,
            duration_ms: 0,
            cost: 0.0,
            output: None,
            error: None,
            seed: None,
            finished_at: Utc::now(),
        }
    }

    pub fn success(stage: Stage, attempt: u32) -> Self {
        Self::new(stage, attempt, StageOutcome::Success)
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_output(mut self, uri: impl Into<String>) -> Self {
        self.output = Some(uri.into());
        self
    }

    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Preview,
    PrintReady,
    Generated,
    Upscaled,
    InputResized,
    FaceCrop,
}

impl ArtifactKind {
    pub fn name(&self) -> &'static str {
        match self {
            ArtifactKind::Preview => "preview",
            ArtifactKind::PrintReady => "print_ready",
            ArtifactKind::Generated => "generated",
            ArtifactKind::Upscaled => "upscaled",
            ArtifactKind::InputResized => "input_resized",
            ArtifactKind::FaceCrop => "face_crop",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A written image. A later attempt writes a new artifact rather than
/// replacing an old one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub attempt: u32,
    pub stage: Stage,
    pub uri: String,
    pub checksum: Option<String>,
    pub width: u32,
    pub height: u32,
    pub created_at: DateTime<Utc>,
}

/// A customer's verdict on a job's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub rating: u8,
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

/// What a caller asks for when submitting an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub order_id: String,
    pub photo: String,
    pub style_key: String,
    pub subject: String,
    pub puzzle_size: PuzzleSize,
    pub backend_id: String,
    #[serde(default)]
    pub skip_consent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub order_id: String,
    pub photo: String,
    pub style_key: String,
    pub subject: String,
    pub puzzle_size: PuzzleSize,
    pub backend_id: String,
    pub skip_consent: bool,
    pub status: JobStatus,
    pub stage_history: Vec<StageResult>,
    pub quality_reports: Vec<QualityReport>,
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub feedback: Vec<Feedback>,
    /// URI of the image the next stage consumes.
    pub working_uri: Option<String>,
    pub selected_attempt: Option<u32>,
    pub below_threshold: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(request: JobRequest) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            order_id: request.order_id,
            photo: request.photo,
            style_key: request.style_key,
            subject: request.subject,
            puzzle_size: request.puzzle_size,
            backend_id: request.backend_id,
            skip_consent: request.skip_consent,
            status: JobStatus::Created,
            stage_history: Vec::new(),
            quality_reports: Vec::new(),
            artifacts: Vec::new(),
            feedback: Vec::new(),
            working_uri: None,
            selected_attempt: None,
            below_threshold: false,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Index of the transform attempt currently in flight (or next to run).
    pub fn current_attempt(&self) -> u32 {
        self.quality_reports.len() as u32
    }

    pub fn total_cost(&self) -> f64 {
        self.stage_history.iter().map(|result| result.cost).sum()
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        match &self.status {
            JobStatus::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Highest composite score wins; ties go to the earliest attempt.
    pub fn best_report(&self) -> Option<&QualityReport> {
        self.quality_reports.iter().fold(None, |best, report| match best {
            Some(current) if current.composite >= report.composite => Some(current),
            _ => Some(report),
        })
    }

    pub fn latest_artifact(&self, kind: ArtifactKind, attempt: u32) -> Option<&Artifact> {
        self.artifacts
            .iter()
            .rev()
            .find(|artifact| artifact.kind == kind && artifact.attempt == attempt)
    }

    /// Artifacts surfaced to callers: only once the job completed, and only
    /// those belonging to the selected attempt.
    pub fn final_artifacts(&self) -> IndexMap<ArtifactKind, &Artifact> {
        let mut outputs = IndexMap::new();
        if self.status != JobStatus::Completed {
            return outputs;
        }
        let Some(selected) = self.selected_attempt else {
            return outputs;
        };

        for artifact in &self.artifacts {
            let belongs = artifact.kind == ArtifactKind::InputResized || artifact.attempt == selected;
            if belongs {
                outputs.insert(artifact.kind, artifact);
            }
        }
        outputs
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            order_id: self.order_id.clone(),
            status: self.status.clone(),
            style_key: self.style_key.clone(),
            backend_id: self.backend_id.clone(),
            stages_run: self.stage_history.len(),
            attempts: self.quality_reports.len(),
            best_composite: self.best_report().map(|report| report.composite),
            below_threshold: self.below_threshold,
            total_cost: self.total_cost(),
            artifacts: self
                .final_artifacts()
                .into_iter()
                .map(|(kind, artifact)| (kind, artifact.uri.clone()))
                .collect(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Poll-friendly view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub order_id: String,
    pub status: JobStatus,
    pub style_key: String,
    pub backend_id: String,
    pub stages_run: usize,
    pub attempts: usize,
    pub best_composite: Option<f64>,
    pub below_threshold: bool,
    pub total_cost: f64,
    pub artifacts: IndexMap<ArtifactKind, String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{report, request};

    fn artifact(kind: ArtifactKind, attempt: u32, uri: &str) -> Artifact {
        Artifact {
            kind,
            attempt,
            stage: Stage::Transform,
            uri: uri.to_string(),
            checksum: None,
            width: 1,
            height: 1,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_best_report_prefers_earliest_on_tie() {
        let mut job = Job::new(request("ORDER-1"));
        job.quality_reports = vec![report(0, 61.0), report(1, 64.5), report(2, 64.5)];
        assert_eq!(job.best_report().unwrap().attempt, 1);
    }

    #[test]
    fn test_best_report_empty() {
        let job = Job::new(request("ORDER-1"));
        assert!(job.best_report().is_none());
    }

    #[test]
    fn test_final_artifacts_hidden_until_completed() {
        let mut job = Job::new(request("ORDER-1"));
        job.artifacts.push(artifact(ArtifactKind::Generated, 0, "mem://g0"));
        job.selected_attempt = Some(0);
        job.status = JobStatus::Exporting;
        assert!(job.final_artifacts().is_empty());
        assert!(job.summary().artifacts.is_empty());
    }

    #[test]
    fn test_final_artifacts_only_from_selected_attempt() {
        let mut job = Job::new(request("ORDER-1"));
        job.artifacts = vec![
            artifact(ArtifactKind::InputResized, 0, "mem://input"),
            artifact(ArtifactKind::Generated, 0, "mem://g0"),
            artifact(ArtifactKind::Generated, 1, "mem://g1"),
            artifact(ArtifactKind::Upscaled, 0, "mem://u0"),
            artifact(ArtifactKind::PrintReady, 0, "mem://p0"),
        ];
        job.selected_attempt = Some(0);
        job.status = JobStatus::Completed;

        let outputs = job.summary().artifacts;
        assert_eq!(outputs[&ArtifactKind::Generated], "mem://g0");
        assert_eq!(outputs[&ArtifactKind::InputResized], "mem://input");
        assert_eq!(outputs[&ArtifactKind::PrintReady], "mem://p0");
        assert_eq!(outputs.len(), 4);
    }

    #[test]
    fn test_total_cost_sums_stage_costs() {
        let mut job = Job::new(request("ORDER-1"));
        job.stage_history.push(StageResult::success(Stage::Transform, 0).with_cost(0.04));
        job.stage_history.push(StageResult::success(Stage::IdentityFix, 0).with_cost(0.003));
        assert!((job.total_cost() - 0.043).abs() < 1e-12);
    }

    #[test]
    fn test_job_id_round_trips_through_string() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
