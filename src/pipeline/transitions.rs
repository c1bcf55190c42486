//! Pure transition table: which stage a status calls for, and how a finished
//! stage moves the job on. Nothing in here performs IO.

use tracing::warn;

use crate::quality::QualityReport;
use crate::store::{
    transition, Artifact, FailureReason, Job, JobStatus, Stage, StageOutcome, StageResult,
};

/// What the driver should do next for a job in a given status.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Move into `JobStatus` before running anything.
    Enter(JobStatus),
    Run(Stage),
    Done,
}

/// Status names the stage that runs next. `ConsentVerified` and
/// `Regenerating` are resting points between stages.
pub fn plan(status: &JobStatus) -> Step {
    match status {
        JobStatus::Created => Step::Run(Stage::Consent),
        JobStatus::ConsentVerified => Step::Enter(JobStatus::Preprocessing),
        JobStatus::Preprocessing => Step::Run(Stage::Preprocess),
        JobStatus::Transforming => Step::Run(Stage::Transform),
        JobStatus::IdentityFix => Step::Run(Stage::IdentityFix),
        JobStatus::QualityScoring => Step::Run(Stage::QualityScoring),
        JobStatus::Regenerating => Step::Enter(JobStatus::Transforming),
        JobStatus::Upscaling => Step::Run(Stage::Upscale),
        JobStatus::Exporting => Step::Run(Stage::Export),
        JobStatus::Completed | JobStatus::Failed(_) | JobStatus::Cancelled => Step::Done,
    }
}

/// Per-job knobs the transition table needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Policy {
    pub face_fix: bool,
    pub max_extra_attempts: u32,
}

/// Everything one executed stage produced.
#[derive(Debug, Clone)]
pub struct StageRun {
    pub result: StageResult,
    pub artifacts: Vec<Artifact>,
    /// New working image, when the stage replaced it.
    pub working_uri: Option<String>,
    pub report: Option<QualityReport>,
    /// Set exactly when the outcome is `FailedFatal`.
    pub failure: Option<FailureReason>,
}

impl StageRun {
    pub fn new(result: StageResult) -> Self {
        Self {
            result,
            artifacts: Vec::new(),
            working_uri: None,
            report: None,
            failure: None,
        }
    }

    pub fn fatal(result: StageResult, reason: FailureReason) -> Self {
        let mut run = Self::new(result);
        run.result.outcome = StageOutcome::FailedFatal;
        if run.result.error.is_none() {
            run.result.error = Some(reason.to_string());
        }
        run.failure = Some(reason);
        run
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn with_working(mut self, uri: impl Into<String>) -> Self {
        self.working_uri = Some(uri.into());
        self
    }

    pub fn with_report(mut self, report: QualityReport) -> Self {
        self.report = Some(report);
        self
    }
}

/// Folds a finished stage into `job` and moves it to its next status.
pub fn apply(job: &mut Job, run: StageRun, policy: &Policy) {
    let stage = run.result.stage;
    let outcome = run.result.outcome;

    job.stage_history.push(run.result);
    job.artifacts.extend(run.artifacts);
    if let Some(uri) = run.working_uri {
        job.working_uri = Some(uri);
    }
    if let Some(report) = run.report {
        job.quality_reports.push(report);
    }

    if outcome.is_fatal() {
        let reason = run
            .failure
            .unwrap_or_else(|| FailureReason::Internal(format!("{} failed", stage)));
        transition(job, JobStatus::Failed(reason));
        return;
    }

    let next = match stage {
        Stage::Consent => JobStatus::ConsentVerified,
        Stage::Preprocess => JobStatus::Transforming,
        Stage::Transform if policy.face_fix => JobStatus::IdentityFix,
        Stage::Transform | Stage::IdentityFix => JobStatus::QualityScoring,
        Stage::QualityScoring => after_scoring(job, policy),
        Stage::Upscale => JobStatus::Exporting,
        Stage::Export => JobStatus::Completed,
    };
    transition(job, next);
}

/// Bounded regeneration: retry while below threshold and attempts remain,
/// otherwise select the best attempt so far and carry on to upscaling.
fn after_scoring(job: &mut Job, policy: &Policy) -> JobStatus {
    let Some(latest) = job.quality_reports.last() else {
        return JobStatus::Failed(FailureReason::Internal(
            "scoring produced no report".to_string(),
        ));
    };

    if latest.pass {
        let (attempt, uri) = (latest.attempt, latest.artifact_uri.clone());
        select(job, attempt, uri, false);
        return JobStatus::Upscaling;
    }

    let extra_attempts_used = job.quality_reports.len() as u32 - 1;
    if extra_attempts_used < policy.max_extra_attempts {
        return JobStatus::Regenerating;
    }

    let Some(best) = job.best_report() else {
        return JobStatus::Failed(FailureReason::Internal("no attempt to select".to_string()));
    };
    let (attempt, uri, composite) = (best.attempt, best.artifact_uri.clone(), best.composite);
    warn!(
        "Job {} exhausted regeneration; continuing with attempt {} ({:.1}) for manual review",
        job.id, attempt, composite
    );
    select(job, attempt, uri, true);
    JobStatus::Upscaling
}

fn select(job: &mut Job, attempt: u32, uri: String, below_threshold: bool) {
    job.selected_attempt = Some(attempt);
    job.working_uri = Some(uri);
    job.below_threshold = below_threshold;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{report, request};

    const POLICY: Policy = Policy {
        face_fix: true,
        max_extra_attempts: 2,
    };

    fn scored(job: &mut Job, attempt: u32, composite: f64) {
        job.status = JobStatus::QualityScoring;
        let report = report(attempt, composite).for_attempt(attempt, format!("mem://{}", attempt));
        apply(
            job,
            StageRun::new(StageResult::success(Stage::QualityScoring, attempt)).with_report(report),
            &POLICY,
        );
    }

    #[test]
    fn test_plan_covers_every_status() {
        assert_eq!(plan(&JobStatus::Created), Step::Run(Stage::Consent));
        assert_eq!(
            plan(&JobStatus::ConsentVerified),
            Step::Enter(JobStatus::Preprocessing)
        );
        assert_eq!(
            plan(&JobStatus::Regenerating),
            Step::Enter(JobStatus::Transforming)
        );
        assert_eq!(plan(&JobStatus::Exporting), Step::Run(Stage::Export));
        assert_eq!(plan(&JobStatus::Cancelled), Step::Done);
        assert_eq!(
            plan(&JobStatus::Failed(FailureReason::ConsentRequired)),
            Step::Done
        );
    }

    #[test]
    fn test_every_planned_move_is_a_legal_transition() {
        for status in [JobStatus::ConsentVerified, JobStatus::Regenerating] {
            if let Step::Enter(next) = plan(&status) {
                assert!(status.can_transition_to(&next));
            }
        }
    }

    #[test]
    fn test_consent_failure_is_fatal() {
        let mut job = Job::new(request("ORDER-1"));
        let result = StageResult::new(Stage::Consent, 0, StageOutcome::Success);
        apply(
            &mut job,
            StageRun::fatal(result, FailureReason::ConsentRequired),
            &POLICY,
        );
        assert_eq!(job.status, JobStatus::Failed(FailureReason::ConsentRequired));
        assert_eq!(job.stage_history[0].outcome, StageOutcome::FailedFatal);
        assert_eq!(job.error.as_deref(), Some("consent required"));
    }

    #[test]
    fn test_face_fix_flag_routes_transform() {
        let mut job = Job::new(request("ORDER-1"));
        job.status = JobStatus::Transforming;
        apply(
            &mut job,
            StageRun::new(StageResult::success(Stage::Transform, 0)),
            &POLICY,
        );
        assert_eq!(job.status, JobStatus::IdentityFix);

        let mut job = Job::new(request("ORDER-2"));
        job.status = JobStatus::Transforming;
        let no_fix = Policy {
            face_fix: false,
            ..POLICY
        };
        apply(
            &mut job,
            StageRun::new(StageResult::success(Stage::Transform, 0)),
            &no_fix,
        );
        assert_eq!(job.status, JobStatus::QualityScoring);
    }

    #[test]
    fn test_non_fatal_identity_fix_keeps_working_image() {
        let mut job = Job::new(request("ORDER-1"));
        job.status = JobStatus::IdentityFix;
        job.working_uri = Some("mem://generated".to_string());
        let result = StageResult::new(Stage::IdentityFix, 0, StageOutcome::FailedNonFatal)
            .with_error("face swap down");
        apply(&mut job, StageRun::new(result), &POLICY);

        assert_eq!(job.status, JobStatus::QualityScoring);
        assert_eq!(job.working_uri.as_deref(), Some("mem://generated"));
        assert!(job.error.is_none());
    }

    #[test]
    fn test_passing_score_selects_that_attempt() {
        let mut job = Job::new(request("ORDER-1"));
        scored(&mut job, 0, 82.0);
        assert_eq!(job.status, JobStatus::Upscaling);
        assert_eq!(job.selected_attempt, Some(0));
        assert!(!job.below_threshold);
    }

    #[test]
    fn test_regenerates_until_attempts_exhausted() {
        let mut job = Job::new(request("ORDER-1"));
        scored(&mut job, 0, 50.0);
        assert_eq!(job.status, JobStatus::Regenerating);
        scored(&mut job, 1, 66.0);
        assert_eq!(job.status, JobStatus::Regenerating);
        scored(&mut job, 2, 66.0);

        assert_eq!(job.status, JobStatus::Upscaling);
        assert_eq!(job.selected_attempt, Some(1));
        assert_eq!(job.working_uri.as_deref(), Some("mem://1"));
        assert!(job.below_threshold);
    }

    #[test]
    fn test_zero_extra_attempts_never_regenerates() {
        let mut job = Job::new(request("ORDER-1"));
        job.status = JobStatus::QualityScoring;
        let policy = Policy {
            max_extra_attempts: 0,
            ..POLICY
        };
        apply(
            &mut job,
            StageRun::new(StageResult::success(Stage::QualityScoring, 0))
                .with_report(report(0, 10.0).for_attempt(0, "mem://0")),
            &policy,
        );
        assert_eq!(job.status, JobStatus::Upscaling);
        assert!(job.below_threshold);
    }

    #[test]
    fn test_export_completes() {
        let mut job = Job::new(request("ORDER-1"));
        job.status = JobStatus::Exporting;
        apply(
            &mut job,
            StageRun::new(StageResult::success(Stage::Export, 0)),
            &POLICY,
        );
        assert_eq!(job.status, JobStatus::Completed);
    }
}
