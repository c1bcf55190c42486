use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    ConsentRequired,
    InvalidInput(String),
    Transform(String),
    Upscale(String),
    DimensionMismatch(String),
    Export(String),
    Internal(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ConsentRequired => write!(f, "consent required"),
            FailureReason::InvalidInput(detail) => write!(f, "invalid input: {}", detail),
            FailureReason::Transform(detail) => write!(f, "transform failed: {}", detail),
            FailureReason::Upscale(detail) => write!(f, "upscale failed: {}", detail),
            FailureReason::DimensionMismatch(detail) => write!(f, "dimension mismatch: {}", detail),
            FailureReason::Export(detail) => write!(f, "export failed: {}", detail),
            FailureReason::Internal(detail) => write!(f, "internal error: {}", detail),
        }
    }
}

/// Lifecycle of a fulfillment job.
///
/// ```text
/// Created -> ConsentVerified -> Preprocessing -> Transforming -> [IdentityFix]
///   -> QualityScoring -> [Regenerating -> Transforming]* -> Upscaling
///   -> Exporting -> Completed
/// ```
///
/// `Failed` and `Cancelled` are reachable from every non-terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    ConsentVerified,
    Preprocessing,
    Transforming,
    IdentityFix,
    QualityScoring,
    Regenerating,
    Upscaling,
    Exporting,
    Completed,
    Failed(FailureReason),
    Cancelled,
}

impl JobStatus {
    pub fn name(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::ConsentVerified => "consent_verified",
            JobStatus::Preprocessing => "preprocessing",
            JobStatus::Transforming => "transforming",
            JobStatus::IdentityFix => "identity_fix",
            JobStatus::QualityScoring => "quality_scoring",
            JobStatus::Regenerating => "regenerating",
            JobStatus::Upscaling => "upscaling",
            JobStatus::Exporting => "exporting",
            JobStatus::Completed => "completed",
            JobStatus::Failed(_) => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed(_) | JobStatus::Cancelled
        )
    }

    /// Edges of the fulfillment state machine. `Regenerating -> Transforming`
    /// is the only backwards edge.
    pub fn can_transition_to(&self, next: &JobStatus) -> bool {
        use JobStatus::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed(_) | Cancelled) {
            return true;
        }

        matches!(
            (self, next),
            (Created, ConsentVerified)
                | (ConsentVerified, Preprocessing)
                | (Preprocessing, Transforming)
                | (Transforming, IdentityFix)
                | (Transforming, QualityScoring)
                | (IdentityFix, QualityScoring)
                | (QualityScoring, Regenerating)
                | (QualityScoring, Upscaling)
                | (Regenerating, Transforming)
                | (Upscaling, Exporting)
                | (Exporting, Completed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Failed(reason) => write!(f, "failed({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_a_chain_of_valid_edges() {
        let path = [
            JobStatus::Created,
            JobStatus::ConsentVerified,
            JobStatus::Preprocessing,
            JobStatus::Transforming,
            JobStatus::IdentityFix,
            JobStatus::QualityScoring,
            JobStatus::Regenerating,
            JobStatus::Transforming,
            JobStatus::QualityScoring,
            JobStatus::Upscaling,
            JobStatus::Exporting,
            JobStatus::Completed,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(&pair[1]),
                "{} -> {} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let failed = JobStatus::Failed(FailureReason::ConsentRequired);
        for terminal in [JobStatus::Completed, JobStatus::Cancelled, failed] {
            assert!(!terminal.can_transition_to(&JobStatus::Transforming));
            assert!(!terminal.can_transition_to(&JobStatus::Cancelled));
            assert!(!terminal.can_transition_to(&JobStatus::Failed(FailureReason::Internal(
                "x".into()
            ))));
        }
    }

    #[test]
    fn test_skipping_stages_is_rejected() {
        assert!(!JobStatus::Created.can_transition_to(&JobStatus::Transforming));
        assert!(!JobStatus::Preprocessing.can_transition_to(&JobStatus::Upscaling));
        assert!(!JobStatus::Upscaling.can_transition_to(&JobStatus::Transforming));
        assert!(!JobStatus::QualityScoring.can_transition_to(&JobStatus::Transforming));
    }

    #[test]
    fn test_failure_and_cancel_reachable_from_running_states() {
        for status in [
            JobStatus::Created,
            JobStatus::Transforming,
            JobStatus::Regenerating,
            JobStatus::Exporting,
        ] {
            assert!(status.can_transition_to(&JobStatus::Cancelled));
            assert!(status.can_transition_to(&JobStatus::Failed(FailureReason::Upscale(
                "boom".into()
            ))));
        }
    }

    #[test]
    fn test_status_serializes_with_reason() {
        let status = JobStatus::Failed(FailureReason::ConsentRequired);
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, r#"{"state":"failed","reason":{"kind":"consent_required"}}"#);
        let back: JobStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }
}
