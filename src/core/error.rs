//! Engine error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::quality::QualityReport;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while assessing a project or driving a gap pipeline.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The discovery root does not exist or cannot be read.
    #[error("Workspace root {path} is not readable: {source}")]
    RootUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An objective failed validation.
    #[error("Invalid objective: {0}")]
    InvalidObjective(String),

    /// Approach generation could not satisfy its cardinality policy.
    #[error("Approach generation failed for gap '{gap}': {reason}")]
    ApproachGeneration { gap: String, reason: String },

    /// A selection named an approach outside the considered set.
    #[error("Approach '{approach}' is not part of decision {decision}")]
    InvalidSelection { decision: String, approach: String },

    /// The decision is already resolved and accepts no further input.
    #[error("Decision {0} is already resolved")]
    DecisionClosed(String),

    /// Another pipeline already holds this gap.
    #[error("Gap '{0}' already has a decision in flight")]
    GapBusy(String),

    /// Implementation was requested for a decision that is not approved.
    #[error("Decision {0} is not approved")]
    NotApproved(String),

    /// The decision request was rejected by the approver.
    #[error("Decision {decision} was rejected: {reason}")]
    Rejected { decision: String, reason: String },

    /// The approval deadline elapsed without an answer.
    #[error("Decision {0} timed out awaiting approval")]
    TimedOut(String),

    /// The approval channel could not deliver a decision request.
    #[error("Approval channel '{channel}' failed: {reason}")]
    ApprovalChannel { channel: String, reason: String },

    /// Workspace provisioning failed.
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    /// A workspace path tried to leave the workspace root.
    #[error("Path {0} escapes the workspace")]
    PathEscape(PathBuf),

    /// The implementer reported a failure.
    #[error("Implementation failed: {0}")]
    Implementation(String),

    /// Quality validation kept failing until the attempt limit was hit.
    #[error("Quality validation failed after {attempts} attempt(s)")]
    QualityFailure { attempts: u32, reports: Vec<QualityReport> },

    /// A pipeline worker task panicked or was cancelled.
    #[error("Pipeline task failed: {0}")]
    Task(String),

    /// The knowledge log rejected an operation.
    #[error("Knowledge log error: {0}")]
    Knowledge(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether the caller may retry the same operation without the pipeline
    /// being aborted.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidSelection { .. })
    }

    /// Quality reports attached to a quality failure, oldest first.
    pub fn quality_history(&self) -> &[QualityReport] {
        match self {
            Self::QualityFailure { reports, .. } => reports,
            _ => &[],
        }
    }
}

/// Errors raised while acquiring an isolated workspace.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// The workspace path is already taken.
    #[error("Workspace path {0} already exists")]
    Collision(PathBuf),

    /// The decision already owns a live workspace.
    #[error("Decision {0} already owns a workspace")]
    AlreadyProvisioned(String),

    /// Filesystem failure while creating or populating the workspace.
    #[error("Failed to provision {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_invalid_selection_is_recoverable() {
        let selection =
            EngineError::InvalidSelection { decision: "d1".into(), approach: "x".into() };
        assert!(selection.is_recoverable());

        assert!(!EngineError::TimedOut("d1".into()).is_recoverable());
        assert!(!EngineError::GapBusy("auth".into()).is_recoverable());
        assert!(!EngineError::from(ProvisioningError::Collision("/tmp/x".into())).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = EngineError::InvalidSelection { decision: "d1".into(), approach: "ghost".into() };
        assert_eq!(err.to_string(), "Approach 'ghost' is not part of decision d1");

        let err = EngineError::from(ProvisioningError::AlreadyProvisioned("d2".into()));
        assert_eq!(err.to_string(), "Decision d2 already owns a workspace");
    }

    #[test]
    fn test_quality_history_empty_for_other_errors() {
        assert!(EngineError::Config("bad".into()).quality_history().is_empty());
    }
}
