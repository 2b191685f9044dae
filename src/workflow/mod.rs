//! End-to-end gap pipelines.
//!
//! ```text
//! Discovery -> GapAnalysis -> ApproachGeneration -> Decision
//!   -> Provisioning -> Implementation <-> Validation -> Preservation -> Completed
//! ```
//!
//! The orchestrator runs one pipeline per gap, several gaps in parallel, and
//! never two pipelines for the same gap. Whatever happens, the outcome lands
//! in the knowledge log before it is reported to the caller.

mod implementer;
mod orchestrator;

pub use implementer::{ImplementationContext, Implementer, ScaffoldImplementer};
pub use orchestrator::WorkflowOrchestrator;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::Gap;
use crate::core::EngineError;
use crate::discovery::Inventory;
use crate::knowledge::KnowledgeArtifact;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Discovery,
    GapAnalysis,
    ApproachGeneration,
    Decision,
    Provisioning,
    Implementation,
    Validation,
    Preservation,
    Completed,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Discovery => "discovery",
            Self::GapAnalysis => "gap-analysis",
            Self::ApproachGeneration => "approach-generation",
            Self::Decision => "decision",
            Self::Provisioning => "provisioning",
            Self::Implementation => "implementation",
            Self::Validation => "validation",
            Self::Preservation => "preservation",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Inventory snapshot plus the gaps found in it.
#[derive(Debug, Clone)]
pub struct Assessment {
    pub inventory: Arc<Inventory>,
    pub gaps: Vec<Gap>,
}

/// A pipeline that reached `Completed`.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// Gap the pipeline closed
    pub gap_id: String,

    /// The preserved record
    pub artifact: KnowledgeArtifact,

    /// True when an earlier record already resolved the gap and no new work ran
    pub reused: bool,
}

/// A pipeline that stopped early.
#[derive(Debug, Error)]
#[error("gap '{gap_id}' stopped at {stage}: {error}")]
pub struct PipelineFailure {
    /// Gap whose pipeline stopped
    pub gap_id: String,

    /// Furthest stage reached
    pub stage: PipelineStage,

    /// What went wrong
    #[source]
    pub error: EngineError,

    /// The failure record; `None` if the gap was busy or the log refused it
    pub artifact: Option<KnowledgeArtifact>,
}

/// Outcome of one gap's pipeline.
pub type PipelineResult = std::result::Result<PipelineOutcome, PipelineFailure>;

/// A gap waiting to be proposed again after its decision timed out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogEntry {
    /// The gap as it was analyzed
    pub gap: Gap,

    /// Decision that timed out
    pub decision_id: String,

    /// When the gap went back to the backlog
    pub returned_at: DateTime<Utc>,
}
