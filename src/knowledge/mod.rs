//! Knowledge preservation.
//!
//! Every pipeline outcome, successful or not, ends up here as an
//! append-only [`KnowledgeArtifact`]. The log is the durable system of
//! record: artifacts are never edited or removed, and a gap with a passing
//! approved artifact is treated as resolved on re-entry.

mod report;
mod store;

pub use report::{render_markdown, EffectivenessMetrics};
pub use store::{JsonlStore, KnowledgeStore, MemoryStore};

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::Result;
use crate::decision::{Decision, DecisionState};
use crate::quality::QualityReport;
use crate::safety::ArchiveReference;
use crate::workflow::PipelineStage;

/// How the pipeline for a gap ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArtifactOutcome {
    /// Work passed validation and was archived
    Completed,
    /// The approver declined every approach
    Rejected,
    /// Nobody answered before the deadline
    TimedOut,
    /// A stage failed
    Failed { stage: PipelineStage, error: String },
}

impl ArtifactOutcome {
    /// Short label for listings.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::TimedOut => "timed-out",
            Self::Failed { .. } => "failed",
        }
    }
}

/// A preserved record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeArtifact {
    /// Monotonic id assigned by the store
    pub sequence: u64,

    /// Gap the record is about
    pub gap_id: String,

    /// Decision taken, if the pipeline got that far
    #[serde(default)]
    pub decision: Option<Decision>,

    /// Final outcome
    pub outcome: ArtifactOutcome,

    /// Quality reports, one per attempt, oldest first
    #[serde(default)]
    pub quality_reports: Vec<QualityReport>,

    /// Free-form documentation
    #[serde(default)]
    pub notes: String,

    /// Where the work was archived
    #[serde(default)]
    pub archive: Option<ArchiveReference>,

    /// When the store accepted the record
    pub recorded_at: DateTime<Utc>,
}

impl KnowledgeArtifact {
    /// Completed with a passing final report.
    pub fn passed(&self) -> bool {
        self.outcome == ArtifactOutcome::Completed
            && self.quality_reports.last().map_or(true, |r| r.passed)
    }

    /// Whether this record resolves its gap.
    pub fn resolves_gap(&self) -> bool {
        self.passed() && self.decision.as_ref().is_some_and(Decision::is_approved)
    }
}

/// A record waiting for its sequence id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDraft {
    pub gap_id: String,
    pub decision: Option<Decision>,
    pub outcome: ArtifactOutcome,
    pub quality_reports: Vec<QualityReport>,
    pub notes: String,
    pub archive: Option<ArchiveReference>,
}

impl ArtifactDraft {
    /// Start a draft.
    pub fn new(gap_id: impl Into<String>, outcome: ArtifactOutcome) -> Self {
        Self {
            gap_id: gap_id.into(),
            decision: None,
            outcome,
            quality_reports: Vec::new(),
            notes: String::new(),
            archive: None,
        }
    }

    pub fn with_decision(mut self, decision: Decision) -> Self {
        self.decision = Some(decision);
        self
    }

    pub fn with_reports(mut self, reports: Vec<QualityReport>) -> Self {
        self.quality_reports = reports;
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn with_archive(mut self, archive: ArchiveReference) -> Self {
        self.archive = Some(archive);
        self
    }

    pub(crate) fn into_artifact(self, sequence: u64, recorded_at: DateTime<Utc>) -> KnowledgeArtifact {
        KnowledgeArtifact {
            sequence,
            gap_id: self.gap_id,
            decision: self.decision,
            outcome: self.outcome,
            quality_reports: self.quality_reports,
            notes: self.notes,
            archive: self.archive,
            recorded_at,
        }
    }
}

/// Selects artifacts from the log. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnowledgeFilter {
    pub gap_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub passed: Option<bool>,
}

impl KnowledgeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gap(mut self, gap_id: impl Into<String>) -> Self {
        self.gap_id = Some(gap_id.into());
        self
    }

    /// Inclusive lower bound on `recorded_at`.
    pub fn since(mut self, at: DateTime<Utc>) -> Self {
        self.since = Some(at);
        self
    }

    /// Exclusive upper bound on `recorded_at`.
    pub fn until(mut self, at: DateTime<Utc>) -> Self {
        self.until = Some(at);
        self
    }

    pub fn passed(mut self, passed: bool) -> Self {
        self.passed = Some(passed);
        self
    }

    /// Whether `artifact` matches every set criterion.
    pub fn matches(&self, artifact: &KnowledgeArtifact) -> bool {
        self.gap_id.as_ref().map_or(true, |g| &artifact.gap_id == g)
            && self.since.map_or(true, |t| artifact.recorded_at >= t)
            && self.until.map_or(true, |t| artifact.recorded_at < t)
            && self.passed.map_or(true, |p| artifact.passed() == p)
    }
}

/// Front end over a [`KnowledgeStore`].
#[derive(Clone)]
pub struct KnowledgePreserver {
    store: Arc<dyn KnowledgeStore>,
}

impl KnowledgePreserver {
    /// Preserve into `store`.
    pub fn new(store: Arc<dyn KnowledgeStore>) -> Self {
        Self { store }
    }

    /// In-memory log.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// JSON-lines log at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(JsonlStore::new(path)))
    }

    /// Append a record.
    pub fn record(&self, draft: ArtifactDraft) -> Result<KnowledgeArtifact> {
        let artifact = self.store.append(draft)?;
        tracing::info!(
            sequence = artifact.sequence,
            gap = %artifact.gap_id,
            outcome = artifact.outcome.label(),
            store = self.store.name(),
            "Knowledge recorded"
        );
        Ok(artifact)
    }

    /// Record a resolved decision with its quality history.
    ///
    /// The outcome follows from the decision: approved work whose last report
    /// failed is recorded as a validation failure.
    pub fn record_decision(
        &self,
        decision: &Decision,
        reports: Vec<QualityReport>,
        notes: impl Into<String>,
    ) -> Result<KnowledgeArtifact> {
        let outcome = match decision.state() {
            DecisionState::Rejected => ArtifactOutcome::Rejected,
            DecisionState::TimedOut => ArtifactOutcome::TimedOut,
            _ if reports.last().is_some_and(|r| !r.passed) => ArtifactOutcome::Failed {
                stage: PipelineStage::Validation,
                error: "quality gate not met".to_string(),
            },
            _ => ArtifactOutcome::Completed,
        };

        self.record(
            ArtifactDraft::new(decision.gap_id(), outcome)
                .with_decision(decision.clone())
                .with_reports(reports)
                .with_notes(notes),
        )
    }

    /// Every artifact, in sequence order.
    pub fn all(&self) -> Result<Vec<KnowledgeArtifact>> {
        self.store.load_all()
    }

    /// Artifacts matching `filter`, in sequence order.
    pub fn query(&self, filter: &KnowledgeFilter) -> Result<Vec<KnowledgeArtifact>> {
        Ok(self.store.load_all()?.into_iter().filter(|a| filter.matches(a)).collect())
    }

    /// The latest artifact that resolves `gap_id`, if any.
    pub fn resolved(&self, gap_id: &str) -> Result<Option<KnowledgeArtifact>> {
        let filter = KnowledgeFilter::new().gap(gap_id).passed(true);
        Ok(self.query(&filter)?.into_iter().rev().find(KnowledgeArtifact::resolves_gap))
    }

    /// Metrics over the whole log.
    pub fn metrics(&self) -> Result<EffectivenessMetrics> {
        Ok(EffectivenessMetrics::from_artifacts(&self.all()?))
    }

    /// The whole log as markdown.
    pub fn render_markdown(&self) -> Result<String> {
        Ok(render_markdown(&self.all()?))
    }
}

impl Default for KnowledgePreserver {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl std::fmt::Debug for KnowledgePreserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgePreserver").field("store", &self.store.name()).finish()
    }
}
