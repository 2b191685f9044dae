//! Markdown decision log and effectiveness metrics.

use std::fmt::Write;

use serde::{Deserialize, Serialize};

use super::{ArtifactOutcome, KnowledgeArtifact};
use crate::decision::DecisionOutcome;

/// How well the human/engine collaboration is working.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EffectivenessMetrics {
    /// Artifacts in the log
    pub artifacts: usize,

    /// Artifacts that carry a decision
    pub decisions: usize,

    pub approved: usize,
    pub rejected: usize,
    pub timed_out: usize,

    /// Pipelines that archived work
    pub completed: usize,

    /// Pipelines that ended in a failure
    pub failed: usize,

    /// approved / decisions
    pub approval_rate: f64,

    /// Validated artifacts whose final report passed
    pub pass_rate: f64,

    /// Mean validation attempts over validated artifacts
    pub average_attempts: f64,
}

impl EffectivenessMetrics {
    /// Compute metrics over a slice of the log.
    pub fn from_artifacts(artifacts: &[KnowledgeArtifact]) -> Self {
        let mut m = Self { artifacts: artifacts.len(), ..Self::default() };

        let mut validated = 0usize;
        let mut passed = 0usize;
        let mut attempts = 0usize;

        for artifact in artifacts {
            if let Some(decision) = &artifact.decision {
                m.decisions += 1;
                match decision.outcome() {
                    DecisionOutcome::Approved { .. } => m.approved += 1,
                    DecisionOutcome::Rejected { .. } => m.rejected += 1,
                    DecisionOutcome::TimedOut => m.timed_out += 1,
                }
            }

            match artifact.outcome {
                ArtifactOutcome::Completed => m.completed += 1,
                ArtifactOutcome::Failed { .. } => m.failed += 1,
                _ => {}
            }

            if !artifact.quality_reports.is_empty() {
                validated += 1;
                attempts += artifact.quality_reports.len();
                if artifact.quality_reports.last().is_some_and(|r| r.passed) {
                    passed += 1;
                }
            }
        }

        m.approval_rate = ratio(m.approved, m.decisions);
        m.pass_rate = ratio(passed, validated);
        m.average_attempts = ratio(attempts, validated);
        m
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Render the log as a markdown document, oldest entry first.
pub fn render_markdown(artifacts: &[KnowledgeArtifact]) -> String {
    let metrics = EffectivenessMetrics::from_artifacts(artifacts);
    let mut out = String::from("# Knowledge Log\n\n");

    // Writing to a String cannot fail.
    let _ = writeln!(out, "| Metric | Value |\n|---|---|");
    let _ = writeln!(out, "| Artifacts | {} |", metrics.artifacts);
    let _ = writeln!(out, "| Decisions | {} |", metrics.decisions);
    let _ = writeln!(out, "| Approval rate | {:.0}% |", metrics.approval_rate * 100.0);
    let _ = writeln!(out, "| Pass rate | {:.0}% |", metrics.pass_rate * 100.0);
    let _ = writeln!(out, "| Average attempts | {:.2} |", metrics.average_attempts);
    let _ = writeln!(
        out,
        "| Completed / failed / rejected / timed out | {} / {} / {} / {} |",
        metrics.completed, metrics.failed, metrics.rejected, metrics.timed_out
    );

    for artifact in artifacts {
        let _ = writeln!(
            out,
            "\n## #{} {} ({})\n",
            artifact.sequence,
            artifact.gap_id,
            artifact.outcome.label()
        );
        let _ = writeln!(out, "- Recorded: {}", artifact.recorded_at.to_rfc3339());

        if let Some(decision) = &artifact.decision {
            let verdict = match decision.outcome() {
                DecisionOutcome::Approved { approach_id } => format!("approved `{approach_id}`"),
                DecisionOutcome::Rejected { reason } => format!("rejected ({reason})"),
                DecisionOutcome::TimedOut => "timed out".to_string(),
            };
            let by = decision.approver().map(|a| format!(" by {a}")).unwrap_or_default();
            let _ = writeln!(out, "- Decision `{}`: {verdict}{by}", decision.id());
            if let Some(previous) = decision.supersedes() {
                let _ = writeln!(out, "- Supersedes `{previous}`");
            }
            let _ = writeln!(out, "- Rationale: {}", decision.rationale());

            let considered: Vec<String> = decision
                .considered()
                .iter()
                .map(|a| format!("`{}` ({:.2}/{:.2})", a.id, a.benefit, a.risk))
                .collect();
            let _ = writeln!(out, "- Considered (benefit/risk): {}", considered.join(", "));
        }

        for (i, report) in artifact.quality_reports.iter().enumerate() {
            let _ = writeln!(
                out,
                "- Attempt {}: overall {:.2}, {}",
                i + 1,
                report.overall,
                if report.passed { "passed" } else { "failed" }
            );
        }

        if let ArtifactOutcome::Failed { stage, error } = &artifact.outcome {
            let _ = writeln!(out, "- Failed at {stage}: {error}");
        }
        if let Some(archive) = &artifact.archive {
            let _ = writeln!(out, "- Archive: v{} at {}", archive.version, archive.path.display());
        }
        if !artifact.notes.is_empty() {
            let _ = writeln!(out, "- Notes: {}", artifact.notes);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{ArtifactDraft, KnowledgeStore, MemoryStore};
    use crate::quality::{Artifact, QualityValidator};
    use crate::workflow::PipelineStage;

    fn log() -> Vec<KnowledgeArtifact> {
        let store = MemoryStore::new();
        let passing = QualityValidator::default().validate(&Artifact::new("a"));
        let mut failing = passing.clone();
        failing.passed = false;

        store
            .append(ArtifactDraft::new("auth", ArtifactOutcome::Completed).with_reports(vec![failing, passing]))
            .unwrap();
        store
            .append(ArtifactDraft::new("billing", ArtifactOutcome::Failed {
                stage: PipelineStage::Provisioning,
                error: "disk full".into(),
            }))
            .unwrap();
        store.append(ArtifactDraft::new("search", ArtifactOutcome::TimedOut).with_notes("back to backlog")).unwrap();
        store.load_all().unwrap()
    }

    #[test]
    fn test_metrics() {
        let metrics = EffectivenessMetrics::from_artifacts(&log());
        assert_eq!(metrics.artifacts, 3);
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.failed, 1);
        assert!((metrics.pass_rate - 1.0).abs() < f64::EPSILON);
        assert!((metrics.average_attempts - 2.0).abs() < f64::EPSILON);
        assert!(metrics.approval_rate.abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_metrics() {
        assert_eq!(EffectivenessMetrics::from_artifacts(&[]), EffectivenessMetrics::default());
    }

    #[test]
    fn test_render_markdown() {
        let text = render_markdown(&log());
        assert!(text.starts_with("# Knowledge Log"));
        assert!(text.contains("## #1 auth (completed)"));
        assert!(text.contains("- Attempt 2: overall 1.00, passed"));
        assert!(text.contains("- Failed at provisioning: disk full"));
        assert!(text.contains("- Notes: back to backlog"));
    }
}
