//! Quality validation.
//!
//! Scores an artifact along six fixed dimensions and gates it on a weighted
//! average plus a per-dimension floor. Failing reports carry a remediation
//! list ordered by how much each dimension drags the overall score down.

mod rubric;
mod runner;

pub use rubric::{
    default_checks, CheckOutcome, DimensionCheck, DocumentationCheck, ErrorHandlingCheck,
    MaintainabilityCheck, Operation, PerformanceCheck, RubricContext, SecurityCheck,
    TestPresenceCheck,
};
pub use runner::{DeclaredTestRunner, TestRun, TestRunner};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::{QualityConfig, Result};
use crate::safety::Workspace;

/// Slack for float noise at the gate boundaries (0.1 + 0.6 is not 0.7).
const EPS: f64 = 1e-9;

/// A quality dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dimension {
    ErrorHandling,
    Documentation,
    Maintainability,
    TestPresence,
    Performance,
    Security,
}

impl Dimension {
    /// Every dimension, in report order.
    pub const ALL: [Self; 6] = [
        Self::ErrorHandling,
        Self::Documentation,
        Self::Maintainability,
        Self::TestPresence,
        Self::Performance,
        Self::Security,
    ];

    fn weight(self, config: &QualityConfig) -> f64 {
        let w = &config.weights;
        match self {
            Self::ErrorHandling => w.error_handling,
            Self::Documentation => w.documentation,
            Self::Maintainability => w.maintainability,
            Self::TestPresence => w.tests,
            Self::Performance => w.performance,
            Self::Security => w.security,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ErrorHandling => "error-handling",
            Self::Documentation => "documentation",
            Self::Maintainability => "maintainability",
            Self::TestPresence => "test-presence",
            Self::Performance => "performance",
            Self::Security => "security",
        };
        f.write_str(s)
    }
}

/// One file of a produced artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    /// `/`-joined relative path
    pub path: String,

    /// UTF-8 content
    pub content: String,
}

/// Output of an implementation attempt, as seen by the rubric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Artifact name, usually the approach id
    pub name: String,

    /// Files, sorted by path
    pub files: Vec<ArtifactFile>,
}

impl Artifact {
    /// Create an empty artifact.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), files: Vec::new() }
    }

    /// Add a file, keeping files sorted by path.
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        let file = ArtifactFile { path: path.into(), content: content.into() };
        let index = self.files.partition_point(|f| f.path < file.path);
        self.files.insert(index, file);
        self
    }

    /// Collect every UTF-8 file in a workspace. Binary files are skipped.
    pub fn from_workspace(name: impl Into<String>, workspace: &Workspace) -> Result<Self> {
        let mut artifact = Self::new(name);
        for path in workspace.files()? {
            let bytes = std::fs::read(workspace.resolve(&path)?)?;
            if let Ok(content) = String::from_utf8(bytes) {
                artifact.files.push(ArtifactFile { path, content });
            }
        }
        Ok(artifact)
    }

    /// Public operations the rubric expects to be documented and tested.
    pub fn operations(&self) -> Vec<Operation> {
        rubric::public_operations(self)
    }

    /// Test identifiers declared in the artifact.
    pub fn test_ids(&self) -> Vec<String> {
        rubric::test_ids(self)
    }
}

/// What to fix in one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Remediation {
    /// Dimension to improve
    pub dimension: Dimension,

    /// Score the dimension reached
    pub score: f64,

    /// Overall points lost to this dimension
    pub impact: f64,

    /// Whether the dimension is under the hard floor
    pub below_floor: bool,

    /// Concrete actions
    pub actions: Vec<String>,
}

/// Result of validating one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// Artifact name
    pub artifact: String,

    /// Per-dimension scores (0.0 - 1.0)
    pub scores: BTreeMap<Dimension, f64>,

    /// Weighted average of the scores
    pub overall: f64,

    /// Threshold and floor both met
    pub passed: bool,

    /// Fixes, highest impact first; empty when passed
    pub remediations: Vec<Remediation>,

    /// Coverage reported by the test runner
    pub test_coverage: f64,
}

impl QualityReport {
    /// Score for one dimension.
    pub fn score(&self, dimension: Dimension) -> f64 {
        self.scores.get(&dimension).copied().unwrap_or(0.0)
    }

    /// The lowest-scoring dimension.
    pub fn weakest(&self) -> Option<(Dimension, f64)> {
        self.scores.iter().map(|(d, s)| (*d, *s)).min_by(|a, b| a.1.total_cmp(&b.1))
    }
}

/// Runs the rubric.
pub struct QualityValidator {
    config: QualityConfig,
    checks: BTreeMap<Dimension, Box<dyn DimensionCheck>>,
    runner: Arc<dyn TestRunner>,
}

impl QualityValidator {
    /// Validator with the built-in checks and [`DeclaredTestRunner`].
    pub fn new(config: QualityConfig) -> Self {
        let checks = default_checks().into_iter().map(|c| (c.dimension(), c)).collect();
        Self { config, checks, runner: Arc::new(DeclaredTestRunner) }
    }

    /// Use a different test runner.
    pub fn with_runner(mut self, runner: Arc<dyn TestRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Replace the check for the dimension `check` scores.
    pub fn with_check(mut self, check: impl DimensionCheck + 'static) -> Self {
        self.checks.insert(check.dimension(), Box::new(check));
        self
    }

    /// Rubric configuration.
    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Score `artifact`. Deterministic for a given artifact and configuration.
    pub fn validate(&self, artifact: &Artifact) -> QualityReport {
        let ctx = RubricContext { config: &self.config, runner: self.runner.as_ref() };

        let outcomes: BTreeMap<Dimension, CheckOutcome> = Dimension::ALL
            .into_iter()
            .map(|d| {
                let outcome = self
                    .checks
                    .get(&d)
                    .map_or_else(|| CheckOutcome { score: 1.0, findings: Vec::new() }, |c| {
                        c.evaluate(artifact, &ctx)
                    });
                (d, outcome)
            })
            .collect();

        let total_weight = self.config.weights.total();
        let overall = outcomes.iter().map(|(d, o)| d.weight(&self.config) * o.score).sum::<f64>()
            / total_weight;

        let meets_floor = outcomes.values().all(|o| o.score + EPS >= self.config.dimension_floor);
        let passed = overall + EPS >= self.config.pass_threshold && meets_floor;

        let remediations = if passed {
            Vec::new()
        } else {
            self.remediations(&outcomes, total_weight)
        };

        let test_coverage = self.runner.run(&artifact.test_ids()).coverage;

        tracing::debug!(
            artifact = %artifact.name,
            overall,
            passed,
            "Quality validated"
        );

        QualityReport {
            artifact: artifact.name.clone(),
            scores: outcomes.iter().map(|(d, o)| (*d, o.score)).collect(),
            overall,
            passed,
            remediations,
            test_coverage,
        }
    }

    fn remediations(
        &self,
        outcomes: &BTreeMap<Dimension, CheckOutcome>,
        total_weight: f64,
    ) -> Vec<Remediation> {
        let mut remediations: Vec<Remediation> = outcomes
            .iter()
            .filter(|(_, o)| o.score < 1.0)
            .map(|(d, o)| {
                let mut actions = o.findings.clone();
                if actions.is_empty() {
                    actions.push(format!("raise {d} above {:.2}", o.score));
                }
                Remediation {
                    dimension: *d,
                    score: o.score,
                    impact: d.weight(&self.config) * (1.0 - o.score) / total_weight,
                    below_floor: o.score < self.config.dimension_floor,
                    actions,
                }
            })
            .collect();

        // Stable: equal impact keeps dimension order.
        remediations.sort_by(|a, b| b.impact.total_cmp(&a.impact));
        remediations
    }
}

impl Default for QualityValidator {
    fn default() -> Self {
        Self::new(QualityConfig::default())
    }
}

impl fmt::Debug for QualityValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QualityValidator")
            .field("config", &self.config)
            .field("checks", &self.checks.keys().collect::<Vec<_>>())
            .field("runner", &self.runner.name())
            .finish()
    }
}
