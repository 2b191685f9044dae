//! Pipeline Integration Tests
//!
//! Drives whole gaps through the orchestrator: decision, workspace,
//! validation retries, and the knowledge log.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use gapwise::core::{Config, EngineError};
use gapwise::decision::{DecisionState, QueueApproval, ScriptedAnswer, ScriptedApproval};
use gapwise::knowledge::{ArtifactDraft, ArtifactOutcome, KnowledgeFilter, KnowledgePreserver};
use gapwise::quality::{
    Artifact, CheckOutcome, Dimension, DimensionCheck, QualityValidator, RubricContext,
};
use gapwise::safety::tree_digest;
use gapwise::workflow::{
    ImplementationContext, Implementer, PipelineStage, ScaffoldImplementer, WorkflowOrchestrator,
};
use gapwise::Objective;

// ============================================================================
// Fixtures
// ============================================================================

struct Env {
    dir: TempDir,
    config: Config,
}

impl Env {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.safety.workspace_root = dir.path().join("workspaces");
        config.safety.archive_root = dir.path().join("archive");
        fs::create_dir_all(dir.path().join("project")).unwrap();
        Self { dir, config }
    }

    fn root(&self) -> PathBuf {
        self.dir.path().join("project")
    }

    fn write(&self, rel: &str, content: &str) {
        let path = self.root().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

/// Scores every dimension the same fixed value.
struct Fixed(Dimension, f64);

impl DimensionCheck for Fixed {
    fn dimension(&self) -> Dimension {
        self.0
    }

    fn evaluate(&self, _artifact: &Artifact, _ctx: &RubricContext<'_>) -> CheckOutcome {
        CheckOutcome { score: self.1, findings: Vec::new() }
    }
}

/// Scores every dimension with the number written to `score.txt`.
struct ScoreFile(Dimension);

impl DimensionCheck for ScoreFile {
    fn dimension(&self) -> Dimension {
        self.0
    }

    fn evaluate(&self, artifact: &Artifact, _ctx: &RubricContext<'_>) -> CheckOutcome {
        let score = artifact
            .files
            .iter()
            .find(|f| f.path == "score.txt")
            .and_then(|f| f.content.trim().parse().ok())
            .unwrap_or(0.0);
        CheckOutcome { score, findings: vec![format!("scored {score}")] }
    }
}

fn validator<C>(config: &Config, check: impl Fn(Dimension) -> C) -> QualityValidator
where
    C: DimensionCheck + 'static,
{
    Dimension::ALL
        .into_iter()
        .fold(QualityValidator::new(config.quality.clone()), |v, d| v.with_check(check(d)))
}

/// Writes `score.txt` with one score per attempt and remembers whether it saw feedback.
struct ScoreWriter {
    scores: Vec<f64>,
    feedback: Mutex<Vec<bool>>,
}

#[async_trait]
impl Implementer for ScoreWriter {
    fn name(&self) -> &str {
        "score-writer"
    }

    async fn implement(&self, ctx: ImplementationContext<'_>) -> gapwise::Result<Artifact> {
        self.feedback.lock().push(ctx.feedback.is_some());
        let score = self.scores[(ctx.attempt - 1) as usize];
        ctx.workspace.write("score.txt", score.to_string())?;
        ctx.workspace.write("src/auth.rs", format!("// attempt {}\n", ctx.attempt))?;
        Artifact::from_workspace(ctx.approach.id.clone(), ctx.workspace)
    }
}

/// Rewrites every seeded file and adds one of its own.
struct Rewriter;

#[async_trait]
impl Implementer for Rewriter {
    fn name(&self) -> &str {
        "rewriter"
    }

    async fn implement(&self, ctx: ImplementationContext<'_>) -> gapwise::Result<Artifact> {
        for path in ctx.workspace.files()? {
            ctx.workspace.write(&path, "// rewritten in isolation\n")?;
        }
        ctx.workspace.write("src/auth/session.rs", "pub fn session() {}\n")?;
        Artifact::from_workspace(ctx.approach.id.clone(), ctx.workspace)
    }
}

// ============================================================================
// Decision Scenarios
// ============================================================================

#[tokio::test]
async fn test_second_approach_approved_and_recorded_next() {
    let env = Env::new();
    let knowledge = KnowledgePreserver::in_memory();
    knowledge.record(ArtifactDraft::new("billing", ArtifactOutcome::Rejected)).unwrap();
    knowledge.record(ArtifactDraft::new("search", ArtifactOutcome::TimedOut)).unwrap();

    let (channel, mut tickets) = QueueApproval::new();
    let orch = WorkflowOrchestrator::new(env.config.clone(), Arc::new(channel), Arc::new(ScaffoldImplementer::new()))
        .with_knowledge(knowledge.clone())
        .with_validator(validator(&env.config, |d| Fixed(d, 0.75)));

    let assessment = orch.assess(&env.root(), &[Objective::new("auth", 0.8)]).unwrap();
    assert!(assessment.inventory.assets.is_empty());
    assert_eq!(assessment.gaps.len(), 1);
    let gap = assessment.gaps[0].clone();
    assert!((gap.severity - 0.8).abs() < 1e-9);

    let approver = tokio::spawn(async move {
        let ticket = tickets.recv().await.unwrap();
        assert!((3..=5).contains(&ticket.request.approaches.len()));
        // An unknown id is refused and the decision keeps waiting.
        assert!(ticket.handle.select("no-such-approach", "reviewer").is_err());
        assert_eq!(ticket.handle.state(), DecisionState::AwaitingApproval);
        let second = ticket.request.approaches[1].id.clone();
        ticket.handle.select(&second, "reviewer").unwrap();
        second
    });

    let outcome = orch.run_gap(assessment.inventory, &gap).await.unwrap();
    let second = approver.await.unwrap();

    assert!(!outcome.reused);
    assert_eq!(outcome.artifact.sequence, 3);
    assert_eq!(outcome.artifact.outcome, ArtifactOutcome::Completed);

    let decision = outcome.artifact.decision.as_ref().unwrap();
    assert_eq!(decision.state(), DecisionState::Approved);
    assert_eq!(decision.chosen().unwrap().id, second);
    assert_eq!(decision.approver(), Some("reviewer"));
    assert!(decision.considered().iter().any(|a| a.id == second));

    let report = &outcome.artifact.quality_reports[0];
    assert!(report.passed);
    assert!((report.overall - 0.75).abs() < 1e-9);

    let archive = outcome.artifact.archive.as_ref().unwrap();
    assert_eq!(archive.version, 1);
    assert_eq!(archive.approach_id, second);
    assert_eq!(orch.safety().active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_creates_no_workspace() {
    let mut env = Env::new();
    env.config.decision.approval_timeout_secs = 30;

    let orch = WorkflowOrchestrator::new(
        env.config.clone(),
        Arc::new(ScriptedApproval::new(ScriptedAnswer::Silent)),
        Arc::new(ScaffoldImplementer::new()),
    );

    let assessment = orch.assess(&env.root(), &[Objective::new("auth", 0.8)]).unwrap();
    let failure = orch.run_gap(assessment.inventory, &assessment.gaps[0]).await.unwrap_err();

    assert_eq!(failure.stage, PipelineStage::Decision);
    assert!(matches!(failure.error, EngineError::TimedOut(_)));

    let artifact = failure.artifact.unwrap();
    assert_eq!(artifact.outcome, ArtifactOutcome::TimedOut);
    assert_eq!(artifact.decision.as_ref().unwrap().state(), DecisionState::TimedOut);
    assert!(artifact.decision.as_ref().unwrap().chosen().is_none());

    assert!(!env.config.safety.workspace_root.exists());
    let backlog = orch.backlog();
    assert_eq!(backlog.len(), 1);
    assert_eq!(backlog[0].gap.id(), "auth");
}

#[tokio::test]
async fn test_quality_failure_carries_every_report() {
    let mut env = Env::new();
    env.config.quality.pass_threshold = 0.7;
    env.config.quality.max_attempts = 2;

    let implementer = Arc::new(ScoreWriter { scores: vec![0.5, 0.6], feedback: Mutex::new(Vec::new()) });
    let orch = WorkflowOrchestrator::new(
        env.config.clone(),
        Arc::new(ScriptedApproval::new(ScriptedAnswer::Recommended)),
        implementer.clone(),
    )
    .with_validator(validator(&env.config, |d| ScoreFile(d)));

    let assessment = orch.assess(&env.root(), &[Objective::new("auth", 0.8)]).unwrap();
    let failure = orch.run_gap(assessment.inventory, &assessment.gaps[0]).await.unwrap_err();

    assert_eq!(failure.stage, PipelineStage::Validation);
    let EngineError::QualityFailure { attempts, reports } = &failure.error else {
        panic!("expected a quality failure, got {:?}", failure.error);
    };
    assert_eq!(*attempts, 2);
    let overall: Vec<f64> = reports.iter().map(|r| r.overall).collect();
    assert!((overall[0] - 0.5).abs() < 1e-9);
    assert!((overall[1] - 0.6).abs() < 1e-9);
    assert!(reports.iter().all(|r| !r.passed));

    assert_eq!(*implementer.feedback.lock(), vec![false, true]);

    let artifact = failure.artifact.unwrap();
    assert_eq!(artifact.quality_reports.len(), 2);
    assert!(matches!(artifact.outcome, ArtifactOutcome::Failed { stage: PipelineStage::Validation, .. }));
    assert!(artifact.archive.is_none());
    assert_eq!(orch.safety().active_count(), 0);
    assert!(orch.safety().archives("auth").unwrap().is_empty());
}

// ============================================================================
// Isolation Tests
// ============================================================================

#[tokio::test]
async fn test_canonical_tree_is_never_mutated() {
    let env = Env::new();
    env.write("src/auth/login.rs", "// capability: auth\npub fn login() {}\n");
    env.write("README.md", "# demo\n");
    let before = tree_digest(&env.root()).unwrap();

    let orch = WorkflowOrchestrator::new(
        env.config.clone(),
        Arc::new(ScriptedApproval::new(ScriptedAnswer::Recommended)),
        Arc::new(Rewriter),
    )
    .with_validator(validator(&env.config, |d| Fixed(d, 1.0)));

    let objectives = [Objective::new("auth", 1.0).requiring(["auth", "session"])];
    let assessment = orch.assess(&env.root(), &objectives).unwrap();
    let outcome = orch.run_gap(assessment.inventory, &assessment.gaps[0]).await.unwrap();

    assert_eq!(tree_digest(&env.root()).unwrap(), before);

    let archive = outcome.artifact.archive.unwrap();
    let archived: Vec<&str> = archive.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(archived, vec!["src/auth/login.rs", "src/auth/session.rs"]);
    assert_eq!(
        fs::read_to_string(archive.path.join("files/src/auth/login.rs")).unwrap(),
        "// rewritten in isolation\n"
    );
}

#[tokio::test]
async fn test_same_gap_never_runs_twice() {
    let env = Env::new();
    let (channel, mut tickets) = QueueApproval::new();
    let orch = Arc::new(WorkflowOrchestrator::new(
        env.config.clone(),
        Arc::new(channel),
        Arc::new(ScaffoldImplementer::new()),
    ));

    let assessment = orch.assess(&env.root(), &[Objective::new("auth", 0.8)]).unwrap();
    let gap = assessment.gaps[0].clone();

    let first = {
        let orch = Arc::clone(&orch);
        let inventory = Arc::clone(&assessment.inventory);
        let gap = gap.clone();
        tokio::spawn(async move { orch.run_gap(inventory, &gap).await })
    };

    let _ticket = tickets.recv().await.unwrap();
    let busy = orch.run_gap(Arc::clone(&assessment.inventory), &gap).await.unwrap_err();
    assert!(matches!(busy.error, EngineError::GapBusy(_)));
    assert!(busy.artifact.is_none());

    assert!(orch.cancel("auth"));
    assert!(!orch.cancel("auth"));

    let first = first.await.unwrap().unwrap_err();
    assert!(matches!(first.error, EngineError::Rejected { .. }));
    assert_eq!(first.artifact.unwrap().outcome, ArtifactOutcome::Rejected);
}

// ============================================================================
// Parallel Gap Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_gaps_append_in_order() {
    let mut env = Env::new();
    env.config.workflow.max_parallel_gaps = 2;
    let log = env.dir.path().join("knowledge.jsonl");

    let orch = Arc::new(
        WorkflowOrchestrator::new(
            env.config.clone(),
            Arc::new(ScriptedApproval::new(ScriptedAnswer::Recommended)),
            Arc::new(ScaffoldImplementer::new()),
        )
        .with_knowledge(KnowledgePreserver::open(&log))
        .with_validator(validator(&env.config, |d| Fixed(d, 0.9))),
    );

    let objectives: Vec<Objective> = ["auth", "billing", "search", "export"]
        .into_iter()
        .map(|id| Objective::new(id, 0.5))
        .collect();
    let results = orch.run(&env.root(), &objectives).await.unwrap();

    assert_eq!(results.len(), 4);
    assert!(results.iter().all(Result::is_ok));

    let mut sequences: Vec<u64> =
        results.iter().map(|r| r.as_ref().unwrap().artifact.sequence).collect();
    sequences.sort_unstable();
    assert_eq!(sequences, vec![1, 2, 3, 4]);

    let reopened = KnowledgePreserver::open(&log);
    let stored: Vec<u64> = reopened.all().unwrap().iter().map(|a| a.sequence).collect();
    assert_eq!(stored, vec![1, 2, 3, 4]);
    assert_eq!(reopened.query(&KnowledgeFilter::new().gap("search")).unwrap().len(), 1);

    // A second run finds every gap already resolved.
    let again = orch.run(&env.root(), &objectives).await.unwrap();
    assert!(again.iter().all(|r| r.as_ref().is_ok_and(|o| o.reused)));
    assert_eq!(reopened.all().unwrap().len(), 4);
}
