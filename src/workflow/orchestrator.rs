//! Gap pipeline orchestration.

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use super::{
    Assessment, BacklogEntry, ImplementationContext, Implementer, PipelineFailure, PipelineOutcome,
    PipelineResult, PipelineStage,
};
use crate::analysis::{Gap, GapAnalyzer, Objective};
use crate::approach::ApproachGenerator;
use crate::core::{Config, EngineError, Result};
use crate::decision::{ApprovalChannel, Decision, DecisionFacilitator, DecisionOutcome};
use crate::discovery::{AssetDiscoveryEngine, AssetStore, Inventory, InventoryDelta};
use crate::knowledge::{ArtifactDraft, ArtifactOutcome, KnowledgePreserver};
use crate::quality::{QualityReport, QualityValidator};
use crate::safety::{ArchiveReference, SafetyEnvironmentManager, Workspace};

/// Where a pipeline got to before it stopped.
#[derive(Debug)]
struct Progress {
    stage: PipelineStage,
    decision: Option<Decision>,
    reports: Vec<QualityReport>,
}

impl Progress {
    fn new() -> Self {
        Self { stage: PipelineStage::ApproachGeneration, decision: None, reports: Vec::new() }
    }
}

/// Exclusive hold on a gap for the lifetime of one pipeline.
struct GapLease<'a> {
    leases: &'a Mutex<HashSet<String>>,
    gap_id: String,
}

impl<'a> GapLease<'a> {
    fn acquire(leases: &'a Mutex<HashSet<String>>, gap_id: &str) -> Option<Self> {
        leases.lock().insert(gap_id.to_string()).then(|| Self { leases, gap_id: gap_id.to_string() })
    }
}

impl Drop for GapLease<'_> {
    fn drop(&mut self) {
        self.leases.lock().remove(&self.gap_id);
    }
}

/// Runs gaps through discovery, decision, implementation, validation and
/// preservation.
///
/// Pipelines for different gaps run concurrently; a gap never has more than
/// one pipeline in flight. Every pipeline ends with a knowledge record,
/// whether it completed or not.
pub struct WorkflowOrchestrator {
    config: Config,
    discovery: AssetDiscoveryEngine,
    assets: AssetStore,
    analyzer: GapAnalyzer,
    generator: ApproachGenerator,
    facilitator: DecisionFacilitator,
    safety: SafetyEnvironmentManager,
    validator: QualityValidator,
    knowledge: KnowledgePreserver,
    channel: Arc<dyn ApprovalChannel>,
    implementer: Arc<dyn Implementer>,
    leases: Mutex<HashSet<String>>,
    backlog: Mutex<Vec<BacklogEntry>>,
}

impl WorkflowOrchestrator {
    /// Build an orchestrator from `config`, with an in-memory knowledge log.
    pub fn new(
        config: Config,
        channel: Arc<dyn ApprovalChannel>,
        implementer: Arc<dyn Implementer>,
    ) -> Self {
        Self {
            discovery: AssetDiscoveryEngine::new(config.discovery.clone()),
            assets: AssetStore::default(),
            analyzer: GapAnalyzer::new(),
            generator: ApproachGenerator::new(config.approaches.clone()),
            facilitator: DecisionFacilitator::new(config.decision.clone()),
            safety: SafetyEnvironmentManager::new(config.safety.clone()),
            validator: QualityValidator::new(config.quality.clone()),
            knowledge: KnowledgePreserver::in_memory(),
            channel,
            implementer,
            leases: Mutex::new(HashSet::new()),
            backlog: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Preserve into `knowledge` instead of the in-memory log.
    pub fn with_knowledge(mut self, knowledge: KnowledgePreserver) -> Self {
        self.knowledge = knowledge;
        self
    }

    /// Replace the quality validator.
    pub fn with_validator(mut self, validator: QualityValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Replace the discovery engine.
    pub fn with_discovery(mut self, discovery: AssetDiscoveryEngine) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn knowledge(&self) -> &KnowledgePreserver {
        &self.knowledge
    }

    pub fn safety(&self) -> &SafetyEnvironmentManager {
        &self.safety
    }

    pub fn facilitator(&self) -> &DecisionFacilitator {
        &self.facilitator
    }

    /// The most recent inventory snapshot.
    pub fn inventory(&self) -> Arc<Inventory> {
        self.assets.snapshot()
    }

    /// Re-scan `root` and publish a new inventory snapshot.
    pub fn discover(&self, root: &Path) -> Result<(Arc<Inventory>, InventoryDelta)> {
        self.assets.rescan(&self.discovery, root)
    }

    /// Gaps in the current snapshot, most severe first.
    pub fn analyze(&self, objectives: &[Objective]) -> Result<Vec<Gap>> {
        self.analyzer.analyze(&self.inventory().assets, objectives)
    }

    /// Discover `root`, then analyze it against `objectives`.
    pub fn assess(&self, root: &Path, objectives: &[Objective]) -> Result<Assessment> {
        let (inventory, delta) = self.discover(root)?;
        let gaps = self.analyzer.analyze(&inventory.assets, objectives)?;
        tracing::info!(
            root = %inventory.root.display(),
            assets = inventory.assets.len(),
            changed = delta.added.len() + delta.removed.len() + delta.changed.len(),
            gaps = gaps.len(),
            "Assessment complete"
        );
        Ok(Assessment { inventory, gaps })
    }

    /// Gaps whose decision timed out, oldest first.
    pub fn backlog(&self) -> Vec<BacklogEntry> {
        self.backlog.lock().clone()
    }

    /// Cancel the decision pending for `gap_id`, if any.
    pub fn cancel(&self, gap_id: &str) -> bool {
        self.facilitator.cancel(gap_id)
    }

    /// Assess `root` and run every gap found.
    pub async fn run(
        self: &Arc<Self>,
        root: &Path,
        objectives: &[Objective],
    ) -> Result<Vec<PipelineResult>> {
        let Assessment { inventory, gaps } = self.assess(root, objectives)?;
        Ok(self.run_all(inventory, gaps).await)
    }

    /// Run several gaps, at most `workflow.max_parallel_gaps` at a time.
    ///
    /// Results come back in the order of `gaps`.
    pub async fn run_all(self: &Arc<Self>, inventory: Arc<Inventory>, gaps: Vec<Gap>) -> Vec<PipelineResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.workflow.max_parallel_gaps.max(1)));
        let submitted = gaps.clone();

        let handles: Vec<_> = gaps
            .into_iter()
            .map(|gap| {
                let this = Arc::clone(self);
                let inventory = Arc::clone(&inventory);
                let semaphore = Arc::clone(&semaphore);
                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    this.run_gap(inventory, &gap).await
                })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .zip(submitted)
            .map(|(joined, gap)| {
                joined.unwrap_or_else(|e| {
                    tracing::error!(gap = %gap.id(), error = %e, "Pipeline task failed");
                    // Stage progress lives in the task; only entry is certain.
                    let progress = Progress { stage: PipelineStage::GapAnalysis, ..Progress::new() };
                    Err(self.abort(&gap, EngineError::Task(e.to_string()), progress))
                })
            })
            .collect()
    }

    /// Drive one gap to a terminal outcome.
    ///
    /// A gap already resolved in the knowledge log is reported without new
    /// work. Anything short of completion is recorded and returned as a
    /// [`PipelineFailure`] naming the furthest stage reached.
    pub async fn run_gap(&self, inventory: Arc<Inventory>, gap: &Gap) -> PipelineResult {
        let Some(_lease) = GapLease::acquire(&self.leases, gap.id()) else {
            return Err(PipelineFailure {
                gap_id: gap.objective_id.clone(),
                stage: PipelineStage::GapAnalysis,
                error: EngineError::GapBusy(gap.objective_id.clone()),
                artifact: None,
            });
        };

        match self.knowledge.resolved(gap.id()) {
            Ok(Some(artifact)) => {
                tracing::info!(gap = %gap.id(), sequence = artifact.sequence, "Gap already resolved");
                return Ok(PipelineOutcome { gap_id: gap.objective_id.clone(), artifact, reused: true });
            }
            Ok(None) => {}
            Err(e) => return Err(self.abort(gap, e, Progress::new())),
        }

        let mut progress = Progress::new();
        let driven = AssertUnwindSafe(self.drive(&inventory, gap, &mut progress)).catch_unwind().await;
        let archive = match driven {
            Ok(Ok(archive)) => archive,
            Ok(Err(e)) => return Err(self.abort(gap, e, progress)),
            Err(panic) => {
                let error = EngineError::Task(format!("panicked: {}", panic_message(panic.as_ref())));
                return Err(self.abort(gap, error, progress));
            }
        };

        progress.stage = PipelineStage::Preservation;
        let notes = format!(
            "{} archived as v{} after {} attempt(s)",
            archive.approach_id,
            archive.version,
            progress.reports.len()
        );
        let mut draft = ArtifactDraft::new(gap.id(), ArtifactOutcome::Completed)
            .with_reports(progress.reports.clone())
            .with_archive(archive)
            .with_notes(notes);
        if let Some(decision) = progress.decision.clone() {
            draft = draft.with_decision(decision);
        }

        match self.knowledge.record(draft) {
            Ok(artifact) => {
                self.backlog.lock().retain(|entry| entry.gap.objective_id != gap.objective_id);
                tracing::info!(gap = %gap.id(), sequence = artifact.sequence, "Pipeline completed");
                Ok(PipelineOutcome { gap_id: gap.objective_id.clone(), artifact, reused: false })
            }
            Err(e) => {
                tracing::error!(gap = %gap.id(), error = %e, "Completed work could not be recorded");
                Err(PipelineFailure {
                    gap_id: gap.objective_id.clone(),
                    stage: PipelineStage::Preservation,
                    error: e,
                    artifact: None,
                })
            }
        }
    }

    async fn drive(
        &self,
        inventory: &Inventory,
        gap: &Gap,
        progress: &mut Progress,
    ) -> Result<ArchiveReference> {
        progress.stage = PipelineStage::ApproachGeneration;
        let approaches = self.generator.generate(gap)?;

        progress.stage = PipelineStage::Decision;
        let pending = self.facilitator.propose(gap, &approaches)?;
        let decision = self.facilitator.resolve(pending, self.channel.as_ref()).await?;
        progress.decision = Some(decision.clone());

        match decision.outcome() {
            DecisionOutcome::Approved { .. } => {}
            DecisionOutcome::Rejected { reason } => {
                return Err(EngineError::Rejected {
                    decision: decision.id().to_string(),
                    reason: reason.clone(),
                });
            }
            DecisionOutcome::TimedOut => {
                self.return_to_backlog(gap, &decision);
                return Err(EngineError::TimedOut(decision.id().to_string()));
            }
        }

        progress.stage = PipelineStage::Provisioning;
        let workspace = self.safety.provision(&decision, gap, inventory)?;

        match self.implement_until_valid(gap, &decision, &workspace, progress).await {
            Ok(()) => {
                progress.stage = PipelineStage::Preservation;
                self.safety.finalize(workspace)
            }
            Err(e) => {
                if let Err(discard) = self.safety.discard(workspace) {
                    tracing::warn!(gap = %gap.id(), error = %discard, "Failed to discard workspace");
                }
                Err(e)
            }
        }
    }

    async fn implement_until_valid(
        &self,
        gap: &Gap,
        decision: &Decision,
        workspace: &Workspace,
        progress: &mut Progress,
    ) -> Result<()> {
        let approach = decision.chosen().ok_or_else(|| EngineError::NotApproved(decision.id().to_string()))?;
        let max_attempts = self.config.quality.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            progress.stage = PipelineStage::Implementation;
            let ctx = ImplementationContext {
                gap,
                approach,
                workspace,
                attempt,
                feedback: progress.reports.last(),
            };
            let artifact = self.implementer.implement(ctx).await?;

            progress.stage = PipelineStage::Validation;
            let report = self.validator.validate(&artifact);
            tracing::info!(
                gap = %gap.id(),
                approach = %approach.id,
                implementer = self.implementer.name(),
                attempt,
                overall = report.overall,
                passed = report.passed,
                "Attempt validated"
            );

            let passed = report.passed;
            progress.reports.push(report);
            if passed {
                return Ok(());
            }
        }

        Err(EngineError::QualityFailure { attempts: max_attempts, reports: progress.reports.clone() })
    }

    fn return_to_backlog(&self, gap: &Gap, decision: &Decision) {
        let mut backlog = self.backlog.lock();
        backlog.retain(|entry| entry.gap.objective_id != gap.objective_id);
        backlog.push(BacklogEntry {
            gap: gap.clone(),
            decision_id: decision.id().to_string(),
            returned_at: Utc::now(),
        });
        tracing::info!(gap = %gap.id(), decision = %decision.id(), "Gap returned to backlog");
    }

    /// Record a stopped pipeline and build its failure report.
    fn abort(&self, gap: &Gap, error: EngineError, progress: Progress) -> PipelineFailure {
        let Progress { stage, decision, reports } = progress;

        let outcome = match &error {
            EngineError::Rejected { .. } => ArtifactOutcome::Rejected,
            EngineError::TimedOut(_) => ArtifactOutcome::TimedOut,
            other => ArtifactOutcome::Failed { stage, error: other.to_string() },
        };

        let notes = match reports.last().and_then(|r| r.remediations.first()) {
            Some(top) => format!("weakest dimension: {} ({:.2})", top.dimension, top.score),
            None if matches!(error, EngineError::TimedOut(_)) => "returned to backlog".to_string(),
            None => String::new(),
        };

        let mut draft = ArtifactDraft::new(gap.id(), outcome).with_reports(reports).with_notes(notes);
        if let Some(decision) = decision {
            draft = draft.with_decision(decision);
        }

        let artifact = match self.knowledge.record(draft) {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                tracing::error!(gap = %gap.id(), error = %e, "Failure could not be recorded");
                None
            }
        };

        tracing::warn!(gap = %gap.id(), stage = %stage, error = %error, "Pipeline stopped");
        PipelineFailure { gap_id: gap.objective_id.clone(), stage, error, artifact }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl std::fmt::Debug for WorkflowOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowOrchestrator")
            .field("channel", &self.channel.name())
            .field("implementer", &self.implementer.name())
            .field("knowledge", &self.knowledge)
            .field("in_flight", &self.leases.lock().len())
            .finish()
    }
}
