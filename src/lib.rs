//! # Gapwise
//!
//! Project assessment and decision workflow engine.
//!
//! Gapwise inventories what a project already has, compares it against a set
//! of weighted objectives, and walks each resulting gap through a pipeline:
//!
//! - **Discovery**: capability-tagged asset inventory with snapshot reads
//! - **Gap analysis**: unmet objectives ranked by severity
//! - **Approaches**: 3 to 5 alternatives per gap, ranked by benefit/risk
//! - **Decisions**: a human approves, rejects, or lets the deadline pass
//! - **Safety**: approved work happens in an isolated, versioned workspace
//! - **Quality**: a weighted rubric gates every implementation attempt
//! - **Knowledge**: every outcome lands in an append-only decision log
//!
//! ## Quick Start
//!
//! ```bash
//! # What is missing?
//! gapwise analyze --objectives objectives.toml
//!
//! # Close the gaps, approving each decision at the prompt
//! gapwise run --objectives objectives.toml
//! ```

#![forbid(unsafe_code)]

pub mod analysis;
pub mod approach;
pub mod core;
pub mod decision;
pub mod discovery;
pub mod knowledge;
pub mod quality;
pub mod safety;
pub mod workflow;

// Re-export commonly used types
pub use analysis::{Gap, GapAnalyzer, Objective, ObjectiveSet};
pub use approach::{Approach, ApproachGenerator, ApproachSet};
pub use core::{Config, EngineError, Result};
pub use decision::{ApprovalChannel, Decision, DecisionFacilitator, DecisionHandle, DecisionState};
pub use discovery::{Asset, AssetDiscoveryEngine, Inventory};
pub use knowledge::{KnowledgeArtifact, KnowledgePreserver};
pub use quality::{Artifact, QualityReport, QualityValidator};
pub use safety::{SafetyEnvironmentManager, Workspace};
pub use workflow::{PipelineFailure, PipelineOutcome, PipelineStage, WorkflowOrchestrator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "gapwise";
