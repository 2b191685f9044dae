//! Core types shared by every stage: configuration and errors.

mod config;
mod error;

pub use config::{
    ApproachConfig, Config, DecisionConfig, DimensionWeights, DiscoveryConfig, KnowledgeConfig,
    QualityConfig, SafetyConfig, WorkflowConfig,
};
pub use error::{EngineError, ProvisioningError, Result};
