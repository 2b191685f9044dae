//! Gap analysis.
//!
//! Compares an asset inventory against the caller's objectives and ranks
//! what is missing. Analysis is a pure function of its inputs: same assets
//! and objectives, same gaps in the same order.

mod objectives;

pub use objectives::{Objective, ObjectiveSet};

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::{EngineError, Result};
use crate::discovery::Asset;

/// Rough effort needed to close a gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Low,
    Medium,
    High,
}

impl Effort {
    /// Derive effort from the number of missing capabilities.
    pub fn from_missing(missing: usize) -> Self {
        match missing {
            0 | 1 => Self::Low,
            2 | 3 => Self::Medium,
            _ => Self::High,
        }
    }
}

impl fmt::Display for Effort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

/// An objective the inventory does not fully cover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    /// The unmet objective's id; also identifies the gap
    pub objective_id: String,

    /// Position of the objective in the caller's list
    pub objective_index: usize,

    /// Objective description, carried for decision requests
    pub description: String,

    /// Capability tags the objective requires
    pub required: BTreeSet<String>,

    /// Required tags no asset provides, sorted
    pub missing: Vec<String>,

    /// Fraction of required tags already provided
    pub coverage: f64,

    /// weight × (1 − coverage)
    pub severity: f64,

    /// Effort estimate
    pub effort: Effort,

    /// Risk tolerance inherited from the objective
    pub risk_tolerance: f64,
}

impl Gap {
    /// Identifier of this gap.
    pub fn id(&self) -> &str {
        &self.objective_id
    }
}

/// Ranks unmet objectives by severity.
#[derive(Debug, Clone, Copy, Default)]
pub struct GapAnalyzer;

impl GapAnalyzer {
    /// Create a new analyzer.
    pub fn new() -> Self {
        Self
    }

    /// Compute gaps, most severe first.
    ///
    /// Equal severities keep the objectives' declaration order. Objectives
    /// that are fully covered produce no gap.
    pub fn analyze(&self, assets: &[Asset], objectives: &[Objective]) -> Result<Vec<Gap>> {
        let mut seen = BTreeSet::new();
        for objective in objectives {
            objective.validate()?;
            if !seen.insert(objective.id.as_str()) {
                return Err(EngineError::InvalidObjective(format!(
                    "duplicate objective id '{}'",
                    objective.id
                )));
            }
        }

        let provided: BTreeSet<&str> =
            assets.iter().flat_map(|a| a.capabilities.iter().map(String::as_str)).collect();

        let mut gaps: Vec<Gap> = objectives
            .iter()
            .enumerate()
            .filter_map(|(index, objective)| Self::gap_for(index, objective, &provided))
            .collect();

        // Stable sort: ties stay in declaration order.
        gaps.sort_by(|a, b| b.severity.total_cmp(&a.severity));

        tracing::debug!(objectives = objectives.len(), gaps = gaps.len(), "Gap analysis complete");

        Ok(gaps)
    }

    fn gap_for(index: usize, objective: &Objective, provided: &BTreeSet<&str>) -> Option<Gap> {
        let required = objective.required_capabilities();
        let missing: Vec<String> =
            required.iter().filter(|tag| !provided.contains(tag.as_str())).cloned().collect();

        let matched = required.len() - missing.len();
        let coverage = matched as f64 / required.len() as f64;
        if coverage >= 1.0 {
            return None;
        }

        Some(Gap {
            objective_id: objective.id.clone(),
            objective_index: index,
            description: objective.description.clone(),
            severity: objective.weight * (1.0 - coverage),
            effort: Effort::from_missing(missing.len()),
            required,
            missing,
            coverage,
            risk_tolerance: objective.risk_tolerance,
        })
    }
}
