//! Objectives supplied by the caller.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::{EngineError, Result};
use crate::discovery::normalize_tag;

/// Something the project is expected to deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    /// Unique identifier
    pub id: String,

    /// Free-text description
    #[serde(default)]
    pub description: String,

    /// Priority weight (0.0 - 1.0)
    pub weight: f64,

    /// Capability tags this objective requires; empty means `[id]`
    #[serde(default, alias = "requires")]
    pub capabilities: Vec<String>,

    /// How much risk the owner accepts for this objective (0.0 - 1.0)
    #[serde(default = "default_risk_tolerance")]
    pub risk_tolerance: f64,
}

fn default_risk_tolerance() -> f64 {
    0.5
}

impl Objective {
    /// Create an objective that requires the capability named by its id.
    pub fn new(id: impl Into<String>, weight: f64) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            weight,
            capabilities: Vec::new(),
            risk_tolerance: default_risk_tolerance(),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the required capabilities.
    pub fn requiring<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Set the risk tolerance.
    pub fn with_risk_tolerance(mut self, tolerance: f64) -> Self {
        self.risk_tolerance = tolerance;
        self
    }

    /// Normalised set of required capability tags.
    pub fn required_capabilities(&self) -> BTreeSet<String> {
        let tags: BTreeSet<String> =
            self.capabilities.iter().filter_map(|c| normalize_tag(c)).collect();
        if tags.is_empty() {
            normalize_tag(&self.id).into_iter().collect()
        } else {
            tags
        }
    }

    /// Check weight and tolerance ranges.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::InvalidObjective("objective id must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&self.weight) {
            return Err(EngineError::InvalidObjective(format!(
                "objective '{}' has weight {} outside 0..=1",
                self.id, self.weight
            )));
        }
        if !(0.0..=1.0).contains(&self.risk_tolerance) {
            return Err(EngineError::InvalidObjective(format!(
                "objective '{}' has risk tolerance {} outside 0..=1",
                self.id, self.risk_tolerance
            )));
        }
        Ok(())
    }
}

/// An ordered list of objectives, as loaded from an objectives file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectiveSet {
    /// Objectives in declaration order
    #[serde(default)]
    pub objectives: Vec<Objective>,
}

impl ObjectiveSet {
    /// Load from a TOML or YAML file, chosen by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "yml" | "yaml" => Self::from_yaml(&content),
            _ => Self::from_toml(&content),
        }
    }

    /// Parse TOML (`[[objectives]]` tables).
    pub fn from_toml(content: &str) -> Result<Self> {
        let set: Self =
            toml::from_str(content).map_err(|e| EngineError::InvalidObjective(e.to_string()))?;
        set.validate()?;
        Ok(set)
    }

    /// Parse YAML (an `objectives:` sequence).
    pub fn from_yaml(content: &str) -> Result<Self> {
        let set: Self = serde_yaml::from_str(content)
            .map_err(|e| EngineError::InvalidObjective(e.to_string()))?;
        set.validate()?;
        Ok(set)
    }

    /// Validate each objective and reject duplicate ids.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for objective in &self.objectives {
            objective.validate()?;
            if !seen.insert(objective.id.as_str()) {
                return Err(EngineError::InvalidObjective(format!(
                    "duplicate objective id '{}'",
                    objective.id
                )));
            }
        }
        Ok(())
    }
}

impl From<Vec<Objective>> for ObjectiveSet {
    fn from(objectives: Vec<Objective>) -> Self {
        Self { objectives }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_capabilities_default_to_id() {
        let objective = Objective::new("Auth", 0.8);
        assert_eq!(objective.required_capabilities(), BTreeSet::from(["auth".to_string()]));

        let objective = Objective::new("auth", 0.8).requiring(["Login", "session store"]);
        assert_eq!(
            objective.required_capabilities(),
            BTreeSet::from(["login".to_string(), "session-store".to_string()])
        );
    }

    #[test]
    fn test_validate_ranges() {
        assert!(Objective::new("auth", 0.8).validate().is_ok());
        assert!(Objective::new("auth", 1.2).validate().is_err());
        assert!(Objective::new("auth", f64::NAN).validate().is_err());
        assert!(Objective::new("", 0.5).validate().is_err());
        assert!(Objective::new("auth", 0.5).with_risk_tolerance(-0.1).validate().is_err());
    }

    #[test]
    fn test_from_toml() {
        let toml_str = r#"
            [[objectives]]
            id = "auth"
            description = "Users can log in"
            weight = 0.8
            capabilities = ["login", "session"]

            [[objectives]]
            id = "billing"
            weight = 0.4
            risk_tolerance = 0.0
        "#;

        let set = ObjectiveSet::from_toml(toml_str).unwrap();
        assert_eq!(set.objectives.len(), 2);
        assert_eq!(set.objectives[0].capabilities, vec!["login", "session"]);
        assert!((set.objectives[0].risk_tolerance - 0.5).abs() < f64::EPSILON);
        assert!(set.objectives[1].risk_tolerance.abs() < f64::EPSILON);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = "objectives:\n  - id: auth\n    weight: 0.8\n    requires: [login]\n";
        let set = ObjectiveSet::from_yaml(yaml).unwrap();
        assert_eq!(set.objectives[0].capabilities, vec!["login"]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let set = ObjectiveSet::from(vec![Objective::new("auth", 0.5), Objective::new("auth", 0.3)]);
        assert!(matches!(set.validate(), Err(EngineError::InvalidObjective(_))));
    }
}
