//! Configuration management for Gapwise.
//!
//! Handles loading and saving configuration from TOML files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{EngineError, Result};

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Asset discovery settings
    pub discovery: DiscoveryConfig,

    /// Approach generation settings
    pub approaches: ApproachConfig,

    /// Decision step settings
    pub decision: DecisionConfig,

    /// Isolated workspace settings
    pub safety: SafetyConfig,

    /// Quality rubric settings
    pub quality: QualityConfig,

    /// Knowledge log settings
    pub knowledge: KnowledgeConfig,

    /// Pipeline scheduling settings
    pub workflow: WorkflowConfig,
}

/// Asset discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Directory names skipped during the scan
    pub ignore_dirs: Vec<String>,

    /// Maximum directory depth below the root
    pub max_depth: usize,

    /// Files larger than this are inventoried without reading content
    pub max_file_bytes: u64,
}

/// Approach generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApproachConfig {
    /// Upper bound on approaches per gap (3..=5)
    pub max_approaches: usize,

    /// Gaps whose risk tolerance is at or below this get no experimental approach
    pub experimental_min_risk_tolerance: f64,
}

/// Decision step settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// How long a decision may wait for an approver
    pub approval_timeout_secs: u64,
}

/// Isolated workspace settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Directory that holds in-flight workspaces
    pub workspace_root: PathBuf,

    /// Directory that receives finalized, versioned artifacts
    pub archive_root: PathBuf,

    /// Copy every inventoried asset instead of only the relevant ones
    pub copy_full_tree: bool,
}

/// Quality rubric settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Weighted average required to pass
    pub pass_threshold: f64,

    /// No single dimension may score below this
    pub dimension_floor: f64,

    /// Total implementation attempts before the phase fails
    pub max_attempts: u32,

    /// Per-dimension weights
    pub weights: DimensionWeights,

    /// Files longer than this lose maintainability points
    pub max_file_lines: usize,

    /// Lines longer than this lose maintainability points
    pub max_line_length: usize,
}

/// Weight of each quality dimension in the overall score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DimensionWeights {
    pub error_handling: f64,
    pub documentation: f64,
    pub maintainability: f64,
    pub tests: f64,
    pub performance: f64,
    pub security: f64,
}

/// Knowledge log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    /// JSON-lines file holding the knowledge log (`~` is expanded)
    pub log_path: Option<String>,
}

/// Pipeline scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Gap pipelines allowed to run at once
    pub max_parallel_gaps: usize,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Looks for config in:
    /// 1. `.gapwise.toml` in current directory
    /// 2. `~/.config/gapwise/config.toml`
    /// 3. Falls back to defaults
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from(".gapwise.toml");
        if local_config.exists() {
            return Self::load_from_file(&local_config);
        }

        if let Some(config_dir) = Self::config_dir() {
            let global_config = config_dir.join("config.toml");
            if global_config.exists() {
                return Self::load_from_file(&global_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the given file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        if !(3..=5).contains(&self.approaches.max_approaches) {
            return Err(EngineError::Config(format!(
                "approaches.max_approaches must be between 3 and 5, got {}",
                self.approaches.max_approaches
            )));
        }
        if !(0.0..=1.0).contains(&self.quality.pass_threshold) {
            return Err(EngineError::Config("quality.pass_threshold must be within 0..=1".into()));
        }
        if !(0.0..=1.0).contains(&self.quality.dimension_floor) {
            return Err(EngineError::Config("quality.dimension_floor must be within 0..=1".into()));
        }
        if self.quality.max_attempts == 0 {
            return Err(EngineError::Config("quality.max_attempts must be at least 1".into()));
        }
        if self.quality.weights.total() <= 0.0 {
            return Err(EngineError::Config("quality.weights must not all be zero".into()));
        }
        if self.workflow.max_parallel_gaps == 0 {
            return Err(EngineError::Config("workflow.max_parallel_gaps must be at least 1".into()));
        }
        Ok(())
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("gapwise"))
    }

    /// Get the data directory path (knowledge log, workspaces, archives).
    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("gapwise"))
    }

    /// Resolve the knowledge log location, expanding `~`.
    pub fn knowledge_log_path(&self) -> Option<PathBuf> {
        match &self.knowledge.log_path {
            Some(raw) => Some(PathBuf::from(shellexpand::tilde(raw).into_owned())),
            None => Self::data_dir().map(|d| d.join("knowledge.jsonl")),
        }
    }
}

impl DecisionConfig {
    /// Approval deadline as a duration.
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }
}

impl DimensionWeights {
    /// Sum of all weights.
    pub fn total(&self) -> f64 {
        self.error_handling
            + self.documentation
            + self.maintainability
            + self.tests
            + self.performance
            + self.security
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig::default(),
            approaches: ApproachConfig::default(),
            decision: DecisionConfig::default(),
            safety: SafetyConfig::default(),
            quality: QualityConfig::default(),
            knowledge: KnowledgeConfig::default(),
            workflow: WorkflowConfig::default(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ignore_dirs: vec![
                ".git".to_string(),
                "node_modules".to_string(),
                "target".to_string(),
                "dist".to_string(),
                "build".to_string(),
                ".next".to_string(),
                "__pycache__".to_string(),
            ],
            max_depth: 12,
            max_file_bytes: 512 * 1024,
        }
    }
}

impl Default for ApproachConfig {
    fn default() -> Self {
        Self { max_approaches: 5, experimental_min_risk_tolerance: 0.0 }
    }
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self { approval_timeout_secs: 24 * 60 * 60 }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        let base = Config::data_dir().unwrap_or_else(|| std::env::temp_dir().join("gapwise"));
        Self {
            workspace_root: base.join("workspaces"),
            archive_root: base.join("archive"),
            copy_full_tree: false,
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            pass_threshold: 0.7,
            dimension_floor: 0.4,
            max_attempts: 3,
            weights: DimensionWeights::default(),
            max_file_lines: 400,
            max_line_length: 120,
        }
    }
}

impl Default for DimensionWeights {
    fn default() -> Self {
        Self {
            error_handling: 1.0,
            documentation: 1.0,
            maintainability: 1.0,
            tests: 1.0,
            performance: 1.0,
            security: 1.0,
        }
    }
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self { log_path: None }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self { max_parallel_gaps: num_cpus::get().max(1) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.approaches.max_approaches, 5);
        assert!((config.quality.pass_threshold - 0.7).abs() < f64::EPSILON);
        assert!((config.quality.dimension_floor - 0.4).abs() < f64::EPSILON);
        assert!(config.workflow.max_parallel_gaps >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("[discovery]"));
        assert!(toml_str.contains("[quality]"));
        assert!(toml_str.contains("[quality.weights]"));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [decision]
            approval_timeout_secs = 30

            [quality]
            pass_threshold = 0.8
            max_attempts = 2

            [quality.weights]
            security = 2.0
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.decision.approval_timeout(), Duration::from_secs(30));
        assert_eq!(config.quality.max_attempts, 2);
        assert!((config.quality.weights.security - 2.0).abs() < f64::EPSILON);
        assert!((config.quality.weights.tests - 1.0).abs() < f64::EPSILON);
        assert!((config.quality.dimension_floor - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = Config::default();
        config.approaches.max_approaches = 6;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.quality.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.quality.pass_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_knowledge_log_path_expands_tilde() {
        let mut config = Config::default();
        config.knowledge.log_path = Some("~/gapwise-log.jsonl".to_string());
        let path = config.knowledge_log_path().unwrap();
        assert!(!path.to_string_lossy().starts_with('~'));
        assert!(path.ends_with("gapwise-log.jsonl"));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.quality.max_attempts = 4;
        config.save(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.quality.max_attempts, 4);
    }
}
