//! Capability detectors.
//!
//! Each detector inspects one file (its path relative to the scan root and,
//! when readable as text, its content) and returns the capability tags it
//! recognises. The discovery engine unions the results of all detectors.

use std::path::{Component, Path};

use once_cell::sync::Lazy;
use regex::Regex;

use super::normalize_tag;

/// Input handed to every detector for a single file.
#[derive(Debug, Clone, Copy)]
pub struct DetectionInput<'a> {
    /// Path relative to the scan root
    pub relative: &'a Path,

    /// UTF-8 content, if the file was small enough and not binary
    pub content: Option<&'a str>,
}

impl<'a> DetectionInput<'a> {
    /// File name as a string, empty when absent.
    pub fn file_name(&self) -> &'a str {
        self.relative.file_name().and_then(|n| n.to_str()).unwrap_or("")
    }

    /// Lowercased extension, if any.
    pub fn extension(&self) -> Option<String> {
        self.relative.extension().and_then(|e| e.to_str()).map(str::to_lowercase)
    }

    /// Directory components leading to the file.
    pub fn directories(&self) -> impl Iterator<Item = &'a str> {
        let parent = self.relative.parent().unwrap_or_else(|| Path::new(""));
        parent.components().filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
    }
}

/// Trait for capability detectors.
pub trait CapabilityDetector: Send + Sync {
    /// Get the name of this detector.
    fn name(&self) -> &str;

    /// Return the capability tags this file provides.
    fn detect(&self, input: &DetectionInput<'_>) -> Vec<String>;
}

/// The detectors every engine starts with.
pub fn default_detectors() -> Vec<Box<dyn CapabilityDetector>> {
    vec![
        Box::new(ManifestDetector),
        Box::new(ExtensionDetector),
        Box::new(DirectoryDetector),
        Box::new(TestFileDetector),
        Box::new(KeywordDetector),
        Box::new(MarkerDetector),
    ]
}

/// Recognises project manifests and build files.
pub struct ManifestDetector;

impl CapabilityDetector for ManifestDetector {
    fn name(&self) -> &str {
        "manifest"
    }

    fn detect(&self, input: &DetectionInput<'_>) -> Vec<String> {
        let tags: &[&str] = match input.file_name() {
            "Cargo.toml" => &["rust", "cargo"],
            "package.json" => &["node", "npm"],
            "tsconfig.json" => &["typescript"],
            "pyproject.toml" | "setup.py" | "requirements.txt" => &["python"],
            "go.mod" => &["go"],
            "Dockerfile" | "docker-compose.yml" | "docker-compose.yaml" => &["docker", "containers"],
            "Makefile" | "justfile" | "Taskfile.yml" => &["task-runner"],
            _ => &[],
        };

        let mut found: Vec<String> = tags.iter().map(|t| (*t).to_string()).collect();

        let in_workflows = input.relative.starts_with(".github/workflows");
        if in_workflows {
            found.push("ci".to_string());
        }

        found
    }
}

/// Maps source file extensions to language or artifact tags.
pub struct ExtensionDetector;

impl CapabilityDetector for ExtensionDetector {
    fn name(&self) -> &str {
        "extension"
    }

    fn detect(&self, input: &DetectionInput<'_>) -> Vec<String> {
        let Some(ext) = input.extension() else {
            return Vec::new();
        };

        let tag = match ext.as_str() {
            "rs" => "rust",
            "py" => "python",
            "ts" | "tsx" => "typescript",
            "js" | "jsx" | "mjs" => "javascript",
            "go" => "go",
            "java" | "kt" => "jvm",
            "md" | "rst" | "adoc" => "documentation",
            "sql" => "database",
            "proto" => "protobuf",
            "sh" | "bash" | "ps1" => "shell",
            "toml" | "yaml" | "yml" | "json" | "ini" => "configuration",
            _ => return Vec::new(),
        };

        vec![tag.to_string()]
    }
}

/// Conventional directory names and what they usually hold.
pub struct DirectoryDetector;

impl CapabilityDetector for DirectoryDetector {
    fn name(&self) -> &str {
        "directory"
    }

    fn detect(&self, input: &DetectionInput<'_>) -> Vec<String> {
        let mut found = Vec::new();
        for dir in input.directories() {
            let tag = match dir.to_lowercase().as_str() {
                "tests" | "test" | "spec" => "testing",
                "docs" | "doc" => "documentation",
                "api" | "routes" | "handlers" => "api",
                "models" | "domain" | "entities" => "domain-model",
                "components" | "pages" | "views" => "ui",
                "migrations" | "schema" => "database",
                "scripts" => "scripts",
                "config" | "configs" => "configuration",
                "benches" | "benchmarks" => "benchmarks",
                _ => continue,
            };
            found.push(tag.to_string());
        }
        found
    }
}

/// Flags files that follow common test naming conventions.
pub struct TestFileDetector;

const TEST_PATTERNS: [&str; 4] = ["test_", "_test", ".test.", ".spec."];

impl CapabilityDetector for TestFileDetector {
    fn name(&self) -> &str {
        "test-file"
    }

    fn detect(&self, input: &DetectionInput<'_>) -> Vec<String> {
        let name = input.file_name().to_lowercase();
        let named_like_test = TEST_PATTERNS.iter().any(|p| name.contains(p));
        let has_test_module =
            input.content.is_some_and(|c| c.contains("#[cfg(test)]") || c.contains("#[test]"));

        if named_like_test || has_test_module {
            vec!["testing".to_string()]
        } else {
            Vec::new()
        }
    }
}

/// Turns path words into tags, so `src/auth/session.rs` provides `auth`
/// and `session`.
pub struct KeywordDetector;

const KEYWORD_STOPLIST: [&str; 14] = [
    "src", "lib", "mod", "main", "index", "init", "utils", "util", "common", "misc", "tmp", "the",
    "and", "for",
];

impl CapabilityDetector for KeywordDetector {
    fn name(&self) -> &str {
        "keyword"
    }

    fn detect(&self, input: &DetectionInput<'_>) -> Vec<String> {
        let stem = input.relative.file_stem().and_then(|s| s.to_str()).unwrap_or("");

        input
            .directories()
            .chain(std::iter::once(stem))
            .flat_map(|word| word.split(|c: char| !c.is_ascii_alphanumeric()))
            .map(str::to_lowercase)
            .filter(|w| w.len() >= 3)
            .filter(|w| !w.chars().all(|c| c.is_ascii_digit()))
            .filter(|w| !KEYWORD_STOPLIST.contains(&w.as_str()))
            .collect()
    }
}

/// Reads explicit `capability: a, b` declarations from file content.
pub struct MarkerDetector;

static MARKER: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)\bcapabilit(?:y|ies)\s*:\s*([A-Za-z0-9 ,_\-]+)").ok());

impl CapabilityDetector for MarkerDetector {
    fn name(&self) -> &str {
        "marker"
    }

    fn detect(&self, input: &DetectionInput<'_>) -> Vec<String> {
        let (Some(content), Some(marker)) = (input.content, MARKER.as_ref()) else {
            return Vec::new();
        };

        marker
            .captures_iter(content)
            .filter_map(|caps| caps.get(1))
            .flat_map(|m| m.as_str().split(','))
            .filter_map(normalize_tag)
            .collect()
    }
}
