//! Rubric checks, one per quality dimension.
//!
//! Every check is a presence/absence count over the artifact's source text,
//! so the same artifact always scores the same.

use once_cell::sync::Lazy;
use regex::Regex;

use super::runner::TestRunner;
use super::{Artifact, ArtifactFile, Dimension};
use crate::core::QualityConfig;

/// Inputs shared by all checks.
pub struct RubricContext<'a> {
    pub config: &'a QualityConfig,
    pub runner: &'a dyn TestRunner,
}

/// Result of a single check.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    /// Score (0.0 - 1.0)
    pub score: f64,

    /// Concrete problems found, most specific first
    pub findings: Vec<String>,
}

impl CheckOutcome {
    fn new(score: f64, findings: Vec<String>) -> Self {
        Self { score: score.clamp(0.0, 1.0), findings }
    }
}

/// Scores one dimension of an artifact.
pub trait DimensionCheck: Send + Sync {
    /// The dimension this check scores.
    fn dimension(&self) -> Dimension;

    /// Score the artifact.
    fn evaluate(&self, artifact: &Artifact, ctx: &RubricContext<'_>) -> CheckOutcome;
}

/// The built-in check for every dimension.
pub fn default_checks() -> Vec<Box<dyn DimensionCheck>> {
    vec![
        Box::new(ErrorHandlingCheck),
        Box::new(DocumentationCheck),
        Box::new(MaintainabilityCheck),
        Box::new(TestPresenceCheck),
        Box::new(PerformanceCheck),
        Box::new(SecurityCheck),
    ]
}

/// A public operation found in source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub name: String,
    pub file: String,
    pub line: usize,
    pub documented: bool,
}

static PUBLIC_OPERATION: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"^\s*pub\s+(?:async\s+)?(?:unsafe\s+)?fn\s+([A-Za-z_][A-Za-z0-9_]*)",
        r"^(?:async\s+)?def\s+([A-Za-z][A-Za-z0-9_]*)",
        r"^\s*export\s+(?:default\s+)?(?:async\s+)?function\s+([A-Za-z_$][A-Za-z0-9_$]*)",
    ])
});

static TEST_ID: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"^\s*(?:pub\s+)?(?:async\s+)?(?:fn|def)\s+(test_[A-Za-z0-9_]+)",
        r#"\b(?:it|test)\(\s*["']([^"']+)["']"#,
    ])
});

/// Compile patterns, dropping any that fail.
fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::error!(pattern = %p, error = %e, "Dropping invalid rubric pattern");
                None
            }
        })
        .collect()
}

fn compile_flags(flags: &[(&str, &'static str)]) -> Vec<(Regex, &'static str)> {
    flags
        .iter()
        .filter_map(|(p, label)| compile(&[*p]).pop().map(|re| (re, *label)))
        .collect()
}

/// Public operations across non-test files, in file order.
pub(crate) fn public_operations(artifact: &Artifact) -> Vec<Operation> {
    let mut operations = Vec::new();
    for file in artifact.files.iter().filter(|f| !is_test_file(&f.path)) {
        let lines: Vec<&str> = production_source(file).lines().collect();
        for (index, line) in lines.iter().enumerate() {
            let name = PUBLIC_OPERATION
                .iter()
                .find_map(|re| re.captures(line))
                .and_then(|c| c.get(1))
                .map(|m| m.as_str());
            let Some(name) = name else { continue };
            if name.starts_with("test") {
                continue;
            }
            operations.push(Operation {
                name: name.to_string(),
                file: file.path.clone(),
                line: index + 1,
                documented: is_documented(&lines, index),
            });
        }
    }
    operations
}

/// Test identifiers declared anywhere in the artifact, sorted and unique.
pub(crate) fn test_ids(artifact: &Artifact) -> Vec<String> {
    let mut ids: Vec<String> = artifact
        .files
        .iter()
        .flat_map(|f| f.content.lines())
        .flat_map(|line| TEST_ID.iter().filter_map(move |re| re.captures(line)))
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

fn is_documented(lines: &[&str], index: usize) -> bool {
    let before = lines[..index]
        .iter()
        .rev()
        .map(|l| l.trim())
        .find(|l| !l.is_empty() && !l.starts_with("#[") && !l.starts_with('@'));
    let doc_before = before.is_some_and(|l| {
        l.starts_with("///") || l.starts_with("/**") || l.starts_with('*') || l.ends_with("*/")
    });

    let doc_after = lines
        .get(index + 1)
        .map(|l| l.trim())
        .is_some_and(|l| l.starts_with("\"\"\"") || l.starts_with("'''"));

    doc_before || doc_after
}

fn is_test_file(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path).to_lowercase();
    path.split('/').any(|part| part == "tests" || part == "test" || part == "__tests__")
        || name.starts_with("test_")
        || name.contains("_test.")
        || name.contains(".test.")
        || name.contains(".spec.")
}

/// File content up to the first inline test module.
fn production_source(file: &ArtifactFile) -> &str {
    match file.content.find("#[cfg(test)]") {
        Some(end) => &file.content[..end],
        None => &file.content,
    }
}

/// Non-test source lines with their 1-based numbers.
fn production_lines(artifact: &Artifact) -> impl Iterator<Item = (&str, usize, &str)> {
    artifact.files.iter().filter(|f| !is_test_file(&f.path)).flat_map(|f| {
        production_source(f).lines().enumerate().map(move |(i, l)| (f.path.as_str(), i + 1, l))
    })
}

/// Error propagation versus swallowed or panicking failures.
pub struct ErrorHandlingCheck;

const HANDLED: [&str; 7] = ["Result<", "?;", "?)", ".map_err(", ".ok_or", "except ", "catch"];
const UNHANDLED: [&str; 4] = [".unwrap()", ".expect(", "panic!(", "except:"];

impl DimensionCheck for ErrorHandlingCheck {
    fn dimension(&self) -> Dimension {
        Dimension::ErrorHandling
    }

    fn evaluate(&self, artifact: &Artifact, _ctx: &RubricContext<'_>) -> CheckOutcome {
        let mut handled = 0usize;
        let mut unhandled = 0usize;
        let mut findings = Vec::new();

        for (path, number, line) in production_lines(artifact) {
            handled += HANDLED.iter().map(|m| line.matches(m).count()).sum::<usize>();
            for marker in UNHANDLED {
                let count = line.matches(marker).count();
                if count > 0 {
                    unhandled += count;
                    findings.push(format!("{path}:{number}: replace `{marker}` with error propagation"));
                }
            }
        }

        let total = handled + unhandled;
        let score = if total == 0 { 1.0 } else { handled as f64 / total as f64 };
        CheckOutcome::new(score, findings)
    }
}

/// Every public operation carries a doc comment.
pub struct DocumentationCheck;

impl DimensionCheck for DocumentationCheck {
    fn dimension(&self) -> Dimension {
        Dimension::Documentation
    }

    fn evaluate(&self, artifact: &Artifact, _ctx: &RubricContext<'_>) -> CheckOutcome {
        let operations = public_operations(artifact);
        if operations.is_empty() {
            return CheckOutcome::new(1.0, Vec::new());
        }

        let findings: Vec<String> = operations
            .iter()
            .filter(|op| !op.documented)
            .map(|op| format!("{}:{}: document `{}`", op.file, op.line, op.name))
            .collect();
        let documented = operations.len() - findings.len();
        CheckOutcome::new(documented as f64 / operations.len() as f64, findings)
    }
}

/// File and line length limits.
pub struct MaintainabilityCheck;

impl DimensionCheck for MaintainabilityCheck {
    fn dimension(&self) -> Dimension {
        Dimension::Maintainability
    }

    fn evaluate(&self, artifact: &Artifact, ctx: &RubricContext<'_>) -> CheckOutcome {
        let files: Vec<&ArtifactFile> =
            artifact.files.iter().filter(|f| !is_test_file(&f.path)).collect();
        if files.is_empty() {
            return CheckOutcome::new(1.0, Vec::new());
        }

        let mut findings = Vec::new();
        let mut total = 0.0;
        for file in &files {
            let lines: Vec<&str> = file.content.lines().collect();
            let mut score = 1.0;

            if lines.len() > ctx.config.max_file_lines {
                score -= 0.5;
                findings.push(format!(
                    "{}: split file ({} lines, limit {})",
                    file.path,
                    lines.len(),
                    ctx.config.max_file_lines
                ));
            }

            let long = lines.iter().filter(|l| l.chars().count() > ctx.config.max_line_length).count();
            if long > 0 {
                score -= 0.5 * long as f64 / lines.len() as f64;
                findings.push(format!(
                    "{}: wrap {long} line(s) longer than {} characters",
                    file.path, ctx.config.max_line_length
                ));
            }

            total += score;
        }

        CheckOutcome::new(total / files.len() as f64, findings)
    }
}

/// Public operations backed by at least one passing test.
pub struct TestPresenceCheck;

impl DimensionCheck for TestPresenceCheck {
    fn dimension(&self) -> Dimension {
        Dimension::TestPresence
    }

    fn evaluate(&self, artifact: &Artifact, ctx: &RubricContext<'_>) -> CheckOutcome {
        let operations = public_operations(artifact);
        if operations.is_empty() {
            return CheckOutcome::new(1.0, Vec::new());
        }

        let ids = test_ids(artifact);
        let run = ctx.runner.run(&ids);

        let mut findings = Vec::new();
        let mut covered = 0usize;
        for op in &operations {
            let needle = format!("_{}_", op.name.to_lowercase());
            let associated: Vec<&String> =
                ids.iter().filter(|id| tokenized(id).contains(&needle)).collect();
            if associated.iter().any(|id| run.passed(id)) {
                covered += 1;
            } else if associated.is_empty() {
                findings.push(format!("add a test for `{}` ({})", op.name, op.file));
            } else {
                findings.push(format!("fix failing test(s) for `{}`", op.name));
            }
        }

        CheckOutcome::new(covered as f64 / operations.len() as f64, findings)
    }
}

/// `id` lowercased, with non-alphanumerics as `_` and `_` at both ends, so
/// an operation name matches only on identifier boundaries.
fn tokenized(id: &str) -> String {
    let body: String =
        id.chars().map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' }).collect();
    format!("_{body}_")
}

static PERFORMANCE_FLAGS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    compile_flags(&[
        (r"thread::sleep\(", "blocking sleep"),
        (r"\btime\.sleep\(", "blocking sleep"),
        (r"(?i)\bselect\s+\*\s+from\b", "unbounded SELECT *"),
        (r"\.collect::<Vec<[^>]*>>\(\)\s*\.len\(\)", "collect only to count"),
    ])
});

static SECURITY_FLAGS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    compile_flags(&[
        (r"\bunsafe\s*\{", "unsafe block"),
        (r"\beval\(", "dynamic eval"),
        (
            r#"(?i)\b(?:password|secret|api_key|apikey|token)\s*[:=]\s*["'][^"']+["']"#,
            "hardcoded secret",
        ),
        (r"(?i)\b(?:md5|sha1)\b", "weak hash"),
        (r"http://[A-Za-z]", "plaintext http URL"),
    ])
});

fn red_flags(artifact: &Artifact, flags: &[(Regex, &str)]) -> CheckOutcome {
    let mut findings = Vec::new();
    for (path, number, line) in production_lines(artifact) {
        if line.contains("localhost") || line.contains("127.0.0.1") {
            continue;
        }
        for (re, label) in flags {
            if re.is_match(line) {
                findings.push(format!("{path}:{number}: {label}"));
            }
        }
    }
    CheckOutcome::new(1.0 - 0.25 * findings.len() as f64, findings)
}

/// Known performance anti-patterns; each costs a quarter point.
pub struct PerformanceCheck;

impl DimensionCheck for PerformanceCheck {
    fn dimension(&self) -> Dimension {
        Dimension::Performance
    }

    fn evaluate(&self, artifact: &Artifact, _ctx: &RubricContext<'_>) -> CheckOutcome {
        red_flags(artifact, &PERFORMANCE_FLAGS)
    }
}

/// Known security anti-patterns; each costs a quarter point.
pub struct SecurityCheck;

impl DimensionCheck for SecurityCheck {
    fn dimension(&self) -> Dimension {
        Dimension::Security
    }

    fn evaluate(&self, artifact: &Artifact, _ctx: &RubricContext<'_>) -> CheckOutcome {
        red_flags(artifact, &SECURITY_FLAGS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::DeclaredTestRunner;

    fn ctx(config: &QualityConfig) -> RubricContext<'_> {
        RubricContext { config, runner: &DeclaredTestRunner }
    }

    #[test]
    fn test_public_operations_and_docs() {
        let artifact = Artifact::new("auth")
            .with_file(
                "src/auth.rs",
                "/// Log in.\npub fn login() {}\n\n#[inline]\npub fn logout() {}\nfn helper() {}\n",
            )
            .with_file("auth.py", "def verify(token):\n    \"\"\"Check a token.\"\"\"\n\ndef _private():\n    pass\n");

        let ops = public_operations(&artifact);
        let names: Vec<&str> = ops.iter().map(|o| o.name.as_str()).collect();
        // Files are kept sorted by path.
        assert_eq!(names, vec!["verify", "login", "logout"]);
        assert!(ops[0].documented);
        assert!(ops[1].documented);
        assert!(!ops[2].documented);

        let config = QualityConfig::default();
        let outcome = DocumentationCheck.evaluate(&artifact, &ctx(&config));
        assert!((outcome.score - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(outcome.findings, vec!["src/auth.rs:5: document `logout`"]);
    }

    #[test]
    fn test_test_ids_and_presence() {
        let artifact = Artifact::new("auth")
            .with_file("src/auth.rs", "pub fn login() {}\npub fn logout() {}\n")
            .with_file("tests/auth_test.rs", "#[test]\nfn test_login_succeeds() {}\n")
            .with_file("web/auth.test.js", "it('login redirects', () => {});\n");

        assert_eq!(test_ids(&artifact), vec!["login redirects", "test_login_succeeds"]);

        let config = QualityConfig::default();
        let outcome = TestPresenceCheck.evaluate(&artifact, &ctx(&config));
        assert!((outcome.score - 0.5).abs() < 1e-9);
        assert_eq!(outcome.findings, vec!["add a test for `logout` (src/auth.rs)"]);
    }

    #[test]
    fn test_presence_matches_whole_identifiers() {
        let artifact = Artifact::new("store")
            .with_file("src/store.rs", "pub fn get() {}\npub fn put() {}\npub fn a() {}\n")
            .with_file(
                "tests/store.rs",
                "#[test]\nfn test_get_returns_value() {}\n#[test]\nfn test_target_budget() {}\n",
            );

        let config = QualityConfig::default();
        let outcome = TestPresenceCheck.evaluate(&artifact, &ctx(&config));
        assert!((outcome.score - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(
            outcome.findings,
            vec!["add a test for `put` (src/store.rs)", "add a test for `a` (src/store.rs)"]
        );
    }

    #[test]
    fn test_every_pattern_compiles() {
        assert_eq!(PUBLIC_OPERATION.len(), 3);
        assert_eq!(TEST_ID.len(), 2);
        assert_eq!(PERFORMANCE_FLAGS.len(), 4);
        assert_eq!(SECURITY_FLAGS.len(), 5);
        assert!(compile(&["("]).is_empty());
    }

    #[test]
    fn test_error_handling_ignores_test_module() {
        let source = "pub fn load() -> Result<(), E> {\n    read()?;\n    Ok(())\n}\n\n\
                      #[cfg(test)]\nmod tests {\n    fn t() { load().unwrap(); }\n}\n";
        let artifact = Artifact::new("a").with_file("src/load.rs", source);
        let config = QualityConfig::default();
        let outcome = ErrorHandlingCheck.evaluate(&artifact, &ctx(&config));
        assert!((outcome.score - 1.0).abs() < f64::EPSILON);

        let artifact = Artifact::new("a").with_file("src/load.rs", "pub fn load() -> Result<(), E> {\n    read().unwrap();\n}\n");
        let outcome = ErrorHandlingCheck.evaluate(&artifact, &ctx(&config));
        assert!((outcome.score - 0.5).abs() < 1e-9);
        assert_eq!(outcome.findings.len(), 1);
    }

    #[test]
    fn test_maintainability_limits() {
        let config = QualityConfig { max_file_lines: 2, max_line_length: 10, ..QualityConfig::default() };
        let artifact = Artifact::new("a").with_file("src/a.rs", "short\nshort\nthis line is too long\nok\n");
        let outcome = MaintainabilityCheck.evaluate(&artifact, &ctx(&config));
        // -0.5 for length, -0.5 * 1/4 for one long line.
        assert!((outcome.score - 0.375).abs() < 1e-9);
        assert_eq!(outcome.findings.len(), 2);
    }

    #[test]
    fn test_red_flags() {
        let config = QualityConfig::default();
        let artifact = Artifact::new("a").with_file(
            "src/net.rs",
            "let api_key = \"abc123\";\nlet url = \"http://example.com\";\nlet dev = \"http://localhost:3000\";\nunsafe { call() }\n",
        );
        let outcome = SecurityCheck.evaluate(&artifact, &ctx(&config));
        assert_eq!(outcome.findings.len(), 3);
        assert!((outcome.score - 0.25).abs() < 1e-9);

        let artifact = Artifact::new("a").with_file("src/db.rs", "std::thread::sleep(d);\nq(\"SELECT * FROM users\");\n");
        let outcome = PerformanceCheck.evaluate(&artifact, &ctx(&config));
        assert!((outcome.score - 0.5).abs() < 1e-9);
    }
}
