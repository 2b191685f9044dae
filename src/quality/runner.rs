//! Test runner collaborator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Outcome of running a set of tests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    /// Pass/fail per test identifier
    pub results: BTreeMap<String, bool>,

    /// Aggregate coverage reported by the runner (0.0 - 1.0)
    pub coverage: f64,
}

impl TestRun {
    /// Whether `test_id` ran and passed.
    pub fn passed(&self, test_id: &str) -> bool {
        self.results.get(test_id).copied().unwrap_or(false)
    }

    /// Identifiers that ran and failed.
    pub fn failures(&self) -> impl Iterator<Item = &str> {
        self.results.iter().filter(|(_, ok)| !**ok).map(|(id, _)| id.as_str())
    }
}

/// Runs tests by identifier.
///
/// Implementations must be deterministic for the same input, otherwise
/// quality reports stop being reproducible.
pub trait TestRunner: Send + Sync {
    /// Runner name.
    fn name(&self) -> &str;

    /// Run the given tests.
    fn run(&self, test_ids: &[String]) -> TestRun;
}

/// Trusts that every declared test passes.
///
/// Coverage is reported as full when at least one test is declared.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclaredTestRunner;

impl TestRunner for DeclaredTestRunner {
    fn name(&self) -> &str {
        "declared"
    }

    fn run(&self, test_ids: &[String]) -> TestRun {
        TestRun {
            results: test_ids.iter().map(|id| (id.clone(), true)).collect(),
            coverage: if test_ids.is_empty() { 0.0 } else { 1.0 },
        }
    }
}
