//! The implementation step of a gap pipeline.

use async_trait::async_trait;

use crate::analysis::Gap;
use crate::approach::Approach;
use crate::core::Result;
use crate::quality::{Artifact, QualityReport};
use crate::safety::Workspace;

/// Everything an implementer may look at during one attempt.
#[derive(Debug, Clone, Copy)]
pub struct ImplementationContext<'a> {
    /// Gap being closed
    pub gap: &'a Gap,

    /// Approach the approver chose
    pub approach: &'a Approach,

    /// Isolated workspace; the only place the implementer may write
    pub workspace: &'a Workspace,

    /// 1-based attempt number
    pub attempt: u32,

    /// Report from the previous attempt, when it failed validation
    pub feedback: Option<&'a QualityReport>,
}

/// Produces work inside a provisioned workspace.
///
/// Called once per attempt. A later attempt sees the failing report of the
/// one before it and should address its remediations.
#[async_trait]
pub trait Implementer: Send + Sync {
    /// Implementer name, used in logs.
    fn name(&self) -> &str;

    /// Write or revise files in the workspace and return them as an artifact.
    async fn implement(&self, ctx: ImplementationContext<'_>) -> Result<Artifact>;
}

/// Writes a documented, tested stub module per missing capability.
///
/// Stubs return an error until someone fills them in, so the pipeline
/// produces a reviewable starting point rather than finished work.
#[derive(Debug, Default, Clone)]
pub struct ScaffoldImplementer;

impl ScaffoldImplementer {
    pub fn new() -> Self {
        Self
    }

    fn module(gap: &Gap, approach: &Approach, capability: &str) -> String {
        let ident = identifier(capability);
        format!(
            "//! `{capability}` support for objective `{gap}` ({class} approach).\n\
             \n\
             /// Entry point for the `{capability}` capability.\n\
             ///\n\
             /// {summary}\n\
             pub fn {ident}() -> Result<(), String> {{\n\
             \x20   Err(\"{capability} is not implemented yet\".to_string())\n\
             }}\n\
             \n\
             #[cfg(test)]\n\
             mod tests {{\n\
             \x20   #[test]\n\
             \x20   fn test_{ident}_reports_pending() {{\n\
             \x20       assert!(super::{ident}().is_err());\n\
             \x20   }}\n\
             }}\n",
            gap = gap.id(),
            class = approach.class,
            summary = approach.summary,
        )
    }
}

#[async_trait]
impl Implementer for ScaffoldImplementer {
    fn name(&self) -> &str {
        "scaffold"
    }

    async fn implement(&self, ctx: ImplementationContext<'_>) -> Result<Artifact> {
        let targets: Vec<&String> = if ctx.approach.covers.is_empty() {
            ctx.gap.missing.iter().collect()
        } else {
            ctx.approach.covers.iter().collect()
        };

        for capability in targets {
            let file = format!("src/gapwise/{}.rs", identifier(capability));
            if ctx.attempt > 1 && ctx.workspace.contains(&file) {
                continue;
            }
            ctx.workspace.write(&file, Self::module(ctx.gap, ctx.approach, capability))?;
            tracing::debug!(file = %file, attempt = ctx.attempt, "Scaffolded module");
        }

        Artifact::from_workspace(ctx.approach.id.clone(), ctx.workspace)
    }
}

/// Turn a capability tag into a Rust identifier.
fn identifier(tag: &str) -> String {
    let mut ident: String =
        tag.chars().map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' }).collect();
    if ident.is_empty() || ident.starts_with(|c: char| c.is_ascii_digit()) {
        ident.insert_str(0, "cap_");
    }
    ident
}
