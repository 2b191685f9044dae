//! Isolated workspaces.
//!
//! Every approved decision gets its own scratch directory under the
//! configured workspace root. Relevant assets are copied in (sources are
//! only ever opened for reading) and all implementation writes go through
//! [`Workspace`], which refuses paths that would leave it.
//!
//! A workspace ends in exactly one of two ways: [`SafetyEnvironmentManager::finalize`]
//! copies its contents into a new archive version and destroys it, or
//! [`SafetyEnvironmentManager::discard`] destroys it outright. Dropping a
//! workspace without either discards it.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::analysis::Gap;
use crate::core::{EngineError, ProvisioningError, Result, SafetyConfig};
use crate::decision::Decision;
use crate::discovery::{hex_digest, Inventory};

/// File name of the archive manifest inside each version directory.
const MANIFEST: &str = "manifest.json";

type ActiveSet = Arc<Mutex<HashSet<String>>>;

/// Scratch directory exclusively owned by one approved decision.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    decision_id: String,
    gap_id: String,
    approach_id: String,
    seeded: Vec<String>,
    created_at: DateTime<Utc>,
    active: ActiveSet,
    live: bool,
}

impl Workspace {
    /// Workspace root directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn decision_id(&self) -> &str {
        &self.decision_id
    }

    pub fn gap_id(&self) -> &str {
        &self.gap_id
    }

    /// Approach the workspace was provisioned for.
    pub fn approach_id(&self) -> &str {
        &self.approach_id
    }

    /// Asset ids copied in at provisioning time.
    pub fn seeded(&self) -> &[String] {
        &self.seeded
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Resolve a relative path inside the workspace.
    ///
    /// Absolute paths and `..` components are refused with
    /// [`EngineError::PathEscape`].
    pub fn resolve(&self, relative: impl AsRef<Path>) -> Result<PathBuf> {
        let relative = relative.as_ref();
        let escapes = relative.as_os_str().is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(EngineError::PathEscape(relative.to_path_buf()));
        }
        Ok(self.path.join(relative))
    }

    /// Write a file, creating parent directories.
    pub fn write(&self, relative: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<PathBuf> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
        Ok(path)
    }

    /// Read a file as UTF-8.
    pub fn read(&self, relative: impl AsRef<Path>) -> Result<String> {
        Ok(fs::read_to_string(self.resolve(relative)?)?)
    }

    /// Whether a file exists in the workspace.
    pub fn contains(&self, relative: impl AsRef<Path>) -> bool {
        self.resolve(relative).is_ok_and(|p| p.is_file())
    }

    /// Every file in the workspace as a `/`-joined relative path, sorted.
    pub fn files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.path).sort_by_file_name() {
            let entry = entry.map_err(|e| EngineError::Io(e.into()))?;
            if entry.file_type().is_file() {
                let relative = entry.path().strip_prefix(&self.path).unwrap_or(entry.path());
                files.push(slash_path(relative));
            }
        }
        Ok(files)
    }

    fn destroy(&mut self) -> Result<()> {
        if !self.live {
            return Ok(());
        }
        self.live = false;
        self.active.lock().remove(&self.decision_id);
        match fs::remove_dir_all(&self.path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.live {
            tracing::warn!(
                decision = %self.decision_id,
                path = %self.path.display(),
                "Workspace dropped without finalize or discard; removing"
            );
            if let Err(e) = self.destroy() {
                tracing::warn!(error = %e, "Failed to remove abandoned workspace");
            }
        }
    }
}

/// One file in an archived version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedFile {
    /// Path relative to the version's `files/` directory
    pub path: String,

    /// Hex SHA-256 of the content
    pub sha256: String,

    /// Size in bytes
    pub size: u64,
}

/// Where a finalized workspace ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveReference {
    /// Gap the work closes
    pub gap_id: String,

    /// Decision that authorised the work
    pub decision_id: String,

    /// Approach that was implemented
    pub approach_id: String,

    /// Archive version for this gap, starting at 1
    pub version: u32,

    /// Version directory
    pub path: PathBuf,

    /// Archived files with checksums
    pub files: Vec<ArchivedFile>,

    /// When the version was written
    pub archived_at: DateTime<Utc>,
}

/// Provisions, finalizes and discards isolated workspaces.
#[derive(Debug)]
pub struct SafetyEnvironmentManager {
    config: SafetyConfig,
    active: ActiveSet,
}

impl SafetyEnvironmentManager {
    /// Create a manager.
    pub fn new(config: SafetyConfig) -> Self {
        Self { config, active: ActiveSet::default() }
    }

    /// Create a workspace for an approved decision and seed it with the
    /// assets relevant to `gap`.
    pub fn provision(&self, decision: &Decision, gap: &Gap, inventory: &Inventory) -> Result<Workspace> {
        let approach = decision
            .chosen()
            .ok_or_else(|| EngineError::NotApproved(decision.id().to_string()))?;

        if !self.active.lock().insert(decision.id().to_string()) {
            return Err(ProvisioningError::AlreadyProvisioned(decision.id().to_string()).into());
        }

        let path = self.config.workspace_root.join(decision.id());
        if let Err(e) = create_exclusive(&self.config.workspace_root, &path) {
            self.active.lock().remove(decision.id());
            return Err(e.into());
        }

        let mut workspace = Workspace {
            path,
            decision_id: decision.id().to_string(),
            gap_id: decision.gap_id().to_string(),
            approach_id: approach.id.clone(),
            seeded: Vec::new(),
            created_at: Utc::now(),
            active: Arc::clone(&self.active),
            live: true,
        };

        // A failed seed drops the workspace, which removes it.
        workspace.seeded = self.seed(&workspace, gap, inventory)?;

        tracing::info!(
            decision = %workspace.decision_id,
            gap = %workspace.gap_id,
            path = %workspace.path.display(),
            seeded = workspace.seeded.len(),
            "Workspace provisioned"
        );

        Ok(workspace)
    }

    fn seed(&self, workspace: &Workspace, gap: &Gap, inventory: &Inventory) -> Result<Vec<String>> {
        let relevant: &BTreeSet<String> = &gap.required;
        let mut seeded = Vec::new();

        for asset in &inventory.assets {
            if !self.config.copy_full_tree && asset.capabilities.is_disjoint(relevant) {
                continue;
            }

            let source = inventory.root.join(&asset.location);
            let target = workspace.resolve(&asset.location)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|source| ProvisioningError::Io { path: parent.to_path_buf(), source })?;
            }

            match fs::copy(&source, &target) {
                Ok(_) => seeded.push(asset.id.clone()),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    tracing::warn!(asset = %asset.id, "Asset vanished since discovery; not copied");
                }
                Err(source) => return Err(ProvisioningError::Io { path: target, source }.into()),
            }
        }

        Ok(seeded)
    }

    /// Archive the workspace contents as the gap's next version and destroy
    /// the workspace.
    pub fn finalize(&self, mut workspace: Workspace) -> Result<ArchiveReference> {
        let gap_dir = self.config.archive_root.join(dir_name(&workspace.gap_id));
        fs::create_dir_all(&gap_dir)?;

        let (version, version_dir) = next_version(&gap_dir)?;
        let files_dir = version_dir.join("files");

        let mut files = Vec::new();
        for relative in workspace.files()? {
            let source = workspace.path.join(&relative);
            let target = files_dir.join(&relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let bytes = fs::read(&source)?;
            fs::write(&target, &bytes)?;
            files.push(ArchivedFile { path: relative, sha256: hex_digest(&bytes), size: bytes.len() as u64 });
        }

        let reference = ArchiveReference {
            gap_id: workspace.gap_id.clone(),
            decision_id: workspace.decision_id.clone(),
            approach_id: workspace.approach_id.clone(),
            version,
            path: version_dir.clone(),
            files,
            archived_at: Utc::now(),
        };
        fs::write(version_dir.join(MANIFEST), serde_json::to_string_pretty(&reference)?)?;

        workspace.destroy()?;

        tracing::info!(
            gap = %reference.gap_id,
            version = reference.version,
            files = reference.files.len(),
            "Workspace archived"
        );

        Ok(reference)
    }

    /// Destroy the workspace without archiving anything.
    pub fn discard(&self, mut workspace: Workspace) -> Result<()> {
        tracing::info!(decision = %workspace.decision_id, "Workspace discarded");
        workspace.destroy()
    }

    /// Archived versions for `gap_id`, oldest first.
    pub fn archives(&self, gap_id: &str) -> Result<Vec<ArchiveReference>> {
        let gap_dir = self.config.archive_root.join(dir_name(gap_id));
        let mut references = Vec::new();
        for (_, dir) in versions(&gap_dir)? {
            let manifest = dir.join(MANIFEST);
            if manifest.is_file() {
                references.push(serde_json::from_str(&fs::read_to_string(manifest)?)?);
            }
        }
        Ok(references)
    }

    /// Whether `decision_id` currently owns a workspace.
    pub fn is_active(&self, decision_id: &str) -> bool {
        self.active.lock().contains(decision_id)
    }

    /// Number of live workspaces.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

impl Default for SafetyEnvironmentManager {
    fn default() -> Self {
        Self::new(SafetyConfig::default())
    }
}

fn create_exclusive(root: &Path, path: &Path) -> std::result::Result<(), ProvisioningError> {
    fs::create_dir_all(root)
        .map_err(|source| ProvisioningError::Io { path: root.to_path_buf(), source })?;
    fs::create_dir(path).map_err(|source| {
        if source.kind() == ErrorKind::AlreadyExists {
            ProvisioningError::Collision(path.to_path_buf())
        } else {
            ProvisioningError::Io { path: path.to_path_buf(), source }
        }
    })
}

/// Existing `v<N>` directories under `gap_dir`, ascending.
fn versions(gap_dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let entries = match fs::read_dir(gap_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut found: Vec<(u32, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(n) = name.to_str().and_then(|s| s.strip_prefix('v')).and_then(|s| s.parse().ok()) {
            found.push((n, entry.path()));
        }
    }
    found.sort_by_key(|(n, _)| *n);
    Ok(found)
}

/// Claim the next free version directory.
fn next_version(gap_dir: &Path) -> Result<(u32, PathBuf)> {
    let mut version = versions(gap_dir)?.last().map_or(1, |(n, _)| n + 1);
    loop {
        let dir = gap_dir.join(format!("v{version}"));
        match fs::create_dir(&dir) {
            Ok(()) => return Ok((version, dir)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => version += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

fn dir_name(gap_id: &str) -> String {
    gap_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}

fn slash_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Content digest of every file under `root`, including relative paths.
///
/// Two trees have the same digest exactly when they hold the same files
/// with the same bytes.
pub fn tree_digest(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| EngineError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        hasher.update(slash_path(relative).as_bytes());
        hasher.update([0]);
        hasher.update(fs::read(entry.path())?);
        hasher.update([0]);
    }
    Ok(hasher.finalize().iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{GapAnalyzer, Objective};
    use crate::approach::ApproachGenerator;
    use crate::decision::{DecisionFacilitator, ScriptedAnswer, ScriptedApproval};
    use crate::discovery::AssetDiscoveryEngine;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        project: PathBuf,
        manager: SafetyEnvironmentManager,
        config: SafetyConfig,
    }

    fn fixture(copy_full_tree: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("project");
        fs::create_dir_all(project.join("src/auth")).unwrap();
        fs::write(project.join("src/auth/login.rs"), "pub fn login() {}").unwrap();
        fs::write(project.join("src/billing.rs"), "pub fn charge() {}").unwrap();

        let config = SafetyConfig {
            workspace_root: dir.path().join("workspaces"),
            archive_root: dir.path().join("archive"),
            copy_full_tree,
        };
        Fixture { manager: SafetyEnvironmentManager::new(config.clone()), config, project, _dir: dir }
    }

    async fn decide(answer: ScriptedAnswer) -> (Gap, Decision) {
        let objective = Objective::new("auth", 0.8).requiring(["auth", "session"]);
        let gap = GapAnalyzer::new().analyze(&[], &[objective]).unwrap().remove(0);
        let set = ApproachGenerator::default().generate(&gap).unwrap();
        let facilitator = DecisionFacilitator::default();
        let pending = facilitator.propose(&gap, &set).unwrap();
        let decision = facilitator.resolve(pending, &ScriptedApproval::new(answer)).await.unwrap();
        (gap, decision)
    }

    #[tokio::test]
    async fn test_provision_requires_approval() {
        let fx = fixture(false);
        let inventory = AssetDiscoveryEngine::default().discover(&fx.project).unwrap();
        let (gap, decision) = decide(ScriptedAnswer::Reject("no".into())).await;

        let err = fx.manager.provision(&decision, &gap, &inventory).unwrap_err();
        assert!(matches!(err, EngineError::NotApproved(_)));
        assert!(!fx.config.workspace_root.join(decision.id()).exists());
    }

    #[tokio::test]
    async fn test_provision_copies_relevant_assets_only() {
        let fx = fixture(false);
        let before = tree_digest(&fx.project).unwrap();
        let inventory = AssetDiscoveryEngine::default().discover(&fx.project).unwrap();
        let (gap, decision) = decide(ScriptedAnswer::Recommended).await;

        let workspace = fx.manager.provision(&decision, &gap, &inventory).unwrap();
        assert_eq!(workspace.seeded(), &["src/auth/login.rs".to_string()]);
        assert!(workspace.contains("src/auth/login.rs"));
        assert!(!workspace.contains("src/billing.rs"));
        assert!(fx.manager.is_active(decision.id()));

        workspace.write("src/auth/session.rs", "pub fn session() {}").unwrap();
        assert_eq!(tree_digest(&fx.project).unwrap(), before);

        fx.manager.discard(workspace).unwrap();
        assert_eq!(fx.manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_full_tree_copy() {
        let fx = fixture(true);
        let inventory = AssetDiscoveryEngine::default().discover(&fx.project).unwrap();
        let (gap, decision) = decide(ScriptedAnswer::Recommended).await;

        let workspace = fx.manager.provision(&decision, &gap, &inventory).unwrap();
        assert_eq!(workspace.files().unwrap(), vec!["src/auth/login.rs", "src/billing.rs"]);
        fx.manager.discard(workspace).unwrap();
    }

    #[tokio::test]
    async fn test_double_provision_and_collision() {
        let fx = fixture(false);
        let inventory = AssetDiscoveryEngine::default().discover(&fx.project).unwrap();
        let (gap, decision) = decide(ScriptedAnswer::Recommended).await;

        let workspace = fx.manager.provision(&decision, &gap, &inventory).unwrap();
        let err = fx.manager.provision(&decision, &gap, &inventory).unwrap_err();
        assert!(matches!(err, EngineError::Provisioning(ProvisioningError::AlreadyProvisioned(_))));
        fx.manager.discard(workspace).unwrap();

        // A stale directory with the same name is a collision, not reuse.
        fs::create_dir_all(fx.config.workspace_root.join(decision.id())).unwrap();
        let err = fx.manager.provision(&decision, &gap, &inventory).unwrap_err();
        assert!(matches!(err, EngineError::Provisioning(ProvisioningError::Collision(_))));
        assert!(!fx.manager.is_active(decision.id()));
    }

    #[tokio::test]
    async fn test_writes_cannot_escape() {
        let fx = fixture(false);
        let inventory = AssetDiscoveryEngine::default().discover(&fx.project).unwrap();
        let (gap, decision) = decide(ScriptedAnswer::Recommended).await;
        let workspace = fx.manager.provision(&decision, &gap, &inventory).unwrap();

        for bad in ["../outside.rs", "/etc/passwd", "src/../../x", ""] {
            assert!(matches!(workspace.write(bad, "x"), Err(EngineError::PathEscape(_))), "{bad}");
        }
        assert!(workspace.write("./src/ok.rs", "x").is_ok());
        fx.manager.discard(workspace).unwrap();
    }

    #[tokio::test]
    async fn test_finalize_archives_versions() {
        let fx = fixture(false);
        let inventory = AssetDiscoveryEngine::default().discover(&fx.project).unwrap();

        let (gap, first) = decide(ScriptedAnswer::Recommended).await;
        let workspace = fx.manager.provision(&first, &gap, &inventory).unwrap();
        workspace.write("src/auth/session.rs", "pub fn session() {}").unwrap();
        let path = workspace.path().to_path_buf();
        let v1 = fx.manager.finalize(workspace).unwrap();

        assert_eq!(v1.version, 1);
        assert!(!path.exists());
        assert!(v1.path.join("files/src/auth/session.rs").is_file());
        assert_eq!(v1.files.len(), 2);
        assert_eq!(v1.files[1].sha256, hex_digest(b"pub fn session() {}"));

        let (gap, second) = decide(ScriptedAnswer::SelectIndex(1)).await;
        let workspace = fx.manager.provision(&second, &gap, &inventory).unwrap();
        let v2 = fx.manager.finalize(workspace).unwrap();
        assert_eq!(v2.version, 2);

        let archives = fx.manager.archives("auth").unwrap();
        assert_eq!(archives, vec![v1, v2]);
        assert_eq!(fx.manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_workspace_is_removed() {
        let fx = fixture(false);
        let inventory = AssetDiscoveryEngine::default().discover(&fx.project).unwrap();
        let (gap, decision) = decide(ScriptedAnswer::Recommended).await;

        let workspace = fx.manager.provision(&decision, &gap, &inventory).unwrap();
        let path = workspace.path().to_path_buf();
        drop(workspace);

        assert!(!path.exists());
        assert!(!fx.manager.is_active(decision.id()));
    }

    #[test]
    fn test_tree_digest_detects_changes() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "one").unwrap();
        let first = tree_digest(dir.path()).unwrap();
        assert_eq!(first, tree_digest(dir.path()).unwrap());

        fs::write(dir.path().join("a.txt"), "two").unwrap();
        assert_ne!(first, tree_digest(dir.path()).unwrap());
    }
}
