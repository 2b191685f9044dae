//! Asset discovery.
//!
//! Walks a workspace read-only and inventories the capabilities it already
//! provides. A scan produces an immutable [`Inventory`] snapshot; re-scanning
//! supersedes the snapshot rather than mutating it.
//!
//! Unreadable paths never abort a scan: they are recorded as
//! [`ScanWarning`]s and skipped, so one broken subtree does not block the
//! whole assessment.

mod detectors;
mod store;

pub use detectors::{
    default_detectors, CapabilityDetector, DetectionInput, DirectoryDetector, ExtensionDetector,
    KeywordDetector, ManifestDetector, MarkerDetector, TestFileDetector,
};
pub use store::AssetStore;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::core::{DiscoveryConfig, EngineError, Result};

/// A discovered unit of existing work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    /// Stable identifier (root-relative path with `/` separators)
    pub id: String,

    /// Location relative to the scan root
    pub location: PathBuf,

    /// Capability tags this asset provides
    pub capabilities: BTreeSet<String>,

    /// When the scan that produced this asset started
    pub discovered_at: DateTime<Utc>,

    /// Size in bytes
    pub size_bytes: u64,

    /// SHA-256 of the content, when it was read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl Asset {
    /// Check whether this asset provides a capability.
    pub fn provides(&self, tag: &str) -> bool {
        self.capabilities.contains(tag)
    }
}

/// A path the scan could not read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanWarning {
    /// Offending path
    pub path: PathBuf,

    /// What went wrong
    pub message: String,
}

/// Snapshot of everything found under one root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inventory {
    /// Scan root
    pub root: PathBuf,

    /// Assets, sorted by id
    pub assets: Vec<Asset>,

    /// Paths skipped because they could not be read
    pub warnings: Vec<ScanWarning>,

    /// When the scan started
    pub scanned_at: DateTime<Utc>,
}

/// Difference between two inventory snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryDelta {
    /// Asset ids only present in the newer snapshot
    pub added: Vec<String>,

    /// Asset ids only present in the older snapshot
    pub removed: Vec<String>,

    /// Asset ids whose tags or content changed
    pub changed: Vec<String>,
}

impl InventoryDelta {
    /// True when both snapshots hold the same assets.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

impl Inventory {
    /// An inventory with no assets, e.g. for a project that does not exist yet.
    pub fn empty(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), assets: Vec::new(), warnings: Vec::new(), scanned_at: Utc::now() }
    }

    /// Whether some paths were skipped.
    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Look up an asset by id.
    pub fn get(&self, id: &str) -> Option<&Asset> {
        self.assets.binary_search_by(|a| a.id.as_str().cmp(id)).ok().map(|i| &self.assets[i])
    }

    /// Union of all capability tags.
    pub fn capabilities(&self) -> BTreeSet<&str> {
        self.assets.iter().flat_map(|a| a.capabilities.iter().map(String::as_str)).collect()
    }

    /// Assets providing the given capability.
    pub fn providing<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Asset> + 'a {
        self.assets.iter().filter(move |a| a.provides(tag))
    }

    /// Compare against an older snapshot.
    pub fn diff(&self, previous: &Inventory) -> InventoryDelta {
        let old: BTreeMap<&str, &Asset> =
            previous.assets.iter().map(|a| (a.id.as_str(), a)).collect();
        let new: BTreeMap<&str, &Asset> = self.assets.iter().map(|a| (a.id.as_str(), a)).collect();

        let mut delta = InventoryDelta::default();
        for (id, asset) in &new {
            match old.get(id) {
                None => delta.added.push((*id).to_string()),
                Some(prev) => {
                    if prev.capabilities != asset.capabilities || prev.digest != asset.digest {
                        delta.changed.push((*id).to_string());
                    }
                }
            }
        }
        delta.removed =
            old.keys().filter(|id| !new.contains_key(*id)).map(|id| (*id).to_string()).collect();
        delta
    }
}

/// Normalise a free-form capability name into a tag.
///
/// Tags are lowercase with inner whitespace collapsed to `-`.
pub fn normalize_tag(raw: &str) -> Option<String> {
    let tag = raw.split_whitespace().collect::<Vec<_>>().join("-").to_lowercase();
    if tag.is_empty() {
        None
    } else {
        Some(tag)
    }
}

/// Scans a workspace and inventories the capabilities it provides.
pub struct AssetDiscoveryEngine {
    config: DiscoveryConfig,
    detectors: Vec<Box<dyn CapabilityDetector>>,
}

impl AssetDiscoveryEngine {
    /// Create an engine with the built-in detectors.
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config, detectors: default_detectors() }
    }

    /// Add a custom detector.
    pub fn with_detector(mut self, detector: impl CapabilityDetector + 'static) -> Self {
        self.detectors.push(Box::new(detector));
        self
    }

    /// Number of registered detectors.
    pub fn detector_count(&self) -> usize {
        self.detectors.len()
    }

    /// Scan `root` and return a snapshot inventory.
    ///
    /// Fails only when the root itself is missing or unreadable; anything
    /// below it that cannot be read becomes a warning on the inventory.
    pub fn discover(&self, root: &Path) -> Result<Inventory> {
        let meta = fs::metadata(root)
            .map_err(|source| EngineError::RootUnavailable { path: root.to_path_buf(), source })?;
        if !meta.is_dir() {
            return Err(EngineError::RootUnavailable {
                path: root.to_path_buf(),
                source: std::io::Error::other("not a directory"),
            });
        }
        fs::read_dir(root)
            .map_err(|source| EngineError::RootUnavailable { path: root.to_path_buf(), source })?;

        tracing::debug!(root = %root.display(), detectors = self.detectors.len(), "Discovery started");

        let scanned_at = Utc::now();
        let mut assets = Vec::new();
        let mut warnings = Vec::new();

        let walker = WalkDir::new(root)
            .max_depth(self.config.max_depth)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !self.is_ignored(e.file_name().to_str()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map_or_else(|| root.to_path_buf(), Path::to_path_buf);
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable path");
                    warnings.push(ScanWarning { path, message: e.to_string() });
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            match self.inspect(root, entry.path(), scanned_at) {
                Ok(asset) => assets.push(asset),
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "Skipping unreadable file");
                    warnings.push(ScanWarning { path: entry.path().to_path_buf(), message: e.to_string() });
                }
            }
        }

        assets.sort_by(|a, b| a.id.cmp(&b.id));

        tracing::info!(
            root = %root.display(),
            assets = assets.len(),
            warnings = warnings.len(),
            "Discovery complete"
        );

        Ok(Inventory { root: root.to_path_buf(), assets, warnings, scanned_at })
    }

    fn is_ignored(&self, name: Option<&str>) -> bool {
        name.is_some_and(|n| self.config.ignore_dirs.iter().any(|d| d == n))
    }

    /// Build an asset for one file. Opens the file read-only.
    fn inspect(&self, root: &Path, path: &Path, scanned_at: DateTime<Utc>) -> std::io::Result<Asset> {
        let relative = path.strip_prefix(root).unwrap_or(path).to_path_buf();
        let size_bytes = fs::metadata(path)?.len();

        let (digest, text) = if size_bytes <= self.config.max_file_bytes {
            let bytes = fs::read(path)?;
            let digest = hex_digest(&bytes);
            (Some(digest), String::from_utf8(bytes).ok())
        } else {
            (None, None)
        };

        let input = DetectionInput { relative: &relative, content: text.as_deref() };
        let capabilities: BTreeSet<String> = self
            .detectors
            .iter()
            .flat_map(|d| d.detect(&input))
            .filter_map(|t| normalize_tag(&t))
            .collect();

        Ok(Asset {
            id: relative_id(&relative),
            location: relative,
            capabilities,
            discovered_at: scanned_at,
            size_bytes,
            digest,
        })
    }
}

impl Default for AssetDiscoveryEngine {
    fn default() -> Self {
        Self::new(DiscoveryConfig::default())
    }
}

/// Hex-encoded SHA-256.
pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

fn relative_id(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
