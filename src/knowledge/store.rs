//! Knowledge log stores.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use parking_lot::Mutex;

use super::{ArtifactDraft, KnowledgeArtifact};
use crate::core::{EngineError, Result};

/// Append-only persistence for knowledge artifacts.
///
/// `append` is the single serialization point of the log: it assigns the
/// next sequence id and persists the record as one atomic step, so ids are
/// strictly increasing in commit order no matter how many callers race.
pub trait KnowledgeStore: Send + Sync {
    /// Store name, used in logs.
    fn name(&self) -> &str;

    /// Assign the next sequence id to `draft` and persist it.
    fn append(&self, draft: ArtifactDraft) -> Result<KnowledgeArtifact>;

    /// Every stored artifact, in sequence order.
    fn load_all(&self) -> Result<Vec<KnowledgeArtifact>>;
}

/// Volatile store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    artifacts: Mutex<Vec<KnowledgeArtifact>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KnowledgeStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn append(&self, draft: ArtifactDraft) -> Result<KnowledgeArtifact> {
        let mut artifacts = self.artifacts.lock();
        let sequence = artifacts.last().map_or(1, |a| a.sequence + 1);
        let artifact = draft.into_artifact(sequence, Utc::now());
        artifacts.push(artifact.clone());
        Ok(artifact)
    }

    fn load_all(&self) -> Result<Vec<KnowledgeArtifact>> {
        Ok(self.artifacts.lock().clone())
    }
}

/// One JSON document per line in a single file.
///
/// A torn final line (a crash mid-append) is skipped with a warning and cut
/// off by the next append; a malformed line anywhere else is an error.
/// Appends hold an exclusive advisory lock on the file, so separate stores
/// and processes sharing one log still get distinct, increasing ids.
#[derive(Debug)]
pub struct JsonlStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

/// Parsed log content.
struct Parsed {
    artifacts: Vec<KnowledgeArtifact>,

    /// Byte length of the content that ends with the last valid record
    valid_len: usize,

    /// Whether a torn final line follows `valid_len`
    torn: bool,
}

impl JsonlStore {
    /// Open (or lazily create) the log at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_lock: Mutex::new(()) }
    }

    /// Log file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(&self, content: &str) -> Result<Parsed> {
        let mut segments = Vec::new();
        let mut offset = 0;
        for segment in content.split_inclusive('\n') {
            if !segment.trim().is_empty() {
                segments.push((offset, segment));
            }
            offset += segment.len();
        }

        let mut parsed = Parsed { artifacts: Vec::with_capacity(segments.len()), valid_len: 0, torn: false };
        for (index, (start, segment)) in segments.iter().enumerate() {
            match serde_json::from_str::<KnowledgeArtifact>(segment.trim()) {
                Ok(artifact) => {
                    parsed.artifacts.push(artifact);
                    parsed.valid_len = start + segment.len();
                }
                Err(e) if index + 1 == segments.len() => {
                    tracing::warn!(path = %self.path.display(), error = %e, "Skipping torn final log line");
                    parsed.torn = true;
                }
                Err(e) => {
                    return Err(EngineError::Knowledge(format!(
                        "{} line {}: {e}",
                        self.path.display(),
                        content[..*start].matches('\n').count() + 1
                    )));
                }
            }
        }
        Ok(parsed)
    }

    fn read_all(&self) -> Result<Vec<KnowledgeArtifact>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        FileExt::lock_shared(&file)?;

        let mut content = String::new();
        file.read_to_string(&mut content)?;
        Ok(self.parse(&content)?.artifacts)
    }
}

impl KnowledgeStore for JsonlStore {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn append(&self, draft: ArtifactDraft) -> Result<KnowledgeArtifact> {
        let _guard = self.write_lock.lock();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).read(true).append(true).open(&self.path)?;
        // Released when `file` is dropped.
        FileExt::lock_exclusive(&file)?;

        let mut content = String::new();
        file.read_to_string(&mut content)?;
        let parsed = self.parse(&content)?;

        if parsed.torn {
            file.set_len(parsed.valid_len as u64)?;
            tracing::info!(path = %self.path.display(), "Truncated torn final log line");
        }
        let kept = &content[..if parsed.torn { parsed.valid_len } else { content.len() }];
        let separator = if kept.is_empty() || kept.ends_with('\n') { "" } else { "\n" };

        let previous = parsed.artifacts.last().map_or(0, |a| a.sequence);
        let artifact = draft.into_artifact(previous + 1, Utc::now());
        let json = serde_json::to_string(&artifact)?;

        file.write_all(format!("{separator}{json}\n").as_bytes())?;
        file.sync_data()?;

        Ok(artifact)
    }

    fn load_all(&self) -> Result<Vec<KnowledgeArtifact>> {
        self.read_all()
    }
}
